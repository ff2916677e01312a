// vim: tw=80
//! Metadata read-ahead for the traversal
//!
//! While the sync thread walks the block tree, one background thread reads
//! the metadata blocks that the walk will need soon, in bookmark order.  Each
//! completed read is expanded into prefetch requests for the block's
//! children.  The prefetcher lives for a single traversal pass.

use std::{
    cmp::Ordering,
    collections::BinaryHeap,
    sync::{
        Arc,
        Condvar,
        Mutex,
        atomic::{self, AtomicBool}
    },
    thread,
    time::Duration
};

use tokio::runtime::Handle;
use tracing::{debug, trace};

use crate::{
    bookmark::{self, *},
    pool::{BlockContents, BlockSource, Dnode},
    types::*
};

/// Limits the bytes in flight for reads that bypass the sorted queues
#[derive(Debug, Default)]
pub struct Throttle {
    state: Mutex<ThrottleState>,
    cv: Condvar,
}

#[derive(Debug, Default)]
struct ThrottleState {
    inflight: u64,
    max: u64,
}

impl Throttle {
    pub fn new(max: u64) -> Self {
        Throttle {
            state: Mutex::new(ThrottleState{inflight: 0, max}),
            cv: Condvar::new()
        }
    }

    pub fn set_max(&self, max: u64) {
        self.state.lock().unwrap().max = max;
        self.cv.notify_all();
    }

    /// Reserve `bytes`, blocking while the limit is already reached
    pub fn acquire(&self, bytes: u64) {
        let mut st = self.state.lock().unwrap();
        while st.inflight > 0 && st.inflight >= st.max {
            st = self.cv.wait(st).unwrap();
        }
        st.inflight += bytes;
    }

    /// Like `acquire`, but give up if `stop` gets set.  Returns true if the
    /// bytes were reserved.
    pub fn acquire_unless(&self, bytes: u64, stop: &AtomicBool) -> bool {
        let mut st = self.state.lock().unwrap();
        loop {
            if stop.load(atomic::Ordering::Acquire) {
                return false;
            }
            if st.inflight == 0 || st.inflight < st.max {
                st.inflight += bytes;
                return true;
            }
            st = self.cv.wait_timeout(st, Duration::from_millis(10))
                .unwrap()
                .0;
        }
    }

    pub fn release(&self, bytes: u64) {
        let mut st = self.state.lock().unwrap();
        st.inflight = st.inflight.saturating_sub(bytes);
        self.cv.notify_all();
    }

    /// Block until nothing is in flight
    pub fn wait_idle(&self) {
        let mut st = self.state.lock().unwrap();
        while st.inflight > 0 {
            st = self.cv.wait(st).unwrap();
        }
    }

    pub fn inflight(&self) -> u64 {
        self.state.lock().unwrap().inflight
    }

    fn wake(&self) {
        self.cv.notify_all();
    }
}

#[derive(Clone, Copy, Debug)]
struct PrefetchItem {
    bp: BlockPtr,
    zb: Bookmark,
    /// Geometry of the dnode that owns the block, or `None` for an objset
    /// root
    dnode: Option<DnodeGeometry>,
}

impl PrefetchItem {
    fn geom(&self) -> DnodeGeometry {
        self.dnode.unwrap_or_default()
    }

    fn raw(&self) -> (u64, u64, i64, u64) {
        (self.zb.objset, self.zb.object, self.zb.level, self.zb.blkid)
    }
}

impl Ord for PrefetchItem {
    /// The heap pops the greatest item, and we want the earliest bookmark
    fn cmp(&self, other: &Self) -> Ordering {
        bookmark::compare(other.geom(), &other.zb, self.geom(), &self.zb)
            .then_with(|| other.raw().cmp(&self.raw()))
    }
}

impl PartialOrd for PrefetchItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for PrefetchItem {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for PrefetchItem {}

#[derive(Debug, Default)]
struct State {
    queue: BinaryHeap<PrefetchItem>,
    /// Blocks born at or before this txg won't be visited
    cur_min: TxgT,
    /// Position that the traversal will resume from
    bookmark: Bookmark,
    /// Reads issued but not yet expanded
    outstanding: usize,
}

impl State {
    /// Will the traversal need this block?
    fn wanted(&self, bp: &BlockPtr, zb: &Bookmark, dnode: Option<DnodeGeometry>)
        -> bool
    {
        if bp.is_hole() || bp.birth <= self.cur_min || !bp.is_metadata() {
            return false;
        }
        if zb.objset != self.bookmark.objset || zb.is_accounting() {
            return true;
        }
        !subtree_completed(dnode, zb, &self.bookmark)
    }
}

struct Shared {
    state: Mutex<State>,
    cv: Condvar,
    stop: AtomicBool,
    throttle: Arc<Throttle>,
    blocks: Arc<dyn BlockSource>,
}

impl Shared {
    fn push(&self, st: &mut State, bp: &BlockPtr, zb: Bookmark,
        dnode: Option<DnodeGeometry>)
    {
        if st.wanted(bp, &zb, dnode) {
            st.queue.push(PrefetchItem{bp: *bp, zb, dnode});
        }
    }

    fn push_dnode(&self, st: &mut State, dn: &Dnode, objset: u64, object: u64)
    {
        let geom = Some(dn.geometry());
        let level = i64::from(dn.nlevels) - 1;
        for (i, bp) in dn.blkptr.iter().enumerate() {
            let zb = Bookmark::new(objset, object, level, i as u64);
            self.push(st, bp, zb, geom);
        }
        if let Some(spill) = &dn.spill {
            let zb = Bookmark::new(objset, object, 0, SPILL_BLKID);
            self.push(st, spill, zb, geom);
        }
    }

    /// Queue prefetches for the children of a block that was just read
    fn expand(&self, item: &PrefetchItem, contents: BlockContents) {
        let mut st = self.state.lock().unwrap();
        let zb = &item.zb;
        match contents {
            BlockContents::Indirect(children) => {
                let epb = children.len() as u64;
                for (i, cbp) in children.iter().enumerate() {
                    let czb = Bookmark::new(zb.objset, zb.object, zb.level - 1,
                        zb.blkid * epb + i as u64);
                    self.push(&mut st, cbp, czb, item.dnode);
                }
            }
            BlockContents::Dnodes(dnodes) => {
                let epb = dnodes.len() as u64;
                for (i, dn) in dnodes.iter().enumerate() {
                    if let Some(dn) = dn {
                        let object = zb.blkid * epb + i as u64;
                        self.push_dnode(&mut st, dn, zb.objset, object);
                    }
                }
            }
            BlockContents::Objset(osp) => {
                self.push_dnode(&mut st, &osp.meta_dnode, zb.objset,
                    META_DNODE_OBJECT);
                let acct = [
                    (&osp.userused, USERUSED_OBJECT),
                    (&osp.groupused, GROUPUSED_OBJECT),
                    (&osp.projectused, PROJECTUSED_OBJECT),
                ];
                for (dn, object) in acct {
                    if let Some(dn) = dn {
                        self.push_dnode(&mut st, dn, zb.objset, object);
                    }
                }
            }
        }
        self.cv.notify_all();
    }

    fn stopped(&self) -> bool {
        self.stop.load(atomic::Ordering::Acquire)
    }

    fn worker(self: Arc<Self>, handle: Handle) {
        loop {
            let item = {
                let mut st = self.state.lock().unwrap();
                loop {
                    if self.stopped() {
                        return;
                    }
                    if let Some(item) = st.queue.pop() {
                        st.outstanding += 1;
                        break item;
                    }
                    st = self.cv.wait(st).unwrap();
                }
            };
            let bytes = item.bp.lsize;
            if !self.throttle.acquire_unless(bytes, &self.stop) {
                self.finish_one();
                return;
            }
            let shared = self.clone();
            handle.spawn_blocking(move || {
                match shared.blocks.read_block(&item.bp, &item.zb) {
                    Ok(contents) if !shared.stopped() =>
                        shared.expand(&item, contents),
                    Ok(_) => (),
                    Err(e) => trace!(zb = ?item.zb, error = ?e,
                        "prefetch read failed")
                }
                shared.throttle.release(bytes);
                shared.finish_one();
            });
        }
    }

    fn finish_one(&self) {
        let mut st = self.state.lock().unwrap();
        st.outstanding -= 1;
        self.cv.notify_all();
    }
}

/// Handle to a running prefetch thread
pub struct Prefetcher {
    shared: Arc<Shared>,
    thread: Option<thread::JoinHandle<()>>,
}

impl Prefetcher {
    /// Start prefetching.  Reads run as blocking tasks on `handle`.
    pub fn start(blocks: Arc<dyn BlockSource>, throttle: Arc<Throttle>,
        handle: Handle) -> Result<Self>
    {
        let shared = Arc::new(Shared {
            state: Mutex::new(State::default()),
            cv: Condvar::new(),
            stop: AtomicBool::new(false),
            throttle,
            blocks
        });
        let s2 = shared.clone();
        let thread = thread::Builder::new()
            .name("scan_prefetch".to_owned())
            .spawn(move || s2.worker(handle))?;
        Ok(Prefetcher{shared, thread: Some(thread)})
    }

    /// Tell the prefetcher where the traversal stands
    pub fn set_position(&self, cur_min: TxgT, bookmark: Bookmark) {
        let mut st = self.shared.state.lock().unwrap();
        st.cur_min = cur_min;
        st.bookmark = bookmark;
    }

    /// Request a read of `bp`, if the traversal will need it
    pub fn enqueue(&self, bp: &BlockPtr, zb: &Bookmark,
        dnode: Option<DnodeGeometry>)
    {
        let mut st = self.shared.state.lock().unwrap();
        self.shared.push(&mut st, bp, *zb, dnode);
        self.shared.cv.notify_all();
    }

    /// Request reads of a dnode's top-level blocks
    pub fn enqueue_dnode(&self, dn: &Dnode, objset: u64, object: u64) {
        let mut st = self.shared.state.lock().unwrap();
        self.shared.push_dnode(&mut st, dn, objset, object);
        self.shared.cv.notify_all();
    }

    /// Stop the prefetch thread, discard anything not yet issued, and wait
    /// for issued reads to finish.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let thread = match self.thread.take() {
            Some(t) => t,
            None => return
        };
        self.shared.stop.store(true, atomic::Ordering::Release);
        self.shared.cv.notify_all();
        self.shared.throttle.wake();
        if thread.join().is_err() {
            debug!("prefetch thread panicked");
        }
        let mut st = self.shared.state.lock().unwrap();
        let discarded = st.queue.len();
        st.queue.clear();
        while st.outstanding > 0 {
            st = self.shared.cv.wait(st).unwrap();
        }
        trace!(discarded, "prefetcher stopped");
    }
}

impl Drop for Prefetcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// LCOV_EXCL_STOP
