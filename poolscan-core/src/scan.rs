// vim: tw=80
//! The scan controller
//!
//! A `Scan` owns the persistent state of the pool's scrub or resilver, and
//! drives it forward one txg at a time.  Each call to [`Scan::sync`] either
//! traverses more of the block tree, filling the per-device I/O queues, or
//! drains those queues ("clearing").  Progress is checkpointed only when the
//! queues are empty, so the on-disk bookmark never claims more progress than
//! has actually been read.

use std::{
    collections::BTreeMap,
    sync::{Arc, Condvar, Mutex},
    time::{Duration, Instant},
};

use futures::future;
use tokio::{runtime::Runtime, task::JoinHandle};
use tracing::{debug, error, info, warn};

use crate::{
    bookmark::*,
    ddt::DdtClass,
    errorscrub::ErrorScrub,
    governor::{self, MemLimits},
    io_queue::{IoCounters, IoQueue},
    phys::{self, *},
    pool::{DatasetInfo, ScanEvent, Services},
    prefetch::{Prefetcher, Throttle},
    stats::{BlockStats, PassStats},
    tunables::Tunables,
    types::*,
};

/// Pool-wide floor for bytes in flight outside of the sorted queues
pub(crate) const MIN_MAXINFLIGHT: u64 = 1 << 20;

/// Argument to [`Scan::pause_resume`]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PauseCmd {
    Pause,
    Resume,
}

/// Lets other threads wait for a scan to finish
#[derive(Clone, Debug, Default)]
pub struct Waiter(Arc<(Mutex<u64>, Condvar)>);

impl Waiter {
    /// Number of times that a scan has ended
    pub fn generation(&self) -> u64 {
        *self.0.0.lock().unwrap()
    }

    /// Wait until the generation exceeds `gen`, or the timeout expires.
    /// Returns true if it did.
    pub fn wait_past(&self, gen: u64, timeout: Duration) -> bool {
        let (mtx, cv) = &*self.0;
        let guard = mtx.lock().unwrap();
        let (guard, _) = cv.wait_timeout_while(guard, timeout, |g| *g <= gen)
            .unwrap();
        *guard > gen
    }

    fn notify(&self) {
        let (mtx, cv) = &*self.0;
        *mtx.lock().unwrap() += 1;
        cv.notify_all();
    }
}

/// Scrub, resilver, and error scrub controller for one pool
pub struct Scan {
    pub(crate) svc: Services,
    pub(crate) tunables: Arc<Tunables>,
    pub(crate) rt: Runtime,

    /// Live persistent state
    pub(crate) phys: ScanPhys,
    /// Persistent state as of the last checkpoint, plus structural changes
    pub(crate) phys_cached: ScanPhys,
    /// Datasets left to visit, with the txg to start visiting from
    pub(crate) ds_queue: BTreeMap<u64, TxgT>,
    pub(crate) es: ErrorScrub,

    /// The txg being synced
    pub(crate) txg: TxgT,
    pub(crate) sync_start: Instant,
    pub(crate) suspending: bool,
    pub(crate) visited_this_txg: u64,
    pub(crate) holes_this_txg: u64,
    pub(crate) lt_min_this_txg: u64,
    pub(crate) gt_max_this_txg: u64,
    pub(crate) ddt_contained_this_txg: u64,
    pub(crate) objsets_visited_this_txg: u64,

    /// Reads are sorted through the per-device queues
    pub(crate) is_sorted: bool,
    /// Draining the queues instead of traversing
    pub(crate) clearing: bool,
    /// Draining the queues in order to write a checkpoint
    pub(crate) checkpointing: bool,
    pub(crate) last_checkpoint: Option<Instant>,
    /// The scan will be done once this txg syncs, if nonzero
    pub(crate) done_txg: TxgT,
    /// Restart the scan in this txg, if nonzero
    pub(crate) restart_txg: TxgT,

    /// Top-level devices, and how many data disks each has
    pub(crate) vdevs: BTreeMap<u64, u64>,
    pub(crate) queues: BTreeMap<u64, Arc<IoQueue>>,
    pub(crate) counters: Arc<IoCounters>,
    pub(crate) throttle: Arc<Throttle>,
    pub(crate) prefetch: Option<Prefetcher>,
    /// Reads issued outside of the sorted queues
    pub(crate) immediate: Vec<JoinHandle<()>>,

    pub(crate) blkstats: Option<BlockStats>,
    pub(crate) pass: PassStats,
    waiter: Waiter,
}

impl Scan {
    /// Create a controller for a pool that has never been scanned
    pub fn new(svc: Services, tunables: Tunables) -> Result<Self> {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .enable_time()
            .thread_name("scan")
            .build()?;
        Ok(Scan {
            svc,
            tunables: Arc::new(tunables),
            rt,
            phys: ScanPhys::default(),
            phys_cached: ScanPhys::default(),
            ds_queue: BTreeMap::new(),
            es: ErrorScrub::default(),
            txg: TxgT(0),
            sync_start: Instant::now(),
            suspending: false,
            visited_this_txg: 0,
            holes_this_txg: 0,
            lt_min_this_txg: 0,
            gt_max_this_txg: 0,
            ddt_contained_this_txg: 0,
            objsets_visited_this_txg: 0,
            is_sorted: false,
            clearing: false,
            checkpointing: false,
            last_checkpoint: None,
            done_txg: TxgT(0),
            restart_txg: TxgT(0),
            vdevs: BTreeMap::new(),
            queues: BTreeMap::new(),
            counters: Arc::new(IoCounters::default()),
            throttle: Arc::new(Throttle::new(MIN_MAXINFLIGHT)),
            prefetch: None,
            immediate: Vec::new(),
            blkstats: None,
            pass: PassStats::default(),
            waiter: Waiter::default(),
        })
    }

    /// Load the persistent scan state of an imported pool.
    ///
    /// `txg` is the first txg that will be synced.
    pub fn open(svc: Services, tunables: Tunables, txg: TxgT) -> Result<Self>
    {
        let mut scan = Scan::new(svc, tunables)?;
        scan.txg = txg;
        if let Some(buf) = scan.svc.store.lookup(SCAN_RECORD)? {
            match phys::decode::<ScanPhys>(&buf) {
                Ok(p) => scan.phys = p,
                Err(Error::EOPNOTSUPP) => {
                    warn!("scan state was written by newer software; \
                          restarting");
                    scan.restart_txg = txg;
                }
                Err(e) => return Err(e)
            }
        }
        if let Some(buf) = scan.svc.store.lookup(ERRORSCRUB_RECORD)? {
            match phys::decode::<ErrorScrubPhys>(&buf) {
                Ok(p) => scan.es.phys = p,
                Err(Error::EOPNOTSUPP) => {
                    warn!("error scrub state was written by newer \
                          software; ignoring");
                }
                Err(e) => return Err(e)
            }
        }
        if scan.phys.is_running() && scan.phys.queue_obj != 0 {
            scan.ds_queue = scan.read_disk_queue()?;
        }
        scan.phys_cached = scan.phys;
        if scan.phys.is_running() {
            info!(func = ?scan.phys.func, bookmark = ?scan.phys.bookmark,
                queued = scan.ds_queue.len(), "resuming scan after import");
        }
        Ok(scan)
    }

    /// The current persistent scan state
    pub fn phys(&self) -> &ScanPhys {
        &self.phys
    }

    pub fn is_scanning(&self) -> bool {
        self.phys.is_running()
    }

    pub fn is_paused(&self) -> bool {
        self.phys.is_paused()
    }

    pub fn is_scrubbing(&self) -> bool {
        self.is_scanning() && self.phys.func == ScanFunc::Scrub
    }

    pub fn is_resilvering(&self) -> bool {
        self.is_scanning() && self.phys.func == ScanFunc::Resilver
    }

    pub fn tunables(&self) -> &Tunables {
        &self.tunables
    }

    pub fn waiter(&self) -> Waiter {
        self.waiter.clone()
    }

    pub(crate) fn notify_waiters(&self) {
        self.waiter.notify();
    }

    /// Minimum time to spend scanning in each txg
    pub(crate) fn min_time(&self) -> Duration {
        if self.phys.func == ScanFunc::Resilver {
            self.tunables.resilver_min_time()
        } else {
            self.tunables.scrub_min_time()
        }
    }

    /// Start a scan, or resume a paused one.
    pub fn start(&mut self, func: ScanFunc, txg: TxgT) -> Result<()> {
        self.txg = txg;
        match func {
            ScanFunc::None => Err(Error::EINVAL),
            ScanFunc::Resilver => {
                if self.svc.pool.resilver_needed().is_none() {
                    debug!("resilver requested, but nothing needs it");
                    return Ok(());
                }
                self.resilver_restart(TxgT(0));
                Ok(())
            }
            ScanFunc::ErrorScrub => {
                if self.es.phys.is_paused() {
                    self.errorscrub_pause_resume(PauseCmd::Resume)?;
                    self.svc.pool.notify(ScanEvent::ErrorScrubResumed);
                    Ok(())
                } else {
                    self.errorscrub_setup()
                }
            }
            ScanFunc::Scrub if self.is_paused() => {
                self.pause_resume(PauseCmd::Resume)?;
                self.svc.pool.notify(ScanEvent::ScrubResumed);
                Ok(())
            }
            ScanFunc::Scrub => self.setup(func)
        }
    }

    /// Restart the scan as a resilver in `txg`, or in the next txg if `txg`
    /// is zero.
    pub fn resilver_restart(&mut self, txg: TxgT) {
        self.restart_txg = if txg == TxgT(0) { self.txg + 1 } else { txg };
        info!(txg = %self.restart_txg, "restarting resilver");
    }

    fn restarting(&self) -> bool {
        self.restart_txg != TxgT(0) && self.restart_txg <= self.txg
    }

    /// Begin a new scan
    pub fn setup(&mut self, func: ScanFunc) -> Result<()> {
        self.setup_check()?;
        self.setup_sync(func)
    }

    fn setup_check(&self) -> Result<()> {
        if self.is_scanning() || self.svc.pool.rebuild_active() {
            return Err(Error::EBUSY);
        }
        Ok(())
    }

    pub(crate) fn setup_sync(&mut self, func: ScanFunc) -> Result<()> {
        debug_assert!(!self.is_scanning());
        debug_assert!(func == ScanFunc::Scrub || func == ScanFunc::Resilver);
        let pool = self.svc.pool.clone();

        // A fresh scan discards any error scrub state
        self.es.phys = ErrorScrubPhys::default();
        self.errorscrub_sync_state()?;

        self.phys = ScanPhys {
            func,
            state: ScanState::Scanning,
            min_txg: TxgT(0),
            max_txg: self.txg,
            ddt_class_max: self.tunables.scrub_ddt_class_max,
            start_time: Timestamp::now(),
            to_examine: pool.allocated(),
            ..Default::default()
        };
        self.restart_txg = TxgT(0);
        self.done_txg = TxgT(0);
        self.last_checkpoint = None;
        self.checkpointing = false;
        self.clearing = false;
        self.pass = PassStats::new();
        self.counters.take();

        let event = match (func, pool.resilver_needed()) {
            (ScanFunc::Resilver, Some((min, max))) => {
                self.phys.min_txg = min;
                self.phys.max_txg = max;
                ScanEvent::ResilverStart
            }
            (ScanFunc::Resilver, None) => ScanEvent::ResilverStart,
            _ => ScanEvent::ScrubStart
        };
        // An incremental scan only needs the dedup table's ditto class for
        // correctness.  The tree walk prunes the rest faster.
        if self.phys.min_txg > TxgT::INITIAL {
            self.phys.ddt_class_max = DdtClass::Ditto;
        }
        pool.notify(event);

        self.blkstats = Some(BlockStats::default());
        self.ds_queue.clear();
        self.phys.queue_obj = self.svc.store.create_object()?;
        self.phys_cached = self.phys;
        self.sync_state(SyncType::Mandatory)?;
        info!(?func, min_txg = %self.phys.min_txg, max_txg = %self.phys.max_txg,
            "scan setup");
        Ok(())
    }

    /// End the scan, whether or not it completed
    pub(crate) fn done(&mut self, complete: bool) -> Result<()> {
        if self.phys.queue_obj != 0 {
            self.svc.store.free_object(self.phys.queue_obj)?;
            self.phys.queue_obj = 0;
        }
        self.ds_queue.clear();
        self.phys.flags.set_scrub_paused(false);

        if !self.is_scanning() {
            // Restarted from a stopped state
            return Ok(());
        }

        if self.is_sorted {
            for q in self.queues.values() {
                q.clear();
            }
            self.queues.clear();
            self.is_sorted = false;
        }
        self.clearing = false;
        self.checkpointing = false;
        self.done_txg = TxgT(0);
        self.wait_immediate();
        self.fold_counters();

        self.phys.state = if complete {
            ScanState::Finished
        } else {
            ScanState::Canceled
        };
        self.notify_waiters();
        if self.restarting() {
            info!(errors = self.phys.errors, "scan aborted, restarting");
        } else if complete {
            info!(errors = self.phys.errors, "scan done");
        } else {
            info!(errors = self.phys.errors, "scan cancelled");
        }

        let pool = self.svc.pool.clone();
        if complete {
            pool.dtl_reassess(self.txg, self.phys.max_txg, true);
            pool.notify(if self.phys.func == ScanFunc::Resilver {
                ScanEvent::ResilverFinish
            } else {
                ScanEvent::ScrubFinish
            });
        } else {
            pool.dtl_reassess(self.txg, TxgT(0), true);
        }
        self.svc.errlog.rotate();
        self.phys.end_time = Timestamp::now();
        Ok(())
    }

    /// Stop the running scan, or error scrub
    pub fn cancel(&mut self, txg: TxgT) -> Result<()> {
        self.txg = txg;
        if !self.is_scanning() && self.es.phys.is_running() {
            return self.errorscrub_cancel();
        }
        if !self.is_scanning() {
            return Err(Error::ENOENT);
        }
        self.done(false)?;
        self.sync_state(SyncType::Mandatory)?;
        self.svc.pool.notify(ScanEvent::ScrubAbort);
        Ok(())
    }

    /// Pause or resume a scrub, or an error scrub
    pub fn pause_resume(&mut self, cmd: PauseCmd) -> Result<()> {
        if self.es.phys.is_running() {
            return self.errorscrub_pause_resume(cmd);
        }
        match cmd {
            PauseCmd::Pause => {
                if !self.is_scrubbing() {
                    return Err(Error::ENOENT);
                }
                if self.is_paused() {
                    return Err(Error::EBUSY);
                }
                self.pass.scrub_pause = Timestamp::now();
                self.phys.flags.set_scrub_paused(true);
                self.phys_cached.flags.set_scrub_paused(true);
                self.sync_state(SyncType::Cached)?;
                self.svc.pool.notify(ScanEvent::ScrubPaused);
                self.notify_waiters();
                info!("scrub paused");
            }
            PauseCmd::Resume => {
                if self.is_paused() {
                    if !self.pass.scrub_pause.is_zero() {
                        self.pass.scrub_spent_paused +=
                            Timestamp::now().since(self.pass.scrub_pause);
                    }
                    self.pass.scrub_pause = Timestamp(0);
                    self.phys.flags.set_scrub_paused(false);
                    self.phys_cached.flags.set_scrub_paused(false);
                    self.sync_state(SyncType::Cached)?;
                    info!("scrub resumed");
                }
            }
        }
        Ok(())
    }

    /// Sync the scan's progress for one txg.
    ///
    /// Must be called once for each sync pass of every txg, from outside of
    /// any async runtime.  Only the first pass does anything.
    #[tracing::instrument(skip(self))]
    pub fn sync(&mut self, txg: TxgT, pass: u32) -> Result<()> {
        if pass > 1 {
            return Ok(());
        }
        self.txg = txg;
        self.scan_sync()?;
        self.errorscrub_sync()
    }

    fn scan_sync(&mut self) -> Result<()> {
        let pool = self.svc.pool.clone();

        if self.restarting() {
            let func = if pool.resilver_needed().is_some() {
                ScanFunc::Resilver
            } else {
                ScanFunc::Scrub
            };
            info!(?func, txg = %self.txg, "restarting scan");
            self.done(false)?;
            self.setup_sync(func)?;
        }

        if pool.shutting_down() {
            return Ok(());
        }

        self.reset_txg_stats();
        self.sync_start = Instant::now();

        // Finish deferred frees before scanning, so the traversal never
        // races with disappearing blocks
        if !self.free_sync()? {
            return Ok(());
        }

        if !self.is_scanning() || self.is_paused() {
            return Ok(());
        }

        // Let an imported pool settle before resuming
        if self.txg < pool.first_txg() + self.tunables.import_wait_txgs {
            return Ok(());
        }

        if self.tunables.suspend_progress {
            debug!("scan progress suspended");
            return Ok(());
        }

        self.refresh_vdevs();

        // A scan may switch from unsorted to sorted at any time, but not
        // back.
        if !self.tunables.legacy {
            self.is_sorted = true;
            self.last_checkpoint.get_or_insert_with(Instant::now);
        }

        if self.is_sorted {
            let since_checkpoint = self.last_checkpoint
                .map(|t| t.elapsed())
                .unwrap_or_default();
            if self.checkpointing ||
                since_checkpoint > self.tunables.checkpoint_interval()
            {
                if !self.checkpointing {
                    debug!("begin scan checkpoint");
                }
                self.checkpointing = true;
                self.clearing = true;
            } else {
                let clear = self.should_clear();
                if clear && !self.clearing {
                    debug!("begin scan clearing");
                } else if !clear && self.clearing {
                    debug!("finish scan clearing");
                }
                self.clearing = clear;
            }
        }

        if !self.clearing && self.done_txg == TxgT(0) {
            self.traverse_pass()?;
        } else if self.is_sorted && self.queued_ios() > 0 {
            self.issue_pass();
        }

        self.fold_counters();
        let mut sync_type = SyncType::Optional;
        // Once traversal is complete, the scan is done as soon as the
        // queues are empty, whether or not a checkpoint is pending.
        if self.done_txg != TxgT(0) && self.done_txg <= self.txg &&
            (!self.is_sorted || self.queued_ios() == 0)
        {
            self.done(true)?;
            sync_type = SyncType::Mandatory;
        }
        self.sync_state(sync_type)
    }

    /// One txg's worth of metadata traversal
    fn traverse_pass(&mut self) -> Result<()> {
        let maxinflight = (self.tunables.vdev_limit *
                           self.vdevs.values().sum::<u64>())
            .max(MIN_MAXINFLIGHT);
        self.throttle.set_max(maxinflight);

        if !self.tunables.no_scrub_prefetch {
            self.prefetch = Some(Prefetcher::start(self.svc.blocks.clone(),
                self.throttle.clone(), self.rt.handle().clone())?);
        }
        self.visit();
        if let Some(pf) = self.prefetch.take() {
            pf.stop();
        }
        self.wait_immediate();

        info!(txg = %self.txg,
            visited = self.visited_this_txg,
            objsets = self.objsets_visited_this_txg,
            holes = self.holes_this_txg,
            lt_min = self.lt_min_this_txg,
            gt_max = self.gt_max_this_txg,
            ddt_contained = self.ddt_contained_this_txg,
            queued = self.queued_ios(),
            suspending = self.suspending,
            elapsed_ms = self.sync_start.elapsed().as_millis() as u64,
            "traversal pass");

        if !self.suspending {
            self.done_txg = self.txg + 1;
            if self.is_sorted {
                self.checkpointing = true;
                self.clearing = true;
                self.pass = PassStats::new();
            }
            info!(txg = %self.txg, "scan traversal complete");
        }
        Ok(())
    }

    fn reset_txg_stats(&mut self) {
        self.suspending = false;
        self.visited_this_txg = 0;
        self.holes_this_txg = 0;
        self.lt_min_this_txg = 0;
        self.gt_max_this_txg = 0;
        self.ddt_contained_this_txg = 0;
        self.objsets_visited_this_txg = 0;
    }

    /// Process deferred frees.  Returns true if all of them are done.
    fn free_sync(&mut self) -> Result<bool> {
        let frees = self.svc.frees.clone();
        let mut n = 0u64;
        let finished = loop {
            if self.free_should_suspend(n) {
                break false;
            }
            match frees.free_next()? {
                Some(bp) => {
                    self.block_freed(&bp);
                    n += 1;
                }
                None => break true
            }
        };
        if n > 0 {
            debug!(freed = n, finished, "processed deferred frees");
        }
        Ok(finished)
    }

    fn free_should_suspend(&self, n: u64) -> bool {
        let pool = &self.svc.pool;
        let elapsed = self.sync_start.elapsed();
        n >= self.tunables.async_block_max_blocks ||
            elapsed > self.tunables.txg_timeout() ||
            (elapsed > self.tunables.free_min_time() && pool.sync_waiting()) ||
            pool.shutting_down()
    }

    /// Look up the pool's top-level devices
    fn refresh_vdevs(&mut self) {
        self.vdevs = self.svc.pool.top_level_vdevs()
            .into_iter()
            .map(|v| (v.id, v.data_disks))
            .collect();
    }

    /// Should traversal stop so the queues can drain?
    pub(crate) fn should_clear(&self) -> bool {
        if self.queues.is_empty() {
            return false;
        }
        let limits = MemLimits::new(&*self.svc.pool, &self.tunables);
        let mused = governor::mem_used(self.queues.values());
        limits.should_clear(mused, self.clearing)
    }

    /// Wait for every read issued outside of the sorted queues
    pub(crate) fn wait_immediate(&mut self) {
        if self.immediate.is_empty() {
            return;
        }
        let reads = std::mem::take(&mut self.immediate);
        self.rt.block_on(future::join_all(reads));
    }

    /// Fold I/O statistics gathered by completion handlers into the
    /// persistent state
    pub(crate) fn fold_counters(&mut self) {
        let (issued, processed, errors) = self.counters.take();
        self.phys.issued += issued;
        self.phys.processed += processed;
        self.phys.errors += errors;
        self.pass.issued += issued;
    }

    /// Write the persistent state, if that is safe.
    ///
    /// The full state is only written while the I/O queues are empty.
    /// Otherwise, a `Cached` sync writes the last checkpoint's state, updated
    /// for structural changes.
    pub(crate) fn sync_state(&mut self, sync_type: SyncType) -> Result<()> {
        let pending = self.queued_ios();
        debug_assert!(sync_type != SyncType::Mandatory || pending == 0,
            "mandatory checkpoint with {} queued reads", pending);
        if pending == 0 {
            self.fold_counters();
            if self.phys.queue_obj != 0 {
                let buf = phys::encode(&self.ds_queue)?;
                self.svc.store.write_object(self.phys.queue_obj, &buf)?;
            }
            self.svc.store.update(SCAN_RECORD, &phys::encode(&self.phys)?)?;
            self.phys_cached = self.phys;
            if self.checkpointing {
                debug!(bookmark = ?self.phys.bookmark, "finish scan checkpoint");
            }
            self.checkpointing = false;
            self.last_checkpoint = Some(Instant::now());
        } else if sync_type == SyncType::Cached {
            self.svc.store.update(SCAN_RECORD,
                &phys::encode(&self.phys_cached)?)?;
        }
        Ok(())
    }

    pub(crate) fn read_disk_queue(&self) -> Result<BTreeMap<u64, TxgT>> {
        let buf = self.svc.store.read_object(self.phys.queue_obj)?;
        if buf.is_empty() {
            Ok(BTreeMap::new())
        } else {
            phys::decode(&buf)
        }
    }

    /// Apply a structural change to the persisted dataset queue
    fn update_disk_queue<F>(&self, f: F) -> Result<()>
        where F: FnOnce(&mut BTreeMap<u64, TxgT>) -> bool
    {
        if self.phys.queue_obj == 0 {
            return Ok(());
        }
        let mut q = self.read_disk_queue()?;
        if f(&mut q) {
            let buf = phys::encode(&q)?;
            self.svc.store.write_object(self.phys.queue_obj, &buf)?;
        }
        Ok(())
    }

    /// A dataset is being destroyed.  Make sure the scan won't look for it.
    pub fn ds_destroyed(&mut self, ds: &DatasetInfo) -> Result<()> {
        if !self.is_scanning() {
            return Ok(());
        }
        for p in [&mut self.phys, &mut self.phys_cached] {
            if p.bookmark.objset == ds.obj {
                if ds.is_snapshot {
                    // Traverse the next snapshot again, to cover the blocks
                    // that this one shared with it.
                    p.bookmark.objset = ds.next_snap_obj;
                    p.flags.set_visit_ds_again(true);
                } else {
                    p.bookmark = Bookmark::new(DESTROYED_OBJSET, 0, 0, 0);
                }
                debug!(ds = ds.obj, bookmark = ?p.bookmark,
                    "destroying the dataset being traversed");
            }
        }
        let replace = |q: &mut BTreeMap<u64, TxgT>| {
            match q.remove(&ds.obj) {
                Some(mintxg) => {
                    // Keep the same mintxg.  It could be greater than the
                    // next snapshot's creation txg if the previous snapshot
                    // was destroyed too.
                    if ds.is_snapshot {
                        q.insert(ds.next_snap_obj, mintxg);
                    }
                    true
                }
                None => false
            }
        };
        if replace(&mut self.ds_queue) {
            debug!(ds = ds.obj, next = ds.next_snap_obj,
                "destroyed dataset was queued");
        }
        self.update_disk_queue(replace)?;
        self.sync_state(SyncType::Cached)
    }

    /// `head` was just snapshotted as `snap`.  Blocks the scan expected to
    /// find in `head` now belong to `snap`.
    pub fn ds_snapshotted(&mut self, head: u64, snap: u64) -> Result<()> {
        if !self.is_scanning() {
            return Ok(());
        }
        for p in [&mut self.phys, &mut self.phys_cached] {
            if p.bookmark.objset == head {
                p.bookmark.objset = snap;
                debug!(head, snap, "snapshotting the dataset being traversed");
            }
        }
        let replace = |q: &mut BTreeMap<u64, TxgT>| {
            match q.remove(&head) {
                Some(mintxg) => {
                    q.insert(snap, mintxg);
                    true
                }
                None => false
            }
        };
        replace(&mut self.ds_queue);
        self.update_disk_queue(replace)?;
        self.sync_state(SyncType::Cached)
    }

    /// A clone was promoted, swapping the contents of two datasets
    pub fn ds_clone_swapped(&mut self, ds1: u64, ds2: u64) -> Result<()> {
        if !self.is_scanning() {
            return Ok(());
        }
        for p in [&mut self.phys, &mut self.phys_cached] {
            if p.bookmark.objset == ds1 {
                p.bookmark.objset = ds2;
            } else if p.bookmark.objset == ds2 {
                p.bookmark.objset = ds1;
            }
        }
        // The on-disk queue is an older version of the in-memory one, so
        // the swap must be applied to each independently.
        let swap = |q: &mut BTreeMap<u64, TxgT>| {
            match (q.get(&ds1).copied(), q.get(&ds2).copied()) {
                (Some(_), Some(_)) | (None, None) => false,
                (Some(mintxg), None) => {
                    q.remove(&ds1);
                    q.insert(ds2, mintxg);
                    true
                }
                (None, Some(mintxg)) => {
                    q.remove(&ds2);
                    q.insert(ds1, mintxg);
                    true
                }
            }
        };
        swap(&mut self.ds_queue);
        self.update_disk_queue(swap)?;
        self.sync_state(SyncType::Cached)
    }
}

impl Drop for Scan {
    fn drop(&mut self) {
        if let Some(pf) = self.prefetch.take() {
            pf.stop();
        }
        if !self.immediate.is_empty() {
            error!(reads = self.immediate.len(),
                "scan dropped with reads in flight");
        }
    }
}

// LCOV_EXCL_STOP
