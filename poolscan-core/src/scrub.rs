// vim: tw=80
//! The scrub and resilver block callback, and I/O admission
//!
//! Every block that the traversal selects is either queued by device address
//! for a later sorted issuing pass, or read immediately through the pool-wide
//! in-flight throttle.

use std::sync::{Arc, atomic::Ordering};

use futures::future;
use tracing::{debug, info_span, trace};
use tracing_futures::Instrument;

use crate::{
    bookmark::*,
    governor,
    io_queue::{IoQueue, IssueContext, ScanIo},
    phys::ScanFunc,
    scan::Scan,
    types::*,
};

/// Who accounts for an immediate read's completion
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum ReadKind {
    Scan,
    ErrorScrub,
}

impl Scan {
    /// Decide whether one block needs a verification read, and schedule it
    pub(crate) fn scan_cb(&mut self, bp: &BlockPtr, zb: &Bookmark) {
        if let Some(stats) = self.blkstats.as_mut() {
            stats.count_block(bp);
        }
        let phys_birth = bp.physical_birth();
        if bp.embedded ||
            phys_birth <= self.phys.min_txg ||
            phys_birth >= self.phys.max_txg
        {
            self.phys.skipped += bp.asize();
            return;
        }

        let mut flags = IoFlags::default();
        flags.set_scan_thread(true);
        flags.set_raw(true);
        flags.set_canfail(true);
        let mut needs_io = match self.phys.func {
            ScanFunc::Scrub => {
                flags.set_scrub(true);
                true
            }
            _ => {
                flags.set_resilver(true);
                false
            }
        };
        // Intent log blocks are expected to fail
        if zb.level == ZIL_LEVEL {
            flags.set_speculative(true);
        }

        for dva in bp.dvas() {
            self.phys.examined += dva.asize;
            self.pass.examined += dva.asize;
            // Gang members may live anywhere.  The scan's txg range is the
            // best estimate available, and that was already checked.
            if !needs_io {
                needs_io = dva.gang ||
                    self.svc.pool.need_resilver(dva, bp.psize, phys_birth);
            }
        }

        if needs_io && !self.tunables.no_scrub_io {
            self.enqueue(bp, flags, zb);
        } else {
            self.phys.skipped += bp.asize();
        }
    }

    fn enqueue(&mut self, bp: &BlockPtr, flags: IoFlags, zb: &Bookmark) {
        // Gang blocks are hard to issue sequentially
        if !self.is_sorted || bp.is_gang() {
            self.exec_immediate(bp, flags, zb, ReadKind::Scan);
            return;
        }
        for (i, dva) in bp.dva.iter().enumerate() {
            if dva.is_empty() {
                continue;
            }
            let q = self.queue_for(dva.vdev);
            let sio = ScanIo::new(bp, i, zb, flags);
            if !q.insert(sio) {
                trace!(vdev = dva.vdev, offset = dva.offset,
                    "read already queued");
            }
        }
    }

    /// The queue for a top-level device, created on first use
    fn queue_for(&mut self, vdev: u64) -> Arc<IoQueue> {
        let data_disks = self.vdevs.get(&vdev).copied().unwrap_or(1);
        let tunables = self.tunables.clone();
        self.queues.entry(vdev)
            .or_insert_with(|| {
                debug!(vdev, data_disks, "creating scan queue");
                Arc::new(IoQueue::new(vdev, data_disks, &tunables))
            }).clone()
    }

    /// Read a block right away, bypassing the sorted queues.  Blocks while
    /// too many bytes are already in flight.
    pub(crate) fn exec_immediate(&mut self,
        bp: &BlockPtr,
        flags: IoFlags,
        zb: &Bookmark,
        kind: ReadKind)
    {
        let psize = bp.psize;
        self.throttle.acquire(psize);
        let counters = match kind {
            ReadKind::Scan => self.counters.clone(),
            ReadKind::ErrorScrub => self.es.counters.clone(),
        };
        counters.issued.fetch_add(psize, Ordering::Relaxed);
        let fut = self.svc.reader.read(bp, zb, flags);
        let throttle = self.throttle.clone();
        let errlog = self.svc.errlog.clone();
        let zb = *zb;
        let handle = self.rt.spawn(async move {
            let r = fut.await;
            throttle.release(psize);
            counters.complete(psize, flags, &r);
            if kind == ReadKind::ErrorScrub {
                match r {
                    Ok(()) => errlog.remove(&zb),
                    Err(_) => errlog.record(&zb),
                }
            }
        });
        self.immediate.push(handle);
    }

    /// Number of reads waiting in the sorted queues
    pub fn queued_ios(&self) -> usize {
        self.queues.values().map(|q| q.pending()).sum()
    }

    /// Memory held by the sorted queues
    pub fn queue_mem_used(&self) -> u64 {
        governor::mem_used(self.queues.values())
    }

    /// Drain the sorted queues for as long as this txg allows
    pub(crate) fn issue_pass(&mut self) {
        let ctx = Arc::new(IssueContext {
            pool: self.svc.pool.clone(),
            reader: self.svc.reader.clone(),
            tunables: self.tunables.clone(),
            counters: self.counters.clone(),
            sync_start: self.sync_start,
            min_time: self.min_time(),
            checkpointing: self.checkpointing
        });
        let workers = self.queues.values()
            .map(|q| {
                let vdev = q.vdev();
                let fut = q.clone().issue(ctx.clone())
                    .instrument(info_span!("scan_issue", vdev));
                self.rt.spawn(fut)
            }).collect::<Vec<_>>();
        let before = self.queued_ios();
        self.rt.block_on(future::join_all(workers));
        debug!(txg = %self.txg, before, after = self.queued_ios(),
            checkpointing = self.checkpointing, "issue pass");
    }

    /// A block is being freed.  Drop any pending reads of it, and count them
    /// as skipped.
    pub fn block_freed(&mut self, bp: &BlockPtr) {
        if !self.is_scanning() || bp.embedded {
            return;
        }
        for dva in bp.dvas() {
            if let Some(q) = self.queues.get(&dva.vdev) {
                if let Some(skipped) = q.remove_freed(dva, bp) {
                    self.phys.skipped += skipped;
                }
            }
        }
    }

    /// A top-level device was replaced.  Its pending reads now belong to the
    /// replacement.
    pub fn vdev_replaced(&mut self, old: u64, new: u64) {
        if let Some(q) = self.queues.remove(&old) {
            debug_assert!(!self.queues.contains_key(&new));
            q.transfer(new);
            self.queues.insert(new, q);
        }
        if let Some(data_disks) = self.vdevs.remove(&old) {
            self.vdevs.insert(new, data_disks);
        }
    }
}
