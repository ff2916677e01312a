// vim: tw=80
//! Per-device sorted I/O queues
//!
//! Traversal finds blocks in logical order, which is usually far from their
//! physical order.  Rather than read each block as it is found, the scan
//! accumulates pending reads in one queue per top-level device.  Each queue
//! groups its reads into extents, and the issuing pass reads the best extents
//! first, in address order within each extent.

use std::{
    collections::BTreeMap,
    mem,
    sync::{
        Arc,
        Mutex,
        MutexGuard,
        atomic::{AtomicU64, Ordering}
    },
    time::{Duration, Instant},
};

use futures::future;
use tokio::sync::Semaphore;
use tracing::{debug, trace};

use crate::{
    bookmark::Bookmark,
    ext_tree::{Extent, ExtentTree},
    pool::{Pool, ScanReader},
    tunables::{IssueStrategy, Tunables},
    types::*,
    util::div_roundup
};

/// Maximum number of reads to gather from one extent at a time
pub const ISSUE_BATCH: usize = 32;

/// Memory charged for each pending read
pub const SIO_MEM: u64 = mem::size_of::<ScanIo>() as u64;

/// Minimum in-flight limit for any queue
const MIN_INFLIGHT: u64 = 1 << 20;

/// A pending read of one copy of one block
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ScanIo {
    /// Device address of the copy
    pub offset: u64,
    pub asize: u64,
    pub gang: bool,
    pub lsize: u64,
    pub psize: u64,
    pub birth: TxgT,
    pub phys_birth: TxgT,
    pub level: u8,
    pub objtype: ObjType,
    pub checksum: Checksum,
    pub dedup: bool,
    pub zb: Bookmark,
    pub flags: IoFlags,
}

impl ScanIo {
    /// Record a read of `bp`'s `dva`th copy
    pub fn new(bp: &BlockPtr, dva: usize, zb: &Bookmark, flags: IoFlags)
        -> Self
    {
        let d = &bp.dva[dva];
        ScanIo {
            offset: d.offset,
            asize: d.asize,
            gang: d.gang,
            lsize: bp.lsize,
            psize: bp.psize,
            birth: bp.birth,
            phys_birth: bp.phys_birth,
            level: bp.level,
            objtype: bp.objtype,
            checksum: bp.checksum,
            dedup: bp.dedup,
            zb: *zb,
            flags
        }
    }

    /// Reconstitute a block pointer that references only this copy
    pub fn to_bp(&self, vdev: u64) -> BlockPtr {
        let mut bp = BlockPtr {
            level: self.level,
            objtype: self.objtype,
            lsize: self.lsize,
            psize: self.psize,
            birth: self.birth,
            phys_birth: self.phys_birth,
            checksum: self.checksum,
            dedup: self.dedup,
            ..Default::default()
        };
        bp.dva[0] = Dva {
            vdev,
            offset: self.offset,
            asize: self.asize,
            gang: self.gang
        };
        bp
    }
}

/// Scan I/O statistics, shared with read completion handlers
#[derive(Debug, Default)]
pub struct IoCounters {
    pub issued: AtomicU64,
    pub processed: AtomicU64,
    pub errors: AtomicU64,
}

impl IoCounters {
    /// Account for a finished scan read
    pub fn complete(&self, psize: u64, flags: IoFlags, r: &Result<()>) {
        self.processed.fetch_add(psize, Ordering::Relaxed);
        match r {
            Ok(()) => (),
            Err(Error::ECKSUM) if flags.speculative() => (),
            Err(e) => {
                trace!(error = ?e, "scan read failed");
                self.errors.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Return the counts accumulated since the last call and reset them
    pub fn take(&self) -> (u64, u64, u64) {
        (self.issued.swap(0, Ordering::Relaxed),
         self.processed.swap(0, Ordering::Relaxed),
         self.errors.swap(0, Ordering::Relaxed))
    }
}

/// Everything that an issuing pass needs from the controller
pub struct IssueContext {
    pub pool: Arc<dyn Pool>,
    pub reader: Arc<dyn ScanReader>,
    pub tunables: Arc<Tunables>,
    pub counters: Arc<IoCounters>,
    /// When the current txg's sync began
    pub sync_start: Instant,
    /// Minimum time to spend issuing in this txg
    pub min_time: Duration,
    /// Issue in strict address order
    pub checkpointing: bool,
}

impl IssueContext {
    fn should_suspend(&self) -> bool {
        let elapsed = self.sync_start.elapsed();
        let dirty_min = self.pool.dirty_max() *
            self.tunables.dirty_min_percent / 100;
        (elapsed > self.min_time &&
            (self.pool.sync_waiting() ||
             self.pool.dirty_bytes() >= dirty_min)) ||
        elapsed > self.tunables.txg_timeout() ||
        self.pool.shutting_down()
    }
}

struct QueueInner {
    /// Pending reads, by device address
    sios: BTreeMap<u64, ScanIo>,
    exts: ExtentTree,
    /// Start of the extent that was interrupted by the last batch
    last_ext_addr: Option<u64>,
    sio_memused: u64,
}

impl QueueInner {
    fn insert(&mut self, sio: ScanIo) -> bool {
        if self.sios.contains_key(&sio.offset) {
            return false;
        }
        self.sio_memused += SIO_MEM;
        self.exts.add(sio.offset, sio.asize);
        self.sios.insert(sio.offset, sio);
        true
    }

    fn fetch_ext(&self, strategy: IssueStrategy, checkpointing: bool)
        -> Option<Extent>
    {
        let lba = match strategy {
            IssueStrategy::Lba => true,
            IssueStrategy::Auto => checkpointing,
            IssueStrategy::Size => false
        };
        if lba {
            return self.exts.first_by_addr();
        }
        self.last_ext_addr
            .and_then(|addr| self.exts.get(addr))
            .or_else(|| self.exts.first_by_size())
    }
}

/// The I/O queue of one top-level device
pub struct IoQueue {
    vdev: AtomicU64,
    inner: Mutex<QueueInner>,
    /// In-flight limit, in 512-byte sectors
    inflight: Arc<Semaphore>,
    max_sectors: u64,
    strategy: IssueStrategy,
}

impl IoQueue {
    pub fn new(vdev: u64, data_disks: u64, tunables: &Tunables) -> Self {
        let maxinflight = (tunables.vdev_limit * data_disks).max(MIN_INFLIGHT);
        let max_sectors = maxinflight >> MINBLOCKSHIFT;
        let inner = QueueInner {
            sios: BTreeMap::new(),
            exts: ExtentTree::new(tunables.max_ext_gap, tunables.fill_weight),
            last_ext_addr: None,
            sio_memused: 0
        };
        IoQueue {
            vdev: AtomicU64::new(vdev),
            inner: Mutex::new(inner),
            inflight: Arc::new(Semaphore::new(max_sectors as usize)),
            max_sectors,
            strategy: tunables.issue_strategy,
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueInner> {
        self.inner.lock().unwrap()
    }

    pub fn vdev(&self) -> u64 {
        self.vdev.load(Ordering::Relaxed)
    }

    /// Hand the queue over to a replacement device
    pub fn transfer(&self, new_vdev: u64) {
        self.vdev.store(new_vdev, Ordering::Relaxed);
    }

    /// Add a pending read.  Returns false if a read of the same address is
    /// already pending.
    pub fn insert(&self, sio: ScanIo) -> bool {
        self.lock().insert(sio)
    }

    /// Return reads to the queue that were gathered but never issued
    pub fn requeue(&self, sios: &[ScanIo]) {
        let mut inner = self.lock();
        for sio in sios {
            inner.insert(*sio);
        }
    }

    /// Take the next batch of reads to issue, in address order, all from a
    /// single extent.  Returns `None` once the queue is empty.
    pub fn gather(&self, checkpointing: bool) -> Option<Vec<ScanIo>> {
        let mut guard = self.lock();
        let inner = &mut *guard;
        let ext = inner.fetch_ext(self.strategy, checkpointing)?;
        let offsets = inner.sios.range(ext.start..ext.end)
            .map(|(offset, _)| *offset)
            .take(ISSUE_BATCH + 1)
            .collect::<Vec<_>>();
        let mut batch = Vec::with_capacity(ISSUE_BATCH);
        let mut fill_removed = 0;
        for offset in offsets.iter().take(ISSUE_BATCH) {
            if let Some(sio) = inner.sios.remove(offset) {
                inner.sio_memused -= SIO_MEM;
                fill_removed += sio.asize;
                batch.push(sio);
            }
        }
        match offsets.get(ISSUE_BATCH) {
            Some(&next) => {
                inner.exts.shrink_front(ext.start, next, fill_removed);
                inner.last_ext_addr = Some(next);
            }
            None => {
                inner.exts.remove(ext.start);
                inner.last_ext_addr = None;
            }
        }
        Some(batch)
    }

    /// Remove a pending read of a block that is being freed.
    ///
    /// Returns the number of bytes skipped, if the read was still pending.
    pub fn remove_freed(&self, dva: &Dva, bp: &BlockPtr) -> Option<u64> {
        let mut inner = self.lock();
        let matches = inner.sios.get(&dva.offset)
            .map(|sio| sio.asize == dva.asize &&
                 sio.checksum == bp.checksum &&
                 sio.birth == bp.birth)
            .unwrap_or(false);
        if !matches {
            return None;
        }
        inner.sios.remove(&dva.offset);
        inner.sio_memused -= SIO_MEM;
        inner.exts.remove_fill(dva.offset, dva.asize);
        if inner.last_ext_addr.is_some_and(|a| inner.exts.get(a).is_none()) {
            inner.last_ext_addr = None;
        }
        Some(dva.asize)
    }

    /// Discard every pending read
    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.sios.clear();
        inner.exts.clear();
        inner.last_ext_addr = None;
        inner.sio_memused = 0;
    }

    /// Number of pending reads
    pub fn pending(&self) -> usize {
        self.lock().sios.len()
    }

    /// Memory consumed by pending reads and their extents
    pub fn mem_used(&self) -> u64 {
        let inner = self.lock();
        inner.exts.mem_used() + inner.sio_memused
    }

    /// Number of sectors to reserve for a read of `psize` bytes
    fn sectors(&self, psize: u64) -> u32 {
        let n = div_roundup(psize.max(1), 1 << MINBLOCKSHIFT)
            .min(self.max_sectors);
        u32::try_from(n).unwrap_or(u32::MAX)
    }

    /// Issue pending reads until the queue is empty or it's time to
    /// suspend, and wait for them to complete.
    pub async fn issue(self: Arc<Self>, ctx: Arc<IssueContext>) {
        let vdev = self.vdev();
        let mut reads = Vec::new();
        let mut suspended = false;
        while let Some(batch) = self.gather(ctx.checkpointing) {
            for (i, sio) in batch.iter().enumerate() {
                if ctx.should_suspend() {
                    self.requeue(&batch[i..]);
                    suspended = true;
                    break;
                }
                let permit = match self.inflight.clone()
                    .acquire_many_owned(self.sectors(sio.psize)).await
                {
                    Ok(permit) => permit,
                    Err(_) => {
                        // Semaphore closed
                        self.requeue(&batch[i..]);
                        suspended = true;
                        break;
                    }
                };
                ctx.counters.issued.fetch_add(sio.psize, Ordering::Relaxed);
                let fut = ctx.reader.read(&sio.to_bp(vdev), &sio.zb, sio.flags);
                let counters = ctx.counters.clone();
                let psize = sio.psize;
                let flags = sio.flags;
                reads.push(tokio::spawn(async move {
                    let r = fut.await;
                    drop(permit);
                    counters.complete(psize, flags, &r);
                }));
            }
            if suspended {
                break;
            }
        }
        let n = reads.len();
        future::join_all(reads).await;
        debug!(vdev, issued = n, suspended, remaining = self.pending(),
            "issue pass complete");
    }
}

// LCOV_EXCL_START
#[cfg(test)]
impl IoQueue {
    /// Check that every extent's fill is the sum of the reads within it,
    /// and that every read belongs to an extent
    fn check_fill(&self) {
        let inner = self.lock();
        let mut total = 0;
        for ext in inner.exts.iter() {
            let fill: u64 = inner.sios.range(ext.start..ext.end)
                .map(|(_, sio)| sio.asize)
                .sum();
            assert_eq!(ext.fill, fill, "extent {:?}", ext);
            total += fill;
        }
        let all: u64 = inner.sios.values().map(|sio| sio.asize).sum();
        assert_eq!(total, all);
    }
}

// LCOV_EXCL_STOP
