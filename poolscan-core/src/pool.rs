// vim: tw=80
//! Interfaces to the rest of the storage pool.
//!
//! The scan engine does not own any storage.  Everything that it needs to know
//! about datasets, devices, and the transaction machinery comes through the
//! traits in this module.

use std::{
    future::Future,
    pin::Pin,
    sync::Arc,
    time::Duration
};

#[cfg(test)] use mockall::automock;

use crate::{
    bookmark::{Bookmark, DnodeGeometry},
    ddt::DedupTable,
    store::MetaStore,
    types::*
};

/// A top-level device, as the scan engine sees it
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct VdevInfo {
    pub id: u64,
    /// Number of children that carry data, not parity
    pub data_disks: u64,
}

/// A single dnode: the root of one object's block tree
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Dnode {
    /// Number of levels of indirection, counting the data blocks
    pub nlevels: u8,
    /// Data block size in 512-byte sectors
    pub datablkszsec: u16,
    /// log2 of the indirect block size
    pub indblkshift: u8,
    pub objtype: ObjType,
    pub blkptr: Vec<BlockPtr>,
    pub spill: Option<BlockPtr>,
}

impl Dnode {
    pub fn geometry(&self) -> DnodeGeometry {
        DnodeGeometry {
            datablkszsec: self.datablkszsec,
            indblkshift: self.indblkshift
        }
    }
}

/// The root block of an objset
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ObjsetPhys {
    pub meta_dnode: Dnode,
    pub userused: Option<Dnode>,
    pub groupused: Option<Dnode>,
    pub projectused: Option<Dnode>,
}

/// The decoded contents of a metadata block
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum BlockContents {
    /// Block pointers to the next lower level
    Indirect(Vec<BlockPtr>),
    /// A block of the meta-dnode.  Free slots are `None`.
    Dnodes(Vec<Option<Dnode>>),
    Objset(Box<ObjsetPhys>),
}

/// A write record in an intent log block
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LrWrite {
    /// Object that the record writes to
    pub foid: u64,
    pub offset: u64,
    pub bp: BlockPtr,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ZilBlock {
    pub bp: BlockPtr,
    /// Sequence number of the block within the log chain
    pub seq: u64,
    pub writes: Vec<LrWrite>,
}

/// A head dataset's intent log
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ZilHeader {
    /// The txg in which the log was claimed at import, or 0 if unclaimed
    pub claim_txg: TxgT,
    pub blocks: Vec<ZilBlock>,
}

/// Everything the traversal needs to know about one dataset
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct DatasetInfo {
    pub obj: u64,
    pub is_snapshot: bool,
    /// Root block of the dataset's objset
    pub bp: BlockPtr,
    pub creation_txg: TxgT,
    /// Previous snapshot, or 0
    pub prev_snap_obj: u64,
    pub prev_snap_txg: TxgT,
    /// For snapshots, the next snapshot or head.  Otherwise 0.
    pub next_snap_obj: u64,
    /// Number of datasets based on this one, plus one
    pub num_children: u64,
    /// Index of clones based on this snapshot, if the pool maintains one
    pub next_clones: Option<Vec<u64>>,
    /// For heads, the snapshot that the dataset was cloned from
    pub dir_origin: Option<u64>,
    /// For heads, the intent log
    pub zil: Option<ZilHeader>,
}

/// Events that the scan engine reports to the pool's history
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ScanEvent {
    ScrubStart,
    ScrubFinish,
    ScrubAbort,
    ScrubPaused,
    ScrubResumed,
    ResilverStart,
    ResilverFinish,
    ErrorScrubStart,
    ErrorScrubFinish,
    ErrorScrubAbort,
    ErrorScrubPaused,
    ErrorScrubResumed,
}

/// The pool's topology, datasets, and transaction machinery
#[cfg_attr(test, automock)]
pub trait Pool: Send + Sync {
    fn dataset(&self, dsobj: u64) -> Result<DatasetInfo>;
    /// Every head dataset in the pool
    fn head_datasets(&self) -> Vec<u64>;
    /// Root block of the meta objset
    fn meta_root(&self) -> BlockPtr;
    /// The pool's origin snapshot, if it has one
    fn origin_snapshot(&self) -> Option<u64>;
    fn top_level_vdevs(&self) -> Vec<VdevInfo>;
    /// The txg range missing from any device's dirty time log
    fn resilver_needed(&self) -> Option<(TxgT, TxgT)>;
    /// Must this copy be rewritten to repair a device?
    fn need_resilver(&self, dva: &Dva, psize: u64, phys_birth: TxgT) -> bool;
    /// Update every device's dirty time log after a scan ends
    fn dtl_reassess(&self, txg: TxgT, scrub_txg: TxgT, scrub_done: bool);
    /// Is a sequential device rebuild running?
    fn rebuild_active(&self) -> bool;
    fn physmem(&self) -> u64;
    /// Bytes allocated in the whole pool
    fn allocated(&self) -> u64;
    fn dirty_bytes(&self) -> u64;
    fn dirty_max(&self) -> u64;
    /// Is somebody waiting for the current txg to sync?
    fn sync_waiting(&self) -> bool;
    /// Time since the current txg began syncing
    fn sync_elapsed(&self) -> Duration;
    fn shutting_down(&self) -> bool;
    /// First txg synced after import
    fn first_txg(&self) -> TxgT;
    fn is_writeable(&self) -> bool;
    fn notify(&self, event: ScanEvent);
}

/// Synchronous access to decoded metadata blocks
#[cfg_attr(test, automock)]
pub trait BlockSource: Send + Sync {
    fn read_block(&self, bp: &BlockPtr, zb: &Bookmark) -> Result<BlockContents>;
    /// Find the block pointer at a bookmark
    fn locate(&self, zb: &Bookmark) -> Result<BlockPtr>;
}

pub type ReadFut = Pin<Box<dyn Future<Output=Result<()>> + Send>>;

/// Issues verification reads.  A read of a block with more than one valid
/// copy reads all of them.
#[cfg_attr(test, automock)]
pub trait ScanReader: Send + Sync {
    fn read(&self, bp: &BlockPtr, zb: &Bookmark, flags: IoFlags) -> ReadFut;
}

/// Frees that were deferred from earlier txgs
#[cfg_attr(test, automock)]
pub trait DeferredFrees: Send + Sync {
    /// Free the next pending block and return it, or `None` if there are
    /// none left.
    fn free_next(&self) -> Result<Option<BlockPtr>>;
}

/// The pool's persistent list of blocks with known errors
#[cfg_attr(test, automock)]
pub trait ErrorLog: Send + Sync {
    fn count(&self) -> u64;
    /// First entry whose key is at least `cursor`
    fn next_entry(&self, cursor: u64) -> Option<(u64, Bookmark)>;
    fn remove(&self, zb: &Bookmark);
    fn record(&self, zb: &Bookmark);
    /// Discard the log of the previous scan and start a new one
    fn rotate(&self);
}

/// Everything that a scan controller consumes
#[derive(Clone)]
pub struct Services {
    pub pool: Arc<dyn Pool>,
    pub blocks: Arc<dyn BlockSource>,
    pub reader: Arc<dyn ScanReader>,
    pub frees: Arc<dyn DeferredFrees>,
    pub ddt: Arc<dyn DedupTable>,
    pub errlog: Arc<dyn ErrorLog>,
    pub store: Arc<dyn MetaStore>,
}
