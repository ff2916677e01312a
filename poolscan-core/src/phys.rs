// vim: tw=80
//! Persistent scan state records
//!
//! Each record is stored with bincode behind a small version header, so a
//! pool imported by older software can recognize a record that it does not
//! understand.

use bitfield::bitfield;
use serde::de::DeserializeOwned;
use serde_derive::{Deserialize, Serialize};
use tracing::warn;

use crate::{
    bookmark::Bookmark,
    ddt::{DdtBookmark, DdtClass},
    types::*
};

/// Name of the scan state record in the metadata container
pub const SCAN_RECORD: &str = "scan";
/// Name of the error scrub state record in the metadata container
pub const ERRORSCRUB_RECORD: &str = "error_scrub";

/// Current encoding version of every persisted record
pub const PHYS_VERSION: u32 = 1;

/// What kind of scan is this?
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq,
         Serialize)]
pub enum ScanFunc {
    #[default]
    None,
    Scrub,
    Resilver,
    ErrorScrub,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq,
         Serialize)]
pub enum ScanState {
    #[default]
    None,
    Scanning,
    Finished,
    Canceled,
    ErrorScrubbing,
}

/// How urgently must the state record be written?
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SyncType {
    /// Only if the queues happen to be empty
    Optional,
    /// Unconditionally.  The queues must be empty.
    Mandatory,
    /// Write the cached copy, which reflects structural changes but not
    /// traversal progress
    Cached,
}

bitfield! {
    #[derive(Clone, Copy, Default, Deserialize, Eq, PartialEq, Serialize)]
    pub struct ScanFlags(u64);
    impl Debug;
    /// The current dataset must be visited again, because it gained a
    /// successor while we were visiting it
    pub visit_ds_again, set_visit_ds_again: 0;
    pub scrub_paused, set_scrub_paused: 1;
}

/// The persistent state of a scrub or resilver
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct ScanPhys {
    pub func: ScanFunc,
    pub state: ScanState,
    /// Object holding the persisted dataset queue
    pub queue_obj: u64,
    pub min_txg: TxgT,
    pub max_txg: TxgT,
    /// Birth range of the dataset being visited
    pub cur_min_txg: TxgT,
    pub cur_max_txg: TxgT,
    pub start_time: Timestamp,
    pub end_time: Timestamp,
    /// Total bytes that the scan expects to examine
    pub to_examine: u64,
    /// Bytes examined by traversal
    pub examined: u64,
    /// Bytes that needed no I/O, or were freed before being issued
    pub skipped: u64,
    /// Bytes of I/O issued
    pub issued: u64,
    /// Bytes of I/O completed
    pub processed: u64,
    pub errors: u64,
    /// Highest dedup class visited through the dedup table
    pub ddt_class_max: DdtClass,
    pub ddt_bookmark: DdtBookmark,
    /// Next position that the traversal must visit
    pub bookmark: Bookmark,
    pub flags: ScanFlags,
}

impl ScanPhys {
    pub fn is_running(&self) -> bool {
        self.state == ScanState::Scanning
    }

    pub fn is_paused(&self) -> bool {
        self.is_running() && self.flags.scrub_paused()
    }
}

impl TypicalSize for ScanPhys {
    const TYPICAL_SIZE: usize = 188;
}

bitfield! {
    #[derive(Clone, Copy, Default, Deserialize, Eq, PartialEq, Serialize)]
    pub struct ErrorScrubFlags(u64);
    impl Debug;
    pub paused, set_paused: 0;
}

/// The persistent state of an error scrub
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct ErrorScrubPhys {
    pub func: ScanFunc,
    pub state: ScanState,
    /// Key of the next error log entry to examine
    pub cursor: u64,
    pub start_time: Timestamp,
    pub end_time: Timestamp,
    /// Number of error log entries when the error scrub began
    pub to_examine: u64,
    /// Error log entries examined so far
    pub examined: u64,
    pub errors: u64,
    pub flags: ErrorScrubFlags,
}

impl ErrorScrubPhys {
    pub fn is_running(&self) -> bool {
        self.state == ScanState::ErrorScrubbing
    }

    pub fn is_paused(&self) -> bool {
        self.is_running() && self.flags.paused()
    }
}

impl TypicalSize for ErrorScrubPhys {
    const TYPICAL_SIZE: usize = 64;
}

/// Serialize a record behind the version header
pub fn encode<T: serde::Serialize>(t: &T) -> Result<Vec<u8>> {
    Ok(bincode::serialize(&(PHYS_VERSION, t))?)
}

/// Deserialize a record written by `encode`.
///
/// Records from a newer version fail with `EOPNOTSUPP`.
pub fn decode<T: DeserializeOwned>(buf: &[u8]) -> Result<T> {
    let (version, t): (u32, T) = bincode::deserialize(buf)?;
    if version > PHYS_VERSION {
        warn!(version, "persisted scan record is too new");
        return Err(Error::EOPNOTSUPP);
    }
    Ok(t)
}

// LCOV_EXCL_STOP
