// vim: tw=80
//! The dedup table pass
//!
//! Before the tree walk, a scrub visits every block referenced through the
//! dedup table, up to a configured class.  Such blocks are then skipped by
//! the tree walk, so a block with many references is read only once.

use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde_derive::{Deserialize, Serialize};
use tracing::{debug, warn};

#[cfg(test)] use mockall::automock;

use crate::{
    bookmark::Bookmark,
    scan::Scan,
    types::*
};

/// Dedup table classes, from most to least referenced
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, IntoPrimitive, Ord,
         PartialEq, PartialOrd, Serialize, TryFromPrimitive)]
#[repr(u8)]
pub enum DdtClass {
    /// Blocks with more references than copies
    Ditto = 0,
    /// Blocks with more than one reference
    Duplicate = 1,
    /// Blocks with a single reference
    Unique = 2,
}

impl DdtClass {
    /// The highest class
    pub const MAX: DdtClass = DdtClass::Unique;

    /// The class after this one, if any
    pub fn next(self) -> Option<DdtClass> {
        DdtClass::try_from(u8::from(self) + 1).ok()
    }
}

impl Default for DdtClass {
    fn default() -> Self {
        DdtClass::Ditto
    }
}

/// Number of dedup classes.  A walk that has passed every class has this as
/// its class.
pub const DDT_CLASSES: u64 = 3;

/// Position of the dedup table walk
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq,
         Serialize)]
pub struct DdtBookmark {
    /// A `DdtClass`, or `DDT_CLASSES` once the walk is complete
    pub class: u64,
    /// Table storage type
    pub ddt_type: u64,
    /// Checksum algorithm of the table
    pub checksum: u64,
    /// Opaque position within one table
    pub cursor: u64,
}

impl DdtBookmark {
    /// Has the walk passed every entry of class `max` and below?
    pub fn is_past(&self, max: DdtClass) -> bool {
        self.class > u64::from(u8::from(max))
    }
}

/// One dedup table entry, as the scan sees it
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct DdtEntry {
    /// Block pointers for each of the entry's physical variants.  Empty
    /// variants have a zero birth txg.
    pub phys: Vec<BlockPtr>,
}

#[cfg_attr(test, automock)]
pub trait DedupTable: Send + Sync {
    /// Return the entry at `ddb` and advance `ddb` past it.  Returns `None`
    /// once every table has been walked, leaving `ddb` in the class after
    /// the last.
    fn walk(&self, ddb: &mut DdtBookmark) -> Result<Option<DdtEntry>>;
    /// Is `bp` referenced through a dedup class no higher than `max_class`?
    fn class_contains(&self, max_class: DdtClass, bp: &BlockPtr) -> bool;
}

impl Scan {
    /// Visit dedup table entries from the persisted cursor up to the
    /// configured class
    pub(crate) fn ddt_visit(&mut self) {
        let ddt = self.svc.ddt.clone();
        let mut n = 0u64;
        while !self.phys.ddt_bookmark.is_past(self.phys.ddt_class_max) {
            let mut ddb = self.phys.ddt_bookmark;
            match ddt.walk(&mut ddb) {
                Ok(Some(dde)) => {
                    self.phys.ddt_bookmark = ddb;
                    if ddb.is_past(self.phys.ddt_class_max) {
                        break;
                    }
                    self.ddt_scan_entry(&dde);
                    n += 1;
                }
                Ok(None) => {
                    self.phys.ddt_bookmark = DdtBookmark {
                        class: DDT_CLASSES,
                        ..Default::default()
                    };
                }
                Err(e) => {
                    // Skip the rest of the table.  The tree walk will find
                    // anything that we missed.
                    warn!(error = ?e, "Error walking the dedup table");
                    self.phys.ddt_bookmark = DdtBookmark {
                        class: DDT_CLASSES,
                        ..Default::default()
                    };
                }
            }
            if self.check_suspend(None) {
                break;
            }
        }
        debug!(entries = n, class = self.phys.ddt_bookmark.class,
            suspending = self.suspending, "visited dedup table");
    }

    /// Scan every physical variant of one dedup entry
    fn ddt_scan_entry(&mut self, dde: &DdtEntry) {
        let zb = Bookmark::default();
        for bp in dde.phys.iter().filter(|bp| bp.birth != TxgT(0)) {
            self.visited_this_txg += 1;
            self.scan_cb(bp, &zb);
        }
    }

    /// A dedup entry moved to a more-referenced class.
    ///
    /// The walk may already have passed the new class, so scan the entry's
    /// blocks right away.
    pub fn ddt_entry_promoted(&mut self,
        old: DdtClass,
        new: DdtClass,
        dde: &DdtEntry)
    {
        if new < old && self.is_scanning() {
            self.ddt_scan_entry(dde);
        }
    }
}

// LCOV_EXCL_STOP
