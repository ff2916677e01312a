// vim: tw=80
//! Scan progress reporting and block statistics

use std::collections::BTreeMap;

use serde_derive::Serialize;

use crate::{
    phys::{ScanFunc, ScanState},
    scan::Scan,
    types::*,
};

/// Identifies one bucket of [`BlockStats`].  `None` fields are totals.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub struct StatKey {
    pub level: Option<u8>,
    pub objtype: Option<ObjType>,
}

impl StatKey {
    pub const TOTAL: StatKey = StatKey{level: None, objtype: None};
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
pub struct BlockStat {
    pub count: u64,
    pub asize: u64,
    pub lsize: u64,
    pub psize: u64,
    pub gangs: u64,
    /// Two copies, both on the same device
    pub ditto_2_of_2_samevdev: u64,
    /// Three copies, exactly two of them on the same device
    pub ditto_2_of_3_samevdev: u64,
    /// Three copies, all on the same device
    pub ditto_3_of_3_samevdev: u64,
}

/// Statistics about every block that a scan examines, bucketed by level and
/// object type
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct BlockStats(BTreeMap<StatKey, BlockStat>);

impl BlockStats {
    pub fn count_block(&mut self, bp: &BlockPtr) {
        let keys = [
            StatKey{level: Some(bp.level), objtype: Some(bp.objtype)},
            StatKey{level: Some(bp.level), objtype: None},
            StatKey{level: None, objtype: Some(bp.objtype)},
            StatKey::TOTAL
        ];
        let d = &bp.dva;
        for key in keys {
            let stat = self.0.entry(key).or_default();
            stat.count += 1;
            stat.asize += bp.asize();
            stat.lsize += bp.lsize;
            stat.psize += bp.psize;
            stat.gangs += bp.count_gang();
            match bp.ndvas() {
                2 => if d[0].vdev == d[1].vdev {
                    stat.ditto_2_of_2_samevdev += 1;
                },
                3 => {
                    let equal = u8::from(d[0].vdev == d[1].vdev) +
                        u8::from(d[0].vdev == d[2].vdev) +
                        u8::from(d[1].vdev == d[2].vdev);
                    if equal == 1 {
                        stat.ditto_2_of_3_samevdev += 1;
                    } else if equal == 3 {
                        stat.ditto_3_of_3_samevdev += 1;
                    }
                }
                _ => ()
            }
        }
    }

    pub fn get(&self, key: &StatKey) -> Option<&BlockStat> {
        self.0.get(key)
    }

    pub fn total(&self) -> BlockStat {
        self.0.get(&StatKey::TOTAL).copied().unwrap_or_default()
    }
}

/// In-memory statistics for the current pass.  A pass begins when a scan
/// starts, and again when its traversal finishes.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct PassStats {
    pub start: Timestamp,
    pub examined: u64,
    pub issued: u64,
    /// When the scrub was paused, or zero
    pub scrub_pause: Timestamp,
    /// Total seconds spent paused during this pass
    pub scrub_spent_paused: u64,
}

impl PassStats {
    pub fn new() -> Self {
        PassStats {
            start: Timestamp::now(),
            ..Default::default()
        }
    }
}

/// A point-in-time report of a scan's progress
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct ScanStats {
    pub func: ScanFunc,
    pub state: ScanState,
    pub start_time: Timestamp,
    pub end_time: Timestamp,
    pub to_examine: u64,
    pub examined: u64,
    pub skipped: u64,
    pub issued: u64,
    pub processed: u64,
    pub errors: u64,
    pub paused: bool,
    pub pass_start: Timestamp,
    pub pass_examined: u64,
    pub pass_issued: u64,
    pub pass_spent_paused: u64,
    /// Bytes issued per second during this pass
    pub issue_rate: u64,
    /// Estimated seconds until every byte has been issued
    pub remaining_secs: Option<u64>,
}

impl ScanStats {
    /// Dump in human-readable form
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml_ng::to_string(self).map_err(|_| Error::EINVAL)
    }
}

/// A point-in-time report of an error scrub's progress
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct ErrorScrubStats {
    pub state: ScanState,
    pub start_time: Timestamp,
    pub end_time: Timestamp,
    pub to_examine: u64,
    pub examined: u64,
    pub errors: u64,
    pub paused: bool,
    pub spent_paused: u64,
}

impl Scan {
    /// Report the scan's progress
    pub fn stats(&self) -> ScanStats {
        use std::sync::atomic::Ordering::Relaxed;

        let p = &self.phys;
        let now = Timestamp::now();
        // Include reads that completed since the last sync
        let issued_since = self.counters.issued.load(Relaxed);
        let pass_issued = self.pass.issued + issued_since;
        let mut spent_paused = self.pass.scrub_spent_paused;
        if !self.pass.scrub_pause.is_zero() {
            spent_paused += now.since(self.pass.scrub_pause);
        }
        let elapsed = now.since(self.pass.start)
            .saturating_sub(spent_paused)
            .max(1);
        let issue_rate = pass_issued / elapsed;
        let issued = p.issued + issued_since;
        let remaining_secs = if issue_rate > 0 && p.is_running() {
            Some(p.to_examine.saturating_sub(issued) / issue_rate)
        } else {
            None
        };
        ScanStats {
            func: p.func,
            state: p.state,
            start_time: p.start_time,
            end_time: p.end_time,
            to_examine: p.to_examine,
            examined: p.examined,
            skipped: p.skipped,
            issued,
            processed: p.processed + self.counters.processed.load(Relaxed),
            errors: p.errors + self.counters.errors.load(Relaxed),
            paused: p.is_paused(),
            pass_start: self.pass.start,
            pass_examined: self.pass.examined,
            pass_issued,
            pass_spent_paused: spent_paused,
            issue_rate,
            remaining_secs,
        }
    }

    /// Block statistics, if the current scan collected them.  A scan
    /// resumed after import does not.
    pub fn block_stats(&self) -> Option<&BlockStats> {
        self.blkstats.as_ref()
    }
}

// LCOV_EXCL_STOP
