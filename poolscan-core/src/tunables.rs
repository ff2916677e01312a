// vim: tw=80
//! Runtime knobs for the scan engine.
//!
//! All knobs live in one struct, built once when the controller is created
//! and shared by reference with the issue workers and the prefetcher.

use std::time::Duration;

use serde_derive::{Deserialize, Serialize};
use tracing::warn;

use crate::{ddt::DdtClass, types::*};

/// How the issuing pass chooses the next extent
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueStrategy {
    /// Best-scoring extents first, except strict address order while
    /// checkpointing
    #[default]
    Auto,
    /// Always strict address order
    Lba,
    /// Always best-scoring extents first
    Size,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Tunables {
    /// Minimum time to spend scrubbing per txg
    pub scrub_min_time_ms: u64,
    /// Minimum time to spend resilvering per txg
    pub resilver_min_time_ms: u64,
    /// Minimum time to spend processing deferred frees per txg
    pub free_min_time_ms: u64,
    /// Maximum time that a txg may stay open
    pub txg_timeout_secs: u64,
    /// Wall-clock time between checkpoints
    pub checkpoint_interval_secs: u64,
    /// Queues may use at most 1/`mem_lim_fact` of physical memory
    pub mem_lim_fact: u64,
    /// Floor for the hard memory limit
    pub mem_lim_min: u64,
    /// The soft limit is the hard limit minus 1/`mem_lim_soft_fact` of it
    pub mem_lim_soft_fact: u64,
    /// Cap on the gap between the hard and soft limits
    pub mem_lim_soft_max: u64,
    /// Suspend traversal as soon as the hard limit is reached, regardless of
    /// the minimum time
    pub strict_mem_lim: bool,
    /// In-flight bytes allowed per data disk of a top-level device
    pub vdev_limit: u64,
    /// Largest gap to bridge when merging pending reads into an extent
    pub max_ext_gap: u64,
    /// How strongly fill density influences extent selection
    pub fill_weight: u64,
    pub issue_strategy: IssueStrategy,
    /// Issue reads as soon as they are found, without sorting
    pub legacy: bool,
    /// Traverse, but don't actually read anything
    pub no_scrub_io: bool,
    /// Disable the metadata prefetcher
    pub no_scrub_prefetch: bool,
    /// Highest dedup class that a scrub visits through the dedup table
    pub scrub_ddt_class_max: DdtClass,
    /// Maximum number of deferred frees to process per txg
    pub async_block_max_blocks: u64,
    /// Maximum number of error log entries to scrub per txg
    pub error_blocks_per_txg: u64,
    /// Number of txgs to wait after import before resuming a scan
    pub import_wait_txgs: u64,
    /// Suspend when dirty data exceeds this percentage of the dirty limit
    pub dirty_min_percent: u64,
    /// Freeze scan progress.  For testing only.
    pub suspend_progress: bool,
    /// Force a suspension after visiting this many blocks in one txg.  For
    /// testing only.
    pub suspend_after_blocks: Option<u64>,
}

impl Default for Tunables {
    fn default() -> Self {
        Tunables {
            scrub_min_time_ms: 1000,
            resilver_min_time_ms: 3000,
            free_min_time_ms: 1000,
            txg_timeout_secs: 5,
            checkpoint_interval_secs: 7200,
            mem_lim_fact: 20,
            mem_lim_min: 16 << 20,
            mem_lim_soft_fact: 20,
            mem_lim_soft_max: 128 << 20,
            strict_mem_lim: true,
            vdev_limit: 16 << 20,
            max_ext_gap: 2 << 20,
            fill_weight: 3,
            issue_strategy: IssueStrategy::Auto,
            legacy: false,
            no_scrub_io: false,
            no_scrub_prefetch: false,
            scrub_ddt_class_max: DdtClass::Duplicate,
            async_block_max_blocks: u64::MAX,
            error_blocks_per_txg: 4096,
            import_wait_txgs: 5,
            dirty_min_percent: 30,
            suspend_progress: false,
            suspend_after_blocks: None,
        }
    }
}

impl Tunables {
    /// Load tunables from a YAML document.  Missing fields get their
    /// defaults.
    pub fn from_yaml(s: &str) -> Result<Self> {
        serde_yaml_ng::from_str(s).map_err(|e| {
            warn!("Invalid tunables: {}", e);
            Error::EINVAL
        })
    }

    pub fn scrub_min_time(&self) -> Duration {
        Duration::from_millis(self.scrub_min_time_ms)
    }

    pub fn resilver_min_time(&self) -> Duration {
        Duration::from_millis(self.resilver_min_time_ms)
    }

    pub fn free_min_time(&self) -> Duration {
        Duration::from_millis(self.free_min_time_ms)
    }

    pub fn txg_timeout(&self) -> Duration {
        Duration::from_secs(self.txg_timeout_secs)
    }

    pub fn checkpoint_interval(&self) -> Duration {
        Duration::from_secs(self.checkpoint_interval_secs)
    }
}

// LCOV_EXCL_STOP
