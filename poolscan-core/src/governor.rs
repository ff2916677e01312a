// vim: tw=80
//! Memory admission control for the sorted I/O queues
//!
//! Traversal fills the queues and issuing drains them.  Once the queues hold
//! too much memory, traversal must stop until issuing has brought usage back
//! under a lower, soft limit.

use std::sync::Arc;

use tracing::trace;

use crate::{
    io_queue::IoQueue,
    pool::Pool,
    tunables::Tunables
};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct MemLimits {
    pub hard: u64,
    pub soft: u64,
}

impl MemLimits {
    pub fn new(pool: &dyn Pool, tunables: &Tunables) -> Self {
        let hard = (pool.physmem() / tunables.mem_lim_fact.max(1))
            .max(tunables.mem_lim_min)
            .min(pool.allocated() / 20);
        let soft = hard - (hard / tunables.mem_lim_soft_fact.max(1))
            .min(tunables.mem_lim_soft_max);
        MemLimits{hard, soft}
    }

    /// Should traversal stop so the queues can be drained?
    ///
    /// Between the soft and hard limits the answer doesn't change.
    pub fn should_clear(&self, mused: u64, clearing: bool) -> bool {
        if mused >= self.hard {
            true
        } else if mused < self.soft {
            false
        } else {
            clearing
        }
    }
}

/// Total memory consumed by every queue
pub fn mem_used<'a, I>(queues: I) -> u64
    where I: IntoIterator<Item=&'a Arc<IoQueue>>
{
    let mused = queues.into_iter().map(|q| q.mem_used()).sum();
    trace!(mused, "scan queue memory");
    mused
}

// LCOV_EXCL_STOP
