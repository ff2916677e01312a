// vim: tw=80
//! Extent trees
//!
//! An `ExtentTree` aggregates pending reads on one device into extents: runs
//! of addresses that are close enough together to read sequentially.  Each
//! extent tracks its "fill", the number of bytes of real I/O inside it.
//! Extents are indexed twice: by address, and by a score that favors extents
//! which are both large and densely filled.

use std::collections::BTreeMap;

use bitfield::bitfield;

use crate::{
    types::MINBLOCKSHIFT,
    util::highbit64
};

/// Estimated memory used by one extent, including both index entries
pub const EXTENT_MEM: u64 = 48;

/// A contiguous range of device addresses
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Extent {
    pub start: u64,
    /// Exclusive
    pub end: u64,
    /// Bytes of pending I/O within the extent
    pub fill: u64,
}

impl Extent {
    pub fn size(&self) -> u64 {
        self.end - self.start
    }

    pub fn contains(&self, addr: u64) -> bool {
        self.start <= addr && addr < self.end
    }
}

bitfield! {
    /// Sort key for the size index.  Lower keys are better.
    #[derive(Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd)]
    struct SizeKey(u64);
    impl Debug;
    u8, rank, set_rank: 63, 56;
    addr, set_addr: 55, 0;
}

pub struct ExtentTree {
    /// Extent records.  Both indices refer into this arena.
    arena: Vec<Option<Extent>>,
    /// Vacant arena slots
    vacant: Vec<usize>,
    by_addr: BTreeMap<u64, usize>,
    by_size: BTreeMap<SizeKey, usize>,
    /// Extents closer together than this are merged
    gap: u64,
    fill_weight: u64,
}

impl ExtentTree {
    pub fn new(gap: u64, fill_weight: u64) -> Self {
        ExtentTree {
            arena: Vec::new(),
            vacant: Vec::new(),
            by_addr: BTreeMap::new(),
            by_size: BTreeMap::new(),
            gap,
            fill_weight
        }
    }

    /// Extent quality: larger extents and denser extents score higher.
    pub fn score(&self, ext: &Extent) -> u64 {
        let size = u128::from(ext.size().max(1));
        let fill = u128::from(ext.fill);
        let fill_pct = fill * 100 / size;
        let s = fill + fill_pct * u128::from(self.fill_weight) * fill / 100;
        u64::try_from(s).unwrap_or(u64::MAX)
    }

    fn size_key(&self, ext: &Extent) -> SizeKey {
        let mut key = SizeKey(0);
        key.set_rank((64 - highbit64(self.score(ext))) as u8);
        key.set_addr(ext.start >> MINBLOCKSHIFT);
        key
    }

    fn insert(&mut self, ext: Extent) {
        let key = self.size_key(&ext);
        let id = match self.vacant.pop() {
            Some(id) => {
                self.arena[id] = Some(ext);
                id
            },
            None => {
                self.arena.push(Some(ext));
                self.arena.len() - 1
            }
        };
        let old = self.by_addr.insert(ext.start, id);
        debug_assert!(old.is_none());
        let old = self.by_size.insert(key, id);
        debug_assert!(old.is_none(), "size key collision at {:#x}", ext.start);
    }

    /// Remove the extent starting at `start`, returning it
    pub fn remove(&mut self, start: u64) -> Option<Extent> {
        let id = self.by_addr.remove(&start)?;
        let ext = self.arena[id].take()?;
        let key = self.size_key(&ext);
        self.by_size.remove(&key);
        self.vacant.push(id);
        Some(ext)
    }

    /// Add `size` bytes of I/O at `start`, merging with any extents that
    /// overlap or lie within the gap.
    pub fn add(&mut self, start: u64, size: u64) {
        self.add_fill(start, size, size)
    }

    fn add_fill(&mut self, start: u64, size: u64, fill: u64) {
        let end = start + size;
        if let Some(ext) = self.find(start, size) {
            if ext.start <= start && ext.end >= end {
                self.adjust_fill(ext.start, fill as i64);
            } else {
                // The new range extends an existing extent.  Merge them and
                // try again, in case the result overlaps yet another.
                self.remove(ext.start);
                let nstart = ext.start.min(start);
                let nend = ext.end.max(end);
                self.add_fill(nstart, nend - nstart, fill + ext.fill);
            }
            return;
        }

        let before = self.by_addr.range(..start).next_back()
            .and_then(|(_, &id)| self.arena[id])
            .filter(|e| e.end + self.gap >= start);
        let after = self.by_addr.range(end..).next()
            .and_then(|(_, &id)| self.arena[id])
            .filter(|e| e.start <= end.saturating_add(self.gap));
        let mut ext = Extent{start, end, fill};
        if let Some(b) = before {
            self.remove(b.start);
            ext.start = b.start;
            ext.fill += b.fill;
        }
        if let Some(a) = after {
            self.remove(a.start);
            ext.end = a.end;
            ext.fill += a.fill;
        }
        self.insert(ext);
    }

    /// Change the fill of the extent starting at `start`
    fn adjust_fill(&mut self, start: u64, delta: i64) {
        if let Some(mut ext) = self.remove(start) {
            ext.fill = ext.fill.saturating_add_signed(delta);
            self.insert(ext);
        }
    }

    /// Remove `size` bytes of I/O at `start`.
    ///
    /// If that was the extent's last I/O, remove the whole extent.
    pub fn remove_fill(&mut self, start: u64, size: u64) {
        let ext = match self.find(start, size) {
            Some(ext) => ext,
            None => return
        };
        if ext.fill <= size {
            self.remove(ext.start);
        } else {
            self.adjust_fill(ext.start, -(size as i64));
        }
    }

    /// Find the extent overlapping `[start, start + size)`, if any
    pub fn find(&self, start: u64, size: u64) -> Option<Extent> {
        let end = start + size.max(1);
        self.by_addr.range(..end).next_back()
            .and_then(|(_, &id)| self.arena[id])
            .filter(|e| e.end > start)
    }

    /// The extent starting exactly at `start`
    pub fn get(&self, start: u64) -> Option<Extent> {
        self.by_addr.get(&start).and_then(|&id| self.arena[id])
    }

    /// The extent with the lowest address
    pub fn first_by_addr(&self) -> Option<Extent> {
        self.by_addr.values().next().and_then(|&id| self.arena[id])
    }

    /// The best-scoring extent
    pub fn first_by_size(&self) -> Option<Extent> {
        self.by_size.values().next().and_then(|&id| self.arena[id])
    }

    /// Move the start of the extent at `start` forward to `new_start`,
    /// removing `fill_removed` bytes of its fill.
    pub fn shrink_front(&mut self, start: u64, new_start: u64,
        fill_removed: u64)
    {
        if let Some(mut ext) = self.remove(start) {
            debug_assert!(new_start >= ext.start && new_start < ext.end);
            ext.start = new_start;
            ext.fill = ext.fill.saturating_sub(fill_removed);
            self.insert(ext);
        }
    }

    pub fn clear(&mut self) {
        self.arena.clear();
        self.vacant.clear();
        self.by_addr.clear();
        self.by_size.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.by_addr.is_empty()
    }

    /// Iterate over extents in address order
    pub fn iter(&self) -> impl Iterator<Item=Extent> + '_ {
        self.by_addr.values().filter_map(move |&id| self.arena[id])
    }

    pub fn len(&self) -> usize {
        self.by_addr.len()
    }

    /// Estimated memory consumed by the extents
    pub fn mem_used(&self) -> u64 {
        self.len() as u64 * EXTENT_MEM
    }
}

// LCOV_EXCL_STOP
