// vim: tw=80
//! Traversal positions.
//!
//! A `Bookmark` names one block pointer in the pool: the objset that contains
//! it, the object within that objset, the block's indirection level, and its
//! index at that level.  Bookmarks order the traversal, and serve as the
//! scan's resumable cursor.

use std::cmp::Ordering;

use serde_derive::{Deserialize, Serialize};

use crate::types::*;

/// Objset number of the pool's meta objset
pub const META_OBJSET: u64 = 0;
/// Sentinel objset meaning "the dataset we were working on was destroyed"
pub const DESTROYED_OBJSET: u64 = u64::MAX;
/// Object number of an objset's meta-dnode
pub const META_DNODE_OBJECT: u64 = 0;
/// Accounting objects have negative object numbers
pub const USERUSED_OBJECT: u64 = -1i64 as u64;
pub const GROUPUSED_OBJECT: u64 = -2i64 as u64;
pub const PROJECTUSED_OBJECT: u64 = -3i64 as u64;
/// The objset's root block
pub const ROOT_OBJECT: u64 = 0;
pub const ROOT_LEVEL: i64 = -1;
pub const ROOT_BLKID: u64 = 0;
/// Intent log blocks and records
pub const ZIL_OBJECT: u64 = 0;
pub const ZIL_LEVEL: i64 = -2;
/// Block id of a dnode's spill block
pub const SPILL_BLKID: u64 = u64::MAX;

/// log2 of the on-disk size of a dnode
pub const DNODE_SHIFT: u32 = 9;
/// log2 of the size of a meta-dnode data block
pub const DNODE_BLOCK_SHIFT: u32 = 14;

/// Added to the level of meta-dnode bookmarks so that they sort before any
/// block of the objects that they contain.
const COMPARE_META_LEVEL: u64 = 0x8000_0000;

/// A position within the pool-wide block tree
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq,
         Serialize)]
pub struct Bookmark {
    pub objset: u64,
    pub object: u64,
    pub level: i64,
    pub blkid: u64,
}

impl Bookmark {
    pub const fn new(objset: u64, object: u64, level: i64, blkid: u64) -> Self
    {
        Bookmark{objset, object, level, blkid}
    }

    /// The bookmark of an objset's root block
    pub const fn root(objset: u64) -> Self {
        Bookmark::new(objset, ROOT_OBJECT, ROOT_LEVEL, ROOT_BLKID)
    }

    pub fn is_zero(&self) -> bool {
        *self == Bookmark::default()
    }

    /// User, group, and project accounting objects are never skipped and
    /// never suspended at.
    pub fn is_accounting(&self) -> bool {
        (self.object as i64) < 0
    }
}

impl TypicalSize for Bookmark {
    const TYPICAL_SIZE: usize = 32;
}

/// The parts of a dnode that determine how its block ids map to positions
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct DnodeGeometry {
    /// Data block size in 512-byte sectors
    pub datablkszsec: u16,
    /// log2 of the indirect block size
    pub indblkshift: u8,
}

impl DnodeGeometry {
    /// The geometry assumed for the last block of a resume bookmark: a
    /// meta-dnode data block.
    pub const META: DnodeGeometry = DnodeGeometry {
        datablkszsec: 1 << (DNODE_BLOCK_SHIFT - MINBLOCKSHIFT),
        indblkshift: 0
    };
}

/// Number of level-0 blocks spanned by one block at `level`
fn span_blocks(indblkshift: u8, level: i64) -> u64 {
    if level <= 0 {
        return 1;
    }
    let shift = (level as u64)
        .saturating_mul(u64::from(indblkshift).saturating_sub(
                u64::from(BLKPTR_SHIFT)));
    if shift >= 64 {
        u64::MAX
    } else {
        1 << shift
    }
}

/// Convert a bookmark into its canonical (object, L0 block, level) triple.
///
/// Bookmarks inside the meta-dnode are converted to the object numbers of
/// the dnodes they contain.
fn canonical(geom: DnodeGeometry, zb: &Bookmark) -> (u64, u64, u64) {
    let l0 = zb.blkid.wrapping_mul(span_blocks(geom.indblkshift, zb.level));
    if zb.object == META_DNODE_OBJECT {
        let per_block = u64::from(geom.datablkszsec) <<
            (MINBLOCKSHIFT - DNODE_SHIFT);
        let level = (zb.level as u64).wrapping_add(COMPARE_META_LEVEL);
        (l0.wrapping_mul(per_block), 0, level)
    } else {
        (zb.object, l0, zb.level as u64)
    }
}

/// Compare two bookmarks in traversal order.
///
/// Objsets are not compared: both bookmarks must belong to the same objset.
/// Within an object, a block sorts before its children.
pub fn compare(
    geom1: DnodeGeometry,
    zb1: &Bookmark,
    geom2: DnodeGeometry,
    zb2: &Bookmark) -> Ordering
{
    if zb1.object == zb2.object &&
        zb1.level == zb2.level &&
        zb1.blkid == zb2.blkid
    {
        return Ordering::Equal;
    }
    let (obj1, l0_1, level1) = canonical(geom1, zb1);
    let (obj2, l0_2, level2) = canonical(geom2, zb2);
    obj1.cmp(&obj2)
        .then(l0_1.cmp(&l0_2))
        // Higher levels come first
        .then(level2.cmp(&level1))
}

/// Has the traversal already visited the entire subtree rooted at
/// `subtree_root`, given that it has reached `last`?
///
/// `dnode` is the geometry of the dnode that owns `subtree_root`, or `None`
/// for an objset root.  An objset root is never completed.
pub fn subtree_completed(
    dnode: Option<DnodeGeometry>,
    subtree_root: &Bookmark,
    last: &Bookmark) -> bool
{
    debug_assert_eq!(last.level, 0);
    let geom = match dnode {
        None => return false,
        Some(g) => g
    };
    let mut next = *subtree_root;
    next.blkid = next.blkid.wrapping_add(1);
    compare(geom, &next, DnodeGeometry::META, last) != Ordering::Greater
}

/// Does the subtree rooted at `subtree_root` start at or after `last`?
pub fn subtree_tbd(
    dnode: Option<DnodeGeometry>,
    subtree_root: &Bookmark,
    last: &Bookmark) -> bool
{
    debug_assert_eq!(last.level, 0);
    match dnode {
        None => false,
        Some(geom) => compare(geom, subtree_root, DnodeGeometry::META, last)
            != Ordering::Less
    }
}

// LCOV_EXCL_STOP
