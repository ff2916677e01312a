// vim: tw=80
//! Metadata traversal
//!
//! The traversal walks the pool's block tree top-down: first the dedup
//! table, then the meta objset, then each dataset from the dataset queue.
//! Every block passes through [`Scan::visitbp`], which decides whether to
//! suspend, whether the block was already visited in an earlier txg, and
//! whether to descend.  Callbacks run after a block's children, and never
//! while suspending, so that resuming from the bookmark visits each block
//! exactly once.

use tracing::{debug, info, warn};

use crate::{
    bookmark::*,
    pool::{BlockContents, DatasetInfo, Dnode, ZilHeader},
    scan::Scan,
    types::*,
};

impl Scan {
    /// Traverse as much as this txg allows
    pub(crate) fn visit(&mut self) {
        if !self.phys.ddt_bookmark.is_past(self.phys.ddt_class_max) {
            self.phys.cur_min_txg = self.phys.min_txg;
            self.phys.cur_max_txg = self.phys.max_txg;
            self.ddt_visit();
            if self.suspending {
                return;
            }
        }

        if self.phys.bookmark.objset == META_OBJSET {
            self.phys.cur_min_txg = self.phys.min_txg;
            self.phys.cur_max_txg = self.phys.max_txg;
            let rootbp = self.svc.pool.meta_root();
            self.visit_rootbp(None, &rootbp);
            if self.suspending {
                return;
            }
            // The resume point may have been freed
            self.phys.bookmark = Bookmark::default();
            if let Some(origin) = self.svc.pool.origin_snapshot() {
                // The origin may hold blocks of its own.  If it suspends,
                // its bookmark resumes it next txg, like any other dataset.
                self.visitds(origin);
                if self.suspending {
                    return;
                }
            }
        } else if self.phys.bookmark.objset != DESTROYED_OBJSET {
            // Resume the dataset that we suspended in
            self.visitds(self.phys.bookmark.objset);
            if self.suspending {
                return;
            }
        }

        // In case we suspended right at the end of a dataset
        self.phys.bookmark = Bookmark::default();

        while let Some((dsobj, txg)) = self.ds_queue.pop_first() {
            let ds = match self.svc.pool.dataset(dsobj) {
                Ok(ds) => ds,
                Err(e) => {
                    warn!(dsobj, error = ?e, "cannot open queued dataset");
                    continue;
                }
            };
            let from = if txg != TxgT(0) { txg } else { ds.prev_snap_txg };
            self.phys.cur_min_txg = self.phys.min_txg.max(from);
            self.phys.cur_max_txg = self.ds_maxtxg(&ds);
            self.visitds_info(&ds);
            if self.suspending {
                if self.phys.bookmark.objset != dsobj {
                    // Suspended before the bookmark entered this dataset
                    self.ds_queue.insert(dsobj, txg);
                }
                return;
            }
        }

        // Nothing left to visit
        self.phys.bookmark.objset = DESTROYED_OBJSET;
    }

    /// The newest txg worth visiting in a dataset
    fn ds_maxtxg(&self, ds: &DatasetInfo) -> TxgT {
        if ds.is_snapshot {
            self.phys.max_txg.min(ds.creation_txg)
        } else {
            self.phys.max_txg
        }
    }

    fn visitds(&mut self, dsobj: u64) {
        match self.svc.pool.dataset(dsobj) {
            Ok(ds) => self.visitds_info(&ds),
            Err(e) => warn!(dsobj, error = ?e, "cannot open dataset"),
        }
    }

    fn visitds_info(&mut self, ds: &DatasetInfo) {
        if self.phys.cur_min_txg >= self.phys.max_txg {
            // Every block in this dataset is either older than cur_min, and
            // was already visited, or newer than the scan.  The same holds
            // for its descendants, so don't queue them either.
            debug!(ds = ds.obj, cur_min = %self.phys.cur_min_txg,
                max = %self.phys.max_txg, "dataset needs no scan");
            return;
        }

        // Only a head's intent log is valid.  It is walked here rather than
        // in the tree, because the usual block sharing rules don't apply.
        // When resuming, it was already walked.
        let resuming = !self.phys.bookmark.is_zero();
        if !ds.is_snapshot && !resuming {
            if let Some(zh) = &ds.zil {
                self.zil(ds.obj, zh);
            }
        }

        self.visit_rootbp(Some(ds.obj), &ds.bp);
        debug!(ds = ds.obj, min = %self.phys.cur_min_txg,
            max = %self.phys.cur_max_txg, suspending = self.suspending,
            "scanned dataset");
        if self.suspending {
            return;
        }

        if self.phys.flags.visit_ds_again() {
            // A snapshot was destroyed while we traversed it, so this
            // dataset may reference blocks that we haven't seen.
            debug!(ds = ds.obj, "incomplete pass; visiting again");
            self.phys.flags.set_visit_ds_again(false);
            self.ds_queue.insert(ds.obj, self.phys.cur_max_txg);
            return;
        }

        if ds.next_snap_obj != 0 {
            self.ds_queue.insert(ds.next_snap_obj, ds.creation_txg);
        }
        if ds.num_children > 1 {
            match &ds.next_clones {
                Some(clones) if clones.len() as u64 == ds.num_children - 1 => {
                    for clone in clones {
                        self.ds_queue.insert(*clone, ds.creation_txg);
                    }
                }
                _ => self.enqueue_clones(ds.obj),
            }
        }
    }

    /// Queue every clone of `origin`, found the slow way
    fn enqueue_clones(&mut self, origin: u64) {
        let pool = self.svc.pool.clone();
        for head in pool.head_datasets() {
            let mut ds = match pool.dataset(head) {
                Ok(ds) if ds.dir_origin == Some(origin) => ds,
                Ok(_) => continue,
                Err(e) => {
                    warn!(head, error = ?e, "cannot open dataset");
                    continue;
                }
            };
            // Find the clone's oldest snapshot
            while ds.prev_snap_obj != origin {
                ds = match pool.dataset(ds.prev_snap_obj) {
                    Ok(prev) => prev,
                    Err(e) => {
                        warn!(ds = ds.prev_snap_obj, error = ?e,
                            "cannot open snapshot");
                        break;
                    }
                };
            }
            if ds.prev_snap_obj == origin {
                self.ds_queue.insert(ds.obj, ds.prev_snap_txg);
            }
        }
    }

    /// Walk the claimed part of a head dataset's intent log
    fn zil(&mut self, objset: u64, zh: &ZilHeader) {
        let claim_txg = zh.claim_txg;
        let pool = self.svc.pool.clone();
        if claim_txg == TxgT(0) && pool.is_writeable() {
            return;
        }
        let cur_min = self.phys.cur_min_txg;
        let first_txg = pool.first_txg();
        for lwb in zh.blocks.iter() {
            let bp = &lwb.bp;
            // The oldest block may have been allocated long ago.  Visit it
            // even if it was never claimed.
            if bp.is_hole() || bp.birth <= cur_min ||
                (claim_txg == TxgT(0) && bp.birth >= first_txg)
            {
                continue;
            }
            let zb = Bookmark::new(objset, ZIL_OBJECT, ZIL_LEVEL, lwb.seq);
            self.scan_cb(bp, &zb);
        }
        for lwb in zh.blocks.iter() {
            for lr in lwb.writes.iter() {
                let bp = &lr.bp;
                // A record may be older than claim_txg if its txg already
                // synced, while others in the same log block did not.
                if bp.is_hole() || bp.birth <= cur_min ||
                    claim_txg == TxgT(0) || bp.birth < claim_txg ||
                    bp.lsize == 0
                {
                    continue;
                }
                let zb = Bookmark::new(objset, lr.foid, ZIL_LEVEL,
                    lr.offset / bp.lsize);
                self.scan_cb(bp, &zb);
            }
        }
    }

    /// Visit an objset's root block.  `ds` is `None` for the meta objset.
    pub(crate) fn visit_rootbp(&mut self, ds: Option<u64>, bp: &BlockPtr) {
        let objset = ds.unwrap_or(META_OBJSET);
        let zb = Bookmark::root(objset);
        if let Some(pf) = &self.prefetch {
            let position = if self.phys.bookmark.is_zero() {
                Bookmark::new(objset, 0, 0, 0)
            } else {
                self.phys.bookmark
            };
            pf.set_position(self.phys.cur_min_txg, position);
            pf.enqueue(bp, &zb, None);
        }
        self.objsets_visited_this_txg += 1;
        self.visitbp(bp, &zb, None);
    }

    /// Visit one block and everything beneath it
    fn visitbp(&mut self,
        bp: &BlockPtr,
        zb: &Bookmark,
        dnode: Option<DnodeGeometry>)
    {
        if self.check_suspend(Some(zb)) || self.check_resume(dnode, zb) {
            return;
        }
        self.visited_this_txg += 1;

        if bp.is_hole() {
            self.holes_this_txg += 1;
            return;
        }
        if bp.birth <= self.phys.cur_min_txg {
            self.lt_min_this_txg += 1;
            return;
        }

        if let Err(e) = self.recurse(bp, zb, dnode) {
            debug!(?zb, error = ?e, "cannot descend");
            return;
        }

        // The callback must not run for a block whose subtree will be
        // revisited after resuming
        if self.suspending {
            return;
        }
        // Already visited through the dedup table
        if self.svc.ddt.class_contains(self.phys.ddt_class_max, bp) {
            self.ddt_contained_this_txg += 1;
            return;
        }
        // A block from the future is only here on behalf of a destroyed
        // snapshot.  It will be visited on the next pass of this dataset.
        if bp.physical_birth() > self.phys.cur_max_txg {
            self.gt_max_this_txg += 1;
            return;
        }
        self.scan_cb(bp, zb);
    }

    /// Read a metadata block and visit its children
    fn recurse(&mut self,
        bp: &BlockPtr,
        zb: &Bookmark,
        dnode: Option<DnodeGeometry>) -> Result<()>
    {
        if !bp.is_metadata() {
            return Ok(());
        }
        let contents = match self.svc.blocks.read_block(bp, zb) {
            Ok(c) => c,
            Err(e) => {
                self.phys.errors += 1;
                return Err(e);
            }
        };
        let r = match contents {
            BlockContents::Indirect(children) if bp.level > 0 => {
                self.recurse_indirect(bp, zb, dnode, &children)
            }
            BlockContents::Dnodes(dnodes)
                if bp.level == 0 && bp.objtype == ObjType::Dnode =>
            {
                self.recurse_dnodes(bp, zb, &dnodes)
            }
            BlockContents::Objset(osp)
                if bp.level == 0 && bp.objtype == ObjType::Objset =>
            {
                let objset = zb.objset;
                if let Some(pf) = &self.prefetch {
                    pf.enqueue_dnode(&osp.meta_dnode, objset,
                        META_DNODE_OBJECT);
                }
                self.visitdnode(objset, &osp.meta_dnode, META_DNODE_OBJECT);
                // Accounting objects are never suspended in, so they must
                // not be visited once the meta-dnode has suspended.
                if !self.suspending {
                    let accounting = [
                        (&osp.projectused, PROJECTUSED_OBJECT),
                        (&osp.groupused, GROUPUSED_OBJECT),
                        (&osp.userused, USERUSED_OBJECT)
                    ];
                    for (dn, object) in accounting {
                        if let Some(dn) = dn {
                            self.visitdnode(objset, dn, object);
                        }
                    }
                }
                Ok(())
            }
            _ => Err(Error::EBADMSG)
        };
        if r.is_err() {
            self.phys.errors += 1;
        }
        r
    }

    fn recurse_indirect(&mut self,
        bp: &BlockPtr,
        zb: &Bookmark,
        dnode: Option<DnodeGeometry>,
        children: &[BlockPtr]) -> Result<()>
    {
        let epb = bp.lsize >> BLKPTR_SHIFT;
        if children.len() as u64 != epb {
            warn!(?zb, expected = epb, found = children.len(),
                "corrupt indirect block");
            return Err(Error::EBADMSG);
        }
        let czb = |i: usize| Bookmark::new(zb.objset, zb.object, zb.level - 1,
            zb.blkid * epb + i as u64);
        if let Some(pf) = &self.prefetch {
            for (i, cbp) in children.iter().enumerate() {
                pf.enqueue(cbp, &czb(i), dnode);
            }
        }
        for (i, cbp) in children.iter().enumerate() {
            self.visitbp(cbp, &czb(i), dnode);
        }
        Ok(())
    }

    fn recurse_dnodes(&mut self,
        bp: &BlockPtr,
        zb: &Bookmark,
        dnodes: &[Option<Dnode>]) -> Result<()>
    {
        let epb = bp.lsize >> DNODE_SHIFT;
        if dnodes.len() as u64 != epb {
            warn!(?zb, expected = epb, found = dnodes.len(),
                "corrupt dnode block");
            return Err(Error::EBADMSG);
        }
        let base = zb.blkid * epb;
        if let Some(pf) = &self.prefetch {
            for (i, dn) in dnodes.iter().enumerate() {
                if let Some(dn) = dn {
                    pf.enqueue_dnode(dn, zb.objset, base + i as u64);
                }
            }
        }
        for (i, dn) in dnodes.iter().enumerate() {
            if let Some(dn) = dn {
                self.visitdnode(zb.objset, dn, base + i as u64);
            }
        }
        Ok(())
    }

    /// Visit every top-level block of one dnode
    fn visitdnode(&mut self, objset: u64, dn: &Dnode, object: u64) {
        let geom = dn.geometry();
        let level = i64::from(dn.nlevels) - 1;
        for (j, bp) in dn.blkptr.iter().enumerate() {
            let czb = Bookmark::new(objset, object, level, j as u64);
            self.visitbp(bp, &czb, Some(geom));
        }
        if let Some(spill) = &dn.spill {
            let czb = Bookmark::new(objset, object, 0, SPILL_BLKID);
            self.visitbp(spill, &czb, Some(geom));
        }
    }

    /// Decide whether to suspend traversal before visiting `zb`.
    ///
    /// `None` means the dedup table pass, whose position lives in its own
    /// bookmark.
    pub(crate) fn check_suspend(&mut self, zb: Option<&Bookmark>) -> bool {
        if zb.is_some_and(Bookmark::is_accounting) {
            return false;
        }
        if self.suspending {
            return true;
        }
        if !self.phys.bookmark.is_zero() {
            // Still looking for the resume point
            return false;
        }
        // Only level-0 and objset blocks are valid resume points
        if zb.is_some_and(|zb| zb.level != 0 && zb.level != ROOT_LEVEL) {
            return false;
        }

        let pool = &self.svc.pool;
        let tun = &self.tunables;
        let elapsed = self.sync_start.elapsed();
        let dirty_min = pool.dirty_max() * tun.dirty_min_percent / 100;
        let forced = tun.suspend_after_blocks
            .is_some_and(|n| self.visited_this_txg >= n);
        let suspend = (elapsed > self.min_time() &&
                (pool.dirty_bytes() >= dirty_min ||
                 pool.sync_waiting() ||
                 pool.sync_elapsed() >= tun.txg_timeout())) ||
            pool.shutting_down() ||
            (tun.strict_mem_lim && self.should_clear()) ||
            forced;
        if !suspend {
            return false;
        }

        match zb {
            Some(zb) if zb.level == ROOT_LEVEL => {
                self.phys.bookmark = Bookmark::new(zb.objset, 0, 0, 0);
                debug!(objset = zb.objset,
                    "suspending at first dnode of objset");
            }
            Some(zb) => {
                self.phys.bookmark = *zb;
                debug!(bookmark = ?zb, "suspending");
            }
            None => {
                debug!(ddt_bookmark = ?self.phys.ddt_bookmark,
                    "suspending in dedup table");
            }
        }
        self.suspending = true;
        true
    }

    /// Returns true if the subtree at `zb` was completely visited before
    /// suspending.  Clears the bookmark once the resume point is reached.
    fn check_resume(&mut self, dnode: Option<DnodeGeometry>, zb: &Bookmark)
        -> bool
    {
        if self.phys.bookmark.is_zero() || zb.is_accounting() {
            return false;
        }
        if subtree_completed(dnode, zb, &self.phys.bookmark) {
            return true;
        }
        if subtree_tbd(dnode, zb, &self.phys.bookmark) {
            info!(bookmark = ?self.phys.bookmark, "resuming");
            self.phys.bookmark = Bookmark::default();
        }
        false
    }
}
