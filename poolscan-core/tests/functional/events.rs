// vim: tw=80

/// Pool events that happen during a scan
mod events {
    use std::{collections::BTreeMap, thread, time::Duration};

    use poolscan_core::{
        ddt::{DdtClass, DdtEntry},
        phys::*,
        pool::{Pool, ScanEvent},
        scan::PauseCmd,
        store::MetaStore,
        tunables::Tunables,
        types::*,
    };
    use pretty_assertions::assert_eq;

    use crate::{Harness, fake::*};

    fn choppy(legacy: bool) -> Tunables {
        Tunables {
            legacy,
            suspend_after_blocks: Some(10),
            ..Default::default()
        }
    }

    /// Sync until the traversal suspends within `objset`
    fn sync_until_in(h: &mut Harness, objset: u64) {
        while h.scan.phys().bookmark.objset != objset {
            assert!(h.scan.is_scanning(), "never suspended in {objset}");
            h.sync();
        }
    }

    /// The dataset queue as last persisted
    fn persisted_queue(h: &Harness) -> BTreeMap<u64, TxgT> {
        let obj = h.persisted().unwrap().queue_obj;
        let buf = t!(h.store.read_object(obj));
        t!(decode(&buf))
    }

    #[test]
    fn cancel() {
        let mut h = Harness::new(choppy(false));
        h.start(ScanFunc::Scrub);
        h.sync();
        h.sync();
        assert!(h.scan.queued_ios() > 0);

        t!(h.scan.cancel(h.txg));
        assert!(!h.scan.is_scanning());
        assert_eq!(h.scan.queued_ios(), 0);
        assert_eq!(h.scan.phys().state, ScanState::Canceled);
        let persisted = h.persisted().unwrap();
        assert_eq!(persisted.state, ScanState::Canceled);
        assert_eq!(persisted.queue_obj, 0);
        assert_eq!(h.store.objects(), 0);
        assert_eq!(h.pool.events(),
            vec![ScanEvent::ScrubStart, ScanEvent::ScrubAbort]);
        let reassessed = h.pool.reassessed();
        assert_eq!(reassessed.len(), 1);
        assert_eq!(reassessed[0].1, TxgT(0));

        assert_eq!(h.scan.cancel(h.txg), Err(Error::ENOENT));
    }

    #[test]
    fn pause() {
        let mut h = Harness::new(choppy(false));
        assert_eq!(h.scan.pause_resume(PauseCmd::Pause), Err(Error::ENOENT));
        h.start(ScanFunc::Scrub);
        h.sync();
        let waiter = h.scan.waiter();
        let gen = waiter.generation();

        t!(h.scan.pause_resume(PauseCmd::Pause));
        assert!(h.scan.is_paused());
        assert!(h.scan.stats().paused);
        assert!(h.persisted().unwrap().is_paused());
        assert!(waiter.wait_past(gen, Duration::ZERO));
        assert_eq!(h.scan.pause_resume(PauseCmd::Pause), Err(Error::EBUSY));

        let reads = h.pool.reads();
        let examined = h.scan.phys().examined;
        for _ in 0..5 {
            h.sync();
        }
        assert_eq!(h.pool.reads(), reads);
        assert_eq!(h.scan.phys().examined, examined);

        // Starting a paused scrub resumes it
        h.start(ScanFunc::Scrub);
        assert!(!h.scan.is_paused());
        h.run();
        h.assert_read_once();
        assert_eq!(h.pool.events(), vec![
            ScanEvent::ScrubStart,
            ScanEvent::ScrubPaused,
            ScanEvent::ScrubResumed,
            ScanEvent::ScrubFinish
        ]);
    }

    /// Resuming a scan that isn't paused does nothing
    #[test]
    fn resume_unpaused() {
        let mut h = Harness::new(Tunables::default());
        h.start(ScanFunc::Scrub);
        t!(h.scan.pause_resume(PauseCmd::Resume));
        assert!(h.scan.is_scanning());
        assert!(!h.scan.is_paused());
    }

    /// Another thread can wait for the scan to finish
    #[test]
    fn wait() {
        let mut h = Harness::new(choppy(false));
        let waiter = h.scan.waiter();
        let gen = waiter.generation();
        let jh = thread::spawn(move || {
            waiter.wait_past(gen, Duration::from_secs(60))
        });
        h.start(ScanFunc::Scrub);
        h.run();
        assert!(jh.join().unwrap());
    }

    /// A starting scan must refuse while another one runs
    #[test]
    fn busy() {
        let mut h = Harness::new(Tunables::default());
        h.start(ScanFunc::Scrub);
        assert_eq!(h.scan.setup(ScanFunc::Scrub), Err(Error::EBUSY));
        assert_eq!(h.scan.start(ScanFunc::None, h.txg), Err(Error::EINVAL));
    }

    /// A block freed while its read is queued is never read
    #[test]
    fn block_freed() {
        let mut h = Harness::new(Tunables::default());
        h.start(ScanFunc::Scrub);
        // The first txg traverses everything, but issues nothing
        h.sync();
        assert!(h.scan.queued_ios() > 0);

        let doomed = h.layout.a.data(0, 1);
        h.pool.push_free(doomed);
        h.run();

        assert_eq!(h.pool.read_count(&doomed), 0);
        assert_eq!(h.scan.phys().skipped, doomed.asize());
        h.assert_read_once();
    }

    /// Destroying the snapshot being traversed moves traversal to the next
    /// snapshot, which must then be visited twice
    #[test]
    fn destroy_current_snapshot() {
        let mut h = Harness::new(choppy(true));
        h.start(ScanFunc::Scrub);
        sync_until_in(&mut h, A2);

        let a2 = h.pool.remove_dataset(A2);
        h.pool.update_dataset(A, |ds| {
            ds.prev_snap_obj = A1;
            ds.prev_snap_txg = TxgT(20);
        });
        h.pool.update_dataset(A1, |ds| ds.next_snap_obj = A);
        t!(h.scan.ds_destroyed(&a2));
        let phys = *h.scan.phys();
        assert_eq!(phys.bookmark.objset, A);
        assert!(phys.flags.visit_ds_again());
        // An unsorted scan has nothing queued, so the rewritten bookmark is
        // persisted at once
        let persisted = h.persisted().unwrap();
        assert_eq!(persisted.bookmark, phys.bookmark);
        assert!(persisted.flags.visit_ds_again());
        h.run();

        assert_eq!(h.scan.phys().state, ScanState::Finished);
        let twice = h.pool.reads().into_iter()
            .filter(|(_, n)| *n > 1)
            .collect::<Vec<_>>();
        assert!(twice.is_empty(), "read more than once: {twice:?}");
        for bp in h.layout.a.data_blocks() {
            assert_eq!(h.pool.read_count(&bp), bp.ndvas() as u64,
                "{bp:?} was never read");
        }
    }

    /// Destroying a queued dataset removes it from the queue
    #[test]
    fn destroy_queued_head() {
        let mut h = Harness::new(choppy(true));
        h.start(ScanFunc::Scrub);
        sync_until_in(&mut h, A2);
        assert!(persisted_queue(&h).contains_key(&B));

        let b = h.pool.remove_dataset(B);
        h.pool.update_dataset(A1, |ds| {
            ds.num_children = 1;
            ds.next_clones = Some(Vec::new());
        });
        t!(h.scan.ds_destroyed(&b));
        assert!(!persisted_queue(&h).contains_key(&B));
        h.run();
        assert_eq!(h.scan.phys().state, ScanState::Finished);
    }

    /// Snapshotting the head being traversed moves traversal to the new
    /// snapshot
    #[test]
    fn snapshot_current_head() {
        const SNAP: u64 = 21;

        let mut h = Harness::new(choppy(true));
        h.start(ScanFunc::Scrub);
        sync_until_in(&mut h, B);

        let mut snap = t!(h.pool.dataset(B));
        snap.obj = SNAP;
        snap.is_snapshot = true;
        snap.creation_txg = h.txg;
        snap.next_snap_obj = B;
        snap.dir_origin = None;
        snap.zil = None;
        h.pool.add_dataset(snap);
        let txg = h.txg;
        h.pool.update_dataset(B, |ds| {
            ds.prev_snap_obj = SNAP;
            ds.prev_snap_txg = txg;
        });
        t!(h.scan.ds_snapshotted(B, SNAP));
        assert_eq!(h.scan.phys().bookmark.objset, SNAP);
        assert_eq!(h.persisted().unwrap().bookmark, h.scan.phys().bookmark);
        h.run();

        assert_eq!(h.scan.phys().state, ScanState::Finished);
        h.assert_read_once();
    }

    /// Promoting a clone swaps it with its origin's head in the queue
    #[test]
    fn clone_swapped() {
        let mut h = Harness::new(choppy(true));
        h.start(ScanFunc::Scrub);
        sync_until_in(&mut h, A2);
        let queue = persisted_queue(&h);
        let mintxg = queue[&B];
        assert!(!queue.contains_key(&A));

        t!(h.scan.ds_clone_swapped(B, A));
        let queue = persisted_queue(&h);
        assert!(!queue.contains_key(&B));
        assert_eq!(queue[&A], mintxg);
        assert_eq!(h.scan.phys().bookmark.objset, A2);
        assert_eq!(h.persisted().unwrap().bookmark.objset, A2);
        h.run();
        assert_eq!(h.scan.phys().state, ScanState::Finished);
    }

    /// A replaced device's queued reads go to its replacement
    #[test]
    fn vdev_replaced() {
        const NEW: u64 = 7;

        let mut h = Harness::new(Tunables::default());
        h.start(ScanFunc::Scrub);
        h.sync();
        assert!(h.scan.queued_ios() > 0);

        h.scan.vdev_replaced(1, NEW);
        h.run();

        let reads = h.pool.reads();
        for bp in h.pool.allocated().iter().filter(|bp| !bp.is_gang()) {
            for dva in bp.dvas().filter(|dva| dva.vdev == 1) {
                assert_eq!(reads.get(&(NEW, dva.offset)), Some(&1));
                assert_eq!(reads.get(&(1, dva.offset)), None);
            }
        }
    }

    /// A dedup entry that moves to a class the walk already passed is
    /// scanned right away
    #[test]
    fn ddt_entry_promoted() {
        let mut h = Harness::new(Tunables{legacy: true, ..Default::default()});
        let bp = h.layout.ddt_unique;
        let dde = DdtEntry{phys: vec![bp]};

        // Nothing happens when no scan is running
        h.scan.ddt_entry_promoted(DdtClass::Unique, DdtClass::Duplicate, &dde);
        h.start(ScanFunc::Scrub);
        // Nor when the entry is demoted
        h.scan.ddt_entry_promoted(DdtClass::Duplicate, DdtClass::Unique, &dde);
        h.sync();
        assert_eq!(h.pool.read_count(&bp), 1);

        h.scan.ddt_entry_promoted(DdtClass::Unique, DdtClass::Duplicate, &dde);
        h.sync();
        assert_eq!(h.pool.read_count(&bp), 2);
    }
}
