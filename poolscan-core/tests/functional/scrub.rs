// vim: tw=80

/// Scrub an entire pool, with and without interruptions
mod scrub {
    use poolscan_core::{
        bookmark::Bookmark,
        ext_tree::EXTENT_MEM,
        governor::MemLimits,
        io_queue::SIO_MEM,
        phys::*,
        pool::ScanEvent,
        stats::StatKey,
        tunables::Tunables,
        types::*,
    };
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use rstest_reuse::{apply, template};

    use crate::{Harness, START_TXG, fake::*};

    fn tunables(legacy: bool) -> Tunables {
        Tunables {
            legacy,
            ..Default::default()
        }
    }

    /// Tunables that suspend traversal after every few blocks
    fn choppy(legacy: bool) -> Tunables {
        Tunables {
            legacy,
            suspend_after_blocks: Some(10),
            import_wait_txgs: 2,
            ..Default::default()
        }
    }

    #[template]
    #[rstest]
    #[case::sorted(false)]
    #[case::legacy(true)]
    fn modes(#[case] legacy: bool) {}

    #[apply(modes)]
    fn complete(#[case] legacy: bool) {
        let mut h = Harness::new(tunables(legacy));
        h.start(ScanFunc::Scrub);
        assert!(h.scan.is_scrubbing());
        h.run();

        h.assert_read_once();
        let phys = h.scan.phys();
        assert_eq!(phys.state, ScanState::Finished);
        assert_eq!(phys.errors, 0);
        assert_eq!(phys.max_txg, START_TXG);
        assert_eq!(h.persisted().unwrap().state, ScanState::Finished);
        assert_eq!(h.pool.events(),
            vec![ScanEvent::ScrubStart, ScanEvent::ScrubFinish]);
        let reassessed = h.pool.reassessed();
        assert_eq!(reassessed.len(), 1);
        assert_eq!(reassessed[0].1, START_TXG);
        assert!(reassessed[0].2);
        assert_eq!(h.pool.rotations(), 1);
        // Only the intent log's blocks are read speculatively
        assert_eq!(h.pool.speculative_reads(), 2);
    }

    /// A scrub that suspends every few blocks must still read every block
    /// exactly once
    #[apply(modes)]
    fn suspend_and_resume(#[case] legacy: bool) {
        let mut h = Harness::new(choppy(legacy));
        h.start(ScanFunc::Scrub);
        let txgs = h.run();

        assert!(txgs > 10, "scrub finished too quickly: {txgs} txgs");
        h.assert_read_once();
        assert_eq!(h.scan.phys().state, ScanState::Finished);
    }

    /// No matter which block a txg's traversal suspends at, including the
    /// root of the origin snapshot, every block is still read exactly once
    #[apply(modes)]
    fn suspend_anywhere(#[case] legacy: bool) {
        for n in 1..=40 {
            let tunables = Tunables {
                suspend_after_blocks: Some(n),
                ..tunables(legacy)
            };
            let mut h = Harness::new(tunables);
            h.start(ScanFunc::Scrub);
            h.run();
            h.assert_read_once();
            assert_eq!(h.scan.phys().state, ScanState::Finished,
                "suspending after {n} blocks");
        }
    }

    /// An unsorted scan reads blocks in the same order whether or not it
    /// suspends.  The persisted bookmark names the next block to visit, and
    /// resuming picks up right there.
    #[test]
    fn resume_order() {
        let mut h = Harness::new(tunables(true));
        h.start(ScanFunc::Scrub);
        h.run();
        let full = h.pool.read_log();

        let mut h = Harness::new(choppy(true));
        h.start(ScanFunc::Scrub);
        let mut exact = 0;
        while h.scan.is_scanning() {
            h.sync();
            let log = h.pool.read_log();
            assert!(log.len() <= full.len());
            assert_eq!(log[..], full[..log.len()]);
            if !h.scan.is_scanning() {
                break;
            }
            let bookmark = h.persisted().unwrap().bookmark;
            assert_eq!(bookmark, h.scan.phys().bookmark);
            if bookmark.is_zero() {
                // Still walking the dedup table
                continue;
            }
            assert!(!log.contains(&bookmark),
                "{bookmark:?} was read before suspending there");
            if let Some(i) = full.iter().position(|zb| *zb == bookmark) {
                // The block at the bookmark is the next one read
                assert_eq!(i, log.len());
                exact += 1;
            }
        }
        assert!(exact > 0, "no suspension landed on a readable block");
        assert_eq!(h.pool.read_log(), full);
        h.assert_read_once();
    }

    /// An unsorted scan persists its bookmark every txg, so it resumes
    /// exactly where it left off after a crash
    #[test]
    fn crash_unsorted() {
        let mut h = Harness::new(choppy(true));
        h.start(ScanFunc::Scrub);
        for _ in 0..5 {
            h.sync();
        }
        assert!(h.scan.is_scanning());
        let persisted = h.persisted().unwrap();
        assert_ne!(persisted.bookmark, Bookmark::default());

        h.reimport(choppy(true));
        assert!(h.scan.is_scanning());
        assert_eq!(h.scan.phys().bookmark, persisted.bookmark);
        // Statistics can't be rebuilt for the part of the pool that was
        // scanned before the crash
        assert!(h.scan.block_stats().is_none());
        h.run();

        h.assert_read_once();
        assert_eq!(h.scan.phys().state, ScanState::Finished);
    }

    /// A sorted scan loses its queued reads in a crash, but must still read
    /// every block
    #[test]
    fn crash_sorted() {
        let mut h = Harness::new(choppy(false));
        h.start(ScanFunc::Scrub);
        for _ in 0..5 {
            h.sync();
        }
        assert!(h.scan.is_scanning());

        h.reimport(choppy(false));
        assert!(h.scan.is_scanning());
        h.run();

        h.assert_read_all();
        assert_eq!(h.scan.phys().state, ScanState::Finished);
    }

    /// The persisted state may only change while no reads are queued.
    /// Otherwise a crash could lose reads from before the bookmark.
    #[test]
    fn checkpoint_only_when_drained() {
        let tunables = Tunables {
            mem_lim_fact: 4 << 20,
            mem_lim_min: 0,
            ..choppy(false)
        };
        let mut h = Harness::new(tunables);
        h.start(ScanFunc::Scrub);
        let mut checkpoints = 0;
        while h.scan.is_scanning() {
            let before = h.persisted();
            h.sync();
            let after = h.persisted();
            if before != after {
                assert_eq!(h.scan.queued_ios(), 0,
                    "checkpointed with reads still queued");
                if h.scan.is_scanning() {
                    checkpoints += 1;
                }
            }
        }
        assert!(checkpoints > 0);
        h.assert_read_once();
    }

    /// Traversal stops once the queues use too much memory
    #[test]
    fn memory_bound() {
        let tunables = Tunables {
            mem_lim_fact: 4 << 20,
            mem_lim_min: 0,
            ..Default::default()
        };
        let mut h = Harness::new(tunables.clone());
        let limits = MemLimits::new(&*h.pool, &tunables);
        assert_eq!(limits.hard, 4096);
        h.start(ScanFunc::Scrub);
        let mut peak = 0;
        let mut txgs = 0;
        while h.scan.is_scanning() {
            h.sync();
            peak = peak.max(h.scan.queue_mem_used());
            txgs += 1;
        }
        // Traversal may overshoot by the blocks that finish between two
        // opportunities to suspend
        let slop = 16 * (SIO_MEM + EXTENT_MEM);
        assert!(peak <= limits.hard + slop, "peak usage was {peak}");
        assert!(txgs > 2, "queues never filled up");
        h.assert_read_once();
    }

    /// Without a clone index, clones are found by searching every head
    /// dataset
    #[apply(modes)]
    fn no_clone_index(#[case] legacy: bool) {
        let mut h = Harness::new(tunables(legacy));
        h.pool.update_dataset(ORIGIN, |ds| ds.next_clones = None);
        h.pool.update_dataset(A1, |ds| ds.next_clones = None);
        h.start(ScanFunc::Scrub);
        h.run();
        h.assert_read_once();
    }

    /// Dedup blocks up to the configured class are read from the dedup
    /// table, and the rest from the tree
    #[test]
    fn dedup() {
        let mut h = Harness::new(tunables(false));
        h.start(ScanFunc::Scrub);
        h.run();
        assert_eq!(h.pool.read_count(&h.layout.ddt_dup), 1);
        assert_eq!(h.pool.read_count(&h.layout.ddt_unique), 1);
        assert_eq!(h.scan.phys().ddt_bookmark.class, 2);
    }

    /// With no_scrub_io, the scan traverses but reads nothing
    #[test]
    fn no_scrub_io() {
        let tunables = Tunables {
            no_scrub_io: true,
            ..Default::default()
        };
        let mut h = Harness::new(tunables);
        h.start(ScanFunc::Scrub);
        let txgs = h.run();
        // Nothing is ever queued, so the scan finishes right after its
        // traversal does
        assert!(txgs <= 3, "scan took {txgs} txgs");
        assert!(h.pool.reads().is_empty());
        let phys = h.scan.phys();
        assert_eq!(phys.state, ScanState::Finished);
        assert_eq!(phys.skipped, phys.examined);
    }

    #[test]
    fn errors() {
        let mut h = Harness::new(tunables(false));
        let bad = h.layout.a.data(0, 1);
        h.pool.set_bad(&bad);
        h.start(ScanFunc::Scrub);
        h.run();
        assert_eq!(h.scan.phys().errors, 1);
        assert_eq!(h.scan.stats().errors, 1);
    }

    #[apply(modes)]
    fn stats(#[case] legacy: bool) {
        let mut h = Harness::new(tunables(legacy));
        let allocated = h.pool.allocated();
        h.start(ScanFunc::Scrub);

        let stats = h.scan.stats();
        assert_eq!(stats.func, ScanFunc::Scrub);
        assert_eq!(stats.state, ScanState::Scanning);
        assert_eq!(stats.examined, 0);
        assert!(stats.to_examine > 0);

        h.run();
        let stats = h.scan.stats();
        let asize = allocated.iter().map(BlockPtr::asize).sum::<u64>();
        assert_eq!(stats.state, ScanState::Finished);
        assert_eq!(stats.examined, asize);
        assert_eq!(stats.to_examine, asize);
        assert_eq!(stats.skipped, 0);
        assert_eq!(stats.processed, stats.issued);
        assert!(stats.issued > 0);
        assert_eq!(stats.remaining_secs, None);
        assert!(stats.end_time >= stats.start_time);
        let yaml = stats.to_yaml().unwrap();
        assert!(yaml.contains("state: Finished"), "{yaml}");

        let blkstats = h.scan.block_stats().unwrap();
        let total = blkstats.get(&StatKey::TOTAL).unwrap();
        assert_eq!(total.count, allocated.len() as u64);
        assert_eq!(total.asize, asize);
        assert_eq!(total.gangs, 1);
        let objsets = StatKey{level: None, objtype: Some(ObjType::Objset)};
        // One root block for each generation of each objset
        assert_eq!(blkstats.get(&objsets).unwrap().count, 5);
    }
}
