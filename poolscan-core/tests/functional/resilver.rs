// vim: tw=80

/// Resilver a device that missed some txgs
mod resilver {
    use std::collections::HashMap;

    use poolscan_core::{
        phys::*,
        pool::ScanEvent,
        scan::PauseCmd,
        tunables::Tunables,
        types::*,
    };
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use crate::{Harness, fake::*};

    /// The device that missed some writes
    const VDEV: u64 = 1;
    const DTL_MIN: TxgT = TxgT(20);
    const DTL_MAX: TxgT = TxgT(30);

    fn harness(legacy: bool) -> Harness {
        let tunables = Tunables {
            legacy,
            ..Default::default()
        };
        let h = Harness::new(tunables);
        h.pool.set_dtl(VDEV, DTL_MIN, DTL_MAX);
        h
    }

    /// Every copy of every block that must be repaired
    fn expected_reads(h: &Harness) -> HashMap<Addr, u64> {
        h.pool.allocated().iter()
            .filter(|bp| {
                let birth = bp.physical_birth();
                DTL_MIN <= birth && birth <= DTL_MAX &&
                    bp.dvas().any(|dva| dva.vdev == VDEV || dva.gang)
            }).flat_map(|bp| addrs(bp).collect::<Vec<_>>())
            .map(|addr| (addr, 1))
            .collect()
    }

    /// Only blocks born in the missing range, with a copy on the damaged
    /// device, are read
    #[rstest]
    #[case::sorted(false)]
    #[case::legacy(true)]
    fn dtl_range(#[case] legacy: bool) {
        let mut h = harness(legacy);
        h.start(ScanFunc::Resilver);
        // The resilver begins in the next txg
        assert!(!h.scan.is_scanning());
        h.sync();
        h.sync();
        assert!(h.scan.is_resilvering());
        let phys = *h.scan.phys();
        assert_eq!(phys.min_txg, DTL_MIN - 1);
        assert_eq!(phys.max_txg, DTL_MAX + 1);
        h.run();

        let expected = expected_reads(&h);
        assert!(!expected.is_empty());
        assert_eq!(h.pool.reads(), expected);
        assert_eq!(h.scan.phys().state, ScanState::Finished);
        assert_eq!(h.pool.events(),
            vec![ScanEvent::ResilverStart, ScanEvent::ResilverFinish]);
        let reassessed = h.pool.reassessed();
        assert_eq!(reassessed.len(), 1);
        assert_eq!(reassessed[0].1, DTL_MAX + 1);
        assert!(reassessed[0].2);
    }

    /// Starting a resilver when no device needs one does nothing
    #[test]
    fn not_needed() {
        let mut h = Harness::new(Tunables::default());
        h.start(ScanFunc::Resilver);
        h.sync();
        h.sync();
        assert!(!h.scan.is_scanning());
        assert!(h.pool.events().is_empty());
        assert!(h.pool.reads().is_empty());
    }

    /// A device that fails during a scrub restarts the scan as a resilver
    #[test]
    fn restart_scrub() {
        let tunables = Tunables {
            suspend_after_blocks: Some(10),
            ..Default::default()
        };
        let mut h = Harness::new(tunables);
        h.start(ScanFunc::Scrub);
        for _ in 0..3 {
            h.sync();
        }
        assert!(h.scan.is_scrubbing());

        h.pool.set_dtl(VDEV, DTL_MIN, DTL_MAX);
        h.scan.resilver_restart(TxgT(0));
        h.sync();
        assert!(h.scan.is_resilvering());
        h.run();

        assert_eq!(h.scan.phys().state, ScanState::Finished);
        assert_eq!(h.scan.phys().func, ScanFunc::Resilver);
        assert_eq!(h.pool.events(), vec![
            ScanEvent::ScrubStart,
            ScanEvent::ResilverStart,
            ScanEvent::ResilverFinish
        ]);
        let reassessed = h.pool.reassessed();
        assert_eq!(reassessed.len(), 2);
        // The abandoned scrub can't vouch for any txg
        assert_eq!(reassessed[0].1, TxgT(0));
        assert_eq!(reassessed[1].1, DTL_MAX + 1);
    }

    /// Only scrubs can be paused
    #[test]
    fn no_pause() {
        let mut h = harness(false);
        h.start(ScanFunc::Resilver);
        h.sync();
        h.sync();
        assert!(h.scan.is_resilvering());
        let r = h.scan.pause_resume(PauseCmd::Pause);
        assert_eq!(r, Err(Error::ENOENT));
    }
}
