// vim: tw=80
//! Error scrub: re-read only the blocks listed in the pool's error log
//!
//! Blocks that read cleanly are removed from the log.  An error scrub shares
//! the scan controller's throttle and runtime, but never runs at the same
//! time as a scrub or resilver.

use std::{sync::Arc, time::Instant};

use tracing::{debug, info, warn};

use crate::{
    io_queue::IoCounters,
    phys::{self, *},
    pool::ScanEvent,
    scan::{PauseCmd, Scan},
    scrub::ReadKind,
    stats::ErrorScrubStats,
    types::*,
};

/// Error scrub state owned by the scan controller
#[derive(Debug, Default)]
pub struct ErrorScrub {
    pub(crate) phys: ErrorScrubPhys,
    /// When the error scrub was paused, or zero
    pub(crate) pause: Timestamp,
    /// Total seconds spent paused
    pub(crate) spent_paused: u64,
    pub(crate) counters: Arc<IoCounters>,
}

impl Scan {
    pub fn is_errorscrubbing(&self) -> bool {
        self.es.phys.is_running()
    }

    /// Begin scrubbing the blocks in the error log
    pub(crate) fn errorscrub_setup(&mut self) -> Result<()> {
        if self.es.phys.is_running() || self.is_scanning() {
            return Err(Error::EBUSY);
        }
        let count = self.svc.errlog.count();
        if count == 0 {
            return Err(Error::ECANCELED);
        }
        self.es.counters.take();
        self.es.pause = Timestamp(0);
        self.es.spent_paused = 0;
        self.es.phys = ErrorScrubPhys {
            func: ScanFunc::ErrorScrub,
            state: ScanState::ErrorScrubbing,
            start_time: Timestamp::now(),
            to_examine: count,
            ..Default::default()
        };
        self.svc.pool.notify(ScanEvent::ErrorScrubStart);
        self.errorscrub_sync_state()?;
        info!(entries = count, txg = %self.txg, "error scrub setup");
        Ok(())
    }

    pub(crate) fn errorscrub_sync_state(&mut self) -> Result<()> {
        self.es.phys.errors += self.es.counters.take().2;
        let buf = phys::encode(&self.es.phys)?;
        self.svc.store.update(ERRORSCRUB_RECORD, &buf)
    }

    fn errorscrub_done(&mut self, complete: bool) -> Result<()> {
        self.es.phys.state = if complete {
            ScanState::Finished
        } else {
            ScanState::Canceled
        };
        self.es.phys.end_time = Timestamp::now();
        self.es.phys.flags.set_paused(false);
        self.notify_waiters();
        self.svc.pool.notify(if complete {
            ScanEvent::ErrorScrubFinish
        } else {
            ScanEvent::ErrorScrubAbort
        });
        self.errorscrub_sync_state()?;
        info!(examined = self.es.phys.examined, errors = self.es.phys.errors,
            complete, "error scrub done");
        Ok(())
    }

    pub(crate) fn errorscrub_cancel(&mut self) -> Result<()> {
        if !self.es.phys.is_running() {
            return Err(Error::ENOENT);
        }
        self.errorscrub_done(false)
    }

    pub(crate) fn errorscrub_pause_resume(&mut self, cmd: PauseCmd)
        -> Result<()>
    {
        match cmd {
            PauseCmd::Pause => {
                if !self.es.phys.is_running() {
                    return Err(Error::ENOENT);
                }
                if self.es.phys.is_paused() {
                    return Err(Error::EBUSY);
                }
                self.es.pause = Timestamp::now();
                self.es.phys.flags.set_paused(true);
                self.errorscrub_sync_state()?;
                self.svc.pool.notify(ScanEvent::ErrorScrubPaused);
                info!("error scrub paused");
            }
            PauseCmd::Resume => {
                if self.es.phys.is_paused() {
                    // The pause time is lost across an import
                    if !self.es.pause.is_zero() {
                        self.es.spent_paused +=
                            Timestamp::now().since(self.es.pause);
                    }
                    self.es.pause = Timestamp(0);
                    self.es.phys.flags.set_paused(false);
                    self.errorscrub_sync_state()?;
                    info!("error scrub resumed");
                }
            }
        }
        Ok(())
    }

    fn errorscrub_should_suspend(&self, start: Instant, n: u64) -> bool {
        let pool = &self.svc.pool;
        let elapsed = start.elapsed();
        n >= self.tunables.error_blocks_per_txg ||
            (elapsed > self.tunables.scrub_min_time() &&
             (pool.sync_waiting() ||
              pool.sync_elapsed() >= self.tunables.txg_timeout())) ||
            pool.shutting_down()
    }

    /// Scrub the next batch of error log entries
    pub(crate) fn errorscrub_sync(&mut self) -> Result<()> {
        let pool = self.svc.pool.clone();
        if pool.shutting_down() ||
            !self.es.phys.is_running() ||
            self.es.phys.is_paused()
        {
            return Ok(());
        }
        if self.is_resilvering() {
            // A resilver supersedes the error scrub
            warn!("resilver started; cancelling error scrub");
            return self.errorscrub_cancel();
        }
        if self.tunables.suspend_progress {
            return Ok(());
        }

        let start = Instant::now();
        let errlog = self.svc.errlog.clone();
        let blocks = self.svc.blocks.clone();
        let mut flags = IoFlags::default();
        flags.set_scrub(true);
        flags.set_canfail(true);
        flags.set_scan_thread(true);
        let mut n = 0;
        let finished = loop {
            if self.errorscrub_should_suspend(start, n) {
                break false;
            }
            let (key, zb) = match errlog.next_entry(self.es.phys.cursor) {
                Some(entry) => entry,
                None => break true
            };
            self.es.phys.cursor = key + 1;
            self.es.phys.examined += 1;
            n += 1;
            match blocks.locate(&zb) {
                Ok(bp) if !bp.is_hole() && !bp.embedded => {
                    self.exec_immediate(&bp, flags, &zb, ReadKind::ErrorScrub);
                }
                Ok(_) => {
                    // The block was freed since the error was logged
                    errlog.remove(&zb);
                }
                Err(e) => {
                    debug!(?zb, error = ?e, "cannot locate logged block");
                }
            }
        };
        self.wait_immediate();
        debug!(txg = %self.txg, scrubbed = n, finished, "error scrub pass");
        if finished {
            self.errorscrub_done(true)
        } else {
            self.errorscrub_sync_state()
        }
    }

    /// Report the error scrub's progress
    pub fn errorscrub_stats(&self) -> ErrorScrubStats {
        use std::sync::atomic::Ordering::Relaxed;

        let p = &self.es.phys;
        let mut spent_paused = self.es.spent_paused;
        if !self.es.pause.is_zero() {
            spent_paused += Timestamp::now().since(self.es.pause);
        }
        ErrorScrubStats {
            state: p.state,
            start_time: p.start_time,
            end_time: p.end_time,
            to_examine: p.to_examine,
            examined: p.examined,
            errors: p.errors + self.es.counters.errors.load(Relaxed),
            paused: p.is_paused(),
            spent_paused,
        }
    }
}
