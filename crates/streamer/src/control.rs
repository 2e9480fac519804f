//! Run control flags and the shared run context

use crate::stats::RunStats;
use std::sync::atomic::{AtomicU8, Ordering};

const RUNNING: u8 = 0b01;
const STOP_REQUESTED: u8 = 0b10;

/// The two flags coordinating the caller and the driver thread
///
/// Both live in one atomic word so that claiming a run and discarding a
/// stale stop request happen together: a stop requested after the claim is
/// never lost.
#[derive(Debug, Default)]
pub struct RunControl {
    flags: AtomicU8,
}

impl RunControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the single run slot and clear any earlier stop request; false
    /// if a run is already active
    pub(crate) fn try_begin(&self) -> bool {
        self.flags
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |flags| {
                (flags & RUNNING == 0).then_some(RUNNING)
            })
            .is_ok()
    }

    /// Clear `running`; called by the driver as its last action, or by
    /// `start` when the driver could not be spawned
    pub(crate) fn finish(&self) {
        self.flags.fetch_and(!RUNNING, Ordering::Release);
    }

    pub fn is_running(&self) -> bool {
        self.flags.load(Ordering::Acquire) & RUNNING != 0
    }

    pub fn request_stop(&self) {
        self.flags.fetch_or(STOP_REQUESTED, Ordering::Release);
    }

    pub fn stop_requested(&self) -> bool {
        self.flags.load(Ordering::Acquire) & STOP_REQUESTED != 0
    }
}

/// State shared by the controller and each run's driver thread
#[derive(Debug, Default)]
pub struct RunContext {
    pub control: RunControl,
    pub stats: RunStats,
}

impl RunContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Zero the statistics for a new run; the caller must already own `running`
    pub(crate) fn reset_for_run(&self) {
        self.stats.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_run_claim() {
        let control = RunControl::new();
        assert!(control.try_begin());
        assert!(control.is_running());
        assert!(!control.try_begin());

        control.finish();
        assert!(!control.is_running());
        assert!(control.try_begin());
    }

    #[test]
    fn test_stop_flag() {
        let control = RunControl::new();
        assert!(!control.stop_requested());
        control.request_stop();
        assert!(control.stop_requested());
        assert!(!control.is_running());
    }

    #[test]
    fn test_claim_discards_stale_stop() {
        let control = RunControl::new();
        control.request_stop();

        assert!(control.try_begin());
        assert!(!control.stop_requested());
    }

    #[test]
    fn test_stop_after_claim_survives_reset() {
        let context = RunContext::new();
        assert!(context.control.try_begin());
        context.control.request_stop();
        context.stats.record_failure();

        context.reset_for_run();
        assert!(context.control.stop_requested());
        assert!(context.control.is_running());
        assert_eq!(context.stats.failure_count(), 0);
    }

    #[test]
    fn test_busy_claim_keeps_stop_request() {
        let control = RunControl::new();
        assert!(control.try_begin());
        control.request_stop();

        assert!(!control.try_begin());
        assert!(control.stop_requested());
        control.finish();
        assert!(!control.is_running());
        assert!(control.stop_requested());
    }
}
