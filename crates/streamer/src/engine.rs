//! Streaming engine
//!
//! [`StreamEngine`] owns everything one run needs on the driver thread: the
//! transfer session, the slot pool, the submitter and the throughput window.
//! It moves through `Initializing -> Streaming -> Draining -> Stopped`, never
//! backwards.
//!
//! Completions are handled one at a time on the driver thread, so the
//! counters and resubmission below need no locking. The only state shared
//! with other threads is the atomics in [`RunContext`].

use crate::config::RunConfig;
use crate::control::RunContext;
use crate::error::{StartError, TransportError};
use crate::slot::{SlotPool, SlotState};
use crate::stats::{StatsSnapshot, ThroughputWindow};
use crate::submitter::Submitter;
use crate::transport::{Completion, TransferSession};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// Upper bound on a single wait for transport events
pub const MAX_EVENT_WAIT: Duration = Duration::from_secs(1);

/// Pause after a failed wait before trying again
const EVENT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Driver state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    Initializing,
    Streaming,
    Draining,
    Stopped,
}

/// Sink for the periodic statistics refresh
pub type SnapshotSender = async_channel::Sender<StatsSnapshot>;

pub struct StreamEngine<S: TransferSession> {
    session: S,
    pool: SlotPool<S::Handle>,
    submitter: Submitter,
    context: Arc<RunContext>,
    window: ThroughputWindow,
    state: DriverState,
    deadline: Option<Instant>,
    refresh_interval: Duration,
    completed: Vec<Completion>,
}

impl<S: TransferSession> StreamEngine<S> {
    /// Initializing: allocate the pool and submit the first `queue_depth` requests
    ///
    /// Fails if the pool cannot be allocated or if every initial submission
    /// is rejected. On failure the pool has already been released.
    pub fn prime(
        mut session: S,
        config: &RunConfig,
        context: Arc<RunContext>,
    ) -> Result<Self, StartError> {
        let submitter = Submitter::for_config(config);
        let iso_packets = submitter.iso_packets();

        let pool = SlotPool::allocate(config.queue_depth, submitter.request_length(), |id| {
            session.alloc_handle(id, iso_packets)
        })?;

        let now = Instant::now();
        let mut engine = Self {
            session,
            pool,
            submitter,
            context,
            window: ThroughputWindow::new(config.queue_depth, now),
            state: DriverState::Initializing,
            deadline: None,
            refresh_interval: config.refresh_interval,
            completed: Vec::with_capacity(config.queue_depth),
        };

        engine.submit_initial()?;

        let now = Instant::now();
        engine.window.restart(now);
        engine.deadline = config.duration.map(|duration| now + duration);
        engine.state = DriverState::Streaming;
        Ok(engine)
    }

    fn submit_initial(&mut self) -> Result<(), StartError> {
        let mut accepted = 0;
        let mut last_error: Option<TransportError> = None;

        for slot in self.pool.iter_mut() {
            match self.submitter.submit(&mut self.session, slot) {
                Ok(()) => {
                    self.context.stats.request_submitted();
                    accepted += 1;
                }
                Err(e) => {
                    warn!("Initial submission of slot {} rejected: {}", slot.id(), e);
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(last) if accepted == 0 => {
                self.pool.release();
                Err(StartError::Submission {
                    queue_depth: self.pool.len(),
                    last,
                })
            }
            Some(_) => {
                warn!(
                    "Only {} of {} initial requests queued",
                    accepted,
                    self.pool.len()
                );
                Ok(())
            }
            None => {
                debug!("Queued {} requests", accepted);
                Ok(())
            }
        }
    }

    pub fn state(&self) -> DriverState {
        self.state
    }

    pub fn context(&self) -> &Arc<RunContext> {
        &self.context
    }

    pub fn pool(&self) -> &SlotPool<S::Handle> {
        &self.pool
    }

    /// Handle one completed request
    ///
    /// Counts it, feeds the throughput window, then resubmits the slot
    /// unless a stop has been requested.
    pub fn handle_completion(&mut self, completion: Completion, now: Instant) {
        let stats = &self.context.stats;

        let Some(slot) = self.pool.get_mut(completion.slot) else {
            warn!("Completion for unknown slot {}, ignoring", completion.slot);
            return;
        };
        if slot.state != SlotState::Submitted {
            warn!(
                "Completion for slot {} in state {:?}, ignoring",
                completion.slot, slot.state
            );
            return;
        }

        slot.state = SlotState::Completed;
        stats.request_completed();

        let size = if completion.status.is_success() {
            let bytes = self.submitter.transferred_bytes(&completion);
            stats.record_success(bytes);
            bytes
        } else {
            trace!(
                "Request on slot {} finished with {:?}",
                completion.slot, completion.status
            );
            stats.record_failure();
            0
        };

        if let Some(kbps) = self.window.record(size, now) {
            stats.publish_throughput(kbps);
        }

        if self.context.control.stop_requested() {
            slot.state = SlotState::Idle;
            trace!("Slot {} retired", completion.slot);
            return;
        }

        match self.submitter.submit(&mut self.session, slot) {
            Ok(()) => stats.request_submitted(),
            Err(e) => warn!(
                "Resubmission of slot {} rejected: {}; slot idle for the rest of the run",
                completion.slot, e
            ),
        }
    }

    /// Wait once for transport events and handle every completion delivered
    pub fn pump(&mut self, timeout: Duration) {
        let mut completed = std::mem::take(&mut self.completed);

        if let Err(e) = self.session.wait_for_completions(timeout, &mut completed) {
            warn!("Error handling USB events: {}", e);
            std::thread::sleep(EVENT_ERROR_BACKOFF);
        }

        for completion in completed.drain(..) {
            self.handle_completion(completion, Instant::now());
        }
        self.completed = completed;
    }

    fn wait_timeout(&self) -> Duration {
        self.refresh_interval.min(MAX_EVENT_WAIT)
    }

    /// Streaming, then Draining, then Stopped
    ///
    /// Returns the final statistics once every outstanding request has
    /// completed and the pool has been released.
    pub fn run(mut self, observer: Option<SnapshotSender>) -> StatsSnapshot {
        let mut observer = observer;
        self.stream(&mut observer);
        self.drain();
        self.stop(&mut observer)
    }

    fn stream(&mut self, observer: &mut Option<SnapshotSender>) {
        let timeout = self.wait_timeout();
        let mut last_refresh = Instant::now();

        while !self.context.control.stop_requested() {
            self.pump(timeout);

            let now = Instant::now();
            if self.deadline.is_some_and(|deadline| now >= deadline) {
                info!("Test duration is complete, stopping transfers");
                self.context.control.request_stop();
            }

            if now.duration_since(last_refresh) >= self.refresh_interval {
                self.refresh(observer);
                last_refresh = now;
            }
        }
    }

    fn drain(&mut self) {
        self.state = DriverState::Draining;
        let timeout = self.wait_timeout();
        let mut last_report: Option<Instant> = None;

        info!(
            "Stopping streamer, {} requests pending",
            self.context.stats.in_flight()
        );

        while self.context.stats.in_flight() > 0 {
            let now = Instant::now();
            if last_report.is_none_or(|at| now.duration_since(at) >= self.refresh_interval) {
                debug!("{} requests are pending", self.context.stats.in_flight());
                last_report = Some(now);
            }
            self.pump(timeout);
        }
    }

    fn stop(mut self, observer: &mut Option<SnapshotSender>) -> StatsSnapshot {
        self.state = DriverState::Stopped;
        let freed = self.pool.release();
        debug!("Released {} transfer slots", freed);

        let snapshot = self.context.stats.snapshot();
        if let Some(tx) = observer.take() {
            let _ = tx.try_send(snapshot);
        }
        snapshot
    }

    /// Periodic statistics refresh
    fn refresh(&self, observer: &mut Option<SnapshotSender>) {
        let snapshot = self.context.stats.snapshot();
        info!(
            "Transfer counts: {} pass {} fail, data rate {:.1} KBps",
            snapshot.success_count, snapshot.failure_count, snapshot.throughput_kbps
        );

        if let Some(tx) = observer {
            match tx.try_send(snapshot) {
                Ok(()) | Err(async_channel::TrySendError::Full(_)) => {}
                Err(async_channel::TrySendError::Closed(_)) => {
                    debug!("Statistics observer went away");
                    *observer = None;
                }
            }
        }
    }
}
