//! Test utilities for the streamer
//!
//! [`MockTransport`] stands in for a USB device. It completes requests
//! automatically, only when a test releases them, or never (timing out like
//! an unresponsive device). It counts every
//! allocation, submission and release so tests can check slot accounting.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use streamer::test_utils::MockTransport;
//! use streamer::{RunConfig, Streamer, TransferType};
//!
//! let transport = MockTransport::manual();
//! let streamer = Streamer::new(Arc::new(transport.clone()));
//! streamer
//!     .configure(RunConfig::new(0x81, TransferType::Bulk, 512).with_queue_depth(4))
//!     .unwrap();
//!
//! streamer.start().unwrap();
//! assert_eq!(streamer.snapshot().in_flight, 4);
//!
//! streamer.request_stop();
//! transport.complete_all();
//! streamer.wait();
//! assert_eq!(transport.freed(), 4);
//! ```

use crate::config::RunConfig;
use crate::error::TransportError;
use crate::slot::{SlotId, TransferDescriptor, TransferSlot};
use crate::transport::{Completion, PacketOutcome, TransferSession, TransferStatus, Transport};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Poll `condition` until it holds or `timeout` expires
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    condition()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CompletionMode {
    /// Every pending request completes after `latency`
    Auto { latency: Duration },
    /// Requests complete only as the test releases them
    Manual,
    /// Requests are never answered and time out after their descriptor timeout
    Unresponsive,
}

/// A request held by the transport
#[derive(Debug)]
struct Held {
    slot: SlotId,
    iso_packets: usize,
    expires: Instant,
}

#[derive(Debug)]
struct MockState {
    mode: CompletionMode,
    /// Completions the test has released in manual mode
    budget: usize,
    /// Held requests, in submission order
    pending: VecDeque<Held>,
    status: TransferStatus,
    iso_outcome: Option<Vec<PacketOutcome>>,
    /// Accept this many submissions in total, reject the rest
    accept_limit: Option<usize>,
    /// Fail handle allocation at this allocation index
    fail_alloc_at: Option<usize>,
    fail_open: bool,
    submitted: usize,
    rejected: usize,
    allocated: usize,
    sessions: usize,
    last_descriptor: Option<TransferDescriptor>,
}

#[derive(Debug)]
struct Shared {
    state: Mutex<MockState>,
    wake: Condvar,
    freed: Arc<AtomicUsize>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// In-memory transport for engine and controller tests
#[derive(Debug, Clone)]
pub struct MockTransport {
    shared: Arc<Shared>,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    /// Transport that completes every request after 1 ms
    pub fn new() -> Self {
        Self::with_mode(CompletionMode::Auto {
            latency: Duration::from_millis(1),
        })
    }

    /// Transport that completes requests only through [`MockTransport::complete`]
    pub fn manual() -> Self {
        Self::with_mode(CompletionMode::Manual)
    }

    /// Transport whose device never answers; each request fails with
    /// `TimedOut` once its transfer timeout has passed
    pub fn unresponsive() -> Self {
        Self::with_mode(CompletionMode::Unresponsive)
    }

    /// Transport that completes every request after `latency`
    pub fn with_latency(latency: Duration) -> Self {
        Self::with_mode(CompletionMode::Auto { latency })
    }

    fn with_mode(mode: CompletionMode) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(MockState {
                    mode,
                    budget: 0,
                    pending: VecDeque::new(),
                    status: TransferStatus::Completed,
                    iso_outcome: None,
                    accept_limit: None,
                    fail_alloc_at: None,
                    fail_open: false,
                    submitted: 0,
                    rejected: 0,
                    allocated: 0,
                    sessions: 0,
                    last_descriptor: None,
                }),
                wake: Condvar::new(),
                freed: Arc::new(AtomicUsize::new(0)),
            }),
        }
    }

    /// Status reported for every following completion
    pub fn set_status(&self, status: TransferStatus) {
        self.shared.lock().status = status;
    }

    /// Per-packet outcomes reported for isochronous completions
    pub fn set_iso_outcome(&self, packets: Vec<PacketOutcome>) {
        self.shared.lock().iso_outcome = Some(packets);
    }

    /// Accept `count` more submissions in total, then reject with `Busy`
    pub fn reject_submissions_after(&self, count: usize) {
        let mut state = self.shared.lock();
        state.accept_limit = Some(state.submitted + count);
    }

    /// Fail the allocation of the handle with index `index` (counted over the transport's lifetime)
    pub fn fail_allocation_at(&self, index: usize) {
        self.shared.lock().fail_alloc_at = Some(index);
    }

    /// Make the next `open_session` fail with `NoDevice`
    pub fn fail_session_open(&self) {
        self.shared.lock().fail_open = true;
    }

    /// Release `count` pending completions (manual mode)
    pub fn complete(&self, count: usize) {
        let mut state = self.shared.lock();
        state.budget = state.budget.saturating_add(count);
        self.shared.wake.notify_all();
    }

    /// Release every current and future completion (manual mode)
    pub fn complete_all(&self) {
        self.complete(usize::MAX);
    }

    /// Requests currently held by the transport
    pub fn pending(&self) -> usize {
        self.shared.lock().pending.len()
    }

    /// Accepted submissions so far
    pub fn submitted(&self) -> usize {
        self.shared.lock().submitted
    }

    /// Rejected submissions so far
    pub fn rejected(&self) -> usize {
        self.shared.lock().rejected
    }

    /// Handles allocated so far
    pub fn allocated(&self) -> usize {
        self.shared.lock().allocated
    }

    /// Handles dropped so far
    pub fn freed(&self) -> usize {
        self.shared.freed.load(Ordering::SeqCst)
    }

    /// Sessions opened so far
    pub fn sessions(&self) -> usize {
        self.shared.lock().sessions
    }

    /// Descriptor of the most recent accepted submission
    pub fn last_descriptor(&self) -> Option<TransferDescriptor> {
        self.shared.lock().last_descriptor.clone()
    }
}

impl Transport for MockTransport {
    type Session = MockSession;

    fn open_session(&self, _config: &RunConfig) -> Result<Self::Session, TransportError> {
        let mut state = self.shared.lock();
        if std::mem::take(&mut state.fail_open) {
            return Err(TransportError::NoDevice);
        }
        state.sessions += 1;
        Ok(MockSession {
            shared: self.shared.clone(),
        })
    }
}

/// Session handed to the driver by [`MockTransport`]
#[derive(Debug)]
pub struct MockSession {
    shared: Arc<Shared>,
}

/// Per-slot handle; bumps the transport's `freed` counter when dropped
#[derive(Debug)]
pub struct MockHandle {
    iso_capacity: usize,
    freed: Arc<AtomicUsize>,
}

impl Drop for MockHandle {
    fn drop(&mut self) {
        self.freed.fetch_add(1, Ordering::SeqCst);
    }
}

impl MockSession {
    fn completion(state: &MockState, slot: SlotId, packets: usize) -> Completion {
        let status = match state.mode {
            CompletionMode::Unresponsive => TransferStatus::TimedOut,
            _ => state.status,
        };
        if packets == 0 {
            return Completion::new(slot, status, 0);
        }
        let outcome = match &state.iso_outcome {
            Some(outcome) if status.is_success() => outcome.clone(),
            _ => vec![
                PacketOutcome {
                    status,
                    actual_length: 0,
                };
                packets
            ],
        };
        Completion::isochronous(slot, status, outcome)
    }
}

impl TransferSession for MockSession {
    type Handle = MockHandle;

    fn alloc_handle(
        &mut self,
        _slot: SlotId,
        iso_packets: usize,
    ) -> Result<Self::Handle, TransportError> {
        let mut state = self.shared.lock();
        if state.fail_alloc_at == Some(state.allocated) {
            return Err(TransportError::NoMem);
        }
        state.allocated += 1;
        Ok(MockHandle {
            iso_capacity: iso_packets,
            freed: self.shared.freed.clone(),
        })
    }

    fn submit(&mut self, slot: &mut TransferSlot<Self::Handle>) -> Result<(), TransportError> {
        let id = slot.id();
        let (descriptor, buffer, handle) = slot.parts_mut();
        let handle = handle.ok_or(TransportError::InvalidParam)?;
        if descriptor.length > buffer.len() || descriptor.iso_packets.len() > handle.iso_capacity {
            return Err(TransportError::InvalidParam);
        }

        let mut state = self.shared.lock();
        if state.accept_limit.is_some_and(|limit| state.submitted >= limit) {
            state.rejected += 1;
            return Err(TransportError::Busy);
        }

        state.submitted += 1;
        state.last_descriptor = Some(descriptor.clone());
        state.pending.push_back(Held {
            slot: id,
            iso_packets: descriptor.iso_packets.len(),
            expires: Instant::now() + descriptor.timeout,
        });
        self.shared.wake.notify_all();
        Ok(())
    }

    fn wait_for_completions(
        &mut self,
        timeout: Duration,
        completed: &mut Vec<Completion>,
    ) -> Result<(), TransportError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.lock();

        loop {
            let mode = state.mode;
            let now = Instant::now();
            if ready(&state, now) > 0 {
                if let CompletionMode::Auto { latency } = mode {
                    drop(state);
                    std::thread::sleep(latency);
                    state = self.shared.lock();
                }
                break;
            }

            if now >= deadline {
                return Ok(());
            }
            let wake_at = match (mode, state.pending.front()) {
                (CompletionMode::Unresponsive, Some(held)) => held.expires.min(deadline),
                _ => deadline,
            };
            state = self
                .shared
                .wake
                .wait_timeout(state, wake_at.saturating_duration_since(now))
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }

        let count = ready(&state, Instant::now());
        if state.mode == CompletionMode::Manual {
            state.budget = state.budget.saturating_sub(count);
        }

        for _ in 0..count {
            let Some(held) = state.pending.pop_front() else {
                break;
            };
            completed.push(Self::completion(&state, held.slot, held.iso_packets));
        }
        Ok(())
    }
}

/// Completions deliverable at `now`
fn ready(state: &MockState, now: Instant) -> usize {
    match state.mode {
        CompletionMode::Auto { .. } => state.pending.len(),
        CompletionMode::Manual => state.pending.len().min(state.budget),
        // Expiry follows submission order, so the expired requests form a prefix
        CompletionMode::Unresponsive => state
            .pending
            .iter()
            .take_while(|held| held.expires <= now)
            .count(),
    }
}
