//! Asynchronous transfer transport
//!
//! The engine never talks to libusb directly. It drives a [`TransferSession`]
//! opened from a [`Transport`] on its own thread:
//! - per-slot handles are allocated through the session when the pool is built
//! - armed slots are submitted through the session
//! - completions come back from a bounded wait as plain [`Completion`] values
//!
//! [`libusb::UsbTransport`] is the real implementation;
//! `test_utils::MockTransport` (feature `test-utils`) drives the engine in tests.

pub mod libusb;

use crate::config::RunConfig;
use crate::error::TransportError;
use crate::slot::{SlotId, TransferSlot};
use std::time::Duration;

/// Final status of a request or of one isochronous packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Completed,
    Error,
    TimedOut,
    Cancelled,
    Stall,
    NoDevice,
    Overflow,
}

impl TransferStatus {
    pub fn is_success(self) -> bool {
        self == TransferStatus::Completed
    }
}

/// Outcome of one isochronous packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketOutcome {
    pub status: TransferStatus,
    pub actual_length: usize,
}

/// A completed request, as reported by the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub slot: SlotId,
    pub status: TransferStatus,
    pub actual_length: usize,
    /// One entry per isochronous packet; empty for bulk and interrupt
    pub packets: Vec<PacketOutcome>,
}

impl Completion {
    /// Completion of a bulk or interrupt request
    pub fn new(slot: SlotId, status: TransferStatus, actual_length: usize) -> Self {
        Self {
            slot,
            status,
            actual_length,
            packets: Vec::new(),
        }
    }

    /// Completion of an isochronous request
    pub fn isochronous(slot: SlotId, status: TransferStatus, packets: Vec<PacketOutcome>) -> Self {
        let actual_length = packets.iter().map(|p| p.actual_length).sum();
        Self {
            slot,
            status,
            actual_length,
            packets,
        }
    }
}

/// One run's view of the transport
///
/// Sessions live on the driver thread only and need not be `Send`.
pub trait TransferSession {
    /// Transport-specific per-slot request object
    type Handle;

    /// Allocate the handle for one slot; `iso_packets` is zero unless isochronous
    fn alloc_handle(&mut self, slot: SlotId, iso_packets: usize)
    -> Result<Self::Handle, TransportError>;

    /// Hand an armed slot to the transport
    ///
    /// On `Ok` the transport owns the slot's buffer until the matching
    /// completion is returned from [`TransferSession::wait_for_completions`].
    fn submit(&mut self, slot: &mut TransferSlot<Self::Handle>) -> Result<(), TransportError>;

    /// Wait at most `timeout` for transport events, appending completions
    ///
    /// Returning without any completion is normal; the caller uses the
    /// timeout to notice stop requests and refresh statistics.
    fn wait_for_completions(
        &mut self,
        timeout: Duration,
        completed: &mut Vec<Completion>,
    ) -> Result<(), TransportError>;
}

/// Source of transfer sessions, shared between the controller and each run
pub trait Transport: Send + Sync + 'static {
    type Session: TransferSession;

    /// Open the session for one run; called on the driver thread
    fn open_session(&self, config: &RunConfig) -> Result<Self::Session, TransportError>;
}
