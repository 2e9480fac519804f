//! Error types for the streaming engine
//!
//! Only start-time failures ever reach the caller as a discrete error.
//! Per-request failures are absorbed by the engine and surface through the
//! statistics snapshot instead.

use crate::slot::SlotId;
use thiserror::Error;

/// Errors reported by the transport collaborator
///
/// Mirrors the libusb error codes, with the descriptions users of the
/// Cypress tools are used to seeing.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Input/output error")]
    Io,

    #[error("Invalid parameter")]
    InvalidParam,

    #[error("Access denied (insufficient permissions)")]
    Access,

    #[error("No such device (it may have been disconnected)")]
    NoDevice,

    #[error("Entity not found")]
    NotFound,

    #[error("Resource busy")]
    Busy,

    #[error("Operation timed out")]
    Timeout,

    #[error("Overflow")]
    Overflow,

    #[error("Pipe error")]
    Pipe,

    #[error("System call interrupted (due to signal?)")]
    Interrupted,

    #[error("Insufficient memory")]
    NoMem,

    #[error("Operation not supported or unimplemented on this platform")]
    NotSupported,

    #[error("Unknown internal error ({0})")]
    Other(i32),
}

impl TransportError {
    /// Map a raw libusb error code (negative `LIBUSB_ERROR_*` value)
    pub fn from_libusb_code(code: i32) -> Self {
        match code {
            -1 => TransportError::Io,
            -2 => TransportError::InvalidParam,
            -3 => TransportError::Access,
            -4 => TransportError::NoDevice,
            -5 => TransportError::NotFound,
            -6 => TransportError::Busy,
            -7 => TransportError::Timeout,
            -8 => TransportError::Overflow,
            -9 => TransportError::Pipe,
            -10 => TransportError::Interrupted,
            -11 => TransportError::NoMem,
            -12 => TransportError::NotSupported,
            other => TransportError::Other(other),
        }
    }
}

impl From<rusb::Error> for TransportError {
    fn from(err: rusb::Error) -> Self {
        match err {
            rusb::Error::Io => TransportError::Io,
            rusb::Error::InvalidParam => TransportError::InvalidParam,
            rusb::Error::Access => TransportError::Access,
            rusb::Error::NoDevice => TransportError::NoDevice,
            rusb::Error::NotFound => TransportError::NotFound,
            rusb::Error::Busy => TransportError::Busy,
            rusb::Error::Timeout => TransportError::Timeout,
            rusb::Error::Overflow => TransportError::Overflow,
            rusb::Error::Pipe => TransportError::Pipe,
            rusb::Error::Interrupted => TransportError::Interrupted,
            rusb::Error::NoMem => TransportError::NoMem,
            rusb::Error::NotSupported => TransportError::NotSupported,
            _ => TransportError::Other(-99),
        }
    }
}

/// Failure to build the slot pool
///
/// Allocation is all-or-nothing: whenever this is returned, everything the
/// failed call had allocated has already been released.
#[derive(Debug, Error)]
pub enum AllocationError {
    #[error("failed to reserve the slot table for {depth} slots")]
    Table { depth: usize },

    #[error("failed to allocate {bytes} byte buffer for slot {slot}")]
    Buffer { slot: SlotId, bytes: usize },

    #[error("failed to allocate transfer descriptor for slot {slot}: {source}")]
    Descriptor {
        slot: SlotId,
        #[source]
        source: TransportError,
    },
}

/// Rejected run configuration
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid endpoint 0x{0:x}: endpoint number must be 1-15 and bits 4-6 must be clear")]
    InvalidEndpoint(u8),

    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },

    #[error("request of {request_size} packets of {packet_size} bytes does not fit in a single transfer")]
    RequestTooLarge {
        request_size: usize,
        packet_size: usize,
    },

    #[error("cannot reconfigure while a streaming run is active")]
    Busy,
}

/// Failure of [`crate::Streamer::start`]
#[derive(Debug, Error)]
pub enum StartError {
    #[error("a streaming run is already active")]
    Busy,

    #[error("no streaming configuration has been set")]
    NotConfigured,

    #[error("failed to open transfer session: {0}")]
    Session(#[source] TransportError),

    #[error(transparent)]
    Allocation(#[from] AllocationError),

    #[error("all {queue_depth} initial transfer submissions were rejected: {last}")]
    Submission {
        queue_depth: usize,
        #[source]
        last: TransportError,
    },

    #[error("failed to spawn streamer thread: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("streamer thread exited before reporting its start-up result")]
    DriverLost,
}

impl StartError {
    /// Whether this is the "already running" outcome rather than a resource failure
    pub fn is_busy(&self) -> bool {
        matches!(self, StartError::Busy)
    }
}

/// Device discovery and endpoint lookup errors
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("invalid device filter '{0}': expected VID:PID in hex, '*' matches anything")]
    InvalidFilter(String),

    #[error("no device of interest found")]
    NoDevice,

    #[error("device index {index} out of range: {count} devices of interest found")]
    IndexOutOfRange { index: usize, count: usize },

    #[error("endpoint 0x{0:02x} not found in the device configuration")]
    EndpointNotFound(u8),

    #[error("endpoint 0x{endpoint:02x} is a control endpoint")]
    ControlEndpoint { endpoint: u8 },

    #[error("USB error: {0}")]
    Usb(#[from] rusb::Error),
}
