//! Run configuration
//!
//! A [`RunConfig`] is fixed for the duration of one streaming run. It is
//! validated once in [`crate::Streamer::configure`] and never mutated while a
//! run is active.

use crate::error::ConfigError;
use std::time::Duration;

/// Default request size, in packets (or bursts) per request
pub const DEFAULT_REQUEST_SIZE: usize = 16;

/// Default number of requests kept in flight
pub const DEFAULT_QUEUE_DEPTH: usize = 16;

/// Default per-request transfer timeout (5 seconds)
pub const DEFAULT_TRANSFER_TIMEOUT: Duration = Duration::from_secs(5);

/// Default interval between statistics refreshes
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(1);

/// Largest single transfer libusb accepts (its length field is a C int)
const MAX_TRANSFER_LENGTH: usize = i32::MAX as usize;

/// Endpoint transfer type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferType {
    Bulk,
    Interrupt,
    Isochronous,
}

impl TransferType {
    /// Map the rusb endpoint transfer type; control endpoints cannot be streamed
    pub fn from_rusb(kind: rusb::TransferType) -> Option<Self> {
        match kind {
            rusb::TransferType::Bulk => Some(TransferType::Bulk),
            rusb::TransferType::Interrupt => Some(TransferType::Interrupt),
            rusb::TransferType::Isochronous => Some(TransferType::Isochronous),
            rusb::TransferType::Control => None,
        }
    }
}

impl std::fmt::Display for TransferType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TransferType::Bulk => "bulk",
            TransferType::Interrupt => "interrupt",
            TransferType::Isochronous => "isochronous",
        };
        f.write_str(name)
    }
}

/// Check an endpoint address: number 1-15, reserved bits 4-6 clear
pub fn validate_endpoint(endpoint: u8) -> Result<(), ConfigError> {
    if (endpoint & 0x70) != 0 || (endpoint & 0x0F) == 0 {
        return Err(ConfigError::InvalidEndpoint(endpoint));
    }
    Ok(())
}

/// Whether an endpoint address refers to an IN (device to host) endpoint
pub fn is_in_endpoint(endpoint: u8) -> bool {
    (endpoint & 0x80) != 0
}

/// Configuration for one streaming run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunConfig {
    /// Endpoint address, including the direction bit
    pub endpoint: u8,
    /// Transfer type of the endpoint
    pub transfer_type: TransferType,
    /// Resolved packet size in bytes (burst and mult already applied)
    pub packet_size: usize,
    /// Packets (or bursts) per request
    pub request_size: usize,
    /// Number of requests kept in flight; also the throughput window size
    pub queue_depth: usize,
    /// Stop automatically once this much time has elapsed
    pub duration: Option<Duration>,
    /// Timeout handed to the transport with every request
    pub transfer_timeout: Duration,
    /// How often the driver refreshes and publishes statistics
    pub refresh_interval: Duration,
}

impl RunConfig {
    /// Create a configuration with default request size, depth and timeouts
    pub fn new(endpoint: u8, transfer_type: TransferType, packet_size: usize) -> Self {
        Self {
            endpoint,
            transfer_type,
            packet_size,
            request_size: DEFAULT_REQUEST_SIZE,
            queue_depth: DEFAULT_QUEUE_DEPTH,
            duration: None,
            transfer_timeout: DEFAULT_TRANSFER_TIMEOUT,
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
        }
    }

    pub fn with_request_size(mut self, request_size: usize) -> Self {
        self.request_size = request_size;
        self
    }

    pub fn with_queue_depth(mut self, queue_depth: usize) -> Self {
        self.queue_depth = queue_depth;
        self
    }

    pub fn with_duration(mut self, duration: Option<Duration>) -> Self {
        self.duration = duration;
        self
    }

    pub fn with_transfer_timeout(mut self, timeout: Duration) -> Self {
        self.transfer_timeout = timeout;
        self
    }

    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval;
        self
    }

    /// Size of one request buffer in bytes
    pub fn request_bytes(&self) -> usize {
        self.request_size.saturating_mul(self.packet_size)
    }

    /// Number of isochronous packet descriptors each request needs
    pub fn iso_packets(&self) -> usize {
        match self.transfer_type {
            TransferType::Isochronous => self.request_size,
            _ => 0,
        }
    }

    /// Validate the configuration before a run
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_endpoint(self.endpoint)?;

        if self.packet_size == 0 {
            return Err(ConfigError::Zero {
                field: "packet size",
            });
        }
        if self.request_size == 0 {
            return Err(ConfigError::Zero {
                field: "request size",
            });
        }
        if self.queue_depth == 0 {
            return Err(ConfigError::Zero {
                field: "queue depth",
            });
        }
        if self.transfer_timeout.is_zero() {
            // libusb treats zero as no timeout at all
            return Err(ConfigError::Zero {
                field: "transfer timeout",
            });
        }
        if self.refresh_interval.is_zero() {
            return Err(ConfigError::Zero {
                field: "refresh interval",
            });
        }

        match self.request_size.checked_mul(self.packet_size) {
            Some(bytes) if bytes <= MAX_TRANSFER_LENGTH => Ok(()),
            _ => Err(ConfigError::RequestTooLarge {
                request_size: self.request_size,
                packet_size: self.packet_size,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_endpoint() {
        assert!(validate_endpoint(0x81).is_ok());
        assert!(validate_endpoint(0x01).is_ok());
        assert!(validate_endpoint(0x8F).is_ok());

        assert_eq!(validate_endpoint(0x80), Err(ConfigError::InvalidEndpoint(0x80)));
        assert_eq!(validate_endpoint(0x00), Err(ConfigError::InvalidEndpoint(0x00)));
        assert_eq!(validate_endpoint(0x91), Err(ConfigError::InvalidEndpoint(0x91)));
        assert_eq!(validate_endpoint(0x21), Err(ConfigError::InvalidEndpoint(0x21)));
    }

    #[test]
    fn test_endpoint_direction() {
        assert!(is_in_endpoint(0x81));
        assert!(!is_in_endpoint(0x01));
    }

    #[test]
    fn test_defaults() {
        let config = RunConfig::new(0x81, TransferType::Bulk, 512);
        assert_eq!(config.request_size, 16);
        assert_eq!(config.queue_depth, 16);
        assert_eq!(config.transfer_timeout, Duration::from_millis(5000));
        assert_eq!(config.request_bytes(), 16 * 512);
        assert_eq!(config.iso_packets(), 0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_iso_packets_follow_request_size() {
        let config = RunConfig::new(0x83, TransferType::Isochronous, 3072).with_request_size(8);
        assert_eq!(config.iso_packets(), 8);
    }

    #[test]
    fn test_validate_rejects_zero_fields() {
        let base = RunConfig::new(0x81, TransferType::Bulk, 512);

        let err = base.clone().with_queue_depth(0).validate().unwrap_err();
        assert_eq!(err, ConfigError::Zero { field: "queue depth" });

        let err = base.clone().with_request_size(0).validate().unwrap_err();
        assert_eq!(err, ConfigError::Zero { field: "request size" });

        let err = RunConfig::new(0x81, TransferType::Bulk, 0).validate().unwrap_err();
        assert_eq!(err, ConfigError::Zero { field: "packet size" });

        let err = base
            .with_transfer_timeout(Duration::ZERO)
            .validate()
            .unwrap_err();
        assert_eq!(err, ConfigError::Zero { field: "transfer timeout" });
    }

    #[test]
    fn test_validate_rejects_oversized_request() {
        let config = RunConfig::new(0x81, TransferType::Bulk, 1024).with_request_size(usize::MAX / 2);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::RequestTooLarge { .. })
        ));
    }

    #[test]
    fn test_transfer_type_from_rusb() {
        assert_eq!(
            TransferType::from_rusb(rusb::TransferType::Bulk),
            Some(TransferType::Bulk)
        );
        assert_eq!(
            TransferType::from_rusb(rusb::TransferType::Isochronous),
            Some(TransferType::Isochronous)
        );
        assert_eq!(TransferType::from_rusb(rusb::TransferType::Control), None);
    }
}
