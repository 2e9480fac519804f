//! Asynchronous USB transfer streaming engine
//!
//! Keeps a fixed number of bulk, interrupt or isochronous requests in flight
//! against one endpoint, resubmits each request as it completes, and measures
//! sustained throughput over a rolling window of completions.
//!
//! The pieces, bottom-up:
//! - [`slot`]: the pool of reusable request buffers and transfer handles
//! - [`submitter`]: transfer-type specific request setup and byte accounting
//! - [`stats`]: shared counters and the throughput window
//! - [`engine`]: completion handling and the driver state machine
//! - [`streamer`]: the lifecycle controller callers interact with
//! - [`transport`]: the seam to libusb (or a mock in tests)
//! - [`device`]: device discovery and endpoint lookup
//!
//! The `test-utils` feature adds `test_utils`, an in-memory transport for
//! driving the engine without a device.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use streamer::device::{self, KnownDevice};
//! use streamer::{RunConfig, Streamer};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let context = rusb::Context::new()?;
//! let known = vec![KnownDevice::new("0x04b4:0x00f1".parse()?, "Cypress FX3")];
//! let mut device = device::open_device(&context, &known, 0)?;
//! let endpoint = device.locate_endpoint(0x81)?;
//!
//! let streamer = Streamer::new(std::sync::Arc::new(device.transport()));
//! streamer.configure(
//!     RunConfig::new(endpoint.address, endpoint.transfer_type, endpoint.packet_size)
//!         .with_duration(Some(Duration::from_secs(10))),
//! )?;
//! streamer.start()?;
//! streamer.wait();
//! println!("{:.1} KBps", streamer.snapshot().throughput_kbps);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod control;
pub mod device;
mod driver;
pub mod engine;
pub mod error;
pub mod slot;
pub mod stats;
pub mod streamer;
pub mod submitter;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod transport;

pub use config::{RunConfig, TransferType};
pub use control::{RunContext, RunControl};
pub use driver::DRIVER_THREAD_NAME;
pub use error::{AllocationError, ConfigError, DeviceError, StartError, TransportError};
pub use stats::{RunStats, StatsSnapshot};
pub use streamer::Streamer;
