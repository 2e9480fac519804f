//! Common utilities for usb-perf
//!
//! Shared error type and logging setup used by the streaming engine and the
//! command line driver.

pub mod error;
pub mod logging;

pub use error::{Error, Result};
pub use logging::setup_logging;
