//! Lifecycle controller
//!
//! [`Streamer`] is the public face of the engine. It can be shared between
//! threads: `start`, `request_stop`, `is_running` and `snapshot` all take
//! `&self`. At most one run is active at a time; the run itself executes on
//! a dedicated OS thread, because libusb event handling blocks.

use crate::config::RunConfig;
use crate::control::RunContext;
use crate::driver::{self, DRIVER_THREAD_NAME};
use crate::error::{ConfigError, StartError};
use crate::stats::StatsSnapshot;
use crate::transport::Transport;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use tracing::{debug, warn};

/// Snapshots buffered for a subscriber before refreshes are dropped
pub const SNAPSHOT_CHANNEL_CAPACITY: usize = 16;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct Streamer<T: Transport> {
    transport: Arc<T>,
    context: Arc<RunContext>,
    config: Mutex<Option<RunConfig>>,
    driver: Mutex<Option<JoinHandle<()>>>,
    observer: Mutex<Option<async_channel::Sender<StatsSnapshot>>>,
}

impl<T: Transport> Streamer<T> {
    pub fn new(transport: Arc<T>) -> Self {
        Self {
            transport,
            context: Arc::new(RunContext::new()),
            config: Mutex::new(None),
            driver: Mutex::new(None),
            observer: Mutex::new(None),
        }
    }

    /// Set the configuration used by the next run
    pub fn configure(&self, config: RunConfig) -> Result<(), ConfigError> {
        config.validate()?;
        let mut current = lock(&self.config);
        if self.context.control.is_running() {
            return Err(ConfigError::Busy);
        }
        debug!("Streamer configured: {:?}", config);
        *current = Some(config);
        Ok(())
    }

    pub fn config(&self) -> Option<RunConfig> {
        lock(&self.config).clone()
    }

    /// Receive a snapshot at every statistics refresh of later runs
    ///
    /// Replaces any earlier subscriber. Snapshots are dropped while the
    /// receiver is full.
    pub fn subscribe(&self) -> async_channel::Receiver<StatsSnapshot> {
        let (tx, rx) = async_channel::bounded(SNAPSHOT_CHANNEL_CAPACITY);
        *lock(&self.observer) = Some(tx);
        rx
    }

    /// Begin a run with the current configuration
    ///
    /// Blocks until the driver thread has allocated the pool and queued the
    /// initial requests, then returns. If a run is already active this fails
    /// with [`StartError::Busy`] and leaves it untouched.
    pub fn start(&self) -> Result<(), StartError> {
        let config = lock(&self.config).clone().ok_or(StartError::NotConfigured)?;

        if !self.context.control.try_begin() {
            debug!("Start refused: a run is already active");
            return Err(StartError::Busy);
        }

        let mut driver = lock(&self.driver);
        // The previous driver has already cleared `running`; reap it
        if let Some(previous) = driver.take()
            && previous.join().is_err()
        {
            warn!("Previous streamer thread panicked");
        }

        self.context.reset_for_run();

        let (init_tx, init_rx) = async_channel::bounded(1);
        let transport = self.transport.clone();
        let context = self.context.clone();
        let observer = lock(&self.observer).clone();

        let spawned = std::thread::Builder::new()
            .name(DRIVER_THREAD_NAME.to_string())
            .spawn(move || driver::run(transport, config, context, init_tx, observer));

        match spawned {
            Ok(handle) => *driver = Some(handle),
            Err(e) => {
                self.context.control.finish();
                return Err(StartError::Spawn(e));
            }
        }
        drop(driver);

        match init_rx.recv_blocking() {
            Ok(result) => result,
            Err(_) => Err(StartError::DriverLost),
        }
    }

    /// Ask the active run to stop; returns immediately
    ///
    /// Outstanding requests drain on the driver thread. Use
    /// [`Streamer::is_running`] or [`Streamer::wait`] to observe the end.
    pub fn request_stop(&self) {
        if self.context.control.is_running() {
            debug!("Stop requested");
        }
        self.context.control.request_stop();
    }

    pub fn is_running(&self) -> bool {
        self.context.control.is_running()
    }

    /// Current statistics; valid while running and after the run ends
    pub fn snapshot(&self) -> StatsSnapshot {
        self.context.stats.snapshot()
    }

    /// Shared run context, for readers that outlive a borrow of the streamer
    pub fn context(&self) -> Arc<RunContext> {
        self.context.clone()
    }

    /// Block until the current run, if any, has fully stopped
    pub fn wait(&self) {
        let handle = lock(&self.driver).take();
        if let Some(handle) = handle
            && handle.join().is_err()
        {
            warn!("Streamer thread panicked");
        }
    }
}

impl<T: Transport> Drop for Streamer<T> {
    fn drop(&mut self) {
        if self.is_running() {
            debug!("Streamer dropped while running, stopping");
            self.request_stop();
        }
        self.wait();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransferType;
    use crate::test_utils::MockTransport;

    fn config() -> RunConfig {
        RunConfig::new(0x81, TransferType::Bulk, 512).with_queue_depth(4)
    }

    #[test]
    fn test_start_requires_configuration() {
        let streamer = Streamer::new(Arc::new(MockTransport::manual()));
        assert!(matches!(streamer.start(), Err(StartError::NotConfigured)));
        assert!(!streamer.is_running());
    }

    #[test]
    fn test_configure_rejects_invalid_config() {
        let streamer = Streamer::new(Arc::new(MockTransport::manual()));
        let err = streamer
            .configure(RunConfig::new(0x80, TransferType::Bulk, 512))
            .unwrap_err();
        assert_eq!(err, ConfigError::InvalidEndpoint(0x80));
        assert!(streamer.config().is_none());
    }

    #[test]
    fn test_configure_refused_while_running() {
        let transport = MockTransport::manual();
        let streamer = Streamer::new(Arc::new(transport.clone()));
        streamer.configure(config()).unwrap();
        streamer.start().unwrap();

        assert_eq!(
            streamer.configure(config().with_queue_depth(8)),
            Err(ConfigError::Busy)
        );

        streamer.request_stop();
        transport.complete_all();
        streamer.wait();
        assert!(streamer.configure(config().with_queue_depth(8)).is_ok());
    }

    #[test]
    fn test_drop_stops_and_joins() {
        let transport = MockTransport::new();
        let streamer = Streamer::new(Arc::new(transport.clone()));
        streamer.configure(config()).unwrap();
        streamer.start().unwrap();
        let context = streamer.context();

        drop(streamer);
        assert!(!context.control.is_running());
        assert_eq!(context.stats.in_flight(), 0);
        assert_eq!(transport.freed(), 4);
    }
}
