//! Driver thread entry point

use crate::config::RunConfig;
use crate::control::RunContext;
use crate::engine::{SnapshotSender, StreamEngine};
use crate::error::StartError;
use crate::transport::Transport;
use std::sync::Arc;
use tracing::{error, info};

/// Name given to every driver thread
pub const DRIVER_THREAD_NAME: &str = "usb-streamer";

/// Result of initialisation, sent once to the thread blocked in `start`
pub(crate) type InitSender = async_channel::Sender<Result<(), StartError>>;

/// Clears `running` when the driver exits, including by unwinding
struct RunningGuard {
    context: Arc<RunContext>,
    armed: bool,
}

impl RunningGuard {
    fn new(context: Arc<RunContext>) -> Self {
        Self {
            context,
            armed: true,
        }
    }

    fn release(mut self) {
        self.armed = false;
        self.context.control.finish();
    }
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        if self.armed {
            error!("Streamer thread exited abnormally");
            self.context.control.finish();
        }
    }
}

/// Body of the driver thread for one run
///
/// Initialisation failures are reported through `init` after every
/// resource has been released and `running` cleared, so a caller that
/// sees the error can start again immediately.
pub(crate) fn run<T: Transport>(
    transport: Arc<T>,
    config: RunConfig,
    context: Arc<RunContext>,
    init: InitSender,
    observer: Option<SnapshotSender>,
) {
    let guard = RunningGuard::new(context.clone());

    let primed = transport
        .open_session(&config)
        .map_err(StartError::Session)
        .and_then(|session| StreamEngine::prime(session, &config, context.clone()));

    let engine = match primed {
        Ok(engine) => engine,
        Err(e) => {
            error!("Failed to start streaming: {}", e);
            guard.release();
            let _ = init.send_blocking(Err(e));
            return;
        }
    };

    info!(
        "Streaming {} endpoint {:#04x}: {} requests of {} bytes queued",
        config.transfer_type,
        config.endpoint,
        context.stats.in_flight(),
        config.request_bytes()
    );
    let _ = init.send_blocking(Ok(()));
    drop(init);

    let summary = engine.run(observer);

    info!(
        "Streaming stopped: {} pass {} fail, {} bytes, last rate {:.1} KBps",
        summary.success_count, summary.failure_count, summary.total_bytes, summary.throughput_kbps
    );
    guard.release();
}
