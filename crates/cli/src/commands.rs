//! Subcommand implementations

use crate::config::PerfConfig;
use anyhow::{Context, Result, anyhow};
use std::sync::Arc;
use std::time::Duration;
use streamer::device::{self, EndpointInfo};
use streamer::{RunConfig, StatsSnapshot, Streamer, TransferType};
use tokio::signal;
use tracing::{info, warn};

/// Overrides for the performance test
#[derive(Debug, Clone, Default)]
pub struct PerfOptions {
    pub endpoint: u8,
    pub request_size: Option<usize>,
    pub queue_depth: Option<usize>,
    pub duration_secs: Option<u64>,
}

fn usb_context() -> Result<rusb::Context> {
    rusb::Context::new().context("Failed to initialize libusb")
}

/// `usb-perf list`
pub fn list(config: &PerfConfig) -> Result<()> {
    let context = usb_context()?;
    let known = config.known_devices()?;
    let devices = device::list_devices(&context, &known).context("Failed to enumerate devices")?;

    if devices.is_empty() {
        println!("No device of interest found.");
        return Ok(());
    }

    println!("Found {} device(s) of interest:\n", devices.len());
    for (index, summary) in devices.iter().enumerate() {
        println!("  [{}] {}", index, summary);
    }
    Ok(())
}

/// `usb-perf config`
pub fn show_config(config: &PerfConfig, device_index: usize) -> Result<()> {
    let context = usb_context()?;
    let known = config.known_devices()?;
    let device = device::open_device(&context, &known, device_index)
        .context("Failed to open device")?;

    let description = device
        .describe_configuration()
        .context("Failed to get USB configuration descriptor")?;

    println!("{}\n", device.summary());
    println!("{}", description);
    Ok(())
}

/// Build the run configuration from file defaults, overrides and the located endpoint
pub fn run_config(config: &PerfConfig, options: &PerfOptions, endpoint: &EndpointInfo) -> RunConfig {
    let stream = &config.stream;
    let duration = match options.duration_secs {
        Some(0) => None,
        Some(secs) => Some(Duration::from_secs(secs)),
        None => stream.duration(),
    };

    RunConfig::new(endpoint.address, endpoint.transfer_type, endpoint.packet_size)
        .with_request_size(options.request_size.unwrap_or(stream.request_size))
        .with_queue_depth(options.queue_depth.unwrap_or(stream.queue_depth))
        .with_duration(duration)
        .with_transfer_timeout(stream.transfer_timeout())
        .with_refresh_interval(stream.refresh_interval())
}

fn print_parameters(run: &RunConfig, endpoint: &EndpointInfo) {
    println!("Starting test with the following parameters");
    println!("\tRequest size     : {}", run.request_size);
    println!("\tQueue depth      : {}", run.queue_depth);
    match run.duration {
        Some(duration) => println!("\tTest duration    : {} s", duration.as_secs()),
        None => println!("\tTest duration    : until interrupted"),
    }
    println!("\tEndpoint to test : 0x{:02x}", run.endpoint);
    println!();
    println!("\tEndpoint type    : {}", run.transfer_type);
    println!("\tMax packet size  : {}", endpoint.max_packet_size);
    println!("\tPacket size      : {}", run.packet_size);
    if run.transfer_type == TransferType::Isochronous {
        println!("\tPackets/request  : {}", run.iso_packets());
    }
    println!();
}

fn print_refresh(snapshot: &StatsSnapshot) {
    println!(
        "Transfer counts: {} pass {} fail",
        snapshot.success_count, snapshot.failure_count
    );
    println!("Data rate: {:.1} KBps\n", snapshot.throughput_kbps);
}

/// `usb-perf perf`
pub async fn perf(config: &PerfConfig, device_index: usize, options: PerfOptions) -> Result<()> {
    streamer::config::validate_endpoint(options.endpoint)?;

    let context = usb_context()?;
    let known = config.known_devices()?;
    let mut device = device::open_device(&context, &known, device_index)
        .context("Failed to open device")?;
    let endpoint = device
        .locate_endpoint(options.endpoint)
        .with_context(|| format!("Failed to find endpoint 0x{:02x} on device", options.endpoint))?;

    let run = run_config(config, &options, &endpoint);
    print_parameters(&run, &endpoint);
    let refresh = run.refresh_interval;

    let streamer = Arc::new(Streamer::new(Arc::new(device.transport())));
    streamer
        .configure(run)
        .context("Invalid test parameters")?;
    let updates = streamer.subscribe();

    let starter = streamer.clone();
    tokio::task::spawn_blocking(move || starter.start())
        .await
        .context("Streamer start task failed")?
        .context("Failed to start transfers")?;

    let ctrl_c = signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut ticker = tokio::time::interval(refresh);

    // Streaming: print refreshes until the run ends or the user interrupts
    loop {
        tokio::select! {
            update = updates.recv() => {
                match update {
                    Ok(snapshot) if streamer.is_running() => print_refresh(&snapshot),
                    Ok(_) => {}
                    Err(_) => break,
                }
            }
            _ = &mut ctrl_c => {
                println!("Interrupted, stopping transfers");
                streamer.request_stop();
                break;
            }
            _ = ticker.tick() => {
                if !streamer.is_running() {
                    break;
                }
            }
        }
    }

    // Draining: report pending requests until the driver is done
    while streamer.is_running() {
        let pending = streamer.snapshot().in_flight;
        if pending > 0 {
            println!("{} requests are pending", pending);
        }
        ticker.tick().await;
    }

    let waiter = streamer.clone();
    if let Err(e) = tokio::task::spawn_blocking(move || waiter.wait()).await {
        warn!("Failed to join streamer: {}", e);
    }
    println!("Transfers completed\n");

    let summary = streamer.snapshot();
    print_summary(&summary);
    info!("Test completed");

    if summary.success_count == 0 && summary.failure_count > 0 {
        return Err(anyhow!(
            "Every transfer failed ({} failures)",
            summary.failure_count
        ));
    }
    Ok(())
}

fn print_summary(summary: &StatsSnapshot) {
    println!("Test summary");
    println!("\tSuccessful transfers : {}", summary.success_count);
    println!("\tFailed transfers     : {}", summary.failure_count);
    println!("\tBytes transferred    : {}", summary.total_bytes);
    println!("\tLast data rate       : {:.1} KBps", summary.throughput_kbps);
    println!(
        "\tFailure rate         : {:.2}%",
        summary.failure_rate() * 100.0
    );
}
