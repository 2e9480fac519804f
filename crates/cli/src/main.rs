//! usb-perf
//!
//! USB data transfer performance test. Streams bulk, interrupt or
//! isochronous requests against one endpoint of a device of interest and
//! reports the sustained data rate.

mod commands;
mod config;

use anyhow::{Context, Result};
use clap::{Args as ClapArgs, CommandFactory, Parser, Subcommand};
use commands::PerfOptions;
use common::setup_logging;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "usb-perf")]
#[command(
    author,
    version,
    about = "USB data transfer performance test"
)]
#[command(long_about = "
Measures the data rate of an IN or OUT endpoint by keeping a queue of
asynchronous transfer requests in flight. Bulk, interrupt and isochronous
endpoints are supported.

EXAMPLES:
    # List devices of interest
    usb-perf list

    # Show the configuration descriptor of the first device
    usb-perf config

    # Stream from endpoint 0x81 for 10 seconds, 32 requests in flight
    usb-perf perf -e 0x81 -q 32 -d 10

    # Run until Ctrl+C with debug logging
    usb-perf --log-level debug perf -e 0x82 -d 0

CONFIGURATION:
    usb-perf looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/usb-perf/config.toml
    3. /etc/usb-perf/config.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH", global = true)]
    config: Option<String>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL", global = true)]
    log_level: Option<String>,

    /// Index of the device of interest to use (see `usb-perf list`)
    #[arg(long, value_name = "INDEX", default_value_t = 0, global = true)]
    device: usize,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List devices of interest
    List,
    /// Show the active configuration of the selected device
    Config,
    /// Run the data transfer performance test
    Perf(PerfArgs),
}

#[derive(ClapArgs, Debug)]
struct PerfArgs {
    /// Endpoint to be tested, decimal or 0x-prefixed hex (e.g. 0x81)
    #[arg(short, long, value_parser = parse_endpoint)]
    endpoint: u8,

    /// Size of individual requests in packets or bursts
    #[arg(short = 's', long, value_name = "PACKETS")]
    request_size: Option<usize>,

    /// Number of requests to be queued at a time
    #[arg(short, long, value_name = "REQUESTS")]
    queue_depth: Option<usize>,

    /// Duration of the test in seconds (0 = until interrupted)
    #[arg(short, long, value_name = "SECONDS")]
    duration: Option<u64>,
}

/// Parse and validate an endpoint address
fn parse_endpoint(s: &str) -> Result<u8, String> {
    let s = s.trim();
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u8::from_str_radix(hex, 16),
        None => s.parse::<u8>(),
    };
    let endpoint = parsed.map_err(|_| format!("Failed to parse endpoint number '{}'", s))?;
    streamer::config::validate_endpoint(endpoint).map_err(|e| e.to_string())?;
    Ok(endpoint)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Handle --save-config flag early (before loading config)
    if args.save_config {
        let config = config::PerfConfig::default();
        let path = config::PerfConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let config = if let Some(ref path) = args.config {
        config::load_config(path).context("Failed to load configuration")?
    } else {
        config::PerfConfig::load_or_default()
    };

    // Use CLI log level if specified, otherwise use config value
    let log_level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.logging.level);

    setup_logging(log_level).context("Failed to setup logging")?;

    info!("usb-perf v{}", env!("CARGO_PKG_VERSION"));

    let Some(command) = args.command else {
        Args::command().print_help()?;
        return Ok(());
    };

    match command {
        Command::List => commands::list(&config),
        Command::Config => commands::show_config(&config, args.device),
        Command::Perf(perf) => {
            let options = PerfOptions {
                endpoint: perf.endpoint,
                request_size: perf.request_size,
                queue_depth: perf.queue_depth,
                duration_secs: perf.duration,
            };
            commands::perf(&config, args.device, options).await
        }
    }
}
