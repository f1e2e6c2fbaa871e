//! Abyss sniffer daemon.
//!
//! Captures live traffic from one interface, aggregates it into ~60 Hz
//! telemetry frames and broadcasts them as JSON over a loopback WebSocket
//! for the Abyss visualizer. This binary is a thin shell over `abyss-core`:
//! it parses arguments, wires the pipeline threads together and supervises
//! them until a shutdown signal arrives.
//!
//! Typical usage:
//! - `abyss-sniffer` — auto-detect an interface, serve on port 9770
//! - `abyss-sniffer -i eth0 -p 8080` — explicit interface and port
//! - `abyss-sniffer -l` — list capture devices and exit
//!
//! Capturing requires elevated privileges (CAP_NET_RAW, sudo, or an
//! Npcap-compatible driver on Windows). Errors are reported to stderr; a
//! non-zero exit code indicates the capture or WebSocket subsystem failed
//! to start.

use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};

use abyss_core::aggregate::{Aggregator, HealthStats};
use abyss_core::{CaptureEngine, PacketRing, SnifferConfig, WsBroadcaster};

/// Seconds between supervisor status log lines.
const STATUS_LOG_TICKS: u32 = 10;

#[derive(Parser, Debug)]
#[command(name = "abyss-sniffer")]
#[command(
    version = concat!(
        env!("CARGO_PKG_VERSION"),
        " (commit ",
        env!("ABYSS_BUILD_COMMIT"),
        ", built ",
        env!("ABYSS_BUILD_DATE"),
        ")"
    )
)]
#[command(
    about = "Packet capture daemon broadcasting live telemetry to the Abyss visualizer.",
    long_about = None,
    after_help = "Examples:\n  abyss-sniffer                     # auto-detect interface, port 9770\n  abyss-sniffer -i eth0             # capture from eth0\n  abyss-sniffer -i \"Wi-Fi\" -p 8080  # custom interface and port\n\nNotes:\n  - Requires elevated permissions (sudo / CAP_NET_RAW / Administrator)\n  - Telemetry is broadcast at ~60 Hz; connect to ws://127.0.0.1:<port>\n  - On Windows, install Npcap from https://npcap.com"
)]
struct Cli {
    /// Network interface to capture from (default: auto-detect)
    #[arg(short, long)]
    interface: Option<String>,

    /// WebSocket server port
    #[arg(
        short,
        long,
        default_value_t = 9770,
        value_parser = clap::value_parser!(u16).range(1..)
    )]
    port: u16,

    /// List available network interfaces and exit
    #[arg(short, long)]
    list: bool,

    /// Increase log verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if cli.list {
        return cmd_list_interfaces();
    }

    match run_daemon(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {}", err.message);
            if let Some(hint) = err.hint {
                eprintln!("hint: {}", hint);
            }
            ExitCode::FAILURE
        }
    }
}

#[derive(Debug)]
struct CliError {
    message: String,
    hint: Option<String>,
}

impl CliError {
    fn new(message: impl Into<String>, hint: Option<String>) -> Self {
        Self {
            message: message.into(),
            hint,
        }
    }
}

impl std::fmt::Display for CliError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CliError {}

impl From<anyhow::Error> for CliError {
    fn from(err: anyhow::Error) -> Self {
        CliError::new(err.to_string(), None)
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => tracing::Level::INFO,
        1 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .init();
}

fn run_daemon(cli: Cli) -> Result<(), CliError> {
    let config = SnifferConfig {
        interface: cli.interface,
        ws_port: cli.port,
        ..SnifferConfig::default()
    };

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = Arc::clone(&shutdown);
        ctrlc::set_handler(move || {
            shutdown.store(true, Ordering::Release);
        })
        .context("failed to install signal handler")?;
    }

    let ring = Arc::new(PacketRing::new());
    let health = Arc::new(HealthStats::new());

    // Open the capture device and bind the listener before spawning
    // anything, so both startup failure paths exit with code 1.
    let mut capture = CaptureEngine::open(&config).map_err(|err| {
        CliError::new(
            format!("cannot start capture: {err}"),
            Some(
                "run with elevated permissions (sudo / Administrator); on Windows install Npcap"
                    .to_string(),
            ),
        )
    })?;
    let capture_stats = capture.stats();
    let capture_handle = capture.stop_handle();

    let mut broadcaster = WsBroadcaster::new(config.ws_port);
    broadcaster.start().map_err(|err| {
        CliError::new(
            format!("cannot start WebSocket server: {err}"),
            Some(format!("is port {} already in use?", config.ws_port)),
        )
    })?;
    let broadcaster = Arc::new(broadcaster);

    let mut aggregator = Aggregator::new(config.clone(), Arc::clone(&ring), Arc::clone(&health));
    let aggregator_handle = aggregator.stop_handle();
    {
        let broadcaster = Arc::clone(&broadcaster);
        aggregator.on_frame(move |frame| broadcaster.broadcast(frame));
    }

    info!(
        interface = capture.interface_name(),
        port = config.ws_port,
        "all systems online; Ctrl+C to stop"
    );

    let capture_thread = {
        let ring = Arc::clone(&ring);
        thread::Builder::new()
            .name("capture".to_string())
            .spawn(move || capture.run(&ring))
            .context("failed to spawn capture thread")?
    };
    let aggregator_thread = thread::Builder::new()
        .name("aggregator".to_string())
        .spawn(move || aggregator.run())
        .context("failed to spawn aggregator thread")?;

    // Supervisor: sample health once a second, log status periodically,
    // watch for the shutdown flag.
    let mut tick = 0u32;
    while !shutdown.load(Ordering::Acquire) {
        thread::sleep(Duration::from_secs(1));
        health.update(capture_stats.kernel_drops(), ring.fill_ratio());

        tick += 1;
        if tick % STATUS_LOG_TICKS == 0 {
            info!(
                packets = capture_stats.packets_captured(),
                ring_drops = ring.drops(),
                clients = broadcaster.client_count(),
                frames = broadcaster.frames_sent(),
                "status"
            );
        }
    }

    info!("shutting down");
    capture_handle.stop();
    aggregator_handle.stop();
    if capture_thread.join().is_err() {
        warn!("capture thread panicked");
    }
    if aggregator_thread.join().is_err() {
        warn!("aggregator thread panicked");
    }
    broadcaster.stop();

    info!(
        packets = capture_stats.packets_captured(),
        frames = broadcaster.frames_sent(),
        "final stats"
    );
    Ok(())
}

fn cmd_list_interfaces() -> ExitCode {
    let interfaces = match abyss_core::list_interfaces() {
        Ok(interfaces) => interfaces,
        Err(err) => {
            eprintln!("error: {err}");
            return ExitCode::FAILURE;
        }
    };

    if interfaces.is_empty() {
        eprintln!("No network interfaces found.");
        eprintln!("Ensure you have proper permissions and pcap is installed.");
        return ExitCode::SUCCESS;
    }

    println!();
    println!("Available network interfaces:");
    println!();
    println!("  # | Name                     | Status   | IPv4 | Description");
    println!("  --+--------------------------+----------+------+---------------------");
    for (idx, iface) in interfaces.iter().enumerate() {
        let name: String = if iface.name.chars().count() > 24 {
            iface.name.chars().take(21).collect::<String>() + "..."
        } else {
            iface.name.clone()
        };
        let status = if iface.is_loopback {
            "loopback"
        } else if iface.is_up {
            "UP"
        } else {
            "down"
        };
        let ipv4 = if iface.has_ipv4 { "yes" } else { "no" };
        println!(
            "  {} | {:<24} | {:<8} | {:<4} | {}",
            idx + 1,
            name,
            status,
            ipv4,
            iface.description
        );
    }
    println!();
    println!("Use -i <name> to select an interface.");
    ExitCode::SUCCESS
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::Cli;

    #[test]
    fn defaults_are_auto_detect_on_9770() {
        let cli = Cli::try_parse_from(["abyss-sniffer"]).expect("parse");
        assert_eq!(cli.port, 9770);
        assert!(cli.interface.is_none());
        assert!(!cli.list);
    }

    #[test]
    fn interface_and_port_flags() {
        let cli =
            Cli::try_parse_from(["abyss-sniffer", "-i", "eth0", "--port", "8080"]).expect("parse");
        assert_eq!(cli.interface.as_deref(), Some("eth0"));
        assert_eq!(cli.port, 8080);
    }

    #[test]
    fn port_zero_is_rejected() {
        assert!(Cli::try_parse_from(["abyss-sniffer", "-p", "0"]).is_err());
    }

    #[test]
    fn unknown_flags_are_rejected() {
        assert!(Cli::try_parse_from(["abyss-sniffer", "--frobnicate"]).is_err());
    }
}
