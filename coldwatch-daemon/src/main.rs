// Coldwatch Daemon - Cold-chain sensor gateway
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! # Coldwatch Daemon
//!
//! Runs the gateway loop against real sensors (feature `btleplug`) or a
//! simulated radio.
//!
//! ## Usage
//!
//! ```bash
//! # Real sensors
//! coldwatch-daemon --devices sensors.json --settings gateway.json
//!
//! # Simulated sensors, verbose
//! coldwatch-daemon --devices sensors.json --simulate --log-level debug
//!
//! # Toggle between INFO and WARN at runtime
//! kill -USR1 $(pidof coldwatch-daemon)
//! ```

#[cfg(feature = "btleplug")]
mod btle;
mod file_source;
mod log_sink;
mod logging;

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use coldwatch::{
    load_devices, GatewayConfig, GatewayError, GatewayLoop, GatewaySettings, LinkTool,
    MemoryDevice, MemoryLink, MemoryTool, RadioLink, SensorDescriptor,
};
use tokio::sync::watch;
use tracing::{error, info, warn};

use file_source::FileConfigSource;
use log_sink::LogSink;
use logging::LevelToggle;

/// Coldwatch gateway daemon
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Device list: [["AA:BB:..", "name"], ...] or [{"address": .., "name": ..}, ...]
    #[arg(short, long, default_value = "sensors.json")]
    devices: PathBuf,

    /// Operational settings file, polled for changes
    #[arg(short, long, default_value = "gateway.json")]
    settings: PathBuf,

    /// Gateway tunables (retries, timeouts, alarm timing)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Settings poll interval in seconds
    #[arg(long, default_value = "10")]
    poll_interval: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Run against simulated sensors
    #[arg(long)]
    simulate: bool,

    /// Do not clear leftover links at startup
    #[arg(long)]
    no_purge: bool,
}

/// In-memory radio with one plausible sensor per configured device
fn simulated_link(devices: &[SensorDescriptor]) -> MemoryLink {
    let link = MemoryLink::new();
    for (i, device) in devices.iter().enumerate() {
        let temperature = -18.0 + 2.5 * i as f64;
        link.add_device(device.address.clone(), MemoryDevice::with_temperature(temperature));
    }
    link
}

#[cfg(unix)]
fn spawn_level_toggle(
    mut toggle: LevelToggle,
    settings: watch::Receiver<GatewaySettings>,
) -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut signals = signal(SignalKind::user_defined1())?;
    tokio::spawn(async move {
        while signals.recv().await.is_some() {
            match toggle.toggle() {
                Ok(level) => warn!(%level, "Log level changed"),
                Err(e) => error!(error = %e, "Log level change failed"),
            }
            warn!(
                sampling_interval_s = settings.borrow().sampling_interval_s,
                "Sampling interval"
            );
        }
    });
    Ok(())
}

async fn serve<L, T>(
    mut gateway: GatewayLoop<L, T, FileConfigSource, LogSink>,
    toggle: LevelToggle,
) -> Result<(), GatewayError>
where
    L: RadioLink,
    T: LinkTool,
{
    #[cfg(unix)]
    if let Err(e) = spawn_level_toggle(toggle, gateway.subscribe_settings()) {
        warn!(error = %e, "SIGUSR1 handler not installed");
    }
    #[cfg(not(unix))]
    drop(toggle);

    tokio::select! {
        _ = gateway.run() => {}
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!(error = %e, "Signal handler failed");
            }
        }
    }

    for (address, outcome) in gateway.shutdown().await {
        if !outcome.is_confirmed() {
            warn!(address = %address, ?outcome, "Link not confirmed closed");
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), GatewayError> {
    let args = Args::parse();
    let toggle = logging::init(&args.log_level);

    info!("Coldwatch daemon v{}", env!("CARGO_PKG_VERSION"));

    let devices = load_devices(&args.devices).map_err(|e| {
        error!(path = %args.devices.display(), error = %e, "Device list unavailable");
        e
    })?;
    info!(count = devices.len(), "Sensors loaded");

    let mut config = match &args.config {
        Some(path) => GatewayConfig::load(path).map_err(|e| {
            error!(error = %e, "Gateway configuration unavailable");
            e
        })?,
        None => GatewayConfig::default(),
    };
    if args.no_purge {
        config.startup.purge_stale_links = false;
    }
    config.validate()?;

    let source = FileConfigSource::new(&args.settings, Duration::from_secs(args.poll_interval));

    if args.simulate {
        info!("Simulated radio");
        config.startup.initial_delay_ms = 0;
        config.startup.purge_stale_links = false;
        let link = simulated_link(&devices);
        let gateway =
            GatewayLoop::new(devices, config, link, MemoryTool::new(), source, LogSink::new());
        return serve(gateway, toggle).await;
    }

    run_hardware(devices, config, source, toggle).await
}

#[cfg(feature = "btleplug")]
async fn run_hardware(
    devices: Vec<SensorDescriptor>,
    config: GatewayConfig,
    source: FileConfigSource,
    toggle: LevelToggle,
) -> Result<(), GatewayError> {
    let link = btle::BtleLink::new(btle::DEFAULT_SCAN_TIMEOUT)
        .await
        .map_err(|e| {
            error!(error = %e, "Bluetooth unavailable");
            e
        })?;
    let tool = coldwatch::BluetoothCtl::new(config.connection.tool_timeout());
    let gateway = GatewayLoop::new(devices, config, link, tool, source, LogSink::new());
    serve(gateway, toggle).await
}

#[cfg(not(feature = "btleplug"))]
async fn run_hardware(
    _devices: Vec<SensorDescriptor>,
    _config: GatewayConfig,
    _source: FileConfigSource,
    _toggle: LevelToggle,
) -> Result<(), GatewayError> {
    error!("Built without a radio backend; rebuild with --features btleplug or pass --simulate");
    Err(coldwatch::ConfigError::Invalid("no radio backend compiled in".to_string()).into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_defaults() {
        let args = Args::parse_from(["coldwatch-daemon"]);
        assert_eq!(args.devices, PathBuf::from("sensors.json"));
        assert_eq!(args.settings, PathBuf::from("gateway.json"));
        assert!(!args.simulate);
        assert!(!args.no_purge);
    }

    #[test]
    fn test_args_flags() {
        let args = Args::parse_from([
            "coldwatch-daemon",
            "--devices",
            "/etc/coldwatch/sensors.json",
            "--simulate",
            "--no-purge",
            "--log-level",
            "warn",
        ]);
        assert!(args.simulate);
        assert!(args.no_purge);
        assert_eq!(args.log_level, "warn");
    }

    #[test]
    fn test_simulated_link_covers_devices() {
        let devices = vec![
            SensorDescriptor::new("AA", "a"),
            SensorDescriptor::new("BB", "b"),
        ];
        let link = simulated_link(&devices);
        assert_eq!(link.connect_attempts("AA"), 0);
        assert!(!link.is_linked("BB"));
    }
}
