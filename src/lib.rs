// Coldwatch - Cold-chain sensor gateway
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! # Coldwatch
//!
//! Gateway for battery-powered BLE temperature sensors in cold-chain
//! storage. It keeps links to a fixed set of sensors, triggers and reads a
//! measurement from each on a schedule, publishes telemetry and device
//! state, and raises debounced alarms when a temperature stays outside its
//! configured band.
//!
//! ## Architecture
//!
//! ```text
//!  ConfigSource ──watch──▶ ┌──────────────────────────────┐
//!                          │         GatewayLoop          │
//!  RadioLink ◀──────────── │  ConnectionManager           │
//!  LinkTool  ◀──────────── │  TelemetryReader (battery)   │ ──▶ TelemetrySink
//!                          │  AlarmEngine ─▶ Scheduler    │
//!                          └──────────────────────────────┘
//! ```
//!
//! Every external boundary is a trait with an in-memory implementation
//! ([`MemoryLink`], [`MemoryTool`], [`MemoryConfigSource`], [`MemorySink`]),
//! so a whole gateway can be driven deterministically:
//!
//! ```rust
//! use coldwatch::{
//!     GatewayConfig, GatewayLoop, GatewaySettings, MemoryConfigSource, MemoryDevice,
//!     MemoryLink, MemorySink, MemoryTool, SensorDescriptor,
//! };
//!
//! # tokio_test_block(async {
//! let link = MemoryLink::new();
//! link.add_device("AA:BB:CC:DD:EE:01", MemoryDevice::with_temperature(4.2));
//!
//! let mut gateway = GatewayLoop::new(
//!     vec![SensorDescriptor::new("AA:BB:CC:DD:EE:01", "walk-in freezer")],
//!     GatewayConfig::fast(),
//!     link,
//!     MemoryTool::new(),
//!     MemoryConfigSource::new(GatewaySettings::default()),
//!     MemorySink::new(),
//! );
//!
//! let report = gateway.run_cycle().await;
//! assert_eq!(report.records.len(), 1);
//! # });
//! # fn tokio_test_block<F: std::future::Future>(f: F) -> F::Output {
//! #     tokio::runtime::Builder::new_current_thread()
//! #         .enable_time()
//! #         .build()
//! #         .unwrap()
//! #         .block_on(f)
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`connection`]: link lifecycle, retries, drop handling, disconnect fallback
//! - [`telemetry`]: measurement trigger and payload decoding
//! - [`battery`]: temperature-compensated charge estimate with hysteresis
//! - [`alarm`]: debounced threshold alarms
//! - [`scheduler`]: next-wake computation
//! - [`gateway`]: the control loop

// Modules
pub mod alarm;
pub mod battery;
pub mod clock;
pub mod config;
pub mod connection;
pub mod error;
pub mod gateway;
pub mod radio;
pub mod scheduler;
pub mod settings;
pub mod sink;
pub mod telemetry;
pub mod tool;

// Re-exports for convenient access
pub use alarm::{AlarmEngine, AlarmState, AlertEvent};
pub use battery::{BatteryCurve, BatteryMemory};
pub use clock::RuntimeClock;
pub use config::{
    load_devices, AlarmConfig, ConnectionConfig, GatewayConfig, ReaderConfig, SchedulerConfig,
    SensorDescriptor, StartupConfig,
};
pub use connection::{ConnectionEntry, ConnectionManager, DisconnectOutcome, EnsureSummary};
pub use error::{ConfigError, GatewayError, LinkError, Result, SinkError, ToolError};
pub use gateway::{alert_message, CycleReport, DeviceStatusMemory, GatewayLoop};
pub use radio::{
    Characteristic, DisconnectBehavior, DropNotifier, LinkDropped, MemoryDevice, MemoryHandle,
    MemoryLink, RadioLink, TRIGGER_PAYLOAD,
};
pub use scheduler::Scheduler;
pub use settings::{ConfigSource, GatewaySettings, MemoryConfigSource};
pub use sink::{MemorySink, PanelBitmap, SinkEvent, TelemetryRecord, TelemetrySink};
pub use telemetry::{DeviceRead, Reading, TelemetryReader};
pub use tool::{BluetoothCtl, LinkTool, MemoryTool};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
