// Coldwatch - Cold-chain sensor gateway
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Gateway control loop
//!
//! One cycle connects, reads, publishes and schedules:
//!
//! ```text
//! ensure_all ─▶ read_all ─▶ status ─▶ alarms ─▶ battery ─▶ batch
//!                                                            │
//!     sleep(next_delay) ◀── schedule ◀── disconnect? ◀── alerts/panel
//! ```
//!
//! Cycles never overlap. Pushed settings are read once per cycle, so an
//! update takes effect at the next cycle boundary.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{sleep, Instant};
use tracing::{error, info, warn};

use crate::alarm::{AlarmEngine, AlertEvent};
use crate::clock::RuntimeClock;
use crate::config::{GatewayConfig, SensorDescriptor};
use crate::connection::{ConnectionManager, DisconnectOutcome};
use crate::radio::RadioLink;
use crate::scheduler::Scheduler;
use crate::settings::{ConfigSource, GatewaySettings};
use crate::sink::{PanelBitmap, TelemetryRecord, TelemetrySink};
use crate::telemetry::{DeviceRead, TelemetryReader};
use crate::tool::LinkTool;

/// Subject line of alert emails
pub const ALERT_SUBJECT: &str = "Temperature alert";

/// Last published reachability per device
#[derive(Debug, Clone, Default)]
pub struct DeviceStatusMemory {
    last: HashMap<String, bool>,
}

impl DeviceStatusMemory {
    /// Record an observation; true if it should be published
    pub fn observe(&mut self, address: &str, active: bool) -> bool {
        match self.last.insert(address.to_string(), active) {
            Some(previous) => previous != active,
            None => true,
        }
    }

    /// Last published status
    pub fn last(&self, address: &str) -> Option<bool> {
        self.last.get(address).copied()
    }
}

/// Everything one cycle produced
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    /// Per-device read results, in configured order
    pub reads: Vec<DeviceRead>,
    /// Telemetry uploaded this cycle
    pub records: Vec<TelemetryRecord>,
    /// Status events published as (address, active)
    pub status_changes: Vec<(String, bool)>,
    /// Alerts emitted
    pub alerts: Vec<AlertEvent>,
    /// Panel uploaded, if any
    pub panel: Option<PanelBitmap>,
    /// Disconnect outcomes when links were closed after reading
    pub disconnects: Vec<(String, DisconnectOutcome)>,
    /// Delay before the next cycle
    pub next_delay: Duration,
}

/// Compose the alert message body
pub fn alert_message(alerts: &[AlertEvent], settings: &GatewaySettings) -> String {
    let mut lines = vec![
        "Sensor(s) out of temperature range:".to_string(),
        format!(
            "Configured thresholds: max {} °C, min {} °C",
            settings.max_threshold, settings.min_threshold
        ),
    ];
    for alert in alerts {
        lines.push(format!(
            "- {} ({}): {} °C for at least {} minutes",
            alert.name,
            alert.address,
            alert.temperature,
            alert.duration_minutes()
        ));
    }
    lines.join("\n")
}

/// The gateway
pub struct GatewayLoop<L: RadioLink, T, C, S> {
    devices: Vec<SensorDescriptor>,
    config: GatewayConfig,
    connections: ConnectionManager<L, T>,
    reader: TelemetryReader,
    alarms: AlarmEngine,
    scheduler: Scheduler,
    status: DeviceStatusMemory,
    source: C,
    sink: S,
    settings_tx: Arc<watch::Sender<GatewaySettings>>,
    settings_rx: watch::Receiver<GatewaySettings>,
    clock: RuntimeClock,
}

impl<L, T, C, S> GatewayLoop<L, T, C, S>
where
    L: RadioLink,
    T: LinkTool,
    C: ConfigSource,
    S: TelemetrySink,
{
    /// Create a gateway for `devices`
    pub fn new(
        devices: Vec<SensorDescriptor>,
        config: GatewayConfig,
        link: L,
        tool: T,
        source: C,
        sink: S,
    ) -> Self {
        let (settings_tx, settings_rx) = watch::channel(GatewaySettings::default());
        Self {
            connections: ConnectionManager::new(link, tool, config.connection.clone()),
            reader: TelemetryReader::new(config.reader.clone()),
            alarms: AlarmEngine::new(config.alarm.clone()),
            scheduler: Scheduler::new(config.scheduler.clone()),
            status: DeviceStatusMemory::default(),
            devices,
            config,
            source,
            sink,
            settings_tx: Arc::new(settings_tx),
            settings_rx,
            clock: RuntimeClock::new(),
        }
    }

    /// Replace the settings used until the source delivers its own
    pub fn with_settings(self, settings: GatewaySettings) -> Self {
        self.settings_tx.send_replace(settings);
        self
    }

    /// Replace the clock
    pub fn with_clock(mut self, clock: RuntimeClock) -> Self {
        self.clock = clock;
        self
    }

    /// Configured devices
    pub fn devices(&self) -> &[SensorDescriptor] {
        &self.devices
    }

    /// Connection manager
    pub fn connections(&self) -> &ConnectionManager<L, T> {
        &self.connections
    }

    /// Alarm engine
    pub fn alarms(&self) -> &AlarmEngine {
        &self.alarms
    }

    /// Last published device status
    pub fn status(&self) -> &DeviceStatusMemory {
        &self.status
    }

    /// Configuration source
    pub fn source(&self) -> &C {
        &self.source
    }

    /// Telemetry sink
    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Settings currently in force
    pub fn settings(&self) -> GatewaySettings {
        self.settings_rx.borrow().clone()
    }

    /// Watch the settings in force
    pub fn subscribe_settings(&self) -> watch::Receiver<GatewaySettings> {
        self.settings_tx.subscribe()
    }

    /// Run forever
    pub async fn run(&mut self) {
        self.startup().await;
        loop {
            let report = self.run_cycle().await;
            sleep(report.next_delay).await;
        }
    }

    /// Close every open link
    pub async fn shutdown(&mut self) -> Vec<(String, DisconnectOutcome)> {
        info!(links = self.connections.count(), "Shutting down");
        self.connections.disconnect_all().await
    }

    /// Wait for the radio, fetch settings, subscribe to updates and clear
    /// links left over from a previous run
    pub async fn startup(&mut self) {
        let startup = self.config.startup.clone();
        if !startup.initial_delay().is_zero() {
            info!(delay_ms = startup.initial_delay_ms, "Waiting for radio to settle");
            sleep(startup.initial_delay()).await;
        }

        let settings = loop {
            match self.source.fetch().await {
                Ok(Some(settings)) => break settings,
                Ok(None) => warn!(
                    retry_ms = startup.config_retry_ms,
                    "No settings available, retrying"
                ),
                Err(e) => error!(
                    error = %e,
                    retry_ms = startup.config_retry_ms,
                    "Settings fetch failed, retrying"
                ),
            }
            sleep(startup.config_retry()).await;
        };
        info!(
            sampling_interval_s = settings.sampling_interval_s,
            active_alarm = settings.active_alarm,
            max_threshold = settings.max_threshold,
            min_threshold = settings.min_threshold,
            "Settings loaded"
        );
        self.settings_tx.send_replace(settings);

        if let Err(e) = self.source.listen(Arc::clone(&self.settings_tx)).await {
            error!(error = %e, "Failed to subscribe to settings updates");
        }

        if startup.purge_stale_links {
            let purged = self.connections.purge_stale_links().await;
            info!(purged, "Cleared stale links");
        }
    }

    /// Run one cycle
    pub async fn run_cycle(&mut self) -> CycleReport {
        let started = Instant::now();
        let settings = self.settings_rx.borrow_and_update().clone();

        self.connections.ensure_all(&self.devices).await;
        let reads = self
            .reader
            .read_all(&self.connections, &self.devices)
            .await;

        let status_changes = self.publish_status(&reads).await;

        let records: Vec<TelemetryRecord> = reads
            .iter()
            .filter_map(DeviceRead::reading)
            .map(|r| TelemetryRecord {
                device_id: r.address.clone(),
                value: r.temperature,
            })
            .collect();

        let now = self.clock.now();
        let active_before = self.alarms.active().clone();
        let mut alerts = Vec::new();
        if settings.active_alarm {
            for reading in reads.iter().filter_map(DeviceRead::reading) {
                if let Some(alert) = self.alarms.evaluate(
                    &reading.address,
                    &reading.name,
                    reading.temperature,
                    &settings,
                    now,
                ) {
                    alerts.push(alert);
                }
            }
        }

        for reading in reads.iter().filter_map(DeviceRead::reading) {
            let Some(percent) = reading.battery_percent else {
                continue;
            };
            match self.sink.update_device_battery(&reading.address, percent).await {
                Ok(()) => info!(address = %reading.address, percent, "Published battery level"),
                Err(e) => error!(address = %reading.address, error = %e, "Battery update failed"),
            }
        }

        if records.is_empty() {
            warn!("No telemetry to upload");
        } else if let Err(e) = self.sink.upload_batch(&records).await {
            error!(records = records.len(), error = %e, "Telemetry upload failed");
        }

        if !alerts.is_empty() {
            let message = alert_message(&alerts, &settings);
            if let Err(e) = self
                .sink
                .send_alert_email(&settings.email_recipients, ALERT_SUBJECT, &message)
                .await
            {
                error!(error = %e, "Alert email failed");
            }
            let text = format!("{}!\n{}", ALERT_SUBJECT, message);
            if let Err(e) = self.sink.upload_alarm_text(&text).await {
                error!(error = %e, "Alarm upload failed");
            }
        }

        let mut panel = None;
        if !alerts.is_empty() || active_before != *self.alarms.active() {
            let bitmap = PanelBitmap::from_alarms(&self.devices, &self.alarms);
            info!(panel = %bitmap, "Publishing alarm panel");
            if let Err(e) = self.sink.upload_panel_bitmap(&bitmap).await {
                error!(error = %e, "Panel upload failed");
            }
            panel = Some(bitmap);
        }

        let mut disconnects = Vec::new();
        if settings.sampling_interval_s >= self.config.startup.disconnect_after_read_s {
            disconnects = self.connections.disconnect_all().await;
        }

        let next_delay = self.scheduler.next_delay(
            started.elapsed(),
            self.clock.now(),
            settings.sampling_interval(),
            &self.alarms,
            &self.devices,
        );
        info!(
            read = records.len(),
            configured = self.devices.len(),
            alerts = alerts.len(),
            next_delay_ms = next_delay.as_millis() as u64,
            "Cycle complete"
        );

        CycleReport {
            reads,
            records,
            status_changes,
            alerts,
            panel,
            disconnects,
            next_delay,
        }
    }

    async fn publish_status(&mut self, reads: &[DeviceRead]) -> Vec<(String, bool)> {
        let mut changes = Vec::new();
        for device in &self.devices {
            let active = reads
                .iter()
                .any(|r| r.address == device.address && r.result.is_ok());
            if !self.status.observe(&device.address, active) {
                continue;
            }
            match self.sink.update_device_status(&device.address, active).await {
                Ok(()) => info!(address = %device.address, active, "Published device status"),
                Err(e) => error!(address = %device.address, error = %e, "Status update failed"),
            }
            changes.push((device.address.clone(), active));
        }
        changes
    }
}
