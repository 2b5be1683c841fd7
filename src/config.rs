// Coldwatch - Cold-chain sensor gateway
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Process-level configuration
//!
//! [`GatewayConfig`] holds the tunables that are fixed for the life of the
//! process (retry counts, timeouts, alarm timing). Operational settings that
//! change at runtime live in [`crate::settings`]. The device list is loaded
//! once at startup by [`load_devices`].

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::battery::DEFAULT_HYSTERESIS;
use crate::error::ConfigError;

/// One configured sensor
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(from = "DescriptorRepr")]
pub struct SensorDescriptor {
    /// Unique link address (MAC)
    pub address: String,
    /// Display label
    pub name: String,
}

impl SensorDescriptor {
    /// Create a descriptor
    pub fn new(address: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            name: name.into(),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum DescriptorRepr {
    Pair(String, String),
    Object { address: String, name: String },
}

impl From<DescriptorRepr> for SensorDescriptor {
    fn from(repr: DescriptorRepr) -> Self {
        match repr {
            DescriptorRepr::Pair(address, name) | DescriptorRepr::Object { address, name } => {
                Self { address, name }
            }
        }
    }
}

/// Load the ordered device list from a JSON file
///
/// Accepts `[["AA:..", "name"], ...]` and `[{"address": .., "name": ..}]`.
/// Order is preserved; it defines the panel bitmap column order.
pub fn load_devices(path: impl AsRef<Path>) -> Result<Vec<SensorDescriptor>, ConfigError> {
    let devices: Vec<SensorDescriptor> = read_json(path.as_ref())?;
    validate_devices(&devices)?;
    Ok(devices)
}

/// Reject empty lists and duplicate addresses
pub fn validate_devices(devices: &[SensorDescriptor]) -> Result<(), ConfigError> {
    if devices.is_empty() {
        return Err(ConfigError::Invalid("device list is empty".to_string()));
    }
    for (i, device) in devices.iter().enumerate() {
        if devices[..i].iter().any(|d| d.address == device.address) {
            return Err(ConfigError::Invalid(format!(
                "duplicate device address {}",
                device.address
            )));
        }
    }
    Ok(())
}

pub(crate) fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let display = path.display().to_string();
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: display.clone(),
        source,
    })?;
    serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
        path: display,
        source,
    })
}

/// Connection lifecycle tunables
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Connect attempts per device per cycle
    pub max_retries: u32,
    /// Pause between connect attempts (ms)
    pub retry_delay_ms: u64,
    /// Bound on a single connect attempt (ms)
    pub connect_timeout_ms: u64,
    /// Bound on a link-level disconnect (ms)
    pub disconnect_timeout_ms: u64,
    /// Bound on one OS-tool invocation (ms)
    pub tool_timeout_ms: u64,
    /// Pause between devices when clearing stale links at startup (ms)
    pub purge_pause_ms: u64,
    /// Capacity of the link-drop notification queue
    pub drop_queue_capacity: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay_ms: 2_000,
            connect_timeout_ms: 10_000,
            disconnect_timeout_ms: 5_000,
            tool_timeout_ms: 5_000,
            purge_pause_ms: 2_000,
            drop_queue_capacity: 64,
        }
    }
}

impl ConnectionConfig {
    /// Pause between connect attempts
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// Bound on a single connect attempt
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Bound on a link-level disconnect
    pub fn disconnect_timeout(&self) -> Duration {
        Duration::from_millis(self.disconnect_timeout_ms)
    }

    /// Bound on one OS-tool invocation
    pub fn tool_timeout(&self) -> Duration {
        Duration::from_millis(self.tool_timeout_ms)
    }

    /// Pause between devices when clearing stale links
    pub fn purge_pause(&self) -> Duration {
        Duration::from_millis(self.purge_pause_ms)
    }
}

/// Telemetry reader tunables
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ReaderConfig {
    /// Wait between trigger and first read (ms)
    pub settle_delay_ms: u64,
    /// Minimum battery percentage change worth reporting
    pub battery_hysteresis: u8,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            settle_delay_ms: 100,
            battery_hysteresis: DEFAULT_HYSTERESIS,
        }
    }
}

impl ReaderConfig {
    /// Wait between trigger and first read
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }
}

/// Alarm timing
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct AlarmConfig {
    /// Breach duration before the first alert (s)
    pub min_duration_after_start_s: u64,
    /// Interval between repeated alerts for an ongoing breach (s)
    pub resend_interval_s: u64,
}

impl Default for AlarmConfig {
    fn default() -> Self {
        Self {
            min_duration_after_start_s: 5 * 60,
            resend_interval_s: 60 * 60,
        }
    }
}

/// Longest accepted alarm duration (s), one year
pub const MAX_ALARM_DURATION_S: u64 = 366 * 24 * 60 * 60;

impl AlarmConfig {
    /// Breach duration before the first alert
    pub fn min_duration_after_start(&self) -> chrono::Duration {
        alarm_duration(self.min_duration_after_start_s)
    }

    /// Interval between repeated alerts
    pub fn resend_interval(&self) -> chrono::Duration {
        alarm_duration(self.resend_interval_s)
    }
}

// Clamped so an unvalidated value can neither overflow nor wrap negative
fn alarm_duration(secs: u64) -> chrono::Duration {
    chrono::Duration::seconds(secs.min(MAX_ALARM_DURATION_S) as i64)
}

/// Wake scheduling tunables
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Smallest delay ever returned (ms)
    pub floor_ms: u64,
    /// How far ahead of an alarm deadline to wake (ms)
    pub guard_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            floor_ms: 200,
            guard_ms: 1_000,
        }
    }
}

impl SchedulerConfig {
    /// Smallest delay ever returned
    pub fn floor(&self) -> Duration {
        Duration::from_millis(self.floor_ms)
    }

    /// Wake margin ahead of deadlines
    pub fn guard(&self) -> Duration {
        Duration::from_millis(self.guard_ms)
    }
}

/// Startup sequencing
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct StartupConfig {
    /// Wait before the first configuration fetch (ms)
    pub initial_delay_ms: u64,
    /// Backoff between failed configuration fetches (ms)
    pub config_retry_ms: u64,
    /// Clear links left over from a previous run
    pub purge_stale_links: bool,
    /// Sampling intervals at or above this disconnect after each cycle (s)
    pub disconnect_after_read_s: u64,
}

impl Default for StartupConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 20_000,
            config_retry_ms: 120_000,
            purge_stale_links: true,
            disconnect_after_read_s: 300,
        }
    }
}

impl StartupConfig {
    /// Wait before the first configuration fetch
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    /// Backoff between failed configuration fetches
    pub fn config_retry(&self) -> Duration {
        Duration::from_millis(self.config_retry_ms)
    }
}

/// Gateway-level configuration
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Connection lifecycle
    pub connection: ConnectionConfig,
    /// Telemetry reading
    pub reader: ReaderConfig,
    /// Alarm timing
    pub alarm: AlarmConfig,
    /// Wake scheduling
    pub scheduler: SchedulerConfig,
    /// Startup sequencing
    pub startup: StartupConfig,
}

impl GatewayConfig {
    /// Load from a JSON file; missing sections and fields take defaults
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let config: Self = read_json(path.as_ref())?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the loop cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.connection.max_retries == 0 {
            return Err(ConfigError::Invalid(
                "connection.max_retries must be at least 1".to_string(),
            ));
        }
        if self.scheduler.floor_ms == 0 {
            return Err(ConfigError::Invalid(
                "scheduler.floor_ms must be positive".to_string(),
            ));
        }
        if self.connection.drop_queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "connection.drop_queue_capacity must be positive".to_string(),
            ));
        }
        if self.alarm.resend_interval_s == 0 {
            return Err(ConfigError::Invalid(
                "alarm.resend_interval_s must be positive".to_string(),
            ));
        }
        for (field, value) in [
            (
                "alarm.min_duration_after_start_s",
                self.alarm.min_duration_after_start_s,
            ),
            ("alarm.resend_interval_s", self.alarm.resend_interval_s),
        ] {
            if value > MAX_ALARM_DURATION_S {
                return Err(ConfigError::Invalid(format!(
                    "{} must be at most {} (got {})",
                    field, MAX_ALARM_DURATION_S, value
                )));
            }
        }
        Ok(())
    }

    /// Configuration with every delay shortened for simulation runs
    pub fn fast() -> Self {
        Self {
            startup: StartupConfig {
                initial_delay_ms: 0,
                config_retry_ms: 1_000,
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gateway_config_default() {
        let config = GatewayConfig::default();
        assert_eq!(config.connection.max_retries, 3);
        assert_eq!(config.connection.retry_delay(), Duration::from_secs(2));
        assert_eq!(config.connection.disconnect_timeout(), Duration::from_secs(5));
        assert_eq!(config.reader.settle_delay(), Duration::from_millis(100));
        assert_eq!(config.reader.battery_hysteresis, 5);
        assert_eq!(
            config.alarm.min_duration_after_start(),
            chrono::Duration::minutes(5)
        );
        assert_eq!(config.alarm.resend_interval(), chrono::Duration::minutes(60));
        assert_eq!(config.scheduler.floor(), Duration::from_millis(200));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_config_keeps_defaults() {
        let config: GatewayConfig =
            serde_json::from_str(r#"{"connection": {"max_retries": 5}}"#).unwrap();
        assert_eq!(config.connection.max_retries, 5);
        assert_eq!(config.connection.retry_delay_ms, 2_000);
        assert_eq!(config.alarm, AlarmConfig::default());
    }

    #[test]
    fn test_zero_retries_rejected() {
        let mut config = GatewayConfig::default();
        config.connection.max_retries = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_alarm_durations_out_of_range_rejected() {
        let config: GatewayConfig =
            serde_json::from_str(r#"{"alarm": {"resend_interval_s": 10000000000000000}}"#)
                .unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
        // Unvalidated values still yield a usable duration
        assert_eq!(
            config.alarm.resend_interval(),
            chrono::Duration::seconds(MAX_ALARM_DURATION_S as i64)
        );

        let mut config = GatewayConfig::default();
        config.alarm.min_duration_after_start_s = u64::MAX;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
        assert!(config.alarm.min_duration_after_start() > chrono::Duration::zero());

        config.alarm.min_duration_after_start_s = 300;
        config.alarm.resend_interval_s = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_descriptor_pair_and_object_forms() {
        let devices: Vec<SensorDescriptor> = serde_json::from_str(
            r#"[["C4:7C:8D:6A:1B:02", "Freezer"], {"address": "C4:7C:8D:6A:1B:03", "name": "Fridge"}]"#,
        )
        .unwrap();
        assert_eq!(
            devices,
            vec![
                SensorDescriptor::new("C4:7C:8D:6A:1B:02", "Freezer"),
                SensorDescriptor::new("C4:7C:8D:6A:1B:03", "Fridge"),
            ]
        );
    }

    #[test]
    fn test_duplicate_addresses_rejected() {
        let devices = vec![
            SensorDescriptor::new("AA", "one"),
            SensorDescriptor::new("AA", "two"),
        ];
        assert!(validate_devices(&devices).is_err());
        assert!(validate_devices(&[]).is_err());
    }
}
