// Coldwatch - Cold-chain sensor gateway
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Operational settings pushed from outside the gateway
//!
//! Sampling interval, alarm thresholds and alert recipients are owned by a
//! remote [`ConfigSource`]. The gateway fetches them once at startup, then
//! receives replacements through a [`tokio::sync::watch`] channel. Each cycle
//! reads one snapshot, so a push never lands halfway through a cycle.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{de, Deserialize, Deserializer};
use tokio::sync::watch;

use crate::error::ConfigError;

/// Default sampling interval (s)
pub const DEFAULT_SAMPLING_INTERVAL_S: u64 = 60;

/// Default upper alarm threshold (°C)
pub const DEFAULT_MAX_THRESHOLD: f64 = 60.0;

/// Default lower alarm threshold (°C)
pub const DEFAULT_MIN_THRESHOLD: f64 = -40.0;

/// Settings delivered by the configuration source
///
/// Fields missing from a payload take their defaults. Legacy key names are
/// accepted as aliases.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct GatewaySettings {
    /// Base interval between cycles (s)
    ///
    /// Payloads may carry a fractional number; it is rounded up to whole
    /// seconds.
    #[serde(alias = "sampling_interval", deserialize_with = "whole_seconds")]
    pub sampling_interval_s: u64,
    /// Alert email recipients
    pub email_recipients: Vec<String>,
    /// Whether alarm evaluation runs at all
    pub active_alarm: bool,
    /// Upper threshold (°C); readings above it are breaches
    #[serde(alias = "max_alert_threshold")]
    pub max_threshold: f64,
    /// Lower threshold (°C); readings below it are breaches
    #[serde(alias = "min_alert_threshold")]
    pub min_threshold: f64,
}

/// Longest accepted sampling interval (s), one week
pub const MAX_SAMPLING_INTERVAL_S: u64 = 7 * 24 * 60 * 60;

fn whole_seconds<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    let secs = f64::deserialize(deserializer)?;
    if !secs.is_finite() || secs < 0.0 || secs > MAX_SAMPLING_INTERVAL_S as f64 {
        return Err(de::Error::custom(format!(
            "sampling interval must be between 0 and {} s, got {}",
            MAX_SAMPLING_INTERVAL_S, secs
        )));
    }
    Ok(secs.ceil() as u64)
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            sampling_interval_s: DEFAULT_SAMPLING_INTERVAL_S,
            email_recipients: Vec::new(),
            active_alarm: false,
            max_threshold: DEFAULT_MAX_THRESHOLD,
            min_threshold: DEFAULT_MIN_THRESHOLD,
        }
    }
}

impl GatewaySettings {
    /// Base interval between cycles
    pub fn sampling_interval(&self) -> Duration {
        Duration::from_secs(self.sampling_interval_s)
    }

    /// Whether a temperature lies outside the threshold band
    pub fn is_breach(&self, temperature: f64) -> bool {
        temperature > self.max_threshold || temperature < self.min_threshold
    }

    /// Parse a settings payload
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

/// Source of [`GatewaySettings`]
#[allow(async_fn_in_trait)]
pub trait ConfigSource {
    /// Fetch the current settings; `Ok(None)` when none exist yet
    async fn fetch(&self) -> Result<Option<GatewaySettings>, ConfigError>;

    /// Start delivering pushed updates into `updates`
    ///
    /// Returns once the subscription is in place.
    async fn listen(
        &self,
        updates: Arc<watch::Sender<GatewaySettings>>,
    ) -> Result<(), ConfigError>;
}

/// In-memory [`ConfigSource`]
///
/// Serves a fixed value, optionally failing the first few fetches, and lets
/// the caller push updates once [`ConfigSource::listen`] has run.
#[derive(Debug, Default)]
pub struct MemoryConfigSource {
    settings: Mutex<Option<GatewaySettings>>,
    failures_left: Mutex<u32>,
    fetches: Mutex<u32>,
    updates: Mutex<Option<Arc<watch::Sender<GatewaySettings>>>>,
}

impl MemoryConfigSource {
    /// Source serving `settings`
    pub fn new(settings: GatewaySettings) -> Self {
        Self {
            settings: Mutex::new(Some(settings)),
            ..Default::default()
        }
    }

    /// Source that has nothing to serve
    pub fn empty() -> Self {
        Self::default()
    }

    /// Fail the next `count` fetches
    pub fn fail_next(self, count: u32) -> Self {
        if let Ok(mut left) = self.failures_left.lock() {
            *left = count;
        }
        self
    }

    /// Number of fetch calls so far
    pub fn fetch_count(&self) -> u32 {
        self.fetches.lock().map(|f| *f).unwrap_or(0)
    }

    /// Replace the served value and push it to the subscriber, if any
    pub fn push(&self, settings: GatewaySettings) {
        if let Ok(mut current) = self.settings.lock() {
            *current = Some(settings.clone());
        }
        if let Ok(updates) = self.updates.lock() {
            if let Some(tx) = updates.as_ref() {
                tx.send_replace(settings);
            }
        }
    }
}

impl ConfigSource for MemoryConfigSource {
    async fn fetch(&self) -> Result<Option<GatewaySettings>, ConfigError> {
        if let Ok(mut fetches) = self.fetches.lock() {
            *fetches += 1;
        }
        if let Ok(mut left) = self.failures_left.lock() {
            if *left > 0 {
                *left -= 1;
                return Err(ConfigError::Absent("source unavailable".to_string()));
            }
        }
        Ok(self.settings.lock().ok().and_then(|s| s.clone()))
    }

    async fn listen(
        &self,
        updates: Arc<watch::Sender<GatewaySettings>>,
    ) -> Result<(), ConfigError> {
        if let Ok(mut slot) = self.updates.lock() {
            *slot = Some(updates);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_for_missing_fields() {
        let settings = GatewaySettings::from_json(r#"{"active_alarm": true}"#).unwrap();
        assert!(settings.active_alarm);
        assert_eq!(settings.sampling_interval_s, 60);
        assert_eq!(settings.max_threshold, 60.0);
        assert_eq!(settings.min_threshold, -40.0);
        assert!(settings.email_recipients.is_empty());
    }

    #[test]
    fn test_fractional_sampling_interval() {
        let settings = GatewaySettings::from_json(r#"{"sampling_interval": 60.5}"#).unwrap();
        assert_eq!(settings.sampling_interval_s, 61);

        let settings = GatewaySettings::from_json(r#"{"sampling_interval_s": 30}"#).unwrap();
        assert_eq!(settings.sampling_interval(), Duration::from_secs(30));

        assert!(GatewaySettings::from_json(r#"{"sampling_interval": -5}"#).is_err());
        assert!(GatewaySettings::from_json(r#"{"sampling_interval": 1e12}"#).is_err());
    }

    #[test]
    fn test_legacy_keys() {
        let settings = GatewaySettings::from_json(
            r#"{"id": 7, "sampling_interval": 300, "max_alert_threshold": 8.0,
                "min_alert_threshold": 2.0, "email_recipients": ["ops@example.com"]}"#,
        )
        .unwrap();
        assert_eq!(settings.sampling_interval(), Duration::from_secs(300));
        assert_eq!(settings.max_threshold, 8.0);
        assert_eq!(settings.min_threshold, 2.0);
        assert_eq!(settings.email_recipients, vec!["ops@example.com"]);
    }

    #[test]
    fn test_breach_is_strict() {
        let settings = GatewaySettings::default();
        assert!(!settings.is_breach(60.0));
        assert!(!settings.is_breach(-40.0));
        assert!(settings.is_breach(60.1));
        assert!(settings.is_breach(-40.5));
    }

    #[tokio::test]
    async fn test_memory_source_failures_then_value() {
        let source = MemoryConfigSource::new(GatewaySettings::default()).fail_next(2);
        assert!(source.fetch().await.is_err());
        assert!(source.fetch().await.is_err());
        assert!(source.fetch().await.unwrap().is_some());
        assert_eq!(source.fetch_count(), 3);
    }

    #[tokio::test]
    async fn test_memory_source_push_reaches_subscriber() {
        let source = MemoryConfigSource::new(GatewaySettings::default());
        let (tx, rx) = watch::channel(GatewaySettings::default());
        source.listen(Arc::new(tx)).await.unwrap();

        source.push(GatewaySettings {
            sampling_interval_s: 10,
            ..Default::default()
        });
        assert_eq!(rx.borrow().sampling_interval_s, 10);
    }
}
