// Coldwatch - Cold-chain sensor gateway
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Debounced threshold alarms
//!
//! A device that leaves the threshold band is pending until it has stayed
//! out for `min_duration_after_start`. It then joins the active set and an
//! alert is emitted, repeated every `resend_interval` while the breach
//! lasts. One in-range reading clears everything for that device.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info};

use crate::config::AlarmConfig;
use crate::settings::GatewaySettings;

/// Alarm bookkeeping for one device
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AlarmState {
    /// Start of the current breach
    pub over_threshold_since: Option<DateTime<Utc>>,
    /// Last alert emitted for the current breach
    pub last_alert_sent: Option<DateTime<Utc>>,
}

/// An alert to deliver
#[derive(Debug, Clone, PartialEq)]
pub struct AlertEvent {
    /// Device address
    pub address: String,
    /// Device display name
    pub name: String,
    /// Temperature that triggered the alert (°C)
    pub temperature: f64,
    /// How long the breach has lasted
    pub duration: Duration,
}

impl AlertEvent {
    /// Breach duration in whole minutes
    pub fn duration_minutes(&self) -> i64 {
        self.duration.num_minutes()
    }
}

/// Per-device alarm state machine
#[derive(Debug, Clone, Default)]
pub struct AlarmEngine {
    config: AlarmConfig,
    states: HashMap<String, AlarmState>,
    active: HashSet<String>,
}

impl AlarmEngine {
    /// Create an engine with no devices tracked
    pub fn new(config: AlarmConfig) -> Self {
        Self {
            config,
            states: HashMap::new(),
            active: HashSet::new(),
        }
    }

    /// Alarm timing in use
    pub fn config(&self) -> &AlarmConfig {
        &self.config
    }

    /// Evaluate one reading
    ///
    /// Returns an alert when the device has been out of range long enough
    /// and no alert went out for it within the resend interval.
    pub fn evaluate(
        &mut self,
        address: &str,
        name: &str,
        temperature: f64,
        settings: &GatewaySettings,
        now: DateTime<Utc>,
    ) -> Option<AlertEvent> {
        if !settings.is_breach(temperature) {
            self.clear(address);
            return None;
        }

        let state = self.states.entry(address.to_string()).or_default();
        let since = *state.over_threshold_since.get_or_insert(now);
        let duration = now - since;
        debug!(address, temperature, duration_s = duration.num_seconds(), "Out of range");

        if duration < self.config.min_duration_after_start() {
            return None;
        }
        self.active.insert(address.to_string());

        let due = state
            .last_alert_sent
            .map_or(true, |sent| now - sent >= self.config.resend_interval());
        if !due {
            return None;
        }
        state.last_alert_sent = Some(now);

        info!(address, name, temperature, duration_min = duration.num_minutes(), "Alert");
        Some(AlertEvent {
            address: address.to_string(),
            name: name.to_string(),
            temperature,
            duration,
        })
    }

    fn clear(&mut self, address: &str) {
        if let Some(state) = self.states.get_mut(address) {
            if state.over_threshold_since.is_some() {
                info!(address, "Back in range");
            }
            *state = AlarmState::default();
        }
        self.active.remove(address);
    }

    /// State for an address, if it was ever out of range
    pub fn state(&self, address: &str) -> Option<&AlarmState> {
        self.states.get(address)
    }

    /// Whether an address is in the active alert set
    pub fn is_active(&self, address: &str) -> bool {
        self.active.contains(address)
    }

    /// Addresses in the active alert set
    pub fn active(&self) -> &HashSet<String> {
        &self.active
    }

    /// Next moment evaluating `address` could emit an alert
    ///
    /// This is the end of the debounce window for a pending breach, or the
    /// resend deadline for an active one.
    pub fn next_deadline(&self, address: &str) -> Option<DateTime<Utc>> {
        let state = self.states.get(address)?;
        match (state.over_threshold_since, state.last_alert_sent) {
            (Some(since), None) => Some(since + self.config.min_duration_after_start()),
            (Some(_), Some(sent)) if self.active.contains(address) => {
                Some(sent + self.config.resend_interval())
            }
            _ => None,
        }
    }
}
