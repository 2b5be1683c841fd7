// Coldwatch - Cold-chain sensor gateway
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Telemetry and alert delivery
//!
//! Every cycle ends by handing its results to a [`TelemetrySink`]. Sink
//! failures are reported to the caller, which logs them and carries on; a
//! cycle is never aborted by a failed upload.

use std::fmt;
use std::sync::{Mutex, MutexGuard};

use serde::Serialize;

use crate::alarm::AlarmEngine;
use crate::config::SensorDescriptor;
use crate::error::SinkError;

/// One telemetry sample in an upload batch
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetryRecord {
    /// Device address
    #[serde(rename = "publisher")]
    pub device_id: String,
    /// Temperature (°C)
    pub value: f64,
}

/// Alarm flags for every configured device, in configured order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PanelBitmap {
    flags: Vec<bool>,
}

impl PanelBitmap {
    /// Build from the active alert set
    pub fn from_alarms(devices: &[SensorDescriptor], alarms: &AlarmEngine) -> Self {
        Self {
            flags: devices
                .iter()
                .map(|d| alarms.is_active(&d.address))
                .collect(),
        }
    }

    /// Build from explicit flags
    pub fn from_flags(flags: Vec<bool>) -> Self {
        Self { flags }
    }

    /// Per-device flags
    pub fn flags(&self) -> &[bool] {
        &self.flags
    }

    /// Whether any device is alarming
    pub fn any(&self) -> bool {
        self.flags.iter().any(|&f| f)
    }
}

impl fmt::Display for PanelBitmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, flag) in self.flags.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            f.write_str(if *flag { "1" } else { "0" })?;
        }
        f.write_str("]")
    }
}

/// Destination for telemetry, device state and alerts
#[allow(async_fn_in_trait)]
pub trait TelemetrySink {
    /// Upload one cycle's telemetry
    async fn upload_batch(&self, records: &[TelemetryRecord]) -> Result<(), SinkError>;

    /// Publish a device's reachability
    async fn update_device_status(&self, address: &str, active: bool) -> Result<(), SinkError>;

    /// Publish a device's battery percentage
    async fn update_device_battery(&self, address: &str, percent: u8) -> Result<(), SinkError>;

    /// Store an alarm description
    async fn upload_alarm_text(&self, text: &str) -> Result<(), SinkError>;

    /// Replace the alarm panel
    async fn upload_panel_bitmap(&self, panel: &PanelBitmap) -> Result<(), SinkError>;

    /// Send an alert email
    async fn send_alert_email(
        &self,
        recipients: &[String],
        subject: &str,
        body: &str,
    ) -> Result<(), SinkError>;
}

/// A call recorded by [`MemorySink`]
#[derive(Debug, Clone, PartialEq)]
pub enum SinkEvent {
    /// Telemetry batch
    Batch(Vec<TelemetryRecord>),
    /// Device status change
    Status { address: String, active: bool },
    /// Battery percentage
    Battery { address: String, percent: u8 },
    /// Alarm text
    AlarmText(String),
    /// Panel bitmap, rendered
    Panel(String),
    /// Alert email
    Email {
        recipients: Vec<String>,
        subject: String,
        body: String,
    },
}

/// In-memory [`TelemetrySink`]
///
/// Records every call, including ones it was told to reject.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<SinkEvent>>,
    reject: bool,
}

impl MemorySink {
    /// Sink that accepts everything
    pub fn new() -> Self {
        Self::default()
    }

    /// Sink that records, then rejects, every call
    pub fn rejecting() -> Self {
        Self {
            reject: true,
            ..Default::default()
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<SinkEvent>> {
        self.events.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn record(&self, operation: &'static str, event: SinkEvent) -> Result<(), SinkError> {
        self.lock().push(event);
        if self.reject {
            return Err(SinkError::Rejected {
                operation,
                reason: "sink configured to reject".to_string(),
            });
        }
        Ok(())
    }

    /// All recorded calls, oldest first
    pub fn events(&self) -> Vec<SinkEvent> {
        self.lock().clone()
    }

    /// Forget recorded calls
    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Recorded telemetry batches
    pub fn batches(&self) -> Vec<Vec<TelemetryRecord>> {
        self.lock()
            .iter()
            .filter_map(|e| match e {
                SinkEvent::Batch(records) => Some(records.clone()),
                _ => None,
            })
            .collect()
    }

    /// Recorded status changes as (address, active)
    pub fn statuses(&self) -> Vec<(String, bool)> {
        self.lock()
            .iter()
            .filter_map(|e| match e {
                SinkEvent::Status { address, active } => Some((address.clone(), *active)),
                _ => None,
            })
            .collect()
    }

    /// Recorded emails as (recipients, body)
    pub fn emails(&self) -> Vec<(Vec<String>, String)> {
        self.lock()
            .iter()
            .filter_map(|e| match e {
                SinkEvent::Email {
                    recipients, body, ..
                } => Some((recipients.clone(), body.clone())),
                _ => None,
            })
            .collect()
    }

    /// Recorded panel bitmaps, rendered
    pub fn panels(&self) -> Vec<String> {
        self.lock()
            .iter()
            .filter_map(|e| match e {
                SinkEvent::Panel(p) => Some(p.clone()),
                _ => None,
            })
            .collect()
    }
}

impl TelemetrySink for MemorySink {
    async fn upload_batch(&self, records: &[TelemetryRecord]) -> Result<(), SinkError> {
        if records.is_empty() {
            return Err(SinkError::Empty("upload_batch"));
        }
        self.record("upload_batch", SinkEvent::Batch(records.to_vec()))
    }

    async fn update_device_status(&self, address: &str, active: bool) -> Result<(), SinkError> {
        self.record(
            "update_device_status",
            SinkEvent::Status {
                address: address.to_string(),
                active,
            },
        )
    }

    async fn update_device_battery(&self, address: &str, percent: u8) -> Result<(), SinkError> {
        self.record(
            "update_device_battery",
            SinkEvent::Battery {
                address: address.to_string(),
                percent,
            },
        )
    }

    async fn upload_alarm_text(&self, text: &str) -> Result<(), SinkError> {
        if text.is_empty() {
            return Err(SinkError::Empty("upload_alarm_text"));
        }
        self.record("upload_alarm_text", SinkEvent::AlarmText(text.to_string()))
    }

    async fn upload_panel_bitmap(&self, panel: &PanelBitmap) -> Result<(), SinkError> {
        self.record("upload_panel_bitmap", SinkEvent::Panel(panel.to_string()))
    }

    async fn send_alert_email(
        &self,
        recipients: &[String],
        subject: &str,
        body: &str,
    ) -> Result<(), SinkError> {
        if recipients.is_empty() {
            return Err(SinkError::Empty("send_alert_email"));
        }
        self.record(
            "send_alert_email",
            SinkEvent::Email {
                recipients: recipients.to_vec(),
                subject: subject.to_string(),
                body: body.to_string(),
            },
        )
    }
}
