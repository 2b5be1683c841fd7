// Coldwatch Daemon - Log-backed telemetry sink
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Sink that writes every call to the log.

use coldwatch::{PanelBitmap, SinkError, TelemetryRecord, TelemetrySink};
use tracing::{info, warn};

/// [`TelemetrySink`] emitting structured tracing events
#[derive(Debug, Clone, Default)]
pub struct LogSink;

impl LogSink {
    /// Create a log sink
    pub fn new() -> Self {
        Self
    }
}

impl TelemetrySink for LogSink {
    async fn upload_batch(&self, records: &[TelemetryRecord]) -> Result<(), SinkError> {
        if records.is_empty() {
            return Err(SinkError::Empty("upload_batch"));
        }
        let payload = serde_json::to_string(records).map_err(|e| SinkError::Rejected {
            operation: "upload_batch",
            reason: e.to_string(),
        })?;
        info!(target: "coldwatch::telemetry", count = records.len(), %payload, "Telemetry");
        Ok(())
    }

    async fn update_device_status(&self, address: &str, active: bool) -> Result<(), SinkError> {
        info!(target: "coldwatch::telemetry", address, active, "Device status");
        Ok(())
    }

    async fn update_device_battery(&self, address: &str, percent: u8) -> Result<(), SinkError> {
        info!(target: "coldwatch::telemetry", address, percent, "Device battery");
        Ok(())
    }

    async fn upload_alarm_text(&self, text: &str) -> Result<(), SinkError> {
        if text.is_empty() {
            return Err(SinkError::Empty("upload_alarm_text"));
        }
        warn!(target: "coldwatch::telemetry", %text, "Alarm");
        Ok(())
    }

    async fn upload_panel_bitmap(&self, panel: &PanelBitmap) -> Result<(), SinkError> {
        info!(target: "coldwatch::telemetry", %panel, "Alarm panel");
        Ok(())
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
        warn!(
            target: "coldwatch::telemetry",
            to = %recipients.join(", "),
            subject,
            %body,
            "Alert email"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_empty_payloads_rejected() {
        let sink = LogSink::new();
        assert_eq!(
            sink.upload_batch(&[]).await,
            Err(SinkError::Empty("upload_batch"))
        );
        assert!(sink.send_alert_email(&[], "s", "b").await.is_err());
        assert!(sink.upload_alarm_text("").await.is_err());
    }

    #[tokio::test]
    async fn test_accepts_records() {
        let sink = LogSink::new();
        let records = vec![TelemetryRecord {
            device_id: "AA".to_string(),
            value: -18.5,
        }];
        assert!(sink.upload_batch(&records).await.is_ok());
        assert!(sink
            .upload_panel_bitmap(&PanelBitmap::from_flags(vec![true]))
            .await
            .is_ok());
    }
}
