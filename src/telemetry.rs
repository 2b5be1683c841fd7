// Coldwatch - Cold-chain sensor gateway
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Telemetry reading
//!
//! A measurement is started by writing [`TRIGGER_PAYLOAD`] to the
//! temperature characteristic. After a short settle delay the reader fetches
//! temperature, humidity and battery payloads:
//!
//! ```text
//! temperature  i32 LE   value x 100 (°C)
//! humidity     i32 LE   value x 100 (%), empty if the sensor has none
//! battery      i16 LE   millivolts
//!              i16 LE   cell temperature (°C)
//! ```
//!
//! Failures are per device: [`TelemetryReader::read_all`] returns one
//! [`DeviceRead`] per connected device, each carrying its own result.

use tokio::time::sleep;
use tracing::{debug, error};

use crate::battery::{BatteryCurve, BatteryMemory};
use crate::config::{ReaderConfig, SensorDescriptor};
use crate::connection::{ConnectionEntry, ConnectionManager};
use crate::error::LinkError;
use crate::radio::{Characteristic, RadioLink, TRIGGER_PAYLOAD};
use crate::tool::LinkTool;

/// One decoded measurement
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    /// Device address
    pub address: String,
    /// Device display name
    pub name: String,
    /// Temperature (°C)
    pub temperature: f64,
    /// Relative humidity (%)
    pub humidity: Option<f64>,
    /// Battery voltage (mV)
    pub battery_mv: i16,
    /// Battery temperature (°C)
    pub battery_temp: i16,
    /// Charge percentage, present only when it should be reported
    pub battery_percent: Option<u8>,
}

/// Outcome of reading one device
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceRead {
    /// Device address
    pub address: String,
    /// Reading, or why there is none this cycle
    pub result: Result<Reading, LinkError>,
}

impl DeviceRead {
    /// Reading if the device was read successfully
    pub fn reading(&self) -> Option<&Reading> {
        self.result.as_ref().ok()
    }
}

/// Decode a temperature or humidity payload
pub fn decode_scaled(field: &'static str, payload: &[u8]) -> Result<f64, LinkError> {
    let bytes: [u8; 4] = payload.try_into().map_err(|_| LinkError::Payload {
        field,
        expected: 4,
        actual: payload.len(),
    })?;
    Ok(f64::from(i32::from_le_bytes(bytes)) / 100.0)
}

/// Decode a battery payload into (millivolts, °C)
pub fn decode_battery(payload: &[u8]) -> Result<(i16, i16), LinkError> {
    let expected = Characteristic::Battery.payload_len();
    if payload.len() != expected {
        return Err(LinkError::Payload {
            field: "battery",
            expected,
            actual: payload.len(),
        });
    }
    let mv = i16::from_le_bytes([payload[0], payload[1]]);
    let temp = i16::from_le_bytes([payload[2], payload[3]]);
    Ok((mv, temp))
}

/// Reads and decodes sensor telemetry
#[derive(Debug, Clone)]
pub struct TelemetryReader {
    config: ReaderConfig,
    curve: BatteryCurve,
    memory: BatteryMemory,
}

impl TelemetryReader {
    /// Create a reader with the default battery curve
    pub fn new(config: ReaderConfig) -> Self {
        Self::with_curve(config, BatteryCurve::default())
    }

    /// Create a reader with a custom battery curve
    pub fn with_curve(config: ReaderConfig, curve: BatteryCurve) -> Self {
        let memory = BatteryMemory::new(config.battery_hysteresis);
        Self {
            config,
            curve,
            memory,
        }
    }

    /// Battery report memory
    pub fn battery_memory(&self) -> &BatteryMemory {
        &self.memory
    }

    /// Trigger a measurement on one device and read it back
    pub async fn read<L: RadioLink>(
        &mut self,
        link: &L,
        entry: &ConnectionEntry<L::Handle>,
    ) -> Result<Reading, LinkError> {
        link.write_char(&entry.handle, Characteristic::Temperature, &TRIGGER_PAYLOAD)
            .await?;
        sleep(self.config.settle_delay()).await;

        let temp_raw = link
            .read_char(&entry.handle, Characteristic::Temperature)
            .await?;
        let humid_raw = link
            .read_char(&entry.handle, Characteristic::Humidity)
            .await?;
        let batt_raw = link
            .read_char(&entry.handle, Characteristic::Battery)
            .await?;

        let temperature = decode_scaled("temperature", &temp_raw)?;
        let humidity = if humid_raw.is_empty() {
            None
        } else {
            Some(decode_scaled("humidity", &humid_raw)?)
        };
        let (battery_mv, battery_temp) = decode_battery(&batt_raw)?;

        let address = entry.address();
        let percent = self
            .curve
            .percent(i32::from(battery_mv), f64::from(battery_temp));
        let battery_percent = self
            .memory
            .should_report(address, percent)
            .then_some(percent);

        debug!(
            address,
            temperature,
            battery_mv,
            battery_percent = percent,
            "Read sensor"
        );

        Ok(Reading {
            address: address.to_string(),
            name: entry.descriptor.name.clone(),
            temperature,
            humidity,
            battery_mv,
            battery_temp,
            battery_percent,
        })
    }

    /// Read every connected device, in configured order
    pub async fn read_all<L: RadioLink, T: LinkTool>(
        &mut self,
        connections: &ConnectionManager<L, T>,
        descriptors: &[SensorDescriptor],
    ) -> Vec<DeviceRead> {
        let mut reads = Vec::with_capacity(connections.count());
        for entry in connections.in_order(descriptors) {
            let result = self.read(connections.link(), entry).await;
            if let Err(e) = &result {
                error!(address = %entry.address(), name = %entry.descriptor.name, error = %e, "Read failed");
            }
            reads.push(DeviceRead {
                address: entry.address().to_string(),
                result,
            });
        }
        reads
    }
}

impl Default for TelemetryReader {
    fn default() -> Self {
        Self::new(ReaderConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionConfig;
    use crate::radio::{MemoryDevice, MemoryLink};
    use crate::tool::MemoryTool;
    use approx::assert_relative_eq;

    #[test]
    fn test_decode_scaled() {
        assert_relative_eq!(
            decode_scaled("temperature", &2345i32.to_le_bytes()).unwrap(),
            23.45
        );
        assert_relative_eq!(
            decode_scaled("temperature", &(-1850i32).to_le_bytes()).unwrap(),
            -18.5
        );
        assert!(matches!(
            decode_scaled("humidity", &[0x01, 0x02]),
            Err(LinkError::Payload { actual: 2, .. })
        ));
    }

    #[test]
    fn test_decode_battery() {
        let mut payload = 2950i16.to_le_bytes().to_vec();
        payload.extend_from_slice(&(-12i16).to_le_bytes());
        assert_eq!(decode_battery(&payload).unwrap(), (2950, -12));
        assert!(decode_battery(&payload[..3]).is_err());
    }

    async fn connected(
        devices: &[(&str, MemoryDevice)],
    ) -> (ConnectionManager<MemoryLink, MemoryTool>, Vec<SensorDescriptor>) {
        let link = MemoryLink::new();
        let descriptors: Vec<_> = devices
            .iter()
            .map(|(a, d)| {
                link.add_device(*a, d.clone());
                SensorDescriptor::new(*a, format!("sensor {}", a))
            })
            .collect();
        let mut manager =
            ConnectionManager::new(link, MemoryTool::new(), ConnectionConfig::default());
        manager.ensure_all(&descriptors).await;
        (manager, descriptors)
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_triggers_and_decodes() {
        let (manager, descriptors) =
            connected(&[("AA", MemoryDevice::with_temperature(-18.25))]).await;
        let mut reader = TelemetryReader::default();

        let reads = reader.read_all(&manager, &descriptors).await;
        assert_eq!(reads.len(), 1);
        let reading = reads[0].reading().unwrap();
        assert_relative_eq!(reading.temperature, -18.25);
        assert_relative_eq!(reading.humidity.unwrap(), 55.0);
        assert_eq!(reading.battery_mv, 2950);
        // 30 mV short of the 20 °C full-charge band
        assert_eq!(reading.battery_percent, Some(95));
        assert_eq!(manager.link().triggers("AA"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_battery_percent_only_when_changed() {
        let (manager, descriptors) = connected(&[("AA", MemoryDevice::default())]).await;
        let mut reader = TelemetryReader::default();

        let first = reader.read_all(&manager, &descriptors).await;
        assert!(first[0].reading().unwrap().battery_percent.is_some());
        let second = reader.read_all(&manager, &descriptors).await;
        assert!(second[0].reading().unwrap().battery_percent.is_none());

        manager.link().update("AA", |d| d.battery_mv = 2500);
        let third = reader.read_all(&manager, &descriptors).await;
        assert!(third[0].reading().unwrap().battery_percent.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_device_does_not_affect_others() {
        let (manager, descriptors) = connected(&[
            ("AA", MemoryDevice::with_temperature(5.0)),
            (
                "BB",
                MemoryDevice {
                    fail_reads: true,
                    ..Default::default()
                },
            ),
            ("CC", MemoryDevice::with_temperature(6.0)),
        ])
        .await;
        let mut reader = TelemetryReader::default();

        let reads = reader.read_all(&manager, &descriptors).await;
        let addresses: Vec<_> = reads.iter().map(|r| r.address.as_str()).collect();
        assert_eq!(addresses, vec!["AA", "BB", "CC"]);
        assert!(reads[0].result.is_ok());
        assert!(matches!(reads[1].result, Err(LinkError::Write { .. })));
        assert!(reads[2].result.is_ok());
    }
}
