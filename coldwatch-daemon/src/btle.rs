// Coldwatch Daemon - btleplug radio backend
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! [`RadioLink`] over btleplug (BlueZ on Linux).

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use btleplug::api::{
    Central, CentralEvent, Characteristic as GattCharacteristic, Manager as _, Peripheral as _,
    ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use coldwatch::{Characteristic, DropNotifier, LinkError, RadioLink};
use futures::StreamExt;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// How long to look for an address before giving up on a connect
pub const DEFAULT_SCAN_TIMEOUT: Duration = Duration::from_secs(8);

const SCAN_POLL: Duration = Duration::from_millis(500);

type Notifiers = Arc<Mutex<HashMap<PeripheralId, DropNotifier>>>;

/// Link to one peripheral
#[derive(Debug, Clone)]
pub struct BtleHandle {
    address: String,
    peripheral: Peripheral,
}

/// btleplug-backed [`RadioLink`]
pub struct BtleLink {
    adapter: Adapter,
    notifiers: Notifiers,
    events: JoinHandle<()>,
    scan_timeout: Duration,
}

fn adapter_error(address: &str, e: btleplug::Error) -> LinkError {
    LinkError::Connect {
        address: address.to_string(),
        reason: e.to_string(),
    }
}

impl BtleLink {
    /// Open the first adapter and start scanning
    pub async fn new(scan_timeout: Duration) -> Result<Self, LinkError> {
        let manager = Manager::new().await.map_err(|e| adapter_error("adapter", e))?;
        let adapter = manager
            .adapters()
            .await
            .map_err(|e| adapter_error("adapter", e))?
            .into_iter()
            .next()
            .ok_or_else(|| LinkError::Connect {
                address: "adapter".to_string(),
                reason: "no Bluetooth adapter found".to_string(),
            })?;

        let mut stream = adapter
            .events()
            .await
            .map_err(|e| adapter_error("adapter", e))?;
        let notifiers: Notifiers = Arc::default();
        let shared = Arc::clone(&notifiers);
        let events = tokio::spawn(async move {
            while let Some(event) = stream.next().await {
                if let CentralEvent::DeviceDisconnected(id) = event {
                    let notifier = shared.lock().ok().and_then(|mut n| n.remove(&id));
                    if let Some(notifier) = notifier {
                        debug!(address = notifier.address(), "Peripheral disconnected");
                        notifier.notify();
                    }
                }
            }
        });

        adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(|e| adapter_error("adapter", e))?;
        info!("Bluetooth scan started");

        Ok(Self {
            adapter,
            notifiers,
            events,
            scan_timeout,
        })
    }

    async fn find(&self, address: &str) -> Result<Peripheral, LinkError> {
        let deadline = Instant::now() + self.scan_timeout;
        loop {
            let peripherals = self
                .adapter
                .peripherals()
                .await
                .map_err(|e| adapter_error(address, e))?;
            for peripheral in peripherals {
                if let Ok(Some(props)) = peripheral.properties().await {
                    if props.address.to_string().eq_ignore_ascii_case(address) {
                        return Ok(peripheral);
                    }
                }
            }
            if Instant::now() >= deadline {
                return Err(LinkError::Connect {
                    address: address.to_string(),
                    reason: "not seen in scan".to_string(),
                });
            }
            sleep(SCAN_POLL).await;
        }
    }

    fn gatt(
        handle: &BtleHandle,
        characteristic: Characteristic,
    ) -> Result<GattCharacteristic, LinkError> {
        let missing = |reason: String| LinkError::Read {
            characteristic: characteristic.to_string(),
            reason,
        };
        let uuid = Uuid::parse_str(characteristic.uuid()).map_err(|e| missing(e.to_string()))?;
        handle
            .peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == uuid)
            .ok_or_else(|| missing(format!("not offered by {}", handle.address)))
    }
}

/// Run `release` when `result` failed, so a half-open link is not left behind
async fn release_on_err<T, E, F>(
    address: &str,
    result: Result<T, E>,
    release: F,
) -> Result<T, E>
where
    E: std::fmt::Display,
    F: Future<Output = Result<(), E>>,
{
    if result.is_err() {
        if let Err(e) = release.await {
            warn!(address, error = %e, "Release after failed setup failed");
        }
    }
    result
}

impl Drop for BtleLink {
    fn drop(&mut self) {
        self.events.abort();
    }
}

impl RadioLink for BtleLink {
    type Handle = BtleHandle;

    async fn connect(
        &self,
        address: &str,
        on_drop: DropNotifier,
    ) -> Result<BtleHandle, LinkError> {
        let peripheral = self.find(address).await?;
        peripheral
            .connect()
            .await
            .map_err(|e| adapter_error(address, e))?;
        release_on_err(
            address,
            peripheral.discover_services().await,
            peripheral.disconnect(),
        )
        .await
        .map_err(|e| adapter_error(address, e))?;

        if let Ok(mut notifiers) = self.notifiers.lock() {
            notifiers.insert(peripheral.id(), on_drop);
        }
        Ok(BtleHandle {
            address: address.to_string(),
            peripheral,
        })
    }

    async fn is_connected(&self, handle: &BtleHandle) -> bool {
        handle.peripheral.is_connected().await.unwrap_or(false)
    }

    async fn disconnect(&self, handle: &BtleHandle) -> Result<(), LinkError> {
        if let Ok(mut notifiers) = self.notifiers.lock() {
            notifiers.remove(&handle.peripheral.id());
        }
        handle
            .peripheral
            .disconnect()
            .await
            .map_err(|e| LinkError::Disconnect {
                address: handle.address.clone(),
                reason: e.to_string(),
            })
    }

    async fn write_char(
        &self,
        handle: &BtleHandle,
        characteristic: Characteristic,
        payload: &[u8],
    ) -> Result<(), LinkError> {
        let gatt = Self::gatt(handle, characteristic)?;
        handle
            .peripheral
            .write(&gatt, payload, WriteType::WithResponse)
            .await
            .map_err(|e| {
                warn!(address = %handle.address, error = %e, "GATT write failed");
                LinkError::Write {
                    characteristic: characteristic.to_string(),
                    reason: e.to_string(),
                }
            })
    }

    async fn read_char(
        &self,
        handle: &BtleHandle,
        characteristic: Characteristic,
    ) -> Result<Vec<u8>, LinkError> {
        let gatt = Self::gatt(handle, characteristic)?;
        handle
            .peripheral
            .read(&gatt)
            .await
            .map_err(|e| LinkError::Read {
                characteristic: characteristic.to_string(),
                reason: e.to_string(),
            })
    }
}
