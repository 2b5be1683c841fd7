// Coldwatch - Cold-chain sensor gateway
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Scripted in-memory radio link
//!
//! Each device is described by a [`MemoryDevice`]: the values it reports and
//! the failures it injects. Counters record what the gateway asked of it.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use super::{Characteristic, DropNotifier, RadioLink};
use crate::error::LinkError;

/// How a device answers a link-level disconnect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DisconnectBehavior {
    /// Disconnect succeeds
    #[default]
    Clean,
    /// Disconnect returns an error
    Fail,
    /// Disconnect never completes
    Hang,
}

/// Script for one simulated device
#[derive(Debug, Clone)]
pub struct MemoryDevice {
    /// Temperature (°C)
    pub temperature: f64,
    /// Relative humidity (%)
    pub humidity: f64,
    /// Battery voltage (mV)
    pub battery_mv: i16,
    /// Battery temperature (°C)
    pub battery_temp: i16,
    /// Whether connects can succeed at all
    pub reachable: bool,
    /// Number of upcoming connect attempts that fail before one succeeds
    pub connect_failures: u32,
    /// Whether connect attempts never complete
    pub connect_hangs: bool,
    /// Whether characteristic reads fail
    pub fail_reads: bool,
    /// Disconnect behavior
    pub disconnect: DisconnectBehavior,
}

impl Default for MemoryDevice {
    fn default() -> Self {
        Self {
            temperature: 4.0,
            humidity: 55.0,
            battery_mv: 2950,
            battery_temp: 20,
            reachable: true,
            connect_failures: 0,
            connect_hangs: false,
            fail_reads: false,
            disconnect: DisconnectBehavior::Clean,
        }
    }
}

impl MemoryDevice {
    /// Device reporting the given temperature
    pub fn with_temperature(temperature: f64) -> Self {
        Self {
            temperature,
            ..Default::default()
        }
    }

    /// Device that never accepts a connection
    pub fn unreachable() -> Self {
        Self {
            reachable: false,
            ..Default::default()
        }
    }
}

/// Handle for a simulated link
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryHandle {
    /// Device address
    pub address: String,
    /// Connection generation, bumped on every successful connect
    pub session: u64,
}

#[derive(Debug, Default)]
struct DeviceSlot {
    script: MemoryDevice,
    session: u64,
    connected: bool,
    notifier: Option<DropNotifier>,
    connect_attempts: u32,
    disconnect_calls: u32,
    triggers: u32,
}

/// In-memory [`RadioLink`]
#[derive(Debug, Default)]
pub struct MemoryLink {
    devices: Mutex<HashMap<String, DeviceSlot>>,
}

impl MemoryLink {
    /// Create an empty link with no devices in range
    pub fn new() -> Self {
        Self::default()
    }

    fn devices(&self) -> MutexGuard<'_, HashMap<String, DeviceSlot>> {
        // A poisoned lock only means a test panicked mid-update
        self.devices.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Add or replace a device script
    pub fn add_device(&self, address: impl Into<String>, script: MemoryDevice) {
        let mut devices = self.devices();
        let slot = devices.entry(address.into()).or_default();
        slot.script = script;
    }

    /// Update a device script in place
    pub fn update(&self, address: &str, f: impl FnOnce(&mut MemoryDevice)) {
        if let Some(slot) = self.devices().get_mut(address) {
            f(&mut slot.script);
        }
    }

    /// Set the reported temperature
    pub fn set_temperature(&self, address: &str, temperature: f64) {
        self.update(address, |d| d.temperature = temperature);
    }

    /// Simulate the device dropping its link
    ///
    /// Fires the drop notifier registered at connect time.
    pub fn drop_link(&self, address: &str) {
        let notifier = {
            let mut devices = self.devices();
            match devices.get_mut(address) {
                Some(slot) if slot.connected => {
                    slot.connected = false;
                    slot.notifier.take()
                }
                _ => None,
            }
        };
        if let Some(notifier) = notifier {
            notifier.notify();
        }
    }

    /// Whether the device currently holds an open link
    pub fn is_linked(&self, address: &str) -> bool {
        self.devices().get(address).is_some_and(|s| s.connected)
    }

    /// Total connect attempts seen for a device
    pub fn connect_attempts(&self, address: &str) -> u32 {
        self.devices()
            .get(address)
            .map_or(0, |s| s.connect_attempts)
    }

    /// Total link-level disconnect calls seen for a device
    pub fn disconnect_calls(&self, address: &str) -> u32 {
        self.devices()
            .get(address)
            .map_or(0, |s| s.disconnect_calls)
    }

    /// Total measurement triggers written to a device
    pub fn triggers(&self, address: &str) -> u32 {
        self.devices().get(address).map_or(0, |s| s.triggers)
    }

    fn live_slot<'a>(
        devices: &'a mut HashMap<String, DeviceSlot>,
        handle: &MemoryHandle,
    ) -> Result<&'a mut DeviceSlot, LinkError> {
        match devices.get_mut(&handle.address) {
            Some(slot) if slot.connected && slot.session == handle.session => Ok(slot),
            _ => Err(LinkError::NotConnected(handle.address.clone())),
        }
    }
}

impl RadioLink for MemoryLink {
    type Handle = MemoryHandle;

    async fn connect(
        &self,
        address: &str,
        on_drop: DropNotifier,
    ) -> Result<MemoryHandle, LinkError> {
        let hangs = {
            let mut devices = self.devices();
            let Some(slot) = devices.get_mut(address) else {
                return Err(LinkError::Connect {
                    address: address.to_string(),
                    reason: "device not found".to_string(),
                });
            };
            slot.connect_attempts += 1;
            slot.script.connect_hangs
        };
        if hangs {
            return std::future::pending().await;
        }

        let mut devices = self.devices();
        let Some(slot) = devices.get_mut(address) else {
            return Err(LinkError::NotConnected(address.to_string()));
        };

        if !slot.script.reachable {
            return Err(LinkError::Connect {
                address: address.to_string(),
                reason: "device unreachable".to_string(),
            });
        }
        if slot.script.connect_failures > 0 {
            slot.script.connect_failures -= 1;
            return Err(LinkError::Connect {
                address: address.to_string(),
                reason: "connection aborted".to_string(),
            });
        }

        slot.session += 1;
        slot.connected = true;
        slot.notifier = Some(on_drop);
        Ok(MemoryHandle {
            address: address.to_string(),
            session: slot.session,
        })
    }

    async fn is_connected(&self, handle: &MemoryHandle) -> bool {
        self.devices()
            .get(&handle.address)
            .is_some_and(|s| s.connected && s.session == handle.session)
    }

    async fn disconnect(&self, handle: &MemoryHandle) -> Result<(), LinkError> {
        let behavior = {
            let mut devices = self.devices();
            let slot = Self::live_slot(&mut devices, handle)?;
            slot.disconnect_calls += 1;
            let behavior = slot.script.disconnect;
            if behavior == DisconnectBehavior::Clean {
                slot.connected = false;
                slot.notifier = None;
            }
            behavior
        };

        match behavior {
            DisconnectBehavior::Clean => Ok(()),
            DisconnectBehavior::Fail => Err(LinkError::Disconnect {
                address: handle.address.clone(),
                reason: "transport closed before confirmation".to_string(),
            }),
            DisconnectBehavior::Hang => std::future::pending().await,
        }
    }

    async fn write_char(
        &self,
        handle: &MemoryHandle,
        characteristic: Characteristic,
        payload: &[u8],
    ) -> Result<(), LinkError> {
        let mut devices = self.devices();
        let slot = Self::live_slot(&mut devices, handle)?;
        if slot.script.fail_reads {
            return Err(LinkError::Write {
                characteristic: characteristic.to_string(),
                reason: "write rejected".to_string(),
            });
        }
        if characteristic == Characteristic::Temperature && payload == super::TRIGGER_PAYLOAD {
            slot.triggers += 1;
        }
        Ok(())
    }

    async fn read_char(
        &self,
        handle: &MemoryHandle,
        characteristic: Characteristic,
    ) -> Result<Vec<u8>, LinkError> {
        let mut devices = self.devices();
        let slot = Self::live_slot(&mut devices, handle)?;
        let script = &slot.script;
        if script.fail_reads {
            return Err(LinkError::Read {
                characteristic: characteristic.to_string(),
                reason: "read timed out".to_string(),
            });
        }

        let payload = match characteristic {
            Characteristic::Temperature => {
                ((script.temperature * 100.0).round() as i32).to_le_bytes().to_vec()
            }
            Characteristic::Humidity => {
                ((script.humidity * 100.0).round() as i32).to_le_bytes().to_vec()
            }
            Characteristic::Battery => {
                let mut bytes = script.battery_mv.to_le_bytes().to_vec();
                bytes.extend_from_slice(&script.battery_temp.to_le_bytes());
                bytes
            }
        };
        Ok(payload)
    }
}
