// Coldwatch - Cold-chain sensor gateway
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Radio link abstraction
//!
//! The gateway never talks to a radio stack directly. It drives a
//! [`RadioLink`], which supplies the four GATT-style primitives (connect,
//! disconnect, read characteristic, write characteristic) and reports link
//! drops through a [`DropNotifier`] handed over at connect time.
//!
//! [`MemoryLink`] is a scripted in-memory implementation for tests and
//! simulation runs.

mod memory;

pub use memory::{DisconnectBehavior, MemoryDevice, MemoryHandle, MemoryLink};

use std::fmt;

use tokio::sync::mpsc;
use tracing::warn;

use crate::error::LinkError;

/// Payload that starts a measurement on the sensor
pub const TRIGGER_PAYLOAD: [u8; 4] = [0x01, 0x00, 0x00, 0x00];

/// GATT characteristics exposed by the sensors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Characteristic {
    /// Temperature, i32 LE, hundredths of °C. Also the measurement trigger.
    Temperature,
    /// Relative humidity, i32 LE, hundredths of %
    Humidity,
    /// Battery: i16 LE millivolts then i16 LE °C
    Battery,
}

impl Characteristic {
    /// Characteristic UUID
    pub fn uuid(&self) -> &'static str {
        match self {
            Self::Temperature => "EF090080-11D6-42BA-93B8-9DD7EC090AA9",
            Self::Humidity => "EF090081-11D6-42BA-93B8-9DD7EC090AA9",
            Self::Battery => "EF090007-11D6-42BA-93B8-9DD7EC090AA9",
        }
    }

    /// Expected payload length in bytes
    pub fn payload_len(&self) -> usize {
        4
    }
}

impl fmt::Display for Characteristic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Temperature => "temperature",
            Self::Humidity => "humidity",
            Self::Battery => "battery",
        };
        write!(f, "{} ({})", name, self.uuid())
    }
}

/// A link went down outside of an explicit disconnect
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkDropped {
    /// Device address
    pub address: String,
    /// Connect generation the notifier was issued for
    pub generation: u64,
}

/// Reports that a link went down outside of an explicit disconnect
///
/// The connection manager owns the receiving end and drains it at cycle
/// boundaries, so a link implementation can call [`DropNotifier::notify`]
/// from any task without touching the connection set. The generation lets
/// the manager ignore a late notification for a link it already replaced.
#[derive(Debug, Clone)]
pub struct DropNotifier {
    address: String,
    generation: u64,
    tx: mpsc::Sender<LinkDropped>,
}

impl DropNotifier {
    /// Create a notifier for one address and connect generation
    pub fn new(
        address: impl Into<String>,
        generation: u64,
        tx: mpsc::Sender<LinkDropped>,
    ) -> Self {
        Self {
            address: address.into(),
            generation,
            tx,
        }
    }

    /// Address this notifier reports for
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Connect generation this notifier reports for
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Signal that the link dropped
    pub fn notify(&self) {
        let event = LinkDropped {
            address: self.address.clone(),
            generation: self.generation,
        };
        if let Err(e) = self.tx.try_send(event) {
            warn!(address = %self.address, error = %e, "Dropped link notification lost");
        }
    }
}

/// Radio-link primitives
///
/// Implementations must not retry internally; retry and fallback policy
/// belongs to [`crate::ConnectionManager`].
#[allow(async_fn_in_trait)]
pub trait RadioLink {
    /// Open link to one device
    type Handle;

    /// Open a link to `address`
    async fn connect(
        &self,
        address: &str,
        on_drop: DropNotifier,
    ) -> Result<Self::Handle, LinkError>;

    /// Whether the link behind `handle` is still up
    async fn is_connected(&self, handle: &Self::Handle) -> bool;

    /// Close the link. May fail if the transport closed first.
    async fn disconnect(&self, handle: &Self::Handle) -> Result<(), LinkError>;

    /// Write a characteristic
    async fn write_char(
        &self,
        handle: &Self::Handle,
        characteristic: Characteristic,
        payload: &[u8],
    ) -> Result<(), LinkError>;

    /// Read a characteristic
    async fn read_char(
        &self,
        handle: &Self::Handle,
        characteristic: Characteristic,
    ) -> Result<Vec<u8>, LinkError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_characteristic_uuids_distinct() {
        let all = [
            Characteristic::Temperature,
            Characteristic::Humidity,
            Characteristic::Battery,
        ];
        for (i, a) in all.iter().enumerate() {
            for b in &all[i + 1..] {
                assert_ne!(a.uuid(), b.uuid());
            }
        }
    }

    #[test]
    fn test_characteristic_display() {
        let shown = Characteristic::Battery.to_string();
        assert!(shown.starts_with("battery"));
        assert!(shown.contains("EF090007"));
    }

    #[tokio::test]
    async fn test_drop_notifier_sends_address() {
        let (tx, mut rx) = mpsc::channel(4);
        let notifier = DropNotifier::new("AA", 3, tx);
        notifier.notify();
        assert_eq!(
            rx.recv().await,
            Some(LinkDropped {
                address: "AA".to_string(),
                generation: 3,
            })
        );
    }

    #[test]
    fn test_drop_notifier_full_channel_does_not_panic() {
        let (tx, _rx) = mpsc::channel(1);
        let notifier = DropNotifier::new("AA", 1, tx);
        notifier.notify();
        notifier.notify();
    }
}
