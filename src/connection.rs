// Coldwatch - Cold-chain sensor gateway
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Connection lifecycle management
//!
//! [`ConnectionManager`] owns the set of open links, at most one per address.
//! Connects are retried with a fixed delay and a per-attempt timeout; a
//! device that exhausts its attempts is simply absent for the cycle.
//! Disconnects fan out concurrently, each bounded by its own timeout and
//! falling back to the OS link tool, and the set is cleared once every
//! outcome is in.
//!
//! Link drops reported by the radio arrive on a bounded channel and are
//! applied by the owner at cycle boundaries, so the set is never mutated
//! while something iterates it.

use std::collections::HashMap;

use futures::future::join_all;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, error, info, warn};

use crate::config::{ConnectionConfig, SensorDescriptor};
use crate::error::LinkError;
use crate::radio::{DropNotifier, LinkDropped, RadioLink};
use crate::tool::LinkTool;

/// One open link
#[derive(Debug)]
pub struct ConnectionEntry<H> {
    /// Device this link belongs to
    pub descriptor: SensorDescriptor,
    /// Radio link handle
    pub handle: H,
    /// Last known link state
    pub connected: bool,
    /// Connect generation, matched against drop notifications
    generation: u64,
}

impl<H> ConnectionEntry<H> {
    /// Device address
    pub fn address(&self) -> &str {
        &self.descriptor.address
    }

    /// Connect generation
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// Result of a disconnect for one entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectOutcome {
    /// Link-level disconnect confirmed
    Disconnected,
    /// Link was already down
    NotConnected,
    /// Link-level disconnect failed, OS tool succeeded
    Fallback {
        /// Why the link-level disconnect failed
        reason: String,
    },
    /// Both paths failed
    Failed {
        /// Why the fallback failed
        reason: String,
    },
}

impl DisconnectOutcome {
    /// Whether the device is known to be disconnected
    pub fn is_confirmed(&self) -> bool {
        !matches!(self, Self::Failed { .. })
    }
}

/// Summary of one [`ConnectionManager::ensure_all`] pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnsureSummary {
    /// Links that were already up
    pub already_connected: usize,
    /// Links opened during this pass
    pub connected: usize,
    /// Addresses that could not be connected
    pub failed: Vec<String>,
}

/// Owns the open links
pub struct ConnectionManager<L: RadioLink, T> {
    link: L,
    tool: T,
    config: ConnectionConfig,
    entries: HashMap<String, ConnectionEntry<L::Handle>>,
    next_generation: u64,
    drop_tx: mpsc::Sender<LinkDropped>,
    drop_rx: mpsc::Receiver<LinkDropped>,
}

impl<L: RadioLink, T: LinkTool> ConnectionManager<L, T> {
    /// Create a manager with no open links
    pub fn new(link: L, tool: T, config: ConnectionConfig) -> Self {
        let (drop_tx, drop_rx) = mpsc::channel(config.drop_queue_capacity.max(1));
        Self {
            link,
            tool,
            config,
            entries: HashMap::new(),
            next_generation: 0,
            drop_tx,
            drop_rx,
        }
    }

    /// Radio link
    pub fn link(&self) -> &L {
        &self.link
    }

    /// OS link tool
    pub fn tool(&self) -> &T {
        &self.tool
    }

    /// Connection tunables
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Open a link to every descriptor that does not have one
    ///
    /// Pending drop notifications are applied first. Entries whose link
    /// reports down are logged, removed and reconnected.
    pub async fn ensure_all(&mut self, descriptors: &[SensorDescriptor]) -> EnsureSummary {
        self.drain_dropped();
        let mut summary = EnsureSummary::default();

        for descriptor in descriptors {
            if let Some(entry) = self.entries.get_mut(&descriptor.address) {
                if self.link.is_connected(&entry.handle).await {
                    entry.connected = true;
                    summary.already_connected += 1;
                    continue;
                }
                warn!(
                    address = %descriptor.address,
                    name = %descriptor.name,
                    "Listed as connected but link is down, reconnecting"
                );
                self.entries.remove(&descriptor.address);
            }

            if self.connect_one(descriptor).await {
                summary.connected += 1;
            } else {
                summary.failed.push(descriptor.address.clone());
            }
        }

        summary
    }

    /// Connect one device, retrying up to `max_retries` times
    ///
    /// Returns false once every attempt failed; the device is then inactive
    /// for this cycle. Never returns an error.
    pub async fn connect_one(&mut self, descriptor: &SensorDescriptor) -> bool {
        self.next_generation += 1;
        let generation = self.next_generation;
        let notifier = DropNotifier::new(&descriptor.address, generation, self.drop_tx.clone());

        match self.open_link(descriptor, notifier).await {
            Some(handle) => {
                self.entries.insert(
                    descriptor.address.clone(),
                    ConnectionEntry {
                        descriptor: descriptor.clone(),
                        handle,
                        connected: true,
                        generation,
                    },
                );
                true
            }
            None => false,
        }
    }

    async fn open_link(
        &self,
        descriptor: &SensorDescriptor,
        notifier: DropNotifier,
    ) -> Option<L::Handle> {
        let max_retries = self.config.max_retries;
        let connect_timeout = self.config.connect_timeout();

        for attempt in 1..=max_retries {
            debug!(
                address = %descriptor.address,
                name = %descriptor.name,
                attempt,
                max_retries,
                "Connecting"
            );
            let started = Instant::now();
            let result = timeout(
                connect_timeout,
                self.link.connect(&descriptor.address, notifier.clone()),
            )
            .await
            .unwrap_or_else(|_| {
                Err(LinkError::Timeout {
                    operation: "connect",
                    timeout_ms: connect_timeout.as_millis() as u64,
                })
            });

            match result {
                Ok(handle) => {
                    if self.link.is_connected(&handle).await {
                        info!(
                            address = %descriptor.address,
                            name = %descriptor.name,
                            elapsed_ms = started.elapsed().as_millis() as u64,
                            "Connected"
                        );
                        return Some(handle);
                    }
                    warn!(
                        address = %descriptor.address,
                        attempt,
                        "Connect returned but link is down"
                    );
                }
                Err(e) => warn!(
                    address = %descriptor.address,
                    attempt,
                    error = %e,
                    "Connect attempt failed"
                ),
            }

            if attempt < max_retries {
                sleep(self.config.retry_delay()).await;
            }
        }

        error!(
            address = %descriptor.address,
            name = %descriptor.name,
            max_retries,
            "All connect attempts failed"
        );
        None
    }

    /// Disconnect every entry concurrently and clear the set
    ///
    /// Each entry gets its own timeout and fallback; one failure never
    /// blocks or fails the others. The set is cleared whatever the outcomes.
    pub async fn disconnect_all(&mut self) -> Vec<(String, DisconnectOutcome)> {
        let this = &*self;
        let outcomes = join_all(this.entries.values().map(|entry| async move {
            (entry.address().to_string(), this.disconnect_one(entry).await)
        }))
        .await;

        self.entries.clear();

        let failed = outcomes.iter().filter(|(_, o)| !o.is_confirmed()).count();
        info!(total = outcomes.len(), failed, "Disconnected all devices");
        outcomes
    }

    /// Disconnect one entry
    ///
    /// Link-level disconnect is bounded by `disconnect_timeout`; on timeout
    /// or error the OS tool is tried by raw address. A link-level error here
    /// is routine: the transport often closes before confirming.
    pub async fn disconnect_one(&self, entry: &ConnectionEntry<L::Handle>) -> DisconnectOutcome {
        let address = entry.address();
        if !self.link.is_connected(&entry.handle).await {
            debug!(address, "Already disconnected");
            return DisconnectOutcome::NotConnected;
        }

        let bound = self.config.disconnect_timeout();
        let reason = match timeout(bound, self.link.disconnect(&entry.handle)).await {
            Ok(Ok(())) => {
                info!(address, name = %entry.descriptor.name, "Disconnected");
                return DisconnectOutcome::Disconnected;
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => LinkError::Timeout {
                operation: "disconnect",
                timeout_ms: bound.as_millis() as u64,
            }
            .to_string(),
        };

        warn!(address, reason = %reason, "Link disconnect failed, trying OS tool");
        match self.tool.disconnect(address).await {
            Ok(()) => {
                info!(address, "OS tool disconnected device");
                DisconnectOutcome::Fallback { reason }
            }
            Err(e) => {
                error!(address, error = %e, "OS tool disconnect failed");
                DisconnectOutcome::Failed {
                    reason: e.to_string(),
                }
            }
        }
    }

    /// Remove the entry for a dropped link
    ///
    /// Ignored when the entry was already replaced by a newer connect.
    pub fn on_link_dropped(&mut self, dropped: &LinkDropped) -> bool {
        match self.entries.get(&dropped.address) {
            Some(entry) if entry.generation == dropped.generation => {
                info!(
                    address = %dropped.address,
                    name = %entry.descriptor.name,
                    "Link dropped"
                );
                self.entries.remove(&dropped.address);
                true
            }
            Some(_) => {
                debug!(address = %dropped.address, "Stale drop notification ignored");
                false
            }
            None => false,
        }
    }

    /// Apply every pending drop notification
    pub fn drain_dropped(&mut self) -> usize {
        let mut removed = 0;
        while let Ok(dropped) = self.drop_rx.try_recv() {
            if self.on_link_dropped(&dropped) {
                removed += 1;
            }
        }
        removed
    }

    /// Disconnect links left over from a previous run
    ///
    /// Uses only the OS tool; failures are logged. Returns how many links
    /// were cleared.
    pub async fn purge_stale_links(&self) -> usize {
        if let Err(e) = self.tool.power_on().await {
            warn!(error = %e, "Could not power on adapter");
        }

        let addresses = match self.tool.connected_addresses().await {
            Ok(addresses) => addresses,
            Err(e) => {
                warn!(error = %e, "Could not list existing links");
                return 0;
            }
        };
        if addresses.is_empty() {
            info!("No stale links");
            return 0;
        }

        info!(count = addresses.len(), "Clearing stale links");
        let mut cleared = 0;
        for (i, address) in addresses.iter().enumerate() {
            if i > 0 {
                sleep(self.config.purge_pause()).await;
            }
            match self.tool.disconnect(address).await {
                Ok(()) => cleared += 1,
                Err(e) => warn!(address = %address, error = %e, "Stale link not cleared"),
            }
        }
        cleared
    }

    /// Entry for an address
    pub fn get(&self, address: &str) -> Option<&ConnectionEntry<L::Handle>> {
        self.entries.get(address)
    }

    /// Whether an entry exists for an address
    pub fn contains(&self, address: &str) -> bool {
        self.entries.contains_key(address)
    }

    /// Entries in the order of `descriptors`
    pub fn in_order<'a>(
        &'a self,
        descriptors: &'a [SensorDescriptor],
    ) -> impl Iterator<Item = &'a ConnectionEntry<L::Handle>> + 'a {
        descriptors
            .iter()
            .filter_map(move |d| self.entries.get(&d.address))
    }

    /// Addresses currently held, in the order of `descriptors`
    pub fn connected_addresses(&self, descriptors: &[SensorDescriptor]) -> Vec<String> {
        self.in_order(descriptors)
            .map(|e| e.address().to_string())
            .collect()
    }

    /// Number of open links
    pub fn count(&self) -> usize {
        self.entries.len()
    }

    /// Whether there are no open links
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::radio::{DisconnectBehavior, MemoryDevice, MemoryLink};
    use crate::tool::MemoryTool;
    use std::time::Duration;

    fn devices(addresses: &[&str]) -> Vec<SensorDescriptor> {
        addresses
            .iter()
            .map(|a| SensorDescriptor::new(*a, format!("sensor {}", a)))
            .collect()
    }

    fn manager(link: MemoryLink) -> ConnectionManager<MemoryLink, MemoryTool> {
        ConnectionManager::new(link, MemoryTool::new(), ConnectionConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_ensure_all_connects_each_device_once() {
        let link = MemoryLink::new();
        link.add_device("AA", MemoryDevice::default());
        link.add_device("BB", MemoryDevice::default());
        let mut manager = manager(link);
        let devices = devices(&["AA", "BB"]);

        let summary = manager.ensure_all(&devices).await;
        assert_eq!(summary.connected, 2);
        assert!(summary.failed.is_empty());

        let summary = manager.ensure_all(&devices).await;
        assert_eq!(summary.already_connected, 2);
        assert_eq!(manager.link().connect_attempts("AA"), 1);
        assert_eq!(manager.count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_one_retries_then_succeeds() {
        let link = MemoryLink::new();
        link.add_device(
            "AA",
            MemoryDevice {
                connect_failures: 2,
                ..Default::default()
            },
        );
        let mut manager = manager(link);

        let start = Instant::now();
        assert!(manager.connect_one(&devices(&["AA"])[0]).await);
        assert_eq!(start.elapsed(), Duration::from_secs(4));
        assert_eq!(manager.link().connect_attempts("AA"), 3);
        assert!(manager.contains("AA"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_one_gives_up_without_error() {
        let link = MemoryLink::new();
        link.add_device("AA", MemoryDevice::unreachable());
        let mut manager = manager(link);

        let start = Instant::now();
        assert!(!manager.connect_one(&devices(&["AA"])[0]).await);
        // Three attempts, two pauses between them
        assert_eq!(start.elapsed(), Duration::from_secs(4));
        assert_eq!(manager.link().connect_attempts("AA"), 3);
        assert!(manager.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_attempt_bounded_by_timeout() {
        let link = MemoryLink::new();
        link.add_device(
            "AA",
            MemoryDevice {
                connect_hangs: true,
                ..Default::default()
            },
        );
        let mut manager = manager(link);

        let start = Instant::now();
        assert!(!manager.connect_one(&devices(&["AA"])[0]).await);
        // Three timed-out attempts of 10 s, two pauses of 2 s
        assert_eq!(start.elapsed(), Duration::from_secs(34));
        assert_eq!(manager.link().connect_attempts("AA"), 3);
        assert!(!manager.contains("AA"));

        // The device recovers and the next attempt goes through
        manager.link().update("AA", |d| d.connect_hangs = false);
        assert!(manager.connect_one(&devices(&["AA"])[0]).await);
        assert_eq!(manager.link().connect_attempts("AA"), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_device_reported_failed() {
        let mut manager = manager(MemoryLink::new());
        let summary = manager.ensure_all(&devices(&["ZZ"])).await;
        assert_eq!(summary.failed, vec!["ZZ".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_link_removed_and_reconnected() {
        let link = MemoryLink::new();
        link.add_device("AA", MemoryDevice::default());
        let mut manager = manager(link);
        let devices = devices(&["AA"]);

        manager.ensure_all(&devices).await;
        manager.link().drop_link("AA");
        assert_eq!(manager.drain_dropped(), 1);
        assert!(!manager.contains("AA"));

        let summary = manager.ensure_all(&devices).await;
        assert_eq!(summary.connected, 1);
        assert_eq!(manager.link().connect_attempts("AA"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_drop_notification_ignored() {
        let link = MemoryLink::new();
        link.add_device("AA", MemoryDevice::default());
        let mut manager = manager(link);
        let devices = devices(&["AA"]);
        manager.ensure_all(&devices).await;

        let stale = LinkDropped {
            address: "AA".to_string(),
            generation: manager.get("AA").unwrap().generation() - 1,
        };
        assert!(!manager.on_link_dropped(&stale));
        assert!(manager.contains("AA"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_all_isolates_failures() {
        let link = MemoryLink::new();
        link.add_device("AA", MemoryDevice::default());
        link.add_device(
            "BB",
            MemoryDevice {
                disconnect: DisconnectBehavior::Fail,
                ..Default::default()
            },
        );
        link.add_device("CC", MemoryDevice::default());
        let mut manager = ConnectionManager::new(
            link,
            MemoryTool::failing(),
            ConnectionConfig::default(),
        );
        manager.ensure_all(&devices(&["AA", "BB", "CC"])).await;

        let outcomes: HashMap<_, _> = manager.disconnect_all().await.into_iter().collect();
        assert!(manager.is_empty());
        assert_eq!(outcomes.len(), 3);
        assert_eq!(outcomes["AA"], DisconnectOutcome::Disconnected);
        assert_eq!(outcomes["CC"], DisconnectOutcome::Disconnected);
        assert!(!outcomes["BB"].is_confirmed());
        assert_eq!(manager.tool().disconnected(), vec!["BB"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_timeout_falls_back() {
        let link = MemoryLink::new();
        link.add_device(
            "AA",
            MemoryDevice {
                disconnect: DisconnectBehavior::Hang,
                ..Default::default()
            },
        );
        let mut manager = manager(link);
        manager.ensure_all(&devices(&["AA"])).await;

        let start = Instant::now();
        let outcomes = manager.disconnect_all().await;
        assert_eq!(start.elapsed(), Duration::from_secs(5));
        assert!(matches!(outcomes[0].1, DisconnectOutcome::Fallback { .. }));
        assert_eq!(manager.tool().disconnected(), vec!["AA"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_one_already_down() {
        let link = MemoryLink::new();
        link.add_device("AA", MemoryDevice::default());
        let mut manager = manager(link);
        manager.ensure_all(&devices(&["AA"])).await;
        manager.link().drop_link("AA");

        let entry = manager.get("AA").unwrap();
        assert_eq!(
            manager.disconnect_one(entry).await,
            DisconnectOutcome::NotConnected
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_stale_links() {
        let manager = ConnectionManager::new(
            MemoryLink::new(),
            MemoryTool::with_connected(&["C4:7C:8D:6A:1B:02", "C4:7C:8D:6A:1B:03"]),
            ConnectionConfig::default(),
        );
        assert_eq!(manager.purge_stale_links().await, 2);
        assert_eq!(
            manager.tool().disconnected(),
            vec!["C4:7C:8D:6A:1B:02", "C4:7C:8D:6A:1B:03"]
        );
    }
}
