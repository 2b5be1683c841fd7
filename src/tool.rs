// Coldwatch - Cold-chain sensor gateway
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! OS-level link tooling
//!
//! When the radio link cannot confirm a disconnect, the gateway falls back to
//! the host's Bluetooth tools, addressed by raw MAC address. The same tools
//! list links left over from a previous run so they can be cleared at
//! startup.

use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::error::ToolError;

const BLUETOOTHCTL: &str = "bluetoothctl";
const HCITOOL: &str = "hcitool";

/// OS-level link operations
#[allow(async_fn_in_trait)]
pub trait LinkTool {
    /// Make sure the adapter is powered
    async fn power_on(&self) -> Result<(), ToolError>;

    /// Disconnect a device by raw address
    async fn disconnect(&self, address: &str) -> Result<(), ToolError>;

    /// Addresses the host currently holds links to
    async fn connected_addresses(&self) -> Result<Vec<String>, ToolError>;
}

/// [`LinkTool`] backed by `bluetoothctl` and `hcitool`
#[derive(Debug, Clone)]
pub struct BluetoothCtl {
    timeout: Duration,
}

impl BluetoothCtl {
    /// Create with a per-invocation timeout
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Per-invocation timeout
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn run(
        &self,
        tool: &'static str,
        args: &[&str],
        input: Option<String>,
    ) -> Result<String, ToolError> {
        let mut child = Command::new(tool)
            .args(args)
            .stdin(if input.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ToolError::Spawn { tool, source })?;

        if let (Some(input), Some(mut stdin)) = (input, child.stdin.take()) {
            stdin
                .write_all(input.as_bytes())
                .await
                .map_err(|source| ToolError::Spawn { tool, source })?;
            // Closing stdin lets the interactive shell exit
            drop(stdin);
        }

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| ToolError::Timeout {
                tool,
                timeout_ms: self.timeout.as_millis() as u64,
            })?
            .map_err(|source| ToolError::Spawn { tool, source })?;

        if !output.status.success() {
            return Err(ToolError::Failed {
                tool,
                status: output.status.code().unwrap_or(-1),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl Default for BluetoothCtl {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

impl LinkTool for BluetoothCtl {
    async fn power_on(&self) -> Result<(), ToolError> {
        self.run(BLUETOOTHCTL, &["power", "on"], None).await?;
        Ok(())
    }

    async fn disconnect(&self, address: &str) -> Result<(), ToolError> {
        let output = self
            .run(BLUETOOTHCTL, &[], Some(format!("disconnect {}\n", address)))
            .await?;
        debug!(address, output = %output.trim(), "bluetoothctl disconnect");
        Ok(())
    }

    async fn connected_addresses(&self) -> Result<Vec<String>, ToolError> {
        let output = self.run(HCITOOL, &["con"], None).await?;
        if !output.contains("Connections:") {
            return Ok(Vec::new());
        }
        Ok(parse_mac_addresses(&output))
    }
}

/// Extract colon-separated MAC addresses from tool output
pub fn parse_mac_addresses(output: &str) -> Vec<String> {
    output
        .split(|c: char| c.is_whitespace() || c == ',' || c == ';')
        .filter(|token| is_mac_address(token))
        .map(str::to_string)
        .collect()
}

fn is_mac_address(token: &str) -> bool {
    let groups: Vec<&str> = token.split(':').collect();
    groups.len() == 6
        && groups
            .iter()
            .all(|g| g.len() == 2 && g.chars().all(|c| c.is_ascii_hexdigit()))
}

/// Recording [`LinkTool`] for tests
#[derive(Debug, Default)]
pub struct MemoryTool {
    connected: Mutex<Vec<String>>,
    disconnected: Mutex<Vec<String>>,
    fail: bool,
}

impl MemoryTool {
    /// Tool that succeeds and reports no stale links
    pub fn new() -> Self {
        Self::default()
    }

    /// Tool whose every call fails
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    /// Tool reporting the given addresses as already linked
    pub fn with_connected(addresses: &[&str]) -> Self {
        Self {
            connected: Mutex::new(addresses.iter().map(|a| a.to_string()).collect()),
            ..Default::default()
        }
    }

    /// Addresses passed to `disconnect`, in call order
    pub fn disconnected(&self) -> Vec<String> {
        self.disconnected
            .lock()
            .map(|d| d.clone())
            .unwrap_or_default()
    }

    fn failure(&self) -> Result<(), ToolError> {
        if self.fail {
            return Err(ToolError::Failed {
                tool: BLUETOOTHCTL,
                status: 1,
            });
        }
        Ok(())
    }
}

impl LinkTool for MemoryTool {
    async fn power_on(&self) -> Result<(), ToolError> {
        self.failure()
    }

    async fn disconnect(&self, address: &str) -> Result<(), ToolError> {
        if let Ok(mut d) = self.disconnected.lock() {
            d.push(address.to_string());
        }
        self.failure()
    }

    async fn connected_addresses(&self) -> Result<Vec<String>, ToolError> {
        self.failure()?;
        Ok(self
            .connected
            .lock()
            .map(|c| c.clone())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hcitool_output() {
        let output = "Connections:\n\
            \t< LE C4:7C:8D:6A:1B:02 handle 64 state 1 lm CENTRAL \n\
            \t< LE d0:3a:11:22:33:44 handle 65 state 1 lm CENTRAL \n";
        assert_eq!(
            parse_mac_addresses(output),
            vec!["C4:7C:8D:6A:1B:02", "d0:3a:11:22:33:44"]
        );
    }

    #[test]
    fn test_parse_rejects_near_misses() {
        assert!(parse_mac_addresses("C4:7C:8D:6A:1B").is_empty());
        assert!(parse_mac_addresses("C4:7C:8D:6A:1B:0G").is_empty());
        assert!(parse_mac_addresses("Connections:").is_empty());
    }

    #[tokio::test]
    async fn test_memory_tool_records_disconnects() {
        let tool = MemoryTool::failing();
        assert!(tool.disconnect("AA").await.is_err());
        assert_eq!(tool.disconnected(), vec!["AA"]);
    }
}
