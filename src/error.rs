// Coldwatch - Cold-chain sensor gateway
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Error types for Coldwatch
//!
//! Each collaborator boundary has its own error enum. None of them is fatal
//! to a cycle: the gateway loop turns them into per-device outcomes or log
//! lines. [`GatewayError`] only surfaces from startup and file loading.

use thiserror::Error;

/// Result type alias for gateway operations
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Umbrella error type
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Radio link error
    #[error("Link error: {0}")]
    Link(#[from] LinkError),

    /// OS link tool error
    #[error("Link tool error: {0}")]
    Tool(#[from] ToolError),

    /// Sink error
    #[error("Sink error: {0}")]
    Sink(#[from] SinkError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Errors raised by a radio link
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LinkError {
    /// Link could not be opened
    #[error("Connect to {address} failed: {reason}")]
    Connect { address: String, reason: String },

    /// Link-level disconnect failed
    #[error("Disconnect from {address} failed: {reason}")]
    Disconnect { address: String, reason: String },

    /// Characteristic read failed
    #[error("Read of {characteristic} failed: {reason}")]
    Read {
        characteristic: String,
        reason: String,
    },

    /// Characteristic write failed
    #[error("Write to {characteristic} failed: {reason}")]
    Write {
        characteristic: String,
        reason: String,
    },

    /// Operation exceeded its bound
    #[error("{operation} timed out after {timeout_ms}ms")]
    Timeout {
        operation: &'static str,
        timeout_ms: u64,
    },

    /// Payload had an unexpected shape
    #[error("Malformed {field} payload: expected {expected} bytes, got {actual}")]
    Payload {
        field: &'static str,
        expected: usize,
        actual: usize,
    },

    /// Handle no longer refers to a live link
    #[error("Not connected: {0}")]
    NotConnected(String),
}

/// Errors raised by the OS-level link tool
#[derive(Error, Debug)]
pub enum ToolError {
    /// The tool could not be spawned or talked to
    #[error("Failed to run {tool}: {source}")]
    Spawn {
        tool: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// The tool did not finish in time
    #[error("{tool} timed out after {timeout_ms}ms")]
    Timeout { tool: &'static str, timeout_ms: u64 },

    /// The tool exited unsuccessfully
    #[error("{tool} exited with status {status}")]
    Failed { tool: &'static str, status: i32 },
}

/// Errors raised by a telemetry sink
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SinkError {
    /// Remote rejected or could not be reached
    #[error("{operation} failed: {reason}")]
    Rejected {
        operation: &'static str,
        reason: String,
    },

    /// Nothing to send
    #[error("{0}: empty payload")]
    Empty(&'static str),
}

/// Errors raised while loading configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    /// File could not be read
    #[error("Failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// File contents did not parse
    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    /// Source returned no configuration
    #[error("No configuration available: {0}")]
    Absent(String),

    /// Values present but unusable
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = GatewayError::Link(LinkError::Timeout {
            operation: "disconnect",
            timeout_ms: 5000,
        });
        let msg = format!("{}", err);
        assert!(msg.contains("disconnect"));
        assert!(msg.contains("5000"));
    }

    #[test]
    fn test_error_conversion() {
        let link_err = LinkError::NotConnected("AA".to_string());
        let err: GatewayError = link_err.into();
        assert!(matches!(err, GatewayError::Link(_)));
    }

    #[test]
    fn test_payload_error_display() {
        let err = LinkError::Payload {
            field: "battery",
            expected: 4,
            actual: 2,
        };
        assert_eq!(
            err.to_string(),
            "Malformed battery payload: expected 4 bytes, got 2"
        );
    }
}
