// Coldwatch - Cold-chain sensor gateway
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Wall clock anchored to the runtime's monotonic clock

use chrono::{DateTime, Utc};
use tokio::time::Instant;

/// Wall-clock time derived from [`tokio::time::Instant`]
///
/// The wall time is sampled once, at construction, and advanced by the
/// monotonic clock afterwards. Alarm durations therefore never jump with NTP
/// corrections, and under a paused test runtime they follow virtual time.
#[derive(Debug, Clone, Copy)]
pub struct RuntimeClock {
    wall: DateTime<Utc>,
    origin: Instant,
}

impl RuntimeClock {
    /// Anchor at the current system time
    pub fn new() -> Self {
        Self::starting_at(Utc::now())
    }

    /// Anchor at a fixed wall time
    pub fn starting_at(wall: DateTime<Utc>) -> Self {
        Self {
            wall,
            origin: Instant::now(),
        }
    }

    /// Current wall time
    pub fn now(&self) -> DateTime<Utc> {
        let elapsed = Instant::now().saturating_duration_since(self.origin);
        chrono::Duration::from_std(elapsed)
            .map(|d| self.wall + d)
            .unwrap_or(self.wall)
    }
}

impl Default for RuntimeClock {
    fn default() -> Self {
        Self::new()
    }
}
