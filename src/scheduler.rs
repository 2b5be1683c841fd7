// Coldwatch - Cold-chain sensor gateway
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Next-wake computation
//!
//! The gateway normally wakes once per sampling interval. When an alarm
//! deadline (end of a debounce window, or a resend) falls inside that
//! interval, it wakes just ahead of the deadline instead, so alerts are not
//! late by up to a full interval.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::alarm::AlarmEngine;
use crate::config::{SchedulerConfig, SensorDescriptor};

/// Computes the delay before the next cycle
#[derive(Debug, Clone, Default)]
pub struct Scheduler {
    config: SchedulerConfig,
}

impl Scheduler {
    /// Create a scheduler
    pub fn new(config: SchedulerConfig) -> Self {
        Self { config }
    }

    /// Delay before the next cycle
    ///
    /// `elapsed` is how long the cycle just finished took. Every configured
    /// device is scanned, connected or not.
    pub fn next_delay(
        &self,
        elapsed: Duration,
        now: DateTime<Utc>,
        sampling_interval: Duration,
        alarms: &AlarmEngine,
        devices: &[SensorDescriptor],
    ) -> Duration {
        let floor = self.config.floor();
        let base = sampling_interval.saturating_sub(elapsed).max(floor);
        let guard = chrono_duration(self.config.guard());

        let mut candidate = now
            .checked_add_signed(chrono_duration(base))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        for device in devices {
            let Some(deadline) = alarms.next_deadline(&device.address) else {
                continue;
            };
            if deadline <= now || deadline >= candidate {
                continue;
            }
            let wake = deadline - guard;
            let wake = if wake <= now { deadline } else { wake };
            if wake < candidate {
                debug!(address = %device.address, deadline = %deadline, "Waking early for alarm");
                candidate = wake;
            }
        }

        let delay = (candidate - now).to_std().unwrap_or(Duration::ZERO).max(floor);
        debug!(
            delay_ms = delay.as_millis() as u64,
            base_ms = base.as_millis() as u64,
            "Next cycle scheduled"
        );
        delay
    }
}

fn chrono_duration(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}
