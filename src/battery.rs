// Coldwatch - Cold-chain sensor gateway
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Battery state-of-charge estimation
//!
//! Sensors report their cell voltage and cell temperature. Primary lithium
//! cells hold a long flat plateau and collapse near the end, and their
//! full-charge voltage sags in the cold, so a straight mV table misreports
//! both ends. [`BatteryCurve`] compensates the full-charge voltage for
//! temperature and compresses the plateau with a power curve.
//!
//! [`BatteryMemory`] filters the result so a sink only sees a new percentage
//! when it moved by at least the hysteresis step.

use std::collections::HashMap;

/// Temperature at or below which the cold full-charge reference applies (°C)
pub const COLD_REFERENCE_C: f64 = -25.0;

/// Temperature at or above which the warm full-charge reference applies (°C)
pub const WARM_REFERENCE_C: f64 = 20.0;

/// Default hysteresis step between reported percentages
pub const DEFAULT_HYSTERESIS: u8 = 5;

/// Voltage to state-of-charge curve
#[derive(Debug, Clone, PartialEq)]
pub struct BatteryCurve {
    /// Empty-cell voltage (mV)
    pub v_min_mv: f64,
    /// Full-charge voltage at or below the cold reference (mV)
    pub v_max_cold_mv: f64,
    /// Full-charge voltage at or above the warm reference (mV)
    pub v_max_warm_mv: f64,
    /// Band below the full-charge voltage reported as 100% (mV)
    pub headroom_mv: f64,
    /// Plateau compression exponent, in (0, 1)
    pub alpha: f64,
}

impl Default for BatteryCurve {
    fn default() -> Self {
        Self {
            v_min_mv: 2400.0,
            v_max_cold_mv: 2800.0,
            v_max_warm_mv: 3000.0,
            headroom_mv: 20.0,
            alpha: 0.6,
        }
    }
}

impl BatteryCurve {
    /// Full-charge voltage at the given cell temperature
    pub fn v_max(&self, temp_c: f64) -> f64 {
        if temp_c <= COLD_REFERENCE_C {
            return self.v_max_cold_mv;
        }
        if temp_c >= WARM_REFERENCE_C {
            return self.v_max_warm_mv;
        }
        let t = (temp_c - COLD_REFERENCE_C) / (WARM_REFERENCE_C - COLD_REFERENCE_C);
        self.v_max_cold_mv + t * (self.v_max_warm_mv - self.v_max_cold_mv)
    }

    /// Charge percentage for a cell voltage and temperature
    pub fn percent(&self, mv: i32, temp_c: f64) -> u8 {
        let mv = f64::from(mv);
        let v_max = self.v_max(temp_c);

        if mv <= self.v_min_mv {
            return 0;
        }
        if mv >= v_max - self.headroom_mv {
            return 100;
        }

        let span = v_max - self.v_min_mv;
        if span <= 0.0 {
            return 0;
        }
        let fraction = ((mv - self.v_min_mv) / span).clamp(0.0, 1.0);
        let percent = (100.0 * fraction.powf(self.alpha)).round();
        percent.clamp(0.0, 100.0) as u8
    }
}

/// Last reported percentage per address
#[derive(Debug, Clone)]
pub struct BatteryMemory {
    last_reported: HashMap<String, u8>,
    hysteresis: u8,
}

impl BatteryMemory {
    /// Create a memory with the given hysteresis step
    pub fn new(hysteresis: u8) -> Self {
        Self {
            last_reported: HashMap::new(),
            hysteresis,
        }
    }

    /// Decide whether `percent` should be reported for `address`
    ///
    /// Returns true on the first observation, or when the value moved by at
    /// least the hysteresis step from the last reported value. The memory is
    /// updated only when this returns true.
    pub fn should_report(&mut self, address: &str, percent: u8) -> bool {
        let report = match self.last_reported.get(address) {
            None => true,
            Some(&last) => percent.abs_diff(last) >= self.hysteresis,
        };
        if report {
            self.last_reported.insert(address.to_string(), percent);
        }
        report
    }

    /// Last reported value for an address
    pub fn last_reported(&self, address: &str) -> Option<u8> {
        self.last_reported.get(address).copied()
    }

    /// Hysteresis step
    pub fn hysteresis(&self) -> u8 {
        self.hysteresis
    }
}

impl Default for BatteryMemory {
    fn default() -> Self {
        Self::new(DEFAULT_HYSTERESIS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_v_max_interpolation() {
        let curve = BatteryCurve::default();
        assert_relative_eq!(curve.v_max(-40.0), 2800.0);
        assert_relative_eq!(curve.v_max(-25.0), 2800.0);
        assert_relative_eq!(curve.v_max(20.0), 3000.0);
        assert_relative_eq!(curve.v_max(35.0), 3000.0);
        // Midpoint of [-25, 20] is -2.5
        assert_relative_eq!(curve.v_max(-2.5), 2900.0);
    }

    #[test]
    fn test_percent_bounds() {
        let curve = BatteryCurve::default();
        assert_eq!(curve.percent(2000, 20.0), 0);
        assert_eq!(curve.percent(2400, 20.0), 0);
        assert_eq!(curve.percent(2980, 20.0), 100);
        assert_eq!(curve.percent(3300, 20.0), 100);
        // Cold cell reaches full earlier
        assert_eq!(curve.percent(2780, -30.0), 100);
    }

    #[test]
    fn test_percent_compresses_plateau() {
        let curve = BatteryCurve::default();
        // Half of the voltage span reads well above 50%
        let half = curve.percent(2700, 20.0);
        assert!(half > 60, "got {}", half);
        assert!(half < 100);
        // 0.5^0.6 = 0.6598
        assert_eq!(half, 66);
    }

    #[test]
    fn test_percent_monotonic() {
        let curve = BatteryCurve::default();
        for temp in [-40.0, -25.0, -10.0, 0.0, 20.0, 40.0] {
            let mut previous = 0;
            for mv in (2000..3200).step_by(5) {
                let p = curve.percent(mv, temp);
                assert!(p <= 100);
                assert!(p >= previous, "mv {} temp {}: {} < {}", mv, temp, p, previous);
                previous = p;
            }
        }
    }

    #[test]
    fn test_should_report_first_observation() {
        let mut memory = BatteryMemory::default();
        assert!(memory.should_report("AA", 80));
        assert_eq!(memory.last_reported("AA"), Some(80));
    }

    #[test]
    fn test_should_report_hysteresis() {
        let mut memory = BatteryMemory::new(5);
        assert!(memory.should_report("AA", 80));
        assert!(!memory.should_report("AA", 79));
        assert!(!memory.should_report("AA", 76));
        assert_eq!(memory.last_reported("AA"), Some(80));
        assert!(memory.should_report("AA", 75));
        assert_eq!(memory.last_reported("AA"), Some(75));
        assert!(memory.should_report("AA", 80));
    }

    #[test]
    fn test_should_report_per_address() {
        let mut memory = BatteryMemory::default();
        assert!(memory.should_report("AA", 50));
        assert!(memory.should_report("BB", 51));
        assert!(!memory.should_report("AA", 51));
    }
}
