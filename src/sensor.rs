//! Soil/tank sensor access behind the [`SensorPort`] trait. The default
//! `sim` feature provides a simulated bus for development; the real Modbus
//! RS-485 bus driver lives outside this crate and only needs to satisfy the
//! trait.
//!
//! A reading is all-or-nothing: any register failure invalidates the whole
//! zone sample for that pass.

use chrono::{DateTime, Local};
use serde::Serialize;

use crate::error::RigError;

// ---------------------------------------------------------------------------
// Samples
// ---------------------------------------------------------------------------

/// One successful read of a zone's soil probe.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ZoneSample {
    /// Volumetric moisture, percent 0–100.
    pub moisture: f64,
    /// Soil temperature, °C.
    pub temperature: f64,
    /// Electrical conductivity, µS/cm.
    pub ec: u16,
}

/// A zone sample stamped at read time, as cached for the status surface.
#[derive(Debug, Clone, Serialize)]
pub struct ZoneReading {
    pub zone_id: u8,
    pub moisture: f64,
    pub temperature: f64,
    pub ec: u16,
    pub ts: DateTime<Local>,
}

impl ZoneReading {
    pub fn new(zone_id: u8, sample: ZoneSample) -> Self {
        Self {
            zone_id,
            moisture: sample.moisture,
            temperature: sample.temperature,
            ec: sample.ec,
            ts: Local::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Port trait
// ---------------------------------------------------------------------------

pub trait SensorPort: Send {
    /// Read one zone's probe. Each zone fails independently.
    fn read_zone(&mut self, zone_id: u8) -> Result<ZoneSample, RigError>;

    /// Read a tank's fill level, percent 0–100. `None` when the level
    /// sensor cannot be reached.
    fn read_tank_level(&mut self, tank_id: u8) -> Option<f64>;
}

// ---------------------------------------------------------------------------
// Outlier-trimmed averaging
// ---------------------------------------------------------------------------

/// Average `values` after dropping the `trim` largest and `trim` smallest
/// entries. Falls back to a plain mean when there are not enough values to
/// trim. Returns `None` for an empty slice.
pub fn trimmed_mean(values: &[f64], trim: usize) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted: Vec<f64> = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));

    let window: &[f64] = if sorted.len() > trim * 2 {
        &sorted[trim..sorted.len() - trim]
    } else {
        &sorted
    };
    Some(window.iter().sum::<f64>() / window.len() as f64)
}

// ---------------------------------------------------------------------------
// Simulated bus (development, no hardware)
// ---------------------------------------------------------------------------

#[cfg(feature = "sim")]
pub use sim::SimSensorBus;

#[cfg(feature = "sim")]
mod sim {
    use super::{trimmed_mean, SensorPort, ZoneSample};
    use crate::error::RigError;
    use std::collections::HashMap;

    /// Random-walk soil simulator: each zone drifts slowly dry with
    /// per-reading noise, and tank level drifts down as zones are read.
    pub struct SimSensorBus {
        moisture: HashMap<u8, f64>,
        tank_level: f64,
    }

    impl SimSensorBus {
        pub fn new(zone_ids: &[u8]) -> Self {
            let moisture = zone_ids
                .iter()
                .map(|&z| (z, 40.0 + fastrand::f64() * 30.0))
                .collect();
            Self {
                moisture,
                tank_level: 60.0 + fastrand::f64() * 30.0,
            }
        }

        fn noisy(base: f64) -> f64 {
            // Small electronic noise, smoothed the same way the real bus
            // smooths burst reads.
            let burst: Vec<f64> = (0..5)
                .map(|_| base + (fastrand::f64() - 0.5) * 2.0)
                .collect();
            trimmed_mean(&burst, 1).unwrap_or(base)
        }
    }

    impl SensorPort for SimSensorBus {
        fn read_zone(&mut self, zone_id: u8) -> Result<ZoneSample, RigError> {
            let level = self.moisture.get_mut(&zone_id).ok_or_else(|| {
                RigError::SensorRead {
                    zone: zone_id,
                    reason: "no probe configured".into(),
                }
            })?;

            // Slow drying drift with a touch of mean reversion.
            *level = (*level - 0.2 + (fastrand::f64() - 0.45) * 0.8).clamp(5.0, 95.0);

            Ok(ZoneSample {
                moisture: Self::noisy(*level).clamp(0.0, 100.0),
                temperature: 18.0 + fastrand::f64() * 10.0,
                ec: 200 + fastrand::u16(0..600),
            })
        }

        fn read_tank_level(&mut self, _tank_id: u8) -> Option<f64> {
            self.tank_level = (self.tank_level - 0.05).max(0.0);
            Some(Self::noisy(self.tank_level).clamp(0.0, 100.0))
        }
    }
}

// ---------------------------------------------------------------------------
// Scriptable bus (tests only)
// ---------------------------------------------------------------------------

#[cfg(test)]
pub struct FixedSensorBus {
    pub moisture: std::collections::HashMap<u8, f64>,
    pub failing_zones: Vec<u8>,
    pub tank_level: Option<f64>,
}

#[cfg(test)]
impl FixedSensorBus {
    pub fn new(moisture: &[(u8, f64)], tank_level: Option<f64>) -> Self {
        Self {
            moisture: moisture.iter().copied().collect(),
            failing_zones: Vec::new(),
            tank_level,
        }
    }
}

#[cfg(test)]
impl SensorPort for FixedSensorBus {
    fn read_zone(&mut self, zone_id: u8) -> Result<ZoneSample, RigError> {
        if self.failing_zones.contains(&zone_id) {
            return Err(RigError::SensorRead {
                zone: zone_id,
                reason: "injected read failure".into(),
            });
        }
        let moisture = self
            .moisture
            .get(&zone_id)
            .copied()
            .ok_or_else(|| RigError::SensorRead {
                zone: zone_id,
                reason: "no probe configured".into(),
            })?;
        Ok(ZoneSample {
            moisture,
            temperature: 21.0,
            ec: 400,
        })
    }

    fn read_tank_level(&mut self, _tank_id: u8) -> Option<f64> {
        self.tank_level
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    // -- trimmed_mean -------------------------------------------------------

    #[test]
    fn trimmed_mean_drops_outliers() {
        // 0 and 100 are the outliers; the middle averages to 50.
        let values = [0.0, 49.0, 50.0, 51.0, 100.0];
        assert_eq!(trimmed_mean(&values, 1), Some(50.0));
    }

    #[test]
    fn trimmed_mean_small_input_falls_back_to_plain_mean() {
        let values = [10.0, 20.0];
        assert_eq!(trimmed_mean(&values, 2), Some(15.0));
    }

    #[test]
    fn trimmed_mean_empty_is_none() {
        assert_eq!(trimmed_mean(&[], 2), None);
    }

    #[test]
    fn trimmed_mean_unsorted_input() {
        let values = [100.0, 50.0, 0.0, 51.0, 49.0];
        assert_eq!(trimmed_mean(&values, 1), Some(50.0));
    }

    // -- FixedSensorBus -----------------------------------------------------

    #[test]
    fn fixed_bus_reads_configured_zone() {
        let mut bus = FixedSensorBus::new(&[(1, 35.0)], Some(50.0));
        let sample = bus.read_zone(1).unwrap();
        assert_eq!(sample.moisture, 35.0);
    }

    #[test]
    fn fixed_bus_unknown_zone_fails_whole_reading() {
        let mut bus = FixedSensorBus::new(&[(1, 35.0)], Some(50.0));
        assert!(matches!(
            bus.read_zone(7),
            Err(RigError::SensorRead { zone: 7, .. })
        ));
    }

    #[test]
    fn fixed_bus_injected_failure() {
        let mut bus = FixedSensorBus::new(&[(1, 35.0)], Some(50.0));
        bus.failing_zones.push(1);
        assert!(bus.read_zone(1).is_err());
    }

    // -- SimSensorBus -------------------------------------------------------

    #[cfg(feature = "sim")]
    #[test]
    fn sim_bus_readings_stay_in_range() {
        let mut bus = SimSensorBus::new(&[1, 2, 3]);
        for _ in 0..50 {
            for z in [1, 2, 3] {
                let s = bus.read_zone(z).unwrap();
                assert!((0.0..=100.0).contains(&s.moisture));
            }
            let level = bus.read_tank_level(1).unwrap();
            assert!((0.0..=100.0).contains(&level));
        }
    }

    #[cfg(feature = "sim")]
    #[test]
    fn sim_bus_unconfigured_zone_errors() {
        let mut bus = SimSensorBus::new(&[1]);
        assert!(bus.read_zone(9).is_err());
    }
}
