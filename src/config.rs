//! TOML config file loading and validation for the rig: system timing,
//! scheduler tuning, web bind address, and the zone table.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::Duration;

use crate::auto::AutoConfig;
use crate::interlock::IrrigatorConfig;
use crate::scheduler::EngineConfig;

/// Highest zone id the relay bank can drive.
const MAX_ZONE_ID: u8 = 8;

/// Hard cap on any single irrigation, matching the actuator's safety
/// ceiling. Config cannot raise it.
const HARD_MAX_DURATION_SEC: u64 = 1800;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub system: SystemSection,
    #[serde(default)]
    pub scheduler: SchedulerSection,
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub zones: Vec<ZoneEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SystemSection {
    /// Seconds between automatic check passes.
    pub check_interval_sec: u64,
    /// Watering seconds per zone when no duration is given.
    pub default_duration_sec: u64,
    /// Per-session ceiling, seconds. Cannot exceed the hard cap.
    pub max_duration_sec: u64,
    /// Minimum tank fill percent before a pass is allowed.
    pub min_tank_level: f64,
    /// Seconds of pause between zones in one pass.
    pub zone_interval_sec: u64,
    pub tank_id: u8,
    /// Where the schedule list is persisted.
    pub schedule_file: String,
    /// Where runtime threshold edits are persisted.
    pub threshold_file: String,
}

impl Default for SystemSection {
    fn default() -> Self {
        Self {
            check_interval_sec: 600,
            default_duration_sec: 300,
            max_duration_sec: HARD_MAX_DURATION_SEC,
            min_tank_level: 20.0,
            zone_interval_sec: 10,
            tank_id: 1,
            schedule_file: "schedules.json".into(),
            threshold_file: "thresholds.json".into(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SchedulerSection {
    pub tick_interval_sec: u64,
    /// Seconds after a scheduled time during which it still fires.
    pub grace_sec: i64,
    /// Seconds between interlock polls for a queued job.
    pub interlock_wait_sec: u64,
    /// Seconds a queued job may wait before it is dropped.
    pub interlock_timeout_sec: u64,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            tick_interval_sec: 30,
            grace_sec: 600,
            interlock_wait_sec: 10,
            interlock_timeout_sec: 3600,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub bind: String,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8080".into(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ZoneEntry {
    pub id: u8,
    pub name: String,
    /// Moisture percent below which the zone counts as dry.
    #[serde(default = "default_threshold")]
    pub moisture_threshold: f64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_threshold() -> f64 {
    crate::state::DEFAULT_MOISTURE_THRESHOLD
}

fn default_enabled() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate the whole file. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_system(&mut errors);
        self.validate_scheduler(&mut errors);
        self.validate_zones(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_system(&self, errors: &mut Vec<String>) {
        let s = &self.system;
        if s.check_interval_sec == 0 {
            errors.push("system: check_interval_sec must be positive".into());
        }
        if s.default_duration_sec == 0 {
            errors.push("system: default_duration_sec must be positive".into());
        }
        if s.max_duration_sec == 0 || s.max_duration_sec > HARD_MAX_DURATION_SEC {
            errors.push(format!(
                "system: max_duration_sec {} out of range [1, {HARD_MAX_DURATION_SEC}]",
                s.max_duration_sec
            ));
        }
        if s.default_duration_sec > s.max_duration_sec {
            errors.push(format!(
                "system: default_duration_sec ({}) exceeds max_duration_sec ({})",
                s.default_duration_sec, s.max_duration_sec
            ));
        }
        if !(0.0..=100.0).contains(&s.min_tank_level) {
            errors.push(format!(
                "system: min_tank_level {} out of range [0, 100]",
                s.min_tank_level
            ));
        }
        if s.schedule_file.trim().is_empty() {
            errors.push("system: schedule_file is empty".into());
        }
        if s.threshold_file.trim().is_empty() {
            errors.push("system: threshold_file is empty".into());
        }
    }

    fn validate_scheduler(&self, errors: &mut Vec<String>) {
        let s = &self.scheduler;
        if s.tick_interval_sec == 0 {
            errors.push("scheduler: tick_interval_sec must be positive".into());
        }
        if s.grace_sec < 0 {
            errors.push(format!(
                "scheduler: grace_sec must not be negative, got {}",
                s.grace_sec
            ));
        }
        if s.interlock_wait_sec == 0 {
            errors.push("scheduler: interlock_wait_sec must be positive".into());
        }
        if s.interlock_timeout_sec < s.interlock_wait_sec {
            errors.push(format!(
                "scheduler: interlock_timeout_sec ({}) is shorter than interlock_wait_sec ({})",
                s.interlock_timeout_sec, s.interlock_wait_sec
            ));
        }
    }

    fn validate_zones(&self, errors: &mut Vec<String>) {
        if self.zones.is_empty() {
            errors.push("zones: at least one zone must be defined".into());
        }

        let mut seen_ids: HashSet<u8> = HashSet::new();
        for (i, z) in self.zones.iter().enumerate() {
            let ctx = || format!("zone '{}' (zones[{i}])", z.id);

            if z.id == 0 || z.id > MAX_ZONE_ID {
                errors.push(format!(
                    "{}: id out of range [1, {MAX_ZONE_ID}]",
                    ctx()
                ));
            } else if !seen_ids.insert(z.id) {
                errors.push(format!("{}: duplicate id", ctx()));
            }

            if z.name.trim().is_empty() {
                errors.push(format!("{}: name is empty", ctx()));
            }

            if !(0.0..=100.0).contains(&z.moisture_threshold) {
                errors.push(format!(
                    "{}: moisture_threshold {} out of range [0, 100]",
                    ctx(),
                    z.moisture_threshold
                ));
            }
        }
    }

    // -- derived runtime configs --------------------------------------------

    /// Ids of enabled zones, ascending.
    pub fn enabled_zone_ids(&self) -> Vec<u8> {
        self.zones
            .iter()
            .filter(|z| z.enabled)
            .map(|z| z.id)
            .collect()
    }

    /// All configured zone ids, for schedule validation. A disabled zone can
    /// still be scheduled or watered manually.
    pub fn known_zone_ids(&self) -> BTreeSet<u8> {
        self.zones.iter().map(|z| z.id).collect()
    }

    pub fn thresholds(&self) -> HashMap<u8, f64> {
        self.zones
            .iter()
            .map(|z| (z.id, z.moisture_threshold))
            .collect()
    }

    pub fn auto_config(&self) -> AutoConfig {
        AutoConfig {
            check_interval: Duration::from_secs(self.system.check_interval_sec),
            default_duration: Duration::from_secs(self.system.default_duration_sec),
            zone_interval: Duration::from_secs(self.system.zone_interval_sec),
            min_tank_level: self.system.min_tank_level,
            tank_id: self.system.tank_id,
            threshold_file: Some(self.system.threshold_file.clone().into()),
        }
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            tick_interval: Duration::from_secs(self.scheduler.tick_interval_sec),
            grace_secs: self.scheduler.grace_sec,
            interlock_wait: Duration::from_secs(self.scheduler.interlock_wait_sec),
            interlock_timeout: Duration::from_secs(self.scheduler.interlock_timeout_sec),
        }
    }

    pub fn irrigator_config(&self) -> IrrigatorConfig {
        IrrigatorConfig {
            max_duration: Duration::from_secs(self.system.max_duration_sec),
            ..IrrigatorConfig::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file.
pub fn load(path: &str) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let config: Config =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

// ===========================================================================
// Tests
// ===========================================================================
