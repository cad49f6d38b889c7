//! Shared runtime state: the bounded event ring behind the status API and
//! the alert sink contract for threshold violations.

use chrono::{DateTime, Local};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::interlock::HistoryEntry;
use crate::sensor::ZoneReading;

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

pub type SharedEvents = Arc<RwLock<EventLog>>;

/// Per-zone moisture thresholds, percent. Runtime-mutable from the control
/// surface; zones without an explicit entry use the default.
pub type SharedThresholds = Arc<std::sync::RwLock<HashMap<u8, f64>>>;

/// Threshold applied when a zone has no configured value.
pub const DEFAULT_MOISTURE_THRESHOLD: f64 = 40.0;

/// Look up a zone's threshold, falling back to the default.
pub fn zone_threshold(thresholds: &SharedThresholds, zone_id: u8) -> f64 {
    thresholds
        .read()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .get(&zone_id)
        .copied()
        .unwrap_or(DEFAULT_MOISTURE_THRESHOLD)
}

/// Runtime threshold edits saved next to the schedule store. A missing file
/// is an empty overlay over the config-seeded values.
pub fn load_thresholds(path: &std::path::Path) -> anyhow::Result<HashMap<u8, f64>> {
    if !path.exists() {
        return Ok(HashMap::new());
    }
    let raw = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

pub fn save_thresholds(path: &std::path::Path, thresholds: &HashMap<u8, f64>) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(thresholds)?;
    crate::store::write_atomically(path, &json)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Event ring
// ---------------------------------------------------------------------------

#[derive(Clone, Serialize)]
pub struct SystemEvent {
    pub ts: DateTime<Local>,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Irrigation,
    Scheduler,
    Sensor,
    Error,
    System,
}

#[derive(Default)]
pub struct EventLog {
    events: VecDeque<SystemEvent>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedEvents {
        Arc::new(RwLock::new(Self::new()))
    }

    pub fn record(&mut self, kind: EventKind, detail: impl Into<String>) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(SystemEvent {
            ts: Local::now(),
            kind,
            detail: detail.into(),
        });
    }

    /// Newest-first snapshot.
    pub fn snapshot(&self) -> Vec<SystemEvent> {
        self.events.iter().rev().cloned().collect()
    }
}

// ---------------------------------------------------------------------------
// Alert sink contract
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Warning,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    LowMoisture,
    TankLow,
    TankUnavailable,
    RelayFault,
}

/// Threshold-violation event delivered to the injected alert callback.
#[derive(Debug, Clone, Serialize)]
pub struct AlertEvent {
    pub ts: DateTime<Local>,
    pub level: AlertLevel,
    pub kind: AlertKind,
    pub message: String,
    pub zone_id: Option<u8>,
    pub tank_id: Option<u8>,
    pub value: Option<f64>,
}

pub type AlertSink = Arc<dyn Fn(AlertEvent) + Send + Sync>;

// ---------------------------------------------------------------------------
// Status snapshot (what the control surface returns)
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct StatusResponse {
    pub mode: crate::auto::Mode,
    pub is_irrigating: bool,
    pub current_zone: Option<u8>,
    pub zone_thresholds: HashMap<u8, f64>,
    pub last_readings: HashMap<u8, ZoneReading>,
    pub recent_history: Vec<HistoryEntry>,
    pub events: Vec<SystemEvent>,
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_evicts_oldest_past_capacity() {
        let mut log = EventLog::new();
        for i in 0..(MAX_EVENTS + 10) {
            log.record(EventKind::System, format!("event {i}"));
        }
        let events = log.snapshot();
        assert_eq!(events.len(), MAX_EVENTS);
        // Newest first.
        assert_eq!(events[0].detail, format!("event {}", MAX_EVENTS + 9));
        // The ten oldest were evicted.
        assert_eq!(events.last().unwrap().detail, "event 10");
    }

    #[test]
    fn threshold_overlay_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("thresholds.json");
        assert!(load_thresholds(&path).unwrap().is_empty());

        let mut thresholds = HashMap::new();
        thresholds.insert(1u8, 55.0);
        thresholds.insert(3u8, 30.5);
        save_thresholds(&path, &thresholds).unwrap();

        assert_eq!(load_thresholds(&path).unwrap(), thresholds);
    }

    #[test]
    fn snapshot_is_newest_first() {
        let mut log = EventLog::new();
        log.record(EventKind::Scheduler, "first");
        log.record(EventKind::Irrigation, "second");
        let events = log.snapshot();
        assert_eq!(events[0].detail, "second");
        assert_eq!(events[1].detail, "first");
    }
}
