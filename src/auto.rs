//! Automatic moisture controller: the mode switch plus the periodic check
//! pass that waters dry zones in zone id order.
//!
//! The controller never touches relays directly. Every watering goes
//! through the interlocked actuator, so a manual session and an automatic
//! pass can never overlap on hardware.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::cancel::CancelToken;
use crate::error::RigError;
use crate::interlock::{Irrigator, Trigger};
use crate::sensor::{SensorPort, ZoneReading};
use crate::state::{
    zone_threshold, AlertEvent, AlertKind, AlertLevel, AlertSink, EventKind, SharedEvents,
    SharedThresholds, StatusResponse,
};

// ---------------------------------------------------------------------------
// Modes
// ---------------------------------------------------------------------------

/// Operating mode. The monitor loop runs only in `Auto`; manual commands
/// and the schedule engine are gated by the interlock, not by mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Auto,
    Manual,
    Schedule,
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Auto => write!(f, "auto"),
            Self::Manual => write!(f, "manual"),
            Self::Schedule => write!(f, "schedule"),
        }
    }
}

impl std::str::FromStr for Mode {
    type Err = RigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(Self::Auto),
            "manual" => Ok(Self::Manual),
            "schedule" => Ok(Self::Schedule),
            other => Err(RigError::validation(format!("unknown mode '{other}'"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct AutoConfig {
    /// Interval between check passes in auto mode.
    pub check_interval: Duration,
    /// Watering duration per dry zone.
    pub default_duration: Duration,
    /// Pause between two zones in the same pass.
    pub zone_interval: Duration,
    /// Minimum tank fill percent; below it the pass is aborted.
    pub min_tank_level: f64,
    /// Which tank feeds the pump.
    pub tank_id: u8,
    /// Where runtime threshold edits are saved; `None` keeps them in memory.
    pub threshold_file: Option<std::path::PathBuf>,
}

impl Default for AutoConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(600),
            default_duration: Duration::from_secs(300),
            zone_interval: Duration::from_secs(10),
            min_tank_level: 20.0,
            tank_id: 1,
            threshold_file: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

pub struct AutoController {
    irrigator: Arc<Irrigator>,
    sensors: Arc<Mutex<Box<dyn SensorPort>>>,
    thresholds: SharedThresholds,
    events: SharedEvents,
    alerts: AlertSink,
    zone_ids: Vec<u8>,
    cfg: AutoConfig,
    mode: Mutex<Mode>,
    last_readings: RwLock<HashMap<u8, ZoneReading>>,
    monitor: tokio::sync::Mutex<Option<(CancelToken, JoinHandle<()>)>>,
}

impl AutoController {
    pub fn new(
        irrigator: Arc<Irrigator>,
        sensors: Arc<Mutex<Box<dyn SensorPort>>>,
        thresholds: SharedThresholds,
        events: SharedEvents,
        alerts: AlertSink,
        zone_ids: Vec<u8>,
        cfg: AutoConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            irrigator,
            sensors,
            thresholds,
            events,
            alerts,
            zone_ids,
            cfg,
            mode: Mutex::new(Mode::Manual),
            last_readings: RwLock::new(HashMap::new()),
            monitor: tokio::sync::Mutex::new(None),
        })
    }

    pub fn mode(&self) -> Mode {
        *lock(&self.mode)
    }

    /// Switch modes. Entering `Auto` starts the monitor loop; leaving it
    /// cancels the loop and waits for it to wind down. An in-flight
    /// irrigation session finishes under the actuator's own guarantees.
    pub async fn set_mode(self: &Arc<Self>, new_mode: Mode) {
        let previous = {
            let mut mode = lock(&self.mode);
            let previous = *mode;
            *mode = new_mode;
            previous
        };
        if previous == new_mode {
            return;
        }

        info!(from = %previous, to = %new_mode, "mode changed");
        self.events.write().await.record(
            EventKind::System,
            format!("mode changed to {new_mode}"),
        );

        let mut monitor = self.monitor.lock().await;
        if let Some((token, handle)) = monitor.take() {
            token.cancel();
            let _ = handle.await;
        }
        if new_mode == Mode::Auto {
            let token = CancelToken::new();
            let runner = Arc::clone(self);
            let loop_token = token.clone();
            let handle = tokio::spawn(async move { runner.monitor_loop(loop_token).await });
            *monitor = Some((token, handle));
        }
    }

    /// Stop the monitor loop without changing the published mode. Used at
    /// shutdown.
    pub async fn shutdown(&self) {
        let mut monitor = self.monitor.lock().await;
        if let Some((token, handle)) = monitor.take() {
            token.cancel();
            let _ = handle.await;
        }
    }

    /// Manually water one zone. Rejected immediately with
    /// [`RigError::InterlockBusy`] when a session is active; the caller is
    /// told, not queued.
    pub async fn irrigate_zone(
        &self,
        zone_id: u8,
        duration: Option<Duration>,
    ) -> Result<(), RigError> {
        if !self.zone_ids.contains(&zone_id) {
            return Err(RigError::validation(format!("unknown zone {zone_id}")));
        }
        let duration = duration.unwrap_or(self.cfg.default_duration);
        self.irrigator
            .irrigate(zone_id, duration, Trigger::Manual)
            .await?;
        Ok(())
    }

    /// Set a zone's moisture threshold, percent.
    pub fn set_threshold(&self, zone_id: u8, value: f64) -> Result<(), RigError> {
        if !self.zone_ids.contains(&zone_id) {
            return Err(RigError::validation(format!("unknown zone {zone_id}")));
        }
        if !(0.0..=100.0).contains(&value) {
            return Err(RigError::validation(format!(
                "threshold {value} out of range 0-100"
            )));
        }
        let snapshot = {
            let mut thresholds = self
                .thresholds
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            thresholds.insert(zone_id, value);
            thresholds.clone()
        };
        if let Some(path) = &self.cfg.threshold_file {
            if let Err(e) = crate::state::save_thresholds(path, &snapshot) {
                warn!("threshold save failed: {e:#}");
            }
        }
        info!(zone = zone_id, threshold = value, "threshold updated");
        Ok(())
    }

    pub async fn status(&self) -> StatusResponse {
        let interlock = self.irrigator.interlock_state();
        let zone_thresholds = self
            .zone_ids
            .iter()
            .map(|&z| (z, zone_threshold(&self.thresholds, z)))
            .collect();
        let last_readings = self
            .last_readings
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        StatusResponse {
            mode: self.mode(),
            is_irrigating: interlock.is_irrigating,
            current_zone: interlock.current_zone,
            zone_thresholds,
            last_readings,
            recent_history: self.irrigator.history(20),
            events: self.events.read().await.snapshot(),
        }
    }

    // -- monitor loop -------------------------------------------------------

    async fn monitor_loop(self: Arc<Self>, token: CancelToken) {
        info!(
            check_sec = self.cfg.check_interval.as_secs(),
            "auto monitor started"
        );
        loop {
            self.run_check_pass(&token).await;
            if !token.sleep(self.cfg.check_interval).await {
                break;
            }
        }
        info!("auto monitor stopped");
    }

    /// One check pass: sample every zone, then the tank gate, then water the
    /// dry ones in zone id order. Sampling comes first so the status surface
    /// keeps fresh readings even while a low tank blocks watering.
    async fn run_check_pass(&self, token: &CancelToken) {
        let readings = self.sample_zones();
        self.cache_readings(&readings);

        if !self.tank_ok().await {
            return;
        }

        let mut dry: Vec<(u8, f64)> = Vec::new();
        for reading in &readings {
            let threshold = zone_threshold(&self.thresholds, reading.zone_id);
            if reading.moisture < threshold {
                dry.push((reading.zone_id, reading.moisture));
                self.alert(AlertEvent {
                    ts: chrono::Local::now(),
                    level: AlertLevel::Warning,
                    kind: AlertKind::LowMoisture,
                    message: format!(
                        "zone {} moisture {:.1}% below threshold {:.1}%",
                        reading.zone_id, reading.moisture, threshold
                    ),
                    zone_id: Some(reading.zone_id),
                    tank_id: None,
                    value: Some(reading.moisture),
                });
            }
        }

        if dry.is_empty() {
            return;
        }
        // Zone id order, deterministic across passes.
        dry.sort_by_key(|&(zone_id, _)| zone_id);
        info!(count = dry.len(), "dry zones found, watering in zone order");

        for (i, &(zone_id, moisture)) in dry.iter().enumerate() {
            if token.is_cancelled() {
                return;
            }
            match self
                .irrigator
                .irrigate(zone_id, self.cfg.default_duration, Trigger::Auto)
                .await
            {
                Ok(_) => {}
                Err(RigError::InterlockBusy { current_zone }) => {
                    // A manual or scheduled session got there first. The
                    // zone stays dry and the next pass retries it.
                    warn!(
                        zone = zone_id,
                        busy_zone = ?current_zone,
                        "interlock busy, zone skipped this pass"
                    );
                }
                Err(e) => {
                    // Relay faults end the pass; the actuator has already
                    // forced an emergency stop.
                    warn!(zone = zone_id, moisture, "auto irrigation failed: {e}");
                    self.alert(AlertEvent {
                        ts: chrono::Local::now(),
                        level: AlertLevel::Critical,
                        kind: AlertKind::RelayFault,
                        message: format!("zone {zone_id}: irrigation failed: {e}"),
                        zone_id: Some(zone_id),
                        tank_id: None,
                        value: None,
                    });
                    return;
                }
            }
            let last = i + 1 == dry.len();
            if !last && !token.sleep(self.cfg.zone_interval).await {
                return;
            }
        }
    }

    /// Tank gate. An unreadable level counts as a failure: watering blind
    /// against a possibly-empty tank risks running the pump dry.
    async fn tank_ok(&self) -> bool {
        let level = {
            let mut sensors = lock(&self.sensors);
            sensors.read_tank_level(self.cfg.tank_id)
        };
        match level {
            Some(level) if level >= self.cfg.min_tank_level => true,
            Some(level) => {
                warn!(
                    tank = self.cfg.tank_id,
                    level,
                    min = self.cfg.min_tank_level,
                    "tank below minimum, check pass aborted"
                );
                self.events.write().await.record(
                    EventKind::Sensor,
                    format!("tank {} at {level:.1}%, pass aborted", self.cfg.tank_id),
                );
                self.alert(AlertEvent {
                    ts: chrono::Local::now(),
                    level: AlertLevel::Critical,
                    kind: AlertKind::TankLow,
                    message: format!(
                        "tank {} at {level:.1}%, below minimum {:.1}%",
                        self.cfg.tank_id, self.cfg.min_tank_level
                    ),
                    zone_id: None,
                    tank_id: Some(self.cfg.tank_id),
                    value: Some(level),
                });
                false
            }
            None => {
                let err = RigError::TankLevelUnavailable {
                    tank: self.cfg.tank_id,
                };
                warn!("{err}, check pass aborted");
                self.events
                    .write()
                    .await
                    .record(EventKind::Error, format!("{err}, pass aborted"));
                self.alert(AlertEvent {
                    ts: chrono::Local::now(),
                    level: AlertLevel::Critical,
                    kind: AlertKind::TankUnavailable,
                    message: err.to_string(),
                    zone_id: None,
                    tank_id: Some(self.cfg.tank_id),
                    value: None,
                });
                false
            }
        }
    }

    /// Read every configured zone. A failed zone is skipped for this pass;
    /// the rest of the pass continues.
    fn sample_zones(&self) -> Vec<ZoneReading> {
        let mut sensors = lock(&self.sensors);
        let mut readings = Vec::with_capacity(self.zone_ids.len());
        for &zone_id in &self.zone_ids {
            match sensors.read_zone(zone_id) {
                Ok(sample) => readings.push(ZoneReading::new(zone_id, sample)),
                Err(e) => warn!(zone = zone_id, "zone skipped this pass: {e}"),
            }
        }
        readings
    }

    fn cache_readings(&self, readings: &[ZoneReading]) {
        let mut cache = self
            .last_readings
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for reading in readings {
            cache.insert(reading.zone_id, reading.clone());
        }
    }

    fn alert(&self, event: AlertEvent) {
        (self.alerts)(event);
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ===========================================================================
// Tests
// ===========================================================================
