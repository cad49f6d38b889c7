//! Schedule engine: evaluates the persisted schedule list on a fixed tick,
//! deduplicates occurrences by hour bucket, and executes due jobs through
//! the interlocked actuator on a dedicated worker.
//!
//! The tick loop never actuates hardware itself: due entries become
//! [`IrrigationJob`]s on a FIFO queue so a long irrigation can never stall
//! schedule evaluation. The worker waits for the interlock in bounded
//! 10-second polls and drops the job past a hard one-hour ceiling: a home
//! rig missing one occurrence beats an unbounded queue buildup.

use chrono::{Local, NaiveDateTime};
use serde::Serialize;
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::cancel::CancelToken;
use crate::error::RigError;
use crate::interlock::{Irrigator, Trigger};
use crate::schedule::GRACE_SECONDS;
use crate::sensor::SensorPort;
use crate::state::{zone_threshold, EventKind, SharedEvents, SharedThresholds};
use crate::store::ScheduleStore;

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    /// How often the schedule list is evaluated.
    pub tick_interval: Duration,
    /// Tolerance after a scheduled time during which a check still fires.
    pub grace_secs: i64,
    /// Poll interval while waiting for the interlock.
    pub interlock_wait: Duration,
    /// Hard ceiling on interlock waiting; the job is dropped past it.
    pub interlock_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(30),
            grace_secs: GRACE_SECONDS,
            interlock_wait: Duration::from_secs(10),
            interlock_timeout: Duration::from_secs(3600),
        }
    }
}

// ---------------------------------------------------------------------------
// Jobs & dedup
// ---------------------------------------------------------------------------

/// Ephemeral queue entry for one due occurrence.
#[derive(Debug, Clone)]
pub struct IrrigationJob {
    pub schedule_id: u32,
    pub zone_id: u8,
    pub duration: Duration,
    pub check_moisture: bool,
    pub trigger: Trigger,
}

/// Upcoming run, as returned by `next_schedules`.
#[derive(Debug, Clone, Serialize)]
pub struct UpcomingRun {
    pub schedule_id: u32,
    pub zone_id: u8,
    pub start: NaiveDateTime,
    pub duration_sec: u32,
}

/// `(entry id, "YYYY-MM-DD HH")` pairs already enqueued, bounded so a
/// long-running engine cannot grow without limit. Rebuilt empty on restart.
struct DedupSet {
    seen: HashSet<(u32, String)>,
    order: VecDeque<(u32, String)>,
    cap: usize,
}

impl DedupSet {
    fn new(cap: usize) -> Self {
        Self {
            seen: HashSet::new(),
            order: VecDeque::new(),
            cap,
        }
    }

    fn contains(&self, key: &(u32, String)) -> bool {
        self.seen.contains(key)
    }

    /// Returns true if the key was not seen before.
    fn insert(&mut self, key: (u32, String)) -> bool {
        if !self.seen.insert(key.clone()) {
            return false;
        }
        self.order.push_back(key);
        if self.order.len() > self.cap {
            // Evict the oldest half in one sweep.
            for _ in 0..self.cap / 2 {
                if let Some(old) = self.order.pop_front() {
                    self.seen.remove(&old);
                }
            }
        }
        true
    }

    fn len(&self) -> usize {
        self.seen.len()
    }
}

fn hour_bucket(now: NaiveDateTime) -> String {
    now.format("%Y-%m-%d %H").to_string()
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct ScheduleEngine {
    store: Arc<ScheduleStore>,
    irrigator: Arc<Irrigator>,
    sensors: Arc<Mutex<Box<dyn SensorPort>>>,
    thresholds: SharedThresholds,
    events: SharedEvents,
    cfg: EngineConfig,
    cancel: CancelToken,
    dedup: Mutex<DedupSet>,
    tx: mpsc::UnboundedSender<IrrigationJob>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<IrrigationJob>>>,
    handles: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl ScheduleEngine {
    pub fn new(
        store: Arc<ScheduleStore>,
        irrigator: Arc<Irrigator>,
        sensors: Arc<Mutex<Box<dyn SensorPort>>>,
        thresholds: SharedThresholds,
        events: SharedEvents,
        cfg: EngineConfig,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            store,
            irrigator,
            sensors,
            thresholds,
            events,
            cfg,
            cancel: CancelToken::new(),
            dedup: Mutex::new(DedupSet::new(500)),
            tx,
            rx: Mutex::new(Some(rx)),
            handles: tokio::sync::Mutex::new(Vec::new()),
        })
    }

    /// Spawn the tick loop and the job worker.
    pub async fn start(self: &Arc<Self>) {
        let mut handles = self.handles.lock().await;
        if !handles.is_empty() {
            warn!("schedule engine already started");
            return;
        }

        let rx = self
            .rx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        let Some(rx) = rx else {
            warn!("schedule engine receiver already consumed");
            return;
        };

        info!(
            tick_sec = self.cfg.tick_interval.as_secs(),
            grace_sec = self.cfg.grace_secs,
            "schedule engine started"
        );

        let ticker = Arc::clone(self);
        handles.push(tokio::spawn(async move { ticker.tick_loop().await }));

        let worker = Arc::clone(self);
        handles.push(tokio::spawn(async move { worker.worker_loop(rx).await }));
    }

    /// Signal no-new-ticks and wait for both tasks. A job already handed to
    /// the actuator completes under the actuator's own cleanup guarantees.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let mut handles = self.handles.lock().await;
        for handle in handles.drain(..) {
            let _ = handle.await;
        }
        info!("schedule engine stopped");
    }

    /// Soonest future occurrence per enabled entry, ascending, capped at
    /// `limit`.
    pub fn next_schedules(&self, limit: usize) -> Vec<UpcomingRun> {
        let now = Local::now().naive_local();
        let mut upcoming: Vec<UpcomingRun> = self
            .store
            .list()
            .into_iter()
            .filter(|e| e.enabled)
            .filter_map(|e| {
                e.next_occurrence(now).map(|start| UpcomingRun {
                    schedule_id: e.id,
                    zone_id: e.zone_id,
                    start,
                    duration_sec: e.duration_sec,
                })
            })
            .collect();
        upcoming.sort_by_key(|u| u.start);
        upcoming.truncate(limit);
        upcoming
    }

    // -- loops --------------------------------------------------------------

    async fn tick_loop(self: Arc<Self>) {
        loop {
            let enqueued = self.tick_once(Local::now().naive_local()).await;
            if enqueued > 0 {
                info!(enqueued, "schedule tick enqueued jobs");
            }
            if !self.cancel.sleep(self.cfg.tick_interval).await {
                break;
            }
        }
    }

    /// Evaluate every entry against `now`, enqueue the due ones not yet seen
    /// in this hour bucket. Returns the number of jobs enqueued.
    async fn tick_once(&self, now: NaiveDateTime) -> usize {
        let bucket = hour_bucket(now);
        let mut enqueued = 0;

        for entry in self.store.list() {
            if !entry.due(now, self.cfg.grace_secs) {
                continue;
            }
            let key = (entry.id, bucket.clone());
            let seen = {
                let dedup = self
                    .dedup
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                dedup.contains(&key)
            };
            if seen {
                continue;
            }

            let job = IrrigationJob {
                schedule_id: entry.id,
                zone_id: entry.zone_id,
                duration: Duration::from_secs(entry.duration_sec as u64),
                check_moisture: entry.check_moisture(),
                trigger: Trigger::Schedule,
            };
            // The key is marked seen only once the job is on the queue; a
            // failed enqueue leaves the occurrence eligible for a later tick.
            if self.tx.send(job).is_err() {
                warn!(schedule = entry.id, "job queue closed, occurrence not enqueued");
                continue;
            }
            self.dedup
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .insert(key);
            enqueued += 1;

            info!(
                schedule = entry.id,
                zone = entry.zone_id,
                duration_sec = entry.duration_sec,
                "schedule due, job enqueued"
            );
            self.events.write().await.record(
                EventKind::Scheduler,
                format!("schedule #{}: due, queued for zone {}", entry.id, entry.zone_id),
            );
        }
        enqueued
    }

    async fn worker_loop(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<IrrigationJob>) {
        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            match tokio::time::timeout(Duration::from_secs(1), rx.recv()).await {
                Ok(Some(job)) => self.execute_job(job).await,
                Ok(None) => break,
                Err(_) => continue, // idle, re-check the cancel token
            }
        }
    }

    async fn execute_job(&self, job: IrrigationJob) {
        if job.check_moisture && self.moist_enough(job.zone_id).await {
            return;
        }

        let mut waited = Duration::ZERO;
        loop {
            if self.cancel.is_cancelled() {
                return;
            }
            if !self.irrigator.is_irrigating() {
                match self
                    .irrigator
                    .irrigate(job.zone_id, job.duration, job.trigger)
                    .await
                {
                    Ok(entry) => {
                        info!(
                            schedule = job.schedule_id,
                            zone = job.zone_id,
                            status = ?entry.status,
                            "scheduled irrigation finished"
                        );
                        return;
                    }
                    // Lost the acquisition race to another caller: keep
                    // waiting against the same ceiling.
                    Err(RigError::InterlockBusy { .. }) => {}
                    Err(e) => {
                        warn!(
                            schedule = job.schedule_id,
                            zone = job.zone_id,
                            "scheduled irrigation failed: {e}"
                        );
                        return;
                    }
                }
            }
            if waited >= self.cfg.interlock_timeout {
                let err = RigError::InterlockTimeout(waited);
                warn!(
                    schedule = job.schedule_id,
                    zone = job.zone_id,
                    "dropping job: {err}"
                );
                self.events.write().await.record(
                    EventKind::Scheduler,
                    format!("schedule #{}: dropped, {err}", job.schedule_id),
                );
                return;
            }
            if !self.cancel.sleep(self.cfg.interlock_wait).await {
                return;
            }
            waited += self.cfg.interlock_wait;
        }
    }

    /// Routine pre-check: true when the zone's current moisture is at or
    /// above its threshold, i.e. irrigation should be skipped. A failed
    /// read lets the job proceed: a missed watering is the worse outcome.
    async fn moist_enough(&self, zone_id: u8) -> bool {
        let sample = {
            let mut sensors = self
                .sensors
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            sensors.read_zone(zone_id)
        };
        match sample {
            Ok(sample) => {
                let threshold = zone_threshold(&self.thresholds, zone_id);
                if sample.moisture >= threshold {
                    info!(
                        zone = zone_id,
                        moisture = sample.moisture,
                        threshold,
                        "moisture adequate, skipping scheduled irrigation"
                    );
                    self.events.write().await.record(
                        EventKind::Scheduler,
                        format!(
                            "zone {zone_id}: skipped, moisture {:.1}% >= {threshold:.1}%",
                            sample.moisture
                        ),
                    );
                    true
                } else {
                    false
                }
            }
            Err(e) => {
                warn!(zone = zone_id, "moisture pre-check failed, proceeding: {e}");
                false
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
