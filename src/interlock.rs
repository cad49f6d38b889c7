//! The interlocked actuator: the only path by which pump/valve state
//! changes for irrigation. Guarantees at most one session at a time and
//! that every exit path (completion, relay fault, emergency stop) ends
//! with the zone valve and pump switched off before the interlock is
//! released.
//!
//! Acquisition is an atomic test-and-set under one mutex hold, never a
//! check-then-act across two locks. Cleanup ordering is valve off, then
//! pump off, reversing the start sequence.

use chrono::{DateTime, Local};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::error::RigError;
use crate::relay::{RelayOutput, RelayPort};
use crate::state::{EventKind, SharedEvents};

/// Maximum number of history entries retained.
const MAX_HISTORY: usize = 200;

/// Lock a mutex, recovering the inner value if a previous holder panicked.
fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// What asked for the irrigation session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Trigger {
    Auto,
    Manual,
    Schedule,
}

impl std::fmt::Display for Trigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Auto => write!(f, "auto"),
            Self::Manual => write!(f, "manual"),
            Self::Schedule => write!(f, "schedule"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Success,
    Interrupted,
    Error,
}

/// How the hold phase ended. Faults are carried in the `Err` channel, so
/// this never names an error state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionOutcome {
    Completed,
    Interrupted,
}

/// Immutable record of one irrigation attempt.
#[derive(Debug, Clone, Serialize)]
pub struct HistoryEntry {
    pub zone_id: u8,
    pub start_time: DateTime<Local>,
    pub end_time: DateTime<Local>,
    pub requested_sec: u64,
    pub actual_sec: f64,
    pub status: SessionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub trigger: Trigger,
}

/// Invariant: `current_zone` is `Some` iff `is_irrigating`.
#[derive(Debug, Clone, Copy, Default)]
pub struct InterlockState {
    pub is_irrigating: bool,
    pub current_zone: Option<u8>,
}

#[derive(Debug, Clone, Copy)]
pub struct IrrigatorConfig {
    /// Pause between pump start and valve open, and between valve close and
    /// pump stop.
    pub settle: Duration,
    /// Safety ceiling: requested durations are clamped to this.
    pub max_duration: Duration,
    /// Granularity of stop checks inside the duration sleep.
    pub poll_interval: Duration,
}

impl Default for IrrigatorConfig {
    fn default() -> Self {
        Self {
            settle: Duration::from_millis(500),
            max_duration: Duration::from_secs(1800),
            poll_interval: Duration::from_secs(1),
        }
    }
}

// ---------------------------------------------------------------------------
// Irrigator
// ---------------------------------------------------------------------------

pub struct Irrigator {
    relay: Mutex<Box<dyn RelayPort>>,
    interlock: Mutex<InterlockState>,
    /// Bumped by `emergency_stop`; an in-flight session compares against its
    /// start-of-session snapshot to detect the stop.
    stop_epoch: AtomicU64,
    history: Mutex<VecDeque<HistoryEntry>>,
    events: SharedEvents,
    cfg: IrrigatorConfig,
}

/// Releases the interlock flag when the session scope ends, whatever the
/// exit path. Physical cleanup happens before this drops.
struct SessionGuard<'a> {
    irrigator: &'a Irrigator,
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        let mut st = lock(&self.irrigator.interlock);
        st.is_irrigating = false;
        st.current_zone = None;
    }
}

impl Irrigator {
    pub fn new(relay: Box<dyn RelayPort>, events: SharedEvents, cfg: IrrigatorConfig) -> Self {
        Self {
            relay: Mutex::new(relay),
            interlock: Mutex::new(InterlockState::default()),
            stop_epoch: AtomicU64::new(0),
            history: Mutex::new(VecDeque::with_capacity(MAX_HISTORY)),
            events,
            cfg,
        }
    }

    pub fn is_irrigating(&self) -> bool {
        lock(&self.interlock).is_irrigating
    }

    pub fn interlock_state(&self) -> InterlockState {
        *lock(&self.interlock)
    }

    /// Newest-first history snapshot.
    pub fn history(&self, limit: usize) -> Vec<HistoryEntry> {
        lock(&self.history).iter().rev().take(limit).cloned().collect()
    }

    /// Run one irrigation session: pump on, settle, zone valve on, hold for
    /// `duration`, then shut down in reverse order. Rejects with
    /// [`RigError::InterlockBusy`] if a session is already active.
    ///
    /// Exactly one history record is produced per call that acquires the
    /// interlock.
    pub async fn irrigate(
        &self,
        zone_id: u8,
        duration: Duration,
        trigger: Trigger,
    ) -> Result<HistoryEntry, RigError> {
        let requested_sec = duration.as_secs();
        let duration = if duration > self.cfg.max_duration {
            warn!(
                zone = zone_id,
                requested_sec,
                ceiling_sec = self.cfg.max_duration.as_secs(),
                "requested duration exceeds safety ceiling, clamping"
            );
            self.cfg.max_duration
        } else {
            duration
        };

        let _guard = self.acquire(zone_id)?;
        let epoch = self.stop_epoch.load(Ordering::SeqCst);

        info!(zone = zone_id, duration_sec = duration.as_secs(), %trigger, "irrigation start");

        let start_time = Local::now();
        let started = Instant::now();

        let session = self.run_session(zone_id, duration, epoch).await;

        // Unconditional shutdown on every exit path: valve off, then pump
        // off. Runs before the interlock guard releases.
        let shutdown = self.shutdown_outputs(zone_id);

        let (status, error) = match (&session, &shutdown) {
            (Ok(SessionOutcome::Completed), Ok(())) => (SessionStatus::Success, None),
            (Ok(SessionOutcome::Interrupted), Ok(())) => (SessionStatus::Interrupted, None),
            (Ok(_), Err(e)) => (SessionStatus::Error, Some(e.to_string())),
            (Err(e), _) => (SessionStatus::Error, Some(e.to_string())),
        };

        if status == SessionStatus::Error {
            // A relay write failed somewhere: the bus state is suspect, so
            // force every output, not just this zone, to the safe default.
            error!(
                zone = zone_id,
                error = error.as_deref().unwrap_or(""),
                "relay fault during session, forcing emergency stop"
            );
            lock(&self.relay).emergency_stop();
        }

        let entry = HistoryEntry {
            zone_id,
            start_time,
            end_time: Local::now(),
            requested_sec,
            actual_sec: started.elapsed().as_secs_f64(),
            status,
            error: error.clone(),
            trigger,
        };
        self.push_history(entry.clone());

        {
            let mut ev = self.events.write().await;
            match status {
                SessionStatus::Success => ev.record(
                    EventKind::Irrigation,
                    format!("zone {zone_id}: irrigated {requested_sec}s ({trigger})"),
                ),
                SessionStatus::Interrupted => ev.record(
                    EventKind::Irrigation,
                    format!("zone {zone_id}: irrigation interrupted ({trigger})"),
                ),
                SessionStatus::Error => ev.record(
                    EventKind::Error,
                    format!(
                        "zone {zone_id}: irrigation failed: {}",
                        error.as_deref().unwrap_or("unknown")
                    ),
                ),
            }
        }

        match status {
            SessionStatus::Error => Err(RigError::RelayWrite(
                entry.error.clone().unwrap_or_else(|| "relay fault".into()),
            )),
            _ => {
                info!(zone = zone_id, ?status, actual_sec = entry.actual_sec, "irrigation done");
                Ok(entry)
            }
        }
    }

    /// Stop everything, now. Forces all relay outputs to their safe default
    /// synchronously and wakes any in-flight duration sleep. The interlock
    /// is NOT cleared here: the interrupted session still owns it until its
    /// own cleanup has run, and releases it within one poll interval. A
    /// session acquired after the stop therefore never has its outputs
    /// touched by a stale shutdown.
    pub fn emergency_stop(&self) {
        warn!("emergency stop");
        self.stop_epoch.fetch_add(1, Ordering::SeqCst);
        lock(&self.relay).emergency_stop();
    }

    // -- internals ----------------------------------------------------------

    fn acquire(&self, zone_id: u8) -> Result<SessionGuard<'_>, RigError> {
        let mut st = lock(&self.interlock);
        if st.is_irrigating {
            return Err(RigError::InterlockBusy {
                current_zone: st.current_zone,
            });
        }
        st.is_irrigating = true;
        st.current_zone = Some(zone_id);
        Ok(SessionGuard { irrigator: self })
    }

    async fn run_session(
        &self,
        zone_id: u8,
        duration: Duration,
        epoch: u64,
    ) -> Result<SessionOutcome, RigError> {
        self.relay_set(RelayOutput::Pump, true)?;
        if !self.sleep_unless_stopped(self.cfg.settle, epoch).await {
            return Ok(SessionOutcome::Interrupted);
        }
        self.relay_set(RelayOutput::Zone(zone_id), true)?;
        if !self.sleep_unless_stopped(duration, epoch).await {
            return Ok(SessionOutcome::Interrupted);
        }
        Ok(SessionOutcome::Completed)
    }

    fn relay_set(&self, output: RelayOutput, on: bool) -> Result<(), RigError> {
        lock(&self.relay).set(output, on)
    }

    /// Both writes are attempted even if the first fails.
    fn shutdown_outputs(&self, zone_id: u8) -> Result<(), RigError> {
        let mut relay = lock(&self.relay);
        let valve = relay.set(RelayOutput::Zone(zone_id), false);
        let pump = relay.set(RelayOutput::Pump, false);
        valve.and(pump)
    }

    /// Sleep for `dur`, waking early if the stop epoch moves past the
    /// session's snapshot. Returns `false` on a stop.
    async fn sleep_unless_stopped(&self, dur: Duration, epoch: u64) -> bool {
        let mut remaining = dur;
        loop {
            if self.stop_epoch.load(Ordering::SeqCst) != epoch {
                return false;
            }
            if remaining.is_zero() {
                return true;
            }
            let slice = remaining.min(self.cfg.poll_interval);
            tokio::time::sleep(slice).await;
            remaining = remaining.saturating_sub(slice);
        }
    }

    fn push_history(&self, entry: HistoryEntry) {
        let mut history = lock(&self.history);
        if history.len() >= MAX_HISTORY {
            history.pop_front();
        }
        history.push_back(entry);
    }
}

// ===========================================================================
// Tests
// ===========================================================================
