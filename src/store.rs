//! Persisted schedule store: the canonical list of schedule entries, held
//! in memory and mirrored to a JSON document on every mutation.
//!
//! Wire format: `{"schedules": [ ... ]}`. A missing file is an empty list;
//! a malformed file is an error at startup rather than a silent wipe.

use anyhow::{Context, Result};
use chrono::Local;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::info;

use crate::error::RigError;
use crate::schedule::{ScheduleEntry, ScheduleKind};

// ---------------------------------------------------------------------------
// Wire document
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize, Default)]
struct ScheduleDoc {
    schedules: Vec<ScheduleEntry>,
}

/// Fields a caller supplies when creating or replacing an entry; id and
/// creation timestamp are assigned by the store.
#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleSpec {
    #[serde(flatten)]
    pub kind: ScheduleKind,
    pub zone_id: u8,
    #[serde(rename = "duration")]
    pub duration_sec: u32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

pub struct ScheduleStore {
    path: PathBuf,
    known_zones: BTreeSet<u8>,
    entries: Mutex<Vec<ScheduleEntry>>,
}

impl ScheduleStore {
    /// Load the store from `path`. A missing file starts empty.
    pub fn load(path: impl Into<PathBuf>, known_zones: BTreeSet<u8>) -> Result<Self> {
        let path = path.into();
        let entries = if path.exists() {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let doc: ScheduleDoc = serde_json::from_str(&raw)
                .with_context(|| format!("malformed schedule store {}", path.display()))?;
            doc.schedules
        } else {
            Vec::new()
        };

        info!(
            path = %path.display(),
            entries = entries.len(),
            "schedule store loaded"
        );

        Ok(Self {
            path,
            known_zones,
            entries: Mutex::new(entries),
        })
    }

    /// Snapshot of all entries.
    pub fn list(&self) -> Vec<ScheduleEntry> {
        self.entries().clone()
    }

    pub fn get(&self, id: u32) -> Option<ScheduleEntry> {
        self.entries().iter().find(|e| e.id == id).cloned()
    }

    /// Validate and append a new entry, assigning the next id.
    pub fn add(&self, spec: ScheduleSpec) -> Result<ScheduleEntry, RigError> {
        let mut entries = self.entries();
        let id = entries.iter().map(|e| e.id).max().unwrap_or(0) + 1;
        let entry = self.build_entry(id, spec)?;
        entries.push(entry.clone());
        self.persist(&entries)?;
        info!(id, zone = entry.zone_id, "schedule added");
        Ok(entry)
    }

    /// Replace the fields of an existing entry; id and created_at survive.
    pub fn update(&self, id: u32, spec: ScheduleSpec) -> Result<ScheduleEntry, RigError> {
        let mut entries = self.entries();
        let pos = entries
            .iter()
            .position(|e| e.id == id)
            .ok_or(RigError::NotFound(id))?;
        let mut entry = self.build_entry(id, spec)?;
        entry.created_at = entries[pos].created_at;
        entries[pos] = entry.clone();
        self.persist(&entries)?;
        info!(id, "schedule updated");
        Ok(entry)
    }

    pub fn delete(&self, id: u32) -> Result<(), RigError> {
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|e| e.id != id);
        if entries.len() == before {
            return Err(RigError::NotFound(id));
        }
        self.persist(&entries)?;
        info!(id, "schedule deleted");
        Ok(())
    }

    /// Flip the enabled flag; returns the new value.
    pub fn toggle(&self, id: u32) -> Result<bool, RigError> {
        let mut entries = self.entries();
        let entry = entries
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or(RigError::NotFound(id))?;
        entry.enabled = !entry.enabled;
        let enabled = entry.enabled;
        self.persist(&entries)?;
        info!(id, enabled, "schedule toggled");
        Ok(enabled)
    }

    // -- internals ----------------------------------------------------------

    fn entries(&self) -> std::sync::MutexGuard<'_, Vec<ScheduleEntry>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn build_entry(&self, id: u32, spec: ScheduleSpec) -> Result<ScheduleEntry, RigError> {
        let entry = ScheduleEntry {
            id,
            kind: spec.kind,
            zone_id: spec.zone_id,
            duration_sec: spec.duration_sec,
            enabled: spec.enabled,
            created_at: Local::now(),
        };
        entry.validate()?;
        if !self.known_zones.contains(&entry.zone_id) {
            return Err(RigError::validation(format!(
                "unknown zone {}",
                entry.zone_id
            )));
        }
        Ok(entry)
    }

    fn persist(&self, entries: &[ScheduleEntry]) -> Result<(), RigError> {
        let doc = ScheduleDoc {
            schedules: entries.to_vec(),
        };
        let json = serde_json::to_string_pretty(&doc)
            .map_err(|e| RigError::Store(e.to_string()))?;
        write_atomically(&self.path, &json).map_err(|e| RigError::Store(e.to_string()))
    }
}

/// Write via a sibling temp file and rename, so a crash mid-write cannot
/// truncate the canonical file.
pub(crate) fn write_atomically(path: &Path, contents: &str) -> std::io::Result<()> {
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, contents)?;
    std::fs::rename(&tmp, path)
}

// ===========================================================================
// Tests
// ===========================================================================
