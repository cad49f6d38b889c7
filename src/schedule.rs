//! Schedule entry model and due-time math.
//!
//! Two kinds of entry exist: `Weekly` fires on selected weekdays at a fixed
//! time, `Routine` fires every `interval_days` from an anchor date/time.
//! Both use a bounded grace window: a check that lands within
//! `grace_secs` after the scheduled instant still counts as due, anything
//! later is silently skipped for that occurrence.

use chrono::{DateTime, Datelike, Days, Local, NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::error::RigError;

/// Default tolerance after a scheduled time during which a late check still
/// counts as due.
pub const GRACE_SECONDS: i64 = 600;

const SECS_PER_DAY: i64 = 86_400;

// ---------------------------------------------------------------------------
// Model
// ---------------------------------------------------------------------------

/// Entry kind, tagged `"schedule"` / `"routine"` on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ScheduleKind {
    /// Fires on the given weekdays (0 = Monday … 6 = Sunday) at `start_time`.
    #[serde(rename = "schedule")]
    Weekly {
        days: BTreeSet<u8>,
        start_time: String,
    },
    /// Fires every `interval_days` from `start_date` at `start_time`.
    Routine {
        start_date: NaiveDate,
        start_time: String,
        interval_days: u32,
        #[serde(default)]
        check_moisture: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleEntry {
    pub id: u32,
    #[serde(flatten)]
    pub kind: ScheduleKind,
    pub zone_id: u8,
    #[serde(rename = "duration")]
    pub duration_sec: u32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub created_at: DateTime<Local>,
}

fn default_enabled() -> bool {
    true
}

/// Parse "HH:MM". Trailing garbage and out-of-range values are rejected.
pub fn parse_hhmm(s: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(s, "%H:%M").ok()
}

impl ScheduleEntry {
    pub fn start_time_str(&self) -> &str {
        match &self.kind {
            ScheduleKind::Weekly { start_time, .. } => start_time,
            ScheduleKind::Routine { start_time, .. } => start_time,
        }
    }

    /// Whether this entry wants a moisture pre-check before executing.
    /// Routine-only by design; Weekly entries always run.
    pub fn check_moisture(&self) -> bool {
        matches!(
            self.kind,
            ScheduleKind::Routine {
                check_moisture: true,
                ..
            }
        )
    }

    /// Field-level validation, independent of zone configuration.
    pub fn validate(&self) -> Result<(), RigError> {
        let time = self.start_time_str();
        if parse_hhmm(time).is_none() {
            return Err(RigError::validation(format!(
                "start_time '{time}' is not HH:MM"
            )));
        }
        if self.duration_sec == 0 {
            return Err(RigError::validation("duration must be positive"));
        }
        match &self.kind {
            ScheduleKind::Weekly { days, .. } => {
                if days.is_empty() {
                    return Err(RigError::validation("weekly entry needs at least one day"));
                }
                if let Some(d) = days.iter().find(|&&d| d > 6) {
                    return Err(RigError::validation(format!(
                        "weekday {d} out of range 0-6"
                    )));
                }
            }
            ScheduleKind::Routine { interval_days, .. } => {
                if *interval_days == 0 {
                    return Err(RigError::validation("interval_days must be >= 1"));
                }
            }
        }
        Ok(())
    }

    /// Is this entry due at `now`, within `grace_secs` after its scheduled
    /// time? Disabled entries are never due.
    pub fn due(&self, now: NaiveDateTime, grace_secs: i64) -> bool {
        if !self.enabled {
            return false;
        }
        let Some(time) = parse_hhmm(self.start_time_str()) else {
            return false;
        };
        match &self.kind {
            ScheduleKind::Weekly { days, .. } => {
                let weekday = now.weekday().num_days_from_monday() as u8;
                if !days.contains(&weekday) {
                    return false;
                }
                let target = now.date().and_time(time);
                let delta = (now - target).num_seconds();
                (0..=grace_secs).contains(&delta)
            }
            ScheduleKind::Routine {
                start_date,
                interval_days,
                ..
            } => {
                let anchor = start_date.and_time(time);
                if now < anchor {
                    return false;
                }
                let phase =
                    (now - anchor).num_seconds() % (*interval_days as i64 * SECS_PER_DAY);
                (0..=grace_secs).contains(&phase)
            }
        }
    }

    /// Soonest occurrence strictly after `now`, scanning up to 7 days ahead.
    pub fn next_occurrence(&self, now: NaiveDateTime) -> Option<NaiveDateTime> {
        let time = parse_hhmm(self.start_time_str())?;
        for offset in 0..=7u64 {
            let date = now.date().checked_add_days(Days::new(offset))?;
            let candidate = date.and_time(time);
            if candidate <= now {
                continue;
            }
            let matches = match &self.kind {
                ScheduleKind::Weekly { days, .. } => {
                    days.contains(&(candidate.weekday().num_days_from_monday() as u8))
                }
                ScheduleKind::Routine {
                    start_date,
                    interval_days,
                    ..
                } => {
                    let anchor = start_date.and_time(time);
                    candidate >= anchor
                        && (candidate - anchor).num_seconds()
                            % (*interval_days as i64 * SECS_PER_DAY)
                            == 0
                }
            };
            if matches {
                return Some(candidate);
            }
        }
        None
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn at(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").unwrap()
    }

    fn weekly(days: &[u8], start_time: &str) -> ScheduleEntry {
        ScheduleEntry {
            id: 1,
            kind: ScheduleKind::Weekly {
                days: days.iter().copied().collect(),
                start_time: start_time.into(),
            },
            zone_id: 1,
            duration_sec: 300,
            enabled: true,
            created_at: Local::now(),
        }
    }

    fn routine(start_date: &str, start_time: &str, interval_days: u32) -> ScheduleEntry {
        ScheduleEntry {
            id: 2,
            kind: ScheduleKind::Routine {
                start_date: NaiveDate::parse_from_str(start_date, "%Y-%m-%d").unwrap(),
                start_time: start_time.into(),
                interval_days,
                check_moisture: false,
            },
            zone_id: 2,
            duration_sec: 300,
            enabled: true,
            created_at: Local::now(),
        }
    }

    // -- parse_hhmm ---------------------------------------------------------

    #[test]
    fn parse_hhmm_accepts_valid_times() {
        assert_eq!(
            parse_hhmm("06:00"),
            Some(NaiveTime::from_hms_opt(6, 0, 0).unwrap())
        );
        assert_eq!(
            parse_hhmm("23:59"),
            Some(NaiveTime::from_hms_opt(23, 59, 0).unwrap())
        );
    }

    #[test]
    fn parse_hhmm_rejects_garbage() {
        assert_eq!(parse_hhmm("25:00"), None);
        assert_eq!(parse_hhmm("06:61"), None);
        assert_eq!(parse_hhmm("06:00:30"), None);
        assert_eq!(parse_hhmm("dawn"), None);
        assert_eq!(parse_hhmm(""), None);
    }

    // -- weekly grace window ------------------------------------------------

    #[test]
    fn weekly_due_inside_grace_window() {
        // 2026-01-06 is a Tuesday (weekday 1).
        let entry = weekly(&[1], "06:00");
        assert!(entry.due(at("2026-01-06 06:00:00"), 600));
        assert!(entry.due(at("2026-01-06 06:09:59"), 600));
    }

    #[test]
    fn weekly_not_due_past_grace_window() {
        let entry = weekly(&[1], "06:00");
        assert!(!entry.due(at("2026-01-06 06:10:01"), 600));
    }

    #[test]
    fn weekly_not_due_before_start_time() {
        let entry = weekly(&[1], "06:00");
        assert!(!entry.due(at("2026-01-06 05:59:59"), 600));
    }

    #[test]
    fn weekly_not_due_on_wrong_day() {
        // 2026-01-07 is a Wednesday.
        let entry = weekly(&[1], "06:00");
        assert!(!entry.due(at("2026-01-07 06:00:30"), 600));
    }

    #[test]
    fn disabled_entry_is_never_due() {
        let mut entry = weekly(&[1], "06:00");
        entry.enabled = false;
        assert!(!entry.due(at("2026-01-06 06:00:30"), 600));
    }

    // -- routine interval ---------------------------------------------------

    #[test]
    fn routine_due_on_interval_boundary() {
        let entry = routine("2026-01-01", "00:00", 3);
        // Three days after the anchor, 30 s past the hour: phase = 30 s.
        assert!(entry.due(at("2026-01-04 00:00:30"), 600));
    }

    #[test]
    fn routine_not_due_past_grace() {
        let entry = routine("2026-01-01", "00:00", 3);
        assert!(!entry.due(at("2026-01-04 00:10:01"), 600));
    }

    #[test]
    fn routine_not_due_off_interval() {
        let entry = routine("2026-01-01", "00:00", 3);
        assert!(!entry.due(at("2026-01-03 00:00:30"), 600));
        assert!(!entry.due(at("2026-01-05 00:00:30"), 600));
    }

    #[test]
    fn routine_not_due_before_anchor() {
        let entry = routine("2026-06-01", "08:00", 2);
        assert!(!entry.due(at("2026-05-30 08:00:10"), 600));
    }

    #[test]
    fn routine_due_at_anchor_itself() {
        let entry = routine("2026-01-01", "08:00", 7);
        assert!(entry.due(at("2026-01-01 08:00:05"), 600));
    }

    // -- next occurrence ----------------------------------------------------

    #[test]
    fn weekly_next_occurrence_later_today() {
        let entry = weekly(&[1], "18:00");
        assert_eq!(
            entry.next_occurrence(at("2026-01-06 10:00:00")),
            Some(at("2026-01-06 18:00:00"))
        );
    }

    #[test]
    fn weekly_next_occurrence_rolls_to_next_week() {
        // Checked just after Tuesday's slot passed.
        let entry = weekly(&[1], "06:00");
        assert_eq!(
            entry.next_occurrence(at("2026-01-06 07:00:00")),
            Some(at("2026-01-13 06:00:00"))
        );
    }

    #[test]
    fn routine_next_occurrence_respects_interval() {
        let entry = routine("2026-01-01", "06:00", 3);
        assert_eq!(
            entry.next_occurrence(at("2026-01-02 12:00:00")),
            Some(at("2026-01-04 06:00:00"))
        );
    }

    #[test]
    fn routine_next_occurrence_before_anchor_is_the_anchor() {
        let entry = routine("2026-01-05", "06:00", 3);
        assert_eq!(
            entry.next_occurrence(at("2026-01-02 00:00:00")),
            Some(at("2026-01-05 06:00:00"))
        );
    }

    #[test]
    fn routine_next_occurrence_beyond_scan_horizon_is_none() {
        let entry = routine("2026-03-01", "06:00", 3);
        assert_eq!(entry.next_occurrence(at("2026-01-01 00:00:00")), None);
    }

    // -- validation ---------------------------------------------------------

    #[test]
    fn validate_rejects_bad_time_format() {
        let entry = weekly(&[1], "6 am");
        assert!(matches!(entry.validate(), Err(RigError::Validation(_))));
    }

    #[test]
    fn validate_rejects_zero_duration() {
        let mut entry = weekly(&[1], "06:00");
        entry.duration_sec = 0;
        assert!(entry.validate().is_err());
    }

    #[test]
    fn validate_rejects_empty_days_and_bad_weekday() {
        assert!(weekly(&[], "06:00").validate().is_err());
        assert!(weekly(&[7], "06:00").validate().is_err());
    }

    #[test]
    fn validate_rejects_zero_interval() {
        let entry = routine("2026-01-01", "06:00", 0);
        assert!(entry.validate().is_err());
    }

    #[test]
    fn validate_accepts_well_formed_entries() {
        assert!(weekly(&[0, 3, 6], "06:00").validate().is_ok());
        assert!(routine("2026-01-01", "22:30", 14).validate().is_ok());
    }

    // -- serde --------------------------------------------------------------

    #[test]
    fn weekly_serializes_with_schedule_tag() {
        let entry = weekly(&[1, 4], "06:00");
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["type"], "schedule");
        assert_eq!(json["days"], serde_json::json!([1, 4]));
        assert_eq!(json["start_time"], "06:00");
        assert_eq!(json["duration"], 300);
    }

    #[test]
    fn routine_serializes_with_routine_tag() {
        let entry = routine("2026-01-01", "06:00", 3);
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["type"], "routine");
        assert_eq!(json["start_date"], "2026-01-01");
        assert_eq!(json["interval_days"], 3);
    }

    #[test]
    fn missing_optional_fields_take_defaults() {
        let json = serde_json::json!({
            "id": 5,
            "type": "routine",
            "start_date": "2026-01-01",
            "start_time": "06:00",
            "interval_days": 2,
            "zone_id": 3,
            "duration": 120,
            "created_at": "2026-01-01T00:00:00+09:00"
        });
        let entry: ScheduleEntry = serde_json::from_value(json).unwrap();
        assert!(entry.enabled);
        assert!(!entry.check_moisture());
    }

    #[test]
    fn check_moisture_applies_to_routine_only() {
        let mut entry = routine("2026-01-01", "06:00", 1);
        assert!(!entry.check_moisture());
        if let ScheduleKind::Routine { check_moisture, .. } = &mut entry.kind {
            *check_moisture = true;
        }
        assert!(entry.check_moisture());
        assert!(!weekly(&[1], "06:00").check_moisture());
    }
}
