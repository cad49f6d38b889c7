//! Domain error taxonomy. Sensor and tank failures are recovered locally,
//! relay failures escalate to a full emergency stop, and `InterlockBusy`
//! is a rejection the caller is expected to handle, not a fault.

use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum RigError {
    /// A zone sensor read failed. Non-fatal: the zone is skipped this pass.
    #[error("sensor read failed for zone {zone}: {reason}")]
    SensorRead { zone: u8, reason: String },

    /// The tank level could not be read. Aborts the current check pass.
    #[error("tank {tank} level unavailable")]
    TankLevelUnavailable { tank: u8 },

    /// A relay write failed. Relay bus health is now suspect; the caller
    /// must have already forced a global emergency stop.
    #[error("relay write failed: {0}")]
    RelayWrite(String),

    /// An irrigation session is already active.
    #[error("irrigation already running{}", busy_suffix(.current_zone))]
    InterlockBusy { current_zone: Option<u8> },

    /// A queued job waited longer than the interlock ceiling and was dropped.
    #[error("gave up waiting for interlock after {}s", .0.as_secs())]
    InterlockTimeout(Duration),

    /// A schedule entry or threshold failed validation. Never persisted.
    #[error("invalid schedule: {0}")]
    Validation(String),

    /// No schedule with the given id exists.
    #[error("schedule {0} not found")]
    NotFound(u32),

    /// The schedule store could not be persisted.
    #[error("schedule store I/O: {0}")]
    Store(String),
}

impl RigError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }
}

fn busy_suffix(zone: &Option<u8>) -> String {
    match zone {
        Some(z) => format!(" (zone {z})"),
        None => String::new(),
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn busy_message_names_the_zone() {
        let e = RigError::InterlockBusy {
            current_zone: Some(3),
        };
        assert_eq!(e.to_string(), "irrigation already running (zone 3)");
    }

    #[test]
    fn busy_message_without_zone() {
        let e = RigError::InterlockBusy { current_zone: None };
        assert_eq!(e.to_string(), "irrigation already running");
    }
}
