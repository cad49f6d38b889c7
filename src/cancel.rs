//! Cooperative cancellation for periodic workers.
//!
//! Every long wait in the rig (tick intervals, inter-zone pauses, interlock
//! polls) goes through [`CancelToken::sleep`], which slices the wait into
//! one-second chunks and re-checks the token between chunks, so a stop
//! request is honored within about a second rather than after the full
//! interval elapses.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Granularity of cancellation checks inside a long sleep.
const CHECK_SLICE: Duration = Duration::from_secs(1);

#[derive(Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Sleep for `dur`, waking early if the token is cancelled.
    /// Returns `true` if the full duration elapsed, `false` on cancellation.
    pub async fn sleep(&self, dur: Duration) -> bool {
        let mut remaining = dur;
        loop {
            if self.is_cancelled() {
                return false;
            }
            if remaining.is_zero() {
                return true;
            }
            let slice = remaining.min(CHECK_SLICE);
            tokio::time::sleep(slice).await;
            remaining = remaining.saturating_sub(slice);
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
