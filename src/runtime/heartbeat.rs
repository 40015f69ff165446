//! Activity heartbeats.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use tracing::trace;

#[derive(Debug)]
struct HeartbeatState {
    last_at: Instant,
    last_details: String,
    count: u64,
}

/// Cloneable heartbeat recorder handed to long-running activities.
///
/// The activity records progress; the task queue's monitor cancels the
/// attempt when the gap between beats exceeds the configured heartbeat
/// timeout.
#[derive(Debug, Clone)]
pub struct Heartbeat {
    state: Arc<Mutex<HeartbeatState>>,
}

impl Heartbeat {
    /// Creates a recorder whose first beat is "now".
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(HeartbeatState {
                last_at: Instant::now(),
                last_details: String::new(),
                count: 0,
            })),
        }
    }

    /// Records a heartbeat with progress details.
    pub fn record(&self, details: impl Into<String>) {
        let details = details.into();
        trace!(details = %details, "activity heartbeat");
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.last_at = Instant::now();
        state.last_details = details;
        state.count += 1;
    }

    /// Instant of the most recent beat (or creation).
    pub fn last_beat(&self) -> Instant {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).last_at
    }

    /// Details attached to the most recent beat.
    pub fn last_details(&self) -> String {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .last_details
            .clone()
    }

    /// Number of beats recorded.
    pub fn count(&self) -> u64 {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).count
    }
}

impl Default for Heartbeat {
    fn default() -> Self {
        Self::new()
    }
}
