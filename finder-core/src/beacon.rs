//! Beacon scheduling: three independent elapsed-time gates evaluated each tick.
//!
//! The tick itself may run every 50 ms for UI responsiveness; each timer
//! fires only when its own interval has elapsed.

use crate::protocol::{
    BACKGROUND_UPDATE_INTERVAL_MS, DISCOVERY_REBROADCAST_MS, UPDATE_INTERVAL_MS,
};

#[derive(Debug, Default)]
pub struct BeaconTimers {
    last_discovery_ms: Option<u64>,
    last_session_ms: Option<u64>,
    last_background_ms: Option<u64>,
}

fn due(last: Option<u64>, interval_ms: u64, now_ms: u64) -> bool {
    match last {
        None => true,
        Some(t) => now_ms.saturating_sub(t) >= interval_ms,
    }
}

impl BeaconTimers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Discovery re-broadcast (while PAIRING_DISCOVERY).
    pub fn discovery_due(&self, now_ms: u64) -> bool {
        due(self.last_discovery_ms, DISCOVERY_REBROADCAST_MS, now_ms)
    }

    pub fn note_discovery_sent(&mut self, now_ms: u64) {
        self.last_discovery_ms = Some(now_ms);
    }

    /// Active-session beacon (while TRACKING_TARGET / BEING_TRACKED).
    pub fn session_due(&self, now_ms: u64) -> bool {
        due(self.last_session_ms, UPDATE_INTERVAL_MS, now_ms)
    }

    pub fn note_session_sent(&mut self, now_ms: u64) {
        self.last_session_ms = Some(now_ms);
    }

    /// Force the next session beacon to fire immediately (first beacon of a
    /// fresh session).
    pub fn force_session_beacon(&mut self) {
        self.last_session_ms = None;
    }

    /// Idle background fan-out to all friends.
    pub fn background_due(&self, now_ms: u64) -> bool {
        due(self.last_background_ms, BACKGROUND_UPDATE_INTERVAL_MS, now_ms)
    }

    pub fn note_background_sent(&mut self, now_ms: u64) {
        self.last_background_ms = Some(now_ms);
    }
}
