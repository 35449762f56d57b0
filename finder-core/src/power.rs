//! GPS power coordination: raise the position-sampling rate during a session,
//! restore it afterwards, and recover from an unclean shutdown mid-session.

use tracing::{info, warn};

/// Boosted position-sampling interval while a session is active.
pub const GPS_BOOST_INTERVAL_SECS: u32 = 2;

/// Save/restore pair around the host's sampling interval. Flag-guarded so
/// repeated enter/exit of tracking states cannot double-save or double-restore.
#[derive(Debug, Default)]
pub struct GpsPowerGuard {
    boosted: bool,
    saved_interval_secs: u32,
}

impl GpsPowerGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_boosted(&self) -> bool {
        self.boosted
    }

    /// Enter high-power mode. Returns the interval the host should switch to,
    /// or `None` if already boosted.
    pub fn boost(&mut self, current_interval_secs: u32) -> Option<u32> {
        if self.boosted {
            return None;
        }
        self.boosted = true;
        self.saved_interval_secs = current_interval_secs;
        info!(
            saved = current_interval_secs,
            boosted = GPS_BOOST_INTERVAL_SECS,
            "gps high-power mode on"
        );
        Some(GPS_BOOST_INTERVAL_SECS)
    }

    /// Leave high-power mode. Returns the interval to restore, or `None` if
    /// not boosted.
    pub fn restore(&mut self) -> Option<u32> {
        if !self.boosted {
            return None;
        }
        self.boosted = false;
        info!(restored = self.saved_interval_secs, "gps high-power mode off");
        Some(self.saved_interval_secs)
    }

    /// Startup self-heal: a persisted interval at or below the boosted value
    /// with no session active means the previous run died mid-session.
    /// Returns the interval to force-restore, if recovery is needed.
    pub fn self_heal(stored_interval_secs: u32, default_interval_secs: u32) -> Option<u32> {
        if stored_interval_secs <= GPS_BOOST_INTERVAL_SECS {
            warn!(
                stored = stored_interval_secs,
                default = default_interval_secs,
                "gps interval stuck at boosted value, restoring default"
            );
            Some(default_interval_secs)
        } else {
            None
        }
    }
}
