//! Session state machine data: tagged states, pairing window, ephemeral session.

use crate::protocol::{NodeId, Telemetry, PAIRING_WINDOW_MS};

/// The bounded interval during which new pairings are accepted or proposed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PairingWindow {
    pub expires_at_ms: u64,
}

impl PairingWindow {
    pub fn open(now_ms: u64) -> Self {
        Self {
            expires_at_ms: now_ms + PAIRING_WINDOW_MS,
        }
    }

    pub fn is_open(&self, now_ms: u64) -> bool {
        now_ms < self.expires_at_ms
    }

    pub fn remaining_ms(&self, now_ms: u64) -> u64 {
        self.expires_at_ms.saturating_sub(now_ms)
    }
}

/// Authoritative session state. Timer and candidate fields live only in the
/// states that use them; there is no shared mutable scratch across states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    /// Broadcasting hop-limited discovery, waiting for any stranger.
    PairingDiscovery { window: PairingWindow },
    /// A stranger proposed; waiting for the local user to confirm.
    AwaitingConfirmation {
        candidate: NodeId,
        window: PairingWindow,
    },
    /// We confirmed; waiting for the peer's matching acceptance.
    AwaitingFinalAcceptance {
        candidate: NodeId,
        window: PairingWindow,
    },
    /// We sent a directed tracking request; waiting for ACCEPT.
    AwaitingResponse {
        target: NodeId,
        window: PairingWindow,
    },
    /// Active session, we initiated.
    TrackingTarget { target: NodeId },
    /// Active session, peer initiated.
    BeingTracked { target: NodeId },
}

impl SessionState {
    /// Whether an active tracking session is running.
    pub fn is_tracking(&self) -> bool {
        matches!(
            self,
            SessionState::TrackingTarget { .. } | SessionState::BeingTracked { .. }
        )
    }

    /// The peer of the active session, if any.
    pub fn target(&self) -> Option<NodeId> {
        match self {
            SessionState::TrackingTarget { target } | SessionState::BeingTracked { target } => {
                Some(*target)
            }
            _ => None,
        }
    }

    /// The pairing window of the current pairing sub-state, if any.
    pub fn pairing_window(&self) -> Option<PairingWindow> {
        match self {
            SessionState::PairingDiscovery { window }
            | SessionState::AwaitingConfirmation { window, .. }
            | SessionState::AwaitingFinalAcceptance { window, .. }
            | SessionState::AwaitingResponse { window, .. } => Some(*window),
            _ => None,
        }
    }

    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            SessionState::Idle => "IDLE",
            SessionState::PairingDiscovery { .. } => "PAIRING_DISCOVERY",
            SessionState::AwaitingConfirmation { .. } => "AWAITING_CONFIRMATION",
            SessionState::AwaitingFinalAcceptance { .. } => "AWAITING_FINAL_ACCEPTANCE",
            SessionState::AwaitingResponse { .. } => "AWAITING_RESPONSE",
            SessionState::TrackingTarget { .. } => "TRACKING_TARGET",
            SessionState::BeingTracked { .. } => "BEING_TRACKED",
        }
    }
}

/// The ephemeral, singular session: at most one active target at a time.
#[derive(Debug)]
pub struct Session {
    pub state: SessionState,
    /// Where the UI returns after an overlay; updated on every transition.
    pub previous: SessionState,
    /// Peers declined during the current pairing attempt; cleared per attempt.
    pub rejected_peers: Vec<NodeId>,
    /// Latest telemetry from the active session peer, with receipt time.
    pub last_peer_telemetry: Option<(Telemetry, u64)>,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    pub fn new() -> Self {
        Self {
            state: SessionState::Idle,
            previous: SessionState::Idle,
            rejected_peers: Vec::new(),
            last_peer_telemetry: None,
        }
    }

    /// Move to a new state, remembering the old one for the UI.
    pub fn transition(&mut self, to: SessionState) {
        self.previous = self.state;
        self.state = to;
    }

    pub fn remember_rejected(&mut self, node: NodeId) {
        if !self.rejected_peers.contains(&node) {
            self.rejected_peers.push(node);
        }
    }

    pub fn is_rejected(&self, node: NodeId) -> bool {
        self.rejected_peers.contains(&node)
    }

    pub fn clear_rejected(&mut self) {
        self.rejected_peers.clear();
    }

    pub fn note_peer_telemetry(&mut self, data: Telemetry, now_ms: u64) {
        self.last_peer_telemetry = Some((data, now_ms));
    }
}
