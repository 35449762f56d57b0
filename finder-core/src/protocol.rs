//! Friend finder wire protocol: message kinds, telemetry payload, timing constants.

use serde::{Deserialize, Serialize};
use std::fmt;

/// How long a pairing window stays open once the user starts pairing.
/// A single timer governs every pairing sub-state.
pub const PAIRING_WINDOW_MS: u64 = 30_000;

/// Discovery broadcast repeat interval while the pairing window is open.
pub const DISCOVERY_REBROADCAST_MS: u64 = 5_000;

/// Active-session beacon interval; both peers beacon symmetrically.
pub const UPDATE_INTERVAL_MS: u64 = 15_000;

/// Idle background fan-out interval (telemetry to every saved friend).
pub const BACKGROUND_UPDATE_INTERVAL_MS: u64 = 120_000;

/// Discovery stays local: one radio hop only, bounding airtime.
pub const DISCOVERY_HOP_LIMIT: u8 = 1;

/// Mesh node number. Broadcast is the all-ones address.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId(pub u32);

impl NodeId {
    pub const BROADCAST: NodeId = NodeId(0xFFFF_FFFF);

    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "!{:08x}", self.0)
    }
}

/// Where an outgoing message goes on the mesh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    Broadcast,
    Node(NodeId),
}

/// The five message kinds. Wire values 0..=4.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestType {
    /// Plain telemetry beacon; expects no protocol response.
    None,
    /// Ask to pair / start mutual tracking.
    Request,
    /// Agree to pair or track.
    Accept,
    /// Decline a pairing proposal.
    Reject,
    /// Tear down the active session.
    EndSession,
}

impl RequestType {
    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            RequestType::None => "NONE",
            RequestType::Request => "REQUEST",
            RequestType::Accept => "ACCEPT",
            RequestType::Reject => "REJECT",
            RequestType::EndSession => "END_SESSION",
        }
    }
}

/// On-air payload. Every message carries best-effort telemetry; `(0,0)`
/// lat/lon is the "no fix" sentinel (receivers must not treat it as a
/// real coordinate).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Telemetry {
    pub request_type: RequestType,
    /// Degrees x 1e7, fixed point.
    pub latitude_i: i32,
    /// Degrees x 1e7, fixed point.
    pub longitude_i: i32,
    pub sats_in_view: u32,
    /// 0-100.
    pub battery_level: u32,
    /// Unix seconds, best effort; 0 when unknown.
    pub time: u32,
}

impl Telemetry {
    /// Whether the carried position is a real fix rather than the sentinel.
    pub fn has_position(&self) -> bool {
        self.latitude_i != 0 || self.longitude_i != 0
    }
}
