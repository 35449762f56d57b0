//! Friend finder protocol reference implementation.
//! Host-driven: no I/O; the host passes messages, user actions and ticks,
//! and performs the returned effects.

pub mod beacon;
pub mod core;
pub mod directory;
pub mod engine;
pub mod power;
pub mod protocol;
pub mod session;
pub mod wire;

pub use crate::core::{Effect, FriendFinder, HostStatus, Notice, UiEvent};
pub use directory::{FriendDirectory, FriendRecord, MAX_FRIENDS};
pub use power::GPS_BOOST_INTERVAL_SECS;
pub use protocol::{Destination, NodeId, RequestType, Telemetry};
pub use session::SessionState;
pub use wire::{decode_payload, encode_payload, PayloadDecodeError, PayloadEncodeError};
