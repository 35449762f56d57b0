//! Protocol engine: a pure decision function over the five message kinds.
//!
//! Messages inconsistent with the current state produce the empty decision
//! (guarded no-op), which is how duplicate, delayed and out-of-order mesh
//! delivery is tolerated.

use crate::core::Notice;
use crate::protocol::{Destination, NodeId, RequestType};
use crate::session::SessionState;

/// One reply the core should send. `hop_limit: None` means the transport
/// default.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reply {
    pub dest: Destination,
    pub kind: RequestType,
    pub hop_limit: Option<u8>,
}

impl Reply {
    fn to(node: NodeId, kind: RequestType) -> Self {
        Self {
            dest: Destination::Node(node),
            kind,
            hop_limit: None,
        }
    }
}

/// What to do about one inbound message. Everything defaults to "nothing".
#[derive(Debug, Default)]
pub struct Decision {
    pub next: Option<SessionState>,
    pub replies: Vec<Reply>,
    /// Persist this peer as a friend (skipped if already saved).
    pub save_friend: Option<NodeId>,
    /// Cache the message as the live session peer's telemetry.
    pub cache_for_session: bool,
    /// Cache the message in the sender's friend record.
    pub cache_for_directory: bool,
    pub remember_rejected: Option<NodeId>,
    pub notice: Option<Notice>,
}

impl Decision {
    fn ignore() -> Self {
        Self::default()
    }
}

/// Decide the effect of an inbound message given the current state and what
/// the friend directory knows about the sender. Pure: mutations are described,
/// not performed.
pub fn decide(
    from: NodeId,
    kind: RequestType,
    state: SessionState,
    is_friend: bool,
    is_rejected: bool,
    now_ms: u64,
) -> Decision {
    match kind {
        RequestType::Request => on_request(from, state, is_friend, is_rejected, now_ms),
        RequestType::Accept => on_accept(from, state, is_rejected),
        RequestType::Reject => on_reject(from, state, now_ms),
        RequestType::EndSession => on_end_session(from, state),
        RequestType::None => on_telemetry(from, state, is_friend),
    }
}

fn on_request(
    from: NodeId,
    state: SessionState,
    is_friend: bool,
    is_rejected: bool,
    now_ms: u64,
) -> Decision {
    // A known friend is auto-accepted, unless a session with someone else is
    // already active (single-session invariant).
    if is_friend {
        if let Some(target) = state.target() {
            if target != from {
                return Decision::ignore();
            }
            // Duplicate REQUEST from the current tracker: re-send ACCEPT so a
            // lost reply converges, but re-trigger nothing else.
            return Decision {
                replies: vec![Reply::to(from, RequestType::Accept)],
                ..Decision::default()
            };
        }
        return Decision {
            next: Some(SessionState::BeingTracked { target: from }),
            replies: vec![
                Reply::to(from, RequestType::Accept),
                Reply::to(from, RequestType::None),
            ],
            notice: Some(Notice::PairedWith(from)),
            ..Decision::default()
        };
    }

    match state {
        // A stranger found our discovery broadcast: ask the local user.
        SessionState::PairingDiscovery { window } => {
            if is_rejected {
                return Decision::ignore();
            }
            Decision {
                next: Some(SessionState::AwaitingConfirmation {
                    candidate: from,
                    window,
                }),
                notice: Some(Notice::ConfirmPairing(from)),
                ..Decision::default()
            }
        }
        // Our own directed request crossed with theirs while our window is
        // open: mutual intent, pair immediately.
        SessionState::AwaitingResponse { window, .. } if window.is_open(now_ms) => Decision {
            next: Some(SessionState::BeingTracked { target: from }),
            replies: vec![
                Reply::to(from, RequestType::Accept),
                Reply::to(from, RequestType::None),
            ],
            save_friend: Some(from),
            notice: Some(Notice::PairedWith(from)),
            ..Decision::default()
        },
        // Stranger with no window open anywhere: ignore.
        _ => Decision::ignore(),
    }
}

fn on_accept(from: NodeId, state: SessionState, is_rejected: bool) -> Decision {
    match state {
        SessionState::AwaitingResponse { target, .. } if target == from => Decision {
            next: Some(SessionState::TrackingTarget { target }),
            replies: vec![Reply::to(from, RequestType::None)],
            save_friend: Some(from),
            cache_for_session: true,
            notice: Some(Notice::PairedWith(from)),
            ..Decision::default()
        },
        SessionState::AwaitingFinalAcceptance { candidate, .. } if candidate == from => {
            // Pairing complete; a session is started independently later.
            Decision {
                next: Some(SessionState::Idle),
                replies: vec![Reply::to(from, RequestType::None)],
                save_friend: Some(from),
                notice: Some(Notice::PairedWith(from)),
                ..Decision::default()
            }
        }
        // A late proposal: the peer accepted our (possibly expired) discovery
        // broadcast. Treat it like an incoming request.
        SessionState::PairingDiscovery { window } => {
            if is_rejected {
                return Decision::ignore();
            }
            Decision {
                next: Some(SessionState::AwaitingConfirmation {
                    candidate: from,
                    window,
                }),
                notice: Some(Notice::ConfirmPairing(from)),
                ..Decision::default()
            }
        }
        _ => Decision::ignore(),
    }
}

fn on_reject(from: NodeId, state: SessionState, now_ms: u64) -> Decision {
    match state {
        SessionState::AwaitingFinalAcceptance { candidate, window } if candidate == from => {
            if window.is_open(now_ms) {
                // Keep discovering, but not with this peer again.
                Decision {
                    next: Some(SessionState::PairingDiscovery { window }),
                    remember_rejected: Some(from),
                    ..Decision::default()
                }
            } else {
                Decision {
                    next: Some(SessionState::Idle),
                    ..Decision::default()
                }
            }
        }
        _ => Decision::ignore(),
    }
}

fn on_end_session(from: NodeId, state: SessionState) -> Decision {
    if state.is_tracking() && state.target() == Some(from) {
        // Tear down locally; never echo END_SESSION back.
        Decision {
            next: Some(SessionState::Idle),
            notice: Some(Notice::SessionEnded { by_peer: true }),
            ..Decision::default()
        }
    } else {
        Decision::ignore()
    }
}

fn on_telemetry(from: NodeId, state: SessionState, is_friend: bool) -> Decision {
    // NONE from the pairing candidate also completes a pending pairing (our
    // ACCEPT arrived and the peer moved straight into beaconing).
    if let SessionState::AwaitingFinalAcceptance { candidate, .. } = state {
        if candidate == from {
            return Decision {
                next: Some(SessionState::Idle),
                save_friend: Some(from),
                cache_for_directory: true,
                notice: Some(Notice::PairedWith(from)),
                ..Decision::default()
            };
        }
    }
    let for_session = state.target() == Some(from);
    if for_session || is_friend {
        Decision {
            cache_for_session: for_session,
            cache_for_directory: is_friend,
            ..Decision::default()
        }
    } else {
        Decision::ignore()
    }
}
