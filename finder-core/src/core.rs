//! Host-driven API: `FriendFinder` receives messages, user actions and ticks,
//! and returns effects for the host to perform. No I/O happens here; the host
//! owns the radio, the blob store and the GPS config, and must call in from a
//! single logical thread (message handling and ticks never interleave).

use tracing::{debug, info, warn};

use crate::beacon::BeaconTimers;
use crate::directory::{new_session_credentials, FriendDirectory, FriendRecord};
use crate::engine;
use crate::power::GpsPowerGuard;
use crate::protocol::{Destination, NodeId, RequestType, Telemetry, DISCOVERY_HOP_LIMIT};
use crate::session::{PairingWindow, Session, SessionState};
use crate::wire;

/// Host snapshot passed with every call: current telemetry sources and the
/// configured GPS sampling interval.
#[derive(Debug, Clone, Copy)]
pub struct HostStatus {
    pub has_fix: bool,
    /// Degrees x 1e7.
    pub latitude_i: i32,
    /// Degrees x 1e7.
    pub longitude_i: i32,
    pub sats_in_view: u32,
    /// 0-100.
    pub battery_level: u32,
    /// Unix seconds, best effort; 0 when unknown.
    pub unix_time: u32,
    /// Current position-sampling interval from the config store, seconds.
    pub gps_interval_secs: u32,
}

/// UI frame events; rendering is the host's business.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UiEvent {
    RegenerateForeground { focus: bool },
    RegenerateBackground,
    RedrawOnly,
}

/// Transient, non-blocking notifications for the host UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notice {
    /// A stranger proposed pairing; ask the user.
    ConfirmPairing(NodeId),
    PairedWith(NodeId),
    PairingTimedOut,
    SessionEnded { by_peer: bool },
}

/// Action for the host to perform.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Send a payload on the friend finder port. `hop_limit: None` means the
    /// transport default.
    Send {
        dest: Destination,
        hop_limit: Option<u8>,
        payload: Vec<u8>,
    },
    /// Write the friend directory blob to the host's key-value store.
    PersistFriends(Vec<u8>),
    /// Set the position-sampling interval (and trigger a config reload).
    SetGpsInterval(u32),
    Ui(UiEvent),
    Notice(Notice),
}

/// The pairing-and-tracking core. Owns the friend directory, the singular
/// session, the power guard and the beacon timers.
pub struct FriendFinder {
    self_id: NodeId,
    directory: FriendDirectory,
    session: Session,
    power: GpsPowerGuard,
    beacons: BeaconTimers,
}

impl FriendFinder {
    /// Build the core from persisted state. `stored_gps_interval_secs` is what
    /// the config store currently holds; if it is stuck at the boosted value
    /// the previous run died mid-session and the returned effects restore the
    /// default.
    pub fn new(
        self_id: NodeId,
        default_gps_interval_secs: u32,
        stored_gps_interval_secs: u32,
        persisted_friends: Option<&[u8]>,
    ) -> (Self, Vec<Effect>) {
        let mut effects = Vec::new();
        if let Some(restore) =
            GpsPowerGuard::self_heal(stored_gps_interval_secs, default_gps_interval_secs)
        {
            effects.push(Effect::SetGpsInterval(restore));
        }
        let core = Self {
            self_id,
            directory: FriendDirectory::from_persisted(persisted_friends),
            session: Session::new(),
            power: GpsPowerGuard::new(),
            beacons: BeaconTimers::new(),
        };
        (core, effects)
    }

    pub fn self_id(&self) -> NodeId {
        self.self_id
    }

    pub fn state(&self) -> SessionState {
        self.session.state
    }

    /// State before the last transition (the UI returns here from overlays).
    pub fn previous_state(&self) -> SessionState {
        self.session.previous
    }

    /// Peer of the active session, if any.
    pub fn target(&self) -> Option<NodeId> {
        self.session.state.target()
    }

    pub fn friend_count(&self) -> usize {
        self.directory.count()
    }

    pub fn friends(&self) -> impl Iterator<Item = &FriendRecord> {
        self.directory.used()
    }

    /// Latest telemetry heard from the session peer, with receipt time.
    pub fn last_peer_telemetry(&self) -> Option<(Telemetry, u64)> {
        self.session.last_peer_telemetry
    }

    pub fn is_gps_boosted(&self) -> bool {
        self.power.is_boosted()
    }

    // ---- user actions ----

    /// Start discovery: open the pairing window and broadcast a hop-limited
    /// REQUEST, repeated every few seconds while the window is open.
    pub fn begin_pairing(&mut self, now_ms: u64, host: &HostStatus) -> Vec<Effect> {
        let mut effects = Vec::new();
        if self.session.state != SessionState::Idle {
            warn!(state = self.session.state.name(), "begin_pairing ignored");
            return effects;
        }
        self.session.clear_rejected();
        self.apply_transition(
            SessionState::PairingDiscovery {
                window: PairingWindow::open(now_ms),
            },
            now_ms,
            host,
            &mut effects,
        );
        self.send(
            &mut effects,
            Destination::Broadcast,
            RequestType::Request,
            Some(DISCOVERY_HOP_LIMIT),
            host,
            now_ms,
        );
        self.beacons.note_discovery_sent(now_ms);
        effects
    }

    /// Request mutual tracking with a specific peer (known or unknown): open
    /// the pairing window and send one directed REQUEST at default hops. The
    /// window expiry is the only retry decision.
    pub fn request_tracking(&mut self, peer: NodeId, now_ms: u64, host: &HostStatus) -> Vec<Effect> {
        let mut effects = Vec::new();
        if peer == self.self_id || peer.is_broadcast() {
            warn!(%peer, "request_tracking ignored: bad target");
            return effects;
        }
        if self.session.state != SessionState::Idle {
            warn!(state = self.session.state.name(), "request_tracking ignored");
            return effects;
        }
        self.session.clear_rejected();
        self.apply_transition(
            SessionState::AwaitingResponse {
                target: peer,
                window: PairingWindow::open(now_ms),
            },
            now_ms,
            host,
            &mut effects,
        );
        self.send(
            &mut effects,
            Destination::Node(peer),
            RequestType::Request,
            None,
            host,
            now_ms,
        );
        effects
    }

    /// User confirms the pending pairing proposal.
    pub fn accept_pairing(&mut self, now_ms: u64, host: &HostStatus) -> Vec<Effect> {
        let mut effects = Vec::new();
        if let SessionState::AwaitingConfirmation { candidate, window } = self.session.state {
            self.apply_transition(
                SessionState::AwaitingFinalAcceptance { candidate, window },
                now_ms,
                host,
                &mut effects,
            );
            self.send(
                &mut effects,
                Destination::Node(candidate),
                RequestType::Accept,
                None,
                host,
                now_ms,
            );
        }
        effects
    }

    /// User declines the pending pairing proposal; discovery continues if the
    /// window is still open.
    pub fn reject_pairing(&mut self, now_ms: u64, host: &HostStatus) -> Vec<Effect> {
        let mut effects = Vec::new();
        if let SessionState::AwaitingConfirmation { candidate, window } = self.session.state {
            self.send(
                &mut effects,
                Destination::Node(candidate),
                RequestType::Reject,
                None,
                host,
                now_ms,
            );
            self.session.remember_rejected(candidate);
            let next = if window.is_open(now_ms) {
                SessionState::PairingDiscovery { window }
            } else {
                SessionState::Idle
            };
            self.apply_transition(next, now_ms, host, &mut effects);
        }
        effects
    }

    /// User backs out of any pairing sub-state without notifying anyone.
    pub fn cancel_pairing(&mut self, now_ms: u64, host: &HostStatus) -> Vec<Effect> {
        let mut effects = Vec::new();
        if self.session.state.pairing_window().is_some() {
            self.apply_transition(SessionState::Idle, now_ms, host, &mut effects);
        }
        effects
    }

    /// End the active session. All teardown paths (user, peer END_SESSION,
    /// timeout) converge on the same transition-to-idle routine.
    pub fn end_session(&mut self, notify_peer: bool, now_ms: u64, host: &HostStatus) -> Vec<Effect> {
        let mut effects = Vec::new();
        if let Some(target) = self.session.state.target() {
            if notify_peer {
                self.send(
                    &mut effects,
                    Destination::Node(target),
                    RequestType::EndSession,
                    None,
                    host,
                    now_ms,
                );
            }
            self.apply_transition(SessionState::Idle, now_ms, host, &mut effects);
            effects.push(Effect::Notice(Notice::SessionEnded { by_peer: false }));
        }
        effects
    }

    /// Remove a saved friend; the record is wiped, not flagged.
    pub fn remove_friend(&mut self, node: NodeId) -> Vec<Effect> {
        let mut effects = Vec::new();
        if let Some(slot) = self.directory.find(node) {
            self.directory.remove(slot);
            info!(%node, slot, "removed friend");
            self.persist_directory(&mut effects);
        }
        effects
    }

    // ---- transport callback ----

    /// Handle one inbound payload from the mesh. Undecodable payloads and
    /// messages inconsistent with the current state are dropped, not errors.
    pub fn on_message(
        &mut self,
        from: NodeId,
        payload: &[u8],
        now_ms: u64,
        host: &HostStatus,
    ) -> Vec<Effect> {
        let mut effects = Vec::new();
        if from == self.self_id {
            return effects;
        }
        let data = match wire::decode_payload(payload) {
            Ok(d) => d,
            Err(e) => {
                debug!(%from, error = %e, "dropping undecodable payload");
                return effects;
            }
        };
        debug!(
            %from,
            kind = data.request_type.name(),
            state = self.session.state.name(),
            "rx"
        );

        let decision = engine::decide(
            from,
            data.request_type,
            self.session.state,
            self.directory.find(from).is_some(),
            self.session.is_rejected(from),
            now_ms,
        );

        if let Some(node) = decision.save_friend {
            self.save_friend_if_new(node, &mut effects);
        }
        if decision.cache_for_session {
            self.session.note_peer_telemetry(data, now_ms);
        }
        if decision.cache_for_directory {
            self.directory.note_telemetry(from, data, now_ms);
        }
        if let Some(node) = decision.remember_rejected {
            self.session.remember_rejected(node);
        }
        let transitioned = decision.next.is_some();
        if let Some(next) = decision.next {
            self.apply_transition(next, now_ms, host, &mut effects);
        }
        for reply in decision.replies {
            self.send(
                &mut effects,
                reply.dest,
                reply.kind,
                reply.hop_limit,
                host,
                now_ms,
            );
        }
        if !transitioned && decision.cache_for_session {
            effects.push(Effect::Ui(UiEvent::RedrawOnly));
        }
        if let Some(notice) = decision.notice {
            effects.push(Effect::Notice(notice));
        }
        effects
    }

    // ---- periodic tick ----

    /// Evaluate the pairing-window timer and the three beacon gates. The host
    /// may tick as often as it likes (e.g. every 50 ms); each timer fires on
    /// its own interval.
    pub fn tick(&mut self, now_ms: u64, host: &HostStatus) -> Vec<Effect> {
        let mut effects = Vec::new();

        if let Some(window) = self.session.state.pairing_window() {
            if !window.is_open(now_ms) {
                if let SessionState::AwaitingConfirmation { candidate, .. } = self.session.state {
                    // The user never answered; decline on their behalf.
                    self.send(
                        &mut effects,
                        Destination::Node(candidate),
                        RequestType::Reject,
                        None,
                        host,
                        now_ms,
                    );
                    self.session.remember_rejected(candidate);
                }
                info!(state = self.session.state.name(), "pairing window expired");
                self.apply_transition(SessionState::Idle, now_ms, host, &mut effects);
                effects.push(Effect::Notice(Notice::PairingTimedOut));
            }
        }

        match self.session.state {
            SessionState::PairingDiscovery { .. } => {
                if self.beacons.discovery_due(now_ms) {
                    self.send(
                        &mut effects,
                        Destination::Broadcast,
                        RequestType::Request,
                        Some(DISCOVERY_HOP_LIMIT),
                        host,
                        now_ms,
                    );
                    self.beacons.note_discovery_sent(now_ms);
                }
            }
            SessionState::TrackingTarget { target } | SessionState::BeingTracked { target } => {
                // Both peers beacon symmetrically while a session is live.
                if self.beacons.session_due(now_ms) {
                    self.send(
                        &mut effects,
                        Destination::Node(target),
                        RequestType::None,
                        None,
                        host,
                        now_ms,
                    );
                }
            }
            SessionState::Idle => {
                if host.has_fix && !self.directory.is_empty() && self.beacons.background_due(now_ms)
                {
                    let friends: Vec<NodeId> = self.directory.used().map(|r| r.node).collect();
                    debug!(count = friends.len(), "background telemetry fan-out");
                    for node in friends {
                        self.send(
                            &mut effects,
                            Destination::Node(node),
                            RequestType::None,
                            None,
                            host,
                            now_ms,
                        );
                    }
                    self.beacons.note_background_sent(now_ms);
                }
            }
            _ => {}
        }

        effects
    }

    // ---- internals ----

    /// Compose best-effort telemetry. With no fix the sentinel (0,0) goes out;
    /// receivers treat it as "position unknown".
    fn compose_telemetry(&self, kind: RequestType, host: &HostStatus) -> Telemetry {
        Telemetry {
            request_type: kind,
            latitude_i: if host.has_fix { host.latitude_i } else { 0 },
            longitude_i: if host.has_fix { host.longitude_i } else { 0 },
            sats_in_view: if host.has_fix { host.sats_in_view } else { 0 },
            battery_level: host.battery_level,
            time: host.unix_time,
        }
    }

    /// Queue one outgoing message. Encoding failure is logged and the send is
    /// dropped; there are no retries.
    fn send(
        &mut self,
        effects: &mut Vec<Effect>,
        dest: Destination,
        kind: RequestType,
        hop_limit: Option<u8>,
        host: &HostStatus,
        now_ms: u64,
    ) {
        let data = self.compose_telemetry(kind, host);
        let payload = match wire::encode_payload(&data) {
            Ok(p) => p,
            Err(e) => {
                warn!(kind = kind.name(), error = %e, "dropping unsendable message");
                return;
            }
        };
        debug!(?dest, kind = kind.name(), "tx");
        if let Destination::Node(node) = dest {
            if self.session.state.target() == Some(node) {
                self.beacons.note_session_sent(now_ms);
            }
        }
        effects.push(Effect::Send {
            dest,
            hop_limit,
            payload,
        });
    }

    /// Persist a new friend with fresh (never exchanged) credentials. Already
    /// saved peers are left alone so duplicate deliveries cannot re-save.
    fn save_friend_if_new(&mut self, node: NodeId, effects: &mut Vec<Effect>) {
        if self.directory.find(node).is_some() {
            return;
        }
        let (session_id, secret) = new_session_credentials();
        self.directory.upsert(node, session_id, secret);
        self.persist_directory(effects);
    }

    /// Hand the directory blob to the host. If encoding fails the directory
    /// keeps operating RAM-only; never fatal.
    fn persist_directory(&self, effects: &mut Vec<Effect>) {
        match self.directory.encode() {
            Ok(blob) => effects.push(Effect::PersistFriends(blob)),
            Err(e) => warn!(error = %e, "friend store unavailable, keeping directory in RAM"),
        }
    }

    /// The single transition routine: updates previous/current state, drives
    /// the power guard on tracking entry/exit and raises the UI event. Every
    /// teardown path funnels through here, so GPS boost and restore happen
    /// exactly once per session.
    fn apply_transition(
        &mut self,
        to: SessionState,
        _now_ms: u64,
        host: &HostStatus,
        effects: &mut Vec<Effect>,
    ) {
        if to == self.session.state {
            return;
        }
        let was_tracking = self.session.state.is_tracking();
        debug!(from = self.session.state.name(), to = to.name(), "transition");
        self.session.transition(to);

        if !was_tracking && to.is_tracking() {
            if let Some(boosted) = self.power.boost(host.gps_interval_secs) {
                effects.push(Effect::SetGpsInterval(boosted));
            }
            // First session beacon goes out on the next tick, immediately.
            self.beacons.force_session_beacon();
        } else if was_tracking && !to.is_tracking() {
            if let Some(restored) = self.power.restore() {
                effects.push(Effect::SetGpsInterval(restored));
            }
            self.session.last_peer_telemetry = None;
        }

        let ui = match to {
            SessionState::Idle => UiEvent::RegenerateBackground,
            SessionState::TrackingTarget { .. }
            | SessionState::BeingTracked { .. }
            | SessionState::AwaitingConfirmation { .. } => {
                UiEvent::RegenerateForeground { focus: true }
            }
            _ => UiEvent::RegenerateForeground { focus: false },
        };
        effects.push(Effect::Ui(ui));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::power::GPS_BOOST_INTERVAL_SECS;
    use crate::protocol::{BACKGROUND_UPDATE_INTERVAL_MS, PAIRING_WINDOW_MS, UPDATE_INTERVAL_MS};

    const DEFAULT_GPS: u32 = 60;

    fn host_with_fix() -> HostStatus {
        HostStatus {
            has_fix: true,
            latitude_i: 523_000_000,
            longitude_i: 132_000_000,
            sats_in_view: 9,
            battery_level: 88,
            unix_time: 1_700_000_000,
            gps_interval_secs: DEFAULT_GPS,
        }
    }

    fn host_without_fix() -> HostStatus {
        HostStatus {
            has_fix: false,
            ..host_with_fix()
        }
    }

    struct Node {
        core: FriendFinder,
        host: HostStatus,
    }

    fn node(id: u32) -> Node {
        let (core, effects) = FriendFinder::new(NodeId(id), DEFAULT_GPS, DEFAULT_GPS, None);
        assert!(effects.is_empty());
        Node {
            core,
            host: host_with_fix(),
        }
    }

    /// Deliver every Send effect to the other node, chaining until quiet.
    /// Returns all effects with the index of the node that produced them.
    fn deliver_all(
        nodes: &mut [Node; 2],
        seed: Vec<(usize, Effect)>,
        now_ms: u64,
    ) -> Vec<(usize, Effect)> {
        let mut pending = seed;
        let mut log = Vec::new();
        while let Some((origin, effect)) = pending.pop() {
            if let Effect::Send { dest, payload, .. } = &effect {
                let to = 1 - origin;
                let addressed_to_peer = match dest {
                    Destination::Broadcast => true,
                    Destination::Node(n) => *n == nodes[to].core.self_id(),
                };
                if addressed_to_peer {
                    let from = nodes[origin].core.self_id();
                    let host = nodes[to].host;
                    let out = nodes[to].core.on_message(from, payload, now_ms, &host);
                    pending.extend(out.into_iter().map(|e| (to, e)));
                }
            }
            log.push((origin, effect));
        }
        log
    }

    fn tagged(origin: usize, effects: Vec<Effect>) -> Vec<(usize, Effect)> {
        effects.into_iter().map(|e| (origin, e)).collect()
    }

    fn gps_sets(log: &[(usize, Effect)], node: usize) -> Vec<u32> {
        log.iter()
            .filter_map(|(o, e)| match e {
                Effect::SetGpsInterval(v) if *o == node => Some(*v),
                _ => None,
            })
            .collect()
    }

    /// Pair two fresh nodes via the discovery scenario from the protocol
    /// description: A broadcasts, B confirms, both exchange ACCEPTs.
    fn pair_via_discovery(nodes: &mut [Node; 2], now_ms: u64) -> Vec<(usize, Effect)> {
        let host = nodes[0].host;
        let a_effects = nodes[0].core.begin_pairing(now_ms, &host);
        let host = nodes[1].host;
        let _ = nodes[1].core.begin_pairing(now_ms, &host);
        // Only A's broadcast gets through (lossy medium).
        let mut log = deliver_all(nodes, tagged(0, a_effects), now_ms);
        // B's user confirms; the ACCEPT reaches A, still discovering, which
        // treats it as a late proposal.
        let host = nodes[1].host;
        let b_accept = nodes[1].core.accept_pairing(now_ms, &host);
        log.extend(deliver_all(nodes, tagged(1, b_accept), now_ms));
        // A's user confirms; the matching ACCEPT completes B, whose telemetry
        // reply completes A.
        let host = nodes[0].host;
        let a_accept = nodes[0].core.accept_pairing(now_ms, &host);
        log.extend(deliver_all(nodes, tagged(0, a_accept), now_ms));
        log
    }

    /// Take one node into an active session with the other via a directed
    /// request (both must already be friends for the instant auto-accept).
    fn start_session(nodes: &mut [Node; 2], now_ms: u64) -> Vec<(usize, Effect)> {
        let b_id = nodes[1].core.self_id();
        let host = nodes[0].host;
        let req = nodes[0].core.request_tracking(b_id, now_ms, &host);
        deliver_all(nodes, tagged(0, req), now_ms)
    }

    #[test]
    fn self_heal_restores_default_interval() {
        let (_, effects) =
            FriendFinder::new(NodeId(1), DEFAULT_GPS, GPS_BOOST_INTERVAL_SECS, None);
        assert_eq!(effects, vec![Effect::SetGpsInterval(DEFAULT_GPS)]);
        let (_, effects) = FriendFinder::new(NodeId(1), DEFAULT_GPS, DEFAULT_GPS, None);
        assert!(effects.is_empty());
    }

    #[test]
    fn own_messages_are_ignored() {
        let mut n = node(1);
        let payload = wire::encode_payload(&Telemetry {
            request_type: RequestType::Request,
            latitude_i: 0,
            longitude_i: 0,
            sats_in_view: 0,
            battery_level: 0,
            time: 0,
        })
        .unwrap();
        let effects = n.core.on_message(NodeId(1), &payload, 0, &host_with_fix());
        assert!(effects.is_empty());
    }

    #[test]
    fn garbage_payload_dropped() {
        let mut n = node(1);
        let effects = n.core.on_message(NodeId(2), &[0xff; 3], 0, &host_with_fix());
        assert!(effects.is_empty());
        assert_eq!(n.core.state(), SessionState::Idle);
    }

    #[test]
    fn no_position_leaves_without_fix() {
        let mut n = node(1);
        n.host = host_without_fix();
        let host = n.host;
        let effects = n.core.begin_pairing(0, &host);
        let sent = effects.iter().find_map(|e| match e {
            Effect::Send { payload, .. } => Some(wire::decode_payload(payload).unwrap()),
            _ => None,
        });
        let data = sent.expect("discovery broadcast");
        assert!(!data.has_position());
        assert_eq!((data.latitude_i, data.longitude_i), (0, 0));
        assert_eq!(data.sats_in_view, 0);
        // Battery still rides along.
        assert_eq!(data.battery_level, 88);
    }

    #[test]
    fn discovery_broadcast_is_hop_limited_and_rebroadcast() {
        let mut n = node(1);
        let host = n.host;
        let effects = n.core.begin_pairing(0, &host);
        let hop = effects.iter().find_map(|e| match e {
            Effect::Send { dest, hop_limit, .. } => {
                assert_eq!(*dest, Destination::Broadcast);
                Some(*hop_limit)
            }
            _ => None,
        });
        assert_eq!(hop, Some(Some(DISCOVERY_HOP_LIMIT)));
        // Next tick inside the re-broadcast interval stays quiet.
        let effects = n.core.tick(1_000, &host);
        assert!(!effects.iter().any(|e| matches!(e, Effect::Send { .. })));
        // After the interval elapses the broadcast repeats.
        let effects = n.core.tick(5_000, &host);
        assert!(effects.iter().any(|e| matches!(e, Effect::Send { .. })));
    }

    #[test]
    fn mutual_discovery_pairing_scenario() {
        let mut nodes = [node(0x11), node(0x22)];
        let log = pair_via_discovery(&mut nodes, 0);

        assert_eq!(nodes[0].core.state(), SessionState::Idle);
        assert_eq!(nodes[1].core.state(), SessionState::Idle);
        assert_eq!(nodes[0].core.friend_count(), 1);
        assert_eq!(nodes[1].core.friend_count(), 1);
        assert_eq!(nodes[0].core.friends().next().unwrap().node, NodeId(0x22));
        assert_eq!(nodes[1].core.friends().next().unwrap().node, NodeId(0x11));
        // Both sides persisted their record and reported the pairing.
        for idx in [0, 1] {
            assert!(log
                .iter()
                .any(|(o, e)| *o == idx && matches!(e, Effect::PersistFriends(_))));
            assert!(log
                .iter()
                .any(|(o, e)| *o == idx && matches!(e, Effect::Notice(Notice::PairedWith(_)))));
        }
        // No session auto-starts; pairing and tracking are separate steps.
        assert!(!nodes[0].core.is_gps_boosted());
        assert!(!nodes[1].core.is_gps_boosted());
    }

    #[test]
    fn pairing_window_expiry_returns_both_idle() {
        let mut nodes = [node(0x11), node(0x22)];
        let host = nodes[0].host;
        let _ = nodes[0].core.begin_pairing(0, &host);
        let _ = nodes[1].core.begin_pairing(0, &host);

        let after = PAIRING_WINDOW_MS + 1;
        for n in nodes.iter_mut() {
            let host = n.host;
            let effects = n.core.tick(after, &host);
            assert!(effects.contains(&Effect::Notice(Notice::PairingTimedOut)));
            assert_eq!(n.core.state(), SessionState::Idle);
            assert_eq!(n.core.friend_count(), 0);
        }
    }

    #[test]
    fn confirmation_timeout_declines_on_users_behalf() {
        let mut nodes = [node(0x11), node(0x22)];
        let host = nodes[0].host;
        let a_effects = nodes[0].core.begin_pairing(0, &host);
        let host = nodes[1].host;
        let _ = nodes[1].core.begin_pairing(0, &host);
        let _ = deliver_all(&mut nodes, tagged(0, a_effects), 0);
        assert!(matches!(
            nodes[1].core.state(),
            SessionState::AwaitingConfirmation { .. }
        ));

        let host = nodes[1].host;
        let effects = nodes[1].core.tick(PAIRING_WINDOW_MS + 1, &host);
        // A REJECT goes back to the unanswered candidate.
        let kinds: Vec<RequestType> = effects
            .iter()
            .filter_map(|e| match e {
                Effect::Send { payload, .. } => {
                    Some(wire::decode_payload(payload).unwrap().request_type)
                }
                _ => None,
            })
            .collect();
        assert_eq!(kinds, vec![RequestType::Reject]);
        assert_eq!(nodes[1].core.state(), SessionState::Idle);
        assert!(effects.contains(&Effect::Notice(Notice::PairingTimedOut)));
    }

    #[test]
    fn rejected_candidate_stays_rejected_for_the_attempt() {
        let mut a = node(0x11);
        let b_id = NodeId(0x22);
        let host = a.host;
        let _ = a.core.begin_pairing(0, &host);
        // B proposes; the user declines.
        let req = wire::encode_payload(&Telemetry {
            request_type: RequestType::Request,
            latitude_i: 0,
            longitude_i: 0,
            sats_in_view: 0,
            battery_level: 50,
            time: 0,
        })
        .unwrap();
        let _ = a.core.on_message(b_id, &req, 100, &host);
        assert!(matches!(
            a.core.state(),
            SessionState::AwaitingConfirmation { candidate, .. } if candidate == b_id
        ));
        let effects = a.core.reject_pairing(200, &host);
        assert!(matches!(a.core.state(), SessionState::PairingDiscovery { .. }));
        assert!(effects.iter().any(|e| matches!(e, Effect::Send { .. })));
        // The same peer proposing again is ignored for this attempt.
        let effects = a.core.on_message(b_id, &req, 300, &host);
        assert!(matches!(a.core.state(), SessionState::PairingDiscovery { .. }));
        assert!(!effects.iter().any(|e| matches!(e, Effect::Send { .. })));
        // A fresh attempt clears the rejection list.
        let _ = a.core.cancel_pairing(400, &host);
        let _ = a.core.begin_pairing(500, &host);
        let _ = a.core.on_message(b_id, &req, 600, &host);
        assert!(matches!(
            a.core.state(),
            SessionState::AwaitingConfirmation { .. }
        ));
    }

    #[test]
    fn peer_reject_returns_to_discovery() {
        let mut a = node(0x11);
        let b_id = NodeId(0x22);
        let host = a.host;
        let _ = a.core.begin_pairing(0, &host);
        let accept = wire::encode_payload(&Telemetry {
            request_type: RequestType::Accept,
            latitude_i: 0,
            longitude_i: 0,
            sats_in_view: 0,
            battery_level: 50,
            time: 0,
        })
        .unwrap();
        // Late proposal; user confirms; we wait for the matching ACCEPT.
        let _ = a.core.on_message(b_id, &accept, 100, &host);
        let _ = a.core.accept_pairing(200, &host);
        assert!(matches!(
            a.core.state(),
            SessionState::AwaitingFinalAcceptance { .. }
        ));
        // The peer backs out instead.
        let reject = wire::encode_payload(&Telemetry {
            request_type: RequestType::Reject,
            latitude_i: 0,
            longitude_i: 0,
            sats_in_view: 0,
            battery_level: 50,
            time: 0,
        })
        .unwrap();
        let _ = a.core.on_message(b_id, &reject, 300, &host);
        assert!(matches!(a.core.state(), SessionState::PairingDiscovery { .. }));
        assert_eq!(a.core.friend_count(), 0);
        // Their later ACCEPT is ignored; they were remembered as rejected.
        let _ = a.core.on_message(b_id, &accept, 400, &host);
        assert!(matches!(a.core.state(), SessionState::PairingDiscovery { .. }));
    }

    #[test]
    fn directed_tracking_between_friends() {
        let mut nodes = [node(0x11), node(0x22)];
        let _ = pair_via_discovery(&mut nodes, 0);
        let log = start_session(&mut nodes, 60_000);

        assert_eq!(
            nodes[0].core.state(),
            SessionState::TrackingTarget { target: NodeId(0x22) }
        );
        assert_eq!(
            nodes[1].core.state(),
            SessionState::BeingTracked { target: NodeId(0x11) }
        );
        // Both boosted exactly once, to the boosted interval.
        assert_eq!(gps_sets(&log, 0), vec![GPS_BOOST_INTERVAL_SECS]);
        assert_eq!(gps_sets(&log, 1), vec![GPS_BOOST_INTERVAL_SECS]);
        // The tracker cached the target's telemetry from the ACCEPT.
        assert!(nodes[0].core.last_peer_telemetry().is_some());
    }

    #[test]
    fn duplicate_request_does_not_retrigger_side_effects() {
        let mut nodes = [node(0x11), node(0x22)];
        let _ = pair_via_discovery(&mut nodes, 0);
        let _ = start_session(&mut nodes, 60_000);

        // Replay the directed REQUEST at the tracked node.
        let req = wire::encode_payload(&Telemetry {
            request_type: RequestType::Request,
            latitude_i: 1,
            longitude_i: 2,
            sats_in_view: 3,
            battery_level: 4,
            time: 5,
        })
        .unwrap();
        let host = nodes[1].host;
        let effects = nodes[1]
            .core
            .on_message(NodeId(0x11), &req, 61_000, &host);
        // Re-sent ACCEPT only: no new boost, no re-save.
        assert!(!effects.iter().any(|e| matches!(e, Effect::SetGpsInterval(_))));
        assert!(!effects.iter().any(|e| matches!(e, Effect::PersistFriends(_))));
        let kinds: Vec<RequestType> = effects
            .iter()
            .filter_map(|e| match e {
                Effect::Send { payload, .. } => {
                    Some(wire::decode_payload(payload).unwrap().request_type)
                }
                _ => None,
            })
            .collect();
        assert_eq!(kinds, vec![RequestType::Accept]);
    }

    #[test]
    fn end_session_notifies_without_echo() {
        let mut nodes = [node(0x11), node(0x22)];
        let _ = pair_via_discovery(&mut nodes, 0);
        let _ = start_session(&mut nodes, 60_000);

        let host = nodes[0].host;
        let effects = nodes[0].core.end_session(true, 70_000, &host);
        assert!(effects.contains(&Effect::Notice(Notice::SessionEnded { by_peer: false })));
        let log = deliver_all(&mut nodes, tagged(0, effects), 70_000);

        assert_eq!(nodes[0].core.state(), SessionState::Idle);
        assert_eq!(nodes[1].core.state(), SessionState::Idle);
        // The receiving side never echoed END_SESSION back.
        assert!(!log.iter().any(|(o, e)| *o == 1 && matches!(e, Effect::Send { .. })));
        assert!(log
            .iter()
            .any(|(o, e)| *o == 1
                && matches!(e, Effect::Notice(Notice::SessionEnded { by_peer: true }))));
        // GPS restored exactly once on each side.
        assert_eq!(gps_sets(&log, 0), vec![DEFAULT_GPS]);
        assert_eq!(gps_sets(&log, 1), vec![DEFAULT_GPS]);
        assert!(!nodes[0].core.is_gps_boosted());
        assert!(!nodes[1].core.is_gps_boosted());

        // A duplicate END_SESSION is a guarded no-op.
        let end = wire::encode_payload(&Telemetry {
            request_type: RequestType::EndSession,
            latitude_i: 0,
            longitude_i: 0,
            sats_in_view: 0,
            battery_level: 0,
            time: 0,
        })
        .unwrap();
        let host = nodes[1].host;
        let effects = nodes[1]
            .core
            .on_message(NodeId(0x11), &end, 71_000, &host);
        assert!(effects.is_empty());
    }

    #[test]
    fn session_beacons_fire_immediately_then_on_interval() {
        let mut nodes = [node(0x11), node(0x22)];
        let _ = pair_via_discovery(&mut nodes, 0);
        let _ = start_session(&mut nodes, 60_000);

        // The tracked side has not sent since the session ACCEPT/NONE pair,
        // so its first tick beacon obeys the interval; the forced first
        // beacon already went out during session start. Verify the cadence
        // from here on.
        let host = nodes[1].host;
        let quiet = nodes[1].core.tick(60_050, &host);
        assert!(!quiet.iter().any(|e| matches!(e, Effect::Send { .. })));
        let due = nodes[1].core.tick(60_000 + UPDATE_INTERVAL_MS, &host);
        let sends: Vec<&Effect> = due
            .iter()
            .filter(|e| matches!(e, Effect::Send { .. }))
            .collect();
        assert_eq!(sends.len(), 1);
        match sends[0] {
            Effect::Send { dest, payload, .. } => {
                assert_eq!(*dest, Destination::Node(NodeId(0x11)));
                let data = wire::decode_payload(payload).unwrap();
                assert_eq!(data.request_type, RequestType::None);
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn telemetry_updates_session_cache_and_directory() {
        let mut nodes = [node(0x11), node(0x22)];
        let _ = pair_via_discovery(&mut nodes, 0);
        let _ = start_session(&mut nodes, 60_000);

        let beacon = wire::encode_payload(&Telemetry {
            request_type: RequestType::None,
            latitude_i: 111,
            longitude_i: 222,
            sats_in_view: 5,
            battery_level: 42,
            time: 1_700_000_100,
        })
        .unwrap();
        let host = nodes[0].host;
        let effects = nodes[0]
            .core
            .on_message(NodeId(0x22), &beacon, 65_000, &host);
        assert!(effects.contains(&Effect::Ui(UiEvent::RedrawOnly)));
        let (data, at) = nodes[0].core.last_peer_telemetry().unwrap();
        assert_eq!((data.latitude_i, data.longitude_i), (111, 222));
        assert_eq!(at, 65_000);
        let rec = nodes[0].core.friends().next().unwrap();
        assert_eq!(rec.last_heard_ms, 65_000);
        assert_eq!(rec.last_data.unwrap().battery_level, 42);
    }

    #[test]
    fn background_fanout_cadence_and_gating() {
        let mut n = node(0x11);
        // Seed two friends directly.
        let (s, k) = new_session_credentials();
        n.core.directory.upsert(NodeId(0xa1), s, k);
        n.core.directory.upsert(NodeId(0xa2), s, k);

        let host = n.host;
        let sends = |effects: &[Effect]| {
            effects
                .iter()
                .filter(|e| matches!(e, Effect::Send { .. }))
                .count()
        };

        // With a fix and a non-empty directory: one NONE per friend.
        let effects = n.core.tick(0, &host);
        assert_eq!(sends(&effects), 2);
        // Not again until the interval elapses.
        let effects = n.core.tick(1_000, &host);
        assert_eq!(sends(&effects), 0);
        let effects = n.core.tick(BACKGROUND_UPDATE_INTERVAL_MS, &host);
        assert_eq!(sends(&effects), 2);

        // No fix: nothing, and the timer does not advance spuriously.
        let no_fix = host_without_fix();
        let effects = n.core.tick(2 * BACKGROUND_UPDATE_INTERVAL_MS, &no_fix);
        assert_eq!(sends(&effects), 0);

        // Empty directory: nothing.
        let mut empty = node(0x33);
        let host = empty.host;
        let effects = empty.core.tick(0, &host);
        assert_eq!(sends(&effects), 0);
    }

    #[test]
    fn persisted_friends_survive_restart() {
        let mut nodes = [node(0x11), node(0x22)];
        let log = pair_via_discovery(&mut nodes, 0);
        let blob = log
            .iter()
            .rev()
            .find_map(|(o, e)| match e {
                Effect::PersistFriends(b) if *o == 0 => Some(b.clone()),
                _ => None,
            })
            .expect("directory persisted");

        let (restarted, _) = FriendFinder::new(NodeId(0x11), DEFAULT_GPS, DEFAULT_GPS, Some(&blob));
        assert_eq!(restarted.friend_count(), 1);
        assert_eq!(restarted.friends().next().unwrap().node, NodeId(0x22));
    }

    #[test]
    fn remove_friend_wipes_and_persists() {
        let mut nodes = [node(0x11), node(0x22)];
        let _ = pair_via_discovery(&mut nodes, 0);
        assert_eq!(nodes[0].core.friend_count(), 1);
        let effects = nodes[0].core.remove_friend(NodeId(0x22));
        assert_eq!(nodes[0].core.friend_count(), 0);
        let blob = effects
            .iter()
            .find_map(|e| match e {
                Effect::PersistFriends(b) => Some(b.clone()),
                _ => None,
            })
            .expect("wipe persisted");
        let (restarted, _) = FriendFinder::new(NodeId(0x11), DEFAULT_GPS, DEFAULT_GPS, Some(&blob));
        assert_eq!(restarted.friend_count(), 0);
    }

    #[test]
    fn session_timeout_path_restores_gps_once() {
        // Timeout is the third teardown path (besides user end and peer
        // END_SESSION); here the session peer simply vanishes and the user
        // gives up, which must restore exactly once.
        let mut nodes = [node(0x11), node(0x22)];
        let _ = pair_via_discovery(&mut nodes, 0);
        let _ = start_session(&mut nodes, 60_000);
        let host = nodes[0].host;
        let first = nodes[0].core.end_session(false, 90_000, &host);
        assert_eq!(gps_sets(&tagged(0, first), 0), vec![DEFAULT_GPS]);
        // A second end is a no-op.
        let second = nodes[0].core.end_session(false, 91_000, &host);
        assert!(second.is_empty());
    }

    #[test]
    fn previous_state_tracks_transitions() {
        let mut n = node(0x11);
        let host = n.host;
        let _ = n.core.begin_pairing(0, &host);
        assert_eq!(n.core.previous_state(), SessionState::Idle);
        let _ = n.core.cancel_pairing(100, &host);
        assert_eq!(n.core.state(), SessionState::Idle);
        assert!(matches!(
            n.core.previous_state(),
            SessionState::PairingDiscovery { .. }
        ));
    }

    #[test]
    fn user_actions_guarded_outside_their_states() {
        let mut n = node(0x11);
        let host = n.host;
        // Accept/reject with nothing pending.
        assert!(n.core.accept_pairing(0, &host).is_empty());
        assert!(n.core.reject_pairing(0, &host).is_empty());
        assert!(n.core.end_session(true, 0, &host).is_empty());
        // Tracking requests aimed at self or broadcast.
        assert!(n.core.request_tracking(NodeId(0x11), 0, &host).is_empty());
        assert!(n
            .core
            .request_tracking(NodeId::BROADCAST, 0, &host)
            .is_empty());
        // Starting discovery twice.
        let _ = n.core.begin_pairing(0, &host);
        assert!(n.core.begin_pairing(100, &host).is_empty());
    }
}
