// Two simulated radios pairing and tracking each other over a lossy,
// duplicating in-process mesh. Exercises the full protocol path: discovery,
// mutual confirmation, directed tracking, session beacons, teardown.

mod config;

use std::collections::VecDeque;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info};

use finder_core::{Destination, Effect, FriendFinder, HostStatus, NodeId, Notice};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// How long the simulated user takes to answer a pairing prompt.
const CONFIRM_DELAY_MS: u64 = 500;

struct SimNode {
    name: &'static str,
    core: FriendFinder,
    host: HostStatus,
    friends_blob: Option<Vec<u8>>,
    /// Simulated user: pending pairing prompt answered after a short delay.
    confirm_due: Option<u64>,
    /// Per-tick position drift, degrees x 1e7.
    drift: (i32, i32),
}

impl SimNode {
    fn new(name: &'static str, id: u32, lat: i32, lon: i32, drift: (i32, i32)) -> Self {
        let (core, effects) = FriendFinder::new(NodeId(id), 60, 60, None);
        assert!(effects.is_empty());
        Self {
            name,
            core,
            host: HostStatus {
                has_fix: true,
                latitude_i: lat,
                longitude_i: lon,
                sats_in_view: 8,
                battery_level: 95,
                unix_time: 1_700_000_000,
                gps_interval_secs: 60,
            },
            friends_blob: None,
            confirm_due: None,
            drift,
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    for arg in std::env::args().skip(1) {
        if arg == "--version" || arg == "-V" {
            println!("finder-sim {}", VERSION);
            return Ok(());
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cfg = config::load();
    info!(?cfg, "starting simulation");

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        tokio::select! {
            _ = run(cfg) => {}
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
            }
        }
    });
    Ok(())
}

async fn run(cfg: config::Config) {
    let mut rng = StdRng::seed_from_u64(cfg.seed);
    let mut nodes = [
        SimNode::new("alice", 0x0a11ce, 523_000_000, 132_000_000, (120, -60)),
        SimNode::new("bob", 0x0b0b00, 523_004_000, 132_002_500, (-90, 45)),
    ];

    let mut interval = tokio::time::interval(std::time::Duration::from_millis(cfg.tick_ms));
    let end_ms = cfg.run_secs * 1_000;
    let mut now_ms: u64 = 0;
    let mut pairing_started = false;
    let mut tracking_requested = false;
    let mut session_ended = false;

    while now_ms < end_ms {
        interval.tick().await;
        now_ms += cfg.tick_ms;

        for n in nodes.iter_mut() {
            n.host.latitude_i = n.host.latitude_i.wrapping_add(n.drift.0);
            n.host.longitude_i = n.host.longitude_i.wrapping_add(n.drift.1);
            n.host.unix_time = 1_700_000_000 + (now_ms / 1_000) as u32;
        }

        // Scripted user actions.
        if now_ms >= 1_000 && !pairing_started {
            pairing_started = true;
            info!("both users start pairing");
            for i in 0..2 {
                let host = nodes[i].host;
                let effects = nodes[i].core.begin_pairing(now_ms, &host);
                pump(&mut nodes, &mut rng, &cfg, i, effects, now_ms);
            }
        }
        if now_ms >= 40_000 && !tracking_requested {
            tracking_requested = true;
            let bob = nodes[1].core.self_id();
            info!("alice requests tracking");
            let host = nodes[0].host;
            let effects = nodes[0].core.request_tracking(bob, now_ms, &host);
            pump(&mut nodes, &mut rng, &cfg, 0, effects, now_ms);
        }
        if now_ms >= 75_000 && !session_ended {
            info!("alice ends the session");
            let host = nodes[0].host;
            let effects = nodes[0].core.end_session(true, now_ms, &host);
            pump(&mut nodes, &mut rng, &cfg, 0, effects, now_ms);
            session_ended = true;
        }

        // Simulated users answering pairing prompts.
        for i in 0..2 {
            if nodes[i].confirm_due.is_some_and(|at| now_ms >= at) {
                nodes[i].confirm_due = None;
                info!(node = nodes[i].name, "user confirms pairing");
                let host = nodes[i].host;
                let effects = nodes[i].core.accept_pairing(now_ms, &host);
                pump(&mut nodes, &mut rng, &cfg, i, effects, now_ms);
            }
        }

        // Scheduler tick on both radios.
        for i in 0..2 {
            let host = nodes[i].host;
            let effects = nodes[i].core.tick(now_ms, &host);
            pump(&mut nodes, &mut rng, &cfg, i, effects, now_ms);
        }
    }

    for n in &nodes {
        info!(
            node = n.name,
            state = n.core.state().name(),
            friends = n.core.friend_count(),
            blob_bytes = n.friends_blob.as_ref().map(|b| b.len()).unwrap_or(0),
            "final"
        );
        if let Some((data, at)) = n.core.last_peer_telemetry() {
            info!(
                node = n.name,
                age_ms = now_ms.saturating_sub(at),
                meters = approx_distance_m(&n.host, data.latitude_i, data.longitude_i),
                "last peer telemetry"
            );
        }
    }
}

/// Apply effects locally and route Send effects through the lossy channel,
/// chaining whatever the receiver produces in turn.
fn pump(
    nodes: &mut [SimNode; 2],
    rng: &mut StdRng,
    cfg: &config::Config,
    origin: usize,
    effects: Vec<Effect>,
    now_ms: u64,
) {
    let mut queue: VecDeque<(usize, Effect)> =
        effects.into_iter().map(|e| (origin, e)).collect();

    while let Some((from_idx, effect)) = queue.pop_front() {
        match effect {
            Effect::Send { dest, payload, hop_limit } => {
                let to = 1 - from_idx;
                let addressed = match dest {
                    Destination::Broadcast => true,
                    Destination::Node(n) => n == nodes[to].core.self_id(),
                };
                if !addressed {
                    continue;
                }
                let copies = deliveries(rng, cfg);
                if copies == 0 {
                    debug!(from = nodes[from_idx].name, ?dest, "packet lost");
                    continue;
                }
                for _ in 0..copies {
                    let sender = nodes[from_idx].core.self_id();
                    let host = nodes[to].host;
                    debug!(from = nodes[from_idx].name, to = nodes[to].name, ?hop_limit, "deliver");
                    let out = nodes[to].core.on_message(sender, &payload, now_ms, &host);
                    queue.extend(out.into_iter().map(|e| (to, e)));
                }
            }
            Effect::PersistFriends(blob) => {
                debug!(node = nodes[from_idx].name, bytes = blob.len(), "persist friends");
                nodes[from_idx].friends_blob = Some(blob);
            }
            Effect::SetGpsInterval(secs) => {
                info!(node = nodes[from_idx].name, secs, "gps interval set");
                nodes[from_idx].host.gps_interval_secs = secs;
            }
            Effect::Ui(event) => {
                debug!(node = nodes[from_idx].name, ?event, "ui");
            }
            Effect::Notice(notice) => {
                info!(node = nodes[from_idx].name, ?notice, "notice");
                if let Notice::ConfirmPairing(_) = notice {
                    nodes[from_idx].confirm_due = Some(now_ms + CONFIRM_DELAY_MS);
                }
            }
        }
    }
}

/// 0, 1 or 2 deliveries: the mesh may drop or duplicate any packet.
fn deliveries(rng: &mut StdRng, cfg: &config::Config) -> u32 {
    if rng.gen_bool(cfg.loss.clamp(0.0, 1.0)) {
        return 0;
    }
    if rng.gen_bool(cfg.duplicate.clamp(0.0, 1.0)) {
        return 2;
    }
    1
}

/// Equirectangular approximation, fine for the short distances simulated here.
fn approx_distance_m(host: &HostStatus, peer_lat_i: i32, peer_lon_i: i32) -> f64 {
    if peer_lat_i == 0 && peer_lon_i == 0 {
        return f64::NAN;
    }
    let to_rad = |v: i32| (v as f64 / 1e7).to_radians();
    let (lat1, lon1) = (to_rad(host.latitude_i), to_rad(host.longitude_i));
    let (lat2, lon2) = (to_rad(peer_lat_i), to_rad(peer_lon_i));
    let x = (lon2 - lon1) * ((lat1 + lat2) / 2.0).cos();
    let y = lat2 - lat1;
    (x * x + y * y).sqrt() * 6_371_000.0
}
