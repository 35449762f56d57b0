//! Friend directory: bounded persistent set of known peers with cached telemetry.
//!
//! The per-friend `session_id` and `secret` are generated locally and never
//! exchanged, so they authenticate nothing. They are kept as a documented
//! limitation of the unauthenticated pairing protocol, not used.

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::protocol::{NodeId, Telemetry};

/// Directory capacity. When full, a new peer overwrites slot 0.
pub const MAX_FRIENDS: usize = 8;

/// Persisted blob schema version. Any mismatch resets the directory.
pub const DIRECTORY_VERSION: u16 = 1;

/// One known peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FriendRecord {
    pub node: NodeId,
    /// Locally generated; never exchanged (see module docs).
    pub session_id: u32,
    /// Locally generated; never exchanged (see module docs).
    pub secret: [u8; 16],
    pub used: bool,
    /// Most recent telemetry heard from this peer.
    pub last_data: Option<Telemetry>,
    /// Host monotonic time of the last message, ms.
    pub last_heard_ms: u64,
}

impl FriendRecord {
    fn blank() -> Self {
        Self {
            node: NodeId(0),
            session_id: 0,
            secret: [0u8; 16],
            used: false,
            last_data: None,
            last_heard_ms: 0,
        }
    }
}

/// Generate fresh (unused, see module docs) pairing credentials.
pub fn new_session_credentials() -> (u32, [u8; 16]) {
    let mut rng = rand::thread_rng();
    let session_id: u32 = rng.gen_range(1..0x7fff_ffff);
    let mut secret = [0u8; 16];
    rng.fill(&mut secret);
    (session_id, secret)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PersistedDirectory {
    version: u16,
    records: [FriendRecord; MAX_FRIENDS],
}

/// Fixed-size friend store. `node` is unique among `used` records.
#[derive(Debug, Clone)]
pub struct FriendDirectory {
    records: [FriendRecord; MAX_FRIENDS],
}

impl Default for FriendDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl FriendDirectory {
    pub fn new() -> Self {
        Self {
            records: [FriendRecord::blank(); MAX_FRIENDS],
        }
    }

    /// Slot index of a known peer, if any.
    pub fn find(&self, node: NodeId) -> Option<usize> {
        self.records
            .iter()
            .position(|r| r.used && r.node == node)
    }

    /// Insert or refresh a peer: existing slot, else first free slot, else
    /// slot 0 (destructive eviction). Never fails. Returns the slot used.
    pub fn upsert(&mut self, node: NodeId, session_id: u32, secret: [u8; 16]) -> usize {
        let slot = self
            .find(node)
            .or_else(|| self.records.iter().position(|r| !r.used))
            .unwrap_or(0);
        let evicted = self.records[slot].used && self.records[slot].node != node;
        if evicted {
            warn!(slot, old = %self.records[slot].node, new = %node, "directory full, evicting");
        }
        self.records[slot] = FriendRecord {
            node,
            session_id,
            secret,
            used: true,
            last_data: None,
            last_heard_ms: 0,
        };
        info!(%node, slot, "saved friend");
        slot
    }

    /// Wipe a slot, credentials included.
    pub fn remove(&mut self, slot: usize) {
        if slot < MAX_FRIENDS {
            self.records[slot] = FriendRecord::blank();
        }
    }

    pub fn count(&self) -> usize {
        self.records.iter().filter(|r| r.used).count()
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    pub fn record(&self, slot: usize) -> Option<&FriendRecord> {
        self.records.get(slot)
    }

    /// Iterate over used records.
    pub fn used(&self) -> impl Iterator<Item = &FriendRecord> {
        self.records.iter().filter(|r| r.used)
    }

    /// Cache the latest telemetry for a known peer. RAM-only; persistence
    /// happens on upsert/remove, not on every heard message.
    pub fn note_telemetry(&mut self, node: NodeId, data: Telemetry, now_ms: u64) -> bool {
        match self.find(node) {
            Some(slot) => {
                self.records[slot].last_data = Some(data);
                self.records[slot].last_heard_ms = now_ms;
                true
            }
            None => false,
        }
    }

    /// Serialize for the host's blob store.
    pub fn encode(&self) -> Result<Vec<u8>, DirectoryCodecError> {
        let persisted = PersistedDirectory {
            version: DIRECTORY_VERSION,
            records: self.records,
        };
        bincode::serialize(&persisted).map_err(DirectoryCodecError::Codec)
    }

    /// Restore from a persisted blob. Version or shape mismatch discards
    /// everything (explicit reset policy; no migration path yet).
    pub fn decode(bytes: &[u8]) -> Result<Self, DirectoryCodecError> {
        let persisted: PersistedDirectory =
            bincode::deserialize(bytes).map_err(DirectoryCodecError::Codec)?;
        if persisted.version != DIRECTORY_VERSION {
            return Err(DirectoryCodecError::BadVersion {
                found: persisted.version,
            });
        }
        Ok(Self {
            records: persisted.records,
        })
    }

    /// Decode a blob if present and intact, else start empty.
    pub fn from_persisted(bytes: Option<&[u8]>) -> Self {
        match bytes {
            None => Self::new(),
            Some(b) => match Self::decode(b) {
                Ok(dir) => {
                    info!(friends = dir.count(), "loaded friend directory");
                    dir
                }
                Err(e) => {
                    warn!(error = %e, "friend blob unusable, resetting directory");
                    Self::new()
                }
            },
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DirectoryCodecError {
    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),
    #[error("unknown directory version {found}")]
    BadVersion { found: u16 },
}
