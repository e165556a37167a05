//! Trust & Identity store: the roster of known peers and their trust flags.
//!
//! All mutation goes through this module's operations so concurrent
//! discovery, pairing, and UI-triggered writes never race on a record.
//! Persistence is delegated to a [`RecordStore`] backend; the JSON file
//! implementation commits the whole record set atomically
//! (write-temp-then-rename), so a peer record is never left half-written.

use crate::error::LinkError;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use tracing::warn;

/// Persisted peer record. Field set mirrors the external record-store
/// contract: id, displayName, profileId, ipAddress, port, lastSeen,
/// isStored, isTempStored, isTrusted, isBlocked, isPaired.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerRecord {
    pub id: String,
    #[serde(rename = "displayName")]
    pub display_name: String,
    #[serde(rename = "profileId")]
    pub profile_id: String,
    #[serde(rename = "ipAddress")]
    pub ip: IpAddr,
    pub port: u16,
    pub platform: String,
    #[serde(rename = "lastSeen")]
    pub last_seen: DateTime<Utc>,
    #[serde(rename = "isStored")]
    pub stored: bool,
    /// Ephemeral record created on first sighting; garbage-collectable
    /// unless blocked, never persisted unless promoted.
    #[serde(rename = "isTempStored")]
    pub temp_stored: bool,
    #[serde(rename = "isTrusted")]
    pub trusted: bool,
    #[serde(rename = "isBlocked")]
    pub blocked: bool,
    #[serde(rename = "isPaired")]
    pub paired: bool,
}

impl PeerRecord {
    pub fn discovered(
        id: impl Into<String>,
        display_name: impl Into<String>,
        profile_id: impl Into<String>,
        platform: impl Into<String>,
        ip: IpAddr,
        port: u16,
    ) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            profile_id: profile_id.into(),
            ip,
            port,
            platform: platform.into(),
            last_seen: Utc::now(),
            stored: false,
            temp_stored: true,
            trusted: false,
            blocked: false,
            paired: false,
        }
    }

    /// Derived status, highest priority first. Never stored.
    pub fn status(&self, online: bool) -> PeerStatus {
        if self.blocked {
            PeerStatus::Blocked
        } else if self.paired {
            PeerStatus::Paired
        } else if self.trusted {
            PeerStatus::Trusted
        } else if self.stored {
            if online {
                PeerStatus::OnlineSaved
            } else {
                PeerStatus::OfflineSaved
            }
        } else {
            PeerStatus::NewDevice
        }
    }

    /// Whether the record survives a restart. Blocked records always
    /// persist, otherwise unblocking would resurrect auto-accept.
    fn persistent(&self) -> bool {
        !self.temp_stored || self.blocked
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerStatus {
    Blocked,
    Paired,
    Trusted,
    OnlineSaved,
    OfflineSaved,
    NewDevice,
}

/// Per-peer connectivity, strictly ordered. Any socket error or explicit
/// disconnect forces a peer back to `Disconnected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnectionState {
    Disconnected,
    Discovered,
    Connected,
    Pairing,
    Paired,
}

/// What to do with an inbound request from this peer. Blocked dominates
/// trusted: a blocked peer is auto-rejected even if the trusted flag is
/// still set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutoDecision {
    Accept,
    Reject,
    Ask,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PeerFilter {
    #[default]
    All,
    Paired,
    Trusted,
    Blocked,
    Saved,
}

/// Persistence seam for the external record store collaborator.
pub trait RecordStore: Send + Sync {
    fn load(&self) -> Result<Vec<PeerRecord>, LinkError>;
    fn save(&self, records: &[PeerRecord]) -> Result<(), LinkError>;
}

/// JSON file backend. Saves are transactional: the full record set is
/// written to a temp file in the same directory and renamed over the
/// target, so readers never observe a torn write.
pub struct JsonRecordStore {
    path: PathBuf,
}

impl JsonRecordStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl RecordStore for JsonRecordStore {
    fn load(&self) -> Result<Vec<PeerRecord>, LinkError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let text =
            std::fs::read_to_string(&self.path).map_err(|e| LinkError::Store(e.to_string()))?;
        serde_json::from_str(&text).map_err(|e| LinkError::Store(e.to_string()))
    }

    fn save(&self, records: &[PeerRecord]) -> Result<(), LinkError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| LinkError::Store(e.to_string()))?;
        }
        let tmp = self.path.with_extension("json.tmp");
        let text =
            serde_json::to_string_pretty(records).map_err(|e| LinkError::Store(e.to_string()))?;
        std::fs::write(&tmp, text).map_err(|e| LinkError::Store(e.to_string()))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| LinkError::Store(e.to_string()))
    }
}

/// In-memory backend for tests and ephemeral runs.
#[derive(Default)]
pub struct MemoryRecordStore {
    records: parking_lot::Mutex<Vec<PeerRecord>>,
}

impl RecordStore for MemoryRecordStore {
    fn load(&self) -> Result<Vec<PeerRecord>, LinkError> {
        Ok(self.records.lock().clone())
    }

    fn save(&self, records: &[PeerRecord]) -> Result<(), LinkError> {
        *self.records.lock() = records.to_vec();
        Ok(())
    }
}

/// The roster. Shared mutable state behind a RwLock; every mutation is
/// written through to the backend before it returns.
pub struct PeerStore {
    backend: Box<dyn RecordStore>,
    records: RwLock<HashMap<String, PeerRecord>>,
    states: RwLock<HashMap<String, ConnectionState>>,
}

impl PeerStore {
    pub fn open(backend: Box<dyn RecordStore>) -> Result<Self, LinkError> {
        let loaded = backend.load()?;
        let mut records = HashMap::new();
        for rec in loaded {
            records.insert(rec.id.clone(), rec);
        }
        Ok(Self {
            backend,
            records: RwLock::new(records),
            states: RwLock::new(HashMap::new()),
        })
    }

    pub fn get(&self, peer_id: &str) -> Option<PeerRecord> {
        self.records.read().get(peer_id).cloned()
    }

    pub fn list(&self, filter: PeerFilter) -> Vec<PeerRecord> {
        let mut out: Vec<PeerRecord> = self
            .records
            .read()
            .values()
            .filter(|r| match filter {
                PeerFilter::All => true,
                PeerFilter::Paired => r.paired,
                PeerFilter::Trusted => r.trusted,
                PeerFilter::Blocked => r.blocked,
                PeerFilter::Saved => r.stored,
            })
            .cloned()
            .collect();
        out.sort_by(|a, b| a.display_name.cmp(&b.display_name));
        out
    }

    /// Create or refresh a record from a discovery announcement. Returns
    /// true when the peer was previously unknown. Identity is keyed by
    /// device id, so repeated announcements never create duplicates.
    pub fn upsert_discovered(&self, incoming: PeerRecord) -> Result<bool, LinkError> {
        let peer_id = incoming.id.clone();
        let is_new;
        {
            let mut records = self.records.write();
            match records.get_mut(&incoming.id) {
                Some(existing) => {
                    existing.display_name = incoming.display_name;
                    existing.profile_id = incoming.profile_id;
                    existing.platform = incoming.platform;
                    existing.ip = incoming.ip;
                    existing.port = incoming.port;
                    existing.last_seen = Utc::now();
                    is_new = false;
                }
                None => {
                    records.insert(incoming.id.clone(), incoming);
                    is_new = true;
                }
            }
        }
        self.persist()?;
        self.advance_state_min(&peer_id, ConnectionState::Discovered);
        Ok(is_new)
    }

    pub fn set_trusted(&self, peer_id: &str, trusted: bool) -> Result<(), LinkError> {
        self.mutate(peer_id, |r| r.trusted = trusted)
    }

    pub fn set_blocked(&self, peer_id: &str, blocked: bool) -> Result<(), LinkError> {
        self.mutate(peer_id, |r| r.blocked = blocked)
    }

    pub fn set_paired(&self, peer_id: &str, paired: bool) -> Result<(), LinkError> {
        self.mutate(peer_id, |r| r.paired = paired)
    }

    pub fn set_stored(&self, peer_id: &str, stored: bool) -> Result<(), LinkError> {
        self.mutate(peer_id, |r| {
            r.stored = stored;
            if stored {
                r.temp_stored = false;
            }
        })
    }

    /// Applies the outcome of a successful pairing as one transactional
    /// write: paired plus whatever trust/save flags were chosen.
    pub fn apply_pairing(
        &self,
        peer_id: &str,
        trusted: bool,
        stored: bool,
    ) -> Result<(), LinkError> {
        self.mutate(peer_id, |r| {
            r.paired = true;
            if trusted {
                r.trusted = true;
            }
            if stored {
                r.stored = true;
                r.temp_stored = false;
            }
        })
    }

    /// Delete is only permitted for temp-stored, non-blocked, non-paired
    /// records; a record the user chose to save is never silently removed.
    pub fn delete(&self, peer_id: &str) -> Result<(), LinkError> {
        {
            let mut records = self.records.write();
            let rec = records
                .get(peer_id)
                .ok_or_else(|| LinkError::NoSuchPeer(peer_id.to_string()))?;
            if !rec.temp_stored || rec.blocked || rec.paired || rec.stored {
                return Err(LinkError::RecordProtected(peer_id.to_string()));
            }
            records.remove(peer_id);
        }
        self.states.write().remove(peer_id);
        self.persist()
    }

    /// Blocked dominates trusted, always.
    pub fn auto_decision(&self, peer_id: &str) -> AutoDecision {
        match self.get(peer_id) {
            Some(r) if r.blocked => AutoDecision::Reject,
            Some(r) if r.trusted => AutoDecision::Accept,
            _ => AutoDecision::Ask,
        }
    }

    // -- connectivity state ------------------------------------------------

    pub fn connection_state(&self, peer_id: &str) -> ConnectionState {
        self.states
            .read()
            .get(peer_id)
            .copied()
            .unwrap_or(ConnectionState::Disconnected)
    }

    /// Transitions are strictly ordered: a peer may always fall back to
    /// `Disconnected`, otherwise it moves at most one step forward —
    /// except that an already-paired peer re-establishing a socket may go
    /// straight from `Connected` to `Paired` without a new pairing run.
    pub fn set_connection_state(&self, peer_id: &str, next: ConnectionState) {
        let mut states = self.states.write();
        let cur = states
            .get(peer_id)
            .copied()
            .unwrap_or(ConnectionState::Disconnected);
        let legal = next == ConnectionState::Disconnected
            || next == cur
            || next as u8 == cur as u8 + 1
            // rejected pairing run falls back to plain connected
            || (cur == ConnectionState::Pairing && next == ConnectionState::Connected)
            || (cur == ConnectionState::Connected
                && next == ConnectionState::Paired
                && self.records.read().get(peer_id).is_some_and(|r| r.paired));
        if legal {
            states.insert(peer_id.to_string(), next);
        } else {
            warn!(peer = %peer_id, ?cur, ?next, "illegal connection state transition dropped");
        }
    }

    /// Raise the state to at least `floor` (no-op when already past it).
    pub fn advance_state_min(&self, peer_id: &str, floor: ConnectionState) {
        if self.connection_state(peer_id) < floor {
            self.set_connection_state(peer_id, floor);
        }
    }

    pub fn mark_all_disconnected(&self) -> Vec<String> {
        let mut states = self.states.write();
        let affected: Vec<String> = states
            .iter()
            .filter(|(_, s)| **s != ConnectionState::Disconnected)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &affected {
            states.insert(id.clone(), ConnectionState::Disconnected);
        }
        affected
    }

    // -- internals ---------------------------------------------------------

    fn mutate(&self, peer_id: &str, f: impl FnOnce(&mut PeerRecord)) -> Result<(), LinkError> {
        {
            let mut records = self.records.write();
            let rec = records
                .get_mut(peer_id)
                .ok_or_else(|| LinkError::NoSuchPeer(peer_id.to_string()))?;
            f(rec);
        }
        self.persist()
    }

    fn persist(&self) -> Result<(), LinkError> {
        let snapshot: Vec<PeerRecord> = self
            .records
            .read()
            .values()
            .filter(|r| r.persistent())
            .cloned()
            .collect();
        self.backend.save(&snapshot)
    }
}

/// Stable local device identity, generated once and persisted next to the
/// peer records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub id: String,
    #[serde(rename = "profileId")]
    pub profile_id: String,
}

impl DeviceIdentity {
    pub fn load_or_create(data_dir: &std::path::Path) -> Result<Self, LinkError> {
        let path = data_dir.join("identity.json");
        if path.exists() {
            let text = std::fs::read_to_string(&path).map_err(|e| LinkError::Store(e.to_string()))?;
            return serde_json::from_str(&text).map_err(|e| LinkError::Store(e.to_string()));
        }
        let identity = Self {
            id: uuid::Uuid::new_v4().to_string(),
            profile_id: uuid::Uuid::new_v4().to_string(),
        };
        std::fs::create_dir_all(data_dir).map_err(|e| LinkError::Store(e.to_string()))?;
        let tmp = path.with_extension("json.tmp");
        let text =
            serde_json::to_string_pretty(&identity).map_err(|e| LinkError::Store(e.to_string()))?;
        std::fs::write(&tmp, text).map_err(|e| LinkError::Store(e.to_string()))?;
        std::fs::rename(&tmp, &path).map_err(|e| LinkError::Store(e.to_string()))?;
        Ok(identity)
    }
}

pub fn loopback() -> IpAddr {
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> PeerStore {
        PeerStore::open(Box::new(MemoryRecordStore::default())).unwrap()
    }

    fn seed(store: &PeerStore, id: &str) {
        store
            .upsert_discovered(PeerRecord::discovered(
                id, "Peer", "profile", "linux", loopback(), 8080,
            ))
            .unwrap();
    }

    #[test]
    fn blocked_dominates_trusted() {
        let s = store();
        seed(&s, "p1");
        s.set_trusted("p1", true).unwrap();
        assert_eq!(s.auto_decision("p1"), AutoDecision::Accept);
        s.set_blocked("p1", true).unwrap();
        // trusted flag is still set, but blocked wins
        assert!(s.get("p1").unwrap().trusted);
        assert_eq!(s.auto_decision("p1"), AutoDecision::Reject);
        assert_eq!(s.get("p1").unwrap().status(true), PeerStatus::Blocked);
    }

    #[test]
    fn unknown_peer_requires_operator_decision() {
        let s = store();
        assert_eq!(s.auto_decision("ghost"), AutoDecision::Ask);
    }

    #[test]
    fn delete_guards_saved_blocked_and_paired_records() {
        let s = store();
        seed(&s, "temp");
        seed(&s, "saved");
        seed(&s, "blocked");
        s.set_stored("saved", true).unwrap();
        s.set_blocked("blocked", true).unwrap();

        assert!(s.delete("temp").is_ok());
        assert!(matches!(s.delete("saved"), Err(LinkError::RecordProtected(_))));
        assert!(matches!(
            s.delete("blocked"),
            Err(LinkError::RecordProtected(_))
        ));
        assert!(matches!(s.delete("temp"), Err(LinkError::NoSuchPeer(_))));
    }

    #[test]
    fn temp_records_are_not_persisted_unless_blocked() {
        let backend = Box::new(MemoryRecordStore::default());
        let s = PeerStore::open(backend).unwrap();
        seed(&s, "temp");
        seed(&s, "blocked");
        seed(&s, "promoted");
        s.set_blocked("blocked", true).unwrap();
        s.set_stored("promoted", true).unwrap();

        // reopen from the same backend contents by round-tripping a save
        let snapshot: Vec<PeerRecord> = s
            .list(PeerFilter::All)
            .into_iter()
            .filter(|r| !r.temp_stored || r.blocked)
            .collect();
        let ids: Vec<&str> = snapshot.iter().map(|r| r.id.as_str()).collect();
        assert!(ids.contains(&"blocked"));
        assert!(ids.contains(&"promoted"));
        assert!(!ids.contains(&"temp"));
    }

    #[test]
    fn upsert_same_identity_never_duplicates() {
        let s = store();
        seed(&s, "p1");
        let is_new = s
            .upsert_discovered(PeerRecord::discovered(
                "p1",
                "Renamed",
                "profile",
                "macos",
                loopback(),
                8081,
            ))
            .unwrap();
        assert!(!is_new);
        let all = s.list(PeerFilter::All);
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].display_name, "Renamed");
        assert_eq!(all[0].port, 8081);
    }

    #[test]
    fn pairing_applies_flags_in_one_write() {
        let s = store();
        seed(&s, "p1");
        s.apply_pairing("p1", true, true).unwrap();
        let r = s.get("p1").unwrap();
        assert!(r.paired && r.trusted && r.stored);
        assert!(!r.temp_stored);
        assert_eq!(r.status(true), PeerStatus::Paired);
    }

    #[test]
    fn connection_state_moves_one_step_or_back_to_disconnected() {
        let s = store();
        seed(&s, "p1");
        s.set_connection_state("p1", ConnectionState::Discovered);
        // skipping Connected -> Pairing is illegal and dropped
        s.set_connection_state("p1", ConnectionState::Pairing);
        assert_eq!(s.connection_state("p1"), ConnectionState::Discovered);
        s.set_connection_state("p1", ConnectionState::Connected);
        s.set_connection_state("p1", ConnectionState::Pairing);
        s.set_connection_state("p1", ConnectionState::Paired);
        assert_eq!(s.connection_state("p1"), ConnectionState::Paired);
        s.set_connection_state("p1", ConnectionState::Disconnected);
        assert_eq!(s.connection_state("p1"), ConnectionState::Disconnected);
    }

    #[test]
    fn reconnect_of_paired_peer_skips_pairing_run() {
        let s = store();
        seed(&s, "p1");
        s.apply_pairing("p1", false, false).unwrap();
        s.set_connection_state("p1", ConnectionState::Discovered);
        s.set_connection_state("p1", ConnectionState::Connected);
        s.set_connection_state("p1", ConnectionState::Paired);
        assert_eq!(s.connection_state("p1"), ConnectionState::Paired);
    }
}
