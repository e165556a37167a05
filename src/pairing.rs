//! Pairing state machine.
//!
//! Outbound: one request per peer may be in flight; duplicates are
//! rejected locally without retransmitting. Inbound: requests from
//! trusted peers are auto-accepted, blocked peers are auto-rejected
//! without ever surfacing, everything else queues for an operator
//! decision. Decisions are one-shot per request id.

use crate::config::Config;
use crate::error::LinkError;
use crate::events::{CoreEvent, EventBus};
use crate::protocol::{PairingRequestMsg, PairingResponseMsg, Payload};
use crate::session::SessionManager;
use crate::store::{AutoDecision, ConnectionState, PeerStore};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
struct OutboundRequest {
    request_id: String,
    trust_user: bool,
    save_connection: bool,
    created: DateTime<Utc>,
}

/// An inbound request awaiting an operator decision.
#[derive(Debug, Clone)]
pub struct PendingPairing {
    pub request_id: String,
    pub peer_id: String,
    pub display_name: String,
    pub trust_user: bool,
    pub save_connection: bool,
    pub created: DateTime<Utc>,
}

pub struct Pairing {
    config: Config,
    store: Arc<PeerStore>,
    sessions: SessionManager,
    events: EventBus,
    display_name: String,
    platform: String,
    outbound: Mutex<HashMap<String, OutboundRequest>>,
    pending: Mutex<HashMap<String, PendingPairing>>,
}

impl Pairing {
    pub fn new(
        config: Config,
        store: Arc<PeerStore>,
        sessions: SessionManager,
        events: EventBus,
        display_name: String,
        platform: String,
    ) -> Self {
        Self {
            config,
            store,
            sessions,
            events,
            display_name,
            platform,
            outbound: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Start an outbound pairing negotiation. At most one per peer may be
    /// undecided at a time; a duplicate is a local error, never a resend.
    pub async fn send_request(
        &self,
        peer_id: &str,
        trust_user: bool,
        save_connection: bool,
    ) -> Result<String, LinkError> {
        let record = self
            .store
            .get(peer_id)
            .ok_or_else(|| LinkError::NoSuchPeer(peer_id.to_string()))?;
        if record.blocked {
            return Err(LinkError::PeerBlocked(peer_id.to_string()));
        }
        let request_id = Uuid::new_v4().to_string();
        {
            // check and insert under one lock; two concurrent calls must
            // not both pass the dedupe gate
            let mut outbound = self.outbound.lock();
            if outbound.contains_key(peer_id)
                || self.pending.lock().values().any(|p| p.peer_id == peer_id)
            {
                return Err(LinkError::PairingInFlight(peer_id.to_string()));
            }
            outbound.insert(
                peer_id.to_string(),
                OutboundRequest {
                    request_id: request_id.clone(),
                    trust_user,
                    save_connection,
                    created: Utc::now(),
                },
            );
        }

        let msg = Payload::PairingRequest(PairingRequestMsg {
            request_id: request_id.clone(),
            display_name: self.display_name.clone(),
            platform: self.platform.clone(),
            trust_user,
            save_connection,
        });
        if let Err(e) = self.sessions.send_to_peer(peer_id, msg).await {
            self.outbound.lock().remove(peer_id);
            return Err(e);
        }
        self.store
            .advance_state_min(peer_id, ConnectionState::Pairing);
        info!(peer = %peer_id, request = %request_id, "pairing request sent");
        Ok(request_id)
    }

    /// Inbound pairing request from the wire.
    pub async fn handle_request(&self, peer_id: &str, msg: PairingRequestMsg) {
        match self.store.auto_decision(peer_id) {
            AutoDecision::Reject => {
                // blocked peers never reach the operator
                info!(peer = %peer_id, "pairing request from blocked peer auto-rejected");
                self.send_response(peer_id, &msg.request_id, false, false, false, Some("rejected"))
                    .await;
            }
            AutoDecision::Accept => {
                info!(peer = %peer_id, "pairing request from trusted peer auto-accepted");
                let stored = self.store.get(peer_id).is_some_and(|r| r.stored);
                if let Err(e) = self.store.apply_pairing(peer_id, true, stored) {
                    warn!(peer = %peer_id, error = %e, "could not persist auto-accept");
                    return;
                }
                self.store
                    .advance_state_min(peer_id, ConnectionState::Pairing);
                self.store
                    .set_connection_state(peer_id, ConnectionState::Paired);
                self.send_response(peer_id, &msg.request_id, true, true, stored, None)
                    .await;
                self.events.emit(CoreEvent::Paired {
                    peer_id: peer_id.to_string(),
                });
            }
            AutoDecision::Ask => {
                let mut pending = self.pending.lock();
                if pending.values().any(|p| p.peer_id == peer_id) {
                    debug!(peer = %peer_id, "duplicate pairing request dropped, one already pending");
                    return;
                }
                pending.insert(
                    msg.request_id.clone(),
                    PendingPairing {
                        request_id: msg.request_id.clone(),
                        peer_id: peer_id.to_string(),
                        display_name: msg.display_name.clone(),
                        trust_user: msg.trust_user,
                        save_connection: msg.save_connection,
                        created: Utc::now(),
                    },
                );
                drop(pending);
                self.store
                    .advance_state_min(peer_id, ConnectionState::Pairing);
                self.events.emit(CoreEvent::PairingRequested {
                    request_id: msg.request_id,
                    peer_id: peer_id.to_string(),
                    display_name: msg.display_name,
                });
            }
        }
    }

    /// Operator decision on a pending inbound request. One-shot: the
    /// request leaves the queue whatever else happens.
    pub async fn respond(
        &self,
        request_id: &str,
        accept: bool,
        trust_user: bool,
        save_connection: bool,
    ) -> Result<(), LinkError> {
        let pending = self
            .pending
            .lock()
            .remove(request_id)
            .ok_or_else(|| LinkError::NoSuchRequest(request_id.to_string()))?;
        let peer_id = pending.peer_id.clone();

        if accept {
            self.store
                .apply_pairing(&peer_id, trust_user, save_connection)?;
            self.store
                .set_connection_state(&peer_id, ConnectionState::Paired);
            self.send_response(&peer_id, request_id, true, trust_user, save_connection, None)
                .await;
            self.events.emit(CoreEvent::Paired {
                peer_id: peer_id.clone(),
            });
            self.events.emit(CoreEvent::PairingDecided {
                peer_id,
                accepted: true,
            });
        } else {
            // the queue entry is already gone; the reject is best-effort
            self.send_response(&peer_id, request_id, false, false, false, Some("rejected"))
                .await;
            self.store
                .set_connection_state(&peer_id, ConnectionState::Connected);
            self.events.emit(CoreEvent::PairingDecided {
                peer_id,
                accepted: false,
            });
        }
        Ok(())
    }

    /// Response to our outbound request.
    pub fn handle_response(&self, peer_id: &str, msg: PairingResponseMsg) {
        let out = {
            let mut outbound = self.outbound.lock();
            match outbound.get(peer_id) {
                Some(o) if o.request_id == msg.request_id => outbound.remove(peer_id),
                _ => None,
            }
        };
        let Some(out) = out else {
            debug!(peer = %peer_id, request = %msg.request_id, "stale pairing response dropped");
            return;
        };

        if msg.accepted {
            // the responder's trust decision extends to us: either side
            // opting in marks the other end trusted
            let trusted = out.trust_user || msg.trust_user;
            if let Err(e) = self
                .store
                .apply_pairing(peer_id, trusted, out.save_connection)
            {
                warn!(peer = %peer_id, error = %e, "could not persist pairing result");
                return;
            }
            self.store
                .set_connection_state(peer_id, ConnectionState::Paired);
            info!(peer = %peer_id, "pairing accepted");
            self.events.emit(CoreEvent::Paired {
                peer_id: peer_id.to_string(),
            });
            self.events.emit(CoreEvent::PairingDecided {
                peer_id: peer_id.to_string(),
                accepted: true,
            });
        } else {
            info!(peer = %peer_id, message = ?msg.message, "pairing rejected by peer");
            self.store
                .set_connection_state(peer_id, ConnectionState::Connected);
            self.events.emit(CoreEvent::PairingDecided {
                peer_id: peer_id.to_string(),
                accepted: false,
            });
        }
    }

    /// Pending inbound requests still young enough to surface.
    pub fn pending_requests(&self) -> Vec<PendingPairing> {
        let cutoff = Utc::now() - ChronoDuration::seconds(self.config.request_surface_secs);
        let mut out: Vec<PendingPairing> = self
            .pending
            .lock()
            .values()
            .filter(|p| p.created > cutoff)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.created.cmp(&b.created));
        out
    }

    /// Housekeeping: physically expire requests nobody answered. Expired
    /// inbound requests get a best-effort reject so the origin peer is not
    /// left waiting forever.
    pub async fn expire(&self) {
        let cutoff = Utc::now() - ChronoDuration::seconds(self.config.request_expiry_secs);

        let expired_in: Vec<PendingPairing> = {
            let mut pending = self.pending.lock();
            let ids: Vec<String> = pending
                .values()
                .filter(|p| p.created <= cutoff)
                .map(|p| p.request_id.clone())
                .collect();
            ids.into_iter().filter_map(|id| pending.remove(&id)).collect()
        };
        for p in expired_in {
            info!(peer = %p.peer_id, request = %p.request_id, "pairing request expired");
            self.send_response(&p.peer_id, &p.request_id, false, false, false, Some("expired"))
                .await;
            self.store
                .set_connection_state(&p.peer_id, ConnectionState::Connected);
            self.events.emit(CoreEvent::PairingDecided {
                peer_id: p.peer_id,
                accepted: false,
            });
        }

        let expired_out: Vec<String> = {
            let mut outbound = self.outbound.lock();
            let ids: Vec<String> = outbound
                .iter()
                .filter(|(_, o)| o.created <= cutoff)
                .map(|(peer, _)| peer.clone())
                .collect();
            for id in &ids {
                outbound.remove(id);
            }
            ids
        };
        for peer_id in expired_out {
            info!(peer = %peer_id, "outbound pairing request timed out");
            self.store
                .set_connection_state(&peer_id, ConnectionState::Connected);
            self.events.emit(CoreEvent::PairingDecided {
                peer_id,
                accepted: false,
            });
        }
    }

    /// Blocking a peer mid-decision kills any pending request from it.
    pub async fn reject_all_from(&self, peer_id: &str) {
        let mine: Vec<PendingPairing> = {
            let mut pending = self.pending.lock();
            let ids: Vec<String> = pending
                .values()
                .filter(|p| p.peer_id == peer_id)
                .map(|p| p.request_id.clone())
                .collect();
            ids.into_iter().filter_map(|id| pending.remove(&id)).collect()
        };
        for p in mine {
            self.send_response(&p.peer_id, &p.request_id, false, false, false, Some("rejected"))
                .await;
        }
    }

    async fn send_response(
        &self,
        peer_id: &str,
        request_id: &str,
        accepted: bool,
        trust_user: bool,
        save_connection: bool,
        message: Option<&str>,
    ) {
        let msg = Payload::PairingResponse(PairingResponseMsg {
            request_id: request_id.to_string(),
            accepted,
            trust_user,
            save_connection,
            message: message.map(str::to_string),
        });
        if let Err(e) = self.sessions.send_to_peer(peer_id, msg).await {
            // removal already happened; losing the response is survivable
            warn!(peer = %peer_id, error = %e, "could not deliver pairing response");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Announce;
    use crate::store::{MemoryRecordStore, PeerRecord};
    use std::net::{IpAddr, Ipv4Addr};

    fn pairing_with_peer() -> (Pairing, Arc<PeerStore>, EventBus) {
        let store = Arc::new(PeerStore::open(Box::new(MemoryRecordStore::default())).unwrap());
        store
            .upsert_discovered(PeerRecord::discovered(
                "peer-1",
                "Peer",
                "profile",
                "linux",
                IpAddr::V4(Ipv4Addr::LOCALHOST),
                1, // nothing listens here; responses fail fast
            ))
            .unwrap();
        let events = EventBus::new();
        let config = Config {
            connect_timeout_ms: 50,
            ..Config::default()
        };
        let (sessions, _inbound) = SessionManager::new(
            "self".into(),
            config.clone(),
            store.clone(),
            events.clone(),
            Announce {
                display_name: "self".into(),
                profile_id: "p".into(),
                platform: "linux".into(),
                port: 0,
            },
        );
        (
            Pairing::new(
                config,
                store.clone(),
                sessions,
                events.clone(),
                "self".into(),
                "linux".into(),
            ),
            store,
            events,
        )
    }

    fn request_msg(id: &str) -> PairingRequestMsg {
        PairingRequestMsg {
            request_id: id.to_string(),
            display_name: "Peer".into(),
            platform: "linux".into(),
            trust_user: false,
            save_connection: false,
        }
    }

    #[tokio::test]
    async fn second_outbound_request_to_the_same_peer_is_refused() {
        let (pairing, _, _) = pairing_with_peer();
        pairing.outbound.lock().insert(
            "peer-1".into(),
            OutboundRequest {
                request_id: "r0".into(),
                trust_user: false,
                save_connection: false,
                created: Utc::now(),
            },
        );
        assert!(matches!(
            pairing.send_request("peer-1", false, false).await.unwrap_err(),
            LinkError::PairingInFlight(_)
        ));
    }

    #[tokio::test]
    async fn duplicate_inbound_request_queues_once() {
        let (pairing, _, _) = pairing_with_peer();
        pairing.handle_request("peer-1", request_msg("r1")).await;
        pairing.handle_request("peer-1", request_msg("r2")).await;
        assert_eq!(pairing.pending_requests().len(), 1);

        // and an undecided inbound request blocks a new outbound one
        assert!(matches!(
            pairing.send_request("peer-1", false, false).await.unwrap_err(),
            LinkError::PairingInFlight(_)
        ));
    }

    #[tokio::test]
    async fn respond_is_one_shot_and_updates_the_roster() {
        let (pairing, store, _) = pairing_with_peer();
        pairing.handle_request("peer-1", request_msg("r1")).await;
        pairing.respond("r1", true, true, false).await.unwrap();

        let rec = store.get("peer-1").unwrap();
        assert!(rec.paired);
        assert!(rec.trusted);

        assert!(matches!(
            pairing.respond("r1", true, false, false).await.unwrap_err(),
            LinkError::NoSuchRequest(_)
        ));
    }

    #[tokio::test]
    async fn stale_response_is_dropped() {
        let (pairing, store, _) = pairing_with_peer();
        pairing.handle_response(
            "peer-1",
            PairingResponseMsg {
                request_id: "ghost".into(),
                accepted: true,
                trust_user: true,
                save_connection: true,
                message: None,
            },
        );
        assert!(!store.get("peer-1").unwrap().paired);
    }

    #[tokio::test]
    async fn unanswered_requests_expire_as_declined() {
        let (pairing, _, events) = pairing_with_peer();
        pairing.pending.lock().insert(
            "r1".into(),
            PendingPairing {
                request_id: "r1".into(),
                peer_id: "peer-1".into(),
                display_name: "Peer".into(),
                trust_user: false,
                save_connection: false,
                created: Utc::now() - ChronoDuration::seconds(500),
            },
        );
        let mut rx = events.subscribe();
        pairing.expire().await;
        assert!(pairing.pending.lock().is_empty());
        let ev = rx.recv().await.unwrap();
        assert!(matches!(
            ev,
            CoreEvent::PairingDecided { accepted: false, .. }
        ));
    }
}
