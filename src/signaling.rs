//! Signaling relay for remote-control and screen-sharing sessions.
//!
//! The core negotiates who may start a session and relays opaque payloads
//! (input events, media signaling blobs) between the two ends; capture,
//! injection and encoding belong to platform collaborators that consume
//! the emitted events. At most one session of each kind is active at a
//! time, independently per kind.

use crate::config::Config;
use crate::error::LinkError;
use crate::events::{CoreEvent, EventBus};
use crate::protocol::{
    Payload, QualityProfile, RemoteControlEventMsg, ScreenSharingRequestMsg,
    ScreenSharingResponseMsg, ScreenSharingSignalMsg, SessionDisconnectMsg, SessionRequestMsg,
    SessionResponseMsg, SignalKind,
};
use crate::session::SessionManager;
use crate::store::{AutoDecision, PeerStore};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    RemoteControl,
    ScreenSharing,
}

impl SessionKind {
    fn label(&self) -> &'static str {
        match self {
            SessionKind::RemoteControl => "remote control",
            SessionKind::ScreenSharing => "screen sharing",
        }
    }
}

/// Inbound session request awaiting an operator decision.
#[derive(Debug, Clone)]
pub struct PendingSignal {
    pub request_id: String,
    pub peer_id: String,
    pub kind: SessionKind,
    /// Requested quality, screen sharing only.
    pub quality: Option<QualityProfile>,
    pub created: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct OutboundSignal {
    peer_id: String,
    quality: Option<QualityProfile>,
    created: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ActiveSession {
    pub session_id: String,
    pub peer_id: String,
    /// True on the side that sent the request (the controller for remote
    /// control, the viewer for screen sharing).
    pub initiated_by_us: bool,
    pub quality: Option<QualityProfile>,
}

#[derive(Default)]
struct Slot {
    pending: HashMap<String, PendingSignal>,
    outbound: HashMap<String, OutboundSignal>,
    active: Option<ActiveSession>,
}

pub struct Signaling {
    config: Config,
    store: Arc<PeerStore>,
    sessions: SessionManager,
    events: EventBus,
    remote_control: Mutex<Slot>,
    screen_sharing: Mutex<Slot>,
}

impl Signaling {
    pub fn new(
        config: Config,
        store: Arc<PeerStore>,
        sessions: SessionManager,
        events: EventBus,
    ) -> Self {
        Self {
            config,
            store,
            sessions,
            events,
            remote_control: Mutex::new(Slot::default()),
            screen_sharing: Mutex::new(Slot::default()),
        }
    }

    fn slot(&self, kind: SessionKind) -> &Mutex<Slot> {
        match kind {
            SessionKind::RemoteControl => &self.remote_control,
            SessionKind::ScreenSharing => &self.screen_sharing,
        }
    }

    /// Gate every outbound request: paired, not blocked, slot free.
    fn check_can_request(&self, kind: SessionKind, peer_id: &str) -> Result<(), LinkError> {
        let record = self
            .store
            .get(peer_id)
            .ok_or_else(|| LinkError::NoSuchPeer(peer_id.to_string()))?;
        if record.blocked {
            return Err(LinkError::PeerBlocked(peer_id.to_string()));
        }
        if !record.paired {
            return Err(LinkError::NotPaired(peer_id.to_string()));
        }
        let slot = self.slot(kind).lock();
        if slot.active.is_some() || !slot.outbound.is_empty() {
            return Err(LinkError::SessionBusy(kind.label()));
        }
        Ok(())
    }

    // -- remote control ----------------------------------------------------

    /// Ask a paired peer to let us control it.
    pub async fn request_remote_control(&self, peer_id: &str) -> Result<String, LinkError> {
        self.check_can_request(SessionKind::RemoteControl, peer_id)?;
        let request_id = Uuid::new_v4().to_string();
        self.remote_control.lock().outbound.insert(
            request_id.clone(),
            OutboundSignal {
                peer_id: peer_id.to_string(),
                quality: None,
                created: Utc::now(),
            },
        );
        let msg = Payload::RemoteControlRequest(SessionRequestMsg {
            request_id: request_id.clone(),
        });
        if let Err(e) = self.sessions.send_to_peer(peer_id, msg).await {
            self.remote_control.lock().outbound.remove(&request_id);
            return Err(e);
        }
        info!(peer = %peer_id, request = %request_id, "remote control requested");
        Ok(request_id)
    }

    pub async fn handle_rc_request(&self, peer_id: &str, msg: SessionRequestMsg) {
        if !self.store.get(peer_id).is_some_and(|r| r.paired) {
            info!(peer = %peer_id, "remote control request from unpaired peer rejected");
            self.send_rc_response(peer_id, &msg.request_id, false, None, Some("not paired"))
                .await;
            return;
        }
        // an in-flight outbound request occupies the slot too; crossed
        // simultaneous requests must not both get accepted
        let busy = {
            let slot = self.remote_control.lock();
            slot.active.is_some() || !slot.outbound.is_empty()
        };
        if busy {
            self.send_rc_response(peer_id, &msg.request_id, false, None, Some("busy"))
                .await;
            return;
        }
        match self.store.auto_decision(peer_id) {
            AutoDecision::Reject => {
                info!(peer = %peer_id, "remote control request from blocked peer auto-rejected");
                self.send_rc_response(peer_id, &msg.request_id, false, None, Some("rejected"))
                    .await;
            }
            AutoDecision::Accept => {
                debug!(peer = %peer_id, "remote control request from trusted peer auto-accepted");
                self.accept_rc(peer_id, &msg.request_id).await;
            }
            AutoDecision::Ask => {
                self.remote_control.lock().pending.insert(
                    msg.request_id.clone(),
                    PendingSignal {
                        request_id: msg.request_id.clone(),
                        peer_id: peer_id.to_string(),
                        kind: SessionKind::RemoteControl,
                        quality: None,
                        created: Utc::now(),
                    },
                );
                self.events.emit(CoreEvent::RemoteControlRequested {
                    request_id: msg.request_id,
                    peer_id: peer_id.to_string(),
                });
            }
        }
    }

    /// Operator decision on a pending remote-control request. One-shot.
    pub async fn respond_remote_control(
        &self,
        request_id: &str,
        accept: bool,
    ) -> Result<(), LinkError> {
        let pending = self
            .remote_control
            .lock()
            .pending
            .remove(request_id)
            .ok_or_else(|| LinkError::NoSuchRequest(request_id.to_string()))?;
        if accept {
            if self.remote_control.lock().active.is_some() {
                self.send_rc_response(&pending.peer_id, request_id, false, None, Some("busy"))
                    .await;
                return Err(LinkError::SessionBusy(SessionKind::RemoteControl.label()));
            }
            self.accept_rc(&pending.peer_id, request_id).await;
        } else {
            self.send_rc_response(&pending.peer_id, request_id, false, None, Some("rejected"))
                .await;
        }
        Ok(())
    }

    async fn accept_rc(&self, peer_id: &str, request_id: &str) {
        let session_id = Uuid::new_v4().to_string();
        self.remote_control.lock().active = Some(ActiveSession {
            session_id: session_id.clone(),
            peer_id: peer_id.to_string(),
            initiated_by_us: false,
            quality: None,
        });
        self.send_rc_response(peer_id, request_id, true, Some(&session_id), None)
            .await;
        self.events.emit(CoreEvent::RemoteControlStarted {
            session_id,
            peer_id: peer_id.to_string(),
            controlling: false,
        });
    }

    pub async fn handle_rc_response(&self, peer_id: &str, msg: SessionResponseMsg) {
        let out = self.remote_control.lock().outbound.remove(&msg.request_id);
        let Some(out) = out else {
            debug!(peer = %peer_id, request = %msg.request_id, "stale remote control response dropped");
            return;
        };
        if out.peer_id != peer_id {
            warn!(peer = %peer_id, "remote control response from wrong peer dropped");
            return;
        }
        match (msg.accepted, msg.session_id) {
            (true, Some(session_id)) => {
                let installed = {
                    let mut slot = self.remote_control.lock();
                    if slot.active.is_some() {
                        false
                    } else {
                        slot.active = Some(ActiveSession {
                            session_id: session_id.clone(),
                            peer_id: peer_id.to_string(),
                            initiated_by_us: true,
                            quality: None,
                        });
                        true
                    }
                };
                if !installed {
                    // a session landed while the response was in flight;
                    // the accepted one is torn down, not adopted
                    warn!(peer = %peer_id, session = %session_id, "remote control accepted while a session is active, disconnecting it");
                    let _ = self
                        .sessions
                        .send_to_peer(
                            peer_id,
                            Payload::RemoteControlDisconnect(SessionDisconnectMsg { session_id }),
                        )
                        .await;
                    return;
                }
                info!(peer = %peer_id, session = %session_id, "remote control session started");
                self.events.emit(CoreEvent::RemoteControlStarted {
                    session_id,
                    peer_id: peer_id.to_string(),
                    controlling: true,
                });
            }
            _ => {
                info!(peer = %peer_id, message = ?msg.message, "remote control request rejected");
                self.events.emit(CoreEvent::RemoteControlRejected {
                    request_id: msg.request_id,
                });
            }
        }
    }

    /// Relay an opaque input event to the controlled end. Controller side
    /// only.
    pub async fn send_input(&self, event: serde_json::Value) -> Result<(), LinkError> {
        let (session_id, peer_id) = {
            let slot = self.remote_control.lock();
            match &slot.active {
                Some(s) if s.initiated_by_us => (s.session_id.clone(), s.peer_id.clone()),
                _ => return Err(LinkError::NoActiveSession(SessionKind::RemoteControl.label())),
            }
        };
        self.sessions
            .send_to_peer(
                &peer_id,
                Payload::RemoteControlEvent(RemoteControlEventMsg { session_id, event }),
            )
            .await
    }

    pub fn handle_rc_event(&self, peer_id: &str, msg: RemoteControlEventMsg) {
        let slot = self.remote_control.lock();
        match &slot.active {
            // only the controlled end injects input
            Some(s) if s.session_id == msg.session_id && s.peer_id == peer_id && !s.initiated_by_us => {
                self.events.emit(CoreEvent::RemoteControlInput {
                    session_id: msg.session_id,
                    event: msg.event,
                });
            }
            _ => debug!(peer = %peer_id, "input event outside an active session dropped"),
        }
    }

    async fn send_rc_response(
        &self,
        peer_id: &str,
        request_id: &str,
        accepted: bool,
        session_id: Option<&str>,
        message: Option<&str>,
    ) {
        let msg = Payload::RemoteControlResponse(SessionResponseMsg {
            request_id: request_id.to_string(),
            accepted,
            session_id: session_id.map(str::to_string),
            message: message.map(str::to_string),
        });
        if let Err(e) = self.sessions.send_to_peer(peer_id, msg).await {
            warn!(peer = %peer_id, error = %e, "could not deliver remote control response");
        }
    }

    // -- screen sharing ----------------------------------------------------

    /// Ask a paired peer to share its screen with us.
    pub async fn request_screen_sharing(
        &self,
        peer_id: &str,
        quality: QualityProfile,
        source_index: Option<u32>,
    ) -> Result<String, LinkError> {
        self.check_can_request(SessionKind::ScreenSharing, peer_id)?;
        let request_id = Uuid::new_v4().to_string();
        self.screen_sharing.lock().outbound.insert(
            request_id.clone(),
            OutboundSignal {
                peer_id: peer_id.to_string(),
                quality: Some(quality),
                created: Utc::now(),
            },
        );
        let msg = Payload::ScreenSharingRequest(ScreenSharingRequestMsg {
            request_id: request_id.clone(),
            quality,
            source_index,
        });
        if let Err(e) = self.sessions.send_to_peer(peer_id, msg).await {
            self.screen_sharing.lock().outbound.remove(&request_id);
            return Err(e);
        }
        info!(peer = %peer_id, request = %request_id, "screen sharing requested");
        Ok(request_id)
    }

    pub async fn handle_ss_request(&self, peer_id: &str, msg: ScreenSharingRequestMsg) {
        if !self.store.get(peer_id).is_some_and(|r| r.paired) {
            info!(peer = %peer_id, "screen sharing request from unpaired peer rejected");
            self.send_ss_response(peer_id, &msg.request_id, false, None, None, Some("not paired"))
                .await;
            return;
        }
        let busy = {
            let slot = self.screen_sharing.lock();
            slot.active.is_some() || !slot.outbound.is_empty()
        };
        if busy {
            self.send_ss_response(peer_id, &msg.request_id, false, None, None, Some("busy"))
                .await;
            return;
        }
        match self.store.auto_decision(peer_id) {
            AutoDecision::Reject => {
                info!(peer = %peer_id, "screen sharing request from blocked peer auto-rejected");
                self.send_ss_response(peer_id, &msg.request_id, false, None, None, Some("rejected"))
                    .await;
            }
            AutoDecision::Accept => {
                debug!(peer = %peer_id, "screen sharing request from trusted peer auto-accepted");
                self.accept_ss(peer_id, &msg.request_id, msg.quality).await;
            }
            AutoDecision::Ask => {
                self.screen_sharing.lock().pending.insert(
                    msg.request_id.clone(),
                    PendingSignal {
                        request_id: msg.request_id.clone(),
                        peer_id: peer_id.to_string(),
                        kind: SessionKind::ScreenSharing,
                        quality: Some(msg.quality),
                        created: Utc::now(),
                    },
                );
                self.events.emit(CoreEvent::ScreenSharingRequested {
                    request_id: msg.request_id,
                    peer_id: peer_id.to_string(),
                    quality: msg.quality,
                });
            }
        }
    }

    /// Operator decision on a pending screen-sharing request. The accepting
    /// side may downgrade the requested quality.
    pub async fn respond_screen_sharing(
        &self,
        request_id: &str,
        accept: bool,
        quality_override: Option<QualityProfile>,
    ) -> Result<(), LinkError> {
        let pending = self
            .screen_sharing
            .lock()
            .pending
            .remove(request_id)
            .ok_or_else(|| LinkError::NoSuchRequest(request_id.to_string()))?;
        if accept {
            if self.screen_sharing.lock().active.is_some() {
                self.send_ss_response(&pending.peer_id, request_id, false, None, None, Some("busy"))
                    .await;
                return Err(LinkError::SessionBusy(SessionKind::ScreenSharing.label()));
            }
            let quality = quality_override
                .or(pending.quality)
                .unwrap_or_default();
            self.accept_ss(&pending.peer_id, request_id, quality).await;
        } else {
            self.send_ss_response(&pending.peer_id, request_id, false, None, None, Some("rejected"))
                .await;
        }
        Ok(())
    }

    async fn accept_ss(&self, peer_id: &str, request_id: &str, quality: QualityProfile) {
        let session_id = Uuid::new_v4().to_string();
        self.screen_sharing.lock().active = Some(ActiveSession {
            session_id: session_id.clone(),
            peer_id: peer_id.to_string(),
            initiated_by_us: false,
            quality: Some(quality),
        });
        self.send_ss_response(peer_id, request_id, true, Some(&session_id), Some(quality), None)
            .await;
        self.events.emit(CoreEvent::ScreenSharingStarted {
            session_id,
            peer_id: peer_id.to_string(),
            sending: true,
            quality,
        });
    }

    pub async fn handle_ss_response(&self, peer_id: &str, msg: ScreenSharingResponseMsg) {
        let out = self.screen_sharing.lock().outbound.remove(&msg.request_id);
        let Some(out) = out else {
            debug!(peer = %peer_id, request = %msg.request_id, "stale screen sharing response dropped");
            return;
        };
        if out.peer_id != peer_id {
            warn!(peer = %peer_id, "screen sharing response from wrong peer dropped");
            return;
        }
        match (msg.accepted, msg.session_id) {
            (true, Some(session_id)) => {
                let quality = msg.quality.or(out.quality).unwrap_or_default();
                let installed = {
                    let mut slot = self.screen_sharing.lock();
                    if slot.active.is_some() {
                        false
                    } else {
                        slot.active = Some(ActiveSession {
                            session_id: session_id.clone(),
                            peer_id: peer_id.to_string(),
                            initiated_by_us: true,
                            quality: Some(quality),
                        });
                        true
                    }
                };
                if !installed {
                    warn!(peer = %peer_id, session = %session_id, "screen sharing accepted while a session is active, disconnecting it");
                    let _ = self
                        .sessions
                        .send_to_peer(
                            peer_id,
                            Payload::ScreenSharingDisconnect(SessionDisconnectMsg { session_id }),
                        )
                        .await;
                    return;
                }
                info!(peer = %peer_id, session = %session_id, "screen sharing session started");
                self.events.emit(CoreEvent::ScreenSharingStarted {
                    session_id,
                    peer_id: peer_id.to_string(),
                    sending: false,
                    quality,
                });
            }
            _ => {
                info!(peer = %peer_id, message = ?msg.message, "screen sharing request rejected");
                self.events.emit(CoreEvent::ScreenSharingRejected {
                    request_id: msg.request_id,
                });
            }
        }
    }

    /// Relay a media signaling blob to the other end of the active session.
    /// Either side may signal.
    pub async fn send_signal(
        &self,
        kind: SignalKind,
        blob: serde_json::Value,
    ) -> Result<(), LinkError> {
        let (session_id, peer_id) = {
            let slot = self.screen_sharing.lock();
            match &slot.active {
                Some(s) => (s.session_id.clone(), s.peer_id.clone()),
                None => return Err(LinkError::NoActiveSession(SessionKind::ScreenSharing.label())),
            }
        };
        self.sessions
            .send_to_peer(
                &peer_id,
                Payload::ScreenSharingSignal(ScreenSharingSignalMsg {
                    session_id,
                    kind,
                    blob,
                }),
            )
            .await
    }

    pub fn handle_ss_signal(&self, peer_id: &str, msg: ScreenSharingSignalMsg) {
        let slot = self.screen_sharing.lock();
        match &slot.active {
            Some(s) if s.session_id == msg.session_id && s.peer_id == peer_id => {
                self.events.emit(CoreEvent::ScreenSharingSignal {
                    session_id: msg.session_id,
                    kind: msg.kind,
                    blob: msg.blob,
                });
            }
            _ => debug!(peer = %peer_id, "signal outside an active session dropped"),
        }
    }

    async fn send_ss_response(
        &self,
        peer_id: &str,
        request_id: &str,
        accepted: bool,
        session_id: Option<&str>,
        quality: Option<QualityProfile>,
        message: Option<&str>,
    ) {
        let msg = Payload::ScreenSharingResponse(ScreenSharingResponseMsg {
            request_id: request_id.to_string(),
            accepted,
            session_id: session_id.map(str::to_string),
            quality,
            message: message.map(str::to_string),
        });
        if let Err(e) = self.sessions.send_to_peer(peer_id, msg).await {
            warn!(peer = %peer_id, error = %e, "could not deliver screen sharing response");
        }
    }

    // -- teardown, shared --------------------------------------------------

    /// End the active session of a kind from our side. The peer is told
    /// best-effort; locally the session is gone either way.
    pub async fn disconnect(&self, kind: SessionKind) -> Result<(), LinkError> {
        let active = self
            .slot(kind)
            .lock()
            .active
            .take()
            .ok_or(LinkError::NoActiveSession(kind.label()))?;
        let disconnect = SessionDisconnectMsg {
            session_id: active.session_id.clone(),
        };
        let payload = match kind {
            SessionKind::RemoteControl => Payload::RemoteControlDisconnect(disconnect),
            SessionKind::ScreenSharing => Payload::ScreenSharingDisconnect(disconnect),
        };
        if let Err(e) = self.sessions.send_to_peer(&active.peer_id, payload).await {
            warn!(peer = %active.peer_id, error = %e, "could not deliver session disconnect");
        }
        self.emit_ended(kind, active.session_id);
        Ok(())
    }

    pub fn handle_disconnect(&self, kind: SessionKind, peer_id: &str, msg: SessionDisconnectMsg) {
        let mut slot = self.slot(kind).lock();
        match &slot.active {
            Some(s) if s.session_id == msg.session_id && s.peer_id == peer_id => {
                let session_id = s.session_id.clone();
                slot.active = None;
                drop(slot);
                info!(peer = %peer_id, session = %session_id, kind = kind.label(), "session ended by peer");
                self.emit_ended(kind, session_id);
            }
            _ => debug!(peer = %peer_id, "disconnect for unknown session dropped"),
        }
    }

    /// Link loss tears down whatever the peer was part of.
    pub fn handle_peer_disconnected(&self, peer_id: &str) {
        for kind in [SessionKind::RemoteControl, SessionKind::ScreenSharing] {
            let ended = {
                let mut slot = self.slot(kind).lock();
                slot.pending.retain(|_, p| p.peer_id != peer_id);
                slot.outbound.retain(|_, o| o.peer_id != peer_id);
                match &slot.active {
                    Some(s) if s.peer_id == peer_id => slot.active.take(),
                    _ => None,
                }
            };
            if let Some(s) = ended {
                warn!(peer = %peer_id, kind = kind.label(), "session lost: peer disconnected");
                self.emit_ended(kind, s.session_id);
            }
        }
    }

    /// Blocking a peer mid-decision rejects anything it had pending.
    pub async fn reject_all_from(&self, peer_id: &str) {
        let rc: Vec<PendingSignal> = {
            let mut slot = self.remote_control.lock();
            let ids: Vec<String> = slot
                .pending
                .values()
                .filter(|p| p.peer_id == peer_id)
                .map(|p| p.request_id.clone())
                .collect();
            ids.into_iter().filter_map(|id| slot.pending.remove(&id)).collect()
        };
        for p in rc {
            self.send_rc_response(&p.peer_id, &p.request_id, false, None, Some("rejected"))
                .await;
        }
        let ss: Vec<PendingSignal> = {
            let mut slot = self.screen_sharing.lock();
            let ids: Vec<String> = slot
                .pending
                .values()
                .filter(|p| p.peer_id == peer_id)
                .map(|p| p.request_id.clone())
                .collect();
            ids.into_iter().filter_map(|id| slot.pending.remove(&id)).collect()
        };
        for p in ss {
            self.send_ss_response(&p.peer_id, &p.request_id, false, None, None, Some("rejected"))
                .await;
        }
    }

    /// Pending inbound requests still young enough to surface.
    pub fn pending_requests(&self) -> Vec<PendingSignal> {
        let cutoff = Utc::now() - ChronoDuration::seconds(self.config.request_surface_secs);
        let mut out: Vec<PendingSignal> = self
            .remote_control
            .lock()
            .pending
            .values()
            .chain(self.screen_sharing.lock().pending.values())
            .filter(|p| p.created > cutoff)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.created.cmp(&b.created));
        out
    }

    pub fn active_session(&self, kind: SessionKind) -> Option<ActiveSession> {
        self.slot(kind).lock().active.clone()
    }

    /// Housekeeping: expire requests nobody answered, on both sides.
    pub async fn expire(&self) {
        let cutoff = Utc::now() - ChronoDuration::seconds(self.config.request_expiry_secs);
        for kind in [SessionKind::RemoteControl, SessionKind::ScreenSharing] {
            let expired: Vec<PendingSignal> = {
                let mut slot = self.slot(kind).lock();
                let ids: Vec<String> = slot
                    .pending
                    .values()
                    .filter(|p| p.created <= cutoff)
                    .map(|p| p.request_id.clone())
                    .collect();
                slot.outbound.retain(|_, o| o.created > cutoff);
                ids.into_iter().filter_map(|id| slot.pending.remove(&id)).collect()
            };
            for p in expired {
                info!(peer = %p.peer_id, request = %p.request_id, kind = kind.label(), "session request expired");
                match kind {
                    SessionKind::RemoteControl => {
                        self.send_rc_response(&p.peer_id, &p.request_id, false, None, Some("expired"))
                            .await;
                    }
                    SessionKind::ScreenSharing => {
                        self.send_ss_response(
                            &p.peer_id,
                            &p.request_id,
                            false,
                            None,
                            None,
                            Some("expired"),
                        )
                        .await;
                    }
                }
            }
        }
    }

    fn emit_ended(&self, kind: SessionKind, session_id: String) {
        match kind {
            SessionKind::RemoteControl => {
                self.events.emit(CoreEvent::RemoteControlEnded { session_id })
            }
            SessionKind::ScreenSharing => {
                self.events.emit(CoreEvent::ScreenSharingEnded { session_id })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Announce;
    use crate::store::{MemoryRecordStore, PeerRecord};
    use std::net::{IpAddr, Ipv4Addr};

    fn signaling_with_peer() -> (Signaling, Arc<PeerStore>) {
        let store = Arc::new(PeerStore::open(Box::new(MemoryRecordStore::default())).unwrap());
        store
            .upsert_discovered(PeerRecord::discovered(
                "peer-1",
                "Peer",
                "profile",
                "linux",
                IpAddr::V4(Ipv4Addr::LOCALHOST),
                1,
            ))
            .unwrap();
        store.apply_pairing("peer-1", false, false).unwrap();
        let events = EventBus::new();
        let config = Config::default();
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
        (Signaling::new(config, store.clone(), sessions, events), store)
    }

    #[tokio::test]
    async fn unpaired_and_blocked_peers_cannot_be_asked() {
        let (sig, store) = signaling_with_peer();
        store.set_paired("peer-1", false).unwrap();
        assert!(matches!(
            sig.request_remote_control("peer-1").await.unwrap_err(),
            LinkError::NotPaired(_)
        ));
        store.set_blocked("peer-1", true).unwrap();
        assert!(matches!(
            sig.request_remote_control("peer-1").await.unwrap_err(),
            LinkError::PeerBlocked(_)
        ));
    }

    #[tokio::test]
    async fn second_session_of_a_kind_is_busy() {
        let (sig, _) = signaling_with_peer();
        sig.remote_control.lock().active = Some(ActiveSession {
            session_id: "s1".into(),
            peer_id: "peer-1".into(),
            initiated_by_us: true,
            quality: None,
        });
        assert!(matches!(
            sig.request_remote_control("peer-1").await.unwrap_err(),
            LinkError::SessionBusy("remote control")
        ));
        // the other kind is independent; it fails later on the dead socket,
        // not on the busy check
        assert!(!matches!(
            sig.request_screen_sharing("peer-1", QualityProfile::default(), None)
                .await
                .unwrap_err(),
            LinkError::SessionBusy(_)
        ));
    }

    #[tokio::test]
    async fn input_outside_a_session_is_refused_and_dropped() {
        let (sig, _) = signaling_with_peer();
        assert!(matches!(
            sig.send_input(serde_json::json!({"kind": "key"})).await.unwrap_err(),
            LinkError::NoActiveSession(_)
        ));

        let mut rx = sig.events.subscribe();
        sig.handle_rc_event(
            "peer-1",
            RemoteControlEventMsg {
                session_id: "ghost".into(),
                event: serde_json::json!({}),
            },
        );
        assert!(matches!(
            rx.try_recv(),
            Err(tokio::sync::broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn blocked_peer_request_never_surfaces() {
        let (sig, store) = signaling_with_peer();
        store.set_blocked("peer-1", true).unwrap();
        sig.handle_rc_request(
            "peer-1",
            SessionRequestMsg {
                request_id: "r1".into(),
            },
        )
        .await;
        assert!(sig.pending_requests().is_empty());
    }

    #[tokio::test]
    async fn crossed_requests_are_answered_busy() {
        let (sig, store) = signaling_with_peer();
        store.set_trusted("peer-1", true).unwrap();
        // our own request is still in flight when the peer's arrives
        sig.remote_control.lock().outbound.insert(
            "r-out".into(),
            OutboundSignal {
                peer_id: "peer-1".into(),
                quality: None,
                created: Utc::now(),
            },
        );
        sig.handle_rc_request(
            "peer-1",
            SessionRequestMsg {
                request_id: "r-in".into(),
            },
        )
        .await;
        assert!(sig.active_session(SessionKind::RemoteControl).is_none());
        assert!(sig.pending_requests().is_empty());
    }

    #[tokio::test]
    async fn accepted_response_never_clobbers_an_active_session() {
        let (sig, _) = signaling_with_peer();
        {
            let mut slot = sig.remote_control.lock();
            slot.outbound.insert(
                "r1".into(),
                OutboundSignal {
                    peer_id: "peer-1".into(),
                    quality: None,
                    created: Utc::now(),
                },
            );
            slot.active = Some(ActiveSession {
                session_id: "s-first".into(),
                peer_id: "peer-1".into(),
                initiated_by_us: false,
                quality: None,
            });
        }
        sig.handle_rc_response(
            "peer-1",
            SessionResponseMsg {
                request_id: "r1".into(),
                accepted: true,
                session_id: Some("s-second".into()),
                message: None,
            },
        )
        .await;
        let active = sig.active_session(SessionKind::RemoteControl).unwrap();
        assert_eq!(active.session_id, "s-first");
    }

    #[tokio::test]
    async fn unpaired_peer_session_request_is_refused() {
        let (sig, store) = signaling_with_peer();
        store.set_paired("peer-1", false).unwrap();
        store.set_trusted("peer-1", true).unwrap();
        sig.handle_rc_request(
            "peer-1",
            SessionRequestMsg {
                request_id: "r1".into(),
            },
        )
        .await;
        assert!(sig.active_session(SessionKind::RemoteControl).is_none());
        assert!(sig.pending_requests().is_empty());
    }

    #[tokio::test]
    async fn peer_disconnect_tears_down_its_session() {
        let (sig, _) = signaling_with_peer();
        sig.screen_sharing.lock().active = Some(ActiveSession {
            session_id: "s1".into(),
            peer_id: "peer-1".into(),
            initiated_by_us: false,
            quality: Some(QualityProfile::default()),
        });
        let mut rx = sig.events.subscribe();
        sig.handle_peer_disconnected("peer-1");
        assert!(sig.active_session(SessionKind::ScreenSharing).is_none());
        let ev = rx.recv().await.unwrap();
        assert!(matches!(ev, CoreEvent::ScreenSharingEnded { session_id } if session_id == "s1"));
    }
}
