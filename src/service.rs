//! Service orchestration: owns every subsystem, routes inbound frames to
//! them, and exposes the command surface the CLI and embedding UIs drive.
//!
//! Lifecycle is one-shot: a service starts at most once and stop is final.
//! Transient network loss goes through `connectivity_changed`, which only
//! cycles the discovery engine and the live links, never the service.

use crate::config::Config;
use crate::discovery::{Discovery, DiscoveryState};
use crate::error::LinkError;
use crate::events::{CoreEvent, EventBus};
use crate::pairing::{Pairing, PendingPairing};
use crate::protocol::{timeouts, Announce, Payload, QualityProfile, SignalKind};
use crate::session::{Inbound, SessionManager};
use crate::signaling::{PendingSignal, SessionKind, Signaling};
use crate::store::{DeviceIdentity, JsonRecordStore, PeerFilter, PeerRecord, PeerStore, RecordStore};
use crate::transfer::{PendingTransfer, TaskSnapshot, TransferEngine};
use parking_lot::Mutex;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, Duration};
use tracing::{debug, info, warn};

/// Seam for the platform collaborator that knows whether the current
/// network link should carry discovery traffic (e.g. not a metered or
/// captive link). The default accepts everything.
pub trait LinkPolicy: Send + Sync {
    fn link_acceptable(&self) -> bool;
}

pub struct AcceptAnyLink;

impl LinkPolicy for AcceptAnyLink {
    fn link_acceptable(&self) -> bool {
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Idle,
    Running,
    Stopped,
}

/// Everything a front end can ask the core to do.
#[derive(Debug, Clone)]
pub enum Command {
    EnableDiscovery,
    DisableDiscovery,
    Rescan,
    ListPeers { filter: PeerFilter },
    Connect { ip: IpAddr },
    Pair { peer_id: String, trust: bool, save: bool },
    RespondPairing { request_id: String, accept: bool, trust: bool, save: bool },
    Unpair { peer_id: String },
    SetTrusted { peer_id: String, trusted: bool },
    SetBlocked { peer_id: String, blocked: bool },
    SetStored { peer_id: String, stored: bool },
    DeletePeer { peer_id: String },
    SendFiles { peer_id: String, paths: Vec<PathBuf> },
    RespondTransfer { request_id: String, accept: bool, message: Option<String> },
    CancelTransfer { task_id: String },
    PauseTransfer { task_id: String },
    ResumeTransfer { task_id: String },
    ClearTransfer { task_id: String, delete_incomplete: bool },
    ClearBatch { batch_id: String, delete_incomplete: bool },
    ListTransfers,
    PendingRequests,
    RequestRemoteControl { peer_id: String },
    RespondRemoteControl { request_id: String, accept: bool },
    SendInput { event: serde_json::Value },
    EndRemoteControl,
    RequestScreenSharing {
        peer_id: String,
        quality: QualityProfile,
        source_index: Option<u32>,
    },
    RespondScreenSharing {
        request_id: String,
        accept: bool,
        quality: Option<QualityProfile>,
    },
    SendSignal { kind: SignalKind, blob: serde_json::Value },
    EndScreenSharing,
    Status,
}

#[derive(Debug, Clone)]
pub struct ServiceStatus {
    pub running: bool,
    pub device_id: String,
    pub display_name: String,
    pub discovery: DiscoveryState,
    pub session_port: u16,
}

/// Result of a dispatched command.
#[derive(Debug, Clone)]
pub enum Outcome {
    Done,
    Peers(Vec<PeerRecord>),
    PeerId(String),
    RequestId(String),
    BatchId(String),
    Transfers(Vec<TaskSnapshot>),
    Pending {
        pairing: Vec<PendingPairing>,
        transfers: Vec<PendingTransfer>,
        sessions: Vec<PendingSignal>,
    },
    Status(ServiceStatus),
}

struct ServiceInner {
    config: Config,
    identity: DeviceIdentity,
    store: Arc<PeerStore>,
    events: EventBus,
    sessions: SessionManager,
    discovery: Discovery,
    pairing: Arc<Pairing>,
    transfers: TransferEngine,
    signaling: Arc<Signaling>,
    policy: Box<dyn LinkPolicy>,
    lifecycle: Mutex<Lifecycle>,
    inbound_rx: Mutex<Option<mpsc::Receiver<Inbound>>>,
    stop: Mutex<Option<watch::Sender<bool>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct Service {
    inner: Arc<ServiceInner>,
}

impl Service {
    /// Build a service on the JSON record store under `config.data_dir`,
    /// creating the device identity on first run.
    pub fn open(config: Config, policy: Box<dyn LinkPolicy>) -> Result<Self, LinkError> {
        config.validate()?;
        let backend = Box::new(JsonRecordStore::new(config.data_dir.join("peers.json")));
        Self::with_backend(config, policy, backend)
    }

    pub fn with_backend(
        config: Config,
        policy: Box<dyn LinkPolicy>,
        backend: Box<dyn RecordStore>,
    ) -> Result<Self, LinkError> {
        std::fs::create_dir_all(&config.data_dir).map_err(|e| LinkError::Store(e.to_string()))?;
        let identity = DeviceIdentity::load_or_create(&config.data_dir)?;
        let store = Arc::new(PeerStore::open(backend)?);
        let events = EventBus::new();
        let announce = Announce {
            display_name: config.display_name(),
            profile_id: identity.profile_id.clone(),
            platform: std::env::consts::OS.to_string(),
            port: 0, // filled in once the session listener is bound
        };

        let (sessions, inbound_rx) = SessionManager::new(
            identity.id.clone(),
            config.clone(),
            store.clone(),
            events.clone(),
            announce.clone(),
        );
        let discovery = Discovery::new(
            identity.id.clone(),
            config.clone(),
            store.clone(),
            events.clone(),
            announce,
        );
        let pairing = Arc::new(Pairing::new(
            config.clone(),
            store.clone(),
            sessions.clone(),
            events.clone(),
            config.display_name(),
            std::env::consts::OS.to_string(),
        ));
        let transfers = TransferEngine::new(
            config.clone(),
            store.clone(),
            sessions.clone(),
            events.clone(),
        );
        let signaling = Arc::new(Signaling::new(
            config.clone(),
            store.clone(),
            sessions.clone(),
            events.clone(),
        ));

        Ok(Self {
            inner: Arc::new(ServiceInner {
                config,
                identity,
                store,
                events,
                sessions,
                discovery,
                pairing,
                transfers,
                signaling,
                policy,
                lifecycle: Mutex::new(Lifecycle::Idle),
                inbound_rx: Mutex::new(Some(inbound_rx)),
                stop: Mutex::new(None),
                tasks: Mutex::new(Vec::new()),
            }),
        })
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub fn device_id(&self) -> &str {
        &self.inner.identity.id
    }

    /// Bring the whole core up: session listener, discovery, dispatch and
    /// housekeeping. Nothing stays half-started; a failure along the way
    /// rolls back what already came up.
    pub async fn start(&self) -> Result<(), LinkError> {
        let inner = &self.inner;
        match *inner.lifecycle.lock() {
            Lifecycle::Running => return Ok(()),
            Lifecycle::Stopped => {
                return Err(LinkError::StartFailed("service already stopped".into()))
            }
            Lifecycle::Idle => {}
        }
        if !inner.policy.link_acceptable() {
            return Err(LinkError::LinkNotAcceptable);
        }

        let port = inner.sessions.start().await?;
        inner.discovery.set_session_port(port);
        if let Err(e) = inner.discovery.enable().await {
            inner.sessions.shutdown();
            return Err(e);
        }

        let inbound_rx = inner
            .inbound_rx
            .lock()
            .take()
            .ok_or_else(|| LinkError::StartFailed("inbound queue already consumed".into()))?;
        let (stop_tx, stop_rx) = watch::channel(false);
        let svc = self.clone();
        let stop = stop_rx.clone();
        let dispatch = tokio::spawn(async move { svc.dispatch_loop(inbound_rx, stop).await });
        let svc = self.clone();
        let housekeeping = tokio::spawn(async move { svc.housekeeping_loop(stop_rx).await });
        *inner.stop.lock() = Some(stop_tx);
        inner.tasks.lock().extend([dispatch, housekeeping]);
        *inner.lifecycle.lock() = Lifecycle::Running;
        info!(device = %inner.identity.id, port, "service started");
        inner.events.emit(CoreEvent::ServiceStarted);
        Ok(())
    }

    pub async fn stop(&self) {
        let inner = &self.inner;
        {
            let mut lc = inner.lifecycle.lock();
            if *lc != Lifecycle::Running {
                return;
            }
            *lc = Lifecycle::Stopped;
        }
        if let Some(stop) = inner.stop.lock().take() {
            let _ = stop.send(true);
        }
        let tasks: Vec<JoinHandle<()>> = inner.tasks.lock().drain(..).collect();
        for t in tasks {
            let _ = t.await;
        }
        inner.discovery.disable().await;
        inner.sessions.shutdown();
        inner.store.mark_all_disconnected();
        info!("service stopped");
        inner.events.emit(CoreEvent::ServiceStopped);
    }

    /// Platform connectivity hint. Loss tears down discovery and live
    /// links; recovery re-enables discovery after a short settle delay.
    pub async fn connectivity_changed(&self, up: bool) {
        let inner = &self.inner;
        if *inner.lifecycle.lock() != Lifecycle::Running {
            return;
        }
        if up {
            sleep(Duration::from_millis(timeouts::RECOVERY_DELAY_MS)).await;
            if inner.policy.link_acceptable() {
                if let Err(e) = inner.discovery.enable().await {
                    warn!(error = %e, "discovery recovery failed");
                }
            }
        } else {
            info!("connectivity lost, suspending discovery and links");
            inner.discovery.disable().await;
            for peer_id in inner.store.mark_all_disconnected() {
                inner.sessions.disconnect_peer(&peer_id);
            }
        }
    }

    /// Single entry point for every front-end command. Exhaustive on
    /// purpose: a new command cannot be added without a route.
    pub async fn dispatch(&self, cmd: Command) -> Result<Outcome, LinkError> {
        let inner = &self.inner;
        match cmd {
            Command::EnableDiscovery => {
                if !inner.policy.link_acceptable() {
                    return Err(LinkError::LinkNotAcceptable);
                }
                inner.discovery.enable().await?;
                Ok(Outcome::Done)
            }
            Command::DisableDiscovery => {
                inner.discovery.disable().await;
                Ok(Outcome::Done)
            }
            Command::Rescan => {
                inner.discovery.rescan().await?;
                Ok(Outcome::Done)
            }
            Command::ListPeers { filter } => Ok(Outcome::Peers(inner.store.list(filter))),
            Command::Connect { ip } => {
                let peer_id = inner.sessions.manual_connect(ip).await?;
                Ok(Outcome::PeerId(peer_id))
            }
            Command::Pair { peer_id, trust, save } => {
                let request_id = inner.pairing.send_request(&peer_id, trust, save).await?;
                Ok(Outcome::RequestId(request_id))
            }
            Command::RespondPairing { request_id, accept, trust, save } => {
                inner.pairing.respond(&request_id, accept, trust, save).await?;
                Ok(Outcome::Done)
            }
            Command::Unpair { peer_id } => {
                self.unpair(&peer_id)?;
                Ok(Outcome::Done)
            }
            Command::SetTrusted { peer_id, trusted } => {
                inner.store.set_trusted(&peer_id, trusted)?;
                Ok(Outcome::Done)
            }
            Command::SetBlocked { peer_id, blocked } => {
                self.set_blocked(&peer_id, blocked).await?;
                Ok(Outcome::Done)
            }
            Command::SetStored { peer_id, stored } => {
                inner.store.set_stored(&peer_id, stored)?;
                Ok(Outcome::Done)
            }
            Command::DeletePeer { peer_id } => {
                inner.sessions.disconnect_peer(&peer_id);
                inner.store.delete(&peer_id)?;
                Ok(Outcome::Done)
            }
            Command::SendFiles { peer_id, paths } => {
                let batch_id = inner.transfers.send_files(&peer_id, &paths).await?;
                Ok(Outcome::BatchId(batch_id))
            }
            Command::RespondTransfer { request_id, accept, message } => {
                inner.transfers.respond(&request_id, accept, message).await?;
                Ok(Outcome::Done)
            }
            Command::CancelTransfer { task_id } => {
                inner.transfers.cancel(&task_id).await?;
                Ok(Outcome::Done)
            }
            Command::PauseTransfer { task_id } => {
                inner.transfers.pause(&task_id)?;
                Ok(Outcome::Done)
            }
            Command::ResumeTransfer { task_id } => {
                inner.transfers.resume(&task_id)?;
                Ok(Outcome::Done)
            }
            Command::ClearTransfer { task_id, delete_incomplete } => {
                inner.transfers.clear(&task_id, delete_incomplete)?;
                Ok(Outcome::Done)
            }
            Command::ClearBatch { batch_id, delete_incomplete } => {
                inner.transfers.clear_batch(&batch_id, delete_incomplete)?;
                Ok(Outcome::Done)
            }
            Command::ListTransfers => Ok(Outcome::Transfers(inner.transfers.snapshots())),
            Command::PendingRequests => Ok(Outcome::Pending {
                pairing: inner.pairing.pending_requests(),
                transfers: inner.transfers.pending_requests(),
                sessions: inner.signaling.pending_requests(),
            }),
            Command::RequestRemoteControl { peer_id } => {
                let request_id = inner.signaling.request_remote_control(&peer_id).await?;
                Ok(Outcome::RequestId(request_id))
            }
            Command::RespondRemoteControl { request_id, accept } => {
                inner.signaling.respond_remote_control(&request_id, accept).await?;
                Ok(Outcome::Done)
            }
            Command::SendInput { event } => {
                inner.signaling.send_input(event).await?;
                Ok(Outcome::Done)
            }
            Command::EndRemoteControl => {
                inner.signaling.disconnect(SessionKind::RemoteControl).await?;
                Ok(Outcome::Done)
            }
            Command::RequestScreenSharing { peer_id, quality, source_index } => {
                let request_id = inner
                    .signaling
                    .request_screen_sharing(&peer_id, quality, source_index)
                    .await?;
                Ok(Outcome::RequestId(request_id))
            }
            Command::RespondScreenSharing { request_id, accept, quality } => {
                inner
                    .signaling
                    .respond_screen_sharing(&request_id, accept, quality)
                    .await?;
                Ok(Outcome::Done)
            }
            Command::SendSignal { kind, blob } => {
                inner.signaling.send_signal(kind, blob).await?;
                Ok(Outcome::Done)
            }
            Command::EndScreenSharing => {
                inner.signaling.disconnect(SessionKind::ScreenSharing).await?;
                Ok(Outcome::Done)
            }
            Command::Status => Ok(Outcome::Status(ServiceStatus {
                running: *inner.lifecycle.lock() == Lifecycle::Running,
                device_id: inner.identity.id.clone(),
                display_name: inner.config.display_name(),
                discovery: inner.discovery.state(),
                session_port: inner.sessions.port(),
            })),
        }
    }

    fn unpair(&self, peer_id: &str) -> Result<(), LinkError> {
        let inner = &self.inner;
        inner.store.set_paired(peer_id, false)?;
        inner.store.set_trusted(peer_id, false)?;
        if inner.sessions.is_connected(peer_id) {
            inner
                .store
                .set_connection_state(peer_id, crate::store::ConnectionState::Connected);
        }
        inner.events.emit(CoreEvent::Unpaired {
            peer_id: peer_id.to_string(),
        });
        Ok(())
    }

    /// Blocking is immediate: pending requests from the peer die, its
    /// link is dropped, and nothing from it is surfaced afterwards.
    async fn set_blocked(&self, peer_id: &str, blocked: bool) -> Result<(), LinkError> {
        let inner = &self.inner;
        inner.store.set_blocked(peer_id, blocked)?;
        if blocked {
            inner.pairing.reject_all_from(peer_id).await;
            inner.signaling.reject_all_from(peer_id).await;
            inner.sessions.disconnect_peer(peer_id);
        }
        Ok(())
    }

    async fn dispatch_loop(
        &self,
        mut inbound_rx: mpsc::Receiver<Inbound>,
        mut stop: watch::Receiver<bool>,
    ) {
        let inner = &self.inner;
        let mut events_rx = inner.events.subscribe();
        loop {
            tokio::select! {
                _ = stop.changed() => return,
                msg = inbound_rx.recv() => {
                    let Some(msg) = msg else { return };
                    self.route(msg).await;
                }
                ev = events_rx.recv() => {
                    // link teardown fans out to the engines that held
                    // state for the peer
                    match ev {
                        Ok(CoreEvent::PeerDisconnected { peer_id }) => {
                            inner.transfers.handle_peer_disconnected(&peer_id).await;
                            inner.signaling.handle_peer_disconnected(&peer_id);
                        }
                        Ok(_) => {}
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            warn!(missed = n, "event backlog overflow in dispatch loop");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                    }
                }
            }
        }
    }

    async fn route(&self, msg: Inbound) {
        let inner = &self.inner;
        let Inbound { peer_id, payload } = msg;
        debug!(peer = %peer_id, kind = payload.kind(), "inbound message");
        match payload {
            // announces are consumed by the link reader during handshake
            Payload::DiscoveryAnnounce(_) => {}
            Payload::PairingRequest(m) => inner.pairing.handle_request(&peer_id, m).await,
            Payload::PairingResponse(m) => inner.pairing.handle_response(&peer_id, m),
            Payload::FileTransferRequest(m) => inner.transfers.handle_request(&peer_id, m).await,
            Payload::FileTransferResponse(m) => inner.transfers.handle_response(&peer_id, m).await,
            Payload::FileChunk(m) => inner.transfers.handle_chunk(&peer_id, m).await,
            Payload::FileChunkAck(m) => inner.transfers.handle_ack(&peer_id, m),
            Payload::FileTransferCancel(m) => inner.transfers.handle_cancel(&peer_id, m).await,
            Payload::FileTransferComplete(m) => inner.transfers.handle_complete(&peer_id, m).await,
            Payload::RemoteControlRequest(m) => inner.signaling.handle_rc_request(&peer_id, m).await,
            Payload::RemoteControlResponse(m) => {
                inner.signaling.handle_rc_response(&peer_id, m).await
            }
            Payload::RemoteControlEvent(m) => inner.signaling.handle_rc_event(&peer_id, m),
            Payload::RemoteControlDisconnect(m) => {
                inner
                    .signaling
                    .handle_disconnect(SessionKind::RemoteControl, &peer_id, m)
            }
            Payload::ScreenSharingRequest(m) => inner.signaling.handle_ss_request(&peer_id, m).await,
            Payload::ScreenSharingResponse(m) => {
                inner.signaling.handle_ss_response(&peer_id, m).await
            }
            Payload::ScreenSharingSignal(m) => inner.signaling.handle_ss_signal(&peer_id, m),
            Payload::ScreenSharingDisconnect(m) => {
                inner
                    .signaling
                    .handle_disconnect(SessionKind::ScreenSharing, &peer_id, m)
            }
        }
    }

    async fn housekeeping_loop(&self, mut stop: watch::Receiver<bool>) {
        let inner = &self.inner;
        let mut tick = interval(Duration::from_millis(timeouts::SWEEP_INTERVAL_MS));
        loop {
            tokio::select! {
                _ = stop.changed() => return,
                _ = tick.tick() => {
                    inner.pairing.expire().await;
                    inner.signaling.expire().await;
                    inner.transfers.sweep().await;
                }
            }
        }
    }
}
