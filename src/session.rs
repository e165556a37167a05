//! Connection/Session manager: one persistent socket per reachable peer.
//!
//! Each link runs two tasks: a reader that decodes frames and forwards
//! them to the service dispatch queue, and a writer that drains a per-peer
//! outbound channel. All senders (transfer chunk pump, signaling relay,
//! pairing responder) go through that channel, so frames from concurrent
//! callers never interleave on the socket.

use crate::config::Config;
use crate::error::LinkError;
use crate::events::{CoreEvent, EventBus};
use crate::protocol::{Announce, Envelope, Payload};
use crate::store::{ConnectionState, PeerRecord, PeerStore};
use crate::wire::{self, FrameReader, WireError};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use tracing::{debug, info, warn};

/// A decoded inbound message, tagged with the sending peer.
#[derive(Debug)]
pub struct Inbound {
    pub peer_id: String,
    pub payload: Payload,
}

struct PeerLink {
    tx: mpsc::Sender<Envelope>,
    stop: watch::Sender<bool>,
}

struct Inner {
    self_id: String,
    config: Config,
    store: Arc<PeerStore>,
    events: EventBus,
    announce: Mutex<Announce>,
    links: Mutex<HashMap<String, PeerLink>>,
    inbound_tx: mpsc::Sender<Inbound>,
    listener: Mutex<Option<JoinHandle<()>>>,
    port: Mutex<u16>,
}

#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl SessionManager {
    pub fn new(
        self_id: String,
        config: Config,
        store: Arc<PeerStore>,
        events: EventBus,
        announce: Announce,
    ) -> (Self, mpsc::Receiver<Inbound>) {
        let (inbound_tx, inbound_rx) = mpsc::channel(256);
        let mgr = Self {
            inner: Arc::new(Inner {
                self_id,
                config,
                store,
                events,
                announce: Mutex::new(announce),
                links: Mutex::new(HashMap::new()),
                inbound_tx,
                listener: Mutex::new(None),
                port: Mutex::new(0),
            }),
        };
        (mgr, inbound_rx)
    }

    pub fn self_id(&self) -> &str {
        &self.inner.self_id
    }

    pub fn port(&self) -> u16 {
        *self.inner.port.lock()
    }

    /// Bind the session listener on the first free port in the configured
    /// range and start accepting. Returns the bound port.
    pub async fn start(&self) -> Result<u16, LinkError> {
        let cfg = &self.inner.config;
        let mut bound = None;
        for port in cfg.base_port..=cfg.max_port {
            match TcpListener::bind(("0.0.0.0", port)).await {
                Ok(l) => {
                    bound = Some((l, port));
                    break;
                }
                Err(_) => continue,
            }
        }
        let (listener, port) = bound.ok_or(LinkError::NoFreePort(cfg.base_port, cfg.max_port))?;
        *self.inner.port.lock() = port;
        self.inner.announce.lock().port = port;
        info!(port, "session listener bound");

        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, addr)) => {
                        debug!(peer_addr = %addr, "inbound connection");
                        let _ = stream.set_nodelay(true);
                        spawn_link(inner.clone(), stream, None, None);
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                    }
                }
            }
        });
        *self.inner.listener.lock() = Some(handle);
        Ok(port)
    }

    /// Stop accepting and drop every live link.
    pub fn shutdown(&self) {
        if let Some(h) = self.inner.listener.lock().take() {
            h.abort();
        }
        let peers: Vec<String> = self.inner.links.lock().keys().cloned().collect();
        for id in peers {
            teardown(&self.inner, &id, true);
        }
    }

    /// Queue one message to a peer. A missing link triggers exactly one
    /// dial attempt against the stored address; anything further (retry,
    /// backoff) is the caller's policy, not this layer's.
    pub async fn send_to_peer(&self, peer_id: &str, payload: Payload) -> Result<(), LinkError> {
        let env = Envelope::new(self.inner.self_id.clone(), peer_id.to_string(), payload);
        if let Some(tx) = self.link_tx(peer_id) {
            return tx.send(env).await.map_err(|_| LinkError::SendFailed {
                peer: peer_id.to_string(),
                reason: "link closed".into(),
            });
        }

        let record = self
            .inner
            .store
            .get(peer_id)
            .ok_or_else(|| LinkError::NoSuchPeer(peer_id.to_string()))?;
        let tx = self.dial(record.ip, record.port, peer_id.to_string()).await?;
        tx.send(env).await.map_err(|_| LinkError::SendFailed {
            peer: peer_id.to_string(),
            reason: "link closed during dial".into(),
        })
    }

    pub fn is_connected(&self, peer_id: &str) -> bool {
        self.inner.links.lock().contains_key(peer_id)
    }

    pub fn disconnect_peer(&self, peer_id: &str) {
        teardown(&self.inner, peer_id, true);
    }

    /// Manual connect: sequentially probe every port in the range against
    /// `ip` until a peer answers the handshake. Returns the peer id.
    pub async fn manual_connect(&self, ip: IpAddr) -> Result<String, LinkError> {
        let cfg = &self.inner.config;
        for port in cfg.base_port..=cfg.max_port {
            // skip our own listener when probing localhost
            if ip.is_loopback() && port == self.port() {
                continue;
            }
            match timeout(
                Duration::from_millis(cfg.connect_timeout_ms),
                TcpStream::connect((ip, port)),
            )
            .await
            {
                Ok(Ok(stream)) => {
                    let _ = stream.set_nodelay(true);
                    let (done_tx, done_rx) = oneshot::channel();
                    spawn_link(self.inner.clone(), stream, None, Some(done_tx));
                    match timeout(Duration::from_millis(2_000), done_rx).await {
                        Ok(Ok(peer_id)) => return Ok(peer_id),
                        _ => continue,
                    }
                }
                _ => continue,
            }
        }
        Err(LinkError::Unreachable(ip.to_string()))
    }

    async fn dial(
        &self,
        ip: IpAddr,
        port: u16,
        peer_id: String,
    ) -> Result<mpsc::Sender<Envelope>, LinkError> {
        let cfg = &self.inner.config;
        let stream = timeout(
            Duration::from_millis(cfg.connect_timeout_ms),
            TcpStream::connect((ip, port)),
        )
        .await
        .map_err(|_| LinkError::Unreachable(format!("{ip}:{port}")))?
        .map_err(|_| LinkError::Unreachable(format!("{ip}:{port}")))?;
        let _ = stream.set_nodelay(true);
        spawn_link(self.inner.clone(), stream, Some(peer_id), None)
            .ok_or(LinkError::Unreachable(format!("{ip}:{port}")))
    }

    fn link_tx(&self, peer_id: &str) -> Option<mpsc::Sender<Envelope>> {
        self.inner.links.lock().get(peer_id).map(|l| l.tx.clone())
    }
}

/// Wire up reader + writer tasks for one socket. When the remote identity
/// is already known (outbound dial to a stored record) the link registers
/// immediately and its queue is returned; otherwise registration waits
/// for the peer's announce handshake.
fn spawn_link(
    inner: Arc<Inner>,
    stream: TcpStream,
    known_peer: Option<String>,
    registered: Option<oneshot::Sender<String>>,
) -> Option<mpsc::Sender<Envelope>> {
    let peer_ip = stream.peer_addr().map(|a| a.ip()).ok();
    let (read_half, write_half) = stream.into_split();
    let (tx, rx) = mpsc::channel::<Envelope>(64);
    let (stop_tx, stop_rx) = watch::channel(false);

    if let Some(peer_id) = &known_peer {
        let mut links = inner.links.lock();
        if let Some(existing) = links.get(peer_id) {
            // a link raced us into existence; keep the first one
            return Some(existing.tx.clone());
        }
        links.insert(
            peer_id.clone(),
            PeerLink {
                tx: tx.clone(),
                stop: stop_tx.clone(),
            },
        );
    }

    let hello = Envelope::new(
        inner.self_id.clone(),
        known_peer.clone().unwrap_or_default(),
        Payload::DiscoveryAnnounce(inner.announce.lock().clone()),
    );

    tokio::spawn(writer_task(write_half, rx, hello, stop_rx.clone()));
    tokio::spawn(reader_task(
        inner.clone(),
        read_half,
        known_peer.clone(),
        peer_ip,
        tx.clone(),
        stop_tx,
        stop_rx,
        registered,
    ));

    if let Some(peer_id) = known_peer {
        mark_connected(&inner, &peer_id);
        Some(tx)
    } else {
        None
    }
}

async fn writer_task(
    mut write_half: OwnedWriteHalf,
    mut rx: mpsc::Receiver<Envelope>,
    hello: Envelope,
    mut stop: watch::Receiver<bool>,
) {
    if let Err(e) = wire::write_frame(&mut write_half, &hello).await {
        debug!(error = %e, "handshake write failed");
        return;
    }
    loop {
        tokio::select! {
            _ = stop.changed() => break,
            env = rx.recv() => {
                let Some(env) = env else { break };
                if let Err(e) = wire::write_frame(&mut write_half, &env).await {
                    warn!(error = %e, "frame write failed, closing link");
                    break;
                }
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn reader_task(
    inner: Arc<Inner>,
    mut read_half: OwnedReadHalf,
    mut peer_id: Option<String>,
    peer_ip: Option<IpAddr>,
    tx: mpsc::Sender<Envelope>,
    stop_tx: watch::Sender<bool>,
    mut stop: watch::Receiver<bool>,
    mut registered: Option<oneshot::Sender<String>>,
) {
    let mut frames = FrameReader::new();
    loop {
        let next = tokio::select! {
            _ = stop.changed() => return,
            res = frames.next_frame(&mut read_half) => res,
        };
        let env = match next {
            Ok(Some(env)) => env,
            Ok(None) => {
                debug!(peer = ?peer_id, "peer closed connection");
                break;
            }
            Err(e) => match e.downcast_ref::<WireError>() {
                Some(we) if !we.is_corruption() => {
                    // one bad frame does not cost the whole session
                    warn!(peer = ?peer_id, error = %we, "dropping bad frame");
                    continue;
                }
                _ => {
                    warn!(peer = ?peer_id, error = %e, "stream error, resetting connection");
                    break;
                }
            },
        };

        if !env.to.is_empty() && env.to != inner.self_id {
            warn!(to = %env.to, "frame addressed to another device, dropped");
            continue;
        }

        match (&env.payload, peer_id.as_deref()) {
            (Payload::DiscoveryAnnounce(a), _) => {
                let Some(ip) = peer_ip else { continue };
                let record = PeerRecord::discovered(
                    env.from.clone(),
                    a.display_name.clone(),
                    a.profile_id.clone(),
                    a.platform.clone(),
                    ip,
                    a.port,
                );
                let is_new = inner.store.upsert_discovered(record).unwrap_or(false);
                if let Some(rec) = inner.store.get(&env.from) {
                    inner.events.emit(if is_new {
                        CoreEvent::PeerDiscovered { peer: rec }
                    } else {
                        CoreEvent::PeerUpdated { peer: rec }
                    });
                }
                if peer_id.is_none() {
                    // inbound or probed link: adopt the announced identity
                    let id = env.from.clone();
                    {
                        let mut links = inner.links.lock();
                        if links.contains_key(&id) {
                            debug!(peer = %id, "duplicate link, closing the newer one");
                            let _ = stop_tx.send(true);
                            return;
                        }
                        links.insert(
                            id.clone(),
                            PeerLink {
                                tx: tx.clone(),
                                stop: stop_tx.clone(),
                            },
                        );
                    }
                    peer_id = Some(id.clone());
                    mark_connected(&inner, &id);
                    if let Some(done) = registered.take() {
                        let _ = done.send(id);
                    }
                }
            }
            (_, Some(pid)) => {
                let inbound = Inbound {
                    peer_id: pid.to_string(),
                    payload: env.payload,
                };
                if inner.inbound_tx.send(inbound).await.is_err() {
                    break;
                }
            }
            (_, None) => {
                warn!(kind = env.payload.kind(), "message before handshake, dropped");
            }
        }
    }

    if let Some(pid) = peer_id {
        teardown(&inner, &pid, true);
    } else {
        let _ = stop_tx.send(true);
    }
}

fn mark_connected(inner: &Arc<Inner>, peer_id: &str) {
    inner
        .store
        .advance_state_min(peer_id, ConnectionState::Connected);
    if inner.store.get(peer_id).is_some_and(|r| r.paired) {
        inner
            .store
            .set_connection_state(peer_id, ConnectionState::Paired);
    }
    inner.events.emit(CoreEvent::PeerConnected {
        peer_id: peer_id.to_string(),
    });
}

/// Drop the link and stop both of its tasks. Idempotent; no stale socket
/// reference survives this call.
fn teardown(inner: &Arc<Inner>, peer_id: &str, notify: bool) {
    let removed = inner.links.lock().remove(peer_id);
    let Some(link) = removed else { return };
    let _ = link.stop.send(true);
    inner
        .store
        .set_connection_state(peer_id, ConnectionState::Disconnected);
    if notify {
        info!(peer = %peer_id, "peer disconnected");
        inner.events.emit(CoreEvent::PeerDisconnected {
            peer_id: peer_id.to_string(),
        });
    }
}
