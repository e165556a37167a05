//! Discovery engine: UDP presence broadcast and listen over the bounded
//! port range.
//!
//! Announcements go to every port in the range so instances that had to
//! fall back to a higher port (port conflict on one host) still hear each
//! other. Received announcements are upserted into the peer store keyed by
//! device id, so repeated sightings never create duplicate roster entries.

use crate::config::Config;
use crate::error::LinkError;
use crate::events::{CoreEvent, EventBus};
use crate::protocol::{Announce, Envelope, Payload};
use crate::store::{PeerRecord, PeerStore};
use crate::wire;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryState {
    Disabled,
    Enabling,
    Active,
    Disabling,
}

struct DiscInner {
    self_id: String,
    config: Config,
    store: Arc<PeerStore>,
    events: EventBus,
    announce: Mutex<Announce>,
    state: watch::Sender<DiscoveryState>,
    stop: Mutex<Option<watch::Sender<bool>>>,
    socket: Mutex<Option<Arc<UdpSocket>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    port: Mutex<u16>,
}

#[derive(Clone)]
pub struct Discovery {
    inner: Arc<DiscInner>,
}

impl Discovery {
    pub fn new(
        self_id: String,
        config: Config,
        store: Arc<PeerStore>,
        events: EventBus,
        announce: Announce,
    ) -> Self {
        let (state, _) = watch::channel(DiscoveryState::Disabled);
        Self {
            inner: Arc::new(DiscInner {
                self_id,
                config,
                store,
                events,
                announce: Mutex::new(announce),
                state,
                stop: Mutex::new(None),
                socket: Mutex::new(None),
                tasks: Mutex::new(Vec::new()),
                port: Mutex::new(0),
            }),
        }
    }

    pub fn state(&self) -> DiscoveryState {
        *self.inner.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<DiscoveryState> {
        self.inner.state.subscribe()
    }

    /// UDP port the listener is bound to (0 when disabled).
    pub fn port(&self) -> u16 {
        *self.inner.port.lock()
    }

    /// The TCP session port carried in announcements; the session manager
    /// sets this once its listener is bound.
    pub fn set_session_port(&self, port: u16) {
        self.inner.announce.lock().port = port;
    }

    /// Idempotent: calling enable while enabling or active is a no-op, so
    /// concurrent callers can never bind a second listener socket.
    pub async fn enable(&self) -> Result<(), LinkError> {
        {
            let _guard = self.inner.socket.lock();
            if self.state() != DiscoveryState::Disabled {
                debug!("discovery enable ignored, already {:?}", self.state());
                return Ok(());
            }
            let _ = self.inner.state.send_replace(DiscoveryState::Enabling);
        }

        let cfg = &self.inner.config;
        let mut bound = None;
        for port in cfg.base_port..=cfg.max_port {
            match UdpSocket::bind(("0.0.0.0", port)).await {
                Ok(s) => {
                    bound = Some((s, port));
                    break;
                }
                Err(_) => continue,
            }
        }
        let Some((socket, port)) = bound else {
            let _ = self.inner.state.send_replace(DiscoveryState::Disabled);
            return Err(LinkError::NoFreePort(cfg.base_port, cfg.max_port));
        };
        if let Err(e) = socket.set_broadcast(true) {
            warn!(error = %e, "could not enable broadcast on discovery socket");
        }
        let socket = Arc::new(socket);
        info!(port, "discovery listening");

        let (stop_tx, stop_rx) = watch::channel(false);
        let listen = tokio::spawn(listen_task(self.inner.clone(), socket.clone(), stop_rx.clone()));
        let announce = tokio::spawn(announce_task(
            self.inner.clone(),
            socket.clone(),
            stop_rx,
        ));

        *self.inner.socket.lock() = Some(socket);
        *self.inner.stop.lock() = Some(stop_tx);
        *self.inner.port.lock() = port;
        self.inner.tasks.lock().extend([listen, announce]);
        let _ = self.inner.state.send_replace(DiscoveryState::Active);
        self.inner.events.emit(CoreEvent::DiscoveryEnabled);
        Ok(())
    }

    /// Close the discovery sockets and join the background tasks. Safe to
    /// call on connectivity loss; re-enabling later recovers cleanly.
    pub async fn disable(&self) {
        {
            let _guard = self.inner.socket.lock();
            if self.state() != DiscoveryState::Active {
                return;
            }
            let _ = self.inner.state.send_replace(DiscoveryState::Disabling);
        }
        if let Some(stop) = self.inner.stop.lock().take() {
            let _ = stop.send(true);
        }
        let tasks: Vec<JoinHandle<()>> = self.inner.tasks.lock().drain(..).collect();
        for t in tasks {
            // tasks observe the stop signal; join rather than abort so no
            // timer or socket read is left dangling
            let _ = t.await;
        }
        *self.inner.socket.lock() = None;
        *self.inner.port.lock() = 0;
        let _ = self.inner.state.send_replace(DiscoveryState::Disabled);
        self.inner.events.emit(CoreEvent::DiscoveryDisabled);
        info!("discovery disabled");
    }

    /// Manual on-demand rescan: fire an immediate announce burst.
    pub async fn rescan(&self) -> Result<(), LinkError> {
        let socket = self.inner.socket.lock().clone();
        match socket {
            Some(s) => {
                send_announce(&self.inner, &s).await;
                Ok(())
            }
            None => Err(LinkError::NotRunning),
        }
    }
}

async fn listen_task(inner: Arc<DiscInner>, socket: Arc<UdpSocket>, mut stop: watch::Receiver<bool>) {
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let recv = tokio::select! {
            _ = stop.changed() => return,
            r = socket.recv_from(&mut buf) => r,
        };
        let (n, addr) = match recv {
            Ok(v) => v,
            Err(e) => {
                // network went away under us; the engine gets disabled by
                // the connectivity watcher, we just stop reading
                warn!(error = %e, "discovery recv failed");
                return;
            }
        };
        let mut datagram = buf[..n].to_vec();
        let env = match wire::try_decode_frame(&mut datagram) {
            Ok(Some(env)) => env,
            Ok(None) => {
                debug!(from = %addr, "truncated discovery datagram dropped");
                continue;
            }
            Err(e) => {
                debug!(from = %addr, error = %e, "bad discovery datagram dropped");
                continue;
            }
        };
        if env.from == inner.self_id {
            continue; // our own broadcast echoed back
        }
        let Payload::DiscoveryAnnounce(a) = env.payload else {
            debug!(kind = env.payload.kind(), "non-announce datagram dropped");
            continue;
        };
        let record = PeerRecord::discovered(
            env.from.clone(),
            a.display_name,
            a.profile_id,
            a.platform,
            addr.ip(),
            a.port,
        );
        match inner.store.upsert_discovered(record) {
            Ok(is_new) => {
                if let Some(rec) = inner.store.get(&env.from) {
                    inner.events.emit(if is_new {
                        CoreEvent::PeerDiscovered { peer: rec }
                    } else {
                        CoreEvent::PeerUpdated { peer: rec }
                    });
                }
            }
            Err(e) => warn!(peer = %env.from, error = %e, "roster upsert failed"),
        }
    }
}

async fn announce_task(
    inner: Arc<DiscInner>,
    socket: Arc<UdpSocket>,
    mut stop: watch::Receiver<bool>,
) {
    let mut tick = interval(Duration::from_millis(inner.config.announce_interval_ms));
    loop {
        tokio::select! {
            _ = stop.changed() => return,
            _ = tick.tick() => send_announce(&inner, &socket).await,
        }
    }
}

async fn send_announce(inner: &Arc<DiscInner>, socket: &UdpSocket) {
    let env = Envelope::new(
        inner.self_id.clone(),
        String::new(),
        Payload::DiscoveryAnnounce(inner.announce.lock().clone()),
    );
    let bytes = wire::encode_frame(&env);
    for port in inner.config.base_port..=inner.config.max_port {
        if let Err(e) = socket.send_to(&bytes, ("255.255.255.255", port)).await {
            debug!(port, error = %e, "announce send failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryRecordStore;
    use tokio::time::timeout;

    fn test_config(base: u16, max: u16) -> Config {
        Config {
            base_port: base,
            max_port: max,
            announce_interval_ms: 60_000, // keep periodic noise out of tests
            ..Config::default()
        }
    }

    fn discovery(base: u16, max: u16) -> (Discovery, EventBus) {
        let store = Arc::new(PeerStore::open(Box::new(MemoryRecordStore::default())).unwrap());
        let events = EventBus::new();
        let announce = Announce {
            display_name: "local".into(),
            profile_id: "profile-local".into(),
            platform: "linux".into(),
            port: base,
        };
        (
            Discovery::new("self-id".into(), test_config(base, max), store, events.clone(), announce),
            events,
        )
    }

    async fn send_unicast_announce(to_port: u16, from_id: &str, tcp_port: u16) {
        let sock = UdpSocket::bind(("127.0.0.1", 0)).await.unwrap();
        let env = Envelope::new(
            from_id.to_string(),
            String::new(),
            Payload::DiscoveryAnnounce(Announce {
                display_name: "remote".into(),
                profile_id: "profile-remote".into(),
                platform: "macos".into(),
                port: tcp_port,
            }),
        );
        sock.send_to(&wire::encode_frame(&env), ("127.0.0.1", to_port))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn enable_is_idempotent_single_listener() {
        let (disc, _events) = discovery(45710, 45714);
        disc.enable().await.unwrap();
        let first_port = disc.port();
        assert_eq!(disc.state(), DiscoveryState::Active);

        // second enable must not bind a second socket
        disc.enable().await.unwrap();
        assert_eq!(disc.port(), first_port);
        assert_eq!(disc.inner.tasks.lock().len(), 2);

        disc.disable().await;
        assert_eq!(disc.state(), DiscoveryState::Disabled);
    }

    #[tokio::test]
    async fn announcement_creates_roster_entry_once() {
        let (disc, events) = discovery(45720, 45724);
        let mut rx = events.subscribe();
        disc.enable().await.unwrap();
        let port = disc.port();

        send_unicast_announce(port, "peer-1", 45721).await;
        let ev = timeout(Duration::from_secs(2), async {
            loop {
                if let CoreEvent::PeerDiscovered { peer } = rx.recv().await.unwrap() {
                    return peer;
                }
            }
        })
        .await
        .expect("no discovery event");
        assert_eq!(ev.id, "peer-1");
        assert!(ev.temp_stored);

        // a second announcement from the same identity updates, not duplicates
        send_unicast_announce(port, "peer-1", 45722).await;
        timeout(Duration::from_secs(2), async {
            loop {
                if let CoreEvent::PeerUpdated { .. } = rx.recv().await.unwrap() {
                    return;
                }
            }
        })
        .await
        .expect("no update event");
        assert_eq!(disc.inner.store.list(Default::default()).len(), 1);

        disc.disable().await;
    }

    #[tokio::test]
    async fn own_broadcast_is_ignored() {
        let (disc, events) = discovery(45730, 45734);
        let mut rx = events.subscribe();
        disc.enable().await.unwrap();
        let port = disc.port();

        send_unicast_announce(port, "self-id", 9999).await;
        send_unicast_announce(port, "peer-2", 45731).await;

        let ev = timeout(Duration::from_secs(2), async {
            loop {
                if let CoreEvent::PeerDiscovered { peer } = rx.recv().await.unwrap() {
                    return peer;
                }
            }
        })
        .await
        .unwrap();
        // the only roster entry is the real peer, never ourselves
        assert_eq!(ev.id, "peer-2");
        assert!(disc.inner.store.get("self-id").is_none());

        disc.disable().await;
    }

    #[tokio::test]
    async fn disable_then_enable_recovers() {
        let (disc, _events) = discovery(45740, 45744);
        disc.enable().await.unwrap();
        disc.disable().await;
        assert_eq!(disc.state(), DiscoveryState::Disabled);
        disc.enable().await.unwrap();
        assert_eq!(disc.state(), DiscoveryState::Active);
        disc.disable().await;
    }
}
