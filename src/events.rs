//! Typed event fan-out from the core to UI-facing consumers.
//!
//! Replaces nullable callback fields with an explicit broadcast channel:
//! consumers subscribe, the core emits, and slow subscribers lag without
//! ever blocking the emitting task.

use crate::protocol::{QualityProfile, SignalKind};
use crate::store::PeerRecord;
use crate::transfer::TaskSnapshot;
use tokio::sync::broadcast;

/// Everything the presentation layer can observe.
#[derive(Debug, Clone)]
pub enum CoreEvent {
    // discovery / roster
    PeerDiscovered { peer: PeerRecord },
    PeerUpdated { peer: PeerRecord },
    PeerConnected { peer_id: String },
    PeerDisconnected { peer_id: String },
    DiscoveryEnabled,
    DiscoveryDisabled,

    // pairing
    PairingRequested {
        request_id: String,
        peer_id: String,
        display_name: String,
    },
    PairingDecided {
        peer_id: String,
        accepted: bool,
    },
    Paired {
        peer_id: String,
    },
    Unpaired {
        peer_id: String,
    },

    // transfers
    TransferRequested {
        request_id: String,
        peer_id: String,
        file_count: usize,
        total_bytes: u64,
    },
    TransferUpdated {
        task: TaskSnapshot,
    },
    TransferFinished {
        task: TaskSnapshot,
    },
    TransferCleared {
        task_id: String,
    },

    // remote control
    RemoteControlRequested {
        request_id: String,
        peer_id: String,
    },
    RemoteControlStarted {
        session_id: String,
        peer_id: String,
        controlling: bool,
    },
    /// Opaque input event for the platform injection collaborator.
    RemoteControlInput {
        session_id: String,
        event: serde_json::Value,
    },
    RemoteControlRejected {
        request_id: String,
    },
    RemoteControlEnded {
        session_id: String,
    },

    // screen sharing
    ScreenSharingRequested {
        request_id: String,
        peer_id: String,
        quality: QualityProfile,
    },
    ScreenSharingStarted {
        session_id: String,
        peer_id: String,
        sending: bool,
        quality: QualityProfile,
    },
    /// Opaque signaling blob for the media collaborator.
    ScreenSharingSignal {
        session_id: String,
        kind: SignalKind,
        blob: serde_json::Value,
    },
    ScreenSharingRejected {
        request_id: String,
    },
    ScreenSharingEnded {
        session_id: String,
    },

    // lifecycle
    ServiceStarted,
    ServiceStopped,
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<CoreEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.tx.subscribe()
    }

    /// Fire-and-forget: no subscribers is not an error.
    pub fn emit(&self, event: CoreEvent) {
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_emitted_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.emit(CoreEvent::ServiceStarted);
        let ev = rx.recv().await.unwrap();
        assert!(matches!(ev, CoreEvent::ServiceStarted));
    }

    #[test]
    fn emit_without_subscribers_is_fine() {
        let bus = EventBus::new();
        bus.emit(CoreEvent::ServiceStopped);
    }
}
