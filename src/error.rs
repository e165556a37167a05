//! Typed error taxonomy for the lanlink core.
//!
//! Every rejected command carries a cause-specific variant so callers and
//! the UI layer can tell "file exceeds max size" from "peer is blocked"
//! from "no such pending request" without string matching.

use crate::wire::WireError;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LinkError {
    // -- transient network --
    #[error("peer {0} is unreachable")]
    Unreachable(String),
    #[error("send to peer {peer} failed: {reason}")]
    SendFailed { peer: String, reason: String },

    // -- protocol --
    #[error(transparent)]
    Wire(#[from] WireError),

    // -- policy violations --
    #[error("file {path} exceeds max file size ({size} > {limit} bytes)")]
    FileTooLarge {
        path: PathBuf,
        size: u64,
        limit: u64,
    },
    #[error("batch exceeds max total size ({size} > {limit} bytes)")]
    BatchTooLarge { size: u64, limit: u64 },
    #[error("peer {0} is blocked")]
    PeerBlocked(String),
    #[error("peer {0} is not paired")]
    NotPaired(String),
    #[error("pairing with peer {0} already in flight")]
    PairingInFlight(String),
    #[error("a {0} session is already active")]
    SessionBusy(&'static str),
    #[error("no active {0} session")]
    NoActiveSession(&'static str),

    // -- lookup failures --
    #[error("no such pending request {0}")]
    NoSuchRequest(String),
    #[error("no such transfer task {0}")]
    NoSuchTask(String),
    #[error("no such peer {0}")]
    NoSuchPeer(String),
    #[error("task {task} is not in a clearable state ({state})")]
    TaskNotTerminal { task: String, state: &'static str },
    #[error("peer record {0} is saved and cannot be deleted")]
    RecordProtected(String),

    // -- resource --
    #[error("record store error: {0}")]
    Store(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),

    // -- fatal / lifecycle --
    #[error("current network link is not acceptable for discovery")]
    LinkNotAcceptable,
    #[error("service is not running")]
    NotRunning,
    #[error("service failed to start: {0}")]
    StartFailed(String),
    #[error("no free port in range {0}..={1}")]
    NoFreePort(u16, u16),
}

pub type Result<T, E = LinkError> = std::result::Result<T, E>;
