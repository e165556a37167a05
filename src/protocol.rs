//! Shared protocol constants and typed messages for the lanlink framed transport

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// Protocol header constants
pub const MAGIC: &[u8; 4] = b"LLNK";
pub const VERSION: u16 = 1;

// Maximum frame payload size (16MB) - prevents DoS via memory exhaustion.
// File chunks are capped far below this; anything larger is stream corruption.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

// Discovery and session sockets live on a small inclusive port range so that
// several instances on one LAN segment (or one host) can coexist. A manual
// connect probes every port in the range against a target IP.
pub const BASE_PORT: u16 = 8080;
pub const MAX_PORT: u16 = 8090;

// Default transfer policy limits. All of these are overridable via Config.
pub mod limits {
    /// Maximum size of a single file (1 GiB).
    pub const MAX_FILE_BYTES: u64 = 1_073_741_824;
    /// Maximum combined size of one batch (4 GiB).
    pub const MAX_BATCH_BYTES: u64 = 4 * 1_073_741_824;
    /// Maximum number of concurrently streaming transfer tasks.
    pub const MAX_CONCURRENT_TRANSFERS: usize = 3;
    /// Default chunk size (256 KiB).
    pub const CHUNK_SIZE: usize = 256 * 1024;
    /// Unacked chunks the sender may have in flight before stalling.
    pub const ACK_WINDOW: u64 = 8;
}

// Centralized timing constants so async paths behave consistently
pub mod timeouts {
    /// Pending requests (pairing, transfer, remote control, screen sharing)
    /// stop being surfaced to the operator after this many seconds.
    pub const REQUEST_SURFACE_SECS: i64 = 60;

    /// Pending requests are physically expired (swept and auto-rejected)
    /// after this many seconds.
    pub const REQUEST_EXPIRY_SECS: i64 = 120;

    /// Per-port connection attempt during a manual connect probe (ms).
    pub const CONNECT_MS: u64 = 200;

    /// Interval between periodic discovery announcements (ms).
    pub const ANNOUNCE_INTERVAL_MS: u64 = 3_000;

    /// Base timeout for socket writes (ms).
    pub const WRITE_BASE_MS: u64 = 500;

    /// Additional write timeout per MB of payload (ms).
    pub const PER_MB_MS: u64 = 2;

    /// How long the sender waits for the receiver's completion confirmation.
    pub const COMPLETE_WAIT_MS: u64 = 30_000;

    /// Housekeeping sweep interval (expiry + auto-cleanup), ms.
    pub const SWEEP_INTERVAL_MS: u64 = 1_000;

    /// Delay before re-enabling networking after connectivity returns (ms).
    pub const RECOVERY_DELAY_MS: u64 = 500;

    // 500ms base + 2ms per MB payload (ceil)
    pub fn write_deadline_ms(payload_len: usize) -> u64 {
        let mb = (payload_len as u64 + 1_048_575) / 1_048_576;
        WRITE_BASE_MS + mb * PER_MB_MS
    }
}

/// One framed message. On the wire this is a JSON object of the shape
/// `{"type": ..., "fromUserId": ..., "toUserId": ..., "data": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "fromUserId")]
    pub from: String,
    #[serde(rename = "toUserId")]
    pub to: String,
    #[serde(flatten)]
    pub payload: Payload,
}

impl Envelope {
    pub fn new(from: impl Into<String>, to: impl Into<String>, payload: Payload) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            payload,
        }
    }
}

/// Every message family the dispatcher understands, tagged by the wire
/// `type` string. Adding a variant here forces every dispatch site to
/// handle it (exhaustive match), so a new message type can never be
/// silently ignored on our own side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum Payload {
    #[serde(rename = "discovery-announce")]
    DiscoveryAnnounce(Announce),

    #[serde(rename = "pairing-request")]
    PairingRequest(PairingRequestMsg),
    #[serde(rename = "pairing-response")]
    PairingResponse(PairingResponseMsg),

    #[serde(rename = "file-transfer-request")]
    FileTransferRequest(TransferRequestMsg),
    #[serde(rename = "file-transfer-response")]
    FileTransferResponse(TransferResponseMsg),
    #[serde(rename = "file-chunk")]
    FileChunk(FileChunkMsg),
    #[serde(rename = "file-chunk-ack")]
    FileChunkAck(FileChunkAckMsg),
    #[serde(rename = "file-transfer-cancel")]
    FileTransferCancel(TransferCancelMsg),
    #[serde(rename = "file-transfer-complete")]
    FileTransferComplete(TransferCompleteMsg),

    #[serde(rename = "remote-control-request")]
    RemoteControlRequest(SessionRequestMsg),
    #[serde(rename = "remote-control-response")]
    RemoteControlResponse(SessionResponseMsg),
    #[serde(rename = "remote-control-event")]
    RemoteControlEvent(RemoteControlEventMsg),
    #[serde(rename = "remote-control-disconnect")]
    RemoteControlDisconnect(SessionDisconnectMsg),

    #[serde(rename = "screen-sharing-request")]
    ScreenSharingRequest(ScreenSharingRequestMsg),
    #[serde(rename = "screen-sharing-response")]
    ScreenSharingResponse(ScreenSharingResponseMsg),
    #[serde(rename = "screen-sharing-signal")]
    ScreenSharingSignal(ScreenSharingSignalMsg),
    #[serde(rename = "screen-sharing-disconnect")]
    ScreenSharingDisconnect(SessionDisconnectMsg),
}

impl Payload {
    /// Wire `type` tags this implementation understands. Used by the codec
    /// to tell an unknown-but-well-formed message (log and drop) apart from
    /// a malformed body of a known type.
    pub const KNOWN_TYPES: &'static [&'static str] = &[
        "discovery-announce",
        "pairing-request",
        "pairing-response",
        "file-transfer-request",
        "file-transfer-response",
        "file-chunk",
        "file-chunk-ack",
        "file-transfer-cancel",
        "file-transfer-complete",
        "remote-control-request",
        "remote-control-response",
        "remote-control-event",
        "remote-control-disconnect",
        "screen-sharing-request",
        "screen-sharing-response",
        "screen-sharing-signal",
        "screen-sharing-disconnect",
    ];

    pub fn is_known_type(tag: &str) -> bool {
        Self::KNOWN_TYPES.contains(&tag)
    }

    /// Short tag for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::DiscoveryAnnounce(_) => "discovery-announce",
            Payload::PairingRequest(_) => "pairing-request",
            Payload::PairingResponse(_) => "pairing-response",
            Payload::FileTransferRequest(_) => "file-transfer-request",
            Payload::FileTransferResponse(_) => "file-transfer-response",
            Payload::FileChunk(_) => "file-chunk",
            Payload::FileChunkAck(_) => "file-chunk-ack",
            Payload::FileTransferCancel(_) => "file-transfer-cancel",
            Payload::FileTransferComplete(_) => "file-transfer-complete",
            Payload::RemoteControlRequest(_) => "remote-control-request",
            Payload::RemoteControlResponse(_) => "remote-control-response",
            Payload::RemoteControlEvent(_) => "remote-control-event",
            Payload::RemoteControlDisconnect(_) => "remote-control-disconnect",
            Payload::ScreenSharingRequest(_) => "screen-sharing-request",
            Payload::ScreenSharingResponse(_) => "screen-sharing-response",
            Payload::ScreenSharingSignal(_) => "screen-sharing-signal",
            Payload::ScreenSharingDisconnect(_) => "screen-sharing-disconnect",
        }
    }
}

/// Presence announcement. The source IP comes from the datagram / socket;
/// `port` is the TCP session port the announcing device listens on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Announce {
    #[serde(rename = "displayName")]
    pub display_name: String,
    #[serde(rename = "profileId")]
    pub profile_id: String,
    pub platform: String,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairingRequestMsg {
    #[serde(rename = "requestId")]
    pub request_id: String,
    #[serde(rename = "displayName")]
    pub display_name: String,
    pub platform: String,
    /// Requester intends to trust the responder once paired.
    #[serde(rename = "trustUser")]
    pub trust_user: bool,
    /// Requester intends to persist the responder's record once paired.
    #[serde(rename = "saveConnection")]
    pub save_connection: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairingResponseMsg {
    #[serde(rename = "requestId")]
    pub request_id: String,
    pub accepted: bool,
    /// Responder's trust decision, applied by the requester to the
    /// responder's record on acceptance.
    #[serde(rename = "trustUser")]
    pub trust_user: bool,
    #[serde(rename = "saveConnection")]
    pub save_connection: bool,
    pub message: Option<String>,
}

/// One file inside a batch offer. `task_id` is allocated by the sender and
/// shared by both sides for the lifetime of the transfer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileOffer {
    #[serde(rename = "taskId")]
    pub task_id: String,
    pub name: String,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferRequestMsg {
    #[serde(rename = "requestId")]
    pub request_id: String,
    #[serde(rename = "batchId")]
    pub batch_id: String,
    pub files: Vec<FileOffer>,
    #[serde(rename = "totalBytes")]
    pub total_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferResponseMsg {
    #[serde(rename = "requestId")]
    pub request_id: String,
    #[serde(rename = "batchId")]
    pub batch_id: String,
    pub accepted: bool,
    pub message: Option<String>,
    /// Byte offsets the receiver already holds (partial files from an
    /// earlier cancelled transfer); the sender resumes from these.
    #[serde(rename = "resumeOffsets", default)]
    pub resume_offsets: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileChunkMsg {
    #[serde(rename = "taskId")]
    pub task_id: String,
    pub offset: u64,
    #[serde(with = "crate::wire::base64_bytes")]
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileChunkAckMsg {
    #[serde(rename = "taskId")]
    pub task_id: String,
    /// Bytes received and written so far.
    pub received: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferCancelMsg {
    #[serde(rename = "taskId")]
    pub task_id: String,
    pub reason: Option<String>,
}

/// Sent by the sender after the last chunk (with the stream digest), and
/// echoed back by the receiver once the file is verified and renamed into
/// place. Completion is agreed on explicitly, never inferred from EOF.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferCompleteMsg {
    #[serde(rename = "taskId")]
    pub task_id: String,
    /// BLAKE3 hex digest of the full file; present sender-to-receiver,
    /// absent in the receiver's confirmation.
    pub digest: Option<String>,
    pub ok: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRequestMsg {
    #[serde(rename = "requestId")]
    pub request_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionResponseMsg {
    #[serde(rename = "requestId")]
    pub request_id: String,
    pub accepted: bool,
    #[serde(rename = "sessionId")]
    pub session_id: Option<String>,
    pub message: Option<String>,
}

/// Opaque input event relayed controller -> controlled. The core never
/// interprets the payload; injection is the platform collaborator's job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteControlEventMsg {
    #[serde(rename = "sessionId")]
    pub session_id: String,
    pub event: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionDisconnectMsg {
    #[serde(rename = "sessionId")]
    pub session_id: String,
}

/// Negotiated screen-sharing quality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualityProfile {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

impl Default for QualityProfile {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            fps: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScreenSharingRequestMsg {
    #[serde(rename = "requestId")]
    pub request_id: String,
    pub quality: QualityProfile,
    #[serde(rename = "sourceIndex")]
    pub source_index: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScreenSharingResponseMsg {
    #[serde(rename = "requestId")]
    pub request_id: String,
    pub accepted: bool,
    #[serde(rename = "sessionId")]
    pub session_id: Option<String>,
    /// Responder may downgrade the requested profile.
    pub quality: Option<QualityProfile>,
    pub message: Option<String>,
}

/// Opaque signaling blob subtypes used to bootstrap the media channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalKind {
    Offer,
    Answer,
    IceCandidate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScreenSharingSignalMsg {
    #[serde(rename = "sessionId")]
    pub session_id: String,
    pub kind: SignalKind,
    pub blob: serde_json::Value,
}
