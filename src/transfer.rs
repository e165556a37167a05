//! Transfer engine: chunked, resumable, cancellable file transfer over the
//! per-peer session socket.
//!
//! Senders stream chunk-by-chunk with a windowed-ack flow control: once
//! `ack_window` chunks are unacknowledged the pump stalls, so memory use
//! is bounded and a cancel is observed within one window. Receivers write
//! into `<name>.part` and rename into place only after the digest in the
//! explicit completion exchange checks out.

use crate::config::Config;
use crate::error::LinkError;
use crate::events::{CoreEvent, EventBus};
use crate::protocol::{
    timeouts, FileChunkAckMsg, FileChunkMsg, FileOffer, Payload, TransferCancelMsg,
    TransferCompleteMsg, TransferRequestMsg, TransferResponseMsg,
};
use crate::session::SessionManager;
use crate::store::{AutoDecision, PeerStore};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, watch, Semaphore};
use tokio::time::{timeout, Duration};
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Send,
    Receive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    InProgress,
    Paused,
    Completed,
    Cancelled,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Cancelled | TaskStatus::Failed
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in-progress",
            TaskStatus::Paused => "paused",
            TaskStatus::Completed => "completed",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::Failed => "failed",
        }
    }
}

/// Observer view of a task. `transferred` is sampled from an atomic
/// counter that only ever grows while the task is live.
#[derive(Debug, Clone)]
pub struct TaskSnapshot {
    pub id: String,
    pub batch_id: String,
    pub peer_id: String,
    pub direction: Direction,
    pub file_name: String,
    pub size: u64,
    pub transferred: u64,
    pub status: TaskStatus,
    pub error: Option<String>,
    pub terminal_at: Option<DateTime<Utc>>,
}

struct Task {
    id: String,
    batch_id: String,
    peer_id: String,
    direction: Direction,
    file_name: String,
    size: u64,
    /// Source path (send) or final destination (receive).
    path: PathBuf,
    transferred: AtomicU64,
    status: Mutex<TaskStatus>,
    error: Mutex<Option<String>>,
    terminal_at: Mutex<Option<DateTime<Utc>>>,
    cancel: watch::Sender<bool>,
    pause: watch::Sender<bool>,
}

impl Task {
    fn snapshot(&self) -> TaskSnapshot {
        TaskSnapshot {
            id: self.id.clone(),
            batch_id: self.batch_id.clone(),
            peer_id: self.peer_id.clone(),
            direction: self.direction,
            file_name: self.file_name.clone(),
            size: self.size,
            transferred: self.transferred.load(Ordering::Acquire),
            status: *self.status.lock(),
            error: self.error.lock().clone(),
            terminal_at: *self.terminal_at.lock(),
        }
    }

    /// Progress never decreases while observers sample it.
    fn record_progress(&self, bytes: u64) {
        self.transferred.fetch_max(bytes, Ordering::AcqRel);
    }
}

/// Inbound batch offer awaiting a decision.
#[derive(Debug, Clone)]
pub struct PendingTransfer {
    pub request_id: String,
    pub peer_id: String,
    pub batch_id: String,
    pub files: Vec<FileOffer>,
    pub total_bytes: u64,
    pub created: DateTime<Utc>,
}

/// Commands routed to a receive task's writer.
enum RecvCmd {
    Chunk(FileChunkMsg),
    Complete(TransferCompleteMsg),
    Abort { status: TaskStatus, reason: String },
}

struct EngineInner {
    config: Config,
    store: Arc<PeerStore>,
    sessions: SessionManager,
    events: EventBus,
    tasks: Mutex<HashMap<String, Arc<Task>>>,
    /// Inbound offers awaiting an operator decision.
    pending: Mutex<HashMap<String, PendingTransfer>>,
    /// Outbound offers awaiting the peer's response: request id -> task ids.
    offered: Mutex<HashMap<String, Vec<String>>>,
    /// Acked-bytes channel per sending task, fed by chunk acks.
    ack_flow: Mutex<HashMap<String, watch::Sender<u64>>>,
    /// Completion confirmations the sender is waiting on.
    complete_wait: Mutex<HashMap<String, oneshot::Sender<bool>>>,
    /// Writer inbox per receiving task.
    recv_inbox: Mutex<HashMap<String, mpsc::Sender<RecvCmd>>>,
    limiter: Semaphore,
}

#[derive(Clone)]
pub struct TransferEngine {
    inner: Arc<EngineInner>,
}

impl TransferEngine {
    pub fn new(
        config: Config,
        store: Arc<PeerStore>,
        sessions: SessionManager,
        events: EventBus,
    ) -> Self {
        let limiter = Semaphore::new(config.max_concurrent_transfers);
        Self {
            inner: Arc::new(EngineInner {
                config,
                store,
                sessions,
                events,
                tasks: Mutex::new(HashMap::new()),
                pending: Mutex::new(HashMap::new()),
                offered: Mutex::new(HashMap::new()),
                ack_flow: Mutex::new(HashMap::new()),
                complete_wait: Mutex::new(HashMap::new()),
                recv_inbox: Mutex::new(HashMap::new()),
                limiter,
            }),
        }
    }

    // -- outbound ----------------------------------------------------------

    /// Offer a batch of files to a paired peer. Limits are enforced before
    /// a single byte is sent; directories are expanded recursively.
    pub async fn send_files(&self, peer_id: &str, paths: &[PathBuf]) -> Result<String, LinkError> {
        let inner = &self.inner;
        let record = inner
            .store
            .get(peer_id)
            .ok_or_else(|| LinkError::NoSuchPeer(peer_id.to_string()))?;
        if record.blocked {
            return Err(LinkError::PeerBlocked(peer_id.to_string()));
        }
        if !record.paired {
            return Err(LinkError::NotPaired(peer_id.to_string()));
        }

        let files = expand_paths(paths)?;
        let mut total = 0u64;
        for (path, size) in &files {
            if *size > inner.config.max_file_bytes {
                return Err(LinkError::FileTooLarge {
                    path: path.clone(),
                    size: *size,
                    limit: inner.config.max_file_bytes,
                });
            }
            total += size;
        }
        if total > inner.config.max_batch_bytes {
            return Err(LinkError::BatchTooLarge {
                size: total,
                limit: inner.config.max_batch_bytes,
            });
        }

        let batch_id = Uuid::new_v4().to_string();
        let request_id = Uuid::new_v4().to_string();
        let mut offers = Vec::with_capacity(files.len());
        let mut task_ids = Vec::with_capacity(files.len());
        for (path, size) in files {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "file".to_string());
            let task = self.new_task(peer_id, &batch_id, Direction::Send, &name, size, path);
            offers.push(FileOffer {
                task_id: task.id.clone(),
                name,
                size,
            });
            task_ids.push(task.id.clone());
        }
        inner.offered.lock().insert(request_id.clone(), task_ids);

        let msg = Payload::FileTransferRequest(TransferRequestMsg {
            request_id: request_id.clone(),
            batch_id: batch_id.clone(),
            files: offers,
            total_bytes: total,
        });
        if let Err(e) = inner.sessions.send_to_peer(peer_id, msg).await {
            // offer never left the building; fail the batch
            if let Some(ids) = inner.offered.lock().remove(&request_id) {
                for id in ids {
                    self.finish_task(&id, TaskStatus::Failed, Some(e.to_string()));
                }
            }
            return Err(e);
        }
        info!(peer = %peer_id, batch = %batch_id, "transfer batch offered");
        Ok(batch_id)
    }

    /// Peer answered our offer.
    pub async fn handle_response(&self, peer_id: &str, msg: TransferResponseMsg) {
        let Some(task_ids) = self.inner.offered.lock().remove(&msg.request_id) else {
            debug!(request = %msg.request_id, "stale transfer response dropped");
            return;
        };
        if !msg.accepted {
            let reason = msg.message.unwrap_or_else(|| "rejected by peer".into());
            info!(peer = %peer_id, reason = %reason, "transfer batch rejected");
            for id in task_ids {
                self.finish_task(&id, TaskStatus::Failed, Some(reason.clone()));
            }
            return;
        }
        for id in task_ids {
            let Some(task) = self.inner.tasks.lock().get(&id).cloned() else {
                continue;
            };
            let resume = msg.resume_offsets.get(&id).copied().unwrap_or(0);
            let engine = self.clone();
            tokio::spawn(async move {
                engine.run_send_pump(task, resume).await;
            });
        }
    }

    // -- inbound -----------------------------------------------------------

    pub async fn handle_request(&self, peer_id: &str, msg: TransferRequestMsg) {
        // data exchange is a paired-peer privilege; trust alone (which can
        // be granted before pairing) does not admit an offer
        if !self.inner.store.get(peer_id).is_some_and(|r| r.paired) {
            info!(peer = %peer_id, "transfer request from unpaired peer rejected");
            self.send_response(peer_id, &msg, false, Some("not paired"), BTreeMap::new())
                .await;
            return;
        }
        // limits apply on the receiving side too, before any task exists
        for f in &msg.files {
            // the offered name is remote-controlled; anything that could
            // leave receive_dir never becomes a task
            if !valid_receive_name(&f.name) {
                warn!(peer = %peer_id, name = %f.name, "transfer offer with unsafe file name rejected");
                self.send_response(peer_id, &msg, false, Some("invalid file name"), BTreeMap::new())
                    .await;
                return;
            }
            if f.size > self.inner.config.max_file_bytes {
                self.send_response(peer_id, &msg, false, Some("file exceeds max size"), BTreeMap::new())
                    .await;
                return;
            }
        }
        if msg.total_bytes > self.inner.config.max_batch_bytes {
            self.send_response(peer_id, &msg, false, Some("batch exceeds max size"), BTreeMap::new())
                .await;
            return;
        }

        match self.inner.store.auto_decision(peer_id) {
            AutoDecision::Reject => {
                info!(peer = %peer_id, "transfer request from blocked peer auto-rejected");
                self.send_response(peer_id, &msg, false, Some("rejected"), BTreeMap::new())
                    .await;
            }
            AutoDecision::Accept => {
                debug!(peer = %peer_id, "transfer request from trusted peer auto-accepted");
                self.accept_offer(peer_id, &msg).await;
            }
            AutoDecision::Ask => {
                self.inner.pending.lock().insert(
                    msg.request_id.clone(),
                    PendingTransfer {
                        request_id: msg.request_id.clone(),
                        peer_id: peer_id.to_string(),
                        batch_id: msg.batch_id.clone(),
                        files: msg.files.clone(),
                        total_bytes: msg.total_bytes,
                        created: Utc::now(),
                    },
                );
                self.inner.events.emit(CoreEvent::TransferRequested {
                    request_id: msg.request_id,
                    peer_id: peer_id.to_string(),
                    file_count: msg.files.len(),
                    total_bytes: msg.total_bytes,
                });
            }
        }
    }

    /// Operator decision on a pending inbound offer. One-shot.
    pub async fn respond(
        &self,
        request_id: &str,
        accept: bool,
        reject_message: Option<String>,
    ) -> Result<(), LinkError> {
        let pending = self
            .inner
            .pending
            .lock()
            .remove(request_id)
            .ok_or_else(|| LinkError::NoSuchRequest(request_id.to_string()))?;
        let msg = TransferRequestMsg {
            request_id: pending.request_id.clone(),
            batch_id: pending.batch_id.clone(),
            files: pending.files.clone(),
            total_bytes: pending.total_bytes,
        };
        if accept {
            self.accept_offer(&pending.peer_id, &msg).await;
        } else {
            let reason = reject_message.unwrap_or_else(|| "rejected".into());
            self.send_response(&pending.peer_id, &msg, false, Some(&reason), BTreeMap::new())
                .await;
        }
        Ok(())
    }

    async fn accept_offer(&self, peer_id: &str, msg: &TransferRequestMsg) {
        let mut resume = BTreeMap::new();
        // destinations already written to by live receive tasks; a second
        // offer with the same basename must not share their .part file
        let mut claimed: HashSet<PathBuf> = self
            .inner
            .tasks
            .lock()
            .values()
            .filter(|t| t.direction == Direction::Receive && !t.status.lock().is_terminal())
            .map(|t| t.path.clone())
            .collect();
        for f in &msg.files {
            let dest = claim_dest(&self.inner.config.receive_dir, &f.name, &mut claimed);
            let file_name = dest
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| f.name.clone());
            let part = part_path(&dest);
            // an earlier cancelled transfer may have left bytes we can keep
            let offset = std::fs::metadata(&part).map(|m| m.len()).unwrap_or(0);
            let offset = offset.min(f.size);
            if offset > 0 {
                resume.insert(f.task_id.clone(), offset);
            }
            let task = Arc::new(Task {
                id: f.task_id.clone(),
                batch_id: msg.batch_id.clone(),
                peer_id: peer_id.to_string(),
                direction: Direction::Receive,
                file_name,
                size: f.size,
                path: dest,
                transferred: AtomicU64::new(offset),
                status: Mutex::new(TaskStatus::Pending),
                error: Mutex::new(None),
                terminal_at: Mutex::new(None),
                cancel: watch::channel(false).0,
                pause: watch::channel(false).0,
            });
            self.inner.tasks.lock().insert(task.id.clone(), task.clone());
            self.spawn_recv_writer(task, offset);
        }
        self.send_response(peer_id, msg, true, None, resume).await;
    }

    async fn send_response(
        &self,
        peer_id: &str,
        req: &TransferRequestMsg,
        accepted: bool,
        message: Option<&str>,
        resume_offsets: BTreeMap<String, u64>,
    ) {
        let msg = Payload::FileTransferResponse(TransferResponseMsg {
            request_id: req.request_id.clone(),
            batch_id: req.batch_id.clone(),
            accepted,
            message: message.map(str::to_string),
            resume_offsets,
        });
        if let Err(e) = self.inner.sessions.send_to_peer(peer_id, msg).await {
            warn!(peer = %peer_id, error = %e, "could not deliver transfer response");
        }
    }

    // -- sender pump -------------------------------------------------------

    async fn run_send_pump(&self, task: Arc<Task>, resume: u64) {
        // queue behind the concurrency cap instead of opening more streams
        let Ok(_permit) = self.inner.limiter.acquire().await else {
            return;
        };
        if task.status.lock().is_terminal() {
            return;
        }
        self.set_status(&task, TaskStatus::InProgress);

        let (ack_tx, ack_rx) = watch::channel(resume);
        self.inner.ack_flow.lock().insert(task.id.clone(), ack_tx);
        let (done_tx, done_rx) = oneshot::channel();
        self.inner.complete_wait.lock().insert(task.id.clone(), done_tx);

        let result = self.stream_file(&task, resume, ack_rx, done_rx).await;
        self.inner.ack_flow.lock().remove(&task.id);
        self.inner.complete_wait.lock().remove(&task.id);

        match result {
            Ok(()) => self.finish_task(&task.id, TaskStatus::Completed, None),
            Err(PumpExit::Cancelled) => {
                self.finish_task(&task.id, TaskStatus::Cancelled, None);
            }
            Err(PumpExit::Failed(reason)) => {
                // a mid-stream failure is reported to the peer so its
                // partial task does not wait forever
                let _ = self
                    .inner
                    .sessions
                    .send_to_peer(
                        &task.peer_id,
                        Payload::FileTransferCancel(TransferCancelMsg {
                            task_id: task.id.clone(),
                            reason: Some(reason.clone()),
                        }),
                    )
                    .await;
                self.finish_task(&task.id, TaskStatus::Failed, Some(reason));
            }
        }
    }

    async fn stream_file(
        &self,
        task: &Arc<Task>,
        resume: u64,
        mut ack_rx: watch::Receiver<u64>,
        done_rx: oneshot::Receiver<bool>,
    ) -> Result<(), PumpExit> {
        let mut file = tokio::fs::File::open(&task.path)
            .await
            .map_err(|e| PumpExit::Failed(format!("open {}: {e}", task.path.display())))?;

        // the completion digest covers the whole file, including any
        // resumed prefix the receiver already holds
        let mut hasher = blake3::Hasher::new();
        let mut hashed = 0u64;
        let mut buf = vec![0u8; self.inner.config.chunk_size];
        while hashed < resume {
            let want = ((resume - hashed) as usize).min(buf.len());
            let n = file
                .read(&mut buf[..want])
                .await
                .map_err(|e| PumpExit::Failed(e.to_string()))?;
            if n == 0 {
                return Err(PumpExit::Failed("file shorter than resume offset".into()));
            }
            hasher.update(&buf[..n]);
            hashed += n as u64;
        }
        if resume > 0 {
            file.seek(std::io::SeekFrom::Start(resume))
                .await
                .map_err(|e| PumpExit::Failed(e.to_string()))?;
            task.record_progress(resume);
        }

        let window_bytes = self.inner.config.ack_window * self.inner.config.chunk_size as u64;
        let mut cancel = task.cancel.subscribe();
        let mut pause = task.pause.subscribe();
        let mut sent = resume;

        loop {
            if *cancel.borrow() {
                return Err(PumpExit::Cancelled);
            }
            while *pause.borrow() {
                self.set_status(task, TaskStatus::Paused);
                tokio::select! {
                    _ = pause.changed() => {}
                    _ = cancel.changed() => {}
                }
                if *cancel.borrow() {
                    return Err(PumpExit::Cancelled);
                }
                if !*pause.borrow() {
                    self.set_status(task, TaskStatus::InProgress);
                }
            }

            // stall while a full window is unacknowledged; a cancel still
            // lands within the window wait
            while sent.saturating_sub(*ack_rx.borrow()) >= window_bytes {
                tokio::select! {
                    r = ack_rx.changed() => {
                        if r.is_err() {
                            return Err(PumpExit::Failed("ack channel closed".into()));
                        }
                        task.record_progress(*ack_rx.borrow());
                    }
                    _ = cancel.changed() => {
                        if *cancel.borrow() {
                            return Err(PumpExit::Cancelled);
                        }
                    }
                }
            }

            let n = file
                .read(&mut buf)
                .await
                .map_err(|e| PumpExit::Failed(e.to_string()))?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            let chunk = Payload::FileChunk(FileChunkMsg {
                task_id: task.id.clone(),
                offset: sent,
                data: buf[..n].to_vec(),
            });
            self.inner
                .sessions
                .send_to_peer(&task.peer_id, chunk)
                .await
                .map_err(|e| PumpExit::Failed(e.to_string()))?;
            sent += n as u64;
            self.inner.events.emit(CoreEvent::TransferUpdated {
                task: task.snapshot(),
            });
        }

        let digest = hasher.finalize().to_hex().to_string();
        self.inner
            .sessions
            .send_to_peer(
                &task.peer_id,
                Payload::FileTransferComplete(TransferCompleteMsg {
                    task_id: task.id.clone(),
                    digest: Some(digest),
                    ok: true,
                }),
            )
            .await
            .map_err(|e| PumpExit::Failed(e.to_string()))?;

        // completion is agreed explicitly, not assumed from the last write
        match timeout(Duration::from_millis(timeouts::COMPLETE_WAIT_MS), done_rx).await {
            Ok(Ok(true)) => {
                task.record_progress(task.size);
                Ok(())
            }
            Ok(Ok(false)) => Err(PumpExit::Failed("receiver reported digest mismatch".into())),
            Ok(Err(_)) => Err(PumpExit::Cancelled),
            Err(_) => Err(PumpExit::Failed("no completion confirmation".into())),
        }
    }

    // -- receiver writer ---------------------------------------------------

    fn spawn_recv_writer(&self, task: Arc<Task>, resume: u64) {
        let (tx, rx) = mpsc::channel(self.inner.config.ack_window as usize * 2);
        self.inner.recv_inbox.lock().insert(task.id.clone(), tx);
        let engine = self.clone();
        tokio::spawn(async move {
            engine.run_recv_writer(task, resume, rx).await;
        });
    }

    async fn run_recv_writer(&self, task: Arc<Task>, resume: u64, mut rx: mpsc::Receiver<RecvCmd>) {
        let part = part_path(&task.path);
        let outcome = self.write_incoming(&task, &part, resume, &mut rx).await;
        self.inner.recv_inbox.lock().remove(&task.id);
        match outcome {
            Ok(()) => {
                let _ = self
                    .inner
                    .sessions
                    .send_to_peer(
                        &task.peer_id,
                        Payload::FileTransferComplete(TransferCompleteMsg {
                            task_id: task.id.clone(),
                            digest: None,
                            ok: true,
                        }),
                    )
                    .await;
                self.finish_task(&task.id, TaskStatus::Completed, None);
            }
            Err(PumpExit::Cancelled) => {
                // partial file stays on disk unless the user clears it
                self.finish_task(&task.id, TaskStatus::Cancelled, None);
            }
            Err(PumpExit::Failed(reason)) => {
                let _ = self
                    .inner
                    .sessions
                    .send_to_peer(
                        &task.peer_id,
                        Payload::FileTransferComplete(TransferCompleteMsg {
                            task_id: task.id.clone(),
                            digest: None,
                            ok: false,
                        }),
                    )
                    .await;
                self.finish_task(&task.id, TaskStatus::Failed, Some(reason));
            }
        }
    }

    async fn write_incoming(
        &self,
        task: &Arc<Task>,
        part: &Path,
        resume: u64,
        rx: &mut mpsc::Receiver<RecvCmd>,
    ) -> Result<(), PumpExit> {
        if let Some(parent) = part.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| PumpExit::Failed(e.to_string()))?;
        }
        let mut opts = tokio::fs::OpenOptions::new();
        if resume > 0 {
            opts.append(true);
        } else {
            opts.write(true).truncate(true);
        }
        let mut file = opts
            .create(true)
            .open(part)
            .await
            .map_err(|e| PumpExit::Failed(format!("open {}: {e}", part.display())))?;

        // digest covers the resumed prefix too
        let mut hasher = blake3::Hasher::new();
        if resume > 0 {
            let mut existing = tokio::fs::File::open(part)
                .await
                .map_err(|e| PumpExit::Failed(e.to_string()))?;
            let mut buf = vec![0u8; self.inner.config.chunk_size];
            let mut left = resume;
            while left > 0 {
                let want = (left as usize).min(buf.len());
                let n = existing
                    .read(&mut buf[..want])
                    .await
                    .map_err(|e| PumpExit::Failed(e.to_string()))?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
                left -= n as u64;
            }
        }

        let mut expected = resume;
        self.set_status(task, TaskStatus::InProgress);
        let mut last_emit = expected;

        loop {
            let Some(cmd) = rx.recv().await else {
                return Err(PumpExit::Failed("writer inbox closed".into()));
            };
            match cmd {
                RecvCmd::Chunk(chunk) => {
                    if chunk.offset != expected {
                        return Err(PumpExit::Failed(format!(
                            "chunk out of order: got offset {}, expected {}",
                            chunk.offset, expected
                        )));
                    }
                    file.write_all(&chunk.data)
                        .await
                        .map_err(|e| PumpExit::Failed(e.to_string()))?;
                    hasher.update(&chunk.data);
                    expected += chunk.data.len() as u64;
                    task.record_progress(expected);
                    let _ = self
                        .inner
                        .sessions
                        .send_to_peer(
                            &task.peer_id,
                            Payload::FileChunkAck(FileChunkAckMsg {
                                task_id: task.id.clone(),
                                received: expected,
                            }),
                        )
                        .await;
                    if expected - last_emit >= 1_048_576 || expected == task.size {
                        last_emit = expected;
                        self.inner.events.emit(CoreEvent::TransferUpdated {
                            task: task.snapshot(),
                        });
                    }
                }
                RecvCmd::Complete(done) => {
                    file.flush().await.map_err(|e| PumpExit::Failed(e.to_string()))?;
                    if expected != task.size {
                        return Err(PumpExit::Failed(format!(
                            "completion before all bytes arrived ({expected}/{})",
                            task.size
                        )));
                    }
                    let ours = hasher.finalize().to_hex().to_string();
                    if let Some(theirs) = done.digest {
                        if ours != theirs {
                            return Err(PumpExit::Failed("digest mismatch".into()));
                        }
                    }
                    drop(file);
                    tokio::fs::rename(part, &task.path)
                        .await
                        .map_err(|e| PumpExit::Failed(e.to_string()))?;
                    return Ok(());
                }
                RecvCmd::Abort { status, reason } => {
                    let _ = file.flush().await;
                    return match status {
                        TaskStatus::Cancelled => Err(PumpExit::Cancelled),
                        _ => Err(PumpExit::Failed(reason)),
                    };
                }
            }
        }
    }

    // -- wire handlers (dispatched by the service loop) --------------------

    pub async fn handle_chunk(&self, peer_id: &str, msg: FileChunkMsg) {
        let inbox = self.inner.recv_inbox.lock().get(&msg.task_id).cloned();
        match inbox {
            Some(tx) => {
                if tx.send(RecvCmd::Chunk(msg)).await.is_err() {
                    debug!(peer = %peer_id, "chunk for finished task dropped");
                }
            }
            None => debug!(peer = %peer_id, task = %msg.task_id, "chunk for unknown task dropped"),
        }
    }

    pub fn handle_ack(&self, _peer_id: &str, msg: FileChunkAckMsg) {
        if let Some(flow) = self.inner.ack_flow.lock().get(&msg.task_id) {
            // watch keeps the max; acks arriving out of order cannot
            // shrink observed progress
            flow.send_if_modified(|cur| {
                if msg.received > *cur {
                    *cur = msg.received;
                    true
                } else {
                    false
                }
            });
        }
        if let Some(task) = self.inner.tasks.lock().get(&msg.task_id) {
            task.record_progress(msg.received);
        }
    }

    pub async fn handle_cancel(&self, peer_id: &str, msg: TransferCancelMsg) {
        info!(peer = %peer_id, task = %msg.task_id, reason = ?msg.reason, "peer cancelled transfer");
        let task = self.inner.tasks.lock().get(&msg.task_id).cloned();
        let Some(task) = task else { return };
        match task.direction {
            Direction::Send => {
                let _ = task.cancel.send(true);
            }
            Direction::Receive => {
                let inbox = self.inner.recv_inbox.lock().get(&msg.task_id).cloned();
                if let Some(tx) = inbox {
                    let _ = tx
                        .send(RecvCmd::Abort {
                            status: TaskStatus::Cancelled,
                            reason: msg.reason.unwrap_or_else(|| "cancelled by peer".into()),
                        })
                        .await;
                } else {
                    self.finish_task(&msg.task_id, TaskStatus::Cancelled, None);
                }
            }
        }
    }

    pub async fn handle_complete(&self, peer_id: &str, msg: TransferCompleteMsg) {
        let task = self.inner.tasks.lock().get(&msg.task_id).cloned();
        let Some(task) = task else {
            debug!(peer = %peer_id, task = %msg.task_id, "completion for unknown task dropped");
            return;
        };
        match task.direction {
            // receiver's confirmation back to us, the sender
            Direction::Send => {
                if let Some(done) = self.inner.complete_wait.lock().remove(&msg.task_id) {
                    let _ = done.send(msg.ok);
                }
            }
            // sender finished streaming to us
            Direction::Receive => {
                let inbox = self.inner.recv_inbox.lock().get(&msg.task_id).cloned();
                if let Some(tx) = inbox {
                    let _ = tx.send(RecvCmd::Complete(msg)).await;
                }
            }
        }
    }

    // -- commands ----------------------------------------------------------

    /// Cancel an in-flight or pending task. The chunk pump observes the
    /// flag within one window; the peer is told best-effort.
    pub async fn cancel(&self, task_id: &str) -> Result<(), LinkError> {
        let task = self
            .inner
            .tasks
            .lock()
            .get(task_id)
            .cloned()
            .ok_or_else(|| LinkError::NoSuchTask(task_id.to_string()))?;
        if task.status.lock().is_terminal() {
            return Ok(());
        }
        let _ = self
            .inner
            .sessions
            .send_to_peer(
                &task.peer_id,
                Payload::FileTransferCancel(TransferCancelMsg {
                    task_id: task_id.to_string(),
                    reason: None,
                }),
            )
            .await;
        match task.direction {
            Direction::Send => {
                let _ = task.cancel.send(true);
                // a task still queued behind the limiter has no pump yet
                if *task.status.lock() == TaskStatus::Pending {
                    self.finish_task(task_id, TaskStatus::Cancelled, None);
                }
            }
            Direction::Receive => {
                let inbox = self.inner.recv_inbox.lock().get(task_id).cloned();
                match inbox {
                    Some(tx) => {
                        let _ = tx
                            .send(RecvCmd::Abort {
                                status: TaskStatus::Cancelled,
                                reason: "cancelled".into(),
                            })
                            .await;
                    }
                    None => self.finish_task(task_id, TaskStatus::Cancelled, None),
                }
            }
        }
        Ok(())
    }

    pub fn pause(&self, task_id: &str) -> Result<(), LinkError> {
        let task = self
            .inner
            .tasks
            .lock()
            .get(task_id)
            .cloned()
            .ok_or_else(|| LinkError::NoSuchTask(task_id.to_string()))?;
        let _ = task.pause.send(true);
        Ok(())
    }

    pub fn resume(&self, task_id: &str) -> Result<(), LinkError> {
        let task = self
            .inner
            .tasks
            .lock()
            .get(task_id)
            .cloned()
            .ok_or_else(|| LinkError::NoSuchTask(task_id.to_string()))?;
        let _ = task.pause.send(false);
        Ok(())
    }

    /// Remove a terminal task from the visible list, optionally deleting
    /// an incomplete partial file.
    pub fn clear(&self, task_id: &str, delete_incomplete: bool) -> Result<(), LinkError> {
        let task = {
            let tasks = self.inner.tasks.lock();
            let task = tasks
                .get(task_id)
                .cloned()
                .ok_or_else(|| LinkError::NoSuchTask(task_id.to_string()))?;
            let status = *task.status.lock();
            if !status.is_terminal() {
                return Err(LinkError::TaskNotTerminal {
                    task: task_id.to_string(),
                    state: status.name(),
                });
            }
            task
        };
        self.inner.tasks.lock().remove(task_id);
        if delete_incomplete
            && task.direction == Direction::Receive
            && *task.status.lock() != TaskStatus::Completed
        {
            let part = part_path(&task.path);
            if let Err(e) = std::fs::remove_file(&part) {
                debug!(path = %part.display(), error = %e, "partial file removal failed");
            }
        }
        self.inner.events.emit(CoreEvent::TransferCleared {
            task_id: task_id.to_string(),
        });
        Ok(())
    }

    /// Clear every terminal task of a batch as a unit.
    pub fn clear_batch(&self, batch_id: &str, delete_incomplete: bool) -> Result<(), LinkError> {
        let ids: Vec<String> = self
            .inner
            .tasks
            .lock()
            .values()
            .filter(|t| t.batch_id == batch_id && t.status.lock().is_terminal())
            .map(|t| t.id.clone())
            .collect();
        for id in ids {
            self.clear(&id, delete_incomplete)?;
        }
        Ok(())
    }

    pub fn snapshots(&self) -> Vec<TaskSnapshot> {
        let mut out: Vec<TaskSnapshot> = self
            .inner
            .tasks
            .lock()
            .values()
            .map(|t| t.snapshot())
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    pub fn pending_requests(&self) -> Vec<PendingTransfer> {
        let cutoff = Utc::now() - ChronoDuration::seconds(self.inner.config.request_surface_secs);
        self.inner
            .pending
            .lock()
            .values()
            .filter(|p| p.created > cutoff)
            .cloned()
            .collect()
    }

    /// Housekeeping: expire unanswered offers and sweep terminal tasks
    /// out of the visible list once they are old enough.
    pub async fn sweep(&self) {
        let cutoff = Utc::now() - ChronoDuration::seconds(self.inner.config.request_expiry_secs);
        let expired: Vec<PendingTransfer> = {
            let mut pending = self.inner.pending.lock();
            let ids: Vec<String> = pending
                .values()
                .filter(|p| p.created <= cutoff)
                .map(|p| p.request_id.clone())
                .collect();
            ids.into_iter().filter_map(|id| pending.remove(&id)).collect()
        };
        for p in expired {
            info!(peer = %p.peer_id, request = %p.request_id, "transfer offer expired");
            let msg = TransferRequestMsg {
                request_id: p.request_id.clone(),
                batch_id: p.batch_id.clone(),
                files: p.files.clone(),
                total_bytes: p.total_bytes,
            };
            self.send_response(&p.peer_id, &msg, false, Some("expired"), BTreeMap::new())
                .await;
        }

        if self.inner.config.auto_cleanup {
            let age = ChronoDuration::seconds(self.inner.config.cleanup_delay_secs);
            let now = Utc::now();
            let old: Vec<String> = self
                .inner
                .tasks
                .lock()
                .values()
                .filter(|t| {
                    t.terminal_at
                        .lock()
                        .map(|ts| now - ts >= age)
                        .unwrap_or(false)
                })
                .map(|t| t.id.clone())
                .collect();
            for id in old {
                let _ = self.clear(&id, false);
            }
        }
    }

    /// Session manager lost the peer: every live task bound to it fails,
    /// other peers' tasks are untouched.
    pub async fn handle_peer_disconnected(&self, peer_id: &str) {
        let affected: Vec<Arc<Task>> = self
            .inner
            .tasks
            .lock()
            .values()
            .filter(|t| t.peer_id == peer_id && !t.status.lock().is_terminal())
            .cloned()
            .collect();
        for task in affected {
            warn!(task = %task.id, peer = %peer_id, "transfer failed: peer disconnected");
            match task.direction {
                Direction::Send => {
                    let _ = task.cancel.send(true);
                    self.finish_task(&task.id, TaskStatus::Failed, Some("peer disconnected".into()));
                }
                Direction::Receive => {
                    let inbox = self.inner.recv_inbox.lock().get(&task.id).cloned();
                    if let Some(tx) = inbox {
                        let _ = tx
                            .send(RecvCmd::Abort {
                                status: TaskStatus::Failed,
                                reason: "peer disconnected".into(),
                            })
                            .await;
                    } else {
                        self.finish_task(&task.id, TaskStatus::Failed, Some("peer disconnected".into()));
                    }
                }
            }
        }
        let stale: Vec<String> = self
            .inner
            .pending
            .lock()
            .values()
            .filter(|p| p.peer_id == peer_id)
            .map(|p| p.request_id.clone())
            .collect();
        let mut pending = self.inner.pending.lock();
        for id in stale {
            pending.remove(&id);
        }
    }

    // -- internals ---------------------------------------------------------

    fn new_task(
        &self,
        peer_id: &str,
        batch_id: &str,
        direction: Direction,
        name: &str,
        size: u64,
        path: PathBuf,
    ) -> Arc<Task> {
        let task = Arc::new(Task {
            id: Uuid::new_v4().to_string(),
            batch_id: batch_id.to_string(),
            peer_id: peer_id.to_string(),
            direction,
            file_name: name.to_string(),
            size,
            path,
            transferred: AtomicU64::new(0),
            status: Mutex::new(TaskStatus::Pending),
            error: Mutex::new(None),
            terminal_at: Mutex::new(None),
            cancel: watch::channel(false).0,
            pause: watch::channel(false).0,
        });
        self.inner.tasks.lock().insert(task.id.clone(), task.clone());
        task
    }

    fn set_status(&self, task: &Arc<Task>, status: TaskStatus) {
        *task.status.lock() = status;
        self.inner.events.emit(CoreEvent::TransferUpdated {
            task: task.snapshot(),
        });
    }

    /// Move a task to a terminal state exactly once, stamping the time
    /// the auto-cleanup policy keys off.
    fn finish_task(&self, task_id: &str, status: TaskStatus, error: Option<String>) {
        let task = self.inner.tasks.lock().get(task_id).cloned();
        let Some(task) = task else { return };
        {
            let mut cur = task.status.lock();
            if cur.is_terminal() {
                return;
            }
            *cur = status;
        }
        *task.error.lock() = error;
        *task.terminal_at.lock() = Some(Utc::now());
        self.inner.events.emit(CoreEvent::TransferFinished {
            task: task.snapshot(),
        });
    }
}

enum PumpExit {
    Cancelled,
    Failed(String),
}

/// A remote-supplied file name must resolve to a plain entry inside the
/// receive directory: no separators, no parent components, no NULs.
fn valid_receive_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains('/')
        && !name.contains('\\')
        && !name.contains('\0')
}

/// Pick a destination for an offered name, switching to `name (1)`,
/// `name (2)`, ... while another live task already owns it.
fn claim_dest(dir: &Path, name: &str, claimed: &mut HashSet<PathBuf>) -> PathBuf {
    let mut dest = dir.join(name);
    let mut n = 1u32;
    while claimed.contains(&dest) {
        let p = Path::new(name);
        let stem = p
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".into());
        dest = match p.extension() {
            Some(ext) => dir.join(format!("{stem} ({n}).{}", ext.to_string_lossy())),
            None => dir.join(format!("{stem} ({n})")),
        };
        n += 1;
    }
    claimed.insert(dest.clone());
    dest
}

fn part_path(dest: &Path) -> PathBuf {
    let mut name = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".into());
    name.push_str(".part");
    dest.with_file_name(name)
}

/// Expand files and directories into a flat (path, size) list.
fn expand_paths(paths: &[PathBuf]) -> Result<Vec<(PathBuf, u64)>, LinkError> {
    let mut out = Vec::new();
    for p in paths {
        let meta = std::fs::metadata(p)?;
        if meta.is_file() {
            out.push((p.clone(), meta.len()));
        } else if meta.is_dir() {
            for entry in walkdir::WalkDir::new(p).follow_links(false) {
                let entry = entry.map_err(|e| LinkError::Store(e.to_string()))?;
                if entry.file_type().is_file() {
                    let len = entry.metadata().map(|m| m.len()).unwrap_or(0);
                    out.push((entry.into_path(), len));
                }
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Announce;
    use crate::store::{MemoryRecordStore, PeerRecord};
    use std::net::{IpAddr, Ipv4Addr};

    fn engine_with_peer(config: Config) -> (TransferEngine, Arc<PeerStore>) {
        let store = Arc::new(PeerStore::open(Box::new(MemoryRecordStore::default())).unwrap());
        store
            .upsert_discovered(PeerRecord::discovered(
                "peer-1",
                "Peer",
                "profile",
                "linux",
                IpAddr::V4(Ipv4Addr::LOCALHOST),
                1, // nothing listens here; sends fail fast
            ))
            .unwrap();
        store.apply_pairing("peer-1", false, false).unwrap();
        let events = EventBus::new();
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
            TransferEngine::new(config, store.clone(), sessions, events),
            store,
        )
    }

    #[tokio::test]
    async fn oversized_file_is_rejected_before_any_send() {
        let dir = tempfile::tempdir().unwrap();
        let big = dir.path().join("big.bin");
        std::fs::write(&big, vec![0u8; 4096]).unwrap();

        let config = Config {
            max_file_bytes: 1024,
            ..Config::default()
        };
        let (engine, _) = engine_with_peer(config);
        let err = engine.send_files("peer-1", &[big]).await.unwrap_err();
        assert!(matches!(
            err,
            LinkError::FileTooLarge { size: 4096, limit: 1024, .. }
        ));
        // nothing was created for a rejected batch
        assert!(engine.snapshots().is_empty());
    }

    #[tokio::test]
    async fn oversized_batch_is_rejected_as_a_whole() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..3 {
            std::fs::write(dir.path().join(format!("f{i}.bin")), vec![0u8; 600]).unwrap();
        }
        let config = Config {
            max_file_bytes: 1024,
            max_batch_bytes: 1024,
            ..Config::default()
        };
        let (engine, _) = engine_with_peer(config);
        let err = engine
            .send_files("peer-1", &[dir.path().to_path_buf()])
            .await
            .unwrap_err();
        assert!(matches!(err, LinkError::BatchTooLarge { size: 1800, .. }));
    }

    #[tokio::test]
    async fn sending_to_blocked_or_unpaired_peer_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let f = dir.path().join("f.bin");
        std::fs::write(&f, b"data").unwrap();

        let (engine, store) = engine_with_peer(Config::default());
        store.set_blocked("peer-1", true).unwrap();
        let err = engine.send_files("peer-1", &[f.clone()]).await.unwrap_err();
        assert!(matches!(err, LinkError::PeerBlocked(_)));

        store.set_blocked("peer-1", false).unwrap();
        store.set_paired("peer-1", false).unwrap();
        let err = engine.send_files("peer-1", &[f]).await.unwrap_err();
        assert!(matches!(err, LinkError::NotPaired(_)));
    }

    #[tokio::test]
    async fn inbound_oversized_request_creates_no_task() {
        let (engine, _) = engine_with_peer(Config {
            max_file_bytes: 1024,
            ..Config::default()
        });
        engine
            .handle_request(
                "peer-1",
                TransferRequestMsg {
                    request_id: "r1".into(),
                    batch_id: "b1".into(),
                    files: vec![FileOffer {
                        task_id: "t1".into(),
                        name: "big.bin".into(),
                        size: 2_147_483_648,
                    }],
                    total_bytes: 2_147_483_648,
                },
            )
            .await;
        assert!(engine.snapshots().is_empty());
        assert!(engine.pending_requests().is_empty());
    }

    #[tokio::test]
    async fn unknown_task_and_request_errors_are_specific() {
        let (engine, _) = engine_with_peer(Config::default());
        assert!(matches!(
            engine.cancel("nope").await.unwrap_err(),
            LinkError::NoSuchTask(_)
        ));
        assert!(matches!(
            engine.respond("nope", true, None).await.unwrap_err(),
            LinkError::NoSuchRequest(_)
        ));
        assert!(matches!(
            engine.clear("nope", false).unwrap_err(),
            LinkError::NoSuchTask(_)
        ));
    }

    #[tokio::test]
    async fn traversal_name_in_offer_never_becomes_a_task() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            receive_dir: dir.path().join("incoming"),
            ..Config::default()
        };
        let (engine, store) = engine_with_peer(config);
        // trusted, so a clean offer would be auto-accepted and written
        store.set_trusted("peer-1", true).unwrap();
        for name in ["../escaped.bin", "..", "a/b.bin", "c\\d.bin", ""] {
            engine
                .handle_request(
                    "peer-1",
                    TransferRequestMsg {
                        request_id: "r1".into(),
                        batch_id: "b1".into(),
                        files: vec![FileOffer {
                            task_id: "t1".into(),
                            name: name.into(),
                            size: 4,
                        }],
                        total_bytes: 4,
                    },
                )
                .await;
        }
        assert!(engine.snapshots().is_empty());
        assert!(engine.pending_requests().is_empty());
        assert!(!dir.path().join("escaped.bin.part").exists());
    }

    #[tokio::test]
    async fn unpaired_peer_offer_is_refused_even_when_trusted() {
        let (engine, store) = engine_with_peer(Config::default());
        store.set_paired("peer-1", false).unwrap();
        store.set_trusted("peer-1", true).unwrap();
        engine
            .handle_request(
                "peer-1",
                TransferRequestMsg {
                    request_id: "r1".into(),
                    batch_id: "b1".into(),
                    files: vec![FileOffer {
                        task_id: "t1".into(),
                        name: "doc.txt".into(),
                        size: 4,
                    }],
                    total_bytes: 4,
                },
            )
            .await;
        assert!(engine.snapshots().is_empty());
        assert!(engine.pending_requests().is_empty());
    }

    #[tokio::test]
    async fn duplicate_names_in_a_batch_get_distinct_destinations() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            receive_dir: dir.path().join("incoming"),
            ..Config::default()
        };
        let (engine, store) = engine_with_peer(config);
        store.set_trusted("peer-1", true).unwrap();
        engine
            .handle_request(
                "peer-1",
                TransferRequestMsg {
                    request_id: "r1".into(),
                    batch_id: "b1".into(),
                    files: vec![
                        FileOffer {
                            task_id: "t1".into(),
                            name: "dup.bin".into(),
                            size: 8,
                        },
                        FileOffer {
                            task_id: "t2".into(),
                            name: "dup.bin".into(),
                            size: 8,
                        },
                    ],
                    total_bytes: 16,
                },
            )
            .await;
        let names: HashSet<String> = engine
            .snapshots()
            .iter()
            .map(|t| t.file_name.clone())
            .collect();
        assert_eq!(names.len(), 2);
        assert!(names.contains("dup.bin"));
        assert!(names.contains("dup (1).bin"));
    }

    #[tokio::test]
    async fn progress_samples_never_decrease() {
        let (engine, _) = engine_with_peer(Config::default());
        let task = engine.new_task(
            "peer-1",
            "b1",
            Direction::Send,
            "f.bin",
            100,
            PathBuf::from("/tmp/f.bin"),
        );
        task.record_progress(60);
        task.record_progress(25);
        assert_eq!(task.snapshot().transferred, 60);

        // a late, lower ack from the wire cannot shrink it either
        engine.handle_ack(
            "peer-1",
            FileChunkAckMsg {
                task_id: task.id.clone(),
                received: 40,
            },
        );
        assert_eq!(task.snapshot().transferred, 60);
        engine.handle_ack(
            "peer-1",
            FileChunkAckMsg {
                task_id: task.id.clone(),
                received: 90,
            },
        );
        assert_eq!(task.snapshot().transferred, 90);
    }

    #[test]
    fn part_path_appends_suffix() {
        assert_eq!(
            part_path(Path::new("/tmp/incoming/report.pdf")),
            Path::new("/tmp/incoming/report.pdf.part")
        );
    }
}
