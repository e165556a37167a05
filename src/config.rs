//! Service configuration: limits and tunables, TOML-loadable.

use crate::error::LinkError;
use crate::protocol::{limits, timeouts, BASE_PORT, MAX_PORT};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Display name announced to peers. Defaults to the OS hostname.
    pub device_name: Option<String>,
    /// Directory incoming files land in.
    pub receive_dir: PathBuf,
    /// Directory for the identity file and the peer record store.
    pub data_dir: PathBuf,

    /// Inclusive discovery/session port range.
    pub base_port: u16,
    pub max_port: u16,

    pub chunk_size: usize,
    pub max_file_bytes: u64,
    pub max_batch_bytes: u64,
    pub max_concurrent_transfers: usize,
    /// Unacked chunks in flight before the sender stalls.
    pub ack_window: u64,

    /// Seconds before a pending request stops being surfaced.
    pub request_surface_secs: i64,
    /// Seconds before a pending request is swept and auto-rejected.
    pub request_expiry_secs: i64,

    pub announce_interval_ms: u64,
    pub connect_timeout_ms: u64,

    /// Remove terminal transfer tasks from the visible list after
    /// `cleanup_delay_secs`, when enabled.
    pub auto_cleanup: bool,
    pub cleanup_delay_secs: i64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device_name: None,
            receive_dir: PathBuf::from("."),
            data_dir: PathBuf::from(".lanlink"),
            base_port: BASE_PORT,
            max_port: MAX_PORT,
            chunk_size: limits::CHUNK_SIZE,
            max_file_bytes: limits::MAX_FILE_BYTES,
            max_batch_bytes: limits::MAX_BATCH_BYTES,
            max_concurrent_transfers: limits::MAX_CONCURRENT_TRANSFERS,
            ack_window: limits::ACK_WINDOW,
            request_surface_secs: timeouts::REQUEST_SURFACE_SECS,
            request_expiry_secs: timeouts::REQUEST_EXPIRY_SECS,
            announce_interval_ms: timeouts::ANNOUNCE_INTERVAL_MS,
            connect_timeout_ms: timeouts::CONNECT_MS,
            auto_cleanup: true,
            cleanup_delay_secs: 30,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let cfg: Config = toml::from_str(&text)?;
        cfg.validate()
            .map_err(|e| anyhow::anyhow!("invalid config {}: {}", path.display(), e))?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), LinkError> {
        if self.base_port > self.max_port {
            return Err(LinkError::StartFailed(format!(
                "base_port {} above max_port {}",
                self.base_port, self.max_port
            )));
        }
        if self.chunk_size == 0 || self.max_concurrent_transfers == 0 || self.ack_window == 0 {
            return Err(LinkError::StartFailed(
                "chunk_size, max_concurrent_transfers and ack_window must be non-zero".into(),
            ));
        }
        Ok(())
    }

    pub fn display_name(&self) -> String {
        self.device_name.clone().unwrap_or_else(|| {
            hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "lanlink-device".to_string())
        })
    }
}
