//! lanlink - LAN device pairing and data exchange core
//!
//! Discovery over UDP broadcast, a pairing/trust handshake, chunked
//! resumable file transfer, and a signaling relay for remote-control and
//! screen-sharing sessions, all over one framed TCP link per peer.

pub mod cli;
pub mod config;
pub mod discovery;
pub mod error;
pub mod events;
pub mod pairing;
pub mod protocol;
pub mod service;
pub mod session;
pub mod signaling;
pub mod store;
pub mod transfer;
pub mod wire;
