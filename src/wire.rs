//! Framed codec for the lanlink socket protocol.
//!
//! Frame layout: MAGIC (4) | VERSION u16 LE (2) | FLAGS u8 (1) | LENGTH u32 LE (4)
//! followed by LENGTH bytes of JSON body (the message envelope). Sockets
//! deliver arbitrary chunk boundaries, so decoding is incremental: bytes are
//! accumulated and complete frames are drained one at a time.

use crate::protocol::{self, Envelope, Payload, MAGIC, MAX_FRAME_SIZE, VERSION};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{timeout, Duration};

pub const HEADER_LEN: usize = 11;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("bad magic in frame header")]
    BadMagic,
    #[error("protocol version mismatch: got {0}, need {VERSION}")]
    VersionMismatch(u16),
    #[error("frame too large: {0} bytes (max: {MAX_FRAME_SIZE})")]
    Oversized(usize),
    #[error("malformed frame body: {0}")]
    Malformed(String),
    #[error("unknown message type {0:?}")]
    UnknownType(String),
}

impl WireError {
    /// Corruption means the byte stream can no longer be trusted and the
    /// connection must be reset. A malformed or unknown body of a known
    /// length leaves the stream in sync: log, drop, keep the connection.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            WireError::BadMagic | WireError::VersionMismatch(_) | WireError::Oversized(_)
        )
    }
}

/// Build frame header. Format: MAGIC (4) | VERSION (2) | FLAGS (1) | LENGTH (4)
pub fn build_frame_header(flags: u8, payload_len: u32) -> [u8; HEADER_LEN] {
    let mut header = [0u8; HEADER_LEN];
    header[0..4].copy_from_slice(MAGIC);
    header[4..6].copy_from_slice(&VERSION.to_le_bytes());
    header[6] = flags;
    header[7..11].copy_from_slice(&payload_len.to_le_bytes());
    header
}

/// Parse frame header, returning (flags, payload_length).
pub fn parse_frame_header(header: &[u8; HEADER_LEN]) -> Result<(u8, u32), WireError> {
    if &header[0..4] != MAGIC {
        return Err(WireError::BadMagic);
    }
    let version = u16::from_le_bytes([header[4], header[5]]);
    if version != VERSION {
        return Err(WireError::VersionMismatch(version));
    }
    let len = u32::from_le_bytes([header[7], header[8], header[9], header[10]]);
    if len as usize > MAX_FRAME_SIZE {
        return Err(WireError::Oversized(len as usize));
    }
    Ok((header[6], len))
}

/// Encode one envelope into a ready-to-write frame.
pub fn encode_frame(env: &Envelope) -> Vec<u8> {
    // Envelope is always serializable; the payload types carry no
    // non-serializable state.
    let body = serde_json::to_vec(env).unwrap_or_default();
    let mut out = Vec::with_capacity(HEADER_LEN + body.len());
    out.extend_from_slice(&build_frame_header(0, body.len() as u32));
    out.extend_from_slice(&body);
    out
}

/// Drain one complete frame from the accumulation buffer.
///
/// Returns `Ok(Some(envelope))` for a decoded frame, `Ok(None)` when more
/// bytes are needed, `Err` for a bad frame. On `Malformed`/`UnknownType`
/// the offending frame's bytes have already been consumed, so the caller
/// can log, drop, and keep reading.
pub fn try_decode_frame(buf: &mut Vec<u8>) -> Result<Option<Envelope>, WireError> {
    if buf.len() < HEADER_LEN {
        return Ok(None);
    }
    let mut header = [0u8; HEADER_LEN];
    header.copy_from_slice(&buf[..HEADER_LEN]);
    let (_flags, len) = parse_frame_header(&header)?;
    let total = HEADER_LEN + len as usize;
    if buf.len() < total {
        return Ok(None);
    }
    let body: Vec<u8> = buf.drain(..total).skip(HEADER_LEN).collect();
    decode_body(&body).map(Some)
}

/// Decode a frame body into a typed envelope, distinguishing a message
/// type this build doesn't know (drop and continue) from a known type
/// with a bad body.
pub fn decode_body(body: &[u8]) -> Result<Envelope, WireError> {
    match serde_json::from_slice::<Envelope>(body) {
        Ok(env) => Ok(env),
        Err(e) => {
            // Tell unknown-type apart from malformed by peeking at the tag.
            if let Ok(v) = serde_json::from_slice::<serde_json::Value>(body) {
                if let Some(tag) = v.get("type").and_then(|t| t.as_str()) {
                    if !Payload::is_known_type(tag) {
                        return Err(WireError::UnknownType(tag.to_string()));
                    }
                }
            }
            Err(WireError::Malformed(e.to_string()))
        }
    }
}

/// Write one framed envelope with a size-scaled deadline.
pub async fn write_frame<W>(stream: &mut W, env: &Envelope) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let bytes = encode_frame(env);
    let ms = protocol::timeouts::write_deadline_ms(bytes.len());
    match timeout(Duration::from_millis(ms), stream.write_all(&bytes)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e.into()),
        Err(_) => anyhow::bail!("frame write timeout ({} ms)", ms),
    }
}

/// Incremental reader over an async stream: reads into an accumulation
/// buffer and yields complete frames.
pub struct FrameReader {
    buf: Vec<u8>,
    chunk: [u8; 8192],
}

impl Default for FrameReader {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameReader {
    pub fn new() -> Self {
        Self {
            buf: Vec::with_capacity(16 * 1024),
            chunk: [0u8; 8192],
        }
    }

    /// Next decoded frame. `Ok(None)` means clean EOF. Frame-level errors
    /// (malformed / unknown type) surface as `Err(WireError)` wrapped in
    /// anyhow so the caller can decide to drop or reset via
    /// [`WireError::is_corruption`].
    pub async fn next_frame<R>(&mut self, stream: &mut R) -> anyhow::Result<Option<Envelope>>
    where
        R: AsyncRead + Unpin,
    {
        loop {
            match try_decode_frame(&mut self.buf) {
                Ok(Some(env)) => return Ok(Some(env)),
                Ok(None) => {}
                Err(e) => return Err(e.into()),
            }
            let n = stream.read(&mut self.chunk).await?;
            if n == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                anyhow::bail!("connection closed mid-frame");
            }
            self.buf.extend_from_slice(&self.chunk[..n]);
        }
    }
}

/// serde adapter: Vec<u8> as a base64 string inside JSON bodies.
pub mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{FileChunkMsg, PairingRequestMsg, SignalKind};

    fn sample_envelope() -> Envelope {
        Envelope::new(
            "a",
            "b",
            Payload::PairingRequest(PairingRequestMsg {
                request_id: "req-1".into(),
                display_name: "Device A".into(),
                platform: "linux".into(),
                trust_user: true,
                save_connection: false,
            }),
        )
    }

    #[test]
    fn round_trip_framing() {
        let cases = vec![
            sample_envelope(),
            Envelope::new(
                "a",
                "b",
                Payload::FileChunk(FileChunkMsg {
                    task_id: "t1".into(),
                    offset: 4096,
                    data: vec![0u8, 1, 2, 255, 254],
                }),
            ),
            Envelope::new(
                "x",
                "y",
                Payload::ScreenSharingSignal(crate::protocol::ScreenSharingSignalMsg {
                    session_id: "s1".into(),
                    kind: SignalKind::Offer,
                    blob: serde_json::json!({"sdp": "v=0\r\n..."}),
                }),
            ),
        ];
        for env in cases {
            let mut buf = encode_frame(&env);
            let decoded = try_decode_frame(&mut buf).unwrap().unwrap();
            assert_eq!(decoded, env);
            assert!(buf.is_empty());
        }
    }

    #[test]
    fn partial_reads_need_more_bytes() {
        let frame = encode_frame(&sample_envelope());
        // Feed the frame one byte at a time; only the last byte completes it
        let mut buf = Vec::new();
        for (i, b) in frame.iter().enumerate() {
            buf.push(*b);
            let res = try_decode_frame(&mut buf).unwrap();
            if i + 1 < frame.len() {
                assert!(res.is_none(), "frame completed early at byte {}", i);
            } else {
                assert_eq!(res.unwrap(), sample_envelope());
            }
        }
    }

    #[test]
    fn two_frames_in_one_buffer_drain_in_order() {
        let e1 = sample_envelope();
        let e2 = Envelope::new(
            "b",
            "a",
            Payload::FileChunkAck(crate::protocol::FileChunkAckMsg {
                task_id: "t1".into(),
                received: 1024,
            }),
        );
        let mut buf = encode_frame(&e1);
        buf.extend_from_slice(&encode_frame(&e2));
        assert_eq!(try_decode_frame(&mut buf).unwrap().unwrap(), e1);
        assert_eq!(try_decode_frame(&mut buf).unwrap().unwrap(), e2);
        assert!(try_decode_frame(&mut buf).unwrap().is_none());
    }

    #[test]
    fn bad_magic_is_corruption() {
        let mut buf = encode_frame(&sample_envelope());
        buf[0] = b'X';
        let err = try_decode_frame(&mut buf).unwrap_err();
        assert!(matches!(err, WireError::BadMagic));
        assert!(err.is_corruption());
    }

    #[test]
    fn version_mismatch_is_corruption() {
        let mut buf = encode_frame(&sample_envelope());
        buf[4..6].copy_from_slice(&999u16.to_le_bytes());
        let err = try_decode_frame(&mut buf).unwrap_err();
        assert!(matches!(err, WireError::VersionMismatch(999)));
        assert!(err.is_corruption());
    }

    #[test]
    fn oversized_length_is_corruption() {
        let header = build_frame_header(0, (MAX_FRAME_SIZE + 1) as u32);
        let mut buf = header.to_vec();
        let err = try_decode_frame(&mut buf).unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn unknown_type_is_dropped_not_reset() {
        let body = serde_json::json!({
            "type": "clipboard-sync",
            "fromUserId": "a",
            "toUserId": "b",
            "data": {}
        });
        let body = serde_json::to_vec(&body).unwrap();
        let mut buf = build_frame_header(0, body.len() as u32).to_vec();
        buf.extend_from_slice(&body);
        let err = try_decode_frame(&mut buf).unwrap_err();
        assert!(matches!(err, WireError::UnknownType(ref t) if t == "clipboard-sync"));
        assert!(!err.is_corruption());
        // the bad frame was consumed; stream stays usable
        assert!(buf.is_empty());
    }

    #[test]
    fn malformed_known_type_keeps_connection() {
        let body = serde_json::json!({
            "type": "pairing-request",
            "fromUserId": "a",
            "toUserId": "b",
            "data": { "requestId": 42 } // wrong field types
        });
        let body = serde_json::to_vec(&body).unwrap();
        let mut buf = build_frame_header(0, body.len() as u32).to_vec();
        buf.extend_from_slice(&body);
        let err = try_decode_frame(&mut buf).unwrap_err();
        assert!(matches!(err, WireError::Malformed(_)));
        assert!(!err.is_corruption());
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn frame_reader_handles_split_frames() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let env = sample_envelope();
        let bytes = encode_frame(&env);
        let (left, right) = bytes.split_at(bytes.len() / 2);
        let (l, r) = (left.to_vec(), right.to_vec());

        let writer = tokio::spawn(async move {
            client.write_all(&l).await.unwrap();
            tokio::time::sleep(Duration::from_millis(10)).await;
            client.write_all(&r).await.unwrap();
            client.shutdown().await.unwrap();
        });

        let mut reader = FrameReader::new();
        let got = reader.next_frame(&mut server).await.unwrap().unwrap();
        assert_eq!(got, env);
        assert!(reader.next_frame(&mut server).await.unwrap().is_none());
        writer.await.unwrap();
    }
}
