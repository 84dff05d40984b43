//! Wire framing: envelopes, signals, and peer identities.
//!
//! One logical protocol message occupies one datagram, laid out as an
//! ordered sequence of length-prefixed frames:
//!
//! ```text
//! ┌──────────┬───────────────┐
//! │ Len (4)  │ Frame bytes   │   repeated per frame, little-endian length
//! └──────────┴───────────────┘
//! ```
//!
//! Two message shapes exist on the wire:
//!
//! - **Signal**: a single frame holding exactly the ASCII literal `READY`
//!   or `HEARTBEAT`. No identity, no correlation id, no payload.
//! - **Request/reply**: four frames `[identity] [command] [id: 4 bytes] [payload]`.
//!   A reply is wire-identical in shape to a request; the receiving peer
//!   distinguishes replies purely by correlation-id lookup.
//!
//! Correlation ids are assigned by the sender of a request from a monotonic
//! counter and must be unique among that sender's in-flight requests.
//! Building a reply preserves the request's id and origin verbatim so the
//! original sender can correlate it.

use std::fmt;

use thiserror::Error;

/// Maximum encoded size of one message (UDP datagram payload limit).
pub const MAX_MESSAGE_SIZE: usize = 65_507;

/// Wire literal announcing worker readiness.
const READY: &[u8] = b"READY";
/// Wire literal for liveness keepalives.
const HEARTBEAT: &[u8] = b"HEARTBEAT";

/// Opaque transport identity of a peer.
///
/// Assigned at socket creation (or derived from a configured name) and used
/// by the broker to route replies back to the originating worker. Never
/// interpreted as text beyond logging.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct WorkerId(Vec<u8>);

impl WorkerId {
    /// The empty identity: as a request destination it means "any worker".
    #[must_use]
    pub const fn any() -> Self {
        Self(Vec::new())
    }

    /// Generates a fresh identity from the process id and a random nonce.
    ///
    /// Uniqueness holds even when a process reconnects or pids are reused.
    #[must_use]
    pub fn generate() -> Self {
        let pid = std::process::id();
        let nonce: u32 = rand::random();
        let mut bytes = Vec::with_capacity(8);
        bytes.extend_from_slice(&pid.to_le_bytes());
        bytes.extend_from_slice(&nonce.to_le_bytes());
        Self(bytes)
    }

    /// Returns true for the empty (broadcast) identity.
    #[must_use]
    pub fn is_any(&self) -> bool {
        self.0.is_empty()
    }

    /// Raw identity bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<Vec<u8>> for WorkerId {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl From<&[u8]> for WorkerId {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }
}

impl From<&str> for WorkerId {
    fn from(name: &str) -> Self {
        Self(name.as_bytes().to_vec())
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return write!(f, "*");
        }
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// 32-bit value tying a reply to the request that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(u32);

impl RequestId {
    /// Raw value for wire serialization.
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl From<u32> for RequestId {
    fn from(v: u32) -> Self {
        Self(v)
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

/// A liveness-only message carrying no id/command/payload semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Announces a worker to the broker after (re)connecting.
    Ready,
    /// Periodic keepalive in both directions.
    Heartbeat,
}

impl Signal {
    const fn as_bytes(self) -> &'static [u8] {
        match self {
            Self::Ready => READY,
            Self::Heartbeat => HEARTBEAT,
        }
    }

    fn from_bytes(bytes: &[u8]) -> Option<Self> {
        match bytes {
            READY => Some(Self::Ready),
            HEARTBEAT => Some(Self::Heartbeat),
            _ => None,
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ready => write!(f, "READY"),
            Self::Heartbeat => write!(f, "HEARTBEAT"),
        }
    }
}

/// A correlated request or reply.
///
/// On an outbound request `origin` names the destination worker (empty =
/// any); on an inbound message it names the peer a reply must be routed
/// back to. The broker rewrites this slot while routing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Destination on the way out, origin on the way in.
    pub origin: WorkerId,
    /// Command name, looked up in a dispatch table.
    pub command: String,
    /// Correlation id assigned by the request's sender.
    pub id: RequestId,
    /// Opaque payload; the protocol core never inspects it.
    pub payload: Vec<u8>,
}

impl Envelope {
    /// Builds a new request envelope.
    #[must_use]
    pub fn request(
        dest: WorkerId,
        command: impl Into<String>,
        id: RequestId,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            origin: dest,
            command: command.into(),
            id,
            payload,
        }
    }

    /// Builds the reply to this envelope, echoing its id and origin
    /// verbatim so the original sender's tracker can correlate it.
    #[must_use]
    pub fn reply_to(&self, payload: Vec<u8>) -> Self {
        Self {
            origin: self.origin.clone(),
            command: self.command.clone(),
            id: self.id,
            payload,
        }
    }
}

/// One decoded wire unit: request, reply, or signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Liveness frame.
    Signal(Signal),
    /// Correlated request or reply.
    Envelope(Envelope),
}

/// Errors during message encode/decode.
#[derive(Debug, Error)]
pub enum WireError {
    /// Buffer ended inside a frame.
    #[error("truncated message: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },
    /// Encoded message would exceed the datagram limit.
    #[error("message too large: {len} bytes exceeds {max}")]
    TooLarge { len: usize, max: usize },
    /// Correlation-id frame is not exactly 4 bytes.
    #[error("invalid id frame length: {len}")]
    BadId { len: usize },
    /// Command frame is not valid UTF-8.
    #[error("command is not valid UTF-8")]
    BadCommand(#[from] std::str::Utf8Error),
    /// Single-frame message with an unrecognized literal.
    #[error("unknown signal literal")]
    UnknownSignal,
    /// Message has neither the signal nor the request/reply frame count.
    #[error("unexpected frame count: {0}")]
    FrameCount(usize),
}

/// Writer for encoding length-prefixed frames.
struct FrameWriter<'a> {
    buf: &'a mut Vec<u8>,
}

impl<'a> FrameWriter<'a> {
    fn new(buf: &'a mut Vec<u8>) -> Self {
        buf.clear();
        Self { buf }
    }

    fn put_frame(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
        self.buf.extend_from_slice(bytes);
    }
}

/// Reader for decoding length-prefixed frames.
struct FrameReader<'a> {
    buf: &'a [u8],
    cursor: usize,
}

impl<'a> FrameReader<'a> {
    const fn new(buf: &'a [u8]) -> Self {
        Self { buf, cursor: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.cursor
    }

    fn take_frame(&mut self) -> Result<&'a [u8], WireError> {
        if self.remaining() < 4 {
            return Err(WireError::Truncated {
                need: 4,
                have: self.remaining(),
            });
        }
        let mut arr = [0u8; 4];
        arr.copy_from_slice(&self.buf[self.cursor..self.cursor + 4]);
        self.cursor += 4;
        let len = u32::from_le_bytes(arr) as usize;
        if self.remaining() < len {
            return Err(WireError::Truncated {
                need: len,
                have: self.remaining(),
            });
        }
        let frame = &self.buf[self.cursor..self.cursor + len];
        self.cursor += len;
        Ok(frame)
    }
}

/// Encode a message into the buffer.
///
/// The buffer is cleared and reused (preserves capacity).
pub fn encode(msg: &Message, buf: &mut Vec<u8>) -> Result<(), WireError> {
    let mut w = FrameWriter::new(buf);

    match msg {
        Message::Signal(signal) => {
            w.put_frame(signal.as_bytes());
        }
        Message::Envelope(env) => {
            w.put_frame(env.origin.as_bytes());
            w.put_frame(env.command.as_bytes());
            w.put_frame(&env.id.as_u32().to_le_bytes());
            w.put_frame(&env.payload);
        }
    }

    if buf.len() > MAX_MESSAGE_SIZE {
        return Err(WireError::TooLarge {
            len: buf.len(),
            max: MAX_MESSAGE_SIZE,
        });
    }
    Ok(())
}

/// Decode a message from one datagram's bytes.
pub fn decode(bytes: &[u8]) -> Result<Message, WireError> {
    let mut r = FrameReader::new(bytes);

    let mut frames: Vec<&[u8]> = Vec::with_capacity(4);
    while r.remaining() > 0 {
        frames.push(r.take_frame()?);
    }

    match frames.as_slice() {
        [literal] => Signal::from_bytes(literal)
            .map(Message::Signal)
            .ok_or(WireError::UnknownSignal),
        [identity, command, id, payload] => {
            if id.len() != 4 {
                return Err(WireError::BadId { len: id.len() });
            }
            let mut arr = [0u8; 4];
            arr.copy_from_slice(id);
            Ok(Message::Envelope(Envelope {
                origin: WorkerId::from(*identity),
                command: std::str::from_utf8(command)?.to_owned(),
                id: RequestId::from(u32::from_le_bytes(arr)),
                payload: payload.to_vec(),
            }))
        }
        other => Err(WireError::FrameCount(other.len())),
    }
}

/// Prefixes a reply body with its u32 status code.
///
/// Command handlers conventionally lead a reply payload with 4 status bytes;
/// the protocol core never interprets them.
#[must_use]
pub fn write_status(code: u32, body: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(4 + body.len());
    payload.extend_from_slice(&code.to_le_bytes());
    payload.extend_from_slice(body);
    payload
}

/// Splits a reply payload into its status code and body.
pub fn read_status(payload: &[u8]) -> Result<(u32, &[u8]), WireError> {
    if payload.len() < 4 {
        return Err(WireError::Truncated {
            need: 4,
            have: payload.len(),
        });
    }
    let mut arr = [0u8; 4];
    arr.copy_from_slice(&payload[..4]);
    Ok((u32::from_le_bytes(arr), &payload[4..]))
}
