//! In-band framing for the tunnel websocket.
//!
//! Each websocket message carries exactly one frame:
//!
//! ```text
//! +------------------+--------+-----------------------+
//! | varint conn id   | u8 ty  | payload (rest of msg) |
//! +------------------+--------+-----------------------+
//! ```
//!
//! `CONNECT` payloads are `proto/address`; `ERROR` payloads are a reason string, where `EOF` denotes a
//! graceful close; `ADD_CLIENT`/`REMOVE_CLIENT` payloads are client keys and are only valid on the
//! control id.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::{fmt, str::FromStr};

/// Identifies the session control stream.
pub const CONTROL_ID: u64 = 1;

/// The reason carried by an `ERROR` frame that closes a stream gracefully.
pub const EOF: &str = "EOF";

const MAX_VARINT_LEN: usize = 10;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Kind {
    Connect = 1,
    Data = 2,
    Error = 3,
    AddClient = 4,
    RemoveClient = 5,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub id: u64,
    pub kind: Kind,
    pub payload: Bytes,
}

/// The target of a `CONNECT`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Destination {
    pub proto: String,
    pub address: String,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame is truncated")]
    Truncated,

    #[error("connection id varint overflows 64 bits")]
    VarintOverflow,

    #[error("invalid connection id {id} for {kind:?} frame")]
    InvalidId { id: u64, kind: Kind },

    #[error("unknown frame type {0}")]
    UnknownKind(u8),

    #[error("{0:?} payload is not valid UTF-8")]
    NotUtf8(Kind),

    #[error("invalid connect destination: {0:?}")]
    InvalidDestination(String),
}

// === impl Kind ===

impl Kind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::Data => "data",
            Self::Error => "error",
            Self::AddClient => "add_client",
            Self::RemoveClient => "remove_client",
        }
    }

    fn is_control(&self) -> bool {
        matches!(self, Self::AddClient | Self::RemoveClient)
    }

    fn has_text_payload(&self) -> bool {
        !matches!(self, Self::Data)
    }
}

impl TryFrom<u8> for Kind {
    type Error = FrameError;

    fn try_from(b: u8) -> Result<Self, FrameError> {
        match b {
            1 => Ok(Self::Connect),
            2 => Ok(Self::Data),
            3 => Ok(Self::Error),
            4 => Ok(Self::AddClient),
            5 => Ok(Self::RemoveClient),
            b => Err(FrameError::UnknownKind(b)),
        }
    }
}

// === impl Frame ===

impl Frame {
    pub fn connect(id: u64, dst: &Destination) -> Self {
        Self::text(id, Kind::Connect, &dst.to_string())
    }

    pub fn data(id: u64, payload: Bytes) -> Self {
        Self {
            id,
            kind: Kind::Data,
            payload,
        }
    }

    pub fn error(id: u64, reason: &str) -> Self {
        Self::text(id, Kind::Error, reason)
    }

    pub fn eof(id: u64) -> Self {
        Self::error(id, EOF)
    }

    pub fn add_client(key: &str) -> Self {
        Self::text(CONTROL_ID, Kind::AddClient, key)
    }

    pub fn remove_client(key: &str) -> Self {
        Self::text(CONTROL_ID, Kind::RemoveClient, key)
    }

    fn text(id: u64, kind: Kind, s: &str) -> Self {
        Self {
            id,
            kind,
            payload: Bytes::copy_from_slice(s.as_bytes()),
        }
    }

    /// Returns the payload as a string.
    ///
    /// Decoding validates text payloads, so this only returns `None` for `DATA` frames carrying
    /// arbitrary bytes.
    pub fn text_payload(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }

    pub fn is_eof(&self) -> bool {
        self.kind == Kind::Error && &self.payload[..] == EOF.as_bytes()
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(MAX_VARINT_LEN + 1 + self.payload.len());
        put_uvarint(&mut buf, self.id);
        buf.put_u8(self.kind as u8);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    pub fn decode(mut buf: Bytes) -> Result<Self, FrameError> {
        let id = get_uvarint(&mut buf)?;
        if !buf.has_remaining() {
            return Err(FrameError::Truncated);
        }
        let kind = Kind::try_from(buf.get_u8())?;

        let valid_id = if kind.is_control() {
            id == CONTROL_ID
        } else {
            id > CONTROL_ID
        };
        if !valid_id {
            return Err(FrameError::InvalidId { id, kind });
        }

        if kind.has_text_payload() {
            let text = std::str::from_utf8(&buf).map_err(|_| FrameError::NotUtf8(kind))?;
            if kind == Kind::Connect {
                text.parse::<Destination>()?;
            }
        }

        Ok(Self {
            id,
            kind,
            payload: buf,
        })
    }
}

fn put_uvarint(buf: &mut BytesMut, mut v: u64) {
    while v >= 0x80 {
        buf.put_u8((v as u8) | 0x80);
        v >>= 7;
    }
    buf.put_u8(v as u8);
}

fn get_uvarint(buf: &mut Bytes) -> Result<u64, FrameError> {
    let mut v = 0u64;
    for i in 0..MAX_VARINT_LEN {
        if !buf.has_remaining() {
            return Err(FrameError::Truncated);
        }
        let b = buf.get_u8();
        // The tenth byte may only contribute the final bit.
        if i == MAX_VARINT_LEN - 1 && b > 1 {
            return Err(FrameError::VarintOverflow);
        }
        v |= u64::from(b & 0x7f) << (7 * i);
        if b < 0x80 {
            return Ok(v);
        }
    }
    Err(FrameError::VarintOverflow)
}

// === impl Destination ===

impl Destination {
    pub fn new(proto: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            proto: proto.into(),
            address: address.into(),
        }
    }
}

impl FromStr for Destination {
    type Err = FrameError;

    fn from_str(s: &str) -> Result<Self, FrameError> {
        match s.split_once('/') {
            Some((proto, address)) if !proto.is_empty() && !address.is_empty() => {
                Ok(Self::new(proto, address))
            }
            _ => Err(FrameError::InvalidDestination(s.to_string())),
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.proto, self.address)
    }
}
