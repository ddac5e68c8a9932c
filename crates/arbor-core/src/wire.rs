//! arbor wire format: every datagram exchanged between peers.
//!
//! A datagram is a fixed 7-byte header, `length` bytes of body, and an
//! optional 64-byte signature trailer. All integers are big-endian.
//!
//! ```text
//!   0      4    5        7            7+length        7+length+64
//!   | id   |type| length | body ...   | signature (opt) |
//! ```
//!
//! The header is a `#[repr(C, packed)]` zerocopy struct; bodies are
//! parsed by hand because their layout depends on the message type.

use bytes::{BufMut, Bytes, BytesMut};
use static_assertions::assert_eq_size;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::crypto::{Hash, Keypair, SIGNATURE_LEN};

// ── Header ────────────────────────────────────────────────────────────────────

/// The fixed prefix of every datagram.
///
/// Wire size: 7 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct MessageHeader {
    /// Correlation id, chosen fresh by the requester and echoed by the reply.
    pub id: [u8; 4],
    /// Message type byte, see `MessageType`.
    pub kind: u8,
    /// Body length in bytes, not including header or signature.
    pub length: [u8; 2],
}

assert_eq_size!(MessageHeader, [u8; 7]);

/// Size of `MessageHeader` on the wire.
pub const HEADER_LEN: usize = 7;

/// Largest body a 16-bit length can describe.
pub const MAX_BODY: usize = u16::MAX as usize;

/// Largest datagram the protocol can produce.
pub const MAX_DATAGRAM: usize = HEADER_LEN + MAX_BODY + SIGNATURE_LEN;

/// Width of a hash on the wire.
pub const HASH_LEN: usize = 32;

/// Width of a padded name inside directory entries and hash preimages.
pub const NAME_LEN: usize = 32;

// ── Message types ─────────────────────────────────────────────────────────────

/// Message type byte.
///
/// Requests are below 128, replies are 128 and up. NatTraversal types are
/// reserved: they decode but are never acted upon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    NoOp = 0,
    Error = 1,
    Hello = 2,
    PublicKey = 3,
    Root = 4,
    GetDatum = 5,
    NatTraversalRequest = 6,
    NatTraversal = 7,
    ErrorReply = 128,
    HelloReply = 129,
    PublicKeyReply = 130,
    RootReply = 131,
    Datum = 132,
    NoDatum = 133,
}

impl MessageType {
    /// Whether this type answers a request and should be routed to a
    /// waiting correlation slot.
    pub fn is_reply(self) -> bool {
        (self as u8) >= 128
    }
}

impl TryFrom<u8> for MessageType {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, WireError> {
        Ok(match value {
            0 => MessageType::NoOp,
            1 => MessageType::Error,
            2 => MessageType::Hello,
            3 => MessageType::PublicKey,
            4 => MessageType::Root,
            5 => MessageType::GetDatum,
            6 => MessageType::NatTraversalRequest,
            7 => MessageType::NatTraversal,
            128 => MessageType::ErrorReply,
            129 => MessageType::HelloReply,
            130 => MessageType::PublicKeyReply,
            131 => MessageType::RootReply,
            132 => MessageType::Datum,
            133 => MessageType::NoDatum,
            other => return Err(WireError::UnknownType(other)),
        })
    }
}

impl From<MessageType> for u8 {
    fn from(t: MessageType) -> u8 {
        t as u8
    }
}

// ── Message ───────────────────────────────────────────────────────────────────

/// One decoded datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: u32,
    pub kind: MessageType,
    pub body: Bytes,
    pub signature: Option<[u8; SIGNATURE_LEN]>,
}

impl Message {
    /// An unsigned message. The length field is derived from `body`.
    pub fn new(id: u32, kind: MessageType, body: impl Into<Bytes>) -> Self {
        Self {
            id,
            kind,
            body: body.into(),
            signature: None,
        }
    }

    /// The header and body bytes, i.e. exactly what a signature covers.
    pub fn signed_bytes(&self) -> Result<Vec<u8>, WireError> {
        if self.body.len() > MAX_BODY {
            return Err(WireError::BodyTooLarge(self.body.len()));
        }
        let header = MessageHeader {
            id: self.id.to_be_bytes(),
            kind: self.kind.into(),
            length: (self.body.len() as u16).to_be_bytes(),
        };
        let mut out = Vec::with_capacity(HEADER_LEN + self.body.len() + SIGNATURE_LEN);
        out.extend_from_slice(header.as_bytes());
        out.extend_from_slice(&self.body);
        Ok(out)
    }

    /// Attach a signature over `signed_bytes` made with `keypair`.
    pub fn sign(&mut self, keypair: &Keypair) -> Result<(), WireError> {
        let data = self.signed_bytes()?;
        self.signature = Some(keypair.sign(&data));
        Ok(())
    }

    /// Serialize to a datagram, appending the signature trailer if present.
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        let mut out = self.signed_bytes()?;
        if let Some(sig) = &self.signature {
            out.extend_from_slice(sig);
        }
        Ok(out)
    }

    /// Parse one datagram.
    ///
    /// Trailing bytes after the body are the signature: fewer than 64 is a
    /// framing error, more than 64 are ignored past the first 64.
    pub fn decode(datagram: &[u8]) -> Result<Self, WireError> {
        let header =
            MessageHeader::read_from_prefix(datagram).ok_or(WireError::Truncated(datagram.len()))?;
        let id = u32::from_be_bytes(header.id);
        let kind = MessageType::try_from(header.kind)?;
        let length = u16::from_be_bytes(header.length) as usize;

        let rest = &datagram[HEADER_LEN..];
        if rest.len() < length {
            return Err(WireError::BodyShort {
                declared: length,
                actual: rest.len(),
            });
        }
        let body = Bytes::copy_from_slice(&rest[..length]);

        let trailer = &rest[length..];
        let signature = match trailer.len() {
            0 => None,
            n if n < SIGNATURE_LEN => return Err(WireError::BadSignatureLength(n)),
            _ => {
                let mut sig = [0u8; SIGNATURE_LEN];
                sig.copy_from_slice(&trailer[..SIGNATURE_LEN]);
                Some(sig)
            }
        };

        Ok(Self {
            id,
            kind,
            body,
            signature,
        })
    }
}

// ── Hello body ────────────────────────────────────────────────────────────────

/// Body of Hello and HelloReply: 4-byte extensions ‖ name (rest of body).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelloBody {
    pub extensions: u32,
    pub name: String,
}

impl HelloBody {
    pub fn encode(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(4 + self.name.len());
        out.put_u32(self.extensions);
        out.put_slice(self.name.as_bytes());
        out.freeze()
    }

    /// Names that are not valid UTF-8 are decoded lossily; the name is only
    /// ever displayed, never hashed.
    pub fn decode(body: &[u8]) -> Result<Self, WireError> {
        if body.len() < 4 {
            return Err(WireError::HelloTooShort(body.len()));
        }
        let extensions = u32::from_be_bytes([body[0], body[1], body[2], body[3]]);
        let name = String::from_utf8_lossy(&body[4..]).into_owned();
        Ok(Self { extensions, name })
    }
}

// ── Datum body ────────────────────────────────────────────────────────────────

/// Tag byte introducing a chunk's raw data.
pub const TAG_CHUNK: u8 = 0;
/// Tag byte introducing a bigfile's child hashes.
pub const TAG_BIGFILE: u8 = 1;
/// Tag byte introducing a directory's (name, hash) entries.
pub const TAG_DIRECTORY: u8 = 2;

/// Decoded value of a Datum: the content of one tree node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatumValue {
    /// Raw chunk bytes.
    Chunk(Bytes),
    /// Ordered child hashes of a bigfile.
    Bigfile(Vec<Hash>),
    /// Ordered (padded name, hash) entries of a directory.
    Directory(Vec<([u8; NAME_LEN], Hash)>),
}

impl DatumValue {
    /// Serialize as tag ‖ payload. The SHA-256 of this is the node's hash.
    pub fn encode(&self) -> Bytes {
        match self {
            DatumValue::Chunk(data) => {
                let mut out = BytesMut::with_capacity(1 + data.len());
                out.put_u8(TAG_CHUNK);
                out.put_slice(data);
                out.freeze()
            }
            DatumValue::Bigfile(children) => {
                let mut out = BytesMut::with_capacity(1 + children.len() * HASH_LEN);
                out.put_u8(TAG_BIGFILE);
                for h in children {
                    out.put_slice(h);
                }
                out.freeze()
            }
            DatumValue::Directory(entries) => {
                let mut out = BytesMut::with_capacity(1 + entries.len() * (NAME_LEN + HASH_LEN));
                out.put_u8(TAG_DIRECTORY);
                for (name, h) in entries {
                    out.put_slice(name);
                    out.put_slice(h);
                }
                out.freeze()
            }
        }
    }

    /// Parse tag ‖ payload.
    pub fn decode(value: &[u8]) -> Result<Self, WireError> {
        let (&tag, payload) = value.split_first().ok_or(WireError::EmptyDatum)?;
        match tag {
            TAG_CHUNK => Ok(DatumValue::Chunk(Bytes::copy_from_slice(payload))),
            TAG_BIGFILE => {
                if payload.len() % HASH_LEN != 0 {
                    return Err(WireError::RaggedDatum { tag, len: payload.len() });
                }
                let children = payload
                    .chunks_exact(HASH_LEN)
                    .map(|c| {
                        let mut h = [0u8; HASH_LEN];
                        h.copy_from_slice(c);
                        h
                    })
                    .collect();
                Ok(DatumValue::Bigfile(children))
            }
            TAG_DIRECTORY => {
                let entry = NAME_LEN + HASH_LEN;
                if payload.len() % entry != 0 {
                    return Err(WireError::RaggedDatum { tag, len: payload.len() });
                }
                let entries = payload
                    .chunks_exact(entry)
                    .map(|c| {
                        let mut name = [0u8; NAME_LEN];
                        let mut h = [0u8; HASH_LEN];
                        name.copy_from_slice(&c[..NAME_LEN]);
                        h.copy_from_slice(&c[NAME_LEN..]);
                        (name, h)
                    })
                    .collect();
                Ok(DatumValue::Directory(entries))
            }
            other => Err(WireError::UnknownDatumTag(other)),
        }
    }
}

/// Body of Datum: 32-byte hash ‖ value (tag ‖ payload).
///
/// `value` is kept raw so the hash check runs over exactly the bytes the
/// peer sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatumBody {
    pub hash: Hash,
    pub value: Bytes,
}

impl DatumBody {
    pub fn encode(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(HASH_LEN + self.value.len());
        out.put_slice(&self.hash);
        out.put_slice(&self.value);
        out.freeze()
    }

    pub fn decode(body: &Bytes) -> Result<Self, WireError> {
        if body.len() <= HASH_LEN {
            return Err(WireError::DatumTooShort(body.len()));
        }
        let mut hash = [0u8; HASH_LEN];
        hash.copy_from_slice(&body[..HASH_LEN]);
        Ok(Self {
            hash,
            value: body.slice(HASH_LEN..),
        })
    }

    /// Whether `SHA256(value) == hash`.
    pub fn is_consistent(&self) -> bool {
        crate::crypto::hash(&self.value) == self.hash
    }

    pub fn parse_value(&self) -> Result<DatumValue, WireError> {
        DatumValue::decode(&self.value)
    }
}

/// Read a 32-byte hash body (Root, RootReply, GetDatum).
pub fn hash_body(body: &[u8]) -> Result<Hash, WireError> {
    if body.len() != HASH_LEN {
        return Err(WireError::BadHashBody(body.len()));
    }
    let mut h = [0u8; HASH_LEN];
    h.copy_from_slice(body);
    Ok(h)
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise when interpreting wire-format data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("datagram of {0} bytes is shorter than the header")]
    Truncated(usize),

    #[error("unknown message type: {0}")]
    UnknownType(u8),

    #[error("body declares {declared} bytes but only {actual} present")]
    BodyShort { declared: usize, actual: usize },

    #[error("body of {0} bytes exceeds maximum {}", MAX_BODY)]
    BodyTooLarge(usize),

    #[error("signature trailer of {0} bytes (need {})", SIGNATURE_LEN)]
    BadSignatureLength(usize),

    #[error("hello body of {0} bytes is too short")]
    HelloTooShort(usize),

    #[error("datum body of {0} bytes has no value")]
    DatumTooShort(usize),

    #[error("datum value is empty")]
    EmptyDatum,

    #[error("unknown datum tag: {0}")]
    UnknownDatumTag(u8),

    #[error("datum with tag {tag} has ragged payload of {len} bytes")]
    RaggedDatum { tag: u8, len: usize },

    #[error("expected a 32-byte hash body, got {0} bytes")]
    BadHashBody(usize),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
