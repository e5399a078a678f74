//! # Wire Protocol Messages
//!
//! Every datagram is one [`Envelope`]:
//!
//! ```text
//! [u32 message id][u8 type tag][sender identifier][type-specific payload]
//! ```
//!
//! All integers are big-endian. Variable-length fields (strings, identifiers,
//! IP octets) carry a `u32` length prefix; lists carry a `u32` count.
//!
//! | Tag | Message | Payload |
//! |-----|---------|---------|
//! | `0x01` | `Connect` | (none) |
//! | `0x02` | `FetchValue` | key |
//! | `0x03` | `NodeLookup` | target id |
//! | `0x04` | `RemoveValue` | key, value |
//! | `0x05` | `StoreValue` | key, value |
//! | `0x81` | `ConnectResponse` | (none) |
//! | `0x82` | `FetchValueResponse` | key, values, closer peers |
//! | `0x83` | `NodeLookupResponse` | peers |
//! | `0x84` | `RemoveValueResponse` | key, success flag |
//! | `0x85` | `StoreValueResponse` | key, success flag |
//! | `0xFF` | `Error` | message |
//!
//! The high bit of the tag marks a response. Decoding never reads past the
//! buffer: every length prefix is checked against the remaining bytes, and
//! trailing garbage is rejected.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::identity::{ID_LEN, Identifier, NodeId};
use crate::peer::Peer;

/// Largest UDP payload we will emit or accept.
pub const MAX_DATAGRAM_SIZE: usize = 65_507;

/// Smallest encoded peer: identifier (4+20+4+20) + IPv4 (4+4) + port (2).
const MIN_PEER_SIZE: usize = 4 + ID_LEN + 4 + ID_LEN + 4 + 4 + 2;

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// A field needs more bytes than remain in the buffer.
    Truncated { needed: usize, remaining: usize },
    /// The type tag is not one we know.
    UnknownType(u8),
    /// A fixed-size field had the wrong length prefix.
    InvalidLength { field: &'static str, len: usize },
    /// A boolean byte other than 0 or 1.
    InvalidBool(u8),
    /// A string was not UTF-8.
    InvalidUtf8,
    /// Bytes left over after the payload.
    TrailingBytes(usize),
    /// The encoded message does not fit in one datagram.
    Oversize(usize),
}

impl std::fmt::Display for WireError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WireError::Truncated { needed, remaining } => {
                write!(f, "truncated: need {} bytes, {} remaining", needed, remaining)
            }
            WireError::UnknownType(tag) => write!(f, "unknown message type 0x{:02x}", tag),
            WireError::InvalidLength { field, len } => {
                write!(f, "invalid length {} for {}", len, field)
            }
            WireError::InvalidBool(b) => write!(f, "invalid boolean byte {}", b),
            WireError::InvalidUtf8 => write!(f, "string is not valid utf-8"),
            WireError::TrailingBytes(n) => write!(f, "{} trailing bytes after payload", n),
            WireError::Oversize(n) => {
                write!(f, "encoded message is {} bytes, limit is {}", n, MAX_DATAGRAM_SIZE)
            }
        }
    }
}

impl std::error::Error for WireError {}

// ============================================================================
// Message Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Connect = 0x01,
    FetchValue = 0x02,
    NodeLookup = 0x03,
    RemoveValue = 0x04,
    StoreValue = 0x05,
    ConnectResponse = 0x81,
    FetchValueResponse = 0x82,
    NodeLookupResponse = 0x83,
    RemoveValueResponse = 0x84,
    StoreValueResponse = 0x85,
    Error = 0xFF,
}

impl MessageType {
    pub fn from_tag(tag: u8) -> Option<Self> {
        Some(match tag {
            0x01 => MessageType::Connect,
            0x02 => MessageType::FetchValue,
            0x03 => MessageType::NodeLookup,
            0x04 => MessageType::RemoveValue,
            0x05 => MessageType::StoreValue,
            0x81 => MessageType::ConnectResponse,
            0x82 => MessageType::FetchValueResponse,
            0x83 => MessageType::NodeLookupResponse,
            0x84 => MessageType::RemoveValueResponse,
            0x85 => MessageType::StoreValueResponse,
            0xFF => MessageType::Error,
            _ => return None,
        })
    }

    #[inline]
    pub fn tag(self) -> u8 {
        self as u8
    }

    #[inline]
    pub fn is_response(self) -> bool {
        self.tag() & 0x80 != 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Connect,
    ConnectResponse,
    NodeLookup {
        target: NodeId,
    },
    NodeLookupResponse {
        nodes: Vec<Peer>,
    },
    FetchValue {
        key: String,
    },
    FetchValueResponse {
        key: String,
        /// Every value held for `key`; empty when the responder has none.
        values: Vec<String>,
        /// Closer peers to continue the lookup with.
        nodes: Vec<Peer>,
    },
    StoreValue {
        key: String,
        value: String,
    },
    StoreValueResponse {
        key: String,
        success: bool,
    },
    RemoveValue {
        key: String,
        value: String,
    },
    RemoveValueResponse {
        key: String,
        success: bool,
    },
    Error {
        message: String,
    },
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Connect => MessageType::Connect,
            Message::ConnectResponse => MessageType::ConnectResponse,
            Message::NodeLookup { .. } => MessageType::NodeLookup,
            Message::NodeLookupResponse { .. } => MessageType::NodeLookupResponse,
            Message::FetchValue { .. } => MessageType::FetchValue,
            Message::FetchValueResponse { .. } => MessageType::FetchValueResponse,
            Message::StoreValue { .. } => MessageType::StoreValue,
            Message::StoreValueResponse { .. } => MessageType::StoreValueResponse,
            Message::RemoveValue { .. } => MessageType::RemoveValue,
            Message::RemoveValueResponse { .. } => MessageType::RemoveValueResponse,
            Message::Error { .. } => MessageType::Error,
        }
    }

    #[inline]
    pub fn is_response(&self) -> bool {
        self.message_type().is_response()
    }
}

/// A framed message as it travels in one datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub message_id: u32,
    pub sender: Identifier,
    pub message: Message,
}

impl Envelope {
    pub fn new(message_id: u32, sender: Identifier, message: Message) -> Self {
        Self {
            message_id,
            sender,
            message,
        }
    }

    pub fn encode(&self) -> Result<Bytes, WireError> {
        let mut buf = BytesMut::with_capacity(128);
        buf.put_u32(self.message_id);
        buf.put_u8(self.message.message_type().tag());
        put_identifier(&mut buf, &self.sender);

        match &self.message {
            Message::Connect | Message::ConnectResponse => {}
            Message::NodeLookup { target } => put_bytes(&mut buf, target.as_bytes()),
            Message::NodeLookupResponse { nodes } => put_peers(&mut buf, nodes),
            Message::FetchValue { key } => put_str(&mut buf, key),
            Message::FetchValueResponse { key, values, nodes } => {
                put_str(&mut buf, key);
                buf.put_u32(values.len() as u32);
                for value in values {
                    put_str(&mut buf, value);
                }
                put_peers(&mut buf, nodes);
            }
            Message::StoreValue { key, value } | Message::RemoveValue { key, value } => {
                put_str(&mut buf, key);
                put_str(&mut buf, value);
            }
            Message::StoreValueResponse { key, success }
            | Message::RemoveValueResponse { key, success } => {
                put_str(&mut buf, key);
                buf.put_u8(u8::from(*success));
            }
            Message::Error { message } => put_str(&mut buf, message),
        }

        if buf.len() > MAX_DATAGRAM_SIZE {
            return Err(WireError::Oversize(buf.len()));
        }
        Ok(buf.freeze())
    }

    pub fn decode(data: &[u8]) -> Result<Self, WireError> {
        let mut r = Reader::new(data);
        let message_id = r.u32()?;
        let tag = r.u8()?;
        let kind = MessageType::from_tag(tag).ok_or(WireError::UnknownType(tag))?;
        let sender = r.identifier()?;

        let message = match kind {
            MessageType::Connect => Message::Connect,
            MessageType::ConnectResponse => Message::ConnectResponse,
            MessageType::NodeLookup => Message::NodeLookup {
                target: r.node_id("target")?,
            },
            MessageType::NodeLookupResponse => Message::NodeLookupResponse { nodes: r.peers()? },
            MessageType::FetchValue => Message::FetchValue { key: r.string()? },
            MessageType::FetchValueResponse => {
                let key = r.string()?;
                let count = r.count(4)?;
                let mut values = Vec::with_capacity(count);
                for _ in 0..count {
                    values.push(r.string()?);
                }
                let nodes = r.peers()?;
                Message::FetchValueResponse { key, values, nodes }
            }
            MessageType::StoreValue => Message::StoreValue {
                key: r.string()?,
                value: r.string()?,
            },
            MessageType::RemoveValue => Message::RemoveValue {
                key: r.string()?,
                value: r.string()?,
            },
            MessageType::StoreValueResponse => Message::StoreValueResponse {
                key: r.string()?,
                success: r.bool()?,
            },
            MessageType::RemoveValueResponse => Message::RemoveValueResponse {
                key: r.string()?,
                success: r.bool()?,
            },
            MessageType::Error => Message::Error { message: r.string()? },
        };

        r.finish()?;
        Ok(Self {
            message_id,
            sender,
            message,
        })
    }
}

// ============================================================================
// Encoding Helpers
// ============================================================================

fn put_bytes(buf: &mut BytesMut, bytes: &[u8]) {
    buf.put_u32(bytes.len() as u32);
    buf.put_slice(bytes);
}

fn put_str(buf: &mut BytesMut, s: &str) {
    put_bytes(buf, s.as_bytes());
}

fn put_identifier(buf: &mut BytesMut, identifier: &Identifier) {
    put_bytes(buf, identifier.id().as_bytes());
    put_bytes(buf, identifier.validation());
}

fn put_peer(buf: &mut BytesMut, peer: &Peer) {
    put_identifier(buf, &peer.identifier());
    match peer.ip() {
        IpAddr::V4(v4) => put_bytes(buf, &v4.octets()),
        IpAddr::V6(v6) => put_bytes(buf, &v6.octets()),
    }
    buf.put_u16(peer.port());
}

fn put_peers(buf: &mut BytesMut, peers: &[Peer]) {
    buf.put_u32(peers.len() as u32);
    for peer in peers {
        put_peer(buf, peer);
    }
}

// ============================================================================
// Decoding
// ============================================================================

/// Bounds-checked cursor over a received datagram. Every read checks
/// `remaining()` first, so the panicking `Buf` getters are never reached
/// short of data.
struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn need(&self, n: usize) -> Result<(), WireError> {
        let remaining = self.buf.remaining();
        if n > remaining {
            return Err(WireError::Truncated { needed: n, remaining });
        }
        Ok(())
    }

    fn u8(&mut self) -> Result<u8, WireError> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    fn u16(&mut self) -> Result<u16, WireError> {
        self.need(2)?;
        Ok(self.buf.get_u16())
    }

    fn u32(&mut self) -> Result<u32, WireError> {
        self.need(4)?;
        Ok(self.buf.get_u32())
    }

    fn bool(&mut self) -> Result<bool, WireError> {
        match self.u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(WireError::InvalidBool(other)),
        }
    }

    /// A `u32` length prefix, checked against what is left.
    fn len_prefix(&mut self) -> Result<usize, WireError> {
        let len = self.u32()? as usize;
        self.need(len)?;
        Ok(len)
    }

    fn string(&mut self) -> Result<String, WireError> {
        let len = self.len_prefix()?;
        let (bytes, rest) = self.buf.split_at(len);
        let s = std::str::from_utf8(bytes).map_err(|_| WireError::InvalidUtf8)?;
        self.buf = rest;
        Ok(s.to_owned())
    }

    fn fixed_id(&mut self, field: &'static str) -> Result<[u8; ID_LEN], WireError> {
        let len = self.len_prefix()?;
        if len != ID_LEN {
            return Err(WireError::InvalidLength { field, len });
        }
        let mut out = [0u8; ID_LEN];
        self.buf.copy_to_slice(&mut out);
        Ok(out)
    }

    fn node_id(&mut self, field: &'static str) -> Result<NodeId, WireError> {
        Ok(NodeId::from_bytes(self.fixed_id(field)?))
    }

    fn identifier(&mut self) -> Result<Identifier, WireError> {
        let id = self.node_id("identifier")?;
        let validation = self.fixed_id("validation")?;
        Ok(Identifier::from_parts(id, validation))
    }

    fn ip(&mut self) -> Result<IpAddr, WireError> {
        match self.len_prefix()? {
            4 => {
                let mut octets = [0u8; 4];
                self.buf.copy_to_slice(&mut octets);
                Ok(IpAddr::V4(Ipv4Addr::from(octets)))
            }
            16 => {
                let mut octets = [0u8; 16];
                self.buf.copy_to_slice(&mut octets);
                Ok(IpAddr::V6(Ipv6Addr::from(octets)))
            }
            len => Err(WireError::InvalidLength { field: "ip", len }),
        }
    }

    fn peer(&mut self) -> Result<Peer, WireError> {
        let identifier = self.identifier()?;
        let ip = self.ip()?;
        let port = self.u16()?;
        Ok(Peer::new(identifier, ip, port))
    }

    /// A list count, checked against the smallest possible element size so a
    /// hostile count cannot force a huge allocation.
    fn count(&mut self, min_element: usize) -> Result<usize, WireError> {
        let count = self.u32()? as usize;
        self.need(count.saturating_mul(min_element))?;
        Ok(count)
    }

    fn peers(&mut self) -> Result<Vec<Peer>, WireError> {
        let count = self.count(MIN_PEER_SIZE)?;
        let mut peers = Vec::with_capacity(count);
        for _ in 0..count {
            peers.push(self.peer()?);
        }
        Ok(peers)
    }

    fn finish(&self) -> Result<(), WireError> {
        match self.buf.remaining() {
            0 => Ok(()),
            n => Err(WireError::TrailingBytes(n)),
        }
    }
}
