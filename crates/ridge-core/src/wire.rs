//! Ridge wire format — the outer packet tag and the handshake TLV framing.
//!
//! Every datagram starts with a one-byte packet-type tag and two reserved
//! bytes. Data packets continue with a 6-byte nonce and method-specific
//! ciphertext; handshake packets continue with a TLV stream:
//!
//!   [request id: u8] [reserved: u8 × 2] then records of
//!   [type: u8] [length: u16 LE] [value: length bytes]
//!
//! Duplicate record types within one message are rejected. Unknown record
//! types are skipped so that future protocol revisions can add records
//! without breaking older peers.

use thiserror::Error;

use crate::buffer::Buffer;
use crate::crypto::KEY_BYTES;

// ── Packet types ──────────────────────────────────────────────────────────────

/// Outer packet-type tags. Anything else is dropped at dispatch.
pub const PACKET_HANDSHAKE: u8 = 0x01;
pub const PACKET_DATA: u8 = 0x02;

/// Outer header: type tag plus two reserved bytes.
pub const PACKET_HEADER_BYTES: usize = 3;

// ── Handshake records ─────────────────────────────────────────────────────────

/// TLV record types. The last five slots are bound to this protocol's
/// key material and authenticator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordType {
    HandshakeType = 0,
    ReplyCode = 1,
    ErrorDetail = 2,
    Flags = 3,
    Mode = 4,
    ProtocolName = 5,
    SenderKey = 6,
    RecipientKey = 7,
    SenderHandshakeKey = 8,
    RecipientHandshakeKey = 9,
    AuthTag = 10,
}

const RECORD_TYPE_COUNT: usize = 11;

impl RecordType {
    fn from_u8(value: u8) -> Option<RecordType> {
        use RecordType::*;
        Some(match value {
            0 => HandshakeType,
            1 => ReplyCode,
            2 => ErrorDetail,
            3 => Flags,
            4 => Mode,
            5 => ProtocolName,
            6 => SenderKey,
            7 => RecipientKey,
            8 => SenderHandshakeKey,
            9 => RecipientHandshakeKey,
            10 => AuthTag,
            _ => return None,
        })
    }
}

/// Errors that arise while interpreting wire-format data.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    #[error("truncated handshake packet")]
    Truncated,

    #[error("duplicate record type 0x{0:02x}")]
    DuplicateRecord(u8),
}

/// A parsed handshake message — request id plus one optional value per
/// record type.
pub struct HandshakeRecords {
    pub request_id: u8,
    values: [Option<Vec<u8>>; RECORD_TYPE_COUNT],
}

impl HandshakeRecords {
    /// Parse the payload of a handshake packet (the bytes after the outer
    /// packet header).
    pub fn parse(payload: &[u8]) -> Result<HandshakeRecords, WireError> {
        if payload.len() < 3 {
            return Err(WireError::Truncated);
        }
        let request_id = payload[0];
        let mut values: [Option<Vec<u8>>; RECORD_TYPE_COUNT] = Default::default();

        let mut rest = &payload[3..];
        while !rest.is_empty() {
            if rest.len() < 3 {
                return Err(WireError::Truncated);
            }
            let ty = rest[0];
            let len = u16::from_le_bytes([rest[1], rest[2]]) as usize;
            if rest.len() < 3 + len {
                return Err(WireError::Truncated);
            }
            let value = &rest[3..3 + len];
            rest = &rest[3 + len..];

            match RecordType::from_u8(ty) {
                Some(record) => {
                    let slot = &mut values[record as usize];
                    if slot.is_some() {
                        return Err(WireError::DuplicateRecord(ty));
                    }
                    *slot = Some(value.to_vec());
                }
                // unknown record type: skip
                None => {}
            }
        }

        Ok(HandshakeRecords { request_id, values })
    }

    pub fn get(&self, record: RecordType) -> Option<&[u8]> {
        self.values[record as usize].as_deref()
    }

    /// A record that must be exactly one byte.
    pub fn get_u8(&self, record: RecordType) -> Option<u8> {
        match self.get(record) {
            Some([b]) => Some(*b),
            _ => None,
        }
    }

    /// A record that must be exactly 32 bytes — key material and tags.
    pub fn get_key(&self, record: RecordType) -> Option<&[u8; KEY_BYTES]> {
        self.get(record).and_then(|v| v.try_into().ok())
    }
}

/// Builds a complete handshake datagram, outer header included.
pub struct HandshakeBuilder {
    data: Vec<u8>,
}

impl HandshakeBuilder {
    pub fn new(request_id: u8) -> HandshakeBuilder {
        let mut data = Vec::with_capacity(256);
        data.extend_from_slice(&[PACKET_HANDSHAKE, 0, 0]);
        data.extend_from_slice(&[request_id, 0, 0]);
        HandshakeBuilder { data }
    }

    pub fn add(&mut self, record: RecordType, value: &[u8]) -> &mut Self {
        debug_assert!(value.len() <= u16::MAX as usize);
        self.data.push(record as u8);
        self.data.extend_from_slice(&(value.len() as u16).to_le_bytes());
        self.data.extend_from_slice(value);
        self
    }

    pub fn add_u8(&mut self, record: RecordType, value: u8) -> &mut Self {
        self.add(record, &[value])
    }

    pub fn finish(self) -> Buffer {
        Buffer::from_vec(self.data)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
