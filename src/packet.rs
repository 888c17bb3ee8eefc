//! Binary frame codec for the OBC serial link.
//!
//! Frame layout (multi-byte fields little-endian):
//!
//! ```text
//! +------+---------+-----+-----+------+-----+-------+-------+-----+---------+-------+
//! | 0xA5 | version | dst | src | type | cmd | seq16 | flags | len | payload | crc16 |
//! +------+---------+-----+-----+------+-----+-------+-------+-----+---------+-------+
//!    1        1       1     1     1      1      2       1      1     0..255     2
//! ```
//!
//! The nine bytes after the start byte form the header; its last byte is the
//! payload length, which is all the reassembler needs to size the frame. The
//! trailer is CRC-16/CCITT-FALSE over everything from the start byte through
//! the payload.

use heapless::Vec;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const START_BYTE: u8 = 0xA5;
pub const PROTOCOL_VERSION: u8 = 1;
pub const HEADER_LEN: usize = 9;
pub const TRAILER_LEN: usize = 2;
pub const FRAME_OVERHEAD: usize = 1 + HEADER_LEN + TRAILER_LEN;
pub const MAX_PAYLOAD_LEN: usize = 255;
pub const MAX_FRAME_LEN: usize = FRAME_OVERHEAD + MAX_PAYLOAD_LEN;

/// Offset of the payload length byte (last header byte).
pub const PAYLOAD_LEN_OFFSET: usize = HEADER_LEN;

pub const ADDR_OBC: u8 = 0x01;
pub const ADDR_EPS: u8 = 0x02;

const FLAG_LAST_CHUNK: u8 = 0x01;

pub type Payload = Vec<u8, MAX_PAYLOAD_LEN>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PacketError {
    #[error("output buffer too small for frame")]
    BufferTooSmall,
    #[error("payload exceeds 255 bytes")]
    PayloadTooLarge,
    #[error("frame shorter than the fixed overhead")]
    TooShort,
    #[error("missing start byte (found {0:#04x})")]
    BadStartByte(u8),
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),
    #[error("declared payload length does not match frame length")]
    LengthMismatch,
    #[error("crc mismatch (expected {expected:#06x}, computed {computed:#06x})")]
    BadCrc { expected: u16, computed: u16 },
    #[error("unknown message type {0}")]
    UnknownMessageType(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    Command = 1,
    Response = 2,
    Telemetry = 3,
    Log = 4,
    Ack = 5,
    Nack = 6,
}

impl TryFrom<u8> for MessageType {
    type Error = PacketError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Command),
            2 => Ok(Self::Response),
            3 => Ok(Self::Telemetry),
            4 => Ok(Self::Log),
            5 => Ok(Self::Ack),
            6 => Ok(Self::Nack),
            other => Err(PacketError::UnknownMessageType(other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Packet {
    pub version: u8,
    pub destination: u8,
    pub source: u8,
    pub message_type: MessageType,
    pub command_id: u8,
    pub sequence: u16,
    pub is_last_chunk: bool,
    pub payload: Payload,
}

impl Packet {
    /// Single-chunk packet with the current protocol version.
    pub fn new(
        destination: u8,
        source: u8,
        message_type: MessageType,
        command_id: u8,
        payload: &[u8],
    ) -> Result<Self, PacketError> {
        let payload = Payload::from_slice(payload).map_err(|()| PacketError::PayloadTooLarge)?;
        Ok(Self {
            version: PROTOCOL_VERSION,
            destination,
            source,
            message_type,
            command_id,
            sequence: 0,
            is_last_chunk: true,
            payload,
        })
    }

    pub fn with_sequence(mut self, sequence: u16) -> Self {
        self.sequence = sequence;
        self
    }

    pub fn frame_len(&self) -> usize {
        FRAME_OVERHEAD + self.payload.len()
    }

    /// Encodes into `out`, returning the number of bytes written.
    pub fn pack(&self, out: &mut [u8]) -> Result<usize, PacketError> {
        let payload_len = self.payload.len();
        if payload_len > MAX_PAYLOAD_LEN {
            return Err(PacketError::PayloadTooLarge);
        }
        let body_len = 1 + HEADER_LEN + payload_len;
        if body_len + TRAILER_LEN > out.len() {
            return Err(PacketError::BufferTooSmall);
        }

        let seq = self.sequence.to_le_bytes();
        out[0] = START_BYTE;
        out[1] = self.version;
        out[2] = self.destination;
        out[3] = self.source;
        out[4] = self.message_type as u8;
        out[5] = self.command_id;
        out[6] = seq[0];
        out[7] = seq[1];
        out[8] = if self.is_last_chunk { FLAG_LAST_CHUNK } else { 0 };
        out[PAYLOAD_LEN_OFFSET] = payload_len as u8;
        out[1 + HEADER_LEN..body_len].copy_from_slice(&self.payload);

        let crc = crc16_ccitt_false(&out[..body_len]).to_le_bytes();
        out[body_len] = crc[0];
        out[body_len + 1] = crc[1];
        Ok(body_len + TRAILER_LEN)
    }

    /// Encodes into an owned, exactly sized frame.
    pub fn to_frame(&self) -> Result<Vec<u8, MAX_FRAME_LEN>, PacketError> {
        let mut buf = [0u8; MAX_FRAME_LEN];
        let len = self.pack(&mut buf)?;
        Vec::from_slice(&buf[..len]).map_err(|()| PacketError::BufferTooSmall)
    }

    /// Decodes one complete frame. `buf` must hold exactly one frame.
    pub fn unpack(buf: &[u8]) -> Result<Self, PacketError> {
        if buf.len() < FRAME_OVERHEAD {
            return Err(PacketError::TooShort);
        }
        if buf[0] != START_BYTE {
            return Err(PacketError::BadStartByte(buf[0]));
        }
        let version = buf[1];
        if version != PROTOCOL_VERSION {
            return Err(PacketError::UnsupportedVersion(version));
        }

        let payload_len = buf[PAYLOAD_LEN_OFFSET] as usize;
        if FRAME_OVERHEAD + payload_len != buf.len() {
            return Err(PacketError::LengthMismatch);
        }

        let body_len = 1 + HEADER_LEN + payload_len;
        let expected = u16::from_le_bytes([buf[body_len], buf[body_len + 1]]);
        let computed = crc16_ccitt_false(&buf[..body_len]);
        if expected != computed {
            return Err(PacketError::BadCrc { expected, computed });
        }

        let message_type = MessageType::try_from(buf[4])?;
        let payload = Payload::from_slice(&buf[1 + HEADER_LEN..body_len])
            .map_err(|()| PacketError::PayloadTooLarge)?;

        Ok(Self {
            version,
            destination: buf[2],
            source: buf[3],
            message_type,
            command_id: buf[5],
            sequence: u16::from_le_bytes([buf[6], buf[7]]),
            is_last_chunk: buf[8] & FLAG_LAST_CHUNK != 0,
            payload,
        })
    }
}

/// CRC-16/CCITT-FALSE (poly 0x1021, init 0xFFFF, no reflection, no xorout).
pub fn crc16_ccitt_false(bytes: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &b in bytes {
        crc ^= u16::from(b) << 8;
        for _ in 0..8 {
            if (crc & 0x8000) != 0 {
                crc = (crc << 1) ^ 0x1021;
            } else {
                crc <<= 1;
            }
        }
    }
    crc
}
