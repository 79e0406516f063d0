//! # Link Frame Codec
//!
//! This module turns staged transport bytes into typed application messages
//! (endpoint id + message type + payload) and back.
//!
//! ## Frame Format
//!
//! ```text
//! ┌─────────┬──────────┬──────────┬──────────┬──────────┬──────────────────┬──────────┐
//! │  Magic  │  Length  │ Sequence │ Endpoint │ Msg Type │     Payload      │   CRC    │
//! │ 2 bytes │ 2 bytes  │  1 byte  │  1 byte  │ 2 bytes  │  Variable size   │  2 bytes │
//! └─────────┴──────────┴──────────┴──────────┴──────────┴──────────────────┴──────────┘
//! ```
//!
//! Multi-byte fields are little endian. The CRC-16-CCITT covers every byte
//! before it. Payloads are `postcard` encodings of the endpoint's message set
//! (see [`crate::msgs`]).
//!
//! ## Resynchronization
//!
//! The decoder works directly on the staging [`RingBuffer`]. Garbage before a
//! magic marker is discarded; a frame that fails its CRC gives up its magic
//! bytes so the scan restarts at the next candidate.

use heapless::Vec;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::buffer::RingBuffer;

/// Magic bytes to identify start of frame
pub const FRAME_MAGIC: [u8; 2] = [0x5A, 0xA5];

/// Size of the fixed header (magic through message type)
pub const HEADER_SIZE: usize = 8;

/// Size of the CRC trailer
pub const CRC_SIZE: usize = 2;

/// Maximum payload carried by a single frame
pub const MAX_PAYLOAD_SIZE: usize = 1024;

/// Largest encoded frame
pub const MAX_FRAME_SIZE: usize = HEADER_SIZE + MAX_PAYLOAD_SIZE + CRC_SIZE;

/// Link transport version implemented by this crate
pub const TRANSPORT_VERSION: u32 = 2;
/// Application message layer version implemented by this crate
pub const APP_VERSION: u32 = 5;
/// Endpoint message set version implemented by this crate
pub const ENDPOINT_VERSION: u32 = 11;

/// Oldest peer transport version still spoken
pub const MIN_TRANSPORT_VERSION: u32 = 2;
/// Oldest peer app version still spoken
pub const MIN_APP_VERSION: u32 = 4;
/// Oldest peer endpoint version still spoken
pub const MIN_ENDPOINT_VERSION: u32 = 8;

/// Routing key identifying which feature owns a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct EndpointId(pub u8);

impl EndpointId {
    /// Link management owned by the core itself
    pub const SYSTEM: Self = Self(0x00);
    /// Battery and power state
    pub const POWER: Self = Self(0x01);
    /// Reader event log
    pub const EVENTLOG: Self = Self(0x02);
    /// Firmware manifest and image transfer
    pub const FIRMWARE_UPDATE: Self = Self(0x03);
    /// Secure session establishment and PIN handling
    pub const SECURE_SESSION: Self = Self(0x04);
    /// EMV level 2 payment flow
    pub const EMV_FLOW: Self = Self(0x05);
    /// Magnetic stripe reader
    pub const MAGSWIPE: Self = Self(0x06);
    /// E-money TMN payment flow
    pub const TMN: Self = Self(0x07);
    /// LEDs, buzzer and other user interaction
    pub const USER_INTERACTION: Self = Self(0x08);

    /// Human readable name for logs and error reports
    pub const fn name(self) -> &'static str {
        match self.0 {
            0x00 => "system",
            0x01 => "power",
            0x02 => "eventlog",
            0x03 => "fwup",
            0x04 => "securesession",
            0x05 => "emv_flow",
            0x06 => "magswipe",
            0x07 => "tmn",
            0x08 => "user_interaction",
            _ => "unknown",
        }
    }
}

impl core::fmt::Display for EndpointId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}({:#04x})", self.name(), self.0)
    }
}

/// Decoded frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Header {
    /// Payload length in bytes
    pub payload_len: u16,
    /// Sequence number, wraps at 255
    pub sequence: u8,
    /// Destination endpoint
    pub endpoint: EndpointId,
    /// Endpoint specific message type
    pub msg_type: u16,
}

impl Header {
    fn parse(bytes: &[u8; HEADER_SIZE]) -> Self {
        Self {
            payload_len: u16::from_le_bytes([bytes[2], bytes[3]]),
            sequence: bytes[4],
            endpoint: EndpointId(bytes[5]),
            msg_type: u16::from_le_bytes([bytes[6], bytes[7]]),
        }
    }
}

/// One application message, owned, transient
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Owning endpoint
    pub endpoint: EndpointId,
    /// Endpoint specific message type
    pub msg_type: u16,
    /// Encoded body
    pub payload: Vec<u8, MAX_PAYLOAD_SIZE>,
}

impl Message {
    /// Build a message from raw parts
    pub fn new(endpoint: EndpointId, msg_type: u16, payload: &[u8]) -> Result<Self, FrameError> {
        let mut body = Vec::new();
        body.extend_from_slice(payload)
            .map_err(|_| FrameError::PayloadTooLarge)?;
        Ok(Self {
            endpoint,
            msg_type,
            payload: body,
        })
    }
}

/// Errors during frame building/parsing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FrameError {
    /// Buffer too small for frame
    BufferTooSmall,
    /// Bytes before the next magic marker were discarded
    InvalidMagic,
    /// Declared payload length exceeds [`MAX_PAYLOAD_SIZE`]
    PayloadTooLarge,
    /// CRC check failed
    CrcMismatch,
    /// Serialization failed
    SerializationError,
    /// Deserialization failed
    DeserializationError,
    /// Payload decoded as a different message type than the header declared
    MsgTypeMismatch,
}

/// A typed message set belonging to one endpoint
///
/// Each endpoint defines one enum per direction. The header's message type is
/// the variant tag, and the payload is the `postcard` encoding of the value.
pub trait AppMessage: Serialize + DeserializeOwned {
    /// Endpoint this message set travels on
    const ENDPOINT: EndpointId;

    /// Variant tag written to the frame header
    fn msg_type(&self) -> u16;

    /// Encode into an untyped [`Message`]
    fn to_message(&self) -> Result<Message, FrameError> {
        let mut scratch = [0u8; MAX_PAYLOAD_SIZE];
        let body = postcard::to_slice(self, &mut scratch)
            .map_err(|_| FrameError::SerializationError)?;
        Message::new(Self::ENDPOINT, self.msg_type(), body)
    }

    /// Decode from an untyped [`Message`], checking the header's tag
    fn from_message(msg: &Message) -> Result<Self, FrameError> {
        let value: Self = postcard::from_bytes(&msg.payload)
            .map_err(|_| FrameError::DeserializationError)?;
        if value.msg_type() != msg.msg_type {
            return Err(FrameError::MsgTypeMismatch);
        }
        Ok(value)
    }
}

/// Frame builder for constructing wire-format messages
pub struct FrameEncoder {
    sequence: u8,
}

impl FrameEncoder {
    /// Create a new frame encoder
    pub const fn new() -> Self {
        Self { sequence: 0 }
    }

    /// Get the next sequence number and increment
    pub fn next_sequence(&mut self) -> u8 {
        let seq = self.sequence;
        self.sequence = self.sequence.wrapping_add(1);
        seq
    }

    /// Build a complete frame with header and CRC
    ///
    /// Returns the number of bytes written to the buffer
    pub fn encode(&mut self, msg: &Message, buffer: &mut [u8]) -> Result<usize, FrameError> {
        let payload_len = msg.payload.len();
        let total = HEADER_SIZE + payload_len + CRC_SIZE;
        if buffer.len() < total {
            return Err(FrameError::BufferTooSmall);
        }

        buffer[0..2].copy_from_slice(&FRAME_MAGIC);
        buffer[2..4].copy_from_slice(&(payload_len as u16).to_le_bytes());
        buffer[4] = self.next_sequence();
        buffer[5] = msg.endpoint.0;
        buffer[6..8].copy_from_slice(&msg.msg_type.to_le_bytes());
        buffer[HEADER_SIZE..HEADER_SIZE + payload_len].copy_from_slice(&msg.payload);

        let crc_at = HEADER_SIZE + payload_len;
        let crc = crc16(&buffer[..crc_at]);
        buffer[crc_at..total].copy_from_slice(&crc.to_le_bytes());

        Ok(total)
    }
}

impl Default for FrameEncoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Counters kept by the decoder
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DecoderStats {
    /// Frames decoded successfully
    pub frames: u32,
    /// Bytes thrown away while hunting for a magic marker
    pub discarded_bytes: u32,
    /// Frames rejected by CRC
    pub crc_errors: u32,
}

/// Incremental frame parser over a staging ring
#[derive(Debug, Default)]
pub struct FrameDecoder {
    stats: DecoderStats,
    last_sequence: Option<u8>,
}

impl FrameDecoder {
    pub const fn new() -> Self {
        Self {
            stats: DecoderStats {
                frames: 0,
                discarded_bytes: 0,
                crc_errors: 0,
            },
            last_sequence: None,
        }
    }

    pub fn stats(&self) -> DecoderStats {
        self.stats
    }

    /// Sequence number of the last good frame
    pub fn last_sequence(&self) -> Option<u8> {
        self.last_sequence
    }

    /// Forget partial state after a link reset
    pub fn reset(&mut self) {
        self.last_sequence = None;
    }

    /// Pull the next complete message out of `ring`
    ///
    /// Returns `None` when more bytes are needed. Errors are returned once per
    /// bad region; the offending bytes are already consumed so the caller can
    /// simply call again.
    pub fn next_message<const N: usize>(
        &mut self,
        ring: &mut RingBuffer<N>,
    ) -> Option<Result<Message, FrameError>> {
        if let Some(skipped) = self.skip_to_magic(ring) {
            self.stats.discarded_bytes += skipped as u32;
            return Some(Err(FrameError::InvalidMagic));
        }

        let mut raw = [0u8; HEADER_SIZE];
        if ring.peek(&mut raw) < HEADER_SIZE {
            return None;
        }
        let header = Header::parse(&raw);
        let payload_len = header.payload_len as usize;
        if payload_len > MAX_PAYLOAD_SIZE {
            ring.remove(FRAME_MAGIC.len());
            return Some(Err(FrameError::PayloadTooLarge));
        }

        let total = HEADER_SIZE + payload_len + CRC_SIZE;
        let frame = ring.data(total)?;

        let crc_at = HEADER_SIZE + payload_len;
        let expected = u16::from_le_bytes([frame[crc_at], frame[crc_at + 1]]);
        if crc16(&frame[..crc_at]) != expected {
            self.stats.crc_errors += 1;
            ring.remove(FRAME_MAGIC.len());
            return Some(Err(FrameError::CrcMismatch));
        }

        let result = Message::new(header.endpoint, header.msg_type, &frame[HEADER_SIZE..crc_at]);
        ring.remove(total);
        self.stats.frames += 1;
        self.last_sequence = Some(header.sequence);
        Some(result)
    }

    /// Discard bytes until the ring starts with the magic marker (or a
    /// possible prefix of it). Returns the count discarded, if any.
    fn skip_to_magic<const N: usize>(&mut self, ring: &mut RingBuffer<N>) -> Option<usize> {
        let mut skipped = 0;
        loop {
            let mut lead = [0u8; 2];
            match ring.peek(&mut lead) {
                0 => break,
                1 if lead[0] == FRAME_MAGIC[0] => break,
                2 if lead == FRAME_MAGIC => break,
                _ => {
                    ring.remove(1);
                    skipped += 1;
                }
            }
        }
        (skipped > 0).then_some(skipped)
    }
}

/// Simple CRC-16-CCITT implementation
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for byte in data {
        crc ^= (*byte as u16) << 8;
        for _ in 0..8 {
            if crc & 0x8000 != 0 {
                crc = (crc << 1) ^ 0x1021;
            } else {
                crc <<= 1;
            }
        }
    }
    crc
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::OverflowPolicy;
    use crate::msgs::power::PowerRequest;

    fn ring() -> RingBuffer<256> {
        RingBuffer::new(OverflowPolicy::DropNew)
    }

    #[test]
    fn test_frame_roundtrip_through_ring() {
        let mut encoder = FrameEncoder::new();
        let msg = Message::new(EndpointId::POWER, 3, &[1, 2, 3]).unwrap();

        let mut buffer = [0u8; 64];
        let len = encoder.encode(&msg, &mut buffer).unwrap();
        assert_eq!(len, HEADER_SIZE + 3 + CRC_SIZE);

        let mut ring = ring();
        ring.insert(&buffer[..len]);
        let mut decoder = FrameDecoder::new();
        let parsed = decoder.next_message(&mut ring).unwrap().unwrap();
        assert_eq!(parsed, msg);
        assert!(ring.is_empty());
        assert_eq!(decoder.last_sequence(), Some(0));
    }

    #[test]
    fn test_partial_frame_waits_for_more() {
        let mut encoder = FrameEncoder::new();
        let msg = Message::new(EndpointId::EMV_FLOW, 1, &[9; 20]).unwrap();
        let mut buffer = [0u8; 64];
        let len = encoder.encode(&msg, &mut buffer).unwrap();

        let mut ring = ring();
        let mut decoder = FrameDecoder::new();
        ring.insert(&buffer[..5]);
        assert!(decoder.next_message(&mut ring).is_none());
        ring.insert(&buffer[5..len - 1]);
        assert!(decoder.next_message(&mut ring).is_none());
        ring.insert(&buffer[len - 1..len]);
        assert_eq!(decoder.next_message(&mut ring), Some(Ok(msg)));
    }

    #[test]
    fn test_garbage_before_magic_is_skipped() {
        let mut encoder = FrameEncoder::new();
        let msg = Message::new(EndpointId::TMN, 2, &[]).unwrap();
        let mut buffer = [0u8; 32];
        let len = encoder.encode(&msg, &mut buffer).unwrap();

        let mut ring = ring();
        ring.insert(&[0x00, 0x13, 0x37]);
        ring.insert(&buffer[..len]);

        let mut decoder = FrameDecoder::new();
        assert_eq!(decoder.next_message(&mut ring), Some(Err(FrameError::InvalidMagic)));
        assert_eq!(decoder.next_message(&mut ring), Some(Ok(msg)));
        assert_eq!(decoder.stats().discarded_bytes, 3);
    }

    #[test]
    fn test_crc_verification() {
        let mut encoder = FrameEncoder::new();
        let msg = Message::new(EndpointId::POWER, 0, &[42]).unwrap();
        let mut buffer = [0u8; 32];
        let len = encoder.encode(&msg, &mut buffer).unwrap();

        // Corrupt one payload byte
        buffer[HEADER_SIZE] ^= 0xFF;

        let mut ring = ring();
        ring.insert(&buffer[..len]);
        let mut decoder = FrameDecoder::new();
        assert_eq!(decoder.next_message(&mut ring), Some(Err(FrameError::CrcMismatch)));
        assert_eq!(decoder.stats().crc_errors, 1);
    }

    #[test]
    fn test_oversized_length_is_rejected() {
        let mut ring = ring();
        ring.insert(&FRAME_MAGIC);
        ring.insert(&(MAX_PAYLOAD_SIZE as u16 + 1).to_le_bytes());
        ring.insert(&[0, 0, 0, 0]);
        let mut decoder = FrameDecoder::new();
        assert_eq!(decoder.next_message(&mut ring), Some(Err(FrameError::PayloadTooLarge)));
    }

    #[test]
    fn test_typed_message_checks_tag() {
        let typed = PowerRequest::SetLpsTimeout { timeout_ms: 5000 };
        let mut msg = typed.to_message().unwrap();
        assert_eq!(msg.endpoint, EndpointId::POWER);
        assert_eq!(PowerRequest::from_message(&msg), Ok(typed));

        msg.msg_type = 0;
        assert_eq!(PowerRequest::from_message(&msg), Err(FrameError::MsgTypeMismatch));
    }

    #[test]
    fn test_sequence_wraps() {
        let mut encoder = FrameEncoder::new();
        for _ in 0..255 {
            encoder.next_sequence();
        }
        assert_eq!(encoder.next_sequence(), 255);
        assert_eq!(encoder.next_sequence(), 0);
    }
}
