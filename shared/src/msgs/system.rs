//! System endpoint: link version negotiation, reader identity and
//! capability discovery. Owned by the core, never by a feature.

use heapless::Vec;
use serde::{Deserialize, Serialize};

use crate::protocol::{AppMessage, EndpointId};

/// Most capability ids a reader may advertise
pub const MAX_CAPABILITIES: usize = 64;

/// Hardware family of the attached reader
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ReaderType {
    #[default]
    Unknown,
    Gen2,
    O1,
    R4,
    R6,
    R12,
    A10,
    X2,
    R12c,
    T2,
    X2b,
    T2b,
    S3,
    R12dK450,
    R12d,
}

/// Link rate one direction of the channel runs at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CommsRate {
    #[default]
    Unknown,
    AudioLfsrHamming5Mono,
    AudioManchesterHamming5Mono,
    AudioLfsrHamming5Stereo,
    AudioManchesterHamming5Stereo,
    Audio1500Baud,
    Audio6000Baud,
}

impl CommsRate {
    /// Stable name used in logs
    pub const fn name(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::AudioLfsrHamming5Mono => "audio_lfsr_hamming_5_mono",
            Self::AudioManchesterHamming5Mono => "audio_manchester_hamming_5_mono",
            Self::AudioLfsrHamming5Stereo => "audio_lfsr_hamming_5_stereo",
            Self::AudioManchesterHamming5Stereo => "audio_manchester_hamming_5_stereo",
            Self::Audio1500Baud => "audio_1500_baud",
            Self::Audio6000Baud => "audio_6000_baud",
        }
    }
}

/// Transport / app / endpoint protocol version triple
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ProtocolVersions {
    pub transport: u32,
    pub app: u32,
    pub endpoint: u32,
}

/// Host to reader
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SystemRequest {
    /// Announce our versions and ask for the reader's
    VersionQuery(ProtocolVersions),
    ReaderInfoQuery,
    CapabilitiesQuery,
}

impl AppMessage for SystemRequest {
    const ENDPOINT: EndpointId = EndpointId::SYSTEM;

    fn msg_type(&self) -> u16 {
        match self {
            Self::VersionQuery(_) => 0x01,
            Self::ReaderInfoQuery => 0x02,
            Self::CapabilitiesQuery => 0x03,
        }
    }
}

/// Reader to host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SystemEvent {
    VersionInfo(ProtocolVersions),
    ReaderInfo {
        reader_type: ReaderType,
        comms_rate_in: CommsRate,
        comms_rate_out: CommsRate,
    },
    Capabilities(Vec<u16, MAX_CAPABILITIES>),
    /// Older firmware that has no capability list
    CapabilitiesUnsupported,
}

impl AppMessage for SystemEvent {
    const ENDPOINT: EndpointId = EndpointId::SYSTEM;

    fn msg_type(&self) -> u16 {
        match self {
            Self::VersionInfo(_) => 0x81,
            Self::ReaderInfo { .. } => 0x82,
            Self::Capabilities(_) => 0x83,
            Self::CapabilitiesUnsupported => 0x84,
        }
    }
}
