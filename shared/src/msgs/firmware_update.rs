//! Firmware update endpoint: manifest retrieval and block-wise image transfer.

use heapless::{String, Vec};
use serde::{Deserialize, Serialize};

use crate::protocol::{AppMessage, EndpointId};

/// Image bytes carried by one block
pub const FWUP_BLOCK_SIZE: usize = 256;
/// Largest image header accepted by the reader
pub const MAX_FWUP_HEADER: usize = 256;
/// Largest block index table accepted by the reader
pub const MAX_BLOCK_INDEX_TABLE: usize = 256;
/// Largest manifest the reader reports
pub const MAX_MANIFEST: usize = 512;
/// Component version entries in one report
pub const MAX_VERSION_INFOS: usize = 10;

/// Firmware component a version string belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FirmwareComponent {
    K21,
    K400Cpu0,
    K400Cpu1,
    Ble,
    Tms,
    Capks,
    TmsCapks,
    Fpga,
    K450Cpu0,
    K450Cpu1,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionInfo {
    pub component: FirmwareComponent,
    pub version: String<16>,
}

/// Reader's verdict on a transferred image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FwupResult {
    Success,
    Error,
    BadHeader,
    BadWriteAlignment,
    BadEncryptionKey,
    DuplicateUpdateToSlot,
    EncryptedUpdateRequired,
    InvalidImageHeader,
    InvalidImage,
    DecryptionFailure,
    FlashFault,
    InvalidImageVersion,
    NotSupported,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FirmwareUpdateRequest {
    GetManifest,
    /// Start an image transfer. The reader answers with `Ready`.
    Begin {
        header: Vec<u8, MAX_FWUP_HEADER>,
        total_len: u32,
        block_index_table: Vec<u8, MAX_BLOCK_INDEX_TABLE>,
    },
    Block {
        index: u32,
        data: Vec<u8, FWUP_BLOCK_SIZE>,
    },
    Stop,
}

impl AppMessage for FirmwareUpdateRequest {
    const ENDPOINT: EndpointId = EndpointId::FIRMWARE_UPDATE;

    fn msg_type(&self) -> u16 {
        match self {
            Self::GetManifest => 0x01,
            Self::Begin { .. } => 0x02,
            Self::Block { .. } => 0x03,
            Self::Stop => 0x04,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FirmwareUpdateEvent {
    Manifest {
        /// Empty when the reader has no manifest to offer
        manifest: Vec<u8, MAX_MANIFEST>,
        required_update: bool,
    },
    VersionInfo(Vec<VersionInfo, MAX_VERSION_INFOS>),
    TmsCountry(String<4>),
    /// Image accepted; transfer resumes at `resume_from` (blocks already on flash are skipped)
    Ready { resume_from: u32 },
    BlockAck { index: u32 },
    Result(FwupResult),
}

impl AppMessage for FirmwareUpdateEvent {
    const ENDPOINT: EndpointId = EndpointId::FIRMWARE_UPDATE;

    fn msg_type(&self) -> u16 {
        match self {
            Self::Manifest { .. } => 0x81,
            Self::VersionInfo(_) => 0x82,
            Self::TmsCountry(_) => 0x83,
            Self::Ready { .. } => 0x84,
            Self::BlockAck { .. } => 0x85,
            Self::Result(_) => 0x86,
        }
    }
}
