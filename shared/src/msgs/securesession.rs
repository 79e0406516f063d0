//! Secure session endpoint.
//!
//! Server bound blobs are opaque here; the reader and the payment server
//! agree on their contents and the host only relays them.

use heapless::Vec;
use serde::{Deserialize, Serialize};

use super::payment::CardInfo;
use crate::protocol::{AppMessage, EndpointId};

/// Largest opaque server exchange
pub const MAX_SERVER_BLOB: usize = 512;
/// Largest sealed pinblock
pub const MAX_SEALED_PINBLOCK: usize = 64;

/// ISO 9564 pinblock layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PinBlockFormat {
    /// ISO format 1, legacy 8 byte block
    Iso1,
    /// ISO format 4, 16 byte AES block
    Iso4,
}

impl PinBlockFormat {
    pub const fn block_len(self) -> usize {
        match self {
            Self::Iso1 => 8,
            Self::Iso4 => 16,
        }
    }
}

/// Informational data about a secure session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SessionData {
    pub session_id: u32,
    pub reader_transaction_count: u32,
    pub reader_utc_epoch_time: u32,
}

/// Why the server refused to validate the reader
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DenyReason {
    GenericError,
    ParseError,
    UnknownDenyReason,
    NotDenied,
    SellerSuspended,
    SellerNotEligible,
    DeviceHardwareNotSupported,
    DeviceFirmwareTooOld,
    DeviceFirmwareNotSupported,
    DeviceFirmwareModified,
    DeviceFirmwareDamaged,
    DeviceInDeveloperMode,
    AppTooOld,
    AppDamaged,
    InvalidRequest,
    DeviceInAccessibilityMode,
    SellerNotActivated,
    None,
}

/// What the UI should offer after a denial
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum UxHint {
    NoSuggestedAction,
    SuggestRetry,
    SuggestActivation,
    SuggestContactSupport,
}

/// The server's answer to a validate request, as decoded by the host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerVerdict {
    /// Forward these bytes to the reader
    Approved(Vec<u8, MAX_SERVER_BLOB>),
    Denied {
        reason: DenyReason,
        ux_hint: UxHint,
        title: heapless::String<64>,
        description: heapless::String<160>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SecureSessionRequest {
    /// Begin establishing a session
    Establish,
    /// Server payload relayed back to the reader
    ServerResponse(Vec<u8, MAX_SERVER_BLOB>),
    /// The host could not reach the server
    ServerError,
    PinBlock {
        format: PinBlockFormat,
        sealed: Vec<u8, MAX_SEALED_PINBLOCK>,
    },
    PinBypass,
}

impl AppMessage for SecureSessionRequest {
    const ENDPOINT: EndpointId = EndpointId::SECURE_SESSION;

    fn msg_type(&self) -> u16 {
        match self {
            Self::Establish => 0x01,
            Self::ServerResponse(_) => 0x02,
            Self::ServerError => 0x03,
            Self::PinBlock { .. } => 0x04,
            Self::PinBypass => 0x05,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SecureSessionEvent {
    /// Validate request to forward to the server
    ServerRequest(Vec<u8, MAX_SERVER_BLOB>),
    SessionValid(SessionData),
    SessionInvalid,
    PinRequested {
        card_info: CardInfo,
        can_bypass: bool,
        final_attempt: bool,
    },
}

impl AppMessage for SecureSessionEvent {
    const ENDPOINT: EndpointId = EndpointId::SECURE_SESSION;

    fn msg_type(&self) -> u16 {
        match self {
            Self::ServerRequest(_) => 0x81,
            Self::SessionValid(_) => 0x82,
            Self::SessionInvalid => 0x83,
            Self::PinRequested { .. } => 0x84,
        }
    }
}
