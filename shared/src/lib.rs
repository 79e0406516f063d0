//! # Shared Cardreader Protocol Library
//!
//! This crate provides the wire-level abstractions spoken between the host
//! communications core and a payment reader:
//!
//! - **Ring Buffer**: fixed capacity staging between transport and framer
//! - **Link Framing**: endpoint routed frames with CRC, decoded in place
//! - **Message Sets**: typed `postcard` payloads for every endpoint
//! - **Transport/Timer Traits**: the two services a host must supply
//!
//! ## Architecture
//!
//! ```text
//! Transport ──► RingBuffer ──► FrameDecoder ──► Message { endpoint, type, payload }
//!                                                        │
//!                                               AppMessage::from_message
//!                                                        │
//!                                                   typed event
//!
//! typed request ──► AppMessage::to_message ──► FrameEncoder ──► Transport
//! ```
//!
//! Everything here is `no_std` compatible; the `std` feature (on by default)
//! only enables std support in `serde` and `postcard`.

#![cfg_attr(not(feature = "std"), no_std)]

pub mod buffer;
pub mod capability;
pub mod msgs;
pub mod protocol;
pub mod traits;

// Re-export main types for convenience
pub use buffer::{BufferError, BufferStats, OverflowPolicy, RingBuffer, StagingBuffer, RX_BUFFER_SIZE};
pub use capability::Capability;
pub use protocol::{
    AppMessage, EndpointId, FrameDecoder, FrameEncoder, FrameError, Message, MAX_FRAME_SIZE,
    MAX_PAYLOAD_SIZE,
};
pub use traits::{
    LinkConfig, SendStatus, TimerApi, TimerToken, TransportBackend, TransportError,
    TransportResult,
};

/// Library version for protocol compatibility checks
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
