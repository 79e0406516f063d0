//! # Transport & Timer Abstractions
//!
//! This module defines the two services the host supplies to the reader
//! communications core. Following the dependency-inversion pattern, the core
//! depends only on these traits:
//!
//! - [`TransportBackend`]: moves raw bytes to and from the reader (USB HID
//!   reports, a UART byte stream, a demodulated audio link). It knows link
//!   packaging but nothing about frames or endpoints.
//! - [`TimerApi`]: one-shot timers the core and its features use for protocol
//!   timeouts and retries.
//!
//! ## Data Flow
//!
//! ```text
//!   host I/O ──► TransportBackend::unwrap_inbound ──► RingBuffer ──► framer
//!
//!   framer ──► TransportBackend::send ──► host I/O
//!                      │
//!                      └─ SendStatus::Pending ⇒ host later reports completion
//! ```
//!
//! Neither trait is required to be thread safe. All calls happen on the one
//! serialized context that also owns the core.

use crate::buffer::StagingBuffer;

/// Errors that can occur while moving bytes over a transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TransportError {
    /// The underlying channel is not open
    Disconnected,
    /// Staging buffer overflow - data arrived faster than it could be framed
    BufferOverflow,
    /// Attempted to read from an empty staging buffer
    BufferUnderflow,
    /// Inbound link packaging was malformed (e.g. bad HID report length byte)
    MalformedPacket,
    /// Generic I/O error reported by the host
    IoError,
}

/// Outcome of handing bytes to a transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SendStatus {
    /// The bytes were fully handed off; the next frame may be sent right away
    Complete,
    /// The host owns the bytes and will report completion later
    Pending,
}

/// Result type alias for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Physical channel to the reader
///
/// Implementations are swappable behind this one interface; the core is
/// transport agnostic.
pub trait TransportBackend {
    /// Prepare the channel for traffic. Called when a reader is plugged in.
    fn open(&mut self) -> TransportResult<()>;

    /// Tear the channel down. Called when the reader is unplugged or the core
    /// terminates.
    fn close(&mut self);

    /// Send one encoded link frame to the reader
    fn send(&mut self, bytes: &[u8]) -> TransportResult<SendStatus>;

    /// Strip link packaging from bytes the host received and stage the payload
    ///
    /// Returns the number of payload bytes staged. The default treats the
    /// channel as a plain byte stream.
    fn unwrap_inbound(&mut self, raw: &[u8], staging: &mut StagingBuffer) -> TransportResult<usize> {
        let staged = staging.insert(raw);
        if staged < raw.len() {
            return Err(TransportError::BufferOverflow);
        }
        Ok(staged)
    }
}

/// Identifies one scheduled timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TimerToken(pub u32);

/// One-shot timer service supplied by the host
///
/// When a started timer elapses the host reports it back to the core with the
/// same token. Starting an already running token restarts it.
pub trait TimerApi {
    /// Schedule `token` to fire after `delay_ms` milliseconds
    fn start(&mut self, token: TimerToken, delay_ms: u32);

    /// Cancel `token`; a no-op if it is not running
    fn stop(&mut self, token: TimerToken);
}

/// Configuration for link-level retry behavior
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Time to wait for a version handshake reply, in milliseconds
    pub negotiation_timeout_ms: u32,
    /// Handshake attempts before giving up
    pub max_negotiation_attempts: u8,
    /// Outbound frames allowed to queue behind a pending send
    pub max_tx_queue: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            negotiation_timeout_ms: 500,
            max_negotiation_attempts: 3,
            max_tx_queue: 16,
        }
    }
}
