//! # Secure Session Feature
//!
//! Establishes the authenticated channel the reader needs before EMV or PIN
//! handling, and owns PIN entry.
//!
//! ## Session
//!
//! ```text
//!  establish_session ──► Establish
//!                            │
//!            ServerRequest ──► on_send_to_server ──► (host talks to server)
//!                                                          │
//!       process_server_message / notify_server_error ◄─────┘
//!                            │
//!           SessionValid / SessionInvalid ──► on_session_event
//! ```
//!
//! There is no server timeout here; the host owns liveness of that exchange.
//!
//! ## PIN
//!
//! A `PinRequested` event opens an entry window. Digits are collected into a
//! [`PinBuffer`] that is wiped after submit, bypass, timeout, link loss and
//! term. The pinblock format is ISO 4 when both the host flag and the reader
//! capability allow it, ISO 1 otherwise.

use std::cell::{Cell, RefCell};

use cardreader_shared::msgs::payment::CardInfo;
use cardreader_shared::msgs::securesession::{
    DenyReason, PinBlockFormat, SecureSessionEvent, SecureSessionRequest, ServerVerdict,
    SessionData, UxHint, MAX_SEALED_PINBLOCK,
};
use cardreader_shared::{AppMessage, Capability, EndpointId, Message, TimerToken};
use heapless::Vec as HVec;
use log::{debug, info, warn};
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use super::{FeatureSlot, FeatureState};
use crate::config::PIN_ENTRY_TIMEOUT_MS;
use crate::crypto::CryptoError;
use crate::error::{feature_error_conversions, CardreaderError, LifecycleError};
use crate::lifecycle::Lifecycle;
use crate::reader::{Cardreader, CoreLink};
use crate::registry::EndpointHandler;

/// Most PIN digits accepted
pub const MAX_PIN_DIGITS: usize = 12;
/// Fewest PIN digits accepted
pub const MIN_PIN_DIGITS: usize = 4;

/// Structured server refusal, with the copied display strings' lengths
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerDenial {
    pub reason: DenyReason,
    pub ux_hint: UxHint,
    /// Bytes written to the caller's title buffer
    pub title_len: usize,
    /// Bytes written to the caller's description buffer
    pub description_len: usize,
    /// Either string was cut to fit its buffer
    pub truncated: bool,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecureSessionError {
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
    #[error("invalid parameter")]
    InvalidParameter,
    #[error("call unexpected in current state")]
    CallUnexpected,
    #[error("server denied the session: {0:?}")]
    ServerDeny(ServerDenial),
    #[error("server message could not be decoded")]
    MalformedServerMessage,
    #[error("PIN too short")]
    PinTooShort,
    #[error("PIN buffer full")]
    PinFull,
    #[error("no crypto API installed")]
    CryptoUnavailable,
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error("session error: {0}")]
    Session(#[from] CardreaderError),
    #[error("reentrant call from inside a callback")]
    Reentrant,
}

feature_error_conversions!(SecureSessionError);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    Valid,
    Invalid,
}

pub trait SecureSessionEvents {
    /// Forward these bytes to the payment server
    fn on_send_to_server(&mut self, data: &[u8]);
    fn on_session_event(&mut self, event: SessionEvent);
    fn on_pin_requested(&mut self, _card_info: &CardInfo, _can_bypass: bool, _final_attempt: bool) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionPhase {
    Idle,
    Establishing,
    AwaitingServer,
    AwaitingVerdict,
    Valid(SessionData),
    Invalid,
}

/// PIN digits, one per byte. Wiped on drop.
#[derive(Zeroize, ZeroizeOnDrop, Default)]
pub(crate) struct PinBuffer {
    digits: [u8; MAX_PIN_DIGITS],
    len: usize,
}

impl PinBuffer {
    fn push(&mut self, digit: u8) -> Result<(), SecureSessionError> {
        if digit > 9 {
            return Err(SecureSessionError::InvalidParameter);
        }
        if self.len == MAX_PIN_DIGITS {
            return Err(SecureSessionError::PinFull);
        }
        self.digits[self.len] = digit;
        self.len += 1;
        Ok(())
    }

    fn digits(&self) -> &[u8] {
        &self.digits[..self.len]
    }
}

struct PinWindow {
    format: PinBlockFormat,
    can_bypass: bool,
    timer: Option<TimerToken>,
}

fn filler_nibble(session: &SessionData, index: usize) -> u8 {
    let seed = session.session_id
        ^ session.reader_transaction_count.rotate_left(11)
        ^ session.reader_utc_epoch_time.rotate_left(22);
    (seed.rotate_left((index as u32 * 5) % 32) & 0x0F) as u8
}

/// ISO 9564 plaintext block; only the first `format.block_len()` bytes are used
fn build_pinblock(
    format: PinBlockFormat,
    digits: &[u8],
    session: &SessionData,
) -> Zeroizing<[u8; 16]> {
    let total = format.block_len() * 2;
    let mut nibbles = Zeroizing::new([0u8; 32]);
    nibbles[0] = match format {
        PinBlockFormat::Iso1 => 0x1,
        PinBlockFormat::Iso4 => 0x4,
    };
    nibbles[1] = digits.len() as u8;
    nibbles[2..2 + digits.len()].copy_from_slice(digits);
    for i in 2 + digits.len()..16 {
        nibbles[i] = match format {
            PinBlockFormat::Iso1 => filler_nibble(session, i),
            PinBlockFormat::Iso4 => 0xA,
        };
    }
    for i in 16..total {
        nibbles[i] = filler_nibble(session, i);
    }

    let mut block = Zeroizing::new([0u8; 16]);
    for (i, pair) in nibbles[..total].chunks(2).enumerate() {
        block[i] = (pair[0] << 4) | pair[1];
    }
    block
}

fn copy_truncated(src: &str, dst: &mut [u8]) -> (usize, bool) {
    let mut n = src.len().min(dst.len());
    while !src.is_char_boundary(n) {
        n -= 1;
    }
    dst[..n].copy_from_slice(&src.as_bytes()[..n]);
    (n, n < src.len())
}

pub(crate) struct SecureSessionState {
    link: CoreLink,
    events: RefCell<Box<dyn SecureSessionEvents>>,
    whitebox_key: Option<Zeroizing<Vec<u8>>>,
    phase: Cell<SessionPhase>,
    pin: RefCell<PinBuffer>,
    window: RefCell<Option<PinWindow>>,
}

impl SecureSessionState {
    fn session_data(&self) -> SessionData {
        match self.phase.get() {
            SessionPhase::Valid(data) => data,
            _ => SessionData::default(),
        }
    }

    fn pin_format(&self) -> PinBlockFormat {
        let flags = self.link.feature_flags();
        if flags.pinblock_format_4 && self.link.capability_supported(Capability::PinBlockFormat4) {
            PinBlockFormat::Iso4
        } else {
            PinBlockFormat::Iso1
        }
    }

    /// Wipe digits and close the entry window
    fn close_pin_window(&self) {
        self.pin.borrow_mut().zeroize();
        if let Some(window) = self.window.borrow_mut().take() {
            if let Some(token) = window.timer {
                self.link.stop_timer(token);
            }
        }
    }

    fn active_format(&self) -> Result<PinBlockFormat, SecureSessionError> {
        self.window
            .borrow()
            .as_ref()
            .map(|window| window.format)
            .ok_or(SecureSessionError::CallUnexpected)
    }

    fn seal_and_send(&self, format: PinBlockFormat, block: &[u8]) -> Result<(), SecureSessionError> {
        let crypto = self.link.crypto().ok_or(SecureSessionError::CryptoUnavailable)?;
        let key = self.whitebox_key.as_ref().map(|key| key.as_slice());
        let sealed = crypto.seal(key, block)?;
        let sealed: HVec<u8, MAX_SEALED_PINBLOCK> =
            HVec::from_slice(&sealed).map_err(|_| CryptoError)?;
        self.link.send(&SecureSessionRequest::PinBlock { format, sealed })?;
        info!("pinblock submitted ({format:?})");
        Ok(())
    }

    /// Seal and submit a complete plaintext block; PIN state is wiped either way
    fn submit_block(&self, format: PinBlockFormat, block: &[u8]) -> Result<(), SecureSessionError> {
        let result = self.seal_and_send(format, block);
        self.close_pin_window();
        result
    }

    fn on_pin_requested(&self, card_info: &CardInfo, can_bypass: bool, final_attempt: bool) {
        self.close_pin_window();
        let format = self.pin_format();
        let timer = if self.link.feature_flags().pin_entry_timeout {
            match self
                .link
                .start_timer(EndpointId::SECURE_SESSION, PIN_ENTRY_TIMEOUT_MS)
            {
                Ok(token) => Some(token),
                Err(err) => {
                    warn!("pin entry timer not started: {err}");
                    None
                }
            }
        } else {
            None
        };
        *self.window.borrow_mut() = Some(PinWindow {
            format,
            can_bypass,
            timer,
        });
        info!("pin requested ({format:?}, bypass {can_bypass}, final {final_attempt})");
        self.events
            .borrow_mut()
            .on_pin_requested(card_info, can_bypass, final_attempt);
    }
}

impl EndpointHandler for SecureSessionState {
    fn on_message(&self, msg: &Message) {
        let event = match SecureSessionEvent::from_message(msg) {
            Ok(event) => event,
            Err(err) => {
                warn!("undecodable secure session message {:#06x}: {err:?}", msg.msg_type);
                self.link
                    .reader_error(EndpointId::SECURE_SESSION, "malformed secure session message");
                return;
            }
        };

        match event {
            SecureSessionEvent::ServerRequest(data) => {
                debug!("validate request for server ({} bytes)", data.len());
                self.phase.set(SessionPhase::AwaitingServer);
                self.events.borrow_mut().on_send_to_server(&data);
            }
            SecureSessionEvent::SessionValid(data) => {
                info!("secure session {} valid", data.session_id);
                self.phase.set(SessionPhase::Valid(data));
                self.events.borrow_mut().on_session_event(SessionEvent::Valid);
            }
            SecureSessionEvent::SessionInvalid => {
                warn!("secure session invalid");
                self.phase.set(SessionPhase::Invalid);
                self.close_pin_window();
                self.events.borrow_mut().on_session_event(SessionEvent::Invalid);
            }
            SecureSessionEvent::PinRequested {
                card_info,
                can_bypass,
                final_attempt,
            } => self.on_pin_requested(&card_info, can_bypass, final_attempt),
        }
    }

    fn on_link_down(&self) {
        self.close_pin_window();
        self.phase.set(SessionPhase::Idle);
    }

    fn on_timer(&self, token: TimerToken) {
        let expired = self
            .window
            .borrow()
            .as_ref()
            .is_some_and(|window| window.timer == Some(token));
        if !expired {
            return;
        }
        if let Some(window) = self.window.borrow_mut().as_mut() {
            window.timer = None;
        }
        self.close_pin_window();
        self.link
            .report_error(EndpointId::SECURE_SESSION, "pin entry timed out");
    }
}

impl FeatureState for SecureSessionState {
    type Error = SecureSessionError;
    const NAME: &'static str = "securesession";
    const ENDPOINTS: &'static [EndpointId] = &[EndpointId::SECURE_SESSION];

    fn shutdown(&self) {
        self.close_pin_window();
    }
}

pub struct SecureSession {
    slot: FeatureSlot<SecureSessionState>,
    whitebox_key: Option<Zeroizing<Vec<u8>>>,
}

impl SecureSession {
    pub fn alloc() -> Self {
        Self {
            slot: FeatureSlot::new(),
            whitebox_key: None,
        }
    }

    /// Provision the whitebox key. Only allowed before the first init.
    pub fn set_whitebox_key(&mut self, key: &[u8]) -> Result<(), SecureSessionError> {
        if self.slot.lifecycle() != Lifecycle::Allocated {
            return Err(SecureSessionError::CallUnexpected);
        }
        if key.is_empty() {
            return Err(SecureSessionError::InvalidParameter);
        }
        self.whitebox_key = Some(Zeroizing::new(key.to_vec()));
        Ok(())
    }

    pub fn init(
        &mut self,
        reader: &Cardreader,
        events: Box<dyn SecureSessionEvents>,
    ) -> Result<(), SecureSessionError> {
        let whitebox_key = self.whitebox_key.clone();
        self.slot.init(reader, |link| SecureSessionState {
            link,
            events: RefCell::new(events),
            whitebox_key,
            phase: Cell::new(SessionPhase::Idle),
            pin: RefCell::new(PinBuffer::default()),
            window: RefCell::new(None),
        })
    }

    pub fn term(&mut self) -> Result<(), SecureSessionError> {
        self.slot.term()
    }

    pub fn free(&mut self) -> Result<(), SecureSessionError> {
        self.slot.free()?;
        self.whitebox_key = None;
        Ok(())
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.slot.lifecycle()
    }

    /// Start a session; a no-op while one is valid or being established
    pub fn establish_session(&self) -> Result<(), SecureSessionError> {
        let (_scope, bound) = self.slot.enter("securesession_establish_session")?;
        let state = &bound.state;
        match state.phase.get() {
            SessionPhase::Idle | SessionPhase::Invalid => {}
            phase => {
                debug!("establish while {phase:?}; nothing to do");
                return Ok(());
            }
        }
        if !bound.link.is_reader_ready() {
            return Err(SecureSessionError::CallUnexpected);
        }
        bound.link.send(&SecureSessionRequest::Establish)?;
        state.phase.set(SessionPhase::Establishing);
        Ok(())
    }

    /// Hand the server's reply to the reader
    ///
    /// On a denial the server's title and description are copied into the
    /// given buffers, cut at a character boundary if they do not fit, and the
    /// reader is told the exchange failed.
    pub fn process_server_message(
        &self,
        message: &[u8],
        title_out: &mut [u8],
        description_out: &mut [u8],
    ) -> Result<(), SecureSessionError> {
        let (_scope, bound) = self.slot.enter("securesession_process_server_message")?;
        let state = &bound.state;
        if state.phase.get() != SessionPhase::AwaitingServer {
            return Err(SecureSessionError::CallUnexpected);
        }

        let verdict: ServerVerdict = postcard::from_bytes(message)
            .map_err(|_| SecureSessionError::MalformedServerMessage)?;
        match verdict {
            ServerVerdict::Approved(payload) => {
                bound.link.send(&SecureSessionRequest::ServerResponse(payload))?;
                state.phase.set(SessionPhase::AwaitingVerdict);
                Ok(())
            }
            ServerVerdict::Denied {
                reason,
                ux_hint,
                title,
                description,
            } => {
                let (title_len, title_cut) = copy_truncated(&title, title_out);
                let (description_len, description_cut) =
                    copy_truncated(&description, description_out);
                warn!("server denied session: {reason:?} ({ux_hint:?})");
                bound.link.send(&SecureSessionRequest::ServerError)?;
                state.phase.set(SessionPhase::AwaitingVerdict);
                Err(SecureSessionError::ServerDeny(ServerDenial {
                    reason,
                    ux_hint,
                    title_len,
                    description_len,
                    truncated: title_cut || description_cut,
                }))
            }
        }
    }

    /// The host could not reach the server
    pub fn notify_server_error(&self) -> Result<(), SecureSessionError> {
        let (_scope, bound) = self.slot.enter("securesession_notify_server_error")?;
        if bound.state.phase.get() != SessionPhase::AwaitingServer {
            return Err(SecureSessionError::CallUnexpected);
        }
        bound.link.send(&SecureSessionRequest::ServerError)?;
        bound.state.phase.set(SessionPhase::AwaitingVerdict);
        Ok(())
    }

    pub fn session_data(&self) -> Option<SessionData> {
        let state = self.slot.state()?;
        match state.phase.get() {
            SessionPhase::Valid(data) => Some(data),
            _ => None,
        }
    }

    /// Format the reader asked for in the open PIN window
    pub fn pin_block_format(&self) -> Option<PinBlockFormat> {
        self.slot.state()?.active_format().ok()
    }

    pub fn host_pin_add_digit_dispatch(&self, digit: u8) -> Result<(), SecureSessionError> {
        let (_scope, bound) = self.slot.enter("securesession_host_pin_add_digit")?;
        bound.state.active_format()?;
        bound.state.pin.borrow_mut().push(digit)
    }

    /// Clear digits entered so far; the window stays open
    pub fn host_pin_reset_dispatch(&self) -> Result<(), SecureSessionError> {
        let (_scope, bound) = self.slot.enter("securesession_host_pin_reset")?;
        bound.state.active_format()?;
        bound.state.pin.borrow_mut().zeroize();
        Ok(())
    }

    /// Build, seal and submit the pinblock from the digits entered
    pub fn finalize_and_submit_pinblock_dispatch(&self) -> Result<(), SecureSessionError> {
        let (_scope, bound) = self.slot.enter("securesession_finalize_pinblock")?;
        let state = &bound.state;
        let format = state.active_format()?;
        let block = {
            let pin = state.pin.borrow();
            if pin.len < MIN_PIN_DIGITS {
                return Err(SecureSessionError::PinTooShort);
            }
            build_pinblock(format, pin.digits(), &state.session_data())
        };
        state.submit_block(format, &block[..format.block_len()])
    }

    /// Submit an ISO 1 block the host built itself
    pub fn submit_pinv1block(&self, block: &[u8]) -> Result<(), SecureSessionError> {
        self.submit_preformatted("securesession_submit_pinv1block", PinBlockFormat::Iso1, block)
    }

    /// Submit an ISO 4 block the host built itself
    pub fn submit_pinv4block(&self, block: &[u8]) -> Result<(), SecureSessionError> {
        self.submit_preformatted("securesession_submit_pinv4block", PinBlockFormat::Iso4, block)
    }

    /// Submit a host-built block in whichever format the window uses
    pub fn submit_pinblock_dispatch(&self, block: &[u8]) -> Result<(), SecureSessionError> {
        let format = self
            .pin_block_format()
            .ok_or(SecureSessionError::CallUnexpected)?;
        self.submit_preformatted("securesession_submit_pinblock", format, block)
    }

    fn submit_preformatted(
        &self,
        entry: &'static str,
        format: PinBlockFormat,
        block: &[u8],
    ) -> Result<(), SecureSessionError> {
        let (_scope, bound) = self.slot.enter(entry)?;
        if bound.state.active_format()? != format {
            return Err(SecureSessionError::CallUnexpected);
        }
        if block.len() != format.block_len() {
            return Err(SecureSessionError::InvalidParameter);
        }
        bound.state.submit_block(format, block)
    }

    /// Skip PIN entry, when the reader allowed it
    pub fn pin_bypass(&self) -> Result<(), SecureSessionError> {
        let (_scope, bound) = self.slot.enter("securesession_pin_bypass")?;
        let state = &bound.state;
        let allowed = state
            .window
            .borrow()
            .as_ref()
            .is_some_and(|window| window.can_bypass);
        if !allowed {
            return Err(SecureSessionError::CallUnexpected);
        }
        let result = bound.link.send(&SecureSessionRequest::PinBypass);
        state.close_pin_window();
        info!("pin bypassed");
        result.map_err(SecureSessionError::from)
    }

    #[cfg(test)]
    fn pin_buffer_bytes(&self) -> Vec<u8> {
        self.slot
            .state()
            .map(|state| {
                let pin = state.pin.borrow();
                let mut bytes = pin.digits.to_vec();
                bytes.extend_from_slice(&pin.len.to_le_bytes());
                bytes
            })
            .unwrap_or_default()
    }
}
