//! # Payment Feature
//!
//! Drives EMV chip and contactless payments, magnetic stripe swipes and TMN
//! e-money transactions. The feature owns the `EMV_FLOW`, `MAGSWIPE` and `TMN`
//! endpoints at once.
//!
//! ```text
//!   Idle ──start_payment──► Emv(InProgress) ◄──────────────┐
//!    ▲                        │ ApplicationSelection       │ select_*
//!    │                        ├──► SelectingApplication ───┤
//!    │                        ├──► SelectingAccountType ───┤
//!    │                        └──► AwaitingAuthorization ──┘ process_authorization_response
//!    │  Complete / swipe / link down
//!    └────────────────────────────────────────────────────
//!   Idle ──tmn_start_*──► Tmn(Polling) ─CardDetected─► Tmn(CardDetected)
//!                              ─WriteNotify─► Tmn(WriteNotify) ─ack─► Tmn(Committed)
//! ```
//!
//! Every attempt ends in exactly one terminal callback:
//! [`PaymentEvents::on_payment_complete`] for EMV and magswipe,
//! [`PaymentEvents::on_tmn_transaction_complete`] for TMN. Pulling the reader
//! mid transaction reports a `Terminated` result.
//!
//! The contactless side also serves loyalty (VAS) lookups and NDEF tag reads
//! and writes, each its own attempt with its own completion callback. Factory
//! MSR maintenance requests ride on the `MAGSWIPE` endpoint.
//!
//! Chip cards that fail to power up three times in a row are asked to swipe
//! instead; the next swipe then completes as
//! [`PaymentResult::MagswipeTechnicalFallback`]. Swipes of cards without a chip
//! complete as [`PaymentResult::Magswipe`] even when no payment was started.

mod contactless;
mod msr;
mod timings;
mod tmn;

use std::cell::{Cell, RefCell};
use std::time::{Duration, Instant};

use cardreader_shared::msgs::payment::{
    AccountType, CardAction, CardInfo, CardPresence, EmvComplete, EmvEvent, EmvRequest,
    LoyaltyResult, MagswipeEvent, MagswipeRequest, MerchantLoyaltyId, NdefApplicationType,
    NdefResult, PaymentApplication, PaymentResult, PaymentSource, StartPayment, StdMsg, Timestamp,
    TmnEvent, TmnResult, TransactionMode, TransactionType, VasProtocol, ADF_NAME_MAX,
    MAX_LOYALTY_IDS, MAX_PAYMENT_BLOB,
};
use cardreader_shared::{AppMessage, Capability, EndpointId, Message};
use heapless::Vec as HVec;
use log::{debug, info, warn};
use thiserror::Error;

use super::{FeatureSlot, FeatureState};
use crate::config::{PaymentConfig, MAGSWIPE_DUPLICATE_TIMEOUT_MS, MAX_ICC_FAILURES};
use crate::error::{feature_error_conversions, CardreaderError, LifecycleError};
use crate::lifecycle::Lifecycle;
use crate::reader::{Cardreader, CoreLink};
use crate::registry::EndpointHandler;

use contactless::NdefOp;
pub use timings::PaymentTiming;
use timings::Timings;
use tmn::TmnStep;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentError {
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
    #[error("invalid parameter")]
    InvalidParameter,
    #[error("call unexpected in current state")]
    CallUnexpected,
    #[error("application not offered by the card")]
    BadAdfName,
    #[error("account type not offered by the card")]
    InvalidAccountType,
    #[error("session error: {0}")]
    Session(#[from] CardreaderError),
    #[error("reentrant call from inside a callback")]
    Reentrant,
}

feature_error_conversions!(PaymentError);

/// Everything the host learns when an EMV or magswipe attempt ends
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentCompletion {
    pub result: PaymentResult,
    /// Clearing, reversal or swipe data for the payment server
    pub data: Vec<u8>,
    pub approved_offline: bool,
    pub card_info: CardInfo,
    pub std_msg: StdMsg,
    pub card_action: CardAction,
    pub timings: Vec<PaymentTiming>,
}

/// Payment callbacks. Only the two terminal callbacks must be implemented.
pub trait PaymentEvents {
    fn on_payment_complete(&mut self, completion: &PaymentCompletion);

    fn on_tmn_transaction_complete(&mut self, result: TmnResult, timings: &[PaymentTiming]);

    /// `will_continue` is true when a payment in progress survives the change
    fn on_card_presence_changed(
        &mut self,
        _last: CardPresence,
        _current: CardPresence,
        _will_continue: bool,
    ) {
    }

    fn on_card_action_required(&mut self, _action: CardAction, _std_msg: StdMsg) {}

    fn on_application_selection_required(&mut self, _applications: &[PaymentApplication]) {}

    fn on_account_type_selection_required(
        &mut self,
        _account_types: &[AccountType],
        _language_prefs: &[u16],
        _aid: &[u8],
    ) {
    }

    /// ARQC for the payment server
    fn on_emv_authorization_request(&mut self, _data: &[u8], _card_info: &CardInfo) {}

    fn on_contactless_emv_authorization_request(
        &mut self,
        _data: &[u8],
        _card_presence_required: bool,
        _card_info: &CardInfo,
    ) {
    }

    fn on_swipe_passthrough(&mut self, _data: &[u8], _card_info: &CardInfo, _source: PaymentSource) {}

    fn on_cardholder_name_received(&mut self, _card_info: &CardInfo) {}

    fn on_audio_visual_request(&mut self, _id: u16) {}

    fn on_tmn_data(&mut self, _transaction_id: &str, _data: &[u8]) {}

    fn on_tmn_authorization_request(&mut self, _data: &[u8]) {}

    fn on_tmn_write_notify(&mut self, _balance_before: u32, _amount: u32, _miryo_data: &[u8]) {}

    fn on_display_request(&mut self, _msg_id: u16, _amount: &str, _balance: &str) {}

    fn on_audio_request(&mut self, _audio_id: u16) {}

    /// `finished` is false when an authorization follows in the same attempt
    fn on_vas_response(
        &mut self,
        _protocol: VasProtocol,
        _result: LoyaltyResult,
        _finished: bool,
        _merchant_loyalty_id: &MerchantLoyaltyId,
        _data: &[u8],
    ) {
    }

    fn on_read_ndef_complete(
        &mut self,
        _application_type: NdefApplicationType,
        _merchant_id: &[u8],
        _card_id: &[u8],
        _card_type: u8,
        _result: NdefResult,
    ) {
    }

    fn on_write_ndef_complete(&mut self, _result: NdefResult) {}

    fn on_msr_health(&mut self, _source: PaymentSource, _status: u32) {}

    /// Configure or clear-configuration accepted
    fn on_msr_configure(&mut self, _source: PaymentSource) {}

    fn on_msr_error(&mut self, _source: PaymentSource) {}

    fn on_msr_dump(&mut self, _source: PaymentSource, _data: &[u8]) {}
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum EmvStep {
    InProgress,
    SelectingApplication(Vec<HVec<u8, ADF_NAME_MAX>>),
    SelectingAccountType(Vec<AccountType>),
    AwaitingAuthorization,
    Canceling,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Phase {
    Idle,
    Emv { step: EmvStep, mode: TransactionMode },
    Tmn(TmnStep),
    Vas { canceling: bool },
    Ndef(NdefOp),
}

struct LastSwipe {
    at: Instant,
    data: Vec<u8>,
}

pub(crate) struct PaymentState {
    link: CoreLink,
    events: RefCell<Box<dyn PaymentEvents>>,
    config: PaymentConfig,
    phase: RefCell<Phase>,
    card_presence: Cell<CardPresence>,
    icc_failures: Cell<u8>,
    fallback_armed: Cell<bool>,
    passthrough: Cell<bool>,
    last_swipe: RefCell<Option<LastSwipe>>,
    timings: RefCell<Timings>,
    /// Mode the next `start_payment` runs in
    mode: Cell<TransactionMode>,
    loyalty_ids: RefCell<HVec<MerchantLoyaltyId, MAX_LOYALTY_IDS>>,
    msr_pending: Cell<Option<MagswipeRequest>>,
}

impl PaymentState {
    fn new(link: CoreLink, events: Box<dyn PaymentEvents>, config: PaymentConfig) -> Self {
        Self {
            link,
            events: RefCell::new(events),
            config,
            phase: RefCell::new(Phase::Idle),
            card_presence: Cell::new(CardPresence::Unknown),
            icc_failures: Cell::new(0),
            fallback_armed: Cell::new(false),
            passthrough: Cell::new(false),
            last_swipe: RefCell::new(None),
            timings: RefCell::new(Timings::default()),
            mode: Cell::new(TransactionMode::Payment),
            loyalty_ids: RefCell::new(HVec::new()),
            msr_pending: Cell::new(None),
        }
    }

    /// New attempts need a ready reader and nothing else running
    fn require_idle(&self) -> Result<(), PaymentError> {
        if !self.link.is_reader_ready() || *self.phase.borrow() != Phase::Idle {
            return Err(PaymentError::CallUnexpected);
        }
        Ok(())
    }

    /// Close whatever attempt is running with its terminal callback
    fn abort_attempt(&self, reason: &str) {
        match self.phase.replace(Phase::Idle) {
            Phase::Idle => self.reset_fallback(),
            Phase::Emv { mode, .. } => {
                warn!("{mode:?} {reason}");
                self.finish_with(PaymentResult::Terminated, &[], CardInfo::default());
            }
            Phase::Tmn(step) => {
                warn!("TMN transaction {reason} in {step:?}");
                self.finish_tmn(TmnResult::Terminated);
            }
            Phase::Vas { .. } => {
                warn!("VAS request {reason}");
                self.finish_vas_terminated();
            }
            Phase::Ndef(op) => {
                warn!("NDEF operation {reason}");
                self.finish_ndef_terminated(op);
            }
        }
    }

    fn reset_fallback(&self) {
        self.icc_failures.set(0);
        self.fallback_armed.set(false);
    }

    fn emv_step(&self) -> Option<EmvStep> {
        match &*self.phase.borrow() {
            Phase::Emv { step, .. } => Some(step.clone()),
            _ => None,
        }
    }

    fn set_emv_step(&self, next: EmvStep) {
        if let Phase::Emv { step, .. } = &mut *self.phase.borrow_mut() {
            *step = next;
        }
    }

    fn is_emv_active(&self) -> bool {
        matches!(*self.phase.borrow(), Phase::Emv { .. })
    }

    /// Close the attempt and deliver its single terminal callback
    fn finish_payment(&self, mut completion: PaymentCompletion) {
        if let Phase::Emv { mode, .. } = self.phase.replace(Phase::Idle) {
            debug!("{mode:?} finished");
        }
        self.reset_fallback();
        {
            let mut timings = self.timings.borrow_mut();
            timings.mark("complete");
            completion.timings = timings.take();
        }
        info!("payment complete: {:?}", completion.result);
        self.events.borrow_mut().on_payment_complete(&completion);
    }

    fn finish_with(&self, result: PaymentResult, data: &[u8], card_info: CardInfo) {
        self.finish_payment(PaymentCompletion {
            result,
            data: data.to_vec(),
            approved_offline: false,
            card_info,
            std_msg: StdMsg::None,
            card_action: CardAction::None,
            timings: Vec::new(),
        });
    }

    fn on_emv_event(&self, event: EmvEvent) {
        match event {
            EmvEvent::CardPresence(current) => {
                let last = self.card_presence.replace(current);
                let will_continue = self.is_emv_active();
                debug!("card presence {last:?} -> {current:?}");
                self.events
                    .borrow_mut()
                    .on_card_presence_changed(last, current, will_continue);
            }
            EmvEvent::IccPowerFailure => self.on_icc_power_failure(),
            EmvEvent::CardAction { action, std_msg } => {
                self.events.borrow_mut().on_card_action_required(action, std_msg);
            }
            EmvEvent::ApplicationSelection(applications) => {
                if !self.is_emv_active() {
                    return self.unexpected("application selection outside a payment");
                }
                self.chip_progressed();
                let offered = applications.iter().map(|app| app.adf_name.clone()).collect();
                self.set_emv_step(EmvStep::SelectingApplication(offered));
                self.events
                    .borrow_mut()
                    .on_application_selection_required(&applications);
            }
            EmvEvent::AccountTypeSelection {
                account_types,
                language_prefs,
                aid,
            } => {
                if !self.is_emv_active() {
                    return self.unexpected("account type selection outside a payment");
                }
                self.chip_progressed();
                self.set_emv_step(EmvStep::SelectingAccountType(account_types.to_vec()));
                self.events.borrow_mut().on_account_type_selection_required(
                    &account_types,
                    &language_prefs,
                    &aid,
                );
            }
            EmvEvent::AuthorizationRequest {
                data,
                card_presence_required,
                contactless,
                card_info,
            } => {
                if !self.is_emv_active() {
                    return self.unexpected("authorization request outside a payment");
                }
                self.chip_progressed();
                self.set_emv_step(EmvStep::AwaitingAuthorization);
                self.timings.borrow_mut().mark("arqc");
                let mut events = self.events.borrow_mut();
                if contactless {
                    events.on_contactless_emv_authorization_request(
                        &data,
                        card_presence_required,
                        &card_info,
                    );
                } else {
                    events.on_emv_authorization_request(&data, &card_info);
                }
            }
            EmvEvent::CardholderName(card_info) => {
                self.chip_progressed();
                self.events.borrow_mut().on_cardholder_name_received(&card_info);
            }
            EmvEvent::AudioVisual(id) => self.events.borrow_mut().on_audio_visual_request(id),
            EmvEvent::VasResponse {
                protocol,
                result,
                finished,
                merchant_loyalty_id,
                data,
            } => self.on_vas_response(protocol, result, finished, &merchant_loyalty_id, &data),
            EmvEvent::NdefRead {
                application_type,
                merchant_id,
                card_id,
                card_type,
                result,
            } => self.on_ndef_read(application_type, &merchant_id, &card_id, card_type, result),
            EmvEvent::NdefWrite(result) => self.on_ndef_write(result),
            EmvEvent::Complete(complete) => {
                if !self.is_emv_active() {
                    return self.unexpected("payment completion outside a payment");
                }
                let EmvComplete {
                    result,
                    data,
                    approved_offline,
                    card_info,
                    std_msg,
                    card_action,
                } = complete;
                self.finish_payment(PaymentCompletion {
                    result,
                    data: data.to_vec(),
                    approved_offline,
                    card_info,
                    std_msg,
                    card_action,
                    timings: Vec::new(),
                });
            }
        }
    }

    /// The chip answered, so earlier power failures are no longer consecutive.
    /// Removal alone does not count: reinsertion is how the user retries.
    fn chip_progressed(&self) {
        if !self.fallback_armed.get() {
            self.icc_failures.set(0);
        }
    }

    fn on_icc_power_failure(&self) {
        let failures = self.icc_failures.get().saturating_add(1);
        self.icc_failures.set(failures);
        let (action, std_msg) = if failures >= MAX_ICC_FAILURES {
            info!("chip failed {failures} times; falling back to magswipe");
            self.fallback_armed.set(true);
            (CardAction::SwipeTechnical, StdMsg::UseMagStripe)
        } else {
            (CardAction::InsertAgain, StdMsg::TryAgain)
        };
        self.events.borrow_mut().on_card_action_required(action, std_msg);
    }

    fn is_duplicate_swipe(&self, data: &[u8]) -> bool {
        if !self.link.feature_flags().swipe_duplicate_suppression {
            return false;
        }
        let window = Duration::from_millis(MAGSWIPE_DUPLICATE_TIMEOUT_MS);
        let now = Instant::now();
        let mut last = self.last_swipe.borrow_mut();
        let duplicate = matches!(
            &*last,
            Some(prev) if prev.data == data && now.duration_since(prev.at) < window
        );
        *last = Some(LastSwipe {
            at: now,
            data: data.to_vec(),
        });
        duplicate
    }

    fn on_magswipe_event(&self, event: MagswipeEvent) {
        match event {
            MagswipeEvent::Swipe {
                data,
                card_info,
                has_icc,
                source,
            } => {
                if self.is_duplicate_swipe(&data) {
                    debug!("duplicate swipe suppressed");
                    return;
                }
                if self.passthrough.get() {
                    self.events
                        .borrow_mut()
                        .on_swipe_passthrough(&data, &card_info, source);
                    return;
                }
                if matches!(
                    *self.phase.borrow(),
                    Phase::Tmn(_) | Phase::Vas { .. } | Phase::Ndef(_)
                ) {
                    debug!("swipe ignored during contactless attempt");
                    return;
                }
                if self.fallback_armed.get() {
                    self.finish_with(PaymentResult::MagswipeTechnicalFallback, &data, card_info);
                } else if has_icc {
                    self.events
                        .borrow_mut()
                        .on_card_action_required(CardAction::Insert, StdMsg::UseChipReader);
                } else {
                    if !self.is_emv_active() {
                        self.timings.borrow_mut().start("swipe");
                    }
                    self.finish_with(PaymentResult::Magswipe, &data, card_info);
                }
            }
            MagswipeEvent::SwipeFailed { source } => {
                debug!("swipe failed on {source:?}");
                self.events
                    .borrow_mut()
                    .on_card_action_required(CardAction::SwipeAgain, StdMsg::TryAgain);
            }
            other => self.on_msr_event(other),
        }
    }

    fn unexpected(&self, what: &str) {
        warn!("{what}");
        self.link.reader_error(EndpointId::EMV_FLOW, what);
    }
}

impl EndpointHandler for PaymentState {
    fn on_message(&self, msg: &Message) {
        let decoded = match msg.endpoint {
            EndpointId::EMV_FLOW => EmvEvent::from_message(msg).map(|e| self.on_emv_event(e)),
            EndpointId::MAGSWIPE => {
                MagswipeEvent::from_message(msg).map(|e| self.on_magswipe_event(e))
            }
            EndpointId::TMN => TmnEvent::from_message(msg).map(|e| self.on_tmn_event(e)),
            other => {
                warn!("payment got message for {other}");
                return;
            }
        };
        if let Err(err) = decoded {
            warn!("undecodable payment message {:#06x}: {err:?}", msg.msg_type);
            self.link
                .reader_error(msg.endpoint, "malformed payment message");
        }
    }

    fn on_link_down(&self) {
        self.card_presence.set(CardPresence::Unknown);
        *self.last_swipe.borrow_mut() = None;
        self.msr_pending.set(None);
        self.abort_attempt("lost with the reader");
    }
}

impl FeatureState for PaymentState {
    type Error = PaymentError;
    const NAME: &'static str = "payment";
    const ENDPOINTS: &'static [EndpointId] =
        &[EndpointId::EMV_FLOW, EndpointId::MAGSWIPE, EndpointId::TMN];

    fn shutdown(&self) {
        self.msr_pending.set(None);
        self.abort_attempt("cut short by term");
    }
}

pub struct Payment {
    slot: FeatureSlot<PaymentState>,
}

impl Payment {
    pub fn alloc() -> Self {
        Self {
            slot: FeatureSlot::new(),
        }
    }

    pub fn init(
        &mut self,
        reader: &Cardreader,
        events: Box<dyn PaymentEvents>,
        config: PaymentConfig,
    ) -> Result<(), PaymentError> {
        self.slot
            .init(reader, |link| PaymentState::new(link, events, config))
    }

    pub fn term(&mut self) -> Result<(), PaymentError> {
        self.slot.term()
    }

    pub fn free(&mut self) -> Result<(), PaymentError> {
        self.slot.free()
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.slot.lifecycle()
    }

    fn begin_emv(
        &self,
        entry: &'static str,
        amount: u32,
        account_type: AccountType,
        transaction_type: TransactionType,
        mode: Option<TransactionMode>,
        timestamp: Timestamp,
    ) -> Result<(), PaymentError> {
        let (_scope, bound) = self.slot.enter(entry)?;
        let state = &bound.state;
        state.require_idle()?;
        let mode = mode.unwrap_or_else(|| state.mode.get());
        if !timestamp.is_valid() {
            return Err(PaymentError::InvalidParameter);
        }

        bound.link.send(&EmvRequest::Start(StartPayment {
            amount,
            currency_code: state.config.transaction_currency_code,
            mcc: state.config.mcc,
            account_type,
            transaction_type,
            mode,
            timestamp,
        }))?;
        state.reset_fallback();
        state.timings.borrow_mut().start("start");
        *state.phase.borrow_mut() = Phase::Emv {
            step: EmvStep::InProgress,
            mode,
        };
        info!("{mode:?} started, amount {amount}");
        Ok(())
    }

    pub fn start_payment(
        &self,
        amount: u32,
        account_type: AccountType,
        transaction_type: TransactionType,
        timestamp: Timestamp,
    ) -> Result<(), PaymentError> {
        self.begin_emv(
            "payment_start_payment",
            amount,
            account_type,
            transaction_type,
            None,
            timestamp,
        )
    }

    /// Read the card without charging it; completes as `CardInfoComplete`
    pub fn get_card_info(&self, timestamp: Timestamp) -> Result<(), PaymentError> {
        self.begin_emv(
            "payment_get_card_info",
            0,
            AccountType::Default,
            TransactionType::Purchase,
            Some(TransactionMode::CardInfo),
            timestamp,
        )
    }

    /// Mode for the following `start_payment` calls; kept until changed
    pub fn set_payment_transaction_mode(&self, mode: TransactionMode) -> Result<(), PaymentError> {
        let (_scope, bound) = self.slot.enter("payment_set_payment_transaction_mode")?;
        if mode == TransactionMode::CardInfo {
            return Err(PaymentError::InvalidParameter);
        }
        if *bound.state.phase.borrow() != Phase::Idle {
            return Err(PaymentError::CallUnexpected);
        }
        debug!("transaction mode {mode:?}");
        bound.state.mode.set(mode);
        Ok(())
    }

    pub fn set_payment_store_and_forward(&self) -> Result<(), PaymentError> {
        self.set_payment_transaction_mode(TransactionMode::StoreAndForwardPayment)
    }

    /// Mode of the running attempt, or of the next one when idle
    pub fn get_payment_transaction_mode(&self) -> Result<TransactionMode, PaymentError> {
        let (_scope, bound) = self.slot.enter("payment_get_payment_transaction_mode")?;
        let state = &bound.state;
        let mode = match &*state.phase.borrow() {
            Phase::Emv { mode, .. } => *mode,
            _ => state.mode.get(),
        };
        Ok(mode)
    }

    /// The reader confirms with a `Canceled` completion. Also cancels a
    /// running VAS request.
    pub fn cancel_payment(&self) -> Result<(), PaymentError> {
        let (_scope, bound) = self.slot.enter("payment_cancel_payment")?;
        let cancelable = match &*bound.state.phase.borrow() {
            Phase::Emv { step, .. } => *step != EmvStep::Canceling,
            Phase::Vas { canceling } => !canceling,
            _ => false,
        };
        if !cancelable {
            return Err(PaymentError::CallUnexpected);
        }
        bound.link.send(&EmvRequest::Cancel)?;
        match &mut *bound.state.phase.borrow_mut() {
            Phase::Emv { step, .. } => *step = EmvStep::Canceling,
            Phase::Vas { canceling } => *canceling = true,
            _ => {}
        }
        Ok(())
    }

    pub fn select_application(&self, adf_name: &[u8]) -> Result<(), PaymentError> {
        let (_scope, bound) = self.slot.enter("payment_select_application")?;
        let Some(EmvStep::SelectingApplication(offered)) = bound.state.emv_step() else {
            return Err(PaymentError::CallUnexpected);
        };
        let Some(adf) = offered.into_iter().find(|name| name.as_slice() == adf_name) else {
            return Err(PaymentError::BadAdfName);
        };
        bound.link.send(&EmvRequest::SelectApplication(adf))?;
        bound.state.set_emv_step(EmvStep::InProgress);
        Ok(())
    }

    pub fn select_account_type(&self, account_type: AccountType) -> Result<(), PaymentError> {
        let (_scope, bound) = self.slot.enter("payment_select_account_type")?;
        let Some(EmvStep::SelectingAccountType(offered)) = bound.state.emv_step() else {
            return Err(PaymentError::CallUnexpected);
        };
        if !offered.contains(&account_type) {
            return Err(PaymentError::InvalidAccountType);
        }
        bound.link.send(&EmvRequest::SelectAccountType(account_type))?;
        bound.state.set_emv_step(EmvStep::InProgress);
        Ok(())
    }

    /// Hand the server's ARPC back to the card
    pub fn process_authorization_response(&self, arpc: &[u8]) -> Result<(), PaymentError> {
        let (_scope, bound) = self.slot.enter("payment_process_authorization_response")?;
        if bound.state.emv_step() != Some(EmvStep::AwaitingAuthorization) {
            return Err(PaymentError::CallUnexpected);
        }
        if arpc.len() > MAX_PAYMENT_BLOB {
            return Err(PaymentError::InvalidParameter);
        }
        let data = HVec::from_slice(arpc).map_err(|_| PaymentError::InvalidParameter)?;
        bound.link.send(&EmvRequest::AuthorizationResponse(data))?;
        bound.state.timings.borrow_mut().mark("arpc");
        bound.state.set_emv_step(EmvStep::InProgress);
        Ok(())
    }

    /// Ask the reader to report card presence; answered by
    /// `on_card_presence_changed`
    pub fn request_card_presence(&self) -> Result<(), PaymentError> {
        let (_scope, bound) = self.slot.enter("payment_request_card_presence")?;
        if !bound.link.is_reader_ready() {
            return Err(PaymentError::CallUnexpected);
        }
        bound.link.send(&EmvRequest::RequestCardPresence)?;
        Ok(())
    }

    pub fn last_known_card_presence(&self) -> Result<CardPresence, PaymentError> {
        let (_scope, bound) = self.slot.enter("payment_last_known_card_presence")?;
        Ok(bound.state.card_presence.get())
    }

    /// Route every swipe to `on_swipe_passthrough` instead of the payment flow
    pub fn enable_swipe_passthrough(&self, enabled: bool) -> Result<(), PaymentError> {
        let (_scope, bound) = self.slot.enter("payment_enable_swipe_passthrough")?;
        debug!("swipe passthrough {}", if enabled { "on" } else { "off" });
        bound.state.passthrough.set(enabled);
        Ok(())
    }

    /// Advisory; skipped silently for readers that do not understand it
    pub fn send_powerup_hint(&self, timeout_seconds: u32) -> Result<(), PaymentError> {
        let (_scope, bound) = self.slot.enter("payment_send_powerup_hint")?;
        if !bound.link.is_reader_ready() {
            return Err(PaymentError::CallUnexpected);
        }
        if !bound.link.capability_supported(Capability::PowerupHint) {
            debug!("reader ignores powerup hints");
            return Ok(());
        }
        bound.link.send(&EmvRequest::PowerupHint { timeout_seconds })?;
        Ok(())
    }
}
