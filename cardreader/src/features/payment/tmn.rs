//! TMN e-money transactions.
//!
//! Cancel is asymmetric. While the reader is still polling for a card a
//! cancel request stops it cleanly. Once a card is detected the transaction
//! can only be force terminated, and after the write notify has been
//! acknowledged the card has been charged and cancel is ignored.

use cardreader_shared::msgs::payment::{
    TmnBrand, TmnEvent, TmnRequest, TmnRequestType, TmnResult, TmnTransactionId,
    MAX_PAYMENT_BLOB, TMN_MAX_MIRYO_DATA, TMN_TRANSACTION_ID_LEN,
};
use cardreader_shared::{Capability, EndpointId};
use heapless::Vec as HVec;
use log::{debug, info, warn};

use super::{Payment, PaymentError, PaymentState, Phase};
use crate::features::Bound;
use crate::guard::GuardScope;

const MIRYO_ID_PREFIX: &str = "miryoCR";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum TmnStep {
    Polling,
    CardDetected,
    WriteNotify,
    /// Write notify acknowledged; the card has been written
    Committed,
    Canceling,
    Terminating,
}

fn parse_transaction_id(id: &str) -> Result<TmnTransactionId, PaymentError> {
    if id.len() != TMN_TRANSACTION_ID_LEN || !id.is_ascii() {
        return Err(PaymentError::InvalidParameter);
    }
    TmnTransactionId::try_from(id).map_err(|_| PaymentError::InvalidParameter)
}

impl PaymentState {
    fn tmn_step(&self) -> Option<TmnStep> {
        match &*self.phase.borrow() {
            Phase::Tmn(step) => Some(*step),
            _ => None,
        }
    }

    fn set_tmn_step(&self, step: TmnStep) {
        *self.phase.borrow_mut() = Phase::Tmn(step);
    }

    pub(super) fn finish_tmn(&self, result: TmnResult) {
        *self.phase.borrow_mut() = Phase::Idle;
        let timings = {
            let mut timings = self.timings.borrow_mut();
            timings.mark("complete");
            timings.take()
        };
        info!("TMN transaction complete: {result:?}");
        self.events
            .borrow_mut()
            .on_tmn_transaction_complete(result, &timings);
    }

    pub(super) fn on_tmn_event(&self, event: TmnEvent) {
        let Some(step) = self.tmn_step() else {
            warn!("TMN event outside a transaction");
            self.link
                .reader_error(EndpointId::TMN, "TMN event outside a transaction");
            return;
        };

        match event {
            TmnEvent::Data {
                transaction_id,
                data,
            } => {
                self.events.borrow_mut().on_tmn_data(&transaction_id, &data);
            }
            TmnEvent::CardDetected => {
                if step == TmnStep::Polling {
                    self.set_tmn_step(TmnStep::CardDetected);
                }
                self.timings.borrow_mut().mark("card");
            }
            TmnEvent::AuthorizationRequest(data) => {
                self.events.borrow_mut().on_tmn_authorization_request(&data);
            }
            TmnEvent::WriteNotify {
                balance_before,
                amount,
                miryo_data,
            } => {
                if matches!(step, TmnStep::Polling | TmnStep::CardDetected) {
                    self.set_tmn_step(TmnStep::WriteNotify);
                }
                self.events
                    .borrow_mut()
                    .on_tmn_write_notify(balance_before, amount, &miryo_data);
            }
            TmnEvent::Display {
                msg_id,
                amount,
                balance,
            } => {
                self.events
                    .borrow_mut()
                    .on_display_request(msg_id, &amount, &balance);
            }
            TmnEvent::Audio(id) => self.events.borrow_mut().on_audio_request(id),
            TmnEvent::Complete(result) => self.finish_tmn(result),
        }
    }
}

impl Payment {
    /// Entry checks shared by every TMN start
    fn tmn_begin(
        &self,
        entry: &'static str,
    ) -> Result<(GuardScope, &Bound<PaymentState>), PaymentError> {
        let (scope, bound) = self.slot.enter(entry)?;
        if !bound.link.feature_flags().tmn
            || !bound.link.is_reader_ready()
            || !bound.link.capability_supported(Capability::Tmn)
            || *bound.state.phase.borrow() != Phase::Idle
        {
            return Err(PaymentError::CallUnexpected);
        }
        Ok((scope, bound))
    }

    fn tmn_start(
        &self,
        entry: &'static str,
        request_type: TmnRequestType,
        id: &str,
        brand: TmnBrand,
        amount: u32,
        prev_transaction_id: Option<&str>,
    ) -> Result<(), PaymentError> {
        let (_scope, bound) = self.tmn_begin(entry)?;
        let transaction_id = parse_transaction_id(id)?;
        let prev_transaction_id = prev_transaction_id.map(parse_transaction_id).transpose()?;

        bound.link.send(&TmnRequest::Start {
            request_type,
            transaction_id,
            brand,
            amount,
            prev_transaction_id,
        })?;
        bound.state.timings.borrow_mut().start("tmn start");
        bound.state.set_tmn_step(TmnStep::Polling);
        info!("TMN {request_type:?} started with {brand:?}");
        Ok(())
    }

    /// Purchase, refund or balance check
    pub fn tmn_start_transaction(
        &self,
        request_type: TmnRequestType,
        transaction_id: &str,
        brand: TmnBrand,
        amount: u32,
    ) -> Result<(), PaymentError> {
        if !matches!(
            request_type,
            TmnRequestType::Transaction | TmnRequestType::Refund | TmnRequestType::CheckBalance
        ) {
            return Err(PaymentError::InvalidParameter);
        }
        self.tmn_start(
            "payment_tmn_start_transaction",
            request_type,
            transaction_id,
            brand,
            amount,
            None,
        )
    }

    /// Ask the card how an earlier transaction ended
    pub fn tmn_check_result(
        &self,
        transaction_id: &str,
        brand: TmnBrand,
        prev_transaction_id: &str,
    ) -> Result<(), PaymentError> {
        self.tmn_start(
            "payment_tmn_check_result",
            TmnRequestType::CheckResult,
            transaction_id,
            brand,
            0,
            Some(prev_transaction_id),
        )
    }

    pub fn tmn_void_unknown(
        &self,
        transaction_id: &str,
        brand: TmnBrand,
        prev_transaction_id: &str,
    ) -> Result<(), PaymentError> {
        self.tmn_start(
            "payment_tmn_void_unknown",
            TmnRequestType::VoidUnknown,
            transaction_id,
            brand,
            0,
            Some(prev_transaction_id),
        )
    }

    /// Resolve a transaction whose outcome was never learned. Miryo ids carry
    /// a fixed prefix.
    pub fn tmn_start_miryo(
        &self,
        miryo_data: &[u8],
        miryo_transaction_id: &str,
    ) -> Result<(), PaymentError> {
        let (_scope, bound) = self.tmn_begin("payment_tmn_start_miryo")?;
        if !miryo_transaction_id.starts_with(MIRYO_ID_PREFIX) || miryo_data.is_empty() {
            return Err(PaymentError::InvalidParameter);
        }
        let transaction_id = parse_transaction_id(miryo_transaction_id)?;
        let miryo_data: HVec<u8, TMN_MAX_MIRYO_DATA> =
            HVec::from_slice(miryo_data).map_err(|_| PaymentError::InvalidParameter)?;

        bound.link.send(&TmnRequest::StartMiryo {
            transaction_id,
            miryo_data,
        })?;
        bound.state.timings.borrow_mut().start("miryo start");
        bound.state.set_tmn_step(TmnStep::Polling);
        Ok(())
    }

    /// Relay bytes from the TMN server
    pub fn tmn_send_bytes_to_reader(&self, data: &[u8]) -> Result<(), PaymentError> {
        let (_scope, bound) = self.slot.enter("payment_tmn_send_bytes_to_reader")?;
        match bound.state.tmn_step() {
            None | Some(TmnStep::Terminating) => return Err(PaymentError::CallUnexpected),
            Some(_) => {}
        }
        if data.len() > MAX_PAYMENT_BLOB {
            return Err(PaymentError::InvalidParameter);
        }
        let data = HVec::from_slice(data).map_err(|_| PaymentError::InvalidParameter)?;
        bound.link.send(&TmnRequest::Data(data))?;
        Ok(())
    }

    pub fn tmn_write_notify_ack(&self) -> Result<(), PaymentError> {
        let (_scope, bound) = self.slot.enter("payment_tmn_write_notify_ack")?;
        if bound.state.tmn_step() != Some(TmnStep::WriteNotify) {
            return Err(PaymentError::CallUnexpected);
        }
        bound.link.send(&TmnRequest::WriteNotifyAck)?;
        bound.state.set_tmn_step(TmnStep::Committed);
        Ok(())
    }

    /// The transaction still ends through `on_tmn_transaction_complete`
    pub fn tmn_cancel_request(&self) -> Result<(), PaymentError> {
        let (_scope, bound) = self.slot.enter("payment_tmn_cancel_request")?;
        match bound.state.tmn_step() {
            Some(TmnStep::Polling) => {
                bound.link.send(&TmnRequest::Cancel)?;
                bound.state.set_tmn_step(TmnStep::Canceling);
            }
            Some(TmnStep::CardDetected | TmnStep::WriteNotify) => {
                warn!("card already detected; force terminating TMN transaction");
                bound.link.send(&TmnRequest::ForceTerminate)?;
                bound.state.set_tmn_step(TmnStep::Terminating);
            }
            Some(TmnStep::Committed) => {
                info!("TMN cancel ignored; write notify already acknowledged");
            }
            Some(TmnStep::Canceling | TmnStep::Terminating) | None => {
                debug!("TMN cancel with nothing to cancel");
                return Err(PaymentError::CallUnexpected);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::setup_with;
    use super::*;
    use crate::config::FeatureFlags;
    use crate::testing::{default_capabilities, Harness, Recorder};
    use crate::Cardreader;

    const TXN: &str = "0123456789abcdef0123456789abcdef";
    const PREV: &str = "fedcba9876543210fedcba9876543210";
    const MIRYO: &str = "miryoCR0123456789abcdef012345678";

    fn setup() -> (Harness, Cardreader, Payment, Recorder) {
        let harness = Harness::new();
        let reader = harness.init_reader_with(FeatureFlags {
            tmn: true,
            ..FeatureFlags::default()
        });
        let mut caps = default_capabilities();
        caps.push(Capability::Tmn);
        harness.handshake(&reader, &caps);
        let (payment, recorder) = setup_with(&harness, &reader);
        (harness, reader, payment, recorder)
    }

    fn start(payment: &Payment) {
        payment
            .tmn_start_transaction(TmnRequestType::Transaction, TXN, TmnBrand::Suica, 300)
            .unwrap();
    }

    #[test]
    fn test_term_mid_tmn_reports_terminated() {
        let (_harness, _reader, mut payment, recorder) = setup();
        start(&payment);
        payment.term().unwrap();
        assert_eq!(recorder.events(), vec!["tmn complete Terminated"]);
    }

    #[test]
    fn test_tmn_requires_flag() {
        let harness = Harness::new();
        let reader = harness.ready_reader();
        let (payment, _recorder) = setup_with(&harness, &reader);
        assert_eq!(
            payment.tmn_start_transaction(TmnRequestType::Transaction, TXN, TmnBrand::Id, 1),
            Err(PaymentError::CallUnexpected)
        );
    }

    #[test]
    fn test_start_validation() {
        let (harness, _reader, payment, _recorder) = setup();
        assert_eq!(
            payment.tmn_start_transaction(TmnRequestType::Transaction, "short", TmnBrand::Id, 1),
            Err(PaymentError::InvalidParameter)
        );
        assert_eq!(
            payment.tmn_start_transaction(TmnRequestType::Miryo, TXN, TmnBrand::Id, 1),
            Err(PaymentError::InvalidParameter)
        );
        assert_eq!(
            payment.tmn_start_miryo(&[1, 2, 3], TXN),
            Err(PaymentError::InvalidParameter)
        );
        payment.tmn_start_miryo(&[1, 2, 3], MIRYO).unwrap();
        assert!(matches!(
            harness.sent::<TmnRequest>()[..],
            [TmnRequest::StartMiryo { .. }]
        ));
    }

    #[test]
    fn test_check_result_carries_previous_id() {
        let (harness, _reader, payment, _recorder) = setup();
        payment.tmn_check_result(TXN, TmnBrand::Waon, PREV).unwrap();
        match &harness.sent::<TmnRequest>()[..] {
            [TmnRequest::Start {
                request_type,
                prev_transaction_id: Some(prev),
                ..
            }] => {
                assert_eq!(*request_type, TmnRequestType::CheckResult);
                assert_eq!(prev.as_str(), PREV);
            }
            other => panic!("unexpected requests {other:?}"),
        }
        assert_eq!(
            payment.tmn_void_unknown(TXN, TmnBrand::Waon, PREV),
            Err(PaymentError::CallUnexpected)
        );
    }

    #[test]
    fn test_cancel_while_polling() {
        let (harness, reader, payment, recorder) = setup();
        start(&payment);
        payment.tmn_cancel_request().unwrap();
        assert_eq!(payment.tmn_cancel_request(), Err(PaymentError::CallUnexpected));
        harness.feed(&reader, &TmnEvent::Complete(TmnResult::Canceled));
        assert_eq!(recorder.events(), vec!["tmn complete Canceled"]);
        assert_eq!(harness.sent::<TmnRequest>()[1], TmnRequest::Cancel);
    }

    #[test]
    fn test_cancel_after_card_detected_force_terminates() {
        let (harness, reader, payment, _recorder) = setup();
        start(&payment);
        harness.feed(&reader, &TmnEvent::CardDetected);
        payment.tmn_cancel_request().unwrap();
        assert_eq!(harness.sent::<TmnRequest>()[1], TmnRequest::ForceTerminate);
        assert_eq!(
            payment.tmn_send_bytes_to_reader(&[1]),
            Err(PaymentError::CallUnexpected)
        );
    }

    #[test]
    fn test_cancel_after_write_notify_ack_ignored() {
        let (harness, reader, payment, recorder) = setup();
        start(&payment);
        assert_eq!(payment.tmn_write_notify_ack(), Err(PaymentError::CallUnexpected));
        harness.feed(&reader, &TmnEvent::CardDetected);
        harness.feed(
            &reader,
            &TmnEvent::WriteNotify {
                balance_before: 1000,
                amount: 300,
                miryo_data: HVec::new(),
            },
        );
        payment.tmn_write_notify_ack().unwrap();
        payment.tmn_cancel_request().unwrap();
        harness.feed(&reader, &TmnEvent::Complete(TmnResult::Success));

        assert_eq!(
            recorder.events(),
            vec!["write notify 300", "tmn complete Success"]
        );
        let sent = harness.sent::<TmnRequest>();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1], TmnRequest::WriteNotifyAck);
    }

    #[test]
    fn test_unplug_terminates_tmn() {
        let (_harness, reader, payment, recorder) = setup();
        start(&payment);
        reader.notify_reader_unplugged().unwrap();
        assert_eq!(recorder.events(), vec!["tmn complete Terminated"]);
        assert_eq!(payment.tmn_cancel_request(), Err(PaymentError::CallUnexpected));
    }

    #[test]
    fn test_tmn_event_outside_transaction() {
        let (harness, reader, _payment, recorder) = setup();
        harness.feed(&reader, &TmnEvent::CardDetected);
        assert!(recorder.events().is_empty());
        assert_eq!(harness.errors().len(), 1);
    }
}
