//! Loyalty (VAS) lookups and NDEF tag access over the contactless antenna.
//!
//! Both run as attempts of their own: the phase leaves `Idle` when the request
//! goes out and returns there with exactly one completion callback.

use cardreader_shared::msgs::payment::{
    EmvRequest, LoyaltyResult, MerchantLoyaltyId, NdefApplicationType, NdefResult, VasProtocol,
    LOYALTY_URL_MAX, MAX_LOYALTY_IDS, MERCHANT_LOYALTY_ID_LEN, NDEF_CARD_ID_MAX,
    NDEF_MERCHANT_ID_MAX,
};
use heapless::{String, Vec as HVec};
use log::{debug, info};

use super::{Payment, PaymentError, PaymentState, Phase};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) enum NdefOp {
    Read {
        application_type: NdefApplicationType,
        merchant_id: HVec<u8, NDEF_MERCHANT_ID_MAX>,
    },
    Write,
}

impl PaymentState {
    pub(super) fn on_vas_response(
        &self,
        protocol: VasProtocol,
        result: LoyaltyResult,
        finished: bool,
        merchant_loyalty_id: &MerchantLoyaltyId,
        data: &[u8],
    ) {
        let ends = match *self.phase.borrow() {
            Phase::Vas { .. } => Some(finished),
            // Combined VAS and payment modes keep the EMV attempt going
            Phase::Emv { .. } => Some(false),
            _ => None,
        };
        let Some(ends) = ends else {
            return self.unexpected("VAS response without a request");
        };
        if ends {
            *self.phase.borrow_mut() = Phase::Idle;
            info!("VAS request complete: {result:?}");
        }
        self.events.borrow_mut().on_vas_response(
            protocol,
            result,
            finished,
            merchant_loyalty_id,
            data,
        );
    }

    pub(super) fn finish_vas_terminated(&self) {
        self.events.borrow_mut().on_vas_response(
            VasProtocol::None,
            LoyaltyResult::Terminated,
            true,
            &[0; MERCHANT_LOYALTY_ID_LEN],
            &[],
        );
    }

    pub(super) fn on_ndef_read(
        &self,
        application_type: NdefApplicationType,
        merchant_id: &[u8],
        card_id: &[u8],
        card_type: u8,
        result: NdefResult,
    ) {
        if !matches!(*self.phase.borrow(), Phase::Ndef(NdefOp::Read { .. })) {
            return self.unexpected("NDEF read result without a read");
        }
        *self.phase.borrow_mut() = Phase::Idle;
        debug!("NDEF read {result:?}");
        self.events.borrow_mut().on_read_ndef_complete(
            application_type,
            merchant_id,
            card_id,
            card_type,
            result,
        );
    }

    pub(super) fn on_ndef_write(&self, result: NdefResult) {
        if *self.phase.borrow() != Phase::Ndef(NdefOp::Write) {
            return self.unexpected("NDEF write result without a write");
        }
        *self.phase.borrow_mut() = Phase::Idle;
        debug!("NDEF write {result:?}");
        self.events.borrow_mut().on_write_ndef_complete(result);
    }

    pub(super) fn finish_ndef_terminated(&self, op: NdefOp) {
        let mut events = self.events.borrow_mut();
        match op {
            NdefOp::Read {
                application_type,
                merchant_id,
            } => events.on_read_ndef_complete(
                application_type,
                &merchant_id,
                &[],
                0,
                NdefResult::Terminated,
            ),
            NdefOp::Write => events.on_write_ndef_complete(NdefResult::Terminated),
        }
    }
}

impl Payment {
    /// URL the wallet pushes to the buyer's phone for this merchant
    pub fn set_loyalty_url_info(
        &self,
        merchant_loyalty_id: &MerchantLoyaltyId,
        url: &str,
    ) -> Result<(), PaymentError> {
        let (_scope, bound) = self.slot.enter("payment_set_loyalty_url_info")?;
        let url = String::<LOYALTY_URL_MAX>::try_from(url)
            .map_err(|_| PaymentError::InvalidParameter)?;
        if !bound.link.is_reader_ready() {
            return Err(PaymentError::CallUnexpected);
        }
        bound.link.send(&EmvRequest::SetLoyaltyUrl {
            merchant_loyalty_id: *merchant_loyalty_id,
            url,
        })?;
        Ok(())
    }

    pub fn set_loyalty_vas_info(&self, ids: &[MerchantLoyaltyId]) -> Result<(), PaymentError> {
        let (_scope, bound) = self.slot.enter("payment_set_loyalty_vas_info")?;
        if ids.is_empty() {
            return Err(PaymentError::InvalidParameter);
        }
        let ids = HVec::<_, MAX_LOYALTY_IDS>::from_slice(ids)
            .map_err(|_| PaymentError::InvalidParameter)?;
        bound.state.require_idle()?;
        bound.link.send(&EmvRequest::SetLoyaltyVas(ids.clone()))?;
        *bound.state.loyalty_ids.borrow_mut() = ids;
        Ok(())
    }

    /// Ask a tapped wallet for loyalty data only; ends with a finished
    /// `on_vas_response`
    pub fn get_vas_data(&self) -> Result<(), PaymentError> {
        let (_scope, bound) = self.slot.enter("payment_get_vas_data")?;
        let state = &bound.state;
        state.require_idle()?;
        if state.loyalty_ids.borrow().is_empty() {
            return Err(PaymentError::CallUnexpected);
        }
        bound.link.send(&EmvRequest::GetVasData)?;
        *state.phase.borrow_mut() = Phase::Vas { canceling: false };
        info!("VAS request started");
        Ok(())
    }

    pub fn read_ndef(
        &self,
        application_type: NdefApplicationType,
        merchant_id: &[u8],
    ) -> Result<(), PaymentError> {
        let (_scope, bound) = self.slot.enter("payment_read_ndef")?;
        let merchant_id =
            HVec::from_slice(merchant_id).map_err(|_| PaymentError::InvalidParameter)?;
        bound.state.require_idle()?;
        bound.link.send(&EmvRequest::ReadNdef {
            application_type,
            merchant_id: merchant_id.clone(),
        })?;
        *bound.state.phase.borrow_mut() = Phase::Ndef(NdefOp::Read {
            application_type,
            merchant_id,
        });
        Ok(())
    }

    pub fn write_ndef(
        &self,
        application_type: NdefApplicationType,
        merchant_id: &[u8],
        card_id: &[u8],
        card_type: u8,
        override_existing: bool,
    ) -> Result<(), PaymentError> {
        let (_scope, bound) = self.slot.enter("payment_write_ndef")?;
        let merchant_id =
            HVec::from_slice(merchant_id).map_err(|_| PaymentError::InvalidParameter)?;
        let card_id = HVec::<u8, NDEF_CARD_ID_MAX>::from_slice(card_id)
            .map_err(|_| PaymentError::InvalidParameter)?;
        bound.state.require_idle()?;
        bound.link.send(&EmvRequest::WriteNdef {
            application_type,
            merchant_id,
            card_id,
            card_type,
            override_existing,
        })?;
        *bound.state.phase.borrow_mut() = Phase::Ndef(NdefOp::Write);
        Ok(())
    }
}
