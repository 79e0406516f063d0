//! Factory maintenance of the magnetic stripe heads.
//!
//! `PaymentSource::Default` addresses single-head readers; `Msr0` and `Msr1`
//! pick a head on readers with two. One request may be outstanding.

use cardreader_shared::msgs::payment::{MagswipeEvent, MagswipeRequest, PaymentSource};
use cardreader_shared::EndpointId;
use log::{debug, info, warn};

use super::{Payment, PaymentError, PaymentState};

impl PaymentState {
    pub(super) fn on_msr_event(&self, event: MagswipeEvent) {
        let Some(request) = self.msr_pending.take() else {
            warn!("MSR response with nothing outstanding");
            self.link
                .reader_error(EndpointId::MAGSWIPE, "MSR response with nothing outstanding");
            return;
        };
        debug!("MSR {request:?} answered");

        let mut events = self.events.borrow_mut();
        match event {
            MagswipeEvent::Health { source, status } => events.on_msr_health(source, status),
            MagswipeEvent::ConfigureAck { source } => events.on_msr_configure(source),
            MagswipeEvent::ConfigureError { source } => {
                warn!("MSR configuration rejected on {source:?}");
                events.on_msr_error(source);
            }
            MagswipeEvent::Dump { source, data } => events.on_msr_dump(source, &data),
            MagswipeEvent::Swipe { .. } | MagswipeEvent::SwipeFailed { .. } => {}
        }
    }
}

impl Payment {
    fn msr_request(&self, entry: &'static str, request: MagswipeRequest) -> Result<(), PaymentError> {
        let (_scope, bound) = self.slot.enter(entry)?;
        let state = &bound.state;
        state.require_idle()?;
        if let Some(pending) = state.msr_pending.get() {
            warn!("MSR {pending:?} still outstanding");
            return Err(PaymentError::CallUnexpected);
        }
        bound.link.send(&request)?;
        state.msr_pending.set(Some(request));
        info!("MSR {request:?}");
        Ok(())
    }

    /// Answered by `on_msr_health`
    pub fn msr_get_status(&self, source: PaymentSource) -> Result<(), PaymentError> {
        self.msr_request("payment_msr_get_status", MagswipeRequest::GetStatus(source))
    }

    pub fn msr_configure(&self, source: PaymentSource) -> Result<(), PaymentError> {
        self.msr_request("payment_msr_configure", MagswipeRequest::Configure(source))
    }

    pub fn msr_clear_configuration(&self, source: PaymentSource) -> Result<(), PaymentError> {
        self.msr_request(
            "payment_msr_clear_configuration",
            MagswipeRequest::ClearConfiguration(source),
        )
    }

    pub fn msr_dump(&self, source: PaymentSource) -> Result<(), PaymentError> {
        self.msr_request("payment_msr_dump", MagswipeRequest::Dump(source))
    }
}
