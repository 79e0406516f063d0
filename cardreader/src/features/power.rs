//! # Power Feature
//!
//! Battery queries, reset, power off and low-power-sleep timeout. Each request
//! kind may have one outstanding request; a second one before the reader
//! answers is `CallUnexpected`.

use std::cell::{Cell, RefCell};

use cardreader_shared::msgs::power::{BatteryStatus, PowerEvent, PowerRequest};
use cardreader_shared::{AppMessage, Capability, EndpointId, Message};
use log::{debug, info, warn};
use thiserror::Error;

use super::{FeatureSlot, FeatureState};
use crate::error::{feature_error_conversions, CardreaderError, LifecycleError};
use crate::lifecycle::Lifecycle;
use crate::reader::{Cardreader, CoreLink};
use crate::registry::EndpointHandler;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerError {
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
    #[error("invalid parameter")]
    InvalidParameter,
    #[error("call unexpected in current state")]
    CallUnexpected,
    #[error("reader does not support this request")]
    NotSupported,
    #[error("session error: {0}")]
    Session(#[from] CardreaderError),
    #[error("reentrant call from inside a callback")]
    Reentrant,
}

feature_error_conversions!(PowerError);

/// 12-bit battery ADC referenced to 3.3 V behind a 1:2 divider
const ADC_REFERENCE_VOLTS: f32 = 3.3;
const ADC_FULL_SCALE: f32 = 4095.0;
const BATTERY_DIVIDER_RATIO: f32 = 2.0;

/// Power callbacks. All default to no-ops.
pub trait PowerEvents {
    fn on_battery_voltage_response(&mut self, _status: BatteryStatus) {}
    fn on_battery_error(&mut self) {}
    fn on_reset_acknowledged(&mut self) {}
    fn on_off_acknowledged(&mut self) {}
    fn on_set_lps_timeout_acknowledged(&mut self) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestKind {
    Battery,
    Reset,
    Off,
    LpsTimeout,
}

impl RequestKind {
    const fn bit(self) -> u8 {
        1 << self as u8
    }
}

pub(crate) struct PowerState {
    link: CoreLink,
    events: RefCell<Box<dyn PowerEvents>>,
    pending: Cell<u8>,
}

impl PowerState {
    fn begin(&self, kind: RequestKind, request: &PowerRequest) -> Result<(), PowerError> {
        if self.pending.get() & kind.bit() != 0 {
            warn!("power {kind:?} already outstanding");
            return Err(PowerError::CallUnexpected);
        }
        self.link.send(request)?;
        self.pending.set(self.pending.get() | kind.bit());
        Ok(())
    }

    /// Clear the pending bit; false if nothing was outstanding
    fn resolve(&self, kind: RequestKind) -> bool {
        let pending = self.pending.get();
        self.pending.set(pending & !kind.bit());
        pending & kind.bit() != 0
    }
}

impl EndpointHandler for PowerState {
    fn on_message(&self, msg: &Message) {
        let event = match PowerEvent::from_message(msg) {
            Ok(event) => event,
            Err(err) => {
                warn!("undecodable power message {:#06x}: {err:?}", msg.msg_type);
                self.link.reader_error(EndpointId::POWER, "malformed power message");
                return;
            }
        };

        let kind = match event {
            PowerEvent::BatteryVoltage(_) | PowerEvent::BatteryError => RequestKind::Battery,
            PowerEvent::ResetAck => RequestKind::Reset,
            PowerEvent::OffAck => RequestKind::Off,
            PowerEvent::LpsTimeoutAck => RequestKind::LpsTimeout,
        };
        // Battery readings are also pushed unsolicited when the level changes
        if !self.resolve(kind) && kind != RequestKind::Battery {
            self.link
                .reader_error(EndpointId::POWER, &format!("unexpected {kind:?} acknowledgement"));
            return;
        }

        debug!("power event {event:?}");
        let mut events = self.events.borrow_mut();
        match event {
            PowerEvent::BatteryVoltage(status) => events.on_battery_voltage_response(status),
            PowerEvent::BatteryError => events.on_battery_error(),
            PowerEvent::ResetAck => events.on_reset_acknowledged(),
            PowerEvent::OffAck => events.on_off_acknowledged(),
            PowerEvent::LpsTimeoutAck => events.on_set_lps_timeout_acknowledged(),
        }
    }

    fn on_link_down(&self) {
        self.pending.set(0);
    }
}

impl FeatureState for PowerState {
    type Error = PowerError;
    const NAME: &'static str = "power";
    const ENDPOINTS: &'static [EndpointId] = &[EndpointId::POWER];
}

pub struct Power {
    slot: FeatureSlot<PowerState>,
}

impl Power {
    pub fn alloc() -> Self {
        Self {
            slot: FeatureSlot::new(),
        }
    }

    pub fn init(&mut self, reader: &Cardreader, events: Box<dyn PowerEvents>) -> Result<(), PowerError> {
        self.slot.init(reader, |link| PowerState {
            link,
            events: RefCell::new(events),
            pending: Cell::new(0),
        })
    }

    pub fn term(&mut self) -> Result<(), PowerError> {
        self.slot.term()
    }

    pub fn free(&mut self) -> Result<(), PowerError> {
        self.slot.free()
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.slot.lifecycle()
    }

    fn request(&self, entry: &'static str, kind: RequestKind, req: PowerRequest) -> Result<(), PowerError> {
        let (_scope, bound) = self.slot.enter(entry)?;
        if !bound.link.is_reader_ready() {
            return Err(PowerError::CallUnexpected);
        }
        bound.state.begin(kind, &req)
    }

    pub fn get_battery_voltage(&self) -> Result<(), PowerError> {
        self.request("power_get_battery_voltage", RequestKind::Battery, PowerRequest::GetBatteryVoltage)
    }

    pub fn reset(&self) -> Result<(), PowerError> {
        info!("requesting reader reset");
        self.request("power_reset", RequestKind::Reset, PowerRequest::Reset)
    }

    pub fn off(&self) -> Result<(), PowerError> {
        info!("requesting reader power off");
        self.request("power_off", RequestKind::Off, PowerRequest::Off)
    }

    /// Readers without the LPS timeout capability reject this locally
    pub fn set_lps_timeout(&self, timeout_ms: u32) -> Result<(), PowerError> {
        let (_scope, bound) = self.slot.enter("power_set_lps_timeout")?;
        if !bound.link.is_reader_ready() {
            return Err(PowerError::CallUnexpected);
        }
        if !bound.link.capability_supported(Capability::PowerLpsTimeout) {
            return Err(PowerError::NotSupported);
        }
        bound
            .state
            .begin(RequestKind::LpsTimeout, &PowerRequest::SetLpsTimeout { timeout_ms })
    }

    /// Battery volts for a raw ADC sample. Pure arithmetic, no reader traffic.
    pub fn convert_adc_value_to_voltage(&self, adc_value: f32) -> Result<f32, PowerError> {
        let (_scope, _bound) = self.slot.enter("power_convert_adc_value_to_voltage")?;
        if !adc_value.is_finite() || adc_value < 0.0 {
            return Err(PowerError::InvalidParameter);
        }
        Ok(adc_value * ADC_REFERENCE_VOLTS / ADC_FULL_SCALE * BATTERY_DIVIDER_RATIO)
    }
}
