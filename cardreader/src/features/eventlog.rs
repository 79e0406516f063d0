//! Event log feature. The reader pushes opaque log and profile chunks; the
//! host only listens, and can check where one record in a chunk ends.
//!
//! ```text
//!   num-param:  | id u16 LE | n u8 | n x u32 LE |      n <= 8
//!   legacy:     | id u16 LE | len u8 | len bytes |
//! ```

use std::cell::RefCell;

use cardreader_shared::msgs::eventlog::EventLogEvent;
use cardreader_shared::{AppMessage, Capability, EndpointId, Message};
use log::{debug, warn};
use thiserror::Error;

use super::{FeatureSlot, FeatureState};
use crate::error::{feature_error_conversions, CardreaderError, LifecycleError};
use crate::lifecycle::Lifecycle;
use crate::reader::{Cardreader, CoreLink};
use crate::registry::EndpointHandler;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventLogError {
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
    #[error("session error: {0}")]
    Session(#[from] CardreaderError),
    #[error("reentrant call from inside a callback")]
    Reentrant,
}

feature_error_conversions!(EventLogError);

const RECORD_HEADER_LEN: usize = 3;
const MAX_EVENT_PARAMS: usize = 8;
/// Erased flash reads back as all ones
const ERASED_EVENT_ID: u16 = 0xFFFF;

/// What sits at the head of an event log buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventBufferState {
    /// A whole record of `len` bytes
    Valid { len: usize },
    /// A record starts here but needs more bytes
    Incomplete,
    Invalid,
}

fn record_state(data: &[u8], num_param_encoding: bool) -> EventBufferState {
    let &[lo, hi, count, ..] = data else {
        return EventBufferState::Incomplete;
    };
    if u16::from_le_bytes([lo, hi]) == ERASED_EVENT_ID {
        return EventBufferState::Invalid;
    }
    let count = usize::from(count);
    let body = if num_param_encoding {
        if count > MAX_EVENT_PARAMS {
            return EventBufferState::Invalid;
        }
        count * 4
    } else {
        count
    };
    let len = RECORD_HEADER_LEN + body;
    if data.len() < len {
        EventBufferState::Incomplete
    } else {
        EventBufferState::Valid { len }
    }
}

pub trait EventLogEvents {
    fn on_data_received(&mut self, data: &[u8]);
    fn on_profile_received(&mut self, _data: &[u8]) {}
}

pub(crate) struct EventLogState {
    link: CoreLink,
    events: RefCell<Box<dyn EventLogEvents>>,
}

impl EndpointHandler for EventLogState {
    fn on_message(&self, msg: &Message) {
        match EventLogEvent::from_message(msg) {
            Ok(EventLogEvent::Data(data)) => {
                debug!("event log chunk ({} bytes)", data.len());
                self.events.borrow_mut().on_data_received(&data);
            }
            Ok(EventLogEvent::Profile(data)) => {
                debug!("event log profile ({} bytes)", data.len());
                self.events.borrow_mut().on_profile_received(&data);
            }
            Err(err) => {
                warn!("undecodable event log message {:#06x}: {err:?}", msg.msg_type);
                self.link.reader_error(EndpointId::EVENTLOG, "malformed event log message");
            }
        }
    }
}

impl FeatureState for EventLogState {
    type Error = EventLogError;
    const NAME: &'static str = "eventlog";
    const ENDPOINTS: &'static [EndpointId] = &[EndpointId::EVENTLOG];
}

pub struct EventLog {
    slot: FeatureSlot<EventLogState>,
}

impl EventLog {
    pub fn alloc() -> Self {
        Self {
            slot: FeatureSlot::new(),
        }
    }

    pub fn init(
        &mut self,
        reader: &Cardreader,
        events: Box<dyn EventLogEvents>,
    ) -> Result<(), EventLogError> {
        self.slot.init(reader, |link| EventLogState {
            link,
            events: RefCell::new(events),
        })
    }

    pub fn term(&mut self) -> Result<(), EventLogError> {
        self.slot.term()
    }

    pub fn free(&mut self) -> Result<(), EventLogError> {
        self.slot.free()
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.slot.lifecycle()
    }

    /// Whether log chunks use the numbered-parameter encoding
    pub fn uses_num_param_encoding(&self) -> Result<bool, EventLogError> {
        let (_scope, bound) = self.slot.enter("eventlog_uses_num_param_encoding")?;
        Ok(bound.link.capability_supported(Capability::EventLogNumParam))
    }

    /// Check the record at the head of `data` in the reader's encoding
    pub fn is_valid_event(&self, data: &[u8]) -> Result<EventBufferState, EventLogError> {
        let (_scope, bound) = self.slot.enter("eventlog_is_valid_event")?;
        let num_param = bound.link.capability_supported(Capability::EventLogNumParam);
        Ok(record_state(data, num_param))
    }
}
