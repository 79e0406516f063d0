//! User interaction feature. Currently a single fire-and-forget request.

use cardreader_shared::msgs::user_interaction::UserInteractionRequest;
use cardreader_shared::{EndpointId, Message};
use log::info;
use thiserror::Error;

use super::{FeatureSlot, FeatureState};
use crate::error::{feature_error_conversions, CardreaderError, LifecycleError};
use crate::lifecycle::Lifecycle;
use crate::reader::{Cardreader, CoreLink};
use crate::registry::EndpointHandler;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserInteractionError {
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
    #[error("call unexpected in current state")]
    CallUnexpected,
    #[error("session error: {0}")]
    Session(#[from] CardreaderError),
    #[error("reentrant call from inside a callback")]
    Reentrant,
}

feature_error_conversions!(UserInteractionError);

pub(crate) struct UserInteractionState {
    link: CoreLink,
}

impl EndpointHandler for UserInteractionState {
    fn on_message(&self, msg: &Message) {
        self.link.reader_error(
            EndpointId::USER_INTERACTION,
            &format!("unexpected user interaction message {:#06x}", msg.msg_type),
        );
    }
}

impl FeatureState for UserInteractionState {
    type Error = UserInteractionError;
    const NAME: &'static str = "user_interaction";
    const ENDPOINTS: &'static [EndpointId] = &[EndpointId::USER_INTERACTION];
}

pub struct UserInteraction {
    slot: FeatureSlot<UserInteractionState>,
}

impl UserInteraction {
    pub fn alloc() -> Self {
        Self {
            slot: FeatureSlot::new(),
        }
    }

    pub fn init(&mut self, reader: &Cardreader) -> Result<(), UserInteractionError> {
        self.slot.init(reader, |link| UserInteractionState { link })
    }

    pub fn term(&mut self) -> Result<(), UserInteractionError> {
        self.slot.term()
    }

    pub fn free(&mut self) -> Result<(), UserInteractionError> {
        self.slot.free()
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.slot.lifecycle()
    }

    /// Ask the reader to flash its lights
    pub fn identify_reader(&self) -> Result<(), UserInteractionError> {
        let (_scope, bound) = self.slot.enter("user_interaction_identify_reader")?;
        if !bound.link.is_reader_ready() {
            return Err(UserInteractionError::CallUnexpected);
        }
        info!("identifying reader");
        bound.link.send(&UserInteractionRequest::IdentifyReader)?;
        Ok(())
    }
}
