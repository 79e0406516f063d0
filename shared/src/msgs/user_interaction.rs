//! User interaction endpoint.

use serde::{Deserialize, Serialize};

use crate::protocol::{AppMessage, EndpointId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum UserInteractionRequest {
    /// Blink the reader's LEDs so a merchant can tell which one is connected
    IdentifyReader,
}

impl AppMessage for UserInteractionRequest {
    const ENDPOINT: EndpointId = EndpointId::USER_INTERACTION;

    fn msg_type(&self) -> u16 {
        match self {
            Self::IdentifyReader => 0x01,
        }
    }
}
