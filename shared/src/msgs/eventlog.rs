//! Event log endpoint. Reader pushes opaque log chunks; the host never asks.

use heapless::Vec;
use serde::{Deserialize, Serialize};

use crate::protocol::{AppMessage, EndpointId};

/// Largest log chunk in one message
pub const MAX_EVENTLOG_CHUNK: usize = 512;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventLogEvent {
    Data(Vec<u8, MAX_EVENTLOG_CHUNK>),
    Profile(Vec<u8, MAX_EVENTLOG_CHUNK>),
}

impl AppMessage for EventLogEvent {
    const ENDPOINT: EndpointId = EndpointId::EVENTLOG;

    fn msg_type(&self) -> u16 {
        match self {
            Self::Data(_) => 0x81,
            Self::Profile(_) => 0x82,
        }
    }
}
