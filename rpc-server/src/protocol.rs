//! Request and response bodies carried in RPC frames.

use serde::{Deserialize, Serialize};

use crate::config::BackendKind;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RpcRequest {
    /// Allocate and initialize a core; `None` uses the server's backend
    Create { backend: Option<BackendKind> },
    Destroy,
    Plugged,
    Unplugged,
    /// Raw bytes read from the reader, still in link packaging
    FromReader(Vec<u8>),
    TimerExpired(u32),
    SendComplete,
    /// Command for the secure processor; the response comes back in `body`
    SeeCommand(Vec<u8>),
    ResetSpe,
    /// JSON counters in `body`
    Stats,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimerRequest {
    Start { token: u32, delay_ms: u32 },
    Stop { token: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RpcStatus {
    Ok,
    Failed(String),
}

/// Reply to one request, plus everything the core produced while handling it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcResponse {
    pub status: RpcStatus,
    /// Writes for the reader, in order
    pub to_reader: Vec<Vec<u8>>,
    pub timers: Vec<TimerRequest>,
    /// Host callbacks and reported errors, as log lines
    pub events: Vec<String>,
    pub body: Vec<u8>,
}

impl RpcResponse {
    pub fn is_ok(&self) -> bool {
        self.status == RpcStatus::Ok
    }
}
