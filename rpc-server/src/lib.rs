//! # Cardreader RPC Server
//!
//! Exposes the reader communications core over TCP so a process that cannot
//! link the library can still drive a reader. The client owns the physical
//! link and the timers; the server owns the core.
//!
//! ```text
//!   client ──RpcRequest──► serve() ──► Session ──► Cardreader
//!     ▲                                   │
//!     └────RpcResponse (to_reader bytes, timer requests, events)
//! ```
//!
//! Frames on the socket are a little-endian `u32` length followed by a
//! postcard body. One connection is one session; the core is not `Send`, so
//! every session runs on the thread that accepted it.

pub mod codec;
pub mod config;
pub mod error;
pub mod protocol;
pub mod server;
pub mod session;

pub use config::{BackendKind, LogLevel, ServerConfig, RPC_DEFAULT_PORT};
pub use error::RpcError;
pub use protocol::{RpcRequest, RpcResponse, RpcStatus, TimerRequest};
pub use session::{SeeApi, Session};
