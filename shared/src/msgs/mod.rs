//! Typed message sets, one module per endpoint.
//!
//! Each module defines a `*Request` enum (host to reader) and/or an `*Event`
//! enum (reader to host) implementing [`AppMessage`](crate::protocol::AppMessage).

pub mod eventlog;
pub mod firmware_update;
pub mod payment;
pub mod power;
pub mod securesession;
pub mod system;
pub mod user_interaction;
