//! # Cardreader Communications Core
//!
//! Host-side library that drives a payment reader over one physical link and
//! multiplexes independent protocol features over it.
//!
//! ## Architecture
//!
//! ```text
//!  host I/O ─► TransportBackend ─► Cardreader (core) ─► Registry
//!                                        │                 │
//!                                  link handshake    ┌─────┴──────┬──────────┬─────────┐
//!                                  timers / TX queue  Payment  SecureSession  Power   ...
//!                                                        │
//!                                                  PaymentEvents (host)
//! ```
//!
//! ## Threading
//!
//! Nothing here is `Send`. The core and every feature must be driven from one
//! serialized context, and no entry point may be called from inside a
//! callback the library is delivering; such calls fail with a `Reentrant`
//! error instead of corrupting state.
//!
//! ## Lifecycle
//!
//! The core and each feature follow `alloc → init → term → free`. Features
//! must be terminated before the core; a feature may be initialized again
//! after its own term, the core may not.

pub mod backend;
pub mod config;
pub mod crypto;
pub mod error;
pub mod features;
pub mod guard;
pub mod lifecycle;
pub mod reader;
mod registry;

#[cfg(test)]
mod testing;

pub use crate::config::{
    CardreaderConfig, CommsVersionResult, ErrorReporter, FeatureFlag, FeatureFlags, HostFeature,
    PaymentConfig,
};
pub use crate::crypto::{CryptoApi, CryptoError};
pub use crate::error::{CardreaderError, LifecycleError, Reentrant};
pub use crate::lifecycle::Lifecycle;
pub use crate::reader::{Cardreader, LinkStats, PROTOCOL_VERSIONS};

pub use cardreader_shared as shared;
