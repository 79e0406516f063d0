//! Error types shared by the core and every feature.

use cardreader_shared::{EndpointId, FrameError, TransportError};
use thiserror::Error;

/// Lifecycle misuse. Always a programming error on the caller's side.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleError {
    #[error("not initialized")]
    NotInitialized,
    #[error("already initialized")]
    AlreadyInitialized,
    #[error("not terminated")]
    NotTerminated,
    #[error("already terminated")]
    AlreadyTerminated,
    #[error("already freed")]
    Freed,
}

/// A public entry point was called from inside a callback the core was
/// delivering.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("reentrant call from inside a callback")]
pub struct Reentrant;

/// Result codes for [`Cardreader`](crate::Cardreader) operations and for the
/// core services features use.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardreaderError {
    #[error("invalid parameter")]
    InvalidParameter,
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
    #[error("endpoint {0} not registered")]
    EndpointNotRegistered(EndpointId),
    #[error("endpoint {0} already registered")]
    EndpointAlreadyRegistered(EndpointId),
    #[error("send queue full")]
    SendBackpressure,
    #[error("reader not connected")]
    NotConnected,
    #[error("comms error: {0:?}")]
    Comms(TransportError),
    #[error("decode failed: {0:?}")]
    DecodeFailed(FrameError),
    #[error("protocol versions incompatible")]
    ProtocolIncompatible,
    #[error("{0} feature(s) still registered")]
    FeaturesStillRegistered(usize),
    #[error("reentrant call from inside a callback")]
    Reentrant,
}

impl From<Reentrant> for CardreaderError {
    fn from(_: Reentrant) -> Self {
        Self::Reentrant
    }
}

impl From<TransportError> for CardreaderError {
    fn from(err: TransportError) -> Self {
        Self::Comms(err)
    }
}

impl From<FrameError> for CardreaderError {
    fn from(err: FrameError) -> Self {
        Self::DecodeFailed(err)
    }
}

/// Result type alias for core operations
pub type Result<T> = core::result::Result<T, CardreaderError>;

/// Implements the conversions every feature error enum needs so `?` works on
/// guard, lifecycle and core results alike.
macro_rules! feature_error_conversions {
    ($name:ident) => {
        impl From<$crate::error::Reentrant> for $name {
            fn from(_: $crate::error::Reentrant) -> Self {
                Self::Reentrant
            }
        }
    };
}

pub(crate) use feature_error_conversions;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_converts() {
        let err: CardreaderError = LifecycleError::NotTerminated.into();
        assert_eq!(err, CardreaderError::Lifecycle(LifecycleError::NotTerminated));
        assert_eq!(err.to_string(), "not terminated");
    }

    #[test]
    fn test_endpoint_in_message() {
        let err = CardreaderError::EndpointAlreadyRegistered(EndpointId::POWER);
        assert_eq!(err.to_string(), "endpoint power(0x01) already registered");
    }
}
