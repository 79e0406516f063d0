//! The four-phase alloc/init/term/free state machine shared by the core and
//! every feature.
//!
//! ```text
//!   alloc ──► Allocated ──init──► Initialized ──term──► Terminated ──free──► Freed
//!                 │                    ▲                     │
//!                 │                    └──────init───────────┘   (features only)
//!                 └───────────────────free──────────────────────────────► Freed
//! ```

use log::debug;

use crate::error::LifecycleError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Allocated,
    Initialized,
    Terminated,
    Freed,
}

impl Lifecycle {
    /// Move to `Initialized`. `reinit` allows starting again after a term.
    pub(crate) fn init(&mut self, what: &str, reinit: bool) -> Result<(), LifecycleError> {
        match *self {
            Self::Allocated => {}
            Self::Terminated if reinit => {}
            Self::Terminated => return Err(LifecycleError::AlreadyTerminated),
            Self::Initialized => return Err(LifecycleError::AlreadyInitialized),
            Self::Freed => return Err(LifecycleError::Freed),
        }
        debug!("{what}: initialized");
        *self = Self::Initialized;
        Ok(())
    }

    pub(crate) fn term(&mut self, what: &str) -> Result<(), LifecycleError> {
        match *self {
            Self::Initialized => {
                debug!("{what}: terminated");
                *self = Self::Terminated;
                Ok(())
            }
            Self::Allocated => Err(LifecycleError::NotInitialized),
            Self::Terminated => Err(LifecycleError::AlreadyTerminated),
            Self::Freed => Err(LifecycleError::Freed),
        }
    }

    pub(crate) fn free(&mut self, what: &str) -> Result<(), LifecycleError> {
        match *self {
            Self::Allocated | Self::Terminated => {
                debug!("{what}: freed");
                *self = Self::Freed;
                Ok(())
            }
            Self::Initialized => Err(LifecycleError::NotTerminated),
            Self::Freed => Err(LifecycleError::Freed),
        }
    }

    pub(crate) fn require_initialized(&self) -> Result<(), LifecycleError> {
        match self {
            Self::Initialized => Ok(()),
            Self::Freed => Err(LifecycleError::Freed),
            _ => Err(LifecycleError::NotInitialized),
        }
    }

    pub fn is_initialized(&self) -> bool {
        *self == Self::Initialized
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_sequence() {
        let mut lc = Lifecycle::Allocated;
        assert_eq!(lc.term("t"), Err(LifecycleError::NotInitialized));
        assert_eq!(lc.init("t", false), Ok(()));
        assert_eq!(lc.init("t", false), Err(LifecycleError::AlreadyInitialized));
        assert_eq!(lc.free("t"), Err(LifecycleError::NotTerminated));
        assert_eq!(lc.term("t"), Ok(()));
        assert_eq!(lc.term("t"), Err(LifecycleError::AlreadyTerminated));
        assert_eq!(lc.free("t"), Ok(()));
        assert_eq!(lc.free("t"), Err(LifecycleError::Freed));
    }

    #[test]
    fn test_reinit_only_when_allowed() {
        let mut lc = Lifecycle::Terminated;
        assert_eq!(lc.init("t", false), Err(LifecycleError::AlreadyTerminated));
        assert_eq!(lc.init("t", true), Ok(()));
        assert!(lc.is_initialized());
    }

    #[test]
    fn test_free_without_init() {
        let mut lc = Lifecycle::Allocated;
        assert_eq!(lc.require_initialized(), Err(LifecycleError::NotInitialized));
        assert_eq!(lc.free("t"), Ok(()));
        assert_eq!(lc.require_initialized(), Err(LifecycleError::Freed));
    }
}
