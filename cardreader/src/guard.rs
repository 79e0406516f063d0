//! Reentrancy guard.
//!
//! One guard is shared by a core and every feature bound to it. Each public
//! entry point enters the guard for its whole duration, so a host callback
//! that calls back into the library is rejected with [`Reentrant`] instead of
//! corrupting state mid-dispatch.

use std::cell::Cell;
use std::rc::Rc;

use log::error;

use crate::error::Reentrant;

#[derive(Debug, Clone, Default)]
pub struct ReentrancyGuard {
    busy: Rc<Cell<bool>>,
}

impl ReentrancyGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the library busy until the returned scope is dropped
    pub fn enter(&self, entry_point: &'static str) -> Result<GuardScope, Reentrant> {
        if self.busy.get() {
            error!("{entry_point} called from inside a callback; rejected");
            return Err(Reentrant);
        }
        self.busy.set(true);
        Ok(GuardScope {
            busy: Rc::clone(&self.busy),
        })
    }

    pub fn is_busy(&self) -> bool {
        self.busy.get()
    }
}

/// Releases the guard on drop
#[must_use]
pub struct GuardScope {
    busy: Rc<Cell<bool>>,
}

impl Drop for GuardScope {
    fn drop(&mut self) {
        self.busy.set(false);
    }
}
