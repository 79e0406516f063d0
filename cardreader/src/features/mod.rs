//! # Features
//!
//! Independently lifecycled protocol modules multiplexed over one core. Each
//! feature is a public handle (`Power`, `Payment`, ...) wrapping a
//! [`FeatureSlot`], which owns the lifecycle, the binding to the core and the
//! shared state the core dispatches into.
//!
//! ```text
//!   Power (handle)                         Cardreader
//!     └─ FeatureSlot ── Bound ── CoreLink ───► Weak<Core>
//!                         └─ Rc<PowerState> ◄── Registry[POWER]
//!                                   └─ Box<dyn PowerEvents> (host)
//! ```
//!
//! Request functions enter the shared reentrancy guard; dispatch into the
//! state happens while the core holds it, so host callbacks cannot re-enter.

pub mod eventlog;
pub mod firmware_update;
pub mod payment;
pub mod power;
pub mod securesession;
pub mod user_interaction;

use std::rc::Rc;

use cardreader_shared::EndpointId;
use log::warn;

use crate::error::{CardreaderError, LifecycleError, Reentrant};
use crate::guard::{GuardScope, ReentrancyGuard};
use crate::lifecycle::Lifecycle;
use crate::reader::{Cardreader, CoreLink};
use crate::registry::EndpointHandler;

/// Shared state of one feature, as the core sees it
pub(crate) trait FeatureState: EndpointHandler + 'static {
    type Error: From<Reentrant> + From<LifecycleError> + From<CardreaderError>;

    const NAME: &'static str;
    const ENDPOINTS: &'static [EndpointId];

    /// Stop timers and wipe secrets before the feature detaches
    fn shutdown(&self) {}
}

pub(crate) struct Bound<S> {
    pub link: CoreLink,
    pub state: Rc<S>,
}

/// Lifecycle plus core binding carried by every feature handle
pub(crate) struct FeatureSlot<S: FeatureState> {
    lifecycle: Lifecycle,
    guard: Option<ReentrancyGuard>,
    bound: Option<Bound<S>>,
}

impl<S: FeatureState> FeatureSlot<S> {
    pub fn new() -> Self {
        Self {
            lifecycle: Lifecycle::Allocated,
            guard: None,
            bound: None,
        }
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    pub fn state(&self) -> Option<&Rc<S>> {
        self.bound.as_ref().map(|bound| &bound.state)
    }

    /// Build the shared state and register it on the feature's endpoints
    pub fn init(
        &mut self,
        reader: &Cardreader,
        build: impl FnOnce(CoreLink) -> S,
    ) -> Result<(), S::Error> {
        let guard = reader.guard();
        let _scope = guard.enter(S::NAME)?;
        let mut lifecycle = self.lifecycle;
        lifecycle.init(S::NAME, true)?;

        let link = reader.link();
        let state = Rc::new(build(link.clone()));
        let handler: Rc<dyn EndpointHandler> = Rc::clone(&state) as Rc<dyn EndpointHandler>;
        link.register(S::ENDPOINTS, handler)?;
        // Late joiners see the same ready notification as early ones
        if link.is_reader_ready() {
            state.on_reader_ready();
        }

        self.lifecycle = lifecycle;
        self.bound = Some(Bound { link, state });
        self.guard = Some(guard.clone());
        Ok(())
    }

    /// Shut the state down and release the endpoints
    pub fn term(&mut self) -> Result<(), S::Error> {
        let _scope = self.enter_guard()?;
        let mut lifecycle = self.lifecycle;
        lifecycle.term(S::NAME)?;

        if let Some(bound) = self.bound.take() {
            bound.state.shutdown();
            bound.link.deregister(S::ENDPOINTS);
        }
        self.lifecycle = lifecycle;
        Ok(())
    }

    pub fn free(&mut self) -> Result<(), S::Error> {
        let _scope = self.enter_guard()?;
        let mut lifecycle = self.lifecycle;
        lifecycle.free(S::NAME)?;
        self.lifecycle = lifecycle;
        self.guard = None;
        Ok(())
    }

    /// Entry point for request functions: guard first, then lifecycle
    pub fn enter(&self, entry_point: &'static str) -> Result<(GuardScope, &Bound<S>), S::Error> {
        let scope = match &self.guard {
            Some(guard) => Some(guard.enter(entry_point)?),
            None => None,
        };
        self.lifecycle.require_initialized()?;
        match (scope, self.bound.as_ref()) {
            (Some(scope), Some(bound)) => Ok((scope, bound)),
            _ => Err(LifecycleError::NotInitialized.into()),
        }
    }

    fn enter_guard(&self) -> Result<Option<GuardScope>, S::Error> {
        match &self.guard {
            Some(guard) => Ok(Some(guard.enter(S::NAME)?)),
            None => Ok(None),
        }
    }
}

impl<S: FeatureState> Drop for FeatureSlot<S> {
    fn drop(&mut self) {
        if let Some(bound) = self.bound.take() {
            warn!("{} dropped while initialized; deregistering", S::NAME);
            bound.state.shutdown();
            bound.link.deregister(S::ENDPOINTS);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::user_interaction::{UserInteraction, UserInteractionError};
    use crate::testing::Harness;
    use crate::{CardreaderError, LifecycleError};

    #[test]
    fn test_feature_lifecycle_contract() {
        let harness = Harness::new();
        let reader = harness.ready_reader();
        let mut feature = UserInteraction::alloc();

        assert_eq!(
            feature.identify_reader(),
            Err(UserInteractionError::Lifecycle(LifecycleError::NotInitialized))
        );
        assert_eq!(
            feature.term(),
            Err(UserInteractionError::Lifecycle(LifecycleError::NotInitialized))
        );

        feature.init(&reader).unwrap();
        assert_eq!(
            feature.init(&reader),
            Err(UserInteractionError::Lifecycle(LifecycleError::AlreadyInitialized))
        );
        assert_eq!(
            feature.free(),
            Err(UserInteractionError::Lifecycle(LifecycleError::NotTerminated))
        );

        feature.term().unwrap();
        assert_eq!(
            feature.term(),
            Err(UserInteractionError::Lifecycle(LifecycleError::AlreadyTerminated))
        );

        // A terminated feature may start again against the same core
        feature.init(&reader).unwrap();
        feature.term().unwrap();
        feature.free().unwrap();
    }

    #[test]
    fn test_core_term_requires_features_terminated() {
        let harness = Harness::new();
        let mut reader = harness.ready_reader();
        let mut feature = UserInteraction::alloc();
        feature.init(&reader).unwrap();

        assert_eq!(reader.term(), Err(CardreaderError::FeaturesStillRegistered(1)));
        feature.term().unwrap();
        reader.term().unwrap();
    }

    #[test]
    fn test_drop_deregisters() {
        let harness = Harness::new();
        let reader = harness.ready_reader();
        {
            let mut feature = UserInteraction::alloc();
            feature.init(&reader).unwrap();
            assert!(reader.is_feature_enabled(cardreader_shared::EndpointId::USER_INTERACTION));
        }
        assert!(!reader.is_feature_enabled(cardreader_shared::EndpointId::USER_INTERACTION));
    }

    struct ReadyCounter(std::cell::Cell<u32>);

    impl crate::registry::EndpointHandler for ReadyCounter {
        fn on_message(&self, _msg: &cardreader_shared::Message) {}

        fn on_reader_ready(&self) {
            self.0.set(self.0.get() + 1);
        }
    }

    impl super::FeatureState for ReadyCounter {
        type Error = CardreaderError;
        const NAME: &'static str = "ready_counter";
        const ENDPOINTS: &'static [cardreader_shared::EndpointId] =
            &[cardreader_shared::EndpointId::USER_INTERACTION];
    }

    fn ready_count(slot: &super::FeatureSlot<ReadyCounter>) -> u32 {
        slot.state().map(|state| state.0.get()).unwrap_or(0)
    }

    #[test]
    fn test_reader_ready_reaches_early_and_late_features() {
        let harness = Harness::new();

        let early_reader = harness.init_reader();
        let mut early = super::FeatureSlot::<ReadyCounter>::new();
        early
            .init(&early_reader, |_| ReadyCounter(Default::default()))
            .unwrap();
        assert_eq!(ready_count(&early), 0);
        harness.handshake(&early_reader, &crate::testing::default_capabilities());
        assert_eq!(ready_count(&early), 1);
        early.term().unwrap();

        let late_harness = Harness::new();
        let late_reader = late_harness.ready_reader();
        let mut late = super::FeatureSlot::<ReadyCounter>::new();
        late.init(&late_reader, |_| ReadyCounter(Default::default()))
            .unwrap();
        assert_eq!(ready_count(&late), 1);

        // Replug: one more notification, not a replay of the first
        late_reader.notify_reader_unplugged().unwrap();
        late_harness.handshake(&late_reader, &crate::testing::default_capabilities());
        assert_eq!(ready_count(&late), 2);
        late.term().unwrap();
    }
}
