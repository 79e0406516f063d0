//! Endpoint dispatch table.

use std::collections::HashMap;
use std::rc::Rc;

use cardreader_shared::{EndpointId, Message, TimerToken};

use crate::error::CardreaderError;

/// What a feature exposes to the core's dispatcher
///
/// Handlers are always called with no core state borrowed, so they are free
/// to call back into core services (send, timers, error reporting).
pub(crate) trait EndpointHandler {
    fn on_message(&self, msg: &Message);

    /// Initial handshake finished
    fn on_reader_ready(&self) {}

    /// Reader unplugged; drop outstanding requests
    fn on_link_down(&self) {}

    /// A timer started by this feature fired
    fn on_timer(&self, _token: TimerToken) {}
}

#[derive(Default)]
pub(crate) struct Registry {
    handlers: HashMap<EndpointId, Rc<dyn EndpointHandler>>,
}

impl Registry {
    pub fn register(
        &mut self,
        endpoint: EndpointId,
        handler: Rc<dyn EndpointHandler>,
    ) -> Result<(), CardreaderError> {
        if endpoint == EndpointId::SYSTEM {
            return Err(CardreaderError::InvalidParameter);
        }
        if self.handlers.contains_key(&endpoint) {
            return Err(CardreaderError::EndpointAlreadyRegistered(endpoint));
        }
        self.handlers.insert(endpoint, handler);
        Ok(())
    }

    pub fn deregister(&mut self, endpoint: EndpointId) -> Result<(), CardreaderError> {
        self.handlers
            .remove(&endpoint)
            .map(|_| ())
            .ok_or(CardreaderError::EndpointNotRegistered(endpoint))
    }

    pub fn get(&self, endpoint: EndpointId) -> Option<Rc<dyn EndpointHandler>> {
        self.handlers.get(&endpoint).cloned()
    }

    pub fn contains(&self, endpoint: EndpointId) -> bool {
        self.handlers.contains_key(&endpoint)
    }

    /// Distinct features, each once even if it owns several endpoints
    pub fn features(&self) -> Vec<Rc<dyn EndpointHandler>> {
        let mut endpoints: Vec<_> = self.handlers.keys().copied().collect();
        endpoints.sort();

        let mut out: Vec<Rc<dyn EndpointHandler>> = Vec::new();
        for endpoint in endpoints {
            if let Some(handler) = self.handlers.get(&endpoint) {
                if !out.iter().any(|seen| Rc::ptr_eq(seen, handler)) {
                    out.push(Rc::clone(handler));
                }
            }
        }
        out
    }

    /// Number of distinct registered features
    pub fn feature_count(&self) -> usize {
        self.features().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Nop;

    impl EndpointHandler for Nop {
        fn on_message(&self, _msg: &Message) {}
    }

    #[test]
    fn test_double_registration_rejected() {
        let mut registry = Registry::default();
        registry.register(EndpointId::POWER, Rc::new(Nop)).unwrap();
        assert_eq!(
            registry.register(EndpointId::POWER, Rc::new(Nop)).err(),
            Some(CardreaderError::EndpointAlreadyRegistered(EndpointId::POWER))
        );
    }

    #[test]
    fn test_system_endpoint_reserved() {
        let mut registry = Registry::default();
        assert_eq!(
            registry.register(EndpointId::SYSTEM, Rc::new(Nop)).err(),
            Some(CardreaderError::InvalidParameter)
        );
    }

    #[test]
    fn test_multi_endpoint_feature_counted_once() {
        let mut registry = Registry::default();
        let shared: Rc<dyn EndpointHandler> = Rc::new(Nop);
        registry.register(EndpointId::EMV_FLOW, Rc::clone(&shared)).unwrap();
        registry.register(EndpointId::MAGSWIPE, Rc::clone(&shared)).unwrap();
        registry.register(EndpointId::POWER, Rc::new(Nop)).unwrap();
        assert_eq!(registry.feature_count(), 2);

        registry.deregister(EndpointId::EMV_FLOW).unwrap();
        assert!(!registry.contains(EndpointId::EMV_FLOW));
        assert_eq!(
            registry.deregister(EndpointId::EMV_FLOW),
            Err(CardreaderError::EndpointNotRegistered(EndpointId::EMV_FLOW))
        );
    }
}
