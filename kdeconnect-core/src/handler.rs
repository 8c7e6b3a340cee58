//! HandlerRegistry: capability handler factories keyed by capability
//! string, initialized once process-wide and shared across every Device.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::device::CapabilityHandler;
use crate::error::{CoreError, Result};

/// Produces a fresh handler instance for one device. Handlers are
/// per-device (a battery handler for phone A is a different object than
/// for phone B), so the registry stores factories, not instances.
pub trait HandlerFactory: Send + Sync {
    fn capability(&self) -> &str;
    fn create(&self) -> Box<dyn CapabilityHandler>;
}

/// The set of known capability handler factories.
#[derive(Default)]
pub struct HandlerRegistry {
    factories: HashMap<String, Arc<dyn HandlerFactory>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory for its capability. Fails if a factory is
    /// already registered for that capability — capability ownership is
    /// one-factory-per-string by design.
    pub fn register_factory(&mut self, factory: Arc<dyn HandlerFactory>) -> Result<()> {
        let capability = factory.capability().to_string();
        if self.factories.contains_key(&capability) {
            return Err(CoreError::DuplicateHandler {
                device_id: "<registry>".to_string(),
                capability,
            });
        }
        debug!(capability = %capability, "registered handler factory");
        self.factories.insert(capability, factory);
        Ok(())
    }

    pub fn unregister_factory(&mut self, capability: &str) {
        self.factories.remove(capability);
    }

    /// Build a fresh handler instance for `capability`, if a factory is
    /// registered for it.
    pub fn create_handler(&self, capability: &str) -> Option<Box<dyn CapabilityHandler>> {
        self.factories.get(capability).map(|f| f.create())
    }

    pub fn capabilities(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(|s| s.as_str())
    }
}
