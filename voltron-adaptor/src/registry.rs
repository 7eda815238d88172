// Host registry
//
// Maps debugger host names to adaptor factories so the embedding debugger
// can construct the adaptor for whichever host it is running inside.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::adaptor::Adaptor;
use crate::deref::DerefLimits;
use crate::mock::{MockAdaptor, MOCK_HOST};

pub type AdaptorFactory = Box<dyn Fn(DerefLimits) -> Arc<dyn Adaptor> + Send + Sync>;

pub struct HostRegistry {
    factories: HashMap<String, AdaptorFactory>,
}

impl HostRegistry {
    /// An empty registry
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    pub fn register<F>(&mut self, host: &str, factory: F)
    where
        F: Fn(DerefLimits) -> Arc<dyn Adaptor> + Send + Sync + 'static,
    {
        debug!("Registering debugger host {}", host);
        self.factories.insert(host.to_string(), Box::new(factory));
    }

    /// Build a fresh adaptor for `host` that dereferences within `limits`
    pub fn create(&self, host: &str, limits: DerefLimits) -> Option<Arc<dyn Adaptor>> {
        self.factories.get(host).map(|factory| factory(limits))
    }

    /// Registered host names, sorted
    pub fn hosts(&self) -> Vec<String> {
        let mut hosts: Vec<String> = self.factories.keys().cloned().collect();
        hosts.sort();
        hosts
    }
}

impl Default for HostRegistry {
    fn default() -> Self {
        let mut registry = Self::new();
        registry.register(MOCK_HOST, |limits| Arc::new(MockAdaptor::demo().with_limits(limits)));
        registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_has_mock() {
        let registry = HostRegistry::default();
        assert_eq!(registry.hosts(), vec!["mock".to_string()]);

        let limits = DerefLimits {
            max_deref: 24,
            max_string: 128,
        };
        let adaptor = registry.create("mock", limits).unwrap();
        assert_eq!(adaptor.host(), "mock");
        assert_eq!(adaptor.deref_limits(), limits);
        assert!(registry.create("lldb", limits).is_none());
    }

    #[test]
    fn test_each_create_is_fresh() {
        let registry = HostRegistry::default();
        let a = registry.create("mock", DerefLimits::default()).unwrap();
        let b = registry.create("mock", DerefLimits::default()).unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
    }
}
