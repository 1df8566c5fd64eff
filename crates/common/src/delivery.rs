//! Delivery adapter contract: one adapter per push platform.
//!
//! Adapters are registered by platform in an [`AdapterRegistry`]; the
//! processor looks one up per device and records whatever it returns.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::DeliveryError;
use crate::types::{Device, NotificationContent, Platform};

/// A platform push transport (FCM, APNs, ...).
#[async_trait]
pub trait DeliveryAdapter: Send + Sync {
    /// Platform this adapter delivers to.
    fn platform(&self) -> Platform;

    /// Push `content` to `device`.
    ///
    /// `Ok` carries the opaque platform response stored in the ledger.
    async fn send(
        &self,
        device: &Device,
        content: &NotificationContent,
    ) -> Result<serde_json::Value, DeliveryError>;
}

/// Platform-keyed set of delivery adapters.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: HashMap<Platform, Arc<dyn DeliveryAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter under its own platform, replacing any previous one.
    pub fn register(&mut self, adapter: Arc<dyn DeliveryAdapter>) {
        self.adapters.insert(adapter.platform(), adapter);
    }

    pub fn with(mut self, adapter: Arc<dyn DeliveryAdapter>) -> Self {
        self.register(adapter);
        self
    }

    pub fn get(&self, platform: Platform) -> Option<Arc<dyn DeliveryAdapter>> {
        self.adapters.get(&platform).cloned()
    }

    pub fn platforms(&self) -> Vec<Platform> {
        self.adapters.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(Platform);

    #[async_trait]
    impl DeliveryAdapter for Fixed {
        fn platform(&self) -> Platform {
            self.0
        }

        async fn send(
            &self,
            _device: &Device,
            _content: &NotificationContent,
        ) -> Result<serde_json::Value, DeliveryError> {
            Ok(serde_json::json!({"platform": self.0.to_string()}))
        }
    }

    #[test]
    fn test_registry_lookup_by_platform() {
        let registry = AdapterRegistry::new().with(Arc::new(Fixed(Platform::Android)));
        assert!(registry.get(Platform::Android).is_some());
        assert!(registry.get(Platform::Ios).is_none());
        assert_eq!(registry.platforms(), vec![Platform::Android]);
    }
}
