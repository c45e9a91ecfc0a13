//! Plugin-based integration registry
//!
//! The registry allows range feeds, range stores and security boundaries to
//! be registered dynamically at runtime, avoiding hardcoded if-else chains.
//!
//! ## Registration
//!
//! Integration crates register themselves during initialization:
//!
//! ```rust,ignore
//! let registry = PluginRegistry::with_builtin_stores();
//! rangesync_feed_http::register(&registry);
//! rangesync_boundary_rest::register(&registry);
//!
//! let feed = registry.create_feed(&config.feed)?;
//! let store = registry.create_store(&config.store).await?;
//! let boundary = registry.create_boundary(&config.boundary)?;
//! ```

use crate::config::{BoundaryConfig, FeedConfig, StoreConfig};
use crate::error::{Error, Result};
use crate::store::{FileRangeStoreFactory, MemoryRangeStoreFactory};
use crate::traits::{RangeFeed, RangeStore, SecurityBoundary};
use crate::traits::{RangeFeedFactory, RangeStoreFactory, SecurityBoundaryFactory};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Registry for plugin-based integration creation
///
/// ## Thread Safety
///
/// The registry uses interior mutability with RwLock, allowing concurrent
/// reads and exclusive writes.
#[derive(Default)]
pub struct PluginRegistry {
    /// Registered range feed factories
    feeds: RwLock<HashMap<String, Box<dyn RangeFeedFactory>>>,

    /// Registered range store factories
    stores: RwLock<HashMap<String, Arc<dyn RangeStoreFactory>>>,

    /// Registered security boundary factories
    boundaries: RwLock<HashMap<String, Box<dyn SecurityBoundaryFactory>>>,
}

impl PluginRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry with the `memory` and `file` stores registered
    pub fn with_builtin_stores() -> Self {
        let registry = Self::new();
        registry.register_store("memory", Box::new(MemoryRangeStoreFactory));
        registry.register_store("file", Box::new(FileRangeStoreFactory));
        registry
    }

    /// Register a range feed factory
    ///
    /// # Parameters
    ///
    /// - `name`: Feed type name (e.g., "http")
    /// - `factory`: Factory object for creating feed instances
    pub fn register_feed(&self, name: impl Into<String>, factory: Box<dyn RangeFeedFactory>) {
        let mut feeds = self.feeds.write().unwrap_or_else(|e| e.into_inner());
        feeds.insert(name.into(), factory);
    }

    /// Register a range store factory
    pub fn register_store(&self, name: impl Into<String>, factory: Box<dyn RangeStoreFactory>) {
        let mut stores = self.stores.write().unwrap_or_else(|e| e.into_inner());
        stores.insert(name.into(), Arc::from(factory));
    }

    /// Register a security boundary factory
    pub fn register_boundary(
        &self,
        name: impl Into<String>,
        factory: Box<dyn SecurityBoundaryFactory>,
    ) {
        let mut boundaries = self.boundaries.write().unwrap_or_else(|e| e.into_inner());
        boundaries.insert(name.into(), factory);
    }

    /// Create a range feed from configuration
    ///
    /// # Returns
    ///
    /// - `Ok(Box<dyn RangeFeed>)`: Created feed instance
    /// - `Err(Error)`: If the feed type is not registered or creation fails
    pub fn create_feed(&self, config: &FeedConfig) -> Result<Box<dyn RangeFeed>> {
        let feed_type = config.type_name();
        let feeds = self.feeds.read().unwrap_or_else(|e| e.into_inner());

        let factory = feeds
            .get(feed_type)
            .ok_or_else(|| Error::config(format!("Unknown feed type: {}", feed_type)))?;

        factory.create(config)
    }

    /// Create a range store from configuration
    pub async fn create_store(&self, config: &StoreConfig) -> Result<Box<dyn RangeStore>> {
        let store_type = config.type_name();

        // Clone the factory out so the lock isn't held across the await
        let factory = {
            let stores = self.stores.read().unwrap_or_else(|e| e.into_inner());
            stores
                .get(store_type)
                .cloned()
                .ok_or_else(|| Error::config(format!("Unknown store type: {}", store_type)))?
        };

        factory.create(config).await
    }

    /// Create a security boundary from configuration
    pub fn create_boundary(&self, config: &BoundaryConfig) -> Result<Box<dyn SecurityBoundary>> {
        let boundary_type = config.type_name();
        let boundaries = self.boundaries.read().unwrap_or_else(|e| e.into_inner());

        let factory = boundaries.get(boundary_type).ok_or_else(|| {
            Error::config(format!("Unknown boundary type: {}", boundary_type))
        })?;

        factory.create(config)
    }

    /// List all registered feed types
    pub fn list_feeds(&self) -> Vec<String> {
        let feeds = self.feeds.read().unwrap_or_else(|e| e.into_inner());
        feeds.keys().cloned().collect()
    }

    /// List all registered store types
    pub fn list_stores(&self) -> Vec<String> {
        let stores = self.stores.read().unwrap_or_else(|e| e.into_inner());
        stores.keys().cloned().collect()
    }

    /// List all registered boundary types
    pub fn list_boundaries(&self) -> Vec<String> {
        let boundaries = self.boundaries.read().unwrap_or_else(|e| e.into_inner());
        boundaries.keys().cloned().collect()
    }

    /// Check if a feed type is registered
    pub fn has_feed(&self, name: &str) -> bool {
        let feeds = self.feeds.read().unwrap_or_else(|e| e.into_inner());
        feeds.contains_key(name)
    }

    /// Check if a store type is registered
    pub fn has_store(&self, name: &str) -> bool {
        let stores = self.stores.read().unwrap_or_else(|e| e.into_inner());
        stores.contains_key(name)
    }

    /// Check if a boundary type is registered
    pub fn has_boundary(&self, name: &str) -> bool {
        let boundaries = self.boundaries.read().unwrap_or_else(|e| e.into_inner());
        boundaries.contains_key(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct MockBoundaryFactory;

    impl SecurityBoundaryFactory for MockBoundaryFactory {
        fn create(&self, _config: &BoundaryConfig) -> Result<Box<dyn SecurityBoundary>> {
            Err(Error::not_found("Mock boundary not implemented"))
        }
    }

    #[test]
    fn test_registry_registration() {
        let registry = PluginRegistry::new();
        assert!(!registry.has_boundary("mock"));

        registry.register_boundary("mock", Box::new(MockBoundaryFactory));

        assert!(registry.has_boundary("mock"));
        assert!(registry.list_boundaries().contains(&"mock".to_string()));
    }

    #[test]
    fn test_builtin_stores() {
        let registry = PluginRegistry::with_builtin_stores();
        assert!(registry.has_store("memory"));
        assert!(registry.has_store("file"));

        let scope = crate::model::Scope::new("us-west-2", "EC2");
        let latest = tokio_test::block_on(async {
            let store = registry.create_store(&StoreConfig::Memory).await?;
            store.latest_sync_token(&scope).await
        });
        assert_eq!(tokio_test::assert_ok!(latest), None);
    }

    #[test]
    fn test_unknown_feed_is_a_config_error() {
        let registry = PluginRegistry::new();
        let err = registry
            .create_feed(&FeedConfig::default())
            .err()
            .expect("no feeds registered");
        assert!(matches!(err, Error::Config(_)));
    }
}
