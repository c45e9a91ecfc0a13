// # Memory Range Store
//
// In-memory implementation of RangeStore.
//
// ## Purpose
//
// Provides a simple, fast store that doesn't persist across restarts.
// Useful for testing and for single-process deployments that run ingestion
// and reconciliation back to back.
//
// ## Crash Behavior
//
// - All state is lost on restart/crash
// - The next ingestion repopulates every record from the feed
// - Leases vanish with the process, so no scope stays blocked

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::config::StoreConfig;
use crate::model::{RangeRecord, Scope, SyncToken};
use crate::store::RangeTables;
use crate::traits::range_store::{RangeStore, RangeStoreFactory};
use crate::Error;

/// In-memory range store implementation
///
/// Clones share the same tables, so one handle can be injected into both
/// the `Ingestor` and the `Reconciler`.
///
/// # Example
///
/// ```rust,no_run
/// use rangesync_core::model::{RangeRecord, Scope, SyncToken};
/// use rangesync_core::store::MemoryRangeStore;
/// use rangesync_core::traits::RangeStore;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let store = MemoryRangeStore::new();
///     let scope = Scope::new("us-west-2", "EC2");
///
///     let record = RangeRecord::new(scope.clone(), "10.0.0.0/24".parse()?, SyncToken(1));
///     store.put_record(&record).await?;
///
///     let records = store.query_scope(&scope).await?;
///     assert_eq!(records.len(), 1);
///
///     Ok(())
/// }
/// ```
#[derive(Debug, Clone, Default)]
pub struct MemoryRangeStore {
    inner: Arc<RwLock<RangeTables>>,
}

impl MemoryRangeStore {
    /// Create a new empty memory store
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the number of records in the store
    pub async fn len(&self) -> usize {
        self.inner.read().await.record_count()
    }

    /// Check if the store holds no records
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Every record, ordered by scope then range key
    pub async fn snapshot(&self) -> Vec<RangeRecord> {
        let guard = self.inner.read().await;
        let mut scopes: Vec<&Scope> = guard.partitions.keys().collect();
        scopes.sort();
        scopes
            .into_iter()
            .flat_map(|scope| guard.query_scope(scope))
            .collect()
    }
}

#[async_trait]
impl RangeStore for MemoryRangeStore {
    async fn put_record(&self, record: &RangeRecord) -> Result<(), Error> {
        self.inner.write().await.put(record);
        Ok(())
    }

    async fn put_record_if_not_older(&self, record: &RangeRecord) -> Result<bool, Error> {
        Ok(self.inner.write().await.put_if_not_older(record))
    }

    async fn get_record(
        &self,
        scope: &Scope,
        range_key: &str,
    ) -> Result<Option<RangeRecord>, Error> {
        Ok(self.inner.read().await.get(scope, range_key))
    }

    async fn query_scope(&self, scope: &Scope) -> Result<Vec<RangeRecord>, Error> {
        Ok(self.inner.read().await.query_scope(scope))
    }

    async fn query_sync_token(&self, token: SyncToken) -> Result<Vec<RangeRecord>, Error> {
        Ok(self.inner.read().await.query_sync_token(token))
    }

    async fn delete_record(&self, scope: &Scope, range_key: &str) -> Result<(), Error> {
        self.inner.write().await.delete(scope, range_key);
        Ok(())
    }

    async fn latest_sync_token(&self, scope: &Scope) -> Result<Option<SyncToken>, Error> {
        Ok(self.inner.read().await.latest_sync_token(scope))
    }

    async fn record_sync_token(&self, scope: &Scope, token: SyncToken) -> Result<(), Error> {
        self.inner.write().await.record_sync_token(scope, token);
        Ok(())
    }

    async fn acquire_lease(
        &self,
        scope: &Scope,
        holder: &str,
        ttl: std::time::Duration,
    ) -> Result<bool, Error> {
        Ok(self.inner.write().await.acquire_lease(scope, holder, ttl))
    }

    async fn release_lease(&self, scope: &Scope, holder: &str) -> Result<(), Error> {
        self.inner.write().await.release_lease(scope, holder);
        Ok(())
    }

    async fn flush(&self) -> Result<(), Error> {
        // Nothing to persist
        Ok(())
    }
}

/// Factory for creating memory stores
pub struct MemoryRangeStoreFactory;

#[async_trait]
impl RangeStoreFactory for MemoryRangeStoreFactory {
    async fn create(&self, config: &StoreConfig) -> Result<Box<dyn RangeStore>, Error> {
        match config {
            StoreConfig::Memory => Ok(Box::new(MemoryRangeStore::new())),
            _ => Err(Error::config("Invalid config for memory range store")),
        }
    }
}
