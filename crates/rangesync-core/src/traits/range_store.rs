// # Range Store Trait
//
// Defines the interface for the durable keyed table of range records.
//
// ## Purpose
//
// The range store is the only shared mutable resource in the pipeline. It
// decouples ingestion from reconciliation so that reconciler runs are
// idempotent and replayable independently of ingestion timing.
//
// Access is limited to keyed point reads/writes and scoped scans; no
// multi-record transactions are needed because correctness comes from
// idempotent convergence rather than atomicity.
//
// ## Implementations
//
// - In-memory: `MemoryRangeStore`
// - File-based JSON: `FileRangeStore`

use async_trait::async_trait;

use crate::error::Error;
use crate::model::{RangeRecord, Scope, SyncToken};

/// Trait for range store implementations
///
/// # Thread Safety
///
/// All methods must be safe to call concurrently from multiple tasks.
///
/// # Trust Level: Trusted (Core Component)
///
/// ## Allowed Capabilities
/// - ✅ Perform I/O for persistent storage
/// - ✅ Implement locking for thread safety
///
/// ## Forbidden Capabilities
/// - ❌ Decide which records are stale (owned by `Reconciler`)
/// - ❌ Allocate sync tokens (owned by `Ingestor`)
/// - ❌ Touch the security boundary
///
/// ## Write Semantics
///
/// `put_record` is a last-writer-wins upsert keyed by
/// `(scope, range_key)`. Ingestion writes through
/// `put_record_if_not_older` instead, whose token check happens atomically
/// with the write, so an interleaved older batch can never overwrite a
/// record a newer batch already confirmed.
#[async_trait]
pub trait RangeStore: Send + Sync {
    /// Upsert a record keyed by `(record.scope, record.range_key)`
    async fn put_record(&self, record: &RangeRecord) -> Result<(), Error>;

    /// Upsert unless the stored record carries a newer sync token
    ///
    /// # Returns
    ///
    /// - `Ok(true)`: Written
    /// - `Ok(false)`: A newer batch owns the key; nothing changed
    async fn put_record_if_not_older(&self, record: &RangeRecord) -> Result<bool, Error>;

    /// Point read
    ///
    /// # Returns
    ///
    /// - `Ok(Some(RangeRecord))`: The record
    /// - `Ok(None)`: No record under that key
    /// - `Err(Error)`: Storage error
    async fn get_record(&self, scope: &Scope, range_key: &str)
    -> Result<Option<RangeRecord>, Error>;

    /// Scoped scan: every record in the partition
    async fn query_scope(&self, scope: &Scope) -> Result<Vec<RangeRecord>, Error>;

    /// Secondary access path: every record last confirmed by `token`
    async fn query_sync_token(&self, token: SyncToken) -> Result<Vec<RangeRecord>, Error>;

    /// Delete a record (succeeds if it doesn't exist)
    async fn delete_record(&self, scope: &Scope, range_key: &str) -> Result<(), Error>;

    /// Latest fully-completed ingestion batch covering `scope`, if any
    async fn latest_sync_token(&self, scope: &Scope) -> Result<Option<SyncToken>, Error>;

    /// Mark an ingestion batch as completed for `scope`
    ///
    /// The ledger only moves forward: recording a token lower than the
    /// scope's current latest leaves it unchanged.
    async fn record_sync_token(&self, scope: &Scope, token: SyncToken) -> Result<(), Error>;

    /// Try to take the reconciliation lease for a scope
    ///
    /// # Returns
    ///
    /// - `Ok(true)`: Lease taken (or renewed by the same holder)
    /// - `Ok(false)`: Another holder owns an unexpired lease
    async fn acquire_lease(
        &self,
        scope: &Scope,
        holder: &str,
        ttl: std::time::Duration,
    ) -> Result<bool, Error>;

    /// Release a lease if `holder` still owns it
    async fn release_lease(&self, scope: &Scope, holder: &str) -> Result<(), Error>;

    /// Persist any pending changes
    async fn flush(&self) -> Result<(), Error>;
}

/// Helper trait for constructing range stores from configuration
#[async_trait]
pub trait RangeStoreFactory: Send + Sync {
    /// Create a RangeStore instance from configuration
    async fn create(
        &self,
        config: &crate::config::StoreConfig,
    ) -> Result<Box<dyn RangeStore>, Error>;
}
