// # File Range Store
//
// File-based implementation of RangeStore with crash recovery.
//
// ## Purpose
//
// Provides a durable range store shared by every invocation on one host.
// Each invocation runs in its own process, so the file itself is the
// source of truth and every read-modify-write happens under an exclusive
// OS lock on a sidecar `.lock` file.
//
// ## Write Path
//
// Record upserts and deletes are buffered in memory and persisted by
// `flush` (or by the next ledger/lease operation). Persisting takes the
// lock, re-reads the file, replays the buffered writes on top of it and
// writes the result back, so writes of other processes made in between are
// kept. Replayed writes keep their guards: a conditional upsert never
// overwrites a newer record, and a delete never removes a record that was
// re-confirmed after it was read.
//
// Ledger and lease operations are always applied directly under the lock.
//
// ## Crash Recovery
//
// - Atomic writes: Uses write-then-rename for atomicity
// - Corruption detection: Validates JSON on load
// - Automatic backup: Keeps .backup of last known good state
// - Recovery: Falls back to backup if corruption detected
//
// A corrupt file without a usable backup is a store error. Starting empty
// would make the next reconciliation strip every managed rule.
//
// ## File Format
//
// ```json
// {
//   "version": "1.0",
//   "tables": {
//     "partitions": {
//       "us-west-2#EC2": {
//         "#IPV4#10.0.0.0/24": {
//           "scope": "us-west-2#EC2",
//           "range_key": "#IPV4#10.0.0.0/24",
//           "cidr": "10.0.0.0/24",
//           "sync_token": 1714564990,
//           "last_seen_at": "2025-01-09T12:00:00Z"
//         }
//       }
//     },
//     "sync_tokens": { "us-west-2#EC2": 1714564990 },
//     "leases": {}
//   }
// }
// ```

use async_trait::async_trait;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::config::StoreConfig;
use crate::model::{RangeRecord, Scope, SyncToken};
use crate::store::RangeTables;
use crate::traits::range_store::{RangeStore, RangeStoreFactory};
use crate::Error;

/// Store file format version
const STORE_FILE_VERSION: &str = "1.0";

/// File-based range store with crash recovery
///
/// Reads are served from the tables as of the last locked operation (open,
/// flush, ledger or lease call) plus this handle's buffered writes.
///
/// # Example
///
/// ```rust,no_run
/// use rangesync_core::store::FileRangeStore;
/// use rangesync_core::traits::RangeStore;
/// use rangesync_core::model::Scope;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let store = FileRangeStore::new("/var/lib/rangesync/ranges.json").await?;
///
///     let records = store.query_scope(&Scope::new("us-west-2", "EC2")).await?;
///     println!("{} ranges tracked", records.len());
///
///     Ok(())
/// }
/// ```
#[derive(Debug)]
pub struct FileRangeStore {
    path: PathBuf,
    state: Arc<RwLock<FileState>>,
}

#[derive(Debug)]
struct FileState {
    tables: RangeTables,
    pending: Vec<PendingWrite>,
}

/// A buffered record write, replayed onto the file's current tables
#[derive(Debug, Clone)]
enum PendingWrite {
    Put(RangeRecord),
    PutIfNotOlder(RangeRecord),
    /// `seen` is the token of the record this handle deleted
    Delete {
        scope: Scope,
        range_key: String,
        seen: SyncToken,
    },
}

impl PendingWrite {
    /// Returns whether the tables changed
    fn apply(&self, tables: &mut RangeTables) -> bool {
        match self {
            PendingWrite::Put(record) => {
                tables.put(record);
                true
            }
            PendingWrite::PutIfNotOlder(record) => tables.put_if_not_older(record),
            PendingWrite::Delete {
                scope,
                range_key,
                seen,
            } => match tables.get(scope, range_key) {
                Some(current) if current.sync_token > *seen => false,
                _ => tables.delete(scope, range_key),
            },
        }
    }
}

/// Serializable store file format
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct StoreFileFormat {
    version: String,
    tables: RangeTables,
}

/// Why a store file could not be loaded
enum LoadFailure {
    /// Present but unparseable; recoverable from backup
    Corrupt(Error),
    /// Could not be read at all
    Unreadable(Error),
}

/// Exclusive OS lock on the store's sidecar lock file, released on drop
struct StoreLock {
    file: File,
}

impl StoreLock {
    fn acquire(path: &Path) -> Result<Self, Error> {
        let lock_path = FileRangeStore::lock_path(path);
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(|e| {
                Error::store(format!(
                    "Failed to open lock file {}: {}",
                    lock_path.display(),
                    e
                ))
            })?;

        fs2::FileExt::lock_exclusive(&file).map_err(|e| {
            Error::store(format!(
                "Failed to lock range store {}: {}",
                lock_path.display(),
                e
            ))
        })?;

        Ok(Self { file })
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        // Closing the descriptor releases the lock as well
        let _ = fs2::FileExt::unlock(&self.file);
    }
}

impl FileRangeStore {
    /// Create or load a file range store
    ///
    /// This will:
    /// 1. Create parent directories if needed
    /// 2. Load the existing store file under the store lock
    /// 3. If corruption detected, recover from the backup
    /// 4. If the backup is missing or unusable too, fail with `Error::Store`
    pub async fn new<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                Error::config(format!(
                    "Failed to create store directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        let load_path = path.clone();
        let tables = blocking(move || {
            let _lock = StoreLock::acquire(&load_path)?;
            Self::load_with_recovery(&load_path)
        })
        .await?;

        tracing::debug!(
            "Loaded range store from {}: {} records",
            path.display(),
            tables.record_count()
        );

        Ok(Self {
            path,
            state: Arc::new(RwLock::new(FileState {
                tables,
                pending: Vec::new(),
            })),
        })
    }

    /// Load tables from file with automatic recovery
    ///
    /// Must be called with the store lock held.
    fn load_with_recovery(path: &Path) -> Result<RangeTables, Error> {
        let err = match Self::load(path) {
            Ok(tables) => return Ok(tables),
            Err(LoadFailure::Unreadable(e)) => return Err(e),
            Err(LoadFailure::Corrupt(e)) => e,
        };

        tracing::warn!(
            "Range store file appears corrupted: {}. Attempting recovery from backup.",
            err
        );

        let backup_path = Self::backup_path(path);
        if !backup_path.exists() {
            return Err(Error::store(format!(
                "{}; no backup to recover from. Restore the file or remove it to rebuild from the feed",
                err
            )));
        }

        match Self::load(&backup_path) {
            Ok(tables) => {
                tracing::info!(
                    "Recovered range store from backup: {} records",
                    tables.record_count()
                );
                if let Err(restore_err) = Self::restore_from_backup(path, &backup_path) {
                    tracing::error!(
                        "Failed to restore store file from backup: {}",
                        restore_err
                    );
                }
                Ok(tables)
            }
            Err(LoadFailure::Corrupt(backup_err) | LoadFailure::Unreadable(backup_err)) => {
                Err(Error::store(format!(
                    "{}; backup unusable too ({}). Restore the file or remove it to rebuild from the feed",
                    err, backup_err
                )))
            }
        }
    }

    fn load(path: &Path) -> Result<RangeTables, LoadFailure> {
        if !path.exists() {
            tracing::debug!("Range store file does not exist: {}", path.display());
            return Ok(RangeTables::default());
        }

        let content = fs::read_to_string(path).map_err(|e| {
            LoadFailure::Unreadable(Error::store(format!(
                "Failed to read store file {}: {}",
                path.display(),
                e
            )))
        })?;

        let file: StoreFileFormat = serde_json::from_str(&content).map_err(|e| {
            LoadFailure::Corrupt(Error::store(format!(
                "Failed to parse store file {}: {}",
                path.display(),
                e
            )))
        })?;

        if file.version != STORE_FILE_VERSION {
            tracing::warn!(
                "Range store file version mismatch: expected {}, got {}. \
                Attempting to load anyway.",
                STORE_FILE_VERSION,
                file.version
            );
        }

        Ok(file.tables)
    }

    /// Write the tables to file atomically
    ///
    /// Must be called with the store lock held.
    fn write_tables(path: &Path, tables: &RangeTables) -> Result<(), Error> {
        let file = StoreFileFormat {
            version: STORE_FILE_VERSION.to_string(),
            tables: tables.clone(),
        };
        let json = serde_json::to_string_pretty(&file)
            .map_err(|e| Error::store(format!("Failed to serialize range store: {}", e)))?;

        let temp_path = Self::temp_path(path);
        {
            let mut handle = File::create(&temp_path).map_err(|e| {
                Error::store(format!(
                    "Failed to create temp file {}: {}",
                    temp_path.display(),
                    e
                ))
            })?;

            handle.write_all(json.as_bytes()).map_err(|e| {
                Error::store(format!(
                    "Failed to write to temp file {}: {}",
                    temp_path.display(),
                    e
                ))
            })?;

            handle.sync_all().map_err(|e| {
                Error::store(format!(
                    "Failed to sync temp file {}: {}",
                    temp_path.display(),
                    e
                ))
            })?;
        }

        if path.exists() {
            let backup_path = Self::backup_path(path);
            if let Err(e) = fs::copy(path, &backup_path) {
                tracing::warn!("Failed to create backup: {}", e);
            }
        }

        fs::rename(&temp_path, path).map_err(|e| {
            Error::store(format!(
                "Failed to rename {} to {}: {}",
                temp_path.display(),
                path.display(),
                e
            ))
        })?;

        tracing::trace!("Range store written to file: {}", path.display());
        Ok(())
    }

    fn restore_from_backup(path: &Path, backup_path: &Path) -> Result<(), Error> {
        fs::copy(backup_path, path).map_err(|e| {
            Error::store(format!(
                "Failed to restore from backup {} to {}: {}",
                backup_path.display(),
                path.display(),
                e
            ))
        })?;

        tracing::info!("Restored range store file from backup");
        Ok(())
    }

    fn temp_path(path: &Path) -> PathBuf {
        path.with_extension("tmp")
    }

    fn backup_path(path: &Path) -> PathBuf {
        path.with_extension("backup")
    }

    fn lock_path(path: &Path) -> PathBuf {
        path.with_extension("lock")
    }

    /// Run `op` on the file's current tables under the store lock
    ///
    /// Buffered writes are replayed first. The file is rewritten if anything
    /// changed, and the in-memory tables are replaced by the result.
    async fn locked<T, F>(&self, op: F) -> Result<T, Error>
    where
        T: Send + 'static,
        F: FnOnce(&mut RangeTables) -> (T, bool) + Send + 'static,
    {
        let mut state = self.state.write().await;
        let pending = state.pending.clone();
        let path = self.path.clone();

        let (tables, value) = blocking(move || {
            let _lock = StoreLock::acquire(&path)?;
            let mut tables = Self::load_with_recovery(&path)?;

            let mut changed = false;
            for write in &pending {
                changed |= write.apply(&mut tables);
            }
            let (value, op_changed) = op(&mut tables);

            if changed || op_changed {
                Self::write_tables(&path, &tables)?;
            }
            Ok((tables, value))
        })
        .await?;

        state.tables = tables;
        state.pending.clear();
        Ok(value)
    }
}

/// Run blocking file work off the async workers
async fn blocking<T, F>(work: F) -> Result<T, Error>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, Error> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| Error::store(format!("Range store task failed: {}", e)))?
}

#[async_trait]
impl RangeStore for FileRangeStore {
    async fn put_record(&self, record: &RangeRecord) -> Result<(), Error> {
        let mut state = self.state.write().await;
        state.tables.put(record);
        state.pending.push(PendingWrite::Put(record.clone()));
        Ok(())
    }

    /// The answer reflects the tables as this handle sees them; the guard is
    /// checked again against the file when the write is persisted.
    async fn put_record_if_not_older(&self, record: &RangeRecord) -> Result<bool, Error> {
        let mut state = self.state.write().await;
        let written = state.tables.put_if_not_older(record);
        if written {
            state
                .pending
                .push(PendingWrite::PutIfNotOlder(record.clone()));
        }
        Ok(written)
    }

    async fn get_record(
        &self,
        scope: &Scope,
        range_key: &str,
    ) -> Result<Option<RangeRecord>, Error> {
        Ok(self.state.read().await.tables.get(scope, range_key))
    }

    async fn query_scope(&self, scope: &Scope) -> Result<Vec<RangeRecord>, Error> {
        Ok(self.state.read().await.tables.query_scope(scope))
    }

    async fn query_sync_token(&self, token: SyncToken) -> Result<Vec<RangeRecord>, Error> {
        Ok(self.state.read().await.tables.query_sync_token(token))
    }

    async fn delete_record(&self, scope: &Scope, range_key: &str) -> Result<(), Error> {
        let mut state = self.state.write().await;
        let Some(existing) = state.tables.get(scope, range_key) else {
            return Ok(());
        };
        state.tables.delete(scope, range_key);
        state.pending.push(PendingWrite::Delete {
            scope: scope.clone(),
            range_key: range_key.to_string(),
            seen: existing.sync_token,
        });
        Ok(())
    }

    async fn latest_sync_token(&self, scope: &Scope) -> Result<Option<SyncToken>, Error> {
        Ok(self.state.read().await.tables.latest_sync_token(scope))
    }

    async fn record_sync_token(&self, scope: &Scope, token: SyncToken) -> Result<(), Error> {
        let scope = scope.clone();
        self.locked(move |tables| ((), tables.record_sync_token(&scope, token)))
            .await
    }

    async fn acquire_lease(
        &self,
        scope: &Scope,
        holder: &str,
        ttl: std::time::Duration,
    ) -> Result<bool, Error> {
        let scope = scope.clone();
        let holder = holder.to_string();
        self.locked(move |tables| {
            let taken = tables.acquire_lease(&scope, &holder, ttl);
            (taken, taken)
        })
        .await
    }

    async fn release_lease(&self, scope: &Scope, holder: &str) -> Result<(), Error> {
        let scope = scope.clone();
        let holder = holder.to_string();
        self.locked(move |tables| ((), tables.release_lease(&scope, &holder)))
            .await
    }

    async fn flush(&self) -> Result<(), Error> {
        if self.state.read().await.pending.is_empty() {
            return Ok(());
        }
        self.locked(|_| ((), false)).await
    }
}

/// Factory for creating file stores
pub struct FileRangeStoreFactory;

#[async_trait]
impl RangeStoreFactory for FileRangeStoreFactory {
    async fn create(&self, config: &StoreConfig) -> Result<Box<dyn RangeStore>, Error> {
        match config {
            StoreConfig::File { path } => Ok(Box::new(FileRangeStore::new(path).await?)),
            _ => Err(Error::config("Invalid config for file range store")),
        }
    }
}
