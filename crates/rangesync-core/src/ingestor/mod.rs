//! Range ingestion
//!
//! The Ingestor is responsible for:
//! - Fetching the full current range document on a change notification
//! - Filtering it to the scopes this deployment tracks
//! - Allocating the batch's sync token
//! - Upserting one `RangeRecord` per `(scope, cidr)` pair
//!
//! ## Event Flow
//!
//! ```text
//! notification ─▶ RangeFeed::fetch ─▶ filter ─▶ allocate token
//!                                                   │
//!                                                   ▼
//!                            RangeStore::put_record (per range)
//!                                                   │
//!                                                   ▼
//!                       RangeStore::record_sync_token (per scope)
//! ```
//!
//! ## Idempotency
//!
//! Notification delivery is at-least-once. Re-ingesting a document with the
//! same upstream token leaves the store unchanged: records already carrying
//! that token are not rewritten. A crash halfway through a batch is repaired
//! by rerunning ingestion from scratch, because every write is an
//! independent keyed upsert and the batch is only marked complete at the end.
//!
//! The ingestor never deletes records and never touches the security
//! boundary; ranges missing from the latest document become stale and are
//! dealt with by the `Reconciler`.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::{IngestConfig, IpVersionFilter};
use crate::error::{Error, Result};
use crate::events::{EventSink, SyncEvent};
use crate::model::{RangeRecord, Scope, SyncToken, range_key};
use crate::traits::{ChangeNotification, FeedEntry, RangeFeed, RangeStore};

/// Outcome of one ingestion
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncResult {
    /// Token of the batch (the document's own, or the one allocated for it)
    pub sync_token: SyncToken,
    /// Records written by this run
    pub written: usize,
    /// Records already confirmed by this batch
    pub unchanged: usize,
    /// Records left alone because a newer batch already confirmed them
    /// (or already completed for their scope)
    pub superseded: usize,
    /// Document entries outside the tracked scopes or IP versions
    pub filtered: usize,
    /// The document is older than every tracked scope's latest batch; nothing was written
    pub stale: bool,
    /// Ranges per tracked scope in the document
    pub scopes: BTreeMap<Scope, usize>,
}

impl SyncResult {
    fn stale(sync_token: SyncToken) -> Self {
        Self {
            sync_token,
            written: 0,
            unchanged: 0,
            superseded: 0,
            filtered: 0,
            stale: true,
            scopes: BTreeMap::new(),
        }
    }
}

/// Consumes change notifications and records the feed in the range store
pub struct Ingestor {
    feed: Arc<dyn RangeFeed>,
    store: Arc<dyn RangeStore>,
    scopes: HashSet<Scope>,
    ip_version: IpVersionFilter,
    fetch_timeout: Duration,
    events: EventSink,
}

impl Ingestor {
    /// Create a new ingestor
    ///
    /// # Parameters
    ///
    /// - `feed`: Range feed implementation
    /// - `store`: Range store shared with the reconciler
    /// - `scopes`: Scopes to keep; everything else in the document is dropped
    /// - `config`: Ingestor settings
    pub fn new(
        feed: Arc<dyn RangeFeed>,
        store: Arc<dyn RangeStore>,
        scopes: impl IntoIterator<Item = Scope>,
        config: &IngestConfig,
    ) -> Result<Self> {
        let scopes: HashSet<Scope> = scopes.into_iter().collect();
        if scopes.is_empty() {
            return Err(Error::config("Ingestor needs at least one scope"));
        }
        if config.fetch_timeout_secs == 0 {
            return Err(Error::config("Fetch timeout must be > 0"));
        }

        Ok(Self {
            feed,
            store,
            scopes,
            ip_version: config.ip_version,
            fetch_timeout: config.fetch_timeout(),
            events: EventSink::disabled(),
        })
    }

    /// Attach an event sink for monitoring
    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }

    /// Handle one change notification
    ///
    /// # Returns
    ///
    /// - `Ok(SyncResult)`: The batch was recorded (or recognised as stale)
    /// - `Err(Error::Fetch | Error::Timeout)`: Nothing was written
    /// - `Err(Error::Store)`: Some records may be written; rerunning repairs the batch
    pub async fn ingest(&self, notification: &ChangeNotification) -> Result<SyncResult> {
        self.events.emit(SyncEvent::IngestStarted {
            document_url: notification.document_url.clone(),
        });

        let document = tokio::time::timeout(self.fetch_timeout, self.feed.fetch(notification))
            .await
            .map_err(|_| {
                Error::timeout(format!(
                    "{} feed fetch exceeded {:?}",
                    self.feed.feed_name(),
                    self.fetch_timeout
                ))
            })??;

        let mut latest = HashMap::with_capacity(self.scopes.len());
        for scope in &self.scopes {
            if let Some(token) = self.store.latest_sync_token(scope).await? {
                latest.insert(scope.clone(), token);
            }
        }

        // Scopes that already completed a newer batch than this document
        let behind: HashSet<&Scope> = match document.sync_token {
            Some(token) => latest
                .iter()
                .filter(|(_, done)| token < **done)
                .map(|(scope, _)| scope)
                .collect(),
            None => HashSet::new(),
        };

        if let Some(token) = document.sync_token
            && behind.len() == self.scopes.len()
        {
            warn!(
                "Feed document token {} is older than the latest completed batch of every scope, skipping",
                token
            );
            let result = SyncResult::stale(token);
            self.emit_completed(&result);
            return Ok(result);
        }

        let sync_token = allocate_sync_token(
            document.sync_token,
            latest.values().max().copied(),
            chrono::Utc::now(),
        );
        if document.sync_token.is_none() {
            debug!("Feed carries no sync token, allocated {}", sync_token);
        }

        let (entries, filtered) = self.select(document.entries);

        let mut result = SyncResult {
            sync_token,
            written: 0,
            unchanged: 0,
            superseded: 0,
            filtered,
            stale: false,
            scopes: BTreeMap::new(),
        };

        for entry in entries {
            *result.scopes.entry(entry.scope.clone()).or_default() += 1;
            if behind.contains(&entry.scope) {
                result.superseded += 1;
                continue;
            }
            self.upsert(entry, sync_token, &mut result).await?;
        }

        let mut completed: Vec<&Scope> = self
            .scopes
            .iter()
            .filter(|scope| !behind.contains(scope))
            .collect();
        completed.sort();

        for scope in &completed {
            if !result.scopes.contains_key(*scope) {
                warn!(
                    "Scope {} has no ranges in the feed document; its stored ranges are now stale",
                    scope
                );
            }
        }

        // Only now is the batch complete for these scopes
        for scope in completed {
            self.store.record_sync_token(scope, sync_token).await?;
        }
        self.store.flush().await?;

        info!(
            "Ingested batch {}: {} written, {} unchanged, {} superseded, {} filtered",
            sync_token, result.written, result.unchanged, result.superseded, result.filtered
        );
        self.emit_completed(&result);

        Ok(result)
    }

    /// Keep tracked scopes and IP versions; collapse duplicate ranges
    fn select(&self, entries: Vec<FeedEntry>) -> (Vec<FeedEntry>, usize) {
        let total = entries.len();
        let mut seen = BTreeSet::new();
        let mut kept = Vec::new();
        let mut filtered = 0;

        for entry in entries {
            if !self.scopes.contains(&entry.scope) || !self.ip_version.accepts(entry.cidr.version())
            {
                filtered += 1;
                continue;
            }
            if seen.insert((entry.scope.clone(), entry.cidr)) {
                kept.push(entry);
            }
        }

        debug!(
            "Selected {} of {} feed entries ({} outside tracked scopes)",
            kept.len(),
            total,
            filtered
        );
        (kept, filtered)
    }

    async fn upsert(
        &self,
        entry: FeedEntry,
        sync_token: SyncToken,
        result: &mut SyncResult,
    ) -> Result<()> {
        let key = range_key(&entry.cidr);

        if let Some(existing) = self.store.get_record(&entry.scope, &key).await? {
            if existing.sync_token > sync_token {
                debug!(
                    "{} in {} already confirmed by newer batch {}",
                    entry.cidr, entry.scope, existing.sync_token
                );
                result.superseded += 1;
                return Ok(());
            }
            if existing.sync_token == sync_token
                && existing.cidr == entry.cidr
                && existing.network_border_group == entry.network_border_group
            {
                result.unchanged += 1;
                return Ok(());
            }
        }

        let record = RangeRecord::new(entry.scope, entry.cidr, sync_token)
            .with_network_border_group(entry.network_border_group);
        if self.store.put_record_if_not_older(&record).await? {
            result.written += 1;
        } else {
            // A newer batch landed between the read above and this write
            debug!(
                "{} in {} confirmed by a newer batch meanwhile",
                record.cidr, record.scope
            );
            result.superseded += 1;
        }
        Ok(())
    }

    fn emit_completed(&self, result: &SyncResult) {
        self.events.emit(SyncEvent::IngestCompleted {
            sync_token: result.sync_token,
            written: result.written,
            unchanged: result.unchanged,
            stale: result.stale,
        });
    }
}

/// Pick the token for a batch
///
/// A token published by the feed is used as is. Without one the batch gets
/// the current Unix time, bumped past the latest completed batch if the
/// clock is behind it, so tokens stay strictly increasing.
pub fn allocate_sync_token(
    feed_token: Option<SyncToken>,
    latest: Option<SyncToken>,
    now: chrono::DateTime<chrono::Utc>,
) -> SyncToken {
    if let Some(token) = feed_token {
        return token;
    }

    let clock = SyncToken(u64::try_from(now.timestamp()).unwrap_or(0));
    match latest {
        Some(latest) if clock <= latest => latest.next(),
        _ => clock,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_feed_token_wins() {
        let now = chrono::Utc.timestamp_opt(2_000, 0).unwrap();
        assert_eq!(
            allocate_sync_token(Some(SyncToken(1_500)), Some(SyncToken(1_000)), now),
            SyncToken(1_500)
        );
    }

    #[test]
    fn test_fallback_uses_clock() {
        let now = chrono::Utc.timestamp_opt(2_000, 0).unwrap();
        assert_eq!(allocate_sync_token(None, None, now), SyncToken(2_000));
        assert_eq!(
            allocate_sync_token(None, Some(SyncToken(1_000)), now),
            SyncToken(2_000)
        );
    }

    #[test]
    fn test_fallback_stays_monotonic_when_clock_lags() {
        let now = chrono::Utc.timestamp_opt(2_000, 0).unwrap();
        assert_eq!(
            allocate_sync_token(None, Some(SyncToken(2_000)), now),
            SyncToken(2_001)
        );
        assert_eq!(
            allocate_sync_token(None, Some(SyncToken(9_000)), now),
            SyncToken(9_001)
        );
    }
}
