//! Test doubles and common utilities for pipeline contract tests
//!
//! The doubles are deliberately small: a feed whose document the test sets,
//! and an in-memory security boundary with failure injection and call
//! counters.

#![allow(dead_code)]

use rangesync_core::config::{IngestConfig, ReconcileConfig};
use rangesync_core::error::{Error, Result};
use rangesync_core::model::{Cidr, RangeRecord, Scope, SyncToken};
use rangesync_core::store::MemoryRangeStore;
use rangesync_core::traits::{
    ApplyOutcome, BoundaryRule, ChangeNotification, FeedEntry, RangeDocument, RangeFeed,
    RangeStore, SecurityBoundary,
};
use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

pub const TAG_PREFIX: &str = "rangesync";

pub fn ec2() -> Scope {
    Scope::new("us-west-2", "EC2")
}

pub fn s3() -> Scope {
    Scope::new("us-west-2", "S3")
}

pub fn cidr(text: &str) -> Cidr {
    text.parse().expect("valid test CIDR")
}

/// Build a document from `(scope, cidr)` pairs
pub fn document(token: Option<u64>, entries: &[(Scope, &str)]) -> RangeDocument {
    RangeDocument {
        sync_token: token.map(SyncToken),
        create_date: None,
        entries: entries
            .iter()
            .map(|(scope, text)| FeedEntry::new(scope.clone(), cidr(text)))
            .collect(),
    }
}

pub fn ingest_config() -> IngestConfig {
    IngestConfig::default()
}

pub fn reconcile_config() -> ReconcileConfig {
    ReconcileConfig {
        apply_timeout_secs: 1,
        lease_ttl_secs: 30,
        ..ReconcileConfig::default()
    }
}

/// A feed that returns whatever document the test last set
pub struct StaticFeed {
    document: Mutex<RangeDocument>,
    failing: AtomicBool,
    fetch_count: AtomicUsize,
}

impl StaticFeed {
    pub fn new(document: RangeDocument) -> Arc<Self> {
        Arc::new(Self {
            document: Mutex::new(document),
            failing: AtomicBool::new(false),
            fetch_count: AtomicUsize::new(0),
        })
    }

    /// Replace the published document
    pub fn publish(&self, document: RangeDocument) {
        *self.document.lock().unwrap() = document;
    }

    /// Make subsequent fetches fail
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn fetch_count(&self) -> usize {
        self.fetch_count.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl RangeFeed for StaticFeed {
    async fn fetch(&self, _notification: &ChangeNotification) -> Result<RangeDocument> {
        self.fetch_count.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::fetch("feed unreachable"));
        }
        Ok(self.document.lock().unwrap().clone())
    }

    fn feed_name(&self) -> &'static str {
        "static"
    }
}

/// An in-memory security group
///
/// Rules are `(cidr, description)` pairs, so the same CIDR can be present
/// under several tags, the way a real group holds manual and managed rules.
#[derive(Default)]
pub struct MemoryBoundary {
    rules: Mutex<BTreeSet<(Cidr, String)>>,
    failing: Mutex<HashSet<Cidr>>,
    list_failing: AtomicBool,
    dry_run: AtomicBool,
    add_count: AtomicUsize,
    remove_count: AtomicUsize,
    list_count: AtomicUsize,
}

impl MemoryBoundary {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Insert a rule directly, bypassing the counters
    pub fn seed(&self, cidr: Cidr, description: &str) {
        self.rules
            .lock()
            .unwrap()
            .insert((cidr, description.to_string()));
    }

    /// Make every add/remove of `cidr` fail
    pub fn fail_on(&self, cidr: Cidr) {
        self.failing.lock().unwrap().insert(cidr);
    }

    pub fn heal(&self) {
        self.failing.lock().unwrap().clear();
        self.list_failing.store(false, Ordering::SeqCst);
    }

    /// Report every add/remove as planned without touching the rules
    pub fn set_dry_run(&self, dry_run: bool) {
        self.dry_run.store(dry_run, Ordering::SeqCst);
    }

    pub fn fail_listing(&self) {
        self.list_failing.store(true, Ordering::SeqCst);
    }

    /// CIDRs currently present under `tag`
    pub fn cidrs(&self, tag: &str) -> BTreeSet<Cidr> {
        self.rules
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, description)| description == tag)
            .map(|(cidr, _)| *cidr)
            .collect()
    }

    pub fn rule_count(&self) -> usize {
        self.rules.lock().unwrap().len()
    }

    pub fn add_count(&self) -> usize {
        self.add_count.load(Ordering::SeqCst)
    }

    pub fn remove_count(&self) -> usize {
        self.remove_count.load(Ordering::SeqCst)
    }

    pub fn list_count(&self) -> usize {
        self.list_count.load(Ordering::SeqCst)
    }

    fn check(&self, cidr: &Cidr) -> Result<()> {
        if self.failing.lock().unwrap().contains(cidr) {
            return Err(Error::provider("memory", format!("injected failure for {}", cidr)));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl SecurityBoundary for MemoryBoundary {
    async fn list_managed_rules(&self, tag: &str) -> Result<Vec<BoundaryRule>> {
        self.list_count.fetch_add(1, Ordering::SeqCst);
        if self.list_failing.load(Ordering::SeqCst) {
            return Err(Error::provider("memory", "listing unavailable"));
        }
        Ok(self
            .cidrs(tag)
            .into_iter()
            .map(|cidr| BoundaryRule {
                cidr,
                description: tag.to_string(),
            })
            .collect())
    }

    async fn add_rule(&self, cidr: &Cidr, tag: &str) -> Result<ApplyOutcome> {
        self.add_count.fetch_add(1, Ordering::SeqCst);
        self.check(cidr)?;
        if self.dry_run.load(Ordering::SeqCst) {
            return Ok(ApplyOutcome::Planned);
        }
        if self.rules.lock().unwrap().insert((*cidr, tag.to_string())) {
            Ok(ApplyOutcome::Applied)
        } else {
            Ok(ApplyOutcome::AlreadyPresent)
        }
    }

    async fn remove_rule(&self, cidr: &Cidr, tag: &str) -> Result<ApplyOutcome> {
        self.remove_count.fetch_add(1, Ordering::SeqCst);
        self.check(cidr)?;
        if self.dry_run.load(Ordering::SeqCst) {
            return Ok(ApplyOutcome::Planned);
        }
        if self.rules.lock().unwrap().remove(&(*cidr, tag.to_string())) {
            Ok(ApplyOutcome::Applied)
        } else {
            Ok(ApplyOutcome::AlreadyAbsent)
        }
    }

    fn boundary_id(&self) -> &str {
        "sg-test"
    }

    fn provider_name(&self) -> &'static str {
        "memory"
    }
}

/// A boundary whose listing never returns within any sane timeout
pub struct HangingBoundary;

#[async_trait::async_trait]
impl SecurityBoundary for HangingBoundary {
    async fn list_managed_rules(&self, _tag: &str) -> Result<Vec<BoundaryRule>> {
        std::future::pending::<()>().await;
        Ok(Vec::new())
    }

    async fn add_rule(&self, _cidr: &Cidr, _tag: &str) -> Result<ApplyOutcome> {
        std::future::pending::<()>().await;
        Ok(ApplyOutcome::Applied)
    }

    async fn remove_rule(&self, _cidr: &Cidr, _tag: &str) -> Result<ApplyOutcome> {
        std::future::pending::<()>().await;
        Ok(ApplyOutcome::Applied)
    }

    fn boundary_id(&self) -> &str {
        "sg-hanging"
    }

    fn provider_name(&self) -> &'static str {
        "hanging"
    }
}

/// A store that stalls its first point read until the test releases it
///
/// The read is answered before the stall, so the caller resumes holding
/// whatever the record looked like at that moment.
pub struct GatedStore {
    inner: MemoryRangeStore,
    armed: AtomicBool,
    pub paused: Notify,
    pub resume: Notify,
}

impl GatedStore {
    pub fn new(inner: MemoryRangeStore) -> Arc<Self> {
        Arc::new(Self {
            inner,
            armed: AtomicBool::new(true),
            paused: Notify::new(),
            resume: Notify::new(),
        })
    }
}

#[async_trait::async_trait]
impl RangeStore for GatedStore {
    async fn put_record(&self, record: &RangeRecord) -> Result<()> {
        self.inner.put_record(record).await
    }

    async fn put_record_if_not_older(&self, record: &RangeRecord) -> Result<bool> {
        self.inner.put_record_if_not_older(record).await
    }

    async fn get_record(&self, scope: &Scope, range_key: &str) -> Result<Option<RangeRecord>> {
        let record = self.inner.get_record(scope, range_key).await?;
        if self.armed.swap(false, Ordering::SeqCst) {
            self.paused.notify_one();
            self.resume.notified().await;
        }
        Ok(record)
    }

    async fn query_scope(&self, scope: &Scope) -> Result<Vec<RangeRecord>> {
        self.inner.query_scope(scope).await
    }

    async fn query_sync_token(&self, token: SyncToken) -> Result<Vec<RangeRecord>> {
        self.inner.query_sync_token(token).await
    }

    async fn delete_record(&self, scope: &Scope, range_key: &str) -> Result<()> {
        self.inner.delete_record(scope, range_key).await
    }

    async fn latest_sync_token(&self, scope: &Scope) -> Result<Option<SyncToken>> {
        self.inner.latest_sync_token(scope).await
    }

    async fn record_sync_token(&self, scope: &Scope, token: SyncToken) -> Result<()> {
        self.inner.record_sync_token(scope, token).await
    }

    async fn acquire_lease(&self, scope: &Scope, holder: &str, ttl: Duration) -> Result<bool> {
        self.inner.acquire_lease(scope, holder, ttl).await
    }

    async fn release_lease(&self, scope: &Scope, holder: &str) -> Result<()> {
        self.inner.release_lease(scope, holder).await
    }

    async fn flush(&self) -> Result<()> {
        self.inner.flush().await
    }
}
