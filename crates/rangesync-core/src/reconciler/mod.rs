//! Security boundary reconciliation
//!
//! The Reconciler converges the managed rules of a live security boundary to
//! the range set stored for one scope.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐  desired   ┌──────────────┐  current  ┌──────────────────┐
//! │ RangeStore  │───────────▶│  Reconciler  │◀──────────│ SecurityBoundary │
//! │ (scope)     │◀── prune ──│  set diff    │── apply ─▶│ (managed tag)    │
//! └─────────────┘            └──────────────┘           └──────────────────┘
//! ```
//!
//! ## Run Flow
//!
//! 1. Serialize on the scope (in-process lock, then store lease)
//! 2. Read the scope's records; split them into desired and stale
//! 3. List the boundary's rules carrying the scope's management tag
//! 4. Add `desired − current`, remove `current − desired`
//! 5. Delete stale records whose rule is gone from the boundary
//!
//! ## Failure Model
//!
//! A failed add/remove is logged, reported in
//! [`ReconcileResult::failed`] and skipped; the run carries on. Nothing is
//! rolled back. The next run recomputes the diff from scratch and finishes
//! the job, which works because every boundary call is idempotent.
//!
//! A scope with neither records nor a completed batch is never emptied: if
//! the boundary still carries managed rules for it, the run fails with
//! [`Error::Store`] instead.

mod locks;

pub use locks::ScopeLocks;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::config::ReconcileConfig;
use crate::error::{Error, Result};
use crate::events::{EventSink, SyncEvent};
use crate::model::{Cidr, RangeRecord, Scope, SyncToken};
use crate::traits::{ApplyOutcome, RangeStore, SecurityBoundary, managed_tag};

/// Direction of a rule change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeAction {
    Add,
    Remove,
}

/// A rule change that failed and was skipped
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedChange {
    pub cidr: Cidr,
    pub action: ChangeAction,
    pub error: String,
}

/// Outcome of one reconciliation run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileResult {
    pub scope: Scope,
    /// Rules added to the boundary
    pub added: usize,
    /// Rules removed from the boundary
    pub removed: usize,
    /// Desired rules already present
    pub unchanged: usize,
    /// Changes skipped because the boundary call failed
    pub failed: Vec<FailedChange>,
    /// Stale records deleted from the store
    pub pruned: usize,
    /// Changes a dry-run boundary logged without applying
    pub planned: usize,
}

impl ReconcileResult {
    fn new(scope: Scope) -> Self {
        Self {
            scope,
            added: 0,
            removed: 0,
            unchanged: 0,
            failed: Vec::new(),
            pruned: 0,
            planned: 0,
        }
    }

    /// Whether the boundary now matches the desired set exactly
    pub fn is_converged(&self) -> bool {
        self.failed.is_empty() && self.planned == 0
    }
}

/// Converges a security boundary to the stored range set
pub struct Reconciler {
    store: Arc<dyn RangeStore>,
    boundary: Arc<dyn SecurityBoundary>,
    config: ReconcileConfig,
    holder: String,
    locks: ScopeLocks,
    events: EventSink,
}

impl Reconciler {
    /// Create a new reconciler
    ///
    /// # Parameters
    ///
    /// - `store`: Range store shared with the ingestor
    /// - `boundary`: The live boundary to converge
    /// - `config`: Reconciler settings
    pub fn new(
        store: Arc<dyn RangeStore>,
        boundary: Arc<dyn SecurityBoundary>,
        config: ReconcileConfig,
    ) -> Result<Self> {
        config.validate()?;

        Ok(Self {
            store,
            boundary,
            config,
            holder: default_holder(),
            locks: ScopeLocks::new(),
            events: EventSink::disabled(),
        })
    }

    /// Attach an event sink for monitoring
    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }

    /// Override the identity used for scope leases
    pub fn with_holder(mut self, holder: impl Into<String>) -> Self {
        self.holder = holder.into();
        self
    }

    /// Converge the boundary's rules for `scope`
    ///
    /// # Returns
    ///
    /// - `Ok(ReconcileResult)`: The run completed; check `failed` for skipped changes
    /// - `Err(Error::ScopeBusy)`: Another invocation holds the scope's lease
    /// - `Err(Error)`: The store or the rule listing failed; safe to rerun
    pub async fn reconcile(&self, scope: &Scope) -> Result<ReconcileResult> {
        let _guard = self.locks.lock(scope).await;

        if !self
            .store
            .acquire_lease(scope, &self.holder, self.config.lease_ttl())
            .await?
        {
            return Err(Error::scope_busy(format!(
                "{} is being reconciled by another invocation",
                scope
            )));
        }

        let result = self.converge(scope).await;

        if let Err(e) = self.store.release_lease(scope, &self.holder).await {
            // The lease expires on its own
            warn!("Failed to release lease on {}: {}", scope, e);
        }

        match &result {
            Ok(r) => info!(
                "Reconciled {} on {}: {} added, {} removed, {} unchanged, {} failed, {} pruned, {} planned",
                scope,
                self.boundary.boundary_id(),
                r.added,
                r.removed,
                r.unchanged,
                r.failed.len(),
                r.pruned,
                r.planned
            ),
            Err(e) => error!("Reconciliation of {} aborted: {}", scope, e),
        }

        result
    }

    /// Reconcile several scopes concurrently
    ///
    /// Results come back in the order the scopes were given.
    pub async fn reconcile_all(
        self: &Arc<Self>,
        scopes: &[Scope],
    ) -> Vec<(Scope, Result<ReconcileResult>)> {
        let mut tasks = JoinSet::new();
        for (index, scope) in scopes.iter().cloned().enumerate() {
            let this = Arc::clone(self);
            tasks.spawn(async move {
                let result = this.reconcile(&scope).await;
                (index, scope, result)
            });
        }

        let mut results = Vec::with_capacity(scopes.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(entry) => results.push(entry),
                Err(e) => error!("Reconciliation task failed: {}", e),
            }
        }
        results.sort_by_key(|(index, _, _)| *index);
        results
            .into_iter()
            .map(|(_, scope, result)| (scope, result))
            .collect()
    }

    async fn converge(&self, scope: &Scope) -> Result<ReconcileResult> {
        self.events.emit(SyncEvent::ReconcileStarted {
            scope: scope.clone(),
        });

        let records = self.store.query_scope(scope).await?;
        let completed = self.store.latest_sync_token(scope).await?;
        let unknown_scope = completed.is_none() && records.is_empty();
        let latest = match completed {
            Some(token) => Some(token),
            // First batch never completed: whatever was written is all we have
            None => records.iter().map(|r| r.sync_token).max(),
        };
        let (desired, stale) = self.partition(records, latest);

        let tag = managed_tag(&self.config.tag_prefix, scope);
        let current: BTreeSet<Cidr> = self
            .bounded("list managed rules", self.boundary.list_managed_rules(&tag))
            .await?
            .into_iter()
            .filter(|rule| rule.description == tag)
            .map(|rule| rule.cidr)
            .collect();

        // Nothing was ever ingested for this scope, so an empty desired set
        // proves nothing about the rules already on the boundary
        if unknown_scope && !current.is_empty() {
            return Err(Error::store(format!(
                "no ranges or completed batch recorded for {}; refusing to remove {} managed rule(s) from {}",
                scope,
                current.len(),
                self.boundary.boundary_id()
            )));
        }

        debug!(
            "{}: {} desired, {} stale, {} on boundary",
            scope,
            desired.len(),
            stale.len(),
            current.len()
        );

        let mut result = ReconcileResult::new(scope.clone());
        result.unchanged = desired.intersection(&current).count();

        for cidr in desired.difference(&current) {
            match self.bounded("add rule", self.boundary.add_rule(cidr, &tag)).await {
                Ok(ApplyOutcome::AlreadyPresent) => {
                    debug!("{} already present on boundary", cidr);
                    result.unchanged += 1;
                }
                Ok(ApplyOutcome::Planned) => result.planned += 1,
                Ok(_) => {
                    info!("Added {} to {} for {}", cidr, self.boundary.boundary_id(), scope);
                    result.added += 1;
                    self.events.emit(SyncEvent::RuleAdded {
                        scope: scope.clone(),
                        cidr: *cidr,
                    });
                }
                Err(e) => self.skip(scope, *cidr, ChangeAction::Add, e, &mut result),
            }
        }

        let mut still_present = BTreeSet::new();
        for cidr in current.difference(&desired) {
            match self
                .bounded("remove rule", self.boundary.remove_rule(cidr, &tag))
                .await
            {
                Ok(ApplyOutcome::AlreadyAbsent) => {
                    debug!("{} already absent from boundary", cidr);
                }
                Ok(ApplyOutcome::Planned) => {
                    // The rule is still live, so its record must survive
                    still_present.insert(*cidr);
                    result.planned += 1;
                }
                Ok(_) => {
                    info!(
                        "Removed {} from {} for {}",
                        cidr,
                        self.boundary.boundary_id(),
                        scope
                    );
                    result.removed += 1;
                    self.events.emit(SyncEvent::RuleRemoved {
                        scope: scope.clone(),
                        cidr: *cidr,
                    });
                }
                Err(e) => {
                    still_present.insert(*cidr);
                    self.skip(scope, *cidr, ChangeAction::Remove, e, &mut result);
                }
            }
        }

        for record in stale {
            if still_present.contains(&record.cidr) {
                continue;
            }
            self.store
                .delete_record(&record.scope, &record.range_key)
                .await?;
            debug!("Pruned stale record {} from {}", record.cidr, scope);
            result.pruned += 1;
        }
        self.store.flush().await?;

        self.events.emit(SyncEvent::ReconcileCompleted {
            scope: scope.clone(),
            added: result.added,
            removed: result.removed,
            failed: result.failed.len(),
        });

        Ok(result)
    }

    /// Split records into the desired CIDR set and stale records to prune
    ///
    /// A record is desired when the latest batch confirmed it, or when the
    /// feed dropped it less than `removal_grace` ago.
    fn partition(
        &self,
        records: Vec<RangeRecord>,
        latest: Option<SyncToken>,
    ) -> (BTreeSet<Cidr>, Vec<RangeRecord>) {
        let grace = chrono::Duration::from_std(self.config.removal_grace())
            .unwrap_or(chrono::Duration::MAX);
        let now = chrono::Utc::now();

        let mut desired = BTreeSet::new();
        let mut stale = Vec::new();
        for record in records {
            let is_stale = latest.is_some_and(|latest| record.is_stale(latest));
            let in_grace = is_stale && now.signed_duration_since(record.last_seen_at) < grace;

            if !is_stale || in_grace {
                if in_grace {
                    debug!(
                        "{} dropped from feed but within removal grace",
                        record.cidr
                    );
                }
                desired.insert(record.cidr);
            } else {
                stale.push(record);
            }
        }
        (desired, stale)
    }

    /// Bound one boundary call by the apply timeout
    async fn bounded<T>(
        &self,
        what: &str,
        call: impl std::future::Future<Output = Result<T>>,
    ) -> Result<T> {
        let limit: Duration = self.config.apply_timeout();
        tokio::time::timeout(limit, call).await.map_err(|_| {
            Error::timeout(format!(
                "{} on {} exceeded {:?}",
                what,
                self.boundary.provider_name(),
                limit
            ))
        })?
    }

    fn skip(
        &self,
        scope: &Scope,
        cidr: Cidr,
        action: ChangeAction,
        cause: Error,
        result: &mut ReconcileResult,
    ) {
        let err = Error::boundary_apply(cidr.to_string(), cause.to_string());
        warn!("{} ({:?} skipped, retried next run)", err, action);
        self.events.emit(SyncEvent::RuleFailed {
            scope: scope.clone(),
            cidr,
            error: err.to_string(),
        });
        result.failed.push(FailedChange {
            cidr,
            action,
            error: cause.to_string(),
        });
    }
}

/// Lease identity unique to this process and construction time
fn default_holder() -> String {
    format!(
        "rangesync-{}-{}",
        std::process::id(),
        chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_holders_are_distinct() {
        let a = default_holder();
        std::thread::sleep(std::time::Duration::from_millis(1));
        let b = default_holder();
        assert_ne!(a, b);
    }

    #[test]
    fn test_result_convergence_flag() {
        let mut result = ReconcileResult::new(Scope::new("us-west-2", "EC2"));
        assert!(result.is_converged());

        result.failed.push(FailedChange {
            cidr: "10.0.0.0/24".parse().unwrap(),
            action: ChangeAction::Add,
            error: "throttled".to_string(),
        });
        assert!(!result.is_converged());

        let mut planned = ReconcileResult::new(Scope::new("us-west-2", "EC2"));
        planned.planned = 1;
        assert!(!planned.is_converged(), "a dry run leaves the boundary as it was");
    }
}
