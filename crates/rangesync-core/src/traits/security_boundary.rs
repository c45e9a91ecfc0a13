// # Security Boundary Trait
//
// Defines the interface for the live network-access-control resource
// (e.g. a security group) whose rules are converged to the stored ranges.
//
// ## Implementations
//
// - REST security-group API: `rangesync-boundary-rest` crate
//
// ## Management Tag
//
// Every rule this system creates carries a tag (the rule description)
// naming the scope it belongs to. Listing is always filtered by that tag, so
// manually-added rules and rules of other scopes are never seen, and
// therefore never removed, by a reconciliation run.

use async_trait::async_trait;

use crate::error::Error;
use crate::model::{Cidr, Scope};

/// One live rule on the boundary
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundaryRule {
    pub cidr: Cidr,
    /// The management tag (rule description)
    pub description: String,
}

/// Outcome of a single idempotent rule mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The boundary changed
    Applied,
    /// Add found the rule already there
    AlreadyPresent,
    /// Remove found the rule already gone
    AlreadyAbsent,
    /// Dry-run: the change was logged, the boundary is untouched
    Planned,
}

/// Build the management tag for a scope, e.g. `rangesync:us-west-2#EC2`
pub fn managed_tag(prefix: &str, scope: &Scope) -> String {
    format!("{}:{}", prefix, scope.key())
}

/// Trait for security boundary implementations
///
/// # Trust Level: Untrusted
///
/// ## Allowed Capabilities
/// - ✅ Perform API calls to the boundary's endpoint only
/// - ✅ Parse provider-specific responses
///
/// ## Forbidden Capabilities
/// - ❌ Retry or back off (the trigger owns redelivery)
/// - ❌ Access the range store
/// - ❌ Decide which rules should exist (owned by `Reconciler`)
///
/// # Idempotency
///
/// `add_rule` on an existing rule and `remove_rule` on a missing rule are
/// not errors; they report [`ApplyOutcome::AlreadyPresent`] /
/// [`ApplyOutcome::AlreadyAbsent`]. This is what lets a partially-applied
/// reconciliation be rerun safely.
#[async_trait]
pub trait SecurityBoundary: Send + Sync {
    /// List current rules carrying `tag`
    async fn list_managed_rules(&self, tag: &str) -> Result<Vec<BoundaryRule>, Error>;

    /// Add an ingress rule for `cidr` tagged with `tag` (add-if-absent)
    async fn add_rule(&self, cidr: &Cidr, tag: &str) -> Result<ApplyOutcome, Error>;

    /// Remove the rule for `cidr` tagged with `tag` (remove-if-present)
    async fn remove_rule(&self, cidr: &Cidr, tag: &str) -> Result<ApplyOutcome, Error>;

    /// Identifier of the boundary being converged (e.g. `sg-0123`)
    fn boundary_id(&self) -> &str;

    /// Get the provider name (for logging/debugging)
    fn provider_name(&self) -> &'static str;
}

/// Helper trait for constructing security boundaries from configuration
pub trait SecurityBoundaryFactory: Send + Sync {
    /// Create a SecurityBoundary instance from configuration
    fn create(
        &self,
        config: &crate::config::BoundaryConfig,
    ) -> Result<Box<dyn SecurityBoundary>, Error>;
}
