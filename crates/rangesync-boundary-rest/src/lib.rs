// # REST Security Boundary
//
// This crate provides a `SecurityBoundary` backed by a JSON REST
// security-group API.
//
// ## Trust Level: Untrusted
//
// The boundary is isolated, stateless and single-shot:
// - ✅ One HTTP request per rule change
// - ✅ Full error propagation to the reconciler
// - ✅ HTTP timeout configured (30 seconds)
// - ✅ Status code mapping (401/403, 404, 409, 429, 5xx)
// - ✅ Dry-run mode for safe testing
// - ❌ NO retry or backoff (the trigger owns redelivery)
// - ❌ NO caching (the range store is the source of truth)
//
// ## Security Requirements
//
// - API token NEVER appears in logs or `Debug` output
// - API token MUST be provided via environment variables only
// - Construction fails fast if the token is empty
//
// ## API Reference
//
// - List rules: GET `{endpoint}/security-groups/{id}/rules?description={tag}`
// - Add rule: POST `{endpoint}/security-groups/{id}/rules`
// - Remove rule: DELETE `{endpoint}/security-groups/{id}/rules`
//
// Rule body:
//
// ```json
// { "cidr": "3.5.140.0/22", "description": "rangesync:us-west-2#EC2",
//   "protocol": "tcp", "from_port": 443, "to_port": 443 }
// ```

use async_trait::async_trait;
use rangesync_core::PluginRegistry;
use rangesync_core::config::{BoundaryConfig, RulePermission};
use rangesync_core::model::Cidr;
use rangesync_core::traits::{
    ApplyOutcome, BoundaryRule, SecurityBoundary, SecurityBoundaryFactory,
};
use rangesync_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default HTTP timeout for API requests (30 seconds)
const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(30);

const PROVIDER: &str = "rest";

/// Wire form of one rule
#[derive(Debug, Serialize, Deserialize)]
struct RuleBody {
    cidr: String,
    description: String,
    #[serde(default)]
    protocol: Option<String>,
    #[serde(default)]
    from_port: Option<u16>,
    #[serde(default)]
    to_port: Option<u16>,
}

#[derive(Debug, Deserialize)]
struct RuleList {
    #[serde(default)]
    rules: Vec<RuleBody>,
}

/// REST security-group boundary
///
/// # Dry-Run Mode
///
/// When `dry_run` is true the boundary will:
/// - Perform all GET requests (rule listing)
/// - Log the intended POST/DELETE payload
/// - **NOT** actually modify the security group
///
/// # Security
///
/// The Debug implementation does NOT expose the API token.
pub struct RestSecurityBoundary {
    /// API base URL, without a trailing slash
    endpoint: String,

    /// Bearer token
    /// ⚠️ NEVER log this value
    api_token: String,

    /// Security group identifier
    boundary_id: String,

    /// Protocol and ports opened by each rule
    permission: RulePermission,

    /// HTTP client for API requests
    client: reqwest::Client,

    /// Dry-run mode: if true, perform GET requests but skip mutations
    dry_run: bool,
}

impl std::fmt::Debug for RestSecurityBoundary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestSecurityBoundary")
            .field("endpoint", &self.endpoint)
            .field("api_token", &"<REDACTED>")
            .field("boundary_id", &self.boundary_id)
            .field("permission", &self.permission)
            .field("dry_run", &self.dry_run)
            .finish()
    }
}

impl RestSecurityBoundary {
    /// Create a new REST boundary
    ///
    /// # Parameters
    ///
    /// - `endpoint`: API base URL (e.g. `https://netapi.internal/v1`)
    /// - `api_token`: Bearer token with rule edit permissions
    /// - `boundary_id`: Security group to converge
    /// - `permission`: Protocol and ports opened by each managed rule
    /// - `dry_run`: If true, perform GET requests but skip mutations
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the token is empty or the HTTP client
    /// cannot be built.
    pub fn new(
        endpoint: impl Into<String>,
        api_token: impl Into<String>,
        boundary_id: impl Into<String>,
        permission: RulePermission,
        dry_run: bool,
    ) -> Result<Self> {
        let api_token = api_token.into();
        if api_token.is_empty() {
            return Err(Error::config("Boundary API token cannot be empty"));
        }

        let client = reqwest::Client::builder()
            .timeout(DEFAULT_HTTP_TIMEOUT)
            .build()
            .map_err(|e| Error::config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            api_token,
            boundary_id: boundary_id.into(),
            permission,
            client,
            dry_run,
        })
    }

    /// Whether mutations are only logged
    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    fn rules_url(&self) -> String {
        format!(
            "{}/security-groups/{}/rules",
            self.endpoint, self.boundary_id
        )
    }

    fn body(&self, cidr: &Cidr, tag: &str) -> RuleBody {
        RuleBody {
            cidr: cidr.to_string(),
            description: tag.to_string(),
            protocol: Some(self.permission.protocol.clone()),
            from_port: Some(self.permission.from_port),
            to_port: Some(self.permission.to_port),
        }
    }

    /// Map a non-success response to an error
    async fn status_error(response: reqwest::Response, what: &str) -> Error {
        let status = response.status();
        let error_text = response
            .text()
            .await
            .unwrap_or_else(|_| "Unable to read error response".to_string());

        match status.as_u16() {
            401 | 403 => Error::auth(format!(
                "Invalid API token or insufficient permissions. Status: {}",
                status
            )),
            404 => Error::not_found(format!("{}: {}", what, status)),
            429 => Error::rate_limited(format!(
                "Rate limit exceeded. Please retry later. Status: {}",
                status
            )),
            500..=599 => Error::provider(
                PROVIDER,
                format!("Server error (transient): {} - {}", status, error_text),
            ),
            _ => Error::provider(
                PROVIDER,
                format!("{} failed: {} - {}", what, status, error_text),
            ),
        }
    }
}

#[async_trait]
impl SecurityBoundary for RestSecurityBoundary {
    /// List rules carrying `tag`
    ///
    /// # API Call
    ///
    /// ```http
    /// GET /security-groups/:id/rules?description=rangesync:us-west-2%23EC2
    /// Authorization: Bearer <token>
    /// ```
    async fn list_managed_rules(&self, tag: &str) -> Result<Vec<BoundaryRule>> {
        let response = self
            .client
            .get(self.rules_url())
            .bearer_auth(&self.api_token)
            .query(&[("description", tag)])
            .send()
            .await
            .map_err(|e| Error::http(format!("HTTP request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(Self::status_error(
                response,
                &format!("Security group {}", self.boundary_id),
            )
            .await);
        }

        let list: RuleList = response
            .json()
            .await
            .map_err(|e| Error::provider(PROVIDER, format!("Failed to parse response: {}", e)))?;

        let mut rules = Vec::with_capacity(list.rules.len());
        for rule in list.rules {
            // The server-side filter is advisory; never hand back foreign rules
            if rule.description != tag {
                continue;
            }
            let cidr: Cidr = rule.cidr.parse().map_err(|e| {
                Error::provider(PROVIDER, format!("Invalid CIDR in response: {}", e))
            })?;
            rules.push(BoundaryRule {
                cidr,
                description: rule.description,
            });
        }

        tracing::debug!(
            "Security group {} has {} rules tagged {}",
            self.boundary_id,
            rules.len(),
            tag
        );
        Ok(rules)
    }

    /// Add an ingress rule; HTTP 409 means it already exists
    async fn add_rule(&self, cidr: &Cidr, tag: &str) -> Result<ApplyOutcome> {
        let body = self.body(cidr, tag);

        if self.dry_run {
            tracing::info!(
                "[DRY-RUN] Would send POST request to {} with payload: {}",
                self.rules_url(),
                serde_json::to_string(&body)?
            );
            return Ok(ApplyOutcome::Planned);
        }

        let response = self
            .client
            .post(self.rules_url())
            .bearer_auth(&self.api_token)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::http(format!("HTTP request failed: {}", e)))?;

        if response.status().as_u16() == 409 {
            tracing::debug!("Rule for {} already present in {}", cidr, self.boundary_id);
            return Ok(ApplyOutcome::AlreadyPresent);
        }
        if !response.status().is_success() {
            return Err(Self::status_error(response, "Add rule").await);
        }

        tracing::info!("Added rule for {} to {} ({})", cidr, self.boundary_id, tag);
        Ok(ApplyOutcome::Applied)
    }

    /// Remove an ingress rule; HTTP 404 means it is already gone
    async fn remove_rule(&self, cidr: &Cidr, tag: &str) -> Result<ApplyOutcome> {
        let body = self.body(cidr, tag);

        if self.dry_run {
            tracing::info!(
                "[DRY-RUN] Would send DELETE request to {} with payload: {}",
                self.rules_url(),
                serde_json::to_string(&body)?
            );
            return Ok(ApplyOutcome::Planned);
        }

        let response = self
            .client
            .delete(self.rules_url())
            .bearer_auth(&self.api_token)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::http(format!("HTTP request failed: {}", e)))?;

        if response.status().as_u16() == 404 {
            tracing::debug!("Rule for {} already absent from {}", cidr, self.boundary_id);
            return Ok(ApplyOutcome::AlreadyAbsent);
        }
        if !response.status().is_success() {
            return Err(Self::status_error(response, "Remove rule").await);
        }

        tracing::info!(
            "Removed rule for {} from {} ({})",
            cidr,
            self.boundary_id,
            tag
        );
        Ok(ApplyOutcome::Applied)
    }

    fn boundary_id(&self) -> &str {
        &self.boundary_id
    }

    fn provider_name(&self) -> &'static str {
        PROVIDER
    }
}

/// Factory for creating REST boundaries
pub struct RestBoundaryFactory;

impl SecurityBoundaryFactory for RestBoundaryFactory {
    fn create(&self, config: &BoundaryConfig) -> Result<Box<dyn SecurityBoundary>> {
        match config {
            BoundaryConfig::Rest {
                endpoint,
                api_token,
                boundary_id,
                permission,
            } => {
                if api_token.is_empty() {
                    return Err(Error::config("Boundary API token is required"));
                }

                // Check for dry-run mode environment variable
                let dry_run = std::env::var("RANGESYNC_MODE")
                    .unwrap_or_default()
                    .eq_ignore_ascii_case("dry-run");

                if dry_run {
                    tracing::warn!(
                        "REST boundary running in DRY-RUN mode - no changes will be made"
                    );
                }

                Ok(Box::new(RestSecurityBoundary::new(
                    endpoint.clone(),
                    api_token.clone(),
                    boundary_id.clone(),
                    permission.clone(),
                    dry_run,
                )?))
            }
            _ => Err(Error::config("Invalid config for REST boundary")),
        }
    }
}

/// Register the REST boundary with a registry
///
/// # Example
///
/// ```rust
/// use rangesync_core::PluginRegistry;
///
/// let registry = PluginRegistry::new();
/// rangesync_boundary_rest::register(&registry);
/// assert!(registry.has_boundary("rest"));
/// ```
pub fn register(registry: &PluginRegistry) {
    registry.register_boundary("rest", Box::new(RestBoundaryFactory));
}
