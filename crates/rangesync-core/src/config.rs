//! Configuration types for the rangesync system
//!
//! This module defines all configuration structures used throughout the crate.
//! Values are resolved at deployment time (the daemon reads them from the
//! environment); nothing here changes while an invocation runs.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::model::{IpVersion, Scope};

/// Main rangesync configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Range feed configuration
    pub feed: FeedConfig,

    /// Range store configuration
    pub store: StoreConfig,

    /// Security boundary configuration
    pub boundary: BoundaryConfig,

    /// Scopes this deployment tracks
    pub scopes: Vec<ScopeConfig>,

    /// Ingestor settings
    #[serde(default)]
    pub ingest: IngestConfig,

    /// Reconciler settings
    #[serde(default)]
    pub reconcile: ReconcileConfig,
}

impl SyncConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        self.validate_ingest()?;
        self.boundary.validate()?;
        self.reconcile.validate()?;

        Ok(())
    }

    /// Validate only what ingestion needs; the boundary is never touched
    pub fn validate_ingest(&self) -> Result<(), crate::Error> {
        if self.enabled_scopes().is_empty() {
            return Err(crate::Error::config("No scopes configured"));
        }

        self.feed.validate()?;
        self.store.validate()?;

        Ok(())
    }

    /// Scopes that are enabled, in configuration order
    pub fn enabled_scopes(&self) -> Vec<Scope> {
        self.scopes
            .iter()
            .filter(|s| s.enabled)
            .map(|s| s.scope.clone())
            .collect()
    }
}

/// Range feed configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FeedConfig {
    /// HTTP(S) range document
    Http {
        /// Document URL used when the notification names none (or a non-https one)
        url: String,
        /// Request timeout in seconds
        #[serde(default = "default_fetch_timeout_secs")]
        timeout_secs: u64,
    },

    /// Custom feed
    Custom {
        /// Factory name to use
        factory: String,
        /// Custom configuration data
        config: serde_json::Value,
    },
}

impl FeedConfig {
    /// Validate the feed configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        match self {
            FeedConfig::Http { url, timeout_secs } => {
                if url.is_empty() {
                    return Err(crate::Error::config("Feed URL cannot be empty"));
                }
                if !url.starts_with("https://") && !url.starts_with("http://") {
                    return Err(crate::Error::config(format!(
                        "Feed URL must use HTTP or HTTPS scheme. Got: {}",
                        url
                    )));
                }
                if *timeout_secs == 0 {
                    return Err(crate::Error::config("Feed timeout must be > 0"));
                }
                Ok(())
            }
            FeedConfig::Custom { factory, config } => {
                validate_custom("feed", factory, config)
            }
        }
    }

    /// Get the feed type name
    pub fn type_name(&self) -> &str {
        match self {
            FeedConfig::Http { .. } => "http",
            FeedConfig::Custom { factory, .. } => factory,
        }
    }
}

impl Default for FeedConfig {
    fn default() -> Self {
        FeedConfig::Http {
            url: DEFAULT_FEED_URL.to_string(),
            timeout_secs: default_fetch_timeout_secs(),
        }
    }
}

/// Published AWS IP range document
pub const DEFAULT_FEED_URL: &str = "https://ip-ranges.amazonaws.com/ip-ranges.json";

/// Range store configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StoreConfig {
    /// File-based store
    File {
        /// Path to the store file
        path: String,
    },

    /// In-memory store (not persistent)
    #[default]
    Memory,

    /// Custom store
    Custom {
        /// Factory name to use
        factory: String,
        /// Custom configuration data
        config: serde_json::Value,
    },
}

impl StoreConfig {
    /// Validate the store configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        match self {
            StoreConfig::File { path } if path.is_empty() => {
                Err(crate::Error::config("Store path cannot be empty"))
            }
            StoreConfig::Custom { factory, config } => validate_custom("store", factory, config),
            _ => Ok(()),
        }
    }

    /// Get the store type name
    pub fn type_name(&self) -> &str {
        match self {
            StoreConfig::File { .. } => "file",
            StoreConfig::Memory => "memory",
            StoreConfig::Custom { factory, .. } => factory,
        }
    }
}

/// Security boundary configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BoundaryConfig {
    /// REST security-group API
    Rest {
        /// API base URL
        endpoint: String,
        /// Bearer token
        api_token: String,
        /// Security group identifier
        boundary_id: String,
        /// Permission opened for every managed CIDR
        #[serde(default)]
        permission: RulePermission,
    },

    /// Custom boundary
    Custom {
        /// Factory name to use
        factory: String,
        /// Custom configuration data
        config: serde_json::Value,
    },
}

impl BoundaryConfig {
    /// Validate the boundary configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        match self {
            BoundaryConfig::Rest {
                endpoint,
                api_token,
                boundary_id,
                permission,
            } => {
                if endpoint.is_empty() {
                    return Err(crate::Error::config("Boundary endpoint cannot be empty"));
                }
                if api_token.is_empty() {
                    return Err(crate::Error::config("Boundary API token cannot be empty"));
                }
                if boundary_id.is_empty() {
                    return Err(crate::Error::config("Boundary ID cannot be empty"));
                }
                permission.validate()
            }
            BoundaryConfig::Custom { factory, config } => {
                validate_custom("boundary", factory, config)
            }
        }
    }

    /// Get the boundary type name
    pub fn type_name(&self) -> &str {
        match self {
            BoundaryConfig::Rest { .. } => "rest",
            BoundaryConfig::Custom { factory, .. } => factory,
        }
    }
}

/// Protocol and port range opened by each managed rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RulePermission {
    /// `tcp`, `udp` or `-1` (all)
    pub protocol: String,
    pub from_port: u16,
    pub to_port: u16,
}

impl RulePermission {
    pub fn validate(&self) -> Result<(), crate::Error> {
        match self.protocol.as_str() {
            "tcp" | "udp" | "-1" => {}
            other => {
                return Err(crate::Error::config(format!(
                    "Unsupported rule protocol '{}'. Supported: tcp, udp, -1",
                    other
                )));
            }
        }
        if self.from_port > self.to_port {
            return Err(crate::Error::config(format!(
                "Rule port range is inverted: {}-{}",
                self.from_port, self.to_port
            )));
        }
        Ok(())
    }
}

impl Default for RulePermission {
    fn default() -> Self {
        Self {
            protocol: "tcp".to_string(),
            from_port: 443,
            to_port: 443,
        }
    }
}

/// A tracked scope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScopeConfig {
    pub scope: Scope,

    /// Whether this scope is ingested and reconciled
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl ScopeConfig {
    pub fn new(scope: Scope) -> Self {
        Self {
            scope,
            enabled: true,
        }
    }

    /// Enable or disable the scope
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

/// IP versions to ingest
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IpVersionFilter {
    /// IPv4 only
    V4,
    /// IPv6 only
    V6,
    /// Both IPv4 and IPv6
    #[default]
    Both,
}

impl IpVersionFilter {
    pub fn accepts(&self, version: IpVersion) -> bool {
        matches!(
            (self, version),
            (IpVersionFilter::Both, _)
                | (IpVersionFilter::V4, IpVersion::V4)
                | (IpVersionFilter::V6, IpVersion::V6)
        )
    }
}

/// Ingestor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Upper bound on one document fetch (in seconds)
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,

    /// IP versions to ingest
    #[serde(default)]
    pub ip_version: IpVersionFilter,
}

impl IngestConfig {
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            fetch_timeout_secs: default_fetch_timeout_secs(),
            ip_version: IpVersionFilter::default(),
        }
    }
}

/// Reconciler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileConfig {
    /// Upper bound on each boundary call (in seconds)
    #[serde(default = "default_apply_timeout_secs")]
    pub apply_timeout_secs: u64,

    /// Lifetime of a scope lease (in seconds)
    ///
    /// Must comfortably exceed the longest expected reconciliation run;
    /// a crashed holder blocks its scope for at most this long.
    #[serde(default = "default_lease_ttl_secs")]
    pub lease_ttl_secs: u64,

    /// How long a range absent from the latest feed is kept on the boundary
    /// (in seconds)
    ///
    /// 0 removes it on the first reconciliation after the feed drops it.
    #[serde(default)]
    pub removal_grace_secs: u64,

    /// Prefix of the management tag put on every created rule
    #[serde(default = "default_tag_prefix")]
    pub tag_prefix: String,

    /// Capacity of the pipeline event channel
    ///
    /// When full, new events are dropped (with a warning log).
    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,
}

impl ReconcileConfig {
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.apply_timeout_secs == 0 {
            return Err(crate::Error::config("Apply timeout must be > 0"));
        }
        if self.lease_ttl_secs == 0 {
            return Err(crate::Error::config("Lease TTL must be > 0"));
        }
        if self.tag_prefix.is_empty() || self.tag_prefix.contains(char::is_whitespace) {
            return Err(crate::Error::config(
                "Tag prefix must be non-empty and contain no whitespace",
            ));
        }
        Ok(())
    }

    pub fn apply_timeout(&self) -> Duration {
        Duration::from_secs(self.apply_timeout_secs)
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }

    pub fn removal_grace(&self) -> Duration {
        Duration::from_secs(self.removal_grace_secs)
    }
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            apply_timeout_secs: default_apply_timeout_secs(),
            lease_ttl_secs: default_lease_ttl_secs(),
            removal_grace_secs: 0,
            tag_prefix: default_tag_prefix(),
            event_channel_capacity: default_event_channel_capacity(),
        }
    }
}

fn validate_custom(
    kind: &str,
    factory: &str,
    config: &serde_json::Value,
) -> Result<(), crate::Error> {
    if factory.is_empty() {
        return Err(crate::Error::config(format!(
            "Custom {} factory cannot be empty",
            kind
        )));
    }
    if config.is_null() {
        return Err(crate::Error::config(format!(
            "Custom {} config cannot be null",
            kind
        )));
    }
    Ok(())
}

fn default_enabled() -> bool {
    true
}

fn default_fetch_timeout_secs() -> u64 {
    30
}

fn default_apply_timeout_secs() -> u64 {
    10
}

fn default_lease_ttl_secs() -> u64 {
    300
}

fn default_tag_prefix() -> String {
    "rangesync".to_string()
}

fn default_event_channel_capacity() -> usize {
    1000
}
