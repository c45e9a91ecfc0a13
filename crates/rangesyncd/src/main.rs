// # rangesyncd - rangesync invocation entry point
//
// A THIN integration layer: every decision lives in rangesync-core. Each
// process handles one invocation and exits, the way a triggered function
// would.
//
// The rangesyncd binary is responsible for:
// 1. Reading configuration from environment variables
// 2. Initializing logging and the runtime
// 3. Registering feeds, stores and boundaries
// 4. Running one command and mapping its outcome to an exit code
//
// ## Commands
//
// - `ingest`: read a change notification (JSON) from stdin and ingest it
// - `reconcile [region:service ...]`: converge the given scopes (default: all)
// - `sync` (default): ingest an empty notification, then reconcile all scopes
//
// ## Configuration
//
// ### Feed
// - `RANGESYNC_FEED_URL`: Default range document URL
// - `RANGESYNC_FETCH_TIMEOUT_SECS`: Fetch timeout in seconds
// - `RANGESYNC_IP_VERSION`: `v4`, `v6` or `both`
//
// ### Store
// - `RANGESYNC_STORE_TYPE`: `file` or `memory` (`sync` only)
// - `RANGESYNC_STORE_PATH`: Path to the store file (for file store)
//
// ### Boundary
// - `RANGESYNC_BOUNDARY_ENDPOINT`: Security-group API base URL
// - `RANGESYNC_BOUNDARY_API_TOKEN`: API token
// - `RANGESYNC_BOUNDARY_ID`: Security group identifier
// - `RANGESYNC_RULE_PROTOCOL`, `RANGESYNC_RULE_FROM_PORT`, `RANGESYNC_RULE_TO_PORT`
// - `RANGESYNC_MODE`: `dry-run` to log mutations instead of applying them
//
// ### Reconciliation
// - `RANGESYNC_SCOPES`: Comma-separated `region:service` list
// - `RANGESYNC_APPLY_TIMEOUT_SECS`: Bound on each boundary call
// - `RANGESYNC_LEASE_TTL_SECS`: Scope lease lifetime
// - `RANGESYNC_REMOVAL_GRACE_SECS`: Delay before dropped ranges are removed
// - `RANGESYNC_TAG_PREFIX`: Management tag prefix
//
// ## Example
//
// ```bash
// export RANGESYNC_STORE_TYPE=file
// export RANGESYNC_STORE_PATH=/var/lib/rangesync/ranges.json
// export RANGESYNC_BOUNDARY_ENDPOINT=https://netapi.internal/v1
// export RANGESYNC_BOUNDARY_API_TOKEN=your_token
// export RANGESYNC_BOUNDARY_ID=sg-0123456789abcdef0
// export RANGESYNC_SCOPES=us-west-2:EC2,us-west-2:S3
//
// rangesyncd ingest < notification.json
// rangesyncd reconcile us-west-2:EC2
// ```

use anyhow::{Context, Result};
use rangesync_core::config::{
    BoundaryConfig, FeedConfig, IngestConfig, IpVersionFilter, ReconcileConfig, RulePermission,
    ScopeConfig, StoreConfig, SyncConfig,
};
use rangesync_core::{
    ChangeNotification, EventSink, Ingestor, PluginRegistry, Reconciler, Scope, SyncEvent,
};
use std::env;
use std::process::ExitCode;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio_stream::StreamExt;
use tracing::{Level, debug, error, info, warn};
use tracing_subscriber::FmtSubscriber;

/// Exit codes for the invocation outcome
///
/// - 0: Completed, boundary converged
/// - 1: Configuration or startup error
/// - 2: Runtime error (fetch, store, boundary listing)
/// - 3: Reconciliation completed with skipped rule changes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RangesyncExitCode {
    Success = 0,
    ConfigError = 1,
    RuntimeError = 2,
    Partial = 3,
}

impl From<RangesyncExitCode> for ExitCode {
    fn from(code: RangesyncExitCode) -> Self {
        ExitCode::from(code as u8)
    }
}

/// How long to wait for the event log to drain after a run
const EVENT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Command selected on the command line
#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    Ingest,
    Reconcile(Vec<Scope>),
    Sync,
}

impl Command {
    fn touches_boundary(&self) -> bool {
        !matches!(self, Command::Ingest)
    }

    fn from_args(mut args: impl Iterator<Item = String>) -> Result<Self> {
        match args.next().as_deref() {
            None | Some("sync") => Ok(Command::Sync),
            Some("ingest") => Ok(Command::Ingest),
            Some("reconcile") => {
                let scopes = args
                    .map(|s| Scope::from_str(&s).map_err(anyhow::Error::from))
                    .collect::<Result<Vec<_>>>()?;
                Ok(Command::Reconcile(scopes))
            }
            Some(other) => anyhow::bail!(
                "Unknown command '{}'. Valid commands: ingest, reconcile, sync",
                other
            ),
        }
    }
}

/// Raw environment configuration
struct Config {
    feed_url: String,
    fetch_timeout_secs: Option<u64>,
    ip_version: String,
    store_type: String,
    store_path: Option<String>,
    boundary_endpoint: String,
    boundary_api_token: String,
    boundary_id: String,
    rule_protocol: Option<String>,
    rule_from_port: Option<u16>,
    rule_to_port: Option<u16>,
    scopes: Vec<Scope>,
    apply_timeout_secs: Option<u64>,
    lease_ttl_secs: Option<u64>,
    removal_grace_secs: Option<u64>,
    tag_prefix: Option<String>,
    log_level: String,
}

impl Config {
    /// Load configuration from environment variables
    fn from_env() -> Result<Self> {
        Ok(Self {
            feed_url: env::var("RANGESYNC_FEED_URL")
                .unwrap_or_else(|_| rangesync_core::config::DEFAULT_FEED_URL.to_string()),
            fetch_timeout_secs: parse_env("RANGESYNC_FETCH_TIMEOUT_SECS")?,
            ip_version: env::var("RANGESYNC_IP_VERSION").unwrap_or_else(|_| "both".to_string()),
            store_type: env::var("RANGESYNC_STORE_TYPE").unwrap_or_else(|_| "file".to_string()),
            store_path: env::var("RANGESYNC_STORE_PATH").ok(),
            boundary_endpoint: env::var("RANGESYNC_BOUNDARY_ENDPOINT").unwrap_or_default(),
            boundary_api_token: env::var("RANGESYNC_BOUNDARY_API_TOKEN").unwrap_or_default(),
            boundary_id: env::var("RANGESYNC_BOUNDARY_ID").unwrap_or_default(),
            rule_protocol: env::var("RANGESYNC_RULE_PROTOCOL").ok(),
            rule_from_port: parse_env("RANGESYNC_RULE_FROM_PORT")?,
            rule_to_port: parse_env("RANGESYNC_RULE_TO_PORT")?,
            scopes: parse_scopes(&env::var("RANGESYNC_SCOPES").unwrap_or_default())?,
            apply_timeout_secs: parse_env("RANGESYNC_APPLY_TIMEOUT_SECS")?,
            lease_ttl_secs: parse_env("RANGESYNC_LEASE_TTL_SECS")?,
            removal_grace_secs: parse_env("RANGESYNC_REMOVAL_GRACE_SECS")?,
            tag_prefix: env::var("RANGESYNC_TAG_PREFIX").ok(),
            log_level: env::var("RANGESYNC_LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        })
    }

    /// Validate values the core config types can't check
    fn validate(&self, command: &Command) -> Result<()> {
        if command.touches_boundary() {
            self.validate_boundary()?;
        }

        if self.scopes.is_empty() {
            anyhow::bail!(
                "RANGESYNC_SCOPES must contain at least one scope. \
                Set it via: export RANGESYNC_SCOPES=us-west-2:EC2,us-west-2:S3"
            );
        }

        match self.store_type.as_str() {
            "file" => match self.store_path.as_deref() {
                None | Some("") => anyhow::bail!(
                    "RANGESYNC_STORE_PATH is required when RANGESYNC_STORE_TYPE=file. \
                    Set it via: export RANGESYNC_STORE_PATH=/var/lib/rangesync/ranges.json"
                ),
                Some(path) => {
                    if let Some(parent) = std::path::Path::new(path).parent()
                        && !parent.as_os_str().is_empty()
                        && !parent.exists()
                    {
                        anyhow::bail!(
                            "RANGESYNC_STORE_PATH parent directory does not exist: {}. \
                            Create it first: sudo mkdir -p {}",
                            parent.display(),
                            parent.display()
                        );
                    }
                }
            },
            // An empty store would make reconcile strip every managed rule
            "memory" if *command != Command::Sync => anyhow::bail!(
                "RANGESYNC_STORE_TYPE=memory keeps nothing between invocations. \
                Use it with the `sync` command only, or set RANGESYNC_STORE_TYPE=file"
            ),
            "memory" => {}
            other => anyhow::bail!(
                "RANGESYNC_STORE_TYPE '{}' is not supported. Supported types: file, memory",
                other
            ),
        }

        match self.ip_version.to_lowercase().as_str() {
            "v4" | "v6" | "both" => {}
            other => anyhow::bail!(
                "RANGESYNC_IP_VERSION '{}' is not valid. Valid values: v4, v6, both",
                other
            ),
        }

        if self.feed_url.starts_with("http://") {
            eprintln!(
                "WARNING: RANGESYNC_FEED_URL uses HTTP (not HTTPS). \
                The range document is trusted input; prefer HTTPS."
            );
        }

        log_level(&self.log_level)?;

        Ok(())
    }

    fn validate_boundary(&self) -> Result<()> {
        if self.boundary_api_token.is_empty() {
            anyhow::bail!(
                "RANGESYNC_BOUNDARY_API_TOKEN is required. \
                Set it via: export RANGESYNC_BOUNDARY_API_TOKEN=your_token"
            );
        }

        // Check for obvious placeholder tokens (common mistake)
        let token_lower = self.boundary_api_token.to_lowercase();
        if token_lower.contains("your_token")
            || token_lower.contains("replace_me")
            || token_lower == "token"
        {
            anyhow::bail!(
                "RANGESYNC_BOUNDARY_API_TOKEN appears to be a placeholder. \
                Use an actual API token."
            );
        }

        Ok(())
    }

    /// Build the core configuration
    fn to_sync_config(&self) -> SyncConfig {
        let ingest_defaults = IngestConfig::default();
        let reconcile_defaults = ReconcileConfig::default();
        let permission_defaults = RulePermission::default();

        let store = match self.store_type.as_str() {
            "memory" => StoreConfig::Memory,
            _ => StoreConfig::File {
                path: self.store_path.clone().unwrap_or_default(),
            },
        };

        let ip_version = match self.ip_version.to_lowercase().as_str() {
            "v4" => IpVersionFilter::V4,
            "v6" => IpVersionFilter::V6,
            _ => IpVersionFilter::Both,
        };

        let fetch_timeout_secs = self
            .fetch_timeout_secs
            .unwrap_or(ingest_defaults.fetch_timeout_secs);

        SyncConfig {
            feed: FeedConfig::Http {
                url: self.feed_url.clone(),
                timeout_secs: fetch_timeout_secs,
            },
            store,
            boundary: BoundaryConfig::Rest {
                endpoint: self.boundary_endpoint.clone(),
                api_token: self.boundary_api_token.clone(),
                boundary_id: self.boundary_id.clone(),
                permission: RulePermission {
                    protocol: self
                        .rule_protocol
                        .clone()
                        .unwrap_or(permission_defaults.protocol),
                    from_port: self.rule_from_port.unwrap_or(permission_defaults.from_port),
                    to_port: self.rule_to_port.unwrap_or(permission_defaults.to_port),
                },
            },
            scopes: self.scopes.iter().cloned().map(ScopeConfig::new).collect(),
            ingest: IngestConfig {
                fetch_timeout_secs,
                ip_version,
            },
            reconcile: ReconcileConfig {
                apply_timeout_secs: self
                    .apply_timeout_secs
                    .unwrap_or(reconcile_defaults.apply_timeout_secs),
                lease_ttl_secs: self
                    .lease_ttl_secs
                    .unwrap_or(reconcile_defaults.lease_ttl_secs),
                removal_grace_secs: self
                    .removal_grace_secs
                    .unwrap_or(reconcile_defaults.removal_grace_secs),
                tag_prefix: self
                    .tag_prefix
                    .clone()
                    .unwrap_or(reconcile_defaults.tag_prefix),
                event_channel_capacity: reconcile_defaults.event_channel_capacity,
            },
        }
    }
}

/// Parse an optional numeric environment variable
fn parse_env<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("{} has an invalid value '{}': {}", name, raw, e)),
        _ => Ok(None),
    }
}

/// Parse `region:service,region:service`
fn parse_scopes(raw: &str) -> Result<Vec<Scope>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            Scope::from_str(s)
                .with_context(|| format!("Invalid scope in RANGESYNC_SCOPES: '{}'", s))
        })
        .collect()
}

fn log_level(raw: &str) -> Result<Level> {
    match raw.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => anyhow::bail!(
            "RANGESYNC_LOG_LEVEL '{}' is not valid. \
            Valid levels: trace, debug, info, warn, error",
            raw
        ),
    }
}

fn main() -> ExitCode {
    let command = match Command::from_args(env::args().skip(1)) {
        Ok(command) => command,
        Err(e) => {
            eprintln!("Usage error: {}", e);
            return RangesyncExitCode::ConfigError.into();
        }
    };

    // Load configuration from environment
    let config = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            return RangesyncExitCode::ConfigError.into();
        }
    };

    if let Err(e) = config.validate(&command) {
        eprintln!("Configuration validation error: {}", e);
        return RangesyncExitCode::ConfigError.into();
    }

    let sync_config = config.to_sync_config();
    let validated = if command.touches_boundary() {
        sync_config.validate()
    } else {
        sync_config.validate_ingest()
    };
    if let Err(e) = validated {
        eprintln!("Configuration validation error: {}", e);
        return RangesyncExitCode::ConfigError.into();
    }

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level(&config.log_level).unwrap_or(Level::INFO))
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
        return RangesyncExitCode::ConfigError.into();
    }

    info!("Starting rangesyncd ({:?})", command);
    info!(
        "Configuration loaded: {} scope(s)",
        sync_config.enabled_scopes().len()
    );

    let rt = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to create tokio runtime: {}", e);
            return RangesyncExitCode::RuntimeError.into();
        }
    };

    let code = rt.block_on(async {
        match run(command, sync_config).await {
            Ok(code) => code,
            Err(e) => {
                error!("Invocation failed: {:#}", e);
                RangesyncExitCode::RuntimeError
            }
        }
    });

    code.into()
}

/// Build the registry with every compiled-in integration
fn registry() -> PluginRegistry {
    let registry = PluginRegistry::with_builtin_stores();

    #[cfg(feature = "http")]
    {
        debug!("Registering HTTP range feed");
        rangesync_feed_http::register(&registry);
    }

    #[cfg(feature = "rest")]
    {
        debug!("Registering REST security boundary");
        rangesync_boundary_rest::register(&registry);
    }

    registry
}

/// Run one command
async fn run(command: Command, config: SyncConfig) -> Result<RangesyncExitCode> {
    let registry = registry();
    let store: Arc<dyn rangesync_core::RangeStore> =
        Arc::from(registry.create_store(&config.store).await?);

    let (events, mut stream) = EventSink::channel(config.reconcile.event_channel_capacity);
    let drain = tokio::spawn(async move {
        while let Some(event) = stream.next().await {
            log_event(&event);
        }
    });

    let outcome = match command {
        Command::Ingest => {
            let notification = read_notification().await?;
            ingest(&registry, &config, Arc::clone(&store), events, &notification).await
        }
        Command::Reconcile(scopes) => {
            let scopes = if scopes.is_empty() {
                config.enabled_scopes()
            } else {
                scopes
            };
            reconcile(&registry, &config, store, events, &scopes).await
        }
        Command::Sync => {
            match ingest(
                &registry,
                &config,
                Arc::clone(&store),
                events.clone(),
                &ChangeNotification::empty(),
            )
            .await
            {
                Ok(_) => {
                    reconcile(&registry, &config, store, events, &config.enabled_scopes()).await
                }
                Err(e) => Err(e),
            }
        }
    };

    // Every sender is gone once the components are dropped
    if tokio::time::timeout(EVENT_DRAIN_TIMEOUT, drain).await.is_err() {
        warn!("Event log did not drain within {:?}", EVENT_DRAIN_TIMEOUT);
    }

    outcome
}

async fn ingest(
    registry: &PluginRegistry,
    config: &SyncConfig,
    store: Arc<dyn rangesync_core::RangeStore>,
    events: EventSink,
    notification: &ChangeNotification,
) -> Result<RangesyncExitCode> {
    let feed = Arc::from(registry.create_feed(&config.feed)?);
    let ingestor = Ingestor::new(feed, store, config.enabled_scopes(), &config.ingest)?
        .with_events(events);

    let result = ingestor.ingest(notification).await?;
    if result.stale {
        info!("Document {} was stale; nothing written", result.sync_token);
    }
    for (scope, count) in &result.scopes {
        info!("{}: {} range(s) in batch {}", scope, count, result.sync_token);
    }

    Ok(RangesyncExitCode::Success)
}

async fn reconcile(
    registry: &PluginRegistry,
    config: &SyncConfig,
    store: Arc<dyn rangesync_core::RangeStore>,
    events: EventSink,
    scopes: &[Scope],
) -> Result<RangesyncExitCode> {
    let boundary = Arc::from(registry.create_boundary(&config.boundary)?);
    let reconciler = Arc::new(
        Reconciler::new(store, boundary, config.reconcile.clone())?.with_events(events),
    );

    let mut code = RangesyncExitCode::Success;
    for (scope, result) in reconciler.reconcile_all(scopes).await {
        match result {
            Ok(result) if !result.failed.is_empty() => {
                for failed in &result.failed {
                    warn!(
                        "{}: {:?} {} skipped: {}",
                        scope, failed.action, failed.cidr, failed.error
                    );
                }
                if code == RangesyncExitCode::Success {
                    code = RangesyncExitCode::Partial;
                }
            }
            Ok(result) => {
                if result.planned > 0 {
                    info!("{}: {} change(s) planned (dry run)", scope, result.planned);
                }
            }
            Err(e) => {
                error!("{}: {}", scope, e);
                code = RangesyncExitCode::RuntimeError;
            }
        }
    }

    Ok(code)
}

/// Read the trigger event from stdin; empty input means "something changed"
async fn read_notification() -> Result<ChangeNotification> {
    let mut raw = String::new();
    tokio::io::stdin()
        .read_to_string(&mut raw)
        .await
        .context("Failed to read notification from stdin")?;

    let event = if raw.trim().is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_str(&raw).context("Notification is not valid JSON")?
    };

    Ok(ChangeNotification::from_event(&event)?)
}

fn log_event(event: &SyncEvent) {
    match event {
        SyncEvent::RuleFailed { scope, cidr, error } => {
            warn!("event: {} {} failed: {}", scope, cidr, error)
        }
        other => debug!("event: {:?}", other),
    }
}
