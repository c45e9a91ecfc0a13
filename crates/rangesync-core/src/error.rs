//! Error types for the rangesync system
//!
//! Three failure classes matter to the pipeline:
//! - [`Error::Fetch`]: the range feed was unreachable or malformed. The whole
//!   ingestion aborts and is safe to rerun.
//! - [`Error::Store`]: a range store read or write failed. The invocation
//!   aborts and is safe to rerun.
//! - [`Error::BoundaryApply`]: one add/remove against the security boundary
//!   failed. Isolated to that CIDR; reconciliation continues.

use thiserror::Error;

/// Result type alias for rangesync operations
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for the rangesync system
#[derive(Error, Debug)]
pub enum Error {
    /// Range feed unreachable or document malformed
    #[error("Range feed error: {0}")]
    Fetch(String),

    /// Range store read/write failure
    #[error("Range store error: {0}")]
    Store(String),

    /// A single rule change against the security boundary failed
    #[error("Boundary apply error for {cidr}: {message}")]
    BoundaryApply {
        /// The CIDR whose change was skipped
        cidr: String,
        /// Underlying failure
        message: String,
    },

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// An external call exceeded its time bound
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Another reconciliation currently holds the scope
    #[error("Scope busy: {0}")]
    ScopeBusy(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// HTTP client errors
    #[error("HTTP error: {0}")]
    Http(String),

    /// Authentication errors
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Rate limiting errors
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Integration-specific error
    #[error("Provider error ({provider}): {message}")]
    Provider {
        /// Provider name
        provider: String,
        /// Error message
        message: String,
    },

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create a range feed error
    pub fn fetch(msg: impl Into<String>) -> Self {
        Self::Fetch(msg.into())
    }

    /// Create a range store error
    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    /// Create a boundary apply error for one CIDR
    pub fn boundary_apply(cidr: impl Into<String>, message: impl Into<String>) -> Self {
        Self::BoundaryApply {
            cidr: cidr.into(),
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Create a scope-busy error
    pub fn scope_busy(msg: impl Into<String>) -> Self {
        Self::ScopeBusy(msg.into())
    }

    /// Create an invalid input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Create an HTTP error
    pub fn http(msg: impl Into<String>) -> Self {
        Self::Http(msg.into())
    }

    /// Create an authentication error
    pub fn auth(msg: impl Into<String>) -> Self {
        Self::Authentication(msg.into())
    }

    /// Create a rate limit error
    pub fn rate_limited(msg: impl Into<String>) -> Self {
        Self::RateLimited(msg.into())
    }

    /// Create a "not found" error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a provider-specific error
    pub fn provider(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Provider {
            provider: provider.into(),
            message: message.into(),
        }
    }

    /// Whether the failure aborts the invocation as a whole.
    ///
    /// Boundary apply errors are isolated to a single CIDR; everything else
    /// fails the invocation, which is safe to rerun from scratch.
    pub fn aborts_invocation(&self) -> bool {
        !matches!(self, Self::BoundaryApply { .. })
    }
}

/// Helper for converting anyhow::Error to our Error type
impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Self::Other(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boundary_apply_is_isolated() {
        let err = Error::boundary_apply("10.0.0.0/24", "throttled");
        assert!(!err.aborts_invocation());
        assert_eq!(
            err.to_string(),
            "Boundary apply error for 10.0.0.0/24: throttled"
        );

        assert!(Error::fetch("status 503").aborts_invocation());
        assert!(Error::store("disk full").aborts_invocation());
    }
}
