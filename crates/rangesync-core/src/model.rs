//! Data model shared by the ingestor, the reconciler and the range store
//!
//! A [`RangeRecord`] is one known network range, keyed by
//! `(scope, range_key)`. Records are written by ingestion batches tagged with
//! a monotonically increasing [`SyncToken`].

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use crate::error::Error;

/// IP version of a range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IpVersion {
    V4,
    V6,
}

/// Logical grouping key (service + region) under which ranges are tracked
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Scope {
    region: String,
    service: String,
}

impl Scope {
    /// Create a scope from a region and service name
    pub fn new(region: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            service: service.into(),
        }
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Canonical partition key, e.g. `us-west-2#EC2`
    pub fn key(&self) -> String {
        format!("{}#{}", self.region, self.service)
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.region, self.service)
    }
}

/// Accepts `region#service` and `region:service`
impl FromStr for Scope {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (region, service) = s
            .split_once('#')
            .or_else(|| s.split_once(':'))
            .ok_or_else(|| {
                Error::invalid_input(format!(
                    "Scope must look like 'region:service', got '{}'",
                    s
                ))
            })?;

        let (region, service) = (region.trim(), service.trim());
        if region.is_empty() || service.is_empty() {
            return Err(Error::invalid_input(format!(
                "Scope has an empty region or service: '{}'",
                s
            )));
        }

        Ok(Self::new(region, service))
    }
}

impl TryFrom<String> for Scope {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Scope> for String {
    fn from(scope: Scope) -> Self {
        scope.key()
    }
}

/// A validated network range in CIDR notation
///
/// Host bits below the prefix must be zero, so every range has exactly one
/// textual form and set comparisons between the store and the boundary are
/// exact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Cidr {
    addr: IpAddr,
    prefix_len: u8,
}

impl Cidr {
    /// Create a CIDR, rejecting out-of-range prefixes and set host bits
    pub fn new(addr: IpAddr, prefix_len: u8) -> Result<Self, Error> {
        let max = match addr {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        if prefix_len > max {
            return Err(Error::invalid_input(format!(
                "Prefix length {} exceeds {} for {}",
                prefix_len, max, addr
            )));
        }

        let host_bits_clear = match addr {
            IpAddr::V4(v4) => {
                let bits = u32::from(v4);
                let mask = u32::MAX.checked_shr(u32::from(prefix_len)).unwrap_or(0);
                bits & mask == 0
            }
            IpAddr::V6(v6) => {
                let bits = u128::from(v6);
                let mask = u128::MAX.checked_shr(u32::from(prefix_len)).unwrap_or(0);
                bits & mask == 0
            }
        };
        if !host_bits_clear {
            return Err(Error::invalid_input(format!(
                "{}/{} has host bits set",
                addr, prefix_len
            )));
        }

        Ok(Self { addr, prefix_len })
    }

    pub fn addr(&self) -> IpAddr {
        self.addr
    }

    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    pub fn version(&self) -> IpVersion {
        match self.addr {
            IpAddr::V4(_) => IpVersion::V4,
            IpAddr::V6(_) => IpVersion::V6,
        }
    }
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix_len)
    }
}

impl FromStr for Cidr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (addr, prefix) = s
            .split_once('/')
            .ok_or_else(|| Error::invalid_input(format!("Missing prefix length: '{}'", s)))?;

        let addr: IpAddr = addr
            .parse()
            .map_err(|_| Error::invalid_input(format!("Invalid address in '{}'", s)))?;
        let prefix_len: u8 = prefix
            .parse()
            .map_err(|_| Error::invalid_input(format!("Invalid prefix length in '{}'", s)))?;

        Self::new(addr, prefix_len)
    }
}

impl TryFrom<String> for Cidr {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Cidr> for String {
    fn from(cidr: Cidr) -> Self {
        cidr.to_string()
    }
}

/// Sort key of a range within its scope: `#IPV4#<cidr>` or `#IPV6#<cidr>`
pub fn range_key(cidr: &Cidr) -> String {
    match cidr.version() {
        IpVersion::V4 => format!("#IPV4#{}", cidr),
        IpVersion::V6 => format!("#IPV6#{}", cidr),
    }
}

/// Identifier of an ingestion batch
///
/// Ordered numerically. Feeds that publish a token (the published
/// `ip-ranges.json` uses the publication time in Unix seconds) have it
/// used verbatim.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct SyncToken(pub u64);

impl SyncToken {
    pub fn value(&self) -> u64 {
        self.0
    }

    /// The smallest token strictly greater than this one
    pub fn next(&self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl fmt::Display for SyncToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SyncToken {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<u64>()
            .map(Self)
            .map_err(|_| Error::invalid_input(format!("Sync token is not numeric: '{}'", s)))
    }
}

/// One row per known network range
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeRecord {
    /// Partition key
    pub scope: Scope,
    /// Sort key, unique within the scope
    pub range_key: String,
    /// The network range
    pub cidr: Cidr,
    /// Batch that last confirmed this record
    pub sync_token: SyncToken,
    /// When the feed last confirmed this record
    pub last_seen_at: chrono::DateTime<chrono::Utc>,
    /// Feed-specific grouping, kept for auditing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_border_group: Option<String>,
}

impl RangeRecord {
    /// Create a record confirmed now by the given batch
    pub fn new(scope: Scope, cidr: Cidr, sync_token: SyncToken) -> Self {
        Self {
            range_key: range_key(&cidr),
            scope,
            cidr,
            sync_token,
            last_seen_at: chrono::Utc::now(),
            network_border_group: None,
        }
    }

    /// Attach the feed's network border group
    pub fn with_network_border_group(mut self, group: Option<String>) -> Self {
        self.network_border_group = group;
        self
    }

    /// Whether the latest feed no longer lists this range
    pub fn is_stale(&self, latest: SyncToken) -> bool {
        self.sync_token < latest
    }
}

/// Per-scope reconciliation lease held in the range store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeLease {
    /// Opaque identity of the invocation holding the lease
    pub holder: String,
    /// After this instant the lease may be taken over
    pub expires_at: chrono::DateTime<chrono::Utc>,
}

impl ScopeLease {
    pub fn new(holder: impl Into<String>, ttl: std::time::Duration) -> Self {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        Self {
            holder: holder.into(),
            expires_at: chrono::Utc::now()
                .checked_add_signed(ttl)
                .unwrap_or(chrono::DateTime::<chrono::Utc>::MAX_UTC),
        }
    }

    pub fn is_expired(&self) -> bool {
        chrono::Utc::now() >= self.expires_at
    }

    /// Whether `holder` may take (or renew) this lease
    pub fn can_be_taken_by(&self, holder: &str) -> bool {
        self.holder == holder || self.is_expired()
    }
}
