// # Range Feed Trait
//
// Defines the interface for fetching the authoritative range document.
//
// ## Implementations
//
// - HTTP(S) `ip-ranges.json`: `rangesync-feed-http` crate
//
// ## Usage
//
// ```rust,ignore
// use rangesync_core::{ChangeNotification, RangeFeed};
//
// #[tokio::main]
// async fn main() -> anyhow::Result<()> {
//     let feed = /* RangeFeed implementation */;
//
//     let document = feed.fetch(&ChangeNotification::empty()).await?;
//     println!("{} entries at {:?}", document.entries.len(), document.sync_token);
//
//     Ok(())
// }
// ```

use async_trait::async_trait;

use crate::error::Error;
use crate::model::{Cidr, Scope, SyncToken};

/// A change notification delivered by the trigger
///
/// Delivery is at-least-once and unordered across redeliveries. Nothing
/// beyond "something changed" is relied upon; the optional fields only
/// steer where the document is fetched from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeNotification {
    /// Document location announced by the notification, if any
    pub document_url: Option<String>,
    /// Token announced by the notification (informational only)
    pub announced_token: Option<SyncToken>,
    /// When the notification was received
    pub received_at: chrono::DateTime<chrono::Utc>,
}

impl ChangeNotification {
    /// A notification carrying no payload ("invoke now")
    pub fn empty() -> Self {
        Self {
            document_url: None,
            announced_token: None,
            received_at: chrono::Utc::now(),
        }
    }

    /// Create a notification pointing at a document URL
    pub fn with_url(url: impl Into<String>) -> Self {
        Self {
            document_url: Some(url.into()),
            ..Self::empty()
        }
    }

    /// Parse a trigger event
    ///
    /// Accepts an SNS-style envelope (`Records[0].Sns.Message` holding a
    /// JSON string), a bare message object (`{"url": ..., "synctoken": ...}`)
    /// or anything else, which is treated as an empty notification.
    pub fn from_event(event: &serde_json::Value) -> Result<Self, Error> {
        let message = match event
            .pointer("/Records/0/Sns/Message")
            .and_then(|m| m.as_str())
        {
            Some(raw) => serde_json::from_str::<serde_json::Value>(raw).map_err(|e| {
                Error::invalid_input(format!("Notification message is not JSON: {}", e))
            })?,
            None => event.clone(),
        };

        let document_url = message
            .get("url")
            .and_then(|u| u.as_str())
            .map(str::to_string);

        let announced_token = message
            .get("synctoken")
            .and_then(|t| match t {
                serde_json::Value::String(s) => s.parse().ok(),
                serde_json::Value::Number(n) => n.as_u64().map(SyncToken),
                _ => None,
            });

        Ok(Self {
            document_url,
            announced_token,
            received_at: chrono::Utc::now(),
        })
    }
}

/// One `(scope, cidr)` pair from the feed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedEntry {
    pub scope: Scope,
    pub cidr: Cidr,
    /// Feed-specific grouping (e.g. `us-west-2-lax-1`)
    pub network_border_group: Option<String>,
}

impl FeedEntry {
    pub fn new(scope: Scope, cidr: Cidr) -> Self {
        Self {
            scope,
            cidr,
            network_border_group: None,
        }
    }
}

/// The full current range document (never a delta)
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RangeDocument {
    /// Version published by the feed, if it carries one
    pub sync_token: Option<SyncToken>,
    /// Publication timestamp as published by the feed
    pub create_date: Option<String>,
    /// Every range in the document, across all scopes
    pub entries: Vec<FeedEntry>,
}

/// Trait for range feed implementations
///
/// # Trust Level: Untrusted
///
/// Feeds only perform the fetch. They do not filter scopes, allocate sync
/// tokens, retry, or touch the range store; all of that is owned by the
/// `Ingestor`. A failed fetch is returned as [`Error::Fetch`] and the
/// trigger's redelivery policy decides whether to retry.
#[async_trait]
pub trait RangeFeed: Send + Sync {
    /// Fetch and parse the full current range document
    ///
    /// # Returns
    ///
    /// - `Ok(RangeDocument)`: The parsed document
    /// - `Err(Error::Fetch)`: Feed unreachable or document malformed
    async fn fetch(&self, notification: &ChangeNotification) -> Result<RangeDocument, Error>;

    /// Get the feed name (for logging/debugging)
    fn feed_name(&self) -> &'static str;
}

/// Helper trait for constructing range feeds from configuration
pub trait RangeFeedFactory: Send + Sync {
    /// Create a RangeFeed instance from configuration
    fn create(&self, config: &crate::config::FeedConfig) -> Result<Box<dyn RangeFeed>, Error>;
}
