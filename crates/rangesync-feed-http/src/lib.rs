// # HTTP Range Feed
//
// This crate provides the HTTP(S) range feed for the rangesync system.
//
// ## Document Format
//
// The published `ip-ranges.json` layout:
//
// ```json
// {
//   "syncToken": "1714564990",
//   "createDate": "2024-05-01-12-03-10",
//   "prefixes": [
//     { "ip_prefix": "3.5.140.0/22", "region": "ap-northeast-2",
//       "service": "AMAZON", "network_border_group": "ap-northeast-2" }
//   ],
//   "ipv6_prefixes": [
//     { "ipv6_prefix": "2600:1f14::/35", "region": "us-west-2",
//       "service": "EC2", "network_border_group": "us-west-2" }
//   ]
// }
// ```
//
// ## Architecture
//
// One GET per change notification; the whole document is returned every
// time. Scope filtering and token allocation happen in the `Ingestor`.

use rangesync_core::PluginRegistry;
use rangesync_core::config::FeedConfig;
use rangesync_core::model::{Cidr, Scope, SyncToken};
use rangesync_core::traits::{
    ChangeNotification, FeedEntry, RangeDocument, RangeFeed, RangeFeedFactory,
};
use rangesync_core::{Error, Result};

use serde::Deserialize;
use std::time::Duration;

/// Default request timeout for the document fetch
const DEFAULT_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IpRangesDocument {
    sync_token: Option<String>,
    create_date: Option<String>,
    #[serde(default)]
    prefixes: Vec<Ipv4Prefix>,
    #[serde(default)]
    ipv6_prefixes: Vec<Ipv6Prefix>,
}

#[derive(Debug, Deserialize)]
struct Ipv4Prefix {
    ip_prefix: Option<String>,
    region: String,
    service: String,
    network_border_group: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Ipv6Prefix {
    ipv6_prefix: Option<String>,
    region: String,
    service: String,
    network_border_group: Option<String>,
}

/// HTTP(S) range feed
pub struct HttpRangeFeed {
    /// Document URL used when the notification does not name an https one
    url: String,

    /// HTTP client
    client: reqwest::Client,
}

impl HttpRangeFeed {
    /// Create a new HTTP range feed
    ///
    /// # Parameters
    ///
    /// - `url`: Default document URL
    /// - `timeout`: Request timeout
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            url: url.into(),
            client,
        })
    }

    /// Where to fetch the document for this notification
    ///
    /// Only https locations announced by a notification are followed.
    pub fn resolve_url<'a>(&'a self, notification: &'a ChangeNotification) -> &'a str {
        match notification.document_url.as_deref() {
            Some(url) if url.starts_with("https://") => url,
            Some(url) => {
                tracing::warn!(
                    "Ignoring non-https document URL '{}', using {}",
                    url,
                    self.url
                );
                &self.url
            }
            None => &self.url,
        }
    }
}

#[async_trait::async_trait]
impl RangeFeed for HttpRangeFeed {
    async fn fetch(&self, notification: &ChangeNotification) -> Result<RangeDocument> {
        let url = self.resolve_url(notification);
        tracing::debug!("Fetching range document from {}", url);

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| Error::fetch(format!("Request to {} failed: {}", url, e)))?;

        if !response.status().is_success() {
            return Err(Error::fetch(format!(
                "{} returned HTTP {}",
                url,
                response.status()
            )));
        }

        let body = response
            .text()
            .await
            .map_err(|e| Error::fetch(format!("Failed to read response: {}", e)))?;

        parse_document(&body)
    }

    fn feed_name(&self) -> &'static str {
        "http"
    }
}

/// Parse an `ip-ranges.json` body into a [`RangeDocument`]
///
/// Entries without a prefix field are skipped. An unparseable prefix or
/// sync token means the document is malformed.
pub fn parse_document(body: &str) -> Result<RangeDocument> {
    let raw: IpRangesDocument = serde_json::from_str(body)
        .map_err(|e| Error::fetch(format!("Malformed range document: {}", e)))?;

    let sync_token = raw
        .sync_token
        .as_deref()
        .map(|t| {
            t.parse::<SyncToken>()
                .map_err(|_| Error::fetch(format!("Invalid syncToken: {}", t)))
        })
        .transpose()?;

    let mut entries = Vec::with_capacity(raw.prefixes.len() + raw.ipv6_prefixes.len());

    for prefix in raw.prefixes {
        let Some(text) = prefix.ip_prefix else {
            continue;
        };
        entries.push(entry(
            &text,
            prefix.region,
            prefix.service,
            prefix.network_border_group,
        )?);
    }

    for prefix in raw.ipv6_prefixes {
        let Some(text) = prefix.ipv6_prefix else {
            continue;
        };
        entries.push(entry(
            &text,
            prefix.region,
            prefix.service,
            prefix.network_border_group,
        )?);
    }

    Ok(RangeDocument {
        sync_token,
        create_date: raw.create_date,
        entries,
    })
}

fn entry(
    text: &str,
    region: String,
    service: String,
    network_border_group: Option<String>,
) -> Result<FeedEntry> {
    let cidr: Cidr = text
        .parse()
        .map_err(|e| Error::fetch(format!("Invalid prefix '{}': {}", text, e)))?;

    Ok(FeedEntry {
        scope: Scope::new(region, service),
        cidr,
        network_border_group,
    })
}

/// Factory for creating HTTP range feeds
pub struct HttpFeedFactory;

impl RangeFeedFactory for HttpFeedFactory {
    fn create(&self, config: &FeedConfig) -> Result<Box<dyn RangeFeed>> {
        match config {
            FeedConfig::Http { url, timeout_secs } => {
                let timeout = if *timeout_secs == 0 {
                    Duration::from_secs(DEFAULT_TIMEOUT_SECS)
                } else {
                    Duration::from_secs(*timeout_secs)
                };
                Ok(Box::new(HttpRangeFeed::new(url.clone(), timeout)?))
            }
            _ => Err(Error::config("Invalid config for HTTP range feed")),
        }
    }
}

/// Register the HTTP range feed with a registry
pub fn register(registry: &PluginRegistry) {
    registry.register_feed("http", Box::new(HttpFeedFactory));
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const DOCUMENT: &str = r#"{
        "syncToken": "1714564990",
        "createDate": "2024-05-01-12-03-10",
        "prefixes": [
            { "ip_prefix": "3.5.140.0/22", "region": "us-west-2", "service": "EC2",
              "network_border_group": "us-west-2" },
            { "region": "us-west-2", "service": "EC2" },
            { "ip_prefix": "13.34.37.64/27", "region": "eu-west-1", "service": "S3",
              "network_border_group": "eu-west-1" }
        ],
        "ipv6_prefixes": [
            { "ipv6_prefix": "2600:1f14::/35", "region": "us-west-2", "service": "EC2",
              "network_border_group": "us-west-2-lax-1" }
        ]
    }"#;

    #[test]
    fn test_parse_document() {
        let document = parse_document(DOCUMENT).unwrap();

        assert_eq!(document.sync_token, Some(SyncToken(1714564990)));
        assert_eq!(document.create_date.as_deref(), Some("2024-05-01-12-03-10"));
        // The entry without ip_prefix is skipped
        assert_eq!(document.entries.len(), 3);

        let v6 = &document.entries[2];
        assert_eq!(v6.scope, Scope::new("us-west-2", "EC2"));
        assert_eq!(v6.cidr.to_string(), "2600:1f14::/35");
        assert_eq!(v6.network_border_group.as_deref(), Some("us-west-2-lax-1"));
    }

    #[test]
    fn test_invalid_prefix_is_a_fetch_error() {
        let body = r#"{ "syncToken": "1", "prefixes": [
            { "ip_prefix": "10.0.0.1/8", "region": "r", "service": "s" }
        ] }"#;
        assert!(matches!(parse_document(body), Err(Error::Fetch(_))));
        assert!(matches!(parse_document("<html>"), Err(Error::Fetch(_))));
    }

    #[test]
    fn test_document_without_token() {
        let document = parse_document(r#"{ "prefixes": [] }"#).unwrap();
        assert_eq!(document.sync_token, None);
        assert!(document.entries.is_empty());
    }

    #[test]
    fn test_resolve_url_ignores_non_https() {
        let feed =
            HttpRangeFeed::new("https://default.example/ip-ranges.json", Duration::from_secs(5))
                .unwrap();

        let https = ChangeNotification::with_url("https://other.example/ranges.json");
        assert_eq!(feed.resolve_url(&https), "https://other.example/ranges.json");

        let plain = ChangeNotification::with_url("http://other.example/ranges.json");
        assert_eq!(
            feed.resolve_url(&plain),
            "https://default.example/ip-ranges.json"
        );

        assert_eq!(
            feed.resolve_url(&ChangeNotification::empty()),
            "https://default.example/ip-ranges.json"
        );
    }

    #[tokio::test]
    async fn test_fetch_from_server() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/ip-ranges.json"))
            .respond_with(ResponseTemplate::new(200).set_body_string(DOCUMENT))
            .expect(1)
            .mount(&server)
            .await;

        let feed = HttpRangeFeed::new(
            format!("{}/ip-ranges.json", server.uri()),
            Duration::from_secs(5),
        )
        .unwrap();

        let document = feed.fetch(&ChangeNotification::empty()).await.unwrap();
        assert_eq!(document.entries.len(), 3);
    }

    #[tokio::test]
    async fn test_non_success_status_is_a_fetch_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let feed = HttpRangeFeed::new(server.uri(), Duration::from_secs(5)).unwrap();
        let err = feed.fetch(&ChangeNotification::empty()).await.unwrap_err();
        assert!(matches!(err, Error::Fetch(_)));
    }

    #[test]
    fn test_factory_creation() {
        let factory = HttpFeedFactory;
        assert!(factory.create(&FeedConfig::default()).is_ok());

        let custom = FeedConfig::Custom {
            factory: "other".to_string(),
            config: serde_json::Value::Null,
        };
        assert!(factory.create(&custom).is_err());
    }

    #[test]
    fn test_register() {
        let registry = PluginRegistry::new();
        register(&registry);
        assert!(registry.has_feed("http"));
    }
}
