//! Single-request page fetching.
//!
//! [`PageFetcher`] is the narrow seam between the pagination machinery and the
//! network: one call, one request, no retries. [`HttpFetcher`] implements it
//! over `reqwest`, encoding the query spec into URL parameters according to a
//! configurable [`WireFormat`].

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use tracing::{debug, warn};
use url::Url;

use crate::config::{HttpConfig, WireFormat};
use crate::{Error, FetchError, FetchResult, Page, PageRequest, QuerySpec, Record, Result};

/// Fetches exactly one page per call.
///
/// Implementations must not retry: classification and backoff belong to
/// [`RetryingFetcher`](crate::RetryingFetcher). They must set
/// [`Page::is_last`] when fewer records than `request.limit` come back and
/// must never return more than `request.limit` records.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    /// Fetch one page of `spec` described by `request`.
    async fn fetch(&self, spec: &QuerySpec, request: PageRequest) -> FetchResult<Page>;
}

/// HTTP page fetcher with per-request timeout.
pub struct HttpFetcher {
    client: Client,
    wire: WireFormat,
}

impl HttpFetcher {
    /// Creates a fetcher with default HTTP settings and OData wire format.
    pub fn new() -> Result<Self> {
        Self::from_config(&HttpConfig::default(), WireFormat::default())
    }

    /// Creates a fetcher from configuration.
    pub fn from_config(http: &HttpConfig, wire: WireFormat) -> Result<Self> {
        Self::build(http.timeout(), &http.user_agent, wire)
    }

    /// Creates a fetcher with a custom request timeout (primarily for tests)
    pub fn with_timeout(timeout: Duration) -> Result<Self> {
        let http = HttpConfig::default();
        Self::build(timeout, &http.user_agent, WireFormat::default())
    }

    fn build(timeout: Duration, user_agent: &str, wire: WireFormat) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(user_agent)
            .gzip(true)
            .brotli(true)
            .build()
            .map_err(|e| Error::Config(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self { client, wire })
    }

    /// Encode `spec` and `request` into the request URL.
    ///
    /// Existing query parameters on the endpoint are kept.
    pub fn request_url(&self, spec: &QuerySpec, request: PageRequest) -> FetchResult<Url> {
        let mut url = Url::parse(spec.endpoint()).map_err(|e| {
            FetchError::Decode(format!("unusable endpoint '{}': {e}", spec.endpoint()))
        })?;
        {
            let mut pairs = url.query_pairs_mut();
            let wire = &self.wire;
            pairs.append_pair(&wire.offset_param, &request.offset.to_string());
            pairs.append_pair(&wire.limit_param, &request.limit.to_string());
            if let Some(filter) = spec.filter_expr() {
                pairs.append_pair(&wire.filter_param, filter);
            }
            if !spec.selected().is_empty() {
                pairs.append_pair(&wire.select_param, &spec.selected().join(","));
            }
            if !spec.expanded().is_empty() {
                pairs.append_pair(&wire.expand_param, &spec.expanded().join(","));
            }
            if let Some(order) = spec.order_clause() {
                pairs.append_pair(&wire.order_param, &order);
            }
            if request.include_count {
                pairs.append_pair(&wire.count_param, "true");
            }
        }
        Ok(url)
    }

    /// Decode a response body into a page.
    fn decode(&self, body: &[u8], request: PageRequest) -> FetchResult<Page> {
        let value: Value = serde_json::from_slice(body)
            .map_err(|e| FetchError::Decode(format!("invalid JSON: {e}")))?;

        let array = value
            .get(&self.wire.records_key)
            .and_then(Value::as_array)
            .ok_or_else(|| {
                FetchError::Decode(format!(
                    "response has no '{}' array",
                    self.wire.records_key
                ))
            })?;

        let mut records = Vec::with_capacity(array.len().min(request.limit));
        for (idx, item) in array.iter().enumerate() {
            let record = Record::from_value(item.clone()).ok_or_else(|| {
                FetchError::Decode(format!(
                    "record {idx} at offset {} is not an object",
                    request.offset
                ))
            })?;
            records.push(record);
        }

        if records.len() > request.limit {
            warn!(
                "source returned {} records for a page of {} at offset {}; truncating",
                records.len(),
                request.limit,
                request.offset
            );
            records.truncate(request.limit);
        }

        let total_count = self
            .wire
            .count_keys
            .iter()
            .find_map(|key| value.get(key).and_then(parse_count));

        Ok(Page::new(records, request.offset, request.limit, total_count))
    }
}

fn parse_count(value: &Value) -> Option<u64> {
    value
        .as_u64()
        .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn fetch(&self, spec: &QuerySpec, request: PageRequest) -> FetchResult<Page> {
        let url = self.request_url(spec, request)?;
        debug!("GET {}", url);

        let response = self.client.get(url.clone()).send().await?;
        let status = response.status();

        if let Some(err) = FetchError::from_status(status.as_u16()) {
            debug!("{} answered {}", url, status);
            return Err(err);
        }

        let body = response.bytes().await?;
        let page = self.decode(&body, request)?;
        debug!(
            "fetched {} records at offset {} (last: {})",
            page.len(),
            page.offset,
            page.is_last
        );
        Ok(page)
    }
}

// Note: Default is not implemented as HttpFetcher::new() can fail.

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{method, path, query_param},
    };

    fn spec_for(server: &MockServer) -> QuerySpec {
        QuerySpec::builder(format!("{}/odata/orders", server.uri()))
            .filter("status eq 'open'")
            .select(["id", "total"])
            .expand(["customer"])
            .order_by("id", crate::SortDirection::Ascending)
            .page_size(2)
            .build(100)
            .unwrap()
    }

    #[test]
    fn test_request_url_encodes_all_fields() {
        let fetcher = HttpFetcher::new().unwrap();
        let spec = QuerySpec::builder("https://api.example.com/orders?tenant=7")
            .filter("total gt 10")
            .select(["id", "total"])
            .expand(["lines"])
            .order_by("id", crate::SortDirection::Descending)
            .page_size(25)
            .build(100)
            .unwrap();
        let url = fetcher
            .request_url(&spec, PageRequest::new(50, 25).with_count())
            .unwrap();
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();

        assert!(pairs.contains(&("tenant".into(), "7".into())));
        assert!(pairs.contains(&("$skip".into(), "50".into())));
        assert!(pairs.contains(&("$top".into(), "25".into())));
        assert!(pairs.contains(&("$filter".into(), "total gt 10".into())));
        assert!(pairs.contains(&("$select".into(), "id,total".into())));
        assert!(pairs.contains(&("$expand".into(), "lines".into())));
        assert!(pairs.contains(&("$orderby".into(), "id desc".into())));
        assert!(pairs.contains(&("$count".into(), "true".into())));
    }

    #[test]
    fn test_request_url_omits_empty_fields() {
        let fetcher = HttpFetcher::new().unwrap();
        let spec = QuerySpec::builder("https://api.example.com/orders").build(100).unwrap();
        let url = fetcher.request_url(&spec, PageRequest::new(0, 100)).unwrap();
        let keys: Vec<String> = url.query_pairs().map(|(k, _)| k.into_owned()).collect();
        assert_eq!(keys, ["$skip", "$top"]);
    }

    #[test]
    fn test_decode_reads_records_and_count() {
        let fetcher = HttpFetcher::new().unwrap();
        let body = json!({
            "@odata.count": 5,
            "value": [{"id": 1}, {"id": 2}]
        })
        .to_string();
        let page = fetcher.decode(body.as_bytes(), PageRequest::new(0, 2)).unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page.total_count, Some(5));
        assert!(!page.is_last);
    }

    #[test]
    fn test_decode_count_fallback_and_string_count() {
        let fetcher = HttpFetcher::new().unwrap();
        let body = json!({"count": "12", "value": [{"id": 1}]}).to_string();
        let page = fetcher.decode(body.as_bytes(), PageRequest::new(10, 5)).unwrap();
        assert_eq!(page.total_count, Some(12));
        assert!(page.is_last);
        assert_eq!(page.offset, 10);
    }

    #[test]
    fn test_decode_truncates_oversized_pages() {
        let fetcher = HttpFetcher::new().unwrap();
        let body = json!({"value": [{"id": 1}, {"id": 2}, {"id": 3}]}).to_string();
        let page = fetcher.decode(body.as_bytes(), PageRequest::new(0, 2)).unwrap();
        assert_eq!(page.len(), 2);
        assert!(!page.is_last);
    }

    #[test]
    fn test_decode_rejects_malformed_bodies() {
        let fetcher = HttpFetcher::new().unwrap();
        let cases: Vec<&[u8]> = vec![
            b"not json",
            br#"{"items": []}"#,
            br#"{"value": [1, 2]}"#,
        ];
        for body in cases {
            let err = fetcher.decode(body, PageRequest::new(0, 10)).unwrap_err();
            assert!(matches!(err, FetchError::Decode(_)), "got {err:?}");
        }
    }

    #[tokio::test]
    async fn test_fetch_against_mock_server() -> anyhow::Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/odata/orders"))
            .and(query_param("$skip", "2"))
            .and(query_param("$top", "2"))
            .and(query_param("$filter", "status eq 'open'"))
            .and(query_param("$expand", "customer"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "value": [{"id": 3, "total": 9.5}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let fetcher = HttpFetcher::new()?;
        let page = fetcher.fetch(&spec_for(&server), PageRequest::new(2, 2)).await?;
        assert_eq!(page.len(), 1);
        assert!(page.is_last);
        assert_eq!(page.records[0].get("total"), Some(&json!(9.5)));
        Ok(())
    }

    #[tokio::test]
    async fn test_status_codes_map_to_taxonomy() -> anyhow::Result<()> {
        let server = MockServer::start().await;
        for (offset, status) in [(0u64, 400u16), (2, 404), (4, 500), (6, 503), (8, 408)] {
            Mock::given(method("GET"))
                .and(query_param("$skip", offset.to_string()))
                .respond_with(ResponseTemplate::new(status))
                .mount(&server)
                .await;
        }

        let fetcher = HttpFetcher::new()?;
        let spec = spec_for(&server);
        let outcome = |offset| {
            let fetcher = &fetcher;
            let spec = &spec;
            async move { fetcher.fetch(spec, PageRequest::new(offset, 2)).await }
        };

        assert_eq!(outcome(0).await.unwrap_err(), FetchError::Client { status: 400 });
        assert_eq!(outcome(2).await.unwrap_err(), FetchError::Client { status: 404 });
        assert_eq!(outcome(4).await.unwrap_err(), FetchError::Server { status: 500 });
        assert_eq!(outcome(6).await.unwrap_err(), FetchError::Server { status: 503 });
        assert!(matches!(outcome(8).await.unwrap_err(), FetchError::Timeout(_)));
        Ok(())
    }

    #[tokio::test]
    async fn test_slow_response_is_timeout() -> anyhow::Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"value": []}))
                    .set_delay(Duration::from_millis(500)),
            )
            .mount(&server)
            .await;

        let fetcher = HttpFetcher::with_timeout(Duration::from_millis(100))?;
        let err = fetcher
            .fetch(&spec_for(&server), PageRequest::new(0, 2))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Timeout(_)), "got {err:?}");
        Ok(())
    }

    #[tokio::test]
    async fn test_connection_refused_is_network_error() -> anyhow::Result<()> {
        // Bind then drop a listener so the port is very likely closed.
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
            listener.local_addr()?.port()
        };
        let spec = QuerySpec::builder(format!("http://127.0.0.1:{port}/x"))
            .build(100)
            .unwrap();
        let fetcher = HttpFetcher::with_timeout(Duration::from_secs(2))?;
        let err = fetcher.fetch(&spec, PageRequest::new(0, 10)).await.unwrap_err();
        assert!(err.is_transient(), "got {err:?}");
        Ok(())
    }
}
