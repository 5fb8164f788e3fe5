//! Paged fetching from the Dataverse Web API.
//!
//! The Web API returns entity sets a page at a time. Each page carries a
//! `value` array and, when more data exists, an `@odata.nextLink` URL that is
//! requested verbatim for the next page.

use crate::config::ThrottleConfig;
use crate::error::{Error, Result};
use crate::metrics::Metrics;
use reqwest::header::{ACCEPT, AUTHORIZATION, HeaderMap, HeaderValue, RETRY_AFTER};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Deserializer};
use serde_json::{Map, Value as JsonValue};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};
use url::Url;

/// One fetched record, kept exactly as the API returned it.
pub type Record = Map<String, JsonValue>;

/// `Prefer` header asking for formatted-value annotations.
pub const PREFER_ANNOTATIONS: &str =
    r#"odata.include-annotations="OData.Community.Display.V1.FormattedValue""#;

/// One page of an OData collection response.
#[derive(Debug, Deserialize)]
pub struct Page {
    /// Records on this page; `null` reads as empty
    #[serde(default, deserialize_with = "null_as_empty")]
    pub value: Vec<Record>,
    /// Continuation URL
    #[serde(rename = "@odata.nextLink", default)]
    pub next_link: Option<String>,
}

fn null_as_empty<'de, D>(deserializer: D) -> std::result::Result<Vec<Record>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Vec<Record>>::deserialize(deserializer)?.unwrap_or_default())
}

/// All records fetched for one job.
#[derive(Debug, Clone, Default)]
pub struct RecordSet {
    /// Records in page-arrival order
    pub records: Vec<Record>,
    /// Pages fetched
    pub pages: u32,
    /// Throttled responses retried along the way
    pub throttle_retries: u32,
}

impl RecordSet {
    /// Number of records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether no records were fetched.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Per-fetch limits.
#[derive(Debug, Clone, Copy, Default)]
pub struct FetchOptions {
    /// Stop after this many pages
    pub max_pages: Option<u32>,
    /// Sleep between pages
    pub page_delay: Option<Duration>,
}

/// Build the HTTP client shared by every page request in a run.
pub fn api_client(token: &str, timeout: Duration) -> Result<Client> {
    let mut headers = HeaderMap::new();
    let mut auth = HeaderValue::from_str(&format!("Bearer {}", token))
        .map_err(|e| Error::auth(format!("Token is not a valid header value: {}", e), None))?;
    auth.set_sensitive(true);
    headers.insert(AUTHORIZATION, auth);
    headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
    headers.insert("prefer", HeaderValue::from_static(PREFER_ANNOTATIONS));
    headers.insert("odata-maxversion", HeaderValue::from_static("4.0"));
    headers.insert("odata-version", HeaderValue::from_static("4.0"));

    Ok(Client::builder()
        .default_headers(headers)
        .timeout(timeout)
        .build()?)
}

/// Whether a status means "slow down and try the same request again".
pub fn is_throttle_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::TOO_MANY_REQUESTS | StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT
    )
}

/// Wait before reissuing a throttled request.
///
/// Uses the `Retry-After` seconds when present, never less than `floor`.
pub fn throttle_delay(retry_after: Option<&HeaderValue>, floor: Duration) -> Duration {
    let hinted = retry_after
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(floor);
    hinted.max(floor)
}

/// Drives paging for one resource.
pub struct PagedFetcher {
    client: Client,
    throttle: ThrottleConfig,
    metrics: Arc<Metrics>,
}

impl PagedFetcher {
    /// Create a fetcher over an authenticated client.
    pub fn new(client: Client, throttle: ThrottleConfig, metrics: Arc<Metrics>) -> Self {
        Self {
            client,
            throttle,
            metrics,
        }
    }

    /// Fetch every page starting at `url`.
    ///
    /// Nothing is returned on failure; a partially fetched set is dropped.
    #[instrument(skip(self, options), fields(url = %url))]
    pub async fn fetch(&self, url: Url, options: FetchOptions) -> Result<RecordSet> {
        let mut set = RecordSet::default();
        let mut next = Some(url.to_string());

        while let Some(current) = next.take() {
            if let Some(max) = options.max_pages {
                if set.pages >= max {
                    debug!("Page cap of {} reached", max);
                    break;
                }
            }

            let page = self.fetch_page(&current, &mut set.throttle_retries).await?;
            set.pages += 1;
            self.metrics.record_page(page.value.len() as u64);
            debug!(
                page = set.pages,
                records = page.value.len(),
                more = page.next_link.is_some(),
                "Fetched page"
            );

            set.records.extend(page.value);
            next = page.next_link;

            if next.is_some() {
                if let Some(delay) = options.page_delay {
                    tokio::time::sleep(delay).await;
                }
            }
        }

        Ok(set)
    }

    /// Fetch one page, waiting out throttled responses.
    async fn fetch_page(&self, url: &str, throttled: &mut u32) -> Result<Page> {
        let mut attempts: u32 = 0;

        loop {
            let response = self.client.get(url).send().await?;
            let status = response.status();

            if is_throttle_status(status) {
                attempts += 1;
                if let Some(max) = self.throttle.max_retries {
                    if attempts > max {
                        return Err(Error::ThrottleExhausted {
                            url: url.to_string(),
                            attempts,
                        });
                    }
                }

                let wait = throttle_delay(
                    response.headers().get(RETRY_AFTER),
                    self.throttle.min_wait(),
                );
                *throttled += 1;
                self.metrics.record_throttle();
                warn!(
                    status = status.as_u16(),
                    attempt = attempts,
                    "Throttled, retrying same request in {}",
                    humantime::format_duration(wait)
                );
                drop(response);
                tokio::time::sleep(wait).await;
                continue;
            }

            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(Error::remote_request(status.as_u16(), url, body));
            }

            let bytes = response.bytes().await?;
            return serde_json::from_slice::<Page>(&bytes)
                .map_err(|e| Error::serialization(format!("Invalid page from {}", url), e));
        }
    }
}
