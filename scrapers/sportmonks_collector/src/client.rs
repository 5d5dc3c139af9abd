use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use reqwest::{header::RETRY_AFTER, StatusCode, Url};
use serde::Deserialize;
use serde_json::Value;
use std::{
    future::Future,
    num::NonZeroU32,
    sync::Arc,
    time::{Duration, Instant},
};
use tracing::{debug, info, warn};

use crate::config::CollectorConfig;
use crate::error::{CollectorError, Result};
use crate::metrics::MetricsCollector;
use crate::types::{EntityId, FetchedRecord, Page, Pagination};

const MAX_RETRY_DELAY: Duration = Duration::from_secs(60);

/// One upstream list request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    pub resource: String,
    pub include: Vec<String>,
    pub params: Vec<(String, String)>,
    pub page: u32,
    pub per_page: u32,
}

impl PageRequest {
    pub fn new(resource: impl Into<String>, per_page: u32) -> Self {
        Self {
            resource: resource.into(),
            include: Vec::new(),
            params: Vec::new(),
            page: 1,
            per_page,
        }
    }

    pub fn with_include(mut self, include: &[String]) -> Self {
        self.include = include.to_vec();
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((key.into(), value.into()));
        self
    }

    pub fn at_page(&self, page: u32) -> Self {
        Self {
            page,
            ..self.clone()
        }
    }
}

/// Source of upstream pages. Pipelines are generic over this so the HTTP
/// client can be swapped for a scripted fetcher.
#[allow(async_fn_in_trait)]
pub trait PageFetcher {
    async fn fetch_page(&self, request: &PageRequest) -> Result<Page>;

    /// Fetch the given ids of `resource` in a single request.
    async fn fetch_many(&self, resource: &str, ids: &[EntityId], include: &[String]) -> Result<Page>;
}

/// How a response status is handled by the retry loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseClass {
    Success,
    RateLimited,
    Auth,
    Transient,
    Rejected,
}

pub fn classify(status: StatusCode) -> ResponseClass {
    if status.is_success() {
        ResponseClass::Success
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        ResponseClass::RateLimited
    } else if status == StatusCode::UNAUTHORIZED {
        ResponseClass::Auth
    } else if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
        ResponseClass::Transient
    } else {
        ResponseClass::Rejected
    }
}

/// Outcome of a single attempt, as seen by `RetryPolicy::run`.
#[derive(Debug)]
pub enum AttemptError {
    RateLimited { retry_after: Option<Duration> },
    Transient(String),
    GiveUp(CollectorError),
}

/// Doubles `delay`, capped at [`MAX_RETRY_DELAY`].
fn next_retry_delay(delay: Duration) -> Duration {
    delay.checked_mul(2).map_or(MAX_RETRY_DELAY, |doubled| doubled.min(MAX_RETRY_DELAY))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub rate_limit_backoff: Duration,
    pub rate_limit_max_waits: Option<u32>,
}

impl RetryPolicy {
    pub fn from_config(config: &CollectorConfig) -> Self {
        Self {
            max_retries: config.rate_limits.max_retries,
            retry_delay: config.rate_limits.retry_delay(),
            rate_limit_backoff: config.rate_limits.rate_limit_backoff(),
            rate_limit_max_waits: config.rate_limits.rate_limit_max_waits,
        }
    }

    /// Runs `operation` until it succeeds. 429s are waited out without using
    /// up retries; transient failures are retried `max_retries` times with
    /// doubling delays.
    pub async fn run<T, F, Fut>(&self, metrics: &MetricsCollector, mut operation: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = std::result::Result<T, AttemptError>>,
    {
        let mut attempts = 0u32;
        let mut waits = 0u32;
        let mut delay = self.retry_delay;

        loop {
            match operation(attempts + 1).await {
                Ok(value) => return Ok(value),
                Err(AttemptError::GiveUp(error)) => return Err(error),
                Err(AttemptError::RateLimited { retry_after }) => {
                    let backoff = retry_after.unwrap_or(self.rate_limit_backoff);
                    if let Some(max) = self.rate_limit_max_waits {
                        if waits >= max {
                            return Err(CollectorError::RateLimited {
                                waits,
                                last_backoff: backoff,
                            });
                        }
                    }
                    waits += 1;
                    metrics.record_rate_limited();
                    metrics.record_rate_limit_wait(backoff);
                    warn!("Rate limited by upstream, waiting {:?} (wait #{})", backoff, waits);
                    tokio::time::sleep(backoff).await;
                }
                Err(AttemptError::Transient(message)) => {
                    attempts += 1;
                    if attempts > self.max_retries {
                        return Err(CollectorError::Transient { attempts, message });
                    }
                    metrics.record_retry();
                    info!("Retry attempt {} after error: {}", attempts, message);
                    tokio::time::sleep(delay).await;
                    delay = next_retry_delay(delay);
                }
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    data: Value,
    #[serde(default)]
    pagination: Option<RawPagination>,
    #[serde(default)]
    rate_limit: Option<RateLimitInfo>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawPagination {
    #[serde(default)]
    has_more: bool,
    #[serde(default)]
    next_page: Value,
    #[serde(default)]
    current_page: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct RateLimitInfo {
    remaining: Option<u64>,
    resets_in_seconds: Option<u64>,
    requested_entity: Option<String>,
}

fn page_param(url: &str) -> Option<u32> {
    let url = Url::parse(url).ok()?;
    let page = url.query_pairs().find(|(key, _)| key == "page")?.1;
    page.parse().ok()
}

/// Parses a `{data, pagination}` body. `data` may be a list, a single object
/// or missing entirely (no results).
pub fn parse_page(body: &str) -> Result<Page> {
    let envelope: Envelope =
        serde_json::from_str(body).map_err(|e| CollectorError::Decode(e.to_string()))?;

    if let Some(limit) = &envelope.rate_limit {
        debug!(
            "Rate limit for {}: {:?} remaining, resets in {:?}s",
            limit.requested_entity.as_deref().unwrap_or("unknown"),
            limit.remaining,
            limit.resets_in_seconds
        );
    }

    let raw_records = match envelope.data {
        Value::Array(items) => items,
        Value::Object(_) => vec![envelope.data],
        Value::Null => {
            if let Some(message) = &envelope.message {
                debug!("Empty upstream result: {}", message);
            }
            Vec::new()
        }
        other => {
            return Err(CollectorError::Decode(format!(
                "unexpected data field: {}",
                other
            )))
        }
    };

    let mut records = Vec::with_capacity(raw_records.len());
    let mut rejected = 0u64;
    for item in raw_records {
        match FetchedRecord::from_value(item) {
            Some(record) => records.push(record),
            None => {
                warn!("Skipping upstream record without an id");
                rejected += 1;
            }
        }
    }

    let pagination = match envelope.pagination {
        Some(raw) => {
            let next_page = match &raw.next_page {
                Value::Number(n) => Some(
                    n.as_u64()
                        .and_then(|n| u32::try_from(n).ok())
                        .ok_or_else(|| CollectorError::Decode(format!("next_page {} is not a page number", n)))?,
                ),
                Value::String(url) => page_param(url),
                _ => None,
            }
            .or_else(|| {
                raw.has_more
                    .then(|| raw.current_page.and_then(|p| p.checked_add(1)))
                    .flatten()
            });
            Pagination {
                has_more: raw.has_more,
                next_page,
            }
        }
        None => Pagination::default(),
    };

    Ok(Page {
        records,
        pagination,
        rejected,
    })
}

pub struct ApiClient {
    client: reqwest::Client,
    base_url: String,
    api_token: String,
    rate_limiter: Arc<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>,
    retry: RetryPolicy,
    metrics: MetricsCollector,
}

impl ApiClient {
    pub fn new(config: &CollectorConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(&config.api.user_agent)
            .timeout(Duration::from_secs(config.api.request_timeout_secs))
            .build()
            .map_err(|e| CollectorError::Config(format!("Failed to create HTTP client: {}", e)))?;

        let quota = Quota::per_second(
            NonZeroU32::new(config.rate_limits.requests_per_second)
                .ok_or_else(|| CollectorError::Config("Invalid requests_per_second value".to_string()))?,
        );

        Ok(Self {
            client,
            base_url: config.api.base_url.trim_end_matches('/').to_string(),
            api_token: config.api.api_token.clone(),
            rate_limiter: Arc::new(RateLimiter::direct(quota)),
            retry: RetryPolicy::from_config(config),
            metrics: MetricsCollector::new(),
        })
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    fn url(&self, resource: &str) -> String {
        format!("{}/{}", self.base_url, resource.trim_start_matches('/'))
    }

    async fn get(&self, url: &str, query: &[(String, String)]) -> Result<Page> {
        self.retry
            .run(&self.metrics, |attempt| self.send_once(url, query, attempt))
            .await
    }

    async fn send_once(
        &self,
        url: &str,
        query: &[(String, String)],
        attempt: u32,
    ) -> std::result::Result<Page, AttemptError> {
        let wait_start = Instant::now();
        self.rate_limiter.until_ready().await;
        let waited = wait_start.elapsed();
        if waited > Duration::from_millis(1) {
            self.metrics.record_rate_limit_wait(waited);
        }

        debug!("GET {} (attempt {})", url, attempt);
        let tracker = self.metrics.record_request_start();
        let response = match self
            .client
            .get(url)
            .query(&[("api_token", self.api_token.as_str())])
            .query(query)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                tracker.finish(false);
                let message = if e.is_timeout() {
                    format!("request to {} timed out", url)
                } else {
                    format!("request to {} failed: {}", url, e.without_url())
                };
                self.metrics.record_error(message.clone());
                return Err(AttemptError::Transient(message));
            }
        };

        let status = response.status();
        match classify(status) {
            ResponseClass::Success => {
                let body = match response.text().await {
                    Ok(body) => body,
                    Err(e) => {
                        tracker.finish(false);
                        return Err(AttemptError::Transient(format!(
                            "failed to read body from {}: {}",
                            url,
                            e.without_url()
                        )));
                    }
                };
                tracker.finish(true);
                parse_page(&body).map_err(AttemptError::GiveUp)
            }
            ResponseClass::RateLimited => {
                tracker.finish(false);
                let retry_after = response
                    .headers()
                    .get(RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.trim().parse::<u64>().ok())
                    .map(Duration::from_secs);
                Err(AttemptError::RateLimited { retry_after })
            }
            ResponseClass::Auth => {
                tracker.finish(false);
                let message = response.text().await.unwrap_or_default();
                self.metrics.record_error(format!("HTTP {} from {}", status, url));
                Err(AttemptError::GiveUp(CollectorError::Auth {
                    status: status.as_u16(),
                    message,
                }))
            }
            ResponseClass::Transient => {
                tracker.finish(false);
                let message = format!("HTTP {} from {}", status, url);
                self.metrics.record_error(message.clone());
                Err(AttemptError::Transient(message))
            }
            ResponseClass::Rejected => {
                tracker.finish(false);
                let body = response.text().await.unwrap_or_default();
                self.metrics.record_error(format!("HTTP {} from {}", status, url));
                Err(AttemptError::GiveUp(CollectorError::Rejected {
                    status: status.as_u16(),
                    body,
                }))
            }
        }
    }
}

fn include_param(include: &[String]) -> Option<(String, String)> {
    if include.is_empty() {
        None
    } else {
        Some(("include".to_string(), include.join(";")))
    }
}

impl PageFetcher for ApiClient {
    async fn fetch_page(&self, request: &PageRequest) -> Result<Page> {
        let mut query: Vec<(String, String)> = Vec::new();
        query.extend(include_param(&request.include));
        query.push(("page".to_string(), request.page.to_string()));
        query.push(("per_page".to_string(), request.per_page.to_string()));
        query.extend(request.params.iter().cloned());

        self.get(&self.url(&request.resource), &query).await
    }

    async fn fetch_many(&self, resource: &str, ids: &[EntityId], include: &[String]) -> Result<Page> {
        if ids.is_empty() {
            return Ok(Page::default());
        }
        let joined = ids.iter().map(|id| id.to_string()).collect::<Vec<_>>().join(",");
        let url = self.url(&format!("{}/multi/{}", resource.trim_end_matches('/'), joined));

        let mut query: Vec<(String, String)> = Vec::new();
        query.extend(include_param(include));
        query.push(("per_page".to_string(), ids.len().to_string()));

        self.get(&url, &query).await
    }
}
