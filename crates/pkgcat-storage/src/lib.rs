//! Catalog storage contract + outbound HTTP fetch utilities for pkgcat.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info_span, Instrument};

pub mod catalog;
pub mod governor;
pub mod memory;
pub mod postgres;

pub use catalog::{CatalogStore, StoreError};
pub use governor::{GovernorError, GovernorMode, QuotaPolicy, QuotaSnapshot, RateGovernor};
pub use memory::MemoryCatalogStore;
pub use postgres::PgCatalogStore;

pub const CRATE_NAME: &str = "pkgcat-storage";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

/// 429 is deliberately non-retryable here: quota handling belongs to the governor.
pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    /// Sleep before retry number `retry` (zero-based): doubles from `base_delay`, capped at `max_delay`.
    pub fn retry_delay(&self, retry: usize) -> Duration {
        u32::try_from(retry)
            .ok()
            .and_then(|shift| 2u32.checked_pow(shift))
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_host_concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            global_concurrency: 16,
            per_host_concurrency: 4,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub fn text_lossy(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("network error: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid request header {name}: {reason}")]
    InvalidHeader { name: String, reason: String },
    #[error("http client is shutting down")]
    Closed,
}

/// Outbound GET client. Non-2xx responses are returned to the caller, never raised.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_host_limit: usize,
    per_host: Mutex<HashMap<String, Arc<Semaphore>>>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_host_limit: config.per_host_concurrency.max(1),
            per_host: Mutex::new(HashMap::new()),
            backoff: config.backoff,
        })
    }

    async fn per_host_semaphore(&self, host: &str) -> Arc<Semaphore> {
        let mut map = self.per_host.lock().await;
        map.entry(host.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_host_limit)))
            .clone()
    }

    async fn acquire(&self, host: &str) -> Result<(OwnedSemaphorePermit, OwnedSemaphorePermit), FetchError> {
        let global = Arc::clone(&self.global_limit)
            .acquire_owned()
            .await
            .map_err(|_| FetchError::Closed)?;
        let per_host = self
            .per_host_semaphore(host)
            .await
            .acquire_owned()
            .await
            .map_err(|_| FetchError::Closed)?;
        Ok((global, per_host))
    }

    pub async fn get(
        &self,
        url: &str,
        headers: &[(&str, String)],
    ) -> Result<FetchedResponse, FetchError> {
        let header_map = build_headers(headers)?;
        let host = host_of(url);
        let _permits = self.acquire(&host).await?;

        let span = info_span!("http_fetch", host = %host, url);
        self.get_with_retries(url, header_map).instrument(span).await
    }

    async fn get_with_retries(
        &self,
        url: &str,
        headers: HeaderMap,
    ) -> Result<FetchedResponse, FetchError> {
        let mut attempt = 0;
        loop {
            match self.client.get(url).headers(headers.clone()).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        debug!(%status, attempt, "retrying server error");
                        tokio::time::sleep(self.backoff.retry_delay(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    let final_url = resp.url().to_string();
                    let response_headers = resp.headers().clone();
                    let body = resp.bytes().await?.to_vec();
                    return Ok(FetchedResponse {
                        status,
                        final_url,
                        headers: response_headers,
                        body,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        debug!(error = %err, attempt, "retrying transport error");
                        tokio::time::sleep(self.backoff.retry_delay(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }
}

fn build_headers(headers: &[(&str, String)]) -> Result<HeaderMap, FetchError> {
    let mut map = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        let header_name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| FetchError::InvalidHeader {
            name: name.to_string(),
            reason: e.to_string(),
        })?;
        let mut header_value = HeaderValue::from_str(value).map_err(|e| FetchError::InvalidHeader {
            name: name.to_string(),
            reason: e.to_string(),
        })?;
        if header_name == reqwest::header::AUTHORIZATION {
            header_value.set_sensitive(true);
        }
        map.insert(header_name, header_value);
    }
    Ok(map)
}

fn host_of(url: &str) -> String {
    reqwest::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(ToString::to_string))
        .unwrap_or_else(|| "unknown".to_string())
}
