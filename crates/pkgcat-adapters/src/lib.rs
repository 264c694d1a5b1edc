//! Source adapter contract + one adapter per upstream package repository.
//!
//! Every adapter fetches its upstream listing and normalizes it into
//! `RawPackageRecord`s for a single platform. Malformed rows are skipped and
//! counted; a failed page is logged and the crawl moves on; only a failure of
//! the initial index is returned as an error.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pkgcat_core::{EnumField, PlatformId, ProgressEvent, RawPackageRecord, SourceId};
use pkgcat_storage::{FetchError, FetchedResponse, GovernorError, HttpFetcher};
use scraper::{ElementRef, Selector};
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;

pub mod arch;
pub mod aur;
pub mod classify;
pub mod debian;
pub mod fedora;
pub mod homebrew;
pub mod winget;

pub use classify::classify_package_type;

pub const CRATE_NAME: &str = "pkgcat-adapters";

/// Spacing used by fixed-interval sources unless `sources.yaml` overrides it.
pub const DEFAULT_REQUEST_DELAY: Duration = Duration::from_millis(150);

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("fetching {url}: {source}")]
    Fetch {
        url: String,
        #[source]
        source: FetchError,
    },
    #[error(transparent)]
    Governor(#[from] GovernorError),
    #[error("{url} returned HTTP {status}")]
    Status { url: String, status: u16 },
    #[error("decoding {url}: {reason}")]
    Decode { url: String, reason: String },
    #[error("{0}")]
    Message(String),
}

/// Fire-and-forget progress channel. Sends never block and never fail the caller.
#[derive(Debug, Clone, Default)]
pub struct ProgressSink {
    tx: Option<UnboundedSender<ProgressEvent>>,
}

impl ProgressSink {
    pub fn new(tx: UnboundedSender<ProgressEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn emit(&self, event: ProgressEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }

    pub fn fetch(&self, current: usize, total: usize, sample: Option<&str>) {
        self.emit(ProgressEvent::Fetch {
            current,
            total,
            sample: sample.map(ToString::to_string),
        });
    }
}

/// Output of a pure parse step.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedBatch {
    pub records: Vec<RawPackageRecord>,
    pub skipped: usize,
}

/// Per-source knobs, usually loaded from `sources.yaml`.
#[derive(Debug, Clone, Default)]
pub struct SourceOptions {
    pub base_url: Option<String>,
    pub request_delay: Option<Duration>,
    pub max_pages: Option<usize>,
    pub github_token: Option<String>,
    pub strict_quota: bool,
    /// Retries after an exhausted quota before the crawl is abandoned.
    pub quota_retries: Option<usize>,
}

impl SourceOptions {
    fn base_url_or(&self, default: &str) -> String {
        self.base_url
            .as_deref()
            .unwrap_or(default)
            .trim_end_matches('/')
            .to_string()
    }

    fn request_delay(&self) -> Duration {
        self.request_delay.unwrap_or(DEFAULT_REQUEST_DELAY)
    }
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> SourceId;

    fn platform_id(&self) -> PlatformId {
        self.source_id().platform()
    }

    /// Enum values the catalog must accept before any record from this source is written.
    fn required_enum_values(&self) -> &'static [(EnumField, &'static str)] {
        &[]
    }

    /// Whether unchanged packages get their liveness marker refreshed.
    fn tracks_liveness(&self) -> bool {
        true
    }

    async fn fetch_all(&self, progress: &ProgressSink) -> Result<Vec<RawPackageRecord>, AdapterError>;
}

pub fn adapter_for_source(
    source: SourceId,
    http: Arc<HttpFetcher>,
    options: SourceOptions,
) -> Box<dyn SourceAdapter> {
    match source {
        SourceId::Debian | SourceId::Ubuntu => {
            Box::new(debian::AllPackagesAdapter::new(source, http, &options))
        }
        SourceId::Arch => Box::new(arch::ArchAdapter::new(http, &options)),
        SourceId::Aur => Box::new(aur::AurAdapter::new(http, &options)),
        SourceId::Fedora => Box::new(fedora::FedoraAdapter::new(http, &options)),
        SourceId::Homebrew => Box::new(homebrew::HomebrewAdapter::new(http, &options)),
        SourceId::Winget => Box::new(winget::WingetAdapter::new(http, &options)),
    }
}

/// Non-2xx becomes an error naming the URL the response came from after redirects.
pub(crate) fn ensure_success(resp: FetchedResponse) -> Result<FetchedResponse, AdapterError> {
    if resp.is_success() {
        Ok(resp)
    } else {
        Err(AdapterError::Status {
            url: resp.final_url,
            status: resp.status.as_u16(),
        })
    }
}

pub(crate) fn parse_selector(selector: &str) -> Result<Selector, AdapterError> {
    Selector::parse(selector).map_err(|e| AdapterError::Message(e.to_string()))
}

pub(crate) fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

/// Element text with runs of whitespace collapsed.
pub(crate) fn element_text(element: ElementRef<'_>) -> String {
    element
        .text()
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Resolve an href against a site root (`https://host`).
pub(crate) fn join_url(base: &str, href: &str) -> String {
    if href.starts_with("http://") || href.starts_with("https://") {
        href.to_string()
    } else if let Some(path) = href.strip_prefix('/') {
        format!("{}/{path}", site_root(base))
    } else {
        format!("{}/{href}", base.trim_end_matches('/'))
    }
}

fn site_root(base: &str) -> &str {
    let after_scheme = base.find("://").map(|i| i + 3).unwrap_or(0);
    match base[after_scheme..].find('/') {
        Some(i) => &base[..after_scheme + i],
        None => base,
    }
}

/// Keep the first record for every name.
pub(crate) fn dedupe_by_name(records: Vec<RawPackageRecord>) -> Vec<RawPackageRecord> {
    let mut seen = HashSet::new();
    records
        .into_iter()
        .filter(|r| seen.insert(r.name.clone()))
        .collect()
}

pub(crate) fn parse_count(text: &str) -> Option<usize> {
    text.replace(',', "").trim().parse().ok()
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;

    use axum::Router;
    use pkgcat_storage::{BackoffPolicy, HttpClientConfig, HttpFetcher};
    use tokio::net::TcpListener;

    pub async fn spawn_server(router: Router) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    pub fn fetcher() -> Arc<HttpFetcher> {
        Arc::new(
            HttpFetcher::new(HttpClientConfig {
                user_agent: Some("pkgcat-test/0.1".into()),
                backoff: BackoffPolicy {
                    max_retries: 0,
                    ..Default::default()
                },
                ..Default::default()
            })
            .unwrap(),
        )
    }
}
