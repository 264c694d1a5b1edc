//! Winget community manifests, crawled through the GitHub contents API.
//!
//! `manifests/<letter>/<publisher>/<package>` is walked three levels deep and
//! each package directory becomes `Publisher.Package`.

use std::sync::Arc;

use async_trait::async_trait;
use pkgcat_core::{PackageType, PlatformId, RawPackageRecord, Repository, SourceId};
use pkgcat_storage::{GovernorError, HttpFetcher, QuotaPolicy, RateGovernor};
use serde::Deserialize;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::{dedupe_by_name, AdapterError, ProgressSink, SourceAdapter, SourceOptions};

pub const WINGET_BASE_URL: &str = "https://api.github.com/repos/microsoft/winget-pkgs/contents/manifests";
pub const VERSION_PLACEHOLDER: &str = "latest";

const LETTERS: &str = "abcdefghijklmnopqrstuvwxyz0123456789";
const NOT_FOUND: u16 = 404;

#[derive(Debug, Clone, Deserialize)]
pub struct ContentEntry {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
}

impl ContentEntry {
    fn is_dir(&self) -> bool {
        self.kind == "dir"
    }
}

pub fn package_record(publisher: &str, package: &str) -> RawPackageRecord {
    let mut record = RawPackageRecord::new(format!("{publisher}.{package}"), VERSION_PLACEHOLDER, PlatformId::Windows);
    record.repository = Repository::Official;
    record.package_type = PackageType::Gui;
    record
}

enum Listing {
    Entries(Vec<ContentEntry>),
    Missing,
}

pub struct WingetAdapter {
    base_url: String,
    max_pages: Option<usize>,
    token: Option<String>,
    http: Arc<HttpFetcher>,
    governor: RateGovernor,
}

impl WingetAdapter {
    pub fn new(http: Arc<HttpFetcher>, options: &SourceOptions) -> Self {
        let mut policy = QuotaPolicy::github(options.github_token.is_some()).with_strict(options.strict_quota);
        if let Some(retries) = options.quota_retries {
            policy.max_retries = retries;
        }
        Self {
            base_url: options.base_url_or(WINGET_BASE_URL),
            max_pages: options.max_pages,
            token: options.github_token.clone(),
            http,
            governor: RateGovernor::quota_header(policy),
        }
    }

    pub fn governor(&self) -> &RateGovernor {
        &self.governor
    }

    fn headers(&self) -> Vec<(&'static str, String)> {
        let mut headers = vec![("accept", "application/vnd.github+json".to_string())];
        if let Some(token) = &self.token {
            headers.push(("authorization", format!("token {token}")));
        }
        headers
    }

    /// Quota exhaustion is fatal; every other failure is reported per directory.
    async fn list(&self, path: &str) -> Result<Result<Listing, AdapterError>, GovernorError> {
        let url = format!("{}/{path}", self.base_url);
        let resp = match self.governor.get(&self.http, &url, &self.headers()).await {
            Ok(resp) => resp,
            Err(err @ GovernorError::RateLimitExceeded { .. }) => return Err(err),
            Err(err) => return Ok(Err(err.into())),
        };
        if resp.status.as_u16() == NOT_FOUND {
            return Ok(Ok(Listing::Missing));
        }
        if !resp.is_success() {
            return Ok(Err(AdapterError::Status {
                url,
                status: resp.status.as_u16(),
            }));
        }
        Ok(serde_json::from_slice::<Vec<ContentEntry>>(&resp.body)
            .map(Listing::Entries)
            .map_err(|e| AdapterError::Decode {
                url,
                reason: e.to_string(),
            }))
    }

    async fn crawl_letter(&self, letter: char) -> Result<Vec<RawPackageRecord>, GovernorError> {
        let publishers = match self.list(&letter.to_string()).await? {
            Ok(Listing::Entries(entries)) => entries,
            Ok(Listing::Missing) => {
                debug!(%letter, "winget letter directory missing; skipping");
                return Ok(Vec::new());
            }
            Err(err) => {
                warn!(%letter, error = %err, "winget letter listing failed; continuing");
                return Ok(Vec::new());
            }
        };

        let mut records = Vec::new();
        for publisher in publishers.iter().filter(|e| e.is_dir()) {
            let path = format!("{letter}/{}", publisher.name);
            match self.list(&path).await? {
                Ok(Listing::Entries(packages)) => records.extend(
                    packages
                        .iter()
                        .filter(|e| e.is_dir())
                        .map(|package| package_record(&publisher.name, &package.name)),
                ),
                Ok(Listing::Missing) => debug!(%path, "winget publisher directory missing"),
                Err(err) => warn!(%path, error = %err, "winget publisher listing failed; continuing"),
            }
        }
        Ok(records)
    }
}

#[async_trait]
impl SourceAdapter for WingetAdapter {
    fn source_id(&self) -> SourceId {
        SourceId::Winget
    }

    fn tracks_liveness(&self) -> bool {
        false
    }

    async fn fetch_all(&self, progress: &ProgressSink) -> Result<Vec<RawPackageRecord>, AdapterError> {
        let span = info_span!("winget_crawl", authenticated = self.token.is_some());
        async {
            self.governor.begin_run().await;
            let mut letters: Vec<char> = LETTERS.chars().collect();
            if let Some(cap) = self.max_pages {
                letters.truncate(cap);
            }
            let total = letters.len();
            let mut records: Vec<RawPackageRecord> = Vec::new();
            for (i, letter) in letters.into_iter().enumerate() {
                records.extend(self.crawl_letter(letter).await?);
                progress.fetch(i + 1, total, records.last().map(|r| r.name.as_str()));
            }
            let records = dedupe_by_name(records);
            let requests = self.governor.requests_made().await;
            info!(records = records.len(), requests, "winget crawl finished");
            Ok(records)
        }
        .instrument(span)
        .await
    }
}
