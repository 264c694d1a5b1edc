//! Fedora packages, read from the static prefix index and its shards.

use std::collections::HashSet;
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use pkgcat_core::{PlatformId, RawPackageRecord, Repository, SourceId};
use pkgcat_storage::{HttpFetcher, RateGovernor};
use regex::Regex;
use scraper::Html;
use tracing::{info, info_span, warn, Instrument};

use crate::classify::classify_package_type;
use crate::{
    dedupe_by_name, element_text, ensure_success, join_url, parse_selector, text_or_none,
    AdapterError, ParsedBatch, ProgressSink, SourceAdapter, SourceOptions,
};

pub const FEDORA_BASE_URL: &str = "https://packages.fedoraproject.org";
pub const VERSION_PLACEHOLDER: &str = "latest";

static SHARD_HREF: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:^|/)index/[^/]+\.html$").expect("invalid regex"));
static PACKAGE_HREF: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"/pkgs/([^/?#]+)/?").expect("invalid regex"));

/// Shard links found on the static index, in page order, without duplicates.
pub fn parse_shard_links(html: &str) -> Result<Vec<String>, AdapterError> {
    let document = Html::parse_document(html);
    let anchor = parse_selector("a[href]")?;
    let mut seen = HashSet::new();
    Ok(document
        .select(&anchor)
        .filter_map(|a| a.value().attr("href"))
        .map(str::trim)
        .filter(|href| SHARD_HREF.is_match(href))
        .filter(|href| seen.insert(href.to_string()))
        .map(ToString::to_string)
        .collect())
}

pub fn parse_shard(html: &str, platform: PlatformId) -> Result<ParsedBatch, AdapterError> {
    let document = Html::parse_document(html);
    let anchor = parse_selector("a[href]")?;
    let mut batch = ParsedBatch::default();
    for a in document.select(&anchor) {
        let Some(href) = a.value().attr("href") else {
            continue;
        };
        let Some(caps) = PACKAGE_HREF.captures(href) else {
            continue;
        };
        let name = text_or_none(element_text(a)).or_else(|| caps.get(1).map(|m| m.as_str().to_string()));
        let Some(name) = name.filter(|n| !n.contains(char::is_whitespace)) else {
            batch.skipped += 1;
            continue;
        };

        let mut record = RawPackageRecord::new(name, VERSION_PLACEHOLDER, platform);
        record.repository = Repository::Official;
        record.package_type = classify_package_type(&record.name, "");
        batch.records.push(record);
    }
    Ok(batch)
}

pub struct FedoraAdapter {
    base_url: String,
    max_pages: Option<usize>,
    http: Arc<HttpFetcher>,
    governor: RateGovernor,
}

impl FedoraAdapter {
    pub fn new(http: Arc<HttpFetcher>, options: &SourceOptions) -> Self {
        Self {
            base_url: options.base_url_or(FEDORA_BASE_URL),
            max_pages: options.max_pages,
            http,
            governor: RateGovernor::fixed_interval(options.request_delay()),
        }
    }

    async fn fetch_text(&self, url: &str) -> Result<String, AdapterError> {
        let resp = self.governor.get(&self.http, url, &[]).await?;
        Ok(ensure_success(resp)?.text_lossy())
    }
}

#[async_trait]
impl SourceAdapter for FedoraAdapter {
    fn source_id(&self) -> SourceId {
        SourceId::Fedora
    }

    async fn fetch_all(&self, progress: &ProgressSink) -> Result<Vec<RawPackageRecord>, AdapterError> {
        let span = info_span!("fedora_crawl", base_url = %self.base_url);
        async {
            self.governor.begin_run().await;
            let index_url = format!("{}/index-static.html", self.base_url);
            let index = self.fetch_text(&index_url).await?;
            let mut shards = parse_shard_links(&index)?;
            if let Some(cap) = self.max_pages {
                shards.truncate(cap);
            }
            info!(shards = shards.len(), "fedora index loaded");

            let total = shards.len();
            let mut records: Vec<RawPackageRecord> = Vec::new();
            let mut skipped = 0;
            for (i, href) in shards.iter().enumerate() {
                let url = join_url(&self.base_url, href);
                match self.fetch_text(&url).await {
                    Ok(html) => {
                        let batch = parse_shard(&html, self.platform_id())?;
                        skipped += batch.skipped;
                        records.extend(batch.records);
                    }
                    Err(err) => warn!(shard = %href, error = %err, "fedora shard fetch failed; continuing"),
                }
                progress.fetch(i + 1, total, records.last().map(|r| r.name.as_str()));
            }

            let records = dedupe_by_name(records);
            info!(records = records.len(), skipped, "fedora crawl finished");
            Ok(records)
        }
        .instrument(span)
        .await
    }
}
