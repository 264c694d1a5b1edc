//! Arch Linux official repositories, scraped from the paginated package search.

use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use pkgcat_core::{PlatformId, RawPackageRecord, Repository, SourceId};
use pkgcat_storage::{HttpFetcher, RateGovernor};
use regex::Regex;
use scraper::Html;
use tracing::{info, info_span, warn, Instrument};

use crate::classify::classify_package_type;
use crate::{
    dedupe_by_name, element_text, ensure_success, parse_count, parse_selector, text_or_none,
    AdapterError, ParsedBatch, ProgressSink, SourceAdapter, SourceOptions,
};

pub const ARCH_BASE_URL: &str = "https://archlinux.org/packages/";

static BANNER_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)(\d[\d,]*)\s+matching packages? found.*?Page\s+(\d+)\s+of\s+(\d+)").expect("invalid regex")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchBanner {
    pub total_packages: usize,
    pub page: usize,
    pub total_pages: usize,
}

pub fn parse_banner(html: &str) -> Option<SearchBanner> {
    let caps = BANNER_REGEX.captures(html)?;
    Some(SearchBanner {
        total_packages: parse_count(caps.get(1)?.as_str())?,
        page: caps.get(2)?.as_str().parse().ok()?,
        total_pages: caps.get(3)?.as_str().parse().ok()?,
    })
}

/// Rows need at least six cells: arch, repo, name, version, description, last updated.
pub fn parse_results_page(html: &str, platform: PlatformId) -> Result<ParsedBatch, AdapterError> {
    let document = Html::parse_document(html);
    let row_sel = parse_selector("tr")?;
    let cell_sel = parse_selector("td")?;

    let mut batch = ParsedBatch::default();
    for row in document.select(&row_sel) {
        let cells: Vec<String> = row.select(&cell_sel).map(element_text).collect();
        if cells.is_empty() {
            continue;
        }
        if cells.len() < 6 {
            batch.skipped += 1;
            continue;
        }
        let (Some(name), Some(version)) = (text_or_none(cells[2].clone()), text_or_none(cells[3].clone())) else {
            batch.skipped += 1;
            continue;
        };

        let mut record = RawPackageRecord::new(name, version, platform);
        record.repository = Repository::Official;
        if let Some(description) = text_or_none(cells[4].clone()) {
            record.description = description;
        }
        record.package_type = classify_package_type(&record.name, &record.description);
        batch.records.push(record);
    }
    Ok(batch)
}

pub struct ArchAdapter {
    base_url: String,
    max_pages: Option<usize>,
    http: Arc<HttpFetcher>,
    governor: RateGovernor,
}

impl ArchAdapter {
    pub fn new(http: Arc<HttpFetcher>, options: &SourceOptions) -> Self {
        Self {
            base_url: options.base_url_or(ARCH_BASE_URL),
            max_pages: options.max_pages,
            http,
            governor: RateGovernor::fixed_interval(options.request_delay()),
        }
    }

    fn page_url(&self, page: usize) -> String {
        format!("{}/?page={page}", self.base_url)
    }

    async fn fetch_page(&self, page: usize) -> Result<String, AdapterError> {
        let url = self.page_url(page);
        let resp = self.governor.get(&self.http, &url, &[]).await?;
        Ok(ensure_success(resp)?.text_lossy())
    }
}

#[async_trait]
impl SourceAdapter for ArchAdapter {
    fn source_id(&self) -> SourceId {
        SourceId::Arch
    }

    async fn fetch_all(&self, progress: &ProgressSink) -> Result<Vec<RawPackageRecord>, AdapterError> {
        let span = info_span!("arch_crawl", base_url = %self.base_url);
        async {
            self.governor.begin_run().await;
            let platform = self.platform_id();
            let first = self.fetch_page(1).await?;
            let banner = parse_banner(&first);
            let mut total_pages = banner.map(|b| b.total_pages).unwrap_or(1).max(1);
            if let Some(cap) = self.max_pages {
                total_pages = total_pages.min(cap.max(1));
            }
            info!(
                total_packages = banner.map(|b| b.total_packages),
                total_pages, "arch search banner"
            );

            let mut records: Vec<RawPackageRecord> = Vec::new();
            let mut skipped = 0;
            let first_batch = parse_results_page(&first, platform)?;
            skipped += first_batch.skipped;
            records.extend(first_batch.records);
            progress.fetch(1, total_pages, records.last().map(|r| r.name.as_str()));

            for page in 2..=total_pages {
                match self.fetch_page(page).await {
                    Ok(html) => {
                        let batch = parse_results_page(&html, platform)?;
                        skipped += batch.skipped;
                        records.extend(batch.records);
                    }
                    Err(err) => warn!(page, error = %err, "arch page fetch failed; continuing"),
                }
                progress.fetch(page, total_pages, records.last().map(|r| r.name.as_str()));
            }

            let records = dedupe_by_name(records);
            info!(records = records.len(), skipped, "arch crawl finished");
            Ok(records)
        }
        .instrument(span)
        .await
    }
}
