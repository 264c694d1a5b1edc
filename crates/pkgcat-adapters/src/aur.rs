//! Arch User Repository: RPC search per character, HTML listing as fallback.

use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use pkgcat_core::{EnumField, PlatformId, RawPackageRecord, Repository, SourceId, PLACEHOLDER_POPULARITY};
use pkgcat_storage::{HttpFetcher, RateGovernor};
use regex::Regex;
use scraper::Html;
use serde::Deserialize;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::classify::classify_package_type;
use crate::{
    dedupe_by_name, element_text, ensure_success, parse_count, parse_selector, text_or_none,
    AdapterError, ParsedBatch, ProgressSink, SourceAdapter, SourceOptions,
};

pub const AUR_BASE_URL: &str = "https://aur.archlinux.org";
pub const HTML_PAGE_SIZE: usize = 50;

const SEARCH_ALPHABET: &str = "abcdefghijklmnopqrstuvwxyz0123456789";

static TOTAL_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d[\d,]*)\s+packages?\s+found").expect("invalid regex"));

#[derive(Debug, Deserialize)]
pub struct RpcResponse {
    #[serde(default)]
    pub resultcount: usize,
    #[serde(default)]
    pub results: Vec<RpcPackage>,
    pub error: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RpcPackage {
    pub name: String,
    pub version: String,
    pub description: Option<String>,
    pub popularity: Option<f64>,
    #[serde(rename = "URL")]
    pub url: Option<String>,
    pub license: Option<Vec<String>>,
}

/// AUR popularity is a small decaying float; scale ×10 into 0..=100.
pub fn popularity_score(popularity: f64) -> u8 {
    if !popularity.is_finite() {
        return PLACEHOLDER_POPULARITY;
    }
    (popularity * 10.0).round().clamp(0.0, 100.0) as u8
}

fn aur_record(name: String, version: String, description: Option<String>, popularity: Option<f64>) -> RawPackageRecord {
    let mut record = RawPackageRecord::new(name, version, PlatformId::Arch);
    record.repository = Repository::Aur;
    if let Some(description) = description.and_then(text_or_none) {
        record.description = description;
    }
    if let Some(popularity) = popularity {
        record.popularity_score = popularity_score(popularity);
    }
    record.package_type = classify_package_type(&record.name, &record.description);
    record
}

impl RpcPackage {
    pub fn into_record(self) -> RawPackageRecord {
        let homepage = self.url.clone().and_then(text_or_none);
        let license = self.license.as_ref().filter(|l| !l.is_empty()).map(|l| l.join(" "));
        let mut record = aur_record(self.name, self.version, self.description, self.popularity);
        record.homepage = homepage;
        record.license = license;
        record
    }
}

pub fn parse_total(html: &str) -> Option<usize> {
    let caps = TOTAL_REGEX.captures(html)?;
    parse_count(caps.get(1)?.as_str())
}

/// Listing columns: name, version, votes, popularity, description, ...
pub fn parse_listing_page(html: &str) -> Result<ParsedBatch, AdapterError> {
    let document = Html::parse_document(html);
    let row_sel = parse_selector("tr")?;
    let cell_sel = parse_selector("td")?;

    let mut batch = ParsedBatch::default();
    for row in document.select(&row_sel) {
        let cells: Vec<String> = row.select(&cell_sel).map(element_text).collect();
        if cells.is_empty() {
            continue;
        }
        if cells.len() < 5 {
            batch.skipped += 1;
            continue;
        }
        let (Some(name), Some(version)) = (text_or_none(cells[0].clone()), text_or_none(cells[1].clone())) else {
            batch.skipped += 1;
            continue;
        };
        let popularity = cells[3].trim().parse::<f64>().ok();
        batch
            .records
            .push(aur_record(name, version, Some(cells[4].clone()), popularity));
    }
    Ok(batch)
}

pub struct AurAdapter {
    base_url: String,
    max_pages: Option<usize>,
    http: Arc<HttpFetcher>,
    governor: RateGovernor,
}

impl AurAdapter {
    pub fn new(http: Arc<HttpFetcher>, options: &SourceOptions) -> Self {
        Self {
            base_url: options.base_url_or(AUR_BASE_URL),
            max_pages: options.max_pages,
            http,
            governor: RateGovernor::fixed_interval(options.request_delay()),
        }
    }

    fn rpc_url(&self, arg: char) -> String {
        format!("{}/rpc/?v=5&type=search&by=name&arg={arg}", self.base_url)
    }

    fn listing_url(&self, offset: usize) -> String {
        format!("{}/packages?O={offset}&SeB=nd&SB=p", self.base_url)
    }

    async fn rpc_search(&self, arg: char) -> Result<RpcResponse, AdapterError> {
        let url = self.rpc_url(arg);
        let resp = self.governor.get(&self.http, &url, &[]).await?;
        let resp = ensure_success(resp)?;
        serde_json::from_slice(&resp.body).map_err(|e| AdapterError::Decode {
            url,
            reason: e.to_string(),
        })
    }

    async fn crawl_rpc(&self, progress: &ProgressSink) -> Vec<RawPackageRecord> {
        let total = SEARCH_ALPHABET.len();
        let mut records: Vec<RawPackageRecord> = Vec::new();
        for (i, arg) in SEARCH_ALPHABET.chars().enumerate() {
            match self.rpc_search(arg).await {
                Ok(resp) => {
                    if let Some(error) = &resp.error {
                        debug!(%arg, error = %error, "aur rpc rejected query");
                    }
                    debug!(%arg, results = resp.resultcount, "aur rpc query");
                    records.extend(resp.results.into_iter().map(RpcPackage::into_record));
                }
                Err(err) => warn!(%arg, error = %err, "aur rpc query failed; continuing"),
            }
            progress.fetch(i + 1, total, records.last().map(|r| r.name.as_str()));
        }
        records
    }

    async fn fetch_listing(&self, offset: usize) -> Result<String, AdapterError> {
        let url = self.listing_url(offset);
        let resp = self.governor.get(&self.http, &url, &[]).await?;
        Ok(ensure_success(resp)?.text_lossy())
    }

    async fn crawl_html(&self, progress: &ProgressSink) -> Result<Vec<RawPackageRecord>, AdapterError> {
        let first = self.fetch_listing(0).await?;
        let total_packages = parse_total(&first);
        let mut total_pages = total_packages
            .map(|t| t.div_ceil(HTML_PAGE_SIZE).max(1))
            .or(self.max_pages)
            .unwrap_or(0);
        if let Some(cap) = self.max_pages {
            total_pages = total_pages.min(cap.max(1));
        }
        info!(total_packages, total_pages, "aur html fallback");

        let mut records: Vec<RawPackageRecord> = Vec::new();
        let mut skipped = 0;
        let mut page = 0;
        let mut html = Some(first);
        loop {
            if let Some(body) = html.take() {
                let batch = parse_listing_page(&body)?;
                if batch.records.is_empty() {
                    debug!(page, "empty aur listing page; stopping");
                    break;
                }
                skipped += batch.skipped;
                records.extend(batch.records);
            }
            page += 1;
            progress.fetch(page, total_pages, records.last().map(|r| r.name.as_str()));
            if total_pages > 0 && page >= total_pages {
                break;
            }
            match self.fetch_listing(page * HTML_PAGE_SIZE).await {
                Ok(body) => html = Some(body),
                Err(err) => {
                    warn!(page, error = %err, "aur listing page fetch failed; continuing");
                    if total_pages == 0 {
                        break;
                    }
                }
            }
        }
        info!(records = records.len(), skipped, "aur html crawl finished");
        Ok(records)
    }
}

#[async_trait]
impl SourceAdapter for AurAdapter {
    fn source_id(&self) -> SourceId {
        SourceId::Aur
    }

    fn required_enum_values(&self) -> &'static [(EnumField, &'static str)] {
        &[(EnumField::Repository, "aur")]
    }

    async fn fetch_all(&self, progress: &ProgressSink) -> Result<Vec<RawPackageRecord>, AdapterError> {
        let span = info_span!("aur_crawl", base_url = %self.base_url);
        async {
            self.governor.begin_run().await;
            let records = self.crawl_rpc(progress).await;
            let records = if records.is_empty() {
                warn!("aur rpc returned nothing; falling back to html listing");
                self.crawl_html(progress).await?
            } else {
                records
            };
            let records = dedupe_by_name(records);
            info!(records = records.len(), "aur crawl finished");
            Ok(records)
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn popularity_scales_and_clamps() {
        assert_eq!(popularity_score(0.0), 0);
        assert_eq!(popularity_score(3.46), 35);
        assert_eq!(popularity_score(42.0), 100);
        assert_eq!(popularity_score(f64::NAN), PLACEHOLDER_POPULARITY);
    }

    #[test]
    fn rpc_payload_maps_to_aur_records() {
        let json = r#"{"resultcount":1,"results":[{"Name":"yay","Version":"12.3.5-1",
            "Description":"Yet another yogurt. Pacman wrapper and AUR helper written in go.",
            "Popularity":18.9,"URL":"https://github.com/Jguer/yay","NumVotes":2300}],"type":"search","version":5}"#;
        let resp: RpcResponse = serde_json::from_str(json).unwrap();
        let record = resp.results.into_iter().next().unwrap().into_record();
        assert_eq!(record.name, "yay");
        assert_eq!(record.repository, Repository::Aur);
        assert_eq!(record.platform_id, PlatformId::Arch);
        assert_eq!(record.popularity_score, 100);
        assert_eq!(record.homepage.as_deref(), Some("https://github.com/Jguer/yay"));
    }

    #[test]
    fn rpc_error_payload_has_no_results() {
        let json = r#"{"error":"Too many package results.","resultcount":0,"results":[],"type":"error","version":5}"#;
        let resp: RpcResponse = serde_json::from_str(json).unwrap();
        assert_eq!(resp.resultcount, 0);
        assert!(resp.results.is_empty());
        assert_eq!(resp.error.as_deref(), Some("Too many package results."));
    }

    #[test]
    fn listing_total_and_rows_parse() {
        let html = "<p>98,765 packages found. Page 1 of 1976.</p><table><tbody>\
            <tr><td><a href=\"/packages/paru\">paru</a></td><td>2.0.4-1</td><td>1500</td><td>12.34</td>\
            <td>Feature packed AUR helper</td><td>Morganamilo</td></tr>\
            <tr><td>half</td></tr></tbody></table>";
        assert_eq!(parse_total(html), Some(98765));
        let batch = parse_listing_page(html).unwrap();
        assert_eq!(batch.records.len(), 1);
        assert_eq!(batch.skipped, 1);
        assert_eq!(batch.records[0].popularity_score, 100);
        assert_eq!(batch.records[0].description, "Feature packed AUR helper");
    }
}
