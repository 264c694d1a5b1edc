//! Homebrew formulae (CLI) and casks (GUI apps) from the formulae.brew.sh JSON API.

use std::sync::Arc;

use async_trait::async_trait;
use pkgcat_core::{PackageType, PlatformId, RawPackageRecord, Repository, SourceId};
use pkgcat_storage::HttpFetcher;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tracing::{info, info_span, Instrument};

use crate::{dedupe_by_name, ensure_success, text_or_none, AdapterError, ParsedBatch, ProgressSink, SourceAdapter, SourceOptions};

pub const HOMEBREW_BASE_URL: &str = "https://formulae.brew.sh";
pub const CASK_LICENSE: &str = "Unknown";

#[derive(Debug, Deserialize)]
pub struct Formula {
    pub name: String,
    pub desc: Option<String>,
    pub license: Option<String>,
    pub homepage: Option<String>,
    #[serde(default)]
    pub versions: FormulaVersions,
}

#[derive(Debug, Default, Deserialize)]
pub struct FormulaVersions {
    pub stable: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct Cask {
    pub token: String,
    pub desc: Option<String>,
    pub homepage: Option<String>,
    pub version: Option<String>,
}

impl Formula {
    pub fn into_record(self) -> RawPackageRecord {
        let version = self.versions.stable.and_then(text_or_none).unwrap_or_else(|| "latest".into());
        let mut record = RawPackageRecord::new(self.name, version, PlatformId::Macos);
        record.repository = Repository::Official;
        record.package_type = PackageType::Cli;
        if let Some(desc) = self.desc.and_then(text_or_none) {
            record.description = desc;
        }
        record.license = self.license.and_then(text_or_none);
        record.homepage = self.homepage.and_then(text_or_none);
        record
    }
}

impl Cask {
    pub fn into_record(self) -> RawPackageRecord {
        let version = self.version.and_then(text_or_none).unwrap_or_else(|| "latest".into());
        let mut record = RawPackageRecord::new(self.token, version, PlatformId::Macos);
        record.repository = Repository::Official;
        record.package_type = PackageType::Gui;
        if let Some(desc) = self.desc.and_then(text_or_none) {
            record.description = desc;
        }
        record.license = Some(CASK_LICENSE.to_string());
        record.homepage = self.homepage.and_then(text_or_none);
        record
    }
}

/// Decode a JSON array entry by entry; entries that don't fit `T` are skipped.
pub fn parse_entries<T, F>(body: &[u8], into_record: F) -> Result<ParsedBatch, serde_json::Error>
where
    T: DeserializeOwned,
    F: Fn(T) -> RawPackageRecord,
{
    let entries: Vec<JsonValue> = serde_json::from_slice(body)?;
    let mut batch = ParsedBatch::default();
    for entry in entries {
        match serde_json::from_value::<T>(entry) {
            Ok(item) => batch.records.push(into_record(item)),
            Err(_) => batch.skipped += 1,
        }
    }
    Ok(batch)
}

pub struct HomebrewAdapter {
    base_url: String,
    http: Arc<HttpFetcher>,
}

impl HomebrewAdapter {
    pub fn new(http: Arc<HttpFetcher>, options: &SourceOptions) -> Self {
        Self {
            base_url: options.base_url_or(HOMEBREW_BASE_URL),
            http,
        }
    }

    async fn fetch_index<T, F>(&self, path: &str, into_record: F) -> Result<ParsedBatch, AdapterError>
    where
        T: DeserializeOwned,
        F: Fn(T) -> RawPackageRecord,
    {
        let url = format!("{}/{path}", self.base_url);
        let resp = self
            .http
            .get(&url, &[])
            .await
            .map_err(|source| AdapterError::Fetch {
                url: url.clone(),
                source,
            })?;
        let resp = ensure_success(resp)?;
        parse_entries(&resp.body, into_record).map_err(|e| AdapterError::Decode {
            url,
            reason: e.to_string(),
        })
    }
}

#[async_trait]
impl SourceAdapter for HomebrewAdapter {
    fn source_id(&self) -> SourceId {
        SourceId::Homebrew
    }

    fn tracks_liveness(&self) -> bool {
        false
    }

    async fn fetch_all(&self, progress: &ProgressSink) -> Result<Vec<RawPackageRecord>, AdapterError> {
        let span = info_span!("homebrew_fetch", base_url = %self.base_url);
        async {
            let formulae = self.fetch_index("api/formula.json", Formula::into_record).await?;
            progress.fetch(1, 2, formulae.records.last().map(|r| r.name.as_str()));
            let casks = self.fetch_index("api/cask.json", Cask::into_record).await?;
            progress.fetch(2, 2, casks.records.last().map(|r| r.name.as_str()));

            info!(
                formulae = formulae.records.len(),
                casks = casks.records.len(),
                skipped = formulae.skipped + casks.skipped,
                "homebrew indexes parsed"
            );
            let mut records = formulae.records;
            records.extend(casks.records);
            Ok(dedupe_by_name(records))
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use axum::{routing::get, Json, Router};
    use serde_json::json;

    use super::*;
    use crate::test_support::{fetcher, spawn_server};

    #[test]
    fn formulae_are_cli_with_license() {
        let body = br#"[{"name":"wget","desc":"Internet file retriever","license":"GPL-3.0-or-later",
            "homepage":"https://www.gnu.org/software/wget/","versions":{"stable":"1.24.5","head":"HEAD"}},
            {"desc":"missing name"}]"#;
        let batch = parse_entries(body, Formula::into_record).unwrap();
        assert_eq!(batch.skipped, 1);
        let wget = &batch.records[0];
        assert_eq!(wget.version, "1.24.5");
        assert_eq!(wget.package_type, PackageType::Cli);
        assert_eq!(wget.license.as_deref(), Some("GPL-3.0-or-later"));
        assert_eq!(wget.platform_id, PlatformId::Macos);
    }

    #[test]
    fn casks_are_gui_with_unknown_license() {
        let body = br#"[{"token":"firefox","name":["Mozilla Firefox"],"desc":"Web browser","version":"128.0"}]"#;
        let batch = parse_entries(body, Cask::into_record).unwrap();
        let firefox = &batch.records[0];
        assert_eq!(firefox.name, "firefox");
        assert_eq!(firefox.package_type, PackageType::Gui);
        assert_eq!(firefox.license.as_deref(), Some(CASK_LICENSE));
    }

    #[test]
    fn non_array_payload_is_an_error() {
        assert!(parse_entries(br#"{"name":"wget"}"#, Formula::into_record).is_err());
    }

    #[tokio::test]
    async fn formula_wins_over_same_named_cask() {
        let router = Router::new()
            .route(
                "/api/formula.json",
                get(|| async { Json(json!([{"name": "docker", "versions": {"stable": "27.0"}}])) }),
            )
            .route(
                "/api/cask.json",
                get(|| async { Json(json!([{"token": "docker", "version": "4.30"}, {"token": "iterm2"}])) }),
            );
        let base = spawn_server(router).await;
        let adapter = HomebrewAdapter::new(
            fetcher(),
            &SourceOptions {
                base_url: Some(base),
                ..Default::default()
            },
        );
        let records = adapter.fetch_all(&ProgressSink::disabled()).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].version, "27.0");
        assert_eq!(records[1].name, "iterm2");
        assert_eq!(records[1].version, "latest");
    }
}
