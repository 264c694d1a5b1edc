//! Debian/Ubuntu `allpackages` flat-text dumps.

use std::io::Read;
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use flate2::read::{GzDecoder, MultiGzDecoder};
use pkgcat_core::{PlatformId, RawPackageRecord, Repository, SourceId};
use pkgcat_storage::HttpFetcher;
use regex::Regex;
use tracing::{debug, info, info_span, Instrument};

use crate::classify::classify_package_type;
use crate::{ensure_success, AdapterError, ParsedBatch, ProgressSink, SourceAdapter, SourceOptions};

pub const DEBIAN_URL: &str = "https://packages.debian.org/stable/allpackages?format=txt.gz";
pub const UBUNTU_URL: &str = "https://packages.ubuntu.com/noble/allpackages?format=txt.gz";

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Banner lines that would otherwise look like entries (`Copyright (C) ...`).
const BANNER_PREFIXES: &[&str] = &["All Debian Packages", "All Ubuntu Packages", "Generated:", "Copyright", "See <"];

static ENTRY_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\S+) \(([^)]+)\)(?: \[([^\]]+)\])? ?(.*)$").expect("invalid regex")
});

pub struct AllPackagesAdapter {
    source: SourceId,
    url: String,
    http: Arc<HttpFetcher>,
}

impl AllPackagesAdapter {
    pub fn new(source: SourceId, http: Arc<HttpFetcher>, options: &SourceOptions) -> Self {
        let default_url = match source {
            SourceId::Ubuntu => UBUNTU_URL,
            _ => DEBIAN_URL,
        };
        Self {
            source,
            url: options.base_url.clone().unwrap_or_else(|| default_url.to_string()),
            http,
        }
    }
}

#[async_trait]
impl SourceAdapter for AllPackagesAdapter {
    fn source_id(&self) -> SourceId {
        self.source
    }

    async fn fetch_all(&self, progress: &ProgressSink) -> Result<Vec<RawPackageRecord>, AdapterError> {
        let span = info_span!("allpackages", source = %self.source);
        async {
            progress.fetch(0, 1, None);
            let resp = self
                .http
                .get(&self.url, &[])
                .await
                .map_err(|source| AdapterError::Fetch {
                    url: self.url.clone(),
                    source,
                })?;
            let resp = ensure_success(resp)?;
            let text = decode_payload(&resp.body).map_err(|reason| AdapterError::Decode {
                url: self.url.clone(),
                reason,
            })?;

            let batch = parse_all_packages(&text, self.platform_id());
            info!(
                records = batch.records.len(),
                skipped = batch.skipped,
                bytes = resp.body.len(),
                "parsed package dump"
            );
            progress.fetch(1, 1, batch.records.last().map(|r| r.name.as_str()));
            Ok(batch.records)
        }
        .instrument(span)
        .await
    }
}

pub fn is_gzip(body: &[u8]) -> bool {
    body.starts_with(&GZIP_MAGIC)
}

/// Gzip payloads are decompressed (single-member, then multi-member);
/// anything else is read as text.
pub fn decode_payload(body: &[u8]) -> Result<String, String> {
    if !is_gzip(body) {
        return Ok(String::from_utf8_lossy(body).into_owned());
    }

    let mut out = Vec::new();
    match GzDecoder::new(body).read_to_end(&mut out) {
        Ok(_) => return Ok(String::from_utf8_lossy(&out).into_owned()),
        Err(err) => debug!(error = %err, "single-member gzip decode failed; trying multi-member"),
    }

    out.clear();
    MultiGzDecoder::new(body)
        .read_to_end(&mut out)
        .map_err(|e| format!("gzip decode failed: {e}"))?;
    Ok(String::from_utf8_lossy(&out).into_owned())
}

pub fn map_repository(section: Option<&str>) -> Repository {
    match section.map(str::trim) {
        None | Some("main" | "restricted" | "universe" | "multiverse") => Repository::Official,
        Some(_) => Repository::ThirdParty,
    }
}

pub fn parse_entry(line: &str, platform: PlatformId) -> Option<RawPackageRecord> {
    let caps = ENTRY_REGEX.captures(line.trim_end())?;
    let name = caps.get(1)?.as_str();
    let version = caps.get(2)?.as_str().trim();
    if version.is_empty() {
        return None;
    }

    let mut record = RawPackageRecord::new(name, version, platform);
    record.repository = map_repository(caps.get(3).map(|m| m.as_str()));
    if let Some(desc) = caps.get(4).map(|m| m.as_str().trim()).filter(|d| !d.is_empty()) {
        record.description = desc.to_string();
    }
    record.package_type = classify_package_type(&record.name, &record.description);
    Some(record)
}

/// Parse a whole dump. Everything before the first entry is banner; blank lines
/// are ignored; later lines that don't parse are counted as skipped.
pub fn parse_all_packages(text: &str, platform: PlatformId) -> ParsedBatch {
    let mut batch = ParsedBatch::default();
    let mut in_body = false;
    for line in text.lines() {
        if line.trim().is_empty() || BANNER_PREFIXES.iter().any(|p| line.starts_with(p)) {
            continue;
        }
        match parse_entry(line, platform) {
            Some(record) => {
                in_body = true;
                batch.records.push(record);
            }
            None if in_body => batch.skipped += 1,
            None => {}
        }
    }
    batch
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use axum::{routing::get, Router};
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use pkgcat_core::PackageType;

    use super::*;
    use crate::test_support::{fetcher, spawn_server};

    const DEBIAN_DUMP: &str = "All Debian Packages in \"bookworm\"\n\
Generated: Mon Jan  1 00:00:00 2026 UTC\n\
Copyright (C) 1997-2026 SPI;\n\
See <URL:https://www.debian.org/license> for the license terms.\n\
\n\
firefox (115.0-1) Mozilla Firefox web browser\n\
vim (2:9.0.1378-2) Vi IMproved - enhanced vi editor\n\
virtual-mail-transport-agent virtual package provided by postfix\n\
libfoo0 (1.2-3)\n";

    fn gzip(bytes: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(bytes).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn debian_line_defaults_to_official() {
        let record = parse_entry("vim (2:9.0.1378-2) Vi IMproved - enhanced vi editor", PlatformId::Debian).unwrap();
        assert_eq!(record.name, "vim");
        assert_eq!(record.version, "2:9.0.1378-2");
        assert_eq!(record.platform_id, PlatformId::Debian);
        assert_eq!(record.repository, Repository::Official);
        assert_eq!(record.description, "Vi IMproved - enhanced vi editor");
    }

    #[test]
    fn ubuntu_sections_map_to_repository() {
        let main = parse_entry("bash (5.2-1) [main] GNU Bourne Again SHell", PlatformId::Ubuntu).unwrap();
        assert_eq!(main.repository, Repository::Official);
        let ppa = parse_entry("tool (1.0) [some-ppa] a tool", PlatformId::Ubuntu).unwrap();
        assert_eq!(ppa.repository, Repository::ThirdParty);
        let universe = parse_entry("gimp (2.10) [universe] GNU Image Manipulation Program", PlatformId::Ubuntu).unwrap();
        assert_eq!(universe.repository, Repository::Official);
    }

    #[test]
    fn missing_description_gets_placeholder() {
        let record = parse_entry("libfoo0 (1.2-3)", PlatformId::Debian).unwrap();
        assert_eq!(record.description, "libfoo0 package for Debian");
        assert_eq!(record.package_type, PackageType::Cli);
    }

    #[test]
    fn banner_is_skipped_and_bad_lines_counted() {
        let batch = parse_all_packages(DEBIAN_DUMP, PlatformId::Debian);
        let names: Vec<_> = batch.records.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["firefox", "vim", "libfoo0"]);
        assert_eq!(batch.skipped, 1);
        assert_eq!(batch.records[0].package_type, PackageType::Gui);
        assert_eq!(batch.records[1].package_type, PackageType::Gui);
    }

    #[test]
    fn gzip_magic_routes_to_decompression() {
        let compressed = gzip(DEBIAN_DUMP.as_bytes());
        assert!(is_gzip(&compressed));
        assert!(!is_gzip(DEBIAN_DUMP.as_bytes()));
        assert_eq!(decode_payload(&compressed).unwrap(), DEBIAN_DUMP);
        assert_eq!(decode_payload(DEBIAN_DUMP.as_bytes()).unwrap(), DEBIAN_DUMP);
    }

    #[test]
    fn truncated_gzip_is_an_error() {
        let mut compressed = gzip(DEBIAN_DUMP.as_bytes());
        compressed.truncate(12);
        assert!(decode_payload(&compressed).is_err());
    }

    #[tokio::test]
    async fn fetches_and_parses_a_served_dump() {
        let body = gzip(DEBIAN_DUMP.as_bytes());
        let base = spawn_server(Router::new().route(
            "/allpackages",
            get(move || {
                let body = body.clone();
                async move { body }
            }),
        ))
        .await;
        let adapter = AllPackagesAdapter::new(
            SourceId::Debian,
            fetcher(),
            &SourceOptions {
                base_url: Some(format!("{base}/allpackages")),
                ..Default::default()
            },
        );
        let records = adapter.fetch_all(&ProgressSink::disabled()).await.unwrap();
        assert_eq!(records.len(), 3);
    }

    #[tokio::test]
    async fn unreachable_dump_is_terminal() {
        let base = spawn_server(Router::new()).await;
        let adapter = AllPackagesAdapter::new(
            SourceId::Ubuntu,
            fetcher(),
            &SourceOptions {
                base_url: Some(format!("{base}/missing")),
                ..Default::default()
            },
        );
        let err = adapter.fetch_all(&ProgressSink::disabled()).await.unwrap_err();
        assert!(matches!(err, AdapterError::Status { status: 404, .. }));
    }

    #[tokio::test]
    async fn status_errors_name_the_redirect_target() {
        let base = spawn_server(Router::new().route(
            "/allpackages",
            get(|| async { axum::response::Redirect::permanent("/moved/allpackages") }),
        ))
        .await;
        let adapter = AllPackagesAdapter::new(
            SourceId::Debian,
            fetcher(),
            &SourceOptions {
                base_url: Some(format!("{base}/allpackages")),
                ..Default::default()
            },
        );
        match adapter.fetch_all(&ProgressSink::disabled()).await.unwrap_err() {
            AdapterError::Status { url, status } => {
                assert_eq!(status, 404);
                assert_eq!(url, format!("{base}/moved/allpackages"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
