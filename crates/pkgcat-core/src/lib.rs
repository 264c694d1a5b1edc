//! Core catalog domain model for pkgcat.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "pkgcat-core";

/// Popularity assigned by sources that publish no usage data.
pub const PLACEHOLDER_POPULARITY: u8 = 50;

/// Upper bound on `PackageFilter::limit` accepted by the read API.
pub const MAX_PAGE_LIMIT: u32 = 100;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind} value: {value:?}")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

macro_rules! string_enum {
    ($(#[$meta:meta])* $name:ident, $kind:literal { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(#[serde(rename = $text)] $variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = ParseEnumError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.trim() {
                    $($text => Ok($name::$variant),)+
                    other => Err(ParseEnumError {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

string_enum!(
    /// Target OS/distribution identity. Closed set.
    PlatformId, "platform" {
        Debian => "debian",
        Ubuntu => "ubuntu",
        Arch => "arch",
        Fedora => "fedora",
        Macos => "macos",
        Windows => "windows",
    }
);

string_enum!(
    Repository, "repository" {
        Official => "official",
        ThirdParty => "third-party",
        Aur => "aur",
    }
);

string_enum!(
    PackageType, "package type" {
        Gui => "gui",
        Cli => "cli",
    }
);

string_enum!(
    /// Upstream package repository with its own fetch/parse logic.
    SourceId, "source" {
        Debian => "debian",
        Ubuntu => "ubuntu",
        Arch => "arch",
        Aur => "aur",
        Fedora => "fedora",
        Homebrew => "homebrew",
        Winget => "winget",
    }
);

impl PlatformId {
    pub fn display_name(&self) -> &'static str {
        match self {
            PlatformId::Debian => "Debian",
            PlatformId::Ubuntu => "Ubuntu",
            PlatformId::Arch => "Arch Linux",
            PlatformId::Fedora => "Fedora",
            PlatformId::Macos => "macOS",
            PlatformId::Windows => "Windows",
        }
    }

    pub fn package_manager(&self) -> &'static str {
        match self {
            PlatformId::Debian | PlatformId::Ubuntu => "apt",
            PlatformId::Arch => "pacman",
            PlatformId::Fedora => "dnf",
            PlatformId::Macos => "brew",
            PlatformId::Windows => "winget",
        }
    }
}

impl SourceId {
    /// The single platform every record from this source is stored under.
    pub fn platform(&self) -> PlatformId {
        match self {
            SourceId::Debian => PlatformId::Debian,
            SourceId::Ubuntu => PlatformId::Ubuntu,
            SourceId::Arch | SourceId::Aur => PlatformId::Arch,
            SourceId::Fedora => PlatformId::Fedora,
            SourceId::Homebrew => PlatformId::Macos,
            SourceId::Winget => PlatformId::Windows,
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            SourceId::Debian => "Debian",
            SourceId::Ubuntu => "Ubuntu",
            SourceId::Arch => "Arch Linux",
            SourceId::Aur => "Arch User Repository",
            SourceId::Fedora => "Fedora",
            SourceId::Homebrew => "Homebrew",
            SourceId::Winget => "Winget",
        }
    }
}

/// Synthesized description for sources whose listing carries none.
pub fn placeholder_description(name: &str, platform: PlatformId) -> String {
    format!("{name} package for {}", platform.display_name())
}

/// Normalized record produced by every source parser.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawPackageRecord {
    pub name: String,
    pub version: String,
    pub description: String,
    pub platform_id: PlatformId,
    pub repository: Repository,
    pub package_type: PackageType,
    pub popularity_score: u8,
    pub license: Option<String>,
    pub homepage: Option<String>,
}

impl RawPackageRecord {
    /// Record with placeholder description/popularity; callers override what the source knows.
    pub fn new(name: impl Into<String>, version: impl Into<String>, platform_id: PlatformId) -> Self {
        let name = name.into();
        Self {
            description: placeholder_description(&name, platform_id),
            name,
            version: version.into(),
            platform_id,
            repository: Repository::Official,
            package_type: PackageType::Cli,
            popularity_score: PLACEHOLDER_POPULARITY,
            license: None,
            homepage: None,
        }
    }
}

/// Persisted catalog row. `(name, platform_id)` is the natural key; `id` is opaque.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredPackage {
    pub id: Uuid,
    pub name: String,
    pub version: String,
    pub description: String,
    pub platform_id: PlatformId,
    pub repository: Repository,
    pub package_type: PackageType,
    pub popularity_score: u8,
    pub license: Option<String>,
    pub homepage: Option<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_seen_at: Option<DateTime<Utc>>,
}

/// Mutable fields rewritten when an incoming record carries a new version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageUpdate {
    pub version: String,
    pub description: String,
    pub repository: Repository,
    pub package_type: PackageType,
    pub popularity_score: u8,
    pub license: Option<String>,
    pub homepage: Option<String>,
    /// Also refresh `last_seen_at` and force `is_active = true`.
    pub mark_seen: bool,
}

impl PackageUpdate {
    pub fn from_record(record: &RawPackageRecord, mark_seen: bool) -> Self {
        Self {
            version: record.version.clone(),
            description: record.description.clone(),
            repository: record.repository,
            package_type: record.package_type,
            popularity_score: record.popularity_score,
            license: record.license.clone(),
            homepage: record.homepage.clone(),
            mark_seen,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Platform {
    pub id: PlatformId,
    pub name: String,
    pub package_manager: String,
}

impl From<PlatformId> for Platform {
    fn from(id: PlatformId) -> Self {
        Self {
            id,
            name: id.display_name().to_string(),
            package_manager: id.package_manager().to_string(),
        }
    }
}

/// Enum-typed catalog columns whose permitted values storage may restrict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnumField {
    Repository,
    PackageType,
}

impl fmt::Display for EnumField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnumField::Repository => f.write_str("repository"),
            EnumField::PackageType => f.write_str("package_type"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    #[default]
    Idle,
    Running,
    Complete,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UpsertCounts {
    pub inserted: usize,
    pub updated: usize,
    pub skipped: usize,
}

impl UpsertCounts {
    pub fn processed(&self) -> usize {
        self.inserted + self.updated + self.skipped
    }
}

/// Progress observation emitted by a running sync. Advisory only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "lowercase")]
pub enum ProgressEvent {
    Fetch {
        current: usize,
        total: usize,
        sample: Option<String>,
    },
    Store {
        processed: usize,
        total: usize,
        counts: UpsertCounts,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StageProgress {
    pub current: usize,
    pub total: usize,
}

/// Per-source, process-lifetime sync status. Overwritten on every run.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SyncStatus {
    pub state: SyncState,
    pub error: Option<String>,
    pub fetch: Option<StageProgress>,
    pub store: Option<StageProgress>,
    pub last_sample: Option<String>,
    pub counts: Option<UpsertCounts>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl SyncStatus {
    pub fn running(started_at: DateTime<Utc>) -> Self {
        Self {
            state: SyncState::Running,
            started_at: Some(started_at),
            ..Default::default()
        }
    }

    pub fn apply(&mut self, event: &ProgressEvent) {
        match event {
            ProgressEvent::Fetch {
                current,
                total,
                sample,
            } => {
                self.fetch = Some(StageProgress {
                    current: *current,
                    total: *total,
                });
                if sample.is_some() {
                    self.last_sample = sample.clone();
                }
            }
            ProgressEvent::Store {
                processed,
                total,
                counts,
            } => {
                self.store = Some(StageProgress {
                    current: *processed,
                    total: *total,
                });
                self.counts = Some(*counts);
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.state == SyncState::Running
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortBy {
    #[default]
    Name,
    Popularity,
    UpdatedAt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

/// Read-API filter. Only active packages are ever served.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageFilter {
    pub platform_id: Option<PlatformId>,
    pub package_type: Option<PackageType>,
    pub repository: Option<Repository>,
    pub search: Option<String>,
    pub limit: u32,
    pub offset: u32,
    pub sort_by: SortBy,
    pub sort_order: SortOrder,
}

impl Default for PackageFilter {
    fn default() -> Self {
        Self {
            platform_id: None,
            package_type: None,
            repository: None,
            search: None,
            limit: 50,
            offset: 0,
            sort_by: SortBy::default(),
            sort_order: SortOrder::default(),
        }
    }
}

impl PackageFilter {
    pub fn effective_limit(&self) -> u32 {
        self.limit.clamp(1, MAX_PAGE_LIMIT)
    }

    /// Lowercased, trimmed search term; `None` when empty.
    pub fn search_term(&self) -> Option<String> {
        self.search
            .as_deref()
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty())
    }

    pub fn matches(&self, package: &StoredPackage) -> bool {
        if !package.is_active {
            return false;
        }
        if self.platform_id.is_some_and(|p| p != package.platform_id) {
            return false;
        }
        if self.package_type.is_some_and(|t| t != package.package_type) {
            return false;
        }
        if self.repository.is_some_and(|r| r != package.repository) {
            return false;
        }
        match self.search_term() {
            Some(term) => {
                package.name.to_lowercase().contains(&term)
                    || package.description.to_lowercase().contains(&term)
            }
            None => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackagePage {
    pub packages: Vec<StoredPackage>,
    pub total: u64,
}
