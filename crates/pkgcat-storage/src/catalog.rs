use async_trait::async_trait;
use pkgcat_core::{
    EnumField, PackageFilter, PackagePage, PackageUpdate, Platform, PlatformId, RawPackageRecord,
    StoredPackage,
};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{field} value {value:?} is not permitted by the catalog schema")]
    ConstraintViolation { field: EnumField, value: String },
    #[error("package {name:?} already exists on {platform}")]
    DuplicateKey { name: String, platform: PlatformId },
    #[error("platform {0} is not registered")]
    UnknownPlatform(PlatformId),
    #[error("package {0} not found")]
    NotFound(Uuid),
    #[error("corrupt catalog row: {0}")]
    Corrupt(String),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

impl StoreError {
    /// Structural failures that must abort a whole sync rather than one record.
    pub fn is_schema_violation(&self) -> bool {
        matches!(
            self,
            StoreError::ConstraintViolation { .. } | StoreError::UnknownPlatform(_)
        )
    }
}

/// Minimal write/read contract the ingestion core needs from the catalog.
#[async_trait]
pub trait CatalogStore: Send + Sync {
    async fn find_package(
        &self,
        name: &str,
        platform_id: PlatformId,
    ) -> Result<Option<StoredPackage>, StoreError>;

    async fn insert_package(&self, record: &RawPackageRecord) -> Result<StoredPackage, StoreError>;

    async fn update_package(&self, id: Uuid, update: &PackageUpdate) -> Result<(), StoreError>;

    /// Refresh the liveness marker of an otherwise unchanged package.
    async fn touch_package(&self, id: Uuid) -> Result<(), StoreError>;

    async fn ensure_platform(&self, platform: &Platform) -> Result<(), StoreError>;

    async fn supports_enum_value(&self, field: EnumField, value: &str) -> Result<bool, StoreError>;

    async fn list_packages(&self, filter: &PackageFilter) -> Result<PackagePage, StoreError>;

    async fn list_platforms(&self) -> Result<Vec<Platform>, StoreError>;
}
