//! In-process catalog used by tests and dry runs.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::Utc;
use pkgcat_core::{
    EnumField, PackageFilter, PackagePage, PackageType, PackageUpdate, Platform, PlatformId,
    RawPackageRecord, Repository, SortBy, SortOrder, StoredPackage,
};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::catalog::{CatalogStore, StoreError};

#[derive(Debug, Default)]
struct MemoryState {
    platforms: BTreeMap<PlatformId, Platform>,
    packages: HashMap<Uuid, StoredPackage>,
    by_key: HashMap<(String, PlatformId), Uuid>,
}

#[derive(Debug)]
pub struct MemoryCatalogStore {
    allowed_repositories: Vec<Repository>,
    state: RwLock<MemoryState>,
}

impl Default for MemoryCatalogStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCatalogStore {
    pub fn new() -> Self {
        Self::with_repositories(Repository::ALL)
    }

    /// Store whose repository "schema" only permits the given values.
    pub fn with_repositories(allowed: &[Repository]) -> Self {
        Self {
            allowed_repositories: allowed.to_vec(),
            state: RwLock::new(MemoryState::default()),
        }
    }

    pub async fn package_count(&self) -> usize {
        self.state.read().await.packages.len()
    }

    pub async fn all_packages(&self) -> Vec<StoredPackage> {
        let mut packages: Vec<_> = self.state.read().await.packages.values().cloned().collect();
        packages.sort_by(|a, b| (a.platform_id, &a.name).cmp(&(b.platform_id, &b.name)));
        packages
    }

    fn check_repository(&self, repository: Repository) -> Result<(), StoreError> {
        if self.allowed_repositories.contains(&repository) {
            Ok(())
        } else {
            Err(StoreError::ConstraintViolation {
                field: EnumField::Repository,
                value: repository.to_string(),
            })
        }
    }
}

#[async_trait]
impl CatalogStore for MemoryCatalogStore {
    async fn find_package(
        &self,
        name: &str,
        platform_id: PlatformId,
    ) -> Result<Option<StoredPackage>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .by_key
            .get(&(name.to_string(), platform_id))
            .and_then(|id| state.packages.get(id))
            .cloned())
    }

    async fn insert_package(&self, record: &RawPackageRecord) -> Result<StoredPackage, StoreError> {
        self.check_repository(record.repository)?;
        let mut state = self.state.write().await;
        if !state.platforms.contains_key(&record.platform_id) {
            return Err(StoreError::UnknownPlatform(record.platform_id));
        }
        let key = (record.name.clone(), record.platform_id);
        if state.by_key.contains_key(&key) {
            return Err(StoreError::DuplicateKey {
                name: record.name.clone(),
                platform: record.platform_id,
            });
        }

        let now = Utc::now();
        let stored = StoredPackage {
            id: Uuid::new_v4(),
            name: record.name.clone(),
            version: record.version.clone(),
            description: record.description.clone(),
            platform_id: record.platform_id,
            repository: record.repository,
            package_type: record.package_type,
            popularity_score: record.popularity_score.min(100),
            license: record.license.clone(),
            homepage: record.homepage.clone(),
            is_active: true,
            created_at: now,
            updated_at: now,
            last_seen_at: Some(now),
        };
        state.by_key.insert(key, stored.id);
        state.packages.insert(stored.id, stored.clone());
        Ok(stored)
    }

    async fn update_package(&self, id: Uuid, update: &PackageUpdate) -> Result<(), StoreError> {
        self.check_repository(update.repository)?;
        let mut state = self.state.write().await;
        let package = state.packages.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        let now = Utc::now();
        package.version = update.version.clone();
        package.description = update.description.clone();
        package.repository = update.repository;
        package.package_type = update.package_type;
        package.popularity_score = update.popularity_score.min(100);
        package.license = update.license.clone();
        package.homepage = update.homepage.clone();
        package.updated_at = now;
        if update.mark_seen {
            package.last_seen_at = Some(now);
            package.is_active = true;
        }
        Ok(())
    }

    async fn touch_package(&self, id: Uuid) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        let package = state.packages.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        package.last_seen_at = Some(Utc::now());
        package.is_active = true;
        Ok(())
    }

    async fn ensure_platform(&self, platform: &Platform) -> Result<(), StoreError> {
        self.state
            .write()
            .await
            .platforms
            .insert(platform.id, platform.clone());
        Ok(())
    }

    async fn supports_enum_value(&self, field: EnumField, value: &str) -> Result<bool, StoreError> {
        Ok(match field {
            EnumField::Repository => value
                .parse::<Repository>()
                .map(|r| self.allowed_repositories.contains(&r))
                .unwrap_or(false),
            EnumField::PackageType => value.parse::<PackageType>().is_ok(),
        })
    }

    async fn list_packages(&self, filter: &PackageFilter) -> Result<PackagePage, StoreError> {
        let state = self.state.read().await;
        let mut matched: Vec<&StoredPackage> =
            state.packages.values().filter(|p| filter.matches(p)).collect();

        matched.sort_by(|a, b| {
            let primary = match filter.sort_by {
                SortBy::Name => a.name.cmp(&b.name),
                SortBy::Popularity => a.popularity_score.cmp(&b.popularity_score),
                SortBy::UpdatedAt => a.updated_at.cmp(&b.updated_at),
            };
            let primary = match filter.sort_order {
                SortOrder::Asc => primary,
                SortOrder::Desc => primary.reverse(),
            };
            primary
                .then_with(|| a.name.cmp(&b.name))
                .then_with(|| a.platform_id.cmp(&b.platform_id))
        });

        let total = matched.len() as u64;
        let packages = matched
            .into_iter()
            .skip(filter.offset as usize)
            .take(filter.effective_limit() as usize)
            .cloned()
            .collect();
        Ok(PackagePage { packages, total })
    }

    async fn list_platforms(&self) -> Result<Vec<Platform>, StoreError> {
        Ok(self.state.read().await.platforms.values().cloned().collect())
    }
}
