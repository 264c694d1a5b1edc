use pkgcat_core::{Platform, PlatformId};
use pkgcat_storage::{CatalogStore, StoreError};
use tracing::debug;

/// Platforms the catalog must know about before any package row is written.
#[derive(Debug, Clone)]
pub struct PlatformRegistry {
    platforms: Vec<Platform>,
}

impl Default for PlatformRegistry {
    fn default() -> Self {
        Self::new(PlatformId::ALL.iter().copied().map(Platform::from).collect())
    }
}

impl PlatformRegistry {
    pub fn new(platforms: Vec<Platform>) -> Self {
        Self { platforms }
    }

    /// Idempotent; safe to call at the start of every sync.
    pub async fn ensure_all(&self, store: &dyn CatalogStore) -> Result<(), StoreError> {
        for platform in &self.platforms {
            store.ensure_platform(platform).await?;
        }
        debug!(platforms = self.platforms.len(), "platforms ensured");
        Ok(())
    }
}
