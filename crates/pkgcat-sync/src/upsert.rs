//! Reconciles fetched records against the catalog, keyed on `(name, platform_id)`.

use std::sync::Arc;

use pkgcat_adapters::ProgressSink;
use pkgcat_core::{PackageUpdate, PlatformId, ProgressEvent, RawPackageRecord, UpsertCounts};
use pkgcat_storage::{CatalogStore, StoreError};
use tracing::{info, warn};

pub const DEFAULT_BATCH_SIZE: usize = 100;

const PROGRESS_INTERVAL: usize = 100;

/// What happens to a stored package whose version did not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipPolicy {
    Untouched,
    TouchLastSeen,
}

impl SkipPolicy {
    pub fn for_liveness(tracks_liveness: bool) -> Self {
        if tracks_liveness {
            SkipPolicy::TouchLastSeen
        } else {
            SkipPolicy::Untouched
        }
    }
}

enum Outcome {
    Inserted,
    Updated,
    Skipped,
}

pub struct CatalogUpserter {
    store: Arc<dyn CatalogStore>,
    batch_size: usize,
}

impl CatalogUpserter {
    pub fn new(store: Arc<dyn CatalogStore>, batch_size: usize) -> Self {
        Self {
            store,
            batch_size: batch_size.max(1),
        }
    }

    /// Schema violations and database failures abort the run; everything already
    /// written stays written.
    pub async fn upsert(
        &self,
        platform_id: PlatformId,
        records: &[RawPackageRecord],
        policy: SkipPolicy,
        progress: &ProgressSink,
    ) -> Result<UpsertCounts, StoreError> {
        let total = records.len();
        let mut counts = UpsertCounts::default();
        let mut processed = 0;

        for batch in records.chunks(self.batch_size) {
            for record in batch {
                processed += 1;
                if record.platform_id != platform_id {
                    warn!(
                        package = %record.name,
                        platform = %record.platform_id,
                        expected = %platform_id,
                        "record for another platform dropped"
                    );
                    counts.skipped += 1;
                } else {
                    match self.upsert_one(record, policy).await {
                        Ok(Outcome::Inserted) => counts.inserted += 1,
                        Ok(Outcome::Updated) => counts.updated += 1,
                        Ok(Outcome::Skipped) => counts.skipped += 1,
                        Err(err @ (StoreError::DuplicateKey { .. } | StoreError::NotFound(_))) => {
                            warn!(package = %record.name, error = %err, "concurrent catalog change; record skipped");
                            counts.skipped += 1;
                        }
                        Err(err) => return Err(err),
                    }
                }

                if processed % PROGRESS_INTERVAL == 0 {
                    progress.emit(ProgressEvent::Store {
                        processed,
                        total,
                        counts,
                    });
                }
            }
        }

        if processed % PROGRESS_INTERVAL != 0 || total == 0 {
            progress.emit(ProgressEvent::Store {
                processed,
                total,
                counts,
            });
        }
        info!(
            platform = %platform_id,
            inserted = counts.inserted,
            updated = counts.updated,
            skipped = counts.skipped,
            batch_size = self.batch_size,
            "upsert finished"
        );
        Ok(counts)
    }

    async fn upsert_one(&self, record: &RawPackageRecord, policy: SkipPolicy) -> Result<Outcome, StoreError> {
        let Some(existing) = self.store.find_package(&record.name, record.platform_id).await? else {
            self.store.insert_package(record).await?;
            return Ok(Outcome::Inserted);
        };

        let mark_seen = policy == SkipPolicy::TouchLastSeen;
        if existing.version != record.version {
            self.store
                .update_package(existing.id, &PackageUpdate::from_record(record, mark_seen))
                .await?;
            return Ok(Outcome::Updated);
        }
        if mark_seen {
            self.store.touch_package(existing.id).await?;
        }
        Ok(Outcome::Skipped)
    }
}
