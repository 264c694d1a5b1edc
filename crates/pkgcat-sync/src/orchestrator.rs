//! Per-source sync lifecycle: `idle -> running -> complete | error`.
//!
//! Each source owns one `SourceSync` with a single-flight flag and a watch
//! channel carrying its latest `SyncStatus`. A run that finds the flag set is
//! rejected, never queued.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use pkgcat_adapters::{adapter_for_source, AdapterError, ProgressSink, SourceAdapter};
use pkgcat_core::{EnumField, SourceId, SyncState, SyncStatus, UpsertCounts};
use pkgcat_storage::{CatalogStore, HttpFetcher, StoreError};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, info_span, warn, Instrument};

use crate::platforms::PlatformRegistry;
use crate::upsert::{CatalogUpserter, SkipPolicy};
use crate::{SourceRegistry, SyncConfig};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("sync for {0} is already in progress")]
    AlreadyInProgress(SourceId),
    #[error("source {0} is not configured")]
    UnknownSource(SourceId),
    #[error("catalog does not permit {field} {value:?}, which {source_id} requires")]
    UnsupportedEnumValue {
        source_id: SourceId,
        field: EnumField,
        value: String,
    },
    #[error(transparent)]
    Adapter(#[from] AdapterError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Releases the single-flight flag however the run ends.
struct RunGuard {
    sync: Arc<SourceSync>,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.sync.running.store(false, Ordering::Release);
    }
}

pub struct SourceSync {
    adapter: Box<dyn SourceAdapter>,
    store: Arc<dyn CatalogStore>,
    platforms: Arc<PlatformRegistry>,
    upserter: Arc<CatalogUpserter>,
    running: AtomicBool,
    status: watch::Sender<SyncStatus>,
}

impl SourceSync {
    pub fn new(
        adapter: Box<dyn SourceAdapter>,
        store: Arc<dyn CatalogStore>,
        platforms: Arc<PlatformRegistry>,
        upserter: Arc<CatalogUpserter>,
    ) -> Self {
        let (status, _) = watch::channel(SyncStatus::default());
        Self {
            adapter,
            store,
            platforms,
            upserter,
            running: AtomicBool::new(false),
            status,
        }
    }

    pub fn source_id(&self) -> SourceId {
        self.adapter.source_id()
    }

    pub fn status(&self) -> SyncStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.status.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn acquire(self: &Arc<Self>) -> Result<RunGuard, SyncError> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(SyncError::AlreadyInProgress(self.source_id()));
        }
        self.status.send_replace(SyncStatus::running(Utc::now()));
        Ok(RunGuard {
            sync: Arc::clone(self),
        })
    }

    /// Run inline and wait for the outcome.
    pub async fn run(self: &Arc<Self>) -> Result<UpsertCounts, SyncError> {
        let guard = self.acquire()?;
        self.execute(guard).await
    }

    /// Start a background run. Rejection happens before anything is spawned.
    pub fn trigger(self: &Arc<Self>) -> Result<(), SyncError> {
        let guard = self.acquire()?;
        let sync = Arc::clone(self);
        tokio::spawn(async move {
            // outcome is already recorded in the status channel
            let _ = sync.execute(guard).await;
        });
        Ok(())
    }

    async fn execute(&self, guard: RunGuard) -> Result<UpsertCounts, SyncError> {
        let source_id = self.source_id();
        let span = info_span!("sync", source = %source_id);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = ProgressSink::new(tx);
        let work = async move {
            let result = self.pipeline(&sink).await;
            drop(sink);
            result
        };
        let forward = async {
            while let Some(event) = rx.recv().await {
                self.status.send_modify(|status| status.apply(&event));
            }
        };
        let (result, ()) = async { tokio::join!(work, forward) }.instrument(span).await;

        let finished_at = Utc::now();
        match &result {
            Ok(counts) => {
                info!(
                    source = %source_id,
                    inserted = counts.inserted,
                    updated = counts.updated,
                    skipped = counts.skipped,
                    "sync complete"
                );
                self.status.send_modify(|status| {
                    status.state = SyncState::Complete;
                    status.error = None;
                    status.counts = Some(*counts);
                    status.finished_at = Some(finished_at);
                });
            }
            Err(err) => {
                error!(source = %source_id, error = %err, "sync failed");
                let message = err.to_string();
                self.status.send_modify(|status| {
                    status.state = SyncState::Error;
                    status.error = Some(message);
                    status.finished_at = Some(finished_at);
                });
            }
        }
        drop(guard);
        result
    }

    async fn pipeline(&self, progress: &ProgressSink) -> Result<UpsertCounts, SyncError> {
        let source_id = self.source_id();
        self.platforms.ensure_all(self.store.as_ref()).await?;

        for (field, value) in self.adapter.required_enum_values() {
            if !self.store.supports_enum_value(*field, value).await? {
                return Err(SyncError::UnsupportedEnumValue {
                    source_id,
                    field: *field,
                    value: value.to_string(),
                });
            }
        }

        let records = self.adapter.fetch_all(progress).await?;
        info!(records = records.len(), "fetch finished");

        let policy = SkipPolicy::for_liveness(self.adapter.tracks_liveness());
        let counts = self
            .upserter
            .upsert(self.adapter.platform_id(), &records, policy, progress)
            .await?;
        Ok(counts)
    }
}

/// Every configured source, keyed by id. Shared by the CLI, the web layer and the scheduler.
pub struct SyncOrchestrator {
    sources: BTreeMap<SourceId, Arc<SourceSync>>,
}

impl SyncOrchestrator {
    pub fn new(store: Arc<dyn CatalogStore>, adapters: Vec<Box<dyn SourceAdapter>>, batch_size: usize) -> Self {
        let platforms = Arc::new(PlatformRegistry::default());
        let upserter = Arc::new(CatalogUpserter::new(Arc::clone(&store), batch_size));
        let sources = adapters
            .into_iter()
            .map(|adapter| {
                let sync = SourceSync::new(
                    adapter,
                    Arc::clone(&store),
                    Arc::clone(&platforms),
                    Arc::clone(&upserter),
                );
                (sync.source_id(), Arc::new(sync))
            })
            .collect();
        Self { sources }
    }

    pub fn from_registry(
        config: &SyncConfig,
        registry: &SourceRegistry,
        store: Arc<dyn CatalogStore>,
    ) -> anyhow::Result<Self> {
        let http = Arc::new(HttpFetcher::new(config.http_client_config()).context("building HTTP client")?);
        let adapters = registry
            .enabled_sources()
            .into_iter()
            .map(|id| adapter_for_source(id, Arc::clone(&http), registry.options_for(id, config)))
            .collect();
        Ok(Self::new(store, adapters, config.batch_size))
    }

    pub fn sources(&self) -> Vec<SourceId> {
        self.sources.keys().copied().collect()
    }

    pub fn source(&self, id: SourceId) -> Result<&Arc<SourceSync>, SyncError> {
        self.sources.get(&id).ok_or(SyncError::UnknownSource(id))
    }

    pub fn trigger(&self, id: SourceId) -> Result<(), SyncError> {
        self.source(id)?.trigger()
    }

    pub async fn run(&self, id: SourceId) -> Result<UpsertCounts, SyncError> {
        self.source(id)?.run().await
    }

    pub fn status(&self, id: SourceId) -> Result<SyncStatus, SyncError> {
        Ok(self.source(id)?.status())
    }

    pub fn statuses(&self) -> BTreeMap<SourceId, SyncStatus> {
        self.sources
            .iter()
            .map(|(id, sync)| (*id, sync.status()))
            .collect()
    }

    pub fn subscribe(&self, id: SourceId) -> Result<watch::Receiver<SyncStatus>, SyncError> {
        Ok(self.source(id)?.subscribe())
    }

    /// Start every idle source; busy ones are logged and left alone.
    pub fn trigger_all(&self) -> Vec<SourceId> {
        let mut started = Vec::new();
        for (id, sync) in &self.sources {
            match sync.trigger() {
                Ok(()) => started.push(*id),
                Err(err) => warn!(source = %id, error = %err, "sync trigger rejected"),
            }
        }
        started
    }
}
