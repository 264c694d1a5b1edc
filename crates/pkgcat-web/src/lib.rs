//! JSON read API over the catalog plus sync control and live status.

use std::str::FromStr;
use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    routing::get,
    Json, Router,
};
use pkgcat_core::{
    PackageFilter, ParseEnumError, Platform, SortBy, SortOrder, SourceId, StoredPackage, SyncStatus,
};
use pkgcat_storage::CatalogStore;
use pkgcat_sync::SyncOrchestrator;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_stream::wrappers::WatchStream;
use tokio_stream::{Stream, StreamExt};
use tracing::info;

pub mod error;

pub use error::ApiError;

pub const CRATE_NAME: &str = "pkgcat-web";

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn CatalogStore>,
    pub orchestrator: Arc<SyncOrchestrator>,
}

impl AppState {
    pub fn new(store: Arc<dyn CatalogStore>, orchestrator: Arc<SyncOrchestrator>) -> Self {
        Self { store, orchestrator }
    }
}

/// Raw query string; enum values are validated here so bad input gets a 400 with a reason.
#[derive(Debug, Default, Deserialize)]
pub struct PackagesQuery {
    pub platform: Option<String>,
    #[serde(rename = "type")]
    pub package_type: Option<String>,
    pub repository: Option<String>,
    pub search: Option<String>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
    pub sort_by: Option<String>,
    pub sort_order: Option<String>,
}

fn parse_param<T>(value: Option<&str>) -> Result<Option<T>, ApiError>
where
    T: FromStr<Err = ParseEnumError>,
{
    match value.map(str::trim).filter(|v| !v.is_empty()) {
        Some(v) => v.parse().map(Some).map_err(|e: ParseEnumError| ApiError::BadRequest(e.to_string())),
        None => Ok(None),
    }
}

fn parse_sort_by(value: Option<&str>) -> Result<SortBy, ApiError> {
    match value.map(str::trim).unwrap_or("") {
        "" | "name" => Ok(SortBy::Name),
        "popularity" | "popularity_score" => Ok(SortBy::Popularity),
        "updated_at" => Ok(SortBy::UpdatedAt),
        other => Err(ApiError::BadRequest(format!("unknown sort_by value: {other:?}"))),
    }
}

fn parse_sort_order(value: Option<&str>) -> Result<SortOrder, ApiError> {
    match value.map(|v| v.trim().to_ascii_lowercase()).as_deref() {
        None | Some("") | Some("asc") => Ok(SortOrder::Asc),
        Some("desc") => Ok(SortOrder::Desc),
        Some(other) => Err(ApiError::BadRequest(format!("unknown sort_order value: {other:?}"))),
    }
}

impl PackagesQuery {
    pub fn into_filter(self) -> Result<PackageFilter, ApiError> {
        let defaults = PackageFilter::default();
        Ok(PackageFilter {
            platform_id: parse_param(self.platform.as_deref())?,
            package_type: parse_param(self.package_type.as_deref())?,
            repository: parse_param(self.repository.as_deref())?,
            search: self.search,
            limit: self.limit.unwrap_or(defaults.limit),
            offset: self.offset.unwrap_or(0),
            sort_by: parse_sort_by(self.sort_by.as_deref())?,
            sort_order: parse_sort_order(self.sort_order.as_deref())?,
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PackagesResponse {
    pub packages: Vec<StoredPackage>,
    pub total: u64,
    pub limit: u32,
    pub offset: u32,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SourceStatusView {
    pub source: SourceId,
    pub display_name: String,
    #[serde(flatten)]
    pub status: SyncStatus,
}

impl SourceStatusView {
    fn new(source: SourceId, status: SyncStatus) -> Self {
        Self {
            source,
            display_name: source.display_name().to_string(),
            status,
        }
    }
}

fn parse_source(raw: &str) -> Result<SourceId, ApiError> {
    raw.parse().map_err(|e: ParseEnumError| ApiError::NotFound(e.to_string()))
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/api/platforms", get(platforms_handler))
        .route("/api/packages", get(packages_handler))
        .route("/api/sync", get(sync_statuses_handler))
        .route("/api/sync/{source}", get(sync_status_handler).post(sync_trigger_handler))
        .route("/api/sync/{source}/events", get(sync_events_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("binding port {port}"))?;
    info!(port, "pkgcat web listening");
    axum::serve(listener, app(state)).await.context("serving http")?;
    Ok(())
}

async fn healthz_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn platforms_handler(State(state): State<Arc<AppState>>) -> Result<Json<Vec<Platform>>, ApiError> {
    Ok(Json(state.store.list_platforms().await?))
}

async fn packages_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PackagesQuery>,
) -> Result<Json<PackagesResponse>, ApiError> {
    let filter = query.into_filter()?;
    let page = state.store.list_packages(&filter).await?;
    Ok(Json(PackagesResponse {
        packages: page.packages,
        total: page.total,
        limit: filter.effective_limit(),
        offset: filter.offset,
    }))
}

async fn sync_statuses_handler(State(state): State<Arc<AppState>>) -> Json<Vec<SourceStatusView>> {
    Json(
        state
            .orchestrator
            .statuses()
            .into_iter()
            .map(|(source, status)| SourceStatusView::new(source, status))
            .collect(),
    )
}

async fn sync_status_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(source): AxumPath<String>,
) -> Result<Json<SourceStatusView>, ApiError> {
    let source = parse_source(&source)?;
    let status = state.orchestrator.status(source)?;
    Ok(Json(SourceStatusView::new(source, status)))
}

async fn sync_trigger_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(source): AxumPath<String>,
) -> Result<(StatusCode, Json<SourceStatusView>), ApiError> {
    let source = parse_source(&source)?;
    state.orchestrator.trigger(source)?;
    info!(%source, "sync triggered over http");
    let status = state.orchestrator.status(source)?;
    Ok((StatusCode::ACCEPTED, Json(SourceStatusView::new(source, status))))
}

async fn sync_events_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(source): AxumPath<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, ApiError> {
    let source = parse_source(&source)?;
    let rx = state.orchestrator.subscribe(source)?;
    let events = WatchStream::new(rx).map(|status| Event::default().event("status").json_data(status));
    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{header, Request};
    use http_body_util::BodyExt;
    use pkgcat_adapters::{AdapterError, ProgressSink, SourceAdapter};
    use pkgcat_core::{PackageType, PlatformId, RawPackageRecord, Repository, SyncState};
    use pkgcat_storage::MemoryCatalogStore;
    use pkgcat_sync::DEFAULT_BATCH_SIZE;
    use tokio::sync::Notify;
    use tower::ServiceExt;

    use super::*;

    struct GatedAdapter {
        gate: Arc<Notify>,
        fetches: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl SourceAdapter for GatedAdapter {
        fn source_id(&self) -> SourceId {
            SourceId::Debian
        }

        async fn fetch_all(&self, _progress: &ProgressSink) -> Result<Vec<RawPackageRecord>, AdapterError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            self.gate.notified().await;
            Ok(Vec::new())
        }
    }

    struct Fixture {
        app: Router,
        orchestrator: Arc<SyncOrchestrator>,
        gate: Arc<Notify>,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(MemoryCatalogStore::new());
        for platform in [PlatformId::Debian, PlatformId::Macos] {
            store.ensure_platform(&platform.into()).await.unwrap();
        }
        let mut firefox = RawPackageRecord::new("firefox", "128.0", PlatformId::Debian);
        firefox.package_type = PackageType::Gui;
        firefox.popularity_score = 90;
        firefox.description = "Mozilla web browser".into();
        let mut vim = RawPackageRecord::new("vim", "9.1", PlatformId::Debian);
        vim.popularity_score = 70;
        let mut wget = RawPackageRecord::new("wget", "1.24", PlatformId::Macos);
        wget.repository = Repository::ThirdParty;
        for record in [firefox, vim, wget] {
            store.insert_package(&record).await.unwrap();
        }

        let gate = Arc::new(Notify::new());
        let adapter: Box<dyn SourceAdapter> = Box::new(GatedAdapter {
            gate: Arc::clone(&gate),
            fetches: Arc::new(AtomicUsize::new(0)),
        });
        let orchestrator = Arc::new(SyncOrchestrator::new(store.clone(), vec![adapter], DEFAULT_BATCH_SIZE));
        Fixture {
            app: app(AppState::new(store, Arc::clone(&orchestrator))),
            orchestrator,
            gate,
        }
    }

    fn get_req(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn post_req(uri: &str) -> Request<Body> {
        Request::builder().method("POST").uri(uri).body(Body::empty()).unwrap()
    }

    async fn json_body<T: serde::de::DeserializeOwned>(resp: axum::response::Response) -> T {
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn healthz_is_ok() {
        let fx = fixture().await;
        let resp = fx.app.oneshot(get_req("/healthz")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn packages_filter_sort_and_page() {
        let fx = fixture().await;
        let resp = fx
            .app
            .clone()
            .oneshot(get_req("/api/packages?platform=debian&sort_by=popularity&sort_order=desc&limit=1"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let page: PackagesResponse = json_body(resp).await;
        assert_eq!(page.total, 2);
        assert_eq!(page.packages.len(), 1);
        assert_eq!(page.packages[0].name, "firefox");

        let resp = fx
            .app
            .clone()
            .oneshot(get_req("/api/packages?search=BROWSER&type=gui"))
            .await
            .unwrap();
        let page: PackagesResponse = json_body(resp).await;
        assert_eq!(page.total, 1);

        let resp = fx
            .app
            .oneshot(get_req("/api/packages?repository=third-party&limit=500"))
            .await
            .unwrap();
        let page: PackagesResponse = json_body(resp).await;
        assert_eq!(page.limit, 100);
        assert_eq!(page.packages[0].name, "wget");
    }

    #[tokio::test]
    async fn bad_filter_values_are_rejected() {
        let fx = fixture().await;
        let resp = fx
            .app
            .clone()
            .oneshot(get_req("/api/packages?platform=solaris"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body: serde_json::Value = json_body(resp).await;
        assert!(body["error"].as_str().unwrap().contains("solaris"));

        let resp = fx.app.oneshot(get_req("/api/packages?sort_by=size")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn platforms_lists_registered_rows() {
        let fx = fixture().await;
        let resp = fx.app.oneshot(get_req("/api/platforms")).await.unwrap();
        let platforms: Vec<Platform> = json_body(resp).await;
        assert_eq!(platforms.len(), 2);
    }

    #[tokio::test]
    async fn trigger_accepts_once_then_conflicts() {
        let fx = fixture().await;
        let first = fx.app.clone().oneshot(post_req("/api/sync/debian")).await.unwrap();
        assert_eq!(first.status(), StatusCode::ACCEPTED);
        let view: SourceStatusView = json_body(first).await;
        assert_eq!(view.status.state, SyncState::Running);

        let second = fx.app.clone().oneshot(post_req("/api/sync/debian")).await.unwrap();
        assert_eq!(second.status(), StatusCode::CONFLICT);

        let mut rx = fx.orchestrator.subscribe(SourceId::Debian).unwrap();
        fx.gate.notify_one();
        rx.wait_for(|s| s.state == SyncState::Complete).await.unwrap();

        let status = fx.app.oneshot(get_req("/api/sync/debian")).await.unwrap();
        let view: SourceStatusView = json_body(status).await;
        assert_eq!(view.status.state, SyncState::Complete);
    }

    #[tokio::test]
    async fn unknown_or_unconfigured_sources_are_not_found() {
        let fx = fixture().await;
        let resp = fx.app.clone().oneshot(post_req("/api/sync/gentoo")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let resp = fx.app.clone().oneshot(post_req("/api/sync/winget")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = fx.app.oneshot(get_req("/api/sync")).await.unwrap();
        let views: Vec<SourceStatusView> = json_body(resp).await;
        assert_eq!(views.len(), 1);
        assert_eq!(views[0].source, SourceId::Debian);
    }

    #[tokio::test]
    async fn events_stream_starts_with_current_status() {
        let fx = fixture().await;
        let resp = fx.app.oneshot(get_req("/api/sync/debian/events")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers()[header::CONTENT_TYPE].to_str().unwrap(),
            "text/event-stream"
        );
        let mut body = resp.into_body();
        let frame = body.frame().await.unwrap().unwrap();
        let text = String::from_utf8(frame.into_data().unwrap().to_vec()).unwrap();
        assert!(text.contains("event: status"));
        assert!(text.contains("\"state\":\"idle\""));
    }
}
