use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::response::Html;
use axum::{routing::get, Json, Router};
use pkgcat_adapters::aur::AurAdapter;
use pkgcat_adapters::{ProgressSink, SourceAdapter, SourceOptions};
use pkgcat_core::{EnumField, PlatformId, Repository};
use pkgcat_storage::{BackoffPolicy, HttpClientConfig, HttpFetcher};
use serde_json::json;
use tokio::net::TcpListener;

async fn spawn_server(router: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}")
}

fn adapter(base: String) -> AurAdapter {
    let http = HttpFetcher::new(HttpClientConfig {
        backoff: BackoffPolicy {
            max_retries: 0,
            ..Default::default()
        },
        ..Default::default()
    })
    .unwrap();
    AurAdapter::new(
        Arc::new(http),
        &SourceOptions {
            base_url: Some(base),
            request_delay: Some(Duration::from_millis(1)),
            ..Default::default()
        },
    )
}

fn listing_row(name: &str, version: &str, popularity: &str, description: &str) -> String {
    format!(
        "<tr><td><a href=\"/packages/{name}\">{name}</a></td><td>{version}</td><td>10</td>\
         <td>{popularity}</td><td>{description}</td><td>someone</td><td>2026-01-01</td></tr>"
    )
}

fn listing_page(rows: &[String]) -> String {
    format!(
        "<html><body><p>120 packages found. Page 1 of 3.</p>\
         <table class=\"results\"><thead><tr><th>Name</th></tr></thead><tbody>{}</tbody></table></body></html>",
        rows.concat()
    )
}

#[tokio::test]
async fn empty_rpc_falls_back_to_html_listing() {
    let router = Router::new()
        .route(
            "/rpc/",
            get(|| async {
                Json(json!({
                    "error": "Too many package results.",
                    "resultcount": 0,
                    "results": [],
                    "type": "error",
                    "version": 5
                }))
            }),
        )
        .route(
            "/packages",
            get(|Query(q): Query<HashMap<String, String>>| async move {
                let rows = match q.get("O").map(String::as_str) {
                    Some("0") => vec![
                        listing_row("paru", "2.0.4-1", "12.50", "Feature packed AUR helper"),
                        listing_row("yay", "12.3.5-1", "4.04", "Yet another yogurt"),
                    ],
                    Some("50") => vec![listing_row("pikaur", "1.29-1", "0.5", "AUR helper")],
                    _ => Vec::new(),
                };
                Html(listing_page(&rows))
            }),
        );
    let base = spawn_server(router).await;

    let records = adapter(base).fetch_all(&ProgressSink::disabled()).await.unwrap();
    let names: Vec<_> = records.iter().map(|r| r.name.as_str()).collect();
    assert_eq!(names, vec!["paru", "yay", "pikaur"]);
    assert!(records.iter().all(|r| r.repository == Repository::Aur));
    assert!(records.iter().all(|r| r.platform_id == PlatformId::Arch));
    assert_eq!(records[1].popularity_score, 40);
    assert_eq!(records[2].popularity_score, 5);
}

#[tokio::test]
async fn rpc_results_are_deduplicated_and_skip_html() {
    let html_hits = Arc::new(AtomicUsize::new(0));
    let router = Router::new()
        .route(
            "/rpc/",
            get(|Query(q): Query<HashMap<String, String>>| async move {
                let results = match q.get("arg").map(String::as_str) {
                    Some("y") | Some("a") => json!([{
                        "Name": "yay",
                        "Version": "12.3.5-1",
                        "Description": "Yet another yogurt",
                        "Popularity": 18.9
                    }]),
                    _ => json!([]),
                };
                Json(json!({"resultcount": results.as_array().map(Vec::len).unwrap_or(0), "results": results, "type": "search"}))
            }),
        )
        .route(
            "/packages",
            get(|State(hits): State<Arc<AtomicUsize>>| async move {
                hits.fetch_add(1, Ordering::SeqCst);
                Html(listing_page(&[]))
            }),
        )
        .with_state(Arc::clone(&html_hits));
    let base = spawn_server(router).await;

    let aur = adapter(base);
    assert_eq!(aur.required_enum_values(), &[(EnumField::Repository, "aur")]);
    let records = aur.fetch_all(&ProgressSink::disabled()).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].name, "yay");
    assert_eq!(html_hits.load(Ordering::SeqCst), 0);
}
