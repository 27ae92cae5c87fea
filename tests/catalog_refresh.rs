mod support;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use portico::catalog::SchemaService;
use portico::config::Settings;
use serde_json::Value;

use support::{fixture_root_schema, test_settings};

const SCHEMA_ETAG: &str = "\"schema-v1\"";
const DOCS_ETAG: &str = "\"docs-v1\"";

#[derive(Clone)]
struct MockUpstream {
    root_schema: Arc<Value>,
    schema_hits: Arc<AtomicUsize>,
    docs_hits: Arc<AtomicUsize>,
    respond_slowly: bool,
}

impl MockUpstream {
    fn new(root_schema: Value, respond_slowly: bool) -> Self {
        Self {
            root_schema: Arc::new(root_schema),
            schema_hits: Arc::new(AtomicUsize::new(0)),
            docs_hits: Arc::new(AtomicUsize::new(0)),
            respond_slowly,
        }
    }
}

async fn schema_endpoint(State(state): State<MockUpstream>, headers: HeaderMap) -> Response {
    state.schema_hits.fetch_add(1, Ordering::SeqCst);
    if state.respond_slowly {
        tokio::time::sleep(std::time::Duration::from_millis(150)).await;
    }
    if headers
        .get(header::IF_NONE_MATCH)
        .and_then(|value| value.to_str().ok())
        == Some(SCHEMA_ETAG)
    {
        return StatusCode::NOT_MODIFIED.into_response();
    }
    (
        [(header::ETAG, SCHEMA_ETAG)],
        axum::Json(state.root_schema.as_ref().clone()),
    )
        .into_response()
}

async fn docs_endpoint(State(state): State<MockUpstream>, headers: HeaderMap) -> Response {
    state.docs_hits.fetch_add(1, Ordering::SeqCst);
    if headers
        .get(header::IF_NONE_MATCH)
        .and_then(|value| value.to_str().ok())
        == Some(DOCS_ETAG)
    {
        return StatusCode::NOT_MODIFIED.into_response();
    }
    (
        [(header::ETAG, DOCS_ETAG)],
        Html(
            "<html><head><script>ignore()</script><style>p{}</style></head>\
             <body><h1>Platform API</h1><p>Apps and   releases reference.</p></body></html>",
        ),
    )
        .into_response()
}

async fn spawn_mock(state: MockUpstream) -> (String, tokio::task::JoinHandle<()>) {
    let app = Router::new()
        .route("/schema", get(schema_endpoint))
        .route("/docs", get(docs_endpoint))
        .with_state(state);
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0))
        .await
        .expect("bind mock upstream");
    let addr = listener.local_addr().expect("mock addr");
    let handle = tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (format!("http://{addr}"), handle)
}

fn settings_against(base: &str, temp: &tempfile::TempDir) -> Settings {
    let mut settings = test_settings(temp);
    settings.schema_url = format!("{base}/schema");
    settings.docs_url = format!("{base}/docs");
    settings
}

fn service(settings: Settings) -> SchemaService {
    SchemaService::new(Arc::new(settings), reqwest::Client::new())
}

#[tokio::test]
async fn forced_refresh_publishes_catalog_and_persists_cache() {
    let mock = MockUpstream::new(fixture_root_schema(), false);
    let (base, handle) = spawn_mock(mock.clone()).await;
    let temp = tempfile::tempdir().expect("tempdir");
    let settings = settings_against(&base, &temp);
    let cache_path = settings.catalog_cache_path.clone();
    let catalog = service(settings);

    catalog.refresh(true).await.expect("refresh succeeds");

    let operations = catalog.operations().await;
    assert_eq!(operations.len(), 5);
    assert!(
        catalog
            .operation_by_id("GET /apps/{app_identity}")
            .await
            .is_some()
    );
    assert!(catalog.root_schema().await.is_some());

    let docs = catalog.docs_context().await.expect("docs context present");
    assert!(docs.contains("Platform API"));
    assert!(!docs.contains("<"));
    assert!(!docs.contains("ignore()"));

    // Cache file landed with version 1 and the upstream validators.
    let raw = std::fs::read_to_string(&cache_path).expect("cache file written");
    let parsed: Value = serde_json::from_str(&raw).expect("cache file is JSON");
    assert_eq!(parsed["version"], 1);
    assert_eq!(parsed["schema_etag"], SCHEMA_ETAG);
    assert_eq!(parsed["operations"].as_array().expect("ops").len(), 5);

    handle.abort();
}

#[tokio::test]
async fn conditional_refresh_keeps_catalog_on_304() {
    let mock = MockUpstream::new(fixture_root_schema(), false);
    let (base, handle) = spawn_mock(mock.clone()).await;
    let temp = tempfile::tempdir().expect("tempdir");
    let catalog = service(settings_against(&base, &temp));

    catalog.refresh(true).await.expect("first refresh");
    assert_eq!(mock.schema_hits.load(Ordering::SeqCst), 1);

    catalog.refresh(false).await.expect("second refresh");
    assert_eq!(mock.schema_hits.load(Ordering::SeqCst), 2);
    assert_eq!(catalog.operations().await.len(), 5);

    handle.abort();
}

#[tokio::test]
async fn stale_304_with_empty_catalog_forces_a_refetch() {
    let mock = MockUpstream::new(fixture_root_schema(), false);
    let (base, handle) = spawn_mock(mock.clone()).await;
    let temp = tempfile::tempdir().expect("tempdir");

    // Seed a cache file that carries the ETag but no operations, so the
    // first conditional request comes back 304 against an empty catalog.
    let settings = settings_against(&base, &temp);
    std::fs::write(
        &settings.catalog_cache_path,
        serde_json::json!({
            "version": 1,
            "cached_at": "2026-01-01T00:00:00Z",
            "schema_etag": SCHEMA_ETAG,
            "operations": [],
            "root_schema": {"definitions": {}},
            "docs_context": ""
        })
        .to_string(),
    )
    .expect("seed cache file");

    let catalog = service(settings);
    catalog.cold_boot().await;
    assert!(catalog.operations().await.is_empty());

    catalog.refresh(false).await.expect("refresh succeeds");
    // One conditional request answered 304, then one unconditional.
    assert_eq!(mock.schema_hits.load(Ordering::SeqCst), 2);
    assert_eq!(catalog.operations().await.len(), 5);

    handle.abort();
}

#[tokio::test]
async fn cold_boot_restores_catalog_without_network() {
    let mock = MockUpstream::new(fixture_root_schema(), false);
    let (base, handle) = spawn_mock(mock.clone()).await;
    let temp = tempfile::tempdir().expect("tempdir");

    let settings = settings_against(&base, &temp);
    let first = service(settings.clone());
    first.refresh(true).await.expect("seed refresh");
    handle.abort();

    // Point the second service at a dead endpoint; the cache carries it.
    let mut offline = settings;
    offline.schema_url = "http://127.0.0.1:9/schema".to_string();
    offline.docs_url = "http://127.0.0.1:9/docs".to_string();
    let second = service(offline);
    second.cold_boot().await;

    assert_eq!(second.operations().await.len(), 5);
    second.ensure_ready().await.expect("already ready");
    assert!(
        second
            .docs_context()
            .await
            .expect("docs restored")
            .contains("Platform API")
    );
}

#[tokio::test]
async fn corrupt_cache_file_is_discarded() {
    let temp = tempfile::tempdir().expect("tempdir");
    let settings = test_settings(&temp);
    std::fs::write(&settings.catalog_cache_path, "{definitely not json")
        .expect("write corrupt cache");

    let catalog = service(settings);
    catalog.cold_boot().await;
    assert!(catalog.operations().await.is_empty());
}

#[tokio::test]
async fn concurrent_refreshes_are_single_flight() {
    let mock = MockUpstream::new(fixture_root_schema(), true);
    let (base, handle) = spawn_mock(mock.clone()).await;
    let temp = tempfile::tempdir().expect("tempdir");
    let catalog = service(settings_against(&base, &temp));

    // Both futures start before either completes, so the second must join
    // the first's in-flight refresh instead of fetching again.
    let (first, second) = tokio::join!(catalog.refresh(true), catalog.refresh(true));
    first.expect("refresh");
    second.expect("refresh");

    assert_eq!(mock.schema_hits.load(Ordering::SeqCst), 1);
    assert_eq!(catalog.operations().await.len(), 5);

    handle.abort();
}

#[tokio::test]
async fn search_index_follows_the_published_catalog() {
    let mock = MockUpstream::new(fixture_root_schema(), false);
    let (base, handle) = spawn_mock(mock.clone()).await;
    let temp = tempfile::tempdir().expect("tempdir");
    let catalog = service(settings_against(&base, &temp));

    assert!(catalog.search_index().await.is_empty());
    catalog.refresh(true).await.expect("refresh");

    let index = catalog.search_index().await;
    assert_eq!(index.len(), 5);
    let hits = index.search("list apps", None, &[]);
    assert_eq!(hits[0].operation_id, "GET /apps");

    handle.abort();
}
