use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use pulse_core::config::RateLimitConfig;
use pulse_core::store::testing::{Fault, FaultyStore};
use pulse_core::{KvStore, MemoryStore, SearchService, ServiceConfig, SledDocumentStore, SystemClock, Tokenizer};
use serde_json::{json, Value};
use std::sync::Arc;
use tempfile::TempDir;
use tower::ServiceExt;

struct TestApp {
    app: Router,
    _dir: TempDir,
}

fn test_app_with(store: Arc<dyn KvStore>, config: ServiceConfig) -> TestApp {
    let dir = tempfile::tempdir().unwrap();
    let docs = SledDocumentStore::open(dir.path().join("docs")).unwrap();
    let service = SearchService::new(store, Arc::new(docs), Arc::new(SystemClock), Tokenizer::default(), config);
    let app = pulse_server::build_app(Arc::new(service), Some("sekrit".to_string()));
    TestApp { app, _dir: dir }
}

/// Limiter generous enough that tests never trip it by accident.
fn roomy() -> ServiceConfig {
    ServiceConfig {
        rate_limit: RateLimitConfig { capacity: 1000.0, ..RateLimitConfig::default() },
        ..ServiceConfig::default()
    }
}

fn test_app() -> TestApp {
    test_app_with(Arc::new(MemoryStore::new()), roomy())
}

async fn call(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
    let resp = app.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let body = resp.into_body().collect().await.unwrap().to_bytes();
    let json = serde_json::from_slice(&body).unwrap_or(Value::Null);
    (status, json)
}

fn get(uri: &str) -> Request<Body> {
    Request::get(uri).body(Body::empty()).unwrap()
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::post(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn add(app: &Router, title: &str, content: &str) -> String {
    let (status, json) = call(app, post_json("/add", json!({ "title": title, "content": content }))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "indexed");
    json["id"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn health_is_ok() {
    let t = test_app();
    let resp = t.app.clone().oneshot(get("/health")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = resp.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], b"ok");
}

#[tokio::test]
async fn search_returns_ranked_results() {
    let t = test_app();
    let heavy = add(&t.app, "Heavy", "rust rust rust systems").await;
    let light = add(&t.app, "Light", "learning rust").await;
    add(&t.app, "Other", "gardening tips").await;
    add(&t.app, "More", "cooking tips").await;

    let (status, json) = call(&t.app, get("/search?q=rust")).await;
    assert_eq!(status, StatusCode::OK);
    let results = json["results"].as_array().unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0]["id"], heavy.as_str());
    assert_eq!(results[1]["id"], light.as_str());
    assert_eq!(results[0]["title"], "Heavy");

    let (_, json) = call(&t.app, get("/search?q=rust&page=2")).await;
    assert!(json["results"].as_array().unwrap().is_empty());
    let (_, json) = call(&t.app, get("/search?q=rust&page=abc")).await;
    assert_eq!(json["results"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn search_past_the_last_addressable_page_is_empty() {
    let t = test_app();
    add(&t.app, "Deep", "rust all the way down").await;

    let (status, json) = call(&t.app, get("/search?q=rust&page=9223372036854775807")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(json["results"].as_array().unwrap().is_empty());
    let (status, json) = call(&t.app, get("/search?q=rust&page=-9223372036854775808")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["results"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn search_requires_a_query() {
    let t = test_app();
    let (status, json) = call(&t.app, get("/search")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(json["error"].is_string());
    let (status, _) = call(&t.app, get("/search?q=%20")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn add_validates_payload() {
    let t = test_app();
    let (status, json) = call(&t.app, post_json("/add", json!({ "title": "only a title" }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["error"], "missing fields: content");

    let req = Request::post("/add")
        .header("content-type", "application/json")
        .body(Body::from("{not json"))
        .unwrap();
    let (status, json) = call(&t.app, req).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(json["error"].is_string());
}

#[tokio::test]
async fn add_reports_pending_when_indexing_is_deferred() {
    let store = Arc::new(FaultyStore::new());
    let t = test_app_with(store.clone(), roomy());
    store.inject(Fault::Exec);
    let (status, json) = call(&t.app, post_json("/add", json!({ "title": "t", "content": "c" }))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "pending");
}

#[tokio::test]
async fn document_lookup_and_trending() {
    let t = test_app();
    let id = add(&t.app, "Viral", "everyone reads this").await;

    let (status, json) = call(&t.app, get(&format!("/document/{id}"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["title"], "Viral");
    assert_eq!(json["content"], "everyone reads this");
    call(&t.app, get(&format!("/document/{id}"))).await;

    let (status, json) = call(&t.app, get("/trending")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json, json!([{ "id": id, "title": "Viral", "views": 2 }]));

    let (_, json) = call(&t.app, get("/trending?limit=0")).await;
    assert_eq!(json.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn document_errors_map_to_status_codes() {
    let t = test_app();
    let (status, _) = call(&t.app, get("/document/nope")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let (status, json) = call(&t.app, get("/document/0123456789abcdef0123456789abcdef")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(json["error"].as_str().unwrap().contains("not found"));
}

#[tokio::test]
async fn admin_terms_require_token() {
    let t = test_app();
    let (status, _) = call(&t.app, post_json("/typeahead/terms", json!({ "term": "search", "score": 3.0 }))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let req = Request::post("/typeahead/terms")
        .header("content-type", "application/json")
        .header("X-ADMIN-TOKEN", "sekrit")
        .body(Body::from(json!({ "term": "search", "score": 3.0 }).to_string()))
        .unwrap();
    let (status, json) = call(&t.app, req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["term"], "search");

    let req = Request::post("/typeahead/terms")
        .header("content-type", "application/json")
        .header("X-ADMIN-TOKEN", "sekrit")
        .body(Body::from(json!({ "term": "ab", "score": 3.0 }).to_string()))
        .unwrap();
    let (status, _) = call(&t.app, req).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn rate_limit_rejects_excess_requests() {
    let config = ServiceConfig {
        rate_limit: RateLimitConfig { capacity: 2.0, refill_rate: 0.0, ..RateLimitConfig::default() },
        ..ServiceConfig::default()
    };
    let t = test_app_with(Arc::new(MemoryStore::new()), config);
    assert_eq!(call(&t.app, get("/trending")).await.0, StatusCode::OK);
    assert_eq!(call(&t.app, get("/trending")).await.0, StatusCode::OK);

    let (status, json) = call(&t.app, get("/trending")).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(json, json!({ "error": "rate limit exceeded" }));
}

#[tokio::test]
async fn rate_limiter_failure_is_a_server_error() {
    let store = Arc::new(FaultyStore::new());
    let t = test_app_with(store.clone(), roomy());
    store.inject(Fault::Eval);
    let (status, json) = call(&t.app, get("/health")).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(json, json!({ "error": "rate limiter failed" }));
}
