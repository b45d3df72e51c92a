use axum::{
    extract::{
        rejection::JsonRejection,
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, Path, Query, Request, State,
    },
    http::{HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use pulse_core::{Admission, Document, SearchService};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub mod seed;

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<SearchService>,
    pub admin_token: Option<String>,
}

/// JSON error body `{"error": "..."}` with a status code.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self { status, message: message.into() }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }
}

impl From<pulse_core::Error> for ApiError {
    fn from(e: pulse_core::Error) -> Self {
        match e {
            pulse_core::Error::DocumentNotFound(_) => Self::new(StatusCode::NOT_FOUND, e.to_string()),
            e if e.is_client_error() => Self::bad_request(e.to_string()),
            e => {
                tracing::error!(error = %e, "request failed");
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
            }
        }
    }
}

impl From<pulse_core::StoreError> for ApiError {
    fn from(e: pulse_core::StoreError) -> Self {
        pulse_core::Error::from(e).into()
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(serde_json::json!({ "error": self.message }))).into_response()
    }
}

/// CORS from `CORS_ALLOW_ORIGIN` (comma-separated), any origin by default.
fn cors_layer() -> CorsLayer {
    match std::env::var("CORS_ALLOW_ORIGIN") {
        Ok(val) => {
            let origins: Vec<_> = val
                .split(',')
                .filter_map(|s| s.trim().parse().ok())
                .collect();
            if origins.is_empty() {
                CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any)
            } else {
                CorsLayer::new().allow_origin(AllowOrigin::list(origins)).allow_methods(Any).allow_headers(Any)
            }
        }
        Err(_) => CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any),
    }
}

pub fn build_app(service: Arc<SearchService>, admin_token: Option<String>) -> Router {
    let state = AppState { service, admin_token };

    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/add", post(add_handler))
        .route("/search", get(search_handler))
        .route("/document/:id", get(document_handler))
        .route("/trending", get(trending_handler))
        .route("/typeahead", get(typeahead_ws))
        .route("/typeahead/terms", post(add_term_handler))
        .layer(middleware::from_fn_with_state(state.clone(), rate_limit))
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer())
        .with_state(state)
}

async fn rate_limit(
    State(state): State<AppState>,
    peer: Option<ConnectInfo<SocketAddr>>,
    req: Request,
    next: Next,
) -> Response {
    let client = peer
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string());
    match state.service.admit(&client).await {
        Admission::Allowed => next.run(req).await,
        Admission::Denied => ApiError::new(StatusCode::TOO_MANY_REQUESTS, "rate limit exceeded").into_response(),
        Admission::Unavailable => {
            ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "rate limiter failed").into_response()
        }
    }
}

#[derive(Serialize)]
pub struct AddResponse {
    pub id: String,
    pub status: &'static str,
}

async fn add_handler(
    State(state): State<AppState>,
    body: Result<Json<pulse_core::NewDocument>, JsonRejection>,
) -> Result<Json<AddResponse>, ApiError> {
    let Json(doc) = body?;
    let added = state.service.add_document(doc).await?;
    let status = if added.indexed_immediately { "indexed" } else { "pending" };
    Ok(Json(AddResponse { id: added.id.to_string(), status }))
}

#[derive(Deserialize)]
pub struct SearchParams {
    #[serde(default)]
    pub q: String,
    pub page: Option<String>,
}

#[derive(Serialize)]
pub struct SearchResponse {
    pub results: Vec<Document>,
}

async fn search_handler(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> Result<Json<SearchResponse>, ApiError> {
    if params.q.trim().is_empty() {
        return Err(ApiError::bad_request("query parameter q is required"));
    }
    // unparseable pages fall back to the first one
    let page = params.page.and_then(|p| p.trim().parse().ok()).unwrap_or(1);
    let results = state.service.search(&params.q, page).await?;
    Ok(Json(SearchResponse { results }))
}

async fn document_handler(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Document>, ApiError> {
    Ok(Json(state.service.get_document(&id).await?))
}

#[derive(Deserialize)]
pub struct TrendingParams {
    pub limit: Option<String>,
}

async fn trending_handler(
    State(state): State<AppState>,
    Query(params): Query<TrendingParams>,
) -> Result<impl IntoResponse, ApiError> {
    let limit = params
        .limit
        .and_then(|l| l.trim().parse::<usize>().ok())
        .filter(|&l| l > 0);
    Ok(Json(state.service.trending(limit).await?))
}

async fn typeahead_ws(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| typeahead_session(socket, state.service))
}

async fn typeahead_session(mut socket: WebSocket, service: Arc<SearchService>) {
    tracing::debug!("typeahead session opened");
    while let Some(msg) = socket.recv().await {
        let text = match msg {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                tracing::debug!(error = %e, "typeahead socket error");
                break;
            }
        };
        if let Some(reply) = service.respond_typeahead(&text).await {
            if socket.send(Message::Text(reply)).await.is_err() {
                break;
            }
        }
    }
    tracing::debug!("typeahead session closed");
}

#[derive(Deserialize)]
pub struct TermSeed {
    pub term: String,
    pub score: f64,
}

async fn add_term_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<TermSeed>, JsonRejection>,
) -> Result<Json<serde_json::Value>, ApiError> {
    authorize(&state, &headers)?;
    let Json(seed) = body?;
    if !state.service.add_term(&seed.term, seed.score).await? {
        return Err(ApiError::bad_request("term length out of bounds"));
    }
    Ok(Json(serde_json::json!({ "term": seed.term, "score": seed.score })))
}

fn authorize(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let required = match &state.admin_token {
        Some(t) => t,
        None => return Err(ApiError::new(StatusCode::UNAUTHORIZED, "ADMIN_TOKEN not set")),
    };
    let provided = headers.get("X-ADMIN-TOKEN").and_then(|v| v.to_str().ok()).unwrap_or("");
    if provided == required {
        Ok(())
    } else {
        Err(ApiError::new(StatusCode::UNAUTHORIZED, "invalid admin token"))
    }
}
