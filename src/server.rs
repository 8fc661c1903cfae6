//! Web server module for footfall.
//!
//! JSON API over the storage services. Storage calls block on SQLite file
//! locks, so every handler runs them on the blocking thread pool.

use axum::{
    Json, Router,
    extract::{Path, Query, State, rejection::JsonRejection},
    http::{HeaderValue, Method, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    trace::{DefaultMakeSpan, TraceLayer},
};

use crate::storage::query::{DEFAULT_HISTORY_LIMIT, DEFAULT_PAGE_LIMIT, DEFAULT_STATS_LATEST};
use crate::storage::{
    ErrorClass, EventFilter, EventIngestor, EventReader, NewSubscriber, RawEvent, SortOrder,
    StorageError, SubscribeOutcome, SubscriberQuery, SubscriberStore,
};

/// Sessions listed alongside a visitor.
const DEFAULT_SESSION_LIMIT: u32 = 20;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub ingestor: EventIngestor,
    pub reader: EventReader,
    pub subscribers: SubscriberStore,
}

// =============================================================================
// Errors
// =============================================================================

/// Handler error, rendered as `{"error": "..."}`.
#[derive(Debug)]
pub enum ApiError {
    Storage(StorageError),
    BadRequest(String),
    NotFound(String),
}

impl From<StorageError> for ApiError {
    fn from(err: StorageError) -> Self {
        Self::Storage(err)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::BadRequest(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            Self::Storage(err) => match err.class() {
                ErrorClass::Invalid => (StatusCode::BAD_REQUEST, err.to_string()),
                ErrorClass::Retryable => {
                    tracing::warn!(error = %err, "Storage busy, asking client to retry");
                    let body = Json(json!({ "error": err.to_string() }));
                    return (
                        StatusCode::SERVICE_UNAVAILABLE,
                        [(header::RETRY_AFTER, "1")],
                        body,
                    )
                        .into_response();
                }
                ErrorClass::Fatal => {
                    tracing::error!(error = %err, "Storage failure");
                    (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "internal server error".to_string(),
                    )
                }
            },
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

/// Run a blocking storage call off the async executor.
async fn blocking<T, F>(f: F) -> Result<T, ApiError>
where
    F: FnOnce() -> Result<T, StorageError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StorageError::Internal(format!("blocking task failed: {e}")))?
        .map_err(ApiError::from)
}

// =============================================================================
// Request / Response Types
// =============================================================================

/// Health check response.
#[derive(Serialize)]
struct HealthResponse {
    status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    db: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct HistoryParams {
    pub limit: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct VisitorParams {
    pub sessions: Option<u32>,
}

/// Query parameters for the event listing.
#[derive(Debug, Deserialize)]
pub struct EventsQueryParams {
    pub page: Option<u32>,
    pub limit: Option<u32>,
    pub page_url: Option<String>,
    pub event_type: Option<String>,
    pub visitor: Option<String>,
    pub order: Option<String>,
    pub range: Option<String>,
}

impl EventsQueryParams {
    fn filter(&self) -> EventFilter {
        EventFilter {
            visitor_token: non_empty(&self.visitor),
            event_type: non_empty(&self.event_type),
            page_url: non_empty(&self.page_url),
            since: parse_range(self.range.as_deref()),
            until: None,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct StatsParams {
    pub latest: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct SubscribersParams {
    pub page: Option<u32>,
    pub limit: Option<u32>,
    #[serde(alias = "active")]
    pub active_only: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct UnsubscribeRequest {
    pub email: Option<String>,
}

fn non_empty(s: &Option<String>) -> Option<String> {
    s.as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Parse sort order from string.
fn parse_sort_order(s: Option<&str>) -> SortOrder {
    s.and_then(|order| order.parse().ok()).unwrap_or_default()
}

/// Parse filtered time range from string.
/// Supports: 1h, 6h, 12h, 24h, 7d, 30d.
fn parse_range(range: Option<&str>) -> Option<chrono::DateTime<chrono::Utc>> {
    let now = chrono::Utc::now();
    match range? {
        "1h" => Some(now - chrono::Duration::hours(1)),
        "6h" => Some(now - chrono::Duration::hours(6)),
        "12h" => Some(now - chrono::Duration::hours(12)),
        "24h" => Some(now - chrono::Duration::hours(24)),
        "7d" => Some(now - chrono::Duration::days(7)),
        "30d" => Some(now - chrono::Duration::days(30)),
        _ => None,
    }
}

// =============================================================================
// Router
// =============================================================================

/// Create the Axum router with all routes.
pub fn create_router(state: AppState, cors_origins: &[String]) -> Router {
    let app_state = Arc::new(state);

    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/health", get(healthz_handler))
        .route("/readyz", get(readyz_handler))
        .route("/track", post(track_handler))
        .route("/visitors", get(events_handler))
        .route("/visitors/{token}", get(visitor_handler))
        .route("/visitors/{token}/history", get(history_handler))
        .route("/events", get(events_handler))
        .route("/events/count", get(count_handler))
        .route("/stats", get(stats_handler))
        .route("/subscribe", post(subscribe_handler))
        .route("/unsubscribe", post(unsubscribe_handler))
        .route("/subscribers", get(subscribers_handler))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::default().include_headers(true)),
        )
        .layer(cors_layer(cors_origins))
        .with_state(app_state)
}

/// CORS allow-list. A `"*"` entry allows any origin.
fn cors_layer(origins: &[String]) -> CorsLayer {
    if origins.iter().any(|o| o.trim() == "*") {
        return CorsLayer::permissive();
    }

    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin.trim()) {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(origin = %origin, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(allowed))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
}

// =============================================================================
// Handlers
// =============================================================================

/// Liveness check.
async fn healthz_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        db: None,
    })
}

/// Readiness check that runs a read transaction.
async fn readyz_handler(State(state): State<Arc<AppState>>) -> Response {
    let reader = state.reader.clone();
    let db_status = blocking(move || reader.ping()).await;

    match db_status {
        Ok(()) => Json(HealthResponse {
            status: "ok".to_string(),
            db: Some("ready".to_string()),
        })
        .into_response(),
        Err(err) => {
            let detail = match &err {
                ApiError::Storage(e) => e.to_string(),
                other => format!("{other:?}"),
            };
            tracing::error!(error = %detail, "Readiness check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(HealthResponse {
                    status: "not_ready".to_string(),
                    db: Some(detail),
                }),
            )
                .into_response()
        }
    }
}

/// Ingest one tracking event.
async fn track_handler(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<RawEvent>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(raw) = payload?;
    let ingestor = state.ingestor.clone();
    let receipt = blocking(move || ingestor.ingest(&raw)).await?;

    let status = if receipt.duplicate {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok((status, Json(receipt)).into_response())
}

async fn visitor_handler(
    State(state): State<Arc<AppState>>,
    Path(token): Path<String>,
    Query(params): Query<VisitorParams>,
) -> Result<Response, ApiError> {
    let reader = state.reader.clone();
    let limit = params.sessions.unwrap_or(DEFAULT_SESSION_LIMIT);
    let lookup_token = token.clone();
    let profile = blocking(move || reader.profile(&lookup_token, limit)).await?;

    match profile {
        Some(profile) => Ok(Json(profile).into_response()),
        None => Err(ApiError::NotFound(format!("visitor '{token}' not found"))),
    }
}

async fn history_handler(
    State(state): State<Arc<AppState>>,
    Path(token): Path<String>,
    Query(params): Query<HistoryParams>,
) -> Result<Response, ApiError> {
    let reader = state.reader.clone();
    let limit = params.limit.unwrap_or(DEFAULT_HISTORY_LIMIT);
    let events = blocking(move || reader.visitor_history(&token, limit)).await?;
    Ok(Json(json!({ "events": events })).into_response())
}

async fn events_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<EventsQueryParams>,
) -> Result<Response, ApiError> {
    let reader = state.reader.clone();
    let filter = params.filter();
    let page = params.page.unwrap_or(1);
    let limit = params.limit.unwrap_or(DEFAULT_PAGE_LIMIT);
    let order = parse_sort_order(params.order.as_deref());

    let events = blocking(move || reader.recent_events(&filter, page, limit, order)).await?;
    Ok(Json(events).into_response())
}

async fn count_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<EventsQueryParams>,
) -> Result<Response, ApiError> {
    let reader = state.reader.clone();
    let filter = params.filter();
    let count = blocking(move || reader.count_events(&filter)).await?;
    Ok(Json(json!({ "count": count })).into_response())
}

async fn stats_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<StatsParams>,
) -> Result<Response, ApiError> {
    let reader = state.reader.clone();
    let latest = params.latest.unwrap_or(DEFAULT_STATS_LATEST);
    let stats = blocking(move || reader.stats(latest)).await?;
    Ok(Json(stats).into_response())
}

async fn subscribe_handler(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<NewSubscriber>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = payload?;
    let subscribers = state.subscribers.clone();
    let outcome = blocking(move || subscribers.subscribe(&request)).await?;

    let (status, message) = match outcome {
        SubscribeOutcome::Created(_) => (StatusCode::CREATED, "Email subscription successful"),
        SubscribeOutcome::Reactivated(_) => (StatusCode::OK, "Email subscription reactivated"),
        SubscribeOutcome::AlreadySubscribed(_) => (StatusCode::OK, "Email subscription updated"),
    };
    Ok((
        status,
        Json(json!({ "success": true, "id": outcome.id(), "message": message })),
    )
        .into_response())
}

async fn unsubscribe_handler(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<UnsubscribeRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = payload?;
    let email = request
        .email
        .ok_or_else(|| ApiError::BadRequest("email is required".to_string()))?;
    let subscribers = state.subscribers.clone();
    let lookup = email.clone();
    let removed = blocking(move || subscribers.unsubscribe(&lookup)).await?;

    if removed {
        Ok(Json(json!({ "success": true, "message": "Successfully unsubscribed" })).into_response())
    } else {
        Err(ApiError::NotFound(format!("email '{}' not found", email.trim())))
    }
}

async fn subscribers_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<SubscribersParams>,
) -> Result<Response, ApiError> {
    let subscribers = state.subscribers.clone();
    let query = SubscriberQuery {
        page: params.page.unwrap_or(1),
        limit: params.limit.unwrap_or(DEFAULT_PAGE_LIMIT),
        active_only: params.active_only.unwrap_or(true),
    };
    let page = blocking(move || subscribers.list(&query)).await?;
    Ok(Json(page).into_response())
}
