//! HTTP and WebSocket surface.
//!
//! - `POST /mutations`: apply a record mutation directly
//! - `GET /records`, `GET /records/{id}`: read the record store
//! - `DELETE /records`: reset the record store
//! - `GET /dead-letters`: inspect the dead-letter destination
//! - `GET /health`: queue depth and listener count
//! - `GET /ws?topics=a,b`: live broadcast stream; clients may also publish

use std::sync::Arc;

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::error;

use crate::broadcast::BroadcastHub;
use crate::error::ErrorKind;
use crate::model::{MutationRequest, RecordId};
use crate::mutation::{MutationError, MutationService};
use crate::queue::{MessageQueue, QueueError};
use crate::store::RecordFilter;

mod ws;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub mutations: MutationService,
    pub queue: Arc<dyn MessageQueue>,
    pub queue_name: String,
    pub hub: BroadcastHub,
}

/// Build the router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/mutations", post(create_mutation))
        .route("/records", get(list_records).delete(reset_records))
        .route("/records/{id}", get(get_record))
        .route("/dead-letters", get(list_dead_letters))
        .route("/health", get(health))
        .route("/ws", get(ws::ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Handler error. Rendered as `{ "error": { "kind", "message" } }`.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Mutation(#[from] MutationError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("{0}")]
    BadRequest(String),
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl ApiError {
    fn kind(&self) -> ErrorKind {
        match self {
            ApiError::Mutation(e) => e.kind(),
            ApiError::Queue(e) => e.kind(),
            ApiError::BadRequest(_) => ErrorKind::MalformedPayload,
        }
    }
}

fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::TransientIo => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::Validation => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::RateLimited => StatusCode::TOO_MANY_REQUESTS,
        ErrorKind::MalformedPayload => StatusCode::BAD_REQUEST,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let kind = self.kind();
        let status = match &self {
            ApiError::Queue(QueueError::Unsupported(_)) => StatusCode::NOT_IMPLEMENTED,
            _ => status_for(kind),
        };

        if status.is_server_error() {
            error!(kind = %kind, error = %self, "Request failed");
        }

        let body = json!({
            "error": {
                "kind": kind,
                "message": self.to_string(),
            }
        });
        let mut response = (status, Json(body)).into_response();

        if let ApiError::Mutation(MutationError::RateLimited { retry_after }) = &self {
            // Whole seconds, rounded up so clients never retry early.
            let secs = retry_after.as_millis().div_ceil(1000).max(1);
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }

        response
    }
}

type ApiResult<T> = Result<T, ApiError>;

async fn create_mutation(
    State(state): State<AppState>,
    request: Result<Json<MutationRequest>, JsonRejection>,
) -> ApiResult<Json<serde_json::Value>> {
    let Json(request) = request?;
    let record = state.mutations.execute(request).await?;
    Ok(Json(json!({ "record": record })))
}

async fn list_records(
    State(state): State<AppState>,
    filter: Result<Query<RecordFilter>, QueryRejection>,
) -> ApiResult<Json<serde_json::Value>> {
    let Query(filter) = filter?;
    let records = state.mutations.list(&filter).await?;
    Ok(Json(json!({ "records": records })))
}

async fn get_record(
    State(state): State<AppState>,
    Path(id): Path<RecordId>,
) -> ApiResult<Json<serde_json::Value>> {
    let record = state.mutations.get(id).await?;
    Ok(Json(json!({ "record": record })))
}

async fn reset_records(State(state): State<AppState>) -> ApiResult<StatusCode> {
    state.mutations.reset().await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_dead_letters(State(state): State<AppState>) -> ApiResult<Json<serde_json::Value>> {
    let dead_letters = state.queue.dead_letters(&state.queue_name).await?;
    Ok(Json(json!({ "deadLetters": dead_letters })))
}

async fn health(State(state): State<AppState>) -> Response {
    let listeners = state.hub.listener_count();
    match state.queue.depth(&state.queue_name).await {
        Ok(depth) => Json(json!({
            "status": "ok",
            "queue": depth,
            "listeners": listeners,
        }))
        .into_response(),
        Err(QueueError::Unsupported(_)) => Json(json!({
            "status": "ok",
            "queue": null,
            "listeners": listeners,
        }))
        .into_response(),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "degraded",
                "error": e.to_string(),
                "listeners": listeners,
            })),
        )
            .into_response(),
    }
}
