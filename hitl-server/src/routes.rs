//! HTTP route handlers over the broker.

use axum::Router;
use axum::body::Bytes;
use axum::extract::rejection::QueryRejection;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response as HttpResponse};
use axum::routing::{get, post};
use hitl::core::deadline::poll_budget;
use hitl::core::sanitize;
use hitl::core::types::{Health, Request, Response};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value, json};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::debug;

use crate::error::ApiError;
use crate::state::AppState;

/// Build the API router.
pub fn api_router() -> Router<AppState> {
    Router::new()
        .route("/request", post(submit_request))
        .route("/pending", get(list_pending))
        .route("/next", get(next_request))
        .route("/response/{request_id}", post(submit_response))
        .route("/health", get(health))
}

/// Full application: routes, tracing, and permissive CORS for dashboards.
pub fn app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    api_router()
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Decode a JSON body after repairing invalid UTF-8 and lone surrogates.
fn decode<T: DeserializeOwned>(body: &[u8]) -> Result<T, ApiError> {
    serde_json::from_str(&sanitize::json_payload(body))
        .map_err(|err| ApiError::Malformed(format!("invalid JSON body: {err}")))
}

/// POST /request - submit and block until answered, expired, or cancelled.
async fn submit_request(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<Response>, ApiError> {
    let request: Request = decode(&body)?;
    let response = state.broker.submit(request).await?;
    Ok(Json(response))
}

/// GET /pending - every in-flight request, oldest first.
async fn list_pending(State(state): State<AppState>) -> Json<Vec<Request>> {
    Json(state.broker.list_pending())
}

#[derive(Debug, Deserialize)]
struct NextParams {
    /// Seconds to wait; fractional values are allowed.
    timeout: Option<f64>,
}

/// GET /next - long-poll for the oldest unclaimed request. 204 when none arrives.
async fn next_request(
    State(state): State<AppState>,
    params: Result<Query<NextParams>, QueryRejection>,
) -> Result<HttpResponse, ApiError> {
    let Query(params) = params.map_err(|err| ApiError::Malformed(err.body_text()))?;
    let wait = poll_budget(params.timeout, state.default_poll, state.max_poll);

    match state.broker.claim_next(wait).await {
        Some(request) => Ok(Json(request).into_response()),
        None => Ok(StatusCode::NO_CONTENT.into_response()),
    }
}

/// POST /response/{request_id} - settle a pending request.
///
/// The path names the request; a `request_id` in the body may repeat it but
/// must not contradict it. An empty body is an empty successful answer.
async fn submit_response(
    State(state): State<AppState>,
    Path(request_id): Path<String>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let mut fields: Map<String, Value> = if body.iter().all(u8::is_ascii_whitespace) {
        Map::new()
    } else {
        decode(&body)?
    };

    match fields.get("request_id") {
        None | Some(Value::Null) => {}
        Some(Value::String(given)) if *given == request_id => {}
        Some(other) => {
            return Err(ApiError::Malformed(format!(
                "request_id {other} does not match path {request_id}"
            )));
        }
    }
    fields.insert("request_id".to_string(), Value::String(request_id.clone()));

    let response: Response = serde_json::from_value(Value::Object(fields))
        .map_err(|err| ApiError::Malformed(format!("invalid response: {err}")))?;

    if state.broker.respond(response) {
        Ok(Json(json!({ "success": true })))
    } else {
        debug!(id = %request_id, "response for unknown request");
        Err(ApiError::NotFound(request_id))
    }
}

/// GET /health - liveness plus queue depth.
async fn health(State(state): State<AppState>) -> Json<Health> {
    let status = if state.broker.is_closed() {
        "closing"
    } else {
        "healthy"
    };
    Json(Health {
        status: status.to_string(),
        pending_requests: state.broker.in_flight_count(),
        queued_requests: state.broker.queued_count(),
    })
}
