use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::core::auth::TokenStatus;
use crate::core::error::DeliveryError;
use crate::core::redact::{redact_bearer_token, redact_key_id};
use crate::observability::metrics as obs;
use crate::storage::UpstreamObject;
use crate::sync::report::SyncResponse;

use super::router::AppState;

// ---------------------------------------------------------------------------
// Error response
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
    message: String,
    status: u16,
}

fn error_json(status: StatusCode, error: &str, message: &str) -> Response {
    let body = ErrorResponse {
        error: error.to_string(),
        message: message.to_string(),
        status: status.as_u16(),
    };
    (status, Json(body)).into_response()
}

fn delivery_error(err: &DeliveryError) -> Response {
    let status =
        StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    error_json(status, err.error_code(), &err.to_string())
}

// ---------------------------------------------------------------------------
// Stream proxy
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    pub file: Option<String>,
}

/// `GET /stream-audio?file=<key>` (HEAD is served by the same route).
///
/// Relays the object, or the requested byte range, from the bucket without
/// buffering it. Upstream failures are reported with a generic message.
pub async fn stream_audio(
    State(state): State<AppState>,
    Query(query): Query<StreamQuery>,
    headers: HeaderMap,
) -> Response {
    let key = match query.file.as_deref().map(str::trim) {
        Some(k) if !k.is_empty() => k.to_string(),
        _ => {
            obs::inc_stream_request(400);
            return delivery_error(&DeliveryError::MissingParameter { name: "file" });
        }
    };
    let range = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());

    debug!(key = %key, range = ?range, "stream request");

    let upstream = match state.downloader.fetch(&key, range.as_deref()).await {
        Ok(upstream) => upstream,
        Err(e) => {
            error!(key = %key, error = %e, "failed to fetch object from bucket");
            let err = DeliveryError::from(&e);
            obs::inc_stream_request(err.status_code());
            return delivery_error(&err);
        }
    };

    let response = build_stream_response(&state, upstream, range.is_some());
    obs::inc_stream_request(response.status().as_u16());
    response
}

/// Build the client response around an upstream body.
///
/// The status is 206 only when the client asked for a range and upstream
/// answered 206.
fn build_stream_response(state: &AppState, upstream: UpstreamObject, range_requested: bool) -> Response {
    let delivery = &state.config.delivery;
    let status = if range_requested && upstream.status == 206 {
        StatusCode::PARTIAL_CONTENT
    } else {
        StatusCode::OK
    };

    let mut builder = Response::builder()
        .status(status)
        .header(
            header::CONTENT_TYPE,
            upstream
                .content_type
                .unwrap_or_else(|| delivery.default_content_type.clone()),
        )
        .header(
            header::ACCEPT_RANGES,
            upstream.accept_ranges.unwrap_or_else(|| "bytes".to_string()),
        )
        .header(header::CACHE_CONTROL, delivery.cache_control.as_str());
    if let Some(len) = upstream.content_length {
        builder = builder.header(header::CONTENT_LENGTH, len);
    }
    if let Some(content_range) = upstream.content_range {
        builder = builder.header(header::CONTENT_RANGE, content_range);
    }

    let body = upstream
        .body
        .inspect_ok(|chunk| obs::add_stream_bytes_sent(chunk.len() as u64));

    builder.body(Body::from_stream(body)).unwrap_or_else(|e| {
        error!(error = %e, "invalid upstream response headers");
        delivery_error(&DeliveryError::UpstreamFetch)
    })
}

// ---------------------------------------------------------------------------
// Catalog synchronization
// ---------------------------------------------------------------------------

/// `POST /sync-backblaze`: run one reconciliation pass.
///
/// Always answers 200 once authorized; a failed run is reported as
/// `{"success": false, "error": ...}`. Runs are serialized.
pub async fn trigger_sync(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(resp) = authenticate_admin(&state, &headers) {
        return resp;
    }

    let _running = state.sync_lock.lock().await;
    info!("synchronization requested");
    let body = match state.reconciler.synchronize().await {
        Ok(report) => SyncResponse::completed(report),
        Err(e) => SyncResponse::failed(e.to_string()),
    };
    Json(body).into_response()
}

#[derive(Debug, Serialize)]
pub struct SyncStatusResponse {
    pub status: &'static str,
    pub config: SyncStatusConfig,
}

#[derive(Debug, Serialize)]
pub struct SyncStatusConfig {
    pub bucket_name: String,
    pub bucket_id: String,
    pub listing: String,
    pub region: String,
    pub key_id: String,
}

/// `GET /sync-backblaze`: static status probe, no side effects.
pub async fn sync_status(State(state): State<AppState>) -> Json<SyncStatusResponse> {
    let provider = &state.config.provider;
    Json(SyncStatusResponse {
        status: "sync service is running",
        config: SyncStatusConfig {
            bucket_name: provider.bucket_name.clone(),
            bucket_id: provider.bucket_id.clone(),
            listing: provider.listing.to_string(),
            region: provider.region.clone(),
            key_id: redact_key_id(&provider.key_id),
        },
    })
}

/// `HEAD /sync-backblaze`: refused, the status endpoint answers GET only.
///
/// Registered explicitly because axum serves HEAD through the GET handler.
pub async fn sync_method_not_allowed() -> Response {
    (
        StatusCode::METHOD_NOT_ALLOWED,
        [(header::ALLOW, "GET,POST,OPTIONS")],
    )
        .into_response()
}

/// `OPTIONS` on the public routes: empty 204.
pub async fn preflight() -> StatusCode {
    StatusCode::NO_CONTENT
}

// ---------------------------------------------------------------------------
// Health endpoints
// ---------------------------------------------------------------------------

/// `GET /metrics`: Prometheus text exposition.
pub async fn metrics_handler(State(state): State<AppState>) -> Response {
    let Some(handle) = state.metrics_handle.as_ref() else {
        return error_json(
            StatusCode::NOT_FOUND,
            "metrics_disabled",
            "No metrics recorder is installed.",
        );
    };
    (
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        handle.render(),
    )
        .into_response()
}

/// `GET /healthz`: Liveness probe.
pub async fn healthz(State(state): State<AppState>) -> Json<serde_json::Value> {
    let uptime = state.start_time.elapsed().as_secs();
    Json(serde_json::json!({
        "status": "healthy",
        "uptime_secs": uptime,
        "version": env!("CARGO_PKG_VERSION"),
        "auth_open_mode": state.auth.is_open_mode(),
    }))
}

// ---------------------------------------------------------------------------
// Auth helper
// ---------------------------------------------------------------------------

/// Authenticate admin requests: missing header → 401, unknown token → 403.
fn authenticate_admin(state: &AppState, headers: &HeaderMap) -> Result<(), Response> {
    let raw = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    let token = raw.and_then(|v| v.strip_prefix("Bearer "));

    match state.auth.check_bearer_token(token) {
        TokenStatus::Valid => Ok(()),
        TokenStatus::Missing => {
            debug!(
                authorization = %redact_bearer_token(raw.unwrap_or("")),
                "admin auth failed: missing or invalid header"
            );
            Err(error_json(
                StatusCode::UNAUTHORIZED,
                "unauthorized",
                "Missing or invalid Authorization header.",
            ))
        }
        TokenStatus::Forbidden => {
            debug!(
                authorization = %redact_bearer_token(raw.unwrap_or("")),
                "admin auth failed: invalid token"
            );
            Err(error_json(
                StatusCode::FORBIDDEN,
                "forbidden",
                "Invalid bearer token.",
            ))
        }
    }
}
