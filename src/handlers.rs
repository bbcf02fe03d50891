//! HTTP surface: liveness probe and the webhook ingest endpoint.
//!
//! The ingest handler captures the body as raw bytes before any parsing —
//! the dedupe fallback hashes the exact UTF-8 the producer sent, so the
//! framework must never re-serialize it.

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Path, State};
use axum::http::HeaderMap;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::{info, warn};

use crate::config::Config;
use crate::db::{self, NewRawEvent, Pool};
use crate::dedupe;
use crate::error::ApiError;
use crate::logsafe;
use crate::normalizer;

const SECRET_HEADER: &str = "x-gupshup-secret";
const REQUEST_ID_HEADER: &str = "x-request-id";

/// Webhook payloads are small; this bound only guards against pathological
/// bodies.
const MAX_BODY_SIZE: usize = 256 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub pool: Pool,
    pub config: Arc<Config>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestAck {
    ok: bool,
}

/// Build the service router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/webhooks/gupshup/{app_id}/events", post(ingest))
        .layer(DefaultBodyLimit::max(MAX_BODY_SIZE))
        .with_state(state)
}

/// Liveness probe; deliberately touches nothing.
async fn health() -> &'static str {
    "ok"
}

/// Accept one webhook event: authenticate, persist the raw payload with an
/// idempotency key, acknowledge. Projection happens later, off the request
/// path.
async fn ingest(
    State(state): State<AppState>,
    Path(app_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<IngestAck>, ApiError> {
    let request_id = headers
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    let presented = headers
        .get(SECRET_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if !secret_matches(presented, &state.config.webhook_secret) {
        warn!(%app_id, request_id, "webhook secret rejected");
        return Err(ApiError::Unauthorized);
    }

    let raw_body = String::from_utf8_lossy(&body).into_owned();
    let payload = dedupe::parse_payload_json(&raw_body);
    let normalized = normalizer::normalize(&payload);
    let kind = normalized.kind();
    let hints = normalized.hints();
    let dedupe_key = dedupe::dedupe_key(&app_id, kind, &hints, &raw_body);

    let inserted = db::insert_raw_event(
        &state.pool,
        &NewRawEvent {
            app_id: &app_id,
            event_kind: kind,
            hints: &hints,
            payload_json: &payload,
            dedupe_key: &dedupe_key,
        },
    )
    .await?;

    if inserted {
        if state.config.verbose_logs {
            info!(
                %app_id,
                request_id,
                kind = kind.as_str(),
                payload = %logsafe::preview(&payload, state.config.payload_preview_chars),
                "webhook_received"
            );
        } else {
            info!(%app_id, request_id, kind = kind.as_str(), "webhook_received");
        }
    } else {
        info!(%app_id, request_id, %dedupe_key, "webhook_duplicate_ignored");
    }

    Ok(Json(IngestAck { ok: true }))
}

/// Constant-time comparison of the presented shared secret. Length mismatch
/// short-circuits inside `ct_eq`, not here.
fn secret_matches(presented: &str, expected: &str) -> bool {
    presented.as_bytes().ct_eq(expected.as_bytes()).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secret_comparison() {
        assert!(secret_matches("s3cret", "s3cret"));
        assert!(!secret_matches("s3cret", "other"));
        assert!(!secret_matches("", "s3cret"));
        assert!(!secret_matches("s3cre", "s3cret"));
    }
}
