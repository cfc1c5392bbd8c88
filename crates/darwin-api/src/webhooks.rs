use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use darwin_pipeline::WebhookEvent;
use tracing::warn;

use crate::error::ApiError;
use crate::state::AppState;

const SIGNATURE_HEADER: &str = "x-darwin-signature";

/// `POST /webhooks/forge` — verifies `HMAC-SHA256(secret, raw_body)` before
/// any state mutation; a mismatch is a 401 with no side effects (spec §6.3).
pub async fn forge_webhook(State(state): State<Arc<AppState>>, headers: HeaderMap, body: Bytes) -> Result<impl IntoResponse, ApiError> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::unauthorized("missing signature header"))?;

    if !state.review.verify_signature(&body, signature) {
        return Err(ApiError::unauthorized("signature verification failed"));
    }

    let event: WebhookEvent = serde_json::from_slice(&body).map_err(|e| {
        warn!(error = %e, "malformed webhook payload");
        ApiError::bad_request("malformed webhook payload")
    })?;

    state.review.handle(event).await;
    Ok(StatusCode::OK)
}
