use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use darwin_core::DarwinError;
use serde::Serialize;

/// Structured error body returned to HTTP callers — never the raw provider
/// error string (spec §7 "never leak provider-specific messages verbatim").
#[derive(Debug, Serialize)]
pub struct ApiError {
    #[serde(skip)]
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: "bad_request",
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            code: "not_found",
            message: message.into(),
        }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::CONFLICT,
            code: "conflict",
            message: message.into(),
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            code: "unauthorized",
            message: message.into(),
        }
    }
}

impl From<DarwinError> for ApiError {
    fn from(e: DarwinError) -> Self {
        match e {
            DarwinError::Validation(msg) => ApiError::bad_request(msg),
            DarwinError::Conflict(msg) => ApiError::conflict(msg),
            DarwinError::Store(_) => ApiError {
                status: StatusCode::SERVICE_UNAVAILABLE,
                code: "store_unavailable",
                message: "storage backend is unavailable".to_string(),
            },
            DarwinError::Embedding(_) | DarwinError::Llm(_) | DarwinError::LlmSchema(_) | DarwinError::Forge(_) => ApiError {
                status: StatusCode::BAD_GATEWAY,
                code: "external_provider_failure",
                message: "an external provider call failed".to_string(),
            },
            DarwinError::Config(_) | DarwinError::Invariant(_) | DarwinError::Other(_) => ApiError {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                code: "internal_error",
                message: "an internal error occurred".to_string(),
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status;
        (status, Json(self)).into_response()
    }
}
