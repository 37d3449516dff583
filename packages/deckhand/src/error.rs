use axum::{
    Json,
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use live_relay::RelayError;
use serde_json::json;
use tracing::warn;

/// Failure of an API request. The dashboard handles every failure the same
/// way, so all variants answer `400 {"message": ...}`.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error("invalid request body: {0}")]
    Body(#[from] JsonRejection),

    #[error(transparent)]
    Relay(#[from] RelayError),
}

impl ApiError {
    pub fn missing(field: &str) -> Self {
        Self::BadRequest(format!("missing required field: {field}"))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let message = self.to_string();
        warn!(error = %message, "request failed");
        (StatusCode::BAD_REQUEST, Json(json!({ "message": message }))).into_response()
    }
}

/// Reject an absent or blank field.
pub fn require<'a>(value: Option<&'a str>, field: &str) -> Result<&'a str, ApiError> {
    match value.map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(ApiError::missing(field)),
    }
}
