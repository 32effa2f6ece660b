use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("configuration error for '{name}': {message}")]
    Config { name: String, message: String },

    #[error("sink '{sink}' failed to start: {message}")]
    SinkStart { sink: String, message: String },

    #[error("sink '{sink}' failed to enqueue: {message}")]
    SinkEnqueue { sink: String, message: String },

    #[error("invalid table name: {0}")]
    InvalidTableName(String),

    #[error("upstream proxy error: {0}")]
    Upstream(String),
}

pub type Result<T> = std::result::Result<T, GatewayError>;

/// Error kinds surfaced directly at the HTTP boundary (see spec §7).
#[derive(Debug)]
pub enum ApiError {
    UnsupportedMediaType,
    BodyTooLarge,
    MalformedJson,
    Unauthorized,
    MethodNotAllowed,
    NotFound,
    BadUpstream,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ApiError::UnsupportedMediaType => (StatusCode::UNSUPPORTED_MEDIA_TYPE, "unsupported content type"),
            ApiError::BodyTooLarge => (StatusCode::PAYLOAD_TOO_LARGE, "request body too large"),
            ApiError::MalformedJson => (StatusCode::BAD_REQUEST, "malformed json body"),
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "invalid or missing signature"),
            ApiError::MethodNotAllowed => (StatusCode::METHOD_NOT_ALLOWED, "method not allowed"),
            ApiError::NotFound => (StatusCode::NOT_FOUND, "not found"),
            ApiError::BadUpstream => (StatusCode::BAD_GATEWAY, "upstream request failed"),
        };
        (status, body).into_response()
    }
}
