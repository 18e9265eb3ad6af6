//! Request-level errors and their JSON rendering
//!
//! Every error the gateway itself produces is answered as
//! `{"error":{"type":"...","message":"...","request_id":"req_..."}}`.
//! Upstream rejections that are not retried pass through verbatim instead.

use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("missing or invalid API key")]
    Unauthorized,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    Conflict(String),

    #[error("service unavailable: no usable credential")]
    NoCredential,

    #[error("upstream timeout after {}s", .0.as_secs())]
    UpstreamTimeout(Duration),

    #[error("upstream error: {0}")]
    Upstream(String),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Result alias using service Error
pub type Result<T> = std::result::Result<T, Error>;

/// Fresh request id in the `req_<uuid>` form used in logs and error bodies.
pub fn new_request_id() -> String {
    format!("req_{}", uuid::Uuid::new_v4().as_simple())
}

impl Error {
    pub fn status(&self) -> StatusCode {
        match self {
            Error::Unauthorized => StatusCode::UNAUTHORIZED,
            Error::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Conflict(_) => StatusCode::CONFLICT,
            Error::NoCredential => StatusCode::SERVICE_UNAVAILABLE,
            Error::UpstreamTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Error::Upstream(_) => StatusCode::BAD_GATEWAY,
            Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Error::Unauthorized => "authentication_error",
            Error::InvalidRequest(_) => "invalid_request_error",
            Error::NotFound(_) => "not_found_error",
            Error::Conflict(_) => "conflict_error",
            Error::NoCredential => "service_unavailable",
            Error::UpstreamTimeout(_) | Error::Upstream(_) => "proxy_error",
            Error::Internal(_) => "internal_error",
        }
    }

    /// Render with a caller-supplied request id so logs and body agree.
    pub fn to_response(&self, request_id: &str) -> Response {
        let body = serde_json::json!({
            "error": {
                "type": self.kind(),
                "message": self.to_string(),
                "request_id": request_id,
            }
        });
        (
            self.status(),
            [(axum::http::header::CONTENT_TYPE, "application/json")],
            body.to_string(),
        )
            .into_response()
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        self.to_response(&new_request_id())
    }
}

impl From<token_pool::Error> for Error {
    fn from(e: token_pool::Error) -> Self {
        match e {
            token_pool::Error::NotFound(id) => Error::NotFound(format!("credential {id}")),
            token_pool::Error::Duplicate(id) => Error::Conflict(format!("credential {id}")),
            token_pool::Error::Store(e) => Error::Internal(e.to_string()),
        }
    }
}
