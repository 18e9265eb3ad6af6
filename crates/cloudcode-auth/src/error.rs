//! Error types for OAuth and credential operations
//!
//! Upstream failures keep the HTTP status so callers can tell a revoked grant
//! (permanent) from a network blip or server error (transient).

use std::time::Duration;

/// Errors from OAuth authentication and credential storage.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("upstream returned {status}: {message}")]
    Upstream { status: u16, message: String },

    #[error("invalid upstream response: {0}")]
    InvalidResponse(String),

    #[error("credential parse error: {0}")]
    CredentialParse(String),

    #[error("I/O error: {0}")]
    Io(String),
}

impl Error {
    /// HTTP status reported by the upstream, when there was one.
    pub fn status(&self) -> Option<u16> {
        match self {
            Error::Upstream { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Whether the upstream rejected the grant itself.
    ///
    /// 400 (`invalid_grant`), 401 and 403 mean the refresh token is bad,
    /// expired or revoked; retrying the same credential won't help. Every
    /// other failure, including ones without a status, is transient.
    pub fn is_permanent(&self) -> bool {
        matches!(self.status(), Some(400 | 401 | 403))
    }
}

/// Extract a human-readable message from an upstream error body.
///
/// Accepts `{"error":{"message":..}}`, the OAuth form
/// `{"error":"invalid_grant","error_description":..}`, or falls back to the
/// raw text.
pub fn upstream_message(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return "<no body>".to_string();
    }
    let Ok(json) = serde_json::from_str::<serde_json::Value>(trimmed) else {
        return trimmed.to_string();
    };
    let error = json.get("error");
    if let Some(message) = error
        .and_then(|e| e.get("message"))
        .and_then(|m| m.as_str())
    {
        return message.to_string();
    }
    if let Some(code) = error.and_then(|e| e.as_str()) {
        return match json.get("error_description").and_then(|d| d.as_str()) {
            Some(description) => format!("{code}: {description}"),
            None => code.to_string(),
        };
    }
    trimmed.to_string()
}

/// Result alias for auth operations.
pub type Result<T> = std::result::Result<T, Error>;
