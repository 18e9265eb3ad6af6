//! Error types for pool operations

/// Errors from administrative pool operations.
///
/// Acquisition never fails with an error: an empty or exhausted pool is
/// reported as `None` so callers can answer "service unavailable".
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("credential not found: {0}")]
    NotFound(String),

    #[error("credential already exists: {0}")]
    Duplicate(String),

    #[error("credential store error: {0}")]
    Store(#[from] cloudcode_auth::Error),
}

/// Result alias for pool operations.
pub type Result<T> = std::result::Result<T, Error>;
