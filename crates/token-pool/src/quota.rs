//! Classification of Cloud Code responses
//!
//! Decides what the pool should do with the credential that served a failed
//! upstream request. Cloud Code reports an exhausted account with a plain
//! 429, so unlike per-minute rate limiters there is no body inspection: any
//! 429 marks the credential as out of quota.

/// What a failed upstream response means for the credential that served it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClassification {
    /// Retryable with the same credential (timeouts, 5xx, bad requests)
    Transient,
    /// Quota window exhausted, rotate to another credential
    QuotaExceeded,
    /// Credential rejected (401/403), disable it
    Permanent,
}

/// Classify an upstream error by HTTP status. The body is not consulted.
pub fn classify_status(status: u16, _body: &str) -> ErrorClassification {
    match status {
        429 => ErrorClassification::QuotaExceeded,
        401 | 403 => ErrorClassification::Permanent,
        _ => ErrorClassification::Transient,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_is_quota_exhaustion() {
        let body = r#"{"error":{"code":429,"message":"Resource has been exhausted (e.g. check quota).","status":"RESOURCE_EXHAUSTED"}}"#;
        assert_eq!(classify_status(429, body), ErrorClassification::QuotaExceeded);
        assert_eq!(classify_status(429, ""), ErrorClassification::QuotaExceeded);
    }

    #[test]
    fn auth_failures_are_permanent() {
        assert_eq!(classify_status(401, "unauthorized"), ErrorClassification::Permanent);
        assert_eq!(classify_status(403, "forbidden"), ErrorClassification::Permanent);
    }

    #[test]
    fn everything_else_is_transient() {
        for status in [400, 404, 408, 500, 502, 503, 504] {
            assert_eq!(
                classify_status(status, ""),
                ErrorClassification::Transient,
                "status {status}"
            );
        }
    }
}
