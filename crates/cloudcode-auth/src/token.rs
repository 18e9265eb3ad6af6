//! OAuth token exchange and refresh
//!
//! Both operations POST a form to the Google token endpoint:
//! 1. Authorization code exchange (operator adds an account)
//! 2. Refresh grant (pool refreshes an expired access token)

use serde::{Deserialize, Serialize};

use crate::client::AuthClient;
use crate::constants::DEFAULT_EXPIRES_IN_SECS;
use crate::error::{Error, Result};

fn default_expires_in() -> u64 {
    DEFAULT_EXPIRES_IN_SECS
}

/// Response from the token endpoint for both exchange and refresh.
///
/// `expires_in` is a delta in seconds from the response time. Google omits
/// `refresh_token` on refresh grants.
#[derive(Debug, Deserialize, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default = "default_expires_in")]
    pub expires_in: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
}

impl AuthClient {
    /// Exchange an authorization code for tokens.
    ///
    /// The PKCE verifier proves this exchange comes from the party that
    /// built the authorization URL.
    pub async fn exchange_code(&self, code: &str, verifier: &str) -> Result<TokenResponse> {
        let request = self.http.post(&self.endpoints.token).form(&[
            ("grant_type", "authorization_code"),
            ("code", code),
            ("code_verifier", verifier),
            ("client_id", self.app.client_id.as_str()),
            ("client_secret", self.app.client_secret.expose().as_str()),
            ("redirect_uri", self.app.redirect_uri.as_str()),
        ]);
        let token: TokenResponse = self.send_json(request).await?;
        if token.refresh_token.is_none() {
            return Err(Error::InvalidResponse(
                "code exchange returned no refresh_token".into(),
            ));
        }
        Ok(token)
    }

    /// Exchange a refresh token for a new access token.
    pub async fn refresh_token(&self, refresh: &str) -> Result<TokenResponse> {
        let request = self.http.post(&self.endpoints.token).form(&[
            ("client_id", self.app.client_id.as_str()),
            ("client_secret", self.app.client_secret.expose().as_str()),
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh),
        ]);
        let token: TokenResponse = self.send_json(request).await?;
        if token.access_token.is_empty() {
            return Err(Error::InvalidResponse(
                "refresh returned an empty access_token".into(),
            ));
        }
        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use axum::Form;
    use axum::http::StatusCode;
    use axum::response::IntoResponse;
    use axum::routing::post;

    use super::*;
    use crate::client::test_support::{client_for, serve};

    async fn token_endpoint(Form(form): Form<HashMap<String, String>>) -> axum::response::Response {
        if form.get("client_secret").map(String::as_str) != Some("test-client-secret") {
            return (StatusCode::UNAUTHORIZED, r#"{"error":"invalid_client"}"#).into_response();
        }
        match form.get("grant_type").map(String::as_str) {
            Some("refresh_token") => match form.get("refresh_token").map(String::as_str) {
                Some("1//good") => axum::Json(serde_json::json!({
                    "access_token": "ya29.fresh",
                    "expires_in": 3599,
                    "token_type": "Bearer"
                }))
                .into_response(),
                Some("1//flaky") => {
                    (StatusCode::SERVICE_UNAVAILABLE, "backend unavailable").into_response()
                }
                _ => (
                    StatusCode::BAD_REQUEST,
                    r#"{"error":"invalid_grant","error_description":"Token has been expired or revoked."}"#,
                )
                    .into_response(),
            },
            Some("authorization_code") => {
                if form.get("code_verifier").map(String::as_str) != Some("verifier-1") {
                    return (StatusCode::BAD_REQUEST, r#"{"error":"invalid_grant"}"#)
                        .into_response();
                }
                axum::Json(serde_json::json!({
                    "access_token": "ya29.new",
                    "refresh_token": "1//new",
                    "expires_in": 3599
                }))
                .into_response()
            }
            _ => (StatusCode::BAD_REQUEST, r#"{"error":"unsupported_grant_type"}"#).into_response(),
        }
    }

    async fn client() -> AuthClient {
        let base = serve(axum::Router::new().route("/token", post(token_endpoint))).await;
        client_for(&base)
    }

    #[test]
    fn refresh_response_without_refresh_token_deserializes() {
        let json = r#"{"access_token":"ya29.abc","expires_in":3599,"scope":"x","token_type":"Bearer"}"#;
        let token: TokenResponse = serde_json::from_str(json).unwrap();
        assert_eq!(token.access_token, "ya29.abc");
        assert_eq!(token.expires_in, 3599);
        assert!(token.refresh_token.is_none());
    }

    #[test]
    fn missing_expires_in_uses_default() {
        let token: TokenResponse = serde_json::from_str(r#"{"access_token":"ya29.abc"}"#).unwrap();
        assert_eq!(token.expires_in, DEFAULT_EXPIRES_IN_SECS);
    }

    #[tokio::test]
    async fn refresh_returns_new_access_token() {
        let token = client().await.refresh_token("1//good").await.unwrap();
        assert_eq!(token.access_token, "ya29.fresh");
        assert_eq!(token.expires_in, 3599);
    }

    #[tokio::test]
    async fn revoked_refresh_token_is_permanent() {
        let err = client().await.refresh_token("1//revoked").await.unwrap_err();
        assert_eq!(err.status(), Some(400));
        assert!(err.is_permanent());
        assert!(err.to_string().contains("invalid_grant: Token has been expired"), "{err}");
    }

    #[tokio::test]
    async fn server_error_is_transient() {
        let err = client().await.refresh_token("1//flaky").await.unwrap_err();
        assert_eq!(err.status(), Some(503));
        assert!(!err.is_permanent());
    }

    #[tokio::test]
    async fn exchange_code_returns_refresh_token() {
        let token = client()
            .await
            .exchange_code("4/0code", "verifier-1")
            .await
            .unwrap();
        assert_eq!(token.refresh_token.as_deref(), Some("1//new"));
    }

    #[tokio::test]
    async fn exchange_code_rejects_wrong_verifier() {
        let err = client()
            .await
            .exchange_code("4/0code", "wrong")
            .await
            .unwrap_err();
        assert!(err.is_permanent());
    }
}
