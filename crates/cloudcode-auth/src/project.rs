//! Cloud Code eligibility and account profile lookups

use rand::RngExt;
use serde::Deserialize;
use tracing::debug;

use crate::client::AuthClient;
use crate::constants::CLOUDCODE_USER_AGENT;
use crate::error::Result;

const ADJECTIVES: &[&str] = &[
    "useful", "bright", "swift", "calm", "bold", "quiet", "steady", "clever", "brisk", "gentle",
    "solid", "vivid",
];

const NOUNS: &[&str] = &[
    "fuze", "wave", "spark", "flow", "core", "river", "stone", "harbor", "signal", "meadow",
    "beacon", "orbit",
];

const SUFFIX_CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Locally generated project id of the form `adjective-noun-xxxxx`.
///
/// Used when eligibility validation is skipped, or to label an account that
/// is not entitled to a companion project.
pub fn generate_project_id() -> String {
    let mut rng = rand::rng();
    let adjective = ADJECTIVES[rng.random_range(0..ADJECTIVES.len())];
    let noun = NOUNS[rng.random_range(0..NOUNS.len())];
    let suffix: String = (0..5)
        .map(|_| SUFFIX_CHARS[rng.random_range(0..SUFFIX_CHARS.len())] as char)
        .collect();
    format!("{adjective}-{noun}-{suffix}")
}

#[derive(Debug, Deserialize)]
struct LoadCodeAssistResponse {
    #[serde(rename = "cloudaicompanionProject", default)]
    project: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct UserInfo {
    #[serde(default)]
    email: Option<String>,
}

impl AuthClient {
    /// Ask Cloud Code which companion project the account may use.
    ///
    /// `Ok(None)` means the account is authenticated but not eligible. The
    /// project comes back either as a bare string or as an object with an
    /// `id` field.
    pub async fn load_code_assist(&self, access_token: &str) -> Result<Option<String>> {
        let request = self
            .http
            .post(&self.endpoints.load_code_assist)
            .bearer_auth(access_token)
            .header(reqwest::header::USER_AGENT, CLOUDCODE_USER_AGENT)
            .json(&serde_json::json!({ "metadata": { "ideType": "ANTIGRAVITY" } }));
        let response: LoadCodeAssistResponse = self.send_json(request).await?;

        let project = match response.project {
            Some(serde_json::Value::String(id)) if !id.is_empty() => Some(id),
            Some(serde_json::Value::Object(obj)) => obj
                .get("id")
                .and_then(|id| id.as_str())
                .filter(|id| !id.is_empty())
                .map(String::from),
            _ => None,
        };
        debug!(eligible = project.is_some(), "loadCodeAssist answered");
        Ok(project)
    }

    /// Email address of the account owning `access_token`.
    pub async fn fetch_user_email(&self, access_token: &str) -> Result<Option<String>> {
        let request = self
            .http
            .get(&self.endpoints.userinfo)
            .bearer_auth(access_token);
        let info: UserInfo = self.send_json(request).await?;
        Ok(info.email)
    }
}

#[cfg(test)]
mod tests {
    use axum::Json;
    use axum::http::{HeaderMap, StatusCode};
    use axum::response::IntoResponse;
    use axum::routing::{get, post};

    use super::*;
    use crate::client::test_support::{client_for, serve};

    async fn load_code_assist(headers: HeaderMap) -> axum::response::Response {
        let auth = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        match auth {
            "Bearer ya29.string" => {
                Json(serde_json::json!({"cloudaicompanionProject": "proj-123"})).into_response()
            }
            "Bearer ya29.object" => Json(serde_json::json!({
                "cloudaicompanionProject": {"id": "proj-456", "name": "x"}
            }))
            .into_response(),
            "Bearer ya29.ineligible" => {
                Json(serde_json::json!({"currentTier": {"id": "free-tier"}})).into_response()
            }
            _ => (
                StatusCode::FORBIDDEN,
                r#"{"error":{"message":"PERMISSION_DENIED"}}"#,
            )
                .into_response(),
        }
    }

    async fn client() -> AuthClient {
        let router = axum::Router::new()
            .route("/v1internal:loadCodeAssist", post(load_code_assist))
            .route(
                "/userinfo",
                get(|| async { Json(serde_json::json!({"email": "dev@example.com"})) }),
            );
        client_for(&serve(router).await)
    }

    #[tokio::test]
    async fn project_as_string() {
        let project = client().await.load_code_assist("ya29.string").await.unwrap();
        assert_eq!(project.as_deref(), Some("proj-123"));
    }

    #[tokio::test]
    async fn project_as_object() {
        let project = client().await.load_code_assist("ya29.object").await.unwrap();
        assert_eq!(project.as_deref(), Some("proj-456"));
    }

    #[tokio::test]
    async fn missing_project_means_ineligible() {
        let project = client()
            .await
            .load_code_assist("ya29.ineligible")
            .await
            .unwrap();
        assert!(project.is_none());
    }

    #[tokio::test]
    async fn forbidden_is_permanent_error() {
        let err = client().await.load_code_assist("ya29.bad").await.unwrap_err();
        assert!(err.is_permanent());
    }

    #[tokio::test]
    async fn user_email_is_read() {
        let email = client().await.fetch_user_email("ya29.any").await.unwrap();
        assert_eq!(email.as_deref(), Some("dev@example.com"));
    }

    #[test]
    fn generated_project_id_shape() {
        let id = generate_project_id();
        let parts: Vec<&str> = id.split('-').collect();
        assert_eq!(parts.len(), 3, "{id}");
        assert!(ADJECTIVES.contains(&parts[0]));
        assert!(NOUNS.contains(&parts[1]));
        assert_eq!(parts[2].len(), 5);
        assert!(parts[2].bytes().all(|b| SUFFIX_CHARS.contains(&b)));
    }
}
