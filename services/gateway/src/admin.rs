//! Admin API for credential management
//!
//! Runs on a separate listener (default 127.0.0.1:9090) and is meant for
//! operators only.
//!
//! Endpoints:
//! - GET    /admin/tokens          list stored credentials
//! - POST   /admin/tokens          add a credential
//! - PUT    /admin/tokens          patch a credential (identified by refresh_token)
//! - DELETE /admin/tokens          delete a credential (identified by refresh_token)
//! - POST   /admin/tokens/reload   re-read the store and rebuild the pool
//! - GET    /admin/rotation        current rotation policy and counters
//! - PUT    /admin/rotation        hot-swap strategy and/or request count
//! - GET    /admin/pool            pool health summary
//! - POST   /admin/oauth/init      start a PKCE flow, return the consent URL
//! - POST   /admin/oauth/complete  exchange the code and add the account

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use cloudcode_auth::{
    AuthClient, CredentialPatch, NewCredential, compute_challenge, generate_project_id,
    generate_state, generate_verifier,
};
use serde::Deserialize;
use tokio::sync::Mutex;
use token_pool::{Pool, Strategy};
use tracing::{info, warn};

use crate::error::{Error, Result};

/// Verifier for an in-progress authorization, keyed by its `state`.
struct PendingAuthorization {
    verifier: String,
    created_at: Instant,
}

/// Maximum age of a pending authorization before it expires.
const PENDING_EXPIRY: Duration = Duration::from_secs(600);

/// Shared state for admin API handlers.
#[derive(Clone)]
pub struct AdminState {
    pool: Arc<Pool>,
    auth: AuthClient,
    skip_project_id_fetch: bool,
    pending: Arc<Mutex<HashMap<String, PendingAuthorization>>>,
}

impl AdminState {
    pub fn new(pool: Arc<Pool>, auth: AuthClient, skip_project_id_fetch: bool) -> Self {
        Self {
            pool,
            auth,
            skip_project_id_fetch,
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

/// Build the admin axum router.
pub fn build_admin_router(state: AdminState) -> Router {
    Router::new()
        .route(
            "/admin/tokens",
            get(list_tokens)
                .post(add_token)
                .put(update_token)
                .delete(delete_token),
        )
        .route("/admin/tokens/reload", post(reload_tokens))
        .route("/admin/rotation", get(get_rotation).put(update_rotation))
        .route("/admin/pool", get(pool_status))
        .route("/admin/oauth/init", post(init_oauth))
        .route("/admin/oauth/complete", post(complete_oauth))
        .with_state(state)
}

/// GET /admin/tokens: every stored credential, disabled ones included.
///
/// Access tokens are cut down to a suffix; the refresh token is shown because
/// it is the key for update and delete.
async fn list_tokens(State(state): State<AdminState>) -> Result<impl IntoResponse> {
    let tokens = state.pool.list().await?;
    Ok(Json(serde_json::json!({ "tokens": tokens })))
}

/// POST /admin/tokens
async fn add_token(
    State(state): State<AdminState>,
    Json(body): Json<NewCredential>,
) -> Result<impl IntoResponse> {
    if body.access_token.is_empty() || body.refresh_token.is_empty() {
        return Err(Error::InvalidRequest(
            "access_token and refresh_token are required".into(),
        ));
    }
    state.pool.add(body).await?;
    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({ "status": "added" })),
    ))
}

#[derive(Deserialize)]
struct UpdateTokenRequest {
    refresh_token: String,
    #[serde(flatten)]
    patch: CredentialPatch,
}

/// PUT /admin/tokens
async fn update_token(
    State(state): State<AdminState>,
    Json(body): Json<UpdateTokenRequest>,
) -> Result<impl IntoResponse> {
    state.pool.update(&body.refresh_token, body.patch).await?;
    Ok(Json(serde_json::json!({ "status": "updated" })))
}

#[derive(Deserialize)]
struct DeleteTokenRequest {
    refresh_token: String,
}

/// DELETE /admin/tokens
async fn delete_token(
    State(state): State<AdminState>,
    Json(body): Json<DeleteTokenRequest>,
) -> Result<impl IntoResponse> {
    state.pool.remove(&body.refresh_token).await?;
    Ok(Json(serde_json::json!({ "status": "removed" })))
}

/// POST /admin/tokens/reload
async fn reload_tokens(State(state): State<AdminState>) -> impl IntoResponse {
    state.pool.reload().await;
    Json(serde_json::json!({
        "status": "reloaded",
        "credentials": state.pool.len().await,
        "generation": state.pool.generation(),
    }))
}

/// GET /admin/rotation
async fn get_rotation(State(state): State<AdminState>) -> impl IntoResponse {
    Json(state.pool.rotation_config().await)
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RotationUpdate {
    #[serde(default)]
    strategy: Option<String>,
    #[serde(default)]
    request_count: Option<u32>,
}

/// PUT /admin/rotation: a zero request count is ignored by the pool.
async fn update_rotation(
    State(state): State<AdminState>,
    Json(body): Json<RotationUpdate>,
) -> Result<impl IntoResponse> {
    let strategy = body
        .strategy
        .as_deref()
        .map(str::parse::<Strategy>)
        .transpose()
        .map_err(|e| Error::InvalidRequest(e.to_string()))?;
    state
        .pool
        .update_rotation_config(strategy, body.request_count)
        .await;
    Ok(Json(state.pool.rotation_config().await))
}

/// GET /admin/pool
async fn pool_status(State(state): State<AdminState>) -> impl IntoResponse {
    Json(state.pool.health().await)
}

/// POST /admin/oauth/init: generate PKCE material and the consent URL.
///
/// The verifier stays in memory, keyed by `state`, until complete consumes it.
async fn init_oauth(State(state): State<AdminState>) -> impl IntoResponse {
    let verifier = generate_verifier();
    let challenge = compute_challenge(&verifier);
    let oauth_state = generate_state();
    let authorization_url = state.auth.authorization_url(&oauth_state, &challenge);

    let mut pending = state.pending.lock().await;
    // Lazy cleanup: remove expired entries while holding the lock
    pending.retain(|_, p| p.created_at.elapsed() < PENDING_EXPIRY);
    pending.insert(
        oauth_state.clone(),
        PendingAuthorization {
            verifier,
            created_at: Instant::now(),
        },
    );

    info!("authorization flow initiated");

    Json(serde_json::json!({
        "authorization_url": authorization_url,
        "state": oauth_state,
        "instructions": "Open the URL, approve access, then post the code and state from the redirect to /admin/oauth/complete",
    }))
}

#[derive(Deserialize)]
struct CompleteOAuthRequest {
    state: String,
    code: String,
}

/// POST /admin/oauth/complete: exchange the code and add the account.
///
/// An account Cloud Code does not recognise is still stored, with a generated
/// project id and no quota, so the operator can see it in the listing.
async fn complete_oauth(
    State(state): State<AdminState>,
    Json(body): Json<CompleteOAuthRequest>,
) -> Result<impl IntoResponse> {
    let pending = state.pending.lock().await.remove(&body.state);
    let pending = pending.ok_or_else(|| {
        Error::InvalidRequest(
            "no pending authorization for this state (expired or not initiated)".into(),
        )
    })?;
    if pending.created_at.elapsed() > PENDING_EXPIRY {
        return Err(Error::InvalidRequest(
            "authorization expired (>10 minutes), start again with /admin/oauth/init".into(),
        ));
    }

    let tokens = state
        .auth
        .exchange_code(body.code.trim(), &pending.verifier)
        .await
        .map_err(|e| {
            warn!(error = %e, "code exchange failed");
            Error::Upstream(format!("code exchange failed: {e}"))
        })?;
    let refresh_token = tokens
        .refresh_token
        .ok_or_else(|| Error::Upstream("code exchange returned no refresh_token".into()))?;

    let email = match state.auth.fetch_user_email(&tokens.access_token).await {
        Ok(email) => email,
        Err(e) => {
            warn!(error = %e, "user info lookup failed, storing account without email");
            None
        }
    };

    let (project_id, has_quota) = if state.skip_project_id_fetch {
        (generate_project_id(), true)
    } else {
        match state.auth.load_code_assist(&tokens.access_token).await {
            Ok(Some(project_id)) => (project_id, true),
            Ok(None) => {
                warn!(email = ?email, "account is not eligible for Cloud Code, storing without quota");
                (generate_project_id(), false)
            }
            Err(e) => {
                warn!(error = %e, "eligibility check failed");
                return Err(Error::Upstream(format!("eligibility check failed: {e}")));
            }
        }
    };

    state
        .pool
        .add(NewCredential {
            access_token: tokens.access_token,
            refresh_token,
            expires_in: Some(tokens.expires_in),
            timestamp: None,
            enable: Some(true),
            has_quota: Some(has_quota),
            project_id: Some(project_id.clone()),
            email: email.clone(),
        })
        .await?;

    info!(email = ?email, project_id = %project_id, has_quota, "account authorized and added");

    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({
            "status": "added",
            "email": email,
            "projectId": project_id,
            "hasQuota": has_quota,
        })),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use cloudcode_auth::{CredentialStore, Endpoints, OAuthApp, now_millis};
    use common::Secret;
    use tokio::net::TcpListener;
    use token_pool::PoolOptions;
    use tower::ServiceExt;

    async fn serve(router: Router) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn auth_client(base: &str) -> AuthClient {
        AuthClient::new(
            reqwest::Client::new(),
            OAuthApp::with_secret(Secret::new("test-client-secret".to_string())),
            Endpoints {
                token: format!("{base}/token"),
                authorize: format!("{base}/auth"),
                userinfo: format!("{base}/userinfo"),
                load_code_assist: format!("{base}/v1internal:loadCodeAssist"),
            },
            Duration::from_secs(5),
        )
    }

    fn record(name: &str) -> serde_json::Value {
        serde_json::json!({
            "access_token": format!("ya29.{name}-access-token"),
            "refresh_token": format!("1//{name}"),
            "expires_in": 3599,
            "timestamp": now_millis(),
            "enable": true,
            "hasQuota": true,
            "projectId": format!("proj-{name}"),
        })
    }

    /// Admin router over a store seeded with `records`; upstream calls go to `base`.
    async fn admin_app(
        dir: &std::path::Path,
        records: Vec<serde_json::Value>,
        base: &str,
        skip_project_id_fetch: bool,
    ) -> (Router, Arc<Pool>) {
        let path = dir.join("accounts.json");
        std::fs::write(&path, serde_json::to_string(&records).unwrap()).unwrap();
        let auth = auth_client(base);
        let pool = Arc::new(Pool::new(
            Arc::new(CredentialStore::new(path)),
            Arc::new(auth.clone()),
            PoolOptions::default(),
        ));
        let state = AdminState::new(pool.clone(), auth, skip_project_id_fetch);
        (build_admin_router(state), pool)
    }

    fn json_request(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn list_tokens_hides_access_tokens() {
        let dir = tempfile::tempdir().unwrap();
        let (app, _pool) = admin_app(dir.path(), vec![record("a")], "http://127.0.0.1:1", false).await;

        let response = app
            .oneshot(Request::builder().uri("/admin/tokens").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json = body_json(response).await;
        let tokens = json["tokens"].as_array().unwrap();
        assert_eq!(tokens.len(), 1);
        assert_eq!(tokens[0]["refresh_token"], "1//a");
        assert_eq!(tokens[0]["access_token_suffix"], "...ss-token");
        assert!(tokens[0].get("access_token").is_none());
        assert!(!json.to_string().contains("ya29.a-access-token"));
    }

    #[tokio::test]
    async fn add_then_duplicate_is_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let (app, pool) = admin_app(dir.path(), vec![], "http://127.0.0.1:1", false).await;

        let new = serde_json::json!({
            "access_token": "ya29.new",
            "refresh_token": "1//new",
            "projectId": "proj-new",
        });
        let response = app
            .clone()
            .oneshot(json_request("POST", "/admin/tokens", new.clone()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(pool.len().await, 1);

        let response = app
            .oneshot(json_request("POST", "/admin/tokens", new))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        let json = body_json(response).await;
        assert_eq!(json["error"]["type"], "conflict_error");
    }

    #[tokio::test]
    async fn add_requires_both_tokens() {
        let dir = tempfile::tempdir().unwrap();
        let (app, _pool) = admin_app(dir.path(), vec![], "http://127.0.0.1:1", false).await;

        let response = app
            .oneshot(json_request(
                "POST",
                "/admin/tokens",
                serde_json::json!({"access_token": "", "refresh_token": "1//x"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn update_disables_and_removes_from_rotation() {
        let dir = tempfile::tempdir().unwrap();
        let (app, pool) = admin_app(
            dir.path(),
            vec![record("a"), record("b")],
            "http://127.0.0.1:1",
            false,
        )
        .await;
        pool.initialize().await;
        assert_eq!(pool.len().await, 2);

        let response = app
            .oneshot(json_request(
                "PUT",
                "/admin/tokens",
                serde_json::json!({"refresh_token": "1//a", "enable": false}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(pool.len().await, 1);

        let listed = pool.list().await.unwrap();
        let a = listed.iter().find(|c| c.refresh_token == "1//a").unwrap();
        assert!(!a.enable, "disabled record stays in the store");
    }

    #[tokio::test]
    async fn update_and_delete_unknown_are_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let (app, _pool) = admin_app(dir.path(), vec![record("a")], "http://127.0.0.1:1", false).await;

        let response = app
            .clone()
            .oneshot(json_request(
                "PUT",
                "/admin/tokens",
                serde_json::json!({"refresh_token": "1//missing", "hasQuota": false}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app
            .oneshot(json_request(
                "DELETE",
                "/admin/tokens",
                serde_json::json!({"refresh_token": "1//missing"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn delete_removes_from_store_and_pool() {
        let dir = tempfile::tempdir().unwrap();
        let (app, pool) = admin_app(
            dir.path(),
            vec![record("a"), record("b")],
            "http://127.0.0.1:1",
            false,
        )
        .await;

        let response = app
            .oneshot(json_request(
                "DELETE",
                "/admin/tokens",
                serde_json::json!({"refresh_token": "1//a"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(pool.len().await, 1);
        assert_eq!(pool.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn reload_picks_up_external_edits() {
        let dir = tempfile::tempdir().unwrap();
        let (app, pool) = admin_app(dir.path(), vec![record("a")], "http://127.0.0.1:1", false).await;
        pool.initialize().await;

        std::fs::write(
            dir.path().join("accounts.json"),
            serde_json::to_string(&vec![record("a"), record("b")]).unwrap(),
        )
        .unwrap();

        let response = app
            .oneshot(json_request("POST", "/admin/tokens/reload", serde_json::json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["credentials"], 2);
        assert_eq!(json["generation"], 2);
    }

    #[tokio::test]
    async fn rotation_can_be_read_and_updated() {
        let dir = tempfile::tempdir().unwrap();
        let (app, _pool) = admin_app(dir.path(), vec![record("a")], "http://127.0.0.1:1", false).await;

        let response = app
            .clone()
            .oneshot(Request::builder().uri("/admin/rotation").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let json = body_json(response).await;
        assert_eq!(json["strategy"], "round_robin");
        assert_eq!(json["requestCount"], 10);

        let response = app
            .clone()
            .oneshot(json_request(
                "PUT",
                "/admin/rotation",
                serde_json::json!({"strategy": "request_count", "requestCount": 3}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["strategy"], "request_count");
        assert_eq!(json["requestCount"], 3);

        let response = app
            .oneshot(json_request(
                "PUT",
                "/admin/rotation",
                serde_json::json!({"strategy": "random"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = body_json(response).await;
        assert!(
            json["error"]["message"]
                .as_str()
                .unwrap()
                .contains("unknown rotation strategy")
        );
    }

    #[tokio::test]
    async fn pool_status_reports_health() {
        let dir = tempfile::tempdir().unwrap();
        let (app, pool) = admin_app(dir.path(), vec![record("a")], "http://127.0.0.1:1", false).await;
        pool.initialize().await;

        let response = app
            .oneshot(Request::builder().uri("/admin/pool").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let json = body_json(response).await;
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["credentials_total"], 1);
    }

    #[tokio::test]
    async fn init_oauth_returns_consent_url_with_state() {
        let dir = tempfile::tempdir().unwrap();
        let (app, _pool) = admin_app(dir.path(), vec![], "http://127.0.0.1:1", false).await;

        let response = app
            .oneshot(json_request("POST", "/admin/oauth/init", serde_json::json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json = body_json(response).await;
        let url = json["authorization_url"].as_str().unwrap();
        let oauth_state = json["state"].as_str().unwrap();
        assert!(url.starts_with("http://127.0.0.1:1/auth?"), "{url}");
        assert!(url.contains("code_challenge_method=S256"));
        assert!(url.contains(&format!("state={oauth_state}")));
    }

    #[tokio::test]
    async fn complete_without_pending_flow_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (app, _pool) = admin_app(dir.path(), vec![], "http://127.0.0.1:1", false).await;

        let response = app
            .oneshot(json_request(
                "POST",
                "/admin/oauth/complete",
                serde_json::json!({"state": "never-issued", "code": "4/0abc"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    /// Token, userinfo and eligibility endpoints for one authorization.
    fn oauth_upstream(eligible: bool) -> Router {
        Router::new()
            .route(
                "/token",
                post(|| async {
                    Json(serde_json::json!({
                        "access_token": "ya29.authorized",
                        "expires_in": 3599,
                        "refresh_token": "1//authorized",
                    }))
                }),
            )
            .route(
                "/userinfo",
                get(|| async { Json(serde_json::json!({"email": "dev@example.com"})) }),
            )
            .fallback(move || async move {
                if eligible {
                    Json(serde_json::json!({"cloudaicompanionProject": "eligible-project-1"}))
                } else {
                    Json(serde_json::json!({"currentTier": {"id": "free-tier"}}))
                }
            })
    }

    async fn run_authorization(app: Router) -> axum::response::Response {
        let response = app
            .clone()
            .oneshot(json_request("POST", "/admin/oauth/init", serde_json::json!({})))
            .await
            .unwrap();
        let oauth_state = body_json(response).await["state"]
            .as_str()
            .unwrap()
            .to_string();

        app.oneshot(json_request(
            "POST",
            "/admin/oauth/complete",
            serde_json::json!({"state": oauth_state, "code": "4/0abc"}),
        ))
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn complete_oauth_adds_eligible_account() {
        let base = serve(oauth_upstream(true)).await;
        let dir = tempfile::tempdir().unwrap();
        let (app, pool) = admin_app(dir.path(), vec![], &base, false).await;

        let response = run_authorization(app).await;
        assert_eq!(response.status(), StatusCode::CREATED);
        let json = body_json(response).await;
        assert_eq!(json["email"], "dev@example.com");
        assert_eq!(json["projectId"], "eligible-project-1");
        assert_eq!(json["hasQuota"], true);

        let listed = pool.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].refresh_token, "1//authorized");
        assert_eq!(listed[0].project_id.as_deref(), Some("eligible-project-1"));
    }

    #[tokio::test]
    async fn complete_oauth_stores_ineligible_account_without_quota() {
        let base = serve(oauth_upstream(false)).await;
        let dir = tempfile::tempdir().unwrap();
        let (app, pool) = admin_app(dir.path(), vec![], &base, false).await;

        let response = run_authorization(app).await;
        assert_eq!(response.status(), StatusCode::CREATED);
        let json = body_json(response).await;
        assert_eq!(json["hasQuota"], false);
        let project_id = json["projectId"].as_str().unwrap();
        assert_eq!(project_id.split('-').count(), 3, "{project_id}");

        let listed = pool.list().await.unwrap();
        assert!(!listed[0].has_quota);
    }

    #[tokio::test]
    async fn complete_oauth_is_single_use() {
        let base = serve(oauth_upstream(true)).await;
        let dir = tempfile::tempdir().unwrap();
        let (app, _pool) = admin_app(dir.path(), vec![], &base, true).await;

        let response = app
            .clone()
            .oneshot(json_request("POST", "/admin/oauth/init", serde_json::json!({})))
            .await
            .unwrap();
        let oauth_state = body_json(response).await["state"]
            .as_str()
            .unwrap()
            .to_string();
        let complete = serde_json::json!({"state": oauth_state, "code": "4/0abc"});

        let first = app
            .clone()
            .oneshot(json_request("POST", "/admin/oauth/complete", complete.clone()))
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::CREATED);

        let second = app
            .oneshot(json_request("POST", "/admin/oauth/complete", complete))
            .await
            .unwrap();
        assert_eq!(second.status(), StatusCode::BAD_REQUEST);
    }
}
