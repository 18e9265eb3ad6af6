//! Gemini-compatible generation passthrough and model catalogue
//!
//! Accepts `POST /v1beta/models/{model}:generateContent` and
//! `:streamGenerateContent`, wraps the client body in the Cloud Code request
//! envelope, and forwards it with a pooled credential. `GET /v1beta/models`
//! and `GET /v1beta/models/{model}` serve the upstream model catalogue in
//! Gemini's `models.list` shape. Quota and auth rejections feed back into the
//! pool and the request is retried with a freshly acquired credential.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::{Body, Bytes};
use axum::extract::Query;
use axum::http::{HeaderMap, Request, StatusCode, Uri, header};
use axum::response::{IntoResponse, Response};
use cloudcode_auth::Credential;
use common::Secret;
use serde_json::Value;
use token_pool::{ErrorClassification, Pool, classify_status};
use tracing::{debug, error, instrument, warn};

use crate::error::{Error, Result};
use crate::metrics;

/// Largest accepted client body.
const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Client identity reported inside the request envelope.
const ENVELOPE_USER_AGENT: &str = "antigravity";

/// Generation methods every Cloud Code model serves through this gateway.
const SUPPORTED_METHODS: [&str; 2] = ["generateContent", "streamGenerateContent"];

/// Shared state passed to the generation handler
#[derive(Clone)]
pub struct ProxyState {
    pub pool: Arc<Pool>,
    pub client: reqwest::Client,
    pub base_url: String,
    /// Full `fetchAvailableModels` URL.
    pub models_url: String,
    pub user_agent: String,
    pub timeout: Duration,
    pub retry_times: u32,
    pub api_key: Option<Secret<String>>,
}

/// Forward one generation request and record its outcome.
#[instrument(skip_all, fields(request_id = %request_id, target = %target))]
pub async fn generate(
    state: &ProxyState,
    target: &str,
    request: Request<Body>,
    request_id: String,
) -> Response {
    let started = Instant::now();
    let query = query_params(request.uri());

    let (response, mode) = match parse_target(target, query.get("alt").map(String::as_str)) {
        Ok((model, stream)) => {
            let mode = if stream { "stream" } else { "unary" };
            let response = match forward(state, model, stream, &query, request).await {
                Ok(response) => response,
                Err(e) => {
                    warn!(error = %e, "generation request failed");
                    e.to_response(&request_id)
                }
            };
            (response, mode)
        }
        Err(e) => (e.to_response(&request_id), "unary"),
    };

    metrics::record_request(
        response.status().as_u16(),
        mode,
        started.elapsed().as_secs_f64(),
    );
    response
}

/// Serve the model catalogue, or one entry of it when `model` is given.
#[instrument(skip_all, fields(request_id = %request_id, model = model.unwrap_or("*")))]
pub async fn models(
    state: &ProxyState,
    model: Option<&str>,
    request: Request<Body>,
    request_id: String,
) -> Response {
    let started = Instant::now();
    let query = query_params(request.uri());

    let response = match catalogue(state, model, request.headers(), &query).await {
        Ok(response) => response,
        Err(e) => {
            warn!(error = %e, "model listing failed");
            e.to_response(&request_id)
        }
    };

    metrics::record_request(
        response.status().as_u16(),
        "models",
        started.elapsed().as_secs_f64(),
    );
    response
}

async fn catalogue(
    state: &ProxyState,
    model: Option<&str>,
    headers: &HeaderMap,
    query: &HashMap<String, String>,
) -> Result<Response> {
    authorize(state, headers, query)?;

    let attempts = state.retry_times.saturating_add(1);
    for attempt in 0..attempts {
        let Some(credential) = state.pool.acquire().await else {
            error!(attempt, "no usable credential in pool");
            return Err(Error::NoCredential);
        };
        debug!(attempt, credential = %credential.label(), "fetching model catalogue");

        let upstream_response = state
            .client
            .post(&state.models_url)
            .bearer_auth(&credential.access_token)
            .header(header::USER_AGENT, &state.user_agent)
            .timeout(state.timeout)
            .json(&serde_json::json!({ "project": credential.project_id }))
            .send()
            .await
            .map_err(|e| send_error(e, state.timeout))?;

        let status = upstream_response.status();
        if status.is_success() {
            let payload: Value = upstream_response.json().await.map_err(|e| {
                metrics::record_upstream_error("invalid_response");
                Error::Upstream(format!("invalid model catalogue: {e}"))
            })?;
            let listed = gemini_models(&payload);
            return match model {
                None => Ok(axum::Json(serde_json::json!({ "models": listed })).into_response()),
                Some(id) => {
                    let name = format!("models/{}", id.trim_start_matches("models/"));
                    listed
                        .into_iter()
                        .find(|m| m["name"] == name.as_str())
                        .map(|m| axum::Json(m).into_response())
                        .ok_or_else(|| Error::NotFound(format!("model not found: {id}")))
                }
            };
        }

        let rejection = read_rejection(upstream_response).await;
        let Some(reason) = report_rejection(state, &credential, status, &rejection).await else {
            return Ok(passthrough(status, rejection));
        };
        if attempt + 1 < attempts {
            metrics::record_retry(reason);
            continue;
        }
        warn!(attempts, "retries exhausted");
        return Ok(passthrough(status, rejection));
    }

    Err(Error::Internal("unexpected retry exhaustion".into()))
}

async fn forward(
    state: &ProxyState,
    model: &str,
    stream: bool,
    query: &HashMap<String, String>,
    request: Request<Body>,
) -> Result<Response> {
    authorize(state, request.headers(), query)?;

    let body = axum::body::to_bytes(request.into_body(), MAX_BODY_BYTES)
        .await
        .map_err(|e| Error::InvalidRequest(format!("invalid request body: {e}")))?;
    let body: Value = serde_json::from_slice(&body)
        .map_err(|e| Error::InvalidRequest(format!("request body is not valid JSON: {e}")))?;
    if !body.is_object() {
        return Err(Error::InvalidRequest(
            "request body must be a JSON object".into(),
        ));
    }

    let url = upstream_url(&state.base_url, stream);
    let attempts = state.retry_times.saturating_add(1);

    for attempt in 0..attempts {
        let Some(credential) = state.pool.acquire().await else {
            error!(attempt, "no usable credential in pool");
            return Err(Error::NoCredential);
        };
        debug!(attempt, credential = %credential.label(), model, stream, "forwarding to Cloud Code");

        let envelope = build_envelope(body.clone(), model, &credential);
        let upstream_response = state
            .client
            .post(&url)
            .bearer_auth(&credential.access_token)
            .header(header::USER_AGENT, &state.user_agent)
            .timeout(state.timeout)
            .json(&envelope)
            .send()
            .await
            .map_err(|e| send_error(e, state.timeout))?;

        let status = upstream_response.status();
        if status.is_success() {
            return if stream {
                Ok(stream_response(upstream_response))
            } else {
                unary_response(upstream_response).await
            };
        }

        let rejection = read_rejection(upstream_response).await;
        let Some(reason) = report_rejection(state, &credential, status, &rejection).await else {
            return Ok(passthrough(status, rejection));
        };
        if attempt + 1 < attempts {
            metrics::record_retry(reason);
            continue;
        }
        warn!(attempts, "retries exhausted");
        return Ok(passthrough(status, rejection));
    }

    // retry_times + 1 >= 1, so the loop always returns
    Err(Error::Internal("unexpected retry exhaustion".into()))
}

fn authorize(
    state: &ProxyState,
    headers: &HeaderMap,
    query: &HashMap<String, String>,
) -> Result<()> {
    match &state.api_key {
        None => Ok(()),
        Some(expected) => match presented_key(headers, query) {
            Some(key) if expected.matches(key) => Ok(()),
            _ => Err(Error::Unauthorized),
        },
    }
}

fn send_error(e: reqwest::Error, timeout: Duration) -> Error {
    if e.is_timeout() {
        metrics::record_upstream_error("timeout");
        error!(error = %e, "upstream timeout");
        Error::UpstreamTimeout(timeout)
    } else {
        metrics::record_upstream_error("connection");
        error!(error = %e, "upstream request failed");
        Error::Upstream(e.to_string())
    }
}

async fn read_rejection(upstream: reqwest::Response) -> Bytes {
    match upstream.bytes().await {
        Ok(body) => body,
        Err(e) => {
            warn!(error = %e, "failed to read upstream error body");
            Bytes::new()
        }
    }
}

/// Feed a rejected attempt back into the pool.
///
/// Returns the retry reason, or `None` when the status should reach the
/// client unchanged.
async fn report_rejection(
    state: &ProxyState,
    credential: &Credential,
    status: StatusCode,
    body: &[u8],
) -> Option<&'static str> {
    let reason = match classify_status(status.as_u16(), &String::from_utf8_lossy(body)) {
        ErrorClassification::QuotaExceeded => {
            warn!(credential = %credential.label(), "quota exhausted upstream, rotating");
            state.pool.mark_quota_exhausted(credential).await;
            "quota_exceeded"
        }
        ErrorClassification::Permanent => {
            warn!(credential = %credential.label(), status = status.as_u16(), "credential rejected upstream, disabling");
            state.pool.disable(credential).await;
            "permanent"
        }
        ErrorClassification::Transient => {
            metrics::record_upstream_error("transient");
            warn!(status = status.as_u16(), "upstream error passed through");
            return None;
        }
    };
    metrics::record_upstream_error(reason);
    Some(reason)
}

/// Split `gemini-2.5-pro:generateContent` into the model and whether the
/// caller wants server-sent events.
fn parse_target<'a>(target: &'a str, alt: Option<&str>) -> Result<(&'a str, bool)> {
    match target.split_once(':') {
        Some((model, "generateContent")) if !model.is_empty() => Ok((model, alt == Some("sse"))),
        Some((model, "streamGenerateContent")) if !model.is_empty() => Ok((model, true)),
        _ => Err(Error::NotFound(format!("unsupported model action: {target}"))),
    }
}

fn query_params(uri: &Uri) -> HashMap<String, String> {
    Query::<HashMap<String, String>>::try_from_uri(uri)
        .map(|Query(params)| params)
        .unwrap_or_default()
}

/// Client key from `Authorization: Bearer`, `x-goog-api-key` or `?key=`.
fn presented_key<'a>(headers: &'a HeaderMap, query: &'a HashMap<String, String>) -> Option<&'a str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .or_else(|| {
            headers
                .get("x-goog-api-key")
                .and_then(|v| v.to_str().ok())
        })
        .or_else(|| query.get("key").map(String::as_str))
}

fn upstream_url(base_url: &str, stream: bool) -> String {
    let base = base_url.trim_end_matches('/');
    if stream {
        format!("{base}/v1internal:streamGenerateContent?alt=sse")
    } else {
        format!("{base}/v1internal:generateContent")
    }
}

/// Wrap a Gemini request body in the Cloud Code envelope.
///
/// The caller guarantees `request` is a JSON object.
fn build_envelope(mut request: Value, model: &str, credential: &Credential) -> Value {
    if let Some(fields) = request.as_object_mut() {
        fields.insert(
            "sessionId".into(),
            Value::String(credential.session_id.clone()),
        );
    }
    serde_json::json!({
        "project": credential.project_id,
        "requestId": format!("agent-{}", uuid::Uuid::new_v4()),
        "request": request,
        "model": model,
        "userAgent": ENVELOPE_USER_AGENT,
    })
}

fn stream_response(upstream: reqwest::Response) -> Response {
    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "text/event-stream"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        Body::from_stream(upstream.bytes_stream()),
    )
        .into_response()
}

async fn unary_response(upstream: reqwest::Response) -> Result<Response> {
    let payload: Value = upstream.json().await.map_err(|e| {
        metrics::record_upstream_error("invalid_response");
        Error::Upstream(format!("invalid upstream response: {e}"))
    })?;
    Ok(axum::Json(unwrap_envelope(payload)).into_response())
}

/// Convert the `fetchAvailableModels` answer into Gemini model entries.
///
/// Cloud Code keys `models` by id; an array of `{name}` or `{id}` objects is
/// accepted too. Entries come out sorted by id.
fn gemini_models(payload: &Value) -> Vec<Value> {
    let mut entries: Vec<(String, Value)> = match &payload["models"] {
        Value::Object(models) => models
            .iter()
            .map(|(id, meta)| (id.clone(), meta.clone()))
            .collect(),
        Value::Array(models) => models
            .iter()
            .filter_map(|meta| {
                let id = meta["name"].as_str().or_else(|| meta["id"].as_str())?;
                Some((id.trim_start_matches("models/").to_string(), meta.clone()))
            })
            .collect(),
        _ => Vec::new(),
    };
    entries.sort_by(|a, b| a.0.cmp(&b.0));

    entries
        .into_iter()
        .map(|(id, meta)| {
            let display_name = meta["displayName"].as_str().unwrap_or(&id).to_string();
            let mut entry = serde_json::json!({
                "name": format!("models/{id}"),
                "version": "001",
                "displayName": display_name,
                "supportedGenerationMethods": SUPPORTED_METHODS,
            });
            for (from, to) in [
                ("description", "description"),
                ("inputTokenLimit", "inputTokenLimit"),
                ("outputTokenLimit", "outputTokenLimit"),
                ("maxTokens", "inputTokenLimit"),
                ("maxOutputTokens", "outputTokenLimit"),
            ] {
                if let Some(value) = meta.get(from).filter(|v| !v.is_null()) {
                    entry[to] = value.clone();
                }
            }
            entry
        })
        .collect()
}

/// Cloud Code answers `{"response": {...}}`; clients expect the inner object.
fn unwrap_envelope(payload: Value) -> Value {
    match payload {
        Value::Object(mut fields) => match fields.remove("response") {
            Some(inner) => inner,
            None => Value::Object(fields),
        },
        other => other,
    }
}

fn passthrough(status: StatusCode, body: Bytes) -> Response {
    (
        status,
        [(header::CONTENT_TYPE, "application/json")],
        body,
    )
        .into_response()
}
