//! HTTP client for the Google authorization server and Cloud Code endpoints
//!
//! One `AuthClient` is built at startup and shared. Every request it sends is
//! bounded by the configured timeout, and upstream failures come back as
//! classified [`Error`] values carrying the status code.

use std::time::Duration;

use common::Secret;

use crate::constants::{
    AUTHORIZE_ENDPOINT, DEFAULT_CLIENT_ID, DEFAULT_REDIRECT_URI, LOAD_CODE_ASSIST_ENDPOINT,
    TOKEN_ENDPOINT, USERINFO_ENDPOINT,
};
use crate::error::{Error, Result, upstream_message};

/// Endpoint URLs. Overridable so tests and staging can point elsewhere.
#[derive(Debug, Clone)]
pub struct Endpoints {
    pub token: String,
    pub authorize: String,
    pub userinfo: String,
    pub load_code_assist: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            token: TOKEN_ENDPOINT.to_string(),
            authorize: AUTHORIZE_ENDPOINT.to_string(),
            userinfo: USERINFO_ENDPOINT.to_string(),
            load_code_assist: LOAD_CODE_ASSIST_ENDPOINT.to_string(),
        }
    }
}

/// Registered OAuth application identity.
#[derive(Debug, Clone)]
pub struct OAuthApp {
    pub client_id: String,
    pub client_secret: Secret<String>,
    pub redirect_uri: String,
}

impl OAuthApp {
    /// App using the public Cloud Code client ID and default redirect.
    pub fn with_secret(client_secret: Secret<String>) -> Self {
        Self {
            client_id: DEFAULT_CLIENT_ID.to_string(),
            client_secret,
            redirect_uri: DEFAULT_REDIRECT_URI.to_string(),
        }
    }
}

/// OAuth and eligibility client.
#[derive(Debug, Clone)]
pub struct AuthClient {
    pub(crate) http: reqwest::Client,
    pub(crate) app: OAuthApp,
    pub(crate) endpoints: Endpoints,
    pub(crate) timeout: Duration,
}

impl AuthClient {
    pub fn new(
        http: reqwest::Client,
        app: OAuthApp,
        endpoints: Endpoints,
        timeout: Duration,
    ) -> Self {
        Self {
            http,
            app,
            endpoints,
            timeout,
        }
    }

    pub fn app(&self) -> &OAuthApp {
        &self.app
    }

    pub fn endpoints(&self) -> &Endpoints {
        &self.endpoints
    }

    /// Send a request and return the successful response.
    ///
    /// Transport errors become `Http` or `Timeout`; a non-2xx status becomes
    /// `Upstream` with the message pulled from the body.
    pub(crate) async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        let response = request
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        Err(Error::Upstream {
            status: status.as_u16(),
            message: upstream_message(&body),
        })
    }

    /// Send a request and decode a successful JSON body.
    pub(crate) async fn send_json<T: serde::de::DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<T> {
        let response = self.send(request).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| self.decode_error(e))
    }

    fn transport_error(&self, e: reqwest::Error) -> Error {
        if e.is_timeout() {
            Error::Timeout(self.timeout)
        } else {
            Error::Http(e.to_string())
        }
    }

    fn decode_error(&self, e: reqwest::Error) -> Error {
        if e.is_timeout() {
            Error::Timeout(self.timeout)
        } else {
            Error::InvalidResponse(e.to_string())
        }
    }
}
