//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! Secrets are never read from the TOML itself: the client API key comes from
//! `API_KEY` and the OAuth client secret from `OAUTH_CLIENT_SECRET` or
//! `oauth.client_secret_file`.

use cloudcode_auth::{
    AUTHORIZE_ENDPOINT, CLOUDCODE_USER_AGENT, DEFAULT_CLIENT_ID, DEFAULT_REDIRECT_URI, Endpoints,
    LOAD_CODE_ASSIST_ENDPOINT, OAuthApp, TOKEN_ENDPOINT, USERINFO_ENDPOINT,
};
use common::Secret;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use token_pool::{DEFAULT_REQUEST_COUNT, PoolOptions, Strategy};

const DEFAULT_CONFIG_FILE: &str = "cloudcode-gateway.toml";

/// Root configuration
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub upstream: UpstreamConfig,
    pub oauth: OAuthConfig,
    pub credentials: CredentialsConfig,
    pub rotation: RotationConfig,
    /// Client API key from `API_KEY`. Unset means the gateway is open.
    #[serde(skip)]
    pub api_key: Option<Secret<String>>,
}

/// Listener settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub admin_listen_addr: SocketAddr,
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8045)),
            admin_listen_addr: SocketAddr::from(([127, 0, 0, 1], 9090)),
            max_connections: 1000,
        }
    }
}

/// Cloud Code generation endpoint settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    pub base_url: String,
    /// Model catalogue endpoint, called as-is.
    pub models_url: String,
    pub user_agent: String,
    pub timeout_secs: u64,
    /// Extra attempts after a quota or auth rejection, each with a fresh credential.
    pub retry_times: u32,
    pub skip_project_id_fetch: bool,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: "https://daily-cloudcode-pa.sandbox.googleapis.com".into(),
            models_url:
                "https://daily-cloudcode-pa.sandbox.googleapis.com/v1internal:fetchAvailableModels"
                    .into(),
            user_agent: CLOUDCODE_USER_AGENT.into(),
            timeout_secs: 300,
            retry_times: 3,
            skip_project_id_fetch: false,
        }
    }
}

/// OAuth application and endpoint overrides
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct OAuthConfig {
    pub client_id: String,
    #[serde(skip)]
    pub client_secret: Option<Secret<String>>,
    /// Path to a file containing the client secret (alternative to OAUTH_CLIENT_SECRET)
    pub client_secret_file: Option<PathBuf>,
    pub redirect_uri: String,
    pub token_url: String,
    pub authorize_url: String,
    pub userinfo_url: String,
    pub load_code_assist_url: String,
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            client_id: DEFAULT_CLIENT_ID.into(),
            client_secret: None,
            client_secret_file: None,
            redirect_uri: DEFAULT_REDIRECT_URI.into(),
            token_url: TOKEN_ENDPOINT.into(),
            authorize_url: AUTHORIZE_ENDPOINT.into(),
            userinfo_url: USERINFO_ENDPOINT.into(),
            load_code_assist_url: LOAD_CODE_ASSIST_ENDPOINT.into(),
        }
    }
}

/// Credential file and background refresh
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct CredentialsConfig {
    pub path: PathBuf,
    /// Seconds between background refresh passes; 0 disables the task.
    pub refresh_interval_secs: u64,
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/accounts.json"),
            refresh_interval_secs: 0,
        }
    }
}

/// Initial rotation policy. Changes made through the admin API are not written back.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct RotationConfig {
    pub strategy: Strategy,
    pub request_count: u32,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            strategy: Strategy::RoundRobin,
            request_count: DEFAULT_REQUEST_COUNT,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    ///
    /// Client secret resolution order:
    /// 1. OAUTH_CLIENT_SECRET env var
    /// 2. client_secret_file path from config
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;
        config.validate()?;

        if let Ok(key) = std::env::var("API_KEY") {
            let key = key.trim().to_owned();
            if !key.is_empty() {
                config.api_key = Some(Secret::new(key));
            }
        }

        if let Ok(secret) = std::env::var("OAUTH_CLIENT_SECRET") {
            config.oauth.client_secret = Some(Secret::new(secret));
        } else if let Some(ref secret_file) = config.oauth.client_secret_file {
            let secret = std::fs::read_to_string(secret_file).map_err(|e| {
                common::Error::Config(format!(
                    "failed to read client_secret_file {}: {e}",
                    secret_file.display()
                ))
            })?;
            let secret = secret.trim().to_owned();
            if !secret.is_empty() {
                config.oauth.client_secret = Some(Secret::new(secret));
            }
        }

        Ok(config)
    }

    fn validate(&self) -> common::Result<()> {
        let urls = [
            ("upstream.base_url", &self.upstream.base_url),
            ("upstream.models_url", &self.upstream.models_url),
            ("oauth.redirect_uri", &self.oauth.redirect_uri),
            ("oauth.token_url", &self.oauth.token_url),
            ("oauth.authorize_url", &self.oauth.authorize_url),
            ("oauth.userinfo_url", &self.oauth.userinfo_url),
            ("oauth.load_code_assist_url", &self.oauth.load_code_assist_url),
        ];
        for (name, url) in urls {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(common::Error::Config(format!(
                    "{name} must start with http:// or https://, got: {url}"
                )));
            }
        }

        if self.upstream.timeout_secs == 0 {
            return Err(common::Error::Config(
                "upstream.timeout_secs must be greater than 0".into(),
            ));
        }

        if self.server.max_connections == 0 {
            return Err(common::Error::Config(
                "server.max_connections must be greater than 0".into(),
            ));
        }

        if self.rotation.request_count == 0 {
            return Err(common::Error::Config(
                "rotation.request_count must be greater than 0".into(),
            ));
        }

        Ok(())
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from(DEFAULT_CONFIG_FILE)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.upstream.timeout_secs)
    }

    pub fn endpoints(&self) -> Endpoints {
        Endpoints {
            token: self.oauth.token_url.clone(),
            authorize: self.oauth.authorize_url.clone(),
            userinfo: self.oauth.userinfo_url.clone(),
            load_code_assist: self.oauth.load_code_assist_url.clone(),
        }
    }

    /// OAuth app identity, `None` until a client secret is configured.
    pub fn oauth_app(&self) -> Option<OAuthApp> {
        let client_secret = self.oauth.client_secret.clone()?;
        Some(OAuthApp {
            client_id: self.oauth.client_id.clone(),
            client_secret,
            redirect_uri: self.oauth.redirect_uri.clone(),
        })
    }

    pub fn pool_options(&self) -> PoolOptions {
        PoolOptions {
            strategy: self.rotation.strategy,
            request_count: self.rotation.request_count,
            request_timeout: self.timeout(),
            skip_project_validation: self.upstream.skip_project_id_fetch,
        }
    }
}
