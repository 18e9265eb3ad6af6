//! In-memory stand-in for the authorization server

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use cloudcode_auth::{Credential, Error, TokenResponse, now_millis};

use crate::upstream::{Upstream, UpstreamFuture};

/// Scriptable upstream that counts calls.
///
/// Refresh succeeds with `ya29.refreshed-<refresh token>` unless a failure
/// status was scripted for that refresh token. Every access token resolves
/// to a project unless marked ineligible.
#[derive(Default)]
pub struct MockUpstream {
    pub refresh_calls: AtomicUsize,
    pub project_calls: AtomicUsize,
    refresh_failures: Mutex<HashMap<String, u16>>,
    ineligible: Mutex<HashSet<String>>,
    refresh_delay: Mutex<Duration>,
    refresh_expires_in: Mutex<Option<u64>>,
}

impl MockUpstream {
    pub fn fail_refresh(&self, refresh_token: &str, status: u16) {
        self.refresh_failures
            .lock()
            .unwrap()
            .insert(refresh_token.to_string(), status);
    }

    pub fn mark_ineligible(&self, access_token: &str) {
        self.ineligible
            .lock()
            .unwrap()
            .insert(access_token.to_string());
    }

    pub fn delay_refresh(&self, delay: Duration) {
        *self.refresh_delay.lock().unwrap() = delay;
    }

    /// Lifetime handed out by successful refreshes (default 3599s).
    pub fn refresh_lifetime(&self, secs: u64) {
        *self.refresh_expires_in.lock().unwrap() = Some(secs);
    }

    pub fn refreshes(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    pub fn project_lookups(&self) -> usize {
        self.project_calls.load(Ordering::SeqCst)
    }
}

impl Upstream for MockUpstream {
    fn refresh<'a>(&'a self, refresh_token: &'a str) -> UpstreamFuture<'a, TokenResponse> {
        Box::pin(async move {
            self.refresh_calls.fetch_add(1, Ordering::SeqCst);
            let delay = *self.refresh_delay.lock().unwrap();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let failure = self.refresh_failures.lock().unwrap().get(refresh_token).copied();
            if let Some(status) = failure {
                return Err(Error::Upstream {
                    status,
                    message: "scripted failure".into(),
                });
            }
            let expires_in = self.refresh_expires_in.lock().unwrap().unwrap_or(3599);
            Ok(TokenResponse {
                access_token: format!("ya29.refreshed-{refresh_token}"),
                expires_in,
                refresh_token: Some("1//rotated-should-be-ignored".into()),
            })
        })
    }

    fn resolve_project<'a>(&'a self, access_token: &'a str) -> UpstreamFuture<'a, Option<String>> {
        Box::pin(async move {
            self.project_calls.fetch_add(1, Ordering::SeqCst);
            if self.ineligible.lock().unwrap().contains(access_token) {
                return Ok(None);
            }
            Ok(Some("proj-resolved".to_string()))
        })
    }
}

/// Valid credential with a resolved project.
pub fn fresh(name: &str) -> Credential {
    Credential {
        access_token: format!("ya29.{name}"),
        refresh_token: format!("1//{name}"),
        expires_in: Some(3599),
        timestamp: Some(now_millis()),
        enable: true,
        has_quota: true,
        project_id: Some(format!("proj-{name}")),
        email: None,
        session_id: String::new(),
    }
}

/// Credential whose freshness can't be proven.
pub fn expired(name: &str) -> Credential {
    Credential {
        timestamp: None,
        ..fresh(name)
    }
}
