//! Per-credential lifecycle: expiry, refresh and project resolution
//!
//! Upstream errors are classified here, at the boundary, into
//! [`Failure::Permanent`] or [`Failure::Transient`]. The pool never looks at
//! transport errors or status codes itself.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use cloudcode_auth::{Credential, generate_project_id, now_millis};
use tracing::{debug, info};

use crate::upstream::Upstream;

/// Refresh this long before the computed expiry.
pub const REFRESH_BUFFER: Duration = Duration::from_secs(5 * 60);

/// Whether `credential` must be refreshed before use.
///
/// A credential without `timestamp` or `expires_in` counts as expired: its
/// freshness can't be proven.
pub fn is_expired(credential: &Credential, now_ms: u64) -> bool {
    match credential.expires_at() {
        Some(expires_at) => {
            now_ms >= expires_at.saturating_sub(REFRESH_BUFFER.as_millis() as u64)
        }
        None => true,
    }
}

/// Classified lifecycle failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Failure {
    /// Grant rejected; the credential will never work again.
    #[error("credential rejected: {0}")]
    Permanent(String),

    /// Network, timeout or server trouble; try again later.
    #[error("transient failure: {0}")]
    Transient(String),
}

impl From<cloudcode_auth::Error> for Failure {
    fn from(e: cloudcode_auth::Error) -> Self {
        if e.is_permanent() {
            Failure::Permanent(e.to_string())
        } else {
            Failure::Transient(e.to_string())
        }
    }
}

/// Outcome of preparing a credential for use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Prepared {
    /// Usable now. `changed` is set when the record was mutated and needs persisting.
    Ready { changed: bool },
    /// The account is not eligible for Cloud Code.
    Disable,
}

/// Lifecycle operations bound to one upstream and timeout.
pub struct Lifecycle {
    upstream: Arc<dyn Upstream>,
    timeout: Duration,
    skip_project_validation: bool,
}

impl Lifecycle {
    pub fn new(upstream: Arc<dyn Upstream>, timeout: Duration, skip_project_validation: bool) -> Self {
        Self {
            upstream,
            timeout,
            skip_project_validation,
        }
    }

    /// Exchange the refresh token and update the credential in place.
    ///
    /// The refresh token itself never changes, even if the response carries
    /// a new one.
    pub async fn refresh(&self, credential: &mut Credential) -> Result<(), Failure> {
        debug!(credential = %credential.label(), "refreshing access token");
        let response = self
            .bounded(self.upstream.refresh(&credential.refresh_token))
            .await?;
        credential.access_token = response.access_token;
        credential.expires_in = Some(response.expires_in);
        credential.timestamp = Some(now_millis());
        Ok(())
    }

    /// Project id for the credential, `None` when the account is ineligible.
    pub async fn resolve_project_id(&self, credential: &Credential) -> Result<Option<String>, Failure> {
        if self.skip_project_validation {
            let project_id = generate_project_id();
            info!(credential = %credential.label(), project_id = %project_id, "using generated project id");
            return Ok(Some(project_id));
        }
        self.bounded(self.upstream.resolve_project(&credential.access_token))
            .await
    }

    /// Refresh if expired, then resolve the project id if missing.
    pub async fn prepare(&self, credential: &mut Credential) -> Result<Prepared, Failure> {
        let mut changed = false;
        if is_expired(credential, now_millis()) {
            self.refresh(credential).await?;
            changed = true;
        }

        if credential.project_id.is_none() {
            match self.resolve_project_id(credential).await? {
                Some(project_id) => {
                    credential.project_id = Some(project_id);
                    changed = true;
                }
                None => return Ok(Prepared::Disable),
            }
        }

        Ok(Prepared::Ready { changed })
    }

    async fn bounded<T>(
        &self,
        call: impl Future<Output = cloudcode_auth::Result<T>>,
    ) -> Result<T, Failure> {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result.map_err(Failure::from),
            Err(_) => Err(Failure::Transient(format!(
                "upstream call timed out after {:?}",
                self.timeout
            ))),
        }
    }
}
