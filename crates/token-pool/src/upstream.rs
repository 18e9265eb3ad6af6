//! Seam between the pool and the authorization server
//!
//! The pool only needs two upstream calls: the refresh grant and the
//! eligibility check. Putting them behind a trait keeps the rotation and
//! lifecycle logic testable without a network.
//!
//! Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility
//! (`Arc<dyn Upstream>`).

use std::future::Future;
use std::pin::Pin;

use cloudcode_auth::{AuthClient, TokenResponse};

/// Boxed future returned by [`Upstream`] calls.
pub type UpstreamFuture<'a, T> =
    Pin<Box<dyn Future<Output = cloudcode_auth::Result<T>> + Send + 'a>>;

/// Calls the pool makes to the authorization server.
pub trait Upstream: Send + Sync {
    /// Exchange a refresh token for a new access token.
    fn refresh<'a>(&'a self, refresh_token: &'a str) -> UpstreamFuture<'a, TokenResponse>;

    /// Companion project for the account, `None` when it is not eligible.
    fn resolve_project<'a>(&'a self, access_token: &'a str) -> UpstreamFuture<'a, Option<String>>;
}

impl Upstream for AuthClient {
    fn refresh<'a>(&'a self, refresh_token: &'a str) -> UpstreamFuture<'a, TokenResponse> {
        Box::pin(self.refresh_token(refresh_token))
    }

    fn resolve_project<'a>(&'a self, access_token: &'a str) -> UpstreamFuture<'a, Option<String>> {
        Box::pin(self.load_code_assist(access_token))
    }
}
