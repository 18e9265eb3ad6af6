//! Google OAuth and Cloud Code credential library
//!
//! Provides the credential record and its file store, the OAuth client
//! (refresh, code exchange, PKCE consent URL, user info) and the Cloud Code
//! eligibility check. This crate has no dependency on the pool or the
//! gateway binary and can be tested on its own.
//!
//! Account onboarding:
//! 1. Admin calls `pkce::generate_verifier()` + `pkce::compute_challenge()`
//! 2. User consents via `AuthClient::authorization_url()`
//! 3. Gateway calls `AuthClient::exchange_code()` with the returned code
//! 4. `fetch_user_email()` and `load_code_assist()` label the account
//! 5. The pool stores it through `CredentialStore`

pub mod client;
pub mod constants;
pub mod credentials;
pub mod error;
pub mod pkce;
pub mod project;
pub mod token;

pub use client::{AuthClient, Endpoints, OAuthApp};
pub use constants::*;
pub use credentials::{
    Credential, CredentialPatch, CredentialStore, CredentialSummary, NewCredential, now_millis,
};
pub use error::{Error, Result};
pub use pkce::{compute_challenge, generate_state, generate_verifier};
pub use project::generate_project_id;
pub use token::TokenResponse;
