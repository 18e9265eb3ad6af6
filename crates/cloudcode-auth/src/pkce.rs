//! PKCE (Proof Key for Code Exchange) implementation per RFC 7636
//!
//! Generates the code verifier and S256 challenge used when an operator
//! authorizes a new account. The verifier stays server-side until the code
//! exchange; the challenge goes into the authorization URL.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngExt;
use sha2::{Digest, Sha256};

use crate::client::AuthClient;
use crate::constants::SCOPES;

/// Generate a cryptographically random PKCE code verifier.
///
/// 32 random bytes encoded as URL-safe base64 without padding: 43 characters,
/// the minimum length RFC 7636 allows (range 43-128).
pub fn generate_verifier() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Random opaque value for the `state` parameter.
pub fn generate_state() -> String {
    let mut bytes = [0u8; 16];
    rand::rng().fill(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Compute the S256 code challenge from a verifier.
///
/// `challenge = BASE64URL(SHA256(verifier))`
pub fn compute_challenge(verifier: &str) -> String {
    let hash = Sha256::digest(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(hash)
}

impl AuthClient {
    /// Build the consent URL for a new account.
    ///
    /// `access_type=offline` plus `prompt=consent` makes Google issue a
    /// refresh token even when the account has authorized this client before.
    pub fn authorization_url(&self, state: &str, challenge: &str) -> String {
        let scope = SCOPES.join(" ");
        let params: [(&str, &str); 9] = [
            ("access_type", "offline"),
            ("client_id", self.app.client_id.as_str()),
            ("prompt", "consent"),
            ("redirect_uri", self.app.redirect_uri.as_str()),
            ("response_type", "code"),
            ("scope", scope.as_str()),
            ("state", state),
            ("code_challenge", challenge),
            ("code_challenge_method", "S256"),
        ];
        let query = params
            .iter()
            .map(|(k, v)| format!("{k}={}", urlencoded(v)))
            .collect::<Vec<_>>()
            .join("&");
        format!("{}?{query}", self.endpoints.authorize)
    }
}

/// Percent-encode a query parameter value (RFC 3986 unreserved set kept).
fn urlencoded(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}
