//! Token redaction for logs and operator-facing output
//!
//! OAuth tokens never appear in full outside the credential store. Logs and
//! admin listings identify a credential by the last few characters only.

/// Number of trailing characters kept when redacting a token.
pub const SUFFIX_LEN: usize = 8;

/// Trailing `SUFFIX_LEN` characters of a token.
///
/// Works on characters rather than bytes so a multibyte token can't split a
/// code point. Tokens shorter than the suffix are returned whole.
pub fn token_suffix(token: &str) -> &str {
    let count = token.chars().count();
    if count <= SUFFIX_LEN {
        return token;
    }
    let skip = count - SUFFIX_LEN;
    match token.char_indices().nth(skip) {
        Some((idx, _)) => &token[idx..],
        None => token,
    }
}

/// Display form of a token: `...abcd1234`, or `N/A` when empty.
pub fn display_suffix(token: &str) -> String {
    if token.is_empty() {
        return "N/A".to_string();
    }
    format!("...{}", token_suffix(token))
}
