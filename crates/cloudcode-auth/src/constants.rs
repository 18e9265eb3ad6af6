//! Google OAuth and Cloud Code endpoint constants
//!
//! The client ID identifies the public installed-app OAuth client used by the
//! Cloud Code IDE integration. The matching client secret is supplied through
//! configuration, never compiled in.

/// Public OAuth client ID of the Cloud Code IDE integration
pub const DEFAULT_CLIENT_ID: &str =
    "1071006060591-tmhssin2h21lcre235vtolojh4g403ep.apps.googleusercontent.com";

/// Token endpoint for code exchange and token refresh
pub const TOKEN_ENDPOINT: &str = "https://oauth2.googleapis.com/token";

/// Authorization endpoint for the consent screen
pub const AUTHORIZE_ENDPOINT: &str = "https://accounts.google.com/o/oauth2/v2/auth";

/// Profile endpoint used to label a freshly authorized account
pub const USERINFO_ENDPOINT: &str = "https://www.googleapis.com/oauth2/v2/userinfo";

/// Eligibility check; returns the Cloud AI companion project for the account
pub const LOAD_CODE_ASSIST_ENDPOINT: &str =
    "https://daily-cloudcode-pa.sandbox.googleapis.com/v1internal:loadCodeAssist";

/// Default redirect for the operator-driven authorization flow
pub const DEFAULT_REDIRECT_URI: &str = "http://localhost:8045/oauth-callback";

/// OAuth scopes required for content generation and eligibility checks
pub const SCOPES: &[&str] = &[
    "https://www.googleapis.com/auth/cloud-platform",
    "https://www.googleapis.com/auth/userinfo.email",
    "https://www.googleapis.com/auth/userinfo.profile",
    "https://www.googleapis.com/auth/cclog",
    "https://www.googleapis.com/auth/experimentsandconfigs",
];

/// User-Agent presented to the Cloud Code endpoints
pub const CLOUDCODE_USER_AGENT: &str = "antigravity/1.11.9 windows/amd64";

/// Access-token lifetime assumed when an added credential omits `expires_in`
pub const DEFAULT_EXPIRES_IN_SECS: u64 = 3599;
