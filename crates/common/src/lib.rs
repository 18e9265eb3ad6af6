//! Common types shared by the gateway crates

mod error;
mod redact;
mod secret;

pub use error::{Error, Result};
pub use redact::{SUFFIX_LEN, display_suffix, token_suffix};
pub use secret::Secret;
