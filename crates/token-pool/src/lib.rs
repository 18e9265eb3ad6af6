//! Credential pool for the Cloud Code gateway
//!
//! Owns the set of OAuth credentials, decides which one serves the next
//! request, refreshes expired ones, reacts to quota exhaustion and mirrors
//! every change into the credential file.
//!
//! Credential flow:
//! 1. Gateway calls `Pool::acquire()` → lazy load, rotation, refresh/eligibility
//! 2. Upstream 429 → `Pool::mark_quota_exhausted()`
//! 3. Upstream 401/403 → `Pool::disable()`
//! 4. Background task calls `Pool::refresh_expired()` periodically
//! 5. Admin API calls `add`/`update`/`remove`/`reload`/`update_rotation_config`

pub mod error;
pub mod lifecycle;
pub mod persist;
pub mod pool;
pub mod quota;
pub mod refresh;
pub mod rotation;
pub mod upstream;

#[cfg(test)]
mod testing;

pub use error::{Error, Result};
pub use lifecycle::{Failure, Lifecycle, Prepared, is_expired};
pub use pool::{Pool, PoolOptions, RefreshSummary};
pub use quota::{ErrorClassification, classify_status};
pub use refresh::spawn_refresh_task;
pub use rotation::{DEFAULT_REQUEST_COUNT, RotationSnapshot, Strategy, UnknownStrategy};
pub use upstream::{Upstream, UpstreamFuture};
