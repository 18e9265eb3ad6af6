//! Credential records and the credential file
//!
//! The credential file is a flat JSON array of account records. The refresh
//! token is each record's identity: updates, deletes and merges all key on it.
//!
//! All writes use atomic temp-file + rename so a reader never observes a
//! partially written file. A tokio Mutex serializes writes inside the process
//! so a merge's read-modify-write can't interleave with another write.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::constants::DEFAULT_EXPIRES_IN_SECS;
use crate::error::{Error, Result};

/// Current wall-clock time as unix milliseconds.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn default_true() -> bool {
    true
}

/// One authorized account's usable state.
///
/// `timestamp` is the issue time of `access_token` in unix milliseconds and
/// `expires_in` its lifetime in seconds; either may be missing on records
/// written by hand, in which case the token counts as expired.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub access_token: String,
    pub refresh_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
    #[serde(default = "default_true")]
    pub enable: bool,
    #[serde(rename = "hasQuota", default = "default_true")]
    pub has_quota: bool,
    #[serde(rename = "projectId", default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// Per-load session key for downstream caches. Never persisted.
    #[serde(skip)]
    pub session_id: String,
}

impl Credential {
    /// Absolute expiry of the access token in unix milliseconds.
    pub fn expires_at(&self) -> Option<u64> {
        let issued = self.timestamp?;
        let ttl = self.expires_in?;
        Some(issued.saturating_add(ttl.saturating_mul(1000)))
    }

    /// Redacted identifier for logs: trailing characters of the refresh token.
    pub fn label(&self) -> String {
        common::display_suffix(&self.refresh_token)
    }

    /// Operator-facing view with the access token cut down to a suffix.
    pub fn summary(&self) -> CredentialSummary {
        CredentialSummary {
            refresh_token: self.refresh_token.clone(),
            access_token_suffix: common::display_suffix(&self.access_token),
            expires_in: self.expires_in,
            timestamp: self.timestamp,
            enable: self.enable,
            has_quota: self.has_quota,
            project_id: self.project_id.clone(),
            email: self.email.clone(),
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("refresh_token", &self.label())
            .field("access_token", &common::display_suffix(&self.access_token))
            .field("expires_in", &self.expires_in)
            .field("timestamp", &self.timestamp)
            .field("enable", &self.enable)
            .field("has_quota", &self.has_quota)
            .field("project_id", &self.project_id)
            .field("email", &self.email)
            .finish()
    }
}

/// Listing entry returned to operators.
#[derive(Debug, Clone, Serialize)]
pub struct CredentialSummary {
    pub refresh_token: String,
    pub access_token_suffix: String,
    pub expires_in: Option<u64>,
    pub timestamp: Option<u64>,
    pub enable: bool,
    #[serde(rename = "hasQuota")]
    pub has_quota: bool,
    #[serde(rename = "projectId")]
    pub project_id: Option<String>,
    pub email: Option<String>,
}

/// Input for adding an account.
#[derive(Clone, Deserialize)]
pub struct NewCredential {
    pub access_token: String,
    pub refresh_token: String,
    #[serde(default)]
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub timestamp: Option<u64>,
    #[serde(default)]
    pub enable: Option<bool>,
    #[serde(rename = "hasQuota", default)]
    pub has_quota: Option<bool>,
    #[serde(rename = "projectId", default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
}

impl NewCredential {
    /// Fill defaults: one-hour lifetime issued `now`, enabled, with quota.
    pub fn into_credential(self, now: u64) -> Credential {
        Credential {
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            expires_in: Some(self.expires_in.unwrap_or(DEFAULT_EXPIRES_IN_SECS)),
            timestamp: Some(self.timestamp.unwrap_or(now)),
            enable: self.enable.unwrap_or(true),
            has_quota: self.has_quota.unwrap_or(true),
            project_id: self.project_id,
            email: self.email,
            session_id: String::new(),
        }
    }
}

/// Partial update of a stored record. The refresh token is not patchable.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CredentialPatch {
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub timestamp: Option<u64>,
    #[serde(default)]
    pub enable: Option<bool>,
    #[serde(rename = "hasQuota", default)]
    pub has_quota: Option<bool>,
    #[serde(rename = "projectId", default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
}

impl CredentialPatch {
    /// Apply every present field to `credential`.
    pub fn apply(&self, credential: &mut Credential) {
        if let Some(access_token) = &self.access_token {
            credential.access_token = access_token.clone();
        }
        if let Some(expires_in) = self.expires_in {
            credential.expires_in = Some(expires_in);
        }
        if let Some(timestamp) = self.timestamp {
            credential.timestamp = Some(timestamp);
        }
        if let Some(enable) = self.enable {
            credential.enable = enable;
        }
        if let Some(has_quota) = self.has_quota {
            credential.has_quota = has_quota;
        }
        if let Some(project_id) = &self.project_id {
            credential.project_id = Some(project_id.clone());
        }
        if let Some(email) = &self.email {
            credential.email = Some(email.clone());
        }
    }
}

/// Credential file manager.
///
/// Holds no records in memory; the pool owns the live copy and uses the store
/// as a durability mirror.
pub struct CredentialStore {
    path: PathBuf,
    write_lock: Mutex<()>,
    reads: AtomicU64,
}

impl CredentialStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            write_lock: Mutex::new(()),
            reads: AtomicU64::new(0),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of `read_all` calls since the store was created.
    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    /// Read every record. A missing file is an empty store.
    pub async fn read_all(&self) -> Result<Vec<Credential>> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        self.read_file().await
    }

    async fn read_file(&self) -> Result<Vec<Credential>> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %self.path.display(), "credential file not found, treating as empty");
                return Ok(Vec::new());
            }
            Err(e) => return Err(Error::Io(format!("reading credential file: {e}"))),
        };
        if contents.trim().is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(&contents)
            .map_err(|e| Error::CredentialParse(format!("parsing credential file: {e}")))
    }

    /// Replace the whole file with `records`.
    pub async fn write_all(&self, records: &[Credential]) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        write_atomic(&self.path, records).await
    }

    /// Merge the in-memory pool back into the file.
    ///
    /// Stored records whose refresh token matches a pool record are replaced
    /// by the pool copy; records only present in the file (added by another
    /// writer) are kept. Pool records missing from the file are not
    /// re-added. `changed` is applied last and appended if absent.
    pub async fn merge_one(&self, pool: &[Credential], changed: Option<&Credential>) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut stored = self.read_file().await?;

        let positions: HashMap<String, usize> = stored
            .iter()
            .enumerate()
            .map(|(idx, c)| (c.refresh_token.clone(), idx))
            .collect();

        for credential in pool {
            if let Some(&idx) = positions.get(&credential.refresh_token) {
                stored[idx] = credential.clone();
            }
        }

        if let Some(changed) = changed {
            match positions.get(&changed.refresh_token) {
                Some(&idx) => stored[idx] = changed.clone(),
                None => stored.push(changed.clone()),
            }
        }

        write_atomic(&self.path, &stored).await
    }
}

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Write credentials to a file atomically.
///
/// Writes to a temporary file in the same directory, then renames it over
/// the target. Sets file permissions to 0600 (owner read/write only) since
/// the file contains OAuth tokens.
async fn write_atomic(path: &Path, data: &[Credential]) -> Result<()> {
    let json = serde_json::to_string_pretty(data)
        .map_err(|e| Error::CredentialParse(format!("serializing credentials: {e}")))?;

    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    };
    tokio::fs::create_dir_all(&dir)
        .await
        .map_err(|e| Error::Io(format!("creating credential directory: {e}")))?;

    let tmp_path = dir.join(format!(
        ".accounts.tmp.{}.{}",
        std::process::id(),
        TMP_COUNTER.fetch_add(1, Ordering::Relaxed)
    ));

    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .map_err(|e| Error::Io(format!("writing temp credential file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| Error::Io(format!("setting credential file permissions: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Io(format!("renaming temp credential file: {e}")))?;

    debug!(path = %path.display(), records = data.len(), "persisted credentials");
    Ok(())
}
