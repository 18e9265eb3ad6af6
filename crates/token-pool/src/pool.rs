//! Credential pool: lazy initialization, selection and administration
//!
//! All pool state lives in one `PoolState` behind a tokio `Mutex`. Every
//! mutation, including the acquisition trial loop with its refresh and
//! eligibility calls, runs while holding it, so two concurrent acquisitions
//! never observe the same cursor.
//!
//! Initialization is memoized in a `OnceCell`: concurrent cold callers await
//! the same load. `reload()` rebuilds the pool wholesale under the lock.
//!
//! Credential lifecycle inside the pool:
//! 1. Loaded from the store if `enable`, with a fresh session id
//! 2. Refreshed when expired (at load, on acquisition, or by the background task)
//! 3. Upstream 429 → `mark_quota_exhausted` → `has_quota = false`
//! 4. Grant rejected or account ineligible → disabled and dropped from the pool
//! 5. Every change is merged back into the store in the background

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use cloudcode_auth::{
    Credential, CredentialPatch, CredentialStore, CredentialSummary, NewCredential, now_millis,
};
use futures_util::future::join_all;
use metrics::{counter, gauge};
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::lifecycle::{Failure, Lifecycle, Prepared, is_expired};
use crate::persist::Persister;
use crate::rotation::{DEFAULT_REQUEST_COUNT, RotationSnapshot, RotationState, Strategy};
use crate::upstream::Upstream;

/// Pool construction options.
#[derive(Debug, Clone)]
pub struct PoolOptions {
    pub strategy: Strategy,
    pub request_count: u32,
    /// Bound on every refresh and eligibility call.
    pub request_timeout: Duration,
    /// Generate project ids locally instead of asking Cloud Code.
    pub skip_project_validation: bool,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            strategy: Strategy::RoundRobin,
            request_count: DEFAULT_REQUEST_COUNT,
            request_timeout: Duration::from_secs(30),
            skip_project_validation: false,
        }
    }
}

/// Outcome counts of one batch refresh pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshSummary {
    pub refreshed: usize,
    pub disabled: usize,
    pub failed: usize,
}

struct PoolState {
    credentials: Vec<Credential>,
    rotation: RotationState,
}

enum Trial {
    Ready,
    Removed,
    Skipped,
}

/// Process-wide credential pool.
pub struct Pool {
    store: Arc<CredentialStore>,
    lifecycle: Lifecycle,
    persister: Persister,
    state: Mutex<PoolState>,
    init: OnceCell<()>,
    generation: AtomicU64,
}

impl Pool {
    /// Create an uninitialized pool. Nothing is read until first use.
    ///
    /// Spawns the persistence writer, so this must run inside a tokio runtime.
    pub fn new(store: Arc<CredentialStore>, upstream: Arc<dyn Upstream>, options: PoolOptions) -> Self {
        Self {
            persister: Persister::spawn(store.clone()),
            store,
            lifecycle: Lifecycle::new(
                upstream,
                options.request_timeout,
                options.skip_project_validation,
            ),
            state: Mutex::new(PoolState {
                credentials: Vec::new(),
                rotation: RotationState::new(options.strategy, options.request_count),
            }),
            init: OnceCell::new(),
            generation: AtomicU64::new(0),
        }
    }

    /// Load the pool if no caller has yet. Concurrent callers share one load.
    pub async fn initialize(&self) {
        self.init
            .get_or_init(|| async {
                let mut state = self.state.lock().await;
                self.rebuild(&mut state).await;
            })
            .await;
    }

    /// Hand out the next usable credential, or `None` when the pool is empty
    /// or every candidate failed.
    ///
    /// The returned credential is a copy; there is nothing to release.
    pub async fn acquire(&self) -> Option<Credential> {
        self.initialize().await;
        let mut state = self.state.lock().await;

        let selected = if state.credentials.is_empty() {
            None
        } else if state.rotation.strategy() == Strategy::QuotaExhausted {
            self.acquire_with_quota(&mut state).await
        } else {
            self.acquire_in_order(&mut state).await
        };

        let outcome = if selected.is_some() { "ok" } else { "none" };
        counter!("token_pool_acquisitions_total", "outcome" => outcome).increment(1);
        if selected.is_none() {
            warn!(pool_size = state.credentials.len(), "no usable credential");
        }
        selected
    }

    async fn acquire_in_order(&self, state: &mut PoolState) -> Option<Credential> {
        let mut skipped = HashSet::new();
        loop {
            let idx = state.rotation.next_in_order(&state.credentials, &skipped)?;
            match self.try_candidate(state, idx).await {
                Trial::Ready => {
                    state.rotation.record_use(idx, &state.credentials);
                    let credential = state.credentials[idx].clone();
                    debug!(credential = %credential.label(), index = idx, "credential acquired");
                    return Some(credential);
                }
                Trial::Removed => {}
                Trial::Skipped => {
                    skipped.insert(state.credentials[idx].refresh_token.clone());
                }
            }
        }
    }

    async fn acquire_with_quota(&self, state: &mut PoolState) -> Option<Credential> {
        if state.rotation.quota_available() == 0 {
            self.reset_all_quotas(state);
        }

        let mut skipped = HashSet::new();
        loop {
            let (pos, idx) = state
                .rotation
                .next_with_quota(&state.credentials, &skipped)?;
            match self.try_candidate(state, idx).await {
                Trial::Ready => {
                    let credential = state.credentials[idx].clone();
                    state.rotation.pin(pos, idx, &credential.refresh_token);
                    debug!(credential = %credential.label(), index = idx, "credential acquired");
                    return Some(credential);
                }
                Trial::Removed => {}
                Trial::Skipped => {
                    skipped.insert(state.credentials[idx].refresh_token.clone());
                }
            }
        }
    }

    /// Prepare the candidate at `idx` and apply the outcome to the pool.
    async fn try_candidate(&self, state: &mut PoolState, idx: usize) -> Trial {
        let mut candidate = state.credentials[idx].clone();
        let outcome = self.lifecycle.prepare(&mut candidate).await;
        let changed = candidate != state.credentials[idx];
        state.credentials[idx] = candidate;

        match outcome {
            Ok(Prepared::Ready { .. }) => {
                if changed {
                    self.persist(state, Some(idx));
                }
                Trial::Ready
            }
            Ok(Prepared::Disable) => {
                let refresh_token = state.credentials[idx].refresh_token.clone();
                warn!(
                    credential = %state.credentials[idx].label(),
                    "account not eligible for Cloud Code"
                );
                self.disable_locked(state, &refresh_token);
                Trial::Removed
            }
            Err(Failure::Permanent(reason)) => {
                let refresh_token = state.credentials[idx].refresh_token.clone();
                warn!(
                    credential = %state.credentials[idx].label(),
                    reason = %reason,
                    "credential rejected upstream"
                );
                self.disable_locked(state, &refresh_token);
                Trial::Removed
            }
            Err(Failure::Transient(reason)) => {
                error!(
                    credential = %state.credentials[idx].label(),
                    reason = %reason,
                    "credential preparation failed, skipping"
                );
                if changed {
                    self.persist(state, Some(idx));
                }
                Trial::Skipped
            }
        }
    }

    /// Disable a credential: it leaves the pool and is saved with `enable = false`.
    pub async fn disable(&self, credential: &Credential) {
        let mut state = self.state.lock().await;
        if !self.disable_locked(&mut state, &credential.refresh_token) {
            debug!(credential = %credential.label(), "disable: credential not in pool");
        }
    }

    fn disable_locked(&self, state: &mut PoolState, refresh_token: &str) -> bool {
        let Some(pos) = state
            .credentials
            .iter()
            .position(|c| c.refresh_token == refresh_token)
        else {
            return false;
        };

        let mut removed = state.credentials.remove(pos);
        removed.enable = false;
        state.rotation.on_removed(refresh_token, &state.credentials);

        warn!(
            credential = %removed.label(),
            remaining = state.credentials.len(),
            "credential disabled"
        );
        counter!("token_pool_disabled_total").increment(1);
        gauge!("token_pool_size").set(state.credentials.len() as f64);

        self.persister
            .merge(state.credentials.clone(), Some(removed));
        true
    }

    /// Record that a credential's quota window is used up.
    ///
    /// Under `quota_exhausted` the credential also leaves the quota cache and
    /// the cursor moves past it.
    pub async fn mark_quota_exhausted(&self, credential: &Credential) {
        let mut state = self.state.lock().await;
        let Some(idx) = position(&state, credential) else {
            debug!(credential = %credential.label(), "quota exhausted: credential not in pool");
            return;
        };

        state.credentials[idx].has_quota = false;
        warn!(credential = %credential.label(), "quota exhausted");
        counter!("token_pool_quota_exhausted_total").increment(1);
        self.persist(&state, Some(idx));

        if state.rotation.strategy() == Strategy::QuotaExhausted {
            let len = state.credentials.len();
            state
                .rotation
                .remove_quota_index(idx, &credential.refresh_token);
            state.rotation.advance(len);
        }
    }

    /// Mark a credential's quota as available again.
    ///
    /// The quota cache is not rebuilt here; it picks the credential up on the
    /// next rebuild (reload, reconfiguration or full exhaustion).
    pub async fn restore_quota(&self, credential: &Credential) {
        let mut state = self.state.lock().await;
        let Some(idx) = position(&state, credential) else {
            debug!(credential = %credential.label(), "restore quota: credential not in pool");
            return;
        };

        state.credentials[idx].has_quota = true;
        info!(credential = %credential.label(), "quota restored");
        self.persist(&state, Some(idx));
    }

    fn reset_all_quotas(&self, state: &mut PoolState) {
        warn!("every credential is out of quota, resetting quota flags");
        for credential in &mut state.credentials {
            credential.has_quota = true;
        }
        state.rotation.restart_quota_cycle(&state.credentials);
        self.persist(state, None);
    }

    /// Re-read the store and rebuild the pool wholesale.
    ///
    /// On a cold pool the first load is the reload.
    pub async fn reload(&self) {
        if self.init.initialized() {
            let mut state = self.state.lock().await;
            self.rebuild(&mut state).await;
        } else {
            self.initialize().await;
        }
        info!(generation = self.generation(), "credential pool reloaded");
    }

    async fn rebuild(&self, state: &mut PoolState) {
        let records = match self.store.read_all().await {
            Ok(records) => records,
            Err(e) => {
                error!(error = %e, "failed to load credentials, starting with an empty pool");
                Vec::new()
            }
        };

        state.credentials = records
            .into_iter()
            .filter(|c| c.enable)
            .map(|mut c| {
                c.session_id = uuid::Uuid::new_v4().to_string();
                c
            })
            .collect();
        state.rotation.reset(&state.credentials);
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        gauge!("token_pool_size").set(state.credentials.len() as f64);

        if state.credentials.is_empty() {
            warn!(
                path = %self.store.path().display(),
                "no enabled credentials; add one through the admin API"
            );
            return;
        }

        info!(
            credentials = state.credentials.len(),
            strategy = %state.rotation.strategy(),
            request_count = state.rotation.request_count(),
            generation,
            "credential pool loaded"
        );
        self.refresh_expired_locked(state).await;
    }

    /// Refresh every expired credential concurrently.
    ///
    /// Permanent failures are disabled only after all refreshes have settled.
    pub async fn refresh_expired(&self) -> RefreshSummary {
        self.initialize().await;
        let mut state = self.state.lock().await;
        self.refresh_expired_locked(&mut state).await
    }

    async fn refresh_expired_locked(&self, state: &mut PoolState) -> RefreshSummary {
        let now = now_millis();
        let mut expired: Vec<Credential> = state
            .credentials
            .iter()
            .filter(|c| is_expired(c, now))
            .cloned()
            .collect();
        if expired.is_empty() {
            return RefreshSummary::default();
        }

        info!(count = expired.len(), "refreshing expired credentials");
        let started = std::time::Instant::now();
        let outcomes = join_all(expired.iter_mut().map(|c| self.lifecycle.refresh(c))).await;

        let mut summary = RefreshSummary::default();
        let mut rejected = Vec::new();
        for (credential, outcome) in expired.into_iter().zip(outcomes) {
            match outcome {
                Ok(()) => {
                    summary.refreshed += 1;
                    counter!("token_pool_refresh_total", "result" => "success").increment(1);
                    if let Some(slot) = state
                        .credentials
                        .iter_mut()
                        .find(|c| c.refresh_token == credential.refresh_token)
                    {
                        *slot = credential;
                    }
                }
                Err(Failure::Permanent(reason)) => {
                    summary.disabled += 1;
                    counter!("token_pool_refresh_total", "result" => "permanent").increment(1);
                    warn!(credential = %credential.label(), reason = %reason, "refresh rejected");
                    rejected.push(credential.refresh_token);
                }
                Err(Failure::Transient(reason)) => {
                    summary.failed += 1;
                    counter!("token_pool_refresh_total", "result" => "transient").increment(1);
                    error!(credential = %credential.label(), reason = %reason, "refresh failed");
                }
            }
        }

        if summary.refreshed > 0 {
            self.persist(state, None);
        }
        for refresh_token in &rejected {
            self.disable_locked(state, refresh_token);
        }

        info!(
            refreshed = summary.refreshed,
            disabled = summary.disabled,
            failed = summary.failed,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "batch refresh finished"
        );
        summary
    }

    /// Add a credential to the store and reload.
    pub async fn add(&self, new: NewCredential) -> Result<()> {
        self.initialize().await;
        let mut state = self.state.lock().await;
        self.persister.flush().await;

        let mut records = self.store.read_all().await?;
        if records.iter().any(|c| c.refresh_token == new.refresh_token) {
            return Err(Error::Duplicate(common::display_suffix(&new.refresh_token)));
        }
        let credential = new.into_credential(now_millis());
        info!(credential = %credential.label(), "adding credential");
        records.push(credential);
        self.store.write_all(&records).await?;

        self.rebuild(&mut state).await;
        Ok(())
    }

    /// Patch a stored credential and reload.
    pub async fn update(&self, refresh_token: &str, patch: CredentialPatch) -> Result<()> {
        self.initialize().await;
        let mut state = self.state.lock().await;
        self.persister.flush().await;

        let mut records = self.store.read_all().await?;
        let record = records
            .iter_mut()
            .find(|c| c.refresh_token == refresh_token)
            .ok_or_else(|| Error::NotFound(common::display_suffix(refresh_token)))?;
        patch.apply(record);
        info!(credential = %record.label(), "updating credential");
        self.store.write_all(&records).await?;

        self.rebuild(&mut state).await;
        Ok(())
    }

    /// Delete a credential from the store and reload.
    pub async fn remove(&self, refresh_token: &str) -> Result<()> {
        self.initialize().await;
        let mut state = self.state.lock().await;
        self.persister.flush().await;

        let mut records = self.store.read_all().await?;
        let before = records.len();
        records.retain(|c| c.refresh_token != refresh_token);
        if records.len() == before {
            return Err(Error::NotFound(common::display_suffix(refresh_token)));
        }
        info!(credential = %common::display_suffix(refresh_token), "removing credential");
        self.store.write_all(&records).await?;

        self.rebuild(&mut state).await;
        Ok(())
    }

    /// Every stored credential, including disabled ones.
    pub async fn list(&self) -> Result<Vec<CredentialSummary>> {
        self.persister.flush().await;
        let records = self.store.read_all().await?;
        Ok(records.iter().map(Credential::summary).collect())
    }

    /// Hot-swap the rotation strategy and/or request-count threshold.
    pub async fn update_rotation_config(&self, strategy: Option<Strategy>, request_count: Option<u32>) {
        let mut state = self.state.lock().await;
        let PoolState {
            credentials,
            rotation,
        } = &mut *state;
        rotation.reconfigure(strategy, request_count, credentials);
        info!(
            strategy = %rotation.strategy(),
            request_count = rotation.request_count(),
            "rotation config updated"
        );
    }

    pub async fn rotation_config(&self) -> RotationSnapshot {
        self.state.lock().await.rotation.snapshot()
    }

    /// Pool health for the health endpoint.
    ///
    /// Every pooled credential with quota → healthy, some → degraded, empty
    /// pool → unhealthy.
    pub async fn health(&self) -> serde_json::Value {
        let state = self.state.lock().await;
        let total = state.credentials.len();
        let with_quota = state.credentials.iter().filter(|c| c.has_quota).count();

        let status = if total == 0 {
            "unhealthy"
        } else if with_quota == total {
            "healthy"
        } else {
            "degraded"
        };

        serde_json::json!({
            "status": status,
            "strategy": state.rotation.strategy(),
            "generation": self.generation(),
            "credentials_total": total,
            "credentials_with_quota": with_quota,
            "credentials_exhausted": total - with_quota,
        })
    }

    /// Wait for every queued store write to land.
    pub async fn flush(&self) {
        self.persister.flush().await;
    }

    /// Number of credentials currently in rotation.
    pub async fn len(&self) -> usize {
        self.state.lock().await.credentials.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// How many times the pool has been built.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    fn persist(&self, state: &PoolState, changed: Option<usize>) {
        let changed = changed.map(|idx| state.credentials[idx].clone());
        self.persister.merge(state.credentials.clone(), changed);
    }
}

fn position(state: &PoolState, credential: &Credential) -> Option<usize> {
    state
        .credentials
        .iter()
        .position(|c| c.refresh_token == credential.refresh_token)
}
