//! Rotation strategies and cursor bookkeeping
//!
//! `RotationState` only chooses positions; it never talks to the network.
//! The pool walks the candidates it proposes, prepares each one, and reports
//! back which candidate was used or removed.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

use cloudcode_auth::Credential;
use serde::{Deserialize, Serialize};

/// Uses per credential before `request_count` rotates away.
pub const DEFAULT_REQUEST_COUNT: u32 = 10;

/// How the next credential is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Advance after every successful acquisition.
    #[default]
    RoundRobin,
    /// Stick with one credential until it runs out of quota.
    QuotaExhausted,
    /// Advance after a fixed number of uses per credential.
    RequestCount,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::RoundRobin => "round_robin",
            Strategy::QuotaExhausted => "quota_exhausted",
            Strategy::RequestCount => "request_count",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown rotation strategy: {0}")]
pub struct UnknownStrategy(pub String);

impl FromStr for Strategy {
    type Err = UnknownStrategy;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "round_robin" => Ok(Strategy::RoundRobin),
            "quota_exhausted" => Ok(Strategy::QuotaExhausted),
            "request_count" => Ok(Strategy::RequestCount),
            other => Err(UnknownStrategy(other.to_string())),
        }
    }
}

/// Introspection view of the rotation state.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RotationSnapshot {
    pub strategy: Strategy,
    pub request_count: u32,
    pub current_index: usize,
    /// Uses since the last rotation, keyed by refresh token.
    pub token_counts: BTreeMap<String, u32>,
}

/// Cursor state for one pool.
///
/// `quota_indices` caches the pool positions with quota left so that quota
/// selection costs O(available), not O(pool). It must be rebuilt whenever
/// pool membership changes.
#[derive(Debug)]
pub(crate) struct RotationState {
    strategy: Strategy,
    request_count: u32,
    current_index: usize,
    request_counts: HashMap<String, u32>,
    quota_indices: Vec<usize>,
    quota_cursor: usize,
    /// Refresh token the quota strategy is sticking with.
    pinned: Option<String>,
}

impl RotationState {
    pub fn new(strategy: Strategy, request_count: u32) -> Self {
        Self {
            strategy,
            request_count: if request_count == 0 {
                DEFAULT_REQUEST_COUNT
            } else {
                request_count
            },
            current_index: 0,
            request_counts: HashMap::new(),
            quota_indices: Vec::new(),
            quota_cursor: 0,
            pinned: None,
        }
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    pub fn request_count(&self) -> u32 {
        self.request_count
    }

    pub fn quota_available(&self) -> usize {
        self.quota_indices.len()
    }

    /// Start over on a freshly loaded pool.
    pub fn reset(&mut self, pool: &[Credential]) {
        self.current_index = 0;
        self.request_counts.clear();
        self.restart_quota_cycle(pool);
    }

    /// Swap strategy and/or threshold. Counters always reset; a zero
    /// threshold is ignored.
    pub fn reconfigure(
        &mut self,
        strategy: Option<Strategy>,
        request_count: Option<u32>,
        pool: &[Credential],
    ) {
        if let Some(strategy) = strategy {
            self.strategy = strategy;
        }
        if let Some(count) = request_count.filter(|c| *c > 0) {
            self.request_count = count;
        }
        self.request_counts.clear();
        self.rebuild_quota_indices(pool);
    }

    /// Recompute the quota cache after pool positions changed.
    ///
    /// The cursor follows the pinned credential to its new position while it
    /// still has quota; otherwise the old position is kept modulo the new size.
    pub fn rebuild_quota_indices(&mut self, pool: &[Credential]) {
        self.quota_indices = pool
            .iter()
            .enumerate()
            .filter(|(_, c)| c.enable && c.has_quota)
            .map(|(idx, _)| idx)
            .collect();

        let pinned_pos = self.pinned.as_deref().and_then(|token| {
            self.quota_indices
                .iter()
                .position(|&idx| pool[idx].refresh_token == token)
        });
        self.quota_cursor = match (pinned_pos, self.quota_indices.len()) {
            (Some(pos), _) => pos,
            (None, 0) => 0,
            (None, len) => self.quota_cursor % len,
        };
    }

    /// Forget the pin and start the quota cache from its first entry.
    pub fn restart_quota_cycle(&mut self, pool: &[Credential]) {
        self.pinned = None;
        self.quota_cursor = 0;
        self.rebuild_quota_indices(pool);
    }

    /// Drop one pool position from the quota cache.
    ///
    /// Entries after the cursor keep their place; removing the cursor's own
    /// entry moves it onto the next one.
    pub fn remove_quota_index(&mut self, index: usize, refresh_token: &str) {
        if self.pinned.as_deref() == Some(refresh_token) {
            self.pinned = None;
        }
        if let Some(pos) = self.quota_indices.iter().position(|&i| i == index) {
            self.quota_indices.remove(pos);
            if pos < self.quota_cursor {
                self.quota_cursor -= 1;
            }
            if self.quota_cursor >= self.quota_indices.len() {
                self.quota_cursor = 0;
            }
        }
    }

    /// Next candidate in cursor order, wrapping once, skipping `skipped`.
    pub fn next_in_order(&self, pool: &[Credential], skipped: &HashSet<String>) -> Option<usize> {
        let len = pool.len();
        (0..len)
            .map(|offset| (self.current_index + offset) % len)
            .find(|&idx| !skipped.contains(&pool[idx].refresh_token))
    }

    /// Next candidate with quota, as `(cache position, pool index)`.
    pub fn next_with_quota(
        &self,
        pool: &[Credential],
        skipped: &HashSet<String>,
    ) -> Option<(usize, usize)> {
        let len = self.quota_indices.len();
        (0..len)
            .map(|offset| (self.quota_cursor + offset) % len)
            .map(|pos| (pos, self.quota_indices[pos]))
            .find(|&(_, idx)| {
                pool.get(idx)
                    .is_some_and(|c| !skipped.contains(&c.refresh_token))
            })
    }

    /// Record a successful round-robin or request-count acquisition.
    ///
    /// Landing anywhere but the cursor (a skip or a removal moved us on)
    /// counts as rotating away from the credential the cursor was on.
    pub fn record_use(&mut self, index: usize, pool: &[Credential]) {
        if index != self.current_index {
            if let Some(left) = pool.get(self.current_index) {
                if let Some(count) = self.request_counts.get_mut(&left.refresh_token) {
                    *count = 0;
                }
            }
        }
        self.current_index = index;
        if self.should_rotate(&pool[index].refresh_token) {
            self.current_index = (index + 1) % pool.len().max(1);
        }
    }

    /// Record a successful quota-strategy acquisition. The cursor stays put.
    pub fn pin(&mut self, cache_pos: usize, index: usize, refresh_token: &str) {
        self.quota_cursor = cache_pos;
        self.current_index = index;
        self.pinned = Some(refresh_token.to_string());
    }

    /// Step past the current credential.
    pub fn advance(&mut self, pool_len: usize) {
        self.current_index = (self.current_index + 1) % pool_len.max(1);
    }

    /// A credential left the pool: forget its counter and clamp the cursor.
    pub fn on_removed(&mut self, refresh_token: &str, pool: &[Credential]) {
        self.request_counts.remove(refresh_token);
        self.current_index %= pool.len().max(1);
        self.rebuild_quota_indices(pool);
    }

    pub fn snapshot(&self) -> RotationSnapshot {
        RotationSnapshot {
            strategy: self.strategy,
            request_count: self.request_count,
            current_index: self.current_index,
            token_counts: self
                .request_counts
                .iter()
                .map(|(k, v)| (k.clone(), *v))
                .collect(),
        }
    }

    fn should_rotate(&mut self, refresh_token: &str) -> bool {
        match self.strategy {
            Strategy::RoundRobin => true,
            // Quota selection pins instead of rotating
            Strategy::QuotaExhausted => false,
            Strategy::RequestCount => {
                let count = self
                    .request_counts
                    .entry(refresh_token.to_string())
                    .or_insert(0);
                *count += 1;
                if *count >= self.request_count {
                    *count = 0;
                    true
                } else {
                    false
                }
            }
        }
    }
}
