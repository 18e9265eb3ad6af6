//! Periodic background refresh
//!
//! Keeps access tokens warm so most acquisitions don't pay for a refresh
//! round trip. Each tick runs the same batch pass as startup: expired
//! credentials are refreshed concurrently and rejected grants disabled.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::pool::Pool;

/// Spawn the background refresh task.
///
/// Returns `None` when `interval` is zero (refresh only on demand).
pub fn spawn_refresh_task(
    pool: Arc<Pool>,
    interval: Duration,
) -> Option<tokio::task::JoinHandle<()>> {
    if interval.is_zero() {
        info!("background refresh disabled");
        return None;
    }

    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // Skip the immediate first tick; the pool refreshes on load
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let summary = pool.refresh_expired().await;
            debug!(
                refreshed = summary.refreshed,
                disabled = summary.disabled,
                failed = summary.failed,
                "background refresh cycle"
            );
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::PoolOptions;
    use crate::testing::{MockUpstream, expired, fresh};
    use cloudcode_auth::CredentialStore;

    async fn pool(dir: &tempfile::TempDir) -> (Arc<Pool>, Arc<MockUpstream>) {
        let store = Arc::new(CredentialStore::new(dir.path().join("accounts.json")));
        store.write_all(&[expired("a"), fresh("b")]).await.unwrap();
        let upstream = Arc::new(MockUpstream::default());
        let pool = Pool::new(store, upstream.clone(), PoolOptions::default());
        (Arc::new(pool), upstream)
    }

    #[tokio::test]
    async fn zero_interval_disables_task() {
        let dir = tempfile::tempdir().unwrap();
        let (pool, _) = pool(&dir).await;
        assert!(spawn_refresh_task(pool, Duration::ZERO).is_none());
    }

    #[tokio::test]
    async fn task_refreshes_expiring_credentials() {
        let dir = tempfile::tempdir().unwrap();
        let (pool, upstream) = pool(&dir).await;
        // Every refreshed token is immediately due again
        upstream.refresh_lifetime(0);
        pool.initialize().await;
        assert_eq!(upstream.refreshes(), 1);

        let handle = spawn_refresh_task(pool.clone(), Duration::from_millis(20)).unwrap();
        tokio::time::sleep(Duration::from_millis(110)).await;
        handle.abort();

        assert!(upstream.refreshes() >= 3, "got {}", upstream.refreshes());
        assert_eq!(pool.len().await, 2);
    }

    #[tokio::test]
    async fn task_disables_rejected_credentials() {
        let dir = tempfile::tempdir().unwrap();
        let (pool, upstream) = pool(&dir).await;
        upstream.refresh_lifetime(0);
        pool.initialize().await;
        upstream.fail_refresh("1//a", 401);

        let handle = spawn_refresh_task(pool.clone(), Duration::from_millis(20)).unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;
        handle.abort();

        assert_eq!(pool.len().await, 1);
    }
}
