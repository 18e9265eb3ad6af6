//! Ordered background persistence
//!
//! Pool mutations must not wait on disk. Each mutation enqueues a merge of
//! the current pool snapshot; one task drains the queue so merges land in
//! the order they were issued. A failed write is logged and the in-memory
//! state stays authoritative.

use std::sync::Arc;

use cloudcode_auth::{Credential, CredentialStore};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error};

enum Command {
    Merge {
        pool: Vec<Credential>,
        changed: Option<Credential>,
    },
    Flush(oneshot::Sender<()>),
}

/// Handle to the persistence writer task.
pub struct Persister {
    tx: mpsc::UnboundedSender<Command>,
}

impl Persister {
    /// Spawn the writer task. Must be called inside a tokio runtime.
    pub fn spawn(store: Arc<CredentialStore>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(command) = rx.recv().await {
                match command {
                    Command::Merge { pool, changed } => {
                        if let Err(e) = store.merge_one(&pool, changed.as_ref()).await {
                            error!(
                                path = %store.path().display(),
                                error = %e,
                                "failed to persist credentials"
                            );
                        }
                    }
                    Command::Flush(ack) => {
                        let _ = ack.send(());
                    }
                }
            }
            debug!("persistence writer stopped");
        });
        Self { tx }
    }

    /// Queue a merge of `pool` (and `changed`, applied last) into the store.
    pub fn merge(&self, pool: Vec<Credential>, changed: Option<Credential>) {
        if self.tx.send(Command::Merge { pool, changed }).is_err() {
            error!("persistence writer is gone, credential update not saved");
        }
    }

    /// Wait until every merge queued before this call has been written.
    pub async fn flush(&self) {
        let (ack, done) = oneshot::channel();
        if self.tx.send(Command::Flush(ack)).is_ok() {
            let _ = done.await;
        }
    }
}
