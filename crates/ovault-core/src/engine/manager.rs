//! Session manager - the at-most-one-session-per-source registry
//!
//! Guards the invariant that store is not reentrant for the same source
//! identifier, and implements cancellation that waits for the session's
//! abort path to finish before returning.

use crate::engine::session::DownloadSession;
use crate::error::OvaultError;
use ovault_types::StoredContentRecord;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, RwLock};
use tracing::info;

/// Handle to a running session
struct SessionHandle {
    cancelled: Arc<AtomicBool>,
    /// Flips to true once the session task has fully finished (including
    /// its abort path)
    done: watch::Receiver<bool>,
}

/// Registry of active download sessions, keyed by source identifier
#[derive(Default)]
pub struct SessionManager {
    active: Arc<RwLock<HashMap<String, SessionHandle>>>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a session for this source is still uncommitted
    pub async fn is_active(&self, source: &str) -> bool {
        self.active.read().await.contains_key(source)
    }

    /// Run a session to completion, enforcing the one-session-per-source
    /// invariant. The registry check and insert happen under one lock.
    pub async fn run(
        &self,
        session: DownloadSession,
    ) -> Result<StoredContentRecord, OvaultError> {
        let source = session.source().to_string();
        let cancelled = session.cancel_flag();
        let (done_tx, done_rx) = watch::channel(false);

        {
            let mut active = self.active.write().await;
            if active.contains_key(&source) {
                return Err(OvaultError::SessionAlreadyActive(source));
            }
            active.insert(
                source.clone(),
                SessionHandle {
                    cancelled,
                    done: done_rx,
                },
            );
        }

        // Registry cleanup runs inside its own task, so the entry is freed
        // even if the caller's future is dropped mid-await, and even if the
        // session panics.
        let active = self.active.clone();
        let task = tokio::spawn(async move {
            let inner = tokio::spawn(session.run());
            let result = match inner.await {
                Ok(result) => result,
                Err(e) => Err(OvaultError::Internal(format!("session task failed: {}", e))),
            };
            active.write().await.remove(&source);
            let _ = done_tx.send(true);
            result
        });

        match task.await {
            Ok(result) => result,
            Err(e) => Err(OvaultError::Internal(format!("session task failed: {}", e))),
        }
    }

    /// Cancel the active session for a source.
    ///
    /// Returns only after the session has finished aborting, so no orphaned
    /// license or half-written record remains observable afterwards.
    pub async fn cancel(&self, source: &str) -> Result<(), OvaultError> {
        let handle = {
            let active = self.active.read().await;
            active
                .get(source)
                .map(|h| (h.cancelled.clone(), h.done.clone()))
        };

        let Some((cancelled, mut done)) = handle else {
            return Err(OvaultError::NotFound(source.to_string()));
        };

        cancelled.store(true, Ordering::Release);
        info!("Cancelling store session for {}", source);

        while !*done.borrow() {
            if done.changed().await.is_err() {
                break;
            }
        }

        Ok(())
    }
}
