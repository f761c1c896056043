//! Fair mutual exclusion over the coordination service.
//!
//! Each user key maps to a hidden queue directory. Aspiring holders enqueue
//! themselves with the service's atomic in-order creation, then wait for
//! their entry to become the head of the queue. Queue entries carry a 15 s
//! TTL, so a crashed holder releases the lock without cooperation; the
//! backend never renews the TTL itself.
//!
//! Acquisition order matches enqueue order, which the service makes
//! strictly monotonic across concurrent creators. That yields FIFO fairness
//! among waiters on the same key.

use std::sync::Arc;

use async_trait::async_trait;
use larch_core::constants::LOCK_TTL_SECONDS;
use larch_core::constants::WATCH_RETRY_INTERVAL;
use larch_core::constants::WATCH_RETRY_MAX;
use larch_core::BackendError;
use larch_core::ClientError;
use larch_core::CoordClient;
use larch_core::Lock;
use larch_core::LockValue;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::warn;

/// A lock handle bound to one queue directory and one holder value.
///
/// The internal mutex serializes this handle's own method calls; it does
/// not serialize against other handles or other processes, which compete
/// through the queue.
pub struct EtcdLock<C: CoordClient + ?Sized> {
    client: Arc<C>,
    queue_dir: String,
    holder_value: String,
    state: Mutex<HandleState>,
}

/// Handle-local state guarded by the mutex. `owned_entry` keeps the path of
/// the most recently created queue entry; it is never cleared, only
/// replaced, so stale values simply fail the head comparison.
#[derive(Debug, Default)]
struct HandleState {
    owned_entry: Option<String>,
}

/// One observation of the queue directory.
struct QueueHead {
    /// Path of the lowest-named entry; `None` when the queue is empty or
    /// the directory does not exist yet.
    key: Option<String>,
    /// Holder value stored in the head entry.
    value: String,
    /// The service's global index at observation time.
    index: u64,
}

impl<C: CoordClient + ?Sized + 'static> EtcdLock<C> {
    pub(crate) fn new(client: Arc<C>, queue_dir: String, holder_value: &str) -> Self {
        Self {
            client,
            queue_dir,
            holder_value: holder_value.to_string(),
            state: Mutex::new(HandleState::default()),
        }
    }

    /// Read the queue directory once. A missing directory reads as empty.
    async fn queue_head(&self) -> Result<QueueHead, BackendError> {
        match self.client.get(&self.queue_dir, true, false).await {
            Ok(response) => {
                let index = response.etcd_index;
                Ok(match response.node.nodes.first() {
                    None => QueueHead {
                        key: None,
                        value: String::new(),
                        index,
                    },
                    Some(head) => QueueHead {
                        key: Some(head.key.clone()),
                        value: head.value.clone(),
                        index,
                    },
                })
            }
            Err(err) if err.is_missing_key() => Ok(QueueHead {
                key: None,
                value: String::new(),
                index: err.index().unwrap_or_default(),
            }),
            Err(err) => Err(err.into()),
        }
    }

    /// True iff `owned` is currently the head of the queue. Performs one
    /// read against the coordination service when `owned` is set.
    async fn is_held(&self, owned: Option<&str>) -> Result<bool, BackendError> {
        let Some(owned) = owned else {
            return Ok(false);
        };
        let head = self.queue_head().await?;
        Ok(head.key.as_deref() == Some(owned))
    }

    /// Block until this handle holds the lock or `cancel` fires.
    ///
    /// On success, returns a loss token cancelled when the lock is lost:
    /// through [`unlock`](Self::unlock), through TTL expiry of the queue
    /// entry (holds longer than 15 s need out-of-band renewal), or through
    /// external deletion. The loss token may also fire conservatively after
    /// repeated watch failures, when the holder can no longer confirm it
    /// still holds the lock.
    pub async fn lock(&self, cancel: CancellationToken) -> Result<CancellationToken, BackendError> {
        let mut state = self.state.lock().await;

        if self.is_held(state.owned_entry.as_deref()).await? {
            return Err(BackendError::LockHeld);
        }

        // Enqueue. The in-order name decides our place in line.
        let created = self
            .client
            .create_in_order(&self.queue_dir, &self.holder_value, Some(LOCK_TTL_SECONDS))
            .await?;
        let owned = created.node.key.clone();
        state.owned_entry = Some(owned.clone());
        debug!(entry = %owned, queue = %self.queue_dir, "enqueued lock waiter");

        let mut head = self.queue_head().await?;
        while head.key.as_deref() != Some(owned.as_str()) {
            let response = match self
                .client
                .watch(&self.queue_dir, head.index + 1, true, cancel.clone())
                .await
            {
                Ok(response) => response,
                Err(ClientError::Cancelled) => {
                    // Leave the queue; later waiters advance over the gap.
                    // Best-effort: the entry expires via TTL regardless.
                    let _ = self.client.delete(&owned, false).await;
                    debug!(entry = %owned, "lock wait cancelled");
                    return Err(BackendError::Cancelled);
                }
                Err(err @ ClientError::Transport { .. }) => {
                    // The wait is over either way; leave the queue so other
                    // waiters are not stuck behind a dead entry until TTL.
                    let _ = self.client.delete(&owned, false).await;
                    return Err(err.into());
                }
                Err(err) => return Err(err.into()),
            };

            // Our own entry disappearing while we wait means TTL expiry or
            // external interference; the key is already gone, so there is
            // nothing to clean up.
            if response.node.key == owned && response.action.is_removal() {
                return Err(BackendError::QueueEntryRemoved);
            }

            head = self.queue_head().await?;
        }

        debug!(entry = %owned, queue = %self.queue_dir, "lock acquired");
        let lost = CancellationToken::new();
        tokio::spawn(watch_for_entry_removal(
            Arc::clone(&self.client),
            owned,
            head.index + 1,
            lost.clone(),
        ));
        Ok(lost)
    }

    /// Release the lock by deleting this handle's queue entry. The loss
    /// watcher observes the deletion and cancels the loss token.
    pub async fn unlock(&self) -> Result<(), BackendError> {
        let state = self.state.lock().await;

        let Some(owned) = state.owned_entry.as_deref() else {
            return Err(BackendError::LockNotHeld);
        };
        if !self.is_held(Some(owned)).await? {
            return Err(BackendError::LockNotHeld);
        }

        match self.client.delete(owned, false).await {
            Ok(_) => Ok(()),
            Err(err) if err.is_missing_key() => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Report whether any handle, in any process, holds the lock, and the
    /// holder value stored at the head of the queue.
    pub async fn value(&self) -> Result<LockValue, BackendError> {
        let head = self.queue_head().await?;
        Ok(match head.key {
            None => LockValue::default(),
            Some(_) => LockValue {
                held: true,
                value: head.value,
            },
        })
    }
}

#[async_trait]
impl<C: CoordClient + ?Sized + 'static> Lock for EtcdLock<C> {
    async fn lock(&self, cancel: CancellationToken) -> Result<CancellationToken, BackendError> {
        EtcdLock::lock(self, cancel).await
    }

    async fn unlock(&self) -> Result<(), BackendError> {
        EtcdLock::unlock(self).await
    }

    async fn value(&self) -> Result<LockValue, BackendError> {
        EtcdLock::value(self).await
    }
}

/// Watch one queue entry until it is removed, then cancel `lost`.
///
/// Transient watch failures are retried with pacing; when retries are
/// exhausted the loss is declared conservatively, because the holder must
/// be told it may no longer hold the lock even if the truth is only that we
/// lost visibility.
async fn watch_for_entry_removal<C: CoordClient + ?Sized>(
    client: Arc<C>,
    key: String,
    mut wait_index: u64,
    lost: CancellationToken,
) {
    let mut retries = WATCH_RETRY_MAX;

    loop {
        match client
            .watch(&key, wait_index, false, CancellationToken::new())
            .await
        {
            Ok(response) => {
                if response.node.key == key && response.action.is_removal() {
                    debug!(entry = %key, action = ?response.action, "lock entry removed");
                    break;
                }
                wait_index = response.etcd_index + 1;
            }
            // The entry is already gone; the lock is lost.
            Err(err) if err.is_missing_key() => break,
            Err(err) => {
                retries -= 1;
                if retries == 0 {
                    warn!(entry = %key, "lock entry watch retries exhausted, declaring loss");
                    break;
                }
                warn!(entry = %key, error = %err, retries_left = retries, "lock entry watch failed, retrying");
                tokio::time::sleep(WATCH_RETRY_INTERVAL).await;
            }
        }
    }

    lost.cancel();
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::time::Duration;

    use larch_testing::DeterministicEtcdClient;

    use super::*;
    use crate::backend::EtcdBackend;

    async fn backend() -> (EtcdBackend<DeterministicEtcdClient>, Arc<DeterministicEtcdClient>) {
        let client = Arc::new(DeterministicEtcdClient::new());
        let conf = HashMap::from([("path".to_string(), "/t".to_string())]);
        let backend = EtcdBackend::new(&conf, Arc::clone(&client)).await.unwrap();
        (backend, client)
    }

    async fn queue_len(client: &DeterministicEtcdClient, queue_dir: &str) -> usize {
        match client.get(queue_dir, true, false).await {
            Ok(response) => response.node.nodes.len(),
            Err(err) if err.is_missing_key() => 0,
            Err(err) => panic!("queue read failed: {err}"),
        }
    }

    #[tokio::test]
    async fn uncontended_acquire_and_release() {
        let (backend, client) = backend().await;
        let handle = backend.lock_with("a/x", "me");

        let lost = handle.lock(CancellationToken::new()).await.unwrap();
        assert!(!lost.is_cancelled());
        assert_eq!(queue_len(&client, "/t/a/_x/").await, 1);

        handle.unlock().await.unwrap();
        assert_eq!(queue_len(&client, "/t/a/_x/").await, 0);

        tokio::time::timeout(Duration::from_secs(1), lost.cancelled())
            .await
            .expect("loss token must fire after unlock");
    }

    #[tokio::test]
    async fn relock_on_same_handle_fails_without_second_entry() {
        let (backend, client) = backend().await;
        let handle = backend.lock_with("a/x", "me");

        let _lost = handle.lock(CancellationToken::new()).await.unwrap();
        let err = handle.lock(CancellationToken::new()).await.unwrap_err();
        assert_eq!(err, BackendError::LockHeld);
        assert_eq!(queue_len(&client, "/t/a/_x/").await, 1);
    }

    #[tokio::test]
    async fn unlock_without_holding_fails() {
        let (backend, _client) = backend().await;
        let handle = backend.lock_with("a/x", "me");
        assert_eq!(handle.unlock().await.unwrap_err(), BackendError::LockNotHeld);
    }

    #[tokio::test]
    async fn handle_is_reusable_after_release() {
        let (backend, _client) = backend().await;
        let handle = backend.lock_with("a/x", "me");

        let _ = handle.lock(CancellationToken::new()).await.unwrap();
        handle.unlock().await.unwrap();

        let lost = handle.lock(CancellationToken::new()).await.unwrap();
        assert!(!lost.is_cancelled());
        handle.unlock().await.unwrap();
    }

    #[tokio::test]
    async fn value_reports_any_holder() {
        let (backend, _client) = backend().await;
        let holder = backend.lock_with("a/x", "holder-1");
        let observer = backend.lock_with("a/x", "observer");

        assert_eq!(observer.value().await.unwrap(), LockValue::default());

        let _lost = holder.lock(CancellationToken::new()).await.unwrap();
        let seen = observer.value().await.unwrap();
        assert!(seen.held);
        assert_eq!(seen.value, "holder-1");
    }

    #[tokio::test(start_paused = true)]
    async fn loss_watcher_survives_transient_watch_failures() {
        let (backend, client) = backend().await;
        let handle = backend.lock_with("a/x", "me");

        // The first two watch calls of the loss watcher fail; it must keep
        // retrying and still observe the eventual release.
        client.fail_next_watches(2);
        let lost = handle.lock(CancellationToken::new()).await.unwrap();
        handle.unlock().await.unwrap();

        tokio::time::timeout(Duration::from_secs(30), lost.cancelled())
            .await
            .expect("loss token must fire despite watch failures");
    }
}
