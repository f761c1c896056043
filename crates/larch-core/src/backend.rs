//! The surface consumed by the host system.

use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::entry::Entry;
use crate::error::BackendError;

/// Durable key-value persistence plus a factory for distributed locks.
///
/// Values are opaque bytes; missing keys read as absent, not as errors;
/// deletes are idempotent. Listings return only the immediate children of a
/// prefix, with sub-directories marked by a trailing `/`.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Insert or overwrite an entry.
    async fn put(&self, entry: &Entry) -> Result<(), BackendError>;

    /// Fetch an entry. Never-written keys return `None`.
    async fn get(&self, key: &str) -> Result<Option<Entry>, BackendError>;

    /// Permanently delete an entry. Deleting an absent key succeeds.
    async fn delete(&self, key: &str) -> Result<(), BackendError>;

    /// List the immediate children of `prefix`. Missing prefixes yield an
    /// empty list.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, BackendError>;

    /// Create a lock handle bound to `key`, with `value` as the opaque
    /// holder identifier other handles observe through [`Lock::value`].
    /// The factory never contacts the coordination service; handles for the
    /// same key compete through the service's lock queue.
    fn lock_with(&self, key: &str, value: &str) -> Box<dyn Lock>;
}

/// What [`Lock::value`] reports about a lock's queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockValue {
    /// True if any handle in the system currently holds the lock.
    pub held: bool,
    /// The holder value of the current holder; empty when unheld.
    pub value: String,
}

/// A fair, preemption-safe mutual-exclusion handle.
///
/// A handle serializes its own method calls with an internal mutex; separate
/// handles share no mutable state and compete only through the coordination
/// service.
#[async_trait]
pub trait Lock: Send + Sync {
    /// Block until the lock is acquired or `cancel` fires.
    ///
    /// On success returns a loss token that is cancelled when the lock is
    /// lost, whether through [`Lock::unlock`], TTL expiry, or external
    /// deletion of the queue entry. Callers typically treat the loss token
    /// as the bound on the lifetime of the critical section.
    async fn lock(&self, cancel: CancellationToken) -> Result<CancellationToken, BackendError>;

    /// Release the lock held by this handle.
    async fn unlock(&self) -> Result<(), BackendError>;

    /// Report whether any handle holds the lock, and the holder value.
    async fn value(&self) -> Result<LockValue, BackendError>;
}
