//! Error taxonomy for the coordination backend.
//!
//! Two spaces: [`ClientError`] is what the coordination-service client
//! surfaces, [`BackendError`] is what the backend surfaces to the host
//! system. Errors propagate unchanged; the backend never logs them.

use thiserror::Error;

use crate::constants::codes;

/// Errors surfaced by a [`CoordClient`](crate::CoordClient) implementation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClientError {
    /// The coordination service processed the request and rejected it.
    /// `code` is the service's error code; `index` is the service's current
    /// global index at rejection time.
    #[error("coordination service error {code}: {message}")]
    Api {
        code: u32,
        message: String,
        index: u64,
    },

    /// The coordination service could not be reached or returned a protocol
    /// error.
    #[error("coordination service unreachable: {reason}")]
    Transport { reason: String },

    /// The caller's cancellation token fired before the call completed.
    #[error("operation cancelled")]
    Cancelled,
}

impl ClientError {
    /// Shorthand for a missing-key API error.
    pub fn missing_key(key: &str, index: u64) -> Self {
        ClientError::Api {
            code: codes::KEY_NOT_FOUND,
            message: format!("key not found: {key}"),
            index,
        }
    }

    /// True if this is the service's missing-key error (code 100).
    pub fn is_missing_key(&self) -> bool {
        matches!(
            self,
            ClientError::Api {
                code: codes::KEY_NOT_FOUND,
                ..
            }
        )
    }

    /// The service index carried by an API error, if any.
    pub fn index(&self) -> Option<u64> {
        match self {
            ClientError::Api { index, .. } => Some(*index),
            _ => None,
        }
    }
}

/// Errors surfaced to the host system by the backend and lock surfaces.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    /// Initial cluster discovery failed at construction; no backend is
    /// returned.
    #[error("client setup failed: unable to sync coordination cluster")]
    ClusterSyncFailed,

    /// `lock` called on a handle that already holds the lock.
    #[error("lock already held")]
    LockHeld,

    /// `unlock` called on a handle that does not hold the lock.
    #[error("lock not held")]
    LockNotHeld,

    /// The handle's queue entry vanished during acquisition, either through
    /// TTL expiry or external deletion.
    #[error("lock queue entry removed before acquisition")]
    QueueEntryRemoved,

    /// The caller's cancellation signal fired while waiting for the lock.
    #[error("lock acquisition cancelled")]
    Cancelled,

    /// A stored value could not be decoded from base64.
    #[error("stored value is not valid base64: {reason}")]
    Decode { reason: String },

    /// Any unrecovered coordination-service error, propagated unchanged.
    #[error(transparent)]
    Client(#[from] ClientError),
}
