//! The contract between the backend and the coordination-service client.
//!
//! The backend treats the client library as an external collaborator and
//! only depends on the operations below: single-key reads and writes,
//! non-recursive deletes, atomic in-order creation under a directory, and
//! long-poll watches. All operations are linearized by the service; in-order
//! creation produces child names that are strictly monotonic across all
//! concurrent creators.

use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::error::ClientError;

/// What the coordination service did to produce a response or event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EtcdAction {
    Get,
    Set,
    Create,
    Update,
    CompareAndSwap,
    Delete,
    Expire,
}

impl EtcdAction {
    /// True for the two actions that remove a node: explicit deletion and
    /// TTL expiry.
    pub fn is_removal(self) -> bool {
        matches!(self, EtcdAction::Delete | EtcdAction::Expire)
    }
}

/// A node in the coordination service's hierarchy.
///
/// Directory nodes carry their immediate children in `nodes`; leaf nodes
/// carry a UTF-8 `value`. Keys are absolute service paths.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EtcdNode {
    pub key: String,
    pub value: String,
    pub dir: bool,
    pub nodes: Vec<EtcdNode>,
    pub created_index: u64,
    pub modified_index: u64,
    pub ttl_seconds: Option<u64>,
}

/// Response from any coordination-service operation.
///
/// `etcd_index` is the service's global logical index: for reads and writes
/// it is the index at response time, for watches it is the index of the
/// returned event. Watch consumers resume at `etcd_index + 1`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientResponse {
    pub action: EtcdAction,
    pub node: EtcdNode,
    pub etcd_index: u64,
}

/// Operations the backend requires from the coordination-service client.
///
/// Implementations must be safe for concurrent use; the backend shares one
/// client across the KV and lock surfaces.
#[async_trait]
pub trait CoordClient: Send + Sync {
    /// Discover the cluster. Returns false when no member is reachable.
    async fn sync_cluster(&self) -> bool;

    /// Store `value` at `key`, creating intermediate directories. A TTL of
    /// `Some(n)` expires the node after `n` seconds unless refreshed.
    async fn set(
        &self,
        key: &str,
        value: &str,
        ttl_seconds: Option<u64>,
    ) -> Result<ClientResponse, ClientError>;

    /// Read `key`. For directories the response node carries the immediate
    /// children (`sorted` orders them by key; `recursive` includes nested
    /// levels). Missing keys surface as API error code 100.
    async fn get(
        &self,
        key: &str,
        sorted: bool,
        recursive: bool,
    ) -> Result<ClientResponse, ClientError>;

    /// Delete `key`. Directories require `recursive`. Missing keys surface
    /// as API error code 100.
    async fn delete(&self, key: &str, recursive: bool) -> Result<ClientResponse, ClientError>;

    /// Atomically create a child of `dir` whose name is strictly greater
    /// than that of every previously created child.
    async fn create_in_order(
        &self,
        dir: &str,
        value: &str,
        ttl_seconds: Option<u64>,
    ) -> Result<ClientResponse, ClientError>;

    /// Long-poll for the first event on `key` (or, with `recursive`, under
    /// it) with index at least `wait_index`. Blocks until an event arrives,
    /// the service fails, or `cancel` fires; cancellation surfaces as
    /// [`ClientError::Cancelled`] promptly.
    async fn watch(
        &self,
        key: &str,
        wait_index: u64,
        recursive: bool,
        cancel: CancellationToken,
    ) -> Result<ClientResponse, ClientError>;
}

#[async_trait]
impl<T: CoordClient + ?Sized> CoordClient for std::sync::Arc<T> {
    async fn sync_cluster(&self) -> bool {
        (**self).sync_cluster().await
    }

    async fn set(
        &self,
        key: &str,
        value: &str,
        ttl_seconds: Option<u64>,
    ) -> Result<ClientResponse, ClientError> {
        (**self).set(key, value, ttl_seconds).await
    }

    async fn get(
        &self,
        key: &str,
        sorted: bool,
        recursive: bool,
    ) -> Result<ClientResponse, ClientError> {
        (**self).get(key, sorted, recursive).await
    }

    async fn delete(&self, key: &str, recursive: bool) -> Result<ClientResponse, ClientError> {
        (**self).delete(key, recursive).await
    }

    async fn create_in_order(
        &self,
        dir: &str,
        value: &str,
        ttl_seconds: Option<u64>,
    ) -> Result<ClientResponse, ClientError> {
        (**self).create_in_order(dir, value, ttl_seconds).await
    }

    async fn watch(
        &self,
        key: &str,
        wait_index: u64,
        recursive: bool,
        cancel: CancellationToken,
    ) -> Result<ClientResponse, ClientError> {
        (**self).watch(key, wait_index, recursive, cancel).await
    }
}
