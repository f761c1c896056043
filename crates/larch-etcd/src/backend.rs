//! Key-value persistence over the coordination service.
//!
//! Values are stored base64-encoded because the service only holds UTF-8
//! strings while user values are arbitrary bytes. The put/get round trip is
//! byte-identical.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use larch_core::Backend;
use larch_core::BackendError;
use larch_core::CoordClient;
use larch_core::Entry;
use larch_core::Lock;
use tracing::debug;

use crate::config::EtcdConfig;
use crate::lock::EtcdLock;
use crate::metrics::BackendMetrics;
use crate::metrics::MetricsSnapshot;
use crate::metrics::Operation;
use crate::paths;

/// Backend storing entries under a single root prefix of an etcd-style
/// coordination service. Suitable for running multiple instances of the
/// host system on different machines against one cluster.
pub struct EtcdBackend<C: CoordClient + ?Sized> {
    path: String,
    client: Arc<C>,
    metrics: BackendMetrics,
}

impl<C: CoordClient + ?Sized> std::fmt::Debug for EtcdBackend<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EtcdBackend")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl<C: CoordClient + ?Sized + 'static> EtcdBackend<C> {
    /// Construct a backend from the host's configuration map and an
    /// already-built coordination-service client.
    ///
    /// Fails with [`BackendError::ClusterSyncFailed`] when initial cluster
    /// discovery fails; no backend is returned in that case.
    pub async fn new(
        conf: &HashMap<String, String>,
        client: Arc<C>,
    ) -> Result<Self, BackendError> {
        Self::with_config(EtcdConfig::from_conf(conf), client).await
    }

    /// Construct a backend from an already-parsed configuration.
    pub async fn with_config(config: EtcdConfig, client: Arc<C>) -> Result<Self, BackendError> {
        if !client.sync_cluster().await {
            return Err(BackendError::ClusterSyncFailed);
        }
        debug!(path = %config.path, "coordination backend ready");
        Ok(Self {
            path: config.path,
            client,
            metrics: BackendMetrics::default(),
        })
    }

    /// The root prefix this backend owns.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Snapshot the backend's operation measurements.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Insert or update an entry.
    pub async fn put(&self, entry: &Entry) -> Result<(), BackendError> {
        let started = Instant::now();
        let result = self.put_inner(entry).await;
        self.metrics.record(Operation::Put, started.elapsed());
        result
    }

    async fn put_inner(&self, entry: &Entry) -> Result<(), BackendError> {
        let value = BASE64.encode(&entry.value);
        self.client
            .set(&paths::node_path(&self.path, &entry.key), &value, None)
            .await?;
        Ok(())
    }

    /// Fetch an entry; `None` when the key was never written.
    pub async fn get(&self, key: &str) -> Result<Option<Entry>, BackendError> {
        let started = Instant::now();
        let result = self.get_inner(key).await;
        self.metrics.record(Operation::Get, started.elapsed());
        result
    }

    async fn get_inner(&self, key: &str) -> Result<Option<Entry>, BackendError> {
        let response = match self
            .client
            .get(&paths::node_path(&self.path, key), false, false)
            .await
        {
            Ok(response) => response,
            Err(err) if err.is_missing_key() => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        let value = BASE64
            .decode(response.node.value.as_bytes())
            .map_err(|err| BackendError::Decode {
                reason: err.to_string(),
            })?;

        Ok(Some(Entry {
            key: key.to_string(),
            value,
        }))
    }

    /// Permanently delete an entry. Absent keys are not an error.
    pub async fn delete(&self, key: &str) -> Result<(), BackendError> {
        let started = Instant::now();
        let result = self.delete_inner(key).await;
        self.metrics.record(Operation::Delete, started.elapsed());
        result
    }

    async fn delete_inner(&self, key: &str) -> Result<(), BackendError> {
        match self
            .client
            .delete(&paths::node_path(&self.path, key), false)
            .await
        {
            Ok(_) => Ok(()),
            Err(err) if err.is_missing_key() => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// List the immediate children under `prefix`, up to the next level of
    /// hierarchy. Sub-directories carry a trailing `/`; value leaves appear
    /// under their user-visible basename. Lock-queue directories are hidden
    /// by the service and never appear.
    pub async fn list(&self, prefix: &str) -> Result<Vec<String>, BackendError> {
        let started = Instant::now();
        let result = self.list_inner(prefix).await;
        self.metrics.record(Operation::List, started.elapsed());
        result
    }

    async fn list_inner(&self, prefix: &str) -> Result<Vec<String>, BackendError> {
        let path = paths::node_path_dir(&self.path, prefix);
        let response = match self.client.get(&path, true, false).await {
            Ok(response) => response,
            Err(err) if err.is_missing_key() => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut out = Vec::with_capacity(response.node.nodes.len());
        for node in &response.node.nodes {
            // Child keys come back as full service paths; reduce them to
            // names relative to the listed directory.
            let name = node.key.strip_prefix(&path).unwrap_or(&node.key);
            if node.dir {
                out.push(format!("{name}/"));
            } else {
                // Drop the one-character value-node prefix from the leaf.
                out.push(name.get(1..).unwrap_or_default().to_string());
            }
        }
        Ok(out)
    }

    /// Create a lock handle for `key` carrying `value` as the holder
    /// identifier. Never contacts the coordination service.
    pub fn lock_with(&self, key: &str, value: &str) -> EtcdLock<C> {
        EtcdLock::new(
            Arc::clone(&self.client),
            paths::lock_path(&self.path, key),
            value,
        )
    }
}

#[async_trait]
impl<C: CoordClient + ?Sized + 'static> Backend for EtcdBackend<C> {
    async fn put(&self, entry: &Entry) -> Result<(), BackendError> {
        EtcdBackend::put(self, entry).await
    }

    async fn get(&self, key: &str) -> Result<Option<Entry>, BackendError> {
        EtcdBackend::get(self, key).await
    }

    async fn delete(&self, key: &str) -> Result<(), BackendError> {
        EtcdBackend::delete(self, key).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, BackendError> {
        EtcdBackend::list(self, prefix).await
    }

    fn lock_with(&self, key: &str, value: &str) -> Box<dyn Lock> {
        Box::new(EtcdBackend::lock_with(self, key, value))
    }
}

#[cfg(test)]
mod tests {
    use larch_core::constants::codes;
    use larch_core::ClientError;
    use larch_testing::DeterministicEtcdClient;

    use super::*;

    async fn backend() -> (EtcdBackend<DeterministicEtcdClient>, Arc<DeterministicEtcdClient>) {
        let client = Arc::new(DeterministicEtcdClient::new());
        let conf = HashMap::from([("path".to_string(), "/t".to_string())]);
        let backend = EtcdBackend::new(&conf, Arc::clone(&client)).await.unwrap();
        (backend, client)
    }

    #[tokio::test]
    async fn construction_fails_when_cluster_is_unreachable() {
        let client = Arc::new(DeterministicEtcdClient::new());
        client.set_cluster_reachable(false);
        let err = EtcdBackend::new(&HashMap::new(), client).await.unwrap_err();
        assert_eq!(err, BackendError::ClusterSyncFailed);
    }

    #[tokio::test]
    async fn put_get_round_trip_is_byte_identical() {
        let (backend, _client) = backend().await;
        let entry = Entry::new("a/b", vec![0x00, 0x01, 0xff, 0x00]);
        backend.put(&entry).await.unwrap();

        let got = backend.get("a/b").await.unwrap().unwrap();
        assert_eq!(got, entry);
    }

    #[tokio::test]
    async fn put_overwrites() {
        let (backend, _client) = backend().await;
        backend.put(&Entry::new("k", b"one".to_vec())).await.unwrap();
        backend.put(&Entry::new("k", b"two".to_vec())).await.unwrap();
        let got = backend.get("k").await.unwrap().unwrap();
        assert_eq!(got.value, b"two");
    }

    #[tokio::test]
    async fn values_are_stored_base64_encoded() {
        let (backend, client) = backend().await;
        backend
            .put(&Entry::new("a/b", vec![0x01, 0x02]))
            .await
            .unwrap();

        let raw = client.get("/t/a/.b", false, false).await.unwrap();
        assert_eq!(raw.node.value, "AQI=");
    }

    #[tokio::test]
    async fn get_missing_key_is_none_not_error() {
        let (backend, _client) = backend().await;
        assert_eq!(backend.get("nope").await.unwrap(), None);
    }

    #[tokio::test]
    async fn get_surfaces_corrupt_encodings() {
        let (backend, client) = backend().await;
        client
            .set("/t/a/.b", "*** not base64 ***", None)
            .await
            .unwrap();

        let err = backend.get("a/b").await.unwrap_err();
        assert!(matches!(err, BackendError::Decode { .. }));
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let (backend, _client) = backend().await;
        backend.delete("never-written").await.unwrap();

        backend.put(&Entry::new("a/b", vec![1])).await.unwrap();
        backend.delete("a/b").await.unwrap();
        backend.delete("a/b").await.unwrap();
        assert_eq!(backend.get("a/b").await.unwrap(), None);
    }

    #[tokio::test]
    async fn list_missing_directory_is_empty() {
        let (backend, _client) = backend().await;
        assert!(backend.list("nothing/here/").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn list_strips_value_prefix_and_marks_directories() {
        let (backend, _client) = backend().await;
        backend.put(&Entry::new("a/b", vec![1])).await.unwrap();
        backend.put(&Entry::new("a/sub/c", vec![2])).await.unwrap();
        backend.put(&Entry::new("a/z", vec![3])).await.unwrap();

        // Value leaves keep the service's key order (their `.` prefix sorts
        // before bare directory names).
        let listing = backend.list("a/").await.unwrap();
        assert_eq!(listing, vec!["b", "z", "sub/"]);
    }

    #[tokio::test]
    async fn list_root_prefix() {
        let (backend, _client) = backend().await;
        backend.put(&Entry::new("top", vec![1])).await.unwrap();
        backend.put(&Entry::new("a/b", vec![2])).await.unwrap();

        let listing = backend.list("").await.unwrap();
        assert_eq!(listing, vec!["top", "a/"]);
    }

    #[tokio::test]
    async fn non_recovered_api_errors_propagate_unchanged() {
        let (backend, client) = backend().await;
        // Wedge a directory where a value node belongs; the non-recursive
        // delete is rejected by the service and the raw error surfaces.
        client.set("/t/.d/x", "1", None).await.unwrap();
        let err = backend.delete("d").await.unwrap_err();
        assert!(matches!(
            err,
            BackendError::Client(ClientError::Api {
                code: codes::NOT_A_FILE,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn metrics_count_operations() {
        let (backend, _client) = backend().await;
        backend.put(&Entry::new("a", vec![1])).await.unwrap();
        backend.get("a").await.unwrap();
        backend.get("missing").await.unwrap();

        let snapshot = backend.metrics();
        let count = |name: &str| {
            snapshot
                .operations
                .iter()
                .find(|m| m.name == name)
                .map(|m| m.count)
                .unwrap_or_default()
        };
        assert_eq!(count("etcd.put"), 1);
        assert_eq!(count("etcd.get"), 2);
        assert_eq!(count("etcd.delete"), 0);
    }
}
