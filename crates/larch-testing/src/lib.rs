//! Deterministic in-memory coordination service for larch testing.
//!
//! [`DeterministicEtcdClient`] implements [`CoordClient`] without network or
//! disk I/O, mirroring the behavior the backend depends on:
//!
//! - a single global index bumped by every mutation, including expiry
//! - implicit directory creation on write
//! - atomic in-order creation with strictly monotonic, zero-padded names
//! - directory listings that hide `_`-prefixed children while direct reads
//!   of hidden nodes still succeed
//! - TTL expiry driven by `tokio::time`, so paused-clock tests can advance
//!   straight to an expiry
//! - long-poll watches that replay from an event history before blocking,
//!   so a watcher can never miss an event between read and watch
//!
//! Fault hooks ([`fail_next_watches`](DeterministicEtcdClient::fail_next_watches),
//! [`set_cluster_reachable`](DeterministicEtcdClient::set_cluster_reachable))
//! exercise the backend's retry and construction-failure paths.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::time::Duration;

use async_trait::async_trait;
use larch_core::constants::codes;
use larch_core::ClientError;
use larch_core::ClientResponse;
use larch_core::CoordClient;
use larch_core::EtcdAction;
use larch_core::EtcdNode;
use tokio::sync::broadcast;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Capacity of the event fan-out channel. Watchers that lag past this many
/// events skip ahead; the history replay path keeps them correct for events
/// preceding their subscription.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// One stored node.
#[derive(Debug, Clone)]
struct NodeRecord {
    value: String,
    dir: bool,
    created_index: u64,
    modified_index: u64,
    ttl_seconds: Option<u64>,
}

/// One mutation observed by watchers, kept forever in the history.
#[derive(Debug, Clone)]
struct StoreEvent {
    index: u64,
    action: EtcdAction,
    node: EtcdNode,
}

#[derive(Debug, Default)]
struct StoreState {
    nodes: BTreeMap<String, NodeRecord>,
    index: u64,
    history: Vec<StoreEvent>,
}

struct ClientInner {
    state: Mutex<StoreState>,
    events_tx: broadcast::Sender<StoreEvent>,
    reachable: AtomicBool,
    watch_faults: AtomicU32,
}

/// In-memory deterministic implementation of [`CoordClient`].
#[derive(Clone)]
pub struct DeterministicEtcdClient {
    inner: Arc<ClientInner>,
}

impl Default for DeterministicEtcdClient {
    fn default() -> Self {
        Self::new()
    }
}

impl DeterministicEtcdClient {
    /// Create an empty store.
    pub fn new() -> Self {
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(ClientInner {
                state: Mutex::new(StoreState::default()),
                events_tx,
                reachable: AtomicBool::new(true),
                watch_faults: AtomicU32::new(0),
            }),
        }
    }

    /// Control the outcome of [`CoordClient::sync_cluster`].
    pub fn set_cluster_reachable(&self, reachable: bool) {
        self.inner.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Make the next `n` watch calls fail with a transport error.
    pub fn fail_next_watches(&self, n: u32) {
        self.inner.watch_faults.store(n, Ordering::SeqCst);
    }

    /// The store's current global index.
    pub async fn current_index(&self) -> u64 {
        self.inner.state.lock().await.index
    }
}

/// Normalize a service path: leading `/`, `.` and empty segments dropped,
/// no trailing `/` (except the root itself).
fn normalize(key: &str) -> String {
    let mut out = String::with_capacity(key.len() + 1);
    for seg in key.split('/') {
        if seg.is_empty() || seg == "." {
            continue;
        }
        out.push('/');
        out.push_str(seg);
    }
    if out.is_empty() {
        out.push('/');
    }
    out
}

/// Last path segment.
fn leaf_name(key: &str) -> &str {
    key.rsplit('/').next().unwrap_or(key)
}

/// Hidden nodes (leaf starts with `_`) are omitted from directory listings
/// but remain directly addressable.
fn is_hidden(key: &str) -> bool {
    leaf_name(key).starts_with('_')
}

/// All strict ancestors of `key`, shallowest first, excluding the root.
fn ancestors(key: &str) -> Vec<String> {
    key.char_indices()
        .skip(1)
        .filter(|&(_, c)| c == '/')
        .map(|(i, _)| key[..i].to_string())
        .collect()
}

fn record_to_node(key: &str, record: &NodeRecord) -> EtcdNode {
    EtcdNode {
        key: key.to_string(),
        value: record.value.clone(),
        dir: record.dir,
        nodes: Vec::new(),
        created_index: record.created_index,
        modified_index: record.modified_index,
        ttl_seconds: record.ttl_seconds,
    }
}

impl ClientInner {
    /// Append an event to the history and fan it out. Callers hold the state
    /// lock and have already bumped the index.
    fn emit(&self, state: &mut StoreState, action: EtcdAction, node: EtcdNode) {
        let event = StoreEvent {
            index: state.index,
            action,
            node,
        };
        trace!(index = event.index, action = ?event.action, key = %event.node.key, "store event");
        state.history.push(event.clone());
        // No receivers is fine; the history replay path covers late watchers.
        let _ = self.events_tx.send(event);
    }

    /// Create missing ancestor directories of `key`; fail with NOT_A_DIR if
    /// any ancestor exists as a file.
    fn ensure_parents(&self, state: &mut StoreState, key: &str) -> Result<(), ClientError> {
        let index = state.index;
        for dir in ancestors(key) {
            match state.nodes.get(&dir) {
                None => {
                    state.nodes.insert(
                        dir,
                        NodeRecord {
                            value: String::new(),
                            dir: true,
                            created_index: index,
                            modified_index: index,
                            ttl_seconds: None,
                        },
                    );
                }
                Some(record) if record.dir => {}
                Some(_) => {
                    return Err(ClientError::Api {
                        code: codes::NOT_A_DIR,
                        message: format!("not a dir: {dir}"),
                        index,
                    });
                }
            }
        }
        Ok(())
    }

    /// Immediate visible children of a directory, sorted by key.
    fn children(&self, state: &StoreState, dir: &str) -> Vec<String> {
        let prefix = if dir == "/" {
            "/".to_string()
        } else {
            format!("{dir}/")
        };
        state
            .nodes
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .filter(|(key, _)| !key[prefix.len()..].contains('/'))
            .filter(|(key, _)| !is_hidden(key))
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Build the response node for `key`, populating children for
    /// directories (one level, or the full subtree with `recursive`).
    fn collect(&self, state: &StoreState, key: &str, recursive: bool) -> Option<EtcdNode> {
        let record = state.nodes.get(key)?;
        let mut node = record_to_node(key, record);
        if record.dir {
            for child_key in self.children(state, key) {
                if let Some(child) = if recursive {
                    self.collect(state, &child_key, true)
                } else {
                    state
                        .nodes
                        .get(&child_key)
                        .map(|r| record_to_node(&child_key, r))
                } {
                    node.nodes.push(child);
                }
            }
        }
        Some(node)
    }
}

/// Arrange for `key` to expire at `deadline` unless it was replaced first.
fn schedule_expiry(
    inner: Arc<ClientInner>,
    key: String,
    created_index: u64,
    deadline: Instant,
) {
    tokio::spawn(async move {
        tokio::time::sleep_until(deadline).await;
        let mut state = inner.state.lock().await;
        let current = match state.nodes.get(&key) {
            Some(record) if record.created_index == created_index => record.clone(),
            _ => return,
        };
        state.nodes.remove(&key);
        state.index += 1;
        let mut node = record_to_node(&key, &current);
        node.value = String::new();
        inner.emit(&mut state, EtcdAction::Expire, node);
    });
}

#[async_trait]
impl CoordClient for DeterministicEtcdClient {
    async fn sync_cluster(&self) -> bool {
        self.inner.reachable.load(Ordering::SeqCst)
    }

    async fn set(
        &self,
        key: &str,
        value: &str,
        ttl_seconds: Option<u64>,
    ) -> Result<ClientResponse, ClientError> {
        let key = normalize(key);
        let mut state = self.inner.state.lock().await;
        if let Some(existing) = state.nodes.get(&key) {
            if existing.dir {
                return Err(ClientError::Api {
                    code: codes::NOT_A_FILE,
                    message: format!("not a file: {key}"),
                    index: state.index,
                });
            }
        }
        state.index += 1;
        self.inner.ensure_parents(&mut state, &key)?;
        let index = state.index;
        let record = NodeRecord {
            value: value.to_string(),
            dir: false,
            created_index: index,
            modified_index: index,
            ttl_seconds,
        };
        state.nodes.insert(key.clone(), record.clone());
        let node = record_to_node(&key, &record);
        self.inner.emit(&mut state, EtcdAction::Set, node.clone());
        if let Some(ttl) = ttl_seconds {
            schedule_expiry(
                Arc::clone(&self.inner),
                key,
                index,
                Instant::now() + Duration::from_secs(ttl),
            );
        }
        Ok(ClientResponse {
            action: EtcdAction::Set,
            node,
            etcd_index: index,
        })
    }

    async fn get(
        &self,
        key: &str,
        sorted: bool,
        recursive: bool,
    ) -> Result<ClientResponse, ClientError> {
        // Children are kept in key order; the sorted flag is honored by
        // construction.
        let _ = sorted;
        let key = normalize(key);
        let state = self.inner.state.lock().await;
        let node = self
            .inner
            .collect(&state, &key, recursive)
            .ok_or_else(|| ClientError::missing_key(&key, state.index))?;
        Ok(ClientResponse {
            action: EtcdAction::Get,
            node,
            etcd_index: state.index,
        })
    }

    async fn delete(&self, key: &str, recursive: bool) -> Result<ClientResponse, ClientError> {
        let key = normalize(key);
        let mut state = self.inner.state.lock().await;
        let record = state
            .nodes
            .get(&key)
            .cloned()
            .ok_or_else(|| ClientError::missing_key(&key, state.index))?;
        if record.dir && !recursive {
            return Err(ClientError::Api {
                code: codes::NOT_A_FILE,
                message: format!("not a file: {key}"),
                index: state.index,
            });
        }
        if record.dir {
            let prefix = format!("{key}/");
            let doomed: Vec<String> = state
                .nodes
                .range(prefix.clone()..)
                .take_while(|(k, _)| k.starts_with(&prefix))
                .map(|(k, _)| k.clone())
                .collect();
            for k in doomed {
                state.nodes.remove(&k);
            }
        }
        state.nodes.remove(&key);
        state.index += 1;
        let mut node = record_to_node(&key, &record);
        node.value = String::new();
        node.modified_index = state.index;
        self.inner.emit(&mut state, EtcdAction::Delete, node.clone());
        Ok(ClientResponse {
            action: EtcdAction::Delete,
            node,
            etcd_index: state.index,
        })
    }

    async fn create_in_order(
        &self,
        dir: &str,
        value: &str,
        ttl_seconds: Option<u64>,
    ) -> Result<ClientResponse, ClientError> {
        let dir = normalize(dir);
        let mut state = self.inner.state.lock().await;
        if let Some(existing) = state.nodes.get(&dir) {
            if !existing.dir {
                return Err(ClientError::Api {
                    code: codes::NOT_A_DIR,
                    message: format!("not a dir: {dir}"),
                    index: state.index,
                });
            }
        }
        state.index += 1;
        let index = state.index;
        // The creating index doubles as the child name, zero-padded so that
        // lexical order matches creation order.
        let key = format!("{dir}/{index:020}");
        self.inner.ensure_parents(&mut state, &key)?;
        let record = NodeRecord {
            value: value.to_string(),
            dir: false,
            created_index: index,
            modified_index: index,
            ttl_seconds,
        };
        state.nodes.insert(key.clone(), record.clone());
        let node = record_to_node(&key, &record);
        self.inner.emit(&mut state, EtcdAction::Create, node.clone());
        if let Some(ttl) = ttl_seconds {
            schedule_expiry(
                Arc::clone(&self.inner),
                key,
                index,
                Instant::now() + Duration::from_secs(ttl),
            );
        }
        Ok(ClientResponse {
            action: EtcdAction::Create,
            node,
            etcd_index: index,
        })
    }

    async fn watch(
        &self,
        key: &str,
        wait_index: u64,
        recursive: bool,
        cancel: CancellationToken,
    ) -> Result<ClientResponse, ClientError> {
        let fault = self
            .inner
            .watch_faults
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if fault.is_ok() {
            return Err(ClientError::Transport {
                reason: "injected watch failure".to_string(),
            });
        }

        let key = normalize(key);
        let matches = |event_key: &str| {
            if recursive {
                event_key == key || event_key.starts_with(&format!("{key}/"))
            } else {
                event_key == key
            }
        };

        // Subscribe under the state lock so no event can slip between the
        // history scan and the live stream.
        let mut events_rx = {
            let state = self.inner.state.lock().await;
            if let Some(event) = state
                .history
                .iter()
                .find(|e| e.index >= wait_index && matches(&e.node.key))
            {
                return Ok(ClientResponse {
                    action: event.action,
                    node: event.node.clone(),
                    etcd_index: event.index,
                });
            }
            self.inner.events_tx.subscribe()
        };

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Err(ClientError::Cancelled),
                received = events_rx.recv() => match received {
                    Ok(event) if event.index >= wait_index && matches(&event.node.key) => {
                        return Ok(ClientResponse {
                            action: event.action,
                            node: event.node,
                            etcd_index: event.index,
                        });
                    }
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(ClientError::Transport {
                            reason: "event stream closed".to_string(),
                        });
                    }
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_cleans_paths() {
        assert_eq!(normalize("/vault/a/.b"), "/vault/a/.b");
        assert_eq!(normalize("/vault/./.a"), "/vault/.a");
        assert_eq!(normalize("vault//a/"), "/vault/a");
        assert_eq!(normalize("/"), "/");
        assert_eq!(normalize(""), "/");
    }

    #[test]
    fn hidden_detection_uses_leaf_only() {
        assert!(is_hidden("/vault/a/_x"));
        assert!(!is_hidden("/vault/_a/x"));
        assert!(!is_hidden("/vault/a/.x"));
    }

    #[tokio::test]
    async fn set_get_round_trip_bumps_index() {
        let client = DeterministicEtcdClient::new();
        let set = client.set("/t/a", "v1", None).await.unwrap();
        assert_eq!(set.etcd_index, 1);

        let got = client.get("/t/a", false, false).await.unwrap();
        assert_eq!(got.node.value, "v1");
        assert!(!got.node.dir);

        let set2 = client.set("/t/a", "v2", None).await.unwrap();
        assert!(set2.etcd_index > set.etcd_index);
        assert_eq!(
            client.get("/t/a", false, false).await.unwrap().node.value,
            "v2"
        );
    }

    #[tokio::test]
    async fn get_missing_key_is_code_100() {
        let client = DeterministicEtcdClient::new();
        let err = client.get("/t/missing", false, false).await.unwrap_err();
        assert!(err.is_missing_key());
    }

    #[tokio::test]
    async fn listings_hide_underscore_children_and_sort() {
        let client = DeterministicEtcdClient::new();
        client.set("/t/a/.z", "z", None).await.unwrap();
        client.set("/t/a/.b", "b", None).await.unwrap();
        client.set("/t/a/_lock/x", "l", None).await.unwrap();
        client.set("/t/a/sub/.c", "c", None).await.unwrap();

        let listing = client.get("/t/a", true, false).await.unwrap();
        assert!(listing.node.dir);
        let names: Vec<&str> = listing.node.nodes.iter().map(|n| n.key.as_str()).collect();
        assert_eq!(names, vec!["/t/a/.b", "/t/a/.z", "/t/a/sub"]);

        // Hidden nodes are still directly readable.
        let hidden = client.get("/t/a/_lock", false, false).await.unwrap();
        assert!(hidden.node.dir);
        assert_eq!(hidden.node.nodes.len(), 1);
    }

    #[tokio::test]
    async fn set_on_directory_is_rejected() {
        let client = DeterministicEtcdClient::new();
        client.set("/t/a/.b", "b", None).await.unwrap();
        let err = client.set("/t/a", "boom", None).await.unwrap_err();
        assert!(matches!(
            err,
            ClientError::Api {
                code: codes::NOT_A_FILE,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn in_order_names_are_monotonic_and_padded() {
        let client = DeterministicEtcdClient::new();
        let first = client.create_in_order("/t/_q", "a", None).await.unwrap();
        let second = client.create_in_order("/t/_q", "b", None).await.unwrap();

        let first_name = leaf_name(&first.node.key).to_string();
        let second_name = leaf_name(&second.node.key).to_string();
        assert_eq!(first_name.len(), 20);
        assert!(second_name > first_name);

        let listing = client.get("/t/_q", true, false).await.unwrap();
        assert_eq!(listing.node.nodes.len(), 2);
        assert_eq!(listing.node.nodes[0].value, "a");
    }

    #[tokio::test]
    async fn delete_semantics() {
        let client = DeterministicEtcdClient::new();
        let err = client.delete("/t/none", false).await.unwrap_err();
        assert!(err.is_missing_key());

        client.set("/t/a/.b", "b", None).await.unwrap();
        let err = client.delete("/t/a", false).await.unwrap_err();
        assert!(matches!(
            err,
            ClientError::Api {
                code: codes::NOT_A_FILE,
                ..
            }
        ));

        client.delete("/t/a", true).await.unwrap();
        assert!(client
            .get("/t/a/.b", false, false)
            .await
            .unwrap_err()
            .is_missing_key());
    }

    #[tokio::test]
    async fn watch_replays_from_history() {
        let client = DeterministicEtcdClient::new();
        let set = client.set("/t/.a", "v", None).await.unwrap();
        client.delete("/t/.a", false).await.unwrap();

        let event = client
            .watch("/t/.a", set.etcd_index + 1, false, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(event.action, EtcdAction::Delete);
        assert_eq!(event.node.key, "/t/.a");
    }

    #[tokio::test]
    async fn watch_blocks_until_matching_event() {
        let client = DeterministicEtcdClient::new();
        client.set("/t/.other", "x", None).await.unwrap();
        let index = client.current_index().await;

        let watcher = {
            let client = client.clone();
            tokio::spawn(async move {
                client
                    .watch("/t/dir", index + 1, true, CancellationToken::new())
                    .await
            })
        };

        // An unrelated write must not wake the recursive watch.
        client.set("/t/.unrelated", "y", None).await.unwrap();
        client.set("/t/dir/.a", "v", None).await.unwrap();

        let event = watcher.await.unwrap().unwrap();
        assert_eq!(event.node.key, "/t/dir/.a");
        assert_eq!(event.action, EtcdAction::Set);
    }

    #[tokio::test]
    async fn watch_cancellation_is_prompt() {
        let client = DeterministicEtcdClient::new();
        let cancel = CancellationToken::new();
        let watcher = {
            let client = client.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { client.watch("/t/.a", 1, false, cancel).await })
        };
        cancel.cancel();
        let result = tokio::time::timeout(Duration::from_secs(1), watcher)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.unwrap_err(), ClientError::Cancelled);
    }

    #[tokio::test]
    async fn watch_fault_injection() {
        let client = DeterministicEtcdClient::new();
        client.fail_next_watches(1);
        let err = client
            .watch("/t/.a", 1, false, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Transport { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn ttl_expiry_removes_node_and_emits_expire() {
        let client = DeterministicEtcdClient::new();
        let created = client
            .create_in_order("/t/_q", "holder", Some(15))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(16)).await;

        let event = client
            .watch(
                &created.node.key,
                created.etcd_index + 1,
                false,
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(event.action, EtcdAction::Expire);
        assert!(client
            .get(&created.node.key, false, false)
            .await
            .unwrap_err()
            .is_missing_key());
    }

    #[tokio::test(start_paused = true)]
    async fn overwrite_disarms_pending_expiry() {
        let client = DeterministicEtcdClient::new();
        client.set("/t/.a", "short", Some(5)).await.unwrap();
        client.set("/t/.a", "forever", None).await.unwrap();

        tokio::time::advance(Duration::from_secs(6)).await;
        // Let the disarmed expiry task observe the replacement.
        tokio::task::yield_now().await;

        let got = client.get("/t/.a", false, false).await.unwrap();
        assert_eq!(got.node.value, "forever");
    }

    #[tokio::test]
    async fn sync_cluster_hook() {
        let client = DeterministicEtcdClient::new();
        assert!(client.sync_cluster().await);
        client.set_cluster_reachable(false);
        assert!(!client.sync_cluster().await);
    }
}
