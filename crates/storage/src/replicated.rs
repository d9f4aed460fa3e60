//! Replicated storage backend.
//!
//! [`ReplicatedBackend`] simulates a small cluster of [`MemoryBackend`] nodes
//! inside one process. Node 0 is the primary and is authoritative for every
//! write, every atomic operation and every transaction commit. Each handle is
//! attached to one local node ([`ReplicatedBackend::for_node`] opens another
//! handle on the same cluster). A write is applied to the primary and to the
//! writer's local node synchronously, then shipped to every replica in commit
//! order once the configured replication interval has elapsed. The writer's
//! own node receives the batch again, so it converges with writes that other
//! nodes committed in between.
//!
//! The backend exists so that the ticket registry can be exercised against
//! the failure modes a clustered deployment actually has:
//!
//! - stale reads from a lagging replica under [`ReadConsistency::Eventual`]
//! - concurrent requests entering the cluster through different nodes
//! - a node cut off from the primary ([`ReplicatedBackend::isolate`]), which
//!   turns every primary-bound request into [`StorageError::Connection`]
//! - request latency ([`ReplicationConfig::network_latency`]) that can outlast
//!   a caller's deadline
//!
//! Latency is always paid *before* any state is touched, so a request
//! cancelled by a timeout leaves no partial write behind.
//!
//! # Example
//!
//! ```
//! use sso_ticket_storage::{ReplicatedBackend, ReplicationConfig, StorageBackend};
//!
//! # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
//! let backend = ReplicatedBackend::new(ReplicationConfig::default()).unwrap();
//! backend.compare_and_set(b"ticket/ST-1", None, b"{}".to_vec(), None).await.unwrap();
//! assert!(backend.get(b"ticket/ST-1").await.unwrap().is_some());
//! # });
//! ```

use std::{ops::RangeBounds, sync::Arc, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::{
    sync::{mpsc, watch},
    time::Instant,
};

use crate::{
    backend::StorageBackend,
    config::{ConfigError, ReadConsistency, ReplicationConfig},
    error::{StorageError, StorageResult},
    memory::{MemoryBackend, OwnedRange, owned_range},
    transaction::{Mutation, PendingOps, Precondition, Transaction},
    types::KeyValue,
};

/// Index of the primary node.
pub const PRIMARY_NODE: usize = 0;

/// A batch of mutations waiting to be applied on one replica.
struct ReplicationBatch {
    ready_at: Instant,
    mutations: Arc<[Mutation]>,
}

struct Node {
    store: MemoryBackend,
    isolated: watch::Sender<bool>,
}

struct Cluster {
    config: ReplicationConfig,
    nodes: Vec<Node>,
    /// Replication queues, one per non-primary node.
    replicas: Vec<mpsc::UnboundedSender<ReplicationBatch>>,
}

/// Storage backend over a simulated primary/replica cluster, seen from one
/// node.
///
/// Cheaply cloneable; clones share the cluster and the local node.
#[derive(Clone)]
pub struct ReplicatedBackend {
    cluster: Arc<Cluster>,
    local_node: usize,
}

impl std::fmt::Debug for ReplicatedBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicatedBackend")
            .field("config", &self.cluster.config)
            .field("local_node", &self.local_node)
            .finish()
    }
}

impl ReplicatedBackend {
    /// Builds the cluster, spawns one replication worker per replica and
    /// returns a handle attached to the configured local node.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the configuration is invalid.
    pub fn new(config: ReplicationConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        let nodes: Vec<Node> = (0..config.nodes())
            .map(|_| Node { store: MemoryBackend::new(), isolated: watch::channel(false).0 })
            .collect();

        let mut replicas = Vec::new();
        for (index, node) in nodes.iter().enumerate() {
            if index == PRIMARY_NODE {
                continue;
            }
            let (tx, rx) = mpsc::unbounded_channel();
            tokio::spawn(Self::replicate(index, node.store.clone(), rx, node.isolated.subscribe()));
            replicas.push(tx);
        }

        tracing::debug!(
            nodes = config.nodes(),
            local_node = config.local_node(),
            replicas = replicas.len(),
            "replicated backend started"
        );

        let local_node = config.local_node();
        Ok(Self { cluster: Arc::new(Cluster { config, nodes, replicas }), local_node })
    }

    /// Returns a handle on the same cluster attached to `node`.
    ///
    /// Requests through the new handle read from `node` under
    /// [`ReadConsistency::Eventual`] and reach the primary over the simulated
    /// network like any other replica.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if the cluster has no such node.
    pub fn for_node(&self, node: usize) -> Result<Self, ConfigError> {
        let nodes = self.cluster.nodes.len();
        if node >= nodes {
            return Err(ConfigError::invalid(
                "local_node",
                format!("node {node} does not exist in a {nodes}-node cluster"),
            ));
        }
        Ok(Self { cluster: Arc::clone(&self.cluster), local_node: node })
    }

    /// Returns the node this handle is attached to.
    #[must_use]
    pub fn local_node(&self) -> usize {
        self.local_node
    }

    /// Applies batches on one replica in arrival order. Exits once every
    /// sender is gone.
    async fn replicate(
        index: usize,
        store: MemoryBackend,
        mut rx: mpsc::UnboundedReceiver<ReplicationBatch>,
        mut isolated: watch::Receiver<bool>,
    ) {
        while let Some(batch) = rx.recv().await {
            tokio::time::sleep_until(batch.ready_at).await;
            // An isolated replica holds its backlog until it rejoins.
            loop {
                if !*isolated.borrow_and_update() {
                    break;
                }
                if isolated.changed().await.is_err() {
                    return;
                }
            }
            store.apply(&batch.mutations);
            tracing::trace!(node = index, mutations = batch.mutations.len(), "replicated batch");
        }
    }

    /// Returns the configuration this cluster was built from.
    #[must_use]
    pub fn config(&self) -> &ReplicationConfig {
        &self.cluster.config
    }

    /// Cuts `node` off from the rest of the cluster.
    ///
    /// Requests from an isolated node that need the primary fail with
    /// [`StorageError::Connection`]; an isolated replica stops receiving
    /// replicated writes. Isolating the primary cuts off every other node.
    pub fn isolate(&self, node: usize) {
        if let Some(node) = self.cluster.nodes.get(node) {
            node.isolated.send_replace(true);
        }
    }

    /// Reconnects a previously isolated node. Buffered replication resumes.
    pub fn rejoin(&self, node: usize) {
        if let Some(node) = self.cluster.nodes.get(node) {
            node.isolated.send_replace(false);
        }
    }

    /// Returns a handle to the raw store of `node`, bypassing routing.
    ///
    /// Intended for inspecting replica state in tests and diagnostics.
    #[must_use]
    pub fn node_store(&self, node: usize) -> Option<MemoryBackend> {
        self.cluster.nodes.get(node).map(|n| n.store.clone())
    }

    fn is_isolated(&self, node: usize) -> bool {
        self.cluster.nodes.get(node).is_some_and(|n| *n.isolated.borrow())
    }

    fn local(&self) -> &MemoryBackend {
        &self.cluster.nodes[self.local_node].store
    }

    /// Resolves the primary for a request issued by the local node, paying
    /// the simulated round trip first.
    async fn primary(&self) -> StorageResult<&MemoryBackend> {
        let local = self.local_node;
        if local != PRIMARY_NODE {
            let latency = self.cluster.config.network_latency();
            if !latency.is_zero() {
                tokio::time::sleep(latency).await;
            }
            if self.is_isolated(local) || self.is_isolated(PRIMARY_NODE) {
                return Err(StorageError::connection(format!(
                    "node {local} cannot reach primary node {PRIMARY_NODE}"
                )));
            }
        }
        Ok(&self.cluster.nodes[PRIMARY_NODE].store)
    }

    /// Pushes mutations committed on the primary to the rest of the cluster.
    fn propagate(&self, mutations: Vec<Mutation>) {
        if mutations.is_empty() {
            return;
        }
        if self.local_node != PRIMARY_NODE {
            self.local().apply(&mutations);
        }
        let ready_at = Instant::now() + self.cluster.config.replication_interval();
        let mutations: Arc<[Mutation]> = mutations.into();
        for replica in &self.cluster.replicas {
            // A closed queue means its worker has already shut down.
            let _ = replica.send(ReplicationBatch { ready_at, mutations: Arc::clone(&mutations) });
        }
    }

    async fn read(&self, key: &[u8]) -> StorageResult<Option<Bytes>> {
        match self.cluster.config.read_consistency() {
            ReadConsistency::Eventual => Ok(self.local().read(key)),
            ReadConsistency::Linearizable => Ok(self.primary().await?.read(key)),
        }
    }

    async fn write(&self, mutation: Mutation) -> StorageResult<()> {
        let primary = self.primary().await?;
        primary.apply(std::slice::from_ref(&mutation));
        self.propagate(vec![mutation]);
        Ok(())
    }

    async fn commit(
        &self,
        preconditions: &[Precondition],
        mutations: Vec<Mutation>,
    ) -> StorageResult<()> {
        let primary = self.primary().await?;
        primary.commit(preconditions, &mutations)?;
        self.propagate(mutations);
        Ok(())
    }

    async fn remove_on_primary(&self, key: &[u8]) -> StorageResult<Option<Bytes>> {
        let primary = self.primary().await?;
        let removed = primary.remove(key);
        if removed.is_some() {
            self.propagate(vec![Mutation::Delete { key: key.to_vec() }]);
        }
        Ok(removed)
    }

    async fn read_range(&self, range: OwnedRange) -> StorageResult<Vec<KeyValue>> {
        match self.cluster.config.read_consistency() {
            ReadConsistency::Eventual => Ok(self.local().read_range(range)),
            ReadConsistency::Linearizable => Ok(self.primary().await?.read_range(range)),
        }
    }
}

#[async_trait]
impl StorageBackend for ReplicatedBackend {
    #[tracing::instrument(skip_all, fields(node = self.local_node))]
    async fn get(&self, key: &[u8]) -> StorageResult<Option<Bytes>> {
        self.read(key).await
    }

    #[tracing::instrument(skip_all, fields(node = self.local_node))]
    async fn set(&self, key: Vec<u8>, value: Vec<u8>) -> StorageResult<()> {
        self.write(Mutation::put(key, value, None)).await
    }

    #[tracing::instrument(skip_all, fields(node = self.local_node))]
    async fn set_with_ttl(&self, key: Vec<u8>, value: Vec<u8>, ttl: Duration) -> StorageResult<()> {
        self.write(Mutation::put(key, value, Some(ttl))).await
    }

    #[tracing::instrument(skip_all, fields(node = self.local_node))]
    async fn compare_and_set(
        &self,
        key: &[u8],
        expected: Option<&[u8]>,
        new_value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> StorageResult<()> {
        let precondition =
            Precondition { key: key.to_vec(), expected: expected.map(<[u8]>::to_vec) };
        self.commit(&[precondition], vec![Mutation::put(key.to_vec(), new_value, ttl)]).await
    }

    #[tracing::instrument(skip_all, fields(node = self.local_node))]
    async fn delete(&self, key: &[u8]) -> StorageResult<bool> {
        Ok(self.remove_on_primary(key).await?.is_some())
    }

    #[tracing::instrument(skip_all, fields(node = self.local_node))]
    async fn take(&self, key: &[u8]) -> StorageResult<Option<Bytes>> {
        self.remove_on_primary(key).await
    }

    #[tracing::instrument(skip_all, fields(node = self.local_node))]
    async fn get_range<R>(&self, range: R) -> StorageResult<Vec<KeyValue>>
    where
        R: RangeBounds<Vec<u8>> + Send,
    {
        self.read_range(owned_range(&range)).await
    }

    #[tracing::instrument(skip_all, fields(node = self.local_node))]
    async fn clear_range<R>(&self, range: R) -> StorageResult<usize>
    where
        R: RangeBounds<Vec<u8>> + Send,
    {
        let range = owned_range(&range);
        let primary = self.primary().await?;
        let removed = primary.remove_range(range);
        let count = removed.len();
        self.propagate(removed.into_iter().map(|key| Mutation::Delete { key }).collect());
        Ok(count)
    }

    #[tracing::instrument(skip_all, fields(node = self.local_node))]
    async fn transaction(&self) -> StorageResult<Box<dyn Transaction>> {
        let pending = PendingOps::default();
        Ok(Box::new(ReplicatedTransaction { backend: self.clone(), pending }))
    }

    #[tracing::instrument(skip_all, fields(node = self.local_node))]
    async fn health_check(&self) -> StorageResult<()> {
        self.primary().await?.health_check().await
    }
}

/// Transaction whose commit executes on the primary.
struct ReplicatedTransaction {
    backend: ReplicatedBackend,
    pending: PendingOps,
}

#[async_trait]
impl Transaction for ReplicatedTransaction {
    async fn get(&self, key: &[u8]) -> StorageResult<Option<Bytes>> {
        match self.pending.lookup(key) {
            Some(value) => Ok(value),
            None => self.backend.read(key).await,
        }
    }

    fn set(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.pending.put(key, value, None);
    }

    fn set_with_ttl(&mut self, key: Vec<u8>, value: Vec<u8>, ttl: Duration) {
        self.pending.put(key, value, Some(ttl));
    }

    fn delete(&mut self, key: Vec<u8>) {
        self.pending.delete(key);
    }

    fn compare_and_set(
        &mut self,
        key: Vec<u8>,
        expected: Option<Vec<u8>>,
        new_value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> StorageResult<()> {
        self.pending.compare_and_set(key, expected, new_value, ttl);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> StorageResult<()> {
        let (preconditions, mutations) = self.pending.into_parts();
        self.backend.commit(&preconditions, mutations).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn cluster(local_node: usize, consistency: ReadConsistency) -> ReplicatedBackend {
        let config = ReplicationConfig::builder()
            .nodes(3)
            .local_node(local_node)
            .replication_interval(Duration::from_millis(30))
            .read_consistency(consistency)
            .build()
            .unwrap();
        ReplicatedBackend::new(config).unwrap()
    }

    #[tokio::test]
    async fn test_write_visible_on_primary_and_local_immediately() {
        let backend = cluster(1, ReadConsistency::Eventual);
        backend.set(b"k".to_vec(), b"v".to_vec()).await.unwrap();

        assert!(backend.node_store(0).unwrap().read(b"k").is_some());
        assert!(backend.node_store(1).unwrap().read(b"k").is_some());
        // Node 2 only sees the write after the replication interval.
        assert!(backend.node_store(2).unwrap().read(b"k").is_none());

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(backend.node_store(2).unwrap().read(b"k").is_some());
    }

    #[tokio::test]
    async fn test_isolated_local_node_reports_connection_error() {
        let backend = cluster(1, ReadConsistency::Linearizable);
        backend.isolate(1);

        let err = backend.set(b"k".to_vec(), b"v".to_vec()).await.unwrap_err();
        assert!(matches!(err, StorageError::Connection { .. }));
        assert!(backend.get(b"k").await.is_err());

        backend.rejoin(1);
        backend.set(b"k".to_vec(), b"v".to_vec()).await.unwrap();
    }

    #[tokio::test]
    async fn test_node_handles_share_the_cluster() {
        let first = cluster(1, ReadConsistency::Eventual);
        let second = first.for_node(2).unwrap();
        assert_eq!(second.local_node(), 2);
        assert!(matches!(first.for_node(3), Err(ConfigError::Invalid { .. })));

        first.set(b"k".to_vec(), b"v".to_vec()).await.unwrap();
        assert!(second.get(b"k").await.unwrap().is_none(), "node 2 has not caught up");

        // The primary decides: a stale local view cannot win an insert.
        let err = second.compare_and_set(b"k", None, b"w".to_vec(), None).await.unwrap_err();
        assert!(matches!(err, StorageError::Conflict));

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(second.get(b"k").await.unwrap(), Some(Bytes::from("v")));
        assert_eq!(first.get(b"k").await.unwrap(), Some(Bytes::from("v")));
    }

    #[tokio::test]
    async fn test_isolated_replica_catches_up_after_rejoin() {
        let backend = cluster(0, ReadConsistency::Linearizable);
        backend.isolate(2);
        backend.set(b"k".to_vec(), b"v".to_vec()).await.unwrap();

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(backend.node_store(2).unwrap().read(b"k").is_none());

        backend.rejoin(2);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(backend.node_store(2).unwrap().read(b"k").is_some());
    }
}
