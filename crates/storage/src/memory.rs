//! In-memory storage backend implementation.
//!
//! [`MemoryBackend`] keeps all entries in a [`BTreeMap`] guarded by a single
//! [`parking_lot::RwLock`]. Every mutating operation, including transaction
//! commits, runs inside one write-lock critical section, which makes
//! compare-and-set, take and commit linearizable.
//!
//! Expiry is enforced on read: an entry whose deadline has passed is invisible
//! immediately. A background task additionally purges expired entries so that
//! memory is reclaimed.
//!
//! # Example
//!
//! ```
//! use sso_ticket_storage::{MemoryBackend, StorageBackend};
//!
//! #[tokio::main]
//! async fn main() {
//!     let backend = MemoryBackend::new();
//!
//!     backend.set(b"ticket/TGT-1".to_vec(), b"{}".to_vec()).await.unwrap();
//!     let taken = backend.take(b"ticket/TGT-1").await.unwrap();
//!
//!     assert!(taken.is_some());
//!     assert!(backend.take(b"ticket/TGT-1").await.unwrap().is_none());
//! }
//! ```

use std::{
    collections::BTreeMap,
    ops::{Bound, RangeBounds},
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use bytes::Bytes;
use fail::fail_point;
use parking_lot::RwLock;
use tokio::{select, sync::watch, time::sleep};

use crate::{
    backend::StorageBackend,
    error::{StorageError, StorageResult},
    transaction::{Mutation, PendingOps, Precondition, Transaction},
    types::KeyValue,
};

/// Default period of the background expiry sweep.
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(1);

pub(crate) type OwnedRange = (Bound<Vec<u8>>, Bound<Vec<u8>>);

pub(crate) fn owned_range<R: RangeBounds<Vec<u8>>>(range: &R) -> OwnedRange {
    (range.start_bound().cloned(), range.end_bound().cloned())
}

/// Returns `false` for ranges a `BTreeMap` refuses to iterate (start after
/// end, or an empty range with both bounds excluded). Such ranges select
/// nothing.
fn is_scannable(range: &OwnedRange) -> bool {
    match range {
        (Bound::Included(start), Bound::Included(end)) => start <= end,
        (Bound::Included(start) | Bound::Excluded(start), Bound::Excluded(end))
        | (Bound::Excluded(start), Bound::Included(end)) => start < end,
        _ => true,
    }
}

/// Holds the shutdown signal sender. When dropped, the watch channel
/// closes and the cleanup task exits.
struct ShutdownGuard {
    shutdown_tx: watch::Sender<()>,
}

impl Drop for ShutdownGuard {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(());
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    data: BTreeMap<Vec<u8>, Bytes>,
    expiries: BTreeMap<Vec<u8>, Instant>,
}

impl MemoryState {
    fn is_expired(&self, key: &[u8], now: Instant) -> bool {
        self.expiries.get(key).is_some_and(|deadline| *deadline <= now)
    }

    fn live(&self, key: &[u8], now: Instant) -> Option<&Bytes> {
        if self.is_expired(key, now) { None } else { self.data.get(key) }
    }

    fn holds(&self, precondition: &Precondition, now: Instant) -> bool {
        match (&precondition.expected, self.live(&precondition.key, now)) {
            (None, None) => true,
            (Some(expected), Some(current)) => expected.as_slice() == current.as_ref(),
            _ => false,
        }
    }

    fn apply(&mut self, mutation: Mutation) {
        match mutation {
            Mutation::Put { key, value, expires_at } => {
                match expires_at {
                    Some(deadline) => {
                        self.expiries.insert(key.clone(), deadline);
                    },
                    None => {
                        self.expiries.remove(&key);
                    },
                }
                self.data.insert(key, value);
            },
            Mutation::Delete { key } => {
                self.data.remove(&key);
                self.expiries.remove(&key);
            },
        }
    }

    /// Removes `key`, returning its value if it was still live.
    fn remove(&mut self, key: &[u8], now: Instant) -> Option<Bytes> {
        let expired = self.is_expired(key, now);
        self.expiries.remove(key);
        let value = self.data.remove(key);
        if expired { None } else { value }
    }
}

/// In-memory storage backend.
///
/// # Cloning
///
/// `MemoryBackend` is cheaply cloneable via [`Arc`]. All clones share the
/// same underlying data store.
///
/// # Shutdown
///
/// The background expiry task stops automatically when all clones are
/// dropped. [`shutdown`](Self::shutdown) stops it explicitly.
#[derive(Clone)]
pub struct MemoryBackend {
    state: Arc<RwLock<MemoryState>>,
    shutdown_guard: Arc<ShutdownGuard>,
}

impl std::fmt::Debug for MemoryBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBackend").field("len", &self.state.read().data.len()).finish()
    }
}

impl MemoryBackend {
    /// Creates a new in-memory backend with the default cleanup interval.
    ///
    /// Must be called from within a Tokio runtime: the expiry sweep is
    /// spawned as a background task.
    pub fn new() -> Self {
        Self::with_cleanup_interval(DEFAULT_CLEANUP_INTERVAL)
    }

    /// Creates a new in-memory backend whose expiry sweep runs every `interval`.
    pub fn with_cleanup_interval(interval: Duration) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(());
        let backend = Self {
            state: Arc::new(RwLock::new(MemoryState::default())),
            shutdown_guard: Arc::new(ShutdownGuard { shutdown_tx }),
        };

        // The task holds only a weak handle so that dropping every clone
        // releases the state even before the shutdown signal is observed.
        let state = Arc::downgrade(&backend.state);
        tokio::spawn(async move {
            Self::cleanup_expired_keys(state, interval, shutdown_rx).await;
        });

        backend
    }

    async fn cleanup_expired_keys(
        state: std::sync::Weak<RwLock<MemoryState>>,
        interval: Duration,
        mut shutdown_rx: watch::Receiver<()>,
    ) {
        loop {
            select! {
                _ = sleep(interval) => {}
                _ = shutdown_rx.changed() => {
                    return;
                }
            }

            let Some(state) = state.upgrade() else {
                return;
            };

            let now = Instant::now();
            let expired: Vec<Vec<u8>> = state
                .read()
                .expiries
                .iter()
                .filter(|(_, deadline)| **deadline <= now)
                .map(|(key, _)| key.clone())
                .collect();

            if !expired.is_empty() {
                let mut guard = state.write();
                for key in &expired {
                    // Re-check under the write lock: the key may have been
                    // rewritten with a new deadline since the scan.
                    if guard.is_expired(key, now) {
                        guard.data.remove(key);
                        guard.expiries.remove(key);
                    }
                }
                tracing::trace!(removed = expired.len(), "purged expired keys");
            }
        }
    }

    /// Explicitly signals the background expiry task to stop.
    pub fn shutdown(&self) {
        let _ = self.shutdown_guard.shutdown_tx.send(());
    }

    /// Returns the number of stored entries, including expired entries not
    /// yet purged.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.read().data.len()
    }

    /// Returns `true` if no entries are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.read().data.is_empty()
    }

    pub(crate) fn read(&self, key: &[u8]) -> Option<Bytes> {
        self.state.read().live(key, Instant::now()).cloned()
    }

    pub(crate) fn read_range(&self, range: OwnedRange) -> Vec<KeyValue> {
        if !is_scannable(&range) {
            return Vec::new();
        }
        let now = Instant::now();
        let state = self.state.read();
        state
            .data
            .range::<Vec<u8>, _>(range)
            .filter(|(key, _)| !state.is_expired(key, now))
            .map(|(key, value)| KeyValue::new(Bytes::copy_from_slice(key), value.clone()))
            .collect()
    }

    /// Applies mutations unconditionally, in order.
    pub(crate) fn apply(&self, mutations: &[Mutation]) {
        let mut state = self.state.write();
        for mutation in mutations {
            state.apply(mutation.clone());
        }
    }

    /// Verifies every precondition and, if all hold, applies `mutations`
    /// within the same critical section.
    pub(crate) fn commit(
        &self,
        preconditions: &[Precondition],
        mutations: &[Mutation],
    ) -> StorageResult<()> {
        fail_point!("memory-before-commit", |_| {
            Err(StorageError::internal("injected failure before commit"))
        });

        let now = Instant::now();
        let mut state = self.state.write();
        if !preconditions.iter().all(|pre| state.holds(pre, now)) {
            return Err(StorageError::Conflict);
        }
        for mutation in mutations {
            state.apply(mutation.clone());
        }
        Ok(())
    }

    pub(crate) fn remove(&self, key: &[u8]) -> Option<Bytes> {
        self.state.write().remove(key, Instant::now())
    }

    /// Removes every key in `range`, returning the keys that were live.
    pub(crate) fn remove_range(&self, range: OwnedRange) -> Vec<Vec<u8>> {
        if !is_scannable(&range) {
            return Vec::new();
        }
        let now = Instant::now();
        let mut state = self.state.write();
        let keys: Vec<Vec<u8>> =
            state.data.range::<Vec<u8>, _>(range).map(|(key, _)| key.clone()).collect();
        keys.into_iter().filter(|key| state.remove(key, now).is_some()).collect()
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    #[tracing::instrument(skip_all, fields(key_len = key.len()))]
    async fn get(&self, key: &[u8]) -> StorageResult<Option<Bytes>> {
        Ok(self.read(key))
    }

    #[tracing::instrument(skip_all, fields(key_len = key.len()))]
    async fn set(&self, key: Vec<u8>, value: Vec<u8>) -> StorageResult<()> {
        self.apply(&[Mutation::put(key, value, None)]);
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(key_len = key.len(), ttl_ms = ttl.as_millis() as u64))]
    async fn set_with_ttl(&self, key: Vec<u8>, value: Vec<u8>, ttl: Duration) -> StorageResult<()> {
        self.apply(&[Mutation::put(key, value, Some(ttl))]);
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(key_len = key.len()))]
    async fn compare_and_set(
        &self,
        key: &[u8],
        expected: Option<&[u8]>,
        new_value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> StorageResult<()> {
        let precondition =
            Precondition { key: key.to_vec(), expected: expected.map(<[u8]>::to_vec) };
        self.commit(&[precondition], &[Mutation::put(key.to_vec(), new_value, ttl)])
    }

    #[tracing::instrument(skip_all, fields(key_len = key.len()))]
    async fn delete(&self, key: &[u8]) -> StorageResult<bool> {
        Ok(self.remove(key).is_some())
    }

    #[tracing::instrument(skip_all, fields(key_len = key.len()))]
    async fn take(&self, key: &[u8]) -> StorageResult<Option<Bytes>> {
        Ok(self.remove(key))
    }

    #[tracing::instrument(skip_all)]
    async fn get_range<R>(&self, range: R) -> StorageResult<Vec<KeyValue>>
    where
        R: RangeBounds<Vec<u8>> + Send,
    {
        Ok(self.read_range(owned_range(&range)))
    }

    #[tracing::instrument(skip_all)]
    async fn clear_range<R>(&self, range: R) -> StorageResult<usize>
    where
        R: RangeBounds<Vec<u8>> + Send,
    {
        Ok(self.remove_range(owned_range(&range)).len())
    }

    #[tracing::instrument(skip_all)]
    async fn transaction(&self) -> StorageResult<Box<dyn Transaction>> {
        Ok(Box::new(MemoryTransaction { backend: self.clone(), pending: PendingOps::default() }))
    }

    #[tracing::instrument(skip_all)]
    async fn health_check(&self) -> StorageResult<()> {
        fail_point!("health-check", |_| Err(StorageError::internal("injected health failure")));
        // Acquiring the lock proves the backend is not wedged.
        let _unused = self.state.read();
        Ok(())
    }
}

/// In-memory transaction: buffers operations until commit.
struct MemoryTransaction {
    backend: MemoryBackend,
    pending: PendingOps,
}

#[async_trait]
impl Transaction for MemoryTransaction {
    async fn get(&self, key: &[u8]) -> StorageResult<Option<Bytes>> {
        match self.pending.lookup(key) {
            Some(value) => Ok(value),
            None => Ok(self.backend.read(key)),
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
        self.backend.commit(&preconditions, &mutations)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_basic_operations() {
        let backend = MemoryBackend::new();

        backend.set(b"key1".to_vec(), b"value1".to_vec()).await.unwrap();
        assert_eq!(backend.get(b"key1").await.unwrap(), Some(Bytes::from("value1")));

        assert!(backend.delete(b"key1").await.unwrap());
        assert!(!backend.delete(b"key1").await.unwrap());
        assert_eq!(backend.get(b"key1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_take_returns_value_once() {
        let backend = MemoryBackend::new();
        backend.set(b"code".to_vec(), b"v".to_vec()).await.unwrap();

        assert_eq!(backend.take(b"code").await.unwrap(), Some(Bytes::from("v")));
        assert_eq!(backend.take(b"code").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_range_and_clear() {
        let backend = MemoryBackend::new();
        for key in [b"a", b"b", b"c"] {
            backend.set(key.to_vec(), b"1".to_vec()).await.unwrap();
        }

        let range = backend.get_range(b"a".to_vec()..b"c".to_vec()).await.unwrap();
        assert_eq!(range.len(), 2);
        assert_eq!(range[0].key, Bytes::from("a"));

        let removed = backend.clear_range(b"a".to_vec()..b"c".to_vec()).await.unwrap();
        assert_eq!(removed, 2);
        assert_eq!(backend.get(b"c").await.unwrap(), Some(Bytes::from("1")));
    }

    #[tokio::test]
    async fn test_expired_entry_invisible_before_purge() {
        let backend = MemoryBackend::with_cleanup_interval(Duration::from_secs(3600));
        backend
            .set_with_ttl(b"temp".to_vec(), b"value".to_vec(), Duration::from_millis(20))
            .await
            .unwrap();
        assert!(backend.get(b"temp").await.unwrap().is_some());

        // Expiry is measured with std::time::Instant, so wait in real time.
        std::thread::sleep(Duration::from_millis(40));

        assert_eq!(backend.get(b"temp").await.unwrap(), None);
        assert_eq!(backend.take(b"temp").await.unwrap(), None);
        assert!(backend.compare_and_set(b"temp", None, b"fresh".to_vec(), None).await.is_ok());
    }

    #[tokio::test]
    async fn test_compare_and_set_keeps_requested_ttl() {
        let backend = MemoryBackend::new();
        backend.set(b"k".to_vec(), b"v1".to_vec()).await.unwrap();

        backend
            .compare_and_set(b"k", Some(b"v1"), b"v2".to_vec(), Some(Duration::from_millis(20)))
            .await
            .unwrap();
        std::thread::sleep(Duration::from_millis(40));

        assert_eq!(backend.get(b"k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_compare_and_set_conflict_leaves_value() {
        let backend = MemoryBackend::new();
        backend.set(b"key".to_vec(), b"value1".to_vec()).await.unwrap();

        let result =
            backend.compare_and_set(b"key", Some(b"wrong"), b"value2".to_vec(), None).await;

        assert!(matches!(result, Err(StorageError::Conflict)));
        assert_eq!(backend.get(b"key").await.unwrap(), Some(Bytes::from("value1")));
    }

    #[tokio::test]
    async fn test_transaction_read_your_writes() {
        let backend = MemoryBackend::new();
        backend.set(b"key1".to_vec(), b"value1".to_vec()).await.unwrap();

        let mut txn = backend.transaction().await.unwrap();
        txn.set(b"key2".to_vec(), b"value2".to_vec());
        txn.delete(b"key1".to_vec());
        assert_eq!(txn.get(b"key2").await.unwrap(), Some(Bytes::from("value2")));
        assert_eq!(txn.get(b"key1").await.unwrap(), None);

        // Nothing is visible before commit.
        assert_eq!(backend.get(b"key2").await.unwrap(), None);
        txn.commit().await.unwrap();

        assert_eq!(backend.get(b"key1").await.unwrap(), None);
        assert_eq!(backend.get(b"key2").await.unwrap(), Some(Bytes::from("value2")));
    }

    #[tokio::test]
    async fn test_transaction_conflict_writes_nothing() {
        let backend = MemoryBackend::new();
        backend.set(b"taken".to_vec(), b"x".to_vec()).await.unwrap();

        let mut txn = backend.transaction().await.unwrap();
        txn.set(b"index".to_vec(), Vec::new());
        txn.compare_and_set(b"taken".to_vec(), None, b"y".to_vec(), None).unwrap();

        assert!(matches!(txn.commit().await, Err(StorageError::Conflict)));
        assert_eq!(backend.get(b"index").await.unwrap(), None);
        assert_eq!(backend.get(b"taken").await.unwrap(), Some(Bytes::from("x")));
    }

    #[tokio::test]
    async fn test_clone_shares_data() {
        let backend1 = MemoryBackend::new();
        let backend2 = backend1.clone();

        backend1.set(b"key".to_vec(), b"value".to_vec()).await.unwrap();
        assert_eq!(backend2.get(b"key").await.unwrap(), Some(Bytes::from("value")));
    }

    #[tokio::test]
    async fn test_overwrite_clears_ttl() {
        let backend = MemoryBackend::new();
        backend
            .set_with_ttl(b"key".to_vec(), b"temp".to_vec(), Duration::from_millis(20))
            .await
            .unwrap();
        backend.set(b"key".to_vec(), b"permanent".to_vec()).await.unwrap();

        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(backend.get(b"key").await.unwrap(), Some(Bytes::from("permanent")));
    }

    mod proptests {
        use proptest::prelude::*;

        use super::*;

        fn arb_keys() -> impl Strategy<Value = Vec<Vec<u8>>> {
            proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..8), 0..40)
        }

        proptest! {
            /// A prefix scan returns exactly the live keys starting with the prefix.
            #[test]
            fn prefix_scan_matches_filter(
                keys in arb_keys(),
                prefix in proptest::collection::vec(any::<u8>(), 1..3),
            ) {
                let rt = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .expect("runtime");

                rt.block_on(async {
                    let backend = MemoryBackend::new();
                    for key in &keys {
                        backend.set(key.clone(), b"v".to_vec()).await.unwrap();
                    }

                    let mut expected: Vec<Vec<u8>> =
                        keys.iter().filter(|k| k.starts_with(&prefix)).cloned().collect();
                    expected.sort();
                    expected.dedup();

                    let found: Vec<Vec<u8>> = backend
                        .get_prefix(&prefix)
                        .await
                        .unwrap()
                        .into_iter()
                        .map(|kv| kv.key.to_vec())
                        .collect();

                    prop_assert_eq!(found, expected);
                    Ok(())
                })?;
            }

            /// Of any sequence of insert-if-absent attempts on one key, only the first wins.
            #[test]
            fn insert_if_absent_first_writer_wins(
                values in proptest::collection::vec(
                    proptest::collection::vec(any::<u8>(), 1..8),
                    1..10,
                ),
            ) {
                let rt = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .expect("runtime");

                rt.block_on(async {
                    let backend = MemoryBackend::new();
                    let mut winners = 0;
                    for value in &values {
                        let inserted =
                            backend.compare_and_set(b"ticket", None, value.clone(), None).await;
                        if inserted.is_ok() {
                            winners += 1;
                        }
                    }
                    prop_assert_eq!(winners, 1);
                    prop_assert_eq!(
                        backend.get(b"ticket").await.unwrap(),
                        Some(Bytes::from(values[0].clone()))
                    );
                    Ok(())
                })?;
            }
        }
    }
}
