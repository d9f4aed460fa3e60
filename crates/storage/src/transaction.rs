//! Transaction trait for atomic storage operations.
//!
//! A [`Transaction`] buffers writes, deletes and compare-and-set preconditions
//! until [`commit`](Transaction::commit). At commit time every precondition is
//! verified and every buffered write is applied under a single critical
//! section: either all of them become visible or none of them do.
//!
//! Reads inside a transaction see the transaction's own pending writes.
//!
//! # Example
//!
//! ```
//! use sso_ticket_storage::{MemoryBackend, StorageBackend};
//!
//! # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
//! let backend = MemoryBackend::new();
//!
//! // Insert a ticket and its parent index entry atomically.
//! let mut txn = backend.transaction().await.unwrap();
//! txn.compare_and_set(b"ticket/ST-1".to_vec(), None, b"{}".to_vec(), None).unwrap();
//! txn.set(b"ticket-children/TGT-1/ST-1".to_vec(), Vec::new());
//! txn.commit().await.unwrap();
//!
//! assert!(backend.get(b"ticket/ST-1").await.unwrap().is_some());
//! # });
//! ```

use std::{
    collections::BTreeMap,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::StorageResult;

/// Transaction handle for atomic multi-operation commits.
///
/// # Concurrency
///
/// Preconditions are checked at commit time, not when they are buffered. If
/// another writer changed a guarded key in the meantime the commit fails with
/// [`StorageError::Conflict`](crate::StorageError::Conflict) and nothing is
/// written.
#[async_trait]
pub trait Transaction: Send {
    /// Gets a value within the transaction.
    ///
    /// Pending writes of this transaction take precedence over the stored
    /// value, so a key deleted in this transaction reads as `None`.
    async fn get(&self, key: &[u8]) -> StorageResult<Option<Bytes>>;

    /// Buffers an unconditional write without expiry.
    fn set(&mut self, key: Vec<u8>, value: Vec<u8>);

    /// Buffers an unconditional write that expires after `ttl`.
    ///
    /// The expiry is measured from commit time.
    fn set_with_ttl(&mut self, key: Vec<u8>, value: Vec<u8>, ttl: Duration);

    /// Buffers a delete.
    fn delete(&mut self, key: Vec<u8>);

    /// Buffers a conditional write.
    ///
    /// At commit time the stored value of `key` must equal `expected`
    /// (`None` requires the key to be absent). `ttl` sets the expiry of the
    /// new value; `None` stores it without expiry.
    ///
    /// # Errors
    ///
    /// Returns an error if the operation cannot be buffered. A failed
    /// precondition is reported by [`commit`](Transaction::commit), not here.
    fn compare_and_set(
        &mut self,
        key: Vec<u8>,
        expected: Option<Vec<u8>>,
        new_value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> StorageResult<()>;

    /// Commits all buffered operations atomically.
    ///
    /// # Errors
    ///
    /// - [`StorageError::Conflict`](crate::StorageError::Conflict) if any
    ///   buffered precondition no longer holds
    /// - Other [`StorageError`](crate::StorageError) variants on backend failures
    async fn commit(self: Box<Self>) -> StorageResult<()>;
}

/// A single state change produced by a committed operation.
///
/// Mutations carry absolute expiry instants so that applying the same
/// mutation on several nodes yields identical expiry behaviour.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Mutation {
    Put { key: Vec<u8>, value: Bytes, expires_at: Option<Instant> },
    Delete { key: Vec<u8> },
}

impl Mutation {
    pub(crate) fn put(key: Vec<u8>, value: impl Into<Bytes>, ttl: Option<Duration>) -> Self {
        Self::Put { key, value: value.into(), expires_at: ttl.map(|ttl| Instant::now() + ttl) }
    }

    pub(crate) fn key(&self) -> &[u8] {
        match self {
            Self::Put { key, .. } | Self::Delete { key } => key,
        }
    }
}

/// A buffered precondition: the stored value of `key` must equal `expected`.
#[derive(Debug, Clone)]
pub(crate) struct Precondition {
    pub(crate) key: Vec<u8>,
    pub(crate) expected: Option<Vec<u8>>,
}

#[derive(Debug, Clone)]
enum PendingWrite {
    Put { value: Vec<u8>, ttl: Option<Duration> },
    Delete,
}

/// Write buffer shared by the backend transaction implementations.
///
/// Conditional writes are kept in insertion order and applied before plain
/// writes; a later plain write to the same key wins.
#[derive(Debug, Default)]
pub(crate) struct PendingOps {
    writes: BTreeMap<Vec<u8>, PendingWrite>,
    conditional: Vec<(Precondition, Vec<u8>, Option<Duration>)>,
}

impl PendingOps {
    /// Returns `Some(value)` if this buffer determines the value of `key`.
    pub(crate) fn lookup(&self, key: &[u8]) -> Option<Option<Bytes>> {
        if let Some(write) = self.writes.get(key) {
            return Some(match write {
                PendingWrite::Put { value, .. } => Some(Bytes::copy_from_slice(value)),
                PendingWrite::Delete => None,
            });
        }
        self.conditional
            .iter()
            .rev()
            .find(|(pre, _, _)| pre.key == key)
            .map(|(_, value, _)| Some(Bytes::copy_from_slice(value)))
    }

    pub(crate) fn put(&mut self, key: Vec<u8>, value: Vec<u8>, ttl: Option<Duration>) {
        self.writes.insert(key, PendingWrite::Put { value, ttl });
    }

    pub(crate) fn delete(&mut self, key: Vec<u8>) {
        self.writes.insert(key, PendingWrite::Delete);
    }

    pub(crate) fn compare_and_set(
        &mut self,
        key: Vec<u8>,
        expected: Option<Vec<u8>>,
        new_value: Vec<u8>,
        ttl: Option<Duration>,
    ) {
        self.conditional.push((Precondition { key, expected }, new_value, ttl));
    }

    /// Splits the buffer into preconditions and the mutations to apply once
    /// they hold. Expiry instants are fixed here, at commit time.
    pub(crate) fn into_parts(self) -> (Vec<Precondition>, Vec<Mutation>) {
        let mut preconditions = Vec::with_capacity(self.conditional.len());
        let mut mutations = Vec::with_capacity(self.conditional.len() + self.writes.len());

        for (pre, value, ttl) in self.conditional {
            mutations.push(Mutation::put(pre.key.clone(), value, ttl));
            preconditions.push(pre);
        }
        for (key, write) in self.writes {
            mutations.push(match write {
                PendingWrite::Put { value, ttl } => Mutation::put(key, value, ttl),
                PendingWrite::Delete => Mutation::Delete { key },
            });
        }

        (preconditions, mutations)
    }
}
