//! Storage backend trait definition.
//!
//! [`StorageBackend`] is the key-value contract the ticket registry is written
//! against. Both the single-node [`MemoryBackend`](crate::MemoryBackend) and the
//! clustered [`ReplicatedBackend`](crate::ReplicatedBackend) implement it.
//!
//! The contract the registry relies on:
//!
//! - **Atomic conditional writes**: [`compare_and_set`](StorageBackend::compare_and_set)
//!   with `expected = None` is insert-if-absent; with `Some(bytes)` it is a
//!   classic compare-and-swap. Concurrent callers racing on the same key see
//!   exactly one winner.
//! - **Atomic take**: [`take`](StorageBackend::take) removes and returns a
//!   value in one step.
//! - **Native expiry**: values written with a TTL are invisible to reads once
//!   the TTL has elapsed, whether or not a background sweep removed them yet.
//! - **Transactions**: see [`Transaction`].
//!
//! # Implementing a Backend
//!
//! 1. Implement the [`StorageBackend`] trait
//! 2. Implement a corresponding [`Transaction`] type
//! 3. Map backend-specific errors to [`StorageError`]

use std::{
    ops::{Bound, RangeBounds},
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Serialize, de::DeserializeOwned};

use crate::{
    StorageError,
    error::StorageResult,
    transaction::Transaction,
    types::{KeyValue, prefix_end},
};

/// Abstract storage backend for key-value operations.
///
/// Implementations must be `Send + Sync` so that a single backend can be
/// shared across tasks behind an [`Arc`](std::sync::Arc).
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Retrieves the value stored at `key`, or `None` if it is absent or expired.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn get(&self, key: &[u8]) -> StorageResult<Option<Bytes>>;

    /// Stores `value` at `key` without expiry, replacing any existing value and TTL.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn set(&self, key: Vec<u8>, value: Vec<u8>) -> StorageResult<()>;

    /// Stores `value` at `key`, expiring after `ttl`.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn set_with_ttl(&self, key: Vec<u8>, value: Vec<u8>, ttl: Duration) -> StorageResult<()>;

    /// Atomically replaces the value at `key` if it currently equals `expected`.
    ///
    /// `expected = None` requires the key to be absent (or expired). `ttl`
    /// sets the expiry of the new value; `None` stores it without expiry.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Conflict`] when the precondition does not hold.
    /// Nothing is written in that case.
    #[must_use = "compare-and-set may fail with a conflict and errors must be handled"]
    async fn compare_and_set(
        &self,
        key: &[u8],
        expected: Option<&[u8]>,
        new_value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> StorageResult<()>;

    /// JSON convenience wrapper around [`compare_and_set`](Self::compare_and_set).
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Serialization`] if either value fails to
    /// serialize, otherwise the errors of `compare_and_set`.
    #[must_use = "compare-and-set may fail with a conflict and errors must be handled"]
    async fn compare_and_set_json<T>(
        &self,
        key: &[u8],
        expected: Option<&T>,
        new_value: &T,
        ttl: Option<Duration>,
    ) -> StorageResult<()>
    where
        T: Serialize + DeserializeOwned + Send + Sync,
    {
        let expected_bytes = expected
            .map(|v| serde_json::to_vec(v))
            .transpose()
            .map_err(|e| StorageError::encoding("encode expected value", e))?;

        let new_bytes = serde_json::to_vec(new_value)
            .map_err(|e| StorageError::encoding("encode new value", e))?;

        self.compare_and_set(key, expected_bytes.as_deref(), new_bytes, ttl).await
    }

    /// Deletes `key`. Returns whether a live value was removed.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn delete(&self, key: &[u8]) -> StorageResult<bool>;

    /// Atomically removes `key` and returns the value it held.
    ///
    /// Of several concurrent callers at most one receives `Some`.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn take(&self, key: &[u8]) -> StorageResult<Option<Bytes>>;

    /// Returns all live key-value pairs within `range`, ordered by key.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn get_range<R>(&self, range: R) -> StorageResult<Vec<KeyValue>>
    where
        R: RangeBounds<Vec<u8>> + Send;

    /// Returns all live key-value pairs whose key starts with `prefix`.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn get_prefix(&self, prefix: &[u8]) -> StorageResult<Vec<KeyValue>> {
        let end = prefix_end(prefix).map_or(Bound::Unbounded, Bound::Excluded);
        self.get_range((Bound::Included(prefix.to_vec()), end)).await
    }

    /// Removes every key within `range`. Returns the number of keys removed.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn clear_range<R>(&self, range: R) -> StorageResult<usize>
    where
        R: RangeBounds<Vec<u8>> + Send;

    /// Begins a new transaction.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn transaction(&self) -> StorageResult<Box<dyn Transaction>>;

    /// Verifies that the backend is able to serve requests.
    #[must_use = "health check results indicate backend availability and must be inspected"]
    async fn health_check(&self) -> StorageResult<()>;
}
