//! Conformance test suite for [`StorageBackend`] implementations.
//!
//! Each function checks one aspect of the contract the ticket registry relies
//! on. Run them against a fresh backend:
//!
//! ```no_run
//! use sso_ticket_storage::{MemoryBackend, conformance};
//!
//! #[tokio::test]
//! async fn cas_insert_if_absent() {
//!     conformance::cas_insert_if_absent(&MemoryBackend::new()).await;
//! }
//! ```
//!
//! # Test Categories
//!
//! | Category | Contract aspect |
//! |----------|-----------------|
//! | CRUD | get/set/delete semantics, delete reports existence |
//! | Take | atomic get-and-delete |
//! | Range | prefix scans and range clears |
//! | TTL | expiry visible on read, CAS carries TTL |
//! | Transaction | atomic commit, read-your-writes, conflict writes nothing |
//! | CAS | precondition checks |
//! | Concurrent | exactly one winner for CAS and take |

use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use tokio::task::JoinSet;

use crate::{assert_conflict, backend::StorageBackend};

// ============================================================================
// CRUD
// ============================================================================

/// `get` on a nonexistent key returns `Ok(None)`.
pub async fn crud_get_returns_none_for_missing_key<B: StorageBackend>(backend: &B) {
    let result = backend.get(b"nonexistent").await;
    assert_eq!(result.expect("get should not error on missing key"), None);
}

/// `set` then `get` round-trips; a second `set` overwrites.
pub async fn crud_set_overwrites_existing<B: StorageBackend>(backend: &B) {
    backend.set(b"k1".to_vec(), b"original".to_vec()).await.expect("set");
    backend.set(b"k1".to_vec(), b"updated".to_vec()).await.expect("overwrite");
    assert_eq!(backend.get(b"k1").await.expect("get"), Some(Bytes::from("updated")));
}

/// `delete` reports whether a live key was removed.
pub async fn crud_delete_reports_existence<B: StorageBackend>(backend: &B) {
    backend.set(b"k2".to_vec(), b"val".to_vec()).await.expect("set");
    assert!(backend.delete(b"k2").await.expect("first delete"), "existing key");
    assert!(!backend.delete(b"k2").await.expect("second delete"), "already deleted");
    assert_eq!(backend.get(b"k2").await.expect("get after delete"), None);
}

// ============================================================================
// Take
// ============================================================================

/// `take` returns the value and removes the key.
pub async fn take_removes_and_returns<B: StorageBackend>(backend: &B) {
    backend.set(b"code".to_vec(), b"payload".to_vec()).await.expect("set");
    assert_eq!(backend.take(b"code").await.expect("take"), Some(Bytes::from("payload")));
    assert_eq!(backend.take(b"code").await.expect("second take"), None);
    assert_eq!(backend.get(b"code").await.expect("get"), None);
}

// ============================================================================
// Range
// ============================================================================

/// `get_prefix` returns only keys under the prefix, in key order.
pub async fn range_prefix_scan_is_ordered_and_bounded<B: StorageBackend>(backend: &B) {
    for key in [&b"idx/b/2"[..], b"idx/a/1", b"idx/b/1", b"idx0", b"idw"] {
        backend.set(key.to_vec(), Vec::new()).await.expect("set");
    }
    let results = backend.get_prefix(b"idx/b/").await.expect("get_prefix");
    let keys: Vec<&[u8]> = results.iter().map(|kv| kv.key.as_ref()).collect();
    assert_eq!(keys, vec![b"idx/b/1".as_slice(), b"idx/b/2"]);
}

/// `clear_range` removes keys in range and reports how many.
pub async fn range_clear_range_removes_keys<B: StorageBackend>(backend: &B) {
    for key in [b"c:a", b"c:b", b"c:c"] {
        backend.set(key.to_vec(), b"v".to_vec()).await.expect("set");
    }
    let removed = backend.clear_range(b"c:a".to_vec()..b"c:c".to_vec()).await.expect("clear");
    assert_eq!(removed, 2);
    assert_eq!(backend.get(b"c:c").await.expect("get"), Some(Bytes::from("v")));
}

// ============================================================================
// TTL
// ============================================================================

/// A key written with a TTL becomes invisible once it elapses.
pub async fn ttl_key_expires<B: StorageBackend>(backend: &B) {
    backend
        .set_with_ttl(b"ttl".to_vec(), b"v".to_vec(), Duration::from_millis(50))
        .await
        .expect("set_with_ttl");
    assert!(backend.get(b"ttl").await.expect("get").is_some());
    tokio::time::sleep(Duration::from_millis(120)).await;
    assert_eq!(backend.get(b"ttl").await.expect("get after expiry"), None);
    assert!(backend.get_prefix(b"ttl").await.expect("scan").is_empty());
}

/// An expired key counts as absent for insert-if-absent.
pub async fn ttl_expired_key_is_absent_for_cas<B: StorageBackend>(backend: &B) {
    backend
        .set_with_ttl(b"slot".to_vec(), b"old".to_vec(), Duration::from_millis(20))
        .await
        .expect("set_with_ttl");
    tokio::time::sleep(Duration::from_millis(60)).await;
    backend.compare_and_set(b"slot", None, b"new".to_vec(), None).await.expect("cas on expired");
}

/// A compare-and-set write carries the TTL it was given.
pub async fn ttl_cas_applies_ttl<B: StorageBackend>(backend: &B) {
    backend.set(b"st".to_vec(), b"fresh".to_vec()).await.expect("set");
    backend
        .compare_and_set(
            b"st",
            Some(b"fresh"),
            b"consumed".to_vec(),
            Some(Duration::from_millis(50)),
        )
        .await
        .expect("cas");
    assert_eq!(backend.get(b"st").await.expect("get"), Some(Bytes::from("consumed")));
    tokio::time::sleep(Duration::from_millis(120)).await;
    assert_eq!(backend.get(b"st").await.expect("get after expiry"), None);
}

// ============================================================================
// Transaction
// ============================================================================

/// Pending writes are visible inside the transaction only.
pub async fn tx_read_your_writes<B: StorageBackend>(backend: &B) {
    let mut tx = backend.transaction().await.expect("begin");
    tx.set(b"tx:k".to_vec(), b"v".to_vec());
    assert_eq!(tx.get(b"tx:k").await.expect("tx get"), Some(Bytes::from("v")));
    assert_eq!(backend.get(b"tx:k").await.expect("outside get"), None);
    tx.commit().await.expect("commit");
    assert_eq!(backend.get(b"tx:k").await.expect("get"), Some(Bytes::from("v")));
}

/// A failed precondition rejects the commit and writes nothing.
pub async fn tx_cas_conflict_writes_nothing<B: StorageBackend>(backend: &B) {
    backend.set(b"tx:taken".to_vec(), b"x".to_vec()).await.expect("seed");

    let mut tx = backend.transaction().await.expect("begin");
    tx.compare_and_set(b"tx:taken".to_vec(), None, b"y".to_vec(), None).expect("buffer cas");
    tx.set_with_ttl(b"tx:index".to_vec(), Vec::new(), Duration::from_secs(60));
    tx.delete(b"tx:taken".to_vec());
    assert_conflict!(tx.commit().await);

    assert_eq!(backend.get(b"tx:index").await.expect("get"), None);
    assert_eq!(backend.get(b"tx:taken").await.expect("get"), Some(Bytes::from("x")));
}

/// Dropping a transaction without commit discards it.
pub async fn tx_drop_without_commit_is_noop<B: StorageBackend>(backend: &B) {
    {
        let mut tx = backend.transaction().await.expect("begin");
        tx.set(b"tx:dropped".to_vec(), b"v".to_vec());
    }
    assert_eq!(backend.get(b"tx:dropped").await.expect("get"), None);
}

// ============================================================================
// CAS
// ============================================================================

/// `expected = None` inserts when absent.
pub async fn cas_insert_if_absent<B: StorageBackend>(backend: &B) {
    backend.compare_and_set(b"cas:new", None, b"v".to_vec(), None).await.expect("insert");
    assert_eq!(backend.get(b"cas:new").await.expect("get"), Some(Bytes::from("v")));
}

/// `expected = None` conflicts when the key exists.
pub async fn cas_insert_if_absent_fails_when_key_exists<B: StorageBackend>(backend: &B) {
    backend.set(b"cas:dup".to_vec(), b"v".to_vec()).await.expect("set");
    assert_conflict!(backend.compare_and_set(b"cas:dup", None, b"w".to_vec(), None).await);
}

/// A mismatched expected value conflicts and leaves the value alone.
pub async fn cas_update_with_mismatched_value<B: StorageBackend>(backend: &B) {
    backend.set(b"cas:k".to_vec(), b"v1".to_vec()).await.expect("set");
    assert_conflict!(backend.compare_and_set(b"cas:k", Some(b"v0"), b"v2".to_vec(), None).await);
    assert_eq!(backend.get(b"cas:k").await.expect("get"), Some(Bytes::from("v1")));

    backend.compare_and_set(b"cas:k", Some(b"v1"), b"v2".to_vec(), None).await.expect("match");
    assert_eq!(backend.get(b"cas:k").await.expect("get"), Some(Bytes::from("v2")));
}

// ============================================================================
// Concurrent
// ============================================================================

/// Of many concurrent compare-and-sets against the same value, exactly one wins.
pub async fn concurrent_cas_exactly_one_winner<B: StorageBackend + 'static>(backend: Arc<B>) {
    backend.set(b"race".to_vec(), b"unused".to_vec()).await.expect("seed");

    let mut tasks = JoinSet::new();
    for task in 0..16 {
        let backend = Arc::clone(&backend);
        tasks.spawn(async move {
            backend
                .compare_and_set(
                    b"race",
                    Some(b"unused"),
                    format!("used-by-{task}").into_bytes(),
                    None,
                )
                .await
                .is_ok()
        });
    }

    let mut winners = 0;
    while let Some(result) = tasks.join_next().await {
        if result.expect("task panicked") {
            winners += 1;
        }
    }
    assert_eq!(winners, 1, "exactly one CAS must succeed");
}

/// Of many concurrent takes of the same key, exactly one receives the value.
pub async fn concurrent_take_exactly_one_winner<B: StorageBackend + 'static>(backend: Arc<B>) {
    backend.set(b"once".to_vec(), b"v".to_vec()).await.expect("seed");

    let mut tasks = JoinSet::new();
    for _ in 0..16 {
        let backend = Arc::clone(&backend);
        tasks.spawn(async move { backend.take(b"once").await.expect("take").is_some() });
    }

    let mut winners = 0;
    while let Some(result) = tasks.join_next().await {
        if result.expect("task panicked") {
            winners += 1;
        }
    }
    assert_eq!(winners, 1, "exactly one take must return the value");
}

/// `health_check` succeeds on a reachable backend.
pub async fn health_check_succeeds<B: StorageBackend>(backend: &B) {
    backend.health_check().await.expect("health check");
}

/// Runs every check, each against a fresh backend from `make`.
pub async fn run_all<B, F>(make: F)
where
    B: StorageBackend + 'static,
    F: Fn() -> B,
{
    crud_get_returns_none_for_missing_key(&make()).await;
    crud_set_overwrites_existing(&make()).await;
    crud_delete_reports_existence(&make()).await;
    take_removes_and_returns(&make()).await;
    range_prefix_scan_is_ordered_and_bounded(&make()).await;
    range_clear_range_removes_keys(&make()).await;
    ttl_key_expires(&make()).await;
    ttl_expired_key_is_absent_for_cas(&make()).await;
    ttl_cas_applies_ttl(&make()).await;
    tx_read_your_writes(&make()).await;
    tx_cas_conflict_writes_nothing(&make()).await;
    tx_drop_without_commit_is_noop(&make()).await;
    cas_insert_if_absent(&make()).await;
    cas_insert_if_absent_fails_when_key_exists(&make()).await;
    cas_update_with_mismatched_value(&make()).await;
    concurrent_cas_exactly_one_winner(Arc::new(make())).await;
    concurrent_take_exactly_one_winner(Arc::new(make())).await;
    health_check_succeeds(&make()).await;
}
