//! Integration tests for fail-point injection.
//!
//! These tests require the `failpoints` feature:
//! ```bash
//! cargo test -p sso-ticket-storage --features failpoints --test failpoint_tests
//! ```

#![cfg(feature = "failpoints")]
#![allow(clippy::expect_used, clippy::panic)]

use sso_ticket_storage::{MemoryBackend, StorageBackend, StorageError};

#[tokio::test]
async fn commit_failpoint_aborts_without_writing() {
    let scenario = fail::FailScenario::setup();
    fail::cfg("memory-before-commit", "return").expect("failed to configure fail point");

    let backend = MemoryBackend::new();
    let mut tx = backend.transaction().await.expect("begin");
    tx.set(b"k".to_vec(), b"v".to_vec());
    let result = tx.commit().await;

    assert!(matches!(result, Err(StorageError::Internal { .. })), "got {result:?}");
    fail::remove("memory-before-commit");
    assert_eq!(backend.get(b"k").await.expect("get"), None);

    scenario.teardown();
}

#[tokio::test]
async fn health_check_failpoint_returns_error() {
    let scenario = fail::FailScenario::setup();
    fail::cfg("health-check", "return").expect("failed to configure fail point");

    let backend = MemoryBackend::new();
    assert!(backend.health_check().await.is_err(), "health check should fail");

    scenario.teardown();
}

#[tokio::test]
async fn health_check_without_failpoint_succeeds() {
    let scenario = fail::FailScenario::setup();

    let backend = MemoryBackend::new();
    assert!(backend.health_check().await.is_ok());

    scenario.teardown();
}
