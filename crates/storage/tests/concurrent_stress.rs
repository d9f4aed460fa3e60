//! Concurrent access stress tests.
//!
//! The heavier tests are `#[ignore]`d for CI runtime control:
//!
//! ```bash
//! cargo test -p sso-ticket-storage --test concurrent_stress -- --ignored
//! ```

#![allow(clippy::expect_used, clippy::panic)]

use std::collections::HashSet;

use bytes::Bytes;
use sso_ticket_storage::{
    MemoryBackend, StorageBackend, StorageError,
    testutil::{make_key, make_tagged_value, replicated_backend},
};
use tokio::task::JoinSet;

/// Number of concurrent tasks for most tests.
const CONCURRENCY: usize = 16;

/// Number of rounds for the exactly-one-winner tests.
const ROUNDS: usize = 50;

// ---------------------------------------------------------------------------
// Test: consume race, exactly one winner per round
// ---------------------------------------------------------------------------

/// Models the service-ticket consume race: every task reads the unconsumed
/// record and tries to swap in its own consumed marker.
async fn cas_rounds<B: StorageBackend + Clone + 'static>(backend: B) {
    for round in 0..ROUNDS {
        let key = make_key("st", round);
        backend.set(key.clone(), b"unconsumed".to_vec()).await.expect("seed");

        let mut set = JoinSet::new();
        for task in 0..CONCURRENCY {
            let backend = backend.clone();
            let key = key.clone();
            set.spawn(async move {
                match backend
                    .compare_and_set(
                        &key,
                        Some(b"unconsumed"),
                        make_tagged_value(task, round),
                        None,
                    )
                    .await
                {
                    Ok(()) => Some(task),
                    Err(StorageError::Conflict) => None,
                    Err(e) => panic!("unexpected error: {e}"),
                }
            });
        }

        let mut winners = HashSet::new();
        while let Some(result) = set.join_next().await {
            if let Some(task) = result.expect("task should not panic") {
                winners.insert(task);
            }
        }
        assert_eq!(winners.len(), 1, "round {round}: expected exactly one winner");

        let winner = winners.into_iter().next().expect("one winner");
        let stored = backend.get(&key).await.expect("get").expect("value present");
        assert_eq!(stored, Bytes::from(make_tagged_value(winner, round)));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore]
async fn parallel_cas_exactly_one_winner_memory() {
    cas_rounds(MemoryBackend::new()).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore]
async fn parallel_cas_exactly_one_winner_replicated() {
    cas_rounds(replicated_backend()).await;
}

// ---------------------------------------------------------------------------
// Test: parallel take, the value is handed out once
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn parallel_take_hands_out_value_once() {
    let backend = MemoryBackend::new();
    for round in 0..ROUNDS {
        let key = make_key("oc", round);
        backend.set(key.clone(), b"code".to_vec()).await.expect("seed");

        let mut set = JoinSet::new();
        for _ in 0..CONCURRENCY {
            let backend = backend.clone();
            let key = key.clone();
            set.spawn(async move { backend.take(&key).await.expect("take").is_some() });
        }

        let mut taken = 0;
        while let Some(result) = set.join_next().await {
            taken += usize::from(result.expect("task should not panic"));
        }
        assert_eq!(taken, 1, "round {round}: value must be taken exactly once");
    }
}

// ---------------------------------------------------------------------------
// Test: parallel transactional inserts of distinct keys with a shared index
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn parallel_transactions_all_commit() {
    let backend = MemoryBackend::new();

    let mut set = JoinSet::new();
    for task in 0..CONCURRENCY {
        let backend = backend.clone();
        set.spawn(async move {
            let child = make_key("child", task);
            let mut tx = backend.transaction().await.expect("begin");
            tx.compare_and_set(child.clone(), None, b"{}".to_vec(), None).expect("buffer");
            let mut index = b"idx/parent/".to_vec();
            index.extend_from_slice(&child);
            tx.set(index, Vec::new());
            tx.commit().await.expect("commit");
        });
    }
    while let Some(result) = set.join_next().await {
        result.expect("task should not panic");
    }

    let index = backend.get_prefix(b"idx/parent/").await.expect("scan");
    assert_eq!(index.len(), CONCURRENCY);
}
