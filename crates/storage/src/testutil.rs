//! Shared test utilities for storage backend testing.
//!
//! Feature-gated behind `testutil` so that it never leaks into production
//! builds. Downstream crates enable it in `[dev-dependencies]`:
//!
//! ```toml
//! [dev-dependencies]
//! sso-ticket-storage = { workspace = true, features = ["testutil"] }
//! ```

use std::time::Duration;

use crate::{
    config::{ReadConsistency, ReplicationConfig},
    memory::MemoryBackend,
    replicated::ReplicatedBackend,
};

/// Create a deterministic test key from a prefix and index.
///
/// Produces keys like `"prefix:000042"`; zero-padding keeps lexicographic
/// and numeric order aligned for range tests.
#[must_use]
pub fn make_key(prefix: &str, idx: usize) -> Vec<u8> {
    format!("{prefix}:{idx:06}").into_bytes()
}

/// Create a test value tagged with a task ID and sequence number.
#[must_use]
pub fn make_tagged_value(task: usize, seq: usize) -> Vec<u8> {
    format!("task{task}-val{seq}").into_bytes()
}

/// A three-node cluster attached to the primary with a short replication
/// interval. Behaves like a single node for reads and writes.
pub fn replicated_backend() -> ReplicatedBackend {
    replicated_backend_with(0, ReadConsistency::Linearizable, Duration::ZERO)
}

/// A three-node cluster attached to `local_node`.
///
/// # Panics
///
/// Panics if `local_node` is not 0, 1 or 2.
pub fn replicated_backend_with(
    local_node: usize,
    read_consistency: ReadConsistency,
    network_latency: Duration,
) -> ReplicatedBackend {
    let config = ReplicationConfig::builder()
        .nodes(3)
        .local_node(local_node)
        .replication_interval(Duration::from_millis(20))
        .read_consistency(read_consistency)
        .network_latency(network_latency)
        .build()
        .expect("valid replication config");
    ReplicatedBackend::new(config).expect("replicated backend")
}

/// A [`MemoryBackend`] whose background sweep never runs during a test, so
/// expiry is observable purely through reads.
pub fn quiet_memory_backend() -> MemoryBackend {
    MemoryBackend::with_cleanup_interval(Duration::from_secs(3600))
}

/// Assert that a [`StorageResult`](crate::StorageResult) is a
/// [`StorageError::Conflict`](crate::StorageError::Conflict).
#[macro_export]
macro_rules! assert_conflict {
    ($result:expr) => {{
        let result = $result;
        assert!(
            matches!(result, Err($crate::error::StorageError::Conflict)),
            "expected StorageError::Conflict, got: {:?}",
            result,
        );
    }};
    ($result:expr, $msg:expr) => {{
        let result = $result;
        assert!(
            matches!(result, Err($crate::error::StorageError::Conflict)),
            "{}: expected StorageError::Conflict, got: {:?}",
            $msg,
            result,
        );
    }};
}

/// Assert that a [`StorageResult`](crate::StorageResult) is `Ok`, returning
/// the inner value.
#[macro_export]
macro_rules! assert_storage_ok {
    ($result:expr) => {
        match $result {
            Ok(value) => value,
            Err(e) => panic!("expected Ok, got error: {e:?}"),
        }
    };
    ($result:expr, $msg:expr) => {
        match $result {
            Ok(value) => value,
            Err(e) => panic!("{}: expected Ok, got error: {e:?}", $msg),
        }
    };
}
