//! Key-value storage for the SSO ticket registry.
//!
//! This crate provides the [`StorageBackend`] trait the ticket registry is
//! written against, plus two implementations:
//!
//! | Backend | Use Case |
//! |---------|----------|
//! | [`MemoryBackend`] | Single node; one linearizable in-process store |
//! | [`ReplicatedBackend`] | Simulated primary/replica cluster with replication lag, partitions and latency |
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Ticket engine                           │
//! │   (service tickets, proxy chains, OAuth tokens, sweeper)    │
//! ├─────────────────────────────────────────────────────────────┤
//! │                    Ticket registry                          │
//! │     (record encoding, expiry, parent index, cascades)       │
//! ├─────────────────────────────────────────────────────────────┤
//! │                  sso-ticket-storage                         │
//! │                 StorageBackend trait                        │
//! │   (get, compare_and_set, take, get_range, transaction)      │
//! ├──────────────┬──────────────────────────────────────────────┤
//! │ MemoryBackend│           ReplicatedBackend                  │
//! │ (one node)   │  (primary + replicas, each a MemoryBackend)  │
//! └──────────────┴──────────────────────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```
//! use sso_ticket_storage::{MemoryBackend, StorageBackend};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let backend = MemoryBackend::new();
//!
//!     // Insert-if-absent
//!     backend.compare_and_set(b"ticket/TGT-1", None, b"{}".to_vec(), None).await?;
//!
//!     // Atomic multi-key write
//!     let mut txn = backend.transaction().await?;
//!     txn.set(b"ticket-children/TGT-1/ST-1".to_vec(), Vec::new());
//!     txn.compare_and_set(b"ticket/ST-1".to_vec(), None, b"{}".to_vec(), None)?;
//!     txn.commit().await?;
//!
//!     assert_eq!(backend.get_prefix(b"ticket-children/TGT-1/").await?.len(), 1);
//!     Ok(())
//! }
//! ```
//!
//! # Feature Flags
//!
//! - **`testutil`**: Enables the [`testutil`] helpers and the [`conformance`]
//!   suite for integration tests.
//! - **`failpoints`**: Activates `fail` fail points in backend code paths.

#![deny(unsafe_code)]

pub mod backend;
pub mod config;
#[cfg(any(test, feature = "testutil"))]
#[allow(clippy::expect_used, clippy::panic)]
pub mod conformance;
pub mod error;
pub mod memory;
pub mod replicated;
#[cfg(any(test, feature = "testutil"))]
#[allow(clippy::expect_used, clippy::panic)]
pub mod testutil;
pub mod transaction;
pub mod types;

pub use backend::StorageBackend;
pub use config::{ConfigError, ReadConsistency, ReplicationConfig};
pub use error::{BoxError, StorageError, StorageResult};
pub use memory::MemoryBackend;
pub use replicated::ReplicatedBackend;
pub use transaction::Transaction;
pub use types::KeyValue;
