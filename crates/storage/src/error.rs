//! Storage error types and result alias.
//!
//! The ticket registry cares about one distinction above all: did the store
//! give a *logical* answer ([`StorageError::NotFound`],
//! [`StorageError::Conflict`]) or could it not be reached at all
//! ([`StorageError::Connection`], [`StorageError::Timeout`])? The first kind
//! is final, the second is worth retrying and surfaces to callers as an
//! unavailable registry.
//!
//! ```
//! use sso_ticket_storage::{StorageError, StorageResult};
//!
//! fn lookup(key: &str) -> StorageResult<Vec<u8>> {
//!     Err(StorageError::not_found(key))
//! }
//!
//! let err = lookup("ticket/ST-1").unwrap_err();
//! assert!(matches!(err, StorageError::NotFound { .. }));
//! assert!(!err.is_transient());
//! ```

use std::sync::Arc;

use thiserror::Error;

/// Shared, clonable error used as a `source` in error chains.
pub type BoxError = Arc<dyn std::error::Error + Send + Sync>;

/// Result type alias for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors returned by a [`StorageBackend`](crate::StorageBackend).
///
/// New variants may be added in minor releases; match with a wildcard arm.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StorageError {
    /// No live entry exists under `key`.
    #[error("Key not found: {key}")]
    NotFound {
        /// The missing key, lossily decoded as UTF-8.
        key: String,
    },

    /// A compare-and-set precondition did not hold and nothing was written.
    ///
    /// Raised by insert-if-absent on an occupied key, by compare-and-set when
    /// the stored bytes differ from the expected bytes, and by a transaction
    /// commit whose buffered preconditions failed.
    #[error("Transaction conflict")]
    Conflict,

    /// The store, or the node authoritative for the request, is unreachable.
    #[error("Connection error: {message}")]
    Connection {
        /// Which hop failed.
        message: String,
        /// Underlying transport error, when there is one.
        #[source]
        source: Option<BoxError>,
    },

    /// A value could not be encoded before it was written.
    #[error("Serialization error: {message}")]
    Serialization {
        /// What was being encoded.
        message: String,
        /// The encoder's error.
        #[source]
        source: Option<BoxError>,
    },

    /// The backend failed in a way that fits no other variant.
    #[error("Internal error: {message}")]
    Internal {
        /// Description of the failure.
        message: String,
    },

    /// The operation did not finish within its deadline.
    #[error("Operation timeout")]
    Timeout,
}

impl StorageError {
    /// Returns a [`StorageError::NotFound`] for `key`.
    #[must_use]
    pub fn not_found(key: impl Into<String>) -> Self {
        Self::NotFound { key: key.into() }
    }

    /// Returns a [`StorageError::Connection`] without an underlying cause.
    #[must_use]
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection { message: message.into(), source: None }
    }

    /// Returns a [`StorageError::Serialization`] wrapping the encoder error.
    #[must_use]
    pub fn encoding(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Serialization { message: message.into(), source: Some(Arc::new(source)) }
    }

    /// Returns a [`StorageError::Internal`].
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into() }
    }

    /// Returns `true` when the store could not be reached and a retry may
    /// succeed.
    ///
    /// `Conflict` is a definitive answer about the stored state and is never
    /// transient.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::Timeout)
    }
}
