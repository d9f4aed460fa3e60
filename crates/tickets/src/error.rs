//! Error types for the ticket lifecycle engine.
//!
//! Every engine operation either succeeds or fails with exactly one
//! [`TicketError`]. Logical outcomes (`NotFound`, `Expired`, ...) are kept
//! distinct from [`TicketError::RegistryUnavailable`], which means the
//! storage backend could not be reached and says nothing about whether the
//! ticket exists.

use std::{sync::Arc, time::Duration};

use sso_ticket_storage::{BoxError, StorageError};
use thiserror::Error;

use crate::ticket::{TicketId, TicketKind};

/// Result type alias for ticket operations.
pub type TicketResult<T> = Result<T, TicketError>;

/// Errors produced by the ticket engine.
///
/// # Non-exhaustive
///
/// New variants may be added in future minor releases.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TicketError {
    /// The ticket does not exist or was already evicted.
    #[error("ticket not found: {id}")]
    NotFound {
        /// Identifier that was looked up.
        id: String,
    },

    /// The ticket exists but its expiration policy (or that of an ancestor)
    /// says it is no longer valid.
    #[error("ticket expired: {id}")]
    Expired {
        /// Identifier of the expired ticket.
        id: String,
    },

    /// The ticket exists but is of a different kind than requested.
    #[error("ticket {id} is a {actual}, expected a {expected}")]
    TypeMismatch {
        /// Identifier of the ticket.
        id: String,
        /// Kind the caller asked for.
        expected: TicketKind,
        /// Kind actually stored.
        actual: TicketKind,
    },

    /// A ticket with this identifier already exists.
    #[error("duplicate ticket id: {id}")]
    DuplicateId {
        /// The colliding identifier.
        id: String,
    },

    /// A single-use ticket was already consumed.
    #[error("ticket already consumed: {id}")]
    AlreadyConsumed {
        /// Identifier of the consumed ticket.
        id: String,
    },

    /// An ancestor in a proxy chain is missing or expired.
    #[error("proxy chain broken at {id}: {reason}")]
    ProxyChainBroken {
        /// Identifier of the first failing ancestor.
        id: String,
        /// What was wrong with it.
        reason: String,
    },

    /// The proxy callback endpoint did not confirm ownership.
    #[error("proxy callback to {url} failed: {reason}")]
    ProxyCallbackFailed {
        /// Callback URL that was contacted.
        url: String,
        /// Description of the failure.
        reason: String,
        /// The underlying transport error, if any.
        #[source]
        source: Option<BoxError>,
    },

    /// A throttled ticket was presented again too soon.
    #[error("ticket {id} reused too quickly, retry after {retry_after:?}")]
    ThrottledReplay {
        /// Identifier of the throttled ticket.
        id: String,
        /// How long until the ticket may be used again.
        retry_after: Duration,
    },

    /// No unique identifier could be generated within the attempt budget.
    #[error("could not generate a unique {kind} id after {attempts} attempts")]
    GenerationExhausted {
        /// Kind of ticket being created.
        kind: TicketKind,
        /// Number of attempts made.
        attempts: u32,
    },

    /// The operation did not complete before its deadline. No partial state
    /// was left behind.
    #[error("operation timed out")]
    Timeout,

    /// A validation authorizer or policy rejected the request.
    #[error("authorization denied: {reason}")]
    AuthorizationDenied {
        /// Reason reported by the denying check.
        reason: String,
    },

    /// The storage backend could not be reached.
    #[error("ticket registry unavailable")]
    RegistryUnavailable {
        /// The storage failure.
        #[source]
        source: StorageError,
    },

    /// A stored ticket record could not be encoded or decoded.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the failure.
        message: String,
        /// The underlying error.
        #[source]
        source: Option<BoxError>,
    },

    /// No catalog entry exists for the ticket type.
    #[error("unknown ticket type: {name}")]
    UnknownTicketType {
        /// The type name or identifier that could not be resolved.
        name: String,
    },
}

impl TicketError {
    /// Creates a new `NotFound` error.
    #[must_use]
    pub fn not_found(id: &TicketId) -> Self {
        Self::NotFound { id: id.to_string() }
    }

    /// Creates a new `Expired` error.
    #[must_use]
    pub fn expired(id: &TicketId) -> Self {
        Self::Expired { id: id.to_string() }
    }

    /// Creates a new `DuplicateId` error.
    #[must_use]
    pub fn duplicate_id(id: &TicketId) -> Self {
        Self::DuplicateId { id: id.to_string() }
    }

    /// Creates a new `AlreadyConsumed` error.
    #[must_use]
    pub fn already_consumed(id: &TicketId) -> Self {
        Self::AlreadyConsumed { id: id.to_string() }
    }

    /// Creates a new `ProxyChainBroken` error.
    #[must_use]
    pub fn proxy_chain_broken(id: &TicketId, reason: impl Into<String>) -> Self {
        Self::ProxyChainBroken { id: id.to_string(), reason: reason.into() }
    }

    /// Creates a new `ProxyCallbackFailed` error without a source.
    #[must_use]
    pub fn proxy_callback_failed(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ProxyCallbackFailed { url: url.into(), reason: reason.into(), source: None }
    }

    /// Creates a new `ProxyCallbackFailed` error with a source.
    #[must_use]
    pub fn proxy_callback_failed_with_source(
        url: impl Into<String>,
        reason: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::ProxyCallbackFailed {
            url: url.into(),
            reason: reason.into(),
            source: Some(Arc::new(source)),
        }
    }

    /// Creates a new `AuthorizationDenied` error.
    #[must_use]
    pub fn authorization_denied(reason: impl Into<String>) -> Self {
        Self::AuthorizationDenied { reason: reason.into() }
    }

    /// Creates a new `Serialization` error with a source.
    #[must_use]
    pub fn serialization(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Serialization { message: message.into(), source: Some(Arc::new(source)) }
    }

    /// Returns `true` if the ticket does not exist or is no longer usable,
    /// i.e. the caller should treat it as invalid rather than retry.
    #[must_use]
    pub fn is_invalid_ticket(&self) -> bool {
        matches!(
            self,
            Self::NotFound { .. }
                | Self::Expired { .. }
                | Self::AlreadyConsumed { .. }
                | Self::ProxyChainBroken { .. }
        )
    }
}

impl From<StorageError> for TicketError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Timeout => Self::Timeout,
            StorageError::NotFound { key } => Self::NotFound { id: key },
            StorageError::Serialization { message, source } => {
                Self::Serialization { message, source }
            },
            other => Self::RegistryUnavailable { source: other },
        }
    }
}
