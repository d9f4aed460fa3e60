//! Ticket identifier generation.
//!
//! Identifiers have the shape `{PREFIX}-{counter}-{random}[-{suffix}]`:
//!
//! - `PREFIX` names the ticket type (`TGT`, `ST`, ...), see
//!   [`TicketKind::default_prefix`](crate::TicketKind::default_prefix)
//! - `counter` is a process-local, monotonically increasing number
//! - `random` is URL-safe base64 of CSPRNG bytes (at least 184 bits)
//! - `suffix` optionally names the issuing node in a cluster

use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use rand::{RngCore, rngs::OsRng};
use sso_ticket_storage::ConfigError;

use crate::ticket::TicketId;

/// Minimum number of random bytes per identifier (184 bits of entropy).
pub const MIN_RANDOM_BYTES: usize = 23;

/// Default number of random bytes per identifier.
pub const DEFAULT_RANDOM_BYTES: usize = 32;

/// Prefix used for proxy-granting ticket IOUs.
pub const PGT_IOU_PREFIX: &str = "PGTIOU";

/// Produces unique, unguessable identifiers.
pub trait TicketIdGenerator: Send + Sync + fmt::Debug {
    /// Generates a new identifier starting with `prefix`.
    fn generate(&self, prefix: &str) -> TicketId;
}

/// Counter + CSPRNG identifier generator.
///
/// ```
/// use sso_tickets::{DefaultTicketIdGenerator, TicketIdGenerator};
///
/// let generator = DefaultTicketIdGenerator::new(32, Some("node1".into()))?;
/// let id = generator.generate("ST");
/// assert!(id.as_str().starts_with("ST-1-"));
/// assert!(id.as_str().ends_with("-node1"));
/// # Ok::<(), sso_ticket_storage::ConfigError>(())
/// ```
#[derive(Debug)]
pub struct DefaultTicketIdGenerator {
    counter: AtomicU64,
    random_bytes: usize,
    suffix: Option<String>,
}

impl DefaultTicketIdGenerator {
    /// Creates a generator.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if `random_bytes` is below
    /// [`MIN_RANDOM_BYTES`] or the suffix contains characters outside
    /// `[A-Za-z0-9._]`.
    pub fn new(random_bytes: usize, suffix: Option<String>) -> Result<Self, ConfigError> {
        if random_bytes < MIN_RANDOM_BYTES {
            return Err(ConfigError::invalid(
                "id_random_bytes",
                format!("must be at least {MIN_RANDOM_BYTES}, got {random_bytes}"),
            ));
        }
        if let Some(suffix) = &suffix
            && (suffix.is_empty()
                || !suffix.chars().all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_'))
        {
            return Err(ConfigError::invalid(
                "id_suffix",
                format!("`{suffix}` must be non-empty and contain only [A-Za-z0-9._]"),
            ));
        }
        Ok(Self { counter: AtomicU64::new(0), random_bytes, suffix })
    }
}

impl Default for DefaultTicketIdGenerator {
    fn default() -> Self {
        Self { counter: AtomicU64::new(0), random_bytes: DEFAULT_RANDOM_BYTES, suffix: None }
    }
}

impl TicketIdGenerator for DefaultTicketIdGenerator {
    fn generate(&self, prefix: &str) -> TicketId {
        let counter = self.counter.fetch_add(1, Ordering::Relaxed).wrapping_add(1);

        let mut random = vec![0u8; self.random_bytes];
        OsRng.fill_bytes(&mut random);
        let random = URL_SAFE_NO_PAD.encode(&random);

        match &self.suffix {
            Some(suffix) => TicketId::new(format!("{prefix}-{counter}-{random}-{suffix}")),
            None => TicketId::new(format!("{prefix}-{counter}-{random}")),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn test_format_and_counter() {
        let generator = DefaultTicketIdGenerator::default();
        let first = generator.generate("TGT");
        let second = generator.generate("TGT");

        let parts: Vec<&str> = first.as_str().splitn(3, '-').collect();
        assert_eq!(parts[0], "TGT");
        assert_eq!(parts[1], "1");
        // 32 bytes of base64 without padding.
        assert_eq!(parts[2].len(), 43);
        assert!(second.as_str().starts_with("TGT-2-"));
    }

    #[test]
    fn test_rejects_low_entropy() {
        let err = DefaultTicketIdGenerator::new(16, None).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "id_random_bytes", .. }));
    }

    #[test]
    fn test_rejects_suffix_with_separator() {
        let err = DefaultTicketIdGenerator::new(32, Some("node-1".into())).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "id_suffix", .. }));
    }

    #[test]
    fn test_no_collisions_in_practice() {
        let generator = DefaultTicketIdGenerator::new(MIN_RANDOM_BYTES, None).unwrap();
        let ids: HashSet<_> = (0..10_000).map(|_| generator.generate("ST")).collect();
        assert_eq!(ids.len(), 10_000);
    }
}
