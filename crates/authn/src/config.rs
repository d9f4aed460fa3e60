//! Signing key cache configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use sso_tickets::ConfigError;

/// Default lifetime of the issuer-wide signing key (24 hours).
pub const DEFAULT_GLOBAL_KEY_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Default lifetime of a per-service signing key (1 hour).
pub const DEFAULT_SERVICE_KEY_TTL: Duration = Duration::from_secs(60 * 60);

/// Default number of per-service keys held at once.
pub const DEFAULT_SERVICE_KEY_CAPACITY: u64 = 10_000;

/// Configuration for [`SigningKeyCache`](crate::SigningKeyCache).
///
/// Keys expire a fixed time after they were loaded, regardless of use, so
/// every key is rotated at least once per TTL.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use sso_authn::SigningKeyCacheConfig;
///
/// let config = SigningKeyCacheConfig::builder()
///     .issuer("https://sso.example.org")
///     .service_key_ttl(Duration::from_secs(600))
///     .per_service_keys(true)
///     .build()?;
/// assert_eq!(config.service_key_ttl(), Duration::from_secs(600));
/// # Ok::<(), sso_authn::ConfigError>(())
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SigningKeyCacheConfig {
    /// Value of the `iss` claim; also the cache key of the global key.
    pub(crate) issuer: String,

    /// Lifetime of the issuer-wide key.
    #[serde(with = "humantime_serde", default = "default_global_key_ttl")]
    pub(crate) global_key_ttl: Duration,

    /// Lifetime of each per-service key.
    #[serde(with = "humantime_serde", default = "default_service_key_ttl")]
    pub(crate) service_key_ttl: Duration,

    /// Maximum number of per-service keys held at once.
    #[serde(default = "default_service_key_capacity")]
    pub(crate) service_key_capacity: u64,

    /// Sign access tokens with a key dedicated to the relying service
    /// instead of the issuer-wide key.
    #[serde(default)]
    pub(crate) per_service_keys: bool,
}

fn default_global_key_ttl() -> Duration {
    DEFAULT_GLOBAL_KEY_TTL
}

fn default_service_key_ttl() -> Duration {
    DEFAULT_SERVICE_KEY_TTL
}

fn default_service_key_capacity() -> u64 {
    DEFAULT_SERVICE_KEY_CAPACITY
}

#[bon::bon]
impl SigningKeyCacheConfig {
    /// Creates a validated configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for an empty issuer, a zero TTL or a
    /// zero capacity.
    #[builder]
    pub fn new(
        #[builder(into)] issuer: String,
        #[builder(default = DEFAULT_GLOBAL_KEY_TTL)] global_key_ttl: Duration,
        #[builder(default = DEFAULT_SERVICE_KEY_TTL)] service_key_ttl: Duration,
        #[builder(default = DEFAULT_SERVICE_KEY_CAPACITY)] service_key_capacity: u64,
        #[builder(default)] per_service_keys: bool,
    ) -> Result<Self, ConfigError> {
        let config = Self {
            issuer,
            global_key_ttl,
            service_key_ttl,
            service_key_capacity,
            per_service_keys,
        };
        config.validate()?;
        Ok(config)
    }

    /// Validates a configuration obtained through deserialization.
    ///
    /// # Errors
    ///
    /// Same conditions as [`SigningKeyCacheConfig::builder`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.issuer.trim().is_empty() {
            return Err(ConfigError::invalid("issuer", "must not be empty"));
        }
        if self.global_key_ttl.is_zero() {
            return Err(ConfigError::invalid("global_key_ttl", "must be greater than zero"));
        }
        if self.service_key_ttl.is_zero() {
            return Err(ConfigError::invalid("service_key_ttl", "must be greater than zero"));
        }
        if self.service_key_capacity == 0 {
            return Err(ConfigError::invalid("service_key_capacity", "must be greater than zero"));
        }
        Ok(())
    }

    /// Returns the issuer.
    #[must_use]
    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    /// Returns the lifetime of the issuer-wide key.
    #[must_use]
    pub fn global_key_ttl(&self) -> Duration {
        self.global_key_ttl
    }

    /// Returns the lifetime of a per-service key.
    #[must_use]
    pub fn service_key_ttl(&self) -> Duration {
        self.service_key_ttl
    }

    /// Returns the per-service key capacity.
    #[must_use]
    pub fn service_key_capacity(&self) -> u64 {
        self.service_key_capacity
    }

    /// Returns whether access tokens use per-service keys.
    #[must_use]
    pub fn per_service_keys(&self) -> bool {
        self.per_service_keys
    }
}
