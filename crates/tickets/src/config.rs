//! Engine configuration.
//!
//! [`TicketsConfig`] is read once at startup (typically deserialized from a
//! file) and handed to the explicit constructors of the catalog, registry
//! and engine. Durations use humantime notation (`"10s"`, `"2h"`).
//!
//! ```
//! use sso_tickets::{TicketKind, TicketsConfig};
//!
//! let config: TicketsConfig = serde_json::from_str(
//!     r#"{
//!         "request_timeout": "2s",
//!         "types": {
//!             "ServiceTicket": { "expiration": { "policy": "time_to_live", "ttl": "5s" } }
//!         },
//!         "proxy": { "mode": "legacy" }
//!     }"#,
//! )?;
//! config.validate()?;
//! let st = config.type_config(TicketKind::ServiceTicket);
//! assert_eq!(st.prefix(TicketKind::ServiceTicket), "ST");
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use std::{collections::BTreeMap, time::Duration};

use serde::{Deserialize, Serialize};
use sso_ticket_storage::ConfigError;

use crate::{
    expiration::ExpirationPolicy,
    id::{DEFAULT_RANDOM_BYTES, MIN_RANDOM_BYTES},
    registry::{DEFAULT_EXPIRED_RETENTION, DEFAULT_REQUEST_TIMEOUT},
    ticket::TicketKind,
};

const DEFAULT_MAX_ID_ATTEMPTS: u32 = 3;
const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const DEFAULT_CALLBACK_TIMEOUT: Duration = Duration::from_secs(5);

const HOUR: u64 = 3600;

/// Returns the built-in expiration policy for a ticket kind.
#[must_use]
pub fn default_policy(kind: TicketKind) -> ExpirationPolicy {
    match kind {
        TicketKind::TicketGrantingTicket | TicketKind::ProxyGrantingTicket => {
            ExpirationPolicy::IdleTimeout {
                idle: Duration::from_secs(2 * HOUR),
                max_lifetime: Duration::from_secs(8 * HOUR),
            }
        },
        TicketKind::ServiceTicket | TicketKind::ProxyTicket => {
            ExpirationPolicy::TimeToLive { ttl: Duration::from_secs(10) }
        },
        TicketKind::OAuthCode => ExpirationPolicy::TimeToLive { ttl: Duration::from_secs(30) },
        TicketKind::AccessToken => ExpirationPolicy::IdleTimeout {
            idle: Duration::from_secs(2 * HOUR),
            max_lifetime: Duration::from_secs(8 * HOUR),
        },
        TicketKind::RefreshToken => {
            ExpirationPolicy::TimeToLive { ttl: Duration::from_secs(30 * 24 * HOUR) }
        },
    }
}

/// Per-ticket-type settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TicketTypeConfig {
    /// Identifier prefix; defaults to the kind's conventional prefix.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,

    /// Expiration policy stamped onto every new ticket of this type.
    pub expiration: ExpirationPolicy,

    /// Storage-level TTL overriding the one derived from the policy.
    #[serde(with = "humantime_serde", default, skip_serializing_if = "Option::is_none")]
    pub storage_timeout: Option<Duration>,
}

impl TicketTypeConfig {
    /// Default settings for `kind`.
    #[must_use]
    pub fn for_kind(kind: TicketKind) -> Self {
        Self { prefix: None, expiration: default_policy(kind), storage_timeout: None }
    }

    /// Returns the effective prefix for `kind`.
    #[must_use]
    pub fn prefix(&self, kind: TicketKind) -> &str {
        self.prefix.as_deref().unwrap_or(kind.default_prefix())
    }
}

/// Expired-ticket sweeper settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SweeperConfig {
    /// Whether the background sweeper runs.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Time between sweeps.
    #[serde(with = "humantime_serde", default = "default_sweep_interval")]
    pub interval: Duration,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self { enabled: true, interval: DEFAULT_SWEEP_INTERVAL }
    }
}

/// How proxy-granting tickets are handed to the proxying service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyMode {
    /// Grant without contacting the service.
    Legacy,
    /// Deliver the ticket to the service's callback URL before granting.
    #[default]
    Callback,
}

/// Proxy chain settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProxyConfig {
    /// Whether proxy-granting tickets may be issued at all.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Handler used to grant proxy-granting tickets.
    #[serde(default)]
    pub mode: ProxyMode,

    /// Reject callback URLs that are not `https`.
    #[serde(default = "default_true")]
    pub require_https: bool,

    /// Timeout for the callback round trip.
    #[serde(with = "humantime_serde", default = "default_callback_timeout")]
    pub callback_timeout: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            mode: ProxyMode::default(),
            require_https: true,
            callback_timeout: DEFAULT_CALLBACK_TIMEOUT,
        }
    }
}

/// OAuth token issuance settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OAuthConfig {
    /// Issue a refresh token when the code grants `offline_access`.
    #[serde(default = "default_true")]
    pub issue_refresh_tokens: bool,

    /// Consume the refresh token on use and issue a new one.
    #[serde(default)]
    pub rotate_refresh_tokens: bool,
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self { issue_refresh_tokens: true, rotate_refresh_tokens: false }
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TicketsConfig {
    /// Per-type overrides. Types not listed use [`TicketTypeConfig::for_kind`].
    #[serde(default)]
    pub(crate) types: BTreeMap<TicketKind, TicketTypeConfig>,

    /// Random bytes per identifier.
    #[serde(default = "default_random_bytes")]
    pub(crate) id_random_bytes: usize,

    /// Node suffix appended to identifiers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) id_suffix: Option<String>,

    /// Attempts at generating a non-colliding identifier.
    #[serde(default = "default_max_id_attempts")]
    pub(crate) max_id_attempts: u32,

    /// Deadline applied to every registry call.
    #[serde(with = "humantime_serde", default = "default_request_timeout")]
    pub(crate) request_timeout: Duration,

    /// How long expired tickets stay in storage so lookups report
    /// `Expired` rather than `NotFound`.
    #[serde(with = "humantime_serde", default = "default_expired_retention")]
    pub(crate) expired_ticket_retention: Duration,

    /// Sweeper settings.
    #[serde(default)]
    pub(crate) sweeper: SweeperConfig,

    /// Proxy settings.
    #[serde(default)]
    pub(crate) proxy: ProxyConfig,

    /// OAuth settings.
    #[serde(default)]
    pub(crate) oauth: OAuthConfig,
}

fn default_true() -> bool {
    true
}

fn default_random_bytes() -> usize {
    DEFAULT_RANDOM_BYTES
}

fn default_max_id_attempts() -> u32 {
    DEFAULT_MAX_ID_ATTEMPTS
}

fn default_request_timeout() -> Duration {
    DEFAULT_REQUEST_TIMEOUT
}

fn default_expired_retention() -> Duration {
    DEFAULT_EXPIRED_RETENTION
}

fn default_sweep_interval() -> Duration {
    DEFAULT_SWEEP_INTERVAL
}

fn default_callback_timeout() -> Duration {
    DEFAULT_CALLBACK_TIMEOUT
}

impl Default for TicketsConfig {
    fn default() -> Self {
        Self {
            types: BTreeMap::new(),
            id_random_bytes: DEFAULT_RANDOM_BYTES,
            id_suffix: None,
            max_id_attempts: DEFAULT_MAX_ID_ATTEMPTS,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            expired_ticket_retention: DEFAULT_EXPIRED_RETENTION,
            sweeper: SweeperConfig::default(),
            proxy: ProxyConfig::default(),
            oauth: OAuthConfig::default(),
        }
    }
}

#[bon::bon]
impl TicketsConfig {
    /// Creates a validated configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when a value is out of range; see
    /// [`validate`](Self::validate).
    #[builder]
    pub fn new(
        #[builder(default)] types: BTreeMap<TicketKind, TicketTypeConfig>,
        #[builder(default = DEFAULT_RANDOM_BYTES)] id_random_bytes: usize,
        id_suffix: Option<String>,
        #[builder(default = DEFAULT_MAX_ID_ATTEMPTS)] max_id_attempts: u32,
        #[builder(default = DEFAULT_REQUEST_TIMEOUT)] request_timeout: Duration,
        #[builder(default = DEFAULT_EXPIRED_RETENTION)] expired_ticket_retention: Duration,
        #[builder(default)] sweeper: SweeperConfig,
        #[builder(default)] proxy: ProxyConfig,
        #[builder(default)] oauth: OAuthConfig,
    ) -> Result<Self, ConfigError> {
        let config = Self {
            types,
            id_random_bytes,
            id_suffix,
            max_id_attempts,
            request_timeout,
            expired_ticket_retention,
            sweeper,
            proxy,
            oauth,
        };
        config.validate()?;
        Ok(config)
    }

    /// Validates a configuration obtained through deserialization.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if:
    /// - `id_random_bytes` is below 23 (184 bits)
    /// - `max_id_attempts` or `request_timeout` is zero
    /// - the sweeper is enabled with a zero interval
    /// - a prefix is empty, not alphanumeric, or shared by two types
    /// - an expiration policy has a zero duration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.id_random_bytes < MIN_RANDOM_BYTES {
            return Err(ConfigError::invalid(
                "id_random_bytes",
                format!("must be at least {MIN_RANDOM_BYTES}, got {}", self.id_random_bytes),
            ));
        }
        if self.max_id_attempts == 0 {
            return Err(ConfigError::invalid("max_id_attempts", "must be at least 1"));
        }
        if self.request_timeout.is_zero() {
            return Err(ConfigError::invalid("request_timeout", "must be greater than zero"));
        }
        if self.sweeper.enabled && self.sweeper.interval.is_zero() {
            return Err(ConfigError::invalid("sweeper.interval", "must be greater than zero"));
        }

        let mut prefixes: BTreeMap<String, TicketKind> = BTreeMap::new();
        for kind in TicketKind::ALL {
            let type_config = self.type_config(kind);
            let prefix = type_config.prefix(kind);
            if prefix.is_empty() || !prefix.chars().all(|c| c.is_ascii_alphanumeric()) {
                return Err(ConfigError::invalid(
                    "types.prefix",
                    format!("`{prefix}` for {kind} must be non-empty and alphanumeric"),
                ));
            }
            if let Some(other) = prefixes.insert(prefix.to_owned(), kind) {
                return Err(ConfigError::invalid(
                    "types.prefix",
                    format!("`{prefix}` is used by both {other} and {kind}"),
                ));
            }
            validate_policy(kind, &type_config.expiration)?;
        }
        Ok(())
    }

    /// Returns the effective settings for `kind`.
    #[must_use]
    pub fn type_config(&self, kind: TicketKind) -> TicketTypeConfig {
        self.types.get(&kind).cloned().unwrap_or_else(|| TicketTypeConfig::for_kind(kind))
    }

    /// Returns the number of random bytes per identifier.
    #[must_use]
    pub fn id_random_bytes(&self) -> usize {
        self.id_random_bytes
    }

    /// Returns the node suffix for identifiers.
    #[must_use]
    pub fn id_suffix(&self) -> Option<&str> {
        self.id_suffix.as_deref()
    }

    /// Returns the identifier generation attempt budget.
    #[must_use]
    pub fn max_id_attempts(&self) -> u32 {
        self.max_id_attempts
    }

    /// Returns the registry request deadline.
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Returns how long expired tickets are retained.
    #[must_use]
    pub fn expired_ticket_retention(&self) -> Duration {
        self.expired_ticket_retention
    }

    /// Returns the sweeper settings.
    #[must_use]
    pub fn sweeper(&self) -> &SweeperConfig {
        &self.sweeper
    }

    /// Returns the proxy settings.
    #[must_use]
    pub fn proxy(&self) -> &ProxyConfig {
        &self.proxy
    }

    /// Returns the OAuth settings.
    #[must_use]
    pub fn oauth(&self) -> &OAuthConfig {
        &self.oauth
    }
}

/// Every configurable kind is a user-facing credential, so none may be
/// configured to never expire.
fn validate_policy(kind: TicketKind, policy: &ExpirationPolicy) -> Result<(), ConfigError> {
    let zero = match *policy {
        ExpirationPolicy::NeverExpires => {
            return Err(ConfigError::invalid(
                "types.expiration",
                format!("{kind} is a user-facing credential and must expire"),
            ));
        },
        ExpirationPolicy::TimeToLive { ttl } => ttl.is_zero(),
        ExpirationPolicy::IdleTimeout { idle, max_lifetime } => {
            idle.is_zero() || max_lifetime.is_zero()
        },
        ExpirationPolicy::ThrottledRate { time_to_kill, .. } => time_to_kill.is_zero(),
    };
    if zero {
        return Err(ConfigError::invalid(
            "types.expiration",
            format!("{kind} policy durations must be greater than zero"),
        ));
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = TicketsConfig::builder().build().unwrap();
        assert_eq!(config, TicketsConfig::default());
        assert_eq!(config.max_id_attempts(), 3);
        assert_eq!(config.request_timeout(), Duration::from_secs(5));
        assert_eq!(
            config.type_config(TicketKind::ServiceTicket).expiration,
            ExpirationPolicy::TimeToLive { ttl: Duration::from_secs(10) }
        );
    }

    #[rstest]
    #[case::entropy(TicketsConfig::builder().id_random_bytes(16).build(), "id_random_bytes")]
    #[case::attempts(TicketsConfig::builder().max_id_attempts(0).build(), "max_id_attempts")]
    #[case::timeout(
        TicketsConfig::builder().request_timeout(Duration::ZERO).build(),
        "request_timeout"
    )]
    #[case::never_expires(
        TicketsConfig::builder()
            .types(
                [(
                    TicketKind::ServiceTicket,
                    TicketTypeConfig {
                        expiration: ExpirationPolicy::NeverExpires,
                        ..TicketTypeConfig::for_kind(TicketKind::ServiceTicket)
                    },
                )]
                .into(),
            )
            .build(),
        "types.expiration"
    )]
    fn test_rejects_out_of_range(
        #[case] result: Result<TicketsConfig, ConfigError>,
        #[case] expected_field: &str,
    ) {
        let ConfigError::Invalid { field, .. } = result.unwrap_err() else {
            unreachable!("only one variant");
        };
        assert_eq!(field, expected_field);
    }

    #[test]
    fn test_rejects_shared_prefix() {
        let mut types = BTreeMap::new();
        types.insert(
            TicketKind::ProxyTicket,
            TicketTypeConfig {
                prefix: Some("ST".into()),
                ..TicketTypeConfig::for_kind(TicketKind::ProxyTicket)
            },
        );
        let err = TicketsConfig::builder().types(types).build().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "types.prefix", .. }));
    }

    #[test]
    fn test_rejects_zero_ttl() {
        let mut types = BTreeMap::new();
        types.insert(
            TicketKind::ServiceTicket,
            TicketTypeConfig {
                prefix: None,
                expiration: ExpirationPolicy::TimeToLive { ttl: Duration::ZERO },
                storage_timeout: None,
            },
        );
        let err = TicketsConfig::builder().types(types).build().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "types.expiration", .. }));
    }

    #[test]
    fn test_deserialize_rejects_unknown_fields() {
        assert!(serde_json::from_str::<TicketsConfig>(r#"{"ticket_ttl":"10s"}"#).is_err());
    }

    #[test]
    fn test_deserialize_nested() {
        let config: TicketsConfig = serde_json::from_str(
            r#"{
                "id_suffix": "node2",
                "sweeper": { "interval": "30s" },
                "oauth": { "rotate_refresh_tokens": true },
                "types": {
                    "TicketGrantingTicket": {
                        "prefix": "TGC",
                        "expiration": { "policy": "never_expires" },
                        "storage_timeout": "1h"
                    }
                }
            }"#,
        )
        .unwrap();
        config.validate().unwrap();

        assert_eq!(config.id_suffix(), Some("node2"));
        assert_eq!(config.sweeper().interval, Duration::from_secs(30));
        assert!(config.sweeper().enabled);
        assert!(config.oauth().rotate_refresh_tokens);
        let tgt = config.type_config(TicketKind::TicketGrantingTicket);
        assert_eq!(tgt.prefix(TicketKind::TicketGrantingTicket), "TGC");
        assert_eq!(tgt.storage_timeout, Some(Duration::from_secs(3600)));
    }
}
