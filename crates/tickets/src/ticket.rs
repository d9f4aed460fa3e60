//! Ticket model.
//!
//! A [`Ticket`] is the common envelope (identity, lifecycle clock, expiration
//! policy, parent link, consumed flag) around a kind-specific
//! [`TicketPayload`]. The envelope is what the registry persists; the
//! payload's `type` tag is the discriminant used to pair a stored ticket with
//! its catalog entry.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    error::{TicketError, TicketResult},
    expiration::ExpirationPolicy,
};

/// Opaque ticket identifier, e.g. `ST-42-Xj9...`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TicketId(String);

impl TicketId {
    /// Wraps an identifier string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TicketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TicketId {
    fn from(id: &str) -> Self {
        Self(id.to_owned())
    }
}

impl From<String> for TicketId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// The ticket kinds known to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TicketKind {
    /// Root credential issued after primary authentication.
    TicketGrantingTicket,
    /// Single-use credential for one relying service.
    ServiceTicket,
    /// Credential a proxying service uses to obtain proxy tickets.
    ProxyGrantingTicket,
    /// Single-use credential obtained by a proxy for a target service.
    ProxyTicket,
    /// Single-use OAuth authorization code.
    OAuthCode,
    /// OAuth access token.
    AccessToken,
    /// OAuth refresh token.
    RefreshToken,
}

impl TicketKind {
    /// Every kind, in catalog order.
    pub const ALL: [Self; 7] = [
        Self::TicketGrantingTicket,
        Self::ServiceTicket,
        Self::ProxyGrantingTicket,
        Self::ProxyTicket,
        Self::OAuthCode,
        Self::AccessToken,
        Self::RefreshToken,
    ];

    /// Returns the type name, the discriminant used by the catalog.
    #[must_use]
    pub fn type_name(self) -> &'static str {
        match self {
            Self::TicketGrantingTicket => "TicketGrantingTicket",
            Self::ServiceTicket => "ServiceTicket",
            Self::ProxyGrantingTicket => "ProxyGrantingTicket",
            Self::ProxyTicket => "ProxyTicket",
            Self::OAuthCode => "OAuthCode",
            Self::AccessToken => "AccessToken",
            Self::RefreshToken => "RefreshToken",
        }
    }

    /// Resolves a type name produced by [`type_name`](Self::type_name).
    #[must_use]
    pub fn from_type_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.type_name() == name)
    }

    /// Returns the conventional identifier prefix for this kind.
    #[must_use]
    pub fn default_prefix(self) -> &'static str {
        match self {
            Self::TicketGrantingTicket => "TGT",
            Self::ServiceTicket => "ST",
            Self::ProxyGrantingTicket => "PGT",
            Self::ProxyTicket => "PT",
            Self::OAuthCode => "OC",
            Self::AccessToken => "AT",
            Self::RefreshToken => "RT",
        }
    }

    /// Returns `true` for kinds that may be validated at most once.
    #[must_use]
    pub fn is_single_use(self) -> bool {
        matches!(self, Self::ServiceTicket | Self::ProxyTicket | Self::OAuthCode)
    }
}

impl fmt::Display for TicketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.type_name())
    }
}

/// An authenticated identity. Attributes are opaque to the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    id: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    attributes: BTreeMap<String, Vec<String>>,
}

impl Principal {
    /// Creates a principal without attributes.
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into(), attributes: BTreeMap::new() }
    }

    /// Adds an attribute value.
    #[must_use]
    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.entry(name.into()).or_default().push(value.into());
        self
    }

    /// Returns the principal identifier.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns the attribute mapping.
    #[must_use]
    pub fn attributes(&self) -> &BTreeMap<String, Vec<String>> {
        &self.attributes
    }
}

/// A relying-party identifier, typically its URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Service(String);

impl Service {
    /// Wraps a service identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the identifier.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Service {
    fn from(id: &str) -> Self {
        Self(id.to_owned())
    }
}

/// The outcome of a primary authentication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Authentication {
    /// Who authenticated.
    pub principal: Principal,
    /// When the authentication happened.
    pub authenticated_at: DateTime<Utc>,
    /// Authentication methods satisfied, e.g. `password`, `mfa-totp`.
    #[serde(default)]
    pub methods: BTreeSet<String>,
}

impl Authentication {
    /// Creates an authentication with no recorded methods.
    #[must_use]
    pub fn new(principal: Principal, authenticated_at: DateTime<Utc>) -> Self {
        Self { principal, authenticated_at, methods: BTreeSet::new() }
    }

    /// Records a satisfied authentication method.
    #[must_use]
    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.methods.insert(method.into());
        self
    }
}

/// Kind-specific ticket data.
///
/// Serialized with a `type` tag, which makes it the discriminant of the
/// stored record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TicketPayload {
    /// Root credential.
    TicketGrantingTicket {
        /// When the principal authenticated.
        authenticated_at: DateTime<Utc>,
        /// Satisfied authentication methods.
        #[serde(default)]
        methods: BTreeSet<String>,
    },
    /// Service ticket.
    ServiceTicket {
        /// The service the ticket was issued for.
        service: Service,
        /// Whether the ticket was issued directly from a fresh login.
        from_new_login: bool,
    },
    /// Proxy-granting ticket held by a proxying service.
    ProxyGrantingTicket {
        /// The proxying service that validated the originating ticket.
        service: Service,
    },
    /// Proxy ticket for a target service.
    ProxyTicket {
        /// The target service.
        service: Service,
        /// The proxying service that requested it.
        proxied_by: Service,
    },
    /// OAuth authorization code.
    OAuthCode {
        /// The client the code was issued to.
        service: Service,
        /// Granted scopes.
        #[serde(default)]
        scopes: BTreeSet<String>,
    },
    /// OAuth access token.
    AccessToken {
        /// The client the token was issued to.
        service: Service,
        /// Granted scopes.
        #[serde(default)]
        scopes: BTreeSet<String>,
    },
    /// OAuth refresh token.
    RefreshToken {
        /// The client the token was issued to.
        service: Service,
        /// Granted scopes.
        #[serde(default)]
        scopes: BTreeSet<String>,
    },
}

impl TicketPayload {
    /// Returns the kind this payload belongs to.
    #[must_use]
    pub fn kind(&self) -> TicketKind {
        match self {
            Self::TicketGrantingTicket { .. } => TicketKind::TicketGrantingTicket,
            Self::ServiceTicket { .. } => TicketKind::ServiceTicket,
            Self::ProxyGrantingTicket { .. } => TicketKind::ProxyGrantingTicket,
            Self::ProxyTicket { .. } => TicketKind::ProxyTicket,
            Self::OAuthCode { .. } => TicketKind::OAuthCode,
            Self::AccessToken { .. } => TicketKind::AccessToken,
            Self::RefreshToken { .. } => TicketKind::RefreshToken,
        }
    }

    /// Returns the service binding, if the kind has one.
    #[must_use]
    pub fn service(&self) -> Option<&Service> {
        match self {
            Self::TicketGrantingTicket { .. } => None,
            Self::ServiceTicket { service, .. }
            | Self::ProxyGrantingTicket { service }
            | Self::ProxyTicket { service, .. }
            | Self::OAuthCode { service, .. }
            | Self::AccessToken { service, .. }
            | Self::RefreshToken { service, .. } => Some(service),
        }
    }

    /// Returns the granted scopes for OAuth kinds.
    #[must_use]
    pub fn scopes(&self) -> Option<&BTreeSet<String>> {
        match self {
            Self::OAuthCode { scopes, .. }
            | Self::AccessToken { scopes, .. }
            | Self::RefreshToken { scopes, .. } => Some(scopes),
            _ => None,
        }
    }
}

/// A ticket: common envelope plus kind-specific payload.
///
/// The expiration policy, principal, parent link and payload (including the
/// service binding) are fixed at creation. Only the lifecycle clock
/// (`last_used_time`, `usage_count`), the consumed flag and the proxy-grant
/// flag change afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ticket {
    id: TicketId,
    principal: Principal,
    creation_time: DateTime<Utc>,
    last_used_time: DateTime<Utc>,
    #[serde(default)]
    usage_count: u64,
    expiration_policy: ExpirationPolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    parent_id: Option<TicketId>,
    #[serde(default)]
    consumed: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    proxy_granted: bool,
    #[serde(flatten)]
    payload: TicketPayload,
}

impl Ticket {
    /// Creates a fresh, unused ticket.
    #[must_use]
    pub fn new(
        id: TicketId,
        principal: Principal,
        payload: TicketPayload,
        expiration_policy: ExpirationPolicy,
        parent_id: Option<TicketId>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            principal,
            creation_time: now,
            last_used_time: now,
            usage_count: 0,
            expiration_policy,
            parent_id,
            consumed: false,
            proxy_granted: false,
            payload,
        }
    }

    /// Returns the identifier.
    #[must_use]
    pub fn id(&self) -> &TicketId {
        &self.id
    }

    /// Returns the kind, derived from the payload.
    #[must_use]
    pub fn kind(&self) -> TicketKind {
        self.payload.kind()
    }

    /// Returns the principal the ticket was issued to.
    #[must_use]
    pub fn principal(&self) -> &Principal {
        &self.principal
    }

    /// Returns the service binding, if any.
    #[must_use]
    pub fn service(&self) -> Option<&Service> {
        self.payload.service()
    }

    /// Returns the creation time.
    #[must_use]
    pub fn creation_time(&self) -> DateTime<Utc> {
        self.creation_time
    }

    /// Returns the time of the last use (creation time if never used).
    #[must_use]
    pub fn last_used_time(&self) -> DateTime<Utc> {
        self.last_used_time
    }

    /// Returns how many times the ticket has been used.
    #[must_use]
    pub fn usage_count(&self) -> u64 {
        self.usage_count
    }

    /// Returns the expiration policy.
    #[must_use]
    pub fn expiration_policy(&self) -> &ExpirationPolicy {
        &self.expiration_policy
    }

    /// Returns the parent ticket, if any.
    #[must_use]
    pub fn parent_id(&self) -> Option<&TicketId> {
        self.parent_id.as_ref()
    }

    /// Returns `true` once a single-use ticket has been consumed.
    #[must_use]
    pub fn is_consumed(&self) -> bool {
        self.consumed
    }

    /// Returns `true` once a proxy-granting ticket was granted on the
    /// strength of this validated ticket.
    #[must_use]
    pub fn proxy_granted(&self) -> bool {
        self.proxy_granted
    }

    /// Returns the kind-specific payload.
    #[must_use]
    pub fn payload(&self) -> &TicketPayload {
        &self.payload
    }

    /// Returns `true` if the ticket's own policy says it has expired.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiration_policy.is_expired(self.creation_time, self.last_used_time, now)
    }

    /// Returns the authentication carried by a ticket-granting ticket.
    #[must_use]
    pub fn authentication(&self) -> Option<Authentication> {
        match &self.payload {
            TicketPayload::TicketGrantingTicket { authenticated_at, methods } => {
                Some(Authentication {
                    principal: self.principal.clone(),
                    authenticated_at: *authenticated_at,
                    methods: methods.clone(),
                })
            },
            _ => None,
        }
    }

    /// Records a use at `now`.
    ///
    /// # Errors
    ///
    /// Returns [`TicketError::ThrottledReplay`] if the policy's minimum
    /// interval between uses has not elapsed. The ticket is unchanged.
    pub fn mark_used(&mut self, now: DateTime<Utc>) -> TicketResult<()> {
        self.expiration_policy
            .check_throttle(self.last_used_time, self.usage_count, now)
            .map_err(|retry_after| TicketError::ThrottledReplay {
                id: self.id.to_string(),
                retry_after,
            })?;
        self.last_used_time = self.last_used_time.max(now);
        self.usage_count = self.usage_count.saturating_add(1);
        Ok(())
    }

    pub(crate) fn mark_consumed(&mut self) {
        self.consumed = true;
    }

    pub(crate) fn mark_proxy_granted(&mut self) {
        self.proxy_granted = true;
    }

    /// Copies the mutable lifecycle state of `update` onto this ticket,
    /// leaving every creation-time field untouched. The flags and the
    /// lifecycle clock only move forward.
    pub(crate) fn absorb_lifecycle(&mut self, update: &Ticket) {
        self.last_used_time = self.last_used_time.max(update.last_used_time);
        self.usage_count = self.usage_count.max(update.usage_count);
        self.consumed |= update.consumed;
        self.proxy_granted |= update.proxy_granted;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::time::Duration;

    use chrono::TimeDelta;

    use super::*;

    fn service_ticket(now: DateTime<Utc>) -> Ticket {
        Ticket::new(
            TicketId::new("ST-1-abc"),
            Principal::new("casuser").with_attribute("mail", "casuser@example.org"),
            TicketPayload::ServiceTicket {
                service: Service::new("https://app.example.org"),
                from_new_login: true,
            },
            ExpirationPolicy::TimeToLive { ttl: Duration::from_secs(10) },
            Some(TicketId::new("TGT-1-xyz")),
            now,
        )
    }

    #[test]
    fn test_record_is_flat_and_tagged() {
        let ticket = service_ticket(DateTime::<Utc>::UNIX_EPOCH);
        let json = serde_json::to_value(&ticket).unwrap();

        assert_eq!(json["type"], "ServiceTicket");
        assert_eq!(json["service"], "https://app.example.org");
        assert_eq!(json["parent_id"], "TGT-1-xyz");
        assert_eq!(json["consumed"], false);
        assert!(json.get("proxy_granted").is_none(), "unset flag is omitted");

        let decoded: Ticket = serde_json::from_value(json).unwrap();
        assert_eq!(decoded, ticket);
    }

    #[test]
    fn test_type_name_round_trip() {
        for kind in TicketKind::ALL {
            assert_eq!(TicketKind::from_type_name(kind.type_name()), Some(kind));
        }
        assert_eq!(TicketKind::from_type_name("Cookie"), None);
    }

    #[test]
    fn test_mark_used_throttles() {
        let now = DateTime::<Utc>::UNIX_EPOCH;
        let mut ticket = Ticket::new(
            TicketId::new("TGT-1-a"),
            Principal::new("casuser"),
            TicketPayload::TicketGrantingTicket { authenticated_at: now, methods: BTreeSet::new() },
            ExpirationPolicy::ThrottledRate {
                min_interval: Duration::from_secs(5),
                time_to_kill: Duration::from_secs(60),
            },
            None,
            now,
        );

        ticket.mark_used(now).unwrap();
        let err = ticket.mark_used(now + TimeDelta::seconds(1)).unwrap_err();
        assert!(matches!(err, TicketError::ThrottledReplay { .. }));
        assert_eq!(ticket.usage_count(), 1);

        ticket.mark_used(now + TimeDelta::seconds(5)).unwrap();
        assert_eq!(ticket.usage_count(), 2);
    }

    #[test]
    fn test_absorb_lifecycle_never_unconsumes() {
        let now = DateTime::<Utc>::UNIX_EPOCH;
        let mut stored = service_ticket(now);
        stored.mark_consumed();

        stored.mark_proxy_granted();

        let stale = service_ticket(now);
        stored.absorb_lifecycle(&stale);
        assert!(stored.is_consumed());
        assert!(stored.proxy_granted());
    }
}
