//! Ticket catalog: the registry of ticket-type definitions.
//!
//! The catalog is consulted at two points:
//!
//! 1. When a ticket of a given kind is minted, to pick its prefix, ID
//!    generator and expiration policy.
//! 2. When a stored ticket is loaded, to pair it with its definition (for
//!    example to find a storage timeout override). The stored payload's type
//!    tag is the discriminant, never the identifier format.

use std::{collections::BTreeMap, fmt, sync::Arc, time::Duration};

use sso_ticket_storage::ConfigError;

use crate::{
    config::TicketsConfig,
    error::{TicketError, TicketResult},
    expiration::ExpirationPolicy,
    id::{DefaultTicketIdGenerator, TicketIdGenerator},
    ticket::{Ticket, TicketId, TicketKind},
};

/// Definition of one ticket type.
#[derive(Clone)]
pub struct TicketDefinition {
    kind: TicketKind,
    prefix: String,
    id_generator: Arc<dyn TicketIdGenerator>,
    expiration_policy: ExpirationPolicy,
    storage_timeout_override: Option<Duration>,
}

impl fmt::Debug for TicketDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TicketDefinition")
            .field("kind", &self.kind)
            .field("prefix", &self.prefix)
            .field("expiration_policy", &self.expiration_policy)
            .field("storage_timeout_override", &self.storage_timeout_override)
            .finish_non_exhaustive()
    }
}

#[bon::bon]
impl TicketDefinition {
    /// Creates a definition. The prefix defaults to the kind's conventional
    /// prefix.
    #[builder]
    pub fn new(
        kind: TicketKind,
        #[builder(into)] prefix: Option<String>,
        id_generator: Arc<dyn TicketIdGenerator>,
        expiration_policy: ExpirationPolicy,
        storage_timeout_override: Option<Duration>,
    ) -> Self {
        Self {
            kind,
            prefix: prefix.unwrap_or_else(|| kind.default_prefix().to_owned()),
            id_generator,
            expiration_policy,
            storage_timeout_override,
        }
    }

    /// Returns the kind this definition describes.
    #[must_use]
    pub fn kind(&self) -> TicketKind {
        self.kind
    }

    /// Returns the identifier prefix.
    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Returns the expiration policy stamped onto new tickets.
    #[must_use]
    pub fn expiration_policy(&self) -> ExpirationPolicy {
        self.expiration_policy
    }

    /// Returns the storage timeout override, if any.
    #[must_use]
    pub fn storage_timeout_override(&self) -> Option<Duration> {
        self.storage_timeout_override
    }

    /// Generates a fresh identifier for this type.
    #[must_use]
    pub fn generate_id(&self) -> TicketId {
        self.id_generator.generate(&self.prefix)
    }

    /// Returns `true` if `id` carries this definition's prefix.
    #[must_use]
    pub fn owns_id(&self, id: &TicketId) -> bool {
        id.as_str()
            .strip_prefix(self.prefix.as_str())
            .is_some_and(|rest| rest.starts_with('-'))
    }
}

/// Catalog of ticket definitions, keyed by kind.
#[derive(Debug, Clone, Default)]
pub struct TicketCatalog {
    definitions: BTreeMap<TicketKind, TicketDefinition>,
}

impl TicketCatalog {
    /// Creates an empty catalog.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a catalog covering every kind from configuration. All types
    /// share one ID generator.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if the configuration is invalid.
    pub fn from_config(config: &TicketsConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let generator: Arc<dyn TicketIdGenerator> = Arc::new(DefaultTicketIdGenerator::new(
            config.id_random_bytes(),
            config.id_suffix().map(str::to_owned),
        )?);

        let mut catalog = Self::new();
        for kind in TicketKind::ALL {
            let type_config = config.type_config(kind);
            catalog.register(
                TicketDefinition::builder()
                    .kind(kind)
                    .prefix(type_config.prefix(kind))
                    .id_generator(Arc::clone(&generator))
                    .expiration_policy(type_config.expiration)
                    .maybe_storage_timeout_override(type_config.storage_timeout)
                    .build(),
            );
        }
        Ok(catalog)
    }

    /// Registers a definition, replacing (and returning) any previous
    /// definition of the same kind.
    pub fn register(&mut self, definition: TicketDefinition) -> Option<TicketDefinition> {
        let previous = self.definitions.insert(definition.kind, definition);
        if let Some(previous) = &previous {
            tracing::debug!(kind = %previous.kind, "ticket definition overridden");
        }
        previous
    }

    /// Looks up the definition for `kind`.
    ///
    /// # Errors
    ///
    /// Returns [`TicketError::UnknownTicketType`] if no definition exists.
    pub fn find(&self, kind: TicketKind) -> TicketResult<&TicketDefinition> {
        self.definitions
            .get(&kind)
            .ok_or_else(|| TicketError::UnknownTicketType { name: kind.type_name().to_owned() })
    }

    /// Looks up the definition for a stored ticket by its type tag.
    ///
    /// # Errors
    ///
    /// Returns [`TicketError::UnknownTicketType`] if no definition exists.
    pub fn find_for_ticket(&self, ticket: &Ticket) -> TicketResult<&TicketDefinition> {
        self.find(ticket.kind())
    }

    /// Looks up a definition by type name, e.g. `"ServiceTicket"`.
    ///
    /// # Errors
    ///
    /// Returns [`TicketError::UnknownTicketType`] for unknown names.
    pub fn find_by_type_name(&self, name: &str) -> TicketResult<&TicketDefinition> {
        let kind = TicketKind::from_type_name(name)
            .ok_or_else(|| TicketError::UnknownTicketType { name: name.to_owned() })?;
        self.find(kind)
    }

    /// Guesses the kind of a ticket from its identifier prefix. Used only to
    /// route a request before the ticket is loaded; the stored type tag
    /// remains authoritative.
    #[must_use]
    pub fn kind_for_id(&self, id: &TicketId) -> Option<TicketKind> {
        self.definitions.values().find(|def| def.owns_id(id)).map(TicketDefinition::kind)
    }

    /// Returns the number of registered definitions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    /// Returns `true` if no definitions are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn catalog() -> TicketCatalog {
        TicketCatalog::from_config(&TicketsConfig::default()).unwrap()
    }

    #[test]
    fn test_from_config_covers_every_kind() {
        let catalog = catalog();
        assert_eq!(catalog.len(), TicketKind::ALL.len());
        for kind in TicketKind::ALL {
            let def = catalog.find(kind).unwrap();
            assert_eq!(def.prefix(), kind.default_prefix());
            assert!(def.owns_id(&def.generate_id()));
        }
    }

    #[test]
    fn test_register_overrides_and_returns_previous() {
        let mut catalog = catalog();
        let previous = catalog.register(
            TicketDefinition::builder()
                .kind(TicketKind::ServiceTicket)
                .id_generator(Arc::new(DefaultTicketIdGenerator::default()))
                .expiration_policy(ExpirationPolicy::TimeToLive { ttl: Duration::from_secs(1) })
                .build(),
        );
        assert_eq!(
            previous.unwrap().expiration_policy(),
            ExpirationPolicy::TimeToLive { ttl: Duration::from_secs(10) }
        );
        assert_eq!(
            catalog.find(TicketKind::ServiceTicket).unwrap().expiration_policy(),
            ExpirationPolicy::TimeToLive { ttl: Duration::from_secs(1) }
        );
    }

    #[test]
    fn test_unknown_type_name() {
        let err = catalog().find_by_type_name("SessionCookie").unwrap_err();
        assert!(matches!(err, TicketError::UnknownTicketType { name } if name == "SessionCookie"));
    }

    #[test]
    fn test_missing_definition() {
        let err = TicketCatalog::new().find(TicketKind::OAuthCode).unwrap_err();
        assert!(matches!(err, TicketError::UnknownTicketType { .. }));
    }

    #[test]
    fn test_kind_for_id_does_not_confuse_shared_leading_letters() {
        let catalog = catalog();
        assert_eq!(
            catalog.kind_for_id(&TicketId::new("PGT-3-abc")),
            Some(TicketKind::ProxyGrantingTicket)
        );
        assert_eq!(catalog.kind_for_id(&TicketId::new("PT-3-abc")), Some(TicketKind::ProxyTicket));
        assert_eq!(catalog.kind_for_id(&TicketId::new("PGTIOU-3-abc")), None);
    }
}
