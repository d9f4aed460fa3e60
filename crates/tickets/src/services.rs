//! Registered relying-party services.

use std::{collections::BTreeSet, fmt};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::ticket::Service;

/// How a registered service matches presented service identifiers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "match", content = "value", rename_all = "lowercase")]
pub enum ServiceMatcher {
    /// The identifier must equal the value.
    Exact(String),
    /// The identifier must start with the value.
    Prefix(String),
}

impl ServiceMatcher {
    /// Returns `true` if `service` is covered by this matcher.
    #[must_use]
    pub fn matches(&self, service: &Service) -> bool {
        match self {
            Self::Exact(value) => service.as_str() == value,
            Self::Prefix(value) => service.as_str().starts_with(value.as_str()),
        }
    }
}

/// A relying party known to the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegisteredService {
    /// Human-readable name used in logs.
    pub name: String,
    /// Which identifiers belong to this service.
    pub matcher: ServiceMatcher,
    /// Disabled services cannot obtain or validate tickets.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Whether this service may act as a proxy.
    #[serde(default)]
    pub proxy_allowed: bool,
    /// Callback URLs accepted for proxy-granting ticket delivery must start
    /// with this value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_callback_prefix: Option<String>,
    /// Authentication methods the principal must have satisfied.
    #[serde(default)]
    pub required_methods: BTreeSet<String>,
}

fn default_true() -> bool {
    true
}

impl RegisteredService {
    /// An enabled, non-proxying service matched by exact identifier.
    pub fn exact(name: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            matcher: ServiceMatcher::Exact(id.into()),
            enabled: true,
            proxy_allowed: false,
            proxy_callback_prefix: None,
            required_methods: BTreeSet::new(),
        }
    }

    /// An enabled, non-proxying service matched by identifier prefix.
    pub fn prefix(name: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self { matcher: ServiceMatcher::Prefix(prefix.into()), ..Self::exact(name, String::new()) }
    }

    /// Allows proxying with callbacks under `callback_prefix`.
    #[must_use]
    pub fn with_proxy(mut self, callback_prefix: impl Into<String>) -> Self {
        self.proxy_allowed = true;
        self.proxy_callback_prefix = Some(callback_prefix.into());
        self
    }

    /// Requires an authentication method.
    #[must_use]
    pub fn requiring_method(mut self, method: impl Into<String>) -> Self {
        self.required_methods.insert(method.into());
        self
    }

    /// Returns `true` if `url` may receive proxy-granting tickets for this
    /// service.
    #[must_use]
    pub fn accepts_callback(&self, url: &str) -> bool {
        self.proxy_allowed
            && self.proxy_callback_prefix.as_deref().is_some_and(|prefix| url.starts_with(prefix))
    }
}

/// Lookup of registered services.
#[async_trait]
pub trait ServiceRegistry: Send + Sync + fmt::Debug {
    /// Returns the first registered service matching `service`.
    async fn find(&self, service: &Service) -> Option<RegisteredService>;
}

/// In-memory service registry; first match in registration order wins.
#[derive(Debug, Default)]
pub struct InMemoryServiceRegistry {
    services: RwLock<Vec<RegisteredService>>,
}

impl InMemoryServiceRegistry {
    /// Creates a registry with the given services.
    #[must_use]
    pub fn new(services: Vec<RegisteredService>) -> Self {
        Self { services: RwLock::new(services) }
    }

    /// Appends a service.
    pub fn register(&self, service: RegisteredService) {
        self.services.write().push(service);
    }
}

#[async_trait]
impl ServiceRegistry for InMemoryServiceRegistry {
    async fn find(&self, service: &Service) -> Option<RegisteredService> {
        self.services.read().iter().find(|registered| registered.matcher.matches(service)).cloned()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_first_match_wins() {
        let registry = InMemoryServiceRegistry::new(vec![
            RegisteredService::exact("billing", "https://app.example.org/billing"),
            RegisteredService::prefix("app", "https://app.example.org"),
        ]);

        let billing = registry.find(&Service::new("https://app.example.org/billing")).await;
        assert_eq!(billing.unwrap().name, "billing");
        let other = registry.find(&Service::new("https://app.example.org/reports")).await;
        assert_eq!(other.unwrap().name, "app");
        assert!(registry.find(&Service::new("https://evil.example.com")).await.is_none());
    }

    #[test]
    fn test_callback_requires_proxy_permission() {
        let service = RegisteredService::exact("app", "https://app.example.org");
        assert!(!service.accepts_callback("https://app.example.org/pgt"));

        let proxy = service.with_proxy("https://app.example.org/");
        assert!(proxy.accepts_callback("https://app.example.org/pgt"));
        assert!(!proxy.accepts_callback("https://attacker.example.com/pgt"));
    }

    #[test]
    fn test_matcher_serde() {
        let matcher: ServiceMatcher =
            serde_json::from_str(r#"{"match":"prefix","value":"https://app"}"#).unwrap();
        assert_eq!(matcher, ServiceMatcher::Prefix("https://app".into()));
    }
}
