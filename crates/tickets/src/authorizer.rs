//! Validation authorizer pipeline.
//!
//! When a service or proxy ticket is validated, the request runs through an
//! ordered list of authorizers. Evaluation stops at the first
//! [`AuthorizationDecision::Deny`]. Authorizers are only ever appended, so
//! the evaluation order is exactly the registration order.
//!
//! The standard pipeline, in order:
//!
//! 1. [`TicketValidityAuthorizer`]: the ticket is a service or proxy ticket,
//!    unexpired, and bound to the presented service
//! 2. [`RegisteredServiceAuthorizer`]: the service is registered and enabled
//! 3. [`AuthenticationPolicyAuthorizer`]: the authentication satisfies the
//!    service's required methods
//! 4. [`ValidationSpecificationAuthorizer`]: the request's protocol
//!    constraints (renew, proxied) hold

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    error::{TicketError, TicketResult},
    services::RegisteredService,
    ticket::{Authentication, Service, Ticket, TicketKind, TicketPayload},
};

/// Protocol constraints carried with a validation request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationSpecification {
    /// Only accept tickets issued from a fresh primary login.
    #[serde(default)]
    pub renew: bool,
    /// Accept proxy tickets in addition to service tickets.
    #[serde(default)]
    pub allow_proxied: bool,
}

impl ValidationSpecification {
    /// Service validation: no renew requirement, proxy tickets rejected.
    #[must_use]
    pub fn service() -> Self {
        Self { renew: false, allow_proxied: false }
    }

    /// Proxy validation: proxy tickets accepted.
    #[must_use]
    pub fn proxy() -> Self {
        Self { renew: false, allow_proxied: true }
    }
}

/// Everything an authorizer may inspect.
#[derive(Debug, Clone, Copy)]
pub struct ValidationRequest<'a> {
    /// The (already consumed) ticket being validated.
    pub ticket: &'a Ticket,
    /// The service the ticket was presented for.
    pub service: &'a Service,
    /// The authentication of the root ticket-granting ticket.
    pub authentication: Option<&'a Authentication>,
    /// The registered service matching `service`, if any.
    pub registered_service: Option<&'a RegisteredService>,
    /// Protocol constraints.
    pub specification: ValidationSpecification,
    /// Evaluation time.
    pub now: DateTime<Utc>,
}

/// Outcome of a single authorizer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthorizationDecision {
    /// Continue with the next authorizer.
    Allow,
    /// Reject the validation.
    Deny(String),
}

/// A single check in the validation pipeline.
#[async_trait]
pub trait ServiceTicketValidationAuthorizer: Send + Sync + fmt::Debug {
    /// Name used in logs.
    fn name(&self) -> &'static str;

    /// Decides whether the validation may proceed.
    async fn authorize(&self, request: &ValidationRequest<'_>) -> AuthorizationDecision;
}

/// Ordered, short-circuiting list of authorizers.
#[derive(Debug, Clone, Default)]
pub struct AuthorizerPipeline {
    authorizers: Vec<Arc<dyn ServiceTicketValidationAuthorizer>>,
}

impl AuthorizerPipeline {
    /// Creates an empty pipeline (allows everything).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The four standard authorizers in their canonical order.
    #[must_use]
    pub fn standard() -> Self {
        Self::new()
            .with(Arc::new(TicketValidityAuthorizer))
            .with(Arc::new(RegisteredServiceAuthorizer))
            .with(Arc::new(AuthenticationPolicyAuthorizer))
            .with(Arc::new(ValidationSpecificationAuthorizer))
    }

    /// Appends an authorizer.
    #[must_use]
    pub fn with(mut self, authorizer: Arc<dyn ServiceTicketValidationAuthorizer>) -> Self {
        self.authorizers.push(authorizer);
        self
    }

    /// Returns the authorizer names in evaluation order.
    #[must_use]
    pub fn names(&self) -> Vec<&'static str> {
        self.authorizers.iter().map(|authorizer| authorizer.name()).collect()
    }

    /// Runs every authorizer in order.
    ///
    /// # Errors
    ///
    /// Returns [`TicketError::AuthorizationDenied`] with the reason of the
    /// first denying authorizer.
    pub async fn authorize(&self, request: &ValidationRequest<'_>) -> TicketResult<()> {
        for authorizer in &self.authorizers {
            if let AuthorizationDecision::Deny(reason) = authorizer.authorize(request).await {
                tracing::info!(
                    authorizer = authorizer.name(),
                    ticket_id = %request.ticket.id(),
                    service = %request.service,
                    reason = %reason,
                    "validation denied"
                );
                return Err(TicketError::authorization_denied(reason));
            }
        }
        Ok(())
    }
}

/// Checks kind, expiry and service binding of the presented ticket.
#[derive(Debug, Clone, Copy, Default)]
pub struct TicketValidityAuthorizer;

#[async_trait]
impl ServiceTicketValidationAuthorizer for TicketValidityAuthorizer {
    fn name(&self) -> &'static str {
        "ticket_validity"
    }

    async fn authorize(&self, request: &ValidationRequest<'_>) -> AuthorizationDecision {
        let ticket = request.ticket;
        if !matches!(ticket.kind(), TicketKind::ServiceTicket | TicketKind::ProxyTicket) {
            return AuthorizationDecision::Deny(format!("{} cannot be validated", ticket.kind()));
        }
        if ticket.is_expired(request.now) {
            return AuthorizationDecision::Deny("ticket has expired".into());
        }
        if ticket.service() != Some(request.service) {
            return AuthorizationDecision::Deny(format!(
                "ticket was not issued for {}",
                request.service
            ));
        }
        AuthorizationDecision::Allow
    }
}

/// Requires the service to be registered and enabled.
#[derive(Debug, Clone, Copy, Default)]
pub struct RegisteredServiceAuthorizer;

#[async_trait]
impl ServiceTicketValidationAuthorizer for RegisteredServiceAuthorizer {
    fn name(&self) -> &'static str {
        "registered_service"
    }

    async fn authorize(&self, request: &ValidationRequest<'_>) -> AuthorizationDecision {
        match request.registered_service {
            None => AuthorizationDecision::Deny(format!("{} is not registered", request.service)),
            Some(registered) if !registered.enabled => {
                AuthorizationDecision::Deny(format!("service {} is disabled", registered.name))
            },
            Some(_) => AuthorizationDecision::Allow,
        }
    }
}

/// Requires the authentication to include every method the service
/// demands, e.g. a multifactor method.
#[derive(Debug, Clone, Copy, Default)]
pub struct AuthenticationPolicyAuthorizer;

#[async_trait]
impl ServiceTicketValidationAuthorizer for AuthenticationPolicyAuthorizer {
    fn name(&self) -> &'static str {
        "authentication_policy"
    }

    async fn authorize(&self, request: &ValidationRequest<'_>) -> AuthorizationDecision {
        let Some(registered) = request.registered_service else {
            return AuthorizationDecision::Allow;
        };
        if registered.required_methods.is_empty() {
            return AuthorizationDecision::Allow;
        }
        let Some(authentication) = request.authentication else {
            return AuthorizationDecision::Deny("no authentication context".into());
        };
        let missing: Vec<&str> = registered
            .required_methods
            .difference(&authentication.methods)
            .map(String::as_str)
            .collect();
        if missing.is_empty() {
            AuthorizationDecision::Allow
        } else {
            AuthorizationDecision::Deny(format!(
                "authentication does not satisfy required methods: {}",
                missing.join(", ")
            ))
        }
    }
}

/// Enforces [`ValidationSpecification`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ValidationSpecificationAuthorizer;

#[async_trait]
impl ServiceTicketValidationAuthorizer for ValidationSpecificationAuthorizer {
    fn name(&self) -> &'static str {
        "validation_specification"
    }

    async fn authorize(&self, request: &ValidationRequest<'_>) -> AuthorizationDecision {
        let spec = request.specification;
        match request.ticket.payload() {
            TicketPayload::ProxyTicket { .. } if !spec.allow_proxied => {
                AuthorizationDecision::Deny("proxy tickets are not accepted".into())
            },
            TicketPayload::ServiceTicket { from_new_login: false, .. } if spec.renew => {
                AuthorizationDecision::Deny("ticket was not issued from a fresh login".into())
            },
            TicketPayload::ProxyTicket { .. } if spec.renew => {
                AuthorizationDecision::Deny("proxy tickets cannot satisfy renew".into())
            },
            _ => AuthorizationDecision::Allow,
        }
    }
}
