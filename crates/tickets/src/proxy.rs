//! Proxy chain engine.
//!
//! A service that validated a service (or proxy) ticket may ask for a
//! proxy-granting ticket (PGT), which it then exchanges for proxy tickets
//! (PT) to call further services on the user's behalf. The resulting chain
//! is `TGT -> PGT -> PT`; a PT is only valid while every ancestor is.
//!
//! A PGT request moves through a small state machine:
//!
//! ```text
//! Presented --check chain--> Checked { parent_valid }
//! Checked { parent_valid: true } --handler ok--> Granted
//! Checked { parent_valid: false } or handler failure --> Rejected
//! ```
//!
//! Two [`ProxyHandler`]s decide how the PGT reaches the service: the
//! [`LegacyProxyHandler`] grants directly, while the
//! [`CallbackProxyHandler`] first delivers the PGT and an IOU to the
//! service's callback URL and grants only on a 2xx response.

use std::{fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use sso_ticket_storage::ConfigError;

use crate::{
    catalog::TicketCatalog,
    clock::Clock,
    config::ProxyConfig,
    error::{TicketError, TicketResult},
    id::{PGT_IOU_PREFIX, TicketIdGenerator},
    registry::{MAX_CHAIN_DEPTH, TicketRegistry, create_ticket},
    services::ServiceRegistry,
    ticket::{Service, Ticket, TicketId, TicketKind, TicketPayload},
};

/// Delivers a proxy-granting ticket to the proxying service.
#[async_trait]
pub trait ProxyCallbackClient: Send + Sync + fmt::Debug {
    /// Sends `pgt_id` and `pgt_iou` to `callback_url`.
    ///
    /// # Errors
    ///
    /// Returns [`TicketError::ProxyCallbackFailed`] if the endpoint cannot
    /// be reached or does not answer with a success status.
    async fn deliver(
        &self,
        callback_url: &str,
        pgt_id: &TicketId,
        pgt_iou: &TicketId,
    ) -> TicketResult<()>;
}

/// [`ProxyCallbackClient`] over HTTPS.
///
/// Issues `GET {callback_url}?pgtId=..&pgtIou=..` and requires a 2xx
/// response.
#[derive(Debug, Clone)]
pub struct HttpProxyCallbackClient {
    client: reqwest::Client,
}

impl HttpProxyCallbackClient {
    /// Creates a client whose requests time out after `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if the HTTP client cannot be built.
    pub fn new(timeout: Duration) -> Result<Self, ConfigError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ConfigError::invalid("proxy.callback_timeout", e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ProxyCallbackClient for HttpProxyCallbackClient {
    #[tracing::instrument(skip_all, fields(callback_url = %callback_url))]
    async fn deliver(
        &self,
        callback_url: &str,
        pgt_id: &TicketId,
        pgt_iou: &TicketId,
    ) -> TicketResult<()> {
        let response = self
            .client
            .get(callback_url)
            .query(&[("pgtId", pgt_id.as_str()), ("pgtIou", pgt_iou.as_str())])
            .send()
            .await
            .map_err(|e| {
                TicketError::proxy_callback_failed_with_source(callback_url, "request failed", e)
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(TicketError::proxy_callback_failed(
                callback_url,
                format!("callback answered {status}"),
            ));
        }
        Ok(())
    }
}

/// Decides how a proxy-granting ticket is handed out.
#[async_trait]
pub trait ProxyHandler: Send + Sync + fmt::Debug {
    /// Name used in logs.
    fn name(&self) -> &'static str;

    /// Hands `pgt` to the proxying service. Returns the IOU the caller
    /// should include in its validation response, if the handler uses one.
    ///
    /// # Errors
    ///
    /// Returns [`TicketError::ProxyCallbackFailed`] if the service could
    /// not confirm ownership. The PGT must not be stored in that case.
    async fn handle(
        &self,
        pgt: &Ticket,
        callback_url: Option<&str>,
    ) -> TicketResult<Option<TicketId>>;
}

/// Grants without contacting the service and without an IOU.
#[derive(Debug, Clone, Copy, Default)]
pub struct LegacyProxyHandler;

#[async_trait]
impl ProxyHandler for LegacyProxyHandler {
    fn name(&self) -> &'static str {
        "legacy"
    }

    async fn handle(
        &self,
        _pgt: &Ticket,
        _callback_url: Option<&str>,
    ) -> TicketResult<Option<TicketId>> {
        Ok(None)
    }
}

/// Delivers the PGT and a fresh IOU to the service's callback URL.
#[derive(Debug)]
pub struct CallbackProxyHandler {
    client: Arc<dyn ProxyCallbackClient>,
    iou_generator: Arc<dyn TicketIdGenerator>,
    require_https: bool,
}

impl CallbackProxyHandler {
    /// Creates a handler.
    pub fn new(
        client: Arc<dyn ProxyCallbackClient>,
        iou_generator: Arc<dyn TicketIdGenerator>,
        require_https: bool,
    ) -> Self {
        Self { client, iou_generator, require_https }
    }
}

#[async_trait]
impl ProxyHandler for CallbackProxyHandler {
    fn name(&self) -> &'static str {
        "callback"
    }

    async fn handle(
        &self,
        pgt: &Ticket,
        callback_url: Option<&str>,
    ) -> TicketResult<Option<TicketId>> {
        let Some(url) = callback_url else {
            return Err(TicketError::proxy_callback_failed("", "no callback URL supplied"));
        };
        if self.require_https && !url.starts_with("https://") {
            return Err(TicketError::proxy_callback_failed(url, "callback URL must use https"));
        }
        let iou = self.iou_generator.generate(PGT_IOU_PREFIX);
        self.client.deliver(url, pgt.id(), &iou).await?;
        Ok(Some(iou))
    }
}

/// State of a proxy-granting request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyState {
    /// The validated ticket has been presented.
    Presented,
    /// The ancestor chain has been checked.
    Checked {
        /// Whether every ancestor was present and unexpired.
        parent_valid: bool,
    },
    /// The PGT was handed out and stored.
    Granted,
    /// The request was refused.
    Rejected,
}

/// Inputs that drive [`ProxyState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyEvent {
    /// Result of the ancestor check.
    ChainChecked(bool),
    /// The handler confirmed delivery.
    HandlerSucceeded,
    /// The handler failed.
    HandlerFailed,
}

impl ProxyState {
    /// Applies `event`. Any transition not listed in the module docs
    /// rejects the request.
    #[must_use]
    pub fn next(self, event: ProxyEvent) -> Self {
        match (self, event) {
            (Self::Presented, ProxyEvent::ChainChecked(parent_valid)) => {
                Self::Checked { parent_valid }
            },
            (Self::Checked { parent_valid: true }, ProxyEvent::HandlerSucceeded) => Self::Granted,
            _ => Self::Rejected,
        }
    }
}

/// A granted proxy-granting ticket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyGrant {
    /// The stored PGT.
    pub ticket: Ticket,
    /// IOU delivered alongside the PGT in callback mode.
    pub iou: Option<TicketId>,
}

/// Issues and verifies proxy-granting and proxy tickets.
#[derive(Debug)]
pub struct ProxyChainEngine {
    registry: Arc<dyn TicketRegistry>,
    catalog: Arc<TicketCatalog>,
    services: Arc<dyn ServiceRegistry>,
    handler: Arc<dyn ProxyHandler>,
    clock: Arc<dyn Clock>,
    config: ProxyConfig,
    max_id_attempts: u32,
}

#[bon::bon]
impl ProxyChainEngine {
    /// Assembles the engine.
    #[builder]
    pub fn new(
        registry: Arc<dyn TicketRegistry>,
        catalog: Arc<TicketCatalog>,
        services: Arc<dyn ServiceRegistry>,
        handler: Arc<dyn ProxyHandler>,
        clock: Arc<dyn Clock>,
        #[builder(default)] config: ProxyConfig,
        #[builder(default = 3)] max_id_attempts: u32,
    ) -> Self {
        Self { registry, catalog, services, handler, clock, config, max_id_attempts }
    }

    /// Verifies that every ancestor of `ticket` up to the root exists and
    /// is unexpired. Returns the root.
    ///
    /// # Errors
    ///
    /// Returns [`TicketError::ProxyChainBroken`] naming the first failing
    /// ancestor.
    pub async fn validate_chain(&self, ticket: &Ticket) -> TicketResult<Ticket> {
        let now = self.clock.now();
        let mut current = ticket.clone();
        for _ in 0..MAX_CHAIN_DEPTH {
            let Some(parent_id) = current.parent_id().cloned() else {
                return Ok(current);
            };
            let parent = self
                .registry
                .find_ticket(&parent_id)
                .await?
                .ok_or_else(|| TicketError::proxy_chain_broken(&parent_id, "ancestor is gone"))?;
            if parent.is_expired(now) {
                return Err(TicketError::proxy_chain_broken(&parent_id, "ancestor expired"));
            }
            current = parent;
        }
        Err(TicketError::proxy_chain_broken(ticket.id(), "chain too deep"))
    }

    /// Grants a PGT to the service that validated `validated_id`.
    ///
    /// The PGT is chained to the validated ticket's originating TGT. In
    /// callback mode it is stored only after the callback confirmed
    /// ownership. A validated ticket backs at most one grant attempt; the
    /// claim is recorded before the callback runs, so a failed callback uses
    /// it up as well.
    ///
    /// # Errors
    ///
    /// - [`TicketError::AuthorizationDenied`] if proxying is disabled, the
    ///   ticket was never validated or already backed a grant, or the
    ///   service may not proxy
    /// - [`TicketError::ProxyChainBroken`] if an ancestor is gone or expired
    /// - [`TicketError::ProxyCallbackFailed`] if the callback failed
    #[tracing::instrument(
        skip_all,
        fields(validated_id = %validated_id, handler = self.handler.name())
    )]
    pub async fn grant_proxy_granting_ticket(
        &self,
        validated_id: &TicketId,
        callback_url: Option<&str>,
    ) -> TicketResult<ProxyGrant> {
        if !self.config.enabled {
            return Err(TicketError::authorization_denied("proxying is disabled"));
        }

        let mut state = ProxyState::Presented;
        let validated = self
            .registry
            .find_ticket(validated_id)
            .await?
            .ok_or_else(|| TicketError::not_found(validated_id))?;
        if !matches!(validated.kind(), TicketKind::ServiceTicket | TicketKind::ProxyTicket) {
            return Err(TicketError::TypeMismatch {
                id: validated_id.to_string(),
                expected: TicketKind::ServiceTicket,
                actual: validated.kind(),
            });
        }
        if !validated.is_consumed() {
            return Err(TicketError::authorization_denied("ticket has not been validated"));
        }
        if validated.is_expired(self.clock.now()) {
            return Err(TicketError::expired(validated_id));
        }
        let Some(proxying_service) = validated.service().cloned() else {
            return Err(TicketError::authorization_denied("ticket has no service binding"));
        };
        self.authorize_proxy(&proxying_service, callback_url).await?;

        let chain = self.validate_chain(&validated).await;
        state = state.next(ProxyEvent::ChainChecked(chain.is_ok()));
        tracing::debug!(?state, "proxy chain checked");
        let root = chain?;
        if root.kind() != TicketKind::TicketGrantingTicket {
            return Err(TicketError::proxy_chain_broken(root.id(), "chain does not end in a TGT"));
        }
        self.registry.claim_proxy_grant(validated_id, validated.kind()).await?;

        let definition = self.catalog.find(TicketKind::ProxyGrantingTicket)?;
        let pgt = Ticket::new(
            definition.generate_id(),
            validated.principal().clone(),
            TicketPayload::ProxyGrantingTicket { service: proxying_service },
            definition.expiration_policy(),
            Some(root.id().clone()),
            self.clock.now(),
        );

        let iou = match self.handler.handle(&pgt, callback_url).await {
            Ok(iou) => {
                state = state.next(ProxyEvent::HandlerSucceeded);
                iou
            },
            Err(e) => {
                state = state.next(ProxyEvent::HandlerFailed);
                tracing::info!(
                    audit.action = "grant_pgt",
                    audit.resource = %validated_id,
                    audit.result = "failure",
                    ?state,
                    error = %e,
                    "audit_event"
                );
                return Err(e);
            },
        };
        if state != ProxyState::Granted {
            return Err(TicketError::authorization_denied("proxy request rejected"));
        }

        // A collision here would mean the callback received an id we cannot
        // store; it is not retried with a new id.
        self.registry.add_ticket(&pgt).await.map_err(|e| match e {
            TicketError::DuplicateId { .. } => TicketError::GenerationExhausted {
                kind: TicketKind::ProxyGrantingTicket,
                attempts: 1,
            },
            other => other,
        })?;

        tracing::info!(
            audit.action = "grant_pgt",
            audit.resource = %pgt.id(),
            audit.result = "success",
            parent = %root.id(),
            ?state,
            "audit_event"
        );
        Ok(ProxyGrant { ticket: pgt, iou })
    }

    async fn authorize_proxy(
        &self,
        service: &Service,
        callback_url: Option<&str>,
    ) -> TicketResult<()> {
        let Some(registered) = self.services.find(service).await else {
            return Err(TicketError::authorization_denied(format!("{service} is not registered")));
        };
        if !registered.enabled || !registered.proxy_allowed {
            return Err(TicketError::authorization_denied(format!(
                "service {} may not proxy",
                registered.name
            )));
        }
        if let Some(url) = callback_url
            && !registered.accepts_callback(url)
        {
            return Err(TicketError::authorization_denied(format!(
                "callback {url} is not authorized for {}",
                registered.name
            )));
        }
        Ok(())
    }

    /// Issues a proxy ticket for `target` from a live PGT.
    ///
    /// # Errors
    ///
    /// The errors of [`TicketRegistry::get_ticket`] for the PGT,
    /// [`TicketError::ThrottledReplay`] if the PGT's policy throttles,
    /// [`TicketError::AuthorizationDenied`] if `target` is not registered.
    #[tracing::instrument(skip_all, fields(pgt_id = %pgt_id, target = %target))]
    pub async fn issue_proxy_ticket(
        &self,
        pgt_id: &TicketId,
        target: &Service,
    ) -> TicketResult<Ticket> {
        match self.services.find(target).await {
            Some(registered) if registered.enabled => {},
            _ => {
                return Err(TicketError::authorization_denied(format!(
                    "{target} is not registered or disabled"
                )));
            },
        }
        let pgt = self.registry.touch_ticket(pgt_id, TicketKind::ProxyGrantingTicket).await?;
        let Some(proxied_by) = pgt.service().cloned() else {
            return Err(TicketError::proxy_chain_broken(pgt_id, "PGT has no service binding"));
        };
        let now = self.clock.now();

        let definition = self.catalog.find(TicketKind::ProxyTicket)?;
        let principal = pgt.principal().clone();
        create_ticket(self.registry.as_ref(), definition, self.max_id_attempts, |id, policy| {
            let payload = TicketPayload::ProxyTicket {
                service: target.clone(),
                proxied_by: proxied_by.clone(),
            };
            Ticket::new(id, principal.clone(), payload, policy, Some(pgt_id.clone()), now)
        })
        .await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_state_machine_happy_path() {
        let state = ProxyState::Presented
            .next(ProxyEvent::ChainChecked(true))
            .next(ProxyEvent::HandlerSucceeded);
        assert_eq!(state, ProxyState::Granted);
    }

    #[test]
    fn test_state_machine_rejects_broken_chain() {
        let checked = ProxyState::Presented.next(ProxyEvent::ChainChecked(false));
        assert_eq!(checked, ProxyState::Checked { parent_valid: false });
        assert_eq!(checked.next(ProxyEvent::HandlerSucceeded), ProxyState::Rejected);
    }

    #[test]
    fn test_state_machine_rejects_out_of_order() {
        assert_eq!(ProxyState::Presented.next(ProxyEvent::HandlerSucceeded), ProxyState::Rejected);
        assert_eq!(
            ProxyState::Checked { parent_valid: true }.next(ProxyEvent::HandlerFailed),
            ProxyState::Rejected
        );
    }
}
