//! The ticket engine facade.
//!
//! [`TicketEngine`] is what protocol controllers call. It is assembled
//! explicitly at startup from a storage backend, a [`TicketsConfig`], a
//! [`ServiceRegistry`] and a [`Clock`]; nothing is wired at runtime.
//!
//! ```
//! use std::sync::Arc;
//!
//! use chrono::Utc;
//! use sso_ticket_storage::MemoryBackend;
//! use sso_tickets::{
//!     Authentication, InMemoryServiceRegistry, Principal, RegisteredService, Service,
//!     SystemClock, TicketEngine, TicketError, TicketsConfig, ValidationSpecification,
//! };
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let services = Arc::new(InMemoryServiceRegistry::new(vec![RegisteredService::exact(
//!     "app",
//!     "https://app.example.org",
//! )]));
//! let engine = TicketEngine::with_backend(
//!     Arc::new(MemoryBackend::new()),
//!     &TicketsConfig::default(),
//!     services,
//!     Arc::new(SystemClock),
//! )?;
//!
//! let tgt = engine
//!     .issue_ticket_granting_ticket(Authentication::new(Principal::new("casuser"), Utc::now()))
//!     .await?;
//! let app = Service::new("https://app.example.org");
//! let st = engine.issue_service_ticket(tgt.id(), &app).await?;
//!
//! let assertion =
//!     engine.validate_service_ticket(st.id(), &app, ValidationSpecification::service()).await?;
//! assert_eq!(assertion.principal.id(), "casuser");
//!
//! let replay = engine.validate_service_ticket(st.id(), &app, ValidationSpecification::service());
//! assert!(matches!(replay.await, Err(TicketError::AlreadyConsumed { .. })));
//! # Ok(())
//! # }
//! ```

use std::{collections::BTreeSet, sync::Arc};

use sso_ticket_storage::{ConfigError, StorageBackend};

use crate::{
    authorizer::{AuthorizerPipeline, ValidationRequest, ValidationSpecification},
    catalog::TicketCatalog,
    clock::Clock,
    config::{ProxyMode, SweeperConfig, TicketsConfig},
    error::{TicketError, TicketResult},
    id::DefaultTicketIdGenerator,
    oauth::{OAuthTokenFactory, TokenResponse},
    proxy::{
        CallbackProxyHandler, HttpProxyCallbackClient, LegacyProxyHandler, ProxyCallbackClient,
        ProxyChainEngine, ProxyGrant, ProxyHandler,
    },
    registry::{DefaultTicketRegistry, TicketRegistry, create_ticket},
    services::ServiceRegistry,
    sweeper::TicketSweeper,
    ticket::{Authentication, Principal, Service, Ticket, TicketId, TicketKind, TicketPayload},
};

/// Result of a successful service or proxy ticket validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assertion {
    /// The validated ticket.
    pub ticket_id: TicketId,
    /// The authenticated principal.
    pub principal: Principal,
    /// The authentication of the originating session.
    pub authentication: Option<Authentication>,
    /// The service the ticket was validated for.
    pub service: Service,
    /// Whether the ticket came from a fresh primary login.
    pub from_new_login: bool,
    /// Proxying services, closest first; empty for service tickets.
    pub proxies: Vec<Service>,
}

/// Ticket lifecycle engine.
#[derive(Debug)]
pub struct TicketEngine {
    registry: Arc<dyn TicketRegistry>,
    catalog: Arc<TicketCatalog>,
    services: Arc<dyn ServiceRegistry>,
    pipeline: AuthorizerPipeline,
    proxy: ProxyChainEngine,
    oauth: OAuthTokenFactory,
    clock: Arc<dyn Clock>,
    max_id_attempts: u32,
    sweeper_config: SweeperConfig,
}

#[bon::bon]
impl TicketEngine {
    /// Assembles an engine from explicit parts.
    ///
    /// The proxy handler defaults to the one selected by
    /// `config.proxy.mode`; callback mode then also needs a
    /// `callback_client` (an HTTP client is built when none is given).
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the configuration is invalid.
    #[builder]
    pub fn new(
        registry: Arc<dyn TicketRegistry>,
        catalog: Arc<TicketCatalog>,
        services: Arc<dyn ServiceRegistry>,
        clock: Arc<dyn Clock>,
        #[builder(default)] config: TicketsConfig,
        #[builder(default = AuthorizerPipeline::standard())] pipeline: AuthorizerPipeline,
        proxy_handler: Option<Arc<dyn ProxyHandler>>,
        callback_client: Option<Arc<dyn ProxyCallbackClient>>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let proxy_handler: Arc<dyn ProxyHandler> = match (proxy_handler, config.proxy().mode) {
            (Some(handler), _) => handler,
            (None, ProxyMode::Legacy) => Arc::new(LegacyProxyHandler),
            (None, ProxyMode::Callback) => {
                let client: Arc<dyn ProxyCallbackClient> = match callback_client {
                    Some(client) => client,
                    None => {
                        Arc::new(HttpProxyCallbackClient::new(config.proxy().callback_timeout)?)
                    },
                };
                let iou_generator = Arc::new(DefaultTicketIdGenerator::new(
                    config.id_random_bytes(),
                    config.id_suffix().map(str::to_owned),
                )?);
                Arc::new(CallbackProxyHandler::new(
                    client,
                    iou_generator,
                    config.proxy().require_https,
                ))
            },
        };

        let proxy = ProxyChainEngine::builder()
            .registry(Arc::clone(&registry))
            .catalog(Arc::clone(&catalog))
            .services(Arc::clone(&services))
            .handler(proxy_handler)
            .clock(Arc::clone(&clock))
            .config(config.proxy().clone())
            .max_id_attempts(config.max_id_attempts())
            .build();
        let oauth = OAuthTokenFactory::builder()
            .registry(Arc::clone(&registry))
            .catalog(Arc::clone(&catalog))
            .clock(Arc::clone(&clock))
            .config(config.oauth().clone())
            .max_id_attempts(config.max_id_attempts())
            .build();

        Ok(Self {
            registry,
            catalog,
            services,
            pipeline,
            proxy,
            oauth,
            clock,
            max_id_attempts: config.max_id_attempts(),
            sweeper_config: config.sweeper().clone(),
        })
    }

    /// Assembles the standard engine over a storage backend: catalog and
    /// registry from `config`, the standard authorizer pipeline, and the
    /// proxy handler selected by `config.proxy.mode`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the configuration is invalid.
    pub fn with_backend<B: StorageBackend + 'static>(
        backend: Arc<B>,
        config: &TicketsConfig,
        services: Arc<dyn ServiceRegistry>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        let catalog = Arc::new(TicketCatalog::from_config(config)?);
        let registry = DefaultTicketRegistry::new(backend, Arc::clone(&catalog), Arc::clone(&clock))
            .with_request_timeout(config.request_timeout())
            .with_expired_retention(config.expired_ticket_retention());

        Self::builder()
            .registry(Arc::new(registry))
            .catalog(catalog)
            .services(services)
            .clock(clock)
            .config(config.clone())
            .build()
    }

    /// Returns the registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<dyn TicketRegistry> {
        &self.registry
    }

    /// Returns the catalog.
    #[must_use]
    pub fn catalog(&self) -> &Arc<TicketCatalog> {
        &self.catalog
    }

    /// Returns the proxy chain engine.
    #[must_use]
    pub fn proxy(&self) -> &ProxyChainEngine {
        &self.proxy
    }

    /// Creates a TGT after a successful primary authentication.
    ///
    /// # Errors
    ///
    /// [`TicketError::GenerationExhausted`] if no unique ID could be
    /// generated, or a registry error.
    #[tracing::instrument(skip_all, fields(principal = %authentication.principal.id()))]
    pub async fn issue_ticket_granting_ticket(
        &self,
        authentication: Authentication,
    ) -> TicketResult<Ticket> {
        let definition = self.catalog.find(TicketKind::TicketGrantingTicket)?;
        let now = self.clock.now();
        create_ticket(self.registry.as_ref(), definition, self.max_id_attempts, |id, policy| {
            let payload = TicketPayload::TicketGrantingTicket {
                authenticated_at: authentication.authenticated_at,
                methods: authentication.methods.clone(),
            };
            Ticket::new(id, authentication.principal.clone(), payload, policy, None, now)
        })
        .await
    }

    /// Issues a service ticket for `service` from a live TGT.
    ///
    /// # Errors
    ///
    /// - [`TicketError::NotFound`] / [`TicketError::Expired`] for the TGT
    /// - [`TicketError::ThrottledReplay`] if the TGT is used too quickly
    /// - [`TicketError::AuthorizationDenied`] if `service` is not registered
    ///   or disabled
    /// - [`TicketError::GenerationExhausted`] if no unique ID was found
    #[tracing::instrument(skip_all, fields(tgt_id = %tgt_id, service = %service))]
    pub async fn issue_service_ticket(
        &self,
        tgt_id: &TicketId,
        service: &Service,
    ) -> TicketResult<Ticket> {
        match self.services.find(service).await {
            Some(registered) if registered.enabled => {},
            _ => {
                return Err(TicketError::authorization_denied(format!(
                    "{service} is not registered or disabled"
                )));
            },
        }

        let tgt = self.registry.touch_ticket(tgt_id, TicketKind::TicketGrantingTicket).await?;
        let now = self.clock.now();
        let from_new_login = tgt.usage_count() == 1;

        let definition = self.catalog.find(TicketKind::ServiceTicket)?;
        let principal = tgt.principal().clone();
        create_ticket(self.registry.as_ref(), definition, self.max_id_attempts, |id, policy| {
            let payload = TicketPayload::ServiceTicket { service: service.clone(), from_new_login };
            Ticket::new(id, principal.clone(), payload, policy, Some(tgt_id.clone()), now)
        })
        .await
    }

    /// Validates (and consumes) a service or proxy ticket.
    ///
    /// The ticket is consumed before the authorizer pipeline runs, so a
    /// ticket presented for the wrong service is burnt as well.
    ///
    /// # Errors
    ///
    /// - [`TicketError::NotFound`] / [`TicketError::Expired`] /
    ///   [`TicketError::TypeMismatch`] per the registry
    /// - [`TicketError::AlreadyConsumed`] on replay
    /// - [`TicketError::ProxyChainBroken`] if a proxy ticket's ancestor is
    ///   gone or expired
    /// - [`TicketError::AuthorizationDenied`] from the authorizer pipeline
    #[tracing::instrument(skip_all, fields(ticket_id = %ticket_id, service = %service))]
    pub async fn validate_service_ticket(
        &self,
        ticket_id: &TicketId,
        service: &Service,
        specification: ValidationSpecification,
    ) -> TicketResult<Assertion> {
        let expected = match self.catalog.kind_for_id(ticket_id) {
            Some(TicketKind::ProxyTicket) => TicketKind::ProxyTicket,
            _ => TicketKind::ServiceTicket,
        };

        if expected == TicketKind::ProxyTicket
            && let Some(presented) = self.registry.find_ticket(ticket_id).await?
            && presented.kind() == TicketKind::ProxyTicket
        {
            self.proxy.validate_chain(&presented).await?;
        }

        let ticket = self.registry.consume_ticket(ticket_id, expected).await?;
        let root = self.proxy.validate_chain(&ticket).await?;
        let authentication = root.authentication();
        let registered = self.services.find(service).await;

        let request = ValidationRequest {
            ticket: &ticket,
            service,
            authentication: authentication.as_ref(),
            registered_service: registered.as_ref(),
            specification,
            now: self.clock.now(),
        };
        self.pipeline.authorize(&request).await?;

        let (from_new_login, proxies) = match ticket.payload() {
            TicketPayload::ServiceTicket { from_new_login, .. } => (*from_new_login, Vec::new()),
            TicketPayload::ProxyTicket { proxied_by, .. } => (false, vec![proxied_by.clone()]),
            _ => (false, Vec::new()),
        };
        Ok(Assertion {
            ticket_id: ticket_id.clone(),
            principal: ticket.principal().clone(),
            authentication,
            service: service.clone(),
            from_new_login,
            proxies,
        })
    }

    /// Grants a PGT to the service that validated `validated_id`.
    ///
    /// # Errors
    ///
    /// See [`ProxyChainEngine::grant_proxy_granting_ticket`].
    pub async fn issue_proxy_granting_ticket(
        &self,
        validated_id: &TicketId,
        callback_url: Option<&str>,
    ) -> TicketResult<ProxyGrant> {
        self.proxy.grant_proxy_granting_ticket(validated_id, callback_url).await
    }

    /// Issues a proxy ticket for `service` from a PGT.
    ///
    /// # Errors
    ///
    /// See [`ProxyChainEngine::issue_proxy_ticket`].
    pub async fn issue_proxy_ticket(
        &self,
        pgt_id: &TicketId,
        service: &Service,
    ) -> TicketResult<Ticket> {
        self.proxy.issue_proxy_ticket(pgt_id, service).await
    }

    /// Mints an OAuth authorization code.
    ///
    /// # Errors
    ///
    /// See [`OAuthTokenFactory::issue_code`].
    pub async fn issue_oauth_code(
        &self,
        tgt_id: &TicketId,
        service: &Service,
        scopes: BTreeSet<String>,
    ) -> TicketResult<Ticket> {
        self.oauth.issue_code(tgt_id, service, scopes).await
    }

    /// Exchanges an authorization code for tokens.
    ///
    /// # Errors
    ///
    /// See [`OAuthTokenFactory::exchange_code`].
    pub async fn exchange_code(
        &self,
        code_id: &TicketId,
        service: &Service,
    ) -> TicketResult<TokenResponse> {
        self.oauth.exchange_code(code_id, service).await
    }

    /// Issues a new access token from a refresh token.
    ///
    /// # Errors
    ///
    /// See [`OAuthTokenFactory::refresh_access_token`].
    pub async fn refresh_access_token(
        &self,
        refresh_id: &TicketId,
        service: &Service,
    ) -> TicketResult<TokenResponse> {
        self.oauth.refresh_access_token(refresh_id, service).await
    }

    /// Deletes a ticket and all of its descendants. Returns whether the
    /// ticket existed.
    ///
    /// # Errors
    ///
    /// Registry errors; descendants that cannot be removed are logged only.
    pub async fn revoke(&self, ticket_id: &TicketId) -> TicketResult<bool> {
        self.registry.delete_ticket(ticket_id).await
    }

    /// Revokes every TGT of a principal (logout everywhere). Returns the
    /// number of sessions removed.
    ///
    /// # Errors
    ///
    /// Returns the first registry error; sessions revoked before it stay
    /// revoked.
    #[tracing::instrument(skip_all, fields(principal = %principal_id))]
    pub async fn destroy_tickets_for_principal(&self, principal_id: &str) -> TicketResult<usize> {
        let owner = principal_id.to_owned();
        let sessions: Vec<Ticket> = self
            .registry
            .get_tickets(Box::new(move |ticket| {
                ticket.kind() == TicketKind::TicketGrantingTicket
                    && ticket.principal().id() == owner
            }))
            .await?
            .collect();

        let mut removed = 0;
        for session in &sessions {
            if self.registry.delete_ticket(session.id()).await? {
                removed += 1;
            }
        }
        tracing::info!(
            audit.action = "destroy_principal_tickets",
            audit.resource = %principal_id,
            audit.result = "success",
            sessions = removed,
            "audit_event"
        );
        Ok(removed)
    }

    /// Creates a sweeper over this engine's registry.
    #[must_use]
    pub fn sweeper(&self) -> TicketSweeper {
        TicketSweeper::new(Arc::clone(&self.registry), Arc::clone(&self.clock))
    }

    /// Starts the background sweeper if enabled in configuration.
    ///
    /// # Panics
    ///
    /// Must be called within a Tokio runtime context.
    #[must_use]
    pub fn spawn_sweeper(&self) -> Option<Arc<TicketSweeper>> {
        self.sweeper_config
            .enabled
            .then(|| Arc::new(self.sweeper()).start(self.sweeper_config.interval))
    }
}
