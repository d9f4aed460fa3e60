//! Shared test utilities for the ticket engine.
//!
//! Feature-gated behind `testutil`. Downstream crates enable it in
//! `[dev-dependencies]`:
//!
//! ```toml
//! [dev-dependencies]
//! sso-tickets = { workspace = true, features = ["testutil"] }
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use sso_ticket_storage::{MemoryBackend, StorageBackend};

pub use crate::clock::FixedClock;
use crate::{
    catalog::TicketCatalog,
    clock::Clock,
    config::TicketsConfig,
    engine::TicketEngine,
    error::{TicketError, TicketResult},
    proxy::ProxyCallbackClient,
    registry::DefaultTicketRegistry,
    services::{InMemoryServiceRegistry, RegisteredService},
    ticket::{Authentication, Principal, Service, TicketId},
};

/// Service that may validate tickets but not proxy.
pub const APP_SERVICE: &str = "https://app.example.org";

/// Service allowed to obtain proxy-granting tickets.
pub const PROXY_SERVICE: &str = "https://proxy.example.org";

/// Callback URL registered for [`PROXY_SERVICE`].
pub const PROXY_CALLBACK: &str = "https://proxy.example.org/pgt-callback";

/// Service reached through a proxy.
pub const BACKEND_SERVICE: &str = "https://backend.example.org";

/// Fixed starting instant for test clocks.
#[must_use]
pub fn epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).single().unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

/// A principal with a couple of attributes.
#[must_use]
pub fn casuser() -> Principal {
    Principal::new("casuser").with_attribute("mail", "casuser@example.org")
}

/// A password authentication of [`casuser`] at `at`.
#[must_use]
pub fn password_authentication(at: DateTime<Utc>) -> Authentication {
    Authentication::new(casuser(), at).with_method("password")
}

/// The standard service registry: [`APP_SERVICE`], [`PROXY_SERVICE`]
/// (proxy-enabled) and [`BACKEND_SERVICE`].
#[must_use]
pub fn test_services() -> InMemoryServiceRegistry {
    InMemoryServiceRegistry::new(vec![
        RegisteredService::exact("app", APP_SERVICE),
        RegisteredService::exact("proxy", PROXY_SERVICE).with_proxy(PROXY_CALLBACK),
        RegisteredService::exact("backend", BACKEND_SERVICE),
    ])
}

/// A proxy callback delivery observed by [`RecordingCallbackClient`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Callback URL.
    pub url: String,
    /// Delivered proxy-granting ticket.
    pub pgt_id: TicketId,
    /// Delivered IOU.
    pub pgt_iou: TicketId,
}

/// [`ProxyCallbackClient`] that records deliveries and can be told to fail.
#[derive(Debug, Default)]
pub struct RecordingCallbackClient {
    deliveries: Mutex<Vec<Delivery>>,
    failing: Mutex<bool>,
}

impl RecordingCallbackClient {
    /// Makes subsequent deliveries fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock() = failing;
    }

    /// Returns every delivery attempted so far.
    #[must_use]
    pub fn deliveries(&self) -> Vec<Delivery> {
        self.deliveries.lock().clone()
    }
}

#[async_trait]
impl ProxyCallbackClient for RecordingCallbackClient {
    async fn deliver(
        &self,
        callback_url: &str,
        pgt_id: &TicketId,
        pgt_iou: &TicketId,
    ) -> TicketResult<()> {
        self.deliveries.lock().push(Delivery {
            url: callback_url.to_owned(),
            pgt_id: pgt_id.clone(),
            pgt_iou: pgt_iou.clone(),
        });
        if *self.failing.lock() {
            return Err(TicketError::proxy_callback_failed(callback_url, "callback answered 500"));
        }
        Ok(())
    }
}

/// An engine wired to a [`FixedClock`] and a recording callback client.
#[derive(Debug)]
pub struct TestHarness<B = MemoryBackend> {
    /// The engine under test.
    pub engine: TicketEngine,
    /// Clock shared by engine and registry.
    pub clock: FixedClock,
    /// Backend beneath the registry.
    pub backend: Arc<B>,
    /// Records proxy callback deliveries.
    pub callbacks: Arc<RecordingCallbackClient>,
    /// The registered services.
    pub services: Arc<InMemoryServiceRegistry>,
}

impl TestHarness {
    /// Harness over a fresh [`MemoryBackend`] with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(TicketsConfig::default())
    }

    /// Harness over a fresh [`MemoryBackend`].
    #[must_use]
    pub fn with_config(config: TicketsConfig) -> Self {
        Self::on_backend(Arc::new(MemoryBackend::new()), config)
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: StorageBackend + 'static> TestHarness<B> {
    /// Harness over an existing backend.
    ///
    /// # Panics
    ///
    /// Panics if `config` is invalid.
    #[must_use]
    pub fn on_backend(backend: Arc<B>, config: TicketsConfig) -> Self {
        let clock = FixedClock::new(epoch());
        let shared_clock: Arc<FixedClock> = Arc::new(clock.clone());
        let catalog =
            Arc::new(TicketCatalog::from_config(&config).expect("valid ticket configuration"));
        let registry = DefaultTicketRegistry::new(
            Arc::clone(&backend),
            Arc::clone(&catalog),
            shared_clock.clone(),
        )
        .with_request_timeout(config.request_timeout())
        .with_expired_retention(config.expired_ticket_retention());
        let callbacks = Arc::new(RecordingCallbackClient::default());
        let services = Arc::new(test_services());

        let engine = TicketEngine::builder()
            .registry(Arc::new(registry))
            .catalog(catalog)
            .services(services.clone())
            .clock(shared_clock)
            .config(config)
            .callback_client(callbacks.clone())
            .build()
            .expect("valid engine configuration");

        Self { engine, clock, backend, callbacks, services }
    }

    /// Logs [`casuser`] in and returns the TGT identifier.
    ///
    /// # Panics
    ///
    /// Panics if the TGT cannot be issued.
    pub async fn login(&self) -> TicketId {
        self.engine
            .issue_ticket_granting_ticket(password_authentication(self.clock.now()))
            .await
            .expect("issue TGT")
            .id()
            .clone()
    }

    /// Issues a service ticket for `service` from `tgt`.
    ///
    /// # Panics
    ///
    /// Panics if the ticket cannot be issued.
    pub async fn service_ticket(&self, tgt: &TicketId, service: &str) -> TicketId {
        self.engine
            .issue_service_ticket(tgt, &Service::new(service))
            .await
            .expect("issue ST")
            .id()
            .clone()
    }
}
