//! Ticket lifecycle engine for single sign-on.
//!
//! Tickets are the server's tokens of trust: a ticket-granting ticket (TGT)
//! represents an authenticated session, service tickets (ST) prove that
//! session to one relying party exactly once, and proxy-granting and proxy
//! tickets (PGT, PT) let a service act on the user's behalf. OAuth codes,
//! access tokens and refresh tokens are tickets too.
//!
//! | Module | Responsibility |
//! |--------|----------------|
//! | [`ticket`] | Ticket record, kinds and payloads |
//! | [`expiration`] | Expiration policies |
//! | [`id`] | Identifier generation |
//! | [`catalog`] | Per-kind definitions: prefix, policy, storage timeout |
//! | [`registry`] | Persistence, at-most-once consumption, cascading delete |
//! | [`authorizer`] | Ordered validation checks |
//! | [`proxy`] | Proxy chains and callback delivery |
//! | [`oauth`] | Authorization codes, access and refresh tokens |
//! | [`sweeper`] | Background removal of expired tickets |
//! | [`engine`] | The facade protocol controllers call |
//!
//! # Guarantees
//!
//! - A single-use ticket is consumed at most once, across every node that
//!   shares the storage backend.
//! - A ticket whose parent chain contains a missing or expired ticket is
//!   invalid.
//! - Deleting a ticket deletes its descendants in one atomic step; if that
//!   step fails the root still goes, and stragglers are already invalid.
//! - Every call either completes within its deadline or leaves no state
//!   behind.
//!
//! # Feature Flags
//!
//! - **`testutil`**: Enables [`testutil`] fixtures for integration tests.
//! - **`failpoints`**: Activates `fail` fail points in registry code paths.

#![deny(unsafe_code)]

pub mod authorizer;
pub mod catalog;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod expiration;
pub mod id;
pub mod oauth;
pub mod proxy;
pub mod registry;
pub mod services;
pub mod sweeper;
#[cfg(any(test, feature = "testutil"))]
#[allow(clippy::expect_used, clippy::panic)]
pub mod testutil;
pub mod ticket;

pub use authorizer::{
    AuthorizationDecision, AuthorizerPipeline, ServiceTicketValidationAuthorizer,
    ValidationRequest, ValidationSpecification,
};
pub use catalog::{TicketCatalog, TicketDefinition};
pub use clock::{Clock, FixedClock, SystemClock};
pub use config::{
    OAuthConfig, ProxyConfig, ProxyMode, SweeperConfig, TicketTypeConfig, TicketsConfig,
};
pub use engine::{Assertion, TicketEngine};
pub use error::{TicketError, TicketResult};
pub use expiration::ExpirationPolicy;
pub use id::{DefaultTicketIdGenerator, TicketIdGenerator};
pub use oauth::{OAuthTokenFactory, TokenResponse};
pub use proxy::{
    CallbackProxyHandler, HttpProxyCallbackClient, LegacyProxyHandler, ProxyCallbackClient,
    ProxyChainEngine, ProxyGrant, ProxyHandler,
};
pub use registry::{DefaultTicketRegistry, TicketIter, TicketPredicate, TicketRegistry};
pub use services::{InMemoryServiceRegistry, RegisteredService, ServiceMatcher, ServiceRegistry};
pub use sso_ticket_storage::ConfigError;
pub use sweeper::{SweepReport, TicketSweeper};
pub use ticket::{Authentication, Principal, Service, Ticket, TicketId, TicketKind, TicketPayload};
