//! # SSO Token Signing
//!
//! Signing key management and JWT rendering for OAuth access tokens issued
//! by the ticket engine.
//!
//! This crate provides:
//! - **Signing key cache**: single-flight, expiry-after-write cache of Ed25519 keys, one
//!   issuer-wide key plus one key per relying service
//! - **Key loaders**: the [`SigningKeyLoader`] seam and a generating implementation
//! - **Access-token JWTs**: EdDSA encoding and verification of access-token tickets
//!
//! ## Features
//!
//! - Only EdDSA is accepted; any other algorithm in a presented token is rejected
//! - Concurrent misses for one key share a single loader invocation
//! - Key material is scrubbed from memory once converted
//!
//! ## Example
//!
//! ```
//! use std::{collections::BTreeSet, sync::Arc};
//!
//! use sso_authn::{AccessTokenSigner, GeneratingKeyLoader, SigningKeyCache, SigningKeyCacheConfig};
//! use sso_ticket_storage::MemoryBackend;
//! use sso_tickets::{
//!     Authentication, InMemoryServiceRegistry, Principal, RegisteredService, Service,
//!     SystemClock, TicketEngine, TicketsConfig,
//! };
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let clock = Arc::new(SystemClock);
//! let services = Arc::new(InMemoryServiceRegistry::new(vec![RegisteredService::exact(
//!     "app",
//!     "https://app.example.org",
//! )]));
//! let engine = TicketEngine::with_backend(
//!     Arc::new(MemoryBackend::new()),
//!     &TicketsConfig::default(),
//!     services,
//!     clock.clone(),
//! )?;
//!
//! let config = SigningKeyCacheConfig::builder().issuer("https://sso.example.org").build()?;
//! let keys = Arc::new(SigningKeyCache::new(
//!     config,
//!     Arc::new(GeneratingKeyLoader::new(clock.clone())),
//! ));
//! let signer = AccessTokenSigner::new(keys, clock);
//!
//! let authentication = Authentication::new(Principal::new("casuser"), chrono::Utc::now());
//! let tgt = engine.issue_ticket_granting_ticket(authentication).await?;
//! let app = Service::new("https://app.example.org");
//! let code = engine.issue_oauth_code(tgt.id(), &app, BTreeSet::from(["openid".into()])).await?;
//! let tokens = engine.exchange_code(code.id(), &app).await?;
//!
//! let jwt = signer.sign(&tokens.access_token).await?;
//! let claims = signer.verify(&jwt, &app).await?;
//! assert_eq!(claims.sub, "casuser");
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Signing key cache configuration.
pub mod config;
/// Token signing error types.
pub mod error;
/// Access-token JWTs.
pub mod jwt;
/// Single-flight signing key cache.
pub mod signing_key_cache;
/// Shared test utilities.
#[cfg(any(test, feature = "testutil"))]
#[allow(clippy::expect_used, clippy::panic)]
pub mod testutil;

pub use config::{
    DEFAULT_GLOBAL_KEY_TTL, DEFAULT_SERVICE_KEY_CAPACITY, DEFAULT_SERVICE_KEY_TTL,
    SigningKeyCacheConfig,
};
pub use error::{AuthnError, Result};
pub use jwt::{AccessTokenClaims, AccessTokenSigner};
pub use signing_key_cache::{
    GeneratingKeyLoader, KeyScope, SigningKeyCache, SigningKeyLoader, TokenSigningKey,
};
pub use sso_tickets::ConfigError;
