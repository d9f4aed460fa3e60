//! Access tokens rendered as EdDSA-signed JWTs.
//!
//! An [`AccessTokenSigner`] turns an OAuth access-token [`Ticket`] into a
//! compact JWT signed with a key from the [`SigningKeyCache`], and verifies
//! such JWTs back against the cached key's public component.
//!
//! # Claims
//!
//! ```json
//! {
//!   "iss": "https://sso.example.org",
//!   "sub": "casuser",
//!   "aud": "https://app.example.org",
//!   "exp": 1735696800,
//!   "iat": 1735689600,
//!   "jti": "AT-1-...",
//!   "scope": "openid profile"
//! }
//! ```
//!
//! Expiry is checked against the engine's [`Clock`], not the wall clock, so
//! it agrees with the ticket's own expiration policy.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use jsonwebtoken::{Algorithm, Header, Validation, decode, decode_header, encode};
use serde::{Deserialize, Serialize};
use sso_tickets::{Clock, Service, Ticket, TicketPayload};

use crate::{
    error::{AuthnError, Result},
    signing_key_cache::SigningKeyCache,
};

/// The only algorithm accepted on verification.
pub const ACCEPTED_ALGORITHM: Algorithm = Algorithm::EdDSA;

/// Claims of an access-token JWT.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessTokenClaims {
    /// Issuer.
    pub iss: String,
    /// Principal identifier.
    pub sub: String,
    /// The relying service the token was issued to.
    pub aud: String,
    /// Expiration time (seconds since epoch).
    pub exp: u64,
    /// Issued at (seconds since epoch).
    pub iat: u64,
    /// Access-token ticket ID.
    pub jti: String,
    /// Space-separated granted scopes.
    pub scope: String,
}

impl AccessTokenClaims {
    /// Splits the `scope` claim into individual scopes.
    #[must_use]
    pub fn scopes(&self) -> Vec<&str> {
        self.scope.split_whitespace().collect()
    }
}

/// Signs and verifies access-token JWTs.
#[derive(Debug, Clone)]
pub struct AccessTokenSigner {
    keys: Arc<SigningKeyCache>,
    clock: Arc<dyn Clock>,
}

impl AccessTokenSigner {
    /// Creates a signer drawing keys from `keys` and time from `clock`.
    #[must_use]
    pub fn new(keys: Arc<SigningKeyCache>, clock: Arc<dyn Clock>) -> Self {
        Self { keys, clock }
    }

    /// Returns the key cache.
    #[must_use]
    pub fn keys(&self) -> &Arc<SigningKeyCache> {
        &self.keys
    }

    /// Renders an access-token ticket as a signed JWT.
    ///
    /// # Errors
    ///
    /// - [`AuthnError::NotAnAccessToken`] for any other ticket kind
    /// - [`AuthnError::TokenExpired`] if the ticket has already expired
    /// - [`AuthnError::MissingClaim`] if the ticket never expires (`exp` is mandatory)
    /// - [`AuthnError::KeyLoad`] if no signing key can be loaded
    #[tracing::instrument(skip_all, fields(ticket_id = %ticket.id()))]
    pub async fn sign(&self, ticket: &Ticket) -> Result<String> {
        let TicketPayload::AccessToken { service, scopes } = ticket.payload() else {
            return Err(AuthnError::NotAnAccessToken { kind: ticket.kind() });
        };

        if ticket.is_expired(self.clock.now()) {
            return Err(AuthnError::TokenExpired);
        }
        let expires_at = ticket
            .expiration_policy()
            .deadline(ticket.creation_time(), ticket.last_used_time())
            .ok_or_else(|| AuthnError::missing_claim("exp"))?;

        let key = self.keys.key(&self.keys.scope_for(service)).await?;
        let claims = AccessTokenClaims {
            iss: self.keys.config().issuer().to_owned(),
            sub: ticket.principal().id().to_owned(),
            aud: service.as_str().to_owned(),
            exp: unix_seconds(expires_at),
            iat: unix_seconds(ticket.creation_time()),
            jti: ticket.id().to_string(),
            scope: scopes.iter().map(String::as_str).collect::<Vec<_>>().join(" "),
        };

        let mut header = Header::new(ACCEPTED_ALGORITHM);
        header.kid = Some(key.kid().to_owned());
        let token = encode(&header, &claims, key.encoding_key())?;

        tracing::debug!(kid = key.kid(), "signed access token");
        Ok(token)
    }

    /// Verifies a JWT presented to `audience` and returns its claims.
    ///
    /// The header must name the EdDSA algorithm and the key currently cached
    /// for the audience's scope; a rotated key makes older tokens
    /// unverifiable.
    ///
    /// # Errors
    ///
    /// - [`AuthnError::UnsupportedAlgorithm`] for any algorithm other than EdDSA
    /// - [`AuthnError::MissingClaim`] if the `kid` header is absent
    /// - [`AuthnError::UnknownKey`] if `kid` is not the current cached key
    /// - [`AuthnError::InvalidSignature`], [`AuthnError::InvalidIssuer`],
    ///   [`AuthnError::InvalidAudience`] from claim validation
    /// - [`AuthnError::TokenExpired`] once the clock is past `exp`
    #[tracing::instrument(skip_all, fields(audience = %audience))]
    pub async fn verify(&self, token: &str, audience: &Service) -> Result<AccessTokenClaims> {
        let header = decode_header(token)?;
        if header.alg != ACCEPTED_ALGORITHM {
            return Err(AuthnError::UnsupportedAlgorithm(format!(
                "{:?} is not accepted, only EdDSA is supported",
                header.alg
            )));
        }
        let kid = header.kid.ok_or_else(|| AuthnError::missing_claim("kid"))?;

        // Verification never mints a key: an uncached scope has no valid tokens.
        let key = match self.keys.cached_key(&self.keys.scope_for(audience)).await {
            Some(key) if key.kid() == kid => key,
            _ => return Err(AuthnError::UnknownKey { kid }),
        };

        let mut validation = Validation::new(ACCEPTED_ALGORITHM);
        validation.validate_exp = false;
        validation.set_required_spec_claims(&["exp", "iss", "aud", "sub"]);
        validation.set_issuer(&[self.keys.config().issuer()]);
        validation.set_audience(&[audience.as_str()]);

        let claims = decode::<AccessTokenClaims>(token, key.decoding_key(), &validation)?.claims;
        if unix_seconds(self.clock.now()) > claims.exp {
            return Err(AuthnError::TokenExpired);
        }
        Ok(claims)
    }
}

fn unix_seconds(at: DateTime<Utc>) -> u64 {
    u64::try_from(at.timestamp()).unwrap_or(0)
}
