//! Token signing error types.

use std::sync::Arc;

use sso_tickets::{ConfigError, TicketKind};
use thiserror::Error;

/// Errors raised while loading signing keys or encoding and verifying
/// access-token JWTs.
///
/// # Non-exhaustive
///
/// This enum is marked `#[non_exhaustive]` so new variants can be added in
/// minor releases. Downstream match expressions must include a wildcard arm.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AuthnError {
    /// Malformed JWT that cannot be decoded.
    #[error("Invalid token format: {0}")]
    InvalidTokenFormat(String),

    /// Token has expired.
    #[error("Token expired")]
    TokenExpired,

    /// Signature verification failed.
    #[error("Invalid signature")]
    InvalidSignature,

    /// Issuer does not match the configured issuer.
    #[error("Invalid issuer: {0}")]
    InvalidIssuer(String),

    /// Audience does not match the relying service.
    #[error("Invalid audience: {0}")]
    InvalidAudience(String),

    /// Required claim or header is missing.
    #[error("Missing claim: {0}")]
    MissingClaim(String),

    /// Algorithm is not accepted.
    #[error("Unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),

    /// The token names a key other than the one currently held for its scope.
    #[error("Unknown signing key: {kid}")]
    UnknownKey {
        /// Key ID from the JWT header.
        kid: String,
    },

    /// Only access tokens can be rendered as JWTs.
    #[error("Cannot sign a {kind} as an access token")]
    NotAnAccessToken {
        /// Kind of the ticket that was presented.
        kind: TicketKind,
    },

    /// Key material could not be generated or parsed.
    #[error("Invalid key material: {0}")]
    InvalidKeyMaterial(String),

    /// The loader failed for a scope.
    ///
    /// Concurrent callers waiting on the same load all observe the same
    /// underlying error, hence the shared source.
    #[error("Signing key load failed for {scope}")]
    KeyLoad {
        /// Scope whose key could not be loaded.
        scope: String,
        /// The loader error.
        #[source]
        source: Arc<AuthnError>,
    },

    /// Invalid configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl AuthnError {
    /// Creates an [`InvalidKeyMaterial`](Self::InvalidKeyMaterial) error.
    #[must_use]
    pub fn invalid_key_material(message: impl Into<String>) -> Self {
        Self::InvalidKeyMaterial(message.into())
    }

    /// Creates a [`MissingClaim`](Self::MissingClaim) error.
    #[must_use]
    pub fn missing_claim(claim: impl Into<String>) -> Self {
        Self::MissingClaim(claim.into())
    }
}

impl From<jsonwebtoken::errors::Error> for AuthnError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        use jsonwebtoken::errors::ErrorKind;

        match err.kind() {
            ErrorKind::InvalidToken => {
                AuthnError::InvalidTokenFormat("Invalid JWT structure".into())
            },
            ErrorKind::InvalidSignature => AuthnError::InvalidSignature,
            ErrorKind::ExpiredSignature => AuthnError::TokenExpired,
            ErrorKind::InvalidAudience => {
                AuthnError::InvalidAudience("Audience validation failed".into())
            },
            ErrorKind::InvalidIssuer => {
                AuthnError::InvalidIssuer("Issuer validation failed".into())
            },
            ErrorKind::InvalidAlgorithm => {
                AuthnError::UnsupportedAlgorithm("Algorithm not supported".into())
            },
            ErrorKind::MissingRequiredClaim(claim) => AuthnError::MissingClaim(claim.clone()),
            ErrorKind::InvalidKeyFormat => {
                AuthnError::InvalidKeyMaterial(err.to_string())
            },
            _ => AuthnError::InvalidTokenFormat(format!("JWT error: {err}")),
        }
    }
}

/// Result type alias for token signing operations.
pub type Result<T> = std::result::Result<T, AuthnError>;

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use std::error::Error as _;

    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(AuthnError::TokenExpired.to_string(), "Token expired");
        assert_eq!(AuthnError::missing_claim("kid").to_string(), "Missing claim: kid");
        assert_eq!(
            AuthnError::UnknownKey { kid: "k1".into() }.to_string(),
            "Unknown signing key: k1"
        );
    }

    #[test]
    fn test_error_from_jsonwebtoken() {
        let jwt_err =
            jsonwebtoken::errors::Error::from(jsonwebtoken::errors::ErrorKind::InvalidSignature);
        assert!(matches!(AuthnError::from(jwt_err), AuthnError::InvalidSignature));

        let jwt_err =
            jsonwebtoken::errors::Error::from(jsonwebtoken::errors::ErrorKind::InvalidAlgorithm);
        assert!(matches!(AuthnError::from(jwt_err), AuthnError::UnsupportedAlgorithm(_)));
    }

    #[test]
    fn test_key_load_preserves_source() {
        let err = AuthnError::KeyLoad {
            scope: "issuer".into(),
            source: Arc::new(AuthnError::invalid_key_material("bad der")),
        };
        assert_eq!(err.to_string(), "Signing key load failed for issuer");
        let source = err.source().expect("source");
        assert_eq!(source.to_string(), "Invalid key material: bad der");
    }
}
