//! Signing key cache for access-token issuance.
//!
//! This module provides [`SigningKeyCache`], which holds Ed25519 signing keys
//! for two scopes:
//!
//! - **Issuer**: one process-wide key, cached with capacity 1
//! - **Service**: one key per relying service, bounded by capacity and TTL
//!
//! Both caches expire entries a fixed time after they were written. On a miss
//! the configured [`SigningKeyLoader`] produces a new key.
//!
//! # Single-flight loading
//!
//! Concurrent misses for the same scope share one loader invocation. Each
//! scope with a load in progress has an entry in an in-flight table; the first
//! caller runs the loader and every other caller waits on the same entry, so
//! all waiters receive the same key (or the same error). The entry is removed
//! when the load finishes. A failed load is not cached, so the next request
//! retries.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use sso_authn::{GeneratingKeyLoader, KeyScope, SigningKeyCache, SigningKeyCacheConfig};
//! use sso_tickets::SystemClock;
//!
//! # #[tokio::main]
//! # async fn main() -> sso_authn::Result<()> {
//! let config = SigningKeyCacheConfig::builder().issuer("https://sso.example.org").build()?;
//! let loader = Arc::new(GeneratingKeyLoader::new(Arc::new(SystemClock)));
//! let cache = SigningKeyCache::new(config, loader);
//!
//! let key = cache.key(&KeyScope::Issuer).await?;
//! assert_eq!(key.scope(), &KeyScope::Issuer);
//! # Ok(())
//! # }
//! ```

use std::{
    collections::HashMap,
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, Utc};
use ed25519_dalek::{PUBLIC_KEY_LENGTH, SECRET_KEY_LENGTH, SigningKey};
use fail::fail_point;
use jsonwebtoken::{DecodingKey, EncodingKey};
use moka::future::Cache;
use parking_lot::Mutex;
use rand_core::{OsRng, RngCore};
use sso_tickets::{Clock, Service};
use tokio::sync::OnceCell;
use zeroize::Zeroizing;

use crate::{
    config::SigningKeyCacheConfig,
    error::{AuthnError, Result},
};

/// Result of one load, shared by every caller that joined it.
type LoadOutcome = std::result::Result<Arc<TokenSigningKey>, Arc<AuthnError>>;

/// One in-flight load.
type Flight = OnceCell<LoadOutcome>;

/// Number of random bytes in a generated key ID.
const KID_RANDOM_BYTES: usize = 12;

/// PKCS#8 v1 prefix for an Ed25519 private key (RFC 8410).
const ED25519_PKCS8_PREFIX: [u8; 16] = [
    0x30, 0x2e, // SEQUENCE, 46 bytes
    0x02, 0x01, 0x00, // INTEGER version 0
    0x30, 0x05, // SEQUENCE, 5 bytes (algorithm identifier)
    0x06, 0x03, 0x2b, 0x65, 0x70, // OID 1.3.101.112 (Ed25519)
    0x04, 0x22, // OCTET STRING, 34 bytes
    0x04, 0x20, // OCTET STRING, 32 bytes (the seed)
];

/// What a signing key is used for.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum KeyScope {
    /// The issuer-wide key.
    Issuer,
    /// A key dedicated to one relying service, by service identifier.
    Service(String),
}

impl KeyScope {
    /// Returns the scope of the key dedicated to `service`.
    #[must_use]
    pub fn service(service: &Service) -> Self {
        Self::Service(service.as_str().to_owned())
    }
}

impl fmt::Display for KeyScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Issuer => f.write_str("issuer"),
            Self::Service(id) => write!(f, "service:{id}"),
        }
    }
}

/// An Ed25519 key pair ready for JWT signing and verification.
///
/// The private half is only held as a jsonwebtoken [`EncodingKey`]; the raw
/// seed is scrubbed once the key is built.
#[derive(Clone)]
pub struct TokenSigningKey {
    kid: String,
    scope: KeyScope,
    created_at: DateTime<Utc>,
    public_key: String,
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl TokenSigningKey {
    /// Builds a key pair from a 32-byte Ed25519 seed.
    ///
    /// # Errors
    ///
    /// Returns [`AuthnError::InvalidKeyMaterial`] if the public component
    /// cannot be converted into a decoding key.
    pub fn from_seed(
        kid: impl Into<String>,
        scope: KeyScope,
        seed: &Zeroizing<[u8; SECRET_KEY_LENGTH]>,
        created_at: DateTime<Utc>,
    ) -> Result<Self> {
        let signing_key = SigningKey::from_bytes(seed);
        let public_key_bytes: [u8; PUBLIC_KEY_LENGTH] = signing_key.verifying_key().to_bytes();
        let public_key = URL_SAFE_NO_PAD.encode(public_key_bytes);

        let mut pkcs8_der = Zeroizing::new(ED25519_PKCS8_PREFIX.to_vec());
        pkcs8_der.extend_from_slice(seed.as_slice());
        let encoding = EncodingKey::from_ed_der(&pkcs8_der);

        let decoding = DecodingKey::from_ed_components(&public_key)
            .map_err(|e| AuthnError::invalid_key_material(e.to_string()))?;

        Ok(Self { kid: kid.into(), scope, created_at, public_key, encoding, decoding })
    }

    /// Returns the key ID placed in the JWT `kid` header.
    #[must_use]
    pub fn kid(&self) -> &str {
        &self.kid
    }

    /// Returns the scope the key was loaded for.
    #[must_use]
    pub fn scope(&self) -> &KeyScope {
        &self.scope
    }

    /// Returns when the key was created.
    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Returns the public key as unpadded base64url.
    #[must_use]
    pub fn public_key(&self) -> &str {
        &self.public_key
    }

    /// Returns the signing half.
    #[must_use]
    pub fn encoding_key(&self) -> &EncodingKey {
        &self.encoding
    }

    /// Returns the verification half.
    #[must_use]
    pub fn decoding_key(&self) -> &DecodingKey {
        &self.decoding
    }
}

impl fmt::Debug for TokenSigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenSigningKey")
            .field("kid", &self.kid)
            .field("scope", &self.scope)
            .field("created_at", &self.created_at)
            .field("public_key", &self.public_key)
            .finish_non_exhaustive()
    }
}

/// Produces a signing key for a scope on a cache miss.
#[async_trait]
pub trait SigningKeyLoader: Send + Sync + fmt::Debug {
    /// Loads (or generates) the key for `scope`.
    ///
    /// # Errors
    ///
    /// Implementation-defined; the error is shared with every caller waiting
    /// on the same load.
    async fn load(&self, scope: &KeyScope) -> Result<TokenSigningKey>;
}

/// Generates a fresh random Ed25519 key for every load.
#[derive(Debug, Clone)]
pub struct GeneratingKeyLoader {
    clock: Arc<dyn Clock>,
}

impl GeneratingKeyLoader {
    /// Creates a loader stamping keys with `clock`'s time.
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }
}

#[async_trait]
impl SigningKeyLoader for GeneratingKeyLoader {
    async fn load(&self, scope: &KeyScope) -> Result<TokenSigningKey> {
        let seed = Zeroizing::new(SigningKey::generate(&mut OsRng).to_bytes());
        let mut kid_bytes = [0u8; KID_RANDOM_BYTES];
        OsRng.fill_bytes(&mut kid_bytes);
        let kid = URL_SAFE_NO_PAD.encode(kid_bytes);
        TokenSigningKey::from_seed(kid, scope.clone(), &seed, self.clock.now())
    }
}

/// Single-flight cache of token signing keys.
///
/// See the [module documentation](self) for the caching model.
#[derive(Debug)]
pub struct SigningKeyCache {
    config: SigningKeyCacheConfig,
    loader: Arc<dyn SigningKeyLoader>,
    global: Cache<String, Arc<TokenSigningKey>>,
    services: Cache<String, Arc<TokenSigningKey>>,
    in_flight: Mutex<HashMap<KeyScope, Arc<Flight>>>,
    invalidation_gen: AtomicU64,
    load_count: AtomicU64,
}

impl SigningKeyCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new(config: SigningKeyCacheConfig, loader: Arc<dyn SigningKeyLoader>) -> Self {
        Self {
            global: Cache::builder().max_capacity(1).time_to_live(config.global_key_ttl).build(),
            services: Cache::builder()
                .max_capacity(config.service_key_capacity)
                .time_to_live(config.service_key_ttl)
                .build(),
            config,
            loader,
            in_flight: Mutex::new(HashMap::new()),
            invalidation_gen: AtomicU64::new(0),
            load_count: AtomicU64::new(0),
        }
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &SigningKeyCacheConfig {
        &self.config
    }

    /// Returns the scope used to sign tokens for `service`.
    #[must_use]
    pub fn scope_for(&self, service: &Service) -> KeyScope {
        if self.config.per_service_keys { KeyScope::service(service) } else { KeyScope::Issuer }
    }

    /// Returns the key for `scope`, loading it on a miss.
    ///
    /// Concurrent misses for the same scope join one in-flight load. A load
    /// that overlaps [`invalidate`](Self::invalidate) or
    /// [`clear_all`](Self::clear_all) still answers its waiters but is not
    /// cached.
    ///
    /// # Errors
    ///
    /// Returns [`AuthnError::KeyLoad`] if the loader fails. Every caller that
    /// waited on the failed load receives the same source error.
    #[tracing::instrument(skip_all, fields(scope = %scope))]
    pub async fn key(&self, scope: &KeyScope) -> Result<Arc<TokenSigningKey>> {
        if let Some(key) = self.cached(scope).await {
            tracing::debug!("cache hit");
            return Ok(key);
        }
        tracing::debug!("cache miss");

        let flight = Arc::clone(self.in_flight.lock().entry(scope.clone()).or_default());
        let outcome = flight.get_or_init(|| self.lead_flight(scope, &flight)).await.clone();
        outcome.map_err(|source| AuthnError::KeyLoad { scope: scope.to_string(), source })
    }

    /// Runs the load for a flight; only one caller per flight gets here.
    async fn lead_flight(&self, scope: &KeyScope, flight: &Arc<Flight>) -> LoadOutcome {
        let generation = self.invalidation_gen.load(Ordering::Acquire);

        // A previous flight may have completed between our cache miss and
        // joining this one.
        let outcome = match self.cached(scope).await {
            Some(key) => Ok(key),
            None => self.load(scope).await.map_err(Arc::new),
        };

        if let Ok(key) = &outcome {
            if self.invalidation_gen.load(Ordering::Acquire) == generation {
                self.cache_for(scope).insert(self.cache_key(scope), Arc::clone(key)).await;
            } else {
                tracing::debug!("invalidated during load, result not cached");
            }
        }

        let mut in_flight = self.in_flight.lock();
        if in_flight.get(scope).is_some_and(|current| Arc::ptr_eq(current, flight)) {
            in_flight.remove(scope);
        }
        outcome
    }

    fn cache_for(&self, scope: &KeyScope) -> &Cache<String, Arc<TokenSigningKey>> {
        match scope {
            KeyScope::Issuer => &self.global,
            KeyScope::Service(_) => &self.services,
        }
    }

    fn cache_key(&self, scope: &KeyScope) -> String {
        match scope {
            KeyScope::Issuer => self.config.issuer.clone(),
            KeyScope::Service(id) => id.clone(),
        }
    }

    async fn cached(&self, scope: &KeyScope) -> Option<Arc<TokenSigningKey>> {
        self.cache_for(scope).get(&self.cache_key(scope)).await
    }

    /// Returns the cached key for `scope` without ever invoking the loader.
    #[tracing::instrument(skip_all, fields(scope = %scope))]
    pub async fn cached_key(&self, scope: &KeyScope) -> Option<Arc<TokenSigningKey>> {
        self.cached(scope).await
    }

    async fn load(&self, scope: &KeyScope) -> Result<Arc<TokenSigningKey>> {
        fail_point!("signing-key-before-load", |_| {
            Err(AuthnError::invalid_key_material("injected load failure"))
        });

        self.load_count.fetch_add(1, Ordering::Relaxed);
        let key = self.loader.load(scope).await?;
        if key.scope() != scope {
            return Err(AuthnError::invalid_key_material(format!(
                "loader returned a key for {} when {scope} was requested",
                key.scope()
            )));
        }

        tracing::info!(
            audit.action = "load_signing_key",
            audit.resource = %scope,
            audit.result = "success",
            kid = key.kid(),
            "audit_event"
        );
        Ok(Arc::new(key))
    }

    /// Drops the key for `scope`; the next request loads a new one.
    ///
    /// An audit event is emitted at INFO level for compliance tracking.
    #[tracing::instrument(skip_all, fields(scope = %scope))]
    pub async fn invalidate(&self, scope: &KeyScope) {
        self.invalidation_gen.fetch_add(1, Ordering::AcqRel);
        self.cache_for(scope).invalidate(&self.cache_key(scope)).await;

        tracing::info!(
            audit.action = "invalidate_signing_key",
            audit.resource = %scope,
            audit.result = "success",
            "audit_event"
        );
    }

    /// Drops every cached key.
    ///
    /// An audit event is emitted at INFO level for compliance tracking.
    #[tracing::instrument(skip_all)]
    pub async fn clear_all(&self) {
        self.sync().await;
        let evicted = self.entry_count();

        self.invalidation_gen.fetch_add(1, Ordering::AcqRel);
        self.global.invalidate_all();
        self.services.invalidate_all();
        self.sync().await;

        tracing::info!(
            audit.action = "clear_signing_keys",
            audit.resource = "all_signing_keys",
            audit.result = "success",
            audit.evicted = evicted,
            "audit_event"
        );
    }

    /// Returns the number of cached keys across both scopes.
    ///
    /// The count is approximate until [`sync`](Self::sync) has run.
    #[must_use]
    pub fn entry_count(&self) -> u64 {
        self.global.entry_count() + self.services.entry_count()
    }

    /// Returns how many times the loader has been invoked.
    #[must_use]
    pub fn load_count(&self) -> u64 {
        self.load_count.load(Ordering::Relaxed)
    }

    /// Runs pending cache maintenance so counts and evictions are current.
    pub async fn sync(&self) {
        self.global.run_pending_tasks().await;
        self.services.run_pending_tasks().await;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use std::time::Duration;

    use ed25519_dalek::{Signer, Verifier, VerifyingKey};
    use sso_tickets::SystemClock;

    use super::*;
    use crate::testutil::{
        CountingKeyLoader, ISSUER, counting_cache, counting_cache_with, test_config,
    };

    #[tokio::test]
    async fn test_issuer_key_is_cached() {
        let (cache, loader) = counting_cache();

        let first = cache.key(&KeyScope::Issuer).await.unwrap();
        let second = cache.key(&KeyScope::Issuer).await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(loader.calls(), 1);
        assert_eq!(cache.load_count(), 1);
    }

    #[tokio::test]
    async fn test_scopes_are_isolated() {
        let (cache, loader) = counting_cache();
        let app = KeyScope::Service("https://app.example.org".into());
        let backend = KeyScope::Service("https://backend.example.org".into());

        let issuer_key = cache.key(&KeyScope::Issuer).await.unwrap();
        let app_key = cache.key(&app).await.unwrap();
        let backend_key = cache.key(&backend).await.unwrap();

        assert_ne!(issuer_key.kid(), app_key.kid());
        assert_ne!(app_key.kid(), backend_key.kid());
        assert_eq!(app_key.scope(), &app);
        assert_eq!(loader.calls(), 3);

        cache.sync().await;
        assert_eq!(cache.entry_count(), 3);
    }

    #[tokio::test]
    async fn test_invalidate_rotates_key() {
        let (cache, loader) = counting_cache();
        let before = cache.key(&KeyScope::Issuer).await.unwrap();

        cache.invalidate(&KeyScope::Issuer).await;
        let after = cache.key(&KeyScope::Issuer).await.unwrap();

        assert_ne!(before.kid(), after.kid());
        assert_eq!(loader.calls(), 2);
    }

    #[tokio::test]
    async fn test_clear_all() {
        let (cache, _loader) = counting_cache();
        cache.key(&KeyScope::Issuer).await.unwrap();
        cache.key(&KeyScope::Service("https://app.example.org".into())).await.unwrap();

        cache.clear_all().await;
        assert_eq!(cache.entry_count(), 0);
    }

    #[tokio::test]
    async fn test_keys_expire_after_write() {
        let config = SigningKeyCacheConfig::builder()
            .issuer(ISSUER)
            .global_key_ttl(Duration::from_millis(100))
            .build()
            .unwrap();
        let loader = Arc::new(CountingKeyLoader::new());
        let cache = SigningKeyCache::new(config, loader.clone());

        let first = cache.key(&KeyScope::Issuer).await.unwrap();
        tokio::time::sleep(Duration::from_millis(250)).await;
        let second = cache.key(&KeyScope::Issuer).await.unwrap();

        assert_ne!(first.kid(), second.kid());
        assert_eq!(loader.calls(), 2);
    }

    #[tokio::test]
    async fn test_failed_load_is_not_cached() {
        let (cache, loader) = counting_cache();
        loader.set_failing(true);

        let err = cache.key(&KeyScope::Issuer).await.unwrap_err();
        let AuthnError::KeyLoad { scope, source } = &err else {
            panic!("unexpected error {err:?}")
        };
        assert_eq!(scope.as_str(), "issuer");
        assert!(matches!(**source, AuthnError::InvalidKeyMaterial(_)));

        loader.set_failing(false);
        cache.key(&KeyScope::Issuer).await.unwrap();
        assert_eq!(loader.calls(), 2);
    }

    #[tokio::test]
    async fn test_no_stale_repopulation_after_invalidate() {
        let loader = CountingKeyLoader::new().with_delay(Duration::from_millis(100));
        let (cache, loader) = counting_cache_with(test_config(), loader);

        let in_flight = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move { cache.key(&KeyScope::Issuer).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        cache.invalidate(&KeyScope::Issuer).await;

        let stale = in_flight.await.unwrap().unwrap();
        let fresh = cache.key(&KeyScope::Issuer).await.unwrap();

        assert_ne!(stale.kid(), fresh.kid(), "load overlapping invalidate must not be cached");
        assert_eq!(loader.calls(), 2);
    }

    #[derive(Debug)]
    struct MisroutingLoader;

    #[async_trait]
    impl SigningKeyLoader for MisroutingLoader {
        async fn load(&self, _scope: &KeyScope) -> Result<TokenSigningKey> {
            GeneratingKeyLoader::new(Arc::new(SystemClock)).load(&KeyScope::Issuer).await
        }
    }

    #[tokio::test]
    async fn test_rejects_key_for_another_scope() {
        let config = SigningKeyCacheConfig::builder().issuer(ISSUER).build().unwrap();
        let cache = SigningKeyCache::new(config, Arc::new(MisroutingLoader));

        let err = cache.key(&KeyScope::Service("https://app.example.org".into())).await;
        assert!(matches!(err, Err(AuthnError::KeyLoad { .. })));
        cache.sync().await;
        assert_eq!(cache.entry_count(), 0);
    }

    #[test]
    fn test_from_seed_matches_dalek_key() {
        let seed = Zeroizing::new([7u8; SECRET_KEY_LENGTH]);
        let key =
            TokenSigningKey::from_seed("kid-1", KeyScope::Issuer, &seed, Utc::now()).unwrap();

        let dalek = SigningKey::from_bytes(&seed);
        let decoded = URL_SAFE_NO_PAD.decode(key.public_key()).unwrap();
        let verifying = VerifyingKey::from_bytes(&decoded.try_into().unwrap()).unwrap();
        assert_eq!(verifying, dalek.verifying_key());

        let signature = dalek.sign(b"payload");
        assert!(verifying.verify(b"payload", &signature).is_ok());
    }

    #[test]
    fn test_debug_omits_key_material() {
        let seed = Zeroizing::new([9u8; SECRET_KEY_LENGTH]);
        let key =
            TokenSigningKey::from_seed("kid-9", KeyScope::Issuer, &seed, Utc::now()).unwrap();
        let rendered = format!("{key:?}");
        assert!(rendered.contains("kid-9"));
        assert!(!rendered.contains("encoding"));
    }

    #[test]
    fn test_scope_display() {
        assert_eq!(KeyScope::Issuer.to_string(), "issuer");
        let scope = KeyScope::service(&Service::new("https://app.example.org"));
        assert_eq!(scope.to_string(), "service:https://app.example.org");
    }
}
