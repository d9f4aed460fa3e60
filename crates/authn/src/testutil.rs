//! Shared test utilities for token signing.
//!
//! Feature-gated behind `testutil`. Provides a counting key loader for
//! single-flight assertions, a ready-made cache, and a raw JWT builder for
//! crafting tokens the signer would never produce.
//!
//! ```toml
//! [dev-dependencies]
//! sso-authn = { path = "../authn", features = ["testutil"] }
//! ```

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use parking_lot::Mutex;
use sso_tickets::SystemClock;

use crate::{
    config::SigningKeyCacheConfig,
    error::{AuthnError, Result},
    signing_key_cache::{
        GeneratingKeyLoader, KeyScope, SigningKeyCache, SigningKeyLoader, TokenSigningKey,
    },
};

/// Issuer used by [`test_config`].
pub const ISSUER: &str = "https://sso.example.org";

/// A [`GeneratingKeyLoader`] that counts invocations and can be slowed down
/// or made to fail.
#[derive(Debug)]
pub struct CountingKeyLoader {
    inner: GeneratingKeyLoader,
    calls: AtomicUsize,
    failing: AtomicBool,
    delay: Mutex<Duration>,
}

impl CountingKeyLoader {
    /// Creates a loader with no delay that succeeds.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: GeneratingKeyLoader::new(Arc::new(SystemClock)),
            calls: AtomicUsize::new(0),
            failing: AtomicBool::new(false),
            delay: Mutex::new(Duration::ZERO),
        }
    }

    /// Makes every load sleep for `delay` before producing its result.
    #[must_use]
    pub fn with_delay(self, delay: Duration) -> Self {
        *self.delay.lock() = delay;
        self
    }

    /// Makes subsequent loads fail (after the delay) until reset.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Returns the number of loads started so far.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Default for CountingKeyLoader {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SigningKeyLoader for CountingKeyLoader {
    async fn load(&self, scope: &KeyScope) -> Result<TokenSigningKey> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(AuthnError::invalid_key_material("key store unavailable"));
        }
        self.inner.load(scope).await
    }
}

/// Returns a configuration with [`ISSUER`] and default TTLs.
///
/// # Panics
///
/// Never in practice; the fixed values are valid.
#[must_use]
pub fn test_config() -> SigningKeyCacheConfig {
    SigningKeyCacheConfig::builder().issuer(ISSUER).build().expect("valid signing key config")
}

/// Builds a cache over a fresh [`CountingKeyLoader`].
#[must_use]
pub fn counting_cache() -> (Arc<SigningKeyCache>, Arc<CountingKeyLoader>) {
    counting_cache_with(test_config(), CountingKeyLoader::new())
}

/// Builds a cache with `config` over `loader`.
#[must_use]
pub fn counting_cache_with(
    config: SigningKeyCacheConfig,
    loader: CountingKeyLoader,
) -> (Arc<SigningKeyCache>, Arc<CountingKeyLoader>) {
    let loader = Arc::new(loader);
    let cache = Arc::new(SigningKeyCache::new(config, Arc::clone(&loader) as _));
    (cache, loader)
}

/// Crafts a raw JWT from arbitrary header and payload JSON, with a garbage
/// signature. Used to present tokens a well-behaved signer never emits.
///
/// # Panics
///
/// Panics if the JSON values cannot be serialized.
pub fn craft_raw_jwt(header_json: &serde_json::Value, payload_json: &serde_json::Value) -> String {
    let header = serde_json::to_vec(header_json).expect("serialize header");
    let payload = serde_json::to_vec(payload_json).expect("serialize payload");
    format!(
        "{}.{}.{}",
        URL_SAFE_NO_PAD.encode(header),
        URL_SAFE_NO_PAD.encode(payload),
        URL_SAFE_NO_PAD.encode(b"not-a-signature")
    )
}
