//! Access tokens signed as JWTs and verified back.

#![allow(clippy::expect_used, clippy::panic)]

use std::{collections::BTreeSet, sync::Arc, time::Duration};

use serde_json::json;
use sso_authn::{
    AccessTokenSigner, AuthnError, KeyScope, SigningKeyCacheConfig,
    testutil::{CountingKeyLoader, ISSUER, counting_cache_with, craft_raw_jwt, test_config},
};
use sso_tickets::{
    Service, Ticket, TicketKind,
    testutil::{APP_SERVICE, BACKEND_SERVICE, TestHarness},
};

fn signer(harness: &TestHarness, config: SigningKeyCacheConfig) -> AccessTokenSigner {
    let (keys, _loader) = counting_cache_with(config, CountingKeyLoader::new());
    AccessTokenSigner::new(keys, Arc::new(harness.clock.clone()))
}

async fn access_token(harness: &TestHarness, client: &str) -> Ticket {
    let tgt = harness.login().await;
    let client = Service::new(client);
    let scopes = BTreeSet::from(["openid".to_owned(), "profile".to_owned()]);
    let code = harness
        .engine
        .issue_oauth_code(&tgt, &client, scopes)
        .await
        .expect("issue code");
    harness.engine.exchange_code(code.id(), &client).await.expect("exchange").access_token
}

#[tokio::test]
async fn signed_token_verifies_with_ticket_claims() {
    let harness = TestHarness::new();
    let signer = signer(&harness, test_config());
    let token = access_token(&harness, APP_SERVICE).await;

    let jwt = signer.sign(&token).await.expect("sign");
    let header = jsonwebtoken::decode_header(&jwt).expect("header");
    assert_eq!(header.alg, jsonwebtoken::Algorithm::EdDSA);

    let claims = signer.verify(&jwt, &Service::new(APP_SERVICE)).await.expect("verify");
    assert_eq!(claims.iss, ISSUER);
    assert_eq!(claims.sub, "casuser");
    assert_eq!(claims.aud, APP_SERVICE);
    assert_eq!(claims.jti, token.id().to_string());
    assert_eq!(claims.scopes(), vec!["openid", "profile"]);
    assert!(claims.exp > claims.iat);

    let issuer_key = signer.keys().key(&KeyScope::Issuer).await.expect("issuer key");
    assert_eq!(header.kid.as_deref(), Some(issuer_key.kid()));
}

#[tokio::test]
async fn other_audience_is_rejected() {
    let harness = TestHarness::new();
    let signer = signer(&harness, test_config());
    let token = access_token(&harness, APP_SERVICE).await;
    let jwt = signer.sign(&token).await.expect("sign");

    let err = signer.verify(&jwt, &Service::new(BACKEND_SERVICE)).await.expect_err("audience");
    assert!(matches!(err, AuthnError::InvalidAudience(_)), "got {err:?}");
}

#[tokio::test]
async fn per_service_keys_do_not_cross_services() {
    let harness = TestHarness::new();
    let config = SigningKeyCacheConfig::builder()
        .issuer(ISSUER)
        .per_service_keys(true)
        .build()
        .expect("valid config");
    let signer = signer(&harness, config);
    let token = access_token(&harness, APP_SERVICE).await;
    let jwt = signer.sign(&token).await.expect("sign");

    signer.verify(&jwt, &Service::new(APP_SERVICE)).await.expect("verify for its own service");

    let err = signer.verify(&jwt, &Service::new(BACKEND_SERVICE)).await.expect_err("other key");
    assert!(matches!(err, AuthnError::UnknownKey { .. }), "got {err:?}");
}

#[tokio::test]
async fn token_expires_with_the_ticket_clock() {
    let harness = TestHarness::new();
    let signer = signer(&harness, test_config());
    let token = access_token(&harness, APP_SERVICE).await;
    let jwt = signer.sign(&token).await.expect("sign");

    // Access tokens idle out after two hours.
    harness.clock.advance(Duration::from_secs(2 * 3600 + 1));
    let err = signer.verify(&jwt, &Service::new(APP_SERVICE)).await.expect_err("expired");
    assert!(matches!(err, AuthnError::TokenExpired), "got {err:?}");

    let err = signer.sign(&token).await.expect_err("expired ticket");
    assert!(matches!(err, AuthnError::TokenExpired), "got {err:?}");
}

#[tokio::test]
async fn rotated_key_invalidates_older_tokens() {
    let harness = TestHarness::new();
    let signer = signer(&harness, test_config());
    let token = access_token(&harness, APP_SERVICE).await;
    let jwt = signer.sign(&token).await.expect("sign");

    signer.keys().invalidate(&KeyScope::Issuer).await;
    let err = signer.verify(&jwt, &Service::new(APP_SERVICE)).await.expect_err("rotated");
    assert!(matches!(err, AuthnError::UnknownKey { .. }), "got {err:?}");

    let fresh = signer.sign(&token).await.expect("sign with new key");
    signer.verify(&fresh, &Service::new(APP_SERVICE)).await.expect("verify with new key");
}

#[tokio::test]
async fn tampered_signature_is_rejected() {
    let harness = TestHarness::new();
    let signer = signer(&harness, test_config());
    let token = access_token(&harness, APP_SERVICE).await;
    let jwt = signer.sign(&token).await.expect("sign");

    let (signed, signature) = jwt.rsplit_once('.').expect("three segments");
    let flipped = if signature.starts_with('A') { "B" } else { "A" };
    let tampered = format!("{signed}.{flipped}{}", &signature[1..]);

    let err = signer.verify(&tampered, &Service::new(APP_SERVICE)).await.expect_err("tampered");
    assert!(
        matches!(err, AuthnError::InvalidSignature | AuthnError::InvalidTokenFormat(_)),
        "got {err:?}"
    );
}

#[tokio::test]
async fn only_access_tokens_are_signed() {
    let harness = TestHarness::new();
    let signer = signer(&harness, test_config());
    let tgt = harness.login().await;
    let code = harness
        .engine
        .issue_oauth_code(&tgt, &Service::new(APP_SERVICE), BTreeSet::new())
        .await
        .expect("issue code");

    let err = signer.sign(&code).await.expect_err("codes are not JWTs");
    assert!(
        matches!(err, AuthnError::NotAnAccessToken { kind: TicketKind::OAuthCode }),
        "got {err:?}"
    );
}

#[tokio::test]
async fn forged_headers_are_rejected() {
    let harness = TestHarness::new();
    let signer = signer(&harness, test_config());
    let app = Service::new(APP_SERVICE);
    let kid = signer.keys().key(&KeyScope::Issuer).await.expect("issuer key").kid().to_owned();
    let payload = json!({
        "iss": ISSUER,
        "sub": "casuser",
        "aud": APP_SERVICE,
        "exp": 4_102_444_800u64,
        "iat": 1_735_689_600u64,
        "jti": "AT-forged",
        "scope": "openid",
    });

    let hs256 = craft_raw_jwt(&json!({"alg": "HS256", "typ": "JWT", "kid": kid}), &payload);
    let err = signer.verify(&hs256, &app).await.expect_err("symmetric algorithm");
    assert!(matches!(err, AuthnError::UnsupportedAlgorithm(_)), "got {err:?}");

    let none = craft_raw_jwt(&json!({"alg": "none", "typ": "JWT", "kid": kid}), &payload);
    assert!(signer.verify(&none, &app).await.is_err(), "alg none must never verify");

    let no_kid = craft_raw_jwt(&json!({"alg": "EdDSA", "typ": "JWT"}), &payload);
    let err = signer.verify(&no_kid, &app).await.expect_err("missing kid");
    assert!(matches!(err, AuthnError::MissingClaim(ref claim) if claim == "kid"), "got {err:?}");

    let unsigned = craft_raw_jwt(&json!({"alg": "EdDSA", "typ": "JWT", "kid": kid}), &payload);
    let err = signer.verify(&unsigned, &app).await.expect_err("garbage signature");
    assert!(
        matches!(err, AuthnError::InvalidSignature | AuthnError::InvalidTokenFormat(_)),
        "got {err:?}"
    );
}

#[tokio::test]
async fn verification_never_loads_a_key() {
    let harness = TestHarness::new();
    let (keys, loader) = counting_cache_with(test_config(), CountingKeyLoader::new());
    let signer = AccessTokenSigner::new(keys, Arc::new(harness.clock.clone()));
    let payload = json!({
        "iss": ISSUER,
        "sub": "casuser",
        "aud": APP_SERVICE,
        "exp": 4_102_444_800u64,
        "iat": 1_735_689_600u64,
        "jti": "AT-cold",
    });
    let jwt = craft_raw_jwt(&json!({"alg": "EdDSA", "typ": "JWT", "kid": "guessed"}), &payload);

    let err = signer.verify(&jwt, &Service::new(APP_SERVICE)).await.expect_err("cold cache");
    assert!(matches!(err, AuthnError::UnknownKey { ref kid } if kid == "guessed"), "got {err:?}");
    assert_eq!(loader.calls(), 0);
    assert!(signer.keys().cached_key(&KeyScope::Issuer).await.is_none());
}
