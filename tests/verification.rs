// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Upstream token verification through the direct route prefix.

mod common;

use axum::http::{header, StatusCode};
use jsonwebtoken::{encode, EncodingKey, Header};
use serde_json::json;

use cnpg_gateway::auth::{AuthError, AuthErrorKind, ClaimRules, KeySource, TokenVerifier};
use cnpg_gateway::oauth::SigningKey;

use common::*;

#[tokio::test]
async fn valid_token_reaches_downstream_with_claims() {
    let idp = MockIdp::start().await;
    let gateway = gateway(&idp, false).await;
    let app = app(&gateway);

    let response = get_with_token(&app, "/test/whoami", Some(&idp.access_token("openid read"))).await;
    assert_eq!(response.status, StatusCode::OK, "{}", response.text);

    let body = response.json();
    assert_eq!(body["subject"], SUBJECT);
    assert_eq!(body["source"], "upstream_oidc");
    assert_eq!(body["scopes"], json!(["openid", "read"]));
    assert_eq!(body["claims"]["aud"], AUDIENCE);
}

#[tokio::test]
async fn missing_header_gets_bare_challenge() {
    let idp = MockIdp::start().await;
    let gateway = gateway(&idp, false).await;
    let app = app(&gateway);

    let response = get_with_token(&app, "/test/whoami", None).await;
    assert_eq!(response.status, StatusCode::UNAUTHORIZED);
    let challenge = response.header(header::WWW_AUTHENTICATE).unwrap();
    assert!(challenge.starts_with("Bearer realm="));
    assert!(!challenge.contains("error="));
    assert_eq!(response.json()["error"], "invalid_request");
    // No key fetch for a request that never carried a token.
    assert_eq!(idp.jwks_fetches(), 0);
}

#[tokio::test]
async fn required_scope_missing_is_403() {
    let idp = MockIdp::start().await;
    let gateway = gateway_with(&idp, false, &[REQUIRE_WRITE]).await;
    let app = app(&gateway);

    let response = get_with_token(&app, "/test/whoami", Some(&idp.access_token("openid read"))).await;
    assert_eq!(response.status, StatusCode::FORBIDDEN);
    let challenge = response.header(header::WWW_AUTHENTICATE).unwrap();
    assert!(challenge.contains(r#"error="insufficient_scope""#));
    assert!(challenge.contains(r#"scope="write""#));

    let response = get_with_token(&app, "/test/whoami", Some(&idp.access_token("openid write"))).await;
    assert_eq!(response.status, StatusCode::OK);
}

#[tokio::test]
async fn insufficient_scope_for_configured_issuer() {
    let key = SigningKey::generate().unwrap().with_kid("k1");
    let verifier = TokenVerifier::new(
        ClaimRules::new("https://idp.test", AUDIENCE),
        KeySource::Fixed(key.verification_key().unwrap()),
    );
    let now = now();
    let token = key
        .sign(&json!({
            "iss": "https://idp.test",
            "sub": "alice",
            "aud": AUDIENCE,
            "iat": now,
            "exp": now + 300,
            "scope": "openid read",
        }))
        .unwrap();

    let err = verifier.verify(&token, Some("write")).await.unwrap_err();
    assert_eq!(err.kind(), AuthErrorKind::InsufficientScope);
    assert_eq!(err.status_code(), StatusCode::FORBIDDEN);

    let claims = verifier.verify(&token, Some("read")).await.unwrap();
    assert_eq!(claims.subject(), "alice");
}

#[tokio::test]
async fn alg_none_and_hs256_are_rejected() {
    let idp = MockIdp::start().await;
    let gateway = gateway(&idp, false).await;
    let app = app(&gateway);
    let claims = idp.claims("openid");

    let none = forge(
        &json!({"alg": "none", "typ": "JWT", "kid": UPSTREAM_KID}),
        &claims,
        "",
    );
    let response = get_with_token(&app, "/test/whoami", Some(&none)).await;
    assert_eq!(response.status, StatusCode::UNAUTHORIZED);
    assert_eq!(response.json()["error"], "invalid_token");

    let mut header = Header::new(jsonwebtoken::Algorithm::HS256);
    header.kid = Some(UPSTREAM_KID.to_string());
    let hs256 = encode(&header, &claims, &EncodingKey::from_secret(b"guessable")).unwrap();
    let response = get_with_token(&app, "/test/whoami", Some(&hs256)).await;
    assert_eq!(response.status, StatusCode::UNAUTHORIZED);

    // Neither token caused a key fetch: the algorithm is refused up front.
    assert_eq!(idp.jwks_fetches(), 0);
}

#[tokio::test]
async fn expired_token_is_rejected_despite_valid_signature() {
    let idp = MockIdp::start().await;
    let gateway = gateway(&idp, false).await;
    let app = app(&gateway);

    let mut claims = idp.claims("openid");
    claims["exp"] = json!(now() - 120);
    let response = get_with_token(&app, "/test/whoami", Some(&idp.sign(&claims))).await;
    assert_eq!(response.status, StatusCode::UNAUTHORIZED);
    assert_eq!(response.json()["error"], "invalid_token");

    // Within the 60 s skew the token is still accepted.
    claims["exp"] = json!(now() - 30);
    let response = get_with_token(&app, "/test/whoami", Some(&idp.sign(&claims))).await;
    assert_eq!(response.status, StatusCode::OK);
}

#[tokio::test]
async fn issuer_and_audience_must_match() {
    let idp = MockIdp::start().await;
    let gateway = gateway(&idp, false).await;
    let app = app(&gateway);

    let mut claims = idp.claims("openid");
    claims["aud"] = json!(["other-api"]);
    let response = get_with_token(&app, "/test/whoami", Some(&idp.sign(&claims))).await;
    assert_eq!(response.status, StatusCode::UNAUTHORIZED);

    let mut claims = idp.claims("openid");
    claims["aud"] = json!(["other-api", AUDIENCE]);
    let response = get_with_token(&app, "/test/whoami", Some(&idp.sign(&claims))).await;
    assert_eq!(response.status, StatusCode::OK);

    let mut claims = idp.claims("openid");
    claims["iss"] = json!("https://evil.test");
    let response = get_with_token(&app, "/test/whoami", Some(&idp.sign(&claims))).await;
    assert_eq!(response.status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn foreign_key_with_known_kid_fails_signature() {
    let idp = MockIdp::start().await;
    let gateway = gateway(&idp, false).await;
    let app = app(&gateway);

    let impostor = SigningKey::generate().unwrap().with_kid(UPSTREAM_KID);
    let token = impostor.sign(&idp.claims("openid")).unwrap();
    let response = get_with_token(&app, "/test/whoami", Some(&token)).await;
    assert_eq!(response.status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn garbage_tokens_are_malformed() {
    let key = SigningKey::generate().unwrap();
    let verifier = TokenVerifier::new(
        ClaimRules::new("https://idp.test", AUDIENCE),
        KeySource::Fixed(key.verification_key().unwrap()),
    );
    for token in ["", "abc", "a.b", "a.b.c.d", "!!!.???.###"] {
        let err = verifier.verify(token, None).await.unwrap_err();
        assert_eq!(err, AuthError::MalformedToken, "token {token:?}");
    }
}
