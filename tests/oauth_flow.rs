// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Authorization code flow through the gateway's OAuth proxy.

mod common;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde_json::{json, Value};

use cnpg_gateway::oauth::pkce::challenge_for;

use common::*;

async fn exchange(app: &axum::Router, code: &str, verifier: &str) -> TestResponse {
    post_form(
        app,
        "/token",
        &[
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", CLIENT_REDIRECT),
            ("client_id", CLIENT_ID),
            ("code_verifier", verifier),
        ],
    )
    .await
}

async fn refresh(app: &axum::Router, refresh_token: &str) -> TestResponse {
    post_form(
        app,
        "/token",
        &[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", CLIENT_ID),
        ],
    )
    .await
}

fn jws_header(token: &str) -> Value {
    let segment = token.split('.').next().unwrap();
    serde_json::from_slice(&URL_SAFE_NO_PAD.decode(segment).unwrap()).unwrap()
}

async fn register_client(app: &axum::Router, metadata: Value) -> TestResponse {
    let request = Request::builder()
        .method("POST")
        .uri("/register")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(metadata.to_string()))
        .unwrap();
    send(app, request).await
}

#[tokio::test]
async fn full_flow_issues_session_token() {
    let idp = MockIdp::start().await;
    let gateway = gateway(&idp, true).await;
    let app = app(&gateway);

    let tokens = login(&app).await;
    assert_eq!(tokens["token_type"], "Bearer");
    assert_eq!(tokens["expires_in"], 3600);
    assert_eq!(tokens["scope"], "openid offline_access read");
    assert!(tokens["refresh_token"].is_string());

    let session = tokens["access_token"].as_str().unwrap();
    assert_eq!(jws_header(session)["alg"], "ES256");
    let response = get_with_token(&app, "/mcp/whoami", Some(session)).await;
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(gateway.proxy().unwrap().sessions().len().await, 1);
}

#[tokio::test]
async fn token_response_is_not_cacheable() {
    let idp = MockIdp::start().await;
    let gateway = gateway(&idp, true).await;
    let app = app(&gateway);

    let code = authorize(&app, "upstream-code-1").await;
    let response = exchange(&app, &code, CLIENT_VERIFIER).await;
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.header(header::CACHE_CONTROL), Some("no-store"));
}

#[tokio::test]
async fn session_lifetime_is_capped_by_upstream_expiry() {
    let idp = MockIdp::start().await;
    idp.set_expires_in(120);
    let gateway = gateway(&idp, true).await;
    let app = app(&gateway);

    let tokens = login(&app).await;
    assert_eq!(tokens["expires_in"], 120);
}

#[tokio::test]
async fn upstream_exchange_uses_proxy_pkce_and_callback() {
    let idp = MockIdp::start().await;
    let gateway = gateway(&idp, true).await;
    let app = app(&gateway);
    login(&app).await;

    let requests = idp.token_requests();
    assert_eq!(requests.len(), 1);
    let form = &requests[0];
    assert_eq!(form["grant_type"], "authorization_code");
    assert_eq!(form["code"], "upstream-code-1");
    assert_eq!(form["redirect_uri"], format!("{PUBLIC_URL}/auth/callback"));
    assert_eq!(form["client_id"], "gateway-client");
    // The gateway runs its own PKCE with the IdP; the client's verifier never leaves.
    let verifier = &form["code_verifier"];
    assert_ne!(verifier.as_str(), CLIENT_VERIFIER);
    assert!(verifier.len() >= 43);
}

#[tokio::test]
async fn upstream_redirect_carries_proxy_challenge() {
    let idp = MockIdp::start().await;
    let gateway = gateway(&idp, true).await;
    let app = app(&gateway);

    let challenge = challenge_for(CLIENT_VERIFIER);
    let page = get_with_token(
        &app,
        &format!(
            "/authorize?response_type=code&client_id={CLIENT_ID}&redirect_uri=http%3A%2F%2F127.0.0.1%3A9000%2Fcb&code_challenge={challenge}&code_challenge_method=S256"
        ),
        None,
    )
    .await;
    assert_eq!(page.status, StatusCode::OK);
    assert_eq!(page.header(header::X_FRAME_OPTIONS), Some("DENY"));

    let consent = approve(&app, &page).await;
    assert_eq!(consent.status, StatusCode::FOUND);
    let location = consent.header(header::LOCATION).unwrap();
    assert!(location.starts_with(&format!("{}/authorize?", idp.issuer)));
    assert_eq!(consent.location_param("code_challenge_method").as_deref(), Some("S256"));
    assert_ne!(consent.location_param("code_challenge").unwrap(), challenge);
    assert_eq!(
        consent.location_param("redirect_uri").unwrap(),
        format!("{PUBLIC_URL}/auth/callback")
    );
    assert_eq!(
        consent.location_param("client_id").as_deref(),
        Some("gateway-client")
    );
}

#[tokio::test]
async fn consent_post_from_another_browser_is_refused() {
    let idp = MockIdp::start().await;
    let gateway = gateway(&idp, true).await;
    let app = app(&gateway);

    let authorize_path = format!(
        "/authorize?response_type=code&client_id={CLIENT_ID}&redirect_uri=http%3A%2F%2F127.0.0.1%3A9000%2Fcb&code_challenge={}&code_challenge_method=S256",
        challenge_for(CLIENT_VERIFIER)
    );
    let victim = get_with_token(&app, &authorize_path, None).await;
    let cookie = victim.header(header::SET_COOKIE).unwrap();
    assert!(cookie.contains("HttpOnly"));
    assert!(cookie.contains("SameSite=Strict"));
    let state = hidden_field(&victim.text, "state");
    let csrf = hidden_field(&victim.text, "csrf_token");

    // Cross-site auto-submit: the form fields leaked, the cookie did not.
    let forged = post_form(
        &app,
        "/authorize/consent",
        &[("state", &state), ("csrf_token", &csrf), ("decision", "approve")],
    )
    .await;
    assert_eq!(forged.status, StatusCode::BAD_REQUEST);
    assert_eq!(forged.json()["error"], "invalid_request");
    assert!(forged.header(header::LOCATION).is_none());

    // The attacker's own cookie does not unlock the victim's request.
    let attacker = get_with_token(&app, &authorize_path, None).await;
    let forged = post_form_with_cookie(
        &app,
        "/authorize/consent",
        &[("state", &state), ("csrf_token", &csrf), ("decision", "approve")],
        Some(&consent_cookie(&attacker)),
    )
    .await;
    assert_eq!(forged.status, StatusCode::BAD_REQUEST);

    // The request is still pending for the browser that was prompted.
    let consent = approve(&app, &victim).await;
    assert_eq!(consent.status, StatusCode::FOUND, "{}", consent.text);
    assert_eq!(consent.location_param("state").as_deref(), Some(state.as_str()));
    assert!(consent
        .header(header::SET_COOKIE)
        .is_some_and(|c| c.starts_with("cnpg_consent=")));
}

#[tokio::test]
async fn wrong_verifier_is_invalid_grant() {
    let idp = MockIdp::start().await;
    let gateway = gateway(&idp, true).await;
    let app = app(&gateway);

    let code = authorize(&app, "upstream-code-1").await;
    let response = exchange(
        &app,
        &code,
        "wrong-verifier-wrong-verifier-wrong-verifier-0000",
    )
    .await;
    assert_eq!(response.status, StatusCode::BAD_REQUEST);
    assert_eq!(response.json()["error"], "invalid_grant");
    // The upstream code was never spent.
    assert!(idp.token_requests().is_empty());
}

#[tokio::test]
async fn proxy_code_is_single_use() {
    let idp = MockIdp::start().await;
    let gateway = gateway(&idp, true).await;
    let app = app(&gateway);

    let code = authorize(&app, "upstream-code-1").await;
    assert_eq!(exchange(&app, &code, CLIENT_VERIFIER).await.status, StatusCode::OK);

    let replay = exchange(&app, &code, CLIENT_VERIFIER).await;
    assert_eq!(replay.status, StatusCode::BAD_REQUEST);
    assert_eq!(replay.json()["error"], "invalid_grant");
    assert_eq!(idp.token_requests().len(), 1);
}

#[tokio::test]
async fn failed_verifier_still_consumes_the_code() {
    let idp = MockIdp::start().await;
    let gateway = gateway(&idp, true).await;
    let app = app(&gateway);

    let code = authorize(&app, "upstream-code-1").await;
    let wrong = exchange(&app, &code, "x".repeat(43).as_str()).await;
    assert_eq!(wrong.status, StatusCode::BAD_REQUEST);

    let retry = exchange(&app, &code, CLIENT_VERIFIER).await;
    assert_eq!(retry.json()["error"], "invalid_grant");
}

#[tokio::test]
async fn upstream_rejection_is_invalid_grant_without_detail() {
    let idp = MockIdp::start().await;
    let gateway = gateway(&idp, true).await;
    let app = app(&gateway);

    let code = authorize(&app, REJECTED_CODE).await;
    let response = exchange(&app, &code, CLIENT_VERIFIER).await;
    assert_eq!(response.status, StatusCode::BAD_REQUEST);
    assert_eq!(response.json()["error"], "invalid_grant");
    assert!(!response.text.contains("vendor-specific"));
    assert!(gateway.proxy().unwrap().sessions().is_empty().await);
}

#[tokio::test]
async fn callback_state_cannot_be_replayed() {
    let idp = MockIdp::start().await;
    let gateway = gateway(&idp, true).await;
    let app = app(&gateway);

    let challenge = challenge_for(CLIENT_VERIFIER);
    let page = get_with_token(
        &app,
        &format!(
            "/authorize?response_type=code&client_id={CLIENT_ID}&redirect_uri=http%3A%2F%2F127.0.0.1%3A9000%2Fcb&code_challenge={challenge}&code_challenge_method=S256"
        ),
        None,
    )
    .await;
    let state = hidden_field(&page.text, "state");
    assert_eq!(approve(&app, &page).await.status, StatusCode::FOUND);

    let path = format!("/auth/callback?code=c1&state={state}");
    assert_eq!(get_with_token(&app, &path, None).await.status, StatusCode::FOUND);
    let replay = get_with_token(&app, &path, None).await;
    assert_eq!(replay.status, StatusCode::BAD_REQUEST);
    assert_eq!(replay.json()["error"], "invalid_request");
}

#[tokio::test]
async fn refresh_rotates_tokens_and_sessions() {
    let idp = MockIdp::start().await;
    let gateway = gateway(&idp, true).await;
    let app = app(&gateway);

    let first = login(&app).await;
    let first_session = first["access_token"].as_str().unwrap();
    let first_refresh = first["refresh_token"].as_str().unwrap();

    let response = refresh(&app, first_refresh).await;
    assert_eq!(response.status, StatusCode::OK, "{}", response.text);
    let second = response.json();
    let second_session = second["access_token"].as_str().unwrap();
    assert_ne!(second_session, first_session);
    assert_ne!(second["refresh_token"], first["refresh_token"]);

    let requests = idp.token_requests();
    let last = requests.last().unwrap();
    assert_eq!(last["grant_type"], "refresh_token");
    assert_eq!(last["refresh_token"], "upstream-rt-0");

    // Old session and old refresh token are gone.
    assert_eq!(
        get_with_token(&app, "/mcp/whoami", Some(first_session)).await.status,
        StatusCode::UNAUTHORIZED
    );
    assert_eq!(
        get_with_token(&app, "/mcp/whoami", Some(second_session)).await.status,
        StatusCode::OK
    );
    let reuse = refresh(&app, first_refresh).await;
    assert_eq!(reuse.status, StatusCode::BAD_REQUEST);
    assert_eq!(reuse.json()["error"], "invalid_grant");
}

#[tokio::test]
async fn refresh_by_another_client_is_refused() {
    let idp = MockIdp::start().await;
    let gateway = gateway(&idp, true).await;
    let app = app(&gateway);

    let tokens = login(&app).await;
    let response = post_form(
        &app,
        "/token",
        &[
            ("grant_type", "refresh_token"),
            ("refresh_token", tokens["refresh_token"].as_str().unwrap()),
            ("client_id", "someone-else"),
        ],
    )
    .await;
    assert_eq!(response.status, StatusCode::BAD_REQUEST);
    assert_eq!(response.json()["error"], "invalid_grant");
}

#[tokio::test]
async fn refresh_survives_an_upstream_outage() {
    let idp = MockIdp::start().await;
    let gateway = gateway(&idp, true).await;
    let app = app(&gateway);

    let tokens = login(&app).await;
    let session = tokens["access_token"].as_str().unwrap();
    let refresh_token = tokens["refresh_token"].as_str().unwrap();

    idp.set_token_failing(true);
    let response = refresh(&app, refresh_token).await;
    assert_eq!(response.status, StatusCode::SERVICE_UNAVAILABLE, "{}", response.text);
    assert_eq!(response.json()["error"], "temporarily_unavailable");
    assert_eq!(
        get_with_token(&app, "/mcp/whoami", Some(session)).await.status,
        StatusCode::OK
    );

    idp.set_token_failing(false);
    let response = refresh(&app, refresh_token).await;
    assert_eq!(response.status, StatusCode::OK, "{}", response.text);
    assert_eq!(
        get_with_token(&app, "/mcp/whoami", Some(session)).await.status,
        StatusCode::UNAUTHORIZED
    );
}

#[tokio::test]
async fn revoking_refresh_token_prevents_refresh() {
    let idp = MockIdp::start().await;
    let gateway = gateway(&idp, true).await;
    let app = app(&gateway);

    let tokens = login(&app).await;
    let refresh_token = tokens["refresh_token"].as_str().unwrap();
    let response = post_form(
        &app,
        "/revoke",
        &[("token", refresh_token), ("token_type_hint", "refresh_token")],
    )
    .await;
    assert_eq!(response.status, StatusCode::OK);

    let response = refresh(&app, refresh_token).await;
    assert_eq!(response.json()["error"], "invalid_grant");
}

#[tokio::test]
async fn revoke_is_silent_for_garbage() {
    let idp = MockIdp::start().await;
    let gateway = gateway(&idp, true).await;
    let app = app(&gateway);

    let response = post_form(&app, "/revoke", &[("token", "not-a-token")]).await;
    assert_eq!(response.status, StatusCode::OK);
}

#[tokio::test]
async fn unsupported_grant_type() {
    let idp = MockIdp::start().await;
    let gateway = gateway(&idp, true).await;
    let app = app(&gateway);

    let response = post_form(&app, "/token", &[("grant_type", "password")]).await;
    assert_eq!(response.status, StatusCode::BAD_REQUEST);
    assert_eq!(response.json()["error"], "unsupported_grant_type");
}

#[tokio::test]
async fn authorization_server_metadata_describes_the_proxy() {
    let idp = MockIdp::start().await;
    let gateway = gateway(&idp, true).await;
    let app = app(&gateway);

    let response = get_with_token(&app, "/.well-known/oauth-authorization-server", None).await;
    assert_eq!(response.status, StatusCode::OK);
    let metadata = response.json();
    assert_eq!(metadata["issuer"], PUBLIC_URL);
    assert_eq!(metadata["authorization_endpoint"], format!("{PUBLIC_URL}/authorize"));
    assert_eq!(metadata["token_endpoint"], format!("{PUBLIC_URL}/token"));
    assert_eq!(metadata["registration_endpoint"], format!("{PUBLIC_URL}/register"));
    assert_eq!(metadata["code_challenge_methods_supported"], json!(["S256"]));
    assert_eq!(metadata["jwks_uri"], format!("{PUBLIC_URL}/.well-known/jwks.json"));

    let response = get_with_token(&app, "/.well-known/oauth-protected-resource", None).await;
    let resource = response.json();
    assert_eq!(resource["resource"], format!("{PUBLIC_URL}/mcp"));
    assert_eq!(resource["authorization_servers"], json!([PUBLIC_URL]));
}

#[tokio::test]
async fn direct_mode_metadata_points_at_upstream() {
    let idp = MockIdp::start().await;
    let gateway = gateway(&idp, false).await;
    let app = app(&gateway);

    let metadata = get_with_token(&app, "/.well-known/oauth-authorization-server", None)
        .await
        .json();
    assert_eq!(metadata["token_endpoint"], format!("{}/oauth/token", idp.issuer));

    let jwks = get_with_token(&app, "/.well-known/jwks.json", None).await;
    assert_eq!(jwks.status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn published_jwks_verifies_session_tokens() {
    let idp = MockIdp::start().await;
    let gateway = gateway(&idp, true).await;
    let app = app(&gateway);

    let jwks = get_with_token(&app, "/.well-known/jwks.json", None).await.json();
    let keys = jwks["keys"].as_array().unwrap();
    assert_eq!(keys.len(), 1);
    assert!(keys[0].get("d").is_none());

    let tokens = login(&app).await;
    let header = jws_header(tokens["access_token"].as_str().unwrap());
    assert_eq!(header["kid"], keys[0]["kid"]);
}

#[tokio::test]
async fn readiness_reports_keys_and_sessions() {
    let idp = MockIdp::start().await;
    let gateway = gateway(&idp, true).await;
    let app = app(&gateway);

    let response = get_with_token(&app, "/health/ready", None).await;
    assert_eq!(response.status, StatusCode::OK);
    let body = response.json();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["checks"]["jwks_keys"], 1);
    assert_eq!(body["checks"]["sessions"], 0);

    idp.set_jwks_failing(true);
    let cold = gateway_with(&idp, false, &[]).await;
    let response = get_with_token(&common::app(&cold), "/health/ready", None).await;
    assert_eq!(response.status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(response.json()["status"], "degraded");
}

#[tokio::test]
async fn registration_records_redirect_uris() {
    let idp = MockIdp::start().await;
    let gateway = gateway(&idp, true).await;
    let app = app(&gateway);

    let response = register_client(
        &app,
        json!({
            "client_name": "psql-helper",
            "redirect_uris": ["http://localhost:7777/callback"],
        }),
    )
    .await;
    assert_eq!(response.status, StatusCode::CREATED, "{}", response.text);
    assert_eq!(response.json()["client_id"], "dyn-client-1");

    // The registered client can no longer use an arbitrary loopback URI.
    let response = get_with_token(
        &app,
        "/authorize?response_type=code&client_id=dyn-client-1&redirect_uri=http%3A%2F%2F127.0.0.1%3A9000%2Fcb",
        None,
    )
    .await;
    assert_eq!(response.status, StatusCode::BAD_REQUEST);

    let response = get_with_token(
        &app,
        "/authorize?response_type=code&client_id=dyn-client-1&redirect_uri=http%3A%2F%2Flocalhost%3A7777%2Fcallback",
        None,
    )
    .await;
    assert_eq!(response.status, StatusCode::OK);
    assert!(response.text.contains("psql-helper"));
}

#[tokio::test]
async fn registration_rejected_upstream_is_invalid_client_metadata() {
    let idp = MockIdp::start().await;
    let gateway = gateway(&idp, true).await;
    let app = app(&gateway);

    let response = register_client(
        &app,
        json!({
            "client_name": "reject-me",
            "redirect_uris": ["https://client.test/cb"],
        }),
    )
    .await;
    assert_eq!(response.status, StatusCode::BAD_REQUEST);
    assert_eq!(response.json()["error"], "invalid_client_metadata");
}

#[tokio::test]
async fn registration_requires_safe_redirect_uris() {
    let idp = MockIdp::start().await;
    let gateway = gateway(&idp, true).await;
    let app = app(&gateway);

    let response = register_client(
        &app,
        json!({"client_name": "x", "redirect_uris": ["http://evil.test/cb"]}),
    )
    .await;
    assert_eq!(response.status, StatusCode::BAD_REQUEST);
    assert_eq!(response.json()["error"], "invalid_redirect_uri");
}

#[tokio::test]
async fn authorize_rejects_non_loopback_http_redirect() {
    let idp = MockIdp::start().await;
    let gateway = gateway(&idp, true).await;
    let app = app(&gateway);

    let response = get_with_token(
        &app,
        "/authorize?response_type=code&client_id=cli&redirect_uri=http%3A%2F%2Fevil.test%2Fcb",
        None,
    )
    .await;
    assert_eq!(response.status, StatusCode::BAD_REQUEST);
    assert!(response.header(header::LOCATION).is_none());
}

#[tokio::test]
async fn authorize_reports_bad_response_type_to_client() {
    let idp = MockIdp::start().await;
    let gateway = gateway(&idp, true).await;
    let app = app(&gateway);

    let response = get_with_token(
        &app,
        "/authorize?response_type=token&client_id=cli&redirect_uri=http%3A%2F%2F127.0.0.1%3A9000%2Fcb&state=s1",
        None,
    )
    .await;
    assert_eq!(response.status, StatusCode::FOUND);
    assert_eq!(
        response.location_param("error").as_deref(),
        Some("unsupported_response_type")
    );
    assert_eq!(response.location_param("state").as_deref(), Some("s1"));
}
