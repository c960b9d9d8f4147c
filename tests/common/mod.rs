// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Shared fixtures: a mock upstream IdP and request helpers.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{
    body::{to_bytes, Body},
    extract::State,
    http::{header, HeaderMap, Request, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Form, Json, Router,
};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde_json::{json, Value};
use tower::ServiceExt;

use cnpg_gateway::api::identity;
use cnpg_gateway::config::{
    GatewayConfig, AUDIENCE_ENV, CLIENT_ID_ENV, CLIENT_SECRET_ENV, ISSUER_ENV, PUBLIC_URL_ENV,
    SCOPE_ENV, UPSTREAM_TIMEOUT_ENV,
};
use cnpg_gateway::oauth::pkce::challenge_for;
use cnpg_gateway::oauth::SigningKey;
use cnpg_gateway::AuthGateway;

pub const UPSTREAM_KID: &str = "upstream-1";
pub const AUDIENCE: &str = "api";
pub const SUBJECT: &str = "user-123";
pub const PUBLIC_URL: &str = "http://127.0.0.1:1";
pub const CLIENT_ID: &str = "cli";
pub const CLIENT_REDIRECT: &str = "http://127.0.0.1:9000/cb";
pub const CLIENT_VERIFIER: &str = "dBjftJeZ4CVP-mJ92K9ckqqqL3p5SZt9Lm1Zw7zFyWk0xQ";

/// Upstream authorization code the mock token endpoint rejects.
pub const REJECTED_CODE: &str = "revoked-upstream-code";

pub fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

#[derive(Default)]
pub struct IdpState {
    pub issuer: String,
    pub jwks: Mutex<Value>,
    pub jwks_fetches: AtomicUsize,
    pub jwks_delay_ms: AtomicU64,
    pub jwks_failing: AtomicBool,
    pub token_failing: AtomicBool,
    pub expires_in: AtomicU64,
    pub token_requests: Mutex<Vec<HashMap<String, String>>>,
    pub key: Mutex<Option<Arc<SigningKey>>>,
    refresh_counter: AtomicUsize,
}

impl IdpState {
    fn key(&self) -> Arc<SigningKey> {
        self.key.lock().unwrap().clone().expect("mock key")
    }
}

/// Mock OIDC provider bound to `127.0.0.1:0`.
pub struct MockIdp {
    pub issuer: String,
    pub key: Arc<SigningKey>,
    pub state: Arc<IdpState>,
}

impl MockIdp {
    pub async fn start() -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let issuer = format!("http://{}", listener.local_addr().unwrap());
        let key = Arc::new(SigningKey::generate().unwrap().with_kid(UPSTREAM_KID));

        let state = Arc::new(IdpState {
            issuer: issuer.clone(),
            jwks: Mutex::new(key.jwks()),
            expires_in: AtomicU64::new(3600),
            key: Mutex::new(Some(key.clone())),
            ..IdpState::default()
        });

        let app = Router::new()
            .route("/.well-known/openid-configuration", get(discovery))
            .route("/.well-known/jwks.json", get(jwks))
            .route("/oauth/token", post(token))
            .route("/oidc/register", post(register))
            .with_state(state.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { issuer, key, state }
    }

    pub fn jwks_uri(&self) -> String {
        format!("{}/.well-known/jwks.json", self.issuer)
    }

    pub fn jwks_fetches(&self) -> usize {
        self.state.jwks_fetches.load(Ordering::SeqCst)
    }

    pub fn set_jwks_delay(&self, delay: Duration) {
        self.state
            .jwks_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn set_jwks_failing(&self, failing: bool) {
        self.state.jwks_failing.store(failing, Ordering::SeqCst);
    }

    /// Make the token endpoint answer 502 until reset.
    pub fn set_token_failing(&self, failing: bool) {
        self.state.token_failing.store(failing, Ordering::SeqCst);
    }

    pub fn set_expires_in(&self, secs: u64) {
        self.state.expires_in.store(secs, Ordering::SeqCst);
    }

    pub fn token_requests(&self) -> Vec<HashMap<String, String>> {
        self.state.token_requests.lock().unwrap().clone()
    }

    /// Claims of a valid upstream access token.
    pub fn claims(&self, scope: &str) -> Value {
        let now = now();
        json!({
            "iss": self.issuer,
            "sub": SUBJECT,
            "aud": AUDIENCE,
            "iat": now,
            "exp": now + 3600,
            "scope": scope,
        })
    }

    pub fn sign(&self, claims: &Value) -> String {
        self.key.sign(claims).unwrap()
    }

    pub fn access_token(&self, scope: &str) -> String {
        self.sign(&self.claims(scope))
    }
}

async fn discovery(State(state): State<Arc<IdpState>>) -> Json<Value> {
    let base = &state.issuer;
    Json(json!({
        "issuer": format!("{base}/"),
        "authorization_endpoint": format!("{base}/authorize"),
        "token_endpoint": format!("{base}/oauth/token"),
        "jwks_uri": format!("{base}/.well-known/jwks.json"),
        "registration_endpoint": format!("{base}/oidc/register"),
        "scopes_supported": ["openid", "offline_access", "read", "write"],
    }))
}

async fn jwks(State(state): State<Arc<IdpState>>) -> Response {
    state.jwks_fetches.fetch_add(1, Ordering::SeqCst);
    let delay = state.jwks_delay_ms.load(Ordering::SeqCst);
    if delay > 0 {
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }
    if state.jwks_failing.load(Ordering::SeqCst) {
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    Json(state.jwks.lock().unwrap().clone()).into_response()
}

async fn token(
    State(state): State<Arc<IdpState>>,
    Form(form): Form<HashMap<String, String>>,
) -> Response {
    state.token_requests.lock().unwrap().push(form.clone());
    if state.token_failing.load(Ordering::SeqCst) {
        return StatusCode::BAD_GATEWAY.into_response();
    }

    let valid = match form.get("grant_type").map(String::as_str) {
        Some("authorization_code") => form
            .get("code")
            .is_some_and(|code| code != REJECTED_CODE && !code.is_empty()),
        Some("refresh_token") => form
            .get("refresh_token")
            .is_some_and(|rt| rt.starts_with("upstream-rt-")),
        _ => false,
    };
    if !valid || form.get("client_secret").map(String::as_str) != Some("gw-secret") {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "error": "invalid_grant",
                "error_description": "vendor-specific detail that must not leak",
            })),
        )
            .into_response();
    }

    let now = now();
    let access_token = state
        .key()
        .sign(&json!({
            "iss": state.issuer,
            "sub": SUBJECT,
            "aud": AUDIENCE,
            "iat": now,
            "exp": now + 3600,
            "scope": "openid offline_access read",
        }))
        .unwrap();
    let n = state.refresh_counter.fetch_add(1, Ordering::SeqCst);
    Json(json!({
        "access_token": access_token,
        "token_type": "Bearer",
        "expires_in": state.expires_in.load(Ordering::SeqCst),
        "refresh_token": format!("upstream-rt-{n}"),
        "scope": "openid offline_access read",
    }))
    .into_response()
}

async fn register(Json(metadata): Json<Value>) -> Response {
    if metadata.get("client_name").and_then(Value::as_str) == Some("reject-me") {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "invalid_client_metadata"})),
        )
            .into_response();
    }
    (
        StatusCode::CREATED,
        Json(json!({
            "client_id": "dyn-client-1",
            "client_name": metadata.get("client_name"),
            "redirect_uris": metadata.get("redirect_uris"),
        })),
    )
        .into_response()
}

pub fn env_of(pairs: Vec<(&'static str, String)>) -> impl Fn(&str) -> Option<String> {
    let map: HashMap<String, String> = pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();
    move |key| map.get(key).cloned()
}

/// Gateway configuration pointed at `idp`.
pub fn config(idp: &MockIdp, proxy: bool, extra: &[(&'static str, &str)]) -> GatewayConfig {
    let mut pairs = vec![
        (ISSUER_ENV, idp.issuer.clone()),
        (AUDIENCE_ENV, AUDIENCE.to_string()),
    ];
    if proxy {
        pairs.push((CLIENT_ID_ENV, "gateway-client".to_string()));
        pairs.push((CLIENT_SECRET_ENV, "gw-secret".to_string()));
        pairs.push((PUBLIC_URL_ENV, PUBLIC_URL.to_string()));
    }
    for (key, value) in extra {
        pairs.push((*key, value.to_string()));
    }
    GatewayConfig::from_sources(None, env_of(pairs)).unwrap()
}

pub async fn gateway(idp: &MockIdp, proxy: bool) -> AuthGateway {
    gateway_with(idp, proxy, &[]).await
}

pub async fn gateway_with(
    idp: &MockIdp,
    proxy: bool,
    extra: &[(&'static str, &str)],
) -> AuthGateway {
    AuthGateway::from_config(&config(idp, proxy, extra))
        .await
        .unwrap()
}

pub fn app(gateway: &AuthGateway) -> Router {
    gateway.router(identity::router())
}

pub const SHORT_TIMEOUT: (&str, &str) = (UPSTREAM_TIMEOUT_ENV, "1");
pub const REQUIRE_WRITE: (&str, &str) = (SCOPE_ENV, "write");

pub struct TestResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub text: String,
}

impl TestResponse {
    pub fn json(&self) -> Value {
        serde_json::from_str(&self.text).unwrap_or(Value::Null)
    }

    pub fn header(&self, name: header::HeaderName) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Query parameter of the `Location` header.
    pub fn location_param(&self, key: &str) -> Option<String> {
        let location = url::Url::parse(self.header(header::LOCATION)?).ok()?;
        location
            .query_pairs()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.into_owned())
    }
}

pub async fn send(app: &Router, request: Request<Body>) -> TestResponse {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    TestResponse {
        status,
        headers,
        text: String::from_utf8_lossy(&bytes).into_owned(),
    }
}

pub async fn get_with_token(app: &Router, path: &str, token: Option<&str>) -> TestResponse {
    let mut request = Request::builder().uri(path);
    if let Some(token) = token {
        request = request.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    send(app, request.body(Body::empty()).unwrap()).await
}

pub async fn post_form(app: &Router, path: &str, form: &[(&str, &str)]) -> TestResponse {
    post_form_with_cookie(app, path, form, None).await
}

pub async fn post_form_with_cookie(
    app: &Router,
    path: &str,
    form: &[(&str, &str)],
    cookie: Option<&str>,
) -> TestResponse {
    let body = form
        .iter()
        .map(|(k, v)| {
            format!(
                "{}={}",
                url::form_urlencoded::byte_serialize(k.as_bytes()).collect::<String>(),
                url::form_urlencoded::byte_serialize(v.as_bytes()).collect::<String>()
            )
        })
        .collect::<Vec<_>>()
        .join("&");
    let mut request = Request::builder()
        .method("POST")
        .uri(path)
        .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded");
    if let Some(cookie) = cookie {
        request = request.header(header::COOKIE, cookie);
    }
    send(app, request.body(Body::from(body)).unwrap()).await
}

/// Compact JWS with an arbitrary header and signature segment.
pub fn forge(header: &Value, claims: &Value, signature: &str) -> String {
    format!(
        "{}.{}.{}",
        URL_SAFE_NO_PAD.encode(header.to_string()),
        URL_SAFE_NO_PAD.encode(claims.to_string()),
        signature
    )
}

/// Run `/authorize` → consent → callback and return the proxy code.
pub async fn authorize(app: &Router, upstream_code: &str) -> String {
    let challenge = challenge_for(CLIENT_VERIFIER);
    let path = format!(
        "/authorize?response_type=code&client_id={CLIENT_ID}&redirect_uri={}&state=client-state&code_challenge={challenge}&code_challenge_method=S256&scope=openid%20offline_access%20read",
        url::form_urlencoded::byte_serialize(CLIENT_REDIRECT.as_bytes()).collect::<String>()
    );
    let page = get_with_token(app, &path, None).await;
    assert_eq!(page.status, StatusCode::OK, "{}", page.text);
    let consent = approve(app, &page).await;
    assert_eq!(consent.status, StatusCode::FOUND, "{}", consent.text);
    let upstream_state = consent.location_param("state").unwrap();
    assert_eq!(upstream_state, hidden_field(&page.text, "state"));

    let callback = get_with_token(
        app,
        &format!("/auth/callback?code={upstream_code}&state={upstream_state}"),
        None,
    )
    .await;
    assert_eq!(callback.status, StatusCode::FOUND, "{}", callback.text);
    assert_eq!(
        callback.location_param("state").as_deref(),
        Some("client-state")
    );
    callback.location_param("code").unwrap()
}

/// Full flow, returning the token endpoint's JSON.
pub async fn login(app: &Router) -> Value {
    let code = authorize(app, "upstream-code-1").await;
    let response = post_form(
        app,
        "/token",
        &[
            ("grant_type", "authorization_code"),
            ("code", &code),
            ("redirect_uri", CLIENT_REDIRECT),
            ("client_id", CLIENT_ID),
            ("code_verifier", CLIENT_VERIFIER),
        ],
    )
    .await;
    assert_eq!(response.status, StatusCode::OK, "{}", response.text);
    response.json()
}

/// Submit the consent form of `page` the way the browser that loaded it would.
pub async fn approve(app: &Router, page: &TestResponse) -> TestResponse {
    let state = hidden_field(&page.text, "state");
    let csrf = hidden_field(&page.text, "csrf_token");
    post_form_with_cookie(
        app,
        "/authorize/consent",
        &[("state", &state), ("csrf_token", &csrf), ("decision", "approve")],
        Some(&consent_cookie(page)),
    )
    .await
}

/// `name=value` of the consent cookie set on `page`.
pub fn consent_cookie(page: &TestResponse) -> String {
    let set_cookie = page.header(header::SET_COOKIE).expect("consent cookie");
    set_cookie
        .split(';')
        .next()
        .unwrap()
        .trim()
        .to_string()
}

pub fn hidden_field(html: &str, name: &str) -> String {
    let marker = format!(r#"name="{name}" value=""#);
    let start = html.find(&marker).expect("hidden field") + marker.len();
    let end = start + html[start..].find('"').unwrap();
    html[start..end].to_string()
}
