// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! OAuth endpoints of the issuance proxy.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Form, Json, Router,
};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use base64ct::{Base64, Encoding};
use serde::Deserialize;
use serde_json::Value;
use url::Url;
use utoipa::ToSchema;

use crate::oauth::proxy::{ConsentPrompt, CALLBACK_PATH};
use crate::oauth::{
    AuthorizeOutcome, AuthorizeRequest, CallbackParams, OAuthError, OAuthProxy, TokenRequest,
    TokenResponse,
};

pub const AUTHORIZE_PATH: &str = "/authorize";
pub const CONSENT_PATH: &str = "/authorize/consent";
pub const TOKEN_PATH: &str = "/token";
pub const REGISTER_PATH: &str = "/register";
pub const REVOKE_PATH: &str = "/revoke";

/// Consent cookie name over HTTPS; the `__Host-` prefix pins it to this origin.
pub const CONSENT_COOKIE_SECURE: &str = "__Host-cnpg_consent";
/// Consent cookie name when the gateway is served over plain HTTP.
pub const CONSENT_COOKIE: &str = "cnpg_consent";

/// Routes of the authorization server. `/register` only when DCR is enabled.
pub fn router(proxy: Arc<OAuthProxy>) -> Router {
    let mut router = Router::new()
        .route(AUTHORIZE_PATH, get(authorize))
        .route(CONSENT_PATH, post(consent))
        .route(CALLBACK_PATH, get(callback))
        .route(TOKEN_PATH, post(token))
        .route(REVOKE_PATH, post(revoke));
    if proxy.registration_enabled() {
        router = router.route(REGISTER_PATH, post(register));
    }
    router.with_state(proxy)
}

/// Form posted by the consent page.
#[derive(Debug, Deserialize, ToSchema)]
pub struct ConsentForm {
    pub state: String,
    /// Must match the consent cookie
    #[serde(default)]
    pub csrf_token: String,
    /// `approve` or `deny`
    pub decision: String,
}

/// RFC 7009 revocation request.
#[derive(Debug, Deserialize, ToSchema)]
pub struct RevokeRequest {
    pub token: String,
    #[serde(default)]
    pub token_type_hint: Option<String>,
}

fn consent_cookie_name(public_url: &str) -> &'static str {
    if public_url.starts_with("https://") {
        CONSENT_COOKIE_SECURE
    } else {
        CONSENT_COOKIE
    }
}

fn consent_cookie(public_url: &str, value: String) -> Cookie<'static> {
    let name = consent_cookie_name(public_url);
    Cookie::build((name, value))
        .http_only(true)
        .secure(name == CONSENT_COOKIE_SECURE)
        .same_site(SameSite::Strict)
        .path("/")
        .build()
}

fn found(url: Url) -> Response {
    (StatusCode::FOUND, [(header::LOCATION, url.to_string())]).into_response()
}

fn no_store(mut response: Response) -> Response {
    let headers = response.headers_mut();
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
    response
}

/// Start an authorization code flow.
#[utoipa::path(
    get,
    path = "/authorize",
    tag = "OAuth",
    params(AuthorizeRequest),
    responses(
        (status = 200, description = "Consent page", content_type = "text/html"),
        (status = 302, description = "Redirect to the identity provider or back to the client"),
        (status = 400, description = "Invalid client or redirect URI", body = crate::oauth::error::OAuthErrorBody)
    )
)]
pub async fn authorize(
    State(proxy): State<Arc<OAuthProxy>>,
    Query(request): Query<AuthorizeRequest>,
) -> Result<Response, OAuthError> {
    Ok(match proxy.authorize(request).await? {
        AuthorizeOutcome::Consent(prompt) => {
            let jar = CookieJar::new().add(consent_cookie(
                &proxy.settings().public_url,
                prompt.csrf_token.clone(),
            ));
            (jar, consent_page(&prompt)).into_response()
        }
        AuthorizeOutcome::Redirect(url) => found(url),
    })
}

/// Record the user's consent decision.
#[utoipa::path(
    post,
    path = "/authorize/consent",
    tag = "OAuth",
    request_body(content = ConsentForm, content_type = "application/x-www-form-urlencoded"),
    responses(
        (status = 302, description = "Redirect to the identity provider or back to the client"),
        (status = 400, description = "Unknown, already decided, or cross-site request", body = crate::oauth::error::OAuthErrorBody)
    )
)]
pub async fn consent(
    State(proxy): State<Arc<OAuthProxy>>,
    jar: CookieJar,
    Form(form): Form<ConsentForm>,
) -> Result<Response, OAuthError> {
    let approve = form.decision == "approve";
    let name = consent_cookie_name(&proxy.settings().public_url);
    let cookie = jar.get(name).map(|c| c.value().to_owned());
    let url = proxy.consent(&form.state, approve, &form.csrf_token, cookie.as_deref())?;
    let jar = jar.remove(Cookie::build(name).path("/"));
    Ok((jar, found(url)).into_response())
}

/// Redirect target of the identity provider.
#[utoipa::path(
    get,
    path = "/auth/callback",
    tag = "OAuth",
    params(CallbackParams),
    responses(
        (status = 302, description = "Redirect back to the client with a proxy code"),
        (status = 400, description = "Unknown or replayed state", body = crate::oauth::error::OAuthErrorBody)
    )
)]
pub async fn callback(
    State(proxy): State<Arc<OAuthProxy>>,
    Query(params): Query<CallbackParams>,
) -> Result<Response, OAuthError> {
    proxy.callback(params).map(found)
}

/// Exchange an authorization code or refresh token for a session token.
#[utoipa::path(
    post,
    path = "/token",
    tag = "OAuth",
    request_body(content = TokenRequest, content_type = "application/x-www-form-urlencoded"),
    responses(
        (status = 200, description = "Session token issued", body = TokenResponse),
        (status = 400, description = "Invalid grant or request", body = crate::oauth::error::OAuthErrorBody),
        (status = 503, description = "Identity provider unavailable", body = crate::oauth::error::OAuthErrorBody)
    )
)]
pub async fn token(
    State(proxy): State<Arc<OAuthProxy>>,
    headers: HeaderMap,
    Form(mut request): Form<TokenRequest>,
) -> Result<Response, OAuthError> {
    if request.client_id.is_none() {
        request.client_id = basic_client_id(&headers);
    }
    let response = proxy.token(request).await?;
    Ok(no_store(Json(response).into_response()))
}

/// Client id from `Authorization: Basic` (client_secret_basic).
fn basic_client_id(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, encoded) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }
    let decoded = Base64::decode_vec(encoded.trim()).ok()?;
    let credentials = String::from_utf8(decoded).ok()?;
    let (client_id, _) = credentials.split_once(':')?;
    Some(client_id.to_string()).filter(|id| !id.is_empty())
}

/// Dynamic client registration passthrough (RFC 7591).
#[utoipa::path(
    post,
    path = "/register",
    tag = "OAuth",
    request_body(content = Object, content_type = "application/json"),
    responses(
        (status = 201, description = "Client registered", body = Object),
        (status = 400, description = "Invalid client metadata", body = crate::oauth::error::OAuthErrorBody)
    )
)]
pub async fn register(
    State(proxy): State<Arc<OAuthProxy>>,
    Json(metadata): Json<Value>,
) -> Result<Response, OAuthError> {
    let body = proxy.register(metadata).await?;
    Ok(no_store((StatusCode::CREATED, Json(body)).into_response()))
}

/// Token revocation (RFC 7009). Always 200.
#[utoipa::path(
    post,
    path = "/revoke",
    tag = "OAuth",
    request_body(content = RevokeRequest, content_type = "application/x-www-form-urlencoded"),
    responses(
        (status = 200, description = "Token revoked or unknown")
    )
)]
pub async fn revoke(
    State(proxy): State<Arc<OAuthProxy>>,
    Form(request): Form<RevokeRequest>,
) -> StatusCode {
    proxy.revoke(&request.token).await;
    StatusCode::OK
}

fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            _ => out.push(c),
        }
    }
    out
}

fn consent_page(prompt: &ConsentPrompt) -> Response {
    let client = escape_html(prompt.client_name.as_deref().unwrap_or(&prompt.client_id));
    let redirect = escape_html(&prompt.redirect_uri);
    let state = escape_html(&prompt.state);
    let csrf = escape_html(&prompt.csrf_token);
    let scopes: String = prompt
        .scopes
        .iter()
        .map(|s| format!("<li><code>{}</code></li>", escape_html(s)))
        .collect();

    let page = format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head><meta charset="utf-8"><title>Authorize {client}</title></head>
<body>
<h1>Authorize {client}</h1>
<p>{client} wants to access the PostgreSQL operations API on your behalf.</p>
<p>Requested scopes:</p>
<ul>{scopes}</ul>
<p>You will be redirected to <code>{redirect}</code>.</p>
<form method="post" action="{CONSENT_PATH}">
<input type="hidden" name="state" value="{state}">
<input type="hidden" name="csrf_token" value="{csrf}">
<button type="submit" name="decision" value="approve">Approve</button>
<button type="submit" name="decision" value="deny">Deny</button>
</form>
</body>
</html>"#
    );

    let mut response = no_store(Html(page).into_response());
    let headers = response.headers_mut();
    headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
    headers.insert(
        header::CONTENT_SECURITY_POLICY,
        HeaderValue::from_static("default-src 'none'; form-action 'self'; frame-ancestors 'none'"),
    );
    response
}
