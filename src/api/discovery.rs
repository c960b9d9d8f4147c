// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Unauthenticated discovery documents.
//!
//! All documents are built once at startup; serving them does no I/O.

use axum::{
    extract::State,
    http::{header, HeaderValue},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::Value;
use utoipa::ToSchema;

use crate::error::ApiError;
use crate::oauth::pkce::S256;
use crate::oauth::UpstreamEndpoints;
use crate::state::AppState;

pub const AUTHORIZATION_SERVER_PATH: &str = "/.well-known/oauth-authorization-server";
pub const PROTECTED_RESOURCE_PATH: &str = "/.well-known/oauth-protected-resource";
pub const JWKS_PATH: &str = "/.well-known/jwks.json";

/// OAuth 2.0 Authorization Server Metadata (RFC 8414).
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct AuthorizationServerMetadata {
    pub issuer: String,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub registration_endpoint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revocation_endpoint: Option<String>,
    pub jwks_uri: String,
    pub scopes_supported: Vec<String>,
    pub response_types_supported: Vec<String>,
    pub grant_types_supported: Vec<String>,
    pub code_challenge_methods_supported: Vec<String>,
    pub token_endpoint_auth_methods_supported: Vec<String>,
}

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| v.to_string()).collect()
}

impl AuthorizationServerMetadata {
    /// The gateway acting as authorization server.
    pub fn for_proxy(public_url: &str, scopes_supported: Vec<String>, registration: bool) -> Self {
        let base = public_url.trim_end_matches('/');
        Self {
            issuer: base.to_string(),
            authorization_endpoint: format!("{base}/authorize"),
            token_endpoint: format!("{base}/token"),
            registration_endpoint: registration.then(|| format!("{base}/register")),
            revocation_endpoint: Some(format!("{base}/revoke")),
            jwks_uri: format!("{base}{JWKS_PATH}"),
            scopes_supported,
            ..Self::common()
        }
    }

    /// Direct-only mode: clients talk to the upstream IdP themselves.
    pub fn for_upstream(endpoints: &UpstreamEndpoints) -> Self {
        Self {
            issuer: endpoints.issuer.clone(),
            authorization_endpoint: endpoints.authorization_endpoint.clone(),
            token_endpoint: endpoints.token_endpoint.clone(),
            registration_endpoint: endpoints.registration_endpoint.clone(),
            revocation_endpoint: endpoints.revocation_endpoint.clone(),
            jwks_uri: endpoints.jwks_uri.clone(),
            scopes_supported: endpoints.scopes_supported.clone(),
            ..Self::common()
        }
    }

    fn common() -> Self {
        Self {
            issuer: String::new(),
            authorization_endpoint: String::new(),
            token_endpoint: String::new(),
            registration_endpoint: None,
            revocation_endpoint: None,
            jwks_uri: String::new(),
            scopes_supported: Vec::new(),
            response_types_supported: strings(&["code"]),
            grant_types_supported: strings(&["authorization_code", "refresh_token"]),
            code_challenge_methods_supported: strings(&[S256]),
            token_endpoint_auth_methods_supported: strings(&[
                "none",
                "client_secret_post",
                "client_secret_basic",
            ]),
        }
    }
}

/// OAuth 2.0 Protected Resource Metadata (RFC 9728).
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ProtectedResourceMetadata {
    pub resource: String,
    pub authorization_servers: Vec<String>,
    pub bearer_methods_supported: Vec<String>,
    pub scopes_supported: Vec<String>,
}

impl ProtectedResourceMetadata {
    pub fn new(resource: &str, authorization_server: &str, scopes_supported: Vec<String>) -> Self {
        Self {
            resource: resource.to_string(),
            authorization_servers: vec![authorization_server.to_string()],
            bearer_methods_supported: strings(&["header"]),
            scopes_supported,
        }
    }
}

fn cacheable<T: Serialize>(body: T) -> Response {
    let mut response = Json(body).into_response();
    response.headers_mut().insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("public, max-age=3600"),
    );
    response
}

/// Authorization server metadata.
#[utoipa::path(
    get,
    path = "/.well-known/oauth-authorization-server",
    tag = "Discovery",
    responses(
        (status = 200, description = "Authorization server metadata", body = AuthorizationServerMetadata)
    )
)]
pub async fn authorization_server(State(state): State<AppState>) -> Response {
    cacheable(state.metadata.as_ref())
}

/// Protected resource metadata.
#[utoipa::path(
    get,
    path = "/.well-known/oauth-protected-resource",
    tag = "Discovery",
    responses(
        (status = 200, description = "Protected resource metadata", body = ProtectedResourceMetadata)
    )
)]
pub async fn protected_resource(State(state): State<AppState>) -> Response {
    cacheable(state.resource_metadata.as_ref())
}

/// Public keys of session tokens minted by this gateway.
#[utoipa::path(
    get,
    path = "/.well-known/jwks.json",
    tag = "Discovery",
    responses(
        (status = 200, description = "JSON Web Key Set", body = Object),
        (status = 404, description = "Gateway does not issue tokens (direct-only mode)")
    )
)]
pub async fn jwks(State(state): State<AppState>) -> Result<Response, ApiError> {
    let proxy = state
        .proxy
        .as_ref()
        .ok_or_else(|| ApiError::not_found("This gateway does not issue tokens"))?;
    let keys: Value = proxy.issuer().key().jwks();
    Ok(cacheable(keys))
}
