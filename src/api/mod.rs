// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # HTTP API
//!
//! Unauthenticated surface of the gateway: health probes, discovery
//! documents and (in proxy mode) the OAuth endpoints. Protected routes are
//! composed by [`crate::gateway::AuthGateway`].

use axum::{routing::get, Router};
use utoipa::{
    openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme},
    Modify, OpenApi,
};
use utoipa_swagger_ui::SwaggerUi;

use crate::state::AppState;

pub mod discovery;
pub mod health;
pub mod identity;
pub mod oauth;

pub fn router(state: AppState) -> Router {
    let mut router = Router::new()
        .route("/health", get(health::liveness))
        .route("/health/ready", get(health::readiness))
        .route(
            discovery::AUTHORIZATION_SERVER_PATH,
            get(discovery::authorization_server),
        )
        .route(
            discovery::PROTECTED_RESOURCE_PATH,
            get(discovery::protected_resource),
        )
        .route(discovery::JWKS_PATH, get(discovery::jwks))
        .with_state(state.clone());

    if let Some(proxy) = state.proxy {
        router = router.merge(oauth::router(proxy));
    }

    router.merge(SwaggerUi::new("/docs").url("/api-doc/openapi.json", ApiDoc::openapi()))
}

struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer_auth",
                SecurityScheme::Http(
                    HttpBuilder::new()
                        .scheme(HttpAuthScheme::Bearer)
                        .bearer_format("JWT")
                        .build(),
                ),
            );
        }
    }
}

#[derive(OpenApi)]
#[openapi(
    paths(
        health::liveness,
        health::readiness,
        discovery::authorization_server,
        discovery::protected_resource,
        discovery::jwks,
        oauth::authorize,
        oauth::consent,
        oauth::callback,
        oauth::token,
        oauth::register,
        oauth::revoke,
        identity::whoami
    ),
    components(
        schemas(
            health::ReadyResponse,
            health::HealthChecks,
            health::HealthResponse,
            discovery::AuthorizationServerMetadata,
            discovery::ProtectedResourceMetadata,
            oauth::ConsentForm,
            oauth::RevokeRequest,
            crate::oauth::TokenRequest,
            crate::oauth::TokenResponse,
            crate::oauth::error::OAuthErrorBody,
            crate::oauth::OAuthErrorCode,
            identity::WhoAmIResponse
        )
    ),
    modifiers(&SecurityAddon),
    tags(
        (name = "Health", description = "Liveness and readiness probes"),
        (name = "Discovery", description = "OAuth metadata and signing keys"),
        (name = "OAuth", description = "Authorization code + PKCE issuance proxy"),
        (name = "Identity", description = "Authenticated caller (mounted under both route prefixes)")
    )
)]
pub struct ApiDoc;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn openapi_documents_public_surface() {
        let doc = ApiDoc::openapi();
        for path in [
            "/health",
            "/.well-known/oauth-authorization-server",
            "/token",
            "/whoami",
        ] {
            assert!(doc.paths.paths.contains_key(path), "{path}");
        }
    }
}
