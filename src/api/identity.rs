// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Minimal downstream handler: echoes the authenticated caller.

use axum::{routing::get, Json, Router};
use serde::Serialize;
use serde_json::{Map, Value};
use utoipa::ToSchema;

use crate::auth::Auth;

#[derive(Debug, Serialize, ToSchema)]
pub struct WhoAmIResponse {
    pub subject: String,
    pub scopes: Vec<String>,
    /// `upstream_oidc` or `proxy_session`
    pub source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[schema(value_type = Object)]
    pub claims: Map<String, Value>,
}

/// Routes served behind either authenticator.
pub fn router() -> Router {
    Router::new().route("/whoami", get(whoami))
}

/// Describe the caller the gateway authenticated.
#[utoipa::path(
    get,
    path = "/whoami",
    tag = "Identity",
    responses(
        (status = 200, description = "Authenticated caller", body = WhoAmIResponse),
        (status = 401, description = "Missing or invalid bearer token"),
        (status = 403, description = "Required scope missing")
    ),
    security(("bearer_auth" = []))
)]
pub async fn whoami(Auth(caller): Auth) -> Json<WhoAmIResponse> {
    Json(WhoAmIResponse {
        subject: caller.subject,
        scopes: caller.scopes.into_iter().collect(),
        source: caller.source.as_str().to_string(),
        session_id: caller.session_id,
        claims: caller.raw_claims,
    })
}
