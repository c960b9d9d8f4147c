// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Axum extractor for the authenticated caller.
//!
//! Use the `Auth` extractor in handlers mounted behind [`require_auth`]:
//!
//! ```rust,ignore
//! async fn list_clusters(Auth(caller): Auth) -> impl IntoResponse {
//!     // caller.subject, caller.scopes, caller.raw_claims
//! }
//! ```
//!
//! [`require_auth`]: super::middleware::require_auth

use axum::{extract::FromRequestParts, http::request::Parts};

use super::claims::AuthContext;
use super::error::AuthError;

/// Extractor for the [`AuthContext`] attached by the auth middleware.
///
/// Handlers reached without the middleware reject with 401, so a missing
/// layer fails closed.
pub struct Auth(pub AuthContext);

impl Auth {
    /// Per-operation scope check for handlers that need more than the route scope.
    pub fn require_scope(&self, scope: &str) -> Result<(), AuthError> {
        self.0.require_scope(scope)
    }
}

impl<S> FromRequestParts<S> for Auth
where
    S: Send + Sync,
{
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .remove::<AuthContext>()
            .map(Auth)
            .ok_or(AuthError::MissingAuthHeader)
    }
}
