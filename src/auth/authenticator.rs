// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Authenticator variants selected per route prefix.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::claims::{AuthContext, TokenSource};
use super::error::AuthError;
use super::verifier::TokenVerifier;
use crate::oauth::store::SessionStore;

/// Turns a bearer token into an [`AuthContext`].
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Which token family this authenticator accepts.
    fn source(&self) -> TokenSource;

    async fn authenticate(&self, token: &str) -> Result<AuthContext, AuthError>;
}

/// Trusts access tokens signed by the upstream IdP.
pub struct OidcAuthenticator {
    verifier: TokenVerifier,
    required_scope: Option<String>,
}

impl OidcAuthenticator {
    pub fn new(verifier: TokenVerifier, required_scope: Option<String>) -> Self {
        Self {
            verifier,
            required_scope,
        }
    }
}

#[async_trait]
impl Authenticator for OidcAuthenticator {
    fn source(&self) -> TokenSource {
        TokenSource::UpstreamOidc
    }

    async fn authenticate(&self, token: &str) -> Result<AuthContext, AuthError> {
        let claims = self
            .verifier
            .verify(token, self.required_scope.as_deref())
            .await?;
        Ok(AuthContext::from_claims(claims, TokenSource::UpstreamOidc))
    }
}

/// Accepts only session tokens minted by this gateway whose session is still live.
pub struct ProxyAuthenticator {
    verifier: TokenVerifier,
    sessions: Arc<SessionStore>,
    required_scope: Option<String>,
}

impl ProxyAuthenticator {
    pub fn new(
        verifier: TokenVerifier,
        sessions: Arc<SessionStore>,
        required_scope: Option<String>,
    ) -> Self {
        Self {
            verifier,
            sessions,
            required_scope,
        }
    }
}

#[async_trait]
impl Authenticator for ProxyAuthenticator {
    fn source(&self) -> TokenSource {
        TokenSource::ProxySession
    }

    async fn authenticate(&self, token: &str) -> Result<AuthContext, AuthError> {
        let claims = self
            .verifier
            .verify(token, self.required_scope.as_deref())
            .await?;

        let session_id = claims.token_id().ok_or(AuthError::MalformedToken)?;
        let session = self
            .sessions
            .get(session_id)
            .await
            .ok_or(AuthError::SessionNotFound)?;
        if session.subject != claims.subject() {
            debug!(session_id, "Session subject does not match token subject");
            return Err(AuthError::SessionNotFound);
        }

        Ok(AuthContext::from_claims(claims, TokenSource::ProxySession))
    }
}
