// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Authentication middleware for Axum.
//!
//! Applied to an entire router subtree with the authenticator chosen for that
//! subtree:
//!
//! ```rust,ignore
//! let protected = Router::new()
//!     .route("/whoami", get(whoami))
//!     .layer(axum::middleware::from_fn_with_state(layer, require_auth));
//! ```
//!
//! Public routes are mounted outside the layered subtree; the layer itself
//! has no exemptions.
//!
//! Every request either proceeds with an [`AuthContext`] in its extensions or
//! is answered with a 401/403/503 challenge. Verification is attempted once;
//! failures are never cached or retried.

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{header::AUTHORIZATION, HeaderMap},
    middleware::Next,
    response::Response,
};
use tracing::{debug, warn};

use super::authenticator::Authenticator;
use super::claims::AuthContext;
use super::error::{AuthError, DEFAULT_REALM};

/// Authentication configuration for one router subtree.
#[derive(Clone)]
pub struct AuthLayer {
    authenticator: Arc<dyn Authenticator>,
    realm: Arc<str>,
    resource_metadata: Option<Arc<str>>,
}

impl AuthLayer {
    pub fn new(authenticator: Arc<dyn Authenticator>) -> Self {
        Self {
            authenticator,
            realm: Arc::from(DEFAULT_REALM),
            resource_metadata: None,
        }
    }

    pub fn with_realm(mut self, realm: impl AsRef<str>) -> Self {
        self.realm = Arc::from(realm.as_ref());
        self
    }

    /// URL of the protected resource metadata, advertised in challenges.
    pub fn with_resource_metadata(mut self, url: impl AsRef<str>) -> Self {
        self.resource_metadata = Some(Arc::from(url.as_ref()));
        self
    }

    fn reject(&self, path: &str, err: AuthError) -> Response {
        match err.status_code().as_u16() {
            500..=599 => warn!(
                path,
                authenticator = self.authenticator.source().as_str(),
                reason = err.error_code(),
                detail = %err,
                "Authentication could not be completed"
            ),
            _ => warn!(
                path,
                authenticator = self.authenticator.source().as_str(),
                reason = err.error_code(),
                "Authentication rejected"
            ),
        }
        err.into_challenge_response(&self.realm, self.resource_metadata.as_deref())
    }
}

/// Extract the bearer token from `Authorization`.
///
/// The scheme is matched case-insensitively; the token must be a single
/// non-empty word.
pub fn bearer_token(headers: &HeaderMap) -> Result<&str, AuthError> {
    let value = headers
        .get(AUTHORIZATION)
        .ok_or(AuthError::MissingAuthHeader)?
        .to_str()
        .map_err(|_| AuthError::InvalidAuthHeader)?;

    let (scheme, token) = value
        .trim()
        .split_once(' ')
        .ok_or(AuthError::InvalidAuthHeader)?;
    let token = token.trim();

    if !scheme.eq_ignore_ascii_case("bearer")
        || token.is_empty()
        || token.contains(char::is_whitespace)
    {
        return Err(AuthError::InvalidAuthHeader);
    }
    Ok(token)
}

/// Authentication middleware function.
pub async fn require_auth(
    State(layer): State<AuthLayer>,
    mut request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_owned();

    let token = match bearer_token(request.headers()) {
        Ok(token) => token.to_owned(),
        Err(e) => return layer.reject(&path, e),
    };

    match layer.authenticator.authenticate(&token).await {
        Ok(context) => {
            debug!(
                path,
                subject = %context.subject,
                authenticator = context.source.as_str(),
                "Request authenticated"
            );
            request.extensions_mut().insert::<AuthContext>(context);
            next.run(request).await
        }
        Err(e) => layer.reject(&path, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn extracts_bearer_token() {
        assert_eq!(bearer_token(&headers("Bearer abc.def.ghi")), Ok("abc.def.ghi"));
        assert_eq!(bearer_token(&headers("bearer abc")), Ok("abc"));
    }

    #[test]
    fn missing_header_is_distinct_from_garbled_header() {
        assert_eq!(
            bearer_token(&HeaderMap::new()),
            Err(AuthError::MissingAuthHeader)
        );
        for value in ["Basic dXNlcjpwYXNz", "Bearer", "Bearer ", "Bearer a b", "abc"] {
            assert_eq!(
                bearer_token(&headers(value)),
                Err(AuthError::InvalidAuthHeader),
                "header {value:?}"
            );
        }
    }
}
