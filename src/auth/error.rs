// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Authentication errors.

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

/// Seconds advertised in `Retry-After` when the key source is unavailable.
pub const RETRY_AFTER_SECS: u64 = 5;

/// Default realm used in `WWW-Authenticate` challenges.
pub const DEFAULT_REALM: &str = "cnpg-gateway";

/// Authentication error type.
///
/// Each variant is a distinct reason code for logging. Clients only ever see
/// the coarse [`AuthErrorKind`] rendered as a generic OAuth bearer error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// No authorization header present
    MissingAuthHeader,
    /// Authorization header is not `Bearer <token>`
    InvalidAuthHeader,
    /// Token is not a well-formed JWS compact serialization
    MalformedToken,
    /// `alg` header is not on the allow-list
    DisallowedAlgorithm(String),
    /// Token signature is invalid
    InvalidSignature,
    /// No key matches the token's `kid`
    NoMatchingKey,
    /// Token has expired
    TokenExpired,
    /// `iat` or `nbf` lies in the future
    TokenNotYetValid,
    /// Token issuer is invalid
    InvalidIssuer,
    /// Token audience is invalid
    InvalidAudience,
    /// The token does not carry the scope required by the route
    InsufficientScope { required: String },
    /// The session behind a proxy-issued token is gone (expired or revoked)
    SessionNotFound,
    /// JWKS or IdP could not be reached in time
    UpstreamUnavailable(String),
    /// Internal error
    InternalError(String),
}

/// Error taxonomy exposed to callers and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthErrorKind {
    MalformedRequest,
    ExpiredToken,
    InvalidSignature,
    InvalidIssuer,
    InvalidAudience,
    InsufficientScope,
    UpstreamUnavailable,
    Internal,
}

#[derive(Serialize)]
struct AuthErrorBody {
    error: &'static str,
    error_description: &'static str,
}

impl AuthError {
    /// Get the reason code for this error (used in logs, never in responses).
    pub fn error_code(&self) -> &'static str {
        match self {
            AuthError::MissingAuthHeader => "missing_auth_header",
            AuthError::InvalidAuthHeader => "invalid_auth_header",
            AuthError::MalformedToken => "malformed_token",
            AuthError::DisallowedAlgorithm(_) => "disallowed_algorithm",
            AuthError::InvalidSignature => "invalid_signature",
            AuthError::NoMatchingKey => "no_matching_key",
            AuthError::TokenExpired => "token_expired",
            AuthError::TokenNotYetValid => "token_not_yet_valid",
            AuthError::InvalidIssuer => "invalid_issuer",
            AuthError::InvalidAudience => "invalid_audience",
            AuthError::InsufficientScope { .. } => "insufficient_scope",
            AuthError::SessionNotFound => "session_not_found",
            AuthError::UpstreamUnavailable(_) => "upstream_unavailable",
            AuthError::InternalError(_) => "internal_error",
        }
    }

    /// Map the reason to its taxonomy kind.
    pub fn kind(&self) -> AuthErrorKind {
        match self {
            AuthError::MissingAuthHeader | AuthError::InvalidAuthHeader | AuthError::MalformedToken => {
                AuthErrorKind::MalformedRequest
            }
            AuthError::DisallowedAlgorithm(_)
            | AuthError::InvalidSignature
            | AuthError::NoMatchingKey => AuthErrorKind::InvalidSignature,
            AuthError::TokenExpired | AuthError::TokenNotYetValid | AuthError::SessionNotFound => {
                AuthErrorKind::ExpiredToken
            }
            AuthError::InvalidIssuer => AuthErrorKind::InvalidIssuer,
            AuthError::InvalidAudience => AuthErrorKind::InvalidAudience,
            AuthError::InsufficientScope { .. } => AuthErrorKind::InsufficientScope,
            AuthError::UpstreamUnavailable(_) => AuthErrorKind::UpstreamUnavailable,
            AuthError::InternalError(_) => AuthErrorKind::Internal,
        }
    }

    /// Get the HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self.kind() {
            AuthErrorKind::MalformedRequest
            | AuthErrorKind::ExpiredToken
            | AuthErrorKind::InvalidSignature
            | AuthErrorKind::InvalidIssuer
            | AuthErrorKind::InvalidAudience => StatusCode::UNAUTHORIZED,
            AuthErrorKind::InsufficientScope => StatusCode::FORBIDDEN,
            AuthErrorKind::UpstreamUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            AuthErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// RFC 6750 error code and a generic description that leaks nothing
    /// about which check failed.
    fn bearer_error(&self) -> (&'static str, &'static str) {
        match self.kind() {
            AuthErrorKind::MalformedRequest => {
                ("invalid_request", "Missing or malformed bearer token")
            }
            AuthErrorKind::ExpiredToken
            | AuthErrorKind::InvalidSignature
            | AuthErrorKind::InvalidIssuer
            | AuthErrorKind::InvalidAudience => {
                ("invalid_token", "The access token is invalid or has expired")
            }
            AuthErrorKind::InsufficientScope => (
                "insufficient_scope",
                "The access token does not grant the required scope",
            ),
            AuthErrorKind::UpstreamUnavailable => (
                "temporarily_unavailable",
                "Token verification is temporarily unavailable",
            ),
            AuthErrorKind::Internal => ("server_error", "Internal authentication error"),
        }
    }

    /// Build the `WWW-Authenticate` challenge for this error.
    ///
    /// A request that carried no credentials gets a bare challenge without an
    /// error code (RFC 6750 §3.1). Returns `None` for non-auth failures.
    pub fn www_authenticate(&self, realm: &str, resource_metadata: Option<&str>) -> Option<String> {
        let mut challenge = format!("Bearer realm=\"{realm}\"");
        if let Some(url) = resource_metadata {
            challenge.push_str(&format!(", resource_metadata=\"{url}\""));
        }

        match self {
            AuthError::MissingAuthHeader => Some(challenge),
            AuthError::UpstreamUnavailable(_) | AuthError::InternalError(_) => None,
            AuthError::InsufficientScope { required } => {
                let (code, description) = self.bearer_error();
                Some(format!(
                    "{challenge}, error=\"{code}\", error_description=\"{description}\", scope=\"{required}\""
                ))
            }
            _ => {
                let (code, description) = self.bearer_error();
                Some(format!(
                    "{challenge}, error=\"{code}\", error_description=\"{description}\""
                ))
            }
        }
    }

    /// Render the error with a challenge for the given realm.
    pub fn into_challenge_response(self, realm: &str, resource_metadata: Option<&str>) -> Response {
        let status = self.status_code();
        let (error, error_description) = self.bearer_error();
        let mut response = (
            status,
            Json(AuthErrorBody {
                error,
                error_description,
            }),
        )
            .into_response();

        let headers = response.headers_mut();
        if let Some(challenge) = self.www_authenticate(realm, resource_metadata) {
            if let Ok(value) = HeaderValue::from_str(&challenge) {
                headers.insert(header::WWW_AUTHENTICATE, value);
            }
        }
        if status == StatusCode::SERVICE_UNAVAILABLE {
            headers.insert(header::RETRY_AFTER, HeaderValue::from(RETRY_AFTER_SECS));
        }
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
        response
    }
}

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthError::MissingAuthHeader => write!(f, "Authorization header is required"),
            AuthError::InvalidAuthHeader => {
                write!(f, "Invalid authorization header format (expected 'Bearer <token>')")
            }
            AuthError::MalformedToken => write!(f, "Token is malformed"),
            AuthError::DisallowedAlgorithm(alg) => {
                write!(f, "Token algorithm '{alg}' is not allowed")
            }
            AuthError::InvalidSignature => write!(f, "Token signature is invalid"),
            AuthError::NoMatchingKey => write!(f, "No matching key found in JWKS"),
            AuthError::TokenExpired => write!(f, "Token has expired"),
            AuthError::TokenNotYetValid => write!(f, "Token is not yet valid"),
            AuthError::InvalidIssuer => write!(f, "Token issuer is invalid"),
            AuthError::InvalidAudience => write!(f, "Token audience is invalid"),
            AuthError::InsufficientScope { required } => {
                write!(f, "Token lacks required scope '{required}'")
            }
            AuthError::SessionNotFound => write!(f, "Session expired or revoked"),
            AuthError::UpstreamUnavailable(msg) => write!(f, "Key source unavailable: {msg}"),
            AuthError::InternalError(msg) => write!(f, "Internal authentication error: {msg}"),
        }
    }
}

impl std::error::Error for AuthError {}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        self.into_challenge_response(DEFAULT_REALM, None)
    }
}
