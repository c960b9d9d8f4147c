// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Verified token claims and the per-request authentication context.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::error::AuthError;

/// Clock skew tolerated on `exp`, `iat` and `nbf` (seconds).
pub const CLOCK_SKEW_LEEWAY: i64 = 60;

/// Strip trailing slashes so `https://idp.test/` and `https://idp.test` compare equal.
pub fn normalize_issuer(issuer: &str) -> &str {
    issuer.trim_end_matches('/')
}

/// A claim that IdPs emit either as a single string or as an array.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    fn into_set(self, split_whitespace: bool) -> BTreeSet<String> {
        match self {
            OneOrMany::One(value) if split_whitespace => {
                value.split_whitespace().map(str::to_owned).collect()
            }
            OneOrMany::One(value) => BTreeSet::from([value]),
            OneOrMany::Many(values) => values.into_iter().filter(|v| !v.is_empty()).collect(),
        }
    }
}

/// Registered claims read out of the payload. Everything else stays in the raw map.
#[derive(Debug, Deserialize)]
struct RegisteredClaims {
    iss: Option<String>,
    sub: Option<String>,
    aud: Option<OneOrMany>,
    exp: Option<i64>,
    iat: Option<i64>,
    nbf: Option<i64>,
    jti: Option<String>,
    scope: Option<OneOrMany>,
    /// Azure AD / Okta style scope array
    scp: Option<OneOrMany>,
}

/// Claims of a token whose signature has been verified.
///
/// Immutable once produced: fields are only reachable through getters.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenClaims {
    issuer: String,
    audience: BTreeSet<String>,
    subject: String,
    expires_at: i64,
    issued_at: Option<i64>,
    not_before: Option<i64>,
    token_id: Option<String>,
    scopes: BTreeSet<String>,
    raw: Map<String, Value>,
}

impl TokenClaims {
    /// Parse the registered claims out of a decoded payload.
    ///
    /// `iss`, `sub` and `exp` are mandatory.
    pub fn from_payload(raw: Map<String, Value>) -> Result<Self, AuthError> {
        let registered: RegisteredClaims = serde_json::from_value(Value::Object(raw.clone()))
            .map_err(|_| AuthError::MalformedToken)?;

        let issuer = registered.iss.ok_or(AuthError::MalformedToken)?;
        let subject = registered
            .sub
            .filter(|s| !s.is_empty())
            .ok_or(AuthError::MalformedToken)?;
        let expires_at = registered.exp.ok_or(AuthError::MalformedToken)?;

        let scopes = registered
            .scope
            .or(registered.scp)
            .map(|s| s.into_set(true))
            .unwrap_or_default();

        Ok(Self {
            issuer,
            audience: registered
                .aud
                .map(|a| a.into_set(false))
                .unwrap_or_default(),
            subject,
            expires_at,
            issued_at: registered.iat,
            not_before: registered.nbf,
            token_id: registered.jti,
            scopes,
            raw,
        })
    }

    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    pub fn audience(&self) -> &BTreeSet<String> {
        &self.audience
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Expiry as a Unix timestamp.
    pub fn expires_at(&self) -> i64 {
        self.expires_at
    }

    pub fn issued_at(&self) -> Option<i64> {
        self.issued_at
    }

    /// The `jti` claim. For proxy-issued tokens this is the session id.
    pub fn token_id(&self) -> Option<&str> {
        self.token_id.as_deref()
    }

    pub fn scopes(&self) -> &BTreeSet<String> {
        &self.scopes
    }

    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.contains(scope)
    }

    /// Fail with `InsufficientScope` unless `scope` was granted.
    pub fn require_scope(&self, scope: &str) -> Result<(), AuthError> {
        if self.has_scope(scope) {
            Ok(())
        } else {
            Err(AuthError::InsufficientScope {
                required: scope.to_string(),
            })
        }
    }

    /// Full payload, including custom claims.
    pub fn raw(&self) -> &Map<String, Value> {
        &self.raw
    }
}

/// Issuer, audience and time-window rules applied after signature verification.
#[derive(Debug, Clone)]
pub struct ClaimRules {
    issuer: String,
    audience: String,
    leeway: i64,
}

impl ClaimRules {
    pub fn new(issuer: impl AsRef<str>, audience: impl Into<String>) -> Self {
        Self {
            issuer: normalize_issuer(issuer.as_ref()).to_string(),
            audience: audience.into(),
            leeway: CLOCK_SKEW_LEEWAY,
        }
    }

    pub fn with_leeway(mut self, leeway_secs: i64) -> Self {
        self.leeway = leeway_secs;
        self
    }

    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    pub fn audience(&self) -> &str {
        &self.audience
    }

    /// Check the claims against these rules at `now` (Unix seconds).
    pub fn check(&self, claims: &TokenClaims, now: i64) -> Result<(), AuthError> {
        if normalize_issuer(&claims.issuer) != self.issuer {
            return Err(AuthError::InvalidIssuer);
        }
        if !claims.audience.contains(&self.audience) {
            return Err(AuthError::InvalidAudience);
        }
        if claims.expires_at <= now - self.leeway {
            return Err(AuthError::TokenExpired);
        }
        let horizon = now + self.leeway;
        if claims.issued_at.is_some_and(|iat| iat > horizon)
            || claims.not_before.is_some_and(|nbf| nbf > horizon)
        {
            return Err(AuthError::TokenNotYetValid);
        }
        Ok(())
    }
}

/// Which authenticator accepted the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenSource {
    /// Token issued and signed by the upstream IdP
    UpstreamOidc,
    /// Session token minted by this gateway's OAuth proxy
    ProxySession,
}

impl TokenSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenSource::UpstreamOidc => "upstream_oidc",
            TokenSource::ProxySession => "proxy_session",
        }
    }
}

/// Authenticated caller, attached to the request for downstream handlers.
///
/// Lives for one request and is never persisted.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub subject: String,
    pub scopes: BTreeSet<String>,
    pub raw_claims: Map<String, Value>,
    pub source: TokenSource,
    /// Session id when the token was minted by the proxy
    pub session_id: Option<String>,
}

impl AuthContext {
    pub fn from_claims(claims: TokenClaims, source: TokenSource) -> Self {
        let session_id = match source {
            TokenSource::ProxySession => claims.token_id.clone(),
            TokenSource::UpstreamOidc => None,
        };
        Self {
            subject: claims.subject,
            scopes: claims.scopes,
            raw_claims: claims.raw,
            source,
            session_id,
        }
    }

    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.contains(scope)
    }

    pub fn require_scope(&self, scope: &str) -> Result<(), AuthError> {
        if self.has_scope(scope) {
            Ok(())
        } else {
            Err(AuthError::InsufficientScope {
                required: scope.to_string(),
            })
        }
    }
}
