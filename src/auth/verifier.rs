// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Bearer token verification.
//!
//! The header is inspected before any key is touched: only allow-listed
//! algorithms proceed, and `alg` never selects anything beyond that check.
//! Signature verification is delegated to `jsonwebtoken`; issuer, audience,
//! time-window and scope rules are applied by [`ClaimRules`] afterwards.

use std::collections::HashSet;
use std::str::FromStr;
use std::sync::Arc;

use base64ct::{Base64UrlUnpadded, Encoding};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, Algorithm, Validation};
use serde::Deserialize;
use serde_json::{Map, Value};

use super::claims::{ClaimRules, TokenClaims};
use super::error::AuthError;
use super::jwks::{KeyCache, VerificationKey};

/// Algorithms accepted from the upstream IdP unless configured otherwise.
pub const DEFAULT_ALLOWED_ALGORITHMS: [Algorithm; 2] = [Algorithm::RS256, Algorithm::ES256];

/// Where verification keys come from.
#[derive(Clone)]
pub enum KeySource {
    /// Keys published by an issuer, resolved through the shared cache
    Jwks { cache: Arc<KeyCache>, issuer: String },
    /// A single key known in-process (the gateway's own session key)
    Fixed(VerificationKey),
}

impl KeySource {
    async fn resolve(&self, kid: &str) -> Result<VerificationKey, AuthError> {
        match self {
            KeySource::Jwks { cache, issuer } => Ok(cache.get_key(issuer, kid).await?),
            KeySource::Fixed(key) if key.kid == kid => Ok(key.clone()),
            KeySource::Fixed(_) => Err(AuthError::NoMatchingKey),
        }
    }
}

/// JOSE header fields read before verification. Untrusted.
#[derive(Debug, Deserialize)]
struct UnverifiedHeader {
    alg: String,
    #[serde(default)]
    kid: Option<String>,
}

fn parse_unverified_header(token: &str) -> Result<UnverifiedHeader, AuthError> {
    let mut segments = token.split('.');
    let (Some(header), Some(_payload), Some(_signature), None) = (
        segments.next(),
        segments.next(),
        segments.next(),
        segments.next(),
    ) else {
        return Err(AuthError::MalformedToken);
    };

    let bytes = Base64UrlUnpadded::decode_vec(header).map_err(|_| AuthError::MalformedToken)?;
    serde_json::from_slice(&bytes).map_err(|_| AuthError::MalformedToken)
}

/// Verifies compact JWS tokens against one issuer's rules and keys.
#[derive(Clone)]
pub struct TokenVerifier {
    rules: ClaimRules,
    allowed: Vec<Algorithm>,
    keys: KeySource,
}

impl TokenVerifier {
    pub fn new(rules: ClaimRules, keys: KeySource) -> Self {
        Self {
            rules,
            allowed: DEFAULT_ALLOWED_ALGORITHMS.to_vec(),
            keys,
        }
    }

    /// Replace the algorithm allow-list.
    pub fn with_allowed_algorithms(mut self, algorithms: impl IntoIterator<Item = Algorithm>) -> Self {
        self.allowed = algorithms.into_iter().collect();
        self
    }

    pub fn rules(&self) -> &ClaimRules {
        &self.rules
    }

    pub fn allowed_algorithms(&self) -> &[Algorithm] {
        &self.allowed
    }

    /// Verify `token` now, optionally requiring `required_scope`.
    pub async fn verify(
        &self,
        token: &str,
        required_scope: Option<&str>,
    ) -> Result<TokenClaims, AuthError> {
        self.verify_at(token, required_scope, chrono::Utc::now().timestamp())
            .await
    }

    /// Verify `token` as of `now` (Unix seconds).
    pub async fn verify_at(
        &self,
        token: &str,
        required_scope: Option<&str>,
        now: i64,
    ) -> Result<TokenClaims, AuthError> {
        let header = parse_unverified_header(token)?;

        let algorithm = Algorithm::from_str(&header.alg)
            .ok()
            .filter(|alg| self.allowed.contains(alg))
            .ok_or_else(|| AuthError::DisallowedAlgorithm(header.alg.clone()))?;

        let kid = header.kid.ok_or(AuthError::NoMatchingKey)?;
        let key = self.keys.resolve(&kid).await?;

        if key.algorithm.is_some_and(|pinned| pinned != algorithm) {
            return Err(AuthError::InvalidSignature);
        }

        let data = decode::<Map<String, Value>>(token, &key.key, &signature_only(algorithm))
            .map_err(|e| match e.kind() {
                ErrorKind::InvalidSignature
                | ErrorKind::InvalidAlgorithm
                | ErrorKind::InvalidKeyFormat => AuthError::InvalidSignature,
                _ => AuthError::MalformedToken,
            })?;

        let claims = TokenClaims::from_payload(data.claims)?;
        self.rules.check(&claims, now)?;
        if let Some(scope) = required_scope {
            claims.require_scope(scope)?;
        }
        Ok(claims)
    }
}

/// Validation that checks the signature only; claims are checked by [`ClaimRules`].
fn signature_only(algorithm: Algorithm) -> Validation {
    let mut validation = Validation::new(algorithm);
    validation.validate_exp = false;
    validation.validate_nbf = false;
    validation.validate_aud = false;
    validation.required_spec_claims = HashSet::new();
    validation
}
