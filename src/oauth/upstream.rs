// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Server-to-server client for the upstream OIDC identity provider.

use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};
use url::Url;

use super::pkce::S256;

#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("upstream request failed: {0}")]
    Transport(String),
    #[error("upstream request timed out")]
    Timeout,
    #[error("upstream rejected the request with HTTP {status} ({code})")]
    Rejected { status: u16, code: String },
    #[error("upstream response was invalid: {0}")]
    InvalidResponse(String),
    #[error("upstream endpoint not configured: {0}")]
    NotConfigured(&'static str),
}

impl UpstreamError {
    /// Outage rather than a verdict on the request; retrying later may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            UpstreamError::Transport(_) | UpstreamError::Timeout => true,
            UpstreamError::Rejected { status, .. } => *status >= 500,
            UpstreamError::InvalidResponse(_) | UpstreamError::NotConfigured(_) => false,
        }
    }
}

impl From<reqwest::Error> for UpstreamError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            UpstreamError::Timeout
        } else if err.is_decode() {
            UpstreamError::InvalidResponse(err.to_string())
        } else {
            UpstreamError::Transport(err.to_string())
        }
    }
}

/// Scopes may arrive as a space-delimited string or an array.
fn deserialize_scopes<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringOrVec {
        String(String),
        Vec(Vec<String>),
    }

    match Option::<StringOrVec>::deserialize(deserializer)? {
        Some(StringOrVec::String(s)) => Ok(s.split_whitespace().map(String::from).collect()),
        Some(StringOrVec::Vec(v)) => Ok(v),
        None => Ok(Vec::new()),
    }
}

/// Subset of the OpenID Provider configuration document we consume.
#[derive(Debug, Deserialize)]
struct OpenIdConfiguration {
    #[serde(default)]
    authorization_endpoint: Option<String>,
    #[serde(default)]
    token_endpoint: Option<String>,
    #[serde(default)]
    jwks_uri: Option<String>,
    #[serde(default)]
    registration_endpoint: Option<String>,
    #[serde(default)]
    revocation_endpoint: Option<String>,
    #[serde(default, deserialize_with = "deserialize_scopes")]
    scopes_supported: Vec<String>,
}

/// Endpoints of the upstream IdP.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstreamEndpoints {
    pub issuer: String,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    pub jwks_uri: String,
    pub registration_endpoint: Option<String>,
    pub revocation_endpoint: Option<String>,
    pub scopes_supported: Vec<String>,
}

impl UpstreamEndpoints {
    /// Conventional endpoints under `issuer` (Auth0 layout).
    pub fn derived(issuer: &str) -> Self {
        let base = issuer.trim_end_matches('/');
        Self {
            issuer: base.to_string(),
            authorization_endpoint: format!("{base}/authorize"),
            token_endpoint: format!("{base}/oauth/token"),
            jwks_uri: format!("{base}/.well-known/jwks.json"),
            registration_endpoint: None,
            revocation_endpoint: None,
            scopes_supported: Vec::new(),
        }
    }

    /// Fetch `{issuer}/.well-known/openid-configuration`, falling back to the
    /// conventional layout for fields the document leaves out.
    pub async fn discover(client: &Client, issuer: &str) -> Result<Self, UpstreamError> {
        let url = format!(
            "{}/.well-known/openid-configuration",
            issuer.trim_end_matches('/')
        );
        debug!(url = %url, "Discovering upstream OpenID configuration");

        let response = client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(UpstreamError::Rejected {
                status: response.status().as_u16(),
                code: "discovery_failed".to_string(),
            });
        }
        let document: OpenIdConfiguration = response.json().await?;

        let fallback = Self::derived(issuer);
        let endpoints = Self {
            issuer: fallback.issuer,
            authorization_endpoint: document
                .authorization_endpoint
                .unwrap_or(fallback.authorization_endpoint),
            token_endpoint: document.token_endpoint.unwrap_or(fallback.token_endpoint),
            jwks_uri: document.jwks_uri.unwrap_or(fallback.jwks_uri),
            registration_endpoint: document.registration_endpoint,
            revocation_endpoint: document.revocation_endpoint,
            scopes_supported: document.scopes_supported,
        };
        info!(
            issuer = %endpoints.issuer,
            jwks_uri = %endpoints.jwks_uri,
            "Discovered upstream endpoints"
        );
        Ok(endpoints)
    }

    /// Pin the JWKS URI regardless of discovery.
    pub fn with_jwks_uri(mut self, jwks_uri: impl Into<String>) -> Self {
        self.jwks_uri = jwks_uri.into();
        self
    }

    /// Send registrations to a dedicated DCR proxy instead of the IdP.
    pub fn with_registration_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.registration_endpoint = Some(endpoint.into());
        self
    }
}

/// Token set returned by the upstream token endpoint.
#[derive(Clone, Serialize, Deserialize)]
pub struct UpstreamTokens {
    pub access_token: String,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub scope: Option<String>,
}

impl std::fmt::Debug for UpstreamTokens {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamTokens")
            .field("token_type", &self.token_type)
            .field("has_id_token", &self.id_token.is_some())
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("expires_in", &self.expires_in)
            .field("scope", &self.scope)
            .finish()
    }
}

#[derive(Deserialize)]
struct UpstreamErrorBody {
    error: String,
}

/// Response of a registration passthrough.
#[derive(Debug)]
pub struct RegistrationResponse {
    pub status: u16,
    pub body: Value,
}

/// Confidential client of the upstream IdP.
pub struct UpstreamIdp {
    endpoints: UpstreamEndpoints,
    client_id: String,
    client_secret: String,
    audience: Option<String>,
    http: Client,
}

impl UpstreamIdp {
    pub fn new(
        endpoints: UpstreamEndpoints,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        audience: Option<String>,
        timeout: Duration,
    ) -> Result<Self, UpstreamError> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| UpstreamError::Transport(e.to_string()))?;
        Ok(Self {
            endpoints,
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            audience,
            http,
        })
    }

    pub fn endpoints(&self) -> &UpstreamEndpoints {
        &self.endpoints
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Authorization URL the user agent is sent to.
    pub fn authorization_url(
        &self,
        state: &str,
        code_challenge: &str,
        redirect_uri: &str,
        scopes: &[String],
    ) -> Result<Url, UpstreamError> {
        let mut url = Url::parse(&self.endpoints.authorization_endpoint)
            .map_err(|e| UpstreamError::InvalidResponse(e.to_string()))?;
        {
            let mut params = url.query_pairs_mut();
            params
                .append_pair("response_type", "code")
                .append_pair("client_id", &self.client_id)
                .append_pair("redirect_uri", redirect_uri)
                .append_pair("state", state)
                .append_pair("code_challenge", code_challenge)
                .append_pair("code_challenge_method", S256);
            if !scopes.is_empty() {
                params.append_pair("scope", &scopes.join(" "));
            }
            if let Some(audience) = &self.audience {
                params.append_pair("audience", audience);
            }
        }
        Ok(url)
    }

    /// Exchange an upstream authorization code using the proxy-managed verifier.
    pub async fn exchange_code(
        &self,
        code: &str,
        code_verifier: &str,
        redirect_uri: &str,
    ) -> Result<UpstreamTokens, UpstreamError> {
        self.token_request(&[
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", redirect_uri),
            ("code_verifier", code_verifier),
        ])
        .await
    }

    pub async fn refresh(&self, refresh_token: &str) -> Result<UpstreamTokens, UpstreamError> {
        self.token_request(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
        ])
        .await
    }

    async fn token_request(&self, grant: &[(&str, &str)]) -> Result<UpstreamTokens, UpstreamError> {
        let mut form: Vec<(&str, &str)> = grant.to_vec();
        form.push(("client_id", self.client_id.as_str()));
        form.push(("client_secret", self.client_secret.as_str()));

        let response = self
            .http
            .post(&self.endpoints.token_endpoint)
            .header(reqwest::header::ACCEPT, "application/json")
            .form(&form)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let code = response
                .json::<UpstreamErrorBody>()
                .await
                .map(|body| body.error)
                .unwrap_or_else(|_| "unknown".to_string());
            warn!(status = status.as_u16(), code = %code, "Upstream token endpoint rejected request");
            return Err(UpstreamError::Rejected {
                status: status.as_u16(),
                code,
            });
        }

        let tokens: UpstreamTokens = response.json().await?;
        if tokens.access_token.is_empty() {
            return Err(UpstreamError::InvalidResponse(
                "empty access_token".to_string(),
            ));
        }
        Ok(tokens)
    }

    /// Forward a dynamic client registration request.
    pub async fn register(&self, metadata: &Value) -> Result<RegistrationResponse, UpstreamError> {
        let endpoint = self
            .endpoints
            .registration_endpoint
            .as_deref()
            .ok_or(UpstreamError::NotConfigured("registration_endpoint"))?;

        let response = self.http.post(endpoint).json(metadata).send().await?;
        let status = response.status().as_u16();
        let body = response.json::<Value>().await.unwrap_or(Value::Null);
        Ok(RegistrationResponse { status, body })
    }
}
