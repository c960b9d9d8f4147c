// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Dual Gateway
//!
//! One [`AuthGateway`] owns the key cache, the session store and the
//! issuance proxy, and mounts the same downstream router twice:
//!
//! | Prefix | Authenticator | Accepts |
//! |--------|---------------|---------|
//! | `PROXY_ROUTE_PREFIX` (`/mcp`) | [`ProxyAuthenticator`] | session tokens minted here, with a live session |
//! | `DIRECT_ROUTE_PREFIX` (`/test`) | [`OidcAuthenticator`] | access tokens signed by the upstream IdP |
//!
//! The two token families are disjoint: session tokens carry the gateway's
//! issuer and are signed with a key that never appears in the upstream JWKS,
//! and each verifier resolves keys from its own source only.
//!
//! Without proxy credentials only the direct prefix is mounted.

use std::sync::Arc;
use std::time::Duration;

use axum::{middleware::from_fn_with_state, Router};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::api::discovery::{
    AuthorizationServerMetadata, ProtectedResourceMetadata, PROTECTED_RESOURCE_PATH,
};
use crate::api;
use crate::auth::jwks::KeyCacheOptions;
use crate::auth::{
    require_auth, AuthLayer, Authenticator, ClaimRules, KeyCache, KeyCacheError, KeySource,
    OidcAuthenticator, ProxyAuthenticator, TokenVerifier,
};
use crate::config::{ConfigError, GatewayConfig, ProxyConfig};
use crate::oauth::cipher::CipherError;
use crate::oauth::pending::DEFAULT_PENDING_TTL;
use crate::oauth::proxy::DEFAULT_REFRESH_TTL;
use crate::oauth::signing::SigningKeyError;
use crate::oauth::upstream::UpstreamError;
use crate::oauth::{
    OAuthProxy, ProxySettings, SessionCipher, SessionStore, SessionTokenIssuer, SigningKey,
    UpstreamEndpoints, UpstreamIdp, UpstreamVerifiers,
};
use crate::state::AppState;

/// Realm of every `WWW-Authenticate` challenge.
pub const REALM: &str = "cnpg-gateway";

/// How often expired sessions and pending authorizations are purged.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Scopes requested upstream when a client asks for none.
pub const BASE_SCOPES: [&str; 2] = ["openid", "offline_access"];

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("key cache error: {0}")]
    KeyCache(#[from] KeyCacheError),
    #[error("session signing key error: {0}")]
    Signing(#[from] SigningKeyError),
    #[error("session cipher error: {0}")]
    Cipher(#[from] CipherError),
    #[error("upstream identity provider error: {0}")]
    Upstream(#[from] UpstreamError),
}

pub struct AuthGateway {
    key_cache: Arc<KeyCache>,
    oidc: Arc<OidcAuthenticator>,
    proxy: Option<Arc<OAuthProxy>>,
    proxy_auth: Option<Arc<ProxyAuthenticator>>,
    state: AppState,
    resource_metadata_url: Option<String>,
    proxy_prefix: String,
    direct_prefix: String,
}

impl AuthGateway {
    /// Resolve upstream endpoints: discovery, unless the JWKS URI is pinned.
    pub async fn upstream_endpoints(config: &GatewayConfig) -> Result<UpstreamEndpoints, GatewayError> {
        let endpoints = match &config.jwks_uri {
            Some(jwks_uri) => UpstreamEndpoints::derived(&config.issuer).with_jwks_uri(jwks_uri),
            None => {
                let client = reqwest::Client::builder()
                    .timeout(config.upstream_timeout)
                    .build()
                    .map_err(UpstreamError::from)?;
                UpstreamEndpoints::discover(&client, &config.issuer).await?
            }
        };
        Ok(match &config.dcr_proxy_url {
            Some(url) => endpoints.with_registration_endpoint(url),
            None => endpoints,
        })
    }

    /// Discover the upstream IdP and build the gateway.
    pub async fn from_config(config: &GatewayConfig) -> Result<Self, GatewayError> {
        let endpoints = Self::upstream_endpoints(config).await?;
        Self::new(config, endpoints)
    }

    pub fn new(config: &GatewayConfig, endpoints: UpstreamEndpoints) -> Result<Self, GatewayError> {
        let key_cache = Arc::new(KeyCache::new(
            KeyCacheOptions {
                ttl: config.jwks_cache_ttl,
                stale_grace: config.jwks_stale_grace,
                fetch_timeout: config.upstream_timeout,
                ..KeyCacheOptions::default()
            },
            [(config.issuer.as_str(), endpoints.jwks_uri.clone())],
        )?);
        let upstream_keys = KeySource::Jwks {
            cache: key_cache.clone(),
            issuer: config.issuer.clone(),
        };

        let access_verifier = TokenVerifier::new(
            ClaimRules::new(&config.issuer, config.audience.clone()),
            upstream_keys.clone(),
        );
        let oidc = Arc::new(OidcAuthenticator::new(
            access_verifier.clone(),
            config.required_scope.clone(),
        ));

        let mut scopes: Vec<String> = BASE_SCOPES.iter().map(|s| s.to_string()).collect();
        if let Some(scope) = &config.required_scope {
            if !scopes.contains(scope) {
                scopes.push(scope.clone());
            }
        }

        let (proxy, proxy_auth, metadata, resource_metadata_url) = match &config.proxy {
            Some(proxy_config) => {
                let proxy = Arc::new(build_proxy(
                    config,
                    proxy_config,
                    endpoints.clone(),
                    UpstreamVerifiers {
                        access_token: access_verifier,
                        id_token: Some(TokenVerifier::new(
                            ClaimRules::new(&config.issuer, proxy_config.client_id.clone()),
                            upstream_keys,
                        )),
                    },
                    scopes.clone(),
                )?);
                let proxy_auth = Arc::new(ProxyAuthenticator::new(
                    proxy.session_verifier().clone(),
                    proxy.sessions().clone(),
                    config.required_scope.clone(),
                ));
                let advertised = if endpoints.scopes_supported.is_empty() {
                    scopes.clone()
                } else {
                    endpoints.scopes_supported.clone()
                };
                let metadata = AuthorizationServerMetadata::for_proxy(
                    &proxy_config.public_url,
                    advertised,
                    proxy.registration_enabled(),
                );
                let resource_metadata_url =
                    format!("{}{PROTECTED_RESOURCE_PATH}", proxy_config.public_url);
                (
                    Some(proxy),
                    Some(proxy_auth),
                    metadata,
                    Some(resource_metadata_url),
                )
            }
            None => {
                info!("No proxy credentials configured, running in direct-only mode");
                (
                    None,
                    None,
                    AuthorizationServerMetadata::for_upstream(&endpoints),
                    None,
                )
            }
        };

        let resource = match &config.proxy {
            Some(proxy_config) => format!("{}{}", proxy_config.public_url, config.proxy_route_prefix),
            None => config.audience.clone(),
        };
        let resource_metadata = ProtectedResourceMetadata::new(&resource, &metadata.issuer, scopes);
        let state = AppState::new(
            key_cache.clone(),
            &config.issuer,
            proxy.clone(),
            metadata,
            resource_metadata,
        );

        Ok(Self {
            key_cache,
            oidc,
            proxy,
            proxy_auth,
            state,
            resource_metadata_url,
            proxy_prefix: config.proxy_route_prefix.clone(),
            direct_prefix: config.direct_route_prefix.clone(),
        })
    }

    pub fn key_cache(&self) -> &Arc<KeyCache> {
        &self.key_cache
    }

    /// The issuance proxy, or `None` in direct-only mode.
    pub fn proxy(&self) -> Option<&Arc<OAuthProxy>> {
        self.proxy.as_ref()
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    fn auth_layer(&self, authenticator: Arc<dyn Authenticator>) -> AuthLayer {
        let layer = AuthLayer::new(authenticator).with_realm(REALM);
        match &self.resource_metadata_url {
            Some(url) => layer.with_resource_metadata(url),
            None => layer,
        }
    }

    /// Public routes plus `downstream` mounted under each enabled prefix.
    pub fn router(&self, downstream: Router) -> Router {
        let direct = downstream
            .clone()
            .layer(from_fn_with_state(self.auth_layer(self.oidc.clone()), require_auth));
        let mut app = api::router(self.state.clone()).nest(&self.direct_prefix, direct);

        if let Some(proxy_auth) = &self.proxy_auth {
            let proxied = downstream
                .layer(from_fn_with_state(self.auth_layer(proxy_auth.clone()), require_auth));
            app = app.nest(&self.proxy_prefix, proxied);
        }
        app
    }

    /// Start the JWKS refresher and, in proxy mode, the session sweeper.
    pub fn spawn_background(&self, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        let mut tasks = vec![tokio::spawn(
            self.key_cache.clone().run_refresher(shutdown.clone()),
        )];
        if let Some(proxy) = &self.proxy {
            tasks.push(tokio::spawn(
                proxy.clone().run_sweeper(SWEEP_INTERVAL, shutdown),
            ));
        }
        tasks
    }
}

fn build_proxy(
    config: &GatewayConfig,
    proxy_config: &ProxyConfig,
    endpoints: UpstreamEndpoints,
    verifiers: UpstreamVerifiers,
    default_scopes: Vec<String>,
) -> Result<OAuthProxy, GatewayError> {
    let key = match &proxy_config.signing_key_path {
        Some(path) => SigningKey::load(path)?,
        None => {
            warn!("SESSION_SIGNING_KEY_PATH not set, session tokens are signed with an ephemeral key");
            SigningKey::generate()?
        }
    };
    let cipher = match &proxy_config.encryption_key {
        Some(secret) => SessionCipher::from_secret(secret.expose())?,
        None => {
            warn!("SESSION_ENCRYPTION_KEY not set, sessions are sealed with an ephemeral key");
            SessionCipher::generate()?
        }
    };
    info!(kid = key.kid(), issuer = %proxy_config.public_url, "Session token signing key loaded");

    let upstream = UpstreamIdp::new(
        endpoints,
        proxy_config.client_id.clone(),
        proxy_config.client_secret.expose(),
        Some(config.audience.clone()),
        config.upstream_timeout,
    )?;

    let settings = ProxySettings {
        public_url: proxy_config.public_url.clone(),
        session_ttl: config.session_ttl,
        pending_ttl: DEFAULT_PENDING_TTL,
        refresh_ttl: DEFAULT_REFRESH_TTL,
        default_scopes,
        require_consent: true,
    };

    Ok(OAuthProxy::new(
        settings,
        upstream,
        verifiers,
        SessionTokenIssuer::new(key, &proxy_config.public_url, config.audience.clone()),
        cipher,
        Arc::new(SessionStore::new()),
    )?)
}
