// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! OAuth 2.1 authorization server that fronts the upstream IdP.
//!
//! ## Flow
//!
//! ```text
//! client ──/authorize──▶ consent ──▶ upstream IdP ──/auth/callback──▶ client (proxy code)
//! client ──/token (proxy code + PKCE)──▶ upstream code exchange ──▶ session token
//! ```
//!
//! The upstream tokens never leave the gateway: they are sealed into a
//! [`Session`] keyed by the `jti` of the session token handed to the client.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use subtle::ConstantTimeEq;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

use super::cipher::{random_token, token_digest, SessionCipher};
use super::clients::{check_redirect_uri, ClientRegistry, RegisteredClient};
use super::error::{OAuthError, OAuthErrorCode};
use super::pending::{
    ConsentDecision, FlowState, PendingAuthorization, PendingStore, DEFAULT_PENDING_CAPACITY,
};
use super::pkce::{challenge_for, is_valid_challenge, verify_s256, PkcePair, S256};
use super::signing::{SessionTokenIssuer, SigningKeyError};
use super::store::{PurgeStats, RefreshGrant, Session, SessionStore};
use super::upstream::{UpstreamIdp, UpstreamTokens};
use crate::auth::verifier::TokenVerifier;

/// Path of the upstream redirect target.
pub const CALLBACK_PATH: &str = "/auth/callback";

/// Default lifetime of client refresh tokens (30 days).
pub const DEFAULT_REFRESH_TTL: Duration = Duration::from_secs(30 * 24 * 3600);

#[derive(Debug, Clone)]
pub struct ProxySettings {
    /// Externally visible base URL of the gateway, without trailing slash
    pub public_url: String,
    pub session_ttl: Duration,
    pub pending_ttl: Duration,
    pub refresh_ttl: Duration,
    /// Scopes requested upstream when the client asks for none
    pub default_scopes: Vec<String>,
    pub require_consent: bool,
}

impl ProxySettings {
    pub fn callback_url(&self) -> String {
        format!("{}{CALLBACK_PATH}", self.public_url)
    }
}

/// Query of `GET /authorize`.
#[derive(Debug, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct AuthorizeRequest {
    pub response_type: Option<String>,
    pub client_id: Option<String>,
    pub redirect_uri: Option<String>,
    pub state: Option<String>,
    pub code_challenge: Option<String>,
    pub code_challenge_method: Option<String>,
    pub scope: Option<String>,
}

/// Query of the upstream redirect to `/auth/callback`.
#[derive(Debug, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
}

/// Form body of `POST /token`.
#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct TokenRequest {
    pub grant_type: Option<String>,
    pub code: Option<String>,
    pub redirect_uri: Option<String>,
    pub client_id: Option<String>,
    pub code_verifier: Option<String>,
    pub refresh_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: String,
    pub expires_in: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    pub scope: String,
}

/// What the consent page needs to render.
#[derive(Debug, Clone)]
pub struct ConsentPrompt {
    pub state: String,
    /// Echoed by the form and set as a cookie on the consent page
    pub csrf_token: String,
    pub client_id: String,
    pub client_name: Option<String>,
    pub redirect_uri: String,
    pub scopes: Vec<String>,
}

#[derive(Debug)]
pub enum AuthorizeOutcome {
    /// Ask the user before contacting the IdP
    Consent(ConsentPrompt),
    /// Send the user agent here
    Redirect(Url),
}

/// Verifiers for tokens the upstream IdP hands back after code exchange.
pub struct UpstreamVerifiers {
    /// Access tokens for the configured audience
    pub access_token: TokenVerifier,
    /// ID tokens (audience = gateway client id), used when the access token is opaque
    pub id_token: Option<TokenVerifier>,
}

struct Identity {
    subject: String,
    scopes: Vec<String>,
}

pub struct OAuthProxy {
    settings: ProxySettings,
    upstream: UpstreamIdp,
    verifiers: UpstreamVerifiers,
    issuer: SessionTokenIssuer,
    session_verifier: TokenVerifier,
    cipher: SessionCipher,
    sessions: Arc<SessionStore>,
    pending: PendingStore,
    clients: ClientRegistry,
}

impl OAuthProxy {
    pub fn new(
        settings: ProxySettings,
        upstream: UpstreamIdp,
        verifiers: UpstreamVerifiers,
        issuer: SessionTokenIssuer,
        cipher: SessionCipher,
        sessions: Arc<SessionStore>,
    ) -> Result<Self, SigningKeyError> {
        let session_verifier = issuer.verifier()?;
        let pending = PendingStore::new(DEFAULT_PENDING_CAPACITY, settings.pending_ttl);
        Ok(Self {
            settings,
            upstream,
            verifiers,
            issuer,
            session_verifier,
            cipher,
            sessions,
            pending,
            clients: ClientRegistry::new(),
        })
    }

    pub fn settings(&self) -> &ProxySettings {
        &self.settings
    }

    pub fn issuer(&self) -> &SessionTokenIssuer {
        &self.issuer
    }

    /// Verifier accepting only this proxy's session tokens.
    pub fn session_verifier(&self) -> &TokenVerifier {
        &self.session_verifier
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    pub fn pending(&self) -> &PendingStore {
        &self.pending
    }

    pub fn registration_enabled(&self) -> bool {
        self.upstream.endpoints().registration_endpoint.is_some()
    }

    /// Start a flow: validate the client request and record it as pending.
    pub async fn authorize(&self, req: AuthorizeRequest) -> Result<AuthorizeOutcome, OAuthError> {
        let client_id = req
            .client_id
            .filter(|c| !c.is_empty())
            .ok_or_else(|| OAuthError::invalid_request("client_id is required"))?;
        let redirect_uri = req
            .redirect_uri
            .filter(|r| !r.is_empty())
            .ok_or_else(|| OAuthError::invalid_request("redirect_uri is required"))?;
        self.clients
            .validate_redirect(&client_id, &redirect_uri)
            .await?;

        // From here on errors go back to the (validated) client redirect URI.
        let client_state = req.state;
        if req.response_type.as_deref() != Some("code") {
            return redirect_error(
                &redirect_uri,
                client_state.as_deref(),
                OAuthErrorCode::UnsupportedResponseType,
            )
            .map(AuthorizeOutcome::Redirect);
        }

        let client_challenge = match (req.code_challenge, req.code_challenge_method.as_deref()) {
            (None, _) => None,
            (Some(challenge), Some(S256)) if is_valid_challenge(&challenge) => Some(challenge),
            (Some(_), _) => {
                return redirect_error(
                    &redirect_uri,
                    client_state.as_deref(),
                    OAuthErrorCode::InvalidRequest,
                )
                .map(AuthorizeOutcome::Redirect);
            }
        };

        let scopes = match req.scope.as_deref().map(str::split_whitespace) {
            Some(requested) => requested.map(str::to_owned).collect::<Vec<_>>(),
            None => Vec::new(),
        };
        let scopes = if scopes.is_empty() {
            self.settings.default_scopes.clone()
        } else {
            scopes
        };

        let upstream_pkce = PkcePair::generate()?;
        let record = PendingAuthorization {
            state: random_token(32)?,
            client_id,
            redirect_uri,
            client_state,
            client_challenge,
            scopes,
            upstream_verifier: upstream_pkce.verifier,
            consent: ConsentDecision::Pending,
            consent_csrf: None,
            flow: FlowState::Init,
            upstream_code: None,
        };
        info!(
            client_id = %record.client_id,
            client_pkce = record.client_challenge.is_some(),
            flow = record.flow.as_str(),
            "Authorization request accepted"
        );

        if self.settings.require_consent {
            let csrf_token = random_token(32)?;
            let mut record = record;
            record.consent_csrf = Some(token_digest(&csrf_token));
            let client_name = self
                .clients
                .get(&record.client_id)
                .await
                .and_then(|c| c.client_name);
            let prompt = ConsentPrompt {
                state: record.state.clone(),
                csrf_token,
                client_id: record.client_id.clone(),
                client_name,
                redirect_uri: record.redirect_uri.clone(),
                scopes: record.scopes.clone(),
            };
            self.pending.insert(record);
            Ok(AuthorizeOutcome::Consent(prompt))
        } else {
            let mut record = record;
            record.consent = ConsentDecision::Granted;
            self.redirect_upstream(record).map(AuthorizeOutcome::Redirect)
        }
    }

    /// Record the user's decision on the consent page.
    ///
    /// `form_token` and `cookie_token` must both carry the token issued with
    /// the page; a submission failing that check leaves the request pending.
    pub fn consent(
        &self,
        state: &str,
        approve: bool,
        form_token: &str,
        cookie_token: Option<&str>,
    ) -> Result<Url, OAuthError> {
        let unknown = || OAuthError::invalid_request("Unknown or expired authorization request");
        let record = self.pending.peek_state(state).ok_or_else(unknown)?;
        if !consent_bound(&record, form_token, cookie_token) {
            warn!(
                client_id = %record.client_id,
                cookie = cookie_token.is_some(),
                "Consent submission not bound to the prompted browser"
            );
            return Err(OAuthError::invalid_request(
                "Consent was not submitted from the authorization page",
            ));
        }

        let mut record = self.pending.take_state(state).ok_or_else(unknown)?;
        if record.flow != FlowState::Init || record.consent != ConsentDecision::Pending {
            return Err(OAuthError::invalid_request("Authorization request already decided"));
        }

        if !approve {
            record.consent = ConsentDecision::Denied;
            info!(client_id = %record.client_id, "Consent denied");
            return redirect_error(
                &record.redirect_uri,
                record.client_state.as_deref(),
                OAuthErrorCode::AccessDenied,
            );
        }

        record.consent = ConsentDecision::Granted;
        self.redirect_upstream(record)
    }

    fn redirect_upstream(&self, mut record: PendingAuthorization) -> Result<Url, OAuthError> {
        let url = self.upstream.authorization_url(
            &record.state,
            &challenge_for(&record.upstream_verifier),
            &self.settings.callback_url(),
            &record.scopes,
        )?;
        record.flow = FlowState::RedirectedToUpstream;
        debug!(client_id = %record.client_id, flow = record.flow.as_str(), "Redirecting to upstream");
        self.pending.insert(record);
        Ok(url)
    }

    /// Handle the upstream redirect and hand a proxy code to the client.
    pub fn callback(&self, params: CallbackParams) -> Result<Url, OAuthError> {
        let state = params
            .state
            .ok_or_else(|| OAuthError::invalid_request("state is required"))?;
        let mut record = self
            .pending
            .take_state(&state)
            .ok_or_else(|| OAuthError::invalid_request("Unknown or expired authorization request"))?;
        if record.flow != FlowState::RedirectedToUpstream
            || record.consent != ConsentDecision::Granted
        {
            return Err(OAuthError::invalid_request("Unexpected callback for this request"));
        }

        if let Some(error) = params.error {
            warn!(client_id = %record.client_id, upstream_error = %error, "Upstream authorization failed");
            let code = match error.as_str() {
                "access_denied" | "login_required" | "consent_required"
                | "interaction_required" => OAuthErrorCode::AccessDenied,
                _ => OAuthErrorCode::ServerError,
            };
            return redirect_error(&record.redirect_uri, record.client_state.as_deref(), code);
        }

        let Some(upstream_code) = params.code.filter(|c| !c.is_empty()) else {
            return redirect_error(
                &record.redirect_uri,
                record.client_state.as_deref(),
                OAuthErrorCode::ServerError,
            );
        };

        record.upstream_code = Some(upstream_code);
        record.flow = FlowState::CodeReceived;
        debug!(client_id = %record.client_id, flow = record.flow.as_str(), "Upstream code received");

        let code = random_token(32)?;
        let mut url = parse_redirect(&record.redirect_uri)?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("code", &code);
            if let Some(state) = &record.client_state {
                query.append_pair("state", state);
            }
        }
        self.pending.insert_code(code, record);
        Ok(url)
    }

    /// `POST /token` dispatch.
    pub async fn token(&self, req: TokenRequest) -> Result<TokenResponse, OAuthError> {
        match req.grant_type.as_deref() {
            Some("authorization_code") => self.exchange_code(req).await,
            Some("refresh_token") => self.refresh(req).await,
            Some(_) => Err(OAuthError::unsupported_grant_type()),
            None => Err(OAuthError::invalid_request("grant_type is required")),
        }
    }

    async fn exchange_code(&self, req: TokenRequest) -> Result<TokenResponse, OAuthError> {
        let code = req
            .code
            .as_deref()
            .ok_or_else(|| OAuthError::invalid_request("code is required"))?;
        let mut record = self
            .pending
            .take_code(code)
            .ok_or_else(|| OAuthError::invalid_grant("Authorization code is invalid or expired"))?;

        if req.client_id.as_ref().is_some_and(|id| *id != record.client_id) {
            return Err(OAuthError::invalid_grant(
                "Authorization code was issued to another client",
            ));
        }
        if req
            .redirect_uri
            .as_ref()
            .is_some_and(|uri| *uri != record.redirect_uri)
        {
            return Err(OAuthError::invalid_grant(
                "redirect_uri does not match the authorization request",
            ));
        }
        if let Some(challenge) = &record.client_challenge {
            let verifier = req
                .code_verifier
                .as_deref()
                .ok_or_else(|| OAuthError::invalid_grant("code_verifier is required"))?;
            if !verify_s256(verifier, challenge) {
                warn!(client_id = %record.client_id, "PKCE verification failed");
                return Err(OAuthError::invalid_grant("PKCE verification failed"));
            }
        }

        let upstream_code = record
            .upstream_code
            .take()
            .ok_or_else(OAuthError::server_error)?;
        let tokens = self
            .upstream
            .exchange_code(
                &upstream_code,
                &record.upstream_verifier,
                &self.settings.callback_url(),
            )
            .await
            .map_err(|e| {
                warn!(client_id = %record.client_id, error = %e, "Upstream code exchange failed");
                OAuthError::from(e)
            })?;
        record.flow = FlowState::TokenExchanged;
        debug!(client_id = %record.client_id, flow = record.flow.as_str(), "Upstream tokens received");

        let identity = self.identify(&tokens, &record.scopes).await?;
        self.open_session(identity, &record.client_id, tokens, None)
            .await
    }

    async fn refresh(&self, req: TokenRequest) -> Result<TokenResponse, OAuthError> {
        let presented = req
            .refresh_token
            .as_deref()
            .ok_or_else(|| OAuthError::invalid_request("refresh_token is required"))?;
        let digest = token_digest(presented);
        let grant = self
            .sessions
            .take_refresh(&digest, Utc::now())
            .await
            .ok_or_else(|| OAuthError::invalid_grant("Refresh token is invalid or expired"))?;

        if req.client_id.as_ref().is_some_and(|id| *id != grant.client_id) {
            warn!(client_id = %grant.client_id, "Refresh token presented by another client");
            self.sessions.revoke(&grant.session_id).await;
            return Err(OAuthError::invalid_grant(
                "Refresh token was issued to another client",
            ));
        }

        let upstream_refresh = String::from_utf8(
            self.cipher
                .open(&grant.grant_id, &grant.upstream_refresh)?,
        )
        .map_err(|_| OAuthError::server_error())?;

        let tokens = match self.upstream.refresh(&upstream_refresh).await {
            Ok(tokens) => tokens,
            Err(e) if e.is_transient() => {
                // Hand the grant back so the client can retry after the outage.
                warn!(client_id = %grant.client_id, error = %e, "Upstream refresh unavailable");
                self.sessions.insert_refresh(digest, grant).await;
                return Err(OAuthError::from(e));
            }
            Err(e) => {
                warn!(client_id = %grant.client_id, error = %e, "Upstream refresh failed");
                self.sessions.revoke(&grant.session_id).await;
                return Err(OAuthError::from(e));
            }
        };

        // Rotation: the old session ends once its replacement is ready.
        self.sessions.revoke(&grant.session_id).await;
        let identity = Identity {
            subject: grant.subject,
            scopes: grant.scopes,
        };
        self.open_session(identity, &grant.client_id, tokens, Some(upstream_refresh))
            .await
    }

    /// Establish who the upstream tokens belong to.
    async fn identify(
        &self,
        tokens: &UpstreamTokens,
        requested: &[String],
    ) -> Result<Identity, OAuthError> {
        let claims = match self
            .verifiers
            .access_token
            .verify(&tokens.access_token, None)
            .await
        {
            Ok(claims) => claims,
            Err(access_err) => match (&self.verifiers.id_token, &tokens.id_token) {
                (Some(verifier), Some(id_token)) => {
                    verifier.verify(id_token, None).await.map_err(|e| {
                        warn!(reason = e.error_code(), "Upstream ID token failed verification");
                        OAuthError::server_error()
                    })?
                }
                _ => {
                    warn!(
                        reason = access_err.error_code(),
                        "Upstream access token failed verification"
                    );
                    return Err(OAuthError::server_error());
                }
            },
        };

        let granted: Vec<String> = tokens
            .scope
            .as_deref()
            .map(|s| s.split_whitespace().map(str::to_owned).collect())
            .unwrap_or_default();
        let scopes = if !granted.is_empty() {
            granted
        } else if !claims.scopes().is_empty() {
            claims.scopes().iter().cloned().collect()
        } else {
            requested.to_vec()
        };

        Ok(Identity {
            subject: claims.subject().to_string(),
            scopes,
        })
    }

    /// Seal upstream tokens into a new session and mint its token.
    async fn open_session(
        &self,
        identity: Identity,
        client_id: &str,
        mut tokens: UpstreamTokens,
        previous_refresh: Option<String>,
    ) -> Result<TokenResponse, OAuthError> {
        let now = Utc::now();
        let ttl = match tokens.expires_in {
            Some(secs) if secs > 0 => self.settings.session_ttl.min(Duration::from_secs(secs)),
            _ => self.settings.session_ttl,
        };
        let minted = self.issuer.mint(
            &identity.subject,
            &identity.scopes,
            client_id,
            ttl,
            now.timestamp(),
        )?;

        let upstream_refresh = tokens.refresh_token.take().or(previous_refresh);
        let blob = serde_json::to_vec(&tokens).map_err(|_| OAuthError::server_error())?;
        let expires_at =
            DateTime::from_timestamp(minted.expires_at, 0).ok_or_else(OAuthError::server_error)?;
        let session = Session {
            session_id: minted.session_id.clone(),
            subject: identity.subject.clone(),
            client_id: client_id.to_string(),
            scopes: identity.scopes.clone(),
            upstream: self.cipher.seal(&minted.session_id, &blob)?,
            created_at: now,
            expires_at,
        };

        let refresh_token = match upstream_refresh {
            Some(upstream_refresh) => {
                let token = random_token(32)?;
                let grant_id = Uuid::new_v4().to_string();
                let grant = RefreshGrant {
                    upstream_refresh: self.cipher.seal(&grant_id, upstream_refresh.as_bytes())?,
                    grant_id,
                    session_id: minted.session_id.clone(),
                    subject: identity.subject.clone(),
                    client_id: client_id.to_string(),
                    scopes: identity.scopes.clone(),
                    expires_at: now + chrono::Duration::seconds(self.settings.refresh_ttl.as_secs() as i64),
                };
                self.sessions.insert_refresh(token_digest(&token), grant).await;
                Some(token)
            }
            None => None,
        };

        self.sessions.insert(session).await;
        info!(
            client_id,
            session_id = %minted.session_id,
            expires_in = minted.expires_in,
            refreshable = refresh_token.is_some(),
            flow = FlowState::ClientTokenIssued.as_str(),
            "Session token issued"
        );

        Ok(TokenResponse {
            access_token: minted.token,
            token_type: "Bearer".to_string(),
            expires_in: minted.expires_in,
            refresh_token,
            scope: identity.scopes.join(" "),
        })
    }

    /// Revoke a session token or refresh token (RFC 7009). Unknown tokens are ignored.
    pub async fn revoke(&self, token: &str) {
        if let Some(grant) = self.sessions.revoke_refresh(&token_digest(token)).await {
            info!(session_id = %grant.session_id, "Refresh token revoked");
            return;
        }
        if let Ok(claims) = self.session_verifier.verify(token, None).await {
            if let Some(session_id) = claims.token_id() {
                if self.sessions.revoke(session_id).await {
                    info!(session_id, "Session revoked");
                }
            }
        }
    }

    /// Upstream tokens behind a live session, for downstream calls on the user's behalf.
    pub async fn upstream_tokens(&self, session_id: &str) -> Result<UpstreamTokens, OAuthError> {
        let session = self
            .sessions
            .get(session_id)
            .await
            .ok_or_else(|| OAuthError::invalid_grant("Session expired or revoked"))?;
        let plaintext = self.cipher.open(&session.session_id, &session.upstream)?;
        serde_json::from_slice(&plaintext).map_err(|_| OAuthError::server_error())
    }

    /// Forward a dynamic client registration and remember the redirect URIs.
    pub async fn register(&self, metadata: Value) -> Result<Value, OAuthError> {
        let redirect_uris: Vec<String> = metadata
            .get("redirect_uris")
            .and_then(Value::as_array)
            .map(|uris| {
                uris.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_default();
        if redirect_uris.is_empty() {
            return Err(OAuthError::new(
                OAuthErrorCode::InvalidRedirectUri,
                "redirect_uris is required",
            ));
        }
        for uri in &redirect_uris {
            check_redirect_uri(uri)
                .map_err(|reason| OAuthError::new(OAuthErrorCode::InvalidRedirectUri, reason))?;
        }

        let response = self.upstream.register(&metadata).await.map_err(|e| {
            warn!(error = %e, "Client registration passthrough failed");
            OAuthError::from(e)
        })?;

        match response.status {
            200 | 201 => {
                let client_id = response
                    .body
                    .get("client_id")
                    .and_then(Value::as_str)
                    .ok_or_else(OAuthError::server_error)?
                    .to_string();
                let client_name = response
                    .body
                    .get("client_name")
                    .or_else(|| metadata.get("client_name"))
                    .and_then(Value::as_str)
                    .map(str::to_owned);
                info!(client_id = %client_id, "Client registered");
                self.clients
                    .register(RegisteredClient {
                        client_id,
                        client_name,
                        redirect_uris,
                    })
                    .await;
                Ok(response.body)
            }
            400..=499 => {
                warn!(status = response.status, "Identity provider rejected client registration");
                Err(OAuthError::new(
                    OAuthErrorCode::InvalidClientMetadata,
                    "The identity provider rejected the client metadata",
                ))
            }
            status => {
                warn!(status, "Identity provider failed client registration");
                Err(OAuthError::server_error())
            }
        }
    }

    /// Drop expired sessions, refresh grants and pending authorizations.
    pub async fn purge_expired(&self) -> (PurgeStats, usize) {
        let stats = self.sessions.purge_expired(Utc::now()).await;
        let pending = self.pending.purge_expired();
        (stats, pending)
    }

    /// Periodically purge expired records until `shutdown` fires.
    pub async fn run_sweeper(self: Arc<Self>, interval: Duration, shutdown: CancellationToken) {
        info!(interval_secs = interval.as_secs(), "Session sweeper started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Session sweeper shutting down");
                    break;
                }
                _ = tokio::time::sleep(interval) => {
                    let (stats, pending) = self.purge_expired().await;
                    if stats.sessions + stats.refresh_grants + pending > 0 {
                        debug!(
                            sessions = stats.sessions,
                            refresh_grants = stats.refresh_grants,
                            pending,
                            "Purged expired records"
                        );
                    }
                }
            }
        }
    }
}

/// Cookie and form carry the same token, and it is the one issued for `record`.
fn consent_bound(
    record: &PendingAuthorization,
    form_token: &str,
    cookie_token: Option<&str>,
) -> bool {
    let (Some(expected), Some(cookie)) = (record.consent_csrf.as_deref(), cookie_token) else {
        return false;
    };
    if form_token.is_empty() {
        return false;
    }
    let echoed = cookie.as_bytes().ct_eq(form_token.as_bytes());
    let issued = token_digest(form_token).as_bytes().ct_eq(expected.as_bytes());
    bool::from(echoed & issued)
}

fn parse_redirect(redirect_uri: &str) -> Result<Url, OAuthError> {
    Url::parse(redirect_uri).map_err(|_| OAuthError::server_error())
}

/// Error redirect to a validated client redirect URI (RFC 6749 §4.1.2.1).
fn redirect_error(
    redirect_uri: &str,
    client_state: Option<&str>,
    code: OAuthErrorCode,
) -> Result<Url, OAuthError> {
    let mut url = parse_redirect(redirect_uri)?;
    {
        let mut query = url.query_pairs_mut();
        query.append_pair("error", code.as_str());
        if let Some(state) = client_state {
            query.append_pair("state", state);
        }
    }
    Ok(url)
}
