// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # OAuth Proxy Module
//!
//! Authorization server in front of the upstream IdP. Clients run
//! authorization code + PKCE against this gateway; the gateway runs its own
//! PKCE flow against the IdP and keeps the upstream tokens server-side,
//! encrypted, behind a short-lived session token (ES256, max one hour).
//!
//! - `pending` - in-flight authorizations (LRU + TTL, single-use state/code)
//! - `store` - sessions and rotating refresh grants
//! - `signing` - session token key, minting and JWKS
//! - `upstream` - IdP discovery and token endpoint client
//! - `proxy` - the flow itself

pub mod cipher;
pub mod clients;
pub mod error;
pub mod pending;
pub mod pkce;
pub mod proxy;
pub mod signing;
pub mod store;
pub mod upstream;

pub use cipher::SessionCipher;
pub use error::{OAuthError, OAuthErrorCode};
pub use proxy::{
    AuthorizeOutcome, AuthorizeRequest, CallbackParams, OAuthProxy, ProxySettings, TokenRequest,
    TokenResponse, UpstreamVerifiers,
};
pub use signing::{SessionTokenIssuer, SigningKey};
pub use store::SessionStore;
pub use upstream::{UpstreamEndpoints, UpstreamIdp, UpstreamTokens};
