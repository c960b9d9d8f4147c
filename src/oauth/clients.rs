// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Redirect URIs of clients registered through the proxy.

use std::collections::HashMap;
use std::net::IpAddr;

use tokio::sync::RwLock;
use url::{Host, Url};

use super::error::{OAuthError, OAuthErrorCode};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisteredClient {
    pub client_id: String,
    pub client_name: Option<String>,
    pub redirect_uris: Vec<String>,
}

/// Clients seen through `/register`.
#[derive(Default)]
pub struct ClientRegistry {
    clients: RwLock<HashMap<String, RegisteredClient>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, client: RegisteredClient) {
        self.clients
            .write()
            .await
            .insert(client.client_id.clone(), client);
    }

    pub async fn get(&self, client_id: &str) -> Option<RegisteredClient> {
        self.clients.read().await.get(client_id).cloned()
    }

    /// Accept `redirect_uri` for `client_id`.
    ///
    /// Registered clients must use one of their registered URIs verbatim.
    /// Unknown clients may use any HTTPS URI or an HTTP loopback URI.
    pub async fn validate_redirect(
        &self,
        client_id: &str,
        redirect_uri: &str,
    ) -> Result<(), OAuthError> {
        if let Some(client) = self.get(client_id).await {
            return if client.redirect_uris.iter().any(|uri| uri == redirect_uri) {
                Ok(())
            } else {
                Err(invalid_redirect("redirect_uri does not match a registered URI"))
            };
        }

        check_redirect_uri(redirect_uri).map_err(invalid_redirect)
    }
}

/// Shape rules for redirect URIs: absolute, no fragment, HTTPS or HTTP loopback.
pub fn check_redirect_uri(redirect_uri: &str) -> Result<(), &'static str> {
    let url = Url::parse(redirect_uri).map_err(|_| "redirect_uri is not a valid URL")?;
    if url.fragment().is_some() {
        return Err("redirect_uri must not contain a fragment");
    }
    match url.scheme() {
        "https" => Ok(()),
        "http" if is_loopback(&url) => Ok(()),
        _ => Err("redirect_uri must use https or a loopback address"),
    }
}

/// Loopback host: `localhost`, 127.0.0.0/8 or `::1`.
pub fn is_loopback(url: &Url) -> bool {
    match url.host() {
        Some(Host::Domain(domain)) => domain.eq_ignore_ascii_case("localhost"),
        Some(Host::Ipv4(ip)) => IpAddr::V4(ip).is_loopback(),
        Some(Host::Ipv6(ip)) => IpAddr::V6(ip).is_loopback(),
        None => false,
    }
}

fn invalid_redirect(description: &'static str) -> OAuthError {
    OAuthError::new(OAuthErrorCode::InvalidRequest, description)
}
