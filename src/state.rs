// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use std::sync::Arc;

use crate::api::discovery::{AuthorizationServerMetadata, ProtectedResourceMetadata};
use crate::auth::claims::normalize_issuer;
use crate::auth::KeyCache;
use crate::oauth::OAuthProxy;

/// Shared state of the public (unauthenticated) routes.
#[derive(Clone)]
pub struct AppState {
    pub key_cache: Arc<KeyCache>,
    /// Normalised upstream issuer
    pub upstream_issuer: String,
    /// `None` in direct-only mode
    pub proxy: Option<Arc<OAuthProxy>>,
    pub metadata: Arc<AuthorizationServerMetadata>,
    pub resource_metadata: Arc<ProtectedResourceMetadata>,
}

impl AppState {
    pub fn new(
        key_cache: Arc<KeyCache>,
        upstream_issuer: &str,
        proxy: Option<Arc<OAuthProxy>>,
        metadata: AuthorizationServerMetadata,
        resource_metadata: ProtectedResourceMetadata,
    ) -> Self {
        Self {
            key_cache,
            upstream_issuer: normalize_issuer(upstream_issuer).to_string(),
            proxy,
            metadata: Arc::new(metadata),
            resource_metadata: Arc::new(resource_metadata),
        }
    }

    /// The issuance proxy, or `None` in direct-only mode.
    pub fn proxy(&self) -> Option<&Arc<OAuthProxy>> {
        self.proxy.as_ref()
    }
}
