// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! In-memory session storage for proxy-issued tokens.
//!
//! ## Limitations
//!
//! State lives in this process only. Running several replicas requires
//! sticky routing, otherwise a token minted by one replica is unknown to the
//! others and is rejected as an expired session.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::cipher::SealedBlob;

/// Server-side record behind one session token.
#[derive(Debug, Clone)]
pub struct Session {
    /// Equals the `jti` of the session token
    pub session_id: String,
    pub subject: String,
    pub client_id: String,
    pub scopes: Vec<String>,
    /// Sealed upstream token set, associated data = `session_id`
    pub upstream: SealedBlob,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Session {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Server-side record behind one client refresh token, keyed by the token's digest.
#[derive(Debug, Clone)]
pub struct RefreshGrant {
    pub grant_id: String,
    /// Session minted alongside this grant
    pub session_id: String,
    pub subject: String,
    pub client_id: String,
    pub scopes: Vec<String>,
    /// Sealed upstream refresh token, associated data = `grant_id`
    pub upstream_refresh: SealedBlob,
    pub expires_at: DateTime<Utc>,
}

#[derive(Default)]
struct Records {
    sessions: HashMap<String, Session>,
    refresh: HashMap<String, RefreshGrant>,
}

/// Counts reported by [`SessionStore::purge_expired`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PurgeStats {
    pub sessions: usize,
    pub refresh_grants: usize,
}

/// Sessions and refresh grants. Each operation is atomic.
#[derive(Default)]
pub struct SessionStore {
    records: RwLock<Records>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, session: Session) {
        self.records
            .write()
            .await
            .sessions
            .insert(session.session_id.clone(), session);
    }

    /// Live session for `session_id`.
    pub async fn get(&self, session_id: &str) -> Option<Session> {
        self.get_at(session_id, Utc::now()).await
    }

    /// Session for `session_id` if it is still live at `now`.
    pub async fn get_at(&self, session_id: &str, now: DateTime<Utc>) -> Option<Session> {
        self.records
            .read()
            .await
            .sessions
            .get(session_id)
            .filter(|s| !s.is_expired_at(now))
            .cloned()
    }

    /// Destroy a session and every refresh grant issued with it.
    pub async fn revoke(&self, session_id: &str) -> bool {
        let mut records = self.records.write().await;
        records.refresh.retain(|_, grant| grant.session_id != session_id);
        records.sessions.remove(session_id).is_some()
    }

    pub async fn insert_refresh(&self, digest: String, grant: RefreshGrant) {
        self.records.write().await.refresh.insert(digest, grant);
    }

    /// Remove and return the grant for `digest` if it is live. Single use.
    pub async fn take_refresh(&self, digest: &str, now: DateTime<Utc>) -> Option<RefreshGrant> {
        self.records
            .write()
            .await
            .refresh
            .remove(digest)
            .filter(|grant| now < grant.expires_at)
    }

    /// Destroy the grant for `digest` together with its session.
    pub async fn revoke_refresh(&self, digest: &str) -> Option<RefreshGrant> {
        let mut records = self.records.write().await;
        let grant = records.refresh.remove(digest)?;
        records.sessions.remove(&grant.session_id);
        Some(grant)
    }

    pub async fn purge_expired(&self, now: DateTime<Utc>) -> PurgeStats {
        let mut records = self.records.write().await;
        let sessions_before = records.sessions.len();
        let refresh_before = records.refresh.len();
        records.sessions.retain(|_, s| !s.is_expired_at(now));
        records.refresh.retain(|_, g| now < g.expires_at);
        PurgeStats {
            sessions: sessions_before - records.sessions.len(),
            refresh_grants: refresh_before - records.refresh.len(),
        }
    }

    /// Number of stored sessions, expired or not.
    pub async fn len(&self) -> usize {
        self.records.read().await.sessions.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
