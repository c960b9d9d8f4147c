// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Authorization requests in flight between `/authorize` and `/token`.
//!
//! Records are bounded by an LRU capacity and a TTL, so abandoned flows
//! cannot grow memory. Every lookup that advances a flow removes the record,
//! which makes `state` values and proxy codes single-use.

use std::num::NonZeroUsize;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use lru::LruCache;

/// Default lifetime of a pending authorization (10 minutes).
pub const DEFAULT_PENDING_TTL: Duration = Duration::from_secs(600);

/// Default maximum number of flows in flight.
pub const DEFAULT_PENDING_CAPACITY: usize = 10_000;

/// Progress of one authorization flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowState {
    Init,
    RedirectedToUpstream,
    CodeReceived,
    TokenExchanged,
    SessionStored,
    ClientTokenIssued,
}

impl FlowState {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlowState::Init => "init",
            FlowState::RedirectedToUpstream => "redirected_to_upstream",
            FlowState::CodeReceived => "code_received",
            FlowState::TokenExchanged => "token_exchanged",
            FlowState::SessionStored => "session_stored",
            FlowState::ClientTokenIssued => "client_token_issued",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsentDecision {
    Pending,
    Granted,
    Denied,
}

/// One client authorization request.
#[derive(Debug, Clone)]
pub struct PendingAuthorization {
    /// Proxy-generated `state` sent to the consent page and the upstream IdP
    pub state: String,
    pub client_id: String,
    pub redirect_uri: String,
    /// `state` supplied by the client, echoed back on redirect
    pub client_state: Option<String>,
    /// Client's S256 challenge; absent when the client sent no PKCE pair
    pub client_challenge: Option<String>,
    pub scopes: Vec<String>,
    /// Verifier of the proxy-managed PKCE pair used with the upstream IdP
    pub upstream_verifier: String,
    pub consent: ConsentDecision,
    /// Digest of the token bound to the browser shown the consent page
    pub consent_csrf: Option<String>,
    pub flow: FlowState,
    pub upstream_code: Option<String>,
}

struct Entry {
    record: PendingAuthorization,
    expires_at: Instant,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Pending authorizations indexed by proxy `state`, then by proxy code.
pub struct PendingStore {
    by_state: Mutex<LruCache<String, Entry>>,
    by_code: Mutex<LruCache<String, Entry>>,
    ttl: Duration,
}

impl PendingStore {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            by_state: Mutex::new(LruCache::new(capacity)),
            by_code: Mutex::new(LruCache::new(capacity)),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Store (or re-store) a record under its `state` with a fresh TTL.
    pub fn insert(&self, record: PendingAuthorization) {
        let entry = Entry {
            expires_at: Instant::now() + self.ttl,
            record,
        };
        lock(&self.by_state).put(entry.record.state.clone(), entry);
    }

    /// Copy of the live record for `state`, leaving it in place.
    pub fn peek_state(&self, state: &str) -> Option<PendingAuthorization> {
        let mut cache = lock(&self.by_state);
        let expired = match cache.peek(state) {
            Some(entry) if Instant::now() < entry.expires_at => return Some(entry.record.clone()),
            Some(_) => true,
            None => false,
        };
        if expired {
            cache.pop(state);
        }
        None
    }

    /// Remove and return the live record for `state`.
    pub fn take_state(&self, state: &str) -> Option<PendingAuthorization> {
        take_live(&self.by_state, state)
    }

    /// Index a record by the authorization code handed to the client.
    pub fn insert_code(&self, code: String, record: PendingAuthorization) {
        let entry = Entry {
            expires_at: Instant::now() + self.ttl,
            record,
        };
        lock(&self.by_code).put(code, entry);
    }

    /// Remove and return the live record for a client authorization code.
    pub fn take_code(&self, code: &str) -> Option<PendingAuthorization> {
        take_live(&self.by_code, code)
    }

    /// Drop expired records from both indexes. Returns how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        purge(&self.by_state, now) + purge(&self.by_code, now)
    }

    pub fn len(&self) -> usize {
        lock(&self.by_state).len() + lock(&self.by_code).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for PendingStore {
    fn default() -> Self {
        Self::new(DEFAULT_PENDING_CAPACITY, DEFAULT_PENDING_TTL)
    }
}

fn take_live(cache: &Mutex<LruCache<String, Entry>>, key: &str) -> Option<PendingAuthorization> {
    lock(cache)
        .pop(key)
        .filter(|entry| Instant::now() < entry.expires_at)
        .map(|entry| entry.record)
}

fn purge(cache: &Mutex<LruCache<String, Entry>>, now: Instant) -> usize {
    let mut cache = lock(cache);
    let expired: Vec<String> = cache
        .iter()
        .filter(|(_, entry)| entry.expires_at <= now)
        .map(|(key, _)| key.clone())
        .collect();
    for key in &expired {
        cache.pop(key);
    }
    expired.len()
}
