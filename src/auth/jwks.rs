// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! JWKS (JSON Web Key Set) fetching and caching.
//!
//! ## Behaviour
//!
//! - One keyset per trusted issuer, refreshed when its TTL elapses
//! - Concurrent misses for the same issuer share a single outbound fetch
//! - On fetch failure a previous keyset may be served for a bounded grace
//!   period; otherwise lookups fail closed with `Unavailable`
//! - An unknown `kid` forces at most one refresh per `min_refresh_interval`
//!
//! ## Usage
//!
//! Build one `KeyCache` per gateway, register each issuer with its JWKS URI,
//! and share it through `Arc`. `run_refresher` keeps keys warm in the
//! background.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use jsonwebtoken::jwk::{AlgorithmParameters, Jwk, JwkSet, KeyAlgorithm, PublicKeyUse};
use jsonwebtoken::{Algorithm, DecodingKey};
use tokio::sync::{OnceCell, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::claims::normalize_issuer;
use super::error::AuthError;

/// Default JWKS cache TTL (1 hour).
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(3600);

/// Default timeout for a JWKS fetch.
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(5);

/// Minimum spacing between refreshes forced by an unknown `kid`.
pub const DEFAULT_MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(30);

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);

/// Key cache errors.
///
/// `Clone` because a single fetch result is handed to every coalesced waiter.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyCacheError {
    #[error("issuer {0} is not trusted by this key cache")]
    UnknownIssuer(String),
    #[error("no key with id {0} in the issuer's JWKS")]
    UnknownKey(String),
    #[error("JWKS endpoint unavailable: {0}")]
    Unavailable(String),
    #[error("JWKS document rejected: {0}")]
    InvalidDocument(String),
    #[error("failed to build HTTP client: {0}")]
    Client(String),
}

impl From<KeyCacheError> for AuthError {
    fn from(err: KeyCacheError) -> Self {
        match err {
            KeyCacheError::UnknownIssuer(_) => AuthError::InvalidIssuer,
            KeyCacheError::UnknownKey(_) => AuthError::NoMatchingKey,
            KeyCacheError::Unavailable(msg) | KeyCacheError::InvalidDocument(msg) => {
                AuthError::UpstreamUnavailable(msg)
            }
            KeyCacheError::Client(msg) => AuthError::InternalError(msg),
        }
    }
}

/// Tuning knobs for [`KeyCache`].
#[derive(Debug, Clone)]
pub struct KeyCacheOptions {
    /// How long a fetched keyset is served without refreshing
    pub ttl: Duration,
    /// How long past TTL a keyset may still be served when refresh fails
    pub stale_grace: Option<Duration>,
    /// Timeout for each outbound JWKS request
    pub fetch_timeout: Duration,
    /// Minimum spacing between refreshes forced by an unknown `kid`
    pub min_refresh_interval: Duration,
}

impl Default for KeyCacheOptions {
    fn default() -> Self {
        Self {
            ttl: DEFAULT_CACHE_TTL,
            stale_grace: None,
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
            min_refresh_interval: DEFAULT_MIN_REFRESH_INTERVAL,
        }
    }
}

/// Public key material for one `kid`.
#[derive(Clone)]
pub struct VerificationKey {
    pub kid: String,
    /// Algorithm pinned by the JWK's `alg` member, if present
    pub algorithm: Option<Algorithm>,
    pub key: DecodingKey,
}

impl std::fmt::Debug for VerificationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VerificationKey")
            .field("kid", &self.kid)
            .field("algorithm", &self.algorithm)
            .finish_non_exhaustive()
    }
}

/// Keys of one issuer as of `fetched_at`.
#[derive(Debug)]
pub struct SigningKeySet {
    keys: HashMap<String, VerificationKey>,
    fetched_at: Instant,
}

impl SigningKeySet {
    /// Build a keyset from a JWKS document, skipping keys that cannot verify signatures.
    pub fn from_jwks(jwks: &JwkSet) -> Self {
        let keys = jwks
            .keys
            .iter()
            .filter_map(|jwk| match jwk_to_verification_key(jwk) {
                Ok(key) => Some((key.kid.clone(), key)),
                Err(reason) => {
                    debug!(kid = ?jwk.common.key_id, reason, "Skipping JWK");
                    None
                }
            })
            .collect();

        Self {
            keys,
            fetched_at: Instant::now(),
        }
    }

    pub fn get(&self, kid: &str) -> Option<&VerificationKey> {
        self.keys.get(kid)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn age(&self) -> Duration {
        self.fetched_at.elapsed()
    }

    fn is_fresh(&self, ttl: Duration) -> bool {
        self.age() < ttl
    }
}

type FetchOutcome = Result<Arc<SigningKeySet>, KeyCacheError>;

/// Cache slot for one issuer.
struct IssuerEntry {
    jwks_uri: String,
    current: RwLock<Option<Arc<SigningKeySet>>>,
    /// Shared cell of the refresh in flight, if any
    inflight: Mutex<Option<Arc<OnceCell<FetchOutcome>>>>,
}

/// Snapshot of one issuer's cache state, for readiness reporting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuerStatus {
    pub issuer: String,
    pub cached: bool,
    pub keys: usize,
}

/// Cache of upstream signing keys, keyed by issuer.
pub struct KeyCache {
    issuers: HashMap<String, IssuerEntry>,
    options: KeyCacheOptions,
    client: reqwest::Client,
    fetches: AtomicU64,
}

impl KeyCache {
    /// Create a cache trusting the given `(issuer, jwks_uri)` pairs.
    pub fn new<I, S, U>(options: KeyCacheOptions, sources: I) -> Result<Self, KeyCacheError>
    where
        I: IntoIterator<Item = (S, U)>,
        S: AsRef<str>,
        U: Into<String>,
    {
        let client = reqwest::Client::builder()
            .timeout(options.fetch_timeout)
            .build()
            .map_err(|e| KeyCacheError::Client(e.to_string()))?;

        let issuers = sources
            .into_iter()
            .map(|(issuer, jwks_uri)| {
                (
                    normalize_issuer(issuer.as_ref()).to_string(),
                    IssuerEntry {
                        jwks_uri: jwks_uri.into(),
                        current: RwLock::new(None),
                        inflight: Mutex::new(None),
                    },
                )
            })
            .collect();

        Ok(Self {
            issuers,
            options,
            client,
            fetches: AtomicU64::new(0),
        })
    }

    pub fn options(&self) -> &KeyCacheOptions {
        &self.options
    }

    /// Trusted issuers, normalised.
    pub fn issuers(&self) -> impl Iterator<Item = &str> {
        self.issuers.keys().map(String::as_str)
    }

    /// Number of outbound JWKS requests performed so far.
    pub fn fetch_count(&self) -> u64 {
        self.fetches.load(Ordering::Relaxed)
    }

    /// Resolve the key `kid` of `issuer`, fetching the JWKS when needed.
    pub async fn get_key(&self, issuer: &str, kid: &str) -> Result<VerificationKey, KeyCacheError> {
        let issuer = normalize_issuer(issuer);
        let entry = self.entry(issuer)?;
        let cached = entry.current.read().await.clone();

        if let Some(set) = &cached {
            if set.is_fresh(self.options.ttl) {
                if let Some(key) = set.get(kid) {
                    return Ok(key.clone());
                }
                if set.age() < self.options.min_refresh_interval {
                    debug!(issuer, kid, "Unknown kid within refresh interval, not refetching");
                    return Err(KeyCacheError::UnknownKey(kid.to_string()));
                }
                debug!(issuer, kid, "Unknown kid, forcing JWKS refresh");
            }
        }

        let observed = cached.as_ref().map(|set| set.fetched_at);
        match self.refresh_entry(issuer, entry, observed).await {
            Ok(set) => set
                .get(kid)
                .cloned()
                .ok_or_else(|| KeyCacheError::UnknownKey(kid.to_string())),
            Err(err) => self.serve_stale(issuer, cached, kid, err),
        }
    }

    /// Force a refresh of `issuer`'s keyset, coalesced with any refresh in flight.
    pub async fn refresh(&self, issuer: &str) -> Result<usize, KeyCacheError> {
        let issuer = normalize_issuer(issuer);
        let entry = self.entry(issuer)?;
        let observed = entry.current.read().await.as_ref().map(|set| set.fetched_at);
        self.refresh_entry(issuer, entry, observed)
            .await
            .map(|set| set.len())
    }

    /// Check if `issuer` has a keyset within TTL.
    pub async fn is_cached(&self, issuer: &str) -> bool {
        match self.issuers.get(normalize_issuer(issuer)) {
            Some(entry) => entry
                .current
                .read()
                .await
                .as_ref()
                .is_some_and(|set| set.is_fresh(self.options.ttl)),
            None => false,
        }
    }

    /// Cache state of every trusted issuer.
    pub async fn status(&self) -> Vec<IssuerStatus> {
        let mut statuses = Vec::with_capacity(self.issuers.len());
        for (issuer, entry) in &self.issuers {
            let current = entry.current.read().await;
            statuses.push(IssuerStatus {
                issuer: issuer.clone(),
                cached: current
                    .as_ref()
                    .is_some_and(|set| set.is_fresh(self.options.ttl)),
                keys: current.as_ref().map_or(0, |set| set.len()),
            });
        }
        statuses
    }

    /// Keep every issuer's keys warm until `shutdown` fires.
    ///
    /// Refreshes at three quarters of the TTL; failures back off exponentially
    /// from one second up to that interval.
    pub async fn run_refresher(self: Arc<Self>, shutdown: CancellationToken) {
        let interval = (self.options.ttl * 3 / 4).max(INITIAL_BACKOFF);
        let mut backoff = INITIAL_BACKOFF;
        info!(interval_secs = interval.as_secs(), "JWKS refresher started");

        loop {
            let mut failed = false;
            for issuer in self.issuers.keys() {
                if let Err(e) = self.refresh(issuer).await {
                    warn!(issuer = %issuer, error = %e, "Background JWKS refresh failed");
                    failed = true;
                }
            }

            let delay = if failed {
                let delay = backoff;
                backoff = (backoff * 2).min(interval);
                delay
            } else {
                backoff = INITIAL_BACKOFF;
                interval
            };

            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("JWKS refresher shutting down");
                    break;
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    fn entry(&self, issuer: &str) -> Result<&IssuerEntry, KeyCacheError> {
        self.issuers
            .get(issuer)
            .ok_or_else(|| KeyCacheError::UnknownIssuer(issuer.to_string()))
    }

    /// Join the refresh in flight for `entry`, or start one.
    async fn refresh_entry(
        &self,
        issuer: &str,
        entry: &IssuerEntry,
        observed: Option<Instant>,
    ) -> FetchOutcome {
        let cell = {
            let mut inflight = entry.inflight.lock().unwrap_or_else(PoisonError::into_inner);
            inflight
                .get_or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };

        let outcome = cell
            .get_or_init(|| self.fetch_and_store(issuer, entry, observed))
            .await
            .clone();

        let mut inflight = entry.inflight.lock().unwrap_or_else(PoisonError::into_inner);
        if inflight.as_ref().is_some_and(|c| Arc::ptr_eq(c, &cell)) {
            *inflight = None;
        }
        outcome
    }

    async fn fetch_and_store(
        &self,
        issuer: &str,
        entry: &IssuerEntry,
        observed: Option<Instant>,
    ) -> FetchOutcome {
        // A refresh that completed after the caller looked is as good as a new one.
        if let Some(current) = entry.current.read().await.as_ref() {
            if Some(current.fetched_at) != observed && current.is_fresh(self.options.ttl) {
                return Ok(Arc::clone(current));
            }
        }

        self.fetches.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();
        let jwks = match self.fetch_jwks(&entry.jwks_uri).await {
            Ok(jwks) => jwks,
            Err(e) => {
                warn!(issuer, jwks_uri = %entry.jwks_uri, error = %e, "JWKS fetch failed");
                return Err(e);
            }
        };

        let set = SigningKeySet::from_jwks(&jwks);
        if set.is_empty() {
            warn!(issuer, "JWKS contains no usable signing keys");
            return Err(KeyCacheError::InvalidDocument(
                "no usable signing keys".to_string(),
            ));
        }

        let set = Arc::new(set);
        *entry.current.write().await = Some(Arc::clone(&set));
        info!(
            issuer,
            keys = set.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "JWKS refreshed"
        );
        Ok(set)
    }

    /// Fetch JWKS from the endpoint.
    async fn fetch_jwks(&self, jwks_uri: &str) -> Result<JwkSet, KeyCacheError> {
        let response = self.client.get(jwks_uri).send().await.map_err(|e| {
            if e.is_timeout() {
                KeyCacheError::Unavailable(format!(
                    "timed out after {}ms",
                    self.options.fetch_timeout.as_millis()
                ))
            } else {
                KeyCacheError::Unavailable(e.to_string())
            }
        })?;

        if !response.status().is_success() {
            return Err(KeyCacheError::Unavailable(format!(
                "HTTP {} from JWKS endpoint",
                response.status()
            )));
        }

        response.json().await.map_err(|e| {
            if e.is_timeout() {
                KeyCacheError::Unavailable("timed out reading JWKS body".to_string())
            } else {
                KeyCacheError::InvalidDocument(e.to_string())
            }
        })
    }

    fn serve_stale(
        &self,
        issuer: &str,
        cached: Option<Arc<SigningKeySet>>,
        kid: &str,
        err: KeyCacheError,
    ) -> Result<VerificationKey, KeyCacheError> {
        let (Some(set), Some(grace)) = (cached, self.options.stale_grace) else {
            return Err(err);
        };
        if set.age() >= self.options.ttl + grace {
            return Err(err);
        }
        match set.get(kid) {
            Some(key) => {
                warn!(
                    issuer,
                    kid,
                    age_secs = set.age().as_secs(),
                    "Serving stale JWKS after refresh failure"
                );
                Ok(key.clone())
            }
            None => Err(err),
        }
    }
}

/// Convert a JWK to a verification key.
fn jwk_to_verification_key(jwk: &Jwk) -> Result<VerificationKey, &'static str> {
    let kid = jwk.common.key_id.clone().ok_or("missing kid")?;
    if matches!(jwk.common.public_key_use, Some(PublicKeyUse::Encryption)) {
        return Err("encryption key");
    }

    let key = match &jwk.algorithm {
        AlgorithmParameters::RSA(rsa) => {
            DecodingKey::from_rsa_components(&rsa.n, &rsa.e).map_err(|_| "invalid RSA key")?
        }
        AlgorithmParameters::EllipticCurve(ec) => {
            DecodingKey::from_ec_components(&ec.x, &ec.y).map_err(|_| "invalid EC key")?
        }
        AlgorithmParameters::OctetKeyPair(okp) => {
            DecodingKey::from_ed_components(&okp.x).map_err(|_| "invalid OKP key")?
        }
        _ => return Err("unsupported key type"),
    };

    let algorithm = jwk.common.key_algorithm.and_then(|alg| match alg {
        KeyAlgorithm::RS256 => Some(Algorithm::RS256),
        KeyAlgorithm::RS384 => Some(Algorithm::RS384),
        KeyAlgorithm::RS512 => Some(Algorithm::RS512),
        KeyAlgorithm::PS256 => Some(Algorithm::PS256),
        KeyAlgorithm::PS384 => Some(Algorithm::PS384),
        KeyAlgorithm::PS512 => Some(Algorithm::PS512),
        KeyAlgorithm::ES256 => Some(Algorithm::ES256),
        KeyAlgorithm::ES384 => Some(Algorithm::ES384),
        KeyAlgorithm::EdDSA => Some(Algorithm::EdDSA),
        _ => None,
    });

    Ok(VerificationKey {
        kid,
        algorithm,
        key,
    })
}
