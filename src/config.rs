// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Runtime Configuration
//!
//! Configuration is merged at startup from an optional YAML file and the
//! environment. File values win over environment values.
//!
//! ## Environment Variables
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `OIDC_CONFIG_PATH` | YAML config file | `/etc/mcp/oidc.yaml`, `/config/oidc.yaml`, `./oidc.yaml` |
//! | `OIDC_ISSUER` | Upstream IdP issuer URL | Required |
//! | `OIDC_AUDIENCE` | Expected `aud` of upstream tokens | Required |
//! | `OIDC_JWKS_URI` | JWKS URL override (skips discovery) | Discovered |
//! | `OIDC_SCOPE` | Scope required on every protected request | None |
//! | `OIDC_CLIENT_ID` | Gateway client id at the IdP | Proxy mode |
//! | `OIDC_CLIENT_SECRET` | Gateway client secret at the IdP | Proxy mode |
//! | `OIDC_CLIENT_SECRET_FILE` | File holding the client secret | None |
//! | `PUBLIC_URL` | Externally visible base URL of the gateway | Proxy mode |
//! | `DCR_PROXY_URL` | Upstream dynamic client registration endpoint | Discovered |
//! | `SESSION_ENCRYPTION_KEY` | Session AEAD key (base64 32 bytes or passphrase) | Ephemeral |
//! | `SESSION_SIGNING_KEY_PATH` | PKCS#8 PEM ES256 key for session tokens | Ephemeral |
//! | `JWKS_CACHE_TTL_SECS` | JWKS cache lifetime | `3600` |
//! | `JWKS_STALE_GRACE_SECS` | Serve stale keys this long when the IdP is down | `0` |
//! | `UPSTREAM_TIMEOUT_SECS` | Timeout for every outbound call | `5` |
//! | `SESSION_TTL_SECS` | Session token lifetime (max 3600) | `3600` |
//! | `PROXY_ROUTE_PREFIX` | Routes guarded by session tokens | `/mcp` |
//! | `DIRECT_ROUTE_PREFIX` | Routes guarded by upstream tokens | `/test` |
//! | `HOST` | Server bind address | `0.0.0.0` |
//! | `PORT` | Server bind port | `8080` |
//! | `TLS_CERT_PATH` / `TLS_KEY_PATH` | PEM certificate chain and key | Plain HTTP |
//! | `LOG_FORMAT` | Logging format (`json` or `pretty`) | `pretty` |
//! | `RUST_LOG` | Log level filter | `info,tower_http=debug` |
//!
//! Proxy mode is enabled when client id, client secret and public URL are all
//! set; setting only some of them is an error.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use url::Url;

use crate::oauth::clients::is_loopback;
use crate::oauth::signing::MAX_SESSION_TTL;

pub const CONFIG_PATH_ENV: &str = "OIDC_CONFIG_PATH";
pub const ISSUER_ENV: &str = "OIDC_ISSUER";
pub const AUDIENCE_ENV: &str = "OIDC_AUDIENCE";
pub const JWKS_URI_ENV: &str = "OIDC_JWKS_URI";
pub const SCOPE_ENV: &str = "OIDC_SCOPE";
pub const CLIENT_ID_ENV: &str = "OIDC_CLIENT_ID";
pub const CLIENT_SECRET_ENV: &str = "OIDC_CLIENT_SECRET";
pub const CLIENT_SECRET_FILE_ENV: &str = "OIDC_CLIENT_SECRET_FILE";
pub const PUBLIC_URL_ENV: &str = "PUBLIC_URL";
pub const DCR_PROXY_URL_ENV: &str = "DCR_PROXY_URL";
pub const SESSION_ENCRYPTION_KEY_ENV: &str = "SESSION_ENCRYPTION_KEY";
pub const SESSION_SIGNING_KEY_PATH_ENV: &str = "SESSION_SIGNING_KEY_PATH";
pub const JWKS_CACHE_TTL_ENV: &str = "JWKS_CACHE_TTL_SECS";
pub const JWKS_STALE_GRACE_ENV: &str = "JWKS_STALE_GRACE_SECS";
pub const UPSTREAM_TIMEOUT_ENV: &str = "UPSTREAM_TIMEOUT_SECS";
pub const SESSION_TTL_ENV: &str = "SESSION_TTL_SECS";
pub const PROXY_ROUTE_PREFIX_ENV: &str = "PROXY_ROUTE_PREFIX";
pub const DIRECT_ROUTE_PREFIX_ENV: &str = "DIRECT_ROUTE_PREFIX";
pub const HOST_ENV: &str = "HOST";
pub const PORT_ENV: &str = "PORT";
pub const TLS_CERT_PATH_ENV: &str = "TLS_CERT_PATH";
pub const TLS_KEY_PATH_ENV: &str = "TLS_KEY_PATH";
pub const LOG_FORMAT_ENV: &str = "LOG_FORMAT";

/// Searched in order when `OIDC_CONFIG_PATH` is unset.
pub const DEFAULT_CONFIG_PATHS: [&str; 3] =
    ["/etc/mcp/oidc.yaml", "/config/oidc.yaml", "./oidc.yaml"];

pub const DEFAULT_JWKS_CACHE_TTL_SECS: u64 = 3600;
pub const DEFAULT_UPSTREAM_TIMEOUT_SECS: u64 = 5;
pub const DEFAULT_PROXY_ROUTE_PREFIX: &str = "/mcp";
pub const DEFAULT_DIRECT_ROUTE_PREFIX: &str = "/test";
pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 8080;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} is required")]
    Missing(&'static str),
    #[error("{field} is not a valid URL: {reason}")]
    InvalidUrl { field: &'static str, reason: String },
    #[error("{0} must use https (http is only allowed for loopback hosts)")]
    InsecureUrl(&'static str),
    #[error("{key} must be a non-negative integer, got {value:?}")]
    InvalidNumber { key: &'static str, value: String },
    #[error("session TTL {0}s exceeds the 3600s maximum")]
    SessionTtlTooLong(u64),
    #[error("session TTL must be positive")]
    SessionTtlZero,
    #[error("proxy mode is partially configured, missing: {0}")]
    IncompleteProxy(String),
    #[error("{0} must be a distinct non-root path starting with '/'")]
    InvalidPrefix(&'static str),
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Yaml {
        path: PathBuf,
        source: serde_yaml::Error,
    },
}

/// A value that must not end up in logs.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Secret([redacted])")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    Json,
    #[default]
    Pretty,
}

impl LogFormat {
    fn parse(value: &str) -> Self {
        if value.eq_ignore_ascii_case("json") {
            LogFormat::Json
        } else {
            LogFormat::Pretty
        }
    }
}

/// YAML config file. Every field is optional; absent fields fall back to env.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub issuer: Option<String>,
    pub audience: Option<String>,
    pub jwks_uri: Option<String>,
    pub scope: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub client_secret_file: Option<PathBuf>,
    pub public_url: Option<String>,
    pub dcr_proxy_url: Option<String>,
    pub session_encryption_key: Option<String>,
    pub session_signing_key_path: Option<PathBuf>,
    pub jwks_cache_ttl_secs: Option<u64>,
    pub jwks_stale_grace_secs: Option<u64>,
    pub upstream_timeout_secs: Option<u64>,
    pub session_ttl_secs: Option<u64>,
    pub proxy_route_prefix: Option<String>,
    pub direct_route_prefix: Option<String>,
}

impl FileConfig {
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_yaml::from_str(&text).map_err(|source| ConfigError::Yaml {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Settings for the OAuth issuance proxy.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub client_id: String,
    pub client_secret: Secret,
    /// Without trailing slash
    pub public_url: String,
    pub encryption_key: Option<Secret>,
    pub signing_key_path: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub tls: Option<TlsPaths>,
    pub log_format: LogFormat,
}

#[derive(Debug, Clone)]
pub struct TlsPaths {
    pub cert: PathBuf,
    pub key: PathBuf,
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub issuer: String,
    pub audience: String,
    pub jwks_uri: Option<String>,
    pub required_scope: Option<String>,
    pub dcr_proxy_url: Option<String>,
    /// `None` runs the gateway in direct-only mode
    pub proxy: Option<ProxyConfig>,
    pub jwks_cache_ttl: Duration,
    pub jwks_stale_grace: Option<Duration>,
    pub upstream_timeout: Duration,
    pub session_ttl: Duration,
    pub proxy_route_prefix: String,
    pub direct_route_prefix: String,
    pub server: ServerConfig,
}

impl GatewayConfig {
    /// Load from the config file (if any) and the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        let env = |key: &str| std::env::var(key).ok();
        let file = match locate_config_file(env(CONFIG_PATH_ENV)) {
            Some(path) => Some(FileConfig::from_path(&path)?),
            None => None,
        };
        Self::from_sources(file, env)
    }

    /// Merge `file` over the variables returned by `env`, then validate.
    pub fn from_sources<F>(file: Option<FileConfig>, env: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let file = file.unwrap_or_default();
        let env = |key: &str| env(key).filter(|v| !v.trim().is_empty());

        let issuer = file
            .issuer
            .or_else(|| env(ISSUER_ENV))
            .ok_or(ConfigError::Missing(ISSUER_ENV))?;
        check_url(ISSUER_ENV, &issuer)?;
        let audience = file
            .audience
            .or_else(|| env(AUDIENCE_ENV))
            .ok_or(ConfigError::Missing(AUDIENCE_ENV))?;

        let jwks_uri = file.jwks_uri.or_else(|| env(JWKS_URI_ENV));
        if let Some(uri) = &jwks_uri {
            check_url(JWKS_URI_ENV, uri)?;
        }
        let dcr_proxy_url = file.dcr_proxy_url.or_else(|| env(DCR_PROXY_URL_ENV));
        if let Some(uri) = &dcr_proxy_url {
            check_url(DCR_PROXY_URL_ENV, uri)?;
        }

        let client_secret = match file.client_secret.or_else(|| env(CLIENT_SECRET_ENV)) {
            Some(secret) => Some(secret),
            None => match file
                .client_secret_file
                .or_else(|| env(CLIENT_SECRET_FILE_ENV).map(PathBuf::from))
            {
                Some(path) => Some(read_secret_file(&path)?),
                None => None,
            },
        };
        let proxy = proxy_config(
            file.client_id.or_else(|| env(CLIENT_ID_ENV)),
            client_secret,
            file.public_url.or_else(|| env(PUBLIC_URL_ENV)),
            file.session_encryption_key
                .or_else(|| env(SESSION_ENCRYPTION_KEY_ENV)),
            file.session_signing_key_path
                .or_else(|| env(SESSION_SIGNING_KEY_PATH_ENV).map(PathBuf::from)),
        )?;

        let secs = |from_file: Option<u64>, key: &'static str, default: u64| {
            match from_file {
                Some(v) => Ok(v),
                None => env(key).map_or(Ok(default), |v| parse_u64(key, &v)),
            }
        };
        let session_ttl = secs(file.session_ttl_secs, SESSION_TTL_ENV, MAX_SESSION_TTL.as_secs())?;
        if session_ttl == 0 {
            return Err(ConfigError::SessionTtlZero);
        }
        if session_ttl > MAX_SESSION_TTL.as_secs() {
            return Err(ConfigError::SessionTtlTooLong(session_ttl));
        }
        let stale_grace = secs(file.jwks_stale_grace_secs, JWKS_STALE_GRACE_ENV, 0)?;

        let proxy_route_prefix = prefix(
            PROXY_ROUTE_PREFIX_ENV,
            file.proxy_route_prefix
                .or_else(|| env(PROXY_ROUTE_PREFIX_ENV)),
            DEFAULT_PROXY_ROUTE_PREFIX,
        )?;
        let direct_route_prefix = prefix(
            DIRECT_ROUTE_PREFIX_ENV,
            file.direct_route_prefix
                .or_else(|| env(DIRECT_ROUTE_PREFIX_ENV)),
            DEFAULT_DIRECT_ROUTE_PREFIX,
        )?;

        if proxy_route_prefix == direct_route_prefix {
            return Err(ConfigError::InvalidPrefix(DIRECT_ROUTE_PREFIX_ENV));
        }

        let port = match env(PORT_ENV) {
            Some(v) => u16::try_from(parse_u64(PORT_ENV, &v)?).map_err(|_| {
                ConfigError::InvalidNumber {
                    key: PORT_ENV,
                    value: v,
                }
            })?,
            None => DEFAULT_PORT,
        };
        let tls = match (env(TLS_CERT_PATH_ENV), env(TLS_KEY_PATH_ENV)) {
            (Some(cert), Some(key)) => Some(TlsPaths {
                cert: cert.into(),
                key: key.into(),
            }),
            (Some(_), None) => return Err(ConfigError::Missing(TLS_KEY_PATH_ENV)),
            (None, Some(_)) => return Err(ConfigError::Missing(TLS_CERT_PATH_ENV)),
            (None, None) => None,
        };

        Ok(Self {
            issuer,
            audience,
            jwks_uri,
            required_scope: file.scope.or_else(|| env(SCOPE_ENV)),
            dcr_proxy_url,
            proxy,
            jwks_cache_ttl: Duration::from_secs(secs(
                file.jwks_cache_ttl_secs,
                JWKS_CACHE_TTL_ENV,
                DEFAULT_JWKS_CACHE_TTL_SECS,
            )?),
            jwks_stale_grace: (stale_grace > 0).then(|| Duration::from_secs(stale_grace)),
            upstream_timeout: Duration::from_secs(secs(
                file.upstream_timeout_secs,
                UPSTREAM_TIMEOUT_ENV,
                DEFAULT_UPSTREAM_TIMEOUT_SECS,
            )?),
            session_ttl: Duration::from_secs(session_ttl),
            proxy_route_prefix,
            direct_route_prefix,
            server: ServerConfig {
                host: env(HOST_ENV).unwrap_or_else(|| DEFAULT_HOST.to_string()),
                port,
                tls,
                log_format: env(LOG_FORMAT_ENV)
                    .map(|v| LogFormat::parse(&v))
                    .unwrap_or_default(),
            },
        })
    }

    pub fn proxy_enabled(&self) -> bool {
        self.proxy.is_some()
    }
}

fn locate_config_file(explicit: Option<String>) -> Option<PathBuf> {
    match explicit.filter(|p| !p.is_empty()) {
        Some(path) => Some(PathBuf::from(path)),
        None => DEFAULT_CONFIG_PATHS
            .iter()
            .map(PathBuf::from)
            .find(|p| p.is_file()),
    }
}

fn read_secret_file(path: &Path) -> Result<String, ConfigError> {
    let secret = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(secret.trim().to_string())
}

fn proxy_config(
    client_id: Option<String>,
    client_secret: Option<String>,
    public_url: Option<String>,
    encryption_key: Option<String>,
    signing_key_path: Option<PathBuf>,
) -> Result<Option<ProxyConfig>, ConfigError> {
    match (client_id, client_secret, public_url) {
        (None, None, None) => Ok(None),
        (Some(client_id), Some(client_secret), Some(public_url)) => {
            check_url(PUBLIC_URL_ENV, &public_url)?;
            Ok(Some(ProxyConfig {
                client_id,
                client_secret: Secret::new(client_secret),
                public_url: public_url.trim_end_matches('/').to_string(),
                encryption_key: encryption_key.map(Secret::new),
                signing_key_path,
            }))
        }
        (client_id, client_secret, public_url) => {
            let missing: Vec<&str> = [
                (client_id.is_none(), CLIENT_ID_ENV),
                (client_secret.is_none(), CLIENT_SECRET_ENV),
                (public_url.is_none(), PUBLIC_URL_ENV),
            ]
            .into_iter()
            .filter_map(|(absent, name)| absent.then_some(name))
            .collect();
            Err(ConfigError::IncompleteProxy(missing.join(", ")))
        }
    }
}

/// HTTPS required, except for loopback hosts.
fn check_url(field: &'static str, value: &str) -> Result<(), ConfigError> {
    let url = Url::parse(value).map_err(|e| ConfigError::InvalidUrl {
        field,
        reason: e.to_string(),
    })?;
    match url.scheme() {
        "https" => Ok(()),
        "http" if is_loopback(&url) => Ok(()),
        _ => Err(ConfigError::InsecureUrl(field)),
    }
}

fn parse_u64(key: &'static str, value: &str) -> Result<u64, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidNumber {
            key,
            value: value.to_string(),
        })
}

fn prefix(
    key: &'static str,
    value: Option<String>,
    default: &str,
) -> Result<String, ConfigError> {
    let value = value.unwrap_or_else(|| default.to_string());
    let trimmed = value.trim_end_matches('/');
    if !value.starts_with('/') || trimmed.is_empty() {
        return Err(ConfigError::InvalidPrefix(key));
    }
    Ok(trimmed.to_string())
}
