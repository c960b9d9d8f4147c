// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Authentication Module
//!
//! Bearer token authentication for the CNPG operations surface.
//!
//! ## Auth Flow
//!
//! 1. Client sends `Authorization: Bearer <JWT>`
//! 2. `require_auth` extracts the token and hands it to the route's
//!    [`Authenticator`]:
//!    - `OidcAuthenticator` trusts the upstream IdP's JWKS
//!    - `ProxyAuthenticator` trusts only session tokens minted by this
//!      gateway, backed by a live session
//! 3. The verifier pins `alg` to an allow-list, resolves `kid`, checks the
//!    signature, then `iss`, `aud`, `exp`/`iat` (60 s skew) and scope
//! 4. The resulting [`AuthContext`] is attached to the request and read by
//!    handlers through the [`Auth`] extractor
//!
//! ## Security
//!
//! - Only health and discovery endpoints are unauthenticated
//! - JWKS keys are cached per issuer with single-flight refresh
//! - Failure responses are generic; reasons are only logged

pub mod authenticator;
pub mod claims;
pub mod error;
pub mod extractor;
pub mod jwks;
pub mod middleware;
pub mod verifier;

pub use authenticator::{Authenticator, OidcAuthenticator, ProxyAuthenticator};
pub use claims::{AuthContext, ClaimRules, TokenClaims, TokenSource};
pub use error::{AuthError, AuthErrorKind};
pub use extractor::Auth;
pub use jwks::{KeyCache, KeyCacheError, KeyCacheOptions};
pub use middleware::{require_auth, AuthLayer};
pub use verifier::{KeySource, TokenVerifier};
