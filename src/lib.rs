// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! CNPG Gateway - Authentication gateway for CloudNativePG operations
//!
//! This crate guards the PostgreSQL cluster/role/database operations with
//! bearer-token authentication, and can act as an OAuth authorization server
//! that proxies an upstream identity provider.
//!
//! ## Modules
//!
//! - `api` - HTTP API handlers (Axum): health, discovery, OAuth endpoints
//! - `auth` - Bearer token verification (JWKS cache, verifier, middleware)
//! - `oauth` - Authorization-code + PKCE issuance proxy and session storage
//! - `gateway` - Dual-gateway composition in front of the downstream handler

pub mod api;
pub mod auth;
pub mod config;
pub mod error;
pub mod gateway;
pub mod oauth;
pub mod state;

pub use gateway::{AuthGateway, GatewayError};
