// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! PKCE (RFC 7636) with the S256 method only.

use base64ct::{Base64UrlUnpadded, Encoding};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use super::cipher::{random_token, CipherError};

pub const S256: &str = "S256";

/// Verifier and its S256 challenge.
#[derive(Debug, Clone)]
pub struct PkcePair {
    pub verifier: String,
    pub challenge: String,
}

impl PkcePair {
    /// 32 random bytes, base64url-encoded into a 43-character verifier.
    pub fn generate() -> Result<Self, CipherError> {
        let verifier = random_token(32)?;
        let challenge = challenge_for(&verifier);
        Ok(Self {
            verifier,
            challenge,
        })
    }
}

/// `BASE64URL(SHA256(verifier))`.
pub fn challenge_for(verifier: &str) -> String {
    Base64UrlUnpadded::encode_string(&Sha256::digest(verifier.as_bytes()))
}

/// Verifier syntax per RFC 7636 §4.1: 43-128 unreserved characters.
pub fn is_valid_verifier(verifier: &str) -> bool {
    (43..=128).contains(&verifier.len())
        && verifier
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_' | b'~'))
}

/// A challenge is the unpadded base64url encoding of a SHA-256 digest.
pub fn is_valid_challenge(challenge: &str) -> bool {
    challenge.len() == 43
        && Base64UrlUnpadded::decode_vec(challenge).is_ok_and(|bytes| bytes.len() == 32)
}

/// Check `verifier` against a stored S256 `challenge` in constant time.
pub fn verify_s256(verifier: &str, challenge: &str) -> bool {
    if !is_valid_verifier(verifier) {
        return false;
    }
    challenge_for(verifier)
        .as_bytes()
        .ct_eq(challenge.as_bytes())
        .into()
}
