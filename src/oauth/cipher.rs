// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Randomness, hashing and AEAD sealing of upstream tokens at rest.
//!
//! Blobs are AES-256-GCM sealed with the owning record's id as associated
//! data, so a blob copied onto another record fails to open.

use base64ct::{Base64, Base64UrlUnpadded, Encoding};
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use ring::rand::{SecureRandom, SystemRandom};
use sha2::{Digest, Sha256};

const KEY_DERIVATION_LABEL: &[u8] = b"cnpg-gateway/session-cipher/v1";

#[derive(Debug, thiserror::Error)]
pub enum CipherError {
    #[error("system randomness unavailable")]
    Randomness,
    #[error("invalid encryption key")]
    InvalidKey,
    #[error("failed to seal blob")]
    Seal,
    #[error("failed to open blob")]
    Open,
}

/// Fill a fresh buffer with `len` bytes from the system CSPRNG.
pub fn random_bytes(len: usize) -> Result<Vec<u8>, CipherError> {
    let mut buf = vec![0u8; len];
    SystemRandom::new()
        .fill(&mut buf)
        .map_err(|_| CipherError::Randomness)?;
    Ok(buf)
}

/// Unpadded base64url token carrying `len` random bytes.
pub fn random_token(len: usize) -> Result<String, CipherError> {
    Ok(Base64UrlUnpadded::encode_string(&random_bytes(len)?))
}

/// Lookup digest of a bearer secret, so stores never hold the secret itself.
pub fn token_digest(token: &str) -> String {
    Base64UrlUnpadded::encode_string(&Sha256::digest(token.as_bytes()))
}

/// Ciphertext plus nonce. Opaque outside this module.
#[derive(Clone)]
pub struct SealedBlob {
    nonce: [u8; NONCE_LEN],
    ciphertext: Vec<u8>,
}

impl std::fmt::Debug for SealedBlob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SealedBlob")
            .field("len", &self.ciphertext.len())
            .finish()
    }
}

/// AES-256-GCM cipher for session blobs.
pub struct SessionCipher {
    key: LessSafeKey,
    rng: SystemRandom,
}

impl SessionCipher {
    pub fn new(key: &[u8; 32]) -> Result<Self, CipherError> {
        let unbound = UnboundKey::new(&AES_256_GCM, key).map_err(|_| CipherError::InvalidKey)?;
        Ok(Self {
            key: LessSafeKey::new(unbound),
            rng: SystemRandom::new(),
        })
    }

    /// Build from configured key material.
    ///
    /// A base64 value decoding to exactly 32 bytes is used as-is; anything
    /// else is treated as a passphrase and hashed into a key.
    pub fn from_secret(secret: &str) -> Result<Self, CipherError> {
        let secret = secret.trim();
        if secret.is_empty() {
            return Err(CipherError::InvalidKey);
        }

        let raw = Base64::decode_vec(secret)
            .or_else(|_| Base64UrlUnpadded::decode_vec(secret))
            .ok()
            .filter(|bytes| bytes.len() == 32);

        let key: [u8; 32] = match raw {
            Some(bytes) => bytes.try_into().map_err(|_| CipherError::InvalidKey)?,
            None => {
                let mut hasher = Sha256::new();
                hasher.update(KEY_DERIVATION_LABEL);
                hasher.update(secret.as_bytes());
                hasher.finalize().into()
            }
        };
        Self::new(&key)
    }

    /// Fresh random key, valid for this process only.
    pub fn generate() -> Result<Self, CipherError> {
        let bytes = random_bytes(32)?;
        let key: [u8; 32] = bytes.try_into().map_err(|_| CipherError::InvalidKey)?;
        Self::new(&key)
    }

    pub fn seal(&self, record_id: &str, plaintext: &[u8]) -> Result<SealedBlob, CipherError> {
        let mut nonce = [0u8; NONCE_LEN];
        self.rng.fill(&mut nonce).map_err(|_| CipherError::Randomness)?;

        let mut in_out = plaintext.to_vec();
        self.key
            .seal_in_place_append_tag(
                Nonce::assume_unique_for_key(nonce),
                Aad::from(record_id.as_bytes()),
                &mut in_out,
            )
            .map_err(|_| CipherError::Seal)?;

        Ok(SealedBlob {
            nonce,
            ciphertext: in_out,
        })
    }

    pub fn open(&self, record_id: &str, blob: &SealedBlob) -> Result<Vec<u8>, CipherError> {
        let mut in_out = blob.ciphertext.clone();
        let plaintext = self
            .key
            .open_in_place(
                Nonce::assume_unique_for_key(blob.nonce),
                Aad::from(record_id.as_bytes()),
                &mut in_out,
            )
            .map_err(|_| CipherError::Open)?;
        Ok(plaintext.to_vec())
    }
}
