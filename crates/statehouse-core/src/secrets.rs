// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Secret boundary: encrypt, decrypt and batch decrypt of config values.
//!
//! Encryption itself belongs to a [`Crypter`] collaborator. The only behavior
//! added here is batch decryption, which keys each plaintext by the canonical
//! padded base64 of its ciphertext. That encoding is injective, so distinct
//! ciphertexts never share a key.
//!
//! Plaintext and ciphertext bytes are never logged, only their lengths.

use std::collections::HashMap;

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::{debug, instrument};

use crate::auth::RootKey;
use crate::error::{CoreError, Result};

const NONCE_LEN: usize = 12;

/// Symmetric encryption collaborator.
#[async_trait]
pub trait Crypter: Send + Sync {
    /// Encrypt `plaintext`.
    async fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>>;

    /// Decrypt `ciphertext`.
    async fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>>;
}

/// Map key of a ciphertext in a batch decrypt response.
pub fn batch_key(ciphertext: &[u8]) -> String {
    STANDARD.encode(ciphertext)
}

/// Encrypt one value.
#[instrument(skip_all, fields(len = plaintext.len()))]
pub async fn encrypt(crypter: &dyn Crypter, plaintext: &[u8]) -> Result<Vec<u8>> {
    let ciphertext = crypter.encrypt(plaintext).await?;
    debug!(ciphertext_len = ciphertext.len(), "Value encrypted");
    Ok(ciphertext)
}

/// Decrypt one value.
#[instrument(skip_all, fields(len = ciphertext.len()))]
pub async fn decrypt(crypter: &dyn Crypter, ciphertext: &[u8]) -> Result<Vec<u8>> {
    let plaintext = crypter.decrypt(ciphertext).await?;
    debug!(plaintext_len = plaintext.len(), "Value decrypted");
    Ok(plaintext)
}

/// Decrypt every ciphertext, keyed by [`batch_key`].
///
/// Identical ciphertexts collapse into one entry. Any single failure fails
/// the whole batch.
#[instrument(skip_all, fields(count = ciphertexts.len()))]
pub async fn batch_decrypt(
    crypter: &dyn Crypter,
    ciphertexts: &[Vec<u8>],
) -> Result<HashMap<String, Vec<u8>>> {
    let mut plaintexts = HashMap::with_capacity(ciphertexts.len());
    for ciphertext in ciphertexts {
        let key = batch_key(ciphertext);
        if plaintexts.contains_key(&key) {
            continue;
        }
        let plaintext = crypter.decrypt(ciphertext).await?;
        plaintexts.insert(key, plaintext);
    }

    debug!(distinct = plaintexts.len(), "Batch decrypted");
    Ok(plaintexts)
}

/// AES-256-GCM crypter with a key derived from the root key.
///
/// Output layout is `nonce (12 bytes) || ciphertext || tag`.
pub struct AesGcmCrypter {
    cipher: Aes256Gcm,
}

impl AesGcmCrypter {
    /// Build from a 32-byte key.
    pub fn new(key: &[u8]) -> Result<Self> {
        let cipher = Aes256Gcm::new_from_slice(key).map_err(|e| CoreError::CryptoError {
            operation: "init".to_string(),
            details: e.to_string(),
        })?;
        Ok(Self { cipher })
    }

    /// Derive the secrets key from the root signing key.
    pub fn from_root_key(root: &RootKey) -> Result<Self> {
        let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(root.as_bytes()).map_err(|e| {
            CoreError::CryptoError {
                operation: "derive".to_string(),
                details: e.to_string(),
            }
        })?;
        mac.update(b"statehouse-secrets");
        Self::new(&mac.finalize().into_bytes())
    }
}

impl std::fmt::Debug for AesGcmCrypter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AesGcmCrypter").finish_non_exhaustive()
    }
}

#[async_trait]
impl Crypter for AesGcmCrypter {
    async fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let sealed = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|e| CoreError::CryptoError {
                operation: "encrypt".to_string(),
                details: e.to_string(),
            })?;

        let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    async fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        if ciphertext.len() < NONCE_LEN {
            return Err(CoreError::CryptoError {
                operation: "decrypt".to_string(),
                details: "ciphertext is shorter than the nonce".to_string(),
            });
        }

        let (nonce, sealed) = ciphertext.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|_| CoreError::CryptoError {
                operation: "decrypt".to_string(),
                details: "authentication failed".to_string(),
            })
    }
}
