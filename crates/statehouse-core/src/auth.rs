// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Capability model, verified claims, token signing and the root key.
//!
//! Each [`Operation`] declares the [`Capability`] it needs. A single
//! [`authorize`] call checks verified [`Claims`] against it before the
//! operation runs:
//!
//! | Capability | Token kind | Extra condition |
//! |------------|-----------|-----------------|
//! | `PersonalToken` | `Personal` | none |
//! | `UpdateToken` | `Update` | token subject is the target update id |
//!
//! Tokens are `base64url(claims JSON) "." base64url(HMAC-SHA256)`, signed
//! with the root key, which lives in the `singletons` table and is created
//! on first use.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use chrono::Utc;
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::{debug, info, instrument};

use crate::error::{CoreError, Result};
use crate::persistence::Persistence;

type HmacSha256 = Hmac<Sha256>;

/// Kind of bearer token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TokenKind {
    /// Issued to a user; grants stack and update management.
    Personal,
    /// Issued by StartUpdate; grants progress reporting for one update.
    Update,
}

/// Verified token contents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// User id for personal tokens, update id for update tokens.
    pub subject: String,
    /// Token kind.
    pub kind: TokenKind,
    /// Unix seconds after which the token is rejected.
    pub expires_at: i64,
}

impl Claims {
    /// Personal claims for `user_id`, valid for `ttl`.
    pub fn personal(user_id: impl Into<String>, ttl: Duration) -> Self {
        Self {
            subject: user_id.into(),
            kind: TokenKind::Personal,
            expires_at: expiry(ttl),
        }
    }

    /// Update claims for `update_id`, valid for `ttl`.
    pub fn update(update_id: impl Into<String>, ttl: Duration) -> Self {
        Self {
            subject: update_id.into(),
            kind: TokenKind::Update,
            expires_at: expiry(ttl),
        }
    }
}

fn expiry(ttl: Duration) -> i64 {
    Utc::now().timestamp() + i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX / 2)
}

/// Capability an operation requires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    /// A personal token.
    PersonalToken,
    /// An update token bound to the target update.
    UpdateToken,
}

/// Every operation of the inbound surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum Operation {
    CreateStack,
    GetStack,
    DeleteStack,
    ListStacks,
    GetStackDeployment,
    ListStackResources,
    CreateUpdate,
    CreateImport,
    StartUpdate,
    CheckpointUpdate,
    CompleteUpdate,
    AddEngineEvents,
    ListEngineEvents,
    GetUpdateResults,
    ListUpdates,
    ListPreviews,
    GetStackUpdate,
    Encrypt,
    Decrypt,
    BatchDecrypt,
}

impl Operation {
    /// The capability a caller must hold.
    pub fn required_capability(&self) -> Capability {
        match self {
            Self::CheckpointUpdate | Self::CompleteUpdate | Self::AddEngineEvents => {
                Capability::UpdateToken
            }
            _ => Capability::PersonalToken,
        }
    }
}

/// Check `claims` against the capability `operation` requires.
///
/// `target_update` is the update id the operation acts on, if any.
pub fn authorize(
    operation: Operation,
    claims: &Claims,
    target_update: Option<&str>,
) -> Result<()> {
    match operation.required_capability() {
        Capability::PersonalToken if claims.kind == TokenKind::Personal => Ok(()),
        Capability::PersonalToken => Err(CoreError::Unauthorized {
            reason: format!("{:?} requires a personal token", operation),
        }),
        Capability::UpdateToken
            if claims.kind == TokenKind::Update
                && target_update == Some(claims.subject.as_str()) =>
        {
            Ok(())
        }
        Capability::UpdateToken => Err(CoreError::Unauthorized {
            reason: format!(
                "{:?} requires an update token for the target update",
                operation
            ),
        }),
    }
}

/// Issues and verifies bearer tokens.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Sign `claims` into a token.
    fn issue(&self, claims: &Claims) -> Result<String>;

    /// Verify `token` and return its claims.
    async fn verify(&self, token: &str) -> Result<Claims>;
}

/// HMAC-SHA256 token signer and verifier.
pub struct HmacAuthenticator {
    key: Vec<u8>,
}

impl HmacAuthenticator {
    /// Sign with `key`.
    pub fn new(key: &[u8]) -> Self {
        Self { key: key.to_vec() }
    }

    /// Sign with the root key.
    pub fn from_root_key(root: &RootKey) -> Self {
        Self::new(root.as_bytes())
    }

    fn mac(&self) -> Result<HmacSha256> {
        <HmacSha256 as Mac>::new_from_slice(&self.key).map_err(|e| CoreError::CryptoError {
            operation: "sign".to_string(),
            details: e.to_string(),
        })
    }
}

impl std::fmt::Debug for HmacAuthenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HmacAuthenticator").finish_non_exhaustive()
    }
}

fn rejected(reason: &str) -> CoreError {
    CoreError::Unauthorized {
        reason: reason.to_string(),
    }
}

#[async_trait]
impl Authenticator for HmacAuthenticator {
    fn issue(&self, claims: &Claims) -> Result<String> {
        let body = URL_SAFE_NO_PAD.encode(serde_json::to_vec(claims)?);
        let mut mac = self.mac()?;
        mac.update(body.as_bytes());
        let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
        Ok(format!("{}.{}", body, signature))
    }

    async fn verify(&self, token: &str) -> Result<Claims> {
        let (body, signature) = token.split_once('.').ok_or_else(|| rejected("malformed token"))?;
        let signature = URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(|_| rejected("malformed token signature"))?;

        let mut mac = self.mac()?;
        mac.update(body.as_bytes());
        mac.verify_slice(&signature)
            .map_err(|_| rejected("invalid token signature"))?;

        let claims: Claims = URL_SAFE_NO_PAD
            .decode(body)
            .ok()
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
            .ok_or_else(|| rejected("malformed token claims"))?;

        if claims.expires_at <= Utc::now().timestamp() {
            return Err(rejected("token expired"));
        }
        Ok(claims)
    }
}

/// Root signing key.
pub struct RootKey(Vec<u8>);

impl RootKey {
    /// Length of a generated key.
    pub const LEN: usize = 32;

    /// Wrap existing key material.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Key material.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Read the key stored under `name`, creating it if absent.
    ///
    /// Safe to call from several processes at once: whichever insert commits
    /// first wins and every caller ends up with the same key.
    #[instrument(skip(store))]
    pub async fn load_or_create(store: &dyn Persistence, name: &str) -> Result<Self> {
        let candidate = {
            let mut bytes = [0u8; Self::LEN];
            rand::thread_rng().fill_bytes(&mut bytes);
            STANDARD.encode(bytes)
        };

        let mut tx = store.begin().await?;
        let stored = tx.get_or_create_singleton(name, &candidate).await?;
        tx.commit().await?;

        if stored == candidate {
            info!("Root key created");
        } else {
            debug!("Root key loaded");
        }

        let bytes = STANDARD.decode(&stored).map_err(|e| CoreError::CryptoError {
            operation: "load_root_key".to_string(),
            details: e.to_string(),
        })?;
        Ok(Self(bytes))
    }
}

impl std::fmt::Debug for RootKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RootKey").field("len", &self.0.len()).finish()
    }
}
