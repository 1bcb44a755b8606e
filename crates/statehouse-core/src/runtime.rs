// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for statehouse-core.
//!
//! [`StatehouseRuntime`] wires a record store, a secret crypter and a token
//! authenticator into the [`HandlerState`] the handlers run against.
//!
//! # Example
//!
//! ```rust,ignore
//! use statehouse_core::config::Config;
//! use statehouse_core::runtime::StatehouseRuntime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let runtime = StatehouseRuntime::from_config(&Config::from_env()?).await?;
//!     let state = runtime.state();
//!     // ... hand `state` to the transport layer ...
//!     Ok(())
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::info;

use crate::auth::{Authenticator, Claims, HmacAuthenticator, RootKey};
use crate::config::{Config, DEFAULT_UPDATE_TOKEN_TTL_SECS, DatabaseBackend};
use crate::handlers::HandlerState;
use crate::persistence::{Persistence, PostgresPersistence, SqlitePersistence};
use crate::secrets::{AesGcmCrypter, Crypter};

/// Open the store named by `config` and bring its schema up to date.
pub async fn connect_store(config: &Config) -> Result<Arc<dyn Persistence>> {
    let store: Arc<dyn Persistence> = match config.backend {
        DatabaseBackend::Postgres => Arc::new(
            PostgresPersistence::connect(&config.database_url, config.max_connections).await?,
        ),
        DatabaseBackend::Sqlite => Arc::new(
            SqlitePersistence::connect(&config.database_url, config.max_connections).await?,
        ),
    };
    store.health_check().await?;
    Ok(store)
}

/// Builder for creating a [`StatehouseRuntime`].
pub struct StatehouseRuntimeBuilder {
    persistence: Option<Arc<dyn Persistence>>,
    crypter: Option<Arc<dyn Crypter>>,
    authenticator: Option<Arc<dyn Authenticator>>,
    update_token_ttl: Duration,
}

impl std::fmt::Debug for StatehouseRuntimeBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatehouseRuntimeBuilder")
            .field("persistence", &self.persistence.as_ref().map(|_| "..."))
            .field("crypter", &self.crypter.as_ref().map(|_| "..."))
            .field("authenticator", &self.authenticator.as_ref().map(|_| "..."))
            .field("update_token_ttl", &self.update_token_ttl)
            .finish()
    }
}

impl Default for StatehouseRuntimeBuilder {
    fn default() -> Self {
        Self {
            persistence: None,
            crypter: None,
            authenticator: None,
            update_token_ttl: Duration::from_secs(DEFAULT_UPDATE_TOKEN_TTL_SECS),
        }
    }
}

impl StatehouseRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the record store (required).
    pub fn persistence(mut self, persistence: Arc<dyn Persistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// Set the secret crypter (required).
    pub fn crypter(mut self, crypter: Arc<dyn Crypter>) -> Self {
        self.crypter = Some(crypter);
        self
    }

    /// Set the token authenticator (required).
    pub fn authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    /// Use the crypter and authenticator derived from `root`.
    pub fn root_key(self, root: &RootKey) -> Result<Self> {
        let crypter = AesGcmCrypter::from_root_key(root)?;
        Ok(self
            .crypter(Arc::new(crypter))
            .authenticator(Arc::new(HmacAuthenticator::from_root_key(root))))
    }

    /// Lifetime of update tokens issued by StartUpdate.
    ///
    /// Default: 24 hours
    pub fn update_token_ttl(mut self, ttl: Duration) -> Self {
        self.update_token_ttl = ttl;
        self
    }

    /// Build the runtime.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<StatehouseRuntime> {
        let persistence = self
            .persistence
            .ok_or_else(|| anyhow::anyhow!("persistence is required"))?;
        let crypter = self
            .crypter
            .ok_or_else(|| anyhow::anyhow!("crypter is required"))?;
        let authenticator = self
            .authenticator
            .ok_or_else(|| anyhow::anyhow!("authenticator is required"))?;

        Ok(StatehouseRuntime {
            state: Arc::new(HandlerState::new(
                persistence,
                crypter,
                authenticator,
                self.update_token_ttl,
            )),
        })
    }
}

/// A wired statehouse instance that can be embedded in an application.
#[derive(Debug, Clone)]
pub struct StatehouseRuntime {
    state: Arc<HandlerState>,
}

impl StatehouseRuntime {
    /// Create a new builder.
    pub fn builder() -> StatehouseRuntimeBuilder {
        StatehouseRuntimeBuilder::new()
    }

    /// Connect to the configured store, load or create the root key and
    /// derive the collaborators from it.
    pub async fn from_config(config: &Config) -> Result<Self> {
        let store = connect_store(config).await?;
        let root = RootKey::load_or_create(store.as_ref(), &config.root_key_name).await?;

        let runtime = Self::builder()
            .persistence(store)
            .root_key(&root)?
            .update_token_ttl(config.update_token_ttl)
            .build()?;

        info!(backend = ?config.backend, "Statehouse runtime ready");
        Ok(runtime)
    }

    /// Shared handler state.
    pub fn state(&self) -> Arc<HandlerState> {
        self.state.clone()
    }

    /// Issue a personal token for `user_id`.
    pub fn issue_personal_token(&self, user_id: &str, ttl: Duration) -> Result<String> {
        Ok(self
            .state
            .authenticator
            .issue(&Claims::personal(user_id, ttl))?)
    }
}
