// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::time::Duration;

/// Default pool size.
pub const DEFAULT_MAX_CONNECTIONS: u32 = 10;

/// Default lifetime of update tokens, in seconds.
pub const DEFAULT_UPDATE_TOKEN_TTL_SECS: u64 = 86_400;

/// Default singleton row name of the root signing key.
pub const DEFAULT_ROOT_KEY_NAME: &str = "auth-root";

/// Database backend, selected from the URL scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatabaseBackend {
    /// `postgres://` or `postgresql://`
    Postgres,
    /// `sqlite:`
    Sqlite,
}

impl DatabaseBackend {
    /// Pick the backend for `url`.
    pub fn from_url(url: &str) -> Result<Self, ConfigError> {
        if url.starts_with("postgres://") || url.starts_with("postgresql://") {
            Ok(Self::Postgres)
        } else if url.starts_with("sqlite:") {
            Ok(Self::Sqlite)
        } else {
            Err(ConfigError::Invalid(
                "STATEHOUSE_DATABASE_URL",
                "scheme must be postgres, postgresql or sqlite",
            ))
        }
    }
}

/// Statehouse configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL or SQLite connection URL
    pub database_url: String,
    /// Backend implied by `database_url`
    pub backend: DatabaseBackend,
    /// Pool size
    pub max_connections: u32,
    /// Lifetime of update tokens issued by StartUpdate
    pub update_token_ttl: Duration,
    /// Singleton row holding the root signing key
    pub root_key_name: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `STATEHOUSE_DATABASE_URL`: PostgreSQL or SQLite connection string
    ///
    /// Optional (with defaults):
    /// - `STATEHOUSE_MAX_CONNECTIONS`: pool size (default: 10)
    /// - `STATEHOUSE_UPDATE_TOKEN_TTL_SECS`: update token lifetime (default: 86400)
    /// - `STATEHOUSE_ROOT_KEY_NAME`: root key singleton name (default: auth-root)
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("STATEHOUSE_DATABASE_URL")
            .map_err(|_| ConfigError::Missing("STATEHOUSE_DATABASE_URL"))?;
        let backend = DatabaseBackend::from_url(&database_url)?;

        let max_connections: u32 = std::env::var("STATEHOUSE_MAX_CONNECTIONS")
            .unwrap_or_else(|_| DEFAULT_MAX_CONNECTIONS.to_string())
            .parse()
            .ok()
            .filter(|n| *n > 0)
            .ok_or(ConfigError::Invalid(
                "STATEHOUSE_MAX_CONNECTIONS",
                "must be a positive integer",
            ))?;

        let ttl_secs: u64 = std::env::var("STATEHOUSE_UPDATE_TOKEN_TTL_SECS")
            .unwrap_or_else(|_| DEFAULT_UPDATE_TOKEN_TTL_SECS.to_string())
            .parse()
            .ok()
            .filter(|n| *n > 0)
            .ok_or(ConfigError::Invalid(
                "STATEHOUSE_UPDATE_TOKEN_TTL_SECS",
                "must be a positive number of seconds",
            ))?;

        let root_key_name = std::env::var("STATEHOUSE_ROOT_KEY_NAME")
            .unwrap_or_else(|_| DEFAULT_ROOT_KEY_NAME.to_string());
        if root_key_name.is_empty() {
            return Err(ConfigError::Invalid(
                "STATEHOUSE_ROOT_KEY_NAME",
                "must not be empty",
            ));
        }

        Ok(Self {
            database_url,
            backend,
            max_connections,
            update_token_ttl: Duration::from_secs(ttl_secs),
            root_key_name,
        })
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
