// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Statehouse bootstrap.
//!
//! Connects to the configured database, applies migrations and makes sure the
//! root signing key exists. Safe to run from several hosts at once.

use anyhow::Result;
use tracing::{error, info};

use statehouse_core::auth::RootKey;
use statehouse_core::config::Config;
use statehouse_core::runtime::connect_store;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (from crate directory or parent directories)
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("statehouse_core=info".parse()?),
        )
        .init();

    info!("Starting Statehouse bootstrap");

    let config = Config::from_env().map_err(|e| {
        error!("Configuration error: {}", e);
        e
    })?;

    info!(
        backend = ?config.backend,
        max_connections = config.max_connections,
        "Configuration loaded"
    );

    info!("Connecting to database and running migrations...");
    let store = connect_store(&config).await?;
    info!("Database ready");

    let root = RootKey::load_or_create(store.as_ref(), &config.root_key_name).await?;
    info!(key = %config.root_key_name, len = root.as_bytes().len(), "Root key available");

    info!("Statehouse bootstrap complete");
    Ok(())
}
