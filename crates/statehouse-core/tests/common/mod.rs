// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for statehouse-core integration tests.
//!
//! Provides TestContext with a migrated store, a registered user, a personal
//! token and a wired runtime.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use sqlx::sqlite::SqlitePoolOptions;
use uuid::Uuid;

use statehouse_core::auth::RootKey;
use statehouse_core::handlers::HandlerState;
use statehouse_core::model::{Checkpoint, ServiceUser, UpdateStatus};
use statehouse_core::persistence::{Persistence, PostgresPersistence, SqlitePersistence};
use statehouse_core::runtime::StatehouseRuntime;
use statehouse_core::updates::{self, UpdateRequest};
use statehouse_core::users::{self, NewUser};
use statehouse_core::{StackIdentifier, UpdateIdentifier, UpdateKind, stacks};

/// Test context around one store.
pub struct TestContext {
    pub store: Arc<dyn Persistence>,
    pub runtime: StatehouseRuntime,
    pub user: ServiceUser,
    pub token: String,
}

impl TestContext {
    /// In-memory SQLite on a single connection.
    ///
    /// Concurrent operations queue on the connection, so each transaction
    /// runs to completion before the next begins.
    pub async fn new() -> Self {
        Self::with_store(Arc::new(memory_sqlite().await)).await
    }

    /// File-backed SQLite with a pool of connections, so transactions from
    /// different tasks really contend for the database lock.
    pub async fn file(path: impl AsRef<Path>) -> Self {
        let store = SqlitePersistence::from_path(path)
            .await
            .expect("Failed to open SQLite file");
        Self::with_store(Arc::new(store)).await
    }

    /// PostgreSQL from TEST_DATABASE_URL, or None when unset or unreachable.
    pub async fn postgres() -> Option<Self> {
        let url = std::env::var("TEST_DATABASE_URL").ok()?;
        let store = PostgresPersistence::connect(&url, 5).await.ok()?;
        Some(Self::with_store(Arc::new(store)).await)
    }

    /// Wire a runtime, user and token around `store`.
    pub async fn with_store(store: Arc<dyn Persistence>) -> Self {
        let root = RootKey::load_or_create(store.as_ref(), "auth-root")
            .await
            .expect("Failed to load root key");
        let runtime = StatehouseRuntime::builder()
            .persistence(store.clone())
            .root_key(&root)
            .expect("Failed to derive collaborators")
            .update_token_ttl(Duration::from_secs(600))
            .build()
            .expect("Failed to build runtime");

        let user = users::create_user(
            store.as_ref(),
            NewUser {
                github_login: format!("user-{}", Uuid::new_v4()),
                name: "Test User".to_string(),
                email: "test@example.com".to_string(),
                avatar_url: String::new(),
            },
        )
        .await
        .expect("Failed to create user");
        let token = runtime
            .issue_personal_token(&user.id, Duration::from_secs(600))
            .expect("Failed to issue token");

        Self {
            store,
            runtime,
            user,
            token,
        }
    }

    pub fn store(&self) -> &dyn Persistence {
        self.store.as_ref()
    }

    pub fn state(&self) -> Arc<HandlerState> {
        self.runtime.state()
    }

    /// Create `owner/project/<name>-<random>` so shared databases stay isolated.
    pub async fn create_stack(&self, owner: &str, project: &str, name: &str) -> StackIdentifier {
        let name = format!("{}-{}", name, &Uuid::new_v4().simple().to_string()[..8]);
        let stack = StackIdentifier::new(owner, project, &name).expect("valid identifier");
        stacks::create_stack(self.store(), &stack, BTreeMap::new(), None)
            .await
            .expect("Failed to create stack");
        stack
    }

    /// Create and start an update of `kind`.
    pub async fn start(&self, stack: &StackIdentifier, kind: UpdateKind) -> UpdateIdentifier {
        let id = updates::create_update(
            self.store(),
            stack,
            kind,
            UpdateRequest::default(),
            &self.user.public_info(),
        )
        .await
        .expect("Failed to create update");
        updates::start_update(self.store(), &id)
            .await
            .expect("Failed to start update");
        id
    }

    /// Run an update of `kind` to `status`, checkpointing `checkpoint` first.
    pub async fn run_update(
        &self,
        stack: &StackIdentifier,
        kind: UpdateKind,
        checkpoint: Option<Checkpoint>,
        status: UpdateStatus,
    ) -> (UpdateIdentifier, i64) {
        let id = self.start(stack, kind).await;
        if let Some(checkpoint) = checkpoint {
            updates::checkpoint_update(self.store(), &id, checkpoint)
                .await
                .expect("Failed to checkpoint");
        }
        let version = updates::complete_update(self.store(), &id, status)
            .await
            .expect("Failed to complete update");
        (id, version)
    }
}

/// Migrated in-memory SQLite on a single connection.
pub async fn memory_sqlite() -> SqlitePersistence {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("Failed to create in-memory SQLite pool");
    statehouse_core::migrations::run_sqlite(&pool)
        .await
        .expect("Failed to run SQLite migrations");
    SqlitePersistence::new(pool)
}

/// A deployment holding one resource per URN.
pub fn deployment(urns: &[&str]) -> Checkpoint {
    let resources: Vec<_> = urns
        .iter()
        .map(|urn| {
            json!({
                "urn": urn,
                "type": "aws:s3/bucket:Bucket",
                "custom": true,
                "outputs": {"bucket": urn.rsplit("::").next().unwrap_or_default()},
            })
        })
        .collect();
    Checkpoint {
        version: 3,
        features: vec![],
        deployment: json!({
            "manifest": {"time": "2025-01-01T00:00:00Z", "magic": "abc", "version": "v3.0.0"},
            "resources": resources,
        }),
    }
}

/// Helper macro to skip tests if TEST_DATABASE_URL is not set.
#[macro_export]
macro_rules! skip_if_no_db {
    () => {
        if std::env::var("TEST_DATABASE_URL").is_err() {
            eprintln!("Skipping test: TEST_DATABASE_URL not set");
            return;
        }
    };
}
