// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL-backed persistence implementation.
//!
//! Concurrent commits of the same stack version serialize on the
//! `stack_versions` primary key: the second inserter blocks until the first
//! transaction finishes, then fails with a unique violation.

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Transaction};

use crate::error::CoreError;
use crate::model::{
    CheckpointRecord, EngineEvent, ServiceUser, Stack, StackVersionRecord, UpdateRecord,
};

use super::{
    CheckpointRow, EngineEventRow, ListUpdatesFilter, Persistence, StackColumns, StackRow,
    StoreTransaction, UpdateColumns, UpdateRow, is_unique_violation,
};

const STACK_COLUMNS: &str = "id, owner, project, name, version, active_update_id, tags, config, created_at";

const UPDATE_COLUMNS: &str = "update_id, stack_id, kind, version, dry_run, status, program, options, config, metadata, requested_by, start_time, end_time, created_at";

/// PostgreSQL-backed persistence implementation.
#[derive(Clone)]
pub struct PostgresPersistence {
    pool: PgPool,
}

impl PostgresPersistence {
    /// Create a new Postgres-backed persistence implementation.
    ///
    /// The pool must already be migrated (see [`crate::migrations::run_postgres`]).
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect to `url`, run migrations and return the provider.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, CoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(|e| CoreError::DatabaseError {
                operation: "connect".to_string(),
                details: format!("Failed to connect to PostgreSQL: {}", e),
            })?;

        crate::migrations::run_postgres(&pool)
            .await
            .map_err(|e| CoreError::DatabaseError {
                operation: "migrate".to_string(),
                details: format!("Failed to run migrations: {}", e),
            })?;

        Ok(Self { pool })
    }

    /// The underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Persistence for PostgresPersistence {
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, CoreError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PostgresTransaction { tx }))
    }

    async fn health_check(&self) -> Result<(), CoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

/// An open PostgreSQL transaction.
pub struct PostgresTransaction {
    tx: Transaction<'static, Postgres>,
}

// ============================================================================
// Stack Operations
// ============================================================================

#[async_trait]
impl StoreTransaction for PostgresTransaction {
    async fn create_stack(&mut self, stack: &Stack) -> Result<(), CoreError> {
        let columns = StackColumns::encode(stack)?;
        let stack_id = stack.identifier.stack_id();

        sqlx::query(
            r#"
            INSERT INTO stacks (stack_id, id, owner, project, name, version, active_update_id, tags, config, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(&stack_id)
        .bind(&stack.id)
        .bind(&stack.identifier.owner)
        .bind(&stack.identifier.project)
        .bind(stack.identifier.stack.as_str())
        .bind(stack.version)
        .bind(&stack.active_update)
        .bind(&columns.tags)
        .bind(&columns.config)
        .bind(stack.created_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                CoreError::StackAlreadyExists {
                    stack_id: stack_id.clone(),
                }
            } else {
                e.into()
            }
        })?;

        Ok(())
    }

    async fn get_stack(&mut self, stack_id: &str) -> Result<Option<Stack>, CoreError> {
        let query = format!("SELECT {} FROM stacks WHERE stack_id = $1", STACK_COLUMNS);
        let row = sqlx::query_as::<_, StackRow>(&query)
            .bind(stack_id)
            .fetch_optional(&mut *self.tx)
            .await?;

        row.map(Stack::try_from).transpose()
    }

    async fn list_stacks(&mut self, owner: Option<&str>) -> Result<Vec<Stack>, CoreError> {
        let query = format!(
            "SELECT {} FROM stacks WHERE ($1::TEXT IS NULL OR owner = $1) ORDER BY stack_id",
            STACK_COLUMNS
        );
        let rows = sqlx::query_as::<_, StackRow>(&query)
            .bind(owner)
            .fetch_all(&mut *self.tx)
            .await?;

        rows.into_iter().map(Stack::try_from).collect()
    }

    async fn save_stack(&mut self, stack: &Stack) -> Result<(), CoreError> {
        let columns = StackColumns::encode(stack)?;
        let stack_id = stack.identifier.stack_id();

        let result = sqlx::query(
            r#"
            UPDATE stacks
            SET version = $1, active_update_id = $2, tags = $3, config = $4
            WHERE stack_id = $5
            "#,
        )
        .bind(stack.version)
        .bind(&stack.active_update)
        .bind(&columns.tags)
        .bind(&columns.config)
        .bind(&stack_id)
        .execute(&mut *self.tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(CoreError::StackNotFound { stack_id });
        }
        Ok(())
    }

    async fn delete_stack(&mut self, stack_id: &str) -> Result<bool, CoreError> {
        let result = sqlx::query("DELETE FROM stacks WHERE stack_id = $1")
            .bind(stack_id)
            .execute(&mut *self.tx)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    // ========================================================================
    // Update Operations
    // ========================================================================

    async fn create_update(&mut self, update: &UpdateRecord) -> Result<(), CoreError> {
        let columns = UpdateColumns::encode(update)?;

        sqlx::query(
            r#"
            INSERT INTO updates (update_id, stack_id, kind, version, dry_run, status, program, options, config, metadata, requested_by, start_time, end_time, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(&update.update_id)
        .bind(&update.stack_id)
        .bind(update.kind.as_str())
        .bind(update.version)
        .bind(update.dry_run)
        .bind(update.status.as_str())
        .bind(&columns.program)
        .bind(&columns.options)
        .bind(&columns.config)
        .bind(&columns.metadata)
        .bind(&columns.requested_by)
        .bind(update.start_time)
        .bind(update.end_time)
        .bind(update.created_at)
        .execute(&mut *self.tx)
        .await?;

        Ok(())
    }

    async fn get_update(&mut self, update_id: &str) -> Result<Option<UpdateRecord>, CoreError> {
        let query = format!("SELECT {} FROM updates WHERE update_id = $1", UPDATE_COLUMNS);
        let row = sqlx::query_as::<_, UpdateRow>(&query)
            .bind(update_id)
            .fetch_optional(&mut *self.tx)
            .await?;

        row.map(UpdateRecord::try_from).transpose()
    }

    async fn save_update(&mut self, update: &UpdateRecord) -> Result<(), CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE updates
            SET status = $1, start_time = $2, end_time = $3
            WHERE update_id = $4
            "#,
        )
        .bind(update.status.as_str())
        .bind(update.start_time)
        .bind(update.end_time)
        .bind(&update.update_id)
        .execute(&mut *self.tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(CoreError::UpdateNotFound {
                update_id: update.update_id.clone(),
            });
        }
        Ok(())
    }

    async fn list_updates(
        &mut self,
        filter: &ListUpdatesFilter,
    ) -> Result<Vec<UpdateRecord>, CoreError> {
        let direction = filter.order.as_sql();

        // ORDER BY direction comes from a trusted enum; LIMIT NULL is unbounded
        let query = format!(
            r#"
            SELECT {}
            FROM updates
            WHERE stack_id = $1
              AND ($2::BOOLEAN IS NULL OR dry_run = $2)
              AND ($3::BIGINT IS NULL OR version = $3)
            ORDER BY version {}, created_at {}
            LIMIT $4 OFFSET $5
            "#,
            UPDATE_COLUMNS, direction, direction
        );

        let rows = sqlx::query_as::<_, UpdateRow>(&query)
            .bind(&filter.stack_id)
            .bind(filter.dry_run)
            .bind(filter.version)
            .bind(filter.limit())
            .bind(filter.offset())
            .fetch_all(&mut *self.tx)
            .await?;

        rows.into_iter().map(UpdateRecord::try_from).collect()
    }

    // ========================================================================
    // Checkpoint Operations
    // ========================================================================

    async fn upsert_checkpoint(&mut self, record: &CheckpointRecord) -> Result<(), CoreError> {
        let features = serde_json::to_string(&record.checkpoint.features)?;
        let deployment = serde_json::to_string(&record.checkpoint.deployment)?;

        sqlx::query(
            r#"
            INSERT INTO checkpoints (update_id, version, features, deployment, updated_at)
            VALUES ($1, $2, $3, $4, NOW())
            ON CONFLICT (update_id) DO UPDATE SET
                version = EXCLUDED.version,
                features = EXCLUDED.features,
                deployment = EXCLUDED.deployment,
                updated_at = NOW()
            "#,
        )
        .bind(&record.update_id)
        .bind(record.checkpoint.version)
        .bind(&features)
        .bind(&deployment)
        .execute(&mut *self.tx)
        .await?;

        Ok(())
    }

    async fn get_checkpoint(
        &mut self,
        update_id: &str,
    ) -> Result<Option<CheckpointRecord>, CoreError> {
        let row = sqlx::query_as::<_, CheckpointRow>(
            r#"
            SELECT update_id, version, features, deployment
            FROM checkpoints
            WHERE update_id = $1
            "#,
        )
        .bind(update_id)
        .fetch_optional(&mut *self.tx)
        .await?;

        row.map(CheckpointRecord::try_from).transpose()
    }

    // ========================================================================
    // Stack Version Operations
    // ========================================================================

    async fn create_stack_version(
        &mut self,
        record: &StackVersionRecord,
    ) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO stack_versions (stack_id, version, update_id)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(&record.stack_id)
        .bind(record.version)
        .bind(&record.update_id)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                CoreError::VersionConflict {
                    stack_id: record.stack_id.clone(),
                    version: record.version,
                    update_id: record.update_id.clone(),
                }
            } else {
                e.into()
            }
        })?;

        Ok(())
    }

    async fn get_stack_version(
        &mut self,
        stack_id: &str,
        version: i64,
    ) -> Result<Option<StackVersionRecord>, CoreError> {
        let record = sqlx::query_as::<_, StackVersionRecord>(
            r#"
            SELECT stack_id, version, update_id
            FROM stack_versions
            WHERE stack_id = $1 AND version = $2
            "#,
        )
        .bind(stack_id)
        .bind(version)
        .fetch_optional(&mut *self.tx)
        .await?;

        Ok(record)
    }

    // ========================================================================
    // Engine Event Operations
    // ========================================================================

    async fn create_engine_event(
        &mut self,
        update_id: &str,
        event: &EngineEvent,
    ) -> Result<(), CoreError> {
        let body = serde_json::to_string(event)?;

        sqlx::query(
            r#"
            INSERT INTO engine_events (update_id, sequence, event)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(update_id)
        .bind(event.sequence)
        .bind(&body)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                CoreError::DuplicateEngineEvent {
                    update_id: update_id.to_string(),
                    sequence: event.sequence,
                }
            } else {
                e.into()
            }
        })?;

        Ok(())
    }

    async fn list_engine_events(
        &mut self,
        update_id: &str,
    ) -> Result<Vec<EngineEvent>, CoreError> {
        let rows = sqlx::query_as::<_, EngineEventRow>(
            r#"
            SELECT event
            FROM engine_events
            WHERE update_id = $1
            ORDER BY sequence ASC
            "#,
        )
        .bind(update_id)
        .fetch_all(&mut *self.tx)
        .await?;

        rows.into_iter().map(EngineEvent::try_from).collect()
    }

    // ========================================================================
    // User and Singleton Operations
    // ========================================================================

    async fn create_user(&mut self, user: &ServiceUser) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO users (id, github_login, name, email, avatar_url)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(&user.id)
        .bind(&user.github_login)
        .bind(&user.name)
        .bind(&user.email)
        .bind(&user.avatar_url)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                CoreError::UserAlreadyExists {
                    login: user.github_login.clone(),
                }
            } else {
                e.into()
            }
        })?;

        Ok(())
    }

    async fn get_user(&mut self, user_id: &str) -> Result<Option<ServiceUser>, CoreError> {
        let user = sqlx::query_as::<_, ServiceUser>(
            r#"
            SELECT id, github_login, name, email, avatar_url
            FROM users
            WHERE id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&mut *self.tx)
        .await?;

        Ok(user)
    }

    async fn get_or_create_singleton(
        &mut self,
        name: &str,
        value: &str,
    ) -> Result<String, CoreError> {
        // DO NOTHING keeps the transaction usable when another process won the race
        sqlx::query(
            r#"
            INSERT INTO singletons (name, value)
            VALUES ($1, $2)
            ON CONFLICT (name) DO NOTHING
            "#,
        )
        .bind(name)
        .bind(value)
        .execute(&mut *self.tx)
        .await?;

        let stored: String = sqlx::query_scalar("SELECT value FROM singletons WHERE name = $1")
            .bind(name)
            .fetch_one(&mut *self.tx)
            .await?;

        Ok(stored)
    }

    async fn commit(self: Box<Self>) -> Result<(), CoreError> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), CoreError> {
        self.tx.rollback().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use chrono::Utc;
    use uuid::Uuid;

    use crate::identifiers::{StackIdentifier, UpdateKind};
    use crate::model::{
        ConfigMap, UpdateMetadata, UpdateOptions, UpdateProgram, UpdateStatus, UserInfo,
    };

    // Helper to get a test database pool
    async fn test_persistence() -> Option<PostgresPersistence> {
        let url = std::env::var("TEST_DATABASE_URL").ok()?;
        let pool = PgPool::connect(&url).await.ok()?;
        crate::migrations::run_postgres(&pool).await.ok()?;
        Some(PostgresPersistence::new(pool))
    }

    fn unique_stack() -> Stack {
        let name = format!("test-{}", Uuid::new_v4());
        Stack {
            id: Uuid::new_v4().to_string(),
            identifier: StackIdentifier::new("pgtest", "infra", &name).unwrap(),
            version: 0,
            active_update: None,
            tags: BTreeMap::new(),
            config: None,
            created_at: Utc::now(),
        }
    }

    fn update(stack_id: &str, version: i64) -> UpdateRecord {
        UpdateRecord {
            update_id: Uuid::new_v4().to_string(),
            stack_id: stack_id.to_string(),
            kind: UpdateKind::Update,
            version,
            dry_run: false,
            status: UpdateStatus::NotStarted,
            program: UpdateProgram::default(),
            options: UpdateOptions::default(),
            config: ConfigMap::new(),
            metadata: UpdateMetadata::default(),
            requested_by: UserInfo::default(),
            start_time: None,
            end_time: None,
            created_at: Utc::now(),
        }
    }

    async fn cleanup(persistence: &PostgresPersistence, stack_id: &str) {
        sqlx::query("DELETE FROM stacks WHERE stack_id = $1")
            .bind(stack_id)
            .execute(persistence.pool())
            .await
            .ok();
    }

    #[tokio::test]
    async fn test_stack_round_trip() {
        let Some(persistence) = test_persistence().await else {
            eprintln!("Skipping test: TEST_DATABASE_URL not set");
            return;
        };
        let stack = unique_stack();
        let stack_id = stack.identifier.stack_id();

        let mut tx = persistence.begin().await.unwrap();
        tx.create_stack(&stack).await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = persistence.begin().await.unwrap();
        let loaded = tx.get_stack(&stack_id).await.unwrap().unwrap();
        assert_eq!(loaded.id, stack.id);
        let err = tx.create_stack(&stack).await.unwrap_err();
        assert_eq!(err.error_code(), "STACK_ALREADY_EXISTS");
        drop(tx);

        cleanup(&persistence, &stack_id).await;
    }

    #[tokio::test]
    async fn test_concurrent_version_commit_conflicts() {
        let Some(persistence) = test_persistence().await else {
            eprintln!("Skipping test: TEST_DATABASE_URL not set");
            return;
        };
        let stack = unique_stack();
        let stack_id = stack.identifier.stack_id();
        let first = update(&stack_id, 1);
        let second = update(&stack_id, 1);

        let mut tx = persistence.begin().await.unwrap();
        tx.create_stack(&stack).await.unwrap();
        tx.create_update(&first).await.unwrap();
        tx.create_update(&second).await.unwrap();
        tx.commit().await.unwrap();

        let mut tx_a = persistence.begin().await.unwrap();
        tx_a.create_stack_version(&StackVersionRecord {
            stack_id: stack_id.clone(),
            version: 1,
            update_id: first.update_id.clone(),
        })
        .await
        .unwrap();

        let mut tx_b = persistence.begin().await.unwrap();
        let stack_id_b = stack_id.clone();
        let second_id = second.update_id.clone();
        let pending = tokio::spawn(async move {
            tx_b.create_stack_version(&StackVersionRecord {
                stack_id: stack_id_b,
                version: 1,
                update_id: second_id,
            })
            .await
        });

        tx_a.commit().await.unwrap();
        let err = pending.await.unwrap().unwrap_err();
        assert_eq!(err.error_code(), "VERSION_CONFLICT");

        cleanup(&persistence, &stack_id).await;
    }

    #[tokio::test]
    async fn test_list_updates_unbounded_page() {
        let Some(persistence) = test_persistence().await else {
            eprintln!("Skipping test: TEST_DATABASE_URL not set");
            return;
        };
        let stack = unique_stack();
        let stack_id = stack.identifier.stack_id();

        let mut tx = persistence.begin().await.unwrap();
        tx.create_stack(&stack).await.unwrap();
        for version in 1..=3 {
            tx.create_update(&update(&stack_id, version)).await.unwrap();
        }

        let versions: Vec<i64> = tx
            .list_updates(&ListUpdatesFilter::for_stack(stack_id.clone()))
            .await
            .unwrap()
            .iter()
            .map(|u| u.version)
            .collect();
        assert_eq!(versions, vec![3, 2, 1]);
        tx.rollback().await.unwrap();
    }
}
