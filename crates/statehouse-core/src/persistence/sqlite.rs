// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed persistence implementation.

use std::path::Path;

use async_trait::async_trait;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Sqlite, SqlitePool, Transaction};

use crate::error::CoreError;
use crate::model::{
    CheckpointRecord, EngineEvent, ServiceUser, Stack, StackVersionRecord, UpdateRecord,
};

use super::{
    CheckpointRow, EngineEventRow, ListUpdatesFilter, Persistence, StackColumns, StackRow,
    StoreTransaction, UpdateColumns, UpdateRow, is_unique_violation,
};

use crate::migrations::SQLITE as MIGRATOR;

const STACK_COLUMNS: &str = "id, owner, project, name, version, active_update_id, tags, config, created_at";

const UPDATE_COLUMNS: &str = "update_id, stack_id, kind, version, dry_run, status, program, options, config, metadata, requested_by, start_time, end_time, created_at";

/// SQLite-backed persistence provider.
#[derive(Clone)]
pub struct SqlitePersistence {
    pool: SqlitePool,
}

impl SqlitePersistence {
    /// Create a new SQLite persistence provider from an existing pool.
    ///
    /// The pool must already be migrated.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect to `url`, run migrations and return the provider.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, CoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(|e| CoreError::DatabaseError {
                operation: "connect".to_string(),
                details: format!("Failed to connect to SQLite at {}: {}", url, e),
            })?;

        MIGRATOR
            .run(&pool)
            .await
            .map_err(|e| CoreError::DatabaseError {
                operation: "migrate".to_string(),
                details: format!("Failed to run migrations: {}", e),
            })?;

        Ok(Self { pool })
    }

    /// Create and initialize a new SQLite persistence from a file path.
    ///
    /// Creates parent directories and the database file if needed, then runs
    /// all migrations.
    ///
    /// ```ignore
    /// let persistence = SqlitePersistence::from_path(".data/statehouse.db").await?;
    /// ```
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| CoreError::DatabaseError {
                operation: "create_dir".to_string(),
                details: format!("Failed to create directory {:?}: {}", parent, e),
            })?;
        }

        let url = format!("sqlite:{}?mode=rwc", path.to_string_lossy());
        Self::connect(&url, 5).await
    }

    /// The underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// Migrated in-memory store on a single connection, for unit tests.
#[cfg(test)]
pub(crate) async fn memory_store() -> SqlitePersistence {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("Failed to create in-memory SQLite pool");
    MIGRATOR.run(&pool).await.expect("Failed to run migrations");
    SqlitePersistence::new(pool)
}

#[async_trait]
impl Persistence for SqlitePersistence {
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, CoreError> {
        // Writers queue on busy_timeout here; a deferred BEGIN would fail
        // with SQLITE_BUSY when upgrading to a write lock.
        let tx = self.pool.begin_with("BEGIN IMMEDIATE").await?;
        Ok(Box::new(SqliteTransaction { tx }))
    }

    async fn health_check(&self) -> Result<(), CoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

/// An open SQLite transaction.
pub struct SqliteTransaction {
    tx: Transaction<'static, Sqlite>,
}

#[async_trait]
impl StoreTransaction for SqliteTransaction {
    async fn create_stack(&mut self, stack: &Stack) -> Result<(), CoreError> {
        let columns = StackColumns::encode(stack)?;
        let stack_id = stack.identifier.stack_id();

        sqlx::query(
            r#"
            INSERT INTO stacks (stack_id, id, owner, project, name, version, active_update_id, tags, config, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
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
        let query = format!("SELECT {} FROM stacks WHERE stack_id = ?", STACK_COLUMNS);
        let row = sqlx::query_as::<_, StackRow>(&query)
            .bind(stack_id)
            .fetch_optional(&mut *self.tx)
            .await?;

        row.map(Stack::try_from).transpose()
    }

    async fn list_stacks(&mut self, owner: Option<&str>) -> Result<Vec<Stack>, CoreError> {
        let query = format!(
            "SELECT {} FROM stacks WHERE (?1 IS NULL OR owner = ?1) ORDER BY stack_id",
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
            SET version = ?, active_update_id = ?, tags = ?, config = ?
            WHERE stack_id = ?
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
        let result = sqlx::query("DELETE FROM stacks WHERE stack_id = ?")
            .bind(stack_id)
            .execute(&mut *self.tx)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn create_update(&mut self, update: &UpdateRecord) -> Result<(), CoreError> {
        let columns = UpdateColumns::encode(update)?;

        sqlx::query(
            r#"
            INSERT INTO updates (update_id, stack_id, kind, version, dry_run, status, program, options, config, metadata, requested_by, start_time, end_time, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
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
        let query = format!("SELECT {} FROM updates WHERE update_id = ?", UPDATE_COLUMNS);
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
            SET status = ?, start_time = ?, end_time = ?
            WHERE update_id = ?
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

        // ORDER BY direction comes from a trusted enum
        let query = format!(
            r#"
            SELECT {}
            FROM updates
            WHERE stack_id = ?1
              AND (?2 IS NULL OR dry_run = ?2)
              AND (?3 IS NULL OR version = ?3)
            ORDER BY version {}, created_at {}
            LIMIT ?4 OFFSET ?5
            "#,
            UPDATE_COLUMNS, direction, direction
        );

        let rows = sqlx::query_as::<_, UpdateRow>(&query)
            .bind(&filter.stack_id)
            .bind(filter.dry_run)
            .bind(filter.version)
            // SQLite treats a negative limit as unbounded
            .bind(filter.limit().unwrap_or(-1))
            .bind(filter.offset())
            .fetch_all(&mut *self.tx)
            .await?;

        rows.into_iter().map(UpdateRecord::try_from).collect()
    }

    async fn upsert_checkpoint(&mut self, record: &CheckpointRecord) -> Result<(), CoreError> {
        let features = serde_json::to_string(&record.checkpoint.features)?;
        let deployment = serde_json::to_string(&record.checkpoint.deployment)?;

        sqlx::query(
            r#"
            INSERT INTO checkpoints (update_id, version, features, deployment, updated_at)
            VALUES (?, ?, ?, ?, CURRENT_TIMESTAMP)
            ON CONFLICT(update_id) DO UPDATE SET
                version = excluded.version,
                features = excluded.features,
                deployment = excluded.deployment,
                updated_at = CURRENT_TIMESTAMP
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
            WHERE update_id = ?
            "#,
        )
        .bind(update_id)
        .fetch_optional(&mut *self.tx)
        .await?;

        row.map(CheckpointRecord::try_from).transpose()
    }

    async fn create_stack_version(
        &mut self,
        record: &StackVersionRecord,
    ) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO stack_versions (stack_id, version, update_id)
            VALUES (?, ?, ?)
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
            WHERE stack_id = ? AND version = ?
            "#,
        )
        .bind(stack_id)
        .bind(version)
        .fetch_optional(&mut *self.tx)
        .await?;

        Ok(record)
    }

    async fn create_engine_event(
        &mut self,
        update_id: &str,
        event: &EngineEvent,
    ) -> Result<(), CoreError> {
        let body = serde_json::to_string(event)?;

        sqlx::query(
            r#"
            INSERT INTO engine_events (update_id, sequence, event)
            VALUES (?, ?, ?)
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
            WHERE update_id = ?
            ORDER BY sequence ASC
            "#,
        )
        .bind(update_id)
        .fetch_all(&mut *self.tx)
        .await?;

        rows.into_iter().map(EngineEvent::try_from).collect()
    }

    async fn create_user(&mut self, user: &ServiceUser) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO users (id, github_login, name, email, avatar_url)
            VALUES (?, ?, ?, ?, ?)
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
            WHERE id = ?
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
        sqlx::query(
            r#"
            INSERT INTO singletons (name, value)
            VALUES (?, ?)
            ON CONFLICT(name) DO NOTHING
            "#,
        )
        .bind(name)
        .bind(value)
        .execute(&mut *self.tx)
        .await?;

        let stored: String = sqlx::query_scalar("SELECT value FROM singletons WHERE name = ?")
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
