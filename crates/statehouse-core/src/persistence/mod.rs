// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence interfaces and backends for statehouse-core.
//!
//! The store is split in two traits:
//!
//! - [`Persistence`] is the pool. It hands out transactions and answers health checks.
//! - [`StoreTransaction`] is one atomic scope carrying the per-record CRUD
//!   primitives. Nothing is visible to other readers until
//!   [`StoreTransaction::commit`]; dropping an uncommitted transaction rolls it back.
//!
//! Uniqueness rules (one committed update per stack version, one engine event
//! per sequence) are schema constraints. Backends translate the resulting
//! unique violations into the matching [`CoreError`] variant.

pub mod postgres;
pub mod sqlite;

pub use self::postgres::PostgresPersistence;
pub use self::sqlite::SqlitePersistence;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::CoreError;
use crate::identifiers::{StackIdentifier, UpdateKind};
use crate::model::{
    Checkpoint, CheckpointRecord, EngineEvent, ServiceUser, Stack, StackVersionRecord,
    UpdateRecord, UpdateStatus,
};

/// Sort order for update listings, by version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VersionOrder {
    /// Newest versions first (default).
    #[default]
    Desc,
    /// Oldest versions first.
    Asc,
}

impl VersionOrder {
    pub(crate) fn as_sql(&self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }
}

/// Filter options for listing updates of a stack.
#[derive(Debug, Clone, Default)]
pub struct ListUpdatesFilter {
    /// Stack key the updates belong to.
    pub stack_id: String,
    /// Only dry-run (`Some(true)`) or only committing (`Some(false)`) updates.
    pub dry_run: Option<bool>,
    /// Only updates allocated this version.
    pub version: Option<i64>,
    /// Sort order by version; ties are broken by creation time.
    pub order: VersionOrder,
    /// 1-based page number. `0` is treated as `1`.
    pub page: u32,
    /// Page size. `0` means no limit.
    pub page_size: u32,
}

impl ListUpdatesFilter {
    /// All updates of a stack, newest first.
    pub fn for_stack(stack_id: impl Into<String>) -> Self {
        Self {
            stack_id: stack_id.into(),
            ..Default::default()
        }
    }

    /// `LIMIT` value, `None` when unbounded.
    pub(crate) fn limit(&self) -> Option<i64> {
        (self.page_size > 0).then_some(i64::from(self.page_size))
    }

    pub(crate) fn offset(&self) -> i64 {
        i64::from(self.page.max(1) - 1) * i64::from(self.page_size)
    }
}

/// Pooled store handle.
#[async_trait]
pub trait Persistence: Send + Sync {
    /// Open a transaction scope.
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, CoreError>;

    /// Check that the backing database is reachable.
    async fn health_check(&self) -> Result<(), CoreError>;
}

/// One atomic store scope.
///
/// Reads inside a transaction see its own uncommitted writes.
#[async_trait]
pub trait StoreTransaction: Send {
    // ========================================================================
    // Stacks
    // ========================================================================

    /// Insert a new stack. Fails with `StackAlreadyExists` on a taken key.
    async fn create_stack(&mut self, stack: &Stack) -> Result<(), CoreError>;

    /// Read a stack by key.
    async fn get_stack(&mut self, stack_id: &str) -> Result<Option<Stack>, CoreError>;

    /// List stacks, optionally restricted to one owner, ordered by key.
    async fn list_stacks(&mut self, owner: Option<&str>) -> Result<Vec<Stack>, CoreError>;

    /// Replace a stack's mutable fields. Fails with `StackNotFound` if absent.
    async fn save_stack(&mut self, stack: &Stack) -> Result<(), CoreError>;

    /// Delete a stack and everything it owns. Returns whether a row was removed.
    async fn delete_stack(&mut self, stack_id: &str) -> Result<bool, CoreError>;

    // ========================================================================
    // Updates
    // ========================================================================

    /// Insert a new update record.
    async fn create_update(&mut self, update: &UpdateRecord) -> Result<(), CoreError>;

    /// Read an update by id.
    async fn get_update(&mut self, update_id: &str) -> Result<Option<UpdateRecord>, CoreError>;

    /// Persist an update's status and timestamps. Fails with `UpdateNotFound` if absent.
    async fn save_update(&mut self, update: &UpdateRecord) -> Result<(), CoreError>;

    /// List updates matching `filter`.
    async fn list_updates(
        &mut self,
        filter: &ListUpdatesFilter,
    ) -> Result<Vec<UpdateRecord>, CoreError>;

    // ========================================================================
    // Checkpoints
    // ========================================================================

    /// Insert or fully replace the checkpoint of an update.
    async fn upsert_checkpoint(&mut self, record: &CheckpointRecord) -> Result<(), CoreError>;

    /// Read the checkpoint of an update.
    async fn get_checkpoint(
        &mut self,
        update_id: &str,
    ) -> Result<Option<CheckpointRecord>, CoreError>;

    // ========================================================================
    // Stack versions
    // ========================================================================

    /// Record a committed version. Fails with `VersionConflict` if the version
    /// was already committed.
    async fn create_stack_version(&mut self, record: &StackVersionRecord)
    -> Result<(), CoreError>;

    /// Read the update that committed `version` of a stack.
    async fn get_stack_version(
        &mut self,
        stack_id: &str,
        version: i64,
    ) -> Result<Option<StackVersionRecord>, CoreError>;

    // ========================================================================
    // Engine events
    // ========================================================================

    /// Append one event. Fails with `DuplicateEngineEvent` on a reused sequence.
    async fn create_engine_event(
        &mut self,
        update_id: &str,
        event: &EngineEvent,
    ) -> Result<(), CoreError>;

    /// All events of an update, by ascending sequence.
    async fn list_engine_events(&mut self, update_id: &str)
    -> Result<Vec<EngineEvent>, CoreError>;

    // ========================================================================
    // Users
    // ========================================================================

    /// Insert a user. Fails with `UserAlreadyExists` on a taken login.
    async fn create_user(&mut self, user: &ServiceUser) -> Result<(), CoreError>;

    /// Read a user by id.
    async fn get_user(&mut self, user_id: &str) -> Result<Option<ServiceUser>, CoreError>;

    // ========================================================================
    // Singletons
    // ========================================================================

    /// Insert `value` under `name` unless a row exists, then return the stored value.
    async fn get_or_create_singleton(
        &mut self,
        name: &str,
        value: &str,
    ) -> Result<String, CoreError>;

    // ========================================================================
    // Scope
    // ========================================================================

    /// Make every write of this scope visible.
    async fn commit(self: Box<Self>) -> Result<(), CoreError>;

    /// Discard every write of this scope.
    async fn rollback(self: Box<Self>) -> Result<(), CoreError>;
}

// ============================================================================
// Row types shared by both backends
// ============================================================================

/// Whether `err` is a unique or primary key violation.
pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db_err) if db_err.is_unique_violation())
}

/// Stack row. JSON columns are stored as text.
#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct StackRow {
    pub id: String,
    pub owner: String,
    pub project: String,
    pub name: String,
    pub version: i64,
    pub active_update_id: Option<String>,
    pub tags: String,
    pub config: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<StackRow> for Stack {
    type Error = CoreError;

    fn try_from(row: StackRow) -> Result<Self, Self::Error> {
        let tags: BTreeMap<String, String> = serde_json::from_str(&row.tags)?;
        let config = row.config.as_deref().map(serde_json::from_str).transpose()?;

        Ok(Stack {
            id: row.id,
            identifier: StackIdentifier::new(&row.owner, &row.project, &row.name)?,
            version: row.version,
            active_update: row.active_update_id,
            tags,
            config,
            created_at: row.created_at,
        })
    }
}

/// Column values of a stack, ready to bind.
pub(crate) struct StackColumns {
    pub tags: String,
    pub config: Option<String>,
}

impl StackColumns {
    pub fn encode(stack: &Stack) -> Result<Self, CoreError> {
        Ok(Self {
            tags: serde_json::to_string(&stack.tags)?,
            config: stack.config.as_ref().map(serde_json::to_string).transpose()?,
        })
    }
}

/// Update row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct UpdateRow {
    pub update_id: String,
    pub stack_id: String,
    pub kind: String,
    pub version: i64,
    pub dry_run: bool,
    pub status: String,
    pub program: String,
    pub options: String,
    pub config: String,
    pub metadata: String,
    pub requested_by: String,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<UpdateRow> for UpdateRecord {
    type Error = CoreError;

    fn try_from(row: UpdateRow) -> Result<Self, Self::Error> {
        Ok(UpdateRecord {
            update_id: row.update_id,
            stack_id: row.stack_id,
            kind: row.kind.parse::<UpdateKind>()?,
            version: row.version,
            dry_run: row.dry_run,
            status: row.status.parse::<UpdateStatus>()?,
            program: serde_json::from_str(&row.program)?,
            options: serde_json::from_str(&row.options)?,
            config: serde_json::from_str(&row.config)?,
            metadata: serde_json::from_str(&row.metadata)?,
            requested_by: serde_json::from_str(&row.requested_by)?,
            start_time: row.start_time,
            end_time: row.end_time,
            created_at: row.created_at,
        })
    }
}

/// Serialized JSON columns of an update.
pub(crate) struct UpdateColumns {
    pub program: String,
    pub options: String,
    pub config: String,
    pub metadata: String,
    pub requested_by: String,
}

impl UpdateColumns {
    pub fn encode(update: &UpdateRecord) -> Result<Self, CoreError> {
        Ok(Self {
            program: serde_json::to_string(&update.program)?,
            options: serde_json::to_string(&update.options)?,
            config: serde_json::to_string(&update.config)?,
            metadata: serde_json::to_string(&update.metadata)?,
            requested_by: serde_json::to_string(&update.requested_by)?,
        })
    }
}

/// Checkpoint row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct CheckpointRow {
    pub update_id: String,
    pub version: i64,
    pub features: String,
    pub deployment: String,
}

impl TryFrom<CheckpointRow> for CheckpointRecord {
    type Error = CoreError;

    fn try_from(row: CheckpointRow) -> Result<Self, Self::Error> {
        Ok(CheckpointRecord {
            update_id: row.update_id,
            checkpoint: Checkpoint {
                version: row.version,
                features: serde_json::from_str(&row.features)?,
                deployment: serde_json::from_str(&row.deployment)?,
            },
        })
    }
}

/// Engine event row; the event is stored whole.
#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct EngineEventRow {
    pub event: String,
}

impl TryFrom<EngineEventRow> for EngineEvent {
    type Error = CoreError;

    fn try_from(row: EngineEventRow) -> Result<Self, Self::Error> {
        Ok(serde_json::from_str(&row.event)?)
    }
}
