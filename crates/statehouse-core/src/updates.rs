// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Update lifecycle: create, start, checkpoint, complete, import, history.
//!
//! ```text
//!         create               start                complete(status)
//! (none) ───────► NotStarted ───────► Running ──────────────────────► Succeeded | Failed
//! ```
//!
//! Checkpoints and engine events are accepted in any state and never move
//! the state machine.
//!
//! # Version allocation
//!
//! `create_update` allocates `stack.version + 1` from a plain read, without
//! locking the stack. Two updates created concurrently can therefore share a
//! version. The conflict surfaces at `complete_update`, where the insert into
//! `stack_versions` hits the `(stack_id, version)` primary key and the whole
//! completion rolls back with [`CoreError::VersionConflict`]. Callers retry
//! with a fresh update.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::error::{CoreError, Result};
use crate::identifiers::{StackIdentifier, UpdateIdentifier, UpdateKind};
use crate::model::{
    Checkpoint, CheckpointRecord, ConfigMap, Stack, StackUpdate, StackVersionRecord,
    UpdateMetadata, UpdateOptions, UpdateProgram, UpdateRecord, UpdateResults, UpdateStatus,
    UserInfo,
};
use crate::persistence::{ListUpdatesFilter, Persistence, StoreTransaction, VersionOrder};
use crate::stacks::{get_stack_in, resolve_version};

/// Body of a create-update request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateRequest {
    /// Program being deployed.
    pub program: UpdateProgram,
    /// Update options.
    pub options: UpdateOptions,
    /// Update configuration.
    pub config: ConfigMap,
    /// Message and client environment.
    pub metadata: UpdateMetadata,
}

/// Page selection for [`list_updates`].
#[derive(Debug, Clone, Copy, Default)]
pub struct UpdatePage {
    /// 1-based page number.
    pub page: u32,
    /// Page size, `0` for everything.
    pub page_size: u32,
    /// Order by version.
    pub order: VersionOrder,
}

/// Read an update and check that it belongs to the identified stack.
pub async fn load_update_in(
    tx: &mut dyn StoreTransaction,
    id: &UpdateIdentifier,
) -> Result<UpdateRecord> {
    match tx.get_update(&id.update_id).await? {
        Some(update) if update.stack_id == id.stack.stack_id() => Ok(update),
        _ => Err(CoreError::UpdateNotFound {
            update_id: id.update_id.clone(),
        }),
    }
}

// ============================================================================
// Create
// ============================================================================

/// Create an update against a stack and return its identifier.
///
/// The version is `stack.version + 1` as read now; it is not re-validated
/// until completion.
#[instrument(skip(store, stack, request, requested_by), fields(stack = %stack, kind = %kind))]
pub async fn create_update(
    store: &dyn Persistence,
    stack: &StackIdentifier,
    kind: UpdateKind,
    request: UpdateRequest,
    requested_by: &UserInfo,
) -> Result<UpdateIdentifier> {
    let mut tx = store.begin().await?;
    let update = create_update_in(tx.as_mut(), stack, kind, request, requested_by).await?;
    tx.commit().await?;

    info!(
        update_id = %update.update_id,
        version = update.version,
        dry_run = update.dry_run,
        "Update created"
    );
    UpdateIdentifier::new(stack.clone(), kind, update.update_id)
}

/// [`create_update`] inside an open transaction.
pub async fn create_update_in(
    tx: &mut dyn StoreTransaction,
    stack: &StackIdentifier,
    kind: UpdateKind,
    request: UpdateRequest,
    requested_by: &UserInfo,
) -> Result<UpdateRecord> {
    let current = get_stack_in(tx, stack).await?;

    let update = UpdateRecord {
        update_id: Uuid::new_v4().to_string(),
        stack_id: stack.stack_id(),
        kind,
        version: current.version + 1,
        dry_run: request.options.dry_run || kind == UpdateKind::Preview,
        status: UpdateStatus::NotStarted,
        program: request.program,
        options: request.options,
        config: request.config,
        metadata: request.metadata,
        requested_by: requested_by.clone(),
        start_time: None,
        end_time: None,
        created_at: Utc::now(),
    };

    tx.create_update(&update).await?;
    Ok(update)
}

// ============================================================================
// Start
// ============================================================================

/// Mark an update running and return its allocated version.
///
/// Starting twice only resets the start time.
#[instrument(skip(store, id), fields(update = %id))]
pub async fn start_update(store: &dyn Persistence, id: &UpdateIdentifier) -> Result<i64> {
    let mut tx = store.begin().await?;
    let update = start_update_in(tx.as_mut(), id).await?;
    tx.commit().await?;

    info!(version = update.version, "Update started");
    Ok(update.version)
}

/// [`start_update`] inside an open transaction.
pub async fn start_update_in(
    tx: &mut dyn StoreTransaction,
    id: &UpdateIdentifier,
) -> Result<UpdateRecord> {
    let mut update = load_update_in(tx, id).await?;
    update.start_time = Some(Utc::now());
    update.status = UpdateStatus::Running;
    tx.save_update(&update).await?;
    Ok(update)
}

// ============================================================================
// Checkpoint
// ============================================================================

/// Replace the update's checkpoint. Accepted in any state.
#[instrument(skip(store, id, checkpoint), fields(update = %id))]
pub async fn checkpoint_update(
    store: &dyn Persistence,
    id: &UpdateIdentifier,
    checkpoint: Checkpoint,
) -> Result<()> {
    let mut tx = store.begin().await?;
    checkpoint_update_in(tx.as_mut(), id, checkpoint).await?;
    tx.commit().await?;

    debug!("Checkpoint written");
    Ok(())
}

/// [`checkpoint_update`] inside an open transaction.
pub async fn checkpoint_update_in(
    tx: &mut dyn StoreTransaction,
    id: &UpdateIdentifier,
    checkpoint: Checkpoint,
) -> Result<()> {
    load_update_in(tx, id).await?;
    tx.upsert_checkpoint(&CheckpointRecord {
        update_id: id.update_id.clone(),
        checkpoint,
    })
    .await
}

// ============================================================================
// Complete
// ============================================================================

/// Finish an update with a terminal status and return its version.
///
/// A non-dry-run completion commits the version: the stack moves to it and a
/// version record is written. A dry run only records the outcome.
#[instrument(skip(store, id), fields(update = %id))]
pub async fn complete_update(
    store: &dyn Persistence,
    id: &UpdateIdentifier,
    status: UpdateStatus,
) -> Result<i64> {
    let mut tx = store.begin().await?;
    let update = match complete_update_in(tx.as_mut(), id, status).await {
        Ok(update) => update,
        Err(e @ CoreError::VersionConflict { .. }) => {
            warn!(error = %e, "Version already committed by another update");
            return Err(e);
        }
        Err(e) => return Err(e),
    };
    tx.commit().await?;

    if update.dry_run {
        info!(version = update.version, status = %status, "Dry-run update completed");
    } else {
        info!(version = update.version, status = %status, "Update completed, version committed");
    }
    Ok(update.version)
}

/// [`complete_update`] inside an open transaction.
pub async fn complete_update_in(
    tx: &mut dyn StoreTransaction,
    id: &UpdateIdentifier,
    status: UpdateStatus,
) -> Result<UpdateRecord> {
    if !status.is_terminal() {
        return Err(CoreError::ValidationError {
            field: "status".to_string(),
            message: format!("'{}' is not a completion status", status),
        });
    }

    let mut update = load_update_in(tx, id).await?;
    update.end_time = Some(Utc::now());
    update.status = status;
    tx.save_update(&update).await?;

    if !update.dry_run {
        tx.create_stack_version(&StackVersionRecord {
            stack_id: update.stack_id.clone(),
            version: update.version,
            update_id: update.update_id.clone(),
        })
        .await?;

        let mut stack = get_stack_in(tx, &id.stack).await?;
        stack.version = update.version;
        stack.active_update = Some(update.update_id.clone());
        tx.save_stack(&stack).await?;
    }

    Ok(update)
}

// ============================================================================
// Import
// ============================================================================

/// Import a complete deployment as a new committed version.
///
/// Runs create, start, checkpoint and complete(succeeded) in one transaction,
/// so a failure at any step leaves nothing behind.
#[instrument(skip(store, stack, deployment, requested_by), fields(stack = %stack))]
pub async fn create_import(
    store: &dyn Persistence,
    stack: &StackIdentifier,
    deployment: Checkpoint,
    requested_by: &UserInfo,
) -> Result<UpdateIdentifier> {
    let mut tx = store.begin().await?;

    let created = create_update_in(
        tx.as_mut(),
        stack,
        UpdateKind::StackImport,
        UpdateRequest::default(),
        requested_by,
    )
    .await?;
    let id = UpdateIdentifier::new(stack.clone(), UpdateKind::StackImport, created.update_id)?;

    start_update_in(tx.as_mut(), &id).await?;
    checkpoint_update_in(tx.as_mut(), &id, deployment).await?;
    let completed = complete_update_in(tx.as_mut(), &id, UpdateStatus::Succeeded).await?;
    tx.commit().await?;

    info!(update_id = %id.update_id, version = completed.version, "Deployment imported");
    Ok(id)
}

// ============================================================================
// Reads
// ============================================================================

/// Current status of an update.
#[instrument(skip(store, id), fields(update = %id))]
pub async fn get_update_results(
    store: &dyn Persistence,
    id: &UpdateIdentifier,
) -> Result<UpdateResults> {
    let mut tx = store.begin().await?;
    let update = load_update_in(tx.as_mut(), id).await?;

    Ok(UpdateResults {
        status: update.status,
        events: Vec::new(),
    })
}

/// Paginated update history of a stack.
#[instrument(skip(store, stack), fields(stack = %stack))]
pub async fn list_updates(
    store: &dyn Persistence,
    stack: &StackIdentifier,
    page: UpdatePage,
) -> Result<Vec<StackUpdate>> {
    let mut tx = store.begin().await?;
    let current = get_stack_in(tx.as_mut(), stack).await?;

    let updates = tx
        .list_updates(&ListUpdatesFilter {
            stack_id: stack.stack_id(),
            dry_run: None,
            version: None,
            order: page.order,
            page: page.page,
            page_size: page.page_size,
        })
        .await?;

    debug!(count = updates.len(), "Updates listed");
    Ok(updates
        .iter()
        .map(|update| StackUpdate::new(&current, update))
        .collect())
}

/// Dry-run updates planned on top of `version` (that is, allocated `version + 1`).
#[instrument(skip(store, stack), fields(stack = %stack))]
pub async fn list_previews(
    store: &dyn Persistence,
    stack: &StackIdentifier,
    version: &str,
) -> Result<Vec<StackUpdate>> {
    let mut tx = store.begin().await?;
    let current = get_stack_in(tx.as_mut(), stack).await?;
    let target = resolve_version(&current, version)?;

    let previews = tx
        .list_updates(&ListUpdatesFilter {
            dry_run: Some(true),
            version: Some(target + 1),
            ..ListUpdatesFilter::for_stack(stack.stack_id())
        })
        .await?;

    debug!(count = previews.len(), target, "Previews listed");
    Ok(previews
        .iter()
        .map(|update| StackUpdate::with_kind(&current, update, preview_kind(update.kind)))
        .collect())
}

fn preview_kind(kind: UpdateKind) -> String {
    match kind {
        UpdateKind::Destroy => "Pdestroy".to_string(),
        _ => "Pupdate".to_string(),
    }
}

/// History view of the update that committed `version` of a stack.
#[instrument(skip(store, stack), fields(stack = %stack))]
pub async fn get_stack_update(
    store: &dyn Persistence,
    stack: &StackIdentifier,
    version: &str,
) -> Result<StackUpdate> {
    let mut tx = store.begin().await?;
    let current = get_stack_in(tx.as_mut(), stack).await?;
    let update = committed_update_in(tx.as_mut(), &current, version).await?;

    Ok(StackUpdate::new(&current, &update))
}

/// Resolve `version` and read the update that committed it.
pub async fn committed_update_in(
    tx: &mut dyn StoreTransaction,
    stack: &Stack,
    version: &str,
) -> Result<UpdateRecord> {
    let stack_id = stack.identifier.stack_id();
    let version = resolve_version(stack, version)?;

    let record = tx
        .get_stack_version(&stack_id, version)
        .await?
        .ok_or_else(|| CoreError::VersionNotFound {
            stack_id: stack_id.clone(),
            version,
        })?;

    tx.get_update(&record.update_id)
        .await?
        .ok_or(CoreError::UpdateNotFound {
            update_id: record.update_id,
        })
}
