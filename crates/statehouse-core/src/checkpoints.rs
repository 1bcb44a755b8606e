// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Read side of the checkpoint store: deployments and resource lists.
//!
//! Checkpoints are written by [`crate::updates::checkpoint_update`]. This
//! module answers "what does the stack look like" for the current version, a
//! given version, or a given update.

use tracing::{debug, instrument};

use crate::error::{CoreError, Result};
use crate::identifiers::{StackIdentifier, UpdateIdentifier};
use crate::model::{Resource, UntypedDeployment};
use crate::persistence::{Persistence, StoreTransaction};
use crate::stacks::get_stack_in;
use crate::updates::{committed_update_in, load_update_in};

async fn checkpoint_of(tx: &mut dyn StoreTransaction, update_id: &str) -> Result<UntypedDeployment> {
    tx.get_checkpoint(update_id)
        .await?
        .map(|record| record.checkpoint)
        .ok_or_else(|| CoreError::CheckpointNotFound {
            update_id: update_id.to_string(),
        })
}

/// Export the deployment of the stack's current version.
///
/// A stack that never committed an update yields the empty-manifest sentinel
/// rather than an error.
#[instrument(skip(store, stack), fields(stack = %stack))]
pub async fn get_stack_deployment(
    store: &dyn Persistence,
    stack: &StackIdentifier,
) -> Result<UntypedDeployment> {
    let mut tx = store.begin().await?;
    let current = get_stack_in(tx.as_mut(), stack).await?;

    let Some(update_id) = current.active_update.as_deref().filter(|_| current.version > 0) else {
        debug!("Stack has no committed version, returning empty deployment");
        return Ok(UntypedDeployment::empty_deployment());
    };

    checkpoint_of(tx.as_mut(), update_id).await
}

/// Resources recorded in the checkpoint of one update.
#[instrument(skip(store, id), fields(update = %id))]
pub async fn list_stack_resources(
    store: &dyn Persistence,
    id: &UpdateIdentifier,
) -> Result<Vec<Resource>> {
    let mut tx = store.begin().await?;
    load_update_in(tx.as_mut(), id).await?;
    let resources = checkpoint_of(tx.as_mut(), &id.update_id)
        .await?
        .resources()?;

    debug!(count = resources.len(), "Resources listed");
    Ok(resources)
}

/// Resources of the update that committed `version` (`latest` or a number).
#[instrument(skip(store, stack), fields(stack = %stack))]
pub async fn list_stack_resources_at(
    store: &dyn Persistence,
    stack: &StackIdentifier,
    version: &str,
) -> Result<Vec<Resource>> {
    let mut tx = store.begin().await?;
    let current = get_stack_in(tx.as_mut(), stack).await?;
    let update = committed_update_in(tx.as_mut(), &current, version).await?;

    let resources = checkpoint_of(tx.as_mut(), &update.update_id)
        .await?
        .resources()?;

    debug!(count = resources.len(), version = update.version, "Resources listed");
    Ok(resources)
}
