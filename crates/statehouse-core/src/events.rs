// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Append-only engine event log, one stream per update.

use tracing::{debug, instrument};

use crate::error::Result;
use crate::identifiers::UpdateIdentifier;
use crate::model::EngineEvent;
use crate::persistence::{Persistence, StoreTransaction};
use crate::updates::load_update_in;

/// Append a batch of events.
///
/// The batch is all-or-nothing: a sequence number already used by the update,
/// or repeated within the batch, fails the call with `DuplicateEngineEvent`
/// and nothing is appended.
#[instrument(skip(store, id, events), fields(update = %id, count = events.len()))]
pub async fn add_engine_events(
    store: &dyn Persistence,
    id: &UpdateIdentifier,
    events: &[EngineEvent],
) -> Result<()> {
    let mut tx = store.begin().await?;
    add_engine_events_in(tx.as_mut(), id, events).await?;
    tx.commit().await?;

    debug!("Engine events appended");
    Ok(())
}

/// [`add_engine_events`] inside an open transaction.
pub async fn add_engine_events_in(
    tx: &mut dyn StoreTransaction,
    id: &UpdateIdentifier,
    events: &[EngineEvent],
) -> Result<()> {
    load_update_in(tx, id).await?;
    for event in events {
        tx.create_engine_event(&id.update_id, event).await?;
    }
    Ok(())
}

/// All events of an update, by ascending sequence.
#[instrument(skip(store, id), fields(update = %id))]
pub async fn list_engine_events(
    store: &dyn Persistence,
    id: &UpdateIdentifier,
) -> Result<Vec<EngineEvent>> {
    let mut tx = store.begin().await?;
    load_update_in(tx.as_mut(), id).await?;
    let events = tx.list_engine_events(&id.update_id).await?;

    debug!(count = events.len(), "Engine events listed");
    Ok(events)
}
