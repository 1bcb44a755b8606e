// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Stack creation, lookup, deletion and version resolution.
//!
//! Every operation comes in two forms: one taking a [`Persistence`] that runs
//! in its own transaction, and an `_in` form taking an open
//! [`StoreTransaction`] so callers can compose several steps atomically.

use std::collections::BTreeMap;

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::error::{CoreError, Result};
use crate::identifiers::{StackIdentifier, VersionToken};
use crate::model::{Stack, StackSummary};
use crate::persistence::{Persistence, StoreTransaction};

/// Create a stack at version 0 with no active update.
#[instrument(skip(store, identifier, tags, config), fields(stack = %identifier))]
pub async fn create_stack(
    store: &dyn Persistence,
    identifier: &StackIdentifier,
    tags: BTreeMap<String, String>,
    config: Option<Value>,
) -> Result<Stack> {
    let mut tx = store.begin().await?;
    let stack = create_stack_in(tx.as_mut(), identifier, tags, config).await?;
    tx.commit().await?;

    info!(stack_id = %stack.id, "Stack created");
    Ok(stack)
}

/// [`create_stack`] inside an open transaction.
pub async fn create_stack_in(
    tx: &mut dyn StoreTransaction,
    identifier: &StackIdentifier,
    tags: BTreeMap<String, String>,
    config: Option<Value>,
) -> Result<Stack> {
    let stack = Stack {
        id: Uuid::new_v4().to_string(),
        identifier: identifier.clone(),
        version: 0,
        active_update: None,
        tags,
        config,
        created_at: Utc::now(),
    };

    tx.create_stack(&stack).await?;
    Ok(stack)
}

/// Read a stack. Fails with `StackNotFound` if absent.
#[instrument(skip(store, identifier), fields(stack = %identifier))]
pub async fn get_stack(store: &dyn Persistence, identifier: &StackIdentifier) -> Result<Stack> {
    let mut tx = store.begin().await?;
    let stack = get_stack_in(tx.as_mut(), identifier).await?;
    debug!(version = stack.version, "Stack loaded");
    Ok(stack)
}

/// [`get_stack`] inside an open transaction.
pub async fn get_stack_in(
    tx: &mut dyn StoreTransaction,
    identifier: &StackIdentifier,
) -> Result<Stack> {
    let stack_id = identifier.stack_id();
    tx.get_stack(&stack_id)
        .await?
        .ok_or(CoreError::StackNotFound { stack_id })
}

/// Delete a stack together with its updates, checkpoints, events and version
/// records.
///
/// Infrastructure described by the stack's checkpoints is left alone.
#[instrument(skip(store, identifier), fields(stack = %identifier))]
pub async fn delete_stack(store: &dyn Persistence, identifier: &StackIdentifier) -> Result<()> {
    let stack_id = identifier.stack_id();

    let mut tx = store.begin().await?;
    if !tx.delete_stack(&stack_id).await? {
        return Err(CoreError::StackNotFound { stack_id });
    }
    tx.commit().await?;

    info!("Stack deleted");
    Ok(())
}

/// Resolve a version token against a stack.
///
/// `latest` is the stack's current version; a number is returned as-is, with
/// no check that the version was ever committed.
pub fn resolve_version(stack: &Stack, token: &str) -> Result<i64> {
    Ok(match token.parse::<VersionToken>()? {
        VersionToken::Latest => stack.version,
        VersionToken::Number(n) => n,
    })
}

/// List stacks, optionally for one owner only.
#[instrument(skip(store))]
pub async fn list_stacks(store: &dyn Persistence, owner: Option<&str>) -> Result<Vec<StackSummary>> {
    let mut tx = store.begin().await?;
    let stacks = tx.list_stacks(owner).await?;

    let mut summaries = Vec::with_capacity(stacks.len());
    for stack in stacks {
        let mut last_update = None;
        let mut resource_count = 0;

        if let Some(update_id) = &stack.active_update {
            if let Some(update) = tx.get_update(update_id).await? {
                last_update = update.end_time.map(|t| t.timestamp());
            }
            if let Some(record) = tx.get_checkpoint(update_id).await? {
                resource_count = record.checkpoint.resources()?.len();
            }
        }

        summaries.push(StackSummary {
            id: stack.id,
            org_name: stack.identifier.owner,
            project_name: stack.identifier.project,
            stack_name: stack.identifier.stack.to_string(),
            last_update,
            resource_count,
        });
    }

    debug!(count = summaries.len(), "Stacks listed");
    Ok(summaries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::sqlite::memory_store as test_store;

    fn prod() -> StackIdentifier {
        StackIdentifier::new("acme", "infra", "prod").unwrap()
    }

    #[tokio::test]
    async fn test_create_and_get_stack() {
        let store = test_store().await;

        let created = create_stack(&store, &prod(), BTreeMap::new(), None)
            .await
            .unwrap();
        assert_eq!(created.version, 0);
        assert!(created.active_update.is_none());

        let loaded = get_stack(&store, &prod()).await.unwrap();
        assert_eq!(loaded.id, created.id);
    }

    #[tokio::test]
    async fn test_create_stack_twice_fails() {
        let store = test_store().await;

        create_stack(&store, &prod(), BTreeMap::new(), None)
            .await
            .unwrap();
        let err = create_stack(&store, &prod(), BTreeMap::new(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::StackAlreadyExists { .. }));
    }

    #[tokio::test]
    async fn test_get_missing_stack() {
        let store = test_store().await;
        let err = get_stack(&store, &prod()).await.unwrap_err();
        assert!(matches!(err, CoreError::StackNotFound { ref stack_id } if stack_id == "acme/infra/prod"));
    }

    #[tokio::test]
    async fn test_delete_stack() {
        let store = test_store().await;

        create_stack(&store, &prod(), BTreeMap::new(), None)
            .await
            .unwrap();
        delete_stack(&store, &prod()).await.unwrap();

        assert!(get_stack(&store, &prod()).await.unwrap_err().is_not_found());
        assert!(delete_stack(&store, &prod()).await.unwrap_err().is_not_found());

        // The identifier is free again
        create_stack(&store, &prod(), BTreeMap::new(), None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_resolve_version() {
        let store = test_store().await;
        let mut stack = create_stack(&store, &prod(), BTreeMap::new(), None)
            .await
            .unwrap();
        stack.version = 4;

        assert_eq!(resolve_version(&stack, "latest").unwrap(), 4);
        assert_eq!(resolve_version(&stack, "2").unwrap(), 2);
        assert_eq!(resolve_version(&stack, "99").unwrap(), 99);
        assert_eq!(
            resolve_version(&stack, "two").unwrap_err().error_code(),
            "VALIDATION_ERROR"
        );
    }

    #[tokio::test]
    async fn test_list_stacks_without_updates() {
        let store = test_store().await;
        create_stack(&store, &prod(), BTreeMap::new(), None)
            .await
            .unwrap();
        create_stack(
            &store,
            &StackIdentifier::new("globex", "web", "dev").unwrap(),
            BTreeMap::new(),
            None,
        )
        .await
        .unwrap();

        let all = list_stacks(&store, None).await.unwrap();
        assert_eq!(all.len(), 2);

        let acme = list_stacks(&store, Some("acme")).await.unwrap();
        assert_eq!(acme.len(), 1);
        assert_eq!(acme[0].stack_name, "prod");
        assert_eq!(acme[0].resource_count, 0);
        assert!(acme[0].last_update.is_none());
    }
}
