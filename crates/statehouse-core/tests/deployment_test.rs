// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Checkpoint, resource, engine event and stack summary tests.

mod common;

use serde_json::{Map, json};

use common::*;
use statehouse_core::error::CoreError;
use statehouse_core::model::{Checkpoint, EngineEvent, UntypedDeployment, UpdateStatus};
use statehouse_core::{UpdateKind, checkpoints, events, stacks, updates};

fn event(sequence: i64, message: &str) -> EngineEvent {
    let mut payload = Map::new();
    payload.insert("diagnosticEvent".to_string(), json!({"message": message}));
    EngineEvent {
        sequence,
        timestamp: 1_735_689_600 + sequence,
        payload,
    }
}

#[tokio::test]
async fn test_new_stack_deployment_is_sentinel() {
    let ctx = TestContext::new().await;
    let stack = ctx.create_stack("acme", "infra", "fresh").await;

    let exported = checkpoints::get_stack_deployment(ctx.store(), &stack)
        .await
        .unwrap();
    assert_eq!(exported, UntypedDeployment::empty_deployment());
    assert_eq!(
        exported.deployment["manifest"]["time"],
        "0001-01-01T00:00:00Z"
    );
    assert!(exported.resources().unwrap().is_empty());
}

#[tokio::test]
async fn test_dry_run_keeps_sentinel() {
    let ctx = TestContext::new().await;
    let stack = ctx.create_stack("acme", "infra", "planned").await;
    ctx.run_update(
        &stack,
        UpdateKind::Preview,
        Some(deployment(&["urn:a"])),
        UpdateStatus::Succeeded,
    )
    .await;

    let exported = checkpoints::get_stack_deployment(ctx.store(), &stack)
        .await
        .unwrap();
    assert_eq!(exported, UntypedDeployment::empty_deployment());
}

#[tokio::test]
async fn test_checkpoint_resources_round_trip() {
    let ctx = TestContext::new().await;
    let stack = ctx.create_stack("acme", "infra", "prod").await;
    let id = ctx.start(&stack, UpdateKind::Update).await;

    let snapshot = deployment(&[
        "urn:pulumi:prod::infra::aws:s3/bucket:Bucket::logs",
        "urn:pulumi:prod::infra::aws:s3/bucket:Bucket::assets",
    ]);
    updates::checkpoint_update(ctx.store(), &id, snapshot.clone())
        .await
        .unwrap();

    let resources = checkpoints::list_stack_resources(ctx.store(), &id)
        .await
        .unwrap();
    assert_eq!(
        serde_json::to_value(&resources).unwrap(),
        snapshot.deployment["resources"]
    );
    assert_eq!(resources[0].resource_type, "aws:s3/bucket:Bucket");
}

#[tokio::test]
async fn test_checkpoint_is_last_write_wins() {
    let ctx = TestContext::new().await;
    let stack = ctx.create_stack("acme", "infra", "prod").await;
    let id = ctx.start(&stack, UpdateKind::Update).await;

    updates::checkpoint_update(ctx.store(), &id, deployment(&["urn:a", "urn:b"]))
        .await
        .unwrap();
    updates::checkpoint_update(ctx.store(), &id, deployment(&["urn:c"]))
        .await
        .unwrap();

    let resources = checkpoints::list_stack_resources(ctx.store(), &id)
        .await
        .unwrap();
    assert_eq!(resources.len(), 1);
    assert_eq!(resources[0].urn, "urn:c");
}

#[tokio::test]
async fn test_checkpoint_without_resources_key() {
    let ctx = TestContext::new().await;
    let stack = ctx.create_stack("acme", "infra", "bare").await;
    let id = ctx.start(&stack, UpdateKind::Update).await;

    updates::checkpoint_update(
        ctx.store(),
        &id,
        Checkpoint {
            version: 3,
            features: vec![],
            deployment: json!({"manifest": {}}),
        },
    )
    .await
    .unwrap();

    assert!(
        checkpoints::list_stack_resources(ctx.store(), &id)
            .await
            .unwrap()
            .is_empty()
    );
}

#[tokio::test]
async fn test_resources_without_checkpoint_not_found() {
    let ctx = TestContext::new().await;
    let stack = ctx.create_stack("acme", "infra", "empty").await;
    let id = ctx.start(&stack, UpdateKind::Update).await;

    let err = checkpoints::list_stack_resources(ctx.store(), &id)
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::CheckpointNotFound { .. }));
}

#[tokio::test]
async fn test_resources_at_committed_versions() {
    let ctx = TestContext::new().await;
    let stack = ctx.create_stack("acme", "infra", "prod").await;
    ctx.run_update(
        &stack,
        UpdateKind::Update,
        Some(deployment(&["urn:a"])),
        UpdateStatus::Succeeded,
    )
    .await;
    ctx.run_update(
        &stack,
        UpdateKind::Update,
        Some(deployment(&["urn:a", "urn:b", "urn:c"])),
        UpdateStatus::Succeeded,
    )
    .await;

    let v1 = checkpoints::list_stack_resources_at(ctx.store(), &stack, "1")
        .await
        .unwrap();
    assert_eq!(v1.len(), 1);
    let latest = checkpoints::list_stack_resources_at(ctx.store(), &stack, "latest")
        .await
        .unwrap();
    assert_eq!(latest.len(), 3);

    let err = checkpoints::list_stack_resources_at(ctx.store(), &stack, "one")
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::ValidationError { .. }));
}

#[tokio::test]
async fn test_duplicate_event_batch_appends_nothing() {
    let ctx = TestContext::new().await;
    let stack = ctx.create_stack("acme", "infra", "prod").await;
    let id = ctx.start(&stack, UpdateKind::Update).await;

    let err = events::add_engine_events(
        ctx.store(),
        &id,
        &[event(1, "first"), event(1, "again")],
    )
    .await
    .unwrap_err();
    assert!(matches!(err, CoreError::DuplicateEngineEvent { sequence: 1, .. }));

    assert!(
        events::list_engine_events(ctx.store(), &id)
            .await
            .unwrap()
            .is_empty()
    );
}

#[tokio::test]
async fn test_events_ordered_and_independent_of_status() {
    let ctx = TestContext::new().await;
    let stack = ctx.create_stack("acme", "infra", "prod").await;
    let (id, _) = ctx
        .run_update(&stack, UpdateKind::Update, None, UpdateStatus::Succeeded)
        .await;

    // Events may arrive after completion.
    events::add_engine_events(ctx.store(), &id, &[event(10, "late"), event(3, "early")])
        .await
        .unwrap();
    events::add_engine_events(ctx.store(), &id, &[event(7, "middle")])
        .await
        .unwrap();

    let listed = events::list_engine_events(ctx.store(), &id).await.unwrap();
    let sequences: Vec<i64> = listed.iter().map(|e| e.sequence).collect();
    assert_eq!(sequences, vec![3, 7, 10]);
    assert_eq!(listed[1].payload["diagnosticEvent"]["message"], "middle");
}

#[tokio::test]
async fn test_list_stacks_summaries() {
    let ctx = TestContext::new().await;
    let prod = ctx.create_stack("acme", "infra", "prod").await;
    let dev = ctx.create_stack("acme", "infra", "dev").await;
    ctx.create_stack("globex", "web", "prod").await;

    ctx.run_update(
        &prod,
        UpdateKind::Update,
        Some(deployment(&["urn:a", "urn:b"])),
        UpdateStatus::Succeeded,
    )
    .await;

    let acme = stacks::list_stacks(ctx.store(), Some("acme")).await.unwrap();
    assert_eq!(acme.len(), 2);

    let prod_summary = acme
        .iter()
        .find(|s| s.stack_name == prod.stack.to_string())
        .unwrap();
    assert_eq!(prod_summary.org_name, "acme");
    assert_eq!(prod_summary.resource_count, 2);
    assert!(prod_summary.last_update.is_some());

    let dev_summary = acme
        .iter()
        .find(|s| s.stack_name == dev.stack.to_string())
        .unwrap();
    assert_eq!(dev_summary.resource_count, 0);
    assert_eq!(dev_summary.last_update, None);

    let everything = stacks::list_stacks(ctx.store(), None).await.unwrap();
    assert_eq!(everything.len(), 3);
}
