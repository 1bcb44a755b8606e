// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Records and payloads for stacks, updates, checkpoints and engine events.
//!
//! Records reference each other only through identifier fields (`stack_id`,
//! `update_id`); relationships are resolved with explicit store lookups.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::CoreError;
use crate::identifiers::{StackIdentifier, UpdateKind};

// ============================================================================
// Update status
// ============================================================================

/// Status of a single update attempt.
///
/// ```text
///   create          start             complete(status)
/// ────────► NotStarted ────► Running ─────────────────► Succeeded | Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UpdateStatus {
    /// Created but not started.
    NotStarted,
    /// Started and not yet completed.
    Running,
    /// Completed successfully.
    Succeeded,
    /// Completed with a failure.
    Failed,
}

impl UpdateStatus {
    /// Storage representation of the status.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotStarted => "not-started",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }

    /// Whether the status is one a completed update can end in.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

impl fmt::Display for UpdateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UpdateStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "not-started" => Ok(Self::NotStarted),
            "running" => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            other => Err(CoreError::ValidationError {
                field: "status".to_string(),
                message: format!("invalid update status '{}'", other),
            }),
        }
    }
}

/// Outcome of an update as reported in history views.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UpdateResult {
    /// Not started yet.
    NotStarted,
    /// Running.
    InProgress,
    /// Finished successfully.
    Succeeded,
    /// Finished with a failure.
    Failed,
}

impl From<UpdateStatus> for UpdateResult {
    fn from(status: UpdateStatus) -> Self {
        match status {
            UpdateStatus::NotStarted => Self::NotStarted,
            UpdateStatus::Running => Self::InProgress,
            UpdateStatus::Succeeded => Self::Succeeded,
            UpdateStatus::Failed => Self::Failed,
        }
    }
}

// ============================================================================
// Users
// ============================================================================

/// Public profile of a user, copied into update records at creation time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInfo {
    /// Display name.
    pub name: String,
    /// Login handle.
    pub github_login: String,
    /// Avatar URL.
    pub avatar_url: String,
    /// Contact email.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

/// A registered user of the service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct ServiceUser {
    /// Generated user id.
    pub id: String,
    /// Unique login handle.
    pub github_login: String,
    /// Display name.
    pub name: String,
    /// Contact email.
    pub email: String,
    /// Avatar URL.
    pub avatar_url: String,
}

impl ServiceUser {
    /// Snapshot of the user's public fields.
    pub fn public_info(&self) -> UserInfo {
        UserInfo {
            name: self.name.clone(),
            github_login: self.github_login.clone(),
            avatar_url: self.avatar_url.clone(),
            email: Some(self.email.clone()).filter(|e| !e.is_empty()),
        }
    }
}

// ============================================================================
// Stacks
// ============================================================================

/// A named, versioned deployment target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stack {
    /// Generated id, stable across the stack's lifetime.
    pub id: String,
    /// Natural key.
    pub identifier: StackIdentifier,
    /// Number of committed (non-preview) updates.
    pub version: i64,
    /// Update that produced the current version, `None` at version 0.
    pub active_update: Option<String>,
    /// Opaque tags.
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    /// Opaque stack configuration.
    #[serde(default)]
    pub config: Option<Value>,
    /// When the stack was created.
    pub created_at: DateTime<Utc>,
}

/// Listing entry for a stack.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StackSummary {
    /// Generated stack id.
    pub id: String,
    /// Owner.
    pub org_name: String,
    /// Project.
    pub project_name: String,
    /// Stack name.
    pub stack_name: String,
    /// Unix seconds of the active update's end time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_update: Option<i64>,
    /// Resources in the active checkpoint.
    pub resource_count: usize,
}

/// Durable mapping of a committed stack version to the update that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct StackVersionRecord {
    /// Stack key.
    pub stack_id: String,
    /// Committed version.
    pub version: i64,
    /// Update that committed it.
    pub update_id: String,
}

// ============================================================================
// Updates
// ============================================================================

/// A configuration value as submitted by the client.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigValue {
    /// Raw value (ciphertext when `secret`).
    pub string: String,
    /// Whether the value is encrypted.
    #[serde(default)]
    pub secret: bool,
    /// Whether the value is a JSON object.
    #[serde(default)]
    pub object: bool,
}

/// Update configuration, keyed by config key.
pub type ConfigMap = BTreeMap<String, ConfigValue>;

/// Program being deployed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateProgram {
    /// Project name.
    pub name: String,
    /// Language runtime.
    pub runtime: String,
    /// Entry point.
    pub main: String,
    /// Free-form description.
    pub description: String,
}

/// Client-supplied update options. Only `dryRun` is interpreted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpdateOptions {
    /// Plan only, never commit.
    #[serde(rename = "dryRun", default)]
    pub dry_run: bool,
    /// Remaining options, passed through.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Client-supplied metadata for an update.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateMetadata {
    /// Update message.
    pub message: String,
    /// Environment captured by the client (CI, git, ...).
    pub environment: BTreeMap<String, String>,
}

/// One update attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateRecord {
    /// Globally unique update id.
    pub update_id: String,
    /// Key of the owning stack.
    pub stack_id: String,
    /// Kind of the update.
    pub kind: UpdateKind,
    /// Version allocated at creation (`stack.version + 1` at that moment).
    pub version: i64,
    /// Preview updates spend a version slot but never commit.
    pub dry_run: bool,
    /// Lifecycle status.
    pub status: UpdateStatus,
    /// Program being deployed.
    pub program: UpdateProgram,
    /// Options as submitted.
    pub options: UpdateOptions,
    /// Config as submitted.
    pub config: ConfigMap,
    /// Metadata as submitted.
    pub metadata: UpdateMetadata,
    /// Copy of the requesting user's public profile.
    pub requested_by: UserInfo,
    /// Set by start.
    pub start_time: Option<DateTime<Utc>>,
    /// Set by complete.
    pub end_time: Option<DateTime<Utc>>,
    /// When the record was created.
    pub created_at: DateTime<Utc>,
}

/// Status response for an update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateResults {
    /// Current status.
    pub status: UpdateStatus,
    /// Always empty; engine events are served separately.
    pub events: Vec<Value>,
}

/// Summary block of the history view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateInfo {
    /// Update kind (`Pupdate`/`Pdestroy` for previews).
    pub kind: String,
    /// Update message.
    pub message: String,
    /// Client environment.
    pub environment: BTreeMap<String, String>,
    /// Config as submitted.
    pub config: ConfigMap,
    /// Unix seconds, 0 if never started.
    pub start_time: i64,
    /// Unix seconds, 0 if never completed.
    pub end_time: i64,
    /// Outcome.
    pub result: UpdateResult,
    /// Allocated version.
    pub version: i64,
}

/// History view of an update, as returned by version and preview lookups.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StackUpdate {
    /// Summary block.
    pub info: UpdateInfo,
    /// Who requested the update.
    pub requested_by: UserInfo,
    /// Update id.
    #[serde(rename = "updateID")]
    pub update_id: String,
    /// Allocated version.
    pub version: i64,
    /// The stack's current version at read time.
    pub latest_version: i64,
}

impl StackUpdate {
    /// Build the view for `update` against the current state of `stack`.
    pub fn new(stack: &Stack, update: &UpdateRecord) -> Self {
        Self::with_kind(stack, update, update.kind.as_str().to_string())
    }

    /// Build the view with an overridden kind label.
    pub fn with_kind(stack: &Stack, update: &UpdateRecord, kind: String) -> Self {
        Self {
            info: UpdateInfo {
                kind,
                message: update.metadata.message.clone(),
                environment: update.metadata.environment.clone(),
                config: update.config.clone(),
                start_time: update.start_time.map(|t| t.timestamp()).unwrap_or(0),
                end_time: update.end_time.map(|t| t.timestamp()).unwrap_or(0),
                result: update.status.into(),
                version: update.version,
            },
            requested_by: update.requested_by.clone(),
            update_id: update.update_id.clone(),
            version: update.version,
            latest_version: stack.version,
        }
    }
}

// ============================================================================
// Checkpoints and deployments
// ============================================================================

/// A versioned deployment snapshot as reported by the executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Deployment format version (not the stack version).
    pub version: i64,
    /// Format feature flags.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub features: Vec<String>,
    /// Opaque serialized deployment state.
    pub deployment: Value,
}

/// Latest checkpoint of an update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointRecord {
    /// Update the checkpoint belongs to.
    pub update_id: String,
    /// Snapshot contents.
    pub checkpoint: Checkpoint,
}

/// Exported deployment of a stack.
pub type UntypedDeployment = Checkpoint;

impl Checkpoint {
    /// The sentinel returned for stacks that have never committed an update.
    pub fn empty_deployment() -> Self {
        Self {
            version: 1,
            features: Vec::new(),
            deployment: serde_json::json!({
                "manifest": {
                    "time": "0001-01-01T00:00:00Z",
                    "magic": "",
                    "version": "",
                }
            }),
        }
    }

    /// Extract the resource list from the deployment.
    ///
    /// A deployment without a `resources` field has no resources.
    pub fn resources(&self) -> Result<Vec<Resource>, CoreError> {
        match self.deployment.get("resources") {
            None | Some(Value::Null) => Ok(Vec::new()),
            Some(resources) => Ok(serde_json::from_value(resources.clone())?),
        }
    }
}

/// A resource entry of a deployment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    /// Unique resource name.
    pub urn: String,
    /// Resource type token.
    #[serde(rename = "type")]
    pub resource_type: String,
    /// Remaining resource fields, passed through.
    #[serde(flatten)]
    pub properties: Map<String, Value>,
}

// ============================================================================
// Engine events
// ============================================================================

/// A caller-sequenced progress entry emitted while an update runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineEvent {
    /// Caller-assigned sequence number, unique per update.
    pub sequence: i64,
    /// Unix seconds.
    #[serde(default)]
    pub timestamp: i64,
    /// Event body, passed through.
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}
