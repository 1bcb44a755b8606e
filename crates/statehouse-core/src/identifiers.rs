// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Identifier model for stacks and updates.
//!
//! Identifiers are pure values. Parsing enforces the syntactic rules; nothing
//! here touches the store, so a malformed identifier is always a
//! [`CoreError::ValidationError`] and never a lookup failure.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Maximum length of a single identifier component (owner, project or stack name).
pub const MAX_COMPONENT_LEN: usize = 100;

/// Literal version token that resolves to the stack's current version.
pub const LATEST_VERSION_TOKEN: &str = "latest";

fn validate_component(field: &str, value: &str) -> Result<(), CoreError> {
    if value.is_empty() {
        return Err(CoreError::ValidationError {
            field: field.to_string(),
            message: "must not be empty".to_string(),
        });
    }

    if value.len() > MAX_COMPONENT_LEN {
        return Err(CoreError::ValidationError {
            field: field.to_string(),
            message: format!("must be at most {} characters", MAX_COMPONENT_LEN),
        });
    }

    if let Some(c) = value
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
    {
        return Err(CoreError::ValidationError {
            field: field.to_string(),
            message: format!(
                "invalid character '{}': only alphanumerics, hyphens, underscores and periods are allowed",
                c
            ),
        });
    }

    Ok(())
}

/// A validated stack name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StackName(String);

impl StackName {
    /// Parse and validate a stack name.
    pub fn parse(name: &str) -> Result<Self, CoreError> {
        validate_component("stack", name)?;
        Ok(Self(name.to_string()))
    }

    /// The name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StackName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for StackName {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<StackName> for String {
    fn from(value: StackName) -> Self {
        value.0
    }
}

/// Natural key of a stack: `owner/project/stack`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StackIdentifier {
    /// Owning organization or user.
    pub owner: String,
    /// Project the stack belongs to.
    pub project: String,
    /// Stack name within the project.
    pub stack: StackName,
}

impl StackIdentifier {
    /// Build an identifier from its three components, validating each.
    pub fn new(owner: &str, project: &str, stack: &str) -> Result<Self, CoreError> {
        validate_component("owner", owner)?;
        validate_component("project", project)?;

        Ok(Self {
            owner: owner.to_string(),
            project: project.to_string(),
            stack: StackName::parse(stack)?,
        })
    }

    /// Store key for this stack.
    pub fn stack_id(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for StackIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.owner, self.project, self.stack)
    }
}

impl FromStr for StackIdentifier {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('/').collect();
        match parts.as_slice() {
            [owner, project, stack] => Self::new(owner, project, stack),
            _ => Err(CoreError::ValidationError {
                field: "stack".to_string(),
                message: format!("expected 'owner/project/stack', got '{}'", s),
            }),
        }
    }
}

/// The kind of operation an update performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UpdateKind {
    /// A regular deployment.
    #[serde(rename = "update")]
    Update,
    /// A dry run that plans without committing.
    #[serde(rename = "preview")]
    Preview,
    /// Reconcile recorded state with the real infrastructure.
    #[serde(rename = "refresh")]
    Refresh,
    /// Rename the stack.
    #[serde(rename = "rename")]
    Rename,
    /// Tear down all resources.
    #[serde(rename = "destroy")]
    Destroy,
    /// Import a complete deployment.
    #[serde(rename = "import")]
    StackImport,
    /// Adopt existing resources into the stack.
    #[serde(rename = "resource-import")]
    ResourceImport,
}

impl UpdateKind {
    /// All kinds, in declaration order.
    pub const ALL: [UpdateKind; 7] = [
        UpdateKind::Update,
        UpdateKind::Preview,
        UpdateKind::Refresh,
        UpdateKind::Rename,
        UpdateKind::Destroy,
        UpdateKind::StackImport,
        UpdateKind::ResourceImport,
    ];

    /// Wire representation of the kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Update => "update",
            Self::Preview => "preview",
            Self::Refresh => "refresh",
            Self::Rename => "rename",
            Self::Destroy => "destroy",
            Self::StackImport => "import",
            Self::ResourceImport => "resource-import",
        }
    }
}

impl fmt::Display for UpdateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UpdateKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| CoreError::ValidationError {
                field: "kind".to_string(),
                message: format!("invalid update kind '{}'", s),
            })
    }
}

/// Identifies one update attempt against a stack.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UpdateIdentifier {
    /// Stack the update targets.
    pub stack: StackIdentifier,
    /// Kind of the update.
    pub kind: UpdateKind,
    /// Globally unique update id.
    pub update_id: String,
}

impl UpdateIdentifier {
    /// Build an update identifier. The update id must not be empty.
    pub fn new(
        stack: StackIdentifier,
        kind: UpdateKind,
        update_id: impl Into<String>,
    ) -> Result<Self, CoreError> {
        let update_id = update_id.into();
        if update_id.is_empty() {
            return Err(CoreError::ValidationError {
                field: "update_id".to_string(),
                message: "must not be empty".to_string(),
            });
        }

        Ok(Self {
            stack,
            kind,
            update_id,
        })
    }
}

impl fmt::Display for UpdateIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.stack, self.kind, self.update_id)
    }
}

/// A stack version reference: either `latest` or an explicit number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionToken {
    /// The stack's current committed version.
    Latest,
    /// An explicit version number. Not checked against existing versions.
    Number(i64),
}

impl FromStr for VersionToken {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == LATEST_VERSION_TOKEN {
            return Ok(Self::Latest);
        }

        s.parse::<i64>()
            .map(Self::Number)
            .map_err(|_| CoreError::ValidationError {
                field: "version".to_string(),
                message: format!("expected 'latest' or an integer, got '{}'", s),
            })
    }
}

impl fmt::Display for VersionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Latest => f.write_str(LATEST_VERSION_TOKEN),
            Self::Number(n) => write!(f, "{}", n),
        }
    }
}
