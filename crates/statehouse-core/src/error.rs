// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for statehouse-core.
//!
//! Provides a unified error type with stable error codes and a coarse
//! [`ErrorKind`] classification for callers that only care about the class.

use std::fmt;

/// Result type using CoreError
pub type Result<T> = std::result::Result<T, CoreError>;

/// Coarse error classes surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The requested stack, update, checkpoint or version does not exist.
    NotFound,
    /// A create collided with an existing record, or a commit lost a version race.
    AlreadyExists,
    /// A malformed identifier or request field.
    InvalidArgument,
    /// The caller's token does not grant the required capability.
    Unauthorized,
    /// Store or crypto collaborator failure.
    Internal,
}

/// Core errors that can occur during request processing.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum CoreError {
    /// Stack was not found.
    StackNotFound {
        /// The stack key (`owner/project/stack`).
        stack_id: String,
    },

    /// A stack with the same identifier already exists.
    StackAlreadyExists {
        /// The stack key (`owner/project/stack`).
        stack_id: String,
    },

    /// Update was not found.
    UpdateNotFound {
        /// The update ID that was not found.
        update_id: String,
    },

    /// No checkpoint was ever written for the update.
    CheckpointNotFound {
        /// The update ID.
        update_id: String,
    },

    /// No committed update exists for the stack version.
    VersionNotFound {
        /// The stack key.
        stack_id: String,
        /// The version that was looked up.
        version: i64,
    },

    /// Another update already committed this stack version.
    VersionConflict {
        /// The stack key.
        stack_id: String,
        /// The contested version.
        version: i64,
        /// The update that lost the race.
        update_id: String,
    },

    /// An engine event with the same sequence already exists for the update.
    DuplicateEngineEvent {
        /// The update ID.
        update_id: String,
        /// The duplicated sequence number.
        sequence: i64,
    },

    /// A user with the same login already exists.
    UserAlreadyExists {
        /// The duplicated login.
        login: String,
    },

    /// User was not found.
    UserNotFound {
        /// The user ID.
        user_id: String,
    },

    /// Input validation failed.
    ValidationError {
        /// The field that failed validation.
        field: String,
        /// The validation error message.
        message: String,
    },

    /// The caller is not allowed to perform the operation.
    Unauthorized {
        /// Why the request was rejected.
        reason: String,
    },

    /// The crypto collaborator failed.
    CryptoError {
        /// The operation that failed (encrypt, decrypt).
        operation: String,
        /// Error details.
        details: String,
    },

    /// Database operation failed.
    DatabaseError {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },
}

impl CoreError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::StackNotFound { .. } => "STACK_NOT_FOUND",
            Self::StackAlreadyExists { .. } => "STACK_ALREADY_EXISTS",
            Self::UpdateNotFound { .. } => "UPDATE_NOT_FOUND",
            Self::CheckpointNotFound { .. } => "CHECKPOINT_NOT_FOUND",
            Self::VersionNotFound { .. } => "VERSION_NOT_FOUND",
            Self::VersionConflict { .. } => "VERSION_CONFLICT",
            Self::DuplicateEngineEvent { .. } => "DUPLICATE_ENGINE_EVENT",
            Self::UserAlreadyExists { .. } => "USER_ALREADY_EXISTS",
            Self::UserNotFound { .. } => "USER_NOT_FOUND",
            Self::ValidationError { .. } => "VALIDATION_ERROR",
            Self::Unauthorized { .. } => "UNAUTHORIZED",
            Self::CryptoError { .. } => "CRYPTO_ERROR",
            Self::DatabaseError { .. } => "DATABASE_ERROR",
        }
    }

    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::StackNotFound { .. }
            | Self::UpdateNotFound { .. }
            | Self::CheckpointNotFound { .. }
            | Self::VersionNotFound { .. }
            | Self::UserNotFound { .. } => ErrorKind::NotFound,
            Self::StackAlreadyExists { .. }
            | Self::VersionConflict { .. }
            | Self::DuplicateEngineEvent { .. }
            | Self::UserAlreadyExists { .. } => ErrorKind::AlreadyExists,
            Self::ValidationError { .. } => ErrorKind::InvalidArgument,
            Self::Unauthorized { .. } => ErrorKind::Unauthorized,
            Self::CryptoError { .. } | Self::DatabaseError { .. } => ErrorKind::Internal,
        }
    }

    /// Whether this is a not-found error of any kind.
    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StackNotFound { stack_id } => {
                write!(f, "Stack '{}' not found", stack_id)
            }
            Self::StackAlreadyExists { stack_id } => {
                write!(f, "Stack '{}' already exists", stack_id)
            }
            Self::UpdateNotFound { update_id } => {
                write!(f, "Update '{}' not found", update_id)
            }
            Self::CheckpointNotFound { update_id } => {
                write!(f, "No checkpoint found for update '{}'", update_id)
            }
            Self::VersionNotFound { stack_id, version } => {
                write!(f, "Version {} of stack '{}' not found", version, stack_id)
            }
            Self::VersionConflict {
                stack_id,
                version,
                update_id,
            } => {
                write!(
                    f,
                    "Version {} of stack '{}' was already committed; update '{}' must be retried",
                    version, stack_id, update_id
                )
            }
            Self::DuplicateEngineEvent {
                update_id,
                sequence,
            } => {
                write!(
                    f,
                    "Engine event {} already recorded for update '{}'",
                    sequence, update_id
                )
            }
            Self::UserAlreadyExists { login } => {
                write!(f, "User '{}' already exists", login)
            }
            Self::UserNotFound { user_id } => {
                write!(f, "User '{}' not found", user_id)
            }
            Self::ValidationError { field, message } => {
                write!(f, "Validation error for '{}': {}", field, message)
            }
            Self::Unauthorized { reason } => {
                write!(f, "Unauthorized: {}", reason)
            }
            Self::CryptoError { operation, details } => {
                write!(f, "Crypto error during '{}': {}", operation, details)
            }
            Self::DatabaseError { operation, details } => {
                write!(f, "Database error during '{}': {}", operation, details)
            }
        }
    }
}

impl std::error::Error for CoreError {}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        CoreError::DatabaseError {
            operation: "query".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::DatabaseError {
            operation: "json".to_string(),
            details: err.to_string(),
        }
    }
}
