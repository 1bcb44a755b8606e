// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Statehouse Core - Versioned Stack State Store
//!
//! This crate tracks infrastructure stacks, the updates run against them, the
//! deployment checkpoints those updates report, their engine event streams and
//! the stack versions they commit. All state lives in PostgreSQL or SQLite.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────┐        ┌──────────────────────────┐
//! │      CLI / frontend      │        │   Deployment executor    │
//! │     (personal token)     │        │      (update token)      │
//! └────────────┬─────────────┘        └────────────┬─────────────┘
//!              │                                   │
//!              ▼                                   ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                    handlers (authorize + dispatch)              │
//! ├──────────┬──────────┬──────────┬──────────────┬─────────────────┤
//! │  stacks  │ updates  │  events  │ checkpoints  │     secrets     │
//! └──────────┴────┬─────┴──────────┴──────────────┴─────────────────┘
//!                 │ StoreTransaction
//!                 ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │              persistence (PostgreSQL | SQLite)                  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Operations
//!
//! | Operation | Token | Description |
//! |-----------|-------|-------------|
//! | `CreateStack` / `GetStack` / `DeleteStack` | personal | Stack management |
//! | `ListStacks` | personal | Stack summaries, optionally per owner |
//! | `GetStackDeployment` | personal | Deployment of the current version |
//! | `ListStackResources` | personal | Resources of an update or version |
//! | `CreateUpdate` / `CreateImport` | personal | New update, or one-shot import |
//! | `StartUpdate` | personal | Mark running, issue the update token |
//! | `CheckpointUpdate` | update | Replace the update's checkpoint |
//! | `CompleteUpdate` | update | Finish and commit the version |
//! | `AddEngineEvents` | update | Append engine events |
//! | `ListEngineEvents` / `GetUpdateResults` | personal | Progress reads |
//! | `ListUpdates` / `ListPreviews` / `GetStackUpdate` | personal | History |
//! | `Encrypt` / `Decrypt` / `BatchDecrypt` | personal | Config secrets |
//!
//! # Update Status State Machine
//!
//! ```text
//!   ┌─────────────┐  start   ┌─────────┐  complete  ┌───────────┐
//!   │ not-started │─────────►│ running │───────────►│ succeeded │
//!   └─────────────┘          └─────────┘     │      └───────────┘
//!                                            │      ┌───────────┐
//!                                            └─────►│  failed   │
//!                                                   └───────────┘
//! ```
//!
//! Completing a non-dry-run update commits its version: at most one update
//! per `(stack, version)` ever does, enforced by the store's primary key.
//!
//! # Configuration
//!
//! Configuration is loaded from environment variables:
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `STATEHOUSE_DATABASE_URL` | Yes | - | `postgres://` or `sqlite:` URL |
//! | `STATEHOUSE_MAX_CONNECTIONS` | No | `10` | Pool size |
//! | `STATEHOUSE_UPDATE_TOKEN_TTL_SECS` | No | `86400` | Update token lifetime |
//! | `STATEHOUSE_ROOT_KEY_NAME` | No | `auth-root` | Root key singleton name |

#![deny(missing_docs)]

/// Capabilities, token verification and the root signing key.
pub mod auth;

/// Deployment and resource reads.
pub mod checkpoints;

/// Configuration loaded from environment variables.
pub mod config;

/// Error types with stable error codes.
pub mod error;

/// Engine event log.
pub mod events;

/// Operation handlers: authorize, then dispatch to the services.
pub mod handlers;

/// Stack and update identifiers.
pub mod identifiers;

/// Embedded schema migrations.
pub mod migrations;

/// Records and response views.
pub mod model;

/// Record store traits and the PostgreSQL and SQLite backends.
pub mod persistence;

/// Wiring of store, crypter and authenticator.
pub mod runtime;

/// Secret encryption boundary.
pub mod secrets;

/// Stack management.
pub mod stacks;

/// Update lifecycle and history.
pub mod updates;

/// Registered users.
pub mod users;

pub use error::{CoreError, ErrorKind, Result};
pub use identifiers::{StackIdentifier, StackName, UpdateIdentifier, UpdateKind};
pub use persistence::{Persistence, PostgresPersistence, SqlitePersistence, StoreTransaction};
pub use runtime::{StatehouseRuntime, StatehouseRuntimeBuilder};
