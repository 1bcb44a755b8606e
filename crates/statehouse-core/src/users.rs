// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Registered users. Updates copy the requester's public profile at creation.

use serde::{Deserialize, Serialize};
use tracing::{info, instrument};
use uuid::Uuid;

use crate::error::{CoreError, Result};
use crate::model::ServiceUser;
use crate::persistence::{Persistence, StoreTransaction};

/// Profile fields of a new user.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewUser {
    /// Unique login handle.
    pub github_login: String,
    /// Display name.
    pub name: String,
    /// Contact email, may be empty.
    #[serde(default)]
    pub email: String,
    /// Avatar URL.
    #[serde(default)]
    pub avatar_url: String,
}

/// Register a user. Fails with `UserAlreadyExists` on a taken login.
#[instrument(skip(store, user), fields(login = %user.github_login))]
pub async fn create_user(store: &dyn Persistence, user: NewUser) -> Result<ServiceUser> {
    if user.github_login.trim().is_empty() {
        return Err(CoreError::ValidationError {
            field: "githubLogin".to_string(),
            message: "login must not be empty".to_string(),
        });
    }

    let user = ServiceUser {
        id: Uuid::new_v4().to_string(),
        github_login: user.github_login,
        name: user.name,
        email: user.email,
        avatar_url: user.avatar_url,
    };

    let mut tx = store.begin().await?;
    tx.create_user(&user).await?;
    tx.commit().await?;

    info!(user_id = %user.id, "User created");
    Ok(user)
}

/// Read a user by id.
#[instrument(skip(store))]
pub async fn get_user(store: &dyn Persistence, user_id: &str) -> Result<ServiceUser> {
    let mut tx = store.begin().await?;
    get_user_in(tx.as_mut(), user_id).await
}

/// [`get_user`] inside an open transaction.
pub async fn get_user_in(tx: &mut dyn StoreTransaction, user_id: &str) -> Result<ServiceUser> {
    tx.get_user(user_id)
        .await?
        .ok_or_else(|| CoreError::UserNotFound {
            user_id: user_id.to_string(),
        })
}
