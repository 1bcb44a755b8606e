// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Inbound operation handlers.
//!
//! Every handler takes the caller's bearer token, verifies it, checks the
//! operation's capability with [`authorize`] and only then calls into the
//! service layer. Transport framing is left to the embedding application.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, instrument};

use crate::auth::{Authenticator, Claims, Operation, authorize};
use crate::error::Result;
use crate::identifiers::{StackIdentifier, UpdateIdentifier, UpdateKind};
use crate::model::{
    Checkpoint, EngineEvent, Resource, Stack, StackSummary, StackUpdate, UntypedDeployment,
    UpdateResults, UpdateStatus,
};
use crate::persistence::Persistence;
use crate::secrets::{self, Crypter};
use crate::updates::{UpdatePage, UpdateRequest};
use crate::{checkpoints, events, stacks, updates, users};

/// Shared state for all handlers.
pub struct HandlerState {
    /// Record store.
    pub persistence: Arc<dyn Persistence>,
    /// Secret encryption collaborator.
    pub crypter: Arc<dyn Crypter>,
    /// Token verifier and update-token issuer.
    pub authenticator: Arc<dyn Authenticator>,
    /// Lifetime of update tokens issued by StartUpdate.
    pub update_token_ttl: Duration,
}

impl HandlerState {
    /// Bundle the collaborators.
    pub fn new(
        persistence: Arc<dyn Persistence>,
        crypter: Arc<dyn Crypter>,
        authenticator: Arc<dyn Authenticator>,
        update_token_ttl: Duration,
    ) -> Self {
        Self {
            persistence,
            crypter,
            authenticator,
            update_token_ttl,
        }
    }

    async fn authorize(
        &self,
        token: &str,
        operation: Operation,
        target_update: Option<&str>,
    ) -> Result<Claims> {
        let claims = self.authenticator.verify(token).await?;
        authorize(operation, &claims, target_update)?;
        Ok(claims)
    }
}

impl std::fmt::Debug for HandlerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerState")
            .field("persistence", &"...")
            .field("crypter", &"...")
            .field("update_token_ttl", &self.update_token_ttl)
            .finish()
    }
}

/// Response of [`handle_start_update`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartUpdateResponse {
    /// Version allocated to the update.
    pub version: i64,
    /// Update token for progress reporting.
    pub token: String,
    /// Unix seconds after which the token is rejected.
    pub token_expiration: i64,
}

// ============================================================================
// Stacks
// ============================================================================

/// Handle CreateStack.
#[instrument(skip(state, token, stack, tags, config), fields(stack = %stack))]
pub async fn handle_create_stack(
    state: &HandlerState,
    token: &str,
    stack: &StackIdentifier,
    tags: BTreeMap<String, String>,
    config: Option<Value>,
) -> Result<Stack> {
    state.authorize(token, Operation::CreateStack, None).await?;
    stacks::create_stack(state.persistence.as_ref(), stack, tags, config).await
}

/// Handle GetStack.
#[instrument(skip(state, token, stack), fields(stack = %stack))]
pub async fn handle_get_stack(
    state: &HandlerState,
    token: &str,
    stack: &StackIdentifier,
) -> Result<Stack> {
    state.authorize(token, Operation::GetStack, None).await?;
    stacks::get_stack(state.persistence.as_ref(), stack).await
}

/// Handle DeleteStack.
#[instrument(skip(state, token, stack), fields(stack = %stack))]
pub async fn handle_delete_stack(
    state: &HandlerState,
    token: &str,
    stack: &StackIdentifier,
) -> Result<()> {
    state.authorize(token, Operation::DeleteStack, None).await?;
    stacks::delete_stack(state.persistence.as_ref(), stack).await
}

/// Handle ListStacks.
#[instrument(skip(state, token))]
pub async fn handle_list_stacks(
    state: &HandlerState,
    token: &str,
    owner: Option<&str>,
) -> Result<Vec<StackSummary>> {
    state.authorize(token, Operation::ListStacks, None).await?;
    stacks::list_stacks(state.persistence.as_ref(), owner).await
}

/// Handle GetStackDeployment.
#[instrument(skip(state, token, stack), fields(stack = %stack))]
pub async fn handle_get_stack_deployment(
    state: &HandlerState,
    token: &str,
    stack: &StackIdentifier,
) -> Result<UntypedDeployment> {
    state
        .authorize(token, Operation::GetStackDeployment, None)
        .await?;
    checkpoints::get_stack_deployment(state.persistence.as_ref(), stack).await
}

/// Handle ListStackResources for one update.
#[instrument(skip(state, token, id), fields(update = %id))]
pub async fn handle_list_stack_resources(
    state: &HandlerState,
    token: &str,
    id: &UpdateIdentifier,
) -> Result<Vec<Resource>> {
    state
        .authorize(token, Operation::ListStackResources, None)
        .await?;
    checkpoints::list_stack_resources(state.persistence.as_ref(), id).await
}

/// Handle ListStackResources for a version token.
#[instrument(skip(state, token, stack), fields(stack = %stack))]
pub async fn handle_list_stack_resources_at(
    state: &HandlerState,
    token: &str,
    stack: &StackIdentifier,
    version: &str,
) -> Result<Vec<Resource>> {
    state
        .authorize(token, Operation::ListStackResources, None)
        .await?;
    checkpoints::list_stack_resources_at(state.persistence.as_ref(), stack, version).await
}

// ============================================================================
// Update lifecycle
// ============================================================================

/// Handle CreateUpdate, attributing the update to the token's user.
#[instrument(skip(state, token, stack, request), fields(stack = %stack, kind = %kind))]
pub async fn handle_create_update(
    state: &HandlerState,
    token: &str,
    stack: &StackIdentifier,
    kind: UpdateKind,
    request: UpdateRequest,
) -> Result<UpdateIdentifier> {
    let claims = state.authorize(token, Operation::CreateUpdate, None).await?;
    let user = users::get_user(state.persistence.as_ref(), &claims.subject).await?;
    updates::create_update(
        state.persistence.as_ref(),
        stack,
        kind,
        request,
        &user.public_info(),
    )
    .await
}

/// Handle CreateImport, attributing the import to the token's user.
#[instrument(skip(state, token, stack, deployment), fields(stack = %stack))]
pub async fn handle_create_import(
    state: &HandlerState,
    token: &str,
    stack: &StackIdentifier,
    deployment: Checkpoint,
) -> Result<UpdateIdentifier> {
    let claims = state.authorize(token, Operation::CreateImport, None).await?;
    let user = users::get_user(state.persistence.as_ref(), &claims.subject).await?;
    updates::create_import(
        state.persistence.as_ref(),
        stack,
        deployment,
        &user.public_info(),
    )
    .await
}

/// Handle StartUpdate and issue the update token for the executor.
#[instrument(skip(state, token, id), fields(update = %id))]
pub async fn handle_start_update(
    state: &HandlerState,
    token: &str,
    id: &UpdateIdentifier,
) -> Result<StartUpdateResponse> {
    state.authorize(token, Operation::StartUpdate, None).await?;
    let version = updates::start_update(state.persistence.as_ref(), id).await?;

    let claims = Claims::update(id.update_id.clone(), state.update_token_ttl);
    let update_token = state.authenticator.issue(&claims)?;
    debug!(expires_at = claims.expires_at, "Update token issued");

    Ok(StartUpdateResponse {
        version,
        token: update_token,
        token_expiration: claims.expires_at,
    })
}

/// Handle CheckpointUpdate. Requires the update's own token.
#[instrument(skip(state, token, id, checkpoint), fields(update = %id))]
pub async fn handle_checkpoint_update(
    state: &HandlerState,
    token: &str,
    id: &UpdateIdentifier,
    checkpoint: Checkpoint,
) -> Result<()> {
    state
        .authorize(token, Operation::CheckpointUpdate, Some(&id.update_id))
        .await?;
    updates::checkpoint_update(state.persistence.as_ref(), id, checkpoint).await
}

/// Handle CompleteUpdate. Requires the update's own token.
#[instrument(skip(state, token, id), fields(update = %id))]
pub async fn handle_complete_update(
    state: &HandlerState,
    token: &str,
    id: &UpdateIdentifier,
    status: UpdateStatus,
) -> Result<i64> {
    state
        .authorize(token, Operation::CompleteUpdate, Some(&id.update_id))
        .await?;
    updates::complete_update(state.persistence.as_ref(), id, status).await
}

/// Handle GetUpdateResults.
#[instrument(skip(state, token, id), fields(update = %id))]
pub async fn handle_get_update_results(
    state: &HandlerState,
    token: &str,
    id: &UpdateIdentifier,
) -> Result<UpdateResults> {
    state
        .authorize(token, Operation::GetUpdateResults, None)
        .await?;
    updates::get_update_results(state.persistence.as_ref(), id).await
}

/// Handle ListUpdates.
#[instrument(skip(state, token, stack), fields(stack = %stack))]
pub async fn handle_list_updates(
    state: &HandlerState,
    token: &str,
    stack: &StackIdentifier,
    page: UpdatePage,
) -> Result<Vec<StackUpdate>> {
    state.authorize(token, Operation::ListUpdates, None).await?;
    updates::list_updates(state.persistence.as_ref(), stack, page).await
}

/// Handle ListPreviews.
#[instrument(skip(state, token, stack), fields(stack = %stack))]
pub async fn handle_list_previews(
    state: &HandlerState,
    token: &str,
    stack: &StackIdentifier,
    version: &str,
) -> Result<Vec<StackUpdate>> {
    state.authorize(token, Operation::ListPreviews, None).await?;
    updates::list_previews(state.persistence.as_ref(), stack, version).await
}

/// Handle GetStackUpdate.
#[instrument(skip(state, token, stack), fields(stack = %stack))]
pub async fn handle_get_stack_update(
    state: &HandlerState,
    token: &str,
    stack: &StackIdentifier,
    version: &str,
) -> Result<StackUpdate> {
    state.authorize(token, Operation::GetStackUpdate, None).await?;
    updates::get_stack_update(state.persistence.as_ref(), stack, version).await
}

// ============================================================================
// Engine events
// ============================================================================

/// Handle AddEngineEvents. Requires the update's own token.
#[instrument(skip(state, token, id, batch), fields(update = %id, count = batch.len()))]
pub async fn handle_add_engine_events(
    state: &HandlerState,
    token: &str,
    id: &UpdateIdentifier,
    batch: &[EngineEvent],
) -> Result<()> {
    state
        .authorize(token, Operation::AddEngineEvents, Some(&id.update_id))
        .await?;
    events::add_engine_events(state.persistence.as_ref(), id, batch).await
}

/// Handle ListEngineEvents.
#[instrument(skip(state, token, id), fields(update = %id))]
pub async fn handle_list_engine_events(
    state: &HandlerState,
    token: &str,
    id: &UpdateIdentifier,
) -> Result<Vec<EngineEvent>> {
    state
        .authorize(token, Operation::ListEngineEvents, None)
        .await?;
    events::list_engine_events(state.persistence.as_ref(), id).await
}

// ============================================================================
// Secrets
// ============================================================================

/// Handle Encrypt.
#[instrument(skip_all)]
pub async fn handle_encrypt(state: &HandlerState, token: &str, plaintext: &[u8]) -> Result<Vec<u8>> {
    state.authorize(token, Operation::Encrypt, None).await?;
    secrets::encrypt(state.crypter.as_ref(), plaintext).await
}

/// Handle Decrypt.
#[instrument(skip_all)]
pub async fn handle_decrypt(state: &HandlerState, token: &str, ciphertext: &[u8]) -> Result<Vec<u8>> {
    state.authorize(token, Operation::Decrypt, None).await?;
    secrets::decrypt(state.crypter.as_ref(), ciphertext).await
}

/// Handle BatchDecrypt.
#[instrument(skip_all)]
pub async fn handle_batch_decrypt(
    state: &HandlerState,
    token: &str,
    ciphertexts: &[Vec<u8>],
) -> Result<HashMap<String, Vec<u8>>> {
    state.authorize(token, Operation::BatchDecrypt, None).await?;
    secrets::batch_decrypt(state.crypter.as_ref(), ciphertexts).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{HmacAuthenticator, TokenKind};
    use crate::error::{CoreError, ErrorKind};
    use crate::persistence::sqlite::memory_store;
    use crate::secrets::AesGcmCrypter;
    use crate::users::NewUser;

    const HOUR: Duration = Duration::from_secs(3600);

    async fn state() -> (HandlerState, String) {
        let persistence: Arc<dyn Persistence> = Arc::new(memory_store().await);
        let user = users::create_user(
            persistence.as_ref(),
            NewUser {
                github_login: "octocat".to_string(),
                name: "The Octocat".to_string(),
                email: "octo@example.com".to_string(),
                avatar_url: String::new(),
            },
        )
        .await
        .unwrap();

        let authenticator = Arc::new(HmacAuthenticator::new(&[1u8; 32]));
        let personal = authenticator
            .issue(&Claims::personal(user.id, HOUR))
            .unwrap();
        let state = HandlerState::new(
            persistence,
            Arc::new(AesGcmCrypter::new(&[2u8; 32]).unwrap()),
            authenticator,
            HOUR,
        );
        (state, personal)
    }

    fn prod() -> StackIdentifier {
        StackIdentifier::new("acme", "infra", "prod").unwrap()
    }

    #[tokio::test]
    async fn test_full_update_through_handlers() {
        let (state, personal) = state().await;

        handle_create_stack(&state, &personal, &prod(), BTreeMap::new(), None)
            .await
            .unwrap();
        let id = handle_create_update(
            &state,
            &personal,
            &prod(),
            UpdateKind::Update,
            UpdateRequest::default(),
        )
        .await
        .unwrap();

        let started = handle_start_update(&state, &personal, &id).await.unwrap();
        assert_eq!(started.version, 1);
        assert!(started.token_expiration > chrono::Utc::now().timestamp());

        let version =
            handle_complete_update(&state, &started.token, &id, UpdateStatus::Succeeded)
                .await
                .unwrap();
        assert_eq!(version, 1);

        let history = handle_get_stack_update(&state, &personal, &prod(), "latest")
            .await
            .unwrap();
        assert_eq!(history.requested_by.github_login, "octocat");
        assert_eq!(
            history.requested_by.email.as_deref(),
            Some("octo@example.com")
        );
    }

    /// Hands out opaque sequential tokens and remembers their claims.
    #[derive(Default)]
    struct TableAuthenticator {
        issued: std::sync::Mutex<HashMap<String, Claims>>,
    }

    #[async_trait::async_trait]
    impl Authenticator for TableAuthenticator {
        fn issue(&self, claims: &Claims) -> Result<String> {
            let mut issued = self.issued.lock().unwrap();
            let token = format!("token-{}", issued.len());
            issued.insert(token.clone(), claims.clone());
            Ok(token)
        }

        async fn verify(&self, token: &str) -> Result<Claims> {
            self.issued
                .lock()
                .unwrap()
                .get(token)
                .cloned()
                .ok_or_else(|| CoreError::Unauthorized {
                    reason: "unknown token".to_string(),
                })
        }
    }

    #[tokio::test]
    async fn test_handlers_use_configured_authenticator() {
        let persistence: Arc<dyn Persistence> = Arc::new(memory_store().await);
        let user = users::create_user(
            persistence.as_ref(),
            NewUser {
                github_login: "hubot".to_string(),
                name: "Hubot".to_string(),
                email: "hubot@example.com".to_string(),
                avatar_url: String::new(),
            },
        )
        .await
        .unwrap();

        let authenticator = Arc::new(TableAuthenticator::default());
        let personal = authenticator
            .issue(&Claims::personal(user.id, HOUR))
            .unwrap();
        assert_eq!(personal, "token-0");
        let state = HandlerState::new(
            persistence,
            Arc::new(AesGcmCrypter::new(&[2u8; 32]).unwrap()),
            authenticator.clone(),
            HOUR,
        );

        handle_create_stack(&state, &personal, &prod(), BTreeMap::new(), None)
            .await
            .unwrap();
        let id = handle_create_update(
            &state,
            &personal,
            &prod(),
            UpdateKind::Update,
            UpdateRequest::default(),
        )
        .await
        .unwrap();

        let started = handle_start_update(&state, &personal, &id).await.unwrap();
        assert_eq!(started.token, "token-1");
        let claims = authenticator.issued.lock().unwrap()["token-1"].clone();
        assert_eq!(claims.kind, TokenKind::Update);
        assert_eq!(claims.subject, id.update_id);

        let version =
            handle_complete_update(&state, &started.token, &id, UpdateStatus::Succeeded)
                .await
                .unwrap();
        assert_eq!(version, 1);

        // A token the authenticator never issued is rejected even if it is
        // well formed for the default signer.
        let signed = HmacAuthenticator::new(&[1u8; 32])
            .issue(&Claims::personal("someone", HOUR))
            .unwrap();
        let err = handle_list_stacks(&state, &signed, None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unauthorized);
    }

    #[tokio::test]
    async fn test_progress_requires_update_token() {
        let (state, personal) = state().await;
        handle_create_stack(&state, &personal, &prod(), BTreeMap::new(), None)
            .await
            .unwrap();
        let id = handle_create_update(
            &state,
            &personal,
            &prod(),
            UpdateKind::Update,
            UpdateRequest::default(),
        )
        .await
        .unwrap();

        let err = handle_complete_update(&state, &personal, &id, UpdateStatus::Succeeded)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unauthorized);

        let other = state
            .authenticator
            .issue(&Claims::update("some-other-update", HOUR))
            .unwrap();
        let err = handle_add_engine_events(&state, &other, &id, &[])
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Unauthorized { .. }));

        let err = handle_get_stack(&state, &other, &prod()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unauthorized);
    }

    #[tokio::test]
    async fn test_invalid_token_rejected() {
        let (state, _) = state().await;
        let err = handle_list_stacks(&state, "garbage", None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unauthorized);
    }

    #[tokio::test]
    async fn test_create_update_for_unknown_user() {
        let (state, personal) = state().await;
        handle_create_stack(&state, &personal, &prod(), BTreeMap::new(), None)
            .await
            .unwrap();

        let stranger = state
            .authenticator
            .issue(&Claims::personal("deleted-user", HOUR))
            .unwrap();
        let err = handle_create_update(
            &state,
            &stranger,
            &prod(),
            UpdateKind::Update,
            UpdateRequest::default(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, CoreError::UserNotFound { .. }));
    }

    #[tokio::test]
    async fn test_secret_handlers() {
        let (state, personal) = state().await;

        let ciphertext = handle_encrypt(&state, &personal, b"s3cr3t").await.unwrap();
        assert_eq!(
            handle_decrypt(&state, &personal, &ciphertext).await.unwrap(),
            b"s3cr3t"
        );

        let batch = handle_batch_decrypt(&state, &personal, &[ciphertext.clone()])
            .await
            .unwrap();
        assert_eq!(batch[&secrets::batch_key(&ciphertext)], b"s3cr3t");
    }
}
