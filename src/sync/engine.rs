//! Sync engine state machine (§4.3): `none → pending → syncing → idle →
//! (delta|gap) → idle`, with `error → retry_scheduled → pending` and
//! `* → full_resync → idle` escape paths. Each phase is a plain async
//! method so it can be driven directly in tests; [`spawn_background`] wraps
//! it in a named, cancellable task for production use.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::Clock;
use crate::coordination::SYNC_LOCK_TTL;
use crate::error::CoreError;
use crate::jobbus::{self, JobBus, JobKind};
use crate::models::{
    ClassifyJobPayload, IndexJobPayload, Provider, RealtimeEvent, RealtimeEventType, SyncPhase,
};
use crate::provider::token::TokenProvider;
use crate::provider::{AccessToken, DeltaChangeKind, ListMessagesRequest, ProviderAdapter, ProviderError};
use crate::realtime::RealtimeEmitter;
use crate::store::{BodyStore, MessageStore, SyncStateStore};

use super::merge::provider_message_to_fields;

const INITIAL_BATCH_SIZE: u32 = 50;
const DELTA_PAGE_SIZE: u32 = 100;

pub struct SyncEngine {
    pub messages: MessageStore,
    pub bodies: BodyStore,
    pub sync_states: SyncStateStore,
    pub realtime: Arc<RealtimeEmitter>,
    pub jobs: Arc<dyn JobBus>,
    pub tokens: Arc<dyn TokenProvider>,
}

impl SyncEngine {
    fn emit(&self, user_id: Uuid, event_type: RealtimeEventType, data: serde_json::Value) {
        self.realtime.push(user_id, RealtimeEvent::new(event_type, data));
    }

    /// §4.3.1: progressive initial sync. Visible mail fast, completeness in
    /// the background, crash-safe resumption via the persisted checkpoint.
    pub async fn run_initial_sync(
        &self,
        user_id: Uuid,
        connection_id: Uuid,
        provider: Provider,
        adapter: &dyn ProviderAdapter,
        clock: &dyn Clock,
    ) -> Result<(), CoreError> {
        self.sync_states.get_or_create(connection_id, provider).await?;
        self.sync_states.mark_syncing(connection_id).await?;
        self.emit(user_id, RealtimeEventType::SyncStarted, serde_json::json!({"connection_id": connection_id}));

        let token = self.tokens.get_token(connection_id).await?;

        let first_page = self
            .call_with_auth_retry(connection_id, adapter, &token, |token| {
                adapter.list_messages(
                    token,
                    ListMessagesRequest {
                        max_results: INITIAL_BATCH_SIZE,
                        page_token: None,
                        query: None,
                    },
                )
            })
            .await?;

        let mut synced = 0i64;
        for provider_message in first_page.messages {
            let external_id = provider_message.external_id.clone();
            let fields = provider_message_to_fields(provider_message);
            let saved = self
                .messages
                .upsert_from_provider(connection_id, user_id, provider, fields, clock)
                .await?;
            synced += 1;
            self.emit(
                user_id,
                RealtimeEventType::EmailNew,
                serde_json::json!({"email_id": saved.id, "external_id": external_id}),
            );
            self.fire_and_forget_followups(saved.id, connection_id).await;
        }
        self.emit(user_id, RealtimeEventType::SyncFirstBatch, serde_json::json!({"count": synced}));

        self.sync_states
            .checkpoint(connection_id, SyncPhase::InitialRemaining, first_page.next_page_token.clone(), synced)
            .await?;

        let mut page_token = first_page.next_page_token;
        while let Some(token_value) = page_token {
            let token = self.tokens.get_token(connection_id).await?;
            let page = self
                .call_with_auth_retry(connection_id, adapter, &token, |token| {
                    adapter.list_messages(
                        token,
                        ListMessagesRequest {
                            max_results: DELTA_PAGE_SIZE,
                            page_token: Some(token_value.clone()),
                            query: None,
                        },
                    )
                })
                .await?;

            for provider_message in page.messages {
                let fields = provider_message_to_fields(provider_message);
                let saved = self
                    .messages
                    .upsert_from_provider(connection_id, user_id, provider, fields, clock)
                    .await?;
                synced += 1;
                self.fire_and_forget_followups(saved.id, connection_id).await;
            }

            self.sync_states
                .checkpoint(connection_id, SyncPhase::InitialRemaining, page.next_page_token.clone(), synced)
                .await?;
            self.emit(user_id, RealtimeEventType::SyncProgress, serde_json::json!({"synced": synced}));

            page_token = page.next_page_token;
        }

        let token = self.tokens.get_token(connection_id).await?;
        let cursor = self
            .call_with_auth_retry(connection_id, adapter, &token, |token| adapter.delta(token, ""))
            .await
            .map(|d| d.new_cursor)
            .unwrap_or_default();

        self.sync_states.mark_idle(connection_id, Some(cursor), 0).await?;
        self.emit(user_id, RealtimeEventType::SyncCompleted, serde_json::json!({"synced": synced}));
        Ok(())
    }

    /// §4.3.2: delta sync from the stored history cursor. Falls back to
    /// full resync on `CursorExpired`.
    pub async fn run_delta_sync(
        &self,
        user_id: Uuid,
        connection_id: Uuid,
        provider: Provider,
        adapter: &dyn ProviderAdapter,
        clock: &dyn Clock,
    ) -> Result<(), CoreError> {
        let state = self
            .sync_states
            .get(connection_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("sync state for {connection_id}")))?;

        let cursor = match &state.history_cursor {
            Some(c) => c.clone(),
            None => return self.run_initial_sync(user_id, connection_id, provider, adapter, clock).await,
        };

        self.sync_states.mark_syncing(connection_id).await?;
        let token = self.tokens.get_token(connection_id).await?;

        let delta = match self
            .call_with_auth_retry(connection_id, adapter, &token, |token| adapter.delta(token, &cursor))
            .await
        {
            Ok(d) => d,
            Err(ProviderError::CursorExpired(_)) => {
                return self.run_full_resync(user_id, connection_id, provider, adapter, clock).await;
            }
            Err(e) => return Err(e.into()),
        };

        for change in delta.changes {
            match change.kind {
                DeltaChangeKind::Upsert => {
                    if let Some(partial) = change.partial_fields {
                        let fields = provider_message_to_fields(partial);
                        let saved = self
                            .messages
                            .upsert_from_provider(connection_id, user_id, provider, fields, clock)
                            .await?;
                        self.emit(
                            user_id,
                            RealtimeEventType::EmailUpdated,
                            serde_json::json!({"email_id": saved.id}),
                        );
                    }
                }
                DeltaChangeKind::Delete => {
                    if let Some(id) = self.messages.delete_by_external_id(connection_id, &change.external_id).await? {
                        self.bodies.delete(id).await?;
                        self.emit(user_id, RealtimeEventType::EmailDeleted, serde_json::json!({"email_id": id}));
                    }
                }
                DeltaChangeKind::LabelChange => {
                    if let Some(partial) = change.partial_fields {
                        self.messages
                            .apply_label_change(connection_id, &change.external_id, partial.labels, clock)
                            .await?;
                    }
                }
            }
        }

        self.sync_states.mark_idle(connection_id, Some(delta.new_cursor), 0).await?;
        Ok(())
    }

    /// §4.3.3: gap sync. Same algorithm as delta; the distinction is purely
    /// the trigger (client reconnection rather than webhook/poll).
    pub async fn run_gap_sync(
        &self,
        user_id: Uuid,
        connection_id: Uuid,
        provider: Provider,
        adapter: &dyn ProviderAdapter,
        clock: &dyn Clock,
    ) -> Result<(), CoreError> {
        self.run_delta_sync(user_id, connection_id, provider, adapter, clock).await
    }

    /// `* → full_resync → idle`: restarts the initial-sync flow but the
    /// merge step still preserves `ai_*`/workflow fields since it goes
    /// through the same upsert path.
    pub async fn run_full_resync(
        &self,
        user_id: Uuid,
        connection_id: Uuid,
        provider: Provider,
        adapter: &dyn ProviderAdapter,
        clock: &dyn Clock,
    ) -> Result<(), CoreError> {
        self.sync_states
            .checkpoint(connection_id, SyncPhase::FullResync, None, 0)
            .await?;
        self.run_initial_sync(user_id, connection_id, provider, adapter, clock).await
    }

    async fn fire_and_forget_followups(&self, email_id: Uuid, connection_id: Uuid) {
        let classify = ClassifyJobPayload { email_id, connection_id };
        if let Err(e) = jobbus::publish(self.jobs.as_ref(), JobKind::Classify, &classify).await {
            log::warn!("failed to publish classify job for {email_id}: {e}");
        }
        let index = IndexJobPayload { email_id };
        if let Err(e) = jobbus::publish(self.jobs.as_ref(), JobKind::Index, &index).await {
            log::warn!("failed to publish index job for {email_id}: {e}");
        }
    }

    /// Retries once after a single token refresh on `Auth` errors, per the
    /// auth-failure handling policy (§7).
    async fn call_with_auth_retry<'a, F, Fut, T>(
        &self,
        connection_id: Uuid,
        _adapter: &dyn ProviderAdapter,
        token: &'a AccessToken,
        call: F,
    ) -> Result<T, ProviderError>
    where
        F: Fn(&'a AccessToken) -> Fut,
        Fut: std::future::Future<Output = Result<T, ProviderError>>,
    {
        match call(token).await {
            Err(ProviderError::Auth(_)) => {
                let refreshed = self
                    .tokens
                    .refresh_token(connection_id)
                    .await
                    .map_err(|e| ProviderError::Auth(e.to_string()))?;
                call(&refreshed).await
            }
            other => other,
        }
    }

    /// Runs a sync phase as a named, cancellable background task. Wrapped in
    /// a `tokio::time::timeout` pinned to the coordination lock's TTL: if
    /// `run_kind` hasn't returned by then the lock has (or is about to have)
    /// expired regardless, so the task gives up rather than keep running
    /// unbounded against a connection a second caller may now also be
    /// syncing.
    pub fn spawn_background(
        self: Arc<Self>,
        user_id: Uuid,
        connection_id: Uuid,
        provider: Provider,
        http: reqwest::Client,
        clock: Arc<dyn Clock>,
        cancel: CancellationToken,
        kind: BackgroundSyncKind,
    ) {
        tokio::spawn(async move {
            let lock = match self.sync_states.acquire_sync_lock(connection_id).await {
                Ok(lock) => lock,
                Err(_) => {
                    log::debug!("sync already in progress for connection {connection_id}, skipping");
                    return;
                }
            };

            let adapter = crate::provider::for_provider(provider, http);
            let run = async {
                tokio::select! {
                    res = Self::run_kind(&self, user_id, connection_id, provider, adapter.as_ref(), clock.as_ref(), kind) => res,
                    _ = cancel.cancelled() => {
                        log::warn!("sync task for connection {connection_id} cancelled");
                        Ok(())
                    }
                }
            };
            let result = match tokio::time::timeout(SYNC_LOCK_TTL, run).await {
                Ok(res) => res,
                Err(_) => {
                    log::error!(
                        "sync task for connection {connection_id} exceeded lock TTL ({SYNC_LOCK_TTL:?}), aborting"
                    );
                    Err(CoreError::Internal(format!("sync timed out after {SYNC_LOCK_TTL:?}")))
                }
            };

            if let Err(e) = result {
                log::error!("sync failed for connection {connection_id}: {e}");
                match self.sync_states.schedule_retry(connection_id, &e.to_string()).await {
                    Ok(Some(next)) => log::info!("retry scheduled for {connection_id} at {next}"),
                    Ok(None) => {
                        self.emit(
                            user_id,
                            RealtimeEventType::SyncError,
                            serde_json::json!({"connection_id": connection_id, "error": "max retries exceeded"}),
                        );
                    }
                    Err(e) => log::error!("failed to schedule retry for {connection_id}: {e}"),
                }
            }

            lock.release().await;
        });
    }

    async fn run_kind(
        &self,
        user_id: Uuid,
        connection_id: Uuid,
        provider: Provider,
        adapter: &dyn ProviderAdapter,
        clock: &dyn Clock,
        kind: BackgroundSyncKind,
    ) -> Result<(), CoreError> {
        match kind {
            BackgroundSyncKind::Initial => self.run_initial_sync(user_id, connection_id, provider, adapter, clock).await,
            BackgroundSyncKind::Delta => self.run_delta_sync(user_id, connection_id, provider, adapter, clock).await,
            BackgroundSyncKind::Gap => self.run_gap_sync(user_id, connection_id, provider, adapter, clock).await,
            BackgroundSyncKind::FullResync => self.run_full_resync(user_id, connection_id, provider, adapter, clock).await,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackgroundSyncKind {
    Initial,
    Delta,
    Gap,
    FullResync,
}

/// Picks the state-machine phase a sync trigger (API request, webhook,
/// queued Sync Job) should resume from: a forced full resync, otherwise
/// delta if a cursor is already checkpointed, otherwise gap (no cursor yet,
/// not a first-time connection) or initial (never synced before).
pub async fn resolve_background_kind(
    sync_states: &crate::store::SyncStateStore,
    connection_id: Uuid,
    force_full_resync: bool,
) -> Result<BackgroundSyncKind, CoreError> {
    if force_full_resync {
        return Ok(BackgroundSyncKind::FullResync);
    }
    Ok(match sync_states.get(connection_id).await? {
        Some(existing) if existing.phase == crate::models::SyncPhase::Delta && existing.history_cursor.is_some() => {
            BackgroundSyncKind::Delta
        }
        Some(_) => BackgroundSyncKind::Gap,
        None => BackgroundSyncKind::Initial,
    })
}
