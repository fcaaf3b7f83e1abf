//! Modifier queue (§4.8): persistent, client-originated mutations that are
//! applied optimistically to the local store and later drained to the
//! provider, with a version-conflict check standing in for a full CRDT.

pub mod drain;

use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use crate::cache::EmailListCache;
use crate::config::Clock;
use crate::error::CoreError;
use crate::models::{
    ConflictResolution, Folder, Modifier, ModifierStatus, ModifierType, RealtimeEvent,
    RealtimeEventType,
};
use crate::realtime::RealtimeEmitter;
use crate::store::MessageStore;

pub struct ModifierQueue {
    pool: PgPool,
    messages: MessageStore,
    cache: EmailListCache,
    realtime: std::sync::Arc<RealtimeEmitter>,
}

impl ModifierQueue {
    pub fn new(
        pool: PgPool,
        messages: MessageStore,
        cache: EmailListCache,
        realtime: std::sync::Arc<RealtimeEmitter>,
    ) -> Self {
        Self {
            pool,
            messages,
            cache,
            realtime,
        }
    }

    /// Persists the modifier, applies it optimistically to the local store
    /// and cache, and emits `email.updated` — all in the same handler, per
    /// §4.8.1.
    pub async fn enqueue(
        &self,
        user_id: Uuid,
        connection_id: Uuid,
        email_id: Uuid,
        modifier_type: ModifierType,
        params: Value,
        client_version: i64,
        clock: &dyn Clock,
    ) -> Result<Modifier, CoreError> {
        let id = Uuid::new_v4();
        let created_at = chrono::Utc::now();

        sqlx::query(
            r#"INSERT INTO modifiers (id, user_id, connection_id, email_id, modifier_type, params, client_version, status, retry_count, next_retry_at, created_at)
               VALUES ($1,$2,$3,$4,$5,$6,$7,'pending',0,NULL,$8)"#,
        )
        .bind(id)
        .bind(user_id)
        .bind(connection_id)
        .bind(email_id)
        .bind(modifier_type)
        .bind(&params)
        .bind(client_version)
        .bind(created_at)
        .execute(&self.pool)
        .await?;

        self.apply_optimistically(email_id, modifier_type, &params, clock).await?;
        self.patch_cache(user_id, email_id, modifier_type, &params).await;
        self.realtime.push(
            user_id,
            RealtimeEvent::new(
                RealtimeEventType::EmailUpdated,
                serde_json::json!({"email_id": email_id, "type": modifier_type}),
            ),
        );

        Ok(Modifier {
            id,
            user_id,
            connection_id,
            email_id,
            modifier_type,
            params,
            client_version,
            status: ModifierStatus::Pending,
            retry_count: 0,
            next_retry_at: None,
            created_at,
            applied_at: None,
            conflict_id: None,
        })
    }

    /// §4.6.2: patch the cached entry for the seven types that have a
    /// direct field-level counterpart rather than blow away the user's
    /// whole cache. AddLabel/RemoveLabel have no single cached field to
    /// patch (labels aren't part of the list cache's projection), so they
    /// fall back to a full invalidation.
    async fn patch_cache(&self, user_id: Uuid, email_id: Uuid, modifier_type: ModifierType, params: &Value) {
        let ids = [email_id];
        match modifier_type {
            ModifierType::MarkRead => self.cache.patch_read_status(&user_id, &ids, true).await,
            ModifierType::MarkUnread => self.cache.patch_read_status(&user_id, &ids, false).await,
            ModifierType::Star => self.cache.patch_star_status(&user_id, &ids, true).await,
            ModifierType::Unstar => self.cache.patch_star_status(&user_id, &ids, false).await,
            ModifierType::Archive => self.cache.patch_folder(&user_id, &ids, Folder::Archive).await,
            ModifierType::Trash => self.cache.patch_folder(&user_id, &ids, Folder::Trash).await,
            ModifierType::MoveToFolder => {
                if let Some(folder) = params.get("folder").and_then(|v| v.as_str()).and_then(parse_folder) {
                    self.cache.patch_folder(&user_id, &ids, folder).await;
                } else {
                    self.cache.invalidate_by_user(&user_id).await;
                }
            }
            ModifierType::AddLabel | ModifierType::RemoveLabel => {
                self.cache.invalidate_by_user(&user_id).await;
            }
        }
    }

    async fn apply_optimistically(
        &self,
        email_id: Uuid,
        modifier_type: ModifierType,
        params: &Value,
        clock: &dyn Clock,
    ) -> Result<(), CoreError> {
        let ids = [email_id];
        match modifier_type {
            ModifierType::MarkRead => self.messages.set_read(&ids, true, clock).await,
            ModifierType::MarkUnread => self.messages.set_read(&ids, false, clock).await,
            ModifierType::Star => self.messages.set_starred(&ids, true, clock).await,
            ModifierType::Unstar => self.messages.set_starred(&ids, false, clock).await,
            ModifierType::Archive => self.messages.set_folder(&ids, Folder::Archive, clock).await,
            ModifierType::Trash => self.messages.set_folder(&ids, Folder::Trash, clock).await,
            ModifierType::MoveToFolder => {
                if let Some(folder) = params.get("folder").and_then(|v| v.as_str()).and_then(parse_folder) {
                    self.messages.set_folder(&ids, folder, clock).await
                } else {
                    Ok(())
                }
            }
            ModifierType::AddLabel => {
                let labels = labels_from_params(params);
                self.messages.add_labels(&ids, &labels, clock).await
            }
            ModifierType::RemoveLabel => {
                let labels = labels_from_params(params);
                self.messages.remove_labels(&ids, &labels, clock).await
            }
        }
    }

    /// §4.8.3: resolve a conflict. `client_wins` requeues the modifier;
    /// `server_wins`/`merge` just close it out; `manual` takes the caller's
    /// value as final and writes it directly to the local store.
    pub async fn resolve_conflict(
        &self,
        conflict_id: Uuid,
        resolution: ConflictResolution,
        manual_value: Option<Value>,
        clock: &dyn Clock,
    ) -> Result<(), CoreError> {
        let row: (Uuid,) = sqlx::query_as("SELECT modifier_id FROM conflicts WHERE id = $1")
            .bind(conflict_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("conflict {conflict_id}")))?;
        let modifier_id = row.0;

        sqlx::query("UPDATE conflicts SET resolution = $1, resolved_at = now() WHERE id = $2")
            .bind(resolution)
            .bind(conflict_id)
            .execute(&self.pool)
            .await?;

        match resolution {
            ConflictResolution::ClientWins => {
                sqlx::query("UPDATE modifiers SET status = 'pending', conflict_id = NULL WHERE id = $1")
                    .bind(modifier_id)
                    .execute(&self.pool)
                    .await?;
            }
            ConflictResolution::ServerWins | ConflictResolution::Merge => {}
            ConflictResolution::Manual => {
                let modifier: Modifier = sqlx::query_as("SELECT * FROM modifiers WHERE id = $1")
                    .bind(modifier_id)
                    .fetch_one(&self.pool)
                    .await?;
                if let Some(value) = manual_value {
                    self.apply_optimistically(modifier.email_id, modifier.modifier_type, &value, clock)
                        .await?;
                }
            }
        }
        Ok(())
    }

    /// §4.8.4: reclaim applied modifiers older than the horizon.
    pub async fn garbage_collect(&self, horizon_days: i64) -> Result<u64, CoreError> {
        let result = sqlx::query(
            "DELETE FROM modifiers WHERE status = 'applied' AND applied_at < now() - ($1 || ' days')::interval",
        )
        .bind(horizon_days.to_string())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

fn labels_from_params(params: &Value) -> Vec<String> {
    params
        .get("labels")
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect()
        })
        .unwrap_or_default()
}

fn parse_folder(s: &str) -> Option<Folder> {
    match s {
        "inbox" => Some(Folder::Inbox),
        "sent" => Some(Folder::Sent),
        "drafts" => Some(Folder::Drafts),
        "trash" => Some(Folder::Trash),
        "spam" => Some(Folder::Spam),
        "archive" => Some(Folder::Archive),
        "custom" => Some(Folder::Custom),
        _ => None,
    }
}

/// Per-type mapping used by the drain loop to choose which provider
/// capability to call (§4.8.2 step 2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderDispatch {
    AddLabels,
    RemoveLabels,
    Trash,
    Archive,
    Restore,
}

pub fn dispatch_for(modifier_type: ModifierType, params: &Value) -> ProviderDispatch {
    match modifier_type {
        ModifierType::MarkRead => ProviderDispatch::RemoveLabels,
        ModifierType::MarkUnread => ProviderDispatch::AddLabels,
        ModifierType::Star => ProviderDispatch::AddLabels,
        ModifierType::Unstar => ProviderDispatch::RemoveLabels,
        ModifierType::AddLabel => ProviderDispatch::AddLabels,
        ModifierType::RemoveLabel => ProviderDispatch::RemoveLabels,
        ModifierType::Trash => ProviderDispatch::Trash,
        ModifierType::Archive => ProviderDispatch::Archive,
        ModifierType::MoveToFolder => match params.get("folder").and_then(|v| v.as_str()) {
            Some("trash") => ProviderDispatch::Trash,
            Some("archive") => ProviderDispatch::Archive,
            Some("inbox") => ProviderDispatch::Restore,
            _ => ProviderDispatch::AddLabels,
        },
    }
}

#[cfg(test)]
mod dispatch_tests {
    use super::*;

    #[test]
    fn star_and_unstar_map_to_opposite_label_directions() {
        assert_eq!(dispatch_for(ModifierType::Star, &Value::Null), ProviderDispatch::AddLabels);
        assert_eq!(dispatch_for(ModifierType::Unstar, &Value::Null), ProviderDispatch::RemoveLabels);
    }

    #[test]
    fn move_to_folder_dispatches_on_target_folder_param() {
        assert_eq!(
            dispatch_for(ModifierType::MoveToFolder, &serde_json::json!({"folder": "trash"})),
            ProviderDispatch::Trash
        );
        assert_eq!(
            dispatch_for(ModifierType::MoveToFolder, &serde_json::json!({"folder": "archive"})),
            ProviderDispatch::Archive
        );
        assert_eq!(
            dispatch_for(ModifierType::MoveToFolder, &serde_json::json!({"folder": "inbox"})),
            ProviderDispatch::Restore
        );
    }

    #[test]
    fn move_to_folder_defaults_to_add_labels_for_custom_folder() {
        assert_eq!(
            dispatch_for(ModifierType::MoveToFolder, &serde_json::json!({"folder": "projects"})),
            ProviderDispatch::AddLabels
        );
        assert_eq!(dispatch_for(ModifierType::MoveToFolder, &Value::Null), ProviderDispatch::AddLabels);
    }
}
