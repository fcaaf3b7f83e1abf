//! Drain loop (§4.8.2): per connection, claims pending modifiers in FIFO
//! order per message, checks for version conflicts against the last
//! authoritative `EmailVersion`, dispatches to the provider, and records the
//! outcome. Claims via `FOR UPDATE SKIP LOCKED` so two drain workers never
//! double-apply the same modifier.

use std::sync::Arc;

use sqlx::PgPool;
use uuid::Uuid;

use crate::config::Clock;
use crate::error::CoreError;
use crate::models::{ConflictType, EmailVersion, Modifier, ModifierType};
use crate::provider::token::TokenProvider;
use crate::provider::{AccessToken, ProviderAdapter, ProviderError};
use crate::store::MessageStore;

use super::{dispatch_for, ProviderDispatch};

const RETRY_DELAYS_SECS: [i64; 5] = [30, 60, 300, 900, 1800];
const MAX_RETRY_ATTEMPTS: i32 = 5;

pub struct DrainOutcome {
    pub applied: u32,
    pub failed: u32,
    pub conflicted: u32,
}

pub struct ModifierDrain {
    pool: PgPool,
    messages: MessageStore,
    tokens: Arc<dyn TokenProvider>,
}

impl ModifierDrain {
    pub fn new(pool: PgPool, messages: MessageStore, tokens: Arc<dyn TokenProvider>) -> Self {
        Self {
            pool,
            messages,
            tokens,
        }
    }

    /// Drains one connection's pending modifiers, claimed transactionally
    /// and processed in `(email_id, created_at)` order — the resolved Open
    /// Question on per-message FIFO ordering.
    pub async fn drain_connection(
        &self,
        connection_id: Uuid,
        adapter: &dyn ProviderAdapter,
        clock: &dyn Clock,
    ) -> Result<DrainOutcome, CoreError> {
        let mut tx = self.pool.begin().await?;
        let claimed: Vec<Modifier> = sqlx::query_as(
            r#"SELECT * FROM modifiers
               WHERE connection_id = $1 AND status = 'pending'
                 AND (next_retry_at IS NULL OR next_retry_at <= now())
               ORDER BY email_id, created_at
               FOR UPDATE SKIP LOCKED"#,
        )
        .bind(connection_id)
        .fetch_all(&mut *tx)
        .await?;
        tx.commit().await?;

        let mut outcome = DrainOutcome {
            applied: 0,
            failed: 0,
            conflicted: 0,
        };

        for modifier in claimed {
            match self.process_one(&modifier, adapter, clock).await {
                Ok(ProcessResult::Applied) => outcome.applied += 1,
                Ok(ProcessResult::Conflicted) => outcome.conflicted += 1,
                Ok(ProcessResult::Failed) => outcome.failed += 1,
                Err(e) => {
                    log::warn!("modifier {} processing error: {e}", modifier.id);
                    outcome.failed += 1;
                }
            }
        }

        Ok(outcome)
    }

    async fn process_one(
        &self,
        modifier: &Modifier,
        adapter: &dyn ProviderAdapter,
        clock: &dyn Clock,
    ) -> Result<ProcessResult, CoreError> {
        let server_version: Option<EmailVersion> =
            sqlx::query_as("SELECT * FROM email_versions WHERE email_id = $1")
                .bind(modifier.email_id)
                .fetch_optional(&self.pool)
                .await?;

        if let Some(server) = &server_version {
            if server.version > modifier.client_version {
                let same_type = server.mod_type == modifier.modifier_type;
                let (conflict_type, resolution) = if same_type {
                    (ConflictType::VersionMismatch, "server_wins")
                } else {
                    (ConflictType::VersionMismatch, "merge")
                };

                let conflict_id = Uuid::new_v4();
                sqlx::query(
                    r#"INSERT INTO conflicts (id, modifier_id, conflict_type, client_state, server_state, resolution)
                       VALUES ($1,$2,$3,$4,$5,$6)"#,
                )
                .bind(conflict_id)
                .bind(modifier.id)
                .bind(conflict_type)
                .bind(&modifier.params)
                .bind(serde_json::json!({"mod_type": server.mod_type, "version": server.version}))
                .bind(resolution)
                .execute(&self.pool)
                .await?;

                if same_type {
                    sqlx::query("UPDATE modifiers SET status = 'conflict', conflict_id = $1 WHERE id = $2")
                        .bind(conflict_id)
                        .bind(modifier.id)
                        .execute(&self.pool)
                        .await?;
                    return Ok(ProcessResult::Conflicted);
                }
                // merge: semantically independent change, proceed to dispatch.
            }
        }

        let external_id: (String,) =
            sqlx::query_as("SELECT external_id FROM messages WHERE id = $1")
                .bind(modifier.email_id)
                .fetch_one(&self.pool)
                .await?;

        let token = self.tokens.get_token(modifier.connection_id).await?;
        let dispatch_result = self.dispatch(adapter, &token, modifier, &external_id.0).await;

        match dispatch_result {
            Ok(()) => {
                sqlx::query("UPDATE modifiers SET status = 'applied', applied_at = now() WHERE id = $1")
                    .bind(modifier.id)
                    .execute(&self.pool)
                    .await?;

                let version = clock.now_nanos();
                sqlx::query(
                    r#"INSERT INTO email_versions (email_id, version, mod_type, mod_source, mod_at)
                       VALUES ($1,$2,$3,'client',now())
                       ON CONFLICT (email_id) DO UPDATE SET version = $2, mod_type = $3, mod_source = 'client', mod_at = now()"#,
                )
                .bind(modifier.email_id)
                .bind(version)
                .bind(modifier.modifier_type)
                .execute(&self.pool)
                .await?;

                Ok(ProcessResult::Applied)
            }
            Err(err) => {
                let retry_count = modifier.retry_count + 1;
                if retry_count > MAX_RETRY_ATTEMPTS || !matches!(err, ProviderError::Transient(_) | ProviderError::RateLimited { .. }) {
                    sqlx::query("UPDATE modifiers SET status = 'failed', retry_count = $1 WHERE id = $2")
                        .bind(retry_count)
                        .bind(modifier.id)
                        .execute(&self.pool)
                        .await?;
                } else {
                    let delay = RETRY_DELAYS_SECS[(retry_count - 1).max(0) as usize % RETRY_DELAYS_SECS.len()];
                    let next_retry_at = chrono::Utc::now() + chrono::Duration::seconds(delay);
                    sqlx::query(
                        "UPDATE modifiers SET status = 'pending', retry_count = $1, next_retry_at = $2 WHERE id = $3",
                    )
                    .bind(retry_count)
                    .bind(next_retry_at)
                    .bind(modifier.id)
                    .execute(&self.pool)
                    .await?;
                }
                Ok(ProcessResult::Failed)
            }
        }
    }

    async fn dispatch(
        &self,
        adapter: &dyn ProviderAdapter,
        token: &AccessToken,
        modifier: &Modifier,
        external_id: &str,
    ) -> Result<(), ProviderError> {
        let ids = vec![external_id.to_string()];
        match dispatch_for(modifier.modifier_type, &modifier.params) {
            ProviderDispatch::AddLabels => {
                let labels = labels_for(modifier.modifier_type, &modifier.params);
                adapter.modify(token, &ids, &labels, &[]).await
            }
            ProviderDispatch::RemoveLabels => {
                let labels = labels_for(modifier.modifier_type, &modifier.params);
                adapter.modify(token, &ids, &[], &labels).await
            }
            ProviderDispatch::Trash => adapter.modify(token, &ids, &["TRASH".to_string()], &[]).await,
            ProviderDispatch::Archive => adapter.modify(token, &ids, &[], &["INBOX".to_string()]).await,
            ProviderDispatch::Restore => adapter.modify(token, &ids, &["INBOX".to_string()], &[]).await,
        }
    }

    /// Re-applies local state defensively after a successful provider
    /// dispatch, in case the optimistic apply diverged (§4.8.2 step 4).
    pub async fn reapply_locally(
        &self,
        modifier: &Modifier,
        clock: &dyn Clock,
    ) -> Result<(), CoreError> {
        let ids = [modifier.email_id];
        match modifier.modifier_type {
            ModifierType::MarkRead => self.messages.set_read(&ids, true, clock).await,
            ModifierType::MarkUnread => self.messages.set_read(&ids, false, clock).await,
            ModifierType::Star => self.messages.set_starred(&ids, true, clock).await,
            ModifierType::Unstar => self.messages.set_starred(&ids, false, clock).await,
            _ => Ok(()),
        }
    }
}

enum ProcessResult {
    Applied,
    Conflicted,
    Failed,
}

fn labels_for(modifier_type: ModifierType, params: &serde_json::Value) -> Vec<String> {
    match modifier_type {
        ModifierType::Star => vec!["STARRED".to_string()],
        ModifierType::Unstar => vec!["STARRED".to_string()],
        ModifierType::MarkRead | ModifierType::MarkUnread => vec!["UNREAD".to_string()],
        _ => params
            .get("labels")
            .and_then(|v| v.as_array())
            .map(|arr| arr.iter().filter_map(|v| v.as_str().map(String::from)).collect())
            .unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn star_and_read_state_map_to_fixed_gmail_labels() {
        assert_eq!(labels_for(ModifierType::Star, &serde_json::Value::Null), vec!["STARRED"]);
        assert_eq!(labels_for(ModifierType::Unstar, &serde_json::Value::Null), vec!["STARRED"]);
        assert_eq!(labels_for(ModifierType::MarkRead, &serde_json::Value::Null), vec!["UNREAD"]);
        assert_eq!(labels_for(ModifierType::MarkUnread, &serde_json::Value::Null), vec!["UNREAD"]);
    }

    #[test]
    fn add_label_reads_labels_array_from_params() {
        let params = serde_json::json!({"labels": ["Work", "Important"]});
        assert_eq!(
            labels_for(ModifierType::AddLabel, &params),
            vec!["Work".to_string(), "Important".to_string()]
        );
    }

    #[test]
    fn add_label_defaults_to_empty_when_labels_missing() {
        assert_eq!(labels_for(ModifierType::AddLabel, &serde_json::Value::Null), Vec::<String>::new());
    }
}
