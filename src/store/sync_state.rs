//! Sync state persistence (`sync_states` / `calendar_sync_states` rows) plus
//! the lock/dedup surface the engine needs, delegated straight through to
//! `crate::coordination` rather than reimplemented here.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::coordination::{self, CoordinationStore, LockGuard};
use crate::error::CoreError;
use crate::models::{Provider, SyncPhase, SyncState, SyncStatus};

/// Exponential-ish retry schedule per the retry-policy invariant: 30s, 60s,
/// 5m, 15m, 30m, capped at 5 attempts before a connection is marked dead.
const RETRY_DELAYS_SECS: [i64; 5] = [30, 60, 300, 900, 1800];
const MAX_RETRY_ATTEMPTS: i32 = 5;

#[derive(Clone)]
pub struct SyncStateStore {
    pool: PgPool,
    coordination: Arc<dyn CoordinationStore>,
}

impl SyncStateStore {
    pub fn new(pool: PgPool, coordination: Arc<dyn CoordinationStore>) -> Self {
        Self { pool, coordination }
    }

    pub async fn get(&self, connection_id: Uuid) -> Result<Option<SyncState>, CoreError> {
        let row = sqlx::query_as::<_, SyncState>(
            "SELECT * FROM sync_states WHERE connection_id = $1",
        )
        .bind(connection_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn get_or_create(
        &self,
        connection_id: Uuid,
        provider: Provider,
    ) -> Result<SyncState, CoreError> {
        if let Some(existing) = self.get(connection_id).await? {
            return Ok(existing);
        }
        let fresh = SyncState::fresh(connection_id, provider);
        self.upsert(&fresh).await?;
        Ok(fresh)
    }

    pub async fn upsert(&self, state: &SyncState) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO sync_states (
                connection_id, provider, status, phase, history_cursor, watch_id,
                watch_expiry, checkpoint_page_token, checkpoint_synced_count,
                retry_count, next_retry_at, last_error, last_sync_at, avg_sync_duration_ms
            ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14)
            ON CONFLICT (connection_id) DO UPDATE SET
                status = EXCLUDED.status,
                phase = EXCLUDED.phase,
                history_cursor = EXCLUDED.history_cursor,
                watch_id = EXCLUDED.watch_id,
                watch_expiry = EXCLUDED.watch_expiry,
                checkpoint_page_token = EXCLUDED.checkpoint_page_token,
                checkpoint_synced_count = EXCLUDED.checkpoint_synced_count,
                retry_count = EXCLUDED.retry_count,
                next_retry_at = EXCLUDED.next_retry_at,
                last_error = EXCLUDED.last_error,
                last_sync_at = EXCLUDED.last_sync_at,
                avg_sync_duration_ms = EXCLUDED.avg_sync_duration_ms
            "#,
        )
        .bind(state.connection_id)
        .bind(state.provider)
        .bind(state.status)
        .bind(state.phase)
        .bind(&state.history_cursor)
        .bind(&state.watch_id)
        .bind(state.watch_expiry)
        .bind(&state.checkpoint_page_token)
        .bind(state.checkpoint_synced_count)
        .bind(state.retry_count)
        .bind(state.next_retry_at)
        .bind(&state.last_error)
        .bind(state.last_sync_at)
        .bind(state.avg_sync_duration_ms)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Record progress mid-batch so a crash mid-sync resumes from the last
    /// checkpoint instead of restarting from zero.
    pub async fn checkpoint(
        &self,
        connection_id: Uuid,
        phase: SyncPhase,
        page_token: Option<String>,
        synced_count: i64,
    ) -> Result<(), CoreError> {
        sqlx::query(
            "UPDATE sync_states SET phase = $1, checkpoint_page_token = $2, checkpoint_synced_count = $3 WHERE connection_id = $4",
        )
        .bind(phase)
        .bind(page_token)
        .bind(synced_count)
        .bind(connection_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn mark_syncing(&self, connection_id: Uuid) -> Result<(), CoreError> {
        sqlx::query("UPDATE sync_states SET status = $1 WHERE connection_id = $2")
            .bind(SyncStatus::Syncing)
            .bind(connection_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn mark_idle(
        &self,
        connection_id: Uuid,
        history_cursor: Option<String>,
        sync_duration_ms: i64,
    ) -> Result<(), CoreError> {
        sqlx::query(
            r#"UPDATE sync_states SET
                status = $1, phase = $2, history_cursor = $3, retry_count = 0,
                next_retry_at = NULL, last_error = NULL, last_sync_at = $4,
                avg_sync_duration_ms = COALESCE((avg_sync_duration_ms + $5) / 2, $5)
               WHERE connection_id = $6"#,
        )
        .bind(SyncStatus::Idle)
        .bind(SyncPhase::Delta)
        .bind(history_cursor)
        .bind(Utc::now())
        .bind(sync_duration_ms)
        .bind(connection_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Schedule the next retry per the fixed backoff ladder. Returns `None`
    /// once the attempt count exceeds the ceiling — caller should surface
    /// the connection as dead rather than scheduling another attempt.
    pub async fn schedule_retry(
        &self,
        connection_id: Uuid,
        error: &str,
    ) -> Result<Option<DateTime<Utc>>, CoreError> {
        let state = self
            .get(connection_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("sync state for {connection_id}")))?;

        let attempt = state.retry_count + 1;
        if attempt > MAX_RETRY_ATTEMPTS {
            sqlx::query(
                "UPDATE sync_states SET status = $1, retry_count = $2, last_error = $3 WHERE connection_id = $4",
            )
            .bind(SyncStatus::Error)
            .bind(attempt)
            .bind(error)
            .bind(connection_id)
            .execute(&self.pool)
            .await?;
            return Ok(None);
        }

        let delay_secs = RETRY_DELAYS_SECS[(attempt - 1).max(0) as usize % RETRY_DELAYS_SECS.len()];
        let next_retry_at = Utc::now() + chrono::Duration::seconds(delay_secs);

        sqlx::query(
            r#"UPDATE sync_states SET
                status = $1, retry_count = $2, next_retry_at = $3, last_error = $4
               WHERE connection_id = $5"#,
        )
        .bind(SyncStatus::RetryScheduled)
        .bind(attempt)
        .bind(next_retry_at)
        .bind(error)
        .bind(connection_id)
        .execute(&self.pool)
        .await?;

        Ok(Some(next_retry_at))
    }

    pub async fn due_for_retry(&self) -> Result<Vec<SyncState>, CoreError> {
        let rows = sqlx::query_as::<_, SyncState>(
            "SELECT * FROM sync_states WHERE status = $1 AND next_retry_at <= now()",
        )
        .bind(SyncStatus::RetryScheduled)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    // --- Coordination delegation ------------------------------------------

    pub async fn acquire_sync_lock(&self, connection_id: Uuid) -> Result<LockGuard<'_>, CoreError> {
        coordination::acquire_lock(self.coordination.as_ref(), &connection_id)
            .await
            .ok_or_else(|| CoreError::Coordination(format!("sync already in progress for {connection_id}")))
    }

    pub async fn dedup_webhook(&self, provider: &str, connection_id: &Uuid, fingerprint: &str) -> bool {
        coordination::dedup_seen(self.coordination.as_ref(), provider, connection_id, fingerprint).await
    }
}
