//! Webhook receiver (§4.4): resolves the connection, dedups by fingerprint,
//! and either dispatches directly or queues a Sync Job — always returning
//! 2xx so providers don't multiply retries on top of our own backoff.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use sha2::{Digest, Sha256};
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::Clock;
use crate::coordination::CoordinationStore;
use crate::jobbus::{self, JobBus, JobKind};
use crate::models::{Provider, SyncJobPayload};

use super::engine::SyncEngine;

#[derive(Debug, Clone)]
pub struct GmailPushPayload {
    pub email_address: String,
    pub history_id: String,
}

#[derive(Debug, Clone)]
pub struct OutlookChangeNotification {
    pub subscription_id: String,
    pub resource_data_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CalendarPushHeaders {
    pub channel_id: String,
    pub resource_state: String,
}

#[derive(Default)]
pub struct WebhookMetrics {
    pub duplicates: AtomicU64,
    pub direct: AtomicU64,
    pub queued: AtomicU64,
}

pub struct WebhookReceiver {
    pool: PgPool,
    coordination: Arc<dyn CoordinationStore>,
    jobs: Arc<dyn JobBus>,
    sync_engine: Arc<SyncEngine>,
    http: reqwest::Client,
    clock: Arc<dyn Clock>,
    pub metrics: WebhookMetrics,
}

impl WebhookReceiver {
    pub fn new(
        pool: PgPool,
        coordination: Arc<dyn CoordinationStore>,
        jobs: Arc<dyn JobBus>,
        sync_engine: Arc<SyncEngine>,
        http: reqwest::Client,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            pool,
            coordination,
            jobs,
            sync_engine,
            http,
            clock,
            metrics: WebhookMetrics::default(),
        }
    }

    pub async fn handle_gmail_push(&self, payload: GmailPushPayload) {
        let Some((connection_id, user_id)) = self.resolve_by_account_email(&payload.email_address).await else {
            log::warn!("gmail push for unknown account {}", payload.email_address);
            return;
        };
        self.process_change(user_id, connection_id, Provider::Gmail, &payload.history_id).await;
    }

    pub async fn handle_outlook_notification(&self, notification: OutlookChangeNotification) {
        let Some((connection_id, user_id)) = self.resolve_by_watch_id(&notification.subscription_id).await else {
            log::warn!("outlook notification for unknown subscription {}", notification.subscription_id);
            return;
        };
        let fingerprint = notification
            .resource_data_id
            .map(|id| hex_sha256(&id))
            .unwrap_or_else(|| chrono::Utc::now().timestamp_nanos_opt().unwrap_or(0).to_string());
        self.process_change(user_id, connection_id, Provider::Outlook, &fingerprint).await;
    }

    pub async fn handle_calendar_push(&self, headers: CalendarPushHeaders) {
        let Some((connection_id, user_id)) = self.resolve_by_watch_id(&headers.channel_id).await else {
            log::warn!("calendar push for unknown channel {}", headers.channel_id);
            return;
        };
        let fingerprint = hex_sha256(&format!("{}:{}", headers.channel_id, headers.resource_state));
        self.process_change(user_id, connection_id, Provider::Gmail, &fingerprint).await;
    }

    async fn process_change(&self, user_id: Uuid, connection_id: Uuid, provider: Provider, fingerprint: &str) {
        let already_seen = crate::coordination::dedup_seen(
            self.coordination.as_ref(),
            provider.as_str(),
            &connection_id,
            fingerprint,
        )
        .await;
        if already_seen {
            self.metrics.duplicates.fetch_add(1, Ordering::Relaxed);
            log::info!("webhook dedup hit for connection {connection_id} fingerprint {fingerprint}");
            return;
        }

        match crate::coordination::acquire_lock(self.coordination.as_ref(), &connection_id).await {
            Some(lock) => {
                self.metrics.direct.fetch_add(1, Ordering::Relaxed);
                log::info!("webhook direct dispatch for connection {connection_id}");
                // Release the probe lock immediately: spawn_background acquires
                // its own lock (via SyncStateStore) around the actual run, and
                // that acquisition isn't reentrant against the one above.
                lock.release().await;

                if let Err(e) = self.sync_engine.sync_states.get_or_create(connection_id, provider).await {
                    log::error!("failed to ensure sync state for {connection_id}: {e}");
                    return;
                }
                let kind = match super::resolve_background_kind(&self.sync_engine.sync_states, connection_id, false).await {
                    Ok(kind) => kind,
                    Err(e) => {
                        log::error!("failed to resolve sync kind for {connection_id}: {e}");
                        return;
                    }
                };

                self.sync_engine.clone().spawn_background(
                    user_id,
                    connection_id,
                    provider,
                    self.http.clone(),
                    self.clock.clone(),
                    CancellationToken::new(),
                    kind,
                );
            }
            None => {
                self.metrics.queued.fetch_add(1, Ordering::Relaxed);
                log::info!("webhook queued sync job for connection {connection_id} (lock busy)");
                let payload = SyncJobPayload {
                    user_id,
                    connection_id,
                    provider,
                    full_sync: false,
                    history_cursor: None,
                };
                if let Err(e) = jobbus::publish(self.jobs.as_ref(), JobKind::Sync, &payload).await {
                    log::error!("failed to publish queued sync job: {e}");
                }
            }
        }
    }

    async fn resolve_by_account_email(&self, account_email: &str) -> Option<(Uuid, Uuid)> {
        sqlx::query_as::<_, (Uuid, Uuid)>(
            "SELECT id, user_id FROM connections WHERE account_email = $1",
        )
        .bind(account_email)
        .fetch_optional(&self.pool)
        .await
        .ok()
        .flatten()
    }

    async fn resolve_by_watch_id(&self, watch_id: &str) -> Option<(Uuid, Uuid)> {
        sqlx::query_as::<_, (Uuid, Uuid)>(
            "SELECT connection_id, (SELECT user_id FROM connections WHERE id = connection_id) FROM sync_states WHERE watch_id = $1",
        )
        .bind(watch_id)
        .fetch_optional(&self.pool)
        .await
        .ok()
        .flatten()
    }
}

fn hex_sha256(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_sha256_is_deterministic_and_hex_encoded() {
        let a = hex_sha256("resource-42");
        let b = hex_sha256("resource-42");
        assert_eq!(a, b);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn hex_sha256_differs_for_different_inputs() {
        assert_ne!(hex_sha256("a"), hex_sha256("b"));
    }
}
