//! Hybrid read path (§4.7): DB-first list query, topped up from the
//! provider only when the local store is short, gated by the API
//! Protector so a burst of list requests never floods the provider.

use std::sync::Arc;

use uuid::Uuid;

use crate::cache::{CacheKey, CachedEmailList, EmailListCache};
use crate::error::CoreError;
use crate::jobbus::{self, JobBus, JobKind};
use crate::models::{EmailListResponse, Provider, ReadSource, SaveJobPayload, SyncJobPayload};
use crate::provider::token::TokenProvider;
use crate::provider::{ListMessagesRequest, ProviderAdapter};
use crate::query::{self, EmailFilter};
use crate::ratelimit::ApiProtector;
use crate::store::MessageStore;

const DEEP_OFFSET_THRESHOLD: i64 = 100;
const PROVIDER_ADMISSION_WAIT: std::time::Duration = std::time::Duration::from_secs(2);

pub struct HybridReadPath {
    messages: MessageStore,
    cache: EmailListCache,
    protector: Arc<ApiProtector>,
    jobs: Arc<dyn JobBus>,
    tokens: Arc<dyn TokenProvider>,
    max_payload_size: i64,
}

impl HybridReadPath {
    pub fn new(
        messages: MessageStore,
        cache: EmailListCache,
        protector: Arc<ApiProtector>,
        jobs: Arc<dyn JobBus>,
        tokens: Arc<dyn TokenProvider>,
        max_payload_size: i64,
    ) -> Self {
        Self {
            messages,
            cache,
            protector,
            jobs,
            tokens,
            max_payload_size,
        }
    }

    /// §4.7: cache check, DB query, conditional provider supplement,
    /// background fallback, cache store.
    pub async fn list(
        &self,
        user_id: Uuid,
        connection_id: Option<Uuid>,
        provider: Option<Provider>,
        adapter: Option<&dyn ProviderAdapter>,
        filter: &EmailFilter,
        limit: i64,
        offset: i64,
    ) -> Result<EmailListResponse, CoreError> {
        let limit = limit.min(self.max_payload_size).max(1);

        let cache_key = cache_key_for(&user_id, connection_id.as_ref(), filter, limit, offset);
        let cacheable = crate::cache::is_cacheable(offset);

        if cacheable {
            if let Some(key) = &cache_key {
                if let Some(hit) = self.cache.get(key).await {
                    return Ok(EmailListResponse {
                        emails: hit.emails,
                        total: hit.total,
                        has_more: offset + limit < hit.total,
                        sync_status: None,
                        source: ReadSource::Cache,
                    });
                }
            }
        }

        let (mut rows, total) = self.messages.list(user_id, connection_id, filter, limit, offset).await?;
        let mut has_more = offset + rows.len() as i64 < total;
        let mut source = ReadSource::Db;
        let mut sync_status = None;

        let short = (rows.len() as i64) < limit;
        let can_supplement = short
            && connection_id.is_some()
            && !filter.has_ai_only_fields()
            && offset < DEEP_OFFSET_THRESHOLD;

        if can_supplement {
            let connection_id = connection_id.unwrap();
            let key = format!("mail:list:{user_id}:{connection_id}");
            match self.protector.acquire_with_wait(&key, PROVIDER_ADMISSION_WAIT).await {
                Ok(_handle) => {
                    if let (Some(provider), Some(adapter)) = (provider, adapter) {
                        match self
                            .supplement_from_provider(user_id, connection_id, provider, adapter, filter, limit - rows.len() as i64)
                            .await
                        {
                            Ok(extra) => {
                                rows.extend(extra);
                                source = ReadSource::DbAndApi;
                                has_more = offset + rows.len() as i64 < total;
                            }
                            Err(e) => log::warn!("provider supplement failed for {connection_id}: {e}"),
                        }
                    }
                }
                Err(_rejection) => {
                    self.publish_sync_job(user_id, connection_id, provider).await;
                    sync_status = Some("syncing".to_string());
                    has_more = true;
                }
            }
        } else if short && offset >= DEEP_OFFSET_THRESHOLD {
            if let Some(connection_id) = connection_id {
                self.publish_sync_job(user_id, connection_id, provider).await;
            }
        }

        if cacheable && !rows.is_empty() {
            if let Some(key) = cache_key {
                self.cache
                    .put(
                        key,
                        CachedEmailList {
                            emails: rows.clone(),
                            total,
                        },
                    )
                    .await;
            }
        }

        Ok(EmailListResponse {
            emails: rows,
            total,
            has_more,
            sync_status,
            source,
        })
    }

    async fn supplement_from_provider(
        &self,
        user_id: Uuid,
        connection_id: Uuid,
        provider: Provider,
        adapter: &dyn ProviderAdapter,
        filter: &EmailFilter,
        want: i64,
    ) -> Result<Vec<crate::models::Message>, CoreError> {
        let token = self.tokens.get_token(connection_id).await?;
        let query = match provider {
            Provider::Gmail => query::translate_gmail(filter),
            Provider::Outlook => query::translate_outlook(filter).filter,
        };
        let response = adapter
            .list_messages(
                &token,
                ListMessagesRequest {
                    max_results: want.max(1) as u32,
                    page_token: None,
                    query: if query.is_empty() { None } else { Some(query) },
                },
            )
            .await?;

        let external_ids: Vec<String> = response.messages.iter().map(|m| m.external_id.clone()).collect();
        let existing = self.messages.existing_external_ids(connection_id, &external_ids).await?;

        let fresh: Vec<_> = response
            .messages
            .into_iter()
            .filter(|m| !existing.contains(&m.external_id))
            .collect();

        if !fresh.is_empty() {
            let payload = SaveJobPayload {
                connection_id,
                user_id,
                account_email: String::new(),
                provider,
                messages: fresh.iter().map(provider_message_to_summary).collect(),
            };
            if let Err(e) = jobbus::publish(self.jobs.as_ref(), JobKind::Save, &payload).await {
                log::warn!("failed to publish save job for {connection_id}: {e}");
            }
        }

        Ok(fresh.into_iter().map(|m| provider_message_to_ephemeral(user_id, connection_id, provider, m)).collect())
    }

    async fn publish_sync_job(&self, user_id: Uuid, connection_id: Uuid, provider: Option<Provider>) {
        let payload = SyncJobPayload {
            user_id,
            connection_id,
            provider: provider.unwrap_or(Provider::Gmail),
            full_sync: false,
            history_cursor: None,
        };
        if let Err(e) = jobbus::publish(self.jobs.as_ref(), JobKind::Sync, &payload).await {
            log::warn!("failed to publish background sync job for {connection_id}: {e}");
        }
    }
}

fn cache_key_for(
    user_id: &Uuid,
    connection_id: Option<&Uuid>,
    filter: &EmailFilter,
    limit: i64,
    offset: i64,
) -> Option<CacheKey> {
    Some(CacheKey::list(
        user_id,
        connection_id,
        filter.folder.as_deref(),
        filter.category.as_deref(),
        filter.workflow_status.as_deref(),
        limit,
        offset,
    ))
}

fn provider_message_to_summary(msg: &crate::provider::ProviderMessage) -> crate::models::ProviderMessageSummary {
    crate::models::ProviderMessageSummary {
        external_id: msg.external_id.clone(),
        thread_id: msg.thread_id.clone(),
        from_address: msg.from_address.clone(),
        to_addresses: msg.to_addresses.clone(),
        cc_addresses: msg.cc_addresses.clone(),
        subject: msg.subject.clone(),
        snippet: msg.snippet.clone(),
        folder: msg.folder,
        labels: msg.labels.clone(),
        is_read: msg.is_read,
        is_starred: msg.is_starred,
        has_attachment: msg.has_attachment,
        received_at: msg.received_at,
    }
}

/// An ephemeral, not-yet-persisted view of a freshly fetched provider
/// message for the immediate response — the durable row lands later when
/// the Save Job is consumed (§4.7 constraint: never block the handler on
/// writes).
fn provider_message_to_ephemeral(
    user_id: Uuid,
    connection_id: Uuid,
    provider: Provider,
    msg: crate::provider::ProviderMessage,
) -> crate::models::Message {
    crate::models::Message {
        id: Uuid::new_v4(),
        external_id: msg.external_id,
        thread_id: msg.thread_id,
        connection_id,
        user_id,
        provider,
        from_address: msg.from_address,
        to_addresses: msg.to_addresses,
        cc_addresses: msg.cc_addresses,
        bcc_addresses: Vec::new(),
        subject: msg.subject,
        snippet: msg.snippet,
        folder: msg.folder,
        labels: msg.labels,
        is_read: msg.is_read,
        is_starred: msg.is_starred,
        has_attachment: msg.has_attachment,
        received_at: msg.received_at,
        ai_status: None,
        ai_category: None,
        ai_priority: None,
        workflow_status: crate::models::WorkflowStatus::None,
        snoozed_until: None,
        version: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_key_includes_folder_and_pagination() {
        let user = Uuid::new_v4();
        let filter = EmailFilter {
            folder: Some("inbox".to_string()),
            ..Default::default()
        };
        let key = cache_key_for(&user, None, &filter, 20, 0).unwrap();
        assert!(key.as_str().contains("folder:inbox"));
        assert!(key.as_str().contains("limit:20:offset:0"));
    }
}
