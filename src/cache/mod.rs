//! Two-tier email-list cache (§4.6.2) with optimistic in-place patching.
//! L1 is a bounded in-process LRU (the `lru` crate's intrusive
//! doubly-linked-list + hashmap, per the design notes); L2 is a
//! Redis-shaped shared store holding the same JSON-encoded rows so patching
//! can decode, mutate, and re-encode without a private wire format.

pub mod key;
mod l1;
mod l2;

pub use key::CacheKey;

use std::sync::Arc;
use std::time::Duration;

use crate::models::{Folder, Message};

pub use l1::L1Cache;
pub use l2::{InMemoryL2Cache, L2Cache, RedisL2Cache};

/// Only `offset < 100` is cacheable; deeper pagination is always a miss.
pub const MAX_CACHEABLE_OFFSET: i64 = 100;

pub fn is_cacheable(offset: i64) -> bool {
    offset < MAX_CACHEABLE_OFFSET
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CachedEmailList {
    pub emails: Vec<Message>,
    pub total: i64,
}

#[derive(Clone)]
pub struct EmailListCache {
    l1: Arc<L1Cache>,
    l2: Arc<dyn L2Cache>,
}

impl EmailListCache {
    pub fn new(l1_capacity: usize, l1_ttl: Duration, l2: Arc<dyn L2Cache>) -> Self {
        Self {
            l1: Arc::new(L1Cache::new(l1_capacity, l1_ttl)),
            l2,
        }
    }

    pub async fn get(&self, key: &CacheKey) -> Option<CachedEmailList> {
        if let Some(hit) = self.l1.get(key) {
            return Some(hit);
        }
        if let Some(hit) = self.l2.get(key).await {
            self.l1.insert(key.clone(), hit.clone());
            return Some(hit);
        }
        None
    }

    pub async fn put(&self, key: CacheKey, value: CachedEmailList) {
        self.l2.put(&key, &value).await;
        self.l1.insert(key, value);
    }

    /// Rewrite `is_read` on every cached row matching `ids`, in both tiers.
    pub async fn patch_read_status(&self, user: &uuid::Uuid, ids: &[uuid::Uuid], is_read: bool) {
        self.patch_matching(user, |email| {
            if ids.contains(&email.id) {
                email.is_read = is_read;
            }
        })
        .await;
    }

    pub async fn patch_star_status(&self, user: &uuid::Uuid, ids: &[uuid::Uuid], is_starred: bool) {
        self.patch_matching(user, |email| {
            if ids.contains(&email.id) {
                email.is_starred = is_starred;
            }
        })
        .await;
    }

    pub async fn patch_folder(&self, user: &uuid::Uuid, ids: &[uuid::Uuid], folder: Folder) {
        self.patch_matching(user, |email| {
            if ids.contains(&email.id) {
                email.folder = folder;
            }
        })
        .await;
    }

    /// Filters `ids` out of every cached list for `user`. Used for
    /// delete/archive/trash.
    pub async fn remove_from_cache(&self, user: &uuid::Uuid, ids: &[uuid::Uuid]) {
        self.patch_lists(user, |list| {
            let before = list.emails.len();
            list.emails.retain(|e| !ids.contains(&e.id));
            let removed = before - list.emails.len();
            list.total = (list.total - removed as i64).max(0);
        })
        .await;
    }

    /// Fallback for changes with no direct cacheable projection (snooze,
    /// workflow status, labels): drop every entry for the user.
    pub async fn invalidate_by_user(&self, user: &uuid::Uuid) {
        let prefix = key::user_prefix(user);
        self.l1.remove_prefix(&prefix);
        self.l2.remove_prefix(&prefix).await;
    }

    async fn patch_matching(&self, user: &uuid::Uuid, f: impl Fn(&mut Message) + Send + Sync) {
        self.patch_lists(user, |list| {
            for email in &mut list.emails {
                f(email);
            }
        })
        .await;
    }

    async fn patch_lists(&self, user: &uuid::Uuid, f: impl Fn(&mut CachedEmailList) + Send + Sync) {
        let prefix = key::user_prefix(user);
        self.l1.patch_prefix(&prefix, &f);
        self.l2.patch_prefix(&prefix, &f).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::l2::InMemoryL2Cache;
    use crate::models::{Folder, Provider, WorkflowStatus};
    use chrono::Utc;
    use uuid::Uuid;

    fn sample_message(id: Uuid, is_read: bool) -> Message {
        Message {
            id,
            external_id: "ext".to_string(),
            thread_id: None,
            connection_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            provider: Provider::Gmail,
            from_address: "a@b.com".to_string(),
            to_addresses: vec![],
            cc_addresses: vec![],
            bcc_addresses: vec![],
            subject: "hi".to_string(),
            snippet: "".to_string(),
            folder: Folder::Inbox,
            labels: vec![],
            is_read,
            is_starred: false,
            has_attachment: false,
            received_at: Utc::now(),
            ai_status: None,
            ai_category: None,
            ai_priority: None,
            workflow_status: WorkflowStatus::None,
            snoozed_until: None,
            version: 1,
        }
    }

    // S5: after patch_read_status, every cached entry visible to the user
    // reflects the new is_read without a re-fetch (P6).
    #[tokio::test]
    async fn patch_read_status_updates_cached_entries_without_refetch() {
        let cache = EmailListCache::new(
            10,
            Duration::from_secs(120),
            Arc::new(InMemoryL2Cache::new(Duration::from_secs(60))),
        );
        let user = Uuid::new_v4();
        let id1 = Uuid::new_v4();
        let id2 = Uuid::new_v4();
        let key = CacheKey::inbox(&user, None, 20, 0);

        cache
            .put(
                key.clone(),
                CachedEmailList {
                    emails: vec![sample_message(id1, false), sample_message(id2, false)],
                    total: 2,
                },
            )
            .await;

        cache.patch_read_status(&user, &[id1], true).await;

        let patched = cache.get(&key).await.unwrap();
        let e1 = patched.emails.iter().find(|e| e.id == id1).unwrap();
        let e2 = patched.emails.iter().find(|e| e.id == id2).unwrap();
        assert!(e1.is_read);
        assert!(!e2.is_read);
    }

    #[tokio::test]
    async fn remove_from_cache_drops_matching_ids_and_total() {
        let cache = EmailListCache::new(
            10,
            Duration::from_secs(120),
            Arc::new(InMemoryL2Cache::new(Duration::from_secs(60))),
        );
        let user = Uuid::new_v4();
        let id1 = Uuid::new_v4();
        let id2 = Uuid::new_v4();
        let key = CacheKey::inbox(&user, None, 20, 0);
        cache
            .put(
                key.clone(),
                CachedEmailList {
                    emails: vec![sample_message(id1, false), sample_message(id2, false)],
                    total: 2,
                },
            )
            .await;

        cache.remove_from_cache(&user, &[id1]).await;

        let patched = cache.get(&key).await.unwrap();
        assert_eq!(patched.emails.len(), 1);
        assert_eq!(patched.total, 1);
        assert_eq!(patched.emails[0].id, id2);
    }

    #[test]
    fn offset_cacheability_rule() {
        assert!(is_cacheable(0));
        assert!(is_cacheable(99));
        assert!(!is_cacheable(100));
        assert!(!is_cacheable(500));
    }
}
