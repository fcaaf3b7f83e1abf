//! In-process fallback coordination store, backed by `DashMap` for
//! independently-keyed concurrent access without a global lock. Used both
//! as the degrade-mode target when Redis is unavailable and directly in
//! tests.

use async_trait::async_trait;
use dashmap::DashMap;
use std::time::{Duration, Instant};

use super::CoordinationStore;

struct Entry {
    value: String,
    expires_at: Instant,
}

#[derive(Default)]
pub struct LocalCoordinationStore {
    entries: DashMap<String, Entry>,
    sorted_sets: DashMap<String, Vec<(i64, String)>>,
}

impl LocalCoordinationStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn sweep_expired(&self, key: &str) {
        if let Some(entry) = self.entries.get(key) {
            if entry.expires_at <= Instant::now() {
                drop(entry);
                self.entries.remove(key);
            }
        }
    }
}

#[async_trait]
impl CoordinationStore for LocalCoordinationStore {
    async fn set_if_absent_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> bool {
        self.sweep_expired(key);
        match self.entries.entry(key.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(Entry {
                    value: value.to_string(),
                    expires_at: Instant::now() + ttl,
                });
                true
            }
        }
    }

    async fn delete(&self, key: &str) {
        self.entries.remove(key);
    }

    async fn sorted_set_trim_and_count_and_insert(
        &self,
        key: &str,
        member: &str,
        now_millis: i64,
        window_millis: i64,
        limit: u32,
    ) -> (bool, u32, Option<i64>) {
        let mut set = self.sorted_sets.entry(key.to_string()).or_default();
        let cutoff = now_millis - window_millis;
        set.retain(|(score, _)| *score > cutoff);
        let count = set.len() as u32;
        if count < limit {
            set.push((now_millis, member.to_string()));
            set.sort_by_key(|(score, _)| *score);
            (true, count + 1, set.first().map(|(s, _)| *s))
        } else {
            (false, count, set.first().map(|(s, _)| *s))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_if_absent_then_occupied_rejects_second_caller() {
        let store = LocalCoordinationStore::new();
        assert!(store.set_if_absent_with_ttl("k", "1", Duration::from_secs(60)).await);
        assert!(!store.set_if_absent_with_ttl("k", "1", Duration::from_secs(60)).await);
    }

    #[tokio::test]
    async fn expired_entry_can_be_reacquired() {
        let store = LocalCoordinationStore::new();
        assert!(store.set_if_absent_with_ttl("k", "1", Duration::from_millis(10)).await);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(store.set_if_absent_with_ttl("k", "1", Duration::from_secs(60)).await);
    }

    #[tokio::test]
    async fn delete_releases_the_key_immediately() {
        let store = LocalCoordinationStore::new();
        store.set_if_absent_with_ttl("k", "1", Duration::from_secs(60)).await;
        store.delete("k").await;
        assert!(store.set_if_absent_with_ttl("k", "1", Duration::from_secs(60)).await);
    }

    #[tokio::test]
    async fn sliding_window_admits_up_to_limit_then_rejects() {
        let store = LocalCoordinationStore::new();
        let window = 1000;
        let (admitted1, count1, _) = store
            .sorted_set_trim_and_count_and_insert("rl:user", "req-1", 1_000, window, 2)
            .await;
        assert!(admitted1);
        assert_eq!(count1, 1);

        let (admitted2, count2, _) = store
            .sorted_set_trim_and_count_and_insert("rl:user", "req-2", 1_100, window, 2)
            .await;
        assert!(admitted2);
        assert_eq!(count2, 2);

        let (admitted3, count3, _) = store
            .sorted_set_trim_and_count_and_insert("rl:user", "req-3", 1_200, window, 2)
            .await;
        assert!(!admitted3);
        assert_eq!(count3, 2);
    }

    #[tokio::test]
    async fn sliding_window_trims_entries_older_than_window() {
        let store = LocalCoordinationStore::new();
        let window = 1000;
        store
            .sorted_set_trim_and_count_and_insert("rl:user", "req-1", 1_000, window, 1)
            .await;

        // Well past the window: the old entry should be trimmed, freeing the slot.
        let (admitted, count, _) = store
            .sorted_set_trim_and_count_and_insert("rl:user", "req-2", 5_000, window, 1)
            .await;
        assert!(admitted);
        assert_eq!(count, 1);
    }
}
