//! L1 in-process cache: bounded LRU (the `lru` crate's intrusive
//! doubly-linked-list + hashmap for O(1) move-to-front/eviction) with
//! adaptive TTL and bulk eviction of 10% of entries from the tail when full.

use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use super::{CacheKey, CachedEmailList};

const ADAPTIVE_ACCESS_THRESHOLD: u32 = 3;
const MAX_TTL: Duration = Duration::from_secs(600);
const EVICTION_FRACTION: f64 = 0.1;

struct Entry {
    value: CachedEmailList,
    expires_at: Instant,
    ttl: Duration,
    access_count: u32,
}

pub struct L1Cache {
    inner: Mutex<LruCache<CacheKey, Entry>>,
    capacity: usize,
    base_ttl: Duration,
}

impl L1Cache {
    pub fn new(capacity: usize, base_ttl: Duration) -> Self {
        let cap = NonZeroUsize::new(capacity.max(1)).unwrap();
        Self {
            inner: Mutex::new(LruCache::new(cap)),
            capacity,
            base_ttl,
        }
    }

    pub fn get(&self, key: &CacheKey) -> Option<CachedEmailList> {
        let mut guard = self.inner.lock();
        let now = Instant::now();
        let expired = matches!(guard.peek(key), Some(entry) if entry.expires_at <= now);
        if expired {
            guard.pop(key);
            return None;
        }
        let entry = guard.get_mut(key)?;
        entry.access_count += 1;
        if entry.access_count >= ADAPTIVE_ACCESS_THRESHOLD {
            let boosted = entry.ttl.saturating_mul(2).min(MAX_TTL);
            entry.ttl = boosted;
            entry.expires_at = now + boosted;
        }
        Some(entry.value.clone())
    }

    pub fn insert(&self, key: CacheKey, value: CachedEmailList) {
        let mut guard = self.inner.lock();
        if guard.len() >= self.capacity && !guard.contains(&key) {
            let evict_count = ((self.capacity as f64 * EVICTION_FRACTION).ceil() as usize).max(1);
            for _ in 0..evict_count {
                if guard.pop_lru().is_none() {
                    break;
                }
            }
        }
        let now = Instant::now();
        guard.put(
            key,
            Entry {
                value,
                expires_at: now + self.base_ttl,
                ttl: self.base_ttl,
                access_count: 0,
            },
        );
    }

    pub fn remove_prefix(&self, prefix: &str) {
        let mut guard = self.inner.lock();
        let to_remove: Vec<CacheKey> = guard
            .iter()
            .filter(|(k, _)| k.as_str().starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect();
        for key in to_remove {
            guard.pop(&key);
        }
    }

    pub fn patch_prefix(&self, prefix: &str, f: &impl Fn(&mut CachedEmailList)) {
        let mut guard = self.inner.lock();
        let keys: Vec<CacheKey> = guard
            .iter()
            .filter(|(k, _)| k.as_str().starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect();
        for key in keys {
            if let Some(entry) = guard.peek_mut(&key) {
                f(&mut entry.value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn list() -> CachedEmailList {
        CachedEmailList {
            emails: vec![],
            total: 0,
        }
    }

    #[test]
    fn evicts_lru_entries_once_full() {
        let cache = L1Cache::new(10, Duration::from_secs(120));
        for i in 0..10 {
            cache.insert(CacheKey::inbox(&Uuid::new_v4(), None, 20, i), list());
        }
        // Inserting an 11th entry with a fresh key should trigger bulk
        // eviction of ~10% from the tail, not a hard failure.
        let extra_key = CacheKey::inbox(&Uuid::new_v4(), None, 20, 99);
        cache.insert(extra_key.clone(), list());
        assert!(cache.get(&extra_key).is_some());
    }

    #[test]
    fn access_count_boosts_ttl_past_threshold() {
        let cache = L1Cache::new(10, Duration::from_millis(50));
        let key = CacheKey::inbox(&Uuid::new_v4(), None, 20, 0);
        cache.insert(key.clone(), list());
        for _ in 0..3 {
            assert!(cache.get(&key).is_some());
        }
        // After crossing the threshold, ttl should have doubled at least
        // once — verified indirectly via the entry still being reachable
        // well past the original 50ms TTL.
        std::thread::sleep(Duration::from_millis(80));
        assert!(cache.get(&key).is_some());
    }

    #[test]
    fn expired_entries_are_treated_as_misses() {
        let cache = L1Cache::new(10, Duration::from_millis(10));
        let key = CacheKey::inbox(&Uuid::new_v4(), None, 20, 0);
        cache.insert(key.clone(), list());
        std::thread::sleep(Duration::from_millis(30));
        assert!(cache.get(&key).is_none());
    }
}
