//! L2 shared cache. Values are JSON-encoded rather than `bincode`: this tier
//! has no private wire format to protect and benefits from being
//! inspectable/patchable as text.

use async_trait::async_trait;
use dashmap::DashMap;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::time::{Duration, Instant};

use super::{CacheKey, CachedEmailList};

#[async_trait]
pub trait L2Cache: Send + Sync {
    async fn get(&self, key: &CacheKey) -> Option<CachedEmailList>;
    async fn put(&self, key: &CacheKey, value: &CachedEmailList);
    async fn remove_prefix(&self, prefix: &str);
    async fn patch_prefix(&self, prefix: &str, f: &(dyn Fn(&mut CachedEmailList) + Send + Sync));
}

pub struct RedisL2Cache {
    conn: ConnectionManager,
    ttl: Duration,
}

impl RedisL2Cache {
    pub async fn connect(redis_url: &str, ttl: Duration) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn, ttl })
    }
}

#[async_trait]
impl L2Cache for RedisL2Cache {
    async fn get(&self, key: &CacheKey) -> Option<CachedEmailList> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(key.as_str()).await.ok()?;
        raw.and_then(|s| serde_json::from_str(&s).ok())
    }

    async fn put(&self, key: &CacheKey, value: &CachedEmailList) {
        let mut conn = self.conn.clone();
        if let Ok(encoded) = serde_json::to_string(value) {
            let _: Result<(), redis::RedisError> = conn
                .set_ex(key.as_str(), encoded, self.ttl.as_secs())
                .await;
        }
    }

    async fn remove_prefix(&self, prefix: &str) {
        let mut conn = self.conn.clone();
        let pattern = format!("{prefix}*");
        if let Ok(keys) = conn.keys::<_, Vec<String>>(pattern).await {
            if !keys.is_empty() {
                let _: Result<(), redis::RedisError> = conn.del(keys).await;
            }
        }
    }

    async fn patch_prefix(&self, prefix: &str, f: &(dyn Fn(&mut CachedEmailList) + Send + Sync)) {
        let mut conn = self.conn.clone();
        let pattern = format!("{prefix}*");
        let keys: Vec<String> = conn.keys(pattern).await.unwrap_or_default();
        for key in keys {
            let raw: Option<String> = conn.get(&key).await.ok().flatten();
            if let Some(raw) = raw {
                if let Ok(mut decoded) = serde_json::from_str::<CachedEmailList>(&raw) {
                    f(&mut decoded);
                    if let Ok(encoded) = serde_json::to_string(&decoded) {
                        let ttl = conn.ttl::<_, i64>(&key).await.unwrap_or(60).max(1) as u64;
                        let _: Result<(), redis::RedisError> =
                            conn.set_ex(&key, encoded, ttl).await;
                    }
                }
            }
        }
    }
}

/// In-process stand-in for L2 used in unit tests that don't stand up Redis.
pub struct InMemoryL2Cache {
    entries: DashMap<String, (CachedEmailList, Instant)>,
    ttl: Duration,
}

impl InMemoryL2Cache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }
}

#[async_trait]
impl L2Cache for InMemoryL2Cache {
    async fn get(&self, key: &CacheKey) -> Option<CachedEmailList> {
        let entry = self.entries.get(key.as_str())?;
        if entry.1.elapsed() > self.ttl {
            drop(entry);
            self.entries.remove(key.as_str());
            return None;
        }
        Some(entry.0.clone())
    }

    async fn put(&self, key: &CacheKey, value: &CachedEmailList) {
        self.entries
            .insert(key.as_str().to_string(), (value.clone(), Instant::now()));
    }

    async fn remove_prefix(&self, prefix: &str) {
        self.entries.retain(|k, _| !k.starts_with(prefix));
    }

    async fn patch_prefix(&self, prefix: &str, f: &(dyn Fn(&mut CachedEmailList) + Send + Sync)) {
        for mut entry in self.entries.iter_mut() {
            if entry.key().starts_with(prefix) {
                f(&mut entry.value_mut().0);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_list() -> CachedEmailList {
        CachedEmailList {
            emails: vec![],
            total: 0,
        }
    }

    #[tokio::test]
    async fn expired_entry_is_evicted_on_get() {
        let cache = InMemoryL2Cache::new(Duration::from_millis(10));
        let key = CacheKey::inbox(&uuid::Uuid::new_v4(), None, 20, 0);
        cache.put(&key, &empty_list()).await;
        assert!(cache.get(&key).await.is_some());

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(cache.get(&key).await.is_none());
    }

    #[tokio::test]
    async fn remove_prefix_only_drops_matching_keys() {
        let cache = InMemoryL2Cache::new(Duration::from_secs(60));
        let user_a = uuid::Uuid::new_v4();
        let user_b = uuid::Uuid::new_v4();
        let key_a = CacheKey::inbox(&user_a, None, 20, 0);
        let key_b = CacheKey::inbox(&user_b, None, 20, 0);
        cache.put(&key_a, &empty_list()).await;
        cache.put(&key_b, &empty_list()).await;

        cache.remove_prefix(&super::super::key::user_prefix(&user_a)).await;

        assert!(cache.get(&key_a).await.is_none());
        assert!(cache.get(&key_b).await.is_some());
    }
}
