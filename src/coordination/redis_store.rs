//! Redis-backed coordination store. The sliding-window primitive is a real
//! Lua script run via `redis::Script`, matching §9's "atomic Lua equivalent"
//! note — trim/count/insert happen in one round trip so no two callers can
//! race past the limit check.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::time::Duration;

use super::CoordinationStore;

const SORTED_SET_SCRIPT: &str = r#"
local key = KEYS[1]
local member = ARGV[1]
local now = tonumber(ARGV[2])
local window = tonumber(ARGV[3])
local limit = tonumber(ARGV[4])

redis.call('ZREMRANGEBYSCORE', key, '-inf', now - window)
local count = redis.call('ZCARD', key)
local admitted = 0
if count < limit then
  redis.call('ZADD', key, now, member)
  redis.call('PEXPIRE', key, window)
  admitted = 1
  count = count + 1
end
local oldest = redis.call('ZRANGE', key, 0, 0, 'WITHSCORES')
local oldest_score = nil
if #oldest > 0 then
  oldest_score = oldest[2]
end
return {admitted, count, oldest_score}
"#;

pub struct RedisCoordinationStore {
    conn: ConnectionManager,
    script: redis::Script,
}

impl RedisCoordinationStore {
    pub async fn connect(redis_url: &str) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self {
            conn,
            script: redis::Script::new(SORTED_SET_SCRIPT),
        })
    }
}

#[async_trait]
impl CoordinationStore for RedisCoordinationStore {
    async fn set_if_absent_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> bool {
        let mut conn = self.conn.clone();
        let result: Result<Option<String>, redis::RedisError> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await;
        match result {
            Ok(Some(_)) => true,
            Ok(None) => false,
            Err(e) => {
                log::warn!("coordination store set_if_absent_with_ttl failed: {e}");
                false
            }
        }
    }

    async fn delete(&self, key: &str) {
        let mut conn = self.conn.clone();
        let _: Result<(), redis::RedisError> = conn.del(key).await;
    }

    async fn sorted_set_trim_and_count_and_insert(
        &self,
        key: &str,
        member: &str,
        now_millis: i64,
        window_millis: i64,
        limit: u32,
    ) -> (bool, u32, Option<i64>) {
        let mut conn = self.conn.clone();
        let result: Result<(i64, u32, Option<i64>), redis::RedisError> = self
            .script
            .key(key)
            .arg(member)
            .arg(now_millis)
            .arg(window_millis)
            .arg(limit)
            .invoke_async(&mut conn)
            .await;
        match result {
            Ok((admitted, count, oldest)) => (admitted == 1, count, oldest),
            Err(e) => {
                log::warn!("sliding window script failed, rejecting: {e}");
                (false, limit, None)
            }
        }
    }
}
