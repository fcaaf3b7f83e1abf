//! Job bus (§4.9): a durable, at-least-once queue built on Redis Streams —
//! one stream per job kind, one consumer group per kind, `XADD`/`XREADGROUP`/
//! `XACK` rather than a hand-rolled broker.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;

use crate::error::CoreError;

pub const CONSUMER_GROUP: &str = "mailbridge-workers";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobKind {
    Sync,
    Save,
    Modify,
    Classify,
    Index,
}

impl JobKind {
    pub fn stream_name(&self, prefix: &str) -> String {
        let suffix = match self {
            JobKind::Sync => "sync",
            JobKind::Save => "save",
            JobKind::Modify => "modify",
            JobKind::Classify => "classify",
            JobKind::Index => "index",
        };
        format!("{prefix}:jobs:{suffix}")
    }
}

/// A delivered job: the raw stream entry id (needed to `XACK`) and the
/// still-encoded payload.
pub struct Delivery {
    pub entry_id: String,
    pub payload: Value,
}

/// Object-safe core: payloads cross this boundary pre-serialized to JSON so
/// `Arc<dyn JobBus>` can be shared across the sync engine, modifier queue,
/// and webhook receiver without a generic method breaking dyn-compatibility.
#[async_trait]
pub trait JobBus: Send + Sync {
    async fn publish_value(&self, kind: JobKind, payload: Value) -> Result<(), CoreError>;

    async fn consume_values(
        &self,
        kind: JobKind,
        consumer_name: &str,
        max_count: usize,
    ) -> Result<Vec<Delivery>, CoreError>;

    async fn ack(&self, kind: JobKind, entry_id: &str) -> Result<(), CoreError>;
}

/// Typed convenience wrapper over the object-safe trait.
pub async fn publish<T: Serialize + Sync>(
    bus: &dyn JobBus,
    kind: JobKind,
    payload: &T,
) -> Result<(), CoreError> {
    let value = serde_json::to_value(payload)
        .map_err(|e| CoreError::Internal(format!("job payload encode failed: {e}")))?;
    bus.publish_value(kind, value).await
}

pub async fn consume<T: DeserializeOwned>(
    bus: &dyn JobBus,
    kind: JobKind,
    consumer_name: &str,
    max_count: usize,
) -> Result<Vec<(String, T)>, CoreError> {
    let deliveries = bus.consume_values(kind, consumer_name, max_count).await?;
    Ok(deliveries
        .into_iter()
        .filter_map(|d| serde_json::from_value::<T>(d.payload).ok().map(|p| (d.entry_id, p)))
        .collect())
}

pub struct RedisJobBus {
    conn: ConnectionManager,
    stream_prefix: String,
}

impl RedisJobBus {
    pub async fn connect(redis_url: &str, stream_prefix: String) -> Result<Self, CoreError> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn, stream_prefix })
    }

    /// Idempotent: `XGROUP CREATE ... MKSTREAM` errors (harmlessly) if the
    /// group already exists, which is the common case after the first boot.
    pub async fn ensure_group(&self, kind: JobKind) -> Result<(), CoreError> {
        let mut conn = self.conn.clone();
        let stream = kind.stream_name(&self.stream_prefix);
        let result: redis::RedisResult<()> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&stream)
            .arg(CONSUMER_GROUP)
            .arg("$")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.to_string().contains("BUSYGROUP") => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl JobBus for RedisJobBus {
    async fn publish_value(&self, kind: JobKind, payload: Value) -> Result<(), CoreError> {
        let mut conn = self.conn.clone();
        let stream = kind.stream_name(&self.stream_prefix);
        let encoded = payload.to_string();
        let _: String = conn.xadd(&stream, "*", &[("payload", encoded)]).await?;
        Ok(())
    }

    async fn consume_values(
        &self,
        kind: JobKind,
        consumer_name: &str,
        max_count: usize,
    ) -> Result<Vec<Delivery>, CoreError> {
        let mut conn = self.conn.clone();
        let stream = kind.stream_name(&self.stream_prefix);

        let reply: redis::streams::StreamReadReply = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(CONSUMER_GROUP)
            .arg(consumer_name)
            .arg("COUNT")
            .arg(max_count)
            .arg("BLOCK")
            .arg(1000)
            .arg("STREAMS")
            .arg(&stream)
            .arg(">")
            .query_async(&mut conn)
            .await?;

        let mut deliveries = Vec::new();
        for stream_key in reply.keys {
            for entry in stream_key.ids {
                if let Some(redis::Value::BulkString(raw)) = entry.map.get("payload") {
                    if let Ok(text) = String::from_utf8(raw.clone()) {
                        if let Ok(payload) = serde_json::from_str::<Value>(&text) {
                            deliveries.push(Delivery {
                                entry_id: entry.id.clone(),
                                payload,
                            });
                        }
                    }
                }
            }
        }
        Ok(deliveries)
    }

    async fn ack(&self, kind: JobKind, entry_id: &str) -> Result<(), CoreError> {
        let mut conn = self.conn.clone();
        let stream = kind.stream_name(&self.stream_prefix);
        let _: i64 = conn.xack(&stream, CONSUMER_GROUP, &[entry_id]).await?;
        Ok(())
    }
}

/// In-process stand-in for tests — a `Vec`-backed queue per kind, no
/// consumer-group redelivery semantics, good enough to exercise publish/
/// consume/ack call sites without standing up Redis.
pub mod local {
    use super::*;
    use dashmap::DashMap;
    use std::sync::atomic::{AtomicU64, Ordering};
    use tokio::sync::Mutex;

    pub struct LocalJobBus {
        queues: DashMap<&'static str, Mutex<Vec<(String, Value)>>>,
        next_id: AtomicU64,
    }

    impl Default for LocalJobBus {
        fn default() -> Self {
            Self {
                queues: DashMap::new(),
                next_id: AtomicU64::new(1),
            }
        }
    }

    fn kind_key(kind: JobKind) -> &'static str {
        match kind {
            JobKind::Sync => "sync",
            JobKind::Save => "save",
            JobKind::Modify => "modify",
            JobKind::Classify => "classify",
            JobKind::Index => "index",
        }
    }

    #[async_trait]
    impl JobBus for LocalJobBus {
        async fn publish_value(&self, kind: JobKind, payload: Value) -> Result<(), CoreError> {
            let id = self.next_id.fetch_add(1, Ordering::SeqCst).to_string();
            let entry = self
                .queues
                .entry(kind_key(kind))
                .or_insert_with(|| Mutex::new(Vec::new()));
            entry.lock().await.push((id, payload));
            Ok(())
        }

        async fn consume_values(
            &self,
            kind: JobKind,
            _consumer_name: &str,
            max_count: usize,
        ) -> Result<Vec<Delivery>, CoreError> {
            let entry = self
                .queues
                .entry(kind_key(kind))
                .or_insert_with(|| Mutex::new(Vec::new()));
            let mut guard = entry.lock().await;
            let take = max_count.min(guard.len());
            Ok(guard
                .drain(0..take)
                .map(|(entry_id, payload)| Delivery { entry_id, payload })
                .collect())
        }

        async fn ack(&self, _kind: JobKind, _entry_id: &str) -> Result<(), CoreError> {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::local::LocalJobBus;
    use super::*;
    use crate::models::ClassifyJobPayload;
    use uuid::Uuid;

    #[tokio::test]
    async fn publish_then_consume_round_trips_payload() {
        let bus = LocalJobBus::default();
        let payload = ClassifyJobPayload {
            email_id: Uuid::new_v4(),
            connection_id: Uuid::new_v4(),
        };
        publish(&bus, JobKind::Classify, &payload).await.unwrap();

        let delivered: Vec<(String, ClassifyJobPayload)> =
            consume(&bus, JobKind::Classify, "worker-1", 10).await.unwrap();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].1.email_id, payload.email_id);
        bus.ack(JobKind::Classify, &delivered[0].0).await.unwrap();
    }

    #[tokio::test]
    async fn consume_respects_max_count() {
        let bus = LocalJobBus::default();
        for _ in 0..5 {
            let payload = ClassifyJobPayload {
                email_id: Uuid::new_v4(),
                connection_id: Uuid::new_v4(),
            };
            publish(&bus, JobKind::Classify, &payload).await.unwrap();
        }
        let delivered: Vec<(String, ClassifyJobPayload)> =
            consume(&bus, JobKind::Classify, "worker-1", 2).await.unwrap();
        assert_eq!(delivered.len(), 2);
    }
}
