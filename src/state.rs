//! Bundles every managed service into one `AppState`, assembled once at
//! boot by a single `AdHoc::try_on_ignite` fairing. Route handlers pull it
//! from Rocket state rather than each service being injected individually —
//! the fan-out of collaborators here (stores, cache, job bus, engines) is
//! wide enough that one managed handle keeps the route signatures readable.

use std::sync::Arc;

use sqlx::PgPool;

use crate::auth::{StaticUserDirectory, UserDirectory};
use crate::cache::{EmailListCache, RedisL2Cache};
use crate::config::{AppConfig, Clock, SystemClock};
use crate::coordination::{CoordinationStore, LocalCoordinationStore, RedisCoordinationStore};
use crate::inline::InlineContentResolver;
use crate::jobbus::{JobBus, RedisJobBus};
use crate::modifier::{drain::ModifierDrain, ModifierQueue};
use crate::provider::token::{StaticTokenProvider, TokenProvider};
use crate::ratelimit::ApiProtector;
use crate::readpath::HybridReadPath;
use crate::realtime::RealtimeEmitter;
use crate::store::{BodyStore, MessageStore, SyncStateStore};
use crate::sync::{SyncEngine, WebhookReceiver};

pub struct AppState {
    pub pool: PgPool,
    pub messages: MessageStore,
    pub bodies: BodyStore,
    pub sync_states: SyncStateStore,
    pub cache: EmailListCache,
    pub protector: Arc<ApiProtector>,
    pub jobs: Arc<dyn JobBus>,
    pub realtime: Arc<RealtimeEmitter>,
    pub tokens: Arc<dyn TokenProvider>,
    pub users: Arc<dyn UserDirectory>,
    pub modifier_queue: ModifierQueue,
    pub modifier_drain: ModifierDrain,
    pub sync_engine: Arc<SyncEngine>,
    pub webhook: WebhookReceiver,
    pub readpath: HybridReadPath,
    pub inline: InlineContentResolver,
    pub http: reqwest::Client,
    pub clock: Arc<dyn Clock>,
    pub config: AppConfig,
}

impl AppState {
    pub async fn build(pool: PgPool, config: AppConfig) -> Self {
        let coordination: Arc<dyn CoordinationStore> = match RedisCoordinationStore::connect(&config.redis_url).await {
            Ok(store) => Arc::new(store),
            Err(e) => {
                log::warn!("redis coordination store unavailable ({e}), degrading to in-process locks/dedup");
                Arc::new(LocalCoordinationStore::new())
            }
        };

        let messages = MessageStore::new(pool.clone());
        let bodies = BodyStore::connect(&config.mongodb_url)
            .await
            .expect("body store (MongoDB) connection failed");
        let sync_states = SyncStateStore::new(pool.clone(), coordination.clone());

        let l2: Arc<dyn crate::cache::L2Cache> = match RedisL2Cache::connect(
            &config.redis_url,
            std::time::Duration::from_secs(config.cache_l2_ttl_secs),
        )
        .await
        {
            Ok(l2) => Arc::new(l2),
            Err(e) => {
                log::warn!("redis L2 cache unavailable ({e}), falling back to in-memory L2");
                Arc::new(crate::cache::InMemoryL2Cache::new(std::time::Duration::from_secs(
                    config.cache_l2_ttl_secs,
                )))
            }
        };
        let cache = EmailListCache::new(
            config.cache_l1_capacity,
            std::time::Duration::from_secs(config.cache_l1_ttl_secs),
            l2,
        );

        let protector = Arc::new(ApiProtector::new(
            coordination.clone(),
            config.api_protector_max_concurrent,
            config.api_protector_rate,
            config.api_protector_burst,
        ));

        let jobs: Arc<dyn JobBus> = match RedisJobBus::connect(&config.redis_url, config.job_stream_prefix.clone()).await {
            Ok(bus) => {
                for kind in [
                    crate::jobbus::JobKind::Sync,
                    crate::jobbus::JobKind::Save,
                    crate::jobbus::JobKind::Modify,
                    crate::jobbus::JobKind::Classify,
                    crate::jobbus::JobKind::Index,
                ] {
                    if let Err(e) = bus.ensure_group(kind).await {
                        log::warn!("failed to ensure consumer group for {kind:?}: {e}");
                    }
                }
                Arc::new(bus)
            }
            Err(e) => {
                log::warn!("redis job bus unavailable ({e}), falling back to in-process queue");
                Arc::new(crate::jobbus::local::LocalJobBus::default())
            }
        };

        let realtime = Arc::new(RealtimeEmitter::new());
        let tokens: Arc<dyn TokenProvider> = Arc::new(StaticTokenProvider::new());
        let users: Arc<dyn UserDirectory> = Arc::new(StaticUserDirectory::new());
        let http = reqwest::Client::new();
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);

        let modifier_queue = ModifierQueue::new(pool.clone(), messages.clone(), cache.clone(), realtime.clone());
        let modifier_drain = ModifierDrain::new(pool.clone(), messages.clone(), tokens.clone());

        let sync_engine = Arc::new(SyncEngine {
            messages: messages.clone(),
            bodies: bodies.clone(),
            sync_states: sync_states.clone(),
            realtime: realtime.clone(),
            jobs: jobs.clone(),
            tokens: tokens.clone(),
        });

        let webhook = WebhookReceiver::new(
            pool.clone(),
            coordination.clone(),
            jobs.clone(),
            sync_engine.clone(),
            http.clone(),
            clock.clone(),
        );

        let readpath = HybridReadPath::new(
            messages.clone(),
            cache.clone(),
            protector.clone(),
            jobs.clone(),
            tokens.clone(),
            config.max_payload_size,
        );

        let inline = InlineContentResolver::new(bodies.clone());

        Self {
            pool,
            messages,
            bodies,
            sync_states,
            cache,
            protector,
            jobs,
            realtime,
            tokens,
            users,
            modifier_queue,
            modifier_drain,
            sync_engine,
            webhook,
            readpath,
            inline,
            http,
            clock,
            config,
        }
    }
}
