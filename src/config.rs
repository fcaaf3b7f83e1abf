//! Process configuration, resolved once at startup from environment variables.

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub redis_url: String,
    pub mongodb_url: String,
    pub job_stream_prefix: String,
    pub api_protector_max_concurrent: usize,
    pub api_protector_rate: u32,
    pub api_protector_burst: u32,
    pub cache_l1_capacity: usize,
    pub cache_l1_ttl_secs: u64,
    pub cache_l2_ttl_secs: u64,
    pub modifier_gc_horizon_days: i64,
    pub max_payload_size: i64,
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL")
                .expect("DATABASE_URL must be set"),
            redis_url: env_string("REDIS_URL", "redis://127.0.0.1:6379"),
            mongodb_url: env_string("MONGODB_URL", "mongodb://127.0.0.1:27017"),
            job_stream_prefix: env_string("JOB_STREAM_PREFIX", "mailbridge"),
            api_protector_max_concurrent: env_parsed("API_PROTECTOR_MAX_CONCURRENT", 100),
            api_protector_rate: env_parsed("API_PROTECTOR_RATE", 10),
            api_protector_burst: env_parsed("API_PROTECTOR_BURST", 5),
            cache_l1_capacity: env_parsed("CACHE_L1_CAPACITY", 1000),
            cache_l1_ttl_secs: env_parsed("CACHE_L1_TTL_SECS", 120),
            cache_l2_ttl_secs: env_parsed("CACHE_L2_TTL_SECS", 60),
            modifier_gc_horizon_days: env_parsed("MODIFIER_GC_HORIZON_DAYS", 7),
            max_payload_size: env_parsed("MAX_PAYLOAD_SIZE", 100),
        }
    }
}

/// Injected time source so tests can control the monotonic `version` field
/// deterministically instead of relying on the wall clock.
pub trait Clock: Send + Sync {
    fn now_nanos(&self) -> i64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_nanos(&self) -> i64 {
        chrono::Utc::now()
            .timestamp_nanos_opt()
            .unwrap_or(i64::MAX)
    }
}
