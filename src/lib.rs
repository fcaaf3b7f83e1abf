#[macro_use]
extern crate rocket;

pub mod auth;
pub mod cache;
pub mod config;
pub mod coordination;
pub mod db;
pub mod error;
pub mod inline;
pub mod jobbus;
pub mod models;
pub mod modifier;
pub mod provider;
pub mod query;
pub mod ratelimit;
pub mod readpath;
pub mod realtime;
pub mod request_logger;
pub mod routes;
pub mod state;
pub mod store;
pub mod sync;

use std::sync::{Arc, Once};
use std::time::Duration;

use env_logger::Env;
use rocket::fairing::AdHoc;
use rocket::http::Method;
use rocket::{Build, Rocket};
use rocket_cors::{AllowedOrigins, CorsOptions};
use rocket_db_pools::Database;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::auth::UserDirectory;
use crate::config::AppConfig;
use crate::db::MailDb;
use crate::request_logger::RequestLogger;
use crate::state::AppState;

static LOGGER: Once = Once::new();

fn init_logger() {
    LOGGER.call_once(|| {
        env_logger::Builder::from_env(
            Env::default().default_filter_or("info,rocket::server=warn,rocket::request=warn"),
        )
        .init();
    });
}

const MODIFIER_DRAIN_INTERVAL: Duration = Duration::from_secs(10);
const MODIFIER_GC_INTERVAL: Duration = Duration::from_secs(3600);
const JOB_POLL_IDLE_INTERVAL: Duration = Duration::from_millis(500);
const JOB_CONSUMER_BATCH_SIZE: usize = 16;
const SYNC_JOB_CONSUMER: &str = "sync-consumer";
const SAVE_JOB_CONSUMER: &str = "save-consumer";

async fn drain_loop(state: Arc<AppState>) {
    let mut ticker = tokio::time::interval(MODIFIER_DRAIN_INTERVAL);
    loop {
        ticker.tick().await;
        let pending: Vec<(Uuid, crate::models::Provider)> = match sqlx::query_as(
            r#"SELECT DISTINCT c.id, c.provider FROM connections c
               JOIN modifiers m ON m.connection_id = c.id
               WHERE m.status = 'pending' AND (m.next_retry_at IS NULL OR m.next_retry_at <= now())"#,
        )
        .fetch_all(&state.pool)
        .await
        {
            Ok(rows) => rows,
            Err(e) => {
                log::warn!("modifier drain loop: failed to list pending connections: {e}");
                continue;
            }
        };

        for (connection_id, provider) in pending {
            let adapter = provider::for_provider(provider, state.http.clone());
            match state
                .modifier_drain
                .drain_connection(connection_id, adapter.as_ref(), state.clock.as_ref())
                .await
            {
                Ok(outcome) => log::debug!(
                    "drained connection {connection_id}: {} applied, {} failed, {} conflicted",
                    outcome.applied,
                    outcome.failed,
                    outcome.conflicted
                ),
                Err(e) => log::warn!("modifier drain failed for connection {connection_id}: {e}"),
            }
        }
    }
}

async fn gc_loop(state: Arc<AppState>) {
    let mut ticker = tokio::time::interval(MODIFIER_GC_INTERVAL);
    loop {
        ticker.tick().await;
        match state.modifier_queue.garbage_collect(state.config.modifier_gc_horizon_days).await {
            Ok(n) if n > 0 => log::info!("modifier gc reclaimed {n} applied rows"),
            Ok(_) => {}
            Err(e) => log::warn!("modifier gc failed: {e}"),
        }
    }
}

/// Consumes published Sync Jobs (webhook fan-out when the connection's lock
/// was already held, and the read path's rate-limited/deep-offset triggers)
/// and actually runs them through `SyncEngine::spawn_background` — without
/// this loop those jobs sit acked-never in the stream.
async fn sync_job_consumer_loop(state: Arc<AppState>) {
    loop {
        let delivered: Vec<(String, crate::models::SyncJobPayload)> =
            match jobbus::consume(state.jobs.as_ref(), jobbus::JobKind::Sync, SYNC_JOB_CONSUMER, JOB_CONSUMER_BATCH_SIZE).await {
                Ok(jobs) => jobs,
                Err(e) => {
                    log::warn!("sync job consume failed: {e}");
                    tokio::time::sleep(JOB_POLL_IDLE_INTERVAL).await;
                    continue;
                }
            };

        if delivered.is_empty() {
            tokio::time::sleep(JOB_POLL_IDLE_INTERVAL).await;
            continue;
        }

        for (entry_id, payload) in delivered {
            if let Err(e) = state.sync_states.get_or_create(payload.connection_id, payload.provider).await {
                log::error!("sync job: failed to ensure sync state for {}: {e}", payload.connection_id);
                continue;
            }
            let kind = match sync::resolve_background_kind(&state.sync_states, payload.connection_id, payload.full_sync).await {
                Ok(kind) => kind,
                Err(e) => {
                    log::error!("sync job: failed to resolve sync kind for {}: {e}", payload.connection_id);
                    continue;
                }
            };
            state.sync_engine.clone().spawn_background(
                payload.user_id,
                payload.connection_id,
                payload.provider,
                state.http.clone(),
                state.clock.clone(),
                CancellationToken::new(),
                kind,
            );
            if let Err(e) = state.jobs.ack(jobbus::JobKind::Sync, &entry_id).await {
                log::warn!("sync job: failed to ack {entry_id}: {e}");
            }
        }
    }
}

/// Consumes published Save Jobs (the read path's provider-only supplement)
/// and persists each message via `MessageStore::upsert_from_provider` — the
/// durable row a fetched-but-not-yet-stored message is waiting on.
async fn save_job_consumer_loop(state: Arc<AppState>) {
    loop {
        let delivered: Vec<(String, crate::models::SaveJobPayload)> =
            match jobbus::consume(state.jobs.as_ref(), jobbus::JobKind::Save, SAVE_JOB_CONSUMER, JOB_CONSUMER_BATCH_SIZE).await {
                Ok(jobs) => jobs,
                Err(e) => {
                    log::warn!("save job consume failed: {e}");
                    tokio::time::sleep(JOB_POLL_IDLE_INTERVAL).await;
                    continue;
                }
            };

        if delivered.is_empty() {
            tokio::time::sleep(JOB_POLL_IDLE_INTERVAL).await;
            continue;
        }

        for (entry_id, payload) in delivered {
            for summary in &payload.messages {
                let fields = sync::merge::provider_summary_to_fields(summary);
                if let Err(e) = state
                    .messages
                    .upsert_from_provider(payload.connection_id, payload.user_id, payload.provider, fields, state.clock.as_ref())
                    .await
                {
                    log::warn!(
                        "save job: failed to persist message {} for connection {}: {e}",
                        summary.external_id,
                        payload.connection_id
                    );
                }
            }
            if let Err(e) = state.jobs.ack(jobbus::JobKind::Save, &entry_id).await {
                log::warn!("save job: failed to ack {entry_id}: {e}");
            }
        }
    }
}

pub fn rocket() -> Rocket<Build> {
    init_logger();

    let cors = CorsOptions::default()
        .allowed_origins(AllowedOrigins::all())
        .allowed_methods(
            vec![Method::Get, Method::Post, Method::Put, Method::Delete, Method::Patch]
                .into_iter()
                .map(From::from)
                .collect(),
        )
        .allow_credentials(true)
        .to_cors()
        .expect("error creating CORS fairing");

    rocket::build()
        .attach(RequestLogger)
        .attach(MailDb::init())
        .attach(cors)
        .attach(AdHoc::try_on_ignite("Run Migrations", |rocket| async move {
            match MailDb::fetch(&rocket) {
                Some(db) => {
                    let pool = (**db).clone();
                    match db::run_migrations(&pool).await {
                        Ok(_) => {
                            log::info!("database migrations successful");
                            Ok(rocket)
                        }
                        Err(e) => {
                            log::error!("database migrations failed: {e}");
                            Err(rocket)
                        }
                    }
                }
                None => {
                    log::error!("database pool not available for migrations");
                    Err(rocket)
                }
            }
        }))
        .attach(AdHoc::try_on_ignite("Build App State", |rocket| async move {
            match MailDb::fetch(&rocket) {
                Some(db) => {
                    let pool = (**db).clone();
                    let config = AppConfig::from_env();
                    let app_state = Arc::new(AppState::build(pool, config).await);
                    let users: Arc<dyn UserDirectory> = app_state.users.clone();
                    Ok(rocket.manage(app_state).manage(users))
                }
                None => {
                    log::error!("database pool not available for app state");
                    Err(rocket)
                }
            }
        }))
        .attach(AdHoc::on_liftoff("Spawn Modifier Drain", |rocket| {
            Box::pin(async move {
                if let Some(state) = rocket.state::<Arc<AppState>>() {
                    let state = state.clone();
                    tokio::spawn(drain_loop(state));
                } else {
                    log::warn!("app state unavailable; modifier drain loop not started");
                }
            })
        }))
        .attach(AdHoc::on_liftoff("Spawn Modifier GC", |rocket| {
            Box::pin(async move {
                if let Some(state) = rocket.state::<Arc<AppState>>() {
                    let state = state.clone();
                    tokio::spawn(gc_loop(state));
                } else {
                    log::warn!("app state unavailable; modifier GC loop not started");
                }
            })
        }))
        .attach(AdHoc::on_liftoff("Spawn Sync Job Consumer", |rocket| {
            Box::pin(async move {
                if let Some(state) = rocket.state::<Arc<AppState>>() {
                    let state = state.clone();
                    tokio::spawn(sync_job_consumer_loop(state));
                } else {
                    log::warn!("app state unavailable; sync job consumer not started");
                }
            })
        }))
        .attach(AdHoc::on_liftoff("Spawn Save Job Consumer", |rocket| {
            Box::pin(async move {
                if let Some(state) = rocket.state::<Arc<AppState>>() {
                    let state = state.clone();
                    tokio::spawn(save_job_consumer_loop(state));
                } else {
                    log::warn!("app state unavailable; save job consumer not started");
                }
            })
        }))
        .mount(
            "/api/v1",
            routes![
                routes::health::live_health,
                routes::health::ready_health,
                routes::email::list_email,
                routes::email::inbox,
                routes::email::inbox_todo,
                routes::email::by_category,
                routes::email::sent,
                routes::email::drafts,
                routes::email::trash_folder,
                routes::email::spam,
                routes::email::archive_folder,
                routes::email::search,
                routes::email::search_v2,
                routes::email::mark_read,
                routes::email::mark_unread,
                routes::email::star,
                routes::email::unstar,
                routes::email::archive,
                routes::email::trash,
                routes::email::delete,
                routes::email::move_folder,
                routes::email::snooze,
                routes::email::unsnooze,
                routes::email::workflow,
                routes::email::add_labels,
                routes::email::remove_labels,
                routes::sync::trigger_sync,
                routes::sync::resync,
                routes::sync::reclassify,
                routes::sync::resync_one,
                routes::events::stream,
            ],
        )
        .mount(
            "/webhooks",
            routes![
                routes::webhook::gmail,
                routes::webhook::outlook,
                routes::webhook::outlook_validate,
                routes::webhook::google_calendar,
                routes::webhook::outlook_calendar,
            ],
        )
}

#[cfg_attr(not(test), allow(dead_code))]
pub mod test_support {
    use rocket::config::LogLevel;
    use rocket::figment::Figment;
    use rocket::local::asynchronous::Client as AsyncClient;
    use rocket::local::blocking::Client;
    use rocket::{Build, Rocket, Route};
    use rocket_db_pools::sqlx::{self, PgPool};
    use uuid::Uuid;

    pub use database::{TestDatabase, TestDatabaseError};

    use crate::models::{Folder, Provider, WorkflowStatus};

    /// Seeds connections/messages for tests that exercise the hybrid read
    /// path, modifier queue, and sync engine against a real database.
    pub struct TestFixtures<'a> {
        pool: &'a PgPool,
    }

    impl<'a> TestFixtures<'a> {
        pub fn new(pool: &'a PgPool) -> Self {
            Self { pool }
        }

        pub async fn insert_connection(
            &self,
            user_id: Uuid,
            provider: Provider,
            account_email: &str,
            default_flag: bool,
        ) -> Result<Uuid, sqlx::Error> {
            sqlx::query_scalar(
                "INSERT INTO connections (id, user_id, provider, account_email, default_flag, created_at) VALUES (gen_random_uuid(), $1, $2, $3, $4, now()) RETURNING id",
            )
            .bind(user_id)
            .bind(provider)
            .bind(account_email)
            .bind(default_flag)
            .fetch_one(self.pool)
            .await
        }

        #[allow(clippy::too_many_arguments)]
        pub async fn insert_message(
            &self,
            connection_id: Uuid,
            user_id: Uuid,
            provider: Provider,
            external_id: &str,
            subject: &str,
            folder: Folder,
        ) -> Result<Uuid, sqlx::Error> {
            sqlx::query_scalar(
                r#"INSERT INTO messages
                   (id, external_id, thread_id, connection_id, user_id, provider, from_address,
                    to_addresses, cc_addresses, bcc_addresses, subject, snippet, folder, labels,
                    is_read, is_starred, has_attachment, received_at, workflow_status, version)
                   VALUES (gen_random_uuid(), $1, NULL, $2, $3, $4, 'sender@example.com',
                    '{}', '{}', '{}', $5, '', $6, '{}', false, false, false, now(), $7, 1)
                   RETURNING id"#,
            )
            .bind(external_id)
            .bind(connection_id)
            .bind(user_id)
            .bind(provider)
            .bind(subject)
            .bind(folder)
            .bind(WorkflowStatus::None)
            .fetch_one(self.pool)
            .await
        }
    }

    pub mod database {
        use log::LevelFilter;
        use rocket_db_pools::sqlx::postgres::{PgConnectOptions, PgPoolOptions};
        use rocket_db_pools::sqlx::{self, ConnectOptions, PgPool};
        use testcontainers::{core::WaitFor, GenericImage, ImageExt};
        use testcontainers_modules::testcontainers::{
            core::error::TestcontainersError, runners::AsyncRunner, ContainerAsync,
        };
        use thiserror::Error;
        use tokio::runtime::Handle;
        use uuid::Uuid;

        static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

        #[derive(Debug, Error)]
        pub enum TestDatabaseError {
            #[error("TEST_DATABASE_URL not set")]
            MissingUrl,
            #[error("database error: {0}")]
            Sqlx(#[from] sqlx::Error),
            #[error("migration error: {0}")]
            Migration(#[from] sqlx::migrate::MigrateError),
            #[error("container error: {0}")]
            Container(#[from] TestcontainersError),
        }

        /// Ephemeral database factory for integration tests.
        pub struct TestDatabase {
            pool: Option<PgPool>,
            admin_options: PgConnectOptions,
            database_name: String,
            container: Option<ContainerAsync<GenericImage>>,
        }

        impl TestDatabase {
            pub async fn new_from_env() -> Result<Self, TestDatabaseError> {
                Self::new().await
            }

            pub async fn new() -> Result<Self, TestDatabaseError> {
                let image = GenericImage::new("postgres", "16-alpine")
                    .with_wait_for(WaitFor::message_on_stdout("database system is ready to accept connections"))
                    .with_wait_for(WaitFor::message_on_stderr("database system is ready to accept connections"));

                let request = image
                    .with_env_var("POSTGRES_DB", "postgres")
                    .with_env_var("POSTGRES_USER", "postgres")
                    .with_env_var("POSTGRES_PASSWORD", "postgres");

                let container = request.start().await?;

                let host = container.get_host().await?.to_string();
                let port = container.get_host_port_ipv4(5432).await?;
                let admin_url = format!("postgres://postgres:postgres@{}:{}/postgres", host, port);

                let base_options: PgConnectOptions = admin_url.parse().map_err(TestDatabaseError::Sqlx)?;
                let base_options = base_options.log_statements(LevelFilter::Off);

                let base_name = base_options
                    .get_database()
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "postgres".to_string());

                let admin_options = base_options.clone().database("postgres");
                let admin_pool = PgPoolOptions::new()
                    .max_connections(1)
                    .connect_with(admin_options.clone())
                    .await
                    .map_err(TestDatabaseError::Sqlx)?;

                let new_db_name = format!("{}_{}", base_name, Uuid::new_v4().simple());
                let create_sql = format!("CREATE DATABASE \"{}\" TEMPLATE template0", new_db_name);
                sqlx::query(&create_sql).execute(&admin_pool).await.map_err(TestDatabaseError::Sqlx)?;

                let pool = PgPoolOptions::new()
                    .max_connections(5)
                    .connect_with(base_options.clone().database(&new_db_name))
                    .await
                    .map_err(TestDatabaseError::Sqlx)?;

                MIGRATOR.run(&pool).await?;

                Ok(Self {
                    pool: Some(pool),
                    admin_options,
                    database_name: new_db_name,
                    container: Some(container),
                })
            }

            pub fn pool(&self) -> &PgPool {
                self.pool.as_ref().expect("test database pool is available")
            }

            pub fn pool_clone(&self) -> PgPool {
                self.pool().clone()
            }

            pub async fn reset(&self) -> Result<(), TestDatabaseError> {
                MIGRATOR.run(self.pool()).await?;
                Ok(())
            }

            pub async fn close(mut self) -> Result<(), TestDatabaseError> {
                if let Some(pool) = self.pool.take() {
                    pool.close().await;
                }

                drop_database_with_fallback(self.admin_options.clone(), &self.database_name)
                    .await
                    .map_err(TestDatabaseError::Sqlx)?;

                if let Some(container) = self.container.take() {
                    drop(container);
                }

                Ok(())
            }
        }

        async fn drop_database_with_fallback(admin_options: PgConnectOptions, database_name: &str) -> Result<(), sqlx::Error> {
            let admin_pool = PgPoolOptions::new().max_connections(1).connect_with(admin_options).await?;

            let drop_force = format!("DROP DATABASE \"{}\" WITH (FORCE)", database_name);
            match sqlx::query(&drop_force).execute(&admin_pool).await {
                Ok(_) => Ok(()),
                Err(err) if force_drop_unsupported(&err) => {
                    let drop_sql = format!("DROP DATABASE \"{}\"", database_name);
                    sqlx::query(&drop_sql).execute(&admin_pool).await?;
                    Ok(())
                }
                Err(err) => Err(err),
            }
        }

        fn force_drop_unsupported(err: &sqlx::Error) -> bool {
            matches!(
                err,
                sqlx::Error::Database(db_err)
                    if db_err.code().map(|code| code == "42601" || code == "0A000").unwrap_or(false)
            )
        }

        impl Drop for TestDatabase {
            fn drop(&mut self) {
                if let Some(pool) = self.pool.take() {
                    let admin_options = self.admin_options.clone();
                    let db_name = self.database_name.clone();
                    if let Ok(handle) = Handle::try_current() {
                        handle.spawn(async move {
                            pool.close().await;
                            let _ = drop_database_with_fallback(admin_options.clone(), &db_name).await;
                        });
                    } else {
                        std::thread::spawn(move || {
                            if let Ok(rt) = tokio::runtime::Runtime::new() {
                                rt.block_on(async move {
                                    pool.close().await;
                                    let _ = drop_database_with_fallback(admin_options.clone(), &db_name).await;
                                });
                            }
                        });
                    }
                }

                if let Some(container) = self.container.take() {
                    drop(container);
                }
            }
        }
    }

    /// Builder for constructing Rocket instances tailored for integration tests.
    #[derive(Default)]
    pub struct TestRocketBuilder {
        figment: Figment,
        mounts: Vec<(String, Vec<Route>)>,
        pg_pool: Option<PgPool>,
    }

    impl TestRocketBuilder {
        pub fn new() -> Self {
            let figment = rocket::Config::figment()
                .merge(("port", 0))
                .merge(("log_level", LogLevel::Off))
                .merge(("cli_colors", false));

            Self {
                figment,
                mounts: Vec::new(),
                pg_pool: None,
            }
        }

        pub fn mount_api_routes(mut self, routes: Vec<Route>) -> Self {
            self.mounts.push(("/api/v1".to_string(), routes));
            self
        }

        pub fn mount_webhook_routes(mut self, routes: Vec<Route>) -> Self {
            self.mounts.push(("/webhooks".to_string(), routes));
            self
        }

        pub fn manage_pg_pool(mut self, pool: PgPool) -> Self {
            self.pg_pool = Some(pool);
            self
        }

        pub fn build(self) -> Rocket<Build> {
            let mut rocket = rocket::custom(self.figment);

            for (base, routes) in self.mounts {
                rocket = rocket.mount(base, routes);
            }

            if let Some(pool) = self.pg_pool {
                rocket = rocket.manage(pool);
            }

            rocket
        }

        pub fn blocking_client(self) -> Client {
            Client::tracked(self.build()).expect("valid Rocket instance")
        }

        pub async fn async_client(self) -> AsyncClient {
            AsyncClient::tracked(self.build()).await.expect("valid Rocket instance")
        }
    }
}
