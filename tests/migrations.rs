use mailbridge_sync::test_support::{TestDatabase, TestDatabaseError};
use sqlx::migrate::Migrator;

static TEST_MIGRATOR: Migrator = sqlx::migrate!("./migrations");

#[tokio::test]
async fn migrations_apply_idempotently_and_create_expected_tables() {
    let test_db = match TestDatabase::new_from_env().await {
        Ok(db) => db,
        Err(TestDatabaseError::MissingUrl) => {
            eprintln!("skipping migration test: TEST_DATABASE_URL not set");
            return;
        }
        Err(err) => panic!("failed to provision test database: {err:?}"),
    };

    let pool = test_db.pool_clone();

    // TestDatabase::new already ran the migrator once; rerunning must be a no-op.
    TEST_MIGRATOR.run(&pool).await.expect("migrations rerun cleanly");

    for table in ["connections", "messages", "sync_states", "calendar_sync_states", "modifiers", "email_versions", "conflicts"] {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM information_schema.tables WHERE table_schema = 'public' AND table_name = $1",
        )
        .bind(table)
        .fetch_one(&pool)
        .await
        .expect("lookup succeeded");

        assert_eq!(count, 1, "table {table} should exist after migrations");
    }

    test_db.close().await.expect("failed to drop test database");
}
