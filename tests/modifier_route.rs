use std::sync::Arc;
use std::time::Duration;

use mailbridge_sync::auth::{StaticUserDirectory, UserDirectory};
use mailbridge_sync::cache::{EmailListCache, InMemoryL2Cache};
use mailbridge_sync::config::SystemClock;
use mailbridge_sync::models::{AuthenticatedUser, ModifierType, Provider};
use mailbridge_sync::modifier::ModifierQueue;
use mailbridge_sync::realtime::RealtimeEmitter;
use mailbridge_sync::store::MessageStore;
use mailbridge_sync::test_support::{TestDatabase, TestDatabaseError, TestFixtures, TestRocketBuilder};
use rocket::http::{Header, Status};
use rocket::serde::json::Json;
use rocket::{post, routes, State};
use serde::Serialize;
use uuid::Uuid;

#[derive(Serialize)]
struct EnqueueAck {
    modifier_id: Uuid,
}

#[post("/mark-read/<email_id>")]
async fn mark_read_test(
    user: AuthenticatedUser,
    queue: &State<ModifierQueue>,
    messages: &State<MessageStore>,
    email_id: Uuid,
) -> Result<Json<EnqueueAck>, Status> {
    let message = messages.get(email_id).await.map_err(|_| Status::NotFound)?;
    let modifier = queue
        .enqueue(
            user.user_id,
            message.connection_id,
            message.id,
            ModifierType::MarkRead,
            serde_json::json!({}),
            message.version,
            &SystemClock,
        )
        .await
        .map_err(|_| Status::InternalServerError)?;
    Ok(Json(EnqueueAck { modifier_id: modifier.id }))
}

#[tokio::test]
async fn mark_read_enqueues_modifier_and_applies_optimistically() {
    let test_db = match TestDatabase::new_from_env().await {
        Ok(db) => db,
        Err(TestDatabaseError::MissingUrl) => {
            eprintln!("skipping modifier route integration test: TEST_DATABASE_URL not set");
            return;
        }
        Err(err) => panic!("failed to provision test database: {err:?}"),
    };

    let pool = test_db.pool_clone();
    let user_id = Uuid::new_v4();
    let tenant_id = Uuid::new_v4();

    let (connection_id, email_id) = {
        let fixtures = TestFixtures::new(&pool);
        let connection_id = fixtures
            .insert_connection(user_id, Provider::Gmail, "user@example.com", true)
            .await
            .expect("insert connection");
        let email_id = fixtures
            .insert_message(
                connection_id,
                user_id,
                Provider::Gmail,
                "ext-1",
                "Unread thing",
                mailbridge_sync::models::Folder::Inbox,
            )
            .await
            .expect("insert message");
        (connection_id, email_id)
    };

    let messages = MessageStore::new(pool.clone());
    let realtime = Arc::new(RealtimeEmitter::new());
    let l2 = Arc::new(InMemoryL2Cache::new(Duration::from_secs(60)));
    let cache = EmailListCache::new(100, Duration::from_secs(60), l2);
    let queue = ModifierQueue::new(pool.clone(), messages.clone(), cache, realtime);

    let directory = StaticUserDirectory::new();
    directory.register("tok-1", user_id, tenant_id, vec!["member".to_string()]);
    let directory: Arc<dyn UserDirectory> = Arc::new(directory);

    let rocket = TestRocketBuilder::new()
        .mount_api_routes(routes![mark_read_test])
        .build()
        .manage(directory)
        .manage(queue)
        .manage(messages);

    let client = rocket::local::asynchronous::Client::tracked(rocket)
        .await
        .expect("valid rocket instance");

    let response = client
        .post(format!("/api/v1/mark-read/{email_id}"))
        .header(Header::new("Authorization", "Bearer tok-1"))
        .dispatch()
        .await;
    assert_eq!(response.status(), Status::Ok);

    let pending: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM modifiers WHERE email_id = $1 AND modifier_type = 'mark_read' AND status = 'pending'",
    )
    .bind(email_id)
    .fetch_one(&pool)
    .await
    .expect("lookup succeeded");
    assert_eq!(pending, 1);

    let is_read: bool = sqlx::query_scalar("SELECT is_read FROM messages WHERE id = $1")
        .bind(email_id)
        .fetch_one(&pool)
        .await
        .expect("lookup succeeded");
    assert!(is_read, "mark_read should apply optimistically to the local row");

    let _ = connection_id;
    test_db.close().await.expect("failed to drop test database");
}
