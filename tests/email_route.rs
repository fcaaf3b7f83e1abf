use mailbridge_sync::models::{Message, Provider};
use mailbridge_sync::query::EmailFilter;
use mailbridge_sync::store::MessageStore;
use mailbridge_sync::test_support::{TestDatabase, TestDatabaseError, TestFixtures, TestRocketBuilder};
use rocket::http::Status;
use rocket::serde::json::Json;
use rocket::{get, routes, State};
use uuid::Uuid;

#[tokio::test]
async fn list_messages_returns_seeded_inbox_row() {
    let test_db = match TestDatabase::new_from_env().await {
        Ok(db) => db,
        Err(TestDatabaseError::MissingUrl) => {
            eprintln!("skipping email route integration test: TEST_DATABASE_URL not set");
            return;
        }
        Err(err) => panic!("failed to provision test database: {err:?}"),
    };

    let pool = test_db.pool_clone();
    let user_id = Uuid::new_v4();

    let connection_id = {
        let fixtures = TestFixtures::new(&pool);
        let connection_id = fixtures
            .insert_connection(user_id, Provider::Gmail, "user@example.com", true)
            .await
            .expect("failed to insert connection");
        fixtures
            .insert_message(connection_id, user_id, Provider::Gmail, "ext-1", "Welcome aboard", mailbridge_sync::models::Folder::Inbox)
            .await
            .expect("failed to insert message");
        connection_id
    };

    let messages = MessageStore::new(pool.clone());

    let client = TestRocketBuilder::new()
        .manage_pg_pool(pool.clone())
        .mount_api_routes(routes![list_messages_test])
        .async_client()
        .await;

    let response = client.get(format!("/api/v1/messages/{user_id}")).dispatch().await;
    assert_eq!(response.status(), Status::Ok);

    let payload: Vec<Message> = response.into_json().await.expect("payload should deserialize");
    assert_eq!(payload.len(), 1);
    assert_eq!(payload[0].subject, "Welcome aboard");
    assert_eq!(payload[0].connection_id, connection_id);

    let (rows, total) = messages
        .list(user_id, Some(connection_id), &EmailFilter::default(), 20, 0)
        .await
        .expect("direct store list succeeds");
    assert_eq!(total, 1);
    assert_eq!(rows[0].external_id, "ext-1");

    drop(client);
    test_db.close().await.expect("failed to drop test database");
}

#[get("/messages/<user_id>")]
async fn list_messages_test(pool: &State<sqlx::PgPool>, user_id: Uuid) -> Result<Json<Vec<Message>>, Status> {
    let store = MessageStore::new(pool.inner().clone());
    let (rows, _total) = store
        .list(user_id, None, &EmailFilter::default(), 20, 0)
        .await
        .map_err(|_| Status::InternalServerError)?;
    Ok(Json(rows))
}
