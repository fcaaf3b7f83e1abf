use mailbridge_sync::error::{ApiError, CoreError};
use mailbridge_sync::test_support::TestRocketBuilder;
use rocket::http::Status;
use rocket::serde::json::Json;
use rocket::{get, routes};
use serde::Deserialize;

#[derive(Deserialize)]
struct ErrorPayload {
    success: bool,
    error: ErrorBodyPayload,
}

#[derive(Deserialize)]
struct ErrorBodyPayload {
    code: String,
    message: String,
}

#[get("/boom")]
fn boom() -> Result<Json<()>, ApiError> {
    Err(CoreError::Internal("leaked database password: hunter2".to_string()).into())
}

#[get("/missing")]
fn missing() -> Result<Json<()>, ApiError> {
    Err(CoreError::NotFound("email abc123".to_string()).into())
}

#[test]
fn internal_errors_never_leak_raw_error_text() {
    let client = TestRocketBuilder::new()
        .mount_api_routes(routes![boom])
        .blocking_client();

    let response = client.get("/api/v1/boom").dispatch();
    assert_eq!(response.status(), Status::InternalServerError);

    let payload: ErrorPayload = response.into_json().expect("valid error envelope");
    assert!(!payload.success);
    assert_eq!(payload.error.code, "internal_error");
    assert!(!payload.error.message.contains("hunter2"));
    assert_eq!(payload.error.message, "an internal error occurred");
}

#[test]
fn not_found_errors_pass_their_message_through() {
    let client = TestRocketBuilder::new()
        .mount_api_routes(routes![missing])
        .blocking_client();

    let response = client.get("/api/v1/missing").dispatch();
    assert_eq!(response.status(), Status::NotFound);

    let payload: ErrorPayload = response.into_json().expect("valid error envelope");
    assert_eq!(payload.error.code, "not_found");
    assert_eq!(payload.error.message, "email abc123");
}
