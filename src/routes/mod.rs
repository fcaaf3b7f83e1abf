//! HTTP route handlers grouped by resource domain. Mounted under `/api/v1`
//! (webhooks separately, with no auth guard) via plain `routes![]` — no
//! OpenAPI/schema generation layer; see DESIGN.md for the rationale.

pub mod email;
pub mod events;
pub mod health;
pub mod sync;
pub mod webhook;

use sqlx::PgPool;
use uuid::Uuid;

use crate::error::ApiError;
use crate::models::Connection;

/// Fetches a connection and checks it belongs to `user_id`, collapsing a
/// missing row and an owned-by-someone-else row into the same 404 so a
/// connection id leak can't be used to probe other tenants' accounts.
pub(crate) async fn resolve_connection(pool: &PgPool, user_id: Uuid, connection_id: Uuid) -> Result<Connection, ApiError> {
    sqlx::query_as::<_, Connection>("SELECT * FROM connections WHERE id = $1 AND user_id = $2")
        .bind(connection_id)
        .bind(user_id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| ApiError::NotFound("connection not found".to_string()))
}
