//! Sync control: kicks off a background sync task via `SyncEngine::spawn_background`
//! rather than blocking the request on the provider round trip.

use std::sync::Arc;

use rocket::serde::json::Json;
use rocket::State;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::ApiError;
use crate::models::AuthenticatedUser;
use crate::state::AppState;
use crate::sync::resolve_background_kind;

use super::resolve_connection;

#[derive(Debug, Deserialize)]
pub struct SyncRequest {
    pub connection_id: Uuid,
    #[serde(default)]
    pub full_sync: bool,
}

#[derive(Debug, Serialize)]
pub struct SyncAck {
    pub success: bool,
    pub connection_id: Uuid,
}

async fn kick_off(state: &AppState, user: &AuthenticatedUser, connection_id: Uuid, kind_hint_full: bool) -> Result<(), ApiError> {
    let connection = resolve_connection(&state.pool, user.user_id, connection_id).await?;

    let kind = resolve_background_kind(&state.sync_states, connection_id, kind_hint_full).await?;

    state.sync_states.get_or_create(connection_id, connection.provider).await?;

    state.sync_engine.clone().spawn_background(
        user.user_id,
        connection_id,
        connection.provider,
        state.http.clone(),
        state.clock.clone(),
        CancellationToken::new(),
        kind,
    );
    Ok(())
}

#[post("/email/sync", data = "<body>")]
pub async fn trigger_sync(
    user: AuthenticatedUser,
    state: &State<Arc<AppState>>,
    body: Json<SyncRequest>,
) -> Result<Json<SyncAck>, ApiError> {
    kick_off(state.inner(), &user, body.connection_id, body.full_sync).await?;
    Ok(Json(SyncAck {
        success: true,
        connection_id: body.connection_id,
    }))
}

#[derive(Debug, Deserialize)]
pub struct ResyncRequest {
    pub connection_id: Uuid,
}

#[post("/email/resync", data = "<body>")]
pub async fn resync(
    user: AuthenticatedUser,
    state: &State<Arc<AppState>>,
    body: Json<ResyncRequest>,
) -> Result<Json<SyncAck>, ApiError> {
    kick_off(state.inner(), &user, body.connection_id, true).await?;
    Ok(Json(SyncAck {
        success: true,
        connection_id: body.connection_id,
    }))
}

/// AI reclassification is an external collaborator (§4's classify job); this
/// handler only re-publishes the classify job for every message on the
/// connection rather than re-running mail sync.
#[post("/email/reclassify", data = "<body>")]
pub async fn reclassify(
    user: AuthenticatedUser,
    state: &State<Arc<AppState>>,
    body: Json<ResyncRequest>,
) -> Result<Json<SyncAck>, ApiError> {
    let state = state.inner();
    resolve_connection(&state.pool, user.user_id, body.connection_id).await?;
    let (rows, _total) = state
        .messages
        .list(user.user_id, Some(body.connection_id), &crate::query::EmailFilter::default(), 10_000, 0)
        .await?;
    for message in rows {
        let _ = crate::jobbus::publish(
            state.jobs.as_ref(),
            crate::jobbus::JobKind::Classify,
            &crate::models::ClassifyJobPayload {
                email_id: message.id,
                connection_id: body.connection_id,
            },
        )
        .await;
    }
    Ok(Json(SyncAck {
        success: true,
        connection_id: body.connection_id,
    }))
}

#[post("/email/<id>/resync")]
pub async fn resync_one(user: AuthenticatedUser, state: &State<Arc<AppState>>, id: Uuid) -> Result<Json<SyncAck>, ApiError> {
    let state = state.inner();
    let message = state.messages.get(id).await?;
    if message.user_id != user.user_id {
        return Err(ApiError::NotFound("message not found".to_string()));
    }
    kick_off(state, &user, message.connection_id, false).await?;
    Ok(Json(SyncAck {
        success: true,
        connection_id: message.connection_id,
    }))
}
