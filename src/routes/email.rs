//! Listing/search (hybrid read path) and mutation (modifier queue) handlers.

use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use rocket::serde::json::Json;
use rocket::State;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ApiError;
use crate::models::{AuthenticatedUser, EmailListResponse, Folder, ModifierType, ReadSource, WorkflowStatus};
use crate::provider;
use crate::query::EmailFilter;
use crate::state::AppState;

use super::resolve_connection;

const DEFAULT_LIMIT: i64 = 20;

fn parse_date(raw: &Option<String>, field: &str) -> Result<Option<NaiveDate>, ApiError> {
    match raw {
        None => Ok(None),
        Some(s) if s.is_empty() => Ok(None),
        Some(s) => NaiveDate::parse_from_str(s, "%Y-%m-%d")
            .map(Some)
            .map_err(|_| ApiError::BadRequest(format!("invalid {field}, expected YYYY-MM-DD"))),
    }
}

#[allow(clippy::too_many_arguments)]
fn build_filter(
    folder: Option<String>,
    category: Option<String>,
    sub_category: Option<String>,
    priority: Option<String>,
    is_read: Option<bool>,
    is_starred: Option<bool>,
    search: Option<String>,
    from_email: Option<String>,
    from_domain: Option<String>,
    workflow_status: Option<String>,
    label_ids: Option<Vec<String>>,
    folder_id: Option<String>,
    date_from: Option<NaiveDate>,
    date_to: Option<NaiveDate>,
) -> EmailFilter {
    EmailFilter {
        folder,
        is_read,
        is_starred,
        from_email,
        from_domain,
        has_attachment: None,
        date_from,
        date_to,
        search,
        category,
        sub_category,
        priority,
        workflow_status,
        label_ids,
        folder_id,
    }
}

async fn do_list(
    state: &AppState,
    user: &AuthenticatedUser,
    connection_id: Option<Uuid>,
    filter: &EmailFilter,
    limit: i64,
    offset: i64,
) -> Result<EmailListResponse, ApiError> {
    let mut resolved_connection_id = None;
    let mut provider_kind = None;
    let mut adapter = None;

    if let Some(cid) = connection_id {
        let connection = resolve_connection(&state.pool, user.user_id, cid).await?;
        resolved_connection_id = Some(connection.id);
        provider_kind = Some(connection.provider);
        adapter = Some(provider::for_provider(connection.provider, state.http.clone()));
    }

    let resp = state
        .readpath
        .list(
            user.user_id,
            resolved_connection_id,
            provider_kind,
            adapter.as_deref(),
            filter,
            limit,
            offset,
        )
        .await?;
    Ok(resp)
}

#[allow(clippy::too_many_arguments)]
#[get(
    "/email?<folder>&<category>&<sub_category>&<priority>&<is_read>&<is_starred>&<search>&<from_email>&<from_domain>&<workflow_status>&<label_ids>&<folder_id>&<date_from>&<date_to>&<limit>&<offset>&<connection_id>"
)]
pub async fn list_email(
    user: AuthenticatedUser,
    state: &State<Arc<AppState>>,
    folder: Option<String>,
    category: Option<String>,
    sub_category: Option<String>,
    priority: Option<String>,
    is_read: Option<bool>,
    is_starred: Option<bool>,
    search: Option<String>,
    from_email: Option<String>,
    from_domain: Option<String>,
    workflow_status: Option<String>,
    label_ids: Option<Vec<String>>,
    folder_id: Option<String>,
    date_from: Option<String>,
    date_to: Option<String>,
    limit: Option<i64>,
    offset: Option<i64>,
    connection_id: Option<Uuid>,
) -> Result<Json<EmailListResponse>, ApiError> {
    let filter = build_filter(
        folder,
        category,
        sub_category,
        priority,
        is_read,
        is_starred,
        search,
        from_email,
        from_domain,
        workflow_status,
        label_ids,
        folder_id,
        parse_date(&date_from, "date_from")?,
        parse_date(&date_to, "date_to")?,
    );
    let resp = do_list(
        state.inner(),
        &user,
        connection_id,
        &filter,
        limit.unwrap_or(DEFAULT_LIMIT),
        offset.unwrap_or(0),
    )
    .await?;
    Ok(Json(resp))
}

macro_rules! folder_route {
    ($name:ident, $path:literal, $folder:expr) => {
        #[get($path)]
        pub async fn $name(
            user: AuthenticatedUser,
            state: &State<Arc<AppState>>,
            connection_id: Option<Uuid>,
            limit: Option<i64>,
            offset: Option<i64>,
        ) -> Result<Json<EmailListResponse>, ApiError> {
            let filter = EmailFilter {
                folder: Some($folder.to_string()),
                ..Default::default()
            };
            let resp = do_list(
                state.inner(),
                &user,
                connection_id,
                &filter,
                limit.unwrap_or(DEFAULT_LIMIT),
                offset.unwrap_or(0),
            )
            .await?;
            Ok(Json(resp))
        }
    };
}

folder_route!(inbox, "/email/inbox?<connection_id>&<limit>&<offset>", "inbox");
folder_route!(sent, "/email/sent?<connection_id>&<limit>&<offset>", "sent");
folder_route!(drafts, "/email/drafts?<connection_id>&<limit>&<offset>", "drafts");
folder_route!(trash_folder, "/email/trash?<connection_id>&<limit>&<offset>", "trash");
folder_route!(spam, "/email/spam?<connection_id>&<limit>&<offset>", "spam");
folder_route!(archive_folder, "/email/archive?<connection_id>&<limit>&<offset>", "archive");

#[get("/email/inbox/todo?<connection_id>&<limit>&<offset>")]
pub async fn inbox_todo(
    user: AuthenticatedUser,
    state: &State<Arc<AppState>>,
    connection_id: Option<Uuid>,
    limit: Option<i64>,
    offset: Option<i64>,
) -> Result<Json<EmailListResponse>, ApiError> {
    let filter = EmailFilter {
        folder: Some("inbox".to_string()),
        workflow_status: Some("todo".to_string()),
        ..Default::default()
    };
    let resp = do_list(
        state.inner(),
        &user,
        connection_id,
        &filter,
        limit.unwrap_or(DEFAULT_LIMIT),
        offset.unwrap_or(0),
    )
    .await?;
    Ok(Json(resp))
}

#[get("/email/category/<category>?<connection_id>&<limit>&<offset>")]
pub async fn by_category(
    user: AuthenticatedUser,
    state: &State<Arc<AppState>>,
    category: String,
    connection_id: Option<Uuid>,
    limit: Option<i64>,
    offset: Option<i64>,
) -> Result<Json<EmailListResponse>, ApiError> {
    let filter = EmailFilter {
        category: Some(category),
        ..Default::default()
    };
    let resp = do_list(
        state.inner(),
        &user,
        connection_id,
        &filter,
        limit.unwrap_or(DEFAULT_LIMIT),
        offset.unwrap_or(0),
    )
    .await?;
    Ok(Json(resp))
}

#[derive(Debug, Serialize)]
pub struct SearchResponse {
    pub emails: Vec<crate::models::Message>,
    pub total: i64,
    pub has_more: bool,
    pub source: ReadSource,
    pub query: String,
}

#[get("/email/search?<q>&<connection_id>&<source>&<limit>")]
pub async fn search(
    user: AuthenticatedUser,
    state: &State<Arc<AppState>>,
    q: String,
    connection_id: Option<Uuid>,
    source: Option<String>,
    limit: Option<i64>,
) -> Result<Json<SearchResponse>, ApiError> {
    let _ = source;
    let filter = EmailFilter {
        search: Some(q.clone()),
        ..Default::default()
    };
    let resp = do_list(state.inner(), &user, connection_id, &filter, limit.unwrap_or(DEFAULT_LIMIT), 0).await?;
    Ok(Json(SearchResponse {
        emails: resp.emails,
        total: resp.total,
        has_more: resp.has_more,
        source: resp.source,
        query: q,
    }))
}

/// `strategy` names a search-strategy selector that lives outside this
/// crate; every strategy currently routes through the same hybrid read path.
#[get("/email/search/v2?<q>&<connection_id>&<strategy>&<limit>&<offset>")]
pub async fn search_v2(
    user: AuthenticatedUser,
    state: &State<Arc<AppState>>,
    q: String,
    connection_id: Option<Uuid>,
    strategy: Option<String>,
    limit: Option<i64>,
    offset: Option<i64>,
) -> Result<Json<SearchResponse>, ApiError> {
    let _ = strategy;
    let filter = EmailFilter {
        search: Some(q.clone()),
        ..Default::default()
    };
    let resp = do_list(
        state.inner(),
        &user,
        connection_id,
        &filter,
        limit.unwrap_or(DEFAULT_LIMIT),
        offset.unwrap_or(0),
    )
    .await?;
    Ok(Json(SearchResponse {
        emails: resp.emails,
        total: resp.total,
        has_more: resp.has_more,
        source: resp.source,
        query: q,
    }))
}

// --- Mutations -----------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct IdsBody {
    pub ids: Vec<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct MoveBody {
    pub ids: Vec<Uuid>,
    pub folder: Folder,
}

#[derive(Debug, Deserialize)]
pub struct SnoozeBody {
    pub ids: Vec<Uuid>,
    pub until: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct WorkflowBody {
    pub email_ids: Vec<Uuid>,
    pub status: WorkflowStatus,
}

#[derive(Debug, Deserialize)]
pub struct LabelsBody {
    pub ids: Vec<Uuid>,
    pub labels: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct MutationAck {
    pub success: bool,
    pub count: usize,
}

/// Enqueues `modifier_type` for every id owned by `user`, skipping any id
/// that belongs to someone else rather than failing the whole batch.
async fn enqueue_bulk(
    state: &AppState,
    user: &AuthenticatedUser,
    ids: &[Uuid],
    modifier_type: ModifierType,
    params: serde_json::Value,
) -> Result<usize, ApiError> {
    let mut count = 0usize;
    for id in ids {
        let message = match state.messages.get(*id).await {
            Ok(m) => m,
            Err(_) => continue,
        };
        if message.user_id != user.user_id {
            continue;
        }
        state
            .modifier_queue
            .enqueue(
                user.user_id,
                message.connection_id,
                message.id,
                modifier_type,
                params.clone(),
                message.version,
                state.clock.as_ref(),
            )
            .await?;
        count += 1;
    }
    Ok(count)
}

macro_rules! simple_mutation {
    ($name:ident, $path:literal, $modifier:expr) => {
        #[post($path, data = "<body>")]
        pub async fn $name(
            user: AuthenticatedUser,
            state: &State<Arc<AppState>>,
            body: Json<IdsBody>,
        ) -> Result<Json<MutationAck>, ApiError> {
            let count = enqueue_bulk(state.inner(), &user, &body.ids, $modifier, serde_json::json!({})).await?;
            Ok(Json(MutationAck { success: true, count }))
        }
    };
}

simple_mutation!(mark_read, "/email/read", ModifierType::MarkRead);
simple_mutation!(mark_unread, "/email/unread", ModifierType::MarkUnread);
simple_mutation!(star, "/email/star", ModifierType::Star);
simple_mutation!(unstar, "/email/unstar", ModifierType::Unstar);
simple_mutation!(archive, "/email/archive", ModifierType::Archive);
simple_mutation!(trash, "/email/trash", ModifierType::Trash);

#[post("/email/delete", data = "<body>")]
pub async fn delete(
    user: AuthenticatedUser,
    state: &State<Arc<AppState>>,
    body: Json<IdsBody>,
) -> Result<Json<MutationAck>, ApiError> {
    let state = state.inner();
    let mut owned = Vec::with_capacity(body.ids.len());
    for id in &body.ids {
        if let Ok(message) = state.messages.get(*id).await {
            if message.user_id == user.user_id {
                owned.push(message.id);
            }
        }
    }
    state.messages.delete(&owned).await?;
    state.cache.remove_from_cache(&user.user_id, &owned).await;
    for id in &owned {
        state.realtime.push(
            user.user_id,
            crate::models::RealtimeEvent::new(
                crate::models::RealtimeEventType::EmailDeleted,
                serde_json::json!({"email_id": id}),
            ),
        );
    }
    Ok(Json(MutationAck {
        success: true,
        count: owned.len(),
    }))
}

#[post("/email/move", data = "<body>")]
pub async fn move_folder(
    user: AuthenticatedUser,
    state: &State<Arc<AppState>>,
    body: Json<MoveBody>,
) -> Result<Json<MutationAck>, ApiError> {
    let params = serde_json::json!({"folder": folder_param(body.folder)});
    let count = enqueue_bulk(state.inner(), &user, &body.ids, ModifierType::MoveToFolder, params).await?;
    Ok(Json(MutationAck { success: true, count }))
}

fn folder_param(folder: Folder) -> &'static str {
    match folder {
        Folder::Inbox => "inbox",
        Folder::Sent => "sent",
        Folder::Drafts => "drafts",
        Folder::Trash => "trash",
        Folder::Spam => "spam",
        Folder::Archive => "archive",
        Folder::Custom => "custom",
    }
}

#[post("/email/labels/add", data = "<body>")]
pub async fn add_labels(
    user: AuthenticatedUser,
    state: &State<Arc<AppState>>,
    body: Json<LabelsBody>,
) -> Result<Json<MutationAck>, ApiError> {
    let params = serde_json::json!({"labels": body.labels});
    let count = enqueue_bulk(state.inner(), &user, &body.ids, ModifierType::AddLabel, params).await?;
    Ok(Json(MutationAck { success: true, count }))
}

#[post("/email/labels/remove", data = "<body>")]
pub async fn remove_labels(
    user: AuthenticatedUser,
    state: &State<Arc<AppState>>,
    body: Json<LabelsBody>,
) -> Result<Json<MutationAck>, ApiError> {
    let params = serde_json::json!({"labels": body.labels});
    let count = enqueue_bulk(state.inner(), &user, &body.ids, ModifierType::RemoveLabel, params).await?;
    Ok(Json(MutationAck { success: true, count }))
}

/// Snooze/unsnooze/workflow status have no provider-side meaning; they are
/// applied directly rather than routed through the modifier drain.
#[post("/email/snooze", data = "<body>")]
pub async fn snooze(
    user: AuthenticatedUser,
    state: &State<Arc<AppState>>,
    body: Json<SnoozeBody>,
) -> Result<Json<MutationAck>, ApiError> {
    let state = state.inner();
    let owned = owned_ids(state, &user, &body.ids).await;
    state.messages.set_snooze(&owned, Some(body.until), state.clock.as_ref()).await?;
    state.cache.invalidate_by_user(&user.user_id).await;
    Ok(Json(MutationAck {
        success: true,
        count: owned.len(),
    }))
}

#[post("/email/unsnooze", data = "<body>")]
pub async fn unsnooze(
    user: AuthenticatedUser,
    state: &State<Arc<AppState>>,
    body: Json<IdsBody>,
) -> Result<Json<MutationAck>, ApiError> {
    let state = state.inner();
    let owned = owned_ids(state, &user, &body.ids).await;
    state.messages.set_snooze(&owned, None, state.clock.as_ref()).await?;
    state.cache.invalidate_by_user(&user.user_id).await;
    Ok(Json(MutationAck {
        success: true,
        count: owned.len(),
    }))
}

#[post("/email/workflow", data = "<body>")]
pub async fn workflow(
    user: AuthenticatedUser,
    state: &State<Arc<AppState>>,
    body: Json<WorkflowBody>,
) -> Result<Json<MutationAck>, ApiError> {
    let state = state.inner();
    let owned = owned_ids(state, &user, &body.email_ids).await;
    state.messages.set_workflow_status(&owned, body.status, state.clock.as_ref()).await?;
    state.cache.invalidate_by_user(&user.user_id).await;
    Ok(Json(MutationAck {
        success: true,
        count: owned.len(),
    }))
}

async fn owned_ids(state: &AppState, user: &AuthenticatedUser, ids: &[Uuid]) -> Vec<Uuid> {
    let mut owned = Vec::with_capacity(ids.len());
    for id in ids {
        if let Ok(message) = state.messages.get(*id).await {
            if message.user_id == user.user_id {
                owned.push(message.id);
            }
        }
    }
    owned
}
