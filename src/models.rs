//! Domain entities shared across the sync engine, modifier queue, read path
//! and stores. Mirrors the entity contracts of the data model: `Connection`,
//! `Message`, `MessageBody`, `AttachmentMeta`, `SyncState`, `Modifier`,
//! `EmailVersion`, `Conflict`, and the job-bus payloads.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Gmail,
    Outlook,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Gmail => "gmail",
            Provider::Outlook => "outlook",
        }
    }
}

/// An authorized provider account mirrored by the system.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Connection {
    pub id: Uuid,
    pub user_id: Uuid,
    pub provider: Provider,
    pub account_email: String,
    pub default_flag: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Folder {
    Inbox,
    Sent,
    Drafts,
    Trash,
    Spam,
    Archive,
    Custom,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    None,
    Todo,
    Done,
    Snoozed,
}

/// Local message metadata. Bodies live separately in the body store.
///
/// Invariant: `(connection_id, external_id)` is unique — the dedup key for
/// every ingest path (initial sync, delta sync, webhook-triggered sync).
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Message {
    pub id: Uuid,
    pub external_id: String,
    pub thread_id: Option<String>,
    pub connection_id: Uuid,
    pub user_id: Uuid,
    pub provider: Provider,
    pub from_address: String,
    pub to_addresses: Vec<String>,
    pub cc_addresses: Vec<String>,
    pub bcc_addresses: Vec<String>,
    pub subject: String,
    pub snippet: String,
    pub folder: Folder,
    pub labels: Vec<String>,
    pub is_read: bool,
    pub is_starred: bool,
    pub has_attachment: bool,
    pub received_at: DateTime<Utc>,
    pub ai_status: Option<String>,
    pub ai_category: Option<String>,
    pub ai_priority: Option<i32>,
    pub workflow_status: WorkflowStatus,
    pub snoozed_until: Option<DateTime<Utc>>,
    /// Monotonic; local nanosecond clock is an acceptable source. Never decreases.
    pub version: i64,
}

/// Fields a provider upsert is allowed to overwrite. Used by the sync engine's
/// merge step so `ai_*` and client-owned fields are never touched here.
#[derive(Debug, Clone)]
pub struct ProviderMessageFields {
    pub external_id: String,
    pub thread_id: Option<String>,
    pub from_address: String,
    pub to_addresses: Vec<String>,
    pub cc_addresses: Vec<String>,
    pub bcc_addresses: Vec<String>,
    pub subject: String,
    pub snippet: String,
    pub folder: Folder,
    pub labels: Vec<String>,
    pub is_read: bool,
    pub is_starred: bool,
    pub has_attachment: bool,
    pub received_at: DateTime<Utc>,
}

/// `{email_id, html, text, attachments_meta[], compressed, cached_at, expires_at}`.
/// Stored in the MongoDB-shaped body store; TTL ~30 days.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageBody {
    pub email_id: Uuid,
    pub html: Option<String>,
    pub text: Option<String>,
    pub attachments_meta: Vec<AttachmentMeta>,
    pub compressed: bool,
    pub cached_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl MessageBody {
    /// Per the resolved Open Question on empty-body markers: a sentinel body
    /// with no html/text, stored with a normal TTL so the body store doesn't
    /// get mistaken for a cache miss on a genuinely empty message.
    pub fn empty_sentinel(email_id: Uuid, ttl_days: i64) -> Self {
        let now = Utc::now();
        Self {
            email_id,
            html: None,
            text: None,
            attachments_meta: Vec::new(),
            compressed: false,
            cached_at: now,
            expires_at: now + chrono::Duration::days(ttl_days),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentMeta {
    pub id: Uuid,
    pub email_id: Uuid,
    pub external_id: String,
    pub filename: String,
    pub mime_type: String,
    pub size: i64,
    pub content_id: Option<String>,
    pub is_inline: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    None,
    Pending,
    Syncing,
    Idle,
    Error,
    RetryScheduled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    InitialFirstBatch,
    InitialRemaining,
    Delta,
    Gap,
    FullResync,
}

/// One row per connection. Persisted in Postgres.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SyncState {
    pub connection_id: Uuid,
    pub provider: Provider,
    pub status: SyncStatus,
    pub phase: SyncPhase,
    pub history_cursor: Option<String>,
    pub watch_id: Option<String>,
    pub watch_expiry: Option<DateTime<Utc>>,
    pub checkpoint_page_token: Option<String>,
    pub checkpoint_synced_count: i64,
    pub retry_count: i32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub avg_sync_duration_ms: Option<i64>,
}

impl SyncState {
    pub fn fresh(connection_id: Uuid, provider: Provider) -> Self {
        Self {
            connection_id,
            provider,
            status: SyncStatus::None,
            phase: SyncPhase::InitialFirstBatch,
            history_cursor: None,
            watch_id: None,
            watch_expiry: None,
            checkpoint_page_token: None,
            checkpoint_synced_count: 0,
            retry_count: 0,
            next_retry_at: None,
            last_error: None,
            last_sync_at: None,
            avg_sync_duration_ms: None,
        }
    }
}

/// Analogous to `SyncState`, keyed by `(connection_id, calendar_id)`.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct CalendarSyncState {
    pub connection_id: Uuid,
    pub calendar_id: String,
    pub status: SyncStatus,
    pub history_cursor: Option<String>,
    pub watch_id: Option<String>,
    pub watch_expiry: Option<DateTime<Utc>>,
    pub last_sync_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ModifierType {
    MarkRead,
    MarkUnread,
    Archive,
    Trash,
    Star,
    Unstar,
    MoveToFolder,
    AddLabel,
    RemoveLabel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ModifierStatus {
    Pending,
    Applied,
    Failed,
    Conflict,
}

/// A persistent, client-originated mutation awaiting provider application.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Modifier {
    pub id: Uuid,
    pub user_id: Uuid,
    pub connection_id: Uuid,
    pub email_id: Uuid,
    pub modifier_type: ModifierType,
    pub params: serde_json::Value,
    pub client_version: i64,
    pub status: ModifierStatus,
    pub retry_count: i32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub applied_at: Option<DateTime<Utc>>,
    pub conflict_id: Option<Uuid>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ModSource {
    Client,
    Provider,
    Ai,
}

/// Append-only log of the last authoritative mutation per message, used for
/// modifier-drain conflict detection.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct EmailVersion {
    pub email_id: Uuid,
    pub version: i64,
    pub mod_type: ModifierType,
    pub mod_source: ModSource,
    pub mod_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
    VersionMismatch,
    EntityDeleted,
    ProviderError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ConflictResolution {
    ClientWins,
    ServerWins,
    Merge,
    Manual,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Conflict {
    pub id: Uuid,
    pub modifier_id: Uuid,
    pub conflict_type: ConflictType,
    pub client_state: serde_json::Value,
    pub server_state: serde_json::Value,
    pub resolution: Option<ConflictResolution>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolved_by: Option<Uuid>,
}

/// Per the resolved Open Question on auto-merge vs. manual confirmation for
/// orthogonal version conflicts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictPolicy {
    AutoMerge,
    RequireConfirmation,
}

impl Default for ConflictPolicy {
    fn default() -> Self {
        ConflictPolicy::AutoMerge
    }
}

// --- Job bus payloads -------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncJobPayload {
    pub user_id: Uuid,
    pub connection_id: Uuid,
    pub provider: Provider,
    pub full_sync: bool,
    pub history_cursor: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaveJobPayload {
    pub connection_id: Uuid,
    pub user_id: Uuid,
    pub account_email: String,
    pub provider: Provider,
    pub messages: Vec<ProviderMessageSummary>,
}

/// Metadata-only message summary as returned by `list_messages`, before a
/// local id has been assigned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderMessageSummary {
    pub external_id: String,
    pub thread_id: Option<String>,
    pub from_address: String,
    pub to_addresses: Vec<String>,
    pub cc_addresses: Vec<String>,
    pub subject: String,
    pub snippet: String,
    pub folder: Folder,
    pub labels: Vec<String>,
    pub is_read: bool,
    pub is_starred: bool,
    pub has_attachment: bool,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModifyJobPayload {
    pub connection_id: Uuid,
    pub provider: Provider,
    pub action: ModifierType,
    pub external_ids: Vec<String>,
    pub add_labels: Option<Vec<String>>,
    pub remove_labels: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifyJobPayload {
    pub email_id: Uuid,
    pub connection_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexJobPayload {
    pub email_id: Uuid,
}

// --- Realtime events ----------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RealtimeEventType {
    SyncStarted,
    SyncFirstBatch,
    SyncProgress,
    SyncCompleted,
    SyncError,
    EmailNew,
    EmailUpdated,
    EmailDeleted,
    EmailClassified,
    CalendarUpdated,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealtimeEvent {
    #[serde(rename = "type")]
    pub event_type: RealtimeEventType,
    pub timestamp: DateTime<Utc>,
    pub data: serde_json::Value,
}

impl RealtimeEvent {
    pub fn new(event_type: RealtimeEventType, data: serde_json::Value) -> Self {
        Self {
            event_type,
            timestamp: Utc::now(),
            data,
        }
    }
}

/// A user identity resolved by the auth guard. The core trusts this value —
/// it does not mint it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthenticatedUser {
    pub user_id: Uuid,
    pub tenant_id: Uuid,
    pub roles: Vec<String>,
}

/// Generic envelope used by list endpoints: `{emails, total, has_more, sync_status, source}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailListResponse {
    pub emails: Vec<Message>,
    pub total: i64,
    pub has_more: bool,
    pub sync_status: Option<String>,
    pub source: ReadSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadSource {
    Cache,
    Db,
    DbAndApi,
}
