//! Uniform provider capability interface (§4.1) and the two concrete
//! implementations. The hybrid read path and sync engine choose a variant
//! via [`for_provider`] rather than reflecting on capability methods.

pub mod gmail;
pub mod outlook;
pub mod token;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::models::{Folder, Provider};

/// Failure taxonomy surfaced by every adapter call. The caller (sync engine,
/// hybrid read path, modifier drain) dispatches on this, not on raw HTTP
/// status codes or library error types.
#[derive(Debug, Error, Clone)]
pub enum ProviderError {
    #[error("transient provider error: {0}")]
    Transient(String),
    #[error("provider auth error: {0}")]
    Auth(String),
    #[error("provider resource not found: {0}")]
    NotFound(String),
    #[error("provider rate limited, retry after {retry_after_secs}s: {message}")]
    RateLimited {
        retry_after_secs: u64,
        message: String,
    },
    #[error("provider cursor expired: {0}")]
    CursorExpired(String),
    #[error("permanent provider error: {0}")]
    Permanent(String),
}

impl ProviderError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProviderError::Transient(_) | ProviderError::RateLimited { .. }
        )
    }

    /// Classify an HTTP response into the failure taxonomy: auth, rate
    /// limit, transient (5xx/network), or permanent (other 4xx).
    pub fn from_status(status: u16, retry_after_secs: Option<u64>, body: &str) -> Self {
        match status {
            401 | 403 => ProviderError::Auth(body.to_string()),
            404 => ProviderError::NotFound(body.to_string()),
            429 => ProviderError::RateLimited {
                retry_after_secs: retry_after_secs.unwrap_or(30),
                message: body.to_string(),
            },
            500..=599 => ProviderError::Transient(body.to_string()),
            _ => ProviderError::Permanent(format!("status {status}: {body}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ListMessagesRequest {
    pub max_results: u32,
    pub page_token: Option<String>,
    pub query: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ListMessagesResponse {
    pub messages: Vec<ProviderMessage>,
    pub next_page_token: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ProviderMessage {
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

#[derive(Debug, Clone)]
pub struct MessageBodyResponse {
    pub html: Option<String>,
    pub text: Option<String>,
    pub attachments_meta: Vec<ProviderAttachmentMeta>,
}

#[derive(Debug, Clone)]
pub struct ProviderAttachmentMeta {
    pub external_id: String,
    pub filename: String,
    pub mime_type: String,
    pub size: i64,
    pub content_id: Option<String>,
    pub is_inline: bool,
}

#[derive(Debug, Clone)]
pub struct AttachmentBytes {
    pub bytes: Vec<u8>,
    pub mime_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeltaChangeKind {
    Upsert,
    Delete,
    LabelChange,
}

#[derive(Debug, Clone)]
pub struct DeltaChange {
    pub kind: DeltaChangeKind,
    pub external_id: String,
    pub partial_fields: Option<ProviderMessage>,
}

#[derive(Debug, Clone)]
pub struct DeltaResponse {
    pub changes: Vec<DeltaChange>,
    pub new_cursor: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchTarget {
    Mail,
    Calendar,
}

#[derive(Debug, Clone)]
pub struct WatchRequest {
    pub target: WatchTarget,
    pub calendar_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct WatchResponse {
    pub watch_id: String,
    pub expiry: DateTime<Utc>,
    pub resource_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct UploadSessionRequest {
    pub message_id: Option<String>,
    pub filename: String,
    pub size: u64,
    pub mime: String,
    pub is_inline: bool,
    pub content_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct UploadSessionResponse {
    pub session_id: String,
    pub upload_url: String,
    pub chunk_size: u64,
    pub max_chunk_size: u64,
    pub expires_at: DateTime<Utc>,
    pub provider: Provider,
}

/// An opaque bearer token minted and refreshed by the OAuth collaborator.
/// Adapters never mint or persist this themselves.
#[derive(Debug, Clone)]
pub struct AccessToken(pub String);

/// Per-call budget; every adapter call is bounded to 30s per the concurrency model.
pub const PROVIDER_CALL_BUDGET: std::time::Duration = std::time::Duration::from_secs(30);

#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn provider(&self) -> Provider;

    async fn list_messages(
        &self,
        token: &AccessToken,
        req: ListMessagesRequest,
    ) -> Result<ListMessagesResponse, ProviderError>;

    async fn get_message_body(
        &self,
        token: &AccessToken,
        external_id: &str,
    ) -> Result<MessageBodyResponse, ProviderError>;

    async fn get_attachment(
        &self,
        token: &AccessToken,
        message_external_id: &str,
        attachment_external_id: &str,
    ) -> Result<AttachmentBytes, ProviderError>;

    async fn delta(
        &self,
        token: &AccessToken,
        cursor: &str,
    ) -> Result<DeltaResponse, ProviderError>;

    async fn modify(
        &self,
        token: &AccessToken,
        external_ids: &[String],
        add_labels: &[String],
        remove_labels: &[String],
    ) -> Result<(), ProviderError>;

    async fn watch(
        &self,
        token: &AccessToken,
        req: WatchRequest,
    ) -> Result<WatchResponse, ProviderError>;

    async fn unwatch(&self, token: &AccessToken, watch_id: &str) -> Result<(), ProviderError>;

    async fn create_upload_session(
        &self,
        token: &AccessToken,
        req: UploadSessionRequest,
    ) -> Result<UploadSessionResponse, ProviderError>;
}

/// Chooses the concrete adapter for a provider. Resolves the "reflection on
/// a service value" pattern flagged in the design notes as a tagged-variant
/// dispatch rather than capability-interface type assertions.
pub fn for_provider(provider: Provider, http: reqwest::Client) -> Box<dyn ProviderAdapter> {
    match provider {
        Provider::Gmail => Box::new(gmail::GmailAdapter::new(http)),
        Provider::Outlook => Box::new(outlook::OutlookAdapter::new(http)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_auth_and_not_found() {
        assert!(matches!(
            ProviderError::from_status(401, None, "nope"),
            ProviderError::Auth(_)
        ));
        assert!(matches!(
            ProviderError::from_status(403, None, "nope"),
            ProviderError::Auth(_)
        ));
        assert!(matches!(
            ProviderError::from_status(404, None, "gone"),
            ProviderError::NotFound(_)
        ));
    }

    #[test]
    fn classifies_rate_limit_with_retry_after() {
        match ProviderError::from_status(429, Some(17), "slow down") {
            ProviderError::RateLimited { retry_after_secs, .. } => assert_eq!(retry_after_secs, 17),
            other => panic!("expected RateLimited, got {other:?}"),
        }

        match ProviderError::from_status(429, None, "slow down") {
            ProviderError::RateLimited { retry_after_secs, .. } => assert_eq!(retry_after_secs, 30),
            other => panic!("expected RateLimited, got {other:?}"),
        }
    }

    #[test]
    fn classifies_5xx_as_transient_and_retryable() {
        let err = ProviderError::from_status(503, None, "unavailable");
        assert!(matches!(err, ProviderError::Transient(_)));
        assert!(err.is_retryable());
    }

    #[test]
    fn classifies_other_4xx_as_permanent_and_not_retryable() {
        let err = ProviderError::from_status(400, None, "bad request");
        assert!(matches!(err, ProviderError::Permanent(_)));
        assert!(!err.is_retryable());
    }
}
