//! Access-token resolution is an external OAuth collaborator's job (token
//! acquisition, refresh, storage) — this crate only defines the narrow
//! interface it depends on and ships a static in-memory stand-in for tests.

use async_trait::async_trait;
use dashmap::DashMap;
use uuid::Uuid;

use crate::error::CoreError;
use super::AccessToken;

#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn get_token(&self, connection_id: Uuid) -> Result<AccessToken, CoreError>;

    /// Called once after an `Auth` provider error, per the retry-once policy
    /// (§7: "token refresh attempt via OAuth collaborator, then retry-once").
    async fn refresh_token(&self, connection_id: Uuid) -> Result<AccessToken, CoreError>;
}

/// Fixed-token stand-in. Real token acquisition/refresh is out of scope —
/// see the OAuth collaborator boundary.
pub struct StaticTokenProvider {
    tokens: DashMap<Uuid, String>,
}

impl StaticTokenProvider {
    pub fn new() -> Self {
        Self {
            tokens: DashMap::new(),
        }
    }

    pub fn set(&self, connection_id: Uuid, token: String) {
        self.tokens.insert(connection_id, token);
    }
}

impl Default for StaticTokenProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn get_token(&self, connection_id: Uuid) -> Result<AccessToken, CoreError> {
        self.tokens
            .get(&connection_id)
            .map(|t| AccessToken(t.clone()))
            .ok_or_else(|| CoreError::NotFound(format!("no token for connection {connection_id}")))
    }

    async fn refresh_token(&self, connection_id: Uuid) -> Result<AccessToken, CoreError> {
        self.get_token(connection_id).await
    }
}
