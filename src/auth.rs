//! Bearer-token auth guard (§6.1). Resolution to `{user_id, tenant_id,
//! roles[]}` is delegated to an injected `UserDirectory` — a real identity
//! provider is an external collaborator; this crate ships only an
//! in-memory stand-in for tests and local development.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use rocket::http::Status;
use rocket::request::{self, FromRequest, Request};
use uuid::Uuid;

use crate::error::ApiError;
use crate::models::AuthenticatedUser;

#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn resolve(&self, bearer_token: &str) -> Option<AuthenticatedUser>;
}

/// Fixed-mapping stand-in. Real token verification (JWT, session lookup,
/// introspection endpoint) is out of scope — see the identity collaborator
/// boundary.
pub struct StaticUserDirectory {
    users: DashMap<String, AuthenticatedUser>,
}

impl StaticUserDirectory {
    pub fn new() -> Self {
        Self {
            users: DashMap::new(),
        }
    }

    pub fn register(&self, bearer_token: &str, user_id: Uuid, tenant_id: Uuid, roles: Vec<String>) {
        self.users.insert(
            bearer_token.to_string(),
            AuthenticatedUser {
                user_id,
                tenant_id,
                roles,
            },
        );
    }
}

impl Default for StaticUserDirectory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl UserDirectory for StaticUserDirectory {
    async fn resolve(&self, bearer_token: &str) -> Option<AuthenticatedUser> {
        self.users.get(bearer_token).map(|u| u.clone())
    }
}

#[async_trait]
impl<'r> FromRequest<'r> for AuthenticatedUser {
    type Error = ApiError;

    async fn from_request(req: &'r Request<'_>) -> request::Outcome<Self, Self::Error> {
        let directory = match req.rocket().state::<Arc<dyn UserDirectory>>() {
            Some(d) => d,
            None => {
                log::error!("UserDirectory not managed; rejecting request");
                return request::Outcome::Error((
                    Status::InternalServerError,
                    ApiError::Internal(crate::error::CoreError::Internal("auth not configured".to_string())),
                ));
            }
        };

        let token = req
            .headers()
            .get_one("Authorization")
            .and_then(|h| h.strip_prefix("Bearer "));

        let Some(token) = token else {
            return request::Outcome::Error((
                Status::Unauthorized,
                ApiError::Unauthorized("missing bearer token".to_string()),
            ));
        };

        match directory.resolve(token).await {
            Some(user) => request::Outcome::Success(user),
            None => request::Outcome::Error((
                Status::Unauthorized,
                ApiError::Unauthorized("invalid bearer token".to_string()),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_directory_resolves_registered_token() {
        let directory = StaticUserDirectory::new();
        let user_id = Uuid::new_v4();
        let tenant_id = Uuid::new_v4();
        directory.register("tok-1", user_id, tenant_id, vec!["member".to_string()]);

        let resolved = directory.resolve("tok-1").await.unwrap();
        assert_eq!(resolved.user_id, user_id);
        assert_eq!(resolved.tenant_id, tenant_id);
    }

    #[tokio::test]
    async fn static_directory_rejects_unknown_token() {
        let directory = StaticUserDirectory::new();
        assert!(directory.resolve("missing").await.is_none());
    }
}
