//! Structured cache key builder: `emails:<user>:conn:<id>:folder:<f>:limit:<n>:offset:<o>`
//! and the analogous forms for inbox/category/todo views.

use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn list(
        user: &Uuid,
        connection_id: Option<&Uuid>,
        folder: Option<&str>,
        category: Option<&str>,
        workflow_status: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> Self {
        let mut key = format!("emails:{user}");
        if let Some(conn) = connection_id {
            key.push_str(&format!(":conn:{conn}"));
        }
        if let Some(folder) = folder {
            key.push_str(&format!(":folder:{folder}"));
        }
        if let Some(category) = category {
            key.push_str(&format!(":category:{category}"));
        }
        if let Some(ws) = workflow_status {
            key.push_str(&format!(":workflow:{ws}"));
        }
        key.push_str(&format!(":limit:{limit}:offset:{offset}"));
        Self(key)
    }

    pub fn inbox(user: &Uuid, connection_id: Option<&Uuid>, limit: i64, offset: i64) -> Self {
        Self::list(user, connection_id, Some("inbox"), None, None, limit, offset)
    }
}

pub fn user_prefix(user: &Uuid) -> String {
    format!("emails:{user}")
}
