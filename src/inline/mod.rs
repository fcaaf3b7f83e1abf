//! Inline `cid:` content resolution (§4.10). Opt-in, fails open: on
//! timeout or any per-attachment error the original HTML is returned
//! unchanged rather than surfacing a broken image to the client.

use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use tokio::sync::Semaphore;
use uuid::Uuid;

use crate::provider::{AccessToken, ProviderAdapter};
use crate::store::BodyStore;

const MAX_CONCURRENT_FETCHES: usize = 5;
const RESOLVE_TIMEOUT: Duration = Duration::from_secs(10);

fn cid_pattern() -> Regex {
    Regex::new(r#"src=["']?cid:<?([^"'>\s]+)>?["']?"#).expect("static cid regex is valid")
}

pub struct InlineContentResolver {
    bodies: BodyStore,
}

impl InlineContentResolver {
    pub fn new(bodies: BodyStore) -> Self {
        Self { bodies }
    }

    /// Rewrites every `cid:` reference in `html` to a base64 data URI,
    /// fetching each attachment's bytes from the provider with bounded
    /// concurrency under a single 10s budget for the whole pass.
    pub async fn resolve(
        &self,
        html: &str,
        message_id: Uuid,
        message_external_id: &str,
        adapter: &dyn ProviderAdapter,
        token: &AccessToken,
    ) -> String {
        match tokio::time::timeout(
            RESOLVE_TIMEOUT,
            self.resolve_inner(html, message_id, message_external_id, adapter, token),
        )
        .await
        {
            Ok(rewritten) => rewritten,
            Err(_) => {
                log::warn!("inline content resolution timed out for message {message_id}, returning original html");
                html.to_string()
            }
        }
    }

    async fn resolve_inner(
        &self,
        html: &str,
        message_id: Uuid,
        message_external_id: &str,
        adapter: &dyn ProviderAdapter,
        token: &AccessToken,
    ) -> String {
        let pattern = cid_pattern();
        let content_ids: Vec<String> = pattern
            .captures_iter(html)
            .filter_map(|c| c.get(1).map(|m| m.as_str().to_string()))
            .collect();
        if content_ids.is_empty() {
            return html.to_string();
        }

        let body = match self.bodies.get(message_id).await {
            Ok(Some(body)) => body,
            _ => return html.to_string(),
        };

        let semaphore = Arc::new(Semaphore::new(MAX_CONCURRENT_FETCHES));
        let mut handles = Vec::new();
        for content_id in content_ids {
            let Some(meta) = body.attachments_meta.iter().find(|a| a.content_id.as_deref() == Some(content_id.as_str())) else {
                continue;
            };
            let semaphore = semaphore.clone();
            let attachment_external_id = meta.external_id.clone();
            let mime_type = meta.mime_type.clone();
            let message_external_id = message_external_id.to_string();
            handles.push(async move {
                let _permit = semaphore.acquire().await.ok()?;
                match adapter.get_attachment(token, &message_external_id, &attachment_external_id).await {
                    Ok(bytes) => Some((content_id, mime_type, bytes.bytes)),
                    Err(e) => {
                        log::warn!("failed to fetch inline attachment {attachment_external_id}: {e}");
                        None
                    }
                }
            });
        }

        let resolved: Vec<_> = futures::future::join_all(handles).await.into_iter().flatten().collect();

        let mut rewritten = html.to_string();
        for (content_id, mime_type, bytes) in resolved {
            let encoded = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, &bytes);
            let data_uri = format!("data:{mime_type};base64,{encoded}");
            for pattern_str in [
                format!(r#"cid:{content_id}"#),
                format!(r#"cid:<{content_id}>"#),
            ] {
                rewritten = rewritten.replace(&pattern_str, &data_uri);
            }
        }
        rewritten
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cid_pattern_extracts_bracketed_and_bare_content_ids() {
        let pattern = cid_pattern();
        let html = r#"<img src="cid:abc123"><img src='cid:<def456>'>"#;
        let ids: Vec<_> = pattern.captures_iter(html).map(|c| c[1].to_string()).collect();
        assert_eq!(ids, vec!["abc123".to_string(), "def456".to_string()]);
    }

    #[test]
    fn cid_pattern_ignores_non_cid_sources() {
        let pattern = cid_pattern();
        let html = r#"<img src="https://example.com/a.png">"#;
        assert!(pattern.captures_iter(html).next().is_none());
    }
}
