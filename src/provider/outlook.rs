//! Outlook/Microsoft Graph adapter. Same shape as the Gmail adapter, against
//! the Graph v1.0 REST surface.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::{Folder, Provider};

use super::{
    AccessToken, AttachmentBytes, DeltaChange, DeltaChangeKind, DeltaResponse,
    ListMessagesRequest, ListMessagesResponse, MessageBodyResponse, ProviderAdapter,
    ProviderAttachmentMeta, ProviderError, ProviderMessage, UploadSessionRequest,
    UploadSessionResponse, WatchRequest, WatchResponse,
};

const BASE_URL: &str = "https://graph.microsoft.com/v1.0/me";

pub struct OutlookAdapter {
    http: reqwest::Client,
}

impl OutlookAdapter {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }

    fn auth(
        &self,
        builder: reqwest::RequestBuilder,
        token: &AccessToken,
    ) -> reqwest::RequestBuilder {
        builder.bearer_auth(&token.0)
    }

    async fn send(
        &self,
        builder: reqwest::RequestBuilder,
    ) -> Result<serde_json::Value, ProviderError> {
        let resp = builder
            .timeout(super::PROVIDER_CALL_BUDGET)
            .send()
            .await
            .map_err(|e| ProviderError::Transient(e.to_string()))?;

        let status = resp.status();
        let retry_after = resp
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        let body = resp
            .text()
            .await
            .unwrap_or_else(|_| "<unreadable body>".to_string());

        if !status.is_success() {
            if status.as_u16() == 410 {
                // Graph's delta-link-gone signal.
                return Err(ProviderError::CursorExpired(body));
            }
            return Err(ProviderError::from_status(
                status.as_u16(),
                retry_after,
                &body,
            ));
        }
        serde_json::from_str(&body)
            .map_err(|e| ProviderError::Permanent(format!("invalid json: {e}")))
    }
}

#[async_trait]
impl ProviderAdapter for OutlookAdapter {
    fn provider(&self) -> Provider {
        Provider::Outlook
    }

    async fn list_messages(
        &self,
        token: &AccessToken,
        req: ListMessagesRequest,
    ) -> Result<ListMessagesResponse, ProviderError> {
        let mut url = reqwest::Url::parse(&format!("{BASE_URL}/messages")).unwrap();
        {
            let mut q = url.query_pairs_mut();
            q.append_pair("$top", &req.max_results.to_string());
            if let Some(filter) = &req.query {
                q.append_pair("$filter", filter);
            }
        }
        if let Some(page_token) = &req.page_token {
            url = reqwest::Url::parse(page_token)
                .unwrap_or(url);
        }

        let body = self.send(self.auth(self.http.get(url), token)).await?;

        let next_page_token = body
            .get("@odata.nextLink")
            .and_then(|v| v.as_str())
            .map(str::to_string);

        let messages = body
            .get("value")
            .and_then(|v| v.as_array())
            .map(|arr| arr.iter().map(parse_outlook_message).collect())
            .unwrap_or_default();

        Ok(ListMessagesResponse {
            messages,
            next_page_token,
        })
    }

    async fn get_message_body(
        &self,
        token: &AccessToken,
        external_id: &str,
    ) -> Result<MessageBodyResponse, ProviderError> {
        let url = format!(
            "{BASE_URL}/messages/{external_id}?$select=body,hasAttachments"
        );
        let body = self.send(self.auth(self.http.get(&url), token)).await?;

        let content_type = body
            .get("body")
            .and_then(|b| b.get("contentType"))
            .and_then(|v| v.as_str())
            .unwrap_or("text");
        let content = body
            .get("body")
            .and_then(|b| b.get("content"))
            .and_then(|v| v.as_str())
            .map(str::to_string);

        let attachments = if body
            .get("hasAttachments")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
        {
            self.list_attachments(token, external_id).await?
        } else {
            Vec::new()
        };

        Ok(MessageBodyResponse {
            html: if content_type == "html" {
                content.clone()
            } else {
                None
            },
            text: if content_type != "html" { content } else { None },
            attachments_meta: attachments,
        })
    }

    async fn get_attachment(
        &self,
        token: &AccessToken,
        message_external_id: &str,
        attachment_external_id: &str,
    ) -> Result<AttachmentBytes, ProviderError> {
        let url = format!(
            "{BASE_URL}/messages/{message_external_id}/attachments/{attachment_external_id}"
        );
        let body = self.send(self.auth(self.http.get(&url), token)).await?;
        let content_bytes = body
            .get("contentBytes")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ProviderError::Permanent("attachment missing contentBytes".to_string()))?;
        use base64::Engine;
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(content_bytes)
            .map_err(|e| ProviderError::Permanent(format!("bad base64: {e}")))?;
        let mime_type = body
            .get("contentType")
            .and_then(|v| v.as_str())
            .unwrap_or("application/octet-stream")
            .to_string();
        Ok(AttachmentBytes { bytes, mime_type })
    }

    async fn delta(
        &self,
        token: &AccessToken,
        cursor: &str,
    ) -> Result<DeltaResponse, ProviderError> {
        let url = if cursor.starts_with("http") {
            cursor.to_string()
        } else {
            format!("{BASE_URL}/mailFolders/inbox/messages/delta?$deltatoken={cursor}")
        };

        let body = self.send(self.auth(self.http.get(&url), token)).await?;

        let new_cursor = body
            .get("@odata.deltaLink")
            .and_then(|v| v.as_str())
            .or_else(|| body.get("@odata.nextLink").and_then(|v| v.as_str()))
            .unwrap_or(cursor)
            .to_string();

        let changes = body
            .get("value")
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .map(|item| {
                        let removed = item.get("@removed").is_some();
                        let external_id = item
                            .get("id")
                            .and_then(|v| v.as_str())
                            .unwrap_or_default()
                            .to_string();
                        DeltaChange {
                            kind: if removed {
                                DeltaChangeKind::Delete
                            } else {
                                DeltaChangeKind::Upsert
                            },
                            external_id,
                            partial_fields: if removed {
                                None
                            } else {
                                Some(parse_outlook_message(item))
                            },
                        }
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(DeltaResponse {
            changes,
            new_cursor,
        })
    }

    async fn modify(
        &self,
        token: &AccessToken,
        external_ids: &[String],
        add_labels: &[String],
        remove_labels: &[String],
    ) -> Result<(), ProviderError> {
        // Graph has no batch-PATCH for arbitrary message sets in one call on
        // this surface; emulate with bounded parallelism as the capability
        // set requires for providers lacking native batch.
        let mut categories_patch = serde_json::Map::new();
        if !add_labels.is_empty() || !remove_labels.is_empty() {
            categories_patch.insert(
                "categories".to_string(),
                serde_json::Value::Array(
                    add_labels.iter().cloned().map(serde_json::Value::String).collect(),
                ),
            );
        }
        let payload = serde_json::Value::Object(categories_patch);

        let semaphore = tokio::sync::Semaphore::new(5);
        let mut handles = Vec::new();
        for id in external_ids {
            let permit = semaphore.acquire().await;
            if permit.is_err() {
                continue;
            }
            let url = format!("{BASE_URL}/messages/{id}");
            let fut = self.send(self.auth(self.http.patch(&url), token).json(&payload));
            handles.push(fut);
        }
        for fut in handles {
            fut.await?;
        }
        Ok(())
    }

    async fn watch(
        &self,
        token: &AccessToken,
        req: WatchRequest,
    ) -> Result<WatchResponse, ProviderError> {
        let resource = match req.calendar_id {
            Some(ref cal) => format!("me/calendars/{cal}/events"),
            None => "me/mailFolders('inbox')/messages".to_string(),
        };
        let payload = serde_json::json!({
            "changeType": "created,updated,deleted",
            "notificationUrl": "https://placeholder.invalid/webhooks/outlook",
            "resource": resource,
            "expirationDateTime": (Utc::now() + chrono::Duration::days(2)).to_rfc3339(),
            "clientState": "calendar-watch",
        });
        let body = self
            .send(self.auth(self.http.post(format!("{BASE_URL}/subscriptions")), token).json(&payload))
            .await?;
        let watch_id = body
            .get("id")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let expiry: DateTime<Utc> = body
            .get("expirationDateTime")
            .and_then(|v| v.as_str())
            .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
            .map(|v| v.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);
        Ok(WatchResponse {
            watch_id,
            expiry,
            resource_id: body
                .get("resource")
                .and_then(|v| v.as_str())
                .map(str::to_string),
        })
    }

    async fn unwatch(&self, token: &AccessToken, watch_id: &str) -> Result<(), ProviderError> {
        let url = format!("{BASE_URL}/../subscriptions/{watch_id}");
        self.send(self.auth(self.http.delete(&url), token)).await?;
        Ok(())
    }

    async fn create_upload_session(
        &self,
        token: &AccessToken,
        req: UploadSessionRequest,
    ) -> Result<UploadSessionResponse, ProviderError> {
        let message_part = req
            .message_id
            .map(|id| format!("messages/{id}/"))
            .unwrap_or_default();
        let url = format!("{BASE_URL}/{message_part}attachments/createUploadSession");
        let payload = serde_json::json!({
            "AttachmentItem": {
                "attachmentType": "file",
                "name": req.filename,
                "size": req.size,
                "isInline": req.is_inline,
                "contentId": req.content_id,
            }
        });
        let body = self
            .send(self.auth(self.http.post(&url), token).json(&payload))
            .await?;
        let upload_url = body
            .get("uploadUrl")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let expires_at = body
            .get("expirationDateTime")
            .and_then(|v| v.as_str())
            .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
            .map(|v| v.with_timezone(&Utc))
            .unwrap_or_else(|| Utc::now() + chrono::Duration::minutes(10));
        Ok(UploadSessionResponse {
            session_id: upload_url.clone(),
            upload_url,
            chunk_size: 327_680,
            max_chunk_size: 4 * 1024 * 1024,
            expires_at,
            provider: Provider::Outlook,
        })
    }
}

impl OutlookAdapter {
    async fn list_attachments(
        &self,
        token: &AccessToken,
        external_id: &str,
    ) -> Result<Vec<ProviderAttachmentMeta>, ProviderError> {
        let url = format!("{BASE_URL}/messages/{external_id}/attachments");
        let body = self.send(self.auth(self.http.get(&url), token)).await?;
        Ok(body
            .get("value")
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .map(|item| ProviderAttachmentMeta {
                        external_id: item
                            .get("id")
                            .and_then(|v| v.as_str())
                            .unwrap_or_default()
                            .to_string(),
                        filename: item
                            .get("name")
                            .and_then(|v| v.as_str())
                            .unwrap_or_default()
                            .to_string(),
                        mime_type: item
                            .get("contentType")
                            .and_then(|v| v.as_str())
                            .unwrap_or("application/octet-stream")
                            .to_string(),
                        size: item.get("size").and_then(|v| v.as_i64()).unwrap_or(0),
                        content_id: item
                            .get("contentId")
                            .and_then(|v| v.as_str())
                            .map(str::to_string),
                        is_inline: item
                            .get("isInline")
                            .and_then(|v| v.as_bool())
                            .unwrap_or(false),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }
}

fn parse_outlook_message(item: &serde_json::Value) -> ProviderMessage {
    let from_address = item
        .get("from")
        .and_then(|f| f.get("emailAddress"))
        .and_then(|e| e.get("address"))
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();

    let addresses = |key: &str| -> Vec<String> {
        item.get(key)
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|r| {
                        r.get("emailAddress")
                            .and_then(|e| e.get("address"))
                            .and_then(|v| v.as_str())
                    })
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    };

    let categories: Vec<String> = item
        .get("categories")
        .and_then(|v| v.as_array())
        .map(|arr| arr.iter().filter_map(|v| v.as_str()).map(str::to_string).collect())
        .unwrap_or_default();

    let received_at = item
        .get("receivedDateTime")
        .and_then(|v| v.as_str())
        .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
        .map(|v| v.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);

    ProviderMessage {
        external_id: item
            .get("id")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        thread_id: item
            .get("conversationId")
            .and_then(|v| v.as_str())
            .map(str::to_string),
        from_address,
        to_addresses: addresses("toRecipients"),
        cc_addresses: addresses("ccRecipients"),
        subject: item
            .get("subject")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        snippet: item
            .get("bodyPreview")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .chars()
            .take(200)
            .collect(),
        folder: Folder::Inbox,
        labels: categories,
        is_read: item
            .get("isRead")
            .and_then(|v| v.as_bool())
            .unwrap_or(false),
        is_starred: item
            .get("flag")
            .and_then(|f| f.get("flagStatus"))
            .and_then(|v| v.as_str())
            == Some("flagged"),
        has_attachment: item
            .get("hasAttachments")
            .and_then(|v| v.as_bool())
            .unwrap_or(false),
        received_at,
    }
}
