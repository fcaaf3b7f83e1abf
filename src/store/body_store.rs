//! Body store: HTML/text content + attachment metadata, kept out of the
//! relational message store and addressed by `email_id` alone. MongoDB is a
//! natural fit — bodies are large, schema-loose blobs with a simple TTL,
//! not something that needs joins or transactional consistency with the
//! message row.

use bson::{doc, Document};
use chrono::Utc;
use mongodb::options::{IndexOptions, ReplaceOptions};
use mongodb::{Collection, Database, IndexModel};
use uuid::Uuid;

use crate::error::CoreError;
use crate::models::MessageBody;

const DEFAULT_TTL_DAYS: i64 = 30;

#[derive(Clone)]
pub struct BodyStore {
    collection: Collection<Document>,
}

impl BodyStore {
    pub async fn connect(mongodb_url: &str) -> Result<Self, CoreError> {
        let client = mongodb::Client::with_uri_str(mongodb_url).await?;
        let db: Database = client.database("mailbridge");
        let collection = db.collection::<Document>("bodies");

        let index = IndexModel::builder()
            .keys(doc! { "expires_at": 1 })
            .options(IndexOptions::builder().expire_after(std::time::Duration::from_secs(0)).build())
            .build();
        collection.create_index(index).await?;

        Ok(Self { collection })
    }

    #[cfg(test)]
    pub fn from_collection(collection: Collection<Document>) -> Self {
        Self { collection }
    }

    pub async fn get(&self, email_id: Uuid) -> Result<Option<MessageBody>, CoreError> {
        let filter = doc! { "email_id": email_id.to_string() };
        let found = self.collection.find_one(filter).await?;
        Ok(found.map(doc_to_body).transpose()?)
    }

    pub async fn put(&self, body: &MessageBody) -> Result<(), CoreError> {
        let doc = body_to_doc(body);
        let filter = doc! { "email_id": body.email_id.to_string() };
        self.collection
            .replace_one(filter, doc)
            .with_options(ReplaceOptions::builder().upsert(true).build())
            .await?;
        Ok(())
    }

    /// Per the resolved Open Question on empty-body markers: store a
    /// sentinel so a genuinely empty message is never re-fetched as if it
    /// were a cache miss.
    pub async fn put_empty_sentinel(&self, email_id: Uuid) -> Result<(), CoreError> {
        let body = MessageBody::empty_sentinel(email_id, DEFAULT_TTL_DAYS);
        self.put(&body).await
    }

    pub async fn delete(&self, email_id: Uuid) -> Result<(), CoreError> {
        self.collection
            .delete_one(doc! { "email_id": email_id.to_string() })
            .await?;
        Ok(())
    }
}

fn body_to_doc(body: &MessageBody) -> Document {
    let attachments: Vec<Document> = body
        .attachments_meta
        .iter()
        .map(|a| {
            doc! {
                "id": a.id.to_string(),
                "email_id": a.email_id.to_string(),
                "external_id": &a.external_id,
                "filename": &a.filename,
                "mime_type": &a.mime_type,
                "size": a.size,
                "content_id": a.content_id.clone(),
                "is_inline": a.is_inline,
            }
        })
        .collect();

    doc! {
        "email_id": body.email_id.to_string(),
        "html": body.html.clone(),
        "text": body.text.clone(),
        "attachments_meta": attachments,
        "compressed": body.compressed,
        "cached_at": bson::DateTime::from_chrono(body.cached_at),
        "expires_at": bson::DateTime::from_chrono(body.expires_at),
    }
}

fn doc_to_body(doc: Document) -> Result<MessageBody, CoreError> {
    let email_id = doc
        .get_str("email_id")
        .map_err(|e| CoreError::Internal(format!("malformed body document: {e}")))?
        .parse::<Uuid>()
        .map_err(|e| CoreError::Internal(format!("malformed email_id: {e}")))?;

    let attachments_meta = doc
        .get_array("attachments_meta")
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_document())
                .filter_map(doc_to_attachment)
                .collect()
        })
        .unwrap_or_default();

    let cached_at = doc
        .get_datetime("cached_at")
        .map(|d| d.to_chrono())
        .unwrap_or_else(|_| Utc::now());
    let expires_at = doc
        .get_datetime("expires_at")
        .map(|d| d.to_chrono())
        .unwrap_or_else(|_| Utc::now());

    Ok(MessageBody {
        email_id,
        html: doc.get_str("html").ok().map(String::from),
        text: doc.get_str("text").ok().map(String::from),
        attachments_meta,
        compressed: doc.get_bool("compressed").unwrap_or(false),
        cached_at,
        expires_at,
    })
}

fn doc_to_attachment(doc: &Document) -> Option<crate::models::AttachmentMeta> {
    Some(crate::models::AttachmentMeta {
        id: doc.get_str("id").ok()?.parse().ok()?,
        email_id: doc.get_str("email_id").ok()?.parse().ok()?,
        external_id: doc.get_str("external_id").ok()?.to_string(),
        filename: doc.get_str("filename").ok()?.to_string(),
        mime_type: doc.get_str("mime_type").ok()?.to_string(),
        size: doc.get_i64("size").ok()?,
        content_id: doc.get_str("content_id").ok().map(String::from),
        is_inline: doc.get_bool("is_inline").unwrap_or(false),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AttachmentMeta;

    fn sample_body() -> MessageBody {
        let email_id = Uuid::new_v4();
        MessageBody {
            email_id,
            html: Some("<p>hi</p>".to_string()),
            text: Some("hi".to_string()),
            attachments_meta: vec![AttachmentMeta {
                id: Uuid::new_v4(),
                email_id,
                external_id: "att-1".to_string(),
                filename: "a.pdf".to_string(),
                mime_type: "application/pdf".to_string(),
                size: 1024,
                content_id: None,
                is_inline: false,
            }],
            compressed: false,
            cached_at: Utc::now(),
            expires_at: Utc::now() + chrono::Duration::days(30),
        }
    }

    #[test]
    fn round_trips_through_bson_document() {
        let body = sample_body();
        let doc = body_to_doc(&body);
        let decoded = doc_to_body(doc).unwrap();
        assert_eq!(decoded.email_id, body.email_id);
        assert_eq!(decoded.html, body.html);
        assert_eq!(decoded.attachments_meta.len(), 1);
        assert_eq!(decoded.attachments_meta[0].filename, "a.pdf");
    }

    #[test]
    fn empty_sentinel_has_no_content() {
        let id = Uuid::new_v4();
        let sentinel = MessageBody::empty_sentinel(id, DEFAULT_TTL_DAYS);
        assert!(sentinel.html.is_none());
        assert!(sentinel.text.is_none());
        assert!(sentinel.attachments_meta.is_empty());
    }
}
