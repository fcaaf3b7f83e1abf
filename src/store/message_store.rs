//! Local message metadata store (§3, §4.3.5). Implements the dedup
//! invariant `(connection_id, external_id)` unique (P1), the merge rules
//! that preserve `ai_*`/workflow fields across provider upserts (P3), and
//! monotonic version bumps (P2), via an `ON CONFLICT ... DO UPDATE` upsert
//! plus a dynamic `QueryBuilder` for the list filters.

use sqlx::{PgPool, QueryBuilder};
use std::collections::HashSet;
use uuid::Uuid;

use crate::config::Clock;
use crate::error::CoreError;
use crate::models::{Folder, Message, Provider, ProviderMessageFields, WorkflowStatus};
use crate::query::EmailFilter;

fn parse_folder(s: &str) -> Option<Folder> {
    match s {
        "inbox" => Some(Folder::Inbox),
        "sent" => Some(Folder::Sent),
        "drafts" => Some(Folder::Drafts),
        "trash" => Some(Folder::Trash),
        "spam" => Some(Folder::Spam),
        "archive" => Some(Folder::Archive),
        "custom" => Some(Folder::Custom),
        _ => None,
    }
}

fn parse_workflow_status(s: &str) -> Option<WorkflowStatus> {
    match s {
        "none" => Some(WorkflowStatus::None),
        "todo" => Some(WorkflowStatus::Todo),
        "done" => Some(WorkflowStatus::Done),
        "snoozed" => Some(WorkflowStatus::Snoozed),
        _ => None,
    }
}

#[derive(Clone)]
pub struct MessageStore {
    pool: PgPool,
}

impl MessageStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert a brand-new message (no existing row for this external id).
    pub async fn insert_new(
        &self,
        connection_id: Uuid,
        user_id: Uuid,
        provider: Provider,
        fields: ProviderMessageFields,
        clock: &dyn Clock,
    ) -> Result<Message, CoreError> {
        let id = Uuid::new_v4();
        let version = clock.now_nanos();
        sqlx::query(
            r#"
            INSERT INTO messages (
                id, external_id, thread_id, connection_id, user_id, provider,
                from_address, to_addresses, cc_addresses, bcc_addresses, subject, snippet,
                folder, labels, is_read, is_starred, has_attachment, received_at,
                ai_status, ai_category, ai_priority, workflow_status, snoozed_until, version
            ) VALUES (
                $1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16,$17,$18,
                NULL,NULL,NULL,'none',NULL,$19
            )
            "#,
        )
        .bind(id)
        .bind(&fields.external_id)
        .bind(&fields.thread_id)
        .bind(connection_id)
        .bind(user_id)
        .bind(provider)
        .bind(&fields.from_address)
        .bind(&fields.to_addresses)
        .bind(&fields.cc_addresses)
        .bind(&fields.bcc_addresses)
        .bind(&fields.subject)
        .bind(&fields.snippet)
        .bind(fields.folder)
        .bind(&fields.labels)
        .bind(fields.is_read)
        .bind(fields.is_starred)
        .bind(fields.has_attachment)
        .bind(fields.received_at)
        .bind(version)
        .execute(&self.pool)
        .await?;

        self.get(id).await
    }

    /// Upsert by `(connection_id, external_id)`: insert if new, else merge
    /// per §4.3.5 — overwrite provider-owned fields, preserve `ai_*` and
    /// client-owned workflow fields, bump version to `max(existing, now)`.
    pub async fn upsert_from_provider(
        &self,
        connection_id: Uuid,
        user_id: Uuid,
        provider: Provider,
        fields: ProviderMessageFields,
        clock: &dyn Clock,
    ) -> Result<Message, CoreError> {
        let existing = self
            .get_by_external_id(connection_id, &fields.external_id)
            .await?;

        match existing {
            None => self.insert_new(connection_id, user_id, provider, fields, clock).await,
            Some(existing) => {
                let new_version = existing.version.max(clock.now_nanos());
                sqlx::query(
                    r#"
                    UPDATE messages SET
                        thread_id = $1,
                        from_address = $2,
                        to_addresses = $3,
                        cc_addresses = $4,
                        bcc_addresses = $5,
                        subject = $6,
                        snippet = $7,
                        folder = $8,
                        labels = $9,
                        is_read = $10,
                        is_starred = $11,
                        has_attachment = $12,
                        received_at = $13,
                        version = $14
                    WHERE id = $15
                    "#,
                )
                .bind(&fields.thread_id)
                .bind(&fields.from_address)
                .bind(&fields.to_addresses)
                .bind(&fields.cc_addresses)
                .bind(&existing.bcc_addresses)
                .bind(&fields.subject)
                .bind(&fields.snippet)
                .bind(fields.folder)
                .bind(&fields.labels)
                .bind(fields.is_read)
                .bind(fields.is_starred)
                .bind(fields.has_attachment)
                .bind(fields.received_at)
                .bind(new_version)
                .bind(existing.id)
                .execute(&self.pool)
                .await?;

                self.get(existing.id).await
            }
        }
    }

    /// Partial label-only update for delta `label_change` events — does not
    /// touch any other provider-owned field.
    pub async fn apply_label_change(
        &self,
        connection_id: Uuid,
        external_id: &str,
        labels: Vec<String>,
        clock: &dyn Clock,
    ) -> Result<(), CoreError> {
        if let Some(existing) = self.get_by_external_id(connection_id, external_id).await? {
            let new_version = existing.version.max(clock.now_nanos());
            sqlx::query("UPDATE messages SET labels = $1, version = $2 WHERE id = $3")
                .bind(&labels)
                .bind(new_version)
                .bind(existing.id)
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    pub async fn delete_by_external_id(
        &self,
        connection_id: Uuid,
        external_id: &str,
    ) -> Result<Option<Uuid>, CoreError> {
        let row: Option<(Uuid,)> =
            sqlx::query_as("DELETE FROM messages WHERE connection_id = $1 AND external_id = $2 RETURNING id")
                .bind(connection_id)
                .bind(external_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(id,)| id))
    }

    pub async fn get(&self, id: Uuid) -> Result<Message, CoreError> {
        sqlx::query_as::<_, Message>("SELECT * FROM messages WHERE id = $1")
            .bind(id)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| match e {
                sqlx::Error::RowNotFound => CoreError::NotFound(format!("message {id}")),
                other => CoreError::Database(other),
            })
    }

    pub async fn get_by_external_id(
        &self,
        connection_id: Uuid,
        external_id: &str,
    ) -> Result<Option<Message>, CoreError> {
        let row = sqlx::query_as::<_, Message>(
            "SELECT * FROM messages WHERE connection_id = $1 AND external_id = $2",
        )
        .bind(connection_id)
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Batch membership lookup by `(connection, external_id)` for hybrid
    /// read-path dedup: provider rows already present win, never duplicated.
    pub async fn existing_external_ids(
        &self,
        connection_id: Uuid,
        external_ids: &[String],
    ) -> Result<HashSet<String>, CoreError> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT external_id FROM messages WHERE connection_id = $1 AND external_id = ANY($2)",
        )
        .bind(connection_id)
        .bind(external_ids)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    /// DB-first query for the hybrid read path. Returns `(rows, total)`.
    pub async fn list(
        &self,
        user_id: Uuid,
        connection_id: Option<Uuid>,
        filter: &EmailFilter,
        limit: i64,
        offset: i64,
    ) -> Result<(Vec<Message>, i64), CoreError> {
        let mut qb: QueryBuilder<sqlx::Postgres> =
            QueryBuilder::new("SELECT * FROM messages WHERE user_id = ");
        qb.push_bind(user_id);

        Self::apply_filters(&mut qb, connection_id, filter);
        qb.push(" ORDER BY received_at DESC LIMIT ");
        qb.push_bind(limit);
        qb.push(" OFFSET ");
        qb.push_bind(offset);

        let rows: Vec<Message> = qb.build_query_as().fetch_all(&self.pool).await?;

        let mut count_qb: QueryBuilder<sqlx::Postgres> =
            QueryBuilder::new("SELECT COUNT(*) FROM messages WHERE user_id = ");
        count_qb.push_bind(user_id);
        Self::apply_filters(&mut count_qb, connection_id, filter);
        let total: (i64,) = count_qb.build_query_as().fetch_one(&self.pool).await?;

        Ok((rows, total.0))
    }

    fn apply_filters(
        qb: &mut QueryBuilder<sqlx::Postgres>,
        connection_id: Option<Uuid>,
        filter: &EmailFilter,
    ) {
        if let Some(conn) = connection_id {
            qb.push(" AND connection_id = ");
            qb.push_bind(conn);
        }
        if let Some(folder) = filter.folder.as_deref().and_then(parse_folder) {
            qb.push(" AND folder = ");
            qb.push_bind(folder);
        }
        if let Some(is_read) = filter.is_read {
            qb.push(" AND is_read = ");
            qb.push_bind(is_read);
        }
        if let Some(is_starred) = filter.is_starred {
            qb.push(" AND is_starred = ");
            qb.push_bind(is_starred);
        }
        if let Some(email) = &filter.from_email {
            qb.push(" AND from_address = ");
            qb.push_bind(email.clone());
        }
        if let Some(domain) = &filter.from_domain {
            qb.push(" AND from_address LIKE ");
            qb.push_bind(format!("%@{domain}"));
        }
        if let Some(has_attachment) = filter.has_attachment {
            qb.push(" AND has_attachment = ");
            qb.push_bind(has_attachment);
        }
        if let Some(date_from) = filter.date_from {
            qb.push(" AND received_at >= ");
            qb.push_bind(date_from.and_hms_opt(0, 0, 0).unwrap().and_utc());
        }
        if let Some(date_to) = filter.date_to {
            qb.push(" AND received_at <= ");
            qb.push_bind(date_to.and_hms_opt(23, 59, 59).unwrap().and_utc());
        }
        if let Some(search) = &filter.search {
            if !search.is_empty() {
                qb.push(" AND (subject ILIKE ");
                qb.push_bind(format!("%{search}%"));
                qb.push(" OR snippet ILIKE ");
                qb.push_bind(format!("%{search}%"));
                qb.push(")");
            }
        }
        if let Some(category) = &filter.category {
            qb.push(" AND ai_category = ");
            qb.push_bind(category.clone());
        }
        if let Some(priority) = &filter.priority {
            qb.push(" AND ai_priority = ");
            qb.push_bind(priority.parse::<i32>().unwrap_or(0));
        }
        if let Some(status) = filter.workflow_status.as_deref().and_then(parse_workflow_status) {
            qb.push(" AND workflow_status = ");
            qb.push_bind(status);
        }
    }

    // --- Modifier-queue mutations (defensive re-apply + optimistic apply) ---

    pub async fn set_read(&self, ids: &[Uuid], is_read: bool, clock: &dyn Clock) -> Result<(), CoreError> {
        let now = clock.now_nanos();
        sqlx::query("UPDATE messages SET is_read = $1, version = GREATEST(version, $2) WHERE id = ANY($3)")
            .bind(is_read)
            .bind(now)
            .bind(ids)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_starred(&self, ids: &[Uuid], is_starred: bool, clock: &dyn Clock) -> Result<(), CoreError> {
        let now = clock.now_nanos();
        sqlx::query("UPDATE messages SET is_starred = $1, version = GREATEST(version, $2) WHERE id = ANY($3)")
            .bind(is_starred)
            .bind(now)
            .bind(ids)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_folder(&self, ids: &[Uuid], folder: Folder, clock: &dyn Clock) -> Result<(), CoreError> {
        let now = clock.now_nanos();
        sqlx::query("UPDATE messages SET folder = $1, version = GREATEST(version, $2) WHERE id = ANY($3)")
            .bind(folder)
            .bind(now)
            .bind(ids)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn add_labels(&self, ids: &[Uuid], labels: &[String], clock: &dyn Clock) -> Result<(), CoreError> {
        let now = clock.now_nanos();
        sqlx::query(
            "UPDATE messages SET labels = (SELECT ARRAY(SELECT DISTINCT unnest(labels || $1))), version = GREATEST(version, $2) WHERE id = ANY($3)",
        )
        .bind(labels)
        .bind(now)
        .bind(ids)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn remove_labels(&self, ids: &[Uuid], labels: &[String], clock: &dyn Clock) -> Result<(), CoreError> {
        let now = clock.now_nanos();
        sqlx::query(
            "UPDATE messages SET labels = (SELECT ARRAY(SELECT unnest(labels) EXCEPT SELECT unnest($1))), version = GREATEST(version, $2) WHERE id = ANY($3)",
        )
        .bind(labels)
        .bind(now)
        .bind(ids)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_workflow_status(
        &self,
        ids: &[Uuid],
        status: WorkflowStatus,
        clock: &dyn Clock,
    ) -> Result<(), CoreError> {
        let now = clock.now_nanos();
        sqlx::query("UPDATE messages SET workflow_status = $1, version = GREATEST(version, $2) WHERE id = ANY($3)")
            .bind(status)
            .bind(now)
            .bind(ids)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_snooze(
        &self,
        ids: &[Uuid],
        snoozed_until: Option<chrono::DateTime<chrono::Utc>>,
        clock: &dyn Clock,
    ) -> Result<(), CoreError> {
        let now = clock.now_nanos();
        let status = if snoozed_until.is_some() {
            WorkflowStatus::Snoozed
        } else {
            WorkflowStatus::None
        };
        sqlx::query(
            "UPDATE messages SET snoozed_until = $1, workflow_status = $2, version = GREATEST(version, $3) WHERE id = ANY($4)",
        )
        .bind(snoozed_until)
        .bind(status)
        .bind(now)
        .bind(ids)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete(&self, ids: &[Uuid]) -> Result<(), CoreError> {
        sqlx::query("DELETE FROM messages WHERE id = ANY($1)")
            .bind(ids)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Set an AI field directly (used only by the AI subsystem collaborator
    /// through a narrow interface; the sync engine never calls this).
    pub async fn set_ai_fields(
        &self,
        id: Uuid,
        ai_status: Option<String>,
        ai_category: Option<String>,
        ai_priority: Option<i32>,
    ) -> Result<(), CoreError> {
        sqlx::query(
            "UPDATE messages SET ai_status = $1, ai_category = $2, ai_priority = $3 WHERE id = $4",
        )
        .bind(ai_status)
        .bind(ai_category)
        .bind(ai_priority)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
