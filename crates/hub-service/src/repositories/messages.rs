//! Postgres chat message repository.
//!
//! Messages are append-only; `mark_seen` is the only mutation and it only
//! grows `read_by`.

use super::MessageRepository;
use crate::errors::HubError;
use crate::models::{ChatMessage, MessageKind, MessagePage, MessageStatus};
use crate::observability::metrics;

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use std::time::Instant;
use tracing::instrument;

pub struct PgMessageRepository {
    pool: PgPool,
}

impl PgMessageRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MessageRepository for PgMessageRepository {
    #[instrument(skip_all, name = "hub.repo.create_message")]
    async fn create(&self, message: &ChatMessage) -> Result<(), HubError> {
        let start = Instant::now();

        sqlx::query(
            r#"
            INSERT INTO chat_messages (
                id, conversation_id, sender_id, content, message_type,
                sent_at, read_by, status
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(&message.id) // $1
        .bind(&message.conversation_id) // $2
        .bind(&message.sender_id) // $3
        .bind(&message.content) // $4
        .bind(message.kind.as_str()) // $5
        .bind(message.timestamp) // $6
        .bind(&message.read_by) // $7
        .bind(message.status.as_str()) // $8
        .execute(&self.pool)
        .await
        .map_err(|e| {
            metrics::record_db_query("create_message", "error", start.elapsed());
            HubError::from(e)
        })?;

        metrics::record_db_query("create_message", "success", start.elapsed());
        Ok(())
    }

    #[instrument(skip_all, name = "hub.repo.list_messages")]
    async fn list_by_conversation(
        &self,
        conversation_id: &str,
        page: MessagePage,
    ) -> Result<Vec<ChatMessage>, HubError> {
        let start = Instant::now();

        // Newest page first, flipped to ascending below
        let rows = sqlx::query(
            r#"
            SELECT id, conversation_id, sender_id, content, message_type,
                   sent_at, read_by, status
            FROM chat_messages
            WHERE conversation_id = $1
              AND ($2::timestamptz IS NULL OR sent_at < $2)
            ORDER BY sent_at DESC, id DESC
            LIMIT $3
            "#,
        )
        .bind(conversation_id)
        .bind(page.before)
        .bind(i64::from(page.limit))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            metrics::record_db_query("list_messages", "error", start.elapsed());
            HubError::from(e)
        })?;

        metrics::record_db_query("list_messages", "success", start.elapsed());

        let mut messages = rows
            .into_iter()
            .map(map_row_to_message)
            .collect::<Result<Vec<_>, _>>()?;
        messages.reverse();
        Ok(messages)
    }

    #[instrument(skip_all, name = "hub.repo.mark_seen")]
    async fn mark_seen(&self, conversation_id: &str, reader_id: &str) -> Result<u64, HubError> {
        let start = Instant::now();

        let result = sqlx::query(
            r#"
            UPDATE chat_messages
            SET read_by = array_append(read_by, $2),
                status = 'read'
            WHERE conversation_id = $1
              AND sender_id <> $2
              AND NOT ($2 = ANY(read_by))
            "#,
        )
        .bind(conversation_id)
        .bind(reader_id)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            metrics::record_db_query("mark_seen", "error", start.elapsed());
            HubError::from(e)
        })?;

        metrics::record_db_query("mark_seen", "success", start.elapsed());
        Ok(result.rows_affected())
    }
}

fn map_row_to_message(row: sqlx::postgres::PgRow) -> Result<ChatMessage, HubError> {
    let kind: String = row.try_get("message_type")?;
    let status: String = row.try_get("status")?;

    Ok(ChatMessage {
        id: row.try_get("id")?,
        conversation_id: row.try_get("conversation_id")?,
        sender_id: row.try_get("sender_id")?,
        content: row.try_get("content")?,
        kind: kind.parse::<MessageKind>().map_err(HubError::Persistence)?,
        timestamp: row.try_get("sent_at")?,
        read_by: row.try_get("read_by")?,
        status: status.parse::<MessageStatus>().map_err(HubError::Persistence)?,
    })
}
