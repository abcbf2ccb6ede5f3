//! Postgres conversation repository.

use super::ConversationRepository;
use crate::errors::HubError;
use crate::models::Conversation;
use crate::observability::metrics;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use std::time::Instant;
use tracing::instrument;

pub struct PgConversationRepository {
    pool: PgPool,
}

impl PgConversationRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ConversationRepository for PgConversationRepository {
    #[instrument(skip_all, name = "hub.repo.find_conversation")]
    async fn find_by_id(&self, id: &str) -> Result<Option<Conversation>, HubError> {
        let start = Instant::now();

        let row = sqlx::query(
            r#"
            SELECT id, member_ids, last_message, updated_at
            FROM conversations
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            metrics::record_db_query("find_conversation", "error", start.elapsed());
            HubError::from(e)
        })?;

        metrics::record_db_query("find_conversation", "success", start.elapsed());

        row.map(|row| -> Result<Conversation, HubError> {
            Ok(Conversation {
                id: row.try_get("id")?,
                members: row.try_get("member_ids")?,
                last_message: row.try_get("last_message")?,
                updated_at: row.try_get("updated_at")?,
            })
        })
        .transpose()
    }

    #[instrument(skip_all, name = "hub.repo.record_last_message")]
    async fn record_last_message(
        &self,
        id: &str,
        content: &str,
        at: DateTime<Utc>,
    ) -> Result<(), HubError> {
        let start = Instant::now();

        sqlx::query(
            r#"
            UPDATE conversations
            SET last_message = $2, updated_at = $3
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(content)
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            metrics::record_db_query("record_last_message", "error", start.elapsed());
            HubError::from(e)
        })?;

        metrics::record_db_query("record_last_message", "success", start.elapsed());
        Ok(())
    }
}
