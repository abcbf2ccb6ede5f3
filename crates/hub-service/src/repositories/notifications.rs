//! Postgres notification repository.

use super::NotificationRepository;
use crate::errors::HubError;
use crate::models::{Notification, NotificationKind};
use crate::observability::metrics;

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use std::time::Instant;
use tracing::instrument;

pub struct PgNotificationRepository {
    pool: PgPool,
}

impl PgNotificationRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl NotificationRepository for PgNotificationRepository {
    #[instrument(skip_all, name = "hub.repo.create_notification")]
    async fn create(&self, notification: &Notification) -> Result<(), HubError> {
        let start = Instant::now();

        sqlx::query(
            r#"
            INSERT INTO notifications (
                id, user_id, message, notification_type, is_read,
                link, mention, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(&notification.id) // $1
        .bind(&notification.user_id) // $2
        .bind(&notification.message) // $3
        .bind(notification.kind.as_str()) // $4
        .bind(notification.is_read) // $5
        .bind(&notification.link) // $6
        .bind(&notification.mention) // $7
        .bind(notification.created_at) // $8
        .execute(&self.pool)
        .await
        .map_err(|e| {
            metrics::record_db_query("create_notification", "error", start.elapsed());
            HubError::from(e)
        })?;

        metrics::record_db_query("create_notification", "success", start.elapsed());
        Ok(())
    }

    #[instrument(skip_all, name = "hub.repo.list_notifications")]
    async fn list_for_user(
        &self,
        user_id: &str,
        limit: u32,
    ) -> Result<Vec<Notification>, HubError> {
        let start = Instant::now();

        let rows = sqlx::query(
            r#"
            SELECT id, user_id, message, notification_type, is_read,
                   link, mention, created_at
            FROM notifications
            WHERE user_id = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(user_id)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            metrics::record_db_query("list_notifications", "error", start.elapsed());
            HubError::from(e)
        })?;

        metrics::record_db_query("list_notifications", "success", start.elapsed());

        rows.into_iter()
            .map(|row| -> Result<Notification, HubError> {
                let kind: String = row.try_get("notification_type")?;
                Ok(Notification {
                    id: row.try_get("id")?,
                    user_id: row.try_get("user_id")?,
                    message: row.try_get("message")?,
                    kind: kind
                        .parse::<NotificationKind>()
                        .map_err(HubError::Persistence)?,
                    is_read: row.try_get("is_read")?,
                    link: row.try_get("link")?,
                    mention: row.try_get("mention")?,
                    created_at: row.try_get("created_at")?,
                })
            })
            .collect()
    }
}
