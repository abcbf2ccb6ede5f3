//! Notification fanout.
//!
//! A notification is persisted first and then pushed to the target user's
//! personal channel. A user with no live connection gets nothing pushed;
//! the stored record is the pull path.

use crate::channels::ChannelHub;
use crate::errors::HubError;
use crate::models::Notification;
use crate::protocol::{outbound, NotificationPayload, OutboundEvent};
use crate::repositories::NotificationRepository;

use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, instrument};

/// Default page size for [`NotificationService::list_for_user`].
pub const DEFAULT_NOTIFICATION_LIMIT: u32 = 50;

pub struct NotificationService {
    notifications: Arc<dyn NotificationRepository>,
    channels: Arc<ChannelHub>,
}

impl NotificationService {
    #[must_use]
    pub fn new(notifications: Arc<dyn NotificationRepository>, channels: Arc<ChannelHub>) -> Self {
        Self {
            notifications,
            channels,
        }
    }

    /// Validate, persist and push.
    ///
    /// Returns the stored record and the number of connections it reached.
    ///
    /// # Errors
    ///
    /// `Validation` for missing fields or an unknown type, `Persistence` if
    /// the record cannot be stored. Nothing is pushed on error.
    #[instrument(skip_all, name = "hub.notify.send")]
    pub async fn send(
        &self,
        payload: NotificationPayload,
    ) -> Result<(Notification, usize), HubError> {
        let notification = payload.validate()?.into_record(Utc::now());
        self.notifications.create(&notification).await?;

        let data = serde_json::to_value(&notification)
            .map_err(|e| HubError::Internal(format!("notification encoding failed: {e}")))?;
        let delivered = self
            .channels
            .send_to_user(
                &notification.user_id,
                &OutboundEvent::new(outbound::NOTIFICATION, data),
            )
            .await;

        debug!(
            target: "hub.notify",
            notification_id = %notification.id,
            kind = notification.kind.as_str(),
            delivered,
            "Notification stored"
        );
        Ok((notification, delivered))
    }

    /// Stored notifications for a user, newest first.
    pub async fn list_for_user(
        &self,
        user_id: &str,
        limit: u32,
    ) -> Result<Vec<Notification>, HubError> {
        self.notifications.list_for_user(user_id, limit).await
    }
}
