//! Chat message service.
//!
//! Validates, persists and broadcasts conversation messages and tracks
//! per-message read state. Messages go to the conversation topic and to
//! the sender's personal channel, so a sender's other devices see their own
//! messages even without joining the topic.

use crate::channels::{ChannelHub, ConnectionId};
use crate::config::Config;
use crate::errors::HubError;
use crate::models::{ChatMessage, Conversation, MessagePage};
use crate::protocol::{outbound, GetMessagesPayload, OutboundEvent, SendMessagePayload};
use crate::repositories::{ConversationRepository, MessageRepository};

use chrono::Utc;
use common::types::Identity;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

/// Limits applied to chat traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChatSettings {
    pub max_message_length: usize,
    pub page_default: u32,
    pub page_max: u32,
}

impl ChatSettings {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_message_length: config.max_message_length,
            page_default: config.message_page_default,
            page_max: config.message_page_max,
        }
    }
}

pub struct ChatService {
    conversations: Arc<dyn ConversationRepository>,
    messages: Arc<dyn MessageRepository>,
    channels: Arc<ChannelHub>,
    settings: ChatSettings,
}

impl ChatService {
    #[must_use]
    pub fn new(
        conversations: Arc<dyn ConversationRepository>,
        messages: Arc<dyn MessageRepository>,
        channels: Arc<ChannelHub>,
        settings: ChatSettings,
    ) -> Self {
        Self {
            conversations,
            messages,
            channels,
            settings,
        }
    }

    /// Persist and broadcast a message.
    ///
    /// # Errors
    ///
    /// - `Authorization` if `senderId` is not the caller or the caller is not
    ///   a member of the conversation
    /// - `Validation` for empty or oversized content
    /// - `NotFound` for an unknown conversation
    /// - `Persistence` if the message cannot be stored (nothing is broadcast)
    #[instrument(skip_all, name = "hub.chat.send", fields(conversation_id = %payload.conversation_id))]
    pub async fn send_message(
        &self,
        identity: &Identity,
        payload: SendMessagePayload,
    ) -> Result<ChatMessage, HubError> {
        if payload.sender_id != identity.user_id {
            return Err(HubError::Authorization(
                "Sender does not match the authenticated user".to_string(),
            ));
        }
        self.validate_content(&payload.content)?;

        let conversation = self
            .member_conversation(&payload.conversation_id, &identity.user_id)
            .await?;

        let message = ChatMessage::new_sent(
            &conversation.id,
            &identity.user_id,
            &payload.content,
            payload.kind,
            Utc::now(),
        );
        self.messages.create(&message).await?;

        // The summary is denormalized; the message itself is already stored
        if let Err(e) = self
            .conversations
            .record_last_message(&conversation.id, &message.content, message.timestamp)
            .await
        {
            warn!(
                target: "hub.chat",
                conversation_id = %conversation.id,
                error = %e,
                "Failed to update conversation summary"
            );
        }

        let data = serde_json::to_value(&message)
            .map_err(|e| HubError::Internal(format!("message encoding failed: {e}")))?;
        let delivered = self
            .channels
            .broadcast_topic_and_user(
                &conversation.id,
                &identity.user_id,
                &OutboundEvent::new(outbound::MESSAGE, data),
            )
            .await;

        debug!(
            target: "hub.chat",
            conversation_id = %conversation.id,
            message_id = %message.id,
            delivered,
            "Message sent"
        );
        Ok(message)
    }

    /// Mark every message the caller has not seen as read.
    ///
    /// Idempotent. Returns the number of messages that changed.
    #[instrument(skip_all, name = "hub.chat.mark_seen", fields(conversation_id = %conversation_id))]
    pub async fn mark_seen(
        &self,
        identity: &Identity,
        conversation_id: &str,
    ) -> Result<u64, HubError> {
        let conversation = self
            .member_conversation(conversation_id, &identity.user_id)
            .await?;

        let changed = self
            .messages
            .mark_seen(&conversation.id, &identity.user_id)
            .await?;

        let seen = OutboundEvent::new(
            outbound::MESSAGE_SEEN,
            json!({ "conversationId": conversation.id, "readerId": identity.user_id }),
        );
        self.channels
            .broadcast_topic_and_user(&conversation.id, &identity.user_id, &seen)
            .await;

        debug!(
            target: "hub.chat",
            conversation_id = %conversation.id,
            changed,
            "Messages marked seen"
        );
        Ok(changed)
    }

    /// One page of history, ascending by timestamp.
    #[instrument(skip_all, name = "hub.chat.history", fields(conversation_id = %payload.conversation_id))]
    pub async fn get_messages(
        &self,
        identity: &Identity,
        payload: &GetMessagesPayload,
    ) -> Result<Vec<ChatMessage>, HubError> {
        let conversation = self
            .member_conversation(&payload.conversation_id, &identity.user_id)
            .await?;

        let page = self.page(payload.before, payload.limit);
        self.messages
            .list_by_conversation(&conversation.id, page)
            .await
    }

    /// Relay `typing` / `stopTyping` to the rest of the conversation topic.
    ///
    /// The connection must have joined the topic.
    pub async fn typing(
        &self,
        identity: &Identity,
        connection_id: ConnectionId,
        conversation_id: &str,
        stopped: bool,
    ) -> Result<(), HubError> {
        if !self
            .channels
            .is_subscribed(connection_id, conversation_id)
            .await
        {
            return Err(HubError::Authorization(
                "Join the conversation first".to_string(),
            ));
        }

        let name = if stopped {
            outbound::STOP_TYPING
        } else {
            outbound::TYPING
        };
        let event = OutboundEvent::new(
            name,
            json!({ "conversationId": conversation_id, "userId": identity.user_id }),
        );
        self.channels
            .broadcast_topic(conversation_id, &event, Some(connection_id))
            .await;
        Ok(())
    }

    /// Resolve a requested page: default limit when absent, capped at the
    /// configured maximum, never zero.
    #[must_use]
    pub fn page(&self, before: Option<chrono::DateTime<Utc>>, limit: Option<u32>) -> MessagePage {
        let limit = limit
            .unwrap_or(self.settings.page_default)
            .clamp(1, self.settings.page_max.max(1));
        MessagePage { before, limit }
    }

    fn validate_content(&self, content: &str) -> Result<(), HubError> {
        if content.trim().is_empty() {
            return Err(HubError::Validation(
                "Message content is required".to_string(),
            ));
        }
        if content.chars().count() > self.settings.max_message_length {
            return Err(HubError::Validation(format!(
                "Message exceeds {} characters",
                self.settings.max_message_length
            )));
        }
        Ok(())
    }

    async fn member_conversation(
        &self,
        conversation_id: &str,
        user_id: &str,
    ) -> Result<Conversation, HubError> {
        let conversation = self
            .conversations
            .find_by_id(conversation_id)
            .await?
            .ok_or_else(|| HubError::NotFound("Conversation not found".to_string()))?;

        if !conversation.is_member(user_id) {
            return Err(HubError::Authorization(
                "Not a member of this conversation".to_string(),
            ));
        }
        Ok(conversation)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::models::{MessageKind, MessageStatus};
    use crate::repositories::memory::MemoryStore;
    use common::types::Role;
    use tokio::sync::mpsc;

    const SETTINGS: ChatSettings = ChatSettings {
        max_message_length: 4000,
        page_default: 50,
        page_max: 200,
    };

    async fn service() -> (ChatService, MemoryStore, Arc<ChannelHub>) {
        let store = MemoryStore::new();
        store
            .conversations()
            .insert(Conversation {
                id: "C1".to_string(),
                members: vec!["S".to_string(), "R".to_string()],
                last_message: None,
                updated_at: Utc::now(),
            })
            .await;
        let channels = ChannelHub::new(32);
        let service = ChatService::new(
            store.conversations(),
            store.messages(),
            Arc::clone(&channels),
            SETTINGS,
        );
        (service, store, channels)
    }

    fn send(sender: &str, content: &str) -> SendMessagePayload {
        SendMessagePayload {
            conversation_id: "C1".to_string(),
            sender_id: sender.to_string(),
            content: content.to_string(),
            kind: MessageKind::Text,
        }
    }

    fn history(limit: Option<u32>) -> GetMessagesPayload {
        GetMessagesPayload {
            conversation_id: "C1".to_string(),
            before: None,
            limit,
        }
    }

    fn drain(rx: &mut mpsc::Receiver<OutboundEvent>) -> Vec<&'static str> {
        let mut names = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            names.push(ev.event);
        }
        names
    }

    #[tokio::test]
    async fn test_send_then_history_returns_message_last() {
        let (chat, store, _channels) = service().await;
        let sender = Identity::new("S", Role::User);

        chat.send_message(&sender, send("S", "first")).await.unwrap();
        let sent = chat.send_message(&sender, send("S", "hello")).await.unwrap();

        let messages = chat.get_messages(&sender, &history(None)).await.unwrap();
        let last = messages.last().unwrap();
        assert_eq!(last.id, sent.id);
        assert_eq!(last.read_by, vec!["S".to_string()]);
        assert_eq!(last.status, MessageStatus::Sent);

        let summary = store.conversations().get("C1").await.unwrap();
        assert_eq!(summary.last_message.as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn test_mark_seen_sets_read_and_is_idempotent() {
        let (chat, _store, _channels) = service().await;
        let sender = Identity::new("S", Role::User);
        let reader = Identity::new("R", Role::Doctor);

        chat.send_message(&sender, send("S", "hello")).await.unwrap();

        assert_eq!(chat.mark_seen(&reader, "C1").await.unwrap(), 1);
        assert_eq!(chat.mark_seen(&reader, "C1").await.unwrap(), 0);

        let messages = chat.get_messages(&reader, &history(None)).await.unwrap();
        let message = messages.first().unwrap();
        assert_eq!(message.status, MessageStatus::Read);
        assert_eq!(message.read_by, vec!["S".to_string(), "R".to_string()]);
    }

    #[tokio::test]
    async fn test_sender_must_match_identity_and_membership() {
        let (chat, store, _channels) = service().await;

        let result = chat
            .send_message(&Identity::new("S", Role::User), send("R", "spoofed"))
            .await;
        assert!(matches!(result, Err(HubError::Authorization(_))));

        let result = chat
            .send_message(&Identity::new("X", Role::User), send("X", "intruder"))
            .await;
        assert!(matches!(result, Err(HubError::Authorization(_))));

        assert_eq!(store.messages().count().await, 0);
    }

    #[tokio::test]
    async fn test_content_limits() {
        let (chat, _store, _channels) = service().await;
        let sender = Identity::new("S", Role::User);

        let result = chat.send_message(&sender, send("S", "   ")).await;
        assert!(matches!(result, Err(HubError::Validation(_))));

        let too_long = "x".repeat(4001);
        let result = chat.send_message(&sender, send("S", &too_long)).await;
        assert!(matches!(result, Err(HubError::Validation(_))));

        let at_limit = "x".repeat(4000);
        assert!(chat.send_message(&sender, send("S", &at_limit)).await.is_ok());
    }

    #[tokio::test]
    async fn test_persistence_failure_broadcasts_nothing() {
        let (chat, store, channels) = service().await;
        let (_conn, mut rx) = channels.register(Some(Identity::new("S", Role::User))).await;
        store.messages().set_fail_creates(true);

        let result = chat
            .send_message(&Identity::new("S", Role::User), send("S", "hello"))
            .await;
        assert!(matches!(result, Err(HubError::Persistence(_))));
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_summary_failure_is_not_fatal() {
        let (chat, store, _channels) = service().await;
        store.conversations().set_fail_summary_updates(true);

        let result = chat
            .send_message(&Identity::new("S", Role::User), send("S", "hello"))
            .await;
        assert!(result.is_ok());
        assert_eq!(store.messages().count().await, 1);
    }

    #[tokio::test]
    async fn test_broadcast_reaches_topic_and_sender_devices_once() {
        let (chat, _store, channels) = service().await;
        let (sender_conn, mut sender_rx) =
            channels.register(Some(Identity::new("S", Role::User))).await;
        let (_sender_phone, mut phone_rx) =
            channels.register(Some(Identity::new("S", Role::User))).await;
        let (reader_conn, mut reader_rx) =
            channels.register(Some(Identity::new("R", Role::Doctor))).await;
        channels.subscribe(sender_conn, "C1").await;
        channels.subscribe(reader_conn, "C1").await;

        chat.send_message(&Identity::new("S", Role::User), send("S", "hello"))
            .await
            .unwrap();

        assert_eq!(drain(&mut sender_rx), vec![outbound::MESSAGE]);
        assert_eq!(drain(&mut phone_rx), vec![outbound::MESSAGE]);
        assert_eq!(drain(&mut reader_rx), vec![outbound::MESSAGE]);
    }

    #[tokio::test]
    async fn test_typing_requires_topic_and_skips_sender() {
        let (chat, _store, channels) = service().await;
        let (s_conn, mut s_rx) = channels.register(Some(Identity::new("S", Role::User))).await;
        let (r_conn, mut r_rx) = channels.register(Some(Identity::new("R", Role::Doctor))).await;
        let sender = Identity::new("S", Role::User);

        let result = chat.typing(&sender, s_conn, "C1", false).await;
        assert!(matches!(result, Err(HubError::Authorization(_))));

        channels.subscribe(s_conn, "C1").await;
        channels.subscribe(r_conn, "C1").await;
        chat.typing(&sender, s_conn, "C1", false).await.unwrap();
        chat.typing(&sender, s_conn, "C1", true).await.unwrap();

        assert!(drain(&mut s_rx).is_empty());
        assert_eq!(
            drain(&mut r_rx),
            vec![outbound::TYPING, outbound::STOP_TYPING]
        );
    }

    #[tokio::test]
    async fn test_page_limits() {
        let (chat, _store, _channels) = service().await;
        assert_eq!(chat.page(None, None).limit, 50);
        assert_eq!(chat.page(None, Some(10)).limit, 10);
        assert_eq!(chat.page(None, Some(10_000)).limit, 200);
        assert_eq!(chat.page(None, Some(0)).limit, 1);
    }
}
