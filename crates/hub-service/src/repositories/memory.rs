//! In-memory repositories.
//!
//! Back the hub when `DATABASE_URL` is unset and in tests. Failure switches
//! let tests exercise the fail-closed paths without a database.

use super::{
    AppointmentRepository, ConversationRepository, MessageRepository, NotificationRepository,
};
use crate::errors::HubError;
use crate::models::{
    Appointment, AppointmentUpdate, ChatMessage, Conversation, MessagePage, MessageStatus,
    Notification,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Shared in-memory store for all four collaborators.
#[derive(Clone, Default)]
pub struct MemoryStore {
    appointments: Arc<MemoryAppointments>,
    conversations: Arc<MemoryConversations>,
    messages: Arc<MemoryMessages>,
    notifications: Arc<MemoryNotifications>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn appointments(&self) -> Arc<MemoryAppointments> {
        Arc::clone(&self.appointments)
    }

    pub fn conversations(&self) -> Arc<MemoryConversations> {
        Arc::clone(&self.conversations)
    }

    pub fn messages(&self) -> Arc<MemoryMessages> {
        Arc::clone(&self.messages)
    }

    pub fn notifications(&self) -> Arc<MemoryNotifications> {
        Arc::clone(&self.notifications)
    }
}

fn injected(op: &str) -> HubError {
    HubError::Persistence(format!("injected failure: {op}"))
}

// ============================================================================
// Appointments
// ============================================================================

#[derive(Default)]
pub struct MemoryAppointments {
    rows: RwLock<HashMap<String, Appointment>>,
    fail_updates: AtomicBool,
}

impl MemoryAppointments {
    pub async fn insert(&self, appointment: Appointment) {
        self.rows
            .write()
            .await
            .insert(appointment.id.clone(), appointment);
    }

    pub async fn get(&self, id: &str) -> Option<Appointment> {
        self.rows.read().await.get(id).cloned()
    }

    /// Make every subsequent `update` fail.
    pub fn set_fail_updates(&self, fail: bool) {
        self.fail_updates.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl AppointmentRepository for MemoryAppointments {
    async fn find_by_id(&self, id: &str) -> Result<Option<Appointment>, HubError> {
        Ok(self.get(id).await)
    }

    async fn update(&self, id: &str, update: AppointmentUpdate) -> Result<(), HubError> {
        if self.fail_updates.load(Ordering::SeqCst) {
            return Err(injected("update_appointment"));
        }
        let mut rows = self.rows.write().await;
        let appointment = rows
            .get_mut(id)
            .ok_or_else(|| HubError::NotFound("Appointment not found".to_string()))?;
        update.apply_to(appointment);
        Ok(())
    }
}

// ============================================================================
// Conversations
// ============================================================================

#[derive(Default)]
pub struct MemoryConversations {
    rows: RwLock<HashMap<String, Conversation>>,
    fail_summary_updates: AtomicBool,
}

impl MemoryConversations {
    pub async fn insert(&self, conversation: Conversation) {
        self.rows
            .write()
            .await
            .insert(conversation.id.clone(), conversation);
    }

    pub async fn get(&self, id: &str) -> Option<Conversation> {
        self.rows.read().await.get(id).cloned()
    }

    /// Make every subsequent `record_last_message` fail.
    pub fn set_fail_summary_updates(&self, fail: bool) {
        self.fail_summary_updates.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl ConversationRepository for MemoryConversations {
    async fn find_by_id(&self, id: &str) -> Result<Option<Conversation>, HubError> {
        Ok(self.get(id).await)
    }

    async fn record_last_message(
        &self,
        id: &str,
        content: &str,
        at: DateTime<Utc>,
    ) -> Result<(), HubError> {
        if self.fail_summary_updates.load(Ordering::SeqCst) {
            return Err(injected("record_last_message"));
        }
        let mut rows = self.rows.write().await;
        if let Some(conversation) = rows.get_mut(id) {
            conversation.last_message = Some(content.to_string());
            conversation.updated_at = at;
        }
        Ok(())
    }
}

// ============================================================================
// Messages
// ============================================================================

#[derive(Default)]
pub struct MemoryMessages {
    /// Insertion order; ties on timestamp keep this order.
    rows: RwLock<Vec<ChatMessage>>,
    fail_creates: AtomicBool,
}

impl MemoryMessages {
    /// Make every subsequent `create` fail.
    pub fn set_fail_creates(&self, fail: bool) {
        self.fail_creates.store(fail, Ordering::SeqCst);
    }

    pub async fn count(&self) -> usize {
        self.rows.read().await.len()
    }
}

#[async_trait]
impl MessageRepository for MemoryMessages {
    async fn create(&self, message: &ChatMessage) -> Result<(), HubError> {
        if self.fail_creates.load(Ordering::SeqCst) {
            return Err(injected("create_message"));
        }
        self.rows.write().await.push(message.clone());
        Ok(())
    }

    async fn list_by_conversation(
        &self,
        conversation_id: &str,
        page: MessagePage,
    ) -> Result<Vec<ChatMessage>, HubError> {
        let rows = self.rows.read().await;
        let mut matching: Vec<ChatMessage> = rows
            .iter()
            .filter(|m| m.conversation_id == conversation_id)
            .filter(|m| page.before.map_or(true, |before| m.timestamp < before))
            .cloned()
            .collect();
        matching.sort_by_key(|m| m.timestamp);

        let limit = usize::try_from(page.limit).unwrap_or(usize::MAX);
        let skip = matching.len().saturating_sub(limit);
        Ok(matching.into_iter().skip(skip).collect())
    }

    async fn mark_seen(&self, conversation_id: &str, reader_id: &str) -> Result<u64, HubError> {
        let mut rows = self.rows.write().await;
        let mut changed = 0;
        for message in rows
            .iter_mut()
            .filter(|m| m.conversation_id == conversation_id && m.is_unseen_by(reader_id))
        {
            message.read_by.push(reader_id.to_string());
            message.status = MessageStatus::Read;
            changed += 1;
        }
        Ok(changed)
    }
}

// ============================================================================
// Notifications
// ============================================================================

#[derive(Default)]
pub struct MemoryNotifications {
    rows: RwLock<Vec<Notification>>,
}

#[async_trait]
impl NotificationRepository for MemoryNotifications {
    async fn create(&self, notification: &Notification) -> Result<(), HubError> {
        self.rows.write().await.push(notification.clone());
        Ok(())
    }

    async fn list_for_user(
        &self,
        user_id: &str,
        limit: u32,
    ) -> Result<Vec<Notification>, HubError> {
        let rows = self.rows.read().await;
        let limit = usize::try_from(limit).unwrap_or(usize::MAX);
        Ok(rows
            .iter()
            .rev()
            .filter(|n| n.user_id == user_id)
            .take(limit)
            .cloned()
            .collect())
    }
}
