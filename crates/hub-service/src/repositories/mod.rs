//! Repository layer: the hub's only view of durable state.
//!
//! Each collaborator is a narrow async trait so the actors and services can
//! run against Postgres in production and the in-memory store in tests and
//! database-less development.

pub mod appointments;
pub mod conversations;
pub mod memory;
pub mod messages;
pub mod notifications;

use crate::errors::HubError;
use crate::models::{
    Appointment, AppointmentUpdate, ChatMessage, Conversation, MessagePage, Notification,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use std::sync::Arc;

pub use appointments::PgAppointmentRepository;
pub use conversations::PgConversationRepository;
pub use memory::MemoryStore;
pub use messages::PgMessageRepository;
pub use notifications::PgNotificationRepository;

/// Appointment collaborator. The hub reads appointments and writes only
/// call timestamps and completion status.
#[async_trait]
pub trait AppointmentRepository: Send + Sync {
    async fn find_by_id(&self, id: &str) -> Result<Option<Appointment>, HubError>;

    /// Apply `update` in a single write.
    async fn update(&self, id: &str, update: AppointmentUpdate) -> Result<(), HubError>;
}

/// Conversation collaborator.
#[async_trait]
pub trait ConversationRepository: Send + Sync {
    async fn find_by_id(&self, id: &str) -> Result<Option<Conversation>, HubError>;

    /// Update the denormalized last-message summary.
    async fn record_last_message(
        &self,
        id: &str,
        content: &str,
        at: DateTime<Utc>,
    ) -> Result<(), HubError>;
}

/// Chat message store.
#[async_trait]
pub trait MessageRepository: Send + Sync {
    async fn create(&self, message: &ChatMessage) -> Result<(), HubError>;

    /// The newest `page.limit` messages older than `page.before`, in
    /// ascending timestamp order.
    async fn list_by_conversation(
        &self,
        conversation_id: &str,
        page: MessagePage,
    ) -> Result<Vec<ChatMessage>, HubError>;

    /// Add `reader_id` to `read_by` and set status `read` on every message in
    /// the conversation not sent by and not yet read by the reader.
    ///
    /// Returns the number of messages changed.
    async fn mark_seen(&self, conversation_id: &str, reader_id: &str) -> Result<u64, HubError>;
}

/// Notification store.
#[async_trait]
pub trait NotificationRepository: Send + Sync {
    async fn create(&self, notification: &Notification) -> Result<(), HubError>;

    /// Notifications for a user, newest first.
    async fn list_for_user(&self, user_id: &str, limit: u32)
        -> Result<Vec<Notification>, HubError>;
}

/// The set of collaborators the hub runs against.
#[derive(Clone)]
pub struct Repositories {
    pub appointments: Arc<dyn AppointmentRepository>,
    pub conversations: Arc<dyn ConversationRepository>,
    pub messages: Arc<dyn MessageRepository>,
    pub notifications: Arc<dyn NotificationRepository>,
}

impl Repositories {
    /// Postgres-backed repositories sharing one pool.
    pub fn postgres(pool: PgPool) -> Self {
        Self {
            appointments: Arc::new(PgAppointmentRepository::new(pool.clone())),
            conversations: Arc::new(PgConversationRepository::new(pool.clone())),
            messages: Arc::new(PgMessageRepository::new(pool.clone())),
            notifications: Arc::new(PgNotificationRepository::new(pool)),
        }
    }

    /// In-memory repositories over a shared store.
    pub fn in_memory(store: &MemoryStore) -> Self {
        Self {
            appointments: store.appointments(),
            conversations: store.conversations(),
            messages: store.messages(),
            notifications: store.notifications(),
        }
    }
}
