//! Domain records the hub reads and writes through its repositories.
//!
//! Wire names are camelCase to match the client protocol.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// =============================================================================
// Appointments
// =============================================================================

/// Appointment status as stored by the booking system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppointmentStatus {
    Booked,
    Cancelled,
    Completed,
}

impl AppointmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppointmentStatus::Booked => "booked",
            AppointmentStatus::Cancelled => "cancelled",
            AppointmentStatus::Completed => "completed",
        }
    }
}

impl fmt::Display for AppointmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AppointmentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "booked" => Ok(AppointmentStatus::Booked),
            "cancelled" => Ok(AppointmentStatus::Cancelled),
            "completed" => Ok(AppointmentStatus::Completed),
            other => Err(format!("unknown appointment status '{other}'")),
        }
    }
}

/// An appointment. Its id doubles as the call room id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Appointment {
    pub id: String,
    pub doctor_id: String,
    pub user_id: String,
    pub appointment_status: AppointmentStatus,
    pub call_start_time: Option<DateTime<Utc>>,
    pub call_end_time: Option<DateTime<Utc>>,
}

impl Appointment {
    /// Whether `user_id` is the doctor or the patient on this appointment.
    pub fn is_party(&self, user_id: &str) -> bool {
        self.doctor_id == user_id || self.user_id == user_id
    }

    /// The other party, if `user_id` is one of them.
    pub fn counterpart(&self, user_id: &str) -> Option<&str> {
        if self.doctor_id == user_id {
            Some(&self.user_id)
        } else if self.user_id == user_id {
            Some(&self.doctor_id)
        } else {
            None
        }
    }
}

/// Partial update applied in a single write. `None` leaves a field as is.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppointmentUpdate {
    pub call_start_time: Option<DateTime<Utc>>,
    pub call_end_time: Option<DateTime<Utc>>,
    pub appointment_status: Option<AppointmentStatus>,
}

impl AppointmentUpdate {
    pub fn call_started(at: DateTime<Utc>) -> Self {
        Self {
            call_start_time: Some(at),
            ..Self::default()
        }
    }

    pub fn call_completed(at: DateTime<Utc>) -> Self {
        Self {
            call_end_time: Some(at),
            appointment_status: Some(AppointmentStatus::Completed),
            ..Self::default()
        }
    }

    pub fn apply_to(&self, appointment: &mut Appointment) {
        if let Some(at) = self.call_start_time {
            appointment.call_start_time = Some(at);
        }
        if let Some(at) = self.call_end_time {
            appointment.call_end_time = Some(at);
        }
        if let Some(status) = self.appointment_status {
            appointment.appointment_status = status;
        }
    }
}

// =============================================================================
// Conversations and messages
// =============================================================================

/// A two-party conversation. Owned by the CRUD side; the hub only updates
/// its last-message summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    pub members: Vec<String>,
    pub last_message: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    pub fn is_member(&self, user_id: &str) -> bool {
        self.members.iter().any(|m| m == user_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    #[default]
    Text,
    File,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Text => "text",
            MessageKind::File => "file",
        }
    }
}

impl FromStr for MessageKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(MessageKind::Text),
            "file" => Ok(MessageKind::File),
            other => Err(format!("unknown message type '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Sent,
    Read,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Sent => "sent",
            MessageStatus::Read => "read",
        }
    }
}

impl FromStr for MessageStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sent" => Ok(MessageStatus::Sent),
            "read" => Ok(MessageStatus::Read),
            other => Err(format!("unknown message status '{other}'")),
        }
    }
}

/// A persisted chat message. Content never changes; `read_by` only grows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub content: String,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub timestamp: DateTime<Utc>,
    pub read_by: Vec<String>,
    pub status: MessageStatus,
}

impl ChatMessage {
    /// Build a freshly sent message: read by its sender only.
    pub fn new_sent(
        conversation_id: &str,
        sender_id: &str,
        content: &str,
        kind: MessageKind,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            conversation_id: conversation_id.to_string(),
            sender_id: sender_id.to_string(),
            content: content.to_string(),
            kind,
            timestamp,
            read_by: vec![sender_id.to_string()],
            status: MessageStatus::Sent,
        }
    }

    /// Whether `mark_seen` by `reader_id` changes this message.
    pub fn is_unseen_by(&self, reader_id: &str) -> bool {
        self.sender_id != reader_id && !self.read_by.iter().any(|r| r == reader_id)
    }
}

/// Cursor page for message history: the newest `limit` messages strictly
/// older than `before` (or the newest overall when `before` is `None`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessagePage {
    pub before: Option<DateTime<Utc>>,
    pub limit: u32,
}

// =============================================================================
// Notifications
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NotificationKind {
    Appointment,
    Payment,
    Blog,
    Add,
    NewConnection,
    Common,
    ReportAnalysis,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::Appointment => "appointment",
            NotificationKind::Payment => "payment",
            NotificationKind::Blog => "blog",
            NotificationKind::Add => "add",
            NotificationKind::NewConnection => "newConnection",
            NotificationKind::Common => "common",
            NotificationKind::ReportAnalysis => "reportAnalysis",
        }
    }
}

impl FromStr for NotificationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "appointment" => Ok(NotificationKind::Appointment),
            "payment" => Ok(NotificationKind::Payment),
            "blog" => Ok(NotificationKind::Blog),
            "add" => Ok(NotificationKind::Add),
            "newConnection" => Ok(NotificationKind::NewConnection),
            "common" => Ok(NotificationKind::Common),
            "reportAnalysis" => Ok(NotificationKind::ReportAnalysis),
            other => Err(format!("unknown notification type '{other}'")),
        }
    }
}

/// A persisted notification. Only `is_read` changes after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: String,
    pub user_id: String,
    pub message: String,
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    pub is_read: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mention: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A validated notification ready to persist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewNotification {
    pub user_id: String,
    pub message: String,
    pub kind: NotificationKind,
    pub is_read: bool,
    pub link: Option<String>,
    pub mention: Option<String>,
}

impl NewNotification {
    pub fn into_record(self, created_at: DateTime<Utc>) -> Notification {
        Notification {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: self.user_id,
            message: self.message,
            kind: self.kind,
            is_read: self.is_read,
            link: self.link,
            mention: self.mention,
            created_at,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn appointment() -> Appointment {
        Appointment {
            id: "A1".to_string(),
            doctor_id: "D".to_string(),
            user_id: "P".to_string(),
            appointment_status: AppointmentStatus::Booked,
            call_start_time: None,
            call_end_time: None,
        }
    }

    #[test]
    fn test_counterpart() {
        let appt = appointment();
        assert_eq!(appt.counterpart("D"), Some("P"));
        assert_eq!(appt.counterpart("P"), Some("D"));
        assert_eq!(appt.counterpart("X"), None);
        assert!(!appt.is_party("X"));
    }

    #[test]
    fn test_completed_update_sets_status_and_end_time() {
        let mut appt = appointment();
        let now = Utc::now();

        AppointmentUpdate::call_completed(now).apply_to(&mut appt);

        assert_eq!(appt.appointment_status, AppointmentStatus::Completed);
        assert_eq!(appt.call_end_time, Some(now));
        assert_eq!(appt.call_start_time, None);
    }

    #[test]
    fn test_chat_message_wire_shape() {
        let msg = ChatMessage::new_sent("C1", "S", "hello", MessageKind::Text, Utc::now());
        let json = serde_json::to_value(&msg).unwrap();

        assert_eq!(json["conversationId"], "C1");
        assert_eq!(json["senderId"], "S");
        assert_eq!(json["type"], "text");
        assert_eq!(json["status"], "sent");
        assert_eq!(json["readBy"], serde_json::json!(["S"]));
    }

    #[test]
    fn test_is_unseen_by() {
        let msg = ChatMessage::new_sent("C1", "S", "hello", MessageKind::Text, Utc::now());
        assert!(msg.is_unseen_by("R"));
        assert!(!msg.is_unseen_by("S"));
    }

    #[test]
    fn test_notification_kind_round_trips_camel_case() {
        for kind in [
            NotificationKind::NewConnection,
            NotificationKind::ReportAnalysis,
            NotificationKind::Common,
        ] {
            let wire = serde_json::to_string(&kind).unwrap();
            assert_eq!(wire, format!("\"{}\"", kind.as_str()));
            assert_eq!(kind.as_str().parse::<NotificationKind>().unwrap(), kind);
        }
    }
}
