//! Wire protocol: JSON text frames of the form `{"event": "<name>", "data": ...}`.
//!
//! Inbound frames decode into [`InboundEvent`]; everything the hub sends is an
//! [`OutboundEvent`]. Signaling payloads are carried as opaque JSON.

use crate::errors::HubError;
use crate::models::{MessageKind, NewNotification, NotificationKind};

use chrono::{DateTime, Utc};
use common::types::Role;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// Inbound event names.
pub mod inbound {
    pub const JOIN: &str = "join";
    pub const LEAVE: &str = "leave";
    pub const SEND_NOTIFICATION: &str = "sendNotification";
    pub const SEND_MESSAGE: &str = "sendMessage";
    pub const MARK_SEEN: &str = "markSeen";
    pub const GET_MESSAGES: &str = "getMessages";
    pub const TYPING: &str = "typing";
    pub const STOP_TYPING: &str = "stopTyping";
    pub const JOIN_VIDEO_CALL: &str = "joinVideoCall";
    pub const VIDEO_CALL_SEND_MESSAGE: &str = "videoCall:sendMessage";
    pub const USER_CALL: &str = "user:call";
    pub const CALL_ACCEPTED: &str = "call:accepted";
    pub const PEER_NEGO_NEEDED: &str = "peer:nego:needed";
    pub const PEER_NEGO_DONE: &str = "peer:nego:done";
    pub const ICE_CANDIDATE: &str = "ice:candidate";
    pub const MUTE: &str = "mute";
    pub const LEAVE_CALL: &str = "leaveCall";
}

/// Outbound event names.
pub mod outbound {
    pub const CONNECTED: &str = "connected";
    pub const JOINED: &str = "joined";
    pub const LEFT: &str = "left";
    pub const NOTIFICATION: &str = "notification";
    pub const MESSAGE: &str = "message";
    pub const MESSAGES: &str = "messages";
    pub const MESSAGE_SEEN: &str = "messageSeen";
    pub const TYPING: &str = "typing";
    pub const STOP_TYPING: &str = "stopTyping";
    pub const JOINED_VIDEO_CALL: &str = "joinedVideoCall";
    pub const USER_JOINED: &str = "user:joined";
    pub const START_CALL: &str = "startCall";
    pub const INCOMING_CALL: &str = "incomming:call";
    pub const CALL_ACCEPTED: &str = "call:accepted";
    pub const PEER_NEGO_NEEDED: &str = "peer:nego:needed";
    pub const PEER_NEGO_FINAL: &str = "peer:nego:final";
    pub const ICE_CANDIDATE: &str = "ice:candidate";
    pub const MUTE: &str = "mute";
    pub const VIDEO_CALL_MESSAGE: &str = "videoCall:message";
    pub const DOCTOR_LEFT: &str = "doctorLeft";
    pub const USER_LEFT: &str = "userLeft";
    pub const LEAVE_FORCED: &str = "leaveForced";
    pub const CALL_ENDED: &str = "callEnded";
    pub const ERROR: &str = "error";
}

/// Raw frame as it appears on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

/// An event queued for delivery to one connection.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundEvent {
    pub event: &'static str,
    pub data: Value,
}

impl OutboundEvent {
    pub fn new(event: &'static str, data: Value) -> Self {
        Self { event, data }
    }

    /// `error` event for the triggering connection.
    pub fn error(err: &HubError) -> Self {
        Self::new(
            outbound::ERROR,
            json!({ "code": err.error_code(), "message": err.client_message() }),
        )
    }

    /// Serialize as a text frame.
    pub fn to_text(&self) -> String {
        json!({ "event": self.event, "data": self.data }).to_string()
    }
}

// ============================================================================
// Inbound payloads
// ============================================================================

/// WebRTC signaling kinds and their outbound event names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    /// `user:call` -> `incomming:call`
    Offer,
    /// `call:accepted` -> `call:accepted`
    Answer,
    /// `peer:nego:needed` -> `peer:nego:needed`
    NegotiationNeeded,
    /// `peer:nego:done` -> `peer:nego:final`
    NegotiationDone,
    /// `ice:candidate` -> `ice:candidate`
    IceCandidate,
}

impl SignalKind {
    pub fn outbound_event(&self) -> &'static str {
        match self {
            SignalKind::Offer => outbound::INCOMING_CALL,
            SignalKind::Answer => outbound::CALL_ACCEPTED,
            SignalKind::NegotiationNeeded => outbound::PEER_NEGO_NEEDED,
            SignalKind::NegotiationDone => outbound::PEER_NEGO_FINAL,
            SignalKind::IceCandidate => outbound::ICE_CANDIDATE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessagePayload {
    pub conversation_id: String,
    pub sender_id: String,
    pub content: String,
    #[serde(rename = "type", default)]
    pub kind: MessageKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetMessagesPayload {
    pub conversation_id: String,
    #[serde(default)]
    pub before: Option<DateTime<Utc>>,
    #[serde(default)]
    pub limit: Option<u32>,
}

/// `sendNotification` as sent by clients. Validated into [`NewNotification`].
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationPayload {
    #[serde(default)]
    pub message: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub is_read: bool,
    #[serde(default)]
    pub link: Option<String>,
    #[serde(default)]
    pub mention: Option<String>,
}

impl NotificationPayload {
    /// Check required fields and the closed type enum.
    pub fn validate(self) -> Result<NewNotification, HubError> {
        if self.message.trim().is_empty() {
            return Err(HubError::Validation(
                "Notification message is required".to_string(),
            ));
        }
        if self.user_id.trim().is_empty() {
            return Err(HubError::Validation(
                "Notification userId is required".to_string(),
            ));
        }
        let kind: NotificationKind = self
            .kind
            .parse()
            .map_err(|_| HubError::Validation("Unknown notification type".to_string()))?;

        Ok(NewNotification {
            user_id: self.user_id,
            message: self.message,
            kind,
            is_read: self.is_read,
            link: self.link.filter(|l| !l.is_empty()),
            mention: self.mention.filter(|m| !m.is_empty()),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallMessagePayload {
    pub appointment_id: String,
    pub sender_id: String,
    pub content: String,
    #[serde(default)]
    pub sender_role: Option<Role>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MutePayload {
    pub appointment_id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub muted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaveCallPayload {
    pub appointment_id: String,
    #[serde(default)]
    pub role: Option<Role>,
    #[serde(default)]
    pub prescription_submitted: bool,
}

/// A decoded inbound event.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    Join { room_id: String },
    Leave { room_id: String },
    SendNotification(NotificationPayload),
    SendMessage(SendMessagePayload),
    MarkSeen { conversation_id: String },
    GetMessages(GetMessagesPayload),
    Typing { conversation_id: String },
    StopTyping { conversation_id: String },
    JoinVideoCall { appointment_id: String },
    CallMessage(CallMessagePayload),
    Signal {
        kind: SignalKind,
        to: String,
        /// Restricts the relay to one room when the client names it.
        appointment_id: Option<String>,
        /// Client payload without `to`; forwarded verbatim.
        payload: Map<String, Value>,
    },
    Mute(MutePayload),
    LeaveCall(LeaveCallPayload),
}

impl InboundEvent {
    /// Decode a text frame.
    pub fn decode(text: &str) -> Result<Self, HubError> {
        let envelope: Envelope = serde_json::from_str(text)
            .map_err(|_| HubError::Validation("Malformed frame".to_string()))?;
        Self::from_envelope(envelope)
    }

    pub fn from_envelope(envelope: Envelope) -> Result<Self, HubError> {
        let Envelope { event, data } = envelope;
        let event_name = event.as_str();
        let decoded = match event_name {
            inbound::JOIN => InboundEvent::Join {
                room_id: id_from(&data, &["roomId", "conversationId", "appointmentId", "id"])?,
            },
            inbound::LEAVE => InboundEvent::Leave {
                room_id: id_from(&data, &["roomId", "conversationId", "appointmentId", "id"])?,
            },
            inbound::SEND_NOTIFICATION => InboundEvent::SendNotification(payload(event_name, data)?),
            inbound::SEND_MESSAGE => InboundEvent::SendMessage(payload(event_name, data)?),
            inbound::MARK_SEEN => InboundEvent::MarkSeen {
                conversation_id: id_from(&data, &["conversationId"])?,
            },
            inbound::GET_MESSAGES => InboundEvent::GetMessages(payload(event_name, data)?),
            inbound::TYPING => InboundEvent::Typing {
                conversation_id: id_from(&data, &["conversationId"])?,
            },
            inbound::STOP_TYPING => InboundEvent::StopTyping {
                conversation_id: id_from(&data, &["conversationId"])?,
            },
            inbound::JOIN_VIDEO_CALL => InboundEvent::JoinVideoCall {
                appointment_id: id_from(&data, &["appointmentId"])?,
            },
            inbound::VIDEO_CALL_SEND_MESSAGE => InboundEvent::CallMessage(payload(event_name, data)?),
            inbound::USER_CALL => signal(SignalKind::Offer, data)?,
            inbound::CALL_ACCEPTED => signal(SignalKind::Answer, data)?,
            inbound::PEER_NEGO_NEEDED => signal(SignalKind::NegotiationNeeded, data)?,
            inbound::PEER_NEGO_DONE => signal(SignalKind::NegotiationDone, data)?,
            inbound::ICE_CANDIDATE => signal(SignalKind::IceCandidate, data)?,
            inbound::MUTE => InboundEvent::Mute(payload(event_name, data)?),
            inbound::LEAVE_CALL => InboundEvent::LeaveCall(payload(event_name, data)?),
            _ => {
                return Err(HubError::Validation("Unknown event".to_string()));
            }
        };
        Ok(decoded)
    }

    /// Event name for logs and metric labels.
    pub fn name(&self) -> &'static str {
        match self {
            InboundEvent::Join { .. } => inbound::JOIN,
            InboundEvent::Leave { .. } => inbound::LEAVE,
            InboundEvent::SendNotification(_) => inbound::SEND_NOTIFICATION,
            InboundEvent::SendMessage(_) => inbound::SEND_MESSAGE,
            InboundEvent::MarkSeen { .. } => inbound::MARK_SEEN,
            InboundEvent::GetMessages(_) => inbound::GET_MESSAGES,
            InboundEvent::Typing { .. } => inbound::TYPING,
            InboundEvent::StopTyping { .. } => inbound::STOP_TYPING,
            InboundEvent::JoinVideoCall { .. } => inbound::JOIN_VIDEO_CALL,
            InboundEvent::CallMessage(_) => inbound::VIDEO_CALL_SEND_MESSAGE,
            InboundEvent::Signal { kind, .. } => match kind {
                SignalKind::Offer => inbound::USER_CALL,
                SignalKind::Answer => inbound::CALL_ACCEPTED,
                SignalKind::NegotiationNeeded => inbound::PEER_NEGO_NEEDED,
                SignalKind::NegotiationDone => inbound::PEER_NEGO_DONE,
                SignalKind::IceCandidate => inbound::ICE_CANDIDATE,
            },
            InboundEvent::Mute(_) => inbound::MUTE,
            InboundEvent::LeaveCall(_) => inbound::LEAVE_CALL,
        }
    }
}

fn payload<T: serde::de::DeserializeOwned>(event: &str, data: Value) -> Result<T, HubError> {
    serde_json::from_value(data)
        .map_err(|_| HubError::Validation(format!("Invalid payload for {event}")))
}

/// Accept either a bare string id or an object carrying one of `keys`.
fn id_from(data: &Value, keys: &[&str]) -> Result<String, HubError> {
    let id = match data {
        Value::String(s) => Some(s.as_str()),
        Value::Object(map) => keys
            .iter()
            .find_map(|k| map.get(*k).and_then(Value::as_str)),
        _ => None,
    };
    id.map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .ok_or_else(|| HubError::Validation("Missing id".to_string()))
}

fn signal(kind: SignalKind, data: Value) -> Result<InboundEvent, HubError> {
    let Value::Object(mut map) = data else {
        return Err(HubError::Validation("Signaling payload must be an object".to_string()));
    };
    let to = map
        .remove("to")
        .and_then(|v| v.as_str().map(ToString::to_string))
        .filter(|s| !s.is_empty())
        .ok_or_else(|| HubError::Validation("Signaling payload requires 'to'".to_string()))?;
    let appointment_id = map
        .get("appointmentId")
        .and_then(Value::as_str)
        .map(ToString::to_string);
    // The hub stamps the sender itself
    map.remove("from");

    Ok(InboundEvent::Signal {
        kind,
        to,
        appointment_id,
        payload: map,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_join_accepts_string_and_object() {
        let a = InboundEvent::decode(r#"{"event":"join","data":"C1"}"#).unwrap();
        let b = InboundEvent::decode(r#"{"event":"join","data":{"conversationId":"C1"}}"#).unwrap();
        assert_eq!(a, InboundEvent::Join { room_id: "C1".to_string() });
        assert_eq!(a, b);
    }

    #[test]
    fn test_decode_send_message_defaults_type() {
        let event = InboundEvent::decode(
            r#"{"event":"sendMessage","data":{"conversationId":"C1","senderId":"S","content":"hi"}}"#,
        )
        .unwrap();
        let InboundEvent::SendMessage(p) = event else {
            unreachable!("expected sendMessage");
        };
        assert_eq!(p.kind, MessageKind::Text);
        assert_eq!(p.content, "hi");
    }

    #[test]
    fn test_decode_signal_strips_to_and_spoofed_from() {
        let event = InboundEvent::decode(
            r#"{"event":"user:call","data":{"to":"P","from":"mallory","offer":{"sdp":"v=0"}}}"#,
        )
        .unwrap();
        let InboundEvent::Signal {
            kind, to, payload, ..
        } = event
        else {
            unreachable!("expected signal");
        };
        assert_eq!(kind, SignalKind::Offer);
        assert_eq!(to, "P");
        assert!(!payload.contains_key("to"));
        assert!(!payload.contains_key("from"));
        assert_eq!(payload["offer"]["sdp"], "v=0");
    }

    #[test]
    fn test_decode_signal_without_target_rejected() {
        let err = InboundEvent::decode(r#"{"event":"ice:candidate","data":{"candidate":{}}}"#)
            .unwrap_err();
        assert!(matches!(err, HubError::Validation(_)));
    }

    #[test]
    fn test_decode_malformed_and_unknown() {
        assert!(matches!(
            InboundEvent::decode("not json"),
            Err(HubError::Validation(_))
        ));
        assert!(matches!(
            InboundEvent::decode(r#"{"event":"selfDestruct","data":{}}"#),
            Err(HubError::Validation(_))
        ));
    }

    #[test]
    fn test_decode_leave_call() {
        let event = InboundEvent::decode(
            r#"{"event":"leaveCall","data":{"appointmentId":"A1","role":"doctor","prescriptionSubmitted":true}}"#,
        )
        .unwrap();
        assert_eq!(
            event,
            InboundEvent::LeaveCall(LeaveCallPayload {
                appointment_id: "A1".to_string(),
                role: Some(Role::Doctor),
                prescription_submitted: true,
            })
        );
        assert_eq!(event.name(), "leaveCall");
    }

    #[test]
    fn test_notification_validation() {
        let ok = NotificationPayload {
            message: "Your appointment is confirmed".to_string(),
            kind: "appointment".to_string(),
            user_id: "U1".to_string(),
            is_read: false,
            link: Some(String::new()),
            mention: None,
        }
        .validate()
        .unwrap();
        assert_eq!(ok.kind, NotificationKind::Appointment);
        assert_eq!(ok.link, None);

        let bad_type = NotificationPayload {
            message: "hi".to_string(),
            kind: "spam".to_string(),
            user_id: "U1".to_string(),
            is_read: false,
            link: None,
            mention: None,
        };
        assert!(matches!(bad_type.validate(), Err(HubError::Validation(_))));

        let no_user = NotificationPayload {
            message: "hi".to_string(),
            kind: "common".to_string(),
            user_id: " ".to_string(),
            is_read: false,
            link: None,
            mention: None,
        };
        assert!(matches!(no_user.validate(), Err(HubError::Validation(_))));
    }

    #[test]
    fn test_error_event_shape() {
        let event = OutboundEvent::error(&HubError::NotFound("Appointment not found".to_string()));
        let frame: Value = serde_json::from_str(&event.to_text()).unwrap();
        assert_eq!(frame["event"], "error");
        assert_eq!(frame["data"]["code"], "NOT_FOUND");
        assert_eq!(frame["data"]["message"], "Appointment not found");
    }
}
