//! Inbound event dispatcher.
//!
//! Decodes each text frame, requires an identity, routes the event to the
//! owning component and turns every error into an `error` event for the
//! triggering connection only. No error closes the connection.
//!
//! Events from one connection are dispatched sequentially in arrival order
//! by the connection task in [`crate::ws`].

use crate::actors::RoomRegistryHandle;
use crate::channels::{ChannelHub, ConnectionId};
use crate::chat::{ChatService, ChatSettings};
use crate::errors::HubError;
use crate::notifications::NotificationService;
use crate::observability::metrics as prom;
use crate::protocol::{outbound, InboundEvent, OutboundEvent};
use crate::repositories::{AppointmentRepository, ConversationRepository, Repositories};
use crate::signaling::SignalingRelay;

use common::types::Identity;
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Metric label for frames that do not decode to a known event.
const UNDECODED_EVENT: &str = "unknown";

/// Per-connection state owned by the connection task.
#[derive(Debug)]
pub struct ConnectionContext {
    pub connection_id: ConnectionId,
    pub identity: Option<Identity>,
    /// Appointment ids this connection joined with `joinVideoCall`.
    joined_calls: BTreeSet<String>,
}

impl ConnectionContext {
    #[must_use]
    pub fn new(connection_id: ConnectionId, identity: Option<Identity>) -> Self {
        Self {
            connection_id,
            identity,
            joined_calls: BTreeSet::new(),
        }
    }

    #[must_use]
    pub fn joined_calls(&self) -> &BTreeSet<String> {
        &self.joined_calls
    }
}

/// Routes inbound events to the hub components.
#[derive(Clone)]
pub struct Dispatcher {
    channels: Arc<ChannelHub>,
    registry: RoomRegistryHandle,
    signaling: SignalingRelay,
    chat: Arc<ChatService>,
    notifications: Arc<NotificationService>,
    appointments: Arc<dyn AppointmentRepository>,
    conversations: Arc<dyn ConversationRepository>,
}

impl Dispatcher {
    #[must_use]
    pub fn new(
        repositories: &Repositories,
        channels: Arc<ChannelHub>,
        registry: RoomRegistryHandle,
        chat_settings: ChatSettings,
    ) -> Self {
        let chat = ChatService::new(
            Arc::clone(&repositories.conversations),
            Arc::clone(&repositories.messages),
            Arc::clone(&channels),
            chat_settings,
        );
        let notifications = NotificationService::new(
            Arc::clone(&repositories.notifications),
            Arc::clone(&channels),
        );

        Self {
            signaling: SignalingRelay::new(registry.clone()),
            registry,
            chat: Arc::new(chat),
            notifications: Arc::new(notifications),
            appointments: Arc::clone(&repositories.appointments),
            conversations: Arc::clone(&repositories.conversations),
            channels,
        }
    }

    #[must_use]
    pub fn notifications(&self) -> &NotificationService {
        &self.notifications
    }

    /// Handle one inbound text frame.
    pub async fn dispatch(&self, ctx: &mut ConnectionContext, text: &str) {
        let started = Instant::now();

        let (event_name, result) = match InboundEvent::decode(text) {
            Ok(event) => {
                let name = event.name();
                (name, self.handle(ctx, event).await)
            }
            Err(e) => (UNDECODED_EVENT, Err(e)),
        };

        let outcome = match &result {
            Ok(()) => "ok",
            Err(e) => e.outcome_label(),
        };
        prom::record_event(event_name, outcome, started.elapsed());

        if let Err(e) = result {
            match e {
                HubError::Persistence(_) | HubError::Internal(_) | HubError::RoomClosed => {
                    warn!(
                        target: "hub.ws",
                        connection_id = %ctx.connection_id,
                        event = event_name,
                        error = %e,
                        "Event failed"
                    );
                }
                _ => {
                    debug!(
                        target: "hub.ws",
                        connection_id = %ctx.connection_id,
                        event = event_name,
                        error = %e,
                        "Event rejected"
                    );
                }
            }
            self.channels
                .send_to_connection(ctx.connection_id, OutboundEvent::error(&e))
                .await;
        }
    }

    async fn handle(&self, ctx: &mut ConnectionContext, event: InboundEvent) -> Result<(), HubError> {
        let Some(identity) = ctx.identity.clone() else {
            return Err(HubError::Authentication(
                "Authentication required".to_string(),
            ));
        };
        let connection_id = ctx.connection_id;

        match event {
            InboundEvent::Join { room_id } => {
                self.authorize_topic(&identity, &room_id).await?;
                self.channels.subscribe(connection_id, &room_id).await;
                self.reply(connection_id, outbound::JOINED, json!({ "roomId": room_id }))
                    .await;
            }

            InboundEvent::Leave { room_id } => {
                self.channels.unsubscribe(connection_id, &room_id).await;
                self.reply(connection_id, outbound::LEFT, json!({ "roomId": room_id }))
                    .await;
            }

            InboundEvent::SendNotification(payload) => {
                self.notifications.send(payload).await?;
            }

            InboundEvent::SendMessage(payload) => {
                self.chat.send_message(&identity, payload).await?;
            }

            InboundEvent::MarkSeen { conversation_id } => {
                self.chat.mark_seen(&identity, &conversation_id).await?;
            }

            InboundEvent::GetMessages(payload) => {
                let messages = self.chat.get_messages(&identity, &payload).await?;
                self.reply(
                    connection_id,
                    outbound::MESSAGES,
                    json!({ "conversationId": payload.conversation_id, "messages": messages }),
                )
                .await;
            }

            InboundEvent::Typing { conversation_id } => {
                self.chat
                    .typing(&identity, connection_id, &conversation_id, false)
                    .await?;
            }

            InboundEvent::StopTyping { conversation_id } => {
                self.chat
                    .typing(&identity, connection_id, &conversation_id, true)
                    .await?;
            }

            InboundEvent::JoinVideoCall { appointment_id } => {
                self.registry
                    .join(&appointment_id, &identity.user_id, connection_id)
                    .await?;
                ctx.joined_calls.insert(appointment_id);
            }

            InboundEvent::CallMessage(payload) => {
                if payload.sender_id != identity.user_id {
                    return Err(HubError::Authorization(
                        "Sender does not match the authenticated user".to_string(),
                    ));
                }
                self.registry
                    .call_message(&payload.appointment_id, &identity.user_id, payload.content)
                    .await?;
            }

            InboundEvent::Signal {
                kind,
                to,
                appointment_id,
                payload,
            } => {
                self.signaling
                    .relay(
                        &ctx.joined_calls,
                        &identity.user_id,
                        kind,
                        &to,
                        appointment_id.as_deref(),
                        payload,
                    )
                    .await?;
            }

            InboundEvent::Mute(payload) => {
                self.registry
                    .mute(
                        &payload.appointment_id,
                        &identity.user_id,
                        &payload.kind,
                        payload.muted,
                    )
                    .await?;
            }

            InboundEvent::LeaveCall(payload) => {
                self.registry
                    .leave(
                        &payload.appointment_id,
                        &identity.user_id,
                        payload.role,
                        payload.prescription_submitted,
                    )
                    .await?;
                ctx.joined_calls.remove(&payload.appointment_id);
            }
        }

        Ok(())
    }

    /// Release everything a closed connection held. Idempotent.
    pub async fn disconnect(&self, ctx: &mut ConnectionContext) {
        for room_id in std::mem::take(&mut ctx.joined_calls) {
            if let Err(e) = self.registry.disconnect(&room_id, ctx.connection_id).await {
                warn!(
                    target: "hub.ws",
                    connection_id = %ctx.connection_id,
                    room_id = %room_id,
                    error = %e,
                    "Call cleanup failed on disconnect"
                );
            }
        }
        self.channels.unregister(ctx.connection_id).await;
    }

    /// A topic is a conversation the caller belongs to or an appointment the
    /// caller is party to.
    async fn authorize_topic(&self, identity: &Identity, topic: &str) -> Result<(), HubError> {
        if let Some(conversation) = self.conversations.find_by_id(topic).await? {
            return if conversation.is_member(&identity.user_id) {
                Ok(())
            } else {
                Err(HubError::Authorization(
                    "Not a member of this conversation".to_string(),
                ))
            };
        }

        match self.appointments.find_by_id(topic).await? {
            Some(appointment) if appointment.is_party(&identity.user_id) => Ok(()),
            Some(_) => Err(HubError::Authorization(
                "Not a participant in this appointment".to_string(),
            )),
            None => Err(HubError::NotFound("Room not found".to_string())),
        }
    }

    async fn reply(&self, connection_id: ConnectionId, event: &'static str, data: serde_json::Value) {
        self.channels
            .send_to_connection(connection_id, OutboundEvent::new(event, data))
            .await;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::actors::{ActorMetrics, RoomDeps, RoomSettings};
    use crate::models::{Appointment, AppointmentStatus, Conversation};
    use crate::repositories::memory::MemoryStore;
    use common::types::Role;
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct Fixture {
        dispatcher: Dispatcher,
        channels: Arc<ChannelHub>,
        store: MemoryStore,
    }

    async fn fixture() -> Fixture {
        let store = MemoryStore::new();
        store
            .appointments()
            .insert(Appointment {
                id: "A1".to_string(),
                doctor_id: "D".to_string(),
                user_id: "P".to_string(),
                appointment_status: AppointmentStatus::Booked,
                call_start_time: None,
                call_end_time: None,
            })
            .await;
        store
            .conversations()
            .insert(Conversation {
                id: "C1".to_string(),
                members: vec!["D".to_string(), "P".to_string()],
                last_message: None,
                updated_at: chrono::Utc::now(),
            })
            .await;

        let repositories = Repositories::in_memory(&store);
        let channels = ChannelHub::new(32);
        let registry = RoomRegistryHandle::new(
            RoomDeps {
                appointments: Arc::clone(&repositories.appointments),
                channels: Arc::clone(&channels),
                settings: RoomSettings {
                    idle_timeout: Duration::from_secs(7200),
                    reaper_interval: Duration::from_secs(60),
                },
            },
            ActorMetrics::new(),
        );
        let dispatcher = Dispatcher::new(
            &repositories,
            Arc::clone(&channels),
            registry,
            ChatSettings {
                max_message_length: 4000,
                page_default: 50,
                page_max: 200,
            },
        );

        Fixture {
            dispatcher,
            channels,
            store,
        }
    }

    async fn connect(
        f: &Fixture,
        identity: Option<Identity>,
    ) -> (ConnectionContext, mpsc::Receiver<OutboundEvent>) {
        let (id, rx) = f.channels.register(identity.clone()).await;
        (ConnectionContext::new(id, identity), rx)
    }

    fn drain(rx: &mut mpsc::Receiver<OutboundEvent>) -> Vec<OutboundEvent> {
        let mut events = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            events.push(ev);
        }
        events
    }

    fn names(events: &[OutboundEvent]) -> Vec<&'static str> {
        events.iter().map(|e| e.event).collect()
    }

    #[tokio::test]
    async fn test_anonymous_connection_gets_unauthenticated_error() {
        let f = fixture().await;
        let (mut ctx, mut rx) = connect(&f, None).await;

        f.dispatcher
            .dispatch(&mut ctx, r#"{"event":"join","data":"C1"}"#)
            .await;

        let events = drain(&mut rx);
        assert_eq!(names(&events), vec![outbound::ERROR]);
        assert_eq!(events.first().unwrap().data["code"], "UNAUTHENTICATED");
        assert!(!f.channels.is_subscribed(ctx.connection_id, "C1").await);
    }

    #[tokio::test]
    async fn test_malformed_and_unknown_frames_produce_invalid_request() {
        let f = fixture().await;
        let (mut ctx, mut rx) = connect(&f, Some(Identity::new("D", Role::Doctor))).await;

        f.dispatcher.dispatch(&mut ctx, "not json").await;
        f.dispatcher
            .dispatch(&mut ctx, r#"{"event":"nope","data":{}}"#)
            .await;

        let events = drain(&mut rx);
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.data["code"] == "INVALID_REQUEST"));
    }

    #[tokio::test]
    async fn test_join_topic_requires_membership() {
        let f = fixture().await;
        let (mut member, mut member_rx) = connect(&f, Some(Identity::new("P", Role::User))).await;
        let (mut outsider, mut outsider_rx) =
            connect(&f, Some(Identity::new("X", Role::User))).await;

        f.dispatcher
            .dispatch(&mut member, r#"{"event":"join","data":"C1"}"#)
            .await;
        f.dispatcher
            .dispatch(&mut outsider, r#"{"event":"join","data":{"roomId":"C1"}}"#)
            .await;
        f.dispatcher
            .dispatch(&mut outsider, r#"{"event":"join","data":"nowhere"}"#)
            .await;

        assert_eq!(names(&drain(&mut member_rx)), vec![outbound::JOINED]);
        let errors = drain(&mut outsider_rx);
        assert_eq!(errors.first().unwrap().data["code"], "FORBIDDEN");
        assert_eq!(errors.get(1).unwrap().data["code"], "NOT_FOUND");
        assert!(!f.channels.is_subscribed(outsider.connection_id, "C1").await);
    }

    #[tokio::test]
    async fn test_get_messages_replies_with_history() {
        let f = fixture().await;
        let (mut ctx, mut rx) = connect(&f, Some(Identity::new("P", Role::User))).await;

        f.dispatcher
            .dispatch(
                &mut ctx,
                r#"{"event":"sendMessage","data":{"conversationId":"C1","senderId":"P","content":"hi","type":"text"}}"#,
            )
            .await;
        f.dispatcher
            .dispatch(
                &mut ctx,
                r#"{"event":"getMessages","data":{"conversationId":"C1"}}"#,
            )
            .await;

        let events = drain(&mut rx);
        assert_eq!(names(&events), vec![outbound::MESSAGE, outbound::MESSAGES]);
        let reply = events.get(1).unwrap();
        assert_eq!(reply.data["messages"][0]["content"], "hi");
        assert_eq!(reply.data["messages"][0]["readBy"][0], "P");
    }

    #[tokio::test]
    async fn test_call_flow_and_disconnect_cleanup() {
        let f = fixture().await;
        let (mut doctor, mut doctor_rx) =
            connect(&f, Some(Identity::new("D", Role::Doctor))).await;
        let (mut patient, mut patient_rx) =
            connect(&f, Some(Identity::new("P", Role::User))).await;

        f.dispatcher
            .dispatch(&mut doctor, r#"{"event":"joinVideoCall","data":"A1"}"#)
            .await;
        f.dispatcher
            .dispatch(
                &mut patient,
                r#"{"event":"joinVideoCall","data":{"appointmentId":"A1"}}"#,
            )
            .await;
        assert!(doctor.joined_calls().contains("A1"));

        let doctor_events = drain(&mut doctor_rx);
        assert_eq!(
            doctor_events
                .iter()
                .filter(|e| e.event == outbound::START_CALL)
                .count(),
            1
        );
        assert!(drain(&mut patient_rx)
            .iter()
            .all(|e| e.event != outbound::START_CALL));

        f.dispatcher
            .dispatch(
                &mut doctor,
                r#"{"event":"user:call","data":{"to":"P","offer":{"sdp":"v=0"}}}"#,
            )
            .await;
        let forwarded = drain(&mut patient_rx);
        assert_eq!(names(&forwarded), vec![outbound::INCOMING_CALL]);
        assert_eq!(forwarded.first().unwrap().data["from"], "D");

        f.dispatcher.disconnect(&mut patient).await;
        f.dispatcher.disconnect(&mut patient).await;
        assert_eq!(names(&drain(&mut doctor_rx)), vec![outbound::USER_LEFT]);
        assert!(!f.channels.is_online("P").await);
    }

    #[tokio::test]
    async fn test_disconnect_leaves_every_joined_call() {
        let f = fixture().await;
        f.store
            .appointments()
            .insert(Appointment {
                id: "A2".to_string(),
                doctor_id: "D".to_string(),
                user_id: "Q".to_string(),
                appointment_status: AppointmentStatus::Booked,
                call_start_time: None,
                call_end_time: None,
            })
            .await;
        let (mut doctor, _doctor_rx) = connect(&f, Some(Identity::new("D", Role::Doctor))).await;
        let (mut patient, mut patient_rx) =
            connect(&f, Some(Identity::new("P", Role::User))).await;
        let (mut other, mut other_rx) = connect(&f, Some(Identity::new("Q", Role::User))).await;

        let join_a1 = r#"{"event":"joinVideoCall","data":"A1"}"#;
        let join_a2 = r#"{"event":"joinVideoCall","data":"A2"}"#;
        f.dispatcher.dispatch(&mut doctor, join_a1).await;
        f.dispatcher.dispatch(&mut doctor, join_a2).await;
        f.dispatcher.dispatch(&mut patient, join_a1).await;
        f.dispatcher.dispatch(&mut other, join_a2).await;
        assert_eq!(doctor.joined_calls().len(), 2);
        drain(&mut patient_rx);
        drain(&mut other_rx);

        f.dispatcher.disconnect(&mut doctor).await;

        assert!(doctor.joined_calls().is_empty());
        for room in ["A1", "A2"] {
            let state = f.dispatcher.registry.get_room_state(room).await.unwrap().unwrap();
            assert_eq!(state.members.len(), 1);
            assert!(state.members.iter().all(|m| m.user_id != "D"));
        }
        assert_eq!(names(&drain(&mut patient_rx)), vec![outbound::DOCTOR_LEFT]);
        assert_eq!(names(&drain(&mut other_rx)), vec![outbound::DOCTOR_LEFT]);

        // Disconnect never completes an appointment
        for id in ["A1", "A2"] {
            let appointment = f.store.appointments().get(id).await.unwrap();
            assert_eq!(appointment.appointment_status, AppointmentStatus::Booked);
        }

        // A second disconnect finds nothing left to clean up
        f.dispatcher.disconnect(&mut doctor).await;
        assert!(drain(&mut patient_rx).is_empty());
        assert!(drain(&mut other_rx).is_empty());
    }

    #[tokio::test]
    async fn test_doctor_completes_call_through_leave_call() {
        let f = fixture().await;
        let (mut doctor, _doctor_rx) = connect(&f, Some(Identity::new("D", Role::Doctor))).await;
        let (mut patient, mut patient_rx) =
            connect(&f, Some(Identity::new("P", Role::User))).await;

        f.dispatcher
            .dispatch(&mut doctor, r#"{"event":"joinVideoCall","data":"A1"}"#)
            .await;
        f.dispatcher
            .dispatch(&mut patient, r#"{"event":"joinVideoCall","data":"A1"}"#)
            .await;
        drain(&mut patient_rx);

        f.dispatcher
            .dispatch(
                &mut doctor,
                r#"{"event":"leaveCall","data":{"appointmentId":"A1","role":"doctor","prescriptionSubmitted":true}}"#,
            )
            .await;

        assert_eq!(names(&drain(&mut patient_rx)), vec![outbound::CALL_ENDED]);
        let appointment = f.store.appointments().get("A1").await.unwrap();
        assert_eq!(appointment.appointment_status, AppointmentStatus::Completed);
        assert!(!doctor.joined_calls().contains("A1"));
    }
}
