//! `RoomActor` - per-appointment actor that owns one live video call.
//!
//! Each `RoomActor`:
//! - Owns the member table for one appointment (at most doctor and patient)
//! - Serializes join, leave, disconnect and signaling for that appointment
//! - Writes `callStartTime` on the first admitted join and completes the
//!   appointment when the doctor leaves with a submitted prescription
//! - Reaps itself after the idle timeout, emitting `leaveForced`
//!
//! # Closing
//!
//! A room closes when it becomes empty, when the call ends, when it idles
//! out, or on shutdown. Closing stops the mailbox, reports `RoomClosed` to
//! the registry with the room's generation, and fails every queued request
//! with [`HubError::RoomClosed`] so callers can retry against a fresh room.

use crate::channels::{ChannelHub, ConnectionId};
use crate::config::Config;
use crate::errors::HubError;
use crate::models::{AppointmentStatus, AppointmentUpdate};
use crate::protocol::{outbound, OutboundEvent};
use crate::repositories::AppointmentRepository;

use super::messages::{
    CloseReason, JoinOutcome, LeaveOutcome, MemberInfo, RegistryMessage, RoomMessage, RoomState,
};
use super::metrics::{ActorMetrics, ActorType, MailboxMonitor, ROOM_MAILBOX_CAPACITY};

use chrono::Utc;
use common::types::Role;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Timing knobs for room actors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoomSettings {
    /// A room with no traffic for this long is reaped.
    pub idle_timeout: Duration,
    /// How often the reaper checks.
    pub reaper_interval: Duration,
}

impl RoomSettings {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            idle_timeout: config.room_idle_timeout,
            reaper_interval: config.room_reaper_interval,
        }
    }
}

/// Collaborators every room actor needs.
#[derive(Clone)]
pub struct RoomDeps {
    pub appointments: Arc<dyn AppointmentRepository>,
    pub channels: Arc<ChannelHub>,
    pub settings: RoomSettings,
}

/// Handle to a `RoomActor`.
#[derive(Clone, Debug)]
pub struct RoomActorHandle {
    sender: mpsc::Sender<RoomMessage>,
    cancel_token: CancellationToken,
    room_id: String,
    generation: u64,
}

impl RoomActorHandle {
    /// Get the room (appointment) id.
    #[must_use]
    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    /// Generation assigned by the registry when this room was spawned.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether the room stopped accepting requests.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    /// Admit `user_id` on `connection_id`.
    pub async fn join(
        &self,
        user_id: String,
        connection_id: ConnectionId,
    ) -> Result<JoinOutcome, HubError> {
        let (tx, rx) = oneshot::channel();
        self.send(RoomMessage::Join {
            user_id,
            connection_id,
            respond_to: tx,
        })
        .await?;
        rx.await.map_err(|_| HubError::RoomClosed)?
    }

    /// Explicit leave by a member identity.
    pub async fn leave(
        &self,
        user_id: String,
        claimed_role: Option<Role>,
        prescription_submitted: bool,
    ) -> Result<LeaveOutcome, HubError> {
        let (tx, rx) = oneshot::channel();
        self.send(RoomMessage::Leave {
            user_id,
            claimed_role,
            prescription_submitted,
            respond_to: tx,
        })
        .await?;
        rx.await.map_err(|_| HubError::RoomClosed)?
    }

    /// A transport connection went away.
    pub async fn disconnect(&self, connection_id: ConnectionId) -> Result<(), HubError> {
        let (tx, rx) = oneshot::channel();
        self.send(RoomMessage::Disconnect {
            connection_id,
            respond_to: tx,
        })
        .await?;
        rx.await.map_err(|_| HubError::RoomClosed)?
    }

    /// Forward a signaling payload from one member to the other.
    pub async fn relay(
        &self,
        from: String,
        to: String,
        event: &'static str,
        payload: Value,
    ) -> Result<(), HubError> {
        let (tx, rx) = oneshot::channel();
        self.send(RoomMessage::Relay {
            from,
            to,
            event,
            payload,
            respond_to: tx,
        })
        .await?;
        rx.await.map_err(|_| HubError::RoomClosed)?
    }

    /// Tell the other member about a mute toggle.
    pub async fn mute(&self, from: String, kind: String, muted: bool) -> Result<(), HubError> {
        let (tx, rx) = oneshot::channel();
        self.send(RoomMessage::Mute {
            from,
            kind,
            muted,
            respond_to: tx,
        })
        .await?;
        rx.await.map_err(|_| HubError::RoomClosed)?
    }

    /// Broadcast an in-call chat line to every member.
    pub async fn call_message(&self, sender_id: String, content: String) -> Result<(), HubError> {
        let (tx, rx) = oneshot::channel();
        self.send(RoomMessage::CallMessage {
            sender_id,
            content,
            respond_to: tx,
        })
        .await?;
        rx.await.map_err(|_| HubError::RoomClosed)?
    }

    /// Snapshot of the member table.
    pub async fn get_state(&self) -> Result<RoomState, HubError> {
        let (tx, rx) = oneshot::channel();
        self.send(RoomMessage::GetState { respond_to: tx }).await?;
        rx.await.map_err(|_| HubError::RoomClosed)
    }

    /// Cancel the actor (for immediate shutdown).
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    async fn send(&self, message: RoomMessage) -> Result<(), HubError> {
        self.sender
            .send(message)
            .await
            .map_err(|_| HubError::RoomClosed)
    }
}

/// One member identity and its joined connections.
struct Member {
    role: Role,
    connections: HashSet<ConnectionId>,
}

/// The `RoomActor` implementation.
pub struct RoomActor {
    room_id: String,
    generation: u64,
    receiver: mpsc::Receiver<RoomMessage>,
    cancel_token: CancellationToken,
    /// Weak so the registry mailbox closes once the registry handle is gone.
    registry: mpsc::WeakSender<RegistryMessage>,
    deps: RoomDeps,
    members: HashMap<String, Member>,
    last_activity: Instant,
    metrics: Arc<ActorMetrics>,
    mailbox: MailboxMonitor,
}

impl RoomActor {
    /// Spawn a new room actor.
    ///
    /// Returns a handle and the task join handle.
    ///
    /// # Arguments
    ///
    /// * `room_id` - Appointment id
    /// * `generation` - Registry generation, echoed back in `RoomClosed`
    /// * `deps` - Appointment repository, channel hub and timing
    /// * `registry` - Registry mailbox for close notifications
    /// * `cancel_token` - Child of the registry's token
    /// * `metrics` - Shared actor metrics
    pub fn spawn(
        room_id: String,
        generation: u64,
        deps: RoomDeps,
        registry: mpsc::WeakSender<RegistryMessage>,
        cancel_token: CancellationToken,
        metrics: Arc<ActorMetrics>,
    ) -> (RoomActorHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(ROOM_MAILBOX_CAPACITY);

        let actor = Self {
            room_id: room_id.clone(),
            generation,
            receiver,
            cancel_token: cancel_token.clone(),
            registry,
            deps,
            members: HashMap::new(),
            last_activity: Instant::now(),
            metrics,
            mailbox: MailboxMonitor::new(ActorType::Room, &room_id),
        };

        let task_handle = tokio::spawn(actor.run());

        let handle = RoomActorHandle {
            sender,
            cancel_token,
            room_id,
            generation,
        };

        (handle, task_handle)
    }

    /// Run the actor message loop.
    #[instrument(
        skip_all,
        name = "hub.actor.room",
        fields(room_id = %self.room_id, generation = self.generation)
    )]
    async fn run(mut self) {
        info!(
            target: "hub.actor.room",
            room_id = %self.room_id,
            generation = self.generation,
            "RoomActor started"
        );

        let mut reaper = tokio::time::interval(self.deps.settings.reaper_interval);
        reaper.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        reaper.tick().await;

        let reason = loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!(
                        target: "hub.actor.room",
                        room_id = %self.room_id,
                        "RoomActor received cancellation signal"
                    );
                    break CloseReason::Shutdown;
                }

                _ = reaper.tick() => {
                    if let Some(reason) = self.check_idle() {
                        break reason;
                    }
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => {
                            self.mailbox.record_received(self.receiver.len());
                            self.last_activity = Instant::now();
                            let closing = self.handle_message(message).await;
                            self.mailbox.record_handled(self.receiver.len());
                            if let Some(reason) = closing {
                                break reason;
                            }
                        }
                        None => {
                            debug!(
                                target: "hub.actor.room",
                                room_id = %self.room_id,
                                "RoomActor channel closed, exiting"
                            );
                            break CloseReason::Empty;
                        }
                    }
                }
            }
        };

        self.close(reason).await;

        info!(
            target: "hub.actor.room",
            room_id = %self.room_id,
            generation = self.generation,
            reason = reason.as_str(),
            messages_processed = self.mailbox.messages_processed(),
            "RoomActor stopped"
        );
    }

    /// Handle a single message. Returns a close reason when the room must stop.
    async fn handle_message(&mut self, message: RoomMessage) -> Option<CloseReason> {
        let mut call_ended = false;

        match message {
            RoomMessage::Join {
                user_id,
                connection_id,
                respond_to,
            } => {
                let result = self.handle_join(user_id, connection_id).await;
                let _ = respond_to.send(result);
            }

            RoomMessage::Leave {
                user_id,
                claimed_role,
                prescription_submitted,
                respond_to,
            } => {
                let result = self
                    .handle_leave(&user_id, claimed_role, prescription_submitted)
                    .await;
                call_ended = matches!(result, Ok(LeaveOutcome { call_ended: true }));
                let _ = respond_to.send(result);
            }

            RoomMessage::Disconnect {
                connection_id,
                respond_to,
            } => {
                self.handle_disconnect(connection_id).await;
                let _ = respond_to.send(Ok(()));
            }

            RoomMessage::Relay {
                from,
                to,
                event,
                payload,
                respond_to,
            } => {
                let result = self.handle_relay(&from, &to, event, payload).await;
                let _ = respond_to.send(result);
            }

            RoomMessage::Mute {
                from,
                kind,
                muted,
                respond_to,
            } => {
                let result = self.handle_mute(&from, &kind, muted).await;
                let _ = respond_to.send(result);
            }

            RoomMessage::CallMessage {
                sender_id,
                content,
                respond_to,
            } => {
                let result = self.handle_call_message(&sender_id, content).await;
                let _ = respond_to.send(result);
            }

            RoomMessage::GetState { respond_to } => {
                let _ = respond_to.send(self.get_state());
            }
        }

        if call_ended {
            Some(CloseReason::Ended)
        } else if self.members.is_empty() {
            Some(CloseReason::Empty)
        } else {
            None
        }
    }

    #[instrument(skip_all, fields(room_id = %self.room_id, user_id = %user_id))]
    async fn handle_join(
        &mut self,
        user_id: String,
        connection_id: ConnectionId,
    ) -> Result<JoinOutcome, HubError> {
        let appointment = self
            .deps
            .appointments
            .find_by_id(&self.room_id)
            .await?
            .ok_or_else(|| HubError::NotFound("Appointment not found".to_string()))?;

        if appointment.appointment_status != AppointmentStatus::Booked {
            return Err(HubError::NotFound(
                "Appointment is not open for calls".to_string(),
            ));
        }

        let role = if appointment.doctor_id == user_id {
            Role::Doctor
        } else if appointment.user_id == user_id {
            Role::User
        } else {
            warn!(
                target: "hub.actor.room",
                room_id = %self.room_id,
                user_id = %user_id,
                "Join rejected, identity is not a party to the appointment"
            );
            return Err(HubError::Authorization(
                "Not a participant in this appointment".to_string(),
            ));
        };

        if appointment.call_start_time.is_none() {
            self.deps
                .appointments
                .update(&self.room_id, AppointmentUpdate::call_started(Utc::now()))
                .await
                .inspect_err(|e| {
                    warn!(
                        target: "hub.actor.room",
                        room_id = %self.room_id,
                        error = %e,
                        "Failed to record call start, join rejected"
                    );
                })?;
        }

        let members_before = self.members.len();
        let already_member = self.members.contains_key(&user_id);
        self.members
            .entry(user_id.clone())
            .or_insert_with(|| Member {
                role,
                connections: HashSet::new(),
            })
            .connections
            .insert(connection_id);
        let member_count = self.members.len();

        self.deps
            .channels
            .send_to_connection(
                connection_id,
                OutboundEvent::new(
                    outbound::JOINED_VIDEO_CALL,
                    json!({
                        "appointmentId": self.room_id,
                        "userId": user_id,
                        "role": role,
                        "peerPresent": member_count == 2,
                    }),
                ),
            )
            .await;

        if !already_member {
            let joined = OutboundEvent::new(
                outbound::USER_JOINED,
                json!({ "appointmentId": self.room_id, "userId": user_id, "role": role }),
            );
            self.emit_to_others(&user_id, &joined).await;
        }

        if members_before < 2 && member_count == 2 {
            if let Some(patient_id) = self.member_with_role(Role::User) {
                let start = OutboundEvent::new(
                    outbound::START_CALL,
                    json!({ "appointmentId": self.room_id, "userId": patient_id }),
                );
                self.emit_to_role(Role::Doctor, &start).await;
            }
        }

        info!(
            target: "hub.actor.room",
            room_id = %self.room_id,
            user_id = %user_id,
            role = %role,
            member_count,
            "Member joined call"
        );

        Ok(JoinOutcome {
            role,
            member_count,
            already_member,
        })
    }

    #[instrument(skip_all, fields(room_id = %self.room_id, user_id = %user_id))]
    async fn handle_leave(
        &mut self,
        user_id: &str,
        claimed_role: Option<Role>,
        prescription_submitted: bool,
    ) -> Result<LeaveOutcome, HubError> {
        let Some(role) = self.members.get(user_id).map(|m| m.role) else {
            return Err(HubError::NotFound("Not in this call".to_string()));
        };

        if let Some(claimed) = claimed_role {
            if claimed != role {
                debug!(
                    target: "hub.actor.room",
                    room_id = %self.room_id,
                    claimed = %claimed,
                    actual = %role,
                    "Leave carried a role that does not match membership, using membership"
                );
            }
        }

        if role == Role::Doctor && prescription_submitted {
            self.deps
                .appointments
                .update(&self.room_id, AppointmentUpdate::call_completed(Utc::now()))
                .await
                .inspect_err(|e| {
                    warn!(
                        target: "hub.actor.room",
                        room_id = %self.room_id,
                        error = %e,
                        "Failed to complete appointment, call stays open"
                    );
                })?;

            let ended = OutboundEvent::new(
                outbound::CALL_ENDED,
                json!({ "appointmentId": self.room_id }),
            );
            self.emit_to_all(&ended).await;
            self.members.clear();

            info!(
                target: "hub.actor.room",
                room_id = %self.room_id,
                "Call completed by doctor"
            );
            return Ok(LeaveOutcome { call_ended: true });
        }

        self.members.remove(user_id);
        self.announce_departure(user_id, role).await;

        Ok(LeaveOutcome { call_ended: false })
    }

    async fn handle_disconnect(&mut self, connection_id: ConnectionId) {
        let Some((user_id, member)) = self
            .members
            .iter_mut()
            .find(|(_, m)| m.connections.contains(&connection_id))
        else {
            return;
        };

        member.connections.remove(&connection_id);
        if !member.connections.is_empty() {
            return;
        }

        let user_id = user_id.clone();
        let role = member.role;
        self.members.remove(&user_id);

        debug!(
            target: "hub.actor.room",
            room_id = %self.room_id,
            user_id = %user_id,
            "Member's last connection dropped"
        );
        self.announce_departure(&user_id, role).await;
    }

    async fn handle_relay(
        &self,
        from: &str,
        to: &str,
        event: &'static str,
        mut payload: Value,
    ) -> Result<(), HubError> {
        if from == to || !self.members.contains_key(from) || !self.members.contains_key(to) {
            return Err(HubError::Authorization(
                "Peer is not in this call".to_string(),
            ));
        }

        if let Value::Object(map) = &mut payload {
            map.insert("from".to_string(), json!(from));
            map.insert("appointmentId".to_string(), json!(self.room_id));
        }

        let delivered = self
            .deps
            .channels
            .send_to_user(to, &OutboundEvent::new(event, payload))
            .await;

        debug!(
            target: "hub.actor.room",
            room_id = %self.room_id,
            event,
            delivered,
            "Relayed signaling message"
        );
        Ok(())
    }

    async fn handle_mute(&self, from: &str, kind: &str, muted: bool) -> Result<(), HubError> {
        if !self.members.contains_key(from) {
            return Err(HubError::Authorization("Not in this call".to_string()));
        }

        let event = OutboundEvent::new(
            outbound::MUTE,
            json!({
                "appointmentId": self.room_id,
                "from": from,
                "type": kind,
                "muted": muted,
            }),
        );
        self.emit_to_others(from, &event).await;
        Ok(())
    }

    async fn handle_call_message(&self, sender_id: &str, content: String) -> Result<(), HubError> {
        let Some(member) = self.members.get(sender_id) else {
            return Err(HubError::Authorization("Not in this call".to_string()));
        };
        if content.trim().is_empty() {
            return Err(HubError::Validation("Message content is empty".to_string()));
        }

        let event = OutboundEvent::new(
            outbound::VIDEO_CALL_MESSAGE,
            json!({
                "appointmentId": self.room_id,
                "senderId": sender_id,
                "senderRole": member.role,
                "content": content,
                "timestamp": Utc::now(),
            }),
        );
        self.emit_to_all(&event).await;
        Ok(())
    }

    fn get_state(&self) -> RoomState {
        let mut members: Vec<MemberInfo> = self
            .members
            .iter()
            .map(|(user_id, m)| MemberInfo {
                user_id: user_id.clone(),
                role: m.role,
                connection_count: m.connections.len(),
            })
            .collect();
        members.sort_by(|a, b| a.user_id.cmp(&b.user_id));

        RoomState {
            room_id: self.room_id.clone(),
            generation: self.generation,
            members,
        }
    }

    /// Reaper tick: an empty or idle room closes.
    fn check_idle(&self) -> Option<CloseReason> {
        if self.members.is_empty() {
            return Some(CloseReason::Empty);
        }
        if self.last_activity.elapsed() >= self.deps.settings.idle_timeout {
            info!(
                target: "hub.actor.room",
                room_id = %self.room_id,
                idle_secs = self.last_activity.elapsed().as_secs(),
                "Room idle timeout reached"
            );
            return Some(CloseReason::Idle);
        }
        None
    }

    /// `doctorLeft` / `userLeft` to whoever remains.
    async fn announce_departure(&self, user_id: &str, role: Role) {
        let name = match role {
            Role::Doctor => outbound::DOCTOR_LEFT,
            Role::User => outbound::USER_LEFT,
        };
        let event = OutboundEvent::new(
            name,
            json!({ "appointmentId": self.room_id, "userId": user_id }),
        );
        self.emit_to_others(user_id, &event).await;
    }

    async fn close(&mut self, reason: CloseReason) {
        self.receiver.close();

        if matches!(reason, CloseReason::Idle | CloseReason::Shutdown) && !self.members.is_empty()
        {
            let forced = OutboundEvent::new(
                outbound::LEAVE_FORCED,
                json!({ "appointmentId": self.room_id, "reason": reason.as_str() }),
            );
            self.emit_to_all(&forced).await;
        }
        self.members.clear();

        // During shutdown the registry is draining its children, not its mailbox
        if reason != CloseReason::Shutdown {
            if let Some(registry) = self.registry.upgrade() {
                let _ = registry
                    .send(RegistryMessage::RoomClosed {
                        room_id: self.room_id.clone(),
                        generation: self.generation,
                    })
                    .await;
            }
        }

        let mut rejected = 0usize;
        while let Ok(message) = self.receiver.try_recv() {
            reject(message);
            rejected += 1;
        }
        if rejected > 0 {
            debug!(
                target: "hub.actor.room",
                room_id = %self.room_id,
                rejected,
                "Rejected requests queued behind close"
            );
        }

        self.metrics.room_closed(reason.as_str());
    }

    fn member_with_role(&self, role: Role) -> Option<&str> {
        self.members
            .iter()
            .find(|(_, m)| m.role == role)
            .map(|(id, _)| id.as_str())
    }

    async fn emit_to_all(&self, event: &OutboundEvent) {
        for member in self.members.values() {
            self.emit_to_connections(&member.connections, event).await;
        }
    }

    async fn emit_to_others(&self, except_user: &str, event: &OutboundEvent) {
        for (user_id, member) in &self.members {
            if user_id != except_user {
                self.emit_to_connections(&member.connections, event).await;
            }
        }
    }

    async fn emit_to_role(&self, role: Role, event: &OutboundEvent) {
        for member in self.members.values().filter(|m| m.role == role) {
            self.emit_to_connections(&member.connections, event).await;
        }
    }

    async fn emit_to_connections(&self, connections: &HashSet<ConnectionId>, event: &OutboundEvent) {
        for connection_id in connections {
            self.deps
                .channels
                .send_to_connection(*connection_id, event.clone())
                .await;
        }
    }
}

/// Answer a request that arrived after the room started closing.
fn reject(message: RoomMessage) {
    match message {
        RoomMessage::Join { respond_to, .. } => {
            let _ = respond_to.send(Err(HubError::RoomClosed));
        }
        RoomMessage::Leave { respond_to, .. } => {
            let _ = respond_to.send(Err(HubError::RoomClosed));
        }
        RoomMessage::Disconnect { respond_to, .. }
        | RoomMessage::Relay { respond_to, .. }
        | RoomMessage::Mute { respond_to, .. }
        | RoomMessage::CallMessage { respond_to, .. } => {
            let _ = respond_to.send(Err(HubError::RoomClosed));
        }
        // Dropping the sender surfaces as RoomClosed at the handle
        RoomMessage::GetState { .. } => {}
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::models::Appointment;
    use crate::repositories::memory::{MemoryAppointments, MemoryStore};
    use common::types::Identity;

    struct Harness {
        handle: RoomActorHandle,
        task: JoinHandle<()>,
        appointments: Arc<MemoryAppointments>,
        channels: Arc<ChannelHub>,
        registry_rx: mpsc::Receiver<RegistryMessage>,
        _registry_tx: mpsc::Sender<RegistryMessage>,
        cancel_token: CancellationToken,
    }

    fn settings() -> RoomSettings {
        RoomSettings {
            idle_timeout: Duration::from_secs(7200),
            reaper_interval: Duration::from_secs(60),
        }
    }

    async fn harness() -> Harness {
        let store = MemoryStore::new();
        let appointments = store.appointments();
        appointments
            .insert(Appointment {
                id: "A1".to_string(),
                doctor_id: "D".to_string(),
                user_id: "P".to_string(),
                appointment_status: AppointmentStatus::Booked,
                call_start_time: None,
                call_end_time: None,
            })
            .await;

        let channels = ChannelHub::new(32);
        let (registry_tx, registry_rx) = mpsc::channel(16);
        let cancel_token = CancellationToken::new();
        let deps = RoomDeps {
            appointments: appointments.clone(),
            channels: Arc::clone(&channels),
            settings: settings(),
        };
        let (handle, task) = RoomActor::spawn(
            "A1".to_string(),
            7,
            deps,
            registry_tx.downgrade(),
            cancel_token.clone(),
            ActorMetrics::new(),
        );

        Harness {
            handle,
            task,
            appointments,
            channels,
            registry_rx,
            _registry_tx: registry_tx,
            cancel_token,
        }
    }

    async fn connect(
        channels: &ChannelHub,
        user_id: &str,
        role: Role,
    ) -> (ConnectionId, mpsc::Receiver<OutboundEvent>) {
        channels.register(Some(Identity::new(user_id, role))).await
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
    async fn test_join_derives_role_and_starts_call() {
        let h = harness().await;
        let (doc_conn, mut doc_rx) = connect(&h.channels, "D", Role::Doctor).await;
        let (pat_conn, mut pat_rx) = connect(&h.channels, "P", Role::User).await;

        let joined = h.handle.join("D".to_string(), doc_conn).await.unwrap();
        assert_eq!(joined.role, Role::Doctor);
        assert_eq!(joined.member_count, 1);

        let stamped = h.appointments.get("A1").await.unwrap().call_start_time;
        assert!(stamped.is_some());

        let joined = h.handle.join("P".to_string(), pat_conn).await.unwrap();
        assert_eq!(joined.role, Role::User);
        assert_eq!(joined.member_count, 2);

        // Second join leaves the original start time alone
        assert_eq!(h.appointments.get("A1").await.unwrap().call_start_time, stamped);

        let doctor_events = drain(&mut doc_rx);
        assert_eq!(
            names(&doctor_events),
            vec![
                outbound::JOINED_VIDEO_CALL,
                outbound::USER_JOINED,
                outbound::START_CALL
            ]
        );
        assert_eq!(doctor_events.get(2).unwrap().data["userId"], "P");
        assert_eq!(names(&drain(&mut pat_rx)), vec![outbound::JOINED_VIDEO_CALL]);

        h.handle.cancel();
    }

    #[tokio::test]
    async fn test_join_rejects_outsider_without_state_change() {
        let h = harness().await;
        let (doc_conn, _doc_rx) = connect(&h.channels, "D", Role::Doctor).await;
        let (x_conn, mut x_rx) = connect(&h.channels, "X", Role::User).await;

        h.handle.join("D".to_string(), doc_conn).await.unwrap();
        let result = h.handle.join("X".to_string(), x_conn).await;
        assert!(matches!(result, Err(HubError::Authorization(_))));

        let state = h.handle.get_state().await.unwrap();
        assert_eq!(state.members.len(), 1);
        assert!(drain(&mut x_rx).is_empty());

        h.handle.cancel();
    }

    #[tokio::test]
    async fn test_join_fails_closed_when_start_time_write_fails() {
        let mut h = harness().await;
        let (doc_conn, mut doc_rx) = connect(&h.channels, "D", Role::Doctor).await;
        h.appointments.set_fail_updates(true);

        let result = h.handle.join("D".to_string(), doc_conn).await;
        assert!(matches!(result, Err(HubError::Persistence(_))));
        assert!(drain(&mut doc_rx).is_empty());

        // Empty after the failed join, so the room closes and reports it
        let closed = h.registry_rx.recv().await.unwrap();
        assert!(matches!(
            closed,
            RegistryMessage::RoomClosed { generation: 7, .. }
        ));
        h.task.await.unwrap();
        assert!(h.handle.is_closed());
    }

    #[tokio::test]
    async fn test_second_connection_of_same_identity_is_not_announced() {
        let h = harness().await;
        let (doc_conn, _doc_rx) = connect(&h.channels, "D", Role::Doctor).await;
        let (pat_a, mut pat_rx_a) = connect(&h.channels, "P", Role::User).await;
        let (pat_b, _pat_rx_b) = connect(&h.channels, "P", Role::User).await;

        h.handle.join("P".to_string(), pat_a).await.unwrap();
        h.handle.join("D".to_string(), doc_conn).await.unwrap();
        drain(&mut pat_rx_a);

        let outcome = h.handle.join("P".to_string(), pat_b).await.unwrap();
        assert!(outcome.already_member);
        assert_eq!(outcome.member_count, 2);

        let state = h.handle.get_state().await.unwrap();
        let patient = state.members.iter().find(|m| m.user_id == "P").unwrap();
        assert_eq!(patient.connection_count, 2);

        // One connection closing keeps the identity in the call
        h.handle.disconnect(pat_a).await.unwrap();
        let state = h.handle.get_state().await.unwrap();
        assert_eq!(state.members.len(), 2);

        h.handle.cancel();
    }

    #[tokio::test]
    async fn test_doctor_leave_without_prescription_notifies_patient_once() {
        let h = harness().await;
        let (doc_conn, _doc_rx) = connect(&h.channels, "D", Role::Doctor).await;
        let (pat_conn, mut pat_rx) = connect(&h.channels, "P", Role::User).await;
        h.handle.join("D".to_string(), doc_conn).await.unwrap();
        h.handle.join("P".to_string(), pat_conn).await.unwrap();
        drain(&mut pat_rx);

        let outcome = h
            .handle
            .leave("D".to_string(), Some(Role::Doctor), false)
            .await
            .unwrap();
        assert!(!outcome.call_ended);

        assert_eq!(names(&drain(&mut pat_rx)), vec![outbound::DOCTOR_LEFT]);
        assert_eq!(
            h.appointments.get("A1").await.unwrap().appointment_status,
            AppointmentStatus::Booked
        );

        h.handle.cancel();
    }

    #[tokio::test]
    async fn test_doctor_completes_call() {
        let mut h = harness().await;
        let (doc_conn, mut doc_rx) = connect(&h.channels, "D", Role::Doctor).await;
        let (pat_conn, mut pat_rx) = connect(&h.channels, "P", Role::User).await;
        h.handle.join("D".to_string(), doc_conn).await.unwrap();
        h.handle.join("P".to_string(), pat_conn).await.unwrap();
        drain(&mut doc_rx);
        drain(&mut pat_rx);

        let outcome = h
            .handle
            .leave("D".to_string(), None, true)
            .await
            .unwrap();
        assert!(outcome.call_ended);

        let appointment = h.appointments.get("A1").await.unwrap();
        assert_eq!(appointment.appointment_status, AppointmentStatus::Completed);
        assert!(appointment.call_end_time.is_some());

        assert_eq!(names(&drain(&mut pat_rx)), vec![outbound::CALL_ENDED]);
        assert_eq!(names(&drain(&mut doc_rx)), vec![outbound::CALL_ENDED]);

        assert!(matches!(
            h.registry_rx.recv().await.unwrap(),
            RegistryMessage::RoomClosed { .. }
        ));
        h.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_completion_failure_keeps_call_open() {
        let h = harness().await;
        let (doc_conn, _doc_rx) = connect(&h.channels, "D", Role::Doctor).await;
        let (pat_conn, mut pat_rx) = connect(&h.channels, "P", Role::User).await;
        h.handle.join("D".to_string(), doc_conn).await.unwrap();
        h.handle.join("P".to_string(), pat_conn).await.unwrap();
        drain(&mut pat_rx);

        h.appointments.set_fail_updates(true);
        let result = h.handle.leave("D".to_string(), None, true).await;
        assert!(matches!(result, Err(HubError::Persistence(_))));

        assert!(drain(&mut pat_rx).is_empty());
        assert_eq!(h.handle.get_state().await.unwrap().members.len(), 2);

        h.handle.cancel();
    }

    #[tokio::test]
    async fn test_relay_requires_both_members() {
        let h = harness().await;
        let (doc_conn, _doc_rx) = connect(&h.channels, "D", Role::Doctor).await;
        let (_pat_conn, mut pat_rx) = connect(&h.channels, "P", Role::User).await;
        h.handle.join("D".to_string(), doc_conn).await.unwrap();

        let result = h
            .handle
            .relay(
                "D".to_string(),
                "P".to_string(),
                outbound::INCOMING_CALL,
                json!({ "offer": "sdp" }),
            )
            .await;
        assert!(matches!(result, Err(HubError::Authorization(_))));
        assert!(drain(&mut pat_rx).is_empty());

        h.handle.cancel();
    }

    #[tokio::test]
    async fn test_relay_reaches_peer_with_sender_stamped() {
        let h = harness().await;
        let (doc_conn, _doc_rx) = connect(&h.channels, "D", Role::Doctor).await;
        let (pat_conn, mut pat_rx) = connect(&h.channels, "P", Role::User).await;
        h.handle.join("D".to_string(), doc_conn).await.unwrap();
        h.handle.join("P".to_string(), pat_conn).await.unwrap();
        drain(&mut pat_rx);

        h.handle
            .relay(
                "D".to_string(),
                "P".to_string(),
                outbound::INCOMING_CALL,
                json!({ "offer": "sdp" }),
            )
            .await
            .unwrap();

        let events = drain(&mut pat_rx);
        assert_eq!(names(&events), vec![outbound::INCOMING_CALL]);
        assert_eq!(events.first().unwrap().data["from"], "D");
        assert_eq!(events.first().unwrap().data["offer"], "sdp");

        h.handle.cancel();
    }

    #[tokio::test]
    async fn test_mute_and_call_message() {
        let h = harness().await;
        let (doc_conn, mut doc_rx) = connect(&h.channels, "D", Role::Doctor).await;
        let (pat_conn, mut pat_rx) = connect(&h.channels, "P", Role::User).await;
        h.handle.join("D".to_string(), doc_conn).await.unwrap();
        h.handle.join("P".to_string(), pat_conn).await.unwrap();
        drain(&mut doc_rx);
        drain(&mut pat_rx);

        h.handle
            .mute("P".to_string(), "audio".to_string(), true)
            .await
            .unwrap();
        let events = drain(&mut doc_rx);
        assert_eq!(names(&events), vec![outbound::MUTE]);
        assert_eq!(events.first().unwrap().data["type"], "audio");
        assert!(drain(&mut pat_rx).is_empty());

        h.handle
            .call_message("D".to_string(), "hello".to_string())
            .await
            .unwrap();
        assert_eq!(names(&drain(&mut doc_rx)), vec![outbound::VIDEO_CALL_MESSAGE]);
        let events = drain(&mut pat_rx);
        assert_eq!(events.first().unwrap().data["senderRole"], "doctor");

        h.handle.cancel();
    }

    #[tokio::test]
    async fn test_patient_disconnect_announces_user_left() {
        let h = harness().await;
        let (doc_conn, mut doc_rx) = connect(&h.channels, "D", Role::Doctor).await;
        let (pat_conn, _pat_rx) = connect(&h.channels, "P", Role::User).await;
        h.handle.join("D".to_string(), doc_conn).await.unwrap();
        h.handle.join("P".to_string(), pat_conn).await.unwrap();
        drain(&mut doc_rx);

        h.handle.disconnect(pat_conn).await.unwrap();

        assert_eq!(names(&drain(&mut doc_rx)), vec![outbound::USER_LEFT]);
        assert_eq!(h.handle.get_state().await.unwrap().members.len(), 1);

        h.handle.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_room_is_reaped_with_leave_forced() {
        let mut h = harness().await;
        let (doc_conn, mut doc_rx) = connect(&h.channels, "D", Role::Doctor).await;
        h.handle.join("D".to_string(), doc_conn).await.unwrap();
        drain(&mut doc_rx);

        tokio::time::advance(Duration::from_secs(7100)).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!h.handle.is_closed());

        tokio::time::advance(Duration::from_secs(200)).await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        let events = drain(&mut doc_rx);
        assert_eq!(names(&events), vec![outbound::LEAVE_FORCED]);
        assert_eq!(events.first().unwrap().data["reason"], "idle");
        assert!(matches!(
            h.registry_rx.recv().await.unwrap(),
            RegistryMessage::RoomClosed { .. }
        ));
        h.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_cancellation_forces_members_out() {
        let h = harness().await;
        let (doc_conn, mut doc_rx) = connect(&h.channels, "D", Role::Doctor).await;
        h.handle.join("D".to_string(), doc_conn).await.unwrap();
        drain(&mut doc_rx);

        h.cancel_token.cancel();
        h.task.await.unwrap();

        let events = drain(&mut doc_rx);
        assert_eq!(names(&events), vec![outbound::LEAVE_FORCED]);
        assert_eq!(events.first().unwrap().data["reason"], "shutdown");
        assert!(matches!(
            h.handle.get_state().await,
            Err(HubError::RoomClosed)
        ));
    }
}
