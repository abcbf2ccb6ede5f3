//! `RoomRegistryActor` - singleton supervisor for room actors.
//!
//! The registry is the top-level actor of the call side of the hub:
//!
//! - Singleton per process
//! - Maps appointment id to the live `RoomActor`, spawning on first join
//! - Stamps each spawned room with a generation so a late `RoomClosed` from
//!   an old room never removes its replacement
//! - Owns the root `CancellationToken` for graceful shutdown
//! - Monitors child actor health (panic detection via `JoinHandle`)
//!
//! # Graceful Shutdown
//!
//! On cancellation, the registry:
//! 1. Stops handing out rooms
//! 2. Cancels every room (each emits `leaveForced` to its members)
//! 3. Waits for the room tasks with a bounded timeout

use crate::channels::ConnectionId;
use crate::errors::HubError;

use super::messages::{JoinOutcome, LeaveOutcome, RegistryMessage, RegistryStatus, RoomState};
use super::metrics::{ActorMetrics, ActorType, MailboxMonitor, REGISTRY_MAILBOX_CAPACITY};
use super::room::{RoomActor, RoomActorHandle, RoomDeps};

use common::types::Role;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// How long shutdown waits for each room task.
const ROOM_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Handle to the `RoomRegistryActor`.
///
/// This is the public interface the dispatcher uses for everything call
/// related. Room-scoped operations resolve the room here and then talk to
/// the room actor directly.
#[derive(Clone)]
pub struct RoomRegistryHandle {
    sender: mpsc::Sender<RegistryMessage>,
    cancel_token: CancellationToken,
}

impl RoomRegistryHandle {
    /// Create a new `RoomRegistryActor` and return a handle to it.
    ///
    /// This spawns the actor task and returns immediately.
    #[must_use]
    pub fn new(deps: RoomDeps, metrics: Arc<ActorMetrics>) -> Self {
        let (handle, _task) = Self::spawn(deps, metrics, CancellationToken::new());
        handle
    }

    /// Spawn the registry under `cancel_token`, returning the task handle
    /// so callers can await a clean shutdown.
    pub fn spawn(
        deps: RoomDeps,
        metrics: Arc<ActorMetrics>,
        cancel_token: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(REGISTRY_MAILBOX_CAPACITY);

        let actor = RoomRegistryActor {
            receiver,
            self_sender: sender.downgrade(),
            cancel_token: cancel_token.clone(),
            deps,
            rooms: HashMap::new(),
            next_generation: 1,
            accepting_new: true,
            metrics,
            mailbox: MailboxMonitor::new(ActorType::Registry, "registry"),
        };

        let task_handle = tokio::spawn(actor.run());

        (
            Self {
                sender,
                cancel_token,
            },
            task_handle,
        )
    }

    /// Return the live room for `room_id`, spawning one if needed.
    pub async fn get_or_create_room(&self, room_id: String) -> Result<RoomActorHandle, HubError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RegistryMessage::GetOrCreateRoom {
                room_id,
                respond_to: tx,
            })
            .await
            .map_err(|e| HubError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| HubError::Internal(format!("response receive failed: {e}")))?
    }

    /// Return the live room for `room_id`, if any.
    pub async fn get_room(&self, room_id: String) -> Result<Option<RoomActorHandle>, HubError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RegistryMessage::GetRoom {
                room_id,
                respond_to: tx,
            })
            .await
            .map_err(|e| HubError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| HubError::Internal(format!("response receive failed: {e}")))
    }

    /// Get the current registry status.
    pub async fn get_status(&self) -> Result<RegistryStatus, HubError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RegistryMessage::GetStatus { respond_to: tx })
            .await
            .map_err(|e| HubError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| HubError::Internal(format!("response receive failed: {e}")))
    }

    /// Join `user_id` on `connection_id` to the call for `room_id`.
    ///
    /// A room that closes between lookup and join is replaced once.
    pub async fn join(
        &self,
        room_id: &str,
        user_id: &str,
        connection_id: ConnectionId,
    ) -> Result<JoinOutcome, HubError> {
        let mut attempts = 0;
        loop {
            attempts += 1;
            let room = self.get_or_create_room(room_id.to_string()).await?;
            match room.join(user_id.to_string(), connection_id).await {
                Err(HubError::RoomClosed) if attempts < 2 => {
                    debug!(
                        target: "hub.actor.registry",
                        room_id = %room_id,
                        generation = room.generation(),
                        "Room closed during join, retrying on a fresh room"
                    );
                }
                Err(HubError::RoomClosed) => {
                    return Err(HubError::Internal("room unavailable".to_string()));
                }
                other => return other,
            }
        }
    }

    /// Explicit `leaveCall`.
    pub async fn leave(
        &self,
        room_id: &str,
        user_id: &str,
        claimed_role: Option<Role>,
        prescription_submitted: bool,
    ) -> Result<LeaveOutcome, HubError> {
        let room = self.live_room(room_id).await?;
        room.leave(user_id.to_string(), claimed_role, prescription_submitted)
            .await
            .map_err(not_in_call)
    }

    /// Transport closed. Missing or closed rooms are already clean.
    pub async fn disconnect(
        &self,
        room_id: &str,
        connection_id: ConnectionId,
    ) -> Result<(), HubError> {
        let Some(room) = self.get_room(room_id.to_string()).await? else {
            return Ok(());
        };
        match room.disconnect(connection_id).await {
            Err(HubError::RoomClosed) => Ok(()),
            other => other,
        }
    }

    /// Signaling relay inside one room.
    pub async fn relay(
        &self,
        room_id: &str,
        from: &str,
        to: &str,
        event: &'static str,
        payload: Value,
    ) -> Result<(), HubError> {
        let room = self.live_room(room_id).await?;
        room.relay(from.to_string(), to.to_string(), event, payload)
            .await
            .map_err(not_in_call)
    }

    pub async fn mute(
        &self,
        room_id: &str,
        from: &str,
        kind: &str,
        muted: bool,
    ) -> Result<(), HubError> {
        let room = self.live_room(room_id).await?;
        room.mute(from.to_string(), kind.to_string(), muted)
            .await
            .map_err(not_in_call)
    }

    pub async fn call_message(
        &self,
        room_id: &str,
        sender_id: &str,
        content: String,
    ) -> Result<(), HubError> {
        let room = self.live_room(room_id).await?;
        room.call_message(sender_id.to_string(), content)
            .await
            .map_err(not_in_call)
    }

    /// Member table of a live room, if any.
    pub async fn get_room_state(&self, room_id: &str) -> Result<Option<RoomState>, HubError> {
        let Some(room) = self.get_room(room_id.to_string()).await? else {
            return Ok(None);
        };
        match room.get_state().await {
            Ok(state) => Ok(Some(state)),
            Err(HubError::RoomClosed) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Cancel the registry and every room under it.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    async fn live_room(&self, room_id: &str) -> Result<RoomActorHandle, HubError> {
        self.get_room(room_id.to_string())
            .await?
            .ok_or_else(|| HubError::NotFound("Not in this call".to_string()))
    }
}

fn not_in_call(err: HubError) -> HubError {
    match err {
        HubError::RoomClosed => HubError::NotFound("Not in this call".to_string()),
        other => other,
    }
}

/// Internal state for a managed room.
struct ManagedRoom {
    handle: RoomActorHandle,
    task_handle: JoinHandle<()>,
    /// Room creation timestamp.
    created_at: i64,
}

/// The `RoomRegistryActor` implementation.
struct RoomRegistryActor {
    receiver: mpsc::Receiver<RegistryMessage>,
    /// Handed to rooms for `RoomClosed`.
    self_sender: mpsc::WeakSender<RegistryMessage>,
    cancel_token: CancellationToken,
    deps: RoomDeps,
    rooms: HashMap<String, ManagedRoom>,
    next_generation: u64,
    accepting_new: bool,
    metrics: Arc<ActorMetrics>,
    mailbox: MailboxMonitor,
}

impl RoomRegistryActor {
    /// Run the actor message loop.
    #[instrument(skip_all, name = "hub.actor.registry")]
    async fn run(mut self) {
        info!(target: "hub.actor.registry", "RoomRegistryActor started");

        loop {
            // Check for terminated room actors
            self.check_room_health().await;

            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!(
                        target: "hub.actor.registry",
                        "RoomRegistryActor received cancellation signal"
                    );
                    break;
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => {
                            self.mailbox.record_received(self.receiver.len());
                            self.handle_message(message);
                            self.mailbox.record_handled(self.receiver.len());
                        }
                        None => {
                            info!(
                                target: "hub.actor.registry",
                                "RoomRegistryActor channel closed, exiting"
                            );
                            break;
                        }
                    }
                }
            }
        }

        self.graceful_shutdown().await;

        info!(
            target: "hub.actor.registry",
            messages_processed = self.mailbox.messages_processed(),
            "RoomRegistryActor stopped"
        );
    }

    fn handle_message(&mut self, message: RegistryMessage) {
        match message {
            RegistryMessage::GetOrCreateRoom {
                room_id,
                respond_to,
            } => {
                let result = self.get_or_create_room(room_id);
                let _ = respond_to.send(result);
            }

            RegistryMessage::GetRoom {
                room_id,
                respond_to,
            } => {
                let room = self
                    .rooms
                    .get(&room_id)
                    .filter(|m| !m.handle.is_closed())
                    .map(|m| m.handle.clone());
                let _ = respond_to.send(room);
            }

            RegistryMessage::RoomClosed {
                room_id,
                generation,
            } => {
                self.room_closed(&room_id, generation);
            }

            RegistryMessage::GetStatus { respond_to } => {
                let _ = respond_to.send(RegistryStatus {
                    room_count: self.rooms.len(),
                    mailbox_depth: self.receiver.len(),
                    is_shutting_down: !self.accepting_new,
                });
            }
        }
    }

    fn get_or_create_room(&mut self, room_id: String) -> Result<RoomActorHandle, HubError> {
        if !self.accepting_new {
            return Err(HubError::Internal("registry is shutting down".to_string()));
        }

        if let Some(managed) = self.rooms.get(&room_id) {
            if !managed.handle.is_closed() && !managed.task_handle.is_finished() {
                return Ok(managed.handle.clone());
            }
        }

        // A closing room may still be in the map until its RoomClosed arrives
        if let Some(stale) = self.rooms.remove(&room_id) {
            debug!(
                target: "hub.actor.registry",
                room_id = %room_id,
                generation = stale.handle.generation(),
                "Replacing closed room"
            );
            self.metrics.room_removed();
        }

        let generation = self.next_generation;
        self.next_generation += 1;

        let (handle, task_handle) = RoomActor::spawn(
            room_id.clone(),
            generation,
            self.deps.clone(),
            self.self_sender.clone(),
            self.cancel_token.child_token(),
            Arc::clone(&self.metrics),
        );

        self.rooms.insert(
            room_id.clone(),
            ManagedRoom {
                handle: handle.clone(),
                task_handle,
                created_at: chrono::Utc::now().timestamp(),
            },
        );
        self.metrics.room_created();

        info!(
            target: "hub.actor.registry",
            room_id = %room_id,
            generation,
            total_rooms = self.rooms.len(),
            "Room actor created"
        );

        Ok(handle)
    }

    fn room_closed(&mut self, room_id: &str, generation: u64) {
        let current = self
            .rooms
            .get(room_id)
            .is_some_and(|m| m.handle.generation() == generation);
        if !current {
            debug!(
                target: "hub.actor.registry",
                room_id = %room_id,
                generation,
                "Ignoring close from stale room generation"
            );
            return;
        }

        if let Some(managed) = self.rooms.remove(room_id) {
            self.metrics.room_removed();
            info!(
                target: "hub.actor.registry",
                room_id = %room_id,
                generation,
                lifetime_secs = chrono::Utc::now().timestamp() - managed.created_at,
                total_rooms = self.rooms.len(),
                "Room actor removed"
            );
        }
    }

    /// Perform graceful shutdown.
    async fn graceful_shutdown(&mut self) {
        self.accepting_new = false;

        info!(
            target: "hub.actor.registry",
            room_count = self.rooms.len(),
            "Performing graceful shutdown"
        );

        for managed in self.rooms.values() {
            managed.handle.cancel();
        }

        for (room_id, managed) in self.rooms.drain() {
            match tokio::time::timeout(ROOM_SHUTDOWN_TIMEOUT, managed.task_handle).await {
                Ok(Ok(())) => {
                    debug!(
                        target: "hub.actor.registry",
                        room_id = %room_id,
                        "Room actor completed cleanly"
                    );
                }
                Ok(Err(e)) => {
                    warn!(
                        target: "hub.actor.registry",
                        room_id = %room_id,
                        error = ?e,
                        "Room actor task panicked during shutdown"
                    );
                }
                Err(_) => {
                    warn!(
                        target: "hub.actor.registry",
                        room_id = %room_id,
                        "Room actor shutdown timed out"
                    );
                }
            }
            self.metrics.room_removed();
        }

        info!(target: "hub.actor.registry", "Graceful shutdown complete");
    }

    /// Drop rooms whose task ended without a matching `RoomClosed`.
    async fn check_room_health(&mut self) {
        let finished: Vec<String> = self
            .rooms
            .iter()
            .filter(|(_, m)| m.task_handle.is_finished())
            .map(|(id, _)| id.clone())
            .collect();

        for room_id in finished {
            let Some(managed) = self.rooms.remove(&room_id) else {
                continue;
            };
            match managed.task_handle.await {
                Ok(()) => {
                    debug!(
                        target: "hub.actor.registry",
                        room_id = %room_id,
                        "Room actor exited cleanly"
                    );
                }
                Err(join_error) => {
                    if join_error.is_panic() {
                        error!(
                            target: "hub.actor.registry",
                            room_id = %room_id,
                            error = ?join_error,
                            "Room actor panicked"
                        );
                        self.metrics.record_panic(ActorType::Room);
                    }
                }
            }
            self.metrics.room_removed();
        }
    }
}
