//! Message types for actor communication.
//!
//! Every request carries a `respond_to` oneshot; the handle awaits it so the
//! caller observes the outcome only after the actor has finished the work,
//! including any awaited appointment write.

use crate::channels::ConnectionId;
use crate::errors::HubError;

use common::types::Role;
use serde_json::Value;
use tokio::sync::oneshot;

use super::room::RoomActorHandle;

// ============================================================================
// Registry messages
// ============================================================================

/// Messages sent to the `RoomRegistryActor`.
#[derive(Debug)]
pub enum RegistryMessage {
    /// Return the live room for `room_id`, spawning one if none is live.
    GetOrCreateRoom {
        room_id: String,
        respond_to: oneshot::Sender<Result<RoomActorHandle, HubError>>,
    },

    /// Return the live room for `room_id`, if any.
    GetRoom {
        room_id: String,
        respond_to: oneshot::Sender<Option<RoomActorHandle>>,
    },

    /// A room actor stopped. Ignored if `generation` is stale.
    RoomClosed { room_id: String, generation: u64 },

    /// Get registry status.
    GetStatus {
        respond_to: oneshot::Sender<RegistryStatus>,
    },
}

/// Registry status snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryStatus {
    pub room_count: usize,
    /// Messages queued behind the status request.
    pub mailbox_depth: usize,
    pub is_shutting_down: bool,
}

// ============================================================================
// Room messages
// ============================================================================

/// Why a room closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Last member left or disconnected.
    Empty,
    /// Doctor completed the consultation.
    Ended,
    /// No activity for the idle timeout.
    Idle,
    /// Process shutdown.
    Shutdown,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::Empty => "empty",
            CloseReason::Ended => "ended",
            CloseReason::Idle => "idle",
            CloseReason::Shutdown => "shutdown",
        }
    }
}

/// Messages sent to a `RoomActor`.
#[derive(Debug)]
pub enum RoomMessage {
    /// `joinVideoCall`.
    Join {
        user_id: String,
        connection_id: ConnectionId,
        respond_to: oneshot::Sender<Result<JoinOutcome, HubError>>,
    },

    /// `leaveCall`.
    Leave {
        user_id: String,
        claimed_role: Option<Role>,
        prescription_submitted: bool,
        respond_to: oneshot::Sender<Result<LeaveOutcome, HubError>>,
    },

    /// Transport closed for `connection_id`.
    Disconnect {
        connection_id: ConnectionId,
        respond_to: oneshot::Sender<Result<(), HubError>>,
    },

    /// WebRTC signaling between the two members.
    Relay {
        from: String,
        to: String,
        event: &'static str,
        payload: Value,
        respond_to: oneshot::Sender<Result<(), HubError>>,
    },

    /// Audio/video mute toggle, relayed to the other member.
    Mute {
        from: String,
        kind: String,
        muted: bool,
        respond_to: oneshot::Sender<Result<(), HubError>>,
    },

    /// In-call chat, broadcast to all members and not persisted.
    CallMessage {
        sender_id: String,
        content: String,
        respond_to: oneshot::Sender<Result<(), HubError>>,
    },

    /// Get current room state.
    GetState {
        respond_to: oneshot::Sender<RoomState>,
    },
}

/// Result of a successful join.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinOutcome {
    /// Role derived from the appointment.
    pub role: Role,
    /// Number of member identities after the join.
    pub member_count: usize,
    /// Identity was already a member (another connection joined).
    pub already_member: bool,
}

/// Result of a successful leave.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaveOutcome {
    /// The doctor completed the appointment and the room closed.
    pub call_ended: bool,
}

/// Room state snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomState {
    pub room_id: String,
    pub generation: u64,
    pub members: Vec<MemberInfo>,
}

/// One member identity in a room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberInfo {
    pub user_id: String,
    pub role: Role,
    pub connection_count: usize,
}
