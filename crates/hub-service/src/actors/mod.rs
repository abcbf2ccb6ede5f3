//! Actor model for live video calls.
//!
//! ```text
//! RoomRegistryActor (singleton)
//! └── supervises N RoomActors
//!     └── RoomActor (one per appointment with a live call)
//!         └── owns the member table, relays signaling
//! ```
//!
//! Every state change for one appointment goes through its room's mailbox,
//! so join, leave, disconnect and relay for that appointment are totally
//! ordered. Rooms for different appointments run concurrently.

pub mod messages;
pub mod metrics;
pub mod registry;
pub mod room;

pub use messages::{
    CloseReason, JoinOutcome, LeaveOutcome, MemberInfo, RegistryStatus, RoomState,
};
pub use metrics::{ActorMetrics, ActorType, MailboxLevel, MailboxMonitor};
pub use registry::RoomRegistryHandle;
pub use room::{RoomActorHandle, RoomDeps, RoomSettings};
