//! Coordination Hub Service Library
//!
//! Real-time coordination hub for the telehealth platform. Every client
//! holds one authenticated WebSocket to the hub, which provides:
//!
//! - Live video call rooms keyed by appointment, with WebRTC signaling relay
//! - Conversation chat with persistence, history and read receipts
//! - Per-user notification push
//!
//! # Architecture
//!
//! ```text
//! GET /ws ── Gatekeeper ── connection task ── Dispatcher
//!                                               ├── ChatService ──────────┐
//!                                               ├── NotificationService ──┼── ChannelHub
//!                                               └── RoomRegistryActor     │
//!                                                   └── RoomActor (per call)
//! ```
//!
//! # Key Design Decisions
//!
//! - **Actor per room**: join, leave, disconnect and relay for one
//!   appointment are serialized through that room's mailbox
//! - **Fail closed**: handshakes without a valid token are refused unless
//!   anonymous connections are explicitly enabled
//! - **Process-local rooms**: the registry is never a system of record;
//!   appointments, messages and notifications live in the repositories
//!
//! # Modules
//!
//! - [`actors`] - Room registry and room actors
//! - [`auth`] - Handshake authentication
//! - [`channels`] - Connection registry, topic rooms and personal channels
//! - [`chat`] - Message persistence, history and read state
//! - [`config`] - Service configuration from environment
//! - [`dispatch`] - Inbound event routing
//! - [`errors`] - Error types with client error codes
//! - [`notifications`] - Notification persistence and push
//! - [`observability`] - Health endpoints and Prometheus metrics
//! - [`protocol`] - Wire event names and payloads
//! - [`repositories`] - Postgres and in-memory persistence
//! - [`routes`] / [`ws`] - HTTP router and WebSocket transport
//! - [`runtime`] - Wiring of the above

pub mod actors;
pub mod auth;
pub mod channels;
pub mod chat;
pub mod config;
pub mod dispatch;
pub mod errors;
pub mod models;
pub mod notifications;
pub mod observability;
pub mod protocol;
pub mod repositories;
pub mod routes;
pub mod runtime;
pub mod signaling;
pub mod ws;
