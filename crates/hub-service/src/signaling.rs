//! WebRTC signaling relay.
//!
//! Offer, answer, negotiation and ICE payloads are forwarded verbatim to
//! the named peer. The hub never inspects SDP or candidates; it only checks
//! that sender and recipient are members of the same live call. The check
//! itself runs inside the room actor so it is ordered with joins and leaves.

use crate::actors::RoomRegistryHandle;
use crate::errors::HubError;
use crate::protocol::SignalKind;

use serde_json::{Map, Value};
use std::collections::BTreeSet;
use tracing::{debug, instrument};

/// Routes signaling through the rooms a connection has joined.
#[derive(Clone)]
pub struct SignalingRelay {
    registry: RoomRegistryHandle,
}

impl SignalingRelay {
    #[must_use]
    pub fn new(registry: RoomRegistryHandle) -> Self {
        Self { registry }
    }

    /// Relay one signaling message from `from` to `to`.
    ///
    /// With `appointment_id` the relay is restricted to that room, which the
    /// connection must have joined. Otherwise each joined room is tried in
    /// order until one holds both peers. Returns the room used.
    ///
    /// # Errors
    ///
    /// `Authorization` when no joined room holds both peers. Nothing is
    /// forwarded in that case.
    #[instrument(skip_all, name = "hub.signal.relay", fields(event = kind.outbound_event()))]
    pub async fn relay(
        &self,
        joined_rooms: &BTreeSet<String>,
        from: &str,
        kind: SignalKind,
        to: &str,
        appointment_id: Option<&str>,
        payload: Map<String, Value>,
    ) -> Result<String, HubError> {
        let candidates: Vec<&String> = match appointment_id {
            Some(room_id) => joined_rooms.iter().filter(|r| *r == room_id).collect(),
            None => joined_rooms.iter().collect(),
        };

        for room_id in candidates {
            match self
                .registry
                .relay(
                    room_id,
                    from,
                    to,
                    kind.outbound_event(),
                    Value::Object(payload.clone()),
                )
                .await
            {
                Ok(()) => return Ok(room_id.clone()),
                Err(HubError::Authorization(_) | HubError::NotFound(_)) => {
                    debug!(
                        target: "hub.actor.room",
                        room_id = %room_id,
                        "Peer not in this room, trying next"
                    );
                }
                Err(e) => return Err(e),
            }
        }

        Err(HubError::Authorization(
            "Peer is not in this call".to_string(),
        ))
    }
}
