//! Channel hub: the live connection table.
//!
//! Each connection gets a bounded outbound queue drained by its WebSocket
//! writer task. Connections are addressable three ways:
//!
//! - directly by [`ConnectionId`]
//! - through a personal channel keyed by user id (all of a user's connections)
//! - through topic rooms (conversation or appointment ids) joined with `join`
//!
//! Delivery is best-effort: a full queue drops the event for that connection
//! and increments `hub_messages_dropped_total`. No lock is held while sending.

use crate::observability::metrics as prom;
use crate::protocol::OutboundEvent;

use common::types::Identity;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, warn};
use uuid::Uuid;

/// Identifier of one transport connection.
pub type ConnectionId = Uuid;

struct ConnectionEntry {
    identity: Option<Identity>,
    sender: mpsc::Sender<OutboundEvent>,
    topics: HashSet<String>,
}

#[derive(Default)]
struct HubState {
    connections: HashMap<ConnectionId, ConnectionEntry>,
    personal: HashMap<String, HashSet<ConnectionId>>,
    topics: HashMap<String, HashSet<ConnectionId>>,
}

/// Shared connection registry and fan-out.
pub struct ChannelHub {
    state: RwLock<HubState>,
    queue_capacity: usize,
}

impl ChannelHub {
    #[must_use]
    pub fn new(queue_capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            state: RwLock::new(HubState::default()),
            queue_capacity: queue_capacity.max(1),
        })
    }

    /// Register a new connection and return its id and outbound queue.
    ///
    /// Authenticated connections are placed on their personal channel.
    pub async fn register(
        &self,
        identity: Option<Identity>,
    ) -> (ConnectionId, mpsc::Receiver<OutboundEvent>) {
        let (sender, receiver) = mpsc::channel(self.queue_capacity);
        let connection_id = Uuid::new_v4();

        let count = {
            let mut state = self.state.write().await;
            if let Some(identity) = &identity {
                state
                    .personal
                    .entry(identity.user_id.clone())
                    .or_default()
                    .insert(connection_id);
            }
            state.connections.insert(
                connection_id,
                ConnectionEntry {
                    identity,
                    sender,
                    topics: HashSet::new(),
                },
            );
            state.connections.len()
        };
        prom::set_connections_active(count);

        (connection_id, receiver)
    }

    /// Remove a connection from every channel. Idempotent.
    pub async fn unregister(&self, connection_id: ConnectionId) {
        let count = {
            let mut state = self.state.write().await;
            if let Some(entry) = state.connections.remove(&connection_id) {
                if let Some(identity) = &entry.identity {
                    remove_member(&mut state.personal, &identity.user_id, connection_id);
                }
                for topic in &entry.topics {
                    remove_member(&mut state.topics, topic, connection_id);
                }
            }
            state.connections.len()
        };
        prom::set_connections_active(count);
    }

    /// Add a connection to a topic room. Returns false for unknown connections.
    pub async fn subscribe(&self, connection_id: ConnectionId, topic: &str) -> bool {
        let mut state = self.state.write().await;
        let Some(entry) = state.connections.get_mut(&connection_id) else {
            return false;
        };
        entry.topics.insert(topic.to_string());
        state
            .topics
            .entry(topic.to_string())
            .or_default()
            .insert(connection_id);
        true
    }

    /// Remove a connection from a topic room.
    pub async fn unsubscribe(&self, connection_id: ConnectionId, topic: &str) {
        let mut state = self.state.write().await;
        if let Some(entry) = state.connections.get_mut(&connection_id) {
            entry.topics.remove(topic);
        }
        remove_member(&mut state.topics, topic, connection_id);
    }

    /// Queue an event for one connection. Returns whether it was queued.
    pub async fn send_to_connection(&self, connection_id: ConnectionId, event: OutboundEvent) -> bool {
        let target = {
            let state = self.state.read().await;
            state
                .connections
                .get(&connection_id)
                .map(|entry| entry.sender.clone())
        };
        match target {
            Some(sender) => deliver(connection_id, &sender, event),
            None => false,
        }
    }

    /// Queue an event on every connection of a user's personal channel.
    ///
    /// Returns the number of connections it was queued for.
    pub async fn send_to_user(&self, user_id: &str, event: &OutboundEvent) -> usize {
        let targets = {
            let state = self.state.read().await;
            collect_senders(&state, state.personal.get(user_id).into_iter().flatten(), None)
        };
        deliver_all(targets, event)
    }

    /// Queue an event for every connection in a topic room, optionally
    /// skipping one connection.
    pub async fn broadcast_topic(
        &self,
        topic: &str,
        event: &OutboundEvent,
        except: Option<ConnectionId>,
    ) -> usize {
        let targets = {
            let state = self.state.read().await;
            collect_senders(&state, state.topics.get(topic).into_iter().flatten(), except)
        };
        deliver_all(targets, event)
    }

    /// Queue an event for the union of a topic room and a user's personal
    /// channel. A connection reachable both ways receives it once.
    pub async fn broadcast_topic_and_user(
        &self,
        topic: &str,
        user_id: &str,
        event: &OutboundEvent,
    ) -> usize {
        let targets = {
            let state = self.state.read().await;
            let topic_members = state.topics.get(topic).into_iter().flatten();
            let personal = state.personal.get(user_id).into_iter().flatten();
            let union: HashSet<&ConnectionId> = topic_members.chain(personal).collect();
            collect_senders(&state, union.into_iter(), None)
        };
        deliver_all(targets, event)
    }

    /// Whether a user has at least one open connection.
    pub async fn is_online(&self, user_id: &str) -> bool {
        let state = self.state.read().await;
        state.personal.get(user_id).is_some_and(|c| !c.is_empty())
    }

    /// Whether a connection is subscribed to a topic room.
    pub async fn is_subscribed(&self, connection_id: ConnectionId, topic: &str) -> bool {
        let state = self.state.read().await;
        state
            .topics
            .get(topic)
            .is_some_and(|members| members.contains(&connection_id))
    }

    pub async fn connection_count(&self) -> usize {
        self.state.read().await.connections.len()
    }
}

fn remove_member(
    index: &mut HashMap<String, HashSet<ConnectionId>>,
    key: &str,
    connection_id: ConnectionId,
) {
    if let Some(members) = index.get_mut(key) {
        members.remove(&connection_id);
        if members.is_empty() {
            index.remove(key);
        }
    }
}

fn collect_senders<'a>(
    state: &HubState,
    ids: impl Iterator<Item = &'a ConnectionId>,
    except: Option<ConnectionId>,
) -> Vec<(ConnectionId, mpsc::Sender<OutboundEvent>)> {
    ids.filter(|id| Some(**id) != except)
        .filter_map(|id| {
            state
                .connections
                .get(id)
                .map(|entry| (*id, entry.sender.clone()))
        })
        .collect()
}

fn deliver_all(
    targets: Vec<(ConnectionId, mpsc::Sender<OutboundEvent>)>,
    event: &OutboundEvent,
) -> usize {
    targets
        .into_iter()
        .filter(|(id, sender)| deliver(*id, sender, event.clone()))
        .count()
}

fn deliver(
    connection_id: ConnectionId,
    sender: &mpsc::Sender<OutboundEvent>,
    event: OutboundEvent,
) -> bool {
    match sender.try_send(event) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(dropped)) => {
            warn!(
                target: "hub.ws",
                connection_id = %connection_id,
                event = dropped.event,
                "Outbound queue full, dropping event"
            );
            prom::record_message_dropped();
            false
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            debug!(
                target: "hub.ws",
                connection_id = %connection_id,
                "Outbound queue closed, connection is going away"
            );
            false
        }
    }
}
