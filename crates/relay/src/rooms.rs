use std::{
    collections::{BTreeSet, HashMap},
    sync::Arc,
};

use shared::{
    domain::{ConversationId, Identity, UserId},
    protocol::RelayEvent,
};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info};

use crate::presence::PresenceRegistry;

pub(crate) type ConnectionId = u64;

struct Connection {
    identity: Option<Identity>,
    outbound: mpsc::UnboundedSender<RelayEvent>,
    rooms: BTreeSet<ConversationId>,
}

#[derive(Default)]
struct RegistryState {
    next_connection_id: ConnectionId,
    connections: HashMap<ConnectionId, Connection>,
    rooms: HashMap<ConversationId, BTreeSet<ConnectionId>>,
    presence: PresenceRegistry,
}

impl RegistryState {
    fn deliver(&self, connection_id: ConnectionId, event: RelayEvent) -> bool {
        self.connections
            .get(&connection_id)
            .map(|connection| connection.outbound.send(event).is_ok())
            .unwrap_or(false)
    }

    fn deliver_to_authenticated(&self, event: &RelayEvent, exclude: Option<ConnectionId>) {
        for (connection_id, connection) in &self.connections {
            if Some(*connection_id) == exclude || connection.identity.is_none() {
                continue;
            }
            let _ = connection.outbound.send(event.clone());
        }
    }
}

/// Relay-side grouping of channel connections by conversation.
///
/// Every mutation and every fan-out happens under one lock, so all members
/// of a room observe events in the order they were emitted.
#[derive(Clone, Default)]
pub(crate) struct RoomMultiplexer {
    state: Arc<Mutex<RegistryState>>,
}

impl RoomMultiplexer {
    pub(crate) async fn register(
        &self,
        outbound: mpsc::UnboundedSender<RelayEvent>,
    ) -> ConnectionId {
        let mut state = self.state.lock().await;
        state.next_connection_id += 1;
        let connection_id = state.next_connection_id;
        state.connections.insert(
            connection_id,
            Connection {
                identity: None,
                outbound,
                rooms: BTreeSet::new(),
            },
        );
        debug!(connection_id, "relay: connection registered");
        connection_id
    }

    /// Binds an identity to the connection and announces the user as online
    /// when this is their first live connection.
    pub(crate) async fn authenticate(&self, connection_id: ConnectionId, identity: Identity) {
        let mut state = self.state.lock().await;
        let user_id = identity.user_id;
        let previous = match state.connections.get_mut(&connection_id) {
            Some(connection) => connection.identity.replace(identity),
            None => return,
        };

        if let Some(previous) = previous {
            if previous.user_id == user_id {
                return;
            }
            let rooms = state
                .connections
                .get_mut(&connection_id)
                .map(|connection| std::mem::take(&mut connection.rooms))
                .unwrap_or_default();
            for room in rooms {
                remove_from_room(&mut state.rooms, room, connection_id);
            }
            debug!(connection_id, "relay: identity changed, rooms dropped");
            if state.presence.disconnect(previous.user_id) {
                state.deliver_to_authenticated(
                    &RelayEvent::PresenceUpdate {
                        user_id: previous.user_id,
                        is_online: false,
                    },
                    None,
                );
            }
        }

        if state.presence.connect(user_id) {
            info!(connection_id, user_id = user_id.0, "relay: user online");
            state.deliver_to_authenticated(
                &RelayEvent::PresenceUpdate {
                    user_id,
                    is_online: true,
                },
                Some(connection_id),
            );
        }
    }

    pub(crate) async fn identity(&self, connection_id: ConnectionId) -> Option<Identity> {
        let state = self.state.lock().await;
        state
            .connections
            .get(&connection_id)
            .and_then(|connection| connection.identity.clone())
    }

    pub(crate) async fn join(&self, connection_id: ConnectionId, room: ConversationId) -> bool {
        let mut state = self.state.lock().await;
        let Some(connection) = state.connections.get_mut(&connection_id) else {
            return false;
        };
        connection.rooms.insert(room);
        state.rooms.entry(room).or_default().insert(connection_id);
        debug!(connection_id, conversation_id = room.0, "relay: joined room");
        true
    }

    pub(crate) async fn leave(&self, connection_id: ConnectionId, room: ConversationId) {
        let mut state = self.state.lock().await;
        if let Some(connection) = state.connections.get_mut(&connection_id) {
            connection.rooms.remove(&room);
        }
        remove_from_room(&mut state.rooms, room, connection_id);
    }

    pub(crate) async fn is_member(&self, connection_id: ConnectionId, room: ConversationId) -> bool {
        let state = self.state.lock().await;
        state
            .rooms
            .get(&room)
            .is_some_and(|members| members.contains(&connection_id))
    }

    /// Sends `event` to every connection in the room except `exclude`.
    /// Returns how many connections accepted it.
    pub(crate) async fn broadcast(
        &self,
        room: ConversationId,
        event: RelayEvent,
        exclude: Option<ConnectionId>,
    ) -> usize {
        let state = self.state.lock().await;
        let Some(members) = state.rooms.get(&room) else {
            return 0;
        };
        let mut delivered = 0;
        for connection_id in members {
            if Some(*connection_id) == exclude {
                continue;
            }
            if state.deliver(*connection_id, event.clone()) {
                delivered += 1;
            }
        }
        debug!(
            conversation_id = room.0,
            event = event.name(),
            delivered,
            "relay: room broadcast"
        );
        delivered
    }

    pub(crate) async fn send_to(&self, connection_id: ConnectionId, event: RelayEvent) -> bool {
        self.state.lock().await.deliver(connection_id, event)
    }

    pub(crate) async fn send_to_user(
        &self,
        user_id: UserId,
        event: RelayEvent,
        exclude: Option<ConnectionId>,
    ) -> usize {
        let state = self.state.lock().await;
        let mut delivered = 0;
        for (connection_id, connection) in &state.connections {
            if Some(*connection_id) == exclude {
                continue;
            }
            let owned_by_user = connection
                .identity
                .as_ref()
                .is_some_and(|identity| identity.user_id == user_id);
            if owned_by_user && connection.outbound.send(event.clone()).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    pub(crate) async fn online_users(&self) -> Vec<UserId> {
        self.state.lock().await.presence.online_users()
    }

    /// Drops the connection from every room; announces the user offline when
    /// it was their last connection.
    pub(crate) async fn disconnect(&self, connection_id: ConnectionId) {
        let mut state = self.state.lock().await;
        let Some(connection) = state.connections.remove(&connection_id) else {
            return;
        };
        for room in &connection.rooms {
            remove_from_room(&mut state.rooms, *room, connection_id);
        }
        if let Some(identity) = connection.identity {
            if state.presence.disconnect(identity.user_id) {
                info!(connection_id, user_id = identity.user_id.0, "relay: user offline");
                state.deliver_to_authenticated(
                    &RelayEvent::PresenceUpdate {
                        user_id: identity.user_id,
                        is_online: false,
                    },
                    None,
                );
            }
        }
        debug!(connection_id, "relay: connection dropped");
    }

    #[cfg(test)]
    pub(crate) async fn room_members(&self, room: ConversationId) -> Vec<ConnectionId> {
        let state = self.state.lock().await;
        state
            .rooms
            .get(&room)
            .map(|members| members.iter().copied().collect())
            .unwrap_or_default()
    }
}

fn remove_from_room(
    rooms: &mut HashMap<ConversationId, BTreeSet<ConnectionId>>,
    room: ConversationId,
    connection_id: ConnectionId,
) {
    if let Some(members) = rooms.get_mut(&room) {
        members.remove(&connection_id);
        if members.is_empty() {
            rooms.remove(&room);
        }
    }
}

#[cfg(test)]
#[path = "tests/rooms_tests.rs"]
mod tests;
