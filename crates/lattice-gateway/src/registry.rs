use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{RwLock, mpsc};
use uuid::Uuid;

use lattice_types::events::{GatewayEvent, RoomId};

/// In-memory, per-process registry of live connections: which users are
/// reachable and which rooms each connection has joined. Owned by the
/// gateway and passed by handle rather than living in ambient global state.
/// Nothing here is durable; the whole structure is rebuilt from reconnects
/// after a restart.
///
/// The registry is deliberately forgiving: unknown connection or room ids
/// are no-ops because it only mirrors transient transport state.
/// Authorization is the gateway's job, not the registry's.
#[derive(Clone)]
pub struct ConnectionRegistry {
    state: Arc<RwLock<RegistryState>>,
}

#[derive(Default)]
struct RegistryState {
    /// conn_id -> live connection entry
    connections: HashMap<Uuid, Connected>,
    /// user_id -> that user's connection ids (multi-device)
    users: HashMap<Uuid, HashSet<Uuid>>,
    /// room -> connection ids currently joined
    rooms: HashMap<RoomId, HashSet<Uuid>>,
}

struct Connected {
    user_id: Uuid,
    username: String,
    rooms: HashSet<RoomId>,
    tx: mpsc::UnboundedSender<GatewayEvent>,
}

/// What `unregister` tore down, so the gateway can emit the matching
/// presence and room-departure events.
pub struct Disconnected {
    pub user_id: Uuid,
    pub username: String,
    /// True when this was the user's last connection.
    pub went_offline: bool,
    /// Rooms the connection was still joined to.
    pub rooms: Vec<RoomId>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(RegistryState::default())),
        }
    }

    /// Adds a connection under the user. Multiple connections per user are
    /// expected (multi-device); there is no error path. Returns the new
    /// connection id and the receiving half of its delivery channel.
    pub async fn register(
        &self,
        user_id: Uuid,
        username: String,
    ) -> (Uuid, mpsc::UnboundedReceiver<GatewayEvent>) {
        let conn_id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();

        let mut state = self.state.write().await;
        state.connections.insert(
            conn_id,
            Connected {
                user_id,
                username,
                rooms: HashSet::new(),
                tx,
            },
        );
        state.users.entry(user_id).or_default().insert(conn_id);

        (conn_id, rx)
    }

    /// Removes a connection from its user's set and from every room it had
    /// joined. Unknown ids are a no-op (`None`).
    pub async fn unregister(&self, conn_id: Uuid) -> Option<Disconnected> {
        let mut state = self.state.write().await;
        let entry = state.connections.remove(&conn_id)?;

        for room in &entry.rooms {
            if let Some(members) = state.rooms.get_mut(room) {
                members.remove(&conn_id);
                if members.is_empty() {
                    state.rooms.remove(room);
                }
            }
        }

        let went_offline = match state.users.get_mut(&entry.user_id) {
            Some(conns) => {
                conns.remove(&conn_id);
                if conns.is_empty() {
                    state.users.remove(&entry.user_id);
                    true
                } else {
                    false
                }
            }
            None => true,
        };

        Some(Disconnected {
            user_id: entry.user_id,
            username: entry.username,
            went_offline,
            rooms: entry.rooms.into_iter().collect(),
        })
    }

    /// Pure membership mutation; no-op for unknown connections.
    pub async fn join_room(&self, conn_id: Uuid, room: RoomId) {
        let mut guard = self.state.write().await;
        let state = &mut *guard;
        let Some(entry) = state.connections.get_mut(&conn_id) else {
            return;
        };
        entry.rooms.insert(room);
        state.rooms.entry(room).or_default().insert(conn_id);
    }

    /// Pure membership mutation; no-op for unknown connections or rooms.
    pub async fn leave_room(&self, conn_id: Uuid, room: RoomId) {
        let mut state = self.state.write().await;
        if let Some(entry) = state.connections.get_mut(&conn_id) {
            entry.rooms.remove(&room);
        }
        if let Some(members) = state.rooms.get_mut(&room) {
            members.remove(&conn_id);
            if members.is_empty() {
                state.rooms.remove(&room);
            }
        }
    }

    pub async fn in_room(&self, conn_id: Uuid, room: RoomId) -> bool {
        let state = self.state.read().await;
        state
            .rooms
            .get(&room)
            .is_some_and(|members| members.contains(&conn_id))
    }

    pub async fn connections_for_user(&self, user_id: Uuid) -> Vec<Uuid> {
        let state = self.state.read().await;
        state
            .users
            .get(&user_id)
            .map(|conns| conns.iter().copied().collect())
            .unwrap_or_default()
    }

    pub async fn connections_in_room(&self, room: RoomId) -> Vec<Uuid> {
        let state = self.state.read().await;
        state
            .rooms
            .get(&room)
            .map(|members| members.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Whether the user currently has at least one live connection.
    pub async fn is_online(&self, user_id: Uuid) -> bool {
        let state = self.state.read().await;
        state.users.contains_key(&user_id)
    }

    /// Distinct online users and their usernames, for presence replay on
    /// connect.
    pub async fn online_users(&self) -> Vec<(Uuid, String)> {
        let state = self.state.read().await;
        let mut seen = HashSet::new();
        let mut users = Vec::new();
        for entry in state.connections.values() {
            if seen.insert(entry.user_id) {
                users.push((entry.user_id, entry.username.clone()));
            }
        }
        users
    }

    /// Targeted delivery to every connection of a user. Best-effort: closed
    /// channels are skipped, the connection teardown path cleans them up.
    pub async fn send_to_user(&self, user_id: Uuid, event: GatewayEvent) {
        let state = self.state.read().await;
        let Some(conns) = state.users.get(&user_id) else {
            return;
        };
        for conn_id in conns {
            if let Some(entry) = state.connections.get(conn_id) {
                let _ = entry.tx.send(event.clone());
            }
        }
    }

    /// Delivery to a single connection, used for error events that must only
    /// reach the initiator.
    pub async fn send_to_conn(&self, conn_id: Uuid, event: GatewayEvent) {
        let state = self.state.read().await;
        if let Some(entry) = state.connections.get(&conn_id) {
            let _ = entry.tx.send(event);
        }
    }

    /// Room-scoped fan-out. `exclude` skips one connection (the typing
    /// sender, for instance); pass `None` to include the sender's own
    /// connections, which message broadcast wants so every device converges.
    pub async fn broadcast_to_room(&self, room: RoomId, event: GatewayEvent, exclude: Option<Uuid>) {
        let state = self.state.read().await;
        let Some(members) = state.rooms.get(&room) else {
            return;
        };
        for conn_id in members {
            if Some(*conn_id) == exclude {
                continue;
            }
            if let Some(entry) = state.connections.get(conn_id) {
                let _ = entry.tx.send(event.clone());
            }
        }
    }

    /// Fan-out to every live connection (presence updates).
    pub async fn broadcast_all(&self, event: GatewayEvent) {
        let state = self.state.read().await;
        for entry in state.connections.values() {
            let _ = entry.tx.send(event.clone());
        }
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn room(id: Uuid) -> RoomId {
        RoomId::Group(id)
    }

    #[tokio::test]
    async fn multi_device_presence_transitions() {
        let registry = ConnectionRegistry::new();
        let user = Uuid::new_v4();

        let (conn_a, _rx_a) = registry.register(user, "amira".into()).await;
        let (conn_b, _rx_b) = registry.register(user, "amira".into()).await;
        assert!(registry.is_online(user).await);
        assert_eq!(registry.connections_for_user(user).await.len(), 2);

        let first = registry.unregister(conn_a).await.unwrap();
        assert!(!first.went_offline);
        assert!(registry.is_online(user).await);

        let second = registry.unregister(conn_b).await.unwrap();
        assert!(second.went_offline);
        assert!(!registry.is_online(user).await);
    }

    #[tokio::test]
    async fn unknown_ids_are_noops() {
        let registry = ConnectionRegistry::new();
        assert!(registry.unregister(Uuid::new_v4()).await.is_none());
        registry.join_room(Uuid::new_v4(), room(Uuid::new_v4())).await;
        registry.leave_room(Uuid::new_v4(), room(Uuid::new_v4())).await;
        assert!(registry.connections_in_room(room(Uuid::new_v4())).await.is_empty());
    }

    #[tokio::test]
    async fn unregister_clears_room_membership() {
        let registry = ConnectionRegistry::new();
        let user = Uuid::new_v4();
        let r = room(Uuid::new_v4());

        let (conn, _rx) = registry.register(user, "amira".into()).await;
        registry.join_room(conn, r).await;
        assert!(registry.in_room(conn, r).await);

        let gone = registry.unregister(conn).await.unwrap();
        assert_eq!(gone.rooms, vec![r]);
        assert!(registry.connections_in_room(r).await.is_empty());
    }

    #[tokio::test]
    async fn room_broadcast_reaches_members_only() {
        let registry = ConnectionRegistry::new();
        let r = room(Uuid::new_v4());

        let (conn_a, mut rx_a) = registry.register(Uuid::new_v4(), "a".into()).await;
        let (conn_b, mut rx_b) = registry.register(Uuid::new_v4(), "b".into()).await;
        let (_conn_c, mut rx_c) = registry.register(Uuid::new_v4(), "c".into()).await;

        registry.join_room(conn_a, r).await;
        registry.join_room(conn_b, r).await;

        let event = GatewayEvent::MemberJoined {
            room: r,
            user_id: Uuid::new_v4(),
        };
        registry.broadcast_to_room(r, event, Some(conn_a)).await;

        // Excluded sender and non-member get nothing
        assert!(rx_a.try_recv().is_err());
        assert!(rx_c.try_recv().is_err());
        assert!(matches!(
            rx_b.try_recv(),
            Ok(GatewayEvent::MemberJoined { .. })
        ));
    }

    #[tokio::test]
    async fn send_to_user_hits_all_devices() {
        let registry = ConnectionRegistry::new();
        let user = Uuid::new_v4();
        let (_a, mut rx_a) = registry.register(user, "amira".into()).await;
        let (_b, mut rx_b) = registry.register(user, "amira".into()).await;

        registry
            .send_to_user(
                user,
                GatewayEvent::MessageRead {
                    message_id: Uuid::new_v4(),
                    conversation_id: Uuid::new_v4(),
                    reader_id: Uuid::new_v4(),
                },
            )
            .await;

        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_ok());
    }

    #[tokio::test]
    async fn leave_room_stops_delivery() {
        let registry = ConnectionRegistry::new();
        let r = room(Uuid::new_v4());
        let (conn, mut rx) = registry.register(Uuid::new_v4(), "a".into()).await;

        registry.join_room(conn, r).await;
        registry.leave_room(conn, r).await;
        assert!(!registry.in_room(conn, r).await);

        registry
            .broadcast_to_room(
                r,
                GatewayEvent::MemberLeft {
                    room: r,
                    user_id: Uuid::new_v4(),
                },
                None,
            )
            .await;
        assert!(rx.try_recv().is_err());
    }
}
