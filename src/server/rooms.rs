use crate::common::models::ServerEvent;
use log::debug;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc::UnboundedSender, Mutex};

pub type ConnectionId = String;

pub fn user_room(user_id: &str) -> String {
    format!("user:{}", user_id)
}

pub fn project_room(project_id: &str) -> String {
    format!("project:{}", project_id)
}

/// In-memory room membership: room -> connection -> outbound event sender.
/// Purely ephemeral; a connection's memberships vanish with it and clients
/// re-join after reconnecting. Broadcasts take a snapshot under the lock so
/// a join racing a broadcast either sees the whole event or none of it.
#[derive(Clone, Default)]
pub struct RoomRegistry {
    inner: Arc<Mutex<HashMap<String, HashMap<ConnectionId, UnboundedSender<ServerEvent>>>>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn join(&self, room: &str, conn: &ConnectionId, tx: UnboundedSender<ServerEvent>) {
        let mut rooms = self.inner.lock().await;
        rooms.entry(room.to_string()).or_default().insert(conn.clone(), tx);
        debug!("[ROOMS] {} joined {}", conn, room);
    }

    pub async fn leave(&self, room: &str, conn: &ConnectionId) {
        let mut rooms = self.inner.lock().await;
        if let Some(members) = rooms.get_mut(room) {
            members.remove(conn);
            if members.is_empty() {
                rooms.remove(room);
            }
        }
        debug!("[ROOMS] {} left {}", conn, room);
    }

    /// Disconnect cleanup: drop the connection from every room.
    pub async fn leave_all(&self, conn: &ConnectionId) {
        let mut rooms = self.inner.lock().await;
        rooms.retain(|_, members| {
            members.remove(conn);
            !members.is_empty()
        });
    }

    pub async fn room_size(&self, room: &str) -> usize {
        let rooms = self.inner.lock().await;
        rooms.get(room).map(|m| m.len()).unwrap_or(0)
    }

    /// Deliver an event to every current member of the room, optionally
    /// excluding one connection (the sender). Returns the number of
    /// connections the event was handed to; zero means nobody was there,
    /// which callers log as a dropped delivery.
    pub async fn broadcast(
        &self,
        room: &str,
        event: &ServerEvent,
        exclude: Option<&ConnectionId>,
    ) -> usize {
        let recipients: Vec<UnboundedSender<ServerEvent>> = {
            let rooms = self.inner.lock().await;
            match rooms.get(room) {
                Some(members) => members
                    .iter()
                    .filter(|(conn, _)| exclude.map_or(true, |ex| *conn != ex))
                    .map(|(_, tx)| tx.clone())
                    .collect(),
                None => Vec::new(),
            }
        };

        let mut delivered = 0;
        for tx in recipients {
            if tx.send(event.clone()).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    /// Shorthand for the per-user room every client joins for itself.
    pub async fn send_to_user(&self, user_id: &str, event: &ServerEvent) -> usize {
        self.broadcast(&user_room(user_id), event, None).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn event() -> ServerEvent {
        ServerEvent::CallEnded { session_id: "s1".into() }
    }

    #[tokio::test]
    async fn broadcast_reaches_all_members_except_excluded() {
        let rooms = RoomRegistry::new();
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        rooms.join("project:p1", &"conn-a".to_string(), tx_a).await;
        rooms.join("project:p1", &"conn-b".to_string(), tx_b).await;

        let delivered = rooms
            .broadcast("project:p1", &event(), Some(&"conn-a".to_string()))
            .await;
        assert_eq!(delivered, 1);
        assert!(rx_b.try_recv().is_ok());
        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn broadcast_to_empty_room_delivers_nothing() {
        let rooms = RoomRegistry::new();
        assert_eq!(rooms.broadcast("user:nobody", &event(), None).await, 0);
    }

    #[tokio::test]
    async fn a_connection_may_belong_to_multiple_rooms() {
        let rooms = RoomRegistry::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn = "conn-a".to_string();
        rooms.join(&user_room("u1"), &conn, tx.clone()).await;
        rooms.join(&project_room("p1"), &conn, tx).await;

        rooms.send_to_user("u1", &event()).await;
        rooms.broadcast(&project_room("p1"), &event(), None).await;
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn leave_all_clears_every_membership() {
        let rooms = RoomRegistry::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let conn = "conn-a".to_string();
        rooms.join(&user_room("u1"), &conn, tx.clone()).await;
        rooms.join(&project_room("p1"), &conn, tx).await;

        rooms.leave_all(&conn).await;
        assert_eq!(rooms.room_size(&user_room("u1")).await, 0);
        assert_eq!(rooms.room_size(&project_room("p1")).await, 0);
    }

    #[tokio::test]
    async fn leave_removes_only_that_room() {
        let rooms = RoomRegistry::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let conn = "conn-a".to_string();
        rooms.join(&project_room("p1"), &conn, tx.clone()).await;
        rooms.join(&project_room("p2"), &conn, tx).await;

        rooms.leave(&project_room("p1"), &conn).await;
        assert_eq!(rooms.room_size(&project_room("p1")).await, 0);
        assert_eq!(rooms.room_size(&project_room("p2")).await, 1);
    }
}
