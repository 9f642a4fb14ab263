//! Connection registry
//!
//! Tracks every live WebSocket connection: its identity once authenticated,
//! the table it has joined, and the outbound channel its socket task drains.
//! All delivery (unicast, table multicast, server-wide broadcast) goes
//! through here; a send to a dead channel never fails the caller, the sweep
//! cleans the entry up.

use crate::gateway::Outbound;
use crate::stores::UserIdentity;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Live state of one connection
pub struct ConnectionEntry {
    pub conn_id: Uuid,
    pub addr: SocketAddr,
    pub user_id: Option<u64>,
    pub nickname: Option<String>,
    pub table_id: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub last_activity: Instant,
    sender: mpsc::UnboundedSender<Outbound>,
}

/// What remains of a connection after it is dropped, for presence cleanup
#[derive(Debug, Clone)]
pub struct DroppedConnection {
    pub conn_id: Uuid,
    pub user_id: Option<u64>,
    pub nickname: Option<String>,
    pub table_id: Option<u64>,
}

pub struct ConnectionRegistry {
    connections: DashMap<Uuid, ConnectionEntry>,
    /// One authenticated session per user; a new login replaces the old one
    by_user: DashMap<u64, Uuid>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            by_user: DashMap::new(),
        }
    }

    /// Admit a fresh, unauthenticated connection
    pub fn register(&self, addr: SocketAddr, sender: mpsc::UnboundedSender<Outbound>) -> Uuid {
        let conn_id = Uuid::new_v4();
        self.connections.insert(
            conn_id,
            ConnectionEntry {
                conn_id,
                addr,
                user_id: None,
                nickname: None,
                table_id: None,
                created_at: Utc::now(),
                last_activity: Instant::now(),
                sender,
            },
        );
        tracing::debug!(%conn_id, %addr, "connection registered");
        conn_id
    }

    /// Remove a connection entirely. Returns what was known about it so the
    /// caller can broadcast a user_left if it was seated at a table.
    pub fn unregister(&self, conn_id: Uuid) -> Option<DroppedConnection> {
        let (_, entry) = self.connections.remove(&conn_id)?;
        if let Some(user_id) = entry.user_id {
            self.by_user.remove_if(&user_id, |_, held| *held == conn_id);
        }
        tracing::debug!(%conn_id, "connection unregistered");
        Some(DroppedConnection {
            conn_id,
            user_id: entry.user_id,
            nickname: entry.nickname,
            table_id: entry.table_id,
        })
    }

    /// Bind a verified identity to the connection. If the user already has a
    /// live session elsewhere, that session is evicted and returned so the
    /// caller can notify and drop it.
    pub fn authenticate(&self, conn_id: Uuid, identity: &UserIdentity) -> Option<Uuid> {
        let evicted = match self.by_user.insert(identity.user_id, conn_id) {
            Some(old) if old != conn_id => Some(old),
            _ => None,
        };
        if let Some(mut entry) = self.connections.get_mut(&conn_id) {
            entry.user_id = Some(identity.user_id);
            entry.nickname = Some(identity.nickname.clone());
            entry.last_activity = Instant::now();
        }
        evicted
    }

    /// Drop the authenticated identity but keep the socket open
    pub fn logout(&self, conn_id: Uuid) -> Option<DroppedConnection> {
        let mut entry = self.connections.get_mut(&conn_id)?;
        let user_id = entry.user_id.take();
        let nickname = entry.nickname.take();
        let table_id = entry.table_id.take();
        drop(entry);
        if let Some(user_id) = user_id {
            self.by_user.remove_if(&user_id, |_, held| *held == conn_id);
        }
        Some(DroppedConnection {
            conn_id,
            user_id,
            nickname,
            table_id,
        })
    }

    /// Seat the connection at a table, implicitly leaving any prior table.
    /// Returns the table left, if any.
    pub fn join_table(&self, conn_id: Uuid, table_id: u64) -> Option<u64> {
        let mut entry = self.connections.get_mut(&conn_id)?;
        let prior = entry.table_id.replace(table_id);
        prior.filter(|p| *p != table_id)
    }

    pub fn leave_table(&self, conn_id: Uuid) -> Option<u64> {
        self.connections.get_mut(&conn_id)?.table_id.take()
    }

    pub fn touch(&self, conn_id: Uuid) {
        if let Some(mut entry) = self.connections.get_mut(&conn_id) {
            entry.last_activity = Instant::now();
        }
    }

    /// Identity and seat of a connection, if it exists
    pub fn snapshot(&self, conn_id: Uuid) -> Option<DroppedConnection> {
        self.connections.get(&conn_id).map(|e| DroppedConnection {
            conn_id,
            user_id: e.user_id,
            nickname: e.nickname.clone(),
            table_id: e.table_id,
        })
    }

    /// Send to one connection. Returns false if it is gone or its channel
    /// is closed.
    pub fn unicast(&self, conn_id: Uuid, message: &Outbound) -> bool {
        match self.connections.get(&conn_id) {
            Some(entry) => entry.sender.send(message.clone()).is_ok(),
            None => false,
        }
    }

    /// Send to a user's live session, wherever it is connected
    pub fn send_to_user(&self, user_id: u64, message: &Outbound) -> bool {
        match self.by_user.get(&user_id) {
            Some(conn_id) => self.unicast(*conn_id, message),
            None => false,
        }
    }

    /// Send to every connection seated at a table, optionally excluding the
    /// actor. A failed send never interrupts the rest of the fan-out.
    pub fn multicast_table(&self, table_id: u64, message: &Outbound, exclude: Option<Uuid>) {
        for entry in self.connections.iter() {
            if entry.table_id != Some(table_id) {
                continue;
            }
            if exclude == Some(entry.conn_id) {
                continue;
            }
            if entry.sender.send(message.clone()).is_err() {
                tracing::debug!(conn_id = %entry.conn_id, "dropping frame for closed channel");
            }
        }
    }

    /// Send to every live connection (heartbeat)
    pub fn broadcast_all(&self, message: &Outbound) {
        for entry in self.connections.iter() {
            let _ = entry.sender.send(message.clone());
        }
    }

    pub fn table_population(&self, table_id: u64) -> usize {
        self.connections
            .iter()
            .filter(|e| e.table_id == Some(table_id))
            .count()
    }

    /// Tables with at least one seated connection
    pub fn active_table_ids(&self) -> Vec<u64> {
        let mut ids: HashSet<u64> = HashSet::new();
        for entry in self.connections.iter() {
            if let Some(table_id) = entry.table_id {
                ids.insert(table_id);
            }
        }
        ids.into_iter().collect()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn authenticated_count(&self) -> usize {
        self.by_user.len()
    }

    /// Drop connections that never authenticated within the grace period or
    /// have been silent past the idle timeout. Returns what was dropped so
    /// the caller can broadcast presence updates and close sockets.
    pub fn sweep(&self, auth_grace: Duration, idle_timeout: Duration) -> Vec<DroppedConnection> {
        let now = Instant::now();
        let wall_now = Utc::now();
        let stale: Vec<Uuid> = self
            .connections
            .iter()
            .filter(|entry| {
                let idle = now.duration_since(entry.last_activity);
                match entry.user_id {
                    None => {
                        let age = (wall_now - entry.created_at)
                            .to_std()
                            .unwrap_or(Duration::ZERO);
                        age > auth_grace
                    }
                    Some(_) => idle > idle_timeout,
                }
            })
            .map(|entry| entry.conn_id)
            .collect();

        let mut dropped = Vec::with_capacity(stale.len());
        for conn_id in stale {
            if let Some(d) = self.unregister(conn_id) {
                tracing::info!(conn_id = %d.conn_id, user_id = ?d.user_id, "swept stale connection");
                dropped.push(d);
            }
        }
        dropped
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

    fn addr() -> SocketAddr {
        "127.0.0.1:9000".parse().unwrap()
    }

    fn identity(user_id: u64) -> UserIdentity {
        UserIdentity {
            user_id,
            nickname: format!("user{}", user_id),
        }
    }

    fn connect(
        registry: &ConnectionRegistry,
    ) -> (Uuid, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (registry.register(addr(), tx), rx)
    }

    #[tokio::test]
    async fn test_join_table_implicitly_leaves_prior() {
        let registry = ConnectionRegistry::new();
        let (conn, _rx) = connect(&registry);
        registry.authenticate(conn, &identity(1));

        assert_eq!(registry.join_table(conn, 7), None);
        assert_eq!(registry.table_population(7), 1);

        // Moving tables reports the table left behind
        assert_eq!(registry.join_table(conn, 8), Some(7));
        assert_eq!(registry.table_population(7), 0);
        assert_eq!(registry.table_population(8), 1);

        // Re-joining the same table is not a move
        assert_eq!(registry.join_table(conn, 8), None);
    }

    #[tokio::test]
    async fn test_multicast_excludes_actor() {
        let registry = ConnectionRegistry::new();
        let (a, mut rx_a) = connect(&registry);
        let (b, mut rx_b) = connect(&registry);
        registry.authenticate(a, &identity(1));
        registry.authenticate(b, &identity(2));
        registry.join_table(a, 7);
        registry.join_table(b, 7);

        registry.multicast_table(
            7,
            &Outbound::UserJoined {
                user_id: 1,
                nickname: "user1".to_string(),
            },
            Some(a),
        );
        assert!(rx_b.try_recv().is_ok());
        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_duplicate_login_evicts_old_session() {
        let registry = ConnectionRegistry::new();
        let (old, _rx_old) = connect(&registry);
        let (new, _rx_new) = connect(&registry);

        assert_eq!(registry.authenticate(old, &identity(1)), None);
        assert_eq!(registry.authenticate(new, &identity(1)), Some(old));

        // user index now points at the new session
        assert!(registry.send_to_user(1, &Outbound::Pong));
        registry.unregister(old);
        assert!(registry.send_to_user(1, &Outbound::Pong));
    }

    #[tokio::test]
    async fn test_sweep_drops_unauthenticated_after_grace() {
        let registry = ConnectionRegistry::new();
        let (anon, _rx1) = connect(&registry);
        let (authed, _rx2) = connect(&registry);
        registry.authenticate(authed, &identity(1));

        // Zero grace: anonymous connection goes, authenticated one stays
        let dropped = registry.sweep(Duration::ZERO, Duration::from_secs(90));
        assert_eq!(dropped.len(), 1);
        assert_eq!(dropped[0].conn_id, anon);
        assert_eq!(registry.connection_count(), 1);
    }

    #[tokio::test]
    async fn test_sweep_drops_idle_authenticated() {
        let registry = ConnectionRegistry::new();
        let (conn, _rx) = connect(&registry);
        registry.authenticate(conn, &identity(1));
        registry.join_table(conn, 7);

        let dropped = registry.sweep(Duration::from_secs(30), Duration::ZERO);
        assert_eq!(dropped.len(), 1);
        assert_eq!(dropped[0].table_id, Some(7));
        assert_eq!(registry.authenticated_count(), 0);
    }

    #[tokio::test]
    async fn test_logout_clears_identity_and_seat() {
        let registry = ConnectionRegistry::new();
        let (conn, _rx) = connect(&registry);
        registry.authenticate(conn, &identity(1));
        registry.join_table(conn, 7);

        let dropped = registry.logout(conn).unwrap();
        assert_eq!(dropped.user_id, Some(1));
        assert_eq!(dropped.table_id, Some(7));
        assert!(!registry.send_to_user(1, &Outbound::Pong));
        // Socket itself stays registered
        assert_eq!(registry.connection_count(), 1);
    }
}
