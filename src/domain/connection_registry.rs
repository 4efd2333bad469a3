//! Concurrent connection tracking grouped by user.
//!
//! [`ConnectionRegistry`] keeps two maps behind one [`tokio::sync::RwLock`]:
//! connection id → [`Connection`], and user id → that user's connection ids.
//! Keeping both under a single lock is what guarantees that a user key is
//! never observable with an empty connection list: the read-modify-delete
//! on deregistration happens inside one exclusive critical section.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::RwLock;
use utoipa::ToSchema;

use super::connection::{Connection, ConnectionSummary, NewConnection};
use super::{ConnectionId, UserId};
use crate::transport::FrameSink;

#[derive(Debug, Default)]
struct RegistryState {
    connections: HashMap<ConnectionId, Connection>,
    users: HashMap<UserId, Vec<ConnectionId>>,
}

/// Result of removing one connection.
#[derive(Debug)]
pub struct Deregistered {
    /// The removed connection.
    pub connection: Connection,
    /// Connections the owning user still has after the removal.
    pub remaining: usize,
}

/// Aggregate counters for observability endpoints.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct RegistryStats {
    /// Number of live connections across all users.
    pub total_connections: usize,
    /// Number of users with at least one live connection.
    pub total_users: usize,
    /// Online user ids in ascending order.
    pub online_users: Vec<UserId>,
}

/// In-memory registry of live connections.
///
/// # Concurrency
///
/// - Mutations (`register`, `deregister`, `touch`, `remove_user`) take the
///   exclusive lock.
/// - Queries take the shared lock and return owned snapshots.
/// - Sink snapshots are returned so callers can perform I/O after the lock
///   is released.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    state: RwLock<RegistryState>,
}

impl ConnectionRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a connection under a fresh identifier and appends it to the
    /// owner's connection list.
    pub async fn register(&self, new: NewConnection) -> ConnectionId {
        let connection_id = ConnectionId::new();
        let connection = Connection::from_new(connection_id, new);
        let user_id = connection.user_id;

        let mut guard = self.state.write().await;
        let state = &mut *guard;
        tracing::info!(
            %user_id,
            email = %connection.email,
            %connection_id,
            "connection registered"
        );
        state.connections.insert(connection_id, connection);
        let ids = state.users.entry(user_id).or_default();
        ids.push(connection_id);
        tracing::debug!(
            %user_id,
            user_connections = ids.len(),
            total_connections = state.connections.len(),
            "registry totals"
        );
        connection_id
    }

    /// Removes a connection. Returns `None` if it was already removed.
    ///
    /// Drops the owner's entry entirely when its last connection goes.
    pub async fn deregister(&self, connection_id: ConnectionId) -> Option<Deregistered> {
        let mut guard = self.state.write().await;
        let state = &mut *guard;
        let connection = state.connections.remove(&connection_id)?;
        let user_id = connection.user_id;

        let remaining = match state.users.get_mut(&user_id) {
            Some(ids) => {
                ids.retain(|id| *id != connection_id);
                ids.len()
            }
            None => 0,
        };
        if remaining == 0 {
            state.users.remove(&user_id);
        }

        tracing::info!(
            %user_id,
            email = %connection.email,
            %connection_id,
            remaining,
            "connection deregistered"
        );
        Some(Deregistered {
            connection,
            remaining,
        })
    }

    /// Removes every connection of a user in one critical section.
    pub async fn remove_user(&self, user_id: UserId) -> Vec<Connection> {
        let mut guard = self.state.write().await;
        let state = &mut *guard;
        let ids = state.users.remove(&user_id).unwrap_or_default();
        ids.iter()
            .filter_map(|id| state.connections.remove(id))
            .collect()
    }

    /// Records inbound activity. Returns `false` for unknown connections.
    pub async fn touch(&self, connection_id: ConnectionId) -> bool {
        let mut state = self.state.write().await;
        match state.connections.get_mut(&connection_id) {
            Some(conn) => {
                conn.last_active = Utc::now();
                true
            }
            None => false,
        }
    }

    /// Snapshot of a user's connection ids, in registration order.
    pub async fn connections_for_user(&self, user_id: UserId) -> Vec<ConnectionId> {
        self.state
            .read()
            .await
            .users
            .get(&user_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Returns `true` if the user has at least one live connection.
    pub async fn is_online(&self, user_id: UserId) -> bool {
        self.state.read().await.users.contains_key(&user_id)
    }

    /// Number of live connections owned by the user.
    pub async fn connection_count(&self, user_id: UserId) -> usize {
        self.state
            .read()
            .await
            .users
            .get(&user_id)
            .map_or(0, Vec::len)
    }

    /// Users with at least one live connection, ascending.
    pub async fn online_users(&self) -> Vec<UserId> {
        let state = self.state.read().await;
        let mut users: Vec<UserId> = state.users.keys().copied().collect();
        users.sort_unstable();
        users
    }

    /// Aggregate totals.
    pub async fn stats(&self) -> RegistryStats {
        let state = self.state.read().await;
        let mut online_users: Vec<UserId> = state.users.keys().copied().collect();
        online_users.sort_unstable();
        RegistryStats {
            total_connections: state.connections.len(),
            total_users: state.users.len(),
            online_users,
        }
    }

    /// Transport-free view of one connection.
    pub async fn get(&self, connection_id: ConnectionId) -> Option<ConnectionSummary> {
        self.state
            .read()
            .await
            .connections
            .get(&connection_id)
            .map(ConnectionSummary::from)
    }

    /// Transport-free views of a user's connections.
    pub async fn summaries_for_user(&self, user_id: UserId) -> Vec<ConnectionSummary> {
        let state = self.state.read().await;
        state
            .users
            .get(&user_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| state.connections.get(id))
                    .map(ConnectionSummary::from)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Number of live connections across all users.
    pub async fn len(&self) -> usize {
        self.state.read().await.connections.len()
    }

    /// Returns `true` if no connection is registered.
    pub async fn is_empty(&self) -> bool {
        self.state.read().await.connections.is_empty()
    }

    /// Sink of a single connection.
    pub(crate) async fn sink_for(&self, connection_id: ConnectionId) -> Option<Arc<dyn FrameSink>> {
        self.state
            .read()
            .await
            .connections
            .get(&connection_id)
            .map(|conn| Arc::clone(&conn.sink))
    }

    /// Sinks of a user's connections.
    pub(crate) async fn sinks_for_user(
        &self,
        user_id: UserId,
    ) -> Vec<(ConnectionId, Arc<dyn FrameSink>)> {
        let state = self.state.read().await;
        state
            .users
            .get(&user_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| state.connections.get(id))
                    .map(|conn| (conn.connection_id, Arc::clone(&conn.sink)))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Sinks of every live connection.
    pub(crate) async fn all_sinks(&self) -> Vec<(ConnectionId, Arc<dyn FrameSink>)> {
        self.state
            .read()
            .await
            .connections
            .values()
            .map(|conn| (conn.connection_id, Arc::clone(&conn.sink)))
            .collect()
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;
    use crate::transport::RecordingSink;
    use proptest::prelude::*;

    fn new_conn(user: i64) -> NewConnection {
        NewConnection {
            user_id: UserId::new(user),
            email: format!("user{user}@example.com"),
            sink: Arc::new(RecordingSink::new()),
        }
    }

    async fn assert_consistent(registry: &ConnectionRegistry) {
        let state = registry.state.read().await;
        let mut grouped = 0;
        for (user, ids) in &state.users {
            assert!(!ids.is_empty(), "user {user} kept with empty set");
            for id in ids {
                let Some(conn) = state.connections.get(id) else {
                    panic!("dangling connection id {id}");
                };
                assert_eq!(conn.user_id, *user);
            }
            grouped += ids.len();
        }
        assert_eq!(grouped, state.connections.len());
    }

    #[tokio::test]
    async fn register_groups_by_user() {
        let registry = ConnectionRegistry::new();
        let a1 = registry.register(new_conn(1)).await;
        let a2 = registry.register(new_conn(1)).await;
        let _b = registry.register(new_conn(2)).await;

        assert_eq!(registry.connections_for_user(UserId::new(1)).await, vec![a1, a2]);
        assert_eq!(registry.connection_count(UserId::new(2)).await, 1);
        assert_eq!(registry.len().await, 3);
        assert_eq!(
            registry.online_users().await,
            vec![UserId::new(1), UserId::new(2)]
        );
    }

    #[tokio::test]
    async fn deregister_last_connection_removes_user_key() {
        let registry = ConnectionRegistry::new();
        let id = registry.register(new_conn(5)).await;
        assert!(registry.is_online(UserId::new(5)).await);

        let Some(removed) = registry.deregister(id).await else {
            panic!("expected removal");
        };
        assert_eq!(removed.remaining, 0);
        assert!(!registry.is_online(UserId::new(5)).await);
        assert!(registry.online_users().await.is_empty());
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn deregister_is_idempotent() {
        let registry = ConnectionRegistry::new();
        let keep = registry.register(new_conn(1)).await;
        let gone = registry.register(new_conn(1)).await;

        assert!(registry.deregister(gone).await.is_some());
        assert!(registry.deregister(gone).await.is_none());
        assert_eq!(registry.connections_for_user(UserId::new(1)).await, vec![keep]);
    }

    #[tokio::test]
    async fn touch_updates_last_active() {
        let registry = ConnectionRegistry::new();
        let id = registry.register(new_conn(1)).await;
        let Some(before) = registry.get(id).await else {
            panic!("registered connection missing");
        };
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;

        assert!(registry.touch(id).await);
        let Some(after) = registry.get(id).await else {
            panic!("registered connection missing");
        };
        assert!(after.last_active > before.last_active);
        assert!(!registry.touch(ConnectionId::new()).await);
    }

    #[tokio::test]
    async fn remove_user_drops_all_connections() {
        let registry = ConnectionRegistry::new();
        registry.register(new_conn(1)).await;
        registry.register(new_conn(1)).await;
        registry.register(new_conn(2)).await;

        let removed = registry.remove_user(UserId::new(1)).await;
        assert_eq!(removed.len(), 2);
        assert!(!registry.is_online(UserId::new(1)).await);
        assert_eq!(registry.len().await, 1);
        assert_consistent(&registry).await;
    }

    #[tokio::test]
    async fn stats_report_totals() {
        let registry = ConnectionRegistry::new();
        registry.register(new_conn(3)).await;
        registry.register(new_conn(3)).await;
        registry.register(new_conn(1)).await;

        let stats = registry.stats().await;
        assert_eq!(stats.total_connections, 3);
        assert_eq!(stats.total_users, 2);
        assert_eq!(stats.online_users, vec![UserId::new(1), UserId::new(3)]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_churn_keeps_invariant() {
        let registry = Arc::new(ConnectionRegistry::new());
        let mut tasks = Vec::new();
        for worker in 0..16_i64 {
            let registry = Arc::clone(&registry);
            tasks.push(tokio::spawn(async move {
                for round in 0..50_i64 {
                    let id = registry.register(new_conn((worker + round) % 4)).await;
                    tokio::task::yield_now().await;
                    registry.deregister(id).await;
                }
            }));
        }
        for task in tasks {
            let Ok(()) = task.await else {
                panic!("worker panicked");
            };
        }

        assert!(registry.is_empty().await);
        assert!(registry.online_users().await.is_empty());
        assert_consistent(&registry).await;
    }

    #[derive(Debug, Clone)]
    enum Op {
        Register(i64),
        Deregister(usize),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0_i64..5).prop_map(Op::Register),
            (0_usize..32).prop_map(Op::Deregister),
        ]
    }

    proptest! {
        #[test]
        fn no_user_key_maps_to_empty_set(ops in proptest::collection::vec(op(), 1..64)) {
            let Ok(rt) = tokio::runtime::Builder::new_current_thread().build() else {
                panic!("runtime");
            };
            rt.block_on(async {
                let registry = ConnectionRegistry::new();
                let mut issued: Vec<ConnectionId> = Vec::new();
                for op in ops {
                    match op {
                        Op::Register(user) => issued.push(registry.register(new_conn(user)).await),
                        Op::Deregister(pick) => {
                            if let Some(id) = issued.get(pick % issued.len().max(1)) {
                                registry.deregister(*id).await;
                            }
                        }
                    }
                    assert_consistent(&registry).await;
                }
            });
        }
    }
}
