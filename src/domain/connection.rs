//! Live connection state held by the registry.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use utoipa::ToSchema;

use super::{ConnectionId, UserId};
use crate::transport::FrameSink;

/// One live transport session.
///
/// Owned exclusively by the [`super::ConnectionRegistry`]. The `sink` is the
/// only way the rest of the gateway reaches the socket.
#[derive(Debug, Clone)]
pub struct Connection {
    /// Unique connection identifier (immutable after registration).
    pub connection_id: ConnectionId,

    /// Owning user.
    pub user_id: UserId,

    /// Contact identifier of the owning user, used in logs.
    pub email: String,

    /// Registration timestamp.
    pub connected_at: DateTime<Utc>,

    /// Timestamp of the last inbound frame.
    pub last_active: DateTime<Utc>,

    /// Outbound half of the socket.
    pub sink: Arc<dyn FrameSink>,
}

/// Everything needed to register a connection once identity is known.
#[derive(Debug, Clone)]
pub struct NewConnection {
    /// Resolved user identifier.
    pub user_id: UserId,
    /// Resolved contact identifier.
    pub email: String,
    /// Outbound half of the socket.
    pub sink: Arc<dyn FrameSink>,
}

impl Connection {
    pub(crate) fn from_new(connection_id: ConnectionId, new: NewConnection) -> Self {
        let now = Utc::now();
        Self {
            connection_id,
            user_id: new.user_id,
            email: new.email,
            connected_at: now,
            last_active: now,
            sink: new.sink,
        }
    }
}

/// Transport-free view of a connection for admin endpoints.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ConnectionSummary {
    /// Connection identifier.
    pub connection_id: ConnectionId,
    /// Owning user.
    pub user_id: UserId,
    /// Contact identifier.
    pub email: String,
    /// Registration timestamp.
    pub connected_at: DateTime<Utc>,
    /// Timestamp of the last inbound frame.
    pub last_active: DateTime<Utc>,
}

impl From<&Connection> for ConnectionSummary {
    fn from(conn: &Connection) -> Self {
        Self {
            connection_id: conn.connection_id,
            user_id: conn.user_id,
            email: conn.email.clone(),
            connected_at: conn.connected_at,
            last_active: conn.last_active,
        }
    }
}
