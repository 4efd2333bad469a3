//! Administrative request/response bodies.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::domain::{ConnectionSummary, UserId};
use crate::service::LivenessState;

/// Response body for `GET /admin/users/{id}/connections`.
#[derive(Debug, Serialize, ToSchema)]
pub struct UserConnectionsResponse {
    /// The user queried.
    pub user_id: UserId,
    /// Whether the user has a live connection.
    pub online: bool,
    /// Presence as tracked by the grace-period monitor.
    pub liveness: LivenessState,
    /// Number of live connections.
    pub connection_count: usize,
    /// The connections themselves.
    pub connections: Vec<ConnectionSummary>,
}

/// Response body for `POST /admin/users/{id}/disconnect`.
#[derive(Debug, Serialize, ToSchema)]
pub struct DisconnectResponse {
    /// The user disconnected.
    pub user_id: UserId,
    /// Connections closed.
    pub closed: usize,
}

/// Request body for `POST /admin/broadcast`.
#[derive(Debug, Deserialize, ToSchema)]
pub struct BroadcastRequest {
    /// Raw frame to send.
    pub message: String,
    /// Restrict delivery to these users; everyone when omitted.
    #[serde(default)]
    pub user_ids: Option<Vec<UserId>>,
}
