//! Administrative endpoints: presence queries, force-close, broadcast.

use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};

use crate::api::dto::{BroadcastRequest, DisconnectResponse, UserConnectionsResponse};
use crate::app_state::AppState;
use crate::domain::{RegistryStats, UserId};
use crate::error::{ErrorResponse, GatewayError};
use crate::service::DeliveryReport;

/// `GET /admin/connections` — Aggregate connection totals.
#[utoipa::path(
    get,
    path = "/api/v1/admin/connections",
    tag = "Admin",
    summary = "Connection stats",
    description = "Total connections, total online users and the online user list.",
    responses(
        (status = 200, description = "Registry totals", body = RegistryStats),
    )
)]
pub async fn connection_stats(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.registry.stats().await)
}

/// `GET /admin/users/{id}/connections` — One user's connections.
#[utoipa::path(
    get,
    path = "/api/v1/admin/users/{id}/connections",
    tag = "Admin",
    summary = "User connections",
    params(("id" = i64, Path, description = "User id")),
    responses(
        (status = 200, description = "User presence", body = UserConnectionsResponse),
    )
)]
pub async fn user_connections(
    State(state): State<AppState>,
    Path(user_id): Path<UserId>,
) -> impl IntoResponse {
    let connections = state.registry.summaries_for_user(user_id).await;
    Json(UserConnectionsResponse {
        user_id,
        online: !connections.is_empty(),
        liveness: state.liveness.state_of(user_id).await,
        connection_count: connections.len(),
        connections,
    })
}

/// `POST /admin/users/{id}/disconnect` — Force-close a user's connections.
#[utoipa::path(
    post,
    path = "/api/v1/admin/users/{id}/disconnect",
    tag = "Admin",
    summary = "Disconnect user",
    description = "Closes every connection of the user. The usual grace-period check follows.",
    params(("id" = i64, Path, description = "User id")),
    responses(
        (status = 200, description = "Connections closed", body = DisconnectResponse),
    )
)]
pub async fn disconnect_user(
    State(state): State<AppState>,
    Path(user_id): Path<UserId>,
) -> impl IntoResponse {
    let closed = state.dispatcher.close_user_connections(user_id).await;
    Json(DisconnectResponse { user_id, closed })
}

/// `POST /admin/broadcast` — Send a raw frame to everyone or a user list.
///
/// # Errors
///
/// Returns [`GatewayError::InvalidRequest`] for an empty message.
#[utoipa::path(
    post,
    path = "/api/v1/admin/broadcast",
    tag = "Admin",
    summary = "Broadcast",
    request_body = BroadcastRequest,
    responses(
        (status = 200, description = "Delivery report", body = DeliveryReport),
        (status = 400, description = "Invalid request", body = ErrorResponse),
    )
)]
pub async fn broadcast(
    State(state): State<AppState>,
    Json(req): Json<BroadcastRequest>,
) -> Result<impl IntoResponse, GatewayError> {
    if req.message.is_empty() {
        return Err(GatewayError::InvalidRequest(
            "message must not be empty".to_string(),
        ));
    }
    let report = match req.user_ids.as_deref() {
        Some(users) => state.dispatcher.broadcast_to_users(users, &req.message).await,
        None => state.dispatcher.broadcast(&req.message).await,
    };
    Ok(Json(report))
}

/// Admin routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/admin/connections", get(connection_stats))
        .route("/admin/users/{id}/connections", get(user_connections))
        .route("/admin/users/{id}/disconnect", post(disconnect_user))
        .route("/admin/broadcast", post(broadcast))
}
