//! Axum WebSocket upgrade handler.

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};

use super::connection::run_connection;
use crate::app_state::AppState;
use crate::identity::TokenQuery;

/// `GET /ws?token=...` — Upgrade HTTP connection to WebSocket.
///
/// The caller is resolved before the upgrade; an unknown caller gets a 401
/// and nothing is registered.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(auth): Query<TokenQuery>,
    headers: HeaderMap,
) -> Response {
    match state.identity.resolve(&headers, auth.token.as_deref()).await {
        Ok(identity) => ws
            .on_upgrade(move |socket| run_connection(socket, identity, state))
            .into_response(),
        Err(e) => {
            tracing::warn!(error = %e, "websocket upgrade refused");
            e.into_response()
        }
    }
}
