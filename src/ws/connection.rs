//! Per-connection read loop.
//!
//! Lifecycle of one socket:
//!
//! 1. split the socket, spawn [`write_loop`] behind a [`ChannelSink`];
//! 2. register the sink under the resolved user;
//! 3. read frames until the peer closes, the transport errors or the
//!    connection is force-closed;
//! 4. deregister, start the grace-period check, let the writer drain.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;

use super::frame::{RoutedFrame, route_binary, route_frame};
use crate::app_state::AppState;
use crate::domain::{ConnectionId, NewConnection, UserId};
use crate::error::GatewayError;
use crate::identity::Identity;
use crate::transport::channel::write_loop;
use crate::transport::{ChannelSink, FrameSink};

/// How long the writer may keep flushing after the reader stopped.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Runs one WebSocket connection to completion.
pub async fn run_connection(socket: WebSocket, identity: Identity, state: AppState) {
    let (ws_tx, mut ws_rx) = socket.split();
    let closed = CancellationToken::new();
    let (sink, rx) = ChannelSink::new(closed.clone());
    let sink = Arc::new(sink);
    let mut writer = tokio::spawn(write_loop(ws_tx, rx));

    let user_id = identity.user_id;
    let connection_id = state
        .registry
        .register(NewConnection {
            user_id,
            email: identity.email,
            sink: Arc::clone(&sink) as Arc<dyn FrameSink>,
        })
        .await;

    loop {
        tokio::select! {
            () = closed.cancelled() => {
                tracing::debug!(%connection_id, "connection closed by server");
                break;
            }
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        state.registry.touch(connection_id).await;
                        relay(&state, connection_id, user_id, route_frame(text.as_str())).await;
                    }
                    Some(Ok(Message::Binary(bytes))) => {
                        state.registry.touch(connection_id).await;
                        relay(&state, connection_id, user_id, route_binary(&bytes)).await;
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                        state.registry.touch(connection_id).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        tracing::debug!(%connection_id, error = %e, "ws read failed");
                        break;
                    }
                }
            }
        }
    }

    state.registry.deregister(connection_id).await;
    state.liveness.on_disconnect(user_id);

    sink.close();
    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer)
        .await
        .is_err()
    {
        tracing::debug!(%connection_id, "writer did not drain in time");
        writer.abort();
    }
}

async fn relay(
    state: &AppState,
    connection_id: ConnectionId,
    sender: UserId,
    routed: Result<RoutedFrame<'_>, GatewayError>,
) {
    match routed {
        Ok(frame) => {
            tracing::debug!(
                %connection_id,
                %sender,
                recipient = %frame.recipient,
                "relaying frame"
            );
            state
                .dispatcher
                .send_to_user(frame.recipient, frame.body)
                .await;
        }
        Err(e) => {
            tracing::warn!(%connection_id, %sender, error = %e, "dropping frame");
        }
    }
}
