//! Push-model transport: channel-backed sink plus the writer task.

use axum::extract::ws::{Message, WebSocket};
use futures_util::SinkExt;
use futures_util::stream::SplitSink;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::FrameSink;
use crate::error::GatewayError;

/// Outbound handle for one WebSocket connection.
///
/// Frames are pushed into an unbounded channel and written to the socket by
/// [`write_loop`]. Sending never awaits, so it is safe to call right after
/// releasing the registry lock. [`FrameSink::close`] queues a close frame and
/// cancels the connection token so the reader loop stops.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<Message>,
    closed: CancellationToken,
}

impl ChannelSink {
    /// Creates a sink and the receiving end to hand to [`write_loop`].
    #[must_use]
    pub fn new(closed: CancellationToken) -> (Self, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx, closed }, rx)
    }

    /// Token cancelled when the connection is closed from the server side.
    #[must_use]
    pub fn closed(&self) -> &CancellationToken {
        &self.closed
    }

    /// Queues a raw WebSocket message (pong replies, close frames).
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Transport`] if the writer task has stopped.
    pub fn send_message(&self, message: Message) -> Result<(), GatewayError> {
        self.tx
            .send(message)
            .map_err(|_| GatewayError::Transport("writer task has stopped".to_string()))
    }
}

impl FrameSink for ChannelSink {
    fn send_text(&self, text: &str) -> Result<(), GatewayError> {
        if self.closed.is_cancelled() {
            return Err(GatewayError::Transport("connection closed".to_string()));
        }
        self.send_message(Message::text(text))
    }

    fn close(&self) {
        if self.closed.is_cancelled() {
            return;
        }
        let _ = self.tx.send(Message::Close(None));
        self.closed.cancel();
    }
}

/// Drains queued messages into the socket until the channel closes, a
/// close frame has been written, or the socket errors.
pub async fn write_loop(
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut rx: mpsc::UnboundedReceiver<Message>,
) {
    while let Some(message) = rx.recv().await {
        let is_close = matches!(message, Message::Close(_));
        if let Err(e) = ws_tx.send(message).await {
            tracing::debug!(error = %e, "ws write failed");
            break;
        }
        if is_close {
            break;
        }
    }
    let _ = ws_tx.close().await;
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_text_queues_frame() {
        let (sink, mut rx) = ChannelSink::new(CancellationToken::new());
        assert!(sink.send_text("hi").is_ok());

        let Some(Message::Text(text)) = rx.recv().await else {
            panic!("expected text frame");
        };
        assert_eq!(text.as_str(), "hi");
    }

    #[tokio::test]
    async fn send_fails_once_writer_is_gone() {
        let (sink, rx) = ChannelSink::new(CancellationToken::new());
        drop(rx);
        assert!(matches!(
            sink.send_text("hi"),
            Err(GatewayError::Transport(_))
        ));
    }

    #[tokio::test]
    async fn close_queues_close_frame_and_cancels() {
        let (sink, mut rx) = ChannelSink::new(CancellationToken::new());
        sink.close();
        sink.close();

        assert!(sink.closed().is_cancelled());
        assert!(matches!(rx.recv().await, Some(Message::Close(None))));
        assert!(sink.send_text("late").is_err());
    }
}
