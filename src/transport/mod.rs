//! Socket transport adapters.
//!
//! Two strategies implement the same responsibility of moving frames
//! between sockets and the rest of the gateway:
//!
//! - [`channel`]: push model. One reader task per connection; outbound
//!   frames go through an unbounded channel drained by a writer task. The
//!   channel sender is the handle stored in the
//!   [`ConnectionRegistry`](crate::domain::ConnectionRegistry).
//! - [`poll`] (unix only): poll model. One thread waits on a single
//!   readiness poller over every raw descriptor and reads whichever sockets
//!   have pending data. No per-user grouping.
//!
//! [`FrameSink`] is the seam the registry and dispatcher see.

pub mod channel;
#[cfg(unix)]
pub mod poll;
#[cfg(unix)]
pub mod poll_server;
pub mod recording;

use std::fmt;

use crate::error::GatewayError;

pub use channel::ChannelSink;
pub use recording::RecordingSink;

/// Outbound half of one connection.
///
/// Implementations must not block on network I/O: the dispatcher calls
/// [`FrameSink::send_text`] for many connections in a row, and a slow peer
/// must not hold up the others.
pub trait FrameSink: Send + Sync + fmt::Debug {
    /// Queues one text frame for delivery to the peer.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Transport`] if the connection is closed or
    /// its writer has stopped.
    fn send_text(&self, text: &str) -> Result<(), GatewayError>;

    /// Closes the transport. Calling it more than once is harmless.
    fn close(&self);
}
