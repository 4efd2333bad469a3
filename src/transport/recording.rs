//! In-memory [`FrameSink`] that records what was sent.
//!
//! Used by tests and by embedders that want to observe deliveries without a
//! socket. A sink can be switched into failing mode to simulate a dead peer.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use super::FrameSink;
use crate::error::GatewayError;

/// Sink that stores every delivered frame.
#[derive(Debug, Default)]
pub struct RecordingSink {
    frames: Mutex<Vec<String>>,
    failing: AtomicBool,
    closed: AtomicBool,
}

impl RecordingSink {
    /// Creates a healthy sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a sink whose every send fails.
    #[must_use]
    pub fn failing() -> Self {
        let sink = Self::default();
        sink.failing.store(true, Ordering::SeqCst);
        sink
    }

    /// Frames delivered so far, in order.
    #[must_use]
    pub fn frames(&self) -> Vec<String> {
        self.frames
            .lock()
            .map(|frames| frames.clone())
            .unwrap_or_default()
    }

    /// Returns `true` once [`FrameSink::close`] has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl FrameSink for RecordingSink {
    fn send_text(&self, text: &str) -> Result<(), GatewayError> {
        if self.failing.load(Ordering::SeqCst) || self.is_closed() {
            return Err(GatewayError::Transport("peer unavailable".to_string()));
        }
        let mut frames = self
            .frames
            .lock()
            .map_err(|_| GatewayError::Internal("recording sink poisoned".to_string()))?;
        frames.push(text.to_string());
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
