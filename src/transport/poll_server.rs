//! Threads driving the [`Poller`]: one acceptor, one event loop.
//!
//! The acceptor drives WebSocket handshakes on non-blocking sockets, so a
//! slow or silent client never holds up the next accept, and hands each
//! completed socket to the poller. The event loop waits for readiness,
//! drains ready sockets and passes every frame to a caller-supplied
//! handler. Both threads stop when the shutdown token is cancelled.

use std::fmt;
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tungstenite::WebSocket;
use tungstenite::handshake::server::{NoCallback, ServerHandshake};
use tungstenite::handshake::{HandshakeError, MidHandshake};

use super::poll::{PolledConnection, Poller};
use crate::error::GatewayError;

/// Handler invoked with each received frame payload.
pub type FrameHandler = Arc<dyn Fn(&PolledConnection, &[u8]) + Send + Sync>;

/// Back-off of the acceptor when a pass accepted or completed nothing.
const ACCEPT_IDLE: Duration = Duration::from_millis(20);

/// A handshake still unfinished after this long is dropped.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

type Handshake = MidHandshake<ServerHandshake<TcpStream, NoCallback>>;
type HandshakeResult =
    Result<WebSocket<TcpStream>, HandshakeError<ServerHandshake<TcpStream, NoCallback>>>;

/// Upgrade waiting on more bytes from the client.
struct PendingHandshake {
    peer: SocketAddr,
    started: Instant,
    handshake: Handshake,
}

/// Running poll-model server.
pub struct PollServer {
    local_addr: SocketAddr,
    poller: Arc<Poller>,
    shutdown: CancellationToken,
    threads: Vec<JoinHandle<()>>,
}

impl fmt::Debug for PollServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PollServer")
            .field("local_addr", &self.local_addr)
            .field("connections", &self.poller.len())
            .finish_non_exhaustive()
    }
}

impl PollServer {
    /// Binds `addr` and starts the acceptor and event-loop threads.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Transport`] if the address cannot be bound,
    /// the poller cannot be created or a thread cannot be spawned.
    pub fn start(
        addr: SocketAddr,
        batch_size: usize,
        timeout: Duration,
        handler: FrameHandler,
        shutdown: CancellationToken,
    ) -> Result<Self, GatewayError> {
        let listener = TcpListener::bind(addr).map_err(transport)?;
        listener.set_nonblocking(true).map_err(transport)?;
        let local_addr = listener.local_addr().map_err(transport)?;
        let poller = Arc::new(Poller::new(batch_size, timeout)?);

        let acceptor = {
            let poller = Arc::clone(&poller);
            let shutdown = shutdown.clone();
            thread::Builder::new()
                .name("poll-acceptor".to_string())
                .spawn(move || accept_loop(&listener, &poller, &shutdown))
                .map_err(transport)?
        };
        let event_loop = {
            let poller = Arc::clone(&poller);
            let shutdown = shutdown.clone();
            thread::Builder::new()
                .name("poll-loop".to_string())
                .spawn(move || event_loop(&poller, handler.as_ref(), &shutdown))
                .map_err(transport)?
        };

        tracing::info!(addr = %local_addr, batch_size, "poll server listening");
        Ok(Self {
            local_addr,
            poller,
            shutdown,
            threads: vec![acceptor, event_loop],
        })
    }

    /// Address the listener is bound to.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The shared poller.
    #[must_use]
    pub fn poller(&self) -> &Arc<Poller> {
        &self.poller
    }

    /// Cancels the shutdown token and joins both threads.
    pub fn stop(self) {
        self.shutdown.cancel();
        for handle in self.threads {
            if handle.join().is_err() {
                tracing::error!("poll thread panicked");
            }
        }
        tracing::info!(addr = %self.local_addr, "poll server stopped");
    }
}

fn accept_loop(listener: &TcpListener, poller: &Poller, shutdown: &CancellationToken) {
    let mut pending: Vec<PendingHandshake> = Vec::new();
    while !shutdown.is_cancelled() {
        let mut progressed = false;
        loop {
            match listener.accept() {
                Ok((stream, peer)) => {
                    progressed = true;
                    if let Err(e) = stream.set_nonblocking(true) {
                        tracing::warn!(%peer, error = %e, "failed to prepare socket");
                        continue;
                    }
                    let started = Instant::now();
                    pending.extend(advance(tungstenite::accept(stream), peer, started, poller));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    break;
                }
            }
        }

        let waiting = pending.len();
        pending = pending
            .into_iter()
            .filter_map(|p| advance(p.handshake.handshake(), p.peer, p.started, poller))
            .collect();
        progressed |= pending.len() != waiting;

        if !progressed {
            thread::sleep(ACCEPT_IDLE);
        }
    }
    tracing::debug!(abandoned = pending.len(), "poll acceptor stopped");
}

/// Registers a finished handshake, or keeps an unfinished one that is
/// still within [`HANDSHAKE_TIMEOUT`].
fn advance(
    result: HandshakeResult,
    peer: SocketAddr,
    started: Instant,
    poller: &Poller,
) -> Option<PendingHandshake> {
    match result {
        Ok(socket) => {
            if let Err(e) = poller.add(socket, peer) {
                tracing::warn!(%peer, error = %e, "failed to register socket");
            }
            None
        }
        Err(HandshakeError::Interrupted(handshake)) => {
            if started.elapsed() >= HANDSHAKE_TIMEOUT {
                tracing::warn!(%peer, "websocket handshake timed out");
                return None;
            }
            Some(PendingHandshake {
                peer,
                started,
                handshake,
            })
        }
        Err(HandshakeError::Failure(e)) => {
            tracing::warn!(%peer, error = %e, "websocket handshake failed");
            None
        }
    }
}

fn event_loop(
    poller: &Poller,
    handler: &(dyn Fn(&PolledConnection, &[u8]) + Send + Sync),
    shutdown: &CancellationToken,
) {
    while !shutdown.is_cancelled() {
        let ready = match poller.wait() {
            Ok(ready) => ready,
            Err(e) => {
                tracing::error!(error = %e, "poll wait failed");
                break;
            }
        };
        for connection in ready {
            let outcome = connection.read_available();
            for frame in &outcome.frames {
                handler(&connection, frame);
            }
            if outcome.closed {
                poller.remove(connection.fd());
            }
        }
    }
    let closed = poller.close_all();
    tracing::debug!(closed, "poll loop stopped");
}

fn transport(e: io::Error) -> GatewayError {
    GatewayError::Transport(e.to_string())
}
