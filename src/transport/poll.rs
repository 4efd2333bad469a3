//! Poll-model transport: one readiness poller over raw socket descriptors.
//!
//! Every accepted socket is owned by a [`PolledConnection`] from the moment
//! it is handed to [`Poller::add`], keyed by its raw descriptor. A single
//! thread calls [`Poller::wait`], which blocks in the kernel and then
//! resolves the ready descriptors to their connections under the shared
//! lock. Readiness is edge-triggered, so [`PolledConnection::read_available`]
//! drains the socket until it would block.
//!
//! Writes never block. When the kernel buffer fills, the remainder stays in
//! the WebSocket write buffer and the descriptor is watched for
//! writability until a later drain flushes it.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::{SocketAddr, TcpStream};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use mio::unix::SourceFd;
use mio::{Events, Interest, Token};
use tungstenite::{Message, WebSocket};

use super::FrameSink;
use crate::error::GatewayError;

/// Connection total is logged every this many registrations.
const LOG_EVERY: usize = 100;

/// What one drain of a ready socket produced.
#[derive(Debug, Default)]
pub struct ReadOutcome {
    /// Payloads of complete text and binary frames, in receipt order.
    pub frames: Vec<Vec<u8>>,
    /// The peer closed, or the socket failed; the caller must remove it.
    pub closed: bool,
}

/// One WebSocket owned by the poller.
pub struct PolledConnection {
    fd: RawFd,
    peer: SocketAddr,
    socket: Mutex<WebSocket<TcpStream>>,
    registry: Arc<mio::Registry>,
    token: Token,
    /// Set while unflushed bytes wait for the socket to become writable.
    write_pending: AtomicBool,
}

impl fmt::Debug for PolledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PolledConnection")
            .field("fd", &self.fd)
            .field("peer", &self.peer)
            .field("write_pending", &self.write_pending.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl PolledConnection {
    /// Raw descriptor the connection is registered under.
    #[must_use]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Remote address.
    #[must_use]
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Returns `true` while queued bytes wait for the socket to drain.
    #[must_use]
    pub fn has_pending_writes(&self) -> bool {
        self.write_pending.load(Ordering::Acquire)
    }

    /// Reads every frame currently buffered on the socket, then flushes
    /// whatever the write buffer still holds.
    pub fn read_available(&self) -> ReadOutcome {
        let mut socket = self.socket.lock().unwrap_or_else(PoisonError::into_inner);
        let mut outcome = ReadOutcome::default();
        loop {
            match socket.read() {
                Ok(Message::Text(text)) => outcome.frames.push(text.as_str().as_bytes().to_vec()),
                Ok(Message::Binary(bytes)) => outcome.frames.push(bytes.to_vec()),
                Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => {}
                Ok(Message::Close(_)) => {
                    outcome.closed = true;
                    break;
                }
                Err(tungstenite::Error::Io(e)) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    tracing::debug!(fd = self.fd, error = %e, "poll read ended");
                    outcome.closed = true;
                    break;
                }
            }
        }
        // Pong replies, close acknowledgements and earlier blocked sends.
        match socket.flush() {
            Ok(()) => self.watch_writable(false),
            Err(e) if would_block(&e) => self.watch_writable(true),
            Err(e) => {
                tracing::debug!(fd = self.fd, error = %e, "poll flush failed");
                outcome.closed = true;
            }
        }
        outcome
    }

    /// Adds or drops WRITABLE interest when the pending state changes.
    fn watch_writable(&self, pending: bool) {
        if self.write_pending.swap(pending, Ordering::AcqRel) == pending {
            return;
        }
        let interest = if pending {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        };
        if let Err(e) = self
            .registry
            .reregister(&mut SourceFd(&self.fd), self.token, interest)
        {
            tracing::debug!(fd = self.fd, error = %e, "reregister failed");
        }
    }
}

fn would_block(e: &tungstenite::Error) -> bool {
    matches!(e, tungstenite::Error::Io(io) if io.kind() == io::ErrorKind::WouldBlock)
}

impl FrameSink for PolledConnection {
    fn send_text(&self, text: &str) -> Result<(), GatewayError> {
        let mut socket = self.socket.lock().unwrap_or_else(PoisonError::into_inner);
        match socket.send(Message::text(text)) {
            Ok(()) => Ok(()),
            // Queued in the write buffer; the next writable event flushes it.
            Err(e) if would_block(&e) => {
                self.watch_writable(true);
                Ok(())
            }
            Err(e) => Err(GatewayError::Transport(e.to_string())),
        }
    }

    fn close(&self) {
        let mut socket = self.socket.lock().unwrap_or_else(PoisonError::into_inner);
        let _ = socket.close(None);
        let _ = socket.flush();
        let _ = socket.get_ref().shutdown(std::net::Shutdown::Both);
    }
}

/// Readiness poller over every registered descriptor.
///
/// `add` and `remove` take the exclusive lock on the descriptor map;
/// `wait` takes the shared lock only after the kernel call returns.
#[derive(Debug)]
pub struct Poller {
    poll: Mutex<mio::Poll>,
    registry: Arc<mio::Registry>,
    connections: RwLock<HashMap<RawFd, Arc<PolledConnection>>>,
    batch_size: usize,
    timeout: Duration,
}

impl Poller {
    /// Creates a poller handling up to `batch_size` events per wait and
    /// waking at least every `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Transport`] if the OS poller cannot be
    /// created.
    pub fn new(batch_size: usize, timeout: Duration) -> Result<Self, GatewayError> {
        let poll = mio::Poll::new().map_err(transport)?;
        let registry = poll.registry().try_clone().map_err(transport)?;
        Ok(Self {
            poll: Mutex::new(poll),
            registry: Arc::new(registry),
            connections: RwLock::default(),
            batch_size: batch_size.max(1),
            timeout,
        })
    }

    /// Takes ownership of a handshaken socket and starts watching it.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Transport`] if the socket cannot be made
    /// non-blocking or registered.
    pub fn add(
        &self,
        socket: WebSocket<TcpStream>,
        peer: SocketAddr,
    ) -> Result<Arc<PolledConnection>, GatewayError> {
        let stream = socket.get_ref();
        stream.set_nonblocking(true).map_err(transport)?;
        let fd = stream.as_raw_fd();
        let token = Token(
            usize::try_from(fd)
                .map_err(|_| GatewayError::Transport(format!("invalid descriptor {fd}")))?,
        );

        let connection = Arc::new(PolledConnection {
            fd,
            peer,
            socket: Mutex::new(socket),
            registry: Arc::clone(&self.registry),
            token,
            write_pending: AtomicBool::new(false),
        });

        let mut connections = self
            .connections
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        self.registry
            .register(&mut SourceFd(&fd), token, Interest::READABLE)
            .map_err(transport)?;
        connections.insert(fd, Arc::clone(&connection));
        let total = connections.len();
        drop(connections);

        tracing::debug!(fd, %peer, "poll connection added");
        if total % LOG_EVERY == 0 {
            tracing::info!(total, "poll connections");
        }
        Ok(connection)
    }

    /// Stops watching `fd` and closes its socket. Returns the removed
    /// connection, or `None` if it was not registered.
    pub fn remove(&self, fd: RawFd) -> Option<Arc<PolledConnection>> {
        let mut connections = self
            .connections
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let connection = connections.remove(&fd)?;
        if let Err(e) = self.registry.deregister(&mut SourceFd(&fd)) {
            tracing::debug!(fd, error = %e, "deregister failed");
        }
        let remaining = connections.len();
        drop(connections);

        connection.close();
        tracing::debug!(fd, peer = %connection.peer, remaining, "poll connection removed");
        Some(connection)
    }

    /// Blocks until some descriptors are ready or the timeout elapses, and
    /// returns their connections.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Transport`] if the kernel wait fails for a
    /// reason other than an interrupted call.
    pub fn wait(&self) -> Result<Vec<Arc<PolledConnection>>, GatewayError> {
        let mut events = Events::with_capacity(self.batch_size);
        {
            let mut poll = self.poll.lock().unwrap_or_else(PoisonError::into_inner);
            match poll.poll(&mut events, Some(self.timeout)) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(Vec::new()),
                Err(e) => return Err(transport(e)),
            }
        }

        let connections = self
            .connections
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        Ok(events
            .iter()
            .filter_map(|event| RawFd::try_from(event.token().0).ok())
            .filter_map(|fd| connections.get(&fd).map(Arc::clone))
            .collect())
    }

    /// Removes and closes every connection.
    pub fn close_all(&self) -> usize {
        let fds: Vec<RawFd> = self
            .connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect();
        fds.into_iter().filter_map(|fd| self.remove(fd)).count()
    }

    /// Number of watched connections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Returns `true` if nothing is being watched.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn transport(e: io::Error) -> GatewayError {
    GatewayError::Transport(e.to_string())
}
