//! WebSocket layer: upgrade, per-connection read loop, frame routing.
//!
//! The endpoint at `/ws` authenticates the upgrade, registers the socket in
//! the [`ConnectionRegistry`](crate::domain::ConnectionRegistry) and relays
//! `"<recipient>:<body>"` frames to every connection of the recipient.

pub mod connection;
pub mod frame;
pub mod handler;
