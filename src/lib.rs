//! # chat-gateway
//!
//! Real-time delivery gateway for a two-party chat product.
//!
//! The core tracks many simultaneous WebSocket connections per user, fans
//! frames out to every connection of a user, and decides under a grace
//! period whether a user has really gone offline. Around it sit the chat
//! lifecycle rules (seven-minute edit window, read receipts, tombstones)
//! and a REST surface over the chat store.
//!
//! A second transport strategy drives plain sockets from one readiness
//! poller thread instead of one task per connection; it runs only when
//! `POLL_LISTEN_ADDR` is configured and shares nothing with the registry.
//!
//! ## Architecture
//!
//! ```text
//! Clients (HTTP, WebSocket)              Clients (WebSocket, poll model)
//!     │                                       │
//!     ├── REST Handlers (api/)                ├── PollServer (transport/)
//!     ├── WS Handler (ws/)                    └── Poller ── mio
//!     │
//!     ├── ChatService (service/)
//!     ├── Dispatcher (service/)
//!     ├── LivenessMonitor (service/)
//!     │
//!     ├── ConnectionRegistry (domain/)
//!     │
//!     └── SessionStore / ChatStore (persistence/)
//!             ├── PostgresStore
//!             └── InMemoryStore
//! ```

pub mod api;
pub mod app_state;
pub mod config;
pub mod domain;
pub mod error;
pub mod identity;
pub mod persistence;
pub mod service;
pub mod transport;
pub mod ws;
