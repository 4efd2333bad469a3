//! Domain layer: identifiers, live connections and chat lifecycle rules.
//!
//! This module contains the in-memory connection model (connection ids,
//! connection state, the registry that groups connections by user) and the
//! chat/message entities whose editability and read-state rules the gateway
//! enforces on behalf of the persistence collaborator.

pub mod chat;
pub mod connection;
pub mod connection_id;
pub mod connection_registry;
pub mod ids;

pub use chat::{Attachment, Chat, EDIT_WINDOW, Message, MessageChange, Receipt, TOMBSTONE};
pub use connection::{Connection, ConnectionSummary, NewConnection};
pub use connection_id::ConnectionId;
pub use connection_registry::{ConnectionRegistry, Deregistered, RegistryStats};
pub use ids::{ChatId, MessageId, ParseIdError, UserId};
