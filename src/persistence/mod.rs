//! Persistence collaborators: session state and chat records.
//!
//! The gateway never owns these rows. It talks to them through two object
//! safe traits so the same services run against PostgreSQL in production
//! ([`postgres::PostgresStore`]) and against [`memory::InMemoryStore`] in
//! tests or database-less deployments.

pub mod memory;
pub mod models;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;

use crate::domain::{Chat, ChatId, Message, MessageChange, MessageId, Receipt, UserId};
use crate::error::GatewayError;
use crate::identity::Identity;

pub use memory::InMemoryStore;
pub use models::{NewMessage, Page};
pub use postgres::PostgresStore;

/// Session markers stored on the user record.
#[async_trait]
pub trait SessionStore: Send + Sync + fmt::Debug {
    /// Resolves an unexpired session token to its user.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::PersistenceError`] on storage failure.
    async fn find_by_session(
        &self,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Identity>, GatewayError>;

    /// Resets the user's session token and expiry to their empty values.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::PersistenceError`] on storage failure.
    async fn clear_session(&self, user_id: UserId) -> Result<(), GatewayError>;
}

/// Chat and message records.
#[async_trait]
pub trait ChatStore: Send + Sync + fmt::Debug {
    /// Returns the chat between `a` and `b` (in either order), creating it
    /// with `a` as `user1` when none exists. Must be atomic with respect to
    /// concurrent calls for the same pair.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::PersistenceError`] on storage failure.
    async fn get_or_create_chat(
        &self,
        a: UserId,
        b: UserId,
        product_id: Option<i64>,
    ) -> Result<Chat, GatewayError>;

    /// Looks up a chat by id.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::PersistenceError`] on storage failure.
    async fn find_chat(&self, chat_id: ChatId) -> Result<Option<Chat>, GatewayError>;

    /// Chats the user participates in, most recently updated first.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::PersistenceError`] on storage failure.
    async fn chats_for_user(&self, user_id: UserId) -> Result<Vec<Chat>, GatewayError>;

    /// Stores a message and bumps the chat's `updated_at` to its timestamp.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::PersistenceError`] on storage failure and
    /// [`GatewayError::ChatNotFound`] if the chat does not exist.
    async fn insert_message(&self, new: NewMessage) -> Result<Message, GatewayError>;

    /// Looks up a message by id, deleted ones included.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::PersistenceError`] on storage failure.
    async fn find_message(&self, message_id: MessageId) -> Result<Option<Message>, GatewayError>;

    /// Applies a sender-side change in one atomic step. The editability
    /// rule is checked against the stored row, so a receipt recorded
    /// concurrently is never overwritten.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::MessageNotFound`] if the message does not
    /// exist or `actor` is neither its sender nor its receiver,
    /// [`GatewayError::PreconditionFailed`] when the rule rejects the change,
    /// and [`GatewayError::PersistenceError`] on storage failure.
    async fn change_message(
        &self,
        message_id: MessageId,
        actor: UserId,
        change: &MessageChange,
        now: DateTime<Utc>,
    ) -> Result<Message, GatewayError>;

    /// Records a receipt from the message's receiver in one atomic step.
    /// Timestamps already set are kept. Returns the stored message.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::MessageNotFound`] unless `receiver` is the
    /// receiver of an existing message, and
    /// [`GatewayError::PersistenceError`] on storage failure.
    async fn acknowledge_message(
        &self,
        message_id: MessageId,
        receiver: UserId,
        receipt: Receipt,
        now: DateTime<Utc>,
    ) -> Result<Message, GatewayError>;

    /// Newest message of a chat.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::PersistenceError`] on storage failure.
    async fn last_message(&self, chat_id: ChatId) -> Result<Option<Message>, GatewayError>;

    /// One page of non-deleted messages, newest first, with the total count.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::PersistenceError`] on storage failure.
    async fn list_messages(
        &self,
        chat_id: ChatId,
        page: Page,
    ) -> Result<(Vec<Message>, u64), GatewayError>;

    /// Marks every message addressed to `reader` in the chat as read, and
    /// as received where it was not yet. Returns the number updated.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::PersistenceError`] on storage failure.
    async fn mark_chat_read(
        &self,
        chat_id: ChatId,
        reader: UserId,
        now: DateTime<Utc>,
    ) -> Result<u64, GatewayError>;

    /// Messages addressed to `user` with no read timestamp, optionally in
    /// one chat. Deleted messages still count until read.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::PersistenceError`] on storage failure.
    async fn count_unread(&self, user: UserId, chat: Option<ChatId>) -> Result<u64, GatewayError>;

    /// Non-deleted unread messages addressed to `user`, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::PersistenceError`] on storage failure.
    async fn unread_messages(&self, user: UserId) -> Result<Vec<Message>, GatewayError>;
}
