//! PostgreSQL implementation of the persistence collaborators.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use super::models::{
    ChatRow, MessageRow, NewMessage, Page, chat_from_row, message_from_row,
};
use super::{ChatStore, SessionStore};
use crate::config::GatewayConfig;
use crate::domain::{
    Chat, ChatId, EDIT_WINDOW, Message, MessageChange, MessageId, Receipt, TOMBSTONE, UserId,
};
use crate::error::GatewayError;
use crate::identity::Identity;

const CHAT_COLUMNS: &str = "id, user1_id, user2_id, product_id, created_at, updated_at";

const MESSAGE_COLUMNS: &str = "id, chat_id, sender_id, receiver_id, content, attachment_url, \
     attachment_type, reply_to_id, is_edited, is_deleted, received_at, read_at, created_at, \
     updated_at";

/// PostgreSQL-backed store using `sqlx::PgPool`.
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Wraps an existing connection pool.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Opens a connection pool sized from the gateway configuration.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::PersistenceError`] if the database cannot be
    /// reached within the configured timeout.
    pub async fn connect(config: &GatewayConfig) -> Result<Self, GatewayError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.database_max_connections)
            .min_connections(config.database_min_connections)
            .acquire_timeout(Duration::from_secs(config.database_connect_timeout_secs))
            .connect(&config.database_url)
            .await?;
        Ok(Self::new(pool))
    }

    /// Applies the embedded migrations.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::PersistenceError`] if a migration fails.
    pub async fn migrate(&self) -> Result<(), GatewayError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| GatewayError::PersistenceError(e.to_string()))
    }

    async fn fetch_chat_between(
        &self,
        a: UserId,
        b: UserId,
    ) -> Result<Option<Chat>, GatewayError> {
        let row = sqlx::query_as::<_, ChatRow>(&format!(
            "SELECT {CHAT_COLUMNS} FROM chats \
             WHERE ((user1_id = $1 AND user2_id = $2) OR (user1_id = $2 AND user2_id = $1)) \
             AND deleted_at IS NULL"
        ))
        .bind(a.get())
        .bind(b.get())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(chat_from_row))
    }
}

fn to_count(raw: i64) -> u64 {
    u64::try_from(raw).unwrap_or_default()
}

#[async_trait]
impl SessionStore for PostgresStore {
    async fn find_by_session(
        &self,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Identity>, GatewayError> {
        if token.is_empty() {
            return Ok(None);
        }
        let row = sqlx::query_as::<_, (i64, String)>(
            "SELECT id, email FROM users WHERE session = $1 AND session_expired > $2",
        )
        .bind(token)
        .bind(now.timestamp())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(id, email)| Identity {
            user_id: UserId::new(id),
            email,
        }))
    }

    async fn clear_session(&self, user_id: UserId) -> Result<(), GatewayError> {
        sqlx::query("UPDATE users SET session = '', session_expired = 0 WHERE id = $1")
            .bind(user_id.get())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ChatStore for PostgresStore {
    async fn get_or_create_chat(
        &self,
        a: UserId,
        b: UserId,
        product_id: Option<i64>,
    ) -> Result<Chat, GatewayError> {
        if let Some(chat) = self.fetch_chat_between(a, b).await? {
            return Ok(chat);
        }
        // A concurrent insert for the same pair hits uq_chats_pair and is
        // skipped; the re-select below then returns the winner.
        sqlx::query(
            "INSERT INTO chats (user1_id, user2_id, product_id) VALUES ($1, $2, $3) \
             ON CONFLICT DO NOTHING",
        )
        .bind(a.get())
        .bind(b.get())
        .bind(product_id)
        .execute(&self.pool)
        .await?;
        self.fetch_chat_between(a, b).await?.ok_or_else(|| {
            GatewayError::PersistenceError(format!("chat between {a} and {b} vanished"))
        })
    }

    async fn find_chat(&self, chat_id: ChatId) -> Result<Option<Chat>, GatewayError> {
        let row = sqlx::query_as::<_, ChatRow>(&format!(
            "SELECT {CHAT_COLUMNS} FROM chats WHERE id = $1 AND deleted_at IS NULL"
        ))
        .bind(chat_id.get())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(chat_from_row))
    }

    async fn chats_for_user(&self, user_id: UserId) -> Result<Vec<Chat>, GatewayError> {
        let rows = sqlx::query_as::<_, ChatRow>(&format!(
            "SELECT {CHAT_COLUMNS} FROM chats \
             WHERE (user1_id = $1 OR user2_id = $1) AND deleted_at IS NULL \
             ORDER BY updated_at DESC, id DESC"
        ))
        .bind(user_id.get())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(chat_from_row).collect())
    }

    async fn insert_message(&self, new: NewMessage) -> Result<Message, GatewayError> {
        let mut tx = self.pool.begin().await?;

        let bumped = sqlx::query(
            "UPDATE chats SET updated_at = $2 WHERE id = $1 AND deleted_at IS NULL",
        )
        .bind(new.chat_id.get())
        .bind(new.created_at)
        .execute(&mut *tx)
        .await?;
        if bumped.rows_affected() == 0 {
            return Err(GatewayError::ChatNotFound(new.chat_id));
        }

        let (attachment_url, attachment_type) = new
            .attachment
            .map(|a| (Some(a.url), Some(a.kind)))
            .unwrap_or_default();
        let row = sqlx::query_as::<_, MessageRow>(&format!(
            "INSERT INTO messages (chat_id, sender_id, receiver_id, content, attachment_url, \
             attachment_type, reply_to_id, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $8) RETURNING {MESSAGE_COLUMNS}"
        ))
        .bind(new.chat_id.get())
        .bind(new.sender_id.get())
        .bind(new.receiver_id.get())
        .bind(new.content)
        .bind(attachment_url)
        .bind(attachment_type)
        .bind(new.reply_to.map(MessageId::get))
        .bind(new.created_at)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(message_from_row(row))
    }

    async fn find_message(&self, message_id: MessageId) -> Result<Option<Message>, GatewayError> {
        let row = sqlx::query_as::<_, MessageRow>(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = $1"
        ))
        .bind(message_id.get())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(message_from_row))
    }

    async fn change_message(
        &self,
        message_id: MessageId,
        actor: UserId,
        change: &MessageChange,
        now: DateTime<Utc>,
    ) -> Result<Message, GatewayError> {
        let (content, edited, deleted) = match change {
            MessageChange::Edit(content) if content.trim().is_empty() => {
                return Err(GatewayError::InvalidRequest(
                    "content must not be empty".to_string(),
                ));
            }
            MessageChange::Edit(content) => (content.as_str(), true, false),
            MessageChange::Delete => (TOMBSTONE, false, true),
        };
        // The WHERE clause is the editability rule, evaluated on the stored row.
        let row = sqlx::query_as::<_, MessageRow>(&format!(
            "UPDATE messages SET content = $3, is_edited = is_edited OR $4, \
             is_deleted = is_deleted OR $5, updated_at = $6 \
             WHERE id = $1 AND sender_id = $2 AND read_at IS NULL AND is_deleted = FALSE \
             AND created_at >= $7 RETURNING {MESSAGE_COLUMNS}"
        ))
        .bind(message_id.get())
        .bind(actor.get())
        .bind(content)
        .bind(edited)
        .bind(deleted)
        .bind(now)
        .bind(now - EDIT_WINDOW)
        .fetch_optional(&self.pool)
        .await?;
        if let Some(row) = row {
            return Ok(message_from_row(row));
        }

        // Nothing matched: report why from the current row.
        let mut current = self
            .find_message(message_id)
            .await?
            .filter(|m| m.is_party(actor))
            .ok_or(GatewayError::MessageNotFound(message_id))?;
        current.apply(actor, change, now)?;
        Err(GatewayError::PreconditionFailed(format!(
            "message {message_id} changed concurrently"
        )))
    }

    async fn acknowledge_message(
        &self,
        message_id: MessageId,
        receiver: UserId,
        receipt: Receipt,
        now: DateTime<Utc>,
    ) -> Result<Message, GatewayError> {
        let assignments = match receipt {
            Receipt::Received => {
                "received_at = COALESCE(received_at, $3), \
                 updated_at = CASE WHEN received_at IS NULL THEN $3 ELSE updated_at END"
            }
            Receipt::Read => {
                "read_at = COALESCE(read_at, $3), received_at = COALESCE(received_at, $3), \
                 updated_at = CASE WHEN read_at IS NULL THEN $3 ELSE updated_at END"
            }
        };
        let row = sqlx::query_as::<_, MessageRow>(&format!(
            "UPDATE messages SET {assignments} WHERE id = $1 AND receiver_id = $2 \
             RETURNING {MESSAGE_COLUMNS}"
        ))
        .bind(message_id.get())
        .bind(receiver.get())
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        row.map(message_from_row)
            .ok_or(GatewayError::MessageNotFound(message_id))
    }

    async fn last_message(&self, chat_id: ChatId) -> Result<Option<Message>, GatewayError> {
        let row = sqlx::query_as::<_, MessageRow>(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE chat_id = $1 \
             ORDER BY created_at DESC, id DESC LIMIT 1"
        ))
        .bind(chat_id.get())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(message_from_row))
    }

    async fn list_messages(
        &self,
        chat_id: ChatId,
        page: Page,
    ) -> Result<(Vec<Message>, u64), GatewayError> {
        let total = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM messages WHERE chat_id = $1 AND is_deleted = FALSE",
        )
        .bind(chat_id.get())
        .fetch_one(&self.pool)
        .await?;

        let rows = sqlx::query_as::<_, MessageRow>(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE chat_id = $1 AND is_deleted = FALSE \
             ORDER BY created_at DESC, id DESC LIMIT $2 OFFSET $3"
        ))
        .bind(chat_id.get())
        .bind(i64::from(page.limit))
        .bind(i64::try_from(page.offset()).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        Ok((
            rows.into_iter().map(message_from_row).collect(),
            to_count(total),
        ))
    }

    async fn mark_chat_read(
        &self,
        chat_id: ChatId,
        reader: UserId,
        now: DateTime<Utc>,
    ) -> Result<u64, GatewayError> {
        let result = sqlx::query(
            "UPDATE messages SET read_at = $3, received_at = COALESCE(received_at, $3), \
             updated_at = $3 WHERE chat_id = $1 AND receiver_id = $2 AND read_at IS NULL",
        )
        .bind(chat_id.get())
        .bind(reader.get())
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn count_unread(&self, user: UserId, chat: Option<ChatId>) -> Result<u64, GatewayError> {
        let count = match chat {
            Some(chat_id) => {
                sqlx::query_scalar::<_, i64>(
                    "SELECT COUNT(*) FROM messages \
                     WHERE receiver_id = $1 AND read_at IS NULL AND chat_id = $2",
                )
                .bind(user.get())
                .bind(chat_id.get())
                .fetch_one(&self.pool)
                .await?
            }
            None => {
                sqlx::query_scalar::<_, i64>(
                    "SELECT COUNT(*) FROM messages WHERE receiver_id = $1 AND read_at IS NULL",
                )
                .bind(user.get())
                .fetch_one(&self.pool)
                .await?
            }
        };
        Ok(to_count(count))
    }

    async fn unread_messages(&self, user: UserId) -> Result<Vec<Message>, GatewayError> {
        let rows = sqlx::query_as::<_, MessageRow>(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages \
             WHERE receiver_id = $1 AND read_at IS NULL AND is_deleted = FALSE \
             ORDER BY created_at DESC, id DESC"
        ))
        .bind(user.get())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(message_from_row).collect())
    }
}
