//! In-process store used by tests and database-less deployments.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::models::{NewMessage, Page};
use super::{ChatStore, SessionStore};
use crate::domain::chat::count_unread;
use crate::domain::{Chat, ChatId, Message, MessageChange, MessageId, Receipt, UserId};
use crate::error::GatewayError;
use crate::identity::Identity;

#[derive(Debug, Default)]
struct MemoryState {
    chats: BTreeMap<ChatId, Chat>,
    messages: BTreeMap<MessageId, Message>,
    sessions: HashMap<String, (Identity, DateTime<Utc>)>,
    cleared: Vec<UserId>,
    next_chat: i64,
    next_message: i64,
}

/// [`SessionStore`] and [`ChatStore`] kept entirely in memory.
///
/// A single lock guards every table, so `get_or_create_chat` is atomic for
/// free.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    state: RwLock<MemoryState>,
}

impl InMemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a session token valid until `expires_at`.
    pub async fn insert_session(
        &self,
        token: impl Into<String>,
        identity: Identity,
        expires_at: DateTime<Utc>,
    ) {
        self.state
            .write()
            .await
            .sessions
            .insert(token.into(), (identity, expires_at));
    }

    /// Users whose session was cleared, in call order.
    pub async fn cleared_sessions(&self) -> Vec<UserId> {
        self.state.read().await.cleared.clone()
    }
}

#[async_trait]
impl SessionStore for InMemoryStore {
    async fn find_by_session(
        &self,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Identity>, GatewayError> {
        if token.is_empty() {
            return Ok(None);
        }
        let state = self.state.read().await;
        Ok(state
            .sessions
            .get(token)
            .filter(|(_, expires_at)| *expires_at > now)
            .map(|(identity, _)| identity.clone()))
    }

    async fn clear_session(&self, user_id: UserId) -> Result<(), GatewayError> {
        let mut state = self.state.write().await;
        state
            .sessions
            .retain(|_, (identity, _)| identity.user_id != user_id);
        state.cleared.push(user_id);
        Ok(())
    }
}

#[async_trait]
impl ChatStore for InMemoryStore {
    async fn get_or_create_chat(
        &self,
        a: UserId,
        b: UserId,
        product_id: Option<i64>,
    ) -> Result<Chat, GatewayError> {
        let mut state = self.state.write().await;
        if let Some(chat) = state.chats.values().find(|c| c.is_between(a, b)) {
            return Ok(chat.clone());
        }
        state.next_chat += 1;
        let now = Utc::now();
        let chat = Chat {
            id: ChatId::new(state.next_chat),
            user1_id: a,
            user2_id: b,
            product_id,
            created_at: now,
            updated_at: now,
        };
        state.chats.insert(chat.id, chat.clone());
        Ok(chat)
    }

    async fn find_chat(&self, chat_id: ChatId) -> Result<Option<Chat>, GatewayError> {
        Ok(self.state.read().await.chats.get(&chat_id).cloned())
    }

    async fn chats_for_user(&self, user_id: UserId) -> Result<Vec<Chat>, GatewayError> {
        let state = self.state.read().await;
        let mut chats: Vec<Chat> = state
            .chats
            .values()
            .filter(|c| c.involves(user_id))
            .cloned()
            .collect();
        chats.sort_by(|x, y| y.updated_at.cmp(&x.updated_at).then(y.id.cmp(&x.id)));
        Ok(chats)
    }

    async fn insert_message(&self, new: NewMessage) -> Result<Message, GatewayError> {
        let mut guard = self.state.write().await;
        let state = &mut *guard;
        let chat = state
            .chats
            .get_mut(&new.chat_id)
            .ok_or(GatewayError::ChatNotFound(new.chat_id))?;
        chat.updated_at = new.created_at;

        state.next_message += 1;
        let message = Message {
            id: MessageId::new(state.next_message),
            chat_id: new.chat_id,
            sender_id: new.sender_id,
            receiver_id: new.receiver_id,
            content: new.content,
            attachment: new.attachment,
            reply_to: new.reply_to,
            is_edited: false,
            is_deleted: false,
            received_at: None,
            read_at: None,
            created_at: new.created_at,
            updated_at: new.created_at,
        };
        state.messages.insert(message.id, message.clone());
        Ok(message)
    }

    async fn find_message(&self, message_id: MessageId) -> Result<Option<Message>, GatewayError> {
        Ok(self.state.read().await.messages.get(&message_id).cloned())
    }

    async fn change_message(
        &self,
        message_id: MessageId,
        actor: UserId,
        change: &MessageChange,
        now: DateTime<Utc>,
    ) -> Result<Message, GatewayError> {
        let mut state = self.state.write().await;
        let message = state
            .messages
            .get_mut(&message_id)
            .filter(|m| m.is_party(actor))
            .ok_or(GatewayError::MessageNotFound(message_id))?;
        message.apply(actor, change, now)?;
        Ok(message.clone())
    }

    async fn acknowledge_message(
        &self,
        message_id: MessageId,
        receiver: UserId,
        receipt: Receipt,
        now: DateTime<Utc>,
    ) -> Result<Message, GatewayError> {
        let mut state = self.state.write().await;
        let message = state
            .messages
            .get_mut(&message_id)
            .filter(|m| m.receiver_id == receiver)
            .ok_or(GatewayError::MessageNotFound(message_id))?;
        message.acknowledge(receipt, now);
        Ok(message.clone())
    }

    async fn last_message(&self, chat_id: ChatId) -> Result<Option<Message>, GatewayError> {
        let state = self.state.read().await;
        Ok(state
            .messages
            .values()
            .filter(|m| m.chat_id == chat_id)
            .max_by(|x, y| x.created_at.cmp(&y.created_at).then(x.id.cmp(&y.id)))
            .cloned())
    }

    async fn list_messages(
        &self,
        chat_id: ChatId,
        page: Page,
    ) -> Result<(Vec<Message>, u64), GatewayError> {
        let state = self.state.read().await;
        let mut visible: Vec<&Message> = state
            .messages
            .values()
            .filter(|m| m.chat_id == chat_id && !m.is_deleted)
            .collect();
        visible.sort_by(|x, y| y.created_at.cmp(&x.created_at).then(y.id.cmp(&x.id)));
        let total = u64::try_from(visible.len()).unwrap_or(u64::MAX);
        let offset = usize::try_from(page.offset()).unwrap_or(usize::MAX);
        let limit = usize::try_from(page.limit).unwrap_or(usize::MAX);
        let items = visible
            .into_iter()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect();
        Ok((items, total))
    }

    async fn mark_chat_read(
        &self,
        chat_id: ChatId,
        reader: UserId,
        now: DateTime<Utc>,
    ) -> Result<u64, GatewayError> {
        let mut state = self.state.write().await;
        let mut updated = 0_u64;
        for message in state
            .messages
            .values_mut()
            .filter(|m| m.chat_id == chat_id && m.receiver_id == reader)
        {
            if message.mark_read(now) {
                updated += 1;
            }
        }
        Ok(updated)
    }

    async fn count_unread(&self, user: UserId, chat: Option<ChatId>) -> Result<u64, GatewayError> {
        let state = self.state.read().await;
        Ok(count_unread(state.messages.values(), user, chat))
    }

    async fn unread_messages(&self, user: UserId) -> Result<Vec<Message>, GatewayError> {
        let state = self.state.read().await;
        let mut unread: Vec<Message> = state
            .messages
            .values()
            .filter(|m| m.is_unread_for(user) && !m.is_deleted)
            .cloned()
            .collect();
        unread.sort_by(|x, y| y.created_at.cmp(&x.created_at).then(y.id.cmp(&x.id)));
        Ok(unread)
    }
}
