//! Chat service: message lifecycle rules over the chat store, with live
//! pushes to the receiver's open connections.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use utoipa::ToSchema;

use super::Dispatcher;
use crate::domain::{
    Attachment, Chat, ChatId, Message, MessageChange, MessageId, Receipt, UserId,
};
use crate::error::GatewayError;
use crate::persistence::{ChatStore, NewMessage, Page};
use crate::ws::frame::LiveEvent;

/// A message as seen by one viewer.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct MessageView {
    /// The stored message.
    #[serde(flatten)]
    pub message: Message,
    /// Whether the viewer may still edit it.
    pub can_edit: bool,
    /// Whether the viewer may still delete it.
    pub can_delete: bool,
}

impl MessageView {
    /// Computes the viewer-specific flags at `now`.
    #[must_use]
    pub fn new(message: Message, viewer: UserId, now: DateTime<Utc>) -> Self {
        let mutable = message.sender_id == viewer && message.is_editable_at(now);
        Self {
            message,
            can_edit: mutable,
            can_delete: mutable,
        }
    }
}

/// One entry of a user's chat list.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ChatOverview {
    /// The chat.
    pub chat: Chat,
    /// The participant that is not the viewer.
    pub other_user_id: UserId,
    /// Most recent message, deleted ones included.
    pub last_message: Option<MessageView>,
    /// Messages addressed to the viewer not yet read.
    pub unread_count: u64,
}

/// One page of a chat's history.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct MessagePage {
    /// Messages, newest first.
    pub messages: Vec<MessageView>,
    /// Non-deleted messages in the chat.
    pub total: u64,
    /// Page number.
    pub page: u32,
    /// Page size.
    pub limit: u32,
}

/// Input of [`ChatService::send_message`].
#[derive(Debug, Clone)]
pub struct SendMessage {
    /// Text content; must not be blank.
    pub content: String,
    /// Optional attachment.
    pub attachment: Option<Attachment>,
    /// Message in the same chat this one replies to.
    pub reply_to: Option<MessageId>,
}

/// Orchestrates chat operations on behalf of an authenticated user.
///
/// Every operation checks that the caller participates in the chat (or is
/// the right party for a message), applies the lifecycle rules of
/// [`Message`], persists through the [`ChatStore`], and pushes a
/// [`LiveEvent`] to the receiver where relevant. Pushes are best-effort and
/// never fail the operation.
#[derive(Debug, Clone)]
pub struct ChatService {
    store: Arc<dyn ChatStore>,
    dispatcher: Dispatcher,
}

impl ChatService {
    /// Creates a new `ChatService`.
    #[must_use]
    pub fn new(store: Arc<dyn ChatStore>, dispatcher: Dispatcher) -> Self {
        Self { store, dispatcher }
    }

    /// The caller's chats, most recently active first.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::PersistenceError`] on storage failure.
    pub async fn list_chats(&self, user: UserId) -> Result<Vec<ChatOverview>, GatewayError> {
        let now = Utc::now();
        let chats = self.store.chats_for_user(user).await?;
        let mut overviews = Vec::with_capacity(chats.len());
        for chat in chats {
            let Some(other_user_id) = chat.other_participant(user) else {
                continue;
            };
            let last_message = self
                .store
                .last_message(chat.id)
                .await?
                .map(|m| MessageView::new(m, user, now));
            let unread_count = self.store.count_unread(user, Some(chat.id)).await?;
            overviews.push(ChatOverview {
                chat,
                other_user_id,
                last_message,
                unread_count,
            });
        }
        Ok(overviews)
    }

    /// Returns the chat between the caller and `other`, creating it if
    /// needed.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::InvalidRequest`] when `other` is the caller
    /// and [`GatewayError::PersistenceError`] on storage failure.
    pub async fn start_chat(
        &self,
        user: UserId,
        other: UserId,
        product_id: Option<i64>,
    ) -> Result<Chat, GatewayError> {
        if user == other {
            return Err(GatewayError::InvalidRequest(
                "cannot start a chat with yourself".to_string(),
            ));
        }
        let chat = self.store.get_or_create_chat(user, other, product_id).await?;
        tracing::debug!(chat_id = %chat.id, %user, %other, "chat resolved");
        Ok(chat)
    }

    /// One page of a chat's non-deleted history.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::ChatNotFound`] if the caller does not
    /// participate in the chat.
    pub async fn list_messages(
        &self,
        user: UserId,
        chat_id: ChatId,
        page: Page,
    ) -> Result<MessagePage, GatewayError> {
        self.chat_for(user, chat_id).await?;
        let (messages, total) = self.store.list_messages(chat_id, page).await?;
        let now = Utc::now();
        Ok(MessagePage {
            messages: messages
                .into_iter()
                .map(|m| MessageView::new(m, user, now))
                .collect(),
            total,
            page: page.page,
            limit: page.limit,
        })
    }

    /// Stores a message from the caller to the other participant and pushes
    /// it to the receiver's connections.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::ChatNotFound`] if the caller does not
    /// participate in the chat, and [`GatewayError::InvalidRequest`] for
    /// blank content or a reply to a message outside the chat.
    pub async fn send_message(
        &self,
        user: UserId,
        chat_id: ChatId,
        input: SendMessage,
    ) -> Result<MessageView, GatewayError> {
        let chat = self.chat_for(user, chat_id).await?;
        let receiver_id = chat
            .other_participant(user)
            .ok_or(GatewayError::ChatNotFound(chat_id))?;
        if input.content.trim().is_empty() {
            return Err(GatewayError::InvalidRequest(
                "content must not be empty".to_string(),
            ));
        }
        if let Some(reply_to) = input.reply_to {
            let in_chat = self
                .store
                .find_message(reply_to)
                .await?
                .is_some_and(|m| m.chat_id == chat_id);
            if !in_chat {
                return Err(GatewayError::InvalidRequest(format!(
                    "reply target {reply_to} is not in chat {chat_id}"
                )));
            }
        }

        let now = Utc::now();
        let message = self
            .store
            .insert_message(NewMessage {
                chat_id,
                sender_id: user,
                receiver_id,
                content: input.content,
                attachment: input.attachment,
                reply_to: input.reply_to,
                created_at: now,
            })
            .await?;
        tracing::info!(message_id = %message.id, %chat_id, sender = %user, "message stored");

        self.push(
            receiver_id,
            &LiveEvent::NewMessage {
                message: message.clone(),
                timestamp: now,
            },
        )
        .await;
        Ok(MessageView::new(message, user, now))
    }

    /// Marks every message addressed to the caller in the chat as read.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::ChatNotFound`] if the caller does not
    /// participate in the chat.
    pub async fn mark_chat_read(&self, user: UserId, chat_id: ChatId) -> Result<u64, GatewayError> {
        self.chat_for(user, chat_id).await?;
        let updated = self.store.mark_chat_read(chat_id, user, Utc::now()).await?;
        tracing::debug!(%chat_id, %user, updated, "chat marked read");
        Ok(updated)
    }

    /// Records delivery of a message to its receiver.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::MessageNotFound`] unless the caller is the
    /// receiver.
    pub async fn mark_received(
        &self,
        user: UserId,
        message_id: MessageId,
    ) -> Result<MessageView, GatewayError> {
        self.acknowledge(user, message_id, Receipt::Received).await
    }

    /// Records that the receiver read a message (and received it, if that
    /// was not yet recorded).
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::MessageNotFound`] unless the caller is the
    /// receiver.
    pub async fn mark_read(
        &self,
        user: UserId,
        message_id: MessageId,
    ) -> Result<MessageView, GatewayError> {
        self.acknowledge(user, message_id, Receipt::Read).await
    }

    /// Rewrites the content of the caller's own message.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::InvalidRequest`] for blank content,
    /// [`GatewayError::MessageNotFound`] if the caller is not a party to the
    /// message and [`GatewayError::PreconditionFailed`] when the message is
    /// no longer editable or belongs to the other party.
    pub async fn edit_message(
        &self,
        user: UserId,
        message_id: MessageId,
        content: &str,
    ) -> Result<MessageView, GatewayError> {
        if content.trim().is_empty() {
            return Err(GatewayError::InvalidRequest(
                "content must not be empty".to_string(),
            ));
        }
        let now = Utc::now();
        let message = self
            .store
            .change_message(message_id, user, &MessageChange::Edit(content.to_string()), now)
            .await?;
        tracing::info!(%message_id, %user, "message edited");

        self.push(
            message.receiver_id,
            &LiveEvent::MessageEdited {
                message: message.clone(),
                timestamp: now,
            },
        )
        .await;
        Ok(MessageView::new(message, user, now))
    }

    /// Replaces the caller's own message with the tombstone.
    ///
    /// # Errors
    ///
    /// Same as [`ChatService::edit_message`].
    pub async fn delete_message(
        &self,
        user: UserId,
        message_id: MessageId,
    ) -> Result<MessageView, GatewayError> {
        let now = Utc::now();
        let message = self
            .store
            .change_message(message_id, user, &MessageChange::Delete, now)
            .await?;
        tracing::info!(%message_id, %user, "message deleted");

        self.push(
            message.receiver_id,
            &LiveEvent::MessageDeleted {
                message_id,
                timestamp: now,
            },
        )
        .await;
        Ok(MessageView::new(message, user, now))
    }

    /// Unread messages addressed to the caller across all chats.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::PersistenceError`] on storage failure.
    pub async fn unread_count(&self, user: UserId) -> Result<u64, GatewayError> {
        self.store.count_unread(user, None).await
    }

    /// The unread messages themselves, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::PersistenceError`] on storage failure.
    pub async fn unread_messages(&self, user: UserId) -> Result<Vec<MessageView>, GatewayError> {
        let now = Utc::now();
        Ok(self
            .store
            .unread_messages(user)
            .await?
            .into_iter()
            .map(|m| MessageView::new(m, user, now))
            .collect())
    }

    async fn chat_for(&self, user: UserId, chat_id: ChatId) -> Result<Chat, GatewayError> {
        self.store
            .find_chat(chat_id)
            .await?
            .filter(|chat| chat.involves(user))
            .ok_or(GatewayError::ChatNotFound(chat_id))
    }

    async fn acknowledge(
        &self,
        user: UserId,
        message_id: MessageId,
        receipt: Receipt,
    ) -> Result<MessageView, GatewayError> {
        let now = Utc::now();
        let message = self
            .store
            .acknowledge_message(message_id, user, receipt, now)
            .await?;
        tracing::debug!(%message_id, %user, ?receipt, "receipt recorded");
        Ok(MessageView::new(message, user, now))
    }

    async fn push(&self, user: UserId, event: &LiveEvent) {
        match event.to_frame() {
            Ok(frame) => {
                self.dispatcher.send_to_user(user, &frame).await;
            }
            Err(e) => tracing::warn!(%user, error = %e, "failed to encode live event"),
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;
    use crate::domain::{ConnectionRegistry, NewConnection, TOMBSTONE};
    use crate::persistence::InMemoryStore;
    use crate::transport::{FrameSink, RecordingSink};
    use std::time::Duration;

    const ALICE: UserId = UserId::new(1);
    const BOB: UserId = UserId::new(2);
    const EVE: UserId = UserId::new(3);

    struct Fixture {
        service: ChatService,
        bob_sink: Arc<RecordingSink>,
    }

    async fn fixture() -> Fixture {
        let registry = Arc::new(ConnectionRegistry::new());
        let bob_sink = Arc::new(RecordingSink::new());
        registry
            .register(NewConnection {
                user_id: BOB,
                email: "bob@example.com".to_string(),
                sink: Arc::clone(&bob_sink) as Arc<dyn FrameSink>,
            })
            .await;
        let service = ChatService::new(
            Arc::new(InMemoryStore::new()),
            Dispatcher::new(registry),
        );
        Fixture { service, bob_sink }
    }

    fn text(content: &str) -> SendMessage {
        SendMessage {
            content: content.to_string(),
            attachment: None,
            reply_to: None,
        }
    }

    #[tokio::test]
    async fn self_chat_is_rejected() {
        let fx = fixture().await;
        let result = fx.service.start_chat(ALICE, ALICE, None).await;
        assert!(matches!(result, Err(GatewayError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn send_pushes_to_receiver_and_counts_unread() {
        let fx = fixture().await;
        let Ok(chat) = fx.service.start_chat(ALICE, BOB, Some(11)).await else {
            panic!("start failed");
        };
        let Ok(view) = fx.service.send_message(ALICE, chat.id, text("hi bob")).await else {
            panic!("send failed");
        };
        assert_eq!(view.message.receiver_id, BOB);
        assert!(view.can_edit);

        let frames = fx.bob_sink.frames();
        assert_eq!(frames.len(), 1);
        assert!(frames.iter().all(|f| f.contains("\"type\":\"new_message\"")));

        assert_eq!(fx.service.unread_count(BOB).await.ok(), Some(1));
        let Ok(chats) = fx.service.list_chats(BOB).await else {
            panic!("list failed");
        };
        assert_eq!(chats.len(), 1);
        assert!(chats.iter().all(|c| c.other_user_id == ALICE && c.unread_count == 1));

        assert_eq!(fx.service.mark_chat_read(BOB, chat.id).await.ok(), Some(1));
        assert_eq!(fx.service.unread_count(BOB).await.ok(), Some(0));
    }

    #[tokio::test]
    async fn outsiders_cannot_see_or_post() {
        let fx = fixture().await;
        let Ok(chat) = fx.service.start_chat(ALICE, BOB, None).await else {
            panic!("start failed");
        };
        let listed = fx.service.list_messages(EVE, chat.id, Page::default()).await;
        assert!(matches!(listed, Err(GatewayError::ChatNotFound(_))));
        let sent = fx.service.send_message(EVE, chat.id, text("psst")).await;
        assert!(matches!(sent, Err(GatewayError::ChatNotFound(_))));
    }

    #[tokio::test]
    async fn blank_content_and_foreign_reply_are_rejected() {
        let fx = fixture().await;
        let Ok(chat) = fx.service.start_chat(ALICE, BOB, None).await else {
            panic!("start failed");
        };
        let blank = fx.service.send_message(ALICE, chat.id, text("   ")).await;
        assert!(matches!(blank, Err(GatewayError::InvalidRequest(_))));

        let mut reply = text("re");
        reply.reply_to = Some(MessageId::new(999));
        let orphan = fx.service.send_message(ALICE, chat.id, reply).await;
        assert!(matches!(orphan, Err(GatewayError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn edit_and_delete_follow_sender_rules() {
        let fx = fixture().await;
        let Ok(chat) = fx.service.start_chat(ALICE, BOB, None).await else {
            panic!("start failed");
        };
        let Ok(sent) = fx.service.send_message(ALICE, chat.id, text("typo")).await else {
            panic!("send failed");
        };
        let id = sent.message.id;

        let by_receiver = fx.service.edit_message(BOB, id, "hijack").await;
        assert!(matches!(by_receiver, Err(GatewayError::PreconditionFailed(_))));
        let by_outsider = fx.service.edit_message(EVE, id, "hijack").await;
        assert!(matches!(by_outsider, Err(GatewayError::MessageNotFound(_))));

        let Ok(edited) = fx.service.edit_message(ALICE, id, "fixed").await else {
            panic!("edit failed");
        };
        assert!(edited.message.is_edited);

        let Ok(deleted) = fx.service.delete_message(ALICE, id).await else {
            panic!("delete failed");
        };
        assert_eq!(deleted.message.content, TOMBSTONE);
        assert!(!deleted.can_edit);

        let Ok(page) = fx.service.list_messages(ALICE, chat.id, Page::default()).await else {
            panic!("list failed");
        };
        assert_eq!(page.total, 0);

        let kinds: Vec<String> = fx.bob_sink.frames();
        assert!(kinds.iter().any(|f| f.contains("message_edited")));
        assert!(kinds.iter().any(|f| f.contains("message_deleted")));
    }

    #[tokio::test]
    async fn read_message_can_no_longer_be_edited() {
        let fx = fixture().await;
        let Ok(chat) = fx.service.start_chat(ALICE, BOB, None).await else {
            panic!("start failed");
        };
        let Ok(sent) = fx.service.send_message(ALICE, chat.id, text("seen?")).await else {
            panic!("send failed");
        };
        let id = sent.message.id;

        let by_sender = fx.service.mark_read(ALICE, id).await;
        assert!(matches!(by_sender, Err(GatewayError::MessageNotFound(_))));

        let Ok(read) = fx.service.mark_read(BOB, id).await else {
            panic!("mark read failed");
        };
        assert!(read.message.read_at.is_some());
        assert!(read.message.received_at.is_some());

        let edit = fx.service.edit_message(ALICE, id, "too late").await;
        assert!(matches!(edit, Err(GatewayError::PreconditionFailed(_))));
    }

    /// Delegates to an [`InMemoryStore`] after stalling selected writes, so
    /// two requests on the same message interleave.
    #[derive(Debug, Default)]
    struct StallingStore {
        inner: InMemoryStore,
        change_delay: Duration,
        received_delay: Duration,
        read_delay: Duration,
    }

    #[async_trait::async_trait]
    impl ChatStore for StallingStore {
        async fn get_or_create_chat(
            &self,
            a: UserId,
            b: UserId,
            product_id: Option<i64>,
        ) -> Result<Chat, GatewayError> {
            self.inner.get_or_create_chat(a, b, product_id).await
        }

        async fn find_chat(&self, chat_id: ChatId) -> Result<Option<Chat>, GatewayError> {
            self.inner.find_chat(chat_id).await
        }

        async fn chats_for_user(&self, user_id: UserId) -> Result<Vec<Chat>, GatewayError> {
            self.inner.chats_for_user(user_id).await
        }

        async fn insert_message(&self, new: NewMessage) -> Result<Message, GatewayError> {
            self.inner.insert_message(new).await
        }

        async fn find_message(
            &self,
            message_id: MessageId,
        ) -> Result<Option<Message>, GatewayError> {
            self.inner.find_message(message_id).await
        }

        async fn change_message(
            &self,
            message_id: MessageId,
            actor: UserId,
            change: &MessageChange,
            now: DateTime<Utc>,
        ) -> Result<Message, GatewayError> {
            tokio::time::sleep(self.change_delay).await;
            self.inner
                .change_message(message_id, actor, change, now)
                .await
        }

        async fn acknowledge_message(
            &self,
            message_id: MessageId,
            receiver: UserId,
            receipt: Receipt,
            now: DateTime<Utc>,
        ) -> Result<Message, GatewayError> {
            let delay = match receipt {
                Receipt::Received => self.received_delay,
                Receipt::Read => self.read_delay,
            };
            tokio::time::sleep(delay).await;
            self.inner
                .acknowledge_message(message_id, receiver, receipt, now)
                .await
        }

        async fn last_message(&self, chat_id: ChatId) -> Result<Option<Message>, GatewayError> {
            self.inner.last_message(chat_id).await
        }

        async fn list_messages(
            &self,
            chat_id: ChatId,
            page: Page,
        ) -> Result<(Vec<Message>, u64), GatewayError> {
            self.inner.list_messages(chat_id, page).await
        }

        async fn mark_chat_read(
            &self,
            chat_id: ChatId,
            reader: UserId,
            now: DateTime<Utc>,
        ) -> Result<u64, GatewayError> {
            self.inner.mark_chat_read(chat_id, reader, now).await
        }

        async fn count_unread(
            &self,
            user: UserId,
            chat: Option<ChatId>,
        ) -> Result<u64, GatewayError> {
            self.inner.count_unread(user, chat).await
        }

        async fn unread_messages(&self, user: UserId) -> Result<Vec<Message>, GatewayError> {
            self.inner.unread_messages(user).await
        }
    }

    async fn stalled(store: StallingStore) -> (ChatService, Arc<StallingStore>, MessageId) {
        let store = Arc::new(store);
        let service = ChatService::new(
            Arc::clone(&store) as Arc<dyn ChatStore>,
            Dispatcher::new(Arc::new(ConnectionRegistry::new())),
        );
        let Ok(chat) = service.start_chat(ALICE, BOB, None).await else {
            panic!("start failed");
        };
        let Ok(sent) = service.send_message(ALICE, chat.id, text("hi")).await else {
            panic!("send failed");
        };
        (service, store, sent.message.id)
    }

    async fn stored(store: &StallingStore, id: MessageId) -> Message {
        let Ok(Some(message)) = store.inner.find_message(id).await else {
            panic!("message missing");
        };
        message
    }

    #[tokio::test(start_paused = true)]
    async fn read_landing_before_a_slow_edit_blocks_it() {
        let (service, store, id) = stalled(StallingStore {
            change_delay: Duration::from_millis(10),
            ..StallingStore::default()
        })
        .await;

        let (edit, read) = tokio::join!(
            service.edit_message(ALICE, id, "changed"),
            service.mark_read(BOB, id)
        );
        assert!(matches!(edit, Err(GatewayError::PreconditionFailed(_))));
        assert!(read.is_ok());

        let message = stored(&store, id).await;
        assert_eq!(message.content, "hi");
        assert!(!message.is_edited);
        assert!(message.read_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn edit_landing_before_a_slow_read_keeps_both() {
        let (service, store, id) = stalled(StallingStore {
            read_delay: Duration::from_millis(10),
            ..StallingStore::default()
        })
        .await;

        let (edit, read) = tokio::join!(
            service.edit_message(ALICE, id, "changed"),
            service.mark_read(BOB, id)
        );
        assert!(edit.is_ok());
        let Ok(read) = read else {
            panic!("mark read failed");
        };
        assert_eq!(read.message.content, "changed");

        let message = stored(&store, id).await;
        assert_eq!(message.content, "changed");
        assert!(message.is_edited);
        assert!(message.read_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn late_received_receipt_keeps_read_timestamp() {
        let (service, store, id) = stalled(StallingStore {
            received_delay: Duration::from_millis(10),
            ..StallingStore::default()
        })
        .await;

        let (received, read) = tokio::join!(
            service.mark_received(BOB, id),
            service.mark_read(BOB, id)
        );
        assert!(received.is_ok());
        assert!(read.is_ok());

        let message = stored(&store, id).await;
        assert!(message.read_at.is_some());
        assert_eq!(message.received_at, message.read_at);
    }

    #[tokio::test]
    async fn blank_edit_is_rejected_before_storage() {
        let fx = fixture().await;
        let Ok(chat) = fx.service.start_chat(ALICE, BOB, None).await else {
            panic!("start failed");
        };
        let Ok(sent) = fx.service.send_message(ALICE, chat.id, text("x")).await else {
            panic!("send failed");
        };
        let edit = fx.service.edit_message(ALICE, sent.message.id, "  ").await;
        assert!(matches!(edit, Err(GatewayError::InvalidRequest(_))));
    }
}
