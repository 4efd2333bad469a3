//! Store-facing input types and row mapping.

use chrono::{DateTime, Utc};

use crate::domain::{Attachment, Chat, ChatId, Message, MessageId, UserId};

/// A message about to be stored.
#[derive(Debug, Clone)]
pub struct NewMessage {
    /// Target chat.
    pub chat_id: ChatId,
    /// Author.
    pub sender_id: UserId,
    /// The other participant.
    pub receiver_id: UserId,
    /// Text content.
    pub content: String,
    /// Optional attachment.
    pub attachment: Option<Attachment>,
    /// Message being replied to.
    pub reply_to: Option<MessageId>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

/// 1-indexed page request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    /// Page number, starting at 1.
    pub page: u32,
    /// Items per page.
    pub limit: u32,
}

impl Page {
    /// Largest accepted page size.
    pub const MAX_LIMIT: u32 = 100;

    /// Builds a page, clamping `page` to at least 1 and `limit` to
    /// `1..=MAX_LIMIT`.
    #[must_use]
    pub fn new(page: u32, limit: u32) -> Self {
        Self {
            page: page.max(1),
            limit: limit.clamp(1, Self::MAX_LIMIT),
        }
    }

    /// Rows to skip.
    #[must_use]
    pub fn offset(&self) -> u64 {
        u64::from(self.page.saturating_sub(1)) * u64::from(self.limit)
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::new(1, 50)
    }
}

/// Column tuple of the `chats` table.
pub(crate) type ChatRow = (
    i64,
    i64,
    i64,
    Option<i64>,
    DateTime<Utc>,
    DateTime<Utc>,
);

/// Column tuple of the `messages` table.
pub(crate) type MessageRow = (
    i64,
    i64,
    i64,
    i64,
    String,
    Option<String>,
    Option<String>,
    Option<i64>,
    bool,
    bool,
    Option<DateTime<Utc>>,
    Option<DateTime<Utc>>,
    DateTime<Utc>,
    DateTime<Utc>,
);

pub(crate) fn chat_from_row(
    (id, user1_id, user2_id, product_id, created_at, updated_at): ChatRow,
) -> Chat {
    Chat {
        id: ChatId::new(id),
        user1_id: UserId::new(user1_id),
        user2_id: UserId::new(user2_id),
        product_id,
        created_at,
        updated_at,
    }
}

pub(crate) fn message_from_row(
    (
        id,
        chat_id,
        sender_id,
        receiver_id,
        content,
        attachment_url,
        attachment_type,
        reply_to,
        is_edited,
        is_deleted,
        received_at,
        read_at,
        created_at,
        updated_at,
    ): MessageRow,
) -> Message {
    let attachment = attachment_url
        .filter(|url| !url.is_empty())
        .map(|url| Attachment {
            url,
            kind: attachment_type.unwrap_or_default(),
        });
    Message {
        id: MessageId::new(id),
        chat_id: ChatId::new(chat_id),
        sender_id: UserId::new(sender_id),
        receiver_id: UserId::new(receiver_id),
        content,
        attachment,
        reply_to: reply_to.map(MessageId::new),
        is_edited,
        is_deleted,
        received_at,
        read_at,
        created_at,
        updated_at,
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn page_clamps_inputs() {
        assert_eq!(Page::new(0, 0), Page { page: 1, limit: 1 });
        assert_eq!(Page::new(3, 500).limit, Page::MAX_LIMIT);
        assert_eq!(Page::new(3, 20).offset(), 40);
    }

    #[test]
    fn empty_attachment_url_maps_to_none() {
        let now = Utc::now();
        let row: MessageRow = (
            1,
            2,
            3,
            4,
            "hi".to_string(),
            Some(String::new()),
            Some("image".to_string()),
            None,
            false,
            false,
            None,
            None,
            now,
            now,
        );
        let message = message_from_row(row);
        assert!(message.attachment.is_none());
        assert_eq!(message.receiver_id, UserId::new(4));
    }
}
