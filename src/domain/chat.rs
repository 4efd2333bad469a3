//! Chat and message entities with their lifecycle rules.
//!
//! Rows are owned by the persistence collaborator; this module only decides
//! what a mutation is allowed to do and computes the derived fields
//! (editability, unread counts) at read time.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use utoipa::ToSchema;

use super::{ChatId, MessageId, UserId};
use crate::error::GatewayError;

/// How long after sending a message its sender may still edit or delete it.
pub const EDIT_WINDOW: Duration = Duration::minutes(7);

/// Content that replaces a deleted message.
pub const TOMBSTONE: &str = "[Message deleted]";

/// A change the sender makes to one of their messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageChange {
    /// Replace the content and set `is_edited`.
    Edit(String),
    /// Replace the content with [`TOMBSTONE`] and set `is_deleted`.
    Delete,
}

/// An acknowledgement the receiver records on a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Receipt {
    /// The receiver's client got the message.
    Received,
    /// The receiver read the message; implies [`Receipt::Received`].
    Read,
}

/// A one-to-one conversation, optionally started from a product page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
pub struct Chat {
    /// Chat identifier.
    pub id: ChatId,
    /// Participant that created the chat.
    pub user1_id: UserId,
    /// The other participant.
    pub user2_id: UserId,
    /// Product the chat was started from, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product_id: Option<i64>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Timestamp of the most recent message.
    pub updated_at: DateTime<Utc>,
}

impl Chat {
    /// Returns `true` if `user` is one of the two participants.
    #[must_use]
    pub fn involves(&self, user: UserId) -> bool {
        self.user1_id == user || self.user2_id == user
    }

    /// The participant that is not `user`, or `None` if `user` is not in
    /// the chat.
    #[must_use]
    pub fn other_participant(&self, user: UserId) -> Option<UserId> {
        if self.user1_id == user {
            Some(self.user2_id)
        } else if self.user2_id == user {
            Some(self.user1_id)
        } else {
            None
        }
    }

    /// Returns `true` if this chat is between `a` and `b`, in either order.
    #[must_use]
    pub fn is_between(&self, a: UserId, b: UserId) -> bool {
        (self.user1_id == a && self.user2_id == b) || (self.user1_id == b && self.user2_id == a)
    }
}

/// Optional file or image referenced by URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
pub struct Attachment {
    /// Where the attachment is stored.
    pub url: String,
    /// Free-form kind, e.g. `image` or `file`.
    pub kind: String,
}

/// One chat entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
pub struct Message {
    /// Message identifier.
    pub id: MessageId,
    /// Chat the message belongs to.
    pub chat_id: ChatId,
    /// Author.
    pub sender_id: UserId,
    /// Addressee (the other chat participant).
    pub receiver_id: UserId,
    /// Text content, or [`TOMBSTONE`] once deleted.
    pub content: String,
    /// Optional attachment.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attachment: Option<Attachment>,
    /// Message this one replies to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<MessageId>,
    /// Set once the content has been edited.
    pub is_edited: bool,
    /// Set once the message has been deleted.
    pub is_deleted: bool,
    /// When the receiver's client acknowledged delivery.
    pub received_at: Option<DateTime<Utc>>,
    /// When the receiver read the message.
    pub read_at: Option<DateTime<Utc>>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last mutation timestamp.
    pub updated_at: DateTime<Utc>,
}

impl Message {
    /// Whether the sender may still edit or delete this message at `now`.
    ///
    /// True only while the message is at most [`EDIT_WINDOW`] old, unread
    /// and not deleted.
    #[must_use]
    pub fn is_editable_at(&self, now: DateTime<Utc>) -> bool {
        now - self.created_at <= EDIT_WINDOW && self.read_at.is_none() && !self.is_deleted
    }

    /// Rewrites the content and sets the edited flag.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::PreconditionFailed`] if `actor` is not the
    /// sender or the message is no longer editable, and
    /// [`GatewayError::InvalidRequest`] for blank content.
    pub fn edit(
        &mut self,
        actor: UserId,
        content: &str,
        now: DateTime<Utc>,
    ) -> Result<(), GatewayError> {
        self.check_mutable(actor, now, "edited")?;
        if content.trim().is_empty() {
            return Err(GatewayError::InvalidRequest(
                "content must not be empty".to_string(),
            ));
        }
        self.content = content.to_string();
        self.is_edited = true;
        self.updated_at = now;
        Ok(())
    }

    /// Replaces the content with [`TOMBSTONE`] and sets the deleted flag.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::PreconditionFailed`] if `actor` is not the
    /// sender or the message is no longer deletable.
    pub fn delete(&mut self, actor: UserId, now: DateTime<Utc>) -> Result<(), GatewayError> {
        self.check_mutable(actor, now, "deleted")?;
        self.content = TOMBSTONE.to_string();
        self.is_deleted = true;
        self.updated_at = now;
        Ok(())
    }

    /// Sets `received_at` if unset. Returns `true` if anything changed.
    pub fn mark_received(&mut self, now: DateTime<Utc>) -> bool {
        if self.received_at.is_some() {
            return false;
        }
        self.received_at = Some(now);
        self.updated_at = now;
        true
    }

    /// Sets `read_at` if unset, and `received_at` with it when missing.
    /// Returns `true` if anything changed.
    pub fn mark_read(&mut self, now: DateTime<Utc>) -> bool {
        if self.read_at.is_some() {
            return false;
        }
        self.read_at = Some(now);
        if self.received_at.is_none() {
            self.received_at = Some(now);
        }
        self.updated_at = now;
        true
    }

    /// Applies `change` on behalf of `actor`.
    ///
    /// # Errors
    ///
    /// Same as [`Message::edit`] and [`Message::delete`].
    pub fn apply(
        &mut self,
        actor: UserId,
        change: &MessageChange,
        now: DateTime<Utc>,
    ) -> Result<(), GatewayError> {
        match change {
            MessageChange::Edit(content) => self.edit(actor, content, now),
            MessageChange::Delete => self.delete(actor, now),
        }
    }

    /// Records `receipt`. Returns `true` if anything changed.
    pub fn acknowledge(&mut self, receipt: Receipt, now: DateTime<Utc>) -> bool {
        match receipt {
            Receipt::Received => self.mark_received(now),
            Receipt::Read => self.mark_read(now),
        }
    }

    /// Returns `true` if `user` is the sender or the receiver.
    #[must_use]
    pub fn is_party(&self, user: UserId) -> bool {
        self.sender_id == user || self.receiver_id == user
    }

    /// Returns `true` if this message counts as unread for `user`.
    #[must_use]
    pub fn is_unread_for(&self, user: UserId) -> bool {
        self.receiver_id == user && self.read_at.is_none()
    }

    fn check_mutable(
        &self,
        actor: UserId,
        now: DateTime<Utc>,
        verb: &str,
    ) -> Result<(), GatewayError> {
        if actor != self.sender_id {
            return Err(GatewayError::PreconditionFailed(format!(
                "only the sender can have a message {verb}"
            )));
        }
        if self.is_deleted {
            return Err(GatewayError::PreconditionFailed(format!(
                "message {} is already deleted",
                self.id
            )));
        }
        if self.read_at.is_some() {
            return Err(GatewayError::PreconditionFailed(format!(
                "message {} has been read and can no longer be {verb}",
                self.id
            )));
        }
        if now - self.created_at > EDIT_WINDOW {
            return Err(GatewayError::PreconditionFailed(format!(
                "message {} can no longer be {verb} after {} minutes",
                self.id,
                EDIT_WINDOW.num_minutes()
            )));
        }
        Ok(())
    }
}

/// Counts messages unread by `user`, optionally limited to one chat.
pub fn count_unread<'a>(
    messages: impl IntoIterator<Item = &'a Message>,
    user: UserId,
    chat: Option<ChatId>,
) -> u64 {
    let count = messages
        .into_iter()
        .filter(|m| m.is_unread_for(user))
        .filter(|m| chat.is_none_or(|c| m.chat_id == c))
        .count();
    u64::try_from(count).unwrap_or(u64::MAX)
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;

    fn message_at(created_at: DateTime<Utc>) -> Message {
        Message {
            id: MessageId::new(1),
            chat_id: ChatId::new(1),
            sender_id: UserId::new(10),
            receiver_id: UserId::new(20),
            content: "hello".to_string(),
            attachment: None,
            reply_to: None,
            is_edited: false,
            is_deleted: false,
            received_at: None,
            read_at: None,
            created_at,
            updated_at: created_at,
        }
    }

    #[test]
    fn editability_follows_window_and_read_state() {
        let sent = Utc::now();
        let msg = message_at(sent);

        assert!(msg.is_editable_at(sent));
        assert!(msg.is_editable_at(sent + Duration::seconds(6 * 60 + 59)));
        assert!(!msg.is_editable_at(sent + Duration::seconds(7 * 60 + 1)));

        let mut read = msg.clone();
        read.read_at = Some(sent);
        assert!(!read.is_editable_at(sent));
        assert!(!read.is_editable_at(sent + Duration::seconds(6 * 60 + 59)));
        assert!(!read.is_editable_at(sent + Duration::seconds(7 * 60 + 1)));
    }

    #[test]
    fn deleted_message_is_not_editable() {
        let sent = Utc::now();
        let mut msg = message_at(sent);
        msg.is_deleted = true;
        assert!(!msg.is_editable_at(sent));
    }

    #[test]
    fn edit_within_window_sets_flag() {
        let sent = Utc::now();
        let mut msg = message_at(sent);
        let result = msg.edit(UserId::new(10), "fixed", sent + Duration::minutes(1));
        assert!(result.is_ok());
        assert_eq!(msg.content, "fixed");
        assert!(msg.is_edited);
    }

    #[test]
    fn edit_after_window_is_rejected() {
        let sent = Utc::now();
        let mut msg = message_at(sent);
        let result = msg.edit(UserId::new(10), "late", sent + Duration::seconds(421));
        assert!(matches!(result, Err(GatewayError::PreconditionFailed(_))));
        assert_eq!(msg.content, "hello");
    }

    #[test]
    fn edit_by_receiver_is_rejected() {
        let sent = Utc::now();
        let mut msg = message_at(sent);
        let result = msg.edit(UserId::new(20), "mine now", sent);
        assert!(matches!(result, Err(GatewayError::PreconditionFailed(_))));
    }

    #[test]
    fn delete_writes_tombstone() {
        let sent = Utc::now();
        let mut msg = message_at(sent);
        assert!(msg.delete(UserId::new(10), sent).is_ok());
        assert_eq!(msg.content, TOMBSTONE);
        assert!(msg.is_deleted);
        assert!(msg.delete(UserId::new(10), sent).is_err());
    }

    #[test]
    fn delete_after_read_is_rejected() {
        let sent = Utc::now();
        let mut msg = message_at(sent);
        msg.mark_read(sent);
        let result = msg.delete(UserId::new(10), sent);
        assert!(matches!(result, Err(GatewayError::PreconditionFailed(_))));
        assert!(!msg.is_deleted);
    }

    #[test]
    fn mark_read_implies_received() {
        let sent = Utc::now();
        let mut msg = message_at(sent);
        assert!(msg.mark_read(sent));
        assert!(msg.received_at.is_some());
        assert_eq!(msg.received_at, msg.read_at);
        assert!(!msg.mark_read(sent + Duration::seconds(5)));
    }

    #[test]
    fn mark_received_is_set_once() {
        let sent = Utc::now();
        let mut msg = message_at(sent);
        assert!(msg.mark_received(sent));
        let first = msg.received_at;
        assert!(!msg.mark_received(sent + Duration::seconds(5)));
        assert_eq!(msg.received_at, first);

        assert!(msg.mark_read(sent + Duration::seconds(9)));
        assert_eq!(msg.received_at, first);
    }

    #[test]
    fn apply_and_acknowledge_dispatch_to_rules() {
        let sent = Utc::now();
        let mut msg = message_at(sent);
        let edit = MessageChange::Edit("again".to_string());
        assert!(msg.apply(UserId::new(10), &edit, sent).is_ok());
        assert_eq!(msg.content, "again");

        assert!(msg.acknowledge(Receipt::Received, sent));
        assert!(msg.read_at.is_none());
        assert!(msg.acknowledge(Receipt::Read, sent));
        assert!(!msg.acknowledge(Receipt::Read, sent));

        let result = msg.apply(UserId::new(10), &MessageChange::Delete, sent);
        assert!(matches!(result, Err(GatewayError::PreconditionFailed(_))));
        assert!(msg.is_party(UserId::new(20)));
        assert!(!msg.is_party(UserId::new(30)));
    }

    #[test]
    fn unread_counts_per_chat_and_globally() {
        let now = Utc::now();
        let mut a = message_at(now);
        let mut b = message_at(now);
        b.chat_id = ChatId::new(2);
        let mut c = message_at(now);
        c.mark_read(now);
        let mut outgoing = message_at(now);
        outgoing.sender_id = UserId::new(20);
        outgoing.receiver_id = UserId::new(10);
        a.id = MessageId::new(1);
        b.id = MessageId::new(2);

        let all = [a, b, c, outgoing];
        assert_eq!(count_unread(&all, UserId::new(20), None), 2);
        assert_eq!(count_unread(&all, UserId::new(20), Some(ChatId::new(2))), 1);
        assert_eq!(count_unread(&all, UserId::new(10), None), 1);
    }

    #[test]
    fn other_participant_resolves_both_sides() {
        let now = Utc::now();
        let chat = Chat {
            id: ChatId::new(1),
            user1_id: UserId::new(1),
            user2_id: UserId::new(2),
            product_id: None,
            created_at: now,
            updated_at: now,
        };
        assert_eq!(chat.other_participant(UserId::new(1)), Some(UserId::new(2)));
        assert_eq!(chat.other_participant(UserId::new(2)), Some(UserId::new(1)));
        assert_eq!(chat.other_participant(UserId::new(3)), None);
        assert!(chat.is_between(UserId::new(2), UserId::new(1)));
    }
}
