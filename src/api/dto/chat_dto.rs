//! Chat and message request/response bodies.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::domain::{Attachment, MessageId, UserId};
use crate::service::SendMessage;

/// Request body for `POST /chats`.
#[derive(Debug, Deserialize, ToSchema)]
pub struct StartChatRequest {
    /// The user to chat with.
    pub other_user_id: UserId,
    /// Product the conversation is about.
    #[serde(default)]
    pub product_id: Option<i64>,
}

/// Request body for `POST /chats/{id}/messages`.
#[derive(Debug, Deserialize, ToSchema)]
pub struct SendMessageRequest {
    /// Text content.
    pub content: String,
    /// Attachment URL.
    #[serde(default)]
    pub attachment_url: Option<String>,
    /// Attachment kind, `file` when omitted.
    #[serde(default)]
    pub attachment_type: Option<String>,
    /// Message being replied to.
    #[serde(default)]
    pub reply_to_id: Option<MessageId>,
}

impl From<SendMessageRequest> for SendMessage {
    fn from(req: SendMessageRequest) -> Self {
        let attachment = req
            .attachment_url
            .filter(|url| !url.trim().is_empty())
            .map(|url| Attachment {
                url,
                kind: req.attachment_type.unwrap_or_else(|| "file".to_string()),
            });
        Self {
            content: req.content,
            attachment,
            reply_to: req.reply_to_id,
        }
    }
}

/// Request body for `PATCH /messages/{id}`.
#[derive(Debug, Deserialize, ToSchema)]
pub struct EditMessageRequest {
    /// Replacement content.
    pub content: String,
}

/// Response body for `GET /messages/unread/count`.
#[derive(Debug, Serialize, ToSchema)]
pub struct UnreadCountResponse {
    /// Unread messages addressed to the caller.
    pub unread_count: u64,
}
