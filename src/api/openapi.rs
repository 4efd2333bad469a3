//! OpenAPI document assembled from the handler annotations.

use utoipa::OpenApi;

use super::dto;
use super::handlers::{admin, chat, message, system};
use crate::domain::{
    Attachment, Chat, ChatId, ConnectionId, ConnectionSummary, Message, MessageId,
    RegistryStats, UserId,
};
use crate::error::{ErrorBody, ErrorResponse};
use crate::service::{ChatOverview, DeliveryReport, LivenessState, MessagePage, MessageView};

/// OpenAPI description of every REST endpoint.
#[derive(Debug, OpenApi)]
#[openapi(
    info(
        title = "chat-gateway",
        description = "Real-time delivery gateway with chat lifecycle endpoints. Live delivery happens over `GET /ws`."
    ),
    paths(
        system::health_handler,
        chat::list_chats,
        chat::start_chat,
        chat::list_messages,
        chat::send_message,
        chat::mark_chat_read,
        message::mark_received,
        message::mark_read,
        message::edit_message,
        message::delete_message,
        message::unread_count,
        message::unread_messages,
        admin::connection_stats,
        admin::user_connections,
        admin::disconnect_user,
        admin::broadcast,
    ),
    components(schemas(
        ErrorResponse,
        ErrorBody,
        UserId,
        ChatId,
        MessageId,
        ConnectionId,
        Chat,
        Message,
        Attachment,
        ConnectionSummary,
        RegistryStats,
        ChatOverview,
        MessagePage,
        MessageView,
        DeliveryReport,
        LivenessState,
        dto::StartChatRequest,
        dto::SendMessageRequest,
        dto::EditMessageRequest,
        dto::UnreadCountResponse,
        dto::UpdatedResponse,
        dto::UserConnectionsResponse,
        dto::DisconnectResponse,
        dto::BroadcastRequest,
        system::HealthResponse,
    )),
    tags(
        (name = "System", description = "Health"),
        (name = "Chats", description = "Conversations between two users"),
        (name = "Messages", description = "Receipts, edits and unread queries"),
        (name = "Admin", description = "Presence and delivery administration"),
    )
)]
pub struct ApiDoc;
