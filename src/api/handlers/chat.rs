//! Chat handlers: list, start, history, send, mark read.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};

use crate::api::dto::{PaginationParams, SendMessageRequest, StartChatRequest, UpdatedResponse};
use crate::app_state::AppState;
use crate::domain::{Chat, ChatId};
use crate::error::{ErrorResponse, GatewayError};
use crate::identity::AuthUser;
use crate::service::{ChatOverview, MessagePage, MessageView};

/// `GET /chats` — The caller's chats.
///
/// # Errors
///
/// Returns [`GatewayError::Unauthorized`] without valid credentials.
#[utoipa::path(
    get,
    path = "/api/v1/chats",
    tag = "Chats",
    summary = "List chats",
    description = "Returns the caller's chats, most recently active first, each with its last message, unread count and the other participant.",
    responses(
        (status = 200, description = "Chat list", body = Vec<ChatOverview>),
        (status = 401, description = "Unauthorized", body = ErrorResponse),
    )
)]
pub async fn list_chats(
    State(state): State<AppState>,
    AuthUser(caller): AuthUser,
) -> Result<impl IntoResponse, GatewayError> {
    let chats = state.chat_service.list_chats(caller.user_id).await?;
    Ok(Json(chats))
}

/// `POST /chats` — Get or create the chat with another user.
///
/// # Errors
///
/// Returns [`GatewayError::InvalidRequest`] when the other user is the
/// caller.
#[utoipa::path(
    post,
    path = "/api/v1/chats",
    tag = "Chats",
    summary = "Start a chat",
    description = "Returns the existing chat between the caller and `other_user_id`, or creates it. A user cannot chat with themself.",
    request_body = StartChatRequest,
    responses(
        (status = 200, description = "The chat", body = Chat),
        (status = 400, description = "Invalid request", body = ErrorResponse),
        (status = 401, description = "Unauthorized", body = ErrorResponse),
    )
)]
pub async fn start_chat(
    State(state): State<AppState>,
    AuthUser(caller): AuthUser,
    Json(req): Json<StartChatRequest>,
) -> Result<impl IntoResponse, GatewayError> {
    let chat = state
        .chat_service
        .start_chat(caller.user_id, req.other_user_id, req.product_id)
        .await?;
    Ok(Json(chat))
}

/// `GET /chats/{id}/messages` — One page of history.
///
/// # Errors
///
/// Returns [`GatewayError::ChatNotFound`] if the caller is not a
/// participant.
#[utoipa::path(
    get,
    path = "/api/v1/chats/{id}/messages",
    tag = "Chats",
    summary = "List messages",
    description = "Returns non-deleted messages newest first with the total count and per-message `can_edit` / `can_delete` flags.",
    params(
        ("id" = i64, Path, description = "Chat id"),
        PaginationParams,
    ),
    responses(
        (status = 200, description = "Message page", body = MessagePage),
        (status = 404, description = "Chat not found", body = ErrorResponse),
    )
)]
pub async fn list_messages(
    State(state): State<AppState>,
    AuthUser(caller): AuthUser,
    Path(chat_id): Path<ChatId>,
    Query(params): Query<PaginationParams>,
) -> Result<impl IntoResponse, GatewayError> {
    let page = state
        .chat_service
        .list_messages(caller.user_id, chat_id, params.page())
        .await?;
    Ok(Json(page))
}

/// `POST /chats/{id}/messages` — Send a message.
///
/// # Errors
///
/// Returns [`GatewayError::ChatNotFound`] if the caller is not a
/// participant and [`GatewayError::InvalidRequest`] for blank content.
#[utoipa::path(
    post,
    path = "/api/v1/chats/{id}/messages",
    tag = "Chats",
    summary = "Send a message",
    description = "Stores a message to the other participant and pushes it to their open connections as a `new_message` event.",
    params(
        ("id" = i64, Path, description = "Chat id"),
    ),
    request_body = SendMessageRequest,
    responses(
        (status = 201, description = "Message stored", body = MessageView),
        (status = 400, description = "Invalid request", body = ErrorResponse),
        (status = 404, description = "Chat not found", body = ErrorResponse),
    )
)]
pub async fn send_message(
    State(state): State<AppState>,
    AuthUser(caller): AuthUser,
    Path(chat_id): Path<ChatId>,
    Json(req): Json<SendMessageRequest>,
) -> Result<impl IntoResponse, GatewayError> {
    let view = state
        .chat_service
        .send_message(caller.user_id, chat_id, req.into())
        .await?;
    Ok((StatusCode::CREATED, Json(view)))
}

/// `POST /chats/{id}/read` — Mark the chat read.
///
/// # Errors
///
/// Returns [`GatewayError::ChatNotFound`] if the caller is not a
/// participant.
#[utoipa::path(
    post,
    path = "/api/v1/chats/{id}/read",
    tag = "Chats",
    summary = "Mark chat read",
    description = "Marks every message addressed to the caller in the chat as read, and as received where it was not yet.",
    params(
        ("id" = i64, Path, description = "Chat id"),
    ),
    responses(
        (status = 200, description = "Messages updated", body = UpdatedResponse),
        (status = 404, description = "Chat not found", body = ErrorResponse),
    )
)]
pub async fn mark_chat_read(
    State(state): State<AppState>,
    AuthUser(caller): AuthUser,
    Path(chat_id): Path<ChatId>,
) -> Result<impl IntoResponse, GatewayError> {
    let updated = state
        .chat_service
        .mark_chat_read(caller.user_id, chat_id)
        .await?;
    Ok(Json(UpdatedResponse { updated }))
}

/// Chat routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/chats", get(list_chats).post(start_chat))
        .route("/chats/{id}/messages", get(list_messages).post(send_message))
        .route("/chats/{id}/read", post(mark_chat_read))
}
