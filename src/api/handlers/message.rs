//! Message handlers: receipts, edit, delete, unread queries.

use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::routing::{get, patch, post};
use axum::{Json, Router};

use crate::api::dto::{EditMessageRequest, UnreadCountResponse};
use crate::app_state::AppState;
use crate::domain::MessageId;
use crate::error::{ErrorResponse, GatewayError};
use crate::identity::AuthUser;
use crate::service::MessageView;

/// `POST /messages/{id}/received` — Delivery receipt.
///
/// # Errors
///
/// Returns [`GatewayError::MessageNotFound`] unless the caller is the
/// receiver.
#[utoipa::path(
    post,
    path = "/api/v1/messages/{id}/received",
    tag = "Messages",
    summary = "Mark message received",
    params(("id" = i64, Path, description = "Message id")),
    responses(
        (status = 200, description = "Updated message", body = MessageView),
        (status = 404, description = "Message not found", body = ErrorResponse),
    )
)]
pub async fn mark_received(
    State(state): State<AppState>,
    AuthUser(caller): AuthUser,
    Path(message_id): Path<MessageId>,
) -> Result<impl IntoResponse, GatewayError> {
    let view = state
        .chat_service
        .mark_received(caller.user_id, message_id)
        .await?;
    Ok(Json(view))
}

/// `POST /messages/{id}/read` — Read receipt.
///
/// # Errors
///
/// Returns [`GatewayError::MessageNotFound`] unless the caller is the
/// receiver.
#[utoipa::path(
    post,
    path = "/api/v1/messages/{id}/read",
    tag = "Messages",
    summary = "Mark message read",
    description = "Sets `read_at`, and `received_at` when it was not yet set.",
    params(("id" = i64, Path, description = "Message id")),
    responses(
        (status = 200, description = "Updated message", body = MessageView),
        (status = 404, description = "Message not found", body = ErrorResponse),
    )
)]
pub async fn mark_read(
    State(state): State<AppState>,
    AuthUser(caller): AuthUser,
    Path(message_id): Path<MessageId>,
) -> Result<impl IntoResponse, GatewayError> {
    let view = state
        .chat_service
        .mark_read(caller.user_id, message_id)
        .await?;
    Ok(Json(view))
}

/// `PATCH /messages/{id}` — Edit own message.
///
/// # Errors
///
/// Returns [`GatewayError::PreconditionFailed`] once the message is older
/// than seven minutes, read, deleted or not the caller's.
#[utoipa::path(
    patch,
    path = "/api/v1/messages/{id}",
    tag = "Messages",
    summary = "Edit a message",
    description = "Allowed for the sender while the message is at most 7 minutes old and unread.",
    params(("id" = i64, Path, description = "Message id")),
    request_body = EditMessageRequest,
    responses(
        (status = 200, description = "Edited message", body = MessageView),
        (status = 404, description = "Message not found", body = ErrorResponse),
        (status = 409, description = "No longer editable", body = ErrorResponse),
    )
)]
pub async fn edit_message(
    State(state): State<AppState>,
    AuthUser(caller): AuthUser,
    Path(message_id): Path<MessageId>,
    Json(req): Json<EditMessageRequest>,
) -> Result<impl IntoResponse, GatewayError> {
    let view = state
        .chat_service
        .edit_message(caller.user_id, message_id, &req.content)
        .await?;
    Ok(Json(view))
}

/// `DELETE /messages/{id}` — Delete own message.
///
/// # Errors
///
/// Same rules as [`edit_message`].
#[utoipa::path(
    delete,
    path = "/api/v1/messages/{id}",
    tag = "Messages",
    summary = "Delete a message",
    description = "Replaces the content with `[Message deleted]`. Same window and read rules as editing.",
    params(("id" = i64, Path, description = "Message id")),
    responses(
        (status = 200, description = "Deleted message", body = MessageView),
        (status = 404, description = "Message not found", body = ErrorResponse),
        (status = 409, description = "No longer deletable", body = ErrorResponse),
    )
)]
pub async fn delete_message(
    State(state): State<AppState>,
    AuthUser(caller): AuthUser,
    Path(message_id): Path<MessageId>,
) -> Result<impl IntoResponse, GatewayError> {
    let view = state
        .chat_service
        .delete_message(caller.user_id, message_id)
        .await?;
    Ok(Json(view))
}

/// `GET /messages/unread/count` — Global unread count.
///
/// # Errors
///
/// Returns [`GatewayError::Unauthorized`] without valid credentials.
#[utoipa::path(
    get,
    path = "/api/v1/messages/unread/count",
    tag = "Messages",
    summary = "Unread count",
    responses(
        (status = 200, description = "Unread count", body = UnreadCountResponse),
        (status = 401, description = "Unauthorized", body = ErrorResponse),
    )
)]
pub async fn unread_count(
    State(state): State<AppState>,
    AuthUser(caller): AuthUser,
) -> Result<impl IntoResponse, GatewayError> {
    let unread_count = state.chat_service.unread_count(caller.user_id).await?;
    Ok(Json(UnreadCountResponse { unread_count }))
}

/// `GET /messages/unread` — Unread messages.
///
/// # Errors
///
/// Returns [`GatewayError::Unauthorized`] without valid credentials.
#[utoipa::path(
    get,
    path = "/api/v1/messages/unread",
    tag = "Messages",
    summary = "Unread messages",
    responses(
        (status = 200, description = "Unread messages, newest first", body = Vec<MessageView>),
        (status = 401, description = "Unauthorized", body = ErrorResponse),
    )
)]
pub async fn unread_messages(
    State(state): State<AppState>,
    AuthUser(caller): AuthUser,
) -> Result<impl IntoResponse, GatewayError> {
    let messages = state.chat_service.unread_messages(caller.user_id).await?;
    Ok(Json(messages))
}

/// Message routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/messages/unread", get(unread_messages))
        .route("/messages/unread/count", get(unread_count))
        .route("/messages/{id}", patch(edit_message).delete(delete_message))
        .route("/messages/{id}/received", post(mark_received))
        .route("/messages/{id}/read", post(mark_read))
}
