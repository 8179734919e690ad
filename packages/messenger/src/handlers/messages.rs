use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Deserialize;
use tracing::{debug, info};

use crate::AppState;
use crate::auth::CurrentUser;
use crate::error::{ApiError, ApiResult};
use crate::handlers::publish;
use crate::models::{NewAttachment, NewMessage};
use crate::ws::events::ChatEvent;

#[derive(Deserialize)]
pub struct SendMessageRequest {
    #[serde(default)]
    text: String,
    #[serde(default)]
    attachments: Vec<NewAttachment>,
    #[serde(default)]
    reply_to_message_id: Option<i64>,
}

#[derive(Deserialize)]
pub struct MessagesQuery {
    before_id: Option<i64>,
    limit: Option<i64>,
}

#[derive(Deserialize)]
pub struct MarkReadRequest {
    last_read_message_id: i64,
}

#[derive(Deserialize)]
pub struct DeleteMessagesRequest {
    #[serde(default)]
    message_ids: Vec<i64>,
}

pub async fn send_message(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(chat_id): Path<i64>,
    Json(req): Json<SendMessageRequest>,
) -> ApiResult<impl IntoResponse> {
    let text = req.text.trim();
    if text.is_empty() && req.attachments.is_empty() {
        return Err(ApiError::TextOrAttachmentsRequired);
    }
    let max = state.messages_config.max_attachments;
    if req.attachments.len() > max {
        return Err(ApiError::TooManyAttachments { max });
    }
    if req.attachments.iter().any(|a| a.file_id.trim().is_empty()) {
        return Err(ApiError::BadRequest("attachment file_id is required"));
    }

    let new = NewMessage {
        text: text.to_string(),
        attachments: req.attachments,
        reply_to_message_id: req.reply_to_message_id,
    };
    let message = state
        .repository
        .send_message(chat_id, user.id(), &new)
        .await?;
    debug!(chat_id, message_id = message.id, user_id = user.id(), "message stored");

    publish(&state, ChatEvent::message_new(message.clone())).await;

    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({ "message": message })),
    ))
}

pub async fn get_messages(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(chat_id): Path<i64>,
    Query(query): Query<MessagesQuery>,
) -> ApiResult<impl IntoResponse> {
    state.repository.ensure_participant(chat_id, user.id()).await?;

    let cfg = &state.messages_config;
    let limit = query
        .limit
        .unwrap_or(cfg.page_size)
        .clamp(1, cfg.max_page_size.max(1));
    let (messages, has_more) = state
        .repository
        .get_messages(chat_id, query.before_id, limit)
        .await?;

    Ok(Json(serde_json::json!({
        "messages": messages,
        "has_more": has_more,
    })))
}

pub async fn mark_read(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(chat_id): Path<i64>,
    Json(req): Json<MarkReadRequest>,
) -> ApiResult<StatusCode> {
    if req.last_read_message_id < 0 {
        return Err(ApiError::InvalidLastReadMessageId);
    }

    let position = state
        .reconciler
        .set_last_read(chat_id, user.id(), req.last_read_message_id)
        .await?;
    if position.advanced {
        state.metrics.read_marker_advanced();
    }
    state.metrics.event_broadcast();

    Ok(StatusCode::NO_CONTENT)
}

pub async fn delete_message(
    State(state): State<AppState>,
    user: CurrentUser,
    Path((chat_id, message_id)): Path<(i64, i64)>,
) -> ApiResult<StatusCode> {
    state.repository.ensure_participant(chat_id, user.id()).await?;
    state.repository.delete_message(chat_id, message_id).await?;
    info!(chat_id, message_id, user_id = user.id(), "message deleted");

    publish(&state, ChatEvent::messages_deleted(chat_id, vec![message_id])).await;

    Ok(StatusCode::NO_CONTENT)
}

pub async fn delete_messages(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(chat_id): Path<i64>,
    Json(req): Json<DeleteMessagesRequest>,
) -> ApiResult<impl IntoResponse> {
    if req.message_ids.is_empty() {
        return Err(ApiError::BadRequest("message_ids is required"));
    }
    state.repository.ensure_participant(chat_id, user.id()).await?;

    let deleted = state
        .repository
        .delete_messages(chat_id, &req.message_ids)
        .await?;
    info!(chat_id, count = deleted.len(), user_id = user.id(), "messages deleted");

    publish(&state, ChatEvent::messages_deleted(chat_id, deleted.clone())).await;

    Ok(Json(serde_json::json!({ "message_ids": deleted })))
}
