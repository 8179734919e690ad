use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Deserialize;
use tracing::info;

use crate::AppState;
use crate::auth::CurrentUser;
use crate::error::{ApiError, ApiResult};

#[derive(Deserialize)]
pub struct CreateChatRequest {
    #[serde(default)]
    user_ids: Vec<i64>,
}

#[derive(Deserialize)]
pub struct DeleteChatsRequest {
    #[serde(default)]
    chat_ids: Vec<i64>,
}

pub async fn create_chat(
    State(state): State<AppState>,
    user: CurrentUser,
    Json(req): Json<CreateChatRequest>,
) -> ApiResult<impl IntoResponse> {
    let chat = state.repository.create_chat(user.id(), &req.user_ids).await?;
    info!(chat_id = chat.id, user_id = user.id(), "chat created");
    Ok((StatusCode::CREATED, Json(serde_json::json!({ "chat": chat }))))
}

pub async fn list_chats(
    State(state): State<AppState>,
    user: CurrentUser,
) -> ApiResult<impl IntoResponse> {
    let chats = state.repository.list_chats(user.id()).await?;
    Ok(Json(serde_json::json!({ "chats": chats })))
}

pub async fn total_unread_count(
    State(state): State<AppState>,
    user: CurrentUser,
) -> ApiResult<impl IntoResponse> {
    let unread = state.repository.total_unread_count(user.id()).await?;
    Ok(Json(serde_json::json!({ "unread_count": unread })))
}

pub async fn get_chat(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(chat_id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    state.repository.ensure_participant(chat_id, user.id()).await?;
    let chat = state.repository.get_chat(chat_id).await?;
    let unread = state.repository.unread_count(chat_id, user.id()).await?;
    let others_max = state
        .repository
        .others_max_last_read(chat_id, user.id())
        .await?;
    Ok(Json(serde_json::json!({
        "chat": chat,
        "unread_count": unread,
        "others_max_last_read_message_id": others_max,
    })))
}

pub async fn delete_chats(
    State(state): State<AppState>,
    user: CurrentUser,
    Json(req): Json<DeleteChatsRequest>,
) -> ApiResult<impl IntoResponse> {
    if req.chat_ids.is_empty() {
        return Err(ApiError::BadRequest("chat_ids is required"));
    }
    let deleted = state.repository.delete_chats(user.id(), &req.chat_ids).await?;
    info!(user_id = user.id(), count = deleted.len(), "chats deleted");
    Ok(Json(serde_json::json!({ "chat_ids": deleted })))
}
