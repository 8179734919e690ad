use axum::{
    Json,
    extract::State,
    http::StatusCode,
    response::IntoResponse,
};
use serde::Deserialize;
use tracing::debug;

use crate::AppState;
use crate::auth::CurrentUser;
use crate::error::ApiResult;

#[derive(Deserialize)]
pub struct PresignUploadRequest {
    #[serde(default)]
    content_type: String,
    #[serde(default)]
    filename: Option<String>,
}

#[derive(Deserialize)]
pub struct FileRequest {
    #[serde(default)]
    file_id: String,
}

pub async fn presign_upload(
    State(state): State<AppState>,
    user: CurrentUser,
    Json(req): Json<PresignUploadRequest>,
) -> ApiResult<impl IntoResponse> {
    let presigned = state
        .uploads
        .presign_upload(user.id(), &req.content_type, req.filename.as_deref())
        .await?;
    Ok(Json(serde_json::json!({ "presign_upload": presigned })))
}

pub async fn presign_download(
    State(state): State<AppState>,
    user: CurrentUser,
    Json(req): Json<FileRequest>,
) -> ApiResult<impl IntoResponse> {
    let presigned = state.uploads.presign_download(user.id(), &req.file_id).await?;
    Ok(Json(serde_json::json!({ "presign_download": presigned })))
}

pub async fn confirm_upload(
    State(state): State<AppState>,
    user: CurrentUser,
    Json(req): Json<FileRequest>,
) -> ApiResult<StatusCode> {
    let object = state.uploads.confirm(user.id(), &req.file_id).await?;
    debug!(
        user_id = user.id(),
        file_id = %req.file_id,
        width = ?object.width,
        height = ?object.height,
        "upload ready"
    );
    Ok(StatusCode::NO_CONTENT)
}
