use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use tracing::error;

use crate::repository::StoreError;
use crate::uploads::UploadError;

/// Error returned by every REST handler.
///
/// Rendered as `{"error": {"code": "...", "message": "..."}}`.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("text or attachments is required")]
    TextOrAttachmentsRequired,
    #[error("too many attachments (max {max})")]
    TooManyAttachments { max: usize },
    #[error("invalid last_read_message_id")]
    InvalidLastReadMessageId,
    #[error("{0}")]
    BadRequest(&'static str),
    #[error("user_id cookie is required")]
    MissingIdentity,
    #[error("user_id must be a positive integer")]
    InvalidIdentity,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Upload(#[from] UploadError),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::TextOrAttachmentsRequired => {
                (StatusCode::BAD_REQUEST, "text_or_attachments_required")
            }
            ApiError::TooManyAttachments { .. } => (StatusCode::BAD_REQUEST, "too_many_attachments"),
            ApiError::InvalidLastReadMessageId => {
                (StatusCode::BAD_REQUEST, "invalid_last_read_message_id")
            }
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            ApiError::MissingIdentity => (StatusCode::UNAUTHORIZED, "unauthorized"),
            ApiError::InvalidIdentity => (StatusCode::BAD_REQUEST, "invalid_user_id"),
            ApiError::Store(store) => store_status_and_code(store),
            ApiError::Upload(upload) => match upload {
                UploadError::ContentTypeRequired => {
                    (StatusCode::BAD_REQUEST, "content_type_required")
                }
                UploadError::InvalidContentType(_) => {
                    (StatusCode::BAD_REQUEST, "invalid_content_type")
                }
                UploadError::InvalidFileId => (StatusCode::BAD_REQUEST, "invalid_file_id"),
                UploadError::ObjectMissing => (StatusCode::CONFLICT, "upload_incomplete"),
                UploadError::TooLarge { .. } => (StatusCode::PAYLOAD_TOO_LARGE, "upload_too_large"),
                UploadError::ObjectStore(_) | UploadError::UnexpectedStatus(_) => {
                    (StatusCode::BAD_GATEWAY, "object_store_error")
                }
                UploadError::Presign(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
                UploadError::Store(store) => store_status_and_code(store),
            },
            ApiError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        }
    }
}

fn store_status_and_code(store: &StoreError) -> (StatusCode, &'static str) {
    match store {
        StoreError::ChatNotFound => (StatusCode::NOT_FOUND, "chat_not_found"),
        StoreError::ChatsNotFound => (StatusCode::NOT_FOUND, "chats_not_found"),
        StoreError::NotParticipant { .. } => (StatusCode::FORBIDDEN, "not_participant"),
        StoreError::MessageNotFound => (StatusCode::NOT_FOUND, "message_not_found"),
        StoreError::MessagesNotFound => (StatusCode::NOT_FOUND, "messages_not_found"),
        StoreError::ReplyTargetNotFound => (StatusCode::BAD_REQUEST, "reply_to_message_not_found"),
        StoreError::EmptyParticipants => (StatusCode::BAD_REQUEST, "empty_participants"),
        StoreError::UploadNotFound => (StatusCode::NOT_FOUND, "upload_not_found"),
        StoreError::UploadNotReady { .. } => (StatusCode::BAD_REQUEST, "upload_not_confirmed"),
        StoreError::Database(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        let message = if status.is_server_error() {
            error!("request failed: {}", self);
            "internal server error".to_string()
        } else {
            self.to_string()
        };
        (
            status,
            Json(serde_json::json!({ "error": { "code": code, "message": message } })),
        )
            .into_response()
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;
