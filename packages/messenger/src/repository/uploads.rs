use sqlx::Row;

use crate::models::Upload;

use super::{ChatRepository, StoreError, StoreResult};

/// Lifecycle of an object key handed out for upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadStatus {
    /// URL issued, object not yet verified
    Presigned,
    /// Object verified and attachable
    Ready,
    /// Object verified and rejected by policy
    Failed,
}

impl UploadStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            UploadStatus::Presigned => "presigned",
            UploadStatus::Ready => "ready",
            UploadStatus::Failed => "failed",
        }
    }
}

/// Object metadata recorded when an upload is confirmed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfirmedObject {
    pub content_type: String,
    pub size: i64,
    pub width: Option<i64>,
    pub height: Option<i64>,
}

impl ChatRepository {
    /// Record a freshly presigned key for `owner_user_id`.
    pub async fn create_upload(
        &self,
        file_id: &str,
        owner_user_id: i64,
        content_type: &str,
        filename: Option<&str>,
    ) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO uploads (file_id, owner_user_id, client_content_type, original_filename, status)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(file_id)
        .bind(owner_user_id)
        .bind(content_type)
        .bind(filename)
        .bind(UploadStatus::Presigned.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// The upload behind `file_id`, only if `owner_user_id` created it.
    pub async fn get_upload(&self, file_id: &str, owner_user_id: i64) -> StoreResult<Option<Upload>> {
        let row = sqlx::query(
            r#"
            SELECT file_id, owner_user_id, original_filename,
                   COALESCE(content_type, client_content_type) AS content_type,
                   size, width, height, status
            FROM uploads
            WHERE file_id = ? AND owner_user_id = ?
            "#,
        )
        .bind(file_id)
        .bind(owner_user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| Upload {
            file_id: r.get("file_id"),
            owner_user_id: r.get("owner_user_id"),
            content_type: r.get("content_type"),
            filename: r.get("original_filename"),
            size: r.get("size"),
            width: r.get("width"),
            height: r.get("height"),
            ready: r.get::<String, _>("status") == UploadStatus::Ready.as_str(),
        }))
    }

    /// Store verified object metadata and set the final status.
    /// `UploadNotFound` unless `owner_user_id` owns `file_id`.
    pub async fn confirm_upload(
        &self,
        file_id: &str,
        owner_user_id: i64,
        object: &ConfirmedObject,
        status: UploadStatus,
    ) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE uploads
            SET content_type = ?, size = ?, width = ?, height = ?, status = ?,
                confirmed_at = unixepoch()
            WHERE file_id = ? AND owner_user_id = ?
            "#,
        )
        .bind(&object.content_type)
        .bind(object.size)
        .bind(object.width)
        .bind(object.height)
        .bind(status.as_str())
        .bind(file_id)
        .bind(owner_user_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::UploadNotFound);
        }
        Ok(())
    }

    /// Owners can always fetch their uploads; anyone else only once the
    /// object is attached to a message in a chat they take part in.
    pub async fn can_download(&self, file_id: &str, user_id: i64) -> StoreResult<bool> {
        let visible: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (SELECT 1 FROM uploads WHERE file_id = ? AND owner_user_id = ?)
                OR EXISTS (
                    SELECT 1 FROM attachments a
                    JOIN messages m ON m.id = a.message_id
                    JOIN chat_participants p ON p.chat_id = m.chat_id AND p.user_id = ?
                    WHERE a.file_id = ?
                )
            "#,
        )
        .bind(file_id)
        .bind(user_id)
        .bind(user_id)
        .bind(file_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(visible)
    }
}
