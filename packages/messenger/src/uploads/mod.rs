//! Direct-to-storage uploads.
//!
//! Clients never stream file bodies through the server. They ask for a
//! presigned PUT URL, upload to the object store, then confirm; confirmation
//! reads the object's real type and size back from storage and only then
//! makes the key attachable to messages.

pub mod policy;
pub mod presign;

use axum::http::{Method, StatusCode, header};
use chrono::Utc;
use image::ImageReader;
use serde::Serialize;
use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::UploadsConfig;
use crate::repository::{ChatRepository, ConfirmedObject, StoreError, UploadStatus};

use self::presign::{PresignError, Presigner};

/// Image headers are read from at most this many leading bytes.
const IMAGE_HEADER_RANGE: &str = "bytes=0-65535";

#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("content_type is required")]
    ContentTypeRequired,
    #[error("content type {0} is not allowed")]
    InvalidContentType(String),
    #[error("invalid file_id")]
    InvalidFileId,
    #[error("object has not been uploaded yet")]
    ObjectMissing,
    #[error("object exceeds the {max} byte upload limit")]
    TooLarge { max: i64 },
    #[error("object store request failed: {0}")]
    ObjectStore(#[from] reqwest::Error),
    #[error("object store answered {0}")]
    UnexpectedStatus(StatusCode),
    #[error(transparent)]
    Presign(#[from] PresignError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Serialize)]
pub struct PresignedUpload {
    pub file_id: String,
    pub upload_url: String,
    pub expires_in: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PresignedDownload {
    pub url: String,
    pub expires_in: u64,
}

#[derive(Clone)]
pub struct UploadService {
    presigner: Presigner,
    http: reqwest::Client,
    repository: Arc<ChatRepository>,
    ttl: Duration,
    max_upload_bytes: i64,
}

impl UploadService {
    pub fn new(config: &UploadsConfig, repository: Arc<ChatRepository>) -> Result<Self, PresignError> {
        Ok(Self {
            presigner: Presigner::new(config)?,
            http: reqwest::Client::new(),
            repository,
            ttl: Duration::from_secs(config.presign_ttl_secs),
            max_upload_bytes: config.max_upload_bytes,
        })
    }

    /// Reserve a fresh key for `user_id` and sign a PUT for it. The client
    /// must upload with exactly `content_type`.
    pub async fn presign_upload(
        &self,
        user_id: i64,
        content_type: &str,
        filename: Option<&str>,
    ) -> Result<PresignedUpload, UploadError> {
        let content_type = content_type.trim();
        if content_type.is_empty() {
            return Err(UploadError::ContentTypeRequired);
        }
        let file_id = policy::new_object_key(content_type)
            .ok_or_else(|| UploadError::InvalidContentType(content_type.to_string()))?;
        let filename = filename.map(str::trim).filter(|f| !f.is_empty());

        let upload_url = self.presigner.presign(
            &Method::PUT,
            &file_id,
            Some(content_type),
            self.ttl,
            Utc::now(),
        )?;
        self.repository
            .create_upload(&file_id, user_id, content_type, filename)
            .await?;
        debug!(user_id, file_id = %file_id, content_type, "upload presigned");

        Ok(PresignedUpload {
            file_id,
            upload_url,
            expires_in: self.ttl.as_secs(),
        })
    }

    /// Sign a GET for an object `user_id` may see.
    pub async fn presign_download(
        &self,
        user_id: i64,
        file_id: &str,
    ) -> Result<PresignedDownload, UploadError> {
        if !policy::is_valid_key(file_id) {
            return Err(UploadError::InvalidFileId);
        }
        if !self.repository.can_download(file_id, user_id).await? {
            return Err(StoreError::UploadNotFound.into());
        }

        let url = self
            .presigner
            .presign(&Method::GET, file_id, None, self.ttl, Utc::now())?;
        Ok(PresignedDownload {
            url,
            expires_in: self.ttl.as_secs(),
        })
    }

    /// Verify the uploaded object against storage and record its metadata.
    ///
    /// Objects of a disallowed type or over the size limit are marked failed
    /// and never become attachable.
    pub async fn confirm(&self, user_id: i64, file_id: &str) -> Result<ConfirmedObject, UploadError> {
        if !policy::is_valid_key(file_id) {
            return Err(UploadError::InvalidFileId);
        }
        let upload = self
            .repository
            .get_upload(file_id, user_id)
            .await?
            .ok_or(StoreError::UploadNotFound)?;

        let head_url = self
            .presigner
            .presign(&Method::HEAD, file_id, None, self.ttl, Utc::now())?;
        let resp = self.http.head(&head_url).send().await?;
        match resp.status() {
            status if status.is_success() => {}
            StatusCode::NOT_FOUND => return Err(UploadError::ObjectMissing),
            status => return Err(UploadError::UnexpectedStatus(status)),
        }

        // HEAD has no body, so the length comes from the header itself
        let headers = resp.headers();
        let content_type = headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(policy::essence)
            .filter(|ct| !ct.is_empty())
            .unwrap_or_else(|| policy::essence(&upload.content_type));
        let size = headers
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(0);

        let mut object = ConfirmedObject {
            content_type,
            size,
            ..Default::default()
        };

        if !policy::is_allowed(&object.content_type) {
            self.reject(file_id, user_id, &object).await?;
            return Err(UploadError::InvalidContentType(object.content_type));
        }
        if object.size > self.max_upload_bytes {
            self.reject(file_id, user_id, &object).await?;
            return Err(UploadError::TooLarge {
                max: self.max_upload_bytes,
            });
        }

        if policy::is_image(&object.content_type) {
            if let Some((width, height)) = self.image_dimensions(file_id).await? {
                object.width = Some(width);
                object.height = Some(height);
            }
        }

        self.repository
            .confirm_upload(file_id, user_id, &object, UploadStatus::Ready)
            .await?;
        info!(
            user_id,
            file_id,
            content_type = %object.content_type,
            size = object.size,
            "upload confirmed"
        );
        Ok(object)
    }

    async fn reject(
        &self,
        file_id: &str,
        user_id: i64,
        object: &ConfirmedObject,
    ) -> Result<(), UploadError> {
        warn!(
            user_id,
            file_id,
            content_type = %object.content_type,
            size = object.size,
            "upload rejected by policy"
        );
        self.repository
            .confirm_upload(file_id, user_id, object, UploadStatus::Failed)
            .await?;
        Ok(())
    }

    /// Width and height from the image header. Formats the decoder does not
    /// know confirm without dimensions.
    async fn image_dimensions(&self, file_id: &str) -> Result<Option<(i64, i64)>, UploadError> {
        let url = self
            .presigner
            .presign(&Method::GET, file_id, None, self.ttl, Utc::now())?;
        let resp = self
            .http
            .get(&url)
            .header(header::RANGE, IMAGE_HEADER_RANGE)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(UploadError::UnexpectedStatus(resp.status()));
        }
        let head = resp.bytes().await?;

        let dimensions = ImageReader::new(Cursor::new(head.as_ref()))
            .with_guessed_format()
            .ok()
            .and_then(|reader| reader.into_dimensions().ok());
        if dimensions.is_none() {
            debug!(file_id, "image header not decodable");
        }
        Ok(dimensions.map(|(w, h)| (i64::from(w), i64::from(h))))
    }
}
