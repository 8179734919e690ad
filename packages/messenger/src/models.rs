use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Convert a stored unix timestamp (seconds) into a UTC datetime.
pub fn from_unix(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or_default()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// File metadata attached to a message, copied from the confirmed upload
/// whose object key is `file_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub id: i64,
    pub file_id: String,
    pub content_type: String,
    pub filename: Option<String>,
    pub size: Option<i64>,
    pub width: Option<i64>,
    pub height: Option<i64>,
}

/// Attachment as submitted with a new message: a confirmed upload's key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewAttachment {
    pub file_id: String,
}

/// An object key issued to a user for upload.
#[derive(Debug, Clone, PartialEq)]
pub struct Upload {
    pub file_id: String,
    pub owner_user_id: i64,
    /// Verified type once confirmed, the type the client declared before that
    pub content_type: String,
    pub filename: Option<String>,
    pub size: Option<i64>,
    pub width: Option<i64>,
    pub height: Option<i64>,
    pub ready: bool,
}

/// The message a reply points at, without its own reply chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyPreview {
    pub id: i64,
    pub user_id: i64,
    pub text: String,
    pub created_at: DateTime<Utc>,
    pub attachments: Vec<Attachment>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: i64,
    pub chat_id: i64,
    /// Sender
    pub user_id: i64,
    pub text: String,
    pub created_at: DateTime<Utc>,
    pub attachments: Vec<Attachment>,
    pub reply_to: Option<ReplyPreview>,
}

/// Input for [`crate::repository::ChatRepository::send_message`].
#[derive(Debug, Clone, Default)]
pub struct NewMessage {
    pub text: String,
    pub attachments: Vec<NewAttachment>,
    pub reply_to_message_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatInfo {
    pub id: i64,
    pub users: Vec<User>,
}

/// One row of a user's chat list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatListItem {
    pub id: i64,
    pub users: Vec<User>,
    pub last_message: Option<Message>,
    pub unread_count: i64,
    pub others_max_last_read_message_id: i64,
}
