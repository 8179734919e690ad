// Repository layer: each domain lives in its own file with `impl ChatRepository`.

use sqlx::sqlite::SqlitePool;

mod chats;
mod messages;
mod read_state;
mod uploads;
mod users;

pub use uploads::{ConfirmedObject, UploadStatus};

#[cfg(test)]
pub(crate) mod test_helpers;

/// Failures surfaced by the persistence layer.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("chat not found")]
    ChatNotFound,
    #[error("chats not found")]
    ChatsNotFound,
    #[error("user {user_id} is not a participant of chat {chat_id}")]
    NotParticipant { chat_id: i64, user_id: i64 },
    #[error("message not found")]
    MessageNotFound,
    #[error("messages not found")]
    MessagesNotFound,
    #[error("reply target not found in this chat")]
    ReplyTargetNotFound,
    #[error("no participants provided")]
    EmptyParticipants,
    #[error("upload not found")]
    UploadNotFound,
    #[error("attachment {file_id} is not a confirmed upload of the sender")]
    UploadNotReady { file_id: String },
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[derive(Clone)]
pub struct ChatRepository {
    pub(crate) pool: SqlitePool,
}

impl ChatRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

/// `?, ?, ?` for an `IN (...)` clause with `n` bound values.
fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholders_match_count() {
        assert_eq!(placeholders(1), "?");
        assert_eq!(placeholders(3), "?, ?, ?");
    }
}
