use sqlx::Row;
use sqlx::sqlite::SqliteRow;
use std::collections::HashMap;

use crate::models::{Attachment, Message, NewMessage, ReplyPreview, from_unix};

use super::chats::check_participant;
use super::uploads::UploadStatus;
use super::{ChatRepository, StoreError, StoreResult, placeholders};

const MESSAGE_COLUMNS: &str = "id, chat_id, sender_user_id, text, reply_to_message_id, created_at";

struct MessageRow {
    id: i64,
    chat_id: i64,
    sender_user_id: i64,
    text: String,
    reply_to_message_id: Option<i64>,
    created_at: i64,
}

impl MessageRow {
    fn from_row(r: &SqliteRow) -> Self {
        Self {
            id: r.get("id"),
            chat_id: r.get("chat_id"),
            sender_user_id: r.get("sender_user_id"),
            text: r.get("text"),
            reply_to_message_id: r.get("reply_to_message_id"),
            created_at: r.get("created_at"),
        }
    }
}

impl ChatRepository {
    /// Store a message and its attachments in one transaction.
    ///
    /// The sender must participate in the chat and a reply target, if any,
    /// must belong to the same chat. Both are checked by the INSERT itself,
    /// which is also the first statement, so the transaction holds the write
    /// lock before it reads anything. Attachments must name confirmed uploads
    /// owned by the sender; their metadata is copied from the upload.
    pub async fn send_message(
        &self,
        chat_id: i64,
        sender_user_id: i64,
        new: &NewMessage,
    ) -> StoreResult<Message> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO messages (chat_id, sender_user_id, text, reply_to_message_id)
            SELECT ?, ?, ?, ?
            WHERE EXISTS (SELECT 1 FROM chat_participants WHERE chat_id = ? AND user_id = ?)
              AND (? IS NULL OR EXISTS (SELECT 1 FROM messages WHERE id = ? AND chat_id = ?))
            "#,
        )
        .bind(chat_id)
        .bind(sender_user_id)
        .bind(&new.text)
        .bind(new.reply_to_message_id)
        .bind(chat_id)
        .bind(sender_user_id)
        .bind(new.reply_to_message_id)
        .bind(new.reply_to_message_id)
        .bind(chat_id)
        .execute(&mut *tx)
        .await?;

        if inserted.rows_affected() == 0 {
            // Nothing was written; report whichever guard failed
            check_participant(&mut *tx, chat_id, sender_user_id).await?;
            return Err(StoreError::ReplyTargetNotFound);
        }
        let message_id = inserted.last_insert_rowid();

        for att in &new.attachments {
            let copied = sqlx::query(
                r#"
                INSERT INTO attachments (message_id, file_id, content_type, filename, size, width, height)
                SELECT ?, file_id, COALESCE(content_type, client_content_type), original_filename, size, width, height
                FROM uploads
                WHERE file_id = ? AND owner_user_id = ? AND status = ?
                "#,
            )
            .bind(message_id)
            .bind(&att.file_id)
            .bind(sender_user_id)
            .bind(UploadStatus::Ready.as_str())
            .execute(&mut *tx)
            .await?;
            if copied.rows_affected() == 0 {
                return Err(StoreError::UploadNotReady {
                    file_id: att.file_id.clone(),
                });
            }
        }

        tx.commit().await?;

        self.get_message(chat_id, message_id)
            .await?
            .ok_or(StoreError::MessageNotFound)
    }

    pub async fn get_message(&self, chat_id: i64, message_id: i64) -> StoreResult<Option<Message>> {
        let sql = format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE chat_id = ? AND id = ?");
        let row = sqlx::query(&sql)
            .bind(chat_id)
            .bind(message_id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(r) => Ok(self.hydrate(vec![MessageRow::from_row(&r)]).await?.pop()),
            None => Ok(None),
        }
    }

    /// Page backwards through a chat. Returns (messages_oldest_first, has_more).
    pub async fn get_messages(
        &self,
        chat_id: i64,
        before_id: Option<i64>,
        limit: i64,
    ) -> StoreResult<(Vec<Message>, bool)> {
        // Fetch limit+1 to detect whether there are more pages
        let fetch_limit = limit + 1;

        let rows = if let Some(bid) = before_id {
            let sql = format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages WHERE chat_id = ? AND id < ? ORDER BY id DESC LIMIT ?"
            );
            sqlx::query(&sql)
                .bind(chat_id)
                .bind(bid)
                .bind(fetch_limit)
                .fetch_all(&self.pool)
                .await?
        } else {
            let sql = format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages WHERE chat_id = ? ORDER BY id DESC LIMIT ?"
            );
            sqlx::query(&sql)
                .bind(chat_id)
                .bind(fetch_limit)
                .fetch_all(&self.pool)
                .await?
        };

        let has_more = rows.len() as i64 > limit;
        let mut page: Vec<MessageRow> = rows
            .iter()
            .take(limit as usize)
            .map(MessageRow::from_row)
            .collect();
        page.reverse();

        Ok((self.hydrate(page).await?, has_more))
    }

    pub async fn delete_message(&self, chat_id: i64, message_id: i64) -> StoreResult<()> {
        let result = sqlx::query("DELETE FROM messages WHERE chat_id = ? AND id = ?")
            .bind(chat_id)
            .bind(message_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::MessageNotFound);
        }
        Ok(())
    }

    /// Delete the listed messages of a chat. Returns the ids actually deleted,
    /// ascending; `MessagesNotFound` when none matched.
    pub async fn delete_messages(&self, chat_id: i64, message_ids: &[i64]) -> StoreResult<Vec<i64>> {
        if message_ids.is_empty() {
            return Err(StoreError::MessagesNotFound);
        }

        let sql = format!(
            "DELETE FROM messages WHERE chat_id = ? AND id IN ({}) RETURNING id",
            placeholders(message_ids.len())
        );
        let mut q = sqlx::query_scalar::<_, i64>(&sql).bind(chat_id);
        for id in message_ids {
            q = q.bind(id);
        }
        let mut deleted = q.fetch_all(&self.pool).await?;
        if deleted.is_empty() {
            return Err(StoreError::MessagesNotFound);
        }
        deleted.sort_unstable();
        Ok(deleted)
    }

    async fn attachments_for(&self, message_ids: &[i64]) -> StoreResult<HashMap<i64, Vec<Attachment>>> {
        let mut by_message: HashMap<i64, Vec<Attachment>> = HashMap::new();
        if message_ids.is_empty() {
            return Ok(by_message);
        }

        let sql = format!(
            r#"
            SELECT id, message_id, file_id, content_type, filename, size, width, height
            FROM attachments
            WHERE message_id IN ({})
            ORDER BY id
            "#,
            placeholders(message_ids.len())
        );
        let mut q = sqlx::query(&sql);
        for id in message_ids {
            q = q.bind(id);
        }
        for r in q.fetch_all(&self.pool).await? {
            by_message
                .entry(r.get("message_id"))
                .or_default()
                .push(Attachment {
                    id: r.get("id"),
                    file_id: r.get("file_id"),
                    content_type: r.get("content_type"),
                    filename: r.get("filename"),
                    size: r.get("size"),
                    width: r.get("width"),
                    height: r.get("height"),
                });
        }
        Ok(by_message)
    }

    /// Attach attachments and reply previews to raw rows, preserving order.
    async fn hydrate(&self, rows: Vec<MessageRow>) -> StoreResult<Vec<Message>> {
        let reply_ids: Vec<i64> = rows.iter().filter_map(|r| r.reply_to_message_id).collect();

        let mut replies: HashMap<i64, MessageRow> = HashMap::new();
        if !reply_ids.is_empty() {
            let sql = format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages WHERE id IN ({})",
                placeholders(reply_ids.len())
            );
            let mut q = sqlx::query(&sql);
            for id in &reply_ids {
                q = q.bind(id);
            }
            for r in q.fetch_all(&self.pool).await? {
                let row = MessageRow::from_row(&r);
                replies.insert(row.id, row);
            }
        }

        let mut ids: Vec<i64> = rows.iter().map(|r| r.id).collect();
        ids.extend(replies.keys().copied());
        let mut attachments = self.attachments_for(&ids).await?;

        let reply_previews: HashMap<i64, ReplyPreview> = replies
            .into_values()
            .map(|r| {
                let preview = ReplyPreview {
                    id: r.id,
                    user_id: r.sender_user_id,
                    text: r.text,
                    created_at: from_unix(r.created_at),
                    attachments: attachments.get(&r.id).cloned().unwrap_or_default(),
                };
                (r.id, preview)
            })
            .collect();

        Ok(rows
            .into_iter()
            .map(|r| Message {
                id: r.id,
                chat_id: r.chat_id,
                user_id: r.sender_user_id,
                text: r.text,
                created_at: from_unix(r.created_at),
                attachments: attachments.remove(&r.id).unwrap_or_default(),
                reply_to: r
                    .reply_to_message_id
                    .and_then(|id| reply_previews.get(&id).cloned()),
            })
            .collect())
    }
}
