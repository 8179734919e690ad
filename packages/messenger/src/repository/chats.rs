use sqlx::Row;
use sqlx::sqlite::SqliteConnection;
use std::collections::BTreeSet;

use crate::models::{ChatInfo, ChatListItem};

use super::{ChatRepository, StoreError, StoreResult, placeholders};

impl ChatRepository {
    /// Create a chat between `creator` and `user_ids`.
    ///
    /// Non-positive and duplicate ids are dropped. The creator is always a
    /// participant; if no other valid id remains the request is rejected.
    pub async fn create_chat(&self, creator: i64, user_ids: &[i64]) -> StoreResult<ChatInfo> {
        let mut participants: BTreeSet<i64> = user_ids
            .iter()
            .copied()
            .filter(|&id| id > 0 && id != creator)
            .collect();
        if participants.is_empty() {
            return Err(StoreError::EmptyParticipants);
        }
        participants.insert(creator);

        let mut tx = self.pool.begin().await?;

        let chat_id = sqlx::query("INSERT INTO chats DEFAULT VALUES")
            .execute(&mut *tx)
            .await?
            .last_insert_rowid();

        for user_id in &participants {
            sqlx::query("INSERT INTO chat_participants (chat_id, user_id) VALUES (?, ?)")
                .bind(chat_id)
                .bind(user_id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;

        self.get_chat(chat_id).await
    }

    pub async fn get_chat(&self, chat_id: i64) -> StoreResult<ChatInfo> {
        let exists: Option<i64> = sqlx::query_scalar("SELECT id FROM chats WHERE id = ?")
            .bind(chat_id)
            .fetch_optional(&self.pool)
            .await?;
        if exists.is_none() {
            return Err(StoreError::ChatNotFound);
        }

        Ok(ChatInfo {
            id: chat_id,
            users: self.chat_users(chat_id).await?,
        })
    }

    /// `ChatNotFound` if the chat is missing, `NotParticipant` if `user_id`
    /// is not in it.
    pub async fn ensure_participant(&self, chat_id: i64, user_id: i64) -> StoreResult<()> {
        let mut conn = self.pool.acquire().await?;
        check_participant(&mut conn, chat_id, user_id).await
    }

    /// Chat ids `user_id` participates in, restricted to `candidates`.
    pub async fn participating_chat_ids(
        &self,
        user_id: i64,
        candidates: &[i64],
    ) -> StoreResult<Vec<i64>> {
        if candidates.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT chat_id FROM chat_participants WHERE user_id = ? AND chat_id IN ({}) ORDER BY chat_id",
            placeholders(candidates.len())
        );
        let mut q = sqlx::query_scalar::<_, i64>(&sql).bind(user_id);
        for id in candidates {
            q = q.bind(id);
        }
        Ok(q.fetch_all(&self.pool).await?)
    }

    /// The user's chats, most recent activity first; chats without messages last.
    pub async fn list_chats(&self, user_id: i64) -> StoreResult<Vec<ChatListItem>> {
        let rows = sqlx::query(
            r#"
            SELECT
                p.chat_id AS chat_id,
                lm.last_message_id AS last_message_id,
                (
                    SELECT COUNT(*) FROM messages m
                    WHERE m.chat_id = p.chat_id
                      AND m.sender_user_id != p.user_id
                      AND m.id > MAX(COALESCE(p.last_read_message_id, 0), 0)
                ) AS unread_count,
                (
                    SELECT COALESCE(MAX(MAX(COALESCE(o.last_read_message_id, 0), 0)), 0)
                    FROM chat_participants o
                    WHERE o.chat_id = p.chat_id AND o.user_id != p.user_id
                ) AS others_max
            FROM chat_participants p
            LEFT JOIN (
                SELECT chat_id, MAX(id) AS last_message_id FROM messages GROUP BY chat_id
            ) lm ON lm.chat_id = p.chat_id
            WHERE p.user_id = ?
            ORDER BY lm.last_message_id IS NULL, lm.last_message_id DESC, p.chat_id DESC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        let mut chats = Vec::with_capacity(rows.len());
        for r in rows {
            let chat_id: i64 = r.get("chat_id");
            let last_message_id: Option<i64> = r.get("last_message_id");
            let last_message = match last_message_id {
                Some(id) => self.get_message(chat_id, id).await?,
                None => None,
            };
            chats.push(ChatListItem {
                id: chat_id,
                users: self.chat_users(chat_id).await?,
                last_message,
                unread_count: r.get("unread_count"),
                others_max_last_read_message_id: r.get("others_max"),
            });
        }
        Ok(chats)
    }

    /// Delete the listed chats that `user_id` participates in. Returns the ids
    /// actually deleted, ascending; `ChatsNotFound` when there are none.
    pub async fn delete_chats(&self, user_id: i64, chat_ids: &[i64]) -> StoreResult<Vec<i64>> {
        if chat_ids.is_empty() {
            return Err(StoreError::ChatsNotFound);
        }

        let sql = format!(
            r#"
            DELETE FROM chats
            WHERE id IN ({})
              AND id IN (SELECT chat_id FROM chat_participants WHERE user_id = ?)
            RETURNING id
            "#,
            placeholders(chat_ids.len())
        );
        let mut q = sqlx::query_scalar::<_, i64>(&sql);
        for id in chat_ids {
            q = q.bind(id);
        }
        let mut deleted = q.bind(user_id).fetch_all(&self.pool).await?;
        if deleted.is_empty() {
            return Err(StoreError::ChatsNotFound);
        }
        deleted.sort_unstable();
        Ok(deleted)
    }
}

/// Participation check on an existing connection, so it can run inside a
/// caller's transaction.
pub(super) async fn check_participant(
    conn: &mut SqliteConnection,
    chat_id: i64,
    user_id: i64,
) -> StoreResult<()> {
    let row: Option<(i64, Option<i64>)> = sqlx::query_as(
        r#"
        SELECT c.id, p.user_id
        FROM chats c
        LEFT JOIN chat_participants p ON p.chat_id = c.id AND p.user_id = ?
        WHERE c.id = ?
        "#,
    )
    .bind(user_id)
    .bind(chat_id)
    .fetch_optional(&mut *conn)
    .await?;

    match row {
        Some((_, Some(_))) => Ok(()),
        Some((_, None)) => Err(StoreError::NotParticipant { chat_id, user_id }),
        None => Err(StoreError::ChatNotFound),
    }
}
