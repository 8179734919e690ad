use crate::reconcile::{ReadPosition, normalize_marker};

use super::{ChatRepository, StoreError, StoreResult};

/// Highest read marker among the other participants; null and negative count as 0.
const OTHERS_MAX_SQL: &str = r#"
    SELECT COALESCE(MAX(MAX(COALESCE(last_read_message_id, 0), 0)), 0)
    FROM chat_participants
    WHERE chat_id = ? AND user_id != ?
"#;

impl ChatRepository {
    /// Advance `user_id`'s read marker in `chat_id` towards `requested`.
    ///
    /// The candidate is clamped to the newest message sent by someone else
    /// and only written when it is ahead of the stored marker. The statement
    /// that does this is the first in the transaction, so concurrent callers
    /// queue on SQLite's write lock instead of failing with a stale snapshot.
    pub async fn set_last_read(
        &self,
        chat_id: i64,
        user_id: i64,
        requested: i64,
    ) -> StoreResult<ReadPosition> {
        let mut tx = self.pool.begin().await?;

        let advanced: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE chat_participants
            SET last_read_message_id = c.candidate
            FROM (
                SELECT MIN(
                    MAX(?, 0),
                    (SELECT COALESCE(MAX(id), 0) FROM messages WHERE chat_id = ? AND sender_user_id != ?)
                ) AS candidate
            ) AS c
            WHERE chat_participants.chat_id = ?
              AND chat_participants.user_id = ?
              AND c.candidate > MAX(COALESCE(chat_participants.last_read_message_id, 0), 0)
            RETURNING last_read_message_id
            "#,
        )
        .bind(requested)
        .bind(chat_id)
        .bind(user_id)
        .bind(chat_id)
        .bind(user_id)
        .fetch_optional(&mut *tx)
        .await?;

        let last_read_message_id = match advanced {
            Some(marker) => marker,
            None => {
                // Already at or past the candidate, or not a participant
                let stored: Option<Option<i64>> = sqlx::query_scalar(
                    "SELECT last_read_message_id FROM chat_participants WHERE chat_id = ? AND user_id = ?",
                )
                .bind(chat_id)
                .bind(user_id)
                .fetch_optional(&mut *tx)
                .await?;
                match stored {
                    Some(marker) => normalize_marker(marker),
                    None => return Err(StoreError::NotParticipant { chat_id, user_id }),
                }
            }
        };

        let others_max: i64 = sqlx::query_scalar(OTHERS_MAX_SQL)
            .bind(chat_id)
            .bind(user_id)
            .fetch_one(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(ReadPosition {
            user_id,
            last_read_message_id,
            others_max_last_read_message_id: others_max,
            advanced: advanced.is_some(),
        })
    }

    pub async fn others_max_last_read(&self, chat_id: i64, user_id: i64) -> StoreResult<i64> {
        Ok(sqlx::query_scalar(OTHERS_MAX_SQL)
            .bind(chat_id)
            .bind(user_id)
            .fetch_one(&self.pool)
            .await?)
    }

    /// Messages from others newer than the user's marker in one chat.
    pub async fn unread_count(&self, chat_id: i64, user_id: i64) -> StoreResult<i64> {
        let marker: Option<Option<i64>> = sqlx::query_scalar(
            "SELECT last_read_message_id FROM chat_participants WHERE chat_id = ? AND user_id = ?",
        )
        .bind(chat_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(marker) = marker else {
            return Err(StoreError::NotParticipant { chat_id, user_id });
        };

        Ok(sqlx::query_scalar(
            "SELECT COUNT(*) FROM messages WHERE chat_id = ? AND sender_user_id != ? AND id > ?",
        )
        .bind(chat_id)
        .bind(user_id)
        .bind(normalize_marker(marker))
        .fetch_one(&self.pool)
        .await?)
    }

    /// Unread messages across every chat the user participates in.
    pub async fn total_unread_count(&self, user_id: i64) -> StoreResult<i64> {
        Ok(sqlx::query_scalar(
            r#"
            SELECT COUNT(*)
            FROM messages m
            JOIN chat_participants p ON p.chat_id = m.chat_id
            WHERE p.user_id = ?
              AND m.sender_user_id != p.user_id
              AND m.id > MAX(COALESCE(p.last_read_message_id, 0), 0)
            "#,
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_helpers::{file_repository, insert_message, test_repository};
    use super::*;

    #[tokio::test]
    async fn marker_is_clamped_to_newest_foreign_message() {
        let repo = test_repository().await;
        let chat = repo.create_chat(1, &[2]).await.unwrap();
        let from_two = insert_message(&repo, chat.id, 2).await;
        insert_message(&repo, chat.id, 1).await;

        let pos = repo.set_last_read(chat.id, 1, 10_000).await.unwrap();
        assert_eq!(pos.last_read_message_id, from_two);
    }

    #[tokio::test]
    async fn marker_never_moves_backwards() {
        let repo = test_repository().await;
        let chat = repo.create_chat(1, &[2]).await.unwrap();
        let m1 = insert_message(&repo, chat.id, 2).await;
        let m2 = insert_message(&repo, chat.id, 2).await;

        let first = repo.set_last_read(chat.id, 1, m2).await.unwrap();
        assert_eq!(first.last_read_message_id, m2);
        assert!(first.advanced);

        let behind = repo.set_last_read(chat.id, 1, m1).await.unwrap();
        assert_eq!(behind.last_read_message_id, m2);
        assert!(!behind.advanced);

        let negative = repo.set_last_read(chat.id, 1, -7).await.unwrap();
        assert_eq!(negative.last_read_message_id, m2);
        assert!(!negative.advanced);

        assert!(!repo.set_last_read(chat.id, 1, m2).await.unwrap().advanced);
    }

    #[tokio::test]
    async fn no_foreign_messages_keeps_marker_at_zero() {
        let repo = test_repository().await;
        let chat = repo.create_chat(1, &[2]).await.unwrap();
        insert_message(&repo, chat.id, 1).await;

        let pos = repo.set_last_read(chat.id, 1, 50).await.unwrap();
        assert_eq!(pos.last_read_message_id, 0);
        assert_eq!(pos.others_max_last_read_message_id, 0);
        assert!(!pos.advanced);
    }

    #[tokio::test]
    async fn non_participant_fails_without_side_effects() {
        let repo = test_repository().await;
        let chat = repo.create_chat(1, &[2]).await.unwrap();
        insert_message(&repo, chat.id, 1).await;

        let err = repo.set_last_read(chat.id, 3, 1).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::NotParticipant { chat_id, user_id: 3 } if chat_id == chat.id
        ));
        assert!(matches!(
            repo.unread_count(chat.id, 3).await.unwrap_err(),
            StoreError::NotParticipant { .. }
        ));
    }

    #[tokio::test]
    async fn set_last_read_reports_others_max() {
        let repo = test_repository().await;
        let chat = repo.create_chat(1, &[2, 3]).await.unwrap();
        let m1 = insert_message(&repo, chat.id, 1).await;
        let m2 = insert_message(&repo, chat.id, 1).await;

        repo.set_last_read(chat.id, 2, m2).await.unwrap();
        repo.set_last_read(chat.id, 3, m1).await.unwrap();

        let pos = repo.set_last_read(chat.id, 3, m1).await.unwrap();
        assert_eq!(pos.others_max_last_read_message_id, m2);
        assert_eq!(repo.others_max_last_read(chat.id, 2).await.unwrap(), m1);
    }

    #[tokio::test]
    async fn legacy_negative_marker_is_treated_as_zero() {
        let repo = test_repository().await;
        let chat = repo.create_chat(1, &[2]).await.unwrap();
        let m1 = insert_message(&repo, chat.id, 2).await;
        sqlx::query("UPDATE chat_participants SET last_read_message_id = -3 WHERE user_id = 1")
            .execute(&repo.pool)
            .await
            .unwrap();

        assert_eq!(repo.unread_count(chat.id, 1).await.unwrap(), 1);
        assert_eq!(repo.others_max_last_read(chat.id, 2).await.unwrap(), 0);

        let pos = repo.set_last_read(chat.id, 1, m1).await.unwrap();
        assert_eq!(pos.last_read_message_id, m1);
    }

    #[tokio::test]
    async fn unread_counts_follow_marker() {
        let repo = test_repository().await;
        let a = repo.create_chat(1, &[2]).await.unwrap();
        let b = repo.create_chat(1, &[3]).await.unwrap();
        let a1 = insert_message(&repo, a.id, 2).await;
        insert_message(&repo, a.id, 2).await;
        insert_message(&repo, a.id, 1).await;
        insert_message(&repo, b.id, 3).await;

        assert_eq!(repo.unread_count(a.id, 1).await.unwrap(), 2);
        assert_eq!(repo.total_unread_count(1).await.unwrap(), 3);

        repo.set_last_read(a.id, 1, a1).await.unwrap();
        assert_eq!(repo.unread_count(a.id, 1).await.unwrap(), 1);
        assert_eq!(repo.total_unread_count(1).await.unwrap(), 2);
        assert_eq!(repo.total_unread_count(2).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn concurrent_advances_keep_the_highest() {
        let repo = test_repository().await;
        let chat = repo.create_chat(1, &[2]).await.unwrap();
        let mut ids = Vec::new();
        for _ in 0..10 {
            ids.push(insert_message(&repo, chat.id, 2).await);
        }

        let tasks: Vec<_> = ids
            .iter()
            .rev()
            .map(|&id| {
                let repo = repo.clone();
                let chat_id = chat.id;
                tokio::spawn(async move { repo.set_last_read(chat_id, 1, id).await })
            })
            .collect();
        for t in tasks {
            t.await.unwrap().unwrap();
        }

        assert_eq!(repo.unread_count(chat.id, 1).await.unwrap(), 0);
        let pos = repo.set_last_read(chat.id, 1, 0).await.unwrap();
        assert_eq!(pos.last_read_message_id, *ids.last().unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_updates_on_pooled_file_database_all_succeed() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = file_repository(tmp.path()).await;
        let readers = [2, 3, 4, 5];
        let chat = repo.create_chat(1, &readers).await.unwrap();
        let mut ids = Vec::new();
        for _ in 0..50 {
            ids.push(insert_message(&repo, chat.id, 1).await);
        }

        for round in 0..20 {
            let target = ids[round * 2 + 5];
            let tasks: Vec<_> = readers
                .iter()
                .map(|&user| {
                    let repo = repo.clone();
                    let chat_id = chat.id;
                    tokio::spawn(async move { repo.set_last_read(chat_id, user, target).await })
                })
                .collect();
            for t in tasks {
                let pos = t.await.unwrap().expect("concurrent update failed");
                assert_eq!(pos.last_read_message_id, target);
            }
        }

        // One user racing against itself keeps the highest marker
        let tasks: Vec<_> = ids
            .iter()
            .rev()
            .map(|&id| {
                let repo = repo.clone();
                let chat_id = chat.id;
                tokio::spawn(async move { repo.set_last_read(chat_id, 2, id).await })
            })
            .collect();
        for t in tasks {
            t.await.unwrap().expect("concurrent update failed");
        }

        let newest = *ids.last().unwrap();
        assert_eq!(repo.unread_count(chat.id, 2).await.unwrap(), 0);
        assert_eq!(repo.others_max_last_read(chat.id, 1).await.unwrap(), newest);
        assert_eq!(repo.unread_count(chat.id, 3).await.unwrap(), 50 - 44);
    }
}
