use sqlx::Row;
use sqlx::sqlite::SqliteRow;

use crate::models::{User, from_unix};

use super::{ChatRepository, StoreResult};

fn user_from_row(r: &SqliteRow) -> User {
    User {
        id: r.get("id"),
        name: r.get("name"),
        created_at: from_unix(r.get("created_at")),
    }
}

impl ChatRepository {
    /// Create the user or update its name. An empty name keeps the stored one.
    pub async fn upsert_user(&self, id: i64, name: &str) -> StoreResult<User> {
        sqlx::query(
            r#"
            INSERT INTO users (id, name) VALUES (?, ?)
            ON CONFLICT(id) DO UPDATE SET
                name = CASE WHEN excluded.name = '' THEN users.name ELSE excluded.name END
            "#,
        )
        .bind(id)
        .bind(name)
        .execute(&self.pool)
        .await?;

        let row = sqlx::query("SELECT id, name, created_at FROM users WHERE id = ?")
            .bind(id)
            .fetch_one(&self.pool)
            .await?;
        Ok(user_from_row(&row))
    }

    pub async fn get_user(&self, id: i64) -> StoreResult<Option<User>> {
        let row = sqlx::query("SELECT id, name, created_at FROM users WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(user_from_row))
    }

    /// Participants of a chat. Participants without a users row get an empty
    /// name and their join time as `created_at`.
    pub async fn chat_users(&self, chat_id: i64) -> StoreResult<Vec<User>> {
        let rows = sqlx::query(
            r#"
            SELECT p.user_id AS id,
                   COALESCE(u.name, '') AS name,
                   COALESCE(u.created_at, p.joined_at) AS created_at
            FROM chat_participants p
            LEFT JOIN users u ON u.id = p.user_id
            WHERE p.chat_id = ?
            ORDER BY p.user_id
            "#,
        )
        .bind(chat_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(user_from_row).collect())
    }
}
