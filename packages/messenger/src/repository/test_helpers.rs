use sqlx::sqlite::SqlitePoolOptions;
use std::path::Path;

use crate::config::{DatabaseFileConfig, MessengerConfig};
use crate::db::Database;

/// Create a fresh ChatRepository backed by an in-memory SQLite database.
/// Each call returns an isolated database with all migrations applied.
pub async fn test_repository() -> super::ChatRepository {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("Failed to create in-memory SQLite pool");

    crate::db::run_migrations(&pool)
        .await
        .expect("Failed to run migrations");

    sqlx::query("PRAGMA foreign_keys = ON")
        .execute(&pool)
        .await
        .expect("Failed to enable foreign keys");

    super::ChatRepository::new(pool)
}

/// Insert a message directly, bypassing participant checks. Returns its id.
pub async fn insert_message(repo: &super::ChatRepository, chat_id: i64, sender: i64) -> i64 {
    sqlx::query("INSERT INTO messages (chat_id, sender_user_id, text) VALUES (?, ?, 'seed')")
        .bind(chat_id)
        .bind(sender)
        .execute(&repo.pool)
        .await
        .expect("Failed to insert message")
        .last_insert_rowid()
}

/// ChatRepository over a WAL database file in `dir`, opened with the same pool
/// settings as the server, so callers really do run on separate connections.
pub async fn file_repository(dir: &Path) -> super::ChatRepository {
    let config = MessengerConfig::new(Some(dir.to_path_buf())).expect("config");
    let db = Database::new(&config, &DatabaseFileConfig::default())
        .await
        .expect("Failed to open file database");
    super::ChatRepository::new(db.pool.clone())
}

/// Insert an upload that is already confirmed, owned by `owner`.
pub async fn ready_upload(repo: &super::ChatRepository, file_id: &str, owner: i64) {
    sqlx::query(
        r#"
        INSERT INTO uploads (file_id, owner_user_id, client_content_type, original_filename,
                             content_type, size, width, height, status)
        VALUES (?, ?, 'image/png', 'photo.png', 'image/png', 1024, 640, 480, 'ready')
        "#,
    )
    .bind(file_id)
    .bind(owner)
    .execute(&repo.pool)
    .await
    .expect("Failed to insert upload");
}
