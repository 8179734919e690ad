use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous};
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

use crate::config::{DatabaseFileConfig, MessengerConfig};

#[derive(Clone)]
pub struct Database {
    pub pool: SqlitePool,
}

impl Database {
    pub async fn new(config: &MessengerConfig, database: &DatabaseFileConfig) -> Result<Self> {
        let url = config.db_url(database);
        info!("Connecting to database: {}", url);

        // Per-connection pragmas, so every pooled connection enforces them
        let options = SqliteConnectOptions::from_str(&url)
            .with_context(|| format!("Invalid database url: {}", url))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_millis(5000))
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(database.max_connections.max(1))
            .min_connections(1)
            .connect_with(options)
            .await
            .with_context(|| format!("Failed to connect to database: {}", url))?;

        info!("Running database migrations...");
        self::run_migrations(&pool).await?;

        info!("Database initialized");

        Ok(Self { pool })
    }

    /// Cheap liveness probe used by readiness checks.
    pub async fn ping(&self) -> bool {
        sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
    }
}

/// Current schema version - increment when adding migrations
const SCHEMA_VERSION: i64 = 2;

pub(crate) async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL DEFAULT (unixepoch()),
            description TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    let current_version: i64 =
        sqlx::query_scalar("SELECT COALESCE(MAX(version), 0) FROM schema_version")
            .fetch_one(pool)
            .await
            .unwrap_or(0);

    if current_version > SCHEMA_VERSION {
        anyhow::bail!(
            "Database schema version {} is newer than supported version {}. Please upgrade the application.",
            current_version,
            SCHEMA_VERSION
        );
    }

    if current_version == SCHEMA_VERSION {
        info!(
            "Database schema is up to date (version {})",
            current_version
        );
        return Ok(());
    }

    info!(
        "Migrating database from version {} to {}",
        current_version, SCHEMA_VERSION
    );

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS users (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL DEFAULT '',
            created_at INTEGER NOT NULL DEFAULT (unixepoch())
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chats (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            created_at INTEGER NOT NULL DEFAULT (unixepoch())
        )
        "#,
    )
    .execute(pool)
    .await?;

    // last_read_message_id stays NULL until the participant first reads
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chat_participants (
            chat_id INTEGER NOT NULL REFERENCES chats(id) ON DELETE CASCADE,
            user_id INTEGER NOT NULL,
            last_read_message_id INTEGER,
            joined_at INTEGER NOT NULL DEFAULT (unixepoch()),
            PRIMARY KEY (chat_id, user_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_participants_user ON chat_participants(user_id)")
        .execute(pool)
        .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS messages (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            chat_id INTEGER NOT NULL REFERENCES chats(id) ON DELETE CASCADE,
            sender_user_id INTEGER NOT NULL,
            text TEXT NOT NULL DEFAULT '',
            reply_to_message_id INTEGER REFERENCES messages(id) ON DELETE SET NULL,
            created_at INTEGER NOT NULL DEFAULT (unixepoch())
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_messages_chat_id ON messages(chat_id, id DESC)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_messages_chat_sender ON messages(chat_id, sender_user_id, id)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS attachments (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            message_id INTEGER NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
            file_id TEXT NOT NULL,
            content_type TEXT NOT NULL DEFAULT 'application/octet-stream',
            filename TEXT,
            size INTEGER,
            width INTEGER,
            height INTEGER
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_attachments_message ON attachments(message_id)")
        .execute(pool)
        .await?;

    // Object keys handed out for upload. content_type/size stay NULL until
    // the object is verified on confirm.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS uploads (
            file_id TEXT PRIMARY KEY,
            owner_user_id INTEGER NOT NULL,
            client_content_type TEXT NOT NULL,
            original_filename TEXT,
            content_type TEXT,
            size INTEGER,
            width INTEGER,
            height INTEGER,
            status TEXT NOT NULL DEFAULT 'presigned',
            created_at INTEGER NOT NULL DEFAULT (unixepoch()),
            confirmed_at INTEGER
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_uploads_owner ON uploads(owner_user_id)")
        .execute(pool)
        .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_attachments_file ON attachments(file_id)")
        .execute(pool)
        .await?;

    sqlx::query("INSERT OR REPLACE INTO schema_version (version, description) VALUES (?, ?)")
        .bind(SCHEMA_VERSION)
        .bind("Uploads: presigned object keys and confirmed metadata")
        .execute(pool)
        .await?;
    info!("Schema upgraded to version {}", SCHEMA_VERSION);

    info!("Database migrations completed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        run_migrations(&pool).await.unwrap();
        sqlx::query("PRAGMA foreign_keys = ON")
            .execute(&pool)
            .await
            .unwrap();
        pool
    }

    #[tokio::test]
    async fn run_migrations_idempotent() {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();

        run_migrations(&pool).await.unwrap();
        run_migrations(&pool).await.unwrap();
    }

    #[tokio::test]
    async fn file_database_enforces_foreign_keys_on_every_connection() {
        let tmp = tempfile::tempdir().unwrap();
        let config = MessengerConfig::new(Some(tmp.path().to_path_buf())).unwrap();
        let db = Database::new(&config, &DatabaseFileConfig::default())
            .await
            .unwrap();
        assert!(config.db_path.exists());
        assert!(db.ping().await);

        let mut conns = Vec::new();
        for _ in 0..3 {
            let mut conn = db.pool.acquire().await.unwrap();
            let on: i64 = sqlx::query_scalar("PRAGMA foreign_keys")
                .fetch_one(&mut *conn)
                .await
                .unwrap();
            assert_eq!(on, 1);
            conns.push(conn);
        }
    }

    #[tokio::test]
    async fn schema_version_recorded() {
        let pool = test_pool().await;
        let version: i64 =
            sqlx::query_scalar("SELECT COALESCE(MAX(version), 0) FROM schema_version")
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }

    #[tokio::test]
    async fn newer_schema_is_rejected() {
        let pool = test_pool().await;
        sqlx::query("INSERT INTO schema_version (version, description) VALUES (?, 'future')")
            .bind(SCHEMA_VERSION + 1)
            .execute(&pool)
            .await
            .unwrap();
        assert!(run_migrations(&pool).await.is_err());
    }

    #[tokio::test]
    async fn deleting_chat_cascades() {
        let pool = test_pool().await;
        sqlx::query("INSERT INTO chats (id) VALUES (1)")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("INSERT INTO chat_participants (chat_id, user_id) VALUES (1, 10)")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("INSERT INTO messages (chat_id, sender_user_id, text) VALUES (1, 10, 'hi')")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("INSERT INTO attachments (message_id, file_id) VALUES (1, 'f1')")
            .execute(&pool)
            .await
            .unwrap();

        sqlx::query("DELETE FROM chats WHERE id = 1")
            .execute(&pool)
            .await
            .unwrap();

        for table in ["chat_participants", "messages", "attachments"] {
            let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table}"))
                .fetch_one(&pool)
                .await
                .unwrap();
            assert_eq!(count, 0, "{table} should be empty");
        }
    }

    #[tokio::test]
    async fn deleting_reply_target_nulls_reference() {
        let pool = test_pool().await;
        sqlx::query("INSERT INTO chats (id) VALUES (1)")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("INSERT INTO messages (id, chat_id, sender_user_id) VALUES (1, 1, 10)")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query(
            "INSERT INTO messages (id, chat_id, sender_user_id, reply_to_message_id) VALUES (2, 1, 20, 1)",
        )
        .execute(&pool)
        .await
        .unwrap();

        sqlx::query("DELETE FROM messages WHERE id = 1")
            .execute(&pool)
            .await
            .unwrap();

        let reply_to: Option<i64> =
            sqlx::query_scalar("SELECT reply_to_message_id FROM messages WHERE id = 2")
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(reply_to, None);
    }
}
