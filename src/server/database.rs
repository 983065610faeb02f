use log::info;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};

#[derive(Debug, Clone)]
pub struct Database {
    pub pool: SqlitePool,
}

impl Database {
    pub async fn connect(database_url: &str) -> Result<Self, sqlx::Error> {
        // Extract the file path from the URL so the parent directory can be
        // created before SQLite tries to open the file.
        let file_path = if let Some(rest) = database_url.strip_prefix("sqlite://") {
            rest.split('?').next().unwrap_or(rest)
        } else if let Some(rest) = database_url.strip_prefix("sqlite:") {
            rest.split('?').next().unwrap_or(rest)
        } else {
            database_url
        };

        if file_path != ":memory:" {
            if let Some(parent) = std::path::Path::new(file_path).parent() {
                if !parent.as_os_str().is_empty() && !parent.exists() {
                    std::fs::create_dir_all(parent)
                        .map_err(|e| sqlx::Error::Configuration(Box::new(e)))?;
                    info!("[DB] Created data directory {:?}", parent);
                }
            }
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;

        info!("[DB] Connected to {}", database_url);
        Ok(Self { pool })
    }

    /// In-memory database for tests. A single pooled connection keeps every
    /// query on the same SQLite memory instance.
    pub async fn connect_in_memory() -> Result<Self, sqlx::Error> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), sqlx::Error> {
        // Users known to the realtime core: display name for message fan-out
        // and the online flag maintained by the socket layer.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                display_name TEXT NOT NULL,
                is_online INTEGER NOT NULL DEFAULT 0
            );
        "#,
        )
        .execute(&self.pool)
        .await?;

        // Sessions issued by the platform backend; the core only validates.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sessions (
                session_token TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL
            );
        "#,
        )
        .execute(&self.pool)
        .await?;

        // Conversation summaries, one row per direct pair or squad.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS conversations (
                conversation_key TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                last_message TEXT,
                last_sender_id TEXT,
                last_message_at INTEGER
            );
        "#,
        )
        .execute(&self.pool)
        .await?;

        // Per-participant unread counters and soft-clear watermarks.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS conversation_members (
                conversation_key TEXT NOT NULL,
                user_id TEXT NOT NULL,
                unread_count INTEGER NOT NULL DEFAULT 0,
                cleared_at INTEGER,
                PRIMARY KEY (conversation_key, user_id)
            );
        "#,
        )
        .execute(&self.pool)
        .await?;

        // Durable message log. The id is the live-channel message id, so a
        // retried indexing write lands on the same row instead of a duplicate.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                conversation_key TEXT NOT NULL,
                sender_id TEXT NOT NULL,
                content TEXT NOT NULL,
                seq INTEGER NOT NULL,
                sent_at INTEGER NOT NULL
            );
        "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_messages_conversation ON messages (conversation_key, seq);",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
