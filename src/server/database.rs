use log::{debug, info};
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};

#[derive(Debug, Clone)]
pub struct Database {
    pub pool: SqlitePool,
}

impl Database {
    pub async fn connect(database_url: &str) -> Result<Self, sqlx::Error> {
        info!("Connecting to database: {}", database_url);

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
                    debug!("Creating database directory {:?}", parent);
                    std::fs::create_dir_all(parent)
                        .map_err(|e| sqlx::Error::Configuration(Box::new(e)))?;
                }
            }
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;

        info!("Database connection established");
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), sqlx::Error> {
        // Users (owned by the account service; the gateway only reads them)
        sqlx::query(r#"
            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                first_name TEXT NOT NULL,
                last_name TEXT NOT NULL,
                avatar TEXT,
                is_active INTEGER NOT NULL DEFAULT 1
            );
        "#).execute(&self.pool).await?;

        // Sessions
        sqlx::query(r#"
            CREATE TABLE IF NOT EXISTS sessions (
                session_token TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL
            );
        "#).execute(&self.pool).await?;

        // Transport requests (created by the HTTP request workflow)
        sqlx::query(r#"
            CREATE TABLE IF NOT EXISTS transport_requests (
                id TEXT PRIMARY KEY,
                sender_id TEXT NOT NULL,
                driver_id TEXT NOT NULL,
                departure TEXT NOT NULL,
                destination TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );
        "#).execute(&self.pool).await?;

        // Chats: one per transport request, exactly two participants for life
        sqlx::query(r#"
            CREATE TABLE IF NOT EXISTS chats (
                id TEXT PRIMARY KEY,
                request_id TEXT NOT NULL UNIQUE,
                participant_a TEXT NOT NULL,
                participant_b TEXT NOT NULL,
                last_activity_at INTEGER NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 1,
                created_at INTEGER NOT NULL
            );
        "#).execute(&self.pool).await?;

        // Chat messages: append-only, ordered by insertion id
        sqlx::query(r#"
            CREATE TABLE IF NOT EXISTS chat_messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                chat_id TEXT NOT NULL,
                sender_id TEXT NOT NULL,
                content TEXT NOT NULL,
                sent_at INTEGER NOT NULL,
                read INTEGER NOT NULL DEFAULT 0
            );
        "#).execute(&self.pool).await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_chat_messages_chat ON chat_messages (chat_id);")
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}
