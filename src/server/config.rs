use std::env;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    pub max_message_length: usize,
    pub preview_length: usize,
    pub auth_timeout_secs: u64,
    pub session_expiry_days: u32,
    pub reconcile_interval_secs: u64,
}

impl ServerConfig {
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        Self {
            host: env::var("SERVER_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
            port: env::var("SERVER_PORT").ok().and_then(|p| p.parse().ok()).unwrap_or(5001),
            database_url: env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite:data/fretline.db".to_string()),
            max_message_length: env::var("MAX_MESSAGE_LENGTH").ok().and_then(|v| v.parse().ok()).unwrap_or(1000),
            preview_length: env::var("PREVIEW_LENGTH").ok().and_then(|v| v.parse().ok()).unwrap_or(50),
            auth_timeout_secs: env::var("AUTH_TIMEOUT_SECS").ok().and_then(|v| v.parse().ok()).unwrap_or(30),
            session_expiry_days: env::var("SESSION_EXPIRY_DAYS").ok().and_then(|v| v.parse().ok()).unwrap_or(7),
            reconcile_interval_secs: env::var("RECONCILE_INTERVAL_SECS").ok().and_then(|v| v.parse().ok()).unwrap_or(300),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5001,
            database_url: "sqlite:data/fretline.db".to_string(),
            max_message_length: 1000,
            preview_length: 50,
            auth_timeout_secs: 30,
            session_expiry_days: 7,
            reconcile_interval_secs: 300,
        }
    }
}
