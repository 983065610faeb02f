use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub http_port: u16,
    pub ws_port: u16,
    pub database_url: String,
    /// When unset the live channel runs in-process only (single instance).
    pub redis_url: Option<String>,
    /// Base URL the generic /api/* proxy forwards to.
    pub backend_base_url: String,
    pub max_message_length: usize,
    pub ring_timeout: Duration,
    pub index_retry_attempts: u32,
    pub index_retry_base_delay: Duration,
    pub auth_handshake_timeout: Duration,
    pub log_level: String,
}

impl ServerConfig {
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        Self {
            host: env::var("SERVER_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
            http_port: env::var("HTTP_PORT").ok().and_then(|p| p.parse().ok()).unwrap_or(5000),
            ws_port: env::var("WS_PORT").ok().and_then(|p| p.parse().ok()).unwrap_or(5001),
            database_url: env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite:data/squadup_realtime.db".to_string()),
            redis_url: env::var("REDIS_URL").ok(),
            backend_base_url: env::var("BACKEND_BASE_URL")
                .unwrap_or_else(|_| "http://127.0.0.1:8000".to_string()),
            max_message_length: env::var("MAX_MESSAGE_LENGTH")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(2048),
            ring_timeout: Duration::from_secs(
                env::var("RING_TIMEOUT_SECS").ok().and_then(|v| v.parse().ok()).unwrap_or(30),
            ),
            index_retry_attempts: env::var("INDEX_RETRY_ATTEMPTS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(5),
            index_retry_base_delay: Duration::from_millis(
                env::var("INDEX_RETRY_BASE_MS").ok().and_then(|v| v.parse().ok()).unwrap_or(200),
            ),
            auth_handshake_timeout: Duration::from_secs(
                env::var("AUTH_HANDSHAKE_TIMEOUT_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(30),
            ),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub ws_url: String,
    pub http_base_url: String,
}

impl ClientConfig {
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        Self {
            ws_url: env::var("SQUADUP_WS_URL").unwrap_or_else(|_| "ws://127.0.0.1:5001".to_string()),
            http_base_url: env::var("SQUADUP_HTTP_URL")
                .unwrap_or_else(|_| "http://127.0.0.1:5000".to_string()),
        }
    }
}
