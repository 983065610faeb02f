use crate::common::error::RealtimeError;
use crate::server::database::Database;
use log::{info, warn};
use sqlx::Row;

/// Validate a session token and return the owning user id. Sessions are
/// issued by the platform backend; this layer only checks existence and
/// expiry, the way the socket handshake expects.
pub async fn validate_token(db: &Database, token: &str) -> Result<String, RealtimeError> {
    if token.is_empty() {
        return Err(RealtimeError::AuthenticationFailure("empty token".into()));
    }
    let now = chrono::Utc::now().timestamp();
    let row = sqlx::query("SELECT user_id FROM sessions WHERE session_token = ? AND expires_at > ?")
        .bind(token)
        .bind(now)
        .fetch_optional(&db.pool)
        .await?;

    match row {
        Some(row) => Ok(row.get::<String, _>("user_id")),
        None => {
            warn!("[AUTH] Token rejected (not found or expired)");
            Err(RealtimeError::AuthenticationFailure(
                "invalid or expired session token".into(),
            ))
        }
    }
}

/// Display name for a user, falling back to the raw id when the realtime
/// core has not seen the user yet.
pub async fn display_name(db: &Database, user_id: &str) -> String {
    let row = sqlx::query("SELECT display_name FROM users WHERE id = ?")
        .bind(user_id)
        .fetch_optional(&db.pool)
        .await;
    match row {
        Ok(Some(row)) => row.get::<String, _>("display_name"),
        _ => user_id.to_string(),
    }
}

/// Register a user and issue a session token. Used by the probe binary and
/// tests; in production the backend writes these rows itself.
pub async fn create_session(
    db: &Database,
    user_id: &str,
    display_name: &str,
    ttl_secs: i64,
) -> Result<String, RealtimeError> {
    let now = chrono::Utc::now().timestamp();
    sqlx::query("INSERT OR REPLACE INTO users (id, display_name, is_online) VALUES (?, ?, 0)")
        .bind(user_id)
        .bind(display_name)
        .execute(&db.pool)
        .await?;

    let token = uuid::Uuid::new_v4().to_string();
    sqlx::query(
        "INSERT INTO sessions (session_token, user_id, created_at, expires_at) VALUES (?, ?, ?, ?)",
    )
    .bind(&token)
    .bind(user_id)
    .bind(now)
    .bind(now + ttl_secs)
    .execute(&db.pool)
    .await?;

    info!("[AUTH] Issued session for user {}", user_id);
    Ok(token)
}
