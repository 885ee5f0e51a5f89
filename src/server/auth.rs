use crate::server::database::Database;
use log::{debug, info, warn};
use rand::RngCore;
use sqlx::Row;
use thiserror::Error;

/// Connection-level authentication failures. Each variant carries the exact
/// wording reported to the client before the connection is dropped.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("credential missing")]
    MissingCredential,
    #[error("authentication failed")]
    AuthenticationFailed,
    #[error("user not authorized")]
    NotAuthorized,
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),
}

#[derive(Debug, Clone)]
pub struct AuthenticatedUser {
    pub id: String,
    pub display_name: String,
    pub avatar: Option<String>,
}

/// Resolve a bearer token to a user identity, or reject the connection.
/// No channel state is touched here; the caller attaches the identity to
/// the connection session on success.
pub async fn authenticate_token(
    db: &Database,
    token: Option<&str>,
) -> Result<AuthenticatedUser, AuthError> {
    let token = match token {
        Some(t) if !t.trim().is_empty() => t,
        _ => return Err(AuthError::MissingCredential),
    };

    let now = chrono::Utc::now().timestamp();
    let session = sqlx::query("SELECT user_id FROM sessions WHERE session_token = ? AND expires_at > ?")
        .bind(token)
        .bind(now)
        .fetch_optional(&db.pool)
        .await?;

    let user_id: String = match session {
        Some(row) => row.get("user_id"),
        None => {
            debug!("[AUTH] token not found or expired");
            return Err(AuthError::AuthenticationFailed);
        }
    };

    let user = sqlx::query("SELECT first_name, last_name, avatar, is_active FROM users WHERE id = ?")
        .bind(&user_id)
        .fetch_optional(&db.pool)
        .await?;

    match user {
        Some(row) if row.get::<i64, _>("is_active") != 0 => {
            let first: String = row.get("first_name");
            let last: String = row.get("last_name");
            debug!("[AUTH] token valid for user {}", user_id);
            Ok(AuthenticatedUser {
                id: user_id,
                display_name: format!("{} {}", first, last),
                avatar: row.get("avatar"),
            })
        }
        _ => {
            warn!("[AUTH] session for {} points at a missing or inactive user", user_id);
            Err(AuthError::NotAuthorized)
        }
    }
}

/// Create a session token for a user. The HTTP login flow is an external
/// collaborator; this is the piece of it the gateway's tests and tooling need.
pub async fn issue_session(
    db: &Database,
    user_id: &str,
    expiry_days: u32,
) -> Result<String, sqlx::Error> {
    let mut random = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut random);
    let token = format!(
        "{}-{}",
        uuid::Uuid::new_v4(),
        random.iter().map(|b| format!("{:02x}", b)).collect::<String>()
    );

    let now = chrono::Utc::now().timestamp();
    let expires = now + 60 * 60 * 24 * expiry_days as i64;
    sqlx::query("INSERT INTO sessions (session_token, user_id, created_at, expires_at) VALUES (?, ?, ?, ?)")
        .bind(&token)
        .bind(user_id)
        .bind(now)
        .bind(expires)
        .execute(&db.pool)
        .await?;

    Ok(token)
}

/// Remove expired sessions. Idempotent, safe to run periodically.
pub async fn cleanup_expired_sessions(db: &Database) {
    let now = chrono::Utc::now().timestamp();
    match sqlx::query("DELETE FROM sessions WHERE expires_at <= ?")
        .bind(now)
        .execute(&db.pool)
        .await
    {
        Ok(res) if res.rows_affected() > 0 => {
            info!("[AUTH] cleaned up {} expired sessions", res.rows_affected())
        }
        Ok(_) => {}
        Err(e) => warn!("[AUTH] failed to clean up sessions: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn test_db() -> Database {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let db = Database { pool };
        db.migrate().await.unwrap();
        db
    }

    async fn insert_user(db: &Database, id: &str, first: &str, last: &str, active: bool) {
        sqlx::query("INSERT INTO users (id, first_name, last_name, avatar, is_active) VALUES (?, ?, ?, NULL, ?)")
            .bind(id)
            .bind(first)
            .bind(last)
            .bind(active as i64)
            .execute(&db.pool)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn missing_token_is_rejected() {
        let db = test_db().await;
        assert!(matches!(
            authenticate_token(&db, None).await,
            Err(AuthError::MissingCredential)
        ));
        assert!(matches!(
            authenticate_token(&db, Some("  ")).await,
            Err(AuthError::MissingCredential)
        ));
    }

    #[tokio::test]
    async fn unknown_token_fails_authentication() {
        let db = test_db().await;
        assert!(matches!(
            authenticate_token(&db, Some("no-such-token")).await,
            Err(AuthError::AuthenticationFailed)
        ));
    }

    #[tokio::test]
    async fn expired_token_fails_authentication() {
        let db = test_db().await;
        insert_user(&db, "u1", "Marie", "Dupont", true).await;
        sqlx::query("INSERT INTO sessions (session_token, user_id, created_at, expires_at) VALUES ('old', 'u1', 0, 1)")
            .execute(&db.pool)
            .await
            .unwrap();
        assert!(matches!(
            authenticate_token(&db, Some("old")).await,
            Err(AuthError::AuthenticationFailed)
        ));
    }

    #[tokio::test]
    async fn inactive_user_is_not_authorized() {
        let db = test_db().await;
        insert_user(&db, "u1", "Marie", "Dupont", false).await;
        let token = issue_session(&db, "u1", 7).await.unwrap();
        assert!(matches!(
            authenticate_token(&db, Some(&token)).await,
            Err(AuthError::NotAuthorized)
        ));
    }

    #[tokio::test]
    async fn valid_token_resolves_display_fields() {
        let db = test_db().await;
        insert_user(&db, "u1", "Marie", "Dupont", true).await;
        let token = issue_session(&db, "u1", 7).await.unwrap();
        let user = authenticate_token(&db, Some(&token)).await.unwrap();
        assert_eq!(user.id, "u1");
        assert_eq!(user.display_name, "Marie Dupont");
    }

    #[tokio::test]
    async fn cleanup_removes_only_expired_sessions() {
        let db = test_db().await;
        insert_user(&db, "u1", "Marie", "Dupont", true).await;
        let live = issue_session(&db, "u1", 7).await.unwrap();
        sqlx::query("INSERT INTO sessions (session_token, user_id, created_at, expires_at) VALUES ('dead', 'u1', 0, 1)")
            .execute(&db.pool)
            .await
            .unwrap();

        cleanup_expired_sessions(&db).await;

        assert!(authenticate_token(&db, Some(&live)).await.is_ok());
        let remaining: i64 = sqlx::query("SELECT COUNT(1) AS c FROM sessions")
            .fetch_one(&db.pool)
            .await
            .unwrap()
            .get("c");
        assert_eq!(remaining, 1);
    }
}
