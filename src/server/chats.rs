use crate::server::database::Database;
use crate::server::protocol::{ChatMessage, SenderInfo};
use log::{debug, error};
use sqlx::Row;
use thiserror::Error;
use uuid::Uuid;

/// Per-operation chat failures. Everything except `Storage` maps directly
/// to an `error` event on the offending connection.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("message cannot be empty")]
    EmptyMessage,
    #[error("message too long")]
    MessageTooLong,
    #[error("chat not found or access denied")]
    NotFound,
    #[error("chat is closed")]
    Closed,
    #[error("a chat already exists for this request")]
    AlreadyProvisioned,
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),
}

impl ChatError {
    /// Wording sent to the client. Storage failures are logged server-side
    /// and reported as a generic operation failure.
    pub fn user_message(&self) -> String {
        match self {
            ChatError::Storage(e) => {
                error!("[CHAT] storage error: {}", e);
                "operation failed".to_string()
            }
            other => other.to_string(),
        }
    }
}

/// A chat channel bound 1:1 to a transport request. Participants are fixed
/// at creation: the request sender and the trip's driver.
#[derive(Debug, Clone)]
pub struct ChatChannel {
    pub id: String,
    pub request_id: String,
    pub participant_a: String,
    pub participant_b: String,
    pub last_activity_at: i64,
    pub is_active: bool,
}

impl ChatChannel {
    pub fn is_participant(&self, user_id: &str) -> bool {
        self.participant_a == user_id || self.participant_b == user_id
    }

    pub fn other_participant(&self, user_id: &str) -> &str {
        if self.participant_a == user_id {
            &self.participant_b
        } else {
            &self.participant_a
        }
    }
}

#[derive(Clone)]
pub struct ChatStore {
    db: Database,
}

impl ChatStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Create the channel for a request. The UNIQUE constraint on
    /// `request_id` is the only authority on "at most one chat per request";
    /// a concurrent duplicate attempt surfaces as `AlreadyProvisioned`.
    pub async fn create(
        &self,
        request_id: &str,
        participant_a: &str,
        participant_b: &str,
    ) -> Result<ChatChannel, ChatError> {
        let id = Uuid::new_v4().to_string();
        let now = chrono::Utc::now().timestamp_millis();
        let res = sqlx::query(
            "INSERT INTO chats (id, request_id, participant_a, participant_b, last_activity_at, is_active, created_at) \
             VALUES (?, ?, ?, ?, ?, 1, ?)",
        )
        .bind(&id)
        .bind(request_id)
        .bind(participant_a)
        .bind(participant_b)
        .bind(now)
        .bind(now)
        .execute(&self.db.pool)
        .await;

        match res {
            Ok(_) => {
                debug!("[CHAT] created chat {} for request {}", id, request_id);
                Ok(ChatChannel {
                    id,
                    request_id: request_id.to_string(),
                    participant_a: participant_a.to_string(),
                    participant_b: participant_b.to_string(),
                    last_activity_at: now,
                    is_active: true,
                })
            }
            Err(e) => {
                if e.to_string().to_uppercase().contains("UNIQUE") {
                    Err(ChatError::AlreadyProvisioned)
                } else {
                    Err(e.into())
                }
            }
        }
    }

    /// Clients address chats by the request they belong to. Non-participants
    /// get `NotFound`; the lookup never reveals whether the chat exists.
    pub async fn find_by_request(
        &self,
        request_id: &str,
        user_id: &str,
    ) -> Result<ChatChannel, ChatError> {
        let row = sqlx::query(
            "SELECT id, request_id, participant_a, participant_b, last_activity_at, is_active \
             FROM chats WHERE request_id = ? AND (participant_a = ? OR participant_b = ?)",
        )
        .bind(request_id)
        .bind(user_id)
        .bind(user_id)
        .fetch_optional(&self.db.pool)
        .await?;
        row.map(channel_from_row).ok_or(ChatError::NotFound)
    }

    pub async fn find_by_id(&self, chat_id: &str, user_id: &str) -> Result<ChatChannel, ChatError> {
        let row = sqlx::query(
            "SELECT id, request_id, participant_a, participant_b, last_activity_at, is_active \
             FROM chats WHERE id = ? AND (participant_a = ? OR participant_b = ?)",
        )
        .bind(chat_id)
        .bind(user_id)
        .bind(user_id)
        .fetch_optional(&self.db.pool)
        .await?;
        row.map(channel_from_row).ok_or(ChatError::NotFound)
    }

    /// Every active channel the user participates in, for `join_chats`.
    pub async fn chats_for_user(&self, user_id: &str) -> Result<Vec<ChatChannel>, ChatError> {
        let rows = sqlx::query(
            "SELECT id, request_id, participant_a, participant_b, last_activity_at, is_active \
             FROM chats WHERE is_active = 1 AND (participant_a = ? OR participant_b = ?) \
             ORDER BY last_activity_at DESC",
        )
        .bind(user_id)
        .bind(user_id)
        .fetch_all(&self.db.pool)
        .await?;
        Ok(rows.into_iter().map(channel_from_row).collect())
    }

    /// Append one message and bump `last_activity_at`. Content is expected
    /// to be validated and trimmed by the pipeline already. The sender's
    /// display fields are resolved with an explicit extra read before the
    /// message is handed back for fan-out.
    pub async fn append_message(
        &self,
        chat: &ChatChannel,
        sender_id: &str,
        content: &str,
    ) -> Result<ChatMessage, ChatError> {
        if !chat.is_active {
            return Err(ChatError::Closed);
        }
        let sent_at = chrono::Utc::now().timestamp_millis();
        let res = sqlx::query(
            "INSERT INTO chat_messages (chat_id, sender_id, content, sent_at, read) VALUES (?, ?, ?, ?, 0)",
        )
        .bind(&chat.id)
        .bind(sender_id)
        .bind(content)
        .bind(sent_at)
        .execute(&self.db.pool)
        .await?;
        let message_id = res.last_insert_rowid();

        sqlx::query("UPDATE chats SET last_activity_at = ? WHERE id = ?")
            .bind(sent_at)
            .bind(&chat.id)
            .execute(&self.db.pool)
            .await?;

        let sender = self.sender_info(sender_id).await?;
        Ok(ChatMessage {
            id: message_id,
            sender,
            content: content.to_string(),
            timestamp: sent_at,
            read: false,
        })
    }

    /// Bulk conditional read-update: flip every unread message authored by
    /// the *other* participant. The filter runs inside the UPDATE, so a
    /// concurrent send landing after it is never incorrectly marked read.
    pub async fn mark_read(&self, chat_id: &str, reader_id: &str) -> Result<u64, ChatError> {
        let res = sqlx::query(
            "UPDATE chat_messages SET read = 1 WHERE chat_id = ? AND sender_id <> ? AND read = 0",
        )
        .bind(chat_id)
        .bind(reader_id)
        .execute(&self.db.pool)
        .await?;
        Ok(res.rows_affected())
    }

    /// Full ordered message log, append order, sender display fields joined.
    pub async fn messages(&self, chat_id: &str) -> Result<Vec<ChatMessage>, ChatError> {
        let rows = sqlx::query(
            "SELECT m.id, m.sender_id, m.content, m.sent_at, m.read, u.first_name, u.last_name, u.avatar \
             FROM chat_messages m LEFT JOIN users u ON u.id = m.sender_id \
             WHERE m.chat_id = ? ORDER BY m.id ASC",
        )
        .bind(chat_id)
        .fetch_all(&self.db.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| {
                let sender_id: String = row.get("sender_id");
                let first: Option<String> = row.get("first_name");
                let last: Option<String> = row.get("last_name");
                let name = match (first, last) {
                    (Some(f), Some(l)) => format!("{} {}", f, l),
                    _ => sender_id.clone(),
                };
                ChatMessage {
                    id: row.get("id"),
                    sender: SenderInfo {
                        id: sender_id,
                        name,
                        avatar: row.get("avatar"),
                    },
                    content: row.get("content"),
                    timestamp: row.get("sent_at"),
                    read: row.get::<i64, _>("read") != 0,
                }
            })
            .collect())
    }

    /// Soft-close: the channel stops accepting messages but stays readable.
    pub async fn close(&self, chat_id: &str) -> Result<(), ChatError> {
        sqlx::query("UPDATE chats SET is_active = 0 WHERE id = ?")
            .bind(chat_id)
            .execute(&self.db.pool)
            .await?;
        Ok(())
    }

    async fn sender_info(&self, user_id: &str) -> Result<SenderInfo, ChatError> {
        let row = sqlx::query("SELECT first_name, last_name, avatar FROM users WHERE id = ?")
            .bind(user_id)
            .fetch_optional(&self.db.pool)
            .await?;
        Ok(match row {
            Some(row) => {
                let first: String = row.get("first_name");
                let last: String = row.get("last_name");
                SenderInfo {
                    id: user_id.to_string(),
                    name: format!("{} {}", first, last),
                    avatar: row.get("avatar"),
                }
            }
            None => SenderInfo {
                id: user_id.to_string(),
                name: user_id.to_string(),
                avatar: None,
            },
        })
    }
}

fn channel_from_row(row: sqlx::sqlite::SqliteRow) -> ChatChannel {
    ChatChannel {
        id: row.get("id"),
        request_id: row.get("request_id"),
        participant_a: row.get("participant_a"),
        participant_b: row.get("participant_b"),
        last_activity_at: row.get("last_activity_at"),
        is_active: row.get::<i64, _>("is_active") != 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn test_store() -> ChatStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let db = Database { pool };
        db.migrate().await.unwrap();
        for (id, first, last) in [("shipper", "Sophie", "Martin"), ("driver", "David", "Bernard")] {
            sqlx::query("INSERT INTO users (id, first_name, last_name, avatar, is_active) VALUES (?, ?, ?, NULL, 1)")
                .bind(id)
                .bind(first)
                .bind(last)
                .execute(&db.pool)
                .await
                .unwrap();
        }
        ChatStore::new(db)
    }

    #[tokio::test]
    async fn one_chat_per_request() {
        let store = test_store().await;
        store.create("r1", "shipper", "driver").await.unwrap();
        assert!(matches!(
            store.create("r1", "shipper", "driver").await,
            Err(ChatError::AlreadyProvisioned)
        ));
        // distinct requests from the same pair each get their own channel
        let second = store.create("r2", "shipper", "driver").await.unwrap();
        assert_eq!(second.request_id, "r2");
    }

    #[tokio::test]
    async fn lookup_is_participant_scoped() {
        let store = test_store().await;
        let chat = store.create("r1", "shipper", "driver").await.unwrap();

        assert!(store.find_by_request("r1", "driver").await.is_ok());
        assert!(matches!(
            store.find_by_request("r1", "intruder").await,
            Err(ChatError::NotFound)
        ));
        assert!(matches!(
            store.find_by_id(&chat.id, "intruder").await,
            Err(ChatError::NotFound)
        ));
    }

    #[tokio::test]
    async fn append_round_trip() {
        let store = test_store().await;
        let chat = store.create("r1", "shipper", "driver").await.unwrap();

        let message = store
            .append_message(&chat, "shipper", "Bonjour, je confirme le colis")
            .await
            .unwrap();
        assert_eq!(message.sender.id, "shipper");
        assert_eq!(message.sender.name, "Sophie Martin");
        assert!(!message.read);

        let log = store.messages(&chat.id).await.unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].id, message.id);
        assert_eq!(log[0].content, "Bonjour, je confirme le colis");
        assert!(!log[0].read);

        let refreshed = store.find_by_id(&chat.id, "shipper").await.unwrap();
        assert_eq!(refreshed.last_activity_at, message.timestamp);
    }

    #[tokio::test]
    async fn messages_keep_append_order() {
        let store = test_store().await;
        let chat = store.create("r1", "shipper", "driver").await.unwrap();
        for content in ["un", "deux", "trois"] {
            store.append_message(&chat, "shipper", content).await.unwrap();
        }
        let log = store.messages(&chat.id).await.unwrap();
        let contents: Vec<&str> = log.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, ["un", "deux", "trois"]);
    }

    #[tokio::test]
    async fn mark_read_only_flips_peer_messages() {
        let store = test_store().await;
        let chat = store.create("r1", "shipper", "driver").await.unwrap();
        store.append_message(&chat, "shipper", "colis prêt").await.unwrap();
        store.append_message(&chat, "driver", "je pars à 8h").await.unwrap();

        let flipped = store.mark_read(&chat.id, "driver").await.unwrap();
        assert_eq!(flipped, 1);

        let log = store.messages(&chat.id).await.unwrap();
        assert!(log[0].read); // shipper's message, read by the driver
        assert!(!log[1].read); // driver's own message untouched

        // a message appended afterwards starts unread again
        store.append_message(&chat, "shipper", "parfait").await.unwrap();
        let log = store.messages(&chat.id).await.unwrap();
        assert!(!log[2].read);
    }

    #[tokio::test]
    async fn mark_read_is_idempotent() {
        let store = test_store().await;
        let chat = store.create("r1", "shipper", "driver").await.unwrap();
        store.append_message(&chat, "shipper", "colis prêt").await.unwrap();

        assert_eq!(store.mark_read(&chat.id, "driver").await.unwrap(), 1);
        assert_eq!(store.mark_read(&chat.id, "driver").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn closed_chat_rejects_messages_but_stays_readable() {
        let store = test_store().await;
        let chat = store.create("r1", "shipper", "driver").await.unwrap();
        store.append_message(&chat, "shipper", "dernier message").await.unwrap();
        store.close(&chat.id).await.unwrap();

        let closed = store.find_by_id(&chat.id, "shipper").await.unwrap();
        assert!(matches!(
            store.append_message(&closed, "shipper", "trop tard").await,
            Err(ChatError::Closed)
        ));
        assert_eq!(store.messages(&chat.id).await.unwrap().len(), 1);
        // closed chats also stop showing up in join_chats
        assert!(store.chats_for_user("shipper").await.unwrap().is_empty());
    }
}
