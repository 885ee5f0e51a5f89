use serde::{Deserialize, Serialize};

/// Inbound events, one variant per wire event name. Unknown or malformed
/// frames never reach the dispatcher; they are answered with an `error`
/// event on the originating connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientEvent {
    /// In-band handshake frame; only valid as the first frame of a connection.
    #[serde(rename_all = "camelCase")]
    Auth { token: String },
    JoinChats,
    #[serde(rename_all = "camelCase")]
    JoinChat { request_id: String },
    #[serde(rename_all = "camelCase")]
    SendMessage { request_id: String, content: String },
    #[serde(rename_all = "camelCase")]
    MarkAsRead { chat_id: String },
    #[serde(rename_all = "camelCase")]
    Typing { chat_id: String },
    #[serde(rename_all = "camelCase")]
    StopTyping { chat_id: String },
}

/// Outbound events fanned to rooms or sent to a single connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    #[serde(rename_all = "camelCase")]
    AuthResponse {
        success: bool,
        user_id: Option<String>,
        error: Option<String>,
    },
    ChatsJoined { count: usize },
    #[serde(rename_all = "camelCase")]
    ChatJoined { chat_id: String },
    #[serde(rename_all = "camelCase")]
    NewMessage { chat_id: String, message: ChatMessage },
    #[serde(rename_all = "camelCase")]
    MessageNotification {
        chat_id: String,
        request_id: String,
        sender: SenderInfo,
        preview: String,
    },
    NewRequest { request: RequestSummary },
    #[serde(rename_all = "camelCase")]
    MessagesMarkedRead { chat_id: String },
    #[serde(rename_all = "camelCase")]
    UserTyping { user_id: String, user_name: String },
    #[serde(rename_all = "camelCase")]
    UserStopTyping { user_id: String },
    Error { message: String },
}

impl ServerEvent {
    pub fn error(message: impl Into<String>) -> Self {
        ServerEvent::Error { message: message.into() }
    }
}

/// A stored message with the sender's display fields already resolved.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: i64,
    pub sender: SenderInfo,
    pub content: String,
    /// Milliseconds since the epoch, set at append time.
    pub timestamp: i64,
    pub read: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SenderInfo {
    pub id: String,
    pub name: String,
    pub avatar: Option<String>,
}

/// What the trip owner sees in a `new_request` notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestSummary {
    pub id: String,
    pub sender: SenderInfo,
    pub departure: String,
    pub destination: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_events_use_wire_names() {
        let ev: ClientEvent = serde_json::from_str(r#"{"event":"join_chats"}"#).unwrap();
        assert!(matches!(ev, ClientEvent::JoinChats));

        let ev: ClientEvent =
            serde_json::from_str(r#"{"event":"send_message","data":{"requestId":"r1","content":"salut"}}"#)
                .unwrap();
        match ev {
            ClientEvent::SendMessage { request_id, content } => {
                assert_eq!(request_id, "r1");
                assert_eq!(content, "salut");
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn unknown_event_fails_to_parse() {
        assert!(serde_json::from_str::<ClientEvent>(r#"{"event":"drop_tables"}"#).is_err());
    }

    #[test]
    fn server_events_serialize_with_snake_case_tags() {
        let json = serde_json::to_string(&ServerEvent::ChatsJoined { count: 3 }).unwrap();
        assert_eq!(json, r#"{"event":"chats_joined","data":{"count":3}}"#);

        let json = serde_json::to_string(&ServerEvent::UserStopTyping {
            user_id: "u1".into(),
        })
        .unwrap();
        assert_eq!(json, r#"{"event":"user_stop_typing","data":{"userId":"u1"}}"#);
    }
}
