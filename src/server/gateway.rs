use crate::server::auth::{self, AuthenticatedUser};
use crate::server::chats::{ChatError, ChatStore};
use crate::server::config::ServerConfig;
use crate::server::database::Database;
use crate::server::protocol::{ClientEvent, SenderInfo, ServerEvent};
use crate::server::rooms::{ConnId, RoomId, RoomRegistry};
use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use tokio::net::TcpStream;
use tokio_tungstenite::{tungstenite::Message, WebSocketStream};
use uuid::Uuid;

/// The WebSocket gateway: authenticates connections, owns the room
/// registry, and runs the message pipeline for every inbound event.
pub struct Gateway {
    db: Database,
    store: ChatStore,
    registry: RoomRegistry,
    config: ServerConfig,
}

impl Gateway {
    pub fn new(db: Database, registry: RoomRegistry, config: ServerConfig) -> Self {
        let store = ChatStore::new(db.clone());
        Self { db, store, registry, config }
    }

    pub fn registry(&self) -> &RoomRegistry {
        &self.registry
    }

    pub async fn handle_connection(&self, stream: TcpStream) -> anyhow::Result<()> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        self.run_session(ws_stream).await
    }

    /// Full connection lifecycle: in-band auth handshake, personal-room
    /// join, event loop, implicit room cleanup on disconnect.
    pub async fn run_session(&self, ws_stream: WebSocketStream<TcpStream>) -> anyhow::Result<()> {
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        // First frame must be the auth event, within the handshake timeout.
        let handshake = tokio::time::timeout(
            std::time::Duration::from_secs(self.config.auth_timeout_secs),
            ws_receiver.next(),
        )
        .await;

        let token = match handshake {
            Ok(Some(Ok(Message::Text(text)))) => {
                match serde_json::from_str::<ClientEvent>(&text) {
                    Ok(ClientEvent::Auth { token }) => Some(token),
                    Ok(_) | Err(_) => None,
                }
            }
            Ok(Some(Ok(Message::Close(_)))) | Ok(None) => {
                debug!("[GATEWAY] connection closed during handshake");
                return Ok(());
            }
            Ok(Some(Ok(_))) => None,
            Ok(Some(Err(e))) => return Err(e.into()),
            Err(_) => {
                let reply = auth_failure("authentication timeout");
                let _ = ws_sender.send(Message::Text(serde_json::to_string(&reply)?)).await;
                return Ok(());
            }
        };

        let user = match auth::authenticate_token(&self.db, token.as_deref()).await {
            Ok(user) => user,
            Err(e) => {
                warn!("[GATEWAY] authentication rejected: {}", e);
                let reply = auth_failure(&e.to_string());
                let _ = ws_sender.send(Message::Text(serde_json::to_string(&reply)?)).await;
                return Ok(());
            }
        };
        info!("[GATEWAY] user {} connected", user.display_name);

        let conn_id = Uuid::new_v4();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<ServerEvent>();
        self.registry.register(conn_id, tx).await;
        // Personal room for out-of-band notifications, joined automatically.
        self.registry.join(conn_id, RoomId::User(user.id.clone())).await;

        let ok = ServerEvent::AuthResponse {
            success: true,
            user_id: Some(user.id.clone()),
            error: None,
        };
        self.registry.send_to(conn_id, ok).await;

        // Writer task: serializes outbound events onto the socket.
        let send_task = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match serde_json::to_string(&event) {
                    Ok(json) => {
                        if ws_sender.send(Message::Text(json)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("[GATEWAY] failed to serialize event: {}", e),
                }
            }
        });

        while let Some(frame) = ws_receiver.next().await {
            match frame {
                Ok(Message::Text(text)) => self.dispatch(conn_id, &user, &text).await,
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(_) => break,
            }
        }

        // Dropping the registered sender ends the writer task.
        self.registry.remove_connection(conn_id).await;
        let _ = send_task.await;
        info!("[GATEWAY] user {} disconnected", user.display_name);
        Ok(())
    }

    /// Parse one frame and dispatch it. Per-operation failures are answered
    /// on the offending connection only and never tear the connection down.
    pub async fn dispatch(&self, conn_id: ConnId, user: &AuthenticatedUser, text: &str) {
        let event = match serde_json::from_str::<ClientEvent>(text) {
            Ok(event) => event,
            Err(e) => {
                debug!("[GATEWAY] unparseable frame from {}: {}", user.id, e);
                self.registry.send_to(conn_id, ServerEvent::error("unrecognized event")).await;
                return;
            }
        };

        let result = match event {
            // A second auth frame after the handshake carries nothing new.
            ClientEvent::Auth { .. } => Ok(()),
            ClientEvent::JoinChats => self.join_chats(conn_id, user).await,
            ClientEvent::JoinChat { request_id } => self.join_chat(conn_id, user, &request_id).await,
            ClientEvent::SendMessage { request_id, content } => {
                self.send_message(user, &request_id, &content).await
            }
            ClientEvent::MarkAsRead { chat_id } => self.mark_as_read(conn_id, user, &chat_id).await,
            ClientEvent::Typing { chat_id } => self.typing(conn_id, user, &chat_id, true).await,
            ClientEvent::StopTyping { chat_id } => self.typing(conn_id, user, &chat_id, false).await,
        };

        if let Err(e) = result {
            self.registry
                .send_to(conn_id, ServerEvent::Error { message: e.user_message() })
                .await;
        }
    }

    /// Join every active channel the user participates in. Idempotent:
    /// room membership is a set, so a second call changes nothing.
    async fn join_chats(&self, conn_id: ConnId, user: &AuthenticatedUser) -> Result<(), ChatError> {
        let chats = self.store.chats_for_user(&user.id).await?;
        let count = chats.len();
        for chat in chats {
            self.registry.join(conn_id, RoomId::Chat(chat.id)).await;
        }
        self.registry.send_to(conn_id, ServerEvent::ChatsJoined { count }).await;
        Ok(())
    }

    /// Join one channel, addressed by its request id, and mark the peer's
    /// pending messages as read before acknowledging.
    async fn join_chat(
        &self,
        conn_id: ConnId,
        user: &AuthenticatedUser,
        request_id: &str,
    ) -> Result<(), ChatError> {
        let chat = self.store.find_by_request(request_id, &user.id).await?;
        self.registry.join(conn_id, RoomId::Chat(chat.id.clone())).await;
        self.store.mark_read(&chat.id, &user.id).await?;
        self.registry
            .send_to(conn_id, ServerEvent::ChatJoined { chat_id: chat.id })
            .await;
        Ok(())
    }

    /// The message pipeline: validate, persist, fan out. Validation order
    /// matters; the first failure short-circuits back to the sender.
    async fn send_message(
        &self,
        user: &AuthenticatedUser,
        request_id: &str,
        content: &str,
    ) -> Result<(), ChatError> {
        let trimmed = content.trim();
        if trimmed.is_empty() {
            return Err(ChatError::EmptyMessage);
        }
        if trimmed.chars().count() > self.config.max_message_length {
            return Err(ChatError::MessageTooLong);
        }
        let chat = self.store.find_by_request(request_id, &user.id).await?;
        let message = self.store.append_message(&chat, &user.id, trimmed).await?;

        let fan_out = ServerEvent::NewMessage {
            chat_id: chat.id.clone(),
            message,
        };
        self.registry.broadcast(&RoomId::Chat(chat.id.clone()), &fan_out).await;

        // Lightweight preview to the peer's personal room, delivered whether
        // or not they have joined the chat room.
        let notification = ServerEvent::MessageNotification {
            chat_id: chat.id.clone(),
            request_id: chat.request_id.clone(),
            sender: SenderInfo {
                id: user.id.clone(),
                name: user.display_name.clone(),
                avatar: user.avatar.clone(),
            },
            preview: preview_of(trimmed, self.config.preview_length),
        };
        let peer = chat.other_participant(&user.id).to_string();
        self.registry.broadcast(&RoomId::User(peer), &notification).await;
        Ok(())
    }

    /// Bulk read-update, acknowledged to the requester only. No read-receipt
    /// fan-out to the author.
    async fn mark_as_read(
        &self,
        conn_id: ConnId,
        user: &AuthenticatedUser,
        chat_id: &str,
    ) -> Result<(), ChatError> {
        let chat = self.store.find_by_id(chat_id, &user.id).await?;
        self.store.mark_read(&chat.id, &user.id).await?;
        self.registry
            .send_to(conn_id, ServerEvent::MessagesMarkedRead { chat_id: chat.id })
            .await;
        Ok(())
    }

    /// Ephemeral relay, never persisted. A forged or stale chat id just
    /// broadcasts into a non-existent room.
    async fn typing(
        &self,
        conn_id: ConnId,
        user: &AuthenticatedUser,
        chat_id: &str,
        started: bool,
    ) -> Result<(), ChatError> {
        let event = if started {
            ServerEvent::UserTyping {
                user_id: user.id.clone(),
                user_name: user.display_name.clone(),
            }
        } else {
            ServerEvent::UserStopTyping { user_id: user.id.clone() }
        };
        self.registry
            .broadcast_except(&RoomId::Chat(chat_id.to_string()), conn_id, &event)
            .await;
        Ok(())
    }
}

fn auth_failure(message: &str) -> ServerEvent {
    ServerEvent::AuthResponse {
        success: false,
        user_id: None,
        error: Some(message.to_string()),
    }
}

fn preview_of(content: &str, limit: usize) -> String {
    if content.chars().count() <= limit {
        content.to_string()
    } else {
        let mut preview: String = content.chars().take(limit).collect();
        preview.push_str("...");
        preview
    }
}
