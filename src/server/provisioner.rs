use crate::server::chats::{ChatChannel, ChatError, ChatStore};
use crate::server::database::Database;
use crate::server::protocol::{RequestSummary, SenderInfo, ServerEvent};
use crate::server::rooms::{RoomId, RoomRegistry};
use log::{info, warn};
use sqlx::Row;

/// What the request-creation workflow hands over once the request row is
/// durable: the request id plus the two chat participants.
#[derive(Debug, Clone)]
pub struct NewTransportRequest {
    pub id: String,
    pub sender_id: String,
    pub sender_name: String,
    pub driver_id: String,
    pub departure: String,
    pub destination: String,
}

/// Persist the transport request row itself. Belongs to the HTTP request
/// workflow; exposed here so tooling and tests can drive the full flow.
pub async fn record_request(db: &Database, request: &NewTransportRequest) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO transport_requests (id, sender_id, driver_id, departure, destination, created_at) \
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(&request.id)
    .bind(&request.sender_id)
    .bind(&request.driver_id)
    .bind(&request.departure)
    .bind(&request.destination)
    .bind(chrono::Utc::now().timestamp_millis())
    .execute(&db.pool)
    .await?;
    Ok(())
}

/// Create the chat channel for a freshly created request and notify the
/// trip owner's personal room. A duplicate provisioning attempt fails and
/// is escalated to the request-creation caller; the "one chat per request"
/// invariant is never silently relaxed.
pub async fn provision_chat(
    store: &ChatStore,
    registry: &RoomRegistry,
    request: &NewTransportRequest,
) -> Result<ChatChannel, ChatError> {
    let chat = store
        .create(&request.id, &request.sender_id, &request.driver_id)
        .await?;
    info!("[PROVISION] chat {} created for request {}", chat.id, request.id);

    let summary = RequestSummary {
        id: request.id.clone(),
        sender: SenderInfo {
            id: request.sender_id.clone(),
            name: request.sender_name.clone(),
            avatar: None,
        },
        departure: request.departure.clone(),
        destination: request.destination.clone(),
    };
    registry
        .broadcast(
            &RoomId::User(request.driver_id.clone()),
            &ServerEvent::NewRequest { request: summary },
        )
        .await;
    Ok(chat)
}

/// Compensating sweep for the missing half of the two-write provisioning:
/// a crash between the request insert and the chat insert leaves a request
/// with no channel. Run at startup and periodically; idempotent, and a
/// concurrent provisioning racing the sweep loses harmlessly to the
/// uniqueness constraint.
pub async fn reconcile_missing_chats(db: &Database, store: &ChatStore) -> Result<usize, ChatError> {
    let orphans = sqlx::query(
        "SELECT r.id, r.sender_id, r.driver_id FROM transport_requests r \
         LEFT JOIN chats c ON c.request_id = r.id WHERE c.id IS NULL",
    )
    .fetch_all(&db.pool)
    .await?;

    let mut created = 0;
    for row in orphans {
        let request_id: String = row.get("id");
        let sender_id: String = row.get("sender_id");
        let driver_id: String = row.get("driver_id");
        match store.create(&request_id, &sender_id, &driver_id).await {
            Ok(chat) => {
                info!("[PROVISION] reconciliation created chat {} for orphaned request {}", chat.id, request_id);
                created += 1;
            }
            Err(ChatError::AlreadyProvisioned) => {} // lost the race, fine
            Err(e) => {
                warn!("[PROVISION] reconciliation failed for request {}: {}", request_id, e);
                return Err(e);
            }
        }
    }
    Ok(created)
}
