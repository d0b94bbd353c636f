use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use uuid::Uuid;

use lattice_types::api::{
    Claims, CreateConversationRequest, PageQuery, SendMessageRequest, UnreadCountResponse,
};
use lattice_types::events::{GatewayEvent, RoomId};

use crate::auth::AppState;
use crate::status_for;

/// Idempotent get-or-create for the caller's conversation with `peer_id`.
pub async fn create_conversation(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<CreateConversationRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    let conversation = state
        .direct
        .get_or_create_conversation(claims.sub, req.peer_id)
        .await
        .map_err(status_for)?;

    Ok(Json(conversation))
}

pub async fn list_conversations(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    let conversations = state
        .direct
        .list_conversations(claims.sub)
        .await
        .map_err(status_for)?;

    Ok(Json(conversations))
}

pub async fn unread_count(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    let unread = state
        .direct
        .unread_count(claims.sub)
        .await
        .map_err(status_for)?;

    Ok(Json(UnreadCountResponse { unread }))
}

pub async fn list_messages(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Query(page): Query<PageQuery>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    let messages = state
        .direct
        .list_messages(conversation_id, claims.sub, page.page, page.page_size)
        .await
        .map_err(status_for)?;

    Ok(Json(messages))
}

/// Non-real-time send. Persists through the same service as the gateway,
/// then performs the same best-effort room broadcast so currently-connected
/// peers see the message without waiting for a refetch.
pub async fn send_message(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<SendMessageRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    let message = state
        .direct
        .send_message(conversation_id, claims.sub, req.content, req.attachments)
        .await
        .map_err(status_for)?;

    state
        .registry
        .broadcast_to_room(
            RoomId::Conversation(conversation_id),
            GatewayEvent::MessageCreate {
                message: message.clone(),
            },
            None,
        )
        .await;

    Ok((StatusCode::CREATED, Json(message)))
}

pub async fn mark_read(
    State(state): State<AppState>,
    Path(message_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    let receipt = state
        .direct
        .mark_as_read(message_id, claims.sub)
        .await
        .map_err(status_for)?;

    if let Some(receipt) = &receipt {
        state
            .registry
            .send_to_user(
                receipt.sender_id,
                GatewayEvent::MessageRead {
                    message_id: receipt.message_id,
                    conversation_id: receipt.conversation_id,
                    reader_id: receipt.reader_id,
                },
            )
            .await;
    }

    // updated=false means the reader was the sender: a silent no-op
    Ok(Json(serde_json::json!({ "updated": receipt.is_some() })))
}
