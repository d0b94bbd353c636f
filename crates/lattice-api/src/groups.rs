use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use uuid::Uuid;

use lattice_types::api::{
    Claims, EditMessageRequest, PageQuery, ReactionRequest, SendGroupMessageRequest,
};
use lattice_types::events::{GatewayEvent, RoomId};

use crate::auth::AppState;
use crate::status_for;

/// History fetch. The group id is taken as a raw string: a malformed id
/// degrades to an empty page inside the service instead of a 4xx, keeping
/// scrollback resilient to bad input.
pub async fn list_messages(
    State(state): State<AppState>,
    Path(group_id): Path<String>,
    Query(page): Query<PageQuery>,
    Extension(_claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    let messages = state
        .groups
        .list_messages(&group_id, page.page, page.page_size)
        .await
        .map_err(status_for)?;

    Ok(Json(messages))
}

pub async fn send_message(
    State(state): State<AppState>,
    Path(group_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<SendGroupMessageRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    let message = state
        .groups
        .send_message(group_id, claims.sub, req.content, req.attachments, None)
        .await
        .map_err(status_for)?;

    state
        .registry
        .broadcast_to_room(
            RoomId::Group(group_id),
            GatewayEvent::GroupMessageCreate {
                message: message.clone(),
            },
            None,
        )
        .await;

    Ok((StatusCode::CREATED, Json(message)))
}

pub async fn list_pinned(
    State(state): State<AppState>,
    Path(group_id): Path<Uuid>,
    Extension(_claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    let pinned = state
        .groups
        .list_pinned(group_id)
        .await
        .map_err(status_for)?;

    Ok(Json(pinned))
}

pub async fn add_reaction(
    State(state): State<AppState>,
    Path((group_id, message_id)): Path<(Uuid, Uuid)>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<ReactionRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    let _ = group_id; // the service resolves the owning group from the message

    let group_id = state
        .groups
        .add_reaction(message_id, claims.sub, req.emoji.clone())
        .await
        .map_err(status_for)?;

    state
        .registry
        .broadcast_to_room(
            RoomId::Group(group_id),
            GatewayEvent::ReactionAdd {
                group_id,
                message_id,
                user_id: claims.sub,
                emoji: req.emoji,
            },
            None,
        )
        .await;

    Ok(StatusCode::CREATED)
}

pub async fn remove_reaction(
    State(state): State<AppState>,
    Path((group_id, message_id, emoji)): Path<(Uuid, Uuid, String)>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    let _ = group_id;

    let group_id = state
        .groups
        .remove_reaction(message_id, claims.sub, emoji.clone())
        .await
        .map_err(status_for)?;

    state
        .registry
        .broadcast_to_room(
            RoomId::Group(group_id),
            GatewayEvent::ReactionRemove {
                group_id,
                message_id,
                user_id: claims.sub,
                emoji,
            },
            None,
        )
        .await;

    Ok(StatusCode::NO_CONTENT)
}

pub async fn pin_message(
    State(state): State<AppState>,
    Path((_group_id, message_id)): Path<(Uuid, Uuid)>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    let group_id = state
        .groups
        .pin_message(message_id, claims.sub)
        .await
        .map_err(status_for)?;

    broadcast_pin(&state, group_id, message_id, true).await;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn unpin_message(
    State(state): State<AppState>,
    Path((_group_id, message_id)): Path<(Uuid, Uuid)>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    let group_id = state
        .groups
        .unpin_message(message_id, claims.sub)
        .await
        .map_err(status_for)?;

    broadcast_pin(&state, group_id, message_id, false).await;
    Ok(StatusCode::NO_CONTENT)
}

async fn broadcast_pin(state: &AppState, group_id: Uuid, message_id: Uuid, pinned: bool) {
    state
        .registry
        .broadcast_to_room(
            RoomId::Group(group_id),
            GatewayEvent::MessagePinned {
                group_id,
                message_id,
                pinned,
            },
            None,
        )
        .await;
}

pub async fn edit_message(
    State(state): State<AppState>,
    Path((_group_id, message_id)): Path<(Uuid, Uuid)>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<EditMessageRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    let message = state
        .groups
        .edit_message(message_id, claims.sub, req.content)
        .await
        .map_err(status_for)?;

    state
        .registry
        .broadcast_to_room(
            RoomId::Group(message.group_id),
            GatewayEvent::MessageEdited {
                message: message.clone(),
            },
            None,
        )
        .await;

    Ok(Json(message))
}

pub async fn delete_message(
    State(state): State<AppState>,
    Path((_group_id, message_id)): Path<(Uuid, Uuid)>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    let group_id = state
        .groups
        .delete_message(message_id, claims.sub)
        .await
        .map_err(status_for)?;

    state
        .registry
        .broadcast_to_room(
            RoomId::Group(group_id),
            GatewayEvent::MessageDeleted {
                group_id,
                message_id,
            },
            None,
        )
        .await;

    Ok(StatusCode::NO_CONTENT)
}

/// Creates a single-level thread reply under a top-level message.
pub async fn reply_to_thread(
    State(state): State<AppState>,
    Path((group_id, message_id)): Path<(Uuid, Uuid)>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<SendGroupMessageRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    let message = state
        .groups
        .send_message(
            group_id,
            claims.sub,
            req.content,
            req.attachments,
            Some(message_id),
        )
        .await
        .map_err(status_for)?;

    state
        .registry
        .broadcast_to_room(
            RoomId::Group(group_id),
            GatewayEvent::GroupMessageCreate {
                message: message.clone(),
            },
            None,
        )
        .await;

    Ok((StatusCode::CREATED, Json(message)))
}

pub async fn list_thread(
    State(state): State<AppState>,
    Path((_group_id, message_id)): Path<(Uuid, Uuid)>,
    Extension(_claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    let replies = state
        .groups
        .list_thread(message_id)
        .await
        .map_err(status_for)?;

    Ok(Json(replies))
}
