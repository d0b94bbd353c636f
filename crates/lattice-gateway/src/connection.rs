use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tracing::{debug, info, warn};
use uuid::Uuid;

use lattice_messaging::{ChatError, DirectMessaging, GroupMessaging};
use lattice_types::events::{GatewayCommand, GatewayEvent, RoomId};

use crate::registry::ConnectionRegistry;

/// Heartbeat interval: server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Everything a connection handler needs: the registry it mutates and the
/// two services it delegates persistence to.
#[derive(Clone)]
pub struct GatewayContext {
    pub registry: ConnectionRegistry,
    pub direct: DirectMessaging,
    pub groups: GroupMessaging,
}

fn encode(event: &GatewayEvent) -> Message {
    // GatewayEvent serialization is infallible for the types it contains
    Message::Text(serde_json::to_string(event).unwrap_or_default().into())
}

/// Handle a pre-authenticated WebSocket connection. The JWT was already
/// validated at the HTTP upgrade layer, so the connection goes straight to
/// Ready + the event loop.
pub async fn handle_connection(
    socket: WebSocket,
    ctx: GatewayContext,
    user_id: Uuid,
    username: String,
) {
    let (mut sender, mut receiver) = socket.split();

    info!("{} ({}) connected to gateway", username, user_id);

    let ready = GatewayEvent::Ready {
        user_id,
        username: username.clone(),
    };
    if sender.send(encode(&ready)).await.is_err() {
        return;
    }

    // Replay currently-online peers so this client sees who's already here
    for (peer_id, peer_name) in ctx.registry.online_users().await {
        if peer_id == user_id {
            continue;
        }
        let event = GatewayEvent::PresenceUpdate {
            user_id: peer_id,
            username: peer_name,
            online: true,
        };
        if sender.send(encode(&event)).await.is_err() {
            return;
        }
    }

    // Register, then announce online only on the first connection of a user
    // (a second device must not re-broadcast presence).
    let was_online = ctx.registry.is_online(user_id).await;
    let (conn_id, mut user_rx) = ctx.registry.register(user_id, username.clone()).await;
    if !was_online {
        ctx.registry
            .broadcast_all(GatewayEvent::PresenceUpdate {
                user_id,
                username: username.clone(),
                online: true,
            })
            .await;
    }

    // Shared flag for heartbeat
    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received.clone();

    // Forward registry-delivered events -> client, with heartbeat
    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            tokio::select! {
                result = user_rx.recv() => {
                    let event = match result {
                        Some(event) => event,
                        None => break,
                    };
                    if sender.send(encode(&event)).await.is_err() {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= 2 {
                            warn!("Heartbeat timeout (missed {} pongs), dropping connection", missed_heartbeats);
                            break;
                        }
                    }
                    if sender.send(Message::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Read commands from client
    let ctx_recv = ctx.clone();
    let username_recv = username.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => match serde_json::from_str::<GatewayCommand>(&text) {
                    Ok(cmd) => {
                        handle_command(&ctx_recv, conn_id, user_id, &username_recv, cmd).await;
                    }
                    Err(e) => {
                        warn!(
                            "{} ({}) bad command ({} bytes): {}",
                            username_recv,
                            user_id,
                            text.len(),
                            e
                        );
                        ctx_recv
                            .registry
                            .send_to_conn(
                                conn_id,
                                GatewayEvent::Error {
                                    code: "bad_command".into(),
                                    message: "unrecognised command payload".into(),
                                },
                            )
                            .await;
                    }
                },
                Message::Pong(_) => {
                    pong_flag_recv.store(true, Ordering::Release);
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    // Wait for either task to finish
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    if let Some(gone) = ctx.registry.unregister(conn_id).await {
        for room in gone.rooms {
            ctx.registry
                .broadcast_to_room(
                    room,
                    GatewayEvent::MemberLeft { room, user_id },
                    None,
                )
                .await;
        }
        if gone.went_offline {
            ctx.registry
                .broadcast_all(GatewayEvent::PresenceUpdate {
                    user_id,
                    username: username.clone(),
                    online: false,
                })
                .await;
        }
    }

    info!("{} ({}) disconnected from gateway", username, user_id);
}

/// Surfaces a service failure to the initiating connection only, never a
/// partial broadcast, never silently dropped.
async fn send_error(registry: &ConnectionRegistry, conn_id: Uuid, err: &ChatError) {
    registry
        .send_to_conn(
            conn_id,
            GatewayEvent::Error {
                code: err.code().into(),
                message: err.to_string(),
            },
        )
        .await;
}

async fn handle_command(
    ctx: &GatewayContext,
    conn_id: Uuid,
    user_id: Uuid,
    username: &str,
    cmd: GatewayCommand,
) {
    match cmd {
        GatewayCommand::JoinConversation { conversation_id } => {
            match ctx.direct.ensure_participant(conversation_id, user_id).await {
                Ok(_) => {
                    let room = RoomId::Conversation(conversation_id);
                    ctx.registry.join_room(conn_id, room).await;
                    ctx.registry
                        .broadcast_to_room(
                            room,
                            GatewayEvent::MemberJoined { room, user_id },
                            Some(conn_id),
                        )
                        .await;
                }
                Err(e) => send_error(&ctx.registry, conn_id, &e).await,
            }
        }

        GatewayCommand::JoinGroup { group_id } => {
            match ctx.groups.ensure_member(group_id, user_id).await {
                Ok((group, role)) => {
                    info!(
                        "{} ({}) joined group room {} as {}",
                        username,
                        user_id,
                        group.id,
                        role.as_str()
                    );
                    let room = RoomId::Group(group_id);
                    ctx.registry.join_room(conn_id, room).await;
                    ctx.registry
                        .broadcast_to_room(
                            room,
                            GatewayEvent::MemberJoined { room, user_id },
                            Some(conn_id),
                        )
                        .await;
                }
                Err(e) => send_error(&ctx.registry, conn_id, &e).await,
            }
        }

        GatewayCommand::LeaveGroup { group_id } => {
            let room = RoomId::Group(group_id);
            ctx.registry.leave_room(conn_id, room).await;
            ctx.registry
                .broadcast_to_room(room, GatewayEvent::MemberLeft { room, user_id }, None)
                .await;
        }

        GatewayCommand::SendMessage {
            conversation_id,
            content,
            attachments,
        } => {
            match ctx
                .direct
                .send_message(conversation_id, user_id, content, attachments)
                .await
            {
                Ok(message) => {
                    // Persisted first; now fan out to everyone in the room,
                    // including the sender's own other connections.
                    let event = GatewayEvent::MessageCreate { message };
                    if let Some(room) = event.room() {
                        ctx.registry.broadcast_to_room(room, event, None).await;
                    }
                }
                Err(e) => send_error(&ctx.registry, conn_id, &e).await,
            }
        }

        GatewayCommand::SendGroupMessage {
            group_id,
            content,
            attachments,
            parent_message_id,
        } => {
            match ctx
                .groups
                .send_message(group_id, user_id, content, attachments, parent_message_id)
                .await
            {
                Ok(message) => {
                    let event = GatewayEvent::GroupMessageCreate { message };
                    if let Some(room) = event.room() {
                        ctx.registry.broadcast_to_room(room, event, None).await;
                    }
                }
                Err(e) => send_error(&ctx.registry, conn_id, &e).await,
            }
        }

        // Typing signals are ephemeral: never persisted, never acknowledged,
        // excluded from the sender, and only honoured for joined rooms. A
        // lost signal self-heals on the next keystroke or the stop event.
        GatewayCommand::TypingStart { room } => {
            if ctx.registry.in_room(conn_id, room).await {
                ctx.registry
                    .broadcast_to_room(
                        room,
                        GatewayEvent::TypingStart {
                            room,
                            user_id,
                            username: username.to_string(),
                        },
                        Some(conn_id),
                    )
                    .await;
            } else {
                debug!("{} typing in unjoined room {}, ignoring", username, room);
            }
        }

        GatewayCommand::TypingStop { room } => {
            if ctx.registry.in_room(conn_id, room).await {
                ctx.registry
                    .broadcast_to_room(
                        room,
                        GatewayEvent::TypingStop {
                            room,
                            user_id,
                            username: username.to_string(),
                        },
                        Some(conn_id),
                    )
                    .await;
            }
        }

        GatewayCommand::MarkRead { message_id } => {
            match ctx.direct.mark_as_read(message_id, user_id).await {
                // Notify the original sender's connections that their
                // message was read.
                Ok(Some(receipt)) => {
                    ctx.registry
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
                // Reader was the sender: nothing to acknowledge
                Ok(None) => {}
                Err(e) => send_error(&ctx.registry, conn_id, &e).await,
            }
        }
    }
}
