//! Row-to-view hydration: parse stored TEXT columns back into typed models,
//! degrading loudly (warn + default) on corrupt rows rather than failing a
//! whole page fetch.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tracing::warn;
use uuid::Uuid;

use lattice_db::models::{ConversationRow, DirectMessageRow, GroupMessageRow, ReactionRow};
use lattice_types::api::{DirectMessageView, GroupMessageView, ReactionGroup};
use lattice_types::models::Conversation;

pub(crate) fn parse_uuid(value: &str, what: &str) -> Uuid {
    value.parse().unwrap_or_else(|e| {
        warn!("Corrupt {} '{}': {}", what, value, e);
        Uuid::default()
    })
}

pub(crate) fn parse_timestamp(value: &str, what: &str) -> DateTime<Utc> {
    value.parse::<DateTime<Utc>>().unwrap_or_else(|e| {
        warn!("Corrupt {} timestamp '{}': {}", what, value, e);
        DateTime::default()
    })
}

pub(crate) fn parse_attachments(value: &str) -> Vec<String> {
    serde_json::from_str(value).unwrap_or_else(|e| {
        warn!("Corrupt attachments '{}': {}", value, e);
        Vec::new()
    })
}

pub(crate) fn conversation_from_row(row: ConversationRow) -> Conversation {
    Conversation {
        id: parse_uuid(&row.id, "conversation id"),
        participant_a: parse_uuid(&row.participant_a, "participant id"),
        participant_b: parse_uuid(&row.participant_b, "participant id"),
        last_message_at: parse_timestamp(&row.last_message_at, "conversation"),
        created_at: parse_timestamp(&row.created_at, "conversation"),
    }
}

pub(crate) fn direct_view(row: DirectMessageRow) -> DirectMessageView {
    DirectMessageView {
        id: parse_uuid(&row.id, "message id"),
        conversation_id: parse_uuid(&row.conversation_id, "conversation id"),
        sender_id: parse_uuid(&row.sender_id, "sender id"),
        sender_username: row.sender_username,
        content: row.content,
        attachments: parse_attachments(&row.attachments),
        is_read: row.is_read,
        created_at: parse_timestamp(&row.created_at, "message"),
    }
}

pub(crate) fn group_view(row: GroupMessageRow, reactions: Vec<ReactionGroup>) -> GroupMessageView {
    GroupMessageView {
        id: parse_uuid(&row.id, "message id"),
        group_id: parse_uuid(&row.group_id, "group id"),
        author_id: parse_uuid(&row.author_id, "author id"),
        author_username: row.author_username,
        content: row.content,
        attachments: parse_attachments(&row.attachments),
        is_pinned: row.is_pinned,
        is_edited: row.is_edited,
        parent_message_id: row
            .parent_message_id
            .as_deref()
            .map(|id| parse_uuid(id, "parent message id")),
        reactions,
        created_at: parse_timestamp(&row.created_at, "message"),
    }
}

/// Group raw reaction rows by message id, then by emoji, matching the shape
/// clients render: one group per distinct emoji with the reacting users.
pub(crate) fn group_reactions(rows: Vec<ReactionRow>) -> HashMap<String, Vec<ReactionGroup>> {
    let mut by_message: HashMap<String, HashMap<String, Vec<Uuid>>> = HashMap::new();
    for row in rows {
        let user_id = parse_uuid(&row.user_id, "reaction user id");
        by_message
            .entry(row.message_id)
            .or_default()
            .entry(row.emoji)
            .or_default()
            .push(user_id);
    }

    by_message
        .into_iter()
        .map(|(message_id, emoji_map)| {
            let groups = emoji_map
                .into_iter()
                .map(|(emoji, user_ids)| ReactionGroup {
                    emoji,
                    count: user_ids.len(),
                    user_ids,
                })
                .collect();
            (message_id, groups)
        })
        .collect()
}
