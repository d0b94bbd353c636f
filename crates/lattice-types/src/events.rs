use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

use crate::api::{DirectMessageView, GroupMessageView};

/// Broadcast scope for real-time delivery. Conversations and groups share
/// the room mechanism but are namespaced by kind so their ids can never
/// collide: `conversation:<uuid>` vs `group:<uuid>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RoomId {
    Conversation(Uuid),
    Group(Uuid),
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Conversation(id) => write!(f, "conversation:{id}"),
            Self::Group(id) => write!(f, "group:{id}"),
        }
    }
}

impl FromStr for RoomId {
    type Err = RoomIdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, id) = s.split_once(':').ok_or(RoomIdParseError)?;
        let id = Uuid::parse_str(id).map_err(|_| RoomIdParseError)?;
        match kind {
            "conversation" => Ok(Self::Conversation(id)),
            "group" => Ok(Self::Group(id)),
            _ => Err(RoomIdParseError),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoomIdParseError;

impl fmt::Display for RoomIdParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("expected `conversation:<uuid>` or `group:<uuid>`")
    }
}

impl std::error::Error for RoomIdParseError {}

impl Serialize for RoomId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for RoomId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Commands sent FROM client TO server over the WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GatewayCommand {
    /// Subscribe to a direct conversation's room (participants only)
    JoinConversation { conversation_id: Uuid },

    /// Subscribe to a group's room (community members only)
    JoinGroup { group_id: Uuid },

    /// Leave a group's room
    LeaveGroup { group_id: Uuid },

    /// Send a direct message
    SendMessage {
        conversation_id: Uuid,
        content: String,
        #[serde(default)]
        attachments: Vec<String>,
    },

    /// Send a group message; `parent_message_id` makes it a thread reply
    SendGroupMessage {
        group_id: Uuid,
        content: String,
        #[serde(default)]
        attachments: Vec<String>,
        #[serde(default)]
        parent_message_id: Option<Uuid>,
    },

    /// Indicate typing in a room (ephemeral, never persisted)
    TypingStart { room: RoomId },

    /// Indicate typing stopped
    TypingStop { room: RoomId },

    /// Mark a direct message as read
    MarkRead { message_id: Uuid },
}

/// Events sent over the WebSocket gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GatewayEvent {
    /// Server confirms successful authentication
    Ready { user_id: Uuid, username: String },

    /// A new direct message was posted
    MessageCreate { message: DirectMessageView },

    /// A new group message was posted
    GroupMessageCreate { message: GroupMessageView },

    /// A direct message was read by its recipient
    MessageRead {
        message_id: Uuid,
        conversation_id: Uuid,
        reader_id: Uuid,
    },

    /// A user came online or went offline
    PresenceUpdate {
        user_id: Uuid,
        username: String,
        online: bool,
    },

    /// A user started typing in a room
    TypingStart {
        room: RoomId,
        user_id: Uuid,
        username: String,
    },

    /// A user stopped typing in a room
    TypingStop {
        room: RoomId,
        user_id: Uuid,
        username: String,
    },

    /// A user's connection joined a room
    MemberJoined { room: RoomId, user_id: Uuid },

    /// A user's connection left a room
    MemberLeft { room: RoomId, user_id: Uuid },

    /// A reaction was added to a group message
    ReactionAdd {
        group_id: Uuid,
        message_id: Uuid,
        user_id: Uuid,
        emoji: String,
    },

    /// A reaction was removed from a group message
    ReactionRemove {
        group_id: Uuid,
        message_id: Uuid,
        user_id: Uuid,
        emoji: String,
    },

    /// A group message's content was edited by its author
    MessageEdited { message: GroupMessageView },

    /// A group message was pinned or unpinned
    MessagePinned {
        group_id: Uuid,
        message_id: Uuid,
        pinned: bool,
    },

    /// A group message was deleted
    MessageDeleted { group_id: Uuid, message_id: Uuid },

    /// An operation initiated by this connection failed
    Error { code: String, message: String },
}

impl GatewayEvent {
    /// Returns the room this event is scoped to. Events that return `None`
    /// are targeted or global and bypass room routing.
    pub fn room(&self) -> Option<RoomId> {
        match self {
            Self::MessageCreate { message } => Some(RoomId::Conversation(message.conversation_id)),
            Self::GroupMessageCreate { message } => Some(RoomId::Group(message.group_id)),
            Self::TypingStart { room, .. } | Self::TypingStop { room, .. } => Some(*room),
            Self::MemberJoined { room, .. } | Self::MemberLeft { room, .. } => Some(*room),
            Self::ReactionAdd { group_id, .. } | Self::ReactionRemove { group_id, .. } => {
                Some(RoomId::Group(*group_id))
            }
            Self::MessageEdited { message } => Some(RoomId::Group(message.group_id)),
            Self::MessagePinned { group_id, .. } | Self::MessageDeleted { group_id, .. } => {
                Some(RoomId::Group(*group_id))
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn room_id_round_trips_through_display() {
        let id = Uuid::new_v4();
        for room in [RoomId::Conversation(id), RoomId::Group(id)] {
            let parsed: RoomId = room.to_string().parse().unwrap();
            assert_eq!(parsed, room);
        }
    }

    #[test]
    fn room_id_rejects_unknown_kind() {
        assert!("channel:00000000-0000-0000-0000-000000000001"
            .parse::<RoomId>()
            .is_err());
        assert!("group:not-a-uuid".parse::<RoomId>().is_err());
        assert!("group".parse::<RoomId>().is_err());
    }

    #[test]
    fn event_room_scoping() {
        let group_id = Uuid::new_v4();
        let scoped = GatewayEvent::MessagePinned {
            group_id,
            message_id: Uuid::new_v4(),
            pinned: true,
        };
        assert_eq!(scoped.room(), Some(RoomId::Group(group_id)));

        let global = GatewayEvent::PresenceUpdate {
            user_id: Uuid::new_v4(),
            username: "amira".into(),
            online: true,
        };
        assert_eq!(global.room(), None);
    }

    #[test]
    fn commands_deserialize_with_default_attachments() {
        let cmd: GatewayCommand = serde_json::from_str(
            r#"{"type":"SendMessage","data":{"conversation_id":"00000000-0000-0000-0000-000000000001","content":"hi"}}"#,
        )
        .unwrap();
        match cmd {
            GatewayCommand::SendMessage { content, attachments, .. } => {
                assert_eq!(content, "hi");
                assert!(attachments.is_empty());
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
