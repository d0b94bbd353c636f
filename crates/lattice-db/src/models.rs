/// Row types mapping one to one onto SQLite rows, with ids and timestamps
/// still in their stored text form. Distinct from the lattice-types API
/// models so the storage layer stays independent of the wire shapes.

pub struct UserRow {
    pub id: String,
    pub username: String,
    pub password: String,
    pub created_at: String,
}

pub struct ConversationRow {
    pub id: String,
    pub participant_a: String,
    pub participant_b: String,
    pub last_message_at: String,
    pub created_at: String,
}

/// A conversation row annotated with the requester's unread count and a
/// preview of the most recent message, for the conversation list.
pub struct ConversationListRow {
    pub conversation: ConversationRow,
    pub unread_count: i64,
    pub last_message_preview: Option<String>,
}

pub struct DirectMessageRow {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub sender_username: String,
    pub content: String,
    pub attachments: String,
    pub is_read: bool,
    pub created_at: String,
}

pub struct GroupRow {
    pub id: String,
    pub community_id: String,
    pub name: String,
    pub group_type: String,
    pub privacy: String,
    pub created_at: String,
}

pub struct GroupMessageRow {
    pub id: String,
    pub group_id: String,
    pub author_id: String,
    pub author_username: String,
    pub content: String,
    pub attachments: String,
    pub is_pinned: bool,
    pub is_edited: bool,
    pub parent_message_id: Option<String>,
    pub created_at: String,
}

pub struct ReactionRow {
    pub id: String,
    pub message_id: String,
    pub user_id: String,
    pub emoji: String,
    pub created_at: String,
}
