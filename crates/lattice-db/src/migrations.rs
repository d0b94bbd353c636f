use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS users (
            id          TEXT PRIMARY KEY,
            username    TEXT NOT NULL UNIQUE,
            password    TEXT NOT NULL,
            created_at  TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
        );

        -- Direct (1:1) conversations. The participant pair is stored
        -- normalised (participant_a < participant_b lexicographically) so the
        -- UNIQUE constraint enforces unordered-pair uniqueness and acts as
        -- the backstop for concurrent first-contact races.
        CREATE TABLE IF NOT EXISTS conversations (
            id              TEXT PRIMARY KEY,
            participant_a   TEXT NOT NULL REFERENCES users(id),
            participant_b   TEXT NOT NULL REFERENCES users(id),
            last_message_at TEXT NOT NULL,
            created_at      TEXT NOT NULL,
            UNIQUE(participant_a, participant_b)
        );

        CREATE TABLE IF NOT EXISTS direct_messages (
            id              TEXT PRIMARY KEY,
            conversation_id TEXT NOT NULL REFERENCES conversations(id),
            sender_id       TEXT NOT NULL REFERENCES users(id),
            content         TEXT NOT NULL,
            attachments     TEXT NOT NULL DEFAULT '[]',
            is_read         INTEGER NOT NULL DEFAULT 0,
            created_at      TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_direct_messages_conversation
            ON direct_messages(conversation_id, created_at);

        -- Communities and their membership are owned by the external
        -- community service; this is a read-only mirror the messaging core
        -- consults for authorization.
        CREATE TABLE IF NOT EXISTS communities (
            id          TEXT PRIMARY KEY,
            name        TEXT NOT NULL,
            created_at  TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
        );

        CREATE TABLE IF NOT EXISTS community_members (
            community_id TEXT NOT NULL REFERENCES communities(id),
            user_id      TEXT NOT NULL REFERENCES users(id),
            role         TEXT NOT NULL DEFAULT 'member',
            PRIMARY KEY (community_id, user_id)
        );

        CREATE TABLE IF NOT EXISTS groups (
            id           TEXT PRIMARY KEY,
            community_id TEXT NOT NULL REFERENCES communities(id),
            name         TEXT NOT NULL,
            group_type   TEXT NOT NULL DEFAULT 'chat',
            privacy      TEXT NOT NULL DEFAULT 'public',
            created_at   TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
        );

        CREATE TABLE IF NOT EXISTS group_messages (
            id                TEXT PRIMARY KEY,
            group_id          TEXT NOT NULL REFERENCES groups(id),
            author_id         TEXT NOT NULL REFERENCES users(id),
            content           TEXT NOT NULL,
            attachments       TEXT NOT NULL DEFAULT '[]',
            is_pinned         INTEGER NOT NULL DEFAULT 0,
            is_edited         INTEGER NOT NULL DEFAULT 0,
            parent_message_id TEXT REFERENCES group_messages(id),
            created_at        TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_group_messages_group
            ON group_messages(group_id, created_at);

        CREATE INDEX IF NOT EXISTS idx_group_messages_parent
            ON group_messages(parent_message_id);

        CREATE TABLE IF NOT EXISTS reactions (
            id          TEXT PRIMARY KEY,
            message_id  TEXT NOT NULL REFERENCES group_messages(id),
            user_id     TEXT NOT NULL REFERENCES users(id),
            emoji       TEXT NOT NULL,
            created_at  TEXT NOT NULL,
            UNIQUE(message_id, user_id, emoji)
        );

        CREATE INDEX IF NOT EXISTS idx_reactions_message
            ON reactions(message_id);
        ",
    )?;

    info!("Database migrations complete");
    Ok(())
}
