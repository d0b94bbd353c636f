use crate::Database;
use crate::models::{ConversationListRow, ConversationRow, DirectMessageRow};
use anyhow::{Result, anyhow};
use rusqlite::{OptionalExtension, Row};

impl Database {
    /// Idempotent get-or-create for the normalised participant pair.
    /// Callers must pass `participant_a < participant_b`; the UNIQUE
    /// constraint resolves duplicate-insert races (one insert wins, the
    /// other no-ops and reads the winner back).
    pub fn get_or_create_conversation(
        &self,
        id: &str,
        participant_a: &str,
        participant_b: &str,
        now: &str,
    ) -> Result<ConversationRow> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO conversations (id, participant_a, participant_b, last_message_at, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?4)
                 ON CONFLICT(participant_a, participant_b) DO NOTHING",
                (id, participant_a, participant_b, now),
            )?;

            conn.query_row(
                "SELECT id, participant_a, participant_b, last_message_at, created_at
                 FROM conversations
                 WHERE participant_a = ?1 AND participant_b = ?2",
                (participant_a, participant_b),
                conversation_from_row,
            )
            .map_err(Into::into)
        })
    }

    pub fn get_conversation(&self, id: &str) -> Result<Option<ConversationRow>> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT id, participant_a, participant_b, last_message_at, created_at
                     FROM conversations WHERE id = ?1",
                    [id],
                    conversation_from_row,
                )
                .optional()?;
            Ok(row)
        })
    }

    /// All conversations involving `user_id`, newest activity first, with the
    /// unread count and last-message preview computed in a single query.
    pub fn list_conversations_for_user(&self, user_id: &str) -> Result<Vec<ConversationListRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT c.id, c.participant_a, c.participant_b, c.last_message_at, c.created_at,
                        (SELECT COUNT(*) FROM direct_messages m
                          WHERE m.conversation_id = c.id
                            AND m.sender_id != ?1
                            AND m.is_read = 0) AS unread,
                        (SELECT m.content FROM direct_messages m
                          WHERE m.conversation_id = c.id
                          ORDER BY m.created_at DESC, m.id DESC
                          LIMIT 1) AS preview
                 FROM conversations c
                 WHERE ?1 IN (c.participant_a, c.participant_b)
                 ORDER BY c.last_message_at DESC",
            )?;

            let rows = stmt
                .query_map([user_id], |row| {
                    Ok(ConversationListRow {
                        conversation: conversation_from_row(row)?,
                        unread_count: row.get(5)?,
                        last_message_preview: row.get(6)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok(rows)
        })
    }

    /// Persists a direct message and bumps the conversation's last-activity
    /// timestamp in the same locked section.
    pub fn insert_direct_message(
        &self,
        id: &str,
        conversation_id: &str,
        sender_id: &str,
        content: &str,
        attachments: &str,
        created_at: &str,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO direct_messages (id, conversation_id, sender_id, content, attachments, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                (id, conversation_id, sender_id, content, attachments, created_at),
            )?;
            conn.execute(
                "UPDATE conversations SET last_message_at = ?1 WHERE id = ?2",
                (created_at, conversation_id),
            )?;
            Ok(())
        })
    }

    pub fn get_direct_message(&self, id: &str) -> Result<Option<DirectMessageRow>> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    &format!("{DIRECT_MESSAGE_SELECT} WHERE m.id = ?1"),
                    [id],
                    direct_message_from_row,
                )
                .optional()?;
            Ok(row)
        })
    }

    pub fn mark_direct_message_read(&self, id: &str) -> Result<()> {
        self.with_conn(|conn| {
            let changed = conn.execute("UPDATE direct_messages SET is_read = 1 WHERE id = ?1", [id])?;
            if changed == 0 {
                return Err(anyhow!("Message not found: {}", id));
            }
            Ok(())
        })
    }

    /// Aggregate unread badge count across all of the user's conversations.
    pub fn unread_count_for_user(&self, user_id: &str) -> Result<i64> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT COUNT(*)
                 FROM direct_messages m
                 JOIN conversations c ON m.conversation_id = c.id
                 WHERE ?1 IN (c.participant_a, c.participant_b)
                   AND m.sender_id != ?1
                   AND m.is_read = 0",
                [user_id],
                |row| row.get(0),
            )
            .map_err(Into::into)
        })
    }

    /// Chronological ascending page of a conversation's messages.
    pub fn list_direct_messages(
        &self,
        conversation_id: &str,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<DirectMessageRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "{DIRECT_MESSAGE_SELECT}
                 WHERE m.conversation_id = ?1
                 ORDER BY m.created_at ASC, m.id ASC
                 LIMIT ?2 OFFSET ?3"
            ))?;

            let rows = stmt
                .query_map(
                    rusqlite::params![conversation_id, limit, offset],
                    direct_message_from_row,
                )?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok(rows)
        })
    }
}

// JOIN users to fetch sender_username in a single query (eliminates N+1)
const DIRECT_MESSAGE_SELECT: &str =
    "SELECT m.id, m.conversation_id, m.sender_id, u.username, m.content, m.attachments, m.is_read, m.created_at
     FROM direct_messages m
     LEFT JOIN users u ON m.sender_id = u.id";

fn conversation_from_row(row: &Row<'_>) -> rusqlite::Result<ConversationRow> {
    Ok(ConversationRow {
        id: row.get(0)?,
        participant_a: row.get(1)?,
        participant_b: row.get(2)?,
        last_message_at: row.get(3)?,
        created_at: row.get(4)?,
    })
}

fn direct_message_from_row(row: &Row<'_>) -> rusqlite::Result<DirectMessageRow> {
    Ok(DirectMessageRow {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        sender_id: row.get(2)?,
        sender_username: row
            .get::<_, Option<String>>(3)?
            .unwrap_or_else(|| "unknown".to_string()),
        content: row.get(4)?,
        attachments: row.get(5)?,
        is_read: row.get(6)?,
        created_at: row.get(7)?,
    })
}
