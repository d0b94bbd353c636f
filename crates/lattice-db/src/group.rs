use crate::Database;
use crate::models::{GroupMessageRow, GroupRow, ReactionRow};
use anyhow::Result;
use rusqlite::{OptionalExtension, Row};

impl Database {
    // -- Community membership mirror (written by the external community
    // service's sync feed; the messaging core only reads it) --

    pub fn upsert_community(&self, id: &str, name: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO communities (id, name) VALUES (?1, ?2)
                 ON CONFLICT(id) DO UPDATE SET name = excluded.name",
                (id, name),
            )?;
            Ok(())
        })
    }

    pub fn upsert_community_member(
        &self,
        community_id: &str,
        user_id: &str,
        role: &str,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO community_members (community_id, user_id, role) VALUES (?1, ?2, ?3)
                 ON CONFLICT(community_id, user_id) DO UPDATE SET role = excluded.role",
                (community_id, user_id, role),
            )?;
            Ok(())
        })
    }

    pub fn remove_community_member(&self, community_id: &str, user_id: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM community_members WHERE community_id = ?1 AND user_id = ?2",
                (community_id, user_id),
            )?;
            Ok(())
        })
    }

    pub fn community_role(&self, community_id: &str, user_id: &str) -> Result<Option<String>> {
        self.with_conn(|conn| {
            let role = conn
                .query_row(
                    "SELECT role FROM community_members WHERE community_id = ?1 AND user_id = ?2",
                    (community_id, user_id),
                    |row| row.get(0),
                )
                .optional()?;
            Ok(role)
        })
    }

    // -- Groups --

    pub fn insert_group(
        &self,
        id: &str,
        community_id: &str,
        name: &str,
        group_type: &str,
        privacy: &str,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO groups (id, community_id, name, group_type, privacy)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                (id, community_id, name, group_type, privacy),
            )?;
            Ok(())
        })
    }

    pub fn get_group(&self, id: &str) -> Result<Option<GroupRow>> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT id, community_id, name, group_type, privacy, created_at
                     FROM groups WHERE id = ?1",
                    [id],
                    |row| {
                        Ok(GroupRow {
                            id: row.get(0)?,
                            community_id: row.get(1)?,
                            name: row.get(2)?,
                            group_type: row.get(3)?,
                            privacy: row.get(4)?,
                            created_at: row.get(5)?,
                        })
                    },
                )
                .optional()?;
            Ok(row)
        })
    }

    // -- Group messages --

    pub fn insert_group_message(
        &self,
        id: &str,
        group_id: &str,
        author_id: &str,
        content: &str,
        attachments: &str,
        parent_message_id: Option<&str>,
        created_at: &str,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO group_messages
                 (id, group_id, author_id, content, attachments, parent_message_id, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                (id, group_id, author_id, content, attachments, parent_message_id, created_at),
            )?;
            Ok(())
        })
    }

    pub fn get_group_message(&self, id: &str) -> Result<Option<GroupMessageRow>> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    &format!("{GROUP_MESSAGE_SELECT} WHERE m.id = ?1"),
                    [id],
                    group_message_from_row,
                )
                .optional()?;
            Ok(row)
        })
    }

    /// Chronological ascending page of a group's top-level messages.
    /// Thread replies are excluded; they live under their parent.
    pub fn list_group_messages(
        &self,
        group_id: &str,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<GroupMessageRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "{GROUP_MESSAGE_SELECT}
                 WHERE m.group_id = ?1 AND m.parent_message_id IS NULL
                 ORDER BY m.created_at ASC, m.id ASC
                 LIMIT ?2 OFFSET ?3"
            ))?;

            let rows = stmt
                .query_map(
                    rusqlite::params![group_id, limit, offset],
                    group_message_from_row,
                )?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok(rows)
        })
    }

    /// Replies to a top-level message, oldest first.
    pub fn list_thread_replies(&self, parent_message_id: &str) -> Result<Vec<GroupMessageRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "{GROUP_MESSAGE_SELECT}
                 WHERE m.parent_message_id = ?1
                 ORDER BY m.created_at ASC, m.id ASC"
            ))?;

            let rows = stmt
                .query_map([parent_message_id], group_message_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok(rows)
        })
    }

    /// Currently pinned messages, newest first.
    pub fn list_pinned_messages(&self, group_id: &str) -> Result<Vec<GroupMessageRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "{GROUP_MESSAGE_SELECT}
                 WHERE m.group_id = ?1 AND m.is_pinned = 1
                 ORDER BY m.created_at DESC, m.id DESC"
            ))?;

            let rows = stmt
                .query_map([group_id], group_message_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok(rows)
        })
    }

    pub fn set_message_pinned(&self, id: &str, pinned: bool) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE group_messages SET is_pinned = ?1 WHERE id = ?2",
                (pinned as i64, id),
            )?;
            Ok(())
        })
    }

    /// Replaces the content and permanently marks the message as edited.
    /// No edit history is retained.
    pub fn update_message_content(&self, id: &str, content: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE group_messages SET content = ?1, is_edited = 1 WHERE id = ?2",
                (content, id),
            )?;
            Ok(())
        })
    }

    /// Removes a message along with its reactions and any thread replies.
    pub fn delete_group_message(&self, id: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM reactions WHERE message_id = ?1
                 OR message_id IN (SELECT id FROM group_messages WHERE parent_message_id = ?1)",
                [id],
            )?;
            conn.execute(
                "DELETE FROM group_messages WHERE parent_message_id = ?1",
                [id],
            )?;
            conn.execute("DELETE FROM group_messages WHERE id = ?1", [id])?;
            Ok(())
        })
    }

    // -- Reactions --

    /// Inserts a reaction unless the (message, user, emoji) tuple already
    /// exists. Returns false on a duplicate; the caller decides whether
    /// that is a conflict.
    pub fn insert_reaction(
        &self,
        id: &str,
        message_id: &str,
        user_id: &str,
        emoji: &str,
        created_at: &str,
    ) -> Result<bool> {
        self.with_conn(|conn| {
            let inserted = conn.execute(
                "INSERT INTO reactions (id, message_id, user_id, emoji, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(message_id, user_id, emoji) DO NOTHING",
                (id, message_id, user_id, emoji, created_at),
            )?;
            Ok(inserted > 0)
        })
    }

    /// Removes a reaction. Returns false when no such reaction existed.
    pub fn remove_reaction(&self, message_id: &str, user_id: &str, emoji: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let removed = conn.execute(
                "DELETE FROM reactions WHERE message_id = ?1 AND user_id = ?2 AND emoji = ?3",
                (message_id, user_id, emoji),
            )?;
            Ok(removed > 0)
        })
    }

    /// Batch-fetch reactions for a set of message IDs.
    pub fn reactions_for_messages(&self, message_ids: &[String]) -> Result<Vec<ReactionRow>> {
        if message_ids.is_empty() {
            return Ok(vec![]);
        }

        self.with_conn(|conn| {
            let placeholders: Vec<String> =
                (1..=message_ids.len()).map(|i| format!("?{}", i)).collect();
            let sql = format!(
                "SELECT id, message_id, user_id, emoji, created_at FROM reactions WHERE message_id IN ({})",
                placeholders.join(", ")
            );

            let mut stmt = conn.prepare(&sql)?;
            let params: Vec<&dyn rusqlite::types::ToSql> = message_ids
                .iter()
                .map(|id| id as &dyn rusqlite::types::ToSql)
                .collect();

            let rows = stmt
                .query_map(params.as_slice(), |row| {
                    Ok(ReactionRow {
                        id: row.get(0)?,
                        message_id: row.get(1)?,
                        user_id: row.get(2)?,
                        emoji: row.get(3)?,
                        created_at: row.get(4)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok(rows)
        })
    }
}

// JOIN users to fetch author_username in a single query (eliminates N+1)
const GROUP_MESSAGE_SELECT: &str =
    "SELECT m.id, m.group_id, m.author_id, u.username, m.content, m.attachments,
            m.is_pinned, m.is_edited, m.parent_message_id, m.created_at
     FROM group_messages m
     LEFT JOIN users u ON m.author_id = u.id";

fn group_message_from_row(row: &Row<'_>) -> rusqlite::Result<GroupMessageRow> {
    Ok(GroupMessageRow {
        id: row.get(0)?,
        group_id: row.get(1)?,
        author_id: row.get(2)?,
        author_username: row
            .get::<_, Option<String>>(3)?
            .unwrap_or_else(|| "unknown".to_string()),
        content: row.get(4)?,
        attachments: row.get(5)?,
        is_pinned: row.get(6)?,
        is_edited: row.get(7)?,
        parent_message_id: row.get(8)?,
        created_at: row.get(9)?,
    })
}
