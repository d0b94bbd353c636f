use std::sync::Arc;

use tracing::{debug, warn};
use uuid::Uuid;

use lattice_db::models::{GroupMessageRow, GroupRow};
use lattice_db::{Database, now_rfc3339};
use lattice_types::api::GroupMessageView;
use lattice_types::models::{CommunityRole, Group, GroupType, Privacy};

use crate::direct::{page_bounds, validate_content};
use crate::error::ChatError;
use crate::notify::NotificationEmitter;
use crate::run_blocking;
use crate::views;

/// Community-room chat: message persistence, reactions, pinning, edits,
/// and single-level thread replies. Every mutating operation is gated on
/// membership in the group's owning community.
#[derive(Clone)]
pub struct GroupMessaging {
    db: Arc<Database>,
    emitter: Arc<dyn NotificationEmitter>,
}

impl GroupMessaging {
    pub fn new(db: Arc<Database>, emitter: Arc<dyn NotificationEmitter>) -> Self {
        Self { db, emitter }
    }

    /// Authorization check used by the gateway before granting room
    /// membership: the caller must belong to the group's owning community.
    pub async fn ensure_member(
        &self,
        group_id: Uuid,
        user_id: Uuid,
    ) -> Result<(Group, CommunityRole), ChatError> {
        run_blocking(&self.db, move |db| {
            let group = load_group(db, group_id)?;
            let role = require_role(db, &group.community_id, user_id)?;
            Ok((group_from_row(group), role))
        })
        .await
    }

    /// Persists a group message. When `parent_message_id` is set the message
    /// is a thread reply; the parent must be a top-level message in the same
    /// group. Replying to a reply is rejected to keep threads one level deep.
    pub async fn send_message(
        &self,
        group_id: Uuid,
        author_id: Uuid,
        content: String,
        attachments: Vec<String>,
        parent_message_id: Option<Uuid>,
    ) -> Result<GroupMessageView, ChatError> {
        validate_content(&content)?;

        let message_id = Uuid::new_v4();
        let view = run_blocking(&self.db, move |db| {
            let group = load_group(db, group_id)?;
            require_role(db, &group.community_id, author_id)?;

            if let Some(parent_id) = parent_message_id {
                let parent = load_message(db, parent_id)?;
                if parent.group_id != group_id.to_string() {
                    return Err(ChatError::Validation(
                        "parent message belongs to a different group",
                    ));
                }
                if parent.parent_message_id.is_some() {
                    return Err(ChatError::Validation(
                        "cannot reply to a reply; threads are one level deep",
                    ));
                }
            }

            let attachments_json =
                serde_json::to_string(&attachments).map_err(|e| ChatError::Storage(e.into()))?;
            db.insert_group_message(
                &message_id.to_string(),
                &group_id.to_string(),
                &author_id.to_string(),
                content.trim(),
                &attachments_json,
                parent_message_id.map(|id| id.to_string()).as_deref(),
                &now_rfc3339(),
            )?;

            hydrate(db, load_message(db, message_id)?)
        })
        .await?;

        self.emitter.group_message_sent(group_id, view.id, author_id);

        Ok(view)
    }

    /// Chronological ascending page of a group's top-level messages. A
    /// malformed group identifier degrades to an empty page instead of an
    /// error so history scrollback stays resilient to bad input.
    pub async fn list_messages(
        &self,
        group_id: &str,
        page: u32,
        page_size: u32,
    ) -> Result<Vec<GroupMessageView>, ChatError> {
        let group_id = match Uuid::parse_str(group_id) {
            Ok(id) => id,
            Err(e) => {
                debug!("Malformed group id '{}' on history fetch: {}", group_id, e);
                return Ok(vec![]);
            }
        };

        let (limit, offset) = page_bounds(page, page_size);
        run_blocking(&self.db, move |db| {
            let rows = db.list_group_messages(&group_id.to_string(), limit, offset)?;
            hydrate_all(db, rows)
        })
        .await
    }

    /// Replies of a top-level message, oldest first.
    pub async fn list_thread(
        &self,
        parent_message_id: Uuid,
    ) -> Result<Vec<GroupMessageView>, ChatError> {
        run_blocking(&self.db, move |db| {
            load_message(db, parent_message_id)?;
            let rows = db.list_thread_replies(&parent_message_id.to_string())?;
            hydrate_all(db, rows)
        })
        .await
    }

    /// Adds a (message, user, emoji) reaction. A duplicate tuple is a
    /// conflict; distinct emoji from the same user are fine. Returns the
    /// owning group id for room-scoped broadcast.
    pub async fn add_reaction(
        &self,
        message_id: Uuid,
        user_id: Uuid,
        emoji: String,
    ) -> Result<Uuid, ChatError> {
        if emoji.trim().is_empty() {
            return Err(ChatError::Validation("emoji must not be empty"));
        }

        let reaction_id = Uuid::new_v4();
        run_blocking(&self.db, move |db| {
            let message = load_message(db, message_id)?;
            let group = load_group_raw(db, &message.group_id)?;
            require_role(db, &group.community_id, user_id)?;

            let inserted = db.insert_reaction(
                &reaction_id.to_string(),
                &message_id.to_string(),
                &user_id.to_string(),
                emoji.trim(),
                &now_rfc3339(),
            )?;
            if !inserted {
                return Err(ChatError::Conflict("reaction already exists"));
            }

            Ok(views::parse_uuid(&message.group_id, "group id"))
        })
        .await
    }

    /// Removes a reaction; removing one that does not exist is not-found.
    pub async fn remove_reaction(
        &self,
        message_id: Uuid,
        user_id: Uuid,
        emoji: String,
    ) -> Result<Uuid, ChatError> {
        run_blocking(&self.db, move |db| {
            let message = load_message(db, message_id)?;
            let group = load_group_raw(db, &message.group_id)?;
            require_role(db, &group.community_id, user_id)?;

            let removed =
                db.remove_reaction(&message_id.to_string(), &user_id.to_string(), emoji.trim())?;
            if !removed {
                return Err(ChatError::NotFound("reaction"));
            }

            Ok(views::parse_uuid(&message.group_id, "group id"))
        })
        .await
    }

    /// Pins a message. Requires an elevated community role.
    pub async fn pin_message(&self, message_id: Uuid, caller_id: Uuid) -> Result<Uuid, ChatError> {
        self.set_pinned(message_id, caller_id, true).await
    }

    /// Unpins a message. Requires an elevated community role.
    pub async fn unpin_message(&self, message_id: Uuid, caller_id: Uuid) -> Result<Uuid, ChatError> {
        self.set_pinned(message_id, caller_id, false).await
    }

    async fn set_pinned(
        &self,
        message_id: Uuid,
        caller_id: Uuid,
        pinned: bool,
    ) -> Result<Uuid, ChatError> {
        run_blocking(&self.db, move |db| {
            let message = load_message(db, message_id)?;
            let group = load_group_raw(db, &message.group_id)?;
            let role = require_role(db, &group.community_id, caller_id)?;

            if !role.can_moderate() {
                return Err(ChatError::Forbidden(
                    "pinning requires an owner, admin, or moderator role",
                ));
            }

            db.set_message_pinned(&message_id.to_string(), pinned)?;
            Ok(views::parse_uuid(&message.group_id, "group id"))
        })
        .await
    }

    /// Currently pinned messages, newest first.
    pub async fn list_pinned(&self, group_id: Uuid) -> Result<Vec<GroupMessageView>, ChatError> {
        run_blocking(&self.db, move |db| {
            load_group(db, group_id)?;
            let rows = db.list_pinned_messages(&group_id.to_string())?;
            hydrate_all(db, rows)
        })
        .await
    }

    /// Replaces a message's content. Only the original author may edit, and
    /// the edited flag is set permanently; no history is retained.
    pub async fn edit_message(
        &self,
        message_id: Uuid,
        editor_id: Uuid,
        content: String,
    ) -> Result<GroupMessageView, ChatError> {
        validate_content(&content)?;

        run_blocking(&self.db, move |db| {
            let message = load_message(db, message_id)?;
            if message.author_id != editor_id.to_string() {
                return Err(ChatError::Forbidden(
                    "only the original author may edit a message",
                ));
            }

            db.update_message_content(&message_id.to_string(), content.trim())?;
            hydrate(db, load_message(db, message_id)?)
        })
        .await
    }

    /// Deletes a message (and its replies and reactions). The author may
    /// delete their own; elevated community roles may delete any message in
    /// their community's groups. Returns the owning group id.
    pub async fn delete_message(
        &self,
        message_id: Uuid,
        caller_id: Uuid,
    ) -> Result<Uuid, ChatError> {
        run_blocking(&self.db, move |db| {
            let message = load_message(db, message_id)?;
            let group = load_group_raw(db, &message.group_id)?;
            let role = require_role(db, &group.community_id, caller_id)?;

            if message.author_id != caller_id.to_string() && !role.can_moderate() {
                return Err(ChatError::Forbidden(
                    "deleting another author's message requires an elevated role",
                ));
            }

            db.delete_group_message(&message_id.to_string())?;
            Ok(views::parse_uuid(&message.group_id, "group id"))
        })
        .await
    }
}

fn load_group(db: &Database, group_id: Uuid) -> Result<GroupRow, ChatError> {
    db.get_group(&group_id.to_string())?
        .ok_or(ChatError::NotFound("group"))
}

fn load_group_raw(db: &Database, group_id: &str) -> Result<GroupRow, ChatError> {
    db.get_group(group_id)?.ok_or(ChatError::NotFound("group"))
}

fn load_message(db: &Database, message_id: Uuid) -> Result<GroupMessageRow, ChatError> {
    db.get_group_message(&message_id.to_string())?
        .ok_or(ChatError::NotFound("message"))
}

/// Looks up the caller's role in the community; absence is a Forbidden, not
/// a NotFound; the group's existence is already established by then.
fn require_role(
    db: &Database,
    community_id: &str,
    user_id: Uuid,
) -> Result<CommunityRole, ChatError> {
    let role = db
        .community_role(community_id, &user_id.to_string())?
        .ok_or(ChatError::Forbidden("not a member of this community"))?;

    Ok(CommunityRole::parse(&role).unwrap_or_else(|| {
        warn!("Unknown community role '{}' for user {}", role, user_id);
        CommunityRole::Member
    }))
}

fn group_from_row(row: GroupRow) -> Group {
    Group {
        id: views::parse_uuid(&row.id, "group id"),
        community_id: views::parse_uuid(&row.community_id, "community id"),
        name: row.name,
        group_type: GroupType::parse(&row.group_type).unwrap_or(GroupType::Chat),
        privacy: Privacy::parse(&row.privacy).unwrap_or(Privacy::Public),
        created_at: views::parse_timestamp(&row.created_at, "group"),
    }
}

fn hydrate(db: &Database, row: GroupMessageRow) -> Result<GroupMessageView, ChatError> {
    let reactions = db.reactions_for_messages(std::slice::from_ref(&row.id))?;
    let mut grouped = views::group_reactions(reactions);
    let reaction_groups = grouped.remove(&row.id).unwrap_or_default();
    Ok(views::group_view(row, reaction_groups))
}

fn hydrate_all(
    db: &Database,
    rows: Vec<GroupMessageRow>,
) -> Result<Vec<GroupMessageView>, ChatError> {
    let ids: Vec<String> = rows.iter().map(|r| r.id.clone()).collect();
    let mut grouped = views::group_reactions(db.reactions_for_messages(&ids)?);
    Ok(rows
        .into_iter()
        .map(|row| {
            let reactions = grouped.remove(&row.id).unwrap_or_default();
            views::group_view(row, reactions)
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::test_support::RecordingEmitter;

    struct Fixture {
        service: GroupMessaging,
        emitter: Arc<RecordingEmitter>,
        db: Arc<Database>,
        community_id: Uuid,
        group_id: Uuid,
        owner: Uuid,
        moderator: Uuid,
        member: Uuid,
        other_member: Uuid,
        outsider: Uuid,
    }

    fn make_user(db: &Database) -> Uuid {
        let id = Uuid::new_v4();
        db.create_user(&id.to_string(), &format!("user-{id}"), "hash")
            .unwrap();
        id
    }

    fn setup() -> Fixture {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let emitter = Arc::new(RecordingEmitter::default());
        let service = GroupMessaging::new(db.clone(), emitter.clone());

        let community_id = Uuid::new_v4();
        db.upsert_community(&community_id.to_string(), "rustaceans")
            .unwrap();

        let owner = make_user(&db);
        let moderator = make_user(&db);
        let member = make_user(&db);
        let other_member = make_user(&db);
        let outsider = make_user(&db);
        for (user, role) in [
            (owner, "owner"),
            (moderator, "moderator"),
            (member, "member"),
            (other_member, "member"),
        ] {
            db.upsert_community_member(&community_id.to_string(), &user.to_string(), role)
                .unwrap();
        }

        let group_id = Uuid::new_v4();
        db.insert_group(
            &group_id.to_string(),
            &community_id.to_string(),
            "general",
            "chat",
            "public",
        )
        .unwrap();

        Fixture {
            service,
            emitter,
            db,
            community_id,
            group_id,
            owner,
            moderator,
            member,
            other_member,
            outsider,
        }
    }

    async fn post(f: &Fixture, author: Uuid, content: &str) -> GroupMessageView {
        f.service
            .send_message(f.group_id, author, content.into(), vec![], None)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn non_member_cannot_send() {
        let f = setup();
        let err = f
            .service
            .send_message(f.group_id, f.outsider, "hi".into(), vec![], None)
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::Forbidden(_)));
    }

    #[tokio::test]
    async fn send_hydrates_author_and_notifies() {
        let f = setup();
        let message = post(&f, f.member, "hello group").await;

        assert_eq!(message.author_id, f.member);
        assert_eq!(message.author_username, format!("user-{}", f.member));
        assert!(message.reactions.is_empty());
        assert!(!message.is_edited);
        assert_eq!(f.emitter.group_notices(), vec![(message.id, f.group_id)]);
    }

    #[tokio::test]
    async fn malformed_group_id_yields_empty_page() {
        let f = setup();
        let page = f.service.list_messages("definitely-not-a-uuid", 1, 50).await.unwrap();
        assert!(page.is_empty());
    }

    #[tokio::test]
    async fn top_level_listing_excludes_replies() {
        let f = setup();
        let top = post(&f, f.member, "top level").await;
        f.service
            .send_message(f.group_id, f.other_member, "a reply".into(), vec![], Some(top.id))
            .await
            .unwrap();

        let page = f
            .service
            .list_messages(&f.group_id.to_string(), 1, 50)
            .await
            .unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].id, top.id);

        let thread = f.service.list_thread(top.id).await.unwrap();
        assert_eq!(thread.len(), 1);
        assert_eq!(thread[0].parent_message_id, Some(top.id));
    }

    #[tokio::test]
    async fn replying_to_a_reply_is_rejected() {
        let f = setup();
        let top = post(&f, f.member, "top").await;
        let reply = f
            .service
            .send_message(f.group_id, f.member, "reply".into(), vec![], Some(top.id))
            .await
            .unwrap();

        let err = f
            .service
            .send_message(f.group_id, f.member, "nested".into(), vec![], Some(reply.id))
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::Validation(_)));
    }

    #[tokio::test]
    async fn thread_of_missing_parent_is_not_found() {
        let f = setup();
        let err = f.service.list_thread(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, ChatError::NotFound(_)));
    }

    #[tokio::test]
    async fn reaction_uniqueness_per_user_and_emoji() {
        let f = setup();
        let message = post(&f, f.member, "react to me").await;

        // Two members, same emoji: two distinct entries
        f.service
            .add_reaction(message.id, f.member, "👍".into())
            .await
            .unwrap();
        f.service
            .add_reaction(message.id, f.other_member, "👍".into())
            .await
            .unwrap();

        // Same user, same emoji again: conflict
        let err = f
            .service
            .add_reaction(message.id, f.member, "👍".into())
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::Conflict(_)));

        // Same user, different emoji: fine
        f.service
            .add_reaction(message.id, f.member, "🎉".into())
            .await
            .unwrap();

        let page = f
            .service
            .list_messages(&f.group_id.to_string(), 1, 50)
            .await
            .unwrap();
        let reactions = &page[0].reactions;
        let thumbs = reactions.iter().find(|g| g.emoji == "👍").unwrap();
        assert_eq!(thumbs.count, 2);
        let party = reactions.iter().find(|g| g.emoji == "🎉").unwrap();
        assert_eq!(party.count, 1);
    }

    #[tokio::test]
    async fn revoked_member_cannot_mutate_reactions() {
        let f = setup();
        let message = post(&f, f.member, "react then leave").await;
        f.service
            .add_reaction(message.id, f.member, "👍".into())
            .await
            .unwrap();

        // Membership revoked by the external authority's sync feed
        f.db.remove_community_member(&f.community_id.to_string(), &f.member.to_string())
            .unwrap();

        let err = f
            .service
            .add_reaction(message.id, f.member, "🎉".into())
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::Forbidden(_)));

        let err = f
            .service
            .remove_reaction(message.id, f.member, "👍".into())
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::Forbidden(_)));
    }

    #[tokio::test]
    async fn removing_absent_reaction_is_not_found() {
        let f = setup();
        let message = post(&f, f.member, "nothing here").await;

        let err = f
            .service
            .remove_reaction(message.id, f.member, "👍".into())
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::NotFound(_)));

        f.service
            .add_reaction(message.id, f.member, "👍".into())
            .await
            .unwrap();
        f.service
            .remove_reaction(message.id, f.member, "👍".into())
            .await
            .unwrap();

        let page = f
            .service
            .list_messages(&f.group_id.to_string(), 1, 50)
            .await
            .unwrap();
        assert!(page[0].reactions.is_empty());
    }

    #[tokio::test]
    async fn pinning_requires_elevated_role() {
        let f = setup();
        let message = post(&f, f.member, "pin me").await;

        let err = f
            .service
            .pin_message(message.id, f.member)
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::Forbidden(_)));

        f.service.pin_message(message.id, f.moderator).await.unwrap();
        let second = post(&f, f.member, "pin me too").await;
        f.service.pin_message(second.id, f.owner).await.unwrap();

        // Newest-first
        let pinned = f.service.list_pinned(f.group_id).await.unwrap();
        assert_eq!(pinned.len(), 2);
        assert_eq!(pinned[0].id, second.id);

        f.service.unpin_message(message.id, f.owner).await.unwrap();
        let pinned = f.service.list_pinned(f.group_id).await.unwrap();
        assert_eq!(pinned.len(), 1);
    }

    #[tokio::test]
    async fn only_the_author_may_edit() {
        let f = setup();
        let message = post(&f, f.member, "original").await;

        // Even an owner cannot edit someone else's message
        let err = f
            .service
            .edit_message(message.id, f.owner, "hijacked".into())
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::Forbidden(_)));

        let edited = f
            .service
            .edit_message(message.id, f.member, "fixed typo".into())
            .await
            .unwrap();
        assert!(edited.is_edited);
        assert_eq!(edited.content, "fixed typo");

        // The flag is permanent across further edits and fetches
        let again = f
            .service
            .edit_message(message.id, f.member, "fixed again".into())
            .await
            .unwrap();
        assert!(again.is_edited);
    }

    #[tokio::test]
    async fn delete_is_author_or_moderator_only() {
        let f = setup();
        let message = post(&f, f.member, "delete me").await;

        let err = f
            .service
            .delete_message(message.id, f.other_member)
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::Forbidden(_)));

        // Author deletes their own
        f.service.delete_message(message.id, f.member).await.unwrap();

        // Moderator deletes another author's
        let second = post(&f, f.member, "mod will remove this").await;
        f.service
            .delete_message(second.id, f.moderator)
            .await
            .unwrap();

        let page = f
            .service
            .list_messages(&f.group_id.to_string(), 1, 50)
            .await
            .unwrap();
        assert!(page.is_empty());
    }

    #[tokio::test]
    async fn ensure_member_reports_group_and_role() {
        let f = setup();
        let (group, role) = f.service.ensure_member(f.group_id, f.owner).await.unwrap();
        assert_eq!(group.id, f.group_id);
        assert_eq!(role, CommunityRole::Owner);
        assert!(role.can_moderate());

        let err = f
            .service
            .ensure_member(f.group_id, f.outsider)
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::Forbidden(_)));

        let err = f
            .service
            .ensure_member(Uuid::new_v4(), f.owner)
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::NotFound(_)));
    }

    #[tokio::test]
    async fn fallback_send_persists_without_gateway() {
        // The request/response path calls the same service; the message must
        // land in listMessages even though no connection ever saw it live.
        let f = setup();
        let message = post(&f, f.member, "sent while offline").await;

        let page = f
            .service
            .list_messages(&f.group_id.to_string(), 1, 50)
            .await
            .unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].id, message.id);
    }
}
