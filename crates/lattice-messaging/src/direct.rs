use std::sync::Arc;

use uuid::Uuid;

use lattice_db::{Database, now_rfc3339};
use lattice_types::api::{ConversationSummary, DirectMessageView};
use lattice_types::models::Conversation;

use crate::error::ChatError;
use crate::notify::NotificationEmitter;
use crate::views;
use crate::run_blocking;

/// Maximum accepted message length, matching the client-side composer cap.
const MAX_CONTENT_LEN: usize = 4000;

/// Result of a successful mark-as-read: everything the gateway needs to
/// notify the original sender that their message was seen.
#[derive(Debug, Clone, Copy)]
pub struct ReadReceipt {
    pub message_id: Uuid,
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    pub reader_id: Uuid,
}

/// Conversation lifecycle, direct message persistence, and read-state
/// mutation. Transport-agnostic: both the gateway and the REST fallback
/// call into this service.
#[derive(Clone)]
pub struct DirectMessaging {
    db: Arc<Database>,
    emitter: Arc<dyn NotificationEmitter>,
}

impl DirectMessaging {
    pub fn new(db: Arc<Database>, emitter: Arc<dyn NotificationEmitter>) -> Self {
        Self { db, emitter }
    }

    /// Idempotent get-or-create for the unordered participant pair.
    /// `get_or_create_conversation(a, b)` and `(b, a)` always resolve to the
    /// same conversation; concurrent first contact from both ends is settled
    /// by the unique constraint on the normalised pair.
    pub async fn get_or_create_conversation(
        &self,
        user_a: Uuid,
        user_b: Uuid,
    ) -> Result<Conversation, ChatError> {
        if user_a == user_b {
            return Err(ChatError::Validation(
                "cannot start a conversation with yourself",
            ));
        }

        let (first, second) = if user_a <= user_b {
            (user_a, user_b)
        } else {
            (user_b, user_a)
        };

        let id = Uuid::new_v4();
        run_blocking(&self.db, move |db| {
            let row = db.get_or_create_conversation(
                &id.to_string(),
                &first.to_string(),
                &second.to_string(),
                &now_rfc3339(),
            )?;
            Ok(views::conversation_from_row(row))
        })
        .await
    }

    /// All conversations involving the user, most recent activity first,
    /// annotated with unread counts and last-message previews.
    pub async fn list_conversations(
        &self,
        user_id: Uuid,
    ) -> Result<Vec<ConversationSummary>, ChatError> {
        run_blocking(&self.db, move |db| {
            let rows = db.list_conversations_for_user(&user_id.to_string())?;
            let summaries = rows
                .into_iter()
                .map(|row| {
                    let conversation = views::conversation_from_row(row.conversation);
                    ConversationSummary {
                        id: conversation.id,
                        peer_id: conversation.peer_of(user_id),
                        last_message_at: conversation.last_message_at,
                        unread_count: row.unread_count.max(0) as u64,
                        last_message_preview: row.last_message_preview,
                    }
                })
                .collect();
            Ok(summaries)
        })
        .await
    }

    /// Persists a message in the conversation and bumps its last-activity
    /// timestamp. Only the two participants may send.
    pub async fn send_message(
        &self,
        conversation_id: Uuid,
        sender_id: Uuid,
        content: String,
        attachments: Vec<String>,
    ) -> Result<DirectMessageView, ChatError> {
        validate_content(&content)?;

        let message_id = Uuid::new_v4();
        let (view, recipient_id) = run_blocking(&self.db, move |db| {
            let conversation = db
                .get_conversation(&conversation_id.to_string())?
                .map(views::conversation_from_row)
                .ok_or(ChatError::NotFound("conversation"))?;

            if !conversation.has_participant(sender_id) {
                return Err(ChatError::Forbidden(
                    "sender is not a participant of this conversation",
                ));
            }

            let attachments_json =
                serde_json::to_string(&attachments).map_err(|e| ChatError::Storage(e.into()))?;
            db.insert_direct_message(
                &message_id.to_string(),
                &conversation_id.to_string(),
                &sender_id.to_string(),
                content.trim(),
                &attachments_json,
                &now_rfc3339(),
            )?;

            let row = db
                .get_direct_message(&message_id.to_string())?
                .ok_or(ChatError::NotFound("message"))?;
            Ok((views::direct_view(row), conversation.peer_of(sender_id)))
        })
        .await?;

        self.emitter
            .direct_message_sent(conversation_id, view.id, sender_id, recipient_id);

        Ok(view)
    }

    /// Marks a message as read. A reader marking their *own* message is a
    /// silent no-op (`Ok(None)`); only the recipient's read action counts.
    pub async fn mark_as_read(
        &self,
        message_id: Uuid,
        reader_id: Uuid,
    ) -> Result<Option<ReadReceipt>, ChatError> {
        run_blocking(&self.db, move |db| {
            let message = db
                .get_direct_message(&message_id.to_string())?
                .map(views::direct_view)
                .ok_or(ChatError::NotFound("message"))?;

            if message.sender_id == reader_id {
                return Ok(None);
            }

            let conversation = db
                .get_conversation(&message.conversation_id.to_string())?
                .map(views::conversation_from_row)
                .ok_or(ChatError::NotFound("conversation"))?;

            if !conversation.has_participant(reader_id) {
                return Err(ChatError::Forbidden(
                    "reader is not a participant of this conversation",
                ));
            }

            db.mark_direct_message_read(&message_id.to_string())?;

            Ok(Some(ReadReceipt {
                message_id,
                conversation_id: message.conversation_id,
                sender_id: message.sender_id,
                reader_id,
            }))
        })
        .await
    }

    /// Single badge figure: unread messages across all of the user's
    /// conversations, excluding the user's own messages.
    pub async fn unread_count(&self, user_id: Uuid) -> Result<u64, ChatError> {
        run_blocking(&self.db, move |db| {
            let count = db.unread_count_for_user(&user_id.to_string())?;
            Ok(count.max(0) as u64)
        })
        .await
    }

    /// Chronological ascending page of a conversation's messages.
    /// Participants only.
    pub async fn list_messages(
        &self,
        conversation_id: Uuid,
        requester_id: Uuid,
        page: u32,
        page_size: u32,
    ) -> Result<Vec<DirectMessageView>, ChatError> {
        let (limit, offset) = page_bounds(page, page_size);
        run_blocking(&self.db, move |db| {
            let conversation = db
                .get_conversation(&conversation_id.to_string())?
                .map(views::conversation_from_row)
                .ok_or(ChatError::NotFound("conversation"))?;

            if !conversation.has_participant(requester_id) {
                return Err(ChatError::Forbidden(
                    "requester is not a participant of this conversation",
                ));
            }

            let rows = db.list_direct_messages(&conversation_id.to_string(), limit, offset)?;
            Ok(rows.into_iter().map(views::direct_view).collect())
        })
        .await
    }

    /// Authorization check used by the gateway before granting room
    /// membership for a conversation.
    pub async fn ensure_participant(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
    ) -> Result<Conversation, ChatError> {
        run_blocking(&self.db, move |db| {
            let conversation = db
                .get_conversation(&conversation_id.to_string())?
                .map(views::conversation_from_row)
                .ok_or(ChatError::NotFound("conversation"))?;

            if !conversation.has_participant(user_id) {
                return Err(ChatError::Forbidden(
                    "not a participant of this conversation",
                ));
            }

            Ok(conversation)
        })
        .await
    }
}

pub(crate) fn validate_content(content: &str) -> Result<(), ChatError> {
    // Measure what will actually be persisted, which is the trimmed form
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return Err(ChatError::Validation("message content must not be empty"));
    }
    if trimmed.len() > MAX_CONTENT_LEN {
        return Err(ChatError::Validation("message content too long"));
    }
    Ok(())
}

/// Clamp paging inputs: pages are 1-based, page size capped at 200.
pub(crate) fn page_bounds(page: u32, page_size: u32) -> (u32, u32) {
    let limit = page_size.clamp(1, 200);
    let offset = page.saturating_sub(1).saturating_mul(limit);
    (limit, offset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::test_support::RecordingEmitter;

    fn make_user(db: &Database) -> Uuid {
        let id = Uuid::new_v4();
        db.create_user(&id.to_string(), &format!("user-{id}"), "hash")
            .unwrap();
        id
    }

    fn setup() -> (DirectMessaging, Arc<RecordingEmitter>, Arc<Database>) {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let emitter = Arc::new(RecordingEmitter::default());
        let service = DirectMessaging::new(db.clone(), emitter.clone());
        (service, emitter, db)
    }

    #[tokio::test]
    async fn conversation_pair_is_unordered_and_unique() {
        let (service, _, db) = setup();
        let alice = make_user(&db);
        let bob = make_user(&db);

        let first = service.get_or_create_conversation(alice, bob).await.unwrap();
        let second = service.get_or_create_conversation(bob, alice).await.unwrap();

        assert_eq!(first.id, second.id);
        assert!(first.has_participant(alice));
        assert!(first.has_participant(bob));
    }

    #[tokio::test]
    async fn self_conversation_is_rejected() {
        let (service, _, db) = setup();
        let alice = make_user(&db);

        let err = service
            .get_or_create_conversation(alice, alice)
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::Validation(_)));
    }

    #[tokio::test]
    async fn first_contact_scenario() {
        // A sends "hi" to B with no prior conversation: one conversation,
        // one unread message for B, zero after B reads it.
        let (service, emitter, db) = setup();
        let alice = make_user(&db);
        let bob = make_user(&db);

        let conversation = service.get_or_create_conversation(alice, bob).await.unwrap();
        let message = service
            .send_message(conversation.id, alice, "hi".into(), vec![])
            .await
            .unwrap();

        assert!(!message.is_read);
        assert_eq!(service.unread_count(bob).await.unwrap(), 1);
        assert_eq!(service.unread_count(alice).await.unwrap(), 0);
        assert_eq!(emitter.direct_notices(), vec![(message.id, bob)]);

        let receipt = service.mark_as_read(message.id, bob).await.unwrap().unwrap();
        assert_eq!(receipt.sender_id, alice);
        assert_eq!(service.unread_count(bob).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn sender_read_is_a_noop() {
        let (service, _, db) = setup();
        let alice = make_user(&db);
        let bob = make_user(&db);

        let conversation = service.get_or_create_conversation(alice, bob).await.unwrap();
        let message = service
            .send_message(conversation.id, alice, "hello".into(), vec![])
            .await
            .unwrap();

        assert!(service.mark_as_read(message.id, alice).await.unwrap().is_none());
        assert_eq!(service.unread_count(bob).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn outsiders_cannot_send_or_read() {
        let (service, _, db) = setup();
        let alice = make_user(&db);
        let bob = make_user(&db);
        let carol = make_user(&db);

        let conversation = service.get_or_create_conversation(alice, bob).await.unwrap();
        let err = service
            .send_message(conversation.id, carol, "intruding".into(), vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::Forbidden(_)));

        let message = service
            .send_message(conversation.id, alice, "hi bob".into(), vec![])
            .await
            .unwrap();
        let err = service.mark_as_read(message.id, carol).await.unwrap_err();
        assert!(matches!(err, ChatError::Forbidden(_)));

        let err = service
            .list_messages(conversation.id, carol, 1, 50)
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::Forbidden(_)));
    }

    #[tokio::test]
    async fn empty_content_is_rejected() {
        let (service, _, db) = setup();
        let alice = make_user(&db);
        let bob = make_user(&db);

        let conversation = service.get_or_create_conversation(alice, bob).await.unwrap();
        let err = service
            .send_message(conversation.id, alice, "   ".into(), vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::Validation(_)));
    }

    #[tokio::test]
    async fn length_cap_ignores_surrounding_whitespace() {
        let (service, _, db) = setup();
        let alice = make_user(&db);
        let bob = make_user(&db);
        let conversation = service.get_or_create_conversation(alice, bob).await.unwrap();

        // At the cap once trimmed: accepted
        let padded = format!("  {}  ", "x".repeat(MAX_CONTENT_LEN));
        let message = service
            .send_message(conversation.id, alice, padded, vec![])
            .await
            .unwrap();
        assert_eq!(message.content.len(), MAX_CONTENT_LEN);

        // One byte over the cap after trimming: rejected
        let err = service
            .send_message(conversation.id, alice, "x".repeat(MAX_CONTENT_LEN + 1), vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::Validation(_)));
    }

    #[tokio::test]
    async fn conversation_list_orders_by_activity_and_counts_unread() {
        let (service, _, db) = setup();
        let alice = make_user(&db);
        let bob = make_user(&db);
        let carol = make_user(&db);

        let with_bob = service.get_or_create_conversation(alice, bob).await.unwrap();
        let with_carol = service.get_or_create_conversation(alice, carol).await.unwrap();

        service
            .send_message(with_bob.id, bob, "from bob".into(), vec![])
            .await
            .unwrap();
        service
            .send_message(with_carol.id, carol, "from carol 1".into(), vec![])
            .await
            .unwrap();
        service
            .send_message(with_carol.id, carol, "from carol 2".into(), vec![])
            .await
            .unwrap();

        let list = service.list_conversations(alice).await.unwrap();
        assert_eq!(list.len(), 2);
        // Carol's conversation saw the most recent activity
        assert_eq!(list[0].id, with_carol.id);
        assert_eq!(list[0].peer_id, carol);
        assert_eq!(list[0].unread_count, 2);
        assert_eq!(list[0].last_message_preview.as_deref(), Some("from carol 2"));
        assert_eq!(list[1].unread_count, 1);

        assert_eq!(service.unread_count(alice).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn messages_page_in_chronological_order() {
        let (service, _, db) = setup();
        let alice = make_user(&db);
        let bob = make_user(&db);

        let conversation = service.get_or_create_conversation(alice, bob).await.unwrap();
        for i in 0..5 {
            service
                .send_message(conversation.id, alice, format!("msg {i}"), vec![])
                .await
                .unwrap();
        }

        let page = service
            .list_messages(conversation.id, bob, 1, 3)
            .await
            .unwrap();
        assert_eq!(page.len(), 3);
        assert_eq!(page[0].content, "msg 0");

        let rest = service
            .list_messages(conversation.id, bob, 2, 3)
            .await
            .unwrap();
        assert_eq!(rest.len(), 2);
        assert_eq!(rest[1].content, "msg 4");
    }
}
