use tracing::debug;
use uuid::Uuid;

/// Collaborator interface for the external notification store. Invoked
/// after a message has been persisted; it raises "new message" events and
/// plays no part in chat delivery guarantees, so implementations must be
/// cheap and non-blocking.
pub trait NotificationEmitter: Send + Sync {
    fn direct_message_sent(
        &self,
        conversation_id: Uuid,
        message_id: Uuid,
        sender_id: Uuid,
        recipient_id: Uuid,
    );

    fn group_message_sent(&self, group_id: Uuid, message_id: Uuid, sender_id: Uuid);
}

/// Default emitter: logs the event and does nothing else. The production
/// deployment swaps in a client for the notification service.
pub struct LogEmitter;

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Mutex;

    use uuid::Uuid;

    use super::NotificationEmitter;

    /// Captures emitted notices so tests can assert the emitter fires
    /// exactly once per successful persist.
    #[derive(Default)]
    pub struct RecordingEmitter {
        direct: Mutex<Vec<(Uuid, Uuid)>>,
        group: Mutex<Vec<(Uuid, Uuid)>>,
    }

    impl RecordingEmitter {
        /// (message_id, recipient_id) pairs in emission order.
        pub fn direct_notices(&self) -> Vec<(Uuid, Uuid)> {
            self.direct.lock().unwrap().clone()
        }

        /// (message_id, group_id) pairs in emission order.
        pub fn group_notices(&self) -> Vec<(Uuid, Uuid)> {
            self.group.lock().unwrap().clone()
        }
    }

    impl NotificationEmitter for RecordingEmitter {
        fn direct_message_sent(
            &self,
            _conversation_id: Uuid,
            message_id: Uuid,
            _sender_id: Uuid,
            recipient_id: Uuid,
        ) {
            self.direct.lock().unwrap().push((message_id, recipient_id));
        }

        fn group_message_sent(&self, group_id: Uuid, message_id: Uuid, _sender_id: Uuid) {
            self.group.lock().unwrap().push((message_id, group_id));
        }
    }
}

impl NotificationEmitter for LogEmitter {
    fn direct_message_sent(
        &self,
        conversation_id: Uuid,
        message_id: Uuid,
        sender_id: Uuid,
        recipient_id: Uuid,
    ) {
        debug!(
            "notify: direct message {} in {} from {} to {}",
            message_id, conversation_id, sender_id, recipient_id
        );
    }

    fn group_message_sent(&self, group_id: Uuid, message_id: Uuid, sender_id: Uuid) {
        debug!(
            "notify: group message {} in {} from {}",
            message_id, group_id, sender_id
        );
    }
}
