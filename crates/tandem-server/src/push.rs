//! Offline delivery hand-off.
//!
//! When a message's receiver has no live session, the gateway emits a
//! [`PushIntent`]. Actual delivery (mobile push, email digest) belongs to
//! whichever [`PushSink`] is installed.

use serde::Serialize;
use tracing::info;

use tandem_shared::{ConversationId, MessageSummary, ParticipantId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PushIntent {
    pub recipient: ParticipantId,
    pub conversation_id: ConversationId,
    pub message: MessageSummary,
}

pub trait PushSink: Send + Sync {
    fn push(&self, intent: PushIntent);
}

/// Logs intents. Used when no push provider is configured.
#[derive(Debug, Default)]
pub struct LogPushSink;

impl PushSink for LogPushSink {
    fn push(&self, intent: PushIntent) {
        info!(
            recipient = %intent.recipient,
            conversation = %intent.conversation_id,
            message = %intent.message.id,
            "Receiver offline, push intent recorded"
        );
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Mutex;

    use super::*;

    /// Collects intents for assertions.
    #[derive(Default)]
    pub(crate) struct RecordingSink(pub Mutex<Vec<PushIntent>>);

    impl PushSink for RecordingSink {
        fn push(&self, intent: PushIntent) {
            self.0.lock().unwrap().push(intent);
        }
    }

    impl RecordingSink {
        pub(crate) fn taken(&self) -> Vec<PushIntent> {
            std::mem::take(&mut *self.0.lock().unwrap())
        }
    }
}
