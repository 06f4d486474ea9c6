use serde::Serialize;
use uuid::Uuid;

use tandem_shared::{MessageId, OutboundStatus, SyncStatus};

/// Published by the send queue for the UI.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum QueueEvent {
    StatusChanged {
        message_id: MessageId,
        status: OutboundStatus,
    },
    /// Fraction in `[0, 1]`.
    UploadProgress { message_id: MessageId, fraction: f32 },
    SyncStatusChanged { status: SyncStatus },
    /// An item used up its attempts and moved to the failed list.
    RetryExhausted {
        item_id: Uuid,
        message_id: Option<MessageId>,
        attempts: u32,
        last_error: String,
    },
    /// The server refused an item outright; it moved to the failed list.
    Rejected {
        item_id: Uuid,
        message_id: Option<MessageId>,
        error: String,
    },
}
