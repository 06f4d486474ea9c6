use serde::{Deserialize, Serialize};

use crate::error::{ChatError, ErrorCode};
use crate::types::{
    AttachmentRef, ConversationId, Message, MessageId, MessageKind, MessageSummary,
    ParticipantId, ParticipantSummary,
};

/// Events a connected session sends to the gateway.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ClientEvent {
    /// Join a conversation room and receive its history
    Join { conversation_id: ConversationId },

    /// Persist a message and broadcast it
    Send {
        conversation_id: ConversationId,
        content: String,
        #[serde(default)]
        kind: MessageKind,
        #[serde(default)]
        attachment: Option<AttachmentRef>,
        /// Client-generated id; resending the same id is idempotent
        #[serde(default)]
        client_message_id: Option<MessageId>,
    },

    /// Typing indicator toggle
    Typing {
        conversation_id: ConversationId,
        is_typing: bool,
    },

    /// Mark a received message as read
    Read {
        message_id: MessageId,
        conversation_id: ConversationId,
    },

    /// Leave a conversation room without disconnecting
    Leave { conversation_id: ConversationId },
}

impl ClientEvent {
    pub fn conversation_id(&self) -> ConversationId {
        match self {
            ClientEvent::Join { conversation_id }
            | ClientEvent::Send { conversation_id, .. }
            | ClientEvent::Typing { conversation_id, .. }
            | ClientEvent::Read { conversation_id, .. }
            | ClientEvent::Leave { conversation_id } => *conversation_id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::Join { .. } => "join",
            ClientEvent::Send { .. } => "send",
            ClientEvent::Typing { .. } => "typing",
            ClientEvent::Read { .. } => "read",
            ClientEvent::Leave { .. } => "leave",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PresenceState {
    Joined,
    Left,
}

/// Events the gateway pushes to sessions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ServerEvent {
    /// Reply to `join`: the conversation backlog, oldest first
    History {
        conversation_id: ConversationId,
        messages: Vec<Message>,
    },

    /// Room broadcast of a newly persisted message
    Message {
        message: Message,
        sender: ParticipantSummary,
    },

    /// Personal-channel notice for a connected receiver outside the room
    Notification {
        conversation_id: ConversationId,
        message: MessageSummary,
    },

    TypingStatus {
        conversation_id: ConversationId,
        participant_id: ParticipantId,
        is_typing: bool,
    },

    ReadReceipt {
        message_id: MessageId,
        conversation_id: ConversationId,
        reader_id: ParticipantId,
    },

    /// Sent to the sender's sessions once a session of `recipient_id` has
    /// been handed these messages after the fact (history replay on join)
    DeliveryReceipt {
        conversation_id: ConversationId,
        message_ids: Vec<MessageId>,
        recipient_id: ParticipantId,
    },

    Presence {
        conversation_id: ConversationId,
        participant_id: ParticipantId,
        state: PresenceState,
    },

    /// Caller-only acknowledgement of a successful `send`
    Sent {
        client_message_id: Option<MessageId>,
        message: Message,
        /// Whether a live session of the receiver was handed the message
        delivered: bool,
    },

    /// Caller-only failure report
    Error {
        code: ErrorCode,
        message: String,
        #[serde(default)]
        client_message_id: Option<MessageId>,
    },
}

impl ServerEvent {
    pub fn error(err: &ChatError, client_message_id: Option<MessageId>) -> Self {
        ServerEvent::Error {
            code: err.code(),
            message: err.to_string(),
            client_message_id,
        }
    }
}

impl ClientEvent {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(data: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(data)
    }
}

impl ServerEvent {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(data: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inbound_wire_shape() {
        let id = ConversationId::new();
        let raw = format!(
            r#"{{"type":"send","conversationId":"{}","content":"Hello"}}"#,
            id.0
        );
        let event = ClientEvent::from_json(&raw).unwrap();
        assert_eq!(
            event,
            ClientEvent::Send {
                conversation_id: id,
                content: "Hello".into(),
                kind: MessageKind::Text,
                attachment: None,
                client_message_id: None,
            }
        );
    }

    #[test]
    fn test_outbound_tag_names() {
        let event = ServerEvent::TypingStatus {
            conversation_id: ConversationId::new(),
            participant_id: ParticipantId::new(),
            is_typing: true,
        };
        let value: serde_json::Value = serde_json::from_str(&event.to_json().unwrap()).unwrap();
        assert_eq!(value["type"], "typingStatus");
        assert_eq!(value["isTyping"], true);
    }

    #[test]
    fn test_delivery_receipt_wire_shape() {
        let id = MessageId::new();
        let event = ServerEvent::DeliveryReceipt {
            conversation_id: ConversationId::new(),
            message_ids: vec![id],
            recipient_id: ParticipantId::new(),
        };
        let value: serde_json::Value = serde_json::from_str(&event.to_json().unwrap()).unwrap();
        assert_eq!(value["type"], "deliveryReceipt");
        assert_eq!(value["messageIds"][0], id.0.to_string());
        assert!(value["recipientId"].is_string());
    }

    #[test]
    fn test_unknown_event_rejected() {
        assert!(ClientEvent::from_json(r#"{"type":"explode"}"#).is_err());
    }

    #[test]
    fn test_error_event_carries_code() {
        let err = ChatError::Forbidden("not a participant".into());
        let value: serde_json::Value =
            serde_json::from_str(&ServerEvent::error(&err, None).to_json().unwrap()).unwrap();
        assert_eq!(value["type"], "error");
        assert_eq!(value["code"], "forbidden");
    }
}
