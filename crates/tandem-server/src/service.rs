//! Conversation business rules.
//!
//! [`ConversationService`] owns conversation creation and reuse, message
//! creation, read-state and typing-state transitions, and the access policy
//! that applies to all of them. Persistence goes through the shared
//! [`Database`]; every mutation is one statement or one transaction.

use std::sync::{Arc, Mutex};

use chrono::{SubsecRound, Utc};
use tracing::{debug, info};

use tandem_shared::constants::MAX_MESSAGE_CHARS;
use tandem_shared::error::Result;
use tandem_shared::{
    AttachmentRef, ChatError, Conversation, ConversationId, ConversationStatus, Message,
    MessageId, MessageKind, Participant, ParticipantId, Role,
};
use tandem_store::{Database, StoreError};

use crate::auth::ParticipantDirectory;

/// Database handle shared by the service and the participant directory.
pub type SharedDb = Arc<Mutex<Database>>;

/// Result of [`ConversationService::create_message`].
#[derive(Debug, Clone)]
pub struct CreatedMessage {
    pub message: Message,
    /// `false` when the client message id was already persisted and the
    /// existing row was returned instead.
    pub is_new: bool,
}

/// Result of [`ConversationService::mark_message_read`].
#[derive(Debug, Clone)]
pub struct ReadOutcome {
    pub message: Message,
    /// Whether this call flipped the flag.
    pub changed: bool,
}

pub struct ConversationService {
    db: SharedDb,
    directory: Arc<dyn ParticipantDirectory>,
}

impl ConversationService {
    pub fn new(db: SharedDb, directory: Arc<dyn ParticipantDirectory>) -> Self {
        Self { db, directory }
    }

    fn with_db<T>(
        &self,
        f: impl FnOnce(&mut Database) -> tandem_store::Result<T>,
    ) -> std::result::Result<T, StoreError> {
        let mut db = self
            .db
            .lock()
            .map_err(|e| StoreError::Io(std::io::Error::other(format!("store lock poisoned: {e}"))))?;
        f(&mut db)
    }

    /// Resolve a participant through the external directory.
    pub fn participant(&self, id: ParticipantId) -> Result<Participant> {
        self.directory.resolve(id)
    }

    // ------------------------------------------------------------------
    // Conversations
    // ------------------------------------------------------------------

    /// Return the active conversation for the pair, creating it on first
    /// contact.
    pub fn create_or_get_conversation(
        &self,
        member_id: ParticipantId,
        counterpart_id: ParticipantId,
    ) -> Result<Conversation> {
        if member_id == counterpart_id {
            return Err(ChatError::ValidationFailed(
                "a conversation needs two distinct participants".into(),
            ));
        }

        self.directory.resolve(member_id)?;
        let counterpart = self.directory.resolve(counterpart_id)?;
        if counterpart.role != Role::Counterpart {
            return Err(ChatError::NotFound(format!(
                "counterpart {counterpart_id} not found"
            )));
        }

        let (conversation, created) = self
            .with_db(|db| db.create_or_get_conversation(member_id, counterpart_id))
            .map_err(internal)?;

        if created {
            info!(
                conversation = %conversation.id,
                member = %member_id,
                counterpart = %counterpart_id,
                "Conversation created"
            );
        }
        Ok(conversation)
    }

    /// Fetch a conversation the requester may read.
    pub fn get_conversation(
        &self,
        conversation_id: ConversationId,
        requester: &Participant,
    ) -> Result<Conversation> {
        let conversation = self.load_conversation(conversation_id)?;
        authorize(&conversation, requester)?;
        Ok(conversation)
    }

    /// Active conversations of the requester, most recent first.
    pub fn list_conversations(&self, requester: ParticipantId) -> Result<Vec<Conversation>> {
        self.with_db(|db| db.list_active_conversations_for(requester))
            .map_err(internal)
    }

    /// Moderator listing of every active conversation.
    pub fn list_for_moderation(&self, requester: &Participant) -> Result<Vec<Conversation>> {
        require_moderator(requester)?;
        self.with_db(|db| db.list_active_conversations())
            .map_err(internal)
    }

    /// Terminal transition to `closed`. Moderators only.
    pub fn close_conversation(
        &self,
        conversation_id: ConversationId,
        requester: &Participant,
    ) -> Result<Conversation> {
        require_moderator(requester)?;
        let conversation = self
            .with_db(|db| db.set_conversation_status(conversation_id, ConversationStatus::Closed))
            .map_err(not_found("conversation", conversation_id))?;

        info!(conversation = %conversation_id, moderator = %requester.id, "Conversation closed");
        Ok(conversation)
    }

    // ------------------------------------------------------------------
    // Messages
    // ------------------------------------------------------------------

    /// Persist a message from `sender_id`. The receiver is the other side of
    /// the conversation.
    ///
    /// When `client_message_id` names a message this sender already stored
    /// in this conversation, that message is returned unchanged.
    pub fn create_message(
        &self,
        conversation_id: ConversationId,
        sender_id: ParticipantId,
        content: String,
        kind: MessageKind,
        attachment: Option<AttachmentRef>,
        client_message_id: Option<MessageId>,
    ) -> Result<CreatedMessage> {
        let conversation = self.load_conversation(conversation_id)?;

        let receiver_id = conversation.other_side(sender_id).ok_or_else(|| {
            ChatError::Forbidden(format!(
                "{sender_id} is not a participant of conversation {conversation_id}"
            ))
        })?;

        if let Some(id) = client_message_id {
            if let Some(existing) = self.with_db(|db| db.find_message(id)).map_err(internal)? {
                if existing.conversation_id == conversation_id && existing.sender_id == sender_id {
                    debug!(message = %id, "Duplicate send, returning stored message");
                    return Ok(CreatedMessage {
                        message: existing,
                        is_new: false,
                    });
                }
                return Err(ChatError::ValidationFailed(format!(
                    "message id {id} is already in use"
                )));
            }
        }

        if !conversation.is_active() {
            return Err(ChatError::Forbidden(format!(
                "conversation {conversation_id} is {}",
                conversation.status.as_str()
            )));
        }

        validate_payload(&content, kind, attachment.as_ref())?;

        let message = Message {
            id: client_message_id.unwrap_or_default(),
            content,
            kind,
            is_read: false,
            attachment,
            sender_id,
            receiver_id,
            conversation_id,
            created_at: Utc::now().trunc_subsecs(6),
        };

        self.with_db(|db| db.insert_message(&message))
            .map_err(not_found("conversation", conversation_id))?;

        debug!(
            message = %message.id,
            conversation = %conversation_id,
            sender = %sender_id,
            "Message persisted"
        );
        Ok(CreatedMessage {
            message,
            is_new: true,
        })
    }

    /// Every message of the conversation, oldest first.
    pub fn list_messages(
        &self,
        conversation_id: ConversationId,
        requester: &Participant,
    ) -> Result<Vec<Message>> {
        self.recent_messages(conversation_id, requester, None)
    }

    /// The newest `limit` messages of the conversation, oldest first.
    pub fn recent_messages(
        &self,
        conversation_id: ConversationId,
        requester: &Participant,
        limit: Option<usize>,
    ) -> Result<Vec<Message>> {
        let conversation = self.load_conversation(conversation_id)?;
        authorize(&conversation, requester)?;
        self.with_db(|db| db.list_messages(conversation_id, limit))
            .map_err(internal)
    }

    pub fn get_message(&self, message_id: MessageId) -> Result<Message> {
        self.with_db(|db| db.get_message(message_id))
            .map_err(not_found("message", message_id))
    }

    /// Mark one message of `conversation_id` read. Only its receiver may do
    /// so; repeating the call is a no-op. Nothing is written unless every
    /// check passes.
    pub fn mark_message_read(
        &self,
        conversation_id: ConversationId,
        message_id: MessageId,
        requester_id: ParticipantId,
    ) -> Result<ReadOutcome> {
        let mut message = self.get_message(message_id)?;

        if message.conversation_id != conversation_id {
            return Err(ChatError::ValidationFailed(format!(
                "message {message_id} does not belong to conversation {conversation_id}"
            )));
        }
        if message.receiver_id != requester_id {
            return Err(ChatError::Forbidden(format!(
                "message {message_id} is not addressed to {requester_id}"
            )));
        }

        if message.is_read {
            return Ok(ReadOutcome {
                message,
                changed: false,
            });
        }

        let changed = self
            .with_db(|db| db.mark_message_read(message_id))
            .map_err(internal)?;
        message.is_read = true;
        Ok(ReadOutcome { message, changed })
    }

    /// Mark every unread message addressed to the requester in one
    /// conversation. Returns the ids that changed.
    pub fn mark_conversation_read(
        &self,
        conversation_id: ConversationId,
        requester_id: ParticipantId,
    ) -> Result<Vec<MessageId>> {
        let conversation = self.load_conversation(conversation_id)?;
        if !conversation.is_participant(requester_id) {
            return Err(forbidden(requester_id, conversation_id));
        }
        self.with_db(|db| db.mark_conversation_read(conversation_id, requester_id))
            .map_err(internal)
    }

    pub fn unread_count(&self, requester_id: ParticipantId) -> Result<u64> {
        self.with_db(|db| db.count_unread(requester_id))
            .map_err(internal)
    }

    /// Toggle the requester's side-specific typing flag.
    pub fn set_typing(
        &self,
        conversation_id: ConversationId,
        requester_id: ParticipantId,
        is_typing: bool,
    ) -> Result<()> {
        let conversation = self.load_conversation(conversation_id)?;
        let side = conversation
            .side_of(requester_id)
            .ok_or_else(|| forbidden(requester_id, conversation_id))?;

        self.with_db(|db| db.set_typing(conversation_id, side, is_typing))
            .map_err(not_found("conversation", conversation_id))
    }

    fn load_conversation(&self, conversation_id: ConversationId) -> Result<Conversation> {
        self.with_db(|db| db.get_conversation(conversation_id))
            .map_err(not_found("conversation", conversation_id))
    }
}

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

/// Members and counterparts may act only on their own conversations;
/// moderators may read any.
pub fn authorize(conversation: &Conversation, requester: &Participant) -> Result<()> {
    if requester.is_moderator() || conversation.is_participant(requester.id) {
        Ok(())
    } else {
        Err(forbidden(requester.id, conversation.id))
    }
}

fn require_moderator(requester: &Participant) -> Result<()> {
    if requester.is_moderator() {
        Ok(())
    } else {
        Err(ChatError::Forbidden("moderator role required".into()))
    }
}

fn validate_payload(
    content: &str,
    kind: MessageKind,
    attachment: Option<&AttachmentRef>,
) -> Result<()> {
    if kind == MessageKind::System {
        return Err(ChatError::ValidationFailed(
            "system messages cannot be sent by participants".into(),
        ));
    }
    if content.chars().count() > MAX_MESSAGE_CHARS {
        return Err(ChatError::ValidationFailed(format!(
            "content exceeds {MAX_MESSAGE_CHARS} characters"
        )));
    }
    if kind == MessageKind::Text && content.trim().is_empty() {
        return Err(ChatError::ValidationFailed("text message is empty".into()));
    }
    if kind.needs_attachment() && attachment.is_none() {
        return Err(ChatError::ValidationFailed(format!(
            "{} message needs an attachment",
            kind.as_str()
        )));
    }
    Ok(())
}

fn forbidden(requester: ParticipantId, conversation: ConversationId) -> ChatError {
    ChatError::Forbidden(format!(
        "{requester} is not a participant of conversation {conversation}"
    ))
}

fn not_found(what: &'static str, id: impl std::fmt::Display) -> impl Fn(StoreError) -> ChatError {
    let label = format!("{what} {id} not found");
    move |e| match e {
        StoreError::NotFound => ChatError::NotFound(label.clone()),
        other => internal(other),
    }
}

fn internal(e: StoreError) -> ChatError {
    tracing::error!(error = %e, "store failure");
    ChatError::Internal(e.to_string())
}
