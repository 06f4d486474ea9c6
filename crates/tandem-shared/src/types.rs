use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::constants::{PREVIEW_ELLIPSIS, PREVIEW_MAX_CHARS};

macro_rules! uuid_id {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn parse(s: &str) -> Result<Self, uuid::Error> {
                Uuid::parse_str(s).map(Self)
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }
    };
}

uuid_id!(ParticipantId);
uuid_id!(ConversationId);
uuid_id!(MessageId);

// ---------------------------------------------------------------------------
// Participant
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Member,
    Counterpart,
    Moderator,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Member => "member",
            Role::Counterpart => "counterpart",
            Role::Moderator => "moderator",
        }
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "member" => Ok(Role::Member),
            "counterpart" => Ok(Role::Counterpart),
            "moderator" => Ok(Role::Moderator),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An authenticated principal. Owned by the auth collaborator; only read here.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub id: ParticipantId,
    pub role: Role,
    pub display_name: Option<String>,
}

impl Participant {
    pub fn new(id: ParticipantId, role: Role) -> Self {
        Self {
            id,
            role,
            display_name: None,
        }
    }

    pub fn is_moderator(&self) -> bool {
        self.role == Role::Moderator
    }

    pub fn summary(&self) -> ParticipantSummary {
        ParticipantSummary {
            id: self.id,
            role: self.role,
            display_name: self.display_name.clone(),
        }
    }
}

/// Sender information attached to broadcast messages.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantSummary {
    pub id: ParticipantId,
    pub role: Role,
    pub display_name: Option<String>,
}

// ---------------------------------------------------------------------------
// Conversation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ConversationStatus {
    Active,
    Archived,
    Closed,
}

impl ConversationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationStatus::Active => "active",
            ConversationStatus::Archived => "archived",
            ConversationStatus::Closed => "closed",
        }
    }
}

impl FromStr for ConversationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(ConversationStatus::Active),
            "archived" => Ok(ConversationStatus::Archived),
            "closed" => Ok(ConversationStatus::Closed),
            other => Err(format!("unknown conversation status: {other}")),
        }
    }
}

/// Which side of a conversation a participant is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Member,
    Counterpart,
}

/// A one-to-one conversation between a member and a counterpart.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: ConversationId,
    pub member_id: ParticipantId,
    pub counterpart_id: ParticipantId,
    pub status: ConversationStatus,
    pub member_typing: bool,
    pub counterpart_typing: bool,
    pub last_message_at: Option<DateTime<Utc>>,
    pub last_message_preview: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Conversation {
    pub fn side_of(&self, participant: ParticipantId) -> Option<Side> {
        if participant == self.member_id {
            Some(Side::Member)
        } else if participant == self.counterpart_id {
            Some(Side::Counterpart)
        } else {
            None
        }
    }

    pub fn is_participant(&self, participant: ParticipantId) -> bool {
        self.side_of(participant).is_some()
    }

    /// The participant on the other side from `participant`, if they are in
    /// this conversation at all.
    pub fn other_side(&self, participant: ParticipantId) -> Option<ParticipantId> {
        match self.side_of(participant)? {
            Side::Member => Some(self.counterpart_id),
            Side::Counterpart => Some(self.member_id),
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == ConversationStatus::Active
    }
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    #[default]
    Text,
    Image,
    File,
    System,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Text => "text",
            MessageKind::Image => "image",
            MessageKind::File => "file",
            MessageKind::System => "system",
        }
    }

    pub fn needs_attachment(&self) -> bool {
        matches!(self, MessageKind::Image | MessageKind::File)
    }
}

impl FromStr for MessageKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(MessageKind::Text),
            "image" => Ok(MessageKind::Image),
            "file" => Ok(MessageKind::File),
            "system" => Ok(MessageKind::System),
            other => Err(format!("unknown message kind: {other}")),
        }
    }
}

/// Opaque reference to an uploaded attachment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AttachmentRef {
    pub url: String,
    pub name: String,
}

/// A persisted message. Immutable except for `is_read`, which only goes
/// from false to true.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub content: String,
    pub kind: MessageKind,
    pub is_read: bool,
    pub attachment: Option<AttachmentRef>,
    pub sender_id: ParticipantId,
    pub receiver_id: ParticipantId,
    pub conversation_id: ConversationId,
    pub created_at: DateTime<Utc>,
}

/// Short form of a message used in out-of-room notifications.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MessageSummary {
    pub id: MessageId,
    pub preview: String,
    pub kind: MessageKind,
    pub sender: ParticipantSummary,
    pub created_at: DateTime<Utc>,
}

/// Truncate message content for conversation listings.
pub fn preview(content: &str) -> String {
    if content.chars().count() > PREVIEW_MAX_CHARS {
        let mut out: String = content.chars().take(PREVIEW_MAX_CHARS).collect();
        out.push_str(PREVIEW_ELLIPSIS);
        out
    } else {
        content.to_string()
    }
}
