//! Live session and room membership.
//!
//! A session is one connected client. Each session belongs to one
//! participant, receives events through its own unbounded channel, and may
//! join any number of conversation rooms. A participant can hold several
//! sessions at once (phone and laptop).
//!
//! [`InMemorySessionRegistry`] only sees sessions connected to this process.
//! Running several gateway instances needs an implementation whose
//! `broadcast_room` and `notify_outside_room` publish to a shared pub/sub
//! fanout that every instance subscribes to; callers do not change.

use std::collections::{HashMap, HashSet};
use std::fmt;

use async_trait::async_trait;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info};
use uuid::Uuid;

use tandem_shared::{ConversationId, Participant, ParticipantId, ServerEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(pub Uuid);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Sending half of a connected session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub id: SessionId,
    pub participant: Participant,
    tx: mpsc::UnboundedSender<ServerEvent>,
}

impl SessionHandle {
    pub fn new(participant: Participant) -> (Self, mpsc::UnboundedReceiver<ServerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = Self {
            id: SessionId(Uuid::new_v4()),
            participant,
            tx,
        };
        (handle, rx)
    }

    /// Queue an event for this session. Returns `false` once the
    /// connection task has gone away.
    pub fn send(&self, event: ServerEvent) -> bool {
        self.tx.send(event).is_ok()
    }
}

#[async_trait]
pub trait SessionRegistry: Send + Sync {
    async fn register(&self, session: SessionHandle);

    /// Forget a session. Returns the rooms it was still joined to.
    async fn unregister(&self, session: SessionId) -> Vec<ConversationId>;

    /// Returns `false` if the session is unknown.
    async fn join_room(&self, conversation: ConversationId, session: SessionId) -> bool;

    /// Returns `true` if the session was in the room.
    async fn leave_room(&self, conversation: ConversationId, session: SessionId) -> bool;

    /// Send to every session in the room except `exclude`. Returns how many
    /// sessions were handed the event.
    async fn broadcast_room(
        &self,
        conversation: ConversationId,
        event: &ServerEvent,
        exclude: Option<SessionId>,
    ) -> usize;

    /// Send on the participant's personal channel, to each of their sessions
    /// that has not joined `conversation`.
    async fn notify_outside_room(
        &self,
        participant: ParticipantId,
        conversation: ConversationId,
        event: &ServerEvent,
    ) -> usize;

    async fn send_to_session(&self, session: SessionId, event: ServerEvent) -> bool;

    /// Personal channel, every session of the participant.
    async fn send_to_participant(&self, participant: ParticipantId, event: &ServerEvent) -> usize;

    async fn is_connected(&self, participant: ParticipantId) -> bool;

    /// Whether any session of the participant has joined the room.
    async fn is_in_room(&self, participant: ParticipantId, conversation: ConversationId) -> bool;

    async fn session_count(&self) -> usize;
}

struct SessionEntry {
    handle: SessionHandle,
    rooms: HashSet<ConversationId>,
}

#[derive(Default)]
struct RegistryState {
    sessions: HashMap<SessionId, SessionEntry>,
    by_participant: HashMap<ParticipantId, HashSet<SessionId>>,
    rooms: HashMap<ConversationId, HashSet<SessionId>>,
}

#[derive(Default)]
pub struct InMemorySessionRegistry {
    state: RwLock<RegistryState>,
}

impl InMemorySessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionRegistry for InMemorySessionRegistry {
    async fn register(&self, session: SessionHandle) {
        let mut state = self.state.write().await;
        let id = session.id;
        let participant = session.participant.id;
        state
            .by_participant
            .entry(participant)
            .or_default()
            .insert(id);
        state.sessions.insert(
            id,
            SessionEntry {
                handle: session,
                rooms: HashSet::new(),
            },
        );
        info!(
            session = %id,
            participant = %participant,
            sessions = state.sessions.len(),
            "Session registered"
        );
    }

    async fn unregister(&self, session: SessionId) -> Vec<ConversationId> {
        let mut state = self.state.write().await;
        let Some(entry) = state.sessions.remove(&session) else {
            return Vec::new();
        };

        let participant = entry.handle.participant.id;
        let now_empty = match state.by_participant.get_mut(&participant) {
            Some(set) => {
                set.remove(&session);
                set.is_empty()
            }
            None => false,
        };
        if now_empty {
            state.by_participant.remove(&participant);
        }

        let rooms: Vec<ConversationId> = entry.rooms.into_iter().collect();
        for room in &rooms {
            remove_from_room(&mut state.rooms, *room, session);
        }

        info!(
            session = %session,
            participant = %participant,
            rooms = rooms.len(),
            "Session unregistered"
        );
        rooms
    }

    async fn join_room(&self, conversation: ConversationId, session: SessionId) -> bool {
        let mut state = self.state.write().await;
        let Some(entry) = state.sessions.get_mut(&session) else {
            return false;
        };
        entry.rooms.insert(conversation);
        let members = state.rooms.entry(conversation).or_default();
        members.insert(session);
        debug!(
            room = %conversation,
            session = %session,
            members = members.len(),
            "Session joined room"
        );
        true
    }

    async fn leave_room(&self, conversation: ConversationId, session: SessionId) -> bool {
        let mut state = self.state.write().await;
        let was_member = state
            .sessions
            .get_mut(&session)
            .map(|entry| entry.rooms.remove(&conversation))
            .unwrap_or(false);
        remove_from_room(&mut state.rooms, conversation, session);
        was_member
    }

    async fn broadcast_room(
        &self,
        conversation: ConversationId,
        event: &ServerEvent,
        exclude: Option<SessionId>,
    ) -> usize {
        let state = self.state.read().await;
        let Some(members) = state.rooms.get(&conversation) else {
            return 0;
        };

        let mut delivered = 0;
        for id in members {
            if Some(*id) == exclude {
                continue;
            }
            let Some(entry) = state.sessions.get(id) else {
                continue;
            };
            if entry.handle.send(event.clone()) {
                delivered += 1;
            } else {
                debug!(room = %conversation, session = %id, "Dropping event for closed session");
            }
        }
        delivered
    }

    async fn notify_outside_room(
        &self,
        participant: ParticipantId,
        conversation: ConversationId,
        event: &ServerEvent,
    ) -> usize {
        let state = self.state.read().await;
        let Some(sessions) = state.by_participant.get(&participant) else {
            return 0;
        };

        sessions
            .iter()
            .filter_map(|id| state.sessions.get(id))
            .filter(|entry| !entry.rooms.contains(&conversation))
            .filter(|entry| entry.handle.send(event.clone()))
            .count()
    }

    async fn send_to_session(&self, session: SessionId, event: ServerEvent) -> bool {
        let state = self.state.read().await;
        state
            .sessions
            .get(&session)
            .map(|entry| entry.handle.send(event))
            .unwrap_or(false)
    }

    async fn send_to_participant(&self, participant: ParticipantId, event: &ServerEvent) -> usize {
        let state = self.state.read().await;
        let Some(sessions) = state.by_participant.get(&participant) else {
            return 0;
        };
        sessions
            .iter()
            .filter_map(|id| state.sessions.get(id))
            .filter(|entry| entry.handle.send(event.clone()))
            .count()
    }

    async fn is_connected(&self, participant: ParticipantId) -> bool {
        self.state
            .read()
            .await
            .by_participant
            .get(&participant)
            .is_some_and(|set| !set.is_empty())
    }

    async fn is_in_room(&self, participant: ParticipantId, conversation: ConversationId) -> bool {
        let state = self.state.read().await;
        state.rooms.get(&conversation).is_some_and(|members| {
            members.iter().any(|id| {
                state
                    .sessions
                    .get(id)
                    .is_some_and(|entry| entry.handle.participant.id == participant)
            })
        })
    }

    async fn session_count(&self) -> usize {
        self.state.read().await.sessions.len()
    }
}

/// Drop a session from a room, removing the room once empty.
fn remove_from_room(
    rooms: &mut HashMap<ConversationId, HashSet<SessionId>>,
    conversation: ConversationId,
    session: SessionId,
) {
    let now_empty = match rooms.get_mut(&conversation) {
        Some(members) => {
            members.remove(&session);
            members.is_empty()
        }
        None => false,
    };
    if now_empty {
        rooms.remove(&conversation);
        debug!(room = %conversation, "Removed empty room");
    }
}
