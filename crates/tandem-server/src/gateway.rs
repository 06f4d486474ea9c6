//! Realtime gateway.
//!
//! Every inbound [`ClientEvent`] goes through [`Gateway::dispatch`], which
//! validates it against the conversation service and returns the list of
//! [`Delivery`] actions it implies. Nothing reaches the registry until
//! dispatch has succeeded, so a failed event produces only an `error` reply
//! to its caller.
//!
//! Events for one conversation are handled one at a time (see
//! [`ConversationSequencer`]), which keeps room broadcast order equal to
//! persistence order. Different conversations proceed concurrently.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use tandem_shared::error::Result;
use tandem_shared::{
    ChatError, ClientEvent, ConversationId, Message, MessageId, MessageSummary, Participant,
    ParticipantId, PresenceState, ServerEvent,
};

use crate::push::{PushIntent, PushSink};
use crate::registry::{SessionHandle, SessionId, SessionRegistry};
use crate::service::ConversationService;

/// Who an event came from. REST calls have no session.
#[derive(Debug, Clone)]
pub struct Origin {
    pub participant: Participant,
    pub session: Option<SessionId>,
}

impl Origin {
    pub fn detached(participant: Participant) -> Self {
        Self {
            participant,
            session: None,
        }
    }
}

impl From<&SessionHandle> for Origin {
    fn from(session: &SessionHandle) -> Self {
        Self {
            participant: session.participant.clone(),
            session: Some(session.id),
        }
    }
}

/// One effect of a successfully dispatched event.
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    /// To the originating session only.
    Reply(ServerEvent),
    Room {
        conversation: ConversationId,
        event: ServerEvent,
        exclude: Option<SessionId>,
    },
    /// Personal channel, sessions not joined to `conversation`.
    Notify {
        participant: ParticipantId,
        conversation: ConversationId,
        event: ServerEvent,
    },
    /// Personal channel, every session of `participant`.
    Direct {
        participant: ParticipantId,
        event: ServerEvent,
    },
    Push(PushIntent),
    JoinRoom(ConversationId),
    LeaveRoom(ConversationId),
}

/// Per-conversation mutual exclusion for the persist-then-broadcast step.
#[derive(Default)]
pub struct ConversationSequencer {
    locks: Mutex<HashMap<ConversationId, Arc<Mutex<()>>>>,
}

impl ConversationSequencer {
    pub async fn lock_for(&self, conversation: ConversationId) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .await
            .entry(conversation)
            .or_default()
            .clone()
    }

    /// Drop locks nobody holds. Returns how many were removed.
    pub async fn prune(&self) -> usize {
        let mut locks = self.locks.lock().await;
        let before = locks.len();
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        before - locks.len()
    }

    #[cfg(test)]
    async fn len(&self) -> usize {
        self.locks.lock().await.len()
    }
}

pub struct Gateway {
    service: Arc<ConversationService>,
    registry: Arc<dyn SessionRegistry>,
    push: Arc<dyn PushSink>,
    history_limit: usize,
    sequencer: ConversationSequencer,
}

impl Gateway {
    pub fn new(
        service: Arc<ConversationService>,
        registry: Arc<dyn SessionRegistry>,
        push: Arc<dyn PushSink>,
        history_limit: usize,
    ) -> Self {
        Self {
            service,
            registry,
            push,
            history_limit,
            sequencer: ConversationSequencer::default(),
        }
    }

    pub fn registry(&self) -> &Arc<dyn SessionRegistry> {
        &self.registry
    }

    pub fn sequencer(&self) -> &ConversationSequencer {
        &self.sequencer
    }

    // ------------------------------------------------------------------
    // Connection lifecycle
    // ------------------------------------------------------------------

    /// Register a new session. Its personal channel is live immediately.
    pub async fn connect(
        &self,
        participant: Participant,
    ) -> (SessionHandle, mpsc::UnboundedReceiver<ServerEvent>) {
        let (session, rx) = SessionHandle::new(participant);
        self.registry.register(session.clone()).await;
        (session, rx)
    }

    /// Remove the session and tell every room it was in.
    pub async fn disconnect(&self, session: &SessionHandle) {
        let rooms = self.registry.unregister(session.id).await;
        for conversation in rooms {
            let event = ServerEvent::Presence {
                conversation_id: conversation,
                participant_id: session.participant.id,
                state: PresenceState::Left,
            };
            self.registry.broadcast_room(conversation, &event, None).await;
        }
    }

    // ------------------------------------------------------------------
    // Event handling
    // ------------------------------------------------------------------

    /// Handle an event from a live session. Failures are reported to that
    /// session as an `error` event.
    pub async fn handle(&self, session: &SessionHandle, event: ClientEvent) {
        let origin = Origin::from(session);
        let client_message_id = match &event {
            ClientEvent::Send {
                client_message_id, ..
            } => *client_message_id,
            _ => None,
        };
        let name = event.name();

        if let Err(err) = self.perform(&origin, event).await {
            warn!(
                session = %session.id,
                participant = %session.participant.id,
                event = name,
                error = %err,
                "Event rejected"
            );
            self.registry
                .send_to_session(session.id, ServerEvent::error(&err, client_message_id))
                .await;
        }
    }

    /// Dispatch and execute one event under its conversation's lock.
    ///
    /// Replies are sent to the origin session; for a detached origin they
    /// are returned instead.
    pub async fn perform(&self, origin: &Origin, event: ClientEvent) -> Result<Vec<ServerEvent>> {
        // A read is sequenced with the conversation its message lives in.
        let conversation = match &event {
            ClientEvent::Read { message_id, .. } => {
                self.service.get_message(*message_id)?.conversation_id
            }
            other => other.conversation_id(),
        };
        let lock = self.sequencer.lock_for(conversation).await;
        let _guard = lock.lock().await;

        let deliveries = self.dispatch(origin, event).await?;
        Ok(self.execute(origin, deliveries).await)
    }

    /// Mark one message read when only its id is known, and broadcast the
    /// receipt to its conversation's room.
    pub async fn read_message(&self, origin: &Origin, message_id: MessageId) -> Result<Message> {
        let conversation = self.service.get_message(message_id)?.conversation_id;
        let lock = self.sequencer.lock_for(conversation).await;
        let _guard = lock.lock().await;

        let outcome = self
            .service
            .mark_message_read(conversation, message_id, origin.participant.id)?;
        let receipt = Delivery::Room {
            conversation,
            event: ServerEvent::ReadReceipt {
                message_id,
                conversation_id: conversation,
                reader_id: origin.participant.id,
            },
            exclude: None,
        };
        self.execute(origin, vec![receipt]).await;
        Ok(outcome.message)
    }

    /// Mark every unread message addressed to the origin read, and broadcast
    /// a receipt for each.
    pub async fn read_all(
        &self,
        origin: &Origin,
        conversation: ConversationId,
    ) -> Result<Vec<MessageId>> {
        let lock = self.sequencer.lock_for(conversation).await;
        let _guard = lock.lock().await;

        let ids = self
            .service
            .mark_conversation_read(conversation, origin.participant.id)?;
        let deliveries = ids
            .iter()
            .map(|id| Delivery::Room {
                conversation,
                event: ServerEvent::ReadReceipt {
                    message_id: *id,
                    conversation_id: conversation,
                    reader_id: origin.participant.id,
                },
                exclude: None,
            })
            .collect();
        self.execute(origin, deliveries).await;
        Ok(ids)
    }

    /// Validate an event and work out who must hear about it.
    pub async fn dispatch(&self, origin: &Origin, event: ClientEvent) -> Result<Vec<Delivery>> {
        let requester = &origin.participant;
        debug!(participant = %requester.id, event = event.name(), "Dispatching");

        match event {
            ClientEvent::Join { conversation_id } => {
                let Some(session) = origin.session else {
                    return Err(ChatError::ValidationFailed(
                        "joining a room needs a live session".into(),
                    ));
                };
                let messages = self.service.recent_messages(
                    conversation_id,
                    requester,
                    Some(self.history_limit),
                )?;
                let receipts = delivery_receipts(conversation_id, requester.id, &messages);

                let mut deliveries = vec![
                    Delivery::JoinRoom(conversation_id),
                    Delivery::Reply(ServerEvent::History {
                        conversation_id,
                        messages,
                    }),
                    Delivery::Room {
                        conversation: conversation_id,
                        event: presence(conversation_id, requester.id, PresenceState::Joined),
                        exclude: Some(session),
                    },
                ];
                deliveries.extend(receipts);
                Ok(deliveries)
            }

            ClientEvent::Leave { conversation_id } => {
                self.service.get_conversation(conversation_id, requester)?;
                Ok(vec![
                    Delivery::LeaveRoom(conversation_id),
                    Delivery::Room {
                        conversation: conversation_id,
                        event: presence(conversation_id, requester.id, PresenceState::Left),
                        exclude: origin.session,
                    },
                ])
            }

            ClientEvent::Send {
                conversation_id,
                content,
                kind,
                attachment,
                client_message_id,
            } => {
                let created = self.service.create_message(
                    conversation_id,
                    requester.id,
                    content,
                    kind,
                    attachment,
                    client_message_id,
                )?;
                self.plan_message(requester, created.message, created.is_new, client_message_id)
                    .await
            }

            ClientEvent::Typing {
                conversation_id,
                is_typing,
            } => {
                self.service
                    .set_typing(conversation_id, requester.id, is_typing)?;
                Ok(vec![Delivery::Room {
                    conversation: conversation_id,
                    event: ServerEvent::TypingStatus {
                        conversation_id,
                        participant_id: requester.id,
                        is_typing,
                    },
                    exclude: origin.session,
                }])
            }

            ClientEvent::Read {
                message_id,
                conversation_id,
            } => {
                self.service
                    .mark_message_read(conversation_id, message_id, requester.id)?;
                Ok(vec![Delivery::Room {
                    conversation: conversation_id,
                    event: ServerEvent::ReadReceipt {
                        message_id,
                        conversation_id,
                        reader_id: requester.id,
                    },
                    exclude: None,
                }])
            }
        }
    }

    /// Deliveries for a persisted message: room broadcast, then either a
    /// personal-channel notification or a push intent for the receiver, then
    /// the sender's acknowledgement.
    async fn plan_message(
        &self,
        sender: &Participant,
        message: Message,
        is_new: bool,
        client_message_id: Option<MessageId>,
    ) -> Result<Vec<Delivery>> {
        let conversation = message.conversation_id;
        let receiver = message.receiver_id;
        let in_room = self.registry.is_in_room(receiver, conversation).await;
        let connected = in_room || self.registry.is_connected(receiver).await;

        let mut deliveries = Vec::new();
        if is_new {
            let summary = MessageSummary {
                id: message.id,
                preview: tandem_shared::preview(&message.content),
                kind: message.kind,
                sender: sender.summary(),
                created_at: message.created_at,
            };

            deliveries.push(Delivery::Room {
                conversation,
                event: ServerEvent::Message {
                    message: message.clone(),
                    sender: sender.summary(),
                },
                exclude: None,
            });

            if connected {
                deliveries.push(Delivery::Notify {
                    participant: receiver,
                    conversation,
                    event: ServerEvent::Notification {
                        conversation_id: conversation,
                        message: summary,
                    },
                });
            } else {
                deliveries.push(Delivery::Push(PushIntent {
                    recipient: receiver,
                    conversation_id: conversation,
                    message: summary,
                }));
            }
        }

        deliveries.push(Delivery::Reply(ServerEvent::Sent {
            client_message_id,
            message,
            delivered: connected,
        }));
        Ok(deliveries)
    }

    /// Apply deliveries in order. Returns replies that had no session to go to.
    async fn execute(&self, origin: &Origin, deliveries: Vec<Delivery>) -> Vec<ServerEvent> {
        let mut detached = Vec::new();
        for delivery in deliveries {
            match delivery {
                Delivery::Reply(event) => match origin.session {
                    Some(session) => {
                        self.registry.send_to_session(session, event).await;
                    }
                    None => detached.push(event),
                },
                Delivery::Room {
                    conversation,
                    event,
                    exclude,
                } => {
                    let n = self
                        .registry
                        .broadcast_room(conversation, &event, exclude)
                        .await;
                    debug!(room = %conversation, recipients = n, "Broadcast");
                }
                Delivery::Notify {
                    participant,
                    conversation,
                    event,
                } => {
                    self.registry
                        .notify_outside_room(participant, conversation, &event)
                        .await;
                }
                Delivery::Direct { participant, event } => {
                    let n = self.registry.send_to_participant(participant, &event).await;
                    debug!(participant = %participant, sessions = n, "Direct");
                }
                Delivery::Push(intent) => self.push.push(intent),
                Delivery::JoinRoom(conversation) => {
                    if let Some(session) = origin.session {
                        self.registry.join_room(conversation, session).await;
                    }
                }
                Delivery::LeaveRoom(conversation) => {
                    if let Some(session) = origin.session {
                        self.registry.leave_room(conversation, session).await;
                    }
                }
            }
        }
        detached
    }
}

/// Receipts for unread messages addressed to `recipient` that a history
/// replay has just handed over, one per sender.
fn delivery_receipts(
    conversation: ConversationId,
    recipient: ParticipantId,
    messages: &[Message],
) -> Vec<Delivery> {
    let mut by_sender: Vec<(ParticipantId, Vec<MessageId>)> = Vec::new();
    for message in messages
        .iter()
        .filter(|m| m.receiver_id == recipient && !m.is_read)
    {
        match by_sender.iter_mut().find(|(sender, _)| *sender == message.sender_id) {
            Some((_, ids)) => ids.push(message.id),
            None => by_sender.push((message.sender_id, vec![message.id])),
        }
    }

    by_sender
        .into_iter()
        .map(|(sender, message_ids)| Delivery::Direct {
            participant: sender,
            event: ServerEvent::DeliveryReceipt {
                conversation_id: conversation,
                message_ids,
                recipient_id: recipient,
            },
        })
        .collect()
}

fn presence(
    conversation: ConversationId,
    participant: ParticipantId,
    state: PresenceState,
) -> ServerEvent {
    ServerEvent::Presence {
        conversation_id: conversation,
        participant_id: participant,
        state,
    }
}
