//! Realtime link to the gateway.
//!
//! [`GatewayTransport`] keeps one WebSocket open in a background task,
//! reconnecting with exponential backoff. Sends are correlated with their
//! `sent`/`error` reply by client message id; every inbound event is also
//! republished on a broadcast channel for the UI and the send queue.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use tandem_shared::{ChatError, ClientEvent, ConversationId, Message, MessageId, ServerEvent};

use crate::connectivity::Connectivity;
use crate::error::TransportError;
use crate::queue::MessageDraft;

const RECONNECT_MIN: Duration = Duration::from_millis(500);
const RECONNECT_MAX: Duration = Duration::from_secs(30);
const EVENT_BUFFER: usize = 256;

/// Server acknowledgement of a persisted message.
#[derive(Debug, Clone, PartialEq)]
pub struct SendReceipt {
    pub message: Message,
    /// A live session of the receiver was handed the message.
    pub delivered: bool,
}

/// What the send queue needs from the network.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send_message(&self, draft: &MessageDraft) -> Result<SendReceipt, TransportError>;

    async fn set_typing(
        &self,
        conversation_id: ConversationId,
        is_typing: bool,
    ) -> Result<(), TransportError>;
}

type Reply = Result<SendReceipt, TransportError>;

struct Shared {
    writer: Mutex<Option<mpsc::UnboundedSender<String>>>,
    pending: Mutex<HashMap<MessageId, oneshot::Sender<Reply>>>,
    rooms: Mutex<HashSet<ConversationId>>,
    events: broadcast::Sender<ServerEvent>,
    connectivity: Connectivity,
}

/// Poisoning only means another task panicked mid-update of a plain map.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Shared {
    fn write(&self, event: &ClientEvent) -> Result<(), TransportError> {
        let text = event
            .to_json()
            .map_err(|e| TransportError::Protocol(e.to_string()))?;
        match lock(&self.writer).as_ref() {
            Some(tx) if tx.send(text).is_ok() => Ok(()),
            _ => Err(TransportError::NotConnected),
        }
    }

    fn complete(&self, id: MessageId, reply: Reply) {
        match lock(&self.pending).remove(&id) {
            Some(tx) => {
                let _ = tx.send(reply);
            }
            None => debug!(message = %id, "Reply for a send nobody is waiting on"),
        }
    }

    fn dispatch(&self, event: ServerEvent) {
        match &event {
            ServerEvent::Sent {
                client_message_id: Some(id),
                message,
                delivered,
            } => self.complete(
                *id,
                Ok(SendReceipt {
                    message: message.clone(),
                    delivered: *delivered,
                }),
            ),
            ServerEvent::Error {
                code,
                message,
                client_message_id: Some(id),
            } => self.complete(
                *id,
                Err(TransportError::Rejected(ChatError::from_code(
                    *code,
                    message.clone(),
                ))),
            ),
            ServerEvent::Error { message, .. } => warn!(error = %message, "Gateway error"),
            _ => {}
        }
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn fail_pending(&self) {
        let pending: Vec<_> = lock(&self.pending).drain().collect();
        for (_, tx) in pending {
            let _ = tx.send(Err(TransportError::Connection(
                "connection lost before acknowledgement".into(),
            )));
        }
    }
}

/// Removes the pending entry if the caller stops waiting (timeout).
struct PendingGuard<'a> {
    shared: &'a Shared,
    id: MessageId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        lock(&self.shared.pending).remove(&self.id);
    }
}

#[derive(Clone)]
pub struct GatewayTransport {
    shared: Arc<Shared>,
}

impl GatewayTransport {
    /// Start the connection task. Connectivity follows the socket.
    pub fn spawn(url: String, connectivity: Connectivity) -> (Self, JoinHandle<()>) {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let shared = Arc::new(Shared {
            writer: Mutex::new(None),
            pending: Mutex::new(HashMap::new()),
            rooms: Mutex::new(HashSet::new()),
            events,
            connectivity,
        });
        let task = tokio::spawn(connection_loop(url, shared.clone()));
        (Self { shared }, task)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.shared.events.subscribe()
    }

    /// Join a room. Joined rooms are rejoined after every reconnect.
    pub fn join(&self, conversation_id: ConversationId) -> Result<(), TransportError> {
        lock(&self.shared.rooms).insert(conversation_id);
        self.shared.write(&ClientEvent::Join { conversation_id })
    }

    pub fn leave(&self, conversation_id: ConversationId) -> Result<(), TransportError> {
        lock(&self.shared.rooms).remove(&conversation_id);
        self.shared.write(&ClientEvent::Leave { conversation_id })
    }

    pub fn mark_read(
        &self,
        message_id: MessageId,
        conversation_id: ConversationId,
    ) -> Result<(), TransportError> {
        self.shared.write(&ClientEvent::Read {
            message_id,
            conversation_id,
        })
    }
}

#[async_trait]
impl Transport for GatewayTransport {
    async fn send_message(&self, draft: &MessageDraft) -> Result<SendReceipt, TransportError> {
        let id = draft.client_message_id;
        let (tx, rx) = oneshot::channel();
        lock(&self.shared.pending).insert(id, tx);
        let _guard = PendingGuard {
            shared: &self.shared,
            id,
        };

        self.shared.write(&ClientEvent::Send {
            conversation_id: draft.conversation_id,
            content: draft.content.clone(),
            kind: draft.kind,
            attachment: draft.attachment.clone(),
            client_message_id: Some(id),
        })?;

        rx.await.unwrap_or_else(|_| {
            Err(TransportError::Connection(
                "connection closed before acknowledgement".into(),
            ))
        })
    }

    async fn set_typing(
        &self,
        conversation_id: ConversationId,
        is_typing: bool,
    ) -> Result<(), TransportError> {
        self.shared.write(&ClientEvent::Typing {
            conversation_id,
            is_typing,
        })
    }
}

async fn connection_loop(url: String, shared: Arc<Shared>) {
    let mut backoff = RECONNECT_MIN;
    loop {
        match tokio_tungstenite::connect_async(url.as_str()).await {
            Ok((stream, _)) => {
                info!("Connected to gateway");
                backoff = RECONNECT_MIN;

                let (tx, rx) = mpsc::unbounded_channel();
                let rooms: Vec<ConversationId> = lock(&shared.rooms).iter().copied().collect();
                for conversation_id in rooms {
                    if let Ok(text) = (ClientEvent::Join { conversation_id }).to_json() {
                        let _ = tx.send(text);
                    }
                }
                *lock(&shared.writer) = Some(tx);
                shared.connectivity.set_online(true);

                pump(stream, rx, &shared).await;

                *lock(&shared.writer) = None;
                shared.connectivity.set_online(false);
                shared.fail_pending();
                warn!("Gateway connection lost");
            }
            Err(e) => debug!(error = %e, retry_in = ?backoff, "Gateway connect failed"),
        }
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(RECONNECT_MAX);
    }
}

type GatewayStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn pump(
    stream: GatewayStream,
    mut outgoing: mpsc::UnboundedReceiver<String>,
    shared: &Shared,
) {
    let (mut sink, mut source) = stream.split();
    loop {
        tokio::select! {
            out = outgoing.recv() => {
                let Some(text) = out else { break };
                if sink.send(WsMessage::Text(text)).await.is_err() {
                    break;
                }
            }
            incoming = source.next() => match incoming {
                Some(Ok(WsMessage::Text(text))) => match ServerEvent::from_json(&text) {
                    Ok(event) => shared.dispatch(event),
                    Err(e) => warn!(error = %e, "Undecodable gateway frame"),
                },
                Some(Ok(WsMessage::Close(_))) | None => break,
                Some(Err(e)) => {
                    debug!(error = %e, "Gateway read failed");
                    break;
                }
                Some(Ok(_)) => {}
            }
        }
    }
}
