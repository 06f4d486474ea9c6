//! Durable, ordered send queue.
//!
//! Outbound actions are appended to a FIFO and persisted before `enqueue`
//! returns. A single drain loop works the queue head-first: the head stays
//! in place while it is attempted, is removed only on success, and on a
//! retryable failure has its attempt count bumped and blocks everything
//! behind it until the next drain. After [`MAX_SEND_ATTEMPTS`] failures, or
//! on a server rejection, the item moves to the failed list and the drain
//! carries on with the next one.
//!
//! Drains are triggered by connectivity coming back, by new items, and by a
//! periodic tick (see [`SendQueue::spawn_worker`]).

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use tandem_shared::constants::{MAX_MESSAGE_CHARS, MAX_SEND_ATTEMPTS};
use tandem_shared::{
    AttachmentRef, ChatError, ConversationId, MessageId, MessageKind, OutboundStatus,
    ServerEvent, SyncStatus,
};

use crate::connectivity::Connectivity;
use crate::error::{ClientError, Result, TransportError};
use crate::events::QueueEvent;
use crate::persist::{QueueSnapshot, QueueStore};
use crate::transport::{SendReceipt, Transport};
use crate::upload::{ProgressFn, Uploader};

const EVENT_BUFFER: usize = 256;

/// A message as the client intends to send it. `client_message_id` becomes
/// the server-side message id, which makes resends idempotent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageDraft {
    pub client_message_id: MessageId,
    pub conversation_id: ConversationId,
    pub content: String,
    pub kind: MessageKind,
    #[serde(default)]
    pub attachment: Option<AttachmentRef>,
}

/// Attachment bytes waiting for upload. Stored base64 in the queue file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingBlob {
    pub name: String,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum QueueAction {
    SendMessage {
        draft: MessageDraft,
    },
    /// Upload first; on success the item becomes a `SendMessage` carrying
    /// the attachment reference, in the same queue position.
    UploadAttachment {
        draft: MessageDraft,
        blob: PendingBlob,
    },
    SetTyping {
        conversation_id: ConversationId,
        is_typing: bool,
    },
}

impl QueueAction {
    pub fn message_id(&self) -> Option<MessageId> {
        match self {
            QueueAction::SendMessage { draft } | QueueAction::UploadAttachment { draft, .. } => {
                Some(draft.client_message_id)
            }
            QueueAction::SetTyping { .. } => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            QueueAction::SendMessage { .. } => "sendMessage",
            QueueAction::UploadAttachment { .. } => "uploadAttachment",
            QueueAction::SetTyping { .. } => "setTyping",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncQueueItem {
    pub id: Uuid,
    pub action: QueueAction,
    pub enqueued_at: DateTime<Utc>,
    pub retry_count: u32,
}

impl SyncQueueItem {
    fn new(action: QueueAction) -> Self {
        Self {
            id: Uuid::new_v4(),
            action,
            enqueued_at: Utc::now(),
            retry_count: 0,
        }
    }
}

/// An item the queue gave up on. Kept until the user resends or discards it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedItem {
    pub item: SyncQueueItem,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

/// Outcome of one [`SendQueue::drain`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub attempted: usize,
    pub completed: usize,
    pub failed: usize,
    pub remaining: usize,
}

enum Attempt {
    Sent(SendReceipt),
    Uploaded(AttachmentRef),
    Done,
}

struct QueueState {
    items: VecDeque<SyncQueueItem>,
    failed: Vec<FailedItem>,
    statuses: HashMap<MessageId, OutboundStatus>,
    sync: SyncStatus,
}

struct Inner {
    state: Mutex<QueueState>,
    drain_lock: Mutex<()>,
    wake: Notify,
    events: broadcast::Sender<QueueEvent>,
    store: Arc<dyn QueueStore>,
    transport: Arc<dyn Transport>,
    uploader: Arc<dyn Uploader>,
    connectivity: Connectivity,
    attempt_timeout: Duration,
}

#[derive(Clone)]
pub struct SendQueue {
    inner: Arc<Inner>,
}

impl SendQueue {
    /// Restore the queue from `store`.
    pub async fn open(
        store: Arc<dyn QueueStore>,
        transport: Arc<dyn Transport>,
        uploader: Arc<dyn Uploader>,
        connectivity: Connectivity,
        attempt_timeout: Duration,
    ) -> Result<Self> {
        let snapshot = store.load().await?;

        let mut statuses = HashMap::new();
        for item in &snapshot.items {
            if let Some(id) = item.action.message_id() {
                statuses.insert(id, OutboundStatus::Queued);
            }
        }
        for failed in &snapshot.failed {
            if let Some(id) = failed.item.action.message_id() {
                statuses.insert(id, OutboundStatus::Failed);
            }
        }

        info!(
            pending = snapshot.items.len(),
            failed = snapshot.failed.len(),
            "Send queue restored"
        );

        let sync = settled(&connectivity, snapshot.items.is_empty());
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Ok(Self {
            inner: Arc::new(Inner {
                state: Mutex::new(QueueState {
                    items: snapshot.items.into(),
                    failed: snapshot.failed,
                    statuses,
                    sync,
                }),
                drain_lock: Mutex::new(()),
                wake: Notify::new(),
                events,
                store,
                transport,
                uploader,
                connectivity,
                attempt_timeout,
            }),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.inner.events.subscribe()
    }

    // -----------------------------------------------------------------------
    // Enqueue
    // -----------------------------------------------------------------------

    /// Queue a text message. Returns the id the message will carry.
    pub async fn send_message(
        &self,
        conversation_id: ConversationId,
        content: impl Into<String>,
    ) -> Result<MessageId> {
        let content = content.into();
        if content.trim().is_empty() {
            return Err(ChatError::ValidationFailed("message content is empty".into()).into());
        }
        check_length(&content)?;

        let draft = MessageDraft {
            client_message_id: MessageId::new(),
            conversation_id,
            content,
            kind: MessageKind::Text,
            attachment: None,
        };
        let id = draft.client_message_id;
        self.enqueue(QueueAction::SendMessage { draft }).await?;
        Ok(id)
    }

    /// Queue an attachment upload followed by the message that carries it.
    pub async fn send_attachment(
        &self,
        conversation_id: ConversationId,
        kind: MessageKind,
        caption: impl Into<String>,
        name: impl Into<String>,
        data: Vec<u8>,
    ) -> Result<MessageId> {
        if !kind.needs_attachment() {
            return Err(ChatError::ValidationFailed(format!(
                "{} messages do not carry attachments",
                kind.as_str()
            ))
            .into());
        }
        if data.is_empty() {
            return Err(ChatError::ValidationFailed("attachment is empty".into()).into());
        }
        let caption = caption.into();
        check_length(&caption)?;

        let draft = MessageDraft {
            client_message_id: MessageId::new(),
            conversation_id,
            content: caption,
            kind,
            attachment: None,
        };
        let id = draft.client_message_id;
        let blob = PendingBlob {
            name: name.into(),
            data,
        };
        self.enqueue(QueueAction::UploadAttachment { draft, blob })
            .await?;
        Ok(id)
    }

    pub async fn set_typing(&self, conversation_id: ConversationId, is_typing: bool) -> Result<()> {
        self.enqueue(QueueAction::SetTyping {
            conversation_id,
            is_typing,
        })
        .await
        .map(|_| ())
    }

    async fn enqueue(&self, action: QueueAction) -> Result<Uuid> {
        let item = SyncQueueItem::new(action);
        let item_id = item.id;
        let message_id = item.action.message_id();
        let initial = if self.inner.connectivity.is_online() {
            OutboundStatus::Sending
        } else {
            OutboundStatus::Queued
        };

        {
            let mut state = self.inner.state.lock().await;
            state.items.push_back(item);
            if let Err(e) = self.persist(&state).await {
                state.items.pop_back();
                return Err(e);
            }
            if let Some(id) = message_id {
                state.statuses.insert(id, initial);
                self.emit(QueueEvent::StatusChanged {
                    message_id: id,
                    status: initial,
                });
            }
            self.settle(&mut state);
            debug!(item = %item_id, pending = state.items.len(), "Enqueued");
        }

        self.inner.wake.notify_one();
        Ok(item_id)
    }

    // -----------------------------------------------------------------------
    // Drain
    // -----------------------------------------------------------------------

    /// Work the queue until it is empty, an item fails retryably, or
    /// connectivity drops. Returns `None` if another drain is running.
    pub async fn drain(&self) -> Option<DrainReport> {
        let Ok(_running) = self.inner.drain_lock.try_lock() else {
            debug!("Drain already in progress");
            return None;
        };

        let mut report = DrainReport::default();
        {
            let mut state = self.inner.state.lock().await;
            if self.inner.connectivity.is_online() && !state.items.is_empty() {
                self.set_sync(&mut state, SyncStatus::Syncing);
            }
        }

        while self.inner.connectivity.is_online() {
            let head = {
                let mut state = self.inner.state.lock().await;
                let Some(head) = state.items.front().cloned() else {
                    break;
                };
                if let Some(id) = head.action.message_id() {
                    self.transition(&mut state, id, OutboundStatus::Sending);
                }
                head
            };

            report.attempted += 1;
            let result =
                match tokio::time::timeout(self.inner.attempt_timeout, self.attempt(&head)).await {
                    Ok(result) => result,
                    Err(_) => Err(TransportError::Timeout(self.inner.attempt_timeout)),
                };

            let mut state = self.inner.state.lock().await;
            if state.items.front().map(|item| item.id) != Some(head.id) {
                warn!(item = %head.id, "Queue head changed during attempt");
                continue;
            }

            let keep_going = match result {
                Ok(Attempt::Uploaded(attachment)) => {
                    if let Some(front) = state.items.front_mut() {
                        if let QueueAction::UploadAttachment { draft, .. } = &front.action {
                            let mut draft = draft.clone();
                            draft.attachment = Some(attachment);
                            front.action = QueueAction::SendMessage { draft };
                        }
                    }
                    true
                }
                Ok(Attempt::Sent(receipt)) => {
                    state.items.pop_front();
                    let id = receipt.message.id;
                    self.transition(&mut state, id, OutboundStatus::Sent);
                    if receipt.delivered {
                        self.transition(&mut state, id, OutboundStatus::Delivered);
                    }
                    report.completed += 1;
                    true
                }
                Ok(Attempt::Done) => {
                    state.items.pop_front();
                    report.completed += 1;
                    true
                }
                Err(e) if e.is_terminal() => {
                    warn!(item = %head.id, action = head.action.name(), error = %e, "Rejected by server");
                    if let Some(item) = state.items.pop_front() {
                        self.emit(QueueEvent::Rejected {
                            item_id: item.id,
                            message_id: item.action.message_id(),
                            error: e.to_string(),
                        });
                        self.move_to_failed(&mut state, item, e.to_string());
                    }
                    report.failed += 1;
                    true
                }
                Err(e) => self.record_failure(&mut state, e, &mut report),
            };

            if let Err(e) = self.persist(&state).await {
                error!(error = %e, "Failed to persist send queue");
            }
            if !keep_going {
                break;
            }
        }

        let mut state = self.inner.state.lock().await;
        report.remaining = state.items.len();
        self.settle(&mut state);
        debug!(?report, "Drain finished");
        Some(report)
    }

    async fn attempt(&self, item: &SyncQueueItem) -> std::result::Result<Attempt, TransportError> {
        match &item.action {
            QueueAction::SendMessage { draft } => self
                .inner
                .transport
                .send_message(draft)
                .await
                .map(Attempt::Sent),
            QueueAction::UploadAttachment { draft, blob } => {
                let events = self.inner.events.clone();
                let message_id = draft.client_message_id;
                let progress: ProgressFn = Arc::new(move |fraction| {
                    let _ = events.send(QueueEvent::UploadProgress {
                        message_id,
                        fraction: fraction.clamp(0.0, 1.0),
                    });
                });
                self.inner
                    .uploader
                    .upload(blob, progress)
                    .await
                    .map(Attempt::Uploaded)
            }
            QueueAction::SetTyping {
                conversation_id,
                is_typing,
            } => self
                .inner
                .transport
                .set_typing(*conversation_id, *is_typing)
                .await
                .map(|_| Attempt::Done),
        }
    }

    /// Bump the head's attempt count. Returns whether the drain continues.
    fn record_failure(
        &self,
        state: &mut QueueState,
        err: TransportError,
        report: &mut DrainReport,
    ) -> bool {
        let Some(front) = state.items.front_mut() else {
            return true;
        };
        front.retry_count += 1;
        let attempts = front.retry_count;
        let item_id = front.id;
        let message_id = front.action.message_id();
        let cause = err.into_chat_error();

        if attempts < MAX_SEND_ATTEMPTS {
            warn!(item = %item_id, attempts, error = %cause, "Send attempt failed, will retry");
            if let Some(id) = message_id {
                self.transition(state, id, OutboundStatus::Queued);
            }
            return false;
        }

        let last_error = cause.to_string();
        let exhausted = ChatError::RetryExhausted {
            attempts,
            last_error: last_error.clone(),
        };
        warn!(item = %item_id, error = %exhausted, "Giving up on queued action");
        self.emit(QueueEvent::RetryExhausted {
            item_id,
            message_id,
            attempts,
            last_error,
        });
        if let Some(item) = state.items.pop_front() {
            self.move_to_failed(state, item, exhausted.to_string());
        }
        report.failed += 1;
        true
    }

    fn move_to_failed(&self, state: &mut QueueState, item: SyncQueueItem, error: String) {
        if let Some(id) = item.action.message_id() {
            self.transition(state, id, OutboundStatus::Failed);
        }
        state.failed.push(FailedItem {
            item,
            error,
            failed_at: Utc::now(),
        });
    }

    // -----------------------------------------------------------------------
    // Failed items
    // -----------------------------------------------------------------------

    /// Put a failed item back at the tail with a fresh attempt budget.
    ///
    /// If the queue cannot be saved the item stays in the failed list.
    pub async fn resend_failed(&self, item_id: Uuid) -> Result<()> {
        {
            let mut state = self.inner.state.lock().await;
            let pos = state
                .failed
                .iter()
                .position(|f| f.item.id == item_id)
                .ok_or(ClientError::UnknownItem(item_id))?;
            let failed = state.failed.remove(pos);
            let mut item = failed.item.clone();
            item.retry_count = 0;
            state.items.push_back(item);

            if let Err(e) = self.persist(&state).await {
                state.items.pop_back();
                state.failed.insert(pos, failed);
                return Err(e);
            }
            if let Some(id) = failed.item.action.message_id() {
                self.transition(&mut state, id, OutboundStatus::Queued);
            }
            self.settle(&mut state);
        }
        info!(item = %item_id, "Failed item requeued");
        self.inner.wake.notify_one();
        Ok(())
    }

    pub async fn discard_failed(&self, item_id: Uuid) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        let pos = state
            .failed
            .iter()
            .position(|f| f.item.id == item_id)
            .ok_or(ClientError::UnknownItem(item_id))?;
        let failed = state.failed.remove(pos);

        if let Err(e) = self.persist(&state).await {
            state.failed.insert(pos, failed);
            return Err(e);
        }
        if let Some(id) = failed.item.action.message_id() {
            state.statuses.remove(&id);
        }
        info!(item = %item_id, "Failed item discarded");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Receipts
    // -----------------------------------------------------------------------

    /// Apply a gateway event to the status of our own messages.
    pub async fn apply_server_event(&self, event: &ServerEvent) {
        match event {
            ServerEvent::DeliveryReceipt { message_ids, .. } => {
                let mut state = self.inner.state.lock().await;
                for id in message_ids {
                    self.transition(&mut state, *id, OutboundStatus::Delivered);
                }
            }
            ServerEvent::ReadReceipt { message_id, .. } => {
                let mut state = self.inner.state.lock().await;
                self.transition(&mut state, *message_id, OutboundStatus::Read);
            }
            _ => {}
        }
    }

    /// Feed gateway events into [`Self::apply_server_event`] until the
    /// channel closes.
    pub fn track_receipts(&self, mut events: broadcast::Receiver<ServerEvent>) -> JoinHandle<()> {
        let queue = self.clone();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => queue.apply_server_event(&event).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Receipt tracker lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    // -----------------------------------------------------------------------
    // Worker
    // -----------------------------------------------------------------------

    /// Drain on every offline-to-online edge, on enqueue, and every
    /// `interval`.
    pub fn spawn_worker(&self, interval: Duration) -> JoinHandle<()> {
        let queue = self.clone();
        let mut online = self.inner.connectivity.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = queue.inner.wake.notified() => {}
                    changed = online.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        if !*online.borrow_and_update() {
                            let mut state = queue.inner.state.lock().await;
                            queue.settle(&mut state);
                            continue;
                        }
                        info!("Connectivity restored, draining send queue");
                    }
                }
                queue.drain().await;
            }
        })
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub async fn status(&self, message_id: MessageId) -> Option<OutboundStatus> {
        self.inner.state.lock().await.statuses.get(&message_id).copied()
    }

    pub async fn sync_status(&self) -> SyncStatus {
        self.inner.state.lock().await.sync
    }

    pub async fn pending(&self) -> Vec<SyncQueueItem> {
        self.inner.state.lock().await.items.iter().cloned().collect()
    }

    pub async fn failed(&self) -> Vec<FailedItem> {
        self.inner.state.lock().await.failed.clone()
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    async fn persist(&self, state: &QueueState) -> Result<()> {
        let snapshot = QueueSnapshot {
            items: state.items.iter().cloned().collect(),
            failed: state.failed.clone(),
        };
        self.inner.store.save(&snapshot).await
    }

    /// Move a message along the status machine. Illegal edges are ignored,
    /// which makes late or duplicate receipts harmless.
    fn transition(&self, state: &mut QueueState, message_id: MessageId, next: OutboundStatus) {
        let Some(current) = state.statuses.get(&message_id).copied() else {
            return;
        };
        if current == next {
            return;
        }
        if !current.can_transition_to(next) {
            debug!(message = %message_id, from = %current, to = %next, "Ignoring status change");
            return;
        }
        state.statuses.insert(message_id, next);
        self.emit(QueueEvent::StatusChanged {
            message_id,
            status: next,
        });
    }

    fn settle(&self, state: &mut QueueState) {
        let sync = settled(&self.inner.connectivity, state.items.is_empty());
        self.set_sync(state, sync);
    }

    fn set_sync(&self, state: &mut QueueState, sync: SyncStatus) {
        if state.sync != sync {
            state.sync = sync;
            self.emit(QueueEvent::SyncStatusChanged { status: sync });
        }
    }

    fn emit(&self, event: QueueEvent) {
        let _ = self.inner.events.send(event);
    }
}

fn settled(connectivity: &Connectivity, empty: bool) -> SyncStatus {
    if !connectivity.is_online() {
        SyncStatus::Offline
    } else if empty {
        SyncStatus::Synced
    } else {
        SyncStatus::Partial
    }
}

fn check_length(content: &str) -> Result<()> {
    if content.chars().count() > MAX_MESSAGE_CHARS {
        return Err(ChatError::ValidationFailed(format!(
            "message exceeds {MAX_MESSAGE_CHARS} characters"
        ))
        .into());
    }
    Ok(())
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;
    use tandem_shared::ParticipantId;

    use crate::persist::MemoryStore;
    use crate::transport::tests::ScriptedTransport;
    use crate::upload::tests::FakeUploader;

    struct Harness {
        queue: SendQueue,
        transport: Arc<ScriptedTransport>,
        uploader: Arc<FakeUploader>,
        connectivity: Connectivity,
        store: Arc<MemoryStore>,
    }

    async fn harness(online: bool) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let transport = Arc::new(ScriptedTransport::default());
        let uploader = Arc::new(FakeUploader::default());
        let connectivity = Connectivity::new(online);
        let queue = SendQueue::open(
            store.clone(),
            transport.clone(),
            uploader.clone(),
            connectivity.clone(),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        Harness {
            queue,
            transport,
            uploader,
            connectivity,
            store,
        }
    }

    fn network_down() -> std::result::Result<bool, TransportError> {
        Err(TransportError::Connection("connection reset".into()))
    }

    fn drain_events(rx: &mut broadcast::Receiver<QueueEvent>) -> Vec<QueueEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    #[tokio::test]
    async fn failed_head_blocks_later_items_until_it_succeeds() {
        let h = harness(true).await;
        let c = ConversationId::new();
        h.transport.push(network_down());
        h.transport.push(network_down());

        let m1 = h.queue.send_message(c, "m1").await.unwrap();
        let m2 = h.queue.send_message(c, "m2").await.unwrap();
        let m3 = h.queue.send_message(c, "m3").await.unwrap();

        let first = h.queue.drain().await.unwrap();
        assert_eq!(first.attempted, 1);
        assert_eq!(first.remaining, 3);
        assert_eq!(h.queue.status(m1).await, Some(OutboundStatus::Queued));
        assert_eq!(h.queue.sync_status().await, SyncStatus::Partial);

        h.queue.drain().await.unwrap();
        let last = h.queue.drain().await.unwrap();
        assert_eq!(last.completed, 3);
        assert_eq!(last.remaining, 0);

        assert_eq!(h.transport.contents(), vec!["m1", "m1", "m1", "m2", "m3"]);
        for id in [m1, m2, m3] {
            assert_eq!(h.queue.status(id).await, Some(OutboundStatus::Sent));
        }
        assert_eq!(h.queue.sync_status().await, SyncStatus::Synced);
    }

    #[tokio::test]
    async fn third_failure_moves_item_to_failed_list() {
        let h = harness(true).await;
        let c = ConversationId::new();
        let mut events = h.queue.subscribe();
        for _ in 0..3 {
            h.transport.push(network_down());
        }

        let m1 = h.queue.send_message(c, "doomed").await.unwrap();
        let m2 = h.queue.send_message(c, "fine").await.unwrap();

        h.queue.drain().await.unwrap();
        h.queue.drain().await.unwrap();
        let report = h.queue.drain().await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.completed, 1);

        // No fourth attempt.
        h.queue.drain().await.unwrap();
        assert_eq!(h.transport.contents(), vec!["doomed", "doomed", "doomed", "fine"]);

        assert_eq!(h.queue.status(m1).await, Some(OutboundStatus::Failed));
        assert_eq!(h.queue.status(m2).await, Some(OutboundStatus::Sent));
        let failed = h.queue.failed().await;
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].item.retry_count, 3);
        assert!(failed[0].error.contains("3 attempts"));
        assert!(drain_events(&mut events).iter().any(|e| matches!(
            e,
            QueueEvent::RetryExhausted { attempts: 3, message_id: Some(id), .. } if *id == m1
        )));

        // The failed item survives a restart.
        assert_eq!(h.store.load().await.unwrap().failed.len(), 1);

        h.queue.resend_failed(failed[0].item.id).await.unwrap();
        assert_eq!(h.queue.status(m1).await, Some(OutboundStatus::Queued));
        h.queue.drain().await.unwrap();
        assert_eq!(h.queue.status(m1).await, Some(OutboundStatus::Sent));
        assert!(h.queue.failed().await.is_empty());
    }

    #[tokio::test]
    async fn rejection_fails_immediately_and_drain_continues() {
        let h = harness(true).await;
        let c = ConversationId::new();
        h.transport.push(Err(TransportError::Rejected(ChatError::Forbidden(
            "conversation is closed".into(),
        ))));

        let m1 = h.queue.send_message(c, "too late").await.unwrap();
        h.queue.send_message(c, "next").await.unwrap();

        let report = h.queue.drain().await.unwrap();
        assert_eq!(report.attempted, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(h.transport.contents(), vec!["too late", "next"]);
        assert_eq!(h.queue.status(m1).await, Some(OutboundStatus::Failed));

        let failed = h.queue.failed().await;
        h.queue.discard_failed(failed[0].item.id).await.unwrap();
        assert!(h.queue.failed().await.is_empty());
        assert_eq!(h.queue.status(m1).await, None);
        assert!(matches!(
            h.queue.discard_failed(failed[0].item.id).await,
            Err(ClientError::UnknownItem(_))
        ));
    }

    #[tokio::test]
    async fn offline_items_flush_in_order_on_reconnect() {
        let h = harness(false).await;
        let c = ConversationId::new();
        let mut events = h.queue.subscribe();
        h.transport.push(Ok(true));
        h.transport.push(Ok(true));

        let a = h.queue.send_message(c, "first").await.unwrap();
        let b = h.queue.send_message(c, "second").await.unwrap();
        assert_eq!(h.queue.status(a).await, Some(OutboundStatus::Queued));
        assert_eq!(h.queue.sync_status().await, SyncStatus::Offline);

        let offline = h.queue.drain().await.unwrap();
        assert_eq!(offline.attempted, 0);
        assert_eq!(offline.remaining, 2);

        let worker = h.queue.spawn_worker(Duration::from_secs(3600));
        h.connectivity.set_online(true);

        tokio::time::timeout(Duration::from_secs(5), async {
            while h.queue.sync_status().await != SyncStatus::Synced {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("queue did not drain after reconnect");
        worker.abort();

        assert_eq!(h.transport.contents(), vec!["first", "second"]);
        assert_eq!(h.queue.status(a).await, Some(OutboundStatus::Delivered));
        assert_eq!(h.queue.status(b).await, Some(OutboundStatus::Delivered));

        h.queue
            .apply_server_event(&ServerEvent::ReadReceipt {
                message_id: a,
                conversation_id: c,
                reader_id: ParticipantId::new(),
            })
            .await;
        assert_eq!(h.queue.status(a).await, Some(OutboundStatus::Read));

        let statuses: Vec<OutboundStatus> = drain_events(&mut events)
            .into_iter()
            .filter_map(|e| match e {
                QueueEvent::StatusChanged { message_id, status } if message_id == a => Some(status),
                _ => None,
            })
            .collect();
        assert_eq!(
            statuses,
            vec![
                OutboundStatus::Queued,
                OutboundStatus::Sending,
                OutboundStatus::Sent,
                OutboundStatus::Delivered,
                OutboundStatus::Read,
            ]
        );
    }

    #[tokio::test]
    async fn attachment_waits_offline_then_uploads_and_sends() {
        let h = harness(false).await;
        let c = ConversationId::new();
        let mut events = h.queue.subscribe();
        *h.uploader.failures_left.lock().unwrap() = 1;

        let id = h
            .queue
            .send_attachment(c, MessageKind::File, "minutes", "minutes.pdf", vec![1, 2, 3])
            .await
            .unwrap();
        assert!(matches!(
            h.queue.pending().await[0].action,
            QueueAction::UploadAttachment { .. }
        ));
        assert_eq!(h.queue.drain().await.unwrap().attempted, 0);

        h.connectivity.set_online(true);
        let interrupted = h.queue.drain().await.unwrap();
        assert_eq!(interrupted.remaining, 1);
        let pending = h.queue.pending().await;
        assert_eq!(pending[0].retry_count, 1);
        assert!(matches!(pending[0].action, QueueAction::UploadAttachment { .. }));

        let done = h.queue.drain().await.unwrap();
        assert_eq!(done.completed, 1);
        assert_eq!(h.queue.status(id).await, Some(OutboundStatus::Sent));
        assert_eq!(h.uploader.uploads.lock().unwrap().as_slice(), ["minutes.pdf"]);

        let sent = h.transport.calls.lock().unwrap()[0].clone();
        assert_eq!(sent.client_message_id, id);
        assert_eq!(
            sent.attachment.map(|a| a.url),
            Some("https://files.example.org/minutes.pdf".to_string())
        );

        let progress: Vec<f32> = drain_events(&mut events)
            .into_iter()
            .filter_map(|e| match e {
                QueueEvent::UploadProgress { fraction, .. } => Some(fraction),
                _ => None,
            })
            .collect();
        assert!(progress.iter().all(|f| (0.0..=1.0).contains(f)));
        assert_eq!(progress.last(), Some(&1.0));
    }

    #[tokio::test]
    async fn queue_is_restored_from_store() {
        let h = harness(false).await;
        let c = ConversationId::new();
        let id = h.queue.send_message(c, "survive the restart").await.unwrap();

        let online = Connectivity::new(true);
        let reopened = SendQueue::open(
            h.store.clone(),
            h.transport.clone(),
            h.uploader.clone(),
            online,
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        assert_eq!(reopened.status(id).await, Some(OutboundStatus::Queued));
        assert_eq!(reopened.sync_status().await, SyncStatus::Partial);

        reopened.drain().await.unwrap();
        assert_eq!(reopened.status(id).await, Some(OutboundStatus::Sent));
        assert!(h.store.load().await.unwrap().items.is_empty());
    }

    #[tokio::test]
    async fn delivery_receipt_advances_message_sent_to_offline_receiver() {
        let h = harness(true).await;
        let c = ConversationId::new();
        let mut events = h.queue.subscribe();
        h.transport.push(Ok(false));

        let id = h.queue.send_message(c, "are you there?").await.unwrap();
        h.queue.drain().await.unwrap();
        assert_eq!(h.queue.status(id).await, Some(OutboundStatus::Sent));

        let receipt = ServerEvent::DeliveryReceipt {
            conversation_id: c,
            message_ids: vec![id, MessageId::new()],
            recipient_id: ParticipantId::new(),
        };
        h.queue.apply_server_event(&receipt).await;
        h.queue.apply_server_event(&receipt).await;
        assert_eq!(h.queue.status(id).await, Some(OutboundStatus::Delivered));

        h.queue
            .apply_server_event(&ServerEvent::ReadReceipt {
                message_id: id,
                conversation_id: c,
                reader_id: ParticipantId::new(),
            })
            .await;
        h.queue.apply_server_event(&receipt).await;
        assert_eq!(h.queue.status(id).await, Some(OutboundStatus::Read));

        let statuses: Vec<OutboundStatus> = drain_events(&mut events)
            .into_iter()
            .filter_map(|e| match e {
                QueueEvent::StatusChanged { message_id, status } if message_id == id => Some(status),
                _ => None,
            })
            .collect();
        assert_eq!(
            statuses,
            vec![
                OutboundStatus::Sending,
                OutboundStatus::Sent,
                OutboundStatus::Delivered,
                OutboundStatus::Read,
            ]
        );
    }

    /// Store whose saves can be switched to fail.
    #[derive(Default)]
    struct FailingStore {
        inner: MemoryStore,
        broken: AtomicBool,
    }

    #[async_trait]
    impl QueueStore for FailingStore {
        async fn load(&self) -> Result<QueueSnapshot> {
            self.inner.load().await
        }

        async fn save(&self, snapshot: &QueueSnapshot) -> Result<()> {
            if self.broken.load(Ordering::SeqCst) {
                return Err(ClientError::Persist("disk full".into()));
            }
            self.inner.save(snapshot).await
        }
    }

    #[tokio::test]
    async fn failed_list_is_unchanged_when_saving_fails() {
        let store = Arc::new(FailingStore::default());
        let transport = Arc::new(ScriptedTransport::default());
        let queue = SendQueue::open(
            store.clone(),
            transport.clone(),
            Arc::new(FakeUploader::default()),
            Connectivity::new(true),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        transport.push(Err(TransportError::Rejected(ChatError::Forbidden(
            "conversation is closed".into(),
        ))));

        let id = queue.send_message(ConversationId::new(), "too late").await.unwrap();
        queue.drain().await.unwrap();
        let item_id = queue.failed().await[0].item.id;

        store.broken.store(true, Ordering::SeqCst);
        assert!(matches!(
            queue.resend_failed(item_id).await,
            Err(ClientError::Persist(_))
        ));
        assert_eq!(queue.failed().await.len(), 1);
        assert!(queue.pending().await.is_empty());
        assert_eq!(queue.status(id).await, Some(OutboundStatus::Failed));

        assert!(matches!(
            queue.discard_failed(item_id).await,
            Err(ClientError::Persist(_))
        ));
        assert_eq!(queue.failed().await[0].item.id, item_id);
        assert_eq!(queue.status(id).await, Some(OutboundStatus::Failed));

        store.broken.store(false, Ordering::SeqCst);
        queue.discard_failed(item_id).await.unwrap();
        assert!(queue.failed().await.is_empty());
        assert!(store.load().await.unwrap().failed.is_empty());
    }

    struct StallingTransport;

    #[async_trait]
    impl Transport for StallingTransport {
        async fn send_message(&self, _: &MessageDraft) -> std::result::Result<SendReceipt, TransportError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Err(TransportError::NotConnected)
        }

        async fn set_typing(&self, _: ConversationId, _: bool) -> std::result::Result<(), TransportError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn stalled_attempt_times_out_and_counts_as_failure() {
        let queue = SendQueue::open(
            Arc::new(MemoryStore::new()),
            Arc::new(StallingTransport),
            Arc::new(FakeUploader::default()),
            Connectivity::new(true),
            Duration::from_millis(50),
        )
        .await
        .unwrap();

        let id = queue.send_message(ConversationId::new(), "hello?").await.unwrap();
        let report = queue.drain().await.unwrap();
        assert_eq!(report.remaining, 1);
        assert_eq!(queue.pending().await[0].retry_count, 1);
        assert_eq!(queue.status(id).await, Some(OutboundStatus::Queued));
    }

    #[tokio::test]
    async fn only_one_drain_runs_at_a_time() {
        let h = harness(true).await;
        let _running = h.queue.inner.drain_lock.lock().await;
        assert!(h.queue.drain().await.is_none());
    }

    #[tokio::test]
    async fn invalid_input_is_refused_before_queueing() {
        let h = harness(true).await;
        let c = ConversationId::new();

        assert!(matches!(
            h.queue.send_message(c, "   ").await,
            Err(ClientError::Chat(ChatError::ValidationFailed(_)))
        ));
        assert!(h
            .queue
            .send_message(c, "x".repeat(MAX_MESSAGE_CHARS + 1))
            .await
            .is_err());
        assert!(h
            .queue
            .send_attachment(c, MessageKind::Text, "", "a.txt", vec![1])
            .await
            .is_err());
        assert!(h.queue.pending().await.is_empty());
    }

    #[tokio::test]
    async fn typing_goes_through_the_queue() {
        let h = harness(true).await;
        let c = ConversationId::new();
        h.queue.set_typing(c, true).await.unwrap();
        h.queue.drain().await.unwrap();
        assert_eq!(h.transport.typing.lock().unwrap().as_slice(), [(c, true)]);
    }
}
