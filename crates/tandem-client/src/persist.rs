//! Durable storage for the send queue.
//!
//! The queue is written as a whole after every mutation, so a crash loses
//! at most the mutation in flight. The file is replaced atomically by
//! writing a sibling temp file and renaming it over the old one.

use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, warn};

use crate::error::{ClientError, Result};
use crate::queue::{FailedItem, SyncQueueItem};

/// Everything the queue needs to survive a restart.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueSnapshot {
    pub items: Vec<SyncQueueItem>,
    #[serde(default)]
    pub failed: Vec<FailedItem>,
}

#[async_trait]
pub trait QueueStore: Send + Sync {
    async fn load(&self) -> Result<QueueSnapshot>;
    async fn save(&self, snapshot: &QueueSnapshot) -> Result<()>;
}

pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

#[async_trait]
impl QueueStore for JsonFileStore {
    async fn load(&self) -> Result<QueueSnapshot> {
        let raw = match fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No saved queue, starting empty");
                return Ok(QueueSnapshot::default());
            }
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_slice(&raw) {
            Ok(snapshot) => Ok(snapshot),
            Err(e) => {
                // Keep the unreadable file around for inspection rather than
                // overwriting it on the next save.
                let backup = self.path.with_extension("corrupt");
                warn!(
                    path = %self.path.display(),
                    backup = %backup.display(),
                    error = %e,
                    "Saved queue is unreadable, starting empty"
                );
                fs::rename(&self.path, &backup).await?;
                Ok(QueueSnapshot::default())
            }
        }
    }

    async fn save(&self, snapshot: &QueueSnapshot) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_vec_pretty(snapshot)?;
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, json).await?;
        fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

/// Non-durable store for ephemeral clients and tests.
#[derive(Default)]
pub struct MemoryStore {
    snapshot: Mutex<QueueSnapshot>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl QueueStore for MemoryStore {
    async fn load(&self) -> Result<QueueSnapshot> {
        self.snapshot
            .lock()
            .map(|s| s.clone())
            .map_err(|_| ClientError::Persist("memory store lock poisoned".into()))
    }

    async fn save(&self, snapshot: &QueueSnapshot) -> Result<()> {
        let mut guard = self
            .snapshot
            .lock()
            .map_err(|_| ClientError::Persist("memory store lock poisoned".into()))?;
        *guard = snapshot.clone();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tandem_shared::{ConversationId, MessageId, MessageKind};
    use tempfile::TempDir;
    use uuid::Uuid;

    use crate::queue::{MessageDraft, PendingBlob, QueueAction};

    fn snapshot() -> QueueSnapshot {
        let draft = MessageDraft {
            client_message_id: MessageId::new(),
            conversation_id: ConversationId::new(),
            content: "see attached".into(),
            kind: MessageKind::File,
            attachment: None,
        };
        QueueSnapshot {
            items: vec![SyncQueueItem {
                id: Uuid::new_v4(),
                action: QueueAction::UploadAttachment {
                    draft,
                    blob: PendingBlob {
                        name: "plan.pdf".into(),
                        data: vec![0, 159, 146, 150, 255],
                    },
                },
                enqueued_at: Utc::now(),
                retry_count: 1,
            }],
            failed: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_missing_file_loads_empty() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::new(dir.path().join("queue.json"));
        assert_eq!(store.load().await.unwrap(), QueueSnapshot::default());
    }

    #[tokio::test]
    async fn test_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("queue.json");
        let saved = snapshot();

        JsonFileStore::new(path.clone()).save(&saved).await.unwrap();
        let loaded = JsonFileStore::new(path.clone()).load().await.unwrap();
        assert_eq!(loaded, saved);
        assert!(!path.with_extension("tmp").exists());
    }

    #[tokio::test]
    async fn test_corrupt_file_is_set_aside() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("queue.json");
        std::fs::write(&path, b"{not json").unwrap();

        let loaded = JsonFileStore::new(path.clone()).load().await.unwrap();
        assert!(loaded.items.is_empty());
        assert!(path.with_extension("corrupt").exists());
    }
}
