use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, info};
use uuid::Uuid;

use tandem_shared::ChatError;

use crate::error::ServerError;

/// Resolve `target` under `base`, rejecting `..` components.
fn ensure_within(base: &Path, target: &Path) -> Result<PathBuf, ServerError> {
    let canonical_base = base.canonicalize().unwrap_or_else(|_| base.to_path_buf());
    let mut resolved = canonical_base.clone();
    for component in target
        .strip_prefix(base)
        .unwrap_or(target)
        .components()
    {
        match component {
            Component::Normal(c) => resolved.push(c),
            Component::ParentDir => {
                return Err(ServerError::BadRequest("Path traversal detected".to_string()));
            }
            _ => {}
        }
    }
    if !resolved.starts_with(&canonical_base) {
        return Err(ServerError::BadRequest("Path traversal detected".to_string()));
    }
    Ok(resolved)
}

/// Sidecar metadata written next to each attachment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentMeta {
    pub id: Uuid,
    pub name: String,
    pub size: usize,
    /// Hex BLAKE3 digest of the content.
    pub blake3: String,
}

/// Attachments on local disk, keyed by UUID.
#[derive(Debug, Clone)]
pub struct BlobStore {
    base_path: PathBuf,
    max_size: usize,
}

impl BlobStore {
    pub async fn new(base_path: PathBuf, max_size: usize) -> Result<Self, ServerError> {
        fs::create_dir_all(&base_path).await.map_err(|e| {
            ServerError::AttachmentStorage(format!(
                "Failed to create attachment directory '{}': {}",
                base_path.display(),
                e
            ))
        })?;

        info!(path = %base_path.display(), "Attachment store initialized");

        Ok(Self {
            base_path,
            max_size,
        })
    }

    /// Store an attachment. When `expected_hash` is given the content must
    /// hash to it, otherwise the upload is rejected as corrupt.
    pub async fn store(
        &self,
        name: &str,
        data: &[u8],
        expected_hash: Option<&str>,
    ) -> Result<AttachmentMeta, ServerError> {
        if data.is_empty() {
            return Err(ServerError::BadRequest("Empty attachment".to_string()));
        }
        if data.len() > self.max_size {
            return Err(ServerError::AttachmentTooLarge {
                size: data.len(),
                max: self.max_size,
            });
        }

        let digest = blake3::hash(data).to_hex().to_string();
        if let Some(expected) = expected_hash {
            if !expected.trim().eq_ignore_ascii_case(&digest) {
                return Err(ChatError::ValidationFailed(
                    "attachment content hash mismatch".to_string(),
                )
                .into());
            }
        }

        let meta = AttachmentMeta {
            id: Uuid::new_v4(),
            name: sanitize_name(name),
            size: data.len(),
            blake3: digest,
        };

        let path = self.safe_path(&meta.id.to_string())?;
        fs::write(&path, data).await.map_err(|e| {
            ServerError::AttachmentStorage(format!("Failed to write attachment {}: {}", meta.id, e))
        })?;

        let meta_json = serde_json::to_vec(&meta)
            .map_err(|e| ServerError::Internal(format!("Failed to encode metadata: {e}")))?;
        let meta_path = self.safe_path(&format!("{}.json", meta.id))?;
        fs::write(&meta_path, meta_json).await.map_err(|e| {
            ServerError::AttachmentStorage(format!("Failed to write metadata {}: {}", meta.id, e))
        })?;

        debug!(id = %meta.id, size = meta.size, "Stored attachment");
        Ok(meta)
    }

    pub async fn get(&self, id: Uuid) -> Result<(AttachmentMeta, Vec<u8>), ServerError> {
        let path = self.safe_path(&id.to_string())?;
        let meta_path = self.safe_path(&format!("{id}.json"))?;

        if !path.exists() || !meta_path.exists() {
            return Err(ServerError::AttachmentNotFound(id));
        }

        let raw_meta = fs::read(&meta_path).await.map_err(|e| {
            ServerError::AttachmentStorage(format!("Failed to read metadata {}: {}", id, e))
        })?;
        let meta: AttachmentMeta = serde_json::from_slice(&raw_meta)
            .map_err(|e| ServerError::AttachmentStorage(format!("Corrupt metadata {id}: {e}")))?;

        let data = fs::read(&path).await.map_err(|e| {
            ServerError::AttachmentStorage(format!("Failed to read attachment {}: {}", id, e))
        })?;

        debug!(id = %id, size = data.len(), "Retrieved attachment");
        Ok((meta, data))
    }

    fn safe_path(&self, file_name: &str) -> Result<PathBuf, ServerError> {
        ensure_within(&self.base_path, &self.base_path.join(file_name))
    }
}

/// Keep only the final path segment of a client-supplied file name.
fn sanitize_name(name: &str) -> String {
    let base = name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .trim();
    if base.is_empty() || base == "." || base == ".." {
        "attachment".to_string()
    } else {
        base.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn test_store() -> (BlobStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = BlobStore::new(dir.path().to_path_buf(), 1024).await.unwrap();
        (store, dir)
    }

    #[tokio::test]
    async fn test_store_and_get() {
        let (store, _dir) = test_store().await;
        let data = b"%PDF-1.7 plan";

        let meta = store.store("plan.pdf", data, None).await.unwrap();
        let (read_meta, read) = store.get(meta.id).await.unwrap();
        assert_eq!(read, data);
        assert_eq!(read_meta, meta);
        assert_eq!(meta.blake3, blake3::hash(data).to_hex().to_string());
    }

    #[tokio::test]
    async fn test_hash_mismatch_rejected() {
        let (store, _dir) = test_store().await;
        let wrong = blake3::hash(b"other").to_hex().to_string();
        assert!(matches!(
            store.store("a.txt", b"content", Some(&wrong)).await,
            Err(ServerError::Chat(ChatError::ValidationFailed(_)))
        ));

        let right = blake3::hash(b"content").to_hex().to_string();
        assert!(store.store("a.txt", b"content", Some(&right)).await.is_ok());
    }

    #[tokio::test]
    async fn test_too_large_and_empty() {
        let (store, _dir) = test_store().await;
        assert!(matches!(
            store.store("big.bin", &vec![0u8; 2048], None).await,
            Err(ServerError::AttachmentTooLarge { size: 2048, max: 1024 })
        ));
        assert!(store.store("empty", b"", None).await.is_err());
    }

    #[tokio::test]
    async fn test_not_found() {
        let (store, _dir) = test_store().await;
        assert!(matches!(
            store.get(Uuid::new_v4()).await,
            Err(ServerError::AttachmentNotFound(_))
        ));
    }

    #[test]
    fn test_sanitize_name() {
        assert_eq!(sanitize_name("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_name("C:\\photos\\cat.png"), "cat.png");
        assert_eq!(sanitize_name(".."), "attachment");
        assert_eq!(sanitize_name(""), "attachment");
    }
}
