//! Attachment upload over HTTP.
//!
//! The body is streamed in fixed-size chunks so progress reflects bytes
//! handed to the connection rather than a fake ramp.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use reqwest::{header, StatusCode};
use serde::Deserialize;
use tracing::{debug, info};

use tandem_shared::constants::{CONTENT_HASH_HEADER, PARTICIPANT_HEADER, UPLOAD_CHUNK_SIZE};
use tandem_shared::{AttachmentRef, ChatError, ParticipantId};

use crate::config::ClientConfig;
use crate::error::TransportError;
use crate::queue::PendingBlob;

/// Receives the uploaded fraction, in `[0, 1]`.
pub type ProgressFn = Arc<dyn Fn(f32) + Send + Sync>;

#[async_trait]
pub trait Uploader: Send + Sync {
    async fn upload(
        &self,
        blob: &PendingBlob,
        progress: ProgressFn,
    ) -> Result<AttachmentRef, TransportError>;
}

#[derive(Deserialize)]
struct UploadResponse {
    url: String,
    name: String,
}

#[derive(Deserialize)]
struct ErrorBody {
    error: String,
}

pub struct HttpUploader {
    client: reqwest::Client,
    url: String,
    participant_id: ParticipantId,
}

impl HttpUploader {
    pub fn new(config: &ClientConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: config.upload_url(),
            participant_id: config.participant_id,
        }
    }
}

#[async_trait]
impl Uploader for HttpUploader {
    async fn upload(
        &self,
        blob: &PendingBlob,
        progress: ProgressFn,
    ) -> Result<AttachmentRef, TransportError> {
        if blob.data.is_empty() {
            return Err(TransportError::Rejected(ChatError::ValidationFailed(
                "empty attachment".into(),
            )));
        }

        let data = Bytes::from(blob.data.clone());
        let size = data.len();
        let digest = blake3::hash(&data).to_hex().to_string();
        debug!(name = %blob.name, size, "Uploading attachment");

        let resp = self
            .client
            .post(&self.url)
            .query(&[("name", blob.name.as_str())])
            .header(PARTICIPANT_HEADER, self.participant_id.to_string())
            .header(CONTENT_HASH_HEADER, digest)
            .header(header::CONTENT_TYPE, "application/octet-stream")
            .body(reqwest::Body::wrap_stream(chunked(data, progress.clone())))
            .send()
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let message = match resp.json::<ErrorBody>().await {
                Ok(body) => body.error,
                Err(_) => status.to_string(),
            };
            return Err(classify(status, message));
        }

        let uploaded: UploadResponse = resp
            .json()
            .await
            .map_err(|e| TransportError::Protocol(format!("bad upload response: {e}")))?;
        progress(1.0);
        info!(name = %uploaded.name, size, "Attachment uploaded");

        Ok(AttachmentRef {
            url: uploaded.url,
            name: uploaded.name,
        })
    }
}

/// Client errors are final; anything else may succeed on a later attempt.
fn classify(status: StatusCode, message: String) -> TransportError {
    match status {
        StatusCode::BAD_REQUEST | StatusCode::PAYLOAD_TOO_LARGE => {
            TransportError::Rejected(ChatError::ValidationFailed(message))
        }
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            TransportError::Rejected(ChatError::Forbidden(message))
        }
        StatusCode::NOT_FOUND => TransportError::Rejected(ChatError::NotFound(message)),
        _ => TransportError::Connection(format!("{status}: {message}")),
    }
}

fn chunked(
    data: Bytes,
    progress: ProgressFn,
) -> impl Stream<Item = Result<Bytes, std::io::Error>> + Send + Sync + 'static {
    let total = data.len();
    let chunks: Vec<Bytes> = (0..total)
        .step_by(UPLOAD_CHUNK_SIZE)
        .map(|start| data.slice(start..(start + UPLOAD_CHUNK_SIZE).min(total)))
        .collect();
    let mut sent = 0usize;
    futures::stream::iter(chunks).map(move |chunk| {
        sent += chunk.len();
        progress(sent as f32 / total as f32);
        Ok(chunk)
    })
}
