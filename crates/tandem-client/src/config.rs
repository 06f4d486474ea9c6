//! Client configuration.

use std::path::PathBuf;
use std::time::Duration;

use tandem_shared::constants::{APP_NAME, ATTEMPT_TIMEOUT_SECS, DRAIN_INTERVAL_SECS};
use tandem_shared::ParticipantId;

use crate::error::{ClientError, Result};

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// HTTP base URL of the server, e.g. `http://localhost:8080`.
    pub server_url: String,

    /// Identity asserted to the server. In production this is set by the
    /// auth proxy in front of the server; the client only forwards it.
    pub participant_id: ParticipantId,

    /// File the send queue is persisted to.
    pub queue_path: PathBuf,

    /// Opportunistic drain interval. Default 30 s.
    pub drain_interval: Duration,

    /// Bound on a single drain attempt. Default 10 s.
    pub attempt_timeout: Duration,
}

impl ClientConfig {
    /// Config with the queue file in the platform data directory.
    pub fn new(server_url: impl Into<String>, participant_id: ParticipantId) -> Result<Self> {
        let dirs = directories::ProjectDirs::from("org", APP_NAME, APP_NAME)
            .ok_or(ClientError::NoDataDir)?;
        let queue_path = dirs
            .data_dir()
            .join(format!("send-queue-{participant_id}.json"));
        Ok(Self::with_queue_path(server_url, participant_id, queue_path))
    }

    pub fn with_queue_path(
        server_url: impl Into<String>,
        participant_id: ParticipantId,
        queue_path: PathBuf,
    ) -> Self {
        Self {
            server_url: server_url.into().trim_end_matches('/').to_string(),
            participant_id,
            queue_path,
            drain_interval: Duration::from_secs(DRAIN_INTERVAL_SECS),
            attempt_timeout: Duration::from_secs(ATTEMPT_TIMEOUT_SECS),
        }
    }

    /// WebSocket endpoint of the gateway.
    pub fn gateway_url(&self) -> String {
        let base = if let Some(rest) = self.server_url.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = self.server_url.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            self.server_url.clone()
        };
        format!("{base}/ws?participant={}", self.participant_id)
    }

    /// Attachment upload endpoint.
    pub fn upload_url(&self) -> String {
        format!("{}/attachments", self.server_url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_urls() {
        let p = ParticipantId::new();
        let config = ClientConfig::with_queue_path("https://chat.example.org/", p, "q.json".into());
        assert_eq!(
            config.gateway_url(),
            format!("wss://chat.example.org/ws?participant={p}")
        );
        assert_eq!(config.upload_url(), "https://chat.example.org/attachments");
        assert_eq!(config.drain_interval, Duration::from_secs(30));
        assert_eq!(config.attempt_timeout, Duration::from_secs(10));
    }
}
