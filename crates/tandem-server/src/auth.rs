//! Identity seams.
//!
//! Identity and roles belong to an external auth collaborator. This module
//! only defines how the server asks for them: [`ParticipantDirectory`]
//! resolves ids to participants, and [`Authenticator`] turns an incoming
//! request into one.

use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;

use tandem_shared::constants::PARTICIPANT_HEADER;
use tandem_shared::error::Result;
use tandem_shared::{ChatError, Participant, ParticipantId};
use tandem_store::StoreError;

use crate::api::AppState;
use crate::error::ServerError;
use crate::service::SharedDb;

/// Read-only view of the participant registry.
pub trait ParticipantDirectory: Send + Sync {
    /// Resolve an active participant, or `NotFound`.
    fn resolve(&self, id: ParticipantId) -> Result<Participant>;
}

/// Directory backed by the mirrored `participants` table.
pub struct StoreDirectory {
    db: SharedDb,
}

impl StoreDirectory {
    pub fn new(db: SharedDb) -> Self {
        Self { db }
    }
}

impl ParticipantDirectory for StoreDirectory {
    fn resolve(&self, id: ParticipantId) -> Result<Participant> {
        let db = self
            .db
            .lock()
            .map_err(|e| ChatError::Internal(format!("store lock poisoned: {e}")))?;
        db.get_participant(id).map_err(|e| match e {
            StoreError::NotFound => ChatError::NotFound(format!("participant {id} not found")),
            other => ChatError::Internal(other.to_string()),
        })
    }
}

/// Turns request credentials into a participant.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, parts: &Parts) -> std::result::Result<Participant, ServerError>;
}

/// Trusts a participant id set by an upstream auth proxy, either in the
/// `x-participant-id` header or, for WebSocket upgrades from browsers, the
/// `participant` query parameter.
pub struct TrustedHeaderAuthenticator {
    directory: Arc<dyn ParticipantDirectory>,
}

impl TrustedHeaderAuthenticator {
    pub fn new(directory: Arc<dyn ParticipantDirectory>) -> Self {
        Self { directory }
    }
}

#[async_trait]
impl Authenticator for TrustedHeaderAuthenticator {
    async fn authenticate(&self, parts: &Parts) -> std::result::Result<Participant, ServerError> {
        let raw = parts
            .headers
            .get(PARTICIPANT_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .or_else(|| query_param(parts.uri.query(), "participant"))
            .ok_or_else(|| ServerError::Unauthorized("missing participant credentials".into()))?;

        let id = ParticipantId::parse(raw.trim())
            .map_err(|_| ServerError::Unauthorized("malformed participant id".into()))?;

        self.directory.resolve(id).map_err(|e| match e {
            ChatError::NotFound(_) => ServerError::Unauthorized(format!("unknown participant {id}")),
            other => ServerError::Chat(other),
        })
    }
}

fn query_param(query: Option<&str>, key: &str) -> Option<String> {
    query?
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(k, _)| *k == key)
        .map(|(_, v)| v.to_string())
}

/// Extractor for the authenticated caller.
pub struct Authenticated(pub Participant);

#[async_trait]
impl FromRequestParts<AppState> for Authenticated {
    type Rejection = ServerError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> std::result::Result<Self, Self::Rejection> {
        state.authenticator.authenticate(parts).await.map(Authenticated)
    }
}
