use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Path, Query, State},
    http::{header, HeaderMap, HeaderValue, Method},
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;
use uuid::Uuid;

use tandem_shared::constants::CONTENT_HASH_HEADER;
use tandem_shared::{
    AttachmentRef, ChatError, ClientEvent, Conversation, ConversationId, Message, MessageId,
    MessageKind, ParticipantId, ServerEvent,
};

use crate::auth::{Authenticated, Authenticator};
use crate::blob_store::BlobStore;
use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::gateway::{Gateway, Origin};
use crate::service::ConversationService;
use crate::ws;

#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<Gateway>,
    pub service: Arc<ConversationService>,
    pub attachments: Arc<BlobStore>,
    pub authenticator: Arc<dyn Authenticator>,
    pub config: Arc<ServerConfig>,
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/ws", get(ws::ws_handler))
        .route("/conversations", post(create_conversation).get(list_conversations))
        .route("/conversations/:id", get(get_conversation))
        .route("/conversations/:id/messages", get(list_messages))
        .route("/conversations/:id/read", put(mark_conversation_read))
        .route("/messages", post(send_message))
        .route("/messages/unread/count", get(unread_count))
        .route("/messages/:id/read", put(mark_message_read))
        .route("/moderation/conversations", get(moderation_list))
        .route("/moderation/conversations/:id/close", put(moderation_close))
        .route("/attachments", post(upload_attachment))
        .route("/attachments/:id", get(download_attachment))
        .layer(DefaultBodyLimit::max(state.config.max_attachment_size))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    sessions: usize,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateConversationRequest {
    /// Defaults to the caller.
    member_id: Option<ParticipantId>,
    counterpart_id: ParticipantId,
}

#[derive(Deserialize)]
struct MessagesQuery {
    limit: Option<usize>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendMessageRequest {
    conversation_id: ConversationId,
    content: String,
    #[serde(default)]
    kind: MessageKind,
    attachment: Option<AttachmentRef>,
    client_message_id: Option<MessageId>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct MarkedReadResponse {
    message_ids: Vec<MessageId>,
}

#[derive(Serialize)]
struct UnreadCountResponse {
    count: u64,
}

#[derive(Deserialize)]
struct UploadQuery {
    name: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResponse {
    pub id: Uuid,
    pub url: String,
    pub name: String,
    pub size: usize,
    pub blake3: String,
}

async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        sessions: state.gateway.registry().session_count().await,
    })
}

async fn create_conversation(
    State(state): State<AppState>,
    Authenticated(requester): Authenticated,
    Json(req): Json<CreateConversationRequest>,
) -> Result<Json<Conversation>, ServerError> {
    let member_id = req.member_id.unwrap_or(requester.id);
    if member_id != requester.id && !requester.is_moderator() {
        return Err(ChatError::Forbidden("cannot open a conversation for someone else".into()).into());
    }
    let conversation = state
        .service
        .create_or_get_conversation(member_id, req.counterpart_id)?;
    Ok(Json(conversation))
}

async fn list_conversations(
    State(state): State<AppState>,
    Authenticated(requester): Authenticated,
) -> Result<Json<Vec<Conversation>>, ServerError> {
    Ok(Json(state.service.list_conversations(requester.id)?))
}

async fn get_conversation(
    State(state): State<AppState>,
    Authenticated(requester): Authenticated,
    Path(id): Path<ConversationId>,
) -> Result<Json<Conversation>, ServerError> {
    Ok(Json(state.service.get_conversation(id, &requester)?))
}

async fn list_messages(
    State(state): State<AppState>,
    Authenticated(requester): Authenticated,
    Path(id): Path<ConversationId>,
    Query(query): Query<MessagesQuery>,
) -> Result<Json<Vec<Message>>, ServerError> {
    Ok(Json(state.service.recent_messages(id, &requester, query.limit)?))
}

async fn mark_conversation_read(
    State(state): State<AppState>,
    Authenticated(requester): Authenticated,
    Path(id): Path<ConversationId>,
) -> Result<Json<MarkedReadResponse>, ServerError> {
    let message_ids = state
        .gateway
        .read_all(&Origin::detached(requester), id)
        .await?;
    Ok(Json(MarkedReadResponse { message_ids }))
}

/// REST send. Goes through the gateway so connected sessions see it.
async fn send_message(
    State(state): State<AppState>,
    Authenticated(requester): Authenticated,
    Json(req): Json<SendMessageRequest>,
) -> Result<Json<Message>, ServerError> {
    let event = ClientEvent::Send {
        conversation_id: req.conversation_id,
        content: req.content,
        kind: req.kind,
        attachment: req.attachment,
        client_message_id: req.client_message_id,
    };
    let replies = state
        .gateway
        .perform(&Origin::detached(requester), event)
        .await?;

    replies
        .into_iter()
        .find_map(|event| match event {
            ServerEvent::Sent { message, .. } => Some(Json(message)),
            _ => None,
        })
        .ok_or_else(|| ServerError::Internal("send produced no acknowledgement".into()))
}

async fn mark_message_read(
    State(state): State<AppState>,
    Authenticated(requester): Authenticated,
    Path(id): Path<MessageId>,
) -> Result<Json<Message>, ServerError> {
    let message = state
        .gateway
        .read_message(&Origin::detached(requester), id)
        .await?;
    Ok(Json(message))
}

async fn unread_count(
    State(state): State<AppState>,
    Authenticated(requester): Authenticated,
) -> Result<Json<UnreadCountResponse>, ServerError> {
    let count = state.service.unread_count(requester.id)?;
    Ok(Json(UnreadCountResponse { count }))
}

async fn moderation_list(
    State(state): State<AppState>,
    Authenticated(requester): Authenticated,
) -> Result<Json<Vec<Conversation>>, ServerError> {
    Ok(Json(state.service.list_for_moderation(&requester)?))
}

async fn moderation_close(
    State(state): State<AppState>,
    Authenticated(requester): Authenticated,
    Path(id): Path<ConversationId>,
) -> Result<Json<Conversation>, ServerError> {
    Ok(Json(state.service.close_conversation(id, &requester)?))
}

async fn upload_attachment(
    State(state): State<AppState>,
    Authenticated(requester): Authenticated,
    Query(query): Query<UploadQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<UploadResponse>, ServerError> {
    let expected = headers
        .get(CONTENT_HASH_HEADER)
        .and_then(|v| v.to_str().ok());

    let meta = state.attachments.store(&query.name, &body, expected).await?;

    info!(
        id = %meta.id,
        size = meta.size,
        uploader = %requester.id,
        "Attachment uploaded"
    );

    Ok(Json(UploadResponse {
        url: format!("{}/attachments/{}", state.config.public_base_url, meta.id),
        id: meta.id,
        name: meta.name,
        size: meta.size,
        blake3: meta.blake3,
    }))
}

async fn download_attachment(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ServerError> {
    let (meta, data) = state.attachments.get(id).await?;

    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    if let Ok(value) = HeaderValue::from_str(&format!("attachment; filename=\"{}\"", meta.name)) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }
    if let Ok(value) = HeaderValue::from_str(&meta.blake3) {
        headers.insert(CONTENT_HASH_HEADER, value);
    }
    Ok((headers, data))
}

pub async fn serve(state: AppState, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %addr, "Starting HTTP API server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
