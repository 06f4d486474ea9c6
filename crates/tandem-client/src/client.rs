use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::info;

use tandem_shared::ServerEvent;

use crate::config::ClientConfig;
use crate::connectivity::Connectivity;
use crate::error::Result;
use crate::persist::JsonFileStore;
use crate::queue::SendQueue;
use crate::transport::GatewayTransport;
use crate::upload::HttpUploader;

/// A running client: gateway link, send queue, drain worker and receipt
/// tracker. Background tasks stop when the client is dropped.
pub struct Client {
    pub queue: SendQueue,
    pub gateway: GatewayTransport,
    connectivity: Connectivity,
    tasks: Vec<JoinHandle<()>>,
}

impl Client {
    pub async fn start(config: ClientConfig) -> Result<Self> {
        let connectivity = Connectivity::new(false);
        let (gateway, link) = GatewayTransport::spawn(config.gateway_url(), connectivity.clone());

        let queue = match SendQueue::open(
            Arc::new(JsonFileStore::new(config.queue_path.clone())),
            Arc::new(gateway.clone()),
            Arc::new(HttpUploader::new(&config)),
            connectivity.clone(),
            config.attempt_timeout,
        )
        .await
        {
            Ok(queue) => queue,
            Err(e) => {
                link.abort();
                return Err(e);
            }
        };

        let receipts = queue.track_receipts(gateway.subscribe());
        let worker = queue.spawn_worker(config.drain_interval);

        info!(
            participant = %config.participant_id,
            server = %config.server_url,
            "Client started"
        );

        Ok(Self {
            queue,
            gateway,
            connectivity,
            tasks: vec![link, receipts, worker],
        })
    }

    pub fn is_online(&self) -> bool {
        self.connectivity.is_online()
    }

    /// Every event the gateway pushes to this client.
    pub fn events(&self) -> broadcast::Receiver<ServerEvent> {
        self.gateway.subscribe()
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::net::SocketAddr;
    use std::path::Path;
    use std::sync::Mutex;
    use std::time::Duration;

    use tandem_server::auth::{StoreDirectory, TrustedHeaderAuthenticator};
    use tandem_server::blob_store::BlobStore;
    use tandem_server::push::LogPushSink;
    use tandem_server::registry::InMemorySessionRegistry;
    use tandem_server::{build_router, AppState, ConversationService, Gateway, ServerConfig};
    use tandem_shared::{
        ConversationId, MessageId, MessageKind, OutboundStatus, Participant, ParticipantId,
        Role,
    };
    use tandem_store::Database;
    use tempfile::TempDir;

    struct Server {
        addr: SocketAddr,
        member: Participant,
        counterpart: Participant,
        conversation: ConversationId,
    }

    async fn start_server(dir: &Path) -> Server {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let db = Arc::new(Mutex::new(Database::open_in_memory().unwrap()));
        let member = Participant::new(ParticipantId::new(), Role::Member);
        let counterpart = Participant::new(ParticipantId::new(), Role::Counterpart);
        {
            let guard = db.lock().unwrap();
            guard.upsert_participant(&member).unwrap();
            guard.upsert_participant(&counterpart).unwrap();
        }

        let directory = Arc::new(StoreDirectory::new(db.clone()));
        let service = Arc::new(ConversationService::new(db.clone(), directory.clone()));
        let conversation = service
            .create_or_get_conversation(member.id, counterpart.id)
            .unwrap()
            .id;

        let config = ServerConfig {
            attachment_storage_path: dir.join("attachments"),
            public_base_url: format!("http://{addr}"),
            ..ServerConfig::default()
        };
        let state = AppState {
            gateway: Arc::new(Gateway::new(
                service.clone(),
                Arc::new(InMemorySessionRegistry::new()),
                Arc::new(LogPushSink),
                config.history_replay_limit,
            )),
            service,
            attachments: Arc::new(
                BlobStore::new(
                    config.attachment_storage_path.clone(),
                    config.max_attachment_size,
                )
                .await
                .unwrap(),
            ),
            authenticator: Arc::new(TrustedHeaderAuthenticator::new(directory)),
            config: Arc::new(config),
        };
        tokio::spawn(async move {
            axum::serve(listener, build_router(state)).await.unwrap();
        });

        Server {
            addr,
            member,
            counterpart,
            conversation,
        }
    }

    async fn start_client(server: &Server, who: &Participant, dir: &Path) -> Client {
        let config = ClientConfig::with_queue_path(
            format!("http://{}", server.addr),
            who.id,
            dir.join(format!("{}.json", who.id)),
        );
        let client = Client::start(config).await.unwrap();
        let mut online = client.connectivity.subscribe();
        tokio::time::timeout(Duration::from_secs(10), online.wait_for(|up| *up))
            .await
            .expect("client did not connect")
            .unwrap();
        client
    }

    async fn next_event<F>(rx: &mut broadcast::Receiver<ServerEvent>, want: F) -> ServerEvent
    where
        F: Fn(&ServerEvent) -> bool,
    {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                match rx.recv().await {
                    Ok(event) if want(&event) => return event,
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(e) => panic!("event stream ended: {e}"),
                }
            }
        })
        .await
        .expect("event not received in time")
    }

    async fn wait_for_status<F>(queue: &SendQueue, id: MessageId, want: F)
    where
        F: Fn(OutboundStatus) -> bool,
    {
        tokio::time::timeout(Duration::from_secs(10), async {
            while !queue.status(id).await.is_some_and(&want) {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("status not reached in time");
    }

    #[tokio::test]
    async fn message_reaches_room_and_read_receipt_comes_back() {
        let dir = TempDir::new().unwrap();
        let server = start_server(dir.path()).await;
        let member = start_client(&server, &server.member, dir.path()).await;
        let counterpart = start_client(&server, &server.counterpart, dir.path()).await;

        let mut member_events = member.events();
        let mut inbox = counterpart.events();
        member.gateway.join(server.conversation).unwrap();
        counterpart.gateway.join(server.conversation).unwrap();
        next_event(&mut member_events, |e| matches!(e, ServerEvent::History { .. })).await;
        next_event(&mut inbox, |e| matches!(e, ServerEvent::History { .. })).await;

        let id = member
            .queue
            .send_message(server.conversation, "Hello")
            .await
            .unwrap();
        wait_for_status(&member.queue, id, |s| s == OutboundStatus::Delivered).await;

        let received = match next_event(&mut inbox, |e| matches!(e, ServerEvent::Message { .. })).await {
            ServerEvent::Message { message, .. } => message,
            other => panic!("unexpected event: {other:?}"),
        };
        assert_eq!(received.id, id);
        assert_eq!(received.content, "Hello");

        counterpart
            .gateway
            .mark_read(received.id, server.conversation)
            .unwrap();
        wait_for_status(&member.queue, id, |s| s == OutboundStatus::Read).await;
    }

    #[tokio::test]
    async fn message_to_offline_receiver_is_delivered_once_they_join() {
        let dir = TempDir::new().unwrap();
        let server = start_server(dir.path()).await;
        let member = start_client(&server, &server.member, dir.path()).await;

        let id = member
            .queue
            .send_message(server.conversation, "see you later")
            .await
            .unwrap();
        wait_for_status(&member.queue, id, |s| s == OutboundStatus::Sent).await;

        let counterpart = start_client(&server, &server.counterpart, dir.path()).await;
        let mut inbox = counterpart.events();
        counterpart.gateway.join(server.conversation).unwrap();
        match next_event(&mut inbox, |e| matches!(e, ServerEvent::History { .. })).await {
            ServerEvent::History { messages, .. } => assert_eq!(messages[0].id, id),
            other => panic!("unexpected event: {other:?}"),
        }
        wait_for_status(&member.queue, id, |s| s == OutboundStatus::Delivered).await;
    }

    #[tokio::test]
    async fn attachment_is_uploaded_then_sent() {
        let dir = TempDir::new().unwrap();
        let server = start_server(dir.path()).await;
        let member = start_client(&server, &server.member, dir.path()).await;
        let mut events = member.events();
        member.gateway.join(server.conversation).unwrap();
        next_event(&mut events, |e| matches!(e, ServerEvent::History { .. })).await;

        let data = vec![42u8; 200 * 1024];
        let id = member
            .queue
            .send_attachment(
                server.conversation,
                MessageKind::Image,
                "",
                "photo.jpg",
                data.clone(),
            )
            .await
            .unwrap();
        wait_for_status(&member.queue, id, |s| {
            matches!(
                s,
                OutboundStatus::Sent | OutboundStatus::Delivered | OutboundStatus::Read
            )
        })
        .await;

        let message = match next_event(&mut events, |e| matches!(e, ServerEvent::Message { .. })).await {
            ServerEvent::Message { message, .. } => message,
            other => panic!("unexpected event: {other:?}"),
        };
        let attachment = message.attachment.expect("message carries the upload");
        assert_eq!(attachment.name, "photo.jpg");

        let downloaded = reqwest::get(&attachment.url)
            .await
            .unwrap()
            .bytes()
            .await
            .unwrap();
        assert_eq!(downloaded.as_ref(), data.as_slice());
    }
}
