//! # tandem-server
//!
//! This binary provides:
//! - **WebSocket gateway** at `/ws` that broadcasts conversation events to
//!   joined sessions and notifies connected participants outside the room
//! - **REST API** (axum) for conversations, messages, read state and
//!   moderation
//! - **Attachment storage** on local disk, addressed by opaque URL

use std::sync::{Arc, Mutex};

use tracing::info;
use tracing_subscriber::EnvFilter;

use tandem_server::auth::{StoreDirectory, TrustedHeaderAuthenticator};
use tandem_server::blob_store::BlobStore;
use tandem_server::push::LogPushSink;
use tandem_server::registry::InMemorySessionRegistry;
use tandem_server::{api, AppState, ConversationService, Gateway, ServerConfig};
use tandem_store::Database;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,tandem_server=debug")),
        )
        .init();

    info!("Starting tandem server v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ServerConfig::from_env();
    info!(?config, "Loaded configuration");

    // -----------------------------------------------------------------------
    // 3. Initialize subsystems
    // -----------------------------------------------------------------------

    // Store (runs migrations on open)
    let db = Arc::new(Mutex::new(Database::open_at(&config.database_path)?));
    let directory = Arc::new(StoreDirectory::new(db.clone()));

    let service = Arc::new(ConversationService::new(db, directory.clone()));

    // Attachment store (creates directory if missing)
    let attachments = Arc::new(
        BlobStore::new(
            config.attachment_storage_path.clone(),
            config.max_attachment_size,
        )
        .await?,
    );

    let gateway = Arc::new(Gateway::new(
        service.clone(),
        Arc::new(InMemorySessionRegistry::new()),
        Arc::new(LogPushSink),
        config.history_replay_limit,
    ));

    let app_state = AppState {
        gateway: gateway.clone(),
        service,
        attachments,
        authenticator: Arc::new(TrustedHeaderAuthenticator::new(directory)),
        config: Arc::new(config.clone()),
    };

    // -----------------------------------------------------------------------
    // 4. Spawn background tasks
    // -----------------------------------------------------------------------

    // Drop idle per-conversation locks every 5 minutes
    let gw = gateway.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(300));
        loop {
            interval.tick().await;
            let pruned = gw.sequencer().prune().await;
            if pruned > 0 {
                tracing::debug!(pruned, "Pruned idle conversation locks");
            }
        }
    });

    // -----------------------------------------------------------------------
    // 5. Run the HTTP/WebSocket server (blocks until shutdown)
    // -----------------------------------------------------------------------
    tokio::select! {
        result = api::serve(app_state, config.http_addr) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "HTTP server failed");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
