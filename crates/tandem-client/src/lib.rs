//! # tandem-client
//!
//! Client side of tandem conversations: a durable send queue that keeps
//! outbound actions in order across disconnects, the WebSocket link to the
//! gateway, and chunked attachment upload with progress.

pub mod client;
pub mod config;
pub mod connectivity;
pub mod error;
pub mod events;
pub mod persist;
pub mod queue;
pub mod transport;
pub mod upload;

pub use client::Client;
pub use config::ClientConfig;
pub use connectivity::Connectivity;
pub use error::{ClientError, TransportError};
pub use events::QueueEvent;
pub use queue::{DrainReport, QueueAction, SendQueue, SyncQueueItem};
pub use transport::{GatewayTransport, SendReceipt, Transport};
pub use upload::{HttpUploader, Uploader};
