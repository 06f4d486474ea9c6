//! # tandem-server
//!
//! Realtime conversation server: the conversation service, the WebSocket
//! gateway that fans events out to connected sessions, the REST surface for
//! non-realtime access, and attachment storage.

pub mod api;
pub mod auth;
pub mod blob_store;
pub mod config;
pub mod error;
pub mod gateway;
pub mod push;
pub mod registry;
pub mod service;
pub mod ws;

pub use api::{build_router, serve, AppState};
pub use config::ServerConfig;
pub use error::ServerError;
pub use gateway::{Delivery, Gateway, Origin};
pub use service::ConversationService;
