//! # tandem-store
//!
//! SQLite persistence for participants, conversations and messages.
//!
//! The crate exposes a synchronous [`Database`] handle wrapping a
//! `rusqlite::Connection` with typed helpers for every table. Each helper
//! is a single statement or a single transaction, so the per-row atomicity
//! of SQLite is what serializes concurrent writes to one conversation.

pub mod conversations;
pub mod database;
pub mod messages;
pub mod migrations;
pub mod participants;

mod error;

pub use database::Database;
pub use error::{Result, StoreError};
