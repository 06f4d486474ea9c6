//! # tandem-shared
//!
//! Types shared by the tandem server and client: the conversation and
//! message domain model, the realtime wire protocol, the outbound status
//! state machine, the error taxonomy and protocol constants.

pub mod constants;
pub mod error;
pub mod protocol;
pub mod status;
pub mod types;

pub use error::{ChatError, ErrorCode};
pub use protocol::{ClientEvent, PresenceState, ServerEvent};
pub use status::{OutboundStatus, SyncStatus};
pub use types::*;
