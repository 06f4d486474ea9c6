/// Application name
pub const APP_NAME: &str = "tandem";

/// Number of characters of message content kept in a conversation preview
pub const PREVIEW_MAX_CHARS: usize = 50;

/// Marker appended to a truncated preview
pub const PREVIEW_ELLIPSIS: &str = "...";

/// Maximum message content length in characters
pub const MAX_MESSAGE_CHARS: usize = 4000;

/// Number of failed attempts after which a queued action is given up
pub const MAX_SEND_ATTEMPTS: u32 = 3;

/// Interval between opportunistic drains of the client queue, in seconds
pub const DRAIN_INTERVAL_SECS: u64 = 30;

/// Per-attempt timeout for a drain call, in seconds
pub const ATTEMPT_TIMEOUT_SECS: u64 = 10;

/// Default number of messages replayed to a session joining a room
pub const DEFAULT_HISTORY_REPLAY_LIMIT: usize = 200;

/// Maximum attachment size in bytes (25 MiB)
pub const MAX_ATTACHMENT_SIZE: usize = 25 * 1024 * 1024;

/// Size of one upload chunk; progress is reported per chunk
pub const UPLOAD_CHUNK_SIZE: usize = 64 * 1024;

/// Header carrying the hex BLAKE3 digest of an uploaded attachment
pub const CONTENT_HASH_HEADER: &str = "x-content-blake3";

/// Header carrying the authenticated participant id (set by the auth proxy)
pub const PARTICIPANT_HEADER: &str = "x-participant-id";

/// Default HTTP API port (server)
pub const DEFAULT_HTTP_PORT: u16 = 8080;
