//! v001 -- Initial schema creation.
//!
//! Creates the three tables: `participants`, `conversations` and `messages`.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Participants (mirrored from the auth collaborator)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS participants (
    id           TEXT PRIMARY KEY NOT NULL,   -- UUID
    role         TEXT NOT NULL
                 CHECK (role IN ('member', 'counterpart', 'moderator')),
    display_name TEXT,
    is_active    INTEGER NOT NULL DEFAULT 1,  -- boolean 0/1
    created_at   TEXT NOT NULL                -- RFC-3339, microseconds
);

-- ----------------------------------------------------------------
-- Conversations
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS conversations (
    id                   TEXT PRIMARY KEY NOT NULL,   -- UUID v4
    member_id            TEXT NOT NULL,               -- FK -> participants(id)
    counterpart_id       TEXT NOT NULL,               -- FK -> participants(id)
    pair_key             TEXT NOT NULL,               -- sorted "a:b", unordered pair
    status               TEXT NOT NULL DEFAULT 'active'
                         CHECK (status IN ('active', 'archived', 'closed')),
    member_typing        INTEGER NOT NULL DEFAULT 0,
    counterpart_typing   INTEGER NOT NULL DEFAULT 0,
    last_message_at      TEXT,
    last_message_preview TEXT,
    created_at           TEXT NOT NULL,

    FOREIGN KEY (member_id) REFERENCES participants(id),
    FOREIGN KEY (counterpart_id) REFERENCES participants(id)
);

-- At most one active conversation per unordered pair.
CREATE UNIQUE INDEX IF NOT EXISTS idx_conversations_active_pair
    ON conversations(pair_key) WHERE status = 'active';

CREATE INDEX IF NOT EXISTS idx_conversations_member ON conversations(member_id);
CREATE INDEX IF NOT EXISTS idx_conversations_counterpart ON conversations(counterpart_id);

-- ----------------------------------------------------------------
-- Messages
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS messages (
    id              TEXT PRIMARY KEY NOT NULL,  -- UUID
    conversation_id TEXT NOT NULL,              -- FK -> conversations(id)
    sender_id       TEXT NOT NULL,              -- FK -> participants(id)
    receiver_id     TEXT NOT NULL,              -- FK -> participants(id)
    content         TEXT NOT NULL,
    kind            TEXT NOT NULL DEFAULT 'text'
                    CHECK (kind IN ('text', 'image', 'file', 'system')),
    is_read         INTEGER NOT NULL DEFAULT 0,
    attachment_url  TEXT,
    attachment_name TEXT,
    created_at      TEXT NOT NULL,

    FOREIGN KEY (conversation_id) REFERENCES conversations(id),
    FOREIGN KEY (sender_id) REFERENCES participants(id),
    FOREIGN KEY (receiver_id) REFERENCES participants(id)
);

CREATE INDEX IF NOT EXISTS idx_messages_conversation_ts
    ON messages(conversation_id, created_at);

CREATE INDEX IF NOT EXISTS idx_messages_unread
    ON messages(receiver_id, is_read);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
