//! v001 -- Initial schema creation.
//!
//! Creates the `messages` table and the `public_keys` directory.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Messages (content is an opaque envelope or plaintext fallback)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS messages (
    id              TEXT PRIMARY KEY NOT NULL,  -- UUID v4
    sender_id       TEXT NOT NULL,
    recipient_id    TEXT NOT NULL,              -- user id or group id
    conversation_id TEXT NOT NULL,
    content         TEXT NOT NULL,
    attachments     TEXT NOT NULL DEFAULT '[]', -- JSON array of strings
    timestamp       TEXT NOT NULL,              -- RFC-3339, fixed width
    is_read         INTEGER NOT NULL DEFAULT 0, -- boolean 0/1
    is_group        INTEGER NOT NULL DEFAULT 0  -- boolean 0/1
);

CREATE INDEX IF NOT EXISTS idx_messages_conversation_ts
    ON messages(conversation_id, timestamp DESC);

CREATE INDEX IF NOT EXISTS idx_messages_unread
    ON messages(recipient_id, is_read);

-- ----------------------------------------------------------------
-- Public key directory
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS public_keys (
    user_id     TEXT PRIMARY KEY NOT NULL,
    public_key  TEXT NOT NULL,                  -- base64 X25519 key
    key_version INTEGER NOT NULL,
    updated_at  TEXT NOT NULL
);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
