//! v002 -- Group chats.
//!
//! Adds `groups` and `group_members`. Each membership row carries the
//! member's copy of the group key, wrapped under the member's public key.

use rusqlite::Connection;

const UP_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS groups (
    id         TEXT PRIMARY KEY NOT NULL,   -- UUID v4
    name       TEXT NOT NULL,
    creator    TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS group_members (
    group_id    TEXT NOT NULL,
    user_id     TEXT NOT NULL,
    added_by    TEXT NOT NULL,
    added_at    TEXT NOT NULL,
    wrapped_key TEXT,                       -- base64, NULL until distributed
    key_version INTEGER,                    -- member key version used to wrap

    PRIMARY KEY (group_id, user_id),
    FOREIGN KEY (group_id) REFERENCES groups(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_group_members_user ON group_members(user_id);
"#;

pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
