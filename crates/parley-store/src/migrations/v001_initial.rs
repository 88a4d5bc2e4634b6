//! v001 -- Initial schema creation.
//!
//! Creates the three core tables: `messages`, `chat_previews`, and
//! `sync_state`.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Cached message history, one row per message per chat.
-- order_key is the server-assigned message id when present, else a
-- timestamp-derived proxy. The proxy orders rows but is not an
-- identity: id-less messages sent within the same second share it, so
-- only id-bearing rows get a uniqueness constraint and same-key local
-- rows are told apart by rowid.
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS messages (
    chat_id   INTEGER NOT NULL,
    order_key INTEGER NOT NULL,
    server_id INTEGER,                        -- NULL on optimistic local copies
    sender    TEXT NOT NULL,
    body      TEXT NOT NULL,
    sent_at   TEXT NOT NULL                   -- ISO-8601 as received
);

CREATE UNIQUE INDEX IF NOT EXISTS messages_server_identity
    ON messages (chat_id, server_id) WHERE server_id IS NOT NULL;

CREATE INDEX IF NOT EXISTS messages_chat_order
    ON messages (chat_id, order_key);

-- ----------------------------------------------------------------
-- Conversation list snapshot.
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS chat_previews (
    chat_id              INTEGER PRIMARY KEY NOT NULL,
    receiver_username    TEXT NOT NULL,
    last_message_sender  TEXT NOT NULL DEFAULT '',
    last_message_content TEXT NOT NULL DEFAULT '',
    last_message_sent_at TEXT NOT NULL DEFAULT ''
);

-- ----------------------------------------------------------------
-- Per-chat reconciliation stamps.
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS sync_state (
    chat_id        INTEGER PRIMARY KEY NOT NULL,
    last_synced_at INTEGER NOT NULL            -- epoch millis
);
"#;

pub fn up(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(UP_SQL)
}
