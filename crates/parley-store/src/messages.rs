//! Cached message history.
//!
//! Rows are identified by `(chat_id, server_id)` when the server has
//! assigned an id; id-less optimistic copies are ordinary rows told
//! apart by rowid, since their timestamp-derived order key can collide
//! within a second.

use rusqlite::params;

use parley_shared::Message;

use crate::database::Database;
use crate::error::Result;

impl Database {
    /// Insert a single message. A message carrying an already-cached
    /// server id replaces the existing row; id-less messages always get
    /// a fresh row of their own.
    pub fn upsert_message(&self, message: &Message) -> Result<()> {
        self.conn().execute(
            "INSERT OR REPLACE INTO messages (chat_id, order_key, server_id, sender, body, sent_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                message.chat_id,
                message.order_key(),
                message.id,
                message.sender,
                message.message,
                message.timestamp,
            ],
        )?;
        Ok(())
    }

    /// Replace the whole cached history of a chat in one transaction.
    ///
    /// Reconciliation calls this after every merged page so partial
    /// progress survives a crash.
    pub fn replace_history(&mut self, chat_id: i64, messages: &[Message]) -> Result<()> {
        let tx = self.conn_mut().transaction()?;
        tx.execute("DELETE FROM messages WHERE chat_id = ?1", params![chat_id])?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO messages (chat_id, order_key, server_id, sender, body, sent_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for message in messages {
                stmt.execute(params![
                    chat_id,
                    message.order_key(),
                    message.id,
                    message.sender,
                    message.message,
                    message.timestamp,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Full cached history of a chat, ascending by order key with
    /// insertion order breaking same-second ties.
    pub fn history(&self, chat_id: i64) -> Result<Vec<Message>> {
        let mut stmt = self.conn().prepare(
            "SELECT server_id, chat_id, sender, body, sent_at
             FROM messages
             WHERE chat_id = ?1
             ORDER BY order_key ASC, rowid ASC",
        )?;

        let rows = stmt.query_map(params![chat_id], row_to_message)?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }

    /// Number of cached messages for a chat.
    pub fn history_len(&self, chat_id: i64) -> Result<u64> {
        let count: u64 = self.conn().query_row(
            "SELECT COUNT(*) FROM messages WHERE chat_id = ?1",
            params![chat_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Remove exactly one id-less local copy matching the key, sender,
    /// and body. Used to roll back an optimistic append whose send
    /// failed, and to replace an optimistic copy once the server echo
    /// arrives under its real id. A different same-second message is
    /// left alone.
    pub fn delete_local_message(
        &self,
        chat_id: i64,
        order_key: i64,
        sender: &str,
        body: &str,
    ) -> Result<bool> {
        let affected = self.conn().execute(
            "DELETE FROM messages WHERE rowid = (
                 SELECT rowid FROM messages
                 WHERE chat_id = ?1 AND order_key = ?2
                   AND sender = ?3 AND body = ?4
                   AND server_id IS NULL
                 LIMIT 1
             )",
            params![chat_id, order_key, sender, body],
        )?;
        Ok(affected > 0)
    }

    /// Drop the oldest messages of a chat beyond `max_messages`.
    /// Returns how many rows were removed.
    pub fn trim_history(&self, chat_id: i64, max_messages: usize) -> Result<usize> {
        let affected = self.conn().execute(
            "DELETE FROM messages
             WHERE chat_id = ?1
               AND rowid NOT IN (
                   SELECT rowid FROM messages
                   WHERE chat_id = ?1
                   ORDER BY order_key DESC, rowid DESC
                   LIMIT ?2
               )",
            params![chat_id, max_messages as i64],
        )?;
        Ok(affected)
    }
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    Ok(Message {
        id: row.get(0)?,
        chat_id: row.get(1)?,
        sender: row.get(2)?,
        message: row.get(3)?,
        timestamp: row.get(4)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> (tempfile::TempDir, Database) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_at(&dir.path().join("test.db")).unwrap();
        (dir, db)
    }

    fn msg(chat_id: i64, id: i64, body: &str) -> Message {
        Message {
            id: Some(id),
            chat_id,
            sender: "ana".into(),
            message: body.into(),
            timestamp: format!("2024-01-02T10:30:{:02}", id % 60),
        }
    }

    #[test]
    fn history_round_trip_is_ascending() {
        let (_dir, mut db) = test_db();

        db.replace_history(7, &[msg(7, 3, "c"), msg(7, 1, "a"), msg(7, 2, "b")])
            .unwrap();

        let history = db.history(7).unwrap();
        let keys: Vec<i64> = history.iter().map(|m| m.order_key()).collect();
        assert_eq!(keys, vec![1, 2, 3]);
        assert_eq!(db.history_len(7).unwrap(), 3);
        assert!(db.history(8).unwrap().is_empty());
    }

    fn local(chat_id: i64, body: &str, sent_at: &str) -> Message {
        Message {
            id: None,
            chat_id,
            sender: "me".into(),
            message: body.into(),
            timestamp: sent_at.into(),
        }
    }

    #[test]
    fn upsert_is_idempotent_per_server_id() {
        let (_dir, db) = test_db();

        db.upsert_message(&msg(7, 5, "first")).unwrap();
        db.upsert_message(&msg(7, 5, "second")).unwrap();

        let history = db.history(7).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].message, "second");
    }

    #[test]
    fn same_second_local_messages_both_survive() {
        let (_dir, db) = test_db();

        // Both derive the same order key; neither may overwrite the other.
        db.upsert_message(&local(7, "first", "2024-01-02T10:30:05.100Z"))
            .unwrap();
        db.upsert_message(&local(7, "second", "2024-01-02T10:30:05.900Z"))
            .unwrap();

        let history = db.history(7).unwrap();
        let bodies: Vec<&str> = history.iter().map(|m| m.message.as_str()).collect();
        assert_eq!(bodies, vec!["first", "second"]);

        let key = history[0].order_key();
        assert_eq!(key, history[1].order_key());

        // Deleting one of them only removes the matching body.
        assert!(db.delete_local_message(7, key, "me", "first").unwrap());
        let bodies: Vec<String> = db
            .history(7)
            .unwrap()
            .into_iter()
            .map(|m| m.message)
            .collect();
        assert_eq!(bodies, vec!["second"]);
    }

    #[test]
    fn trim_keeps_newest() {
        let (_dir, mut db) = test_db();

        let messages: Vec<Message> = (1..=10).map(|i| msg(7, i, "m")).collect();
        db.replace_history(7, &messages).unwrap();

        let removed = db.trim_history(7, 4).unwrap();
        assert_eq!(removed, 6);

        let keys: Vec<i64> = db.history(7).unwrap().iter().map(|m| m.order_key()).collect();
        assert_eq!(keys, vec![7, 8, 9, 10]);
    }

    #[test]
    fn delete_local_message_reports_presence_and_skips_server_rows() {
        let (_dir, db) = test_db();

        let message = local(7, "x", "2024-01-02T10:30:05");
        let key = message.order_key();
        db.upsert_message(&message).unwrap();

        assert!(db.delete_local_message(7, key, "me", "x").unwrap());
        assert!(!db.delete_local_message(7, key, "me", "x").unwrap());

        // An id-bearing row is never a rollback target.
        db.upsert_message(&msg(7, 5, "y")).unwrap();
        assert!(!db.delete_local_message(7, 5, "ana", "y").unwrap());
        assert_eq!(db.history_len(7).unwrap(), 1);
    }
}
