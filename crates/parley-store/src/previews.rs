//! Conversation-list snapshot.
//!
//! The preview rows mirror the server's `my-chats` response so the list
//! can still be rendered when a fetch fails. Rows are upserted, never
//! deleted; the server owns chat deletion.

use rusqlite::{params, OptionalExtension};

use parley_shared::ChatPreview;

use crate::database::Database;
use crate::error::Result;

impl Database {
    pub fn upsert_preview(&self, preview: &ChatPreview) -> Result<()> {
        self.conn().execute(
            "INSERT INTO chat_previews
                 (chat_id, receiver_username, last_message_sender,
                  last_message_content, last_message_sent_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(chat_id) DO UPDATE SET
                 receiver_username    = excluded.receiver_username,
                 last_message_sender  = excluded.last_message_sender,
                 last_message_content = excluded.last_message_content,
                 last_message_sent_at = excluded.last_message_sent_at",
            params![
                preview.chat_id,
                preview.receiver_username,
                preview.last_message_sender,
                preview.last_message_content,
                preview.last_message_sent_date,
            ],
        )?;
        Ok(())
    }

    /// Store a fresh `my-chats` snapshot.
    pub fn store_previews(&mut self, previews: &[ChatPreview]) -> Result<()> {
        let tx = self.conn_mut().transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO chat_previews
                     (chat_id, receiver_username, last_message_sender,
                      last_message_content, last_message_sent_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(chat_id) DO UPDATE SET
                     receiver_username    = excluded.receiver_username,
                     last_message_sender  = excluded.last_message_sender,
                     last_message_content = excluded.last_message_content,
                     last_message_sent_at = excluded.last_message_sent_at",
            )?;
            for preview in previews {
                stmt.execute(params![
                    preview.chat_id,
                    preview.receiver_username,
                    preview.last_message_sender,
                    preview.last_message_content,
                    preview.last_message_sent_date,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// All known previews, most recently active first.
    pub fn previews(&self) -> Result<Vec<ChatPreview>> {
        let mut stmt = self.conn().prepare(
            "SELECT chat_id, receiver_username, last_message_sender,
                    last_message_content, last_message_sent_at
             FROM chat_previews
             ORDER BY last_message_sent_at DESC",
        )?;

        let rows = stmt.query_map([], |row| {
            Ok(ChatPreview {
                chat_id: row.get(0)?,
                receiver_username: row.get(1)?,
                last_message_sender: row.get(2)?,
                last_message_content: row.get(3)?,
                last_message_sent_date: row.get(4)?,
            })
        })?;

        let mut previews = Vec::new();
        for row in rows {
            previews.push(row?);
        }
        Ok(previews)
    }

    /// One preview row, if the chat is in the snapshot.
    pub fn preview(&self, chat_id: i64) -> Result<Option<ChatPreview>> {
        let row = self
            .conn()
            .query_row(
                "SELECT chat_id, receiver_username, last_message_sender,
                        last_message_content, last_message_sent_at
                 FROM chat_previews
                 WHERE chat_id = ?1",
                params![chat_id],
                |row| {
                    Ok(ChatPreview {
                        chat_id: row.get(0)?,
                        receiver_username: row.get(1)?,
                        last_message_sender: row.get(2)?,
                        last_message_content: row.get(3)?,
                        last_message_sent_date: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    /// Refresh the last-message columns of one preview. Returns false
    /// when the chat is not in the snapshot yet (list not fetched since
    /// the chat was started elsewhere).
    pub fn touch_preview(
        &self,
        chat_id: i64,
        sender: &str,
        content: &str,
        sent_at: &str,
    ) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE chat_previews SET
                 last_message_sender  = ?2,
                 last_message_content = ?3,
                 last_message_sent_at = ?4
             WHERE chat_id = ?1",
            params![chat_id, sender, content, sent_at],
        )?;
        Ok(affected > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn preview(chat_id: i64, receiver: &str) -> ChatPreview {
        ChatPreview {
            chat_id,
            receiver_username: receiver.into(),
            last_message_sender: receiver.into(),
            last_message_content: "hello".into(),
            last_message_sent_date: "2024-01-02T10:30:00".into(),
        }
    }

    #[test]
    fn snapshot_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = Database::open_at(&dir.path().join("test.db")).unwrap();

        db.store_previews(&[preview(1, "ana"), preview(2, "bo")])
            .unwrap();

        let previews = db.previews().unwrap();
        assert_eq!(previews.len(), 2);

        // Restoring the same snapshot must not duplicate rows.
        db.store_previews(&[preview(1, "ana")]).unwrap();
        assert_eq!(db.previews().unwrap().len(), 2);
    }

    #[test]
    fn touch_updates_only_known_chats() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_at(&dir.path().join("test.db")).unwrap();

        db.upsert_preview(&preview(1, "ana")).unwrap();

        assert!(db
            .touch_preview(1, "ana", "newer", "2024-01-02T11:00:00")
            .unwrap());
        assert!(!db
            .touch_preview(99, "ghost", "x", "2024-01-02T11:00:00")
            .unwrap());

        let previews = db.previews().unwrap();
        assert_eq!(previews[0].last_message_content, "newer");

        let one = db.preview(1).unwrap().unwrap();
        assert_eq!(one.last_message_content, "newer");
        assert!(db.preview(99).unwrap().is_none());
    }
}
