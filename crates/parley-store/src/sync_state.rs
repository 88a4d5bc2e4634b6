//! Per-chat reconciliation stamps.

use rusqlite::{params, OptionalExtension};

use crate::database::Database;
use crate::error::Result;

impl Database {
    /// Epoch millis of the last successful reconciliation of a chat,
    /// `None` if the chat was never synced.
    pub fn last_synced_at(&self, chat_id: i64) -> Result<Option<i64>> {
        let stamp = self
            .conn()
            .query_row(
                "SELECT last_synced_at FROM sync_state WHERE chat_id = ?1",
                params![chat_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(stamp)
    }

    /// Record a successful reconciliation. Only called once a pass
    /// completes; failed passes leave the old stamp so the next open
    /// retries.
    pub fn set_last_synced_at(&self, chat_id: i64, epoch_millis: i64) -> Result<()> {
        self.conn().execute(
            "INSERT INTO sync_state (chat_id, last_synced_at) VALUES (?1, ?2)
             ON CONFLICT(chat_id) DO UPDATE SET last_synced_at = excluded.last_synced_at",
            params![chat_id, epoch_millis],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stamp_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_at(&dir.path().join("test.db")).unwrap();

        assert_eq!(db.last_synced_at(7).unwrap(), None);

        db.set_last_synced_at(7, 1_700_000_000_000).unwrap();
        assert_eq!(db.last_synced_at(7).unwrap(), Some(1_700_000_000_000));

        db.set_last_synced_at(7, 1_700_000_300_000).unwrap();
        assert_eq!(db.last_synced_at(7).unwrap(), Some(1_700_000_300_000));
    }
}
