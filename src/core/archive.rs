//! Initiative-scoped archival
//!
//! When the caller switches the current initiative, every streamed task
//! left over from the previous one is archived: excluded from default
//! listings but fully queryable with the include-archived flag, and
//! reversible per stream. Archival is a single UPDATE per operation so
//! an interrupted process never leaves a half-archived scope.

use anyhow::Result;
use chrono::Utc;
use rusqlite::params;

use crate::db::Database;

pub struct ArchivalScoper {
    db: Database,
}

impl ArchivalScoper {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Archive every streamed task belonging to the previous
    /// initiative's PRDs, plus streamed orphan tasks with no PRD.
    /// `archiving_initiative` is the newly activated initiative and is
    /// stamped onto each row. Returns tasks archived.
    pub async fn archive_streams(
        &self,
        previous_initiative: &str,
        archiving_initiative: &str,
    ) -> Result<usize> {
        let conn = self.db.lock().await;
        let archived = conn.execute(
            "UPDATE tasks
             SET archived = 1, archived_at = ?1, archived_by = ?2
             WHERE archived = 0
               AND stream_id IS NOT NULL
               AND (prd_id IN (SELECT id FROM prds WHERE initiative_id = ?3)
                    OR prd_id IS NULL)",
            params![
                Utc::now().to_rfc3339(),
                archiving_initiative,
                previous_initiative
            ],
        )?;

        if archived > 0 {
            tracing::info!(
                "Archived {} streamed tasks from initiative {}",
                archived,
                previous_initiative
            );
        }
        Ok(archived)
    }

    /// Clear archived state for every task sharing the stream id, no
    /// matter which initiative archived it. Does not re-link the stream
    /// to any initiative; that is the caller's move. Idempotent.
    pub async fn unarchive_stream(&self, stream_id: &str) -> Result<usize> {
        let conn = self.db.lock().await;
        let restored = conn.execute(
            "UPDATE tasks
             SET archived = 0, archived_at = NULL, archived_by = NULL
             WHERE stream_id = ?1 AND archived = 1",
            params![stream_id],
        )?;

        if restored > 0 {
            tracing::info!("Unarchived {} tasks in stream {}", restored, stream_id);
        }
        Ok(restored)
    }
}
