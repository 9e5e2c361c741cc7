//! Per-entity repositories over the shared [`Database`](super::Database) handle

pub mod checkpoint;
pub mod handoff;
pub mod initiative;
pub mod prd;
pub mod task;
pub mod work_product;

use chrono::{DateTime, Utc};
use rusqlite::Connection;

/// Parse a stored RFC3339 timestamp, falling back to now on garbage.
pub(crate) fn parse_ts(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

/// Best-effort append to the activity log. Never fails the calling
/// write; a broken log row is worth a warning, not a rollback.
pub(crate) fn record_activity(conn: &Connection, entity_kind: &str, entity_id: &str, action: &str) {
    let result = conn.execute(
        "INSERT INTO activity_log (entity_kind, entity_id, action, created_at)
         VALUES (?1, ?2, ?3, ?4)",
        rusqlite::params![entity_kind, entity_id, action, Utc::now().to_rfc3339()],
    );
    if let Err(e) = result {
        tracing::warn!("Failed to record activity for {} {}: {}", entity_kind, entity_id, e);
    }
}
