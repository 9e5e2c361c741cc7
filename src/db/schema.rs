//! Versioned schema migrations
//!
//! The store carries a `migrations` ledger table recording every applied
//! version with a timestamp. On open we compare `MAX(version)` against
//! [`SCHEMA_VERSION`] and apply each missing migration inside its own
//! transaction, so a partially applied migration can never be observed.
//! Migrations are additive only: new tables, new columns, new indexes.

use anyhow::Result;
use chrono::Utc;
use rusqlite::Connection;
use tracing::info;

use crate::error::StoreError;

/// Compile-time target schema version.
pub const SCHEMA_VERSION: i64 = 3;

/// Migration `i` brings the store to version `i + 1`.
const MIGRATIONS: &[&str] = &[V1_BASE_TABLES, V2_TASK_ARCHIVAL, V3_CHECKPOINT_ITERATION];

const V1_BASE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS initiatives (
    id TEXT PRIMARY KEY,
    title TEXT NOT NULL,
    description TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS prds (
    id TEXT PRIMARY KEY,
    initiative_id TEXT NOT NULL REFERENCES initiatives(id),
    title TEXT NOT NULL,
    content TEXT,
    status TEXT NOT NULL DEFAULT 'active',
    milestones_json TEXT,
    metadata TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS tasks (
    id TEXT PRIMARY KEY,
    prd_id TEXT REFERENCES prds(id),
    parent_id TEXT REFERENCES tasks(id),
    title TEXT NOT NULL,
    assigned_agent TEXT,
    status TEXT NOT NULL DEFAULT 'pending',
    notes TEXT,
    blocked_reason TEXT,
    stream_id TEXT,
    stream_json TEXT,
    metadata TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS work_products (
    id TEXT PRIMARY KEY,
    task_id TEXT NOT NULL REFERENCES tasks(id),
    kind TEXT NOT NULL,
    title TEXT NOT NULL,
    content TEXT,
    metadata TEXT,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS agent_handoffs (
    id TEXT PRIMARY KEY,
    task_id TEXT NOT NULL REFERENCES tasks(id),
    from_agent TEXT NOT NULL,
    to_agent TEXT NOT NULL,
    work_product_id TEXT REFERENCES work_products(id),
    context TEXT,
    chain_position INTEGER NOT NULL,
    chain_length INTEGER NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS checkpoints (
    id TEXT PRIMARY KEY,
    task_id TEXT NOT NULL REFERENCES tasks(id),
    seq INTEGER NOT NULL,
    trigger TEXT NOT NULL DEFAULT 'manual',
    task_status TEXT NOT NULL,
    task_notes TEXT,
    task_blocked_reason TEXT,
    task_assigned_agent TEXT,
    task_metadata TEXT,
    phase TEXT,
    step TEXT,
    agent_context TEXT,
    draft_content TEXT,
    draft_kind TEXT,
    subtasks_json TEXT,
    created_at TEXT NOT NULL,
    expires_at TEXT,
    UNIQUE (task_id, seq)
);

CREATE TABLE IF NOT EXISTS activity_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    entity_kind TEXT NOT NULL,
    entity_id TEXT NOT NULL,
    action TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_prds_initiative_id ON prds(initiative_id);
CREATE INDEX IF NOT EXISTS idx_tasks_prd_id ON tasks(prd_id);
CREATE INDEX IF NOT EXISTS idx_tasks_parent_id ON tasks(parent_id);
CREATE INDEX IF NOT EXISTS idx_tasks_stream_id ON tasks(stream_id);
CREATE INDEX IF NOT EXISTS idx_work_products_task_id ON work_products(task_id);
CREATE INDEX IF NOT EXISTS idx_handoffs_task_id ON agent_handoffs(task_id);
CREATE INDEX IF NOT EXISTS idx_checkpoints_task_id ON checkpoints(task_id);
CREATE INDEX IF NOT EXISTS idx_activity_entity_id ON activity_log(entity_id);
"#;

const V2_TASK_ARCHIVAL: &str = r#"
ALTER TABLE tasks ADD COLUMN archived INTEGER NOT NULL DEFAULT 0;
ALTER TABLE tasks ADD COLUMN archived_at TEXT;
ALTER TABLE tasks ADD COLUMN archived_by TEXT;
CREATE INDEX IF NOT EXISTS idx_tasks_archived ON tasks(archived);
"#;

const V3_CHECKPOINT_ITERATION: &str = r#"
ALTER TABLE checkpoints ADD COLUMN iteration_json TEXT;
"#;

/// Bring the store up to [`SCHEMA_VERSION`], recording each applied
/// migration in the ledger. Any failure is fatal for the caller.
pub fn migrate(conn: &mut Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS migrations (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL
        );",
    )?;

    let current = current_version(conn)?;

    if current > SCHEMA_VERSION {
        return Err(StoreError::Migration {
            version: current,
            message: format!(
                "store schema {} is newer than supported version {}",
                current, SCHEMA_VERSION
            ),
        }
        .into());
    }

    for version in (current + 1)..=SCHEMA_VERSION {
        let sql = MIGRATIONS[(version - 1) as usize];
        let tx = conn.transaction().map_err(|e| StoreError::Migration {
            version,
            message: e.to_string(),
        })?;

        tx.execute_batch(sql).map_err(|e| StoreError::Migration {
            version,
            message: e.to_string(),
        })?;
        tx.execute(
            "INSERT INTO migrations (version, applied_at) VALUES (?1, ?2)",
            rusqlite::params![version, Utc::now().to_rfc3339()],
        )
        .map_err(|e| StoreError::Migration {
            version,
            message: e.to_string(),
        })?;

        tx.commit().map_err(|e| StoreError::Migration {
            version,
            message: e.to_string(),
        })?;

        info!("Applied schema migration {}", version);
    }

    Ok(())
}

/// Highest version recorded in the ledger, 0 for a fresh store.
pub fn current_version(conn: &Connection) -> Result<i64> {
    let version = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM migrations",
        [],
        |row| row.get(0),
    )?;
    Ok(version)
}
