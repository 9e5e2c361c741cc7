//! Database connection management
//!
//! One store file per workspace, opened once per process and passed
//! around as an owned handle. The synchronous rusqlite connection sits
//! behind a `tokio::Mutex`; repositories hold a clone of the handle and
//! take the lock per operation, so within one process all writers are
//! serialized. WAL journaling keeps concurrent readers unblocked.

use anyhow::{Context, Result};
use rusqlite::Connection;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

use super::schema;

pub struct Database {
    conn: Arc<Mutex<Connection>>,
    path: String,
}

impl Database {
    /// Open (creating if needed) the store at an explicit path and bring
    /// it to the current schema version. A migration failure here is
    /// fatal: the store must not be used with a stale schema.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut conn = Connection::open(path)
            .with_context(|| format!("Failed to open database at {:?}", path))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;",
        )?;

        schema::migrate(&mut conn)?;

        info!("Database initialized at {:?}", path);

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: path.to_string_lossy().to_string(),
        })
    }

    /// Open the store for a workspace. The workspace id is either
    /// caller-supplied or derived from the project path; the store lives
    /// under `~/.taskloom/workspaces/<id>/taskloom.db`.
    pub fn open_workspace(workspace: Option<&str>, project_dir: &Path) -> Result<Self> {
        let id = match workspace {
            Some(id) => id.to_string(),
            None => workspace_id(project_dir),
        };

        let root = dirs::home_dir()
            .map(|h| h.join(".taskloom"))
            .unwrap_or_else(|| PathBuf::from(".taskloom"));

        Self::new(root.join("workspaces").join(id).join("taskloom.db"))
    }

    /// Get a locked connection. Holding the guard serializes every other
    /// repository operation on this handle.
    pub async fn lock(&self) -> tokio::sync::MutexGuard<'_, Connection> {
        self.conn.lock().await
    }

    /// Get the database path
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Schema version currently recorded in the migrations ledger.
    pub async fn schema_version(&self) -> Result<i64> {
        let conn = self.lock().await;
        schema::current_version(&conn)
    }
}

impl Clone for Database {
    fn clone(&self) -> Self {
        Self {
            conn: Arc::clone(&self.conn),
            path: self.path.clone(),
        }
    }
}

/// Deterministic workspace id for a project path: first 16 hex chars of
/// the SHA-256 of the canonical path. Falls back to the path as given
/// when it cannot be canonicalized (e.g. not created yet).
pub fn workspace_id(project_dir: &Path) -> String {
    let canonical = project_dir
        .canonicalize()
        .unwrap_or_else(|_| project_dir.to_path_buf());

    let digest = Sha256::digest(canonical.to_string_lossy().as_bytes());
    let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
    hex[..16].to_string()
}
