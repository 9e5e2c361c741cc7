//! Initiative repository
//!
//! Top-level unit of work scope. Which initiative is "current" is the
//! caller's business; this repository only stores the rows, re-links
//! PRDs between initiatives, and performs the confirmed wipe.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::db::Database;
use crate::error::StoreError;

use super::{parse_ts, record_activity};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Initiative {
    pub id: String,
    pub title: String,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Rows removed by a wipe, per table, in deletion order.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct WipeReport {
    pub work_products: usize,
    pub handoffs: usize,
    pub checkpoints: usize,
    pub tasks: usize,
    pub prds: usize,
    pub activity_entries: usize,
}

pub struct InitiativeRepository {
    db: Database,
}

impl InitiativeRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Create a new initiative
    pub async fn create(&self, title: String, description: Option<String>) -> Result<Initiative> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();

        let initiative = Initiative {
            id: id.clone(),
            title,
            description,
            created_at: now,
            updated_at: now,
        };

        let conn = self.db.lock().await;
        conn.execute(
            "INSERT INTO initiatives (id, title, description, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                initiative.id,
                initiative.title,
                initiative.description,
                initiative.created_at.to_rfc3339(),
                initiative.updated_at.to_rfc3339(),
            ],
        )
        .context("Failed to insert initiative")?;
        record_activity(&conn, "initiative", &id, "created");

        tracing::debug!("Created initiative: {}", id);
        Ok(initiative)
    }

    /// Get an initiative by ID
    pub async fn get(&self, id: &str) -> Result<Option<Initiative>> {
        let conn = self.db.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, title, description, created_at, updated_at
             FROM initiatives WHERE id = ?1",
        )?;

        let result = stmt.query_row(params![id], Self::map_row);

        match result {
            Ok(initiative) => Ok(Some(initiative)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e).context("Failed to get initiative"),
        }
    }

    /// List all initiatives
    pub async fn list(&self) -> Result<Vec<Initiative>> {
        let conn = self.db.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, title, description, created_at, updated_at
             FROM initiatives ORDER BY created_at DESC",
        )?;

        let initiatives = stmt
            .query_map([], Self::map_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(initiatives)
    }

    /// Re-own a PRD to this initiative. Both rows must exist.
    pub async fn link_prd(&self, initiative_id: &str, prd_id: &str) -> Result<()> {
        let conn = self.db.lock().await;

        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM initiatives WHERE id = ?1)",
            params![initiative_id],
            |row| row.get(0),
        )?;
        if !exists {
            return Err(StoreError::not_found("initiative", initiative_id).into());
        }

        let changed = conn.execute(
            "UPDATE prds SET initiative_id = ?1, updated_at = ?2 WHERE id = ?3",
            params![initiative_id, Utc::now().to_rfc3339(), prd_id],
        )?;
        if changed == 0 {
            return Err(StoreError::not_found("prd", prd_id).into());
        }

        record_activity(&conn, "prd", prd_id, "linked");
        tracing::debug!("Linked PRD {} to initiative {}", prd_id, initiative_id);
        Ok(())
    }

    /// Delete an initiative and everything it owns, in one transaction,
    /// respecting foreign-key direction: work products and other task
    /// children first, then tasks (including sub-task forests), PRDs,
    /// activity entries, and finally the initiative row itself.
    ///
    /// Destructive; requires `confirm = true`.
    pub async fn wipe(&self, id: &str, confirm: bool) -> Result<WipeReport> {
        if !confirm {
            return Err(StoreError::Validation(
                "initiative wipe requires explicit confirmation".into(),
            )
            .into());
        }

        let mut conn = self.db.lock().await;
        let tx = conn.transaction()?;

        let exists: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM initiatives WHERE id = ?1)",
            params![id],
            |row| row.get(0),
        )?;
        if !exists {
            return Err(StoreError::not_found("initiative", id).into());
        }

        // Resolve the owned id sets once; sub-tasks are collected
        // recursively so streamed children under a PRD-owned parent are
        // wiped with it.
        tx.execute(
            "CREATE TEMP TABLE wipe_prds AS
             SELECT id FROM prds WHERE initiative_id = ?1",
            params![id],
        )?;
        tx.execute_batch(
            "CREATE TEMP TABLE wipe_tasks AS
             WITH RECURSIVE owned(id) AS (
                 SELECT id FROM tasks WHERE prd_id IN (SELECT id FROM wipe_prds)
                 UNION
                 SELECT t.id FROM tasks t JOIN owned o ON t.parent_id = o.id
             )
             SELECT id FROM owned;",
        )?;

        let mut report = WipeReport::default();
        report.work_products = tx.execute(
            "DELETE FROM work_products WHERE task_id IN (SELECT id FROM wipe_tasks)",
            [],
        )?;
        report.handoffs = tx.execute(
            "DELETE FROM agent_handoffs WHERE task_id IN (SELECT id FROM wipe_tasks)",
            [],
        )?;
        report.checkpoints = tx.execute(
            "DELETE FROM checkpoints WHERE task_id IN (SELECT id FROM wipe_tasks)",
            [],
        )?;
        report.tasks = tx.execute("DELETE FROM tasks WHERE id IN (SELECT id FROM wipe_tasks)", [])?;
        report.prds = tx.execute("DELETE FROM prds WHERE id IN (SELECT id FROM wipe_prds)", [])?;
        report.activity_entries = tx.execute(
            "DELETE FROM activity_log WHERE entity_id = ?1
             OR entity_id IN (SELECT id FROM wipe_prds)
             OR entity_id IN (SELECT id FROM wipe_tasks)",
            params![id],
        )?;
        tx.execute("DELETE FROM initiatives WHERE id = ?1", params![id])?;

        tx.execute_batch("DROP TABLE wipe_tasks; DROP TABLE wipe_prds;")?;
        tx.commit().context("Failed to commit initiative wipe")?;

        tracing::info!(
            "Wiped initiative {}: {} tasks, {} prds, {} work products",
            id,
            report.tasks,
            report.prds,
            report.work_products
        );
        Ok(report)
    }

    fn map_row(row: &rusqlite::Row) -> rusqlite::Result<Initiative> {
        Ok(Initiative {
            id: row.get(0)?,
            title: row.get(1)?,
            description: row.get(2)?,
            created_at: parse_ts(&row.get::<_, String>(3)?),
            updated_at: parse_ts(&row.get::<_, String>(4)?),
        })
    }
}
