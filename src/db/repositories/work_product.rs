//! Work product repository
//!
//! Artifacts agents produce for a task. Append-only: a work product is
//! never mutated after creation, only superseded by a newer record.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::db::Database;
use crate::error::StoreError;

use super::{parse_ts, record_activity};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkProduct {
    pub id: String,
    pub task_id: String,
    pub kind: WorkProductKind,
    pub title: String,
    pub content: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WorkProductKind {
    Design,
    Implementation,
    TestPlan,
    SecurityReview,
    Doc,
    Architecture,
    Specification,
    Other,
}

impl WorkProductKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkProductKind::Design => "design",
            WorkProductKind::Implementation => "implementation",
            WorkProductKind::TestPlan => "test_plan",
            WorkProductKind::SecurityReview => "security_review",
            WorkProductKind::Doc => "doc",
            WorkProductKind::Architecture => "architecture",
            WorkProductKind::Specification => "specification",
            WorkProductKind::Other => "other",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "design" => Ok(WorkProductKind::Design),
            "implementation" => Ok(WorkProductKind::Implementation),
            "test_plan" => Ok(WorkProductKind::TestPlan),
            "security_review" => Ok(WorkProductKind::SecurityReview),
            "doc" => Ok(WorkProductKind::Doc),
            "architecture" => Ok(WorkProductKind::Architecture),
            "specification" => Ok(WorkProductKind::Specification),
            "other" => Ok(WorkProductKind::Other),
            _ => anyhow::bail!("Unknown work product kind: {}", s),
        }
    }
}

pub struct WorkProductRepository {
    db: Database,
}

impl WorkProductRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Store a new work product for an existing task
    pub async fn store(
        &self,
        task_id: String,
        kind: WorkProductKind,
        title: String,
        content: Option<String>,
        metadata: Option<serde_json::Value>,
    ) -> Result<WorkProduct> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();

        let conn = self.db.lock().await;

        let task_exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM tasks WHERE id = ?1)",
            params![task_id],
            |row| row.get(0),
        )?;
        if !task_exists {
            return Err(StoreError::Constraint(format!(
                "work product references missing task {}",
                task_id
            ))
            .into());
        }

        let product = WorkProduct {
            id: id.clone(),
            task_id,
            kind,
            title,
            content,
            metadata,
            created_at: now,
        };

        conn.execute(
            "INSERT INTO work_products (id, task_id, kind, title, content, metadata, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                product.id,
                product.task_id,
                product.kind.as_str(),
                product.title,
                product.content,
                product
                    .metadata
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                product.created_at.to_rfc3339(),
            ],
        )
        .context("Failed to insert work product")?;
        record_activity(&conn, "work_product", &id, "created");

        tracing::debug!("Stored work product: {}", id);
        Ok(product)
    }

    /// Get a work product by ID
    pub async fn get(&self, id: &str) -> Result<Option<WorkProduct>> {
        let conn = self.db.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, task_id, kind, title, content, metadata, created_at
             FROM work_products WHERE id = ?1",
        )?;

        let result = stmt.query_row(params![id], Self::map_row);

        match result {
            Ok(product) => Ok(Some(product)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e).context("Failed to get work product"),
        }
    }

    /// List work products, newest first
    pub async fn list(
        &self,
        task_id: Option<&str>,
        kind: Option<WorkProductKind>,
    ) -> Result<Vec<WorkProduct>> {
        let conn = self.db.lock().await;

        let mut query = String::from(
            "SELECT id, task_id, kind, title, content, metadata, created_at
             FROM work_products WHERE 1=1",
        );
        let mut params: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(task_id) = task_id {
            params.push(Box::new(task_id.to_string()));
            query.push_str(&format!(" AND task_id = ?{}", params.len()));
        }
        if let Some(kind) = kind {
            params.push(Box::new(kind.as_str().to_string()));
            query.push_str(&format!(" AND kind = ?{}", params.len()));
        }
        query.push_str(" ORDER BY created_at DESC");

        let mut stmt = conn.prepare(&query)?;
        let params_refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(|p| p.as_ref()).collect();

        let products = stmt
            .query_map(params_refs.as_slice(), Self::map_row)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("Failed to collect work products")?;

        Ok(products)
    }

    /// Existence check, not a list.
    pub async fn has_for_task(&self, task_id: &str) -> Result<bool> {
        let conn = self.db.lock().await;
        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM work_products WHERE task_id = ?1)",
            params![task_id],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    fn map_row(row: &rusqlite::Row) -> rusqlite::Result<WorkProduct> {
        let metadata = row
            .get::<_, Option<String>>(5)?
            .and_then(|raw| serde_json::from_str(&raw).ok());

        Ok(WorkProduct {
            id: row.get(0)?,
            task_id: row.get(1)?,
            kind: WorkProductKind::from_str(&row.get::<_, String>(2)?)
                .unwrap_or(WorkProductKind::Other),
            title: row.get(3)?,
            content: row.get(4)?,
            metadata,
            created_at: parse_ts(&row.get::<_, String>(6)?),
        })
    }
}
