//! PRD repository
//!
//! A PRD (spec) is owned by exactly one initiative and groups tasks.
//! Milestones are stored as a typed JSON list, not an opaque blob.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::db::meta::Milestone;
use crate::db::Database;
use crate::error::StoreError;

use super::{parse_ts, record_activity};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prd {
    pub id: String,
    pub initiative_id: String,
    pub title: String,
    pub content: Option<String>,
    pub status: PrdStatus,
    pub milestones: Vec<Milestone>,
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PrdStatus {
    Active,
    Archived,
    Cancelled,
}

impl PrdStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PrdStatus::Active => "active",
            PrdStatus::Archived => "archived",
            PrdStatus::Cancelled => "cancelled",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "active" => Ok(PrdStatus::Active),
            "archived" => Ok(PrdStatus::Archived),
            "cancelled" => Ok(PrdStatus::Cancelled),
            _ => anyhow::bail!("Unknown PRD status: {}", s),
        }
    }
}

/// Fields a partial PRD update may touch. `None` leaves a field alone.
#[derive(Debug, Clone, Default)]
pub struct PrdPatch {
    pub title: Option<String>,
    pub content: Option<String>,
    pub status: Option<PrdStatus>,
    pub milestones: Option<Vec<Milestone>>,
    pub metadata: Option<serde_json::Value>,
}

impl PrdPatch {
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.content.is_none()
            && self.status.is_none()
            && self.milestones.is_none()
            && self.metadata.is_none()
    }
}

pub struct PrdRepository {
    db: Database,
}

impl PrdRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Create a new PRD under an existing initiative
    pub async fn create(
        &self,
        initiative_id: String,
        title: String,
        content: Option<String>,
        milestones: Vec<Milestone>,
    ) -> Result<Prd> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();

        let conn = self.db.lock().await;

        let owner_exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM initiatives WHERE id = ?1)",
            params![initiative_id],
            |row| row.get(0),
        )?;
        if !owner_exists {
            return Err(StoreError::Constraint(format!(
                "prd references missing initiative {}",
                initiative_id
            ))
            .into());
        }

        let prd = Prd {
            id: id.clone(),
            initiative_id,
            title,
            content,
            status: PrdStatus::Active,
            milestones,
            metadata: None,
            created_at: now,
            updated_at: now,
        };

        conn.execute(
            "INSERT INTO prds (id, initiative_id, title, content, status, milestones_json, metadata, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                prd.id,
                prd.initiative_id,
                prd.title,
                prd.content,
                prd.status.as_str(),
                serde_json::to_string(&prd.milestones)?,
                Option::<String>::None,
                prd.created_at.to_rfc3339(),
                prd.updated_at.to_rfc3339(),
            ],
        )
        .context("Failed to insert prd")?;
        record_activity(&conn, "prd", &id, "created");

        tracing::debug!("Created PRD: {}", id);
        Ok(prd)
    }

    /// Get a PRD by ID
    pub async fn get(&self, id: &str) -> Result<Option<Prd>> {
        let conn = self.db.lock().await;
        let mut stmt = conn.prepare(&format!("{} WHERE id = ?1", SELECT_PRD))?;

        let result = stmt.query_row(params![id], Self::map_row);

        match result {
            Ok(prd) => Ok(Some(prd)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e).context("Failed to get prd"),
        }
    }

    /// List PRDs; all provided filters must match, omitted ones are wildcards
    pub async fn list(
        &self,
        initiative_id: Option<&str>,
        status: Option<PrdStatus>,
    ) -> Result<Vec<Prd>> {
        let conn = self.db.lock().await;

        let mut query = format!("{} WHERE 1=1", SELECT_PRD);
        let mut params: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(initiative_id) = initiative_id {
            params.push(Box::new(initiative_id.to_string()));
            query.push_str(&format!(" AND initiative_id = ?{}", params.len()));
        }
        if let Some(status) = status {
            params.push(Box::new(status.as_str().to_string()));
            query.push_str(&format!(" AND status = ?{}", params.len()));
        }
        query.push_str(" ORDER BY created_at DESC");

        let mut stmt = conn.prepare(&query)?;
        let params_refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(|p| p.as_ref()).collect();

        let prds = stmt
            .query_map(params_refs.as_slice(), Self::map_row)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("Failed to collect prds")?;

        Ok(prds)
    }

    /// Apply a partial update; an empty patch returns the row unchanged.
    pub async fn update(&self, id: &str, patch: PrdPatch) -> Result<Prd> {
        if patch.is_empty() {
            return self
                .get(id)
                .await?
                .ok_or_else(|| StoreError::not_found("prd", id).into());
        }

        {
            let conn = self.db.lock().await;

            let mut sets: Vec<String> = Vec::new();
            let mut params: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

            if let Some(title) = patch.title {
                params.push(Box::new(title));
                sets.push(format!("title = ?{}", params.len()));
            }
            if let Some(content) = patch.content {
                params.push(Box::new(content));
                sets.push(format!("content = ?{}", params.len()));
            }
            if let Some(status) = patch.status {
                params.push(Box::new(status.as_str().to_string()));
                sets.push(format!("status = ?{}", params.len()));
            }
            if let Some(milestones) = patch.milestones {
                params.push(Box::new(serde_json::to_string(&milestones)?));
                sets.push(format!("milestones_json = ?{}", params.len()));
            }
            if let Some(metadata) = patch.metadata {
                params.push(Box::new(serde_json::to_string(&metadata)?));
                sets.push(format!("metadata = ?{}", params.len()));
            }

            params.push(Box::new(Utc::now().to_rfc3339()));
            sets.push(format!("updated_at = ?{}", params.len()));
            params.push(Box::new(id.to_string()));

            let query = format!(
                "UPDATE prds SET {} WHERE id = ?{}",
                sets.join(", "),
                params.len()
            );
            let params_refs: Vec<&dyn rusqlite::ToSql> =
                params.iter().map(|p| p.as_ref()).collect();

            let changed = conn.execute(&query, params_refs.as_slice())?;
            if changed == 0 {
                return Err(StoreError::not_found("prd", id).into());
            }
            record_activity(&conn, "prd", id, "updated");
        }

        self.get(id)
            .await?
            .ok_or_else(|| StoreError::not_found("prd", id).into())
    }

    /// Completed/total counts over this PRD's tasks, computed by one
    /// grouped query rather than loading the rows.
    pub async fn progress(&self, prd_id: &str) -> Result<(u32, u32)> {
        let conn = self.db.lock().await;
        let (completed, total): (u32, u32) = conn.query_row(
            "SELECT COALESCE(SUM(CASE WHEN status = 'completed' THEN 1 ELSE 0 END), 0),
                    COUNT(*)
             FROM tasks WHERE prd_id = ?1",
            params![prd_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok((completed, total))
    }

    fn map_row(row: &rusqlite::Row) -> rusqlite::Result<Prd> {
        let milestones: Vec<Milestone> = row
            .get::<_, Option<String>>(5)?
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default();
        let metadata = row
            .get::<_, Option<String>>(6)?
            .and_then(|raw| serde_json::from_str(&raw).ok());

        Ok(Prd {
            id: row.get(0)?,
            initiative_id: row.get(1)?,
            title: row.get(2)?,
            content: row.get(3)?,
            status: PrdStatus::from_str(&row.get::<_, String>(4)?)
                .unwrap_or(PrdStatus::Active),
            milestones,
            metadata,
            created_at: parse_ts(&row.get::<_, String>(7)?),
            updated_at: parse_ts(&row.get::<_, String>(8)?),
        })
    }
}

const SELECT_PRD: &str = "SELECT id, initiative_id, title, content, status, milestones_json, metadata, created_at, updated_at FROM prds";
