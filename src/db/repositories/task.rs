//! Task repository
//!
//! Tasks form a forest via `parent_id` and optionally belong to a PRD.
//! A task with neither parent nor PRD is a legal orphan, used for
//! ad-hoc streams. Stream membership is a typed sub-structure stored in
//! `stream_json`, with `stream_id` denormalized into its own indexed
//! column so stream queries never parse JSON.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::db::meta::StreamMeta;
use crate::db::Database;
use crate::error::StoreError;

use super::{parse_ts, record_activity};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub prd_id: Option<String>,
    pub parent_id: Option<String>,
    pub title: String,
    pub assigned_agent: Option<String>,
    pub status: TaskStatus,
    pub notes: Option<String>,
    pub blocked_reason: Option<String>,
    pub stream: Option<StreamMeta>,
    pub metadata: Option<serde_json::Value>,
    pub archived: bool,
    pub archived_at: Option<DateTime<Utc>>,
    pub archived_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Blocked,
    Completed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Blocked => "blocked",
            TaskStatus::Completed => "completed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "in_progress" => Ok(TaskStatus::InProgress),
            "blocked" => Ok(TaskStatus::Blocked),
            "completed" => Ok(TaskStatus::Completed),
            "cancelled" => Ok(TaskStatus::Cancelled),
            _ => anyhow::bail!("Unknown task status: {}", s),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct NewTask {
    pub prd_id: Option<String>,
    pub parent_id: Option<String>,
    pub title: String,
    pub assigned_agent: Option<String>,
    pub stream: Option<StreamMeta>,
    pub metadata: Option<serde_json::Value>,
}

/// Fields a partial task update may touch. `None` leaves a field alone;
/// metadata is shallow-merged into the existing object rather than
/// replaced.
#[derive(Debug, Clone, Default)]
pub struct TaskPatch {
    pub status: Option<TaskStatus>,
    pub assigned_agent: Option<String>,
    pub notes: Option<String>,
    pub blocked_reason: Option<String>,
    pub stream: Option<StreamMeta>,
    pub metadata: Option<serde_json::Value>,
}

impl TaskPatch {
    pub fn is_empty(&self) -> bool {
        self.status.is_none()
            && self.assigned_agent.is_none()
            && self.notes.is_none()
            && self.blocked_reason.is_none()
            && self.stream.is_none()
            && self.metadata.is_none()
    }
}

/// Conjunctive list filters; omitted fields are wildcards. Archived
/// tasks are excluded unless `include_archived` is set.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub prd_id: Option<String>,
    pub parent_id: Option<String>,
    pub status: Option<TaskStatus>,
    pub assigned_agent: Option<String>,
    pub stream_id: Option<String>,
    pub include_archived: bool,
}

/// Status of one direct sub-task, captured into checkpoint snapshots.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubtaskStatus {
    pub id: String,
    pub title: String,
    pub status: TaskStatus,
}

pub struct TaskRepository {
    db: Database,
}

impl TaskRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Get the database reference
    pub fn db(&self) -> &Database {
        &self.db
    }

    /// Create a new task. The PRD and parent task, when given, must
    /// exist; stream metadata is validated on write.
    pub async fn create(&self, new: NewTask) -> Result<Task> {
        if let Some(stream) = &new.stream {
            stream.validate()?;
        }

        let id = Uuid::new_v4().to_string();
        let now = Utc::now();

        let conn = self.db.lock().await;

        if let Some(prd_id) = &new.prd_id {
            let exists: bool = conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM prds WHERE id = ?1)",
                params![prd_id],
                |row| row.get(0),
            )?;
            if !exists {
                return Err(
                    StoreError::Constraint(format!("task references missing prd {}", prd_id))
                        .into(),
                );
            }
        }
        if let Some(parent_id) = &new.parent_id {
            let exists: bool = conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM tasks WHERE id = ?1)",
                params![parent_id],
                |row| row.get(0),
            )?;
            if !exists {
                return Err(StoreError::Constraint(format!(
                    "task references missing parent task {}",
                    parent_id
                ))
                .into());
            }
        }

        let task = Task {
            id: id.clone(),
            prd_id: new.prd_id,
            parent_id: new.parent_id,
            title: new.title,
            assigned_agent: new.assigned_agent,
            status: TaskStatus::Pending,
            notes: None,
            blocked_reason: None,
            stream: new.stream,
            metadata: new.metadata,
            archived: false,
            archived_at: None,
            archived_by: None,
            created_at: now,
            updated_at: now,
        };

        conn.execute(
            "INSERT INTO tasks (id, prd_id, parent_id, title, assigned_agent, status, notes,
                                blocked_reason, stream_id, stream_json, metadata,
                                archived, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, 0, ?12, ?13)",
            params![
                task.id,
                task.prd_id,
                task.parent_id,
                task.title,
                task.assigned_agent,
                task.status.as_str(),
                task.notes,
                task.blocked_reason,
                task.stream.as_ref().map(|s| s.id.clone()),
                task.stream
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                task.metadata
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                task.created_at.to_rfc3339(),
                task.updated_at.to_rfc3339(),
            ],
        )
        .context("Failed to insert task")?;
        record_activity(&conn, "task", &id, "created");

        tracing::debug!("Created task: {}", id);
        Ok(task)
    }

    /// Get a task by ID
    pub async fn get(&self, id: &str) -> Result<Option<Task>> {
        let conn = self.db.lock().await;
        let mut stmt = conn.prepare(&format!("{} WHERE id = ?1", SELECT_TASK))?;

        let result = stmt.query_row(params![id], Self::map_row);

        match result {
            Ok(task) => Ok(Some(task)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e).context("Failed to get task"),
        }
    }

    /// Apply a partial update. Only fields present in the patch are
    /// touched; `updated_at` is refreshed whenever anything changes. An
    /// empty patch is a no-op returning the row unchanged.
    pub async fn update(&self, id: &str, patch: TaskPatch) -> Result<Task> {
        if patch.is_empty() {
            return self
                .get(id)
                .await?
                .ok_or_else(|| StoreError::not_found("task", id).into());
        }

        if let Some(stream) = &patch.stream {
            stream.validate()?;
        }

        {
            let conn = self.db.lock().await;

            let mut sets: Vec<String> = Vec::new();
            let mut params: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

            if let Some(status) = patch.status {
                params.push(Box::new(status.as_str().to_string()));
                sets.push(format!("status = ?{}", params.len()));
            }
            if let Some(agent) = patch.assigned_agent {
                params.push(Box::new(agent));
                sets.push(format!("assigned_agent = ?{}", params.len()));
            }
            if let Some(notes) = patch.notes {
                params.push(Box::new(notes));
                sets.push(format!("notes = ?{}", params.len()));
            }
            if let Some(reason) = patch.blocked_reason {
                params.push(Box::new(reason));
                sets.push(format!("blocked_reason = ?{}", params.len()));
            }
            if let Some(stream) = &patch.stream {
                params.push(Box::new(stream.id.clone()));
                sets.push(format!("stream_id = ?{}", params.len()));
                params.push(Box::new(serde_json::to_string(stream)?));
                sets.push(format!("stream_json = ?{}", params.len()));
            }
            if let Some(metadata) = &patch.metadata {
                let existing: Option<String> = conn.query_row(
                    "SELECT metadata FROM tasks WHERE id = ?1",
                    params![id],
                    |row| row.get(0),
                )?;
                let merged = merge_metadata(existing.as_deref(), metadata);
                params.push(Box::new(serde_json::to_string(&merged)?));
                sets.push(format!("metadata = ?{}", params.len()));
            }

            params.push(Box::new(Utc::now().to_rfc3339()));
            sets.push(format!("updated_at = ?{}", params.len()));
            params.push(Box::new(id.to_string()));

            let query = format!(
                "UPDATE tasks SET {} WHERE id = ?{}",
                sets.join(", "),
                params.len()
            );
            let params_refs: Vec<&dyn rusqlite::ToSql> =
                params.iter().map(|p| p.as_ref()).collect();

            let changed = conn.execute(&query, params_refs.as_slice())?;
            if changed == 0 {
                return Err(StoreError::not_found("task", id).into());
            }
            record_activity(&conn, "task", id, "updated");
            tracing::debug!("Updated task: {}", id);
        }

        self.get(id)
            .await?
            .ok_or_else(|| StoreError::not_found("task", id).into())
    }

    /// List tasks matching all provided filters
    pub async fn list(&self, filter: TaskFilter) -> Result<Vec<Task>> {
        let conn = self.db.lock().await;

        let mut query = format!("{} WHERE 1=1", SELECT_TASK);
        let mut params: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(prd_id) = &filter.prd_id {
            params.push(Box::new(prd_id.clone()));
            query.push_str(&format!(" AND prd_id = ?{}", params.len()));
        }
        if let Some(parent_id) = &filter.parent_id {
            params.push(Box::new(parent_id.clone()));
            query.push_str(&format!(" AND parent_id = ?{}", params.len()));
        }
        if let Some(status) = filter.status {
            params.push(Box::new(status.as_str().to_string()));
            query.push_str(&format!(" AND status = ?{}", params.len()));
        }
        if let Some(agent) = &filter.assigned_agent {
            params.push(Box::new(agent.clone()));
            query.push_str(&format!(" AND assigned_agent = ?{}", params.len()));
        }
        if let Some(stream_id) = &filter.stream_id {
            params.push(Box::new(stream_id.clone()));
            query.push_str(&format!(" AND stream_id = ?{}", params.len()));
        }
        if !filter.include_archived {
            query.push_str(" AND archived = 0");
        }
        query.push_str(" ORDER BY created_at DESC");

        let mut stmt = conn.prepare(&query)?;
        let params_refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(|p| p.as_ref()).collect();

        let tasks = stmt
            .query_map(params_refs.as_slice(), Self::map_row)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("Failed to collect tasks")?;

        Ok(tasks)
    }

    /// Every task carrying stream metadata, oldest first so the first
    /// member of each stream is stable. Feeds the stream resolver.
    pub async fn streamed(&self, include_archived: bool) -> Result<Vec<Task>> {
        let conn = self.db.lock().await;

        let mut query = format!("{} WHERE stream_id IS NOT NULL", SELECT_TASK);
        if !include_archived {
            query.push_str(" AND archived = 0");
        }
        query.push_str(" ORDER BY created_at ASC, id ASC");

        let mut stmt = conn.prepare(&query)?;
        let tasks = stmt
            .query_map([], Self::map_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(tasks)
    }

    /// Completed/total counts over direct sub-tasks, one grouped query.
    pub async fn subtask_progress(&self, task_id: &str) -> Result<(u32, u32)> {
        let conn = self.db.lock().await;
        let (completed, total): (u32, u32) = conn.query_row(
            "SELECT COALESCE(SUM(CASE WHEN status = 'completed' THEN 1 ELSE 0 END), 0),
                    COUNT(*)
             FROM tasks WHERE parent_id = ?1",
            params![task_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok((completed, total))
    }

    /// Statuses of direct sub-tasks, for checkpoint snapshots.
    pub async fn subtask_statuses(&self, task_id: &str) -> Result<Vec<SubtaskStatus>> {
        let conn = self.db.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, title, status FROM tasks WHERE parent_id = ?1 ORDER BY created_at ASC",
        )?;

        let subtasks = stmt
            .query_map(params![task_id], |row| {
                Ok(SubtaskStatus {
                    id: row.get(0)?,
                    title: row.get(1)?,
                    status: TaskStatus::from_str(&row.get::<_, String>(2)?)
                        .unwrap_or(TaskStatus::Pending),
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(subtasks)
    }

    fn map_row(row: &rusqlite::Row) -> rusqlite::Result<Task> {
        let stream = row
            .get::<_, Option<String>>(9)?
            .and_then(|raw| serde_json::from_str(&raw).ok());
        let metadata = row
            .get::<_, Option<String>>(10)?
            .and_then(|raw| serde_json::from_str(&raw).ok());

        Ok(Task {
            id: row.get(0)?,
            prd_id: row.get(1)?,
            parent_id: row.get(2)?,
            title: row.get(3)?,
            assigned_agent: row.get(4)?,
            status: TaskStatus::from_str(&row.get::<_, String>(5)?)
                .unwrap_or(TaskStatus::Pending),
            notes: row.get(6)?,
            blocked_reason: row.get(7)?,
            stream,
            metadata,
            archived: row.get::<_, i64>(11)? != 0,
            archived_at: row
                .get::<_, Option<String>>(12)?
                .map(|raw| parse_ts(&raw)),
            archived_by: row.get(13)?,
            created_at: parse_ts(&row.get::<_, String>(14)?),
            updated_at: parse_ts(&row.get::<_, String>(15)?),
        })
    }
}

const SELECT_TASK: &str = "SELECT id, prd_id, parent_id, title, assigned_agent, status, notes, blocked_reason, stream_id, stream_json, metadata, archived, archived_at, archived_by, created_at, updated_at FROM tasks";

/// Shallow-merge patch keys into the existing metadata object. A
/// non-object on either side means the patch wins wholesale.
fn merge_metadata(existing: Option<&str>, patch: &serde_json::Value) -> serde_json::Value {
    let base = existing.and_then(|raw| serde_json::from_str::<serde_json::Value>(raw).ok());

    match (base, patch) {
        (Some(serde_json::Value::Object(mut base)), serde_json::Value::Object(patch)) => {
            for (key, value) in patch {
                base.insert(key.clone(), value.clone());
            }
            serde_json::Value::Object(base)
        }
        _ => patch.clone(),
    }
}
