//! Checkpoint repository
//!
//! Checkpoints are immutable snapshots of a task's execution state,
//! numbered per task by a strictly increasing sequence starting at 1.
//! Sequence assignment and insert happen inside one IMMEDIATE
//! transaction, so two writers racing on the same task can never mint
//! duplicate sequence numbers; the `UNIQUE (task_id, seq)` constraint
//! backs that up at the store level.
//!
//! The one exception to immutability is the iteration block, which the
//! bounded-loop engine updates in place as iterations complete.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, TransactionBehavior};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::db::meta::{IterationConfig, IterationState};
use crate::db::Database;
use crate::error::StoreError;

use super::task::{SubtaskStatus, TaskStatus};
use super::work_product::WorkProductKind;
use super::{parse_ts, record_activity};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: String,
    pub task_id: String,
    pub seq: i64,
    pub trigger: CheckpointTrigger,
    /// Snapshot of the task's mutable fields at creation time.
    pub task_status: TaskStatus,
    pub task_notes: Option<String>,
    pub task_blocked_reason: Option<String>,
    pub task_assigned_agent: Option<String>,
    pub task_metadata: Option<serde_json::Value>,
    pub phase: Option<String>,
    pub step: Option<String>,
    /// Opaque context the agent asked us to keep for it.
    pub agent_context: Option<String>,
    pub draft: Option<Draft>,
    pub subtasks: Vec<SubtaskStatus>,
    pub iteration: Option<IterationState>,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Unfinished artifact carried across an interruption.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Draft {
    pub content: String,
    pub kind: WorkProductKind,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointTrigger {
    AutoStatus,
    AutoSubtask,
    #[default]
    Manual,
    Error,
}

impl CheckpointTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckpointTrigger::AutoStatus => "auto_status",
            CheckpointTrigger::AutoSubtask => "auto_subtask",
            CheckpointTrigger::Manual => "manual",
            CheckpointTrigger::Error => "error",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "auto_status" => Ok(CheckpointTrigger::AutoStatus),
            "auto_subtask" => Ok(CheckpointTrigger::AutoSubtask),
            "manual" => Ok(CheckpointTrigger::Manual),
            "error" => Ok(CheckpointTrigger::Error),
            _ => anyhow::bail!("Unknown checkpoint trigger: {}", s),
        }
    }
}

/// Time-to-live for a new checkpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CheckpointExpiry {
    /// 24 hours from creation.
    #[default]
    Default,
    InMinutes(i64),
    Never,
}

const DEFAULT_EXPIRY_MINUTES: i64 = 24 * 60;

#[derive(Debug, Clone, Default)]
pub struct NewCheckpoint {
    pub task_id: String,
    pub trigger: CheckpointTrigger,
    pub phase: Option<String>,
    pub step: Option<String>,
    pub agent_context: Option<String>,
    pub draft: Option<Draft>,
    pub iteration_config: Option<IterationConfig>,
    pub expiry: CheckpointExpiry,
}

/// Everything a resuming agent needs: the stored snapshot plus fields
/// derived from it. Resuming never mutates the checkpoint.
#[derive(Debug, Clone, Serialize)]
pub struct ResumeReport {
    pub checkpoint: Checkpoint,
    /// Sub-task counts by status, from the stored snapshot.
    pub subtask_summary: BTreeMap<String, u32>,
    pub has_draft: bool,
    pub instructions: String,
}

pub struct CheckpointRepository {
    db: Database,
}

impl CheckpointRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Snapshot the task's current state into a new checkpoint. The
    /// task must exist. Sequence assignment, snapshot reads and the
    /// insert share one IMMEDIATE transaction.
    pub async fn create(&self, new: NewCheckpoint) -> Result<Checkpoint> {
        if let Some(config) = &new.iteration_config {
            config.validate()?;
        }

        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let expires_at = match new.expiry {
            CheckpointExpiry::Default => Some(now + Duration::minutes(DEFAULT_EXPIRY_MINUTES)),
            CheckpointExpiry::InMinutes(minutes) => Some(now + Duration::minutes(minutes)),
            CheckpointExpiry::Never => None,
        };

        let mut conn = self.db.lock().await;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let task_row = tx
            .query_row(
                "SELECT status, notes, blocked_reason, assigned_agent, metadata
                 FROM tasks WHERE id = ?1",
                params![new.task_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, Option<String>>(4)?,
                    ))
                },
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        let (status_raw, notes, blocked_reason, assigned_agent, metadata_raw) = task_row
            .ok_or_else(|| StoreError::not_found("task", &new.task_id))?;

        let subtasks = {
            let mut stmt = tx.prepare(
                "SELECT id, title, status FROM tasks WHERE parent_id = ?1 ORDER BY created_at ASC",
            )?;
            let rows = stmt
                .query_map(params![new.task_id], |row| {
                    Ok(SubtaskStatus {
                        id: row.get(0)?,
                        title: row.get(1)?,
                        status: TaskStatus::from_str(&row.get::<_, String>(2)?)
                            .unwrap_or(TaskStatus::Pending),
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows
        };

        let seq: i64 = tx.query_row(
            "SELECT COALESCE(MAX(seq), 0) + 1 FROM checkpoints WHERE task_id = ?1",
            params![new.task_id],
            |row| row.get(0),
        )?;

        let checkpoint = Checkpoint {
            id: id.clone(),
            task_id: new.task_id,
            seq,
            trigger: new.trigger,
            task_status: TaskStatus::from_str(&status_raw).unwrap_or(TaskStatus::Pending),
            task_notes: notes,
            task_blocked_reason: blocked_reason,
            task_assigned_agent: assigned_agent,
            task_metadata: metadata_raw.and_then(|raw| serde_json::from_str(&raw).ok()),
            phase: new.phase,
            step: new.step,
            agent_context: new.agent_context,
            draft: new.draft,
            subtasks,
            iteration: new.iteration_config.map(IterationState::new),
            created_at: now,
            expires_at,
        };

        tx.execute(
            "INSERT INTO checkpoints (id, task_id, seq, trigger, task_status, task_notes,
                                      task_blocked_reason, task_assigned_agent, task_metadata,
                                      phase, step, agent_context, draft_content, draft_kind,
                                      subtasks_json, iteration_json, created_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
            params![
                checkpoint.id,
                checkpoint.task_id,
                checkpoint.seq,
                checkpoint.trigger.as_str(),
                checkpoint.task_status.as_str(),
                checkpoint.task_notes,
                checkpoint.task_blocked_reason,
                checkpoint.task_assigned_agent,
                checkpoint
                    .task_metadata
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                checkpoint.phase,
                checkpoint.step,
                checkpoint.agent_context,
                checkpoint.draft.as_ref().map(|d| d.content.clone()),
                checkpoint.draft.as_ref().map(|d| d.kind.as_str()),
                serde_json::to_string(&checkpoint.subtasks)?,
                checkpoint
                    .iteration
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                checkpoint.created_at.to_rfc3339(),
                checkpoint.expires_at.map(|t| t.to_rfc3339()),
            ],
        )
        .context("Failed to insert checkpoint")?;
        record_activity(&tx, "checkpoint", &id, "created");

        tx.commit().context("Failed to commit checkpoint")?;

        tracing::debug!(
            "Created checkpoint {} (seq {}) for task {}",
            id,
            seq,
            checkpoint.task_id
        );
        Ok(checkpoint)
    }

    /// Get a checkpoint by ID
    pub async fn get(&self, id: &str) -> Result<Option<Checkpoint>> {
        let conn = self.db.lock().await;
        let mut stmt = conn.prepare(&format!("{} WHERE id = ?1", SELECT_CHECKPOINT))?;

        let result = stmt.query_row(params![id], Self::map_row);

        match result {
            Ok(checkpoint) => Ok(Some(checkpoint)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e).context("Failed to get checkpoint"),
        }
    }

    /// Most recent checkpoint for a task
    pub async fn latest(&self, task_id: &str) -> Result<Option<Checkpoint>> {
        let conn = self.db.lock().await;
        let mut stmt = conn.prepare(&format!(
            "{} WHERE task_id = ?1 ORDER BY seq DESC LIMIT 1",
            SELECT_CHECKPOINT
        ))?;

        let result = stmt.query_row(params![task_id], Self::map_row);

        match result {
            Ok(checkpoint) => Ok(Some(checkpoint)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e).context("Failed to get latest checkpoint"),
        }
    }

    /// All checkpoints for a task, newest first
    pub async fn list(&self, task_id: &str) -> Result<Vec<Checkpoint>> {
        let conn = self.db.lock().await;
        let mut stmt = conn.prepare(&format!(
            "{} WHERE task_id = ?1 ORDER BY seq DESC",
            SELECT_CHECKPOINT
        ))?;

        let checkpoints = stmt
            .query_map(params![task_id], Self::map_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(checkpoints)
    }

    /// Sequence number the next checkpoint for this task would receive.
    pub async fn next_seq(&self, task_id: &str) -> Result<i64> {
        let conn = self.db.lock().await;
        let seq = conn.query_row(
            "SELECT COALESCE(MAX(seq), 0) + 1 FROM checkpoints WHERE task_id = ?1",
            params![task_id],
            |row| row.get(0),
        )?;
        Ok(seq)
    }

    /// Build the resume view from a specific checkpoint, or the latest
    /// for the task when no id is given. Never mutates anything.
    pub async fn resume(
        &self,
        task_id: &str,
        checkpoint_id: Option<&str>,
    ) -> Result<Option<ResumeReport>> {
        let checkpoint = match checkpoint_id {
            Some(id) => {
                let found = self.get(id).await?;
                if let Some(cp) = &found {
                    if cp.task_id != task_id {
                        return Err(StoreError::Validation(format!(
                            "checkpoint {} belongs to task {}, not {}",
                            id, cp.task_id, task_id
                        ))
                        .into());
                    }
                }
                found
            }
            None => self.latest(task_id).await?,
        };

        let Some(checkpoint) = checkpoint else {
            return Ok(None);
        };

        let mut subtask_summary: BTreeMap<String, u32> = BTreeMap::new();
        for subtask in &checkpoint.subtasks {
            *subtask_summary
                .entry(subtask.status.as_str().to_string())
                .or_insert(0) += 1;
        }

        let instructions = build_instructions(&checkpoint);
        let has_draft = checkpoint.draft.is_some();

        Ok(Some(ResumeReport {
            checkpoint,
            subtask_summary,
            has_draft,
            instructions,
        }))
    }

    /// Load the iteration block of a checkpoint.
    pub async fn iteration_state(&self, checkpoint_id: &str) -> Result<Option<IterationState>> {
        let conn = self.db.lock().await;
        let raw: Option<Option<String>> = conn
            .query_row(
                "SELECT iteration_json FROM checkpoints WHERE id = ?1",
                params![checkpoint_id],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;

        let raw = raw.ok_or_else(|| StoreError::not_found("checkpoint", checkpoint_id))?;
        Ok(raw.and_then(|json| serde_json::from_str(&json).ok()))
    }

    /// Persist an updated iteration block. The only in-place mutation
    /// checkpoints allow.
    pub async fn save_iteration(&self, checkpoint_id: &str, state: &IterationState) -> Result<()> {
        let conn = self.db.lock().await;
        let changed = conn.execute(
            "UPDATE checkpoints SET iteration_json = ?1 WHERE id = ?2",
            params![serde_json::to_string(state)?, checkpoint_id],
        )?;
        if changed == 0 {
            return Err(StoreError::not_found("checkpoint", checkpoint_id).into());
        }
        Ok(())
    }

    /// Delete checkpoints past their expiry. Rows with no expiry are
    /// never touched. Idempotent; returns rows removed.
    pub async fn cleanup_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let conn = self.db.lock().await;
        let removed = conn.execute(
            "DELETE FROM checkpoints WHERE expires_at IS NOT NULL AND expires_at < ?1",
            params![now.to_rfc3339()],
        )?;
        if removed > 0 {
            tracing::info!("Removed {} expired checkpoints", removed);
        }
        Ok(removed)
    }

    /// Keep the `keep` most recent checkpoints for a task, delete the
    /// rest. Returns rows removed.
    pub async fn prune_task(&self, task_id: &str, keep: u32) -> Result<usize> {
        let conn = self.db.lock().await;
        let removed = conn.execute(
            "DELETE FROM checkpoints WHERE task_id = ?1 AND id NOT IN (
                 SELECT id FROM checkpoints WHERE task_id = ?1 ORDER BY seq DESC LIMIT ?2
             )",
            params![task_id, keep],
        )?;
        if removed > 0 {
            tracing::debug!("Pruned {} checkpoints for task {}", removed, task_id);
        }
        Ok(removed)
    }

    /// Delete checkpoints older than the given age, optionally scoped
    /// to one task. Returns rows removed.
    pub async fn cleanup_older_than(
        &self,
        max_age_minutes: i64,
        task_id: Option<&str>,
    ) -> Result<usize> {
        let cutoff = (Utc::now() - Duration::minutes(max_age_minutes)).to_rfc3339();
        let conn = self.db.lock().await;

        let removed = match task_id {
            Some(task_id) => conn.execute(
                "DELETE FROM checkpoints WHERE created_at < ?1 AND task_id = ?2",
                params![cutoff, task_id],
            )?,
            None => conn.execute(
                "DELETE FROM checkpoints WHERE created_at < ?1",
                params![cutoff],
            )?,
        };
        Ok(removed)
    }

    fn map_row(row: &rusqlite::Row) -> rusqlite::Result<Checkpoint> {
        let draft = match (
            row.get::<_, Option<String>>(12)?,
            row.get::<_, Option<String>>(13)?,
        ) {
            (Some(content), Some(kind)) => Some(Draft {
                content,
                kind: WorkProductKind::from_str(&kind).unwrap_or(WorkProductKind::Other),
            }),
            _ => None,
        };

        let subtasks: Vec<SubtaskStatus> = row
            .get::<_, Option<String>>(14)?
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default();
        let iteration: Option<IterationState> = row
            .get::<_, Option<String>>(15)?
            .and_then(|raw| serde_json::from_str(&raw).ok());

        Ok(Checkpoint {
            id: row.get(0)?,
            task_id: row.get(1)?,
            seq: row.get(2)?,
            trigger: CheckpointTrigger::from_str(&row.get::<_, String>(3)?)
                .unwrap_or(CheckpointTrigger::Manual),
            task_status: TaskStatus::from_str(&row.get::<_, String>(4)?)
                .unwrap_or(TaskStatus::Pending),
            task_notes: row.get(5)?,
            task_blocked_reason: row.get(6)?,
            task_assigned_agent: row.get(7)?,
            task_metadata: row
                .get::<_, Option<String>>(8)?
                .and_then(|raw| serde_json::from_str(&raw).ok()),
            phase: row.get(9)?,
            step: row.get(10)?,
            agent_context: row.get(11)?,
            draft,
            subtasks,
            iteration,
            created_at: parse_ts(&row.get::<_, String>(16)?),
            expires_at: row.get::<_, Option<String>>(17)?.map(|raw| parse_ts(&raw)),
        })
    }
}

const SELECT_CHECKPOINT: &str = "SELECT id, task_id, seq, trigger, task_status, task_notes, task_blocked_reason, task_assigned_agent, task_metadata, phase, step, agent_context, draft_content, draft_kind, subtasks_json, iteration_json, created_at, expires_at FROM checkpoints";

fn build_instructions(checkpoint: &Checkpoint) -> String {
    let mut lines = vec![format!(
        "Resume task {} from checkpoint {} (sequence {}).",
        checkpoint.task_id, checkpoint.id, checkpoint.seq
    )];
    lines.push(format!(
        "Task was {} when the checkpoint was taken.",
        checkpoint.task_status.as_str()
    ));
    if let Some(phase) = &checkpoint.phase {
        match &checkpoint.step {
            Some(step) => lines.push(format!("Continue phase '{}' at step '{}'.", phase, step)),
            None => lines.push(format!("Continue phase '{}'.", phase)),
        }
    }
    if let Some(reason) = &checkpoint.task_blocked_reason {
        lines.push(format!("The task was blocked: {}", reason));
    }
    if !checkpoint.subtasks.is_empty() {
        let completed = checkpoint
            .subtasks
            .iter()
            .filter(|s| s.status == TaskStatus::Completed)
            .count();
        lines.push(format!(
            "{} of {} sub-tasks were completed.",
            completed,
            checkpoint.subtasks.len()
        ));
    }
    if let Some(draft) = &checkpoint.draft {
        lines.push(format!(
            "A draft {} is attached; review it before producing a new one.",
            draft.kind.as_str()
        ));
    }
    lines.join(" ")
}
