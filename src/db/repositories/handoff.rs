//! Agent handoff repository
//!
//! Ordered agent-to-agent transfers on one task. Append-only. Every
//! record satisfies `1 <= chain_position <= chain_length`, and all
//! handoffs of a task share one chain length.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::db::Database;
use crate::error::StoreError;

use super::{parse_ts, record_activity};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentHandoff {
    pub id: String,
    pub task_id: String,
    pub from_agent: String,
    pub to_agent: String,
    pub work_product_id: Option<String>,
    pub context: Option<String>,
    pub chain_position: u32,
    pub chain_length: u32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewHandoff {
    pub task_id: String,
    pub from_agent: String,
    pub to_agent: String,
    pub work_product_id: Option<String>,
    pub context: Option<String>,
    pub chain_position: u32,
    pub chain_length: u32,
}

pub struct HandoffRepository {
    db: Database,
}

impl HandoffRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Record a handoff. Position must sit inside the chain, the chain
    /// length must agree with any existing handoffs on the task, and
    /// referenced rows must exist.
    pub async fn create(&self, new: NewHandoff) -> Result<AgentHandoff> {
        if new.chain_position < 1 || new.chain_position > new.chain_length {
            return Err(StoreError::Validation(format!(
                "chain position {} outside [1, {}]",
                new.chain_position, new.chain_length
            ))
            .into());
        }

        let id = Uuid::new_v4().to_string();
        let now = Utc::now();

        let conn = self.db.lock().await;

        let task_exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM tasks WHERE id = ?1)",
            params![new.task_id],
            |row| row.get(0),
        )?;
        if !task_exists {
            return Err(StoreError::Constraint(format!(
                "handoff references missing task {}",
                new.task_id
            ))
            .into());
        }

        if let Some(wp_id) = &new.work_product_id {
            let exists: bool = conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM work_products WHERE id = ?1)",
                params![wp_id],
                |row| row.get(0),
            )?;
            if !exists {
                return Err(StoreError::Constraint(format!(
                    "handoff references missing work product {}",
                    wp_id
                ))
                .into());
            }
        }

        let existing_length: Option<u32> = conn.query_row(
            "SELECT chain_length FROM agent_handoffs WHERE task_id = ?1 LIMIT 1",
            params![new.task_id],
            |row| row.get(0),
        )
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(other),
        })?;
        if let Some(length) = existing_length {
            if length != new.chain_length {
                return Err(StoreError::Validation(format!(
                    "chain length {} disagrees with existing chain length {} for task {}",
                    new.chain_length, length, new.task_id
                ))
                .into());
            }
        }

        let handoff = AgentHandoff {
            id: id.clone(),
            task_id: new.task_id,
            from_agent: new.from_agent,
            to_agent: new.to_agent,
            work_product_id: new.work_product_id,
            context: new.context,
            chain_position: new.chain_position,
            chain_length: new.chain_length,
            created_at: now,
        };

        conn.execute(
            "INSERT INTO agent_handoffs (id, task_id, from_agent, to_agent, work_product_id,
                                         context, chain_position, chain_length, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                handoff.id,
                handoff.task_id,
                handoff.from_agent,
                handoff.to_agent,
                handoff.work_product_id,
                handoff.context,
                handoff.chain_position,
                handoff.chain_length,
                handoff.created_at.to_rfc3339(),
            ],
        )
        .context("Failed to insert handoff")?;
        record_activity(&conn, "handoff", &id, "created");

        tracing::debug!(
            "Recorded handoff {} ({} -> {}) on task {}",
            id,
            handoff.from_agent,
            handoff.to_agent,
            handoff.task_id
        );
        Ok(handoff)
    }

    /// The task's handoff chain in position order
    pub async fn chain(&self, task_id: &str) -> Result<Vec<AgentHandoff>> {
        let conn = self.db.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, task_id, from_agent, to_agent, work_product_id, context,
                    chain_position, chain_length, created_at
             FROM agent_handoffs WHERE task_id = ?1
             ORDER BY chain_position ASC, created_at ASC",
        )?;

        let handoffs = stmt
            .query_map(params![task_id], |row| {
                Ok(AgentHandoff {
                    id: row.get(0)?,
                    task_id: row.get(1)?,
                    from_agent: row.get(2)?,
                    to_agent: row.get(3)?,
                    work_product_id: row.get(4)?,
                    context: row.get(5)?,
                    chain_position: row.get(6)?,
                    chain_length: row.get(7)?,
                    created_at: parse_ts(&row.get::<_, String>(8)?),
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(handoffs)
    }
}
