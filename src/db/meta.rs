//! Typed metadata sub-structures
//!
//! Stream membership, PRD milestones and checkpoint iteration state are
//! explicit serde structures stored as JSON in their own columns, tagged
//! with a `kind` discriminator and validated on write. Free-form
//! metadata still exists as an untyped JSON column beside them.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// Stream membership declared on a task. Every member task of a stream
/// carries a copy; the resolver treats the oldest member as the
/// authority for `depends_on` and `files`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename = "stream")]
pub struct StreamMeta {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    /// Ids of streams that must complete before this one starts.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// File paths this stream expects to touch, used for conflict checks.
    #[serde(default)]
    pub files: Vec<String>,
}

impl StreamMeta {
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(StoreError::Validation("stream id must not be empty".into()).into());
        }
        if self.depends_on.iter().any(|dep| dep == &self.id) {
            return Err(
                StoreError::Validation(format!("stream {} depends on itself", self.id)).into(),
            );
        }
        Ok(())
    }
}

/// Named group of task ids inside a PRD.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Milestone {
    pub name: String,
    #[serde(default)]
    pub task_ids: Vec<String>,
}

/// Bounds for the agentic iteration loop carried by a checkpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename = "iteration")]
pub struct IterationConfig {
    pub max_iterations: u32,
    /// Signal tokens the agent emits to declare successful completion.
    #[serde(default = "default_promises")]
    pub completion_promises: Vec<String>,
    /// Names of validation rules the external rule engine runs; the
    /// engine owns the rules, we only record their outcomes.
    #[serde(default)]
    pub validation_rules: Vec<String>,
    /// Consecutive failing validations before a forced escalation.
    #[serde(default = "default_breaker")]
    pub circuit_breaker_threshold: u32,
}

fn default_promises() -> Vec<String> {
    vec!["COMPLETE".to_string()]
}

fn default_breaker() -> u32 {
    3
}

impl IterationConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_iterations == 0 {
            return Err(StoreError::Validation("max_iterations must be at least 1".into()).into());
        }
        if self.circuit_breaker_threshold == 0 {
            return Err(StoreError::Validation(
                "circuit_breaker_threshold must be at least 1".into(),
            )
            .into());
        }
        Ok(())
    }
}

/// Outcome of one validation rule, as reported by the rule engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ValidationOutcome {
    pub rule: String,
    pub passed: bool,
    #[serde(default)]
    pub severity: Severity,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[default]
    Error,
    Warning,
}

/// One completed iteration of the loop.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IterationEntry {
    pub iteration: u32,
    pub at: DateTime<Utc>,
    /// None when no validation ran for this iteration.
    pub passed: Option<bool>,
    pub checkpoint_id: String,
}

/// Mutable iteration block stored on a checkpoint. The checkpoint row
/// itself is append-only; this is the one part updated in place.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IterationState {
    pub config: IterationConfig,
    /// Count of completed iterations.
    #[serde(default)]
    pub iteration_number: u32,
    #[serde(default)]
    pub history: Vec<IterationEntry>,
    /// Snapshot of the most recent validation run.
    #[serde(default)]
    pub last_validation: Option<Vec<ValidationOutcome>>,
}

impl IterationState {
    pub fn new(config: IterationConfig) -> Self {
        Self {
            config,
            iteration_number: 0,
            history: Vec::new(),
            last_validation: None,
        }
    }

    /// Length of the trailing run of failing validations in the history.
    pub fn consecutive_failures(&self) -> u32 {
        self.history
            .iter()
            .rev()
            .take_while(|entry| entry.passed == Some(false))
            .count() as u32
    }
}
