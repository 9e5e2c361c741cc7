//! Bounded agentic loop control
//!
//! Each pass of a long-running agent loop is evaluated against a fixed
//! decision order. The iteration bound and the circuit breaker are a
//! fatal safety stop checked before anything else: once the budget is
//! spent or validations keep failing, the loop escalates to a human
//! even if the agent claims completion.
//!
//! Decision order after the safety stop:
//! 1. completion promise emitted -> complete
//! 2. ESCALATE / BLOCKED emitted -> escalate
//! 3. validations ran and all passed -> complete
//! 4. validations ran and some failed -> continue
//! 5. no signal, no validation -> continue

use anyhow::Result;
use chrono::Utc;

use crate::db::meta::{IterationEntry, IterationState, ValidationOutcome};
use crate::db::CheckpointRepository;
use crate::error::StoreError;

/// What the agent produced for one iteration: its raw output text and
/// the outcomes of any validation rules the external rule engine ran.
#[derive(Debug, Clone, Default)]
pub struct AgentOutput {
    pub text: String,
    pub validation: Option<Vec<ValidationOutcome>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopDecision {
    Complete(CompleteReason),
    Escalate(EscalateReason),
    Continue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompleteReason {
    /// The agent emitted one of the configured completion promises.
    PromiseSignal,
    /// Every validation rule passed.
    ValidationPassed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscalateReason {
    /// The agent emitted ESCALATE or BLOCKED.
    AgentSignal,
    /// The iteration budget is spent.
    IterationLimit,
    /// Too many consecutive failing validations.
    CircuitBreaker,
}

/// Evaluate one iteration. `state.iteration_number` counts completed
/// iterations, so the iteration being evaluated is number + 1.
pub fn evaluate(state: &IterationState, output: &AgentOutput) -> LoopDecision {
    let config = &state.config;
    let current = state.iteration_number + 1;

    // Safety stop, regardless of agent signal.
    if current >= config.max_iterations {
        return LoopDecision::Escalate(EscalateReason::IterationLimit);
    }
    let failed_now = output
        .validation
        .as_deref()
        .map(|outcomes| outcomes.iter().any(|o| !o.passed))
        .unwrap_or(false);
    let failures = state.consecutive_failures() + u32::from(failed_now);
    if failures >= config.circuit_breaker_threshold {
        return LoopDecision::Escalate(EscalateReason::CircuitBreaker);
    }

    if signals_promise(config.completion_promises.as_slice(), &output.text) {
        return LoopDecision::Complete(CompleteReason::PromiseSignal);
    }
    if output.text.contains("ESCALATE") || output.text.contains("BLOCKED") {
        return LoopDecision::Escalate(EscalateReason::AgentSignal);
    }
    match output.validation.as_deref() {
        Some(outcomes) if outcomes.iter().all(|o| o.passed) && !outcomes.is_empty() => {
            LoopDecision::Complete(CompleteReason::ValidationPassed)
        }
        _ => LoopDecision::Continue,
    }
}

fn signals_promise(promises: &[String], text: &str) -> bool {
    promises.iter().any(|promise| text.contains(promise.as_str()))
}

/// Drives the bounded loop for checkpoints carrying an iteration block.
pub struct IterationEngine {
    checkpoints: CheckpointRepository,
}

impl IterationEngine {
    pub fn new(checkpoints: CheckpointRepository) -> Self {
        Self { checkpoints }
    }

    /// Evaluate the agent's output for one iteration and persist the
    /// result. A `Continue` decision increments the iteration number
    /// and appends a history entry; terminal decisions leave the count
    /// where it is. The validation snapshot is updated either way.
    pub async fn step(
        &self,
        checkpoint_id: &str,
        output: &AgentOutput,
    ) -> Result<(LoopDecision, IterationState)> {
        let mut state = self
            .checkpoints
            .iteration_state(checkpoint_id)
            .await?
            .ok_or_else(|| {
                StoreError::Validation(format!(
                    "checkpoint {} has no iteration config",
                    checkpoint_id
                ))
            })?;

        let decision = evaluate(&state, output);

        if let Some(outcomes) = &output.validation {
            state.last_validation = Some(outcomes.clone());
        }
        if decision == LoopDecision::Continue {
            let iteration = state.iteration_number + 1;
            state.history.push(IterationEntry {
                iteration,
                at: Utc::now(),
                passed: output
                    .validation
                    .as_deref()
                    .map(|outcomes| outcomes.iter().all(|o| o.passed)),
                checkpoint_id: checkpoint_id.to_string(),
            });
            state.iteration_number = iteration;
        }
        self.checkpoints.save_iteration(checkpoint_id, &state).await?;

        if let LoopDecision::Escalate(reason) = &decision {
            tracing::warn!(
                "Iteration loop on checkpoint {} escalated: {:?}",
                checkpoint_id,
                reason
            );
        }
        Ok((decision, state))
    }
}
