// src/core/recovery.rs — Resume point for interrupted runs
//
// Agent exchanges are logged before the transition they cause is persisted.
// A crash in between leaves a response in the log that the run row does
// not reflect yet; replaying that response yields the pending event.
// Reviewer verdicts carry the step attempt they judged and only replay
// against that same attempt.

use crate::core::plan::parse_plan;
use crate::core::task::parse_review;
use crate::core::transitions::{LoopEvent, RunState};
use crate::core::types::{AgentRole, Direction, Run, StepStatus};
use crate::infra::errors::ForgeError;
use crate::store::RunStore;

#[derive(Debug, Clone)]
pub struct RecoveryPoint {
    pub run: Run,
    pub state: RunState,
    /// Logged but unapplied outcome to apply before dispatching anything.
    pub pending: Option<LoopEvent>,
}

pub fn recover(store: &dyn RunStore, run_id: &str) -> Result<RecoveryPoint, ForgeError> {
    let mut run = store.load_run(run_id)?.ok_or_else(|| ForgeError::NotFound {
        kind: "run",
        id: run_id.to_string(),
    })?;
    let state = RunState::from_status(run.status);
    if state.is_terminal() {
        return Err(ForgeError::InvalidTransition {
            state: state.to_string(),
            event: "resume".into(),
        });
    }

    let log = store.conversations(run_id)?;
    let last = log
        .iter()
        .rev()
        .find(|c| c.direction == Direction::Response);

    let pending = match (state, last) {
        (RunState::Planning, Some(entry)) if entry.agent == AgentRole::Planner => {
            match parse_plan(&entry.payload) {
                Ok(entries) if run.steps.is_empty() => {
                    run.steps = entries
                        .into_iter()
                        .enumerate()
                        .map(|(i, e)| e.into_step(i as u32 + 1))
                        .collect();
                    run.current_step = 0;
                    run.plan_text = Some(entry.payload.clone());
                    Some(LoopEvent::PlanReady {
                        step_count: run.steps.len(),
                    })
                }
                _ => None,
            }
        }
        (RunState::ExecutingStep, Some(entry)) if entry.agent == AgentRole::Reviewer => {
            let current = run.current_step;
            match run.steps.get_mut(current) {
                // A verdict from an earlier attempt was already applied.
                Some(step)
                    if step.status == StepStatus::Running
                        && entry.step_number == Some(step.step_number)
                        && entry.attempt == Some(step.retries + 1) =>
                {
                    parse_review(&entry.payload).map(|(decision, feedback)| {
                        step.review_feedback = Some(feedback);
                        LoopEvent::StepReviewed(decision)
                    })
                }
                _ => None,
            }
        }
        _ => None,
    };

    // A step caught mid-flight without a logged verdict is simply re-run.
    if pending.is_none() {
        if let Some(step) = run.current_mut() {
            if step.status == StepStatus::Running {
                step.status = StepStatus::Retrying;
            }
        }
    }

    Ok(RecoveryPoint {
        run,
        state,
        pending,
    })
}
