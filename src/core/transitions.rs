// src/core/transitions.rs — Execution loop state table
//
// Pure (state, event) -> (state, action) mapping. The loop performs the
// side effects an action names; nothing here touches providers or storage.

use std::fmt;

use crate::core::types::{ReviewDecision, RunStatus};
use crate::infra::errors::ForgeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Planning,
    AwaitingPlanApproval,
    ExecutingStep,
    AwaitingStepApproval,
    Finalizing,
    Completed,
    Failed,
    Cancelled,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunState::Completed | RunState::Failed | RunState::Cancelled
        )
    }

    pub fn status(self) -> RunStatus {
        match self {
            RunState::Planning => RunStatus::Planning,
            RunState::AwaitingPlanApproval => RunStatus::AwaitingPlanApproval,
            RunState::ExecutingStep => RunStatus::Executing,
            RunState::AwaitingStepApproval => RunStatus::AwaitingStepApproval,
            RunState::Finalizing => RunStatus::Finalizing,
            RunState::Completed => RunStatus::Completed,
            RunState::Failed => RunStatus::Failed,
            RunState::Cancelled => RunStatus::Cancelled,
        }
    }

    /// Where a persisted run picks back up. A run that never left `Pending`
    /// starts at planning.
    pub fn from_status(status: RunStatus) -> Self {
        match status {
            RunStatus::Pending | RunStatus::Planning => RunState::Planning,
            RunStatus::AwaitingPlanApproval => RunState::AwaitingPlanApproval,
            RunStatus::Executing => RunState::ExecutingStep,
            RunStatus::AwaitingStepApproval => RunState::AwaitingStepApproval,
            RunStatus::Finalizing => RunState::Finalizing,
            RunStatus::Completed => RunState::Completed,
            RunStatus::Failed => RunState::Failed,
            RunStatus::Cancelled => RunState::Cancelled,
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.status().as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LoopEvent {
    PlanReady { step_count: usize },
    /// The planner could not produce a usable plan.
    PlanFailed,
    PlanApproved,
    PlanRejected,
    StepReviewed(ReviewDecision),
    StepApproved,
    StepRejected,
    BudgetExceeded,
    DeadlineExceeded,
    CancelRequested,
    FinalizeSucceeded,
    FinalizeFailed(String),
}

impl fmt::Display for LoopEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoopEvent::PlanReady { step_count } => write!(f, "plan_ready({step_count})"),
            LoopEvent::PlanFailed => f.write_str("plan_failed"),
            LoopEvent::PlanApproved => f.write_str("plan_approved"),
            LoopEvent::PlanRejected => f.write_str("plan_rejected"),
            LoopEvent::StepReviewed(d) => write!(f, "step_reviewed({d})"),
            LoopEvent::StepApproved => f.write_str("step_approved"),
            LoopEvent::StepRejected => f.write_str("step_rejected"),
            LoopEvent::BudgetExceeded => f.write_str("budget_exceeded"),
            LoopEvent::DeadlineExceeded => f.write_str("deadline_exceeded"),
            LoopEvent::CancelRequested => f.write_str("cancel_requested"),
            LoopEvent::FinalizeSucceeded => f.write_str("finalize_succeeded"),
            LoopEvent::FinalizeFailed(_) => f.write_str("finalize_failed"),
        }
    }
}

/// Loop counters the table needs to decide between retry, replan and fail.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Counters {
    /// Index of the step under review.
    pub step_index: usize,
    pub total_steps: usize,
    /// Retries already spent on the current step.
    pub step_retries: u32,
    pub max_retries_per_step: u32,
    pub plan_revisions: u32,
    pub max_plan_revisions: u32,
    pub require_plan_approval: bool,
    pub require_step_approval: bool,
}

impl Counters {
    fn is_last_step(&self) -> bool {
        self.step_index + 1 >= self.total_steps
    }

    fn can_replan(&self) -> bool {
        self.plan_revisions < self.max_plan_revisions
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FailReason {
    StepExhaustedRetries,
    StepFailed,
    EmptyPlan,
    PlanningFailed,
    PlanRejected,
    BudgetExceeded,
    TimeoutExceeded,
    Finalize(String),
}

impl fmt::Display for FailReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailReason::StepExhaustedRetries => f.write_str("step exhausted retries"),
            FailReason::StepFailed => f.write_str("step failed review"),
            FailReason::EmptyPlan => f.write_str("planner produced no steps"),
            FailReason::PlanningFailed => f.write_str("planning failed"),
            FailReason::PlanRejected => f.write_str("plan rejected"),
            FailReason::BudgetExceeded => f.write_str("budget exceeded"),
            FailReason::TimeoutExceeded => f.write_str("execution timeout exceeded"),
            FailReason::Finalize(detail) => write!(f, "finalization failed: {detail}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LoopAction {
    AwaitPlanApproval,
    /// Start the first step of a fresh plan.
    DispatchStep,
    /// Re-run the current step; carries the new retry count.
    RetryStep { retries: u32 },
    /// Current step accepted; move to the next one.
    AdvanceStep,
    AwaitStepApproval,
    /// Discard the remaining plan and plan again with failure context.
    Replan { cause: FailReason },
    Finalize,
    Complete,
    Fail(FailReason),
    Cancel,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub next: RunState,
    pub action: LoopAction,
}

impl Transition {
    fn to(next: RunState, action: LoopAction) -> Self {
        Self { next, action }
    }

    fn fail(reason: FailReason) -> Self {
        Self::to(RunState::Failed, LoopAction::Fail(reason))
    }
}

pub fn transition(
    state: RunState,
    event: &LoopEvent,
    counters: &Counters,
) -> Result<Transition, ForgeError> {
    if state.is_terminal() {
        return Err(invalid(state, event));
    }

    // Hard stops apply from every live state.
    match event {
        LoopEvent::CancelRequested => {
            return Ok(Transition::to(RunState::Cancelled, LoopAction::Cancel))
        }
        LoopEvent::BudgetExceeded => return Ok(Transition::fail(FailReason::BudgetExceeded)),
        LoopEvent::DeadlineExceeded => {
            return Ok(Transition::fail(FailReason::TimeoutExceeded))
        }
        _ => {}
    }

    let t = match (state, event) {
        (RunState::Planning, LoopEvent::PlanReady { step_count: 0 }) => {
            Transition::fail(FailReason::EmptyPlan)
        }
        (RunState::Planning, LoopEvent::PlanReady { .. }) => {
            if counters.require_plan_approval {
                Transition::to(RunState::AwaitingPlanApproval, LoopAction::AwaitPlanApproval)
            } else {
                Transition::to(RunState::ExecutingStep, LoopAction::DispatchStep)
            }
        }
        (RunState::Planning, LoopEvent::PlanFailed) => Transition::fail(FailReason::PlanningFailed),

        (RunState::AwaitingPlanApproval, LoopEvent::PlanApproved) => {
            Transition::to(RunState::ExecutingStep, LoopAction::DispatchStep)
        }
        (RunState::AwaitingPlanApproval, LoopEvent::PlanRejected) => {
            replan_or_fail(counters, FailReason::PlanRejected)
        }

        (RunState::ExecutingStep, LoopEvent::StepReviewed(decision)) => {
            on_review(*decision, counters)
        }

        (RunState::AwaitingStepApproval, LoopEvent::StepApproved) => advance(counters),
        (RunState::AwaitingStepApproval, LoopEvent::StepRejected) => retry(counters),

        (RunState::Finalizing, LoopEvent::FinalizeSucceeded) => {
            Transition::to(RunState::Completed, LoopAction::Complete)
        }
        (RunState::Finalizing, LoopEvent::FinalizeFailed(detail)) => {
            Transition::fail(FailReason::Finalize(detail.clone()))
        }

        _ => return Err(invalid(state, event)),
    };
    Ok(t)
}

fn on_review(decision: ReviewDecision, counters: &Counters) -> Transition {
    match decision {
        ReviewDecision::Accept if counters.require_step_approval => {
            Transition::to(RunState::AwaitingStepApproval, LoopAction::AwaitStepApproval)
        }
        ReviewDecision::Accept => advance(counters),
        ReviewDecision::Retry => retry(counters),
        ReviewDecision::Fail | ReviewDecision::EscalateToPlanner => {
            replan_or_fail(counters, FailReason::StepFailed)
        }
    }
}

fn advance(counters: &Counters) -> Transition {
    if counters.is_last_step() {
        Transition::to(RunState::Finalizing, LoopAction::Finalize)
    } else {
        Transition::to(RunState::ExecutingStep, LoopAction::AdvanceStep)
    }
}

fn retry(counters: &Counters) -> Transition {
    let retries = counters.step_retries + 1;
    if retries < counters.max_retries_per_step {
        Transition::to(RunState::ExecutingStep, LoopAction::RetryStep { retries })
    } else {
        replan_or_fail(counters, FailReason::StepExhaustedRetries)
    }
}

fn replan_or_fail(counters: &Counters, cause: FailReason) -> Transition {
    if counters.can_replan() {
        Transition::to(RunState::Planning, LoopAction::Replan { cause })
    } else {
        Transition::fail(cause)
    }
}

fn invalid(state: RunState, event: &LoopEvent) -> ForgeError {
    ForgeError::InvalidTransition {
        state: state.to_string(),
        event: event.to_string(),
    }
}
