// src/core/engine.rs — Planner/Developer/Reviewer execution loop
//
// One `execute` call drives one run to a terminal state. Decisions about
// what happens next live in `transitions`; this file performs the side
// effects: routing tasks, applying patches, running tests, persisting.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use super::approval::{ApprovalGate, AutoApprove};
use super::cancel::CancelSignal;
use super::cost::{CostTracker, TierCost};
use super::patch::{validate_patch, PatchVerdict};
use super::recovery;
use super::router::{AttemptState, Exchange, LlmRouter, RoutedResponse};
use super::task::{DevelopContext, PlanContext, ReviewContext, Task, TaskOutput};
use super::transitions::{transition, Counters, LoopAction, LoopEvent, RunState};
use super::types::*;
use crate::infra::config::ExecutionConfig;
use crate::infra::errors::ForgeError;
use crate::store::RunStore;
use crate::tools::ToolManager;
use crate::workspace::{ArtifactReport, ProjectManager};

/// Files whose change means dependencies should be reinstalled before testing.
const MANIFESTS: &[&str] = &["requirements.txt", "package.json", "composer.json"];

/// Lifecycle notifications for live rendering.
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    PlanReady {
        steps: usize,
        revision: u32,
    },
    StepStart {
        step: u32,
        total: usize,
        attempt: u32,
    },
    StepEnd {
        step: u32,
        decision: ReviewDecision,
        tier: Option<String>,
        cost_so_far: f64,
    },
    Retry {
        step: u32,
        retries: u32,
    },
    Replan {
        revision: u32,
        reason: String,
    },
    Finished {
        status: RunStatus,
        steps_executed: usize,
        cost: f64,
        elapsed: Duration,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub status: RunStatus,
    pub steps_total: usize,
    pub steps_executed: usize,
    pub steps_completed: usize,
    pub total_cost: f64,
    #[serde(with = "duration_secs")]
    pub elapsed: Duration,
    pub tiers: Vec<TierCost>,
    pub failure_reason: Option<String>,
    pub artifacts: Option<ArtifactReport>,
    pub workspace: Option<PathBuf>,
}

mod duration_secs {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }
}

/// Mutable state for one run while the loop drives it.
struct RunCtx {
    run: Run,
    state: RunState,
    cancel: CancelSignal,
    deadline: Instant,
    tracker: CostTracker,
    /// Why earlier plans were abandoned, fed back to the planner.
    failure_notes: Vec<String>,
    artifacts: Option<ArtifactReport>,
}

pub struct ExecutionLoop {
    router: LlmRouter,
    tools: Arc<dyn ToolManager>,
    projects: Arc<dyn ProjectManager>,
    store: Option<Arc<dyn RunStore>>,
    approvals: Arc<dyn ApprovalGate>,
    config: ExecutionConfig,
    on_progress: Option<Box<dyn Fn(ProgressEvent) + Send + Sync>>,
}

impl ExecutionLoop {
    pub fn new(
        router: LlmRouter,
        tools: Arc<dyn ToolManager>,
        projects: Arc<dyn ProjectManager>,
        config: ExecutionConfig,
    ) -> Self {
        Self {
            router,
            tools,
            projects,
            store: None,
            approvals: Arc::new(AutoApprove),
            config,
            on_progress: None,
        }
    }

    pub fn with_store(mut self, store: Arc<dyn RunStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_approvals(mut self, approvals: Arc<dyn ApprovalGate>) -> Self {
        self.approvals = approvals;
        self
    }

    /// Set a callback for real-time progress events.
    pub fn with_progress(mut self, cb: impl Fn(ProgressEvent) + Send + Sync + 'static) -> Self {
        self.on_progress = Some(Box::new(cb));
        self
    }

    pub fn router(&self) -> &LlmRouter {
        &self.router
    }

    fn emit(&self, event: ProgressEvent) {
        if let Some(ref cb) = self.on_progress {
            cb(event);
        }
    }

    /// Drive a fresh run from planning to a terminal state.
    pub async fn execute(&self, run: Run, cancel: CancelSignal) -> Result<RunSummary, ForgeError> {
        info!(run_id = %run.id, goal = %run.goal, stack = %run.stack, "starting run");
        let mut ctx = self.context(run, RunState::Planning, cancel);
        self.drive(&mut ctx, None).await
    }

    /// Continue a persisted, non-terminal run.
    pub async fn resume(&self, run_id: &str, cancel: CancelSignal) -> Result<RunSummary, ForgeError> {
        let store = self.store.as_ref().ok_or_else(|| {
            ForgeError::Config("resuming a run requires a persistent store".into())
        })?;
        let point = recovery::recover(store.as_ref(), run_id)?;
        info!(
            run_id,
            state = %point.state,
            pending = ?point.pending,
            "resuming run"
        );
        let mut ctx = self.context(point.run, point.state, cancel);
        self.drive(&mut ctx, point.pending).await
    }

    fn context(&self, run: Run, state: RunState, cancel: CancelSignal) -> RunCtx {
        RunCtx {
            run,
            state,
            cancel,
            deadline: Instant::now() + self.config.timeout(),
            tracker: CostTracker::new(),
            failure_notes: Vec::new(),
            artifacts: None,
        }
    }

    async fn drive(
        &self,
        ctx: &mut RunCtx,
        pending: Option<LoopEvent>,
    ) -> Result<RunSummary, ForgeError> {
        if let Err(e) = self.prepare_workspace(ctx).await {
            return Err(self.abort(ctx, e));
        }
        ctx.run.status = ctx.state.status();
        self.persist_run(&ctx.run);

        if let Some(event) = pending {
            if let Err(e) = self.apply(ctx, event) {
                return Err(self.abort(ctx, e));
            }
        }

        while !ctx.state.is_terminal() {
            let event = match self.next_event(ctx).await {
                Ok(event) => event,
                Err(ForgeError::BudgetExceeded { projected, remaining }) => {
                    warn!(run_id = %ctx.run.id, projected, remaining, "budget exhausted");
                    LoopEvent::BudgetExceeded
                }
                Err(ForgeError::Cancelled) => LoopEvent::CancelRequested,
                Err(ForgeError::TimeoutExceeded { .. }) => LoopEvent::DeadlineExceeded,
                Err(e) => return Err(self.abort(ctx, e)),
            };
            if let Err(e) = self.apply(ctx, event) {
                return Err(self.abort(ctx, e));
            }
        }

        let summary = self.summary(ctx);
        info!(
            run_id = %summary.run_id,
            status = %summary.status,
            cost = summary.total_cost,
            steps = summary.steps_executed,
            "run finished"
        );
        self.emit(ProgressEvent::Finished {
            status: summary.status,
            steps_executed: summary.steps_executed,
            cost: summary.total_cost,
            elapsed: summary.elapsed,
        });
        Ok(summary)
    }

    async fn prepare_workspace(&self, ctx: &mut RunCtx) -> Result<(), ForgeError> {
        match &ctx.run.workspace {
            Some(dir) => tokio::fs::create_dir_all(dir).await?,
            None => {
                let dir = self
                    .projects
                    .create_workspace(&ctx.run.id, &ctx.run.stack)
                    .await?;
                ctx.run.workspace = Some(dir);
            }
        }
        Ok(())
    }

    fn workspace(&self, ctx: &RunCtx) -> PathBuf {
        ctx.run.workspace.clone().unwrap_or_else(|| PathBuf::from("."))
    }

    /// Mark the run failed on an unexpected error and persist it.
    fn abort(&self, ctx: &mut RunCtx, error: ForgeError) -> ForgeError {
        error!(run_id = %ctx.run.id, error = %error, "run aborted");
        ctx.state = RunState::Failed;
        ctx.run.status = RunStatus::Failed;
        ctx.run.failure_reason = Some(error.to_string());
        ctx.run.finished_at = Some(Utc::now());
        self.persist_run(&ctx.run);
        self.emit(ProgressEvent::Finished {
            status: RunStatus::Failed,
            steps_executed: steps_executed(&ctx.run),
            cost: ctx.run.cost_used,
            elapsed: ctx.run.elapsed(),
        });
        error
    }

    async fn next_event(&self, ctx: &mut RunCtx) -> Result<LoopEvent, ForgeError> {
        if ctx.cancel.is_cancelled() {
            return Ok(LoopEvent::CancelRequested);
        }
        if Instant::now() >= ctx.deadline {
            warn!(
                run_id = %ctx.run.id,
                limit_secs = self.config.timeout_seconds,
                "execution timeout exceeded"
            );
            return Ok(LoopEvent::DeadlineExceeded);
        }

        match ctx.state {
            RunState::Planning => self.plan(ctx).await,
            RunState::AwaitingPlanApproval => Ok(if self.approvals.approve_plan(&ctx.run).await {
                LoopEvent::PlanApproved
            } else {
                LoopEvent::PlanRejected
            }),
            RunState::ExecutingStep => self.execute_step(ctx).await,
            RunState::AwaitingStepApproval => {
                let approved = match ctx.run.current() {
                    Some(step) => self.approvals.approve_step(&ctx.run, step).await,
                    None => true,
                };
                Ok(if approved {
                    LoopEvent::StepApproved
                } else {
                    LoopEvent::StepRejected
                })
            }
            RunState::Finalizing => self.finalize(ctx).await,
            RunState::Completed | RunState::Failed | RunState::Cancelled => {
                Err(ForgeError::InvalidTransition {
                    state: ctx.state.to_string(),
                    event: "dispatch".into(),
                })
            }
        }
    }

    fn counters(&self, ctx: &RunCtx) -> Counters {
        Counters {
            step_index: ctx.run.current_step,
            total_steps: ctx.run.steps.len(),
            step_retries: ctx.run.current().map(|s| s.retries).unwrap_or(0),
            max_retries_per_step: self.config.max_retries_per_step,
            plan_revisions: ctx.run.plan_revision_count,
            max_plan_revisions: self.config.max_plan_revisions,
            require_plan_approval: self.config.require_plan_approval,
            require_step_approval: self.config.require_step_approval,
        }
    }

    fn apply(&self, ctx: &mut RunCtx, event: LoopEvent) -> Result<(), ForgeError> {
        let t = transition(ctx.state, &event, &self.counters(ctx))?;
        debug!(
            run_id = %ctx.run.id,
            from = %ctx.state,
            to = %t.next,
            %event,
            action = ?t.action,
            "transition"
        );

        match t.action {
            LoopAction::AwaitPlanApproval | LoopAction::AwaitStepApproval | LoopAction::Complete => {}
            LoopAction::DispatchStep => ctx.run.current_step = 0,
            LoopAction::RetryStep { retries } => {
                if let Some(step) = ctx.run.current_mut() {
                    step.retries = retries;
                    step.status = StepStatus::Retrying;
                    self.emit(ProgressEvent::Retry {
                        step: step.step_number,
                        retries,
                    });
                }
            }
            LoopAction::AdvanceStep | LoopAction::Finalize => {
                if let Some(step) = ctx.run.current_mut() {
                    step.status = StepStatus::Completed;
                    step.failure_reason = None;
                }
                ctx.run.current_step += 1;
            }
            LoopAction::Replan { cause } => {
                let note = match ctx.run.current_mut() {
                    Some(step) => {
                        step.status = StepStatus::Failed;
                        step.failure_reason = Some(cause.to_string());
                        let detail = step.review_feedback.clone().unwrap_or_default();
                        format!("step {} ({}): {cause}. {detail}", step.step_number, step.description)
                    }
                    None => cause.to_string(),
                };
                ctx.failure_notes.push(note.trim().to_string());
                ctx.run.plan_revision_count += 1;
                self.emit(ProgressEvent::Replan {
                    revision: ctx.run.plan_revision_count,
                    reason: cause.to_string(),
                });
            }
            LoopAction::Fail(reason) => {
                let reason = reason.to_string();
                if let Some(step) = ctx.run.current_mut() {
                    if matches!(step.status, StepStatus::Running | StepStatus::Retrying) {
                        step.status = StepStatus::Failed;
                        step.failure_reason = Some(reason.clone());
                    }
                }
                error!(run_id = %ctx.run.id, %reason, "run failed");
                ctx.run.failure_reason = Some(reason);
            }
            LoopAction::Cancel => {
                info!(run_id = %ctx.run.id, "run cancelled");
                ctx.run.failure_reason = Some("cancelled by user".into());
            }
        }

        ctx.state = t.next;
        ctx.run.status = t.next.status();
        if t.next.is_terminal() {
            ctx.run.finished_at = Some(Utc::now());
        }
        self.persist_run(&ctx.run);
        Ok(())
    }

    /// Route one task on behalf of the run, folding its spend back in.
    async fn dispatch(
        &self,
        ctx: &mut RunCtx,
        task: &Task,
        floor: u8,
    ) -> Result<RoutedResponse, ForgeError> {
        let step_number = match task {
            Task::Plan(_) => None,
            Task::Develop(c) => Some(c.step_number),
            Task::Review(c) => Some(c.step_number),
        };
        let mut attempt =
            AttemptState::for_run(&ctx.run, ctx.cancel.clone()).with_floor(floor);
        let result = self.router.route(task, &mut attempt).await;

        ctx.run.cost_used = attempt.cost_used;
        let mut step =
            step_number.and_then(|n| ctx.run.steps.iter_mut().find(|s| s.step_number == n));
        for call in &attempt.calls {
            ctx.tracker.record(call);
            if let Some(s) = step.as_mut() {
                s.cost += call.cost;
                s.tokens_in += call.usage.input_tokens;
                s.tokens_out += call.usage.output_tokens;
            }
        }

        // Rejected and failed attempts are logged too, before any transition.
        let step_attempt = step.map(|s| s.retries + 1);
        let agent = task.kind().agent();
        for exchange in &attempt.exchanges {
            self.log_exchange(&ctx.run.id, step_number, step_attempt, agent, exchange);
        }
        result
    }

    async fn plan(&self, ctx: &mut RunCtx) -> Result<LoopEvent, ForgeError> {
        let workspace = self.workspace(ctx);
        let task = Task::Plan(PlanContext {
            goal: ctx.run.goal.clone(),
            stack: ctx.run.stack.clone(),
            existing_files: self.projects.list_files(&workspace),
            revision: ctx.run.plan_revision_count,
            failure_notes: ctx.failure_notes.clone(),
        });

        let resp = match self.dispatch(ctx, &task, 0).await {
            Ok(resp) => resp,
            Err(ForgeError::EscalationExhausted { history, .. }) => {
                warn!(run_id = %ctx.run.id, failures = history.len(), "planner exhausted escalation");
                return Ok(LoopEvent::PlanFailed);
            }
            Err(e) => return Err(e),
        };
        let TaskOutput::Plan(mut entries) = resp.output else {
            return Ok(LoopEvent::PlanFailed);
        };

        if entries.len() > self.config.max_steps_per_run {
            warn!(
                run_id = %ctx.run.id,
                planned = entries.len(),
                max = self.config.max_steps_per_run,
                "plan truncated"
            );
            entries.truncate(self.config.max_steps_per_run);
        }

        ctx.run.steps = entries
            .into_iter()
            .enumerate()
            .map(|(i, e)| e.into_step(i as u32 + 1))
            .collect();
        ctx.run.current_step = 0;
        ctx.run.plan_text = Some(resp.text);

        self.emit(ProgressEvent::PlanReady {
            steps: ctx.run.steps.len(),
            revision: ctx.run.plan_revision_count,
        });
        Ok(LoopEvent::PlanReady {
            step_count: ctx.run.steps.len(),
        })
    }

    async fn execute_step(&self, ctx: &mut RunCtx) -> Result<LoopEvent, ForgeError> {
        let index = ctx.run.current_step;
        let total_steps = ctx.run.steps.len();
        let completed: Vec<String> = ctx.run.steps[..index.min(total_steps)]
            .iter()
            .filter(|s| s.status == StepStatus::Completed)
            .map(|s| s.description.clone())
            .collect();
        let goal = ctx.run.goal.clone();
        let stack = ctx.run.stack.clone();
        let Some(step) = ctx.run.current_mut() else {
            return Err(ForgeError::NotFound {
                kind: "step",
                id: (index + 1).to_string(),
            });
        };
        step.status = StepStatus::Running;
        let step_number = step.step_number;
        let retries = step.retries;
        let develop = Task::Develop(DevelopContext {
            goal,
            stack,
            step_number,
            total_steps,
            instruction: step.description.clone(),
            files: step.files.clone(),
            completed,
            feedback: if retries > 0 {
                step.review_feedback.clone()
            } else {
                None
            },
        });
        self.persist_current_step(ctx);
        self.emit(ProgressEvent::StepStart {
            step: step_number,
            total: total_steps,
            attempt: retries + 1,
        });

        let top = self.router.tiers().top_enabled_rank().unwrap_or(0);
        let floor = retries.min(top as u32) as u8;

        let decision = match self.dispatch(ctx, &develop, floor).await {
            Ok(resp) => self.check_and_review(ctx, resp).await?,
            Err(ForgeError::EscalationExhausted { history, .. }) => {
                warn!(
                    run_id = %ctx.run.id,
                    step = step_number,
                    failures = history.len(),
                    "developer exhausted escalation"
                );
                if let Some(step) = ctx.run.current_mut() {
                    step.review_feedback = Some(format!(
                        "No tier produced a usable patch after {} attempts",
                        history.len()
                    ));
                }
                (ReviewDecision::Fail, None)
            }
            Err(e) => return Err(e),
        };

        let (decision, tier) = decision;
        self.emit(ProgressEvent::StepEnd {
            step: step_number,
            decision,
            tier,
            cost_so_far: ctx.run.cost_used,
        });
        Ok(LoopEvent::StepReviewed(decision))
    }

    /// Validate, apply and test a developer patch, then ask for a review.
    async fn check_and_review(
        &self,
        ctx: &mut RunCtx,
        resp: RoutedResponse,
    ) -> Result<(ReviewDecision, Option<String>), ForgeError> {
        let TaskOutput::Patch(patch) = resp.output else {
            return Ok((ReviewDecision::Retry, Some(resp.tier)));
        };
        let workspace = self.workspace(ctx);
        let stack = ctx.run.stack.clone();
        let max_attempts = self.config.max_retries_per_step;

        let Some(step) = ctx.run.current_mut() else {
            return Ok((ReviewDecision::Fail, Some(resp.tier)));
        };
        step.model_used = Some(resp.model.clone());
        step.patch = Some(patch.clone());
        let step_number = step.step_number;
        let instruction = step.description.clone();
        let attempt = step.retries + 1;

        if let PatchVerdict::Invalid(rejection) = validate_patch(&patch) {
            warn!(step = step_number, %rejection, "patch rejected before apply");
            step.review_feedback = Some(format!("Patch rejected: {rejection}"));
            return Ok((ReviewDecision::Retry, Some(resp.tier)));
        }

        let changed = match self.tools.apply_patch(&workspace, &patch).await {
            Ok(files) => files,
            Err(ForgeError::PatchApply { reason }) => {
                warn!(step = step_number, %reason, "patch did not apply");
                if let Some(step) = ctx.run.current_mut() {
                    step.review_feedback = Some(format!("Patch did not apply: {reason}"));
                }
                return Ok((ReviewDecision::Retry, Some(resp.tier)));
            }
            Err(e) => return Err(e),
        };
        if changed
            .iter()
            .any(|f| MANIFESTS.iter().any(|m| f.ends_with(m)))
        {
            if let Err(e) = self.projects.install_dependencies(&workspace, &stack).await {
                warn!(step = step_number, error = %e, "dependency install failed, continuing");
            }
        }

        let tests = match self.tools.run_tests(&workspace, &stack).await {
            Ok(outcome) => outcome,
            Err(e) => TestOutcome {
                passed: false,
                output: format!("test run failed: {e}"),
                per_test: Vec::new(),
            },
        };
        debug!(step = step_number, tests = %tests.summary(), "tests finished");
        if let Some(step) = ctx.run.current_mut() {
            step.test_result = Some(tests.clone());
        }
        self.persist_current_step(ctx);

        let review = Task::Review(ReviewContext {
            step_number,
            instruction,
            patch,
            tests: tests.clone(),
            attempt,
            max_attempts,
        });
        let (decision, feedback) = match self.dispatch(ctx, &review, 0).await {
            Ok(RoutedResponse {
                output: TaskOutput::Review { decision, feedback },
                ..
            }) => (decision, feedback),
            Ok(_) => (fallback_decision(&tests), tests.summary()),
            Err(ForgeError::EscalationExhausted { .. }) => {
                warn!(step = step_number, "reviewer exhausted escalation, using test outcome");
                (fallback_decision(&tests), tests.summary())
            }
            Err(e) => return Err(e),
        };
        if let Some(step) = ctx.run.current_mut() {
            step.review_feedback = Some(feedback);
        }
        Ok((decision, Some(resp.tier)))
    }

    async fn finalize(&self, ctx: &mut RunCtx) -> Result<LoopEvent, ForgeError> {
        let workspace = self.workspace(ctx);
        let report = self.projects.verify_artifacts(&workspace, &ctx.run.stack);
        let unfinished = ctx
            .run
            .steps
            .iter()
            .filter(|s| s.status != StepStatus::Completed)
            .count();
        let satisfied = report.is_satisfied();
        let missing = report.missing.join(", ");
        ctx.artifacts = Some(report);

        if unfinished > 0 {
            return Ok(LoopEvent::FinalizeFailed(format!(
                "{unfinished} step(s) not completed"
            )));
        }
        if !satisfied {
            return Ok(LoopEvent::FinalizeFailed(format!(
                "missing expected files: {missing}"
            )));
        }
        Ok(LoopEvent::FinalizeSucceeded)
    }

    fn summary(&self, ctx: &RunCtx) -> RunSummary {
        RunSummary {
            run_id: ctx.run.id.clone(),
            status: ctx.run.status,
            steps_total: ctx.run.steps.len(),
            steps_executed: steps_executed(&ctx.run),
            steps_completed: ctx
                .run
                .steps
                .iter()
                .filter(|s| s.status == StepStatus::Completed)
                .count(),
            total_cost: ctx.run.cost_used,
            elapsed: ctx.run.elapsed(),
            tiers: ctx.tracker.tier_breakdown(),
            failure_reason: ctx.run.failure_reason.clone(),
            artifacts: ctx.artifacts.clone(),
            workspace: ctx.run.workspace.clone(),
        }
    }

    // -- Persistence (non-fatal) --

    fn persist_run(&self, run: &Run) {
        let Some(ref store) = self.store else { return };
        if let Err(e) = store.save_run(run) {
            warn!(run_id = %run.id, error = %e, "failed to persist run");
        }
    }

    fn persist_current_step(&self, ctx: &RunCtx) {
        let Some(ref store) = self.store else { return };
        let Some(step) = ctx.run.current() else { return };
        if let Err(e) = store.save_step(&ctx.run.id, step) {
            warn!(run_id = %ctx.run.id, error = %e, "failed to persist step");
        }
    }

    fn log_exchange(
        &self,
        run_id: &str,
        step_number: Option<u32>,
        attempt: Option<u32>,
        agent: AgentRole,
        exchange: &Exchange,
    ) {
        let Some(ref store) = self.store else { return };
        for (direction, payload) in [
            (Direction::Request, &exchange.request),
            (Direction::Response, &exchange.response),
        ] {
            let entry = AgentConversation::new(run_id, step_number, agent, direction, payload.as_str())
                .with_attempt(attempt)
                .with_tier(&exchange.tier);
            if let Err(e) = store.append_conversation(&entry) {
                warn!(run_id, error = %e, "failed to append conversation log");
            }
        }
    }
}

fn steps_executed(run: &Run) -> usize {
    run.steps
        .iter()
        .filter(|s| s.status != StepStatus::Pending)
        .count()
}

/// Decision used when no reviewer response is available.
fn fallback_decision(tests: &TestOutcome) -> ReviewDecision {
    if tests.passed {
        ReviewDecision::Accept
    } else {
        ReviewDecision::Retry
    }
}
