// src/core/types.rs — Core domain types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// The closed set of things the router can be asked to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    Plan,
    Develop,
    Review,
}

impl TaskKind {
    pub fn agent(self) -> AgentRole {
        match self {
            TaskKind::Plan => AgentRole::Planner,
            TaskKind::Develop => AgentRole::Developer,
            TaskKind::Review => AgentRole::Reviewer,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskKind::Plan => "plan",
            TaskKind::Develop => "develop",
            TaskKind::Review => "review",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentRole {
    Planner,
    Developer,
    Reviewer,
}

impl AgentRole {
    pub fn as_str(self) -> &'static str {
        match self {
            AgentRole::Planner => "planner",
            AgentRole::Developer => "developer",
            AgentRole::Reviewer => "reviewer",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "planner" => Some(AgentRole::Planner),
            "developer" => Some(AgentRole::Developer),
            "reviewer" => Some(AgentRole::Reviewer),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Request,
    Response,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Request => "request",
            Direction::Response => "response",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "request" => Some(Direction::Request),
            "response" => Some(Direction::Response),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Planning,
    AwaitingPlanApproval,
    Executing,
    AwaitingStepApproval,
    Finalizing,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Planning => "planning",
            RunStatus::AwaitingPlanApproval => "awaiting_plan_approval",
            RunStatus::Executing => "executing",
            RunStatus::AwaitingStepApproval => "awaiting_step_approval",
            RunStatus::Finalizing => "finalizing",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "pending" => RunStatus::Pending,
            "planning" => RunStatus::Planning,
            "awaiting_plan_approval" => RunStatus::AwaitingPlanApproval,
            "executing" => RunStatus::Executing,
            "awaiting_step_approval" => RunStatus::AwaitingStepApproval,
            "finalizing" => RunStatus::Finalizing,
            "completed" => RunStatus::Completed,
            "failed" => RunStatus::Failed,
            "cancelled" => RunStatus::Cancelled,
            _ => return None,
        })
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
        )
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Retrying,
}

impl StepStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
            StepStatus::Retrying => "retrying",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "pending" => StepStatus::Pending,
            "running" => StepStatus::Running,
            "completed" => StepStatus::Completed,
            "failed" => StepStatus::Failed,
            "retrying" => StepStatus::Retrying,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReviewDecision {
    Accept,
    Retry,
    Fail,
    EscalateToPlanner,
}

impl ReviewDecision {
    pub fn as_str(self) -> &'static str {
        match self {
            ReviewDecision::Accept => "ACCEPT",
            ReviewDecision::Retry => "RETRY",
            ReviewDecision::Fail => "FAIL",
            ReviewDecision::EscalateToPlanner => "ESCALATE_TO_PLANNER",
        }
    }

    /// Accepts the canonical names plus a few spellings models produce.
    pub fn parse(s: &str) -> Option<Self> {
        let norm = s.trim().to_ascii_uppercase().replace([' ', '-'], "_");
        match norm.as_str() {
            "ACCEPT" | "ACCEPTED" | "APPROVE" | "APPROVED" => Some(ReviewDecision::Accept),
            "RETRY" => Some(ReviewDecision::Retry),
            "FAIL" | "FAILED" | "REJECT" => Some(ReviewDecision::Fail),
            "ESCALATE_TO_PLANNER" | "ESCALATE" | "REPLAN" => {
                Some(ReviewDecision::EscalateToPlanner)
            }
            _ => None,
        }
    }
}

impl fmt::Display for ReviewDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a plan entry does, inferred from its wording.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    CreateFile,
    ModifyFile,
    DeleteFile,
    RunTests,
    InstallPackage,
    Configure,
    Debug,
    Refactor,
    Other,
}

impl ActionType {
    pub fn as_str(self) -> &'static str {
        match self {
            ActionType::CreateFile => "create_file",
            ActionType::ModifyFile => "modify_file",
            ActionType::DeleteFile => "delete_file",
            ActionType::RunTests => "run_tests",
            ActionType::InstallPackage => "install_package",
            ActionType::Configure => "configure",
            ActionType::Debug => "debug",
            ActionType::Refactor => "refactor",
            ActionType::Other => "other",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "create_file" => ActionType::CreateFile,
            "modify_file" => ActionType::ModifyFile,
            "delete_file" => ActionType::DeleteFile,
            "run_tests" => ActionType::RunTests,
            "install_package" => ActionType::InstallPackage,
            "configure" => ActionType::Configure,
            "debug" => ActionType::Debug,
            "refactor" => ActionType::Refactor,
            _ => ActionType::Other,
        }
    }
}

/// Why one routed attempt did not produce a usable response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Validation,
    RateLimit,
    Timeout,
    Auth,
    Malformed,
    Unavailable,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureKind::Validation => "validation",
            FailureKind::RateLimit => "rate_limit",
            FailureKind::Timeout => "timeout",
            FailureKind::Auth => "auth",
            FailureKind::Malformed => "malformed",
            FailureKind::Unavailable => "unavailable",
        };
        f.write_str(s)
    }
}

/// Structured escalation history, handed to the next tier's prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub tier: String,
    pub attempt: u32,
    pub kind: FailureKind,
    pub detail: String,
}

impl FailureRecord {
    pub fn new(tier: &str, attempt: u32, kind: FailureKind, detail: impl Into<String>) -> Self {
        Self {
            tier: tier.to_string(),
            attempt,
            kind,
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestCaseResult {
    pub name: String,
    pub passed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestOutcome {
    pub passed: bool,
    pub output: String,
    #[serde(default)]
    pub per_test: Vec<TestCaseResult>,
}

impl TestOutcome {
    pub fn summary(&self) -> String {
        let failed = self.per_test.iter().filter(|t| !t.passed).count();
        if self.per_test.is_empty() {
            return if self.passed { "passed" } else { "failed" }.to_string();
        }
        format!(
            "{} passed, {} failed",
            self.per_test.len() - failed,
            failed
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub step_number: u32,
    pub description: String,
    pub action: ActionType,
    pub files: Vec<String>,
    pub status: StepStatus,
    pub retries: u32,
    pub model_used: Option<String>,
    pub patch: Option<String>,
    pub test_result: Option<TestOutcome>,
    pub review_feedback: Option<String>,
    pub failure_reason: Option<String>,
    pub cost: f64,
    pub tokens_in: u32,
    pub tokens_out: u32,
}

impl Step {
    pub fn new(step_number: u32, description: impl Into<String>) -> Self {
        Self {
            step_number,
            description: description.into(),
            action: ActionType::Other,
            files: Vec::new(),
            status: StepStatus::Pending,
            retries: 0,
            model_used: None,
            patch: None,
            test_result: None,
            review_feedback: None,
            failure_reason: None,
            cost: 0.0,
            tokens_in: 0,
            tokens_out: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: String,
    pub goal: String,
    pub stack: String,
    pub status: RunStatus,
    /// Index into `steps` of the step being worked on.
    pub current_step: usize,
    pub cost_used: f64,
    pub daily_budget: f64,
    pub steps: Vec<Step>,
    pub plan_revision_count: u32,
    pub plan_text: Option<String>,
    pub workspace: Option<PathBuf>,
    pub failure_reason: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Run {
    pub fn new(goal: impl Into<String>, stack: impl Into<String>, daily_budget: f64) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            goal: goal.into(),
            stack: stack.into(),
            status: RunStatus::Pending,
            current_step: 0,
            cost_used: 0.0,
            daily_budget,
            steps: Vec::new(),
            plan_revision_count: 0,
            plan_text: None,
            workspace: None,
            failure_reason: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn remaining_budget(&self) -> f64 {
        (self.daily_budget - self.cost_used).max(0.0)
    }

    pub fn current(&self) -> Option<&Step> {
        self.steps.get(self.current_step)
    }

    pub fn current_mut(&mut self) -> Option<&mut Step> {
        self.steps.get_mut(self.current_step)
    }

    pub fn elapsed(&self) -> Duration {
        let end = self.finished_at.unwrap_or_else(Utc::now);
        (end - self.started_at).to_std().unwrap_or(Duration::ZERO)
    }
}

/// One line of the append-only agent audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConversation {
    pub run_id: String,
    pub step_number: Option<u32>,
    pub agent: AgentRole,
    pub direction: Direction,
    pub payload: String,
    /// Step attempt the exchange belongs to (`retries + 1` at dispatch).
    #[serde(default)]
    pub attempt: Option<u32>,
    #[serde(default)]
    pub tier: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl AgentConversation {
    pub fn new(
        run_id: &str,
        step_number: Option<u32>,
        agent: AgentRole,
        direction: Direction,
        payload: impl Into<String>,
    ) -> Self {
        Self {
            run_id: run_id.to_string(),
            step_number,
            agent,
            direction,
            payload: payload.into(),
            attempt: None,
            tier: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_attempt(mut self, attempt: Option<u32>) -> Self {
        self.attempt = attempt;
        self
    }

    pub fn with_tier(mut self, tier: &str) -> Self {
        self.tier = Some(tier.to_string());
        self
    }
}
