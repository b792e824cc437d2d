// tests/engine_test.rs — Integration test: execution loop over fake agents and tools

mod common;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use agentforge::core::approval::ApprovalGate;
use agentforge::core::cancel::CancelSignal;
use agentforge::core::engine::ExecutionLoop;
use agentforge::core::types::{
    AgentConversation, AgentRole, Direction, Run, RunStatus, Step, StepStatus,
};
use agentforge::infra::config::ExecutionConfig;
use agentforge::infra::errors::ForgeError;
use agentforge::provider::tiers::{ModelTier, TierRegistry};
use agentforge::store::RunStore;
use agentforge::workspace::{check_artifacts, ArtifactReport, ProjectManager};

use common::*;

#[tokio::test]
async fn test_happy_path_persists_run_and_conversation_log() {
    let dir = tempfile::tempdir().unwrap();
    let store = store();
    let client = RoleClient::new(&[PATCH], &[ACCEPT]);
    let tools = FakeTools::passing();
    let engine = engine(client.clone(), tools.clone(), dir.path(), ExecutionConfig::default())
        .with_store(store.clone());

    let run = Run::new("hello api", "python", 1.0);
    let run_id = run.id.clone();
    let summary = engine.execute(run, CancelSignal::new()).await.unwrap();

    assert_eq!(summary.status, RunStatus::Completed);
    assert_eq!(summary.steps_total, 2);
    assert_eq!(summary.steps_completed, 2);
    assert!(summary.failure_reason.is_none());
    assert!(summary.artifacts.as_ref().unwrap().is_satisfied());
    assert_eq!(tools.applied_count(), 2);
    assert_eq!(client.planner_calls(), 1);
    assert_eq!(client.developer_calls(), 2);
    assert_eq!(client.reviewer_calls(), 2);

    let persisted = store.load_run(&run_id).unwrap().unwrap();
    assert_eq!(persisted.status, RunStatus::Completed);
    assert!(persisted.finished_at.is_some());
    assert!(persisted
        .steps
        .iter()
        .all(|s| s.status == StepStatus::Completed));

    // One request/response pair per routed task: plan, then develop+review per step.
    let log = store.conversations(&run_id).unwrap();
    assert_eq!(log.len(), 10);
    let agents: Vec<AgentRole> = log
        .iter()
        .filter(|c| c.direction == Direction::Response)
        .map(|c| c.agent)
        .collect();
    assert_eq!(
        agents,
        vec![
            AgentRole::Planner,
            AgentRole::Developer,
            AgentRole::Reviewer,
            AgentRole::Developer,
            AgentRole::Reviewer,
        ]
    );
    assert_eq!(log[0].direction, Direction::Request);
    assert_eq!(log[2].step_number, Some(1));
}

#[tokio::test]
async fn test_malformed_patch_exhausts_step_retries() {
    let dir = tempfile::tempdir().unwrap();
    let store = store();
    let client = RoleClient::new(&[BROKEN_PATCH], &[ACCEPT]);
    let tools = FakeTools::passing();
    let config = ExecutionConfig {
        max_retries_per_step: 2,
        max_plan_revisions: 0,
        ..ExecutionConfig::default()
    };
    let engine = engine(client.clone(), tools.clone(), dir.path(), config).with_store(store.clone());

    let run = Run::new("hello api", "python", 1.0);
    let run_id = run.id.clone();
    let summary = engine.execute(run, CancelSignal::new()).await.unwrap();

    assert_eq!(summary.status, RunStatus::Failed);
    assert_eq!(summary.failure_reason.as_deref(), Some("step exhausted retries"));
    assert_eq!(client.developer_calls(), 2);
    // A malformed patch never reaches the workspace or the reviewer.
    assert_eq!(client.reviewer_calls(), 0);
    assert_eq!(tools.applied_count(), 0);

    let persisted = store.load_run(&run_id).unwrap().unwrap();
    let step = &persisted.steps[0];
    assert_eq!(step.status, StepStatus::Failed);
    assert!(step
        .review_feedback
        .as_deref()
        .unwrap()
        .starts_with("Patch rejected"));
    assert_eq!(persisted.steps[1].status, StepStatus::Pending);
}

#[tokio::test]
async fn test_escalation_to_planner_replans() {
    let dir = tempfile::tempdir().unwrap();
    let client = RoleClient::build(&[PLAN], &[PATCH], &[ESCALATE, ACCEPT]);
    let engine = engine(
        client.clone(),
        FakeTools::passing(),
        dir.path(),
        ExecutionConfig::default(),
    );

    let summary = engine
        .execute(Run::new("hello api", "python", 1.0), CancelSignal::new())
        .await
        .unwrap();

    assert_eq!(summary.status, RunStatus::Completed);
    assert_eq!(client.planner_calls(), 2);
    let requests = client.planner_requests();
    assert!(!requests[0].contains("previous plan failed"));
    assert!(requests[1].contains("previous plan failed"));
    assert!(requests[1].contains("the plan misses a database"));
}

#[tokio::test]
async fn test_plan_rejection_fails_after_revisions() {
    struct RejectPlans;

    #[async_trait]
    impl ApprovalGate for RejectPlans {
        async fn approve_plan(&self, _run: &Run) -> bool {
            false
        }
        async fn approve_step(&self, _run: &Run, _step: &Step) -> bool {
            true
        }
    }

    let dir = tempfile::tempdir().unwrap();
    let client = RoleClient::new(&[PATCH], &[ACCEPT]);
    let config = ExecutionConfig {
        require_plan_approval: true,
        max_plan_revisions: 1,
        ..ExecutionConfig::default()
    };
    let engine = engine(client.clone(), FakeTools::passing(), dir.path(), config)
        .with_approvals(Arc::new(RejectPlans));

    let summary = engine
        .execute(Run::new("g", "python", 1.0), CancelSignal::new())
        .await
        .unwrap();

    assert_eq!(summary.status, RunStatus::Failed);
    assert_eq!(summary.failure_reason.as_deref(), Some("plan rejected"));
    assert_eq!(client.planner_calls(), 2);
    assert_eq!(client.developer_calls(), 0);
}

#[tokio::test]
async fn test_cancel_before_start_makes_no_calls() {
    let dir = tempfile::tempdir().unwrap();
    let client = RoleClient::new(&[PATCH], &[ACCEPT]);
    let engine = engine(
        client.clone(),
        FakeTools::passing(),
        dir.path(),
        ExecutionConfig::default(),
    );
    let cancel = CancelSignal::new();
    cancel.cancel();

    let summary = engine
        .execute(Run::new("g", "python", 1.0), cancel)
        .await
        .unwrap();
    assert_eq!(summary.status, RunStatus::Cancelled);
    assert_eq!(client.planner_calls(), 0);
}

#[tokio::test]
async fn test_cancel_mid_step_stops_before_review() {
    let dir = tempfile::tempdir().unwrap();
    let client = RoleClient::new(&[PATCH], &[ACCEPT]);
    let cancel = CancelSignal::new();
    client.cancel_on_develop(cancel.clone());
    let engine = engine(
        client.clone(),
        FakeTools::passing(),
        dir.path(),
        ExecutionConfig::default(),
    );

    let summary = engine
        .execute(Run::new("g", "python", 1.0), cancel)
        .await
        .unwrap();

    assert_eq!(summary.status, RunStatus::Cancelled);
    assert_eq!(summary.failure_reason.as_deref(), Some("cancelled by user"));
    assert_eq!(client.developer_calls(), 1);
    assert_eq!(client.reviewer_calls(), 0);
}

#[tokio::test]
async fn test_deadline_fails_run() {
    let dir = tempfile::tempdir().unwrap();
    let client = RoleClient::new(&[PATCH], &[ACCEPT]);
    let config = ExecutionConfig {
        timeout_seconds: 0,
        ..ExecutionConfig::default()
    };
    let engine = engine(client.clone(), FakeTools::passing(), dir.path(), config);

    let summary = engine
        .execute(Run::new("g", "python", 1.0), CancelSignal::new())
        .await
        .unwrap();
    assert_eq!(summary.status, RunStatus::Failed);
    assert_eq!(
        summary.failure_reason.as_deref(),
        Some("execution timeout exceeded")
    );
    assert_eq!(client.planner_calls(), 0);
}

#[tokio::test]
async fn test_budget_exhaustion_fails_without_dispatch() {
    let dir = tempfile::tempdir().unwrap();
    let client = RoleClient::new(&[PATCH], &[ACCEPT]);
    let tiers = TierRegistry::new(vec![ModelTier::new(0, "standard", "big", client.clone())
        .with_pricing(1000.0, 1000.0)]);
    let engine = ExecutionLoop::new(
        router(tiers),
        FakeTools::passing(),
        TempProjects::new(dir.path()),
        ExecutionConfig::default(),
    );

    let summary = engine
        .execute(Run::new("g", "python", 0.01), CancelSignal::new())
        .await
        .unwrap();
    assert_eq!(summary.status, RunStatus::Failed);
    assert_eq!(summary.failure_reason.as_deref(), Some("budget exceeded"));
    assert_eq!(client.planner_calls(), 0);
    assert_eq!(summary.total_cost, 0.0);
}

#[tokio::test]
async fn test_resume_applies_logged_review() {
    let dir = tempfile::tempdir().unwrap();
    let store = store();

    // A run interrupted after the reviewer answered for step 1.
    let mut run = Run::new("hello api", "python", 1.0);
    run.status = RunStatus::Executing;
    run.workspace = Some(dir.path().join("resumed"));
    let mut first = Step::new(1, "Create main.py with a hello endpoint");
    first.status = StepStatus::Running;
    run.steps = vec![first, Step::new(2, "Add requirements.txt")];
    store.save_run(&run).unwrap();
    store
        .append_conversation(
            &AgentConversation::new(
                &run.id,
                Some(1),
                AgentRole::Reviewer,
                Direction::Response,
                ACCEPT,
            )
            .with_attempt(Some(1)),
        )
        .unwrap();

    let client = RoleClient::new(&[PATCH], &[ACCEPT]);
    let engine = engine(
        client.clone(),
        FakeTools::passing(),
        dir.path(),
        ExecutionConfig::default(),
    )
    .with_store(store.clone());

    let summary = engine.resume(&run.id, CancelSignal::new()).await.unwrap();
    assert_eq!(summary.status, RunStatus::Completed);
    assert_eq!(client.planner_calls(), 0);
    // Only step 2 is developed; step 1's verdict came from the log.
    assert_eq!(client.developer_calls(), 1);
    assert_eq!(client.reviewer_calls(), 1);

    let persisted = store.load_run(&run.id).unwrap().unwrap();
    assert_eq!(persisted.status, RunStatus::Completed);
}

#[tokio::test]
async fn test_resume_rejects_finished_run() {
    let dir = tempfile::tempdir().unwrap();
    let store = store();
    let mut run = Run::new("g", "python", 1.0);
    run.status = RunStatus::Completed;
    store.save_run(&run).unwrap();

    let client = RoleClient::new(&[PATCH], &[ACCEPT]);
    let engine = engine(client, FakeTools::passing(), dir.path(), ExecutionConfig::default())
        .with_store(store);
    assert!(engine.resume(&run.id, CancelSignal::new()).await.is_err());
}

/// Workspaces whose package manager always blows up.
struct BrokenInstaller {
    root: PathBuf,
    installs: AtomicU32,
}

#[async_trait]
impl ProjectManager for BrokenInstaller {
    async fn create_workspace(&self, run_id: &str, _stack: &str) -> Result<PathBuf, ForgeError> {
        let dir = self.root.join(run_id);
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    async fn install_dependencies(&self, _workspace: &Path, _stack: &str) -> Result<(), ForgeError> {
        self.installs.fetch_add(1, Ordering::SeqCst);
        Err(ForgeError::Config("pip exploded".into()))
    }

    fn verify_artifacts(&self, workspace: &Path, stack: &str) -> ArtifactReport {
        check_artifacts(workspace, stack)
    }

    fn list_files(&self, _workspace: &Path) -> Vec<String> {
        Vec::new()
    }
}

#[tokio::test]
async fn test_failed_dependency_install_is_not_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let client = RoleClient::new(&[PATCH], &[ACCEPT]);
    let projects = Arc::new(BrokenInstaller {
        root: dir.path().to_path_buf(),
        installs: AtomicU32::new(0),
    });
    let engine = ExecutionLoop::new(
        router(single_tier(client.clone())),
        FakeTools::passing(),
        projects.clone(),
        ExecutionConfig::default(),
    );

    let summary = engine
        .execute(Run::new("hello api", "python", 1.0), CancelSignal::new())
        .await
        .unwrap();

    assert_eq!(summary.status, RunStatus::Completed);
    // The patch touches requirements.txt on both steps.
    assert_eq!(projects.installs.load(Ordering::SeqCst), 2);
    assert_eq!(client.reviewer_calls(), 2);
}

#[tokio::test]
async fn test_rejected_tier_attempts_are_logged() {
    let dir = tempfile::tempdir().unwrap();
    let store = store();
    let client = RoleClient::new(&["Sure, I would add a main.py with a route.", PATCH], &[ACCEPT]);
    let engine = engine(
        client.clone(),
        FakeTools::passing(),
        dir.path(),
        ExecutionConfig::default(),
    )
    .with_store(store.clone());

    let run = Run::new("hello api", "python", 1.0);
    let run_id = run.id.clone();
    let summary = engine.execute(run, CancelSignal::new()).await.unwrap();
    assert_eq!(summary.status, RunStatus::Completed);
    assert_eq!(client.developer_calls(), 3);

    let log = store.conversations(&run_id).unwrap();
    let developer: Vec<&AgentConversation> = log
        .iter()
        .filter(|c| c.agent == AgentRole::Developer)
        .collect();
    assert_eq!(developer.len(), 6);
    let responses: Vec<&str> = developer
        .iter()
        .filter(|c| c.direction == Direction::Response)
        .map(|c| c.payload.as_str())
        .collect();
    assert_eq!(responses.len(), 3);
    assert!(responses[0].starts_with("Sure, I would add"));
    assert!(developer
        .iter()
        .all(|c| c.tier.as_deref() == Some("local") && c.attempt == Some(1)));
}

#[tokio::test]
async fn test_resume_ignores_verdict_from_earlier_attempt() {
    let dir = tempfile::tempdir().unwrap();
    let store = store();

    // RETRY for attempt 1 was applied, then attempt 2 died mid-develop.
    let mut run = Run::new("hello api", "python", 1.0);
    run.status = RunStatus::Executing;
    run.workspace = Some(dir.path().join("resumed"));
    let mut first = Step::new(1, "Create main.py with a hello endpoint");
    first.status = StepStatus::Running;
    first.retries = 1;
    run.steps = vec![first, Step::new(2, "Add requirements.txt")];
    store.save_run(&run).unwrap();
    store
        .append_conversation(
            &AgentConversation::new(
                &run.id,
                Some(1),
                AgentRole::Reviewer,
                Direction::Response,
                r#"{"decision": "RETRY", "feedback": "missing route"}"#,
            )
            .with_attempt(Some(1)),
        )
        .unwrap();

    let client = RoleClient::new(&[PATCH], &[ACCEPT]);
    let config = ExecutionConfig {
        max_retries_per_step: 2,
        max_plan_revisions: 0,
        ..ExecutionConfig::default()
    };
    let engine = engine(client.clone(), FakeTools::passing(), dir.path(), config)
        .with_store(store.clone());

    let summary = engine.resume(&run.id, CancelSignal::new()).await.unwrap();
    // Replaying the old RETRY would have exhausted step 1.
    assert_eq!(summary.status, RunStatus::Completed);
    assert_eq!(client.developer_calls(), 2);

    let persisted = store.load_run(&run.id).unwrap().unwrap();
    assert_eq!(persisted.steps[0].retries, 1);
}
