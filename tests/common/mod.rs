// tests/common/mod.rs — Shared fakes for integration tests
#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use agentforge::core::budget::DailyLedger;
use agentforge::core::cache::PromptCache;
use agentforge::core::cancel::CancelSignal;
use agentforge::core::engine::ExecutionLoop;
use agentforge::core::patch::changed_files;
use agentforge::core::router::LlmRouter;
use agentforge::core::types::TestOutcome;
use agentforge::infra::config::ExecutionConfig;
use agentforge::infra::errors::{ForgeError, ProviderError};
use agentforge::provider::retry::BackoffPolicy;
use agentforge::provider::tiers::{ModelTier, TierRegistry};
use agentforge::provider::{PromptPayload, ProviderClient, ProviderResponse, TokenUsage};
use agentforge::store::SqliteStore;
use agentforge::workspace::{check_artifacts, ArtifactReport, ProjectManager};

pub const PLAN: &str = "1. Create main.py with a hello endpoint\n2. Add requirements.txt";
pub const PATCH: &str = "BEGIN_PATCH
--- /dev/null
+++ b/main.py
@@ -0,0 +1 @@
+print('hi')
--- /dev/null
+++ b/requirements.txt
@@ -0,0 +1 @@
+flask
END_PATCH";
pub const BROKEN_PATCH: &str = "BEGIN_PATCH\nthis is not a diff at all\nEND_PATCH";
pub const ACCEPT: &str = r#"{"decision": "ACCEPT", "feedback": "looks good"}"#;
pub const ESCALATE: &str =
    r#"{"decision": "ESCALATE_TO_PLANNER", "feedback": "the plan misses a database"}"#;

pub fn usage(input: u32, output: u32) -> TokenUsage {
    TokenUsage {
        input_tokens: input,
        output_tokens: output,
        ..Default::default()
    }
}

// ─── Providers ──────────────────────────────────────────────────────────────

/// Pops one reply per call; an empty script answers with unusable text.
pub struct ScriptedClient {
    replies: Mutex<VecDeque<Result<String, ProviderError>>>,
    usage: TokenUsage,
    calls: AtomicU32,
    payloads: Mutex<Vec<PromptPayload>>,
}

impl ScriptedClient {
    pub fn new(replies: Vec<Result<&str, ProviderError>>) -> Arc<Self> {
        Self::with_usage(replies, usage(1000, 500))
    }

    pub fn with_usage(replies: Vec<Result<&str, ProviderError>>, usage: TokenUsage) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(
                replies
                    .into_iter()
                    .map(|r| r.map(str::to_string))
                    .collect(),
            ),
            usage,
            calls: AtomicU32::new(0),
            payloads: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn payloads(&self) -> Vec<PromptPayload> {
        self.payloads.lock().unwrap().clone()
    }
}

#[async_trait]
impl ProviderClient for ScriptedClient {
    fn id(&self) -> &str {
        "scripted"
    }

    async fn invoke(
        &self,
        payload: &PromptPayload,
        _timeout: Duration,
    ) -> Result<ProviderResponse, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.payloads.lock().unwrap().push(payload.clone());
        let next = self
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok("nothing useful here".into()));
        next.map(|text| ProviderResponse {
            text,
            usage: self.usage.clone(),
        })
    }
}

/// Answers by agent, keyed on the system prompt. Each role pops from its own
/// queue and repeats the last reply once the queue is down to one.
pub struct RoleClient {
    planner: Mutex<VecDeque<String>>,
    developer: Mutex<VecDeque<String>>,
    reviewer: Mutex<VecDeque<String>>,
    usage: TokenUsage,
    pub planner_calls: AtomicU32,
    pub developer_calls: AtomicU32,
    pub reviewer_calls: AtomicU32,
    planner_requests: Mutex<Vec<String>>,
    /// Fired when the developer is first invoked.
    cancel_on_develop: Mutex<Option<CancelSignal>>,
}

impl RoleClient {
    pub fn new(developer: &[&str], reviewer: &[&str]) -> Arc<Self> {
        Self::build(&[PLAN], developer, reviewer)
    }

    pub fn build(planner: &[&str], developer: &[&str], reviewer: &[&str]) -> Arc<Self> {
        let queue = |items: &[&str]| -> Mutex<VecDeque<String>> {
            Mutex::new(items.iter().map(|s| s.to_string()).collect())
        };
        Arc::new(Self {
            planner: queue(planner),
            developer: queue(developer),
            reviewer: queue(reviewer),
            usage: usage(1000, 500),
            planner_calls: AtomicU32::new(0),
            developer_calls: AtomicU32::new(0),
            reviewer_calls: AtomicU32::new(0),
            planner_requests: Mutex::new(Vec::new()),
            cancel_on_develop: Mutex::new(None),
        })
    }

    pub fn cancel_on_develop(&self, signal: CancelSignal) {
        *self.cancel_on_develop.lock().unwrap() = Some(signal);
    }

    pub fn planner_calls(&self) -> u32 {
        self.planner_calls.load(Ordering::SeqCst)
    }

    pub fn developer_calls(&self) -> u32 {
        self.developer_calls.load(Ordering::SeqCst)
    }

    pub fn reviewer_calls(&self) -> u32 {
        self.reviewer_calls.load(Ordering::SeqCst)
    }

    pub fn planner_requests(&self) -> Vec<String> {
        self.planner_requests.lock().unwrap().clone()
    }

    fn next(queue: &Mutex<VecDeque<String>>) -> String {
        let mut q = queue.lock().unwrap();
        if q.len() > 1 {
            q.pop_front().unwrap_or_default()
        } else {
            q.front().cloned().unwrap_or_default()
        }
    }
}

#[async_trait]
impl ProviderClient for RoleClient {
    fn id(&self) -> &str {
        "by-role"
    }

    async fn invoke(
        &self,
        payload: &PromptPayload,
        _timeout: Duration,
    ) -> Result<ProviderResponse, ProviderError> {
        let text = if payload.system.contains("planning agent") {
            self.planner_calls.fetch_add(1, Ordering::SeqCst);
            let request = payload
                .messages
                .last()
                .map(|m| m.content.clone())
                .unwrap_or_default();
            self.planner_requests.lock().unwrap().push(request);
            Self::next(&self.planner)
        } else if payload.system.contains("reviewer agent") {
            self.reviewer_calls.fetch_add(1, Ordering::SeqCst);
            Self::next(&self.reviewer)
        } else {
            self.developer_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(signal) = self.cancel_on_develop.lock().unwrap().take() {
                signal.cancel();
            }
            Self::next(&self.developer)
        };
        Ok(ProviderResponse {
            text,
            usage: self.usage.clone(),
        })
    }
}

// ─── Tools and workspaces ───────────────────────────────────────────────────

/// Records applied patches; tests always report `tests_pass`.
pub struct FakeTools {
    pub tests_pass: bool,
    pub applied: Mutex<Vec<String>>,
    pub test_runs: AtomicU32,
}

impl FakeTools {
    pub fn passing() -> Arc<Self> {
        Arc::new(Self {
            tests_pass: true,
            applied: Mutex::new(Vec::new()),
            test_runs: AtomicU32::new(0),
        })
    }

    pub fn applied_count(&self) -> usize {
        self.applied.lock().unwrap().len()
    }
}

#[async_trait]
impl agentforge::tools::ToolManager for FakeTools {
    async fn apply_patch(&self, workspace: &Path, patch: &str) -> Result<Vec<String>, ForgeError> {
        let files = changed_files(patch);
        for f in &files {
            let path = workspace.join(f);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, "generated\n")?;
        }
        self.applied.lock().unwrap().push(patch.to_string());
        Ok(files)
    }

    async fn run_tests(&self, _workspace: &Path, _stack: &str) -> Result<TestOutcome, ForgeError> {
        self.test_runs.fetch_add(1, Ordering::SeqCst);
        Ok(TestOutcome {
            passed: self.tests_pass,
            output: if self.tests_pass {
                "1 passed".into()
            } else {
                "1 failed".into()
            },
            per_test: Vec::new(),
        })
    }
}

/// Workspaces under one temp root. Artifacts are checked for real.
pub struct TempProjects {
    root: PathBuf,
}

impl TempProjects {
    pub fn new(root: &Path) -> Arc<Self> {
        Arc::new(Self {
            root: root.to_path_buf(),
        })
    }
}

#[async_trait]
impl ProjectManager for TempProjects {
    async fn create_workspace(&self, run_id: &str, _stack: &str) -> Result<PathBuf, ForgeError> {
        let dir = self.root.join(run_id);
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    async fn install_dependencies(&self, _workspace: &Path, _stack: &str) -> Result<(), ForgeError> {
        Ok(())
    }

    fn verify_artifacts(&self, workspace: &Path, stack: &str) -> ArtifactReport {
        check_artifacts(workspace, stack)
    }

    fn list_files(&self, _workspace: &Path) -> Vec<String> {
        Vec::new()
    }
}

// ─── Assembly ───────────────────────────────────────────────────────────────

pub fn single_tier(client: Arc<dyn ProviderClient>) -> TierRegistry {
    TierRegistry::new(vec![ModelTier::new(0, "local", "local-model", client).with_attempts(2)])
}

pub fn router(tiers: TierRegistry) -> LlmRouter {
    LlmRouter::new(
        tiers,
        Arc::new(PromptCache::new(Duration::from_secs(3600), 100)),
        DailyLedger::new(100.0),
    )
    .with_backoff(BackoffPolicy::immediate())
}

pub fn engine(
    client: Arc<dyn ProviderClient>,
    tools: Arc<FakeTools>,
    root: &Path,
    config: ExecutionConfig,
) -> ExecutionLoop {
    ExecutionLoop::new(
        router(single_tier(client)),
        tools,
        TempProjects::new(root),
        config,
    )
}

pub fn store() -> Arc<SqliteStore> {
    Arc::new(SqliteStore::in_memory().expect("in-memory store"))
}
