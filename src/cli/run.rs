// src/cli/run.rs — `run` and `resume`: wire the stack and drive one run

use std::path::PathBuf;
use std::sync::Arc;

use crate::cli::approval::TerminalApproval;
use crate::cli::progress::terminal_progress;
use crate::core::budget::DailyLedger;
use crate::core::cache::PromptCache;
use crate::core::cancel::CancelSignal;
use crate::core::engine::{ExecutionLoop, RunSummary};
use crate::core::router::LlmRouter;
use crate::core::types::Run;
use crate::infra::config::Config;
use crate::infra::paths;
use crate::provider::tiers::TierRegistry;
use crate::store::{RunStore, SqliteStore};
use crate::tools::GitToolManager;
use crate::workspace::LocalProjectManager;

/// Flags of `agentforge run` that shape a single run.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub budget: Option<f64>,
    pub approve_plan: bool,
    pub approve_steps: bool,
    pub workspace: Option<PathBuf>,
    pub json: bool,
    pub quiet: bool,
}

/// Everything a run needs, assembled from config.
struct Stack {
    engine: ExecutionLoop,
    store: Arc<SqliteStore>,
    cache: Arc<PromptCache>,
}

fn build_stack(config: &Config, quiet: bool) -> anyhow::Result<Stack> {
    let store = Arc::new(SqliteStore::open(&paths::db_path())?);

    let spent = store.spent_today().unwrap_or_else(|e| {
        tracing::warn!("Could not read today's spend: {e}");
        0.0
    });
    let ledger = DailyLedger::with_spent(config.budget.daily_budget, spent);

    let cache = Arc::new(PromptCache::from_config(&config.cache));
    match store.load_cache_entries() {
        Ok(entries) => {
            let restored = cache.restore(entries);
            tracing::debug!("Restored {restored} cache entries");
        }
        Err(e) => tracing::warn!("Prompt cache not restored: {e}"),
    }

    let router = LlmRouter::new(TierRegistry::from_config(config), cache.clone(), ledger)
        .with_config(&config.router);

    let mut engine = ExecutionLoop::new(
        router,
        Arc::new(GitToolManager::new()),
        Arc::new(LocalProjectManager::new(paths::workspaces_dir())),
        config.execution.clone(),
    )
    .with_store(store.clone());

    if config.execution.require_plan_approval || config.execution.require_step_approval {
        engine = engine.with_approvals(Arc::new(TerminalApproval));
    }
    if !quiet {
        engine = engine.with_progress(terminal_progress());
    }

    Ok(Stack {
        engine,
        store,
        cache,
    })
}

/// Cancel the run on Ctrl-C. The loop notices at its next checkpoint.
fn cancel_on_ctrl_c() -> CancelSignal {
    let cancel = CancelSignal::new();
    let signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nCancelling...");
            signal.cancel();
        }
    });
    cancel
}

/// Plan and execute a new goal.
pub async fn run_goal(
    goal: &str,
    stack: &str,
    opts: RunOptions,
    config: &Config,
) -> anyhow::Result<()> {
    let mut config = config.clone();
    if opts.approve_plan {
        config.execution.require_plan_approval = true;
    }
    if opts.approve_steps {
        config.execution.require_step_approval = true;
    }

    paths::ensure_dirs().await?;
    let stack_parts = build_stack(&config, opts.quiet)?;

    let budget = opts.budget.unwrap_or(config.budget.daily_budget);
    let mut run = Run::new(goal, stack, budget);
    run.workspace = opts.workspace;
    if !opts.quiet {
        eprintln!("[run] {} ({stack}, budget {budget:.2})", run.id);
    }

    let result = stack_parts.engine.execute(run, cancel_on_ctrl_c()).await;
    persist_cache(&stack_parts);
    print_summary(&result?, opts.json)
}

/// Continue a run that was interrupted before reaching a terminal state.
pub async fn resume_run(
    run_id: &str,
    json: bool,
    quiet: bool,
    config: &Config,
) -> anyhow::Result<()> {
    paths::ensure_dirs().await?;
    let stack_parts = build_stack(config, quiet)?;
    let result = stack_parts.engine.resume(run_id, cancel_on_ctrl_c()).await;
    persist_cache(&stack_parts);
    print_summary(&result?, json)
}

// Non-fatal: losing the cache only costs tokens on the next run.
fn persist_cache(stack: &Stack) {
    stack.cache.cleanup();
    if let Err(e) = stack.store.save_cache_entries(&stack.cache.snapshot()) {
        tracing::warn!("Failed to persist prompt cache: {e}");
    }
}

fn print_summary(summary: &RunSummary, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(summary)?);
    } else {
        print!("{}", render_summary(summary));
    }
    Ok(())
}

pub fn render_summary(summary: &RunSummary) -> String {
    let mut out = String::new();
    out.push_str(&format!("Run {}: {}\n", summary.run_id, summary.status));
    out.push_str(&format!(
        "  Steps:    {}/{} completed ({} executed)\n",
        summary.steps_completed, summary.steps_total, summary.steps_executed
    ));
    out.push_str(&format!("  Cost:     {:.4}\n", summary.total_cost));
    out.push_str(&format!(
        "  Elapsed:  {:.1}s\n",
        summary.elapsed.as_secs_f64()
    ));
    for tier in &summary.tiers {
        out.push_str(&format!(
            "    {:<10} {:>3} call(s)  {:>8} in / {:>7} out  {:.4}\n",
            tier.tier, tier.calls, tier.input_tokens, tier.output_tokens, tier.cost
        ));
    }
    if let Some(ref artifacts) = summary.artifacts {
        out.push_str(&format!(
            "  Artifacts: {}/{} present",
            artifacts.present.len(),
            artifacts.expected.len()
        ));
        if !artifacts.missing.is_empty() {
            out.push_str(&format!(" (missing: {})", artifacts.missing.join(", ")));
        }
        out.push('\n');
    }
    if let Some(ref dir) = summary.workspace {
        out.push_str(&format!("  Workspace: {}\n", dir.display()));
    }
    if let Some(ref reason) = summary.failure_reason {
        out.push_str(&format!("  Reason:   {reason}\n"));
    }
    out
}
