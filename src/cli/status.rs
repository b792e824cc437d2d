// src/cli/status.rs — `status` and `runs`: inspect persisted runs

use crate::core::types::{AgentConversation, Run};
use crate::infra::paths;
use crate::store::{RunListing, RunStore, SqliteStore};
use crate::util::preview;

fn open_store() -> anyhow::Result<Option<SqliteStore>> {
    let db_path = paths::db_path();
    if !db_path.exists() {
        println!("No runs yet (database not initialized).");
        return Ok(None);
    }
    Ok(Some(SqliteStore::open(&db_path)?))
}

/// Show one run, its steps and its conversation log.
pub async fn show_status(run_id: &str, full: bool) -> anyhow::Result<()> {
    let Some(store) = open_store()? else {
        return Ok(());
    };
    let run = store
        .load_run(run_id)?
        .ok_or_else(|| anyhow::anyhow!("Run '{run_id}' not found"))?;
    let log = store.conversations(run_id)?;
    print!("{}", render_run(&run));
    println!();
    print!("{}", render_conversations(&log, full));
    Ok(())
}

/// List recent runs, newest first.
pub async fn list_runs(limit: usize) -> anyhow::Result<()> {
    let Some(store) = open_store()? else {
        return Ok(());
    };
    let runs = store.list_runs(limit)?;
    if runs.is_empty() {
        println!("No runs yet.");
        return Ok(());
    }
    for listing in &runs {
        println!("{}", render_listing(listing));
    }
    Ok(())
}

pub fn render_run(run: &Run) -> String {
    let mut out = String::new();
    out.push_str(&format!("Run {}\n", run.id));
    out.push_str(&format!("  Goal:      {}\n", run.goal));
    out.push_str(&format!("  Stack:     {}\n", run.stack));
    out.push_str(&format!("  Status:    {}\n", run.status));
    out.push_str(&format!(
        "  Cost:      {:.4} / {:.2}\n",
        run.cost_used, run.daily_budget
    ));
    out.push_str(&format!(
        "  Started:   {}\n",
        run.started_at.format("%Y-%m-%d %H:%M:%S")
    ));
    if let Some(finished) = run.finished_at {
        out.push_str(&format!(
            "  Finished:  {}\n",
            finished.format("%Y-%m-%d %H:%M:%S")
        ));
    }
    if run.plan_revision_count > 0 {
        out.push_str(&format!("  Revisions: {}\n", run.plan_revision_count));
    }
    if let Some(ref dir) = run.workspace {
        out.push_str(&format!("  Workspace: {}\n", dir.display()));
    }
    if let Some(ref reason) = run.failure_reason {
        out.push_str(&format!("  Reason:    {reason}\n"));
    }

    if !run.steps.is_empty() {
        out.push_str("\n  Steps:\n");
    }
    for step in &run.steps {
        out.push_str(&format!(
            "    {:>2}. [{:<9}] {}",
            step.step_number,
            step.status.as_str(),
            preview(&step.description, 60)
        ));
        if step.retries > 0 {
            out.push_str(&format!(" (retries: {})", step.retries));
        }
        if let Some(ref model) = step.model_used {
            out.push_str(&format!(" via {model}"));
        }
        out.push('\n');
        if let Some(ref reason) = step.failure_reason {
            out.push_str(&format!("        {reason}\n"));
        }
    }
    out
}

pub fn render_conversations(log: &[AgentConversation], full: bool) -> String {
    if log.is_empty() {
        return "  (no agent conversations logged)\n".to_string();
    }
    let mut out = format!("  Conversation log ({} entries):\n", log.len());
    for entry in log {
        let mut step = entry
            .step_number
            .map(|n| format!("step {n}"))
            .unwrap_or_else(|| "plan".to_string());
        if let Some(ref tier) = entry.tier {
            step.push_str(&format!(" [{tier}]"));
        }
        out.push_str(&format!(
            "    {} {:<9} {:<8} {:<7}",
            entry.created_at.format("%H:%M:%S"),
            entry.agent.as_str(),
            entry.direction.as_str(),
            step
        ));
        if full {
            out.push('\n');
            for line in entry.payload.lines() {
                out.push_str(&format!("      {line}\n"));
            }
        } else {
            out.push_str(&format!(" {}\n", preview(&entry.payload, 60)));
        }
    }
    out
}

pub fn render_listing(listing: &RunListing) -> String {
    format!(
        "{}  {}  {:<10} {:<22} {:>2} step(s)  {:.4}  {}",
        listing.id,
        listing.started_at.format("%Y-%m-%d %H:%M"),
        listing.stack,
        listing.status.as_str(),
        listing.step_count,
        listing.cost_used,
        preview(&listing.goal, 40),
    )
}
