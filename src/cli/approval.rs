// src/cli/approval.rs — Interactive approval prompts

use async_trait::async_trait;

use crate::core::approval::ApprovalGate;
use crate::core::types::{Run, Step};
use crate::util::truncate_str;

/// Asks on the terminal. A cancelled or failed prompt counts as a rejection.
#[derive(Debug, Default, Clone, Copy)]
pub struct TerminalApproval;

impl TerminalApproval {
    async fn confirm(question: String, help: String) -> bool {
        tokio::task::spawn_blocking(move || {
            inquire::Confirm::new(&question)
                .with_default(true)
                .with_help_message(&help)
                .prompt()
                .unwrap_or(false)
        })
        .await
        .unwrap_or(false)
    }
}

#[async_trait]
impl ApprovalGate for TerminalApproval {
    async fn approve_plan(&self, run: &Run) -> bool {
        eprintln!();
        eprintln!("Plan for: {}", run.goal);
        for step in &run.steps {
            eprintln!("  {}. {}", step.step_number, first_line(&step.description));
        }
        eprintln!();
        Self::confirm(
            "Execute this plan?".into(),
            "Rejecting asks the planner for a revised plan".into(),
        )
        .await
    }

    async fn approve_step(&self, _run: &Run, step: &Step) -> bool {
        eprintln!();
        eprintln!("Step {} accepted by reviewer: {}", step.step_number, first_line(&step.description));
        if let Some(ref patch) = step.patch {
            eprintln!("{}", truncate_str(patch, 2000));
        }
        if let Some(ref feedback) = step.review_feedback {
            eprintln!("Reviewer: {feedback}");
        }
        Self::confirm(
            format!("Keep step {}?", step.step_number),
            "Rejecting retries the step".into(),
        )
        .await
    }
}

fn first_line(s: &str) -> &str {
    s.lines().next().unwrap_or("")
}
