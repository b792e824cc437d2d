// src/cli/progress.rs — Terminal progress renderer for live run feedback

use crate::core::engine::ProgressEvent;

/// Build a progress callback that writes formatted output to stderr.
///
/// All progress output goes to stderr so stdout remains clean for the summary.
/// Returns a closure suitable for `ExecutionLoop::with_progress()`.
pub fn terminal_progress() -> impl Fn(ProgressEvent) + Send + Sync + 'static {
    move |event| eprintln!("{}", format_event(&event))
}

pub fn format_event(event: &ProgressEvent) -> String {
    match event {
        ProgressEvent::PlanReady { steps, revision: 0 } => format!("[plan] {steps} step(s)"),
        ProgressEvent::PlanReady { steps, revision } => {
            format!("[plan] revision {revision}: {steps} step(s)")
        }
        ProgressEvent::StepStart {
            step,
            total,
            attempt,
        } => {
            if *attempt > 1 {
                format!("[step {step}/{total}] developing (attempt {attempt})...")
            } else {
                format!("[step {step}/{total}] developing...")
            }
        }
        ProgressEvent::StepEnd {
            step,
            decision,
            tier,
            cost_so_far,
        } => format!(
            "[step {step}] -> {:<20} via {} ({cost_so_far:.4} spent)",
            decision.as_str(),
            tier.as_deref().unwrap_or("-"),
        ),
        ProgressEvent::Retry { step, retries } => format!("[step {step}] retry #{retries}"),
        ProgressEvent::Replan { revision, reason } => {
            format!("[replan] revision {revision}: {reason}")
        }
        ProgressEvent::Finished {
            status,
            steps_executed,
            cost,
            elapsed,
        } => format!(
            "[done] {status} steps={steps_executed} cost={cost:.4} elapsed={:.1}s",
            elapsed.as_secs_f64()
        ),
    }
}
