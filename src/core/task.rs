// src/core/task.rs — Tagged router tasks: prompt assembly and response contracts
//
// Each variant owns a constant system prompt (the cacheable prefix), a
// minijinja template for the per-call delta, and the structural check its
// response must pass before the router accepts it.

use minijinja::{context, Environment};
use serde::Deserialize;

use crate::core::patch::extract_patch;
use crate::core::plan::{parse_plan, PlanEntry};
use crate::core::types::{FailureRecord, ReviewDecision, TaskKind, TestOutcome};
use crate::infra::errors::ForgeError;
use crate::util::truncate_str;

/// Only the most recent failures are rendered into a prompt.
const MAX_RENDERED_FAILURES: usize = 3;
const MIN_RESPONSE_CHARS: usize = 10;
const MAX_TEST_OUTPUT_BYTES: usize = 4_000;

const PLANNER_SYSTEM: &str = "You are the planning agent of an automated code-generation pipeline. \
Break the goal into an ordered, numbered list of small steps. Each step must be implementable \
as a single patch and verifiable by the project's tests. Name the files each step touches.";

const DEVELOPER_SYSTEM: &str = "You are the developer agent of an automated code-generation pipeline. \
Implement exactly the requested step. Output one unified diff in git format between a line \
containing BEGIN_PATCH and a line containing END_PATCH. Paths are relative to the workspace root. \
Do not put prose between the markers.";

const REVIEWER_SYSTEM: &str = "You are the reviewer agent of an automated code-generation pipeline. \
Judge whether the patch completes the step, using the test results. Decide one of ACCEPT, RETRY, \
FAIL or ESCALATE_TO_PLANNER and answer with a JSON object \
{\"decision\": \"...\", \"feedback\": \"...\"}.";

const PLAN_TEMPLATE: &str = r#"Goal: {{ goal }}
Stack: {{ stack }}
{% if files %}
Existing files:
{% for f in files %}
- {{ f }}
{% endfor %}
{% endif %}
{% if failure_notes %}
This is plan revision {{ revision }}. The previous plan failed:
{% for note in failure_notes %}
- {{ note }}
{% endfor %}
Produce a revised plan that avoids these failures.
{% endif %}
{% include "failures" %}
Reply with a numbered list of steps."#;

const DEVELOP_TEMPLATE: &str = r#"Goal: {{ goal }}
Stack: {{ stack }}
Step {{ step_number }} of {{ total_steps }}:
{{ instruction }}
{% if files %}
Files involved: {{ files | join(", ") }}
{% endif %}
{% if completed %}
Already completed:
{% for s in completed %}
- {{ s }}
{% endfor %}
{% endif %}
{% if feedback %}
Feedback on the previous attempt:
{{ feedback }}
{% endif %}
{% include "failures" %}
Respond with the patch between BEGIN_PATCH and END_PATCH."#;

const REVIEW_TEMPLATE: &str = r#"Step {{ step_number }}: {{ instruction }}
Attempt {{ attempt }} of {{ max_attempts }}.

Patch:
{{ patch }}

Tests {{ "passed" if tests_passed else "failed" }} ({{ test_summary }}):
{{ test_output }}
{% include "failures" %}
Answer with JSON only."#;

const FAILURES_PARTIAL: &str = r#"{% if failures %}
Earlier responses to this request were rejected:
{% for f in failures %}
- {{ f.tier }} attempt {{ f.attempt }}: {{ f.kind }} ({{ f.detail }})
{% endfor %}
{% endif %}"#;

#[derive(Debug, Clone)]
pub struct PlanContext {
    pub goal: String,
    pub stack: String,
    pub existing_files: Vec<String>,
    pub revision: u32,
    /// Accumulated reasons earlier plans failed.
    pub failure_notes: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct DevelopContext {
    pub goal: String,
    pub stack: String,
    pub step_number: u32,
    pub total_steps: usize,
    pub instruction: String,
    pub files: Vec<String>,
    pub completed: Vec<String>,
    pub feedback: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ReviewContext {
    pub step_number: u32,
    pub instruction: String,
    pub patch: String,
    pub tests: TestOutcome,
    pub attempt: u32,
    pub max_attempts: u32,
}

#[derive(Debug, Clone)]
pub enum Task {
    Plan(PlanContext),
    Develop(DevelopContext),
    Review(ReviewContext),
}

/// A response that passed its task's structural contract.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutput {
    Plan(Vec<PlanEntry>),
    Patch(String),
    Review {
        decision: ReviewDecision,
        feedback: String,
    },
}

impl Task {
    pub fn kind(&self) -> TaskKind {
        match self {
            Task::Plan(_) => TaskKind::Plan,
            Task::Develop(_) => TaskKind::Develop,
            Task::Review(_) => TaskKind::Review,
        }
    }

    pub fn system_prompt(&self) -> &'static str {
        match self {
            Task::Plan(_) => PLANNER_SYSTEM,
            Task::Develop(_) => DEVELOPER_SYSTEM,
            Task::Review(_) => REVIEWER_SYSTEM,
        }
    }

    /// Render the per-call user message, including recent escalation history.
    pub fn render_user(&self, failures: &[FailureRecord]) -> Result<String, ForgeError> {
        let recent = &failures[failures.len().saturating_sub(MAX_RENDERED_FAILURES)..];

        let mut env = Environment::new();
        env.set_trim_blocks(true);
        env.set_lstrip_blocks(true);
        env.add_template("failures", FAILURES_PARTIAL)?;

        let rendered = match self {
            Task::Plan(ctx) => env.render_str(
                PLAN_TEMPLATE,
                context! {
                    goal => ctx.goal,
                    stack => ctx.stack,
                    files => ctx.existing_files,
                    revision => ctx.revision,
                    failure_notes => ctx.failure_notes,
                    failures => recent,
                },
            )?,
            Task::Develop(ctx) => env.render_str(
                DEVELOP_TEMPLATE,
                context! {
                    goal => ctx.goal,
                    stack => ctx.stack,
                    step_number => ctx.step_number,
                    total_steps => ctx.total_steps,
                    instruction => ctx.instruction,
                    files => ctx.files,
                    completed => ctx.completed,
                    feedback => ctx.feedback,
                    failures => recent,
                },
            )?,
            Task::Review(ctx) => env.render_str(
                REVIEW_TEMPLATE,
                context! {
                    step_number => ctx.step_number,
                    instruction => ctx.instruction,
                    attempt => ctx.attempt,
                    max_attempts => ctx.max_attempts,
                    patch => ctx.patch,
                    tests_passed => ctx.tests.passed,
                    test_summary => ctx.tests.summary(),
                    test_output => tail(&ctx.tests.output, MAX_TEST_OUTPUT_BYTES),
                    failures => recent,
                },
            )?,
        };
        Ok(rendered.trim().to_string())
    }

    /// Structural contract for this task's response.
    pub fn validate(&self, text: &str) -> Result<TaskOutput, String> {
        if text.trim().chars().count() < MIN_RESPONSE_CHARS {
            return Err("response too short".into());
        }
        match self {
            Task::Plan(_) => parse_plan(text)
                .map(TaskOutput::Plan)
                .map_err(|e| e.to_string()),
            Task::Develop(_) => extract_patch(text)
                .map(TaskOutput::Patch)
                .ok_or_else(|| "response does not contain a patch".to_string()),
            Task::Review(_) => parse_review(text)
                .map(|(decision, feedback)| TaskOutput::Review { decision, feedback })
                .ok_or_else(|| "response names no review decision".to_string()),
        }
    }
}

/// Keep the end of long test logs; failures are reported last.
fn tail(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut start = s.len() - max_bytes;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    &s[start..]
}

#[derive(Deserialize)]
struct ReviewJson {
    decision: String,
    #[serde(default)]
    feedback: String,
    #[serde(default)]
    suggestions: Vec<String>,
}

/// JSON first, then a `decision:` line, then the first bare keyword.
pub fn parse_review(text: &str) -> Option<(ReviewDecision, String)> {
    if let (Some(start), Some(end)) = (text.find('{'), text.rfind('}')) {
        if start < end {
            if let Ok(json) = serde_json::from_str::<ReviewJson>(&text[start..=end]) {
                if let Some(decision) = ReviewDecision::parse(&json.decision) {
                    let mut feedback = json.feedback;
                    for s in json.suggestions {
                        feedback.push_str("\n- ");
                        feedback.push_str(&s);
                    }
                    return Some((decision, feedback.trim().to_string()));
                }
            }
        }
    }

    let feedback = || truncate_str(text.trim(), 2_000).to_string();

    for line in text.lines() {
        let lower = line.trim().to_lowercase();
        if let Some(rest) = lower.strip_prefix("decision") {
            let value = rest.trim_start_matches([':', ' ', '*', '=']);
            let word = value.split_whitespace().next().unwrap_or("");
            if let Some(decision) = ReviewDecision::parse(word.trim_matches(['"', '.', ','])) {
                return Some((decision, feedback()));
            }
        }
    }

    let upper = text.to_uppercase();
    [
        ("ESCALATE_TO_PLANNER", ReviewDecision::EscalateToPlanner),
        ("ACCEPT", ReviewDecision::Accept),
        ("RETRY", ReviewDecision::Retry),
        ("FAIL", ReviewDecision::Fail),
    ]
    .iter()
    .filter_map(|(word, decision)| upper.find(word).map(|pos| (pos, *decision)))
    .min_by_key(|(pos, _)| *pos)
    .map(|(_, decision)| (decision, feedback()))
}
