// src/tools/test_runner.rs — Stack-aware test commands and output parsing
//
// Each stack maps to one test command. Output is parsed into per-test
// results where the runner names its tests; otherwise the exit status
// decides.

use std::path::Path;

use tokio::process::Command;

use crate::core::types::{TestCaseResult, TestOutcome};
use crate::infra::errors::ForgeError;

/// Output kept on a `TestOutcome`; reviewers only need the tail end of a log.
const MAX_OUTPUT_CHARS: usize = 4000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestFramework {
    Pytest,
    Npm,
    Artisan,
    Cargo,
    Go,
}

impl TestFramework {
    pub fn for_stack(stack: &str) -> Option<Self> {
        match stack.to_ascii_lowercase().as_str() {
            "python" | "django" | "flask" | "fastapi" => Some(TestFramework::Pytest),
            "node" | "react" | "vue" | "next" | "express" => Some(TestFramework::Npm),
            "laravel" | "php" => Some(TestFramework::Artisan),
            "rust" => Some(TestFramework::Cargo),
            "go" => Some(TestFramework::Go),
            _ => None,
        }
    }

    pub fn program(self) -> &'static str {
        match self {
            TestFramework::Pytest => "pytest",
            TestFramework::Npm => "npm",
            TestFramework::Artisan => "php",
            TestFramework::Cargo => "cargo",
            TestFramework::Go => "go",
        }
    }

    fn args(self) -> &'static [&'static str] {
        match self {
            TestFramework::Pytest => &["-q", "-rA", "--tb=short"],
            TestFramework::Npm => &["test", "--", "--passWithNoTests"],
            TestFramework::Artisan => &["artisan", "test"],
            TestFramework::Cargo => &["test"],
            TestFramework::Go => &["test", "-v", "./..."],
        }
    }

    pub fn command_line(self) -> String {
        format!("{} {}", self.program(), self.args().join(" "))
    }

    pub fn parse(self, output: &str) -> Vec<TestCaseResult> {
        match self {
            TestFramework::Pytest => parse_pytest(output),
            TestFramework::Npm => parse_jest(output),
            TestFramework::Artisan => parse_artisan(output),
            TestFramework::Cargo => parse_cargo(output),
            TestFramework::Go => parse_go(output),
        }
    }
}

/// Run the stack's test command in `workspace`.
///
/// A stack without a known runner, or whose runner is not installed, yields
/// a passing outcome whose output says the tests were skipped.
pub async fn run_stack_tests(workspace: &Path, stack: &str) -> Result<TestOutcome, ForgeError> {
    let Some(framework) = TestFramework::for_stack(stack) else {
        return Ok(skipped(format!("no test runner known for stack '{stack}'")));
    };
    if which::which(framework.program()).is_err() {
        return Ok(skipped(format!("{} not found on PATH", framework.program())));
    }

    tracing::debug!("Running: {} in {:?}", framework.command_line(), workspace);
    let output = Command::new(framework.program())
        .args(framework.args())
        .env("CI", "true")
        .env("CARGO_TERM_COLOR", "never")
        .current_dir(workspace)
        .output()
        .await?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    let combined = format!("{stdout}\n{stderr}");
    Ok(outcome_from(framework, &combined, output.status.success()))
}

pub fn outcome_from(framework: TestFramework, output: &str, success: bool) -> TestOutcome {
    let per_test = framework.parse(output);
    let any_failed = per_test.iter().any(|t| !t.passed);
    TestOutcome {
        passed: success && !any_failed,
        output: tail(output, MAX_OUTPUT_CHARS).to_string(),
        per_test,
    }
}

fn skipped(reason: String) -> TestOutcome {
    TestOutcome {
        passed: true,
        output: format!("tests skipped: {reason}"),
        per_test: Vec::new(),
    }
}

fn tail(s: &str, max_chars: usize) -> &str {
    let count = s.chars().count();
    if count <= max_chars {
        return s;
    }
    let skip = s
        .char_indices()
        .nth(count - max_chars)
        .map(|(i, _)| i)
        .unwrap_or(0);
    &s[skip..]
}

fn case(name: &str, passed: bool) -> TestCaseResult {
    TestCaseResult {
        name: name.trim().to_string(),
        passed,
    }
}

/// `test path::name ... ok` / `test path::name ... FAILED`
fn parse_cargo(output: &str) -> Vec<TestCaseResult> {
    output
        .lines()
        .filter_map(|line| {
            let rest = line.strip_prefix("test ")?;
            let (name, verdict) = rest.split_once(" ... ")?;
            match verdict.trim() {
                "ok" => Some(case(name, true)),
                "FAILED" => Some(case(name, false)),
                _ => None,
            }
        })
        .collect()
}

/// `--- PASS: TestFoo (0.00s)` / `--- FAIL: TestFoo (0.00s)`
fn parse_go(output: &str) -> Vec<TestCaseResult> {
    output
        .lines()
        .filter_map(|line| {
            let trimmed = line.trim();
            let (rest, passed) = if let Some(r) = trimmed.strip_prefix("--- PASS: ") {
                (r, true)
            } else if let Some(r) = trimmed.strip_prefix("--- FAIL: ") {
                (r, false)
            } else {
                return None;
            };
            let name = rest.split_whitespace().next()?;
            Some(case(name, passed))
        })
        .collect()
}

/// `-rA` short summary: `PASSED tests/test_x.py::test_a` / `FAILED ... - reason`
fn parse_pytest(output: &str) -> Vec<TestCaseResult> {
    output
        .lines()
        .filter_map(|line| {
            let trimmed = line.trim();
            let (rest, passed) = if let Some(r) = trimmed.strip_prefix("PASSED ") {
                (r, true)
            } else if let Some(r) = trimmed.strip_prefix("FAILED ") {
                (r, false)
            } else if let Some(r) = trimmed.strip_prefix("ERROR ") {
                (r, false)
            } else {
                return None;
            };
            let name = rest.split(" - ").next().unwrap_or(rest);
            Some(case(name, passed))
        })
        .collect()
}

/// Jest verbose markers: `✓ name (3 ms)` / `✕ name`
fn parse_jest(output: &str) -> Vec<TestCaseResult> {
    output
        .lines()
        .filter_map(|line| {
            let trimmed = line.trim();
            let (rest, passed) = if let Some(r) = trimmed.strip_prefix("✓ ") {
                (r, true)
            } else if let Some(r) = trimmed.strip_prefix("✕ ") {
                (r, false)
            } else if let Some(r) = trimmed.strip_prefix("× ") {
                (r, false)
            } else {
                return None;
            };
            Some(case(strip_timing(rest), passed))
        })
        .collect()
}

/// Pest / artisan: `✓ it works` / `⨯ it fails`
fn parse_artisan(output: &str) -> Vec<TestCaseResult> {
    output
        .lines()
        .filter_map(|line| {
            let trimmed = line.trim();
            let (rest, passed) = if let Some(r) = trimmed.strip_prefix("✓ ") {
                (r, true)
            } else if let Some(r) = trimmed.strip_prefix("⨯ ") {
                (r, false)
            } else if let Some(r) = trimmed.strip_prefix("FAIL ") {
                (r, false)
            } else {
                return None;
            };
            Some(case(strip_timing(rest), passed))
        })
        .collect()
}

fn strip_timing(name: &str) -> &str {
    match name.rfind(" (") {
        Some(idx) if name.ends_with(')') => &name[..idx],
        _ => name,
    }
}
