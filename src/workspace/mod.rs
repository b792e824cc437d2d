// src/workspace/mod.rs — Per-run project directories
//
// Every run owns one workspace directory. Setup steps (git init, dependency
// install) are best-effort: a missing toolchain is logged, not fatal.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Serialize;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::infra::errors::ForgeError;

/// Directories never listed back to the planner.
const SKIP_DIRS: &[&str] = &[".git", "node_modules", "vendor", "target", "__pycache__", ".venv"];
const MAX_LISTED_FILES: usize = 200;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArtifactReport {
    pub expected: Vec<String>,
    pub present: Vec<String>,
    pub missing: Vec<String>,
}

impl ArtifactReport {
    /// At least half of the stack's expected files exist. Stacks with no
    /// expectations always pass.
    pub fn is_satisfied(&self) -> bool {
        self.expected.is_empty() || self.present.len() * 2 >= self.expected.len()
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ProjectManager: Send + Sync {
    async fn create_workspace(&self, run_id: &str, stack: &str) -> Result<PathBuf, ForgeError>;

    async fn install_dependencies(&self, workspace: &Path, stack: &str) -> Result<(), ForgeError>;

    fn verify_artifacts(&self, workspace: &Path, stack: &str) -> ArtifactReport;

    /// Relative paths of project files, for planning context.
    fn list_files(&self, workspace: &Path) -> Vec<String>;
}

/// Files a finished project of each stack is expected to contain.
/// Entries ending in `/` are directories.
pub fn expected_artifacts(stack: &str) -> &'static [&'static str] {
    match stack.to_ascii_lowercase().as_str() {
        "laravel" => &["composer.json", "app/", "routes/", "database/"],
        "react" | "vue" => &["package.json", "src/", "public/"],
        "python" => &["main.py", "requirements.txt"],
        "node" => &["package.json", "index.js"],
        "rust" => &["Cargo.toml", "src/"],
        "go" => &["go.mod", "main.go"],
        _ => &[],
    }
}

pub fn check_artifacts(workspace: &Path, stack: &str) -> ArtifactReport {
    let expected: Vec<String> = expected_artifacts(stack)
        .iter()
        .map(|s| s.to_string())
        .collect();
    let (present, missing): (Vec<String>, Vec<String>) =
        expected.iter().cloned().partition(|item| {
            let path = workspace.join(item.trim_end_matches('/'));
            if item.ends_with('/') {
                path.is_dir()
            } else {
                path.is_file()
            }
        });
    ArtifactReport {
        expected,
        present,
        missing,
    }
}

pub struct LocalProjectManager {
    root: PathBuf,
}

impl LocalProjectManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Run a setup command; failures are logged and swallowed.
    async fn best_effort(workspace: &Path, program: &str, args: &[&str]) {
        if which::which(program).is_err() {
            warn!("{program} not found on PATH, skipping `{program} {}`", args.join(" "));
            return;
        }
        debug!("Running: {program} {} in {:?}", args.join(" "), workspace);
        match Command::new(program)
            .args(args)
            .current_dir(workspace)
            .output()
            .await
        {
            Ok(out) if out.status.success() => {}
            Ok(out) => warn!(
                "`{program} {}` exited with {}: {}",
                args.join(" "),
                out.status,
                String::from_utf8_lossy(&out.stderr).trim()
            ),
            Err(e) => warn!("`{program}` failed to start: {e}"),
        }
    }
}

#[async_trait]
impl ProjectManager for LocalProjectManager {
    async fn create_workspace(&self, run_id: &str, stack: &str) -> Result<PathBuf, ForgeError> {
        let dir = self.root.join(run_id);
        tokio::fs::create_dir_all(&dir).await?;
        // Own repo root so `git apply` resolves paths against the workspace.
        if !dir.join(".git").exists() {
            Self::best_effort(&dir, "git", &["init", "--quiet"]).await;
        }
        info!(stack, workspace = %dir.display(), "workspace ready");
        Ok(dir)
    }

    async fn install_dependencies(&self, workspace: &Path, stack: &str) -> Result<(), ForgeError> {
        match stack.to_ascii_lowercase().as_str() {
            "python" if workspace.join("requirements.txt").is_file() => {
                Self::best_effort(workspace, "pip", &["install", "-q", "-r", "requirements.txt"])
                    .await
            }
            "node" | "react" | "vue" if workspace.join("package.json").is_file() => {
                Self::best_effort(workspace, "npm", &["install", "--no-audit", "--no-fund"]).await
            }
            "laravel" if workspace.join("composer.json").is_file() => {
                Self::best_effort(workspace, "composer", &["install", "--no-interaction"]).await
            }
            _ => debug!(stack, "no dependency manifest to install"),
        }
        Ok(())
    }

    fn verify_artifacts(&self, workspace: &Path, stack: &str) -> ArtifactReport {
        check_artifacts(workspace, stack)
    }

    fn list_files(&self, workspace: &Path) -> Vec<String> {
        let mut files = Vec::new();
        collect_files(workspace, workspace, &mut files);
        files.sort();
        files
    }
}

fn collect_files(root: &Path, dir: &Path, out: &mut Vec<String>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        if out.len() >= MAX_LISTED_FILES {
            return;
        }
        let path = entry.path();
        let name = entry.file_name();
        if path.is_dir() {
            if !SKIP_DIRS.iter().any(|s| name == *s) {
                collect_files(root, &path, out);
            }
        } else if let Ok(rel) = path.strip_prefix(root) {
            out.push(rel.to_string_lossy().replace('\\', "/"));
        }
    }
}
