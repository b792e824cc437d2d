// src/tools/mod.rs — Patch application and test execution

pub mod test_runner;

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::core::patch::changed_files;
use crate::core::types::TestOutcome;
use crate::infra::errors::ForgeError;

/// Applies validated patches to a workspace and runs its tests.
#[async_trait]
pub trait ToolManager: Send + Sync {
    /// Apply `patch` inside `workspace`. Returns the files it touched.
    async fn apply_patch(&self, workspace: &Path, patch: &str) -> Result<Vec<String>, ForgeError>;

    async fn run_tests(&self, workspace: &Path, stack: &str) -> Result<TestOutcome, ForgeError>;
}

/// `git apply` backed tool manager.
#[derive(Debug, Default, Clone)]
pub struct GitToolManager;

impl GitToolManager {
    pub fn new() -> Self {
        Self
    }

    async fn git_apply(workspace: &Path, patch: &str, check: bool) -> Result<(), ForgeError> {
        let mut cmd = Command::new("git");
        cmd.arg("apply");
        if check {
            cmd.arg("--check");
        }
        let mut child = cmd
            .args(["--whitespace=nowarn", "--recount", "-"])
            .current_dir(workspace)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(patch.as_bytes()).await?;
        }
        let output = child.wait_with_output().await?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(ForgeError::PatchApply {
            reason: stderr.trim().to_string(),
        })
    }
}

#[async_trait]
impl ToolManager for GitToolManager {
    async fn apply_patch(&self, workspace: &Path, patch: &str) -> Result<Vec<String>, ForgeError> {
        if which::which("git").is_err() {
            return Err(ForgeError::PatchApply {
                reason: "git not found on PATH".into(),
            });
        }

        Self::git_apply(workspace, patch, true).await?;
        Self::git_apply(workspace, patch, false).await?;

        let files = changed_files(patch);
        debug!(files = ?files, "patch applied");
        Ok(files)
    }

    async fn run_tests(&self, workspace: &Path, stack: &str) -> Result<TestOutcome, ForgeError> {
        test_runner::run_stack_tests(workspace, stack).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NEW_FILE: &str = "diff --git a/hello.txt b/hello.txt
new file mode 100644
--- /dev/null
+++ b/hello.txt
@@ -0,0 +1 @@
+hello
";

    #[tokio::test]
    async fn test_apply_creates_file() {
        if which::which("git").is_err() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let files = GitToolManager::new()
            .apply_patch(dir.path(), NEW_FILE)
            .await
            .unwrap();
        assert_eq!(files, vec!["hello.txt".to_string()]);
        let content = std::fs::read_to_string(dir.path().join("hello.txt")).unwrap();
        assert_eq!(content, "hello\n");
    }

    #[tokio::test]
    async fn test_conflicting_patch_is_rejected_untouched() {
        if which::which("git").is_err() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "actual\n").unwrap();
        let patch = "--- a/a.txt\n+++ b/a.txt\n@@ -1 +1 @@\n-expected\n+changed\n";
        let err = GitToolManager::new()
            .apply_patch(dir.path(), patch)
            .await
            .unwrap_err();
        assert!(matches!(err, ForgeError::PatchApply { .. }));
        assert_eq!(
            std::fs::read_to_string(dir.path().join("a.txt")).unwrap(),
            "actual\n"
        );
    }
}
