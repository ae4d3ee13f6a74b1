//! Shell command capability used by pre-flight, the test validator and the
//! workflow orchestrator.
//!
//! Commands run through `sh -c` in the project directory. A timeout is a normal
//! outcome (`timed_out = true`), never an error: callers treat it as a failed check.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tokio::time::timeout;

/// Exit code reported when the process was killed for exceeding its timeout.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// Captured result of one command invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    #[serde(with = "duration_ms")]
    pub duration: Duration,
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }

    /// Stdout followed by stderr, the way a terminal would show them.
    pub fn combined(&self) -> String {
        match (self.stdout.trim().is_empty(), self.stderr.trim().is_empty()) {
            (false, false) => format!("{}\n{}", self.stdout, self.stderr),
            (false, true) => self.stdout.clone(),
            (true, false) => self.stderr.clone(),
            (true, true) => String::new(),
        }
    }
}

/// Abstraction over subprocess execution for testability.
/// Real implementation: `SystemShell`. Test double: `FakeShell`.
#[async_trait]
pub trait ShellRunner: Send + Sync {
    async fn run(&self, command: &str, timeout: Duration) -> Result<CommandOutput>;
}

/// Runs commands with `sh -c` inside a fixed working directory.
pub struct SystemShell {
    working_dir: PathBuf,
}

impl SystemShell {
    pub fn new(working_dir: impl AsRef<Path>) -> Self {
        Self {
            working_dir: working_dir.as_ref().to_path_buf(),
        }
    }
}

#[async_trait]
impl ShellRunner for SystemShell {
    async fn run(&self, command: &str, limit: Duration) -> Result<CommandOutput> {
        let start = Instant::now();
        let child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&self.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn command: {}", command))?;

        // Dropping the wait future on timeout drops the child, and kill_on_drop reaps it.
        match timeout(limit, child.wait_with_output()).await {
            Ok(result) => {
                let output = result.with_context(|| format!("Failed to wait for: {}", command))?;
                Ok(CommandOutput {
                    exit_code: output.status.code().unwrap_or(-1),
                    stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                    stderr: String::from_utf8_lossy(&output.stderr).to_string(),
                    duration: start.elapsed(),
                    timed_out: false,
                })
            }
            Err(_) => {
                tracing::warn!(command, timeout_secs = limit.as_secs_f64(), "command timed out");
                Ok(CommandOutput {
                    exit_code: TIMEOUT_EXIT_CODE,
                    stdout: String::new(),
                    stderr: format!("Command timed out after {:.1}s", limit.as_secs_f64()),
                    duration: start.elapsed(),
                    timed_out: true,
                })
            }
        }
    }
}

/// Serialize durations as integer milliseconds.
pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_system_shell_captures_output_and_exit_code() {
        let dir = tempdir().unwrap();
        let shell = SystemShell::new(dir.path());
        let out = shell
            .run("echo hello; echo oops >&2; exit 3", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(out.exit_code, 3);
        assert_eq!(out.stdout.trim(), "hello");
        assert_eq!(out.stderr.trim(), "oops");
        assert!(!out.timed_out);
        assert!(!out.success());
    }

    #[tokio::test]
    async fn test_system_shell_runs_in_working_dir() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("marker.txt"), "x").unwrap();
        let shell = SystemShell::new(dir.path());
        let out = shell.run("ls", Duration::from_secs(5)).await.unwrap();
        assert!(out.stdout.contains("marker.txt"));
        assert!(out.success());
    }

    #[tokio::test]
    async fn test_system_shell_timeout_is_an_outcome_not_an_error() {
        let dir = tempdir().unwrap();
        let shell = SystemShell::new(dir.path());
        let out = shell
            .run("sleep 5", Duration::from_millis(100))
            .await
            .unwrap();
        assert!(out.timed_out);
        assert_eq!(out.exit_code, TIMEOUT_EXIT_CODE);
        assert!(!out.success());
    }

    #[test]
    fn test_combined_output() {
        let out = CommandOutput {
            exit_code: 0,
            stdout: "a".into(),
            stderr: "b".into(),
            duration: Duration::ZERO,
            timed_out: false,
        };
        assert_eq!(out.combined(), "a\nb");
    }
}
