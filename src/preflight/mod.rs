//! Pre-Flight Checker: environment readiness before an agent is dispatched.
//!
//! Every check always runs so the caller gets the full diagnostic. A failing
//! check only blocks when its `required_for` tags intersect the task's `needs`;
//! a check with no tags is required for every task.

use anyhow::Result;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;

use crate::errors::GateError;
use crate::evidence::{EvidenceKind, EvidenceStore};
use crate::queue::WorkItem;
use crate::shell::ShellRunner;

const DEFAULT_CHECK_TIMEOUT_SECS: u64 = 30;

/// What a pre-flight check probes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CheckKind {
    PortReachable { host: String, port: u16 },
    CommandExitsZero { command: String },
    ToolOnPath { tool: String },
    WorkingTreeClean,
    FileExists { path: String },
}

/// A declared check, as written in `[[preflight.checks]]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreflightCheck {
    pub name: String,
    #[serde(flatten)]
    pub kind: CheckKind,
    #[serde(default)]
    pub required_for: BTreeSet<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl PreflightCheck {
    /// Whether a failure of this check blocks a task with the given needs.
    pub fn blocks(&self, needs: &BTreeSet<String>) -> bool {
        self.required_for.is_empty() || !self.required_for.is_disjoint(needs)
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.unwrap_or(DEFAULT_CHECK_TIMEOUT_SECS))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckResult {
    pub name: String,
    pub passed: bool,
    /// Whether this result counts against the task.
    pub blocking: bool,
    pub detail: String,
    pub duration_ms: u64,
    pub evidence_id: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreflightReport {
    pub passed: bool,
    pub results: Vec<CheckResult>,
}

impl PreflightReport {
    /// Names of blocking checks that failed.
    pub fn blocking_failures(&self) -> Vec<String> {
        self.results
            .iter()
            .filter(|r| r.blocking && !r.passed)
            .map(|r| r.name.clone())
            .collect()
    }

    /// Convert a report with blocking failures into `PreflightFailed`.
    pub fn require(&self) -> Result<(), GateError> {
        let failed = self.blocking_failures();
        if failed.is_empty() {
            Ok(())
        } else {
            Err(GateError::PreflightFailed { failed })
        }
    }
}

pub struct PreflightChecker {
    project_dir: PathBuf,
    shell: Arc<dyn ShellRunner>,
    evidence: EvidenceStore,
}

impl PreflightChecker {
    pub fn new(project_dir: impl AsRef<Path>, shell: Arc<dyn ShellRunner>, evidence: EvidenceStore) -> Self {
        Self {
            project_dir: project_dir.as_ref().to_path_buf(),
            shell,
            evidence,
        }
    }

    pub async fn run_checks(&self, task: &WorkItem, checks: &[PreflightCheck]) -> Result<PreflightReport> {
        let outcomes = join_all(checks.iter().map(|c| self.probe(c))).await;

        let mut results = Vec::with_capacity(checks.len());
        for (check, (passed, detail, elapsed)) in checks.iter().zip(outcomes) {
            let blocking = check.blocks(&task.needs);
            let payload = json!({
                "passed": passed,
                "name": check.name,
                "check": check.kind,
                "blocking": blocking,
                "detail": detail,
            });
            let evidence_id = self
                .evidence
                .record(task.id, EvidenceKind::Preflight, payload, None)
                .await?;
            if !passed {
                tracing::warn!(task_id = %task.id, check = %check.name, blocking, %detail, "pre-flight check failed");
            }
            results.push(CheckResult {
                name: check.name.clone(),
                passed,
                blocking,
                detail,
                duration_ms: elapsed.as_millis() as u64,
                evidence_id: Some(evidence_id),
            });
        }

        let passed = results.iter().all(|r| r.passed || !r.blocking);
        tracing::info!(task_id = %task.id, checks = results.len(), passed, "pre-flight complete");
        Ok(PreflightReport { passed, results })
    }

    async fn probe(&self, check: &PreflightCheck) -> (bool, String, Duration) {
        let start = Instant::now();
        let (passed, detail) = match &check.kind {
            CheckKind::PortReachable { host, port } => {
                match tokio::time::timeout(check.timeout(), TcpStream::connect((host.as_str(), *port))).await {
                    Ok(Ok(_)) => (true, format!("{}:{} reachable", host, port)),
                    Ok(Err(e)) => (false, format!("{}:{} unreachable: {}", host, port, e)),
                    Err(_) => (false, format!("{}:{} timed out", host, port)),
                }
            }
            CheckKind::CommandExitsZero { command } => match self.shell.run(command, check.timeout()).await {
                Ok(out) if out.success() => (true, format!("`{}` exited 0", command)),
                Ok(out) if out.timed_out => (false, format!("`{}` timed out", command)),
                Ok(out) => (false, format!("`{}` exited {}: {}", command, out.exit_code, out.stderr.trim())),
                Err(e) => (false, format!("`{}` could not run: {:#}", command, e)),
            },
            CheckKind::ToolOnPath { tool } => match find_on_path(tool) {
                Some(path) => (true, format!("{} found at {}", tool, path.display())),
                None => (false, format!("{} not found on PATH", tool)),
            },
            CheckKind::WorkingTreeClean => {
                match self.shell.run("git status --porcelain", check.timeout()).await {
                    Ok(out) if out.success() && out.stdout.trim().is_empty() => {
                        (true, "working tree clean".to_string())
                    }
                    Ok(out) if out.success() => {
                        let dirty = out.stdout.lines().count();
                        (false, format!("working tree has {} uncommitted change(s)", dirty))
                    }
                    Ok(out) => (false, format!("git status failed: {}", out.stderr.trim())),
                    Err(e) => (false, format!("git status could not run: {:#}", e)),
                }
            }
            CheckKind::FileExists { path } => {
                let full = self.project_dir.join(path);
                if full.exists() {
                    (true, format!("{} exists", path))
                } else {
                    (false, format!("{} is missing", path))
                }
            }
        };
        (passed, detail, start.elapsed())
    }
}

/// Locate an executable on `PATH` (or accept an explicit path).
fn find_on_path(tool: &str) -> Option<PathBuf> {
    let candidate = Path::new(tool);
    if candidate.components().count() > 1 {
        return candidate.is_file().then(|| candidate.to_path_buf());
    }
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(tool))
        .find(|p| is_executable(p))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
