//! Code-generation agent dispatch.
//!
//! The agent itself is an external process. Anvil hands it a prompt on stdin
//! and reads back a JSON result object from stdout; everything about how the
//! agent reasons stays on the other side of that boundary.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::queue::{WorkItem, WorkType};
use crate::util::extract_json_object;

pub const DEFAULT_AGENT_TIMEOUT: Duration = Duration::from_secs(1800);

/// Specialisation an item is dispatched to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    General,
    BugFixer,
    FeatureBuilder,
    TestWriter,
    Refactorer,
    DocWriter,
}

impl AgentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentKind::General => "general",
            AgentKind::BugFixer => "bug_fixer",
            AgentKind::FeatureBuilder => "feature_builder",
            AgentKind::TestWriter => "test_writer",
            AgentKind::Refactorer => "refactorer",
            AgentKind::DocWriter => "doc_writer",
        }
    }

    /// Kind used when no route matches.
    pub fn for_work_type(work_type: WorkType) -> Self {
        match work_type {
            WorkType::BugFix => AgentKind::BugFixer,
            WorkType::Feature => AgentKind::FeatureBuilder,
            WorkType::Test => AgentKind::TestWriter,
            WorkType::Refactor => AgentKind::Refactorer,
            WorkType::Documentation => AgentKind::DocWriter,
        }
    }

    fn default_instructions(&self) -> &'static str {
        match self {
            AgentKind::General => "Complete the task below with the smallest change that satisfies it.",
            AgentKind::BugFixer => {
                "Reproduce the bug, fix the root cause, and add a regression test that fails without the fix."
            }
            AgentKind::FeatureBuilder => "Implement the feature below and cover the new behaviour with tests.",
            AgentKind::TestWriter => "Add tests for the behaviour described below. Do not change production code.",
            AgentKind::Refactorer => "Restructure the code described below without changing its behaviour.",
            AgentKind::DocWriter => "Update the documentation described below. Keep code changes to a minimum.",
        }
    }
}

impl std::fmt::Display for AgentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One `[[agents.routes]]` entry. Unset fields match anything.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRoute {
    #[serde(default)]
    pub work_type: Option<WorkType>,
    #[serde(default)]
    pub source: Option<String>,
    pub agent: AgentKind,
}

impl AgentRoute {
    fn matches(&self, item: &WorkItem) -> bool {
        self.work_type.is_none_or(|t| t == item.work_type)
            && self.source.as_deref().is_none_or(|s| s == item.source)
    }
}

/// Routing table resolved once per claimed item; first matching route wins.
#[derive(Debug, Clone, Default)]
pub struct AgentRouter {
    routes: Vec<AgentRoute>,
}

impl AgentRouter {
    pub fn new(routes: Vec<AgentRoute>) -> Self {
        Self { routes }
    }

    pub fn resolve(&self, item: &WorkItem) -> AgentKind {
        self.routes
            .iter()
            .find(|r| r.matches(item))
            .map(|r| r.agent)
            .unwrap_or_else(|| AgentKind::for_work_type(item.work_type))
    }
}

/// Per-kind overrides from `[agents.kinds.<kind>]`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentProfile {
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub instructions: Option<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub task: WorkItem,
    pub kind: AgentKind,
    /// Failure summary from earlier attempts.
    pub context: Option<String>,
}

impl AgentRequest {
    pub fn new(task: WorkItem, kind: AgentKind) -> Self {
        let context = task.retry_context.clone();
        Self { task, kind, context }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentOutcome {
    pub success: bool,
    pub files_modified: Vec<String>,
    pub claims: Vec<String>,
    pub raw_output: String,
    pub justification: Option<String>,
    pub timed_out: bool,
    pub error: Option<String>,
}

impl AgentOutcome {
    pub fn failed(raw_output: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            success: false,
            raw_output: raw_output.into(),
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

/// Result object an agent prints as its final JSON.
#[derive(Debug, Deserialize)]
struct AgentReport {
    #[serde(default = "default_true")]
    success: bool,
    #[serde(default)]
    files_modified: Vec<String>,
    #[serde(default)]
    claims: Vec<String>,
    #[serde(default)]
    justification: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

fn default_true() -> bool {
    true
}

#[async_trait]
pub trait ExecutionAgent: Send + Sync {
    async fn execute(&self, request: &AgentRequest) -> Result<AgentOutcome>;
}

/// Runs the configured agent command through `sh -c` in the project dir.
pub struct CommandAgent {
    project_dir: PathBuf,
    command: String,
    timeout: Duration,
    kinds: BTreeMap<AgentKind, AgentProfile>,
}

impl CommandAgent {
    pub fn new(project_dir: impl AsRef<Path>, command: &str, timeout: Duration) -> Self {
        Self {
            project_dir: project_dir.as_ref().to_path_buf(),
            command: command.to_string(),
            timeout,
            kinds: BTreeMap::new(),
        }
    }

    pub fn with_kinds(mut self, kinds: BTreeMap<AgentKind, AgentProfile>) -> Self {
        self.kinds = kinds;
        self
    }

    fn profile(&self, kind: AgentKind) -> (String, Duration, String) {
        let profile = self.kinds.get(&kind);
        let command = profile
            .and_then(|p| p.command.clone())
            .unwrap_or_else(|| self.command.clone());
        let timeout = profile
            .and_then(|p| p.timeout_secs)
            .map(Duration::from_secs)
            .unwrap_or(self.timeout);
        let instructions = profile
            .and_then(|p| p.instructions.clone())
            .unwrap_or_else(|| kind.default_instructions().to_string());
        (command, timeout, instructions)
    }
}

/// Render the agent prompt for a request.
pub fn build_prompt(request: &AgentRequest, instructions: &str) -> String {
    let task = &request.task;
    let mut prompt = format!(
        "# Task: {}\n\nType: {}\nAgent: {}\nAttempt: {} of {}\n\n{}\n",
        task.title,
        task.work_type,
        request.kind,
        task.attempt_number(),
        task.max_attempts,
        instructions
    );
    if !task.description.is_empty() {
        prompt.push_str(&format!("\n## Description\n\n{}\n", task.description));
    }
    if !task.success_criteria.is_empty() {
        prompt.push_str("\n## Success criteria\n\n");
        for c in &task.success_criteria {
            prompt.push_str(&format!("- {}\n", c.describe()));
        }
    }
    if let Some(expected) = &task.expected_files {
        prompt.push_str("\n## Files you are expected to change\n\n");
        for f in expected {
            prompt.push_str(&format!("- {}\n", f));
        }
        prompt.push_str("\nChanging other files requires a justification.\n");
    }
    if let Some(context) = &request.context {
        prompt.push_str(&format!("\n## Previous attempts failed\n\n{}\n", context));
    }
    prompt.push_str(
        "\n## Result\n\nFinish by printing one JSON object:\n\
         {\"success\": true, \"files_modified\": [...], \"claims\": [\"...\"], \"justification\": null}\n\
         Only claim what you verified. Every claim is checked against recorded evidence.\n",
    );
    prompt
}

/// Interpret agent stdout. Falls back to the exit code when no JSON result is present.
pub fn parse_agent_output(stdout: &str, exit_ok: bool) -> AgentOutcome {
    let report = extract_json_object(stdout).and_then(|json| serde_json::from_str::<AgentReport>(&json).ok());
    match report {
        Some(r) => AgentOutcome {
            success: r.success && exit_ok,
            files_modified: r.files_modified,
            claims: r.claims,
            raw_output: stdout.to_string(),
            justification: r.justification.filter(|j| !j.trim().is_empty()),
            timed_out: false,
            error: r.error.or_else(|| (!exit_ok).then(|| "agent exited with non-zero status".to_string())),
        },
        None => AgentOutcome {
            success: exit_ok,
            raw_output: stdout.to_string(),
            error: (!exit_ok).then(|| "agent exited with non-zero status".to_string()),
            ..Default::default()
        },
    }
}

#[async_trait]
impl ExecutionAgent for CommandAgent {
    async fn execute(&self, request: &AgentRequest) -> Result<AgentOutcome> {
        let (command, limit, instructions) = self.profile(request.kind);
        let prompt = build_prompt(request, &instructions);
        tracing::info!(task_id = %request.task.id, kind = %request.kind, %command, "spawning agent");

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&command)
            .current_dir(&self.project_dir)
            .env("ANVIL_TASK_ID", request.task.id.to_string())
            .env("ANVIL_AGENT_KIND", request.kind.as_str())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn agent: {}", command))?;

        if let Some(mut stdin) = child.stdin.take() {
            // An agent that ignores stdin closes the pipe early; that is not a failure.
            if let Err(e) = stdin.write_all(prompt.as_bytes()).await {
                tracing::debug!(error = %e, "agent did not read the full prompt");
            }
            drop(stdin);
        }

        match tokio::time::timeout(limit, child.wait_with_output()).await {
            Ok(output) => {
                let output = output.context("Failed to wait for agent")?;
                let stdout = String::from_utf8_lossy(&output.stdout).to_string();
                let mut outcome = parse_agent_output(&stdout, output.status.success());
                if !output.status.success() {
                    let stderr = String::from_utf8_lossy(&output.stderr);
                    tracing::warn!(task_id = %request.task.id, code = ?output.status.code(), stderr = %stderr.trim(), "agent failed");
                }
                if outcome.raw_output.is_empty() {
                    outcome.raw_output = String::from_utf8_lossy(&output.stderr).to_string();
                }
                Ok(outcome)
            }
            Err(_) => {
                tracing::warn!(task_id = %request.task.id, timeout_secs = limit.as_secs(), "agent timed out");
                Ok(AgentOutcome {
                    timed_out: true,
                    ..AgentOutcome::failed("", format!("agent timed out after {}s", limit.as_secs()))
                })
            }
        }
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// One scripted agent turn: files to write, then the outcome to report.
    pub struct Step {
        pub writes: Vec<(String, String)>,
        pub outcome: AgentOutcome,
    }

    impl Step {
        pub fn succeed(claims: &[&str]) -> Self {
            Self {
                writes: Vec::new(),
                outcome: AgentOutcome {
                    success: true,
                    claims: claims.iter().map(|c| c.to_string()).collect(),
                    ..Default::default()
                },
            }
        }

        pub fn fail(error: &str) -> Self {
            Self {
                writes: Vec::new(),
                outcome: AgentOutcome::failed("", error),
            }
        }

        pub fn write(mut self, path: &str, content: &str) -> Self {
            self.outcome.files_modified.push(path.to_string());
            self.writes.push((path.to_string(), content.to_string()));
            self
        }
    }

    /// Replays scripted steps in order; runs out as a failing agent.
    pub struct ScriptedAgent {
        dir: PathBuf,
        steps: Mutex<VecDeque<Step>>,
        pub requests: Mutex<Vec<AgentRequest>>,
    }

    impl ScriptedAgent {
        pub fn new(dir: &Path, steps: Vec<Step>) -> Self {
            Self {
                dir: dir.to_path_buf(),
                steps: Mutex::new(steps.into()),
                requests: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ExecutionAgent for ScriptedAgent {
        async fn execute(&self, request: &AgentRequest) -> Result<AgentOutcome> {
            self.requests.lock().unwrap().push(request.clone());
            let step = self.steps.lock().unwrap().pop_front();
            let Some(step) = step else {
                return Ok(AgentOutcome::failed("", "script exhausted"));
            };
            for (path, content) in &step.writes {
                let full = self.dir.join(path);
                if let Some(parent) = full.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(full, content)?;
            }
            Ok(step.outcome)
        }
    }
}
