//! Workflow Orchestrator: takes an agent's result through the gates and
//! commits, retries or fails the item accordingly.
//!
//! ```text
//! Executing -> Validating -> Committing -> Done
//!                   |
//!                   +-> Blocked -> Retry | Failed
//! ```

use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::agent::AgentOutcome;
use crate::diff::{ChangedFile, DiffProvider};
use crate::errors::{QueueError, WorkflowError};
use crate::evidence::{EvidenceKind, EvidenceStore};
use crate::failure::{FailureHandler, FailureType, RetryDecision};
use crate::gate::{QualityGate, commit_footer};
use crate::queue::{Outcome, QueueHandle, WorkItem};
use crate::shell::ShellRunner;
use crate::util::{shell_quote, slugify};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GitStrategy {
    #[default]
    DirectCommit,
    PullRequest,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitStyle {
    #[default]
    Conventional,
    Plain,
}

/// How a passing change reaches the repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowProfile {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub git_strategy: GitStrategy,
    #[serde(default)]
    pub auto_create_issues: bool,
    #[serde(default)]
    pub commit_style: CommitStyle,
    #[serde(default = "default_base_branch")]
    pub base_branch: String,
    #[serde(default = "default_remote")]
    pub remote: String,
}

fn default_base_branch() -> String {
    "main".to_string()
}

fn default_remote() -> String {
    "origin".to_string()
}

impl Default for WorkflowProfile {
    fn default() -> Self {
        Self::direct()
    }
}

impl WorkflowProfile {
    pub fn direct() -> Self {
        Self {
            name: "direct".to_string(),
            git_strategy: GitStrategy::DirectCommit,
            auto_create_issues: false,
            commit_style: CommitStyle::Conventional,
            base_branch: default_base_branch(),
            remote: default_remote(),
        }
    }

    pub fn pull_request() -> Self {
        Self {
            name: "pull_request".to_string(),
            git_strategy: GitStrategy::PullRequest,
            auto_create_issues: true,
            ..Self::direct()
        }
    }

    /// Profiles available without configuration.
    pub fn builtin(name: &str) -> Option<Self> {
        match name {
            "direct" => Some(Self::direct()),
            "pull_request" => Some(Self::pull_request()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowState {
    Executing,
    Validating,
    Committing,
    Done,
    Blocked,
    Retry,
    Failed,
}

impl std::fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WorkflowState::Executing => "executing",
            WorkflowState::Validating => "validating",
            WorkflowState::Committing => "committing",
            WorkflowState::Done => "done",
            WorkflowState::Blocked => "blocked",
            WorkflowState::Retry => "retry",
            WorkflowState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Where an item ended up after one execution.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Completed {
        commit_sha: String,
        branch: Option<String>,
        pr_url: Option<String>,
    },
    Requeued {
        reason: String,
    },
    Failed {
        reason: String,
        report_path: Option<PathBuf>,
    },
}

pub struct Orchestrator {
    queue: QueueHandle,
    gate: Arc<QualityGate>,
    vcs: Arc<dyn DiffProvider>,
    shell: Arc<dyn ShellRunner>,
    evidence: EvidenceStore,
    profile: WorkflowProfile,
    command_timeout: Duration,
}

type WResult<T> = Result<T, WorkflowError>;

impl Orchestrator {
    pub fn new(
        queue: QueueHandle,
        gate: Arc<QualityGate>,
        vcs: Arc<dyn DiffProvider>,
        shell: Arc<dyn ShellRunner>,
        evidence: EvidenceStore,
        profile: WorkflowProfile,
    ) -> Self {
        Self {
            queue,
            gate,
            vcs,
            shell,
            evidence,
            profile,
            command_timeout: Duration::from_secs(120),
        }
    }

    pub fn profile(&self) -> &WorkflowProfile {
        &self.profile
    }

    pub fn failures(&self) -> &Arc<FailureHandler> {
        &self.gate.failures
    }

    fn transition(&self, item: &WorkItem, from: WorkflowState, to: WorkflowState) {
        tracing::info!(task_id = %item.id, attempt = item.attempt_number(), %from, %to, "workflow transition");
    }

    /// Drive one finished agent execution to a terminal or requeued state.
    pub async fn complete_execution(&self, item: &WorkItem, outcome: AgentOutcome) -> WResult<TaskOutcome> {
        self.evidence
            .record(
                item.id,
                EvidenceKind::AgentOutput,
                json!({
                    "passed": outcome.success,
                    "claims": outcome.claims,
                    "files_modified": outcome.files_modified,
                    "timed_out": outcome.timed_out,
                    "error": outcome.error,
                }),
                Some(outcome.raw_output.clone()),
            )
            .await?;

        if !outcome.success {
            self.transition(item, WorkflowState::Executing, WorkflowState::Blocked);
            let failure_type = if outcome.timed_out {
                FailureType::Timeout
            } else {
                FailureType::Agent
            };
            let reason = outcome
                .error
                .clone()
                .unwrap_or_else(|| "agent reported failure".to_string());
            let failures = self.failures();
            let attempt = failures.next_attempt(item.id, failure_type).await?;
            let decision = failures.handle(item, failure_type, attempt, &reason).await?;
            return self.route_failure(item, &[decision], &reason).await;
        }

        self.transition(item, WorkflowState::Executing, WorkflowState::Validating);
        let changed = self.changed_files().await?;
        let evaluation = self
            .gate
            .validate_before_commit(item, &changed, &outcome.claims, outcome.justification.as_deref())
            .await
            .map_err(|e| WorkflowError::GateFailure {
                reason: format!("{:#}", e),
            })?;

        if !evaluation.result.can_complete {
            self.transition(item, WorkflowState::Validating, WorkflowState::Blocked);
            return self
                .route_failure(item, &evaluation.decisions, &evaluation.result.reason)
                .await;
        }

        self.transition(item, WorkflowState::Validating, WorkflowState::Committing);
        let report = self.evidence.export_report(item.id).await?;
        let message = format!(
            "{}\n\n{}",
            commit_message(item, self.profile.commit_style),
            commit_footer(&evaluation.result, &report)
        );
        let (commit_sha, branch, pr_url) = match self.profile.git_strategy {
            GitStrategy::DirectCommit => (self.commit(message).await?, None, None),
            GitStrategy::PullRequest => {
                let branch = branch_name(item);
                let name = branch.clone();
                self.with_vcs(move |vcs| vcs.create_branch(&name)).await?;
                let sha = self.commit(message).await?;
                let pr_url = self.open_pull_request(item, &branch).await;
                (sha, Some(branch), pr_url)
            }
        };

        self.evidence
            .record(
                item.id,
                EvidenceKind::Commit,
                json!({
                    "passed": true,
                    "sha": commit_sha,
                    "strategy": self.profile.git_strategy,
                    "branch": branch,
                    "pr_url": pr_url,
                }),
                None,
            )
            .await?;
        self.queue.set_commit_sha(item.id, commit_sha.clone()).await?;
        self.queue.complete(item.id, Outcome::Completed).await?;
        self.transition(item, WorkflowState::Committing, WorkflowState::Done);

        Ok(TaskOutcome::Completed {
            commit_sha,
            branch,
            pr_url,
        })
    }

    /// Requeue only when every decision allows a retry. One exhausted failure
    /// type fails the item with its report, whatever its siblings decided.
    pub async fn route_failure(
        &self,
        item: &WorkItem,
        decisions: &[RetryDecision],
        reason: &str,
    ) -> WResult<TaskOutcome> {
        self.set_aside_changes(item).await;

        if decisions.is_empty() || decisions.iter().any(|d| !d.should_retry) {
            // Only exhausted decisions carry a report.
            let report_path = decisions.iter().find_map(|d| d.report_path.clone());
            return self.fail_item(item, report_path, reason).await;
        }

        let retry_context = decisions.iter().rev().find_map(|d| d.retry_context.clone());
        match self.queue.requeue(item.id, retry_context).await {
            Ok(requeued) => {
                self.transition(item, WorkflowState::Blocked, WorkflowState::Retry);
                tracing::info!(task_id = %item.id, attempts = requeued.attempts, %reason, "requeued for retry");
                Ok(TaskOutcome::Requeued {
                    reason: reason.to_string(),
                })
            }
            Err(QueueError::RetryExhausted { attempts, max_attempts, .. }) => {
                tracing::warn!(task_id = %item.id, attempts, max_attempts, "queue attempts exhausted");
                let failure_type = decisions.first().map(|d| d.failure_type).unwrap_or(FailureType::Agent);
                let path = self.failures().escalate(item, failure_type, reason).await?;
                self.fail_item(item, Some(path), reason).await
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Route an error raised mid-attempt through the failure policy like any
    /// other blocked attempt, so the item never stays claimed.
    pub async fn route_error(&self, item: &WorkItem, error: &WorkflowError) -> WResult<TaskOutcome> {
        let reason = error.to_string();
        tracing::warn!(task_id = %item.id, error = %reason, "attempt aborted");
        let failures = self.failures();
        let attempt = failures.next_attempt(item.id, FailureType::Infrastructure).await?;
        let decision = failures
            .handle(item, FailureType::Infrastructure, attempt, &reason)
            .await?;
        let outcome = self.route_failure(item, &[decision], &reason).await?;
        if self.profile.git_strategy == GitStrategy::PullRequest {
            self.return_to_base().await;
        }
        Ok(outcome)
    }

    /// Terminal failure: attach the report, mark failed, optionally open an issue.
    pub async fn fail_item(
        &self,
        item: &WorkItem,
        report_path: Option<PathBuf>,
        reason: &str,
    ) -> WResult<TaskOutcome> {
        let path_str = report_path.as_ref().map(|p| p.display().to_string());
        self.queue
            .attach_failure(item.id, path_str.clone(), reason.to_string())
            .await?;
        self.queue.complete(item.id, Outcome::Failed).await?;
        self.transition(item, WorkflowState::Blocked, WorkflowState::Failed);
        tracing::error!(task_id = %item.id, %reason, report = ?path_str, "task failed");

        if self.profile.auto_create_issues {
            let body = format!(
                "Anvil gave up on **{}** ({}).\n\nReason: {}\n\nFailure report: {}",
                item.title,
                item.id,
                reason,
                path_str.as_deref().unwrap_or("none")
            );
            let command = format!(
                "gh issue create --title {} --body {}",
                shell_quote(&format!("anvil: {}", item.title)),
                shell_quote(&body)
            );
            match self.shell.run(&command, self.command_timeout).await {
                Ok(out) if out.success() => {
                    tracing::info!(task_id = %item.id, issue = %out.stdout.trim(), "opened issue")
                }
                Ok(out) => tracing::warn!(task_id = %item.id, stderr = %out.stderr.trim(), "gh issue create failed"),
                Err(e) => tracing::warn!(task_id = %item.id, error = %e, "gh issue create failed"),
            }
        }

        Ok(TaskOutcome::Failed {
            reason: reason.to_string(),
            report_path,
        })
    }

    async fn with_vcs<F, R>(&self, f: F) -> WResult<R>
    where
        F: FnOnce(&dyn DiffProvider) -> anyhow::Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let vcs = Arc::clone(&self.vcs);
        tokio::task::spawn_blocking(move || f(vcs.as_ref()))
            .await
            .context("VCS task panicked")?
            .map_err(|e| WorkflowError::Vcs(format!("{:#}", e)))
    }

    async fn changed_files(&self) -> WResult<Vec<ChangedFile>> {
        self.with_vcs(|vcs| vcs.changed_files()).await
    }

    async fn commit(&self, message: String) -> WResult<String> {
        self.with_vcs(move |vcs| vcs.commit(&message)).await
    }

    /// Push the branch and open a PR. The local commit stands even if this fails.
    async fn open_pull_request(&self, item: &WorkItem, branch: &str) -> Option<String> {
        let push = format!(
            "git push -u {} {}",
            shell_quote(&self.profile.remote),
            shell_quote(branch)
        );
        let pushed = match self.shell.run(&push, self.command_timeout).await {
            Ok(out) if out.success() => true,
            Ok(out) => {
                tracing::warn!(task_id = %item.id, %branch, stderr = %out.stderr.trim(), "git push failed");
                false
            }
            Err(e) => {
                tracing::warn!(task_id = %item.id, %branch, error = %e, "git push failed");
                false
            }
        };

        let mut pr_url = None;
        if pushed {
            let body = if item.description.is_empty() {
                format!("Automated change for: **{}**", item.title)
            } else {
                format!("Automated change for: **{}**\n\n{}", item.title, item.description)
            };
            let create = format!(
                "gh pr create --base {} --head {} --title {} --body {}",
                shell_quote(&self.profile.base_branch),
                shell_quote(branch),
                shell_quote(&commit_message(item, self.profile.commit_style)),
                shell_quote(&body)
            );
            match self.shell.run(&create, self.command_timeout).await {
                Ok(out) if out.success() => pr_url = Some(out.stdout.trim().to_string()),
                Ok(out) => tracing::warn!(task_id = %item.id, stderr = %out.stderr.trim(), "gh pr create failed"),
                Err(e) => tracing::warn!(task_id = %item.id, error = %e, "gh pr create failed"),
            }
        }

        self.return_to_base().await;
        pr_url
    }

    /// The next item starts from the base branch.
    async fn return_to_base(&self) {
        let checkout = format!("git checkout {}", shell_quote(&self.profile.base_branch));
        if let Ok(out) = self.shell.run(&checkout, self.command_timeout).await
            && !out.success()
        {
            tracing::warn!(stderr = %out.stderr.trim(), "failed to return to base branch");
        }
    }

    /// Stash a blocked attempt's changes so the next item starts clean.
    async fn set_aside_changes(&self, item: &WorkItem) {
        let command = format!(
            "git stash push --include-untracked -m {}",
            shell_quote(&format!("anvil {} attempt {}", item.short_id(), item.attempt_number()))
        );
        match self.shell.run(&command, self.command_timeout).await {
            Ok(out) if out.success() => tracing::debug!(task_id = %item.id, "stashed blocked changes"),
            Ok(out) => tracing::warn!(task_id = %item.id, stderr = %out.stderr.trim(), "git stash failed"),
            Err(e) => tracing::warn!(task_id = %item.id, error = %e, "git stash failed"),
        }
    }
}

/// Subject line (and body) for a completed item.
pub fn commit_message(item: &WorkItem, style: CommitStyle) -> String {
    let subject = match style {
        CommitStyle::Conventional => format!("{}: {}", item.work_type.commit_prefix(), item.title),
        CommitStyle::Plain => item.title.clone(),
    };
    if item.description.trim().is_empty() {
        subject
    } else {
        format!("{}\n\n{}", subject, item.description.trim())
    }
}

/// `anvil/<short-id>-<slug>`
pub fn branch_name(item: &WorkItem) -> String {
    let slug = slugify(&item.title, 40);
    if slug.is_empty() {
        format!("anvil/{}", item.short_id())
    } else {
        format!("anvil/{}-{}", item.short_id(), slug)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::testing::FakeDiffProvider;
    use crate::failure::FailurePolicies;
    use crate::gate::{GateToggles, testing::gate};
    use crate::queue::{NewWorkItem, WorkStatus, WorkType};
    use crate::shell::testing::FakeShell;
    use crate::truth::TruthMode;

    const GREEN: &str = "3 runs, 5 assertions, 0 failures, 0 errors, 0 skips";
    const RED: &str = "3 runs, 5 assertions, 2 failures, 0 errors, 0 skips";

    struct Fixture {
        _dir: tempfile::TempDir,
        queue: QueueHandle,
        evidence: EvidenceStore,
        vcs: Arc<FakeDiffProvider>,
        shell: Arc<FakeShell>,
        orch: Orchestrator,
    }

    fn fixture(shell: FakeShell, files: Vec<ChangedFile>, profile: WorkflowProfile, policies: FailurePolicies) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let queue = QueueHandle::in_memory().unwrap();
        let evidence = EvidenceStore::in_memory().unwrap();
        let shell = Arc::new(shell);
        let vcs = Arc::new(FakeDiffProvider::with_files(files));
        let g = gate(
            dir.path(),
            shell.clone(),
            evidence.clone(),
            GateToggles::default(),
            TruthMode::Strict,
            policies,
        );
        let orch = Orchestrator::new(
            queue.clone(),
            Arc::new(g),
            vcs.clone(),
            shell.clone(),
            evidence.clone(),
            profile,
        );
        Fixture {
            _dir: dir,
            queue,
            evidence,
            vcs,
            shell,
            orch,
        }
    }

    fn file(path: &str) -> ChangedFile {
        ChangedFile {
            path: path.into(),
            lines_added: 4,
            lines_removed: 1,
            added_lines: vec![(1, "redirect_to dashboard_path".into())],
        }
    }

    async fn claimed(queue: &QueueHandle, max_attempts: u32) -> WorkItem {
        queue
            .push(
                NewWorkItem::new("Fix login redirect", WorkType::BugFix, 4)
                    .with_expected_files(["app/controllers/sessions_controller.rb"])
                    .with_max_attempts(max_attempts),
            )
            .await
            .unwrap();
        queue.claim_next().await.unwrap().unwrap()
    }

    fn success(claims: &[&str]) -> AgentOutcome {
        AgentOutcome {
            success: true,
            claims: claims.iter().map(|c| c.to_string()).collect(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_passing_gates_commit_directly_with_footer() {
        let f = fixture(
            FakeShell::new().on("rake test", 0, GREEN),
            vec![file("app/controllers/sessions_controller.rb")],
            WorkflowProfile::direct(),
            FailurePolicies::default(),
        );
        let item = claimed(&f.queue, 3).await;
        let outcome = f.orch.complete_execution(&item, success(&["All tests pass"])).await.unwrap();

        let TaskOutcome::Completed { commit_sha, branch, .. } = outcome else {
            panic!("expected completion");
        };
        assert!(branch.is_none());
        let stored = f.queue.view(item.id).await.unwrap().unwrap();
        assert_eq!(stored.status, WorkStatus::Completed);
        assert_eq!(stored.commit_sha.as_deref(), Some(commit_sha.as_str()));

        let commits = f.vcs.commits.lock().unwrap();
        assert!(commits[0].starts_with("fix: Fix login redirect\n\n"));
        assert!(commits[0].contains(&format!("Anvil-Task: {}", item.id)));
        assert!(f.vcs.branches.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_pull_request_strategy_branches_pushes_and_opens_pr() {
        let f = fixture(
            FakeShell::new()
                .on("rake test", 0, GREEN)
                .on("git push", 0, "")
                .on("gh pr create", 0, "https://github.com/acme/app/pull/7\n")
                .on("git checkout", 0, ""),
            vec![file("app/controllers/sessions_controller.rb")],
            WorkflowProfile::pull_request(),
            FailurePolicies::default(),
        );
        let item = claimed(&f.queue, 3).await;
        let outcome = f.orch.complete_execution(&item, success(&[])).await.unwrap();

        let expected_branch = format!("anvil/{}-fix-login-redirect", item.short_id());
        match outcome {
            TaskOutcome::Completed { branch, pr_url, .. } => {
                assert_eq!(branch.as_deref(), Some(expected_branch.as_str()));
                assert_eq!(pr_url.as_deref(), Some("https://github.com/acme/app/pull/7"));
            }
            other => panic!("expected completion, got {:?}", other),
        }
        assert_eq!(*f.vcs.branches.lock().unwrap(), vec![expected_branch.clone()]);
        assert!(f.shell.called(&format!("git push -u 'origin' '{}'", expected_branch)));
        assert!(f.shell.called("git checkout 'main'"));
    }

    #[tokio::test]
    async fn test_gate_failure_requeues_with_retry_context() {
        let f = fixture(
            FakeShell::new().on("rake test", 1, RED).on("git stash", 0, ""),
            vec![file("app/controllers/sessions_controller.rb")],
            WorkflowProfile::direct(),
            FailurePolicies::default(),
        );
        let item = claimed(&f.queue, 3).await;
        let outcome = f.orch.complete_execution(&item, success(&["All tests pass"])).await.unwrap();
        assert!(matches!(outcome, TaskOutcome::Requeued { .. }));

        let stored = f.queue.view(item.id).await.unwrap().unwrap();
        assert_eq!(stored.status, WorkStatus::Pending);
        assert_eq!(stored.attempts, 1);
        assert!(stored.retry_context.is_some());
        assert!(stored.failure_report.is_none());
        assert!(f.vcs.commits.lock().unwrap().is_empty());
        assert!(f.shell.called("git stash push"));
    }

    #[tokio::test]
    async fn test_exhausted_gate_fails_item_even_when_another_gate_would_retry() {
        let mut policies = FailurePolicies::default();
        policies.max_retries.insert(FailureType::Tests, 0);
        let f = fixture(
            FakeShell::new().on("rake test", 1, RED).on("git stash", 0, ""),
            vec![
                file("app/controllers/sessions_controller.rb"),
                file("config/secrets.yml"),
            ],
            WorkflowProfile::direct(),
            policies,
        );
        let item = claimed(&f.queue, 3).await;
        let outcome = f.orch.complete_execution(&item, success(&[])).await.unwrap();

        let TaskOutcome::Failed { report_path, reason } = outcome else {
            panic!("expected failure");
        };
        assert!(reason.contains("tests:"));
        assert!(reason.contains("config/secrets.yml"));
        let report_path = report_path.unwrap();
        assert!(report_path.display().to_string().ends_with("-tests.json"));
        assert!(report_path.exists());

        let stored = f.queue.view(item.id).await.unwrap().unwrap();
        assert_eq!(stored.status, WorkStatus::Failed);
        assert_eq!(stored.failure_report.as_deref(), Some(report_path.display().to_string().as_str()));
        assert!(f.vcs.commits.lock().unwrap().is_empty());
        assert!(f.shell.called("git stash push"));
    }

    #[tokio::test]
    async fn test_rejected_commit_is_a_task_scoped_error() {
        let f = fixture(
            FakeShell::new().on("rake test", 0, GREEN).on("git stash", 0, ""),
            vec![file("app/controllers/sessions_controller.rb")],
            WorkflowProfile::direct(),
            FailurePolicies::default(),
        );
        let orch = Orchestrator::new(
            f.queue.clone(),
            f.orch.gate.clone(),
            Arc::new(FakeDiffProvider {
                reject_commits: true,
                ..FakeDiffProvider::with_files(vec![file("app/controllers/sessions_controller.rb")])
            }),
            f.shell.clone(),
            f.evidence.clone(),
            WorkflowProfile::direct(),
        );
        let item = claimed(&f.queue, 3).await;
        let err = orch.complete_execution(&item, success(&[])).await.unwrap_err();
        assert!(matches!(err, WorkflowError::Vcs(_)));
        assert!(err.is_task_scoped());

        let outcome = orch.route_error(&item, &err).await.unwrap();
        assert!(matches!(outcome, TaskOutcome::Requeued { .. }));
        let stored = f.queue.view(item.id).await.unwrap().unwrap();
        assert_eq!(stored.status, WorkStatus::Pending);
        assert!(stored.retry_context.unwrap().contains("pre-commit hook"));
        let failures = f.evidence.query(item.id, Some(EvidenceKind::Failure)).await.unwrap();
        assert_eq!(failures[0].payload["failure_type"], "infrastructure");
    }

    #[tokio::test]
    async fn test_agent_failure_skips_gates() {
        let f = fixture(
            FakeShell::new().on("rake test", 0, GREEN),
            vec![],
            WorkflowProfile::direct(),
            FailurePolicies::default(),
        );
        let item = claimed(&f.queue, 3).await;
        let outcome = f
            .orch
            .complete_execution(&item, AgentOutcome::failed("", "could not find file"))
            .await
            .unwrap();
        assert!(matches!(outcome, TaskOutcome::Requeued { .. }));
        assert!(!f.shell.called("rake test"));

        let failures = f.evidence.query(item.id, Some(EvidenceKind::Failure)).await.unwrap();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].payload["failure_type"], "agent");
    }

    #[tokio::test]
    async fn test_exhausted_policy_fails_item_with_report_and_issue() {
        let mut policies = FailurePolicies::default();
        policies.max_retries.insert(FailureType::Timeout, 0);
        let mut profile = WorkflowProfile::direct();
        profile.auto_create_issues = true;
        let f = fixture(
            FakeShell::new().on("gh issue create", 0, "https://github.com/acme/app/issues/9"),
            vec![],
            profile,
            policies,
        );
        let item = claimed(&f.queue, 3).await;
        let outcome = f
            .orch
            .complete_execution(
                &item,
                AgentOutcome {
                    timed_out: true,
                    ..AgentOutcome::failed("", "agent timed out after 1800s")
                },
            )
            .await
            .unwrap();

        let TaskOutcome::Failed { report_path, .. } = outcome else {
            panic!("expected failure");
        };
        let report_path = report_path.unwrap();
        assert!(report_path.exists());
        let stored = f.queue.view(item.id).await.unwrap().unwrap();
        assert_eq!(stored.status, WorkStatus::Failed);
        assert_eq!(stored.failure_report.as_deref(), Some(report_path.display().to_string().as_str()));
        assert!(f.shell.called("gh issue create --title 'anvil: Fix login redirect'"));
    }

    #[tokio::test]
    async fn test_queue_exhaustion_escalates_even_when_policy_would_retry() {
        let f = fixture(
            FakeShell::new().on("rake test", 1, RED),
            vec![file("app/controllers/sessions_controller.rb")],
            WorkflowProfile::direct(),
            FailurePolicies::default(),
        );
        let item = claimed(&f.queue, 1).await;
        let outcome = f.orch.complete_execution(&item, success(&[])).await.unwrap();
        let TaskOutcome::Failed { report_path, .. } = outcome else {
            panic!("expected failure");
        };
        assert!(report_path.unwrap().exists());
        assert_eq!(
            f.queue.view(item.id).await.unwrap().unwrap().status,
            WorkStatus::Failed
        );
    }

    #[test]
    fn test_commit_message_styles_and_branch_name() {
        let db = crate::queue::QueueDb::new_in_memory().unwrap();
        let id = db
            .push(&NewWorkItem::new("Document the API", WorkType::Documentation, 2).with_description("Cover /items"))
            .unwrap();
        let item = db.view(id).unwrap().unwrap();
        assert_eq!(
            commit_message(&item, CommitStyle::Conventional),
            "docs: Document the API\n\nCover /items"
        );
        assert!(commit_message(&item, CommitStyle::Plain).starts_with("Document the API\n"));
        assert_eq!(branch_name(&item), format!("anvil/{}-document-the-api", item.short_id()));
    }
}
