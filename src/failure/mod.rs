//! Failure Handler: per-type retry policy and escalation reports.
//!
//! The handler never re-runs anything. It decides retry or escalate, hands the
//! caller a retry context for the next agent input, and on exhaustion writes a
//! JSON + Markdown report that cites every piece of evidence for the task.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::evidence::{Evidence, EvidenceKind, EvidenceStore};
use crate::queue::WorkItem;

/// Retry budget used for types without an explicit policy.
pub const DEFAULT_MAX_RETRIES: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureType {
    Preflight,
    Tests,
    Criteria,
    Functional,
    Truth,
    Diff,
    Agent,
    Timeout,
    /// Version control or gate tooling errored instead of giving a verdict.
    Infrastructure,
}

impl FailureType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureType::Preflight => "preflight",
            FailureType::Tests => "tests",
            FailureType::Criteria => "criteria",
            FailureType::Functional => "functional",
            FailureType::Truth => "truth",
            FailureType::Diff => "diff",
            FailureType::Agent => "agent",
            FailureType::Timeout => "timeout",
            FailureType::Infrastructure => "infrastructure",
        }
    }
}

impl std::fmt::Display for FailureType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-type retry budgets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailurePolicies {
    pub default_max_retries: u32,
    pub max_retries: BTreeMap<FailureType, u32>,
}

impl Default for FailurePolicies {
    fn default() -> Self {
        Self {
            default_max_retries: DEFAULT_MAX_RETRIES,
            // Environment problems are not something another attempt fixes.
            max_retries: BTreeMap::from([(FailureType::Preflight, 0)]),
        }
    }
}

impl FailurePolicies {
    pub fn max_retries(&self, failure_type: FailureType) -> u32 {
        self.max_retries
            .get(&failure_type)
            .copied()
            .unwrap_or(self.default_max_retries)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureReport {
    pub task_id: Uuid,
    pub title: String,
    pub failure_type: FailureType,
    pub reason: String,
    pub retry_count: u32,
    pub escalated: bool,
    pub evidence_refs: Vec<i64>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryDecision {
    pub failure_type: FailureType,
    pub should_retry: bool,
    pub attempt: u32,
    pub report_path: Option<PathBuf>,
    /// Summary of prior failures to append to the next agent input.
    pub retry_context: Option<String>,
}

pub struct FailureHandler {
    report_dir: PathBuf,
    policies: FailurePolicies,
    evidence: EvidenceStore,
}

impl FailureHandler {
    pub fn new(report_dir: impl AsRef<Path>, policies: FailurePolicies, evidence: EvidenceStore) -> Self {
        Self {
            report_dir: report_dir.as_ref().to_path_buf(),
            policies,
            evidence,
        }
    }

    pub fn policies(&self) -> &FailurePolicies {
        &self.policies
    }

    /// 1-based number of the next failure of this type for the task.
    pub async fn next_attempt(&self, task_id: Uuid, failure_type: FailureType) -> Result<u32> {
        let prior = self.evidence.query(task_id, Some(EvidenceKind::Failure)).await?;
        let count = prior
            .iter()
            .filter(|e| e.payload["failure_type"] == failure_type.as_str())
            .count() as u32;
        Ok(count + 1)
    }

    /// Decide retry or escalation for the `attempt`-th failure of this type.
    ///
    /// Retries while `attempt <= max_retries`; the failure after that escalates.
    pub async fn handle(
        &self,
        task: &WorkItem,
        failure_type: FailureType,
        attempt: u32,
        reason: &str,
    ) -> Result<RetryDecision> {
        let max_retries = self.policies.max_retries(failure_type);
        let should_retry = attempt <= max_retries;

        self.evidence
            .record(
                task.id,
                EvidenceKind::Failure,
                json!({
                    "passed": false,
                    "failure_type": failure_type,
                    "attempt": attempt,
                    "max_retries": max_retries,
                    "should_retry": should_retry,
                    "reason": reason,
                }),
                None,
            )
            .await?;

        if should_retry {
            tracing::info!(task_id = %task.id, %failure_type, attempt, max_retries, "failure will be retried");
            let history = self.evidence.query(task.id, Some(EvidenceKind::Failure)).await?;
            return Ok(RetryDecision {
                failure_type,
                should_retry: true,
                attempt,
                report_path: None,
                retry_context: Some(retry_context(&history)),
            });
        }

        let path = self.write_report(task, failure_type, attempt.saturating_sub(1), reason).await?;
        tracing::error!(task_id = %task.id, %failure_type, attempt, report = %path.display(), "retries exhausted, escalating");
        Ok(RetryDecision {
            failure_type,
            should_retry: false,
            attempt,
            report_path: Some(path),
            retry_context: None,
        })
    }

    /// Escalate without consulting the policy, e.g. when the queue has no attempts left.
    pub async fn escalate(&self, task: &WorkItem, failure_type: FailureType, reason: &str) -> Result<PathBuf> {
        self.write_report(task, failure_type, task.attempts, reason).await
    }

    pub fn report_path(&self, task_id: Uuid, failure_type: FailureType) -> PathBuf {
        self.report_dir.join(format!("{}-{}.json", task_id, failure_type))
    }

    async fn write_report(
        &self,
        task: &WorkItem,
        failure_type: FailureType,
        retry_count: u32,
        reason: &str,
    ) -> Result<PathBuf> {
        let json_path = self.report_path(task.id, failure_type);
        if json_path.exists() {
            return Ok(json_path);
        }

        let evidence = self.evidence.query(task.id, None).await?;
        let report = FailureReport {
            task_id: task.id,
            title: task.title.clone(),
            failure_type,
            reason: reason.to_string(),
            retry_count,
            escalated: true,
            evidence_refs: evidence.iter().map(|e| e.id).collect(),
            created_at: Utc::now(),
        };

        std::fs::create_dir_all(&self.report_dir)
            .with_context(|| format!("Failed to create {}", self.report_dir.display()))?;
        let body = serde_json::to_string_pretty(&report).context("Failed to serialize failure report")?;
        if !create_new(&json_path, &body)? {
            // Another worker won the race; its report stands.
            return Ok(json_path);
        }
        create_new(&json_path.with_extension("md"), &render_markdown(&report, &evidence))?;
        Ok(json_path)
    }
}

/// Write `content` only if `path` does not exist yet. Returns whether it wrote.
fn create_new(path: &Path, content: &str) -> Result<bool> {
    match std::fs::OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(mut file) => {
            file.write_all(content.as_bytes())
                .with_context(|| format!("Failed to write {}", path.display()))?;
            Ok(true)
        }
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(e).with_context(|| format!("Failed to create {}", path.display())),
    }
}

fn retry_context(history: &[Evidence]) -> String {
    let mut out = String::from("Previous attempts at this task failed quality gates:\n");
    for e in history {
        out.push_str(&format!(
            "- [{}] attempt {}: {}\n",
            e.payload["failure_type"].as_str().unwrap_or("unknown"),
            e.payload["attempt"],
            e.payload["reason"].as_str().unwrap_or("")
        ));
    }
    out.push_str("Address these failures before reporting success.\n");
    out
}

fn render_markdown(report: &FailureReport, evidence: &[Evidence]) -> String {
    let mut md = format!(
        "# Failure report: {}\n\n\
         - Task: `{}`\n\
         - Failure type: {}\n\
         - Retries used: {}\n\
         - Escalated: {}\n\
         - Created: {}\n\n\
         ## Reason\n\n{}\n\n\
         ## Evidence\n\n",
        report.title,
        report.task_id,
        report.failure_type,
        report.retry_count,
        report.escalated,
        report.created_at.to_rfc3339(),
        report.reason
    );
    if evidence.is_empty() {
        md.push_str("No evidence was recorded.\n");
    }
    for e in evidence {
        let verdict = match e.passed() {
            Some(true) => "passed",
            Some(false) => "failed",
            None => "-",
        };
        md.push_str(&format!(
            "- #{} `{}` {} ({})\n",
            e.id,
            e.kind,
            verdict,
            e.timestamp.to_rfc3339()
        ));
    }
    md
}
