//! Evidence Store: the append-only record of everything a validator observed.
//!
//! Validators never write files for proof; they call [`EvidenceStore::record`].
//! Records are never updated or deleted, and one task may collect many records
//! across retries. [`EvidenceReport`] aggregates them for audit tooling and
//! commit footers.

pub mod store;

pub use store::{EvidenceDb, EvidenceStore};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// What a piece of evidence proves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceKind {
    /// A test command run with parsed counts
    TestRun,
    /// An HTTP response captured by a live check
    HttpResponse,
    /// A TCP port probe
    PortCheck,
    /// One success-criterion evaluation
    Criterion,
    /// One pre-flight check outcome
    Preflight,
    /// Truth enforcement verdict over the agent's claims
    ClaimCheck,
    /// Diff validation verdict
    Diff,
    /// A gate failure or escalation
    Failure,
    /// Raw agent output for an attempt
    AgentOutput,
    /// A commit or pull request made for the task
    Commit,
}

impl EvidenceKind {
    pub fn all() -> &'static [EvidenceKind] {
        &[
            EvidenceKind::TestRun,
            EvidenceKind::HttpResponse,
            EvidenceKind::PortCheck,
            EvidenceKind::Criterion,
            EvidenceKind::Preflight,
            EvidenceKind::ClaimCheck,
            EvidenceKind::Diff,
            EvidenceKind::Failure,
            EvidenceKind::AgentOutput,
            EvidenceKind::Commit,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EvidenceKind::TestRun => "test_run",
            EvidenceKind::HttpResponse => "http_response",
            EvidenceKind::PortCheck => "port_check",
            EvidenceKind::Criterion => "criterion",
            EvidenceKind::Preflight => "preflight",
            EvidenceKind::ClaimCheck => "claim_check",
            EvidenceKind::Diff => "diff",
            EvidenceKind::Failure => "failure",
            EvidenceKind::AgentOutput => "agent_output",
            EvidenceKind::Commit => "commit",
        }
    }
}

impl std::fmt::Display for EvidenceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for EvidenceKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EvidenceKind::all()
            .iter()
            .find(|k| k.as_str() == s)
            .copied()
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "Invalid evidence kind '{}'. Valid values: {}",
                    s,
                    EvidenceKind::all()
                        .iter()
                        .map(|k| k.as_str())
                        .collect::<Vec<_>>()
                        .join(", ")
                )
            })
    }
}

/// One stored verification artifact.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Evidence {
    pub id: i64,
    pub task_id: Uuid,
    pub kind: EvidenceKind,
    pub timestamp: DateTime<Utc>,
    pub payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_output: Option<String>,
}

impl Evidence {
    /// Whether the payload reports a passing check (`"passed": true`).
    pub fn passed(&self) -> Option<bool> {
        self.payload.get("passed").and_then(|v| v.as_bool())
    }
}

/// Aggregated view of all evidence for a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidenceReport {
    pub task_id: Uuid,
    pub generated_at: DateTime<Utc>,
    pub total: usize,
    pub by_kind: BTreeMap<EvidenceKind, KindSummary>,
    pub first_recorded: Option<DateTime<Utc>>,
    pub last_recorded: Option<DateTime<Utc>>,
    pub entries: Vec<Evidence>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct KindSummary {
    pub count: usize,
    pub passed: usize,
    pub failed: usize,
}

impl EvidenceReport {
    pub fn from_entries(task_id: Uuid, entries: Vec<Evidence>) -> Self {
        let mut by_kind: BTreeMap<EvidenceKind, KindSummary> = BTreeMap::new();
        for e in &entries {
            let summary = by_kind.entry(e.kind).or_default();
            summary.count += 1;
            match e.passed() {
                Some(true) => summary.passed += 1,
                Some(false) => summary.failed += 1,
                None => {}
            }
        }
        Self {
            task_id,
            generated_at: Utc::now(),
            total: entries.len(),
            first_recorded: entries.iter().map(|e| e.timestamp).min(),
            last_recorded: entries.iter().map(|e| e.timestamp).max(),
            by_kind,
            entries,
        }
    }

    pub fn evidence_ids(&self) -> Vec<i64> {
        self.entries.iter().map(|e| e.id).collect()
    }

    /// One line per evidence kind, e.g. `test_run: 2 recorded (1 passed, 1 failed)`.
    pub fn summary_lines(&self) -> Vec<String> {
        self.by_kind
            .iter()
            .map(|(kind, s)| {
                if s.passed + s.failed > 0 {
                    format!(
                        "{}: {} recorded ({} passed, {} failed)",
                        kind, s.count, s.passed, s.failed
                    )
                } else {
                    format!("{}: {} recorded", kind, s.count)
                }
            })
            .collect()
    }
}
