use std::collections::BTreeSet;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::criteria::Criterion;
use crate::errors::QueueError;
use crate::functional::Verification;

pub const MIN_PRIORITY: u8 = 1;
pub const MAX_PRIORITY: u8 = 5;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum WorkType {
    BugFix,
    Feature,
    Test,
    Refactor,
    Documentation,
}

impl WorkType {
    pub fn all() -> &'static [WorkType] {
        &[
            WorkType::BugFix,
            WorkType::Feature,
            WorkType::Test,
            WorkType::Refactor,
            WorkType::Documentation,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BugFix => "bug_fix",
            Self::Feature => "feature",
            Self::Test => "test",
            Self::Refactor => "refactor",
            Self::Documentation => "documentation",
        }
    }

    /// Conventional-commit prefix for this kind of change.
    pub fn commit_prefix(&self) -> &'static str {
        match self {
            Self::BugFix => "fix",
            Self::Feature => "feat",
            Self::Test => "test",
            Self::Refactor => "refactor",
            Self::Documentation => "docs",
        }
    }
}

impl std::fmt::Display for WorkType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkType {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bug_fix" | "bugfix" | "bug" => Ok(Self::BugFix),
            "feature" => Ok(Self::Feature),
            "test" => Ok(Self::Test),
            "refactor" => Ok(Self::Refactor),
            "documentation" | "docs" => Ok(Self::Documentation),
            _ => Err(QueueError::Validation(format!(
                "unknown work type '{}' (expected bug_fix, feature, test, refactor, documentation)",
                s
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum WorkStatus {
    Pending,
    Active,
    Completed,
    Failed,
}

impl WorkStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for WorkStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkStatus {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "active" => Ok(Self::Active),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(QueueError::Validation(format!("unknown status '{}'", s))),
        }
    }
}

/// Terminal outcome passed to `complete`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    Failed,
}

impl Outcome {
    pub fn status(&self) -> WorkStatus {
        match self {
            Outcome::Completed => WorkStatus::Completed,
            Outcome::Failed => WorkStatus::Failed,
        }
    }
}

/// A unit of discoverable work as stored in the queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: Uuid,
    pub title: String,
    pub description: String,
    pub work_type: WorkType,
    pub priority: u8,
    pub status: WorkStatus,
    pub source: String,
    pub attempts: u32,
    pub max_attempts: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub success_criteria: Vec<Criterion>,
    pub functional_verifications: Vec<Verification>,
    pub expected_files: Option<BTreeSet<String>>,
    /// Capability tags matched against pre-flight `required_for`.
    pub needs: BTreeSet<String>,
    pub commit_sha: Option<String>,
    pub failure_report: Option<String>,
    pub last_error: Option<String>,
    /// Failure context carried into the next attempt's agent input.
    pub retry_context: Option<String>,
}

impl WorkItem {
    /// 1-based number of the attempt currently running (or about to run).
    pub fn attempt_number(&self) -> u32 {
        self.attempts + 1
    }

    pub fn short_id(&self) -> String {
        self.id.simple().to_string()[..8].to_string()
    }
}

/// Input to `push`, as produced by a discovery source or manual entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewWorkItem {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "type")]
    pub work_type: String,
    #[serde(default = "default_priority")]
    pub priority: i64,
    #[serde(default = "default_source")]
    pub source: String,
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub success_criteria: Vec<Criterion>,
    #[serde(default)]
    pub functional_verifications: Vec<Verification>,
    #[serde(default)]
    pub expected_files: Option<BTreeSet<String>>,
    #[serde(default)]
    pub needs: BTreeSet<String>,
}

fn default_priority() -> i64 {
    3
}

fn default_source() -> String {
    "manual".to_string()
}

impl NewWorkItem {
    pub fn new(title: &str, work_type: WorkType, priority: i64) -> Self {
        Self {
            title: title.to_string(),
            description: String::new(),
            work_type: work_type.as_str().to_string(),
            priority,
            source: default_source(),
            max_attempts: None,
            success_criteria: Vec::new(),
            functional_verifications: Vec::new(),
            expected_files: None,
            needs: BTreeSet::new(),
        }
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    pub fn with_source(mut self, source: &str) -> Self {
        self.source = source.to_string();
        self
    }

    pub fn with_criteria(mut self, criteria: Vec<Criterion>) -> Self {
        self.success_criteria = criteria;
        self
    }

    pub fn with_verifications(mut self, verifications: Vec<Verification>) -> Self {
        self.functional_verifications = verifications;
        self
    }

    pub fn with_expected_files<I: IntoIterator<Item = S>, S: Into<String>>(mut self, files: I) -> Self {
        self.expected_files = Some(files.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn with_needs<I: IntoIterator<Item = S>, S: Into<String>>(mut self, needs: I) -> Self {
        self.needs = needs.into_iter().map(Into::into).collect();
        self
    }

    /// Check the fields `push` rejects, returning the parsed work type and priority.
    pub fn validate(&self) -> Result<(WorkType, u8), QueueError> {
        if self.title.trim().is_empty() {
            return Err(QueueError::Validation("title must not be empty".to_string()));
        }
        let work_type = WorkType::from_str(&self.work_type)?;
        if self.priority < MIN_PRIORITY as i64 || self.priority > MAX_PRIORITY as i64 {
            return Err(QueueError::Validation(format!(
                "priority {} out of range [{}, {}]",
                self.priority, MIN_PRIORITY, MAX_PRIORITY
            )));
        }
        if self.max_attempts == Some(0) {
            return Err(QueueError::Validation(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        Ok((work_type, self.priority as u8))
    }
}

/// Read-side filter for `list`. Empty filter matches everything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListFilter {
    #[serde(default)]
    pub status: Option<WorkStatus>,
    #[serde(default, rename = "type")]
    pub work_type: Option<WorkType>,
    #[serde(default)]
    pub min_priority: Option<u8>,
    #[serde(default)]
    pub max_priority: Option<u8>,
}

impl ListFilter {
    pub fn status(status: WorkStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }
}

/// Per-status counts for reporting.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueueCounts {
    pub pending: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
}
