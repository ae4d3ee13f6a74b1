//! Test Execution Validator: runs a test command and turns its output into a verdict.
//!
//! Every run is recorded as `test_run` evidence, passing or not.

pub mod parsers;

pub use parsers::{TestCounts, TestFramework, TestOutputParser};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::evidence::{EvidenceKind, EvidenceStore};
use crate::shell::{ShellRunner, duration_ms};

/// What a test run must show to count as passing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestExpectations {
    pub framework: TestFramework,
    pub allow_pending: bool,
    pub allow_skipped: bool,
    #[serde(with = "duration_ms")]
    pub timeout: Duration,
}

impl Default for TestExpectations {
    fn default() -> Self {
        Self {
            framework: TestFramework::default(),
            allow_pending: true,
            allow_skipped: true,
            timeout: Duration::from_secs(600),
        }
    }
}

/// Outcome of one test command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestResult {
    pub command: String,
    pub framework: TestFramework,
    pub exit_code: i32,
    pub passed_count: u32,
    pub failed_count: u32,
    pub error_count: u32,
    pub pending_count: u32,
    pub skipped_count: u32,
    #[serde(with = "duration_ms")]
    pub duration: Duration,
    pub raw_output: String,
    pub timed_out: bool,
    /// False when no framework summary was found in the output.
    pub parsed: bool,
    pub passed: bool,
    pub evidence_id: Option<i64>,
}

impl TestResult {
    /// One-line description used in gate reasons and retry context.
    pub fn summary(&self) -> String {
        if self.timed_out {
            return format!("`{}` timed out after {:.1}s", self.command, self.duration.as_secs_f64());
        }
        format!(
            "`{}` exit {}: {} passed, {} failed, {} errors, {} pending, {} skipped",
            self.command,
            self.exit_code,
            self.passed_count,
            self.failed_count,
            self.error_count,
            self.pending_count,
            self.skipped_count
        )
    }
}

/// Apply the pass rule to parsed counts.
///
/// Pass iff no failures, no errors, pending/skipped only when allowed, and no timeout.
pub fn evaluate(counts: &TestCounts, expectations: &TestExpectations, timed_out: bool) -> bool {
    !timed_out
        && counts.failed == 0
        && counts.errors == 0
        && (expectations.allow_pending || counts.pending == 0)
        && (expectations.allow_skipped || counts.skipped == 0)
}

#[derive(Clone)]
pub struct TestValidator {
    shell: Arc<dyn ShellRunner>,
    evidence: EvidenceStore,
}

impl TestValidator {
    pub fn new(shell: Arc<dyn ShellRunner>, evidence: EvidenceStore) -> Self {
        Self { shell, evidence }
    }

    /// Run `command`, parse its output with the configured framework parser and
    /// record the result.
    pub async fn run(
        &self,
        task_id: Uuid,
        command: &str,
        expectations: &TestExpectations,
    ) -> Result<TestResult> {
        tracing::info!(%task_id, command, framework = %expectations.framework, "running tests");
        let output = self.shell.run(command, expectations.timeout).await?;
        let raw = output.combined();

        let parsed = expectations.framework.parser().parse(&raw);
        let mut counts = parsed.unwrap_or_default();
        if output.exit_code != 0 && !output.timed_out && counts.failed == 0 && counts.errors == 0 {
            // A failing exit with nothing to show for it is an error, never a pass.
            counts.errors += 1;
        }
        if parsed.is_none() {
            tracing::warn!(%task_id, command, framework = %expectations.framework, exit_code = output.exit_code,
                "no test summary found in output");
        }

        let passed = evaluate(&counts, expectations, output.timed_out);
        let mut result = TestResult {
            command: command.to_string(),
            framework: expectations.framework,
            exit_code: output.exit_code,
            passed_count: counts.passed,
            failed_count: counts.failed,
            error_count: counts.errors,
            pending_count: counts.pending,
            skipped_count: counts.skipped,
            duration: output.duration,
            raw_output: raw,
            timed_out: output.timed_out,
            parsed: parsed.is_some(),
            passed,
            evidence_id: None,
        };

        let payload = json!({
            "passed": result.passed,
            "command": result.command,
            "framework": result.framework,
            "exit_code": result.exit_code,
            "passed_count": result.passed_count,
            "failed": result.failed_count,
            "errors": result.error_count,
            "pending": result.pending_count,
            "skipped": result.skipped_count,
            "duration_ms": result.duration.as_millis() as u64,
            "timed_out": result.timed_out,
            "parsed": result.parsed,
        });
        result.evidence_id = Some(
            self.evidence
                .record(task_id, EvidenceKind::TestRun, payload, Some(result.raw_output.clone()))
                .await?,
        );

        if passed {
            tracing::info!(%task_id, summary = %result.summary(), "tests passed");
        } else {
            tracing::warn!(%task_id, summary = %result.summary(), "tests failed");
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shell::testing::FakeShell;

    fn validator(shell: FakeShell) -> (TestValidator, EvidenceStore) {
        let store = EvidenceStore::in_memory().unwrap();
        (TestValidator::new(Arc::new(shell), store.clone()), store)
    }

    fn rspec() -> TestExpectations {
        TestExpectations {
            framework: TestFramework::Rspec,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_pending_allowed_passes() {
        let shell = FakeShell::new().on("bundle exec rspec", 0, "10 examples, 0 failures, 3 pending");
        let (v, _) = validator(shell);
        let expectations = TestExpectations {
            allow_pending: true,
            ..rspec()
        };
        let result = v.run(Uuid::new_v4(), "bundle exec rspec", &expectations).await.unwrap();
        assert!(result.passed);
        assert_eq!(result.pending_count, 3);
        assert_eq!(result.failed_count, 0);
        assert_eq!(result.error_count, 0);
    }

    #[tokio::test]
    async fn test_pending_disallowed_fails() {
        let shell = FakeShell::new().on("rspec", 0, "10 examples, 0 failures, 3 pending");
        let (v, _) = validator(shell);
        let expectations = TestExpectations {
            allow_pending: false,
            ..rspec()
        };
        let result = v.run(Uuid::new_v4(), "rspec", &expectations).await.unwrap();
        assert!(!result.passed);
    }

    #[tokio::test]
    async fn test_failing_run_is_recorded_as_evidence() {
        let shell = FakeShell::new().on(
            "rake test",
            1,
            "5 runs, 9 assertions, 2 failures, 0 errors, 0 skips",
        );
        let (v, store) = validator(shell);
        let task = Uuid::new_v4();
        let result = v
            .run(task, "rake test", &TestExpectations::default())
            .await
            .unwrap();
        assert!(!result.passed);
        assert_eq!(result.failed_count, 2);

        let evidence = store.query(task, Some(EvidenceKind::TestRun)).await.unwrap();
        assert_eq!(evidence.len(), 1);
        assert_eq!(evidence[0].passed(), Some(false));
        assert_eq!(evidence[0].payload["failed"], 2);
        assert_eq!(Some(evidence[0].id), result.evidence_id);
        assert!(evidence[0].raw_output.as_deref().unwrap().contains("2 failures"));
    }

    #[tokio::test]
    async fn test_nonzero_exit_without_summary_fails_closed() {
        let shell = FakeShell::new().on("rspec", 2, "LoadError: cannot load such file");
        let (v, _) = validator(shell);
        let result = v.run(Uuid::new_v4(), "rspec", &rspec()).await.unwrap();
        assert!(!result.passed);
        assert!(!result.parsed);
        assert_eq!(result.error_count, 1);
    }

    #[tokio::test]
    async fn test_timeout_is_failure() {
        let shell = FakeShell::new().on_timeout("rspec");
        let (v, store) = validator(shell);
        let task = Uuid::new_v4();
        let result = v.run(task, "rspec", &rspec()).await.unwrap();
        assert!(result.timed_out);
        assert!(!result.passed);
        assert!(result.summary().contains("timed out"));
        assert_eq!(store.query(task, None).await.unwrap().len(), 1);
    }

    #[test]
    fn test_evaluate_rules() {
        let strict = TestExpectations {
            allow_pending: false,
            allow_skipped: false,
            ..Default::default()
        };
        let clean = TestCounts {
            passed: 4,
            ..Default::default()
        };
        assert!(evaluate(&clean, &strict, false));
        assert!(!evaluate(&clean, &strict, true));
        let skipped = TestCounts {
            skipped: 1,
            ..clean
        };
        assert!(!evaluate(&skipped, &strict, false));
        assert!(evaluate(&skipped, &TestExpectations::default(), false));
        let errored = TestCounts { errors: 1, ..clean };
        assert!(!evaluate(&errored, &TestExpectations::default(), false));
    }
}
