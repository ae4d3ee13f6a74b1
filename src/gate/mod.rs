//! Quality Gate Coordinator: one verdict per validation attempt.
//!
//! Enabled gates run sequentially in a fixed order (tests, criteria,
//! functional, truth, diff). A failing gate never stops the others, so the
//! result always carries the full picture. Every failing gate is handed to the
//! Failure Handler with its own failure type.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

use crate::criteria::CriteriaVerifier;
use crate::diff::{ChangedFile, DiffValidator};
use crate::evidence::{EvidenceKind, EvidenceReport, EvidenceStore};
use crate::failure::{FailureHandler, FailureType, RetryDecision};
use crate::functional::FunctionalVerifier;
use crate::queue::WorkItem;
use crate::testing::{TestExpectations, TestValidator};
use crate::truth::{TruthEnforcer, TruthMode};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateKind {
    Tests,
    Criteria,
    Functional,
    Truth,
    Diff,
}

impl GateKind {
    pub const ORDER: [GateKind; 5] = [
        GateKind::Tests,
        GateKind::Criteria,
        GateKind::Functional,
        GateKind::Truth,
        GateKind::Diff,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            GateKind::Tests => "tests",
            GateKind::Criteria => "criteria",
            GateKind::Functional => "functional",
            GateKind::Truth => "truth",
            GateKind::Diff => "diff",
        }
    }

    pub fn failure_type(&self) -> FailureType {
        match self {
            GateKind::Tests => FailureType::Tests,
            GateKind::Criteria => FailureType::Criteria,
            GateKind::Functional => FailureType::Functional,
            GateKind::Truth => FailureType::Truth,
            GateKind::Diff => FailureType::Diff,
        }
    }
}

impl std::fmt::Display for GateKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which gates run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateToggles {
    pub tests: bool,
    pub criteria: bool,
    pub functional: bool,
    pub truth: bool,
    pub diff: bool,
}

impl Default for GateToggles {
    fn default() -> Self {
        Self {
            tests: true,
            criteria: true,
            functional: true,
            truth: true,
            diff: true,
        }
    }
}

impl GateToggles {
    pub fn enabled(&self, gate: GateKind) -> bool {
        match gate {
            GateKind::Tests => self.tests,
            GateKind::Criteria => self.criteria,
            GateKind::Functional => self.functional,
            GateKind::Truth => self.truth,
            GateKind::Diff => self.diff,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateOutcome {
    pub gate: GateKind,
    pub passed: bool,
    pub summary: String,
}

/// Verdict of one validation attempt. `None` per-gate fields mean the gate is disabled.
///
/// `claims_proven` reports whether every claim was proven; in permissive mode
/// the truth gate still passes when it is false, and the unproven claims are
/// kept as caveats.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateResult {
    pub task_id: Uuid,
    pub can_complete: bool,
    pub tests_passed: Option<bool>,
    pub criteria_verified: Option<bool>,
    pub functional_verified: Option<bool>,
    pub claims_proven: Option<bool>,
    pub diff_valid: Option<bool>,
    pub reason: String,
    pub evidence_refs: Vec<i64>,
    pub warnings: Vec<String>,
    pub unproven_claims: Vec<String>,
    pub gates: Vec<GateOutcome>,
    pub evaluated_at: DateTime<Utc>,
}

impl GateResult {
    pub fn failed_gates(&self) -> Vec<GateKind> {
        self.gates.iter().filter(|g| !g.passed).map(|g| g.gate).collect()
    }
}

/// A gate result plus what the Failure Handler decided for each failing gate.
#[derive(Debug, Clone)]
pub struct GateEvaluation {
    pub result: GateResult,
    pub decisions: Vec<RetryDecision>,
}

impl GateEvaluation {
    /// Retry only if no failing gate has exhausted its budget.
    pub fn should_retry(&self) -> bool {
        !self.decisions.is_empty() && self.decisions.iter().all(|d| d.should_retry)
    }

    /// First escalation report written during this evaluation.
    pub fn report_path(&self) -> Option<&PathBuf> {
        self.decisions.iter().find_map(|d| d.report_path.as_ref())
    }

    pub fn retry_context(&self) -> Option<String> {
        self.decisions.iter().rev().find_map(|d| d.retry_context.clone())
    }
}

pub struct QualityGate {
    pub toggles: GateToggles,
    pub test_command: Option<String>,
    pub test_expectations: TestExpectations,
    pub tests: TestValidator,
    pub criteria: CriteriaVerifier,
    pub functional: FunctionalVerifier,
    pub truth: TruthEnforcer,
    pub diff: DiffValidator,
    pub failures: Arc<FailureHandler>,
    pub evidence: EvidenceStore,
}

impl QualityGate {
    pub async fn validate_before_commit(
        &self,
        task: &WorkItem,
        changed_files: &[ChangedFile],
        claims: &[String],
        justification: Option<&str>,
    ) -> Result<GateEvaluation> {
        // Claims are judged only against evidence produced by this evaluation.
        let watermark = self
            .evidence
            .query(task.id, None)
            .await?
            .last()
            .map(|e| e.id)
            .unwrap_or(0);

        let mut result = GateResult {
            task_id: task.id,
            can_complete: true,
            tests_passed: None,
            criteria_verified: None,
            functional_verified: None,
            claims_proven: None,
            diff_valid: None,
            reason: String::new(),
            evidence_refs: Vec::new(),
            warnings: Vec::new(),
            unproven_claims: Vec::new(),
            gates: Vec::new(),
            evaluated_at: Utc::now(),
        };

        for gate in GateKind::ORDER {
            if !self.toggles.enabled(gate) {
                continue;
            }
            tracing::debug!(task_id = %task.id, %gate, "running gate");
            let (passed, summary) = match gate {
                GateKind::Tests => {
                    let (passed, summary) = match &self.test_command {
                        Some(command) => {
                            let run = self.tests.run(task.id, command, &self.test_expectations).await?;
                            (run.passed, run.summary())
                        }
                        None => (false, "no test command configured".to_string()),
                    };
                    result.tests_passed = Some(passed);
                    (passed, summary)
                }
                GateKind::Criteria => {
                    let report = self.criteria.verify(task.id, &task.success_criteria).await?;
                    result.criteria_verified = Some(report.all_passed);
                    let summary = if report.all_passed {
                        format!("{} criteria met", report.results.len())
                    } else {
                        report.failures().map(|r| r.detail.clone()).collect::<Vec<_>>().join(", ")
                    };
                    (report.all_passed, summary)
                }
                GateKind::Functional => {
                    let report = self.functional.verify(task.id, &task.functional_verifications).await?;
                    result.functional_verified = Some(report.all_passed);
                    let summary = if report.all_passed {
                        format!("{} live checks passed", report.results.len())
                    } else {
                        report
                            .results
                            .iter()
                            .filter(|r| !r.passed())
                            .map(|r| r.detail.clone())
                            .collect::<Vec<_>>()
                            .join(", ")
                    };
                    (report.all_passed, summary)
                }
                GateKind::Truth => {
                    let fresh: Vec<_> = self
                        .evidence
                        .query(task.id, None)
                        .await?
                        .into_iter()
                        .filter(|e| e.id > watermark)
                        .collect();
                    let report = self.truth.enforce(claims, &fresh);
                    self.evidence
                        .record(
                            task.id,
                            EvidenceKind::ClaimCheck,
                            json!({
                                "passed": !report.blocks(),
                                "mode": report.mode,
                                "all_proven": report.all_proven,
                                "proven": report.proven,
                                "unproven": report.unproven_claims,
                                "unmatched": report.unmatched,
                            }),
                            None,
                        )
                        .await?;
                    result.claims_proven = Some(report.all_proven);
                    result.unproven_claims = report.unproven_claims.iter().map(|u| u.claim.clone()).collect();
                    if report.mode == TruthMode::Permissive {
                        for u in &report.unproven_claims {
                            result.warnings.push(format!("unproven claim: {}", u.claim));
                        }
                    }
                    let summary = if report.all_proven {
                        format!("{} claim(s) proven", report.proven.len())
                    } else {
                        let listed: Vec<String> = report
                            .unproven_claims
                            .iter()
                            .map(|u| format!("\"{}\" ({})", u.claim, u.reason))
                            .collect();
                        format!("unproven claims: {}", listed.join(", "))
                    };
                    (!report.blocks(), summary)
                }
                GateKind::Diff => {
                    let report = self.diff.validate(changed_files, task.expected_files.as_ref(), justification);
                    self.evidence
                        .record(
                            task.id,
                            EvidenceKind::Diff,
                            json!({
                                "passed": report.valid,
                                "files": report.files,
                                "total_lines": report.total_lines,
                                "unexpected_files": report.unexpected_files,
                                "violations": report.violations,
                                "warnings": report.warnings,
                                "reason": report.reason,
                            }),
                            None,
                        )
                        .await?;
                    result.diff_valid = Some(report.valid);
                    result.warnings.extend(report.warnings.iter().cloned());
                    (report.valid, report.reason.clone())
                }
            };

            if passed {
                tracing::info!(task_id = %task.id, %gate, %summary, "gate passed");
            } else {
                tracing::warn!(task_id = %task.id, %gate, %summary, "gate failed");
            }
            result.gates.push(GateOutcome { gate, passed, summary });
        }

        result.can_complete = result.gates.iter().all(|g| g.passed);
        let failed: Vec<&GateOutcome> = result.gates.iter().filter(|g| !g.passed).collect();
        result.reason = if failed.is_empty() {
            "all gates passed".to_string()
        } else {
            failed
                .iter()
                .map(|g| format!("{}: {}", g.gate, g.summary))
                .collect::<Vec<_>>()
                .join("; ")
        };

        let mut decisions = Vec::new();
        for outcome in &failed {
            let failure_type = outcome.gate.failure_type();
            let attempt = self.failures.next_attempt(task.id, failure_type).await?;
            decisions.push(
                self.failures
                    .handle(task, failure_type, attempt, &format!("{}: {}", outcome.gate, outcome.summary))
                    .await?,
            );
        }

        result.evidence_refs = self
            .evidence
            .query(task.id, None)
            .await?
            .iter()
            .filter(|e| e.id > watermark)
            .map(|e| e.id)
            .collect();

        tracing::info!(task_id = %task.id, can_complete = result.can_complete, reason = %result.reason, "gate evaluation complete");
        Ok(GateEvaluation { result, decisions })
    }
}

/// Commit-message footer tying a commit to the evidence behind it.
pub fn commit_footer(result: &GateResult, evidence: &EvidenceReport) -> String {
    let mut lines = vec![format!("Anvil-Task: {}", result.task_id)];

    let gates: Vec<String> = GateKind::ORDER
        .iter()
        .map(|g| {
            let state = match result.gates.iter().find(|o| o.gate == *g) {
                Some(o) if o.passed => "pass",
                Some(_) => "fail",
                None => "off",
            };
            format!("{}={}", g, state)
        })
        .collect();
    lines.push(format!("Anvil-Gates: {}", gates.join(" ")));

    for summary in evidence.summary_lines() {
        lines.push(format!("Anvil-Evidence: {}", summary));
    }
    if !result.evidence_refs.is_empty() {
        let ids: Vec<String> = result.evidence_refs.iter().map(|id| id.to_string()).collect();
        lines.push(format!("Anvil-Evidence-Refs: {}", ids.join(",")));
    }
    for claim in &result.unproven_claims {
        lines.push(format!("Anvil-Caveat: unproven claim \"{}\"", claim));
    }
    for warning in result.warnings.iter().filter(|w| !w.starts_with("unproven claim")) {
        lines.push(format!("Anvil-Warning: {}", warning));
    }
    lines.join("\n")
}


#[cfg(test)]
mod tests {
    use super::testing::gate;
    use super::*;
    use crate::criteria::Criterion;
    use crate::failure::FailurePolicies;
    use crate::queue::{NewWorkItem, QueueDb, WorkType};
    use crate::shell::testing::FakeShell;

    const GREEN: &str = "4 runs, 8 assertions, 0 failures, 0 errors, 0 skips";
    const RED: &str = "4 runs, 8 assertions, 1 failures, 0 errors, 0 skips";

    fn task(expected: &[&str], criteria: Vec<Criterion>) -> WorkItem {
        let db = QueueDb::new_in_memory().unwrap();
        let id = db
            .push(
                &NewWorkItem::new("Add user model", WorkType::Feature, 3)
                    .with_expected_files(expected.iter().copied())
                    .with_criteria(criteria),
            )
            .unwrap();
        db.view(id).unwrap().unwrap()
    }

    fn changed(path: &str) -> ChangedFile {
        ChangedFile {
            path: path.into(),
            lines_added: 3,
            lines_removed: 0,
            added_lines: vec![(1, "class User".into())],
        }
    }

    #[tokio::test]
    async fn test_all_gates_pass() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("user.rb"), "class User; end").unwrap();
        let store = EvidenceStore::in_memory().unwrap();
        let g = gate(
            dir.path(),
            Arc::new(FakeShell::new().on("rake test", 0, GREEN)),
            store.clone(),
            GateToggles::default(),
            TruthMode::Strict,
            FailurePolicies::default(),
        );
        let t = task(&["user.rb"], vec![Criterion::FileExists { path: "user.rb".into() }]);
        let eval = g
            .validate_before_commit(&t, &[changed("user.rb")], &["All tests pass".into()], None)
            .await
            .unwrap();

        let r = &eval.result;
        assert!(r.can_complete, "{}", r.reason);
        assert_eq!(r.reason, "all gates passed");
        assert_eq!(r.tests_passed, Some(true));
        assert_eq!(r.criteria_verified, Some(true));
        assert_eq!(r.functional_verified, Some(true));
        assert_eq!(r.claims_proven, Some(true));
        assert_eq!(r.diff_valid, Some(true));
        assert!(eval.decisions.is_empty());
        assert!(!r.evidence_refs.is_empty());
    }

    #[tokio::test]
    async fn test_failing_gate_does_not_stop_later_gates() {
        let dir = tempfile::tempdir().unwrap();
        let store = EvidenceStore::in_memory().unwrap();
        let g = gate(
            dir.path(),
            Arc::new(FakeShell::new().on("rake test", 1, RED)),
            store.clone(),
            GateToggles::default(),
            TruthMode::Strict,
            FailurePolicies::default(),
        );
        let t = task(&["user.rb"], vec![]);
        let eval = g
            .validate_before_commit(
                &t,
                &[changed("user.rb"), changed("config/routes.rb")],
                &["All tests pass".into()],
                None,
            )
            .await
            .unwrap();
        let r = &eval.result;
        assert!(!r.can_complete);
        assert_eq!(r.tests_passed, Some(false));
        assert_eq!(r.claims_proven, Some(false));
        assert_eq!(r.diff_valid, Some(false));
        assert_eq!(r.gates.len(), 5);
        assert_eq!(r.failed_gates(), vec![GateKind::Tests, GateKind::Truth, GateKind::Diff]);
        assert!(r.reason.contains("config/routes.rb"));

        // one handler decision per failing gate, all still retryable
        let types: Vec<_> = eval.decisions.iter().map(|d| d.failure_type).collect();
        assert_eq!(types, vec![FailureType::Tests, FailureType::Truth, FailureType::Diff]);
        assert!(eval.should_retry());
        assert!(eval.retry_context().is_some());
    }

    #[tokio::test]
    async fn test_disabled_gates_are_none_and_do_not_count() {
        let dir = tempfile::tempdir().unwrap();
        let g = gate(
            dir.path(),
            Arc::new(FakeShell::new().on("rake test", 1, RED)),
            EvidenceStore::in_memory().unwrap(),
            GateToggles {
                tests: false,
                truth: false,
                ..Default::default()
            },
            TruthMode::Strict,
            FailurePolicies::default(),
        );
        let t = task(&["user.rb"], vec![]);
        let eval = g
            .validate_before_commit(&t, &[changed("user.rb")], &["All tests pass".into()], None)
            .await
            .unwrap();
        assert!(eval.result.can_complete);
        assert_eq!(eval.result.tests_passed, None);
        assert_eq!(eval.result.claims_proven, None);
    }

    #[tokio::test]
    async fn test_permissive_truth_passes_with_caveat_in_footer() {
        let dir = tempfile::tempdir().unwrap();
        let store = EvidenceStore::in_memory().unwrap();
        let g = gate(
            dir.path(),
            Arc::new(FakeShell::new().on("rake test", 0, GREEN)),
            store.clone(),
            GateToggles::default(),
            TruthMode::Permissive,
            FailurePolicies::default(),
        );
        let t = task(&["user.rb"], vec![]);
        let eval = g
            .validate_before_commit(&t, &[changed("user.rb")], &["The endpoint returns 200".into()], None)
            .await
            .unwrap();
        let r = &eval.result;
        assert!(r.can_complete);
        assert_eq!(r.claims_proven, Some(false));
        assert_eq!(r.unproven_claims, vec!["The endpoint returns 200"]);

        let footer = commit_footer(r, &store.export_report(t.id).await.unwrap());
        assert!(footer.contains(&format!("Anvil-Task: {}", t.id)));
        assert!(footer.contains("Anvil-Gates: tests=pass criteria=pass functional=pass truth=pass diff=pass"));
        assert!(footer.contains("Anvil-Caveat: unproven claim \"The endpoint returns 200\""));
        assert!(footer.contains("Anvil-Evidence: test_run: 1 recorded (1 passed, 0 failed)"));
    }

    #[tokio::test]
    async fn test_missing_test_command_fails_closed() {
        let dir = tempfile::tempdir().unwrap();
        let mut g = gate(
            dir.path(),
            Arc::new(FakeShell::new()),
            EvidenceStore::in_memory().unwrap(),
            GateToggles::default(),
            TruthMode::Strict,
            FailurePolicies::default(),
        );
        g.test_command = None;
        let eval = g
            .validate_before_commit(&task(&[], vec![]), &[], &[], None)
            .await
            .unwrap();
        assert_eq!(eval.result.tests_passed, Some(false));
        assert!(eval.result.reason.contains("no test command configured"));
    }

    #[tokio::test]
    async fn test_claims_ignore_evidence_from_earlier_attempts() {
        let dir = tempfile::tempdir().unwrap();
        let store = EvidenceStore::in_memory().unwrap();
        let g = gate(
            dir.path(),
            Arc::new(FakeShell::new().on("rake test", 0, GREEN)),
            store.clone(),
            GateToggles {
                tests: false,
                ..Default::default()
            },
            TruthMode::Strict,
            FailurePolicies::default(),
        );
        let t = task(&[], vec![]);
        // green run from a previous attempt
        store
            .record(
                t.id,
                EvidenceKind::TestRun,
                json!({"passed": true, "failed": 0, "errors": 0, "timed_out": false}),
                None,
            )
            .await
            .unwrap();
        let eval = g
            .validate_before_commit(&t, &[], &["tests pass".into()], None)
            .await
            .unwrap();
        assert_eq!(eval.result.claims_proven, Some(false));
    }

    #[tokio::test]
    async fn test_diff_gate_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let g = gate(
            dir.path(),
            Arc::new(FakeShell::new()),
            EvidenceStore::in_memory().unwrap(),
            GateToggles {
                tests: false,
                criteria: false,
                functional: false,
                truth: false,
                diff: true,
            },
            TruthMode::Strict,
            FailurePolicies::default(),
        );
        let t = task(&["a.rb"], vec![]);
        let files = [changed("b.rb")];
        let first = g.validate_before_commit(&t, &files, &[], None).await.unwrap().result;
        let second = g.validate_before_commit(&t, &files, &[], None).await.unwrap().result;
        assert_eq!(first.diff_valid, second.diff_valid);
        assert_eq!(first.reason, second.reason);
        assert_eq!(first.gates, second.gates);
    }
}
