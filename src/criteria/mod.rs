//! Success Criteria Verifier.
//!
//! Criteria are declarative assertions attached to a work item. Each type has
//! one check function. Unknown types deserialize into [`Criterion::Unsupported`]
//! and always fail.

use anyhow::{Context, Result};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

use crate::errors::GateError;
use crate::evidence::{EvidenceKind, EvidenceStore};
use crate::testing::{TestExpectations, TestFramework, TestValidator};

/// Status codes `http_no_redirect` rejects when no explicit list is given.
pub const DEFAULT_REDIRECT_CODES: [u16; 5] = [301, 302, 303, 307, 308];

/// A typed success criterion.
///
/// On the wire a criterion is a flat object: `{"type": "http_status", "url": "...", "expected": 200}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawCriterion", into = "RawCriterion")]
pub enum Criterion {
    HttpStatus { url: String, expected: u16 },
    HttpNoRedirect { url: String, disallowed: Vec<u16> },
    TestSuite { command: String, framework: Option<TestFramework> },
    FileExists { path: String },
    StringInFile { path: String, needle: String },
    Unsupported { kind: String, raw: Value },
}

impl Criterion {
    pub fn kind(&self) -> &str {
        match self {
            Criterion::HttpStatus { .. } => "http_status",
            Criterion::HttpNoRedirect { .. } => "http_no_redirect",
            Criterion::TestSuite { .. } => "test_suite",
            Criterion::FileExists { .. } => "file_exists",
            Criterion::StringInFile { .. } => "string_in_file",
            Criterion::Unsupported { kind, .. } => kind.as_str(),
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Criterion::HttpStatus { url, expected } => format!("GET {} returns {}", url, expected),
            Criterion::HttpNoRedirect { url, .. } => format!("GET {} does not redirect", url),
            Criterion::TestSuite { command, .. } => format!("`{}` passes", command),
            Criterion::FileExists { path } => format!("{} exists", path),
            Criterion::StringInFile { path, needle } => format!("{} contains {:?}", path, needle),
            Criterion::Unsupported { kind, .. } => format!("unsupported criterion '{}'", kind),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawCriterion {
    #[serde(rename = "type")]
    kind: String,
    #[serde(flatten)]
    params: Map<String, Value>,
}

impl RawCriterion {
    fn string(&self, key: &str) -> Result<String, String> {
        self.params
            .get(key)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| format!("{} criterion requires string field '{}'", self.kind, key))
    }

    fn status(value: &Value) -> Option<u16> {
        value
            .as_u64()
            .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
            .and_then(|n| u16::try_from(n).ok())
    }
}

impl TryFrom<RawCriterion> for Criterion {
    type Error = String;

    fn try_from(raw: RawCriterion) -> Result<Self, Self::Error> {
        Ok(match raw.kind.as_str() {
            "http_status" => Criterion::HttpStatus {
                url: raw.string("url")?,
                expected: raw
                    .params
                    .get("expected")
                    .and_then(RawCriterion::status)
                    .ok_or("http_status criterion requires numeric 'expected'")?,
            },
            "http_no_redirect" => {
                let list = raw.params.get("disallowed").or_else(|| raw.params.get("expected"));
                let disallowed = match list {
                    None => DEFAULT_REDIRECT_CODES.to_vec(),
                    Some(Value::Array(items)) => items
                        .iter()
                        .map(|v| RawCriterion::status(v).ok_or("disallowed codes must be numbers"))
                        .collect::<Result<Vec<_>, _>>()?,
                    Some(_) => return Err("http_no_redirect 'disallowed' must be a list".into()),
                };
                Criterion::HttpNoRedirect {
                    url: raw.string("url")?,
                    disallowed,
                }
            }
            "test_suite" => Criterion::TestSuite {
                command: raw.string("command")?,
                framework: match raw.params.get("framework").and_then(Value::as_str) {
                    Some(name) => Some(name.parse()?),
                    None => None,
                },
            },
            "file_exists" => Criterion::FileExists {
                path: raw.string("path")?,
            },
            "string_in_file" => Criterion::StringInFile {
                path: raw.string("path")?,
                needle: raw.string("expected").or_else(|_| raw.string("needle"))?,
            },
            _ => Criterion::Unsupported {
                kind: raw.kind.clone(),
                raw: Value::Object(raw.params),
            },
        })
    }
}

impl From<Criterion> for RawCriterion {
    fn from(c: Criterion) -> Self {
        let kind = c.kind().to_string();
        let params = match c {
            Criterion::HttpStatus { url, expected } => json!({"url": url, "expected": expected}),
            Criterion::HttpNoRedirect { url, disallowed } => {
                json!({"url": url, "disallowed": disallowed})
            }
            Criterion::TestSuite { command, framework } => match framework {
                Some(f) => json!({"command": command, "framework": f}),
                None => json!({"command": command}),
            },
            Criterion::FileExists { path } => json!({"path": path}),
            Criterion::StringInFile { path, needle } => json!({"path": path, "expected": needle}),
            Criterion::Unsupported { raw, .. } => raw,
        };
        RawCriterion {
            kind,
            params: match params {
                Value::Object(map) => map,
                _ => Map::new(),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CriterionStatus {
    Passed,
    Failed,
    /// Unknown criterion type; counted as a failure.
    Unsupported,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CriterionResult {
    pub criterion: Criterion,
    pub status: CriterionStatus,
    /// Observed value (status code, file presence, test verdict).
    pub actual: Option<Value>,
    pub detail: String,
    pub evidence_id: Option<i64>,
}

impl CriterionResult {
    pub fn passed(&self) -> bool {
        self.status == CriterionStatus::Passed
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CriteriaReport {
    pub all_passed: bool,
    pub results: Vec<CriterionResult>,
}

impl CriteriaReport {
    pub fn failures(&self) -> impl Iterator<Item = &CriterionResult> {
        self.results.iter().filter(|r| !r.passed())
    }
}

pub struct CriteriaVerifier {
    project_dir: PathBuf,
    http: reqwest::Client,
    tests: TestValidator,
    test_expectations: TestExpectations,
    evidence: EvidenceStore,
}

impl CriteriaVerifier {
    pub fn new(
        project_dir: impl AsRef<Path>,
        tests: TestValidator,
        test_expectations: TestExpectations,
        evidence: EvidenceStore,
        http_timeout: Duration,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(http_timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            project_dir: project_dir.as_ref().to_path_buf(),
            http,
            tests,
            test_expectations,
            evidence,
        })
    }

    /// Evaluate every criterion. Results keep input order and are all present
    /// even when some fail.
    pub async fn verify(&self, task_id: Uuid, criteria: &[Criterion]) -> Result<CriteriaReport> {
        let checks = criteria.iter().map(|c| self.check(task_id, c));
        let mut results = Vec::with_capacity(criteria.len());
        for outcome in join_all(checks).await {
            let mut result = outcome;
            let payload = json!({
                "passed": result.passed(),
                "type": result.criterion.kind(),
                "criterion": result.criterion,
                "status": result.status,
                "actual": result.actual,
                "detail": result.detail,
            });
            result.evidence_id = Some(
                self.evidence
                    .record(task_id, EvidenceKind::Criterion, payload, None)
                    .await?,
            );
            results.push(result);
        }

        let all_passed = results.iter().all(CriterionResult::passed);
        tracing::info!(
            %task_id,
            total = results.len(),
            failed = results.iter().filter(|r| !r.passed()).count(),
            "success criteria evaluated"
        );
        Ok(CriteriaReport {
            all_passed,
            results,
        })
    }

    async fn check(&self, task_id: Uuid, criterion: &Criterion) -> CriterionResult {
        let (status, actual, detail) = match criterion {
            Criterion::HttpStatus { url, expected } => match self.fetch_status(url).await {
                Ok(code) if code == *expected => (CriterionStatus::Passed, Some(json!(code)), format!("{} returned {}", url, code)),
                Ok(code) => (
                    CriterionStatus::Failed,
                    Some(json!(code)),
                    format!("{} returned {}, expected {}", url, code, expected),
                ),
                Err(e) => (CriterionStatus::Failed, None, format!("request to {} failed: {:#}", url, e)),
            },
            Criterion::HttpNoRedirect { url, disallowed } => match self.fetch_status(url).await {
                Ok(code) if disallowed.contains(&code) => (
                    CriterionStatus::Failed,
                    Some(json!(code)),
                    format!("{} redirected with {}", url, code),
                ),
                Ok(code) => (CriterionStatus::Passed, Some(json!(code)), format!("{} returned {}", url, code)),
                Err(e) => (CriterionStatus::Failed, None, format!("request to {} failed: {:#}", url, e)),
            },
            Criterion::TestSuite { command, framework } => {
                let mut expectations = self.test_expectations.clone();
                if let Some(f) = framework {
                    expectations.framework = *f;
                }
                match self.tests.run(task_id, command, &expectations).await {
                    Ok(r) => (
                        if r.passed { CriterionStatus::Passed } else { CriterionStatus::Failed },
                        Some(json!(r.passed)),
                        r.summary(),
                    ),
                    Err(e) => (CriterionStatus::Failed, None, format!("failed to run `{}`: {:#}", command, e)),
                }
            }
            Criterion::FileExists { path } => {
                let exists = self.resolve(path).exists();
                (
                    if exists { CriterionStatus::Passed } else { CriterionStatus::Failed },
                    Some(json!(exists)),
                    format!("{} {}", path, if exists { "exists" } else { "does not exist" }),
                )
            }
            Criterion::StringInFile { path, needle } => {
                match tokio::fs::read_to_string(self.resolve(path)).await {
                    Ok(content) => {
                        let found = content.contains(needle.as_str());
                        (
                            if found { CriterionStatus::Passed } else { CriterionStatus::Failed },
                            Some(json!(found)),
                            format!("{:?} {} in {}", needle, if found { "found" } else { "not found" }, path),
                        )
                    }
                    Err(e) => (CriterionStatus::Failed, None, format!("cannot read {}: {}", path, e)),
                }
            }
            Criterion::Unsupported { kind, .. } => {
                let err = GateError::UnsupportedCriterion { kind: kind.clone() };
                tracing::error!(%task_id, kind = %kind, "{}", err);
                (CriterionStatus::Unsupported, None, err.to_string())
            }
        };

        CriterionResult {
            criterion: criterion.clone(),
            status,
            actual,
            detail,
            evidence_id: None,
        }
    }

    async fn fetch_status(&self, url: &str) -> Result<u16> {
        let resp = self
            .http
            .get(url)
            .send()
            .await
            .with_context(|| format!("GET {}", url))?;
        Ok(resp.status().as_u16())
    }

    fn resolve(&self, path: &str) -> PathBuf {
        let p = Path::new(path);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.project_dir.join(p)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shell::testing::FakeShell;
    use axum::{Router, http::StatusCode, response::Redirect, routing::get};
    use std::sync::Arc;

    async fn serve() -> String {
        let app = Router::new()
            .route("/ok", get(|| async { "ok" }))
            .route("/missing", get(|| async { StatusCode::NOT_FOUND }))
            .route("/moved", get(|| async { Redirect::permanent("/ok") }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn verifier(dir: &Path, shell: FakeShell) -> (CriteriaVerifier, EvidenceStore) {
        let store = EvidenceStore::in_memory().unwrap();
        let tests = TestValidator::new(Arc::new(shell), store.clone());
        let v = CriteriaVerifier::new(
            dir,
            tests,
            TestExpectations::default(),
            store.clone(),
            Duration::from_secs(5),
        )
        .unwrap();
        (v, store)
    }

    #[test]
    fn test_wire_form_round_trips() {
        let raw = r#"[
            {"type": "http_status", "url": "http://localhost/health", "expected": 200},
            {"type": "http_no_redirect", "url": "http://localhost/login"},
            {"type": "test_suite", "command": "bundle exec rspec", "framework": "rspec"},
            {"type": "file_exists", "path": "app/models/user.rb"},
            {"type": "string_in_file", "path": "README.md", "expected": "Usage"}
        ]"#;
        let parsed: Vec<Criterion> = serde_json::from_str(raw).unwrap();
        assert_eq!(
            parsed[0],
            Criterion::HttpStatus {
                url: "http://localhost/health".into(),
                expected: 200
            }
        );
        assert_eq!(
            parsed[1],
            Criterion::HttpNoRedirect {
                url: "http://localhost/login".into(),
                disallowed: DEFAULT_REDIRECT_CODES.to_vec()
            }
        );
        let again: Vec<Criterion> =
            serde_json::from_str(&serde_json::to_string(&parsed).unwrap()).unwrap();
        assert_eq!(parsed, again);
    }

    #[test]
    fn test_unknown_type_becomes_unsupported() {
        let c: Criterion =
            serde_json::from_str(r#"{"type": "screenshot_matches", "path": "a.png"}"#).unwrap();
        assert_eq!(c.kind(), "screenshot_matches");
        assert!(matches!(c, Criterion::Unsupported { .. }));
    }

    #[test]
    fn test_known_type_with_missing_params_is_rejected() {
        let err = serde_json::from_str::<Criterion>(r#"{"type": "http_status", "url": "x"}"#);
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn test_http_status_404_fails_with_actual_code() {
        let base = serve().await;
        let dir = tempfile::tempdir().unwrap();
        let (v, _) = verifier(dir.path(), FakeShell::new());
        let report = v
            .verify(
                Uuid::new_v4(),
                &[Criterion::HttpStatus {
                    url: format!("{}/missing", base),
                    expected: 200,
                }],
            )
            .await
            .unwrap();
        assert!(!report.all_passed);
        assert_eq!(report.results.len(), 1);
        assert_eq!(report.results[0].actual, Some(json!(404)));
    }

    #[tokio::test]
    async fn test_redirects_are_not_followed() {
        let base = serve().await;
        let dir = tempfile::tempdir().unwrap();
        let (v, _) = verifier(dir.path(), FakeShell::new());
        let report = v
            .verify(
                Uuid::new_v4(),
                &[
                    Criterion::HttpNoRedirect {
                        url: format!("{}/moved", base),
                        disallowed: DEFAULT_REDIRECT_CODES.to_vec(),
                    },
                    Criterion::HttpNoRedirect {
                        url: format!("{}/ok", base),
                        disallowed: DEFAULT_REDIRECT_CODES.to_vec(),
                    },
                    Criterion::HttpStatus {
                        url: format!("{}/moved", base),
                        expected: 308,
                    },
                ],
            )
            .await
            .unwrap();
        let statuses: Vec<_> = report.results.iter().map(|r| r.status).collect();
        assert_eq!(
            statuses,
            vec![
                CriterionStatus::Failed,
                CriterionStatus::Passed,
                CriterionStatus::Passed
            ]
        );
    }

    #[tokio::test]
    async fn test_all_results_returned_in_order_and_recorded() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("README.md"), "## Usage\nrun it").unwrap();
        let shell = FakeShell::new().on("rake test", 0, "3 runs, 3 assertions, 0 failures, 0 errors, 0 skips");
        let (v, store) = verifier(dir.path(), shell);
        let task = Uuid::new_v4();
        let criteria = vec![
            Criterion::FileExists {
                path: "missing.rb".into(),
            },
            Criterion::Unsupported {
                kind: "browser".into(),
                raw: json!({}),
            },
            Criterion::StringInFile {
                path: "README.md".into(),
                needle: "Usage".into(),
            },
            Criterion::TestSuite {
                command: "rake test".into(),
                framework: None,
            },
        ];
        let report = v.verify(task, &criteria).await.unwrap();

        assert!(!report.all_passed);
        assert_eq!(report.results.len(), 4);
        let kinds: Vec<_> = report.results.iter().map(|r| r.criterion.kind().to_string()).collect();
        assert_eq!(kinds, vec!["file_exists", "browser", "string_in_file", "test_suite"]);
        assert_eq!(report.results[0].status, CriterionStatus::Failed);
        assert_eq!(report.results[1].status, CriterionStatus::Unsupported);
        assert!(report.results[2].passed());
        assert!(report.results[3].passed());
        assert_eq!(report.failures().count(), 2);

        let recorded = store.query(task, Some(EvidenceKind::Criterion)).await.unwrap();
        assert_eq!(recorded.len(), 4);
        // test_suite delegates to the test validator, which records its own run.
        assert_eq!(store.query(task, Some(EvidenceKind::TestRun)).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_empty_criteria_pass() {
        let dir = tempfile::tempdir().unwrap();
        let (v, _) = verifier(dir.path(), FakeShell::new());
        let report = v.verify(Uuid::new_v4(), &[]).await.unwrap();
        assert!(report.all_passed);
        assert!(report.results.is_empty());
    }
}
