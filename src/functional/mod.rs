//! Functional Verifier: live checks against the running system.

use anyhow::{Context, Result};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use uuid::Uuid;

use crate::errors::GateError;
use crate::evidence::{EvidenceKind, EvidenceStore};

pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_PORT_TIMEOUT: Duration = Duration::from_secs(1);

/// A typed live check. Wire form: `{"type": "http_request", "url": "...", ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawVerification", into = "RawVerification")]
pub enum Verification {
    HttpRequest {
        url: String,
        method: String,
        headers: BTreeMap<String, String>,
        expected_status: u16,
        timeout_secs: Option<u64>,
    },
    PortListening {
        host: String,
        port: u16,
    },
    /// Browser, DOM, database-state and any other kind nobody implemented.
    Unimplemented {
        kind: String,
    },
}

impl Verification {
    pub fn kind(&self) -> &str {
        match self {
            Verification::HttpRequest { .. } => "http_request",
            Verification::PortListening { .. } => "port_listening",
            Verification::Unimplemented { kind } => kind.as_str(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawVerification {
    #[serde(rename = "type")]
    kind: String,
    #[serde(flatten)]
    params: Map<String, Value>,
}

impl TryFrom<RawVerification> for Verification {
    type Error = String;

    fn try_from(raw: RawVerification) -> Result<Self, Self::Error> {
        let get_str = |key: &str| raw.params.get(key).and_then(Value::as_str).map(str::to_string);
        Ok(match raw.kind.as_str() {
            "http_request" => Verification::HttpRequest {
                url: get_str("url").ok_or("http_request requires 'url'")?,
                method: get_str("method").unwrap_or_else(|| "GET".to_string()).to_uppercase(),
                headers: match raw.params.get("headers") {
                    Some(v) => serde_json::from_value(v.clone())
                        .map_err(|e| format!("http_request 'headers': {}", e))?,
                    None => BTreeMap::new(),
                },
                expected_status: raw
                    .params
                    .get("expected_status")
                    .or_else(|| raw.params.get("expected"))
                    .and_then(Value::as_u64)
                    .map(u16::try_from)
                    .transpose()
                    .map_err(|_| "expected_status out of range")?
                    .unwrap_or(200),
                timeout_secs: raw.params.get("timeout_secs").and_then(Value::as_u64),
            },
            "port_listening" => Verification::PortListening {
                host: get_str("host").unwrap_or_else(|| "127.0.0.1".to_string()),
                port: raw
                    .params
                    .get("port")
                    .and_then(Value::as_u64)
                    .and_then(|p| u16::try_from(p).ok())
                    .ok_or("port_listening requires a valid 'port'")?,
            },
            other => Verification::Unimplemented {
                kind: other.to_string(),
            },
        })
    }
}

impl From<Verification> for RawVerification {
    fn from(v: Verification) -> Self {
        let kind = v.kind().to_string();
        let params = match v {
            Verification::HttpRequest {
                url,
                method,
                headers,
                expected_status,
                timeout_secs,
            } => {
                let mut p = json!({
                    "url": url,
                    "method": method,
                    "headers": headers,
                    "expected_status": expected_status,
                });
                if let Some(t) = timeout_secs {
                    p["timeout_secs"] = json!(t);
                }
                p
            }
            Verification::PortListening { host, port } => json!({"host": host, "port": port}),
            Verification::Unimplemented { .. } => json!({}),
        };
        RawVerification {
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
pub enum VerificationStatus {
    Passed,
    Failed,
    TimedOut,
    NotImplemented,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationResult {
    pub verification: Verification,
    pub status: VerificationStatus,
    pub actual_status: Option<u16>,
    pub latency_ms: Option<u64>,
    pub detail: String,
    pub evidence_id: Option<i64>,
}

impl VerificationResult {
    pub fn passed(&self) -> bool {
        self.status == VerificationStatus::Passed
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionalReport {
    pub all_passed: bool,
    pub results: Vec<VerificationResult>,
}

pub struct FunctionalVerifier {
    http: reqwest::Client,
    http_timeout: Duration,
    port_timeout: Duration,
    evidence: EvidenceStore,
}

impl FunctionalVerifier {
    pub fn new(evidence: EvidenceStore, http_timeout: Duration, port_timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            http,
            http_timeout,
            port_timeout,
            evidence,
        })
    }

    pub async fn verify(&self, task_id: Uuid, verifications: &[Verification]) -> Result<FunctionalReport> {
        let outcomes = join_all(verifications.iter().map(|v| self.check(task_id, v))).await;

        let mut results = Vec::with_capacity(outcomes.len());
        for mut result in outcomes {
            let kind = match result.verification {
                Verification::PortListening { .. } => EvidenceKind::PortCheck,
                _ => EvidenceKind::HttpResponse,
            };
            let payload = json!({
                "passed": result.passed(),
                "type": result.verification.kind(),
                "verification": result.verification,
                "status": result.status,
                "status_code": result.actual_status,
                "latency_ms": result.latency_ms,
                "detail": result.detail,
            });
            result.evidence_id = Some(self.evidence.record(task_id, kind, payload, None).await?);
            results.push(result);
        }

        Ok(FunctionalReport {
            all_passed: results.iter().all(VerificationResult::passed),
            results,
        })
    }

    async fn check(&self, task_id: Uuid, verification: &Verification) -> VerificationResult {
        let mut result = VerificationResult {
            verification: verification.clone(),
            status: VerificationStatus::Failed,
            actual_status: None,
            latency_ms: None,
            detail: String::new(),
            evidence_id: None,
        };

        match verification {
            Verification::HttpRequest {
                url,
                method,
                headers,
                expected_status,
                timeout_secs,
            } => {
                let limit = timeout_secs.map(Duration::from_secs).unwrap_or(self.http_timeout);
                let method = match reqwest::Method::from_bytes(method.as_bytes()) {
                    Ok(m) => m,
                    Err(_) => {
                        result.detail = format!("invalid HTTP method '{}'", method);
                        return result;
                    }
                };
                let mut request = self.http.request(method.clone(), url).timeout(limit);
                for (name, value) in headers {
                    request = request.header(name.as_str(), value.as_str());
                }

                let start = Instant::now();
                let response = request.send().await;
                result.latency_ms = Some(start.elapsed().as_millis() as u64);
                match response {
                    Ok(resp) => {
                        let code = resp.status().as_u16();
                        result.actual_status = Some(code);
                        if code == *expected_status {
                            result.status = VerificationStatus::Passed;
                            result.detail = format!("{} {} returned {}", method, url, code);
                        } else {
                            result.detail =
                                format!("{} {} returned {}, expected {}", method, url, code, expected_status);
                        }
                    }
                    Err(e) if e.is_timeout() => {
                        result.status = VerificationStatus::TimedOut;
                        result.detail = format!("{} {} timed out after {}s", method, url, limit.as_secs_f64());
                    }
                    Err(e) => {
                        result.detail = format!("{} {} failed: {}", method, url, e);
                    }
                }
            }
            Verification::PortListening { host, port } => {
                let start = Instant::now();
                let attempt =
                    tokio::time::timeout(self.port_timeout, TcpStream::connect((host.as_str(), *port))).await;
                result.latency_ms = Some(start.elapsed().as_millis() as u64);
                match attempt {
                    Ok(Ok(_)) => {
                        result.status = VerificationStatus::Passed;
                        result.detail = format!("{}:{} is accepting connections", host, port);
                    }
                    Ok(Err(e)) => result.detail = format!("{}:{} refused: {}", host, port, e),
                    Err(_) => {
                        result.status = VerificationStatus::TimedOut;
                        result.detail = format!("{}:{} did not answer within {:?}", host, port, self.port_timeout);
                    }
                }
            }
            Verification::Unimplemented { kind } => {
                let err = GateError::NotImplemented { kind: kind.clone() };
                tracing::error!(%task_id, kind = %kind, "{}", err);
                result.status = VerificationStatus::NotImplemented;
                result.detail = err.to_string();
            }
        }
        result
    }
}
