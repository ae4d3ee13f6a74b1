//! Truth Enforcer: agent claims must be backed by recorded evidence.
//!
//! Each rule maps a claim pattern to the evidence kind that can prove it and a
//! predicate the evidence payload must satisfy. A claim matched by several
//! rules must satisfy all of them.

pub mod predicate;

pub use predicate::Predicate;

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

use crate::errors::GateError;
use crate::evidence::{Evidence, EvidenceKind};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TruthMode {
    /// Any unproven claim blocks the commit.
    #[default]
    Strict,
    /// Unproven claims are logged and surfaced as caveats but do not block.
    Permissive,
}

/// What to do with a claim that no rule recognises.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnmatchedClaims {
    #[default]
    Ignore,
    Unproven,
}

/// A rule as written in `[[truth.rules]]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TruthRuleConfig {
    pub pattern: String,
    pub evidence_kind: EvidenceKind,
    #[serde(default)]
    pub must_show: String,
}

impl TruthRuleConfig {
    pub fn compile(&self) -> Result<TruthRule, GateError> {
        let pattern = RegexBuilder::new(&self.pattern)
            .case_insensitive(true)
            .build()
            .map_err(|e| GateError::Other(anyhow::anyhow!("invalid claim pattern '{}': {}", self.pattern, e)))?;
        Ok(TruthRule {
            pattern,
            evidence_kind: self.evidence_kind,
            must_show: self.must_show.parse()?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct TruthRule {
    pub pattern: Regex,
    pub evidence_kind: EvidenceKind,
    pub must_show: Predicate,
}

impl TruthRule {
    fn proof<'a>(&self, evidence: &'a [Evidence]) -> Option<&'a Evidence> {
        evidence
            .iter()
            .rev()
            .filter(|e| e.kind == self.evidence_kind)
            .find(|e| self.must_show.matches(&e.payload))
    }
}

/// Rules used when the configuration declares none.
pub fn default_rules() -> Vec<TruthRuleConfig> {
    vec![
        TruthRuleConfig {
            pattern: r"\b(all )?(the )?(tests?|specs?)( now)? (pass|passes|passing|are green|succeed)\b".to_string(),
            evidence_kind: EvidenceKind::TestRun,
            must_show: "failed == 0 && errors == 0 && timed_out == false".to_string(),
        },
        TruthRuleConfig {
            pattern: r"\b(endpoint|route|returns 200|responds with 200|200 ok)\b".to_string(),
            evidence_kind: EvidenceKind::HttpResponse,
            must_show: "passed == true".to_string(),
        },
        TruthRuleConfig {
            pattern: r"\bfiles? (was |were |is |are )?(created|exists?|added)\b".to_string(),
            evidence_kind: EvidenceKind::Criterion,
            must_show: "type == \"file_exists\" && passed == true".to_string(),
        },
    ]
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvenClaim {
    pub claim: String,
    pub evidence_ids: Vec<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnprovenClaim {
    pub claim: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TruthReport {
    pub mode: TruthMode,
    pub all_proven: bool,
    pub proven: Vec<ProvenClaim>,
    pub unproven_claims: Vec<UnprovenClaim>,
    /// Claims no rule recognised (ignored under `unmatched_claims = "ignore"`).
    pub unmatched: Vec<String>,
}

impl TruthReport {
    /// Whether this report stops a commit.
    pub fn blocks(&self) -> bool {
        self.mode == TruthMode::Strict && !self.all_proven
    }
}

pub struct TruthEnforcer {
    rules: Vec<TruthRule>,
    mode: TruthMode,
    unmatched: UnmatchedClaims,
}

impl TruthEnforcer {
    pub fn new(rules: Vec<TruthRule>, mode: TruthMode, unmatched: UnmatchedClaims) -> Self {
        Self { rules, mode, unmatched }
    }

    pub fn mode(&self) -> TruthMode {
        self.mode
    }

    /// Check every claim against the evidence. Pure: recording the verdict is
    /// the caller's job.
    pub fn enforce(&self, claims: &[String], evidence: &[Evidence]) -> TruthReport {
        let mut proven = Vec::new();
        let mut unproven = Vec::new();
        let mut unmatched = Vec::new();

        for claim in claims.iter().map(|c| c.trim()).filter(|c| !c.is_empty()) {
            let matching: Vec<&TruthRule> = self.rules.iter().filter(|r| r.pattern.is_match(claim)).collect();
            if matching.is_empty() {
                unmatched.push(claim.to_string());
                if self.unmatched == UnmatchedClaims::Unproven {
                    unproven.push(UnprovenClaim {
                        claim: claim.to_string(),
                        reason: "no rule can verify this claim".to_string(),
                    });
                }
                continue;
            }

            let mut ids = Vec::new();
            let mut missing = Vec::new();
            for rule in matching {
                match rule.proof(evidence) {
                    Some(e) => ids.push(e.id),
                    None => missing.push(format!("no {} evidence showing {}", rule.evidence_kind, rule.must_show)),
                }
            }
            if missing.is_empty() {
                proven.push(ProvenClaim {
                    claim: claim.to_string(),
                    evidence_ids: ids,
                });
            } else {
                unproven.push(UnprovenClaim {
                    claim: claim.to_string(),
                    reason: missing.join("; "),
                });
            }
        }

        for u in &unproven {
            match self.mode {
                TruthMode::Strict => tracing::warn!(claim = %u.claim, reason = %u.reason, "unproven claim"),
                TruthMode::Permissive => {
                    tracing::info!(claim = %u.claim, reason = %u.reason, "unproven claim (permissive)")
                }
            }
        }

        TruthReport {
            mode: self.mode,
            all_proven: unproven.is_empty(),
            proven,
            unproven_claims: unproven,
            unmatched,
        }
    }
}
