//! Configuration for Anvil, read from `.anvil/anvil.toml`.
//!
//! Every field has a default, so an empty or missing file is a valid
//! configuration. The file is validated once at load time: `validate()`
//! returns soft warnings, `resolve()` compiles the file into runtime
//! structures and fails on anything that would make a gate misbehave.
//!
//! # Configuration File Format
//!
//! ```toml
//! [project]
//! name = "storefront"
//!
//! [queue]
//! max_attempts = 3
//! poll_interval_ms = 2000
//! workers = 2
//!
//! [gates]
//! functional = false
//!
//! [tests]
//! command = "bin/rails test"
//! framework = "minitest"
//! allow_pending = false
//!
//! [truth]
//! mode = "strict"
//!
//! [[truth.rules]]
//! pattern = "migrations? (ran|applied)"
//! evidence_kind = "criterion"
//! must_show = "passed == true"
//!
//! [diff]
//! max_lines = 400
//! disallowed_patterns = ["binding\\.pry", "console\\.log\\("]
//!
//! [failure.policies.diff]
//! max_retries = 1
//!
//! [[preflight.checks]]
//! name = "postgres"
//! type = "port_reachable"
//! host = "127.0.0.1"
//! port = 5432
//! required_for = ["db"]
//!
//! [workflow]
//! profile = "review"
//!
//! [workflow.profiles.review]
//! git_strategy = "pull_request"
//! auto_create_issues = true
//!
//! [agents]
//! command = "claude -p"
//!
//! [[agents.routes]]
//! source = "lint"
//! agent = "refactorer"
//! ```

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::agent::{AgentKind, AgentProfile, AgentRoute, AgentRouter};
use crate::diff::DiffRules;
use crate::evidence::store::DEFAULT_MAX_RAW_BYTES;
use crate::failure::{DEFAULT_MAX_RETRIES, FailurePolicies, FailureType};
use crate::gate::GateToggles;
use crate::preflight::PreflightCheck;
use crate::queue::DEFAULT_MAX_ATTEMPTS;
use crate::testing::{TestExpectations, TestFramework};
use crate::truth::{TruthMode, TruthRule, TruthRuleConfig, UnmatchedClaims, default_rules};
use crate::workflow::WorkflowProfile;

pub const STATE_DIR: &str = ".anvil";
pub const CONFIG_FILE: &str = "anvil.toml";
pub const DEFAULT_AGENT_CMD: &str = "claude -p";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectSection {
    /// Project name (defaults to the directory name)
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSection {
    /// Executions allowed per item before it fails
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_workers")]
    pub workers: usize,
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

fn default_poll_interval_ms() -> u64 {
    2000
}

fn default_workers() -> usize {
    1
}

impl Default for QueueSection {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            poll_interval_ms: default_poll_interval_ms(),
            workers: default_workers(),
        }
    }
}

/// Gate switches. All gates are on unless turned off here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatesSection {
    #[serde(default = "default_true")]
    pub tests: bool,
    #[serde(default = "default_true")]
    pub criteria: bool,
    #[serde(default = "default_true")]
    pub functional: bool,
    #[serde(default = "default_true")]
    pub truth: bool,
    #[serde(default = "default_true")]
    pub diff: bool,
}

fn default_true() -> bool {
    true
}

impl Default for GatesSection {
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

impl GatesSection {
    pub fn toggles(&self) -> GateToggles {
        GateToggles {
            tests: self.tests,
            criteria: self.criteria,
            functional: self.functional,
            truth: self.truth,
            diff: self.diff,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestsSection {
    /// Project test command; the tests gate fails when this is unset
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub framework: TestFramework,
    #[serde(default = "default_true")]
    pub allow_pending: bool,
    #[serde(default = "default_true")]
    pub allow_skipped: bool,
    #[serde(default = "default_test_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_test_timeout_secs() -> u64 {
    600
}

impl Default for TestsSection {
    fn default() -> Self {
        Self {
            command: None,
            framework: TestFramework::default(),
            allow_pending: true,
            allow_skipped: true,
            timeout_secs: default_test_timeout_secs(),
        }
    }
}

impl TestsSection {
    pub fn expectations(&self) -> TestExpectations {
        TestExpectations {
            framework: self.framework,
            allow_pending: self.allow_pending,
            allow_skipped: self.allow_skipped,
            timeout: Duration::from_secs(self.timeout_secs),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionalSection {
    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,
    #[serde(default = "default_port_timeout_ms")]
    pub port_timeout_ms: u64,
}

fn default_http_timeout_secs() -> u64 {
    10
}

fn default_port_timeout_ms() -> u64 {
    1000
}

impl Default for FunctionalSection {
    fn default() -> Self {
        Self {
            http_timeout_secs: default_http_timeout_secs(),
            port_timeout_ms: default_port_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TruthSection {
    #[serde(default)]
    pub mode: TruthMode,
    #[serde(default)]
    pub unmatched_claims: UnmatchedClaims,
    /// Claim rules; the built-in set is used when empty
    #[serde(default)]
    pub rules: Vec<TruthRuleConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiffSection {
    #[serde(default)]
    pub allow_additional_files: bool,
    #[serde(default = "default_max_lines")]
    pub max_lines: u32,
    #[serde(default = "default_warn_lines")]
    pub warn_lines: u32,
    #[serde(default = "default_disallowed_patterns")]
    pub disallowed_patterns: Vec<String>,
}

fn default_max_lines() -> u32 {
    500
}

fn default_warn_lines() -> u32 {
    200
}

fn default_disallowed_patterns() -> Vec<String> {
    vec![
        r"\bbinding\.pry\b".to_string(),
        r"\bdebugger\b".to_string(),
        r"\bconsole\.log\(".to_string(),
        r"\bdbg!\(".to_string(),
        r"<<<<<<<|>>>>>>>".to_string(),
    ]
}

impl Default for DiffSection {
    fn default() -> Self {
        Self {
            allow_additional_files: false,
            max_lines: default_max_lines(),
            warn_lines: default_warn_lines(),
            disallowed_patterns: default_disallowed_patterns(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicySection {
    #[serde(default)]
    pub max_retries: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureSection {
    #[serde(default = "default_max_retries")]
    pub default_max_retries: u32,
    #[serde(default)]
    pub policies: BTreeMap<FailureType, PolicySection>,
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

impl Default for FailureSection {
    fn default() -> Self {
        Self {
            default_max_retries: default_max_retries(),
            policies: BTreeMap::new(),
        }
    }
}

impl FailureSection {
    pub fn policies(&self) -> FailurePolicies {
        let mut policies = FailurePolicies {
            default_max_retries: self.default_max_retries,
            ..FailurePolicies::default()
        };
        for (failure_type, section) in &self.policies {
            if let Some(max) = section.max_retries {
                policies.max_retries.insert(*failure_type, max);
            }
        }
        policies
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PreflightSection {
    #[serde(default)]
    pub checks: Vec<PreflightCheck>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSection {
    /// Active profile name; built-ins are `direct` and `pull_request`
    #[serde(default = "default_profile")]
    pub profile: String,
    #[serde(default)]
    pub profiles: BTreeMap<String, WorkflowProfile>,
}

fn default_profile() -> String {
    "direct".to_string()
}

impl Default for WorkflowSection {
    fn default() -> Self {
        Self {
            profile: default_profile(),
            profiles: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentsSection {
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default = "default_agent_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub routes: Vec<AgentRoute>,
    #[serde(default)]
    pub kinds: BTreeMap<AgentKind, AgentProfile>,
}

fn default_agent_timeout_secs() -> u64 {
    1800
}

impl Default for AgentsSection {
    fn default() -> Self {
        Self {
            command: None,
            timeout_secs: default_agent_timeout_secs(),
            routes: Vec::new(),
            kinds: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidenceSection {
    /// Raw output kept per evidence entry; longer output is truncated and hashed
    #[serde(default = "default_max_raw_bytes")]
    pub max_raw_bytes: usize,
}

fn default_max_raw_bytes() -> usize {
    DEFAULT_MAX_RAW_BYTES
}

impl Default for EvidenceSection {
    fn default() -> Self {
        Self {
            max_raw_bytes: default_max_raw_bytes(),
        }
    }
}

/// Contents of `anvil.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnvilToml {
    #[serde(default)]
    pub project: ProjectSection,
    #[serde(default)]
    pub queue: QueueSection,
    #[serde(default)]
    pub gates: GatesSection,
    #[serde(default)]
    pub tests: TestsSection,
    #[serde(default)]
    pub functional: FunctionalSection,
    #[serde(default)]
    pub truth: TruthSection,
    #[serde(default)]
    pub diff: DiffSection,
    #[serde(default)]
    pub failure: FailureSection,
    #[serde(default)]
    pub preflight: PreflightSection,
    #[serde(default)]
    pub workflow: WorkflowSection,
    #[serde(default)]
    pub agents: AgentsSection,
    #[serde(default)]
    pub evidence: EvidenceSection,
}

impl AnvilToml {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse anvil.toml")
    }

    /// Load `.anvil/anvil.toml`, or defaults when the file does not exist.
    pub fn load_or_default(anvil_dir: &Path) -> Result<Self> {
        let path = anvil_dir.join(CONFIG_FILE);
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize anvil.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Soft problems worth telling the user about. Hard errors come from `resolve`.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.gates.tests && self.tests.command.is_none() {
            warnings.push("tests gate is enabled but [tests].command is not set; every commit will be blocked".to_string());
        }
        if self.queue.max_attempts == 0 {
            warnings.push("[queue].max_attempts is 0; items default to 1 attempt".to_string());
        }
        if self.queue.workers == 0 {
            warnings.push("[queue].workers is 0; one worker will run".to_string());
        }
        if !self.gates.truth && !self.truth.rules.is_empty() {
            warnings.push("[[truth.rules]] are configured but the truth gate is disabled".to_string());
        }
        if self.diff.allow_additional_files {
            warnings.push("[diff].allow_additional_files is on; unexpected files only warn".to_string());
        }
        for (i, route) in self.agents.routes.iter().enumerate() {
            if route.work_type.is_none() && route.source.is_none() && i + 1 < self.agents.routes.len() {
                warnings.push(format!(
                    "agent route {} matches everything; later routes are unreachable",
                    i + 1
                ));
            }
        }
        for check in &self.preflight.checks {
            if check.timeout_secs == Some(0) {
                warnings.push(format!("pre-flight check '{}' has a zero timeout", check.name));
            }
        }

        warnings
    }
}

/// Runtime structures compiled from `AnvilToml`.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub toggles: GateToggles,
    pub test_command: Option<String>,
    pub test_expectations: TestExpectations,
    pub http_timeout: Duration,
    pub port_timeout: Duration,
    pub truth_rules: Vec<TruthRule>,
    pub truth_mode: TruthMode,
    pub unmatched_claims: UnmatchedClaims,
    pub diff_rules: DiffRules,
    pub failure_policies: FailurePolicies,
    pub preflight_checks: Vec<PreflightCheck>,
    pub profile: WorkflowProfile,
    pub router: AgentRouter,
    pub agent_command: String,
    pub agent_timeout: Duration,
    pub agent_kinds: BTreeMap<AgentKind, AgentProfile>,
    pub poll_interval: Duration,
    pub workers: usize,
    pub max_raw_bytes: usize,
}

/// `AnvilToml` plus environment and CLI overrides and the project paths.
#[derive(Debug, Clone)]
pub struct AnvilConfig {
    pub project_dir: PathBuf,
    pub anvil_dir: PathBuf,
    pub toml: AnvilToml,
    /// CLI override for the workflow profile
    pub cli_profile: Option<String>,
    /// CLI override for the worker count
    pub cli_workers: Option<usize>,
}

impl AnvilConfig {
    pub fn new(project_dir: PathBuf) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;
        let anvil_dir = project_dir.join(STATE_DIR);
        let toml = AnvilToml::load_or_default(&anvil_dir)?;
        Ok(Self {
            project_dir,
            anvil_dir,
            toml,
            cli_profile: None,
            cli_workers: None,
        })
    }

    pub fn with_cli_args(project_dir: PathBuf, profile: Option<String>, workers: Option<usize>) -> Result<Self> {
        let mut config = Self::new(project_dir)?;
        config.cli_profile = profile;
        config.cli_workers = workers;
        Ok(config)
    }

    pub fn is_initialized(&self) -> bool {
        self.anvil_dir.is_dir()
    }

    pub fn config_path(&self) -> PathBuf {
        self.anvil_dir.join(CONFIG_FILE)
    }

    pub fn db_path(&self) -> PathBuf {
        self.anvil_dir.join("anvil.db")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.anvil_dir.join("logs")
    }

    pub fn report_dir(&self) -> PathBuf {
        self.anvil_dir.join("reports")
    }

    pub fn project_name(&self) -> String {
        self.toml.project.name.clone().unwrap_or_else(|| {
            self.project_dir
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| "project".to_string())
        })
    }

    /// Agent command (env → file → default).
    pub fn agent_cmd(&self) -> String {
        std::env::var("ANVIL_AGENT_CMD")
            .ok()
            .filter(|c| !c.trim().is_empty())
            .or_else(|| self.toml.agents.command.clone())
            .unwrap_or_else(|| DEFAULT_AGENT_CMD.to_string())
    }

    /// Active profile name (CLI → env → file).
    pub fn profile_name(&self) -> String {
        self.cli_profile
            .clone()
            .or_else(|| std::env::var("ANVIL_PROFILE").ok().filter(|p| !p.trim().is_empty()))
            .unwrap_or_else(|| self.toml.workflow.profile.clone())
    }

    /// Look up a profile: configured profiles shadow the built-ins.
    pub fn profile(&self, name: &str) -> Result<WorkflowProfile> {
        if let Some(profile) = self.toml.workflow.profiles.get(name) {
            let mut profile = profile.clone();
            if profile.name.is_empty() {
                profile.name = name.to_string();
            }
            return Ok(profile);
        }
        WorkflowProfile::builtin(name).with_context(|| {
            let mut known: Vec<&str> = vec!["direct", "pull_request"];
            known.extend(self.toml.workflow.profiles.keys().map(String::as_str));
            format!("Unknown workflow profile '{}'. Known profiles: {}", name, known.join(", "))
        })
    }

    pub fn validate(&self) -> Vec<String> {
        self.toml.validate()
    }

    /// Compile the configuration. Fails on bad patterns, bad predicates, an
    /// unknown profile, or diff thresholds that cannot both apply.
    pub fn resolve(&self) -> Result<ResolvedConfig> {
        let t = &self.toml;

        if t.diff.warn_lines >= t.diff.max_lines {
            anyhow::bail!(
                "[diff].warn_lines ({}) must be below max_lines ({})",
                t.diff.warn_lines,
                t.diff.max_lines
            );
        }
        let disallowed_patterns = t
            .diff
            .disallowed_patterns
            .iter()
            .map(|p| Regex::new(p).with_context(|| format!("Invalid [diff] disallowed pattern '{}'", p)))
            .collect::<Result<Vec<_>>>()?;

        let rule_configs = if t.truth.rules.is_empty() {
            default_rules()
        } else {
            t.truth.rules.clone()
        };
        let truth_rules = rule_configs
            .iter()
            .map(|r| r.compile().with_context(|| format!("Invalid truth rule '{}'", r.pattern)))
            .collect::<Result<Vec<_>>>()?;

        let profile = self.profile(&self.profile_name())?;

        Ok(ResolvedConfig {
            toggles: t.gates.toggles(),
            test_command: t.tests.command.clone().filter(|c| !c.trim().is_empty()),
            test_expectations: t.tests.expectations(),
            http_timeout: Duration::from_secs(t.functional.http_timeout_secs),
            port_timeout: Duration::from_millis(t.functional.port_timeout_ms),
            truth_rules,
            truth_mode: t.truth.mode,
            unmatched_claims: t.truth.unmatched_claims,
            diff_rules: DiffRules {
                allow_additional_files: t.diff.allow_additional_files,
                max_lines: t.diff.max_lines,
                warn_lines: t.diff.warn_lines,
                disallowed_patterns,
            },
            failure_policies: t.failure.policies(),
            preflight_checks: t.preflight.checks.clone(),
            profile,
            router: AgentRouter::new(t.agents.routes.clone()),
            agent_command: self.agent_cmd(),
            agent_timeout: Duration::from_secs(t.agents.timeout_secs),
            agent_kinds: t.agents.kinds.clone(),
            poll_interval: Duration::from_millis(t.queue.poll_interval_ms),
            workers: self.cli_workers.unwrap_or(t.queue.workers).max(1),
            max_raw_bytes: t.evidence.max_raw_bytes,
        })
    }
}

/// Default `anvil.toml` written by `anvil init`.
pub fn default_config_toml(project_name: &str) -> String {
    format!(
        r#"[project]
name = "{}"

[queue]
max_attempts = 3
poll_interval_ms = 2000
workers = 1

[gates]
tests = true
criteria = true
functional = true
truth = true
diff = true

[tests]
# command = "bundle exec rake test"
framework = "minitest"
allow_pending = true
allow_skipped = true
timeout_secs = 600

[truth]
mode = "strict"
unmatched_claims = "ignore"

[diff]
allow_additional_files = false
max_lines = 500
warn_lines = 200

[failure]
default_max_retries = 2

[workflow]
profile = "direct"

[agents]
command = "{}"
timeout_secs = 1800
"#,
        project_name, DEFAULT_AGENT_CMD
    )
}
