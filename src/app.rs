//! Wires the resolved configuration into a running system.

use std::sync::Arc;

use anyhow::{Context, Result};

use crate::agent::{CommandAgent, ExecutionAgent};
use crate::api::AppState;
use crate::config::{AnvilConfig, ResolvedConfig};
use crate::criteria::CriteriaVerifier;
use crate::diff::{DiffProvider, DiffValidator, GitDiffProvider};
use crate::evidence::{EvidenceDb, EvidenceStore};
use crate::failure::FailureHandler;
use crate::functional::FunctionalVerifier;
use crate::gate::QualityGate;
use crate::preflight::PreflightChecker;
use crate::queue::{QueueDb, QueueHandle};
use crate::shell::{ShellRunner, SystemShell};
use crate::testing::TestValidator;
use crate::truth::TruthEnforcer;
use crate::worker::WorkerContext;
use crate::workflow::Orchestrator;

/// Open stores plus the compiled configuration for one project.
pub struct Anvil {
    pub config: AnvilConfig,
    pub resolved: ResolvedConfig,
    pub queue: QueueHandle,
    pub evidence: EvidenceStore,
}

impl Anvil {
    /// Open the project's stores. Requires `anvil init` to have run.
    pub fn open(config: AnvilConfig) -> Result<Self> {
        if !config.is_initialized() {
            anyhow::bail!(
                "{} is not an anvil project. Run 'anvil init' first.",
                config.project_dir.display()
            );
        }
        let resolved = config.resolve()?;
        let db_path = config.db_path();
        let queue = QueueHandle::new(
            QueueDb::new(&db_path).with_context(|| format!("Failed to open queue at {}", db_path.display()))?,
        );
        let evidence = EvidenceStore::new(EvidenceDb::new(&db_path)?.with_raw_limit(resolved.max_raw_bytes));
        Ok(Self {
            config,
            resolved,
            queue,
            evidence,
        })
    }

    pub fn api_state(&self) -> Arc<AppState> {
        Arc::new(AppState {
            queue: self.queue.clone(),
            evidence: self.evidence.clone(),
        })
    }

    pub fn quality_gate(&self, shell: Arc<dyn ShellRunner>) -> Result<QualityGate> {
        let r = &self.resolved;
        let project_dir = &self.config.project_dir;
        let tests = TestValidator::new(shell, self.evidence.clone());
        Ok(QualityGate {
            toggles: r.toggles,
            test_command: r.test_command.clone(),
            test_expectations: r.test_expectations.clone(),
            criteria: CriteriaVerifier::new(
                project_dir,
                tests.clone(),
                r.test_expectations.clone(),
                self.evidence.clone(),
                r.http_timeout,
            )?,
            tests,
            functional: FunctionalVerifier::new(self.evidence.clone(), r.http_timeout, r.port_timeout)?,
            truth: TruthEnforcer::new(r.truth_rules.clone(), r.truth_mode, r.unmatched_claims),
            diff: DiffValidator::new(r.diff_rules.clone()),
            failures: Arc::new(FailureHandler::new(
                self.config.report_dir(),
                r.failure_policies.clone(),
                self.evidence.clone(),
            )),
            evidence: self.evidence.clone(),
        })
    }

    /// Build the shared worker context with the configured agent command.
    pub fn worker_context(&self) -> Result<WorkerContext> {
        let agent = CommandAgent::new(
            &self.config.project_dir,
            &self.resolved.agent_command,
            self.resolved.agent_timeout,
        )
        .with_kinds(self.resolved.agent_kinds.clone());
        self.worker_context_with(Arc::new(agent))
    }

    pub fn worker_context_with(&self, agent: Arc<dyn ExecutionAgent>) -> Result<WorkerContext> {
        let project_dir = &self.config.project_dir;
        let shell: Arc<dyn ShellRunner> = Arc::new(SystemShell::new(project_dir));
        let vcs: Arc<dyn DiffProvider> = Arc::new(GitDiffProvider::new(project_dir)?);
        let gate = Arc::new(self.quality_gate(shell.clone())?);
        let orchestrator = Orchestrator::new(
            self.queue.clone(),
            gate,
            vcs,
            shell.clone(),
            self.evidence.clone(),
            self.resolved.profile.clone(),
        );
        Ok(WorkerContext {
            queue: self.queue.clone(),
            preflight: Arc::new(PreflightChecker::new(project_dir, shell, self.evidence.clone())),
            checks: Arc::new(self.resolved.preflight_checks.clone()),
            agent,
            router: Arc::new(self.resolved.router.clone()),
            orchestrator: Arc::new(orchestrator),
            poll_interval: self.resolved.poll_interval,
            agent_timeout: self.resolved.agent_timeout,
        })
    }
}
