//! Worker loop: claim, pre-flight, execute, hand off to the orchestrator.
//!
//! Several loops may share one queue; the atomic claim keeps them apart. The
//! shutdown signal is only consulted between items, so an evaluation that has
//! started always finishes.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::watch;

use crate::agent::{AgentOutcome, AgentRequest, AgentRouter, ExecutionAgent};
use crate::errors::WorkflowError;
use crate::failure::FailureType;
use crate::preflight::{PreflightCheck, PreflightChecker};
use crate::queue::{QueueHandle, WorkItem};
use crate::workflow::{Orchestrator, TaskOutcome};

/// Everything the worker loops share.
#[derive(Clone)]
pub struct WorkerContext {
    pub queue: QueueHandle,
    pub preflight: Arc<PreflightChecker>,
    pub checks: Arc<Vec<PreflightCheck>>,
    pub agent: Arc<dyn ExecutionAgent>,
    pub router: Arc<AgentRouter>,
    pub orchestrator: Arc<Orchestrator>,
    pub poll_interval: Duration,
    pub agent_timeout: Duration,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub claimed: usize,
    pub completed: usize,
    pub requeued: usize,
    pub failed: usize,
}

impl WorkerStats {
    fn tally(&mut self, outcome: &TaskOutcome) {
        match outcome {
            TaskOutcome::Completed { .. } => self.completed += 1,
            TaskOutcome::Requeued { .. } => self.requeued += 1,
            TaskOutcome::Failed { .. } => self.failed += 1,
        }
    }

    fn merge(&mut self, other: WorkerStats) {
        self.claimed += other.claimed;
        self.completed += other.completed;
        self.requeued += other.requeued;
        self.failed += other.failed;
    }
}

pub struct Worker {
    id: usize,
    ctx: WorkerContext,
}

impl Worker {
    pub fn new(id: usize, ctx: WorkerContext) -> Self {
        Self { id, ctx }
    }

    /// Run until shutdown is signalled, or after one item when `once` is set.
    ///
    /// Queue and evidence store errors end the loop. Agent and gate failures
    /// are outcomes, and VCS or gate tooling errors are routed to one.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>, once: bool) -> Result<WorkerStats> {
        let mut stats = WorkerStats::default();
        tracing::info!(worker = self.id, "worker started");

        loop {
            if *shutdown.borrow() {
                tracing::info!(worker = self.id, "shutdown requested, stopping before next claim");
                break;
            }

            let Some(item) = self.ctx.queue.claim_next().await? else {
                if once {
                    break;
                }
                tokio::select! {
                    _ = tokio::time::sleep(self.ctx.poll_interval) => {}
                    _ = shutdown.changed() => {}
                }
                continue;
            };

            stats.claimed += 1;
            tracing::info!(worker = self.id, task_id = %item.id, title = %item.title, attempt = item.attempt_number(), "claimed work item");
            let outcome = match self.process(item.clone()).await {
                Ok(outcome) => outcome,
                Err(e) if e.is_task_scoped() => self.ctx.orchestrator.route_error(&item, &e).await?,
                Err(e) => return Err(e.into()),
            };
            stats.tally(&outcome);

            if once {
                break;
            }
        }

        tracing::info!(worker = self.id, ?stats, "worker stopped");
        Ok(stats)
    }

    /// Take one claimed item to its outcome.
    pub async fn process(&self, item: WorkItem) -> Result<TaskOutcome, WorkflowError> {
        let orchestrator = &self.ctx.orchestrator;

        let report = self.ctx.preflight.run_checks(&item, &self.ctx.checks).await?;
        if let Err(e) = report.require() {
            // Environment problems are never retried.
            let reason = e.to_string();
            let failures = orchestrator.failures();
            let attempt = failures.next_attempt(item.id, FailureType::Preflight).await?;
            let decision = failures.handle(&item, FailureType::Preflight, attempt, &reason).await?;
            let path = match decision.report_path {
                Some(path) => path,
                None => failures.escalate(&item, FailureType::Preflight, &reason).await?,
            };
            return orchestrator.fail_item(&item, Some(path), &reason).await;
        }

        let kind = self.ctx.router.resolve(&item);
        let request = AgentRequest::new(item.clone(), kind);
        tracing::info!(worker = self.id, task_id = %item.id, %kind, "dispatching to agent");
        let outcome = match tokio::time::timeout(self.ctx.agent_timeout, self.ctx.agent.execute(&request)).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                tracing::warn!(task_id = %item.id, error = %e, "agent execution error");
                AgentOutcome::failed("", format!("{:#}", e))
            }
            Err(_) => AgentOutcome {
                timed_out: true,
                ..AgentOutcome::failed(
                    "",
                    format!("agent timed out after {}s", self.ctx.agent_timeout.as_secs()),
                )
            },
        };

        orchestrator.complete_execution(&item, outcome).await
    }
}

/// Spawn `workers` loops over the shared context and wait for all of them.
pub async fn run_workers(
    ctx: WorkerContext,
    workers: usize,
    shutdown: watch::Receiver<bool>,
    once: bool,
) -> Result<WorkerStats> {
    let mut handles = Vec::with_capacity(workers.max(1));
    for id in 0..workers.max(1) {
        let worker = Worker::new(id, ctx.clone());
        let rx = shutdown.clone();
        handles.push(tokio::spawn(async move { worker.run(rx, once).await }));
    }

    let mut total = WorkerStats::default();
    let mut first_error = None;
    for handle in handles {
        match handle.await.context("Worker task panicked")? {
            Ok(stats) => total.merge(stats),
            Err(e) => {
                tracing::error!(error = %e, "worker stopped with error");
                first_error.get_or_insert(e);
            }
        }
    }
    match first_error {
        Some(e) => Err(e),
        None => Ok(total),
    }
}
