// Copyright (c) 2026 Termflux
// SPDX-License-Identifier: AGPL-3.0

//! Workflow execution engine.
//!
//! A queue-backed executor: each submission becomes one job keyed by run
//! id, workers process up to [`WORKER_CONCURRENCY`] runs at a time, and a
//! single recursive evaluator is the only place that knows per-kind step
//! semantics. Step timeouts are enforced by racing the exec future against
//! a timer; cancellation is cooperative at step boundaries.

use chrono::Utc;
use futures::future::join_all;
use futures::Future;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, Semaphore};
use tracing::{debug, error, info, warn};

use crate::application::secret_service::SecretService;
use crate::domain::container::{ContainerDriver, ExecOptions};
use crate::domain::errors::CoreError;
use crate::domain::repository::{RunRepository, WorkflowRepository};
use crate::domain::workflow::{
    substitute_variables, OnFailure, RunId, RunStatus, Step, StepKind, StepResult, StepStatus,
    WorkflowDefinition, WorkflowId, WorkflowRun,
};
use crate::domain::workspace::WorkspaceId;
use crate::infrastructure::queue::{Job, JobQueue, JobState};

/// Maximum concurrently executing runs per process.
pub const WORKER_CONCURRENCY: usize = 10;

/// Default per-step wall-clock timeout.
const DEFAULT_STEP_TIMEOUT_SECS: u64 = 300;

/// Separator between child outputs in a parallel composite.
const PARALLEL_OUTPUT_SEPARATOR: &str = "\n---\n";

/// Queue payload: everything a worker needs without re-reading the
/// definition row.
#[derive(Debug, Clone)]
pub struct RunJob {
    pub run_id: RunId,
    pub workflow_id: WorkflowId,
    pub workspace_id: WorkspaceId,
    pub user_id: String,
    pub definition: WorkflowDefinition,
    pub variables: HashMap<String, String>,
}

/// Why evaluation stopped early.
enum Halt {
    Failed(String),
    Cancelled,
}

/// Outcome of one parallel child after its own retry and on-failure
/// policy have been applied.
struct ChildOutcome {
    /// Every attempt, in execution order; the last one is final.
    attempts: Vec<StepResult>,
    /// Final attempt failed.
    failed: bool,
    /// Final attempt failed and the child's policy does not absorb it.
    halts: bool,
}

struct RunContext {
    run_id: RunId,
    workspace_id: WorkspaceId,
    variables: HashMap<String, String>,
}

pub struct WorkflowEngine {
    driver: Arc<dyn ContainerDriver>,
    workflows: Arc<dyn WorkflowRepository>,
    runs: Arc<dyn RunRepository>,
    queue: Arc<JobQueue<RunJob>>,
    /// Live runs, preferred by `run_status` over the relational row.
    active_runs: Arc<RwLock<HashMap<RunId, WorkflowRun>>>,
    /// When present, step outputs are masked before persistence.
    secrets: Option<Arc<SecretService>>,
}

impl WorkflowEngine {
    pub fn new(
        driver: Arc<dyn ContainerDriver>,
        workflows: Arc<dyn WorkflowRepository>,
        runs: Arc<dyn RunRepository>,
        queue: Arc<JobQueue<RunJob>>,
        secrets: Option<Arc<SecretService>>,
    ) -> Self {
        Self {
            driver,
            workflows,
            runs,
            queue,
            active_runs: Arc::new(RwLock::new(HashMap::new())),
            secrets,
        }
    }

    // ========================================================================
    // Submission
    // ========================================================================

    /// Persist a pending run and enqueue its job. Caller variables win over
    /// workflow defaults.
    pub async fn start_workflow(
        &self,
        workflow_id: WorkflowId,
        workspace_id: WorkspaceId,
        user_id: &str,
        variables: HashMap<String, String>,
    ) -> Result<RunId, CoreError> {
        let definition = self
            .workflows
            .find_by_id(workflow_id)
            .await?
            .ok_or_else(|| CoreError::not_found("workflow", workflow_id.to_string()))?;

        if definition.workspace_id != workspace_id {
            return Err(CoreError::Validation(format!(
                "workflow {workflow_id} does not belong to workspace {workspace_id}"
            )));
        }

        let mut effective = definition.env.clone();
        effective.extend(variables);

        let run = WorkflowRun::new(workflow_id, workspace_id, user_id, effective.clone());
        let run_id = run.id.clone();
        self.runs.save(&run).await?;

        self.queue
            .enqueue(
                run_id.as_str(),
                RunJob {
                    run_id: run_id.clone(),
                    workflow_id,
                    workspace_id,
                    user_id: user_id.to_string(),
                    definition,
                    variables: effective,
                },
            )
            .await?;

        info!(run_id = %run_id, workflow_id = %workflow_id, "Queued workflow run");
        Ok(run_id)
    }

    /// Discard the queue job and mark the run cancelled. A worker that is
    /// mid-run observes the discarded job state between steps; in-flight
    /// shell commands are not interrupted.
    pub async fn cancel_workflow(&self, run_id: &RunId) -> Result<(), CoreError> {
        self.queue.discard(run_id.as_str(), "cancelled");

        let mut run = match self.active_runs.read().await.get(run_id).cloned() {
            Some(run) => run,
            None => self
                .runs
                .find_by_id(run_id)
                .await?
                .ok_or_else(|| CoreError::not_found("run", run_id.to_string()))?,
        };

        if !run.status.is_terminal() {
            run.status = RunStatus::Cancelled;
            run.error = Some("cancelled".to_string());
            run.completed_at = Some(Utc::now());
            self.sync_run(&run).await;
        }

        info!(run_id = %run_id, "Cancelled workflow run");
        Ok(())
    }

    /// Live in-process state first, relational row as fallback.
    pub async fn run_status(&self, run_id: &RunId) -> Result<Option<WorkflowRun>, CoreError> {
        if let Some(run) = self.active_runs.read().await.get(run_id).cloned() {
            return Ok(Some(run));
        }
        Ok(self.runs.find_by_id(run_id).await?)
    }

    // ========================================================================
    // Worker loop
    // ========================================================================

    /// Spawn the dispatcher. Jobs are processed on their own tasks, bounded
    /// by the worker semaphore; the dispatcher exits when the queue closes.
    pub fn spawn_workers(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let workers = Arc::new(Semaphore::new(WORKER_CONCURRENCY));
            while let Some(job) = engine.queue.dequeue().await {
                let permit = match Arc::clone(&workers).acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => break,
                };
                let engine = Arc::clone(&engine);
                tokio::spawn(async move {
                    let _permit = permit;
                    engine.process_job(job).await;
                });
            }
            debug!("Workflow dispatcher stopped");
        })
    }

    async fn process_job(&self, job: Job<RunJob>) {
        let payload = job.payload;
        let run_id = payload.run_id.clone();

        let mut run = match self.runs.find_by_id(&run_id).await {
            Ok(Some(run)) => run,
            Ok(None) => WorkflowRun::new(
                payload.workflow_id,
                payload.workspace_id,
                payload.user_id.clone(),
                payload.variables.clone(),
            ),
            Err(e) => {
                error!(run_id = %run_id, error = %e, "Failed to load run row");
                self.queue.fail(run_id.as_str(), &e.to_string());
                return;
            }
        };

        run.status = RunStatus::Running;
        run.started_at = Some(Utc::now());
        run.completed_at = None;
        run.error = None;
        run.step_results.clear();
        self.sync_run(&run).await;

        info!(run_id = %run_id, attempt = job.attempt, "Workflow run started");

        let ctx = RunContext {
            run_id: run_id.clone(),
            workspace_id: payload.workspace_id,
            variables: payload.variables.clone(),
        };

        let outcome = self
            .eval_steps(&ctx, &payload.definition.steps, &mut run)
            .await;

        match outcome {
            Ok(()) => {
                run.status = RunStatus::Completed;
                run.completed_at = Some(Utc::now());
                self.queue.complete(run_id.as_str());
                info!(run_id = %run_id, steps = run.step_results.len(), "Workflow run completed");
            }
            Err(Halt::Cancelled) => {
                run.status = RunStatus::Cancelled;
                run.error = Some("cancelled".to_string());
                run.completed_at = Some(Utc::now());
                info!(run_id = %run_id, "Workflow run cancelled");
            }
            Err(Halt::Failed(message)) => {
                run.status = RunStatus::Failed;
                run.error = Some(message.clone());
                run.completed_at = Some(Utc::now());
                // Rethrow into the queue so its retry policy applies.
                self.queue.fail(run_id.as_str(), &message);
                warn!(run_id = %run_id, error = %message, "Workflow run failed");
            }
        }

        self.sync_run(&run).await;
        self.active_runs.write().await.remove(&run_id);
    }

    // ========================================================================
    // Step evaluation
    // ========================================================================

    fn eval_steps<'a>(
        &'a self,
        ctx: &'a RunContext,
        steps: &'a [Step],
        run: &'a mut WorkflowRun,
    ) -> Pin<Box<dyn Future<Output = Result<(), Halt>> + Send + 'a>> {
        Box::pin(async move {
            for step in steps {
                if self.is_cancelled(&ctx.run_id) {
                    return Err(Halt::Cancelled);
                }
                self.eval_step_with_policy(ctx, step, run).await?;
            }
            Ok(())
        })
    }

    /// Evaluate one step, applying its retry count and on-failure policy.
    async fn eval_step_with_policy(
        &self,
        ctx: &RunContext,
        step: &Step,
        run: &mut WorkflowRun,
    ) -> Result<(), Halt> {
        let max_attempts = if step.on_failure == OnFailure::Retry {
            step.retries.max(1) + 1
        } else {
            1
        };

        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = self.eval_step(ctx, step, run).await?;
            let failed = result.status == StepStatus::Failed;

            if failed && attempt < max_attempts {
                debug!(
                    run_id = %ctx.run_id,
                    step_id = %step.id,
                    attempt,
                    "Step failed, retrying"
                );
                if self.is_cancelled(&ctx.run_id) {
                    return Err(Halt::Cancelled);
                }
                continue;
            }

            if failed {
                match step.on_failure {
                    OnFailure::Continue => return Ok(()),
                    // Retry falls back to stop once attempts are exhausted.
                    OnFailure::Stop | OnFailure::Retry => {
                        return Err(Halt::Failed(format!(
                            "step '{}' failed: {}",
                            step.id,
                            result.error.as_deref().unwrap_or("non-zero exit")
                        )));
                    }
                }
            }
            return Ok(());
        }
    }

    /// Evaluate a single step. Leaf and conditional results are appended to
    /// the run; parallel children are appended individually (one result per
    /// attempt) and a child whose failure is not absorbed by its own policy
    /// halts the run directly.
    async fn eval_step(
        &self,
        ctx: &RunContext,
        step: &Step,
        run: &mut WorkflowRun,
    ) -> Result<StepResult, Halt> {
        match step.kind {
            StepKind::Shell => {
                let result = self.eval_shell(ctx, step).await;
                run.step_results.push(result.clone());
                self.sync_run(run).await;
                Ok(result)
            }

            StepKind::Parallel => {
                // Each child gets the same per-step retry and on-failure
                // treatment a sequential child would.
                let futures: Vec<_> = step
                    .steps
                    .iter()
                    .map(|child| self.eval_shell_with_policy(ctx, child))
                    .collect();
                let outcomes = join_all(futures).await;

                let any_failed = outcomes.iter().any(|o| o.failed);
                let output = outcomes
                    .iter()
                    .map(|o| o.attempts.last().map(|r| r.output.as_str()).unwrap_or(""))
                    .collect::<Vec<_>>()
                    .join(PARALLEL_OUTPUT_SEPARATOR);

                let started_at = outcomes
                    .iter()
                    .flat_map(|o| o.attempts.iter().map(|r| r.started_at))
                    .min()
                    .unwrap_or_else(Utc::now);
                let ended_at = outcomes
                    .iter()
                    .flat_map(|o| o.attempts.iter().map(|r| r.ended_at))
                    .max()
                    .unwrap_or_else(Utc::now);

                let halt = outcomes.iter().zip(&step.steps).find_map(|(outcome, child)| {
                    outcome.halts.then(|| {
                        format!(
                            "step '{}' failed: {}",
                            child.id,
                            outcome
                                .attempts
                                .last()
                                .and_then(|r| r.error.as_deref())
                                .unwrap_or("non-zero exit")
                        )
                    })
                });

                for outcome in outcomes {
                    for attempt in outcome.attempts {
                        run.step_results.push(attempt);
                    }
                }
                self.sync_run(run).await;

                // A child whose own policy does not absorb the failure
                // rethrows past the composite, like a sequential child.
                if let Some(message) = halt {
                    return Err(Halt::Failed(message));
                }

                Ok(StepResult {
                    step_id: step.id.clone(),
                    status: StepStatus::Success,
                    output,
                    exit_code: None,
                    error: any_failed
                        .then(|| "one or more parallel steps failed and continued".to_string()),
                    started_at,
                    ended_at,
                    duration_ms: (ended_at - started_at).num_milliseconds().max(0) as u64,
                })
            }

            StepKind::Sequential => {
                let started_at = Utc::now();
                self.eval_steps(ctx, &step.steps, run).await?;
                let ended_at = Utc::now();
                Ok(StepResult {
                    step_id: step.id.clone(),
                    status: StepStatus::Success,
                    output: String::new(),
                    exit_code: None,
                    error: None,
                    started_at,
                    ended_at,
                    duration_ms: (ended_at - started_at).num_milliseconds().max(0) as u64,
                })
            }

            StepKind::Conditional => {
                let started_at = Utc::now();
                let condition = step.condition.as_deref().unwrap_or("false");
                let command = substitute_variables(condition, &ctx.variables);
                let take_branch = match self.run_command(ctx, step, &command).await {
                    Ok(output) => output.exit_code == 0,
                    Err(e) => {
                        warn!(
                            run_id = %ctx.run_id,
                            step_id = %step.id,
                            error = %e,
                            "Condition evaluation failed, skipping branch"
                        );
                        false
                    }
                };

                let output = if take_branch {
                    format!("condition met, executing {} nested steps", step.steps.len())
                } else {
                    "condition not met, steps skipped".to_string()
                };

                let ended_at = Utc::now();
                let marker = StepResult {
                    step_id: step.id.clone(),
                    status: StepStatus::Success,
                    output,
                    exit_code: None,
                    error: None,
                    started_at,
                    ended_at,
                    duration_ms: (ended_at - started_at).num_milliseconds().max(0) as u64,
                };
                run.step_results.push(marker.clone());
                self.sync_run(run).await;

                if take_branch {
                    self.eval_steps(ctx, &step.steps, run).await?;
                }
                Ok(marker)
            }

            StepKind::Wait => {
                let started_at = Utc::now();
                let secs = step.timeout_secs.unwrap_or(1);
                tokio::time::sleep(Duration::from_secs(secs)).await;
                let ended_at = Utc::now();
                let result = StepResult {
                    step_id: step.id.clone(),
                    status: StepStatus::Success,
                    output: format!("waited {secs}s"),
                    exit_code: None,
                    error: None,
                    started_at,
                    ended_at,
                    duration_ms: (ended_at - started_at).num_milliseconds().max(0) as u64,
                };
                run.step_results.push(result.clone());
                self.sync_run(run).await;
                Ok(result)
            }
        }
    }

    /// Run one parallel child with its own retry count. `halts` is set when
    /// the final attempt failed and the child's on-failure policy is not
    /// `continue`; retries stop early once the run is cancelled.
    async fn eval_shell_with_policy(&self, ctx: &RunContext, step: &Step) -> ChildOutcome {
        let max_attempts = if step.on_failure == OnFailure::Retry {
            step.retries.max(1) + 1
        } else {
            1
        };

        let mut attempts = Vec::new();
        loop {
            let result = self.eval_shell(ctx, step).await;
            let failed = result.status == StepStatus::Failed;
            attempts.push(result);

            if failed
                && (attempts.len() as u32) < max_attempts
                && !self.is_cancelled(&ctx.run_id)
            {
                debug!(
                    run_id = %ctx.run_id,
                    step_id = %step.id,
                    attempt = attempts.len(),
                    "Parallel child failed, retrying"
                );
                continue;
            }

            let halts = failed && step.on_failure != OnFailure::Continue;
            return ChildOutcome {
                attempts,
                failed,
                halts,
            };
        }
    }

    /// Run one shell step: substitute variables, race the exec against the
    /// step timer, and convert timeouts and backend failures into failed
    /// results instead of surfacing them.
    async fn eval_shell(&self, ctx: &RunContext, step: &Step) -> StepResult {
        let started_at = Utc::now();
        let command = substitute_variables(
            step.command.as_deref().unwrap_or_default(),
            &ctx.variables,
        );
        let timeout_secs = step.timeout_secs.unwrap_or(DEFAULT_STEP_TIMEOUT_SECS);

        let outcome = tokio::time::timeout(
            Duration::from_secs(timeout_secs),
            self.run_command(ctx, step, &command),
        )
        .await;

        let ended_at = Utc::now();
        let duration_ms = (ended_at - started_at).num_milliseconds().max(0) as u64;

        let (status, output, exit_code, error) = match outcome {
            Ok(Ok(exec)) => {
                let output = self.mask_output(ctx.workspace_id, exec.output_string()).await;
                if exec.success() {
                    (StepStatus::Success, output, Some(exec.exit_code), None)
                } else {
                    (
                        StepStatus::Failed,
                        output,
                        Some(exec.exit_code),
                        Some(format!("exit code {}", exec.exit_code)),
                    )
                }
            }
            Ok(Err(e)) => (StepStatus::Failed, String::new(), None, Some(e.to_string())),
            Err(_) => (
                StepStatus::Failed,
                String::new(),
                None,
                Some(CoreError::Timeout { seconds: timeout_secs }.to_string()),
            ),
        };

        StepResult {
            step_id: step.id.clone(),
            status,
            output,
            exit_code,
            error,
            started_at,
            ended_at,
            duration_ms,
        }
    }

    async fn run_command(
        &self,
        ctx: &RunContext,
        step: &Step,
        command: &str,
    ) -> Result<crate::domain::container::ExecOutput, CoreError> {
        let mut env: Vec<String> = ctx
            .variables
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        for (k, v) in &step.env {
            env.push(format!("{k}={v}"));
        }

        self.driver
            .exec(
                ctx.workspace_id,
                &["sh".to_string(), "-c".to_string(), command.to_string()],
                ExecOptions {
                    env,
                    working_dir: step.working_dir.clone(),
                    user: None,
                },
            )
            .await
    }

    async fn mask_output(&self, workspace_id: WorkspaceId, output: String) -> String {
        match &self.secrets {
            Some(secrets) => match secrets.mask_in_text(workspace_id, &output).await {
                Ok(masked) => masked,
                Err(e) => {
                    warn!(error = %e, "Secret masking failed, keeping raw output");
                    output
                }
            },
            None => output,
        }
    }

    fn is_cancelled(&self, run_id: &RunId) -> bool {
        !matches!(self.queue.state(run_id.as_str()), Some(JobState::Active))
    }

    /// Mirror the run into the live map and persist it; persistence
    /// failures are logged, not fatal to the run.
    async fn sync_run(&self, run: &WorkflowRun) {
        self.active_runs
            .write()
            .await
            .insert(run.id.clone(), run.clone());
        if let Err(e) = self.runs.save(run).await {
            error!(run_id = %run.id, error = %e, "Failed to persist workflow run");
        }
    }
}
