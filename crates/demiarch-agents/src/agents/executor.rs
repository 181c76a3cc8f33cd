//! Agent executor - one execution's own step
//!
//! A step acquires the declared locks, moves the execution to `Running`,
//! retrieves a context bundle, calls the model gateway and interprets the
//! response for the execution's role. Locks live in a [`LockSet`], so they
//! are released on every exit path, including deadline expiry and
//! cancellation. Workers release theirs as soon as the model call returns;
//! delegating roles keep the set in [`StepOutput`] until their children are
//! done.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::domain::context::{ContextBundle, ContextRetriever};
use crate::domain::execution::{AgentRole, ExecutionId, ExecutionLedger, ExecutionMetrics};
use crate::domain::locking::{LockSet, ResourceLockManager};
use crate::error::{Error, Result};
use crate::gateway::{GatewayResponse, ModelGateway};

use super::output::{PlanRules, RoleOutput};
use super::result::AgentResult;
use super::task::TaskInput;

/// Project used for planned resources when the task scope names none
const DEFAULT_PROJECT: &str = "default";

/// Executor settings
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Overall deadline of one step, lock waits included
    pub deadline: Duration,
    /// Context budget when the task input sets none
    pub max_context_tokens: usize,
    /// Most worker descriptors a Planner may emit
    pub max_workers: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            deadline: Duration::from_secs(600),
            max_context_tokens: 4000,
            max_workers: 16,
        }
    }
}

impl ExecutorConfig {
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn with_max_context_tokens(mut self, max_tokens: usize) -> Self {
        self.max_context_tokens = max_tokens;
        self
    }

    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers;
        self
    }
}

/// What a successful step produced
#[derive(Debug)]
pub struct StepOutput {
    pub response: GatewayResponse,
    pub output: RoleOutput,
    pub metrics: ExecutionMetrics,
    pub context_truncated: bool,
    /// Locks still held; empty for workers
    pub locks: LockSet,
}

impl StepOutput {
    /// Release the locks the step still holds
    pub fn release_locks(&mut self, id: ExecutionId) -> usize {
        release_locks(id, &mut self.locks)
    }
}

/// Runs single agent executions against the shared lock table, context
/// store, gateway and ledger
#[derive(Clone)]
pub struct AgentExecutor {
    ledger: ExecutionLedger,
    locks: ResourceLockManager,
    retriever: ContextRetriever,
    gateway: Arc<dyn ModelGateway>,
    config: ExecutorConfig,
}

impl std::fmt::Debug for AgentExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentExecutor")
            .field("executions", &self.ledger.len())
            .field("config", &self.config)
            .finish()
    }
}

impl AgentExecutor {
    pub fn new(
        ledger: ExecutionLedger,
        locks: ResourceLockManager,
        retriever: ContextRetriever,
        gateway: Arc<dyn ModelGateway>,
    ) -> Self {
        Self {
            ledger,
            locks,
            retriever,
            gateway,
            config: ExecutorConfig::default(),
        }
    }

    pub fn with_config(mut self, config: ExecutorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn ledger(&self) -> &ExecutionLedger {
        &self.ledger
    }

    pub fn locks(&self) -> &ResourceLockManager {
        &self.locks
    }

    pub fn retriever(&self) -> &ContextRetriever {
        &self.retriever
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Create, run and finish one execution
    ///
    /// The execution ends `Succeeded` with its output stored, or `Failed`
    /// with the error detail; the error is also returned to the caller.
    pub async fn run(
        &self,
        role: AgentRole,
        parent_id: Option<ExecutionId>,
        input: TaskInput,
    ) -> Result<AgentResult> {
        if input.descriptor.role != role {
            return Err(Error::InvalidInput(format!(
                "task {} is for a {}, not a {}",
                input.descriptor.task_id, input.descriptor.role, role
            )));
        }
        let id = self.prepare(parent_id, &input).await?;
        self.run_prepared(id, &input, &CancellationToken::new()).await
    }

    /// Insert the `Pending` row for `input`
    pub async fn prepare(&self, parent_id: Option<ExecutionId>, input: &TaskInput) -> Result<ExecutionId> {
        let row = self
            .ledger
            .create(input.descriptor.role, parent_id, serde_json::to_value(input)?)
            .await?;
        Ok(row.id)
    }

    /// Run the step of a prepared execution and mark it `Succeeded`
    pub async fn run_prepared(
        &self,
        id: ExecutionId,
        input: &TaskInput,
        cancel: &CancellationToken,
    ) -> Result<AgentResult> {
        let mut step = self.step(id, input, cancel).await?;
        step.release_locks(id);
        let output = json!({
            "task_id": input.descriptor.task_id,
            "model": step.response.model_used,
            "content": step.response.content,
            "output": step.output,
        });

        let row = match self.ledger.succeed(id, output).await {
            Ok(row) => row,
            Err(e) => {
                let err = Error::from(e);
                self.fail(id, &err).await;
                return Err(err);
            }
        };
        info!(
            execution_id = %id,
            role = %row.role,
            tokens = row.metrics.total_tokens(),
            "Execution succeeded"
        );

        let mut result = AgentResult::from_row(&row, &input.descriptor.task_id);
        result.content = Some(step.response.content);
        result.output = Some(step.output);
        Ok(result)
    }

    /// Run the execution's own step, leaving it `Running` on success
    ///
    /// Every failure, deadline expiry included, marks the execution `Failed`
    /// before the error is returned, with its locks released. On success a
    /// delegating role's locks come back in [`StepOutput::locks`].
    pub async fn step(
        &self,
        id: ExecutionId,
        input: &TaskInput,
        cancel: &CancellationToken,
    ) -> Result<StepOutput> {
        let role = input.descriptor.role;
        let span = info_span!(
            "agent_step",
            execution_id = %id,
            role = %role,
            task_id = %input.descriptor.task_id
        );

        async move {
            let deadline = self.config.deadline;
            let outcome = match tokio::time::timeout(deadline, self.attempt(id, input, cancel)).await {
                Ok(outcome) => outcome,
                Err(_) => Err(Error::ExecutionTimeout {
                    execution_id: id,
                    deadline_ms: deadline.as_millis() as u64,
                }),
            };

            if let Err(err) = &outcome {
                self.fail(id, err).await;
            }
            outcome
        }
        .instrument(span)
        .await
    }

    async fn attempt(
        &self,
        id: ExecutionId,
        input: &TaskInput,
        cancel: &CancellationToken,
    ) -> Result<StepOutput> {
        let started = Instant::now();
        if cancel.is_cancelled() {
            return Err(Error::Cancelled(id));
        }

        let mut held = LockSet::new();
        for request in input.descriptor.lock_plan() {
            let handle = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::Cancelled(id)),
                acquired = self.locks.acquire(request.key, id, request.mode, None) => acquired?,
            };
            held.push(handle);
        }
        if !held.is_empty() {
            debug!(locks = held.len(), "Declared resources locked");
        }

        self.ledger.mark_running(id).await?;

        if cancel.is_cancelled() {
            return Err(Error::Cancelled(id));
        }

        let max_tokens = input
            .max_context_tokens
            .unwrap_or(self.config.max_context_tokens);
        let bundle = self
            .retriever
            .retrieve(&input.context_query, &input.scope, max_tokens)
            .await?;
        log_bundle(&bundle);

        // Not raced against cancellation: an in-flight model call finishes
        let call_started = Instant::now();
        let response = self
            .gateway
            .complete(&bundle, &input.descriptor, input.model_hint.as_deref())
            .await;
        let released = if input.descriptor.role.is_worker() {
            release_locks(id, &mut held)
        } else {
            0
        };
        let response = response?;
        debug!(
            released,
            still_held = held.len(),
            latency_ms = call_started.elapsed().as_millis() as u64,
            model = %response.model_used,
            "Model call returned"
        );

        let rules = PlanRules {
            project_id: input
                .scope
                .project_id
                .clone()
                .unwrap_or_else(|| DEFAULT_PROJECT.to_string()),
            max_workers: self.config.max_workers,
        };
        let output = input.descriptor.role.interpret(&response.content, &rules)?;

        let metrics = ExecutionMetrics {
            prompt_tokens: response.tokens_used.prompt,
            completion_tokens: response.tokens_used.completion,
            context_tokens: u32::try_from(bundle.total_tokens).unwrap_or(u32::MAX),
            latency_ms: started.elapsed().as_millis() as u64,
            cost_usd: response.cost_usd,
            model_used: Some(response.model_used.clone()),
        };
        self.ledger.record_metrics(id, metrics.clone()).await?;

        Ok(StepOutput {
            response,
            output,
            metrics,
            context_truncated: bundle.truncated,
            locks: held,
        })
    }

    /// Mark `id` failed with the detail of `err`
    pub(crate) async fn fail(&self, id: ExecutionId, err: &Error) {
        let detail = err.detail();
        match self.ledger.fail(id, detail).await {
            Ok(row) => error!(
                execution_id = %id,
                role = %row.role,
                code = err.code(),
                error = %err,
                "Execution failed"
            ),
            Err(e) => warn!(
                execution_id = %id,
                error = %e,
                "Could not record execution failure"
            ),
        }
    }
}

/// Release `held`, warning about any lock taken back while it was held
fn release_locks(id: ExecutionId, held: &mut LockSet) -> usize {
    if let Err(e) = held.verify() {
        let err = Error::from(e);
        warn!(execution_id = %id, code = err.code(), error = %err, "Lock lost before release");
    }
    held.release_all()
}

fn log_bundle(bundle: &ContextBundle) {
    let (index, timeline, full) = bundle.level_counts();
    debug!(
        entries = bundle.len(),
        index,
        timeline,
        full,
        total_tokens = bundle.total_tokens,
        max_tokens = bundle.max_tokens,
        "Context retrieved"
    );
    for diagnostic in bundle.diagnostics() {
        debug!(code = diagnostic.code(), "{}", diagnostic);
    }
}
