//! Agent scheduler - the Orchestrator -> Planner -> Workers hierarchy
//!
//! Each node runs its own step through the [`AgentExecutor`]; delegating
//! nodes then spawn their children as concurrent tasks, suspend in
//! `AwaitingChildren` until every child is terminal, and aggregate the
//! results in declaration order. A delegating node keeps its locks, the
//! Orchestrator's feature lock among them, until its children are done.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures_util::FutureExt;
use futures_util::future::{BoxFuture, join_all};
use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::domain::execution::{
    AgentExecution, AgentRole, ErrorDetail, ExecutionId, ExecutionLedger, ExecutionPhase,
    ExecutionStatus,
};
use crate::error::{Error, ErrorKind, Result};

use super::executor::{AgentExecutor, StepOutput};
use super::output::RoleOutput;
use super::result::AgentResult;
use super::task::{FeatureInput, TaskDescriptor, TaskInput};

/// Scheduler settings
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How long a parent waits for all of its children
    pub aggregate_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            aggregate_timeout: Duration::from_secs(1800),
        }
    }
}

impl SchedulerConfig {
    pub fn with_aggregate_timeout(mut self, timeout: Duration) -> Self {
        self.aggregate_timeout = timeout;
        self
    }
}

/// A feature run in progress
pub struct FeatureHandle {
    root_id: ExecutionId,
    cancel: CancellationToken,
    join: JoinHandle<AgentResult>,
}

impl FeatureHandle {
    /// Id of the Orchestrator execution
    pub fn id(&self) -> ExecutionId {
        self.root_id
    }

    /// Request cancellation of the whole hierarchy
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Wait for the hierarchy to finish
    ///
    /// A failed feature is still `Ok`: its result carries the `Failed`
    /// status and error detail. `Err` means the run itself was lost.
    pub async fn wait(self) -> Result<AgentResult> {
        self.join
            .await
            .map_err(|e| Error::TaskAborted(format!("feature {}: {}", self.root_id, e)))
    }
}

impl std::fmt::Debug for FeatureHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeatureHandle")
            .field("root_id", &self.root_id)
            .field("finished", &self.join.is_finished())
            .finish()
    }
}

/// Drives feature hierarchies on top of an [`AgentExecutor`]
#[derive(Clone)]
pub struct AgentScheduler {
    executor: AgentExecutor,
    config: SchedulerConfig,
    active: Arc<DashMap<ExecutionId, CancellationToken>>,
}

impl std::fmt::Debug for AgentScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentScheduler")
            .field("config", &self.config)
            .field("active", &self.active.len())
            .finish()
    }
}

/// A delegating node's child, spawned in declaration order
struct Spawned {
    id: ExecutionId,
    task_id: String,
    join: JoinHandle<AgentResult>,
}

impl AgentScheduler {
    pub fn new(executor: AgentExecutor) -> Self {
        Self {
            executor,
            config: SchedulerConfig::default(),
            active: Arc::new(DashMap::new()),
        }
    }

    pub fn with_config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn executor(&self) -> &AgentExecutor {
        &self.executor
    }

    pub fn ledger(&self) -> &ExecutionLedger {
        self.executor.ledger()
    }

    /// Number of executions that can still be cancelled
    pub fn active(&self) -> usize {
        self.active.len()
    }

    /// Insert the Orchestrator row and start the hierarchy in the background
    ///
    /// The returned handle's id is the root execution, already recorded as
    /// `Pending` when this returns.
    pub async fn start_feature(&self, feature: FeatureInput) -> Result<FeatureHandle> {
        if feature.description.trim().is_empty() {
            return Err(Error::InvalidInput("feature description is empty".to_string()));
        }

        let feature = Arc::new(feature);
        let input = feature.orchestrator_input();
        let root_id = self.executor.prepare(None, &input).await?;
        let cancel = CancellationToken::new();
        self.active.insert(root_id, cancel.clone());

        info!(
            execution_id = %root_id,
            project_id = %feature.project_id,
            feature_id = %feature.feature_id,
            "Feature started"
        );

        let span = info_span!("feature", feature_id = %feature.feature_id, root_id = %root_id);
        let join = tokio::spawn(
            self.clone()
                .run_node(root_id, input, cancel.clone(), feature)
                .instrument(span),
        );

        Ok(FeatureHandle {
            root_id,
            cancel,
            join,
        })
    }

    /// Run a feature to completion
    pub async fn run_feature(&self, feature: FeatureInput) -> Result<AgentResult> {
        self.start_feature(feature).await?.wait().await
    }

    /// Cancel an execution and its non-terminal descendants
    ///
    /// Returns false when `id` is unknown or already finished.
    pub fn cancel(&self, id: ExecutionId) -> bool {
        match self.active.get(&id) {
            Some(token) => {
                info!(execution_id = %id, "Cancellation requested");
                token.cancel();
                true
            }
            None => false,
        }
    }

    fn run_node(
        self,
        id: ExecutionId,
        input: TaskInput,
        cancel: CancellationToken,
        feature: Arc<FeatureInput>,
    ) -> BoxFuture<'static, AgentResult> {
        async move {
            let result = if input.descriptor.role.is_worker() {
                self.run_worker(id, &input, &cancel).await
            } else {
                self.run_delegating(id, &input, &cancel, &feature).await
            };
            self.active.remove(&id);
            result
        }
        .boxed()
    }

    async fn run_worker(&self, id: ExecutionId, input: &TaskInput, cancel: &CancellationToken) -> AgentResult {
        match self.executor.run_prepared(id, input, cancel).await {
            Ok(result) => result,
            Err(_) => self.snapshot(id, &input.descriptor.task_id),
        }
    }

    async fn run_delegating(
        &self,
        id: ExecutionId,
        input: &TaskInput,
        cancel: &CancellationToken,
        feature: &Arc<FeatureInput>,
    ) -> AgentResult {
        let task_id = &input.descriptor.task_id;
        let step = match self.executor.step(id, input, cancel).await {
            Ok(step) => step,
            Err(_) => return self.snapshot(id, task_id),
        };

        if let Err(e) = self.ledger().set_phase(id, ExecutionPhase::AwaitingChildren).await {
            return self.finish_failed(id, task_id, step, Vec::new(), Error::from(e)).await;
        }

        let child_inputs = child_inputs(&step.output, input, feature);
        debug!(children = child_inputs.len(), "Spawning children");

        let mut spawned = Vec::with_capacity(child_inputs.len());
        let mut spawn_error = None;
        for child in child_inputs {
            if cancel.is_cancelled() {
                break;
            }
            match self.executor.prepare(Some(id), &child).await {
                Ok(child_id) => {
                    let token = cancel.child_token();
                    self.active.insert(child_id, token.clone());
                    let task_id = child.descriptor.task_id.clone();
                    let join = tokio::spawn(
                        self.clone()
                            .run_node(child_id, child, token, feature.clone())
                            .in_current_span(),
                    );
                    spawned.push(Spawned {
                        id: child_id,
                        task_id,
                        join,
                    });
                }
                Err(e) => {
                    spawn_error = Some(e);
                    break;
                }
            }
        }

        let (children, timed_out) = self.await_children(spawned, cancel).await;

        let failure = if timed_out {
            Some(Error::ExecutionTimeout {
                execution_id: id,
                deadline_ms: self.config.aggregate_timeout.as_millis() as u64,
            })
        } else if let Some(e) = spawn_error {
            Some(e)
        } else if cancel.is_cancelled() {
            Some(Error::Cancelled(id))
        } else {
            children
                .iter()
                .find(|child| child.status != ExecutionStatus::Succeeded)
                .map(child_failure)
        };

        match failure {
            Some(err) => self.finish_failed(id, task_id, step, children, err).await,
            None => self.finish_succeeded(id, task_id, step, children).await,
        }
    }

    /// Await every spawned child, cancelling the rest once the aggregate
    /// timeout elapses; results come back in spawn order
    async fn await_children(&self, spawned: Vec<Spawned>, cancel: &CancellationToken) -> (Vec<AgentResult>, bool) {
        let meta: Vec<(ExecutionId, String)> = spawned
            .iter()
            .map(|s| (s.id, s.task_id.clone()))
            .collect();
        let all = join_all(spawned.into_iter().map(|s| s.join));
        tokio::pin!(all);

        let mut timed_out = false;
        let outcomes = tokio::select! {
            outcomes = &mut all => outcomes,
            _ = tokio::time::sleep(self.config.aggregate_timeout) => {
                timed_out = true;
                warn!(
                    timeout_ms = self.config.aggregate_timeout.as_millis() as u64,
                    "Children did not finish in time, cancelling"
                );
                cancel.cancel();
                all.as_mut().await
            }
        };

        let mut results = Vec::with_capacity(outcomes.len());
        for ((child_id, task_id), outcome) in meta.into_iter().zip(outcomes) {
            match outcome {
                Ok(result) => results.push(result),
                Err(e) => {
                    self.active.remove(&child_id);
                    let err = Error::TaskAborted(e.to_string());
                    self.executor.fail(child_id, &err).await;
                    results.push(self.snapshot(child_id, &task_id));
                }
            }
        }
        (results, timed_out)
    }

    async fn finish_succeeded(
        &self,
        id: ExecutionId,
        task_id: &str,
        mut step: StepOutput,
        children: Vec<AgentResult>,
    ) -> AgentResult {
        release_held(id, &mut step);
        let output = aggregate_output(task_id, &step, &children);
        match self.ledger().succeed(id, output).await {
            Ok(row) => {
                info!(
                    execution_id = %id,
                    role = %row.role,
                    children = children.len(),
                    "Execution succeeded"
                );
                let mut result = AgentResult::from_row(&row, task_id);
                result.content = Some(step.response.content);
                result.output = Some(step.output);
                result.children = children;
                result
            }
            Err(e) => self.finish_failed(id, task_id, step, children, Error::from(e)).await,
        }
    }

    async fn finish_failed(
        &self,
        id: ExecutionId,
        task_id: &str,
        mut step: StepOutput,
        children: Vec<AgentResult>,
        err: Error,
    ) -> AgentResult {
        release_held(id, &mut step);
        self.executor.fail(id, &err).await;
        let mut result = self.snapshot(id, task_id);
        result.content = Some(step.response.content);
        result.output = Some(step.output);
        result.children = children;
        result
    }

    /// Result rebuilt from the ledger row
    fn snapshot(&self, id: ExecutionId, task_id: &str) -> AgentResult {
        match self.ledger().get(id) {
            Some(row) => AgentResult::from_row(&row, task_id),
            None => {
                let mut row = AgentExecution::new(AgentRole::Orchestrator, None, None, json!(null));
                row.id = id;
                row.status = ExecutionStatus::Failed;
                row.error = Some(ErrorDetail::new(
                    ErrorKind::Internal,
                    format!("execution {} missing from the ledger", id),
                ));
                AgentResult::from_row(&row, task_id)
            }
        }
    }
}

fn release_held(id: ExecutionId, step: &mut StepOutput) {
    let released = step.release_locks(id);
    if released > 0 {
        debug!(execution_id = %id, released, "Released locks held across children");
    }
}

/// Inputs for a delegating node's children, in declaration order
fn child_inputs(output: &RoleOutput, parent: &TaskInput, feature: &FeatureInput) -> Vec<TaskInput> {
    let inherit = |descriptor: TaskDescriptor| {
        let mut input = TaskInput::new(descriptor, parent.scope.clone());
        input.max_context_tokens = parent.max_context_tokens;
        input.model_hint = parent.model_hint.clone();
        input
    };

    match output {
        RoleOutput::Delegate { planner_brief } => vec![inherit(TaskDescriptor::new(
            format!("{}:plan", feature.feature_id),
            AgentRole::Planner,
            planner_brief.clone(),
        ))],
        RoleOutput::Fanout { tasks } => tasks.iter().cloned().map(inherit).collect(),
        RoleOutput::Completed { .. } => Vec::new(),
    }
}

fn child_failure(child: &AgentResult) -> Error {
    let cause = child.error.clone().unwrap_or_else(|| {
        ErrorDetail::new(
            ErrorKind::Internal,
            format!("{} {} ended {}", child.role, child.execution_id, child.status),
        )
    });
    Error::ChildFailure {
        child_id: child.execution_id,
        child_role: child.role,
        cause: Box::new(cause),
    }
}

fn aggregate_output(task_id: &str, step: &StepOutput, children: &[AgentResult]) -> serde_json::Value {
    let results: Vec<serde_json::Value> = children
        .iter()
        .flat_map(|child| child.worker_results())
        .map(|worker| {
            json!({
                "execution_id": worker.execution_id,
                "task_id": worker.task_id,
                "role": worker.role,
                "content": worker.content,
            })
        })
        .collect();

    json!({
        "task_id": task_id,
        "model": step.response.model_used,
        "content": step.response.content,
        "output": step.output,
        "results": results,
    })
}
