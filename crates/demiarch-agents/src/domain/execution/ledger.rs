//! Append-only execution ledger
//!
//! Rows live in an in-memory arena keyed by [`ExecutionId`]. Every change is
//! written through to an optional durable [`ExecutionStore`] and announced on
//! the status stream.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, error};

use super::types::{
    AgentExecution, AgentRole, ErrorDetail, ExecutionId, ExecutionMetrics, ExecutionPhase,
    ExecutionStatus, ExecutionTree, StatusEvent,
};
use crate::domain::locking::HolderLiveness;

/// Capacity of the status stream; slower subscribers lose the oldest events
pub const STATUS_CHANNEL_CAPACITY: usize = 256;

/// Ledger errors
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Execution {0} not found")]
    NotFound(ExecutionId),

    #[error("Illegal status transition for {id}: {from} -> {to}")]
    InvalidTransition {
        id: ExecutionId,
        from: ExecutionStatus,
        to: ExecutionStatus,
    },

    #[error("Parent execution {parent_id} is {status}")]
    ParentNotRunning {
        parent_id: ExecutionId,
        status: ExecutionStatus,
    },

    #[error("A {parent} execution cannot spawn a {child} child")]
    InvalidHierarchy { parent: AgentRole, child: AgentRole },

    #[error("Execution store error: {0}")]
    Store(String),
}

/// Result type for ledger operations
pub type LedgerResult<T> = Result<T, LedgerError>;

/// Durable storage for execution rows
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    async fn insert(&self, execution: &AgentExecution) -> LedgerResult<()>;

    async fn update(&self, execution: &AgentExecution) -> LedgerResult<()>;

    async fn get(&self, id: ExecutionId) -> LedgerResult<Option<AgentExecution>>;

    /// Children of `parent_id` in spawn order
    async fn children(&self, parent_id: ExecutionId) -> LedgerResult<Vec<AgentExecution>>;
}

struct LedgerInner {
    rows: DashMap<ExecutionId, AgentExecution>,
    children: DashMap<ExecutionId, Vec<ExecutionId>>,
    store: Option<Arc<dyn ExecutionStore>>,
    events: broadcast::Sender<StatusEvent>,
}

/// The arena of execution records plus the status stream
#[derive(Clone)]
pub struct ExecutionLedger {
    inner: Arc<LedgerInner>,
}

impl Default for ExecutionLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ExecutionLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionLedger")
            .field("rows", &self.inner.rows.len())
            .field("durable", &self.inner.store.is_some())
            .finish()
    }
}

impl ExecutionLedger {
    /// In-memory ledger
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Ledger writing through to `store`
    pub fn with_store(store: Arc<dyn ExecutionStore>) -> Self {
        Self::build(Some(store))
    }

    fn build(store: Option<Arc<dyn ExecutionStore>>) -> Self {
        let (events, _) = broadcast::channel(STATUS_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(LedgerInner {
                rows: DashMap::new(),
                children: DashMap::new(),
                store,
                events,
            }),
        }
    }

    /// Subscribe to status transitions
    ///
    /// Sending never waits for subscribers; a subscriber that falls behind
    /// sees `RecvError::Lagged` and misses events.
    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.inner.events.subscribe()
    }

    fn publish(&self, row: &AgentExecution) {
        let _ = self.inner.events.send(StatusEvent {
            execution_id: row.id,
            role: row.role,
            status: row.status,
            parent_id: row.parent_id,
            at: Utc::now(),
        });
    }

    /// Create a `Pending` row
    ///
    /// A child may only be created by a `Running` parent whose role is allowed
    /// to spawn `role`. Children are numbered in creation order.
    pub async fn create(
        &self,
        role: AgentRole,
        parent_id: Option<ExecutionId>,
        input: serde_json::Value,
    ) -> LedgerResult<AgentExecution> {
        let child_index = match parent_id {
            Some(pid) => {
                let parent = self.inner.rows.get(&pid).ok_or(LedgerError::NotFound(pid))?;
                if parent.status != ExecutionStatus::Running {
                    return Err(LedgerError::ParentNotRunning {
                        parent_id: pid,
                        status: parent.status,
                    });
                }
                if !parent.role.can_spawn(role) {
                    return Err(LedgerError::InvalidHierarchy {
                        parent: parent.role,
                        child: role,
                    });
                }
                drop(parent);
                let count = self.inner.children.get(&pid).map_or(0, |c| c.len());
                Some(count as u32)
            }
            None => None,
        };

        let row = AgentExecution::new(role, parent_id, child_index, input);
        if let Some(store) = &self.inner.store {
            store.insert(&row).await?;
        }

        self.inner.rows.insert(row.id, row.clone());
        if let Some(pid) = parent_id {
            self.inner.children.entry(pid).or_default().push(row.id);
        }

        debug!(execution_id = %row.id, role = %role, parent_id = ?parent_id, "Execution created");
        self.publish(&row);
        Ok(row)
    }

    async fn modify<F>(&self, id: ExecutionId, to: Option<ExecutionStatus>, f: F) -> LedgerResult<AgentExecution>
    where
        F: FnOnce(&mut AgentExecution),
    {
        let row = {
            let mut row = self.inner.rows.get_mut(&id).ok_or(LedgerError::NotFound(id))?;
            if let Some(to) = to {
                if !row.status.can_transition_to(to) {
                    return Err(LedgerError::InvalidTransition {
                        id,
                        from: row.status,
                        to,
                    });
                }
                row.status = to;
            }
            f(&mut row);
            row.clone()
        };

        if let Some(store) = &self.inner.store {
            if let Err(e) = store.update(&row).await {
                error!(execution_id = %id, error = %e, "Failed to persist execution update");
            }
        }
        if to.is_some() {
            self.publish(&row);
        }
        Ok(row)
    }

    /// `Pending -> Running`
    pub async fn mark_running(&self, id: ExecutionId) -> LedgerResult<AgentExecution> {
        self.modify(id, Some(ExecutionStatus::Running), |row| {
            row.started_at = Some(Utc::now());
        })
        .await
    }

    /// Switch the sub-state of a running execution
    pub async fn set_phase(&self, id: ExecutionId, phase: ExecutionPhase) -> LedgerResult<AgentExecution> {
        self.modify(id, None, |row| row.phase = phase).await
    }

    /// Record the metrics of the execution's own step
    pub async fn record_metrics(
        &self,
        id: ExecutionId,
        metrics: ExecutionMetrics,
    ) -> LedgerResult<AgentExecution> {
        self.modify(id, None, |row| row.metrics = metrics).await
    }

    /// `Running -> Succeeded`
    pub async fn succeed(
        &self,
        id: ExecutionId,
        output: serde_json::Value,
    ) -> LedgerResult<AgentExecution> {
        self.modify(id, Some(ExecutionStatus::Succeeded), |row| {
            row.output = Some(output);
            row.phase = ExecutionPhase::Working;
            row.completed_at = Some(Utc::now());
        })
        .await
    }

    /// `Running -> Failed`
    ///
    /// A `Pending` row is first moved to `Running` so that no execution is
    /// ever observed skipping it.
    pub async fn fail(&self, id: ExecutionId, detail: ErrorDetail) -> LedgerResult<AgentExecution> {
        if self.status(id)? == ExecutionStatus::Pending {
            self.mark_running(id).await?;
        }
        self.modify(id, Some(ExecutionStatus::Failed), |row| {
            row.error = Some(detail);
            row.phase = ExecutionPhase::Working;
            row.completed_at = Some(Utc::now());
        })
        .await
    }

    pub fn get(&self, id: ExecutionId) -> Option<AgentExecution> {
        self.inner.rows.get(&id).map(|row| row.clone())
    }

    pub fn status(&self, id: ExecutionId) -> LedgerResult<ExecutionStatus> {
        self.inner
            .rows
            .get(&id)
            .map(|row| row.status)
            .ok_or(LedgerError::NotFound(id))
    }

    /// Children of `parent_id` in spawn order
    pub fn children(&self, parent_id: ExecutionId) -> Vec<AgentExecution> {
        let ids = self
            .inner
            .children
            .get(&parent_id)
            .map(|c| c.clone())
            .unwrap_or_default();
        ids.into_iter().filter_map(|id| self.get(id)).collect()
    }

    /// Root executions, oldest first
    pub fn roots(&self) -> Vec<AgentExecution> {
        let mut roots: Vec<AgentExecution> = self
            .inner
            .rows
            .iter()
            .filter(|row| row.parent_id.is_none())
            .map(|row| row.clone())
            .collect();
        roots.sort_by_key(|row| row.created_at);
        roots
    }

    pub fn len(&self) -> usize {
        self.inner.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.rows.is_empty()
    }

    /// The subtree rooted at `root`
    pub fn tree(&self, root: ExecutionId) -> LedgerResult<ExecutionTree> {
        let execution = self.get(root).ok_or(LedgerError::NotFound(root))?;
        let children = self
            .children(root)
            .into_iter()
            .map(|child| self.tree(child.id))
            .collect::<LedgerResult<Vec<_>>>()?;
        Ok(ExecutionTree {
            execution,
            children,
        })
    }
}

impl HolderLiveness for ExecutionLedger {
    fn is_running(&self, holder: ExecutionId) -> bool {
        self.inner
            .rows
            .get(&holder)
            .is_some_and(|row| row.status == ExecutionStatus::Running)
    }
}

/// Rebuild the subtree rooted at `root` from a durable store
pub fn load_tree<'a>(
    store: &'a dyn ExecutionStore,
    root: ExecutionId,
) -> Pin<Box<dyn Future<Output = LedgerResult<ExecutionTree>> + Send + 'a>> {
    Box::pin(async move {
        let execution = store.get(root).await?.ok_or(LedgerError::NotFound(root))?;
        let mut children = Vec::new();
        for child in store.children(root).await? {
            children.push(load_tree(store, child.id).await?);
        }
        Ok(ExecutionTree {
            execution,
            children,
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use serde_json::json;

    async fn running(ledger: &ExecutionLedger, role: AgentRole, parent: Option<ExecutionId>) -> ExecutionId {
        let row = ledger.create(role, parent, json!({})).await.unwrap();
        ledger.mark_running(row.id).await.unwrap();
        row.id
    }

    #[tokio::test]
    async fn test_lifecycle_and_events() {
        let ledger = ExecutionLedger::new();
        let mut events = ledger.subscribe();

        let row = ledger
            .create(AgentRole::Orchestrator, None, json!({"feature": "login"}))
            .await
            .unwrap();
        assert_eq!(row.status, ExecutionStatus::Pending);
        ledger.mark_running(row.id).await.unwrap();
        let done = ledger.succeed(row.id, json!({"ok": true})).await.unwrap();
        assert!(done.completed_at.is_some());

        let statuses: Vec<ExecutionStatus> = (0..3).map(|_| events.try_recv().unwrap().status).collect();
        assert_eq!(
            statuses,
            vec![
                ExecutionStatus::Pending,
                ExecutionStatus::Running,
                ExecutionStatus::Succeeded
            ]
        );
    }

    #[tokio::test]
    async fn test_terminal_state_is_final() {
        let ledger = ExecutionLedger::new();
        let id = running(&ledger, AgentRole::Coder, None).await;
        ledger
            .fail(id, ErrorDetail::new(ErrorKind::Internal, "boom"))
            .await
            .unwrap();

        let err = ledger.succeed(id, json!(null)).await.unwrap_err();
        assert!(matches!(
            err,
            LedgerError::InvalidTransition {
                from: ExecutionStatus::Failed,
                to: ExecutionStatus::Succeeded,
                ..
            }
        ));
        assert!(ledger.mark_running(id).await.is_err());
    }

    #[tokio::test]
    async fn test_pending_failure_passes_through_running() {
        let ledger = ExecutionLedger::new();
        let row = ledger.create(AgentRole::Tester, None, json!({})).await.unwrap();
        let mut events = ledger.subscribe();

        let failed = ledger
            .fail(row.id, ErrorDetail::new(ErrorKind::Cancelled, "cancelled before start"))
            .await
            .unwrap();
        assert_eq!(failed.status, ExecutionStatus::Failed);
        assert!(failed.started_at.is_some());

        assert_eq!(events.try_recv().unwrap().status, ExecutionStatus::Running);
        assert_eq!(events.try_recv().unwrap().status, ExecutionStatus::Failed);
    }

    #[tokio::test]
    async fn test_child_requires_running_parent() {
        let ledger = ExecutionLedger::new();
        let parent = ledger.create(AgentRole::Orchestrator, None, json!({})).await.unwrap();

        let err = ledger
            .create(AgentRole::Planner, Some(parent.id), json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::ParentNotRunning { .. }));

        let missing = ExecutionId::new();
        let err = ledger
            .create(AgentRole::Planner, Some(missing), json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::NotFound(id) if id == missing));
    }

    #[tokio::test]
    async fn test_hierarchy_rules_enforced() {
        let ledger = ExecutionLedger::new();
        let orchestrator = running(&ledger, AgentRole::Orchestrator, None).await;

        let err = ledger
            .create(AgentRole::Coder, Some(orchestrator), json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::InvalidHierarchy { .. }));
    }

    #[tokio::test]
    async fn test_tree_keeps_spawn_order() {
        let ledger = ExecutionLedger::new();
        let root = running(&ledger, AgentRole::Orchestrator, None).await;
        let planner = running(&ledger, AgentRole::Planner, Some(root)).await;
        let mut workers = Vec::new();
        for role in [AgentRole::Coder, AgentRole::Reviewer, AgentRole::Tester] {
            workers.push(ledger.create(role, Some(planner), json!({})).await.unwrap());
        }

        let tree = ledger.tree(root).unwrap();
        assert_eq!(tree.size(), 5);
        let planner_node = &tree.children[0];
        let order: Vec<Option<u32>> = planner_node
            .children
            .iter()
            .map(|c| c.execution.child_index)
            .collect();
        assert_eq!(order, vec![Some(0), Some(1), Some(2)]);
        assert_eq!(planner_node.children[2].execution.id, workers[2].id);
        assert_eq!(ledger.roots().len(), 1);
    }

    #[tokio::test]
    async fn test_liveness_tracks_running_status() {
        let ledger = ExecutionLedger::new();
        let row = ledger.create(AgentRole::Coder, None, json!({})).await.unwrap();
        assert!(!ledger.is_running(row.id));

        ledger.mark_running(row.id).await.unwrap();
        assert!(ledger.is_running(row.id));

        ledger.succeed(row.id, json!(null)).await.unwrap();
        assert!(!ledger.is_running(row.id));
        assert!(!ledger.is_running(ExecutionId::new()));
    }
}
