//! Execution ledger model
//!
//! An [`AgentExecution`] is one node of the hierarchy tree. Nodes reference
//! their parent by id only; the tree lives in an arena owned by the ledger.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ErrorKind;

/// Unique identifier for an agent execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionId(Uuid);

impl ExecutionId {
    /// Create a new random execution ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create from an existing UUID
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the inner UUID
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }

    /// Short form for log lines and tree views: first 8 chars
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ExecutionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

/// Role of a node in the Orchestrator -> Planner -> Worker hierarchy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    Orchestrator,
    Planner,
    Coder,
    Reviewer,
    Tester,
}

impl AgentRole {
    /// All roles, top of the hierarchy first
    pub const ALL: [AgentRole; 5] = [
        Self::Orchestrator,
        Self::Planner,
        Self::Coder,
        Self::Reviewer,
        Self::Tester,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Orchestrator => "orchestrator",
            Self::Planner => "planner",
            Self::Coder => "coder",
            Self::Reviewer => "reviewer",
            Self::Tester => "tester",
        }
    }

    /// Depth in the hierarchy (1 = Orchestrator, 3 = Worker)
    pub fn level(&self) -> u8 {
        match self {
            Self::Orchestrator => 1,
            Self::Planner => 2,
            Self::Coder | Self::Reviewer | Self::Tester => 3,
        }
    }

    /// Whether this role executes a concrete task (leaf of the tree)
    pub fn is_worker(&self) -> bool {
        self.level() == 3
    }

    /// Whether a node of this role may create a child of `child` role
    pub fn can_spawn(&self, child: AgentRole) -> bool {
        match self {
            Self::Orchestrator => child == Self::Planner,
            Self::Planner => child.is_worker(),
            _ => false,
        }
    }
}

impl fmt::Display for AgentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "orchestrator" => Ok(Self::Orchestrator),
            "planner" => Ok(Self::Planner),
            "coder" => Ok(Self::Coder),
            "reviewer" => Ok(Self::Reviewer),
            "tester" => Ok(Self::Tester),
            other => Err(format!("unknown agent role '{}'", other)),
        }
    }
}

/// Lifecycle status: `Pending -> Running -> {Succeeded | Failed}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    /// The only legal edges of the lifecycle
    pub fn can_transition_to(&self, next: ExecutionStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running)
                | (Self::Running, Self::Succeeded)
                | (Self::Running, Self::Failed)
        )
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown execution status '{}'", other)),
        }
    }
}

/// Sub-state of `Running` for nodes that delegate work
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionPhase {
    /// Running its own step (locks, context, model call)
    #[default]
    Working,
    /// Own step done; suspended until every child is terminal
    AwaitingChildren,
}

impl ExecutionPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Working => "working",
            Self::AwaitingChildren => "awaiting_children",
        }
    }
}

impl FromStr for ExecutionPhase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "working" => Ok(Self::Working),
            "awaiting_children" => Ok(Self::AwaitingChildren),
            other => Err(format!("unknown execution phase '{}'", other)),
        }
    }
}

/// Token, latency and cost figures for one execution's own step
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionMetrics {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub context_tokens: u32,
    pub latency_ms: u64,
    pub cost_usd: Option<f64>,
    pub model_used: Option<String>,
}

impl ExecutionMetrics {
    pub fn total_tokens(&self) -> u32 {
        self.prompt_tokens.saturating_add(self.completion_tokens)
    }

    pub fn with_latency(mut self, latency_ms: u64) -> Self {
        self.latency_ms = latency_ms;
        self
    }
}

/// Error detail recorded on every `Failed` execution
///
/// `failed_execution`/`failed_role` point at the deepest descendant whose
/// failure caused this one; both are `None` when the failure is local.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub kind: ErrorKind,
    pub message: String,
    pub failed_execution: Option<ExecutionId>,
    pub failed_role: Option<AgentRole>,
}

impl ErrorDetail {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        let mut message = message.into();
        if message.trim().is_empty() {
            message = format!("{} (no further detail)", kind);
        }
        Self {
            kind,
            message,
            failed_execution: None,
            failed_role: None,
        }
    }

    pub fn caused_by(mut self, execution: ExecutionId, role: AgentRole) -> Self {
        self.failed_execution = Some(execution);
        self.failed_role = Some(role);
        self
    }
}

impl fmt::Display for ErrorDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.kind, self.message)
    }
}

/// One row of the append-only execution ledger
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentExecution {
    pub id: ExecutionId,
    pub parent_id: Option<ExecutionId>,
    pub role: AgentRole,
    pub status: ExecutionStatus,
    pub phase: ExecutionPhase,
    /// Position among the parent's children (spawn order)
    pub child_index: Option<u32>,
    pub input: serde_json::Value,
    pub output: Option<serde_json::Value>,
    pub error: Option<ErrorDetail>,
    pub metrics: ExecutionMetrics,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl AgentExecution {
    pub fn new(
        role: AgentRole,
        parent_id: Option<ExecutionId>,
        child_index: Option<u32>,
        input: serde_json::Value,
    ) -> Self {
        Self {
            id: ExecutionId::new(),
            parent_id,
            role,
            status: ExecutionStatus::Pending,
            phase: ExecutionPhase::Working,
            child_index,
            input,
            output: None,
            error: None,
            metrics: ExecutionMetrics::default(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Wall time between start and completion, when both are known
    pub fn duration_ms(&self) -> Option<i64> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds()),
            _ => None,
        }
    }
}

/// A status transition as published on the status stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusEvent {
    pub execution_id: ExecutionId,
    pub role: AgentRole,
    pub status: ExecutionStatus,
    pub parent_id: Option<ExecutionId>,
    pub at: DateTime<Utc>,
}

/// An execution with its descendants, children in spawn order
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionTree {
    pub execution: AgentExecution,
    pub children: Vec<ExecutionTree>,
}

impl ExecutionTree {
    /// Number of nodes in this subtree
    pub fn size(&self) -> usize {
        1 + self.children.iter().map(|c| c.size()).sum::<usize>()
    }

    /// Depth-first walk, parent before children
    pub fn walk(&self) -> Vec<&AgentExecution> {
        let mut out = vec![&self.execution];
        for child in &self.children {
            out.extend(child.walk());
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_edges() {
        use ExecutionStatus::*;
        assert!(Pending.can_transition_to(Running));
        assert!(Running.can_transition_to(Succeeded));
        assert!(Running.can_transition_to(Failed));

        assert!(!Pending.can_transition_to(Succeeded));
        assert!(!Pending.can_transition_to(Failed));
        assert!(!Succeeded.can_transition_to(Running));
        assert!(!Failed.can_transition_to(Failed));
        assert!(!Running.can_transition_to(Pending));
    }

    #[test]
    fn test_role_spawn_rules() {
        assert!(AgentRole::Orchestrator.can_spawn(AgentRole::Planner));
        assert!(!AgentRole::Orchestrator.can_spawn(AgentRole::Coder));
        assert!(AgentRole::Planner.can_spawn(AgentRole::Tester));
        assert!(!AgentRole::Planner.can_spawn(AgentRole::Planner));
        assert!(!AgentRole::Coder.can_spawn(AgentRole::Reviewer));
    }

    #[test]
    fn test_role_round_trips_through_str() {
        for role in AgentRole::ALL {
            assert_eq!(role.as_str().parse::<AgentRole>().unwrap(), role);
        }
        assert!("janitor".parse::<AgentRole>().is_err());
    }

    #[test]
    fn test_execution_id_short_form() {
        let id = ExecutionId::new();
        assert_eq!(id.short().len(), 8);
        assert!(id.to_string().starts_with(&id.short()));
        assert_eq!(id.to_string().parse::<ExecutionId>().unwrap(), id);
    }

    #[test]
    fn test_metrics_total_saturates() {
        let metrics = ExecutionMetrics {
            prompt_tokens: u32::MAX - 1,
            completion_tokens: 10,
            ..Default::default()
        };
        assert_eq!(metrics.total_tokens(), u32::MAX);
    }

    #[test]
    fn test_error_detail_never_empty() {
        let detail = ErrorDetail::new(ErrorKind::Internal, "   ");
        assert!(!detail.message.trim().is_empty());
    }
}
