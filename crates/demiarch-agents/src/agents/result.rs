//! Results returned by the executor and the scheduler

use serde::{Deserialize, Serialize};

use crate::domain::execution::{
    AgentExecution, AgentRole, ErrorDetail, ExecutionId, ExecutionMetrics, ExecutionStatus,
};

use super::output::RoleOutput;

/// Outcome of one execution, with its children in spawn order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentResult {
    pub execution_id: ExecutionId,
    pub role: AgentRole,
    pub task_id: String,
    pub status: ExecutionStatus,
    /// Raw model response of this execution's own step
    pub content: Option<String>,
    pub output: Option<RoleOutput>,
    pub metrics: ExecutionMetrics,
    pub error: Option<ErrorDetail>,
    pub children: Vec<AgentResult>,
}

impl AgentResult {
    pub(crate) fn from_row(row: &AgentExecution, task_id: impl Into<String>) -> Self {
        Self {
            execution_id: row.id,
            role: row.role,
            task_id: task_id.into(),
            status: row.status,
            content: None,
            output: None,
            metrics: row.metrics.clone(),
            error: row.error.clone(),
            children: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Succeeded
    }

    /// Tokens spent by this execution and all of its descendants
    pub fn total_tokens(&self) -> u64 {
        u64::from(self.metrics.total_tokens())
            + self.children.iter().map(|c| c.total_tokens()).sum::<u64>()
    }

    /// Summed cost of the subtree, when at least one step reported one
    pub fn total_cost_usd(&self) -> Option<f64> {
        let own = self.metrics.cost_usd;
        self.children
            .iter()
            .map(|c| c.total_cost_usd())
            .fold(own, |acc, c| match (acc, c) {
                (Some(a), Some(b)) => Some(a + b),
                (a, b) => a.or(b),
            })
    }

    /// Worker results of the subtree in declaration order
    pub fn worker_results(&self) -> Vec<&AgentResult> {
        if self.role.is_worker() {
            return vec![self];
        }
        self.children.iter().flat_map(|c| c.worker_results()).collect()
    }

    /// The deepest failed descendant, following the first failing child
    pub fn first_failure(&self) -> Option<&AgentResult> {
        if self.status != ExecutionStatus::Failed {
            return None;
        }
        self.children
            .iter()
            .find_map(|c| c.first_failure())
            .or(Some(self))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn leaf(role: AgentRole, status: ExecutionStatus, tokens: u32) -> AgentResult {
        let mut row = AgentExecution::new(role, None, None, serde_json::Value::Null);
        row.status = status;
        row.metrics.prompt_tokens = tokens;
        row.metrics.completion_tokens = 1;
        AgentResult::from_row(&row, role.as_str())
    }

    #[test]
    fn test_totals_are_recursive() {
        let mut planner = leaf(AgentRole::Planner, ExecutionStatus::Succeeded, 10);
        planner.children = vec![
            leaf(AgentRole::Coder, ExecutionStatus::Succeeded, 20),
            leaf(AgentRole::Tester, ExecutionStatus::Succeeded, 30),
        ];
        planner.children[1].metrics.cost_usd = Some(0.5);

        assert_eq!(planner.total_tokens(), 63);
        assert_eq!(planner.total_cost_usd(), Some(0.5));
        assert_eq!(planner.worker_results().len(), 2);
    }

    #[test]
    fn test_first_failure_descends() {
        let mut planner = leaf(AgentRole::Planner, ExecutionStatus::Failed, 0);
        let mut bad = leaf(AgentRole::Reviewer, ExecutionStatus::Failed, 0);
        bad.error = Some(ErrorDetail::new(ErrorKind::GatewayFailure, "boom"));
        planner.children = vec![leaf(AgentRole::Coder, ExecutionStatus::Succeeded, 0), bad];

        let failure = planner.first_failure().unwrap();
        assert_eq!(failure.role, AgentRole::Reviewer);

        let ok = leaf(AgentRole::Coder, ExecutionStatus::Succeeded, 0);
        assert!(ok.first_failure().is_none());
    }
}
