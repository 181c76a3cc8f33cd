//! Agent executions: the hierarchy tree, its ledger, and the status stream

pub mod ledger;
pub mod types;

pub use ledger::{
    ExecutionLedger, ExecutionStore, LedgerError, LedgerResult, STATUS_CHANNEL_CAPACITY, load_tree,
};
pub use types::{
    AgentExecution, AgentRole, ErrorDetail, ExecutionId, ExecutionMetrics, ExecutionPhase,
    ExecutionStatus, ExecutionTree, StatusEvent,
};
