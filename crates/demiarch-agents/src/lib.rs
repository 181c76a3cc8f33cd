//! Demiarch Agent Core
//!
//! Concurrency and orchestration for Demiarch's hierarchical agents:
//! - Resource locks shared by every concurrent execution
//! - Progressive-disclosure context retrieval (index → timeline → full)
//! - Agent executor and the Orchestrator → Planner → Workers scheduler
//! - Model gateway (OpenRouter, or scripted for offline runs)
//! - Execution ledger with a status stream, persisted to SQLite

pub mod agents;
pub mod config;
pub mod domain;
pub mod error;
pub mod gateway;
pub mod runtime;
pub mod storage;

pub use error::{Error, ErrorKind, Result};
pub use runtime::{AgentRuntime, AgentRuntimeBuilder};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::agents::{AgentResult, AgentScheduler, FeatureInput, TaskDescriptor, TaskInput};
    pub use crate::config::Config;
    pub use crate::domain::context::{NewContextItem, SourceScope, SourceType};
    pub use crate::domain::execution::{AgentRole, ExecutionId, ExecutionStatus};
    pub use crate::domain::locking::{LockMode, ResourceKey};
    pub use crate::error::{Error, ErrorKind, Result};
    pub use crate::runtime::AgentRuntime;
}

#[cfg(test)]
mod error_tests;
