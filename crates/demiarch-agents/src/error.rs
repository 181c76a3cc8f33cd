//! Error types for the agent execution core

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::context::{ContextError, ContextItemId};
use crate::domain::execution::{AgentRole, ErrorDetail, ExecutionId, ExecutionStatus, LedgerError};
use crate::domain::locking::LockError;
use crate::gateway::GatewayError;

/// Result type alias using the crate's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by locking, context retrieval, model calls and scheduling
#[derive(Error, Debug)]
pub enum Error {
    // Gateway errors (E100-E199)
    #[error("Model gateway failure: {0}")]
    GatewayFailure(#[from] GatewayError),

    // Lock errors (E300-E399)
    #[error("Lock timeout: resource '{resource}' was not granted within {waited_ms}ms (held by {holder}).")]
    LockTimeout {
        resource: String,
        holder: String,
        waited_ms: u64,
    },

    #[error("Lock on '{resource}' was forcibly reclaimed from {holder}")]
    LockForcedReclaim { resource: String, holder: String },

    #[error("Lock error: {0}")]
    Lock(LockError),

    // Database errors (E400-E499)
    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),

    // Config errors (E600-E699)
    #[error("Configuration error: {0}")]
    ConfigError(String),

    // Cancellation (E700-E799)
    #[error("Execution {0} was cancelled")]
    Cancelled(ExecutionId),

    // Input errors (E800-E899)
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    // Context errors (E1200-E1299)
    #[error("Context budget exceeded: index layer needs {required} tokens, budget is {max_tokens}")]
    ContextBudgetExceeded { required: usize, max_tokens: usize },

    #[error("Context item {0} excluded: prompt-injection marker detected")]
    ContextInjectionDetected(ContextItemId),

    #[error("Context retrieval failed: {0}")]
    ContextRetrievalFailed(#[from] ContextError),

    // Execution errors (E1300-E1399)
    #[error("{child_role} {child_id} failed: {}", .cause.message)]
    ChildFailure {
        child_id: ExecutionId,
        child_role: AgentRole,
        cause: Box<ErrorDetail>,
    },

    #[error("Execution {execution_id} exceeded its {deadline_ms}ms deadline")]
    ExecutionTimeout {
        execution_id: ExecutionId,
        deadline_ms: u64,
    },

    #[error("Invalid plan: {0}")]
    InvalidPlan(String),

    #[error("Illegal status transition for {execution_id}: {from} -> {to}")]
    InvalidTransition {
        execution_id: ExecutionId,
        from: ExecutionStatus,
        to: ExecutionStatus,
    },

    #[error("Execution {0} not found")]
    ExecutionNotFound(ExecutionId),

    #[error("Parent execution {parent_id} is {status}, children require a running parent")]
    ParentNotRunning {
        parent_id: ExecutionId,
        status: ExecutionStatus,
    },

    #[error("Execution store error: {0}")]
    Store(String),

    #[error("Agent task aborted: {0}")]
    TaskAborted(String),

    // Generic errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Get error code for this error type
    pub fn code(&self) -> &'static str {
        match self {
            Self::GatewayFailure(_) => "E100",
            Self::LockTimeout { .. } => "E300",
            Self::LockForcedReclaim { .. } => "E308",
            Self::Lock(e) => e.code(),
            Self::DatabaseError(_) => "E400",
            Self::ConfigError(_) => "E600",
            Self::Cancelled(_) => "E700",
            Self::InvalidInput(_) => "E800",
            Self::ContextRetrievalFailed(_) => "E1200",
            Self::ContextBudgetExceeded { .. } => "E1202",
            Self::ContextInjectionDetected(_) => "E1203",
            Self::ChildFailure { .. } => "E1300",
            Self::ExecutionTimeout { .. } => "E1301",
            Self::InvalidPlan(_) => "E1302",
            Self::InvalidTransition { .. } => "E1303",
            Self::ExecutionNotFound(_) => "E1304",
            Self::ParentNotRunning { .. } => "E1305",
            Self::Store(_) => "E1306",
            Self::TaskAborted(_) => "E1307",
            Self::Serialization(_) | Self::Other(_) | Self::Io(_) => "E9999",
        }
    }

    /// Get suggestion for how to fix this error
    pub fn suggestion(&self) -> Option<String> {
        match self {
            Self::LockTimeout { resource, .. } => Some(format!(
                "Retry later, or inspect holders of '{}' with `demiarch-agents locks`",
                resource
            )),
            Self::GatewayFailure(GatewayError::RateLimited { .. }) => {
                Some("Add fallback models with `demiarch-agents config set llm.fallback_models ...`".to_string())
            }
            Self::GatewayFailure(_) => {
                Some("Check DEMIARCH_API_KEY / OPENROUTER_API_KEY and network access".to_string())
            }
            Self::ChildFailure { cause, .. } => cause
                .failed_execution
                .map(|id| format!("demiarch-agents executions show {}", id)),
            Self::ExecutionTimeout { .. } => {
                Some("Raise scheduler.execution_deadline_secs in the config".to_string())
            }
            Self::ConfigError(_) => Some("demiarch-agents config list".to_string()),
            _ => None,
        }
    }

    /// Classify this error for the execution ledger
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::LockTimeout { .. } => ErrorKind::LockTimeout,
            Self::LockForcedReclaim { .. } => ErrorKind::LockForcedReclaim,
            Self::GatewayFailure(GatewayError::Timeout) => ErrorKind::ModelTimeout,
            Self::GatewayFailure(_) => ErrorKind::GatewayFailure,
            Self::ContextBudgetExceeded { .. } => ErrorKind::ContextBudgetExceeded,
            Self::ContextInjectionDetected(_) => ErrorKind::ContextInjectionDetected,
            Self::ChildFailure { .. } => ErrorKind::ChildFailure,
            Self::ExecutionTimeout { .. } => ErrorKind::ExecutionTimeout,
            Self::Cancelled(_) => ErrorKind::Cancelled,
            Self::InvalidPlan(_) => ErrorKind::InvalidPlan,
            _ => ErrorKind::Internal,
        }
    }

    /// Error detail persisted on a failed execution
    ///
    /// For child failures the detail points at the deepest failing descendant.
    pub fn detail(&self) -> ErrorDetail {
        match self {
            Self::ChildFailure {
                child_id,
                child_role,
                cause,
            } => {
                let mut detail = ErrorDetail::new(ErrorKind::ChildFailure, self.to_string());
                detail.failed_execution = cause.failed_execution.or(Some(*child_id));
                detail.failed_role = cause.failed_role.or(Some(*child_role));
                detail
            }
            _ => ErrorDetail::new(self.kind(), self.to_string()),
        }
    }

    /// Whether a caller may reasonably retry the same request
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::LockTimeout { .. } => true,
            Self::GatewayFailure(e) => e.is_transient(),
            _ => false,
        }
    }
}

impl From<LockError> for Error {
    fn from(err: LockError) -> Self {
        match err {
            LockError::Timeout {
                resource,
                holder,
                waited_ms,
            } => Self::LockTimeout {
                resource,
                holder,
                waited_ms,
            },
            LockError::ForcedReclaim { resource, holder } => Self::LockForcedReclaim {
                resource,
                holder: holder.to_string(),
            },
            other => Self::Lock(other),
        }
    }
}

impl From<LedgerError> for Error {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::NotFound(id) => Self::ExecutionNotFound(id),
            LedgerError::InvalidTransition { id, from, to } => Self::InvalidTransition {
                execution_id: id,
                from,
                to,
            },
            LedgerError::ParentNotRunning { parent_id, status } => {
                Self::ParentNotRunning { parent_id, status }
            }
            LedgerError::InvalidHierarchy { parent, child } => Self::InvalidInput(format!(
                "a {} execution cannot spawn a {} child",
                parent, child
            )),
            LedgerError::Store(msg) => Self::Store(msg),
        }
    }
}

/// Closed error taxonomy persisted with failed executions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    LockTimeout,
    LockForcedReclaim,
    ContextBudgetExceeded,
    ContextInjectionDetected,
    GatewayFailure,
    /// The model call itself timed out (distinct from lock and deadline timeouts)
    ModelTimeout,
    ChildFailure,
    ExecutionTimeout,
    Cancelled,
    InvalidPlan,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LockTimeout => "lock_timeout",
            Self::LockForcedReclaim => "lock_forced_reclaim",
            Self::ContextBudgetExceeded => "context_budget_exceeded",
            Self::ContextInjectionDetected => "context_injection_detected",
            Self::GatewayFailure => "gateway_failure",
            Self::ModelTimeout => "model_timeout",
            Self::ChildFailure => "child_failure",
            Self::ExecutionTimeout => "execution_timeout",
            Self::Cancelled => "cancelled",
            Self::InvalidPlan => "invalid_plan",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "lock_timeout" => Ok(Self::LockTimeout),
            "lock_forced_reclaim" => Ok(Self::LockForcedReclaim),
            "context_budget_exceeded" => Ok(Self::ContextBudgetExceeded),
            "context_injection_detected" => Ok(Self::ContextInjectionDetected),
            "gateway_failure" => Ok(Self::GatewayFailure),
            "model_timeout" => Ok(Self::ModelTimeout),
            "child_failure" => Ok(Self::ChildFailure),
            "execution_timeout" => Ok(Self::ExecutionTimeout),
            "cancelled" => Ok(Self::Cancelled),
            "invalid_plan" => Ok(Self::InvalidPlan),
            "internal" => Ok(Self::Internal),
            other => Err(format!("unknown error kind '{}'", other)),
        }
    }
}
