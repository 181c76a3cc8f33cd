//! Error taxonomy tests

use std::time::Duration;

use crate::domain::execution::{AgentRole, ErrorDetail, ExecutionId, ExecutionStatus, LedgerError};
use crate::domain::locking::LockError;
use crate::error::{Error, ErrorKind};
use crate::gateway::GatewayError;

#[test]
fn test_error_codes_are_stable() {
    assert_eq!(Error::GatewayFailure(GatewayError::Timeout).code(), "E100");
    assert_eq!(Error::Cancelled(ExecutionId::new()).code(), "E700");
    assert_eq!(Error::InvalidPlan("x".into()).code(), "E1302");
    assert_eq!(Error::ConfigError("x".into()).code(), "E600");
}

#[test]
fn test_model_timeout_is_its_own_kind() {
    assert_eq!(Error::GatewayFailure(GatewayError::Timeout).kind(), ErrorKind::ModelTimeout);
    assert_eq!(
        Error::GatewayFailure(GatewayError::NetworkError("reset".into())).kind(),
        ErrorKind::GatewayFailure
    );
    let deadline = Error::ExecutionTimeout {
        execution_id: ExecutionId::new(),
        deadline_ms: 10,
    };
    assert_eq!(deadline.kind(), ErrorKind::ExecutionTimeout);
}

#[test]
fn test_lock_timeout_converts_and_is_retryable() {
    let err: Error = LockError::Timeout {
        resource: "p/file/a.rs".into(),
        holder: "abc".into(),
        waited_ms: 300_000,
    }
    .into();

    assert!(matches!(err, Error::LockTimeout { .. }));
    assert_eq!(err.kind(), ErrorKind::LockTimeout);
    assert!(err.is_retryable());
    assert!(err.suggestion().unwrap().contains("p/file/a.rs"));
}

#[test]
fn test_rate_limit_retryable_but_auth_is_not() {
    let limited = Error::GatewayFailure(GatewayError::RateLimited {
        retry_after: Some(Duration::from_secs(3)),
    });
    assert!(limited.is_retryable());

    let auth = Error::GatewayFailure(GatewayError::ServerError {
        status: Some(401),
        message: "bad key".into(),
    });
    assert!(!auth.is_retryable());
}

#[test]
fn test_child_failure_detail_points_at_deepest_failure() {
    let worker = ExecutionId::new();
    let planner = ExecutionId::new();

    let worker_detail = ErrorDetail::new(ErrorKind::GatewayFailure, "upstream 502");
    let planner_err = Error::ChildFailure {
        child_id: worker,
        child_role: AgentRole::Tester,
        cause: Box::new(worker_detail),
    };
    let planner_detail = planner_err.detail();
    assert_eq!(planner_detail.kind, ErrorKind::ChildFailure);
    assert_eq!(planner_detail.failed_execution, Some(worker));
    assert!(planner_detail.message.contains("upstream 502"));

    let root_err = Error::ChildFailure {
        child_id: planner,
        child_role: AgentRole::Planner,
        cause: Box::new(planner_detail),
    };
    let root_detail = root_err.detail();
    assert_eq!(root_detail.failed_execution, Some(worker));
    assert_eq!(root_detail.failed_role, Some(AgentRole::Tester));
    assert!(root_err.suggestion().unwrap().contains(&worker.to_string()));
}

#[test]
fn test_ledger_errors_map_to_crate_errors() {
    let id = ExecutionId::new();
    let err: Error = LedgerError::InvalidTransition {
        id,
        from: ExecutionStatus::Succeeded,
        to: ExecutionStatus::Running,
    }
    .into();
    assert!(matches!(err, Error::InvalidTransition { execution_id, .. } if execution_id == id));

    let err: Error = LedgerError::InvalidHierarchy {
        parent: AgentRole::Coder,
        child: AgentRole::Planner,
    }
    .into();
    assert!(matches!(err, Error::InvalidInput(_)));
}

#[test]
fn test_error_kind_round_trips() {
    for kind in [
        ErrorKind::LockTimeout,
        ErrorKind::ContextInjectionDetected,
        ErrorKind::ChildFailure,
        ErrorKind::Cancelled,
        ErrorKind::Internal,
    ] {
        assert_eq!(kind.as_str().parse::<ErrorKind>().unwrap(), kind);
    }
}
