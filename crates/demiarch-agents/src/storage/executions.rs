//! SQLite-backed execution store
//!
//! Durable half of the execution ledger. Rows are written in full on every
//! change, so the table always mirrors the in-memory arena.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::domain::execution::{
    AgentExecution, AgentRole, ErrorDetail, ExecutionId, ExecutionMetrics, ExecutionStatus,
    ExecutionStore, LedgerError, LedgerResult,
};

const SELECT_COLUMNS: &str = r#"
    SELECT id, parent_id, role, status, phase, child_index,
           input_json, output_json,
           error_kind, error_message, failed_execution_id, failed_role,
           prompt_tokens, completion_tokens, context_tokens, latency_ms, cost_usd, model_used,
           created_at, started_at, completed_at
    FROM agent_executions
"#;

/// Execution store over the `agent_executions` table
#[derive(Debug, Clone)]
pub struct SqliteExecutionStore {
    pool: SqlitePool,
}

impl SqliteExecutionStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Most recent top-level executions, newest first
    pub async fn list_roots(&self, limit: u32) -> LedgerResult<Vec<AgentExecution>> {
        let rows: Vec<ExecutionRow> = sqlx::query_as(&format!(
            "{} WHERE parent_id IS NULL ORDER BY created_at DESC LIMIT ?",
            SELECT_COLUMNS
        ))
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(store_error)?;

        rows.into_iter().map(ExecutionRow::into_execution).collect()
    }

    /// Count executions in each status
    pub async fn count_by_status(&self) -> LedgerResult<Vec<(ExecutionStatus, i64)>> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM agent_executions GROUP BY status ORDER BY status")
                .fetch_all(&self.pool)
                .await
                .map_err(store_error)?;

        rows.into_iter()
            .map(|(status, count)| Ok((status.parse().map_err(LedgerError::Store)?, count)))
            .collect()
    }
}

fn store_error(e: sqlx::Error) -> LedgerError {
    LedgerError::Store(e.to_string())
}

fn to_json(value: &serde_json::Value) -> String {
    value.to_string()
}

#[async_trait]
impl ExecutionStore for SqliteExecutionStore {
    async fn insert(&self, execution: &AgentExecution) -> LedgerResult<()> {
        let error = execution.error.as_ref();
        sqlx::query(
            r#"
            INSERT INTO agent_executions (
                id, parent_id, role, status, phase, child_index,
                input_json, output_json,
                error_kind, error_message, failed_execution_id, failed_role,
                prompt_tokens, completion_tokens, context_tokens, latency_ms, cost_usd, model_used,
                created_at, started_at, completed_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(execution.id.to_string())
        .bind(execution.parent_id.map(|p| p.to_string()))
        .bind(execution.role.as_str())
        .bind(execution.status.as_str())
        .bind(execution.phase.as_str())
        .bind(execution.child_index.map(i64::from))
        .bind(to_json(&execution.input))
        .bind(execution.output.as_ref().map(to_json))
        .bind(error.map(|e| e.kind.as_str()))
        .bind(error.map(|e| e.message.clone()))
        .bind(error.and_then(|e| e.failed_execution).map(|id| id.to_string()))
        .bind(error.and_then(|e| e.failed_role).map(|r| r.as_str()))
        .bind(i64::from(execution.metrics.prompt_tokens))
        .bind(i64::from(execution.metrics.completion_tokens))
        .bind(i64::from(execution.metrics.context_tokens))
        .bind(execution.metrics.latency_ms as i64)
        .bind(execution.metrics.cost_usd)
        .bind(execution.metrics.model_used.clone())
        .bind(execution.created_at)
        .bind(execution.started_at)
        .bind(execution.completed_at)
        .execute(&self.pool)
        .await
        .map_err(store_error)?;

        Ok(())
    }

    async fn update(&self, execution: &AgentExecution) -> LedgerResult<()> {
        let error = execution.error.as_ref();
        let result = sqlx::query(
            r#"
            UPDATE agent_executions SET
                status = ?,
                phase = ?,
                output_json = ?,
                error_kind = ?,
                error_message = ?,
                failed_execution_id = ?,
                failed_role = ?,
                prompt_tokens = ?,
                completion_tokens = ?,
                context_tokens = ?,
                latency_ms = ?,
                cost_usd = ?,
                model_used = ?,
                started_at = ?,
                completed_at = ?
            WHERE id = ?
            "#,
        )
        .bind(execution.status.as_str())
        .bind(execution.phase.as_str())
        .bind(execution.output.as_ref().map(to_json))
        .bind(error.map(|e| e.kind.as_str()))
        .bind(error.map(|e| e.message.clone()))
        .bind(error.and_then(|e| e.failed_execution).map(|id| id.to_string()))
        .bind(error.and_then(|e| e.failed_role).map(|r| r.as_str()))
        .bind(i64::from(execution.metrics.prompt_tokens))
        .bind(i64::from(execution.metrics.completion_tokens))
        .bind(i64::from(execution.metrics.context_tokens))
        .bind(execution.metrics.latency_ms as i64)
        .bind(execution.metrics.cost_usd)
        .bind(execution.metrics.model_used.clone())
        .bind(execution.started_at)
        .bind(execution.completed_at)
        .bind(execution.id.to_string())
        .execute(&self.pool)
        .await
        .map_err(store_error)?;

        if result.rows_affected() == 0 {
            return Err(LedgerError::NotFound(execution.id));
        }
        Ok(())
    }

    async fn get(&self, id: ExecutionId) -> LedgerResult<Option<AgentExecution>> {
        let row: Option<ExecutionRow> = sqlx::query_as(&format!("{} WHERE id = ?", SELECT_COLUMNS))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(store_error)?;

        row.map(ExecutionRow::into_execution).transpose()
    }

    async fn children(&self, parent_id: ExecutionId) -> LedgerResult<Vec<AgentExecution>> {
        let rows: Vec<ExecutionRow> = sqlx::query_as(&format!(
            "{} WHERE parent_id = ? ORDER BY child_index ASC, created_at ASC",
            SELECT_COLUMNS
        ))
        .bind(parent_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(store_error)?;

        rows.into_iter().map(ExecutionRow::into_execution).collect()
    }
}

// ========== Database Row Types ==========

#[derive(sqlx::FromRow)]
struct ExecutionRow {
    id: String,
    parent_id: Option<String>,
    role: String,
    status: String,
    phase: String,
    child_index: Option<i64>,
    input_json: String,
    output_json: Option<String>,
    error_kind: Option<String>,
    error_message: Option<String>,
    failed_execution_id: Option<String>,
    failed_role: Option<String>,
    prompt_tokens: i64,
    completion_tokens: i64,
    context_tokens: i64,
    latency_ms: i64,
    cost_usd: Option<f64>,
    model_used: Option<String>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

fn parse_id(field: &str, value: &str) -> LedgerResult<ExecutionId> {
    value
        .parse()
        .map_err(|e| LedgerError::Store(format!("Invalid {} '{}': {}", field, value, e)))
}

fn parse_json(field: &str, value: &str) -> LedgerResult<serde_json::Value> {
    serde_json::from_str(value).map_err(|e| LedgerError::Store(format!("Invalid {} JSON: {}", field, e)))
}

fn to_u32(value: i64) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}

impl ExecutionRow {
    fn into_execution(self) -> LedgerResult<AgentExecution> {
        let id = parse_id("execution id", &self.id)?;
        let parent_id = self
            .parent_id
            .as_deref()
            .map(|p| parse_id("parent id", p))
            .transpose()?;
        let role: AgentRole = self.role.parse().map_err(LedgerError::Store)?;
        let status: ExecutionStatus = self.status.parse().map_err(LedgerError::Store)?;
        let phase = self.phase.parse().map_err(LedgerError::Store)?;
        let input = parse_json("input", &self.input_json)?;
        let output = self
            .output_json
            .as_deref()
            .map(|o| parse_json("output", o))
            .transpose()?;

        let error = match self.error_kind {
            Some(kind) => {
                let kind = kind.parse().map_err(LedgerError::Store)?;
                let mut detail = ErrorDetail::new(kind, self.error_message.unwrap_or_default());
                if let (Some(exec), Some(role)) = (self.failed_execution_id, self.failed_role) {
                    let role: AgentRole = role.parse().map_err(LedgerError::Store)?;
                    detail = detail.caused_by(parse_id("failed execution id", &exec)?, role);
                }
                Some(detail)
            }
            None => None,
        };

        Ok(AgentExecution {
            id,
            parent_id,
            role,
            status,
            phase,
            child_index: self.child_index.map(to_u32),
            input,
            output,
            error,
            metrics: ExecutionMetrics {
                prompt_tokens: to_u32(self.prompt_tokens),
                completion_tokens: to_u32(self.completion_tokens),
                context_tokens: to_u32(self.context_tokens),
                latency_ms: u64::try_from(self.latency_ms).unwrap_or_default(),
                cost_usd: self.cost_usd,
                model_used: self.model_used,
            },
            created_at: self.created_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
        })
    }
}
