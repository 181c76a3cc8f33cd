//! SQLite lock audit log
//!
//! The lock manager calls [`LockAuditSink::record`] while it holds a shard
//! lock, so recording only queues the record. A background writer drains the
//! queue and upserts one `resource_locks` row per lock request.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::domain::execution::ExecutionId;
use crate::domain::locking::{
    LockAuditSink, LockEvent, LockEventType, LockMode, LockRecord, LockState, ResourceKey,
};
use crate::error::{Error, Result};

enum AuditMessage {
    Record {
        record: LockRecord,
        event_type: LockEventType,
    },
    Flush(oneshot::Sender<()>),
}

/// Audit sink persisting lock records to `resource_locks`
#[derive(Debug, Clone)]
pub struct SqliteLockAudit {
    tx: mpsc::UnboundedSender<AuditMessage>,
    pool: SqlitePool,
}

impl SqliteLockAudit {
    /// Start the background writer; must be called inside a Tokio runtime
    ///
    /// The writer stops once every clone of the sink is dropped and the
    /// queue is drained.
    pub fn spawn(pool: SqlitePool) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<AuditMessage>();
        let writer_pool = pool.clone();

        let handle = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                match message {
                    AuditMessage::Record { record, event_type } => {
                        if let Err(e) = upsert(&writer_pool, &record, event_type).await {
                            warn!(lock_id = %record.id, key = %record.key, error = %e, "Failed to persist lock record");
                        }
                    }
                    AuditMessage::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
            debug!("Lock audit writer stopped");
        });

        (Self { tx, pool }, handle)
    }

    /// Wait until every record queued before this call is written
    pub async fn flush(&self) -> Result<()> {
        let (done, wait) = oneshot::channel();
        self.tx
            .send(AuditMessage::Flush(done))
            .map_err(|_| Error::Store("lock audit writer has stopped".to_string()))?;
        wait.await
            .map_err(|_| Error::Store("lock audit writer has stopped".to_string()))
    }

    /// Most recently requested locks, newest first
    pub async fn list_recent(&self, limit: u32) -> Result<Vec<LockRecord>> {
        let rows: Vec<LockRow> = sqlx::query_as(
            r#"
            SELECT id, project_id, resource_kind, resource_name, mode,
                   holder_id, holder_host, state,
                   requested_at, acquired_at, deadline, released_at
            FROM resource_locks
            ORDER BY requested_at DESC
            LIMIT ?
            "#,
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(LockRow::into_record).collect()
    }

    /// Locks still recorded as held, e.g. by a process that exited uncleanly
    pub async fn list_held(&self) -> Result<Vec<LockRecord>> {
        let rows: Vec<LockRow> = sqlx::query_as(
            r#"
            SELECT id, project_id, resource_kind, resource_name, mode,
                   holder_id, holder_host, state,
                   requested_at, acquired_at, deadline, released_at
            FROM resource_locks
            WHERE state = 'held'
            ORDER BY acquired_at ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(LockRow::into_record).collect()
    }
}

impl LockAuditSink for SqliteLockAudit {
    fn record(&self, event: &LockEvent) {
        let message = AuditMessage::Record {
            record: event.record.clone(),
            event_type: event.event_type,
        };
        if self.tx.send(message).is_err() {
            warn!(lock_id = %event.record.id, "Lock audit writer has stopped, record dropped");
        }
    }
}

fn release_reason(event_type: LockEventType) -> Option<&'static str> {
    match event_type {
        LockEventType::Released => Some("released"),
        LockEventType::ForcedReclaim => Some("forced_reclaim"),
        LockEventType::TimedOut => Some("timed_out"),
        LockEventType::Acquired | LockEventType::Contended => None,
    }
}

async fn upsert(pool: &SqlitePool, record: &LockRecord, event_type: LockEventType) -> sqlx::Result<()> {
    sqlx::query(
        r#"
        INSERT INTO resource_locks (
            id, project_id, resource_kind, resource_name, mode,
            holder_id, holder_host, state,
            requested_at, acquired_at, deadline, released_at, release_reason
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            state = excluded.state,
            acquired_at = excluded.acquired_at,
            deadline = excluded.deadline,
            released_at = excluded.released_at,
            release_reason = excluded.release_reason
        "#,
    )
    .bind(record.id.to_string())
    .bind(&record.key.project_id)
    .bind(record.key.kind.to_string())
    .bind(&record.key.name)
    .bind(record.mode.as_str())
    .bind(record.requester.to_string())
    .bind(&record.holder_host)
    .bind(record.state.as_str())
    .bind(record.requested_at)
    .bind(record.acquired_at)
    .bind(record.deadline)
    .bind(record.released_at)
    .bind(release_reason(event_type))
    .execute(pool)
    .await?;
    Ok(())
}

// ========== Database Row Types ==========

#[derive(sqlx::FromRow)]
struct LockRow {
    id: String,
    project_id: String,
    resource_kind: String,
    resource_name: String,
    mode: String,
    holder_id: String,
    holder_host: String,
    state: String,
    requested_at: DateTime<Utc>,
    acquired_at: Option<DateTime<Utc>>,
    deadline: Option<DateTime<Utc>>,
    released_at: Option<DateTime<Utc>>,
}

impl LockRow {
    fn into_record(self) -> Result<LockRecord> {
        let id = Uuid::parse_str(&self.id)
            .map_err(|e| Error::Store(format!("Invalid lock ID: {}", e)))?;
        let requester: ExecutionId = self
            .holder_id
            .parse()
            .map_err(|e| Error::Store(format!("Invalid holder ID: {}", e)))?;
        let mode: LockMode = self.mode.parse()?;
        let state: LockState = self.state.parse()?;

        Ok(LockRecord {
            id,
            key: ResourceKey::new(self.project_id, self.resource_kind.parse()?, self.resource_name),
            mode,
            requester,
            holder_host: self.holder_host,
            state,
            requested_at: self.requested_at,
            acquired_at: self.acquired_at,
            deadline: self.deadline,
            released_at: self.released_at,
        })
    }
}
