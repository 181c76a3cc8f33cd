//! Locking events
//!
//! Every state change of a lock request is published as a [`LockEvent`] to
//! broadcast subscribers and to the optional audit sink.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::types::LockRecord;
use crate::domain::execution::ExecutionId;

/// Type of lock event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockEventType {
    /// A lock was granted
    Acquired,
    /// A lock was released by its holder
    Released,
    /// A request was queued behind another holder
    Contended,
    /// A queued request gave up
    TimedOut,
    /// An expired lock of a dead holder was forcibly released
    ForcedReclaim,
}

impl LockEventType {
    /// Convert to string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Acquired => "lock_acquired",
            Self::Released => "lock_released",
            Self::Contended => "lock_contended",
            Self::TimedOut => "lock_timed_out",
            Self::ForcedReclaim => "lock_forced_reclaim",
        }
    }
}

impl std::fmt::Display for LockEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A locking event carrying the lock record after the change
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockEvent {
    /// Unique event identifier
    pub id: Uuid,
    /// Type of event
    pub event_type: LockEventType,
    /// Snapshot of the lock request after this event
    pub record: LockRecord,
    /// Event data
    pub data: Option<serde_json::Value>,
    /// When the event occurred
    pub created_at: DateTime<Utc>,
}

impl LockEvent {
    fn new(event_type: LockEventType, record: &LockRecord, data: Option<serde_json::Value>) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type,
            record: record.clone(),
            data,
            created_at: Utc::now(),
        }
    }

    pub fn acquired(record: &LockRecord, waited_ms: u64) -> Self {
        let data = serde_json::json!({ "waited_ms": waited_ms });
        Self::new(LockEventType::Acquired, record, Some(data))
    }

    pub fn released(record: &LockRecord) -> Self {
        let data = record.held_ms().map(|ms| serde_json::json!({ "held_ms": ms }));
        Self::new(LockEventType::Released, record, data)
    }

    pub fn contended(record: &LockRecord, current_holders: &[ExecutionId], queue_len: usize) -> Self {
        let holders: Vec<String> = current_holders.iter().map(|h| h.to_string()).collect();
        let data = serde_json::json!({
            "current_holders": holders,
            "queue_position": queue_len,
        });
        Self::new(LockEventType::Contended, record, Some(data))
    }

    pub fn timed_out(record: &LockRecord, waited_ms: u64) -> Self {
        let data = serde_json::json!({ "waited_ms": waited_ms });
        Self::new(LockEventType::TimedOut, record, Some(data))
    }

    pub fn forced_reclaim(record: &LockRecord, overdue_ms: u64) -> Self {
        let data = serde_json::json!({
            "prior_holder": record.requester.to_string(),
            "overdue_ms": overdue_ms,
        });
        Self::new(LockEventType::ForcedReclaim, record, Some(data))
    }
}
