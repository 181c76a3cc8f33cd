//! Resource locking for concurrent agent executions
//!
//! Agents declare the resources they touch (files, database partitions, the
//! model API channel, feature records) before a step starts, and hold locks
//! on them for the duration of the step.
//!
//! # Architecture
//!
//! - **Lock Manager**: `ResourceLockManager`, a sharded in-process lock table
//! - **Handles**: `LockHandle` and `LockSet`, released on drop
//! - **Events**: `LockEvent`, broadcast to subscribers and the audit sink
//!
//! # Features
//!
//! - Exclusive and shared modes, FIFO per resource key
//! - Timeout on acquisition; the same duration is the lease of the grant
//! - Forced reclamation of expired locks whose holder is no longer running
//!
//! # Example
//!
//! ```ignore
//! use demiarch_agents::domain::locking::{LockMode, ResourceKey, ResourceLockManager};
//!
//! let manager = ResourceLockManager::default();
//! let key = ResourceKey::file("proj", "src/main.rs");
//!
//! let handle = manager.acquire(key, execution_id, LockMode::Exclusive, None).await?;
//!
//! // Edit the file...
//!
//! // Lock is released when the handle is dropped
//! ```

pub mod event;
pub mod handle;
pub mod manager;
pub mod types;

pub use event::{LockEvent, LockEventType};
pub use handle::{LockHandle, LockSet};
pub use manager::{HolderLiveness, KeySnapshot, LockAuditSink, ResourceLockManager};
pub use types::{
    DEFAULT_LOCK_TIMEOUT, LockConfig, LockError, LockMode, LockRecord, LockResult, LockState,
    ResourceKey, ResourceKind,
};
