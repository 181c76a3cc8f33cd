//! Storage layer - SQLite
//!
//! # Architecture
//!
//! - `database`: Connection pool management and initialization
//! - `migrations`: Schema versioning and automatic migration
//! - `executions`: durable half of the execution ledger
//! - `locks`: lock audit log, written off the lock path
//! - `context`: persisted context items and their layers
//!
//! # Usage
//!
//! ```ignore
//! use demiarch_agents::storage::{Database, SqliteExecutionStore};
//!
//! let db = Database::in_memory().await?;
//! let store = SqliteExecutionStore::new(db.pool().clone());
//! ```

pub mod context;
pub mod database;
pub mod executions;
pub mod locks;
pub mod migrations;

pub use context::SqliteContextRepository;
pub use database::{Database, DatabaseConfig, Location, default_database_path};
pub use executions::SqliteExecutionStore;
pub use locks::SqliteLockAudit;
pub use migrations::{CURRENT_VERSION, MigrationStatus, migration_status, run_migrations};
