//! Domain layer
//!
//! Resource locks, context retrieval, and the execution ledger.

pub mod context;
pub mod execution;
pub mod locking;
