//! Mutation core of a record-based graph storage engine.
//!
//! Transactions stage record changes, maintain relationship chains under
//! sorted entity locks, and turn their changes into command batches. Batches
//! are logged and then applied through a chain of appliers that update the
//! stores, the id allocators, the counters and external index listeners.

/// Store administration: chain verification.
pub mod admin;
/// Byte channels, file access, entity locks and the command log.
pub mod primitives;
/// Staging, chain maintenance, commands, appliers and the engine.
pub mod storage;
/// Record ids and the shared error type.
pub mod types;

pub use storage::{EngineOptions, RecordStorageEngine, Transaction};
pub use types::{Result, SombraError};
