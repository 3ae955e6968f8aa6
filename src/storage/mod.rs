//! Record storage engine core.
//!
//! Staging of record changes, relationship chain maintenance, the command
//! model and the applier pipeline that writes commands to the stores.

/// Batch application through ordered applier chains.
pub mod apply;
/// Relationship chain creation, deletion, group lookup and lock ordering.
pub mod chain;
/// Commands, their binary codec and the entity grouper.
pub mod command;
/// Record types and their in-memory layout.
pub mod record;
/// Per-transaction staging of before/after images.
pub mod staging;
/// Record store contract, in-memory stores and counters.
pub mod store;

mod engine;
mod metrics;
mod options;
mod transaction;

/// Main engine interface.
pub use engine::{EngineOpenError, RecordStorageEngine, RecoveryStats, Transaction};

/// Metrics collection.
pub use metrics::{default_metrics, CounterMetrics, NoopMetrics, StorageMetrics};

/// Engine configuration.
pub use options::{
    ConfigError, EngineConfig, EngineOptions, DEFAULT_DENSE_NODE_THRESHOLD,
    DEFAULT_EXTERNAL_DEGREES_THRESHOLD,
};

/// Write operations of one transaction.
pub use transaction::{
    TransactionRecordState, LABEL_BLOCK_SIZE, MAX_VALUE_LEN, PROPERTY_VALUE_BLOCK_SIZE,
    TOKEN_NAME_BLOCK_SIZE,
};
