//! Low-level primitives for building the storage engine.
//!
//! Includes byte channels, I/O operations, entity locking and the
//! command log.

/// Byte-level readers and writers.
pub mod bytes;

/// Entity locks and the locker contract.
pub mod concurrency;

/// I/O abstractions and utilities.
pub mod io;

/// Append-only command log for crash recovery.
pub mod log;
