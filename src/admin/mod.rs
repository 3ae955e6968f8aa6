#![forbid(unsafe_code)]

//! Store administration and maintenance utilities.

mod verify;

/// Relationship chain verification.
///
/// Walks every node's chains and reports structural problems as findings.
pub use verify::{verify_chains, VerifyCounts, VerifyFinding, VerifyReport, VerifySeverity};
