use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Trait for tracking chain mutation and batch application in the storage engine.
///
/// Implementations receive one call per event. The engine calls them from
/// committing threads, so they must be cheap and thread-safe.
pub trait StorageMetrics: Send + Sync {
    /// Records the creation of a relationship.
    fn relationship_created(&self);

    /// Records the deletion of a relationship.
    fn relationship_deleted(&self);

    /// Records the promotion of a sparse node to a dense node.
    fn node_promoted(&self);

    /// Records a batch applied successfully.
    ///
    /// # Parameters
    /// * `mode` - The application mode: "internal", "external" or "recovery".
    /// * `commands` - Number of commands in the batch.
    fn batch_applied(&self, mode: &'static str, commands: usize);

    /// Records a batch whose application failed.
    fn batch_failed(&self, mode: &'static str);
}

/// A no-op implementation of [`StorageMetrics`] that discards all recorded metrics.
#[derive(Default)]
pub struct NoopMetrics;

impl StorageMetrics for NoopMetrics {
    fn relationship_created(&self) {}
    fn relationship_deleted(&self) {}
    fn node_promoted(&self) {}
    fn batch_applied(&self, _mode: &'static str, _commands: usize) {}
    fn batch_failed(&self, _mode: &'static str) {}
}

/// A thread-safe counter-based implementation of [`StorageMetrics`].
#[derive(Default)]
pub struct CounterMetrics {
    /// Number of relationships created.
    pub relationships_created: AtomicU64,

    /// Number of relationships deleted.
    pub relationships_deleted: AtomicU64,

    /// Number of sparse to dense promotions.
    pub nodes_promoted: AtomicU64,

    /// Number of batches applied for local commits.
    pub batches_internal: AtomicU64,

    /// Number of batches applied from external sources.
    pub batches_external: AtomicU64,

    /// Number of batches replayed by recovery.
    pub batches_recovered: AtomicU64,

    /// Total commands across applied batches.
    pub commands_applied: AtomicU64,

    /// Number of batches whose application failed.
    pub batches_failed: AtomicU64,
}

impl CounterMetrics {
    /// Batches applied in any mode.
    pub fn batches_applied(&self) -> u64 {
        self.batches_internal.load(Ordering::Relaxed)
            + self.batches_external.load(Ordering::Relaxed)
            + self.batches_recovered.load(Ordering::Relaxed)
    }
}

impl StorageMetrics for CounterMetrics {
    fn relationship_created(&self) {
        self.relationships_created.fetch_add(1, Ordering::Relaxed);
    }

    fn relationship_deleted(&self) {
        self.relationships_deleted.fetch_add(1, Ordering::Relaxed);
    }

    fn node_promoted(&self) {
        self.nodes_promoted.fetch_add(1, Ordering::Relaxed);
    }

    fn batch_applied(&self, mode: &'static str, commands: usize) {
        match mode {
            "internal" => {
                self.batches_internal.fetch_add(1, Ordering::Relaxed);
            }
            "external" => {
                self.batches_external.fetch_add(1, Ordering::Relaxed);
            }
            "recovery" => {
                self.batches_recovered.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
        self.commands_applied
            .fetch_add(commands as u64, Ordering::Relaxed);
    }

    fn batch_failed(&self, _mode: &'static str) {
        self.batches_failed.fetch_add(1, Ordering::Relaxed);
    }
}

/// Returns the default metrics implementation wrapped in an [`Arc`].
///
/// The default implementation is [`NoopMetrics`].
pub fn default_metrics() -> Arc<dyn StorageMetrics> {
    Arc::new(NoopMetrics)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_split_batches_by_mode() {
        let metrics = CounterMetrics::default();
        metrics.batch_applied("internal", 3);
        metrics.batch_applied("recovery", 2);
        metrics.batch_failed("internal");
        metrics.relationship_created();
        assert_eq!(metrics.batches_applied(), 2);
        assert_eq!(metrics.commands_applied.load(Ordering::Relaxed), 5);
        assert_eq!(metrics.batches_failed.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.relationships_created.load(Ordering::Relaxed), 1);
    }
}
