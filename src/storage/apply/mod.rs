//! Batch application: per-batch appliers composed into a chain.
//!
//! Every factory in an [`ApplierChain`] starts one applier per batch. Each
//! command is offered to the appliers in start order until one reports it
//! handled; the appliers are closed in reverse start order once the batch is
//! done, and also when a visit fails part way.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::storage::command::{CommandBatch, CommandVisitor};
use crate::types::Result;

mod consistency;
mod counts;
mod high_id;
mod index;
mod store;

pub use consistency::ConsistencyCheckingApplierFactory;
pub use counts::CountsApplierFactory;
pub use high_id::HighIdApplierFactory;
pub use index::{
    EntityPropertyUpdate, EntityTokenUpdate, IndexApplierFactory, IndexUpdateListener,
    NoopIndexListener,
};
pub use store::StoreApplierFactory;

/// Origin of the batch being applied.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum ApplicationMode {
    /// Committed by a transaction of this engine.
    Internal,
    /// Committed elsewhere and shipped to this engine.
    External,
    /// Replayed from the command log after a restart.
    Recovery,
}

impl ApplicationMode {
    /// Every mode, in declaration order.
    pub const ALL: [ApplicationMode; 3] = [
        ApplicationMode::Internal,
        ApplicationMode::External,
        ApplicationMode::Recovery,
    ];

    /// True for log replay after a restart.
    pub fn is_recovery(self) -> bool {
        self == ApplicationMode::Recovery
    }

    /// Whether ids in the batch may lie beyond the stores' high ids.
    pub fn tracks_high_ids(self) -> bool {
        matches!(self, ApplicationMode::External | ApplicationMode::Recovery)
    }

    /// Lowercase name used in logs and metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            ApplicationMode::Internal => "internal",
            ApplicationMode::External => "external",
            ApplicationMode::Recovery => "recovery",
        }
    }
}

impl fmt::Display for ApplicationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Applier for a single batch.
pub trait TransactionApplier: CommandVisitor {
    /// The applier as a plain command visitor.
    fn visitor(&mut self) -> &mut dyn CommandVisitor;

    /// Finishes the batch. Called exactly once.
    fn close(&mut self) -> Result<()>;
}

/// Starts per-batch appliers.
pub trait TransactionApplierFactory: Send + Sync {
    /// Short name used in logs and [`ApplierChain::names`].
    fn name(&self) -> &'static str;

    /// Starts the applier for one batch.
    fn start_tx<'a>(
        &'a self,
        batch: &CommandBatch,
        mode: ApplicationMode,
    ) -> Result<Box<dyn TransactionApplier + 'a>>;
}

/// Ordered applier factories for one application mode.
#[derive(Clone)]
pub struct ApplierChain {
    mode: ApplicationMode,
    factories: Vec<Arc<dyn TransactionApplierFactory>>,
}

impl fmt::Debug for ApplierChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<_> = self.factories.iter().map(|f| f.name()).collect();
        f.debug_struct("ApplierChain")
            .field("mode", &self.mode)
            .field("factories", &names)
            .finish()
    }
}

impl ApplierChain {
    /// Chain whose factories start, and see commands, in the given order.
    pub fn new(mode: ApplicationMode, factories: Vec<Arc<dyn TransactionApplierFactory>>) -> Self {
        Self { mode, factories }
    }

    /// Mode every batch is applied in.
    pub fn mode(&self) -> ApplicationMode {
        self.mode
    }

    /// Factory names in start order.
    pub fn names(&self) -> Vec<&'static str> {
        self.factories.iter().map(|f| f.name()).collect()
    }

    /// Applies every command of `batch` through the chain.
    pub fn apply(&self, batch: &CommandBatch) -> Result<()> {
        let mut open = OpenAppliers {
            appliers: Vec::with_capacity(self.factories.len()),
            closed: false,
        };
        for factory in &self.factories {
            open.appliers.push(factory.start_tx(batch, self.mode)?);
        }
        for command in &batch.commands {
            for applier in open.appliers.iter_mut() {
                if command.accept(applier.visitor())? {
                    break;
                }
            }
        }
        open.close()
    }
}

/// Started appliers, closed in reverse order when the batch ends or unwinds.
struct OpenAppliers<'a> {
    appliers: Vec<Box<dyn TransactionApplier + 'a>>,
    closed: bool,
}

impl OpenAppliers<'_> {
    /// Closes every applier, newest first. All are closed even when one
    /// fails; the first failure is returned.
    fn close(&mut self) -> Result<()> {
        self.closed = true;
        let mut first_err = None;
        while let Some(mut applier) = self.appliers.pop() {
            if let Err(err) = applier.close() {
                debug!(error = %err, "apply.close.failed");
                first_err.get_or_insert(err);
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl Drop for OpenAppliers<'_> {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        if let Err(err) = self.close() {
            warn!(error = %err, "apply.close_on_abort.failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::command::{samples, Command, RecordCommand};
    use crate::storage::record::NodeRecord;
    use crate::types::{SombraError, TxId};
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Journal(Mutex<Vec<String>>);

    impl Journal {
        fn push(&self, entry: String) {
            self.0.lock().push(entry);
        }
        fn entries(&self) -> Vec<String> {
            self.0.lock().clone()
        }
    }

    struct Recording {
        name: &'static str,
        journal: Arc<Journal>,
        handles_nodes: bool,
        fails_on_nodes: bool,
    }

    struct RecordingApplier<'a> {
        factory: &'a Recording,
    }

    impl CommandVisitor for RecordingApplier<'_> {
        fn visit_node_command(&mut self, command: &RecordCommand<NodeRecord>) -> Result<bool> {
            let f = self.factory;
            if f.fails_on_nodes {
                return Err(SombraError::Invalid("rejected"));
            }
            f.journal.push(format!("{} visit {}", f.name, command.id()));
            Ok(f.handles_nodes)
        }
    }

    impl TransactionApplier for RecordingApplier<'_> {
        fn visitor(&mut self) -> &mut dyn CommandVisitor {
            self
        }

        fn close(&mut self) -> Result<()> {
            self.factory.journal.push(format!("{} close", self.factory.name));
            Ok(())
        }
    }

    impl TransactionApplierFactory for Recording {
        fn name(&self) -> &'static str {
            self.name
        }

        fn start_tx<'a>(
            &'a self,
            _batch: &CommandBatch,
            _mode: ApplicationMode,
        ) -> Result<Box<dyn TransactionApplier + 'a>> {
            self.journal.push(format!("{} start", self.name));
            Ok(Box::new(RecordingApplier { factory: self }))
        }
    }

    fn recording(
        journal: &Arc<Journal>,
        name: &'static str,
        handles_nodes: bool,
        fails_on_nodes: bool,
    ) -> Arc<dyn TransactionApplierFactory> {
        Arc::new(Recording {
            name,
            journal: journal.clone(),
            handles_nodes,
            fails_on_nodes,
        })
    }

    fn node_batch() -> CommandBatch {
        CommandBatch::new(TxId(1), vec![Command::Node(samples::node(4))])
    }

    #[test]
    fn appliers_close_in_reverse_start_order() -> Result<()> {
        let journal = Arc::new(Journal::default());
        let chain = ApplierChain::new(
            ApplicationMode::Internal,
            vec![
                recording(&journal, "a", false, false),
                recording(&journal, "b", false, false),
                recording(&journal, "c", false, false),
            ],
        );
        chain.apply(&node_batch())?;
        assert_eq!(
            journal.entries(),
            vec![
                "a start", "b start", "c start", "a visit 4", "b visit 4", "c visit 4", "c close",
                "b close", "a close"
            ]
        );
        Ok(())
    }

    #[test]
    fn handled_command_skips_later_appliers() -> Result<()> {
        let journal = Arc::new(Journal::default());
        let chain = ApplierChain::new(
            ApplicationMode::External,
            vec![
                recording(&journal, "a", true, false),
                recording(&journal, "b", false, false),
            ],
        );
        chain.apply(&node_batch())?;
        assert!(!journal.entries().iter().any(|e| e == "b visit 4"));
        Ok(())
    }

    #[test]
    fn failed_visit_still_closes_in_reverse() {
        let journal = Arc::new(Journal::default());
        let chain = ApplierChain::new(
            ApplicationMode::Recovery,
            vec![
                recording(&journal, "a", false, false),
                recording(&journal, "b", false, true),
                recording(&journal, "c", false, false),
            ],
        );
        let err = chain.apply(&node_batch()).err().expect("visit fails");
        assert!(matches!(err, SombraError::Invalid("rejected")));
        assert_eq!(
            journal.entries(),
            vec!["a start", "b start", "c start", "a visit 4", "c close", "b close", "a close"]
        );
    }
}
