use std::sync::Arc;

use tracing::debug;

use crate::storage::command::{CommandBatch, CommandVisitor};
use crate::storage::record::Direction;
use crate::storage::store::{CountsKey, CountsStore};
use crate::types::{GroupId, LabelId, Result, TxId, TypeId};

use super::{ApplicationMode, TransactionApplier, TransactionApplierFactory};

/// Folds counter commands into the [`CountsStore`].
///
/// In recovery a batch the counts store has already seen is skipped, so a
/// replayed log never counts a transaction twice.
pub struct CountsApplierFactory {
    counts: Arc<CountsStore>,
}

impl CountsApplierFactory {
    /// Applies counter commands to `counts`.
    pub fn new(counts: Arc<CountsStore>) -> Self {
        Self { counts }
    }
}

impl TransactionApplierFactory for CountsApplierFactory {
    fn name(&self) -> &'static str {
        "counts"
    }

    fn start_tx<'a>(
        &'a self,
        batch: &CommandBatch,
        mode: ApplicationMode,
    ) -> Result<Box<dyn TransactionApplier + 'a>> {
        let skip = mode.is_recovery() && self.counts.has_applied(batch.tx_id);
        if skip {
            debug!(tx_id = batch.tx_id.0, "apply.counts.skip_applied");
        }
        Ok(Box::new(CountsApplier {
            counts: &self.counts,
            tx_id: batch.tx_id,
            skip,
            deltas: Vec::new(),
        }))
    }
}

struct CountsApplier<'a> {
    counts: &'a CountsStore,
    tx_id: TxId,
    skip: bool,
    deltas: Vec<(CountsKey, i64)>,
}

impl CommandVisitor for CountsApplier<'_> {
    fn visit_node_count_command(&mut self, label: Option<LabelId>, delta: i64) -> Result<bool> {
        self.deltas.push((CountsKey::Nodes { label }, delta));
        Ok(false)
    }

    fn visit_relationship_count_command(
        &mut self,
        start_label: Option<LabelId>,
        ty: Option<TypeId>,
        end_label: Option<LabelId>,
        delta: i64,
    ) -> Result<bool> {
        self.deltas.push((
            CountsKey::Relationships {
                start_label,
                ty,
                end_label,
            },
            delta,
        ));
        Ok(false)
    }

    fn visit_group_degree_command(
        &mut self,
        group: GroupId,
        direction: Direction,
        delta: i64,
    ) -> Result<bool> {
        self.deltas
            .push((CountsKey::GroupDegree { group, direction }, delta));
        Ok(false)
    }
}

impl TransactionApplier for CountsApplier<'_> {
    fn visitor(&mut self) -> &mut dyn CommandVisitor {
        self
    }

    fn close(&mut self) -> Result<()> {
        if !self.skip {
            self.counts.apply(self.tx_id, &self.deltas);
        }
        self.deltas.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::apply::ApplierChain;
    use crate::storage::command::Command;

    fn batch(tx: u64) -> CommandBatch {
        CommandBatch::new(
            TxId(tx),
            vec![
                Command::NodeCount {
                    label: None,
                    delta: 2,
                },
                Command::NodeCount {
                    label: Some(LabelId(4)),
                    delta: 1,
                },
                Command::GroupDegree {
                    group: GroupId(3),
                    direction: Direction::Incoming,
                    delta: 12,
                },
            ],
        )
    }

    fn chain(mode: ApplicationMode, counts: &Arc<CountsStore>) -> ApplierChain {
        ApplierChain::new(mode, vec![Arc::new(CountsApplierFactory::new(counts.clone()))])
    }

    #[test]
    fn counters_accumulate() -> Result<()> {
        let counts = Arc::new(CountsStore::new());
        let chain = chain(ApplicationMode::Internal, &counts);
        chain.apply(&batch(1))?;
        chain.apply(&batch(2))?;
        assert_eq!(counts.get(&CountsKey::Nodes { label: None }), 4);
        assert_eq!(counts.get(&CountsKey::Nodes { label: Some(LabelId(4)) }), 2);
        assert_eq!(
            counts.get(&CountsKey::GroupDegree {
                group: GroupId(3),
                direction: Direction::Incoming
            }),
            24
        );
        assert_eq!(counts.last_applied_tx(), TxId(2));
        Ok(())
    }

    #[test]
    fn recovery_skips_applied_transactions() -> Result<()> {
        let counts = Arc::new(CountsStore::new());
        chain(ApplicationMode::Internal, &counts).apply(&batch(1))?;
        let recovery = chain(ApplicationMode::Recovery, &counts);
        recovery.apply(&batch(1))?;
        assert_eq!(counts.get(&CountsKey::Nodes { label: None }), 2);
        recovery.apply(&batch(2))?;
        assert_eq!(counts.get(&CountsKey::Nodes { label: None }), 4);
        Ok(())
    }
}
