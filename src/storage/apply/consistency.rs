use tracing::error;

use crate::storage::command::{CommandBatch, CommandVisitor, RecordCommand};
use crate::storage::record::{ChainEnd, RelationshipRecord};
use crate::storage::store::{RecordLoad, Stores};
use crate::types::{NodeId, RelId, Result, SombraError};

use super::{ApplicationMode, TransactionApplier, TransactionApplierFactory};

/// Checks relationship chain linkage of a batch against the stores.
///
/// Runs after the store applier and checks when the batch closes, so the
/// neighbours it reads are in their final state.
pub struct ConsistencyCheckingApplierFactory {
    stores: Stores,
}

impl ConsistencyCheckingApplierFactory {
    /// Checks chains against `stores`.
    pub fn new(stores: Stores) -> Self {
        Self { stores }
    }
}

impl TransactionApplierFactory for ConsistencyCheckingApplierFactory {
    fn name(&self) -> &'static str {
        "consistency"
    }

    fn start_tx<'a>(
        &'a self,
        _batch: &CommandBatch,
        _mode: ApplicationMode,
    ) -> Result<Box<dyn TransactionApplier + 'a>> {
        Ok(Box::new(ConsistencyCheckingApplier {
            stores: &self.stores,
            relationships: Vec::new(),
        }))
    }
}

struct ConsistencyCheckingApplier<'a> {
    stores: &'a Stores,
    relationships: Vec<RelationshipRecord>,
}

#[derive(Copy, Clone)]
enum Side {
    Prev,
    Next,
}

impl Side {
    fn name(self) -> &'static str {
        match self {
            Side::Prev => "prev",
            Side::Next => "next",
        }
    }
}

impl ConsistencyCheckingApplier<'_> {
    fn check(&self, rel: &RelationshipRecord) -> Result<()> {
        for end in [ChainEnd::First, ChainEnd::Second] {
            let node = rel.node(end);
            if let Some(prev) = rel.prev(end).rel() {
                self.check_neighbour(rel, end, node, prev, Side::Prev)?;
            }
            if let Some(next) = rel.next(end) {
                self.check_neighbour(rel, end, node, next, Side::Next)?;
            }
        }
        Ok(())
    }

    fn check_neighbour(
        &self,
        rel: &RelationshipRecord,
        end: ChainEnd,
        node: NodeId,
        neighbour_id: RelId,
        side: Side,
    ) -> Result<()> {
        let neighbour = self
            .stores
            .relationships
            .get_record(neighbour_id, RecordLoad::Always)?;
        let context = || {
            format!(
                "relationship {} {} end (node {node}) {} {neighbour_id}",
                rel.id,
                end.name(),
                side.name()
            )
        };
        if !neighbour.in_use {
            return Err(violation(
                if matches!(side, Side::Prev) {
                    "prev refers to unused"
                } else {
                    "next refers to unused"
                },
                context(),
            ));
        }
        let Some(neighbour_end) = neighbour.end_for(node) else {
            return Err(violation(
                "relationship between other nodes",
                format!(
                    "{}: {neighbour_id} connects {} and {}",
                    context(),
                    neighbour.first_node,
                    neighbour.second_node
                ),
            ));
        };
        let refers_back = match side {
            Side::Prev => neighbour.next(neighbour_end) == Some(rel.id),
            Side::Next => neighbour.prev(neighbour_end).rel() == Some(rel.id),
        };
        if !refers_back {
            return Err(violation("doesn't refer back", context()));
        }
        Ok(())
    }
}

fn violation(invariant: &'static str, detail: String) -> SombraError {
    error!(invariant, detail = %detail, "apply.consistency.violation");
    SombraError::integrity(invariant, detail)
}

impl CommandVisitor for ConsistencyCheckingApplier<'_> {
    fn visit_relationship_command(
        &mut self,
        command: &RecordCommand<RelationshipRecord>,
    ) -> Result<bool> {
        if command.after.in_use {
            self.relationships.push(command.after.clone());
        }
        Ok(false)
    }
}

impl TransactionApplier for ConsistencyCheckingApplier<'_> {
    fn visitor(&mut self) -> &mut dyn CommandVisitor {
        self
    }

    fn close(&mut self) -> Result<()> {
        let relationships = std::mem::take(&mut self.relationships);
        for rel in &relationships {
            self.check(rel)?;
        }
        Ok(())
    }
}
