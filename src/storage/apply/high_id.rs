use std::collections::BTreeMap;

use tracing::trace;

use crate::storage::command::{CommandBatch, CommandVisitor, RecordCommand};
use crate::storage::record::{
    DynamicRecord, MetaDataRecord, NodeRecord, PropertyRecord, Record, RelationshipGroupRecord,
    RelationshipRecord, SchemaRecord, TokenKind, TokenRecord,
};
use crate::storage::store::{StoreKind, Stores};
use crate::types::{RecordId, Result};

use super::{ApplicationMode, TransactionApplier, TransactionApplierFactory};

/// Raises store high ids past every id a batch carries.
///
/// Batches applied from outside this engine, or replayed in recovery, may
/// use ids the local id generators never handed out.
pub struct HighIdApplierFactory {
    stores: Stores,
}

impl HighIdApplierFactory {
    /// Raises the high ids of `stores`.
    pub fn new(stores: Stores) -> Self {
        Self { stores }
    }
}

impl TransactionApplierFactory for HighIdApplierFactory {
    fn name(&self) -> &'static str {
        "high_id"
    }

    fn start_tx<'a>(
        &'a self,
        _batch: &CommandBatch,
        _mode: ApplicationMode,
    ) -> Result<Box<dyn TransactionApplier + 'a>> {
        Ok(Box::new(HighIdApplier {
            stores: &self.stores,
            highest: BTreeMap::new(),
        }))
    }
}

struct HighIdApplier<'a> {
    stores: &'a Stores,
    highest: BTreeMap<StoreKind, u64>,
}

impl HighIdApplier<'_> {
    fn track(&mut self, kind: StoreKind, id: u64) {
        let slot = self.highest.entry(kind).or_insert(id);
        *slot = (*slot).max(id);
    }

    fn track_record<R: Record>(&mut self, kind: StoreKind, record: &R) {
        self.track(kind, record.id().raw());
        if let Some(unit) = record.secondary_unit().and_then(|unit| unit.id) {
            self.track(kind, unit);
        }
    }

    fn track_dynamics(&mut self, kind: StoreKind, records: &[DynamicRecord]) {
        for record in records {
            self.track(kind, record.id.0);
        }
    }

    fn track_token(&mut self, kind: TokenKind, command: &RecordCommand<TokenRecord>) -> Result<bool> {
        self.track_record(StoreKind::token(kind), &command.after);
        self.track_dynamics(StoreKind::TokenNames, &command.after.name_records);
        Ok(false)
    }
}

impl CommandVisitor for HighIdApplier<'_> {
    fn visit_node_command(&mut self, command: &RecordCommand<NodeRecord>) -> Result<bool> {
        self.track_record(StoreKind::Nodes, &command.after);
        self.track_dynamics(StoreKind::NodeLabels, &command.after.dynamic_labels);
        Ok(false)
    }

    fn visit_relationship_command(
        &mut self,
        command: &RecordCommand<RelationshipRecord>,
    ) -> Result<bool> {
        self.track_record(StoreKind::Relationships, &command.after);
        Ok(false)
    }

    fn visit_relationship_group_command(
        &mut self,
        command: &RecordCommand<RelationshipGroupRecord>,
    ) -> Result<bool> {
        self.track_record(StoreKind::RelationshipGroups, &command.after);
        Ok(false)
    }

    fn visit_property_command(&mut self, command: &RecordCommand<PropertyRecord>) -> Result<bool> {
        let after = &command.after;
        self.track_record(StoreKind::Properties, after);
        for block in &after.blocks {
            self.track_dynamics(StoreKind::PropertyValues, &block.value_records);
        }
        self.track_dynamics(StoreKind::PropertyValues, &after.deleted_records);
        Ok(false)
    }

    fn visit_label_token_command(&mut self, command: &RecordCommand<TokenRecord>) -> Result<bool> {
        self.track_token(TokenKind::Label, command)
    }

    fn visit_relationship_type_token_command(
        &mut self,
        command: &RecordCommand<TokenRecord>,
    ) -> Result<bool> {
        self.track_token(TokenKind::RelationshipType, command)
    }

    fn visit_property_key_token_command(
        &mut self,
        command: &RecordCommand<TokenRecord>,
    ) -> Result<bool> {
        self.track_token(TokenKind::PropertyKey, command)
    }

    fn visit_schema_command(&mut self, command: &RecordCommand<SchemaRecord>) -> Result<bool> {
        self.track_record(StoreKind::Schema, &command.after);
        Ok(false)
    }

    fn visit_metadata_command(&mut self, command: &RecordCommand<MetaDataRecord>) -> Result<bool> {
        self.track_record(StoreKind::MetaData, &command.after);
        Ok(false)
    }
}

impl TransactionApplier for HighIdApplier<'_> {
    fn visitor(&mut self) -> &mut dyn CommandVisitor {
        self
    }

    fn close(&mut self) -> Result<()> {
        for (kind, highest) in std::mem::take(&mut self.highest) {
            let at_least = highest.saturating_add(1);
            self.stores.set_high_id(kind, at_least);
            trace!(store = ?kind, at_least, "apply.high_id.raised");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::apply::{ApplierChain, StoreApplierFactory};
    use crate::storage::command::{samples, Command};
    use crate::types::{NodeId, TxId};
    use std::sync::Arc;

    fn chain(stores: &Stores) -> ApplierChain {
        ApplierChain::new(
            ApplicationMode::Recovery,
            vec![
                Arc::new(StoreApplierFactory::new(stores.clone())),
                Arc::new(HighIdApplierFactory::new(stores.clone())),
            ],
        )
    }

    #[test]
    fn replaying_a_creation_twice_leaves_high_id_one_past() -> Result<()> {
        let stores = Stores::in_memory();
        let before = NodeRecord::unused(NodeId(41));
        let mut after = before.clone();
        after.in_use = true;
        after.created = true;
        let batch = CommandBatch::new(
            TxId(1),
            vec![Command::Node(RecordCommand::new(before, after))],
        );
        let chain = chain(&stores);
        chain.apply(&batch)?;
        chain.apply(&batch)?;
        assert_eq!(stores.nodes.high_id(), 42);
        Ok(())
    }

    #[test]
    fn secondary_units_and_dynamic_records_count() -> Result<()> {
        let stores = Stores::in_memory();
        let batch = CommandBatch::new(TxId(1), vec![Command::Node(samples::node(11))]);
        chain(&stores).apply(&batch)?;
        // Secondary unit 77 lives in the node id space.
        assert_eq!(stores.nodes.high_id(), 78);
        assert_eq!(stores.node_labels.high_id(), 42);
        Ok(())
    }

    #[test]
    fn high_ids_never_move_backwards() -> Result<()> {
        let stores = Stores::in_memory();
        stores.nodes.set_high_id(500);
        let batch = CommandBatch::new(TxId(1), vec![Command::Node(samples::node(3))]);
        chain(&stores).apply(&batch)?;
        assert_eq!(stores.nodes.high_id(), 500);
        Ok(())
    }
}
