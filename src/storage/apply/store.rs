use crate::storage::command::{CommandBatch, CommandVisitor, RecordCommand};
use crate::storage::record::{
    DynamicRecord, MetaDataRecord, NodeRecord, PropertyRecord, RelationshipGroupRecord,
    RelationshipRecord, SchemaRecord, TokenKind, TokenRecord,
};
use crate::storage::store::{RecordStore, Stores};
use crate::types::Result;

use super::{ApplicationMode, TransactionApplier, TransactionApplierFactory};

/// Writes after images to the record stores.
///
/// Dynamic records travel inside their owners' images. They are written to
/// their own stores first; unused ones are dropped from the owner's stored
/// copy.
pub struct StoreApplierFactory {
    stores: Stores,
}

impl StoreApplierFactory {
    /// Writes records to `stores`.
    pub fn new(stores: Stores) -> Self {
        Self { stores }
    }
}

impl TransactionApplierFactory for StoreApplierFactory {
    fn name(&self) -> &'static str {
        "store"
    }

    fn start_tx<'a>(
        &'a self,
        _batch: &CommandBatch,
        _mode: ApplicationMode,
    ) -> Result<Box<dyn TransactionApplier + 'a>> {
        Ok(Box::new(StoreApplier {
            stores: &self.stores,
        }))
    }
}

struct StoreApplier<'a> {
    stores: &'a Stores,
}

fn write_dynamics(store: &dyn RecordStore<DynamicRecord>, records: &[DynamicRecord]) -> Result<()> {
    for record in records {
        store.update_record(record)?;
    }
    Ok(())
}

impl StoreApplier<'_> {
    fn apply_token(&self, kind: TokenKind, command: &RecordCommand<TokenRecord>) -> Result<bool> {
        let after = &command.after;
        write_dynamics(self.stores.token_names.as_ref(), &after.name_records)?;
        let mut stored = after.clone();
        stored.name_records.retain(|r| r.in_use);
        self.stores.tokens(kind).update_record(&stored)?;
        Ok(false)
    }
}

impl CommandVisitor for StoreApplier<'_> {
    fn visit_node_command(&mut self, command: &RecordCommand<NodeRecord>) -> Result<bool> {
        let after = &command.after;
        write_dynamics(self.stores.node_labels.as_ref(), &after.dynamic_labels)?;
        if after.dynamic_labels.iter().all(|r| r.in_use) {
            self.stores.nodes.update_record(after)?;
        } else {
            let mut stored = after.clone();
            stored.dynamic_labels.retain(|r| r.in_use);
            self.stores.nodes.update_record(&stored)?;
        }
        Ok(false)
    }

    fn visit_relationship_command(
        &mut self,
        command: &RecordCommand<RelationshipRecord>,
    ) -> Result<bool> {
        self.stores.relationships.update_record(&command.after)?;
        Ok(false)
    }

    fn visit_relationship_group_command(
        &mut self,
        command: &RecordCommand<RelationshipGroupRecord>,
    ) -> Result<bool> {
        self.stores.groups.update_record(&command.after)?;
        Ok(false)
    }

    fn visit_property_command(&mut self, command: &RecordCommand<PropertyRecord>) -> Result<bool> {
        let after = &command.after;
        let values = self.stores.property_values.as_ref();
        for block in &after.blocks {
            write_dynamics(values, &block.value_records)?;
        }
        write_dynamics(values, &after.deleted_records)?;
        if after.deleted_records.is_empty() {
            self.stores.properties.update_record(after)?;
        } else {
            let mut stored = after.clone();
            stored.deleted_records.clear();
            self.stores.properties.update_record(&stored)?;
        }
        Ok(false)
    }

    fn visit_label_token_command(&mut self, command: &RecordCommand<TokenRecord>) -> Result<bool> {
        self.apply_token(TokenKind::Label, command)
    }

    fn visit_relationship_type_token_command(
        &mut self,
        command: &RecordCommand<TokenRecord>,
    ) -> Result<bool> {
        self.apply_token(TokenKind::RelationshipType, command)
    }

    fn visit_property_key_token_command(
        &mut self,
        command: &RecordCommand<TokenRecord>,
    ) -> Result<bool> {
        self.apply_token(TokenKind::PropertyKey, command)
    }

    fn visit_schema_command(&mut self, command: &RecordCommand<SchemaRecord>) -> Result<bool> {
        self.stores.schema.update_record(&command.after)?;
        Ok(false)
    }

    fn visit_metadata_command(&mut self, command: &RecordCommand<MetaDataRecord>) -> Result<bool> {
        self.stores.meta.update_record(&command.after)?;
        Ok(false)
    }
}

impl TransactionApplier for StoreApplier<'_> {
    fn visitor(&mut self) -> &mut dyn CommandVisitor {
        self
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}
