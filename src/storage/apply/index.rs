use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::debug;

use crate::storage::command::{
    Command, CommandBatch, CommandVisitor, EntityCommandGrouper, EntityKind, RecordCommand,
};
use crate::storage::record::{NodeRecord, PropertyBlock, PropertyRecord};
use crate::types::{LabelId, NodeId, PropKeyId, Result};

use super::{ApplicationMode, TransactionApplier, TransactionApplierFactory};

/// Label change of one node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EntityTokenUpdate {
    /// Node whose labels changed.
    pub entity: NodeId,
    /// Labels before the batch, sorted.
    pub before: Vec<LabelId>,
    /// Labels after the batch, sorted.
    pub after: Vec<LabelId>,
}

impl EntityTokenUpdate {
    /// Labels present only after the batch.
    pub fn added(&self) -> Vec<LabelId> {
        self.after
            .iter()
            .filter(|label| !self.before.contains(label))
            .copied()
            .collect()
    }

    /// Labels present only before the batch.
    pub fn removed(&self) -> Vec<LabelId> {
        self.before
            .iter()
            .filter(|label| !self.after.contains(label))
            .copied()
            .collect()
    }
}

/// Property keys of one node whose values were set or removed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EntityPropertyUpdate {
    /// Node whose properties changed.
    pub entity: NodeId,
    /// Keys set by the batch.
    pub changed: Vec<PropKeyId>,
    /// Keys removed by the batch.
    pub removed: Vec<PropKeyId>,
}

/// Receives node label and property changes once per batch, ordered by
/// ascending node id.
pub trait IndexUpdateListener: Send + Sync {
    /// Label changes of one batch.
    fn apply_label_updates(&self, updates: &[EntityTokenUpdate]) -> Result<()>;
    /// Property key changes of one batch.
    fn apply_property_updates(&self, updates: &[EntityPropertyUpdate]) -> Result<()>;
}

/// Listener for engines without indexes.
#[derive(Default, Debug, Clone, Copy)]
pub struct NoopIndexListener;

impl IndexUpdateListener for NoopIndexListener {
    fn apply_label_updates(&self, _updates: &[EntityTokenUpdate]) -> Result<()> {
        Ok(())
    }

    fn apply_property_updates(&self, _updates: &[EntityPropertyUpdate]) -> Result<()> {
        Ok(())
    }
}

/// Groups node label and property changes per batch and hands them to an
/// [`IndexUpdateListener`] when the batch closes.
pub struct IndexApplierFactory {
    listener: Arc<dyn IndexUpdateListener>,
}

impl IndexApplierFactory {
    /// Notifies `listener` once per batch.
    pub fn new(listener: Arc<dyn IndexUpdateListener>) -> Self {
        Self { listener }
    }
}

impl TransactionApplierFactory for IndexApplierFactory {
    fn name(&self) -> &'static str {
        "index"
    }

    fn start_tx<'a>(
        &'a self,
        batch: &CommandBatch,
        _mode: ApplicationMode,
    ) -> Result<Box<dyn TransactionApplier + 'a>> {
        Ok(Box::new(IndexApplier {
            listener: self.listener.as_ref(),
            grouper: EntityCommandGrouper::with_capacity(EntityKind::Node, batch.len()),
        }))
    }
}

struct IndexApplier<'a> {
    listener: &'a dyn IndexUpdateListener,
    grouper: EntityCommandGrouper,
}

fn labels_of(node: &NodeRecord) -> Vec<LabelId> {
    if node.in_use {
        node.labels.clone()
    } else {
        Vec::new()
    }
}

fn blocks_of(record: &PropertyRecord) -> impl Iterator<Item = &PropertyBlock> {
    record.blocks.iter().filter(move |_| record.in_use)
}

impl CommandVisitor for IndexApplier<'_> {
    fn visit_node_command(&mut self, command: &RecordCommand<NodeRecord>) -> Result<bool> {
        self.grouper.add(Command::Node(command.clone()))?;
        Ok(false)
    }

    fn visit_property_command(&mut self, command: &RecordCommand<PropertyRecord>) -> Result<bool> {
        self.grouper.add(Command::Property(command.clone()))?;
        Ok(false)
    }
}

impl TransactionApplier for IndexApplier<'_> {
    fn visitor(&mut self) -> &mut dyn CommandVisitor {
        self
    }

    fn close(&mut self) -> Result<()> {
        let mut label_updates = Vec::new();
        let mut property_updates = Vec::new();
        {
            let mut cursor = self.grouper.sort_and_access_groups();
            while let Some(entity) = cursor.next_entity() {
                let entity = NodeId(entity);
                if let Some(Command::Node(node)) = cursor.current_entity_command() {
                    let before = labels_of(&node.before);
                    let after = labels_of(&node.after);
                    if before != after {
                        label_updates.push(EntityTokenUpdate {
                            entity,
                            before,
                            after,
                        });
                    }
                }
                let mut before: BTreeMap<PropKeyId, &PropertyBlock> = BTreeMap::new();
                let mut after: BTreeMap<PropKeyId, &PropertyBlock> = BTreeMap::new();
                while let Some(property) = cursor.next_property() {
                    before.extend(blocks_of(&property.before).map(|b| (b.key, b)));
                    after.extend(blocks_of(&property.after).map(|b| (b.key, b)));
                }
                let mut changed = Vec::new();
                for (key, block) in &after {
                    if before.get(key) != Some(block) {
                        changed.push(*key);
                    }
                }
                let removed: Vec<_> = before
                    .keys()
                    .filter(|key| !after.contains_key(*key))
                    .copied()
                    .collect();
                if !changed.is_empty() || !removed.is_empty() {
                    property_updates.push(EntityPropertyUpdate {
                        entity,
                        changed,
                        removed,
                    });
                }
            }
        }
        self.grouper.clear();
        if !label_updates.is_empty() {
            self.listener.apply_label_updates(&label_updates)?;
        }
        if !property_updates.is_empty() {
            self.listener.apply_property_updates(&property_updates)?;
        }
        debug!(
            labels = label_updates.len(),
            properties = property_updates.len(),
            "apply.index.dispatched"
        );
        Ok(())
    }
}
