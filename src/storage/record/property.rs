use crate::types::{NodeId, PropId, PropKeyId, RecordKind, RelId};

use super::{DynamicRecord, SecondaryUnit};

/// Property blocks a single property record holds.
pub const MAX_BLOCKS_PER_RECORD: usize = 4;
/// Values up to this many bytes are stored inline in their block.
pub const MAX_INLINE_VALUE_LEN: usize = 24;

/// Entity a property chain hangs off.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PropertyOwner {
    /// Owned by a node.
    Node(NodeId),
    /// Owned by a relationship.
    Relationship(RelId),
}

/// One key/value slot. The value bytes are opaque to the storage layer.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PropertyBlock {
    /// Property key.
    pub key: PropKeyId,
    /// Value bytes when they fit inline.
    pub inline: Vec<u8>,
    /// Spilled value; when non-empty `inline` is unused.
    pub value_records: Vec<DynamicRecord>,
}

/// Up to four key/value blocks in an owner's property chain.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PropertyRecord {
    /// Record id.
    pub id: PropId,
    /// Whether the record holds live blocks.
    pub in_use: bool,
    /// Created by the current transaction.
    pub created: bool,
    /// Entity whose chain holds the record.
    pub owner: Option<PropertyOwner>,
    /// Previous record in the chain.
    pub prev_prop: Option<PropId>,
    /// Next record in the chain.
    pub next_prop: Option<PropId>,
    /// Key/value blocks, at most [`MAX_BLOCKS_PER_RECORD`].
    pub blocks: Vec<PropertyBlock>,
    /// Value records freed by this transaction, kept so they get written back unused.
    pub deleted_records: Vec<DynamicRecord>,
    /// Continuation unit.
    pub secondary: SecondaryUnit,
}

impl PropertyRecord {
    /// A blank, unused property record.
    pub fn unused(id: PropId) -> Self {
        Self {
            id,
            in_use: false,
            created: false,
            owner: None,
            prev_prop: None,
            next_prop: None,
            blocks: Vec::new(),
            deleted_records: Vec::new(),
            secondary: SecondaryUnit::default(),
        }
    }

    /// Block holding `key`, if any.
    pub fn block(&self, key: PropKeyId) -> Option<&PropertyBlock> {
        self.blocks.iter().find(|b| b.key == key)
    }

    /// True while another block fits.
    pub fn has_free_block(&self) -> bool {
        self.blocks.len() < MAX_BLOCKS_PER_RECORD
    }

    /// Removes the block for `key`, moving its value records to the deleted list.
    pub fn remove_block(&mut self, key: PropKeyId) -> Option<PropertyBlock> {
        let idx = self.blocks.iter().position(|b| b.key == key)?;
        let mut block = self.blocks.remove(idx);
        for mut record in block.value_records.drain(..) {
            record.in_use = false;
            self.deleted_records.push(record);
        }
        Some(block)
    }
}

impl_record!(PropertyRecord, PropId, RecordKind::Property, secondary);
