use crate::types::{PropId, RecordKind, SchemaId};

use super::SecondaryUnit;

/// Schema rule record. The rule itself is an opaque serialized blob.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SchemaRecord {
    /// Record id.
    pub id: SchemaId,
    /// Whether the rule exists.
    pub in_use: bool,
    /// Created by the current transaction.
    pub created: bool,
    /// The rule is a constraint rather than an index.
    pub constraint: bool,
    /// First record of the property chain.
    pub next_prop: Option<PropId>,
    /// Serialized rule.
    pub rule: Vec<u8>,
    /// Continuation unit.
    pub secondary: SecondaryUnit,
}

impl SchemaRecord {
    /// A blank, unused schema record.
    pub fn unused(id: SchemaId) -> Self {
        Self {
            id,
            in_use: false,
            created: false,
            constraint: false,
            next_prop: None,
            rule: Vec::new(),
            secondary: SecondaryUnit::default(),
        }
    }
}

impl_record!(SchemaRecord, SchemaId, RecordKind::Schema, secondary);
