use crate::types::{MetaId, RecordKind};

/// Engine metadata field; the id is the field position.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MetaDataRecord {
    /// Field position.
    pub id: MetaId,
    /// Whether the field is set.
    pub in_use: bool,
    /// Created by the current transaction.
    pub created: bool,
    /// Field value.
    pub value: u64,
}

impl MetaDataRecord {
    /// A blank, unset field.
    pub fn unused(id: MetaId) -> Self {
        Self {
            id,
            in_use: false,
            created: false,
            value: 0,
        }
    }
}

impl_record!(MetaDataRecord, MetaId, RecordKind::MetaData);
