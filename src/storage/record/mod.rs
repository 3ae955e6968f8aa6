//! Fixed-identity records and their in-memory shapes.

use std::fmt;

use crate::types::{RecordId, RecordKind};

macro_rules! impl_record {
    ($record:ty, $id:ty, $kind:expr, secondary) => {
        impl $crate::storage::record::Record for $record {
            type Id = $id;
            const KIND: $crate::types::RecordKind = $kind;

            fn new_unused(id: $id) -> Self {
                <$record>::unused(id)
            }
            fn id(&self) -> $id {
                self.id
            }
            fn in_use(&self) -> bool {
                self.in_use
            }
            fn set_in_use(&mut self, in_use: bool) {
                self.in_use = in_use;
            }
            fn is_created(&self) -> bool {
                self.created
            }
            fn set_created(&mut self, created: bool) {
                self.created = created;
            }
            fn secondary_unit(&self) -> Option<&$crate::storage::record::SecondaryUnit> {
                Some(&self.secondary)
            }
        }
    };
    ($record:ty, $id:ty, $kind:expr) => {
        impl $crate::storage::record::Record for $record {
            type Id = $id;
            const KIND: $crate::types::RecordKind = $kind;

            fn new_unused(id: $id) -> Self {
                <$record>::unused(id)
            }
            fn id(&self) -> $id {
                self.id
            }
            fn in_use(&self) -> bool {
                self.in_use
            }
            fn set_in_use(&mut self, in_use: bool) {
                self.in_use = in_use;
            }
            fn is_created(&self) -> bool {
                self.created
            }
            fn set_created(&mut self, created: bool) {
                self.created = created;
            }
        }
    };
}

pub(crate) use impl_record;

mod dynamic;
mod group;
mod meta;
mod node;
mod property;
mod relationship;
mod schema;
mod token;

pub use dynamic::{read_dynamic_chain, split_into_dynamic_records, DynamicRecord};
pub use group::{Direction, RelationshipGroupRecord};
pub use meta::MetaDataRecord;
pub use node::{NodeChain, NodeRecord, INLINE_LABEL_CAPACITY};
pub use property::{
    PropertyBlock, PropertyOwner, PropertyRecord, MAX_BLOCKS_PER_RECORD, MAX_INLINE_VALUE_LEN,
};
pub use relationship::{ChainEnd, PrevLink, RelationshipRecord};
pub use schema::SchemaRecord;
pub use token::{TokenKind, TokenRecord};

/// Overflow continuation unit of a record, addressed in the same id space.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct SecondaryUnit {
    /// The record does not fit a single unit.
    pub required: bool,
    /// Id of the allocated continuation unit.
    pub id: Option<u64>,
}

/// Behaviour shared by every record type.
pub trait Record: Clone + PartialEq + fmt::Debug + Send + Sync + 'static {
    /// Identifier type addressing this record's store.
    type Id: RecordId;
    /// Record kind, for errors and logs.
    const KIND: RecordKind;

    /// A blank, unused record at `id`.
    fn new_unused(id: Self::Id) -> Self;
    /// Id of the record.
    fn id(&self) -> Self::Id;
    /// Whether the record is live.
    fn in_use(&self) -> bool;
    /// Marks the record live or unused.
    fn set_in_use(&mut self, in_use: bool);
    /// Whether the record was created by the current transaction.
    fn is_created(&self) -> bool;
    /// Marks the record as created by the current transaction.
    fn set_created(&mut self, created: bool);
    /// Continuation unit, for record types that may need one.
    fn secondary_unit(&self) -> Option<&SecondaryUnit> {
        None
    }
}
