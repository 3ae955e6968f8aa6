//! Record store contract and the in-memory reference stores.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::storage::record::{
    Direction, DynamicRecord, MetaDataRecord, NodeRecord, PropertyRecord, Record,
    RelationshipGroupRecord, RelationshipRecord, SchemaRecord, TokenKind, TokenRecord,
};
use crate::types::{GroupId, LabelId, RecordId, Result, SombraError, TxId, TypeId};

/// How strictly a load treats unused records.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RecordLoad {
    /// Unused or never written records fail with `MissingRecord`.
    Normal,
    /// Unused records are returned as they are.
    Always,
}

/// Source of fresh ids.
pub trait IdSequence {
    /// Hands out the next unused id.
    fn next_id(&self) -> u64;
}

/// Store collaborator for one record type.
pub trait RecordStore<R: Record>: Send + Sync {
    /// Blank record for `id`.
    fn new_record(&self, id: R::Id) -> R {
        R::new_unused(id)
    }
    /// Reads the record at `id`.
    fn get_record(&self, id: R::Id, mode: RecordLoad) -> Result<R>;
    /// Writes `record` at its id.
    fn update_record(&self, record: &R) -> Result<()>;
    /// One past the highest id known to be in use.
    fn high_id(&self) -> u64;
    /// Raises the high id to at least `at_least`.
    fn set_high_id(&self, at_least: u64);
    /// Allocates the next id.
    fn next_id(&self) -> u64;
}

/// Adapts a record store to an [`IdSequence`].
pub struct StoreIds<'a, R: Record>(pub &'a dyn RecordStore<R>);

impl<R: Record> IdSequence for StoreIds<'_, R> {
    fn next_id(&self) -> u64 {
        self.0.next_id()
    }
}

/// Map-backed store.
pub struct MemoryStore<R: Record> {
    name: &'static str,
    records: RwLock<BTreeMap<R::Id, R>>,
    high_id: AtomicU64,
}

impl<R: Record> MemoryStore<R> {
    /// Empty store; `name` shows up in logs and debug output.
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            records: RwLock::new(BTreeMap::new()),
            high_id: AtomicU64::new(0),
        }
    }

    /// Name given at construction.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Number of in-use records.
    pub fn in_use_count(&self) -> usize {
        self.records.read().values().filter(|r| r.in_use()).count()
    }
}

impl<R: Record> fmt::Debug for MemoryStore<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryStore")
            .field("name", &self.name)
            .field("high_id", &self.high_id.load(Ordering::Relaxed))
            .finish()
    }
}

impl<R: Record> RecordStore<R> for MemoryStore<R> {
    fn get_record(&self, id: R::Id, mode: RecordLoad) -> Result<R> {
        let records = self.records.read();
        match (records.get(&id), mode) {
            (Some(record), _) if record.in_use() => Ok(record.clone()),
            (Some(record), RecordLoad::Always) => Ok(record.clone()),
            (None, RecordLoad::Always) => Ok(R::new_unused(id)),
            _ => Err(SombraError::MissingRecord {
                kind: R::KIND,
                id: id.raw(),
            }),
        }
    }

    fn update_record(&self, record: &R) -> Result<()> {
        let mut stored = record.clone();
        stored.set_created(false);
        self.records.write().insert(record.id(), stored);
        Ok(())
    }

    fn high_id(&self) -> u64 {
        self.high_id.load(Ordering::Acquire)
    }

    fn set_high_id(&self, at_least: u64) {
        self.high_id.fetch_max(at_least, Ordering::AcqRel);
    }

    fn next_id(&self) -> u64 {
        self.high_id.fetch_add(1, Ordering::AcqRel)
    }
}

/// Stores addressed by the high-id tracker.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum StoreKind {
    /// Node records.
    Nodes,
    /// Dynamic records holding spilled label sets.
    NodeLabels,
    /// Relationship records.
    Relationships,
    /// Relationship group records.
    RelationshipGroups,
    /// Property records.
    Properties,
    /// Dynamic records holding spilled property values.
    PropertyValues,
    /// Label tokens.
    LabelTokens,
    /// Relationship type tokens.
    RelationshipTypeTokens,
    /// Property key tokens.
    PropertyKeyTokens,
    /// Dynamic records holding token names.
    TokenNames,
    /// Schema rules.
    Schema,
    /// Metadata fields.
    MetaData,
}

impl StoreKind {
    /// Every kind in index order.
    pub const ALL: [StoreKind; 12] = [
        StoreKind::Nodes,
        StoreKind::NodeLabels,
        StoreKind::Relationships,
        StoreKind::RelationshipGroups,
        StoreKind::Properties,
        StoreKind::PropertyValues,
        StoreKind::LabelTokens,
        StoreKind::RelationshipTypeTokens,
        StoreKind::PropertyKeyTokens,
        StoreKind::TokenNames,
        StoreKind::Schema,
        StoreKind::MetaData,
    ];

    /// Position in [`StoreKind::ALL`].
    pub fn index(self) -> usize {
        self as usize
    }

    /// Token store for `kind`.
    pub fn token(kind: TokenKind) -> Self {
        match kind {
            TokenKind::Label => StoreKind::LabelTokens,
            TokenKind::RelationshipType => StoreKind::RelationshipTypeTokens,
            TokenKind::PropertyKey => StoreKind::PropertyKeyTokens,
        }
    }
}

/// Key of one counter in the [`CountsStore`].
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum CountsKey {
    /// Nodes carrying `label`, or all nodes.
    Nodes {
        /// Label filter; `None` counts every node.
        label: Option<LabelId>,
    },
    /// Relationships of `ty` (or any type) between the given labels.
    Relationships {
        /// Label of the start node, if filtered.
        start_label: Option<LabelId>,
        /// Relationship type, if filtered.
        ty: Option<TypeId>,
        /// Label of the end node, if filtered.
        end_label: Option<LabelId>,
    },
    /// Degree of one dense sub-chain tracked outside its group record.
    GroupDegree {
        /// Group owning the sub-chain.
        group: GroupId,
        /// Which of the group's chains.
        direction: Direction,
    },
}

/// Aggregated counters with the id of the last transaction applied.
#[derive(Default)]
pub struct CountsStore {
    counts: RwLock<FxHashMap<CountsKey, i64>>,
    last_applied_tx: AtomicU64,
}

impl CountsStore {
    /// Empty counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of `key`; zero when never touched.
    pub fn get(&self, key: &CountsKey) -> i64 {
        self.counts.read().get(key).copied().unwrap_or(0)
    }

    /// Highest transaction folded into the counters.
    pub fn last_applied_tx(&self) -> TxId {
        TxId(self.last_applied_tx.load(Ordering::Acquire))
    }

    /// True when `tx` has already been folded into the counters.
    pub fn has_applied(&self, tx: TxId) -> bool {
        tx.0 != 0 && tx <= self.last_applied_tx()
    }

    /// Adds `deltas` and records `tx` as applied.
    pub fn apply(&self, tx: TxId, deltas: &[(CountsKey, i64)]) {
        let mut counts = self.counts.write();
        for (key, delta) in deltas {
            let slot = counts.entry(*key).or_insert(0);
            *slot += *delta;
            if *slot == 0 {
                counts.remove(key);
            }
        }
        self.last_applied_tx.fetch_max(tx.0, Ordering::AcqRel);
    }

    /// Copy of every non-zero counter.
    pub fn snapshot(&self) -> BTreeMap<CountsKey, i64> {
        self.counts
            .read()
            .iter()
            .map(|(k, v)| (*k, *v))
            .collect()
    }
}

/// Every store the engine mutates.
#[derive(Clone)]
pub struct Stores {
    /// Node store.
    pub nodes: Arc<dyn RecordStore<NodeRecord>>,
    /// Spilled label sets.
    pub node_labels: Arc<dyn RecordStore<DynamicRecord>>,
    /// Relationship store.
    pub relationships: Arc<dyn RecordStore<RelationshipRecord>>,
    /// Relationship group store.
    pub groups: Arc<dyn RecordStore<RelationshipGroupRecord>>,
    /// Property store.
    pub properties: Arc<dyn RecordStore<PropertyRecord>>,
    /// Spilled property values.
    pub property_values: Arc<dyn RecordStore<DynamicRecord>>,
    /// Label token store.
    pub label_tokens: Arc<dyn RecordStore<TokenRecord>>,
    /// Relationship type token store.
    pub relationship_type_tokens: Arc<dyn RecordStore<TokenRecord>>,
    /// Property key token store.
    pub property_key_tokens: Arc<dyn RecordStore<TokenRecord>>,
    /// Token name records.
    pub token_names: Arc<dyn RecordStore<DynamicRecord>>,
    /// Schema rule store.
    pub schema: Arc<dyn RecordStore<SchemaRecord>>,
    /// Metadata store.
    pub meta: Arc<dyn RecordStore<MetaDataRecord>>,
    /// Aggregated counters.
    pub counts: Arc<CountsStore>,
}

impl Stores {
    /// Fresh, empty in-memory stores.
    pub fn in_memory() -> Self {
        Self {
            nodes: Arc::new(MemoryStore::new("nodes")),
            node_labels: Arc::new(MemoryStore::new("node_labels")),
            relationships: Arc::new(MemoryStore::new("relationships")),
            groups: Arc::new(MemoryStore::new("relationship_groups")),
            properties: Arc::new(MemoryStore::new("properties")),
            property_values: Arc::new(MemoryStore::new("property_values")),
            label_tokens: Arc::new(MemoryStore::new("label_tokens")),
            relationship_type_tokens: Arc::new(MemoryStore::new("relationship_type_tokens")),
            property_key_tokens: Arc::new(MemoryStore::new("property_key_tokens")),
            token_names: Arc::new(MemoryStore::new("token_names")),
            schema: Arc::new(MemoryStore::new("schema")),
            meta: Arc::new(MemoryStore::new("meta")),
            counts: Arc::new(CountsStore::new()),
        }
    }

    /// Token store for `kind`.
    pub fn tokens(&self, kind: TokenKind) -> &Arc<dyn RecordStore<TokenRecord>> {
        match kind {
            TokenKind::Label => &self.label_tokens,
            TokenKind::RelationshipType => &self.relationship_type_tokens,
            TokenKind::PropertyKey => &self.property_key_tokens,
        }
    }

    /// High id of the store behind `kind`.
    pub fn high_id(&self, kind: StoreKind) -> u64 {
        match kind {
            StoreKind::Nodes => self.nodes.high_id(),
            StoreKind::NodeLabels => self.node_labels.high_id(),
            StoreKind::Relationships => self.relationships.high_id(),
            StoreKind::RelationshipGroups => self.groups.high_id(),
            StoreKind::Properties => self.properties.high_id(),
            StoreKind::PropertyValues => self.property_values.high_id(),
            StoreKind::LabelTokens => self.label_tokens.high_id(),
            StoreKind::RelationshipTypeTokens => self.relationship_type_tokens.high_id(),
            StoreKind::PropertyKeyTokens => self.property_key_tokens.high_id(),
            StoreKind::TokenNames => self.token_names.high_id(),
            StoreKind::Schema => self.schema.high_id(),
            StoreKind::MetaData => self.meta.high_id(),
        }
    }

    /// Raises the high id of the store behind `kind` to at least `at_least`.
    pub fn set_high_id(&self, kind: StoreKind, at_least: u64) {
        match kind {
            StoreKind::Nodes => self.nodes.set_high_id(at_least),
            StoreKind::NodeLabels => self.node_labels.set_high_id(at_least),
            StoreKind::Relationships => self.relationships.set_high_id(at_least),
            StoreKind::RelationshipGroups => self.groups.set_high_id(at_least),
            StoreKind::Properties => self.properties.set_high_id(at_least),
            StoreKind::PropertyValues => self.property_values.set_high_id(at_least),
            StoreKind::LabelTokens => self.label_tokens.set_high_id(at_least),
            StoreKind::RelationshipTypeTokens => {
                self.relationship_type_tokens.set_high_id(at_least)
            }
            StoreKind::PropertyKeyTokens => self.property_key_tokens.set_high_id(at_least),
            StoreKind::TokenNames => self.token_names.set_high_id(at_least),
            StoreKind::Schema => self.schema.set_high_id(at_least),
            StoreKind::MetaData => self.meta.set_high_id(at_least),
        }
    }
}
