//! Per-transaction staging of record before/after images.
//!
//! Every record a transaction touches is loaded at most once into a
//! [`RecordChanges`] table. The table keeps the loaded original next to a
//! working copy, and the pair later becomes a command.

use std::collections::btree_map::{BTreeMap, Entry as MapEntry};
use std::sync::Arc;

use crate::storage::record::{
    MetaDataRecord, NodeRecord, PropertyOwner, PropertyRecord, Record, RelationshipGroupRecord,
    RelationshipRecord, SchemaRecord, TokenKind, TokenRecord,
};
use crate::storage::store::{RecordLoad, RecordStore, Stores};
use crate::types::Result;

/// Load/create functions for one record type.
pub trait Loader<R: Record, A>: Send {
    /// Blank record for a `create`.
    fn new_record(&self, id: R::Id, extra: &A) -> R;
    /// Reads the stored record.
    fn load(&self, id: R::Id, extra: &A, mode: RecordLoad) -> Result<R>;
}

/// Loader reading through a [`RecordStore`], with an optional initializer
/// for created records.
pub struct StoreLoader<R: Record, A = ()> {
    store: Arc<dyn RecordStore<R>>,
    init: fn(&mut R, &A),
}

impl<R: Record> StoreLoader<R, ()> {
    /// Loader with no initializer.
    pub fn new(store: Arc<dyn RecordStore<R>>) -> Self {
        Self {
            store,
            init: |_, _| {},
        }
    }
}

impl<R: Record, A> StoreLoader<R, A> {
    /// Loader that runs `init` on every created record.
    pub fn with_init(store: Arc<dyn RecordStore<R>>, init: fn(&mut R, &A)) -> Self {
        Self { store, init }
    }
}

impl<R: Record, A> Loader<R, A> for StoreLoader<R, A> {
    fn new_record(&self, id: R::Id, extra: &A) -> R {
        let mut record = self.store.new_record(id);
        (self.init)(&mut record, extra);
        record
    }

    fn load(&self, id: R::Id, _extra: &A, mode: RecordLoad) -> Result<R> {
        self.store.get_record(id, mode)
    }
}

#[derive(Debug)]
struct Entry<R, A> {
    before: Option<R>,
    after: R,
    created: bool,
    additional: A,
}

impl<R: Record, A> Entry<R, A> {
    fn is_changed(&self) -> bool {
        self.created || self.before.as_ref() != Some(&self.after)
    }
}

/// Handle on one staged record.
pub struct RecordProxy<'a, R: Record, A> {
    entry: &'a mut Entry<R, A>,
}

impl<'a, R: Record, A> RecordProxy<'a, R, A> {
    /// Id of the staged record.
    pub fn id(&self) -> R::Id {
        self.entry.after.id()
    }

    /// Read-only view of the working copy.
    pub fn for_reading_data(&self) -> &R {
        &self.entry.after
    }

    /// Mutable view of the working copy.
    pub fn for_changing_data(&mut self) -> &mut R {
        &mut self.entry.after
    }

    /// View used to follow chain pointers.
    pub fn for_reading_linkage(&self) -> &R {
        &self.entry.after
    }

    /// Consumes the proxy, keeping the mutable borrow.
    pub fn into_changing_data(self) -> &'a mut R {
        &mut self.entry.after
    }

    /// True when the record was created by this transaction.
    pub fn is_created(&self) -> bool {
        self.entry.created
    }

    /// Image loaded from the store; `None` for created records.
    pub fn before(&self) -> Option<&R> {
        self.entry.before.as_ref()
    }

    /// Extra data passed on first load or create.
    pub fn additional(&self) -> &A {
        &self.entry.additional
    }
}

/// A staged change as seen by command extraction.
#[derive(Debug)]
pub struct StagedChange<'a, R, A> {
    /// Loaded image, `None` when created here.
    pub before: Option<&'a R>,
    /// Working copy.
    pub after: &'a R,
    /// Created by this transaction.
    pub created: bool,
    /// Extra data attached on load.
    pub additional: &'a A,
}

impl<R: Record, A> StagedChange<'_, R, A> {
    /// Before image, a blank unused record when the record was created here.
    pub fn before_image(&self) -> R {
        match self.before {
            Some(before) => before.clone(),
            None => R::new_unused(self.after.id()),
        }
    }
}

/// Staging table for one record type.
pub struct RecordChanges<R: Record, A = ()> {
    entries: BTreeMap<R::Id, Entry<R, A>>,
    loader: Box<dyn Loader<R, A>>,
}

impl<R: Record, A> RecordChanges<R, A> {
    /// Empty table backed by `loader`.
    pub fn new(loader: impl Loader<R, A> + 'static) -> Self {
        Self {
            entries: BTreeMap::new(),
            loader: Box::new(loader),
        }
    }

    /// Staged entry for `id`, loading it on first reference.
    ///
    /// Unused records fail with `MissingRecord`.
    pub fn get_or_load(&mut self, id: R::Id, extra: A) -> Result<RecordProxy<'_, R, A>> {
        self.get_or_load_with(id, extra, RecordLoad::Normal)
    }

    /// Like [`get_or_load`](Self::get_or_load) with an explicit load mode.
    pub fn get_or_load_with(
        &mut self,
        id: R::Id,
        extra: A,
        mode: RecordLoad,
    ) -> Result<RecordProxy<'_, R, A>> {
        let entry = match self.entries.entry(id) {
            MapEntry::Occupied(occupied) => occupied.into_mut(),
            MapEntry::Vacant(vacant) => {
                let record = self.loader.load(id, &extra, mode)?;
                vacant.insert(Entry {
                    before: Some(record.clone()),
                    after: record,
                    created: false,
                    additional: extra,
                })
            }
        };
        Ok(RecordProxy { entry })
    }

    /// Stages a new record marked created. A record already staged under
    /// `id` is returned as is.
    pub fn create(&mut self, id: R::Id, extra: A) -> Result<RecordProxy<'_, R, A>> {
        let entry = match self.entries.entry(id) {
            MapEntry::Occupied(occupied) => occupied.into_mut(),
            MapEntry::Vacant(vacant) => {
                let mut record = self.loader.new_record(id, &extra);
                record.set_created(true);
                vacant.insert(Entry {
                    before: None,
                    after: record,
                    created: true,
                    additional: extra,
                })
            }
        };
        Ok(RecordProxy { entry })
    }

    /// Staged working copy, without loading.
    pub fn peek(&self, id: R::Id) -> Option<&R> {
        self.entries.get(&id).map(|entry| &entry.after)
    }

    /// Staged proxy, without loading.
    pub fn staged(&mut self, id: R::Id) -> Option<RecordProxy<'_, R, A>> {
        self.entries.get_mut(&id).map(|entry| RecordProxy { entry })
    }

    /// True when `id` is staged.
    pub fn contains(&self, id: R::Id) -> bool {
        self.entries.contains_key(&id)
    }

    /// Current state of `id` without staging it: the working copy when
    /// staged, otherwise whatever the store holds, unused records included.
    pub fn read_unstaged(&self, id: R::Id, extra: &A) -> Result<R> {
        match self.entries.get(&id) {
            Some(entry) => Ok(entry.after.clone()),
            None => self.loader.load(id, extra, RecordLoad::Always),
        }
    }

    /// Number of staged records whose working copy differs from the loaded
    /// original. Created records always count.
    pub fn change_size(&self) -> usize {
        self.entries.values().filter(|e| e.is_changed()).count()
    }

    /// Number of staged records, changed or not.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing is staged.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Changed entries in ascending id order.
    pub fn changes(&self) -> impl Iterator<Item = StagedChange<'_, R, A>> + '_ {
        self.entries
            .values()
            .filter(|e| e.is_changed())
            .map(|e| StagedChange {
                before: e.before.as_ref(),
                after: &e.after,
                created: e.created,
                additional: &e.additional,
            })
    }

    /// Drops every staged entry.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// One staging table per record type.
pub struct RecordChangeSet {
    /// Node records.
    pub nodes: RecordChanges<NodeRecord>,
    /// Relationship records.
    pub relationships: RecordChanges<RelationshipRecord>,
    /// Relationship group records.
    pub groups: RecordChanges<RelationshipGroupRecord>,
    /// Property records, keyed with their owner.
    pub properties: RecordChanges<PropertyRecord, PropertyOwner>,
    /// Label name tokens.
    pub label_tokens: RecordChanges<TokenRecord>,
    /// Relationship type name tokens.
    pub relationship_type_tokens: RecordChanges<TokenRecord>,
    /// Property key name tokens.
    pub property_key_tokens: RecordChanges<TokenRecord>,
    /// Schema rule records.
    pub schema: RecordChanges<SchemaRecord>,
    /// Metadata fields.
    pub meta: RecordChanges<MetaDataRecord>,
}

impl RecordChangeSet {
    /// Empty tables loading through `stores`.
    pub fn new(stores: &Stores) -> Self {
        Self {
            nodes: RecordChanges::new(StoreLoader::new(stores.nodes.clone())),
            relationships: RecordChanges::new(StoreLoader::new(stores.relationships.clone())),
            groups: RecordChanges::new(StoreLoader::new(stores.groups.clone())),
            properties: RecordChanges::new(StoreLoader::with_init(
                stores.properties.clone(),
                |record: &mut PropertyRecord, owner: &PropertyOwner| record.owner = Some(*owner),
            )),
            label_tokens: RecordChanges::new(StoreLoader::new(stores.label_tokens.clone())),
            relationship_type_tokens: RecordChanges::new(StoreLoader::new(
                stores.relationship_type_tokens.clone(),
            )),
            property_key_tokens: RecordChanges::new(StoreLoader::new(
                stores.property_key_tokens.clone(),
            )),
            schema: RecordChanges::new(StoreLoader::new(stores.schema.clone())),
            meta: RecordChanges::new(StoreLoader::new(stores.meta.clone())),
        }
    }

    /// Token table for `kind`.
    pub fn tokens_mut(&mut self, kind: TokenKind) -> &mut RecordChanges<TokenRecord> {
        match kind {
            TokenKind::Label => &mut self.label_tokens,
            TokenKind::RelationshipType => &mut self.relationship_type_tokens,
            TokenKind::PropertyKey => &mut self.property_key_tokens,
        }
    }

    /// Total changed records across all tables.
    pub fn change_size(&self) -> usize {
        self.nodes.change_size()
            + self.relationships.change_size()
            + self.groups.change_size()
            + self.properties.change_size()
            + self.label_tokens.change_size()
            + self.relationship_type_tokens.change_size()
            + self.property_key_tokens.change_size()
            + self.schema.change_size()
            + self.meta.change_size()
    }

    /// Drops every staged record.
    pub fn clear(&mut self) {
        self.nodes.clear();
        self.relationships.clear();
        self.groups.clear();
        self.properties.clear();
        self.label_tokens.clear();
        self.relationship_type_tokens.clear();
        self.property_key_tokens.clear();
        self.schema.clear();
        self.meta.clear();
    }
}
