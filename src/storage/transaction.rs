//! Write operations of one transaction, staged as record changes and
//! extracted as an ordered command list.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use tracing::{debug, trace};

use crate::primitives::concurrency::ResourceLocker;
use crate::storage::chain::{
    ChainAccess, DegreeDeltas, ModifyOutcome, PropertyChainDeleter, PropertyDeleter,
    RelationshipModifications, RelationshipModifier,
};
use crate::storage::command::{Command, RecordCommand};
use crate::storage::record::{
    split_into_dynamic_records, DynamicRecord, NodeChain, NodeRecord, PropertyBlock,
    PropertyOwner, Record, TokenKind, INLINE_LABEL_CAPACITY, MAX_INLINE_VALUE_LEN,
};
use crate::storage::staging::{RecordChangeSet, RecordChanges};
use crate::storage::store::{RecordLoad, StoreIds, Stores};
use crate::types::{
    DynId, LabelId, MetaId, NodeId, PropId, PropKeyId, RecordKind, RelId, Result, SchemaId,
    SombraError, TokenId, TypeId,
};

/// Payload bytes per dynamic record of a spilled property value.
pub const PROPERTY_VALUE_BLOCK_SIZE: usize = 120;
/// Payload bytes per dynamic record of a spilled label list.
pub const LABEL_BLOCK_SIZE: usize = 60;
/// Payload bytes per dynamic record of a token name.
pub const TOKEN_NAME_BLOCK_SIZE: usize = 30;
/// Largest property value, token name or schema rule a transaction accepts.
pub const MAX_VALUE_LEN: usize = 64 << 20;

fn check_value_len(len: usize, what: &str) -> Result<()> {
    if len > MAX_VALUE_LEN {
        return Err(SombraError::InvalidOwned(format!(
            "{what} of {len} bytes exceeds {MAX_VALUE_LEN}"
        )));
    }
    Ok(())
}

#[derive(Clone, Debug)]
enum PendingProperty {
    Set(PropKeyId, Vec<u8>),
    Remove(PropKeyId),
}

/// Staged state of one transaction.
pub struct TransactionRecordState {
    stores: Stores,
    changes: RecordChangeSet,
    modifications: RelationshipModifications,
    degrees: DegreeDeltas,
    // Property changes on relationships that only exist once the modifier runs.
    pending_rel_props: BTreeMap<RelId, Vec<PendingProperty>>,
    deferred_node_deletions: BTreeSet<NodeId>,
    node_counts: BTreeMap<Option<LabelId>, i64>,
    relationship_counts: BTreeMap<Option<TypeId>, i64>,
    outcome: Option<ModifyOutcome>,
}

impl TransactionRecordState {
    /// Starts an empty transaction over `stores`. Ids are reserved from the
    /// stores as records are created.
    pub fn new(stores: Stores) -> Self {
        let changes = RecordChangeSet::new(&stores);
        Self {
            stores,
            changes,
            modifications: RelationshipModifications::new(),
            degrees: DegreeDeltas::new(),
            pending_rel_props: BTreeMap::new(),
            deferred_node_deletions: BTreeSet::new(),
            node_counts: BTreeMap::new(),
            relationship_counts: BTreeMap::new(),
            outcome: None,
        }
    }

    /// True when nothing has been staged.
    pub fn is_empty(&self) -> bool {
        self.changes.change_size() == 0
            && self.modifications.is_empty()
            && self.pending_rel_props.is_empty()
            && self.deferred_node_deletions.is_empty()
    }

    /// Queued relationship changes.
    pub fn modifications(&self) -> &RelationshipModifications {
        &self.modifications
    }

    /// Result of the relationship modifier, once commands were extracted.
    pub fn outcome(&self) -> Option<&ModifyOutcome> {
        self.outcome.as_ref()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.outcome.is_some() {
            return Err(SombraError::Invalid("transaction already prepared"));
        }
        Ok(())
    }

    // ---- nodes ----

    /// Creates an in-use node with no labels, properties or relationships.
    pub fn node_create(&mut self) -> Result<NodeId> {
        self.ensure_open()?;
        let id = NodeId(self.stores.nodes.next_id());
        let mut proxy = self.changes.nodes.create(id, ())?;
        proxy.for_changing_data().in_use = true;
        bump(&mut self.node_counts, None, 1);
        trace!(node = id.0, "tx.node.create");
        Ok(id)
    }

    /// Deletes `node`. The node must have no relationships once the queued
    /// relationship changes are applied; its empty groups, property chain
    /// and label records go with it.
    pub fn node_delete(&mut self, node: NodeId) -> Result<()> {
        self.ensure_open()?;
        self.live_node(node)?;
        if self.modifications.touches(node) {
            if self.modifications.creations.iter().any(|c| c.first == node || c.second == node) {
                return Err(node_has_relationships(node));
            }
            self.deferred_node_deletions.insert(node);
            return Ok(());
        }
        delete_node_now(&mut self.changes, node, &mut self.node_counts)
    }

    /// Adds `label`; returns false when the node already carried it.
    pub fn node_add_label(&mut self, node: NodeId, label: LabelId) -> Result<bool> {
        self.ensure_open()?;
        self.live_node(node)?;
        let stores = &self.stores;
        let mut proxy = self.changes.nodes.get_or_load(node, ())?;
        let record = proxy.for_changing_data();
        let Err(idx) = record.labels.binary_search(&label) else {
            return Ok(false);
        };
        record.labels.insert(idx, label);
        sync_dynamic_labels(record, || DynId(stores.node_labels.next_id()));
        bump(&mut self.node_counts, Some(label), 1);
        Ok(true)
    }

    /// Removes `label`; returns false when the node did not carry it.
    pub fn node_remove_label(&mut self, node: NodeId, label: LabelId) -> Result<bool> {
        self.ensure_open()?;
        self.live_node(node)?;
        let stores = &self.stores;
        let mut proxy = self.changes.nodes.get_or_load(node, ())?;
        let record = proxy.for_changing_data();
        let Ok(idx) = record.labels.binary_search(&label) else {
            return Ok(false);
        };
        record.labels.remove(idx);
        sync_dynamic_labels(record, || DynId(stores.node_labels.next_id()));
        bump(&mut self.node_counts, Some(label), -1);
        Ok(true)
    }

    /// Sets `key` on `node`, replacing any previous value.
    pub fn node_set_property(&mut self, node: NodeId, key: PropKeyId, value: &[u8]) -> Result<()> {
        self.ensure_open()?;
        check_value_len(value.len(), "property value")?;
        self.live_node(node)?;
        set_property(&mut self.changes, &self.stores, PropertyOwner::Node(node), key, value)
    }

    /// Removes `key` from `node`; returns false when it was not set.
    pub fn node_remove_property(&mut self, node: NodeId, key: PropKeyId) -> Result<bool> {
        self.ensure_open()?;
        self.live_node(node)?;
        remove_property(&mut self.changes, PropertyOwner::Node(node), key)
    }

    fn live_node(&mut self, node: NodeId) -> Result<()> {
        let deferred = self.deferred_node_deletions.contains(&node);
        if deferred || !self.changes.nodes.get_or_load(node, ())?.for_reading_data().in_use {
            return Err(SombraError::MissingRecord {
                kind: RecordKind::Node,
                id: node.0,
            });
        }
        Ok(())
    }

    // ---- relationships ----

    /// Queues a relationship of type `ty` from `first` to `second`. Both
    /// nodes must be in use; the chains are linked at extraction.
    pub fn relationship_create(
        &mut self,
        ty: TypeId,
        first: NodeId,
        second: NodeId,
    ) -> Result<RelId> {
        self.ensure_open()?;
        self.live_node(first)?;
        self.live_node(second)?;
        let id = RelId(self.stores.relationships.next_id());
        self.modifications.create(id, ty, first, second);
        self.count_relationship(ty, 1);
        trace!(rel = id.0, ty = ty.0, first = first.0, second = second.0, "tx.relationship.create");
        Ok(id)
    }

    /// Queues deletion of `id`. A relationship created by this same
    /// transaction is simply dropped from the queue.
    pub fn relationship_delete(&mut self, id: RelId) -> Result<()> {
        self.ensure_open()?;
        if let Some(creation) = self.modifications.creations.iter().find(|c| c.id == id).copied() {
            self.modifications.cancel_creation(id);
            self.pending_rel_props.remove(&id);
            self.count_relationship(creation.ty, -1);
            return Ok(());
        }
        if self.modifications.deletions.iter().any(|d| d.id == id) {
            return Err(SombraError::MissingRecord {
                kind: RecordKind::Relationship,
                id: id.0,
            });
        }
        let rel = self.changes.relationships.read_unstaged(id, &())?;
        if !rel.in_use {
            return Err(SombraError::MissingRecord {
                kind: RecordKind::Relationship,
                id: id.0,
            });
        }
        self.modifications
            .delete(id, rel.ty, rel.first_node, rel.second_node);
        self.count_relationship(rel.ty, -1);
        Ok(())
    }

    /// Sets `key` on relationship `id`. On a relationship created by this
    /// transaction the change is held until the record exists.
    pub fn relationship_set_property(
        &mut self,
        id: RelId,
        key: PropKeyId,
        value: &[u8],
    ) -> Result<()> {
        self.ensure_open()?;
        check_value_len(value.len(), "property value")?;
        if self.modifications.is_pending_creation(id) {
            self.pending_rel_props
                .entry(id)
                .or_default()
                .push(PendingProperty::Set(key, value.to_vec()));
            return Ok(());
        }
        self.live_relationship(id)?;
        set_property(
            &mut self.changes,
            &self.stores,
            PropertyOwner::Relationship(id),
            key,
            value,
        )
    }

    /// Removes `key` from relationship `id`; returns false when it was not set.
    pub fn relationship_remove_property(&mut self, id: RelId, key: PropKeyId) -> Result<bool> {
        self.ensure_open()?;
        if self.modifications.is_pending_creation(id) {
            let pending = self.pending_rel_props.entry(id).or_default();
            let was_set = pending
                .iter()
                .any(|op| matches!(op, PendingProperty::Set(k, _) if *k == key));
            pending.push(PendingProperty::Remove(key));
            return Ok(was_set);
        }
        self.live_relationship(id)?;
        remove_property(&mut self.changes, PropertyOwner::Relationship(id), key)
    }

    fn live_relationship(&mut self, id: RelId) -> Result<()> {
        if self.modifications.deletions.iter().any(|d| d.id == id) {
            return Err(SombraError::MissingRecord {
                kind: RecordKind::Relationship,
                id: id.0,
            });
        }
        if !self.changes.relationships.get_or_load(id, ())?.for_reading_data().in_use {
            return Err(SombraError::MissingRecord {
                kind: RecordKind::Relationship,
                id: id.0,
            });
        }
        Ok(())
    }

    fn count_relationship(&mut self, ty: TypeId, delta: i64) {
        bump(&mut self.relationship_counts, Some(ty), delta);
        bump(&mut self.relationship_counts, None, delta);
    }

    // ---- tokens, schema, metadata ----

    /// Creates a token named `name` and returns its id.
    pub fn token_create(&mut self, kind: TokenKind, name: &str, internal: bool) -> Result<TokenId> {
        self.ensure_open()?;
        check_value_len(name.len(), "token name")?;
        let raw = self.stores.tokens(kind).next_id();
        let id = TokenId(u32::try_from(raw).map_err(|_| {
            SombraError::InvalidOwned(format!("{kind} token id space exhausted at {raw}"))
        })?);
        let names = &self.stores.token_names;
        let name_records = split_into_dynamic_records(name.as_bytes(), TOKEN_NAME_BLOCK_SIZE, || {
            DynId(names.next_id())
        });
        let mut proxy = self.changes.tokens_mut(kind).create(id, ())?;
        let record = proxy.for_changing_data();
        record.in_use = true;
        record.internal = internal;
        record.name_id = name_records.first().map(|r| r.id);
        record.name_records = name_records;
        debug!(kind = %kind, token = id.0, name, "tx.token.create");
        Ok(id)
    }

    /// Stores an opaque schema rule and returns its id.
    pub fn schema_rule_create(&mut self, rule: Vec<u8>, constraint: bool) -> Result<SchemaId> {
        self.ensure_open()?;
        check_value_len(rule.len(), "schema rule")?;
        let id = SchemaId(self.stores.schema.next_id());
        let mut proxy = self.changes.schema.create(id, ())?;
        let record = proxy.for_changing_data();
        record.in_use = true;
        record.constraint = constraint;
        record.rule = rule;
        Ok(id)
    }

    /// Marks schema rule `id` unused.
    pub fn schema_rule_drop(&mut self, id: SchemaId) -> Result<()> {
        self.ensure_open()?;
        let mut proxy = self.changes.schema.get_or_load(id, ())?;
        let record = proxy.for_changing_data();
        record.in_use = false;
        record.next_prop = None;
        Ok(())
    }

    /// Sets metadata slot `id`, creating it if needed.
    pub fn metadata_set(&mut self, id: MetaId, value: u64) -> Result<()> {
        self.ensure_open()?;
        let mut proxy = self.changes.meta.get_or_load_with(id, (), RecordLoad::Always)?;
        let record = proxy.for_changing_data();
        record.in_use = true;
        record.value = value;
        Ok(())
    }

    // ---- extraction ----

    /// Runs the queued relationship changes under `locker`, then returns the
    /// transaction's commands: tokens, metadata, schema, in-use nodes,
    /// relationships, groups, properties, deleted nodes and finally counters.
    pub fn extract_commands(
        &mut self,
        modifier: &RelationshipModifier,
        locker: &dyn ResourceLocker,
    ) -> Result<Vec<Command>> {
        if self.outcome.is_none() {
            self.prepare(modifier, locker)?;
        }
        let mut commands = Vec::with_capacity(self.changes.change_size() + 8);
        for kind in [
            TokenKind::Label,
            TokenKind::RelationshipType,
            TokenKind::PropertyKey,
        ] {
            commands.extend(
                extract(self.changes.tokens_mut(kind)).map(|c| Command::token(kind, c)),
            );
        }
        commands.extend(extract(&self.changes.meta).map(Command::MetaData));
        commands.extend(extract(&self.changes.schema).map(Command::Schema));
        let (live, deleted): (Vec<_>, Vec<_>) =
            extract(&self.changes.nodes).partition(|c| c.after.in_use);
        commands.extend(live.into_iter().map(Command::Node));
        commands.extend(extract(&self.changes.relationships).map(Command::Relationship));
        commands.extend(extract(&self.changes.groups).map(Command::RelationshipGroup));
        commands.extend(extract(&self.changes.properties).map(Command::Property));
        commands.extend(deleted.into_iter().map(Command::Node));

        for (label, delta) in &self.node_counts {
            if *delta != 0 {
                commands.push(Command::NodeCount {
                    label: *label,
                    delta: *delta,
                });
            }
        }
        for (ty, delta) in &self.relationship_counts {
            if *delta != 0 {
                commands.push(Command::RelationshipCount {
                    start_label: None,
                    ty: *ty,
                    end_label: None,
                    delta: *delta,
                });
            }
        }
        for (group, direction, delta) in self.degrees.iter() {
            commands.push(Command::GroupDegree {
                group,
                direction,
                delta,
            });
        }
        Ok(commands)
    }

    fn prepare(&mut self, modifier: &RelationshipModifier, locker: &dyn ResourceLocker) -> Result<()> {
        let group_ids = StoreIds(self.stores.groups.as_ref());
        let mut access = ChainAccess::new(&mut self.changes, &group_ids, &mut self.degrees);
        let outcome = modifier.modify_relationships(&self.modifications, &mut access, locker)?;

        for (rel, ops) in std::mem::take(&mut self.pending_rel_props) {
            let owner = PropertyOwner::Relationship(rel);
            for op in ops {
                match op {
                    PendingProperty::Set(key, value) => {
                        set_property(&mut self.changes, &self.stores, owner, key, &value)?
                    }
                    PendingProperty::Remove(key) => {
                        remove_property(&mut self.changes, owner, key)?;
                    }
                }
            }
        }
        for node in std::mem::take(&mut self.deferred_node_deletions) {
            delete_node_now(&mut self.changes, node, &mut self.node_counts)?;
        }
        self.outcome = Some(outcome);
        Ok(())
    }
}

fn bump<K: Ord>(counts: &mut BTreeMap<K, i64>, key: K, delta: i64) {
    *counts.entry(key).or_insert(0) += delta;
}

fn extract<R: Record, A>(changes: &RecordChanges<R, A>) -> impl Iterator<Item = RecordCommand<R>> + '_ {
    changes
        .changes()
        .map(|change| RecordCommand::new(change.before_image(), change.after.clone()))
}

fn node_has_relationships(node: NodeId) -> SombraError {
    SombraError::InvalidOwned(format!("node {node} still has relationships"))
}

fn delete_node_now(
    changes: &mut RecordChangeSet,
    node: NodeId,
    node_counts: &mut BTreeMap<Option<LabelId>, i64>,
) -> Result<()> {
    let record = changes.nodes.get_or_load(node, ())?.for_reading_data().clone();
    match record.chain {
        NodeChain::Sparse(Some(_)) => return Err(node_has_relationships(node)),
        NodeChain::Sparse(None) | NodeChain::Dense(None) => {}
        NodeChain::Dense(Some(first)) => {
            let mut groups = Vec::new();
            let mut cursor = Some(first);
            while let Some(id) = cursor {
                let group = changes.groups.get_or_load(id, ())?.for_reading_data().clone();
                if !group.is_empty() {
                    return Err(node_has_relationships(node));
                }
                groups.push(id);
                cursor = group.next;
            }
            for id in groups {
                changes.groups.get_or_load(id, ())?.for_changing_data().in_use = false;
            }
        }
    }
    PropertyChainDeleter.delete_property_chain(
        record.next_prop,
        PropertyOwner::Node(node),
        &mut changes.properties,
    )?;

    let mut proxy = changes.nodes.get_or_load(node, ())?;
    let after = proxy.for_changing_data();
    after.in_use = false;
    after.chain = NodeChain::Sparse(None);
    after.next_prop = None;
    for label in after.labels.drain(..) {
        bump(node_counts, Some(label), -1);
    }
    for dynamic in &mut after.dynamic_labels {
        dynamic.in_use = false;
    }
    bump(node_counts, None, -1);
    trace!(node = node.0, "tx.node.delete");
    Ok(())
}

/// Re-encodes a node's labels into dynamic records once they no longer fit
/// inline. Existing record ids are reused first; leftovers become unused.
fn sync_dynamic_labels(node: &mut NodeRecord, mut allocate: impl FnMut() -> DynId) {
    let mut reusable: VecDeque<DynId> = node
        .dynamic_labels
        .iter()
        .filter(|r| r.in_use)
        .map(|r| r.id)
        .collect();
    let retired: Vec<DynamicRecord> = node
        .dynamic_labels
        .iter()
        .filter(|r| !r.in_use)
        .cloned()
        .collect();
    let created: BTreeMap<DynId, bool> = node
        .dynamic_labels
        .iter()
        .filter(|r| r.in_use)
        .map(|r| (r.id, r.created))
        .collect();

    let mut records = Vec::new();
    if node.labels.len() > INLINE_LABEL_CAPACITY {
        let mut bytes = Vec::with_capacity(node.labels.len() * 4);
        for label in &node.labels {
            bytes.extend_from_slice(&label.0.to_be_bytes());
        }
        records = split_into_dynamic_records(&bytes, LABEL_BLOCK_SIZE, || {
            reusable.pop_front().unwrap_or_else(&mut allocate)
        });
        for record in &mut records {
            record.created = created.get(&record.id).copied().unwrap_or(true);
        }
    }
    records.extend(reusable.into_iter().map(DynamicRecord::unused));
    records.extend(retired);
    node.dynamic_labels = records;
}

fn value_block(stores: &Stores, key: PropKeyId, value: &[u8]) -> PropertyBlock {
    if value.len() <= MAX_INLINE_VALUE_LEN {
        return PropertyBlock {
            key,
            inline: value.to_vec(),
            value_records: Vec::new(),
        };
    }
    let values = &stores.property_values;
    PropertyBlock {
        key,
        inline: Vec::new(),
        value_records: split_into_dynamic_records(value, PROPERTY_VALUE_BLOCK_SIZE, || {
            DynId(values.next_id())
        }),
    }
}

fn owner_head(changes: &mut RecordChangeSet, owner: PropertyOwner) -> Result<Option<PropId>> {
    Ok(match owner {
        PropertyOwner::Node(id) => changes.nodes.get_or_load(id, ())?.for_reading_data().next_prop,
        PropertyOwner::Relationship(id) => {
            changes
                .relationships
                .get_or_load(id, ())?
                .for_reading_data()
                .next_prop
        }
    })
}

fn set_owner_head(
    changes: &mut RecordChangeSet,
    owner: PropertyOwner,
    head: Option<PropId>,
) -> Result<()> {
    match owner {
        PropertyOwner::Node(id) => {
            changes.nodes.get_or_load(id, ())?.for_changing_data().next_prop = head;
        }
        PropertyOwner::Relationship(id) => {
            changes
                .relationships
                .get_or_load(id, ())?
                .for_changing_data()
                .next_prop = head;
        }
    }
    Ok(())
}

/// Sets `key` on `owner`: replaces an existing block, else fills the first
/// record with room, else prepends a new record to the chain.
fn set_property(
    changes: &mut RecordChangeSet,
    stores: &Stores,
    owner: PropertyOwner,
    key: PropKeyId,
    value: &[u8],
) -> Result<()> {
    let mut block = Some(value_block(stores, key, value));
    let head = owner_head(changes, owner)?;
    let mut with_room = None;
    let mut cursor = head;
    while let Some(id) = cursor {
        let mut proxy = changes.properties.get_or_load(id, owner)?;
        let record = proxy.for_changing_data();
        if record.block(key).is_some() {
            record.remove_block(key);
            record.blocks.extend(block.take());
            return Ok(());
        }
        if with_room.is_none() && record.has_free_block() {
            with_room = Some(id);
        }
        cursor = record.next_prop;
    }
    if let Some(id) = with_room {
        let mut proxy = changes.properties.get_or_load(id, owner)?;
        proxy.for_changing_data().blocks.extend(block.take());
        return Ok(());
    }

    let id = PropId(stores.properties.next_id());
    {
        let mut proxy = changes.properties.create(id, owner)?;
        let record = proxy.for_changing_data();
        record.in_use = true;
        record.next_prop = head;
        record.blocks.extend(block.take());
    }
    if let Some(old_head) = head {
        changes
            .properties
            .get_or_load(old_head, owner)?
            .for_changing_data()
            .prev_prop = Some(id);
    }
    set_owner_head(changes, owner, Some(id))
}

/// Removes `key` from `owner`. A record left without blocks is unlinked from
/// the chain and marked unused.
fn remove_property(
    changes: &mut RecordChangeSet,
    owner: PropertyOwner,
    key: PropKeyId,
) -> Result<bool> {
    let mut cursor = owner_head(changes, owner)?;
    while let Some(id) = cursor {
        let mut proxy = changes.properties.get_or_load(id, owner)?;
        let record = proxy.for_changing_data();
        if record.remove_block(key).is_none() {
            cursor = record.next_prop;
            continue;
        }
        if !record.blocks.is_empty() {
            return Ok(true);
        }
        let (prev, next) = (record.prev_prop, record.next_prop);
        record.in_use = false;
        record.prev_prop = None;
        record.next_prop = None;
        match prev {
            Some(prev) => {
                changes
                    .properties
                    .get_or_load(prev, owner)?
                    .for_changing_data()
                    .next_prop = next
            }
            None => set_owner_head(changes, owner, next)?,
        }
        if let Some(next) = next {
            changes
                .properties
                .get_or_load(next, owner)?
                .for_changing_data()
                .prev_prop = prev;
        }
        return Ok(true);
    }
    Ok(false)
}
