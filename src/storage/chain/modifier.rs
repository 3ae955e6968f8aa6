use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use crate::primitives::concurrency::{ResourceLocker, ResourceType};
use crate::storage::record::{Direction, NodeChain};
use crate::types::{NodeId, RelId, Result, TypeId};

use super::{
    lock_relationships_in_order, ChainAccess, RelationshipCreator, RelationshipDeleter,
    SortedLockList,
};

/// A queued relationship creation.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct RelCreation {
    /// Id reserved for the new relationship.
    pub id: RelId,
    /// Relationship type.
    pub ty: TypeId,
    /// Start node.
    pub first: NodeId,
    /// End node.
    pub second: NodeId,
}

/// A queued relationship deletion, with the endpoints read when queued.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct RelDeletion {
    /// Relationship to delete.
    pub id: RelId,
    /// Its type.
    pub ty: TypeId,
    /// Its start node.
    pub first: NodeId,
    /// Its end node.
    pub second: NodeId,
}

/// Relationship changes of one transaction, applied together.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RelationshipModifications {
    /// Creations in queue order.
    pub creations: Vec<RelCreation>,
    /// Deletions in queue order.
    pub deletions: Vec<RelDeletion>,
}

impl RelationshipModifications {
    /// Creates an empty set of changes.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues creation of relationship `id`.
    pub fn create(&mut self, id: RelId, ty: TypeId, first: NodeId, second: NodeId) {
        self.creations.push(RelCreation {
            id,
            ty,
            first,
            second,
        });
    }

    /// Queues deletion of relationship `id`.
    pub fn delete(&mut self, id: RelId, ty: TypeId, first: NodeId, second: NodeId) {
        self.deletions.push(RelDeletion {
            id,
            ty,
            first,
            second,
        });
    }

    /// True when nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.creations.is_empty() && self.deletions.is_empty()
    }

    /// True when a creation of `id` is queued.
    pub fn is_pending_creation(&self, id: RelId) -> bool {
        self.creations.iter().any(|c| c.id == id)
    }

    /// Drops a queued creation of `id`. Returns whether one was queued.
    pub fn cancel_creation(&mut self, id: RelId) -> bool {
        let before = self.creations.len();
        self.creations.retain(|c| c.id != id);
        before != self.creations.len()
    }

    /// True when a queued creation or deletion touches `node`.
    pub fn touches(&self, node: NodeId) -> bool {
        self.creations
            .iter()
            .any(|c| c.first == node || c.second == node)
            || self
                .deletions
                .iter()
                .any(|d| d.first == node || d.second == node)
    }

    /// Every endpoint, ascending.
    pub fn involved_nodes(&self) -> BTreeSet<NodeId> {
        let creations = self.creations.iter().flat_map(|c| [c.first, c.second]);
        let deletions = self.deletions.iter().flat_map(|d| [d.first, d.second]);
        creations.chain(deletions).collect()
    }

    /// Drops every queued change.
    pub fn clear(&mut self) {
        self.creations.clear();
        self.deletions.clear();
    }
}

/// Summary of a [`RelationshipModifier::modify_relationships`] run.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ModifyOutcome {
    /// Relationships created.
    pub created: usize,
    /// Relationships deleted.
    pub deleted: usize,
    /// Nodes promoted from sparse to dense.
    pub promoted: Vec<NodeId>,
    /// Relationship locks held when mutation started.
    pub locked_relationships: Vec<u64>,
}

/// Locks and applies a transaction's relationship changes.
pub struct RelationshipModifier {
    creator: RelationshipCreator,
    deleter: RelationshipDeleter,
}

impl RelationshipModifier {
    /// Modifier running creations through `creator` and deletions through `deleter`.
    pub fn new(creator: RelationshipCreator, deleter: RelationshipDeleter) -> Self {
        Self { creator, deleter }
    }

    /// Takes node, group and relationship locks in that order, then runs the
    /// creations followed by the deletions.
    pub fn modify_relationships(
        &self,
        modifications: &RelationshipModifications,
        access: &mut ChainAccess<'_>,
        locker: &dyn ResourceLocker,
    ) -> Result<ModifyOutcome> {
        if modifications.is_empty() {
            return Ok(ModifyOutcome::default());
        }
        let nodes: Vec<u64> = modifications.involved_nodes().iter().map(|n| n.0).collect();
        locker.acquire_exclusive(ResourceType::Node, &nodes)?;
        locker.acquire_exclusive(ResourceType::RelationshipGroup, &nodes)?;

        let wanted = self.relationships_to_lock(modifications, access)?;
        let deletions: Vec<RelId> = modifications.deletions.iter().map(|d| d.id).collect();
        let relationships = &access.changes.relationships;
        let held = lock_relationships_in_order(locker, &wanted, &deletions, |id| {
            relationships.read_unstaged(id, &())
        })?;
        debug!(
            nodes = nodes.len(),
            relationships = held.len(),
            creations = modifications.creations.len(),
            deletions = deletions.len(),
            "chain.modify.locked"
        );

        let mut outcome = ModifyOutcome {
            locked_relationships: held.as_slice().to_vec(),
            ..ModifyOutcome::default()
        };
        for creation in &modifications.creations {
            let promoted = self.creator.relationship_create(
                access,
                creation.id,
                creation.ty,
                creation.first,
                creation.second,
            )?;
            outcome.promoted.extend(promoted);
            outcome.created += 1;
        }
        for deletion in &modifications.deletions {
            self.deleter.relationship_delete(access, deletion.id)?;
            outcome.deleted += 1;
        }
        Ok(outcome)
    }

    /// Relationship ids whose records the change will rewrite: chain heads
    /// holding affected degrees, and whole chains of nodes that may be
    /// promoted. Deletions and their neighbours are added while locking.
    fn relationships_to_lock(
        &self,
        modifications: &RelationshipModifications,
        access: &mut ChainAccess<'_>,
    ) -> Result<SortedLockList> {
        let mut pending: BTreeMap<NodeId, u64> = BTreeMap::new();
        let mut touched: BTreeMap<NodeId, BTreeSet<(TypeId, Direction)>> = BTreeMap::new();
        let mut touch = |node: NodeId, ty: TypeId, first: NodeId, second: NodeId| {
            let direction = if first == second {
                Direction::Loop
            } else if node == first {
                Direction::Outgoing
            } else {
                Direction::Incoming
            };
            touched.entry(node).or_default().insert((ty, direction));
        };
        for c in &modifications.creations {
            *pending.entry(c.first).or_insert(0) += 1;
            touch(c.first, c.ty, c.first, c.second);
            if c.second != c.first {
                *pending.entry(c.second).or_insert(0) += 1;
                touch(c.second, c.ty, c.first, c.second);
            }
        }
        for d in &modifications.deletions {
            touch(d.first, d.ty, d.first, d.second);
            touch(d.second, d.ty, d.first, d.second);
        }

        let mut wanted = SortedLockList::new();
        for (node_id, types) in &touched {
            let node = access.changes.nodes.read_unstaged(*node_id, &())?;
            if !node.in_use {
                continue;
            }
            match node.chain {
                NodeChain::Sparse(None) => {}
                NodeChain::Sparse(Some(head)) => {
                    wanted.insert_unique(head.0);
                    let head_record = access.changes.relationships.read_unstaged(head, &())?;
                    let degree = head_record
                        .end_for(*node_id)
                        .and_then(|end| head_record.prev(end).degree())
                        .unwrap_or(0);
                    let incoming = pending.get(node_id).copied().unwrap_or(0);
                    if incoming > 0 && degree + incoming >= self.creator.dense_threshold() {
                        let mut cursor = head_record.next_for(*node_id);
                        let mut remaining = degree;
                        while let Some(id) = cursor {
                            if remaining == 0 || !wanted.insert_unique(id.0) {
                                break;
                            }
                            remaining -= 1;
                            cursor = access
                                .changes
                                .relationships
                                .read_unstaged(id, &())?
                                .next_for(*node_id);
                        }
                    }
                }
                NodeChain::Dense(first) => {
                    let mut cursor = first;
                    while let Some(group_id) = cursor {
                        let group = access.changes.groups.read_unstaged(group_id, &())?;
                        for direction in Direction::ALL {
                            if types.contains(&(group.ty, direction)) {
                                if let Some(head) = group.head(direction) {
                                    wanted.insert_unique(head.0);
                                }
                            }
                        }
                        cursor = group.next;
                    }
                }
            }
        }
        Ok(wanted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::concurrency::{LockManager, LockMode, OrderVerifyingLocker};
    use crate::storage::chain::test_support::{stores_with_nodes, walk_sparse, Counter};
    use crate::storage::chain::DegreeDeltas;
    use crate::storage::staging::RecordChangeSet;
    use crate::storage::store::Stores;

    fn commit(stores: &Stores, changes: &RecordChangeSet) -> Result<()> {
        for change in changes.relationships.changes() {
            stores.relationships.update_record(change.after)?;
        }
        for change in changes.nodes.changes() {
            stores.nodes.update_record(change.after)?;
        }
        for change in changes.groups.changes() {
            stores.groups.update_record(change.after)?;
        }
        Ok(())
    }

    fn run(
        stores: &Stores,
        modifier: &RelationshipModifier,
        modifications: &RelationshipModifications,
        locker: &dyn ResourceLocker,
    ) -> Result<(ModifyOutcome, RecordChangeSet)> {
        let mut changes = RecordChangeSet::new(stores);
        let group_ids = Counter::starting_at(0);
        let mut degrees = DegreeDeltas::new();
        let mut access = ChainAccess::new(&mut changes, &group_ids, &mut degrees);
        let outcome = modifier.modify_relationships(modifications, &mut access, locker)?;
        Ok((outcome, changes))
    }

    fn modifier(threshold: u64) -> RelationshipModifier {
        RelationshipModifier::new(
            RelationshipCreator::new(threshold, 10),
            RelationshipDeleter::default(),
        )
    }

    #[test]
    fn creates_then_deletes_under_ordered_locks() -> Result<()> {
        let stores = stores_with_nodes(3)?;
        let modifier = modifier(50);
        let manager = LockManager::new();

        let mut first = RelationshipModifications::new();
        for id in 0..4 {
            first.create(RelId(id), TypeId(0), NodeId(0), NodeId(1 + id % 2));
        }
        let locker = OrderVerifyingLocker::new(manager.client());
        let (outcome, changes) = run(&stores, &modifier, &first, &locker)?;
        assert_eq!(outcome.created, 4);
        commit(&stores, &changes)?;
        drop(locker);

        let mut second = RelationshipModifications::new();
        second.delete(RelId(1), TypeId(0), NodeId(0), NodeId(2));
        second.create(RelId(4), TypeId(0), NodeId(2), NodeId(1));
        let locker = OrderVerifyingLocker::new(manager.client());
        let (outcome, mut changes) = run(&stores, &modifier, &second, &locker)?;
        assert_eq!(outcome.deleted, 1);
        assert_eq!(outcome.locked_relationships, vec![0, 1, 2, 3]);
        assert!(locker.is_locked(ResourceType::Node, 0, LockMode::Exclusive));
        assert!(locker.is_locked(ResourceType::RelationshipGroup, 2, LockMode::Exclusive));

        assert_eq!(
            walk_sparse(&mut changes, NodeId(0))?,
            vec![RelId(3), RelId(2), RelId(0)]
        );
        assert_eq!(walk_sparse(&mut changes, NodeId(2))?, vec![RelId(4), RelId(3)]);
        Ok(())
    }

    #[test]
    fn whole_chain_is_locked_before_promotion() -> Result<()> {
        let stores = stores_with_nodes(2)?;
        let modifier = modifier(3);
        let manager = LockManager::new();
        let mut first = RelationshipModifications::new();
        for id in 0..3 {
            first.create(RelId(id), TypeId(id as u32), NodeId(0), NodeId(1));
        }
        let locker = manager.client();
        let (_, changes) = run(&stores, &modifier, &first, &locker)?;
        commit(&stores, &changes)?;
        drop(locker);

        let mut second = RelationshipModifications::new();
        second.create(RelId(3), TypeId(1), NodeId(1), NodeId(0));
        let locker = OrderVerifyingLocker::new(manager.client());
        let (outcome, _) = run(&stores, &modifier, &second, &locker)?;
        assert_eq!(outcome.locked_relationships, vec![0, 1, 2]);
        assert_eq!(outcome.promoted, vec![NodeId(1), NodeId(0)]);
        Ok(())
    }

    #[test]
    fn involved_nodes_are_sorted_and_unique() {
        let mut modifications = RelationshipModifications::new();
        modifications.create(RelId(0), TypeId(0), NodeId(9), NodeId(2));
        modifications.delete(RelId(1), TypeId(0), NodeId(2), NodeId(5));
        let nodes: Vec<_> = modifications.involved_nodes().into_iter().collect();
        assert_eq!(nodes, vec![NodeId(2), NodeId(5), NodeId(9)]);
        assert!(modifications.touches(NodeId(5)));
        assert!(modifications.cancel_creation(RelId(0)));
        assert!(!modifications.is_pending_creation(RelId(0)));
    }
}
