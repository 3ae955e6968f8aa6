use tracing::trace;

use crate::storage::record::{NodeChain, RelationshipGroupRecord};
use crate::storage::staging::{RecordChangeSet, RecordChanges};
use crate::storage::store::IdSequence;
use crate::types::{GroupId, NodeId, Result, SombraError, TypeId};

/// Result of looking up a type in a node's group chain.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct GroupPosition {
    /// The group for the type, when present.
    pub group: Option<GroupId>,
    /// Last group with a lower type, where a missing group would be linked in.
    pub closest_previous: Option<GroupId>,
}

/// Walks the group chain starting at `first_group` looking for `ty`.
///
/// The chain is sorted by type, so the walk stops at the first group with a
/// higher type.
pub fn find_group(
    node: NodeId,
    first_group: Option<GroupId>,
    ty: TypeId,
    groups: &mut RecordChanges<RelationshipGroupRecord>,
) -> Result<GroupPosition> {
    let mut previous = None;
    let mut cursor = first_group;
    while let Some(id) = cursor {
        let proxy = groups.get_or_load(id, ())?;
        let group = proxy.for_reading_linkage();
        if group.owning_node != node {
            return Err(SombraError::integrity(
                "group-owner",
                format!(
                    "group {id} in the chain of node {node} is owned by node {}",
                    group.owning_node
                ),
            ));
        }
        if group.ty == ty {
            return Ok(GroupPosition {
                group: Some(id),
                closest_previous: previous,
            });
        }
        if group.ty > ty {
            break;
        }
        previous = Some(id);
        cursor = group.next;
    }
    Ok(GroupPosition {
        group: None,
        closest_previous: previous,
    })
}

/// Group for `ty` on `node`, creating and linking one in sorted position when
/// missing. The node must be dense.
pub fn get_or_create_group(
    node: NodeId,
    ty: TypeId,
    changes: &mut RecordChangeSet,
    ids: &dyn IdSequence,
) -> Result<GroupId> {
    let first_group = match changes.nodes.get_or_load(node, ())?.for_reading_linkage().chain {
        NodeChain::Dense(first) => first,
        NodeChain::Sparse(_) => {
            return Err(SombraError::InvalidOwned(format!(
                "node {node} has no group chain"
            )))
        }
    };
    let position = find_group(node, first_group, ty, &mut changes.groups)?;
    if let Some(group) = position.group {
        return Ok(group);
    }

    let id = GroupId(ids.next_id());
    let next = match position.closest_previous {
        Some(previous) => {
            let mut proxy = changes.groups.get_or_load(previous, ())?;
            let previous = proxy.for_changing_data();
            let next = previous.next;
            previous.next = Some(id);
            next
        }
        None => {
            let mut proxy = changes.nodes.get_or_load(node, ())?;
            proxy.for_changing_data().chain = NodeChain::Dense(Some(id));
            first_group
        }
    };
    if let Some(next) = next {
        changes.groups.get_or_load(next, ())?.for_changing_data().prev = Some(id);
    }

    let mut proxy = changes.groups.create(id, ())?;
    let group = proxy.for_changing_data();
    group.in_use = true;
    group.ty = ty;
    group.owning_node = node;
    group.prev = position.closest_previous;
    group.next = next;
    trace!(node = node.0, ty = ty.0, group = id.0, "chain.group.create");
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::chain::test_support::{stores_with_nodes, Counter};
    use crate::storage::staging::StoreLoader;
    use crate::storage::store::{RecordLoad, RecordStore};
    use crate::storage::staging::Loader;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn dense_node_with_types(types: &[u32]) -> Result<(RecordChangeSet, Counter)> {
        let stores = stores_with_nodes(1)?;
        let mut changes = RecordChangeSet::new(&stores);
        changes.nodes.get_or_load(NodeId(0), ())?.for_changing_data().chain =
            NodeChain::Dense(None);
        let ids = Counter::starting_at(100);
        for ty in types {
            get_or_create_group(NodeId(0), TypeId(*ty), &mut changes, &ids)?;
        }
        Ok((changes, ids))
    }

    fn chain_types(changes: &mut RecordChangeSet) -> Result<Vec<u32>> {
        let mut out = Vec::new();
        let mut cursor = changes.nodes.get_or_load(NodeId(0), ())?.for_reading_data().first_group();
        let mut previous = None;
        while let Some(id) = cursor {
            let group = changes.groups.get_or_load(id, ())?.for_reading_data().clone();
            assert_eq!(group.prev, previous);
            out.push(group.ty.0);
            previous = Some(id);
            cursor = group.next;
        }
        Ok(out)
    }

    #[test]
    fn groups_are_kept_sorted_by_type() -> Result<()> {
        let (mut changes, _) = dense_node_with_types(&[5, 2, 9, 3])?;
        assert_eq!(chain_types(&mut changes)?, vec![2, 3, 5, 9]);
        Ok(())
    }

    #[test]
    fn existing_group_is_reused() -> Result<()> {
        let (mut changes, ids) = dense_node_with_types(&[1, 4])?;
        let again = get_or_create_group(NodeId(0), TypeId(4), &mut changes, &ids)?;
        assert_eq!(again, GroupId(101));
        assert_eq!(chain_types(&mut changes)?, vec![1, 4]);
        Ok(())
    }

    #[test]
    fn missing_type_reports_closest_previous() -> Result<()> {
        let (mut changes, _) = dense_node_with_types(&[1, 4, 8])?;
        let first = changes.nodes.get_or_load(NodeId(0), ())?.for_reading_data().first_group();
        let position = find_group(NodeId(0), first, TypeId(6), &mut changes.groups)?;
        assert_eq!(position.group, None);
        let previous = position.closest_previous.expect("group below 6");
        let previous_ty = changes.groups.peek(previous).map(|g| g.ty);
        assert_eq!(previous_ty, Some(TypeId(4)));

        let below_all = find_group(NodeId(0), first, TypeId(0), &mut changes.groups)?;
        assert_eq!(below_all.closest_previous, None);
        Ok(())
    }

    struct CountingGroups {
        inner: StoreLoader<RelationshipGroupRecord>,
        loads: Arc<AtomicUsize>,
    }

    impl Loader<RelationshipGroupRecord, ()> for CountingGroups {
        fn new_record(&self, id: GroupId, extra: &()) -> RelationshipGroupRecord {
            self.inner.new_record(id, extra)
        }

        fn load(&self, id: GroupId, extra: &(), mode: RecordLoad) -> Result<RelationshipGroupRecord> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            self.inner.load(id, extra, mode)
        }
    }

    #[test]
    fn lookup_stops_at_first_higher_type() -> Result<()> {
        let stores = stores_with_nodes(1)?;
        for (id, ty) in [(0u64, 1u32), (1, 3), (2, 7), (3, 9)] {
            let mut group = RelationshipGroupRecord::unused(GroupId(id));
            group.in_use = true;
            group.ty = TypeId(ty);
            group.owning_node = NodeId(0);
            group.prev = id.checked_sub(1).map(GroupId);
            group.next = (id < 3).then(|| GroupId(id + 1));
            stores.groups.update_record(&group)?;
        }
        let loads = Arc::new(AtomicUsize::new(0));
        let mut groups = RecordChanges::new(CountingGroups {
            inner: StoreLoader::new(stores.groups.clone()),
            loads: loads.clone(),
        });
        let position = find_group(NodeId(0), Some(GroupId(0)), TypeId(4), &mut groups)?;
        assert_eq!(position.group, None);
        assert_eq!(position.closest_previous, Some(GroupId(1)));
        assert_eq!(loads.load(Ordering::SeqCst), 3);
        Ok(())
    }
}
