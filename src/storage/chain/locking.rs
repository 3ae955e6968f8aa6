use tracing::debug;

use crate::primitives::concurrency::{ResourceLocker, ResourceType};
use crate::storage::record::{PrevLink, RelationshipRecord};
use crate::types::{RelId, Result};

/// Sorted id working set. Duplicates are kept.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SortedLockList {
    ids: Vec<u64>,
}

impl SortedLockList {
    /// Creates an empty list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty list with room for `capacity` ids.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            ids: Vec::with_capacity(capacity),
        }
    }

    /// Inserts `id` in sorted position, after any equal ids.
    pub fn insert(&mut self, id: u64) {
        let idx = self.ids.partition_point(|held| *held <= id);
        self.ids.insert(idx, id);
    }

    /// Inserts `id` unless already present. Returns whether it was added.
    pub fn insert_unique(&mut self, id: u64) -> bool {
        if self.contains(id) {
            return false;
        }
        self.insert(id);
        true
    }

    /// Removes one occurrence of `id`.
    pub fn remove(&mut self, id: u64) -> bool {
        match self.ids.binary_search(&id) {
            Ok(idx) => {
                self.ids.remove(idx);
                true
            }
            Err(_) => false,
        }
    }

    /// True when `id` is in the list.
    pub fn contains(&self, id: u64) -> bool {
        self.ids.binary_search(&id).is_ok()
    }

    /// Number of ids, duplicates included.
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// True when the list holds no ids.
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Highest id, if any.
    pub fn max(&self) -> Option<u64> {
        self.ids.last().copied()
    }

    /// Ids in ascending order.
    pub fn as_slice(&self) -> &[u64] {
        &self.ids
    }

    /// Ids strictly greater than `id`, ascending.
    pub fn above(&self, id: u64) -> &[u64] {
        let idx = self.ids.partition_point(|held| *held <= id);
        &self.ids[idx..]
    }

    /// Cursor positioned before the first id.
    pub fn cursor(&self) -> LockCursor<'_> {
        LockCursor {
            ids: &self.ids,
            position: 0,
        }
    }
}

/// Bidirectional cursor over a [`SortedLockList`].
#[derive(Clone, Debug)]
pub struct LockCursor<'a> {
    ids: &'a [u64],
    position: usize,
}

impl LockCursor<'_> {
    /// Returns the id under the cursor and steps forward.
    pub fn next(&mut self) -> Option<u64> {
        let id = self.ids.get(self.position).copied()?;
        self.position += 1;
        Some(id)
    }

    /// Steps back and returns the id now under the cursor.
    pub fn prev(&mut self) -> Option<u64> {
        self.position = self.position.checked_sub(1)?;
        self.ids.get(self.position).copied()
    }
}

fn neighbours(rel: &RelationshipRecord) -> impl Iterator<Item = u64> {
    let links = [rel.first_prev, rel.second_prev];
    let nexts = [rel.first_next, rel.second_next];
    links
        .into_iter()
        .filter_map(PrevLink::rel)
        .chain(nexts.into_iter().flatten())
        .map(|id| id.0)
}

/// Locks `wanted` plus the chain neighbours of every relationship in
/// `deletions`, in ascending id order.
///
/// Neighbours are first read without locks. Once everything is held the
/// deletions are read again; a neighbour that appeared in between is locked
/// forward when it sorts after every held id, otherwise the held ids above it
/// are released and taken again after it. Returns the ids held.
pub fn lock_relationships_in_order(
    locker: &dyn ResourceLocker,
    wanted: &SortedLockList,
    deletions: &[RelId],
    mut read: impl FnMut(RelId) -> Result<RelationshipRecord>,
) -> Result<SortedLockList> {
    let mut pending = SortedLockList::with_capacity(wanted.len() + deletions.len() * 5);
    let mut cursor = wanted.cursor();
    while let Some(id) = cursor.next() {
        pending.insert_unique(id);
    }
    for id in deletions {
        pending.insert_unique(id.0);
        let rel = read(*id)?;
        if rel.in_use {
            for neighbour in neighbours(&rel) {
                pending.insert_unique(neighbour);
            }
        }
    }

    let mut held = SortedLockList::with_capacity(pending.len());
    for id in pending.as_slice() {
        locker.acquire_exclusive(ResourceType::Relationship, std::slice::from_ref(id))?;
        held.insert(*id);
    }

    loop {
        let mut stable = true;
        for id in deletions {
            let rel = read(*id)?;
            if !rel.in_use {
                continue;
            }
            for neighbour in neighbours(&rel) {
                if held.contains(neighbour) {
                    continue;
                }
                stable = false;
                if held.max().map_or(true, |max| neighbour > max) {
                    locker.acquire_exclusive(ResourceType::Relationship, &[neighbour])?;
                    held.insert(neighbour);
                    continue;
                }
                let above = held.above(neighbour).to_vec();
                for id in above.iter().rev() {
                    locker.release_exclusive(ResourceType::Relationship, *id)?;
                    held.remove(*id);
                }
                locker.acquire_exclusive(ResourceType::Relationship, &[neighbour])?;
                held.insert(neighbour);
                for id in &above {
                    locker.acquire_exclusive(ResourceType::Relationship, std::slice::from_ref(id))?;
                    held.insert(*id);
                }
                debug!(neighbour, released = above.len(), "chain.lock.reorder");
            }
        }
        if stable {
            return Ok(held);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::concurrency::{LockManager, LockMode, OrderVerifyingLocker};
    use crate::types::{NodeId, SombraError, TypeId};
    use std::collections::BTreeMap;

    #[test]
    fn list_stays_sorted_with_duplicates() {
        let mut list = SortedLockList::new();
        for id in [5, 1, 9, 5, 3] {
            list.insert(id);
        }
        assert_eq!(list.as_slice(), &[1, 3, 5, 5, 9]);
        assert!(list.remove(5));
        assert_eq!(list.as_slice(), &[1, 3, 5, 9]);
        assert!(!list.remove(4));
        assert!(!list.insert_unique(9));
        assert_eq!(list.above(3), &[5, 9]);
        assert_eq!(list.max(), Some(9));
    }

    #[test]
    fn cursor_moves_both_ways() {
        let mut list = SortedLockList::new();
        for id in [2, 4, 6] {
            list.insert(id);
        }
        let mut cursor = list.cursor();
        assert_eq!(cursor.prev(), None);
        assert_eq!(cursor.next(), Some(2));
        assert_eq!(cursor.next(), Some(4));
        assert_eq!(cursor.prev(), Some(4));
        assert_eq!(cursor.prev(), Some(2));
        assert_eq!(cursor.next(), Some(2));
    }

    fn rel(id: u64, prev: Option<u64>, next: Option<u64>) -> RelationshipRecord {
        let mut rel = RelationshipRecord::unused(RelId(id));
        rel.initialize(NodeId(0), NodeId(1), TypeId(0));
        if let Some(prev) = prev {
            rel.first_prev = PrevLink::Rel(RelId(prev));
        }
        rel.first_next = next.map(RelId);
        rel
    }

    #[test]
    fn locks_deletions_and_neighbours_ascending() -> Result<()> {
        let manager = LockManager::new();
        let locker = OrderVerifyingLocker::new(manager.client());
        let mut wanted = SortedLockList::new();
        wanted.insert(1);
        let held = lock_relationships_in_order(&locker, &wanted, &[RelId(7)], |id| {
            Ok(if id.0 == 7 { rel(7, Some(3), Some(12)) } else { rel(id.0, None, None) })
        })?;
        assert_eq!(held.as_slice(), &[1, 3, 7, 12]);
        for id in [1, 3, 7, 12] {
            assert!(locker.is_locked(ResourceType::Relationship, id, LockMode::Exclusive));
        }
        Ok(())
    }

    #[test]
    fn neighbour_changed_after_read_is_reacquired_in_order() -> Result<()> {
        let manager = LockManager::new();
        let locker = OrderVerifyingLocker::new(manager.client());
        // The first read sees next=20; once locked the chain has changed and
        // the real neighbour is 4, below already held ids.
        let mut reads = BTreeMap::<u64, usize>::new();
        let held = lock_relationships_in_order(&locker, &SortedLockList::new(), &[RelId(9)], |id| {
            let count = reads.entry(id.0).or_insert(0);
            *count += 1;
            Ok(if *count == 1 { rel(9, None, Some(20)) } else { rel(9, Some(4), Some(20)) })
        })?;
        assert_eq!(held.as_slice(), &[4, 9, 20]);
        Ok(())
    }

    #[test]
    fn verifying_locker_rejects_descending_acquisition() -> Result<()> {
        let manager = LockManager::new();
        let locker = OrderVerifyingLocker::new(manager.client());
        locker.acquire_exclusive(ResourceType::Relationship, &[10])?;
        let err = locker
            .acquire_exclusive(ResourceType::Relationship, &[3])
            .err()
            .expect("descending");
        assert!(matches!(err, SombraError::LockOrder(_)));
        Ok(())
    }
}
