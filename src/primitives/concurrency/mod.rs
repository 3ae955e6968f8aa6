#![forbid(unsafe_code)]
//! Entity lock manager and the locker contract used by chain maintenance.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{trace, warn};

use crate::types::{Result, SombraError};

/// Lockable resource namespaces, ordered the way they must be acquired.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum ResourceType {
    /// Node records.
    Node,
    /// The group chain of a node, keyed by owning node id.
    RelationshipGroup,
    /// Relationship records.
    Relationship,
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceType::Node => f.write_str("NODE"),
            ResourceType::RelationshipGroup => f.write_str("RELATIONSHIP_GROUP"),
            ResourceType::Relationship => f.write_str("RELATIONSHIP"),
        }
    }
}

/// Lock strength.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LockMode {
    /// Compatible with other shared holders.
    Shared,
    /// Excludes every other holder.
    Exclusive,
}

/// Lock collaborator contract.
///
/// Blocking acquisitions wait without a timeout. A wait that would close a
/// cycle of lockers waiting on each other fails with
/// [`SombraError::Deadlock`] instead. Locks are re-entrant per locker: every
/// acquisition needs a matching release, and whatever is still held when the
/// locker closes is released then.
pub trait ResourceLocker: Send + Sync {
    /// Takes an exclusive lock if it is free right now.
    fn try_exclusive_lock(&self, resource: ResourceType, id: u64) -> Result<bool>;
    /// Takes exclusive locks on `ids`, in the given order.
    fn acquire_exclusive(&self, resource: ResourceType, ids: &[u64]) -> Result<()>;
    /// Releases one exclusive acquisition.
    fn release_exclusive(&self, resource: ResourceType, id: u64) -> Result<()>;
    /// Takes a shared lock if it is available right now.
    fn try_shared_lock(&self, resource: ResourceType, id: u64) -> Result<bool>;
    /// Takes shared locks on `ids`, in the given order.
    fn acquire_shared(&self, resource: ResourceType, ids: &[u64]) -> Result<()>;
    /// Releases one shared acquisition.
    fn release_shared(&self, resource: ResourceType, id: u64) -> Result<()>;
    /// True when this locker holds the lock in at least `mode`.
    fn is_locked(&self, resource: ResourceType, id: u64, mode: LockMode) -> bool;
}

type LockKey = (ResourceType, u64);

#[derive(Default, Debug)]
struct LockEntry {
    exclusive: Option<(u64, u32)>,
    shared: FxHashMap<u64, u32>,
}

impl LockEntry {
    fn exclusive_grantable(&self, client: u64) -> bool {
        let exclusive_ok = self.exclusive.map_or(true, |(owner, _)| owner == client);
        let shared_ok = self.shared.keys().all(|owner| *owner == client);
        exclusive_ok && shared_ok
    }

    fn shared_grantable(&self, client: u64) -> bool {
        self.exclusive.map_or(true, |(owner, _)| owner == client)
    }

    fn is_free(&self) -> bool {
        self.exclusive.is_none() && self.shared.is_empty()
    }

    /// Clients other than `client` that keep a `mode` request from being granted.
    fn blockers(&self, client: u64, mode: LockMode) -> impl Iterator<Item = u64> + '_ {
        let exclusive = self.exclusive.map(|(owner, _)| owner);
        let shared = match mode {
            LockMode::Exclusive => Some(self.shared.keys().copied()),
            LockMode::Shared => None,
        };
        exclusive
            .into_iter()
            .chain(shared.into_iter().flatten())
            .filter(move |owner| *owner != client)
    }
}

#[derive(Default)]
struct LockTable {
    entries: FxHashMap<LockKey, LockEntry>,
    // Blocked clients and the request each one waits on.
    waiting: FxHashMap<u64, (LockKey, LockMode)>,
}

impl LockTable {
    /// Follows wait-for edges from the holders of `key`; returns the client
    /// that leads back to `client`, if any.
    fn wait_cycle(&self, client: u64, key: LockKey, mode: LockMode) -> Option<u64> {
        let mut stack: Vec<u64> = self
            .entries
            .get(&key)
            .map(|entry| entry.blockers(client, mode).collect())
            .unwrap_or_default();
        let mut seen = FxHashSet::default();
        while let Some(holder) = stack.pop() {
            if !seen.insert(holder) {
                continue;
            }
            let Some((wanted, wanted_mode)) = self.waiting.get(&holder) else {
                continue;
            };
            let Some(entry) = self.entries.get(wanted) else {
                continue;
            };
            for next in entry.blockers(holder, *wanted_mode) {
                if next == client {
                    return Some(holder);
                }
                stack.push(next);
            }
        }
        None
    }
}

struct ManagerInner {
    table: Mutex<LockTable>,
    released: Condvar,
    next_client: AtomicU64,
}

/// In-process lock table handing out per-transaction [`LockClient`]s.
#[derive(Clone)]
pub struct LockManager {
    inner: Arc<ManagerInner>,
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

impl LockManager {
    /// Creates an empty lock table.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                table: Mutex::new(LockTable::default()),
                released: Condvar::new(),
                next_client: AtomicU64::new(1),
            }),
        }
    }

    /// Opens a new client; its locks are released when it closes or drops.
    pub fn client(&self) -> LockClient {
        LockClient {
            id: self.inner.next_client.fetch_add(1, Ordering::Relaxed),
            inner: Arc::clone(&self.inner),
        }
    }

    /// Number of resources currently locked by any client.
    pub fn active_lock_count(&self) -> usize {
        self.inner.table.lock().entries.len()
    }

    /// Number of clients blocked in an acquisition.
    pub fn waiting_count(&self) -> usize {
        self.inner.table.lock().waiting.len()
    }
}

/// Per-transaction view of the [`LockManager`].
pub struct LockClient {
    id: u64,
    inner: Arc<ManagerInner>,
}

impl LockClient {
    /// Identifier of this client within its manager.
    pub fn id(&self) -> u64 {
        self.id
    }

    fn acquire(
        &self,
        resource: ResourceType,
        id: u64,
        mode: LockMode,
        blocking: bool,
    ) -> Result<bool> {
        let key = (resource, id);
        let mut table = self.inner.table.lock();
        loop {
            let entry = table.entries.entry(key).or_default();
            let grantable = match mode {
                LockMode::Exclusive => entry.exclusive_grantable(self.id),
                LockMode::Shared => entry.shared_grantable(self.id),
            };
            if grantable {
                match mode {
                    LockMode::Exclusive => {
                        let count = entry.exclusive.map_or(0, |(_, count)| count);
                        entry.exclusive = Some((self.id, count + 1));
                    }
                    LockMode::Shared => {
                        *entry.shared.entry(self.id).or_insert(0) += 1;
                    }
                }
                table.waiting.remove(&self.id);
                trace!(client = self.id, %resource, id, ?mode, "locks.acquire");
                return Ok(true);
            }
            if !blocking {
                return Ok(false);
            }
            if let Some(holder) = table.wait_cycle(self.id, key, mode) {
                table.waiting.remove(&self.id);
                warn!(client = self.id, %resource, id, ?mode, holder, "locks.deadlock");
                return Err(SombraError::Deadlock(format!(
                    "client {} waiting for {resource} {id} would wait on itself through client {holder}",
                    self.id
                )));
            }
            table.waiting.insert(self.id, (key, mode));
            self.inner.released.wait(&mut table);
        }
    }

    fn release(&self, resource: ResourceType, id: u64, mode: LockMode) -> Result<()> {
        let key = (resource, id);
        let mut table = self.inner.table.lock();
        let Some(entry) = table.entries.get_mut(&key) else {
            return Err(SombraError::InvalidOwned(format!(
                "{resource} {id} released but not locked"
            )));
        };
        match mode {
            LockMode::Exclusive => match entry.exclusive {
                Some((owner, count)) if owner == self.id => {
                    entry.exclusive = (count > 1).then_some((owner, count - 1));
                }
                _ => {
                    return Err(SombraError::InvalidOwned(format!(
                        "{resource} {id} exclusive lock not held by client {}",
                        self.id
                    )))
                }
            },
            LockMode::Shared => {
                let Some(count) = entry.shared.get_mut(&self.id) else {
                    return Err(SombraError::InvalidOwned(format!(
                        "{resource} {id} shared lock not held by client {}",
                        self.id
                    )));
                };
                *count -= 1;
                if *count == 0 {
                    entry.shared.remove(&self.id);
                }
            }
        }
        if entry.is_free() {
            table.entries.remove(&key);
        }
        drop(table);
        self.inner.released.notify_all();
        Ok(())
    }

    /// Releases every lock this client holds.
    pub fn close(&self) {
        let mut table = self.inner.table.lock();
        table.waiting.remove(&self.id);
        table.entries.retain(|_, entry| {
            if matches!(entry.exclusive, Some((owner, _)) if owner == self.id) {
                entry.exclusive = None;
            }
            entry.shared.remove(&self.id);
            !entry.is_free()
        });
        drop(table);
        self.inner.released.notify_all();
    }
}

impl Drop for LockClient {
    fn drop(&mut self) {
        self.close();
    }
}

impl ResourceLocker for LockClient {
    fn try_exclusive_lock(&self, resource: ResourceType, id: u64) -> Result<bool> {
        self.acquire(resource, id, LockMode::Exclusive, false)
    }

    fn acquire_exclusive(&self, resource: ResourceType, ids: &[u64]) -> Result<()> {
        for id in ids {
            self.acquire(resource, *id, LockMode::Exclusive, true)?;
        }
        Ok(())
    }

    fn release_exclusive(&self, resource: ResourceType, id: u64) -> Result<()> {
        self.release(resource, id, LockMode::Exclusive)
    }

    fn try_shared_lock(&self, resource: ResourceType, id: u64) -> Result<bool> {
        self.acquire(resource, id, LockMode::Shared, false)
    }

    fn acquire_shared(&self, resource: ResourceType, ids: &[u64]) -> Result<()> {
        for id in ids {
            self.acquire(resource, *id, LockMode::Shared, true)?;
        }
        Ok(())
    }

    fn release_shared(&self, resource: ResourceType, id: u64) -> Result<()> {
        self.release(resource, id, LockMode::Shared)
    }

    fn is_locked(&self, resource: ResourceType, id: u64, mode: LockMode) -> bool {
        let table = self.inner.table.lock();
        let Some(entry) = table.entries.get(&(resource, id)) else {
            return false;
        };
        let exclusive = matches!(entry.exclusive, Some((owner, _)) if owner == self.id);
        match mode {
            LockMode::Exclusive => exclusive,
            LockMode::Shared => exclusive || entry.shared.contains_key(&self.id),
        }
    }
}

/// Locker wrapper that rejects out-of-order relationship locks.
///
/// A new exclusive relationship lock must have a higher id than every
/// relationship lock this wrapper currently holds; otherwise the acquisition
/// fails with [`SombraError::LockOrder`] before reaching the inner locker.
pub struct OrderVerifyingLocker<L: ResourceLocker> {
    inner: L,
    held: Mutex<BTreeSet<u64>>,
}

impl<L: ResourceLocker> OrderVerifyingLocker<L> {
    /// Wraps `inner`.
    pub fn new(inner: L) -> Self {
        Self {
            inner,
            held: Mutex::new(BTreeSet::new()),
        }
    }

    /// Borrows the wrapped locker.
    pub fn inner(&self) -> &L {
        &self.inner
    }

    fn check_order(&self, id: u64) -> Result<()> {
        let held = self.held.lock();
        if held.contains(&id) {
            return Ok(());
        }
        if let Some(max) = held.last() {
            if id < *max {
                return Err(SombraError::LockOrder(format!(
                    "RELATIONSHIP {id} requested while holding RELATIONSHIP {max}"
                )));
            }
        }
        Ok(())
    }
}

impl<L: ResourceLocker> ResourceLocker for OrderVerifyingLocker<L> {
    fn try_exclusive_lock(&self, resource: ResourceType, id: u64) -> Result<bool> {
        if resource == ResourceType::Relationship {
            self.check_order(id)?;
        }
        let locked = self.inner.try_exclusive_lock(resource, id)?;
        if locked && resource == ResourceType::Relationship {
            self.held.lock().insert(id);
        }
        Ok(locked)
    }

    fn acquire_exclusive(&self, resource: ResourceType, ids: &[u64]) -> Result<()> {
        for id in ids {
            if resource == ResourceType::Relationship {
                self.check_order(*id)?;
            }
            self.inner.acquire_exclusive(resource, std::slice::from_ref(id))?;
            if resource == ResourceType::Relationship {
                self.held.lock().insert(*id);
            }
        }
        Ok(())
    }

    fn release_exclusive(&self, resource: ResourceType, id: u64) -> Result<()> {
        self.inner.release_exclusive(resource, id)?;
        if resource == ResourceType::Relationship
            && !self.inner.is_locked(resource, id, LockMode::Exclusive)
        {
            self.held.lock().remove(&id);
        }
        Ok(())
    }

    fn try_shared_lock(&self, resource: ResourceType, id: u64) -> Result<bool> {
        self.inner.try_shared_lock(resource, id)
    }

    fn acquire_shared(&self, resource: ResourceType, ids: &[u64]) -> Result<()> {
        self.inner.acquire_shared(resource, ids)
    }

    fn release_shared(&self, resource: ResourceType, id: u64) -> Result<()> {
        self.inner.release_shared(resource, id)
    }

    fn is_locked(&self, resource: ResourceType, id: u64, mode: LockMode) -> bool {
        self.inner.is_locked(resource, id, mode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn exclusive_locks_are_reentrant() -> Result<()> {
        let manager = LockManager::new();
        let client = manager.client();
        client.acquire_exclusive(ResourceType::Relationship, &[4, 4])?;
        client.release_exclusive(ResourceType::Relationship, 4)?;
        assert!(client.is_locked(ResourceType::Relationship, 4, LockMode::Exclusive));
        client.release_exclusive(ResourceType::Relationship, 4)?;
        assert!(!client.is_locked(ResourceType::Relationship, 4, LockMode::Shared));
        assert_eq!(manager.active_lock_count(), 0);
        Ok(())
    }

    #[test]
    fn exclusive_blocks_other_client_until_close() -> Result<()> {
        let manager = LockManager::new();
        let holder = manager.client();
        holder.acquire_exclusive(ResourceType::Node, &[1])?;

        let other = manager.client();
        assert!(!other.try_exclusive_lock(ResourceType::Node, 1)?);
        assert!(!other.try_shared_lock(ResourceType::Node, 1)?);

        let acquired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&acquired);
        let waiter_manager = manager.clone();
        let handle = thread::spawn(move || {
            let waiter = waiter_manager.client();
            waiter
                .acquire_exclusive(ResourceType::Node, &[1])
                .expect("lock acquired");
            flag.store(true, Ordering::SeqCst);
        });
        thread::sleep(Duration::from_millis(50));
        assert!(!acquired.load(Ordering::SeqCst), "waiter should block");
        drop(holder);
        handle.join().unwrap();
        assert!(acquired.load(Ordering::SeqCst));
        Ok(())
    }

    fn wait_until_blocked(manager: &LockManager, waiters: usize) {
        for _ in 0..500 {
            if manager.waiting_count() == waiters {
                return;
            }
            thread::sleep(Duration::from_millis(2));
        }
        panic!("expected {waiters} blocked clients, saw {}", manager.waiting_count());
    }

    #[test]
    fn opposite_order_waits_report_deadlock() -> Result<()> {
        let manager = LockManager::new();
        let first = manager.client();
        first.acquire_exclusive(ResourceType::Node, &[1])?;

        let waiter_manager = manager.clone();
        let (locked_two, ready) = std::sync::mpsc::channel();
        let handle = thread::spawn(move || -> Result<()> {
            let second = waiter_manager.client();
            second.acquire_exclusive(ResourceType::Node, &[2])?;
            locked_two.send(()).expect("main thread alive");
            second.acquire_exclusive(ResourceType::Node, &[1])?;
            assert!(second.is_locked(ResourceType::Node, 1, LockMode::Exclusive));
            Ok(())
        });
        ready.recv().expect("second client locked node 2");
        wait_until_blocked(&manager, 1);

        let err = first
            .acquire_exclusive(ResourceType::Node, &[2])
            .unwrap_err();
        assert!(matches!(err, SombraError::Deadlock(_)), "{err}");
        assert!(!first.is_locked(ResourceType::Node, 2, LockMode::Shared));
        assert_eq!(manager.waiting_count(), 1);

        drop(first);
        handle.join().expect("second client thread")?;
        assert_eq!(manager.waiting_count(), 0);
        assert_eq!(manager.active_lock_count(), 0);
        Ok(())
    }

    #[test]
    fn shared_readers_closing_a_cycle_are_refused() -> Result<()> {
        let manager = LockManager::new();
        let reader = manager.client();
        reader.acquire_shared(ResourceType::RelationshipGroup, &[4])?;

        let waiter_manager = manager.clone();
        let (holding, ready) = std::sync::mpsc::channel();
        let handle = thread::spawn(move || -> Result<()> {
            let writer = waiter_manager.client();
            writer.acquire_exclusive(ResourceType::Relationship, &[8])?;
            holding.send(()).expect("main thread alive");
            writer.acquire_exclusive(ResourceType::RelationshipGroup, &[4])
        });
        ready.recv().expect("writer locked relationship 8");
        wait_until_blocked(&manager, 1);

        // A second, unrelated shared holder does not wait on anyone.
        let bystander = manager.client();
        assert!(bystander.try_shared_lock(ResourceType::RelationshipGroup, 4)?);
        bystander.release_shared(ResourceType::RelationshipGroup, 4)?;

        let err = reader
            .acquire_shared(ResourceType::Relationship, &[8])
            .unwrap_err();
        assert!(matches!(err, SombraError::Deadlock(_)));
        reader.close();
        handle.join().expect("writer thread")?;
        Ok(())
    }

    #[test]
    fn shared_locks_coexist_and_exclude_writers() -> Result<()> {
        let manager = LockManager::new();
        let a = manager.client();
        let b = manager.client();
        a.acquire_shared(ResourceType::RelationshipGroup, &[9])?;
        assert!(b.try_shared_lock(ResourceType::RelationshipGroup, 9)?);
        assert!(!b.try_exclusive_lock(ResourceType::RelationshipGroup, 9)?);
        a.release_shared(ResourceType::RelationshipGroup, 9)?;
        assert!(b.try_exclusive_lock(ResourceType::RelationshipGroup, 9)?);
        Ok(())
    }

    #[test]
    fn releasing_unheld_lock_fails() {
        let manager = LockManager::new();
        let client = manager.client();
        assert!(client
            .release_exclusive(ResourceType::Relationship, 3)
            .is_err());
    }

    #[test]
    fn verifier_rejects_descending_relationship_locks() -> Result<()> {
        let manager = LockManager::new();
        let locker = OrderVerifyingLocker::new(manager.client());
        locker.acquire_exclusive(ResourceType::Relationship, &[2, 5, 5])?;
        let err = locker
            .acquire_exclusive(ResourceType::Relationship, &[3])
            .unwrap_err();
        assert!(matches!(err, SombraError::LockOrder(_)));
        assert!(!locker.is_locked(ResourceType::Relationship, 3, LockMode::Exclusive));

        locker.release_exclusive(ResourceType::Relationship, 5)?;
        locker.release_exclusive(ResourceType::Relationship, 5)?;
        locker.acquire_exclusive(ResourceType::Relationship, &[3])?;
        locker.acquire_exclusive(ResourceType::Node, &[1])?;
        Ok(())
    }
}
