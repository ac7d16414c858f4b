//! Handle registry
//!
//! The registry is the only owner of data handles. It keeps a name-hash
//! bucket index for lookups and an ordered sequence for traversal, both
//! behind one registry-wide read/write lock.
//!
//! All access goes through a [`HandleList`], which owns the lock guard for its
//! whole life and flags the session as holding the registry lock. Walking the
//! list yields pinned [`HandleRef`]s: the next handle is pinned before it is
//! handed out and unpinned when the caller drops it. The walk cursor is the
//! insertion sequence number of the last handle visited, so handles removed
//! ahead of the cursor are simply never seen and no handle is visited twice.

use std::collections::{BTreeMap, HashMap};
use std::ops::{Bound, Deref};
use std::sync::Arc;

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, trace};

use lumadb_common::metrics;

use crate::handle::{name_hash, DataHandle, HandleKey, HandleRef, HandleState};
use crate::session::Session;

/// Registry contents, reachable only through a [`HandleList`]
#[derive(Debug, Default)]
pub struct RegistryInner {
    buckets: HashMap<u64, Vec<Arc<DataHandle>>>,
    order: BTreeMap<u64, Arc<DataHandle>>,
    next_seq: u64,
}

impl RegistryInner {
    /// Exact `(name, checkpoint)` match within the hash bucket; dead handles
    /// are invisible so a replacement can be created next to them.
    fn lookup(&self, hash: u64, name: &str, checkpoint: Option<&str>) -> Option<&Arc<DataHandle>> {
        self.buckets.get(&hash)?.iter().find(|handle| {
            handle.key().matches(name, checkpoint) && handle.status().state != HandleState::Dead
        })
    }
}

/// Owner of all data handles
#[derive(Debug, Default)]
pub struct HandleRegistry {
    inner: RwLock<RegistryInner>,
}

/// List holding the registry lock in shared mode
pub type SharedHandleList<'a> = HandleList<'a, RwLockReadGuard<'a, RegistryInner>>;

/// List holding the registry lock in exclusive mode
pub type ExclusiveHandleList<'a> = HandleList<'a, RwLockWriteGuard<'a, RegistryInner>>;

impl HandleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock the registry for lookups and walks
    pub fn read<'a>(&'a self, session: &'a Session) -> SharedHandleList<'a> {
        HandleList::new(session, self.inner.read())
    }

    /// Lock the registry for lookups, walks and structural changes
    pub fn write<'a>(&'a self, session: &'a Session) -> ExclusiveHandleList<'a> {
        HandleList::new(session, self.inner.write())
    }

    /// Number of registered handles, dead ones included
    pub fn len(&self) -> usize {
        self.inner.read().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Locked view of the registry and a walk over it
pub struct HandleList<'a, G: Deref<Target = RegistryInner>> {
    session: &'a Session,
    guard: G,
    cursor: Option<u64>,
}

impl<'a, G: Deref<Target = RegistryInner>> HandleList<'a, G> {
    fn new(session: &'a Session, guard: G) -> Self {
        assert!(
            !session.holds_handle_list_lock(),
            "session {} already holds the handle list lock; it is not recursive",
            session.id()
        );
        session.set_handle_list_locked(true);
        Self {
            session,
            guard,
            cursor: None,
        }
    }

    pub fn session(&self) -> &'a Session {
        self.session
    }

    /// Look up the live handle for `(name, checkpoint)`
    pub fn find(&self, name: &str, checkpoint: Option<&str>) -> Option<HandleRef> {
        self.find_hashed(name_hash(name), name, checkpoint)
    }

    pub(crate) fn find_hashed(&self, hash: u64, name: &str, checkpoint: Option<&str>) -> Option<HandleRef> {
        self.guard.lookup(hash, name, checkpoint).map(HandleRef::pin)
    }

    pub fn len(&self) -> usize {
        self.guard.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.guard.order.is_empty()
    }

    /// Restart the walk from the head of the list
    pub fn rewind(&mut self) {
        self.cursor = None;
    }
}

impl<'a, G: Deref<Target = RegistryInner>> Iterator for HandleList<'a, G> {
    type Item = HandleRef;

    fn next(&mut self) -> Option<HandleRef> {
        assert!(
            self.session.holds_handle_list_lock(),
            "handle list walked without holding its lock"
        );
        let lower = match self.cursor {
            Some(seq) => Bound::Excluded(seq),
            None => Bound::Unbounded,
        };
        let (seq, handle) = self.guard.order.range((lower, Bound::Unbounded)).next()?;
        self.cursor = Some(*seq);
        Some(HandleRef::pin(handle))
    }
}

impl<'a> HandleList<'a, RwLockWriteGuard<'a, RegistryInner>> {
    /// Return the live handle for `(name, checkpoint)`, registering a closed
    /// one on a miss
    pub fn find_or_insert(&mut self, name: &str, checkpoint: Option<&str>) -> HandleRef {
        let hash = name_hash(name);
        match self.find_hashed(hash, name, checkpoint) {
            Some(found) => found,
            None => self.insert_hashed(HandleKey::new(name, checkpoint), hash),
        }
    }

    pub(crate) fn insert_hashed(&mut self, key: HandleKey, hash: u64) -> HandleRef {
        let inner = &mut *self.guard;
        let seq = inner.next_seq;
        inner.next_seq += 1;

        debug!(handle = %key, seq, "registering data handle");
        let handle = Arc::new(DataHandle::with_hash(key, seq, hash));
        inner.buckets.entry(hash).or_default().push(Arc::clone(&handle));
        inner.order.insert(seq, Arc::clone(&handle));
        metrics::set_registry_size(inner.order.len());

        HandleRef::pin(&handle)
    }

    /// Unlink a closed, unreferenced handle.
    ///
    /// The caller's reference is released first. Panics if any other
    /// reference or an exclusive hold remains, or if the handle is still open.
    pub fn remove(&mut self, pin: HandleRef) {
        let handle = pin.unpin();
        let _closing = handle.close_guard.lock();
        assert!(
            handle.session_refs() == 0 && handle.exclusive_refs() == 0,
            "removing referenced handle {} (session_ref {}, excl_ref {})",
            handle.key(),
            handle.session_refs(),
            handle.exclusive_refs()
        );
        assert!(
            !handle.status().is_open(),
            "removing open handle {}",
            handle.key()
        );
        self.unlink(&handle);
    }

    /// Unlink the handle if nothing else is using or closing it
    pub fn try_discard(&mut self, pin: HandleRef) -> bool {
        let handle = pin.unpin();
        let Some(_closing) = handle.close_guard.try_lock() else {
            trace!(handle = %handle.key(), "close in progress, not discarding");
            return false;
        };
        if handle.session_refs() != 0 || handle.exclusive_refs() != 0 {
            return false;
        }
        // A held write lock means the handle is being opened.
        let Some(slot) = handle.lock.try_write() else {
            return false;
        };
        if slot.is_open() || handle.status().is_open() {
            return false;
        }
        drop(slot);

        self.unlink(&handle);
        true
    }

    fn unlink(&mut self, handle: &Arc<DataHandle>) {
        let inner = &mut *self.guard;
        let hash = handle.name_hash();
        if let Some(bucket) = inner.buckets.get_mut(&hash) {
            bucket.retain(|h| !Arc::ptr_eq(h, handle));
            if bucket.is_empty() {
                inner.buckets.remove(&hash);
            }
        }
        inner.order.remove(&handle.seq());
        metrics::set_registry_size(inner.order.len());

        // Anyone still holding the allocation must not reuse it.
        handle.update_status(|s| {
            if s.state != HandleState::Dropped {
                s.state = HandleState::Dead;
            }
        });
        debug!(handle = %handle.key(), "data handle discarded");
    }
}

impl<'a, G: Deref<Target = RegistryInner>> Drop for HandleList<'a, G> {
    fn drop(&mut self) {
        self.session.set_handle_list_locked(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names<G: Deref<Target = RegistryInner>>(list: &mut HandleList<'_, G>) -> Vec<String> {
        list.by_ref().map(|h| h.name().to_string()).collect()
    }

    #[test]
    fn test_find_or_insert_is_unique() {
        let registry = HandleRegistry::new();
        let session = Session::new(1);
        let mut list = registry.write(&session);

        let first = list.find_or_insert("table:foo", None);
        let second = list.find_or_insert("table:foo", None);
        assert!(Arc::ptr_eq(first.handle(), second.handle()));
        assert_eq!(first.session_refs(), 2);
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn test_checkpoint_is_part_of_identity() {
        let registry = HandleRegistry::new();
        let session = Session::new(1);
        let mut list = registry.write(&session);

        let live = list.find_or_insert("file:a.wt", None);
        let ckpt = list.find_or_insert("file:a.wt", Some("ckpt.1"));
        assert!(!Arc::ptr_eq(live.handle(), ckpt.handle()));
        assert_eq!(live.name_hash(), ckpt.name_hash());
        assert!(list.find("file:a.wt", Some("ckpt.2")).is_none());
    }

    #[test]
    fn test_hash_collision_resolved_by_exact_match() {
        let registry = HandleRegistry::new();
        let session = Session::new(1);
        let mut list = registry.write(&session);

        let a = list.insert_hashed(HandleKey::new("table:a", None), 42);
        let b = list.insert_hashed(HandleKey::new("table:b", None), 42);

        let found = list.find_hashed(42, "table:b", None).unwrap();
        assert!(Arc::ptr_eq(found.handle(), b.handle()));
        let found = list.find_hashed(42, "table:a", None).unwrap();
        assert!(Arc::ptr_eq(found.handle(), a.handle()));
        assert!(list.find_hashed(42, "table:c", None).is_none());
    }

    #[test]
    fn test_walk_visits_each_once_in_insertion_order() {
        let registry = HandleRegistry::new();
        let session = Session::new(1);
        {
            let mut list = registry.write(&session);
            for name in ["file:a", "file:b", "file:c"] {
                list.find_or_insert(name, None);
            }
        }

        let mut list = registry.read(&session);
        assert_eq!(names(&mut list), ["file:a", "file:b", "file:c"]);
        assert!(list.next().is_none());

        list.rewind();
        let first = list.next().unwrap();
        assert_eq!(first.name(), "file:a");
        assert_eq!(first.session_refs(), 1);
        drop(first);
    }

    #[test]
    fn test_remove_waits_for_concurrent_walk() {
        use std::sync::mpsc;
        use std::time::Duration;

        let registry = HandleRegistry::new();
        {
            let session = Session::new(1);
            let mut list = registry.write(&session);
            for name in ["file:a", "file:b", "file:c"] {
                list.find_or_insert(name, None);
            }
        }

        let (started_tx, started_rx) = mpsc::channel();
        let (removed_tx, removed_rx) = mpsc::channel();

        let registry = &registry;
        std::thread::scope(|scope| {
            scope.spawn(move || {
                let session = Session::new(2);
                started_rx.recv().unwrap();
                let mut list = registry.write(&session);
                let victim = list.find("file:b", None).unwrap();
                let stale = Arc::clone(victim.handle());
                list.remove(victim);
                removed_tx.send(stale).unwrap();
            });

            let session = Session::new(1);
            let mut list = registry.read(&session);
            let first = list.next().unwrap();
            started_tx.send(()).unwrap();

            // The remover cannot get in while the walk holds the registry.
            assert!(removed_rx.recv_timeout(Duration::from_millis(50)).is_err());
            let mut visited = vec![first.name().to_string()];
            drop(first);
            visited.extend(names(&mut list));
            assert_eq!(visited, ["file:a", "file:b", "file:c"]);
            drop(list);

            let stale = removed_rx.recv_timeout(Duration::from_secs(5)).unwrap();
            assert_eq!(stale.status().state, HandleState::Dead);

            let mut list = registry.read(&session);
            assert_eq!(names(&mut list), ["file:a", "file:c"]);
            assert!(list.find("file:b", None).is_none());
        });
    }

    #[test]
    fn test_walk_skips_handle_removed_ahead_of_cursor() {
        let registry = HandleRegistry::new();
        let session = Session::new(1);
        let mut list = registry.write(&session);
        for name in ["file:a", "file:b", "file:c", "file:d"] {
            list.find_or_insert(name, None);
        }
        list.rewind();

        let mut visited = Vec::new();
        let first = list.next().unwrap();
        visited.push(first.name().to_string());
        drop(first);

        let victim = list.find("file:c", None).unwrap();
        let victim_handle = Arc::clone(victim.handle());
        list.remove(victim);

        while let Some(handle) = list.next() {
            visited.push(handle.name().to_string());
        }
        assert_eq!(visited, ["file:a", "file:b", "file:d"]);
        assert_eq!(victim_handle.status().state, HandleState::Dead);
        assert_eq!(list.len(), 3);
    }

    #[test]
    fn test_dead_handle_invisible_to_lookup() {
        let registry = HandleRegistry::new();
        let session = Session::new(1);
        let mut list = registry.write(&session);

        let old = list.find_or_insert("table:foo", None);
        let old_handle = Arc::clone(old.handle());
        old.handle().update_status(|s| s.state = HandleState::Dead);
        drop(old);

        assert!(list.find("table:foo", None).is_none());
        let fresh = list.find_or_insert("table:foo", None);
        assert!(!Arc::ptr_eq(fresh.handle(), &old_handle));
        assert_eq!(list.len(), 2);
    }

    #[test]
    #[should_panic(expected = "removing referenced handle")]
    fn test_remove_referenced_handle_panics() {
        let registry = HandleRegistry::new();
        let session = Session::new(1);
        let mut list = registry.write(&session);

        let pin = list.find_or_insert("table:foo", None);
        let _other = pin.clone();
        list.remove(pin);
    }

    #[test]
    fn test_try_discard_leaves_referenced_handle() {
        let registry = HandleRegistry::new();
        let session = Session::new(1);
        let mut list = registry.write(&session);

        let pin = list.find_or_insert("table:foo", None);
        let other = pin.clone();
        assert!(!list.try_discard(pin));
        assert_eq!(list.len(), 1);

        let handle = Arc::clone(other.handle());
        drop(other);
        let closing = handle.close_guard.lock();
        let again = list.find("table:foo", None).unwrap();
        assert!(!list.try_discard(again));
        drop(closing);

        let last = list.find("table:foo", None).unwrap();
        assert!(list.try_discard(last));
        assert!(list.is_empty());
    }

    #[test]
    fn test_list_flags_session() {
        let registry = HandleRegistry::new();
        let session = Session::new(1);
        assert!(!session.holds_handle_list_lock());
        {
            let _list = registry.read(&session);
            assert!(session.holds_handle_list_lock());
        }
        assert!(!session.holds_handle_list_lock());
    }

    #[test]
    #[should_panic(expected = "not recursive")]
    fn test_nested_list_panics() {
        let registry = HandleRegistry::new();
        let session = Session::new(1);
        let _outer = registry.read(&session);
        let _inner = registry.read(&session);
    }
}
