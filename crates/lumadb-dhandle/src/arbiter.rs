//! Shared/exclusive access arbitration on a single handle
//!
//! Shared access holds the handle's read lock for the life of the grant.
//! Exclusive access holds the write lock and is never waited for: if the
//! write lock is taken, the request fails with [`HandleError::Busy`] and the
//! caller decides whether to retry.
//!
//! Every grant is a [`HandleAccess`] guard. Dropping it (or calling
//! [`HandleAccess::release`]) undoes exactly what the grant did, in reverse
//! order: exclusive bookkeeping, the handle lock, the in-use count and
//! finally the session reference.

use std::fmt;
use std::sync::Arc;

use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::RawRwLock;
use tracing::{debug, trace, warn};

use lumadb_common::error::{Error, HandleError, Result};
use lumadb_common::metrics;

use crate::clock::Clock;
use crate::context::with_handle;
use crate::handle::{DataHandle, HandleRef, HandleState, SourceSlot};
use crate::session::Session;
use crate::source::{DataSource, Underlying};

type ReadGuard = ArcRwLockReadGuard<RawRwLock, SourceSlot>;
type WriteGuard = ArcRwLockWriteGuard<RawRwLock, SourceSlot>;

/// Requested access mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    /// Concurrent use; opens the data source if needed
    Shared,
    /// Sole use; opens the data source if needed
    Exclusive,
    /// Sole use without opening or closing the data source
    LockOnlyExclusive,
    /// Shared if the handle is open, otherwise an exclusive lock-only hold
    /// when the lock is free, otherwise `Busy`. Callers must not rely on
    /// which of these they get.
    LockOnly,
}

impl AccessMode {
    pub fn as_str(self) -> &'static str {
        match self {
            AccessMode::Shared => "shared",
            AccessMode::Exclusive => "exclusive",
            AccessMode::LockOnlyExclusive => "lock_only_exclusive",
            AccessMode::LockOnly => "lock_only",
        }
    }

    fn wants_exclusive(self) -> bool {
        matches!(self, AccessMode::Exclusive | AccessMode::LockOnlyExclusive)
    }

    fn is_lock_only(self) -> bool {
        matches!(self, AccessMode::LockOnlyExclusive | AccessMode::LockOnly)
    }
}

/// Access actually granted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Grant {
    Shared,
    Exclusive,
}

/// Grants access to handles and opens/closes their data sources
#[derive(Clone)]
pub struct AccessArbiter {
    source: Arc<dyn DataSource>,
    clock: Arc<dyn Clock>,
}

impl AccessArbiter {
    pub fn new(source: Arc<dyn DataSource>, clock: Arc<dyn Clock>) -> Self {
        Self { source, clock }
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Acquire `mode` access on the pinned handle.
    ///
    /// The pin moves into the returned guard and is released with it. A
    /// session that already owns the exclusive hold gets a nested exclusive
    /// grant whatever mode it asks for.
    pub fn acquire<'s>(
        &self,
        session: &'s Session,
        pin: HandleRef,
        mode: AccessMode,
    ) -> Result<HandleAccess<'s>> {
        let handle = Arc::clone(pin.handle());

        let status = handle.status();
        status.check_usable(handle.key())?;
        if status.exclusive && status.owner == Some(session.id()) {
            let depth = handle.add_exclusive_ref();
            trace!(handle = %handle.key(), depth, "nested exclusive grant");
            return Ok(self.grant(session, pin, AccessKind::Nested));
        }

        loop {
            let status = handle.status();
            status.check_usable(handle.key())?;

            if matches!(mode, AccessMode::Shared | AccessMode::LockOnly) && handle.can_reopen(session) {
                let guard = Self::read_lock(session, &handle, mode)?;
                // The reaper may have closed it before we got the lock.
                if handle.status().is_open() && guard.is_open() {
                    return Ok(self.grant(session, pin, AccessKind::Shared(guard)));
                }
                continue;
            }

            let Some(mut guard) = handle.lock.try_write_arc() else {
                if mode == AccessMode::Shared || (mode == AccessMode::LockOnly && handle.status().is_open()) {
                    // Someone is opening, closing or holding it exclusively.
                    drop(Self::read_lock(session, &handle, mode)?);
                    continue;
                }
                return Err(Self::busy(&handle, mode));
            };

            let status = handle.status();
            status.check_usable(handle.key())?;

            match mode {
                AccessMode::Shared => {
                    if !status.is_open() {
                        self.open_slot(session, &handle, &mut guard)?;
                    }
                    // Retake as a reader.
                    drop(guard);
                }
                AccessMode::LockOnly if status.is_open() => drop(guard),
                _ => {
                    if !mode.is_lock_only() && !status.is_open() {
                        self.open_slot(session, &handle, &mut guard)?;
                    }
                    handle.update_status(|s| {
                        s.exclusive = true;
                        s.owner = Some(session.id());
                        s.lock_only = mode.is_lock_only();
                    });
                    let depth = handle.add_exclusive_ref();
                    assert_eq!(depth, 1, "exclusive hold on {} granted twice", handle.key());
                    debug!(handle = %handle.key(), session = session.id(), mode = mode.as_str(), "exclusive access granted");
                    return Ok(self.grant(session, pin, AccessKind::Exclusive(guard)));
                }
            }
        }
    }

    /// Read lock for a shared grant. A session walking the registry must not
    /// wait here: the writer it waits for may itself be waiting for the
    /// registry lock.
    fn read_lock(session: &Session, handle: &Arc<DataHandle>, mode: AccessMode) -> Result<ReadGuard> {
        if session.holds_handle_list_lock() {
            return handle.lock.try_read_arc().ok_or_else(|| Self::busy(handle, mode));
        }
        Ok(handle.lock.read_arc())
    }

    fn busy(handle: &DataHandle, mode: AccessMode) -> Error {
        handle.counters().record_busy();
        metrics::record_handle_busy(mode.as_str());
        debug!(handle = %handle.key(), mode = mode.as_str(), "handle busy");
        HandleError::Busy(handle.key().to_string()).into()
    }

    fn grant<'s>(&self, session: &'s Session, pin: HandleRef, kind: AccessKind) -> HandleAccess<'s> {
        let handle = Arc::clone(pin.handle());
        handle.begin_use();
        match kind {
            AccessKind::Shared(_) => handle.counters().record_shared(),
            _ => handle.counters().record_exclusive(),
        }
        HandleAccess {
            session,
            handle,
            pin: Some(pin),
            kind,
            arbiter: self.clone(),
        }
    }

    /// Open the data source into the slot; the caller holds the write lock
    pub(crate) fn open_slot(
        &self,
        session: &Session,
        handle: &Arc<DataHandle>,
        slot: &mut SourceSlot,
    ) -> Result<()> {
        let opened = with_handle(session, Some(handle), |s| self.source.open(s, handle.key()))
            .map_err(|e| {
                warn!(handle = %handle.key(), error = %e, "failed to open data source");
                e
            })?;
        slot.config = Some(opened.config);
        slot.underlying = Some(opened.underlying);
        // A fresh open supersedes a discard left by the previous one.
        handle.update_status(|s| {
            if s.state == HandleState::Closed {
                s.state = HandleState::Open;
                s.discard_on_release = false;
                s.discard_and_kill = false;
            }
        });

        handle.counters().record_open();
        metrics::record_handle_open(handle.handle_type().as_str());
        debug!(handle = %handle.key(), "data source opened");
        Ok(())
    }

    /// Close the data source held in the slot, if any; the caller holds the
    /// write lock. The handle is left closed even when the source reports
    /// an error.
    pub(crate) fn close_slot(
        &self,
        session: &Session,
        handle: &Arc<DataHandle>,
        slot: &mut SourceSlot,
    ) -> Result<()> {
        let Some(underlying) = slot.underlying.take() else {
            return Ok(());
        };
        slot.config = None;

        let result = with_handle(session, Some(handle), |s| {
            self.source.close(s, handle.key(), underlying)
        });
        handle.update_status(|s| {
            if s.state == HandleState::Open {
                s.state = HandleState::Closed;
            }
        });

        handle.counters().record_close();
        metrics::record_handle_close(handle.handle_type().as_str());
        match &result {
            Ok(()) => debug!(handle = %handle.key(), "data source closed"),
            Err(e) => warn!(handle = %handle.key(), error = %e, "data source close failed"),
        }
        result
    }
}

impl fmt::Debug for AccessArbiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessArbiter").finish_non_exhaustive()
    }
}

enum AccessKind {
    Shared(ReadGuard),
    Exclusive(WriteGuard),
    /// Further exclusive grant to the session holding the write lock
    Nested,
    Released,
}

/// Granted access to a handle, released on drop
pub struct HandleAccess<'s> {
    session: &'s Session,
    handle: Arc<DataHandle>,
    pin: Option<HandleRef>,
    kind: AccessKind,
    arbiter: AccessArbiter,
}

impl<'s> HandleAccess<'s> {
    pub fn handle(&self) -> &Arc<DataHandle> {
        &self.handle
    }

    pub fn session(&self) -> &'s Session {
        self.session
    }

    pub fn granted(&self) -> Grant {
        match self.kind {
            AccessKind::Shared(_) => Grant::Shared,
            _ => Grant::Exclusive,
        }
    }

    pub fn is_exclusive(&self) -> bool {
        self.granted() == Grant::Exclusive
    }

    /// Configuration the data source was opened with; `None` for lock-only
    /// and nested grants
    pub fn config(&self) -> Option<&str> {
        self.slot().and_then(SourceSlot::config)
    }

    pub fn underlying(&self) -> Option<&Underlying> {
        self.slot().and_then(SourceSlot::underlying)
    }

    /// Mutable access to the data source, exclusive grants only
    pub fn underlying_mut(&mut self) -> Option<&mut Underlying> {
        match &mut self.kind {
            AccessKind::Exclusive(guard) => guard.underlying_mut(),
            _ => None,
        }
    }

    fn slot(&self) -> Option<&SourceSlot> {
        match &self.kind {
            AccessKind::Shared(guard) => Some(&**guard),
            AccessKind::Exclusive(guard) => Some(&**guard),
            AccessKind::Nested | AccessKind::Released => None,
        }
    }

    fn assert_exclusive(&self, what: &str) {
        assert!(
            self.is_exclusive(),
            "{what} on {} requires exclusive access",
            self.handle.key()
        );
    }

    /// Close the data source when the exclusive hold is released; with
    /// `kill` the handle also becomes dead.
    pub fn mark_discard(&self, kill: bool) {
        self.assert_exclusive("discard");
        self.handle.update_status(|s| {
            s.discard_on_release = true;
            s.discard_and_kill |= kill;
        });
    }

    /// Mark the object dropped; the handle is never reopened
    pub fn mark_dropped(&self) -> Result<()> {
        self.assert_exclusive("drop");
        if self.handle.is_metadata() {
            return Err(HandleError::Protected(self.handle.key().to_string()).into());
        }
        self.handle.update_status(|s| {
            s.state = HandleState::Dropped;
            s.discard_on_release = true;
        });
        debug!(handle = %self.handle.key(), "data handle dropped");
        Ok(())
    }

    /// Close the data source now, keeping the exclusive hold
    pub fn close_source(&mut self) -> Result<()> {
        self.assert_exclusive("close");
        let AccessKind::Exclusive(guard) = &mut self.kind else {
            return Err(Error::Internal(format!(
                "nested grant cannot close {}",
                self.handle.key()
            )));
        };
        self.arbiter.close_slot(self.session, &self.handle, guard)
    }

    /// Release the grant, reporting a failed close of the data source
    pub fn release(mut self) -> Result<()> {
        self.finish()
    }

    fn finish(&mut self) -> Result<()> {
        let kind = std::mem::replace(&mut self.kind, AccessKind::Released);
        let mut result = Ok(());
        match kind {
            AccessKind::Released => return Ok(()),
            AccessKind::Shared(guard) => drop(guard),
            AccessKind::Nested => {
                self.handle.remove_exclusive_ref();
            }
            AccessKind::Exclusive(mut guard) => {
                let remaining = self.handle.remove_exclusive_ref();
                if remaining != 0 {
                    warn!(handle = %self.handle.key(), remaining, "exclusive hold released before its nested grants");
                    // Never panic while already unwinding.
                    debug_assert!(
                        std::thread::panicking(),
                        "exclusive hold on {} released before its nested grants",
                        self.handle.key()
                    );
                }
                if self.handle.status().discard_on_release {
                    result = self.arbiter.close_slot(self.session, &self.handle, &mut guard);
                }
                let status = self.handle.update_status(|s| {
                    s.exclusive = false;
                    s.owner = None;
                    s.lock_only = false;
                    // The discard flags stay set for the sweep to act on.
                    if s.discard_and_kill && s.state != HandleState::Dropped {
                        s.state = HandleState::Dead;
                    }
                });
                trace!(handle = %self.handle.key(), state = ?status.state, "exclusive access released");
                drop(guard);
            }
        }
        self.handle.end_use(self.arbiter.clock.now());
        self.pin.take();
        result
    }
}

impl Drop for HandleAccess<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.finish() {
            warn!(handle = %self.handle.key(), error = %e, "error releasing data handle");
        }
    }
}

impl fmt::Debug for HandleAccess<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandleAccess")
            .field("handle", self.handle.key())
            .field("session", &self.session.id())
            .field("granted", &self.granted())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::registry::HandleRegistry;
    use crate::source::{InMemorySource, MemoryObject};

    struct Fixture {
        registry: HandleRegistry,
        source: Arc<InMemorySource>,
        clock: Arc<ManualClock>,
        arbiter: AccessArbiter,
    }

    impl Fixture {
        fn new() -> Self {
            let source = Arc::new(InMemorySource::new());
            let clock = Arc::new(ManualClock::new(1_000));
            let arbiter = AccessArbiter::new(source.clone(), clock.clone());
            Self {
                registry: HandleRegistry::new(),
                source,
                clock,
                arbiter,
            }
        }

        fn pin(&self, session: &Session, name: &str) -> HandleRef {
            self.registry.write(session).find_or_insert(name, None)
        }

        fn acquire<'s>(&self, session: &'s Session, name: &str, mode: AccessMode) -> Result<HandleAccess<'s>> {
            self.arbiter.acquire(session, self.pin(session, name), mode)
        }
    }

    #[test]
    fn test_shared_opens_once() {
        let fx = Fixture::new();
        fx.source.set_config("table:foo", "key_format=S");
        let (s1, s2) = (Session::new(1), Session::new(2));

        let a = fx.acquire(&s1, "table:foo", AccessMode::Shared).unwrap();
        let b = fx.acquire(&s2, "table:foo", AccessMode::Shared).unwrap();
        assert_eq!(a.granted(), Grant::Shared);
        assert_eq!(a.config(), Some("key_format=S"));
        assert_eq!(a.handle().session_refs(), 2);
        assert_eq!(a.handle().session_inuse(), 2);

        let object = b.underlying().unwrap().downcast_ref::<MemoryObject>().unwrap();
        assert_eq!(object.generation, 0);

        let counters = fx.source.counters(a.handle().key());
        assert_eq!(counters.opens, 1);
        assert_eq!(counters.out_of_context, 0);
        assert!(s1.current_handle().is_none());

        let handle = Arc::clone(a.handle());
        drop(a);
        b.release().unwrap();
        assert_eq!(handle.session_refs(), 0);
        assert_eq!(handle.time_of_death(), Some(1_000));
        assert!(handle.status().is_open());
    }

    #[test]
    fn test_exclusive_busy_while_shared_held() {
        let fx = Fixture::new();
        let (reader, writer) = (Session::new(1), Session::new(2));

        let shared = fx.acquire(&reader, "table:foo", AccessMode::Shared).unwrap();
        let err = fx.acquire(&writer, "table:foo", AccessMode::Exclusive).unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(shared.handle().stats().busy, 1);
        assert_eq!(shared.handle().session_refs(), 1);
        drop(shared);

        let exclusive = fx.acquire(&writer, "table:foo", AccessMode::Exclusive).unwrap();
        assert_eq!(exclusive.handle().exclusive_refs(), 1);
        assert_eq!(exclusive.handle().exclusive_owner(), Some(2));

        let handle = Arc::clone(exclusive.handle());
        drop(exclusive);
        assert_eq!(handle.exclusive_refs(), 0);
        assert!(!handle.status().exclusive);
        assert_eq!(handle.exclusive_owner(), None);
    }

    #[test]
    fn test_lock_only_exclusive_skips_open() {
        let fx = Fixture::new();
        let session = Session::new(1);

        let access = fx.acquire(&session, "file:a.wt", AccessMode::LockOnlyExclusive).unwrap();
        assert!(access.is_exclusive());
        assert!(access.handle().status().lock_only);
        assert!(access.underlying().is_none());
        assert_eq!(fx.source.counters(access.handle().key()).opens, 0);
    }

    #[test]
    fn test_owner_gets_nested_grant() {
        let fx = Fixture::new();
        let session = Session::new(1);

        let outer = fx.acquire(&session, "table:foo", AccessMode::Exclusive).unwrap();
        let inner = fx.acquire(&session, "table:foo", AccessMode::Shared).unwrap();
        assert_eq!(inner.granted(), Grant::Exclusive);
        assert_eq!(outer.handle().exclusive_refs(), 2);
        assert!(inner.config().is_none());

        drop(inner);
        assert_eq!(outer.handle().exclusive_refs(), 1);
        assert!(outer.handle().status().exclusive);
        drop(outer);
    }

    #[test]
    fn test_discard_on_release_closes_source() {
        let fx = Fixture::new();
        let session = Session::new(1);

        let access = fx.acquire(&session, "table:foo", AccessMode::Exclusive).unwrap();
        access.mark_discard(false);
        let handle = Arc::clone(access.handle());
        access.release().unwrap();

        assert_eq!(handle.status().state, HandleState::Closed);
        assert!(handle.status().discard_on_release);
        let counters = fx.source.counters(handle.key());
        assert_eq!((counters.opens, counters.closes), (1, 1));
        assert_eq!(counters.out_of_context, 0);
    }

    #[test]
    fn test_reopen_cancels_pending_discard() {
        let fx = Fixture::new();
        let session = Session::new(1);

        let access = fx.acquire(&session, "table:foo", AccessMode::Exclusive).unwrap();
        access.mark_discard(false);
        drop(access);

        let reader = fx.acquire(&session, "table:foo", AccessMode::Shared).unwrap();
        let status = reader.handle().status();
        assert!(status.is_open());
        assert!(!status.discard_on_release);
        assert_eq!(fx.source.counters(reader.handle().key()).opens, 2);
    }

    #[test]
    fn test_walker_gets_busy_instead_of_waiting() {
        let fx = Fixture::new();
        let (walker, writer) = (Session::new(1), Session::new(2));
        drop(fx.acquire(&walker, "table:foo", AccessMode::Shared).unwrap());
        let exclusive = fx.acquire(&writer, "table:foo", AccessMode::Exclusive).unwrap();

        let list = fx.registry.read(&walker);
        let pin = list.find("table:foo", None).unwrap();
        for mode in [AccessMode::Shared, AccessMode::LockOnly] {
            let err = fx.arbiter.acquire(&walker, pin.clone(), mode).unwrap_err();
            assert!(err.is_retryable());
        }
        drop(exclusive);

        let access = fx.arbiter.acquire(&walker, pin, AccessMode::Shared).unwrap();
        assert_eq!(access.granted(), Grant::Shared);
        drop(access);
        drop(list);
    }

    #[test]
    #[should_panic(expected = "before its nested grants")]
    fn test_outer_release_before_nested_panics() {
        let fx = Fixture::new();
        let session = Session::new(1);
        let outer = fx.acquire(&session, "table:foo", AccessMode::Exclusive).unwrap();
        let _inner = fx.acquire(&session, "table:foo", AccessMode::Exclusive).unwrap();
        outer.release().unwrap();
    }

    #[test]
    fn test_unwinding_out_of_order_release_is_tolerated() {
        let fx = Fixture::new();
        let session = Session::new(1);
        let handle = Arc::clone(fx.pin(&session, "table:foo").handle());

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let outer = fx.acquire(&session, "table:foo", AccessMode::Exclusive).unwrap();
            let inner = fx.acquire(&session, "table:foo", AccessMode::Shared).unwrap();
            // Tuple fields drop first to last: outer before inner.
            let _held = (outer, inner);
            panic!("operation failed");
        }));

        assert!(result.is_err());
        assert_eq!(handle.exclusive_refs(), 0);
        assert!(!handle.status().exclusive);
        assert_eq!(handle.session_inuse(), 0);
        assert_eq!(handle.session_refs(), 0);
    }

    #[test]
    fn test_discard_and_kill_makes_pins_fail() {
        let fx = Fixture::new();
        let session = Session::new(1);

        let stale = fx.pin(&session, "table:foo");
        let access = fx.arbiter.acquire(&session, stale.clone(), AccessMode::Exclusive).unwrap();
        access.mark_discard(true);
        drop(access);

        assert_eq!(stale.status().state, HandleState::Dead);
        let err = fx.arbiter.acquire(&session, stale, AccessMode::Shared).unwrap_err();
        assert_eq!(err.as_handle_error(), Some(&HandleError::Dead("table:foo".to_string())));
    }

    #[test]
    fn test_dropped_rejects_every_mode() {
        let fx = Fixture::new();
        let session = Session::new(1);

        let access = fx.acquire(&session, "table:foo", AccessMode::LockOnlyExclusive).unwrap();
        access.mark_dropped().unwrap();
        let handle = Arc::clone(access.handle());
        drop(access);
        assert_eq!(handle.status().state, HandleState::Dropped);

        for mode in [AccessMode::Shared, AccessMode::Exclusive, AccessMode::LockOnly] {
            let err = fx
                .arbiter
                .acquire(&session, HandleRef::pin(&handle), mode)
                .unwrap_err();
            assert_eq!(err.code(), 3);
        }
        assert_eq!(handle.session_refs(), 0);
    }

    #[test]
    fn test_open_failure_leaves_handle_closed() {
        let fx = Fixture::new();
        let session = Session::new(1);
        fx.source.fail_opens("table:bad", "corrupt");

        let err = fx.acquire(&session, "table:bad", AccessMode::Shared).unwrap_err();
        assert!(matches!(err, Error::Handle(HandleError::OpenFailed { .. })));

        let pin = fx.pin(&session, "table:bad");
        assert_eq!(pin.status().state, HandleState::Closed);
        assert_eq!(pin.session_refs(), 1);
        assert_eq!(pin.session_inuse(), 0);

        fx.source.clear_failure("table:bad");
        let access = fx.arbiter.acquire(&session, pin, AccessMode::Shared).unwrap();
        assert!(access.handle().status().is_open());
    }

    #[test]
    fn test_lock_only_outcomes() {
        let fx = Fixture::new();
        let (s1, s2) = (Session::new(1), Session::new(2));

        // Closed and free: exclusive lock-only hold.
        let hold = fx.acquire(&s1, "table:foo", AccessMode::LockOnly).unwrap();
        assert_eq!(hold.granted(), Grant::Exclusive);
        assert!(hold.handle().status().lock_only);

        // Closed and held: busy.
        let err = fx.acquire(&s2, "table:foo", AccessMode::LockOnly).unwrap_err();
        assert!(err.is_retryable());
        drop(hold);

        // Open: shared.
        let reader = fx.acquire(&s1, "table:foo", AccessMode::Shared).unwrap();
        let hint = fx.acquire(&s2, "table:foo", AccessMode::LockOnly).unwrap();
        assert_eq!(hint.granted(), Grant::Shared);
        drop(reader);
        drop(hint);
    }

    #[test]
    fn test_new_use_clears_time_of_death() {
        let fx = Fixture::new();
        let session = Session::new(1);

        drop(fx.acquire(&session, "table:foo", AccessMode::Shared).unwrap());
        let pin = fx.pin(&session, "table:foo");
        assert_eq!(pin.time_of_death(), Some(1_000));

        fx.clock.advance(std::time::Duration::from_millis(500));
        let access = fx.arbiter.acquire(&session, pin, AccessMode::Shared).unwrap();
        assert_eq!(access.handle().time_of_death(), None);
        let handle = Arc::clone(access.handle());
        drop(access);
        assert_eq!(handle.time_of_death(), Some(1_500));
    }

    #[test]
    #[should_panic(expected = "requires exclusive access")]
    fn test_discard_under_shared_panics() {
        let fx = Fixture::new();
        let session = Session::new(1);
        let access = fx.acquire(&session, "table:foo", AccessMode::Shared).unwrap();
        access.mark_discard(false);
    }
}
