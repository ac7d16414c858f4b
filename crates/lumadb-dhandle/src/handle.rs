//! Data handle record
//!
//! One [`DataHandle`] exists per `(name, checkpoint)` pair. It carries the
//! reference counts the rest of the layer arbitrates on, the lifecycle state,
//! the per-handle lock protecting the open data source and the close guard
//! that serializes closing it.

use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicI32, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use lumadb_common::error::HandleError;
use lumadb_common::types::{SessionId, Timestamp};

use crate::session::Session;
use crate::source::Underlying;

/// URI of the metadata object. Its handle is never swept or dropped.
pub const METADATA_URI: &str = "metadata:";

const NO_TIME: Timestamp = Timestamp::MIN;

/// Identity of a handle
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct HandleKey {
    /// Object name as a URI
    pub name: String,
    /// Checkpoint name, `None` for the live object
    pub checkpoint: Option<String>,
}

impl HandleKey {
    pub fn new(name: &str, checkpoint: Option<&str>) -> Self {
        Self {
            name: name.to_string(),
            checkpoint: checkpoint.map(str::to_string),
        }
    }

    pub fn matches(&self, name: &str, checkpoint: Option<&str>) -> bool {
        self.name == name && self.checkpoint.as_deref() == checkpoint
    }
}

impl fmt::Display for HandleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.checkpoint {
            Some(checkpoint) => write!(f, "{} (checkpoint {checkpoint})", self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// Kind of object behind a handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum HandleType {
    Btree,
    Table,
}

impl HandleType {
    pub fn from_uri(name: &str) -> Self {
        if name.starts_with("table:") {
            HandleType::Table
        } else {
            HandleType::Btree
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            HandleType::Btree => "btree",
            HandleType::Table => "table",
        }
    }
}

/// Lifecycle state of a handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum HandleState {
    /// Registered, data source not open
    Closed,
    /// Data source open
    Open,
    /// Awaiting discard; never handed out again
    Dead,
    /// Object dropped; never reopened
    Dropped,
}

/// Lifecycle state plus the orthogonal flags of a handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HandleStatus {
    pub state: HandleState,
    /// Exclusive access is held
    pub exclusive: bool,
    /// Exclusive holder, set iff `exclusive`
    pub owner: Option<SessionId>,
    /// Close the data source when the exclusive hold is released
    pub discard_on_release: bool,
    /// Mark the handle dead when it is discarded
    pub discard_and_kill: bool,
    /// Exclusive hold taken only as a lock, without opening the source
    pub lock_only: bool,
}

type Rule = (&'static str, fn(&HandleStatus, bool) -> bool);

/// Legal flag combinations; the bool argument is `is_metadata`.
const RULES: &[Rule] = &[
    ("exclusive hold without an owner", |s: &HandleStatus, _: bool| {
        s.exclusive == s.owner.is_some()
    }),
    ("discard-and-kill without discard-on-release", |s: &HandleStatus, _: bool| {
        !s.discard_and_kill || s.discard_on_release
    }),
    ("lock-only hint without an exclusive hold", |s: &HandleStatus, _: bool| {
        !s.lock_only || s.exclusive
    }),
    ("dropped handle not marked for discard", |s: &HandleStatus, _: bool| {
        s.state != HandleState::Dropped || s.discard_on_release
    }),
    ("metadata handle dropped", |s: &HandleStatus, is_metadata: bool| {
        !(is_metadata && s.state == HandleState::Dropped)
    }),
];

impl HandleStatus {
    const fn closed() -> Self {
        Self {
            state: HandleState::Closed,
            exclusive: false,
            owner: None,
            discard_on_release: false,
            discard_and_kill: false,
            lock_only: false,
        }
    }

    pub fn is_open(&self) -> bool {
        self.state == HandleState::Open
    }

    /// Dead, or neither open nor exclusively held
    pub fn is_inactive(&self) -> bool {
        self.state == HandleState::Dead || (!self.is_open() && !self.exclusive)
    }

    pub fn can_reopen(&self) -> bool {
        !self.is_inactive() && self.is_open() && self.state != HandleState::Dropped
    }

    /// Error for handles that must not be handed out
    pub fn check_usable(&self, key: &HandleKey) -> Result<(), HandleError> {
        match self.state {
            HandleState::Dropped => Err(HandleError::Dropped(key.to_string())),
            HandleState::Dead => Err(HandleError::Dead(key.to_string())),
            HandleState::Closed | HandleState::Open => Ok(()),
        }
    }

    /// First rule of the legal-combination table this status breaks
    pub fn violation(&self, is_metadata: bool) -> Option<&'static str> {
        RULES
            .iter()
            .find(|(_, legal)| !legal(self, is_metadata))
            .map(|(rule, _)| *rule)
    }
}

/// Data source slot guarded by the handle lock
#[derive(Default)]
pub struct SourceSlot {
    pub(crate) config: Option<String>,
    pub(crate) underlying: Option<Underlying>,
}

impl SourceSlot {
    pub fn is_open(&self) -> bool {
        self.underlying.is_some()
    }

    pub fn config(&self) -> Option<&str> {
        self.config.as_deref()
    }

    pub fn underlying(&self) -> Option<&Underlying> {
        self.underlying.as_ref()
    }

    pub fn underlying_mut(&mut self) -> Option<&mut Underlying> {
        self.underlying.as_mut()
    }
}

impl fmt::Debug for SourceSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceSlot")
            .field("config", &self.config)
            .field("open", &self.is_open())
            .finish()
    }
}

/// Per-handle counters, increment only
#[derive(Debug, Default)]
pub struct HandleStats {
    opens: AtomicU64,
    closes: AtomicU64,
    shared_grants: AtomicU64,
    exclusive_grants: AtomicU64,
    busy: AtomicU64,
}

/// Point-in-time copy of [`HandleStats`]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HandleStatsSnapshot {
    pub opens: u64,
    pub closes: u64,
    pub shared_grants: u64,
    pub exclusive_grants: u64,
    pub busy: u64,
}

impl HandleStats {
    pub(crate) fn record_open(&self) {
        self.opens.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_close(&self) {
        self.closes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_shared(&self) {
        self.shared_grants.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_exclusive(&self) {
        self.exclusive_grants.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_busy(&self) {
        self.busy.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> HandleStatsSnapshot {
        HandleStatsSnapshot {
            opens: self.opens.load(Ordering::Relaxed),
            closes: self.closes.load(Ordering::Relaxed),
            shared_grants: self.shared_grants.load(Ordering::Relaxed),
            exclusive_grants: self.exclusive_grants.load(Ordering::Relaxed),
            busy: self.busy.load(Ordering::Relaxed),
        }
    }
}

/// A handle for a named data source
pub struct DataHandle {
    key: HandleKey,
    name_hash: u64,
    /// Position in the registry's traversal order
    seq: u64,
    handle_type: HandleType,
    is_metadata: bool,

    /// Sessions referencing this handle
    session_ref: AtomicU32,
    /// Access grants currently in use
    session_inuse: AtomicI32,
    /// Exclusive grants held by the owner
    excl_ref: AtomicU32,
    /// When `session_inuse` last went to 0
    timeofdeath: AtomicI64,

    status: Mutex<HandleStatus>,
    pub(crate) lock: Arc<RwLock<SourceSlot>>,
    pub(crate) close_guard: Mutex<()>,
    stats: HandleStats,
}

impl DataHandle {
    pub(crate) fn new(key: HandleKey, seq: u64) -> Self {
        let name_hash = name_hash(&key.name);
        Self::with_hash(key, seq, name_hash)
    }

    pub(crate) fn with_hash(key: HandleKey, seq: u64, name_hash: u64) -> Self {
        let handle_type = HandleType::from_uri(&key.name);
        let is_metadata = key.name == METADATA_URI;
        Self {
            key,
            name_hash,
            seq,
            handle_type,
            is_metadata,
            session_ref: AtomicU32::new(0),
            session_inuse: AtomicI32::new(0),
            excl_ref: AtomicU32::new(0),
            timeofdeath: AtomicI64::new(NO_TIME),
            status: Mutex::new(HandleStatus::closed()),
            lock: Arc::new(RwLock::new(SourceSlot::default())),
            close_guard: Mutex::new(()),
            stats: HandleStats::default(),
        }
    }

    pub fn key(&self) -> &HandleKey {
        &self.key
    }

    pub fn name(&self) -> &str {
        &self.key.name
    }

    pub fn checkpoint(&self) -> Option<&str> {
        self.key.checkpoint.as_deref()
    }

    pub fn name_hash(&self) -> u64 {
        self.name_hash
    }

    pub(crate) fn seq(&self) -> u64 {
        self.seq
    }

    pub fn handle_type(&self) -> HandleType {
        self.handle_type
    }

    pub fn is_metadata(&self) -> bool {
        self.is_metadata
    }

    pub fn session_refs(&self) -> u32 {
        self.session_ref.load(Ordering::Acquire)
    }

    pub fn session_inuse(&self) -> i32 {
        self.session_inuse.load(Ordering::Acquire)
    }

    pub fn exclusive_refs(&self) -> u32 {
        self.excl_ref.load(Ordering::Acquire)
    }

    pub fn exclusive_owner(&self) -> Option<SessionId> {
        self.status.lock().owner
    }

    /// When the handle last became unused; `None` while in use or never used
    pub fn time_of_death(&self) -> Option<Timestamp> {
        match self.timeofdeath.load(Ordering::Acquire) {
            NO_TIME => None,
            at => Some(at),
        }
    }

    pub fn status(&self) -> HandleStatus {
        *self.status.lock()
    }

    pub fn is_inactive(&self) -> bool {
        self.status().is_inactive()
    }

    /// Whether `session` could reuse the open data source as is
    pub fn can_reopen(&self, session: &Session) -> bool {
        let status = self.status();
        status.can_reopen() && status.owner.map_or(true, |owner| owner == session.id())
    }

    pub fn stats(&self) -> HandleStatsSnapshot {
        self.stats.snapshot()
    }

    pub(crate) fn counters(&self) -> &HandleStats {
        &self.stats
    }

    /// Apply a state transition, asserting the result is a legal combination
    pub(crate) fn update_status(&self, f: impl FnOnce(&mut HandleStatus)) -> HandleStatus {
        let mut status = self.status.lock();
        let mut next = *status;
        f(&mut next);
        if let Some(rule) = next.violation(self.is_metadata) {
            panic!("illegal state for handle {}: {rule} ({next:?})", self.key);
        }
        *status = next;
        next
    }

    pub(crate) fn acquire_ref(&self) {
        self.session_ref.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn release_ref(&self) {
        let released = Self::decrement(&self.session_ref);
        assert!(released.is_some(), "session reference of {} released below zero", self.key);
    }

    /// Count an access grant; a new use supersedes the previous time of death
    pub(crate) fn begin_use(&self) {
        if self.session_inuse.fetch_add(1, Ordering::AcqRel) == 0 {
            self.timeofdeath.store(NO_TIME, Ordering::Release);
        }
    }

    pub(crate) fn end_use(&self, now: Timestamp) {
        let prev = self
            .session_inuse
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n > 0).then_some(n - 1));
        assert!(prev.is_ok(), "in-use count of {} released below zero", self.key);
        if prev == Ok(1) {
            self.timeofdeath.store(now, Ordering::Release);
        }
    }

    pub(crate) fn add_exclusive_ref(&self) -> u32 {
        self.excl_ref.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn remove_exclusive_ref(&self) -> u32 {
        match Self::decrement(&self.excl_ref) {
            Some(remaining) => remaining,
            None => panic!("exclusive reference of {} released below zero", self.key),
        }
    }

    /// Decrement without wrapping; `None` if the count is already zero
    fn decrement(count: &AtomicU32) -> Option<u32> {
        count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .ok()
            .map(|prev| prev - 1)
    }

    /// Unused for at least `threshold_ms` as of `now`
    pub(crate) fn is_idle_since(&self, now: Timestamp, threshold_ms: u64) -> bool {
        if self.session_inuse() != 0 || self.exclusive_refs() != 0 {
            return false;
        }
        let threshold = i64::try_from(threshold_ms).unwrap_or(i64::MAX);
        self.time_of_death()
            .is_some_and(|died| now.saturating_sub(died) >= threshold)
    }
}

impl fmt::Debug for DataHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataHandle")
            .field("key", &self.key)
            .field("type", &self.handle_type)
            .field("status", &self.status())
            .field("session_ref", &self.session_refs())
            .field("session_inuse", &self.session_inuse())
            .field("excl_ref", &self.exclusive_refs())
            .field("timeofdeath", &self.time_of_death())
            .finish_non_exhaustive()
    }
}

pub(crate) fn name_hash(name: &str) -> u64 {
    xxhash_rust::xxh3::xxh3_64(name.as_bytes())
}

/// Counted reference to a registered handle.
///
/// Holding a `HandleRef` keeps `session_ref` raised, which stops the sweep
/// and registry removal from discarding the handle. Dropping it releases the
/// reference.
pub struct HandleRef {
    handle: Arc<DataHandle>,
}

impl HandleRef {
    pub(crate) fn pin(handle: &Arc<DataHandle>) -> Self {
        handle.acquire_ref();
        Self {
            handle: Arc::clone(handle),
        }
    }

    pub fn handle(&self) -> &Arc<DataHandle> {
        &self.handle
    }

    /// Release the reference, keeping the allocation reachable
    pub(crate) fn unpin(self) -> Arc<DataHandle> {
        let handle = Arc::clone(&self.handle);
        drop(self);
        handle
    }
}

impl Deref for HandleRef {
    type Target = DataHandle;

    fn deref(&self) -> &DataHandle {
        &self.handle
    }
}

impl Clone for HandleRef {
    fn clone(&self) -> Self {
        Self::pin(&self.handle)
    }
}

impl Drop for HandleRef {
    fn drop(&mut self) {
        self.handle.release_ref();
    }
}

impl fmt::Debug for HandleRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("HandleRef").field(&self.handle.key).finish()
    }
}
