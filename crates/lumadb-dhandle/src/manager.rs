//! Connection-level handle manager
//!
//! Ties the registry, arbiter and sweep together behind the operations the
//! catalog and checkpoint layers call.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, info, trace};

use lumadb_common::config::HandleConfig;
use lumadb_common::error::{Error, HandleError, Result};
use lumadb_common::metrics;

use crate::arbiter::{AccessArbiter, AccessMode, HandleAccess};
use crate::clock::{Clock, SystemClock};
use crate::context::with_handle;
use crate::handle::{HandleKey, HandleRef, HandleStatsSnapshot, METADATA_URI};
use crate::reaper::{Reaper, ReaperHandle, SweepStats, SWEEP_SESSION_ID};
use crate::registry::{HandleRegistry, SharedHandleList};
use crate::session::Session;
use crate::source::DataSource;

/// Entry point to the data handle layer
#[derive(Debug)]
pub struct HandleManager {
    registry: Arc<HandleRegistry>,
    arbiter: AccessArbiter,
    config: HandleConfig,
    next_session: AtomicU64,
}

impl HandleManager {
    pub fn new(config: HandleConfig, source: Arc<dyn DataSource>) -> Self {
        Self::with_clock(config, source, Arc::new(SystemClock))
    }

    pub fn with_clock(config: HandleConfig, source: Arc<dyn DataSource>, clock: Arc<dyn Clock>) -> Self {
        metrics::describe();
        Self {
            registry: Arc::new(HandleRegistry::new()),
            arbiter: AccessArbiter::new(source, clock),
            config,
            next_session: AtomicU64::new(SWEEP_SESSION_ID + 1),
        }
    }

    pub fn registry(&self) -> &Arc<HandleRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &HandleConfig {
        &self.config
    }

    /// New session with a unique id
    pub fn open_session(&self) -> Session {
        Session::new(self.next_session.fetch_add(1, Ordering::Relaxed))
    }

    fn resolve(&self, session: &Session, name: &str, checkpoint: Option<&str>) -> HandleRef {
        let found = self.registry.read(session).find(name, checkpoint);
        match found {
            Some(pin) => pin,
            None => self.registry.write(session).find_or_insert(name, checkpoint),
        }
    }

    /// Find the handle for `(name, checkpoint)`, creating it if needed, and
    /// acquire `mode` access on it
    pub fn find_or_open<'s>(
        &self,
        session: &'s Session,
        name: &str,
        checkpoint: Option<&str>,
        mode: AccessMode,
    ) -> Result<HandleAccess<'s>> {
        loop {
            let pin = self.resolve(session, name, checkpoint);
            match self.arbiter.acquire(session, pin, mode) {
                Err(Error::Handle(HandleError::Dead(_))) => {
                    trace!(name, "handle died during lookup, resolving again");
                }
                other => return other,
            }
        }
    }

    /// Acquire access on an already pinned handle
    pub fn acquire<'s>(&self, session: &'s Session, pin: HandleRef, mode: AccessMode) -> Result<HandleAccess<'s>> {
        self.arbiter.acquire(session, pin, mode)
    }

    /// Walk every registered handle under the shared registry lock
    pub fn iterate_all<'a>(&'a self, session: &'a Session) -> SharedHandleList<'a> {
        self.registry.read(session)
    }

    /// Mark `(name, checkpoint)` dropped. Dropping an already dropped object
    /// succeeds.
    pub fn drop_handle(&self, session: &Session, name: &str, checkpoint: Option<&str>) -> Result<()> {
        if name == METADATA_URI {
            return Err(HandleError::Protected(name.to_string()).into());
        }

        let pin = self.registry.write(session).find_or_insert(name, checkpoint);
        let mut access = match self.arbiter.acquire(session, pin, AccessMode::LockOnlyExclusive) {
            Ok(access) => access,
            Err(Error::Handle(HandleError::Dropped(_))) => return Ok(()),
            Err(e) => return Err(e),
        };
        access.close_source()?;
        access.mark_dropped()?;
        info!(handle = %access.handle().key(), "dropped data handle");
        access.release()
    }

    /// Close every handle of `name`, checkpoints included. With `mark_dead`
    /// the handles are never reused and the sweep discards them.
    pub fn close_all(&self, session: &Session, name: &str, mark_dead: bool) -> Result<()> {
        let pins: Vec<HandleRef> = self
            .registry
            .read(session)
            .filter(|pin| pin.name() == name)
            .collect();

        for pin in pins {
            let mut access = match self.arbiter.acquire(session, pin, AccessMode::LockOnlyExclusive) {
                Ok(access) => access,
                Err(Error::Handle(HandleError::Dead(_) | HandleError::Dropped(_))) => continue,
                Err(e) => return Err(e),
            };
            access.close_source()?;
            if mark_dead {
                access.mark_discard(true);
            }
            debug!(handle = %access.handle().key(), mark_dead, "closed data handle");
            access.release()?;
        }
        Ok(())
    }

    /// Run `f` under shared access for every open live handle whose name
    /// starts with `uri_prefix`, with the handle installed as the session's
    /// current handle. Returns the number of handles visited.
    pub fn apply_open<F>(&self, session: &Session, uri_prefix: Option<&str>, mut f: F) -> Result<usize>
    where
        F: FnMut(&Session, &HandleAccess<'_>) -> Result<()>,
    {
        let pins: Vec<HandleRef> = self
            .registry
            .read(session)
            .filter(|pin| {
                pin.status().is_open()
                    && pin.checkpoint().is_none()
                    && uri_prefix.map_or(true, |prefix| pin.name().starts_with(prefix))
            })
            .collect();

        let mut applied = 0;
        for pin in pins {
            let access = match self.arbiter.acquire(session, pin, AccessMode::Shared) {
                Ok(access) => access,
                Err(Error::Handle(HandleError::Dead(_) | HandleError::Dropped(_))) => continue,
                Err(e) => return Err(e),
            };
            with_handle(session, Some(access.handle()), |s| f(s, &access))?;
            applied += 1;
        }
        Ok(applied)
    }

    /// Counter snapshots of every registered handle
    pub fn handle_stats(&self, session: &Session) -> Vec<(HandleKey, HandleStatsSnapshot)> {
        self.registry
            .read(session)
            .map(|pin| (pin.key().clone(), pin.stats()))
            .collect()
    }

    fn reaper(&self) -> Reaper {
        Reaper::new(Arc::clone(&self.registry), self.arbiter.clone(), self.config.clone())
    }

    /// Run one sweep on the calling thread
    pub fn sweep_now(&self) -> SweepStats {
        self.reaper().sweep()
    }

    /// Start the periodic sweep on the current tokio runtime; `None` when
    /// the sweep is disabled
    pub fn start_sweep_server(&self) -> Option<ReaperHandle> {
        if !self.config.sweep_enabled {
            debug!("handle sweep disabled");
            return None;
        }
        Some(self.reaper().spawn())
    }

    /// Close and discard every handle, the metadata handle last. Fails with
    /// `Busy` if another session still uses a handle.
    pub fn shutdown(&self, session: &Session) -> Result<()> {
        let pins: Vec<HandleRef> = self.registry.read(session).collect();
        let (metadata, rest): (Vec<_>, Vec<_>) = pins.into_iter().partition(|pin| pin.is_metadata());

        for pin in rest.into_iter().chain(metadata) {
            self.close_and_discard(session, pin)?;
        }
        info!(remaining = self.registry.len(), "data handles shut down");
        Ok(())
    }

    fn close_and_discard(&self, session: &Session, pin: HandleRef) -> Result<()> {
        let handle = Arc::clone(pin.handle());
        match self.arbiter.acquire(session, pin, AccessMode::LockOnlyExclusive) {
            Ok(mut access) => {
                access.close_source()?;
                access.release()?;
            }
            Err(Error::Handle(HandleError::Dead(_) | HandleError::Dropped(_))) => {}
            Err(e) => return Err(e),
        }

        let mut list = self.registry.write(session);
        if list.try_discard(HandleRef::pin(&handle)) {
            Ok(())
        } else {
            Err(HandleError::Busy(handle.key().to_string()).into())
        }
    }
}
