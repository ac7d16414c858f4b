//! Idle handle sweep
//!
//! A sweep runs in two passes over the registry. The expire pass walks under
//! the shared registry lock and closes the data source of handles that have
//! been unused for longer than the idle threshold. The discard pass walks
//! under the exclusive lock and unlinks closed handles that are dead, dropped
//! or marked for discard. Both passes skip anything they cannot lock without
//! waiting; the next sweep picks it up.

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

use lumadb_common::config::HandleConfig;
use lumadb_common::metrics;
use lumadb_common::types::{SessionId, Timestamp};

use crate::arbiter::AccessArbiter;
use crate::handle::{HandleRef, HandleState};
use crate::registry::HandleRegistry;
use crate::session::Session;

/// Session id used by the sweep
pub const SWEEP_SESSION_ID: SessionId = 0;

/// Outcome of one sweep
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SweepStats {
    /// Handles looked at by the expire pass
    pub examined: u64,
    /// Idle handles whose data source was closed
    pub closed: u64,
    /// Handles unlinked from the registry
    pub removed: u64,
    /// Candidates skipped because another thread held them
    pub skipped_busy: u64,
}

/// Closes idle handles and discards dead ones
pub struct Reaper {
    registry: Arc<HandleRegistry>,
    arbiter: AccessArbiter,
    config: HandleConfig,
    session: Session,
}

impl Reaper {
    pub fn new(registry: Arc<HandleRegistry>, arbiter: AccessArbiter, config: HandleConfig) -> Self {
        Self {
            registry,
            arbiter,
            config,
            session: Session::new(SWEEP_SESSION_ID),
        }
    }

    /// Run one expire pass and one discard pass
    pub fn sweep(&self) -> SweepStats {
        let started = Instant::now();
        let now = self.arbiter.clock().now();
        let mut stats = SweepStats::default();

        self.expire(now, &mut stats);
        self.discard(&mut stats);

        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        metrics::record_sweep(stats.closed, stats.removed, elapsed_ms);
        if stats.closed > 0 || stats.removed > 0 {
            info!(
                closed = stats.closed,
                removed = stats.removed,
                skipped = stats.skipped_busy,
                elapsed_ms,
                "handle sweep complete"
            );
        } else {
            debug!(examined = stats.examined, elapsed_ms, "handle sweep found nothing to do");
        }
        stats
    }

    fn expire(&self, now: Timestamp, stats: &mut SweepStats) {
        let mut list = self.registry.read(&self.session);

        let open = list.by_ref().filter(|pin| pin.status().is_open()).count();
        if open < self.config.close_handle_minimum {
            trace!(open, minimum = self.config.close_handle_minimum, "too few open handles to expire");
            return;
        }

        list.rewind();
        for pin in &mut list {
            stats.examined += 1;
            if pin.is_metadata() || !pin.status().is_open() || !self.is_expired(&pin, now) {
                continue;
            }
            if self.close_idle(&pin, now) {
                stats.closed += 1;
            } else {
                stats.skipped_busy += 1;
            }
        }
    }

    /// Only the walker's own pin remains and the handle has been idle long enough
    fn is_expired(&self, pin: &HandleRef, now: Timestamp) -> bool {
        pin.session_refs() == 1 && pin.is_idle_since(now, self.config.close_idle_time_ms)
    }

    fn close_idle(&self, pin: &HandleRef, now: Timestamp) -> bool {
        let handle = pin.handle();
        let Some(_closing) = handle.close_guard.try_lock() else {
            trace!(handle = %handle.key(), "close already in progress");
            return false;
        };
        if !self.is_expired(pin, now) {
            return false;
        }
        let Some(mut slot) = handle.lock.try_write() else {
            return false;
        };
        // A reference may have appeared between the checks and the lock.
        if !self.is_expired(pin, now) || !slot.is_open() {
            return false;
        }

        if let Err(e) = self.arbiter.close_slot(&self.session, handle, &mut slot) {
            warn!(handle = %handle.key(), error = %e, "sweep failed to close idle handle");
        }
        debug!(handle = %handle.key(), "closed idle data handle");
        true
    }

    fn discard(&self, stats: &mut SweepStats) {
        let mut list = self.registry.write(&self.session);
        while let Some(pin) = list.next() {
            let status = pin.status();
            let discardable = !status.is_open()
                && !status.exclusive
                && (status.discard_on_release
                    || matches!(status.state, HandleState::Dead | HandleState::Dropped));
            if !discardable || pin.is_metadata() {
                continue;
            }
            if list.try_discard(pin) {
                stats.removed += 1;
            } else {
                stats.skipped_busy += 1;
            }
        }
    }

    /// Run the sweep every `close_scan_interval_ms` on the tokio runtime
    pub fn spawn(self) -> ReaperHandle {
        let (shutdown, mut shutdown_rx) = broadcast::channel(1);
        let period = self.config.scan_interval();
        info!(interval_ms = self.config.close_scan_interval_ms, "starting handle sweep server");

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.sweep();
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
            info!("handle sweep server stopped");
        });

        ReaperHandle { shutdown, task }
    }
}

/// Running sweep server
pub struct ReaperHandle {
    shutdown: broadcast::Sender<()>,
    task: JoinHandle<()>,
}

impl ReaperHandle {
    /// Signal the sweep server and wait for it to exit
    pub async fn stop(self) {
        let _ = self.shutdown.send(());
        if let Err(e) = self.task.await {
            warn!(error = %e, "handle sweep server exited abnormally");
        }
    }
}
