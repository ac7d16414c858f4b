//! LumaDB Data Handles
//!
//! Lifecycle and access arbitration for handles on named data sources:
//! - Handle registry with lock-owning, pin-as-you-go traversal
//! - Shared/exclusive access arbiter that answers `Busy` instead of waiting
//! - Sweep that lazily closes idle handles and discards dead ones
//! - Scoped "current handle" of a session

#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod arbiter;
pub mod clock;
pub mod context;
pub mod handle;
pub mod registry;
pub mod source;

mod manager;
mod reaper;
mod session;

pub use arbiter::{AccessArbiter, AccessMode, Grant, HandleAccess};
pub use clock::{Clock, ManualClock, SystemClock};
pub use context::{save_handle, with_handle, without_handle, HandleScope};
pub use handle::{
    DataHandle, HandleKey, HandleRef, HandleState, HandleStatsSnapshot, HandleStatus, HandleType,
    METADATA_URI,
};
pub use manager::HandleManager;
pub use reaper::{Reaper, ReaperHandle, SweepStats, SWEEP_SESSION_ID};
pub use registry::{ExclusiveHandleList, HandleList, HandleRegistry, SharedHandleList};
pub use session::Session;
pub use source::{DataSource, InMemorySource, MemoryObject, OpenedSource, SourceCounters, Underlying};
