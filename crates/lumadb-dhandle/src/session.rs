//! Per-session state consumed by the handle layer

use std::cell::{Cell, RefCell};
use std::sync::{Arc, Weak};

use lumadb_common::types::SessionId;

use crate::handle::DataHandle;

/// A single-threaded session.
///
/// The handle layer only needs three things from a session: an identity used
/// as the exclusive owner token, the "current handle" slot, and a flag
/// recording whether the session holds the registry lock.
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    current: RefCell<Option<Weak<DataHandle>>>,
    handle_list_locked: Cell<bool>,
}

impl Session {
    pub fn new(id: SessionId) -> Self {
        Self {
            id,
            current: RefCell::new(None),
            handle_list_locked: Cell::new(false),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    /// The handle the session is currently operating against, if it is still alive
    pub fn current_handle(&self) -> Option<Arc<DataHandle>> {
        self.current.borrow().as_ref().and_then(Weak::upgrade)
    }

    /// Whether the session currently holds the registry lock
    pub fn holds_handle_list_lock(&self) -> bool {
        self.handle_list_locked.get()
    }

    pub(crate) fn current_slot(&self) -> Option<Weak<DataHandle>> {
        self.current.borrow().clone()
    }

    pub(crate) fn replace_current(&self, handle: Option<Weak<DataHandle>>) -> Option<Weak<DataHandle>> {
        self.current.replace(handle)
    }

    pub(crate) fn set_handle_list_locked(&self, locked: bool) {
        self.handle_list_locked.set(locked);
    }
}
