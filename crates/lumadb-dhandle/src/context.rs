//! Scoped "current handle" of a session
//!
//! Nested code frequently needs to run against a different handle than its
//! caller. A [`HandleScope`] swaps the session's slot on entry and puts the
//! previous value back when it is dropped, so the slot follows a strict stack
//! discipline on every exit path, unwinding included.

use std::sync::{Arc, Weak};

use crate::handle::DataHandle;
use crate::session::Session;

/// Guard restoring the session's previous current handle on drop
#[must_use = "the previous handle is restored as soon as the scope is dropped"]
pub struct HandleScope<'s> {
    session: &'s Session,
    saved: Option<Weak<DataHandle>>,
}

impl<'s> HandleScope<'s> {
    /// Make `handle` current until the returned scope is dropped
    pub fn enter(session: &'s Session, handle: Option<&Arc<DataHandle>>) -> Self {
        Self::enter_slot(session, handle.map(Arc::downgrade))
    }

    fn enter_slot(session: &'s Session, slot: Option<Weak<DataHandle>>) -> Self {
        let saved = session.replace_current(slot);
        Self { session, saved }
    }
}

impl Drop for HandleScope<'_> {
    fn drop(&mut self) {
        self.session.replace_current(self.saved.take());
    }
}

/// Run `body` with `handle` as the session's current handle
pub fn with_handle<R>(
    session: &Session,
    handle: Option<&Arc<DataHandle>>,
    body: impl FnOnce(&Session) -> R,
) -> R {
    let _scope = HandleScope::enter(session, handle);
    body(session)
}

/// Run `body` with no current handle
pub fn without_handle<R>(session: &Session, body: impl FnOnce(&Session) -> R) -> R {
    with_handle(session, None, body)
}

/// Run `body` and restore the current handle afterwards, even if `body`
/// reassigned it without restoring
pub fn save_handle<R>(session: &Session, body: impl FnOnce(&Session) -> R) -> R {
    let _scope = HandleScope::enter_slot(session, session.current_slot());
    body(session)
}
