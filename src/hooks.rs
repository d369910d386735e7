//! User callback types.
//!
//! Callbacks are `Rc<RefCell<..>>` so a set configured as a client-wide
//! default can be shared by every request, and so the driver can invoke
//! them while holding borrows of the connection they observe. Everything
//! is single-threaded; the driver never sends callbacks across threads.

use std::cell::RefCell;
use std::rc::Rc;

use crate::connection::Connection;
use crate::driver::UserCtx;

/// Error returned by a per-state hook. A failing hook moves its
/// connection straight to the user-action phase with an internal error.
pub type HookError = Box<dyn std::error::Error>;

/// Hook invoked on entry to an intermediate state, before any I/O work
/// for that state.
pub type StateHook = Rc<RefCell<dyn FnMut(&Connection) -> Result<(), HookError>>>;

/// Terminal callback, invoked exactly once per attempt chain when the
/// connection enters the user-action phase.
pub type TerminalFn = Rc<RefCell<dyn FnMut(&mut UserCtx<'_>)>>;

/// Wrap a closure as a per-state hook.
pub fn hook<F>(f: F) -> StateHook
where
    F: FnMut(&Connection) -> Result<(), HookError> + 'static,
{
    Rc::new(RefCell::new(f))
}

/// Wrap a closure as a terminal callback.
pub fn callback<F>(f: F) -> TerminalFn
where
    F: FnMut(&mut UserCtx<'_>) + 'static,
{
    Rc::new(RefCell::new(f))
}

/// Per-state hook set carried by a request.
#[derive(Clone, Default)]
pub struct Hooks {
    pub init: Option<StateHook>,
    pub connecting: Option<StateHook>,
    pub connected: Option<StateHook>,
    pub writing: Option<StateHook>,
    pub reading: Option<StateHook>,
}

impl Hooks {
    /// Merge with a default set: per-field, the request's hook wins.
    pub(crate) fn or_defaults(self, defaults: &Hooks) -> Hooks {
        Hooks {
            init: self.init.or_else(|| defaults.init.clone()),
            connecting: self.connecting.or_else(|| defaults.connecting.clone()),
            connected: self.connected.or_else(|| defaults.connected.clone()),
            writing: self.writing.or_else(|| defaults.writing.clone()),
            reading: self.reading.or_else(|| defaults.reading.clone()),
        }
    }
}
