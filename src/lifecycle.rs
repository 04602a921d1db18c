//! Engine lifecycle plumbing shared by all backends: the termination latch
//! behind `await_termination` and the bridge that serializes callback
//! dispatch.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use crate::{Callback, ChangeKind};

/// One-way latch flipped when the run loop finishes.
///
/// `complete` runs the termination report while holding the latch lock, so a
/// waiter that observes the latch set also observes every callback the
/// engine made before terminating.
pub(crate) struct Termination {
    terminated: Mutex<bool>,
    cond: Condvar,
}

impl Termination {
    pub(crate) fn new() -> Self {
        Termination {
            terminated: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    /// Marks the engine terminated, runs `report` under the latch lock and
    /// wakes all waiters.
    pub(crate) fn complete(&self, report: impl FnOnce()) {
        let mut terminated = self.terminated.lock().expect("termination lock poisoned");
        *terminated = true;
        report();
        self.cond.notify_all();
    }

    /// Waits for the engine to terminate. Returns `true` when the engine has
    /// finished, `false` when the timeout elapsed first.
    pub(crate) fn wait(&self, timeout: Duration) -> bool {
        let terminated = self.terminated.lock().expect("termination lock poisoned");
        let (terminated, _) = self
            .cond
            .wait_timeout_while(terminated, timeout, |terminated| !*terminated)
            .expect("termination lock poisoned");
        *terminated
    }
}

/// Serializes dispatch to the host callback and keeps host failures out of
/// the engine loop: a panicking callback is logged and swallowed, never
/// propagated.
pub(crate) struct CallbackBridge {
    callback: Box<dyn Callback>,
}

impl CallbackBridge {
    pub(crate) fn new(callback: Box<dyn Callback>) -> Self {
        CallbackBridge { callback }
    }

    pub(crate) fn change_event(&mut self, kind: ChangeKind, path: PathBuf) {
        self.dispatch(move |callback| callback.report_change_event(kind, path));
    }

    pub(crate) fn unknown_event(&mut self, path: PathBuf) {
        self.dispatch(move |callback| callback.report_unknown_event(path));
    }

    pub(crate) fn overflow(&mut self, path: PathBuf) {
        log::info!("detected overflow for {}", path.display());
        self.dispatch(move |callback| callback.report_overflow(path));
    }

    pub(crate) fn failure(&mut self, message: String) {
        self.dispatch(move |callback| callback.report_failure(message));
    }

    pub(crate) fn termination(&mut self) {
        self.dispatch(|callback| callback.report_termination());
    }

    fn dispatch(&mut self, notify: impl FnOnce(&mut dyn Callback)) {
        let callback = &mut *self.callback;
        if let Err(panic) = catch_unwind(AssertUnwindSafe(move || notify(callback))) {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| (*s).to_owned())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".to_owned());
            log::error!("watcher callback panicked: {message}");
        }
    }
}
