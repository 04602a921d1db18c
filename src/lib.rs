//! Cross-platform file system change notification service.
//!
//! A watcher engine turns raw kernel change events into a small, coherent
//! event vocabulary and feeds it to a consumer-supplied [`Callback`]. One
//! engine exists per platform, each built on the native notification
//! primitive:
//!
//! - Linux: inotify
//! - macOS: FSEvents
//! - Windows: `ReadDirectoryChangesExW`
//!
//! All three share one lifecycle. The consumer constructs the engine,
//! dedicates a thread to it ([`FileWatcher::initialize_run_loop`] followed
//! by the blocking [`FileWatcher::execute_run_loop`]), and registers or
//! unregisters watched roots from any thread while the loop runs.
//! [`FileWatcher::shutdown_run_loop`] asks the loop to exit and
//! [`FileWatcher::await_termination`] waits for it; once it has returned
//! `true`, no further callback will be invoked and the engine can be
//! dropped.
//!
//! Event delivery is strictly single-threaded per engine and preserves
//! kernel order per watched root. There is no ordering guarantee across
//! distinct roots, no de-duplication, and no coalescing beyond what the
//! kernel itself provides.
//!
//! # Example
//!
//! ```no_run
//! use std::path::PathBuf;
//! use std::sync::mpsc;
//! use std::thread;
//! use std::time::Duration;
//!
//! use file_events::{recommended_watcher, Config, FileWatcher, Notification};
//!
//! fn main() -> file_events::Result<()> {
//!     let (tx, rx) = mpsc::channel();
//!     let watcher = recommended_watcher(tx, Config::default())?;
//!
//!     let engine = watcher.clone();
//!     let engine_thread = thread::spawn(move || {
//!         engine.initialize_run_loop()?;
//!         engine.execute_run_loop()
//!     });
//!
//!     watcher.register_paths(&[PathBuf::from("/tmp")])?;
//!     if let Ok(Notification::Change { kind, path }) = rx.recv() {
//!         println!("{kind}: {}", path.display());
//!     }
//!
//!     watcher.shutdown_run_loop()?;
//!     assert!(watcher.await_termination(Duration::from_secs(5)));
//!     engine_thread.join().unwrap()?;
//!     Ok(())
//! }
//! ```

#![deny(missing_docs)]

use std::path::PathBuf;
use std::time::Duration;

pub use crate::config::Config;
pub use crate::error::{Error, ErrorKind, Result};
pub use crate::event::{ChangeKind, Notification};

mod config;
mod error;
mod event;
mod lifecycle;
#[cfg(any(windows, test))]
mod longpaths;

#[cfg(target_os = "linux")]
pub mod inotify;
#[cfg(target_os = "linux")]
pub use crate::inotify::InotifyWatcher;

#[cfg(target_os = "macos")]
pub mod fsevent;
#[cfg(target_os = "macos")]
pub use crate::fsevent::FsEventsWatcher;

#[cfg(windows)]
pub mod windows;
#[cfg(windows)]
pub use crate::windows::ReadDirectoryChangesWatcher;

/// The sink an engine delivers notifications to; the consumer implements it.
///
/// All methods are invoked on the engine thread, in the order the engine
/// classified the events. Implementations should return quickly; a slow
/// callback stalls event draining. A panicking callback is caught, logged
/// and discarded by the engine, so misbehaving consumers cannot take the
/// run loop down.
pub trait Callback: Send + 'static {
    /// A classified change for `path`.
    fn report_change_event(&mut self, kind: ChangeKind, path: PathBuf);

    /// A kernel event for `path` that carried none of the known change
    /// semantics. The watch stays live.
    fn report_unknown_event(&mut self, path: PathBuf);

    /// The kernel dropped events for the watched root `path`; its contents
    /// must be rescanned. The watch stays live.
    fn report_overflow(&mut self, path: PathBuf);

    /// A non-fatal failure inside the engine loop. The loop continues.
    fn report_failure(&mut self, message: String);

    /// The run loop has finished. This is the last invocation the engine
    /// makes.
    fn report_termination(&mut self);
}

impl Callback for std::sync::mpsc::Sender<Notification> {
    fn report_change_event(&mut self, kind: ChangeKind, path: PathBuf) {
        let _ = self.send(Notification::Change { kind, path });
    }

    fn report_unknown_event(&mut self, path: PathBuf) {
        let _ = self.send(Notification::Unknown { path });
    }

    fn report_overflow(&mut self, path: PathBuf) {
        let _ = self.send(Notification::Overflow { path });
    }

    fn report_failure(&mut self, message: String) {
        let _ = self.send(Notification::Failure { message });
    }

    fn report_termination(&mut self) {
        let _ = self.send(Notification::Termination);
    }
}

impl Callback for crossbeam_channel::Sender<Notification> {
    fn report_change_event(&mut self, kind: ChangeKind, path: PathBuf) {
        let _ = self.send(Notification::Change { kind, path });
    }

    fn report_unknown_event(&mut self, path: PathBuf) {
        let _ = self.send(Notification::Unknown { path });
    }

    fn report_overflow(&mut self, path: PathBuf) {
        let _ = self.send(Notification::Overflow { path });
    }

    fn report_failure(&mut self, message: String) {
        let _ = self.send(Notification::Failure { message });
    }

    fn report_termination(&mut self) {
        let _ = self.send(Notification::Termination);
    }
}

/// Watcher kind enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum WatcherKind {
    /// inotify backend (Linux)
    Inotify,
    /// FSEvents backend (macOS)
    FsEvents,
    /// `ReadDirectoryChangesExW` backend (Windows)
    ReadDirectoryChanges,
}

/// The lifecycle and watch-set surface shared by every engine.
///
/// Engines are cheap clonable handles; a typical consumer clones one handle
/// into a dedicated engine thread and keeps another for control calls.
/// Except where noted, every operation may be called from any thread.
pub trait FileWatcher {
    /// Starts watching each path in `paths`.
    ///
    /// Paths are keyed exactly as supplied; nothing is canonicalized.
    /// Registering a path that is already watched fails with
    /// [`ErrorKind::AlreadyWatching`]. On error, paths registered by earlier
    /// iterations of the same call stay registered.
    fn register_paths(&self, paths: &[PathBuf]) -> Result<()>;

    /// Stops watching each path in `paths`.
    ///
    /// Returns `true` only if every path was watched and its kernel
    /// subscription was cancelled. Unwatched paths are logged and reported
    /// through the `false` return value, not an error.
    fn unregister_paths(&self, paths: &[PathBuf]) -> Result<bool>;

    /// Prepares the calling thread to run the engine loop. Must be called on
    /// the engine thread, before [`execute_run_loop`](Self::execute_run_loop).
    fn initialize_run_loop(&self) -> Result<()>;

    /// Runs the engine loop on the calling thread until shutdown, then
    /// reports termination and wakes
    /// [`await_termination`](Self::await_termination) waiters. A fatal loop
    /// error is returned after termination has been reported.
    fn execute_run_loop(&self) -> Result<()>;

    /// Asks the engine loop to exit. Does not wait for it to happen.
    fn shutdown_run_loop(&self) -> Result<()>;

    /// Waits for the engine loop to finish. Returns `true` when it has
    /// (after which no further callback will be invoked and the engine may
    /// be dropped), `false` when the timeout elapsed first.
    fn await_termination(&self, timeout: Duration) -> bool;

    /// Returns the engine kind, allowing backend-specific handling.
    fn kind() -> WatcherKind
    where
        Self: Sized;
}

/// The recommended `FileWatcher` implementation for the current platform
#[cfg(target_os = "linux")]
pub type RecommendedWatcher = InotifyWatcher;
/// The recommended `FileWatcher` implementation for the current platform
#[cfg(target_os = "macos")]
pub type RecommendedWatcher = FsEventsWatcher;
/// The recommended `FileWatcher` implementation for the current platform
#[cfg(windows)]
pub type RecommendedWatcher = ReadDirectoryChangesWatcher;

/// Convenience method for creating the [`RecommendedWatcher`] for the
/// current platform.
pub fn recommended_watcher<C>(callback: C, config: Config) -> Result<RecommendedWatcher>
where
    C: Callback,
{
    RecommendedWatcher::new(callback, config)
}
