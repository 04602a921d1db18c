//! Watcher engine for the inotify Linux API.
//!
//! inotify reports changes for exactly the directories it is told to watch,
//! so every registered root owns one watch descriptor on a process-wide
//! inotify instance. The engine thread polls the inotify file descriptor
//! together with a wakeup source, drains complete event batches, routes each
//! event to its watched root by descriptor and dispatches the classified
//! result. Registration and unregistration run on the caller's thread and
//! synchronize with event draining through the registry lock.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::fmt;
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use inotify::{EventMask, Inotify, WatchDescriptor, WatchMask, Watches};

use crate::lifecycle::{CallbackBridge, Termination};
use crate::{Callback, ChangeKind, Config, Error, ErrorKind, FileWatcher, Result, WatcherKind};

const INOTIFY: mio::Token = mio::Token(0);
const WAKEUP: mio::Token = mio::Token(1);

/// Watched roots must be directories; events for their direct children are
/// reported with the child name attached. `EXCL_UNLINK` keeps events for
/// already-unlinked children out of the stream.
fn event_mask() -> WatchMask {
    WatchMask::CREATE
        | WatchMask::DELETE
        | WatchMask::DELETE_SELF
        | WatchMask::EXCL_UNLINK
        | WatchMask::MODIFY
        | WatchMask::MOVE_SELF
        | WatchMask::MOVED_FROM
        | WatchMask::MOVED_TO
        | WatchMask::ONLYDIR
}

/// Maps an event mask to the change it represents, if any. Precedence
/// matters: a rename leg is a create/remove before anything else the mask
/// may also carry.
fn classify_event_mask(mask: EventMask) -> Option<ChangeKind> {
    if mask.intersects(EventMask::CREATE | EventMask::MOVED_TO) {
        Some(ChangeKind::Created)
    } else if mask.intersects(EventMask::DELETE | EventMask::DELETE_SELF | EventMask::MOVED_FROM) {
        Some(ChangeKind::Removed)
    } else if mask.intersects(EventMask::MODIFY) {
        Some(ChangeKind::Modified)
    } else {
        None
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum WatchPointStatus {
    /// The watch point is listening, events are expected to arrive.
    Listening,

    /// The watch point has been cancelled, an `IN_IGNORED` acknowledgment is
    /// expected.
    Cancelled,
}

#[derive(Debug, PartialEq, Eq)]
enum CancelOutcome {
    Cancelled,
    NotCancelled,
    AlreadyCancelled,
}

/// One kernel watch for one registered root.
struct WatchPoint {
    descriptor: WatchDescriptor,
    /// Handle onto the shared inotify instance; the instance stays open as
    /// long as any watch point or the engine holds a handle.
    watches: Watches,
    /// Inode of the root at registration time, for move detection.
    inode: u64,
    status: WatchPointStatus,
}

impl WatchPoint {
    fn cancel(&mut self, path: &Path) -> Result<CancelOutcome> {
        if self.status == WatchPointStatus::Cancelled {
            return Ok(CancelOutcome::AlreadyCancelled);
        }
        self.status = WatchPointStatus::Cancelled;
        match self.watches.clone().remove(self.descriptor.clone()) {
            Ok(()) => Ok(CancelOutcome::Cancelled),
            Err(err)
                if err.raw_os_error() == Some(libc::EINVAL)
                    || err.kind() == std::io::ErrorKind::InvalidInput =>
            {
                // The kernel already closed the watch, e.g. because the
                // directory was removed.
                log::info!("couldn't stop watching {}: {err}", path.display());
                Ok(CancelOutcome::NotCancelled)
            }
            Err(err) => Err(Error::io(err).add_path(path.to_path_buf())),
        }
    }
}

#[derive(Default)]
struct Registry {
    /// Watched root -> watch point. Keys are the exact paths supplied by the
    /// caller; nothing is canonicalized.
    watch_points: HashMap<PathBuf, WatchPoint>,
    /// Watch descriptor -> watched root, for event routing.
    watch_roots: HashMap<WatchDescriptor, PathBuf>,
    /// Descriptors unregistered so recently that in-flight events may still
    /// mention them; entries leave when their `IN_IGNORED` acknowledgment
    /// arrives.
    recently_unregistered: HashMap<WatchDescriptor, PathBuf>,
}

struct Shared {
    inotify: Mutex<Inotify>,
    watches: Watches,
    poll: Mutex<mio::Poll>,
    waker: mio::Waker,
    registry: Mutex<Registry>,
    callback: Mutex<CallbackBridge>,
    should_terminate: AtomicBool,
    running: AtomicBool,
    termination: Termination,
}

/// inotify-based watcher engine.
///
/// The value is a cheap clonable handle; clones share one engine. All
/// methods may be called from any thread except [`initialize_run_loop`] and
/// [`execute_run_loop`], which must be called on the thread that is to
/// become the engine thread.
///
/// [`initialize_run_loop`]: FileWatcher::initialize_run_loop
/// [`execute_run_loop`]: FileWatcher::execute_run_loop
#[derive(Clone)]
pub struct InotifyWatcher {
    shared: Arc<Shared>,
}

impl fmt::Debug for InotifyWatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InotifyWatcher").finish_non_exhaustive()
    }
}

impl InotifyWatcher {
    /// Creates the engine together with its shared inotify instance.
    ///
    /// Fails with [`ErrorKind::InstanceLimitTooLow`] when the per-user limit
    /// on inotify instances is exhausted.
    pub fn new<C: Callback>(callback: C, _config: Config) -> Result<Self> {
        #[allow(unused_mut)]
        let mut inotify = Inotify::init().map_err(|err| {
            if err.raw_os_error() == Some(libc::EMFILE) {
                Error::new(ErrorKind::InstanceLimitTooLow)
            } else {
                Error::io(err)
            }
        })?;
        let watches = inotify.watches();

        let poll = mio::Poll::new().map_err(Error::io)?;
        let waker = mio::Waker::new(poll.registry(), WAKEUP).map_err(Error::io)?;
        let inotify_fd = inotify.as_raw_fd();
        poll.registry()
            .register(
                &mut mio::unix::SourceFd(&inotify_fd),
                INOTIFY,
                mio::Interest::READABLE,
            )
            .map_err(Error::io)?;

        Ok(InotifyWatcher {
            shared: Arc::new(Shared {
                inotify: Mutex::new(inotify),
                watches,
                poll: Mutex::new(poll),
                waker,
                registry: Mutex::new(Registry::default()),
                callback: Mutex::new(CallbackBridge::new(Box::new(callback))),
                should_terminate: AtomicBool::new(false),
                running: AtomicBool::new(false),
                termination: Termination::new(),
            }),
        })
    }

    /// Cancels watches whose root no longer has the inode recorded at
    /// registration time and returns the affected paths.
    ///
    /// inotify does not report a watched directory being moved away, so a
    /// consumer that needs to notice whole-root moves calls this with the
    /// roots it cares about. Only the root inode is compared; moves deeper
    /// in the hierarchy are not detected. Paths that are not watched, or
    /// whose watch is no longer listening, are reported as dropped as well.
    pub fn stop_watching_moved_paths(&self, paths: &[PathBuf]) -> Result<Vec<PathBuf>> {
        let mut registry = self.shared.registry.lock().expect("registry lock poisoned");
        let mut dropped = Vec::new();
        for path in paths {
            let Some(watch_point) = registry.watch_points.get_mut(path) else {
                dropped.push(path.clone());
                continue;
            };
            if watch_point.status != WatchPointStatus::Listening {
                dropped.push(path.clone());
                continue;
            }
            if let Ok(metadata) = fs::symlink_metadata(path) {
                if metadata.ino() == watch_point.inode {
                    continue;
                }
            }
            dropped.push(path.clone());
            watch_point.cancel(path)?;
        }
        Ok(dropped)
    }
}

impl Shared {
    fn register_path(&self, registry: &mut Registry, path: &Path) -> Result<()> {
        if registry.watch_points.contains_key(path) {
            return Err(Error::already_watching().add_path(path.to_path_buf()));
        }
        let metadata = fs::symlink_metadata(path).map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                Error::path_not_found()
            } else {
                Error::io(err)
            }
            .add_path(path.to_path_buf())
        })?;

        let descriptor = self.watches.clone().add(path, event_mask()).map_err(|err| {
            if err.raw_os_error() == Some(libc::ENOSPC) {
                Error::new(ErrorKind::WatchLimitTooLow)
            } else if err.kind() == std::io::ErrorKind::NotFound {
                Error::path_not_found()
            } else {
                Error::io(err)
            }
            .add_path(path.to_path_buf())
        })?;

        if registry.watch_roots.contains_key(&descriptor) {
            // The kernel reuses the descriptor when the same inode is
            // watched under another registered path.
            return Err(Error::already_watching().add_path(path.to_path_buf()));
        }

        log::trace!("added inotify watch for {}", path.display());
        registry.watch_points.insert(
            path.to_path_buf(),
            WatchPoint {
                descriptor: descriptor.clone(),
                watches: self.watches.clone(),
                inode: metadata.ino(),
                status: WatchPointStatus::Listening,
            },
        );
        registry.watch_roots.insert(descriptor, path.to_path_buf());
        Ok(())
    }

    fn unregister_path(&self, registry: &mut Registry, path: &Path) -> Result<bool> {
        let Some(watch_point) = registry.watch_points.get_mut(path) else {
            log::info!("path is not watched: {}", path.display());
            return Ok(false);
        };
        let descriptor = watch_point.descriptor.clone();
        let outcome = watch_point.cancel(path)?;
        if outcome == CancelOutcome::AlreadyCancelled {
            return Ok(false);
        }
        registry
            .recently_unregistered
            .insert(descriptor.clone(), path.to_path_buf());
        registry.watch_roots.remove(&descriptor);
        registry.watch_points.remove(path);
        Ok(outcome == CancelOutcome::Cancelled)
    }

    fn run_loop(&self) -> Result<()> {
        let mut events = mio::Events::with_capacity(16);
        loop {
            let mut poll = self.poll.lock().expect("poll lock poisoned");
            match poll.poll(&mut events, None) {
                Err(ref err) if err.kind() == std::io::ErrorKind::Interrupted => {
                    // Interrupted by a signal; poll again.
                }
                Err(err) => return Err(Error::io(err)),
                Ok(()) => {}
            }
            drop(poll);

            for event in events.iter() {
                match event.token() {
                    WAKEUP => {
                        // Shutdown is the only wakeup source; the flag below
                        // decides whether to exit.
                    }
                    INOTIFY => {
                        if let Err(error) = self.handle_inotify() {
                            let mut callback =
                                self.callback.lock().expect("callback lock poisoned");
                            callback.failure(error.to_string());
                        }
                    }
                    _ => unreachable!(),
                }
            }

            if self.should_terminate.load(Ordering::SeqCst) {
                return Ok(());
            }
        }
    }

    fn handle_inotify(&self) -> Result<()> {
        let mut buffer = [0u8; 4096];
        loop {
            let mut inotify = self.inotify.lock().expect("inotify lock poisoned");
            match inotify.read_events(&mut buffer) {
                Ok(events) => {
                    let mut registry = self.registry.lock().expect("registry lock poisoned");
                    let mut callback = self.callback.lock().expect("callback lock poisoned");
                    let mut count = 0;
                    for event in events {
                        log::trace!("inotify event: {event:?}");
                        count += 1;
                        self.handle_event(&mut registry, &mut callback, event);
                    }
                    if count == 0 {
                        return Ok(());
                    }
                    log::debug!("processed {count} inotify events");
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => return Ok(()),
                Err(err) => return Err(Error::io(err)),
            }
        }
    }

    fn handle_event(
        &self,
        registry: &mut Registry,
        callback: &mut CallbackBridge,
        event: inotify::Event<&OsStr>,
    ) {
        let mask = event.mask;
        if mask.contains(EventMask::UNMOUNT) {
            return;
        }

        if mask.contains(EventMask::Q_OVERFLOW) {
            report_overflow_to_all(registry, callback);
            return;
        }

        let Some(root) = registry.watch_roots.get(&event.wd) else {
            match registry.recently_unregistered.get(&event.wd) {
                Some(path) => {
                    if mask.contains(EventMask::IGNORED) {
                        log::debug!(
                            "finished watching recently unregistered {}",
                            path.display()
                        );
                        registry.recently_unregistered.remove(&event.wd);
                    } else {
                        log::debug!(
                            "ignoring in-flight event for recently unregistered {}",
                            path.display()
                        );
                    }
                }
                None => log::info!("received event for unknown watch descriptor {:?}", event.wd),
            }
            return;
        };
        let root = root.clone();

        if mask.contains(EventMask::IGNORED) {
            // The kernel closed the watch on its own, e.g. because the root
            // was removed.
            log::debug!("finished watching {}", root.display());
            registry.watch_roots.remove(&event.wd);
            registry.watch_points.remove(&root);
            return;
        }

        let Some(watch_point) = registry.watch_points.get(&root) else {
            log::debug!("no watch point for routed root {}", root.display());
            return;
        };
        if watch_point.status != WatchPointStatus::Listening {
            log::debug!(
                "ignoring in-flight event for cancelled watch on {}",
                root.display()
            );
            return;
        }

        if self.should_terminate.load(Ordering::SeqCst) {
            log::debug!("ignoring event for {} during termination", root.display());
            return;
        }

        let path = match event.name {
            Some(name) if !name.is_empty() => root.join(name),
            _ => root,
        };
        match classify_event_mask(mask) {
            Some(kind) => callback.change_event(kind, path),
            None => {
                log::warn!("unknown event {mask:?} for {}", path.display());
                callback.unknown_event(path);
            }
        }
    }
}

fn report_overflow_to_all(registry: &Registry, callback: &mut CallbackBridge) {
    for path in registry.watch_points.keys() {
        callback.overflow(path.clone());
    }
}

impl FileWatcher for InotifyWatcher {
    fn register_paths(&self, paths: &[PathBuf]) -> Result<()> {
        let mut registry = self.shared.registry.lock().expect("registry lock poisoned");
        for path in paths {
            self.shared.register_path(&mut registry, path)?;
        }
        Ok(())
    }

    fn unregister_paths(&self, paths: &[PathBuf]) -> Result<bool> {
        let mut registry = self.shared.registry.lock().expect("registry lock poisoned");
        let mut success = true;
        for path in paths {
            success &= self.shared.unregister_path(&mut registry, path)?;
        }
        Ok(success)
    }

    fn initialize_run_loop(&self) -> Result<()> {
        Ok(())
    }

    fn execute_run_loop(&self) -> Result<()> {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            return Err(Error::generic("run loop is already executing"));
        }
        let result = self.shared.run_loop();
        if let Err(error) = &result {
            log::error!("run loop failed: {error}");
        }
        let mut callback = self.shared.callback.lock().expect("callback lock poisoned");
        self.shared.termination.complete(|| callback.termination());
        result
    }

    fn shutdown_run_loop(&self) -> Result<()> {
        self.shared.should_terminate.store(true, Ordering::SeqCst);
        self.shared.waker.wake().map_err(Error::io)
    }

    fn await_termination(&self, timeout: Duration) -> bool {
        self.shared.termination.wait(timeout)
    }

    fn kind() -> WatcherKind {
        WatcherKind::Inotify
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Notification;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Instant;

    const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

    fn watcher() -> (InotifyWatcher, mpsc::Receiver<Notification>) {
        let (tx, rx) = mpsc::channel();
        let watcher = InotifyWatcher::new(tx, Config::default()).expect("create watcher");
        (watcher, rx)
    }

    fn start_engine(watcher: &InotifyWatcher) -> thread::JoinHandle<Result<()>> {
        let engine = watcher.clone();
        thread::spawn(move || {
            engine.initialize_run_loop()?;
            engine.execute_run_loop()
        })
    }

    fn stop_engine(watcher: &InotifyWatcher, engine: thread::JoinHandle<Result<()>>) {
        watcher.shutdown_run_loop().expect("shutdown");
        assert!(watcher.await_termination(EVENT_TIMEOUT));
        engine.join().expect("engine thread").expect("run loop");
    }

    fn recv(rx: &mpsc::Receiver<Notification>) -> Notification {
        rx.recv_timeout(EVENT_TIMEOUT).expect("notification")
    }

    fn wait_until(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + EVENT_TIMEOUT;
        while !condition() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            thread::sleep(Duration::from_millis(10));
        }
    }

    fn watch_count(watcher: &InotifyWatcher) -> usize {
        let registry = watcher.shared.registry.lock().unwrap();
        assert_eq!(registry.watch_points.len(), registry.watch_roots.len());
        registry.watch_points.len()
    }

    #[test]
    fn watcher_is_send_and_sync() {
        fn check<T: Send + Sync>() {}
        check::<InotifyWatcher>();
    }

    #[test]
    fn registering_missing_path_fails_with_path_not_found() {
        let (watcher, _rx) = watcher();
        let result = watcher.register_paths(&[PathBuf::from("/some/non/existent/path")]);
        assert!(matches!(
            result,
            Err(Error {
                kind: ErrorKind::PathNotFound,
                ..
            })
        ));
        assert_eq!(watch_count(&watcher), 0);
    }

    #[test]
    fn duplicate_registration_fails_and_keeps_the_first_watch() {
        let tmpdir = tempfile::tempdir().unwrap();
        let (watcher, _rx) = watcher();
        let path = tmpdir.path().to_path_buf();

        watcher.register_paths(&[path.clone()]).expect("register");
        let result = watcher.register_paths(&[path.clone()]);
        assert!(matches!(
            result,
            Err(Error {
                kind: ErrorKind::AlreadyWatching,
                ..
            })
        ));

        assert_eq!(watch_count(&watcher), 1);
        assert_eq!(watcher.unregister_paths(&[path]).unwrap(), true);
        assert_eq!(watch_count(&watcher), 0);
    }

    #[test]
    fn partial_registration_keeps_earlier_paths() {
        let tmpdir = tempfile::tempdir().unwrap();
        let (watcher, _rx) = watcher();
        let good = tmpdir.path().to_path_buf();
        let missing = tmpdir.path().join("missing");

        let result = watcher.register_paths(&[good.clone(), missing]);
        assert!(result.is_err());
        assert_eq!(watch_count(&watcher), 1);
        assert!(watcher
            .shared
            .registry
            .lock()
            .unwrap()
            .watch_points
            .contains_key(&good));
    }

    #[test]
    fn unregistering_unwatched_path_returns_false() {
        let tmpdir = tempfile::tempdir().unwrap();
        let (watcher, _rx) = watcher();
        assert_eq!(
            watcher
                .unregister_paths(&[tmpdir.path().to_path_buf()])
                .unwrap(),
            false
        );
        assert_eq!(watch_count(&watcher), 0);
    }

    #[test]
    fn registry_size_tracks_registrations() {
        let first = tempfile::tempdir().unwrap();
        let second = tempfile::tempdir().unwrap();
        let (watcher, _rx) = watcher();

        watcher
            .register_paths(&[first.path().to_path_buf(), second.path().to_path_buf()])
            .expect("register");
        assert_eq!(watch_count(&watcher), 2);

        assert_eq!(
            watcher
                .unregister_paths(&[first.path().to_path_buf()])
                .unwrap(),
            true
        );
        assert_eq!(watch_count(&watcher), 1);

        // One watched, one unwatched: the overall result is false but the
        // watched path still goes away.
        assert_eq!(
            watcher
                .unregister_paths(&[first.path().to_path_buf(), second.path().to_path_buf()])
                .unwrap(),
            false
        );
        assert_eq!(watch_count(&watcher), 0);
    }

    #[test]
    fn create_file_reports_single_created_event() {
        let tmpdir = tempfile::tempdir().unwrap();
        let (watcher, rx) = watcher();
        let engine = start_engine(&watcher);

        watcher
            .register_paths(&[tmpdir.path().to_path_buf()])
            .expect("register");
        let path = tmpdir.path().join("a");
        fs::File::create(&path).expect("create");

        assert_eq!(
            recv(&rx),
            Notification::Change {
                kind: ChangeKind::Created,
                path: path.clone(),
            }
        );

        stop_engine(&watcher, engine);
        assert_eq!(recv(&rx), Notification::Termination);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn modify_file_reports_modified_event() {
        let tmpdir = tempfile::tempdir().unwrap();
        let path = tmpdir.path().join("entry");
        fs::write(&path, b"").expect("create");

        let (watcher, rx) = watcher();
        let engine = start_engine(&watcher);
        watcher
            .register_paths(&[tmpdir.path().to_path_buf()])
            .expect("register");

        fs::write(&path, b"123").expect("write");

        assert_eq!(
            recv(&rx),
            Notification::Change {
                kind: ChangeKind::Modified,
                path,
            }
        );
        stop_engine(&watcher, engine);
    }

    #[test]
    fn rename_reports_removed_then_created() {
        let tmpdir = tempfile::tempdir().unwrap();
        let from = tmpdir.path().join("a");
        let to = tmpdir.path().join("b");
        fs::write(&from, b"").expect("create");

        let (watcher, rx) = watcher();
        let engine = start_engine(&watcher);
        watcher
            .register_paths(&[tmpdir.path().to_path_buf()])
            .expect("register");

        fs::rename(&from, &to).expect("rename");

        assert_eq!(
            recv(&rx),
            Notification::Change {
                kind: ChangeKind::Removed,
                path: from,
            }
        );
        assert_eq!(
            recv(&rx),
            Notification::Change {
                kind: ChangeKind::Created,
                path: to,
            }
        );
        stop_engine(&watcher, engine);
    }

    #[test]
    fn removing_watched_directory_reports_removed_and_cleans_registry() {
        let tmpdir = tempfile::tempdir().unwrap();
        let watched = tmpdir.path().join("watched");
        fs::create_dir(&watched).expect("create dir");

        let (watcher, rx) = watcher();
        let engine = start_engine(&watcher);
        watcher
            .register_paths(&[watched.clone()])
            .expect("register");

        fs::remove_dir(&watched).expect("remove dir");

        assert_eq!(
            recv(&rx),
            Notification::Change {
                kind: ChangeKind::Removed,
                path: watched,
            }
        );
        // The kernel acknowledgment empties the registry without an explicit
        // unregister call.
        wait_until(|| watch_count(&watcher) == 0);
        stop_engine(&watcher, engine);
    }

    #[test]
    fn unregister_absorbs_in_flight_events() {
        let tmpdir = tempfile::tempdir().unwrap();
        let (watcher, rx) = watcher();

        watcher
            .register_paths(&[tmpdir.path().to_path_buf()])
            .expect("register");
        // Queue an event in the kernel before the engine starts draining,
        // then unregister so the event arrives for a dead descriptor.
        fs::File::create(tmpdir.path().join("a")).expect("create");
        assert_eq!(
            watcher
                .unregister_paths(&[tmpdir.path().to_path_buf()])
                .unwrap(),
            true
        );

        let engine = start_engine(&watcher);
        wait_until(|| {
            watcher
                .shared
                .registry
                .lock()
                .unwrap()
                .recently_unregistered
                .is_empty()
        });

        stop_engine(&watcher, engine);
        assert_eq!(recv(&rx), Notification::Termination);
        assert!(rx.try_recv().is_err(), "in-flight events must be dropped");
    }

    #[test]
    fn no_notification_after_termination() {
        let tmpdir = tempfile::tempdir().unwrap();
        let (watcher, rx) = watcher();
        let engine = start_engine(&watcher);
        watcher
            .register_paths(&[tmpdir.path().to_path_buf()])
            .expect("register");

        stop_engine(&watcher, engine);
        assert_eq!(recv(&rx), Notification::Termination);

        fs::File::create(tmpdir.path().join("late")).expect("create");
        thread::sleep(Duration::from_millis(100));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn overflow_fans_out_to_every_watched_root() {
        let first = tempfile::tempdir().unwrap();
        let second = tempfile::tempdir().unwrap();
        let (watcher, rx) = watcher();
        watcher
            .register_paths(&[first.path().to_path_buf(), second.path().to_path_buf()])
            .expect("register");

        {
            let registry = watcher.shared.registry.lock().unwrap();
            let mut callback = watcher.shared.callback.lock().unwrap();
            report_overflow_to_all(&registry, &mut callback);
        }

        let mut overflowed = vec![recv(&rx), recv(&rx)];
        overflowed.sort_by_key(|notification| match notification {
            Notification::Overflow { path } => path.clone(),
            other => panic!("expected overflow, got {other:?}"),
        });
        let mut expected = vec![
            Notification::Overflow {
                path: first.path().to_path_buf(),
            },
            Notification::Overflow {
                path: second.path().to_path_buf(),
            },
        ];
        expected.sort_by_key(|notification| match notification {
            Notification::Overflow { path } => path.clone(),
            _ => unreachable!(),
        });
        assert_eq!(overflowed, expected);
    }

    #[test]
    fn stop_watching_moved_paths_drops_the_moved_root() {
        let tmpdir = tempfile::tempdir().unwrap();
        let original = tmpdir.path().join("original");
        let moved = tmpdir.path().join("moved");
        fs::create_dir(&original).expect("create dir");

        let (watcher, _rx) = watcher();
        watcher
            .register_paths(&[original.clone()])
            .expect("register");

        assert_eq!(
            watcher.stop_watching_moved_paths(&[original.clone()]).unwrap(),
            Vec::<PathBuf>::new()
        );

        fs::rename(&original, &moved).expect("rename");
        assert_eq!(
            watcher.stop_watching_moved_paths(&[original.clone()]).unwrap(),
            vec![original.clone()]
        );

        // The watch is cancelled now, so unregistering reports failure.
        assert_eq!(watcher.unregister_paths(&[original]).unwrap(), false);
    }

    #[test]
    fn classify_create_and_moved_to_as_created() {
        assert_eq!(
            classify_event_mask(EventMask::CREATE),
            Some(ChangeKind::Created)
        );
        assert_eq!(
            classify_event_mask(EventMask::MOVED_TO),
            Some(ChangeKind::Created)
        );
        assert_eq!(
            classify_event_mask(EventMask::CREATE | EventMask::ISDIR),
            Some(ChangeKind::Created)
        );
    }

    #[test]
    fn classify_removal_masks_as_removed() {
        assert_eq!(
            classify_event_mask(EventMask::DELETE),
            Some(ChangeKind::Removed)
        );
        assert_eq!(
            classify_event_mask(EventMask::DELETE_SELF),
            Some(ChangeKind::Removed)
        );
        assert_eq!(
            classify_event_mask(EventMask::MOVED_FROM),
            Some(ChangeKind::Removed)
        );
    }

    #[test]
    fn classify_modify_as_modified_and_the_rest_as_unknown() {
        assert_eq!(
            classify_event_mask(EventMask::MODIFY),
            Some(ChangeKind::Modified)
        );
        assert_eq!(classify_event_mask(EventMask::ATTRIB), None);
        assert_eq!(classify_event_mask(EventMask::MOVE_SELF), None);
    }

    /// Runs manually.
    ///
    /// * Save the current limit: `MAX_USER_WATCHES=$(sysctl -n fs.inotify.max_user_watches)`
    /// * Set the limit to 1: `sudo sysctl fs.inotify.max_user_watches=1`
    /// * Run the test.
    /// * Restore the limit: `sudo sysctl fs.inotify.max_user_watches=$MAX_USER_WATCHES`
    #[test]
    #[ignore = "requires setting sysctl fs.inotify.max_user_watches=1"]
    fn second_registration_over_the_watch_limit_fails() {
        let first = tempfile::tempdir().unwrap();
        let second = tempfile::tempdir().unwrap();
        let (watcher, _rx) = watcher();

        watcher
            .register_paths(&[first.path().to_path_buf()])
            .expect("first registration fits the limit");
        let result = watcher.register_paths(&[second.path().to_path_buf()]);
        assert!(matches!(
            result,
            Err(Error {
                kind: ErrorKind::WatchLimitTooLow,
                ..
            })
        ));
        assert_eq!(watch_count(&watcher), 1);
    }
}
