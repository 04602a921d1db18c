//! Watcher engine for the macOS FSEvents API.
//!
//! FSEvents delivers coalesced change notifications for whole directory
//! hierarchies. Each registered root owns one `FSEventStream` bound to the
//! engine's serial dispatch queue. The dispatch queue side is a pure
//! producer: it transcribes raw events into the engine's event queue and
//! nothing else. The engine thread is the pure consumer that classifies and
//! dispatches, and a poison pill item ends it. This split keeps callback
//! dispatch single-threaded while the kernel delivers on a thread the
//! system owns.

#![allow(non_upper_case_globals)]

use std::collections::HashMap;
use std::ffi::{c_void, CStr};
use std::fmt;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::slice;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};
use dispatch2::{DispatchQueue, DispatchRetained};
use objc2_core_foundation as cf;
use objc2_core_services as fs;

use crate::lifecycle::{CallbackBridge, Termination};
use crate::{Callback, ChangeKind, Config, Error, FileWatcher, Result, WatcherKind};

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct StreamFlags: u32 {
        const MUST_SCAN_SUBDIRS = fs::kFSEventStreamEventFlagMustScanSubDirs;
        const USER_DROPPED = fs::kFSEventStreamEventFlagUserDropped;
        const KERNEL_DROPPED = fs::kFSEventStreamEventFlagKernelDropped;
        const IDS_WRAPPED = fs::kFSEventStreamEventFlagEventIdsWrapped;
        const HISTORY_DONE = fs::kFSEventStreamEventFlagHistoryDone;
        const ROOT_CHANGED = fs::kFSEventStreamEventFlagRootChanged;
        const MOUNT = fs::kFSEventStreamEventFlagMount;
        const UNMOUNT = fs::kFSEventStreamEventFlagUnmount;
        const ITEM_CREATED = fs::kFSEventStreamEventFlagItemCreated;
        const ITEM_REMOVED = fs::kFSEventStreamEventFlagItemRemoved;
        const INODE_META_MOD = fs::kFSEventStreamEventFlagItemInodeMetaMod;
        const ITEM_RENAMED = fs::kFSEventStreamEventFlagItemRenamed;
        const ITEM_MODIFIED = fs::kFSEventStreamEventFlagItemModified;
        const FINDER_INFO_MOD = fs::kFSEventStreamEventFlagItemFinderInfoMod;
        const ITEM_CHANGE_OWNER = fs::kFSEventStreamEventFlagItemChangeOwner;
        const ITEM_XATTR_MOD = fs::kFSEventStreamEventFlagItemXattrMod;
        const IS_FILE = fs::kFSEventStreamEventFlagItemIsFile;
        const IS_DIR = fs::kFSEventStreamEventFlagItemIsDir;
        const IS_SYMLINK = fs::kFSEventStreamEventFlagItemIsSymlink;
        const OWN_EVENT = fs::kFSEventStreamEventFlagOwnEvent;
        const IS_HARDLINK = fs::kFSEventStreamEventFlagItemIsHardlink;
        const IS_LAST_HARDLINK = fs::kFSEventStreamEventFlagItemIsLastHardlink;
        const ITEM_CLONED = fs::kFSEventStreamEventFlagItemCloned;
    }
}

/// Flags that never carry a change on their own. An event whose flags are a
/// subset of this set is dropped; flags outside this set that match none of
/// the classification rules are reported as unknown.
const IGNORED_FLAGS: StreamFlags = StreamFlags::USER_DROPPED
    .union(StreamFlags::KERNEL_DROPPED)
    .union(StreamFlags::IDS_WRAPPED)
    .union(StreamFlags::HISTORY_DONE)
    .union(StreamFlags::IS_FILE)
    .union(StreamFlags::IS_DIR)
    .union(StreamFlags::IS_SYMLINK)
    .union(StreamFlags::OWN_EVENT)
    .union(StreamFlags::IS_HARDLINK)
    .union(StreamFlags::IS_LAST_HARDLINK)
    .union(StreamFlags::ITEM_CLONED);

#[derive(Debug, PartialEq, Eq)]
enum Classification {
    Change(ChangeKind),
    Overflow,
    Unknown,
    Ignored,
}

/// Classifies a raw flag set. The order of the checks is part of the
/// contract: earlier rules win over later ones when a mask carries several
/// semantic bits at once.
fn classify_stream_flags(flags: StreamFlags) -> Classification {
    if IGNORED_FLAGS.contains(flags) {
        return Classification::Ignored;
    }
    if flags.contains(StreamFlags::MUST_SCAN_SUBDIRS) {
        return Classification::Overflow;
    }
    if flags.intersects(StreamFlags::ROOT_CHANGED | StreamFlags::MOUNT | StreamFlags::UNMOUNT) {
        return Classification::Change(ChangeKind::Invalidated);
    }
    if flags.contains(StreamFlags::ITEM_RENAMED) {
        // The rename leg that also carries ItemCreated is the side where the
        // name vanished; the bare ItemRenamed leg is where it appeared.
        return Classification::Change(if flags.contains(StreamFlags::ITEM_CREATED) {
            ChangeKind::Removed
        } else {
            ChangeKind::Created
        });
    }
    if flags.contains(StreamFlags::ITEM_MODIFIED) {
        return Classification::Change(ChangeKind::Modified);
    }
    if flags.contains(StreamFlags::ITEM_REMOVED) {
        return Classification::Change(ChangeKind::Removed);
    }
    if flags.intersects(
        StreamFlags::INODE_META_MOD
            | StreamFlags::FINDER_INFO_MOD
            | StreamFlags::ITEM_CHANGE_OWNER
            | StreamFlags::ITEM_XATTR_MOD,
    ) {
        return Classification::Change(ChangeKind::Modified);
    }
    if flags.contains(StreamFlags::ITEM_CREATED) {
        return Classification::Change(ChangeKind::Created);
    }
    Classification::Unknown
}

/// Upper bound on raw events buffered between the dispatch queue and the
/// engine thread. Producers block when it is reached; the consumer keeps
/// draining until the poison pill, so the queue always empties.
const EVENT_QUEUE_CAPACITY: usize = 4096;

struct RawEvent {
    path: PathBuf,
    flags: u32,
    id: u64,
}

enum QueueItem {
    Event(RawEvent),
    Failure(String),
    PoisonPill,
}

/// Context handed to the stream callback. Leaked at stream creation and
/// reclaimed by `release_context` when the stream is deallocated.
struct StreamContext {
    events: Sender<QueueItem>,
}

unsafe extern "C-unwind" fn release_context(info: *const c_void) {
    // Safety: FSEvents calls `release` exactly once, when the stream is
    // deallocated, so the box can be reclaimed here.
    unsafe {
        drop(Box::from_raw(info as *mut StreamContext));
    }
}

unsafe extern "C-unwind" fn stream_callback(
    _stream: fs::ConstFSEventStreamRef,
    info: *mut c_void,
    num_events: usize,
    event_paths: NonNull<c_void>,
    event_flags: NonNull<fs::FSEventStreamEventFlags>,
    event_ids: NonNull<fs::FSEventStreamEventId>,
) {
    let context = unsafe { &*(info as *const StreamContext) };
    let paths = unsafe {
        slice::from_raw_parts(event_paths.as_ptr() as *const *const libc::c_char, num_events)
    };
    let flags = unsafe { slice::from_raw_parts(event_flags.as_ptr(), num_events) };
    let ids = unsafe { slice::from_raw_parts(event_ids.as_ptr(), num_events) };

    for index in 0..num_events {
        let item = match unsafe { CStr::from_ptr(paths[index]) }.to_str() {
            Ok(path) => QueueItem::Event(RawEvent {
                path: PathBuf::from(path),
                flags: flags[index],
                id: ids[index],
            }),
            Err(err) => QueueItem::Failure(format!("event path is not valid UTF-8: {err}")),
        };
        let _ = context.events.send(item);
    }
}

/// One `FSEventStream` for one registered root. Dropping the watch point
/// stops and releases the stream.
struct WatchPoint {
    stream: fs::FSEventStreamRef,
}

// The stream pointer is only used to stop and release the stream, which
// FSEvents allows from any thread; all uses happen under the registry lock.
unsafe impl Send for WatchPoint {}

impl WatchPoint {
    fn new(
        path: &Path,
        latency: Duration,
        queue: &DispatchQueue,
        events: Sender<QueueItem>,
    ) -> Result<Self> {
        let Some(path_str) = path.to_str() else {
            return Err(
                Error::generic("watch path is not valid UTF-8").add_path(path.to_path_buf())
            );
        };
        let cf_path = cf::CFString::from_str(path_str);
        let cf_paths = cf::CFArray::from_retained_objects(&[cf_path]);

        let context = Box::into_raw(Box::new(StreamContext { events }));
        let mut stream_context = fs::FSEventStreamContext {
            version: 0,
            info: context as *mut c_void,
            retain: None,
            release: Some(release_context),
            copyDescription: None,
        };

        let stream = unsafe {
            fs::FSEventStreamCreate(
                cf::kCFAllocatorDefault,
                Some(stream_callback),
                &mut stream_context,
                cf_paths.as_ref(),
                fs::kFSEventStreamEventIdSinceNow,
                latency.as_secs_f64(),
                fs::kFSEventStreamCreateFlagNoDefer
                    | fs::kFSEventStreamCreateFlagFileEvents
                    | fs::kFSEventStreamCreateFlagWatchRoot,
            )
        };
        if stream.is_null() {
            // The stream owns the context only once creation succeeded.
            unsafe {
                drop(Box::from_raw(context));
            }
            return Err(Error::generic("couldn't add watch").add_path(path.to_path_buf()));
        }

        unsafe {
            fs::FSEventStreamSetDispatchQueue(stream, Some(queue));
            if !fs::FSEventStreamStart(stream) {
                fs::FSEventStreamInvalidate(stream);
                fs::FSEventStreamRelease(stream);
                return Err(
                    Error::generic("couldn't start the event stream").add_path(path.to_path_buf())
                );
            }
        }

        Ok(WatchPoint { stream })
    }
}

impl Drop for WatchPoint {
    fn drop(&mut self) {
        unsafe {
            fs::FSEventStreamStop(self.stream);
            fs::FSEventStreamInvalidate(self.stream);
            fs::FSEventStreamRelease(self.stream);
        }
    }
}

struct Shared {
    queue: DispatchRetained<DispatchQueue>,
    latency: Duration,
    registry: Mutex<HashMap<PathBuf, WatchPoint>>,
    event_tx: Sender<QueueItem>,
    event_rx: Receiver<QueueItem>,
    callback: Mutex<CallbackBridge>,
    running: AtomicBool,
    termination: Termination,
}

// All stream pointers are reached only through the registry lock, and the
// dispatch queue itself is thread-safe.
unsafe impl Send for Shared {}
unsafe impl Sync for Shared {}

/// FSEvents-based watcher engine.
///
/// The value is a cheap clonable handle; clones share one engine. All
/// methods may be called from any thread except [`initialize_run_loop`] and
/// [`execute_run_loop`], which must be called on the thread that is to
/// become the engine thread.
///
/// [`initialize_run_loop`]: FileWatcher::initialize_run_loop
/// [`execute_run_loop`]: FileWatcher::execute_run_loop
#[derive(Clone)]
pub struct FsEventsWatcher {
    shared: Arc<Shared>,
}

impl fmt::Debug for FsEventsWatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FsEventsWatcher").finish_non_exhaustive()
    }
}

impl FsEventsWatcher {
    /// Creates the engine and its serial dispatch queue.
    pub fn new<C: Callback>(callback: C, config: Config) -> Result<Self> {
        let (event_tx, event_rx) = bounded(EVENT_QUEUE_CAPACITY);
        Ok(FsEventsWatcher {
            shared: Arc::new(Shared {
                queue: DispatchQueue::new("file-events.fsevents", None),
                latency: config.latency(),
                registry: Mutex::new(HashMap::new()),
                event_tx,
                event_rx,
                callback: Mutex::new(CallbackBridge::new(Box::new(callback))),
                running: AtomicBool::new(false),
                termination: Termination::new(),
            }),
        })
    }
}

impl Shared {
    fn run_loop(&self) {
        loop {
            match self.event_rx.recv() {
                Ok(QueueItem::Event(event)) => self.handle_event(event),
                Ok(QueueItem::Failure(message)) => {
                    let mut callback = self.callback.lock().expect("callback lock poisoned");
                    callback.failure(message);
                }
                Ok(QueueItem::PoisonPill) | Err(_) => break,
            }
        }
    }

    fn handle_event(&self, event: RawEvent) {
        let flags = StreamFlags::from_bits_retain(event.flags);
        log::trace!(
            "event flags {flags:?} (id {}) for {}",
            event.id,
            event.path.display()
        );
        let mut callback = self.callback.lock().expect("callback lock poisoned");
        match classify_stream_flags(flags) {
            Classification::Ignored => {
                log::trace!("ignoring event for {}", event.path.display());
            }
            Classification::Overflow => callback.overflow(event.path),
            Classification::Change(kind) => callback.change_event(kind, event.path),
            Classification::Unknown => {
                log::warn!("unknown event {flags:?} for {}", event.path.display());
                callback.unknown_event(event.path);
            }
        }
    }
}

impl FileWatcher for FsEventsWatcher {
    fn register_paths(&self, paths: &[PathBuf]) -> Result<()> {
        let mut registry = self.shared.registry.lock().expect("registry lock poisoned");
        for path in paths {
            if registry.contains_key(path) {
                return Err(Error::already_watching().add_path(path.clone()));
            }
            let watch_point = WatchPoint::new(
                path,
                self.shared.latency,
                &self.shared.queue,
                self.shared.event_tx.clone(),
            )?;
            log::trace!("added event stream for {}", path.display());
            registry.insert(path.clone(), watch_point);
        }
        Ok(())
    }

    fn unregister_paths(&self, paths: &[PathBuf]) -> Result<bool> {
        let mut registry = self.shared.registry.lock().expect("registry lock poisoned");
        let mut success = true;
        for path in paths {
            if registry.remove(path).is_none() {
                log::info!("path is not watched: {}", path.display());
                success = false;
            }
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
        self.shared.run_loop();
        let mut callback = self.shared.callback.lock().expect("callback lock poisoned");
        self.shared.termination.complete(|| callback.termination());
        Ok(())
    }

    fn shutdown_run_loop(&self) -> Result<()> {
        // Stop the streams first so nothing new reaches the dispatch queue.
        self.shared
            .registry
            .lock()
            .expect("registry lock poisoned")
            .clear();
        // Wait for in-flight dispatch callbacks to finish: every event that
        // was accepted before this point is in the queue before the pill.
        self.shared.queue.exec_sync(|| {});
        self.shared
            .event_tx
            .send(QueueItem::PoisonPill)
            .map_err(|_| Error::generic("event queue is closed"))
    }

    fn await_termination(&self, timeout: Duration) -> bool {
        self.shared.termination.wait(timeout)
    }

    fn kind() -> WatcherKind {
        WatcherKind::FsEvents
    }
}
