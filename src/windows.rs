//! Watcher engine for the Windows `ReadDirectoryChangesExW` API.
//!
//! The engine thread alternates between alertable sleeps, APC-delivered
//! commands and I/O completion routines, so the watch set and the event
//! buffers are only ever touched from that one thread and need no lock.
//! Callers marshal every mutation (register, unregister, shutdown) to the
//! engine thread as a command queued through `QueueUserAPC` and wait on its
//! completion with a bounded timeout.

use std::cell::RefCell;
use std::collections::HashMap;
use std::ffi::c_void;
use std::fmt;
use std::mem;
use std::os::windows::ffi::{OsStrExt, OsStringExt};
use std::path::{Path, PathBuf};
use std::ptr;
use std::slice;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use windows_sys::Win32::Foundation::{
    CloseHandle, GetLastError, ERROR_ACCESS_DENIED, ERROR_NOT_FOUND, ERROR_OPERATION_ABORTED,
    ERROR_SUCCESS, HANDLE, INVALID_HANDLE_VALUE,
};
use windows_sys::Win32::Storage::FileSystem::{
    CreateFileW, GetFileAttributesW, ReadDirectoryChangesExW,
    ReadDirectoryNotifyExtendedInformation, FILE_ACTION_ADDED, FILE_ACTION_MODIFIED,
    FILE_ACTION_REMOVED, FILE_ACTION_RENAMED_NEW_NAME, FILE_ACTION_RENAMED_OLD_NAME,
    FILE_ATTRIBUTE_DIRECTORY, FILE_FLAG_BACKUP_SEMANTICS, FILE_FLAG_OVERLAPPED,
    FILE_LIST_DIRECTORY, FILE_NOTIFY_CHANGE_ATTRIBUTES, FILE_NOTIFY_CHANGE_DIR_NAME,
    FILE_NOTIFY_CHANGE_FILE_NAME, FILE_NOTIFY_CHANGE_LAST_WRITE, FILE_NOTIFY_CHANGE_SIZE,
    FILE_NOTIFY_EXTENDED_INFORMATION, FILE_SHARE_DELETE, FILE_SHARE_READ, FILE_SHARE_WRITE,
    INVALID_FILE_ATTRIBUTES, OPEN_EXISTING,
};
use windows_sys::Win32::System::Threading::{
    GetCurrentThreadId, OpenThread, QueueUserAPC, SleepEx, INFINITE, THREAD_ALL_ACCESS,
};
use windows_sys::Win32::System::IO::{CancelIoEx, OVERLAPPED};

use crate::lifecycle::{CallbackBridge, Termination};
use crate::longpaths;
use crate::{Callback, ChangeKind, Config, Error, ErrorKind, FileWatcher, Result, WatcherKind};

const EVENT_MASK: u32 = FILE_NOTIFY_CHANGE_FILE_NAME
    | FILE_NOTIFY_CHANGE_DIR_NAME
    | FILE_NOTIFY_CHANGE_ATTRIBUTES
    | FILE_NOTIFY_CHANGE_SIZE
    | FILE_NOTIFY_CHANGE_LAST_WRITE;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum WatchPointStatus {
    /// Constructed, no read outstanding.
    NotListening,

    /// Exactly one overlapped read is outstanding.
    Listening,

    /// The outstanding read was cancelled; the `ERROR_OPERATION_ABORTED`
    /// completion is expected.
    Cancelled,

    /// The directory handle has been closed.
    Finished,
}

#[derive(Debug, PartialEq, Eq)]
enum ListenOutcome {
    Success,
    /// The target is no longer a directory.
    Deleted,
}

#[derive(Debug, PartialEq, Eq)]
enum Classification {
    Change(ChangeKind),
    Ignored,
    Unknown,
}

/// Maps a notify action to the change it represents. Modification events on
/// directories carry no useful signal and are dropped.
fn classify_action(action: u32, is_directory: bool) -> Classification {
    match action {
        FILE_ACTION_ADDED | FILE_ACTION_RENAMED_NEW_NAME => {
            Classification::Change(ChangeKind::Created)
        }
        FILE_ACTION_REMOVED | FILE_ACTION_RENAMED_OLD_NAME => {
            Classification::Change(ChangeKind::Removed)
        }
        FILE_ACTION_MODIFIED if is_directory => Classification::Ignored,
        FILE_ACTION_MODIFIED => Classification::Change(ChangeKind::Modified),
        _ => Classification::Unknown,
    }
}

type CommandFn = Box<dyn FnOnce(&mut ServerState) -> Result<bool> + Send>;

/// A unit of mutation marshalled to the engine thread. The caller blocks on
/// the condition variable until the engine thread has run the closure or the
/// timeout expires.
struct Command {
    function: Mutex<Option<CommandFn>>,
    outcome: Mutex<Option<Result<bool>>>,
    executed: Condvar,
}

impl Command {
    fn new(function: CommandFn) -> Self {
        Command {
            function: Mutex::new(Some(function)),
            outcome: Mutex::new(None),
            executed: Condvar::new(),
        }
    }

    fn run(&self, state: &mut ServerState) {
        let function = self.function.lock().expect("command lock poisoned").take();
        let outcome = match function {
            Some(function) => function(state),
            None => Err(Error::generic("command already executed")),
        };
        self.finish(outcome);
    }

    fn fail(&self, error: Error) {
        self.finish(Err(error));
    }

    fn finish(&self, outcome: Result<bool>) {
        *self.outcome.lock().expect("command lock poisoned") = Some(outcome);
        self.executed.notify_all();
    }

    fn await_outcome(&self, timeout: Duration) -> Result<bool> {
        let outcome = self.outcome.lock().expect("command lock poisoned");
        let (mut outcome, _) = self
            .executed
            .wait_timeout_while(outcome, timeout, |outcome| outcome.is_none())
            .expect("command lock poisoned");
        match outcome.take() {
            Some(outcome) => outcome,
            None => Err(Error::new(ErrorKind::ExecutionTimedOut)),
        }
    }
}

/// State owned by the engine thread. Commands and completion routines are
/// the only code that touches it, and both run on that thread.
struct ServerState {
    watch_points: HashMap<PathBuf, Box<WatchPoint>>,
    event_buffer_size: usize,
    callback: Arc<Mutex<CallbackBridge>>,
    shared: Arc<Shared>,
}

thread_local! {
    static SERVER: RefCell<Option<ServerState>> = const { RefCell::new(None) };
}

unsafe extern "system" fn run_command(parameter: usize) {
    // Safety: the parameter is the raw form of an `Arc<Command>` leaked by
    // `execute_on_run_loop`; reconstituting it balances the leak even when
    // the caller has already timed out and dropped its own reference.
    let command = unsafe { Arc::from_raw(parameter as *const Command) };
    // The state is moved out of the cell while the command runs: dropping a
    // watch point inside a command performs an alertable wait, and another
    // command delivered there must find the cell free instead of re-borrowing
    // it.
    let state = SERVER.with(|server| server.borrow_mut().take());
    match state {
        Some(mut state) => {
            command.run(&mut state);
            SERVER.with(|server| *server.borrow_mut() = Some(state));
        }
        None => command.fail(Error::generic("run loop is not executing")),
    }
}

impl ServerState {
    fn register_path(&mut self, path: &Path) -> Result<()> {
        let long_path = longpaths::to_long_path(path);
        if let Some(existing) = self.watch_points.get(&long_path) {
            if existing.status != WatchPointStatus::Finished {
                return Err(Error::already_watching().add_path(path.to_path_buf()));
            }
            // The previous watch died, e.g. the directory was deleted and
            // recreated; replace it.
            self.watch_points.remove(&long_path);
        }
        let watch_point = WatchPoint::new(
            long_path.clone(),
            self.event_buffer_size,
            Arc::clone(&self.callback),
            Arc::clone(&self.shared),
        )?;
        log::trace!("added directory watch for {}", long_path.display());
        self.watch_points.insert(long_path, watch_point);
        Ok(())
    }

    fn unregister_path(&mut self, path: &Path) -> bool {
        let long_path = longpaths::to_long_path(path);
        if self.watch_points.remove(&long_path).is_none() {
            log::info!("path is not watched: {}", path.display());
            return false;
        }
        true
    }
}

/// One watched directory hierarchy.
///
/// When the hierarchy is moved, the kernel sends no event at all; the next
/// completion for the stale handle fails the directory check and the watch
/// reports the root as removed and finishes.
struct WatchPoint {
    /// Extended-length form of the registered path; also the registry key.
    path: PathBuf,
    handle: HANDLE,
    buffer: Vec<u8>,
    /// `hEvent` carries the watch point's own address; completion routines
    /// get back here through it.
    overlapped: OVERLAPPED,
    status: WatchPointStatus,
    callback: Arc<Mutex<CallbackBridge>>,
    shared: Arc<Shared>,
}

impl WatchPoint {
    fn new(
        path: PathBuf,
        event_buffer_size: usize,
        callback: Arc<Mutex<CallbackBridge>>,
        shared: Arc<Shared>,
    ) -> Result<Box<Self>> {
        let encoded = encode_wide(&path);
        let handle = unsafe {
            CreateFileW(
                encoded.as_ptr(),
                FILE_LIST_DIRECTORY,
                FILE_SHARE_READ | FILE_SHARE_WRITE | FILE_SHARE_DELETE,
                ptr::null(),
                OPEN_EXISTING,
                FILE_FLAG_BACKUP_SEMANTICS | FILE_FLAG_OVERLAPPED,
                ptr::null_mut(),
            )
        };
        if handle == INVALID_HANDLE_VALUE {
            let error = unsafe { GetLastError() };
            return Err(Error::generic(format!("couldn't add watch, error = {error}")).add_path(path));
        }

        // Boxed so the address baked into the OVERLAPPED stays stable.
        let mut watch_point = Box::new(WatchPoint {
            path,
            handle,
            buffer: vec![0u8; event_buffer_size],
            overlapped: unsafe { mem::zeroed() },
            status: WatchPointStatus::NotListening,
            callback,
            shared,
        });
        match watch_point.listen()? {
            ListenOutcome::Success => Ok(watch_point),
            ListenOutcome::Deleted => Err(Error::generic(
                "couldn't start watching because the path is not a directory",
            )
            .add_path(watch_point.path.clone())),
        }
    }

    /// Issues the next overlapped read. At most one read is outstanding per
    /// handle; `Listening` holds exactly between a successful issue and its
    /// completion or cancellation.
    fn listen(&mut self) -> Result<ListenOutcome> {
        self.overlapped = unsafe { mem::zeroed() };
        // The completion-routine form leaves hEvent free for user data.
        self.overlapped.hEvent = self as *mut WatchPoint as HANDLE;
        let issued = unsafe {
            ReadDirectoryChangesExW(
                self.handle,
                self.buffer.as_mut_ptr() as *mut c_void,
                self.buffer.len() as u32,
                1, // recursive
                EVENT_MASK,
                ptr::null_mut(), // unused for asynchronous requests
                &mut self.overlapped,
                Some(handle_event_completion),
                ReadDirectoryNotifyExtendedInformation,
            )
        };
        if issued != 0 {
            self.status = WatchPointStatus::Listening;
            return Ok(ListenOutcome::Success);
        }
        let error = unsafe { GetLastError() };
        self.close();
        if error == ERROR_ACCESS_DENIED && !self.is_valid_directory() {
            Ok(ListenOutcome::Deleted)
        } else {
            Err(Error::generic(format!("couldn't start watching, error = {error}"))
                .add_path(self.path.clone()))
        }
    }

    fn is_valid_directory(&self) -> bool {
        let encoded = encode_wide(&self.path);
        let attributes = unsafe { GetFileAttributesW(encoded.as_ptr()) };
        attributes != INVALID_FILE_ATTRIBUTES && (attributes & FILE_ATTRIBUTE_DIRECTORY) != 0
    }

    fn cancel(&mut self) -> Result<bool> {
        if self.status != WatchPointStatus::Listening {
            return Ok(false);
        }
        log::debug!("cancelling watch on {}", self.path.display());
        let cancelled = unsafe { CancelIoEx(self.handle, &self.overlapped) };
        if cancelled != 0 {
            self.status = WatchPointStatus::Cancelled;
            return Ok(true);
        }
        let error = unsafe { GetLastError() };
        self.close();
        if error == ERROR_NOT_FOUND {
            // The read had already completed; nothing was in flight.
            log::debug!("watch on {} already finished", self.path.display());
            Ok(false)
        } else {
            Err(Error::generic(format!("couldn't cancel watch, error = {error}"))
                .add_path(self.path.clone()))
        }
    }

    fn close(&mut self) {
        if self.status != WatchPointStatus::Finished {
            let closed = unsafe { CloseHandle(self.handle) };
            if closed == 0 {
                log::error!(
                    "couldn't close directory handle for {}: error = {}",
                    self.path.display(),
                    unsafe { GetLastError() }
                );
            }
            self.status = WatchPointStatus::Finished;
        }
    }

    fn handle_completion(&mut self, error_code: u32, bytes_transferred: u32) {
        if error_code == ERROR_OPERATION_ABORTED {
            log::debug!("finished watching {}", self.path.display());
            self.close();
            return;
        }

        if self.status != WatchPointStatus::Listening {
            log::debug!(
                "ignoring {bytes_transferred} bytes of events for {} (status = {:?})",
                self.path.display(),
                self.status
            );
            return;
        }
        self.status = WatchPointStatus::NotListening;
        self.process_events(error_code, bytes_transferred);
    }

    fn process_events(&mut self, error_code: u32, bytes_transferred: u32) {
        let callback = Arc::clone(&self.callback);
        let mut callback = callback.lock().expect("callback lock poisoned");

        if error_code != ERROR_SUCCESS {
            if error_code == ERROR_ACCESS_DENIED && !self.is_valid_directory() {
                // The watched directory itself is gone.
                callback.change_event(ChangeKind::Removed, longpaths::from_long_path(&self.path));
                self.close();
            } else {
                callback.failure(format!(
                    "error {error_code} received when handling events for {}",
                    self.path.display()
                ));
            }
            return;
        }

        if self.shared.should_terminate.load(Ordering::SeqCst) {
            log::debug!(
                "ignoring {bytes_transferred} bytes of events for {} during termination",
                self.path.display()
            );
            return;
        }

        if bytes_transferred == 0 {
            // The change set did not fit the buffer; the consumer has to
            // rescan the whole subtree.
            callback.overflow(longpaths::from_long_path(&self.path));
        } else {
            self.walk_buffer(&mut callback);
        }

        match self.listen() {
            Ok(ListenOutcome::Success) => {}
            Ok(ListenOutcome::Deleted) => {
                log::debug!("watched directory removed for {}", self.path.display());
                callback.change_event(ChangeKind::Removed, longpaths::from_long_path(&self.path));
            }
            Err(error) => callback.failure(error.to_string()),
        }
    }

    fn walk_buffer(&self, callback: &mut CallbackBridge) {
        let mut offset = 0usize;
        loop {
            // Entries may be only 16-bit aligned within the buffer, so every
            // header access goes through an unaligned read.
            let entry = unsafe {
                ptr::read_unaligned(
                    self.buffer.as_ptr().add(offset) as *const FILE_NOTIFY_EXTENDED_INFORMATION
                )
            };
            let name_offset =
                offset + mem::offset_of!(FILE_NOTIFY_EXTENDED_INFORMATION, FileName);
            // The length is in bytes, the name in UTF-16 units.
            let name_len = entry.FileNameLength as usize / 2;
            let name = unsafe {
                slice::from_raw_parts(
                    self.buffer.as_ptr().add(name_offset) as *const u16,
                    name_len,
                )
            };
            self.handle_event(callback, &entry, name);

            if entry.NextEntryOffset == 0 {
                break;
            }
            offset += entry.NextEntryOffset as usize;
        }
    }

    fn handle_event(
        &self,
        callback: &mut CallbackBridge,
        entry: &FILE_NOTIFY_EXTENDED_INFORMATION,
        name: &[u16],
    ) {
        let file_name = std::ffi::OsString::from_wide(name);
        let changed_path = if file_name.is_empty() {
            self.path.clone()
        } else {
            self.path.join(file_name)
        };
        let reported = longpaths::from_long_path(&changed_path);
        let is_directory = entry.FileAttributes & FILE_ATTRIBUTE_DIRECTORY != 0;
        log::trace!("change {:#x} detected for {}", entry.Action, reported.display());

        match classify_action(entry.Action, is_directory) {
            Classification::Change(kind) => callback.change_event(kind, reported),
            Classification::Ignored => {
                log::trace!("ignored modification event on directory {}", reported.display());
            }
            Classification::Unknown => {
                log::warn!("unknown event {:#x} for {}", entry.Action, reported.display());
                callback.unknown_event(reported);
            }
        }
    }
}

impl Drop for WatchPoint {
    fn drop(&mut self) {
        if let Err(error) = self.cancel() {
            log::warn!("couldn't cancel watch on {}: {error}", self.path.display());
        }
        // Let the aborted read's completion routine run before the buffer
        // and the OVERLAPPED go away.
        unsafe {
            SleepEx(0, 1);
        }
        self.close();
    }
}

unsafe extern "system" fn handle_event_completion(
    error_code: u32,
    bytes_transferred: u32,
    overlapped: *mut OVERLAPPED,
) {
    // Safety: hEvent carries the address of the boxed watch point that
    // issued this read; the watch point outlives the read (cancellation
    // drains this very routine before the box is freed).
    let watch_point = unsafe { &mut *((*overlapped).hEvent as *mut WatchPoint) };
    watch_point.handle_completion(error_code, bytes_transferred);
}

fn encode_wide(path: &Path) -> Vec<u16> {
    path.as_os_str().encode_wide().chain(Some(0)).collect()
}

struct Shared {
    /// Engine thread handle as a raw address; zero while uninitialized.
    thread_handle: AtomicUsize,
    command_timeout: Duration,
    event_buffer_size: usize,
    callback: Arc<Mutex<CallbackBridge>>,
    should_terminate: AtomicBool,
    running: AtomicBool,
    termination: Termination,
}

/// `ReadDirectoryChangesExW`-based watcher engine.
///
/// The value is a cheap clonable handle; clones share one engine. All
/// methods may be called from any thread except [`initialize_run_loop`] and
/// [`execute_run_loop`], which must be called on the thread that is to
/// become the engine thread.
///
/// [`initialize_run_loop`]: FileWatcher::initialize_run_loop
/// [`execute_run_loop`]: FileWatcher::execute_run_loop
#[derive(Clone)]
pub struct ReadDirectoryChangesWatcher {
    shared: Arc<Shared>,
}

impl fmt::Debug for ReadDirectoryChangesWatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadDirectoryChangesWatcher")
            .finish_non_exhaustive()
    }
}

impl ReadDirectoryChangesWatcher {
    /// Creates the engine.
    ///
    /// The engine does nothing until a thread calls
    /// [`initialize_run_loop`](FileWatcher::initialize_run_loop) and
    /// [`execute_run_loop`](FileWatcher::execute_run_loop).
    pub fn new<C: Callback>(callback: C, config: Config) -> Result<Self> {
        Ok(ReadDirectoryChangesWatcher {
            shared: Arc::new(Shared {
                thread_handle: AtomicUsize::new(0),
                command_timeout: config.command_timeout(),
                event_buffer_size: config.event_buffer_size(),
                callback: Arc::new(Mutex::new(CallbackBridge::new(Box::new(callback)))),
                should_terminate: AtomicBool::new(false),
                running: AtomicBool::new(false),
                termination: Termination::new(),
            }),
        })
    }

    fn execute_on_run_loop(&self, function: CommandFn) -> Result<bool> {
        let thread_handle = self.shared.thread_handle.load(Ordering::SeqCst);
        if thread_handle == 0 {
            return Err(Error::generic("run loop has not been initialized"));
        }

        let command = Arc::new(Command::new(function));
        let parameter = Arc::into_raw(Arc::clone(&command)) as usize;
        let queued =
            unsafe { QueueUserAPC(Some(run_command), thread_handle as HANDLE, parameter) };
        if queued == 0 {
            let error = unsafe { GetLastError() };
            // The APC was never queued; reclaim the leaked reference.
            unsafe {
                drop(Arc::from_raw(parameter as *const Command));
            }
            return Err(Error::generic(format!("couldn't queue command, error = {error}")));
        }
        command.await_outcome(self.shared.command_timeout)
    }

    fn run_loop(&self) -> Result<()> {
        while !self.shared.should_terminate.load(Ordering::SeqCst) {
            unsafe {
                SleepEx(INFINITE, 1);
            }
        }

        log::debug!("run loop finished, cancelling remaining watch points");
        SERVER.with(|server| {
            if let Some(state) = server.borrow_mut().as_mut() {
                for watch_point in state.watch_points.values_mut() {
                    if watch_point.status == WatchPointStatus::Listening {
                        if let Err(error) = watch_point.cancel() {
                            log::error!("{error}");
                        }
                    }
                }
            }
        });

        // Drain the completion routines of the cancelled reads.
        unsafe {
            SleepEx(0, 1);
        }

        // Take the state out of the cell before dropping it: dropping watch
        // points performs another alertable wait, and a command delivered
        // there must find the cell free (and fail), not re-borrow it.
        let state = SERVER.with(|server| server.borrow_mut().take());
        if let Some(state) = &state {
            for (path, watch_point) in &state.watch_points {
                match watch_point.status {
                    WatchPointStatus::NotListening | WatchPointStatus::Finished => {}
                    status => log::warn!(
                        "watch point {} did not finish before termination (status = {status:?})",
                        path.display()
                    ),
                }
            }
        }
        drop(state);

        let thread_handle = self.shared.thread_handle.swap(0, Ordering::SeqCst);
        if thread_handle != 0 {
            unsafe {
                CloseHandle(thread_handle as HANDLE);
            }
        }
        Ok(())
    }
}

impl FileWatcher for ReadDirectoryChangesWatcher {
    fn register_paths(&self, paths: &[PathBuf]) -> Result<()> {
        let paths = paths.to_vec();
        self.execute_on_run_loop(Box::new(move |state| {
            for path in &paths {
                state.register_path(path)?;
            }
            Ok(true)
        }))
        .map(|_| ())
    }

    fn unregister_paths(&self, paths: &[PathBuf]) -> Result<bool> {
        let paths = paths.to_vec();
        self.execute_on_run_loop(Box::new(move |state| {
            let mut success = true;
            for path in &paths {
                success &= state.unregister_path(path);
            }
            Ok(success)
        }))
    }

    fn initialize_run_loop(&self) -> Result<()> {
        // GetCurrentThread() returns a pseudo handle that APCs cannot
        // target, so the real handle is opened explicitly.
        let thread_handle = unsafe { OpenThread(THREAD_ALL_ACCESS, 0, GetCurrentThreadId()) };
        if thread_handle.is_null() {
            let error = unsafe { GetLastError() };
            return Err(Error::generic(format!(
                "couldn't open a handle to the engine thread, error = {error}"
            )));
        }
        self.shared
            .thread_handle
            .store(thread_handle as usize, Ordering::SeqCst);
        Ok(())
    }

    fn execute_run_loop(&self) -> Result<()> {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            return Err(Error::generic("run loop is already executing"));
        }
        SERVER.with(|server| {
            *server.borrow_mut() = Some(ServerState {
                watch_points: HashMap::new(),
                event_buffer_size: self.shared.event_buffer_size,
                callback: Arc::clone(&self.shared.callback),
                shared: Arc::clone(&self.shared),
            });
        });
        let result = self.run_loop();
        if let Err(error) = &result {
            log::error!("run loop failed: {error}");
        }
        let mut callback = self.shared.callback.lock().expect("callback lock poisoned");
        self.shared.termination.complete(|| callback.termination());
        result
    }

    fn shutdown_run_loop(&self) -> Result<()> {
        self.execute_on_run_loop(Box::new(|state| {
            state.shared.should_terminate.store(true, Ordering::SeqCst);
            Ok(true)
        }))
        .map(|_| ())
    }

    fn await_termination(&self, timeout: Duration) -> bool {
        self.shared.termination.wait(timeout)
    }

    fn kind() -> WatcherKind {
        WatcherKind::ReadDirectoryChanges
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Notification;
    use std::sync::mpsc;
    use std::thread;

    const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

    fn watcher() -> (ReadDirectoryChangesWatcher, mpsc::Receiver<Notification>) {
        let (tx, rx) = mpsc::channel();
        let watcher =
            ReadDirectoryChangesWatcher::new(tx, Config::default()).expect("create watcher");
        (watcher, rx)
    }

    fn start_engine(watcher: &ReadDirectoryChangesWatcher) -> thread::JoinHandle<Result<()>> {
        let engine = watcher.clone();
        let (ready_tx, ready_rx) = mpsc::channel();
        let handle = thread::spawn(move || {
            engine.initialize_run_loop()?;
            ready_tx.send(()).expect("ready");
            engine.execute_run_loop()
        });
        ready_rx
            .recv_timeout(EVENT_TIMEOUT)
            .expect("engine thread initialization");
        handle
    }

    fn stop_engine(
        watcher: &ReadDirectoryChangesWatcher,
        engine: thread::JoinHandle<Result<()>>,
    ) {
        watcher.shutdown_run_loop().expect("shutdown");
        assert!(watcher.await_termination(EVENT_TIMEOUT));
        engine.join().expect("engine thread").expect("run loop");
    }

    fn recv(rx: &mpsc::Receiver<Notification>) -> Notification {
        rx.recv_timeout(EVENT_TIMEOUT).expect("notification")
    }

    #[test]
    fn watcher_is_send_and_sync() {
        fn check<T: Send + Sync>() {}
        check::<ReadDirectoryChangesWatcher>();
    }

    #[test]
    fn added_and_rename_target_classify_as_created() {
        assert_eq!(
            classify_action(FILE_ACTION_ADDED, false),
            Classification::Change(ChangeKind::Created)
        );
        assert_eq!(
            classify_action(FILE_ACTION_RENAMED_NEW_NAME, true),
            Classification::Change(ChangeKind::Created)
        );
    }

    #[test]
    fn removed_and_rename_source_classify_as_removed() {
        assert_eq!(
            classify_action(FILE_ACTION_REMOVED, false),
            Classification::Change(ChangeKind::Removed)
        );
        assert_eq!(
            classify_action(FILE_ACTION_RENAMED_OLD_NAME, true),
            Classification::Change(ChangeKind::Removed)
        );
    }

    #[test]
    fn directory_modifications_are_ignored_but_file_ones_are_not() {
        assert_eq!(classify_action(FILE_ACTION_MODIFIED, true), Classification::Ignored);
        assert_eq!(
            classify_action(FILE_ACTION_MODIFIED, false),
            Classification::Change(ChangeKind::Modified)
        );
    }

    #[test]
    fn unrecognized_actions_classify_as_unknown() {
        assert_eq!(classify_action(0xbeef, false), Classification::Unknown);
    }

    #[test]
    fn commands_fail_before_the_run_loop_is_initialized() {
        let (watcher, _rx) = watcher();
        let result = watcher.register_paths(&[PathBuf::from(r"C:\anywhere")]);
        assert!(matches!(
            result,
            Err(Error {
                kind: ErrorKind::Generic(_),
                ..
            })
        ));
    }

    #[test]
    fn unexecuted_command_times_out() {
        let command = Command::new(Box::new(|_| Ok(true)));
        let result = command.await_outcome(Duration::from_millis(50));
        assert!(matches!(
            result,
            Err(Error {
                kind: ErrorKind::ExecutionTimedOut,
                ..
            })
        ));
    }

    #[test]
    fn create_file_reports_created_event() {
        let tmpdir = tempfile::tempdir().unwrap();
        let (watcher, rx) = watcher();
        let engine = start_engine(&watcher);

        watcher
            .register_paths(&[tmpdir.path().to_path_buf()])
            .expect("register");
        let path = tmpdir.path().join("entry");
        std::fs::File::create(&path).expect("create");

        assert_eq!(
            recv(&rx),
            Notification::Change {
                kind: ChangeKind::Created,
                path,
            }
        );
        stop_engine(&watcher, engine);
        assert_eq!(recv(&rx), Notification::Termination);
    }

    #[test]
    fn duplicate_registration_fails_and_keeps_the_first_watch() {
        let tmpdir = tempfile::tempdir().unwrap();
        let (watcher, _rx) = watcher();
        let engine = start_engine(&watcher);
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

        assert_eq!(watcher.unregister_paths(&[path]).unwrap(), true);
        stop_engine(&watcher, engine);
    }

    #[test]
    fn unregistering_unwatched_path_returns_false() {
        let tmpdir = tempfile::tempdir().unwrap();
        let (watcher, _rx) = watcher();
        let engine = start_engine(&watcher);

        assert_eq!(
            watcher
                .unregister_paths(&[tmpdir.path().to_path_buf()])
                .unwrap(),
            false
        );
        stop_engine(&watcher, engine);
    }

    #[test]
    fn deleting_the_watched_directory_reports_removed() {
        let tmpdir = tempfile::tempdir().unwrap();
        let watched = tmpdir.path().join("watched");
        std::fs::create_dir(&watched).expect("create dir");

        let (watcher, rx) = watcher();
        let engine = start_engine(&watcher);
        watcher
            .register_paths(&[watched.clone()])
            .expect("register");

        std::fs::remove_dir(&watched).expect("remove dir");

        assert_eq!(
            recv(&rx),
            Notification::Change {
                kind: ChangeKind::Removed,
                path: watched,
            }
        );
        stop_engine(&watcher, engine);
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

        std::fs::File::create(tmpdir.path().join("late")).expect("create");
        thread::sleep(Duration::from_millis(100));
        assert!(rx.try_recv().is_err());
    }
}
