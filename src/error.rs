//! Error types

use std::error::Error as StdError;
use std::path::PathBuf;
use std::{fmt, io, result};

/// Type alias to use this library's `Error` type in a `Result`
pub type Result<T> = result::Result<T, Error>;

/// Error kinds
#[derive(Debug)]
pub enum ErrorKind {
    /// Generic error
    ///
    /// May be used in cases where a platform specific error is mapped to this
    /// type, or for opaque internal errors.
    Generic(String),

    /// I/O errors
    Io(io::Error),

    /// A path does not exist
    PathNotFound,

    /// The path is already being watched
    AlreadyWatching,

    /// The per-user limit on inotify instances was reached when creating the
    /// engine (Linux `EMFILE`)
    InstanceLimitTooLow,

    /// The per-user limit on inotify watches was reached when registering a
    /// path (Linux `ENOSPC`)
    WatchLimitTooLow,

    /// A command did not reach the engine thread within the configured
    /// timeout (Windows)
    ExecutionTimedOut,
}

/// Watcher error type.
///
/// Errors are emitted either at creation time of a watcher, when registering
/// or unregistering paths, or on the engine thread when the run loop fails
/// fatally. Non-fatal problems inside the run loop are reported through the
/// callback instead.
#[derive(Debug)]
pub struct Error {
    /// Kind of the error
    pub kind: ErrorKind,
    /// Relevant paths to the error, if any
    pub paths: Vec<PathBuf>,
}

impl Error {
    /// Creates a new Error with default paths
    pub fn new(kind: ErrorKind) -> Self {
        Error {
            kind,
            paths: Vec::new(),
        }
    }

    /// Creates a new generic Error from a message
    pub fn generic(msg: impl Into<String>) -> Self {
        Error::new(ErrorKind::Generic(msg.into()))
    }

    /// Creates a new i/o Error from a stdlib `io::Error`
    pub fn io(err: io::Error) -> Self {
        Error::new(ErrorKind::Io(err))
    }

    /// Creates a new "path not found" error
    pub fn path_not_found() -> Self {
        Error::new(ErrorKind::PathNotFound)
    }

    /// Creates a new "already watching" error
    pub fn already_watching() -> Self {
        Error::new(ErrorKind::AlreadyWatching)
    }

    /// Adds a path to the error
    pub fn add_path(mut self, path: PathBuf) -> Self {
        self.paths.push(path);
        self
    }

    /// Whether the error is one of the watch resource exhaustion kinds
    pub fn is_resource_exhaustion(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::InstanceLimitTooLow | ErrorKind::WatchLimitTooLow
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Generic(msg) => f.write_str(msg),
            ErrorKind::Io(err) => err.fmt(f),
            ErrorKind::PathNotFound => f.write_str("path not found"),
            ErrorKind::AlreadyWatching => f.write_str("already watching path"),
            ErrorKind::InstanceLimitTooLow => f.write_str("inotify instance limit too low"),
            ErrorKind::WatchLimitTooLow => f.write_str("inotify watches limit too low"),
            ErrorKind::ExecutionTimedOut => f.write_str("execution timed out"),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.kind.fmt(f)?;
        for path in &self.paths {
            write!(f, ": {}", path.display())?;
        }
        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match &self.kind {
            ErrorKind::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::io(err)
    }
}
