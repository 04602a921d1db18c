//! The change event vocabulary shared by all watcher engines.

use std::fmt;
use std::path::PathBuf;

/// The semantic kind of a file system change.
///
/// This is a closed enumeration; raw kernel events that do not map onto one
/// of these kinds are delivered through
/// [`Callback::report_unknown_event`](crate::Callback::report_unknown_event)
/// or [`Callback::report_overflow`](crate::Callback::report_overflow)
/// instead. The integer tags are stable and shared with consumers that
/// receive events over a language boundary.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    /// A file or directory appeared under a watched root.
    Created = 0,

    /// A file or directory disappeared from under a watched root.
    Removed = 1,

    /// The contents or metadata of a file changed.
    Modified = 2,

    /// The identity of the watched root itself changed (moved, mounted over,
    /// unmounted); the consumer should re-check the root.
    Invalidated = 3,
}

impl ChangeKind {
    /// The wire tag of this kind.
    pub fn tag(self) -> i32 {
        self as i32
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ChangeKind::Created => "created",
            ChangeKind::Removed => "removed",
            ChangeKind::Modified => "modified",
            ChangeKind::Invalidated => "invalidated",
        })
    }
}

/// A notification as delivered through a channel-backed
/// [`Callback`](crate::Callback).
///
/// Mirrors the five callback operations one to one, preserving their order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// A classified change event for a path under a watched root.
    Change {
        /// What happened.
        kind: ChangeKind,
        /// The affected path.
        path: PathBuf,
    },

    /// A kernel event that carried none of the known change semantics.
    Unknown {
        /// The affected path.
        path: PathBuf,
    },

    /// The kernel dropped events for a watched root; its contents must be
    /// rescanned.
    Overflow {
        /// The affected watched root.
        path: PathBuf,
    },

    /// A non-fatal failure inside the engine loop.
    Failure {
        /// Description of the failure.
        message: String,
    },

    /// The run loop has finished; no notification follows this one.
    Termination,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn change_kind_tags_are_wire_stable() {
        assert_eq!(ChangeKind::Created.tag(), 0);
        assert_eq!(ChangeKind::Removed.tag(), 1);
        assert_eq!(ChangeKind::Modified.tag(), 2);
        assert_eq!(ChangeKind::Invalidated.tag(), 3);
    }

    #[test]
    fn change_kind_display_is_lowercase() {
        assert_eq!(ChangeKind::Created.to_string(), "created");
        assert_eq!(ChangeKind::Invalidated.to_string(), "invalidated");
    }
}
