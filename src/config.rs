//! Configuration types

use std::time::Duration;

/// Watcher engine configuration
///
/// This contains settings that may relate to only one specific backend, so
/// that a watcher can be configured the same way regardless of which engine
/// is selected at compile time.
///
/// ```rust
/// # use std::time::Duration;
/// # use file_events::Config;
/// let config = Config::default()
///     .with_latency(Duration::from_millis(20))
///     .with_event_buffer_size(32 * 1024);
/// ```
///
/// None of the options can be changed after the watcher has been created.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
pub struct Config {
    /// See [Config::with_latency]
    latency: Duration,

    /// See [Config::with_event_buffer_size]
    event_buffer_size: usize,

    /// See [Config::with_command_timeout]
    command_timeout: Duration,
}

impl Config {
    /// For the FSEvents backend.
    ///
    /// The coalescing window the kernel may use to batch changes before
    /// delivering them. Zero (the default) requests delivery as soon as
    /// possible.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Returns current setting
    pub fn latency(&self) -> Duration {
        self.latency
    }

    /// For the `ReadDirectoryChangesExW` backend.
    ///
    /// Size in bytes of the per-directory kernel event buffer. When a change
    /// set does not fit, the kernel signals an overflow and the consumer has
    /// to rescan, so larger buffers trade memory for fewer rescans. The
    /// default is 64 KiB.
    pub fn with_event_buffer_size(mut self, event_buffer_size: usize) -> Self {
        self.event_buffer_size = event_buffer_size;
        self
    }

    /// Returns current setting
    pub fn event_buffer_size(&self) -> usize {
        self.event_buffer_size
    }

    /// For the `ReadDirectoryChangesExW` backend.
    ///
    /// How long a caller waits for the engine thread to pick up and run a
    /// command (register, unregister, shutdown) before the call fails with
    /// [`ErrorKind::ExecutionTimedOut`](crate::ErrorKind::ExecutionTimedOut).
    /// The default is 5 seconds.
    pub fn with_command_timeout(mut self, command_timeout: Duration) -> Self {
        self.command_timeout = command_timeout;
        self
    }

    /// Returns current setting
    pub fn command_timeout(&self) -> Duration {
        self.command_timeout
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            latency: Duration::ZERO,
            event_buffer_size: 64 * 1024,
            command_timeout: Duration::from_secs(5),
        }
    }
}
