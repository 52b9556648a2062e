//! Watcher configuration

use std::time::Duration;

/// Tuning knobs for a watcher instance
#[derive(Debug, Clone)]
pub struct WatcherOptions {
	/// Coalescing latency of the macOS event stream. Ignored on other
	/// platforms, where the kernel delivers events directly.
	pub latency: Duration,
	/// How long a submitter blocks waiting for a command (register,
	/// unregister, terminate) to complete on the worker thread. A timeout
	/// does not cancel the command; it executes eventually, the submitter
	/// just stops waiting.
	pub command_timeout: Duration,
}

impl Default for WatcherOptions {
	fn default() -> Self {
		Self {
			// Gives the kernel a little room to batch bursts without the
			// caller noticing the delay
			latency: Duration::from_millis(100),
			command_timeout: Duration::from_secs(5),
		}
	}
}
