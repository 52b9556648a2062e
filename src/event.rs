//! Canonical change events and the outbound callback surface

use std::{fmt, path::PathBuf};

use crate::error::WatcherError;

/// Canonical kind of a filesystem change, normalized from the raw flags or
/// actions each platform reports.
///
/// The numeric codes are part of the callback contract with host bindings
/// and must stay stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
	/// A file or directory appeared under a watched root
	Created,
	/// A file or directory disappeared under a watched root
	Removed,
	/// Contents or metadata of an existing entry changed
	Modified,
	/// The watched root itself became unreliable (deleted, moved,
	/// mounted over); the caller should rescan
	Invalidated,
	/// The platform reported a change we couldn't classify
	Unknown,
}

impl ChangeKind {
	/// Stable numeric code used by host-language bindings
	pub const fn code(self) -> i32 {
		match self {
			Self::Created => 0,
			Self::Removed => 1,
			Self::Modified => 2,
			Self::Invalidated => 3,
			Self::Unknown => 4,
		}
	}
}

impl fmt::Display for ChangeKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(match self {
			Self::Created => "created",
			Self::Removed => "removed",
			Self::Modified => "modified",
			Self::Invalidated => "invalidated",
			Self::Unknown => "unknown",
		})
	}
}

/// An outbound message from the watcher worker
#[derive(Debug)]
pub enum Notification {
	/// A normalized change event for an absolute path
	Change { kind: ChangeKind, path: PathBuf },
	/// The kernel dropped events for this root; its subtree must be rescanned
	Overflow { root: PathBuf },
	/// An error raised while dispatching events, surfaced out-of-band
	Error(WatcherError),
}

/// Receives notifications from the watcher worker thread.
///
/// All methods are invoked synchronously on the worker thread, so they must
/// not block for long and must not call back into
/// [`Watcher`](crate::Watcher) methods of the same instance; doing so fails
/// with [`WatcherError::ReentrantCall`] since the worker would wait on
/// itself. Decoupling (queueing, rethreading) is the handler's concern.
pub trait EventHandler: Send + 'static {
	/// Handles a normalized change event
	fn handle_change(&mut self, kind: ChangeKind, path: PathBuf);

	/// Handles kernel-reported event loss for a watched root
	fn handle_overflow(&mut self, root: PathBuf);

	/// Handles an error raised during event dispatch
	fn handle_error(&mut self, error: WatcherError);
}

impl<F> EventHandler for F
where
	F: FnMut(Notification) + Send + 'static,
{
	fn handle_change(&mut self, kind: ChangeKind, path: PathBuf) {
		(self)(Notification::Change { kind, path });
	}

	fn handle_overflow(&mut self, root: PathBuf) {
		(self)(Notification::Overflow { root });
	}

	fn handle_error(&mut self, error: WatcherError) {
		(self)(Notification::Error(error));
	}
}
