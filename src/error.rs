//! Error types for the filesystem notifier

use std::{io, path::PathBuf, time::Duration};

use thiserror::Error;

/// Result type alias for watcher operations
pub type Result<T> = std::result::Result<T, WatcherError>;

/// Errors that can occur while starting, driving or tearing down a watcher
#[derive(Debug, Error)]
pub enum WatcherError {
	/// Register was called for a path that already has a live watch point
	#[error("Already watching path {0}")]
	AlreadyWatched(PathBuf),

	/// The path could not be opened or is not a directory at registration time
	#[error("Couldn't watch path {path}: {source}")]
	InvalidPath {
		path: PathBuf,
		#[source]
		source: io::Error,
	},

	/// A syscall failed; carries the underlying OS error code
	#[error("{message} (os error {code})")]
	Os {
		message: String,
		path: Option<PathBuf>,
		code: i32,
	},

	/// A command did not complete within the submitter's timeout.
	/// The command still executes on the worker eventually.
	#[error("Command did not complete within {0:?}")]
	Timeout(Duration),

	/// A command was submitted after the watcher started terminating
	#[error("Watcher is shutting down")]
	ShuttingDown,

	/// The watcher was called from its own worker thread, which would
	/// deadlock the command queue
	#[error("Cannot call the watcher from its own worker thread")]
	ReentrantCall,

	/// An internal invariant was violated
	#[error("Internal watcher error: {0}")]
	Internal(String),
}

impl WatcherError {
	pub(crate) fn os(message: impl Into<String>, path: Option<PathBuf>, code: i32) -> Self {
		Self::Os {
			message: message.into(),
			path,
			code,
		}
	}

	pub(crate) fn os_io(message: impl Into<String>, path: Option<PathBuf>, error: &io::Error) -> Self {
		Self::os(message, path, error.raw_os_error().unwrap_or(-1))
	}
}
