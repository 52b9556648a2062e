//! Platform-specific watcher engines.
//!
//! Each platform blocks in a different primitive (`poll` on Linux,
//! `CFRunLoopRun` on macOS, alertable `SleepEx` on Windows) and each has its
//! own way of being woken from another thread. The [`Waker`] trait is the
//! only cross-platform seam: submitting a command signals the waker, the
//! engine wakes up, drains the queue and goes back to sleep.

use std::sync::Arc;

use crossbeam_channel::Sender;

use crate::error::Result;

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "macos")]
mod macos;
#[cfg(target_os = "windows")]
mod windows;

#[cfg(target_os = "linux")]
pub(crate) use linux::run;
#[cfg(target_os = "macos")]
pub(crate) use macos::run;
#[cfg(target_os = "windows")]
pub(crate) use windows::run;

#[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
compile_error!("fs-notifier only supports Linux, macOS and Windows");

/// Wakes the worker thread out of its platform blocking primitive so it
/// drains the command queue
pub(crate) trait Waker: Send + Sync {
	fn wake(&self) -> Result<()>;
}

/// Carries either the ready-to-use waker or the engine's initialization
/// failure back to [`Watcher::start`](crate::Watcher::start)
pub(crate) type StartupSender = Sender<Result<Arc<dyn Waker>>>;

/// Lifecycle of a single watch point.
///
/// `Listening` points own exactly one live kernel resource. The transitions
/// are: arm moves `NotListening` to `Listening`; an explicit cancel moves
/// `Listening` to `Cancelled` until the kernel acknowledges it with
/// `Finished`; an I/O error or deletion of the root moves `Listening`
/// straight to `Finished`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(not(target_os = "windows"), allow(dead_code))]
pub(crate) enum WatchPointStatus {
	NotListening,
	Listening,
	Cancelled,
	Finished,
}
