//! Command queue between foreign threads and the watcher worker.
//!
//! Foreign threads never touch kernel state directly. Every mutation is
//! wrapped in a [`Command`], appended to a FIFO and executed by the worker
//! the next time it wakes up. The submitter blocks on a per-command one-shot
//! channel until the worker signals completion, so register/unregister/
//! terminate are synchronous from the caller's perspective.

use std::{
	collections::VecDeque,
	path::PathBuf,
	sync::{
		atomic::{AtomicBool, Ordering},
		Mutex,
	},
	time::Duration,
};

use crossbeam_channel::{bounded, RecvTimeoutError, Sender};

use crate::{
	error::{Result, WatcherError},
	platform::Waker,
};

/// A unit of work executed on the worker thread
#[derive(Debug)]
pub(crate) enum Command {
	Register(Vec<PathBuf>),
	Unregister(Vec<PathBuf>),
	Terminate,
}

/// What a successfully executed command hands back to its submitter
#[derive(Debug)]
pub(crate) enum CommandOutcome {
	Done,
	/// `false` iff at least one path in the batch was not registered
	Unregistered(bool),
}

struct QueuedCommand {
	command: Command,
	completion: Sender<Result<CommandOutcome>>,
}

/// FIFO of commands plus the closed flag set on termination.
///
/// This is the only mutable structure shared between foreign threads and the
/// worker; everything else is worker-owned.
pub(crate) struct CommandQueue {
	commands: Mutex<VecDeque<QueuedCommand>>,
	closed: AtomicBool,
}

impl CommandQueue {
	pub(crate) fn new() -> Self {
		Self {
			commands: Mutex::new(VecDeque::new()),
			closed: AtomicBool::new(false),
		}
	}

	/// Appends `command`, wakes the worker and blocks until the worker marks
	/// it executed or `timeout` elapses. A timeout does not cancel the
	/// command; it will still execute exactly once.
	pub(crate) fn submit(
		&self,
		command: Command,
		waker: &dyn Waker,
		timeout: Duration,
	) -> Result<CommandOutcome> {
		if self.closed.load(Ordering::Acquire) {
			return Err(WatcherError::ShuttingDown);
		}

		let (completion, executed) = bounded(1);
		self.commands
			.lock()
			.unwrap()
			.push_back(QueuedCommand { command, completion });
		waker.wake()?;

		match executed.recv_timeout(timeout) {
			Ok(result) => result,
			Err(RecvTimeoutError::Timeout) => Err(WatcherError::Timeout(timeout)),
			// The worker dropped the completion without executing, which only
			// happens when the queue is torn down
			Err(RecvTimeoutError::Disconnected) => Err(WatcherError::ShuttingDown),
		}
	}

	/// Pops and executes queued commands in FIFO order, signalling each
	/// submitter with the captured result. Runs on the worker thread.
	pub(crate) fn drain(&self, mut execute: impl FnMut(Command) -> Result<CommandOutcome>) {
		loop {
			// The lock is not held while executing, so submitters are never
			// blocked behind a running command
			let Some(queued) = self.commands.lock().unwrap().pop_front() else {
				break;
			};
			let result = execute(queued.command);
			// The submitter may have timed out and gone away
			let _ = queued.completion.send(result);
		}
	}

	/// Rejects future submissions and fails everything still queued.
	/// Called by the worker on its way out.
	pub(crate) fn close(&self) {
		self.closed.store(true, Ordering::Release);
		let leftover: Vec<_> = self.commands.lock().unwrap().drain(..).collect();
		for queued in leftover {
			let _ = queued.completion.send(Err(WatcherError::ShuttingDown));
		}
	}
}
