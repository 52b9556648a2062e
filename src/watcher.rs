//! The watcher front object exposed to callers

use std::{
	fmt,
	path::PathBuf,
	sync::Arc,
	thread::{self, JoinHandle, ThreadId},
	time::Duration,
};

use crossbeam_channel::bounded;
use tracing::{debug, error};

use crate::{
	command::{Command, CommandOutcome, CommandQueue},
	config::WatcherOptions,
	error::{Result, WatcherError},
	event::EventHandler,
	platform::{self, Waker},
};

/// A long-lived filesystem watcher.
///
/// Owns one background worker thread which in turn owns all kernel handles.
/// Registration, unregistration and termination are serialized onto that
/// thread through a command queue and are synchronous: they return once the
/// worker has reconfigured the kernel-side subscriptions (or after the
/// configured command timeout).
pub struct Watcher {
	queue: Arc<CommandQueue>,
	waker: Arc<dyn Waker>,
	worker: Option<JoinHandle<()>>,
	worker_thread: ThreadId,
	command_timeout: Duration,
}

impl Watcher {
	/// Spawns the worker thread and blocks until the platform engine is
	/// ready to accept commands. No notification is ever delivered before
	/// this returns.
	pub fn start<H: EventHandler>(handler: H, options: WatcherOptions) -> Result<Self> {
		let command_timeout = options.command_timeout;
		let queue = Arc::new(CommandQueue::new());
		let (started_tx, started_rx) = bounded(1);

		let worker = thread::Builder::new()
			.name("fs-notifier-worker".to_owned())
			.spawn({
				let queue = Arc::clone(&queue);
				move || platform::run(queue, handler, options, started_tx)
			})
			.map_err(|e| WatcherError::os_io("Couldn't spawn watcher worker thread", None, &e))?;

		let waker = match started_rx.recv() {
			Ok(Ok(waker)) => waker,
			Ok(Err(e)) => {
				let _ = worker.join();
				return Err(e);
			}
			Err(_) => {
				let _ = worker.join();
				return Err(WatcherError::Internal(
					"Worker exited before reporting startup".to_owned(),
				));
			}
		};

		debug!("Started watcher worker");

		let worker_thread = worker.thread().id();
		Ok(Self {
			queue,
			waker,
			worker: Some(worker),
			worker_thread,
			command_timeout,
		})
	}

	/// Starts watching the given absolute paths.
	///
	/// Fails with [`WatcherError::AlreadyWatched`] if one of the paths
	/// already has a live watch point; paths earlier in the batch that were
	/// registered successfully remain watched.
	pub fn register_paths(&self, paths: Vec<PathBuf>) -> Result<()> {
		self.submit(Command::Register(paths)).map(|_| ())
	}

	/// Stops watching the given paths.
	///
	/// Returns `false` iff at least one of the paths was not registered;
	/// the remaining paths are still unregistered.
	pub fn unregister_paths(&self, paths: Vec<PathBuf>) -> Result<bool> {
		match self.submit(Command::Unregister(paths))? {
			CommandOutcome::Unregistered(all_known) => Ok(all_known),
			CommandOutcome::Done => Ok(true),
		}
	}

	/// Tears down all watch points and stops the worker thread. Idempotent.
	///
	/// Once this returns no further notification is delivered.
	pub fn terminate(&mut self) -> Result<()> {
		if self.worker.is_none() {
			return Ok(());
		}

		match self.submit(Command::Terminate) {
			// The worker may already be gone if terminate raced with it
			Ok(_) | Err(WatcherError::ShuttingDown) => {}
			Err(e) => return Err(e),
		}

		if let Some(worker) = self.worker.take() {
			if worker.join().is_err() {
				return Err(WatcherError::Internal(
					"Watcher worker panicked during shutdown".to_owned(),
				));
			}
		}
		debug!("Watcher terminated");
		Ok(())
	}

	fn submit(&self, command: Command) -> Result<CommandOutcome> {
		// Calling in from the worker (i.e. from inside the event handler)
		// would have the worker wait on itself
		if thread::current().id() == self.worker_thread {
			return Err(WatcherError::ReentrantCall);
		}
		self.queue
			.submit(command, &*self.waker, self.command_timeout)
	}
}

impl fmt::Debug for Watcher {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Watcher")
			.field("terminated", &self.worker.is_none())
			.finish()
	}
}

impl Drop for Watcher {
	fn drop(&mut self) {
		if self.worker.is_some() {
			if let Err(e) = self.terminate() {
				error!("Couldn't terminate watcher on drop: {e}");
			}
		}
	}
}
