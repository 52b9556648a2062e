//! Linux engine: one shared inotify instance multiplexed with an eventfd
//! wake-up channel through `poll`.
//!
//! The engine owns the inotify fd; watch points hold only their watch
//! descriptor, so the fd is closed exactly once when the engine is dropped.

use std::{
	collections::HashMap,
	ffi::OsString,
	os::fd::{AsFd, AsRawFd},
	path::{Path, PathBuf},
	sync::Arc,
};

use inotify::{EventMask, Inotify, WatchDescriptor, WatchMask};
use nix::{
	errno::Errno,
	poll::{poll, PollFd, PollFlags, PollTimeout},
	sys::eventfd::{EfdFlags, EventFd},
};
use tracing::{debug, trace, warn};

use crate::{
	command::{Command, CommandOutcome, CommandQueue},
	config::WatcherOptions,
	error::{Result, WatcherError},
	event::{ChangeKind, EventHandler},
	platform::{StartupSender, Waker, WatchPointStatus},
};

fn watch_mask() -> WatchMask {
	WatchMask::CREATE
		| WatchMask::DELETE
		| WatchMask::MODIFY
		| WatchMask::ATTRIB
		| WatchMask::CLOSE_WRITE
		| WatchMask::MOVED_FROM
		| WatchMask::MOVED_TO
		| WatchMask::DELETE_SELF
		| WatchMask::MOVE_SELF
}

/// Large enough for a burst of events with `NAME_MAX` length names
const EVENT_BUFFER_SIZE: usize = 16 * 1024;

struct WatchPoint {
	wd: WatchDescriptor,
	status: WatchPointStatus,
}

struct EventFdWaker(Arc<EventFd>);

impl Waker for EventFdWaker {
	fn wake(&self) -> Result<()> {
		self.0.arm().map_err(|errno| {
			WatcherError::os("Couldn't signal watcher wake-up eventfd", None, errno as i32)
		})?;
		Ok(())
	}
}

/// Raw event data copied out of the read buffer so the buffer can be reused
struct RawEvent {
	wd: WatchDescriptor,
	mask: EventMask,
	name: Option<OsString>,
}

struct Engine<H> {
	queue: Arc<CommandQueue>,
	handler: H,
	inotify: Inotify,
	wakeup: Arc<EventFd>,
	watch_points: HashMap<PathBuf, WatchPoint>,
	/// Inverse mapping used to resolve event paths; kept consistent with
	/// `watch_points` at every quiescent point
	watch_roots: HashMap<WatchDescriptor, PathBuf>,
	buffer: Vec<u8>,
	terminated: bool,
}

pub(crate) fn run<H: EventHandler>(
	queue: Arc<CommandQueue>,
	handler: H,
	_options: WatcherOptions,
	started: StartupSender,
) {
	let inotify = match Inotify::init() {
		Ok(inotify) => inotify,
		Err(e) => {
			let _ = started.send(Err(WatcherError::os_io(
				"Couldn't initialize inotify",
				None,
				&e,
			)));
			return;
		}
	};
	let wakeup = match EventFd::from_value_and_flags(0, EfdFlags::EFD_CLOEXEC | EfdFlags::EFD_NONBLOCK)
	{
		Ok(wakeup) => Arc::new(wakeup),
		Err(errno) => {
			let _ = started.send(Err(WatcherError::os(
				"Couldn't create wake-up eventfd",
				None,
				errno as i32,
			)));
			return;
		}
	};

	let mut engine = Engine {
		queue: Arc::clone(&queue),
		handler,
		inotify,
		wakeup: Arc::clone(&wakeup),
		watch_points: HashMap::new(),
		watch_roots: HashMap::new(),
		buffer: vec![0u8; EVENT_BUFFER_SIZE],
		terminated: false,
	};

	let _ = started.send(Ok(Arc::new(EventFdWaker(wakeup))));

	engine.run_loop();

	// Dropping the engine closes the inotify fd, tearing down every watch
	// descriptor in one go
	queue.close();
	debug!("Watcher worker finished");
}

impl<H: EventHandler> Engine<H> {
	fn run_loop(&mut self) {
		while !self.terminated {
			let (events_ready, commands_ready) = {
				let mut fds = [
					PollFd::new(self.inotify.as_fd(), PollFlags::POLLIN),
					PollFd::new(self.wakeup.as_fd(), PollFlags::POLLIN),
				];
				match poll(&mut fds, PollTimeout::NONE) {
					Ok(_) => (
						fds[0]
							.revents()
							.is_some_and(|r| r.intersects(PollFlags::POLLIN)),
						fds[1]
							.revents()
							.is_some_and(|r| r.intersects(PollFlags::POLLIN)),
					),
					Err(Errno::EINTR) => continue,
					Err(errno) => {
						self.handler.handle_error(WatcherError::os(
							"Couldn't poll for filesystem events",
							None,
							errno as i32,
						));
						break;
					}
				}
			};

			// Events first, then commands: a command submitted after an event
			// was observed is guaranteed to run after that event's callback
			if events_ready {
				self.handle_events();
			}
			if commands_ready {
				self.consume_wakeup();
				self.handle_commands();
			}
		}
	}

	fn handle_commands(&mut self) {
		let queue = Arc::clone(&self.queue);
		queue.drain(|command| self.execute(command));
	}

	fn execute(&mut self, command: Command) -> Result<CommandOutcome> {
		if self.terminated && !matches!(command, Command::Terminate) {
			return Err(WatcherError::ShuttingDown);
		}
		match command {
			Command::Register(paths) => {
				for path in paths {
					self.register_path(&path)?;
				}
				Ok(CommandOutcome::Done)
			}
			Command::Unregister(paths) => {
				let mut all_known = true;
				for path in paths {
					all_known &= self.unregister_path(&path);
				}
				Ok(CommandOutcome::Unregistered(all_known))
			}
			Command::Terminate => {
				debug!("Terminating watcher worker");
				self.terminated = true;
				Ok(CommandOutcome::Done)
			}
		}
	}

	fn register_path(&mut self, path: &Path) -> Result<()> {
		if let Some(existing) = self.watch_points.get(path) {
			if existing.status != WatchPointStatus::Finished {
				return Err(WatcherError::AlreadyWatched(path.to_owned()));
			}
			// The previous watch point died with its root; make room for the
			// new subscription
			self.watch_points.remove(path);
		}

		let wd = self
			.inotify
			.watches()
			.add(path, watch_mask())
			.map_err(|e| match e.raw_os_error() {
				Some(nix::libc::ENOENT | nix::libc::ENOTDIR) => WatcherError::InvalidPath {
					path: path.to_owned(),
					source: e,
				},
				_ => WatcherError::os_io("Couldn't add inotify watch", Some(path.to_owned()), &e),
			})?;

		debug!("Now watching {}", path.display());
		self.watch_roots.insert(wd.clone(), path.to_owned());
		self.watch_points.insert(
			path.to_owned(),
			WatchPoint {
				wd,
				status: WatchPointStatus::Listening,
			},
		);
		Ok(())
	}

	fn unregister_path(&mut self, path: &Path) -> bool {
		let Some(point) = self.watch_points.remove(path) else {
			debug!("Path is not watched: {}", path.display());
			return false;
		};
		self.watch_roots.remove(&point.wd);
		if point.status == WatchPointStatus::Listening {
			if let Err(e) = self.inotify.watches().remove(point.wd) {
				// The kernel drops watches on its own when the root goes
				// away; the trailing IN_IGNORED is handled as a stale wd
				debug!("Couldn't remove watch for {}: {e}", path.display());
			}
		}
		debug!("Stopped watching {}", path.display());
		true
	}

	fn consume_wakeup(&mut self) {
		let mut counter = [0u8; 8];
		if let Err(errno) = nix::unistd::read(self.wakeup.as_fd().as_raw_fd(), &mut counter) {
			if errno != Errno::EAGAIN {
				warn!("Couldn't consume wake-up eventfd: {errno}");
			}
		}
	}

	fn handle_events(&mut self) {
		let raw_events: Vec<RawEvent> = match self.inotify.read_events(&mut self.buffer) {
			Ok(events) => events
				.map(|event| RawEvent {
					wd: event.wd,
					mask: event.mask,
					name: event.name.map(OsString::from),
				})
				.collect(),
			Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return,
			Err(e) => {
				// The fd is gone or unreadable; the engine can't continue
				self.handler.handle_error(WatcherError::os_io(
					"Couldn't read inotify events",
					None,
					&e,
				));
				self.terminated = true;
				return;
			}
		};

		for event in raw_events {
			self.handle_event(event);
		}
	}

	fn handle_event(&mut self, event: RawEvent) {
		if event.mask.contains(EventMask::Q_OVERFLOW) {
			warn!("inotify event queue overflowed, all watched roots must be rescanned");
			let roots: Vec<PathBuf> = self
				.watch_points
				.iter()
				.filter(|(_, point)| point.status == WatchPointStatus::Listening)
				.map(|(root, _)| root.clone())
				.collect();
			for root in roots {
				self.handler.handle_overflow(root);
			}
			return;
		}

		let Some(root) = self.watch_roots.get(&event.wd).cloned() else {
			if event.mask.contains(EventMask::IGNORED) {
				// Trailing acknowledgement for a watch we already removed
				trace!("Dropping event for stale watch descriptor");
			} else {
				self.handler.handle_error(WatcherError::Internal(format!(
					"Received event {:?} for unknown watch descriptor",
					event.mask
				)));
			}
			return;
		};

		if event.mask.intersects(
			EventMask::DELETE_SELF
				| EventMask::MOVE_SELF
				| EventMask::UNMOUNT
				| EventMask::IGNORED,
		) {
			debug!("Watch root invalidated: {}", root.display());
			self.finish_watch_point(&root);
			self.handler.handle_change(ChangeKind::Invalidated, root);
			return;
		}

		let path = match &event.name {
			Some(name) if !name.is_empty() => root.join(name),
			_ => root,
		};
		let kind = change_kind_for_mask(event.mask);
		trace!("Event {:?} for {}", event.mask, path.display());
		self.handler.handle_change(kind, path);
	}

	/// The kernel already tore this subscription down; keep the watch point
	/// so a later unregister still reports the path as having been
	/// registered, but drop the wd mapping so trailing events are ignored
	fn finish_watch_point(&mut self, root: &Path) {
		if let Some(point) = self.watch_points.get_mut(root) {
			point.status = WatchPointStatus::Finished;
			self.watch_roots.remove(&point.wd);
		}
	}
}

fn change_kind_for_mask(mask: EventMask) -> ChangeKind {
	if mask.intersects(EventMask::CREATE | EventMask::MOVED_TO) {
		ChangeKind::Created
	} else if mask.intersects(EventMask::DELETE | EventMask::MOVED_FROM) {
		ChangeKind::Removed
	} else if mask.intersects(EventMask::MODIFY | EventMask::ATTRIB | EventMask::CLOSE_WRITE) {
		ChangeKind::Modified
	} else {
		ChangeKind::Unknown
	}
}
