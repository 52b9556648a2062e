//! macOS engine: an FSEvents stream scheduled on a `CFRunLoop` owned by the
//! worker thread.
//!
//! FSEvents streams can't change their path set while live, so every
//! register/unregister tears the stream down and recreates it from the last
//! seen event id; no events are lost across the restart. Commands reach the
//! worker through a `CFRunLoopSource` installed on the same run loop.

use std::{
	collections::HashMap,
	ffi::{c_void, CStr},
	fmt, fs, io,
	ops::Deref,
	os::raw::c_char,
	panic::catch_unwind,
	path::{Path, PathBuf},
	ptr, slice,
	sync::Arc,
	time::Duration,
};

use bitflags::bitflags;
use core_foundation::{
	array::CFArray,
	base::TCFType,
	runloop::{
		kCFRunLoopDefaultMode, CFRunLoop, CFRunLoopSource, CFRunLoopSourceContext,
		CFRunLoopSourceCreate, CFRunLoopSourceSignal, CFRunLoopWakeUp,
	},
	string::CFString,
};
use fsevent_sys as fs_sys;
use tracing::{debug, trace, warn};

use crate::{
	command::{Command, CommandOutcome, CommandQueue},
	config::WatcherOptions,
	error::{Result, WatcherError},
	event::{ChangeKind, EventHandler},
	platform::{StartupSender, Waker},
};

bitflags! {
	#[derive(Debug, Clone, Copy, PartialEq, Eq)]
	struct StreamFlags: u32 {
		const MUST_SCAN_SUBDIRS = fs_sys::kFSEventStreamEventFlagMustScanSubDirs;
		const USER_DROPPED = fs_sys::kFSEventStreamEventFlagUserDropped;
		const KERNEL_DROPPED = fs_sys::kFSEventStreamEventFlagKernelDropped;
		const IDS_WRAPPED = fs_sys::kFSEventStreamEventFlagEventIdsWrapped;
		const HISTORY_DONE = fs_sys::kFSEventStreamEventFlagHistoryDone;
		const ROOT_CHANGED = fs_sys::kFSEventStreamEventFlagRootChanged;
		const MOUNT = fs_sys::kFSEventStreamEventFlagMount;
		const UNMOUNT = fs_sys::kFSEventStreamEventFlagUnmount;
		const ITEM_CREATED = fs_sys::kFSEventStreamEventFlagItemCreated;
		const ITEM_REMOVED = fs_sys::kFSEventStreamEventFlagItemRemoved;
		const INODE_META_MOD = fs_sys::kFSEventStreamEventFlagItemInodeMetaMod;
		const ITEM_RENAMED = fs_sys::kFSEventStreamEventFlagItemRenamed;
		const ITEM_MODIFIED = fs_sys::kFSEventStreamEventFlagItemModified;
		const FINDER_INFO_MOD = fs_sys::kFSEventStreamEventFlagItemFinderInfoMod;
		const ITEM_CHANGE_OWNER = fs_sys::kFSEventStreamEventFlagItemChangeOwner;
		const ITEM_XATTR_MOD = fs_sys::kFSEventStreamEventFlagItemXattrMod;
		const IS_FILE = fs_sys::kFSEventStreamEventFlagItemIsFile;
		const IS_DIR = fs_sys::kFSEventStreamEventFlagItemIsDir;
		const IS_SYMLINK = fs_sys::kFSEventStreamEventFlagItemIsSymlink;
		const OWN_EVENT = fs_sys::kFSEventStreamEventFlagOwnEvent;
		const IS_HARDLINK = fs_sys::kFSEventStreamEventFlagItemIsHardlink;
		const IS_LAST_HARDLINK = fs_sys::kFSEventStreamEventFlagItemIsLastHardlink;
		const ITEM_CLONED = fs_sys::kFSEventStreamEventFlagItemCloned;

		/// Flags that never produce an event on their own. An event whose
		/// flags are entirely within this set is dropped; anything outside
		/// it that we don't classify is reported as unknown.
		const IGNORED = Self::USER_DROPPED.bits()
			| Self::KERNEL_DROPPED.bits()
			| Self::IDS_WRAPPED.bits()
			| Self::HISTORY_DONE.bits()
			| Self::IS_FILE.bits()
			| Self::IS_DIR.bits()
			| Self::IS_SYMLINK.bits()
			| Self::OWN_EVENT.bits()
			| Self::IS_HARDLINK.bits()
			| Self::IS_LAST_HARDLINK.bits()
			| Self::ITEM_CLONED.bits();
	}
}

/// FSEvents replays events older than the stream's `since` id when a stream
/// is recreated. Freshly added roots must not see that history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WatchPointAge {
	/// Added while historical events may still be replayed; events for it
	/// are dropped until the history-done sentinel arrives
	New,
	/// Past the historical replay, events are delivered normally
	Historical,
}

// CFRef types are safe to move between threads per Apple's thread safety
// documentation; the wrapper only exists because the raw pointers aren't
// Send/Sync in Rust's eyes.
// https://developer.apple.com/library/archive/documentation/Cocoa/Conceptual/Multithreading/ThreadSafetySummary/ThreadSafetySummary.html
struct SendWrapper<T>(T);

unsafe impl<T> Send for SendWrapper<T> {}
unsafe impl<T> Sync for SendWrapper<T> {}

impl<T> Deref for SendWrapper<T> {
	type Target = T;

	fn deref(&self) -> &Self::Target {
		&self.0
	}
}

impl<T> fmt::Debug for SendWrapper<T> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("SendWrapper").finish()
	}
}

/// Signals the command source and kicks the run loop out of its wait
struct RunLoopWaker {
	source: SendWrapper<CFRunLoopSource>,
	run_loop: SendWrapper<CFRunLoop>,
}

impl Waker for RunLoopWaker {
	fn wake(&self) -> Result<()> {
		unsafe {
			CFRunLoopSourceSignal(self.source.as_concrete_TypeRef());
			CFRunLoopWakeUp(self.run_loop.as_concrete_TypeRef());
		}
		Ok(())
	}
}

struct Engine<H> {
	queue: Arc<CommandQueue>,
	handler: H,
	run_loop: CFRunLoop,
	latency: Duration,
	watch_points: HashMap<PathBuf, WatchPointAge>,
	stream: Option<fs_sys::FSEventStreamRef>,
	last_seen_event_id: fs_sys::FSEventStreamEventId,
	finished_processing_historical_events: bool,
	terminated: bool,
}

pub(crate) fn run<H: EventHandler>(
	queue: Arc<CommandQueue>,
	handler: H,
	options: WatcherOptions,
	started: StartupSender,
) {
	let run_loop = CFRunLoop::get_current();

	let mut engine = Box::new(Engine {
		queue: Arc::clone(&queue),
		handler,
		run_loop: run_loop.clone(),
		latency: options.latency,
		watch_points: HashMap::new(),
		stream: None,
		last_seen_event_id: fs_sys::kFSEventStreamEventIdSinceNow,
		finished_processing_historical_events: true,
		terminated: false,
	});
	let engine_ptr: *mut Engine<H> = &mut *engine;

	let mut context = CFRunLoopSourceContext {
		version: 0,
		info: engine_ptr.cast(),
		retain: None,
		release: None,
		copyDescription: None,
		equal: None,
		hash: None,
		schedule: None,
		cancel: None,
		perform: drain_commands_callback::<H>,
	};
	let source_ref = unsafe { CFRunLoopSourceCreate(ptr::null(), 0, &mut context) };
	if source_ref.is_null() {
		let _ = started.send(Err(WatcherError::Internal(
			"Couldn't create run loop command source".to_owned(),
		)));
		return;
	}
	let source = unsafe { CFRunLoopSource::wrap_under_create_rule(source_ref) };
	run_loop.add_source(&source, unsafe { kCFRunLoopDefaultMode });

	let _ = started.send(Ok(Arc::new(RunLoopWaker {
		source: SendWrapper(source.clone()),
		run_loop: SendWrapper(run_loop.clone()),
	})));

	// Blocks until terminate stops the loop; commands and stream callbacks
	// run inside
	CFRunLoop::run_current();

	engine.close_event_stream();
	queue.close();
	debug!("Watcher worker finished");
}

extern "C" fn drain_commands_callback<H: EventHandler>(info: *const c_void) {
	let engine = unsafe { &mut *info.cast_mut().cast::<Engine<H>>() };
	engine.handle_commands();
}

extern "C" fn handle_events_callback<H: EventHandler>(
	_stream: fs_sys::FSEventStreamRef,
	info: *mut c_void,
	num_events: usize,
	event_paths: *mut c_void,
	event_flags: *const fs_sys::FSEventStreamEventFlags,
	event_ids: *const fs_sys::FSEventStreamEventId,
) {
	// A panic must not unwind across the FFI boundary into CFRunLoopRun
	drop(catch_unwind(move || {
		let engine = unsafe { &mut *info.cast::<Engine<H>>() };
		let paths =
			unsafe { slice::from_raw_parts(event_paths.cast::<*const c_char>(), num_events) };
		let flags = unsafe { slice::from_raw_parts(event_flags, num_events) };
		let ids = unsafe { slice::from_raw_parts(event_ids, num_events) };
		engine.handle_events(paths, flags, ids);
	}));
}

impl<H: EventHandler> Engine<H> {
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
				self.close_event_stream();
				let mut failure = None;
				for path in paths {
					if let Err(e) = self.register_path(&path) {
						failure = Some(e);
						break;
					}
				}
				// Paths registered before the failure stay watched, so the
				// stream is reopened either way
				self.open_event_stream()?;
				match failure {
					Some(e) => Err(e),
					None => Ok(CommandOutcome::Done),
				}
			}
			Command::Unregister(paths) => {
				self.close_event_stream();
				let mut all_known = true;
				for path in paths {
					debug!("Unregistering watch point {}", path.display());
					if self.watch_points.remove(&path).is_none() {
						debug!("Path is not watched: {}", path.display());
						all_known = false;
					}
				}
				self.open_event_stream()?;
				Ok(CommandOutcome::Unregistered(all_known))
			}
			Command::Terminate => {
				debug!("Terminating watcher worker");
				self.terminated = true;
				self.run_loop.stop();
				Ok(CommandOutcome::Done)
			}
		}
	}

	fn register_path(&mut self, path: &Path) -> Result<()> {
		if self.watch_points.contains_key(path) {
			return Err(WatcherError::AlreadyWatched(path.to_owned()));
		}
		let metadata = fs::metadata(path).map_err(|source| WatcherError::InvalidPath {
			path: path.to_owned(),
			source,
		})?;
		if !metadata.is_dir() {
			return Err(WatcherError::InvalidPath {
				path: path.to_owned(),
				source: io::Error::new(io::ErrorKind::InvalidInput, "not a directory"),
			});
		}

		// A stream starting from "now" replays no history, so the new point
		// can receive events immediately
		let age = if self.last_seen_event_id == fs_sys::kFSEventStreamEventIdSinceNow {
			WatchPointAge::Historical
		} else {
			WatchPointAge::New
		};
		debug!("Registering watch point {} as {age:?}", path.display());
		self.watch_points.insert(path.to_owned(), age);
		Ok(())
	}

	fn open_event_stream(&mut self) -> Result<()> {
		if self.watch_points.is_empty() {
			debug!("Not starting event stream as there is nothing to watch");
			return Ok(());
		}

		let paths: Vec<CFString> = self
			.watch_points
			.keys()
			.map(|path| CFString::new(&path.to_string_lossy()))
			.collect();
		let paths_array = CFArray::from_CFTypes(&paths);

		// No history-done sentinel arrives when starting from "now"
		self.finished_processing_historical_events =
			self.last_seen_event_id == fs_sys::kFSEventStreamEventIdSinceNow;

		let context = fs_sys::FSEventStreamContext {
			version: 0,
			info: (self as *mut Self).cast(),
			retain: None,
			release: None,
			copy_description: None,
		};

		debug!("Starting event stream from id {}", self.last_seen_event_id);
		let stream = unsafe {
			fs_sys::FSEventStreamCreate(
				fs_sys::core_foundation::kCFAllocatorDefault,
				handle_events_callback::<H>,
				&context,
				paths_array.as_concrete_TypeRef() as _,
				self.last_seen_event_id,
				self.latency.as_secs_f64(),
				fs_sys::kFSEventStreamCreateFlagNoDefer
					| fs_sys::kFSEventStreamCreateFlagFileEvents
					| fs_sys::kFSEventStreamCreateFlagWatchRoot,
			)
		};
		if stream.is_null() {
			return Err(WatcherError::Internal(
				"Couldn't create event stream".to_owned(),
			));
		}

		unsafe {
			fs_sys::FSEventStreamScheduleWithRunLoop(
				stream,
				self.run_loop.as_concrete_TypeRef() as _,
				fs_sys::core_foundation::kCFRunLoopDefaultMode,
			);
			fs_sys::FSEventStreamStart(stream);
		}
		self.stream = Some(stream);
		Ok(())
	}

	fn close_event_stream(&mut self) {
		let Some(stream) = self.stream.take() else {
			trace!("Event stream not open, not closing");
			return;
		};
		unsafe {
			fs_sys::FSEventStreamFlushSync(stream);
			fs_sys::FSEventStreamStop(stream);
			fs_sys::FSEventStreamInvalidate(stream);
			fs_sys::FSEventStreamRelease(stream);
		}
		debug!(
			"Closed event stream with last seen id {}",
			self.last_seen_event_id
		);
	}

	fn handle_events(
		&mut self,
		paths: &[*const c_char],
		flags: &[fs_sys::FSEventStreamEventFlags],
		ids: &[fs_sys::FSEventStreamEventId],
	) {
		for i in 0..paths.len() {
			let flags = StreamFlags::from_bits_truncate(flags[i]);
			let event_id = ids[i];
			self.last_seen_event_id = event_id;

			if flags.contains(StreamFlags::HISTORY_DONE) {
				// Everything after this point is live; new watch points may
				// now receive events
				for age in self.watch_points.values_mut() {
					if *age == WatchPointAge::New {
						*age = WatchPointAge::Historical;
					}
				}
				self.finished_processing_historical_events = true;
				debug!("Finished processing historical events (id {event_id})");
				continue;
			}

			let path =
				PathBuf::from(unsafe { CStr::from_ptr(paths[i]) }.to_string_lossy().into_owned());
			trace!("Event {flags:?} (id {event_id}) for {}", path.display());

			if event_id == 0 && flags.contains(StreamFlags::ROOT_CHANGED) {
				self.handler.handle_change(ChangeKind::Invalidated, path);
				continue;
			}

			if !self.finished_processing_historical_events {
				match self.watch_point_age(&path) {
					Some(WatchPointAge::New) => {
						trace!("Ignoring historical event (id {event_id})");
						continue;
					}
					Some(WatchPointAge::Historical) => {}
					None => {
						self.handler.handle_error(WatcherError::Internal(format!(
							"Couldn't find watch point for {}",
							path.display()
						)));
						continue;
					}
				}
			}

			if flags.difference(StreamFlags::IGNORED).is_empty() {
				trace!("Ignoring event (id {event_id})");
				continue;
			}

			self.handle_event(path, flags);
		}
	}

	fn handle_event(&mut self, path: PathBuf, flags: StreamFlags) {
		if flags.contains(StreamFlags::MUST_SCAN_SUBDIRS) {
			self.handler.handle_overflow(path);
			return;
		}
		match change_kind_for_flags(flags) {
			Some(kind) => self.handler.handle_change(kind, path),
			None => {
				warn!("Unknown event {flags:?} for {}", path.display());
				self.handler.handle_change(ChangeKind::Unknown, path);
			}
		}
	}

	/// Finds the age of the watch point covering `path`: the path equals the
	/// root or starts with the root followed by a separator
	fn watch_point_age(&self, path: &Path) -> Option<WatchPointAge> {
		self.watch_points
			.iter()
			.find_map(|(root, age)| path.starts_with(root).then_some(*age))
	}
}

fn change_kind_for_flags(flags: StreamFlags) -> Option<ChangeKind> {
	if flags.intersects(StreamFlags::MOUNT | StreamFlags::UNMOUNT) {
		Some(ChangeKind::Invalidated)
	} else if flags.contains(StreamFlags::ITEM_RENAMED) {
		// A rename pairs two events; the leg that also carries the created
		// flag is the source disappearing, the bare leg is the destination
		if flags.contains(StreamFlags::ITEM_CREATED) {
			Some(ChangeKind::Removed)
		} else {
			Some(ChangeKind::Created)
		}
	} else if flags.contains(StreamFlags::ITEM_MODIFIED) {
		Some(ChangeKind::Modified)
	} else if flags.contains(StreamFlags::ITEM_REMOVED) {
		Some(ChangeKind::Removed)
	} else if flags.intersects(
		StreamFlags::INODE_META_MOD
			| StreamFlags::FINDER_INFO_MOD
			| StreamFlags::ITEM_CHANGE_OWNER
			| StreamFlags::ITEM_XATTR_MOD,
	) {
		Some(ChangeKind::Modified)
	} else if flags.contains(StreamFlags::ITEM_CREATED) {
		Some(ChangeKind::Created)
	} else {
		None
	}
}

#[cfg(test)]
mod tests {
	use super::{change_kind_for_flags, StreamFlags};
	use crate::event::ChangeKind;

	#[test]
	fn rename_legs_are_distinguished_by_the_created_flag() {
		assert_eq!(
			change_kind_for_flags(StreamFlags::ITEM_RENAMED | StreamFlags::ITEM_CREATED),
			Some(ChangeKind::Removed)
		);
		assert_eq!(
			change_kind_for_flags(StreamFlags::ITEM_RENAMED),
			Some(ChangeKind::Created)
		);
	}

	#[test]
	fn flags_translate_to_canonical_kinds() {
		assert_eq!(
			change_kind_for_flags(StreamFlags::ITEM_MODIFIED),
			Some(ChangeKind::Modified)
		);
		assert_eq!(
			change_kind_for_flags(StreamFlags::ITEM_REMOVED),
			Some(ChangeKind::Removed)
		);
		assert_eq!(
			change_kind_for_flags(StreamFlags::ITEM_CREATED),
			Some(ChangeKind::Created)
		);
		assert_eq!(
			change_kind_for_flags(StreamFlags::MOUNT),
			Some(ChangeKind::Invalidated)
		);
		assert_eq!(
			change_kind_for_flags(StreamFlags::UNMOUNT),
			Some(ChangeKind::Invalidated)
		);
		for metadata_flag in [
			StreamFlags::INODE_META_MOD,
			StreamFlags::FINDER_INFO_MOD,
			StreamFlags::ITEM_CHANGE_OWNER,
			StreamFlags::ITEM_XATTR_MOD,
		] {
			assert_eq!(
				change_kind_for_flags(metadata_flag),
				Some(ChangeKind::Modified)
			);
		}
	}

	#[test]
	fn unclassified_flags_are_unknown() {
		assert_eq!(change_kind_for_flags(StreamFlags::ROOT_CHANGED), None);
	}

	#[test]
	fn pure_metadata_bits_fall_in_the_ignore_set() {
		let flags = StreamFlags::IS_FILE | StreamFlags::OWN_EVENT;
		assert!(flags.difference(StreamFlags::IGNORED).is_empty());

		let flags = StreamFlags::IS_FILE | StreamFlags::ITEM_CREATED;
		assert!(!flags.difference(StreamFlags::IGNORED).is_empty());
	}
}
